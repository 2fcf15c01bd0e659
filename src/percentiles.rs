//! Percentile latency computation over the sampled latency buffer.
//!
//! Percentiles use nearest-rank on a sorted copy: the value at index
//! `floor(p * n)`, clamped to the last element. Nothing is interpolated, so
//! every reported percentile is a latency that was actually observed.

use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::utils::format_duration;

/// Percentile statistics for a set of latency samples.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PercentileStats {
    /// Number of samples
    pub count: usize,

    #[serde(with = "duration_text")]
    pub min: Duration,

    #[serde(with = "duration_text")]
    pub max: Duration,

    #[serde(with = "duration_text")]
    pub mean: Duration,

    /// 50th percentile - median
    #[serde(with = "duration_text")]
    pub p50: Duration,

    #[serde(with = "duration_text")]
    pub p90: Duration,

    #[serde(with = "duration_text")]
    pub p95: Duration,

    #[serde(with = "duration_text")]
    pub p99: Duration,
}

impl PercentileStats {
    /// Computes statistics from unsorted samples. The input is left untouched.
    ///
    /// Returns `None` if there are no samples.
    pub fn from_samples(samples: &[Duration]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }

        let mut sorted = samples.to_vec();
        sorted.sort_unstable();
        Some(Self::from_sorted(&sorted))
    }

    /// Computes statistics from samples already in ascending order.
    ///
    /// `sorted` must be non-empty.
    fn from_sorted(sorted: &[Duration]) -> Self {
        let total: Duration = sorted.iter().sum();
        let mean = total / sorted.len() as u32;

        Self {
            count: sorted.len(),
            min: sorted[0],
            max: sorted[sorted.len() - 1],
            mean,
            p50: nearest_rank(sorted, 0.50),
            p90: nearest_rank(sorted, 0.90),
            p95: nearest_rank(sorted, 0.95),
            p99: nearest_rank(sorted, 0.99),
        }
    }

    /// Format statistics as a human-readable string.
    pub fn format(&self) -> String {
        format!(
            "count={}, min={}, max={}, mean={}, p50={}, p90={}, p95={}, p99={}",
            self.count,
            format_duration(self.min),
            format_duration(self.max),
            format_duration(self.mean),
            format_duration(self.p50),
            format_duration(self.p90),
            format_duration(self.p95),
            format_duration(self.p99),
        )
    }

    /// Format statistics as a compact table row (milliseconds).
    pub fn format_table_row(&self, label: &str) -> String {
        format!(
            "{:<30} {:>8} {:>8.2} {:>8.2} {:>8.2} {:>8.2} {:>8.2} {:>8.2}",
            label,
            self.count,
            as_ms(self.p50),
            as_ms(self.p90),
            as_ms(self.p95),
            as_ms(self.p99),
            as_ms(self.mean),
            as_ms(self.max),
        )
    }
}

fn as_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1_000.0
}

/// Value at index `floor(p * n)` of an ascending slice, clamped to the last element.
///
/// Returns `Duration::ZERO` for an empty slice.
pub fn nearest_rank(sorted: &[Duration], percentile: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let index = (sorted.len() as f64 * percentile.clamp(0.0, 1.0)).floor() as usize;
    sorted[index.min(sorted.len() - 1)]
}

/// Format percentile statistics as a table.
pub fn format_percentile_table(
    title: &str,
    stats_map: &BTreeMap<String, PercentileStats>,
) -> String {
    if stats_map.is_empty() {
        return format!("## {}\n\nNo data available.\n", title);
    }

    let mut output = String::new();
    output.push_str(&format!("\n## {}\n\n", title));
    output.push_str(&format!(
        "{:<30} {:>8} {:>8} {:>8} {:>8} {:>8} {:>8} {:>8}\n",
        "Category", "Samples", "P50", "P90", "P95", "P99", "Mean", "Max"
    ));
    output.push_str(&format!(
        "{:<30} {:>8} {:>8} {:>8} {:>8} {:>8} {:>8} {:>8}\n",
        "", "", "(ms)", "(ms)", "(ms)", "(ms)", "(ms)", "(ms)"
    ));
    output.push_str(&"-".repeat(100));
    output.push('\n');

    // BTreeMap iterates in label order
    for (label, stats) in stats_map {
        output.push_str(&stats.format_table_row(label));
        output.push('\n');
    }

    output
}

/// Serializes durations as the report strings produced by [`format_duration`].
pub(crate) mod duration_text {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&crate::utils::format_duration(*d))
    }
}

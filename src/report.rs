//! Snapshot and report values, and the sinks that receive them.
//!
//! Everything here is an owned, immutable value once built. The coordinator
//! hands periodic snapshots and the final report to every configured
//! [`ReportSink`]; what a sink does with them (log, persist) is its business.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use crate::percentiles::{duration_text, format_percentile_table, PercentileStats};

/// One retained failure, for diagnosis only.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureSample {
    pub timestamp: DateTime<Utc>,
    pub category: String,
    pub url: String,
    /// 0 when no response was obtained.
    pub status_code: u16,
    pub error_category: String,
    pub message: String,
}

/// Per-category request distribution.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryStats {
    pub requests: u64,
    pub failures: u64,
    /// Share of all recorded requests, in percent.
    pub share_percent: f64,
}

/// Point-in-time view of the outcome recorder.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    #[serde(with = "duration_text")]
    pub elapsed: Duration,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    /// Completed requests per second since the recorder started.
    pub achieved_rps: f64,
    /// Admission rate at the time of the snapshot, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_rps: Option<f64>,
    pub success_rate: f64,
    pub error_rate: f64,
    pub status_codes: BTreeMap<u16, u64>,
    pub error_categories: BTreeMap<String, u64>,
    pub category_distribution: BTreeMap<String, CategoryStats>,
    pub latency_samples: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency: Option<PercentileStats>,
    pub category_latency: BTreeMap<String, PercentileStats>,
    pub failure_samples: Vec<FailureSample>,
}

impl MetricsSnapshot {
    pub fn with_target_rps(mut self, target_rps: f64) -> Self {
        self.target_rps = Some(target_rps);
        self
    }

    /// Keeps only the `n` most recent failure samples.
    pub fn with_recent_failures(mut self, n: usize) -> Self {
        let len = self.failure_samples.len();
        if len > n {
            self.failure_samples.drain(..len - n);
        }
        self
    }

    /// Status counts folded into classes: `2xx`, `4xx`, ..., `network_error`.
    pub fn status_class_distribution(&self) -> BTreeMap<String, u64> {
        let mut classes = BTreeMap::new();
        for (code, count) in &self.status_codes {
            *classes.entry(crate::errors::status_class(*code)).or_insert(0) += count;
        }
        classes
    }
}

/// Which scheduler drove the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ScheduleMode {
    Staged,
    Adaptive,
}

/// Why the generation loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum EndReason {
    StagesComplete,
    DurationElapsed,
    StopRequested,
}

/// The report emitted once, after the run reached `Stopped`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalReport {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub mode: ScheduleMode,
    pub end_reason: EndReason,
    /// Descriptors accepted by the admission queue.
    pub admitted_requests: u64,
    /// Offers dropped because the queue was full.
    pub shed_requests: u64,
    /// Queued descriptors never executed because the drain timeout expired.
    pub discarded_requests: u64,
    pub final_target_rps: f64,
    pub status_class_distribution: BTreeMap<String, u64>,
    pub metrics: MetricsSnapshot,
}

impl FinalReport {
    /// Human-readable summary printed at the end of a run.
    pub fn summary(&self) -> String {
        let m = &self.metrics;
        let mut out = String::new();
        out.push_str("\n=== Load Test Results ===\n");
        out.push_str(&format!(
            "Start: {}  End: {}  Mode: {:?}  Ended: {:?}\n",
            self.start_time.to_rfc3339(),
            self.end_time.to_rfc3339(),
            self.mode,
            self.end_reason
        ));
        out.push_str(&format!(
            "Requests: {} total, {} ok, {} failed ({:.2}% success)\n",
            m.total_requests, m.successful_requests, m.failed_requests, m.success_rate
        ));
        out.push_str(&format!(
            "Admitted: {}  Shed: {}  Discarded: {}\n",
            self.admitted_requests, self.shed_requests, self.discarded_requests
        ));
        out.push_str(&format!(
            "Achieved RPS: {:.2}  Final target RPS: {:.2}\n",
            m.achieved_rps, self.final_target_rps
        ));
        for (class, count) in &self.status_class_distribution {
            out.push_str(&format!("  {:<14} {}\n", class, count));
        }
        if let Some(latency) = &m.latency {
            out.push_str(&format!("Latency: {}\n", latency.format()));
        }
        out.push_str(&format_percentile_table(
            "Latency by Category",
            &m.category_latency,
        ));
        out
    }
}

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("Failed to write report to {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize report: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Receives reports produced by the coordinator.
pub trait ReportSink: Send + Sync {
    fn periodic(&self, snapshot: &MetricsSnapshot);

    fn final_report(&self, report: &FinalReport) -> Result<(), ReportError>;
}

/// Logs periodic snapshots and prints the final report.
#[derive(Debug, Default)]
pub struct LogSink;

impl ReportSink for LogSink {
    fn periodic(&self, snapshot: &MetricsSnapshot) {
        let (p50, p95, p99) = snapshot
            .latency
            .as_ref()
            .map(|l| {
                (
                    l.p50.as_millis() as u64,
                    l.p95.as_millis() as u64,
                    l.p99.as_millis() as u64,
                )
            })
            .unwrap_or_default();

        let target_rps = snapshot
            .target_rps
            .map(|r| format!("{:.2}", r))
            .unwrap_or_else(|| "-".to_string());

        info!(
            elapsed_secs = snapshot.elapsed.as_secs(),
            total = snapshot.total_requests,
            success = snapshot.successful_requests,
            failed = snapshot.failed_requests,
            achieved_rps = %format_args!("{:.2}", snapshot.achieved_rps),
            target_rps = %target_rps,
            success_rate = %format_args!("{:.2}", snapshot.success_rate),
            p50_ms = p50,
            p95_ms = p95,
            p99_ms = p99,
            "Progress"
        );

        for sample in &snapshot.failure_samples {
            warn!(
                category = %sample.category,
                url = %sample.url,
                status_code = sample.status_code,
                error_category = %sample.error_category,
                message = %sample.message,
                "Recent failure"
            );
        }
    }

    fn final_report(&self, report: &FinalReport) -> Result<(), ReportError> {
        println!("{}", serde_json::to_string_pretty(report)?);
        println!("{}", report.summary());
        Ok(())
    }
}

/// Persists the final report as pretty-printed JSON.
#[derive(Debug, Clone)]
pub struct JsonFileSink {
    path: PathBuf,
}

impl JsonFileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ReportSink for JsonFileSink {
    fn periodic(&self, _snapshot: &MetricsSnapshot) {}

    fn final_report(&self, report: &FinalReport) -> Result<(), ReportError> {
        let io_err = |source| ReportError::Io {
            path: self.path.clone(),
            source,
        };

        let file = File::create(&self.path).map_err(io_err)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, report)?;
        writer.write_all(b"\n").map_err(io_err)?;
        writer.flush().map_err(io_err)?;

        info!(path = %self.path.display(), "Results written");
        Ok(())
    }
}

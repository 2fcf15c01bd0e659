//! Thread-safe accumulator for request outcomes.
//!
//! Workers call [`OutcomeRecorder::record`] concurrently. Lifetime and window
//! counters are plain atomics; everything that needs a map or a buffer
//! (status codes, categories, latency and failure samples) sits behind one
//! short-held mutex. Snapshots sort a copy of the latency buffer, so reading
//! never holds the lock for longer than a clone.

use chrono::Utc;
use rand::Rng;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::errors::ErrorCategory;
use crate::percentiles::PercentileStats;
use crate::report::{CategoryStats, FailureSample, MetricsSnapshot};
use crate::request::RequestDescriptor;

/// Result of one completed request.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub duration: Duration,
    /// Endpoint name the request was attributed to.
    pub category: Arc<str>,
    pub url: Arc<str>,
    /// 0 when the request failed before a response was obtained.
    pub status_code: u16,
    /// `None` on success.
    pub error_category: Option<ErrorCategory>,
    pub error_detail: Option<String>,
}

impl Outcome {
    /// An outcome for a request that produced an HTTP response.
    ///
    /// `application_error` carries the failure message of an embedded error
    /// found in the body; it turns an otherwise successful status into a failure.
    pub fn response(
        request: &RequestDescriptor,
        duration: Duration,
        status_code: u16,
        application_error: Option<String>,
    ) -> Self {
        let (error_category, error_detail) = match ErrorCategory::from_status_code(status_code) {
            Some(category) => (
                Some(category),
                Some(
                    application_error.unwrap_or_else(|| {
                        format!(
                            "HTTP {} {}",
                            status_code,
                            crate::errors::categorize_status_code(status_code)
                        )
                    }),
                ),
            ),
            None => match application_error {
                Some(message) => (Some(ErrorCategory::ApplicationError), Some(message)),
                None => (None, None),
            },
        };

        Self {
            duration,
            category: request.category.clone(),
            url: request.url.clone(),
            status_code,
            error_category,
            error_detail,
        }
    }

    /// An outcome for a request that never obtained a response.
    pub fn transport_failure(
        request: &RequestDescriptor,
        duration: Duration,
        error_category: ErrorCategory,
        detail: String,
    ) -> Self {
        Self {
            duration,
            category: request.category.clone(),
            url: request.url.clone(),
            status_code: 0,
            error_category: Some(error_category),
            error_detail: Some(detail),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error_category.is_none()
    }
}

/// Sampling knobs for the recorder.
#[derive(Debug, Clone, PartialEq)]
pub struct RecorderConfig {
    /// Probability that a latency is kept in the sample buffer.
    pub latency_sample_rate: f64,

    /// Maximum failure samples retained; the oldest are evicted first.
    pub failure_sample_cap: usize,

    /// Whether failure samples are kept at all.
    pub log_errors: bool,

    /// Probability that an eligible failure is kept as a sample.
    pub error_sample_rate: f64,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            latency_sample_rate: 0.1,
            failure_sample_cap: 100,
            log_errors: true,
            error_sample_rate: 1.0,
        }
    }
}

/// Success/failure counts for the current adaptive control window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowCounts {
    pub successes: u64,
    pub failures: u64,
}

impl WindowCounts {
    pub fn total(&self) -> u64 {
        self.successes + self.failures
    }

    /// Failure percentage over the window, 0 when nothing was recorded.
    pub fn error_rate_percent(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        self.failures as f64 / total as f64 * 100.0
    }
}

#[derive(Debug)]
struct LatencySample {
    category: Arc<str>,
    duration: Duration,
}

#[derive(Debug, Default)]
struct CategoryCounts {
    requests: u64,
    failures: u64,
}

#[derive(Debug, Default)]
struct Details {
    status_codes: BTreeMap<u16, u64>,
    error_categories: BTreeMap<&'static str, u64>,
    categories: BTreeMap<Arc<str>, CategoryCounts>,
    latency_samples: Vec<LatencySample>,
    failure_samples: VecDeque<FailureSample>,
}

/// Accumulates outcomes for the whole run.
#[derive(Debug)]
pub struct OutcomeRecorder {
    config: RecorderConfig,
    started: Instant,

    successes: AtomicU64,
    failures: AtomicU64,

    window_successes: AtomicU64,
    window_failures: AtomicU64,

    details: Mutex<Details>,
}

impl OutcomeRecorder {
    pub fn new(config: RecorderConfig) -> Self {
        Self {
            config,
            started: Instant::now(),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            window_successes: AtomicU64::new(0),
            window_failures: AtomicU64::new(0),
            details: Mutex::new(Details::default()),
        }
    }

    fn details(&self) -> MutexGuard<'_, Details> {
        // A panicking worker must not take reporting down with it.
        self.details.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Records one completed request.
    pub fn record(&self, outcome: Outcome) {
        let success = outcome.is_success();
        if success {
            self.successes.fetch_add(1, Ordering::Relaxed);
            self.window_successes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failures.fetch_add(1, Ordering::Relaxed);
            self.window_failures.fetch_add(1, Ordering::Relaxed);
        }

        // Random draws happen before the lock is taken.
        let mut rng = rand::thread_rng();
        let keep_latency = rng.gen_bool(self.config.latency_sample_rate.clamp(0.0, 1.0));
        let keep_failure = !success
            && self.config.log_errors
            && self.config.failure_sample_cap > 0
            && rng.gen_bool(self.config.error_sample_rate.clamp(0.0, 1.0));

        let failure_sample = if keep_failure {
            Some(FailureSample {
                timestamp: Utc::now(),
                category: outcome.category.to_string(),
                url: outcome.url.to_string(),
                status_code: outcome.status_code,
                error_category: outcome
                    .error_category
                    .map(|c| c.label())
                    .unwrap_or("other_error")
                    .to_string(),
                message: outcome.error_detail.clone().unwrap_or_default(),
            })
        } else {
            None
        };

        let mut details = self.details();
        *details.status_codes.entry(outcome.status_code).or_insert(0) += 1;
        if let Some(category) = outcome.error_category {
            *details.error_categories.entry(category.label()).or_insert(0) += 1;
        }

        let counts = details
            .categories
            .entry(outcome.category.clone())
            .or_default();
        counts.requests += 1;
        if !success {
            counts.failures += 1;
        }

        if keep_latency {
            details.latency_samples.push(LatencySample {
                category: outcome.category,
                duration: outcome.duration,
            });
        }

        if let Some(sample) = failure_sample {
            if details.failure_samples.len() >= self.config.failure_sample_cap {
                details.failure_samples.pop_front();
            }
            details.failure_samples.push_back(sample);
        }
    }

    /// Lifetime totals as `(total, successes, failures)`.
    ///
    /// The total is derived from the other two, so it always balances.
    pub fn totals(&self) -> (u64, u64, u64) {
        let successes = self.successes.load(Ordering::Relaxed);
        let failures = self.failures.load(Ordering::Relaxed);
        (successes + failures, successes, failures)
    }

    pub fn window_counts(&self) -> WindowCounts {
        WindowCounts {
            successes: self.window_successes.load(Ordering::Relaxed),
            failures: self.window_failures.load(Ordering::Relaxed),
        }
    }

    /// Zeroes the window counters. Lifetime totals are untouched.
    pub fn reset_window(&self) {
        self.window_successes.store(0, Ordering::Relaxed);
        self.window_failures.store(0, Ordering::Relaxed);
    }

    /// Reads and zeroes the window counters in one step, so no outcome
    /// recorded in between is lost to both windows.
    pub fn take_window(&self) -> WindowCounts {
        WindowCounts {
            successes: self.window_successes.swap(0, Ordering::Relaxed),
            failures: self.window_failures.swap(0, Ordering::Relaxed),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Builds a snapshot using the time elapsed since the recorder was created.
    pub fn snapshot(&self) -> MetricsSnapshot {
        self.snapshot_at(self.elapsed())
    }

    /// Builds a snapshot as of `elapsed` into the run.
    pub fn snapshot_at(&self, elapsed: Duration) -> MetricsSnapshot {
        let (status_codes, error_categories, category_counts, latencies, failure_samples) = {
            let details = self.details();
            let latencies: Vec<(Arc<str>, Duration)> = details
                .latency_samples
                .iter()
                .map(|s| (s.category.clone(), s.duration))
                .collect();
            let category_counts: Vec<(String, u64, u64)> = details
                .categories
                .iter()
                .map(|(name, c)| (name.to_string(), c.requests, c.failures))
                .collect();
            (
                details.status_codes.clone(),
                details
                    .error_categories
                    .iter()
                    .map(|(k, v)| (k.to_string(), *v))
                    .collect::<BTreeMap<_, _>>(),
                category_counts,
                latencies,
                details.failure_samples.iter().cloned().collect::<Vec<_>>(),
            )
        };

        let (total, successes, failures) = self.totals();

        let success_rate = if total == 0 {
            100.0
        } else {
            successes as f64 / total as f64 * 100.0
        };
        let error_rate = 100.0 - success_rate;

        let secs = elapsed.as_secs_f64();
        let achieved_rps = if secs > 0.0 { total as f64 / secs } else { 0.0 };

        let categorized_total: u64 = category_counts.iter().map(|(_, r, _)| r).sum();
        let category_distribution = category_counts
            .into_iter()
            .map(|(name, requests, failures)| {
                let share_percent = if categorized_total == 0 {
                    0.0
                } else {
                    requests as f64 / categorized_total as f64 * 100.0
                };
                (
                    name,
                    CategoryStats {
                        requests,
                        failures,
                        share_percent,
                    },
                )
            })
            .collect();

        let all: Vec<Duration> = latencies.iter().map(|(_, d)| *d).collect();
        let mut by_category: BTreeMap<String, Vec<Duration>> = BTreeMap::new();
        for (category, duration) in &latencies {
            by_category
                .entry(category.to_string())
                .or_default()
                .push(*duration);
        }
        let category_latency = by_category
            .into_iter()
            .filter_map(|(name, samples)| {
                PercentileStats::from_samples(&samples).map(|s| (name, s))
            })
            .collect();

        MetricsSnapshot {
            elapsed,
            total_requests: total,
            successful_requests: successes,
            failed_requests: failures,
            achieved_rps,
            target_rps: None,
            success_rate,
            error_rate,
            status_codes,
            error_categories,
            category_distribution,
            latency_samples: all.len(),
            latency: PercentileStats::from_samples(&all),
            category_latency,
            failure_samples,
        }
    }
}

impl Default for OutcomeRecorder {
    fn default() -> Self {
        Self::new(RecorderConfig::default())
    }
}

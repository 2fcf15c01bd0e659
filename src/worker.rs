use rand::Rng;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinSet;
use tokio::time::{self, Duration, Instant};
use tracing::{debug, info, warn};

use crate::errors::{error_chain_message, ErrorCategory};
use crate::metrics::{
    CONCURRENT_REQUESTS, QUEUE_DEPTH, REQUEST_DURATION_SECONDS, REQUEST_ERRORS_BY_CATEGORY,
    REQUEST_STATUS_CODES, REQUEST_TOTAL,
};
use crate::recorder::{Outcome, OutcomeRecorder};
use crate::request::{RequestDescriptor, ResponseCheck};

/// Uniform random pause a worker takes after each request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThinkTime {
    pub min: Duration,
    pub max: Duration,
}

impl ThinkTime {
    pub fn sample(&self) -> Duration {
        if self.max <= self.min {
            return self.min;
        }
        let min = self.min.as_millis() as u64;
        let max = self.max.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }
}

/// Sizing for the worker pool.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerPoolConfig {
    pub workers: usize,
    /// Zero is legal and sheds every offer.
    pub queue_capacity: usize,
    pub think_time: Option<ThinkTime>,
}

/// What happened to a descriptor offered to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    Accepted,
    /// Queue full; the request is dropped.
    Shed,
    /// Every worker is gone; nothing will ever be accepted again.
    Closed,
}

/// Producer side of the bounded admission queue.
///
/// Dropping it closes the queue: workers finish what is already queued and exit.
#[derive(Debug)]
pub struct AdmissionQueue {
    sender: Option<mpsc::Sender<RequestDescriptor>>,
}

impl AdmissionQueue {
    /// Never waits for space.
    pub fn try_offer(&self, request: RequestDescriptor) -> Offer {
        let Some(sender) = &self.sender else {
            return Offer::Shed;
        };

        match sender.try_send(request) {
            Ok(()) => Offer::Accepted,
            Err(TrySendError::Full(_)) => Offer::Shed,
            Err(TrySendError::Closed(_)) => Offer::Closed,
        }
    }

    /// Descriptors waiting for a worker.
    pub fn depth(&self) -> usize {
        self.sender
            .as_ref()
            .map(|s| s.max_capacity() - s.capacity())
            .unwrap_or(0)
    }
}

/// Result of shutting the pool down.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolSummary {
    /// Requests the workers executed.
    pub executed: u64,
    /// Queued descriptors left behind when the stop signal fired.
    pub discarded: u64,
}

/// Fixed set of workers pulling from the admission queue.
pub struct WorkerPool {
    tasks: JoinSet<()>,
    stop_tx: watch::Sender<bool>,
    receiver: Arc<Mutex<mpsc::Receiver<RequestDescriptor>>>,
    executed: Arc<AtomicU64>,
}

impl WorkerPool {
    /// Spawns `config.workers` workers and returns the pool with its queue.
    pub fn start(
        config: &WorkerPoolConfig,
        client: reqwest::Client,
        recorder: Arc<OutcomeRecorder>,
    ) -> (Self, AdmissionQueue) {
        // tokio rejects zero-capacity channels; a zero queue gets no sender.
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let queue = AdmissionQueue {
            sender: (config.queue_capacity > 0).then_some(sender),
        };

        let receiver = Arc::new(Mutex::new(receiver));
        let (stop_tx, stop_rx) = watch::channel(false);
        let executed = Arc::new(AtomicU64::new(0));

        let mut tasks = JoinSet::new();
        for worker_id in 0..config.workers {
            let worker = Worker {
                worker_id,
                client: client.clone(),
                recorder: recorder.clone(),
                receiver: receiver.clone(),
                stop: stop_rx.clone(),
                think_time: config.think_time,
                executed: executed.clone(),
            };
            tasks.spawn(worker.run());
        }

        info!(
            workers = config.workers,
            queue_capacity = config.queue_capacity,
            "Worker pool started"
        );

        (
            Self {
                tasks,
                stop_tx,
                receiver,
                executed,
            },
            queue,
        )
    }

    /// Waits for the workers to drain the closed queue, for at most
    /// `drain_timeout`, then stops them. `abort` resolving ends the drain
    /// early.
    ///
    /// The [`AdmissionQueue`] must already have been dropped, otherwise the
    /// workers keep waiting for work until the timeout fires.
    pub async fn shutdown<F>(mut self, drain_timeout: Duration, abort: F) -> PoolSummary
    where
        F: Future<Output = ()>,
    {
        let drain = time::timeout(drain_timeout, async {
            while self.tasks.join_next().await.is_some() {}
        });

        tokio::select! {
            drained = drain => {
                if drained.is_err() {
                    warn!(
                        drain_timeout_ms = drain_timeout.as_millis() as u64,
                        "Drain timeout expired, stopping workers"
                    );
                }
            }
            _ = abort => warn!("Drain aborted, stopping workers"),
        }

        self.stop().await
    }

    /// Signals every worker to stop taking work and waits for in-flight
    /// requests to finish. Whatever is still queued is discarded.
    async fn stop(mut self) -> PoolSummary {
        let _ = self.stop_tx.send(true);
        while let Some(result) = self.tasks.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "Worker task ended abnormally");
            }
        }

        let mut discarded = 0;
        {
            let mut receiver = self.receiver.lock().await;
            receiver.close();
            while receiver.try_recv().is_ok() {
                discarded += 1;
            }
        }
        QUEUE_DEPTH.set(0.0);

        let summary = PoolSummary {
            executed: self.executed.load(Ordering::Relaxed),
            discarded,
        };
        info!(
            executed = summary.executed,
            discarded = summary.discarded,
            "Worker pool stopped"
        );
        summary
    }
}

struct Worker {
    worker_id: usize,
    client: reqwest::Client,
    recorder: Arc<OutcomeRecorder>,
    receiver: Arc<Mutex<mpsc::Receiver<RequestDescriptor>>>,
    stop: watch::Receiver<bool>,
    think_time: Option<ThinkTime>,
    executed: Arc<AtomicU64>,
}

impl Worker {
    async fn run(mut self) {
        debug!(worker_id = self.worker_id, "Worker starting");

        while let Some(request) = self.next_request().await {
            let outcome = execute(&self.client, &request).await;
            self.executed.fetch_add(1, Ordering::Relaxed);
            self.recorder.record(outcome);

            if let Some(think_time) = self.think_time {
                let pause = think_time.sample();
                tokio::select! {
                    _ = time::sleep(pause) => {}
                    _ = self.stop.changed() => {}
                }
            }
        }

        debug!(worker_id = self.worker_id, "Worker exiting");
    }

    /// Next queued descriptor, or `None` once stopped or the queue is closed and empty.
    async fn next_request(&mut self) -> Option<RequestDescriptor> {
        if *self.stop.borrow() {
            return None;
        }

        let mut receiver = self.receiver.lock().await;
        tokio::select! {
            biased;
            // A dropped stop sender counts as a stop.
            _ = self.stop.changed() => None,
            request = receiver.recv() => request,
        }
    }
}

/// Performs one request and classifies the result.
///
/// The duration covers sending the request through fully draining the body.
/// Transport errors never escape: they come back as status-0 outcomes.
pub async fn execute(client: &reqwest::Client, request: &RequestDescriptor) -> Outcome {
    let mut builder = client
        .request(request.method.clone(), &*request.url)
        .headers((*request.headers).clone());
    if let Some(body) = &request.body {
        builder = builder.body(body.to_string());
    }

    CONCURRENT_REQUESTS.inc();
    REQUEST_TOTAL.inc();
    let start = Instant::now();

    let outcome = match builder.send().await {
        Ok(response) => {
            let status = response.status().as_u16();
            let body_check = if request.check == ResponseCheck::GraphQlErrors
                && response.status().is_success()
            {
                read_application_error(response).await
            } else {
                drain_body(response).await.map(|()| None)
            };

            match body_check {
                Ok(application_error) => {
                    Outcome::response(request, start.elapsed(), status, application_error)
                }
                Err(e) => {
                    let mut outcome = Outcome::transport_failure(
                        request,
                        start.elapsed(),
                        ErrorCategory::from_reqwest_error(&e),
                        error_chain_message(&e),
                    );
                    outcome.status_code = status;
                    outcome
                }
            }
        }
        Err(e) => Outcome::transport_failure(
            request,
            start.elapsed(),
            ErrorCategory::from_reqwest_error(&e),
            error_chain_message(&e),
        ),
    };

    REQUEST_DURATION_SECONDS.observe(outcome.duration.as_secs_f64());
    CONCURRENT_REQUESTS.dec();
    REQUEST_STATUS_CODES
        .with_label_values(&[status_code_label(outcome.status_code)])
        .inc();
    if let Some(category) = outcome.error_category {
        REQUEST_ERRORS_BY_CATEGORY
            .with_label_values(&[category.label()])
            .inc();
        debug!(
            category = %request.category,
            url = %request.url,
            status_code = outcome.status_code,
            error_category = category.label(),
            error = outcome.error_detail.as_deref().unwrap_or(""),
            "Request failed"
        );
    }

    outcome
}

/// Streams and discards the body so the connection can go back to the pool.
async fn drain_body(mut response: reqwest::Response) -> Result<(), reqwest::Error> {
    while response.chunk().await?.is_some() {}
    Ok(())
}

async fn read_application_error(
    response: reqwest::Response,
) -> Result<Option<String>, reqwest::Error> {
    let body = response.bytes().await?;
    Ok(graphql_error_message(&body))
}

/// Failure message for a GraphQL response body, `None` if it reports no errors.
///
/// A body that is not JSON counts as a failure.
pub fn graphql_error_message(body: &[u8]) -> Option<String> {
    let value: serde_json::Value = match serde_json::from_slice(body) {
        Ok(v) => v,
        Err(e) => return Some(format!("Invalid JSON response: {}", e)),
    };

    let errors = value.get("errors")?.as_array()?;
    if errors.is_empty() {
        return None;
    }

    let messages: Vec<String> = errors
        .iter()
        .map(|err| {
            err.get("message")
                .and_then(|m| m.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| err.to_string())
        })
        .collect();
    Some(messages.join("; "))
}

/// Returns a static string label for common HTTP status codes.
///
/// Uncommon codes fall back to "other" rather than allocating a unique string.
fn status_code_label(code: u16) -> &'static str {
    match code {
        0 => "error",
        200 => "200",
        201 => "201",
        204 => "204",
        301 => "301",
        302 => "302",
        304 => "304",
        400 => "400",
        401 => "401",
        403 => "403",
        404 => "404",
        405 => "405",
        408 => "408",
        409 => "409",
        422 => "422",
        429 => "429",
        500 => "500",
        502 => "502",
        503 => "503",
        504 => "504",
        _ => "other",
    }
}

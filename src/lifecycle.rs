//! Run lifecycle: start, periodic reporting and graceful shutdown.
//!
//! ```text
//! Created -> Running -> Stopping -> Stopped
//! ```
//!
//! `Running` ends on an external stop or when the generator finishes on its
//! own. `Stopped` is reached once the generator has exited, the admission
//! queue is closed and the pool has drained; only then is the final snapshot
//! taken.

use chrono::Utc;
use std::fmt;
use std::future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::client::{build_client, ClientError};
use crate::config::RunConfig;
use crate::rate_controller::{LoadGenerator, TargetRate};
use crate::recorder::OutcomeRecorder;
use crate::report::{FinalReport, ReportSink};
use crate::worker::WorkerPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Created,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Created => "created",
            LifecycleState::Running => "running",
            LifecycleState::Stopping => "stopping",
            LifecycleState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("Load generation task failed: {0}")]
    Generator(#[from] JoinError),
}

/// Requests a graceful stop, or with [`stop_now`](Self::stop_now) one that
/// skips the drain. Repeated requests are no-ops.
#[derive(Debug, Clone)]
pub struct StopHandle {
    graceful: Arc<watch::Sender<bool>>,
    immediate: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    fn new() -> Self {
        Self {
            graceful: Arc::new(watch::channel(false).0),
            immediate: Arc::new(watch::channel(false).0),
        }
    }

    pub fn stop(&self) {
        if !self.graceful.send_replace(true) {
            info!("Stop requested");
        }
    }

    /// Stops the run and cuts the drain short: in-flight requests finish,
    /// anything still queued is discarded.
    pub fn stop_now(&self) {
        self.stop();
        if !self.immediate.send_replace(true) {
            warn!("Immediate stop requested, abandoning drain");
        }
    }

    pub fn is_stop_requested(&self) -> bool {
        *self.graceful.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.graceful.subscribe()
    }

    /// Resolves once [`stop_now`](Self::stop_now) has been called.
    async fn stopped_now(&self) {
        let mut immediate = self.immediate.subscribe();
        if immediate.wait_for(|now| *now).await.is_err() {
            future::pending::<()>().await;
        }
    }
}

/// Owns one run from start to final report.
pub struct LifecycleCoordinator {
    config: RunConfig,
    sinks: Vec<Box<dyn ReportSink>>,
    state: watch::Sender<LifecycleState>,
    stop: StopHandle,
}

impl LifecycleCoordinator {
    pub fn new(config: RunConfig) -> Self {
        let (state, _) = watch::channel(LifecycleState::Created);
        Self {
            config,
            sinks: Vec::new(),
            state,
            stop: StopHandle::new(),
        }
    }

    pub fn with_sink(mut self, sink: impl ReportSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    /// Observe state transitions while the run is in progress.
    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Runs until the schedule completes or a stop is requested through the
    /// [`StopHandle`].
    pub async fn run(self) -> Result<FinalReport, LifecycleError> {
        let LifecycleCoordinator {
            config,
            sinks,
            state,
            stop,
        } = self;
        let sinks: Arc<[Box<dyn ReportSink>]> = sinks.into();

        let client = build_client(&config.client)?;
        let start_time = Utc::now();
        let mode = config.schedule.mode();
        let recorder = Arc::new(OutcomeRecorder::new(config.recorder.clone()));
        let target = Arc::new(TargetRate::new(config.schedule.initial_rate()));

        let (pool, queue) = WorkerPool::start(&config.pool, client, recorder.clone());
        let generator = LoadGenerator::new(
            config.schedule,
            config.selector,
            queue,
            recorder.clone(),
            target.clone(),
            config.duration,
        );
        let generator_task = tokio::spawn(generator.run(stop.subscribe()));

        let (reporter_stop, reporter_stop_rx) = watch::channel(false);
        let reporter_task = spawn_reporter(
            recorder.clone(),
            target.clone(),
            sinks.clone(),
            config.reporting_interval,
            config.report_failure_samples,
            reporter_stop_rx,
        );
        transition(&state, LifecycleState::Running);

        let generated = generator_task.await;
        transition(&state, LifecycleState::Stopping);

        // The generator owned the admission queue, so it is closed by now.
        info!(
            drain_timeout_ms = config.drain_timeout.as_millis() as u64,
            "Draining in-flight requests"
        );
        let pool_summary = pool
            .shutdown(config.drain_timeout, stop.stopped_now())
            .await;

        reporter_stop.send_replace(true);
        if let Err(e) = reporter_task.await {
            warn!(error = %e, "Reporter task ended abnormally");
        }
        transition(&state, LifecycleState::Stopped);

        let summary = generated?;
        let snapshot = recorder.snapshot().with_target_rps(summary.final_rate);
        let report = FinalReport {
            start_time,
            end_time: Utc::now(),
            mode,
            end_reason: summary.reason,
            admitted_requests: summary.admitted,
            shed_requests: summary.shed,
            discarded_requests: pool_summary.discarded,
            final_target_rps: summary.final_rate,
            status_class_distribution: snapshot.status_class_distribution(),
            metrics: snapshot,
        };

        let accounted = report.metrics.total_requests + report.discarded_requests;
        if accounted != report.admitted_requests {
            warn!(
                admitted = report.admitted_requests,
                recorded = report.metrics.total_requests,
                discarded = report.discarded_requests,
                "Admitted requests do not match recorded outcomes"
            );
        }

        for sink in sinks.iter() {
            if let Err(e) = sink.final_report(&report) {
                error!(error = %e, "Failed to emit final report");
            }
        }

        Ok(report)
    }
}

fn transition(state: &watch::Sender<LifecycleState>, next: LifecycleState) {
    let previous = state.send_replace(next);
    if previous != next {
        info!(from = %previous, to = %next, "Lifecycle transition");
    }
}

fn spawn_reporter(
    recorder: Arc<OutcomeRecorder>,
    target: Arc<TargetRate>,
    sinks: Arc<[Box<dyn ReportSink>]>,
    interval: Duration,
    recent_failures: usize,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        // tokio panics on a zero period
        let period = interval.max(Duration::from_millis(1));
        let mut ticker = time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = stop.changed() => break,
                _ = ticker.tick() => {
                    let snapshot = recorder
                        .snapshot()
                        .with_target_rps(target.get())
                        .with_recent_failures(recent_failures);
                    for sink in sinks.iter() {
                        sink.periodic(&snapshot);
                    }
                }
            }
        }
    })
}

//! Admission rate scheduling.
//!
//! A [`Schedule`] is picked once per run. Staged schedules interpolate
//! linearly inside each stage; adaptive schedules move the rate by
//! additive-increase / multiplicative-decrease on the recent error rate.
//! Either way the [`LoadGenerator`] turns the current rate into admissions on
//! a 1ms tick against a per-second budget, and never waits on a full queue.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{self, Duration, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::endpoints::EndpointSelector;
use crate::metrics::{QUEUE_DEPTH, SHED_REQUESTS_TOTAL, TARGET_RPS};
use crate::recorder::{OutcomeRecorder, WindowCounts};
use crate::report::{EndReason, ScheduleMode};
use crate::worker::{AdmissionQueue, Offer};

/// Resolution of the admission timer.
pub const ADMISSION_TICK: Duration = Duration::from_millis(1);

/// One step of a staged run.
#[derive(Debug, Clone, PartialEq)]
pub struct Stage {
    pub duration: Duration,
    pub target_rate: f64,
    pub description: String,
}

/// Tuning for the adaptive controller.
#[derive(Debug, Clone, PartialEq)]
pub struct AdaptiveParameters {
    pub initial_rate: f64,
    pub error_threshold_percent: f64,
    pub increase_percent: f64,
    pub decrease_percent: f64,
    pub min_rate: f64,
    pub max_rate: f64,
    pub sampling_window: Duration,
    pub stabilization_window: Duration,
}

/// How the size of an adaptive adjustment is rounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RateRounding {
    /// Steps are whole requests per second, truncated toward zero:
    /// 10 rises by 2 (25%) and falls by 1 (15%).
    #[default]
    Integer,
    /// Keep fractional steps.
    Exact,
}

impl RateRounding {
    pub fn step(self, delta: f64) -> f64 {
        match self {
            RateRounding::Integer => delta.trunc(),
            RateRounding::Exact => delta,
        }
    }
}

/// Scheduling mode for a run. Exactly one is configured.
#[derive(Debug, Clone, PartialEq)]
pub enum Schedule {
    Staged {
        stages: Vec<Stage>,
        /// Rate at the start of the first stage; defaults to its target.
        start_rate: Option<f64>,
    },
    Adaptive {
        params: AdaptiveParameters,
        rounding: RateRounding,
    },
}

impl Schedule {
    pub fn mode(&self) -> ScheduleMode {
        match self {
            Schedule::Staged { .. } => ScheduleMode::Staged,
            Schedule::Adaptive { .. } => ScheduleMode::Adaptive,
        }
    }

    /// Rate in effect when the run starts.
    pub fn initial_rate(&self) -> f64 {
        match self {
            Schedule::Staged { stages, start_rate } => start_rate
                .or_else(|| stages.first().map(|s| s.target_rate))
                .unwrap_or(0.0),
            Schedule::Adaptive { params, .. } => {
                params.initial_rate.clamp(params.min_rate, params.max_rate)
            }
        }
    }
}

/// Linear interpolation within a stage. Progress is clamped to `[0, 1]`;
/// a zero-length stage is already complete.
pub fn interpolate_rate(
    start_rate: f64,
    target_rate: f64,
    elapsed: Duration,
    duration: Duration,
) -> f64 {
    let progress = if duration.is_zero() {
        1.0
    } else {
        (elapsed.as_secs_f64() / duration.as_secs_f64()).clamp(0.0, 1.0)
    };
    (start_rate + (target_rate - start_rate) * progress).max(0.0)
}

/// Applies one AIMD step to `current` and clamps the result to `[min_rate, max_rate]`.
pub fn adjust_rate(
    current: f64,
    error_rate_percent: f64,
    params: &AdaptiveParameters,
    rounding: RateRounding,
) -> f64 {
    let next = if error_rate_percent > params.error_threshold_percent {
        current - rounding.step(current * params.decrease_percent / 100.0)
    } else {
        current + rounding.step(current * params.increase_percent / 100.0)
    };

    next.max(0.0).clamp(params.min_rate, params.max_rate)
}

/// Cursor over the stage list.
#[derive(Debug, Clone)]
pub struct StagedState {
    stages: Vec<Stage>,
    index: usize,
    stage_start: Instant,
    stage_start_rate: f64,
}

impl StagedState {
    pub fn new(stages: Vec<Stage>, start_rate: f64, now: Instant) -> Self {
        Self {
            stages,
            index: 0,
            stage_start: now,
            stage_start_rate: start_rate,
        }
    }

    /// Target rate at `now`, or `None` once every stage has run.
    ///
    /// Stage boundaries are absolute: a late tick does not stretch the next stage.
    pub fn rate_at(&mut self, now: Instant) -> Option<f64> {
        loop {
            let stage = self.stages.get(self.index)?;
            let elapsed = now.saturating_duration_since(self.stage_start);
            if elapsed < stage.duration {
                return Some(interpolate_rate(
                    self.stage_start_rate,
                    stage.target_rate,
                    elapsed,
                    stage.duration,
                ));
            }

            self.stage_start += stage.duration;
            self.stage_start_rate = stage.target_rate;
            self.index += 1;

            match self.stages.get(self.index) {
                Some(next) => info!(
                    stage = self.index + 1,
                    stages = self.stages.len(),
                    description = %next.description,
                    from_rps = self.stage_start_rate,
                    to_rps = next.target_rate,
                    "Moving to next stage"
                ),
                None => info!(stages = self.stages.len(), "All stages completed"),
            }
        }
    }
}

/// Adaptive controller state. Owned by the generation loop alone.
#[derive(Debug, Clone)]
pub struct AdaptiveState {
    params: AdaptiveParameters,
    rounding: RateRounding,
    current_rate: f64,
    last_change: Instant,
    window_start: Instant,
}

impl AdaptiveState {
    pub fn new(params: AdaptiveParameters, rounding: RateRounding, now: Instant) -> Self {
        let current_rate = params.initial_rate.clamp(params.min_rate, params.max_rate);
        Self {
            params,
            rounding,
            current_rate,
            last_change: now,
            window_start: now,
        }
    }

    pub fn current_rate(&self) -> f64 {
        self.current_rate
    }

    pub fn last_change(&self) -> Instant {
        self.last_change
    }

    /// True once a full sampling window has elapsed.
    pub fn window_due(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.window_start) >= self.params.sampling_window
    }

    /// Closes the window at `now` with the given counts. Changes the rate
    /// only if the stabilization window has passed since the last change.
    ///
    /// Returns the new rate when it was adjusted.
    pub fn close_window(&mut self, now: Instant, window: WindowCounts) -> Option<f64> {
        self.window_start = now;

        if now.saturating_duration_since(self.last_change) < self.params.stabilization_window {
            debug!(
                successes = window.successes,
                failures = window.failures,
                "Window closed inside stabilization period"
            );
            return None;
        }

        let error_rate = window.error_rate_percent();
        let previous = self.current_rate;
        self.current_rate = adjust_rate(previous, error_rate, &self.params, self.rounding);
        self.last_change = now;

        if error_rate > self.params.error_threshold_percent {
            info!(
                error_rate = %format_args!("{:.2}", error_rate),
                threshold = self.params.error_threshold_percent,
                from_rps = previous,
                to_rps = self.current_rate,
                "Error rate exceeds threshold, decreasing rate"
            );
        } else {
            info!(
                error_rate = %format_args!("{:.2}", error_rate),
                threshold = self.params.error_threshold_percent,
                from_rps = previous,
                to_rps = self.current_rate,
                "Error rate below threshold, increasing rate"
            );
        }

        Some(self.current_rate)
    }

    /// Per-tick step: closes the window against the recorder when it is due.
    pub fn on_tick(&mut self, now: Instant, recorder: &OutcomeRecorder) -> f64 {
        if self.window_due(now) {
            let window = recorder.take_window();
            self.close_window(now, window);
        }
        self.current_rate
    }
}

/// Per-second admission budget, paced across the second.
#[derive(Debug, Clone)]
pub struct AdmissionBudget {
    second_start: Instant,
    admitted: u64,
}

impl AdmissionBudget {
    pub fn new(now: Instant) -> Self {
        Self {
            second_start: now,
            admitted: 0,
        }
    }

    /// How many more requests may be admitted at `now` for `target_rate`.
    ///
    /// The count resets once a full second has elapsed. Within the second the
    /// allowance grows with elapsed time, so admissions spread evenly instead
    /// of bursting on the first tick.
    pub fn allowance(&mut self, now: Instant, target_rate: f64) -> u64 {
        let mut elapsed = now.saturating_duration_since(self.second_start);
        if elapsed >= Duration::from_secs(1) {
            self.second_start = now;
            self.admitted = 0;
            elapsed = Duration::ZERO;
        }

        if target_rate.is_nan() || target_rate <= 0.0 {
            return 0;
        }

        let per_second = target_rate.ceil() as u64;
        let paced = ((target_rate * elapsed.as_secs_f64()).ceil() as u64).clamp(1, per_second);
        paced.saturating_sub(self.admitted)
    }

    pub fn record_admitted(&mut self) {
        self.admitted += 1;
    }
}

/// Current admission rate, shared with the reporter.
#[derive(Debug, Default)]
pub struct TargetRate(AtomicU64);

impl TargetRate {
    pub fn new(rate: f64) -> Self {
        Self(AtomicU64::new(rate.to_bits()))
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }

    pub fn set(&self, rate: f64) {
        self.0.store(rate.to_bits(), Ordering::Relaxed);
        TARGET_RPS.set(rate);
    }
}

/// How the generation loop ended.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeneratorSummary {
    pub reason: EndReason,
    pub admitted: u64,
    pub shed: u64,
    pub final_rate: f64,
}

enum Scheduler {
    Staged(StagedState),
    Adaptive(AdaptiveState),
}

/// The generation loop: computes the target rate and offers descriptors.
pub struct LoadGenerator {
    schedule: Schedule,
    selector: EndpointSelector,
    queue: AdmissionQueue,
    recorder: Arc<OutcomeRecorder>,
    target: Arc<TargetRate>,
    duration: Option<Duration>,
}

impl LoadGenerator {
    pub fn new(
        schedule: Schedule,
        selector: EndpointSelector,
        queue: AdmissionQueue,
        recorder: Arc<OutcomeRecorder>,
        target: Arc<TargetRate>,
        duration: Option<Duration>,
    ) -> Self {
        Self {
            schedule,
            selector,
            queue,
            recorder,
            target,
            duration,
        }
    }

    /// Runs until the schedule is exhausted, the duration bound is reached or
    /// `stop` fires. The admission queue is closed when this returns.
    pub async fn run(self, mut stop: watch::Receiver<bool>) -> GeneratorSummary {
        let start = Instant::now();
        let initial_rate = self.schedule.initial_rate();
        let mode = self.schedule.mode();

        let mut scheduler = match self.schedule {
            Schedule::Staged { stages, .. } => {
                Scheduler::Staged(StagedState::new(stages, initial_rate, start))
            }
            Schedule::Adaptive { params, rounding } => {
                self.recorder.reset_window();
                Scheduler::Adaptive(AdaptiveState::new(params, rounding, start))
            }
        };
        self.target.set(initial_rate);

        info!(mode = ?mode, initial_rps = initial_rate, "Load generation started");

        let mut budget = AdmissionBudget::new(start);
        let mut admitted = 0u64;
        let mut shed = 0u64;

        let mut ticker = time::interval(ADMISSION_TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let reason = loop {
            if *stop.borrow_and_update() {
                break EndReason::StopRequested;
            }

            tokio::select! {
                biased;
                // A dropped stop sender counts as a stop.
                _ = stop.changed() => break EndReason::StopRequested,
                _ = ticker.tick() => {}
            }

            let now = Instant::now();
            if let Some(limit) = self.duration {
                if now.saturating_duration_since(start) >= limit {
                    info!(duration_secs = limit.as_secs(), "Test duration completed");
                    break EndReason::DurationElapsed;
                }
            }

            let rate = match &mut scheduler {
                Scheduler::Staged(staged) => match staged.rate_at(now) {
                    Some(rate) => rate,
                    None => break EndReason::StagesComplete,
                },
                Scheduler::Adaptive(adaptive) => adaptive.on_tick(now, &self.recorder),
            };
            self.target.set(rate);

            let mut closed = false;
            for _ in 0..budget.allowance(now, rate) {
                match self.queue.try_offer(self.selector.next_request()) {
                    Offer::Accepted => {
                        admitted += 1;
                        budget.record_admitted();
                    }
                    Offer::Shed => {
                        shed += 1;
                        SHED_REQUESTS_TOTAL.inc();
                        break;
                    }
                    Offer::Closed => {
                        closed = true;
                        break;
                    }
                }
            }
            QUEUE_DEPTH.set(self.queue.depth() as f64);

            if closed {
                warn!("Admission queue closed by the worker pool, stopping generation");
                break EndReason::StopRequested;
            }
        };

        let final_rate = self.target.get();
        info!(
            reason = ?reason,
            admitted,
            shed,
            final_rps = final_rate,
            "Load generation stopped"
        );

        GeneratorSummary {
            reason,
            admitted,
            shed,
            final_rate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> AdaptiveParameters {
        AdaptiveParameters {
            initial_rate: 10.0,
            error_threshold_percent: 2.0,
            increase_percent: 25.0,
            decrease_percent: 15.0,
            min_rate: 5.0,
            max_rate: 500.0,
            sampling_window: Duration::from_secs(5),
            stabilization_window: Duration::from_secs(15),
        }
    }

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn test_interpolation_boundaries() {
        assert_eq!(interpolate_rate(10.0, 50.0, Duration::ZERO, secs(10)), 10.0);
        assert_eq!(interpolate_rate(10.0, 50.0, secs(10), secs(10)), 50.0);
        assert_eq!(interpolate_rate(10.0, 50.0, secs(5), secs(10)), 30.0);
        assert_eq!(interpolate_rate(10.0, 50.0, secs(20), secs(10)), 50.0);
        assert_eq!(interpolate_rate(50.0, 0.0, secs(5), secs(10)), 25.0);
        assert_eq!(interpolate_rate(10.0, 0.0, Duration::ZERO, Duration::ZERO), 0.0);
    }

    #[test]
    fn test_adjust_increase_truncates_step() {
        assert_eq!(adjust_rate(10.0, 0.0, &params(), RateRounding::Integer), 12.0);
        assert_eq!(adjust_rate(10.0, 0.0, &params(), RateRounding::Exact), 12.5);
    }

    #[test]
    fn test_adjust_decrease_and_min_floor() {
        assert_eq!(adjust_rate(10.0, 100.0, &params(), RateRounding::Exact), 8.5);
        // 15% of 10 is 1.5, truncated to a step of 1
        assert_eq!(adjust_rate(10.0, 100.0, &params(), RateRounding::default()), 9.0);
        // 15% of 6 truncates to 0: the rate holds
        assert_eq!(adjust_rate(6.0, 100.0, &params(), RateRounding::Integer), 6.0);

        let high_floor = AdaptiveParameters {
            min_rate: 9.0,
            ..params()
        };
        assert_eq!(adjust_rate(10.0, 100.0, &high_floor, RateRounding::Exact), 9.0);
    }

    #[test]
    fn test_threshold_is_exclusive() {
        // exactly at the threshold counts as healthy
        assert_eq!(adjust_rate(100.0, 2.0, &params(), RateRounding::Exact), 125.0);
        assert_eq!(adjust_rate(100.0, 2.01, &params(), RateRounding::Exact), 85.0);
    }

    #[test]
    fn test_adjust_stays_clamped() {
        let p = params();
        let mut rate = p.initial_rate;
        for i in 0..200 {
            let error_rate = if i % 3 == 0 { 100.0 } else { 0.0 };
            rate = adjust_rate(rate, error_rate, &p, RateRounding::Exact);
            assert!(rate >= p.min_rate && rate <= p.max_rate, "{}", rate);
        }
        for _ in 0..100 {
            rate = adjust_rate(rate, 0.0, &p, RateRounding::Integer);
        }
        assert_eq!(rate, p.max_rate);
    }

    #[test]
    fn test_staged_progression() {
        let t0 = Instant::now();
        let stages = vec![
            Stage {
                duration: secs(10),
                target_rate: 50.0,
                description: "ramp".into(),
            },
            Stage {
                duration: secs(10),
                target_rate: 50.0,
                description: "hold".into(),
            },
            Stage {
                duration: secs(10),
                target_rate: 0.0,
                description: "down".into(),
            },
        ];
        let mut state = StagedState::new(stages, 10.0, t0);

        assert_eq!(state.rate_at(t0), Some(10.0));
        assert_eq!(state.rate_at(t0 + secs(5)), Some(30.0));
        assert_eq!(state.rate_at(t0 + secs(15)), Some(50.0));
        assert_eq!(state.rate_at(t0 + secs(25)), Some(25.0));
        assert_eq!(state.rate_at(t0 + secs(30)), None);
        assert_eq!(state.rate_at(t0 + secs(31)), None);
    }

    #[test]
    fn test_staged_late_tick_skips_whole_stages() {
        let t0 = Instant::now();
        let stages = vec![
            Stage {
                duration: secs(1),
                target_rate: 20.0,
                description: String::new(),
            },
            Stage {
                duration: Duration::ZERO,
                target_rate: 100.0,
                description: String::new(),
            },
            Stage {
                duration: secs(10),
                target_rate: 0.0,
                description: String::new(),
            },
        ];
        let mut state = StagedState::new(stages, 20.0, t0);
        // 1s + 0s consumed; third stage starts from 100 at t0+1s
        assert_eq!(state.rate_at(t0 + secs(6)), Some(50.0));
    }

    #[test]
    fn test_single_zero_stage() {
        let t0 = Instant::now();
        let mut state = StagedState::new(
            vec![Stage {
                duration: secs(1),
                target_rate: 0.0,
                description: String::new(),
            }],
            0.0,
            t0,
        );
        assert_eq!(state.rate_at(t0 + Duration::from_millis(999)), Some(0.0));
        assert_eq!(state.rate_at(t0 + secs(1)), None);
    }

    #[test]
    fn test_adaptive_scenarios() {
        let t0 = Instant::now();
        let all_ok = WindowCounts {
            successes: 50,
            failures: 0,
        };
        let all_failed = WindowCounts {
            successes: 0,
            failures: 50,
        };

        let mut up = AdaptiveState::new(params(), RateRounding::Integer, t0);
        assert_eq!(up.close_window(t0 + secs(15), all_ok), Some(12.0));

        let mut whole = AdaptiveState::new(params(), RateRounding::Integer, t0);
        assert_eq!(whole.close_window(t0 + secs(15), all_failed), Some(9.0));

        let mut down = AdaptiveState::new(params(), RateRounding::Exact, t0);
        assert_eq!(down.close_window(t0 + secs(15), all_failed), Some(8.5));

        let floor_nine = AdaptiveParameters {
            min_rate: 9.0,
            ..params()
        };
        let mut floored = AdaptiveState::new(floor_nine, RateRounding::Exact, t0);
        assert_eq!(floored.close_window(t0 + secs(15), all_failed), Some(9.0));
    }

    #[test]
    fn test_adaptive_hysteresis() {
        let p = params();
        let t0 = Instant::now();
        let mut state = AdaptiveState::new(p.clone(), RateRounding::Integer, t0);
        let ok = WindowCounts {
            successes: 10,
            failures: 0,
        };

        let mut last_change: Option<Instant> = None;
        let mut now = t0;
        for _ in 0..40 {
            now += p.sampling_window;
            assert!(state.window_due(now));
            if state.close_window(now, ok).is_some() {
                if let Some(prev) = last_change {
                    assert!(now - prev >= p.stabilization_window);
                }
                last_change = Some(now);
            }
        }
        // 40 windows of 5s with a 15s guard: a change every third window
        assert_eq!(state.last_change(), last_change.unwrap());
        assert!(!state.window_due(now + Duration::from_secs(4)));
    }

    #[test]
    fn test_adaptive_initial_rate_is_clamped() {
        let p = AdaptiveParameters {
            initial_rate: 1.0,
            ..params()
        };
        let state = AdaptiveState::new(p, RateRounding::Integer, Instant::now());
        assert_eq!(state.current_rate(), 5.0);
    }

    #[test]
    fn test_budget_paces_and_resets() {
        let t0 = Instant::now();
        let mut budget = AdmissionBudget::new(t0);

        // first tick admits one, not the whole second
        assert_eq!(budget.allowance(t0, 10.0), 1);
        budget.record_admitted();
        assert_eq!(budget.allowance(t0 + Duration::from_millis(50), 10.0), 0);
        assert_eq!(budget.allowance(t0 + Duration::from_millis(150), 10.0), 1);

        // a late tick catches up to the paced amount
        let allowed = budget.allowance(t0 + Duration::from_millis(999), 10.0);
        assert_eq!(allowed, 9);
        for _ in 0..allowed {
            budget.record_admitted();
        }
        assert_eq!(budget.allowance(t0 + Duration::from_millis(999), 10.0), 0);

        // next second
        assert_eq!(budget.allowance(t0 + secs(1), 10.0), 1);
    }

    #[test]
    fn test_budget_zero_and_fractional_rates() {
        let t0 = Instant::now();
        let mut budget = AdmissionBudget::new(t0);
        assert_eq!(budget.allowance(t0 + Duration::from_millis(500), 0.0), 0);
        assert_eq!(budget.allowance(t0 + Duration::from_millis(500), -3.0), 0);
        assert_eq!(budget.allowance(t0 + Duration::from_millis(500), f64::NAN), 0);

        // 12.5 rps admits 13 in a full second
        assert_eq!(budget.allowance(t0 + Duration::from_millis(999), 12.5), 13);
    }

    #[test]
    fn test_budget_high_rates_exceed_tick_count() {
        let t0 = Instant::now();
        let mut budget = AdmissionBudget::new(t0);
        assert_eq!(budget.allowance(t0 + Duration::from_millis(1), 5000.0), 5);
    }

    #[test]
    fn test_target_rate_roundtrip() {
        let target = TargetRate::new(10.0);
        assert_eq!(target.get(), 10.0);
        target.set(12.5);
        assert_eq!(target.get(), 12.5);
    }

    #[test]
    fn test_schedule_initial_rate() {
        let staged = Schedule::Staged {
            stages: vec![Stage {
                duration: secs(1),
                target_rate: 40.0,
                description: String::new(),
            }],
            start_rate: None,
        };
        assert_eq!(staged.initial_rate(), 40.0);
        assert_eq!(staged.mode(), ScheduleMode::Staged);

        let adaptive = Schedule::Adaptive {
            params: params(),
            rounding: RateRounding::Integer,
        };
        assert_eq!(adaptive.initial_rate(), 10.0);
        assert_eq!(adaptive.mode(), ScheduleMode::Adaptive);
    }
}

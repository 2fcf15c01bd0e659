use rand::Rng;
use reqwest::header::HeaderMap;
use reqwest::Method;
use std::sync::Arc;
use std::time::Duration;

use rust_loadgen::percentiles::{nearest_rank, PercentileStats};
use rust_loadgen::recorder::{Outcome, OutcomeRecorder, RecorderConfig};
use rust_loadgen::request::{Endpoint, RequestDescriptor};

fn descriptor(name: &str) -> RequestDescriptor {
    Endpoint::http(
        name,
        Method::GET,
        &format!("http://shop.example.com/{}", name),
        HeaderMap::new(),
        None,
    )
    .descriptor()
}

fn random_outcome(rng: &mut impl Rng, request: &RequestDescriptor) -> Outcome {
    let duration = Duration::from_millis(rng.gen_range(1..500));
    let status = match rng.gen_range(0..10) {
        0 => 503,
        1 => 404,
        _ => 200,
    };
    Outcome::response(request, duration, status, None)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_recording_conserves_totals() {
    let recorder = Arc::new(OutcomeRecorder::new(RecorderConfig {
        latency_sample_rate: 1.0,
        ..RecorderConfig::default()
    }));

    let mut handles = Vec::new();
    for task in 0..8 {
        let recorder = recorder.clone();
        handles.push(tokio::spawn(async move {
            let request = descriptor(if task % 2 == 0 { "products" } else { "categories" });
            let mut rng = rand::thread_rng();
            for _ in 0..250 {
                let outcome = random_outcome(&mut rng, &request);
                recorder.record(outcome);
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let snapshot = recorder.snapshot();
    assert_eq!(snapshot.total_requests, 2000);
    assert_eq!(
        snapshot.total_requests,
        snapshot.successful_requests + snapshot.failed_requests
    );
    assert_eq!(snapshot.status_codes.values().sum::<u64>(), 2000);
    assert_eq!(
        snapshot
            .category_distribution
            .values()
            .map(|c| c.requests)
            .sum::<u64>(),
        2000
    );
    assert_eq!(snapshot.latency_samples, 2000);
}

#[test]
fn counters_never_decrease_across_snapshots() {
    let recorder = OutcomeRecorder::new(RecorderConfig::default());
    let request = descriptor("products");
    let mut rng = rand::thread_rng();

    let mut previous = recorder.snapshot();
    for _ in 0..20 {
        for _ in 0..rng.gen_range(0..20) {
            recorder.record(random_outcome(&mut rng, &request));
        }
        recorder.reset_window();

        let current = recorder.snapshot();
        assert!(current.total_requests >= previous.total_requests);
        assert!(current.successful_requests >= previous.successful_requests);
        assert!(current.failed_requests >= previous.failed_requests);
        previous = current;
    }
}

#[test]
fn snapshot_at_is_idempotent() {
    let recorder = OutcomeRecorder::new(RecorderConfig {
        latency_sample_rate: 1.0,
        error_sample_rate: 1.0,
        ..RecorderConfig::default()
    });
    let request = descriptor("products");
    let mut rng = rand::thread_rng();
    for _ in 0..100 {
        recorder.record(random_outcome(&mut rng, &request));
    }

    let elapsed = Duration::from_secs(10);
    assert_eq!(recorder.snapshot_at(elapsed), recorder.snapshot_at(elapsed));
}

#[test]
fn percentiles_are_ordered_for_random_samples() {
    let mut rng = rand::thread_rng();
    for _ in 0..50 {
        let n = rng.gen_range(1..300);
        let samples: Vec<Duration> = (0..n)
            .map(|_| Duration::from_micros(rng.gen_range(0..1_000_000)))
            .collect();

        let stats = PercentileStats::from_samples(&samples).unwrap();
        assert!(stats.min <= stats.p50);
        assert!(stats.p50 <= stats.p90);
        assert!(stats.p90 <= stats.p95);
        assert!(stats.p95 <= stats.p99);
        assert!(stats.p99 <= stats.max);
        assert_eq!(stats.count, n);
    }
}

#[test]
fn nearest_rank_uses_floor_index() {
    let sorted: Vec<Duration> = (1..=10).map(Duration::from_millis).collect();
    assert_eq!(nearest_rank(&sorted, 0.50), Duration::from_millis(6));
    assert_eq!(nearest_rank(&sorted, 0.90), Duration::from_millis(10));
    assert_eq!(nearest_rank(&sorted, 0.99), Duration::from_millis(10));
    assert_eq!(nearest_rank(&[], 0.5), Duration::ZERO);
}

#[test]
fn window_reset_leaves_lifetime_totals() {
    let recorder = OutcomeRecorder::new(RecorderConfig::default());
    let request = descriptor("products");
    recorder.record(Outcome::response(&request, Duration::from_millis(5), 200, None));
    recorder.record(Outcome::response(&request, Duration::from_millis(5), 500, None));

    let window = recorder.take_window();
    assert_eq!(window.total(), 2);
    assert_eq!(window.error_rate_percent(), 50.0);
    assert_eq!(recorder.window_counts().total(), 0);
    assert_eq!(recorder.totals(), (2, 1, 1));
}

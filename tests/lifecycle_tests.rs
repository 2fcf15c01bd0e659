use std::time::Duration;
use tokio::time::Instant;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use rust_loadgen::config::LoadgenConfig;
use rust_loadgen::lifecycle::{LifecycleCoordinator, LifecycleState};
use rust_loadgen::report::{EndReason, JsonFileSink, ScheduleMode};

fn staged_config(base_url: &str, stages: &str, queue_capacity: usize) -> LoadgenConfig {
    let json = format!(
        r#"{{
            "target": {{
                "endpoints": [
                    {{"name": "products", "url": "{base}/products", "weight": 3}},
                    {{"name": "categories", "url": "{base}/categories", "weight": 1}}
                ]
            }},
            "load": {{"stages": {stages}}},
            "pool": {{
                "workers": 8,
                "queueCapacity": {queue_capacity},
                "reportingInterval": "200ms",
                "drainTimeout": "5s"
            }},
            "sampling": {{"latencySampleRate": 1.0, "errorSampleRate": 1.0}}
        }}"#,
        base = base_url,
        stages = stages,
        queue_capacity = queue_capacity,
    );
    LoadgenConfig::from_json_str(&json).unwrap()
}

async fn mock_ok(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/products"))
        .respond_with(ResponseTemplate::new(200).set_body_string("[]"))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/categories"))
        .respond_with(ResponseTemplate::new(200).set_body_string("[]"))
        .mount(server)
        .await;
}

#[tokio::test]
async fn staged_run_conserves_every_admitted_request() {
    let server = MockServer::start().await;
    mock_ok(&server).await;

    let run = staged_config(
        &server.uri(),
        r#"[{"duration": "1s", "targetRate": 50}]"#,
        100,
    )
    .resolve()
    .unwrap();

    let report = LifecycleCoordinator::new(run).run().await.unwrap();

    assert_eq!(report.mode, ScheduleMode::Staged);
    assert_eq!(report.end_reason, EndReason::StagesComplete);
    assert!(report.admitted_requests > 0);
    assert_eq!(report.discarded_requests, 0);
    assert_eq!(report.metrics.total_requests, report.admitted_requests);
    assert_eq!(
        report.metrics.total_requests,
        report.metrics.successful_requests + report.metrics.failed_requests
    );
    assert_eq!(report.metrics.failed_requests, 0);

    // Never admits more than the per-second budget allows.
    assert!(report.admitted_requests <= 55, "{}", report.admitted_requests);

    let latency = report.metrics.latency.as_ref().unwrap();
    assert!(latency.p50 <= latency.p90);
    assert!(latency.p90 <= latency.p95);
    assert!(latency.p95 <= latency.p99);
    assert!(latency.min <= latency.p50 && latency.p99 <= latency.max);

    let distribution = &report.metrics.category_distribution;
    assert!(distribution.contains_key("products"));
    assert_eq!(report.status_class_distribution.get("2xx"), Some(&report.admitted_requests));
}

#[tokio::test]
async fn failures_are_counted_and_sampled() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let run = staged_config(
        &server.uri(),
        r#"[{"duration": "500ms", "targetRate": 40}]"#,
        100,
    )
    .resolve()
    .unwrap();

    let report = LifecycleCoordinator::new(run).run().await.unwrap();

    let metrics = &report.metrics;
    assert!(metrics.failed_requests > 0);
    assert_eq!(metrics.successful_requests, 0);
    assert_eq!(metrics.status_codes.get(&503), Some(&metrics.failed_requests));
    assert_eq!(
        metrics.error_categories.get("server_error"),
        Some(&metrics.failed_requests)
    );
    assert!(!metrics.failure_samples.is_empty());
    assert!(metrics.failure_samples.iter().all(|s| s.status_code == 503));
}

#[tokio::test]
async fn zero_capacity_queue_sheds_all_load() {
    let server = MockServer::start().await;
    mock_ok(&server).await;

    let run = staged_config(
        &server.uri(),
        r#"[{"duration": "500ms", "targetRate": 100}]"#,
        0,
    )
    .resolve()
    .unwrap();

    let report = LifecycleCoordinator::new(run).run().await.unwrap();

    assert_eq!(report.admitted_requests, 0);
    assert!(report.shed_requests > 0);
    assert_eq!(report.metrics.total_requests, 0);
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn single_zero_rate_stage_admits_nothing_for_one_second() {
    let server = MockServer::start().await;
    mock_ok(&server).await;

    let run = staged_config(
        &server.uri(),
        r#"[{"duration": "1s", "targetRate": 0}]"#,
        100,
    )
    .resolve()
    .unwrap();

    let started = Instant::now();
    let report = LifecycleCoordinator::new(run).run().await.unwrap();
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_secs(1), "{:?}", elapsed);
    assert!(elapsed < Duration::from_secs(3), "{:?}", elapsed);
    assert_eq!(report.end_reason, EndReason::StagesComplete);
    assert_eq!(report.admitted_requests, 0);
    assert_eq!(report.metrics.total_requests, 0);
}

#[tokio::test]
async fn external_stop_reaches_stopped_with_final_report() {
    let server = MockServer::start().await;
    mock_ok(&server).await;

    let run = staged_config(
        &server.uri(),
        r#"[{"duration": "1m", "targetRate": 20}]"#,
        100,
    )
    .resolve()
    .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let results = dir.path().join("results.json");
    let coordinator = LifecycleCoordinator::new(run).with_sink(JsonFileSink::new(&results));
    let stop = coordinator.stop_handle();
    let mut state = coordinator.subscribe();

    let handle = tokio::spawn(coordinator.run());

    state
        .wait_for(|s| *s == LifecycleState::Running)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    stop.stop();

    let report = tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert_eq!(*state.borrow(), LifecycleState::Stopped);
    assert_eq!(report.end_reason, EndReason::StopRequested);
    assert_eq!(
        report.metrics.total_requests + report.discarded_requests,
        report.admitted_requests
    );

    let written: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&results).unwrap()).unwrap();
    assert_eq!(written["endReason"], "stopRequested");
    assert_eq!(written["mode"], "staged");
    assert!(written["startTime"].is_string());
}

#[tokio::test]
async fn duration_bound_ends_adaptive_run() {
    let server = MockServer::start().await;
    mock_ok(&server).await;

    let yaml = format!(
        r#"
target:
  endpoints:
    - name: products
      url: {}/products
load:
  adaptive:
    initialRate: 20
    minRate: 5
    maxRate: 100
    samplingWindow: 200ms
    stabilizationWindow: 200ms
  duration: 1s
pool:
  workers: 4
  reportingInterval: 250ms
"#,
        server.uri()
    );
    let run = LoadgenConfig::from_yaml_str(&yaml).unwrap().resolve().unwrap();

    let report = LifecycleCoordinator::new(run).run().await.unwrap();

    assert_eq!(report.mode, ScheduleMode::Adaptive);
    assert_eq!(report.end_reason, EndReason::DurationElapsed);
    // A healthy target only ever sees increases.
    assert!(report.final_target_rps > 20.0, "{}", report.final_target_rps);
    assert!(report.final_target_rps <= 100.0);
}

#[tokio::test]
async fn adaptive_run_backs_off_to_min_rate_under_errors() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let yaml = format!(
        r#"
target:
  endpoints:
    - name: products
      url: {}/products
load:
  adaptive:
    initialRate: 40
    errorThresholdPercent: 2
    decreasePercent: 50
    minRate: 10
    maxRate: 100
    samplingWindow: 500ms
    stabilizationWindow: 0
  duration: 2s
pool:
  workers: 4
"#,
        server.uri()
    );
    let run = LoadgenConfig::from_yaml_str(&yaml).unwrap().resolve().unwrap();

    let report = LifecycleCoordinator::new(run).run().await.unwrap();

    assert_eq!(report.final_target_rps, 10.0);
    assert_eq!(report.metrics.successful_requests, 0);
}

#[tokio::test]
async fn stop_now_cuts_the_drain_short() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .mount(&server)
        .await;

    let json = format!(
        r#"{{
            "target": {{"endpoints": [{{"name": "slow", "url": "{}/slow"}}]}},
            "load": {{"stages": [{{"duration": "1m", "targetRate": 20}}]}},
            "pool": {{"workers": 2, "queueCapacity": 100, "drainTimeout": "30s"}}
        }}"#,
        server.uri()
    );
    let run = LoadgenConfig::from_json_str(&json).unwrap().resolve().unwrap();

    let coordinator = LifecycleCoordinator::new(run);
    let stop = coordinator.stop_handle();
    let mut state = coordinator.subscribe();
    let handle = tokio::spawn(coordinator.run());

    state
        .wait_for(|s| *s == LifecycleState::Running)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    stop.stop();
    state
        .wait_for(|s| *s == LifecycleState::Stopping)
        .await
        .unwrap();

    let stopped_at = Instant::now();
    stop.stop_now();
    let report = tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    // Only the two in-flight requests are waited for, not the queue.
    assert!(stopped_at.elapsed() < Duration::from_secs(5), "{:?}", stopped_at.elapsed());
    assert_eq!(report.end_reason, EndReason::StopRequested);
    assert!(report.discarded_requests > 0);
    assert_eq!(
        report.metrics.total_requests + report.discarded_requests,
        report.admitted_requests
    );
}

use std::time::Duration;

use loadgen_cli::config::{Config, StageConfig};
use loadgen_cli::loadtest;
use loadgen_cli::thresholds::Check;
use loadgen_test::server::{Behavior, TestServer};
use reqwest::StatusCode;
use tokio_util::sync::CancellationToken;

/// Two seconds at ten requests per second, fast enough to finish within the grace period.
fn short_config(url: String) -> Config {
    let mut config = Config::default();
    config.target.url = url;
    config.target.think_time = Duration::ZERO;
    config.scenario.start_rate = 10.0;
    config.scenario.pre_allocated_workers = 2;
    config.scenario.max_workers = 20;
    config.scenario.grace_period = Duration::from_secs(5);
    config.scenario.seed = Some(7);
    config.scenario.stages = vec![StageConfig {
        duration: Duration::from_secs(2),
        target: 10.0,
    }];
    config
}

#[tokio::test(flavor = "multi_thread")]
async fn healthy_endpoint_passes() {
    loadgen_test::tracing::init();
    let server = TestServer::new().await;
    let config = short_config(server.url("/infer"));

    let report = loadtest::run(&config, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.seed, 7);
    assert_eq!(report.summary.issued, 20);
    assert_eq!(report.summary.succeeded, 20);
    assert_eq!(report.metrics.succeeded, 20);
    assert_eq!(report.metrics.request_duration.count(), 20);
    assert!(report.metrics.bytes_received > 0);
    assert_eq!(server.requests(), 20);
    assert!(report.passed(), "{:?}", report.checks);
}

#[tokio::test(flavor = "multi_thread")]
async fn failing_endpoint_crosses_error_rate() {
    let server = TestServer::with_behavior(Behavior {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        ..Default::default()
    })
    .await;
    let config = short_config(server.url("/infer"));

    let report = loadtest::run(&config, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.metrics.failed, 20);
    assert_eq!(
        report.metrics.errors.get("unexpected status 500 Internal Server Error"),
        Some(&20)
    );
    assert!(!report.passed());
    assert!(matches!(
        report.checks[0],
        Check::ErrorRate { observed, .. } if observed == 1.0
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn plain_text_responses_fail_checks() {
    let server = TestServer::with_behavior(Behavior {
        json: false,
        ..Default::default()
    })
    .await;
    let config = short_config(server.url("/infer"));

    let report = loadtest::run(&config, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.metrics.failed, 20);
    assert!(!report.passed());
}

#[tokio::test(flavor = "multi_thread")]
async fn slow_endpoint_grows_pool_and_crosses_latency() {
    let server = TestServer::with_behavior(Behavior {
        latency: Duration::from_millis(900),
        ..Default::default()
    })
    .await;
    let config = short_config(server.url("/infer"));

    let report = loadtest::run(&config, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.metrics.succeeded, 20);
    // Ten arrivals per second with 900ms each keep about nine requests in flight.
    assert!(report.summary.peak_workers > 2);
    assert!(report.checks[0].passed());
    assert!(!report.checks[1].passed());
}

#[tokio::test(flavor = "multi_thread")]
async fn slow_failing_endpoint_crosses_latency() {
    let server = TestServer::with_behavior(Behavior {
        latency: Duration::from_millis(900),
        status: StatusCode::INTERNAL_SERVER_ERROR,
        ..Default::default()
    })
    .await;
    let config = short_config(server.url("/infer"));

    let report = loadtest::run(&config, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.metrics.failed, 20);
    assert_eq!(report.metrics.request_duration.count(), 20);
    assert!(!report.checks[0].passed());
    let Check::Latency { observed, .. } = report.checks[1] else {
        panic!("expected latency second");
    };
    assert!(observed.is_some_and(|p95| p95 >= Duration::from_millis(800)));
    assert!(!report.checks[1].passed());
}

#[tokio::test(flavor = "multi_thread")]
async fn cancellation_abandons_after_grace_period() {
    let server = TestServer::with_behavior(Behavior {
        latency: Duration::from_secs(30),
        ..Default::default()
    })
    .await;
    let mut config = short_config(server.url("/infer"));
    config.scenario.grace_period = Duration::from_millis(200);

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            cancel.cancel();
        }
    });

    let report = loadtest::run(&config, cancel).await.unwrap();

    assert!(report.summary.cancelled);
    assert!(report.summary.issued < 20);
    assert_eq!(report.metrics.abandoned, report.summary.issued);
    assert!(!report.passed());
}

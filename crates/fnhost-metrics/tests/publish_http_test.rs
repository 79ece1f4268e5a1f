// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Publication against a mock control plane.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fnhost_metrics::transport::{REQUEST_ID_HEADER, SITE_TOKEN_HEADER, USER_AGENT};
use fnhost_metrics::{
    ActivityAggregator, ActivitySnapshot, FunctionActivitySink, HttpMetricsTransport,
    MetricsPublisher, MetricsTransport, PublicationError, PublisherConfig, PublisherEnvironment,
    SiteToken, StandbyState, MIN_ACTIVITY_INTERVAL,
};
use wiremock::matchers::{header, header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const KEY: &[u8] = b"integration-signing-key-0123456789";

fn environment(server: &MockServer) -> PublisherEnvironment {
    PublisherEnvironment {
        hostname: server.address().to_string(),
        container_name: Some("test-container".to_string()),
        skip_ssl_validation: true,
        ..Default::default()
    }
}

fn transport() -> Arc<HttpMetricsTransport> {
    Arc::new(HttpMetricsTransport::new(KEY.to_vec(), Duration::from_secs(5)).unwrap())
}

async fn mount_metrics_endpoint(server: &MockServer, status: u16) {
    Mock::given(method("POST"))
        .and(path("/operations/metrics"))
        .and(header("content-type", "application/json"))
        .and(header("user-agent", USER_AGENT))
        .and(header_exists(REQUEST_ID_HEADER))
        .and(header_exists(SITE_TOKEN_HEADER))
        .respond_with(ResponseTemplate::new(status))
        .mount(server)
        .await;
}

fn publisher_for(server: &MockServer, standby: StandbyState) -> MetricsPublisher {
    let env = environment(server);
    MetricsPublisher::with_environment(
        Arc::new(ActivityAggregator::new()),
        transport(),
        PublisherConfig {
            initial_delay: Duration::from_millis(300),
            interval: Duration::from_secs(60),
        },
        standby,
        move || env.clone(),
    )
}

#[tokio::test]
async fn test_overlapping_invocations_published_once() {
    let server = MockServer::start().await;
    mount_metrics_endpoint(&server, 200).await;

    let publisher = publisher_for(&server, StandbyState::active());

    for id in ["a", "b", "c"] {
        publisher.on_function_started("HttpTrigger", id);
    }
    publisher.on_function_completed("HttpTrigger", "a");
    publisher.on_function_completed("HttpTrigger", "b");
    publisher.on_function_started("HttpTrigger", "d");
    publisher.on_function_completed("HttpTrigger", "c");
    publisher.on_function_completed("HttpTrigger", "d");

    tokio::time::sleep(Duration::from_millis(1000)).await;
    publisher.shutdown().await;

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);

    let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(body["FunctionExecutionCount"], 4);
    assert!(
        body["FunctionExecutionTimeMS"].as_u64().unwrap() >= MIN_ACTIVITY_INTERVAL.as_millis() as u64
    );

    let token = requests[0]
        .headers
        .get(SITE_TOKEN_HEADER)
        .unwrap()
        .to_str()
        .unwrap();
    let expires_at = SiteToken::validate(token, KEY, Utc::now()).unwrap();
    assert!(expires_at > Utc::now() + chrono::Duration::minutes(4));
}

#[tokio::test]
async fn test_no_activity_means_no_request() {
    let server = MockServer::start().await;
    mount_metrics_endpoint(&server, 200).await;

    let env = environment(&server);
    let publisher = MetricsPublisher::with_environment(
        Arc::new(ActivityAggregator::new()),
        transport(),
        PublisherConfig {
            initial_delay: Duration::from_millis(50),
            interval: Duration::from_millis(100),
        },
        StandbyState::active(),
        move || env.clone(),
    );

    tokio::time::sleep(Duration::from_millis(600)).await;
    publisher.shutdown().await;

    assert!(publisher.ticks() >= 3);
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_standby_activity_dropped_until_specialized() {
    let server = MockServer::start().await;
    mount_metrics_endpoint(&server, 200).await;

    let standby = StandbyState::new(true);
    let publisher = publisher_for(&server, standby.clone());

    publisher.on_function_started("Queue", "before");
    publisher.on_function_completed("Queue", "before");
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(server.received_requests().await.unwrap().is_empty());

    standby.end_standby();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(publisher.is_initialized());

    publisher.on_function_started("Queue", "after");
    publisher.on_function_completed("Queue", "after");
    tokio::time::sleep(Duration::from_millis(800)).await;
    publisher.shutdown().await;

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(body["FunctionExecutionCount"], 1);
}

#[tokio::test]
async fn test_non_success_status_reported() {
    let server = MockServer::start().await;
    mount_metrics_endpoint(&server, 503).await;

    let report = ActivitySnapshot {
        function_execution_time_ms: 250,
        function_execution_count: 2,
    };
    let err = transport()
        .publish(&report, &environment(&server))
        .await
        .unwrap_err();

    assert!(matches!(err, PublicationError::Status { status: 503 }));
    assert_eq!(err.to_string(), "Metrics publish call failed (status=503)");
}

#[tokio::test]
async fn test_unreachable_endpoint_is_transport_error() {
    let env = PublisherEnvironment {
        hostname: "127.0.0.1:1".to_string(),
        skip_ssl_validation: true,
        ..Default::default()
    };
    let report = ActivitySnapshot {
        function_execution_time_ms: 100,
        function_execution_count: 1,
    };

    let err = transport().publish(&report, &env).await.unwrap_err();
    assert!(matches!(err, PublicationError::Transport(_)));
}

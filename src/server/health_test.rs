//! Tests for health and metrics endpoints

use super::*;
use crate::server::metrics::create_metrics;
use std::net::SocketAddr;
use std::time::Duration;

fn addr(port: u16) -> SocketAddr {
    format!("127.0.0.1:{}", port).parse().expect("valid addr")
}

#[test]
fn bind_address_parsing() {
    assert_eq!(
        parse_bind_address(":8080"),
        Some("0.0.0.0:8080".parse().unwrap())
    );
    assert_eq!(
        parse_bind_address("127.0.0.1:9090"),
        Some("127.0.0.1:9090".parse().unwrap())
    );
    assert_eq!(
        parse_bind_address("8081"),
        Some("0.0.0.0:8081".parse().unwrap())
    );
    assert_eq!(parse_bind_address(""), None);
    assert_eq!(parse_bind_address("not-an-address"), None);
}

#[tokio::test]
async fn healthz_returns_200() {
    let readiness = ReadinessState::new();
    let bind = addr(18080);

    let server_readiness = readiness.clone();
    let server = tokio::spawn(async move {
        let _ = run_health_server(bind, server_readiness, None).await;
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let response = reqwest::Client::new()
        .get(format!("http://{}/healthz", bind))
        .timeout(Duration::from_secs(5))
        .send()
        .await
        .expect("health server should respond");
    assert_eq!(response.status(), 200);

    server.abort();
}

#[tokio::test]
async fn readyz_tracks_readiness_state() {
    let readiness = ReadinessState::new();
    let bind = addr(18081);

    let server_readiness = readiness.clone();
    let server = tokio::spawn(async move {
        let _ = run_health_server(bind, server_readiness, None).await;
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let client = reqwest::Client::new();
    let url = format!("http://{}/readyz", bind);

    let response = client.get(&url).send().await.expect("should respond");
    assert_eq!(response.status(), 503, "not ready until set_ready()");

    readiness.set_ready();
    let response = client.get(&url).send().await.expect("should respond");
    assert_eq!(response.status(), 200);

    readiness.set_not_ready();
    let response = client.get(&url).send().await.expect("should respond");
    assert_eq!(response.status(), 503, "not ready again during shutdown");

    server.abort();
}

#[tokio::test]
async fn metrics_endpoint_serves_prometheus_text() {
    let readiness = ReadinessState::new();
    let metrics = create_metrics().expect("metrics registry");
    metrics.record_reconciliation_success(0.05);
    let bind = addr(18082);

    let server_readiness = readiness.clone();
    let server_metrics = metrics.clone();
    let server = tokio::spawn(async move {
        let _ = run_health_server(bind, server_readiness, Some(server_metrics)).await;
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let response = reqwest::Client::new()
        .get(format!("http://{}/metrics", bind))
        .send()
        .await
        .expect("should respond");
    assert_eq!(response.status(), 200);
    let body = response.text().await.expect("body");
    assert!(body.contains("gateway_cd_reconciliations_total"));

    server.abort();
}

//! # Drain Integration Tests
//!
//! Shutdown behaviour seen from the outside: late requests are refused with
//! 503, finished work lets the server stop early, and open streams are
//! force-closed at the grace deadline.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tower::ServiceExt;

use common::{echo_routes, gateway, server_config, spawn_gateway, MockBackend};
use edge_gateway::DrainOutcome;

#[tokio::test]
async fn test_requests_after_draining_get_503() {
    let backend = MockBackend::new();
    let server = gateway(echo_routes(backend.clone()), &server_config());
    let app = server.app();

    assert!(server.drain_controller().begin_draining());

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/echo/say")
                .body(Body::from(r#"{"message":"late"}"#))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(backend.calls(), 0);
}

#[tokio::test]
async fn test_idle_gateway_stops_without_waiting_for_deadline() {
    let backend = MockBackend::new();
    let mut config = server_config();
    config.drain_timeout = Duration::from_secs(30);
    let gateway = spawn_gateway(gateway(echo_routes(backend), &config)).await;

    let started = Instant::now();
    gateway.shutdown.cancel();
    let outcome = timeout(Duration::from_secs(10), gateway.handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert_eq!(outcome, DrainOutcome::Completed);
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn test_open_stream_is_force_closed_and_late_requests_refused() {
    let backend = MockBackend::new();
    let mut config = server_config();
    config.drain_timeout = Duration::from_millis(500);
    let gateway = spawn_gateway(gateway(echo_routes(backend.clone()), &config)).await;

    let client = Client::builder(TokioExecutor::new()).build_http::<Empty<Bytes>>();
    let uri: axum::http::Uri = format!("http://{}/echo/hang", gateway.addr).parse().unwrap();

    let response = client.get(uri.clone()).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let mut stream = response.into_body();
    let first = stream.frame().await.unwrap().unwrap().into_data().unwrap();
    assert!(first.starts_with(b"{\"result\""));

    let started = Instant::now();
    gateway.shutdown.cancel();

    // The listener stays up while draining and answers new work with 503
    tokio::time::sleep(Duration::from_millis(100)).await;
    let late = client.get(uri).await.unwrap();
    assert_eq!(late.status(), StatusCode::SERVICE_UNAVAILABLE);

    let outcome = timeout(Duration::from_secs(10), gateway.handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(outcome, DrainOutcome::ForceClosed { remaining: 1 });
    assert!(started.elapsed() >= Duration::from_millis(500));
    assert!(backend.wait_cancelled(Duration::from_secs(1)).await);

    // The stream ends once force-closed
    let rest = timeout(Duration::from_secs(2), stream.collect()).await.unwrap();
    assert!(rest.is_ok());
}

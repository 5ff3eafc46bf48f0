//! Integration tests for the plain HTTP endpoints sharing the gRPC port.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::TestServer;
use serde_json::Value;
use tower::ServiceExt;

async fn get(router: &axum::Router, uri: &str) -> (StatusCode, Vec<u8>) {
    let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, body.to_vec())
}

#[tokio::test]
async fn test_home_and_fallback() {
    let server = TestServer::new().await;

    let (status, body) = get(&server.router, "/").await;
    assert_eq!(status, StatusCode::OK);
    assert!(String::from_utf8(body).unwrap().contains("--remote_cache"));

    let (status, body) = get(&server.router, "/some/unknown/path").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, larder_server::handlers::INFO_TEXT.as_bytes());
}

#[tokio::test]
async fn test_health() {
    let server = TestServer::new().await;

    let (status, body) = get(&server.router, "/health").await;
    assert_eq!(status, StatusCode::OK);
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["status"], "ok");
    assert_eq!(json["backend"], "filesystem");
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let server = TestServer::new().await;
    let running = server.spawn().await;
    running
        .cas()
        .find_missing_blobs(larder_server::proto::reapi::FindMissingBlobsRequest::default())
        .await
        .unwrap();

    let (status, body) = get(&server.router, "/metrics").await;
    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8(body).unwrap();
    assert!(text.contains("larder_requests_total"));
}

#[tokio::test]
async fn test_metrics_disabled_falls_back_to_home() {
    let server = TestServer::with_config(|config| {
        config.server.metrics_enabled = false;
    })
    .await;

    let (status, body) = get(&server.router, "/metrics").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, larder_server::handlers::INFO_TEXT.as_bytes());
}

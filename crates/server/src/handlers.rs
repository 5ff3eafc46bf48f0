//! Plain HTTP handlers served next to the gRPC services.

use crate::state::AppState;
use axum::Json;
use axum::extract::State;
use serde::Serialize;

/// Text returned for `/` and any unknown path.
pub const INFO_TEXT: &str = "Larder remote build cache.\n\
Point Bazel at this address with --remote_cache=grpc://<host>:<port>\n";

/// GET / and fallback.
pub async fn home() -> &'static str {
    INFO_TEXT
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub backend: &'static str,
}

/// GET /health
///
/// Reports liveness only; backend connectivity is verified once at startup.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        backend: state.cache.backend().backend_name(),
    })
}

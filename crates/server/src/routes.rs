//! Route configuration.
//!
//! One listener serves both protocols: requests with a gRPC content type go
//! to the tonic services, everything else to the plain HTTP router.

use crate::handlers;
use crate::metrics::metrics_handler;
use crate::services::grpc_routes;
use crate::state::AppState;
use axum::Router;
use axum::extract::Request;
use axum::http::header::CONTENT_TYPE;
use axum::routing::get;
use tower::ServiceExt;
use tower_http::trace::TraceLayer;

/// Whether a request carries a gRPC payload.
pub fn is_grpc(request: &Request) -> bool {
    request
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("application/grpc"))
}

/// Router for the REAPI gRPC services.
pub fn grpc_router(state: &AppState) -> Router {
    grpc_routes(state.cache.clone(), &state.config.server)
        .into_axum_router()
        .layer(TraceLayer::new_for_grpc())
}

/// Router for the plain HTTP endpoints.
pub fn http_router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/", get(handlers::home))
        .route("/health", get(handlers::health));

    if state.config.server.metrics_enabled {
        router = router.route("/metrics", get(metrics_handler));
    }

    router
        .fallback(handlers::home)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let grpc = grpc_router(&state);
    let http = http_router(state);

    let dispatch = tower::service_fn(move |request: Request| {
        let target = if is_grpc(&request) {
            grpc.clone()
        } else {
            http.clone()
        };
        async move { target.oneshot(request).await }
    });
    Router::new().fallback_service(dispatch)
}

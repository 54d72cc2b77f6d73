//! The HTTP edge: axum router, CORS, and the single error-to-status
//! translation. Nothing below this module builds an HTTP response.

pub mod handlers;
pub mod middleware;

use crate::pipeline::{GuidanceCore, GuidancePipeline};
use axum::http::{header, HeaderValue, Method};
use axum::routing::{delete, get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

/// Build the application router over an assembled core.
pub fn router(core: Arc<GuidanceCore>) -> Router {
    let pipeline = GuidancePipeline::new(core.clone());

    Router::new()
        .route("/guidance", post(handlers::guidance))
        .route("/admin/role", get(handlers::admin_role))
        .route("/admin/budget/{user_id}", post(handlers::admin_set_budget))
        .route("/admin/block/{user_id}", delete(handlers::admin_unblock))
        .route("/health", get(handlers::health))
        .layer(axum::middleware::from_fn(middleware::scoped_id_guard))
        .layer(cors_layer(&core.config.cors_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(pipeline)
}

/// CORS per the edge contract: configured origins, credentials, the full
/// method set, and the request headers the frontends send.
fn cors_layer(origins: &[String]) -> CorsLayer {
    let methods = [
        Method::GET,
        Method::POST,
        Method::PUT,
        Method::DELETE,
        Method::OPTIONS,
    ];
    let headers = [
        header::CONTENT_TYPE,
        header::AUTHORIZATION,
        header::HeaderName::from_static("x-request-id"),
        header::HeaderName::from_static("x-user-id"),
        header::HeaderName::from_static("x-user-email"),
        header::HeaderName::from_static("x-session-id"),
    ];

    // A wildcard origin cannot carry credentials; explicit origins can.
    if origins.iter().any(|o| o == "*") {
        CorsLayer::new()
            .allow_origin(AllowOrigin::any())
            .allow_methods(methods)
            .allow_headers(headers)
    } else {
        let parsed: Vec<HeaderValue> = origins
            .iter()
            .filter_map(|o| o.parse::<HeaderValue>().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(parsed)
            .allow_credentials(true)
            .allow_methods(methods)
            .allow_headers(headers)
    }
}

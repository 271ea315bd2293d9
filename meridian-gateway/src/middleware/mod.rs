//! # Middleware
//!
//! Generic HTTP concerns that wrap every route: request logging, metrics
//! recording, and CORS. Ingress authentication lives in `crate::auth` since
//! it needs to reject requests before any of these run and carries its own
//! extractor type (`IngressCredential`).

use std::time::Instant;

use axum::body::Body;
use axum::extract::State;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::Response;
use tower_http::cors::{Any, CorsLayer};

use crate::config::CorsConfig;
use crate::request_context::RequestContext;
use crate::server::SharedState;

/// Generates a request id, stashes a [`RequestContext`] in extensions for
/// downstream handlers/middleware, and logs method/uri/status/latency once
/// the response comes back. Sets `X-Request-ID` on the response so a caller
/// can correlate their request with server-side logs.
pub async fn logging_middleware(State(_shared): State<SharedState>, mut req: Request<Body>, next: Next) -> Response {
    let request_id = uuid::Uuid::new_v4().to_string();
    let ctx = RequestContext::new(request_id.clone());
    req.extensions_mut().insert(ctx.clone());

    let method = req.method().clone();
    let uri = req.uri().clone();

    let mut response = next.run(req).await;

    let latency = ctx.duration();
    let status = response.status();
    tracing::info!(
        request_id = %request_id,
        method = %method,
        uri = %uri,
        status = %status,
        latency_ms = latency.as_millis(),
        "request processed"
    );

    if let Ok(value) = axum::http::HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

/// Records every request into `state.metrics`, skipping `/metrics` and
/// `/health` so the sink doesn't measure itself.
pub async fn metrics_middleware(State(shared): State<SharedState>, req: Request<Body>, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().to_string();
    let path = req.uri().path().to_string();

    let response = next.run(req).await;

    if path != "/metrics" && path != "/health" {
        shared
            .current()
            .metrics
            .record_request(&method, &path, response.status().as_u16(), start.elapsed());
    }

    response
}

/// Builds the `CorsLayer` from `CorsConfig`. A literal `"*"` in
/// `allowed_origins` permits any origin; otherwise only the listed origins
/// are echoed back.
pub fn cors_middleware(cors_config: &CorsConfig) -> CorsLayer {
    let mut cors = CorsLayer::new().allow_methods(Any).allow_headers(Any);

    if cors_config.allowed_origins.iter().any(|o| o == "*") {
        cors = cors.allow_origin(Any);
    } else {
        let origins: Vec<axum::http::HeaderValue> = cors_config
            .allowed_origins
            .iter()
            .filter_map(|o| axum::http::HeaderValue::from_str(o).ok())
            .collect();
        cors = cors.allow_origin(origins);
    }

    if cors_config.allow_credentials {
        cors = cors.allow_credentials(true);
    }

    cors
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cors_middleware_builds_without_panicking_on_wildcard() {
        let config = CorsConfig {
            allowed_origins: vec!["*".to_string()],
            allow_credentials: false,
        };
        let _layer = cors_middleware(&config);
    }

    #[test]
    fn cors_middleware_builds_with_explicit_origin_list() {
        let config = CorsConfig {
            allowed_origins: vec!["https://example.com".to_string()],
            allow_credentials: true,
        };
        let _layer = cors_middleware(&config);
    }
}

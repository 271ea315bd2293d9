//! # Ingress Authentication
//!
//! Validates the credential a caller presents before a request ever reaches
//! the dispatch core. Three modes, selected by `AuthConfig::mode`:
//!
//! - `SharedKey` — the caller must present `x-api-key: <shared_key>`.
//! - `TransparentBearer` — the caller must present an `Authorization: Bearer`
//!   token, which is later forwarded to providers that support transparent
//!   auth (see `meridian_core::providers::http_client::AuthStrategy::Transparent`).
//! - `Both` — either credential is accepted.
//!
//! This is deliberately not a user/session system: the gateway has no notion
//! of individual end users, only "is this caller allowed to use the gateway
//! at all." Per-provider credentials live in `ProviderConfig`/`KeyPool`, not here.

use axum::body::Body;
use axum::extract::State;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::config::IngressAuthMode;
use crate::gateway_error::GatewayError;
use crate::server::{AppState, SharedState};

/// The credential a caller presented, if any, independent of which mode
/// validated it. Forwarded to `meridian_core::DispatchRequest::ingress_bearer`
/// only when it came from a bearer token, never from the shared key.
pub struct IngressCredential {
    pub bearer: Option<String>,
}

fn extract_shared_key(req: &Request<Body>) -> Option<&str> {
    req.headers().get("x-api-key")?.to_str().ok()
}

fn extract_bearer(req: &Request<Body>) -> Option<&str> {
    let value = req.headers().get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
    value.strip_prefix("Bearer ")
}

/// Checks the incoming request against the configured `AuthConfig` and, on
/// success, returns the credential that validated so handlers can forward a
/// transparent bearer token without re-parsing headers.
fn authenticate(req: &Request<Body>, state: &AppState) -> Result<IngressCredential, GatewayError> {
    match state.config.auth.mode {
        IngressAuthMode::SharedKey => {
            let expected = state.config.auth.shared_key.as_deref().unwrap_or("");
            match extract_shared_key(req) {
                Some(key) if key == expected => Ok(IngressCredential { bearer: None }),
                _ => Err(GatewayError::Unauthorized {
                    message: "missing or invalid x-api-key".to_string(),
                }),
            }
        }
        IngressAuthMode::TransparentBearer => match extract_bearer(req) {
            Some(token) => Ok(IngressCredential {
                bearer: Some(token.to_string()),
            }),
            None => Err(GatewayError::Unauthorized {
                message: "missing Authorization: Bearer token".to_string(),
            }),
        },
        IngressAuthMode::Both => {
            let expected = state.config.auth.shared_key.as_deref().unwrap_or("");
            if let Some(key) = extract_shared_key(req) {
                if key == expected {
                    return Ok(IngressCredential { bearer: None });
                }
            }
            if let Some(token) = extract_bearer(req) {
                return Ok(IngressCredential {
                    bearer: Some(token.to_string()),
                });
            }
            Err(GatewayError::Unauthorized {
                message: "missing x-api-key or Authorization: Bearer token".to_string(),
            })
        }
    }
}

/// axum middleware: rejects unauthenticated requests before they reach a
/// handler, and stashes the validated [`IngressCredential`] in extensions.
/// CORS preflight (`OPTIONS`) and the unauthenticated admin surface
/// (`/health`, `/v1/models`, `/v1/providers`) bypass this check entirely.
pub async fn auth_middleware(State(shared): State<SharedState>, mut req: Request<Body>, next: Next) -> Response {
    if req.method() == axum::http::Method::OPTIONS {
        return next.run(req).await;
    }

    let path = req.uri().path();
    if path == "/health" || path == "/v1/models" || path == "/v1/providers" || path == "/metrics" {
        return next.run(req).await;
    }

    let state = shared.current();
    match authenticate(&req, &state) {
        Ok(credential) => {
            req.extensions_mut().insert(credential);
            next.run(req).await
        }
        Err(err) => {
            tracing::warn!(path = %req.uri().path(), "ingress authentication rejected");
            err.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use axum::http::header::{HeaderValue, AUTHORIZATION};
    use std::sync::Arc;

    fn state_with_mode(mode: IngressAuthMode, shared_key: Option<&str>) -> AppState {
        let mut config = Config::default();
        config.auth.mode = mode;
        config.auth.shared_key = shared_key.map(|s| s.to_string());
        AppState::for_testing(Arc::new(config))
    }

    fn request_with_headers(headers: Vec<(&str, &str)>) -> Request<Body> {
        let mut builder = Request::builder().uri("/v1/messages");
        for (name, value) in headers {
            builder = builder.header(name, value);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn shared_key_mode_accepts_matching_key() {
        let state = state_with_mode(IngressAuthMode::SharedKey, Some("secret"));
        let req = request_with_headers(vec![("x-api-key", "secret")]);
        assert!(authenticate(&req, &state).is_ok());
    }

    #[test]
    fn shared_key_mode_rejects_wrong_key() {
        let state = state_with_mode(IngressAuthMode::SharedKey, Some("secret"));
        let req = request_with_headers(vec![("x-api-key", "wrong")]);
        assert!(authenticate(&req, &state).is_err());
    }

    #[test]
    fn transparent_bearer_mode_forwards_token() {
        let state = state_with_mode(IngressAuthMode::TransparentBearer, None);
        let mut req = request_with_headers(vec![]);
        req.headers_mut().insert(
            AUTHORIZATION,
            HeaderValue::from_str("Bearer sk-ant-test").unwrap(),
        );
        let credential = authenticate(&req, &state).unwrap();
        assert_eq!(credential.bearer.as_deref(), Some("sk-ant-test"));
    }

    #[test]
    fn both_mode_accepts_either_credential() {
        let state = state_with_mode(IngressAuthMode::Both, Some("secret"));
        let req = request_with_headers(vec![("x-api-key", "secret")]);
        assert!(authenticate(&req, &state).is_ok());

        let mut req2 = request_with_headers(vec![]);
        req2.headers_mut().insert(
            AUTHORIZATION,
            HeaderValue::from_str("Bearer sk-ant-test").unwrap(),
        );
        assert!(authenticate(&req2, &state).is_ok());
    }

    #[test]
    fn no_credential_is_rejected() {
        let state = state_with_mode(IngressAuthMode::SharedKey, Some("secret"));
        let req = request_with_headers(vec![]);
        assert!(authenticate(&req, &state).is_err());
    }
}

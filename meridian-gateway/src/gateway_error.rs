//! # Gateway Error Types
//!
//! Wraps `meridian_core::{CoreError, ProviderError}` plus the handful of
//! ingress-only failure modes the core has no concept of (malformed request
//! bodies, ingress auth rejections) and maps all of it onto the Anthropic
//! Messages API's own error envelope:
//!
//! ```json
//! {"type": "error", "error": {"type": "rate_limit_error", "message": "..."}}
//! ```

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use meridian_core::error::{CoreError, ProviderError};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    /// Any failure surfaced by the dispatch core: provider errors, no
    /// healthy providers, exhausted key pools, cache/config problems.
    #[error("{0}")]
    Core(#[from] CoreError),

    /// The request body didn't parse as a `MessagesRequest`, or failed a
    /// validation check before dispatch was ever attempted.
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    /// Ingress auth rejected the request: missing/invalid shared key or
    /// missing/invalid forwarded bearer token, depending on `AuthConfig::mode`.
    #[error("authentication failed: {message}")]
    Unauthorized { message: String },

    /// The client disconnected mid-stream; nothing to report back.
    #[error("request cancelled by client")]
    ClientCancelled,
}

/// `(status, error_type, message)` for one `ProviderError`. `Upstream` passes
/// the provider's own status straight through since it already reflects
/// exactly what the provider said was wrong.
fn provider_error_parts(err: &ProviderError) -> (StatusCode, &'static str, String) {
    match err {
        ProviderError::InvalidCredential => (
            StatusCode::UNAUTHORIZED,
            "authentication_error",
            err.to_string(),
        ),
        ProviderError::ModelNotFound { .. } => {
            (StatusCode::NOT_FOUND, "not_found_error", err.to_string())
        }
        ProviderError::RateLimit | ProviderError::QuotaExceeded => (
            StatusCode::TOO_MANY_REQUESTS,
            "rate_limit_error",
            err.to_string(),
        ),
        ProviderError::ServiceUnavailable | ProviderError::Timeout => (
            StatusCode::SERVICE_UNAVAILABLE,
            "overloaded_error",
            err.to_string(),
        ),
        ProviderError::Upstream { status, message } => {
            let code = StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY);
            (code, "api_error", message.clone())
        }
        ProviderError::Http(_)
        | ProviderError::Network { .. }
        | ProviderError::Serialization(_)
        | ProviderError::InvalidResponse { .. }
        | ProviderError::Configuration { .. }
        | ProviderError::FeatureNotSupported { .. }
        | ProviderError::Signing { .. } => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "api_error",
            err.to_string(),
        ),
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let (status, error_type, message, retry_after) = match &self {
            GatewayError::Core(core_err) => match core_err {
                CoreError::Provider(pe) => {
                    let (status, kind, msg) = provider_error_parts(pe);
                    (status, kind, msg, None)
                }
                CoreError::NoProviders => (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "overloaded_error",
                    core_err.to_string(),
                    None,
                ),
                CoreError::AllProvidersUnhealthy => (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "overloaded_error",
                    core_err.to_string(),
                    Some(5u64),
                ),
                CoreError::KeyPoolExhausted { reset_in_secs, .. } => (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "overloaded_error",
                    core_err.to_string(),
                    Some(*reset_in_secs),
                ),
                CoreError::Cache { .. } | CoreError::Configuration { .. } => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "api_error",
                    core_err.to_string(),
                    None,
                ),
                CoreError::AllAttemptsFailed { last_error } => (
                    StatusCode::BAD_GATEWAY,
                    "api_error",
                    last_error.clone(),
                    None,
                ),
                CoreError::Cancelled => (
                    StatusCode::from_u16(499).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
                    "api_error",
                    core_err.to_string(),
                    None,
                ),
            },
            GatewayError::InvalidRequest { message } => (
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                message.clone(),
                None,
            ),
            GatewayError::Unauthorized { message } => (
                StatusCode::UNAUTHORIZED,
                "authentication_error",
                message.clone(),
                None,
            ),
            GatewayError::ClientCancelled => (
                StatusCode::from_u16(499).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
                "api_error",
                self.to_string(),
                None,
            ),
        };

        let body = Json(json!({
            "type": "error",
            "error": {
                "type": error_type,
                "message": message,
            }
        }));

        let mut response = (status, body).into_response();
        if let Some(secs) = retry_after {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert("retry-after", value);
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_core::error::CoreError;

    #[tokio::test]
    async fn invalid_request_maps_to_400() {
        let err = GatewayError::InvalidRequest {
            message: "missing model".to_string(),
        };
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn rate_limit_provider_error_maps_to_429() {
        let err = GatewayError::Core(CoreError::Provider(ProviderError::RateLimit));
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn key_pool_exhausted_carries_retry_after() {
        let err = GatewayError::Core(CoreError::KeyPoolExhausted {
            provider: "anthropic".to_string(),
            reset_in_secs: 12,
        });
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers().get("retry-after").unwrap(), "12");
    }

    #[tokio::test]
    async fn model_not_found_maps_to_404() {
        let err = GatewayError::Core(CoreError::Provider(ProviderError::ModelNotFound {
            model: "gpt-5".to_string(),
        }));
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}

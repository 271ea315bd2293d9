//! # Error Handling Module
//!
//! Error taxonomy for the dispatch core: routing, the key pool, the health
//! tracker, the cache abstraction, and the six provider adapters.
//!
//! - [`CoreError`]: errors raised above the provider boundary (routing,
//!   pooling, caching).
//! - [`ProviderError`]: errors raised while talking to a specific backend;
//!   these convert into [`CoreError`] automatically via `#[from]`.
//!
//! The gateway crate layers its own HTTP-facing error type
//! (`meridian_gateway::gateway_error::GatewayError`) on top of both, mapping
//! them onto the Anthropic `{"type":"error","error":{...}}` response shape.

use thiserror::Error;

/// Errors raised by the dispatch core itself, as opposed to a specific
/// provider adapter.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Wrapped provider-specific errors.
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    /// `Router::select` was called with an empty provider list.
    #[error("no providers configured")]
    NoProviders,

    /// Providers are configured, but none passed the health predicate.
    #[error("all providers unhealthy")]
    AllProvidersUnhealthy,

    /// The key pool for a provider has no key with remaining quota.
    #[error("key pool exhausted for provider {provider}, earliest reset in {reset_in_secs}s")]
    KeyPoolExhausted {
        provider: String,
        reset_in_secs: u64,
    },

    /// Cache backend operation failed (connection, serialization, eviction).
    #[error("cache error: {message}")]
    Cache { message: String },

    /// Invalid or missing routing/provider configuration.
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// The parallel race in `Router::select_with_retry` exhausted every
    /// candidate provider.
    #[error("all providers failed, last error: {last_error}")]
    AllAttemptsFailed { last_error: String },

    /// The caller's deadline elapsed, or its cancellation token fired, before
    /// any candidate produced a result.
    #[error("request cancelled")]
    Cancelled,
}

/// Errors from a single provider's proxy adapter.
#[derive(Error, Debug)]
pub enum ProviderError {
    /// HTTP client and network communication errors.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Upstream returned a non-2xx response with a status and body.
    #[error("upstream error {status}: {message}")]
    Upstream { status: u16, message: String },

    /// Invalid or missing API key/credential for this provider.
    #[error("invalid credential")]
    InvalidCredential,

    /// The requested model has no mapping for this provider.
    #[error("model not found: {model}")]
    ModelNotFound { model: String },

    /// Upstream responded 429.
    #[error("rate limit exceeded")]
    RateLimit,

    /// Provider quota exhausted (distinct from a transient rate limit).
    #[error("quota exceeded")]
    QuotaExceeded,

    /// Provider reported 503 or otherwise indicated it is down.
    #[error("service unavailable")]
    ServiceUnavailable,

    /// Request timed out waiting for a response.
    #[error("request timed out")]
    Timeout,

    /// JSON (de)serialization failure while translating request/response bodies.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Upstream response could not be parsed into the expected shape.
    #[error("invalid response format: {message}")]
    InvalidResponse { message: String },

    /// Invalid or missing provider configuration (bad base URL, missing keys).
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// A capability outside Messages-compatible chat was requested.
    #[error("feature not supported: {feature}")]
    FeatureNotSupported { feature: String },

    /// Network/transport-level failure (connection refused, DNS, reset).
    #[error("network error: {message}")]
    Network { message: String },

    /// Credential-signing failure: AWS SigV4 (Bedrock) or a GCP OAuth token
    /// exchange (Vertex).
    #[error("signing error: {message}")]
    Signing { message: String },
}

impl ProviderError {
    /// HTTP status code this error corresponds to, if it carries one.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            ProviderError::Upstream { status, .. } => Some(*status),
            ProviderError::RateLimit => Some(429),
            ProviderError::QuotaExceeded => Some(429),
            ProviderError::InvalidCredential => Some(401),
            ProviderError::ModelNotFound { .. } => Some(404),
            ProviderError::ServiceUnavailable => Some(503),
            _ => None,
        }
    }

    /// Whether this failure should trigger failover to the next provider.
    /// Validation-shaped errors (bad config, unsupported feature, model not
    /// found) are not retryable: retrying against a different provider won't
    /// change the outcome for the same malformed request.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::Http(_)
            | ProviderError::RateLimit
            | ProviderError::QuotaExceeded
            | ProviderError::ServiceUnavailable
            | ProviderError::Timeout
            | ProviderError::Network { .. } => true,
            // Only the status-code trigger set retries; a generic upstream
            // 4xx (400, 422, ...) lands here too and must not trip the
            // breaker the way a 500/502/504 does.
            ProviderError::Upstream { status, .. } => matches!(status, 429 | 500 | 502 | 503 | 504),
            ProviderError::InvalidCredential
            | ProviderError::ModelNotFound { .. }
            | ProviderError::Serialization(_)
            | ProviderError::InvalidResponse { .. }
            | ProviderError::Configuration { .. }
            | ProviderError::FeatureNotSupported { .. }
            | ProviderError::Signing { .. } => false,
        }
    }

    /// Whether this failure wraps a timeout, independent of HTTP status.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ProviderError::Timeout)
            || matches!(self, ProviderError::Http(e) if e.is_timeout())
    }

    /// Whether this failure wraps a network/connection-level error.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, ProviderError::Network { .. })
            || matches!(self, ProviderError::Http(e) if e.is_connect())
    }
}

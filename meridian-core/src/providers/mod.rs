//! # Provider Proxy
//!
//! One adapter per configured backend, each wrapping [`http_client::HttpProviderClient`]
//! with URL construction, auth injection, and (where the backend's wire format
//! isn't already Anthropic Messages) body transformation. [`ProviderAdapter`] is
//! the capability set every adapter implements; concrete variants live in their
//! own module (`anthropic`, `zai`, `ollama`, `bedrock`, `azure`, `vertex`).
//!
//! Shared behavior (client construction, timeout, default headers) is composed
//! through [`http_client::HttpProviderClient`] rather than an inheritance
//! hierarchy — each adapter holds one and layers its own URL/auth/transform
//! logic on top.

pub mod anthropic;
pub mod azure;
pub mod bedrock;
pub mod http_client;
pub mod ollama;
pub mod sse;
pub mod vertex;
pub mod zai;

use std::collections::HashMap;
use std::pin::Pin;

use futures::Stream;
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;
use crate::models::{MessagesRequest, MessagesResponse, StreamEvent};

/// A boxed stream of decoded response events, already translated into the
/// Messages streaming event set regardless of the backend's native framing.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, ProviderError>> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Anthropic,
    #[serde(rename = "zai")]
    ZAi,
    Ollama,
    Bedrock,
    Azure,
    Vertex,
}

/// Identity and capabilities of one configured backend (§3 "Provider
/// descriptor"). Built once at startup (or config reload) and never mutated
/// in place — a reload constructs a fresh descriptor and swaps the adapter.
#[derive(Debug, Clone)]
pub struct ProviderDescriptor {
    pub name: String,
    pub kind: ProviderKind,
    pub base_url: String,
    pub models: Vec<String>,
    pub model_rewrite: HashMap<String, String>,
    pub supports_transparent_auth: bool,
    pub supports_streaming: bool,
    pub requires_body_transform: bool,
}

/// Everything one outbound attempt needs: the parsed request, the raw bytes
/// (so a passthrough adapter can forward the client's body untouched), the
/// resolved credential (when the provider uses configured auth), and the
/// client's own bearer token (for transparent auth).
pub struct OutboundRequest<'a> {
    pub body: &'a MessagesRequest,
    pub raw_body: &'a [u8],
    pub credential: Option<&'a str>,
    pub ingress_bearer: Option<&'a str>,
    pub request_id: &'a str,
}

/// The capability set a Provider Proxy adapter exposes (§9 "Provider
/// polymorphism"): `Authenticate`/`ForwardHeaders` are folded into `send`/
/// `send_stream` (the adapter owns its own `HttpProviderClient` and auth
/// strategy), `TransformRequest`/`TransformResponse` happen inside those same
/// methods, and the rest are plain descriptor lookups.
#[async_trait::async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn descriptor(&self) -> &ProviderDescriptor;

    fn name(&self) -> &str {
        &self.descriptor().name
    }

    fn supports_streaming(&self) -> bool {
        self.descriptor().supports_streaming
    }

    fn supports_transparent_auth(&self) -> bool {
        self.descriptor().supports_transparent_auth
    }

    fn requires_body_transform(&self) -> bool {
        self.descriptor().requires_body_transform
    }

    /// Content type the backend's native streaming response carries; the
    /// gateway always speaks SSE to the client regardless of this value, but
    /// `send_stream` uses it to decide whether the body itself needs framing
    /// translation on the way in (Bedrock Event-Stream vs. plain SSE).
    fn streaming_content_type(&self) -> &str {
        "text/event-stream"
    }

    fn list_models(&self) -> &[String] {
        &self.descriptor().models
    }

    /// Rewrite a client-facing model name to whatever this backend expects,
    /// per the descriptor's rewrite table; unmapped names pass through.
    fn map_model(&self, model: &str) -> String {
        self.descriptor()
            .model_rewrite
            .get(model)
            .cloned()
            .unwrap_or_else(|| model.to_string())
    }

    /// Perform one non-streaming request against this backend, returning the
    /// parsed Messages-format response and the raw response headers (so the
    /// caller can feed rate-limit headers to the key pool).
    async fn send(&self, req: OutboundRequest<'_>) -> Result<(MessagesResponse, HeaderMap), ProviderError>;

    /// Perform one streaming request, returning a stream of Messages SSE
    /// events and the response headers observed before the first chunk.
    async fn send_stream(&self, req: OutboundRequest<'_>) -> Result<(EventStream, HeaderMap), ProviderError>;
}

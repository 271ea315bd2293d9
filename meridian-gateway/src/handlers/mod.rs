//! # HTTP Handlers
//!
//! The six routes the gateway serves. `post_messages` is the only one that
//! talks to the dispatch core for real work; the rest expose read-only
//! introspection over what the core already tracks.

use std::convert::Infallible;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderValue, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Json, Response};
use axum::Extension;
use futures::stream::{Stream, StreamExt};
use meridian_core::{DispatchRequest, MessagesRequest, RoutingStrategy, StreamEvent};
use serde_json::json;

use crate::auth::IngressCredential;
use crate::gateway_error::GatewayError;
use crate::request_context::RequestContext;
use crate::server::SharedState;

const STRATEGY_HEADER: &str = "x-gateway-strategy";
const PROVIDER_HEADER: &str = "x-gateway-provider";

fn strategy_label(strategy: &RoutingStrategy) -> &'static str {
    match strategy {
        RoutingStrategy::RoundRobin => "round_robin",
        RoutingStrategy::WeightedRoundRobin => "weighted_round_robin",
        RoutingStrategy::Shuffle => "shuffle",
        RoutingStrategy::Failover => "failover",
        RoutingStrategy::WeightedFailover => "weighted_failover",
        RoutingStrategy::LeastLoaded => "least_loaded",
        RoutingStrategy::ModelBased { .. } => "model_based",
    }
}

fn insert_debug_headers(response: &mut Response, provider: &str, strategy: &'static str) {
    if let Ok(value) = HeaderValue::from_str(provider) {
        response.headers_mut().insert(PROVIDER_HEADER, value);
    }
    response
        .headers_mut()
        .insert(STRATEGY_HEADER, HeaderValue::from_static(strategy));
}

/// Overrides/adds the SSE-framing headers §4.6 item 5 requires beyond what
/// `axum::response::sse::Sse` sets on its own (`Content-Type` and a plain
/// `no-cache` `Cache-Control`): `no-transform`, keep-alive, and disabling
/// proxy buffering so events flush as they're produced.
fn insert_sse_headers(response: &mut Response) {
    let headers = response.headers_mut();
    headers.insert(
        axum::http::header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-transform"),
    );
    headers.insert(axum::http::header::CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
}

fn stream_event_name(event: &StreamEvent) -> &'static str {
    match event {
        StreamEvent::MessageStart { .. } => "message_start",
        StreamEvent::ContentBlockStart { .. } => "content_block_start",
        StreamEvent::ContentBlockDelta { .. } => "content_block_delta",
        StreamEvent::ContentBlockStop { .. } => "content_block_stop",
        StreamEvent::MessageDelta { .. } => "message_delta",
        StreamEvent::MessageStop => "message_stop",
        StreamEvent::Ping => "ping",
    }
}

fn validate_request(body: &MessagesRequest) -> Result<(), GatewayError> {
    if body.messages.is_empty() {
        return Err(GatewayError::InvalidRequest {
            message: "messages must not be empty".to_string(),
        });
    }
    if body.max_tokens == 0 {
        return Err(GatewayError::InvalidRequest {
            message: "max_tokens must be greater than zero".to_string(),
        });
    }
    Ok(())
}

/// `POST /v1/messages` — the one proxied endpoint. Parses the body as a
/// Messages request, dispatches it through the core (streamed or not,
/// depending on `stream`), and attaches `X-Gateway-Strategy`/
/// `X-Gateway-Provider` when `server.debug_headers` is set.
pub async fn post_messages(
    State(shared): State<SharedState>,
    credential: Option<Extension<IngressCredential>>,
    ctx: Option<Extension<RequestContext>>,
    raw_body: Bytes,
) -> Result<Response, GatewayError> {
    let state = shared.current();
    let body: MessagesRequest = serde_json::from_slice(&raw_body).map_err(|e| GatewayError::InvalidRequest {
        message: format!("invalid request body: {e}"),
    })?;
    validate_request(&body)?;

    let request_id = ctx
        .as_ref()
        .map(|Extension(c)| c.request_id.clone())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let bearer = credential.and_then(|Extension(c)| c.bearer);
    let wants_stream = body.wants_stream();

    let dispatch_req = DispatchRequest {
        body,
        raw_body: &raw_body,
        ingress_bearer: bearer.as_deref(),
        request_id: &request_id,
    };

    let debug_headers = state.config.server.debug_headers;
    let strategy = strategy_label(&state.config.routing.to_core_strategy());

    if wants_stream {
        let outcome = state.dispatch.dispatch_stream(dispatch_req).await?;
        state.metrics.record_provider_request(&outcome.provider);

        let provider = outcome.provider;
        let sse_stream = to_sse_stream(outcome.value);
        let mut response = Sse::new(sse_stream).into_response();
        insert_sse_headers(&mut response);
        if debug_headers {
            insert_debug_headers(&mut response, &provider, strategy);
        }
        Ok(response)
    } else {
        let outcome = state.dispatch.dispatch(dispatch_req).await?;
        state.metrics.record_provider_request(&outcome.provider);

        let mut response = (StatusCode::OK, Json(outcome.value)).into_response();
        if debug_headers {
            insert_debug_headers(&mut response, &outcome.provider, strategy);
        }
        Ok(response)
    }
}

/// Wraps the core's `Result<StreamEvent, ProviderError>` stream as SSE. An
/// upstream error midstream ends the stream rather than surfacing as an
/// error response — the status and headers are already on the wire by then.
fn to_sse_stream(
    mut inner: meridian_core::providers::EventStream,
) -> impl Stream<Item = Result<Event, Infallible>> {
    async_stream::stream! {
        while let Some(item) = inner.next().await {
            match item {
                Ok(event) => {
                    let name = stream_event_name(&event);
                    match serde_json::to_string(&event) {
                        Ok(data) => yield Ok(Event::default().event(name).data(data)),
                        Err(e) => {
                            tracing::error!(error = %e, "failed to serialize stream event");
                            break;
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "stream terminated by upstream error");
                    break;
                }
            }
        }
    }
}

/// `GET /v1/models` — union of models advertised by every enabled provider.
pub async fn list_models(State(shared): State<SharedState>) -> Json<serde_json::Value> {
    let state = shared.current();
    Json(json!({ "models": state.dispatch.models() }))
}

/// `GET /v1/providers` — names of every enabled provider.
pub async fn list_providers(State(shared): State<SharedState>) -> Json<serde_json::Value> {
    let state = shared.current();
    Json(json!({ "providers": state.dispatch.provider_names() }))
}

/// `GET /health` — plain liveness check, no auth required.
pub async fn health_check() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// `GET /v1/health-detail` — per-provider circuit breaker state.
pub async fn health_detail(
    State(shared): State<SharedState>,
) -> Json<std::collections::HashMap<String, meridian_core::health::HealthSnapshot>> {
    let state = shared.current();
    Json(state.dispatch.health().snapshot().await)
}

/// `GET /metrics` — Prometheus text exposition combining request/latency
/// counters with live provider health gauges.
pub async fn metrics_handler(State(shared): State<SharedState>) -> Response {
    let state = shared.current();
    let mut body = state.metrics.render();

    body.push_str(
        "# HELP meridian_provider_healthy Whether the circuit breaker currently admits traffic for a provider.\n",
    );
    body.push_str("# TYPE meridian_provider_healthy gauge\n");
    let snapshot = state.dispatch.health().snapshot().await;
    for (provider, health) in &snapshot {
        let healthy = if matches!(health.state, meridian_core::HealthState::Open) { 0 } else { 1 };
        body.push_str(&format!("meridian_provider_healthy{{provider=\"{provider}\"}} {healthy}\n"));
    }

    body.push_str(
        "# HELP meridian_provider_consecutive_failures Consecutive retryable failures observed for a provider.\n",
    );
    body.push_str("# TYPE meridian_provider_consecutive_failures gauge\n");
    for (provider, health) in &snapshot {
        body.push_str(&format!(
            "meridian_provider_consecutive_failures{{provider=\"{provider}\"}} {}\n",
            health.consecutive_failures
        ));
    }

    (StatusCode::OK, [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")], body).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_request_rejects_empty_messages() {
        let body = MessagesRequest {
            model: "claude-opus-4-5".to_string(),
            messages: vec![],
            max_tokens: 1024,
            system: None,
            stream: None,
            temperature: None,
            top_p: None,
            top_k: None,
            stop_sequences: None,
            tools: None,
            tool_choice: None,
            thinking: None,
            metadata: None,
            extra: std::collections::HashMap::new(),
        };
        assert!(validate_request(&body).is_err());
    }

    #[test]
    fn validate_request_rejects_zero_max_tokens() {
        let body = MessagesRequest {
            model: "claude-opus-4-5".to_string(),
            messages: vec![meridian_core::models::InputMessage {
                role: meridian_core::models::Role::User,
                content: meridian_core::models::MessageContent::Text("hi".to_string()),
            }],
            max_tokens: 0,
            system: None,
            stream: None,
            temperature: None,
            top_p: None,
            top_k: None,
            stop_sequences: None,
            tools: None,
            tool_choice: None,
            thinking: None,
            metadata: None,
            extra: std::collections::HashMap::new(),
        };
        assert!(validate_request(&body).is_err());
    }

    #[test]
    fn strategy_label_covers_every_variant() {
        assert_eq!(strategy_label(&RoutingStrategy::RoundRobin), "round_robin");
        assert_eq!(strategy_label(&RoutingStrategy::Failover), "failover");
        assert_eq!(
            strategy_label(&RoutingStrategy::ModelBased {
                model_mapping: std::collections::HashMap::new(),
                default_provider: None,
            }),
            "model_based"
        );
    }

    #[test]
    fn stream_event_name_matches_wire_tag() {
        assert_eq!(stream_event_name(&StreamEvent::MessageStop), "message_stop");
        assert_eq!(stream_event_name(&StreamEvent::Ping), "ping");
    }
}

//! Anthropic's own `/v1/messages` endpoint. The wire format is already the
//! dispatch core's canonical representation, so this adapter needs no body
//! transform — it forwards the (possibly model-rewritten) request verbatim
//! and parses the response straight into [`MessagesResponse`].

use std::collections::HashMap;

use reqwest::header::HeaderMap;
use std::time::Duration;

use crate::error::ProviderError;
use crate::models::{MessagesRequest, MessagesResponse};
use crate::providers::http_client::{AuthStrategy, HttpProviderClient};
use crate::providers::{EventStream, OutboundRequest, ProviderAdapter, ProviderDescriptor, ProviderKind};

use super::sse::decode_anthropic_sse;

pub struct AnthropicProvider {
    http: HttpProviderClient,
    descriptor: ProviderDescriptor,
}

impl AnthropicProvider {
    pub fn new(
        name: impl Into<String>,
        base_url: Option<String>,
        api_key: Option<String>,
        transparent_auth: bool,
        model_rewrite: HashMap<String, String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let mut headers = HashMap::new();
        headers.insert("anthropic-version".to_string(), "2023-06-01".to_string());

        let auth = match (&api_key, transparent_auth) {
            (_, true) => AuthStrategy::Transparent,
            (Some(key), false) => AuthStrategy::Header {
                name: "x-api-key".to_string(),
                value: key.clone(),
            },
            (None, false) => AuthStrategy::None,
        };

        let http = HttpProviderClient::new(timeout, base_url, "https://api.anthropic.com", &headers, auth)?;

        Ok(Self {
            http,
            descriptor: ProviderDescriptor {
                name: name.into(),
                kind: ProviderKind::Anthropic,
                base_url: http.base_url().to_string(),
                models: vec![
                    "claude-opus-4-20250514".to_string(),
                    "claude-sonnet-4-20250514".to_string(),
                    "claude-3-7-sonnet-20250219".to_string(),
                    "claude-3-5-sonnet-20241022".to_string(),
                    "claude-3-5-haiku-20241022".to_string(),
                ],
                model_rewrite,
                supports_transparent_auth: true,
                supports_streaming: true,
                requires_body_transform: false,
            },
        })
    }

    fn rewritten_body(&self, body: &MessagesRequest) -> MessagesRequest {
        let mut out = body.clone();
        out.model = self.map_model(&body.model);
        out
    }
}

#[async_trait::async_trait]
impl ProviderAdapter for AnthropicProvider {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    async fn send(&self, req: OutboundRequest<'_>) -> Result<(MessagesResponse, HeaderMap), ProviderError> {
        let body = self.rewritten_body(req.body);
        let credential_header = req.credential.map(|c| ("x-api-key", c));
        let resp = self
            .http
            .post_json_raw_with_credential("/v1/messages", &body, credential_header, req.ingress_bearer)
            .await?;
        if !resp.status().is_success() {
            return Err(super::http_client::map_error_response(resp).await);
        }
        let headers = resp.headers().clone();
        let parsed: MessagesResponse = resp.json().await?;
        Ok((parsed, headers))
    }

    async fn send_stream(&self, req: OutboundRequest<'_>) -> Result<(EventStream, HeaderMap), ProviderError> {
        let mut body = self.rewritten_body(req.body);
        body.stream = Some(true);
        let credential_header = req.credential.map(|c| ("x-api-key", c));
        let resp = self
            .http
            .post_json_raw_with_credential("/v1/messages", &body, credential_header, req.ingress_bearer)
            .await?;
        if !resp.status().is_success() {
            return Err(super::http_client::map_error_response(resp).await);
        }
        let headers = resp.headers().clone();
        Ok((decode_anthropic_sse(resp), headers))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{InputMessage, MessageContent, Role};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request(model: &str) -> MessagesRequest {
        MessagesRequest {
            model: model.to_string(),
            messages: vec![InputMessage {
                role: Role::User,
                content: MessageContent::Text("hi".to_string()),
            }],
            max_tokens: 64,
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
            extra: HashMap::new(),
        }
    }

    fn mock_response_body() -> serde_json::Value {
        serde_json::json!({
            "id": "msg_1",
            "type": "message",
            "role": "assistant",
            "model": "claude-opus-4-20250514",
            "content": [{"type": "text", "text": "hello"}],
            "stop_reason": "end_turn",
            "stop_sequence": null,
            "usage": {"input_tokens": 1, "output_tokens": 1}
        })
    }

    #[tokio::test]
    async fn configured_auth_sends_x_api_key_from_credential() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "key-123"))
            .respond_with(ResponseTemplate::new(200).set_body_json(mock_response_body()))
            .mount(&server)
            .await;

        let provider = AnthropicProvider::new(
            "anthropic",
            Some(server.uri()),
            None,
            false,
            HashMap::new(),
            Duration::from_secs(5),
        )
        .unwrap();

        let body = request("claude-opus-4-20250514");
        let raw = serde_json::to_vec(&body).unwrap();
        let req = OutboundRequest {
            body: &body,
            raw_body: &raw,
            credential: Some("key-123"),
            ingress_bearer: None,
            request_id: "req-1",
        };
        let (resp, _headers) = provider.send(req).await.unwrap();
        assert_eq!(resp.id, "msg_1");
    }

    #[tokio::test]
    async fn transparent_auth_forwards_ingress_bearer() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("authorization", "Bearer client-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(mock_response_body()))
            .mount(&server)
            .await;

        let provider = AnthropicProvider::new(
            "anthropic",
            Some(server.uri()),
            None,
            true,
            HashMap::new(),
            Duration::from_secs(5),
        )
        .unwrap();
        assert!(provider.supports_transparent_auth());

        let body = request("claude-opus-4-20250514");
        let raw = serde_json::to_vec(&body).unwrap();
        let req = OutboundRequest {
            body: &body,
            raw_body: &raw,
            credential: None,
            ingress_bearer: Some("client-token"),
            request_id: "req-2",
        };
        let (resp, _headers) = provider.send(req).await.unwrap();
        assert_eq!(resp.id, "msg_1");
    }

    #[test]
    fn rewritten_body_applies_model_rewrite_table() {
        let mut rewrite = HashMap::new();
        rewrite.insert("claude-latest".to_string(), "claude-opus-4-20250514".to_string());
        let provider = AnthropicProvider::new(
            "anthropic",
            Some("https://unused.example.com".to_string()),
            None,
            false,
            rewrite,
            Duration::from_secs(5),
        )
        .unwrap();

        let body = request("claude-latest");
        let out = provider.rewritten_body(&body);
        assert_eq!(out.model, "claude-opus-4-20250514");

        let passthrough = provider.rewritten_body(&request("claude-3-5-haiku-20241022"));
        assert_eq!(passthrough.model, "claude-3-5-haiku-20241022");
    }
}

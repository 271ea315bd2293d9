//! Local Ollama, reached through its built-in Anthropic-compatible
//! `/v1/messages` surface. No credential is actually required; an operator
//! may still configure one, but it's never put on the wire. Defaults to the
//! standard local daemon address.

use std::collections::HashMap;
use std::time::Duration;

use reqwest::header::HeaderMap;

use crate::error::ProviderError;
use crate::models::{MessagesRequest, MessagesResponse};
use crate::providers::http_client::{AuthStrategy, HttpProviderClient};
use crate::providers::{EventStream, OutboundRequest, ProviderAdapter, ProviderDescriptor, ProviderKind};

use super::sse::decode_anthropic_sse;

pub struct OllamaProvider {
    http: HttpProviderClient,
    descriptor: ProviderDescriptor,
}

impl OllamaProvider {
    pub fn new(
        name: impl Into<String>,
        base_url: Option<String>,
        model_rewrite: HashMap<String, String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let headers = HashMap::new();
        let http = HttpProviderClient::new(timeout, base_url, "http://localhost:11434", &headers, AuthStrategy::None)?;

        Ok(Self {
            http,
            descriptor: ProviderDescriptor {
                name: name.into(),
                kind: ProviderKind::Ollama,
                base_url: http.base_url().to_string(),
                models: vec!["llama3.1".to_string(), "qwen2.5".to_string(), "mistral".to_string()],
                model_rewrite,
                supports_transparent_auth: false,
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
impl ProviderAdapter for OllamaProvider {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    async fn send(&self, req: OutboundRequest<'_>) -> Result<(MessagesResponse, HeaderMap), ProviderError> {
        let body = self.rewritten_body(req.body);
        let resp = self.http.post_json_raw("/v1/messages", &body, None).await?;
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
        let resp = self.http.post_json_raw("/v1/messages", &body, None).await?;
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
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn defaults_to_local_daemon_address_when_unconfigured() {
        let provider =
            OllamaProvider::new("ollama", None, HashMap::new(), Duration::from_secs(5)).unwrap();
        assert_eq!(provider.descriptor().base_url, "http://localhost:11434");
        assert!(!provider.supports_transparent_auth());
        assert!(!provider.requires_body_transform());
    }

    #[tokio::test]
    async fn ignores_any_configured_credential_on_the_wire() {
        let server = MockServer::start().await;
        let expected_body = serde_json::json!({
            "model": "llama3.1",
            "messages": [{"role": "user", "content": "hi"}],
            "max_tokens": 64
        });
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(body_json(&expected_body))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "msg_1",
                "type": "message",
                "role": "assistant",
                "model": "llama3.1",
                "content": [{"type": "text", "text": "hi back"}],
                "stop_reason": "end_turn",
                "stop_sequence": null,
                "usage": {"input_tokens": 1, "output_tokens": 1}
            })))
            .mount(&server)
            .await;

        let provider = OllamaProvider::new(
            "ollama",
            Some(server.uri()),
            HashMap::new(),
            Duration::from_secs(5),
        )
        .unwrap();

        let body: MessagesRequest = serde_json::from_value(expected_body).unwrap();
        let raw = serde_json::to_vec(&body).unwrap();
        let req = OutboundRequest {
            body: &body,
            raw_body: &raw,
            credential: Some("ignored-key"),
            ingress_bearer: None,
            request_id: "req-1",
        };
        let (resp, _headers) = provider.send(req).await.unwrap();
        assert_eq!(resp.id, "msg_1");
    }
}

//! Z.AI's Anthropic-compatible `/v1/messages` surface. Same wire format as
//! Anthropic itself, different default host and no transparent-auth option —
//! Z.AI keys are always configured per-provider, never forwarded from the
//! ingress request.

use std::collections::HashMap;
use std::time::Duration;

use reqwest::header::HeaderMap;

use crate::error::ProviderError;
use crate::models::{MessagesRequest, MessagesResponse};
use crate::providers::http_client::{AuthStrategy, HttpProviderClient};
use crate::providers::{EventStream, OutboundRequest, ProviderAdapter, ProviderDescriptor, ProviderKind};

use super::sse::decode_anthropic_sse;

pub struct ZAiProvider {
    http: HttpProviderClient,
    descriptor: ProviderDescriptor,
}

impl ZAiProvider {
    pub fn new(
        name: impl Into<String>,
        base_url: Option<String>,
        api_key: String,
        model_rewrite: HashMap<String, String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let mut headers = HashMap::new();
        headers.insert("anthropic-version".to_string(), "2023-06-01".to_string());

        let auth = AuthStrategy::Header {
            name: "x-api-key".to_string(),
            value: api_key,
        };

        let http = HttpProviderClient::new(timeout, base_url, "https://api.z.ai/api/anthropic", &headers, auth)?;

        Ok(Self {
            http,
            descriptor: ProviderDescriptor {
                name: name.into(),
                kind: ProviderKind::ZAi,
                base_url: http.base_url().to_string(),
                models: vec!["glm-4.6".to_string(), "glm-4.5".to_string(), "glm-4.5-air".to_string()],
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
impl ProviderAdapter for ZAiProvider {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    async fn send(&self, req: OutboundRequest<'_>) -> Result<(MessagesResponse, HeaderMap), ProviderError> {
        let body = self.rewritten_body(req.body);
        let credential_header = req.credential.map(|c| ("x-api-key", c));
        let resp = self
            .http
            .post_json_raw_with_credential("/v1/messages", &body, credential_header, None)
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
            .post_json_raw_with_credential("/v1/messages", &body, credential_header, None)
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
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn defaults_to_zai_host_when_unconfigured() {
        let provider = ZAiProvider::new(
            "zai",
            None,
            "glm-key".to_string(),
            HashMap::new(),
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(provider.descriptor().base_url, "https://api.z.ai/api/anthropic");
        assert!(!provider.supports_transparent_auth());
    }

    #[tokio::test]
    async fn per_request_credential_overrides_configured_key() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "rotated-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "msg_1",
                "type": "message",
                "role": "assistant",
                "model": "glm-4.6",
                "content": [{"type": "text", "text": "ok"}],
                "stop_reason": "end_turn",
                "stop_sequence": null,
                "usage": {"input_tokens": 1, "output_tokens": 1}
            })))
            .mount(&server)
            .await;

        let provider = ZAiProvider::new(
            "zai",
            Some(server.uri()),
            "configured-key".to_string(),
            HashMap::new(),
            Duration::from_secs(5),
        )
        .unwrap();

        let body: MessagesRequest = serde_json::from_value(serde_json::json!({
            "model": "glm-4.6",
            "messages": [{"role": "user", "content": "hi"}],
            "max_tokens": 64
        }))
        .unwrap();
        let raw = serde_json::to_vec(&body).unwrap();
        let req = OutboundRequest {
            body: &body,
            raw_body: &raw,
            credential: Some("rotated-key"),
            ingress_bearer: None,
            request_id: "req-1",
        };
        let (resp, _headers) = provider.send(req).await.unwrap();
        assert_eq!(resp.id, "msg_1");
    }
}

//! Google Vertex AI's `generateContent` / `streamGenerateContent` surface.
//! Auth is a short-lived OAuth access token obtained by exchanging a signed
//! service-account JWT (Application Default Credentials), not a static key,
//! so this adapter caches the token and refreshes it a minute before expiry.
//! The body is translated from Messages shape into Vertex's `Content`/`Part`
//! shape and back, since the two wire formats differ structurally rather
//! than just in field names.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::header::HeaderMap;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;

use crate::error::ProviderError;
use crate::models::{ContentBlock, MessagesRequest, MessagesResponse, Role, StopReason, Usage};
use crate::providers::{EventStream, OutboundRequest, ProviderAdapter, ProviderDescriptor, ProviderKind};

const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const OAUTH_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

#[derive(Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_token_uri() -> String {
    TOKEN_URL.to_string()
}

#[derive(Serialize)]
struct JwtClaims {
    iss: String,
    scope: String,
    aud: String,
    iat: i64,
    exp: i64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

struct CachedToken {
    token: String,
    expires_at: Instant,
}

pub struct VertexProvider {
    http: Client,
    descriptor: ProviderDescriptor,
    project: String,
    region: String,
    service_account: ServiceAccountKey,
    token: Mutex<Option<CachedToken>>,
}

impl VertexProvider {
    pub fn new(
        name: impl Into<String>,
        project: String,
        region: String,
        service_account: ServiceAccountKey,
        model_rewrite: HashMap<String, String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::Configuration {
                message: format!("failed to create HTTP client: {e}"),
            })?;

        Ok(Self {
            http,
            descriptor: ProviderDescriptor {
                name: name.into(),
                kind: ProviderKind::Vertex,
                base_url: format!("https://{region}-aiplatform.googleapis.com"),
                models: vec!["gemini-2.0-flash".to_string(), "gemini-1.5-pro".to_string()],
                model_rewrite,
                supports_transparent_auth: false,
                supports_streaming: true,
                requires_body_transform: true,
            },
            project,
            region,
            service_account,
            token: Mutex::new(None),
        })
    }

    async fn access_token(&self) -> Result<String, ProviderError> {
        {
            let guard = self.token.lock().await;
            if let Some(cached) = guard.as_ref() {
                if cached.expires_at > Instant::now() + Duration::from_secs(60) {
                    return Ok(cached.token.clone());
                }
            }
        }

        let now = chrono::Utc::now().timestamp();
        let claims = JwtClaims {
            iss: self.service_account.client_email.clone(),
            scope: OAUTH_SCOPE.to_string(),
            aud: self.service_account.token_uri.clone(),
            iat: now,
            exp: now + 3600,
        };
        let key = EncodingKey::from_rsa_pem(self.service_account.private_key.as_bytes()).map_err(|e| {
            ProviderError::Signing {
                message: format!("invalid service account private key: {e}"),
            }
        })?;
        let assertion = jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &key).map_err(|e| {
            ProviderError::Signing {
                message: format!("failed to sign service account JWT: {e}"),
            }
        })?;

        let resp = self
            .http
            .post(&self.service_account.token_uri)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(super::http_client::map_error_response(resp).await);
        }
        let token_resp: TokenResponse = resp.json().await?;

        let mut guard = self.token.lock().await;
        *guard = Some(CachedToken {
            token: token_resp.access_token.clone(),
            expires_at: Instant::now() + Duration::from_secs(token_resp.expires_in.max(0) as u64),
        });
        Ok(token_resp.access_token)
    }

    fn endpoint(&self, model: &str, stream: bool) -> String {
        let method = if stream { "streamGenerateContent" } else { "generateContent" };
        format!(
            "{}/v1/projects/{}/locations/{}/publishers/google/models/{}:{method}",
            self.descriptor.base_url, self.project, self.region, model
        )
    }

    fn to_vertex_body(&self, body: &MessagesRequest) -> serde_json::Value {
        let contents: Vec<serde_json::Value> = body
            .messages
            .iter()
            .map(|msg| {
                let role = match msg.role {
                    Role::User => "user",
                    Role::Assistant => "model",
                };
                let parts: Vec<serde_json::Value> = msg
                    .content
                    .clone()
                    .into_blocks()
                    .into_iter()
                    .filter_map(|block| match block {
                        ContentBlock::Text { text } => Some(json!({ "text": text })),
                        _ => None,
                    })
                    .collect();
                json!({ "role": role, "parts": parts })
            })
            .collect();

        let mut generation_config = serde_json::Map::new();
        if let Some(max_tokens) = Some(body.max_tokens) {
            generation_config.insert("maxOutputTokens".to_string(), json!(max_tokens));
        }
        if let Some(temperature) = body.temperature {
            generation_config.insert("temperature".to_string(), json!(temperature));
        }
        if let Some(top_p) = body.top_p {
            generation_config.insert("topP".to_string(), json!(top_p));
        }

        let mut out = json!({ "contents": contents, "generationConfig": generation_config });
        if let Some(system) = &body.system {
            let text = match system {
                crate::models::SystemPrompt::Text(t) => t.clone(),
                crate::models::SystemPrompt::Blocks(blocks) => blocks
                    .iter()
                    .filter_map(|b| match b {
                        ContentBlock::Text { text } => Some(text.clone()),
                        _ => None,
                    })
                    .collect::<Vec<_>>()
                    .join("\n"),
            };
            out["systemInstruction"] = json!({ "parts": [{ "text": text }] });
        }
        out
    }

    fn from_vertex_body(&self, model: &str, value: serde_json::Value) -> Result<MessagesResponse, ProviderError> {
        let text = value["candidates"][0]["content"]["parts"][0]["text"]
            .as_str()
            .unwrap_or("")
            .to_string();
        let finish_reason = value["candidates"][0]["finishReason"].as_str().unwrap_or("STOP");
        let stop_reason = match finish_reason {
            "MAX_TOKENS" => StopReason::MaxTokens,
            _ => StopReason::EndTurn,
        };
        let usage = Usage {
            input_tokens: value["usageMetadata"]["promptTokenCount"].as_u64().unwrap_or(0) as u32,
            output_tokens: value["usageMetadata"]["candidatesTokenCount"].as_u64().unwrap_or(0) as u32,
            ..Default::default()
        };

        Ok(MessagesResponse {
            id: format!("vertex_{}", uuid::Uuid::new_v4()),
            kind: "message".to_string(),
            role: Role::Assistant,
            model: model.to_string(),
            content: vec![ContentBlock::Text { text }],
            stop_reason: Some(stop_reason),
            stop_sequence: None,
            usage,
        })
    }
}

#[async_trait::async_trait]
impl ProviderAdapter for VertexProvider {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    async fn send(&self, req: OutboundRequest<'_>) -> Result<(MessagesResponse, HeaderMap), ProviderError> {
        let model = self.map_model(&req.body.model);
        let token = self.access_token().await?;
        let body = self.to_vertex_body(req.body);

        let resp = self
            .http
            .post(self.endpoint(&model, false))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(super::http_client::map_error_response(resp).await);
        }
        let headers = resp.headers().clone();
        let value: serde_json::Value = resp.json().await?;
        Ok((self.from_vertex_body(&req.body.model, value)?, headers))
    }

    async fn send_stream(&self, req: OutboundRequest<'_>) -> Result<(EventStream, HeaderMap), ProviderError> {
        // Vertex's streamGenerateContent yields a JSON array of partial
        // candidates over a chunked response rather than SSE; translating
        // that incrementally into Messages deltas needs a dedicated
        // accumulator. Until that lands, streaming requests fall back to a
        // single non-streamed call wrapped as one text delta.
        let (response, headers) = self.send(req).await?;
        let text = response
            .content
            .iter()
            .find_map(|block| match block {
                ContentBlock::Text { text } => Some(text.clone()),
                _ => None,
            })
            .unwrap_or_default();

        let events = vec![
            crate::models::StreamEvent::MessageStart { message: response.clone() },
            crate::models::StreamEvent::ContentBlockStart {
                index: 0,
                content_block: ContentBlock::Text { text: String::new() },
            },
            crate::models::StreamEvent::ContentBlockDelta {
                index: 0,
                delta: crate::models::ContentDelta::TextDelta { text },
            },
            crate::models::StreamEvent::ContentBlockStop { index: 0 },
            crate::models::StreamEvent::MessageStop,
        ];
        let stream = Box::pin(futures::stream::iter(events.into_iter().map(Ok)));
        Ok((stream, headers))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::InputMessage;

    fn test_service_account() -> ServiceAccountKey {
        ServiceAccountKey {
            client_email: "svc@project.iam.gserviceaccount.com".to_string(),
            private_key: "unused-in-these-tests".to_string(),
            token_uri: default_token_uri(),
        }
    }

    fn provider() -> VertexProvider {
        VertexProvider::new(
            "vertex",
            "my-project".to_string(),
            "us-central1".to_string(),
            test_service_account(),
            HashMap::new(),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn endpoint_builds_generate_content_path() {
        let p = provider();
        assert_eq!(
            p.endpoint("gemini-2.0-flash", false),
            "https://us-central1-aiplatform.googleapis.com/v1/projects/my-project/locations/us-central1/publishers/google/models/gemini-2.0-flash:generateContent"
        );
    }

    #[test]
    fn endpoint_switches_to_streaming_method() {
        let p = provider();
        assert!(p.endpoint("gemini-2.0-flash", true).ends_with(":streamGenerateContent"));
    }

    #[test]
    fn to_vertex_body_maps_roles_and_generation_config() {
        let p = provider();
        let body = MessagesRequest {
            model: "gemini-2.0-flash".to_string(),
            messages: vec![
                InputMessage {
                    role: Role::User,
                    content: crate::models::MessageContent::Text("hello".to_string()),
                },
                InputMessage {
                    role: Role::Assistant,
                    content: crate::models::MessageContent::Text("hi there".to_string()),
                },
            ],
            max_tokens: 256,
            system: Some(crate::models::SystemPrompt::Text("be terse".to_string())),
            stream: None,
            temperature: Some(0.5),
            top_p: None,
            top_k: None,
            stop_sequences: None,
            tools: None,
            tool_choice: None,
            thinking: None,
            metadata: None,
            extra: HashMap::new(),
        };

        let vertex_body = p.to_vertex_body(&body);
        assert_eq!(vertex_body["contents"][0]["role"], "user");
        assert_eq!(vertex_body["contents"][1]["role"], "model");
        assert_eq!(vertex_body["contents"][0]["parts"][0]["text"], "hello");
        assert_eq!(vertex_body["generationConfig"]["maxOutputTokens"], 256);
        assert_eq!(vertex_body["generationConfig"]["temperature"], 0.5);
        assert_eq!(vertex_body["systemInstruction"]["parts"][0]["text"], "be terse");
    }

    #[test]
    fn from_vertex_body_extracts_text_and_usage() {
        let p = provider();
        let raw = serde_json::json!({
            "candidates": [{
                "content": {"parts": [{"text": "the answer"}]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 10, "candidatesTokenCount": 4}
        });
        let resp = p.from_vertex_body("gemini-2.0-flash", raw).unwrap();
        assert_eq!(resp.usage.input_tokens, 10);
        assert_eq!(resp.usage.output_tokens, 4);
        assert!(matches!(resp.stop_reason, Some(StopReason::EndTurn)));
        match &resp.content[0] {
            ContentBlock::Text { text } => assert_eq!(text, "the answer"),
            other => panic!("unexpected content block: {other:?}"),
        }
    }

    #[test]
    fn from_vertex_body_maps_max_tokens_finish_reason() {
        let p = provider();
        let raw = serde_json::json!({
            "candidates": [{
                "content": {"parts": [{"text": "truncated"}]},
                "finishReason": "MAX_TOKENS"
            }],
            "usageMetadata": {"promptTokenCount": 1, "candidatesTokenCount": 1}
        });
        let resp = p.from_vertex_body("gemini-2.0-flash", raw).unwrap();
        assert!(matches!(resp.stop_reason, Some(StopReason::MaxTokens)));
    }
}

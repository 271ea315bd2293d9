//! AWS Bedrock's `InvokeModel` / `InvokeModelWithResponseStream` surface for
//! Anthropic models. Requires SigV4 request signing (no bearer/API-key auth
//! exists here) and a body transform: Bedrock drops `model` from the request
//! body in favor of a fixed `anthropic_version` field, with the model id
//! living in the URL instead. Streaming responses arrive framed as AWS
//! Event-Stream rather than SSE; this adapter unwraps that framing down to
//! the same Messages stream events the dispatch core expects everywhere
//! else.

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use async_stream::stream;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use futures::StreamExt;
use hmac::{Hmac, Mac};
use reqwest::header::HeaderMap;
use reqwest::Client;
use sha2::{Digest, Sha256};

use crate::error::ProviderError;
use crate::models::{MessagesRequest, MessagesResponse, StreamEvent};
use crate::providers::{EventStream, OutboundRequest, ProviderAdapter, ProviderDescriptor, ProviderKind};

type HmacSha256 = Hmac<Sha256>;

const BEDROCK_ANTHROPIC_VERSION: &str = "bedrock-2023-05-31";

#[derive(Clone)]
pub struct BedrockCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

pub struct BedrockProvider {
    http: Client,
    descriptor: ProviderDescriptor,
    region: String,
    credentials: BedrockCredentials,
}

impl BedrockProvider {
    pub fn new(
        name: impl Into<String>,
        region: String,
        credentials: BedrockCredentials,
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
                kind: ProviderKind::Bedrock,
                base_url: format!("https://bedrock-runtime.{region}.amazonaws.com"),
                models: vec![
                    "anthropic.claude-opus-4-20250514-v1:0".to_string(),
                    "anthropic.claude-sonnet-4-20250514-v1:0".to_string(),
                    "anthropic.claude-3-5-sonnet-20241022-v2:0".to_string(),
                ],
                model_rewrite,
                supports_transparent_auth: false,
                supports_streaming: true,
                requires_body_transform: true,
            },
            region,
            credentials,
        })
    }

    fn host(&self) -> String {
        format!("bedrock-runtime.{}.amazonaws.com", self.region)
    }

    /// Strip `model` and add Bedrock's fixed `anthropic_version` marker; the
    /// model id moves into the URL path instead.
    fn transform_request(&self, body: &MessagesRequest) -> Result<serde_json::Value, ProviderError> {
        let mut value = serde_json::to_value(body)?;
        if let Some(obj) = value.as_object_mut() {
            obj.remove("model");
            obj.insert(
                "anthropic_version".to_string(),
                serde_json::Value::String(BEDROCK_ANTHROPIC_VERSION.to_string()),
            );
        }
        Ok(value)
    }

    fn sign(
        &self,
        method: &str,
        path: &str,
        payload: &[u8],
        extra_headers: &[(&str, String)],
    ) -> Result<HeaderMap, ProviderError> {
        let now = SystemTime::now();
        let amz_date = {
            let dt: chrono::DateTime<Utc> = now.into();
            dt.format("%Y%m%dT%H%M%SZ").to_string()
        };
        let date_stamp = &amz_date[0..8];

        let host = self.host();
        let payload_hash = hex::encode(Sha256::digest(payload));

        let mut header_pairs: Vec<(String, String)> = vec![
            ("host".to_string(), host.clone()),
            ("x-amz-content-sha256".to_string(), payload_hash.clone()),
            ("x-amz-date".to_string(), amz_date.clone()),
        ];
        if let Some(token) = &self.credentials.session_token {
            header_pairs.push(("x-amz-security-token".to_string(), token.clone()));
        }
        for (k, v) in extra_headers {
            header_pairs.push((k.to_lowercase(), v.clone()));
        }
        header_pairs.sort_by(|a, b| a.0.cmp(&b.0));

        let canonical_headers: String = header_pairs
            .iter()
            .map(|(k, v)| format!("{k}:{v}\n"))
            .collect();
        let signed_headers = header_pairs
            .iter()
            .map(|(k, _)| k.as_str())
            .collect::<Vec<_>>()
            .join(";");

        let canonical_request = format!(
            "{method}\n{path}\n\n{canonical_headers}\n{signed_headers}\n{payload_hash}"
        );
        let canonical_request_hash = hex::encode(Sha256::digest(canonical_request.as_bytes()));

        let scope = format!("{date_stamp}/{}/bedrock/aws4_request", self.region);
        let string_to_sign =
            format!("AWS4-HMAC-SHA256\n{amz_date}\n{scope}\n{canonical_request_hash}");

        let sign_key = |key: &[u8], msg: &str| -> Result<Vec<u8>, ProviderError> {
            let mut mac = HmacSha256::new_from_slice(key).map_err(|e| ProviderError::Signing {
                message: e.to_string(),
            })?;
            mac.update(msg.as_bytes());
            Ok(mac.finalize().into_bytes().to_vec())
        };

        let k_date = sign_key(
            format!("AWS4{}", self.credentials.secret_access_key).as_bytes(),
            date_stamp,
        )?;
        let k_region = sign_key(&k_date, &self.region)?;
        let k_service = sign_key(&k_region, "bedrock")?;
        let k_signing = sign_key(&k_service, "aws4_request")?;
        let signature = hex::encode(sign_key(&k_signing, &string_to_sign)?);

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
            self.credentials.access_key_id
        );

        let mut headers = HeaderMap::new();
        headers.insert("x-amz-date", amz_date.parse().unwrap());
        headers.insert("x-amz-content-sha256", payload_hash.parse().unwrap());
        headers.insert("authorization", authorization.parse().unwrap());
        if let Some(token) = &self.credentials.session_token {
            headers.insert("x-amz-security-token", token.parse().map_err(|_| {
                ProviderError::Signing {
                    message: "invalid session token header value".to_string(),
                }
            })?);
        }
        for (k, v) in extra_headers {
            if let (Ok(name), Ok(value)) = (
                k.parse::<reqwest::header::HeaderName>(),
                v.parse::<reqwest::header::HeaderValue>(),
            ) {
                headers.insert(name, value);
            }
        }
        Ok(headers)
    }
}

#[async_trait::async_trait]
impl ProviderAdapter for BedrockProvider {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    async fn send(&self, req: OutboundRequest<'_>) -> Result<(MessagesResponse, HeaderMap), ProviderError> {
        let model_id = self.map_model(&req.body.model);
        let path = format!("/model/{model_id}/invoke");
        let payload = serde_json::to_vec(&self.transform_request(req.body)?)?;

        let signed_headers = self.sign(
            "POST",
            &path,
            &payload,
            &[("content-type", "application/json".to_string())],
        )?;

        let url = format!("{}{}", self.descriptor.base_url, path);
        let resp = self
            .http
            .post(&url)
            .headers(signed_headers)
            .header("content-type", "application/json")
            .body(payload)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(super::http_client::map_error_response(resp).await);
        }
        let headers = resp.headers().clone();
        let mut value: serde_json::Value = resp.json().await?;
        if let Some(obj) = value.as_object_mut() {
            obj.insert("model".to_string(), serde_json::Value::String(req.body.model.clone()));
        }
        let parsed: MessagesResponse = serde_json::from_value(value)?;
        Ok((parsed, headers))
    }

    async fn send_stream(&self, req: OutboundRequest<'_>) -> Result<(EventStream, HeaderMap), ProviderError> {
        let model_id = self.map_model(&req.body.model);
        let path = format!("/model/{model_id}/invoke-with-response-stream");
        let payload = serde_json::to_vec(&self.transform_request(req.body)?)?;

        let signed_headers = self.sign(
            "POST",
            &path,
            &payload,
            &[("content-type", "application/json".to_string())],
        )?;

        let url = format!("{}{}", self.descriptor.base_url, path);
        let resp = self
            .http
            .post(&url)
            .headers(signed_headers)
            .header("content-type", "application/json")
            .body(payload)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(super::http_client::map_error_response(resp).await);
        }
        let headers = resp.headers().clone();
        Ok((decode_event_stream(resp), headers))
    }
}

/// Unwrap AWS Event-Stream binary framing into Messages stream events. Each
/// message is `total_len(4) | headers_len(4) | prelude_crc(4) | headers |
/// payload | message_crc(4)`; the payload for a Bedrock chunk event is JSON
/// holding a base64 `bytes` field that itself decodes to the native
/// Anthropic stream event.
fn decode_event_stream(resp: reqwest::Response) -> EventStream {
    Box::pin(stream! {
        let mut bytes_stream = resp.bytes_stream();
        let mut buffer: Vec<u8> = Vec::new();

        while let Some(chunk_result) = bytes_stream.next().await {
            let chunk = match chunk_result {
                Ok(c) => c,
                Err(e) => {
                    yield Err(ProviderError::Http(e));
                    return;
                }
            };
            buffer.extend_from_slice(&chunk);

            loop {
                if buffer.len() < 12 {
                    break;
                }
                let total_len = u32::from_be_bytes(buffer[0..4].try_into().unwrap()) as usize;
                if buffer.len() < total_len {
                    break;
                }
                let headers_len = u32::from_be_bytes(buffer[4..8].try_into().unwrap()) as usize;
                let headers_start = 12;
                let payload_start = headers_start + headers_len;
                let payload_end = total_len.saturating_sub(4);

                if payload_end < payload_start || payload_end > buffer.len() {
                    buffer.drain(..total_len.min(buffer.len()));
                    continue;
                }

                let payload = buffer[payload_start..payload_end].to_vec();
                buffer.drain(..total_len);

                match serde_json::from_slice::<serde_json::Value>(&payload) {
                    Ok(envelope) => {
                        let decoded = envelope
                            .get("bytes")
                            .and_then(|b| b.as_str())
                            .and_then(|b64| BASE64.decode(b64).ok());

                        match decoded {
                            Some(raw) => match serde_json::from_slice::<StreamEvent>(&raw) {
                                Ok(event) => yield Ok(event),
                                Err(e) => yield Err(ProviderError::Serialization(e)),
                            },
                            None => continue,
                        }
                    }
                    Err(e) => yield Err(ProviderError::Serialization(e)),
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{InputMessage, MessageContent, Role};
    use futures::StreamExt as _;

    fn credentials() -> BedrockCredentials {
        BedrockCredentials {
            access_key_id: "AKIDEXAMPLE".to_string(),
            secret_access_key: "secret".to_string(),
            session_token: None,
        }
    }

    fn provider() -> BedrockProvider {
        BedrockProvider::new(
            "bedrock",
            "us-east-1".to_string(),
            credentials(),
            HashMap::new(),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    fn sample_request() -> MessagesRequest {
        MessagesRequest {
            model: "anthropic.claude-opus-4-20250514-v1:0".to_string(),
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

    #[test]
    fn transform_request_strips_model_and_adds_anthropic_version() {
        let p = provider();
        let transformed = p.transform_request(&sample_request()).unwrap();
        let obj = transformed.as_object().unwrap();
        assert!(!obj.contains_key("model"));
        assert_eq!(obj["anthropic_version"], BEDROCK_ANTHROPIC_VERSION);
        assert_eq!(obj["max_tokens"], 64);
    }

    #[test]
    fn host_reflects_region() {
        let p = provider();
        assert_eq!(p.host(), "bedrock-runtime.us-east-1.amazonaws.com");
    }

    #[test]
    fn sign_produces_well_formed_authorization_header() {
        let p = provider();
        let headers = p
            .sign("POST", "/model/x/invoke", b"{}", &[("content-type", "application/json".to_string())])
            .unwrap();
        let auth = headers.get("authorization").unwrap().to_str().unwrap();
        assert!(auth.starts_with("AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/"));
        assert!(auth.contains("/us-east-1/bedrock/aws4_request"));
        assert!(auth.contains("SignedHeaders="));
        assert!(auth.contains("Signature="));
        assert!(headers.contains_key("x-amz-date"));
        assert!(headers.contains_key("x-amz-content-sha256"));
    }

    #[test]
    fn sign_includes_session_token_header_when_present() {
        let p = BedrockProvider::new(
            "bedrock",
            "us-east-1".to_string(),
            BedrockCredentials {
                access_key_id: "AKIDEXAMPLE".to_string(),
                secret_access_key: "secret".to_string(),
                session_token: Some("session-tok".to_string()),
            },
            HashMap::new(),
            Duration::from_secs(5),
        )
        .unwrap();
        let headers = p.sign("POST", "/model/x/invoke", b"{}", &[]).unwrap();
        assert_eq!(headers.get("x-amz-security-token").unwrap(), "session-tok");
    }

    fn event_stream_frame(payload_json: &serde_json::Value) -> Vec<u8> {
        let event_bytes = serde_json::to_vec(payload_json).unwrap();
        let payload = serde_json::json!({ "bytes": BASE64.encode(&event_bytes) });
        let payload_bytes = serde_json::to_vec(&payload).unwrap();

        let headers: Vec<u8> = Vec::new();
        let headers_len = headers.len() as u32;
        let total_len = (12 + headers.len() + payload_bytes.len() + 4) as u32;

        let mut frame = Vec::new();
        frame.extend_from_slice(&total_len.to_be_bytes());
        frame.extend_from_slice(&headers_len.to_be_bytes());
        frame.extend_from_slice(&0u32.to_be_bytes()); // prelude crc, unchecked by the decoder
        frame.extend_from_slice(&headers);
        frame.extend_from_slice(&payload_bytes);
        frame.extend_from_slice(&0u32.to_be_bytes()); // message crc, unchecked by the decoder
        frame
    }

    #[tokio::test]
    async fn decode_event_stream_unwraps_base64_payload_into_stream_events() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let event = serde_json::json!({ "type": "message_stop" });
        let frame = event_stream_frame(&event);

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(frame))
            .mount(&server)
            .await;

        let resp = reqwest::get(server.uri()).await.unwrap();
        let mut stream = decode_event_stream(resp);
        let first = stream.next().await.unwrap().unwrap();
        assert!(matches!(first, StreamEvent::MessageStop));
        assert!(stream.next().await.is_none());
    }
}

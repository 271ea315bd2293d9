//! Azure AI Foundry's Anthropic-compatible deployment surface. Distinct from
//! native Azure OpenAI: auth is `x-api-key` rather than `Authorization:
//! Bearer`, the deployment name is part of the path, and an `api-version`
//! query parameter is required on every call. The body itself is already
//! Messages format, so no transform is needed.

use std::collections::HashMap;
use std::time::Duration;

use reqwest::header::HeaderMap;

use crate::error::ProviderError;
use crate::models::{MessagesRequest, MessagesResponse};
use crate::providers::http_client::{AuthStrategy, HttpProviderClient};
use crate::providers::{EventStream, OutboundRequest, ProviderAdapter, ProviderDescriptor, ProviderKind};

use super::sse::decode_anthropic_sse;

const DEFAULT_API_VERSION: &str = "2024-06-01";

pub struct AzureProvider {
    http: HttpProviderClient,
    descriptor: ProviderDescriptor,
    deployment: String,
    api_version: String,
}

impl AzureProvider {
    pub fn new(
        name: impl Into<String>,
        base_url: String,
        deployment: String,
        api_key: String,
        api_version: Option<String>,
        model_rewrite: HashMap<String, String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let headers = HashMap::new();
        let auth = AuthStrategy::Header {
            name: "x-api-key".to_string(),
            value: api_key,
        };
        let http = HttpProviderClient::new(timeout, Some(base_url), "", &headers, auth)?;

        Ok(Self {
            http,
            descriptor: ProviderDescriptor {
                name: name.into(),
                kind: ProviderKind::Azure,
                base_url: "".to_string(),
                models: vec![deployment.clone()],
                model_rewrite,
                supports_transparent_auth: false,
                supports_streaming: true,
                requires_body_transform: false,
            },
            deployment,
            api_version: api_version.unwrap_or_else(|| DEFAULT_API_VERSION.to_string()),
        })
    }

    fn path(&self) -> String {
        format!(
            "/v1/messages?deployment={}&api-version={}",
            self.deployment, self.api_version
        )
    }

    fn rewritten_body(&self, body: &MessagesRequest) -> MessagesRequest {
        let mut out = body.clone();
        out.model = self.map_model(&body.model);
        out
    }
}

#[async_trait::async_trait]
impl ProviderAdapter for AzureProvider {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    async fn send(&self, req: OutboundRequest<'_>) -> Result<(MessagesResponse, HeaderMap), ProviderError> {
        let body = self.rewritten_body(req.body);
        let credential_header = req.credential.map(|c| ("x-api-key", c));
        let resp = self
            .http
            .post_json_raw_with_credential(&self.path(), &body, credential_header, None)
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
            .post_json_raw_with_credential(&self.path(), &body, credential_header, None)
            .await?;
        if !resp.status().is_success() {
            return Err(super::http_client::map_error_response(resp).await);
        }
        let headers = resp.headers().clone();
        Ok((decode_anthropic_sse(resp), headers))
    }
}

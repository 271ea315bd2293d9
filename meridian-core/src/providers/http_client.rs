//! Shared `reqwest::Client` composition helper. Every provider adapter
//! builds one of these rather than constructing its own client: it carries
//! the common timeout/default-header/auth plumbing, and each adapter layers
//! its own URL construction and body transform on top.

use crate::error::ProviderError;
use reqwest::{header::HeaderMap, Client, Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Clone, Debug)]
pub enum AuthStrategy {
    Bearer { token: String },
    Header { name: String, value: String },
    /// Forward whatever bearer token the ingress request carried, unmodified
    /// (transparent auth — Anthropic and Z.AI's Anthropic-compatible surface).
    Transparent,
    None,
}

#[derive(Clone)]
pub struct HttpProviderClient {
    http: Client,
    base_url: String,
    default_headers: HeaderMap,
    auth: AuthStrategy,
}

impl HttpProviderClient {
    pub fn new(
        timeout: Duration,
        base_url: Option<String>,
        default_base: &str,
        headers: &HashMap<String, String>,
        auth: AuthStrategy,
    ) -> Result<Self, ProviderError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::Configuration {
                message: format!("failed to create HTTP client: {e}"),
            })?;

        let mut default_headers = HeaderMap::new();
        for (k, v) in headers {
            if let (Ok(name), Ok(value)) = (k.parse::<reqwest::header::HeaderName>(), v.parse()) {
                default_headers.insert(name, value);
            }
        }

        let base_url = base_url.unwrap_or_else(|| default_base.to_string());

        Ok(Self {
            http,
            base_url,
            default_headers,
            auth,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn build_url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url.trim_end_matches('/'), path)
        }
    }

    /// Apply the configured auth strategy to a request, falling back to
    /// `transparent_token` (the ingress request's own bearer token) when the
    /// strategy is `Transparent`.
    fn apply_auth(&self, mut req: RequestBuilder, transparent_token: Option<&str>) -> RequestBuilder {
        req = req.headers(self.default_headers.clone());
        match &self.auth {
            AuthStrategy::Bearer { token } => req.bearer_auth(token),
            AuthStrategy::Header { name, value } => req.header(name, value),
            AuthStrategy::Transparent => {
                if let Some(token) = transparent_token {
                    req.bearer_auth(token)
                } else {
                    req
                }
            }
            AuthStrategy::None => req,
        }
    }

    pub async fn post_json<TReq: Serialize, TResp: DeserializeOwned>(
        &self,
        path: &str,
        body: &TReq,
        transparent_token: Option<&str>,
    ) -> Result<TResp, ProviderError> {
        let resp = self.post_json_raw(path, body, transparent_token).await?;
        if !resp.status().is_success() {
            return Err(map_error_response(resp).await);
        }
        Ok(resp.json::<TResp>().await?)
    }

    pub async fn post_json_raw<TReq: Serialize>(
        &self,
        path: &str,
        body: &TReq,
        transparent_token: Option<&str>,
    ) -> Result<Response, ProviderError> {
        let url = self.build_url(path);
        let req = self.apply_auth(self.http.request(Method::POST, url), transparent_token);
        Ok(req.json(body).send().await?)
    }

    /// Like [`Self::post_json_raw`], but `credential_header` — when set —
    /// overrides the adapter's baked-in auth strategy entirely. Used by
    /// adapters whose provider is configured with a rotating key pool: the
    /// key chosen for this attempt, not the adapter's construction-time
    /// default, goes on the wire.
    pub async fn post_json_raw_with_credential<TReq: Serialize>(
        &self,
        path: &str,
        body: &TReq,
        credential_header: Option<(&str, &str)>,
        transparent_token: Option<&str>,
    ) -> Result<Response, ProviderError> {
        let url = self.build_url(path);
        let req = self.http.request(Method::POST, url);
        let req = match credential_header {
            Some((name, value)) => req.headers(self.default_headers.clone()).header(name, value),
            None => self.apply_auth(req, transparent_token),
        };
        Ok(req.json(body).send().await?)
    }

    pub async fn get_json<TResp: DeserializeOwned>(
        &self,
        path: &str,
        transparent_token: Option<&str>,
    ) -> Result<TResp, ProviderError> {
        let url = self.build_url(path);
        let req = self.apply_auth(self.http.request(Method::GET, url), transparent_token);
        let resp = req.send().await?;
        if !resp.status().is_success() {
            return Err(map_error_response(resp).await);
        }
        Ok(resp.json::<TResp>().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(base_url: &str) -> HttpProviderClient {
        HttpProviderClient::new(
            Duration::from_secs(5),
            Some(base_url.to_string()),
            "https://unused.example.com",
            &HashMap::new(),
            AuthStrategy::None,
        )
        .unwrap()
    }

    #[test]
    fn build_url_joins_absolute_path() {
        let c = client("https://api.example.com");
        assert_eq!(c.build_url("/v1/messages"), "https://api.example.com/v1/messages");
    }

    #[test]
    fn build_url_joins_relative_path_with_slash() {
        let c = client("https://api.example.com/");
        assert_eq!(c.build_url("v1/messages"), "https://api.example.com/v1/messages");
    }

    #[test]
    fn build_url_falls_back_to_default_base() {
        let c = HttpProviderClient::new(
            Duration::from_secs(5),
            None,
            "http://localhost:11434",
            &HashMap::new(),
            AuthStrategy::None,
        )
        .unwrap();
        assert_eq!(c.build_url("/v1/messages"), "http://localhost:11434/v1/messages");
    }
}

pub async fn map_error_response(resp: Response) -> ProviderError {
    let status = resp.status().as_u16();
    match resp.text().await {
        Ok(body) => {
            let message = serde_json::from_str::<serde_json::Value>(&body)
                .ok()
                .and_then(|v| v.get("error").cloned())
                .and_then(|e| e.get("message").cloned())
                .and_then(|m| m.as_str().map(|s| s.to_string()))
                .unwrap_or_else(|| body.clone());

            match status {
                401 | 403 => ProviderError::InvalidCredential,
                404 => ProviderError::ModelNotFound {
                    model: "unknown".to_string(),
                },
                429 => ProviderError::RateLimit,
                503 => ProviderError::ServiceUnavailable,
                _ => ProviderError::Upstream { status, message },
            }
        }
        Err(_) => ProviderError::Upstream {
            status,
            message: "failed to read error response body".to_string(),
        },
    }
}

//! # Meridian Gateway
//!
//! An HTTP proxy that speaks the Anthropic Messages wire format on both
//! sides: callers send `POST /v1/messages` exactly as they would to
//! `api.anthropic.com`, and the gateway dispatches it to one of several
//! configured backends — Anthropic itself, Z.AI, a local Ollama, AWS
//! Bedrock, Azure AI Foundry, or Vertex AI — chosen by a configurable
//! routing strategy with automatic failover.
//!
//! ## Modules
//!
//! - [`config`] — loads and validates [`config::Config`] from TOML, with
//!   environment overrides.
//! - [`auth`] — ingress authentication (shared key, transparent bearer, or
//!   both).
//! - [`server`] — builds [`server::AppState`] and the axum router.
//! - [`handlers`] — the six HTTP routes.
//! - [`middleware`] — request logging, metrics recording, CORS.
//! - [`metrics`] — the hand-rolled Prometheus text-exposition sink.
//! - [`request_context`] — the per-request id/timer threaded through
//!   extensions.
//! - [`gateway_error`] — maps dispatch-core and ingress errors onto the
//!   Anthropic error envelope.
//!
//! ## Quick start
//!
//! ```no_run
//! use meridian_gateway::config::Config;
//! use meridian_gateway::server::{create_server, AppState};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml")?;
//!     let state = AppState::build(Arc::new(config))?;
//!     let app = create_server(state);
//!
//!     let listener = tokio::net::TcpListener::bind("127.0.0.1:3000").await?;
//!     axum::serve(listener, app).await?;
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod config;
pub mod gateway_error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod request_context;
pub mod server;

pub use server::create_server;

#[cfg(test)]
mod tests {
    use crate::config::{Config, IngressAuthMode, KeyConfig, ProviderConfig};
    use crate::server::{create_server, AppState};
    use axum::http::StatusCode;
    use axum_test::TestServer;
    use meridian_core::providers::ProviderKind;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn config_with_one_anthropic_provider() -> Config {
        let mut config = Config::default();
        config.auth.mode = IngressAuthMode::SharedKey;
        config.auth.shared_key = Some("test-key".to_string());
        config.providers.insert(
            "anthropic".to_string(),
            ProviderConfig {
                name: "anthropic".to_string(),
                kind: ProviderKind::Anthropic,
                base_url: None,
                enabled: true,
                model_mapping: HashMap::new(),
                keys: vec![KeyConfig {
                    id: "k1".to_string(),
                    material: "sk-ant-test".to_string(),
                    requests_per_minute: 60,
                    input_tokens_per_minute: 100_000,
                    output_tokens_per_minute: 100_000,
                    weight: 1,
                    priority: 0,
                }],
                priority: 0,
                weight: 1,
                transparent_auth: false,
                circuit_breaker: Default::default(),
                region: None,
                access_key_id: None,
                secret_access_key: None,
                session_token: None,
                deployment: None,
                api_version: None,
                project: None,
                service_account_path: None,
            },
        );
        config
    }

    #[tokio::test]
    async fn health_check_requires_no_auth() {
        let state = AppState::build(Arc::new(config_with_one_anthropic_provider())).unwrap();
        let app = create_server(state);
        let server = TestServer::new(app).unwrap();

        let response = server.get("/health").await;
        assert_eq!(response.status_code(), StatusCode::OK);
        assert_eq!(response.json::<serde_json::Value>()["status"], "ok");
    }

    #[tokio::test]
    async fn list_providers_returns_configured_provider() {
        let state = AppState::build(Arc::new(config_with_one_anthropic_provider())).unwrap();
        let app = create_server(state);
        let server = TestServer::new(app).unwrap();

        let response = server.get("/v1/providers").await;
        assert_eq!(response.status_code(), StatusCode::OK);
        let body = response.json::<serde_json::Value>();
        assert_eq!(body["providers"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn messages_endpoint_rejects_missing_credential() {
        let state = AppState::build(Arc::new(config_with_one_anthropic_provider())).unwrap();
        let app = create_server(state);
        let server = TestServer::new(app).unwrap();

        let response = server
            .post("/v1/messages")
            .json(&serde_json::json!({
                "model": "claude-opus-4-5",
                "max_tokens": 16,
                "messages": [{"role": "user", "content": "hi"}],
            }))
            .await;
        assert_eq!(response.status_code(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn metrics_endpoint_returns_prometheus_text() {
        let state = AppState::build(Arc::new(config_with_one_anthropic_provider())).unwrap();
        let app = create_server(state);
        let server = TestServer::new(app).unwrap();

        let response = server.get("/metrics").await;
        assert_eq!(response.status_code(), StatusCode::OK);
        assert!(response.text().contains("meridian_requests_total"));
    }
}

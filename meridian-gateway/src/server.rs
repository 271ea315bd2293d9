//! # HTTP Server
//!
//! Builds an [`AppState`] from a parsed [`Config`] and assembles the axum
//! [`Router`] the binary serves. All the interesting wiring — which provider
//! adapters get built, how the shared circuit breaker is configured, which
//! cache backend the signature cache sits on — happens in [`AppState::build`];
//! `create_server` itself is just the route table and middleware stack.
//!
//! ## Middleware order
//!
//! `.layer()` calls nest inside-out: the last one applied wraps every one
//! before it, so it runs first on the way in and last on the way out. Outer
//! to inner on the request path: CORS, request timeout, body size limit,
//! request logging, metrics recording, ingress auth, then the handler.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router as AxumRouter;
use meridian_core::cache::build_cache;
use meridian_core::key_pool::{KeyPool, SelectionStrategy};
use meridian_core::providers::anthropic::AnthropicProvider;
use meridian_core::providers::azure::AzureProvider;
use meridian_core::providers::bedrock::{BedrockCredentials, BedrockProvider};
use meridian_core::providers::ollama::OllamaProvider;
use meridian_core::providers::vertex::{ServiceAccountKey, VertexProvider};
use meridian_core::providers::zai::ZAiProvider;
use meridian_core::providers::{ProviderAdapter, ProviderKind};
use meridian_core::routing::Router as CoreRouter;
use meridian_core::{DispatchHandler, HealthTracker, ProviderEntry, ProviderInfo, SignatureCache};
use tower_http::timeout::TimeoutLayer;

use crate::config::{Config, ProviderConfig};
use crate::handlers;
use crate::metrics::Metrics;
use crate::middleware::{cors_middleware, logging_middleware, metrics_middleware};

/// Shared across every handler and middleware layer. Cheap to clone: every
/// field is an `Arc`.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub dispatch: Arc<DispatchHandler>,
    pub metrics: Arc<Metrics>,
}

impl AppState {
    /// Builds the dispatch core from `config`: one adapter and optional key
    /// pool per enabled provider, a single shared `HealthTracker`, the
    /// configured routing strategy, and the signature cache on top of
    /// whichever cache backend `config.cache` names.
    ///
    /// The dispatch core takes one `HealthConfig` for its whole lifetime,
    /// while `ProviderConfig` carries a circuit breaker setting per provider.
    /// This resolves that by taking the lowest-named enabled provider's
    /// circuit breaker config as the shared one — a simplification, not a
    /// per-provider circuit breaker, documented alongside the rest of the
    /// gateway's design decisions.
    pub fn build(config: Arc<Config>) -> anyhow::Result<Self> {
        let mut enabled: Vec<(&String, &ProviderConfig)> =
            config.providers.iter().filter(|(_, p)| p.enabled).collect();
        enabled.sort_by(|a, b| a.0.cmp(b.0));

        if enabled.is_empty() {
            anyhow::bail!("no enabled providers to build a dispatch core from");
        }

        let health_config = enabled[0].1.circuit_breaker.into();
        let health = HealthTracker::new(health_config);

        let mut entries = Vec::with_capacity(enabled.len());
        for (name, provider_config) in &enabled {
            entries.push(build_provider_entry(name, provider_config, config.server.timeout)?);
        }

        let core_router = CoreRouter::new(config.routing.to_core_strategy(), Arc::clone(&health))
            .with_failover_timeout(config.routing.failover_timeout);

        let cache_backend = match &config.cache.backend {
            crate::config::CacheBackendConfig::Local { max_size, max_cost_bytes } => build_cache(
                meridian_core::cache::CacheBackendKind::Local,
                *max_size,
                *max_cost_bytes,
                None,
            )?,
            crate::config::CacheBackendConfig::Distributed { redis_url } => build_cache(
                meridian_core::cache::CacheBackendKind::Distributed,
                0,
                0,
                Some(redis_url.as_str()),
            )?,
            crate::config::CacheBackendConfig::Disabled => {
                build_cache(meridian_core::cache::CacheBackendKind::Disabled, 0, 0, None)?
            }
        };
        let signatures = SignatureCache::new(cache_backend);

        let dispatch = Arc::new(DispatchHandler::new(core_router, health, entries, signatures));

        Ok(Self {
            config,
            dispatch,
            metrics: Arc::new(Metrics::new()),
        })
    }

    /// Rebuilds the dispatch core from `new_config`, carrying the existing
    /// metrics sink forward so a reload doesn't reset request counters.
    /// Used by the hot-reload task in `main.rs`; never called mid-request.
    pub fn reload(&self, new_config: Arc<Config>) -> anyhow::Result<Self> {
        let mut next = Self::build(new_config)?;
        next.metrics = Arc::clone(&self.metrics);
        Ok(next)
    }

    /// An `AppState` with no configured providers, for unit tests that only
    /// exercise ingress auth or middleware and never actually dispatch.
    pub fn for_testing(config: Arc<Config>) -> Self {
        let health = HealthTracker::new(meridian_core::HealthConfig::default());
        let core_router = CoreRouter::new(config.routing.to_core_strategy(), Arc::clone(&health));
        let signatures = SignatureCache::new(Arc::new(meridian_core::cache::DisabledCache));
        let dispatch = Arc::new(DispatchHandler::new(core_router, health, Vec::new(), signatures));

        Self {
            config,
            dispatch,
            metrics: Arc::new(Metrics::new()),
        }
    }
}

/// Builds one [`ProviderEntry`]: the adapter for `config.kind`, and a
/// [`KeyPool`] when the provider carries rotating credentials (Anthropic
/// when not using transparent auth, Z.AI, Azure). Bedrock/Vertex/Ollama
/// authenticate with a single fixed credential or none at all, so they
/// never get a key pool.
fn build_provider_entry(
    name: &str,
    config: &ProviderConfig,
    timeout: std::time::Duration,
) -> anyhow::Result<ProviderEntry> {
    let model_rewrite = config.model_mapping.clone();

    let key_pool_if_keyed = || {
        if config.keys.is_empty() {
            None
        } else {
            Some(Arc::new(KeyPool::new(
                name,
                SelectionStrategy::WeightedRoundRobin,
                Config::key_configs(config),
            )))
        }
    };

    let (adapter, key_pool): (Arc<dyn ProviderAdapter>, Option<Arc<KeyPool>>) = match config.kind {
        ProviderKind::Anthropic => {
            let api_key = config.keys.first().map(|k| k.material.clone());
            let pool = if config.transparent_auth { None } else { key_pool_if_keyed() };
            let provider = AnthropicProvider::new(
                name,
                config.base_url.clone(),
                api_key,
                config.transparent_auth,
                model_rewrite,
                timeout,
            )?;
            (Arc::new(provider), pool)
        }
        ProviderKind::ZAi => {
            let api_key = config.keys.first().map(|k| k.material.clone()).unwrap_or_default();
            let pool = key_pool_if_keyed();
            let provider = ZAiProvider::new(name, config.base_url.clone(), api_key, model_rewrite, timeout)?;
            (Arc::new(provider), pool)
        }
        ProviderKind::Ollama => {
            let provider = OllamaProvider::new(name, config.base_url.clone(), model_rewrite, timeout)?;
            (Arc::new(provider), None)
        }
        ProviderKind::Bedrock => {
            let region = config
                .region
                .clone()
                .ok_or_else(|| anyhow::anyhow!("provider '{name}' is kind bedrock but has no region"))?;
            let credentials = BedrockCredentials {
                access_key_id: config
                    .access_key_id
                    .clone()
                    .ok_or_else(|| anyhow::anyhow!("provider '{name}' is missing access_key_id"))?,
                secret_access_key: config
                    .secret_access_key
                    .clone()
                    .ok_or_else(|| anyhow::anyhow!("provider '{name}' is missing secret_access_key"))?,
                session_token: config.session_token.clone(),
            };
            let provider = BedrockProvider::new(name, region, credentials, model_rewrite, timeout)?;
            (Arc::new(provider), None)
        }
        ProviderKind::Azure => {
            let base_url = config
                .base_url
                .clone()
                .ok_or_else(|| anyhow::anyhow!("provider '{name}' is kind azure but has no base_url"))?;
            let deployment = config
                .deployment
                .clone()
                .ok_or_else(|| anyhow::anyhow!("provider '{name}' is kind azure but has no deployment"))?;
            let api_key = config.keys.first().map(|k| k.material.clone()).unwrap_or_default();
            let pool = key_pool_if_keyed();
            let provider = AzureProvider::new(
                name,
                base_url,
                deployment,
                api_key,
                config.api_version.clone(),
                model_rewrite,
                timeout,
            )?;
            (Arc::new(provider), pool)
        }
        ProviderKind::Vertex => {
            let project = config
                .project
                .clone()
                .ok_or_else(|| anyhow::anyhow!("provider '{name}' is kind vertex but has no project"))?;
            let region = config
                .region
                .clone()
                .ok_or_else(|| anyhow::anyhow!("provider '{name}' is kind vertex but has no region"))?;
            let path = config.service_account_path.clone().ok_or_else(|| {
                anyhow::anyhow!("provider '{name}' is kind vertex but has no service_account_path")
            })?;
            let raw = std::fs::read_to_string(&path)
                .map_err(|e| anyhow::anyhow!("failed to read service account file for '{name}': {e}"))?;
            let service_account: ServiceAccountKey = serde_json::from_str(&raw)
                .map_err(|e| anyhow::anyhow!("failed to parse service account file for '{name}': {e}"))?;
            let provider = VertexProvider::new(name, project, region, service_account, model_rewrite, timeout)?;
            (Arc::new(provider), None)
        }
    };

    Ok(ProviderEntry {
        info: ProviderInfo {
            name: name.to_string(),
            priority: config.priority,
            weight: config.weight as i64,
        },
        adapter,
        key_pool,
    })
}

/// A hot-reloadable handle to the current `AppState`. Handlers and
/// middleware extract this as axum state, then call `.current()` to read an
/// `Arc<AppState>` snapshot — cheap, lock-free, and immune to seeing a
/// torn write if a reload lands mid-request. `main.rs`'s reload task holds
/// the same handle and calls `.swap()` once a new config validates.
#[derive(Clone)]
pub struct SharedState(Arc<arc_swap::ArcSwap<AppState>>);

impl SharedState {
    pub fn new(state: AppState) -> Self {
        Self(Arc::new(arc_swap::ArcSwap::new(Arc::new(state))))
    }

    pub fn current(&self) -> Arc<AppState> {
        self.0.load_full()
    }

    pub fn swap(&self, state: AppState) {
        self.0.store(Arc::new(state));
    }
}

/// Assembles the axum router: the six gateway routes plus the middleware
/// stack, with `shared` threaded through every handler and
/// `from_fn_with_state` layer. Returns the `SharedState` handle alongside the
/// router so a caller that wants hot-reload (`main.rs`) can hold onto it;
/// callers that don't (tests) can simply discard it.
pub fn create_server_with_handle(state: AppState) -> (SharedState, AxumRouter) {
    let cors = cors_middleware(&state.config.server.cors);
    let timeout = state.config.server.timeout;
    let max_body_size = state.config.server.max_body_size;
    let shared = SharedState::new(state);

    let router = AxumRouter::new()
        .route("/v1/messages", post(handlers::post_messages))
        .route("/v1/models", get(handlers::list_models))
        .route("/v1/providers", get(handlers::list_providers))
        .route("/v1/health-detail", get(handlers::health_detail))
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics_handler))
        .layer(axum::middleware::from_fn_with_state(
            shared.clone(),
            crate::auth::auth_middleware,
        ))
        .layer(axum::middleware::from_fn_with_state(shared.clone(), metrics_middleware))
        .layer(axum::middleware::from_fn_with_state(shared.clone(), logging_middleware))
        .layer(DefaultBodyLimit::max(max_body_size))
        .layer(TimeoutLayer::new(timeout))
        .layer(cors)
        .with_state(shared.clone());

    (shared, router)
}

/// Convenience wrapper for callers that don't need the reload handle.
pub fn create_server(state: AppState) -> AxumRouter {
    create_server_with_handle(state).1
}

/// Builds an `AppState` and the axum router in one call, for the common case
/// where the caller doesn't need to hold onto `AppState` itself (tests
/// needing `AppState::for_testing` go through that constructor directly).
pub fn build_server(config: Config) -> anyhow::Result<(AppState, AxumRouter)> {
    let state = AppState::build(Arc::new(config))?;
    let router = create_server(state.clone());
    Ok((state, router))
}

//! # Configuration
//!
//! Loads and validates [`Config`] from a TOML file, with environment-variable
//! overrides applied after parsing and schema validation applied after that.
//! Each section maps onto the dispatch core's own types
//! (`meridian_core::ProviderKind`, `RoutingStrategy`, `HealthConfig`,
//! `key_pool::KeyConfig`) so `server.rs` can build a `DispatchHandler`
//! directly off a parsed `Config` with no intermediate layer.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use meridian_core::providers::ProviderKind;
use serde::{Deserialize, Serialize};

/// Top-level configuration, loaded from a single TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    #[serde(default = "default_cors_origins")]
    pub allowed_origins: Vec<String>,
    #[serde(default)]
    pub allow_credentials: bool,
}

fn default_cors_origins() -> Vec<String> {
    vec!["*".to_string()]
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: default_cors_origins(),
            allow_credentials: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_server_timeout", with = "meridian_core::common::duration_serde")]
    pub timeout: Duration,
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
    #[serde(default)]
    pub cors: CorsConfig,
    /// Whether `X-Gateway-Strategy`/`X-Gateway-Provider` are attached to responses.
    #[serde(default)]
    pub debug_headers: bool,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_server_timeout() -> Duration {
    Duration::from_secs(120)
}

fn default_max_body_size() -> usize {
    10 * 1024 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            timeout: default_server_timeout(),
            max_body_size: default_max_body_size(),
            cors: CorsConfig::default(),
            debug_headers: false,
        }
    }
}

/// One configured credential. `input_tokens_per_minute`/`output_tokens_per_minute`
/// mirror the upstream rate-limit header pair the key pool can observe; the
/// core only tracks a single TPM ceiling per key, so [`KeyConfig::to_core_key`]
/// takes the tighter of the two (whichever would throttle first).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyConfig {
    pub id: String,
    pub material: String,
    #[serde(default = "default_rpm")]
    pub requests_per_minute: u32,
    #[serde(default = "default_tpm")]
    pub input_tokens_per_minute: u32,
    #[serde(default = "default_tpm")]
    pub output_tokens_per_minute: u32,
    #[serde(default)]
    pub weight: i32,
    #[serde(default)]
    pub priority: i32,
}

fn default_rpm() -> u32 {
    60
}

fn default_tpm() -> u32 {
    100_000
}

impl KeyConfig {
    fn to_core_key(&self) -> meridian_core::key_pool::KeyConfig {
        meridian_core::key_pool::KeyConfig {
            id: self.id.clone(),
            material: self.material.clone(),
            weight: self.weight as i64,
            priority: self.priority,
            rpm_limit: self.requests_per_minute,
            tpm_limit: self.input_tokens_per_minute.min(self.output_tokens_per_minute),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_open_duration", with = "meridian_core::common::duration_serde")]
    pub open_duration: Duration,
    #[serde(default = "default_half_open_probes")]
    pub half_open_probes: u32,
    #[serde(default = "default_health_check_interval", with = "meridian_core::common::duration_serde")]
    pub health_check_interval: Duration,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_open_duration() -> Duration {
    Duration::from_secs(30)
}

fn default_half_open_probes() -> u32 {
    3
}

fn default_health_check_interval() -> Duration {
    Duration::from_secs(10)
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            open_duration: default_open_duration(),
            half_open_probes: default_half_open_probes(),
            health_check_interval: default_health_check_interval(),
        }
    }
}

impl From<CircuitBreakerConfig> for meridian_core::health::HealthConfig {
    fn from(c: CircuitBreakerConfig) -> Self {
        meridian_core::health::HealthConfig {
            failure_threshold: c.failure_threshold,
            open_duration: c.open_duration,
            half_open_probes: c.half_open_probes,
            health_check_interval: c.health_check_interval,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub kind: ProviderKind,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub model_mapping: HashMap<String, String>,
    #[serde(default)]
    pub keys: Vec<KeyConfig>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_weight")]
    pub weight: i32,
    #[serde(default)]
    pub transparent_auth: bool,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    /// Bedrock-only: region and AWS credentials. `None` for every other kind.
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub access_key_id: Option<String>,
    #[serde(default)]
    pub secret_access_key: Option<String>,
    #[serde(default)]
    pub session_token: Option<String>,

    /// Azure-only.
    #[serde(default)]
    pub deployment: Option<String>,
    #[serde(default)]
    pub api_version: Option<String>,

    /// Vertex-only: service-account JSON, read from this path at startup.
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub service_account_path: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_weight() -> i32 {
    1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategyConfig {
    RoundRobin,
    WeightedRoundRobin,
    Shuffle,
    Failover,
    WeightedFailover,
    LeastLoaded,
}

impl Default for RoutingStrategyConfig {
    fn default() -> Self {
        RoutingStrategyConfig::Failover
    }
}

impl RoutingStrategyConfig {
    fn to_core(self) -> meridian_core::routing::RoutingStrategy {
        use meridian_core::routing::RoutingStrategy as Core;
        match self {
            RoutingStrategyConfig::RoundRobin => Core::RoundRobin,
            RoutingStrategyConfig::WeightedRoundRobin => Core::WeightedRoundRobin,
            RoutingStrategyConfig::Shuffle => Core::Shuffle,
            RoutingStrategyConfig::Failover => Core::Failover,
            RoutingStrategyConfig::WeightedFailover => Core::WeightedFailover,
            RoutingStrategyConfig::LeastLoaded => Core::LeastLoaded,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    #[serde(default)]
    pub strategy: RoutingStrategyConfig,
    /// Non-empty only when the deployment wants per-model provider pinning;
    /// its presence overrides `strategy` with `RoutingStrategy::ModelBased`,
    /// since the tagged enum above has no variant that can carry this map.
    #[serde(default)]
    pub model_mapping: HashMap<String, String>,
    #[serde(default)]
    pub default_provider: Option<String>,
    #[serde(default = "default_failover_timeout", with = "meridian_core::common::duration_serde")]
    pub failover_timeout: Duration,
    #[serde(default = "default_health_check_interval", with = "meridian_core::common::duration_serde")]
    pub health_check_interval: Duration,
}

fn default_failover_timeout() -> Duration {
    Duration::from_secs(5)
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            strategy: RoutingStrategyConfig::default(),
            model_mapping: HashMap::new(),
            default_provider: None,
            failover_timeout: default_failover_timeout(),
            health_check_interval: default_health_check_interval(),
        }
    }
}

impl RoutingConfig {
    pub fn to_core_strategy(&self) -> meridian_core::routing::RoutingStrategy {
        if self.model_mapping.is_empty() {
            self.strategy.to_core()
        } else {
            meridian_core::routing::RoutingStrategy::ModelBased {
                model_mapping: self.model_mapping.clone(),
                default_provider: self.default_provider.clone(),
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngressAuthMode {
    SharedKey,
    TransparentBearer,
    Both,
}

impl Default for IngressAuthMode {
    fn default() -> Self {
        IngressAuthMode::SharedKey
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub mode: IngressAuthMode,
    #[serde(default)]
    pub shared_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum CacheBackendConfig {
    Local {
        #[serde(default = "default_cache_max_size")]
        max_size: usize,
        #[serde(default = "default_cache_max_cost_bytes")]
        max_cost_bytes: usize,
    },
    Distributed {
        redis_url: String,
    },
    Disabled,
}

fn default_cache_max_size() -> usize {
    10_000
}

fn default_cache_max_cost_bytes() -> usize {
    64 * 1024 * 1024
}

impl Default for CacheBackendConfig {
    fn default() -> Self {
        CacheBackendConfig::Local {
            max_size: default_cache_max_size(),
            max_cost_bytes: default_cache_max_cost_bytes(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub backend: CacheBackendConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_metrics_retention", with = "meridian_core::common::duration_serde")]
    pub retention: Duration,
}

fn default_metrics_retention() -> Duration {
    Duration::from_secs(60 * 60)
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            retention: default_metrics_retention(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            providers: HashMap::new(),
            routing: RoutingConfig::default(),
            auth: AuthConfig::default(),
            cache: CacheConfig::default(),
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Config {
    /// Load, parse, and validate a config file. Env overrides are applied
    /// between parsing and schema validation, so a bad override fails loudly
    /// at startup rather than slipping past validation silently.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read config file {}: {}", path, e))?;
        let mut config: Config = toml::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("failed to parse config file {}: {}", path, e))?;
        config.apply_env_overrides()?;
        config.validate_schema()?;
        Ok(config)
    }

    /// Re-parse and re-validate `path` for hot-reload, without touching `self`.
    pub fn reload_from(path: &Path) -> anyhow::Result<Self> {
        Self::load(path.to_string_lossy().as_ref())
    }

    /// Env overrides for the handful of settings operators most often need to
    /// flip without editing the file: listen address, log level, and the
    /// shared ingress key (so it need not live in a checked-in TOML file).
    fn apply_env_overrides(&mut self) -> anyhow::Result<()> {
        if let Ok(host) = std::env::var("MERIDIAN_HOST") {
            self.server.host = host;
        }
        if let Ok(port) = std::env::var("MERIDIAN_PORT") {
            self.server.port = port
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid MERIDIAN_PORT: {}", e))?;
        }
        if let Ok(level) = std::env::var("MERIDIAN_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(key) = std::env::var("MERIDIAN_SHARED_KEY") {
            self.auth.shared_key = Some(key);
        }
        Ok(())
    }

    /// Cross-field checks a per-field serde default can't express: at least
    /// one enabled provider, shared-key modes actually carry a key, and every
    /// Bedrock/Vertex/Azure provider carries the fields its adapter needs.
    pub fn validate_schema(&self) -> anyhow::Result<()> {
        if self.providers.values().filter(|p| p.enabled).count() == 0 {
            anyhow::bail!("configuration must enable at least one provider");
        }

        match self.auth.mode {
            IngressAuthMode::SharedKey | IngressAuthMode::Both => {
                if self.auth.shared_key.as_deref().unwrap_or("").is_empty() {
                    anyhow::bail!("auth.mode requires a shared_key but none is configured");
                }
            }
            IngressAuthMode::TransparentBearer => {}
        }

        for (name, provider) in &self.providers {
            if !provider.enabled {
                continue;
            }
            match provider.kind {
                ProviderKind::Bedrock => {
                    if provider.region.is_none() {
                        anyhow::bail!("provider '{}' is kind bedrock but has no region", name);
                    }
                    if provider.access_key_id.is_none() || provider.secret_access_key.is_none() {
                        anyhow::bail!("provider '{}' is kind bedrock but is missing AWS credentials", name);
                    }
                }
                ProviderKind::Vertex => {
                    if provider.project.is_none() || provider.region.is_none() {
                        anyhow::bail!("provider '{}' is kind vertex but is missing project/region", name);
                    }
                    if provider.service_account_path.is_none() {
                        anyhow::bail!("provider '{}' is kind vertex but has no service_account_path", name);
                    }
                }
                ProviderKind::Azure => {
                    if provider.deployment.is_none() {
                        anyhow::bail!("provider '{}' is kind azure but has no deployment", name);
                    }
                }
                ProviderKind::Anthropic | ProviderKind::ZAi | ProviderKind::Ollama => {}
            }
        }

        if let CacheBackendConfig::Distributed { redis_url } = &self.cache.backend {
            if redis_url.is_empty() {
                anyhow::bail!("cache.backend = distributed requires a redis_url");
            }
        }

        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.validate_schema()
    }

    pub fn key_configs(provider: &ProviderConfig) -> Vec<meridian_core::key_pool::KeyConfig> {
        provider.keys.iter().map(KeyConfig::to_core_key).collect()
    }
}

/// Parse a human-written duration string for CLI/env contexts outside serde.
pub fn parse_duration(s: &str) -> anyhow::Result<Duration> {
    meridian_core::common::duration_serde::parse_duration(s).map_err(|e| anyhow::anyhow!(e))
}

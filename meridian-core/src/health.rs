//! # Health Tracker
//!
//! Per-provider circuit-breaker state. The router consults [`HealthTracker::healthy`]
//! before selecting a candidate; the dispatch handler calls [`HealthTracker::record`]
//! after every upstream attempt finishes.
//!
//! State machine: `Closed` (normal) → `Open` (after `failure_threshold` consecutive
//! retryable failures) → `HalfOpen` (after `open_duration` elapses, or a background
//! probe succeeds) → `Closed` again (after `half_open_probes` consecutive successes).
//! Any failure while `HalfOpen` sends the provider straight back to `Open`.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::error::ProviderError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthState {
    Closed,
    Open,
    HalfOpen,
}

/// Outcome of a single upstream attempt, as reported to [`HealthTracker::record`].
/// Only `RetryableFailure` counts against the failure threshold; non-retryable
/// failures (4xx validation errors, bad config) do not indicate the provider
/// itself is unhealthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    RetryableFailure,
    NonRetryableFailure,
}

impl Outcome {
    /// Classify a [`ProviderError`] per the retryable-failure rule: HTTP 429,
    /// 500, 502, 503, 504, timeouts, and network/connection errors count;
    /// everything else does not.
    pub fn from_provider_error(err: &ProviderError) -> Self {
        if err.is_retryable() {
            Outcome::RetryableFailure
        } else {
            Outcome::NonRetryableFailure
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    pub failure_threshold: u32,
    #[serde(with = "crate::common::duration_serde")]
    pub open_duration: Duration,
    pub half_open_probes: u32,
    #[serde(with = "crate::common::duration_serde")]
    pub health_check_interval: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_duration: Duration::from_secs(30),
            half_open_probes: 3,
            health_check_interval: Duration::from_secs(10),
        }
    }
}

#[derive(Debug)]
struct ProviderHealth {
    state: HealthState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
}

impl Default for ProviderHealth {
    fn default() -> Self {
        Self {
            state: HealthState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            opened_at: None,
        }
    }
}

/// Snapshot of a provider's health, exposed at `GET /v1/health-detail`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub state: HealthState,
    pub consecutive_failures: u32,
    pub opened_at: Option<chrono::DateTime<chrono::Utc>>,
}

type ProbeFn = Box<dyn Fn() -> Pin<Box<dyn Future<Output = Result<(), ProviderError>> + Send>> + Send + Sync>;

/// Per-provider circuit breaker pool with a background liveness-probe loop
/// for providers currently `Open`.
pub struct HealthTracker {
    config: HealthConfig,
    providers: RwLock<HashMap<String, ProviderHealth>>,
    probes: RwLock<HashMap<String, ProbeFn>>,
    shutdown: CancellationToken,
}

impl HealthTracker {
    pub fn new(config: HealthConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            providers: RwLock::new(HashMap::new()),
            probes: RwLock::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        })
    }

    /// Register a liveness probe for `provider`, used by the background sweep
    /// while that provider is `Open`. A minimal request — e.g. a short-lived
    /// models listing, or a zero-token completion if no such endpoint exists.
    pub async fn register_probe<F, Fut>(&self, provider: &str, probe: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ProviderError>> + Send + 'static,
    {
        let boxed: ProbeFn = Box::new(move || Box::pin(probe()));
        self.probes.write().await.insert(provider.to_string(), boxed);
    }

    /// Whether `provider` currently accepts traffic. `Closed` and `HalfOpen`
    /// return true; `Open` returns false until `open_duration` has elapsed,
    /// at which point this call itself performs the `Open` → `HalfOpen`
    /// transition and returns true.
    pub async fn healthy(&self, provider: &str) -> bool {
        let mut providers = self.providers.write().await;
        let entry = providers.entry(provider.to_string()).or_default();

        match entry.state {
            HealthState::Closed | HealthState::HalfOpen => true,
            HealthState::Open => {
                let elapsed = entry.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.config.open_duration {
                    entry.state = HealthState::HalfOpen;
                    entry.consecutive_successes = 0;
                    tracing::info!(provider, "health tracker: Open -> HalfOpen (duration elapsed)");
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record the outcome of an attempt against `provider`.
    pub async fn record(&self, provider: &str, outcome: Outcome) {
        let mut providers = self.providers.write().await;
        let entry = providers.entry(provider.to_string()).or_default();

        match outcome {
            Outcome::Success => {
                entry.consecutive_failures = 0;
                match entry.state {
                    HealthState::Closed => {}
                    HealthState::HalfOpen => {
                        entry.consecutive_successes += 1;
                        if entry.consecutive_successes >= self.config.half_open_probes {
                            entry.state = HealthState::Closed;
                            entry.consecutive_successes = 0;
                            entry.opened_at = None;
                            tracing::info!(provider, "health tracker: HalfOpen -> Closed");
                        }
                    }
                    HealthState::Open => {
                        entry.state = HealthState::HalfOpen;
                        entry.consecutive_successes = 1;
                        tracing::info!(provider, "health tracker: Open -> HalfOpen (probe success)");
                    }
                }
            }
            Outcome::RetryableFailure => {
                entry.consecutive_successes = 0;
                entry.consecutive_failures += 1;
                match entry.state {
                    HealthState::Closed => {
                        if entry.consecutive_failures >= self.config.failure_threshold {
                            entry.state = HealthState::Open;
                            entry.opened_at = Some(Instant::now());
                            tracing::warn!(
                                provider,
                                failures = entry.consecutive_failures,
                                "health tracker: Closed -> Open"
                            );
                        }
                    }
                    HealthState::HalfOpen => {
                        entry.state = HealthState::Open;
                        entry.opened_at = Some(Instant::now());
                        tracing::warn!(provider, "health tracker: HalfOpen -> Open");
                    }
                    HealthState::Open => {}
                }
            }
            Outcome::NonRetryableFailure => {
                // Does not count toward the failure threshold.
            }
        }
    }

    /// Snapshot of every provider's current health, for the introspection endpoint.
    pub async fn snapshot(&self) -> HashMap<String, HealthSnapshot> {
        let providers = self.providers.read().await;
        providers
            .iter()
            .map(|(name, health)| {
                let opened_at = health.opened_at.map(|instant| {
                    let elapsed = instant.elapsed();
                    chrono::Utc::now() - chrono::Duration::from_std(elapsed).unwrap_or_default()
                });
                (
                    name.clone(),
                    HealthSnapshot {
                        state: health.state,
                        consecutive_failures: health.consecutive_failures,
                        opened_at,
                    },
                )
            })
            .collect()
    }

    /// Spawn the background sweep that probes every `Open` provider every
    /// `health_check_interval`, moving it to `HalfOpen` on a successful probe.
    /// Cooperative with `shutdown()`.
    pub fn spawn_background_sweep(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(tracker.config.health_check_interval) => {}
                    _ = tracker.shutdown.cancelled() => break,
                }
                tracker.sweep_open_providers().await;
            }
        })
    }

    async fn sweep_open_providers(&self) {
        let open: Vec<String> = {
            let providers = self.providers.read().await;
            providers
                .iter()
                .filter(|(_, h)| h.state == HealthState::Open)
                .map(|(name, _)| name.clone())
                .collect()
        };

        for name in open {
            let fut = {
                let probes = self.probes.read().await;
                match probes.get(&name) {
                    Some(probe_fn) => probe_fn(),
                    None => continue,
                }
            };
            if fut.await.is_ok() {
                self.record(&name, Outcome::Success).await;
            }
        }
    }

    /// Stop the background sweep task.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> HealthConfig {
        HealthConfig {
            failure_threshold: 2,
            open_duration: Duration::from_millis(50),
            half_open_probes: 2,
            health_check_interval: Duration::from_secs(60),
        }
    }

    #[tokio::test]
    async fn closed_by_default_and_stays_closed_on_success() {
        let tracker = HealthTracker::new(test_config());
        assert!(tracker.healthy("anthropic").await);
        tracker.record("anthropic", Outcome::Success).await;
        assert!(tracker.healthy("anthropic").await);
    }

    #[tokio::test]
    async fn opens_after_threshold_consecutive_failures() {
        let tracker = HealthTracker::new(test_config());
        tracker.record("zai", Outcome::RetryableFailure).await;
        assert!(tracker.healthy("zai").await);
        tracker.record("zai", Outcome::RetryableFailure).await;
        assert!(!tracker.healthy("zai").await);
    }

    #[tokio::test]
    async fn non_retryable_failures_do_not_open_circuit() {
        let tracker = HealthTracker::new(test_config());
        for _ in 0..10 {
            tracker.record("ollama", Outcome::NonRetryableFailure).await;
        }
        assert!(tracker.healthy("ollama").await);
    }

    #[tokio::test]
    async fn transitions_to_half_open_then_closed_after_duration_and_successes() {
        let tracker = HealthTracker::new(test_config());
        tracker.record("bedrock", Outcome::RetryableFailure).await;
        tracker.record("bedrock", Outcome::RetryableFailure).await;
        assert!(!tracker.healthy("bedrock").await);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(tracker.healthy("bedrock").await);

        tracker.record("bedrock", Outcome::Success).await;
        tracker.record("bedrock", Outcome::Success).await;
        assert!(tracker.healthy("bedrock").await);
    }

    #[tokio::test]
    async fn any_failure_in_half_open_reopens() {
        let tracker = HealthTracker::new(test_config());
        tracker.record("azure", Outcome::RetryableFailure).await;
        tracker.record("azure", Outcome::RetryableFailure).await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(tracker.healthy("azure").await);

        tracker.record("azure", Outcome::RetryableFailure).await;
        assert!(!tracker.healthy("azure").await);
    }
}

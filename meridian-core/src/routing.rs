//! # Router
//!
//! Selects a provider from a list of candidates, and — in
//! [`Router::select_with_retry`] — races the healthy candidates against each
//! other on failure. The router consults a [`HealthTracker`] for candidate
//! health and a [`Trigger`] set to decide whether a given failure warrants
//! failing over at all.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::{CoreError, ProviderError};
use crate::health::HealthTracker;
use crate::triggers::{self, Trigger};

/// A routable backend: its name (used for health/key-pool lookups), a
/// priority (higher wins failover ties), and a weight (used by the weighted
/// strategies).
#[derive(Debug, Clone)]
pub struct ProviderInfo {
    pub name: String,
    pub priority: i32,
    pub weight: i64,
}

impl ProviderInfo {
    fn effective_weight(&self) -> i64 {
        if self.weight <= 0 {
            1
        } else {
            self.weight
        }
    }
}

#[derive(Debug, Clone)]
pub enum RoutingStrategy {
    RoundRobin,
    WeightedRoundRobin,
    Shuffle,
    Failover,
    WeightedFailover,
    LeastLoaded,
    ModelBased {
        model_mapping: HashMap<String, String>,
        default_provider: Option<String>,
    },
}

struct WeightedState {
    fingerprint: u64,
    current_weights: Vec<i64>,
}

struct ShuffleState {
    fingerprint: u64,
    order: Vec<usize>,
    cursor: usize,
}

/// Outcome of racing a provider in `select_with_retry`.
pub enum RaceOutcome<T> {
    Success(ProviderInfo, T),
    Failure(ProviderInfo, ProviderError),
}

/// Candidate selection and the parallel-retry race engine.
pub struct Router {
    strategy: RoutingStrategy,
    health: Arc<HealthTracker>,
    triggers: Vec<Trigger>,
    failover_timeout: Duration,

    round_robin_cursor: AtomicUsize,
    weighted_state: Mutex<WeightedState>,
    shuffle_state: Mutex<ShuffleState>,
    in_flight: DashMap<String, Arc<AtomicI64>>,
}

impl Router {
    pub fn new(strategy: RoutingStrategy, health: Arc<HealthTracker>) -> Self {
        Self {
            strategy,
            health,
            triggers: Trigger::DEFAULT.to_vec(),
            failover_timeout: Duration::from_secs(5),
            round_robin_cursor: AtomicUsize::new(0),
            weighted_state: Mutex::new(WeightedState {
                fingerprint: 0,
                current_weights: Vec::new(),
            }),
            shuffle_state: Mutex::new(ShuffleState {
                fingerprint: 0,
                order: Vec::new(),
                cursor: 0,
            }),
            in_flight: DashMap::new(),
        }
    }

    pub fn with_triggers(mut self, triggers: Vec<Trigger>) -> Self {
        self.triggers = triggers;
        self
    }

    pub fn with_failover_timeout(mut self, timeout: Duration) -> Self {
        self.failover_timeout = timeout;
        self
    }

    /// Increment the in-flight counter for `name`, for the least-loaded strategy.
    pub fn acquire_slot(&self, name: &str) {
        self.in_flight
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(AtomicI64::new(0)))
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement the in-flight counter for `name`.
    pub fn release_slot(&self, name: &str) {
        if let Some(counter) = self.in_flight.get(name) {
            counter.fetch_sub(1, Ordering::Relaxed);
        }
    }

    async fn healthy_candidates(&self, infos: &[ProviderInfo]) -> Vec<ProviderInfo> {
        let mut healthy = Vec::with_capacity(infos.len());
        for info in infos {
            if self.health.healthy(&info.name).await {
                healthy.push(info.clone());
            }
        }
        healthy
    }

    fn fingerprint(infos: &[ProviderInfo]) -> u64 {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};
        let mut hasher = DefaultHasher::new();
        for info in infos {
            info.name.hash(&mut hasher);
        }
        hasher.finish()
    }

    /// Select one candidate from `infos` per the configured strategy, after
    /// filtering to healthy providers.
    pub async fn select(
        &self,
        infos: &[ProviderInfo],
        model: Option<&str>,
    ) -> Result<ProviderInfo, CoreError> {
        if infos.is_empty() {
            return Err(CoreError::NoProviders);
        }
        let healthy = self.healthy_candidates(infos).await;
        if healthy.is_empty() {
            return Err(CoreError::AllProvidersUnhealthy);
        }

        match &self.strategy {
            RoutingStrategy::RoundRobin => {
                let idx = self.round_robin_cursor.fetch_add(1, Ordering::Relaxed) % healthy.len();
                Ok(healthy[idx].clone())
            }
            RoutingStrategy::WeightedRoundRobin => Ok(self.weighted_round_robin_pick(&healthy).await),
            RoutingStrategy::Shuffle => Ok(self.shuffle_pick(&healthy).await),
            RoutingStrategy::Failover => Ok(Self::failover_order(&healthy)[0].clone()),
            RoutingStrategy::WeightedFailover => Ok(Self::weighted_failover_order(&healthy)[0].clone()),
            RoutingStrategy::LeastLoaded => Ok(self.least_loaded_pick(&healthy)),
            RoutingStrategy::ModelBased {
                model_mapping,
                default_provider,
            } => Self::model_based_pick(&healthy, model, model_mapping, default_provider),
        }
    }

    async fn weighted_round_robin_pick(&self, healthy: &[ProviderInfo]) -> ProviderInfo {
        let fingerprint = Self::fingerprint(healthy);
        let mut state = self.weighted_state.lock().await;
        if state.fingerprint != fingerprint {
            state.fingerprint = fingerprint;
            state.current_weights = vec![0; healthy.len()];
        }

        let total: i64 = healthy.iter().map(|p| p.effective_weight()).sum();
        let mut best_idx = 0usize;
        let mut best_weight = i64::MIN;
        for (idx, provider) in healthy.iter().enumerate() {
            state.current_weights[idx] += provider.effective_weight();
            if state.current_weights[idx] > best_weight {
                best_weight = state.current_weights[idx];
                best_idx = idx;
            }
        }
        state.current_weights[best_idx] -= total;
        healthy[best_idx].clone()
    }

    async fn shuffle_pick(&self, healthy: &[ProviderInfo]) -> ProviderInfo {
        let fingerprint = Self::fingerprint(healthy);
        let mut state = self.shuffle_state.lock().await;
        let needs_reshuffle =
            state.fingerprint != fingerprint || state.order.is_empty() || state.cursor >= state.order.len();

        if needs_reshuffle {
            state.fingerprint = fingerprint;
            state.order = (0..healthy.len()).collect();
            shuffle_indices(&mut state.order);
            state.cursor = 0;
        }

        let idx = state.order[state.cursor];
        state.cursor += 1;
        healthy[idx].clone()
    }

    fn failover_order(healthy: &[ProviderInfo]) -> Vec<ProviderInfo> {
        let mut ordered = healthy.to_vec();
        ordered.sort_by(|a, b| b.priority.cmp(&a.priority));
        ordered
    }

    fn weighted_failover_order(healthy: &[ProviderInfo]) -> Vec<ProviderInfo> {
        let mut ordered = healthy.to_vec();
        ordered.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| b.effective_weight().cmp(&a.effective_weight()))
        });
        ordered
    }

    fn least_loaded_pick(&self, healthy: &[ProviderInfo]) -> ProviderInfo {
        let load = |name: &str| -> i64 {
            self.in_flight
                .get(name)
                .map(|c| c.load(Ordering::Relaxed))
                .unwrap_or(0)
        };

        let min_load = healthy.iter().map(|p| load(&p.name)).min().unwrap_or(0);
        let mut tied: Vec<&ProviderInfo> = healthy.iter().filter(|p| load(&p.name) == min_load).collect();
        tied.sort_by(|a, b| b.priority.cmp(&a.priority));
        let top_priority = tied[0].priority;
        let top_tied: Vec<&ProviderInfo> = tied.into_iter().filter(|p| p.priority == top_priority).collect();

        if top_tied.len() == 1 {
            top_tied[0].clone()
        } else {
            let idx = fastrand_index(top_tied.len());
            top_tied[idx].clone()
        }
    }

    fn model_based_pick(
        healthy: &[ProviderInfo],
        model: Option<&str>,
        model_mapping: &HashMap<String, String>,
        default_provider: &Option<String>,
    ) -> Result<ProviderInfo, CoreError> {
        if let Some(requested_model) = model {
            let best_prefix = model_mapping
                .keys()
                .filter(|prefix| requested_model.starts_with(prefix.as_str()))
                .max_by_key(|prefix| prefix.len());

            if let Some(prefix) = best_prefix {
                let provider_name = &model_mapping[prefix];
                if let Some(found) = healthy.iter().find(|p| &p.name == provider_name) {
                    return Ok(found.clone());
                }
            }
        }

        if let Some(default_name) = default_provider {
            if let Some(found) = healthy.iter().find(|p| &p.name == default_name) {
                return Ok(found.clone());
            }
        }

        Err(CoreError::Configuration {
            message: "model-based routing: no matching prefix and no default provider available".to_string(),
        })
    }

    /// Race all healthy candidates on failure (§4.4.1). `try_provider` is
    /// invoked once for the primary; if it fails and a trigger matches, every
    /// remaining healthy candidate is raced concurrently and the first
    /// success wins.
    pub async fn select_with_retry<F, Fut, T>(
        &self,
        infos: &[ProviderInfo],
        parent_cancel: &CancellationToken,
        try_provider: F,
    ) -> Result<(ProviderInfo, T), CoreError>
    where
        F: Fn(ProviderInfo, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ProviderError>> + Send + 'static,
        T: Send + 'static,
    {
        if infos.is_empty() {
            return Err(CoreError::NoProviders);
        }
        let healthy = self.healthy_candidates(infos).await;
        if healthy.is_empty() {
            return Err(CoreError::AllProvidersUnhealthy);
        }

        let ordered = Self::failover_order(&healthy);

        if ordered.len() == 1 {
            let provider = ordered[0].clone();
            let child = parent_cancel.child_token();
            return match try_provider(provider.clone(), child).await {
                Ok(value) => Ok((provider, value)),
                Err(e) => Err(CoreError::Provider(e)),
            };
        }

        let primary = ordered[0].clone();
        let primary_token = parent_cancel.child_token();
        let primary_result = tokio::select! {
            res = try_provider(primary.clone(), primary_token) => res,
            _ = parent_cancel.cancelled() => return Err(CoreError::Cancelled),
        };

        match primary_result {
            Ok(value) => return Ok((primary, value)),
            Err(err) => {
                if !triggers::should_failover(&self.triggers, &err) {
                    return Err(CoreError::Provider(err));
                }
                tracing::info!(
                    provider = %primary.name,
                    trigger = ?triggers::find_matching_trigger(&self.triggers, &err),
                    "router: primary failed, racing all healthy providers"
                );
            }
        }

        self.race_all(ordered, parent_cancel, try_provider).await
    }

    async fn race_all<F, Fut, T>(
        &self,
        candidates: Vec<ProviderInfo>,
        parent_cancel: &CancellationToken,
        try_provider: F,
    ) -> Result<(ProviderInfo, T), CoreError>
    where
        F: Fn(ProviderInfo, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ProviderError>> + Send + 'static,
        T: Send + 'static,
    {
        let race_token = parent_cancel.child_token();
        let deadline = self.failover_timeout;
        let try_provider = Arc::new(try_provider);

        let mut join_set = tokio::task::JoinSet::new();
        for provider in candidates {
            let token = race_token.child_token();
            let try_provider = Arc::clone(&try_provider);
            join_set.spawn(async move {
                let result = tokio::time::timeout(deadline, try_provider(provider.clone(), token)).await;
                match result {
                    Ok(Ok(value)) => RaceOutcome::Success(provider, value),
                    Ok(Err(e)) => RaceOutcome::Failure(provider, e),
                    Err(_) => RaceOutcome::Failure(provider, ProviderError::Timeout),
                }
            });
        }

        let mut last_error: Option<ProviderError> = None;
        loop {
            tokio::select! {
                next = join_set.join_next() => {
                    match next {
                        Some(Ok(RaceOutcome::Success(provider, value))) => {
                            race_token.cancel();
                            join_set.abort_all();
                            return Ok((provider, value));
                        }
                        Some(Ok(RaceOutcome::Failure(_, e))) => {
                            last_error = Some(e);
                        }
                        Some(Err(_join_error)) => {}
                        None => break,
                    }
                }
                _ = parent_cancel.cancelled() => {
                    race_token.cancel();
                    join_set.abort_all();
                    return Err(CoreError::Cancelled);
                }
            }
        }

        race_token.cancel();
        Err(CoreError::AllAttemptsFailed {
            last_error: last_error.map(|e| e.to_string()).unwrap_or_else(|| "no candidates attempted".to_string()),
        })
    }
}

fn shuffle_indices(order: &mut [usize]) {
    use rand::rngs::OsRng;
    use rand::RngCore;

    let mut rng_state = [0u8; 8];
    if OsRng.try_fill_bytes(&mut rng_state).is_err() {
        let seed = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        rng_state = seed.to_le_bytes();
    }
    let mut seed = u64::from_le_bytes(rng_state);

    // Fisher-Yates using a small xorshift PRNG seeded from the above.
    for i in (1..order.len()).rev() {
        seed ^= seed << 13;
        seed ^= seed >> 7;
        seed ^= seed << 17;
        let j = (seed as usize) % (i + 1);
        order.swap(i, j);
    }
}

fn fastrand_index(len: usize) -> usize {
    use rand::Rng;
    rand::thread_rng().gen_range(0..len)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(name: &str, priority: i32, weight: i64) -> ProviderInfo {
        ProviderInfo {
            name: name.to_string(),
            priority,
            weight,
        }
    }

    #[tokio::test]
    async fn empty_input_errors_no_providers() {
        let router = Router::new(RoutingStrategy::RoundRobin, HealthTracker::new(Default::default()));
        let err = router.select(&[], None).await.unwrap_err();
        assert!(matches!(err, CoreError::NoProviders));
    }

    #[tokio::test]
    async fn round_robin_cycles_across_calls() {
        let router = Router::new(RoutingStrategy::RoundRobin, HealthTracker::new(Default::default()));
        let infos = vec![provider("a", 0, 1), provider("b", 0, 1)];
        let first = router.select(&infos, None).await.unwrap();
        let second = router.select(&infos, None).await.unwrap();
        assert_ne!(first.name, second.name);
    }

    #[tokio::test]
    async fn failover_picks_highest_priority() {
        let router = Router::new(RoutingStrategy::Failover, HealthTracker::new(Default::default()));
        let infos = vec![provider("low", 1, 1), provider("high", 10, 1)];
        let chosen = router.select(&infos, None).await.unwrap();
        assert_eq!(chosen.name, "high");
    }

    #[tokio::test]
    async fn weighted_round_robin_is_proportional_over_a_full_cycle() {
        let router = Router::new(RoutingStrategy::WeightedRoundRobin, HealthTracker::new(Default::default()));
        let infos = vec![provider("a", 0, 3), provider("b", 0, 1)];
        let mut counts = std::collections::HashMap::new();
        for _ in 0..4 {
            let chosen = router.select(&infos, None).await.unwrap();
            *counts.entry(chosen.name).or_insert(0) += 1;
        }
        assert_eq!(counts.get("a").copied().unwrap_or(0), 3);
        assert_eq!(counts.get("b").copied().unwrap_or(0), 1);
    }

    #[tokio::test]
    async fn shuffle_visits_every_provider_once_per_round() {
        let router = Router::new(RoutingStrategy::Shuffle, HealthTracker::new(Default::default()));
        let infos = vec![provider("a", 0, 1), provider("b", 0, 1), provider("c", 0, 1)];
        let mut seen = std::collections::HashSet::new();
        for _ in 0..3 {
            let chosen = router.select(&infos, None).await.unwrap();
            seen.insert(chosen.name);
        }
        assert_eq!(seen.len(), 3);
    }

    #[tokio::test]
    async fn select_with_retry_single_survivor_returns_its_outcome() {
        let router = Router::new(RoutingStrategy::Failover, HealthTracker::new(Default::default()));
        let infos = vec![provider("only", 0, 1)];
        let token = CancellationToken::new();
        let result = router
            .select_with_retry(&infos, &token, |_info, _token| async { Ok::<_, ProviderError>(42) })
            .await
            .unwrap();
        assert_eq!(result.1, 42);
    }

    #[tokio::test]
    async fn select_with_retry_races_on_failover_trigger() {
        let router = Router::new(RoutingStrategy::Failover, HealthTracker::new(Default::default()));
        let infos = vec![provider("bad", 10, 1), provider("good", 1, 1)];
        let token = CancellationToken::new();
        let result = router
            .select_with_retry(&infos, &token, |info, _token| async move {
                if info.name == "bad" {
                    Err(ProviderError::Upstream {
                        status: 503,
                        message: "down".to_string(),
                    })
                } else {
                    Ok(99)
                }
            })
            .await
            .unwrap();
        assert_eq!(result.0.name, "good");
        assert_eq!(result.1, 99);
    }

    #[tokio::test]
    async fn select_with_retry_does_not_retry_non_retryable_errors() {
        let router = Router::new(RoutingStrategy::Failover, HealthTracker::new(Default::default()));
        let infos = vec![provider("primary", 10, 1), provider("secondary", 1, 1)];
        let token = CancellationToken::new();
        let err = router
            .select_with_retry(&infos, &token, |info, _token| async move {
                if info.name == "primary" {
                    Err(ProviderError::ModelNotFound {
                        model: "x".to_string(),
                    })
                } else {
                    Ok(1)
                }
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CoreError::Provider(ProviderError::ModelNotFound { .. })
        ));
    }
}

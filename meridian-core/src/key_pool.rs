//! # Key Pool
//!
//! Holds the credentials for one provider and selects one per request under
//! per-key RPM/TPM ceilings. Selection is pluggable; counters are protected
//! by a per-key lock so the hot path never takes a pool-wide lock.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::CoreError;

/// Static configuration for one credential in the pool.
#[derive(Debug, Clone)]
pub struct KeyConfig {
    pub id: String,
    pub material: String,
    pub weight: i64,
    pub priority: i32,
    pub rpm_limit: u32,
    pub tpm_limit: u32,
}

impl KeyConfig {
    /// A weight of zero or less is coerced to 1, per the pool's edge-case rule.
    fn effective_weight(&self) -> i64 {
        if self.weight <= 0 {
            1
        } else {
            self.weight
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionStrategy {
    RoundRobin,
    WeightedRoundRobin,
    Shuffle,
    Priority,
    LeastLoaded,
}

/// What kind of upstream failure a key experienced, for [`KeyPool::report_failure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// 401/403 — the credential itself is bad; disable the key.
    Unauthorized,
    /// 429 — quota exhaustion only, handled via `report_upstream` header parsing.
    RateLimited,
}

struct KeyCounters {
    remaining_rpm: u32,
    remaining_tpm: u32,
    reset_at: Instant,
    disabled: bool,
}

struct KeyEntry {
    config: KeyConfig,
    counters: Mutex<KeyCounters>,
    in_flight: AtomicU32,
    current_weight: Mutex<i64>,
}

pub struct Stats {
    pub total_keys: usize,
    pub available_keys: usize,
    pub exhausted_keys: usize,
    pub total_rpm: u64,
    pub remaining_rpm: u64,
}

/// A rotating pool of credentials for one provider.
pub struct KeyPool {
    provider: String,
    strategy: SelectionStrategy,
    keys: Vec<KeyEntry>,
    round_robin_cursor: AtomicUsize,
    reset_window: Duration,
}

impl KeyPool {
    pub fn new(provider: impl Into<String>, strategy: SelectionStrategy, keys: Vec<KeyConfig>) -> Self {
        let now = Instant::now();
        let reset_window = Duration::from_secs(60);
        let entries = keys
            .into_iter()
            .map(|config| {
                let counters = Mutex::new(KeyCounters {
                    remaining_rpm: config.rpm_limit,
                    remaining_tpm: config.tpm_limit,
                    reset_at: now + reset_window,
                    disabled: false,
                });
                KeyEntry {
                    config,
                    counters,
                    in_flight: AtomicU32::new(0),
                    current_weight: Mutex::new(0),
                }
            })
            .collect();

        Self {
            provider: provider.into(),
            strategy,
            keys: entries,
            round_robin_cursor: AtomicUsize::new(0),
            reset_window,
        }
    }

    /// Refresh `entry`'s counters if its reset instant has lapsed. Returns
    /// whether the key is currently available (remaining RPM > 0, not
    /// disabled).
    fn refresh_and_check(&self, entry: &KeyEntry) -> bool {
        let mut counters = entry.counters.lock().expect("key counters lock poisoned");
        if counters.disabled {
            return false;
        }
        if Instant::now() >= counters.reset_at {
            counters.remaining_rpm = entry.config.rpm_limit;
            counters.remaining_tpm = entry.config.tpm_limit;
            counters.reset_at = Instant::now() + self.reset_window;
        }
        counters.remaining_rpm > 0
    }

    /// Pick an available key per the configured strategy. Returns the key ID
    /// and material, or an exhaustion error carrying the earliest reset delay.
    pub fn acquire(&self) -> Result<(String, String), CoreError> {
        if self.keys.is_empty() {
            return Err(CoreError::KeyPoolExhausted {
                provider: self.provider.clone(),
                reset_in_secs: 0,
            });
        }

        let available: Vec<&KeyEntry> = self
            .keys
            .iter()
            .filter(|entry| self.refresh_and_check(entry))
            .collect();

        if available.is_empty() {
            let earliest = self
                .keys
                .iter()
                .map(|entry| {
                    let counters = entry.counters.lock().expect("key counters lock poisoned");
                    counters.reset_at
                })
                .min()
                .unwrap_or_else(Instant::now);
            let reset_in_secs = earliest.saturating_duration_since(Instant::now()).as_secs();
            return Err(CoreError::KeyPoolExhausted {
                provider: self.provider.clone(),
                reset_in_secs,
            });
        }

        let chosen = match self.strategy {
            SelectionStrategy::RoundRobin => {
                let idx = self.round_robin_cursor.fetch_add(1, Ordering::Relaxed) % available.len();
                available[idx]
            }
            SelectionStrategy::WeightedRoundRobin => self.weighted_round_robin_pick(&available),
            SelectionStrategy::Shuffle => {
                let idx = fastrand_index(available.len());
                available[idx]
            }
            SelectionStrategy::Priority => available
                .iter()
                .max_by_key(|entry| entry.config.priority)
                .copied()
                .unwrap_or(available[0]),
            SelectionStrategy::LeastLoaded => available
                .iter()
                .min_by_key(|entry| entry.in_flight.load(Ordering::Relaxed))
                .copied()
                .unwrap_or(available[0]),
        };

        chosen.in_flight.fetch_add(1, Ordering::Relaxed);
        Ok((chosen.config.id.clone(), chosen.config.material.clone()))
    }

    /// Smooth weighted round-robin: each candidate's `current_weight`
    /// accumulates its configured weight every pick; the candidate with the
    /// highest `current_weight` is chosen and discounted by the sum of all
    /// weights, spreading picks proportionally over time.
    fn weighted_round_robin_pick<'a>(&self, available: &[&'a KeyEntry]) -> &'a KeyEntry {
        let total_weight: i64 = available.iter().map(|e| e.config.effective_weight()).sum();
        let mut best: Option<(&KeyEntry, i64)> = None;

        for entry in available {
            let mut current = entry.current_weight.lock().expect("weight lock poisoned");
            *current += entry.config.effective_weight();
            let replace = match best {
                Some((_, w)) => *current > w,
                None => true,
            };
            if replace {
                best = Some((entry, *current));
            }
        }

        let (chosen, _) = best.expect("available is non-empty");
        let mut current = chosen.current_weight.lock().expect("weight lock poisoned");
        *current -= total_weight;
        chosen
    }

    /// Release the in-flight slot taken by `acquire` once the request completes.
    pub fn release(&self, key_id: &str) {
        if let Some(entry) = self.keys.iter().find(|e| e.config.id == key_id) {
            entry.in_flight.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Parse provider rate-limit headers and atomically update `key_id`'s counters.
    /// Unparseable or absent headers are logged at debug and otherwise ignored.
    pub fn report_upstream(&self, key_id: &str, headers: &reqwest::header::HeaderMap) {
        let Some(entry) = self.keys.iter().find(|e| e.config.id == key_id) else {
            return;
        };
        let mut counters = entry.counters.lock().expect("key counters lock poisoned");

        if let Some(remaining) = parse_header_u32(headers, "anthropic-ratelimit-requests-remaining") {
            counters.remaining_rpm = remaining;
        }
        if let Some(remaining) = parse_header_u32(headers, "anthropic-ratelimit-input-tokens-remaining") {
            counters.remaining_tpm = remaining;
        }
        if let Some(reset_at) = parse_header_reset(headers, "anthropic-ratelimit-requests-reset") {
            counters.reset_at = reset_at;
        }
    }

    /// Mark a key unavailable on a persistent authorization failure.
    /// `RateLimited` is a no-op here: 429 only consumes quota, tracked via
    /// `report_upstream`, and does not disable the key.
    pub fn report_failure(&self, key_id: &str, kind: FailureKind) {
        if kind != FailureKind::Unauthorized {
            return;
        }
        if let Some(entry) = self.keys.iter().find(|e| e.config.id == key_id) {
            let mut counters = entry.counters.lock().expect("key counters lock poisoned");
            counters.disabled = true;
            tracing::warn!(provider = %self.provider, key_id, "key pool: disabling key after authorization failure");
        }
    }

    pub fn stats(&self) -> Stats {
        let mut available = 0usize;
        let mut total_rpm = 0u64;
        let mut remaining_rpm = 0u64;

        for entry in &self.keys {
            let counters = entry.counters.lock().expect("key counters lock poisoned");
            total_rpm += entry.config.rpm_limit as u64;
            if !counters.disabled && counters.remaining_rpm > 0 {
                available += 1;
            }
            remaining_rpm += counters.remaining_rpm as u64;
        }

        Stats {
            total_keys: self.keys.len(),
            available_keys: available,
            exhausted_keys: self.keys.len() - available,
            total_rpm,
            remaining_rpm,
        }
    }
}

/// A degenerate pool is still total: zero keys always reports exhausted.
fn parse_header_u32(headers: &reqwest::header::HeaderMap, name: &str) -> Option<u32> {
    headers.get(name)?.to_str().ok()?.parse().ok()
}

fn parse_header_reset(headers: &reqwest::header::HeaderMap, name: &str) -> Option<Instant> {
    let raw = headers.get(name)?.to_str().ok()?;
    let parsed = chrono::DateTime::parse_from_rfc3339(raw).ok()?;
    let delta = parsed.with_timezone(&chrono::Utc) - chrono::Utc::now();
    let std_delta = delta.to_std().unwrap_or(Duration::ZERO);
    Some(Instant::now() + std_delta)
}

/// Lightweight shuffle index, avoiding a dependency beyond the workspace's
/// existing `rand` crate.
fn fastrand_index(len: usize) -> usize {
    use rand::Rng;
    rand::thread_rng().gen_range(0..len)
}

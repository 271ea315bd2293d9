//! # Metrics
//!
//! An in-process, hand-rolled Prometheus text-exposition sink. `GET /metrics`
//! combines this module's request counters and latency histogram with live
//! circuit-breaker state pulled straight from `meridian_core::HealthTracker`.
//!
//! This is scoped to what the dispatch core actually exposes: request counts,
//! latency, and per-provider health. There is no per-user or billing data
//! here — the core has no concept of an end user, and nothing upstream of
//! it tracks cost, so inventing those fields here would just be noise.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use dashmap::DashMap;

/// Bucket upper bounds in seconds, matching a typical Prometheus client's
/// default HTTP histogram buckets.
const LATENCY_BUCKETS_SECONDS: [f64; 11] = [
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct RequestKey {
    method: String,
    path: String,
    status: u16,
}

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct RouteKey {
    method: String,
    path: String,
}

#[derive(Debug, Default)]
struct RouteStats {
    bucket_counts: [u64; LATENCY_BUCKETS_SECONDS.len()],
    count: u64,
    sum_seconds: f64,
}

/// Request counters and a latency histogram keyed by `(method, path[, status])`,
/// plus a per-provider dispatch counter. One instance lives for the life of
/// the process, shared behind `Arc` in `AppState`.
#[derive(Default)]
pub struct Metrics {
    requests: DashMap<RequestKey, AtomicU64>,
    latencies: DashMap<RouteKey, Mutex<RouteStats>>,
    provider_requests: DashMap<String, AtomicU64>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one completed HTTP request. Called from `metrics_middleware`
    /// after the response status is known.
    pub fn record_request(&self, method: &str, path: &str, status: u16, latency: Duration) {
        let request_key = RequestKey {
            method: method.to_string(),
            path: path.to_string(),
            status,
        };
        self.requests
            .entry(request_key)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);

        let route_key = RouteKey {
            method: method.to_string(),
            path: path.to_string(),
        };
        let entry = self
            .latencies
            .entry(route_key)
            .or_insert_with(|| Mutex::new(RouteStats::default()));
        let mut stats = entry.lock().expect("metrics mutex poisoned");
        let seconds = latency.as_secs_f64();
        stats.count += 1;
        stats.sum_seconds += seconds;
        for (bucket, bound) in stats.bucket_counts.iter_mut().zip(LATENCY_BUCKETS_SECONDS.iter()) {
            if seconds <= *bound {
                *bucket += 1;
            }
        }
    }

    /// Records one request dispatched to a given upstream provider,
    /// independent of whether it ultimately succeeded.
    pub fn record_provider_request(&self, provider: &str) {
        self.provider_requests
            .entry(provider.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Renders everything this sink tracks as Prometheus text exposition
    /// format. Provider health gauges are appended separately by the
    /// `/metrics` handler, which has access to `HealthTracker::snapshot`.
    pub fn render(&self) -> String {
        let mut out = String::new();

        out.push_str("# HELP meridian_requests_total Total HTTP requests handled by the gateway.\n");
        out.push_str("# TYPE meridian_requests_total counter\n");
        for entry in self.requests.iter() {
            let key = entry.key();
            out.push_str(&format!(
                "meridian_requests_total{{method=\"{}\",path=\"{}\",status=\"{}\"}} {}\n",
                key.method,
                key.path,
                key.status,
                entry.value().load(Ordering::Relaxed)
            ));
        }

        out.push_str("# HELP meridian_request_duration_seconds Request latency in seconds.\n");
        out.push_str("# TYPE meridian_request_duration_seconds histogram\n");
        for entry in self.latencies.iter() {
            let key = entry.key();
            let stats = entry.value().lock().expect("metrics mutex poisoned");
            for (bound, bucket_count) in LATENCY_BUCKETS_SECONDS.iter().zip(stats.bucket_counts.iter()) {
                out.push_str(&format!(
                    "meridian_request_duration_seconds_bucket{{method=\"{}\",path=\"{}\",le=\"{}\"}} {}\n",
                    key.method, key.path, bound, bucket_count
                ));
            }
            out.push_str(&format!(
                "meridian_request_duration_seconds_bucket{{method=\"{}\",path=\"{}\",le=\"+Inf\"}} {}\n",
                key.method, key.path, stats.count
            ));
            out.push_str(&format!(
                "meridian_request_duration_seconds_sum{{method=\"{}\",path=\"{}\"}} {}\n",
                key.method, key.path, stats.sum_seconds
            ));
            out.push_str(&format!(
                "meridian_request_duration_seconds_count{{method=\"{}\",path=\"{}\"}} {}\n",
                key.method, key.path, stats.count
            ));
        }

        out.push_str("# HELP meridian_provider_requests_total Requests dispatched per upstream provider.\n");
        out.push_str("# TYPE meridian_provider_requests_total counter\n");
        for entry in self.provider_requests.iter() {
            out.push_str(&format!(
                "meridian_provider_requests_total{{provider=\"{}\"}} {}\n",
                entry.key(),
                entry.value().load(Ordering::Relaxed)
            ));
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_request_counts_per_status() {
        let metrics = Metrics::new();
        metrics.record_request("POST", "/v1/messages", 200, Duration::from_millis(50));
        metrics.record_request("POST", "/v1/messages", 200, Duration::from_millis(80));
        metrics.record_request("POST", "/v1/messages", 429, Duration::from_millis(5));

        let rendered = metrics.render();
        assert!(rendered.contains("method=\"POST\",path=\"/v1/messages\",status=\"200\"} 2"));
        assert!(rendered.contains("method=\"POST\",path=\"/v1/messages\",status=\"429\"} 1"));
    }

    #[test]
    fn histogram_buckets_are_cumulative_per_bucket() {
        let metrics = Metrics::new();
        metrics.record_request("GET", "/v1/models", 200, Duration::from_millis(3));
        metrics.record_request("GET", "/v1/models", 200, Duration::from_secs(1));

        let rendered = metrics.render();
        assert!(rendered.contains("le=\"0.005\"} 1"));
        assert!(rendered.contains("le=\"+Inf\"} 2"));
        assert!(rendered.contains("_count{method=\"GET\",path=\"/v1/models\"} 2"));
    }

    #[test]
    fn tracks_provider_request_counts_independently() {
        let metrics = Metrics::new();
        metrics.record_provider_request("anthropic-primary");
        metrics.record_provider_request("anthropic-primary");
        metrics.record_provider_request("bedrock-us-east-1");

        let rendered = metrics.render();
        assert!(rendered.contains("provider=\"anthropic-primary\"} 2"));
        assert!(rendered.contains("provider=\"bedrock-us-east-1\"} 1"));
    }
}

//! Router Metrics
//!
//! Observability for the dispatch layer:
//! - Per-provider request, success, failure, and retry counts
//! - Admission timeouts (rate-limit token and concurrency permit waits)
//! - Fallback chain advances and exhaustions
//! - Routed call latency

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

// ============================================================================
// Histogram for Latency Tracking
// ============================================================================

/// A histogram for tracking latency distributions
#[derive(Debug)]
pub struct Histogram {
    /// Bucket upper bounds, in milliseconds
    buckets: Vec<f64>,
    counts: Vec<AtomicU64>,
    total_count: AtomicU64,
    sum: AtomicU64,
    max: AtomicU64,
}

impl Histogram {
    pub fn new(buckets: Vec<f64>) -> Self {
        let counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            counts,
            total_count: AtomicU64::new(0),
            sum: AtomicU64::new(0),
            max: AtomicU64::new(0),
        }
    }

    /// Default latency buckets (in milliseconds)
    pub fn latency_default() -> Self {
        Self::new(vec![
            10.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0, 30000.0, 60000.0,
            120000.0,
        ])
    }

    pub fn record(&self, value_ms: f64) {
        let Some(last) = self.buckets.len().checked_sub(1) else {
            return;
        };
        let bucket_idx = self
            .buckets
            .iter()
            .position(|&b| value_ms <= b)
            .unwrap_or(last);

        self.counts[bucket_idx].fetch_add(1, Ordering::Relaxed);
        self.total_count.fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(value_ms as u64, Ordering::Relaxed);
        self.max.fetch_max(value_ms as u64, Ordering::Relaxed);
    }

    pub fn record_duration(&self, duration: Duration) {
        self.record(duration.as_secs_f64() * 1000.0);
    }

    pub fn snapshot(&self) -> HistogramSnapshot {
        let total = self.total_count.load(Ordering::Relaxed);
        let sum = self.sum.load(Ordering::Relaxed);
        HistogramSnapshot {
            buckets: self.buckets.clone(),
            counts: self
                .counts
                .iter()
                .map(|c| c.load(Ordering::Relaxed))
                .collect(),
            total,
            max: self.max.load(Ordering::Relaxed),
            mean: if total > 0 {
                sum as f64 / total as f64
            } else {
                0.0
            },
        }
    }
}

/// Snapshot of histogram data
#[derive(Clone, Debug)]
pub struct HistogramSnapshot {
    pub buckets: Vec<f64>,
    pub counts: Vec<u64>,
    pub total: u64,
    pub max: u64,
    pub mean: f64,
}

impl HistogramSnapshot {
    /// Upper bound of the bucket holding the given percentile
    pub fn percentile(&self, p: f64) -> f64 {
        if self.total == 0 {
            return 0.0;
        }

        let target = ((self.total as f64 * p).ceil() as u64).max(1);
        let mut cumulative = 0u64;
        for (i, &count) in self.counts.iter().enumerate() {
            cumulative += count;
            if cumulative >= target {
                return self.buckets[i];
            }
        }

        *self.buckets.last().unwrap_or(&0.0)
    }

    pub fn p50(&self) -> f64 {
        self.percentile(0.5)
    }

    pub fn p99(&self) -> f64 {
        self.percentile(0.99)
    }
}

// ============================================================================
// Counter
// ============================================================================

/// A simple atomic counter
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Per-Provider Metrics
// ============================================================================

/// Metrics for a single provider
#[derive(Debug, Default)]
pub struct ProviderMetrics {
    /// Calls made to the provider
    pub requests: Counter,
    pub successes: Counter,
    pub failures: Counter,
    /// Retries scheduled by the backoff loop
    pub retries: Counter,
    /// Token or permit waits that timed out
    pub admission_timeouts: Counter,
}

impl ProviderMetrics {
    pub fn error_rate(&self) -> f64 {
        let total = self.requests.get();
        if total == 0 {
            return 0.0;
        }
        self.failures.get() as f64 / total as f64
    }

    pub fn snapshot(&self) -> ProviderMetricsSnapshot {
        ProviderMetricsSnapshot {
            requests: self.requests.get(),
            successes: self.successes.get(),
            failures: self.failures.get(),
            retries: self.retries.get(),
            admission_timeouts: self.admission_timeouts.get(),
            error_rate: self.error_rate(),
        }
    }
}

/// Point-in-time copy of [`ProviderMetrics`]
#[derive(Clone, Debug, PartialEq)]
pub struct ProviderMetricsSnapshot {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub retries: u64,
    pub admission_timeouts: u64,
    pub error_rate: f64,
}

// ============================================================================
// Router Metrics
// ============================================================================

/// Centralized metrics for the router
#[derive(Debug)]
pub struct RouterMetrics {
    providers: DashMap<String, Arc<ProviderMetrics>>,
    /// `route` calls
    pub routed: Counter,
    /// Chain moved past a candidate that was tried
    pub fallback_advances: Counter,
    /// Chain ran out of candidates
    pub chains_exhausted: Counter,
    /// End-to-end `route` latency
    pub route_latency: Histogram,
}

impl Default for RouterMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl RouterMetrics {
    pub fn new() -> Self {
        Self {
            providers: DashMap::new(),
            routed: Counter::new(),
            fallback_advances: Counter::new(),
            chains_exhausted: Counter::new(),
            route_latency: Histogram::latency_default(),
        }
    }

    /// Get or create metrics for a provider
    pub fn provider(&self, provider: &str) -> Arc<ProviderMetrics> {
        if let Some(metrics) = self.providers.get(provider) {
            return Arc::clone(metrics.value());
        }
        Arc::clone(
            self.providers
                .entry(provider.to_string())
                .or_default()
                .value(),
        )
    }

    pub fn summary(&self) -> RouterMetricsSummary {
        let providers: BTreeMap<String, ProviderMetricsSnapshot> = self
            .providers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().snapshot()))
            .collect();
        let latency = self.route_latency.snapshot();

        RouterMetricsSummary {
            routed: self.routed.get(),
            fallback_advances: self.fallback_advances.get(),
            chains_exhausted: self.chains_exhausted.get(),
            route_latency_p50_ms: latency.p50(),
            route_latency_p99_ms: latency.p99(),
            providers,
        }
    }
}

/// Summary of router metrics
#[derive(Clone, Debug)]
pub struct RouterMetricsSummary {
    pub routed: u64,
    pub fallback_advances: u64,
    pub chains_exhausted: u64,
    pub route_latency_p50_ms: f64,
    pub route_latency_p99_ms: f64,
    /// Per-provider snapshots, sorted by name
    pub providers: BTreeMap<String, ProviderMetricsSnapshot>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram_percentiles() {
        let hist = Histogram::new(vec![10.0, 100.0, 1000.0]);
        for _ in 0..9 {
            hist.record(5.0);
        }
        hist.record(500.0);

        let snapshot = hist.snapshot();
        assert_eq!(snapshot.total, 10);
        assert_eq!(snapshot.max, 500);
        assert_eq!(snapshot.p50(), 10.0);
        assert_eq!(snapshot.p99(), 1000.0);
    }

    #[test]
    fn test_histogram_overflow_lands_in_last_bucket() {
        let hist = Histogram::new(vec![10.0, 100.0]);
        hist.record_duration(Duration::from_secs(5));
        assert_eq!(hist.snapshot().counts, vec![0, 1]);
    }

    #[test]
    fn test_provider_metrics_shared() {
        let metrics = RouterMetrics::new();
        metrics.provider("mcp").requests.inc();
        metrics.provider("mcp").requests.inc();
        metrics.provider("mcp").failures.inc();
        metrics.provider("anthropic").successes.inc();

        let summary = metrics.summary();
        let mcp = &summary.providers["mcp"];
        assert_eq!(mcp.requests, 2);
        assert!((mcp.error_rate - 0.5).abs() < f64::EPSILON);
        assert_eq!(
            summary.providers.keys().collect::<Vec<_>>(),
            vec!["anthropic", "mcp"]
        );
    }
}

//! Provider health metrics collection and reporting
//!
//! Tracks latency percentiles and success rates of listings requests per provider.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::RwLock;

/// Maximum number of samples to keep for metrics calculation
const MAX_SAMPLES: usize = 100;

/// Metrics for a single provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderMetrics {
    /// Name of the provider
    pub provider_name: String,
    /// 50th percentile latency in milliseconds
    pub latency_p50_ms: f64,
    /// 99th percentile latency in milliseconds
    pub latency_p99_ms: f64,
    /// Success rate (0.0 to 1.0)
    pub success_rate: f64,
    /// Total number of requests tracked
    pub total_requests: u64,
    /// Number of failed requests
    pub failed_requests: u64,
}

impl ProviderMetrics {
    /// Creates metrics with no data
    pub fn empty(provider_name: &str) -> Self {
        Self {
            provider_name: provider_name.to_string(),
            latency_p50_ms: 0.0,
            latency_p99_ms: 0.0,
            success_rate: 1.0,
            total_requests: 0,
            failed_requests: 0,
        }
    }
}

/// Internal sample for latency tracking
#[derive(Debug, Clone)]
struct LatencySample {
    duration_ms: f64,
    success: bool,
}

#[derive(Debug, Default)]
struct ProviderSamples {
    /// Rolling window of latency samples
    samples: VecDeque<LatencySample>,
    /// Total requests (lifetime)
    total_requests: u64,
    /// Failed requests (lifetime)
    failed_requests: u64,
}

/// Collects and computes metrics for every provider an engine talks to
pub struct MetricsCollector {
    providers: RwLock<HashMap<String, ProviderSamples>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            providers: RwLock::new(HashMap::new()),
        }
    }

    /// Records a request with its duration and success status
    pub async fn record_request(&self, provider: &str, duration: Duration, success: bool) {
        let duration_ms = duration.as_secs_f64() * 1000.0;

        let mut providers = self.providers.write().await;
        let entry = providers.entry(provider.to_string()).or_default();

        entry.total_requests += 1;
        if !success {
            entry.failed_requests += 1;
        }

        if entry.samples.len() >= MAX_SAMPLES {
            entry.samples.pop_front();
        }
        entry.samples.push_back(LatencySample {
            duration_ms,
            success,
        });
    }

    /// Computes current metrics for one provider
    pub async fn get_metrics(&self, provider: &str) -> ProviderMetrics {
        let providers = self.providers.read().await;
        match providers.get(provider) {
            Some(samples) => compute(provider, samples),
            None => ProviderMetrics::empty(provider),
        }
    }

    /// Computes current metrics for every provider seen so far, sorted by name
    pub async fn all_metrics(&self) -> Vec<ProviderMetrics> {
        let providers = self.providers.read().await;
        let mut metrics: Vec<ProviderMetrics> = providers
            .iter()
            .map(|(name, samples)| compute(name, samples))
            .collect();
        metrics.sort_by(|a, b| a.provider_name.cmp(&b.provider_name));
        metrics
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

fn compute(provider_name: &str, samples: &ProviderSamples) -> ProviderMetrics {
    if samples.samples.is_empty() {
        return ProviderMetrics::empty(provider_name);
    }

    // Extract successful latencies for percentile calculation
    let mut latencies: Vec<f64> = samples
        .samples
        .iter()
        .filter(|s| s.success)
        .map(|s| s.duration_ms)
        .collect();

    latencies.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let total = samples.total_requests;
    let failed = samples.failed_requests;
    let success_rate = if total > 0 {
        (total - failed) as f64 / total as f64
    } else {
        1.0
    };

    ProviderMetrics {
        provider_name: provider_name.to_string(),
        latency_p50_ms: percentile(&latencies, 50.0),
        latency_p99_ms: percentile(&latencies, 99.0),
        success_rate,
        total_requests: total,
        failed_requests: failed,
    }
}

/// Calculate percentile from sorted values
fn percentile(sorted_values: &[f64], p: f64) -> f64 {
    if sorted_values.is_empty() {
        return 0.0;
    }

    let idx = (p / 100.0 * (sorted_values.len() - 1) as f64).round() as usize;
    sorted_values[idx.min(sorted_values.len() - 1)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_metrics_collector() {
        let collector = MetricsCollector::new();

        collector
            .record_request("coingecko", Duration::from_millis(100), true)
            .await;
        collector
            .record_request("coingecko", Duration::from_millis(200), true)
            .await;
        collector
            .record_request("coingecko", Duration::from_millis(150), false)
            .await;
        collector
            .record_request("cryptocompare", Duration::from_millis(90), false)
            .await;

        let metrics = collector.get_metrics("coingecko").await;
        assert_eq!(metrics.provider_name, "coingecko");
        assert_eq!(metrics.total_requests, 3);
        assert_eq!(metrics.failed_requests, 1);
        assert!(metrics.success_rate > 0.6 && metrics.success_rate < 0.7);

        let all = collector.all_metrics().await;
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].provider_name, "cryptocompare");
        assert_eq!(all[1].success_rate, 0.0);
    }

    #[tokio::test]
    async fn test_unknown_provider_is_empty() {
        let collector = MetricsCollector::new();
        assert_eq!(
            collector.get_metrics("nobody").await,
            ProviderMetrics::empty("nobody")
        );
    }

    #[test]
    fn test_percentile() {
        let values = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0];
        assert_eq!(percentile(&values, 50.0), 5.0);
        assert_eq!(percentile(&values, 99.0), 9.0);
        assert_eq!(percentile(&[], 50.0), 0.0);
    }
}

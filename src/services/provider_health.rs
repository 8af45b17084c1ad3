use std::collections::HashMap;
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::RwLock;

use crate::services::providers::probe_with_timeout;
use crate::services::registry::ProviderRegistry;

/// Weight of the newest observation in the recent-health score.
const SCORE_WEIGHT: f64 = 0.3;

/// Health as seen by the selector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProviderStatus {
    pub healthy: bool,
    pub response_time_ms: u64,
    /// Exponentially weighted success rate in `[0, 1]`.
    pub score: f64,
}

#[derive(Debug, Clone)]
struct Entry {
    status: ProviderStatus,
    checked_at: Option<Instant>,
}

impl Entry {
    fn new() -> Self {
        Self {
            status: ProviderStatus {
                healthy: true,
                response_time_ms: 0,
                score: 1.0,
            },
            checked_at: None,
        }
    }

    fn observe(&mut self, success: bool) {
        let sample = if success { 1.0 } else { 0.0 };
        self.status.score = SCORE_WEIGHT * sample + (1.0 - SCORE_WEIGHT) * self.status.score;
    }
}

/// Cached provider health, re-probed when older than the TTL.
///
/// The score blends probe results with generation outcomes the worker
/// reports, so a provider that answers probes but keeps failing jobs sinks
/// in the ranking.
pub struct HealthMonitor {
    entries: RwLock<HashMap<String, Entry>>,
    ttl: Duration,
    probe_timeout: Duration,
}

impl HealthMonitor {
    pub fn new(ttl: Duration, probe_timeout: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
            probe_timeout,
        }
    }

    /// Probe every provider whose cached health is missing or expired.
    /// Probes run concurrently, each under the probe timeout.
    pub async fn refresh(&self, registry: &ProviderRegistry) {
        let stale: Vec<_> = {
            let entries = self.entries.read().await;
            registry
                .providers()
                .iter()
                .filter(|provider| {
                    entries
                        .get(provider.name())
                        .and_then(|entry| entry.checked_at)
                        .map_or(true, |at| at.elapsed() >= self.ttl)
                })
                .cloned()
                .collect()
        };
        if stale.is_empty() {
            return;
        }

        let results = join_all(stale.iter().map(|provider| async move {
            let health = probe_with_timeout(provider.as_ref(), self.probe_timeout).await;
            (provider.name().to_string(), health)
        }))
        .await;

        let mut entries = self.entries.write().await;
        let now = Instant::now();
        for (name, health) in results {
            if !health.healthy {
                tracing::warn!(provider = %name, response_time_ms = health.response_time_ms, "Provider unhealthy");
            }
            let entry = entries.entry(name).or_insert_with(Entry::new);
            entry.status.healthy = health.healthy;
            entry.status.response_time_ms = health.response_time_ms;
            entry.checked_at = Some(now);
            entry.observe(health.healthy);
        }
    }

    /// Feed a generation outcome into the provider's score.
    pub async fn record_outcome(&self, provider: &str, success: bool) {
        self.entries
            .write()
            .await
            .entry(provider.to_string())
            .or_insert_with(Entry::new)
            .observe(success);
    }

    /// Last known status. Providers never probed count as healthy.
    pub async fn status(&self, provider: &str) -> ProviderStatus {
        self.entries
            .read()
            .await
            .get(provider)
            .map_or_else(|| Entry::new().status, |entry| entry.status)
    }

    /// Status of every registered provider, in registration order.
    pub async fn statuses(&self, registry: &ProviderRegistry) -> Vec<(String, ProviderStatus)> {
        let mut out = Vec::with_capacity(registry.len());
        for name in registry.names() {
            out.push((name.to_string(), self.status(name).await));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::services::providers::{MockBehavior, MockProvider};

    fn registry() -> ProviderRegistry {
        ProviderRegistry::new()
            .register(Arc::new(MockProvider::new("up", MockBehavior::Succeed)))
            .register(Arc::new(MockProvider::new("down", MockBehavior::Unhealthy)))
    }

    #[tokio::test]
    async fn test_refresh_records_probe_results() {
        let monitor = HealthMonitor::new(Duration::from_secs(30), Duration::from_secs(1));
        let registry = registry();
        monitor.refresh(&registry).await;

        assert!(monitor.status("up").await.healthy);
        let down = monitor.status("down").await;
        assert!(!down.healthy);
        assert!(down.score < 1.0);
    }

    #[tokio::test]
    async fn test_outcomes_lower_score() {
        let monitor = HealthMonitor::new(Duration::from_secs(30), Duration::from_secs(1));
        monitor.record_outcome("up", false).await;
        monitor.record_outcome("up", false).await;
        let status = monitor.status("up").await;
        assert!(status.healthy);
        assert!((status.score - 0.49).abs() < 1e-9);

        monitor.record_outcome("up", true).await;
        assert!(monitor.status("up").await.score > status.score);
    }

    #[tokio::test]
    async fn test_fresh_entries_are_not_reprobed() {
        let monitor = HealthMonitor::new(Duration::from_secs(3600), Duration::from_secs(1));
        let registry = registry();
        monitor.refresh(&registry).await;
        let first = monitor.status("down").await.score;
        monitor.refresh(&registry).await;
        assert_eq!(monitor.status("down").await.score, first);
    }
}

use std::cmp::Ordering;
use std::sync::Arc;

use crate::models::generation::GenerationRequest;
use crate::services::provider_health::HealthMonitor;
use crate::services::providers::VideoProvider;
use crate::services::registry::ProviderRegistry;

#[derive(Debug, thiserror::Error)]
pub enum SelectionError {
    #[error("No provider available for a {duration}s {resolution} {aspect_ratio} video")]
    NoProviderAvailable {
        duration: u32,
        resolution: String,
        aspect_ratio: String,
    },
}

/// Picks the provider for a request.
///
/// A healthy, registered preferred provider wins outright. Otherwise the
/// healthy providers whose capabilities cover the request are ranked by cost
/// (ascending), recent health score (descending), then registration order.
/// Selection is advisory and reserves nothing.
pub struct ProviderSelector {
    registry: Arc<ProviderRegistry>,
    health: Arc<HealthMonitor>,
}

impl ProviderSelector {
    pub fn new(registry: Arc<ProviderRegistry>, health: Arc<HealthMonitor>) -> Self {
        Self { registry, health }
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub async fn select(
        &self,
        request: &GenerationRequest,
        preferred: Option<&str>,
    ) -> Result<Arc<dyn VideoProvider>, SelectionError> {
        self.health.refresh(&self.registry).await;

        if let Some(name) = preferred {
            match self.registry.get(name) {
                Some(provider) => {
                    if self.health.status(name).await.healthy {
                        return Ok(provider);
                    }
                    tracing::info!(provider = name, "Preferred provider unhealthy; ranking alternatives");
                }
                None => {
                    tracing::info!(provider = name, "Preferred provider not registered; ranking alternatives");
                }
            }
        }

        let mut candidates = Vec::new();
        for (index, provider) in self.registry.providers().iter().enumerate() {
            let status = self.health.status(provider.name()).await;
            let capabilities = provider.capabilities();
            if status.healthy && capabilities.supports(request) {
                candidates.push((capabilities.cost_per_second, status.score, index, provider));
            }
        }

        candidates
            .into_iter()
            .min_by(|a, b| rank((a.0, a.1, a.2), (b.0, b.1, b.2)))
            .map(|(_, _, _, provider)| provider.clone())
            .ok_or_else(|| SelectionError::NoProviderAvailable {
                duration: request.duration_seconds,
                resolution: request.resolution.to_string(),
                aspect_ratio: request.aspect_ratio.to_string(),
            })
    }
}

/// `(cost, score, registration index)`: lower cost, then higher score, then
/// earlier registration sorts first.
fn rank(a: (f64, f64, usize), b: (f64, f64, usize)) -> Ordering {
    a.0.total_cmp(&b.0)
        .then_with(|| b.1.total_cmp(&a.1))
        .then_with(|| a.2.cmp(&b.2))
}

use std::sync::Arc;

use crate::config::AppConfig;
use crate::services::providers::{
    GeminiProvider, MockBehavior, MockProvider, ProviderError, VideoProvider, WanAiProvider,
};

/// Providers configured for this process, in registration order.
///
/// Built once at start-up and read-only afterwards. Registration order is the
/// final tie-breaker during selection.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: Vec<Arc<dyn VideoProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a provider. A later provider with an already registered name
    /// replaces the earlier one in place.
    pub fn register(mut self, provider: Arc<dyn VideoProvider>) -> Self {
        match self.position(provider.name()) {
            Some(index) => {
                tracing::warn!(provider = provider.name(), "Replacing duplicate provider");
                self.providers[index] = provider;
            }
            None => self.providers.push(provider),
        }
        self
    }

    /// Mock first, then Wan, then Gemini. A vendor is enabled iff its API
    /// key is present.
    pub fn from_config(config: &AppConfig) -> Result<Self, ProviderError> {
        let mut registry = Self::new();

        if config.use_mock_provider {
            registry = registry.register(Arc::new(MockProvider::new("mock", MockBehavior::Succeed)));
        }

        if let Some(key) = config.wanai_api_key.as_deref().filter(|k| !k.is_empty()) {
            registry = registry.register(Arc::new(WanAiProvider::new(
                key.to_string(),
                config.wanai_base_url.as_deref(),
                config.wanai_version.as_deref(),
                config.provider_timeout(),
            )?));
        }

        if let Some(key) = config.gemini_api_key.as_deref().filter(|k| !k.is_empty()) {
            registry = registry.register(Arc::new(GeminiProvider::new(
                key.to_string(),
                config.gemini_base_url.as_deref(),
                config.gemini_model.as_deref(),
                config.provider_timeout(),
            )?));
        }

        if registry.is_empty() {
            tracing::warn!("No video providers configured; every job will fail selection");
        } else {
            tracing::info!(providers = ?registry.names(), "Video providers registered");
        }
        Ok(registry)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn VideoProvider>> {
        self.providers.iter().find(|p| p.name() == name).cloned()
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.providers.iter().position(|p| p.name() == name)
    }

    pub fn providers(&self) -> &[Arc<dyn VideoProvider>] {
        &self.providers
    }

    pub fn names(&self) -> Vec<&str> {
        self.providers.iter().map(|p| p.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registration_order_and_lookup() {
        let registry = ProviderRegistry::new()
            .register(Arc::new(MockProvider::new("alpha", MockBehavior::Succeed)))
            .register(Arc::new(MockProvider::new("beta", MockBehavior::Succeed)))
            .register(Arc::new(MockProvider::new("alpha", MockBehavior::Unhealthy)));

        assert_eq!(registry.names(), vec!["alpha", "beta"]);
        assert_eq!(registry.position("beta"), Some(1));
        assert!(registry.get("gamma").is_none());
    }

    #[test]
    fn test_from_config_enables_by_key() {
        let config: AppConfig = envy::from_iter(vec![
            ("DATABASE_URL".to_string(), "postgres://localhost/video".to_string()),
            ("REDIS_URL".to_string(), "redis://localhost".to_string()),
            ("USE_MOCK_PROVIDER".to_string(), "true".to_string()),
            ("GEMINI_API_KEY".to_string(), "g-key".to_string()),
        ])
        .unwrap();

        let registry = ProviderRegistry::from_config(&config).unwrap();
        assert_eq!(registry.names(), vec!["mock", "gemini"]);
    }
}

//! Provider selection with cached availability and local-first fallback

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use super::anthropic::AnthropicProvider;
use super::config::SelectorConfig;
use super::ollama::OllamaProvider;
use super::on_device::OnDeviceProvider;
use super::openai::OpenAiProvider;
use super::openai_compat::OpenAiCompatProvider;
use super::types::{ProviderHandle, ProviderKind, ProviderStatus};

/// Builds a backend handle for one kind from the selector's configuration
pub trait ProviderFactory: Send + Sync {
    fn create(&self, kind: ProviderKind, config: &SelectorConfig) -> ProviderHandle;
}

/// Default factory producing the HTTP / on-device handles
#[derive(Debug, Default, Clone, Copy)]
pub struct HttpProviderFactory;

impl ProviderFactory for HttpProviderFactory {
    fn create(&self, kind: ProviderKind, config: &SelectorConfig) -> ProviderHandle {
        match kind {
            ProviderKind::OnDevice => Arc::new(OnDeviceProvider::new(
                config.on_device.model_path.clone().unwrap_or_default(),
                config.on_device.model.clone(),
            )),
            ProviderKind::Ollama => Arc::new(OllamaProvider::new(
                config.ollama.base_url.clone(),
                config.ollama.model.clone(),
            )),
            ProviderKind::LmStudio => Arc::new(OpenAiCompatProvider::new(
                kind.name().to_string(),
                config.lm_studio.base_url.clone(),
                config.lm_studio.model.clone(),
            )),
            ProviderKind::Anthropic => Arc::new(AnthropicProvider::new(
                config.anthropic.api_key.clone(),
                config.anthropic.model.clone(),
                config.anthropic.base_url.clone(),
            )),
            ProviderKind::OpenAi => Arc::new(OpenAiProvider::new(
                config.openai.api_key.clone(),
                config.openai.model.clone(),
                config.openai.base_url.clone(),
            )),
        }
    }
}

/// Cached result of one availability probe
#[derive(Debug, Clone, Copy)]
struct AvailabilityEntry {
    available: bool,
    checked_at: Instant,
}

/// Chooses and memoizes a working backend handle.
///
/// Handles and the availability cache belong to this instance, so several
/// selectors with different configuration can coexist. Locks are never held
/// across a probe.
pub struct ProviderSelector {
    config: SelectorConfig,
    factory: Arc<dyn ProviderFactory>,
    providers: RwLock<HashMap<ProviderKind, ProviderHandle>>,
    availability: Mutex<HashMap<ProviderKind, AvailabilityEntry>>,
}

impl ProviderSelector {
    pub fn new(config: SelectorConfig) -> Self {
        Self::with_factory(config, Arc::new(HttpProviderFactory))
    }

    pub fn with_factory(config: SelectorConfig, factory: Arc<dyn ProviderFactory>) -> Self {
        info!(
            "ProviderSelector: order [{}], cloud {}",
            config
                .preferred_order
                .iter()
                .map(|k| k.name())
                .collect::<Vec<_>>()
                .join(", "),
            if config.allow_cloud_providers {
                "allowed"
            } else {
                "disabled"
            }
        );
        Self {
            config,
            factory,
            providers: RwLock::new(HashMap::new()),
            availability: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &SelectorConfig {
        &self.config
    }

    /// Return the first preferred, permitted, available backend.
    ///
    /// `None` is not an error: it means nothing usable is reachable right now.
    pub async fn select_provider(&self) -> Option<ProviderHandle> {
        let kind = self.preferred_provider_kind().await?;
        Some(self.get_or_create_provider(kind))
    }

    /// Kind that [`select_provider`](Self::select_provider) would return a handle for
    pub async fn preferred_provider_kind(&self) -> Option<ProviderKind> {
        for &kind in &self.config.preferred_order {
            if !self.config.is_permitted(kind) {
                debug!("Skipping {}: cloud providers disabled", kind);
                continue;
            }
            if self.is_provider_available(kind).await {
                debug!("Selected provider {}", kind);
                return Some(kind);
            }
        }
        debug!("No provider available");
        None
    }

    /// Cached availability, refreshed with a live probe once stale
    pub async fn is_provider_available(&self, kind: ProviderKind) -> bool {
        if let Some(available) = self.cached_availability(kind) {
            return available;
        }
        self.probe(kind).await
    }

    fn cached_availability(&self, kind: ProviderKind) -> Option<bool> {
        let cache = self.availability.lock();
        cache
            .get(&kind)
            .filter(|entry| entry.checked_at.elapsed() < self.config.cache_ttl)
            .map(|entry| entry.available)
    }

    /// Probe without consulting the cache, then record the answer
    async fn probe(&self, kind: ProviderKind) -> bool {
        let available = if self.config.is_configured(kind) {
            self.get_or_create_provider(kind).is_available().await
        } else {
            debug!("Provider {} is not configured", kind);
            false
        };
        self.availability.lock().insert(
            kind,
            AvailabilityEntry {
                available,
                checked_at: Instant::now(),
            },
        );
        available
    }

    /// Memoized handle for a kind; the same instance for the selector's lifetime
    pub fn get_or_create_provider(&self, kind: ProviderKind) -> ProviderHandle {
        if let Some(handle) = self.providers.read().get(&kind) {
            return handle.clone();
        }
        let mut providers = self.providers.write();
        providers
            .entry(kind)
            .or_insert_with(|| {
                debug!("Creating provider handle for {}", kind);
                self.factory.create(kind, &self.config)
            })
            .clone()
    }

    /// Live sweep over every kind, refreshing the cache as it goes
    pub async fn check_availability(&self) -> Vec<ProviderStatus> {
        let mut statuses = Vec::with_capacity(ProviderKind::ALL.len());
        for kind in ProviderKind::ALL {
            let available = self.probe(kind).await;
            statuses.push(self.status_row(kind, available));
        }
        statuses
    }

    /// Sweep over every kind that trusts fresh cache entries
    pub async fn provider_status(&self) -> Vec<ProviderStatus> {
        let mut statuses = Vec::with_capacity(ProviderKind::ALL.len());
        for kind in ProviderKind::ALL {
            let available = self.is_provider_available(kind).await;
            statuses.push(self.status_row(kind, available));
        }
        statuses
    }

    fn status_row(&self, kind: ProviderKind, available: bool) -> ProviderStatus {
        ProviderStatus {
            kind,
            name: kind.name().to_string(),
            is_local: kind.is_local(),
            configured: self.config.is_configured(kind),
            available,
            preferred: self.config.preferred_order.contains(&kind)
                && self.config.is_permitted(kind),
        }
    }

    /// Forget every cached answer so the next selection re-probes
    pub fn clear_cache(&self) {
        self.availability.lock().clear();
        debug!("Provider availability cache cleared");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::types::LlmProvider;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Provider whose availability is scripted and whose probes are counted
    struct MockProvider {
        kind: ProviderKind,
        available: Arc<Mutex<HashMap<ProviderKind, bool>>>,
        probes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl LlmProvider for MockProvider {
        fn kind(&self) -> ProviderKind {
            self.kind
        }
        fn provider_name(&self) -> &str {
            self.kind.name()
        }
        fn model(&self) -> &str {
            "mock-model"
        }
        async fn is_available(&self) -> bool {
            self.probes.fetch_add(1, Ordering::SeqCst);
            self.available.lock().get(&self.kind).copied().unwrap_or(false)
        }
    }

    #[derive(Default)]
    struct MockFactory {
        available: Arc<Mutex<HashMap<ProviderKind, bool>>>,
        probes: Arc<Mutex<HashMap<ProviderKind, Arc<AtomicUsize>>>>,
        created: AtomicUsize,
    }

    impl MockFactory {
        fn set_available(&self, kind: ProviderKind, available: bool) {
            self.available.lock().insert(kind, available);
        }

        fn probe_count(&self, kind: ProviderKind) -> usize {
            self.probes
                .lock()
                .get(&kind)
                .map(|c| c.load(Ordering::SeqCst))
                .unwrap_or(0)
        }
    }

    impl ProviderFactory for MockFactory {
        fn create(&self, kind: ProviderKind, _config: &SelectorConfig) -> ProviderHandle {
            self.created.fetch_add(1, Ordering::SeqCst);
            let probes = self
                .probes
                .lock()
                .entry(kind)
                .or_insert_with(|| Arc::new(AtomicUsize::new(0)))
                .clone();
            Arc::new(MockProvider {
                kind,
                available: self.available.clone(),
                probes,
            })
        }
    }

    /// Config where every kind counts as configured
    fn configured_all() -> SelectorConfig {
        let mut config = SelectorConfig::default();
        config.on_device.model_path = Some("/models/tiny.gguf".into());
        config.anthropic.api_key = "sk-ant-test".to_string();
        config.openai.api_key = "sk-test".to_string();
        config.allow_cloud_providers = true;
        config
    }

    fn selector(config: SelectorConfig) -> (ProviderSelector, Arc<MockFactory>) {
        let factory = Arc::new(MockFactory::default());
        let selector = ProviderSelector::with_factory(config, factory.clone());
        (selector, factory)
    }

    #[tokio::test]
    async fn test_selects_first_available_in_preferred_order() {
        let (selector, factory) = selector(configured_all());
        factory.set_available(ProviderKind::LmStudio, true);
        factory.set_available(ProviderKind::Anthropic, true);

        let handle = selector.select_provider().await.unwrap();
        assert_eq!(handle.kind(), ProviderKind::LmStudio);
    }

    #[tokio::test]
    async fn test_returns_none_when_nothing_available() {
        let (selector, _factory) = selector(configured_all());
        assert!(selector.select_provider().await.is_none());
    }

    #[tokio::test]
    async fn test_every_configured_available_permutation() {
        let kinds = [ProviderKind::Ollama, ProviderKind::Anthropic, ProviderKind::OpenAi];
        // Bits per kind: configured, available
        for mask in 0u32..64 {
            let mut config = SelectorConfig::default();
            config.preferred_order = kinds.to_vec();
            config.allow_cloud_providers = true;
            let factory = Arc::new(MockFactory::default());
            let mut expected = None;
            for (i, kind) in kinds.iter().enumerate() {
                let configured = mask & (1 << (2 * i)) != 0;
                let available = mask & (1 << (2 * i + 1)) != 0;
                match kind {
                    ProviderKind::Ollama if !configured => config.ollama.base_url = String::new(),
                    ProviderKind::Anthropic if configured => {
                        config.anthropic.api_key = "key-a".to_string()
                    }
                    ProviderKind::OpenAi if configured => config.openai.api_key = "key-o".to_string(),
                    _ => {}
                }
                factory.set_available(*kind, available);
                if expected.is_none() && configured && available {
                    expected = Some(*kind);
                }
            }
            let selector = ProviderSelector::with_factory(config, factory.clone());
            let selected = selector.select_provider().await.map(|h| h.kind());
            assert_eq!(selected, expected, "mask {:06b}", mask);
        }
    }

    #[tokio::test]
    async fn test_cloud_kinds_skipped_when_disallowed() {
        let mut config = configured_all();
        config.allow_cloud_providers = false;
        let (selector, factory) = selector(config);
        factory.set_available(ProviderKind::Anthropic, true);
        factory.set_available(ProviderKind::OpenAi, true);

        assert!(selector.select_provider().await.is_none());
        assert_eq!(factory.probe_count(ProviderKind::Anthropic), 0);
        assert_eq!(factory.probe_count(ProviderKind::OpenAi), 0);
    }

    #[tokio::test]
    async fn test_unconfigured_kind_is_not_probed() {
        let mut config = SelectorConfig::default();
        config.preferred_order = vec![ProviderKind::OnDevice, ProviderKind::Ollama];
        let (selector, factory) = selector(config);
        factory.set_available(ProviderKind::OnDevice, true);
        factory.set_available(ProviderKind::Ollama, true);

        let handle = selector.select_provider().await.unwrap();
        assert_eq!(handle.kind(), ProviderKind::Ollama);
        assert_eq!(factory.probe_count(ProviderKind::OnDevice), 0);
        assert!(!selector.is_provider_available(ProviderKind::OnDevice).await);
    }

    #[tokio::test]
    async fn test_probes_at_most_once_within_ttl() {
        let (selector, factory) = selector(configured_all());
        factory.set_available(ProviderKind::Ollama, true);

        selector.select_provider().await.unwrap();
        selector.select_provider().await.unwrap();

        assert_eq!(factory.probe_count(ProviderKind::OnDevice), 1);
        assert_eq!(factory.probe_count(ProviderKind::Ollama), 1);
        assert_eq!(factory.probe_count(ProviderKind::LmStudio), 0);
    }

    #[tokio::test]
    async fn test_stale_entries_are_reprobed() {
        let mut config = configured_all();
        config.cache_ttl = Duration::from_millis(20);
        let (selector, factory) = selector(config);
        factory.set_available(ProviderKind::OnDevice, true);

        selector.select_provider().await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        selector.select_provider().await.unwrap();

        assert_eq!(factory.probe_count(ProviderKind::OnDevice), 2);
    }

    #[tokio::test]
    async fn test_cached_answer_survives_backend_change_until_cleared() {
        let (selector, factory) = selector(configured_all());
        factory.set_available(ProviderKind::OnDevice, true);
        assert_eq!(
            selector.select_provider().await.unwrap().kind(),
            ProviderKind::OnDevice
        );

        factory.set_available(ProviderKind::OnDevice, false);
        factory.set_available(ProviderKind::Ollama, true);
        assert_eq!(
            selector.select_provider().await.unwrap().kind(),
            ProviderKind::OnDevice
        );

        selector.clear_cache();
        assert_eq!(
            selector.select_provider().await.unwrap().kind(),
            ProviderKind::Ollama
        );
    }

    #[tokio::test]
    async fn test_get_or_create_is_memoized() {
        let (selector, factory) = selector(configured_all());
        let a = selector.get_or_create_provider(ProviderKind::Ollama);
        let b = selector.get_or_create_provider(ProviderKind::Ollama);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_independent_selectors_do_not_share_handles() {
        let (first, _) = selector(configured_all());
        let (second, _) = selector(configured_all());
        let a = first.get_or_create_provider(ProviderKind::Ollama);
        let b = second.get_or_create_provider(ProviderKind::Ollama);
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn test_check_availability_sweeps_every_kind() {
        let mut config = configured_all();
        config.preferred_order = vec![ProviderKind::Ollama];
        config.allow_cloud_providers = false;
        let (selector, factory) = selector(config);
        factory.set_available(ProviderKind::Ollama, true);
        factory.set_available(ProviderKind::OpenAi, true);

        let statuses = selector.check_availability().await;
        assert_eq!(statuses.len(), ProviderKind::ALL.len());

        let ollama = statuses.iter().find(|s| s.kind == ProviderKind::Ollama).unwrap();
        assert!(ollama.configured && ollama.available && ollama.preferred && ollama.is_local);

        let openai = statuses.iter().find(|s| s.kind == ProviderKind::OpenAi).unwrap();
        assert!(openai.available);
        assert!(!openai.preferred);

        // The sweep refreshed the cache: a status read does not probe again
        let before = factory.probe_count(ProviderKind::Ollama);
        selector.provider_status().await;
        assert_eq!(factory.probe_count(ProviderKind::Ollama), before);
    }
}

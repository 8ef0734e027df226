//! Anthropic provider

use async_trait::async_trait;
use reqwest::Client;

use super::probe::{join_url, probe_client, probe_ok};
use super::types::{LlmProvider, ProviderKind};

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Anthropic API handle
pub struct AnthropicProvider {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl std::fmt::Debug for AnthropicProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnthropicProvider")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish()
    }
}

impl AnthropicProvider {
    pub fn new(api_key: String, model: String, base_url: String) -> Self {
        Self {
            client: probe_client(),
            api_key,
            base_url,
            model,
        }
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    fn provider_name(&self) -> &str {
        "anthropic"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn is_available(&self) -> bool {
        if self.api_key.is_empty() {
            return false;
        }
        let request = self
            .client
            .get(join_url(&self.base_url, "v1/models"))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION);
        probe_ok("anthropic", request).await
    }
}

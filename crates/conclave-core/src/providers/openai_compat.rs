//! OpenAI-compatible local server (LM Studio and friends)
//!
//! Reuses the OpenAI `/v1/models` listing as the availability probe,
//! without credentials.

use async_trait::async_trait;
use reqwest::Client;

use super::probe::{join_url, probe_client, probe_ok};
use super::types::{LlmProvider, ProviderKind};

/// OpenAI-compatible provider bound to a local base URL
pub struct OpenAiCompatProvider {
    client: Client,
    name: String,
    base_url: String,
    model: String,
}

impl std::fmt::Debug for OpenAiCompatProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiCompatProvider")
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish()
    }
}

impl OpenAiCompatProvider {
    /// Create a new OpenAI-compatible provider.
    ///
    /// - `name`: human-readable label (e.g. "lm_studio")
    /// - `base_url`: the endpoint root (e.g. `http://localhost:1234`)
    pub fn new(name: String, base_url: String, model: String) -> Self {
        Self {
            client: probe_client(),
            name,
            base_url,
            model,
        }
    }
}

#[async_trait]
impl LlmProvider for OpenAiCompatProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::LmStudio
    }

    fn provider_name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn is_available(&self) -> bool {
        let url = join_url(&self.base_url, "v1/models");
        probe_ok(&self.name, self.client.get(url)).await
    }
}

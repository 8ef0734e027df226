//! Ollama provider: local server with its own tag listing endpoint

use async_trait::async_trait;
use reqwest::Client;

use super::probe::{join_url, probe_client, probe_ok};
use super::types::{LlmProvider, ProviderKind};

/// Local Ollama server handle
#[derive(Clone)]
pub struct OllamaProvider {
    client: Client,
    base_url: String,
    model: String,
}

impl std::fmt::Debug for OllamaProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OllamaProvider")
            .field("client", &"<reqwest::Client>")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish()
    }
}

impl OllamaProvider {
    pub fn new(base_url: String, model: String) -> Self {
        Self {
            client: probe_client(),
            base_url,
            model,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl LlmProvider for OllamaProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Ollama
    }

    fn provider_name(&self) -> &str {
        "ollama"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn is_available(&self) -> bool {
        let url = join_url(&self.base_url, "api/tags");
        probe_ok("ollama", self.client.get(url)).await
    }
}

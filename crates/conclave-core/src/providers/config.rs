//! Selector configuration: preference order, endpoints and credentials

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::types::ProviderKind;

/// Default time an availability answer stays trusted
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(30);

/// Configuration bound to a [`ProviderSelector`](super::ProviderSelector) for its lifetime
#[derive(Debug, Clone)]
pub struct SelectorConfig {
    /// Kinds to try, most preferred first
    pub preferred_order: Vec<ProviderKind>,
    /// When false, non-local kinds are skipped without probing
    pub allow_cloud_providers: bool,
    pub cache_ttl: Duration,
    pub on_device: OnDeviceSettings,
    pub ollama: EndpointSettings,
    pub lm_studio: EndpointSettings,
    pub anthropic: CloudSettings,
    pub openai: CloudSettings,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            preferred_order: ProviderKind::ALL.to_vec(),
            allow_cloud_providers: false,
            cache_ttl: DEFAULT_CACHE_TTL,
            on_device: OnDeviceSettings::default(),
            ollama: EndpointSettings {
                base_url: "http://localhost:11434".to_string(),
                model: "llama3.2".to_string(),
            },
            lm_studio: EndpointSettings {
                base_url: "http://localhost:1234".to_string(),
                model: "local-model".to_string(),
            },
            anthropic: CloudSettings {
                api_key: String::new(),
                base_url: "https://api.anthropic.com".to_string(),
                model: "claude-3-5-sonnet-latest".to_string(),
            },
            openai: CloudSettings {
                api_key: String::new(),
                base_url: "https://api.openai.com".to_string(),
                model: "gpt-4o".to_string(),
            },
        }
    }
}

impl SelectorConfig {
    /// Whether a kind has everything it needs (URL, key or model file) to be probed
    pub fn is_configured(&self, kind: ProviderKind) -> bool {
        match kind {
            ProviderKind::OnDevice => self.on_device.model_path.is_some(),
            ProviderKind::Ollama => is_valid_url(&self.ollama.base_url),
            ProviderKind::LmStudio => is_valid_url(&self.lm_studio.base_url),
            ProviderKind::Anthropic => self.anthropic.is_configured(),
            ProviderKind::OpenAi => self.openai.is_configured(),
        }
    }

    /// Whether a kind is eligible at all under the cloud policy
    pub fn is_permitted(&self, kind: ProviderKind) -> bool {
        kind.is_local() || self.allow_cloud_providers
    }
}

fn is_valid_url(s: &str) -> bool {
    !s.trim().is_empty() && url::Url::parse(s).is_ok()
}

/// Settings for the in-process model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnDeviceSettings {
    #[serde(default)]
    pub model_path: Option<PathBuf>,
    #[serde(default = "default_on_device_model")]
    pub model: String,
}

impl Default for OnDeviceSettings {
    fn default() -> Self {
        Self {
            model_path: None,
            model: default_on_device_model(),
        }
    }
}

fn default_on_device_model() -> String {
    "on-device".to_string()
}

/// Settings for a local HTTP server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointSettings {
    pub base_url: String,
    pub model: String,
}

/// Settings for a hosted API
#[derive(Clone, Serialize, Deserialize)]
pub struct CloudSettings {
    #[serde(default)]
    pub api_key: String,
    pub base_url: String,
    pub model: String,
}

impl CloudSettings {
    pub fn is_configured(&self) -> bool {
        !self.api_key.trim().is_empty() && is_valid_url(&self.base_url)
    }
}

impl std::fmt::Debug for CloudSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudSettings")
            .field("api_key", &mask_secret(&self.api_key))
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish()
    }
}

/// Mask a secret string for safe display in Debug output / logs.
/// Shows first 3 and last 4 chars for keys longer than 7 chars, otherwise "***".
pub fn mask_secret(s: &str) -> String {
    if s.is_empty() {
        return "(empty)".to_string();
    }
    let chars: Vec<char> = s.chars().collect();
    if chars.len() > 7 {
        let prefix: String = chars[..3].iter().collect();
        let suffix: String = chars[chars.len() - 4..].iter().collect();
        format!("{}...{}", prefix, suffix)
    } else {
        "***".to_string()
    }
}

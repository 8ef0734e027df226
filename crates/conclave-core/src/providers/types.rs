//! Provider-agnostic types for backend selection

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;

/// A kind of LLM backend the selector knows how to build and probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Model file run in-process on this machine
    OnDevice,
    /// Local Ollama server
    Ollama,
    /// Local LM Studio server (OpenAI-compatible)
    LmStudio,
    Anthropic,
    #[serde(rename = "openai")]
    OpenAi,
}

impl ProviderKind {
    /// Every kind, in declaration order (used by diagnostic sweeps)
    pub const ALL: [ProviderKind; 5] = [
        ProviderKind::OnDevice,
        ProviderKind::Ollama,
        ProviderKind::LmStudio,
        ProviderKind::Anthropic,
        ProviderKind::OpenAi,
    ];

    /// Whether requests to this kind stay on the local machine
    pub fn is_local(&self) -> bool {
        matches!(self, Self::OnDevice | Self::Ollama | Self::LmStudio)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::OnDevice => "on_device",
            Self::Ollama => "ollama",
            Self::LmStudio => "lm_studio",
            Self::Anthropic => "anthropic",
            Self::OpenAi => "openai",
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "on_device" | "ondevice" | "local" => Ok(Self::OnDevice),
            "ollama" => Ok(Self::Ollama),
            "lm_studio" | "lmstudio" => Ok(Self::LmStudio),
            "anthropic" | "claude" => Ok(Self::Anthropic),
            "openai" | "open_ai" => Ok(Self::OpenAi),
            other => Err(format!("unknown provider kind '{}'", other)),
        }
    }
}

/// Trait that every backend handle implements.
///
/// Only the capability surface the dispatch engine needs lives here;
/// inference itself is driven by the agents that receive the handle.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Which kind this handle was built for
    fn kind(&self) -> ProviderKind;

    /// Human-readable provider name (e.g. "ollama", "anthropic")
    fn provider_name(&self) -> &str;

    /// Model identifier the handle is bound to
    fn model(&self) -> &str;

    /// Live availability probe. Never errors: any failure means `false`.
    async fn is_available(&self) -> bool;
}

/// Memoized backend handle shared by every agent that uses it
pub type ProviderHandle = Arc<dyn LlmProvider>;

/// Per-kind diagnostic row returned by status sweeps
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderStatus {
    pub kind: ProviderKind,
    pub name: String,
    pub is_local: bool,
    pub configured: bool,
    pub available: bool,
    pub preferred: bool,
}

use anyhow::{Context, Result};
use conclave_core::providers::{
    CloudSettings, EndpointSettings, OnDeviceSettings, ProviderKind, SelectorConfig, mask_secret,
};
use conclave_scheduler::RunnerConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

/// Written by `conclave init`
pub const DEFAULT_CONFIG: &str = r#"# conclave configuration

[providers]
# Kinds to try, most preferred first
preferred_order = ["on_device", "ollama", "lm_studio", "anthropic", "openai"]
# Cloud kinds are skipped unless this is true
allow_cloud = false
# Seconds an availability check stays trusted
cache_ttl_secs = 30

[providers.on_device]
# model_path = "/path/to/model.gguf"
model = "on-device"

[providers.ollama]
base_url = "http://localhost:11434"
model = "llama3.2"

[providers.lm_studio]
base_url = "http://localhost:1234"
model = "local-model"

[providers.anthropic]
api_key = "${ANTHROPIC_API_KEY}"
base_url = "https://api.anthropic.com"
model = "claude-3-5-sonnet-latest"

[providers.openai]
api_key = "${OPENAI_API_KEY}"
base_url = "https://api.openai.com"
model = "gpt-4o"

[tasks]
max_concurrent_tasks = 3
max_completed_tasks = 100
poll_interval_ms = 100
default_wait_timeout_secs = 3600
"#;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConclaveConfig {
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub tasks: TasksConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default = "default_preferred_order")]
    pub preferred_order: Vec<ProviderKind>,
    #[serde(default)]
    pub allow_cloud: bool,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    #[serde(default)]
    pub on_device: OnDeviceSettings,
    #[serde(default = "default_ollama")]
    pub ollama: EndpointSettings,
    #[serde(default = "default_lm_studio")]
    pub lm_studio: EndpointSettings,
    #[serde(default = "default_anthropic")]
    pub anthropic: CloudSettings,
    #[serde(default = "default_openai")]
    pub openai: CloudSettings,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        let defaults = SelectorConfig::default();
        Self {
            preferred_order: defaults.preferred_order,
            allow_cloud: defaults.allow_cloud_providers,
            cache_ttl_secs: defaults.cache_ttl.as_secs(),
            on_device: defaults.on_device,
            ollama: defaults.ollama,
            lm_studio: defaults.lm_studio,
            anthropic: defaults.anthropic,
            openai: defaults.openai,
        }
    }
}

fn default_preferred_order() -> Vec<ProviderKind> {
    ProviderKind::ALL.to_vec()
}

fn default_cache_ttl_secs() -> u64 {
    SelectorConfig::default().cache_ttl.as_secs()
}

fn default_ollama() -> EndpointSettings {
    SelectorConfig::default().ollama
}

fn default_lm_studio() -> EndpointSettings {
    SelectorConfig::default().lm_studio
}

fn default_anthropic() -> CloudSettings {
    SelectorConfig::default().anthropic
}

fn default_openai() -> CloudSettings {
    SelectorConfig::default().openai
}

impl ProvidersConfig {
    pub fn to_selector_config(&self) -> SelectorConfig {
        SelectorConfig {
            preferred_order: self.preferred_order.clone(),
            allow_cloud_providers: self.allow_cloud,
            cache_ttl: Duration::from_secs(self.cache_ttl_secs),
            on_device: self.on_device.clone(),
            ollama: self.ollama.clone(),
            lm_studio: self.lm_studio.clone(),
            anthropic: self.anthropic.clone(),
            openai: self.openai.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TasksConfig {
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
    #[serde(default = "default_max_completed_tasks")]
    pub max_completed_tasks: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_wait_timeout_secs")]
    pub default_wait_timeout_secs: u64,
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: default_max_concurrent_tasks(),
            max_completed_tasks: default_max_completed_tasks(),
            poll_interval_ms: default_poll_interval_ms(),
            default_wait_timeout_secs: default_wait_timeout_secs(),
        }
    }
}

fn default_max_concurrent_tasks() -> usize {
    RunnerConfig::default().max_concurrent_tasks
}

fn default_max_completed_tasks() -> usize {
    RunnerConfig::default().max_completed_tasks
}

fn default_poll_interval_ms() -> u64 {
    RunnerConfig::default().poll_interval.as_millis() as u64
}

fn default_wait_timeout_secs() -> u64 {
    RunnerConfig::default().default_wait_timeout.as_secs()
}

impl TasksConfig {
    pub fn to_runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            max_concurrent_tasks: self.max_concurrent_tasks,
            max_completed_tasks: self.max_completed_tasks,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            default_wait_timeout: Duration::from_secs(self.default_wait_timeout_secs),
        }
    }
}

pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".conclave")
}

impl ConclaveConfig {
    pub fn load(custom_path: &Option<PathBuf>) -> Result<Self> {
        let path = custom_path
            .clone()
            .unwrap_or_else(|| config_dir().join("config.toml"));

        // Refuse configs readable by group or other
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Ok(metadata) = std::fs::metadata(&path) {
                let mode = metadata.permissions().mode();
                if mode & 0o077 != 0 {
                    return Err(anyhow::anyhow!(
                        "Config file {:?} has overly permissive permissions ({:o}). \
                         It may contain secrets. Fix with: chmod 600 {:?}",
                        path,
                        mode & 0o777,
                        path
                    ));
                }
            }
        }

        let content = std::fs::read_to_string(&path).with_context(|| {
            format!(
                "Failed to read config at {}. Run `conclave init` first.",
                path.display()
            )
        })?;

        // Expand environment variables before parsing
        let expanded = expand_env_vars(&content);

        let config: Self = toml::from_str(&expanded)
            .with_context(|| format!("Failed to parse config at {}", path.display()))?;
        config.validate()?;

        if config.providers.anthropic.api_key.starts_with("sk-ant-") {
            warn!(
                "Anthropic API key is hardcoded in config file. For security, use environment variables: api_key = \"${{ANTHROPIC_API_KEY}}\""
            );
        }
        if config.providers.openai.api_key.starts_with("sk-")
            && !content.contains("${OPENAI_API_KEY}")
        {
            warn!(
                "OpenAI API key is hardcoded in config file. For security, use environment variables: api_key = \"${{OPENAI_API_KEY}}\""
            );
        }

        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.tasks.max_concurrent_tasks == 0 {
            anyhow::bail!("tasks.max_concurrent_tasks must be at least 1");
        }
        if self.tasks.max_completed_tasks == 0 {
            anyhow::bail!("tasks.max_completed_tasks must be at least 1");
        }
        if self.tasks.poll_interval_ms == 0 {
            anyhow::bail!("tasks.poll_interval_ms must be at least 1");
        }
        if self.providers.preferred_order.is_empty() {
            warn!("providers.preferred_order is empty; no provider will ever be selected");
        }
        Ok(())
    }

    /// Copy with every API key masked, for display
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        config.providers.anthropic.api_key = mask_secret(&config.providers.anthropic.api_key);
        config.providers.openai.api_key = mask_secret(&config.providers.openai.api_key);
        config
    }
}

/// Allowlist of environment variable names that may be expanded in config files.
const ALLOWED_ENV_VARS: &[&str] = &["ANTHROPIC_API_KEY", "OPENAI_API_KEY", "HOME", "USER"];

fn expand_env_vars(s: &str) -> String {
    let mut result = s.to_string();
    let mut pos = 0;
    while let Some(start) = result[pos..].find("${") {
        let abs_start = pos + start;
        let Some(end) = result[abs_start..].find('}') else {
            break;
        };
        let var_name = result[abs_start + 2..abs_start + end].to_string();

        if !ALLOWED_ENV_VARS.contains(&var_name.as_str()) {
            warn!(
                "Skipping expansion of unrecognized env var '{}' in config (not in allowlist)",
                var_name
            );
            // Left as-is so it stays visible
            pos = abs_start + end + 1;
            continue;
        }

        let value = std::env::var(&var_name).unwrap_or_default();
        result = format!(
            "{}{}{}",
            &result[..abs_start],
            value,
            &result[abs_start + end + 1..]
        );
        pos = abs_start + value.len();
    }
    result
}

//! On-device provider: a model file executed in-process

use async_trait::async_trait;
use std::path::PathBuf;
use tracing::debug;

use super::types::{LlmProvider, ProviderKind};

/// Handle for a model that runs on this machine without a server
#[derive(Debug)]
pub struct OnDeviceProvider {
    model_path: PathBuf,
    model: String,
}

impl OnDeviceProvider {
    pub fn new(model_path: PathBuf, model: String) -> Self {
        Self { model_path, model }
    }
}

#[async_trait]
impl LlmProvider for OnDeviceProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OnDevice
    }

    fn provider_name(&self) -> &str {
        "on_device"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn is_available(&self) -> bool {
        let exists = tokio::fs::try_exists(&self.model_path)
            .await
            .unwrap_or(false);
        debug!(
            "On-device model {} present: {}",
            self.model_path.display(),
            exists
        );
        exists
    }
}

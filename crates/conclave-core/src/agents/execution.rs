//! Agent execution contracts: the agent trait, its event stream and factory

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::pin::Pin;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::providers::ProviderHandle;
use crate::types::{AgentId, ChannelId, ChannelMessage};

/// Event emitted by an agent while it works on a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEvent {
    /// Incremental text; accumulated until a terminal event
    TextDelta { text: String },
    /// A complete message the agent wants posted right away
    Message { content: String },
    Completed,
    Failed { error: String },
    /// Tool invocation requested by the agent (executed elsewhere)
    ToolCall { name: String, input: Value },
}

impl ExecutionEvent {
    /// Whether this event ends the execution
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed { .. })
    }
}

/// Ordered stream of execution events for one task
pub type ExecutionStream = Pin<Box<dyn Stream<Item = ExecutionEvent> + Send>>;

/// Work handed to an agent in response to a channel message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentTask {
    pub id: String,
    pub channel_id: ChannelId,
    pub prompt: String,
    pub sender: String,
    pub message_id: String,
}

impl AgentTask {
    pub fn from_message(message: &ChannelMessage) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            channel_id: message.channel_id.clone(),
            prompt: message.content.clone(),
            sender: message.sender.clone(),
            message_id: message.id.clone(),
        }
    }
}

/// Trait that all agents implement
#[async_trait]
pub trait Agent: Send + Sync {
    fn id(&self) -> &str;

    /// Start working on a task. The token is cancelled when the caller wants
    /// the agent to stop; honoring it is up to the implementation.
    async fn execute(
        &self,
        task: AgentTask,
        cancel: CancellationToken,
    ) -> anyhow::Result<ExecutionStream>;
}

/// Configuration synthesized for an agent that has no pre-bound instance
#[derive(Clone)]
pub struct AgentConfiguration {
    pub agent_id: AgentId,
    pub name: String,
    pub system_prompt: String,
    pub model: Option<String>,
    pub provider: ProviderHandle,
}

impl std::fmt::Debug for AgentConfiguration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentConfiguration")
            .field("agent_id", &self.agent_id)
            .field("name", &self.name)
            .field("system_prompt_len", &self.system_prompt.len())
            .field("model", &self.model)
            .field("provider", &self.provider.provider_name())
            .finish()
    }
}

/// Builds agent instances on demand
pub type AgentFactory =
    Arc<dyn Fn(&AgentId, AgentConfiguration) -> anyhow::Result<Arc<dyn Agent>> + Send + Sync>;

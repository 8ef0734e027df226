//! Dispatch error taxonomy

use thiserror::Error;

use crate::types::AgentId;

/// Why a single target could not be dispatched.
///
/// These never abort a whole message: each is confined to its target.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// No permitted backend answered its availability probe
    #[error("No provider available for agent '{0}'")]
    NoProviderAvailable(AgentId),

    /// The agent factory refused to build an instance
    #[error("Failed to create agent '{agent_id}': {source}")]
    AgentCreationFailed {
        agent_id: AgentId,
        #[source]
        source: anyhow::Error,
    },

    /// The target has no registry entry
    #[error("Agent '{0}' is not registered")]
    AgentNotFound(AgentId),

    /// Starting or consuming the agent's execution failed
    #[error("Execution of agent '{agent_id}' failed: {source}")]
    Execution {
        agent_id: AgentId,
        #[source]
        source: anyhow::Error,
    },
}

impl DispatchError {
    pub fn agent_id(&self) -> &str {
        match self {
            Self::NoProviderAvailable(id) | Self::AgentNotFound(id) => id,
            Self::AgentCreationFailed { agent_id, .. } | Self::Execution { agent_id, .. } => {
                agent_id
            }
        }
    }
}

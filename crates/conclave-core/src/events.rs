//! Event bus: fire-and-forget notifications about agent responses

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

use crate::types::{AgentId, ChannelId, ChannelMessage};

/// Notification emitted by the orchestrator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RuntimeEvent {
    /// An agent posted a message to a channel
    AgentResponded {
        channel_id: ChannelId,
        agent_id: AgentId,
        message: ChannelMessage,
    },
    /// An agent's execution reported failure
    AgentFailed {
        channel_id: ChannelId,
        agent_id: AgentId,
        error: String,
    },
}

impl RuntimeEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::AgentResponded { .. } => "agent_responded",
            Self::AgentFailed { .. } => "agent_failed",
        }
    }
}

/// Notification sink
pub trait EventBus: Send + Sync {
    fn emit(&self, event: RuntimeEvent);
}

/// Broadcast event bus; every subscriber receives every event
#[derive(Clone)]
pub struct BroadcastEventBus {
    sender: Arc<broadcast::Sender<RuntimeEvent>>,
}

impl BroadcastEventBus {
    /// Create a new event bus with the given channel capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl EventBus for BroadcastEventBus {
    fn emit(&self, event: RuntimeEvent) {
        let receivers = self.sender.receiver_count();
        if receivers > 0 {
            debug!(
                "Broadcasting event '{}' to {} receivers",
                event.name(),
                receivers
            );
            // No receivers left between the count and the send is fine
            let _ = self.sender.send(event);
        }
    }
}

//! Shared types for conclave-core

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a registered agent (also its mention handle)
pub type AgentId = String;

/// Identifier of a conversation channel
pub type ChannelId = String;

/// Who authored a channel message
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    #[default]
    User,
    Assistant,
    /// Runtime notices such as "no provider available"
    System,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
            Self::System => write!(f, "system"),
        }
    }
}

/// A message posted to (or arriving on) a channel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelMessage {
    pub id: String,
    pub channel_id: ChannelId,
    pub sender: String,
    #[serde(default)]
    pub role: MessageRole,
    pub content: String,
    /// Mentions already resolved by the sender's client, merged with parsed ones
    #[serde(default)]
    pub mentions: Vec<AgentId>,
    pub timestamp: DateTime<Utc>,
}

impl ChannelMessage {
    fn new(
        channel_id: impl Into<ChannelId>,
        sender: impl Into<String>,
        role: MessageRole,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            channel_id: channel_id.into(),
            sender: sender.into(),
            role,
            content: content.into(),
            mentions: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn user(
        channel_id: impl Into<ChannelId>,
        sender: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self::new(channel_id, sender, MessageRole::User, content)
    }

    pub fn assistant(
        channel_id: impl Into<ChannelId>,
        agent_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self::new(channel_id, agent_id, MessageRole::Assistant, content)
    }

    pub fn system(channel_id: impl Into<ChannelId>, content: impl Into<String>) -> Self {
        Self::new(channel_id, "system", MessageRole::System, content)
    }

    pub fn with_mentions(mut self, mentions: Vec<AgentId>) -> Self {
        self.mentions = mentions;
        self
    }
}

/// Descriptive metadata for a channel, used when synthesizing agent prompts
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Channel {
    pub id: ChannelId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub topic: Option<String>,
}

impl Channel {
    pub fn new(id: impl Into<ChannelId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            topic: None,
        }
    }
}

//! The chat platform seam.
//!
//! The core never talks to a chat service directly. It sees inbound
//! [`Message`]s handed to [`Client::handle_message`](crate::Client::handle_message)
//! and sends replies through a [`Platform`] implementation.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Platform identifier of a user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

/// Platform identifier of a channel (or direct-message conversation).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(pub String);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<&str> for ChannelId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Who sent a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    pub id: UserId,
    pub name: String,
    /// Role names or ids the author holds in the primary community.
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub bot: bool,
}

impl Author {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: UserId(id.into()),
            name: name.into(),
            roles: Vec::new(),
            bot: false,
        }
    }

    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles = roles.into_iter().map(Into::into).collect();
        self
    }
}

/// An inbound chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub channel: ChannelId,
    pub author: Author,
    pub content: String,
    /// Sent in a direct-message conversation.
    #[serde(default)]
    pub private: bool,
}

impl Message {
    pub fn new(channel: impl Into<String>, author: Author, content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            channel: ChannelId(channel.into()),
            author,
            content: content.into(),
            private: false,
        }
    }

    pub fn private(mut self) -> Self {
        self.private = true;
        self
    }
}

/// Failure talking to the chat platform.
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("failed to send to {channel}: {message}")]
    Send { channel: ChannelId, message: String },

    #[error("platform unavailable: {0}")]
    Unavailable(String),
}

/// Outbound side of a chat service.
#[async_trait]
pub trait Platform: Send + Sync + 'static {
    /// The bot's own user id. Messages from it are ignored.
    fn bot_user(&self) -> UserId;

    /// Post `content` to a channel.
    async fn send(&self, channel: &ChannelId, content: &str) -> Result<(), PlatformError>;

    /// Resolve a user reference (id or name) as written in configuration.
    fn resolve_user(&self, reference: &str) -> Option<UserId>;

    /// Resolve a channel reference (name or id) as written in configuration.
    fn resolve_channel(&self, reference: &str) -> Option<ChannelId>;

    /// Whether the user shares a community with the bot. Messages from
    /// unknown users are dropped.
    fn is_known_user(&self, _user: &UserId) -> bool {
        true
    }
}

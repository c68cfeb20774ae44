//! Test doubles for code built on the client.
//!
//! Only available with the `testing` feature:
//!
//! ```toml
//! [dev-dependencies]
//! beymax = { path = "../beymax", features = ["testing"] }
//! ```
//!
//! ```ignore
//! let platform = Arc::new(RecordingPlatform::new().with_user("alice", "u1"));
//! let client = Client::builder(platform.clone()).store(Store::in_memory()).build()?;
//! client.start().await?;
//!
//! client.handle_message(platform.message("u1", "!ping")).wait().await;
//! let sent = platform.wait_for_messages(1).await;
//! assert_eq!(sent[0].1, "pong");
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::platform::{Author, ChannelId, Message, Platform, PlatformError, UserId};

/// In-memory [`Platform`] that records everything sent through it.
///
/// The bot is `beymax`. A `general` channel exists unless replaced.
#[derive(Debug)]
pub struct RecordingPlatform {
    bot: UserId,
    users: Mutex<HashMap<String, UserId>>,
    channels: Mutex<HashMap<String, ChannelId>>,
    strangers: Mutex<HashSet<UserId>>,
    sent: Mutex<Vec<(ChannelId, String)>>,
    failing: AtomicBool,
    notify: Notify,
}

impl Default for RecordingPlatform {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RecordingPlatform {
    pub fn new() -> Self {
        let mut channels = HashMap::new();
        channels.insert("general".to_string(), ChannelId::from("general"));
        Self {
            bot: UserId::from("beymax"),
            users: Mutex::new(HashMap::new()),
            channels: Mutex::new(channels),
            strangers: Mutex::new(HashSet::new()),
            sent: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    /// Make `reference` resolve to user `id`.
    pub fn with_user(self, reference: &str, id: &str) -> Self {
        self.set_user(reference, id);
        self
    }

    pub fn set_user(&self, reference: &str, id: &str) {
        lock(&self.users).insert(reference.to_string(), UserId::from(id));
    }

    /// Make `reference` resolve to channel `id`.
    pub fn with_channel(self, reference: &str, id: &str) -> Self {
        lock(&self.channels).insert(reference.to_string(), ChannelId::from(id));
        self
    }

    /// Treat `id` as sharing no community with the bot.
    pub fn with_stranger(self, id: &str) -> Self {
        lock(&self.strangers).insert(UserId::from(id));
        self
    }

    /// Make every send fail until switched back.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// A message from `author` in `general`.
    pub fn message(&self, author: &str, content: &str) -> Message {
        Message::new("general", Author::new(author, author), content)
    }

    pub fn sent(&self) -> Vec<(ChannelId, String)> {
        lock(&self.sent).clone()
    }

    pub fn sent_to(&self, channel: &str) -> Vec<String> {
        lock(&self.sent)
            .iter()
            .filter(|(c, _)| c.0 == channel)
            .map(|(_, content)| content.clone())
            .collect()
    }

    /// Wait until at least `count` messages have been sent.
    pub async fn wait_for_messages(&self, count: usize) -> Vec<(ChannelId, String)> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let sent = lock(&self.sent);
                if sent.len() >= count {
                    return sent.clone();
                }
            }
            notified.await;
        }
    }
}

#[async_trait]
impl Platform for RecordingPlatform {
    fn bot_user(&self) -> UserId {
        self.bot.clone()
    }

    async fn send(&self, channel: &ChannelId, content: &str) -> Result<(), PlatformError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(PlatformError::Send {
                channel: channel.clone(),
                message: "platform is failing".to_string(),
            });
        }
        lock(&self.sent).push((channel.clone(), content.to_string()));
        self.notify.notify_waiters();
        Ok(())
    }

    fn resolve_user(&self, reference: &str) -> Option<UserId> {
        let users = lock(&self.users);
        users
            .get(reference)
            .cloned()
            .or_else(|| users.values().find(|id| id.0 == reference).cloned())
    }

    fn resolve_channel(&self, reference: &str) -> Option<ChannelId> {
        let channels = lock(&self.channels);
        channels
            .get(reference)
            .cloned()
            .or_else(|| channels.values().find(|id| id.0 == reference).cloned())
    }

    fn is_known_user(&self, user: &UserId) -> bool {
        !lock(&self.strangers).contains(user)
    }
}

//! Per-channel batching of outbound messages.
//!
//! Each push appends to the channel's buffer and waits out the quiet window.
//! Only the push whose content is still the last one appended when its window
//! ends sends the buffer. Everything pushed during the window goes out as a
//! single newline-joined message.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::trace;

use crate::platform::{ChannelId, PlatformError};

/// Quiet period before a buffered channel is flushed.
pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(500);

/// Event used to hand messages to the debouncer.
pub const DEBOUNCE_EVENT: &str = "debounce-send";

#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    buffers: Mutex<HashMap<ChannelId, String>>,
}

impl Default for Debouncer {
    fn default() -> Self {
        Self::new(DEBOUNCE_WINDOW)
    }
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            buffers: Mutex::new(HashMap::new()),
        }
    }

    /// Buffer `content` for `channel`; returns whether this call flushed.
    ///
    /// `flush` runs with the buffer lock held, so a concurrent push for any
    /// channel waits until the send completes.
    pub async fn push<F, Fut>(
        &self,
        channel: &ChannelId,
        content: &str,
        flush: F,
    ) -> Result<bool, PlatformError>
    where
        F: FnOnce(ChannelId, String) -> Fut,
        Fut: Future<Output = Result<(), PlatformError>>,
    {
        let len = {
            let mut buffers = self.buffers.lock().await;
            let buffer = buffers.entry(channel.clone()).or_default();
            if !buffer.is_empty() {
                buffer.push('\n');
            }
            buffer.push_str(content);
            buffer.len()
        };

        tokio::time::sleep(self.window).await;

        let mut buffers = self.buffers.lock().await;
        if buffers.get(channel).map(String::len) != Some(len) {
            trace!(%channel, "debounced message superseded");
            return Ok(false);
        }
        let Some(content) = buffers.remove(channel) else {
            return Ok(false);
        };
        flush(channel.clone(), content).await?;
        Ok(true)
    }

    /// Channels with buffered content.
    pub async fn pending(&self) -> usize {
        self.buffers.lock().await.len()
    }
}

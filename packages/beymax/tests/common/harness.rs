//! Test harness for driving a client end to end.
//!
//! Every harness gets its own temp directory for config and permissions
//! files, an in-memory store, a recording platform and a manual clock.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use beymax::config::Paths;
use beymax::testing::RecordingPlatform;
use beymax::{ChannelId, Client, Command, ManualClock, Message, ParsedArgs, Store};
use chrono::{TimeZone, Utc};
use tempfile::TempDir;

/// Upper bound on waiting for outbound messages.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(10);

pub struct TestHarness {
    pub client: Client,
    pub platform: Arc<RecordingPlatform>,
    pub clock: Arc<ManualClock>,
    pub store: Store,
    dir: TempDir,
}

/// Builder for [`TestHarness`].
pub struct HarnessBuilder {
    platform: RecordingPlatform,
    config: String,
    permissions: Option<String>,
    store: Option<Store>,
}

impl TestHarness {
    pub fn builder() -> HarnessBuilder {
        HarnessBuilder {
            platform: RecordingPlatform::new()
                .with_user("alice", "u-alice")
                .with_user("bob", "u-bob"),
            config: String::new(),
            permissions: None,
            store: None,
        }
    }

    /// Harness with default config, no permissions file, not started.
    pub fn new() -> Result<Self> {
        Self::builder().build()
    }

    /// Feed a message from `author` in `general` and wait for everything it
    /// dispatched synchronously.
    pub async fn say(&self, author: &str, content: &str) {
        self.client
            .handle_message(self.platform.message(author, content))
            .wait()
            .await;
    }

    pub fn message(&self, author: &str, content: &str) -> Message {
        self.platform.message(author, content)
    }

    /// Every message sent so far, once at least `count` exist. Panics if
    /// they do not show up within [`SEND_TIMEOUT`].
    pub async fn sent(&self, count: usize) -> Vec<(ChannelId, String)> {
        match tokio::time::timeout(SEND_TIMEOUT, self.platform.wait_for_messages(count)).await {
            Ok(sent) => sent,
            Err(_) => panic!(
                "expected {count} sent messages within {SEND_TIMEOUT:?}, got {:?}",
                self.platform.sent()
            ),
        }
    }

    /// Contents of every message sent so far, once at least `count` exist.
    pub async fn replies(&self, count: usize) -> Vec<String> {
        self.sent(count)
            .await
            .into_iter()
            .map(|(_, content)| content)
            .collect()
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }
}

impl HarnessBuilder {
    pub fn platform(mut self, platform: RecordingPlatform) -> Self {
        self.platform = platform;
        self
    }

    pub fn config(mut self, yaml: &str) -> Self {
        self.config = yaml.to_string();
        self
    }

    pub fn permissions(mut self, yaml: &str) -> Self {
        self.permissions = Some(yaml.to_string());
        self
    }

    pub fn store(mut self, store: Store) -> Self {
        self.store = Some(store);
        self
    }

    pub fn build(self) -> Result<TestHarness> {
        // Run tests with: RUST_LOG=beymax=debug cargo test -- --nocapture
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let dir = tempfile::tempdir().context("Failed to create temp dir")?;
        let paths = Paths {
            config: dir.path().join("config.yml"),
            permissions: dir.path().join("permissions.yml"),
            database: dir.path().join("db.msgpack"),
        };
        if let Some(permissions) = &self.permissions {
            std::fs::write(&paths.permissions, permissions).context("Failed to write permissions")?;
        }
        let config = beymax::Config::from_yaml_str(&self.config)?.with_paths(paths);

        let platform = Arc::new(self.platform);
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0)
                .single()
                .context("invalid start time")?,
        ));
        let store = self.store.unwrap_or_else(Store::in_memory);
        let client = Client::builder(platform.clone())
            .config(config)
            .store(store.clone())
            .clock(clock.clone())
            .build()?;

        Ok(TestHarness {
            client,
            platform,
            clock,
            store,
            dir,
        })
    }
}

/// `!ping` replying `pong`.
pub fn ping_command() -> Command {
    Command::new("ping", |client: Client, message: Message, _args: ParsedArgs| async move {
        client.send_message(&message.channel, "pong").detach();
        anyhow::Ok(())
    })
}

//! Local console bot
//!
//! Runs the dispatch core against stdin/stdout: every input line is a chat
//! message from the console user, every reply is printed. Useful for trying
//! commands, permissions and scheduled events without a chat service.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use beymax::config::Paths;
use beymax::{
    Arg, Author, ChannelId, Client, Command, CommandSuite, Config, EventArgs, Message, Platform,
    PlatformError, SubscribeOptions, UserId,
};
use clap::Parser;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "beymax")]
#[command(about = "Run the bot against a local console")]
struct Cli {
    /// Config file (overrides BEYMAX_CONFIG_PATH)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Permissions file (overrides BEYMAX_PERMISSIONS_PATH)
    #[arg(long)]
    permissions: Option<PathBuf>,

    /// Database snapshot (overrides BEYMAX_DB_PATH)
    #[arg(long)]
    db: Option<PathBuf>,

    /// Name of the console user
    #[arg(long, default_value = "operator")]
    user: String,

    /// Roles held by the console user
    #[arg(long, value_delimiter = ',')]
    roles: Vec<String>,
}

const CONSOLE_USER_ID: &str = "console";

struct ConsolePlatform {
    user: String,
}

#[async_trait]
impl Platform for ConsolePlatform {
    fn bot_user(&self) -> UserId {
        UserId::from("beymax")
    }

    async fn send(&self, channel: &ChannelId, content: &str) -> Result<(), PlatformError> {
        for line in content.lines() {
            println!("[#{channel}] {line}");
        }
        Ok(())
    }

    fn resolve_user(&self, reference: &str) -> Option<UserId> {
        (reference == self.user || reference == CONSOLE_USER_ID).then(|| UserId::from(CONSOLE_USER_ID))
    }

    fn resolve_channel(&self, reference: &str) -> Option<ChannelId> {
        // Every channel exists locally.
        Some(ChannelId::from(reference))
    }
}

fn demo_suite() -> CommandSuite {
    CommandSuite::new("Console Demo")
        .reserve_channel("bank")
        .command(
            Command::new("ping", |client: Client, message: Message, _args| async move {
                client.send_message(&message.channel, "pong").detach();
                anyhow::Ok(())
            })
            .help("Check that the bot is listening"),
        )
        .command(
            Command::new("remind", |client: Client, message: Message, args: beymax::ParsedArgs| async move {
                let seconds: i64 = args.get("seconds").unwrap_or_default();
                let text = args.joined("text");
                let at = client
                    .dispatch_future(
                        seconds,
                        "reminder",
                        EventArgs::new()
                            .with_arg(message.channel.0.clone())
                            .with_arg(text),
                    )
                    .await?;
                client
                    .send_message(&message.channel, format!("I'll remind you at {}", at.to_rfc3339()))
                    .detach();
                anyhow::Ok(())
            })
            .arg(Arg::int("seconds").help("Delay in seconds"))
            .arg(Arg::string("text").remainder())
            .help("Schedule a reminder"),
        )
        .command(
            Command::new("bal", |client: Client, message: Message, _args| async move {
                let players = client
                    .store()
                    .readonly_snapshot_with(["players"], &BTreeMap::from([("players".to_string(), json!({}))]))?;
                let balance = players
                    .get("players")
                    .and_then(|p| p.get(&message.author.id.0))
                    .and_then(|p| p.get("balance"))
                    .and_then(|b| b.as_i64())
                    .unwrap_or(0);
                client
                    .send_message(&message.channel, format!("You have {balance} tokens"))
                    .detach();
                anyhow::Ok(())
            })
            .alias("balance")
            .help("Show your token balance"),
        )
        .command(
            Command::new("grant", |client: Client, message: Message, args: beymax::ParsedArgs| async move {
                let amount: i64 = args.get("amount").unwrap_or_default();
                let mut tx = client.store().transaction(["bank", "players"]).begin().await?;
                let reserve = tx.get("bank")?.get("reserve").and_then(|r| r.as_i64()).unwrap_or(0);
                if reserve < amount {
                    client
                        .send_message(&message.channel, format!("The bank only holds {reserve} tokens"))
                        .detach();
                    return anyhow::Ok(());
                }
                tx.object_mut("bank")?.insert("reserve".into(), json!(reserve - amount));
                let player = tx
                    .object_mut("players")?
                    .entry(message.author.id.0.clone())
                    .or_insert_with(|| json!({"balance": 0}));
                let balance = player.get("balance").and_then(Value::as_i64).unwrap_or(0) + amount;
                player["balance"] = json!(balance);
                tx.commit().await?;
                client
                    .send_message(&message.channel, format!("Granted {amount} tokens"))
                    .detach();
                anyhow::Ok(())
            })
            .arg(Arg::int("amount"))
            .help("Move tokens from the bank reserve to your balance"),
        )
        .command(
            Command::new("_events", |client: Client, message: Message, _args| async move {
                let bus = client.bus();
                let recent = bus.recent_events();
                let tail = recent.iter().rev().take(10).cloned().collect::<Vec<_>>().join(", ");
                client
                    .send_message(
                        &message.channel,
                        format!("{} events dispatched. Most recent: {}", bus.dispatch_count(), tail),
                    )
                    .detach();
                anyhow::Ok(())
            })
            .help("Show recent event activity"),
        )
        .subscribe("reminder", SubscribeOptions::new(), |client: Client, event: beymax::Event| async move {
            let channel: String = event.arg(0)?;
            let text: String = event.arg(1)?;
            client
                .send_message(&ChannelId(channel), format!("Reminder: {text}"))
                .detach();
            anyhow::Ok(())
        })
        .migration("seed-bank-reserve", |client: Client| async move {
            let mut tx = client.store().begin(["bank"]).await?;
            tx.object_mut("bank")?.insert("reserve".into(), json!(1000));
            tx.commit().await?;
            anyhow::Ok(())
        })
        .task("heartbeat", Duration::from_secs(300), |client: Client| async move {
            tracing::debug!(dispatched = client.bus().dispatch_count(), "heartbeat");
            anyhow::Ok(())
        })
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,beymax=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    // Load environment variables
    dotenvy::dotenv().ok();

    let env_paths = Paths::from_env();
    let paths = Paths {
        config: cli.config.unwrap_or(env_paths.config),
        permissions: cli.permissions.unwrap_or(env_paths.permissions),
        database: cli.db.unwrap_or(env_paths.database),
    };
    let config = if paths.config.exists() {
        Config::from_path(&paths.config)?
    } else {
        tracing::warn!(path = %paths.config.display(), "config file not found, using defaults");
        Config::default()
    }
    .with_paths(paths);

    let platform = Arc::new(ConsolePlatform { user: cli.user.clone() });
    let client = Client::builder(platform)
        .config(config)
        .build()
        .context("Failed to build client")?;
    demo_suite().attach(&client)?;
    client.start().await.context("Failed to start client")?;

    let author = Author::new(CONSOLE_USER_ID, cli.user).with_roles(cli.roles);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line.context("Failed to read stdin")? {
                    Some(line) => {
                        let message = Message::new(CONSOLE_USER_ID, author.clone(), line);
                        client.handle_message(message).wait().await;
                    }
                    None => break,
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    client.shutdown().await;
    Ok(())
}

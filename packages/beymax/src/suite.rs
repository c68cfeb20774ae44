//! Bundles of commands, tasks and handlers that attach to a [`Client`].
//!
//! ```ignore
//! let suite = CommandSuite::new("Economy")
//!     .reserve_channel("bank")
//!     .command(
//!         Command::new("bal", |client, message, _args| async move {
//!             let balance = balance_of(&client, &message.author.id).await?;
//!             client.send_message(&message.channel, format!("{balance} tokens")).detach();
//!             Ok(())
//!         })
//!         .alias("balance")
//!         .help("Show your balance"),
//!     )
//!     .task("payday", Duration::from_secs(86_400), |client| async move {
//!         pay_everyone(&client).await
//!     });
//!
//! suite.attach(&client)?;
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::info;

use crate::args::{Arg, ParsedArgs};
use crate::bus::{Event, SubscribeOptions};
use crate::client::Client;
use crate::error::ClientError;
use crate::platform::Message;

pub type CommandHandler =
    Arc<dyn Fn(Client, Message, ParsedArgs) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;
pub type TaskHandler = Arc<dyn Fn(Client) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;
pub type MessageHandler =
    Arc<dyn Fn(Client, Message) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;
pub type EventHandler = Arc<dyn Fn(Client, Event) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;
pub type MessageCheck = Arc<dyn Fn(&Message) -> bool + Send + Sync>;

pub(crate) fn task_handler<F, Fut>(f: F) -> TaskHandler
where
    F: Fn(Client) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |client| f(client).boxed())
}

pub(crate) fn message_handler<F, Fut>(f: F) -> MessageHandler
where
    F: Fn(Client, Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |client, message| f(client, message).boxed())
}

pub(crate) fn event_handler<F, Fut>(f: F) -> EventHandler
where
    F: Fn(Client, Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |client, event| f(client, event).boxed())
}

/// A chat command and its handler.
#[derive(Clone)]
pub struct Command {
    pub(crate) name: String,
    pub(crate) aliases: Vec<String>,
    pub(crate) args: Vec<Arg>,
    pub(crate) delimiter: Option<String>,
    pub(crate) help: Option<String>,
    pub(crate) handler: CommandHandler,
}

impl Command {
    /// `name` may be given with or without the command prefix.
    pub fn new<F, Fut>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Client, Message, ParsedArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            aliases: Vec::new(),
            args: Vec::new(),
            delimiter: None,
            help: None,
            handler: Arc::new(move |client, message, args| handler(client, message, args).boxed()),
        }
    }

    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.aliases.push(alias.into());
        self
    }

    pub fn arg(mut self, arg: Arg) -> Self {
        self.args.push(arg);
        self
    }

    /// Split arguments on `delimiter` instead of whitespace when the message
    /// contains it.
    pub fn delimiter(mut self, delimiter: impl Into<String>) -> Self {
        self.delimiter = Some(delimiter.into());
        self
    }

    pub fn help(mut self, help: impl Into<String>) -> Self {
        self.help = Some(help.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Command")
            .field("name", &self.name)
            .field("aliases", &self.aliases)
            .field("args", &self.args.len())
            .field("delimiter", &self.delimiter)
            .finish_non_exhaustive()
    }
}

struct TaskEntry {
    name: String,
    interval: Duration,
    handler: TaskHandler,
}

struct SpecialEntry {
    name: String,
    check: MessageCheck,
    handler: MessageHandler,
}

struct SubscriptionEntry {
    event: String,
    options: SubscribeOptions,
    handler: EventHandler,
}

/// A named group of features enabled together.
pub struct CommandSuite {
    name: String,
    commands: Vec<Command>,
    tasks: Vec<TaskEntry>,
    specials: Vec<SpecialEntry>,
    subscriptions: Vec<SubscriptionEntry>,
    migrations: Vec<(String, TaskHandler)>,
    channels: Vec<String>,
}

impl CommandSuite {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            commands: Vec::new(),
            tasks: Vec::new(),
            specials: Vec::new(),
            subscriptions: Vec::new(),
            migrations: Vec::new(),
            channels: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn command(mut self, command: Command) -> Self {
        self.commands.push(command);
        self
    }

    pub fn task<F, Fut>(mut self, name: impl Into<String>, interval: Duration, handler: F) -> Self
    where
        F: Fn(Client) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.tasks.push(TaskEntry {
            name: name.into(),
            interval,
            handler: task_handler(handler),
        });
        self
    }

    /// Exclusive handler for non-command messages accepted by `check`.
    pub fn special<C, F, Fut>(mut self, name: impl Into<String>, check: C, handler: F) -> Self
    where
        C: Fn(&Message) -> bool + Send + Sync + 'static,
        F: Fn(Client, Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.specials.push(SpecialEntry {
            name: name.into(),
            check: Arc::new(check),
            handler: message_handler(handler),
        });
        self
    }

    pub fn subscribe<F, Fut>(mut self, event: impl Into<String>, options: SubscribeOptions, handler: F) -> Self
    where
        F: Fn(Client, Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.subscriptions.push(SubscriptionEntry {
            event: event.into(),
            options,
            handler: event_handler(handler),
        });
        self
    }

    /// One-time job run after the first `ready`, keyed by `key`.
    pub fn migration<F, Fut>(mut self, key: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Client) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.migrations.push((key.into(), task_handler(handler)));
        self
    }

    pub fn reserve_channel(mut self, name: impl Into<String>) -> Self {
        self.channels.push(name.into());
        self
    }

    /// Register everything with `client`.
    pub fn attach(self, client: &Client) -> Result<(), ClientError> {
        info!(
            suite = %self.name,
            commands = self.commands.len(),
            tasks = self.tasks.len(),
            specials = self.specials.len(),
            subscriptions = self.subscriptions.len(),
            migrations = self.migrations.len(),
            channels = self.channels.len(),
            "enabling command suite"
        );

        for channel in self.channels {
            client.reserve_channel(channel);
        }
        for (key, handler) in self.migrations {
            client.add_migration(key, handler);
        }
        for subscription in self.subscriptions {
            client.subscribe_handler(subscription.event, subscription.options, subscription.handler);
        }
        for special in self.specials {
            client.add_special_handler(&special.name, special.check, special.handler)?;
        }
        for task in self.tasks {
            client.add_task_handler(&task.name, task.interval, task.handler)?;
        }
        for command in self.commands {
            client.add_command(command);
        }
        Ok(())
    }
}

impl std::fmt::Debug for CommandSuite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandSuite")
            .field("name", &self.name)
            .field("commands", &self.commands)
            .field("tasks", &self.tasks.iter().map(|t| &t.name).collect::<Vec<_>>())
            .field("channels", &self.channels)
            .finish_non_exhaustive()
    }
}

//! The bot client: wires the store, bus, scheduler and router together and
//! turns inbound messages into command invocations.
//!
//! Inbound messages are dispatched as the `message` event. The client's own
//! handler for that event runs between the `before:message` and `message`
//! listeners and decides, in order:
//!
//! 1. drop messages from the bot itself, unknown users, ignored users or
//!    holders of an ignored role, and empty messages
//! 2. a registered command word dispatches the command event
//!    (`!ping` dispatches `!ping`)
//! 3. otherwise an active [`Client::wait_for_message`] may take it
//! 4. otherwise the first matching special handler is dispatched as
//!    `special:{name}`
//!
//! A command listener checks permissions, parses arguments, runs the
//! handler, reports failures to the user without leaking details, and
//! finally dispatches `command` with the command name and author.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::args::Argspec;
use crate::bus::{
    extract_panic_message, BusError, Dispatched, Event, EventArgs, EventBus, SubscribeOptions, Subscription,
};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::debounce::{Debouncer, DEBOUNCE_EVENT};
use crate::error::{ClientError, CommandOutcome, FailureKind, DENIED_MESSAGE};
use crate::future::{FutureDispatch, When};
use crate::perms::Permissions;
use crate::platform::{Author, ChannelId, Message, Platform, PlatformError, UserId};
use crate::router::{CommandSpec, Route, Router};
use crate::scheduler::{Scheduler, DEFAULT_CEILING};
use crate::store::Store;
use crate::suite::{
    event_handler, message_handler, task_handler, Command, CommandHandler, CommandSuite, EventHandler,
    MessageCheck, MessageHandler, TaskHandler,
};

/// Scope recording which migrations have run.
pub const MIGRATIONS_SCOPE: &str = "core_migrations";

/// Channel reference every unresolved reference falls back to.
pub const GENERAL_CHANNEL: &str = "general";

/// Channel reference receiving handler traces.
pub const DEV_CHANNEL: &str = "dev";

/// Builder for [`Client`].
pub struct ClientBuilder {
    platform: Arc<dyn Platform>,
    config: Config,
    store: Option<Store>,
    clock: Arc<dyn Clock>,
    ceiling: Duration,
}

impl ClientBuilder {
    pub fn new(platform: Arc<dyn Platform>) -> Self {
        Self {
            platform,
            config: Config::default(),
            store: None,
            clock: Arc::new(SystemClock),
            ceiling: DEFAULT_CEILING,
        }
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Defaults to a file store at the configured database path.
    pub fn store(mut self, store: Store) -> Self {
        self.store = Some(store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Longest the task runner sleeps between checks.
    pub fn task_ceiling(mut self, ceiling: Duration) -> Self {
        self.ceiling = ceiling;
        self
    }

    pub fn build(self) -> Result<Client, ClientError> {
        let store = self
            .store
            .unwrap_or_else(|| Store::new(self.config.paths.database.clone()));
        let bus = EventBus::new();
        let scheduler = Scheduler::with_ceiling(bus.clone(), store.clone(), self.clock.clone(), self.ceiling);
        let future = FutureDispatch::new(bus.clone(), store.clone(), self.clock.clone(), scheduler.clone());

        let client = Client {
            inner: Arc::new(ClientInner {
                platform: self.platform,
                config: self.config,
                store,
                clock: self.clock,
                bus,
                scheduler,
                future,
                router: Router::new(),
                debouncer: Debouncer::default(),
                permissions: RwLock::new(Arc::new(Permissions::default())),
                handlers: RwLock::new(HashMap::new()),
                channels: RwLock::new(BTreeMap::new()),
                ignored: RwLock::new(HashSet::new()),
            }),
        };

        let weak = Arc::downgrade(&client.inner);
        client.inner.bus.reserve("message", move |event: Event| {
            let weak = weak.clone();
            async move {
                let Some(client) = Client::upgrade(&weak) else {
                    return anyhow::Ok(());
                };
                let message: Message = event.arg(0)?;
                client.process_message(message).await;
                anyhow::Ok(())
            }
        });

        client.inner.future.register()?;
        essentials().attach(&client)?;
        Ok(client)
    }
}

/// Handle to a running bot. Cheap to clone.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    platform: Arc<dyn Platform>,
    config: Config,
    store: Store,
    clock: Arc<dyn Clock>,
    bus: EventBus,
    scheduler: Scheduler,
    future: FutureDispatch,
    router: Router,
    debouncer: Debouncer,
    permissions: RwLock<Arc<Permissions>>,
    handlers: RwLock<HashMap<String, CommandHandler>>,
    /// Reference name -> resolved channel, once resolved.
    channels: RwLock<BTreeMap<String, Option<ChannelId>>>,
    ignored: RwLock<HashSet<UserId>>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("prefix", &self.inner.config.prefix)
            .field("router", &self.inner.router)
            .field("bus", &self.inner.bus)
            .finish_non_exhaustive()
    }
}

fn message_args(message: &Message) -> EventArgs {
    match serde_json::to_value(message) {
        Ok(value) => EventArgs::new().with_arg(value),
        Err(e) => {
            error!(message = %message.id, error = %e, "failed to encode message");
            EventArgs::new()
        }
    }
}

impl Client {
    pub fn builder(platform: Arc<dyn Platform>) -> ClientBuilder {
        ClientBuilder::new(platform)
    }

    fn upgrade(weak: &Weak<ClientInner>) -> Option<Client> {
        weak.upgrade().map(|inner| Client { inner })
    }

    fn downgrade(&self) -> Weak<ClientInner> {
        Arc::downgrade(&self.inner)
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn store(&self) -> &Store {
        &self.inner.store
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    pub fn platform(&self) -> &Arc<dyn Platform> {
        &self.inner.platform
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    pub fn permissions(&self) -> Arc<Permissions> {
        self.inner
            .permissions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_permissions(&self, permissions: Permissions) {
        *self
            .inner
            .permissions
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Arc::new(permissions);
    }

    /// Registered command names, with prefix.
    pub fn command_names(&self) -> Vec<String> {
        self.inner.router.command_names()
    }

    pub fn command(&self, name: &str) -> Option<Arc<CommandSpec>> {
        self.inner.router.command(&self.with_prefix(name).to_lowercase())
    }

    pub fn strip_prefix<'a>(&self, command: &'a str) -> &'a str {
        command
            .strip_prefix(self.inner.config.prefix.as_str())
            .unwrap_or(command)
    }

    fn with_prefix(&self, command: &str) -> String {
        if command.starts_with(&self.inner.config.prefix) {
            command.to_string()
        } else {
            format!("{}{}", self.inner.config.prefix, command)
        }
    }

    // =========================================================================
    // Registration
    // =========================================================================

    pub fn enable_suites<I>(&self, suites: I) -> Result<&Self, ClientError>
    where
        I: IntoIterator<Item = CommandSuite>,
    {
        for suite in suites {
            suite.attach(self)?;
        }
        Ok(self)
    }

    /// Register a command under its name and aliases. Re-registering a name
    /// replaces its handler.
    pub fn add_command(&self, command: Command) {
        for name in std::iter::once(&command.name).chain(command.aliases.iter()) {
            let name = self.with_prefix(name).to_lowercase();
            let spec = CommandSpec {
                name: name.clone(),
                help: command.help.clone(),
                argspec: Argspec::new(name.clone(), command.args.clone()),
                delimiter: command.delimiter.clone(),
            };
            if let Some(delimiter) = &spec.delimiter {
                if self.inner.config.disable_delimiters {
                    warn!(command = %name, %delimiter, "delimiters are disabled, ignoring");
                }
            }
            self.inner
                .handlers
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(name.clone(), command.handler.clone());
            if !self.inner.router.add_command(spec) {
                warn!(command = %name, "command replaced");
                continue;
            }

            debug!(command = %name, "command registered");
            let weak = self.downgrade();
            let event = name.clone();
            self.inner.bus.subscribe(name, SubscribeOptions::new(), move |e: Event| {
                let weak = weak.clone();
                let event = event.clone();
                async move {
                    let Some(client) = Client::upgrade(&weak) else {
                        return anyhow::Ok(());
                    };
                    let message: Message = e.arg(0)?;
                    client.invoke_command(&event, message).await?;
                    anyhow::Ok(())
                }
            });
        }
    }

    /// Subscribe a handler that receives the client along with the event.
    pub fn subscribe<F, Fut>(&self, event: impl Into<String>, options: SubscribeOptions, handler: F) -> Subscription
    where
        F: Fn(Client, Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.subscribe_handler(event.into(), options, event_handler(handler))
    }

    pub(crate) fn subscribe_handler(
        &self,
        event: String,
        options: SubscribeOptions,
        handler: EventHandler,
    ) -> Subscription {
        let weak = self.downgrade();
        self.inner.bus.subscribe(event, options, move |event: Event| {
            let weak = weak.clone();
            let handler = handler.clone();
            async move {
                match Client::upgrade(&weak) {
                    Some(client) => handler(client, event).await,
                    None => anyhow::Ok(()),
                }
            }
        })
    }

    /// Register a recurring task `name`, run as the event `task:{name}`.
    pub fn add_task<F, Fut>(&self, name: &str, interval: Duration, handler: F) -> Result<Subscription, ClientError>
    where
        F: Fn(Client) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.add_task_handler(name, interval, task_handler(handler))
    }

    pub(crate) fn add_task_handler(
        &self,
        name: &str,
        interval: Duration,
        handler: TaskHandler,
    ) -> Result<Subscription, ClientError> {
        let weak = self.downgrade();
        let subscription = self.inner.scheduler.add_task(name, interval, move || {
            let weak = weak.clone();
            let handler = handler.clone();
            async move {
                match Client::upgrade(&weak) {
                    Some(client) => handler(client).await,
                    None => anyhow::Ok(()),
                }
            }
        })?;
        Ok(subscription)
    }

    pub fn update_interval(&self, task: &str, next: Duration, permanent: bool) -> Result<(), ClientError> {
        Ok(self.inner.scheduler.update_interval(task, next, permanent)?)
    }

    /// Register an exclusive handler for non-command messages, dispatched as
    /// `special:{name}`.
    pub fn add_special<C, F, Fut>(&self, name: &str, check: C, handler: F) -> Result<Subscription, ClientError>
    where
        C: Fn(&Message) -> bool + Send + Sync + 'static,
        F: Fn(Client, Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.add_special_handler(name, Arc::new(check), message_handler(handler))
    }

    pub(crate) fn add_special_handler(
        &self,
        name: &str,
        check: MessageCheck,
        handler: MessageHandler,
    ) -> Result<Subscription, ClientError> {
        let event = format!("special:{name}");
        if !self.inner.router.add_special(event.clone(), check) {
            return Err(ClientError::DuplicateSpecial(event));
        }
        let weak = self.downgrade();
        Ok(self.inner.bus.subscribe(event, SubscribeOptions::new(), move |e: Event| {
            let weak = weak.clone();
            let handler = handler.clone();
            async move {
                let Some(client) = Client::upgrade(&weak) else {
                    return anyhow::Ok(());
                };
                let message: Message = e.arg(0)?;
                handler(client, message).await
            }
        }))
    }

    /// Run `handler` once, after the first `ready`, unless `key` is already
    /// recorded in the `core_migrations` scope.
    pub fn migration<F, Fut>(&self, key: impl Into<String>, handler: F) -> Subscription
    where
        F: Fn(Client) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.add_migration(key.into(), task_handler(handler))
    }

    pub(crate) fn add_migration(&self, key: String, handler: TaskHandler) -> Subscription {
        let weak = self.downgrade();
        self.inner.bus.subscribe("after:ready", SubscribeOptions::once(), move |_event: Event| {
            let weak = weak.clone();
            let handler = handler.clone();
            let key = key.clone();
            async move {
                let Some(client) = Client::upgrade(&weak) else {
                    return anyhow::Ok(());
                };
                let mut tx = client.store().begin([MIGRATIONS_SCOPE]).await?;
                if tx.get(MIGRATIONS_SCOPE)?.get(&key).is_some() {
                    debug!(migration = %key, "migration already applied");
                    return anyhow::Ok(());
                }
                info!(migration = %key, "running migration");
                handler(client.clone()).await?;
                tx.object_mut(MIGRATIONS_SCOPE)?
                    .insert(key.clone(), Value::String(client.clock().now().to_rfc3339()));
                tx.commit().await?;
                anyhow::Ok(())
            }
        })
    }

    /// Declare a channel reference that configuration can map under
    /// `channels:`. Unmapped references resolve to `general`.
    pub fn reserve_channel(&self, name: impl Into<String>) {
        self.inner
            .channels
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name.into())
            .or_insert(None);
    }

    /// Resolved channel for `name`, falling back to `general`.
    pub fn fetch_channel(&self, name: &str) -> Option<ChannelId> {
        let channels = self.inner.channels.read().unwrap_or_else(PoisonError::into_inner);
        channels
            .get(name)
            .cloned()
            .flatten()
            .or_else(|| channels.get(GENERAL_CHANNEL).cloned().flatten())
    }

    // =========================================================================
    // Ignored users
    // =========================================================================

    pub fn ignore_user(&self, user: UserId) {
        info!(%user, "ignoring user");
        self.inner
            .ignored
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(user);
    }

    pub fn unignore_user(&self, user: &UserId) -> bool {
        let removed = self
            .inner
            .ignored
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(user);
        if removed {
            info!(%user, "no longer ignoring user");
        }
        removed
    }

    pub fn is_ignored(&self, user: &UserId) -> bool {
        self.inner
            .ignored
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(user)
    }

    /// Whether `member` holds one of the configured `ignore_role` roles.
    pub fn has_ignored_role(&self, member: &Author) -> bool {
        let ignored = &self.inner.config.ignore_role;
        member.roles.iter().any(|role| ignored.contains(role))
    }

    /// Re-evaluate a member whose roles changed: ignore them if they now hold
    /// an ignored role, otherwise lift any ignore.
    pub fn update_member(&self, member: &Author) {
        if self.has_ignored_role(member) {
            self.ignore_user(member.id.clone());
        } else {
            self.unignore_user(&member.id);
        }
    }

    // =========================================================================
    // Events
    // =========================================================================

    pub fn dispatch(&self, event: &str, args: EventArgs) -> Dispatched {
        self.inner.bus.dispatch(event, args)
    }

    pub fn dispatch_manual(&self, event: &str, args: EventArgs) -> Dispatched {
        self.inner.bus.dispatch_manual(event, args)
    }

    /// Dispatch `event` at a later time. Survives restarts.
    pub async fn dispatch_future(
        &self,
        when: impl Into<When>,
        event: &str,
        args: EventArgs,
    ) -> Result<chrono::DateTime<Utc>, ClientError> {
        Ok(self.inner.future.schedule(when, event, args).await?)
    }

    pub async fn wait_for<F>(&self, event: &str, condition: F, timeout: Option<Duration>) -> Result<Event, BusError>
    where
        F: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        self.inner.bus.wait_for(event, condition, timeout).await
    }

    /// Take the next non-command message accepted by `check`, before any
    /// special handler sees it.
    pub async fn wait_for_message<F>(&self, check: F, timeout: Option<Duration>) -> Result<Message, BusError>
    where
        F: Fn(&Message) -> bool + Send + Sync + 'static,
    {
        let (_guard, rx) = self.inner.router.intercept(Arc::new(check));
        let received = match timeout {
            Some(after) => tokio::time::timeout(after, rx)
                .await
                .map_err(|_| BusError::Timeout {
                    event: "message".to_string(),
                    after,
                })?,
            None => rx.await,
        };
        received.map_err(|_| BusError::Closed {
            event: "message".to_string(),
        })
    }

    // =========================================================================
    // Messages
    // =========================================================================

    /// Feed an inbound message from the platform.
    pub fn handle_message(&self, message: Message) -> Dispatched {
        self.inner.bus.dispatch("message", message_args(&message))
    }

    async fn process_message(&self, message: Message) {
        let author = &message.author.id;
        if *author == self.inner.platform.bot_user() {
            return;
        }
        if !self.inner.platform.is_known_user(author) {
            debug!(user = %author, "message from unknown user dropped");
            return;
        }
        if self.is_ignored(author) || self.has_ignored_role(&message.author) {
            info!(user = %author, "ignoring message");
            return;
        }

        match self.inner.router.route(&message) {
            Route::Command(spec) => {
                debug!(command = %spec.name, "dispatching command");
                self.dispatch(&spec.name, message_args(&message)).wait().await;
            }
            Route::Special(event) => {
                self.dispatch(&event, message_args(&message)).wait().await;
            }
            Route::Intercepted | Route::Unhandled | Route::Empty => {}
        }
    }

    /// Run command `name` for `message`: permissions, argument parsing,
    /// handler, failure reply, then the `command` event.
    pub async fn invoke_command(&self, name: &str, message: Message) -> Result<CommandOutcome, ClientError> {
        let name = self.with_prefix(name).to_lowercase();
        let spec = self
            .inner
            .router
            .command(&name)
            .ok_or_else(|| ClientError::UnknownCommand(name.clone()))?;
        let handler = self
            .inner
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&name)
            .cloned()
            .ok_or_else(|| ClientError::UnknownCommand(name.clone()))?;

        let decision = self.permissions().query(&message.author, self.strip_prefix(&name));
        if !decision.allowed {
            info!(
                command = %name,
                user = %message.author.id,
                channel = %message.channel,
                rule = ?decision.source,
                "command denied"
            );
            self.send_message(&message.channel, DENIED_MESSAGE).detach();
            return Ok(CommandOutcome::Denied);
        }

        info!(command = %name, user = %message.author.id, channel = %message.channel, "command invoked");
        let tokens = spec.split_args(&message.content, self.inner.config.disable_delimiters);
        let args = match spec.argspec.parse(tokens.as_slice()) {
            Ok(args) => args,
            Err(e) => {
                let usage = e.to_string();
                self.send_message(&message.channel, usage.clone()).detach();
                return Ok(CommandOutcome::Usage(usage));
            }
        };

        let channel = message.channel.clone();
        let author = message.author.clone();
        let result = AssertUnwindSafe(handler(self.clone(), message, args))
            .catch_unwind()
            .await;
        let outcome = match result {
            Ok(Ok(())) => CommandOutcome::Completed,
            Ok(Err(e)) => {
                let kind = FailureKind::categorize(&e);
                error!(command = %name, error = ?e, ?kind, "command failed");
                self.trace(&format!("{name}: {e:?}")).await;
                self.send_message(&channel, kind.user_message()).detach();
                CommandOutcome::Failed(kind)
            }
            Err(panic_info) => {
                let panic_msg = extract_panic_message(&panic_info);
                error!(command = %name, panic = %panic_msg, "command panicked");
                self.trace(&format!("{name} panicked: {panic_msg}")).await;
                self.send_message(&channel, FailureKind::Internal.user_message()).detach();
                CommandOutcome::Failed(FailureKind::Internal)
            }
        };

        self.dispatch("command", command_args(&name, &author)).detach();
        Ok(outcome)
    }

    /// Send through the per-channel debouncer.
    pub fn send_message(&self, channel: &ChannelId, content: impl Into<String>) -> Dispatched {
        self.dispatch(
            DEBOUNCE_EVENT,
            EventArgs::new()
                .with_arg(channel.0.clone())
                .with_arg(content.into()),
        )
    }

    /// Send immediately, skipping the debouncer.
    pub async fn send_message_now(&self, channel: &ChannelId, content: &str) -> Result<(), PlatformError> {
        self.inner.platform.send(channel, content).await
    }

    /// Log `details` and, when `send_traces` is set, post them to the `dev`
    /// channel reference. Never fails.
    pub async fn trace(&self, details: &str) {
        debug!(details, "trace");
        if !self.inner.config.send_traces {
            return;
        }
        let Some(channel) = self.fetch_channel(DEV_CHANNEL) else {
            warn!("send_traces is set but no dev channel is available");
            return;
        };
        if let Err(e) = self.send_message_now(&channel, &format!("```\n{details}\n```")).await {
            warn!(error = %e, "failed to send trace");
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Resolve configuration against the platform, start the task runner and
    /// dispatch `ready`. Returns once every `ready` listener has finished.
    pub async fn start(&self) -> Result<(), ClientError> {
        if !self.inner.config.ignore_role.is_empty() {
            info!(roles = ?self.inner.config.ignore_role, "ignoring members holding roles");
        }
        self.inner.scheduler.validate_fingerprint().await?;
        self.resolve_channels()?;

        let config = &self.inner.config;
        let permissions = Permissions::load(
            &config.paths.permissions,
            self.inner.platform.as_ref(),
            &self.inner.store,
            config.permissions_matching,
        )
        .await?;
        self.set_permissions(permissions);

        info!(
            commands = self.command_names().len(),
            tasks = self.inner.scheduler.task_names().len(),
            prefix = %config.prefix,
            "starting"
        );
        self.inner.scheduler.start();

        let failures = self
            .dispatch("ready", EventArgs::new())
            .wait()
            .await
            .into_iter()
            .filter(Result::is_err)
            .count();
        if failures > 0 {
            warn!(failures, "ready listeners failed");
        }
        info!("startup complete");
        Ok(())
    }

    fn resolve_channels(&self) -> Result<(), ClientError> {
        let platform = &self.inner.platform;
        let configured = &self.inner.config.channels;
        let mut channels = self.inner.channels.write().unwrap_or_else(PoisonError::into_inner);

        let general = platform.resolve_channel(GENERAL_CHANNEL);
        if general.is_none() {
            warn!("no general channel found");
        }
        channels.insert(GENERAL_CHANNEL.to_string(), general);

        for (reference, resolved) in channels.iter_mut() {
            if reference == GENERAL_CHANNEL && !configured.contains_key(GENERAL_CHANNEL) {
                continue;
            }
            match configured.get(reference) {
                Some(target) => {
                    let channel = platform.resolve_channel(target).ok_or_else(|| ClientError::UnknownChannel {
                        reference: reference.clone(),
                        target: target.clone(),
                    })?;
                    debug!(%reference, %channel, "channel reference resolved");
                    *resolved = Some(channel);
                }
                None => warn!(%reference, "channel reference is not defined"),
            }
        }
        Ok(())
    }

    /// Dispatch `cleanup`, wait for its listeners, then stop the task runner.
    pub async fn shutdown(&self) {
        let handles = self.dispatch("cleanup", EventArgs::new());
        if !handles.is_empty() {
            info!(tasks = handles.len(), "waiting for cleanup tasks to complete");
        }
        handles.wait().await;
        self.inner.scheduler.stop().await;
        info!("shutdown complete");
    }
}

fn command_args(name: &str, author: &Author) -> EventArgs {
    let args = EventArgs::new().with_arg(name);
    match serde_json::to_value(author) {
        Ok(author) => args.with_arg(author),
        Err(_) => args,
    }
}

/// Core handlers every client carries.
fn essentials() -> CommandSuite {
    CommandSuite::new("Beymax Core API Essentials")
        .reserve_channel(DEV_CHANNEL)
        .subscribe(
            DEBOUNCE_EVENT,
            SubscribeOptions::new(),
            |client: Client, event: Event| async move {
                let channel = ChannelId(event.arg::<String>(0)?);
                let content: String = event.arg(1)?;
                let platform = client.inner.platform.clone();
                client
                    .inner
                    .debouncer
                    .push(&channel, &content, |channel, body| async move {
                        platform.send(&channel, &body).await
                    })
                    .await?;
                anyhow::Ok(())
            },
        )
        .subscribe(
            "after:member_update",
            SubscribeOptions::new(),
            |client: Client, event: Event| async move {
                let member: Author = event.arg(0)?;
                client.update_member(&member);
                anyhow::Ok(())
            },
        )
}

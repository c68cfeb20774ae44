//! Named-event bus with `before:`/`after:` phases.
//!
//! Listeners subscribe to an event *name*. Dispatching `x` runs, in order of
//! scheduling:
//!
//! 1. listeners on `before:x`
//! 2. the reserved handler for `x`, if one is registered
//! 3. listeners on `x`
//! 4. listeners on `after:x`
//!
//! Every listener runs in its own spawned task, so listeners of one phase
//! interleave freely; only the order in which phases are *scheduled* is
//! guaranteed. A failing or panicking listener is logged and reported through
//! its own join handle. It never affects its siblings or the dispatch call.
//!
//! Manual dispatch skips the phases and the reserved handler and runs only
//! listeners on the exact name.
//!
//! # Example
//!
//! ```ignore
//! let bus = EventBus::new();
//!
//! bus.subscribe("ready", SubscribeOptions::once(), |event: Event| async move {
//!     tracing::info!(event = %event.name, "connected");
//!     Ok(())
//! });
//!
//! bus.dispatch("ready", EventArgs::new()).wait().await;
//! ```

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace};

/// How many dispatched event names are kept for diagnostics.
pub const RECENT_EVENTS_CAPACITY: usize = 100;

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Error)]
pub enum BusError {
    #[error("timed out after {after:?} waiting for {event}")]
    Timeout { event: String, after: Duration },

    #[error("bus closed while waiting for {event}")]
    Closed { event: String },

    #[error("event {event} has no positional argument {index}")]
    MissingArg { event: String, index: usize },

    #[error("event {event} has no keyword argument {key}")]
    MissingKwarg { event: String, key: String },

    #[error("event {event} argument {position} is malformed: {message}")]
    BadArg {
        event: String,
        position: String,
        message: String,
    },
}

// =============================================================================
// Events
// =============================================================================

/// Positional and keyword arguments carried by an event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventArgs {
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl EventArgs {
    /// No arguments.
    pub fn new() -> Self {
        Self::default()
    }

    /// Positional arguments only.
    pub fn positional(args: Vec<Value>) -> Self {
        Self {
            args,
            kwargs: Map::new(),
        }
    }

    /// Append a positional argument.
    pub fn with_arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Set a keyword argument, replacing any previous value for `key`.
    pub fn with_kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }

    /// True when there are neither positional nor keyword arguments.
    pub fn is_empty(&self) -> bool {
        self.args.is_empty() && self.kwargs.is_empty()
    }
}

/// One delivery of a named event to a listener.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// The name this listener subscribed to, including any phase prefix.
    pub name: String,
    pub args: EventArgs,
}

impl Event {
    pub fn new(name: impl Into<String>, args: EventArgs) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }

    /// Decode positional argument `index`.
    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> Result<T, BusError> {
        let value = self.args.args.get(index).ok_or_else(|| BusError::MissingArg {
            event: self.name.clone(),
            index,
        })?;
        serde_json::from_value(value.clone()).map_err(|e| BusError::BadArg {
            event: self.name.clone(),
            position: index.to_string(),
            message: e.to_string(),
        })
    }

    /// Decode keyword argument `key`.
    pub fn kwarg<T: DeserializeOwned>(&self, key: &str) -> Result<T, BusError> {
        let value = self.args.kwargs.get(key).ok_or_else(|| BusError::MissingKwarg {
            event: self.name.clone(),
            key: key.to_string(),
        })?;
        serde_json::from_value(value.clone()).map_err(|e| BusError::BadArg {
            event: self.name.clone(),
            position: key.to_string(),
            message: e.to_string(),
        })
    }
}

// =============================================================================
// Listeners
// =============================================================================

/// Something that reacts to events.
///
/// Implemented for any `Fn(Event) -> impl Future<Output = anyhow::Result<()>>`.
#[async_trait]
pub trait Listener: Send + Sync + 'static {
    async fn handle(&self, event: Event) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> Listener for F
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, event: Event) -> anyhow::Result<()> {
        (self)(event).await
    }
}

/// Predicate evaluated against the event before a listener runs.
pub type Condition = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

/// Options for [`EventBus::subscribe`].
#[derive(Clone, Default)]
pub struct SubscribeOptions {
    pub condition: Option<Condition>,
    pub once: bool,
}

impl SubscribeOptions {
    /// Persistent and unconditional.
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove the listener the first time it is selected to run.
    pub fn once() -> Self {
        Self {
            condition: None,
            once: true,
        }
    }

    /// Only run when `condition` holds. A one-shot listener is only consumed
    /// by a dispatch whose condition holds.
    pub fn when<F>(mut self, condition: F) -> Self
    where
        F: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        self.condition = Some(Arc::new(condition));
        self
    }
}

impl std::fmt::Debug for SubscribeOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscribeOptions")
            .field("condition", &self.condition.is_some())
            .field("once", &self.once)
            .finish()
    }
}

#[derive(Clone)]
struct Registered {
    id: u64,
    listener: Arc<dyn Listener>,
    condition: Option<Condition>,
    once: bool,
}

// =============================================================================
// Bus
// =============================================================================

/// Registry of named-event listeners. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

#[derive(Default)]
struct BusInner {
    listeners: Mutex<HashMap<String, Vec<Registered>>>,
    reserved: Mutex<HashMap<String, Arc<dyn Listener>>>,
    preempted: Mutex<HashMap<String, usize>>,
    recent: Mutex<VecDeque<String>>,
    next_id: AtomicU64,
    dispatched: AtomicU64,
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener` on `event`.
    pub fn subscribe<L: Listener>(
        &self,
        event: impl Into<String>,
        options: SubscribeOptions,
        listener: L,
    ) -> Subscription {
        self.subscribe_arc(event, options, Arc::new(listener))
    }

    /// [`EventBus::subscribe`] for an already shared listener.
    pub fn subscribe_arc(
        &self,
        event: impl Into<String>,
        options: SubscribeOptions,
        listener: Arc<dyn Listener>,
    ) -> Subscription {
        let event = event.into();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.inner.listeners)
            .entry(event.clone())
            .or_default()
            .push(Registered {
                id,
                listener,
                condition: options.condition,
                once: options.once,
            });
        trace!(event = %event, id, once = options.once, "listener subscribed");
        Subscription {
            bus: Arc::downgrade(&self.inner),
            event,
            id,
        }
    }

    /// Install the engine's own handler for `event`, run between the
    /// `before:` phase and ordinary listeners. Replaces any previous one.
    pub fn reserve<L: Listener>(&self, event: impl Into<String>, handler: L) {
        lock(&self.inner.reserved).insert(event.into(), Arc::new(handler));
    }

    /// Number of listeners on exactly `event`.
    pub fn listener_count(&self, event: &str) -> usize {
        lock(&self.inner.listeners).get(event).map_or(0, Vec::len)
    }

    /// Dispatch with `before:`/`after:` phases.
    pub fn dispatch(&self, event: &str, args: EventArgs) -> Dispatched {
        self.dispatch_inner(event, args, false)
    }

    /// Dispatch only to listeners on exactly `event`.
    pub fn dispatch_manual(&self, event: &str, args: EventArgs) -> Dispatched {
        self.dispatch_inner(event, args, true)
    }

    fn dispatch_inner(&self, event: &str, args: EventArgs, manual: bool) -> Dispatched {
        self.inner.dispatched.fetch_add(1, Ordering::Relaxed);
        {
            let mut recent = lock(&self.inner.recent);
            while recent.len() >= RECENT_EVENTS_CAPACITY {
                recent.pop_front();
            }
            recent.push_back(event.to_string());
        }

        let mut handles = Vec::new();
        if manual {
            self.run_phase(event, &args, &mut handles);
        } else {
            self.run_phase(&format!("before:{event}"), &args, &mut handles);
            let reserved = lock(&self.inner.reserved).get(event).cloned();
            if let Some(handler) = reserved {
                handles.push(spawn_listener(Event::new(event, args.clone()), handler));
            }
            self.run_phase(event, &args, &mut handles);
            self.run_phase(&format!("after:{event}"), &args, &mut handles);
        }

        debug!(event = %event, manual, listeners = handles.len(), "event dispatched");
        Dispatched { handles }
    }

    fn run_phase(&self, name: &str, args: &EventArgs, handles: &mut Vec<JoinHandle<anyhow::Result<()>>>) {
        if self.is_preempted(name) {
            trace!(event = %name, "event preempted");
            return;
        }
        let candidates = match lock(&self.inner.listeners).get(name) {
            Some(registered) => registered.clone(),
            None => return,
        };

        let event = Event::new(name, args.clone());
        for registered in candidates {
            if let Some(condition) = &registered.condition {
                if !check_condition(condition, &event) {
                    continue;
                }
            }
            // A concurrent dispatch may have claimed this one-shot already.
            if registered.once && !self.remove(name, registered.id) {
                continue;
            }
            handles.push(spawn_listener(event.clone(), registered.listener));
        }
    }

    fn remove(&self, event: &str, id: u64) -> bool {
        let mut listeners = lock(&self.inner.listeners);
        let Some(registered) = listeners.get_mut(event) else {
            return false;
        };
        let before = registered.len();
        registered.retain(|r| r.id != id);
        let removed = registered.len() != before;
        if registered.is_empty() {
            listeners.remove(event);
        }
        removed
    }

    /// Suppress listeners on exactly `event` until the guard is dropped.
    pub fn preempt(&self, event: impl Into<String>) -> PreemptGuard {
        let event = event.into();
        *lock(&self.inner.preempted).entry(event.clone()).or_insert(0) += 1;
        debug!(event = %event, "event preemption raised");
        PreemptGuard {
            bus: self.inner.clone(),
            event,
        }
    }

    /// Whether a [`PreemptGuard`] for exactly `event` is alive.
    pub fn is_preempted(&self, event: &str) -> bool {
        lock(&self.inner.preempted)
            .get(event)
            .is_some_and(|count| *count > 0)
    }

    /// Wait for the next `event` for which `condition` holds.
    ///
    /// The temporary subscription is removed when this returns, whether it
    /// matched, timed out, or was cancelled.
    pub async fn wait_for<F>(
        &self,
        event: &str,
        condition: F,
        timeout: Option<Duration>,
    ) -> Result<Event, BusError>
    where
        F: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let tx = Arc::new(Mutex::new(Some(tx)));
        let subscription = self.subscribe(
            event,
            SubscribeOptions::once().when(condition),
            move |event: Event| {
                let tx = tx.clone();
                async move {
                    if let Some(tx) = lock(&tx).take() {
                        let _ = tx.send(event);
                    }
                    anyhow::Ok(())
                }
            },
        );
        let _guard = subscription.into_guard();

        let received = match timeout {
            Some(after) => tokio::time::timeout(after, rx)
                .await
                .map_err(|_| BusError::Timeout {
                    event: event.to_string(),
                    after,
                })?,
            None => rx.await,
        };
        received.map_err(|_| BusError::Closed {
            event: event.to_string(),
        })
    }

    /// Total number of dispatch calls so far.
    pub fn dispatch_count(&self) -> u64 {
        self.inner.dispatched.load(Ordering::Relaxed)
    }

    /// Most recently dispatched event names, oldest first.
    pub fn recent_events(&self) -> Vec<String> {
        lock(&self.inner.recent).iter().cloned().collect()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("events", &lock(&self.inner.listeners).len())
            .field("dispatched", &self.dispatch_count())
            .finish_non_exhaustive()
    }
}

fn check_condition(condition: &Condition, event: &Event) -> bool {
    match std::panic::catch_unwind(AssertUnwindSafe(|| condition(event))) {
        Ok(pass) => pass,
        Err(panic_info) => {
            let panic_msg = extract_panic_message(&panic_info);
            error!(event = %event.name, panic = %panic_msg, "listener condition panicked");
            false
        }
    }
}

fn spawn_listener(event: Event, listener: Arc<dyn Listener>) -> JoinHandle<anyhow::Result<()>> {
    tokio::spawn(async move {
        let name = event.name.clone();
        let result = AssertUnwindSafe(listener.handle(event)).catch_unwind().await;
        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                error!(event = %name, error = ?e, "listener failed");
                Err(e)
            }
            Err(panic_info) => {
                let panic_msg = extract_panic_message(&panic_info);
                error!(event = %name, panic = %panic_msg, "listener panicked");
                Err(anyhow::anyhow!("listener panicked: {}", panic_msg))
            }
        }
    })
}

pub(crate) fn extract_panic_message(panic_info: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic_info.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic_info.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// =============================================================================
// Handles
// =============================================================================

/// Work scheduled by one dispatch call.
#[derive(Debug, Default)]
#[must_use = "dropping Dispatched detaches the listeners; call .wait() to await them"]
pub struct Dispatched {
    handles: Vec<JoinHandle<anyhow::Result<()>>>,
}

impl Dispatched {
    /// Number of listener tasks scheduled.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// True when no listener matched the event.
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Fold another dispatch's work into this one.
    pub fn extend(&mut self, other: Dispatched) {
        self.handles.extend(other.handles);
    }

    /// Let the listeners run without awaiting them.
    pub fn detach(self) {}

    /// Await every listener and return their results in scheduling order.
    pub async fn wait(self) -> Vec<anyhow::Result<()>> {
        futures::future::join_all(self.handles)
            .await
            .into_iter()
            .map(|joined| match joined {
                Ok(result) => result,
                Err(e) => Err(anyhow::anyhow!("listener task failed: {}", e)),
            })
            .collect()
    }
}

/// Handle to one subscription.
#[derive(Debug, Clone)]
pub struct Subscription {
    bus: Weak<BusInner>,
    event: String,
    id: u64,
}

impl Subscription {
    /// The exact event name subscribed to, phase prefix included.
    pub fn event(&self) -> &str {
        &self.event
    }

    /// Remove the listener. Returns false if it was already gone.
    pub fn unsubscribe(&self) -> bool {
        let Some(inner) = self.bus.upgrade() else {
            return false;
        };
        let removed = EventBus { inner }.remove(&self.event, self.id);
        if !removed {
            debug!(event = %self.event, id = self.id, "listener was not subscribed");
        }
        removed
    }

    /// Unsubscribe automatically when the returned guard is dropped.
    pub fn into_guard(self) -> SubscriptionGuard {
        SubscriptionGuard(self)
    }
}

/// Unsubscribes on drop.
#[derive(Debug)]
pub struct SubscriptionGuard(Subscription);

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.0.unsubscribe();
    }
}

/// Keeps an event name preempted while alive.
pub struct PreemptGuard {
    bus: Arc<BusInner>,
    event: String,
}

impl Drop for PreemptGuard {
    fn drop(&mut self) {
        let mut preempted = lock(&self.bus.preempted);
        if let Some(count) = preempted.get_mut(&self.event) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                preempted.remove(&self.event);
            }
        }
        debug!(event = %self.event, "event preemption lowered");
    }
}

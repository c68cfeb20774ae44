//! Events scheduled for a later time.
//!
//! Entries are persisted in the `core_future_dispatch` scope and drained by
//! the `check_future_dispatch` task. Scheduling an entry pulls that task's
//! next run forward to one second; each drain then points the task at the
//! soonest entry still pending.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::bus::{Dispatched, EventArgs, EventBus, Subscription};
use crate::clock::Clock;
use crate::scheduler::{Scheduler, SchedulerError};
use crate::store::{Store, StoreError};

pub const FUTURE_DISPATCH_SCOPE: &str = "core_future_dispatch";

/// Name of the draining task.
pub const DRAIN_TASK: &str = "check_future_dispatch";

/// Regular cadence of the draining task.
pub const DRAIN_INTERVAL: Duration = Duration::from_secs(30);

/// A persisted pending event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FutureEvent {
    pub date: DateTime<Utc>,
    pub event: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

/// When a future event should fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum When {
    At(DateTime<Utc>),
    In(Duration),
    Seconds(i64),
}

impl When {
    fn resolve(self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            When::At(at) => at,
            When::In(after) => chrono::Duration::from_std(after)
                .ok()
                .and_then(|d| now.checked_add_signed(d))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            When::Seconds(secs) => chrono::Duration::try_seconds(secs)
                .and_then(|d| now.checked_add_signed(d))
                .unwrap_or(if secs < 0 {
                    DateTime::<Utc>::MIN_UTC
                } else {
                    DateTime::<Utc>::MAX_UTC
                }),
        }
    }
}

impl From<DateTime<Utc>> for When {
    fn from(at: DateTime<Utc>) -> Self {
        When::At(at)
    }
}

impl From<Duration> for When {
    fn from(after: Duration) -> Self {
        When::In(after)
    }
}

impl From<i64> for When {
    fn from(secs: i64) -> Self {
        When::Seconds(secs)
    }
}

/// Result of one drain.
#[derive(Debug, Default)]
pub struct Drained {
    /// Number of entries that fired.
    pub fired: usize,
    /// Listener work started by the fired entries.
    pub dispatched: Dispatched,
}

/// Persisted queue of future events.
#[derive(Clone)]
pub struct FutureDispatch {
    bus: EventBus,
    store: Store,
    clock: Arc<dyn Clock>,
    scheduler: Scheduler,
}

impl FutureDispatch {
    pub fn new(bus: EventBus, store: Store, clock: Arc<dyn Clock>, scheduler: Scheduler) -> Self {
        Self {
            bus,
            store,
            clock,
            scheduler,
        }
    }

    /// Register the draining task with the scheduler.
    pub fn register(&self) -> Result<Subscription, SchedulerError> {
        let queue = self.clone();
        self.scheduler.add_task(DRAIN_TASK, DRAIN_INTERVAL, move || {
            let queue = queue.clone();
            async move {
                queue.drain().await?.dispatched.detach();
                Ok::<(), anyhow::Error>(())
            }
        })
    }

    /// Persist `event` to fire at `when`, and ask the drain task to run soon.
    pub async fn schedule(
        &self,
        when: impl Into<When>,
        event: &str,
        args: EventArgs,
    ) -> Result<DateTime<Utc>, SchedulerError> {
        if self.scheduler.interval(DRAIN_TASK).is_none() {
            return Err(SchedulerError::UnknownTask(DRAIN_TASK.to_string()));
        }
        let date = when.into().resolve(self.clock.now());

        let mut tx = self.begin().await?;
        let mut entries: Vec<FutureEvent> = tx.decode(FUTURE_DISPATCH_SCOPE)?;
        entries.push(FutureEvent {
            date,
            event: event.to_string(),
            args: args.args,
            kwargs: args.kwargs,
        });
        tx.encode(FUTURE_DISPATCH_SCOPE, &entries)?;
        tx.commit().await?;
        debug!(event = %event, %date, pending = entries.len(), "future dispatch scheduled");

        self.scheduler
            .update_interval(DRAIN_TASK, Duration::from_secs(1), false)?;
        Ok(date)
    }

    /// Fire and remove every entry whose time has come.
    ///
    /// Entries are removed from the store before their events are
    /// dispatched, so an entry fires at most once.
    pub async fn drain(&self) -> Result<Drained, SchedulerError> {
        let now = self.clock.now();
        let mut tx = self.begin().await?;
        let entries: Vec<FutureEvent> = tx.decode(FUTURE_DISPATCH_SCOPE)?;
        let (due, pending): (Vec<_>, Vec<_>) = entries.into_iter().partition(|e| e.date <= now);

        if !due.is_empty() {
            tx.encode(FUTURE_DISPATCH_SCOPE, &pending)?;
            tx.commit().await?;
        } else {
            drop(tx);
        }

        let mut drained = Drained::default();
        for entry in due {
            let overshoot = (now - entry.date).num_milliseconds() as f64 / 1000.0;
            if overshoot > 1.0 {
                warn!(event = %entry.event, overshoot, "future dispatch overshot");
            }
            let args = EventArgs {
                args: entry.args,
                kwargs: entry.kwargs,
            };
            drained.dispatched.extend(self.bus.dispatch(&entry.event, args));
            drained.fired += 1;
        }
        if drained.fired > 0 {
            info!(fired = drained.fired, pending = pending.len(), "future dispatch drained");
        }

        if let Some(soonest) = pending.iter().map(|e| e.date).min() {
            let until = (soonest - now).num_milliseconds().max(0) as u64;
            let secs = until.div_ceil(1000);
            self.scheduler
                .update_interval(DRAIN_TASK, Duration::from_secs(secs), false)?;
        }
        Ok(drained)
    }

    /// Entries not yet fired, as last committed.
    pub fn pending(&self) -> Result<Vec<FutureEvent>, StoreError> {
        let view = self.store.readonly_snapshot([FUTURE_DISPATCH_SCOPE])?;
        match view.get(FUTURE_DISPATCH_SCOPE) {
            Some(entries) => entries.decode(),
            None => Ok(Vec::new()),
        }
    }

    async fn begin(&self) -> Result<crate::store::Transaction, StoreError> {
        self.store
            .transaction([FUTURE_DISPATCH_SCOPE])
            .default(FUTURE_DISPATCH_SCOPE, json!([]))
            .begin()
            .await
    }
}

impl std::fmt::Debug for FutureDispatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FutureDispatch").finish_non_exhaustive()
    }
}

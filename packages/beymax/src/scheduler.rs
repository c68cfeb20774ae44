//! Recurring tasks driven through the event bus.
//!
//! Each task `name` is registered as the event `task:name`. A background
//! runner wakes at least once per ceiling (30 s), dispatches every task whose
//! interval has elapsed since its last recorded run, waits for them, and then
//! sleeps until the next task is due or the ceiling comes round again.
//!
//! Last-run times live in the `tasks` scope as
//! `{"key": <fingerprint>, "tasks": {"task:name": <epoch seconds>}}`, so
//! cadence survives restarts. The fingerprint is the sorted concatenation of
//! registered task names; when it changes, every cached time is dropped.
//!
//! A task may ask to run sooner with a temporary interval
//! ([`Scheduler::update_interval`] with `permanent = false`). The override
//! is cleared the next time the task runs, however it was triggered.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use serde_json::{json, Value};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::bus::{Dispatched, Event, EventArgs, EventBus, SubscribeOptions, Subscription};
use crate::clock::{epoch_seconds, Clock};
use crate::store::{Store, StoreError};

/// Longest the runner ever sleeps.
pub const DEFAULT_CEILING: Duration = Duration::from_secs(30);

/// Scope holding task bookkeeping.
pub const TASKS_SCOPE: &str = "tasks";

const MIN_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("task {0} is already registered")]
    DuplicateTask(String),

    #[error("no such task: {0}")]
    UnknownTask(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Current and permanent run interval of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskInterval {
    pub current: Duration,
    pub permanent: Duration,
}

/// Event name of a task.
pub fn task_event(name: &str) -> String {
    if name.starts_with("task:") {
        name.to_string()
    } else {
        format!("task:{name}")
    }
}

fn tasks_default() -> Value {
    json!({"key": null, "tasks": {}})
}

/// Task registry plus its background runner. Cheap to clone.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    bus: EventBus,
    store: Store,
    clock: Arc<dyn Clock>,
    ceiling: Duration,
    tasks: Mutex<BTreeMap<String, TaskInterval>>,
    runner: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl Scheduler {
    pub fn new(bus: EventBus, store: Store, clock: Arc<dyn Clock>) -> Self {
        Self::with_ceiling(bus, store, clock, DEFAULT_CEILING)
    }

    pub fn with_ceiling(bus: EventBus, store: Store, clock: Arc<dyn Clock>, ceiling: Duration) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                bus,
                store,
                clock,
                ceiling,
                tasks: Mutex::new(BTreeMap::new()),
                runner: Mutex::new(None),
            }),
        }
    }

    fn tasks(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, TaskInterval>> {
        self.inner.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `handler` to run every `interval` (at least one second).
    pub fn add_task<F, Fut>(
        &self,
        name: &str,
        interval: Duration,
        handler: F,
    ) -> Result<Subscription, SchedulerError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let event = task_event(name);
        {
            let mut tasks = self.tasks();
            if tasks.contains_key(&event) {
                return Err(SchedulerError::DuplicateTask(event));
            }
            let interval = interval.max(MIN_INTERVAL);
            tasks.insert(
                event.clone(),
                TaskInterval {
                    current: interval,
                    permanent: interval,
                },
            );
        }
        debug!(task = %event, ?interval, "task registered");

        let scheduler: Weak<SchedulerInner> = Arc::downgrade(&self.inner);
        let handler = Arc::new(handler);
        let task = event.clone();
        Ok(self.inner.bus.subscribe(
            event,
            SubscribeOptions::new(),
            move |_event: Event| {
                let scheduler = scheduler.clone();
                let handler = handler.clone();
                let task = task.clone();
                async move {
                    let Some(inner) = scheduler.upgrade() else {
                        return Ok(());
                    };
                    let scheduler = Scheduler { inner };
                    scheduler.revert_interval(&task);
                    (*handler)().await?;
                    scheduler.record_run(&task).await?;
                    Ok::<(), anyhow::Error>(())
                }
            },
        ))
    }

    /// Change how soon a task runs next.
    ///
    /// A temporary change (`permanent = false`) is reverted the next time
    /// the task runs.
    pub fn update_interval(
        &self,
        name: &str,
        next: Duration,
        permanent: bool,
    ) -> Result<(), SchedulerError> {
        let event = task_event(name);
        let next = next.max(MIN_INTERVAL);
        let mut tasks = self.tasks();
        let interval = tasks
            .get_mut(&event)
            .ok_or_else(|| SchedulerError::UnknownTask(event.clone()))?;
        interval.current = next;
        if permanent {
            interval.permanent = next;
        }
        info!(task = %event, ?next, permanent, "task interval updated");
        Ok(())
    }

    pub fn interval(&self, name: &str) -> Option<TaskInterval> {
        self.tasks().get(&task_event(name)).copied()
    }

    /// Registered task event names, sorted.
    pub fn task_names(&self) -> Vec<String> {
        self.tasks().keys().cloned().collect()
    }

    fn revert_interval(&self, event: &str) {
        if let Some(interval) = self.tasks().get_mut(event) {
            if interval.current != interval.permanent {
                info!(task = %event, permanent = ?interval.permanent, "reverting task interval");
                interval.current = interval.permanent;
            }
        }
    }

    async fn record_run(&self, event: &str) -> Result<(), StoreError> {
        let now = epoch_seconds(self.inner.clock.now());
        let mut tx = self
            .inner
            .store
            .transaction([TASKS_SCOPE])
            .default(TASKS_SCOPE, tasks_default())
            .begin()
            .await?;
        let root = tx.object_mut(TASKS_SCOPE)?;
        let runs = root.entry("tasks").or_insert_with(|| json!({}));
        if !runs.is_object() {
            *runs = json!({});
        }
        runs[event] = json!(now);
        tx.commit().await
    }

    /// Last recorded run of every task, in epoch seconds.
    pub fn last_runs(&self) -> Result<BTreeMap<String, f64>, StoreError> {
        let defaults = BTreeMap::from([(TASKS_SCOPE.to_string(), tasks_default())]);
        let view = self
            .inner
            .store
            .readonly_snapshot_with([TASKS_SCOPE], &defaults)?;
        Ok(view[TASKS_SCOPE]["tasks"]
            .as_object()
            .map(|runs| {
                runs.iter()
                    .filter_map(|(name, at)| at.as_f64().map(|at| (name.clone(), at)))
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Compare the registered task set with the stored fingerprint, and drop
    /// all cached run times if it changed. Returns true if the cache was
    /// invalidated.
    pub async fn validate_fingerprint(&self) -> Result<bool, StoreError> {
        let key: String = self.task_names().concat();
        let mut tx = self
            .inner
            .store
            .transaction([TASKS_SCOPE])
            .default(TASKS_SCOPE, tasks_default())
            .begin()
            .await?;
        let current = tx.get(TASKS_SCOPE)?;
        if current["key"].as_str() == Some(key.as_str()) {
            debug!("task fingerprint unchanged");
            return Ok(false);
        }
        info!(tasks = self.task_names().len(), "task set changed, invalidating task time cache");
        tx.set(TASKS_SCOPE, json!({"key": key, "tasks": {}}))?;
        tx.commit().await?;
        Ok(true)
    }

    /// Run one wake cycle: dispatch every due task, wait for them, and
    /// return how long to sleep before the next cycle.
    pub async fn tick(&self) -> Result<Duration, StoreError> {
        let started = tokio::time::Instant::now();
        self.inner.store.ensure_loaded().await?;
        let now = epoch_seconds(self.inner.clock.now());
        let runs = self.last_runs()?;
        let tasks: Vec<(String, TaskInterval)> = self
            .tasks()
            .iter()
            .map(|(name, interval)| (name.clone(), *interval))
            .collect();

        let mut work = Dispatched::default();
        let mut due = 0usize;
        for (name, interval) in &tasks {
            let last = runs.get(name).copied().unwrap_or(0.0);
            if now - last >= interval.current.as_secs_f64() {
                debug!(task = %name, "dispatching task");
                work.extend(self.inner.bus.dispatch(name, EventArgs::new()));
                due += 1;
            }
        }
        if due > 0 {
            let failed = work.wait().await.iter().filter(|r| r.is_err()).count();
            info!(dispatched = due, failed, "task runner cycle complete");
        }

        // Re-read: intervals and run times changed while the tasks ran.
        let runs = self.last_runs()?;
        let now = epoch_seconds(self.inner.clock.now());
        let mut wait = self
            .inner
            .ceiling
            .saturating_sub(started.elapsed())
            .as_secs_f64();
        for (name, interval) in self.tasks().iter() {
            let last = runs.get(name).copied().unwrap_or(0.0);
            wait = wait.min(last + interval.current.as_secs_f64() - now);
        }
        Ok(Duration::from_secs_f64(wait.ceil().max(MIN_INTERVAL.as_secs_f64())))
    }

    /// Spawn the background runner. Returns false if it is already running.
    pub fn start(&self) -> bool {
        let mut runner = self.inner.runner.lock().unwrap_or_else(PoisonError::into_inner);
        if runner.is_some() {
            return false;
        }
        let shutdown = CancellationToken::new();
        let scheduler = self.clone();
        let token = shutdown.clone();
        let handle = tokio::spawn(async move { scheduler.run(token).await });
        *runner = Some((shutdown, handle));
        info!(tasks = self.tasks().len(), "task runner started");
        true
    }

    /// Stop the background runner, letting an in-flight cycle finish.
    pub async fn stop(&self) {
        let runner = self
            .inner
            .runner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some((shutdown, handle)) = runner {
            shutdown.cancel();
            if let Err(e) = handle.await {
                error!(error = %e, "task runner ended abnormally");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .runner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    async fn run(self, shutdown: CancellationToken) {
        let ceiling = self.inner.ceiling;
        let mut wait = ceiling;
        loop {
            if wait != ceiling {
                debug!(?wait, "task runner using dynamic sleep");
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
            wait = match self.tick().await {
                Ok(next) => next,
                Err(e) => {
                    error!(error = %e, "task runner cycle failed");
                    ceiling
                }
            };
        }
        info!("task runner stopped");
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("ceiling", &self.inner.ceiling)
            .field("tasks", &*self.tasks())
            .finish_non_exhaustive()
    }
}

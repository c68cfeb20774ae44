//! Persistent scoped key-value store.
//!
//! The store holds a map from *scope* name to an arbitrary JSON-compatible
//! value. Scopes are the unit of locking and of write access:
//!
//! - Any code may read any scope. Reads return [`Frozen`] views.
//! - Writes happen only inside a [`Transaction`] that declared the scope.
//! - A transaction locks its scopes in lexicographic order, so two
//!   transactions over overlapping scope sets can block each other but never
//!   deadlock.
//! - Commit persists only the transaction's own scopes. Dropping a
//!   transaction without committing discards its changes.
//!
//! ```ignore
//! let store = Store::new("db.msgpack");
//!
//! let mut tx = store
//!     .transaction(["players"])
//!     .default("players", json!({}))
//!     .begin()
//!     .await?;
//! tx.object_mut("players")?.insert("u1".into(), json!({"balance": 10}));
//! tx.commit().await?;
//! ```
//!
//! # Locking
//!
//! A single coordination lock serializes lazy loading of the snapshot,
//! creation of scope locks, and every read-modify-write of the backing file.
//! It is never held while waiting for a scope lock. Scope locks have no
//! timeout: a handler that stalls while holding a scope stalls every other
//! handler that needs that scope.

mod frozen;
mod snapshot;
mod transaction;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info};

pub use frozen::Frozen;
pub use snapshot::Snapshot;
pub use transaction::{Transaction, TransactionBuilder};

use snapshot::Backend;

/// Scope name used by [`Store::readonly_snapshot`] for the root view.
pub const ROOT_SCOPE: &str = "root";

// =============================================================================
// Store Error
// =============================================================================

/// Errors from the scoped store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The scope does not exist and no default applies.
    #[error("scope not found: {scope}")]
    ScopeNotFound { scope: String },

    /// The scope was deleted earlier in this transaction.
    #[error("scope deleted in this transaction: {scope}")]
    ScopeDeleted { scope: String },

    /// Write attempted on a scope the transaction does not hold.
    #[error("scope {scope} is currently frozen")]
    ScopeFrozen { scope: String },

    /// Stored value does not have the expected shape.
    #[error("scope {scope} has an unexpected shape: {message}")]
    Schema { scope: String, message: String },

    #[error("snapshot io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not decode snapshot {path}: {message}")]
    Decode { path: PathBuf, message: String },

    #[error("could not encode snapshot {path}: {message}")]
    Encode { path: PathBuf, message: String },
}

impl StoreError {
    /// True for write-access violations.
    pub fn is_scope_violation(&self) -> bool {
        matches!(self, StoreError::ScopeFrozen { .. })
    }
}

// =============================================================================
// Store
// =============================================================================

/// Handle to a scoped store. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    backend: Backend,
    coordinator: tokio::sync::Mutex<()>,
    loaded: AtomicBool,
    data: DashMap<String, Value>,
    scope_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl Store {
    /// Store backed by a snapshot file. Nothing is read until the first
    /// transaction.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_backend(Backend::File(path.into()))
    }

    /// Store whose durable snapshot lives in process memory.
    pub fn in_memory() -> Self {
        Self::with_backend(Backend::Memory(Mutex::new(Snapshot::new())))
    }

    fn with_backend(backend: Backend) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                backend,
                coordinator: tokio::sync::Mutex::new(()),
                loaded: AtomicBool::new(false),
                data: DashMap::new(),
                scope_locks: DashMap::new(),
            }),
        }
    }

    /// Path of the snapshot file, if file-backed.
    pub fn path(&self) -> Option<&Path> {
        self.inner.backend.path()
    }

    /// Start building a transaction over the given writable scopes.
    pub fn transaction<I, S>(&self, scopes: I) -> TransactionBuilder
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        TransactionBuilder::new(self.clone(), scopes)
    }

    /// Shorthand for `transaction(scopes).begin()`.
    pub async fn begin<I, S>(&self, scopes: I) -> Result<Transaction, StoreError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.transaction(scopes).begin().await
    }

    /// Read-only view of the given scopes, outside of any transaction.
    ///
    /// Does not take any lock, so the result may be stale relative to
    /// concurrent transactions. Absent scopes are omitted.
    pub fn readonly_snapshot<I, S>(&self, scopes: I) -> Result<Frozen, StoreError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.readonly_snapshot_with(scopes, &BTreeMap::new())
    }

    /// Like [`Store::readonly_snapshot`], falling back to `defaults` for
    /// scopes that exist neither in memory nor on disk.
    ///
    /// Before the first transaction this reads the snapshot file with
    /// blocking I/O. Async callers should `ensure_loaded` first.
    pub fn readonly_snapshot_with<I, S>(
        &self,
        scopes: I,
        defaults: &BTreeMap<String, Value>,
    ) -> Result<Frozen, StoreError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let loaded = self.is_loaded();
        let on_disk = if loaded {
            None
        } else {
            Some(self.inner.backend.read_blocking()?)
        };

        let mut root = Map::new();
        for scope in scopes {
            let scope = scope.as_ref();
            let value = match &on_disk {
                None => self.inner.data.get(scope).map(|v| v.value().clone()),
                Some(snapshot) => snapshot.get(scope).cloned(),
            }
            .or_else(|| defaults.get(scope).cloned());
            if let Some(value) = value {
                root.insert(scope.to_string(), value);
            }
        }
        Ok(Frozen::new(ROOT_SCOPE, Value::Object(root)))
    }

    /// Replace the given scopes without reading their current values.
    pub async fn overwrite(&self, values: BTreeMap<String, Value>) -> Result<(), StoreError> {
        let scopes = values.keys().cloned().collect();
        let mut tx = Transaction::acquire(self.clone(), scopes, false).await?;
        for (scope, value) in values {
            tx.set(&scope, value)?;
        }
        tx.commit().await
    }

    /// Diagnostic copy of every scope currently in memory.
    pub fn dump(&self) -> Value {
        let sorted: BTreeMap<String, Value> = self
            .inner
            .data
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        Value::Object(sorted.into_iter().collect())
    }

    // -------------------------------------------------------------------------
    // Crate-internal plumbing used by transactions
    // -------------------------------------------------------------------------

    pub(crate) fn is_loaded(&self) -> bool {
        self.inner.loaded.load(Ordering::Acquire)
    }

    /// Load the durable snapshot into memory if this is the first access.
    pub(crate) async fn ensure_loaded(&self) -> Result<(), StoreError> {
        if self.inner.loaded.load(Ordering::Acquire) {
            return Ok(());
        }
        let _coord = self.inner.coordinator.lock().await;
        self.load_locked().await
    }

    /// Caller must hold the coordination lock.
    async fn load_locked(&self) -> Result<(), StoreError> {
        if self.inner.loaded.load(Ordering::Acquire) {
            return Ok(());
        }
        let snapshot = self.inner.backend.read().await?;
        let count = snapshot.len();
        for (scope, value) in snapshot {
            self.inner.data.insert(scope, value);
        }
        self.inner.loaded.store(true, Ordering::Release);
        info!(scopes = count, path = ?self.path(), "store loaded");
        Ok(())
    }

    /// Lock handles for `scopes`, in iteration order, creating missing ones.
    /// Loads the snapshot first if needed.
    async fn lock_handles<'a>(
        &self,
        scopes: impl Iterator<Item = &'a String>,
    ) -> Result<Vec<Arc<tokio::sync::Mutex<()>>>, StoreError> {
        let _coord = self.inner.coordinator.lock().await;
        self.load_locked().await?;
        Ok(scopes
            .map(|scope| {
                self.inner
                    .scope_locks
                    .entry(scope.clone())
                    .or_insert_with(|| {
                        debug!(scope = %scope, "creating scope lock");
                        Arc::new(tokio::sync::Mutex::new(()))
                    })
                    .clone()
            })
            .collect())
    }

    fn contains_committed(&self, scope: &str) -> bool {
        self.inner.data.contains_key(scope)
    }

    fn committed(&self, scope: &str) -> Option<Value> {
        self.inner.data.get(scope).map(|v| v.value().clone())
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("path", &self.path())
            .field("loaded", &self.inner.loaded.load(Ordering::Relaxed))
            .field("scopes", &self.inner.data.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    async fn balance(store: &Store, user: &str) -> Option<i64> {
        let tx = store.begin(["players"]).await.unwrap();
        let players = tx.get("players").unwrap();
        players[user]["balance"].as_i64()
    }

    #[tokio::test]
    async fn test_players_balance_scenario() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path().join("db.msgpack"));

        let mut tx = store
            .transaction(["players"])
            .default("players", json!({}))
            .begin()
            .await
            .unwrap();
        tx.object_mut("players")
            .unwrap()
            .insert("u1".into(), json!({"balance": 10}));
        tx.commit().await.unwrap();

        assert_eq!(balance(&store, "u1").await, Some(10));

        // A transaction that does not hold "players" can read but not write.
        let mut other = store.begin(["bank"]).await.unwrap();
        let players = other.get("players").unwrap();
        assert_eq!(players["u1"]["balance"], json!(10));
        let err = other.get_mut("players").unwrap_err();
        assert!(err.is_scope_violation());
        let err = other.set("players", json!({})).unwrap_err();
        assert!(matches!(err, StoreError::ScopeFrozen { ref scope } if scope == "players"));
    }

    #[tokio::test]
    async fn test_committed_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.msgpack");

        {
            let store = Store::new(&path);
            let mut tx = store.begin(["players"]).await.unwrap();
            tx.set("players", json!({"u1": {"balance": 3}})).unwrap();
            tx.commit().await.unwrap();
        }

        let reopened = Store::new(&path);
        assert_eq!(balance(&reopened, "u1").await, Some(3));
    }

    #[tokio::test]
    async fn test_failed_body_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.msgpack");
        let store = Store::new(&path);

        let mut tx = store.begin(["players"]).await.unwrap();
        tx.set("players", json!({"u1": {"balance": 10}})).unwrap();
        tx.commit().await.unwrap();

        async fn failing_body(store: &Store) -> anyhow::Result<()> {
            let mut tx = store.begin(["players"]).await?;
            tx.get_mut("players")?["u1"]["balance"] = json!(999);
            anyhow::bail!("handler blew up");
        }

        let err = failing_body(&store).await.unwrap_err();
        assert_eq!(err.to_string(), "handler blew up");

        // Memory and disk both unchanged.
        assert_eq!(balance(&store, "u1").await, Some(10));
        let reopened = Store::new(&path);
        assert_eq!(balance(&reopened, "u1").await, Some(10));
    }

    #[tokio::test]
    async fn test_explicit_abort_discards_and_keeps_transaction_usable() {
        let store = Store::in_memory();
        let mut tx = store.begin(["counter"]).await.unwrap();
        tx.set("counter", json!({"n": 1})).unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin(["counter"]).await.unwrap();
        tx.set("counter", json!({"n": 2})).unwrap();
        assert!(tx.is_dirty());
        tx.abort().await.unwrap();
        assert!(!tx.is_dirty());
        assert_eq!(tx.get("counter").unwrap()["n"], json!(1));
        tx.commit().await.unwrap();

        let tx = store.begin(["counter"]).await.unwrap();
        assert_eq!(tx.get("counter").unwrap()["n"], json!(1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_increments_do_not_lose_updates() {
        let store = Store::in_memory();
        let mut tx = store.begin(["counter"]).await.unwrap();
        tx.set("counter", json!({"n": 0})).unwrap();
        tx.commit().await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..20 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let mut tx = store.begin(["counter"]).await.unwrap();
                let n = tx.get("counter").unwrap()["n"].as_i64().unwrap();
                tokio::task::yield_now().await;
                tx.get_mut("counter").unwrap()["n"] = json!(n + 1);
                tx.commit().await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let tx = store.begin(["counter"]).await.unwrap();
        assert_eq!(tx.get("counter").unwrap()["n"], json!(20));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_opposite_scope_orders_do_not_deadlock() {
        let store = Store::in_memory();

        let mut handles = Vec::new();
        for i in 0..50 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let scopes = if i % 2 == 0 { ["a", "b"] } else { ["b", "a"] };
                let mut tx = store.begin(scopes).await.unwrap();
                tokio::task::yield_now().await;
                tx.object_mut("a").unwrap().insert(i.to_string(), json!(i));
                tx.object_mut("b").unwrap().insert(i.to_string(), json!(i));
                tx.commit().await.unwrap();
            }));
        }

        tokio::time::timeout(Duration::from_secs(10), async {
            for handle in handles {
                handle.await.unwrap();
            }
        })
        .await
        .expect("transactions deadlocked");

        let tx = store.begin(["a", "b"]).await.unwrap();
        assert_eq!(tx.get("a").unwrap().as_object().unwrap().len(), 50);
        assert_eq!(tx.get("b").unwrap().as_object().unwrap().len(), 50);
    }

    #[tokio::test]
    async fn test_disjoint_scopes_proceed_concurrently() {
        let store = Store::in_memory();
        let _held = store.begin(["a"]).await.unwrap();

        let other = tokio::time::timeout(Duration::from_secs(1), store.begin(["b"])).await;
        assert!(other.is_ok(), "transaction on a disjoint scope was blocked");
    }

    #[tokio::test]
    async fn test_same_scope_waits_for_holder() {
        let store = Store::in_memory();
        let held = store.begin(["a"]).await.unwrap();

        let blocked = tokio::time::timeout(Duration::from_millis(50), store.begin(["a"])).await;
        assert!(blocked.is_err());

        drop(held);
        let acquired = tokio::time::timeout(Duration::from_secs(1), store.begin(["a"])).await;
        assert!(acquired.is_ok());
    }

    #[tokio::test]
    async fn test_defaults_never_overwrite_existing_scope() {
        let store = Store::in_memory();

        let mut tx = store
            .transaction(["players"])
            .default("players", json!({}))
            .begin()
            .await
            .unwrap();
        tx.object_mut("players")
            .unwrap()
            .insert("u1".into(), json!({"balance": 5}));
        tx.commit().await.unwrap();

        let tx = store
            .transaction(["players"])
            .default("players", json!({}))
            .begin()
            .await
            .unwrap();
        assert_eq!(tx.get("players").unwrap()["u1"]["balance"], json!(5));
    }

    #[tokio::test]
    async fn test_defaults_for_undeclared_scopes_are_seeded_read_only() {
        let store = Store::in_memory();

        let mut tx = store
            .transaction(["bank"])
            .default("rates", json!({"interest": 2}))
            .begin()
            .await
            .unwrap();
        assert_eq!(tx.get("rates").unwrap()["interest"], json!(2));
        assert!(tx.set("rates", json!({})).unwrap_err().is_scope_violation());
        assert_eq!(*tx.get("bank").unwrap(), json!({}));
    }

    #[tokio::test]
    async fn test_missing_scope_read_is_not_found() {
        let store = Store::in_memory();
        let tx = store.begin(["a"]).await.unwrap();
        assert!(matches!(
            tx.get("nope"),
            Err(StoreError::ScopeNotFound { ref scope }) if scope == "nope"
        ));
    }

    #[tokio::test]
    async fn test_commit_only_persists_own_scopes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.msgpack");
        let store = Store::new(&path);

        let mut pending = store.begin(["a"]).await.unwrap();
        pending.set("a", json!({"uncommitted": true})).unwrap();

        let mut tx = store.begin(["b"]).await.unwrap();
        tx.set("b", json!({"committed": true})).unwrap();
        tx.commit().await.unwrap();

        let on_disk = Store::new(&path).readonly_snapshot(["a", "b"]).unwrap();
        assert_eq!(on_disk["a"], json!({}));
        assert_eq!(on_disk["b"], json!({"committed": true}));
        drop(pending);
    }

    #[tokio::test]
    async fn test_delete_scope_hits_disk_immediately_and_releases_lock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.msgpack");
        let store = Store::new(&path);

        let mut tx = store.begin(["game"]).await.unwrap();
        tx.set("game", json!({"user": "u1"})).unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin(["game"]).await.unwrap();
        tx.delete_scope("game").await.unwrap();
        assert!(matches!(
            tx.get("game"),
            Err(StoreError::ScopeDeleted { .. })
        ));
        assert!(matches!(
            tx.set("game", json!({})),
            Err(StoreError::ScopeDeleted { .. })
        ));
        // Already gone from disk before the transaction ends.
        let on_disk = Store::new(&path).readonly_snapshot(["game"]).unwrap();
        assert!(on_disk.get("game").is_none());

        tx.commit().await.unwrap();
        let next = tokio::time::timeout(Duration::from_secs(1), store.begin(["game"])).await;
        assert!(next.is_ok(), "deleted scope lock was not released");
    }

    #[tokio::test]
    async fn test_readonly_snapshot_before_and_after_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.msgpack");
        {
            let store = Store::new(&path);
            let mut tx = store.begin(["tasks"]).await.unwrap();
            tx.set("tasks", json!({"key": "k", "tasks": {}})).unwrap();
            tx.commit().await.unwrap();
        }

        let store = Store::new(&path);
        let mut defaults = BTreeMap::new();
        defaults.insert("polls".to_string(), json!({}));

        // Not loaded yet: read from disk, then defaults.
        let view = store
            .readonly_snapshot_with(["tasks", "polls", "missing"], &defaults)
            .unwrap();
        assert_eq!(view.scope(), ROOT_SCOPE);
        assert_eq!(view["tasks"]["key"], json!("k"));
        assert_eq!(view["polls"], json!({}));
        assert!(view.get("missing").is_none());

        // Loaded: read from memory.
        let mut tx = store.begin(["tasks"]).await.unwrap();
        tx.get_mut("tasks").unwrap()["key"] = json!("k2");
        tx.commit().await.unwrap();
        let view = store.readonly_snapshot(["tasks"]).unwrap();
        assert_eq!(view["tasks"]["key"], json!("k2"));
    }

    #[tokio::test]
    async fn test_volatile_commit_stays_in_memory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.msgpack");
        let store = Store::new(&path);

        let mut tx = store.transaction(["session"]).volatile().begin().await.unwrap();
        tx.set("session", json!({"live": true})).unwrap();
        tx.commit().await.unwrap();

        assert_eq!(
            store.readonly_snapshot(["session"]).unwrap()["session"],
            json!({"live": true})
        );
        let on_disk = Store::new(&path).readonly_snapshot(["session"]).unwrap();
        assert!(on_disk.get("session").is_none());
    }

    #[tokio::test]
    async fn test_overwrite_and_dump() {
        let store = Store::in_memory();
        let mut values = BTreeMap::new();
        values.insert("a".to_string(), json!(1));
        values.insert("b".to_string(), json!([1, 2]));
        store.overwrite(values).await.unwrap();

        assert_eq!(store.dump(), json!({"a": 1, "b": [1, 2]}));
    }
}

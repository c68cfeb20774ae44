//! Scoped transactions.

use std::collections::{BTreeMap, BTreeSet};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, trace, warn};

use super::{Frozen, Store, StoreError};

/// Builder returned by [`Store::transaction`].
#[must_use = "call .begin() to open the transaction"]
pub struct TransactionBuilder {
    store: Store,
    scopes: BTreeSet<String>,
    defaults: BTreeMap<String, Value>,
    volatile: bool,
}

impl TransactionBuilder {
    pub(super) fn new<I, S>(store: Store, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            store,
            scopes: scopes.into_iter().map(Into::into).collect(),
            defaults: BTreeMap::new(),
            volatile: false,
        }
    }

    /// Initial value for `scope` if it does not exist yet.
    ///
    /// Every writable scope already defaults to an empty map. Defaults may
    /// also name scopes that are not writable in this transaction; they are
    /// seeded first, in a short transaction of their own.
    pub fn default(mut self, scope: impl Into<String>, value: Value) -> Self {
        self.defaults.insert(scope.into(), value);
        self
    }

    /// Commit to memory only. The snapshot file is left untouched.
    pub fn volatile(mut self) -> Self {
        self.volatile = true;
        self
    }

    /// Seed defaults, then acquire every scope lock in lexicographic order.
    pub async fn begin(self) -> Result<Transaction, StoreError> {
        let TransactionBuilder {
            store,
            scopes,
            mut defaults,
            volatile,
        } = self;

        for scope in &scopes {
            defaults
                .entry(scope.clone())
                .or_insert_with(|| Value::Object(Map::new()));
        }
        seed_defaults(&store, defaults, volatile).await?;

        Transaction::acquire(store, scopes, volatile).await
    }
}

async fn seed_defaults(
    store: &Store,
    defaults: BTreeMap<String, Value>,
    volatile: bool,
) -> Result<(), StoreError> {
    if defaults.is_empty() {
        return Ok(());
    }
    store.ensure_loaded().await?;
    if defaults.keys().all(|scope| store.contains_committed(scope)) {
        return Ok(());
    }

    let scopes = defaults.keys().cloned().collect();
    let mut seed = Transaction::acquire(store.clone(), scopes, volatile).await?;
    for (scope, value) in defaults {
        if !seed.contains(&scope) {
            debug!(scope = %scope, "seeding scope default");
            seed.set(&scope, value)?;
        }
    }
    seed.commit().await
}

/// Exclusive access to a set of scopes.
///
/// Writes go to a private working copy of the held scopes. [`commit`]
/// publishes them to memory and (unless volatile) to the snapshot file.
/// Dropping the transaction without committing discards every change and
/// releases the locks in reverse acquisition order.
///
/// [`commit`]: Transaction::commit
pub struct Transaction {
    store: Store,
    scopes: BTreeSet<String>,
    deleted: BTreeSet<String>,
    working: BTreeMap<String, Value>,
    guards: Vec<OwnedMutexGuard<()>>,
    dirty: bool,
    volatile: bool,
    finished: bool,
}

impl Transaction {
    pub(super) async fn acquire(
        store: Store,
        scopes: BTreeSet<String>,
        volatile: bool,
    ) -> Result<Self, StoreError> {
        let handles = store.lock_handles(scopes.iter()).await?;

        let mut guards = Vec::with_capacity(handles.len());
        for (scope, handle) in scopes.iter().zip(handles) {
            guards.push(handle.lock_owned().await);
            trace!(scope = %scope, "scope lock acquired");
        }

        let working = scopes
            .iter()
            .filter_map(|scope| store.committed(scope).map(|v| (scope.clone(), v)))
            .collect();

        Ok(Self {
            store,
            scopes,
            deleted: BTreeSet::new(),
            working,
            guards,
            dirty: false,
            volatile,
            finished: false,
        })
    }

    /// Scopes this transaction may write, in lock order.
    pub fn scopes(&self) -> impl Iterator<Item = &str> {
        self.scopes.iter().map(String::as_str)
    }

    /// Whether any held scope has uncommitted changes.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Whether `scope` currently has a value, as seen by this transaction.
    pub fn contains(&self, scope: &str) -> bool {
        if self.deleted.contains(scope) {
            return false;
        }
        if self.scopes.contains(scope) {
            self.working.contains_key(scope)
        } else {
            self.store.contains_committed(scope)
        }
    }

    /// Read any scope. Held scopes reflect this transaction's own writes.
    pub fn get(&self, scope: &str) -> Result<Frozen, StoreError> {
        if self.deleted.contains(scope) {
            return Err(StoreError::ScopeDeleted {
                scope: scope.to_string(),
            });
        }
        let value = if self.scopes.contains(scope) {
            self.working.get(scope).cloned()
        } else {
            self.store.committed(scope)
        };
        value
            .map(|v| Frozen::new(scope, v))
            .ok_or_else(|| StoreError::ScopeNotFound {
                scope: scope.to_string(),
            })
    }

    /// Deserialize a scope into an owned type.
    pub fn decode<T: DeserializeOwned>(&self, scope: &str) -> Result<T, StoreError> {
        self.get(scope)?.decode()
    }

    /// Mutable access to a held scope.
    pub fn get_mut(&mut self, scope: &str) -> Result<&mut Value, StoreError> {
        self.check_writable(scope)?;
        if !self.working.contains_key(scope) {
            return Err(StoreError::ScopeNotFound {
                scope: scope.to_string(),
            });
        }
        self.dirty = true;
        self.working
            .get_mut(scope)
            .ok_or_else(|| StoreError::ScopeNotFound {
                scope: scope.to_string(),
            })
    }

    /// Mutable access to a held scope that must be a map.
    pub fn object_mut(&mut self, scope: &str) -> Result<&mut Map<String, Value>, StoreError> {
        let value = self.get_mut(scope)?;
        value.as_object_mut().ok_or_else(|| StoreError::Schema {
            scope: scope.to_string(),
            message: "expected a map".to_string(),
        })
    }

    /// Replace a held scope.
    pub fn set(&mut self, scope: &str, value: impl Into<Value>) -> Result<(), StoreError> {
        self.check_writable(scope)?;
        self.working.insert(scope.to_string(), value.into());
        self.dirty = true;
        Ok(())
    }

    /// Serialize `value` into a held scope.
    pub fn encode<T: Serialize + ?Sized>(&mut self, scope: &str, value: &T) -> Result<(), StoreError> {
        let value = serde_json::to_value(value).map_err(|e| StoreError::Schema {
            scope: scope.to_string(),
            message: e.to_string(),
        })?;
        self.set(scope, value)
    }

    /// Remove a held scope from memory and from the snapshot file.
    ///
    /// Takes effect immediately, not at commit. The scope's lock stays held
    /// until the transaction ends, and the scope cannot be read or written
    /// again in this transaction.
    pub async fn delete_scope(&mut self, scope: &str) -> Result<(), StoreError> {
        self.check_writable(scope)?;
        if !self.working.contains_key(scope) {
            return Err(StoreError::ScopeNotFound {
                scope: scope.to_string(),
            });
        }

        let inner = &self.store.inner;
        let _coord = inner.coordinator.lock().await;
        if !self.volatile {
            let mut durable = inner.backend.read().await?;
            if durable.remove(scope).is_some() {
                inner.backend.write(&durable).await?;
            }
        }
        inner.data.remove(scope);
        self.working.remove(scope);
        self.deleted.insert(scope.to_string());
        debug!(scope = %scope, "scope deleted");
        Ok(())
    }

    /// Publish changes to the held scopes and release the locks.
    ///
    /// The snapshot file is written before memory is updated, so a failed
    /// write leaves both untouched.
    pub async fn commit(mut self) -> Result<(), StoreError> {
        if self.dirty {
            let inner = &self.store.inner;
            let _coord = inner.coordinator.lock().await;

            let live = self.scopes.difference(&self.deleted);
            if !self.volatile {
                let mut durable = inner.backend.read().await?;
                for scope in live.clone() {
                    match self.working.get(scope) {
                        Some(value) => durable.insert(scope.clone(), value.clone()),
                        None => durable.remove(scope),
                    };
                }
                inner.backend.write(&durable).await?;
            }
            for scope in live {
                match self.working.get(scope) {
                    Some(value) => {
                        inner.data.insert(scope.clone(), value.clone());
                    }
                    None => {
                        inner.data.remove(scope);
                    }
                }
            }
            debug!(scopes = ?self.scopes, volatile = self.volatile, "transaction committed");
        }

        self.dirty = false;
        self.finished = true;
        self.release();
        Ok(())
    }

    /// Discard uncommitted changes to the held scopes.
    ///
    /// The working copy is reloaded from the snapshot file (or from memory
    /// for volatile transactions), and memory is brought back in line with
    /// it. The transaction stays open.
    pub async fn abort(&mut self) -> Result<(), StoreError> {
        let inner = &self.store.inner;
        let _coord = inner.coordinator.lock().await;

        let live: Vec<String> = self.scopes.difference(&self.deleted).cloned().collect();
        if self.volatile {
            for scope in live {
                match inner.data.get(&scope).map(|v| v.value().clone()) {
                    Some(value) => self.working.insert(scope, value),
                    None => self.working.remove(&scope),
                };
            }
        } else {
            let durable = inner.backend.read().await?;
            for scope in live {
                match durable.get(&scope) {
                    Some(value) => {
                        inner.data.insert(scope.clone(), value.clone());
                        self.working.insert(scope, value.clone());
                    }
                    None => {
                        inner.data.remove(&scope);
                        self.working.remove(&scope);
                    }
                }
            }
        }

        self.dirty = false;
        warn!(scopes = ?self.scopes, "transaction aborted, changes discarded");
        Ok(())
    }

    fn check_writable(&self, scope: &str) -> Result<(), StoreError> {
        if self.deleted.contains(scope) {
            Err(StoreError::ScopeDeleted {
                scope: scope.to_string(),
            })
        } else if self.scopes.contains(scope) {
            Ok(())
        } else {
            Err(StoreError::ScopeFrozen {
                scope: scope.to_string(),
            })
        }
    }

    fn release(&mut self) {
        while let Some(guard) = self.guards.pop() {
            drop(guard);
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.finished && self.dirty {
            warn!(scopes = ?self.scopes, "transaction dropped without commit, changes discarded");
        }
        self.release();
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("scopes", &self.scopes)
            .field("deleted", &self.deleted)
            .field("dirty", &self.dirty)
            .field("volatile", &self.volatile)
            .finish()
    }
}

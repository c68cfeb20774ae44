//! Read-only views over scope values.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;

use super::StoreError;

/// A deep, read-only view of (part of) a scope.
///
/// `Frozen` dereferences to [`serde_json::Value`] so it can be inspected with
/// the usual accessors (`frozen["u1"]["balance"].as_i64()`), but it offers no
/// way to mutate the underlying data and it does not convert back into a
/// storable `Value`. Putting frozen data back into the store requires an
/// explicit deep copy with [`Frozen::thaw`].
///
/// Frozen views are snapshots: they are not updated when the scope changes.
#[derive(Clone, PartialEq)]
pub struct Frozen {
    scope: Arc<str>,
    value: Value,
}

impl Frozen {
    pub(crate) fn new(scope: impl Into<Arc<str>>, value: Value) -> Self {
        Self {
            scope: scope.into(),
            value,
        }
    }

    /// Name of the scope this view was read from (`"root"` for snapshots
    /// spanning several scopes).
    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Read-only view of a map member.
    pub fn get(&self, key: &str) -> Option<Frozen> {
        self.value.get(key).map(|v| Frozen {
            scope: self.scope.clone(),
            value: v.clone(),
        })
    }

    /// Read-only view of a sequence element.
    pub fn at(&self, index: usize) -> Option<Frozen> {
        self.value.get(index).map(|v| Frozen {
            scope: self.scope.clone(),
            value: v.clone(),
        })
    }

    /// Deserialize the viewed value into an owned type.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, StoreError> {
        serde_json::from_value(self.value.clone()).map_err(|e| StoreError::Schema {
            scope: self.scope.to_string(),
            message: e.to_string(),
        })
    }

    /// Deep copy of the viewed value, detached from the store.
    pub fn thaw(&self) -> Value {
        self.value.clone()
    }
}

impl Deref for Frozen {
    type Target = Value;

    fn deref(&self) -> &Value {
        &self.value
    }
}

impl fmt::Debug for Frozen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frozen")
            .field("scope", &self.scope)
            .field("value", &self.value)
            .finish()
    }
}

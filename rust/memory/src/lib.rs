//! Process-wide namespaced key/value store shared between the proctor
//! engine, its `memory` provider, and any embedding front-end.
//!
//! Values are [`serde_json::Value`] to support heterogeneous data.
//! Namespaces partition keys so that unrelated workflows (or nested
//! workflow runs) can share one store without collisions.

use std::fmt;
use std::sync::RwLock;

use indexmap::IndexMap;
use serde_json::Value;

/// The namespace used when an operation does not name one.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Errors raised by store mutations.
///
/// Reads never fail: a missing key or namespace resolves to `None` or
/// an empty collection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MemoryError {
    /// `increment` was applied to a key holding a non-numeric value.
    #[error("key `{key}` in namespace `{namespace}` holds a non-numeric value")]
    NotANumber { namespace: String, key: String },

    /// `append` was applied to a key holding a non-array value.
    #[error("key `{key}` in namespace `{namespace}` holds a non-array value")]
    NotAnArray { namespace: String, key: String },
}

/// A thread-safe namespaced key/value store.
///
/// Reads (`get`, `has`, `list`, `get_all`) may run concurrently;
/// mutations are serialized by the interior [`RwLock`]. Poisoned locks
/// are recovered so that a panic in one caller does not block others.
pub struct MemoryStore {
    namespaces: RwLock<IndexMap<String, IndexMap<String, Value>>>,
}

impl fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let namespaces = self
            .namespaces
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        f.debug_struct("MemoryStore")
            .field("namespaces", &namespaces.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            namespaces: RwLock::new(IndexMap::new()),
        }
    }

    fn ns(namespace: Option<&str>) -> &str {
        namespace.unwrap_or(DEFAULT_NAMESPACE)
    }

    /// Get a clone of the value for a key, or `None` if not present.
    #[must_use]
    pub fn get(&self, key: &str, namespace: Option<&str>) -> Option<Value> {
        let namespaces = self
            .namespaces
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        namespaces
            .get(Self::ns(namespace))
            .and_then(|ns| ns.get(key))
            .cloned()
    }

    /// Whether a key is present in the namespace.
    #[must_use]
    pub fn has(&self, key: &str, namespace: Option<&str>) -> bool {
        let namespaces = self
            .namespaces
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        namespaces
            .get(Self::ns(namespace))
            .is_some_and(|ns| ns.contains_key(key))
    }

    /// List all keys in the namespace, in insertion order.
    #[must_use]
    pub fn list(&self, namespace: Option<&str>) -> Vec<String> {
        let namespaces = self
            .namespaces
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        namespaces
            .get(Self::ns(namespace))
            .map(|ns| ns.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Return a snapshot of all key-value pairs in the namespace.
    ///
    /// The returned map is independent; subsequent mutations to the
    /// store do not affect it.
    #[must_use]
    pub fn get_all(&self, namespace: Option<&str>) -> IndexMap<String, Value> {
        let namespaces = self
            .namespaces
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        namespaces
            .get(Self::ns(namespace))
            .cloned()
            .unwrap_or_default()
    }

    /// Set a value, replacing any previous value for this key.
    pub fn set(&self, key: impl Into<String>, value: Value, namespace: Option<&str>) {
        let mut namespaces = self
            .namespaces
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        namespaces
            .entry(Self::ns(namespace).to_string())
            .or_default()
            .insert(key.into(), value);
    }

    /// Append a value to the array stored at `key`.
    ///
    /// A missing key is initialized to an empty array first.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::NotAnArray`] if the key holds a
    /// non-array value.
    pub fn append(
        &self,
        key: &str,
        value: Value,
        namespace: Option<&str>,
    ) -> Result<(), MemoryError> {
        let mut namespaces = self
            .namespaces
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let ns = namespaces.entry(Self::ns(namespace).to_string()).or_default();
        let entry = ns.entry(key.to_string()).or_insert_with(|| Value::Array(Vec::new()));
        match entry {
            Value::Array(items) => {
                items.push(value);
                Ok(())
            }
            _ => Err(MemoryError::NotAnArray {
                namespace: Self::ns(namespace).to_string(),
                key: key.to_string(),
            }),
        }
    }

    /// Add `delta` to the number stored at `key` and return the new value.
    ///
    /// A missing key is initialized to `0` first. `delta` defaults to `1`.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::NotANumber`] if the key holds a
    /// non-numeric value.
    pub fn increment(
        &self,
        key: &str,
        delta: Option<i64>,
        namespace: Option<&str>,
    ) -> Result<i64, MemoryError> {
        let mut namespaces = self
            .namespaces
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let ns = namespaces.entry(Self::ns(namespace).to_string()).or_default();
        let entry = ns
            .entry(key.to_string())
            .or_insert_with(|| Value::Number(0.into()));
        let current = entry.as_i64().ok_or_else(|| MemoryError::NotANumber {
            namespace: Self::ns(namespace).to_string(),
            key: key.to_string(),
        })?;
        let next = current.saturating_add(delta.unwrap_or(1));
        *entry = Value::Number(next.into());
        Ok(next)
    }

    /// Remove a key. Returns `true` if the key was present.
    pub fn delete(&self, key: &str, namespace: Option<&str>) -> bool {
        let mut namespaces = self
            .namespaces
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        namespaces
            .get_mut(Self::ns(namespace))
            .is_some_and(|ns| ns.shift_remove(key).is_some())
    }

    /// Remove a whole namespace, or every namespace when `None`.
    pub fn clear(&self, namespace: Option<&str>) {
        let mut namespaces = self
            .namespaces
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match namespace {
            Some(ns) => {
                namespaces.shift_remove(ns);
            }
            None => namespaces.clear(),
        }
    }
}

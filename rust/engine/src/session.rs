//! AI session registry.
//!
//! Sessions are provider-opaque conversational handles kept under
//! string ids so that later checks can continue an earlier check's
//! conversation. Two reuse modes exist: `clone` creates an independent
//! handle initialized from the parent conversation (diverging branches
//! cannot pollute shared history), `append` hands back the parent
//! handle itself (faster, weaker isolation).
//!
//! Handles never leak across runs: the registry is per-run and cleared
//! on completion.

use std::any::Any;
use std::fmt;
use std::sync::{Arc, RwLock};

use indexmap::IndexMap;

use crate::error::{EngineError, EngineResult};

/// A provider-opaque conversational handle.
///
/// Backends downcast through [`as_any`](SessionHandle::as_any) to
/// recover their concrete session type.
pub trait SessionHandle: Send + Sync + fmt::Debug {
    /// Create an independent handle initialized from this conversation.
    ///
    /// # Errors
    ///
    /// Backends that cannot fork a conversation return an error; the
    /// runtime surfaces it as a check-level session-reuse failure.
    fn clone_session(&self) -> EngineResult<Arc<dyn SessionHandle>>;

    /// Downcast support for backend-specific access.
    fn as_any(&self) -> &dyn Any;
}

/// Per-run registry of AI session handles.
///
/// Lookups may run concurrently; mutations are serialized by the
/// interior lock.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<IndexMap<String, Arc<dyn SessionHandle>>>,
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sessions = self
            .sessions
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        f.debug_struct("SessionRegistry")
            .field("ids", &sessions.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl SessionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handle under an id, replacing any previous handle.
    pub fn register(&self, id: impl Into<String>, handle: Arc<dyn SessionHandle>) {
        let mut sessions = self
            .sessions
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        sessions.insert(id.into(), handle);
    }

    /// Look up a handle by id.
    #[must_use]
    pub fn lookup(&self, id: &str) -> Option<Arc<dyn SessionHandle>> {
        let sessions = self
            .sessions
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        sessions.get(id).cloned()
    }

    /// Clone the parent's conversation into a new handle registered
    /// under `child_id`, and return it.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::SessionReuse`] when the parent is missing
    /// or the backend rejects the clone.
    pub fn clone_into(
        &self,
        parent_id: &str,
        child_id: &str,
    ) -> EngineResult<Arc<dyn SessionHandle>> {
        let parent = self.lookup(parent_id).ok_or_else(|| EngineError::SessionReuse {
            check_id: child_id.to_string(),
            reason: format!("parent session `{parent_id}` not found"),
        })?;
        let child = parent
            .clone_session()
            .map_err(|error| EngineError::SessionReuse {
                check_id: child_id.to_string(),
                reason: format!("clone of `{parent_id}` rejected: {error}"),
            })?;
        self.register(child_id, Arc::clone(&child));
        Ok(child)
    }

    /// Return the parent handle itself for in-place reuse.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::SessionReuse`] when the parent is missing.
    pub fn append(&self, parent_id: &str, child_id: &str) -> EngineResult<Arc<dyn SessionHandle>> {
        self.lookup(parent_id).ok_or_else(|| EngineError::SessionReuse {
            check_id: child_id.to_string(),
            reason: format!("parent session `{parent_id}` not found"),
        })
    }

    /// Remove a handle; best-effort, missing ids are ignored.
    pub fn remove(&self, id: &str) {
        let mut sessions = self
            .sessions
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        sessions.shift_remove(id);
    }

    /// Drop every handle; called on run completion.
    pub fn clear(&self) {
        let mut sessions = self
            .sessions
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        sessions.clear();
    }

    /// Number of live handles.
    #[must_use]
    pub fn len(&self) -> usize {
        let sessions = self
            .sessions
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        sessions.len()
    }

    /// Whether the registry holds no handles.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

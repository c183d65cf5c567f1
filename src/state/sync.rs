//! Synchronized access to the shared state during a graph walk.

use std::sync::Arc;

use tokio::sync::RwLock;

use super::types::State;

/// A synchronized wrapper around [`State`] shared by concurrent node
/// visits.
///
/// Access is closure-scoped: the lock is held only for the duration of
/// the closure, and the closure is synchronous, so a provider call can
/// never happen while the lock is held. Direct references to the inner
/// state never escape this type.
#[derive(Debug, Clone)]
pub struct SyncState {
    inner: Arc<RwLock<State>>,
}

impl SyncState {
    /// Wraps a state for shared access.
    #[must_use]
    pub fn new(state: State) -> Self {
        Self {
            inner: Arc::new(RwLock::new(state)),
        }
    }

    /// Runs a closure with shared read access.
    pub async fn read<R>(&self, f: impl FnOnce(&State) -> R) -> R {
        let guard = self.inner.read().await;
        f(&guard)
    }

    /// Runs a closure with exclusive write access.
    pub async fn write<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        let mut guard = self.inner.write().await;
        f(&mut guard)
    }

    /// Returns a point-in-time copy of the state.
    pub async fn snapshot(&self) -> State {
        self.inner.read().await.clone()
    }

    /// Consumes the wrapper, returning the state. Falls back to a clone
    /// if other handles still exist.
    #[must_use]
    pub fn into_state(self) -> State {
        match Arc::try_unwrap(self.inner) {
            Ok(lock) => lock.into_inner(),
            Err(arc) => arc.blocking_read().clone(),
        }
    }
}

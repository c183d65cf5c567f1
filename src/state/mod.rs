//! Recorded state of deployed resource instances.
//!
//! The [`State`] is the durable, caller-owned entity that crosses
//! invocation boundaries. During a graph walk it is only reached through
//! [`SyncState`], a synchronized accessor whose closure-scoped API makes
//! it impossible to hold the lock across a provider call.

mod lock;
mod sync;
mod types;

pub use lock::{generate_holder_id, LockInfo, StateLock, StateLockGuard, LOCK_EXPIRY_SECS};
pub use sync::SyncState;
pub use types::{DeposedKey, ObjectStatus, ResourceInstanceObject, State};

//! State locking for coordinating exclusive access across rounds.
//!
//! Only one plan or apply may mutate a given state at a time. The engine
//! acquires the lock at the start of a round and holds it until the round
//! returns; a second round attempted in that window fails with
//! [`StateError::LockedByOther`]. Records carry an expiry so a crashed
//! holder cannot wedge the state forever.

use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::error::StateError;

/// Lock expiry duration in seconds.
pub const LOCK_EXPIRY_SECS: i64 = 300; // 5 minutes

/// The record written while a round holds the lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    /// Unique lock identifier.
    pub lock_id: String,
    /// Who holds the lock.
    pub holder: String,
    /// Which operation the holder is running (plan, apply).
    pub operation: String,
    /// When the lock was acquired.
    pub acquired_at: DateTime<Utc>,
    /// When the lock expires.
    pub expires_at: DateTime<Utc>,
}

impl LockInfo {
    /// Creates a fresh record for the given holder and operation.
    #[must_use]
    pub fn new(holder: &str, operation: &str) -> Self {
        let now = Utc::now();
        Self {
            lock_id: Uuid::new_v4().to_string(),
            holder: holder.to_string(),
            operation: operation.to_string(),
            acquired_at: now,
            expires_at: now + chrono::Duration::seconds(LOCK_EXPIRY_SECS),
        }
    }

    /// Checks if the lock has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }
}

/// The lock itself. One slot; empty means unlocked.
#[derive(Debug, Default)]
pub struct StateLock {
    slot: Mutex<Option<LockInfo>>,
}

impl StateLock {
    /// An unlocked lock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the lock for the given holder, failing if another holder
    /// already has it. An expired record is replaced rather than
    /// honored. The returned guard releases the lock when dropped.
    pub fn acquire(
        &self,
        holder: &str,
        operation: &str,
    ) -> Result<StateLockGuard<'_>, StateError> {
        let mut slot = lock_slot(&self.slot);
        if let Some(held) = slot.as_ref() {
            if held.is_expired() {
                warn!(holder = %held.holder, "replacing expired state lock");
            } else {
                return Err(StateError::LockedByOther {
                    holder: held.holder.clone(),
                    since: held.acquired_at.to_rfc3339(),
                });
            }
        }
        let info = LockInfo::new(holder, operation);
        *slot = Some(info.clone());
        Ok(StateLockGuard { lock: self, info })
    }

    /// Adopts a lock record recovered from a persistence backend, as
    /// after a crash left the state locked on disk.
    pub fn restore(&self, info: LockInfo) {
        *lock_slot(&self.slot) = Some(info);
    }

    /// The record currently holding the lock, if any.
    #[must_use]
    pub fn current(&self) -> Option<LockInfo> {
        lock_slot(&self.slot).clone()
    }

    fn release(&self, lock_id: &str) -> Result<(), StateError> {
        let mut slot = lock_slot(&self.slot);
        match slot.as_ref() {
            Some(held) if held.lock_id == lock_id => {
                *slot = None;
                Ok(())
            }
            Some(held) => Err(StateError::LockFailed {
                message: format!("lock is now held by {} under a different id", held.holder),
            }),
            None => Err(StateError::LockFailed {
                message: String::from("the state is not locked"),
            }),
        }
    }
}

/// Holds the lock for the duration of a round; releasing is dropping.
#[derive(Debug)]
pub struct StateLockGuard<'a> {
    lock: &'a StateLock,
    info: LockInfo,
}

impl StateLockGuard<'_> {
    /// The record this guard wrote.
    #[must_use]
    pub const fn info(&self) -> &LockInfo {
        &self.info
    }
}

impl Drop for StateLockGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.lock.release(&self.info.lock_id) {
            // Another holder stole an expired record out from under us.
            warn!(lock_id = %self.info.lock_id, %err, "state lock was not released cleanly");
        }
    }
}

fn lock_slot(slot: &Mutex<Option<LockInfo>>) -> MutexGuard<'_, Option<LockInfo>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Generates a unique holder identifier for the current process.
#[must_use]
pub fn generate_holder_id() -> String {
    let pid = std::process::id();
    let uuid = &Uuid::new_v4().to_string()[..8];
    format!("lattice-{pid}-{uuid}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_and_release() {
        let lock = StateLock::new();
        let guard = lock.acquire("holder-1", "plan").unwrap();
        assert_eq!(guard.info().holder, "holder-1");
        assert_eq!(guard.info().operation, "plan");
        assert!(lock.current().is_some());

        drop(guard);
        assert!(lock.current().is_none());

        // Released, so a second holder may take it.
        let guard = lock.acquire("holder-2", "apply").unwrap();
        assert_eq!(guard.info().holder, "holder-2");
    }

    #[test]
    fn test_second_acquire_fails_while_held() {
        let lock = StateLock::new();
        let _guard = lock.acquire("holder-1", "apply").unwrap();

        let err = lock.acquire("holder-2", "plan").unwrap_err();
        match err {
            StateError::LockedByOther { holder, .. } => assert_eq!(holder, "holder-1"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_expired_lock_is_replaced() {
        let lock = StateLock::new();
        let mut stale = LockInfo::new("crashed-holder", "apply");
        stale.expires_at = Utc::now() - chrono::Duration::seconds(1);
        lock.restore(stale);

        let guard = lock.acquire("holder-2", "plan").unwrap();
        assert_eq!(guard.info().holder, "holder-2");
    }

    #[test]
    fn test_holder_id_generation() {
        let id1 = generate_holder_id();
        let id2 = generate_holder_id();

        assert_ne!(id1, id2);

        let pid = std::process::id().to_string();
        assert!(id1.contains(&pid));
    }
}

//! Single-writer state locking.
//!
//! One reconciliation pass holds the lock from state load to state save.
//! Locks expire so that a crashed process cannot block the state forever.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, StateError};

/// Seconds before an unreleased lock may be taken over.
pub const LOCK_EXPIRY_SECS: i64 = 300;

/// How often a running pass pushes its expiry forward.
pub const LOCK_RENEW_SECS: u64 = 60;

/// The lock record written next to the state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockInfo {
    /// Token the holder presents to release the lock.
    pub lock_id: String,
    /// Host, pid and a random suffix of the holding process.
    pub holder: String,
    /// Acquisition time.
    pub acquired_at: DateTime<Utc>,
    /// Takeover time.
    pub expires_at: DateTime<Utc>,
}

impl LockInfo {
    /// Creates a lock for `holder`, expiring after [`LOCK_EXPIRY_SECS`].
    ///
    /// An empty holder is replaced by [`generate_holder_id`].
    #[must_use]
    pub fn new(holder: &str) -> Self {
        let acquired_at = Utc::now();
        Self {
            lock_id: Uuid::new_v4().to_string(),
            holder: if holder.is_empty() {
                generate_holder_id()
            } else {
                holder.to_owned()
            },
            acquired_at,
            expires_at: acquired_at + TimeDelta::seconds(LOCK_EXPIRY_SECS),
        }
    }

    /// Pushes the takeover time a full [`LOCK_EXPIRY_SECS`] past now.
    pub fn refresh(&mut self) {
        self.expires_at = Utc::now() + TimeDelta::seconds(LOCK_EXPIRY_SECS);
    }

    /// True once the takeover time has passed.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expires_at < Utc::now()
    }

    /// True if `lock_id` is the token of this lock.
    #[must_use]
    pub fn is_owned_by(&self, lock_id: &str) -> bool {
        self.lock_id == lock_id
    }

    /// Whole seconds left before takeover, never negative.
    #[must_use]
    pub fn remaining_secs(&self) -> i64 {
        (self.expires_at - Utc::now()).num_seconds().max(0)
    }
}

/// Returns `current` if `lock_id` owns it.
///
/// Someone else's lock is `StateError::LockedByOther`, no lock at all is
/// `StateError::LockFailed`. Expiry is not checked: an expired lock nobody
/// took over still belongs to its holder.
pub fn ensure_owned(current: Option<LockInfo>, lock_id: &str) -> Result<LockInfo> {
    match current {
        Some(lock) if lock.is_owned_by(lock_id) => Ok(lock),
        Some(other) => Err(StateError::LockedByOther {
            holder: other.holder,
            since: other.acquired_at.to_rfc3339(),
        }
        .into()),
        None => Err(StateError::LockFailed {
            message: format!("lock {lock_id} was released by someone else"),
        }
        .into()),
    }
}

/// `<hostname>-<pid>-<8 hex chars>` for the running process.
#[must_use]
pub fn generate_holder_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| String::from("unknown"));
    let suffix = Uuid::new_v4().simple().to_string();

    format!("{host}-{}-{}", std::process::id(), &suffix[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_lock_is_live() {
        let lock = LockInfo::new("ci-runner");
        assert_eq!(lock.holder, "ci-runner");
        assert!(!lock.is_expired());
        assert!(lock.remaining_secs() > LOCK_EXPIRY_SECS - 5);
        assert!(lock.is_owned_by(&lock.lock_id));
        assert!(!lock.is_owned_by("someone-else"));
    }

    #[test]
    fn test_empty_holder_is_generated() {
        let lock = LockInfo::new("");
        assert!(lock.holder.contains(&std::process::id().to_string()));
    }

    #[test]
    fn test_past_expiry() {
        let mut lock = LockInfo::new("ci-runner");
        lock.expires_at = Utc::now() - TimeDelta::seconds(1);
        assert!(lock.is_expired());
        assert_eq!(lock.remaining_secs(), 0);
    }

    #[test]
    fn test_refresh_revives_an_expired_lock() {
        let mut lock = LockInfo::new("ci-runner");
        let acquired_at = lock.acquired_at;
        lock.expires_at = Utc::now() - TimeDelta::seconds(1);

        lock.refresh();

        assert!(!lock.is_expired());
        assert!(lock.remaining_secs() > LOCK_EXPIRY_SECS - 5);
        assert_eq!(lock.acquired_at, acquired_at);
    }

    #[test]
    fn test_ownership_check() {
        let lock = LockInfo::new("owner");

        assert_eq!(ensure_owned(Some(lock.clone()), &lock.lock_id).ok(), Some(lock.clone()));
        assert!(matches!(
            ensure_owned(Some(lock), "stale-token"),
            Err(crate::error::InfraError::State(StateError::LockedByOther { ref holder, .. })) if holder == "owner"
        ));
        assert!(matches!(
            ensure_owned(None, "stale-token"),
            Err(crate::error::InfraError::State(StateError::LockFailed { .. }))
        ));
    }

    #[test]
    fn test_holder_ids_are_unique_per_call() {
        let first = generate_holder_id();
        let second = generate_holder_id();

        assert_ne!(first, second);
        assert_eq!(first.rsplit('-').next().map(str::len), Some(8));
    }
}

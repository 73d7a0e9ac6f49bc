//! Storage seam for the persisted snapshot and its lock.
//!
//! Backends own durability and atomicity; schema checks live in
//! [`StateSnapshot::from_json`].

use async_trait::async_trait;

use super::lock::LockInfo;
use super::types::StateSnapshot;
use crate::error::Result;

/// Where the snapshot and its single-writer lock live.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Reads the snapshot, `None` before the first save.
    ///
    /// A document that fails schema validation is
    /// `StateError::Corrupted` or `StateError::VersionMismatch`.
    async fn load(&self) -> Result<Option<StateSnapshot>>;

    /// Replaces the snapshot; readers see the old or the new one, never a mix.
    async fn save(&self, state: &StateSnapshot) -> Result<()>;

    /// Removes the snapshot and any lock.
    async fn delete(&self) -> Result<()>;

    /// True once a snapshot has been saved.
    async fn exists(&self) -> Result<bool>;

    /// Takes the lock for `holder`, or over an expired one.
    ///
    /// A live lock held by someone else is `StateError::LockedByOther`.
    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo>;

    /// Drops the lock if `lock_id` still owns it.
    async fn release_lock(&self, lock_id: &str) -> Result<()>;

    /// Extends the lock `lock_id` owns and returns the renewed record.
    ///
    /// A lock that was taken over is `StateError::LockedByOther`; a lock
    /// that is gone is `StateError::LockFailed`.
    async fn refresh_lock(&self, lock_id: &str) -> Result<LockInfo>;

    /// The current lock record, expired or not.
    async fn get_lock_info(&self) -> Result<Option<LockInfo>>;

    /// True while an unexpired lock exists.
    async fn is_locked(&self) -> Result<bool> {
        Ok(self.get_lock_info().await?.is_some_and(|lock| !lock.is_expired()))
    }

    /// Short backend name for logs (`local`, `s3`).
    fn backend_type(&self) -> &'static str;
}

#[async_trait]
impl<T: StateStore + ?Sized> StateStore for Box<T> {
    async fn load(&self) -> Result<Option<StateSnapshot>> {
        T::load(self).await
    }

    async fn save(&self, state: &StateSnapshot) -> Result<()> {
        T::save(self, state).await
    }

    async fn delete(&self) -> Result<()> {
        T::delete(self).await
    }

    async fn exists(&self) -> Result<bool> {
        T::exists(self).await
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        T::acquire_lock(self, holder).await
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        T::release_lock(self, lock_id).await
    }

    async fn refresh_lock(&self, lock_id: &str) -> Result<LockInfo> {
        T::refresh_lock(self, lock_id).await
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        T::get_lock_info(self).await
    }

    async fn is_locked(&self) -> Result<bool> {
        T::is_locked(self).await
    }

    fn backend_type(&self) -> &'static str {
        T::backend_type(self)
    }
}

//! A state store seen through a held lock.
//!
//! Every write first checks that the lock is still ours. A pass whose lock
//! expired and was taken over, or was released under it, cannot overwrite
//! the snapshot the new holder is working on.

use async_trait::async_trait;
use tracing::debug;

use crate::error::Result;

use super::lock::{LockInfo, ensure_owned};
use super::store::StateStore;
use super::types::StateSnapshot;

/// Writes to `inner` on behalf of the holder of `lock_id`.
pub struct LockedStore<'a, S: StateStore + ?Sized> {
    inner: &'a S,
    lock_id: String,
}

impl<'a, S: StateStore + ?Sized> LockedStore<'a, S> {
    /// Wraps `inner` for the holder of `lock`.
    #[must_use]
    pub fn new(inner: &'a S, lock: &LockInfo) -> Self {
        Self {
            inner,
            lock_id: lock.lock_id.clone(),
        }
    }

    /// Token of the lock this store writes under.
    #[must_use]
    pub fn lock_id(&self) -> &str {
        &self.lock_id
    }

    /// Pushes the lock's expiry forward.
    pub async fn renew(&self) -> Result<LockInfo> {
        self.inner.refresh_lock(&self.lock_id).await
    }

    async fn check_owner(&self) -> Result<()> {
        ensure_owned(self.inner.get_lock_info().await?, &self.lock_id).map(|_| ())
    }
}

#[async_trait]
impl<'a, S: StateStore + ?Sized> StateStore for LockedStore<'a, S> {
    async fn load(&self) -> Result<Option<StateSnapshot>> {
        self.inner.load().await
    }

    async fn save(&self, state: &StateSnapshot) -> Result<()> {
        self.check_owner().await?;
        debug!("Lock {} verified before saving serial {}", self.lock_id, state.serial);
        self.inner.save(state).await
    }

    async fn delete(&self) -> Result<()> {
        self.check_owner().await?;
        self.inner.delete().await
    }

    async fn exists(&self) -> Result<bool> {
        self.inner.exists().await
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        self.inner.acquire_lock(holder).await
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        self.inner.release_lock(lock_id).await
    }

    async fn refresh_lock(&self, lock_id: &str) -> Result<LockInfo> {
        self.inner.refresh_lock(lock_id).await
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        self.inner.get_lock_info().await
    }

    fn backend_type(&self) -> &'static str {
        self.inner.backend_type()
    }
}

//! State store trait definition.
//!
//! Common interface over the state storage backends. Lock acquisition
//! and state writes are the only mutating operations and both are
//! serialized by the backend.

use async_trait::async_trait;

use super::lock::LockInfo;
use super::types::AppliedState;
use crate::error::Result;

/// Trait for state storage backends.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Loads the applied state.
    ///
    /// Returns `None` if no state exists yet.
    async fn load(&self) -> Result<Option<AppliedState>>;

    /// Saves the applied state.
    async fn save(&self, state: &AppliedState) -> Result<()>;

    /// Deletes the applied state and any lock record.
    async fn delete(&self) -> Result<()>;

    /// Checks if state exists.
    async fn exists(&self) -> Result<bool>;

    /// Acquires the state lock for the given operation.
    ///
    /// Fails with a conflict error if another writer holds an
    /// unexpired lock.
    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo>;

    /// Releases the lock identified by `lock_id`.
    ///
    /// Releasing a lock that is no longer held is a no-op.
    async fn release_lock(&self, lock_id: &str) -> Result<()>;

    /// Gets current lock information if locked.
    async fn get_lock_info(&self) -> Result<Option<LockInfo>>;

    /// Checks if the state is locked by an unexpired lock.
    async fn is_locked(&self) -> Result<bool>;

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;
}

#[async_trait]
impl StateStore for Box<dyn StateStore> {
    async fn load(&self) -> Result<Option<AppliedState>> {
        (**self).load().await
    }

    async fn save(&self, state: &AppliedState) -> Result<()> {
        (**self).save(state).await
    }

    async fn delete(&self) -> Result<()> {
        (**self).delete().await
    }

    async fn exists(&self) -> Result<bool> {
        (**self).exists().await
    }

    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo> {
        (**self).acquire_lock(holder, operation).await
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        (**self).release_lock(lock_id).await
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        (**self).get_lock_info().await
    }

    async fn is_locked(&self) -> Result<bool> {
        (**self).is_locked().await
    }

    fn backend_type(&self) -> &'static str {
        (**self).backend_type()
    }
}

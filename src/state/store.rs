//! State store trait definition.
//!
//! This module defines the common interface for state storage backends.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::lock::Lock;
use super::types::{StateRecord, StateSnapshot};
use crate::error::Result;
use crate::model::ResourceAddress;

/// Full record set written by a commit.
pub type Records = BTreeMap<ResourceAddress, StateRecord>;

/// Trait for state storage backends.
///
/// Reads never wait on the lock. Writes are conditional on the serial the
/// caller last observed, so a stale writer can never overwrite newer state.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Reads the current snapshot.
    ///
    /// An absent state reads as an empty snapshot at serial 0.
    async fn read(&self) -> Result<StateSnapshot>;

    /// Acquires the exclusive lock, reclaiming a stale one.
    ///
    /// Fails immediately with `LockHeld` if a live lock exists.
    async fn acquire_lock(&self, holder: &str) -> Result<Lock>;

    /// Refreshes the heartbeat of a held lock.
    ///
    /// Fails with `LockNotHeld` if the lock was released or reclaimed.
    async fn heartbeat(&self, lock: &Lock) -> Result<Lock>;

    /// Writes `records` if the stored serial still equals `expected_serial`.
    ///
    /// Returns the new serial. On mismatch nothing is written and `Conflict`
    /// is returned.
    async fn commit(&self, records: &Records, expected_serial: u64) -> Result<u64>;

    /// Releases a held lock.
    ///
    /// Releasing a lock that is no longer held returns `LockNotHeld` and
    /// changes nothing.
    async fn release_lock(&self, lock: &Lock) -> Result<()>;

    /// Returns the current lock, live or stale.
    async fn lock_info(&self) -> Result<Option<Lock>>;

    /// Removes whatever lock exists. Operator escape hatch.
    async fn force_unlock(&self) -> Result<Option<Lock>>;

    /// Human-readable location of the state.
    fn location(&self) -> String;

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;
}

#[async_trait]
impl<T: StateStore + ?Sized> StateStore for Arc<T> {
    async fn read(&self) -> Result<StateSnapshot> {
        (**self).read().await
    }

    async fn acquire_lock(&self, holder: &str) -> Result<Lock> {
        (**self).acquire_lock(holder).await
    }

    async fn heartbeat(&self, lock: &Lock) -> Result<Lock> {
        (**self).heartbeat(lock).await
    }

    async fn commit(&self, records: &Records, expected_serial: u64) -> Result<u64> {
        (**self).commit(records, expected_serial).await
    }

    async fn release_lock(&self, lock: &Lock) -> Result<()> {
        (**self).release_lock(lock).await
    }

    async fn lock_info(&self) -> Result<Option<Lock>> {
        (**self).lock_info().await
    }

    async fn force_unlock(&self) -> Result<Option<Lock>> {
        (**self).force_unlock().await
    }

    fn location(&self) -> String {
        (**self).location()
    }

    fn backend_type(&self) -> &'static str {
        (**self).backend_type()
    }
}

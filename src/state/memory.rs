//! In-memory state backend.
//!
//! Handles created with [`MemoryStateStore::shared`] for the same path see the
//! same state, which lets tests exercise lock contention and serial
//! conflicts without touching the filesystem.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::error::{KeystoneError, Result, StateError};

use super::lock::{DEFAULT_LOCK_TIMEOUT_SECS, Lock, generate_holder_id};
use super::store::{Records, StateStore};
use super::types::{STATE_VERSION, StateSnapshot};

static REGISTRY: LazyLock<Mutex<HashMap<String, Arc<Mutex<Inner>>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

#[derive(Debug, Default)]
struct Inner {
    snapshot: Option<StateSnapshot>,
    lock: Option<Lock>,
    commits: u64,
}

/// Process-local state store.
#[derive(Debug, Clone)]
pub struct MemoryStateStore {
    path: String,
    inner: Arc<Mutex<Inner>>,
    lock_timeout_secs: u64,
}

impl Default for MemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStateStore {
    /// Creates a private store. Clones share its state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            path: String::from("memory"),
            inner: Arc::new(Mutex::new(Inner::default())),
            lock_timeout_secs: DEFAULT_LOCK_TIMEOUT_SECS,
        }
    }

    /// Returns a handle on the process-wide store registered under `path`.
    #[must_use]
    pub fn shared(path: &str) -> Self {
        let inner = match REGISTRY.lock() {
            Ok(mut registry) => Arc::clone(registry.entry(path.to_string()).or_default()),
            Err(poisoned) => Arc::clone(poisoned.into_inner().entry(path.to_string()).or_default()),
        };
        Self {
            path: path.to_string(),
            inner,
            lock_timeout_secs: DEFAULT_LOCK_TIMEOUT_SECS,
        }
    }

    /// Sets the stale-lock timeout.
    #[must_use]
    pub const fn with_lock_timeout(mut self, secs: u64) -> Self {
        self.lock_timeout_secs = secs;
        self
    }

    /// Number of successful commits since creation.
    ///
    /// # Errors
    ///
    /// Fails if the store mutex is poisoned.
    pub fn commit_count(&self) -> Result<u64> {
        Ok(self.inner()?.commits)
    }

    /// Replaces the current lock without any checks.
    ///
    /// # Errors
    ///
    /// Fails if the store mutex is poisoned.
    pub fn set_lock(&self, lock: Option<Lock>) -> Result<()> {
        self.inner()?.lock = lock;
        Ok(())
    }

    fn inner(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| KeystoneError::from(StateError::backend("memory store mutex poisoned")))
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn read(&self) -> Result<StateSnapshot> {
        Ok(self
            .inner()?
            .snapshot
            .clone()
            .unwrap_or_else(StateSnapshot::empty))
    }

    async fn acquire_lock(&self, holder: &str) -> Result<Lock> {
        let mut inner = self.inner()?;

        if let Some(existing) = &inner.lock {
            if !existing.is_stale(self.lock_timeout_secs) {
                return Err(StateError::LockHeld {
                    holder: existing.holder.clone(),
                    since: existing.acquired_at.to_rfc3339(),
                    lock_id: existing.lock_id.clone(),
                }
                .into());
            }
            info!(lock_id = %existing.lock_id, "Reclaimed stale state lock");
        }

        let holder_id = if holder.is_empty() {
            generate_holder_id()
        } else {
            holder.to_string()
        };
        let serial = inner.snapshot.as_ref().map_or(0, |s| s.serial);
        let lock = Lock::new(&holder_id, &self.path, serial);
        inner.lock = Some(lock.clone());
        debug!(lock_id = %lock.lock_id, "Acquired state lock");
        Ok(lock)
    }

    async fn heartbeat(&self, lock: &Lock) -> Result<Lock> {
        let mut inner = self.inner()?;
        let refreshed = inner
            .lock
            .as_ref()
            .filter(|current| current.lock_id == lock.lock_id)
            .map(Lock::refreshed)
            .ok_or_else(|| StateError::LockNotHeld {
                lock_id: lock.lock_id.clone(),
            })?;
        inner.lock = Some(refreshed.clone());
        Ok(refreshed)
    }

    async fn commit(&self, records: &Records, expected_serial: u64) -> Result<u64> {
        let mut inner = self.inner()?;
        let current = inner.snapshot.clone().unwrap_or_else(StateSnapshot::empty);

        if current.serial != expected_serial {
            warn!(
                expected = expected_serial,
                found = current.serial,
                "Rejected commit with stale serial"
            );
            return Err(StateError::Conflict {
                expected: expected_serial,
                found: current.serial,
            }
            .into());
        }

        let serial = current.serial + 1;
        inner.snapshot = Some(StateSnapshot {
            version: STATE_VERSION.to_string(),
            lineage: current.lineage,
            serial,
            records: records.clone(),
            last_updated: Utc::now(),
        });
        inner.commits += 1;
        Ok(serial)
    }

    async fn release_lock(&self, lock: &Lock) -> Result<()> {
        let mut inner = self.inner()?;
        if inner.lock.as_ref().is_some_and(|current| current.lock_id == lock.lock_id) {
            inner.lock = None;
            return Ok(());
        }
        Err(StateError::LockNotHeld {
            lock_id: lock.lock_id.clone(),
        }
        .into())
    }

    async fn lock_info(&self) -> Result<Option<Lock>> {
        Ok(self.inner()?.lock.clone())
    }

    async fn force_unlock(&self) -> Result<Option<Lock>> {
        Ok(self.inner()?.lock.take())
    }

    fn location(&self) -> String {
        format!("memory://{}", self.path)
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}

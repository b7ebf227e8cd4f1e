//! Local file-based state storage backend.
//!
//! State lives in `state.json`, written atomically through a temp file and a
//! rename. The lock is a sibling `state.lock` created with `create_new`, so
//! exactly one process can create it. Commits additionally hold a short-lived
//! `state.commit` guard file, also created with `create_new`, around the
//! serial check and the rename, so the check holds across handles and
//! processes.

use async_trait::async_trait;
use chrono::Utc;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{KeystoneError, Result, StateError};

use super::lock::{DEFAULT_LOCK_TIMEOUT_SECS, Lock, generate_holder_id};
use super::store::{Records, StateStore};
use super::types::{STATE_VERSION, StateSnapshot};

/// Default state directory name.
pub const STATE_DIR: &str = ".keystone";

/// State file name.
const STATE_FILE: &str = "state.json";

/// Attempts at creating the lock file before giving up on contention.
const ACQUIRE_ATTEMPTS: usize = 3;

/// Attempts at creating the commit guard before giving up.
const COMMIT_GUARD_ATTEMPTS: usize = 500;

/// Pause between commit guard attempts.
const COMMIT_GUARD_RETRY: Duration = Duration::from_millis(10);

/// Age after which a commit guard is considered left behind by a crash.
const COMMIT_GUARD_STALE: Duration = Duration::from_secs(30);

/// Contents of the lock file as seen by a reader.
enum LockFile {
    Absent,
    /// Present but not parseable, e.g. mid-write by its creator.
    Unreadable(String),
    Present(Lock),
}

/// Local file-based state store.
#[derive(Debug)]
pub struct LocalStateStore {
    /// Base directory for state files.
    base_dir: PathBuf,
    /// Path to the state file.
    state_path: PathBuf,
    /// Path to the lock file.
    lock_path: PathBuf,
    /// Path to the commit guard file.
    commit_path: PathBuf,
    /// Seconds without heartbeat after which a lock is stale.
    lock_timeout_secs: u64,
    /// Serializes commits issued through this handle before they contend
    /// on the guard file.
    commit_guard: Mutex<()>,
}

impl LocalStateStore {
    /// Creates a new local state store under `./.keystone`.
    ///
    /// # Errors
    ///
    /// Returns an error if the current directory cannot be determined.
    pub fn new() -> Result<Self> {
        let base_dir = std::env::current_dir()
            .map_err(|e| KeystoneError::internal(format!("Cannot determine current directory: {e}")))?
            .join(STATE_DIR);

        Ok(Self::with_base_dir(base_dir))
    }

    /// Creates a new local state store with a custom base directory.
    #[must_use]
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        let state_path = base_dir.join(STATE_FILE);
        Self::from_paths(base_dir, state_path)
    }

    /// Creates a new local state store from a custom state file path.
    #[must_use]
    pub fn with_state_path(state_path: impl Into<PathBuf>) -> Self {
        let state_path = state_path.into();
        let base_dir = state_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        Self::from_paths(base_dir, state_path)
    }

    fn from_paths(base_dir: PathBuf, state_path: PathBuf) -> Self {
        let lock_path = state_path.with_extension("lock");
        let commit_path = state_path.with_extension("commit");
        Self {
            base_dir,
            state_path,
            lock_path,
            commit_path,
            lock_timeout_secs: DEFAULT_LOCK_TIMEOUT_SECS,
            commit_guard: Mutex::new(()),
        }
    }

    /// Sets the stale-lock timeout.
    #[must_use]
    pub const fn with_lock_timeout(mut self, secs: u64) -> Self {
        self.lock_timeout_secs = secs;
        self
    }

    /// Path of the state file.
    #[must_use]
    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    /// Ensures the state directory exists.
    async fn ensure_dir(&self) -> Result<()> {
        if !self.base_dir.exists() {
            debug!("Creating state directory: {}", self.base_dir.display());
            fs::create_dir_all(&self.base_dir)
                .await
                .map_err(|e| backend("Failed to create state directory", &e))?;
        }
        Ok(())
    }

    async fn read_lock_file(&self) -> Result<LockFile> {
        read_lock_at(&self.lock_path).await
    }

    /// Writes `content` to `path` through a temp file and a rename.
    async fn write_atomic(&self, path: &Path, content: &str) -> Result<()> {
        self.ensure_dir().await?;
        let temp_path = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));

        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| backend("Failed to create temp file", &e))?;
        file.write_all(content.as_bytes())
            .await
            .map_err(|e| backend("Failed to write temp file", &e))?;
        file.sync_all()
            .await
            .map_err(|e| backend("Failed to sync temp file", &e))?;

        // Atomic rename
        if let Err(e) = fs::rename(&temp_path, path).await {
            if let Err(cleanup) = fs::remove_file(&temp_path).await {
                warn!("Failed to remove temp file {}: {cleanup}", temp_path.display());
            }
            return Err(backend("Failed to rename temp file", &e));
        }
        Ok(())
    }

    /// Creates the lock file exclusively. Returns false if it already exists.
    async fn create_lock_file(&self, lock: &Lock) -> Result<bool> {
        self.ensure_dir().await?;
        let content = to_json(lock, "lock")?;

        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.lock_path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => {
                return Err(StateError::LockFailed {
                    message: format!("Failed to create lock file: {e}"),
                }
                .into());
            }
        };

        file.write_all(content.as_bytes()).await.map_err(|e| StateError::LockFailed {
            message: format!("Failed to write lock file: {e}"),
        })?;
        file.sync_all().await.map_err(|e| StateError::LockFailed {
            message: format!("Failed to sync lock file: {e}"),
        })?;
        Ok(true)
    }

    /// Moves a stale lock out of the way.
    ///
    /// The lock file is renamed to a tombstone first, so only one reclaimer
    /// wins. If the tombstone turns out to hold a different lock than the
    /// stale one we inspected, that lock is live and is put back.
    async fn reclaim_stale(&self, stale: &Lock) -> Result<std::result::Result<(), Lock>> {
        let tombstone = self
            .lock_path
            .with_extension(format!("lock.{}.stale", Uuid::new_v4().simple()));

        match fs::rename(&self.lock_path, &tombstone).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Ok(())),
            Err(e) => return Err(backend("Failed to reclaim stale lock", &e)),
        }

        let taken = read_lock_at(&tombstone).await?;
        let result = match taken {
            LockFile::Present(lock) if lock.lock_id != stale.lock_id => {
                warn!(lock_id = %lock.lock_id, "Lock changed while reclaiming, restoring it");
                // Fails only if yet another process created a lock meanwhile.
                if let Err(e) = fs::hard_link(&tombstone, &self.lock_path).await {
                    debug!("Lock not restored: {e}");
                }
                Err(lock)
            }
            _ => {
                info!(
                    lock_id = %stale.lock_id,
                    holder = %stale.holder,
                    idle_secs = stale.idle_secs(),
                    "Reclaimed stale state lock"
                );
                Ok(())
            }
        };

        if let Err(e) = fs::remove_file(&tombstone).await {
            debug!("Failed to remove lock tombstone {}: {e}", tombstone.display());
        }
        Ok(result)
    }

    /// Creates the commit guard file, waiting while another commit holds it.
    ///
    /// A guard older than [`COMMIT_GUARD_STALE`] was left by a crashed
    /// writer and is removed.
    async fn acquire_commit_guard(&self) -> Result<()> {
        self.ensure_dir().await?;

        for _ in 0..COMMIT_GUARD_ATTEMPTS {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.commit_path)
                .await
            {
                Ok(_) => return Ok(()),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                Err(e) => return Err(backend("Failed to create commit guard", &e)),
            }

            if self.commit_guard_is_stale().await {
                warn!("Removing abandoned commit guard {}", self.commit_path.display());
                match fs::remove_file(&self.commit_path).await {
                    Ok(()) => continue,
                    Err(e) if e.kind() == ErrorKind::NotFound => continue,
                    Err(e) => return Err(backend("Failed to remove commit guard", &e)),
                }
            }
            tokio::time::sleep(COMMIT_GUARD_RETRY).await;
        }

        Err(StateError::backend(format!(
            "Commit guard {} is busy",
            self.commit_path.display()
        ))
        .into())
    }

    async fn commit_guard_is_stale(&self) -> bool {
        fs::metadata(&self.commit_path)
            .await
            .and_then(|meta| meta.modified())
            .ok()
            .and_then(|modified| modified.elapsed().ok())
            .is_some_and(|age| age > COMMIT_GUARD_STALE)
    }

    async fn release_commit_guard(&self) {
        if let Err(e) = fs::remove_file(&self.commit_path).await {
            warn!("Failed to remove commit guard {}: {e}", self.commit_path.display());
        }
    }

    /// Serial check and write, run while the commit guard is held.
    async fn commit_guarded(&self, records: &Records, expected_serial: u64) -> Result<u64> {
        let current = self.read().await?;
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

        let snapshot = StateSnapshot {
            version: STATE_VERSION.to_string(),
            lineage: current.lineage,
            serial: current.serial + 1,
            records: records.clone(),
            last_updated: Utc::now(),
        };

        self.write_atomic(&self.state_path, &to_json(&snapshot, "state")?)
            .await?;

        debug!(serial = snapshot.serial, records = records.len(), "Committed state");
        Ok(snapshot.serial)
    }

    async fn current_serial(&self) -> Result<u64> {
        Ok(self.read().await?.serial)
    }
}

#[async_trait]
impl StateStore for LocalStateStore {
    async fn read(&self) -> Result<StateSnapshot> {
        let content = match fs::read_to_string(&self.state_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("State file does not exist: {}", self.state_path.display());
                return Ok(StateSnapshot::empty());
            }
            Err(e) => return Err(StateError::corrupted(format!("Failed to read state file: {e}")).into()),
        };

        let snapshot: StateSnapshot = serde_json::from_str(&content)
            .map_err(|e| StateError::corrupted(format!("Failed to parse state file: {e}")))?;

        debug!(
            serial = snapshot.serial,
            records = snapshot.records.len(),
            "Loaded state from {}",
            self.state_path.display()
        );
        Ok(snapshot)
    }

    async fn acquire_lock(&self, holder: &str) -> Result<Lock> {
        let holder_id = if holder.is_empty() {
            generate_holder_id()
        } else {
            holder.to_string()
        };

        for _ in 0..ACQUIRE_ATTEMPTS {
            let lock = Lock::new(&holder_id, &self.location(), self.current_serial().await?);
            if self.create_lock_file(&lock).await? {
                info!(lock_id = %lock.lock_id, holder = %lock.holder, "Acquired state lock");
                return Ok(lock);
            }

            match self.read_lock_file().await? {
                // Released between our create and read.
                LockFile::Absent => {}
                LockFile::Unreadable(reason) => {
                    return Err(StateError::LockHeld {
                        holder: format!("unknown ({reason})"),
                        since: String::from("unknown"),
                        lock_id: String::from("unknown"),
                    }
                    .into());
                }
                LockFile::Present(existing) if !existing.is_stale(self.lock_timeout_secs) => {
                    return Err(lock_held(&existing));
                }
                LockFile::Present(stale) => {
                    if let Err(live) = self.reclaim_stale(&stale).await? {
                        return Err(lock_held(&live));
                    }
                }
            }
        }

        Err(StateError::LockFailed {
            message: format!("Lock contention on {} did not settle", self.lock_path.display()),
        }
        .into())
    }

    async fn heartbeat(&self, lock: &Lock) -> Result<Lock> {
        match self.read_lock_file().await? {
            LockFile::Present(current) if current.lock_id == lock.lock_id => {
                let refreshed = current.refreshed();
                self.write_atomic(&self.lock_path, &to_json(&refreshed, "lock")?)
                    .await?;
                debug!(lock_id = %refreshed.lock_id, "Lock heartbeat");
                Ok(refreshed)
            }
            _ => Err(StateError::LockNotHeld {
                lock_id: lock.lock_id.clone(),
            }
            .into()),
        }
    }

    async fn commit(&self, records: &Records, expected_serial: u64) -> Result<u64> {
        let _guard = self.commit_guard.lock().await;

        self.acquire_commit_guard().await?;
        let result = self.commit_guarded(records, expected_serial).await;
        self.release_commit_guard().await;
        result
    }

    async fn release_lock(&self, lock: &Lock) -> Result<()> {
        match self.read_lock_file().await? {
            LockFile::Present(existing) if existing.lock_id == lock.lock_id => {
                match fs::remove_file(&self.lock_path).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(backend("Failed to delete lock file", &e)),
                }
                info!(lock_id = %lock.lock_id, "Released state lock");
                Ok(())
            }
            _ => {
                debug!(lock_id = %lock.lock_id, "Lock already released or taken over");
                Err(StateError::LockNotHeld {
                    lock_id: lock.lock_id.clone(),
                }
                .into())
            }
        }
    }

    async fn lock_info(&self) -> Result<Option<Lock>> {
        match self.read_lock_file().await? {
            LockFile::Absent => Ok(None),
            LockFile::Present(lock) => Ok(Some(lock)),
            LockFile::Unreadable(reason) => Err(StateError::corrupted(format!(
                "Lock file {} is unreadable: {reason}",
                self.lock_path.display()
            ))
            .into()),
        }
    }

    async fn force_unlock(&self) -> Result<Option<Lock>> {
        let existing = match self.read_lock_file().await? {
            LockFile::Present(lock) => Some(lock),
            LockFile::Absent | LockFile::Unreadable(_) => None,
        };
        match fs::remove_file(&self.lock_path).await {
            Ok(()) => warn!("Force-removed state lock {}", self.lock_path.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(backend("Failed to delete lock file", &e)),
        }
        Ok(existing)
    }

    fn location(&self) -> String {
        self.state_path.display().to_string()
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }
}

async fn read_lock_at(path: &Path) -> Result<LockFile> {
    let content = match fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(LockFile::Absent),
        Err(e) => return Err(backend("Failed to read lock file", &e)),
    };
    Ok(match serde_json::from_str::<Lock>(&content) {
        Ok(lock) => LockFile::Present(lock),
        Err(e) => LockFile::Unreadable(e.to_string()),
    })
}

fn lock_held(lock: &Lock) -> KeystoneError {
    StateError::LockHeld {
        holder: lock.holder.clone(),
        since: lock.acquired_at.to_rfc3339(),
        lock_id: lock.lock_id.clone(),
    }
    .into()
}

fn backend(context: &str, err: &std::io::Error) -> KeystoneError {
    StateError::backend(format!("{context}: {err}")).into()
}

fn to_json<T: serde::Serialize>(value: &T, what: &str) -> Result<String> {
    serde_json::to_string_pretty(value)
        .map_err(|e| StateError::serialization(format!("Failed to serialize {what}: {e}")).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Attributes, ResourceAddress};
    use crate::state::StateRecord;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn create_test_store() -> (LocalStateStore, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = LocalStateStore::with_base_dir(temp_dir.path());
        (store, temp_dir)
    }

    fn records(names: &[&str]) -> Records {
        names
            .iter()
            .map(|n| {
                let address = ResourceAddress::new("aws_vpc", *n);
                let mut attributes = Attributes::new();
                attributes.insert(String::from("name"), serde_json::json!(n));
                let record = StateRecord::new(address.clone(), format!("id-{n}"), attributes);
                (address, record)
            })
            .collect()
    }

    #[tokio::test]
    async fn test_read_absent_state_is_empty() {
        let (store, _temp) = create_test_store();
        let snapshot = store.read().await.expect("read failed");
        assert_eq!(snapshot.serial, 0);
        assert!(snapshot.records.is_empty());
    }

    #[tokio::test]
    async fn test_commit_increments_serial() {
        let (store, _temp) = create_test_store();

        let serial = store.commit(&records(&["a"]), 0).await.expect("commit failed");
        assert_eq!(serial, 1);
        let serial = store.commit(&records(&["a", "b"]), 1).await.expect("commit failed");
        assert_eq!(serial, 2);

        let snapshot = store.read().await.expect("read failed");
        assert_eq!(snapshot.serial, 2);
        assert_eq!(snapshot.records.len(), 2);
    }

    #[tokio::test]
    async fn test_stale_commit_conflicts_and_writes_nothing() {
        let (store, _temp) = create_test_store();
        store.commit(&records(&["a"]), 0).await.expect("commit failed");
        let before = store.read().await.expect("read failed");

        let err = store.commit(&records(&["x", "y"]), 0).await.unwrap_err();
        assert!(err.is_conflict());

        let after = store.read().await.expect("read failed");
        assert_eq!(after, before);
    }

    #[tokio::test]
    async fn test_lineage_is_preserved_across_commits() {
        let (store, _temp) = create_test_store();
        store.commit(&records(&["a"]), 0).await.expect("commit failed");
        let first = store.read().await.expect("read failed").lineage;
        store.commit(&records(&["b"]), 1).await.expect("commit failed");
        assert_eq!(store.read().await.expect("read failed").lineage, first);
    }

    #[tokio::test]
    async fn test_lock_acquire_release() {
        let (store, _temp) = create_test_store();

        let lock = store.acquire_lock("holder-1").await.expect("Failed to acquire lock");
        assert_eq!(store.lock_info().await.expect("lock_info failed"), Some(lock.clone()));

        let err = store.acquire_lock("holder-2").await.unwrap_err();
        assert!(err.is_lock_held());

        store.release_lock(&lock).await.expect("Failed to release lock");
        assert!(store.lock_info().await.expect("lock_info failed").is_none());

        // Second release is reported, never panics.
        let err = store.release_lock(&lock).await.unwrap_err();
        assert!(matches!(err, KeystoneError::State(StateError::LockNotHeld { .. })));
    }

    #[tokio::test]
    async fn test_foreign_release_changes_nothing() {
        let (store, _temp) = create_test_store();
        let lock = store.acquire_lock("holder-1").await.expect("acquire failed");
        let foreign = Lock::new("intruder", "elsewhere", 0);

        assert!(store.release_lock(&foreign).await.is_err());
        assert_eq!(store.lock_info().await.expect("lock_info failed"), Some(lock));
    }

    #[tokio::test]
    async fn test_stale_lock_is_reclaimed() {
        let (store, _temp) = create_test_store();
        let store = store.with_lock_timeout(60);

        let mut stale = Lock::new("crashed", &store.location(), 0);
        stale.last_heartbeat = Utc::now() - chrono::Duration::seconds(3600);
        store.create_lock_file(&stale).await.expect("seed lock");

        let lock = store.acquire_lock("rescuer").await.expect("reclaim failed");
        assert_eq!(lock.holder, "rescuer");
        assert_ne!(lock.lock_id, stale.lock_id);

        // The crashed holder has lost its lock.
        assert!(store.heartbeat(&stale).await.is_err());
        assert!(store.heartbeat(&lock).await.is_ok());
    }

    #[tokio::test]
    async fn test_unreadable_lock_counts_as_held() {
        let (store, temp) = create_test_store();
        std::fs::write(temp.path().join("state.lock"), b"").expect("write lock");

        let err = store.acquire_lock("holder").await.unwrap_err();
        assert!(err.is_lock_held());

        store.force_unlock().await.expect("force unlock failed");
        assert!(store.acquire_lock("holder").await.is_ok());
    }

    #[tokio::test]
    async fn test_concurrent_acquire_has_one_winner() {
        let temp = TempDir::new().expect("Failed to create temp dir");
        let mut handles = Vec::new();
        for i in 0..8 {
            let store = Arc::new(LocalStateStore::with_base_dir(temp.path()));
            handles.push(tokio::spawn(async move {
                store.acquire_lock(&format!("holder-{i}")).await
            }));
        }

        let mut winners = 0;
        for handle in handles {
            match handle.await.expect("task panicked") {
                Ok(_) => winners += 1,
                Err(e) => assert!(e.is_lock_held()),
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_commits_from_two_handles_have_one_winner() {
        for _ in 0..25 {
            let temp = TempDir::new().expect("Failed to create temp dir");
            let first = Arc::new(LocalStateStore::with_base_dir(temp.path()));
            let second = Arc::new(LocalStateStore::with_base_dir(temp.path()));

            let a = tokio::spawn({
                let store = Arc::clone(&first);
                async move { store.commit(&records(&["a"]), 0).await }
            });
            let b = tokio::spawn({
                let store = Arc::clone(&second);
                async move { store.commit(&records(&["b"]), 0).await }
            });
            let results = [a.await.expect("task panicked"), b.await.expect("task panicked")];

            let winners = results.iter().filter(|r| r.is_ok()).count();
            assert_eq!(winners, 1);
            assert!(results.iter().filter_map(|r| r.as_ref().err()).all(KeystoneError::is_conflict));

            let snapshot = first.read().await.expect("read failed");
            assert_eq!(snapshot.serial, 1);
            assert_eq!(snapshot.records.len(), 1);
            assert!(!temp.path().join("state.commit").exists());
        }
    }

    #[tokio::test]
    async fn test_abandoned_commit_guard_is_removed() {
        let (store, temp) = create_test_store();
        let guard = temp.path().join("state.commit");
        let file = std::fs::File::create(&guard).expect("seed guard");
        file.set_modified(std::time::SystemTime::now() - Duration::from_secs(3600))
            .expect("backdate guard");
        drop(file);

        assert_eq!(store.commit(&records(&["a"]), 0).await.expect("commit failed"), 1);
        assert!(!guard.exists());
    }

    #[tokio::test]
    async fn test_heartbeat_after_force_unlock_fails() {
        let (store, _temp) = create_test_store();
        let lock = store.acquire_lock("holder").await.expect("acquire failed");
        let removed = store.force_unlock().await.expect("force unlock failed");
        assert_eq!(removed.map(|l| l.lock_id), Some(lock.lock_id.clone()));
        assert!(store.heartbeat(&lock).await.is_err());
    }
}

//! State locking for concurrent access protection.
//!
//! At most one live [`Lock`] may exist per state path. A lock whose holder
//! stopped heartbeating for longer than the timeout is stale and may be
//! reclaimed by the next caller.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default time without heartbeat after which a lock is stale.
pub const DEFAULT_LOCK_TIMEOUT_SECS: u64 = 300;

/// An exclusive lock on one state path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lock {
    /// Unique lock identifier.
    pub lock_id: String,
    /// Who holds the lock.
    pub holder: String,
    /// State location the lock protects.
    pub path: String,
    /// When the lock was acquired.
    pub acquired_at: DateTime<Utc>,
    /// Last time the holder proved it is alive.
    pub last_heartbeat: DateTime<Utc>,
    /// Serial of the state when the lock was taken.
    pub serial_at_acquisition: u64,
}

impl Lock {
    /// Creates a new lock.
    #[must_use]
    pub fn new(holder: &str, path: &str, serial: u64) -> Self {
        let now = Utc::now();
        Self {
            lock_id: Uuid::new_v4().to_string(),
            holder: holder.to_string(),
            path: path.to_string(),
            acquired_at: now,
            last_heartbeat: now,
            serial_at_acquisition: serial,
        }
    }

    /// Checks if the lock missed its heartbeat for longer than `timeout_secs`.
    #[must_use]
    pub fn is_stale(&self, timeout_secs: u64) -> bool {
        u64::try_from(self.idle_secs()).unwrap_or(0) > timeout_secs
    }

    /// Returns a copy with a fresh heartbeat.
    #[must_use]
    pub fn refreshed(&self) -> Self {
        Self {
            last_heartbeat: Utc::now(),
            ..self.clone()
        }
    }

    /// Seconds since the last heartbeat.
    #[must_use]
    pub fn idle_secs(&self) -> i64 {
        (Utc::now() - self.last_heartbeat).num_seconds().max(0)
    }
}

/// Generates a unique holder identifier for the current process.
#[must_use]
pub fn generate_holder_id() -> String {
    let hostname = hostname::get().map_or_else(|_| String::from("unknown"), |h| h.to_string_lossy().to_string());

    let pid = std::process::id();
    let uuid = &Uuid::new_v4().to_string()[..8];

    format!("{hostname}-{pid}-{uuid}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_lock_creation() {
        let lock = Lock::new("test-holder", "state.json", 7);
        assert_eq!(lock.holder, "test-holder");
        assert_eq!(lock.serial_at_acquisition, 7);
        assert!(!lock.is_stale(DEFAULT_LOCK_TIMEOUT_SECS));
    }

    #[test]
    fn test_stale_detection() {
        let mut lock = Lock::new("test-holder", "state.json", 0);
        lock.last_heartbeat = Utc::now() - Duration::seconds(600);
        assert!(lock.is_stale(DEFAULT_LOCK_TIMEOUT_SECS));
        assert!(lock.idle_secs() >= 600);

        let fresh = lock.refreshed();
        assert!(!fresh.is_stale(DEFAULT_LOCK_TIMEOUT_SECS));
        assert_eq!(fresh.lock_id, lock.lock_id);
    }

    #[test]
    fn test_holder_id_generation() {
        let id1 = generate_holder_id();
        let id2 = generate_holder_id();

        // IDs should be unique
        assert_ne!(id1, id2);

        // IDs should contain the process ID
        let pid = std::process::id().to_string();
        assert!(id1.contains(&pid));
    }
}

//! S3-based state storage backend.
//!
//! This module provides remote state storage on AWS S3 (or compatible services)
//! for team use. Every write is conditional: the lock object is created with
//! `If-None-Match: *`, and reclaim, heartbeat, release and commit all send
//! `If-Match` with the `ETag` they read, so a concurrent writer always turns
//! into a precondition failure instead of a lost update.

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::types::ServerSideEncryption;
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::error::{KeystoneError, Result, StateError};

use super::lock::{DEFAULT_LOCK_TIMEOUT_SECS, Lock, generate_holder_id};
use super::store::{Records, StateStore};
use super::types::{STATE_VERSION, StateSnapshot};

/// State file key suffix.
const STATE_KEY: &str = "state.json";

/// Lock file key suffix.
const LOCK_KEY: &str = "state.lock";

/// HTTP status S3 returns when a conditional write loses.
const PRECONDITION_FAILED: u16 = 412;

/// Precondition attached to a write.
enum Condition {
    /// The object must not exist.
    Absent,
    /// The object must still have this `ETag`.
    Matches(String),
}

/// Result of a conditional write.
enum PutOutcome {
    Written,
    PreconditionFailed,
}

/// S3-based state store.
#[derive(Debug)]
pub struct S3StateStore {
    /// S3 client.
    client: Client,
    /// Bucket name.
    bucket: String,
    /// Key prefix.
    prefix: String,
    /// Seconds without heartbeat after which a lock is stale.
    lock_timeout_secs: u64,
}

impl S3StateStore {
    /// Creates a new S3 state store using the default credential chain.
    ///
    /// # Errors
    ///
    /// Returns an error if the S3 client cannot be initialized.
    pub async fn new(bucket: &str, prefix: Option<&str>, region: Option<&str>) -> Result<Self> {
        let config = if let Some(region_str) = region {
            aws_config::from_env()
                .region(aws_config::Region::new(region_str.to_string()))
                .load()
                .await
        } else {
            aws_config::load_from_env().await
        };

        let client = Client::new(&config);
        Ok(Self::with_client(client, bucket, prefix))
    }

    /// Creates a new S3 state store with an existing client.
    #[must_use]
    pub fn with_client(client: Client, bucket: &str, prefix: Option<&str>) -> Self {
        Self {
            client,
            bucket: bucket.to_string(),
            prefix: normalize_prefix(prefix),
            lock_timeout_secs: DEFAULT_LOCK_TIMEOUT_SECS,
        }
    }

    /// Sets the stale-lock timeout.
    #[must_use]
    pub const fn with_lock_timeout(mut self, secs: u64) -> Self {
        self.lock_timeout_secs = secs;
        self
    }

    /// Gets the full S3 key for a file.
    fn key(&self, file: &str) -> String {
        format!("{}{file}", self.prefix)
    }

    /// Gets an object and its `ETag`.
    async fn get_object(&self, key: &str) -> Result<Option<(String, String)>> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(response) => {
                let etag = response.e_tag().unwrap_or_default().to_string();
                let bytes = response
                    .body
                    .collect()
                    .await
                    .map_err(|e| StateError::backend(format!("Failed to read S3 object: {e}")))?;

                let content = String::from_utf8(bytes.to_vec())
                    .map_err(|e| StateError::corrupted(format!("Invalid UTF-8 in S3 object: {e}")))?;

                Ok(Some((content, etag)))
            }
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_no_such_key() {
                    Ok(None)
                } else {
                    Err(StateError::backend(format!("S3 get error: {service_err}")).into())
                }
            }
        }
    }

    /// Writes an object under a precondition, encrypted at rest.
    async fn put_object(&self, key: &str, content: &str, condition: Condition) -> Result<PutOutcome> {
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(content.as_bytes().to_vec().into())
            .content_type("application/json")
            .server_side_encryption(ServerSideEncryption::Aes256);

        request = match condition {
            Condition::Absent => request.if_none_match("*"),
            Condition::Matches(etag) => request.if_match(etag),
        };

        match request.send().await {
            Ok(_) => Ok(PutOutcome::Written),
            Err(e) if is_precondition_failed(&e) => Ok(PutOutcome::PreconditionFailed),
            Err(e) => Err(StateError::backend(format!("S3 put error: {e}")).into()),
        }
    }

    /// Deletes an object, optionally only if its `ETag` still matches.
    async fn delete_object(&self, key: &str, etag: Option<&str>) -> Result<PutOutcome> {
        let mut request = self.client.delete_object().bucket(&self.bucket).key(key);
        if let Some(etag) = etag {
            request = request.if_match(etag);
        }

        match request.send().await {
            Ok(_) => Ok(PutOutcome::Written),
            Err(e) if is_precondition_failed(&e) => Ok(PutOutcome::PreconditionFailed),
            Err(e) => Err(StateError::backend(format!("S3 delete error: {e}")).into()),
        }
    }

    async fn read_lock(&self) -> Result<Option<(Lock, String)>> {
        let Some((content, etag)) = self.get_object(&self.key(LOCK_KEY)).await? else {
            return Ok(None);
        };
        let lock: Lock = serde_json::from_str(&content)
            .map_err(|e| StateError::corrupted(format!("Failed to parse lock: {e}")))?;
        Ok(Some((lock, etag)))
    }

    async fn read_state(&self) -> Result<Option<(StateSnapshot, String)>> {
        let Some((content, etag)) = self.get_object(&self.key(STATE_KEY)).await? else {
            return Ok(None);
        };
        let snapshot: StateSnapshot = serde_json::from_str(&content)
            .map_err(|e| StateError::corrupted(format!("Failed to parse state: {e}")))?;
        Ok(Some((snapshot, etag)))
    }

    async fn held_error(&self) -> KeystoneError {
        match self.read_lock().await {
            Ok(Some((lock, _))) => lock_held(&lock),
            Ok(None) => StateError::LockFailed {
                message: String::from("lock changed hands during acquisition"),
            }
            .into(),
            Err(e) => e,
        }
    }
}

#[async_trait]
impl StateStore for S3StateStore {
    async fn read(&self) -> Result<StateSnapshot> {
        debug!("Loading state from {}", self.location());
        match self.read_state().await? {
            Some((snapshot, _)) => {
                info!(serial = snapshot.serial, records = snapshot.records.len(), "Loaded state");
                Ok(snapshot)
            }
            None => {
                debug!("No state found in S3");
                Ok(StateSnapshot::empty())
            }
        }
    }

    async fn acquire_lock(&self, holder: &str) -> Result<Lock> {
        let holder_id = if holder.is_empty() {
            generate_holder_id()
        } else {
            holder.to_string()
        };
        let serial = self.read().await?.serial;
        let lock = Lock::new(&holder_id, &self.location(), serial);
        let content = to_json(&lock, "lock")?;
        let key = self.key(LOCK_KEY);

        if let PutOutcome::Written = self.put_object(&key, &content, Condition::Absent).await? {
            info!(lock_id = %lock.lock_id, "Acquired state lock");
            return Ok(lock);
        }

        let Some((existing, etag)) = self.read_lock().await? else {
            return Err(self.held_error().await);
        };
        if !existing.is_stale(self.lock_timeout_secs) {
            return Err(lock_held(&existing));
        }

        match self.put_object(&key, &content, Condition::Matches(etag)).await? {
            PutOutcome::Written => {
                info!(
                    lock_id = %lock.lock_id,
                    stale_lock_id = %existing.lock_id,
                    "Reclaimed stale state lock"
                );
                Ok(lock)
            }
            PutOutcome::PreconditionFailed => Err(self.held_error().await),
        }
    }

    async fn heartbeat(&self, lock: &Lock) -> Result<Lock> {
        let not_held = || {
            KeystoneError::from(StateError::LockNotHeld {
                lock_id: lock.lock_id.clone(),
            })
        };
        let Some((current, etag)) = self.read_lock().await? else {
            return Err(not_held());
        };
        if current.lock_id != lock.lock_id {
            return Err(not_held());
        }

        let refreshed = current.refreshed();
        match self
            .put_object(&self.key(LOCK_KEY), &to_json(&refreshed, "lock")?, Condition::Matches(etag))
            .await?
        {
            PutOutcome::Written => Ok(refreshed),
            PutOutcome::PreconditionFailed => Err(not_held()),
        }
    }

    async fn commit(&self, records: &Records, expected_serial: u64) -> Result<u64> {
        let (current, condition) = match self.read_state().await? {
            Some((snapshot, etag)) => (snapshot, Condition::Matches(etag)),
            None => (StateSnapshot::empty(), Condition::Absent),
        };

        if current.serial != expected_serial {
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

        match self
            .put_object(&self.key(STATE_KEY), &to_json(&snapshot, "state")?, condition)
            .await?
        {
            PutOutcome::Written => {
                debug!(serial = snapshot.serial, "Committed state to S3");
                Ok(snapshot.serial)
            }
            PutOutcome::PreconditionFailed => {
                let found = self.read().await?.serial;
                warn!(expected = expected_serial, found, "Concurrent commit won the race");
                Err(StateError::Conflict {
                    expected: expected_serial,
                    found,
                }
                .into())
            }
        }
    }

    async fn release_lock(&self, lock: &Lock) -> Result<()> {
        let not_held = || {
            KeystoneError::from(StateError::LockNotHeld {
                lock_id: lock.lock_id.clone(),
            })
        };
        let Some((current, etag)) = self.read_lock().await? else {
            return Err(not_held());
        };
        if current.lock_id != lock.lock_id {
            debug!(
                "Lock ID mismatch: expected {}, found {}",
                lock.lock_id, current.lock_id
            );
            return Err(not_held());
        }

        match self.delete_object(&self.key(LOCK_KEY), Some(&etag)).await? {
            PutOutcome::Written => {
                info!(lock_id = %lock.lock_id, "Released state lock");
                Ok(())
            }
            PutOutcome::PreconditionFailed => Err(not_held()),
        }
    }

    async fn lock_info(&self) -> Result<Option<Lock>> {
        Ok(self.read_lock().await?.map(|(lock, _)| lock))
    }

    async fn force_unlock(&self) -> Result<Option<Lock>> {
        let existing = self.read_lock().await.ok().flatten().map(|(lock, _)| lock);
        self.delete_object(&self.key(LOCK_KEY), None).await?;
        warn!("Force-removed state lock at {}", self.location());
        Ok(existing)
    }

    fn location(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.key(STATE_KEY))
    }

    fn backend_type(&self) -> &'static str {
        "s3"
    }
}

fn is_precondition_failed<E>(err: &SdkError<E, HttpResponse>) -> bool {
    err.raw_response()
        .is_some_and(|r| r.status().as_u16() == PRECONDITION_FAILED)
}

/// Normalizes a key prefix to either empty or `segment/`.
fn normalize_prefix(prefix: Option<&str>) -> String {
    prefix
        .map(|p| {
            let p = p.trim_matches('/');
            if p.is_empty() {
                String::new()
            } else {
                format!("{p}/")
            }
        })
        .unwrap_or_default()
}

fn lock_held(lock: &Lock) -> KeystoneError {
    StateError::LockHeld {
        holder: lock.holder.clone(),
        since: lock.acquired_at.to_rfc3339(),
        lock_id: lock.lock_id.clone(),
    }
    .into()
}

fn to_json<T: serde::Serialize>(value: &T, what: &str) -> Result<String> {
    serde_json::to_string_pretty(value)
        .map_err(|e| StateError::serialization(format!("Failed to serialize {what}: {e}")).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_normalization() {
        assert_eq!(normalize_prefix(None), "");
        assert_eq!(normalize_prefix(Some("/")), "");
        assert_eq!(normalize_prefix(Some("envs/prod/")), "envs/prod/");
        assert_eq!(normalize_prefix(Some("/team")), "team/");
    }
}

//! Execution of a single planned action.
//!
//! A task performs the provider calls for one action and commits the
//! resulting record through the shared ledger. Commits are serialized by the
//! ledger mutex, so every commit advances the serial by exactly one.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::retry::RetryPolicy;
use crate::error::{ApplyError, KeystoneError, Result};
use crate::model::{Attributes, Resolved, split_resolved};
use crate::planner::{
    ChangeAction, ChangeKind, ReplaceOrder, diff_attributes, requires_replace, update_payload,
};
use crate::provider::ProviderAdapter;
use crate::state::{Records, StateRecord, StateStore};

/// Records and serial as of the last successful commit.
#[derive(Debug)]
pub(super) struct Ledger {
    pub records: Records,
    pub serial: u64,
}

/// How a task ended.
#[derive(Debug)]
pub(super) enum TaskOutput {
    /// The action completed and its record is committed.
    Done {
        attempts: u32,
        provider_id: Option<String>,
        outputs: Option<Attributes>,
    },
    /// The action failed.
    Failed { attempts: u32, error: KeystoneError },
    /// Dispatch stopped before the action started.
    NotStarted,
}

/// Everything one action needs, owned so it can run on its own task.
pub(super) struct ActionTask {
    pub action: ChangeAction,
    pub resolved: BTreeMap<String, Resolved>,
    pub immutable: BTreeSet<String>,
    pub provider: Arc<dyn ProviderAdapter>,
    pub store: Arc<dyn StateStore>,
    pub ledger: Arc<Mutex<Ledger>>,
    pub retry: RetryPolicy,
    pub stop: CancellationToken,
    pub semaphore: Arc<Semaphore>,
}

struct Applied {
    provider_id: Option<String>,
    outputs: Option<Attributes>,
}

impl ActionTask {
    /// Waits for a worker slot, then performs the action.
    pub async fn run(self) -> (String, TaskOutput) {
        let key = self.action.key();
        let Ok(_permit) = self.semaphore.acquire().await else {
            return (key, TaskOutput::NotStarted);
        };
        if self.stop.is_cancelled() {
            return (key, TaskOutput::NotStarted);
        }

        debug!(action = %key, kind = %self.action.kind, "Running action");
        let mut attempts = 0;
        let result = match self.action.kind {
            ChangeKind::Create => self.create(&mut attempts).await,
            ChangeKind::Update => self.update(&mut attempts).await,
            ChangeKind::Replace => self.replace(&mut attempts).await,
            ChangeKind::Delete => match self.action.deposed_id.clone() {
                Some(id) => self.delete_deposed(&id, &mut attempts).await,
                None => self.delete(&mut attempts).await,
            },
            ChangeKind::Noop => Ok(Applied {
                provider_id: self.action.prior.as_ref().map(|p| p.provider_id.clone()),
                outputs: self.action.prior.as_ref().map(|p| p.attributes.clone()),
            }),
        };

        let output = match result {
            Ok(applied) => TaskOutput::Done {
                attempts,
                provider_id: applied.provider_id,
                outputs: applied.outputs,
            },
            Err(error) => {
                error!(action = %key, attempts, error = %error, "Action failed");
                TaskOutput::Failed { attempts, error }
            }
        };
        (key, output)
    }

    async fn call<T, F, Fut>(&self, what: &str, attempts: &mut u32, operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let label = format!("{what} {}", self.action.key());
        let (result, made) = self.retry.run(&label, &self.stop, operation).await;
        *attempts += made;
        result
    }

    fn desired(&self) -> Result<Attributes> {
        let (known, unknown) = split_resolved(&self.resolved);
        if let Some(field) = unknown.first() {
            return Err(ApplyError::UnresolvedReference {
                address: self.action.address.to_string(),
                message: format!("'{field}' is still unknown"),
            }
            .into());
        }
        Ok(known)
    }

    fn prior(&self) -> Result<&StateRecord> {
        self.action.prior.as_ref().ok_or_else(|| {
            KeystoneError::internal(format!(
                "{} action for {} has no recorded state",
                self.action.kind, self.action.address
            ))
        })
    }

    fn record_for(&self, provider_id: &str, attributes: Attributes) -> StateRecord {
        let mut record = StateRecord::new(self.action.address.clone(), provider_id, attributes);
        record.managed_fields = self.resolved.keys().cloned().collect();
        record.dependencies.clone_from(&self.action.dependencies);
        record.prevent_destroy = self.action.lifecycle.prevent_destroy;
        record
    }

    /// Applies `mutate` to the ledger records and commits them if it reports
    /// a change.
    async fn commit<F>(&self, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut Records) -> bool,
    {
        let mut ledger = self.ledger.lock().await;
        let mut records = ledger.records.clone();
        if !mutate(&mut records) {
            return Ok(());
        }
        let serial = self.store.commit(&records, ledger.serial).await?;
        debug!(action = %self.action.key(), serial, "Committed state");
        ledger.records = records;
        ledger.serial = serial;
        Ok(())
    }

    async fn create_object(&self, attempts: &mut u32) -> Result<(String, Attributes)> {
        let desired = self.desired()?;
        let provider = &self.provider;
        let resource_type = self.action.resource_type.as_str();
        let desired_ref = &desired;
        let (id, attributes) = self
            .call("create", attempts, move || provider.create(resource_type, desired_ref))
            .await?;
        info!(address = %self.action.address, id = %id, "Created resource");
        Ok((id, attributes))
    }

    /// Deletes an object; an object that is already gone counts as deleted.
    async fn delete_object(&self, id: &str, attempts: &mut u32) -> Result<()> {
        let provider = &self.provider;
        let resource_type = self.action.resource_type.as_str();
        match self
            .call("delete", attempts, move || provider.delete(resource_type, id))
            .await
        {
            Ok(()) => {
                info!(address = %self.action.address, id, "Deleted resource");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                info!(address = %self.action.address, id, "Resource already gone");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Records a created object. Deposed ids already tracked at the address,
    /// e.g. by a tombstone, are carried over.
    async fn commit_created(&self, mut record: StateRecord) -> Result<()> {
        let id = record.provider_id.clone();
        let address = record.address.clone();
        self.commit(move |records| {
            if let Some(existing) = records.get(&address) {
                for deposed in &existing.deposed {
                    if !record.deposed.contains(deposed) {
                        record.deposed.push(deposed.clone());
                    }
                }
            }
            records.insert(address, record);
            true
        })
        .await
        .inspect_err(|e| {
            error!(
                address = %self.action.address,
                id = %id,
                error = %e,
                "Created object could not be recorded"
            );
        })
    }

    async fn create(&self, attempts: &mut u32) -> Result<Applied> {
        let (id, attributes) = self.create_object(attempts).await?;
        self.commit_created(self.record_for(&id, attributes.clone())).await?;
        Ok(Applied {
            provider_id: Some(id),
            outputs: Some(attributes),
        })
    }

    async fn update(&self, attempts: &mut u32) -> Result<Applied> {
        let prior = self.prior()?;
        let changes = diff_attributes(
            prior,
            &self.resolved,
            &self.action.lifecycle.ignore_changes,
            &self.immutable,
        );
        if changes.is_empty() {
            debug!(address = %self.action.address, "Nothing left to update");
            return Ok(Applied {
                provider_id: Some(prior.provider_id.clone()),
                outputs: Some(prior.attributes.clone()),
            });
        }
        if requires_replace(&changes) {
            warn!(
                address = %self.action.address,
                "Immutable field changed after planning, attempting in-place update"
            );
        }

        let desired = self.desired()?;
        let payload = update_payload(&changes);
        let provider = &self.provider;
        let resource_type = self.action.resource_type.as_str();
        let id = prior.provider_id.as_str();
        let (payload_ref, desired_ref) = (&payload, &desired);
        let attributes = self
            .call("update", attempts, move || {
                provider.update(resource_type, id, payload_ref, desired_ref)
            })
            .await?;
        info!(address = %self.action.address, id, fields = payload.len(), "Updated resource");

        let mut record = prior.clone();
        record.set_attributes(attributes.clone());
        record.managed_fields = self.resolved.keys().cloned().collect();
        record.dependencies.clone_from(&self.action.dependencies);
        record.prevent_destroy = self.action.lifecycle.prevent_destroy;
        let address = record.address.clone();
        self.commit(move |records| {
            records.insert(address, record);
            true
        })
        .await?;

        Ok(Applied {
            provider_id: Some(id.to_string()),
            outputs: Some(attributes),
        })
    }

    async fn replace(&self, attempts: &mut u32) -> Result<Applied> {
        let prior = self.prior()?;
        let order = self
            .action
            .replace_order
            .unwrap_or(ReplaceOrder::DestroyBeforeCreate);

        let deposed = match order {
            ReplaceOrder::DestroyBeforeCreate => {
                self.delete_object(&prior.provider_id, attempts).await?;
                let address = prior.address.clone();
                let tombstone = (!prior.deposed.is_empty()).then(|| StateRecord::tombstone(prior));
                self.commit(move |records| match tombstone {
                    Some(tombstone) => {
                        records.insert(address, tombstone);
                        true
                    }
                    None => records.remove(&address).is_some(),
                })
                .await?;
                prior.deposed.clone()
            }
            ReplaceOrder::CreateBeforeDestroy => {
                let mut deposed = prior.deposed.clone();
                deposed.push(prior.provider_id.clone());
                deposed
            }
        };

        let (id, attributes) = self.create_object(attempts).await?;
        let mut record = self.record_for(&id, attributes.clone());
        record.deposed = deposed;
        self.commit_created(record).await?;

        Ok(Applied {
            provider_id: Some(id),
            outputs: Some(attributes),
        })
    }

    async fn delete(&self, attempts: &mut u32) -> Result<Applied> {
        let prior = self.prior()?;
        self.delete_object(&prior.provider_id, attempts).await?;
        let address = prior.address.clone();
        self.commit(move |records| records.remove(&address).is_some())
            .await?;
        Ok(Applied {
            provider_id: None,
            outputs: None,
        })
    }

    async fn delete_deposed(&self, id: &str, attempts: &mut u32) -> Result<Applied> {
        self.delete_object(id, attempts).await?;
        let address = self.action.address.clone();
        self.commit(move |records| {
            let Some(record) = records.get_mut(&address) else {
                return false;
            };
            let before = record.deposed.len();
            record.deposed.retain(|d| d != id);
            if record.deposed.len() == before {
                return false;
            }
            if record.is_tombstone() && record.deposed.is_empty() {
                records.remove(&address);
            }
            true
        })
        .await?;
        Ok(Applied {
            provider_id: None,
            outputs: None,
        })
    }
}

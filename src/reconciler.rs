//! Reconciler for converging declared and recorded state.
//!
//! This module implements the loop around planning and execution: refresh
//! recorded state from the providers, plan, take the lock, apply, release.
//! A run that loses a race on the state serial re-plans from fresh state a
//! bounded number of times.

use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ContentHasher, DeployConfig, executor_options};
use crate::error::Result;
use crate::executor::{AbortReason, ApplyResult, Executor, ExecutorOptions};
use crate::graph::DependencyGraph;
use crate::model::ResourceAddress;
use crate::planner::{Plan, Planner};
use crate::provider::ProviderRegistry;
use crate::state::{Lock, StateRecord, StateSnapshot, StateStore, generate_holder_id};

/// Default plan/apply rounds before giving up on conflicts.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Which plan a locked run produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Converge,
    Destroy,
}

/// Reconciler for one declared graph against one state store.
pub struct Reconciler {
    /// Declared resources.
    graph: DependencyGraph,
    /// State store.
    store: Arc<dyn StateStore>,
    /// Provider adapters.
    registry: ProviderRegistry,
    /// Executor settings.
    options: ExecutorOptions,
    /// Hash of the configuration the graph came from.
    config_hash: String,
    /// Lock holder identifier.
    holder: String,
    /// Maximum plan/apply rounds.
    max_attempts: u32,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("resources", &self.graph.len())
            .field("store", &self.store.location())
            .field("registry", &self.registry)
            .field("holder", &self.holder)
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

/// Working snapshot after reading every record back from its provider.
#[derive(Debug, Clone)]
pub struct Refreshed {
    /// Snapshot with observed attributes; serial and lineage unchanged.
    pub snapshot: StateSnapshot,
    /// Records whose objects no longer exist.
    pub dropped: Vec<ResourceAddress>,
    /// Records whose observed attributes differ from the recorded ones.
    pub updated: Vec<ResourceAddress>,
}

impl Refreshed {
    /// Returns true if the refresh changed any record.
    #[must_use]
    pub fn changed(&self) -> bool {
        !self.dropped.is_empty() || !self.updated.is_empty()
    }
}

/// Result of a reconciliation run.
#[derive(Debug, Clone, Serialize)]
pub struct ReconcileReport {
    /// Plan/apply rounds made.
    pub attempts: u32,
    /// Records dropped by refresh because their objects were gone.
    pub dropped: Vec<ResourceAddress>,
    /// Records refreshed with drifted attributes.
    pub refreshed: Vec<ResourceAddress>,
    /// The plan of the last round.
    pub plan: Plan,
    /// Apply result of the last round; absent when nothing had to change.
    pub result: Option<ApplyResult>,
}

impl ReconcileReport {
    /// Returns true if the last round converged.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.result.as_ref().is_none_or(ApplyResult::is_success)
    }

    /// Process exit code, see [`ApplyResult::exit_code`].
    #[must_use]
    pub fn exit_code(&self) -> u8 {
        self.result.as_ref().map_or(0, ApplyResult::exit_code)
    }

    fn conflicted(&self) -> bool {
        self.result
            .as_ref()
            .is_some_and(|r| matches!(r.aborted, Some(AbortReason::Conflict(_))))
    }
}

impl std::fmt::Display for ReconcileReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = if self.is_success() { "successful" } else { "failed" };
        writeln!(f, "Reconciliation {status} after {} attempt(s):", self.attempts)?;
        if !self.dropped.is_empty() {
            writeln!(f, "  Gone from provider: {}", join(&self.dropped))?;
        }
        if !self.refreshed.is_empty() {
            writeln!(f, "  Refreshed: {}", join(&self.refreshed))?;
        }
        writeln!(f, "  Planned: {}", self.plan.summary())?;
        match &self.result {
            Some(result) => write!(f, "{result}"),
            None => write!(f, "  No changes required - state is converged"),
        }
    }
}

/// A record whose object changed outside the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DriftedResource {
    /// Resource address.
    pub address: ResourceAddress,
    /// Provider id.
    pub provider_id: String,
    /// Attributes whose observed value differs from the recorded one.
    pub fields: Vec<String>,
}

/// Report of drift detection.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DriftReport {
    /// Records whose observed attributes differ.
    pub drifted: Vec<DriftedResource>,
    /// Records whose objects are gone.
    pub missing: Vec<ResourceAddress>,
    /// Number of records checked.
    pub checked: usize,
}

impl DriftReport {
    /// Returns true if anything drifted or went missing.
    #[must_use]
    pub fn has_drift(&self) -> bool {
        !self.drifted.is_empty() || !self.missing.is_empty()
    }

    /// Returns true if the state is converged (no drift).
    #[must_use]
    pub fn is_converged(&self) -> bool {
        !self.has_drift()
    }
}

impl std::fmt::Display for DriftReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if !self.has_drift() {
            return write!(f, "No drift detected - {} resource(s) converged", self.checked);
        }
        writeln!(f, "Drift detected:")?;
        for resource in &self.drifted {
            writeln!(
                f,
                "  ~ {} ({}): {}",
                resource.address,
                resource.provider_id,
                resource.fields.join(", ")
            )?;
        }
        for address in &self.missing {
            writeln!(f, "  - {address}: no longer exists")?;
        }
        Ok(())
    }
}

fn join(addresses: &[ResourceAddress]) -> String {
    addresses
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl Reconciler {
    /// Creates a reconciler with default settings.
    #[must_use]
    pub fn new(graph: DependencyGraph, store: Arc<dyn StateStore>, registry: ProviderRegistry) -> Self {
        Self {
            graph,
            store,
            registry,
            options: ExecutorOptions::default(),
            config_hash: String::new(),
            holder: generate_holder_id(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Creates a reconciler for a configuration document.
    ///
    /// # Errors
    ///
    /// Returns an error if the declarations do not form a valid graph.
    pub fn from_config(
        config: &DeployConfig,
        store: Arc<dyn StateStore>,
        registry: ProviderRegistry,
    ) -> Result<Self> {
        Ok(Self::new(config.graph()?, store, registry)
            .with_options(executor_options(config))
            .with_config_hash(ContentHasher::hash_config(config))
            .with_max_attempts(config.engine.max_attempts))
    }

    /// Replaces the executor settings.
    #[must_use]
    pub fn with_options(mut self, options: ExecutorOptions) -> Self {
        self.options = options;
        self
    }

    /// Sets the configuration hash stamped on plans.
    #[must_use]
    pub fn with_config_hash(mut self, hash: impl Into<String>) -> Self {
        self.config_hash = hash.into();
        self
    }

    /// Sets the lock holder identifier.
    #[must_use]
    pub fn with_holder(mut self, holder: impl Into<String>) -> Self {
        self.holder = holder.into();
        self
    }

    /// Sets the maximum plan/apply rounds.
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Declared graph.
    #[must_use]
    pub const fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// State store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    fn executor(&self) -> Executor {
        Executor::new(Arc::clone(&self.store), self.registry.clone()).with_options(self.options.clone())
    }

    /// Reads every record back from its provider.
    ///
    /// Gone objects are dropped so the next plan recreates them. Observed
    /// attributes replace recorded ones, except `ignore_changes` fields,
    /// which keep their recorded values. Records of unsupported types are
    /// left alone for the planner to report.
    ///
    /// # Errors
    ///
    /// Returns the first provider error that is not `NotFound`, after
    /// retrying transient ones.
    pub async fn refresh(&self, snapshot: StateSnapshot) -> Result<Refreshed> {
        let cancel = CancellationToken::new();
        let mut refreshed = Refreshed {
            snapshot,
            dropped: Vec::new(),
            updated: Vec::new(),
        };

        let addresses: Vec<ResourceAddress> = refreshed.snapshot.records.keys().cloned().collect();
        for address in addresses {
            let Some(record) = refreshed.snapshot.records.get(&address) else {
                continue;
            };
            if record.is_tombstone() {
                continue;
            }
            if !self.registry.supports(&record.resource_type) {
                warn!(address = %address, "No provider for recorded type, not refreshing");
                continue;
            }
            let provider = self.registry.get(&record.resource_type)?;
            let adapter = provider.as_ref();
            let resource_type = record.resource_type.as_str();
            let id = record.provider_id.as_str();
            let label = format!("read {address}");
            let (observed, _) = self
                .options
                .retry
                .run(&label, &cancel, move || adapter.read(resource_type, id))
                .await;

            match observed {
                Ok(mut observed) => {
                    let ignored = self.ignored_fields(&address);
                    for field in &ignored {
                        match record.attributes.get(field) {
                            Some(value) => observed.insert(field.clone(), value.clone()),
                            None => observed.remove(field),
                        };
                    }
                    if observed != record.attributes {
                        debug!(address = %address, "Observed attributes differ from state");
                        let mut updated = record.clone();
                        updated.set_attributes(observed);
                        refreshed.snapshot.records.insert(address.clone(), updated);
                        refreshed.updated.push(address);
                    }
                }
                Err(e) if e.is_not_found() => {
                    info!(address = %address, id, "Object no longer exists, dropping from state");
                    if record.deposed.is_empty() {
                        refreshed.snapshot.records.remove(&address);
                    } else {
                        debug!(address = %address, deposed = ?record.deposed, "Keeping deposed objects tracked");
                        let tombstone = StateRecord::tombstone(record);
                        refreshed.snapshot.records.insert(address.clone(), tombstone);
                    }
                    refreshed.dropped.push(address);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(refreshed)
    }

    fn ignored_fields(&self, address: &ResourceAddress) -> BTreeSet<String> {
        self.graph
            .node(address)
            .map(|node| node.lifecycle.ignore_changes.clone())
            .unwrap_or_default()
    }

    /// Reads the state, refreshes it and plans. Writes nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be read, a refresh read fails, or
    /// planning fails.
    pub async fn plan(&self) -> Result<Plan> {
        let snapshot = self.store.read().await?;
        let refreshed = self.refresh(snapshot).await?;
        Planner::new(&self.registry).plan(&self.graph, &refreshed.snapshot, &self.config_hash)
    }

    /// Plans the removal of every recorded resource. Writes nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be read or a recorded resource
    /// is protected by `prevent_destroy`.
    pub async fn plan_destroy(&self) -> Result<Plan> {
        let snapshot = self.store.read().await?;
        let refreshed = self.refresh(snapshot).await?;
        Planner::new(&self.registry).plan_destroy(&refreshed.snapshot, &self.config_hash)
    }

    /// Applies a previously made plan under the state lock.
    ///
    /// The lock is released on every path.
    ///
    /// # Errors
    ///
    /// Returns `LockHeld` if another holder has the lock, `Conflict` if the
    /// state moved since the plan was made, or a store error.
    pub async fn apply(&self, plan: &Plan, cancel: &CancellationToken) -> Result<ApplyResult> {
        let lock = self.store.acquire_lock(&self.holder).await?;
        info!(lock_id = %lock.lock_id, holder = %lock.holder, "Acquired state lock");
        let result = self.executor().apply(plan, &lock, cancel).await;
        self.release(&lock).await;
        result
    }

    /// Converges the recorded resources on the declared graph.
    ///
    /// # Errors
    ///
    /// Returns `LockHeld` if another holder has the lock, the last
    /// `Conflict` once every round lost a race on the serial, or any
    /// refresh, planning or store error.
    pub async fn reconcile(&self, cancel: &CancellationToken) -> Result<ReconcileReport> {
        self.run(Mode::Converge, cancel).await
    }

    /// Deletes every recorded resource.
    ///
    /// # Errors
    ///
    /// Same as [`Reconciler::reconcile`], plus `PreventDestroy` for protected
    /// resources.
    pub async fn destroy(&self, cancel: &CancellationToken) -> Result<ReconcileReport> {
        self.run(Mode::Destroy, cancel).await
    }

    async fn run(&self, mode: Mode, cancel: &CancellationToken) -> Result<ReconcileReport> {
        info!(
            resources = self.graph.len(),
            store = %self.store.location(),
            ?mode,
            "Starting reconciliation"
        );

        let mut attempt = 1;
        loop {
            debug!("Reconciliation attempt {attempt}/{}", self.max_attempts);
            let lock = self.store.acquire_lock(&self.holder).await?;
            let outcome = self.run_locked(mode, &lock, cancel, attempt).await;
            self.release(&lock).await;

            let retry = attempt < self.max_attempts && !cancel.is_cancelled();
            match outcome {
                Ok(report) if report.conflicted() && retry => {
                    warn!(attempt, "State changed during apply, re-planning");
                }
                Err(e) if e.is_conflict() && retry => {
                    warn!(attempt, error = %e, "State changed before apply, re-planning");
                }
                Ok(report) => {
                    if report.is_success() {
                        info!(attempts = attempt, "Reconciliation complete");
                    } else {
                        warn!(attempts = attempt, "Reconciliation incomplete");
                    }
                    return Ok(report);
                }
                Err(e) => {
                    error!(attempt, error = %e, "Reconciliation failed");
                    return Err(e);
                }
            }
            attempt += 1;
        }
    }

    async fn run_locked(
        &self,
        mode: Mode,
        lock: &Lock,
        cancel: &CancellationToken,
        attempt: u32,
    ) -> Result<ReconcileReport> {
        let snapshot = self.store.read().await?;
        let mut refreshed = self.refresh(snapshot).await?;

        if refreshed.changed() {
            let serial = self
                .store
                .commit(&refreshed.snapshot.records, refreshed.snapshot.serial)
                .await?;
            info!(
                dropped = refreshed.dropped.len(),
                updated = refreshed.updated.len(),
                serial,
                "Committed refreshed state"
            );
            refreshed.snapshot.serial = serial;
        }

        let planner = Planner::new(&self.registry);
        let plan = match mode {
            Mode::Converge => planner.plan(&self.graph, &refreshed.snapshot, &self.config_hash)?,
            Mode::Destroy => planner.plan_destroy(&refreshed.snapshot, &self.config_hash)?,
        };
        info!(summary = %plan.summary(), "Planned changes");

        let result = if plan.has_changes() {
            Some(self.executor().apply(&plan, lock, cancel).await?)
        } else {
            None
        };

        Ok(ReconcileReport {
            attempts: attempt,
            dropped: refreshed.dropped,
            refreshed: refreshed.updated,
            plan,
            result,
        })
    }

    async fn release(&self, lock: &Lock) {
        match self.store.release_lock(lock).await {
            Ok(()) => debug!(lock_id = %lock.lock_id, "Released state lock"),
            Err(e) => error!(lock_id = %lock.lock_id, error = %e, "Failed to release state lock"),
        }
    }

    /// Compares every record with what its provider reports.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be read or a provider read fails
    /// with anything other than `NotFound`.
    pub async fn check_drift(&self) -> Result<DriftReport> {
        let snapshot = self.store.read().await?;
        let cancel = CancellationToken::new();
        let mut report = DriftReport::default();

        for (address, record) in snapshot.records.iter().filter(|(_, r)| !r.is_tombstone()) {
            report.checked += 1;
            let provider = self.registry.get(&record.resource_type)?;
            let adapter = provider.as_ref();
            let resource_type = record.resource_type.as_str();
            let id = record.provider_id.as_str();
            let label = format!("read {address}");
            let (observed, _) = self
                .options
                .retry
                .run(&label, &cancel, move || adapter.read(resource_type, id))
                .await;

            match observed {
                Ok(observed) => {
                    if ContentHasher::hash_attributes(&observed) == record.content_hash {
                        continue;
                    }
                    let fields = drifted_fields(record, &observed, &self.ignored_fields(address));
                    if !fields.is_empty() {
                        report.drifted.push(DriftedResource {
                            address: address.clone(),
                            provider_id: record.provider_id.clone(),
                            fields,
                        });
                    }
                }
                Err(e) if e.is_not_found() => report.missing.push(address.clone()),
                Err(e) => return Err(e),
            }
        }

        info!(
            checked = report.checked,
            drifted = report.drifted.len(),
            missing = report.missing.len(),
            "Drift check complete"
        );
        Ok(report)
    }
}

fn drifted_fields(
    record: &StateRecord,
    observed: &crate::model::Attributes,
    ignored: &BTreeSet<String>,
) -> Vec<String> {
    record
        .attributes
        .keys()
        .chain(observed.keys())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .filter(|field| !ignored.contains(*field))
        .filter(|field| record.attributes.get(*field) != observed.get(*field))
        .cloned()
        .collect()
}

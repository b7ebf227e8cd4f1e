//! Plan execution.
//!
//! The executor walks a [`Plan`] level by level. Inside a level, actions run
//! concurrently on a `JoinSet`, bounded by a `Semaphore`; levels are separated
//! by a strict barrier. Each successful provider write is committed to the
//! state store immediately, so an interrupted apply loses at most the calls
//! in flight.
//!
//! Order of passes:
//!
//! 1. Forward: create, update, replace and noop actions by dependency level.
//! 2. Deposed: deletion of objects left behind by create-before-destroy.
//! 3. Removal: deletion of resources removed from configuration, dependents
//!    first.
//!
//! The two delete passes only run when the forward pass fully succeeded.

mod outcome;
mod retry;
mod task;

pub use outcome::{AbortReason, ActionOutcome, ActionStatus, ApplyResult};
pub use retry::RetryPolicy;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{ApplyError, KeystoneError, Result, StateError};
use crate::model::{NodeOutputs, ResourceAddress, Scope};
use crate::planner::{ChangeAction, ChangeKind, Pass, Plan};
use crate::provider::ProviderRegistry;
use crate::state::{Lock, StateStore};

use task::{ActionTask, Ledger, TaskOutput};

/// Default number of actions running at once within a level.
pub const DEFAULT_PARALLELISM: usize = 10;

/// Default interval between lock heartbeats.
pub const DEFAULT_HEARTBEAT_SECS: u64 = 30;

/// Executor settings.
#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    /// Maximum concurrent actions within a level.
    pub parallelism: usize,
    /// Retry policy for transient provider errors.
    pub retry: RetryPolicy,
    /// Interval between lock heartbeats.
    pub heartbeat_interval: Duration,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            parallelism: DEFAULT_PARALLELISM,
            retry: RetryPolicy::default(),
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_SECS),
        }
    }
}

/// Applies plans against providers and the state store.
pub struct Executor {
    store: Arc<dyn StateStore>,
    registry: ProviderRegistry,
    options: ExecutorOptions,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("store", &self.store.location())
            .field("registry", &self.registry)
            .field("options", &self.options)
            .finish()
    }
}

/// Shared signals of one apply.
struct RunContext {
    ledger: Arc<Mutex<Ledger>>,
    semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
    stop: CancellationToken,
    abort: Arc<std::sync::Mutex<Option<AbortReason>>>,
}

impl RunContext {
    fn record_abort(&self, reason: AbortReason) {
        record_abort(&self.abort, reason);
        self.stop.cancel();
    }

    fn stop_reason(&self) -> String {
        if self.cancel.is_cancelled() {
            return String::from("apply cancelled");
        }
        match self.abort.lock().ok().and_then(|slot| slot.clone()) {
            Some(reason) => format!("apply aborted: {reason}"),
            None => String::from("apply aborted"),
        }
    }
}

fn record_abort(slot: &std::sync::Mutex<Option<AbortReason>>, reason: AbortReason) {
    if let Ok(mut slot) = slot.lock()
        && slot.is_none()
    {
        *slot = Some(reason);
    }
}

/// Outcomes plus the outputs known so far.
struct Progress {
    order: Vec<String>,
    outcomes: HashMap<String, ActionOutcome>,
    scope: Scope,
}

impl Progress {
    fn new(plan: &Plan) -> Self {
        let forward = plan
            .actions
            .iter()
            .filter(|a| a.pass() == Pass::Forward)
            .map(|a| &a.address);
        Self {
            order: plan.actions.iter().map(ChangeAction::key).collect(),
            outcomes: plan
                .actions
                .iter()
                .map(|a| (a.key(), ActionOutcome::pending(a)))
                .collect(),
            scope: Scope::new(forward)
                .with_empty_groups(plan.empty_groups.iter().map(String::as_str)),
        }
    }

    fn set(&mut self, key: &str, status: ActionStatus, error: Option<String>) {
        let Some(outcome) = self.outcomes.get_mut(key) else {
            return;
        };
        match outcome.transition(status) {
            Ok(()) => {
                if error.is_some() {
                    outcome.error = error;
                }
            }
            Err(e) => warn!(error = %e, "Ignored invalid action transition"),
        }
    }

    fn skip(&mut self, key: &str, reason: String) {
        debug!(action = key, reason = %reason, "Skipping action");
        self.set(key, ActionStatus::Skipped, Some(reason));
    }

    fn fail_before_start(&mut self, key: &str, error: &KeystoneError) {
        error!(action = key, error = %error, "Action failed");
        self.set(key, ActionStatus::Running, None);
        self.set(key, ActionStatus::Failed, Some(error.to_string()));
    }

    /// First dependency that failed or was skipped.
    fn blocked_by<'a>(&self, action: &'a ChangeAction) -> Option<&'a ResourceAddress> {
        action.dependencies.iter().find(|dep| {
            self.outcomes.get(&dep.to_string()).is_some_and(|o| {
                matches!(o.status, ActionStatus::Failed | ActionStatus::Skipped)
            })
        })
    }

    fn pass_succeeded(&self, plan: &Plan, pass: Pass) -> bool {
        plan.actions
            .iter()
            .filter(|a| a.pass() == pass)
            .all(|a| {
                self.outcomes
                    .get(&a.key())
                    .is_some_and(|o| o.status == ActionStatus::Succeeded)
            })
    }

    fn into_outcomes(mut self) -> Vec<ActionOutcome> {
        self.order
            .iter()
            .filter_map(|key| self.outcomes.remove(key))
            .collect()
    }
}

impl Executor {
    /// Creates an executor with default options.
    #[must_use]
    pub fn new(store: Arc<dyn StateStore>, registry: ProviderRegistry) -> Self {
        Self {
            store,
            registry,
            options: ExecutorOptions::default(),
        }
    }

    /// Replaces the options.
    #[must_use]
    pub fn with_options(mut self, options: ExecutorOptions) -> Self {
        self.options = options;
        self
    }

    /// Sets the parallelism bound.
    #[must_use]
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.options.parallelism = parallelism.max(1);
        self
    }

    /// Current options.
    #[must_use]
    pub const fn options(&self) -> &ExecutorOptions {
        &self.options
    }

    /// Applies `plan` while holding `lock`.
    ///
    /// The caller owns the lock and must release it afterwards, whatever the
    /// outcome.
    ///
    /// # Errors
    ///
    /// Returns `StateError::Conflict` if the stored serial moved since the
    /// plan was made, `ApplyError::Aborted` if the plan belongs to another
    /// state lineage, or a store error if the state cannot be read. Failures
    /// of individual actions are reported in the [`ApplyResult`] instead.
    pub async fn apply(
        &self,
        plan: &Plan,
        lock: &Lock,
        cancel: &CancellationToken,
    ) -> Result<ApplyResult> {
        let started = Instant::now();
        let snapshot = self.store.read().await?;
        if snapshot.serial != plan.based_on_serial {
            return Err(StateError::Conflict {
                expected: plan.based_on_serial,
                found: snapshot.serial,
            }
            .into());
        }
        if snapshot.serial > 0 && snapshot.lineage != plan.lineage {
            return Err(ApplyError::Aborted {
                reason: format!(
                    "plan was made for state lineage {} but the store holds {}",
                    plan.lineage, snapshot.lineage
                ),
            }
            .into());
        }

        let initial_serial = snapshot.serial;
        info!(
            summary = %plan.summary(),
            serial = initial_serial,
            parallelism = self.options.parallelism,
            "Applying plan"
        );

        let ctx = RunContext {
            ledger: Arc::new(Mutex::new(Ledger {
                records: snapshot.records,
                serial: snapshot.serial,
            })),
            semaphore: Arc::new(Semaphore::new(self.options.parallelism.max(1))),
            cancel: cancel.clone(),
            stop: cancel.child_token(),
            abort: Arc::new(std::sync::Mutex::new(None)),
        };
        let heartbeat_done = CancellationToken::new();
        let heartbeat = self.spawn_heartbeat(lock.clone(), heartbeat_done.clone(), &ctx);

        let mut progress = Progress::new(plan);
        for level in plan.levels(Pass::Forward) {
            self.run_level(&level, &mut progress, &ctx).await;
        }

        let forward_clean = progress.pass_succeeded(plan, Pass::Forward) && !ctx.stop.is_cancelled();
        for pass in [Pass::Deposed, Pass::Removal] {
            for level in plan.levels(pass) {
                if forward_clean {
                    self.run_level(&level, &mut progress, &ctx).await;
                } else {
                    for action in level {
                        progress.skip(&action.key(), String::from("skipped due to earlier failures"));
                    }
                }
            }
        }

        heartbeat_done.cancel();
        if let Err(e) = heartbeat.await {
            warn!(error = %e, "Heartbeat task ended abnormally");
        }

        let final_serial = ctx.ledger.lock().await.serial;
        let aborted = ctx.abort.lock().ok().and_then(|slot| slot.clone());
        let result = ApplyResult {
            outcomes: progress.into_outcomes(),
            initial_serial,
            final_serial,
            cancelled: cancel.is_cancelled(),
            aborted,
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        };

        if result.is_success() {
            info!(
                succeeded = result.succeeded(),
                serial = final_serial,
                "Apply complete"
            );
        } else {
            warn!(
                succeeded = result.succeeded(),
                failed = result.failed(),
                skipped = result.skipped(),
                serial = final_serial,
                "Apply incomplete"
            );
        }
        Ok(result)
    }

    /// Dispatches one level and waits for all of it.
    async fn run_level(&self, level: &[&ChangeAction], progress: &mut Progress, ctx: &RunContext) {
        let mut join_set = JoinSet::new();
        let mut addresses: BTreeMap<String, ResourceAddress> = BTreeMap::new();

        for action in level {
            let key = action.key();
            if ctx.stop.is_cancelled() {
                progress.skip(&key, ctx.stop_reason());
                continue;
            }
            if let Some(dep) = progress.blocked_by(action) {
                progress.skip(&key, format!("skipped due to dependency failure ({dep})"));
                continue;
            }
            if action.kind == ChangeKind::Noop {
                progress.set(&key, ActionStatus::Running, None);
                progress.set(&key, ActionStatus::Succeeded, None);
                if let Some(prior) = &action.prior {
                    progress
                        .scope
                        .insert(action.address.clone(), NodeOutputs::known(prior.attributes.clone()));
                    if let Some(outcome) = progress.outcomes.get_mut(&key) {
                        outcome.provider_id = Some(prior.provider_id.clone());
                    }
                }
                continue;
            }

            let provider = match self.registry.get(&action.resource_type) {
                Ok(provider) => provider,
                Err(e) => {
                    progress.fail_before_start(&key, &e);
                    continue;
                }
            };
            let resolved = if action.pass() == Pass::Forward {
                match progress.scope.resolve_all(&action.desired) {
                    Ok(resolved) => resolved,
                    Err(message) => {
                        let e = KeystoneError::from(ApplyError::UnresolvedReference {
                            address: action.address.to_string(),
                            message,
                        });
                        progress.fail_before_start(&key, &e);
                        continue;
                    }
                }
            } else {
                BTreeMap::new()
            };
            let immutable = if action.kind == ChangeKind::Update {
                self.registry
                    .immutable_fields(&action.resource_type)
                    .unwrap_or_default()
            } else {
                BTreeSet::new()
            };

            progress.set(&key, ActionStatus::Running, None);
            addresses.insert(key, action.address.clone());
            join_set.spawn(
                ActionTask {
                    action: (*action).clone(),
                    resolved,
                    immutable,
                    provider,
                    store: Arc::clone(&self.store),
                    ledger: Arc::clone(&ctx.ledger),
                    retry: self.options.retry.clone(),
                    stop: ctx.stop.clone(),
                    semaphore: Arc::clone(&ctx.semaphore),
                }
                .run(),
            );
        }

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((key, TaskOutput::Done {
                    attempts,
                    provider_id,
                    outputs,
                })) => {
                    progress.set(&key, ActionStatus::Succeeded, None);
                    if let Some(outcome) = progress.outcomes.get_mut(&key) {
                        outcome.attempts = attempts;
                        outcome.provider_id = provider_id;
                    }
                    if let (Some(outputs), Some(address)) = (outputs, addresses.get(&key)) {
                        progress.scope.insert(address.clone(), NodeOutputs::known(outputs));
                    }
                    info!(action = %key, attempts, "Action succeeded");
                }
                Ok((key, TaskOutput::Failed { attempts, error })) => {
                    if matches!(error, KeystoneError::State(_)) {
                        ctx.record_abort(AbortReason::from_error(&error));
                    }
                    progress.set(&key, ActionStatus::Failed, Some(error.to_string()));
                    if let Some(outcome) = progress.outcomes.get_mut(&key) {
                        outcome.attempts = attempts;
                    }
                }
                Ok((key, TaskOutput::NotStarted)) => {
                    progress.skip(&key, ctx.stop_reason());
                }
                Err(e) => {
                    error!(error = %e, "Action task panicked");
                }
            }
        }

        // Tasks that panicked never reported back.
        for key in addresses.keys() {
            if progress
                .outcomes
                .get(key)
                .is_some_and(|o| o.status == ActionStatus::Running)
            {
                progress.set(key, ActionStatus::Failed, Some(String::from("worker task panicked")));
            }
        }
    }

    fn spawn_heartbeat(
        &self,
        lock: Lock,
        done: CancellationToken,
        ctx: &RunContext,
    ) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let interval = self.options.heartbeat_interval;
        let stop = ctx.stop.clone();
        let abort = Arc::clone(&ctx.abort);

        tokio::spawn(async move {
            let mut current = lock;
            loop {
                tokio::select! {
                    () = done.cancelled() => break,
                    () = tokio::time::sleep(interval) => {}
                }
                match store.heartbeat(&current).await {
                    Ok(refreshed) => {
                        debug!(lock_id = %refreshed.lock_id, "Lock heartbeat");
                        current = refreshed;
                    }
                    Err(KeystoneError::State(StateError::LockNotHeld { lock_id })) => {
                        error!(lock_id = %lock_id, "Lock lost during apply, stopping dispatch");
                        record_abort(
                            &abort,
                            AbortReason::LockLost(format!("lock {lock_id} is no longer held")),
                        );
                        stop.cancel();
                        break;
                    }
                    Err(e) => warn!(error = %e, "Lock heartbeat failed"),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::DependencyGraph;
    use crate::model::{AttrValue, ResourceNode};
    use crate::planner::Planner;
    use crate::provider::{FailureRule, MemoryProvider, Operation};
    use crate::state::{MemoryStateStore, Records};
    use serde_json::{Value, json};

    struct Harness {
        provider: MemoryProvider,
        registry: ProviderRegistry,
        store: MemoryStateStore,
    }

    fn node(address: &str, attrs: Value) -> ResourceNode {
        let mut node = ResourceNode::new(ResourceAddress::parse(address).unwrap());
        for (k, v) in attrs.as_object().unwrap() {
            node = node.with_attribute(k.clone(), AttrValue::parse(v).unwrap());
        }
        node
    }

    fn harness(provider: MemoryProvider) -> Harness {
        let mut registry = ProviderRegistry::new();
        registry.set_fallback(Arc::new(provider.clone()));
        Harness {
            provider,
            registry,
            store: MemoryStateStore::new(),
        }
    }

    fn fast_options(parallelism: usize) -> ExecutorOptions {
        ExecutorOptions {
            parallelism,
            retry: RetryPolicy {
                max_attempts: 4,
                initial_backoff_ms: 1,
                max_backoff_ms: 5,
                multiplier: 2.0,
            },
            heartbeat_interval: Duration::from_millis(20),
        }
    }

    impl Harness {
        async fn plan(&self, nodes: Vec<ResourceNode>) -> Plan {
            let graph = DependencyGraph::build(nodes).unwrap();
            let snapshot = self.store.read().await.unwrap();
            Planner::new(&self.registry).plan(&graph, &snapshot, "h").unwrap()
        }

        async fn apply_with(&self, plan: &Plan, parallelism: usize, cancel: &CancellationToken) -> ApplyResult {
            let lock = self.store.acquire_lock("test").await.unwrap();
            let executor = Executor::new(Arc::new(self.store.clone()), self.registry.clone())
                .with_options(fast_options(parallelism));
            let result = executor.apply(plan, &lock, cancel).await.unwrap();
            self.store.release_lock(&lock).await.unwrap();
            result
        }

        async fn apply(&self, plan: &Plan) -> ApplyResult {
            self.apply_with(plan, 4, &CancellationToken::new()).await
        }

        async fn records(&self) -> Records {
            self.store.read().await.unwrap().records
        }
    }

    fn chain() -> Vec<ResourceNode> {
        vec![
            node("aws_vpc.main", json!({"name": "vpc", "cidr": "10.0.0.0/16"})),
            node("aws_subnet.a", json!({"name": "subnet", "vpc_id": "${aws_vpc.main.id}"})),
            node("aws_instance.vm", json!({"name": "vm", "subnet_id": "${aws_subnet.a.id}"})),
        ]
    }

    fn addr(s: &str) -> ResourceAddress {
        ResourceAddress::parse(s).unwrap()
    }

    fn position(calls: &[crate::provider::Call], operation: Operation, target: &str) -> usize {
        calls
            .iter()
            .position(|c| c.operation == operation && c.target == target)
            .unwrap()
    }

    #[tokio::test]
    async fn test_chain_creates_and_converges() {
        let h = harness(MemoryProvider::new());
        let plan = h.plan(chain()).await;
        let result = h.apply(&plan).await;

        assert!(result.is_success());
        assert_eq!(result.exit_code(), 0);
        assert_eq!((result.initial_serial, result.final_serial), (0, 3));

        let records = h.records().await;
        assert_eq!(records.len(), 3);
        let vpc_id = &records[&addr("aws_vpc.main")].provider_id;
        assert_eq!(
            records[&addr("aws_subnet.a")].attributes["vpc_id"],
            json!(vpc_id)
        );
        assert_eq!(
            records[&addr("aws_subnet.a")].dependencies,
            vec![addr("aws_vpc.main")]
        );

        let next = h.plan(chain()).await;
        assert!(!next.has_changes());
    }

    #[tokio::test]
    async fn test_splat_over_zero_count_group_applies_empty_list() {
        let h = harness(MemoryProvider::new());
        let lb = node("aws_lb.main", json!({"name": "lb", "targets": "${aws_instance.pool[*].id}"}));
        let graph =
            DependencyGraph::build_with_groups(vec![lb], [String::from("aws_instance.pool")])
                .unwrap();
        let snapshot = h.store.read().await.unwrap();
        let plan = Planner::new(&h.registry).plan(&graph, &snapshot, "h").unwrap();

        let saved: Plan = serde_json::from_str(&serde_json::to_string(&plan).unwrap()).unwrap();
        let result = h.apply(&saved).await;

        assert!(result.is_success());
        let records = h.records().await;
        assert_eq!(records[&addr("aws_lb.main")].attributes["targets"], json!([]));
    }

    #[tokio::test]
    async fn test_middle_failure_skips_downstream() {
        let provider = MemoryProvider::new();
        provider.fail(FailureRule::permanent(Operation::Create).matching("name", "subnet"));
        let h = harness(provider);

        let plan = h.plan(chain()).await;
        let result = h.apply(&plan).await;

        assert_eq!(result.outcome("aws_vpc.main").unwrap().status, ActionStatus::Succeeded);
        assert_eq!(result.outcome("aws_subnet.a").unwrap().status, ActionStatus::Failed);
        let vm = result.outcome("aws_instance.vm").unwrap();
        assert_eq!(vm.status, ActionStatus::Skipped);
        assert!(vm.error.as_deref().unwrap().contains("dependency failure"));
        assert_eq!(result.exit_code(), 2);

        let records = h.records().await;
        assert_eq!(records.len(), 1);
        assert!(records.contains_key(&addr("aws_vpc.main")));
        assert_eq!(result.final_serial, 1);
    }

    #[tokio::test]
    async fn test_failure_is_contained_to_its_branch() {
        let provider = MemoryProvider::new();
        provider.fail(FailureRule::permanent(Operation::Create).matching("name", "a"));
        let h = harness(provider);

        let plan = h
            .plan(vec![
                node("svc.a", json!({"name": "a"})),
                node("svc.b", json!({"name": "b", "upstream": "${svc.a.id}"})),
                node("svc.c", json!({"name": "c"})),
            ])
            .await;
        let result = h.apply(&plan).await;

        assert_eq!(result.outcome("svc.a").unwrap().status, ActionStatus::Failed);
        assert_eq!(result.outcome("svc.b").unwrap().status, ActionStatus::Skipped);
        assert_eq!(result.outcome("svc.c").unwrap().status, ActionStatus::Succeeded);
        assert_eq!(h.records().await.len(), 1);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let provider = MemoryProvider::new();
        provider.fail(
            FailureRule::transient(Operation::Create)
                .matching("name", "vpc")
                .times(2),
        );
        let h = harness(provider);

        let plan = h.plan(chain()).await;
        let result = h.apply(&plan).await;

        assert!(result.is_success());
        assert_eq!(result.outcome("aws_vpc.main").unwrap().attempts, 3);
        assert_eq!(result.outcome("aws_subnet.a").unwrap().attempts, 1);
    }

    #[tokio::test]
    async fn test_stale_plan_is_rejected() {
        let h = harness(MemoryProvider::new());
        let plan = h.plan(chain()).await;
        h.store.commit(&Records::new(), 0).await.unwrap();

        let lock = h.store.acquire_lock("test").await.unwrap();
        let executor = Executor::new(Arc::new(h.store.clone()), h.registry.clone());
        let err = executor
            .apply(&plan, &lock, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert!(h.provider.calls().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_apply_skips_everything() {
        let h = harness(MemoryProvider::new());
        let plan = h.plan(chain()).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = h.apply_with(&plan, 4, &cancel).await;
        assert!(result.cancelled);
        assert_eq!(result.skipped(), 3);
        assert!(result
            .outcomes
            .iter()
            .all(|o| o.error.as_deref() == Some("apply cancelled")));
        assert!(h.provider.calls().is_empty());
        assert_eq!(result.exit_code(), 2);
    }

    #[tokio::test]
    async fn test_create_before_destroy_replacement() {
        let provider = MemoryProvider::new().with_immutable("aws_vpc", ["cidr"]);
        let h = harness(provider);
        h.apply(&h.plan(chain()).await).await;
        let old_id = h.records().await[&addr("aws_vpc.main")].provider_id.clone();

        let mut nodes = chain();
        nodes[0] = node("aws_vpc.main", json!({"name": "vpc", "cidr": "10.1.0.0/16"}));
        nodes[0].lifecycle.create_before_destroy = true;
        let plan = h.plan(nodes.clone()).await;
        assert_eq!(plan.summary().replace, 1);
        assert_eq!(plan.summary().delete, 1);

        let result = h.apply(&plan).await;
        assert!(result.is_success(), "{result}");

        let records = h.records().await;
        let vpc = &records[&addr("aws_vpc.main")];
        assert_ne!(vpc.provider_id, old_id);
        assert!(vpc.deposed.is_empty());
        assert_eq!(
            records[&addr("aws_subnet.a")].attributes["vpc_id"],
            json!(vpc.provider_id)
        );

        let calls = h.provider.calls();
        let subnet_id = records[&addr("aws_subnet.a")].provider_id.clone();
        let update = position(&calls, Operation::Update, &subnet_id);
        let delete_old = position(&calls, Operation::Delete, &old_id);
        assert!(update < delete_old);
        assert!(!h.provider.objects().contains_key(&old_id));
        assert!(!h.plan(nodes).await.has_changes());
    }

    #[tokio::test]
    async fn test_destroy_before_create_replacement() {
        let provider = MemoryProvider::new().with_immutable("aws_vpc", ["cidr"]);
        let h = harness(provider);
        let first = vec![node("aws_vpc.main", json!({"name": "vpc", "cidr": "10.0.0.0/16"}))];
        h.apply(&h.plan(first).await).await;
        let old_id = h.records().await[&addr("aws_vpc.main")].provider_id.clone();

        let second = vec![node("aws_vpc.main", json!({"name": "vpc", "cidr": "10.1.0.0/16"}))];
        let result = h.apply(&h.plan(second).await).await;
        assert!(result.is_success());
        assert_eq!(result.commits(), 2);

        let calls = h.provider.calls();
        let creates: Vec<usize> = calls
            .iter()
            .enumerate()
            .filter(|(_, c)| c.operation == Operation::Create)
            .map(|(i, _)| i)
            .collect();
        assert!(position(&calls, Operation::Delete, &old_id) < creates[1]);
        assert_eq!(h.provider.objects().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_destroy_before_create_keeps_deposed_tracked() {
        let provider = MemoryProvider::new().with_immutable("aws_vpc", ["cidr"]);
        let h = harness(provider.clone());
        h.apply(&h.plan(vec![node("aws_vpc.main", json!({"name": "vpc", "cidr": "10.0.0.0/16"}))]).await)
            .await;

        let snapshot = h.store.read().await.unwrap();
        let mut records = snapshot.records;
        records
            .get_mut(&addr("aws_vpc.main"))
            .unwrap()
            .deposed
            .push(String::from("vpc-orphan"));
        h.store.commit(&records, snapshot.serial).await.unwrap();

        provider.fail(FailureRule::permanent(Operation::Create).matching("name", "vpc"));
        let second = vec![node("aws_vpc.main", json!({"name": "vpc", "cidr": "10.1.0.0/16"}))];
        let result = h.apply(&h.plan(second.clone()).await).await;
        assert_eq!(result.outcome("aws_vpc.main").unwrap().status, ActionStatus::Failed);

        let records = h.records().await;
        let vpc = &records[&addr("aws_vpc.main")];
        assert!(vpc.is_tombstone());
        assert_eq!(vpc.deposed, vec![String::from("vpc-orphan")]);

        provider.clear_failures();
        let plan = h.plan(second.clone()).await;
        assert_eq!(plan.summary().create, 1);
        assert_eq!(plan.summary().delete, 1);
        let result = h.apply(&plan).await;
        assert!(result.is_success(), "{result}");

        let records = h.records().await;
        let vpc = &records[&addr("aws_vpc.main")];
        assert!(!vpc.is_tombstone());
        assert!(vpc.deposed.is_empty());
        assert!(!h.plan(second).await.has_changes());
    }

    #[tokio::test]
    async fn test_removed_resources_deleted_dependents_first() {
        let h = harness(MemoryProvider::new());
        h.apply(&h.plan(chain()).await).await;
        let records = h.records().await;
        let vpc_id = records[&addr("aws_vpc.main")].provider_id.clone();
        let vm_id = records[&addr("aws_instance.vm")].provider_id.clone();

        let plan = h.plan(Vec::new()).await;
        assert_eq!(plan.summary().delete, 3);
        let result = h.apply(&plan).await;
        assert!(result.is_success());

        let calls = h.provider.calls();
        assert!(position(&calls, Operation::Delete, &vm_id) < position(&calls, Operation::Delete, &vpc_id));
        assert!(h.records().await.is_empty());
        assert!(h.provider.objects().is_empty());
    }

    #[tokio::test]
    async fn test_delete_of_vanished_object_succeeds() {
        let h = harness(MemoryProvider::new());
        let nodes = vec![node("aws_vpc.main", json!({"name": "vpc"}))];
        h.apply(&h.plan(nodes).await).await;
        let id = h.records().await[&addr("aws_vpc.main")].provider_id.clone();
        h.provider.remove(&id);

        let result = h.apply(&h.plan(Vec::new()).await).await;
        assert!(result.is_success());
        assert!(h.records().await.is_empty());
    }

    #[tokio::test]
    async fn test_parallelism_is_bounded() {
        let provider = MemoryProvider::new().with_delay(Duration::from_millis(20));
        let h = harness(provider);
        let nodes: Vec<ResourceNode> = (0..6)
            .map(|i| node(&format!("svc.s{i}"), json!({"name": format!("s{i}")})))
            .collect();

        let plan = h.plan(nodes).await;
        let result = h.apply_with(&plan, 2, &CancellationToken::new()).await;
        assert!(result.is_success());
        assert_eq!(result.final_serial, 6);
        assert!(h.provider.max_concurrency() <= 2);
    }

    #[tokio::test]
    async fn test_delete_pass_skipped_after_forward_failure() {
        let provider = MemoryProvider::new();
        let h = harness(provider.clone());
        h.apply(&h.plan(vec![node("svc.old", json!({"name": "old"}))]).await).await;

        provider.fail(FailureRule::permanent(Operation::Create).matching("name", "new"));
        let plan = h.plan(vec![node("svc.new", json!({"name": "new"}))]).await;
        let result = h.apply(&plan).await;

        assert_eq!(result.outcome("svc.new").unwrap().status, ActionStatus::Failed);
        assert_eq!(result.outcome("svc.old").unwrap().status, ActionStatus::Skipped);
        assert!(h.records().await.contains_key(&addr("svc.old")));
    }
}

//! Plan computation.
//!
//! [`Planner`] is a pure function of a dependency graph, a state snapshot and
//! the provider schemas. It never calls a provider; refreshing recorded
//! attributes is the caller's job.

use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

use super::diff::{AttributeChange, creation_changes, diff_attributes, requires_replace};
use super::plan::{ChangeAction, ChangeKind, Plan, ReplaceOrder};
use crate::error::{PlanError, Result};
use crate::graph::{DependencyGraph, removal_levels};
use crate::model::{
    Attributes, LifecyclePolicy, NodeOutputs, ResourceAddress, Scope, split_resolved,
};
use crate::provider::ProviderRegistry;
use crate::state::{StateRecord, StateSnapshot};

/// Computes change plans.
#[derive(Debug, Clone, Copy)]
pub struct Planner<'a> {
    registry: &'a ProviderRegistry,
}

impl<'a> Planner<'a> {
    /// Creates a planner reading schemas from `registry`.
    #[must_use]
    pub const fn new(registry: &'a ProviderRegistry) -> Self {
        Self { registry }
    }

    /// Diffs the declared graph against a snapshot.
    ///
    /// # Errors
    ///
    /// - `PlanError::MissingProvider` if a type has no adapter.
    /// - `PlanError::PreventDestroy` if a protected resource would be deleted
    ///   or replaced.
    /// - `PlanError::UnresolvedReference` if a reference names a missing
    ///   attribute of a resource whose outputs are fully known.
    pub fn plan(
        &self,
        graph: &DependencyGraph,
        snapshot: &StateSnapshot,
        config_hash: &str,
    ) -> Result<Plan> {
        let order = graph.topological_order()?;
        let depths = graph.depths()?;
        let mut scope = Scope::new(graph.addresses()).with_empty_groups(graph.empty_groups());
        let mut actions = Vec::with_capacity(order.len());

        for address in &order {
            let Some(node) = graph.node(address) else {
                continue;
            };
            let immutable = self.immutable_fields(node.resource_type(), address)?;
            let resolved = scope
                .resolve_all(&node.attributes)
                .map_err(|message| PlanError::UnresolvedReference {
                    address: address.to_string(),
                    message,
                })?;
            let (known, unknown) = split_resolved(&resolved);
            let prior = snapshot.get(address).filter(|r| !r.is_tombstone());

            let (kind, changes, outputs, reason) = match prior {
                None => (
                    ChangeKind::Create,
                    creation_changes(&resolved),
                    NodeOutputs::pending(known),
                    String::from("not in state"),
                ),
                Some(record) => {
                    let changes = diff_attributes(
                        record,
                        &resolved,
                        &node.lifecycle.ignore_changes,
                        &immutable,
                    );
                    if changes.is_empty() {
                        (
                            ChangeKind::Noop,
                            changes,
                            NodeOutputs::known(record.attributes.clone()),
                            String::from("up to date"),
                        )
                    } else if requires_replace(&changes) {
                        if node.lifecycle.prevent_destroy {
                            return Err(PlanError::PreventDestroy {
                                address: address.to_string(),
                                action: String::from("replace"),
                            }
                            .into());
                        }
                        let fields: Vec<&str> = changes
                            .iter()
                            .filter(|c| c.requires_replace)
                            .map(|c| c.field.as_str())
                            .collect();
                        let reason = format!("immutable field changed: {}", fields.join(", "));
                        (ChangeKind::Replace, changes, NodeOutputs::pending(known), reason)
                    } else {
                        let outputs = updated_outputs(record, &changes, known, unknown);
                        let reason = format!("{} field(s) changed", changes.len());
                        (ChangeKind::Update, changes, outputs, reason)
                    }
                }
            };

            debug!(address = %address, kind = %kind, "Planned action");
            scope.insert(address.clone(), outputs);

            let replace_order = (kind == ChangeKind::Replace).then(|| {
                if node.lifecycle.create_before_destroy {
                    ReplaceOrder::CreateBeforeDestroy
                } else {
                    ReplaceOrder::DestroyBeforeCreate
                }
            });

            actions.push(ChangeAction {
                address: address.clone(),
                resource_type: node.resource_type().to_string(),
                kind,
                changes,
                desired: node.attributes.clone(),
                prior: prior.cloned(),
                replace_order,
                lifecycle: node.lifecycle.clone(),
                dependencies: graph.dependencies(address),
                level: depths.get(address).copied().unwrap_or(0),
                reason,
                deposed_id: None,
            });
        }
        actions.sort_by(|a, b| (a.level, &a.address).cmp(&(b.level, &b.address)));

        let mut deposed = self.deposed_actions(snapshot.records.values())?;
        for action in &actions {
            if action.replace_order == Some(ReplaceOrder::CreateBeforeDestroy)
                && let Some(prior) = &action.prior
            {
                deposed.push(deposed_action(
                    prior,
                    prior.provider_id.clone(),
                    "replaced with create_before_destroy",
                ));
            }
        }

        let removed: Vec<&StateRecord> = snapshot
            .records
            .values()
            .filter(|r| !r.is_tombstone() && !graph.contains(&r.address))
            .collect();
        let removals = self.removal_actions(&removed, "removed from configuration")?;

        actions.extend(deposed);
        actions.extend(removals);

        let plan = Plan {
            created_at: Utc::now(),
            based_on_serial: snapshot.serial,
            lineage: snapshot.lineage.clone(),
            config_hash: config_hash.to_string(),
            destroy: false,
            empty_groups: graph.empty_groups().map(String::from).collect(),
            actions,
        };
        info!(summary = %plan.summary(), serial = snapshot.serial, "Plan computed");
        Ok(plan)
    }

    /// Plans the deletion of every recorded resource.
    ///
    /// # Errors
    ///
    /// - `PlanError::MissingProvider` if a recorded type has no adapter.
    /// - `PlanError::PreventDestroy` if a recorded resource is protected.
    pub fn plan_destroy(&self, snapshot: &StateSnapshot, config_hash: &str) -> Result<Plan> {
        let records: Vec<&StateRecord> = snapshot.records.values().collect();
        let mut actions = self.deposed_actions(records.iter().copied())?;
        let live: Vec<&StateRecord> = records.into_iter().filter(|r| !r.is_tombstone()).collect();
        actions.extend(self.removal_actions(&live, "destroy requested")?);

        let plan = Plan {
            created_at: Utc::now(),
            based_on_serial: snapshot.serial,
            lineage: snapshot.lineage.clone(),
            config_hash: config_hash.to_string(),
            destroy: true,
            empty_groups: BTreeSet::new(),
            actions,
        };
        info!(summary = %plan.summary(), serial = snapshot.serial, "Destroy plan computed");
        Ok(plan)
    }

    fn immutable_fields(
        &self,
        resource_type: &str,
        address: &ResourceAddress,
    ) -> Result<BTreeSet<String>> {
        self.registry.immutable_fields(resource_type).map_err(|_| {
            PlanError::MissingProvider {
                resource_type: resource_type.to_string(),
                address: address.to_string(),
            }
            .into()
        })
    }

    fn require_provider(&self, record: &StateRecord) -> Result<()> {
        if self.registry.supports(&record.resource_type) {
            Ok(())
        } else {
            Err(PlanError::MissingProvider {
                resource_type: record.resource_type.clone(),
                address: record.address.to_string(),
            }
            .into())
        }
    }

    /// Deletes of objects left deposed by earlier runs.
    fn deposed_actions<'r>(
        &self,
        records: impl IntoIterator<Item = &'r StateRecord>,
    ) -> Result<Vec<ChangeAction>> {
        let mut actions = Vec::new();
        for record in records {
            if record.deposed.is_empty() {
                continue;
            }
            self.require_provider(record)?;
            for id in &record.deposed {
                actions.push(deposed_action(record, id.clone(), "deposed by an earlier replacement"));
            }
        }
        Ok(actions)
    }

    /// Deletes of `records`, dependents first.
    fn removal_actions(&self, records: &[&StateRecord], reason: &str) -> Result<Vec<ChangeAction>> {
        for record in records {
            if record.prevent_destroy {
                return Err(PlanError::PreventDestroy {
                    address: record.address.to_string(),
                    action: String::from("delete"),
                }
                .into());
            }
            self.require_provider(record)?;
        }

        let dependencies: BTreeMap<ResourceAddress, Vec<ResourceAddress>> = records
            .iter()
            .map(|r| (r.address.clone(), r.dependencies.clone()))
            .collect();
        let by_address: BTreeMap<&ResourceAddress, &StateRecord> =
            records.iter().map(|r| (&r.address, *r)).collect();

        let mut actions = Vec::with_capacity(records.len());
        for (level, addresses) in removal_levels(&dependencies).into_iter().enumerate() {
            for address in addresses {
                let Some(record) = by_address.get(&address) else {
                    continue;
                };
                // Dependents within the removed set go first.
                let dependents: Vec<ResourceAddress> = records
                    .iter()
                    .filter(|r| r.address != address && r.dependencies.contains(&address))
                    .map(|r| r.address.clone())
                    .collect();

                actions.push(ChangeAction {
                    address: address.clone(),
                    resource_type: record.resource_type.clone(),
                    kind: ChangeKind::Delete,
                    changes: Vec::new(),
                    desired: BTreeMap::new(),
                    prior: Some((*record).clone()),
                    replace_order: None,
                    lifecycle: LifecyclePolicy {
                        prevent_destroy: record.prevent_destroy,
                        ..LifecyclePolicy::default()
                    },
                    dependencies: dependents,
                    level,
                    reason: reason.to_string(),
                    deposed_id: None,
                });
            }
        }
        Ok(actions)
    }
}

fn deposed_action(record: &StateRecord, id: String, reason: &str) -> ChangeAction {
    ChangeAction {
        address: record.address.clone(),
        resource_type: record.resource_type.clone(),
        kind: ChangeKind::Delete,
        changes: Vec::new(),
        desired: BTreeMap::new(),
        prior: None,
        replace_order: None,
        lifecycle: LifecyclePolicy::default(),
        dependencies: vec![record.address.clone()],
        level: 0,
        reason: reason.to_string(),
        deposed_id: Some(id),
    }
}

/// Outputs of a node planned for an in-place update: the recorded attributes
/// overlaid with the known desired values.
fn updated_outputs(
    record: &StateRecord,
    changes: &[AttributeChange],
    known: Attributes,
    unknown: BTreeSet<String>,
) -> NodeOutputs {
    let mut attributes = record.attributes.clone();
    for change in changes.iter().filter(|c| c.after.is_none()) {
        attributes.remove(&change.field);
    }
    attributes.extend(known);
    for field in &unknown {
        attributes.remove(field);
    }
    NodeOutputs {
        attributes,
        unknown,
        complete: true,
    }
}

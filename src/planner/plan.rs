//! Change plan types.
//!
//! A [`Plan`] is the planner's output and the executor's input. It carries
//! everything the executor needs (desired expressions, prior records, levels)
//! so it can be saved with `plan --out` and applied later.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;

use super::diff::AttributeChange;
use crate::error::{KeystoneError, Result, StateError};
use crate::model::{AttrValue, LifecyclePolicy, ResourceAddress};
use crate::state::StateRecord;

/// A complete change plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    /// When the plan was created.
    pub created_at: DateTime<Utc>,
    /// State serial the plan was computed against.
    pub based_on_serial: u64,
    /// Lineage of the state the plan was computed against.
    pub lineage: String,
    /// Configuration hash this plan is based on.
    pub config_hash: String,
    /// True for plans produced by `plan_destroy`.
    #[serde(default)]
    pub destroy: bool,
    /// Declared groups that expanded to zero instances.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub empty_groups: BTreeSet<String>,
    /// Actions: forward actions by level, then deletes.
    pub actions: Vec<ChangeAction>,
}

/// A single planned action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeAction {
    /// Resource address.
    pub address: ResourceAddress,
    /// Resource type.
    pub resource_type: String,
    /// Action kind.
    pub kind: ChangeKind,
    /// Attribute changes as known at plan time.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changes: Vec<AttributeChange>,
    /// Desired attribute expressions, resolved again at apply time.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub desired: BTreeMap<String, AttrValue>,
    /// Recorded state of the resource, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prior: Option<StateRecord>,
    /// Order of the two halves of a replacement.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replace_order: Option<ReplaceOrder>,
    /// Lifecycle policy of the declaration.
    #[serde(default)]
    pub lifecycle: LifecyclePolicy,
    /// Addresses whose actions must succeed before this one runs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<ResourceAddress>,
    /// Level within the action's pass.
    pub level: usize,
    /// Human readable reason.
    pub reason: String,
    /// Provider id of a deposed object this action deletes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deposed_id: Option<String>,
}

/// Types of actions in a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    /// Create a new object.
    Create,
    /// Change mutable fields in place.
    Update,
    /// Delete and recreate because an immutable field changed.
    Replace,
    /// Delete an object.
    Delete,
    /// Nothing to do.
    Noop,
}

/// Order of the halves of a replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplaceOrder {
    /// Delete the old object, then create the new one.
    DestroyBeforeCreate,
    /// Create the new object, then delete the old one in the delete pass.
    CreateBeforeDestroy,
}

/// The passes an apply runs through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Pass {
    /// Create, update, replace and noop actions, in dependency order.
    Forward,
    /// Deletion of deposed objects.
    Deposed,
    /// Deletion of removed resources, dependents first.
    Removal,
}

/// Number of actions per kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChangeSummary {
    /// Creates.
    pub create: usize,
    /// Updates.
    pub update: usize,
    /// Replacements.
    pub replace: usize,
    /// Deletes, deposed objects included.
    pub delete: usize,
    /// Unchanged resources.
    pub noop: usize,
}

impl ChangeAction {
    /// Pass this action belongs to.
    #[must_use]
    pub const fn pass(&self) -> Pass {
        match (self.kind, &self.deposed_id) {
            (ChangeKind::Delete, Some(_)) => Pass::Deposed,
            (ChangeKind::Delete, None) => Pass::Removal,
            _ => Pass::Forward,
        }
    }

    /// Key identifying the action within a plan.
    ///
    /// Deposed deletes share the address of their resource, so the deposed id
    /// is part of the key.
    #[must_use]
    pub fn key(&self) -> String {
        match &self.deposed_id {
            Some(id) => format!("{} (deposed {id})", self.address),
            None => self.address.to_string(),
        }
    }

    /// Returns true if the action touches the provider.
    #[must_use]
    pub fn is_change(&self) -> bool {
        self.kind != ChangeKind::Noop
    }
}

impl Plan {
    /// Returns true if any action changes something.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        self.actions.iter().any(ChangeAction::is_change)
    }

    /// Returns true if the plan holds no actions at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Number of actions of each kind.
    #[must_use]
    pub fn summary(&self) -> ChangeSummary {
        let mut summary = ChangeSummary::default();
        for action in &self.actions {
            match action.kind {
                ChangeKind::Create => summary.create += 1,
                ChangeKind::Update => summary.update += 1,
                ChangeKind::Replace => summary.replace += 1,
                ChangeKind::Delete => summary.delete += 1,
                ChangeKind::Noop => summary.noop += 1,
            }
        }
        summary
    }

    /// Actions that change something, in plan order.
    pub fn changes(&self) -> impl Iterator<Item = &ChangeAction> {
        self.actions.iter().filter(|a| a.is_change())
    }

    /// Actions of one pass grouped by level.
    #[must_use]
    pub fn levels(&self, pass: Pass) -> Vec<Vec<&ChangeAction>> {
        let mut levels: BTreeMap<usize, Vec<&ChangeAction>> = BTreeMap::new();
        for action in self.actions.iter().filter(|a| a.pass() == pass) {
            levels.entry(action.level).or_default().push(action);
        }
        levels.into_values().collect()
    }

    /// Looks up the forward or removal action for an address.
    #[must_use]
    pub fn action(&self, address: &ResourceAddress) -> Option<&ChangeAction> {
        self.actions
            .iter()
            .find(|a| &a.address == address && a.deposed_id.is_none())
    }

    /// Serializes the plan to pretty JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| StateError::serialization(format!("plan: {e}")).into())
    }

    /// Writes the plan to a file.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    /// Reads a plan saved with [`Plan::save`].
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not a plan.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| {
            KeystoneError::from(StateError::serialization(format!(
                "invalid plan file {}: {e}",
                path.display()
            )))
        })
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Update => write!(f, "update"),
            Self::Replace => write!(f, "replace"),
            Self::Delete => write!(f, "delete"),
            Self::Noop => write!(f, "noop"),
        }
    }
}

impl ChangeKind {
    /// Single-character symbol for plan output.
    #[must_use]
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::Create => "+",
            Self::Update => "~",
            Self::Replace => "-/+",
            Self::Delete => "-",
            Self::Noop => " ",
        }
    }
}

impl fmt::Display for ChangeSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} to create, {} to update, {} to replace, {} to delete",
            self.create, self.update, self.replace, self.delete
        )
    }
}

impl fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ({})", self.kind.symbol(), self.key(), self.reason)
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.has_changes() {
            return writeln!(f, "No changes. Infrastructure matches the configuration.");
        }

        let changes: Vec<&ChangeAction> = self.changes().collect();
        writeln!(f, "Plan ({} actions, serial {}):", changes.len(), self.based_on_serial)?;
        for action in changes {
            writeln!(f, "  {action}")?;
            for change in &action.changes {
                writeln!(f, "      {change}")?;
            }
        }
        writeln!(f, "Plan: {}", self.summary())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn action(address: &str, kind: ChangeKind, level: usize) -> ChangeAction {
        let address = ResourceAddress::parse(address).unwrap();
        ChangeAction {
            resource_type: address.resource_type.clone(),
            address,
            kind,
            changes: Vec::new(),
            desired: BTreeMap::new(),
            prior: None,
            replace_order: None,
            lifecycle: LifecyclePolicy::default(),
            dependencies: Vec::new(),
            level,
            reason: String::from("test"),
            deposed_id: None,
        }
    }

    fn plan(actions: Vec<ChangeAction>) -> Plan {
        Plan {
            created_at: Utc::now(),
            based_on_serial: 3,
            lineage: String::from("lineage"),
            config_hash: String::from("hash"),
            destroy: false,
            empty_groups: BTreeSet::new(),
            actions,
        }
    }

    #[test]
    fn test_summary_and_has_changes() {
        let noop_only = plan(vec![action("aws_vpc.main", ChangeKind::Noop, 0)]);
        assert!(!noop_only.has_changes());
        assert!(noop_only.to_string().contains("No changes"));

        let p = plan(vec![
            action("aws_vpc.main", ChangeKind::Create, 0),
            action("aws_subnet.a", ChangeKind::Update, 1),
            action("aws_db.old", ChangeKind::Delete, 0),
            action("aws_vpc.other", ChangeKind::Noop, 0),
        ]);
        assert!(p.has_changes());
        let summary = p.summary();
        assert_eq!((summary.create, summary.update, summary.delete, summary.noop), (1, 1, 1, 1));
        assert_eq!(
            summary.to_string(),
            "1 to create, 1 to update, 0 to replace, 1 to delete"
        );
    }

    #[test]
    fn test_levels_split_by_pass() {
        let mut deposed = action("aws_vpc.main", ChangeKind::Delete, 0);
        deposed.deposed_id = Some(String::from("vpc-1"));

        let p = plan(vec![
            action("aws_vpc.main", ChangeKind::Replace, 0),
            action("aws_subnet.a", ChangeKind::Create, 1),
            action("aws_subnet.b", ChangeKind::Create, 1),
            action("aws_db.old", ChangeKind::Delete, 0),
            deposed,
        ]);

        let forward = p.levels(Pass::Forward);
        assert_eq!(forward.len(), 2);
        assert_eq!(forward[1].len(), 2);
        assert_eq!(p.levels(Pass::Removal).len(), 1);
        let deposed = p.levels(Pass::Deposed);
        assert_eq!(deposed[0][0].key(), "aws_vpc.main (deposed vpc-1)");

        let main = ResourceAddress::parse("aws_vpc.main").unwrap();
        assert_eq!(p.action(&main).unwrap().kind, ChangeKind::Replace);
    }

    #[test]
    fn test_save_and_load() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("plan.json");
        let p = plan(vec![action("aws_vpc.main", ChangeKind::Create, 0)]);
        p.save(&path).unwrap();

        let loaded = Plan::load(&path).unwrap();
        assert_eq!(loaded.based_on_serial, 3);
        assert_eq!(loaded.actions[0].kind, ChangeKind::Create);

        std::fs::write(&path, "{}").unwrap();
        assert!(Plan::load(&path).is_err());
    }
}

//! Concrete resource nodes.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use super::address::ResourceAddress;
use super::value::{AttrValue, Reference, ResourceRef};

/// Lifecycle policy consulted by the planner.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecyclePolicy {
    /// Create the replacement before destroying the old object.
    #[serde(default)]
    pub create_before_destroy: bool,
    /// Attributes excluded from the diff entirely.
    #[serde(default)]
    pub ignore_changes: BTreeSet<String>,
    /// Refuse any plan that deletes or replaces this resource.
    #[serde(default)]
    pub prevent_destroy: bool,
}

/// A single declared resource instance after expansion.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceNode {
    /// Instance address.
    pub address: ResourceAddress,
    /// Desired attributes, possibly containing references.
    pub attributes: BTreeMap<String, AttrValue>,
    /// Explicit `depends_on` entries.
    pub depends_on: Vec<ResourceRef>,
    /// Lifecycle policy.
    pub lifecycle: LifecyclePolicy,
}

impl ResourceNode {
    /// Creates a node with no attributes and the default policy.
    #[must_use]
    pub fn new(address: ResourceAddress) -> Self {
        Self {
            address,
            attributes: BTreeMap::new(),
            depends_on: Vec::new(),
            lifecycle: LifecyclePolicy::default(),
        }
    }

    /// Sets a desired attribute.
    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: AttrValue) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    /// Adds an explicit dependency.
    #[must_use]
    pub fn with_dependency(mut self, dependency: ResourceRef) -> Self {
        self.depends_on.push(dependency);
        self
    }

    /// Replaces the lifecycle policy.
    #[must_use]
    pub fn with_lifecycle(mut self, lifecycle: LifecyclePolicy) -> Self {
        self.lifecycle = lifecycle;
        self
    }

    /// Resource type of this node.
    #[must_use]
    pub fn resource_type(&self) -> &str {
        &self.address.resource_type
    }

    /// Every reference in the desired attributes.
    #[must_use]
    pub fn references(&self) -> Vec<&Reference> {
        self.attributes
            .values()
            .flat_map(AttrValue::references)
            .collect()
    }
}

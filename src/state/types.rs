//! State types for tracking applied resources.
//!
//! These types are the recorded side of reconciliation: what was last applied,
//! under which provider identifier, and at which serial.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

use crate::config::ContentHasher;
use crate::model::{Attributes, ResourceAddress};

/// Current version of the state format.
pub const STATE_VERSION: &str = "1.0";

/// A versioned snapshot of every recorded resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// State format version.
    pub version: String,
    /// Identifier shared by every serial of one state history.
    pub lineage: String,
    /// Incremented once per successful commit.
    pub serial: u64,
    /// Records keyed by address.
    #[serde(default)]
    pub records: BTreeMap<ResourceAddress, StateRecord>,
    /// When the snapshot was last committed.
    pub last_updated: DateTime<Utc>,
}

/// Last-applied state of one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    /// Resource address.
    pub address: ResourceAddress,
    /// Resource type.
    pub resource_type: String,
    /// Identifier assigned by the provider.
    pub provider_id: String,
    /// Attributes as last read from or returned by the provider.
    pub attributes: Attributes,
    /// Attributes set from configuration, so removing one from the
    /// declaration unsets it.
    #[serde(default)]
    pub managed_fields: BTreeSet<String>,
    /// SHA-256 of the canonical JSON of `attributes`.
    pub content_hash: String,
    /// Addresses this resource depended on when applied.
    #[serde(default)]
    pub dependencies: Vec<ResourceAddress>,
    /// Copied from the lifecycle policy at apply time.
    #[serde(default)]
    pub prevent_destroy: bool,
    /// Provider ids of replaced objects that still await deletion.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deposed: Vec<String>,
    /// When the resource was first created.
    pub created_at: DateTime<Utc>,
    /// When the record was last written.
    pub updated_at: DateTime<Utc>,
}

impl StateSnapshot {
    /// Creates an empty snapshot at serial 0 with a fresh lineage.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            lineage: Uuid::new_v4().to_string(),
            serial: 0,
            records: BTreeMap::new(),
            last_updated: Utc::now(),
        }
    }

    /// Returns the record for an address.
    #[must_use]
    pub fn get(&self, address: &ResourceAddress) -> Option<&StateRecord> {
        self.records.get(address)
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if nothing is recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of deposed objects across all records.
    #[must_use]
    pub fn deposed_count(&self) -> usize {
        self.records.values().map(|r| r.deposed.len()).sum()
    }
}

impl StateRecord {
    /// Creates a record for a freshly created object.
    #[must_use]
    pub fn new(
        address: ResourceAddress,
        provider_id: impl Into<String>,
        attributes: Attributes,
    ) -> Self {
        let now = Utc::now();
        let content_hash = ContentHasher::hash_attributes(&attributes);
        Self {
            resource_type: address.resource_type.clone(),
            address,
            provider_id: provider_id.into(),
            attributes,
            managed_fields: BTreeSet::new(),
            content_hash,
            dependencies: Vec::new(),
            prevent_destroy: false,
            deposed: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Creates a placeholder that keeps `prior`'s deposed objects tracked
    /// after its current object was deleted and before a successor exists.
    #[must_use]
    pub fn tombstone(prior: &Self) -> Self {
        let mut record = Self::new(prior.address.clone(), String::new(), Attributes::new());
        record.resource_type.clone_from(&prior.resource_type);
        record.dependencies.clone_from(&prior.dependencies);
        record.deposed.clone_from(&prior.deposed);
        record.created_at = prior.created_at;
        record
    }

    /// Returns true for a record without a current object.
    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        self.provider_id.is_empty()
    }

    /// Replaces the attributes and recomputes the content hash.
    pub fn set_attributes(&mut self, attributes: Attributes) {
        self.content_hash = ContentHasher::hash_attributes(&attributes);
        self.attributes = attributes;
        self.updated_at = Utc::now();
    }

    /// Returns true if the recorded hash no longer matches the attributes.
    #[must_use]
    pub fn is_hash_stale(&self) -> bool {
        ContentHasher::hash_attributes(&self.attributes) != self.content_hash
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn attrs(value: serde_json::Value) -> Attributes {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_empty_snapshot() {
        let snapshot = StateSnapshot::empty();
        assert_eq!(snapshot.serial, 0);
        assert!(snapshot.is_empty());
        assert_eq!(snapshot.version, STATE_VERSION);
        assert_ne!(snapshot.lineage, StateSnapshot::empty().lineage);
    }

    #[test]
    fn test_record_hash_tracks_attributes() {
        let address = ResourceAddress::new("aws_vpc", "main");
        let mut record = StateRecord::new(address, "vpc-1", attrs(json!({"cidr": "10.0.0.0/16"})));
        let before = record.content_hash.clone();
        assert!(!record.is_hash_stale());

        record.set_attributes(attrs(json!({"cidr": "10.1.0.0/16"})));
        assert_ne!(record.content_hash, before);
        assert!(!record.is_hash_stale());
    }

    #[test]
    fn test_snapshot_serialization() {
        let mut snapshot = StateSnapshot::empty();
        let address = ResourceAddress::new("aws_vpc", "main");
        let mut record = StateRecord::new(address.clone(), "vpc-1", attrs(json!({"id": "vpc-1"})));
        record.deposed.push(String::from("vpc-0"));
        snapshot.records.insert(address.clone(), record);

        let json = serde_json::to_string_pretty(&snapshot).unwrap();
        assert!(json.contains("\"aws_vpc.main\""));
        let back: StateSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back, snapshot);
        assert_eq!(back.deposed_count(), 1);
    }

    #[test]
    fn test_tombstone_keeps_deposed() {
        let address = ResourceAddress::new("aws_vpc", "main");
        let mut record = StateRecord::new(address.clone(), "vpc-2", attrs(json!({"id": "vpc-2"})));
        record.deposed.push(String::from("vpc-1"));
        record.dependencies.push(ResourceAddress::new("aws_iam", "role"));

        let tombstone = StateRecord::tombstone(&record);
        assert!(tombstone.is_tombstone());
        assert!(!record.is_tombstone());
        assert_eq!(tombstone.address, address);
        assert_eq!(tombstone.deposed, vec![String::from("vpc-1")]);
        assert_eq!(tombstone.dependencies, record.dependencies);
        assert!(tombstone.attributes.is_empty());
    }
}

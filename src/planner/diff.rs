//! Attribute diffing between desired and recorded state.
//!
//! The same comparison runs at plan time, where some desired values are
//! still unknown, and again at apply time once upstream outputs exist.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::model::{Attributes, Resolved, render_scalar};
use crate::state::StateRecord;

/// Change of one attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeChange {
    /// Attribute name.
    pub field: String,
    /// Recorded value, if any.
    pub before: Option<Value>,
    /// Desired value; `None` when the attribute is being unset.
    pub after: Option<Resolved>,
    /// True if the provider cannot change this field in place.
    pub requires_replace: bool,
}

/// Diffs resolved desired attributes against a recorded resource.
///
/// Compared fields are the desired ones plus the fields previously managed
/// from configuration, minus `ignore`. An unknown desired value always counts
/// as a change.
#[must_use]
pub fn diff_attributes(
    prior: &StateRecord,
    desired: &BTreeMap<String, Resolved>,
    ignore: &BTreeSet<String>,
    immutable: &BTreeSet<String>,
) -> Vec<AttributeChange> {
    let fields: BTreeSet<&String> = desired
        .keys()
        .chain(prior.managed_fields.iter())
        .filter(|f| !ignore.contains(*f))
        .collect();

    let mut changes = Vec::new();
    for field in fields {
        let before = prior.attributes.get(field).filter(|v| !v.is_null());
        let after = desired.get(field);

        let changed = match (before, after) {
            (_, Some(Resolved::Unknown)) => true,
            (Some(b), Some(Resolved::Known(a))) => b != a,
            (None, Some(Resolved::Known(a))) => !a.is_null(),
            (Some(_), None) => true,
            (None, None) => false,
        };

        if changed {
            changes.push(AttributeChange {
                field: field.clone(),
                before: before.cloned(),
                after: after.cloned(),
                requires_replace: immutable.contains(field),
            });
        }
    }
    changes
}

/// Lists every desired attribute as a change from nothing.
#[must_use]
pub fn creation_changes(desired: &BTreeMap<String, Resolved>) -> Vec<AttributeChange> {
    desired
        .iter()
        .map(|(field, value)| AttributeChange {
            field: field.clone(),
            before: None,
            after: Some(value.clone()),
            requires_replace: false,
        })
        .collect()
}

/// Turns concrete changes into the payload sent to `update`: new values, and
/// `null` for unset fields. Unknown values are skipped.
#[must_use]
pub fn update_payload(changes: &[AttributeChange]) -> Attributes {
    changes
        .iter()
        .filter_map(|change| match &change.after {
            Some(Resolved::Known(v)) => Some((change.field.clone(), v.clone())),
            Some(Resolved::Unknown) => None,
            None => Some((change.field.clone(), Value::Null)),
        })
        .collect()
}

/// Returns true if any change forces replacement.
#[must_use]
pub fn requires_replace(changes: &[AttributeChange]) -> bool {
    changes.iter().any(|c| c.requires_replace)
}

impl fmt::Display for AttributeChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let before = self
            .before
            .as_ref()
            .map_or_else(|| String::from("(none)"), render_scalar);
        let after = match &self.after {
            Some(Resolved::Known(v)) => render_scalar(v),
            Some(Resolved::Unknown) => String::from("(known after apply)"),
            None => String::from("(removed)"),
        };
        write!(f, "{}: {before} -> {after}", self.field)?;
        if self.requires_replace {
            write!(f, " (forces replacement)")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ResourceAddress;
    use serde_json::json;

    fn record(attrs: Value, managed: &[&str]) -> StateRecord {
        let mut record = StateRecord::new(
            ResourceAddress::new("aws_vpc", "main"),
            "vpc-1",
            serde_json::from_value(attrs).unwrap(),
        );
        record.managed_fields = managed.iter().map(|s| (*s).to_string()).collect();
        record
    }

    fn desired(pairs: &[(&str, Resolved)]) -> BTreeMap<String, Resolved> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_identical_is_empty() {
        let prior = record(json!({"cidr": "10.0.0.0/16", "id": "vpc-1"}), &["cidr"]);
        let want = desired(&[("cidr", Resolved::Known(json!("10.0.0.0/16")))]);
        assert!(diff_attributes(&prior, &want, &BTreeSet::new(), &BTreeSet::new()).is_empty());
    }

    #[test]
    fn test_immutable_change_requires_replace() {
        let prior = record(json!({"cidr": "10.0.0.0/16", "name": "a"}), &["cidr", "name"]);
        let want = desired(&[
            ("cidr", Resolved::Known(json!("10.1.0.0/16"))),
            ("name", Resolved::Known(json!("b"))),
        ]);
        let immutable = BTreeSet::from([String::from("cidr")]);
        let changes = diff_attributes(&prior, &want, &BTreeSet::new(), &immutable);
        assert_eq!(changes.len(), 2);
        assert!(requires_replace(&changes));
        assert!(changes[0].to_string().contains("forces replacement"));
    }

    #[test]
    fn test_unknown_always_changes() {
        let prior = record(json!({"vpc_id": "vpc-1"}), &["vpc_id"]);
        let want = desired(&[("vpc_id", Resolved::Unknown)]);
        let changes = diff_attributes(&prior, &want, &BTreeSet::new(), &BTreeSet::new());
        assert_eq!(changes.len(), 1);
        assert!(update_payload(&changes).is_empty());
    }

    #[test]
    fn test_ignore_changes_excludes_field() {
        let prior = record(json!({"tags": {"owner": "ops"}}), &["tags"]);
        let want = desired(&[("tags", Resolved::Known(json!({"owner": "dev"})))]);
        let ignore = BTreeSet::from([String::from("tags")]);
        assert!(diff_attributes(&prior, &want, &ignore, &BTreeSet::new()).is_empty());
    }

    #[test]
    fn test_removed_managed_field_is_unset() {
        let prior = record(json!({"size": 2, "id": "x"}), &["size"]);
        let changes = diff_attributes(&prior, &BTreeMap::new(), &BTreeSet::new(), &BTreeSet::new());
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].after, None);
        assert_eq!(update_payload(&changes)["size"], Value::Null);
    }
}

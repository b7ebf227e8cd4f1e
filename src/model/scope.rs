//! Reference resolution against node outputs.

use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use super::address::ResourceAddress;
use super::value::{AttrValue, Attributes, Reference, Resolved, Selector};

/// What is known about a node's outputs at some point of a run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeOutputs {
    /// Concrete attribute values.
    pub attributes: Attributes,
    /// Attributes known to be unknown until apply.
    pub unknown: BTreeSet<String>,
    /// True when `attributes` is the full output set, so a missing attribute
    /// is an error rather than an unknown.
    pub complete: bool,
}

impl NodeOutputs {
    /// Outputs of an object that exists: every attribute is known.
    #[must_use]
    pub fn known(attributes: Attributes) -> Self {
        Self {
            attributes,
            unknown: BTreeSet::new(),
            complete: true,
        }
    }

    /// Outputs of an object that does not exist yet: only `attributes` are
    /// fixed, everything else is computed by the provider.
    #[must_use]
    pub fn pending(attributes: Attributes) -> Self {
        Self {
            attributes,
            unknown: BTreeSet::new(),
            complete: false,
        }
    }

    fn attribute(&self, path: &[String]) -> Result<Resolved, String> {
        let Some((first, rest)) = path.split_first() else {
            return Err(String::from("empty attribute path"));
        };
        if self.unknown.contains(first) {
            return Ok(Resolved::Unknown);
        }
        let Some(mut current) = self.attributes.get(first) else {
            return self.missing(first);
        };
        for segment in rest {
            let next = match current {
                Value::Object(map) => map.get(segment),
                Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
                _ => None,
            };
            match next {
                Some(v) => current = v,
                None => return self.missing(&path.join(".")),
            }
        }
        Ok(Resolved::Known(current.clone()))
    }

    fn missing(&self, attr: &str) -> Result<Resolved, String> {
        if self.complete {
            Err(format!("attribute '{attr}' does not exist"))
        } else {
            Ok(Resolved::Unknown)
        }
    }
}

/// Resolution scope: resource groups plus the outputs recorded so far.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    groups: BTreeMap<String, Vec<ResourceAddress>>,
    outputs: HashMap<ResourceAddress, NodeOutputs>,
}

impl Scope {
    /// Creates a scope over the given declared addresses.
    pub fn new<'a>(addresses: impl IntoIterator<Item = &'a ResourceAddress>) -> Self {
        let mut groups: BTreeMap<String, Vec<ResourceAddress>> = BTreeMap::new();
        for address in addresses {
            groups.entry(address.group()).or_default().push(address.clone());
        }
        for members in groups.values_mut() {
            members.sort();
        }
        Self {
            groups,
            outputs: HashMap::new(),
        }
    }

    /// Declares `type.name` groups that expanded to zero instances.
    #[must_use]
    pub fn with_empty_groups<S: Into<String>>(
        mut self,
        groups: impl IntoIterator<Item = S>,
    ) -> Self {
        for group in groups {
            self.groups.entry(group.into()).or_default();
        }
        self
    }

    /// Records the outputs of a node.
    pub fn insert(&mut self, address: ResourceAddress, outputs: NodeOutputs) {
        self.outputs.insert(address, outputs);
    }

    /// Returns the recorded outputs of a node.
    #[must_use]
    pub fn outputs(&self, address: &ResourceAddress) -> Option<&NodeOutputs> {
        self.outputs.get(address)
    }

    /// Resolves a single reference.
    ///
    /// # Errors
    ///
    /// Fails for undeclared targets, un-indexed references to expanded
    /// resources, and attributes missing from a complete output set.
    pub fn lookup(&self, reference: &Reference) -> Result<Resolved, String> {
        let target = &reference.target;
        let members = self
            .groups
            .get(&target.group())
            .ok_or_else(|| format!("{target} is not declared"))?;

        match &target.selector {
            Selector::Single => match members.as_slice() {
                [only] if only.key.is_none() => self.value_of(only, &reference.path),
                [] => Err(format!("{target} has no instances")),
                _ => Err(format!(
                    "{target} has multiple instances; use an index or [*]"
                )),
            },
            Selector::Instance(key) => {
                let address = members
                    .iter()
                    .find(|a| a.key.as_ref() == Some(key))
                    .ok_or_else(|| format!("{target} is not declared"))?;
                self.value_of(address, &reference.path)
            }
            Selector::Splat => {
                let mut values = Vec::with_capacity(members.len());
                for address in members {
                    match self.value_of(address, &reference.path)? {
                        Resolved::Known(v) => values.push(v),
                        Resolved::Unknown => return Ok(Resolved::Unknown),
                    }
                }
                Ok(Resolved::Known(Value::Array(values)))
            }
        }
    }

    fn value_of(&self, address: &ResourceAddress, path: &[String]) -> Result<Resolved, String> {
        self.outputs
            .get(address)
            .ok_or_else(|| format!("{address} has no outputs yet"))?
            .attribute(path)
            .map_err(|e| format!("{address}: {e}"))
    }

    /// Resolves one expression.
    ///
    /// # Errors
    ///
    /// Propagates [`Scope::lookup`] failures.
    pub fn resolve(&self, value: &AttrValue) -> Result<Resolved, String> {
        value.resolve(&|r| self.lookup(r))
    }

    /// Resolves every attribute of a node.
    ///
    /// # Errors
    ///
    /// Propagates [`Scope::lookup`] failures.
    pub fn resolve_all(
        &self,
        attributes: &BTreeMap<String, AttrValue>,
    ) -> Result<BTreeMap<String, Resolved>, String> {
        attributes
            .iter()
            .map(|(k, v)| self.resolve(v).map(|r| (k.clone(), r)))
            .collect()
    }
}

/// Splits resolved attributes into concrete values and unknown field names.
#[must_use]
pub fn split_resolved(resolved: &BTreeMap<String, Resolved>) -> (Attributes, BTreeSet<String>) {
    let mut known = Attributes::new();
    let mut unknown = BTreeSet::new();
    for (field, value) in resolved {
        match value {
            Resolved::Known(v) => {
                known.insert(field.clone(), v.clone());
            }
            Resolved::Unknown => {
                unknown.insert(field.clone());
            }
        }
    }
    (known, unknown)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::address::InstanceKey;
    use serde_json::json;

    fn attrs(value: Value) -> Attributes {
        serde_json::from_value(value).unwrap()
    }

    fn scope() -> Scope {
        let vpc = ResourceAddress::new("aws_vpc", "main");
        let s0 = ResourceAddress::new("aws_subnet", "private").with_key(InstanceKey::Index(0));
        let s1 = ResourceAddress::new("aws_subnet", "private").with_key(InstanceKey::Index(1));
        let mut scope = Scope::new([&vpc, &s0, &s1]);
        scope.insert(
            vpc,
            NodeOutputs::known(attrs(json!({"id": "vpc-1", "tags": {"env": "prod"}}))),
        );
        scope.insert(s0, NodeOutputs::known(attrs(json!({"id": "subnet-0"}))));
        scope.insert(s1, NodeOutputs::pending(attrs(json!({"cidr": "10.0.1.0/24"}))));
        scope
    }

    #[test]
    fn test_lookup_known_and_nested() {
        let scope = scope();
        let r = Reference::parse("aws_vpc.main.id").unwrap();
        assert_eq!(scope.lookup(&r).unwrap(), Resolved::Known(json!("vpc-1")));
        let r = Reference::parse("aws_vpc.main.tags.env").unwrap();
        assert_eq!(scope.lookup(&r).unwrap(), Resolved::Known(json!("prod")));
    }

    #[test]
    fn test_pending_outputs_are_unknown_unless_fixed() {
        let scope = scope();
        let r = Reference::parse("aws_subnet.private[1].id").unwrap();
        assert_eq!(scope.lookup(&r).unwrap(), Resolved::Unknown);
        let r = Reference::parse("aws_subnet.private[1].cidr").unwrap();
        assert_eq!(scope.lookup(&r).unwrap(), Resolved::Known(json!("10.0.1.0/24")));
    }

    #[test]
    fn test_splat_is_unknown_if_any_instance_is() {
        let mut scope = scope();
        let r = Reference::parse("aws_subnet.private[*].id").unwrap();
        assert_eq!(scope.lookup(&r).unwrap(), Resolved::Unknown);

        let s1 = ResourceAddress::new("aws_subnet", "private").with_key(InstanceKey::Index(1));
        scope.insert(s1, NodeOutputs::known(attrs(json!({"id": "subnet-1"}))));
        assert_eq!(
            scope.lookup(&r).unwrap(),
            Resolved::Known(json!(["subnet-0", "subnet-1"]))
        );
    }

    #[test]
    fn test_lookup_errors() {
        let scope = scope();
        assert!(scope.lookup(&Reference::parse("aws_subnet.private.id").unwrap()).is_err());
        assert!(scope.lookup(&Reference::parse("aws_vpc.main.missing").unwrap()).is_err());
        assert!(scope.lookup(&Reference::parse("aws_vpc.other.id").unwrap()).is_err());
        assert!(scope.lookup(&Reference::parse("aws_subnet.private[5].id").unwrap()).is_err());
    }

    #[test]
    fn test_zero_instance_group_splats_to_empty_list() {
        let scope = scope().with_empty_groups(["aws_instance.worker"]);
        let r = Reference::parse("aws_instance.worker[*].id").unwrap();
        assert_eq!(scope.lookup(&r).unwrap(), Resolved::Known(json!([])));

        let err = scope
            .lookup(&Reference::parse("aws_instance.worker.id").unwrap())
            .unwrap_err();
        assert!(err.contains("no instances"));
    }
}

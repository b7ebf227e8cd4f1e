//! Cardinality expansion.
//!
//! Declarations carrying `count` or `for_each` turn into one concrete
//! [`ResourceNode`] per instance before the graph is built. Expansion also
//! substitutes `${var.*}`, `${count.index}`, `${each.key}` and `${each.value}`;
//! every other `${...}` expression is parsed as a resource reference.
//! Substituted values are literal: a variable holding `${...}` text is never
//! read back as a reference.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use super::address::{InstanceKey, ResourceAddress, is_valid_key};
use super::resource::{LifecyclePolicy, ResourceNode};
use super::value::{AttrValue, Reference, ResourceRef, TemplatePart, render_scalar};
use crate::error::{ConfigError, GraphError, KeystoneError, Result};

/// A declared resource as written in the configuration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Declaration {
    /// Resource type, e.g. `aws_vpc`.
    #[serde(rename = "type")]
    pub resource_type: String,

    /// Logical name, unique within the type.
    pub name: String,

    /// Desired attributes.
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,

    /// Explicit dependencies (`type.name`, `type.name[0]`, `type.name["k"]`).
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Positional cardinality.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,

    /// Keyed cardinality.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub for_each: Option<ForEach>,

    /// Lifecycle policy.
    #[serde(default)]
    pub lifecycle: LifecyclePolicy,
}

/// Source of `for_each` keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ForEach {
    /// A list of keys; `each.value` equals `each.key`.
    List(Vec<String>),
    /// A map from key to value.
    Map(BTreeMap<String, Value>),
}

/// Per-instance substitution context.
#[derive(Debug, Default)]
struct InstanceContext<'a> {
    index: Option<u32>,
    key: Option<&'a str>,
    value: Option<&'a Value>,
}

impl Declaration {
    /// Returns the `type.name` group of this declaration.
    #[must_use]
    pub fn group(&self) -> String {
        format!("{}.{}", self.resource_type, self.name)
    }
}

/// Expands declarations into concrete resource nodes.
///
/// # Errors
///
/// Returns an error when a declaration uses both `count` and `for_each`, when
/// `for_each` keys collide or are invalid, when an unknown variable is
/// referenced, or when an attribute expression is malformed.
pub fn expand(
    declarations: &[Declaration],
    variables: &BTreeMap<String, Value>,
) -> Result<Vec<ResourceNode>> {
    let mut nodes = Vec::new();

    for decl in declarations {
        let base = ResourceAddress::new(&decl.resource_type, &decl.name);

        match (&decl.count, &decl.for_each) {
            (Some(_), Some(_)) => {
                return Err(ConfigError::validation(
                    "count and for_each are mutually exclusive",
                    decl.group(),
                )
                .into());
            }
            (Some(count), None) => {
                for index in 0..*count {
                    let ctx = InstanceContext {
                        index: Some(index),
                        ..InstanceContext::default()
                    };
                    let address = base.clone().with_key(InstanceKey::Index(index));
                    nodes.push(build_node(decl, address, &ctx, variables)?);
                }
            }
            (None, Some(for_each)) => {
                for (key, value) in instance_keys(decl, for_each)? {
                    let ctx = InstanceContext {
                        index: None,
                        key: Some(key.as_str()),
                        value: Some(&value),
                    };
                    let address = base.clone().with_key(InstanceKey::Key(key.clone()));
                    nodes.push(build_node(decl, address, &ctx, variables)?);
                }
            }
            (None, None) => {
                nodes.push(build_node(
                    decl,
                    base,
                    &InstanceContext::default(),
                    variables,
                )?);
            }
        }
    }

    debug!(
        declarations = declarations.len(),
        instances = nodes.len(),
        "Expanded declarations"
    );
    Ok(nodes)
}

fn instance_keys(decl: &Declaration, for_each: &ForEach) -> Result<Vec<(String, Value)>> {
    let pairs: Vec<(String, Value)> = match for_each {
        ForEach::List(keys) => {
            let mut seen = BTreeSet::new();
            for key in keys {
                if !seen.insert(key.as_str()) {
                    return Err(ConfigError::validation(
                        format!("duplicate for_each key \"{key}\""),
                        decl.group(),
                    )
                    .into());
                }
            }
            keys.iter()
                .map(|k| (k.clone(), Value::String(k.clone())))
                .collect()
        }
        ForEach::Map(map) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
    };

    if let Some((bad, _)) = pairs.iter().find(|(k, _)| !is_valid_key(k)) {
        return Err(ConfigError::validation(
            format!("invalid for_each key \"{bad}\""),
            decl.group(),
        )
        .into());
    }
    Ok(pairs)
}

fn build_node(
    decl: &Declaration,
    address: ResourceAddress,
    ctx: &InstanceContext<'_>,
    variables: &BTreeMap<String, Value>,
) -> Result<ResourceNode> {
    let mut attributes = BTreeMap::new();
    for (field, raw) in &decl.attributes {
        let value = substitute_value(raw, ctx, variables, &address)?;
        attributes.insert(field.clone(), value);
    }

    let depends_on = decl
        .depends_on
        .iter()
        .map(|dep| {
            ResourceRef::parse_dependency(dep).map_err(|message| GraphError::InvalidExpression {
                address: address.to_string(),
                expression: dep.clone(),
                message,
            })
        })
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(ResourceNode {
        address,
        attributes,
        depends_on,
        lifecycle: decl.lifecycle.clone(),
    })
}

fn substitute_value(
    raw: &Value,
    ctx: &InstanceContext<'_>,
    variables: &BTreeMap<String, Value>,
    address: &ResourceAddress,
) -> Result<AttrValue> {
    match raw {
        Value::String(s) => substitute_string(s, ctx, variables, address),
        Value::Array(items) => {
            let items = items
                .iter()
                .map(|item| substitute_value(item, ctx, variables, address))
                .collect::<Result<Vec<_>>>()?;
            if items.iter().all(AttrValue::is_literal) {
                Ok(AttrValue::Literal(Value::Array(
                    items.into_iter().filter_map(into_literal).collect(),
                )))
            } else {
                Ok(AttrValue::List(items))
            }
        }
        Value::Object(map) => {
            let mut fields = BTreeMap::new();
            for (k, v) in map {
                fields.insert(k.clone(), substitute_value(v, ctx, variables, address)?);
            }
            if fields.values().all(AttrValue::is_literal) {
                Ok(AttrValue::Literal(Value::Object(
                    fields
                        .into_iter()
                        .filter_map(|(k, v)| into_literal(v).map(|v| (k, v)))
                        .collect(),
                )))
            } else {
                Ok(AttrValue::Map(fields))
            }
        }
        other => Ok(AttrValue::Literal(other.clone())),
    }
}

fn into_literal(value: AttrValue) -> Option<Value> {
    match value {
        AttrValue::Literal(v) => Some(v),
        _ => None,
    }
}

fn substitute_string(
    s: &str,
    ctx: &InstanceContext<'_>,
    variables: &BTreeMap<String, Value>,
    address: &ResourceAddress,
) -> Result<AttrValue> {
    if !s.contains("${") {
        return Ok(AttrValue::Literal(Value::String(s.to_string())));
    }

    // A string that is exactly one token takes the token's raw value.
    if let Some(inner) = s.strip_prefix("${").and_then(|rest| rest.strip_suffix('}'))
        && !inner.contains('}')
        && let Some(value) = lookup_token(inner.trim(), ctx, variables, address)?
    {
        return Ok(AttrValue::Literal(value));
    }

    let invalid = |message: String| GraphError::InvalidExpression {
        address: address.to_string(),
        expression: s.to_string(),
        message,
    };

    let mut parts = Vec::new();
    let mut text = String::new();
    let mut rest = s;
    while let Some(start) = rest.find("${") {
        text.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find('}')
            .ok_or_else(|| invalid(String::from("unterminated expression")))?;
        let expr = &after[..end];
        match lookup_token(expr.trim(), ctx, variables, address)? {
            Some(value) => text.push_str(&render_scalar(&value)),
            None => {
                let reference = Reference::parse(expr).map_err(invalid)?;
                if !text.is_empty() {
                    parts.push(TemplatePart::Text(std::mem::take(&mut text)));
                }
                parts.push(TemplatePart::Reference(reference));
            }
        }
        rest = &after[end + 1..];
    }
    text.push_str(rest);

    if parts.is_empty() {
        return Ok(AttrValue::Literal(Value::String(text)));
    }
    if !text.is_empty() {
        parts.push(TemplatePart::Text(text));
    }
    if let [TemplatePart::Reference(r)] = parts.as_slice() {
        return Ok(AttrValue::Reference(r.clone()));
    }
    Ok(AttrValue::Template(parts))
}

/// Looks up an expansion token. Returns `None` for expressions that are not
/// expansion tokens, such as resource references.
fn lookup_token(
    token: &str,
    ctx: &InstanceContext<'_>,
    variables: &BTreeMap<String, Value>,
    address: &ResourceAddress,
) -> Result<Option<Value>> {
    if let Some(name) = token.strip_prefix("var.") {
        return variables
            .get(name)
            .cloned()
            .map(Some)
            .ok_or_else(|| {
                KeystoneError::from(ConfigError::UnknownVariable {
                    name: name.to_string(),
                    resource: address.to_string(),
                })
            });
    }

    let value = match token {
        "count.index" => ctx.index.map(Value::from),
        "each.key" => ctx.key.map(|k| Value::String(k.to_string())),
        "each.value" => ctx.value.cloned(),
        _ => return Ok(None),
    };

    value.map(Some).ok_or_else(|| {
        GraphError::InvalidExpression {
            address: address.to_string(),
            expression: format!("${{{token}}}"),
            message: String::from("only valid inside an expanded resource"),
        }
        .into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decl(yaml: &str) -> Declaration {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_plain_declaration_yields_one_node() {
        let d = decl("type: aws_vpc\nname: main\nattributes:\n  cidr: 10.0.0.0/16\n");
        let nodes = expand(&[d], &BTreeMap::new()).unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].address.to_string(), "aws_vpc.main");
        assert_eq!(
            nodes[0].attributes["cidr"],
            AttrValue::Literal(json!("10.0.0.0/16"))
        );
    }

    #[test]
    fn test_count_expansion_substitutes_index() {
        let d = decl(
            "type: aws_subnet\nname: private\ncount: 3\nattributes:\n  \
             cidr: \"10.0.${count.index}.0/24\"\n  ordinal: \"${count.index}\"\n",
        );
        let nodes = expand(&[d], &BTreeMap::new()).unwrap();
        assert_eq!(nodes.len(), 3);
        assert_eq!(nodes[2].address.to_string(), "aws_subnet.private[2]");
        assert_eq!(
            nodes[1].attributes["cidr"],
            AttrValue::Literal(json!("10.0.1.0/24"))
        );
        assert_eq!(nodes[2].attributes["ordinal"], AttrValue::Literal(json!(2)));
    }

    #[test]
    fn test_for_each_keys_are_stable_under_reorder() {
        let a = decl(
            "type: aws_subnet\nname: az\nfor_each: [us-east-1a, us-east-1b]\n\
             attributes:\n  zone: \"${each.key}\"\n",
        );
        let b = decl(
            "type: aws_subnet\nname: az\nfor_each: [us-east-1b, us-east-1a]\n\
             attributes:\n  zone: \"${each.key}\"\n",
        );
        let mut left = expand(&[a], &BTreeMap::new()).unwrap();
        let mut right = expand(&[b], &BTreeMap::new()).unwrap();
        left.sort_by(|x, y| x.address.cmp(&y.address));
        right.sort_by(|x, y| x.address.cmp(&y.address));
        assert_eq!(left, right);
        assert_eq!(left[0].address.to_string(), "aws_subnet.az[\"us-east-1a\"]");
    }

    #[test]
    fn test_for_each_map_exposes_value() {
        let d = decl(
            "type: aws_iam_user\nname: team\nfor_each:\n  alice: {role: admin}\n  bob: {role: dev}\n\
             attributes:\n  spec: \"${each.value}\"\n  label: \"user-${each.key}\"\n",
        );
        let nodes = expand(&[d], &BTreeMap::new()).unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].attributes["spec"], AttrValue::Literal(json!({"role": "admin"})));
        assert_eq!(nodes[1].attributes["label"], AttrValue::Literal(json!("user-bob")));
    }

    #[test]
    fn test_variables_and_references_coexist() {
        let d = decl(
            "type: aws_subnet\nname: a\nattributes:\n  \
             vpc_id: \"${aws_vpc.main.id}\"\n  region: \"${var.region}\"\n  \
             name: \"${var.env}-${aws_vpc.main.name}\"\n",
        );
        let mut vars = BTreeMap::new();
        vars.insert(String::from("region"), json!("eu-west-1"));
        vars.insert(String::from("env"), json!("prod"));
        let nodes = expand(&[d], &vars).unwrap();
        let node = &nodes[0];
        assert_eq!(node.attributes["region"], AttrValue::Literal(json!("eu-west-1")));
        assert!(matches!(node.attributes["vpc_id"], AttrValue::Reference(_)));
        assert!(matches!(node.attributes["name"], AttrValue::Template(_)));
        assert_eq!(node.references().len(), 2);
    }

    #[test]
    fn test_expansion_errors() {
        let unknown_var = decl("type: t\nname: a\nattributes:\n  x: \"${var.nope}\"\n");
        let err = expand(&[unknown_var], &BTreeMap::new()).unwrap_err();
        assert!(matches!(
            err,
            KeystoneError::Config(ConfigError::UnknownVariable { .. })
        ));

        let both = decl("type: t\nname: a\ncount: 2\nfor_each: [x]\n");
        assert!(expand(&[both], &BTreeMap::new()).is_err());

        let dup = decl("type: t\nname: a\nfor_each: [x, x]\n");
        assert!(expand(&[dup], &BTreeMap::new()).is_err());

        let stray = decl("type: t\nname: a\nattributes:\n  x: \"${count.index}\"\n");
        assert!(matches!(
            expand(&[stray], &BTreeMap::new()).unwrap_err(),
            KeystoneError::Graph(GraphError::InvalidExpression { .. })
        ));
    }

    #[test]
    fn test_zero_count_yields_nothing() {
        let d = decl("type: t\nname: a\ncount: 0\n");
        assert!(expand(&[d], &BTreeMap::new()).unwrap().is_empty());
    }

    #[test]
    fn test_substituted_variable_text_stays_literal() {
        let d = decl(
            "type: t\nname: a\nattributes:\n  \
             whole: \"${var.banner}\"\n  \
             mixed: \"motd: ${var.banner}\"\n  \
             nested: [\"${var.banner}\", \"${aws_vpc.main.id}\"]\n",
        );
        let mut vars = BTreeMap::new();
        vars.insert(String::from("banner"), json!("hello ${aws_vpc.main.id}"));
        let nodes = expand(&[d], &vars).unwrap();
        let node = &nodes[0];

        assert_eq!(
            node.attributes["whole"],
            AttrValue::Literal(json!("hello ${aws_vpc.main.id}"))
        );
        assert_eq!(
            node.attributes["mixed"],
            AttrValue::Literal(json!("motd: hello ${aws_vpc.main.id}"))
        );
        let AttrValue::List(items) = &node.attributes["nested"] else {
            panic!("expected a list with a reference");
        };
        assert_eq!(items[0], AttrValue::Literal(json!("hello ${aws_vpc.main.id}")));
        assert!(matches!(items[1], AttrValue::Reference(_)));
        assert_eq!(node.references().len(), 1);
    }
}

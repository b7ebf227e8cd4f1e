//! Attribute expressions.
//!
//! Desired attributes are JSON values in which strings may embed references
//! to other resources' outputs using `${type.name.attr}` syntax. Parsing turns
//! them into an [`AttrValue`] tree that the graph builder indexes and the
//! planner and executor resolve.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use super::address::{InstanceKey, KeySelector, is_identifier, parse_key};

/// Concrete attribute mapping as stored in state and exchanged with providers.
pub type Attributes = BTreeMap<String, Value>;

/// Which instances of a resource group a reference points at.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Selector {
    /// No index: the single instance of an unexpanded resource.
    Single,
    /// One instance of an expanded resource.
    Instance(InstanceKey),
    /// `[*]`: every instance, yielding a list.
    Splat,
}

/// Target of a reference: a resource group plus an instance selector.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceRef {
    /// Resource type.
    pub resource_type: String,
    /// Logical name.
    pub name: String,
    /// Instance selector.
    pub selector: Selector,
}

/// A reference to another resource's output attribute.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reference {
    /// Referenced resource.
    pub target: ResourceRef,
    /// Attribute path; the first segment is a top-level attribute.
    pub path: Vec<String>,
}

/// Segment of a string template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplatePart {
    /// Literal text.
    Text(String),
    /// Interpolated reference.
    Reference(Reference),
}

/// A desired attribute value before resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttrValue {
    /// Fully literal JSON value.
    Literal(Value),
    /// A whole-string reference; resolves to the referenced value unchanged.
    Reference(Reference),
    /// A string with embedded references; resolves to a string.
    Template(Vec<TemplatePart>),
    /// A list containing at least one reference.
    List(Vec<AttrValue>),
    /// A map containing at least one reference.
    Map(BTreeMap<String, AttrValue>),
}

/// Outcome of resolving an expression at plan or apply time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolved {
    /// A concrete value.
    Known(Value),
    /// Only known after an upstream action is applied.
    Unknown,
}

impl AttrValue {
    /// Parses a raw JSON value into an expression tree.
    ///
    /// # Errors
    ///
    /// Returns a message when a `${...}` expression is malformed.
    pub fn parse(raw: &Value) -> std::result::Result<Self, String> {
        match raw {
            Value::String(s) => parse_string(s),
            Value::Array(items) => {
                let parsed = items.iter().map(Self::parse).collect::<std::result::Result<Vec<_>, _>>()?;
                if parsed.iter().all(Self::is_literal) {
                    Ok(Self::Literal(raw.clone()))
                } else {
                    Ok(Self::List(parsed))
                }
            }
            Value::Object(map) => {
                let parsed = map
                    .iter()
                    .map(|(k, v)| Self::parse(v).map(|p| (k.clone(), p)))
                    .collect::<std::result::Result<BTreeMap<_, _>, _>>()?;
                if parsed.values().all(Self::is_literal) {
                    Ok(Self::Literal(raw.clone()))
                } else {
                    Ok(Self::Map(parsed))
                }
            }
            other => Ok(Self::Literal(other.clone())),
        }
    }

    /// Returns true if the value contains no references.
    #[must_use]
    pub const fn is_literal(&self) -> bool {
        matches!(self, Self::Literal(_))
    }

    /// Collects every reference in this value.
    #[must_use]
    pub fn references(&self) -> Vec<&Reference> {
        let mut refs = Vec::new();
        self.collect_references(&mut refs);
        refs
    }

    fn collect_references<'a>(&'a self, out: &mut Vec<&'a Reference>) {
        match self {
            Self::Literal(_) => {}
            Self::Reference(r) => out.push(r),
            Self::Template(parts) => {
                for part in parts {
                    if let TemplatePart::Reference(r) = part {
                        out.push(r);
                    }
                }
            }
            Self::List(items) => items.iter().for_each(|i| i.collect_references(out)),
            Self::Map(map) => map.values().for_each(|v| v.collect_references(out)),
        }
    }

    /// Resolves this value using `lookup` for references.
    ///
    /// Any unknown input makes the enclosing value unknown.
    ///
    /// # Errors
    ///
    /// Propagates lookup failures.
    pub fn resolve<F>(&self, lookup: &F) -> std::result::Result<Resolved, String>
    where
        F: Fn(&Reference) -> std::result::Result<Resolved, String>,
    {
        match self {
            Self::Literal(v) => Ok(Resolved::Known(v.clone())),
            Self::Reference(r) => lookup(r),
            Self::Template(parts) => {
                let mut out = String::new();
                for part in parts {
                    match part {
                        TemplatePart::Text(t) => out.push_str(t),
                        TemplatePart::Reference(r) => match lookup(r)? {
                            Resolved::Known(v) => out.push_str(&render_scalar(&v)),
                            Resolved::Unknown => return Ok(Resolved::Unknown),
                        },
                    }
                }
                Ok(Resolved::Known(Value::String(out)))
            }
            Self::List(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    match item.resolve(lookup)? {
                        Resolved::Known(v) => values.push(v),
                        Resolved::Unknown => return Ok(Resolved::Unknown),
                    }
                }
                Ok(Resolved::Known(Value::Array(values)))
            }
            Self::Map(map) => {
                let mut values = serde_json::Map::new();
                for (k, item) in map {
                    match item.resolve(lookup)? {
                        Resolved::Known(v) => {
                            values.insert(k.clone(), v);
                        }
                        Resolved::Unknown => return Ok(Resolved::Unknown),
                    }
                }
                Ok(Resolved::Known(Value::Object(values)))
            }
        }
    }
}

impl Resolved {
    /// Returns the concrete value, if known.
    #[must_use]
    pub const fn known(&self) -> Option<&Value> {
        match self {
            Self::Known(v) => Some(v),
            Self::Unknown => None,
        }
    }
}

/// Renders a value for string interpolation.
#[must_use]
pub fn render_scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Parses a string that may contain `${...}` references.
fn parse_string(s: &str) -> std::result::Result<AttrValue, String> {
    if !s.contains("${") {
        return Ok(AttrValue::Literal(Value::String(s.to_string())));
    }

    let mut parts = Vec::new();
    let mut rest = s;
    while let Some(start) = rest.find("${") {
        if start > 0 {
            parts.push(TemplatePart::Text(rest[..start].to_string()));
        }
        let after = &rest[start + 2..];
        let end = after
            .find('}')
            .ok_or_else(|| format!("unterminated expression in '{s}'"))?;
        parts.push(TemplatePart::Reference(Reference::parse(&after[..end])?));
        rest = &after[end + 1..];
    }
    if !rest.is_empty() {
        parts.push(TemplatePart::Text(rest.to_string()));
    }

    if let [TemplatePart::Reference(r)] = parts.as_slice() {
        return Ok(AttrValue::Reference(r.clone()));
    }
    Ok(AttrValue::Template(parts))
}

impl Reference {
    /// Parses the inside of `${...}`, e.g. `aws_subnet.private[0].id`.
    ///
    /// # Errors
    ///
    /// Returns a message when the expression is malformed.
    pub fn parse(expr: &str) -> std::result::Result<Self, String> {
        let expr = expr.trim();
        let (resource_type, rest) = expr
            .split_once('.')
            .ok_or_else(|| format!("expected 'type.name.attribute', got '{expr}'"))?;

        let name_end = rest.find(['.', '[']).unwrap_or(rest.len());
        let name = &rest[..name_end];
        let mut rest = &rest[name_end..];

        let selector = if let Some(bracketed) = rest.strip_prefix('[') {
            let close = bracketed
                .find(']')
                .ok_or_else(|| format!("unterminated index in '{expr}'"))?;
            let selector = match parse_key(&bracketed[..close])? {
                KeySelector::Key(key) => Selector::Instance(key),
                KeySelector::Splat => Selector::Splat,
            };
            rest = &bracketed[close + 1..];
            selector
        } else {
            Selector::Single
        };

        let path_text = rest
            .strip_prefix('.')
            .ok_or_else(|| format!("'{expr}' must name an attribute"))?;
        let path: Vec<String> = path_text.split('.').map(str::to_string).collect();

        if !is_identifier(resource_type) || !is_identifier(name) {
            return Err(format!("invalid resource in '{expr}'"));
        }
        if path.iter().any(|seg| seg.is_empty()) {
            return Err(format!("empty attribute segment in '{expr}'"));
        }

        Ok(Self {
            target: ResourceRef {
                resource_type: resource_type.to_string(),
                name: name.to_string(),
                selector,
            },
            path,
        })
    }
}

impl ResourceRef {
    /// Parses a `depends_on` entry: `type.name`, `type.name[0]`, `type.name["k"]`.
    ///
    /// # Errors
    ///
    /// Returns a message when the entry is malformed.
    pub fn parse_dependency(text: &str) -> std::result::Result<Self, String> {
        let text = text.trim();
        let (head, selector) = match text.find('[') {
            Some(open) => {
                let inner = text[open + 1..]
                    .strip_suffix(']')
                    .ok_or_else(|| format!("unterminated index in '{text}'"))?;
                let selector = match parse_key(inner)? {
                    KeySelector::Key(key) => Selector::Instance(key),
                    KeySelector::Splat => Selector::Splat,
                };
                (&text[..open], selector)
            }
            None => (text, Selector::Single),
        };
        let (resource_type, name) = head
            .split_once('.')
            .ok_or_else(|| format!("expected 'type.name', got '{text}'"))?;
        if !is_identifier(resource_type) || !is_identifier(name) {
            return Err(format!("invalid dependency '{text}'"));
        }
        Ok(Self {
            resource_type: resource_type.to_string(),
            name: name.to_string(),
            selector,
        })
    }

    /// Returns the `type.name` group.
    #[must_use]
    pub fn group(&self) -> String {
        format!("{}.{}", self.resource_type, self.name)
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.resource_type, self.name)?;
        match &self.selector {
            Selector::Single => Ok(()),
            Selector::Instance(key) => write!(f, "{key}"),
            Selector::Splat => write!(f, "[*]"),
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${{{}.{}}}", self.target, self.path.join("."))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_literal_passthrough() {
        let value = AttrValue::parse(&json!({"cidr": "10.0.0.0/16", "tags": ["a"]})).unwrap();
        assert!(value.is_literal());
        assert!(value.references().is_empty());
    }

    #[test]
    fn test_whole_string_reference() {
        let value = AttrValue::parse(&json!("${aws_vpc.main.id}")).unwrap();
        let AttrValue::Reference(r) = value else {
            panic!("expected reference");
        };
        assert_eq!(r.target.resource_type, "aws_vpc");
        assert_eq!(r.target.name, "main");
        assert_eq!(r.target.selector, Selector::Single);
        assert_eq!(r.path, vec![String::from("id")]);
        assert_eq!(r.to_string(), "${aws_vpc.main.id}");
    }

    #[test]
    fn test_indexed_and_splat_references() {
        let r = Reference::parse("aws_subnet.private[\"us-east-1a\"].id").unwrap();
        assert_eq!(
            r.target.selector,
            Selector::Instance(InstanceKey::Key(String::from("us-east-1a")))
        );

        let r = Reference::parse("aws_subnet.private[*].arn").unwrap();
        assert_eq!(r.target.selector, Selector::Splat);

        let r = Reference::parse("aws_db.main[0].endpoint.host").unwrap();
        assert_eq!(r.path, vec![String::from("endpoint"), String::from("host")]);
    }

    #[test]
    fn test_template_resolution() {
        let value = AttrValue::parse(&json!("arn:${aws_iam_role.ci.name}/x")).unwrap();
        assert_eq!(value.references().len(), 1);

        let known = value
            .resolve(&|_| Ok(Resolved::Known(json!("builder"))))
            .unwrap();
        assert_eq!(known, Resolved::Known(json!("arn:builder/x")));

        let unknown = value.resolve(&|_| Ok(Resolved::Unknown)).unwrap();
        assert_eq!(unknown, Resolved::Unknown);
    }

    #[test]
    fn test_nested_references_in_list() {
        let value = AttrValue::parse(&json!(["sg-static", "${aws_sg.db.id}"])).unwrap();
        assert!(matches!(value, AttrValue::List(_)));
        let resolved = value.resolve(&|_| Ok(Resolved::Known(json!("sg-1")))).unwrap();
        assert_eq!(resolved, Resolved::Known(json!(["sg-static", "sg-1"])));
    }

    #[test]
    fn test_malformed_expressions() {
        assert!(AttrValue::parse(&json!("${aws_vpc.main")).is_err());
        assert!(AttrValue::parse(&json!("${aws_vpc}")).is_err());
        assert!(AttrValue::parse(&json!("${aws_vpc.main}")).is_err());
        assert!(AttrValue::parse(&json!("${aws_vpc.main[x].id}")).is_err());
    }

    #[test]
    fn test_parse_dependency() {
        let dep = ResourceRef::parse_dependency("aws_iam_role.ci").unwrap();
        assert_eq!(dep.selector, Selector::Single);
        let dep = ResourceRef::parse_dependency("aws_subnet.private[1]").unwrap();
        assert_eq!(dep.selector, Selector::Instance(InstanceKey::Index(1)));
        assert!(ResourceRef::parse_dependency("broken").is_err());
    }
}

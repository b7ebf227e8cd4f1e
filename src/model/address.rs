//! Resource addresses.
//!
//! An address identifies one concrete resource instance: `type.name`,
//! `type.name[0]` for `count` instances, or `type.name["key"]` for
//! `for_each` instances.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Instance key of an expanded resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceKey {
    /// Positional key produced by `count`.
    Index(u32),
    /// Stable key produced by `for_each`.
    Key(String),
}

/// Address of a concrete resource instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceAddress {
    /// Resource type, e.g. `aws_vpc`.
    pub resource_type: String,
    /// Logical name within the type.
    pub name: String,
    /// Instance key when the declaration was expanded.
    pub key: Option<InstanceKey>,
}

impl ResourceAddress {
    /// Creates an address for an unexpanded resource.
    #[must_use]
    pub fn new(resource_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            name: name.into(),
            key: None,
        }
    }

    /// Returns a copy of this address with the given instance key.
    #[must_use]
    pub fn with_key(mut self, key: InstanceKey) -> Self {
        self.key = Some(key);
        self
    }

    /// Returns the `type.name` group this instance belongs to.
    #[must_use]
    pub fn group(&self) -> String {
        format!("{}.{}", self.resource_type, self.name)
    }

    /// Parses an address such as `aws_subnet.private["a"]`.
    ///
    /// # Errors
    ///
    /// Returns a message describing the problem when the text is malformed.
    pub fn parse(text: &str) -> std::result::Result<Self, String> {
        let (head, key) = match text.find('[') {
            Some(open) => {
                let close = text
                    .strip_suffix(']')
                    .ok_or_else(|| format!("unterminated instance key in '{text}'"))?;
                (&text[..open], Some(parse_key(&close[open + 1..])?))
            }
            None => (text, None),
        };

        let (resource_type, name) = head
            .split_once('.')
            .ok_or_else(|| format!("expected 'type.name', got '{text}'"))?;

        if !is_identifier(resource_type) || !is_identifier(name) {
            return Err(format!("invalid resource address '{text}'"));
        }

        let key = match key {
            None => None,
            Some(KeySelector::Key(k)) => Some(k),
            Some(KeySelector::Splat) => {
                return Err(format!("'{text}' is a splat, not a concrete address"));
            }
        };

        Ok(Self {
            resource_type: resource_type.to_string(),
            name: name.to_string(),
            key,
        })
    }
}

/// Result of parsing the text between brackets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum KeySelector {
    /// A concrete instance key.
    Key(InstanceKey),
    /// `[*]`
    Splat,
}

/// Parses the content of `[...]`.
pub(crate) fn parse_key(inner: &str) -> std::result::Result<KeySelector, String> {
    let inner = inner.trim();
    if inner == "*" {
        return Ok(KeySelector::Splat);
    }
    if let Some(quoted) = inner.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
        if quoted.is_empty() || !is_valid_key(quoted) {
            return Err(format!("invalid instance key \"{quoted}\""));
        }
        return Ok(KeySelector::Key(InstanceKey::Key(quoted.to_string())));
    }
    inner
        .parse::<u32>()
        .map(|i| KeySelector::Key(InstanceKey::Index(i)))
        .map_err(|_| format!("invalid instance key '{inner}'"))
}

/// Returns true if `s` is a valid type, name or attribute identifier.
#[must_use]
pub fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Returns true if `s` can be used as a `for_each` key.
#[must_use]
pub fn is_valid_key(s: &str) -> bool {
    !s.is_empty() && !s.contains(['"', '[', ']', '$', '{', '}'])
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Index(i) => write!(f, "[{i}]"),
            Self::Key(k) => write!(f, "[\"{k}\"]"),
        }
    }
}

impl fmt::Display for ResourceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.resource_type, self.name)?;
        if let Some(key) = &self.key {
            write!(f, "{key}")?;
        }
        Ok(())
    }
}

impl From<ResourceAddress> for String {
    fn from(address: ResourceAddress) -> Self {
        address.to_string()
    }
}

impl TryFrom<String> for ResourceAddress {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

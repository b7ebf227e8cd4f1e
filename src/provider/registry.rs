//! Provider registry for looking up adapters by resource type.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::info;

use super::ProviderAdapter;
use crate::error::{ProviderError, Result};

/// Registry of provider adapters keyed by resource type.
///
/// Types without an explicit registration fall back to the default adapter,
/// if one is set.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    adapters: BTreeMap<String, Arc<dyn ProviderAdapter>>,
    fallback: Option<Arc<dyn ProviderAdapter>>,
    extra_immutable: BTreeMap<String, BTreeSet<String>>,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("types", &self.adapters.keys().collect::<Vec<_>>())
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

impl ProviderRegistry {
    /// Create a new empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter for a resource type, replacing any previous one.
    pub fn register(&mut self, resource_type: impl Into<String>, adapter: Arc<dyn ProviderAdapter>) {
        let resource_type = resource_type.into();
        info!(resource_type = %resource_type, "Registered provider");
        self.adapters.insert(resource_type, adapter);
    }

    /// Set the adapter used for types without a registration.
    pub fn set_fallback(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.fallback = Some(adapter);
    }

    /// Declare additional immutable fields for a type on top of the
    /// adapter's own schema.
    pub fn add_immutable<I, S>(&mut self, resource_type: impl Into<String>, fields: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_immutable
            .entry(resource_type.into())
            .or_default()
            .extend(fields.into_iter().map(Into::into));
    }

    /// Look up the adapter for a resource type.
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::UnknownType` when nothing handles the type.
    pub fn get(&self, resource_type: &str) -> Result<Arc<dyn ProviderAdapter>> {
        self.adapters
            .get(resource_type)
            .or(self.fallback.as_ref())
            .cloned()
            .ok_or_else(|| {
                ProviderError::UnknownType {
                    resource_type: resource_type.to_string(),
                }
                .into()
            })
    }

    /// Check if some adapter handles the type.
    #[must_use]
    pub fn supports(&self, resource_type: &str) -> bool {
        self.adapters.contains_key(resource_type) || self.fallback.is_some()
    }

    /// Immutable fields of a type.
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::UnknownType` when nothing handles the type.
    pub fn immutable_fields(&self, resource_type: &str) -> Result<BTreeSet<String>> {
        let mut fields = self.get(resource_type)?.immutable_fields(resource_type);
        if let Some(extra) = self.extra_immutable.get(resource_type) {
            fields.extend(extra.iter().cloned());
        }
        Ok(fields)
    }

    /// Explicitly registered types.
    #[must_use]
    pub fn types(&self) -> Vec<String> {
        self.adapters.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::MockProviderAdapter;

    fn mock_with_immutable(fields: &[&str]) -> Arc<dyn ProviderAdapter> {
        let fields: BTreeSet<String> = fields.iter().map(|f| (*f).to_string()).collect();
        let mut mock = MockProviderAdapter::new();
        mock.expect_immutable_fields().returning(move |_| fields.clone());
        Arc::new(mock)
    }

    #[test]
    fn test_lookup_and_fallback() {
        let mut registry = ProviderRegistry::new();
        registry.register("aws_vpc", mock_with_immutable(&["cidr"]));

        assert!(registry.get("aws_vpc").is_ok());
        assert!(registry.get("aws_db").is_err());
        assert!(!registry.supports("aws_db"));

        registry.set_fallback(mock_with_immutable(&[]));
        assert!(registry.get("aws_db").is_ok());
        assert!(registry.supports("aws_db"));
    }

    #[test]
    fn test_immutable_fields_merge_overrides() {
        let mut registry = ProviderRegistry::new();
        registry.register("aws_vpc", mock_with_immutable(&["cidr"]));
        registry.add_immutable("aws_vpc", ["region"]);

        let fields = registry.immutable_fields("aws_vpc").unwrap();
        assert_eq!(
            fields,
            BTreeSet::from([String::from("cidr"), String::from("region")])
        );
        assert_eq!(registry.types(), vec![String::from("aws_vpc")]);
    }
}

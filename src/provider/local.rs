//! Local-directory provider.
//!
//! Persists every object as `<root>/<type>/<id>.json`. Handy for trying out
//! declarations without cloud access and for end-to-end tests.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;
use uuid::Uuid;

use super::ProviderAdapter;
use crate::error::{ProviderError, Result};
use crate::model::{Attributes, is_identifier};

/// Provider that stores objects as JSON files.
#[derive(Debug, Clone)]
pub struct LocalProvider {
    root: PathBuf,
    immutable: BTreeMap<String, BTreeSet<String>>,
}

impl LocalProvider {
    /// Creates a provider rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            immutable: BTreeMap::new(),
        }
    }

    /// Declares immutable fields for a type.
    #[must_use]
    pub fn with_immutable<I, S>(mut self, resource_type: &str, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.immutable
            .entry(resource_type.to_string())
            .or_default()
            .extend(fields.into_iter().map(Into::into));
        self
    }

    /// Root directory of the object store.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, resource_type: &str, id: &str) -> Result<PathBuf> {
        if !is_identifier(resource_type) || !is_identifier(id) {
            return Err(ProviderError::permanent(
                format!("{resource_type}/{id}"),
                "invalid resource type or id",
            )
            .into());
        }
        Ok(self.root.join(resource_type).join(format!("{id}.json")))
    }

    async fn load(&self, resource_type: &str, id: &str) -> Result<Attributes> {
        let path = self.object_path(resource_type, id)?;
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(ProviderError::not_found(resource_type, id).into());
            }
            Err(e) => return Err(ProviderError::transient(id, e.to_string()).into()),
        };
        serde_json::from_str(&content).map_err(|e| {
            ProviderError::permanent(id, format!("corrupted object file: {e}")).into()
        })
    }

    async fn store(&self, resource_type: &str, id: &str, attributes: &Attributes) -> Result<()> {
        let path = self.object_path(resource_type, id)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| ProviderError::transient(id, e.to_string()))?;
        }
        let content = serde_json::to_string_pretty(attributes)
            .map_err(|e| ProviderError::permanent(id, e.to_string()))?;

        let temp = path.with_extension("json.tmp");
        fs::write(&temp, content)
            .await
            .map_err(|e| ProviderError::transient(id, e.to_string()))?;
        fs::rename(&temp, &path)
            .await
            .map_err(|e| ProviderError::transient(id, e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl ProviderAdapter for LocalProvider {
    async fn read(&self, resource_type: &str, id: &str) -> Result<Attributes> {
        self.load(resource_type, id).await
    }

    async fn create(&self, resource_type: &str, desired: &Attributes) -> Result<(String, Attributes)> {
        let id = format!("{}-{}", resource_type.replace('_', "-"), &Uuid::new_v4().simple().to_string()[..12]);
        let mut attributes = desired.clone();
        attributes.insert(String::from("id"), Value::String(id.clone()));
        self.store(resource_type, &id, &attributes).await?;
        debug!(resource_type, id = %id, "Created local object");
        Ok((id, attributes))
    }

    async fn update(
        &self,
        resource_type: &str,
        id: &str,
        changes: &Attributes,
        _desired: &Attributes,
    ) -> Result<Attributes> {
        let mut attributes = self.load(resource_type, id).await?;
        for (field, value) in changes {
            if value.is_null() {
                attributes.remove(field);
            } else {
                attributes.insert(field.clone(), value.clone());
            }
        }
        self.store(resource_type, id, &attributes).await?;
        debug!(resource_type, id, fields = changes.len(), "Updated local object");
        Ok(attributes)
    }

    async fn delete(&self, resource_type: &str, id: &str) -> Result<()> {
        let path = self.object_path(resource_type, id)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!(resource_type, id, "Deleted local object");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(ProviderError::not_found(resource_type, id).into())
            }
            Err(e) => Err(ProviderError::transient(id, e.to_string()).into()),
        }
    }

    fn immutable_fields(&self, resource_type: &str) -> BTreeSet<String> {
        self.immutable.get(resource_type).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn attrs(value: Value) -> Attributes {
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn test_crud_cycle() {
        let temp = TempDir::new().unwrap();
        let provider = LocalProvider::new(temp.path());

        let (id, created) = provider
            .create("aws_vpc", &attrs(json!({"cidr": "10.0.0.0/16", "name": "main"})))
            .await
            .unwrap();
        assert_eq!(created["id"], json!(id));
        assert_eq!(provider.read("aws_vpc", &id).await.unwrap(), created);

        let changes = attrs(json!({"name": "primary", "cidr": null}));
        let updated = provider
            .update("aws_vpc", &id, &changes, &Attributes::new())
            .await
            .unwrap();
        assert_eq!(updated["name"], json!("primary"));
        assert!(!updated.contains_key("cidr"));

        provider.delete("aws_vpc", &id).await.unwrap();
        let err = provider.read("aws_vpc", &id).await.unwrap_err();
        assert!(err.is_not_found());
        assert!(provider.delete("aws_vpc", &id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_rejects_path_traversal() {
        let temp = TempDir::new().unwrap();
        let provider = LocalProvider::new(temp.path());
        assert!(provider.read("aws_vpc", "../../etc/passwd").await.is_err());
    }

    #[test]
    fn test_immutable_fields() {
        let provider = LocalProvider::new("/tmp").with_immutable("aws_vpc", ["cidr"]);
        assert!(provider.immutable_fields("aws_vpc").contains("cidr"));
        assert!(provider.immutable_fields("aws_db").is_empty());
    }
}

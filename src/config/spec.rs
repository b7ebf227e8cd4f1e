//! Configuration document types.
//!
//! This module defines the structs that map to the `keystone.yaml` file. The
//! document is declarative: it fully describes the desired resources, where
//! their state lives and how the engine should run.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use validator::Validate;

use crate::error::Result;
use crate::executor::RetryPolicy;
use crate::graph::DependencyGraph;
use crate::model::{Declaration, ResourceNode, expand};
use crate::state::DEFAULT_LOCK_TIMEOUT_SECS;

/// The root configuration document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Validate)]
pub struct DeployConfig {
    /// Project-level configuration.
    #[validate(nested)]
    pub project: ProjectConfig,
    /// State backend configuration.
    #[serde(default)]
    #[validate(nested)]
    pub state: StateConfig,
    /// Engine tuning.
    #[serde(default)]
    #[validate(nested)]
    pub engine: EngineConfig,
    /// Values available to `${var.<name>}` expressions.
    #[serde(default)]
    pub variables: BTreeMap<String, Value>,
    /// Provider adapters. Defaults to one local adapter serving every type.
    #[serde(default = "default_providers")]
    #[validate(nested)]
    pub providers: Vec<ProviderConfig>,
    /// Declared resources.
    #[serde(default)]
    pub resources: Vec<Declaration>,
}

/// Project-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Validate)]
pub struct ProjectConfig {
    /// Unique name for the project.
    #[validate(length(min = 1, max = 63, message = "must be between 1 and 63 characters"))]
    pub name: String,
    /// Environment (e.g., "dev", "staging", "prod").
    #[serde(default = "default_environment")]
    #[validate(length(min = 1, message = "cannot be empty"))]
    pub environment: String,
}

/// State backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Validate)]
pub struct StateConfig {
    /// Backend type.
    #[serde(default)]
    pub backend: StateBackend,
    /// Local state directory (local backend) or store key (memory backend).
    #[serde(default)]
    pub path: Option<String>,
    /// S3 bucket name (required for the s3 backend).
    #[serde(default)]
    pub bucket: Option<String>,
    /// S3 key prefix.
    #[serde(default)]
    pub prefix: Option<String>,
    /// S3 region; the AWS default chain decides when unset.
    #[serde(default)]
    pub region: Option<String>,
    /// Seconds without heartbeat after which a lock is stale.
    #[serde(default = "default_lock_timeout")]
    #[validate(range(min = 1, message = "must be at least one second"))]
    pub lock_timeout_secs: u64,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            backend: StateBackend::default(),
            path: None,
            bucket: None,
            prefix: None,
            region: None,
            lock_timeout_secs: DEFAULT_LOCK_TIMEOUT_SECS,
        }
    }
}

/// State backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// Local file-based state storage.
    #[default]
    Local,
    /// AWS S3-based state storage.
    S3,
    /// Process-local storage, lost on exit.
    Memory,
}

impl std::fmt::Display for StateBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::S3 => write!(f, "s3"),
            Self::Memory => write!(f, "memory"),
        }
    }
}

/// Engine tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Validate)]
pub struct EngineConfig {
    /// Maximum actions in flight within one level.
    #[serde(default = "default_parallelism")]
    #[validate(range(min = 1, max = 256, message = "must be between 1 and 256"))]
    pub parallelism: usize,
    /// Seconds between lock heartbeats during an apply.
    #[serde(default = "default_heartbeat")]
    #[validate(range(min = 1, message = "must be at least one second"))]
    pub heartbeat_secs: u64,
    /// Plan/apply rounds a reconcile makes before giving up on conflicts.
    #[serde(default = "default_max_attempts")]
    #[validate(range(min = 1, max = 20, message = "must be between 1 and 20"))]
    pub max_attempts: u32,
    /// Retry policy for transient provider errors.
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            heartbeat_secs: default_heartbeat(),
            max_attempts: default_max_attempts(),
            retry: RetryPolicy::default(),
        }
    }
}

/// A provider adapter and the types it serves.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Validate)]
pub struct ProviderConfig {
    /// Adapter implementation.
    #[serde(default)]
    pub kind: ProviderKind,
    /// Object directory for the local adapter.
    #[serde(default)]
    pub root: Option<String>,
    /// Resource types served. Empty means every type without a registration.
    #[serde(default)]
    pub types: Vec<String>,
    /// Fields whose change forces a replacement, by resource type.
    #[serde(default)]
    pub immutable: BTreeMap<String, Vec<String>>,
}

impl ProviderConfig {
    /// Returns true if this provider serves unregistered types.
    #[must_use]
    pub fn is_fallback(&self) -> bool {
        self.types.is_empty()
    }
}

/// Built-in adapter implementations.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Objects stored as JSON files on disk.
    #[default]
    Local,
    /// Objects held in process memory.
    Memory,
}

fn default_environment() -> String {
    String::from("dev")
}

const fn default_lock_timeout() -> u64 {
    DEFAULT_LOCK_TIMEOUT_SECS
}

const fn default_parallelism() -> usize {
    crate::executor::DEFAULT_PARALLELISM
}

const fn default_heartbeat() -> u64 {
    crate::executor::DEFAULT_HEARTBEAT_SECS
}

const fn default_max_attempts() -> u32 {
    3
}

fn default_providers() -> Vec<ProviderConfig> {
    vec![ProviderConfig {
        kind: ProviderKind::Local,
        root: None,
        types: Vec::new(),
        immutable: BTreeMap::new(),
    }]
}

impl DeployConfig {
    /// Expands the declarations into concrete nodes.
    ///
    /// # Errors
    ///
    /// Returns an error if expansion fails (see [`expand`]).
    pub fn nodes(&self) -> Result<Vec<ResourceNode>> {
        expand(&self.resources, &self.variables)
    }

    /// Expands the declarations and builds the dependency graph.
    ///
    /// # Errors
    ///
    /// Returns an error if expansion fails or the graph is invalid.
    pub fn graph(&self) -> Result<DependencyGraph> {
        let nodes = self.nodes()?;
        let populated: BTreeSet<String> = nodes.iter().map(|n| n.address.group()).collect();
        let empty = self
            .resource_groups()
            .into_iter()
            .filter(|group| !populated.contains(group));
        Ok(DependencyGraph::build_with_groups(nodes, empty)?)
    }

    /// Distinct declared resource types.
    #[must_use]
    pub fn resource_types(&self) -> BTreeSet<&str> {
        self.resources
            .iter()
            .map(|r| r.resource_type.as_str())
            .collect()
    }

    /// Returns the declared `type.name` groups.
    #[must_use]
    pub fn resource_groups(&self) -> Vec<String> {
        self.resources.iter().map(Declaration::group).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> DeployConfig {
        serde_yaml::from_str("project:\n  name: demo\n").unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = minimal();
        assert_eq!(config.project.environment, "dev");
        assert_eq!(config.state.backend, StateBackend::Local);
        assert_eq!(config.state.lock_timeout_secs, DEFAULT_LOCK_TIMEOUT_SECS);
        assert_eq!(config.engine.parallelism, crate::executor::DEFAULT_PARALLELISM);
        assert_eq!(config.engine.max_attempts, 3);
        assert_eq!(config.providers.len(), 1);
        assert!(config.providers[0].is_fallback());
        assert!(config.resources.is_empty());
    }

    #[test]
    fn test_derive_validation() {
        let mut config = minimal();
        assert!(config.validate().is_ok());

        config.engine.parallelism = 0;
        config.project.name = String::new();
        let errors = config.validate().unwrap_err().to_string();
        assert!(errors.contains("parallelism"));
        assert!(errors.contains("name"));
    }

    #[test]
    fn test_graph_from_declarations() {
        let config: DeployConfig = serde_yaml::from_str(
            r#"
project:
  name: demo
variables:
  cidr: 10.0.0.0/16
resources:
  - type: net
    name: main
    attributes:
      cidr: "${var.cidr}"
  - type: subnet
    name: private
    count: 2
    attributes:
      vpc: "${net.main.id}"
"#,
        )
        .unwrap();

        let graph = config.graph().unwrap();
        assert_eq!(graph.len(), 3);
        assert_eq!(graph.edge_count(), 2);
        assert_eq!(config.resource_types().len(), 2);
        assert_eq!(config.resource_groups(), vec!["net.main", "subnet.private"]);
    }

    #[test]
    fn test_graph_keeps_zero_count_groups() {
        let config: DeployConfig = serde_yaml::from_str(
            r#"
project:
  name: demo
resources:
  - type: worker
    name: pool
    count: 0
  - type: lb
    name: main
    attributes:
      targets: "${worker.pool[*].id}"
"#,
        )
        .unwrap();

        let graph = config.graph().unwrap();
        assert_eq!(graph.len(), 1);
        assert_eq!(graph.edge_count(), 0);
        assert_eq!(graph.empty_groups().collect::<Vec<_>>(), vec!["worker.pool"]);
    }
}

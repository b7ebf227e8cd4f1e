//! Turns the state and provider sections into live backends.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::spec::{DeployConfig, ProviderKind, StateBackend, StateConfig};
use crate::error::{ConfigError, Result};
use crate::executor::ExecutorOptions;
use crate::provider::{LocalProvider, MemoryProvider, ProviderAdapter, ProviderRegistry};
use crate::state::{LocalStateStore, MemoryStateStore, S3StateStore, STATE_DIR, StateStore};

/// Directory under the state directory holding local provider objects.
const OBJECTS_DIR: &str = "objects";

/// Opens the configured state store. Relative local paths resolve against
/// `base_dir`.
///
/// # Errors
///
/// Returns an error if the s3 backend has no bucket or its client cannot be
/// initialized.
pub async fn open_state_store(state: &StateConfig, base_dir: &Path) -> Result<Arc<dyn StateStore>> {
    let store: Arc<dyn StateStore> = match state.backend {
        StateBackend::Local => {
            let dir = state
                .path
                .as_ref()
                .map_or_else(|| base_dir.join(STATE_DIR), |p| base_dir.join(p));
            debug!("Using local state at {}", dir.display());
            Arc::new(LocalStateStore::with_base_dir(dir).with_lock_timeout(state.lock_timeout_secs))
        }
        StateBackend::S3 => {
            let bucket = state
                .bucket
                .as_deref()
                .filter(|b| !b.is_empty())
                .ok_or_else(|| ConfigError::validation("S3 bucket not configured", "state.bucket"))?;
            let store = S3StateStore::new(bucket, state.prefix.as_deref(), state.region.as_deref())
                .await?
                .with_lock_timeout(state.lock_timeout_secs);
            Arc::new(store)
        }
        StateBackend::Memory => {
            let key = state.path.as_deref().unwrap_or("memory");
            Arc::new(MemoryStateStore::shared(key).with_lock_timeout(state.lock_timeout_secs))
        }
    };
    info!(backend = %state.backend, location = %store.location(), "Opened state store");
    Ok(store)
}

/// Builds the provider registry from the `providers` section.
#[must_use]
pub fn build_registry(config: &DeployConfig, base_dir: &Path) -> ProviderRegistry {
    let mut registry = ProviderRegistry::new();

    for provider in &config.providers {
        let adapter: Arc<dyn ProviderAdapter> = match provider.kind {
            ProviderKind::Local => {
                let root = provider.root.as_ref().map_or_else(
                    || base_dir.join(STATE_DIR).join(OBJECTS_DIR),
                    |r| base_dir.join(r),
                );
                Arc::new(LocalProvider::new(root))
            }
            ProviderKind::Memory => Arc::new(MemoryProvider::new()),
        };

        for (resource_type, fields) in &provider.immutable {
            registry.add_immutable(resource_type.as_str(), fields.iter().cloned());
        }

        if provider.is_fallback() {
            registry.set_fallback(adapter);
        } else {
            for resource_type in &provider.types {
                registry.register(resource_type.as_str(), Arc::clone(&adapter));
            }
        }
    }

    registry
}

/// Executor options from the `engine` section.
#[must_use]
pub fn executor_options(config: &DeployConfig) -> ExecutorOptions {
    ExecutorOptions {
        parallelism: config.engine.parallelism.max(1),
        retry: config.engine.retry.clone(),
        heartbeat_interval: Duration::from_secs(config.engine.heartbeat_secs.max(1)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;

    #[tokio::test]
    async fn test_local_backends() {
        let dir = tempfile::tempdir().unwrap();
        let config = ConfigParser::new()
            .parse_yaml(
                r"
project:
  name: demo
engine:
  parallelism: 3
providers:
  - kind: memory
    types: [queue]
  - kind: local
    immutable:
      network: [cidr]
",
                None,
            )
            .unwrap();

        let store = open_state_store(&config.state, dir.path()).await.unwrap();
        assert_eq!(store.backend_type(), "local");
        assert!(store.location().contains(STATE_DIR));

        let registry = build_registry(&config, dir.path());
        assert_eq!(registry.types(), vec!["queue"]);
        assert!(registry.supports("anything"));
        assert!(registry.immutable_fields("network").unwrap().contains("cidr"));

        let options = executor_options(&config);
        assert_eq!(options.parallelism, 3);
        assert_eq!(options.heartbeat_interval, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_s3_requires_bucket() {
        let state = StateConfig {
            backend: StateBackend::S3,
            ..StateConfig::default()
        };
        let result = open_state_store(&state, Path::new(".")).await;
        assert!(result.is_err());
    }
}

//! Configuration parser for loading configuration files.
//!
//! This module handles loading configuration from YAML files and environment
//! variables, with proper precedence and error handling.

use crate::error::{ConfigError, KeystoneError, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::spec::{DeployConfig, StateBackend};

/// Configuration parser for loading the configuration document.
#[derive(Debug, Default)]
pub struct ConfigParser {
    /// Base path for resolving `.env` and relative paths.
    base_path: Option<PathBuf>,
}

impl ConfigParser {
    /// Creates a new configuration parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the base path for resolving relative paths.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<DeployConfig> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(KeystoneError::Config(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            KeystoneError::Config(ConfigError::ParseError {
                message: format!("Failed to read file: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        self.parse_yaml(&content, Some(path))
    }

    /// Parses configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<DeployConfig> {
        debug!("Parsing YAML configuration");

        let config: DeployConfig = serde_yaml::from_str(content).map_err(|e| {
            let location = source
                .map(|p| p.display().to_string())
                .or_else(|| e.location().map(|l| format!("line {}, column {}", l.line(), l.column())));
            KeystoneError::Config(ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location,
            })
        })?;

        debug!(
            project = %config.project.name,
            resources = config.resources.len(),
            "Parsed configuration"
        );
        Ok(config)
    }

    /// Loads configuration with environment variable overrides.
    ///
    /// Environment variables are checked in the format
    /// `KEYSTONE_<SECTION>_<KEY>` (e.g., `KEYSTONE_PROJECT_NAME`).
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or an override
    /// holds an invalid value.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<DeployConfig> {
        let mut config = self.load_file(path)?;
        Self::apply_overrides(&mut config, |name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Applies `KEYSTONE_*` overrides looked up through `lookup`.
    fn apply_overrides<F>(config: &mut DeployConfig, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(name) = lookup("KEYSTONE_PROJECT_NAME") {
            debug!("Overriding project.name from environment");
            config.project.name = name;
        }

        if let Some(env) = lookup("KEYSTONE_PROJECT_ENVIRONMENT") {
            debug!("Overriding project.environment from environment");
            config.project.environment = env;
        }

        if let Some(backend) = lookup("KEYSTONE_STATE_BACKEND") {
            debug!("Overriding state.backend from environment");
            config.state.backend = match backend.to_ascii_lowercase().as_str() {
                "local" => StateBackend::Local,
                "s3" => StateBackend::S3,
                "memory" => StateBackend::Memory,
                other => {
                    return Err(ConfigError::validation(
                        format!("unknown state backend '{other}'"),
                        "KEYSTONE_STATE_BACKEND",
                    )
                    .into());
                }
            };
        }

        if let Some(path) = lookup("KEYSTONE_STATE_PATH") {
            debug!("Overriding state.path from environment");
            config.state.path = Some(path);
        }

        if let Some(bucket) = lookup("KEYSTONE_STATE_BUCKET") {
            debug!("Overriding state.bucket from environment");
            config.state.bucket = Some(bucket);
        }

        if let Some(prefix) = lookup("KEYSTONE_STATE_PREFIX") {
            debug!("Overriding state.prefix from environment");
            config.state.prefix = Some(prefix);
        }

        if let Some(region) = lookup("KEYSTONE_STATE_REGION") {
            debug!("Overriding state.region from environment");
            config.state.region = Some(region);
        }

        if let Some(parallelism) = lookup("KEYSTONE_PARALLELISM") {
            debug!("Overriding engine.parallelism from environment");
            config.engine.parallelism = parallelism.trim().parse().map_err(|_| {
                ConfigError::validation(
                    format!("'{parallelism}' is not a positive integer"),
                    "KEYSTONE_PARALLELISM",
                )
            })?;
        }

        Ok(())
    }

    /// Loads the .env file if present.
    ///
    /// Variables already set in the process environment take precedence.
    ///
    /// # Errors
    ///
    /// Returns an error if the .env file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| {
                KeystoneError::Config(ConfigError::ParseError {
                    message: format!("Failed to load .env file: {e}"),
                    location: Some(env_path.display().to_string()),
                })
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }

    /// Resolves a path from the configuration relative to the base path.
    #[must_use]
    pub fn resolve_path(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        match &self.base_path {
            Some(base) if path.is_relative() => base.join(path),
            _ => path.to_path_buf(),
        }
    }

    /// Directory that relative paths are resolved against.
    #[must_use]
    pub fn base_dir(&self) -> PathBuf {
        self.base_path.clone().unwrap_or_else(|| PathBuf::from("."))
    }
}

/// Default configuration file names to search for.
pub const DEFAULT_CONFIG_FILES: &[&str] = &["keystone.yaml", "keystone.yml", "infra.yaml"];

/// Finds the configuration file in the given directory or its parents.
///
/// # Errors
///
/// Returns an error if no configuration file is found.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let start = start_dir.as_ref();
    let mut current = match start.canonicalize() {
        Ok(path) => path,
        Err(e) => {
            warn!("Cannot canonicalize {}: {e}", start.display());
            start.to_path_buf()
        }
    };

    loop {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = current.join(filename);
            if config_path.exists() {
                info!("Found configuration file: {}", config_path.display());
                return Ok(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(KeystoneError::Config(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_parse_minimal_config() {
        let yaml = r"
project:
  name: test-project
state:
  backend: local
";
        let parser = ConfigParser::new();
        let config = parser.parse_yaml(yaml, None).unwrap();
        assert_eq!(config.project.name, "test-project");
        assert_eq!(config.project.environment, "dev");
        assert!(config.resources.is_empty());
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
project:
  name: platform
  environment: prod

state:
  backend: s3
  bucket: platform-state
  prefix: platform/prod
  lock_timeout_secs: 120

engine:
  parallelism: 4
  retry:
    max_attempts: 6

variables:
  region: eu-west-1

providers:
  - kind: local
    root: .keystone/objects
    immutable:
      network: [cidr]

resources:
  - type: network
    name: main
    attributes:
      cidr: 10.0.0.0/16
      region: "${var.region}"
  - type: subnet
    name: private
    for_each: [a, b]
    attributes:
      network_id: "${network.main.id}"
      zone: "${each.key}"
    lifecycle:
      create_before_destroy: true
"#;
        let parser = ConfigParser::new();
        let config = parser.parse_yaml(yaml, None).unwrap();
        assert_eq!(config.project.name, "platform");
        assert_eq!(config.state.backend, StateBackend::S3);
        assert_eq!(config.state.lock_timeout_secs, 120);
        assert_eq!(config.engine.parallelism, 4);
        assert_eq!(config.engine.retry.max_attempts, 6);
        assert_eq!(config.engine.retry.initial_backoff_ms, 500);
        assert_eq!(config.resources.len(), 2);
        assert!(config.resources[1].lifecycle.create_before_destroy);
        assert_eq!(config.providers[0].immutable["network"], vec!["cidr"]);
    }

    #[test]
    fn test_parse_error_is_config_error() {
        let err = ConfigParser::new()
            .parse_yaml("project: [unterminated", None)
            .unwrap_err();
        assert!(matches!(err, KeystoneError::Config(ConfigError::ParseError { .. })));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = ConfigParser::new()
            .parse_yaml("project:\n  name: demo\n", None)
            .unwrap();
        let env: HashMap<&str, &str> = [
            ("KEYSTONE_PROJECT_NAME", "renamed"),
            ("KEYSTONE_STATE_BACKEND", "S3"),
            ("KEYSTONE_STATE_BUCKET", "bucket"),
            ("KEYSTONE_PARALLELISM", "7"),
        ]
        .into_iter()
        .collect();

        ConfigParser::apply_overrides(&mut config, |k| env.get(k).map(ToString::to_string))
            .unwrap();
        assert_eq!(config.project.name, "renamed");
        assert_eq!(config.state.backend, StateBackend::S3);
        assert_eq!(config.state.bucket.as_deref(), Some("bucket"));
        assert_eq!(config.engine.parallelism, 7);

        let bad = ConfigParser::apply_overrides(&mut config, |k| {
            (k == "KEYSTONE_PARALLELISM").then(|| String::from("many"))
        });
        assert!(bad.is_err());
    }

    #[test]
    fn test_find_config_file_searches_upward() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(dir.path().join("infra.yaml"), "project:\n  name: x\n").unwrap();

        let found = find_config_file(&nested).unwrap();
        assert_eq!(found.file_name().unwrap(), "infra.yaml");

        let parser = ConfigParser::new().with_base_path(dir.path());
        assert_eq!(parser.resolve_path("state"), dir.path().join("state"));
        assert_eq!(parser.resolve_path("/abs"), PathBuf::from("/abs"));
    }
}

//! Configuration module.
//!
//! This module handles all configuration-related functionality:
//! - Parsing and deserializing `keystone.yaml`
//! - Validation of configuration values
//! - Opening the configured state store and provider adapters
//! - Computing content hashes for change detection

mod backends;
mod hash;
mod parser;
mod spec;
mod validator;

pub use backends::{build_registry, executor_options, open_state_store};
pub use hash::{ContentHasher, canonical_json};
pub use parser::{ConfigParser, DEFAULT_CONFIG_FILES, find_config_file};
pub use spec::{
    DeployConfig, EngineConfig, ProjectConfig, ProviderConfig, ProviderKind, StateBackend,
    StateConfig,
};
pub use validator::{ConfigValidator, ValidationError, ValidationResult};

//! Configuration validation.
//!
//! Field-level limits come from the `validator` derive on the document types.
//! This module adds the semantic checks that need the whole document:
//! naming, backend requirements, provider coverage, declaration
//! consistency, and finally a trial graph build.

use crate::error::{ConfigError, KeystoneError, Result};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;
use validator::{Validate, ValidationErrors, ValidationErrorsKind};

use super::spec::{DeployConfig, ProjectConfig, ProviderConfig, ProviderKind, StateBackend, StateConfig};
use crate::executor::RetryPolicy;
use crate::model::{Declaration, ResourceRef, is_identifier, is_valid_key};

/// Validator for configuration documents.
#[derive(Debug, Default)]
pub struct ConfigValidator {
    /// Resource types served by adapters registered outside the document.
    extra_types: BTreeSet<String>,
}

/// Validation result containing all errors found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl ValidationResult {
    fn error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of errors.
    #[must_use]
    pub const fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Returns the number of warnings.
    #[must_use]
    pub const fn warning_count(&self) -> usize {
        self.warnings.len()
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl ConfigValidator {
    /// Creates a new validator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a resource type served by an adapter registered in code.
    pub fn add_provided_type(&mut self, resource_type: impl Into<String>) {
        self.extra_types.insert(resource_type.into());
    }

    /// Validates a configuration document.
    ///
    /// # Errors
    ///
    /// Returns the first validation error if any check fails.
    pub fn validate(&self, config: &DeployConfig) -> Result<ValidationResult> {
        let result = self.check(config);

        match result.errors.first() {
            None => {
                debug!("Configuration validation passed");
                Ok(result)
            }
            Some(first) => Err(KeystoneError::Config(ConfigError::ValidationError {
                message: first.message.clone(),
                field: Some(first.field.clone()),
            })),
        }
    }

    /// Runs every check and collects all errors and warnings.
    #[must_use]
    pub fn check(&self, config: &DeployConfig) -> ValidationResult {
        let mut result = ValidationResult::default();

        if let Err(errors) = config.validate() {
            collect_field_errors("", &errors, &mut result);
            result.errors.sort_by(|a, b| a.field.cmp(&b.field));
        }

        Self::validate_project(&config.project, &mut result);
        Self::validate_state(&config.state, &mut result);
        Self::validate_retry(&config.engine.retry, &mut result);
        self.validate_providers(config, &mut result);
        Self::validate_resources(config, &mut result);

        // Only worth attempting once the declarations are individually sound.
        if result.is_valid()
            && !config.resources.is_empty()
            && let Err(e) = config.graph()
        {
            result.error("resources", e.to_string());
        }

        result
    }

    fn validate_project(project: &ProjectConfig, result: &mut ValidationResult) {
        if !project.name.is_empty() && !is_valid_name(&project.name) {
            result.error(
                "project.name",
                format!(
                    "Project name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    project.name
                ),
            );
        }
    }

    fn validate_state(state: &StateConfig, result: &mut ValidationResult) {
        match state.backend {
            StateBackend::S3 => {
                if state.bucket.as_deref().is_none_or(str::is_empty) {
                    result.error(
                        "state.bucket",
                        "S3 bucket name is required when using S3 backend",
                    );
                }
            }
            StateBackend::Local => {
                if state.bucket.is_some() {
                    result
                        .warnings
                        .push(String::from("state.bucket is ignored by the local backend"));
                }
            }
            StateBackend::Memory => {
                result.warnings.push(String::from(
                    "state.backend is memory: state is lost when the process exits",
                ));
            }
        }
    }

    fn validate_retry(retry: &RetryPolicy, result: &mut ValidationResult) {
        if retry.max_attempts == 0 {
            result.error("engine.retry.max_attempts", "must be at least 1");
        }
        if retry.multiplier < 1.0 {
            result.error("engine.retry.multiplier", "must be at least 1.0");
        }
        if retry.initial_backoff_ms > retry.max_backoff_ms {
            result.error(
                "engine.retry.initial_backoff_ms",
                "cannot exceed engine.retry.max_backoff_ms",
            );
        }
    }

    fn validate_providers(&self, config: &DeployConfig, result: &mut ValidationResult) {
        let mut claimed: BTreeMap<&str, usize> = BTreeMap::new();
        let mut fallbacks = 0;

        for (i, provider) in config.providers.iter().enumerate() {
            let prefix = format!("providers[{i}]");
            if provider.is_fallback() {
                fallbacks += 1;
            }
            for resource_type in &provider.types {
                if !is_identifier(resource_type) {
                    result.error(
                        format!("{prefix}.types"),
                        format!("'{resource_type}' is not a valid resource type"),
                    );
                }
                if let Some(first) = claimed.insert(resource_type, i) {
                    result.error(
                        format!("{prefix}.types"),
                        format!("type '{resource_type}' is already served by providers[{first}]"),
                    );
                }
            }
            Self::validate_provider_settings(provider, &prefix, result);
        }

        if fallbacks > 1 {
            result.error(
                "providers",
                "only one provider may omit 'types' and serve every other type",
            );
        }

        if fallbacks == 0 {
            for resource_type in config.resource_types() {
                if !claimed.contains_key(resource_type) && !self.extra_types.contains(resource_type) {
                    result.error(
                        "resources",
                        format!("no provider serves resource type '{resource_type}'"),
                    );
                }
            }
        }
    }

    fn validate_provider_settings(provider: &ProviderConfig, prefix: &str, result: &mut ValidationResult) {
        match provider.kind {
            ProviderKind::Local => {
                if provider.root.as_deref().is_some_and(|r| r.trim().is_empty()) {
                    result.error(format!("{prefix}.root"), "cannot be empty");
                }
            }
            ProviderKind::Memory => {
                if provider.root.is_some() {
                    result
                        .warnings
                        .push(format!("{prefix}.root is ignored by the memory provider"));
                }
            }
        }
        for (resource_type, fields) in &provider.immutable {
            if !is_identifier(resource_type) {
                result.error(
                    format!("{prefix}.immutable"),
                    format!("'{resource_type}' is not a valid resource type"),
                );
            }
            if fields.iter().any(|f| f.is_empty()) {
                result.error(
                    format!("{prefix}.immutable.{resource_type}"),
                    "field names cannot be empty",
                );
            }
        }
    }

    fn validate_resources(config: &DeployConfig, result: &mut ValidationResult) {
        if config.resources.is_empty() {
            result
                .warnings
                .push(String::from("No resources defined in configuration"));
            return;
        }

        let groups: BTreeSet<String> = config.resources.iter().map(Declaration::group).collect();
        let mut seen = BTreeSet::new();

        for (i, decl) in config.resources.iter().enumerate() {
            let prefix = format!("resources[{i}]");

            if !is_identifier(&decl.resource_type) {
                result.error(
                    format!("{prefix}.type"),
                    format!("'{}' is not a valid resource type", decl.resource_type),
                );
            }
            if !is_identifier(&decl.name) {
                result.error(
                    format!("{prefix}.name"),
                    format!("'{}' is not a valid resource name", decl.name),
                );
            }
            if !seen.insert(decl.group()) {
                result.error(
                    format!("{prefix}.name"),
                    format!("Duplicate {} name: {}", decl.resource_type, decl.name),
                );
            }

            Self::validate_cardinality(decl, &prefix, result);

            for (j, dependency) in decl.depends_on.iter().enumerate() {
                match ResourceRef::parse_dependency(dependency) {
                    Ok(target) if !groups.contains(&target.group()) => result.error(
                        format!("{prefix}.depends_on[{j}]"),
                        format!("'{dependency}' does not name a declared resource"),
                    ),
                    Ok(target) if target.group() == decl.group() => result.error(
                        format!("{prefix}.depends_on[{j}]"),
                        "a resource cannot depend on itself",
                    ),
                    Ok(_) => {}
                    Err(message) => result.error(format!("{prefix}.depends_on[{j}]"), message),
                }
            }

            for field in &decl.lifecycle.ignore_changes {
                if !decl.attributes.contains_key(field) {
                    result.warnings.push(format!(
                        "{prefix}.lifecycle.ignore_changes: '{field}' is not a declared attribute"
                    ));
                }
            }
        }
    }

    fn validate_cardinality(decl: &Declaration, prefix: &str, result: &mut ValidationResult) {
        if decl.count.is_some() && decl.for_each.is_some() {
            result.error(prefix, "count and for_each are mutually exclusive");
        }
        if decl.count == Some(0) {
            result
                .warnings
                .push(format!("{prefix}.count is 0: no instances will exist"));
        }
        if let Some(crate::model::ForEach::List(keys)) = &decl.for_each {
            if let Some(bad) = keys.iter().find(|k| !is_valid_key(k)) {
                result.error(
                    format!("{prefix}.for_each"),
                    format!("'{bad}' is not a valid instance key"),
                );
            }
            let unique: BTreeSet<&String> = keys.iter().collect();
            if unique.len() != keys.len() {
                result.error(format!("{prefix}.for_each"), "keys must be unique");
            }
        }
    }
}

/// Flattens derive-level errors into `result` with dotted field paths.
fn collect_field_errors(prefix: &str, errors: &ValidationErrors, result: &mut ValidationResult) {
    for (field, kind) in errors.errors() {
        let path = if prefix.is_empty() {
            field.to_string()
        } else {
            format!("{prefix}.{field}")
        };
        match kind {
            ValidationErrorsKind::Field(list) => {
                for error in list {
                    let message = error
                        .message
                        .as_ref()
                        .map_or_else(|| error.code.to_string(), ToString::to_string);
                    result.error(path.clone(), message);
                }
            }
            ValidationErrorsKind::Struct(inner) => collect_field_errors(&path, inner, result),
            ValidationErrorsKind::List(items) => {
                for (index, inner) in items {
                    collect_field_errors(&format!("{path}[{index}]"), inner, result);
                }
            }
        }
    }
}

/// Validates that a name follows the naming convention.
/// Names must be lowercase alphanumeric with hyphens, starting with a letter.
fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();

    // First character must be a letter
    if !chars.next().is_some_and(|c| c.is_ascii_lowercase()) {
        return false;
    }

    // Rest must be lowercase alphanumeric or hyphen
    if !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-') {
        return false;
    }

    !name.ends_with('-') && !name.contains("--")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;

    fn parse(yaml: &str) -> DeployConfig {
        ConfigParser::new().parse_yaml(yaml, None).unwrap()
    }

    fn fields(result: &ValidationResult) -> Vec<&str> {
        result.errors.iter().map(|e| e.field.as_str()).collect()
    }

    #[test]
    fn test_valid_name() {
        assert!(is_valid_name("platform"));
        assert!(is_valid_name("my-stack-123"));
        assert!(is_valid_name("a"));
    }

    #[test]
    fn test_invalid_name() {
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("Platform")); // uppercase
        assert!(!is_valid_name("123-stack")); // starts with number
        assert!(!is_valid_name("my_stack")); // underscore
        assert!(!is_valid_name("stack-")); // ends with hyphen
        assert!(!is_valid_name("my--stack")); // consecutive hyphens
    }

    #[test]
    fn test_valid_document() {
        let config = parse(
            r#"
project:
  name: platform
resources:
  - type: network
    name: main
    attributes:
      cidr: 10.0.0.0/16
  - type: subnet
    name: private
    depends_on: [network.main]
    attributes:
      network_id: "${network.main.id}"
"#,
        );
        let result = ConfigValidator::new().validate(&config).unwrap();
        assert!(result.is_valid());
        assert_eq!(result.warning_count(), 0);
    }

    #[test]
    fn test_collects_semantic_errors() {
        let config = parse(
            r"
project:
  name: Platform
state:
  backend: s3
resources:
  - type: network
    name: main
  - type: network
    name: main
  - type: subnet
    name: a
    count: 2
    for_each: [x]
    depends_on: [network.other]
",
        );
        let result = ConfigValidator::new().check(&config);
        let fields = fields(&result);
        assert!(fields.contains(&"project.name"));
        assert!(fields.contains(&"state.bucket"));
        assert!(fields.contains(&"resources[1].name"));
        assert!(fields.contains(&"resources[2]"));
        assert!(fields.contains(&"resources[2].depends_on[0]"));
        assert!(ConfigValidator::new().validate(&config).is_err());
    }

    #[test]
    fn test_derive_errors_are_flattened() {
        let mut config = parse("project:\n  name: platform\n");
        config.engine.parallelism = 0;
        let result = ConfigValidator::new().check(&config);
        assert_eq!(fields(&result), vec!["engine.parallelism"]);
        assert_eq!(result.errors[0].message, "must be between 1 and 256");
    }

    #[test]
    fn test_provider_coverage() {
        let yaml = r"
project:
  name: platform
providers:
  - kind: memory
    types: [network]
resources:
  - type: network
    name: main
  - type: database
    name: primary
";
        let config = parse(yaml);
        let result = ConfigValidator::new().check(&config);
        assert_eq!(result.error_count(), 1);
        assert!(result.errors[0].message.contains("database"));

        let mut validator = ConfigValidator::new();
        validator.add_provided_type("database");
        assert!(validator.check(&config).is_valid());
    }

    #[test]
    fn test_graph_errors_surface() {
        let config = parse(
            r#"
project:
  name: platform
resources:
  - type: a
    name: one
    attributes:
      peer: "${b.two.id}"
  - type: b
    name: two
    attributes:
      peer: "${a.one.id}"
"#,
        );
        let result = ConfigValidator::new().check(&config);
        assert_eq!(fields(&result), vec!["resources"]);
        assert!(result.errors[0].message.to_lowercase().contains("cycle"));
    }
}

//! Error types for the Keystone reconciliation engine.
//!
//! This module provides the error hierarchy for every stage of a run:
//! configuration, graph construction, state storage, providers, planning,
//! and apply.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for the Keystone engine.
#[derive(Debug, Error)]
pub enum KeystoneError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Dependency graph errors.
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    /// State management errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Provider errors.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Planning errors.
    #[error("Planning error: {0}")]
    Plan(#[from] PlanError),

    /// Apply errors.
    #[error("Apply error: {0}")]
    Apply(#[from] ApplyError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file was not found.
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The configuration file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// Environment variable is missing.
    #[error("Missing environment variable: {name}")]
    MissingEnvVar {
        /// Name of the missing variable.
        name: String,
    },

    /// A `${var.*}` expression names an undeclared variable.
    #[error("Unknown variable '{name}' referenced by {resource}")]
    UnknownVariable {
        /// Variable name.
        name: String,
        /// Resource declaring the expression.
        resource: String,
    },

    /// Duplicate resource definition.
    #[error("Duplicate {resource_type} name: {name}")]
    DuplicateName {
        /// Resource type.
        resource_type: String,
        /// The duplicated name.
        name: String,
    },
}

/// Dependency graph errors. All of them are build-time and fatal.
#[derive(Debug, Error)]
pub enum GraphError {
    /// The declared resources contain a dependency cycle.
    #[error("Dependency cycle detected among: {}", nodes.join(", "))]
    Cycle {
        /// Addresses participating in the cycle, sorted.
        nodes: Vec<String>,
    },

    /// A reference or `depends_on` entry names a resource that is not declared.
    #[error("{from} references undeclared resource {target}")]
    UnknownReference {
        /// Referencing resource.
        from: String,
        /// Missing target.
        target: String,
    },

    /// Two declarations expand to the same address.
    #[error("Duplicate resource address: {address}")]
    DuplicateAddress {
        /// The duplicated address.
        address: String,
    },

    /// A resource references itself.
    #[error("{address} references itself")]
    SelfReference {
        /// Offending address.
        address: String,
    },

    /// An attribute expression could not be parsed or applied.
    #[error("Invalid expression '{expression}' in {address}: {message}")]
    InvalidExpression {
        /// Resource holding the expression.
        address: String,
        /// The raw expression.
        expression: String,
        /// What is wrong with it.
        message: String,
    },
}

/// State management errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// State is corrupted.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// State lock acquisition failed for a reason other than contention.
    #[error("Failed to acquire state lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// State lock is held by another process.
    #[error("State is locked by another process (lock holder: {holder}, since: {since}, id: {lock_id})")]
    LockHeld {
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
        /// Lock identifier.
        lock_id: String,
    },

    /// The caller does not hold the lock it presented.
    #[error("Lock {lock_id} is not held (already released or owned by another holder)")]
    LockNotHeld {
        /// The presented lock identifier.
        lock_id: String,
    },

    /// A conditional commit saw a different serial than expected.
    #[error("State serial conflict: expected {expected}, found {found}; re-plan required")]
    Conflict {
        /// Serial supplied by the caller.
        expected: u64,
        /// Serial currently stored.
        found: u64,
    },

    /// Backend storage error.
    #[error("State backend error: {message}")]
    Backend {
        /// Description of the backend error.
        message: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },
}

/// Errors raised by provider adapters.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Timeouts, throttling and other failures worth retrying.
    #[error("Transient provider error for {resource}: {message}")]
    Transient {
        /// Resource the call was about.
        resource: String,
        /// Error message.
        message: String,
    },

    /// Validation failures, conflicts and other failures that will not heal.
    #[error("Permanent provider error for {resource}: {message}")]
    Permanent {
        /// Resource the call was about.
        resource: String,
        /// Error message.
        message: String,
    },

    /// The remote object does not exist.
    #[error("{resource_type} {id} not found")]
    NotFound {
        /// Resource type.
        resource_type: String,
        /// Provider identifier.
        id: String,
    },

    /// No adapter is registered for a resource type.
    #[error("No provider registered for resource type '{resource_type}'")]
    UnknownType {
        /// The unregistered type.
        resource_type: String,
    },
}

/// Planning errors.
#[derive(Debug, Error)]
pub enum PlanError {
    /// A plan would destroy a resource protected by `prevent_destroy`.
    #[error("{address} has prevent_destroy set but the plan would {action} it")]
    PreventDestroy {
        /// Protected resource.
        address: String,
        /// Planned action.
        action: String,
    },

    /// A reference could not be resolved against planned outputs.
    #[error("Cannot resolve reference in {address}: {message}")]
    UnresolvedReference {
        /// Resource holding the reference.
        address: String,
        /// Resolution failure.
        message: String,
    },

    /// No provider is registered for a declared or recorded resource type.
    #[error("No provider for resource type '{resource_type}' used by {address}")]
    MissingProvider {
        /// The unregistered type.
        resource_type: String,
        /// First resource using it.
        address: String,
    },
}

/// Apply errors.
#[derive(Debug, Error)]
pub enum ApplyError {
    /// The apply was cancelled before the action ran.
    #[error("Apply cancelled")]
    Cancelled,

    /// The apply could not start or had to stop.
    #[error("Apply aborted: {reason}")]
    Aborted {
        /// Reason for abort.
        reason: String,
    },

    /// A reference could not be resolved against applied outputs.
    #[error("Cannot resolve reference in {address}: {message}")]
    UnresolvedReference {
        /// Resource holding the reference.
        address: String,
        /// Resolution failure.
        message: String,
    },

    /// An action tried to leave a terminal state.
    #[error("Invalid state transition for {address}: {from} -> {to}")]
    InvalidTransition {
        /// Resource address.
        address: String,
        /// Current status.
        from: String,
        /// Requested status.
        to: String,
    },
}

/// Result type alias for Keystone operations.
pub type Result<T> = std::result::Result<T, KeystoneError>;

/// Process exit code for lock contention.
pub const EXIT_LOCK_HELD: u8 = 3;

/// Process exit code for a stale-serial conflict.
pub const EXIT_CONFLICT: u8 = 4;

impl KeystoneError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if this error is retryable by the engine itself.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Provider(ProviderError::Transient { .. }))
    }

    /// Returns true if this error means the remote object does not exist.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::Provider(ProviderError::NotFound { .. }))
    }

    /// Returns true for lock contention.
    #[must_use]
    pub const fn is_lock_held(&self) -> bool {
        matches!(self, Self::State(StateError::LockHeld { .. }))
    }

    /// Returns true for a stale-serial conflict.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::State(StateError::Conflict { .. }))
    }

    /// Process exit code to report for this error.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::State(StateError::LockHeld { .. }) => EXIT_LOCK_HELD,
            Self::State(StateError::Conflict { .. }) => EXIT_CONFLICT,
            _ => 1,
        }
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Creates a validation error without a specific field.
    #[must_use]
    pub fn validation_general(message: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: None,
        }
    }
}

impl StateError {
    /// Creates a backend error with the given message.
    #[must_use]
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }

    /// Creates a corruption error with the given message.
    #[must_use]
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted {
            message: message.into(),
        }
    }
}

impl ProviderError {
    /// Creates a transient error.
    #[must_use]
    pub fn transient(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transient {
            resource: resource.into(),
            message: message.into(),
        }
    }

    /// Creates a permanent error.
    #[must_use]
    pub fn permanent(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Permanent {
            resource: resource.into(),
            message: message.into(),
        }
    }

    /// Creates a not-found error.
    #[must_use]
    pub fn not_found(resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource_type: resource_type.into(),
            id: id.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_error_names_nodes() {
        let err = KeystoneError::from(GraphError::Cycle {
            nodes: vec![String::from("a.x"), String::from("b.y")],
        });
        assert_eq!(
            err.to_string(),
            "Graph error: Dependency cycle detected among: a.x, b.y"
        );
    }

    #[test]
    fn test_retryable_classification() {
        assert!(KeystoneError::from(ProviderError::transient("vpc", "throttled")).is_retryable());
        assert!(!KeystoneError::from(ProviderError::permanent("vpc", "invalid cidr")).is_retryable());
        assert!(KeystoneError::from(ProviderError::not_found("vpc", "vpc-1")).is_not_found());
    }

    #[test]
    fn test_exit_codes() {
        let held = KeystoneError::from(StateError::LockHeld {
            holder: String::from("ci"),
            since: String::from("now"),
            lock_id: String::from("l1"),
        });
        let conflict = KeystoneError::from(StateError::Conflict {
            expected: 1,
            found: 2,
        });
        assert_eq!(held.exit_code(), EXIT_LOCK_HELD);
        assert_eq!(conflict.exit_code(), EXIT_CONFLICT);
        assert_eq!(KeystoneError::internal("boom").exit_code(), 1);
    }
}

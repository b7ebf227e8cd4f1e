// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![deny(warnings)]                    // All warnings are treated as errors
#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![deny(missing_docs)]                // All public items must be documented
#![deny(dead_code)]                   // Unused code is forbidden
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention

// Additional strictness - Leave nothing unchecked
#![deny(unused_imports)]              // Unused imports are forbidden
#![deny(unused_variables)]            // Unused variables are forbidden
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::missing_const_for_fn)] // Force const when possible
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::module_inception)]    // Module with same name as crate warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::shadow_unrelated)]    // Shadowing unrelated variables warning
#![warn(clippy::too_many_arguments)]  // Limit function arguments
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Keystone
//!
//! A declarative infrastructure reconciliation engine.
//!
//! ## Overview
//!
//! Keystone reads a set of resource declarations, computes what has to
//! change against the recorded state, and applies those changes through
//! provider adapters:
//!
//! - Resources reference each other's outputs with `${type.name.attr}`
//! - Independent resources are applied concurrently, dependents wait
//! - State is versioned by a serial and protected by a lock
//! - Refresh and drift detection read objects back from their providers
//!
//! ## Architecture
//!
//! 1. **Model**: declarations expanded into addressed resource nodes
//! 2. **Graph**: dependency edges from references and `depends_on`
//! 3. **Planner**: desired graph + recorded state -> ordered change plan
//! 4. **Executor**: runs the plan level by level under the state lock
//! 5. **Reconciler**: refresh, plan and apply with conflict retries
//!
//! ## Modules
//!
//! - [`model`]: Addresses, attribute expressions and declarations
//! - [`graph`]: Dependency graph and level ordering
//! - [`state`]: State storage backends (local, S3, memory)
//! - [`provider`]: Provider adapter trait and built-in adapters
//! - [`planner`]: Diff computation and change planning
//! - [`executor`]: Parallel, retrying plan execution
//! - [`config`]: Configuration parsing and validation
//! - [`reconciler`]: Refresh, drift detection and convergence loop
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! project:
//!   name: web-stack
//!   environment: prod
//!
//! resources:
//!   - type: network
//!     name: main
//!     attributes:
//!       cidr: 10.0.0.0/16
//!     lifecycle:
//!       create_before_destroy: true
//!
//!   - type: subnet
//!     name: zone
//!     for_each: [a, b]
//!     attributes:
//!       network_id: ${network.main.id}
//!       zone: ${each.key}
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod config;
pub mod error;
pub mod executor;
pub mod graph;
pub mod model;
pub mod planner;
pub mod provider;
pub mod reconciler;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigParser, ConfigValidator, ContentHasher, DeployConfig};
pub use error::{KeystoneError, Result};
pub use executor::{ApplyResult, Executor, ExecutorOptions};
pub use graph::DependencyGraph;
pub use model::{ResourceAddress, ResourceNode};
pub use planner::{Plan, Planner};
pub use provider::{ProviderAdapter, ProviderRegistry};
pub use reconciler::{DriftReport, ReconcileReport, Reconciler};
pub use state::{LocalStateStore, MemoryStateStore, S3StateStore, StateSnapshot, StateStore};

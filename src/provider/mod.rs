//! Provider adapters.
//!
//! A provider adapter performs CRUD calls for one or more resource types
//! against an external system. The engine never interprets resource
//! semantics itself; everything type-specific sits behind
//! [`ProviderAdapter`].

mod local;
mod memory;
mod registry;

pub use local::LocalProvider;
pub use memory::{Call, FailureKind, FailureRule, MemoryProvider, Operation};
pub use registry::ProviderRegistry;

use async_trait::async_trait;
use std::collections::BTreeSet;

use crate::error::Result;
use crate::model::Attributes;

/// Uniform CRUD contract for resource types.
///
/// Errors must be classified: `ProviderError::Transient` for failures worth
/// retrying, `ProviderError::Permanent` for everything that will not heal,
/// and `ProviderError::NotFound` when the object does not exist.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Reads the current attributes of an object.
    async fn read(&self, resource_type: &str, id: &str) -> Result<Attributes>;

    /// Creates an object and returns its id and resulting attributes.
    async fn create(&self, resource_type: &str, desired: &Attributes) -> Result<(String, Attributes)>;

    /// Applies `changes` to an object and returns the resulting attributes.
    ///
    /// A `null` value in `changes` unsets the field. `desired` is the full
    /// desired attribute set for adapters that need it.
    async fn update(
        &self,
        resource_type: &str,
        id: &str,
        changes: &Attributes,
        desired: &Attributes,
    ) -> Result<Attributes>;

    /// Deletes an object.
    async fn delete(&self, resource_type: &str, id: &str) -> Result<()>;

    /// Fields whose change forces a replacement.
    fn immutable_fields(&self, resource_type: &str) -> BTreeSet<String>;
}

//! Resource model.
//!
//! Declarations are expanded into concrete [`ResourceNode`]s whose attributes
//! are [`AttrValue`] expression trees. A [`Scope`] resolves those expressions
//! against whatever is known about upstream outputs.

mod address;
mod expand;
mod resource;
mod scope;
mod value;

pub use address::{InstanceKey, ResourceAddress, is_identifier, is_valid_key};
pub use expand::{Declaration, ForEach, expand};
pub use resource::{LifecyclePolicy, ResourceNode};
pub use scope::{NodeOutputs, Scope, split_resolved};
pub use value::{
    AttrValue, Attributes, Reference, Resolved, ResourceRef, Selector, TemplatePart,
    render_scalar,
};

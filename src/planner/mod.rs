//! Planning module.
//!
//! This module compares the declared graph against recorded state and
//! produces the change plan the executor applies.

mod diff;
mod engine;
mod plan;

pub use diff::{AttributeChange, creation_changes, diff_attributes, requires_replace, update_payload};
pub use engine::Planner;
pub use plan::{ChangeAction, ChangeKind, ChangeSummary, Pass, Plan, ReplaceOrder};

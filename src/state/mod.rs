//! State management module.
//!
//! This module provides versioned, lock-protected persistence of the records
//! the executor writes after every confirmed provider call.

mod local;
mod lock;
mod memory;
mod s3;
mod store;
mod types;

pub use local::{LocalStateStore, STATE_DIR};
pub use lock::{DEFAULT_LOCK_TIMEOUT_SECS, Lock, generate_holder_id};
pub use memory::MemoryStateStore;
pub use s3::S3StateStore;
pub use store::{Records, StateStore};
pub use types::{STATE_VERSION, StateRecord, StateSnapshot};

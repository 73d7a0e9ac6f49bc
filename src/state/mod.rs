//! State management module for the Halldyll infrastructure engine.
//!
//! This module provides persistent state storage for applied resources:
//! external identifiers, applied attributes, provider outputs, and the
//! dependencies each resource had when it was applied.

mod store;
mod local;
mod s3;
mod lock;
mod guard;
mod types;

pub use store::StateStore;
pub use local::{LocalStateStore, STATE_DIR};
pub use s3::S3StateStore;
pub use lock::{LOCK_EXPIRY_SECS, LOCK_RENEW_SECS, LockInfo, generate_holder_id};
pub use guard::LockedStore;
pub use types::{
    HistoryEntry, MAX_HISTORY, Operation, ResourceRecord, STATE_VERSION, StateSnapshot,
};

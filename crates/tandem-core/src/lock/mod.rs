//! Pessimistic repository lock.
//!
//! `LockRecord` and `LockStatus` model the lock, `LockStore` persists it with
//! compare-and-swap, `LockManager` drives the lifecycle and audit trail, and
//! `LockMirror` optionally publishes transitions for remote observers.

pub mod manager;
pub mod mirror;
pub mod record;
pub mod store;

pub use manager::LockManager;
pub use mirror::{LockMirror, QueuedMirror};
pub use record::{LockRecord, LockStatus};
pub use store::{CasOutcome, Displaced, FileLockStore, LockStore};

//! Unit of work.
//!
//! # Responsibility
//! - Expose the transaction type that caches objects and writes recorded
//!   changes atomically.

pub mod transaction;

pub use transaction::{BuildDepth, CommitSummary, ObjectHandle, Transaction, TransactionState};

//! Concurrency control for shared entities.
//!
//! # Responsibility
//! - Persist exclusive (pessimistic) locks in the `orm_locks` table.
//! - Capture optimistic snapshots that commits compare against.
//!
//! # Invariants
//! - Lock owner identity (login + session) is always passed explicitly.
//! - Pessimistic locks never expire; they are released explicitly.

pub mod lock;
pub mod lock_manager;
pub mod optimistic;

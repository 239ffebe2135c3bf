//! Relational mapping of entity types onto SQLite tables.
//!
//! # Responsibility
//! - Render parameterized SQL for one type at a time.
//! - Resolve physical table names through an explicit registry.
//!
//! # Invariants
//! - Identifiers are backtick-quoted; values are always bound.

pub mod criteria;
pub mod rdb_mapper;
pub mod registry;
pub mod sql;

//! Entity model shared by mappers, queries and transactions.
//!
//! # Responsibility
//! - Define object identity, attribute values and relation metadata.
//! - Describe entity types independently from any SQL rendering.
//!
//! # Invariants
//! - Every persistent object is identified by an `ObjectId`.
//! - Relation metadata is derived once at schema build time and never
//!   mutated afterwards.

pub mod accessor;
pub mod object;
pub mod oid;
pub mod relation;
pub mod schema;
pub mod value;

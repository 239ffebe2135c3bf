//! Optimistic lock snapshots.
//!
//! A snapshot records the persisted attribute values of an object when the
//! lock is taken. The commit conditions its UPDATE on them, so a concurrent
//! change makes the UPDATE match zero rows.

use crate::model::object::PersistentObject;
use crate::model::oid::ObjectId;
use crate::model::value::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq)]
pub struct OptimisticSnapshot {
    pub oid: ObjectId,
    pub values: BTreeMap<String, Value>,
}

impl OptimisticSnapshot {
    /// Snapshot of the values `object` was loaded with.
    pub fn capture(object: &PersistentObject) -> Self {
        Self {
            oid: object.oid().clone(),
            values: object.original_values().clone(),
        }
    }
}

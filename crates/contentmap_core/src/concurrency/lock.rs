//! Lock records.

use crate::concurrency::optimistic::OptimisticSnapshot;
use crate::model::oid::ObjectId;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Identity holding a lock: user login plus session id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockOwner {
    pub login: String,
    pub session_id: String,
}

impl LockOwner {
    pub fn new(login: &str, session_id: &str) -> Self {
        Self {
            login: login.to_string(),
            session_id: session_id.to_string(),
        }
    }
}

impl Display for LockOwner {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.login, self.session_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockType {
    Pessimistic,
    Optimistic,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Lock {
    pub oid: ObjectId,
    pub owner: LockOwner,
    pub lock_type: LockType,
    /// Unix epoch milliseconds.
    pub acquired_at: i64,
    /// Persisted state at acquisition, optimistic locks only.
    pub snapshot: Option<OptimisticSnapshot>,
}

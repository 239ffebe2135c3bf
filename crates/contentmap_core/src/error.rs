//! Persistence error taxonomy.
//!
//! # Responsibility
//! - Name every failure the mapper, query builders and transactions report.
//! - Keep SQL transport errors distinguishable from semantic failures.
//!
//! # Invariants
//! - Mapping and query errors are raised while building, before any SQL runs.
//! - Lock conflicts carry enough context to explain the conflict (owner or
//!   current persisted state).

use crate::concurrency::lock::LockOwner;
use crate::db::DbError;
use crate::model::object::PersistentObject;
use crate::model::oid::ObjectId;
use crate::service::collaborators::Action;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub type PersistenceResult<T> = Result<T, PersistenceError>;

#[derive(Debug)]
pub enum PersistenceError {
    InvalidObjectId(String),
    UnknownType(String),
    UnknownField {
        type_name: String,
        field: String,
    },
    UnknownRole {
        type_name: String,
        role: String,
    },
    AmbiguousRelation {
        type_name: String,
        qualifier: String,
        roles: Vec<String>,
    },
    InvalidSchema(String),
    InvalidQuery(String),
    InvalidTransactionState {
        expected: &'static str,
        actual: &'static str,
    },
    AuthorizationDenied {
        resource: String,
        action: Action,
    },
    PessimisticLockConflict {
        oid: ObjectId,
        owner: LockOwner,
        acquired_at: i64,
    },
    OptimisticLockConflict {
        oid: ObjectId,
        /// Persisted state at conflict time, `None` when the row is gone.
        current: Option<Box<PersistentObject>>,
    },
    InvalidData(String),
    PersistenceFailure(DbError),
}

impl PersistenceError {
    pub fn is_lock_conflict(&self) -> bool {
        matches!(
            self,
            Self::PessimisticLockConflict { .. } | Self::OptimisticLockConflict { .. }
        )
    }
}

impl Display for PersistenceError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidObjectId(message) => write!(f, "invalid object id: {message}"),
            Self::UnknownType(type_name) => write!(f, "unknown type `{type_name}`"),
            Self::UnknownField { type_name, field } => {
                write!(f, "type `{type_name}` has no attribute `{field}`")
            }
            Self::UnknownRole { type_name, role } => {
                write!(f, "type `{type_name}` has no relation with role `{role}`")
            }
            Self::AmbiguousRelation {
                type_name,
                qualifier,
                roles,
            } => write!(
                f,
                "`{qualifier}` is ambiguous from `{type_name}`; specify one of roles [{}]",
                roles.join(", ")
            ),
            Self::InvalidSchema(message) => write!(f, "invalid schema: {message}"),
            Self::InvalidQuery(message) => write!(f, "invalid query: {message}"),
            Self::InvalidTransactionState { expected, actual } => {
                write!(f, "transaction is {actual}, expected {expected}")
            }
            Self::AuthorizationDenied { resource, action } => {
                write!(f, "{action} on `{resource}` is not authorized")
            }
            Self::PessimisticLockConflict {
                oid,
                owner,
                acquired_at,
            } => write!(
                f,
                "`{oid}` is locked by {} since {acquired_at}",
                owner.login
            ),
            Self::OptimisticLockConflict { oid, current } => match current {
                Some(_) => write!(f, "`{oid}` was modified by another transaction"),
                None => write!(f, "`{oid}` was deleted by another transaction"),
            },
            Self::InvalidData(message) => write!(f, "invalid persisted data: {message}"),
            Self::PersistenceFailure(err) => write!(f, "{err}"),
        }
    }
}

impl Error for PersistenceError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::PersistenceFailure(err) => Some(err),
            _ => None,
        }
    }
}

impl From<DbError> for PersistenceError {
    fn from(value: DbError) -> Self {
        Self::PersistenceFailure(value)
    }
}

impl From<rusqlite::Error> for PersistenceError {
    fn from(value: rusqlite::Error) -> Self {
        Self::PersistenceFailure(DbError::Sqlite(value))
    }
}

//! Contracts of collaborators the persistence core consumes.
//!
//! Authorization policy and translation storage live outside the core; the
//! core only invokes them at the points the unit of work defines.

use crate::concurrency::lock::LockOwner;
use crate::error::PersistenceResult;
use crate::model::object::PersistentObject;
use crate::model::oid::ObjectId;
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Read,
    Create,
    Update,
    Delete,
}

impl Display for Action {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Read => "read",
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        };
        write!(f, "{label}")
    }
}

/// Target of an authorization check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resource {
    Type(String),
    Object(ObjectId),
}

impl Display for Resource {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Type(type_name) => write!(f, "{type_name}"),
            Self::Object(oid) => write!(f, "{oid}"),
        }
    }
}

/// Authorization decision point.
pub trait Authorizer {
    fn authorize(&self, resource: &Resource, identity: &LockOwner, action: Action) -> bool;
}

/// Grants everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn authorize(&self, _resource: &Resource, _identity: &LockOwner, _action: Action) -> bool {
        true
    }
}

/// Translation storage for localized attribute values.
pub trait Localization {
    /// Overlays translated values for `language` onto `object`.
    fn load_translation(
        &self,
        object: &mut PersistentObject,
        language: &str,
    ) -> PersistenceResult<()>;

    /// Stores the values of `object` as its `language` translation.
    fn save_translation(&self, object: &PersistentObject, language: &str) -> PersistenceResult<()>;
}

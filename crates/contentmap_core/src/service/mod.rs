//! Surface consumed by controllers.
//!
//! # Responsibility
//! - Expose the persistence facade.
//! - Define the authorization and localization collaborator contracts.

pub mod collaborators;
pub mod persistence_facade;

pub use collaborators::{Action, AllowAll, Authorizer, Localization, Resource};
pub use persistence_facade::PersistenceFacade;

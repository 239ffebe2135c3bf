//! Object-relational mapping, query and concurrency core of the content map.
//! Controllers and views stay outside; they reach the core through
//! `PersistenceFacade` and the transactions it hands out.

pub mod concurrency;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod mapper;
pub mod model;
pub mod query;
pub mod service;
pub mod tx;

pub use concurrency::lock::{Lock, LockOwner, LockType};
pub use concurrency::lock_manager::LockManager;
pub use concurrency::optimistic::OptimisticSnapshot;
pub use config::CoreConfig;
pub use error::{PersistenceError, PersistenceResult};
pub use logging::{default_log_level, init_logging, init_logging_from_config};
pub use mapper::criteria::{Combine, Criteria, CriteriaValue, Operator};
pub use mapper::rdb_mapper::RdbMapper;
pub use mapper::registry::{MapperRegistry, MapperSettings};
pub use model::object::{ObjectState, PersistentObject};
pub use model::oid::{KeyValue, ObjectId};
pub use model::relation::{AggregationKind, Multiplicity, RelationDescription, RelationKind};
pub use model::schema::{
    DataType, EntityType, ManyToManyDef, OneToManyDef, OrderTerm, Schema, SortDirection,
};
pub use model::value::Value;
pub use query::{ConditionExpr, ObjectQuery, PagingInfo, StringQuery, TemplateId};
pub use service::{Action, AllowAll, Authorizer, Localization, PersistenceFacade, Resource};
pub use tx::{BuildDepth, CommitSummary, ObjectHandle, Transaction, TransactionState};

/// Minimal health-check API for early integration.
pub fn ping() -> &'static str {
    "pong"
}

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

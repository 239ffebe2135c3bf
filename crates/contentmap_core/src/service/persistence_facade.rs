//! Entry point controllers use to reach the persistence core.
//!
//! # Responsibility
//! - Own the SQLite connection, the mapper registry and the authorizer.
//! - Hand out transactions, mappers, queries and the lock manager.
//!
//! # Invariants
//! - Every transaction gets its own registry copy; redirecting one type to
//!   another table never leaks into other transactions.
//! - The lock owner identity is always passed in by the caller.

use crate::concurrency::lock::LockOwner;
use crate::concurrency::lock_manager::LockManager;
use crate::config::CoreConfig;
use crate::db::{open_db, open_db_in_memory, open_db_with_busy_timeout};
use crate::error::PersistenceResult;
use crate::mapper::rdb_mapper::RdbMapper;
use crate::mapper::registry::{MapperRegistry, MapperSettings};
use crate::model::schema::Schema;
use crate::query::{ObjectQuery, StringQuery};
use crate::service::collaborators::{AllowAll, Authorizer};
use crate::tx::Transaction;
use log::info;
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

pub struct PersistenceFacade {
    conn: Connection,
    registry: MapperRegistry,
    authorizer: Box<dyn Authorizer>,
}

impl PersistenceFacade {
    /// Wraps an already migrated connection.
    pub fn new(conn: Connection, registry: MapperRegistry) -> Self {
        Self {
            conn,
            registry,
            authorizer: Box::new(AllowAll),
        }
    }

    /// Opens (and migrates) the database file at `path`.
    pub fn open(
        path: impl AsRef<Path>,
        schema: Schema,
        settings: MapperSettings,
    ) -> PersistenceResult<Self> {
        let conn = open_db(path)?;
        Ok(Self::new(
            conn,
            MapperRegistry::with_settings(Arc::new(schema), settings),
        ))
    }

    pub fn open_in_memory(schema: Schema) -> PersistenceResult<Self> {
        Ok(Self::new(open_db_in_memory()?, MapperRegistry::new(schema)))
    }

    /// Opens `path` with busy timeout and table naming taken from `config`.
    pub fn from_config(
        path: impl AsRef<Path>,
        schema: Schema,
        config: &CoreConfig,
    ) -> PersistenceResult<Self> {
        let conn = open_db_with_busy_timeout(path, config.busy_timeout())?;
        Ok(Self::new(
            conn,
            MapperRegistry::with_settings(Arc::new(schema), MapperSettings::from_config(config)),
        ))
    }

    pub fn with_authorizer(mut self, authorizer: impl Authorizer + 'static) -> Self {
        self.authorizer = Box::new(authorizer);
        self
    }

    /// Creates missing tables for every mapped type.
    pub fn ensure_schema(&self) -> PersistenceResult<()> {
        let started_at = Instant::now();
        let mut created = 0;
        for entity in self.registry.schema().entities() {
            let sql = self.registry.mapper(entity.name())?.create_table_sql();
            self.conn.execute(&sql, [])?;
            created += 1;
        }
        info!(
            "event=ensure_schema module=service status=ok tables={} duration_ms={}",
            created,
            started_at.elapsed().as_millis()
        );
        Ok(())
    }

    /// New inactive transaction for `owner`; call `begin()` before use.
    pub fn transaction(&self, owner: LockOwner) -> Transaction<'_> {
        self.transaction_with_registry(owner, self.registry.clone())
    }

    /// Transaction whose mappers store `type_name` in `prefix`-ed tables.
    pub fn redirected_transaction(
        &self,
        owner: LockOwner,
        type_name: &str,
        prefix: &str,
    ) -> Transaction<'_> {
        self.transaction_with_registry(owner, self.registry.with_table_prefix(type_name, prefix))
    }

    pub fn transaction_with_registry(
        &self,
        owner: LockOwner,
        registry: MapperRegistry,
    ) -> Transaction<'_> {
        Transaction::new(&self.conn, registry, owner, self.authorizer.as_ref())
    }

    pub fn mapper(&self, type_name: &str) -> PersistenceResult<RdbMapper<'_>> {
        self.registry.mapper(type_name)
    }

    pub fn object_query(&self, root_type: &str) -> PersistenceResult<ObjectQuery> {
        ObjectQuery::new(self.registry.clone(), root_type)
    }

    pub fn string_query(&self, root_type: &str) -> PersistenceResult<StringQuery> {
        StringQuery::new(self.registry.clone(), root_type)
    }

    pub fn lock_manager(&self) -> LockManager<'_> {
        LockManager::new(&self.conn)
    }

    pub fn registry(&self) -> &MapperRegistry {
        &self.registry
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

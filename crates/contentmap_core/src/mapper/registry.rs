//! Mapper lookup by type name.
//!
//! # Responsibility
//! - Own the shared schema and per-type table naming settings.
//! - Hand out short-lived `RdbMapper` views for a type.
//!
//! # Invariants
//! - A table prefix applies to exactly one type's table.
//! - Cloning a registry shares the schema; settings are copied, so
//!   per-transaction prefix redirects never leak to other users.

use crate::config::CoreConfig;
use crate::error::PersistenceResult;
use crate::mapper::rdb_mapper::RdbMapper;
use crate::model::schema::{EntityType, Schema, SortDirection};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MapperSettings {
    /// Prefix for types without an explicit entry in `table_prefixes`.
    pub default_table_prefix: String,
    pub table_prefixes: BTreeMap<String, String>,
    /// Direction of the junction sortkey used for many-to-many lists.
    pub relation_sort_direction: SortDirection,
}

impl MapperSettings {
    pub fn from_config(config: &CoreConfig) -> Self {
        Self {
            default_table_prefix: config.default_table_prefix.clone(),
            table_prefixes: config.table_prefixes.clone(),
            relation_sort_direction: config.relation_sort_direction,
        }
    }

    pub fn table_prefix(&self, type_name: &str) -> &str {
        self.table_prefixes
            .get(type_name)
            .map_or(self.default_table_prefix.as_str(), String::as_str)
    }
}

#[derive(Debug, Clone)]
pub struct MapperRegistry {
    schema: Arc<Schema>,
    settings: MapperSettings,
}

impl MapperRegistry {
    pub fn new(schema: Schema) -> Self {
        Self::with_settings(Arc::new(schema), MapperSettings::default())
    }

    pub fn with_settings(schema: Arc<Schema>, settings: MapperSettings) -> Self {
        Self { schema, settings }
    }

    /// Copy of this registry storing `type_name` in a prefixed table.
    pub fn with_table_prefix(&self, type_name: &str, prefix: &str) -> Self {
        let mut settings = self.settings.clone();
        settings
            .table_prefixes
            .insert(type_name.to_string(), prefix.to_string());
        Self {
            schema: Arc::clone(&self.schema),
            settings,
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn settings(&self) -> &MapperSettings {
        &self.settings
    }

    pub fn entity(&self, type_name: &str) -> PersistenceResult<&EntityType> {
        self.schema.entity(type_name)
    }

    pub fn mapper(&self, type_name: &str) -> PersistenceResult<RdbMapper<'_>> {
        Ok(RdbMapper::new(self.schema.entity(type_name)?, self))
    }

    /// Physical table name of `entity`, prefix included.
    pub fn table_name(&self, entity: &EntityType) -> String {
        format!(
            "{}{}",
            self.settings.table_prefix(entity.name()),
            entity.table_name()
        )
    }
}

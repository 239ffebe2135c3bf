//! Core runtime configuration.
//!
//! # Responsibility
//! - Carry logging, connection and table naming settings into the core.
//!
//! # Invariants
//! - Every field has a default, so partial documents are valid.
//! - Locating and reading the configuration file stays with the caller.

use crate::model::schema::SortDirection;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub log_level: String,
    /// Absolute directory for rolling log files; logging stays off when unset.
    pub log_dir: Option<String>,
    pub busy_timeout_ms: u64,
    pub default_table_prefix: String,
    pub table_prefixes: BTreeMap<String, String>,
    pub relation_sort_direction: SortDirection,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            log_level: crate::logging::default_log_level().to_string(),
            log_dir: None,
            busy_timeout_ms: 5_000,
            default_table_prefix: String::new(),
            table_prefixes: BTreeMap::new(),
            relation_sort_direction: SortDirection::Asc,
        }
    }
}

impl CoreConfig {
    /// Parses a JSON document; missing fields keep their defaults.
    pub fn from_json_str(raw: &str) -> Result<Self, String> {
        serde_json::from_str(raw).map_err(|err| format!("invalid core config: {err}"))
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

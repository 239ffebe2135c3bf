//! Ad-hoc queries over the mapped schema.
//!
//! # Responsibility
//! - Build SELECTs from object templates (`ObjectQuery`) or condition
//!   strings (`StringQuery`).
//! - Run them inside a transaction and hydrate the results there.

pub mod condition;
pub mod object_query;
pub mod paging;
pub mod rql;
pub mod string_query;

pub use condition::ConditionExpr;
pub use object_query::{ObjectQuery, TemplateId};
pub use paging::PagingInfo;
pub use rql::parse_rql;
pub use string_query::{parse_condition, StringQuery};

use crate::error::PersistenceResult;
use crate::mapper::registry::MapperRegistry;
use crate::mapper::sql::SelectStatement;
use crate::service::collaborators::{Action, Resource};
use crate::tx::{BuildDepth, ObjectHandle, Transaction};
use log::info;
use std::time::Instant;

/// Runs a root-type SELECT and adopts the rows into `tx`.
pub(crate) fn execute_select(
    tx: &mut Transaction<'_>,
    registry: &MapperRegistry,
    type_name: &str,
    mut select: SelectStatement,
    paging: Option<&mut PagingInfo>,
    depth: BuildDepth,
) -> PersistenceResult<Vec<ObjectHandle>> {
    let started_at = Instant::now();
    tx.ensure_active()?;
    tx.authorize(&Resource::Type(type_name.to_string()), Action::Read)?;

    let mapper = registry.mapper(type_name)?;
    let conn = tx.connection();
    if let Some(paging) = paging {
        paging.set_total_count(mapper.count(conn, &select)?);
        select.limit = Some(u64::from(paging.page_size()));
        select.offset = paging.offset();
    }
    let rows = mapper.fetch(conn, &select)?;
    let row_count = rows.len();
    let handles = tx.adopt_rows(rows.into_iter().map(|row| row.object).collect(), depth)?;

    info!(
        "event=query_execute module=query status=ok type={} rows={} duration_ms={}",
        type_name,
        row_count,
        started_at.elapsed().as_millis()
    );
    Ok(handles)
}

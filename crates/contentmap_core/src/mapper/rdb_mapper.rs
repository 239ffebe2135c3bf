//! Relational mapper for one entity type.
//!
//! # Responsibility
//! - Build SELECT/INSERT/UPDATE/DELETE statements for the type's table.
//! - Build relation selects and relation joins for every relation kind.
//! - Hydrate result rows into `PersistentObject`s.
//!
//! # Invariants
//! - The table prefix applies only to this type's own table; joined tables
//!   use their own mapper's name.
//! - Reference joins are aliased `<Role>Ref`, relation joins by role name.
//! - Foreign keys written by INSERT/UPDATE come from the object's
//!   many-to-one relation lists when they are present.
//! - Every UPDATE and DELETE carries a primary key condition.

use crate::concurrency::optimistic::OptimisticSnapshot;
use crate::error::{PersistenceError, PersistenceResult};
use crate::mapper::criteria::{join_predicates, Criteria};
use crate::mapper::registry::MapperRegistry;
use crate::mapper::sql::{
    in_clause, placeholders, qualify, quote_ident, Join, JoinKind, SelectStatement, SqlStatement,
};
use crate::model::object::PersistentObject;
use crate::model::oid::{KeyValue, ObjectId};
use crate::model::relation::{RelationDescription, RelationMapping};
use crate::model::schema::{DataType, EntityType, OrderTerm, ReferenceDescription};
use crate::model::value::Value;
use log::debug;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Synthetic column carrying the junction's source-side foreign key.
pub const INTERNAL_ID_COLUMN: &str = "_mapper_internal_id";

/// Statement selecting objects related to a set of parents.
#[derive(Debug, Clone)]
pub struct RelationSelect {
    pub statement: SelectStatement,
    /// Result column matched against the parents.
    pub object_value_column: String,
    /// Parent attribute the result column refers to.
    pub relation_value_column: String,
}

/// One hydrated row plus the columns that are not attributes.
#[derive(Debug, Clone)]
pub struct FetchedRow {
    pub object: PersistentObject,
    pub extra: BTreeMap<String, Value>,
}

struct JunctionMapping<'a> {
    entity: &'a EntityType,
    table: String,
    this_fk: &'a str,
    this_id: &'a str,
    other_fk: &'a str,
    other_id: &'a str,
}

pub struct RdbMapper<'r> {
    entity: &'r EntityType,
    registry: &'r MapperRegistry,
}

impl<'r> RdbMapper<'r> {
    pub(crate) fn new(entity: &'r EntityType, registry: &'r MapperRegistry) -> Self {
        Self { entity, registry }
    }

    pub fn entity(&self) -> &'r EntityType {
        self.entity
    }

    pub fn type_name(&self) -> &'r str {
        self.entity.name()
    }

    pub fn table_name(&self) -> String {
        self.registry.table_name(self.entity)
    }

    /// Builds the SELECT for this type.
    ///
    /// - `alias` renames the primary table only.
    /// - `attributes` restricts the selected attributes; primary keys are
    ///   always selected.
    /// - `order` of `None` uses the type's sortkey (primary key when the type
    ///   has none); `Some(&[])` disables ordering.
    pub fn select_sql(
        &self,
        criteria: &[Criteria],
        alias: Option<&str>,
        attributes: Option<&[&str]>,
        order: Option<&[OrderTerm]>,
    ) -> PersistenceResult<SelectStatement> {
        if let Some(requested) = attributes {
            for name in requested {
                if self.entity.attribute_description(name).is_none()
                    && self.entity.reference_description(name).is_none()
                {
                    return Err(self.unknown_field(name));
                }
            }
        }
        let wanted = |name: &str| {
            attributes.map_or(true, |requested| {
                requested.iter().any(|candidate| *candidate == name)
            })
        };

        let mut select = SelectStatement::new(&self.table_name(), alias);
        let this_alias = select.table_alias().to_string();

        for attribute in self.entity.attributes() {
            if attribute.is_primary_key || wanted(&attribute.name) {
                select.columns.push(format!(
                    "{} AS {}",
                    qualify(&this_alias, &attribute.column),
                    quote_ident(&attribute.name)
                ));
            }
        }
        for reference in self.entity.references() {
            if wanted(&reference.name) {
                let column = self.reference_column(&mut select, &this_alias, reference)?;
                select
                    .columns
                    .push(format!("{column} AS {}", quote_ident(&reference.name)));
            }
        }

        self.apply_criteria(&mut select, &this_alias, criteria)?;
        select.order_by = self.order_sql(&mut select, &this_alias, order)?;
        Ok(select)
    }

    /// SELECT of the single row identified by `oid`.
    pub fn select_by_oid_sql(&self, oid: &ObjectId) -> PersistenceResult<SelectStatement> {
        let mut select = self.select_sql(&[], None, None, Some(&[]))?;
        let (predicate, params) = self.pk_condition(Some(select.table_alias()), oid)?;
        select.and_where(predicate, params);
        Ok(select)
    }

    /// Builds the select of objects reached from `parents` under `role`.
    pub fn relation_select_sql(
        &self,
        parents: &[&PersistentObject],
        role: &str,
        criteria: &[Criteria],
        order: Option<&[OrderTerm]>,
    ) -> PersistenceResult<RelationSelect> {
        let relation = self.entity.require_relation(role)?;
        let other = self.registry.mapper(&relation.other_type)?;

        match &relation.mapping {
            RelationMapping::ManyToOne {
                fk_attribute,
                id_attribute,
            } => {
                let values = distinct_values(parents, fk_attribute)?;
                let mut select = other.select_sql(criteria, None, None, order)?;
                let column = other.column_sql(&mut select, id_attribute)?;
                select.and_where(in_clause(&column, values.len()), values);
                Ok(RelationSelect {
                    statement: select,
                    object_value_column: id_attribute.clone(),
                    relation_value_column: fk_attribute.clone(),
                })
            }
            RelationMapping::OneToMany {
                fk_attribute,
                id_attribute,
            } => {
                let values = distinct_values(parents, id_attribute)?;
                let mut select = other.select_sql(criteria, None, None, order)?;
                let column = other.column_sql(&mut select, fk_attribute)?;
                select.and_where(in_clause(&column, values.len()), values);
                Ok(RelationSelect {
                    statement: select,
                    object_value_column: fk_attribute.clone(),
                    relation_value_column: id_attribute.clone(),
                })
            }
            RelationMapping::ManyToMany { .. } => {
                let junction = self.junction_mapping(relation)?;
                let values = distinct_values(parents, junction.this_id)?;
                let mut select = other.select_sql(criteria, None, None, order)?;
                let other_alias = select.table_alias().to_string();
                let junction_alias = junction.table.clone();

                let other_id_column = other.column_sql(&mut select, junction.other_id)?;
                select.add_join(Join {
                    kind: JoinKind::Inner,
                    table: junction.table.clone(),
                    alias: junction_alias.clone(),
                    on: format!(
                        "{} = {}",
                        qualify(&junction_alias, column_of(junction.entity, junction.other_fk)?),
                        other_id_column
                    ),
                });
                let this_fk_column =
                    qualify(&junction_alias, column_of(junction.entity, junction.this_fk)?);
                select.columns.push(format!(
                    "{this_fk_column} AS {}",
                    quote_ident(INTERNAL_ID_COLUMN)
                ));
                select.and_where(in_clause(&this_fk_column, values.len()), values);

                if order.is_none() {
                    let sortkey = format!("sortkey_{}", role.to_lowercase());
                    if let Some(attribute) = junction.entity.attribute_description(&sortkey) {
                        select.order_by = vec![format!(
                            "{} {}",
                            qualify(&junction_alias, &attribute.column),
                            self.registry.settings().relation_sort_direction.as_sql()
                        )];
                    }
                }
                debug!(
                    "event=relation_select module=mapper status=ok type={} role={} other_alias={}",
                    self.type_name(),
                    role,
                    other_alias
                );

                Ok(RelationSelect {
                    statement: select,
                    object_value_column: INTERNAL_ID_COLUMN.to_string(),
                    relation_value_column: junction.this_id.to_string(),
                })
            }
        }
    }

    /// Joins reaching `role` objects aliased `child_alias` from `parent_alias`.
    ///
    /// Many-to-many relations join through the junction table aliased
    /// `junction_alias`.
    pub fn relation_join(
        &self,
        parent_alias: &str,
        role: &str,
        child_alias: &str,
        junction_alias: &str,
    ) -> PersistenceResult<Vec<Join>> {
        let relation = self.entity.require_relation(role)?;
        let other_entity = self.registry.entity(&relation.other_type)?;
        let other_table = self.registry.table_name(other_entity);

        match &relation.mapping {
            RelationMapping::ManyToOne {
                fk_attribute,
                id_attribute,
            } => Ok(vec![Join {
                kind: JoinKind::Inner,
                table: other_table,
                alias: child_alias.to_string(),
                on: format!(
                    "{} = {}",
                    qualify(child_alias, column_of(other_entity, id_attribute)?),
                    qualify(parent_alias, column_of(self.entity, fk_attribute)?)
                ),
            }]),
            RelationMapping::OneToMany {
                fk_attribute,
                id_attribute,
            } => Ok(vec![Join {
                kind: JoinKind::Inner,
                table: other_table,
                alias: child_alias.to_string(),
                on: format!(
                    "{} = {}",
                    qualify(child_alias, column_of(other_entity, fk_attribute)?),
                    qualify(parent_alias, column_of(self.entity, id_attribute)?)
                ),
            }]),
            RelationMapping::ManyToMany { .. } => {
                let junction = self.junction_mapping(relation)?;
                Ok(vec![
                    Join {
                        kind: JoinKind::Inner,
                        table: junction.table.clone(),
                        alias: junction_alias.to_string(),
                        on: format!(
                            "{} = {}",
                            qualify(junction_alias, column_of(junction.entity, junction.this_fk)?),
                            qualify(parent_alias, column_of(self.entity, junction.this_id)?)
                        ),
                    },
                    Join {
                        kind: JoinKind::Inner,
                        table: other_table,
                        alias: child_alias.to_string(),
                        on: format!(
                            "{} = {}",
                            qualify(child_alias, column_of(other_entity, junction.other_id)?),
                            qualify(
                                junction_alias,
                                column_of(junction.entity, junction.other_fk)?
                            )
                        ),
                    },
                ])
            }
        }
    }

    pub fn insert_sql(&self, object: &PersistentObject) -> PersistenceResult<SqlStatement> {
        self.ensure_own(object.oid())?;
        if object.oid().is_dummy() {
            return Err(PersistenceError::InvalidData(format!(
                "`{}` has no persistent id yet",
                object.oid()
            )));
        }

        let mut columns = Vec::new();
        let mut params = Vec::new();
        for attribute in self.entity.attributes() {
            let mut value = self.persisted_value(object, &attribute.name)?;
            if self.entity.version_attribute() == Some(attribute.name.as_str()) && value.is_null() {
                value = Value::Integer(1);
            }
            columns.push(quote_ident(&attribute.column));
            params.push(value.to_sql_value());
        }

        Ok(SqlStatement::new(
            format!(
                "INSERT INTO {} ({}) VALUES ({})",
                quote_ident(&self.table_name()),
                columns.join(", "),
                placeholders(params.len())
            ),
            params,
        ))
    }

    /// UPDATE of every non-key attribute.
    ///
    /// With a snapshot, the statement only matches the row when it is still
    /// in the snapshotted state; zero affected rows then means a conflict.
    pub fn update_sql(
        &self,
        object: &PersistentObject,
        snapshot: Option<&OptimisticSnapshot>,
    ) -> PersistenceResult<SqlStatement> {
        self.ensure_own(object.oid())?;

        let mut assignments = Vec::new();
        let mut params = Vec::new();
        for attribute in self.entity.attributes() {
            if attribute.is_primary_key {
                continue;
            }
            let value = if self.entity.version_attribute() == Some(attribute.name.as_str()) {
                Value::from(self.next_version(object)?)
            } else {
                self.persisted_value(object, &attribute.name)?
            };
            assignments.push(format!("{} = ?", quote_ident(&attribute.column)));
            params.push(value.to_sql_value());
        }
        if assignments.is_empty() {
            return Err(PersistenceError::InvalidSchema(format!(
                "type `{}` has no updatable attributes",
                self.type_name()
            )));
        }

        let (mut predicate, pk_params) = self.pk_condition(None, object.oid())?;
        params.extend(pk_params);

        if let Some(snapshot) = snapshot {
            let version = self
                .entity
                .version_attribute()
                .and_then(|name| snapshot.values.get(name).map(|value| (name, value)));
            match version {
                Some((name, expected)) => {
                    let column = quote_ident(column_of(self.entity, name)?);
                    predicate.push_str(&format!(" AND {column} = ?"));
                    params.push(expected.to_sql_value());
                }
                None => {
                    for (name, expected) in &snapshot.values {
                        let Some(attribute) = self.entity.attribute_description(name) else {
                            continue;
                        };
                        if attribute.is_primary_key {
                            continue;
                        }
                        let column = quote_ident(&attribute.column);
                        predicate.push_str(&format!(" AND {column} IS ?"));
                        params.push(expected.to_sql_value());
                    }
                }
            }
        }

        Ok(SqlStatement::new(
            format!(
                "UPDATE {} SET {} WHERE {}",
                quote_ident(&self.table_name()),
                assignments.join(", "),
                predicate
            ),
            params,
        ))
    }

    pub fn delete_sql(&self, oid: &ObjectId) -> PersistenceResult<SqlStatement> {
        let (predicate, params) = self.pk_condition(None, oid)?;
        Ok(SqlStatement::new(
            format!(
                "DELETE FROM {} WHERE {}",
                quote_ident(&self.table_name()),
                predicate
            ),
            params,
        ))
    }

    /// DDL creating this type's table when missing.
    pub fn create_table_sql(&self) -> String {
        let mut definitions: Vec<String> = self
            .entity
            .attributes()
            .iter()
            .map(|attribute| {
                let not_null = if attribute.is_primary_key { " NOT NULL" } else { "" };
                format!(
                    "{} {}{not_null}",
                    quote_ident(&attribute.column),
                    attribute.data_type.sql_type()
                )
            })
            .collect();
        let keys: Vec<String> = self
            .entity
            .primary_keys()
            .iter()
            .map(|attribute| quote_ident(&attribute.column))
            .collect();
        definitions.push(format!("PRIMARY KEY ({})", keys.join(", ")));
        format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            quote_ident(&self.table_name()),
            definitions.join(", ")
        )
    }

    /// Runs `select` and hydrates every row.
    pub fn fetch(
        &self,
        conn: &Connection,
        select: &SelectStatement,
    ) -> PersistenceResult<Vec<FetchedRow>> {
        let statement = select.to_statement();
        debug!(
            "event=mapper_select module=mapper status=start type={} sql={}",
            self.type_name(),
            statement.sql
        );

        let mut stmt = conn.prepare(&statement.sql)?;
        let names: Vec<String> = stmt
            .column_names()
            .into_iter()
            .map(str::to_string)
            .collect();
        let mut rows = stmt.query(params_from_iter(statement.params.iter()))?;

        let mut fetched = Vec::new();
        while let Some(row) = rows.next()? {
            let mut values = BTreeMap::new();
            let mut references = BTreeMap::new();
            let mut extra = BTreeMap::new();
            for (index, name) in names.iter().enumerate() {
                let value: Value = row.get(index)?;
                if self.entity.attribute_description(name).is_some() {
                    values.insert(name.clone(), value);
                } else if self.entity.reference_description(name).is_some() {
                    references.insert(name.clone(), value);
                } else {
                    extra.insert(name.clone(), value);
                }
            }
            let mut object = PersistentObject::hydrated(self.entity, values, references)?;
            self.attach_foreign_keys(&mut object)?;
            fetched.push(FetchedRow { object, extra });
        }
        Ok(fetched)
    }

    /// Number of rows `select` matches, ignoring paging.
    pub fn count(&self, conn: &Connection, select: &SelectStatement) -> PersistenceResult<u64> {
        let statement = select.count_statement();
        let count: i64 = conn.query_row(
            &statement.sql,
            params_from_iter(statement.params.iter()),
            |row| row.get(0),
        )?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    /// Currently persisted state of `oid`, if the row exists.
    pub fn load_current(
        &self,
        conn: &Connection,
        oid: &ObjectId,
    ) -> PersistenceResult<Option<PersistentObject>> {
        let select = self.select_by_oid_sql(oid)?;
        Ok(self.fetch(conn, &select)?.into_iter().next().map(|row| row.object))
    }

    /// Allocates a persistent id for a new object of this type.
    ///
    /// Integer keys come from `orm_sequences`, never below the table's
    /// current maximum; text keys are random UUIDs.
    pub fn allocate_oid(&self, conn: &Connection) -> PersistenceResult<ObjectId> {
        let keys = self.entity.primary_keys();
        let [key] = keys.as_slice() else {
            return Err(PersistenceError::InvalidSchema(format!(
                "type `{}` has a composite key; ids must be provided by the caller",
                self.type_name()
            )));
        };

        let id = match key.data_type {
            DataType::Text => KeyValue::Text(Uuid::new_v4().simple().to_string()),
            DataType::Integer | DataType::Real => {
                let table = self.table_name();
                conn.execute(
                    "INSERT OR IGNORE INTO orm_sequences (name, last_id) VALUES (?1, 0)",
                    params![table],
                )?;
                let last_id: i64 = conn.query_row(
                    "SELECT last_id FROM orm_sequences WHERE name = ?1",
                    params![table],
                    |row| row.get(0),
                )?;
                let max_existing: i64 = conn.query_row(
                    &format!(
                        "SELECT COALESCE(MAX({}), 0) FROM {}",
                        quote_ident(&key.column),
                        quote_ident(&table)
                    ),
                    [],
                    |row| row.get(0),
                )?;
                let next = last_id.max(max_existing) + 1;
                conn.execute(
                    "UPDATE orm_sequences SET last_id = ?1 WHERE name = ?2",
                    params![next, table],
                )?;
                KeyValue::Int(next)
            }
        };
        ObjectId::new(self.type_name(), vec![id])
    }

    /// True when the junction row linking `this_oid` and `other_oid` exists.
    pub fn association_exists(
        &self,
        conn: &Connection,
        role: &str,
        this_oid: &ObjectId,
        other_oid: &ObjectId,
    ) -> PersistenceResult<bool> {
        let relation = self.entity.require_relation(role)?;
        let junction = self.junction_mapping(relation)?;
        let found = conn
            .query_row(
                &format!(
                    "SELECT 1 FROM {} WHERE {} = ?1 AND {} = ?2 LIMIT 1",
                    quote_ident(&junction.table),
                    quote_ident(column_of(junction.entity, junction.this_fk)?),
                    quote_ident(column_of(junction.entity, junction.other_fk)?)
                ),
                params![
                    this_oid.first_id().to_value(),
                    other_oid.first_id().to_value()
                ],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Inserts the junction row unless it already exists.
    ///
    /// Returns `false` when the association was already present.
    pub fn insert_association(
        &self,
        conn: &Connection,
        role: &str,
        this_oid: &ObjectId,
        other_oid: &ObjectId,
    ) -> PersistenceResult<bool> {
        if self.association_exists(conn, role, this_oid, other_oid)? {
            return Ok(false);
        }
        let relation = self.entity.require_relation(role)?;
        let junction = self.junction_mapping(relation)?;
        let junction_mapper = RdbMapper::new(junction.entity, self.registry);
        let link_oid = junction_mapper.allocate_oid(conn)?;

        let mut columns = Vec::new();
        let mut values = Vec::new();
        for attribute in junction.entity.attributes() {
            let value = if attribute.is_primary_key {
                link_oid.first_id().to_value()
            } else if attribute.name == junction.this_fk {
                this_oid.first_id().to_value()
            } else if attribute.name == junction.other_fk {
                other_oid.first_id().to_value()
            } else if attribute.name.starts_with("sortkey") {
                link_oid.first_id().to_value()
            } else {
                continue;
            };
            columns.push(quote_ident(&attribute.column));
            values.push(value.to_sql_value());
        }
        let statement = SqlStatement::new(
            format!(
                "INSERT INTO {} ({}) VALUES ({})",
                quote_ident(&junction.table),
                columns.join(", "),
                placeholders(values.len())
            ),
            values,
        );
        execute_statement(conn, &statement)?;
        Ok(true)
    }

    /// Deletes junction rows of `this_oid`, optionally only those to `other_oid`.
    pub fn delete_associations(
        &self,
        conn: &Connection,
        role: &str,
        this_oid: &ObjectId,
        other_oid: Option<&ObjectId>,
    ) -> PersistenceResult<usize> {
        let relation = self.entity.require_relation(role)?;
        let junction = self.junction_mapping(relation)?;
        let mut sql = format!(
            "DELETE FROM {} WHERE {} = ?",
            quote_ident(&junction.table),
            quote_ident(column_of(junction.entity, junction.this_fk)?)
        );
        let mut values = vec![this_oid.first_id().to_value().to_sql_value()];
        if let Some(other_oid) = other_oid {
            sql.push_str(&format!(
                " AND {} = ?",
                quote_ident(column_of(junction.entity, junction.other_fk)?)
            ));
            values.push(other_oid.first_id().to_value().to_sql_value());
        }
        execute_statement(conn, &SqlStatement::new(sql, values))
    }

    /// Ids of `role` children of `parent_oid` for a one-to-many relation.
    pub fn child_oids(
        &self,
        conn: &Connection,
        role: &str,
        parent_oid: &ObjectId,
    ) -> PersistenceResult<Vec<ObjectId>> {
        let relation = self.entity.require_relation(role)?;
        let RelationMapping::OneToMany { fk_attribute, .. } = &relation.mapping else {
            return Err(PersistenceError::InvalidQuery(format!(
                "role `{role}` of `{}` is not one-to-many",
                self.type_name()
            )));
        };
        let child = self.registry.entity(&relation.other_type)?;
        let child_mapper = RdbMapper::new(child, self.registry);
        let mut select = child_mapper.select_sql(&[], None, None, Some(&[]))?;
        let column = child_mapper.column_sql(&mut select, fk_attribute)?;
        select.and_where(
            format!("{column} = ?"),
            vec![parent_oid.first_id().to_value().to_sql_value()],
        );
        Ok(child_mapper
            .fetch(conn, &select)?
            .into_iter()
            .map(|row| row.object.oid().clone())
            .collect())
    }

    /// Clears the foreign key of every `role` child of `parent_oid`.
    pub fn nullify_children(
        &self,
        conn: &Connection,
        role: &str,
        parent_oid: &ObjectId,
    ) -> PersistenceResult<usize> {
        let relation = self.entity.require_relation(role)?;
        let RelationMapping::OneToMany { fk_attribute, .. } = &relation.mapping else {
            return Ok(0);
        };
        let child = self.registry.entity(&relation.other_type)?;
        let column = quote_ident(column_of(child, fk_attribute)?);
        execute_statement(
            conn,
            &SqlStatement::new(
                format!(
                    "UPDATE {} SET {column} = NULL WHERE {column} = ?",
                    quote_ident(&self.registry.table_name(child))
                ),
                vec![parent_oid.first_id().to_value().to_sql_value()],
            ),
        )
    }

    /// Version value the next UPDATE writes, `None` without a version attribute.
    pub fn next_version(&self, object: &PersistentObject) -> PersistenceResult<Option<i64>> {
        match self.entity.version_attribute() {
            Some(name) => Ok(Some(object.get_i64(name)?.unwrap_or(0) + 1)),
            None => Ok(None),
        }
    }

    /// Qualified column expression for an attribute or reference name.
    pub(crate) fn column_sql(
        &self,
        select: &mut SelectStatement,
        name: &str,
    ) -> PersistenceResult<String> {
        let alias = select.table_alias().to_string();
        self.column_sql_for_alias(select, &alias, name)
    }

    pub(crate) fn column_sql_for_alias(
        &self,
        select: &mut SelectStatement,
        alias: &str,
        name: &str,
    ) -> PersistenceResult<String> {
        if let Some(attribute) = self.entity.attribute_description(name) {
            return Ok(qualify(alias, &attribute.column));
        }
        if let Some(reference) = self.entity.reference_description(name) {
            if alias == select.table_alias() {
                return self.reference_column(select, alias, reference);
            }
        }
        Err(self.unknown_field(name))
    }

    fn reference_column(
        &self,
        select: &mut SelectStatement,
        this_alias: &str,
        reference: &ReferenceDescription,
    ) -> PersistenceResult<String> {
        let relation = self.entity.require_relation(&reference.role)?;
        let RelationMapping::ManyToOne {
            fk_attribute,
            id_attribute,
        } = &relation.mapping
        else {
            return Err(PersistenceError::InvalidSchema(format!(
                "reference `{}` of `{}` needs a many-to-one role",
                reference.name,
                self.type_name()
            )));
        };
        let other = self.registry.entity(&relation.other_type)?;
        let ref_alias = format!("{}Ref", reference.role);
        select.add_join(Join {
            kind: JoinKind::Left,
            table: self.registry.table_name(other),
            alias: ref_alias.clone(),
            on: format!(
                "{} = {}",
                qualify(&ref_alias, column_of(other, id_attribute)?),
                qualify(this_alias, column_of(self.entity, fk_attribute)?)
            ),
        });
        Ok(qualify(&ref_alias, column_of(other, &reference.attribute)?))
    }

    fn apply_criteria(
        &self,
        select: &mut SelectStatement,
        alias: &str,
        criteria: &[Criteria],
    ) -> PersistenceResult<()> {
        let mut parts = Vec::new();
        let mut params = Vec::new();
        for criterion in criteria {
            if criterion.type_name != self.type_name() {
                return Err(PersistenceError::InvalidQuery(format!(
                    "criteria on `{}` cannot filter `{}`",
                    criterion.type_name,
                    self.type_name()
                )));
            }
            let column = self.column_sql_for_alias(select, alias, &criterion.attribute)?;
            let (predicate, values) = criterion.render(&column)?;
            parts.push((criterion.combine, predicate));
            params.extend(values);
        }
        if let Some(predicate) = join_predicates(parts) {
            select.and_where(predicate, params);
        }
        Ok(())
    }

    fn order_sql(
        &self,
        select: &mut SelectStatement,
        alias: &str,
        order: Option<&[OrderTerm]>,
    ) -> PersistenceResult<Vec<String>> {
        let fallback: Vec<OrderTerm>;
        let terms = match order {
            Some(terms) => terms,
            None if !self.entity.default_order().is_empty() => self.entity.default_order(),
            None => {
                fallback = self
                    .entity
                    .primary_keys()
                    .iter()
                    .map(|attribute| OrderTerm::asc(&attribute.name))
                    .collect();
                &fallback
            }
        };

        let table = self.table_name();
        let mut rendered = Vec::new();
        for term in terms {
            if let Some(qualifier) = &term.qualifier {
                if qualifier != self.type_name() && qualifier != alias && qualifier != &table {
                    return Err(PersistenceError::InvalidQuery(format!(
                        "order term `{term}` does not address `{}`",
                        self.type_name()
                    )));
                }
            }
            let column = self.column_sql_for_alias(select, alias, &term.attribute)?;
            rendered.push(format!("{column} {}", term.direction.as_sql()));
        }
        Ok(rendered)
    }

    fn pk_condition(
        &self,
        alias: Option<&str>,
        oid: &ObjectId,
    ) -> PersistenceResult<(String, Vec<SqlValue>)> {
        self.ensure_own(oid)?;
        let keys = self.entity.primary_keys();
        if keys.len() != oid.ids().len() {
            return Err(PersistenceError::InvalidObjectId(format!(
                "`{oid}` needs {} key values",
                keys.len()
            )));
        }
        let predicates: Vec<String> = keys
            .iter()
            .map(|attribute| {
                let column = match alias {
                    Some(alias) => qualify(alias, &attribute.column),
                    None => quote_ident(&attribute.column),
                };
                format!("{column} = ?")
            })
            .collect();
        let params = oid
            .ids()
            .iter()
            .map(|id| id.to_value().to_sql_value())
            .collect();
        Ok((predicates.join(" AND "), params))
    }

    /// Value written for `attribute`, resolving foreign keys from relations.
    fn persisted_value(
        &self,
        object: &PersistentObject,
        attribute: &str,
    ) -> PersistenceResult<Value> {
        let fk_relation = self.entity.relations().iter().find(|relation| {
            relation.fk_column_on_this() == Some(attribute)
                && object.has_relation_role(&relation.other_role)
        });
        let Some(relation) = fk_relation else {
            return Ok(object.value(attribute)?.clone());
        };
        match object.related(&relation.other_role).first() {
            Some(target) if target.is_dummy() => Err(PersistenceError::InvalidData(format!(
                "`{}` references unsaved `{target}`",
                object.oid()
            ))),
            Some(target) => Ok(target.first_id().to_value()),
            None => Ok(Value::Null),
        }
    }

    fn attach_foreign_keys(&self, object: &mut PersistentObject) -> PersistenceResult<()> {
        let mut resolved = Vec::new();
        for relation in self.entity.relations() {
            let Some(fk_attribute) = relation.fk_column_on_this() else {
                continue;
            };
            let related = match KeyValue::from_value(object.value(fk_attribute)?) {
                Some(key) => vec![ObjectId::new(relation.other_type.as_str(), vec![key])?],
                None => Vec::new(),
            };
            resolved.push((relation.other_role.clone(), related));
        }
        for (role, related) in resolved {
            object.set_related(&role, related);
        }
        Ok(())
    }

    fn junction_mapping(
        &self,
        relation: &'r RelationDescription,
    ) -> PersistenceResult<JunctionMapping<'r>> {
        let RelationMapping::ManyToMany {
            junction_type,
            this_end,
            other_end,
        } = &relation.mapping
        else {
            return Err(PersistenceError::InvalidQuery(format!(
                "role `{}` of `{}` is not many-to-many",
                relation.other_role,
                self.type_name()
            )));
        };
        let (
            RelationMapping::OneToMany {
                fk_attribute: this_fk,
                id_attribute: this_id,
            },
            RelationMapping::ManyToOne {
                fk_attribute: other_fk,
                id_attribute: other_id,
            },
        ) = (&this_end.mapping, &other_end.mapping)
        else {
            return Err(PersistenceError::InvalidSchema(format!(
                "junction `{junction_type}` of `{}` is malformed",
                self.type_name()
            )));
        };
        let entity = self.registry.entity(junction_type)?;
        Ok(JunctionMapping {
            entity,
            table: self.registry.table_name(entity),
            this_fk,
            this_id,
            other_fk,
            other_id,
        })
    }

    fn ensure_own(&self, oid: &ObjectId) -> PersistenceResult<()> {
        if oid.type_name() != self.type_name() {
            return Err(PersistenceError::InvalidObjectId(format!(
                "`{oid}` is not a `{}`",
                self.type_name()
            )));
        }
        Ok(())
    }

    fn unknown_field(&self, name: &str) -> PersistenceError {
        PersistenceError::UnknownField {
            type_name: self.type_name().to_string(),
            field: name.to_string(),
        }
    }
}

/// Executes a statement, returning the affected row count.
pub fn execute_statement(conn: &Connection, statement: &SqlStatement) -> PersistenceResult<usize> {
    debug!(
        "event=mapper_execute module=mapper status=start sql={}",
        statement.sql
    );
    Ok(conn.execute(&statement.sql, params_from_iter(statement.params.iter()))?)
}

fn column_of<'a>(entity: &'a EntityType, attribute: &str) -> PersistenceResult<&'a str> {
    Ok(entity.require_attribute(attribute)?.column.as_str())
}

fn distinct_values(
    parents: &[&PersistentObject],
    attribute: &str,
) -> PersistenceResult<Vec<SqlValue>> {
    let mut keys = Vec::new();
    for parent in parents {
        if let Some(key) = KeyValue::from_value(parent.value(attribute)?) {
            if !key.is_dummy() && !keys.contains(&key) {
                keys.push(key);
            }
        }
    }
    Ok(keys
        .iter()
        .map(|key| key.to_value().to_sql_value())
        .collect())
}

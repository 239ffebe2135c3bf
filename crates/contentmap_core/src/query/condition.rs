//! Boolean condition trees and their resolution into joins and predicates.
//!
//! # Responsibility
//! - Represent parsed conditions independent of their surface grammar.
//! - Resolve qualifiers against the root type and add the joins they need.
//!
//! # Invariants
//! - A qualifier naming the root type (or its table) addresses the root table.
//! - A qualifier naming a role joins through that role, aliased by the role.
//! - A qualifier naming another type joins through the root's only relation
//!   to it; several candidate relations raise `AmbiguousRelation`.
//! - Literal values are only ever bound as parameters.

use crate::error::{PersistenceError, PersistenceResult};
use crate::mapper::criteria::{Combine, Criteria, CriteriaValue, Operator};
use crate::mapper::registry::MapperRegistry;
use crate::mapper::sql::SelectStatement;
use crate::model::relation::{RelationDescription, RelationMapping};
use rusqlite::types::Value as SqlValue;

#[derive(Debug, Clone, PartialEq)]
pub enum ConditionExpr {
    Compare {
        qualifier: Option<String>,
        attribute: String,
        operator: Operator,
        value: CriteriaValue,
    },
    And(Vec<ConditionExpr>),
    Or(Vec<ConditionExpr>),
    Not(Box<ConditionExpr>),
}

impl ConditionExpr {
    pub fn compare(
        qualifier: Option<&str>,
        attribute: &str,
        operator: Operator,
        value: impl Into<CriteriaValue>,
    ) -> Self {
        Self::Compare {
            qualifier: qualifier.map(str::to_string),
            attribute: attribute.to_string(),
            operator,
            value: value.into(),
        }
    }

    /// Conjunction that flattens nested conjunctions and single members.
    pub fn and(mut terms: Vec<ConditionExpr>) -> Self {
        if terms.len() == 1 {
            return terms.remove(0);
        }
        Self::And(
            terms
                .into_iter()
                .flat_map(|term| match term {
                    Self::And(inner) => inner,
                    other => vec![other],
                })
                .collect(),
        )
    }

    pub fn or(mut terms: Vec<ConditionExpr>) -> Self {
        if terms.len() == 1 {
            return terms.remove(0);
        }
        Self::Or(
            terms
                .into_iter()
                .flat_map(|term| match term {
                    Self::Or(inner) => inner,
                    other => vec![other],
                })
                .collect(),
        )
    }
}

/// Returns `base`, or `base_1`, `base_2`, ... when `taken` rejects it.
pub(crate) fn unique_alias(base: &str, taken: impl Fn(&str) -> bool) -> String {
    if !taken(base) {
        return base.to_string();
    }
    let mut suffix = 1;
    loop {
        let candidate = format!("{base}_{suffix}");
        if !taken(&candidate) {
            return candidate;
        }
        suffix += 1;
    }
}

/// Resolves condition qualifiers for one root type into `select`.
pub(crate) struct ConditionResolver<'q> {
    registry: &'q MapperRegistry,
    root_type: &'q str,
}

impl<'q> ConditionResolver<'q> {
    pub(crate) fn new(registry: &'q MapperRegistry, root_type: &'q str) -> Self {
        Self {
            registry,
            root_type,
        }
    }

    /// Adds the joins `expr` needs and AND-appends its predicate.
    pub(crate) fn apply(
        &self,
        select: &mut SelectStatement,
        expr: &ConditionExpr,
    ) -> PersistenceResult<()> {
        let (predicate, params) = self.render(select, expr)?;
        select.and_where(predicate, params);
        Ok(())
    }

    fn render(
        &self,
        select: &mut SelectStatement,
        expr: &ConditionExpr,
    ) -> PersistenceResult<(String, Vec<SqlValue>)> {
        match expr {
            ConditionExpr::Compare {
                qualifier,
                attribute,
                operator,
                value,
            } => {
                let (type_name, alias) = self.resolve_qualifier(select, qualifier.as_deref())?;
                let mapper = self.registry.mapper(&type_name)?;
                let column = mapper.column_sql_for_alias(select, &alias, attribute)?;
                Criteria {
                    type_name,
                    attribute: attribute.clone(),
                    operator: *operator,
                    value: value.clone(),
                    combine: Combine::And,
                }
                .render(&column)
            }
            ConditionExpr::And(terms) => self.render_terms(select, terms, Combine::And),
            ConditionExpr::Or(terms) => self.render_terms(select, terms, Combine::Or),
            ConditionExpr::Not(inner) => {
                let (predicate, params) = self.render(select, inner)?;
                Ok((format!("NOT ({predicate})"), params))
            }
        }
    }

    fn render_terms(
        &self,
        select: &mut SelectStatement,
        terms: &[ConditionExpr],
        combine: Combine,
    ) -> PersistenceResult<(String, Vec<SqlValue>)> {
        let mut parts = Vec::with_capacity(terms.len());
        let mut params = Vec::new();
        for term in terms {
            let (predicate, values) = self.render(select, term)?;
            let predicate = match term {
                ConditionExpr::And(_) | ConditionExpr::Or(_) => format!("({predicate})"),
                _ => predicate,
            };
            parts.push(predicate);
            params.extend(values);
        }
        Ok((parts.join(&format!(" {} ", combine.as_sql())), params))
    }

    /// Type name and alias addressed by `qualifier`, joining when needed.
    fn resolve_qualifier(
        &self,
        select: &mut SelectStatement,
        qualifier: Option<&str>,
    ) -> PersistenceResult<(String, String)> {
        let root_alias = select.table_alias().to_string();
        let Some(qualifier) = qualifier else {
            return Ok((self.root_type.to_string(), root_alias));
        };
        let root = self.registry.entity(self.root_type)?;
        if qualifier == self.root_type
            || qualifier == root_alias
            || qualifier == self.registry.table_name(root)
        {
            return Ok((self.root_type.to_string(), root_alias));
        }

        let relation = match root.relation(qualifier) {
            Some(relation) => relation,
            None if self.registry.schema().contains(qualifier) => {
                root.resolve_relation(qualifier, None)?
            }
            None => return Err(PersistenceError::UnknownType(qualifier.to_string())),
        };
        self.join_role(select, &root_alias, relation)?;
        Ok((relation.other_type.clone(), relation.other_role.clone()))
    }

    fn join_role(
        &self,
        select: &mut SelectStatement,
        root_alias: &str,
        relation: &RelationDescription,
    ) -> PersistenceResult<()> {
        let role = relation.other_role.as_str();
        if select.has_join(role) {
            return Ok(());
        }
        let junction_alias = match &relation.mapping {
            RelationMapping::ManyToMany { junction_type, .. } => {
                let junction = self.registry.entity(junction_type)?;
                unique_alias(&self.registry.table_name(junction), |candidate| {
                    candidate == root_alias || select.has_join(candidate)
                })
            }
            _ => String::new(),
        };
        let mapper = self.registry.mapper(self.root_type)?;
        for join in mapper.relation_join(root_alias, role, role, &junction_alias)? {
            select.add_join(join);
        }
        select.distinct = true;
        Ok(())
    }
}

//! Queries built from typed object templates.
//!
//! # Responsibility
//! - Collect per-template criteria, template edges and explicit groups.
//! - Emit relation joins with collision-free aliases and the WHERE clause.
//!
//! # Invariants
//! - Joined templates are aliased by their explicit alias or their role name,
//!   suffixed `_1`, `_2`, ... on collision.
//! - Templates without an edge must have the root type and address the root
//!   table directly.
//! - Criteria of one template form one parenthesized group; top-level terms
//!   combine flat, so AND binds tighter than OR.

use crate::error::{PersistenceError, PersistenceResult};
use crate::mapper::criteria::{join_predicates, Combine, Criteria, CriteriaValue, Operator};
use crate::mapper::registry::MapperRegistry;
use crate::mapper::sql::SelectStatement;
use crate::model::relation::RelationMapping;
use crate::model::schema::OrderTerm;
use crate::query::condition::unique_alias;
use crate::query::execute_select;
use crate::query::paging::PagingInfo;
use crate::tx::{BuildDepth, ObjectHandle, Transaction};
use log::debug;
use rusqlite::types::Value as SqlValue;
use std::collections::HashSet;

/// Reference to a template of one query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TemplateId(usize);

#[derive(Debug, Clone)]
struct Edge {
    parent: TemplateId,
    role: String,
    alias: String,
    junction_alias: String,
}

#[derive(Debug, Clone)]
struct Template {
    type_name: String,
    requested_alias: Option<String>,
    combine: Combine,
    criteria: Vec<Criteria>,
    edge: Option<Edge>,
    group: Option<usize>,
}

#[derive(Debug, Clone)]
struct Group {
    members: Vec<TemplateId>,
    combine: Combine,
}

#[derive(Debug, Clone)]
pub struct ObjectQuery {
    registry: MapperRegistry,
    root_type: String,
    templates: Vec<Template>,
    groups: Vec<Group>,
}

impl ObjectQuery {
    /// Creates a query returning objects of `root_type`; its root template
    /// is `root()`.
    pub fn new(registry: MapperRegistry, root_type: &str) -> PersistenceResult<Self> {
        registry.entity(root_type)?;
        let mut query = Self {
            registry,
            root_type: root_type.to_string(),
            templates: Vec::new(),
            groups: Vec::new(),
        };
        query.template(root_type)?;
        Ok(query)
    }

    pub fn root(&self) -> TemplateId {
        TemplateId(0)
    }

    pub fn root_type(&self) -> &str {
        &self.root_type
    }

    pub fn template(&mut self, type_name: &str) -> PersistenceResult<TemplateId> {
        self.template_with(type_name, None, Combine::And)
    }

    /// Adds a template with an explicit alias and the operator joining its
    /// conditions to the preceding terms.
    pub fn template_with(
        &mut self,
        type_name: &str,
        alias: Option<&str>,
        combine: Combine,
    ) -> PersistenceResult<TemplateId> {
        self.registry.entity(type_name)?;
        self.templates.push(Template {
            type_name: type_name.to_string(),
            requested_alias: alias.map(str::to_string),
            combine,
            criteria: Vec::new(),
            edge: None,
            group: None,
        });
        Ok(TemplateId(self.templates.len() - 1))
    }

    /// Adds `attribute OP value` to the template's condition group.
    pub fn set_value(
        &mut self,
        template: TemplateId,
        attribute: &str,
        operator: Operator,
        value: impl Into<CriteriaValue>,
    ) -> PersistenceResult<()> {
        let type_name = self.template_ref(template)?.type_name.clone();
        self.add_criteria(
            template,
            Criteria {
                type_name,
                attribute: attribute.to_string(),
                operator,
                value: value.into(),
                combine: Combine::And,
            },
        )
    }

    /// Adds a prepared criterion, keeping its own combine operator.
    pub fn add_criteria(
        &mut self,
        template: TemplateId,
        criteria: Criteria,
    ) -> PersistenceResult<()> {
        let registry = self.registry.clone();
        let slot = self.template_mut(template)?;
        if criteria.type_name != slot.type_name {
            return Err(PersistenceError::InvalidQuery(format!(
                "criteria on `{}` cannot filter a `{}` template",
                criteria.type_name, slot.type_name
            )));
        }
        let entity = registry.entity(&slot.type_name)?;
        if entity.attribute_description(&criteria.attribute).is_none()
            && entity.reference_description(&criteria.attribute).is_none()
        {
            return Err(PersistenceError::UnknownField {
                type_name: slot.type_name.clone(),
                field: criteria.attribute,
            });
        }
        slot.criteria.push(criteria);
        Ok(())
    }

    /// Declares `child` as reached from `parent` through a relation.
    ///
    /// `role` is required when several relations connect the two types.
    pub fn add_node(
        &mut self,
        parent: TemplateId,
        child: TemplateId,
        role: Option<&str>,
    ) -> PersistenceResult<()> {
        if child == self.root() || child == parent {
            return Err(PersistenceError::InvalidQuery(format!(
                "template {} cannot be attached below template {}",
                child.0, parent.0
            )));
        }
        if self.template_ref(child)?.edge.is_some() {
            return Err(PersistenceError::InvalidQuery(format!(
                "template {} already has a parent",
                child.0
            )));
        }
        let parent_type = self.template_ref(parent)?.type_name.clone();
        let child_template = self.template_ref(child)?;
        let relation = self
            .registry
            .entity(&parent_type)?
            .resolve_relation(&child_template.type_name, role)?
            .clone();

        let taken = self.taken_aliases();
        let base = child_template
            .requested_alias
            .clone()
            .unwrap_or_else(|| relation.other_role.clone());
        let alias = unique_alias(&base, |candidate| taken.contains(candidate));
        let junction_alias = match &relation.mapping {
            RelationMapping::ManyToMany { junction_type, .. } => {
                let junction = self.registry.entity(junction_type)?;
                let base = self.registry.table_name(junction);
                unique_alias(&base, |candidate| {
                    taken.contains(candidate) || candidate == alias
                })
            }
            _ => String::new(),
        };

        self.template_mut(child)?.edge = Some(Edge {
            parent,
            role: relation.other_role,
            alias,
            junction_alias,
        });
        Ok(())
    }

    /// Parenthesizes `templates` into one term whose members combine with
    /// `combine`; the group joins preceding terms with its first member's
    /// operator.
    pub fn make_group(
        &mut self,
        templates: &[TemplateId],
        combine: Combine,
    ) -> PersistenceResult<()> {
        if templates.is_empty() {
            return Err(PersistenceError::InvalidQuery(
                "a group needs at least one template".to_string(),
            ));
        }
        for template in templates {
            if self.template_ref(*template)?.group.is_some() {
                return Err(PersistenceError::InvalidQuery(format!(
                    "template {} is already grouped",
                    template.0
                )));
            }
        }
        let index = self.groups.len();
        for template in templates {
            self.template_mut(*template)?.group = Some(index);
        }
        self.groups.push(Group {
            members: templates.to_vec(),
            combine,
        });
        Ok(())
    }

    /// Alias a template is addressed by in the built SQL.
    pub fn alias(&self, template: TemplateId) -> PersistenceResult<String> {
        let slot = self.template_ref(template)?;
        match &slot.edge {
            Some(edge) => Ok(edge.alias.clone()),
            None => Ok(self.root_alias()?),
        }
    }

    pub fn build(&self, order: Option<&[OrderTerm]>) -> PersistenceResult<SelectStatement> {
        let root_mapper = self.registry.mapper(&self.root_type)?;
        let mut select = root_mapper.select_sql(&[], None, None, order)?;

        for template in self.join_order()? {
            let slot = &self.templates[template.0];
            let Some(edge) = &slot.edge else {
                continue;
            };
            let parent_type = &self.templates[edge.parent.0].type_name;
            let parent_alias = self.alias(edge.parent)?;
            let joins = self.registry.mapper(parent_type)?.relation_join(
                &parent_alias,
                &edge.role,
                &edge.alias,
                &edge.junction_alias,
            )?;
            for join in joins {
                select.add_join(join);
            }
            select.distinct = true;
        }

        let mut terms = Vec::new();
        let mut params = Vec::new();
        let mut emitted_groups = HashSet::new();
        for (index, slot) in self.templates.iter().enumerate() {
            match slot.group {
                Some(group) => {
                    if !emitted_groups.insert(group) {
                        continue;
                    }
                    let mut parts = Vec::new();
                    for member in &self.groups[group].members {
                        let rendered = self.render_template(&mut select, *member, &mut params)?;
                        if let Some(predicate) = rendered {
                            parts.push((self.groups[group].combine, predicate));
                        }
                    }
                    let leading = self.groups[group].members[0];
                    if let Some(predicate) = join_predicates(parts) {
                        terms.push((self.templates[leading.0].combine, format!("({predicate})")));
                    }
                }
                None => {
                    if let Some(predicate) =
                        self.render_template(&mut select, TemplateId(index), &mut params)?
                    {
                        terms.push((slot.combine, predicate));
                    }
                }
            }
        }
        if let Some(predicate) = join_predicates(terms) {
            select.and_where(predicate, params);
        }

        debug!(
            "event=object_query_build module=query status=ok type={} templates={} joins={}",
            self.root_type,
            self.templates.len(),
            select.joins.len()
        );
        Ok(select)
    }

    /// Runs the query with the table mapping of `tx`, which may differ
    /// from the one the query was created with.
    pub fn execute(
        &self,
        tx: &mut Transaction<'_>,
        depth: BuildDepth,
        order: Option<&[OrderTerm]>,
        paging: Option<&mut PagingInfo>,
    ) -> PersistenceResult<Vec<ObjectHandle>> {
        let scoped = Self {
            registry: tx.registry().clone(),
            ..self.clone()
        };
        let select = scoped.build(order)?;
        execute_select(tx, &scoped.registry, &scoped.root_type, select, paging, depth)
    }

    fn render_template(
        &self,
        select: &mut SelectStatement,
        template: TemplateId,
        params: &mut Vec<SqlValue>,
    ) -> PersistenceResult<Option<String>> {
        let slot = &self.templates[template.0];
        if slot.criteria.is_empty() {
            return Ok(None);
        }
        let alias = self.alias(template)?;
        let mapper = self.registry.mapper(&slot.type_name)?;
        let mut parts = Vec::new();
        for criteria in &slot.criteria {
            let column = mapper.column_sql_for_alias(select, &alias, &criteria.attribute)?;
            let (predicate, values) = criteria.render(&column)?;
            parts.push((criteria.combine, predicate));
            params.extend(values);
        }
        Ok(join_predicates(parts).map(|predicate| format!("({predicate})")))
    }

    /// Templates ordered so that every parent precedes its children.
    fn join_order(&self) -> PersistenceResult<Vec<TemplateId>> {
        let mut placed: HashSet<TemplateId> = HashSet::new();
        let mut ordered = Vec::new();
        for (index, slot) in self.templates.iter().enumerate() {
            if slot.edge.is_none() {
                if slot.type_name != self.root_type {
                    return Err(PersistenceError::InvalidQuery(format!(
                        "template {index} of type `{}` is not connected to the `{}` root",
                        slot.type_name, self.root_type
                    )));
                }
                placed.insert(TemplateId(index));
            }
        }

        let mut remaining: Vec<TemplateId> = (0..self.templates.len())
            .map(TemplateId)
            .filter(|template| !placed.contains(template))
            .collect();
        while !remaining.is_empty() {
            let before = remaining.len();
            remaining.retain(|template| {
                let ready = self.templates[template.0]
                    .edge
                    .as_ref()
                    .is_some_and(|edge| placed.contains(&edge.parent));
                if ready {
                    placed.insert(*template);
                    ordered.push(*template);
                }
                !ready
            });
            if remaining.len() == before {
                return Err(PersistenceError::InvalidQuery(
                    "template edges form a cycle".to_string(),
                ));
            }
        }
        Ok(ordered)
    }

    fn root_alias(&self) -> PersistenceResult<String> {
        let root = self.registry.entity(&self.root_type)?;
        Ok(self.registry.table_name(root))
    }

    fn taken_aliases(&self) -> HashSet<String> {
        let mut taken: HashSet<String> = self
            .templates
            .iter()
            .filter_map(|slot| slot.edge.as_ref())
            .flat_map(|edge| [edge.alias.clone(), edge.junction_alias.clone()])
            .filter(|alias| !alias.is_empty())
            .collect();
        if let Ok(root_alias) = self.root_alias() {
            taken.insert(root_alias);
        }
        taken
    }

    fn template_ref(&self, template: TemplateId) -> PersistenceResult<&Template> {
        self.templates
            .get(template.0)
            .ok_or_else(|| unknown_template(template))
    }

    fn template_mut(&mut self, template: TemplateId) -> PersistenceResult<&mut Template> {
        self.templates
            .get_mut(template.0)
            .ok_or_else(|| unknown_template(template))
    }
}

fn unknown_template(template: TemplateId) -> PersistenceError {
    PersistenceError::InvalidQuery(format!("template {} does not belong to the query", template.0))
}

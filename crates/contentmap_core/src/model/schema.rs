//! Entity type metadata and schema construction.
//!
//! # Responsibility
//! - Describe mapped attributes, display references, sort keys and relations
//!   of every entity type.
//! - Derive both directions of each association from a single definition.
//!
//! # Invariants
//! - Role names are unique per entity type (relations are keyed by the role
//!   under which the related type is reached).
//! - Every relation endpoint and foreign key attribute exists.
//! - A built `Schema` is immutable; mappers share it through `Arc`.

use crate::error::{PersistenceError, PersistenceResult};
use crate::model::relation::{
    AggregationKind, Multiplicity, RelationDescription, RelationKind, RelationMapping,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Integer,
    Real,
    Text,
}

impl DataType {
    pub fn sql_type(&self) -> &'static str {
        match self {
            Self::Integer => "INTEGER",
            Self::Real => "REAL",
            Self::Text => "TEXT",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttributeDescription {
    pub name: String,
    pub column: String,
    pub data_type: DataType,
    pub is_primary_key: bool,
}

/// Read-only display value taken from the object reached under `role`.
///
/// `role` must name a many-to-one relation of the declaring type.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceDescription {
    pub name: String,
    pub role: String,
    pub attribute: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

impl SortDirection {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

/// One ORDER BY term, optionally qualified with a type name or alias.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderTerm {
    pub qualifier: Option<String>,
    pub attribute: String,
    pub direction: SortDirection,
}

impl OrderTerm {
    pub fn asc(attribute: &str) -> Self {
        Self {
            qualifier: None,
            attribute: attribute.to_string(),
            direction: SortDirection::Asc,
        }
    }

    pub fn desc(attribute: &str) -> Self {
        Self {
            qualifier: None,
            attribute: attribute.to_string(),
            direction: SortDirection::Desc,
        }
    }

    /// Parses `attr`, `attr DESC` or `Qualifier.attr ASC`.
    pub fn parse(raw: &str) -> PersistenceResult<Self> {
        let mut parts = raw.split_whitespace();
        let target = parts
            .next()
            .ok_or_else(|| PersistenceError::InvalidQuery("empty order term".to_string()))?;
        let direction = match parts.next().map(str::to_ascii_uppercase).as_deref() {
            None | Some("ASC") => SortDirection::Asc,
            Some("DESC") => SortDirection::Desc,
            Some(other) => {
                return Err(PersistenceError::InvalidQuery(format!(
                    "unsupported sort direction `{other}` in `{raw}`"
                )))
            }
        };
        if parts.next().is_some() {
            return Err(PersistenceError::InvalidQuery(format!(
                "malformed order term `{raw}`"
            )));
        }

        let target = target.replace('`', "");
        let (qualifier, attribute) = match target.rsplit_once('.') {
            Some((qualifier, attribute)) => (Some(qualifier.to_string()), attribute.to_string()),
            None => (None, target),
        };
        if attribute.is_empty() {
            return Err(PersistenceError::InvalidQuery(format!(
                "malformed order term `{raw}`"
            )));
        }
        Ok(Self {
            qualifier,
            attribute,
            direction,
        })
    }
}

impl Display for OrderTerm {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if let Some(qualifier) = &self.qualifier {
            write!(f, "{qualifier}.")?;
        }
        write!(f, "{} {}", self.attribute, self.direction.as_sql())
    }
}

/// Mapped entity type.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityType {
    name: String,
    table: String,
    attributes: Vec<AttributeDescription>,
    references: Vec<ReferenceDescription>,
    relations: Vec<RelationDescription>,
    sortkey: Vec<OrderTerm>,
    version_attribute: Option<String>,
}

impl EntityType {
    /// Starts a type whose table name equals the type name.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            table: name.to_string(),
            attributes: Vec::new(),
            references: Vec::new(),
            relations: Vec::new(),
            sortkey: Vec::new(),
            version_attribute: None,
        }
    }

    pub fn table(mut self, table: &str) -> Self {
        self.table = table.to_string();
        self
    }

    pub fn primary_key(mut self, name: &str, data_type: DataType) -> Self {
        self.attributes.push(AttributeDescription {
            name: name.to_string(),
            column: name.to_string(),
            data_type,
            is_primary_key: true,
        });
        self
    }

    pub fn attribute(self, name: &str, data_type: DataType) -> Self {
        self.attribute_with_column(name, name, data_type)
    }

    pub fn attribute_with_column(mut self, name: &str, column: &str, data_type: DataType) -> Self {
        self.attributes.push(AttributeDescription {
            name: name.to_string(),
            column: column.to_string(),
            data_type,
            is_primary_key: false,
        });
        self
    }

    pub fn reference(mut self, name: &str, role: &str, attribute: &str) -> Self {
        self.references.push(ReferenceDescription {
            name: name.to_string(),
            role: role.to_string(),
            attribute: attribute.to_string(),
        });
        self
    }

    /// Default ordering, e.g. `"sortkey"` or `"name DESC"`.
    ///
    /// Malformed terms are reported by `SchemaBuilder::build`.
    pub fn sortkey(mut self, term: &str) -> Self {
        match OrderTerm::parse(term) {
            Ok(term) => self.sortkey.push(term),
            Err(_) => self.sortkey.push(OrderTerm {
                qualifier: None,
                attribute: term.to_string(),
                direction: SortDirection::Asc,
            }),
        }
        self
    }

    /// Declares an integer optimistic-locking version attribute.
    ///
    /// An attribute already declared under `name` is reused.
    pub fn version(mut self, name: &str) -> Self {
        if self.attribute_description(name).is_none() {
            self = self.attribute(name, DataType::Integer);
        }
        self.version_attribute = Some(name.to_string());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn table_name(&self) -> &str {
        &self.table
    }

    pub fn attributes(&self) -> &[AttributeDescription] {
        &self.attributes
    }

    pub fn attribute_description(&self, name: &str) -> Option<&AttributeDescription> {
        self.attributes.iter().find(|attribute| attribute.name == name)
    }

    pub fn require_attribute(&self, name: &str) -> PersistenceResult<&AttributeDescription> {
        self.attribute_description(name)
            .ok_or_else(|| PersistenceError::UnknownField {
                type_name: self.name.clone(),
                field: name.to_string(),
            })
    }

    pub fn primary_keys(&self) -> Vec<&AttributeDescription> {
        self.attributes
            .iter()
            .filter(|attribute| attribute.is_primary_key)
            .collect()
    }

    pub fn references(&self) -> &[ReferenceDescription] {
        &self.references
    }

    pub fn reference_description(&self, name: &str) -> Option<&ReferenceDescription> {
        self.references.iter().find(|reference| reference.name == name)
    }

    pub fn relations(&self) -> &[RelationDescription] {
        &self.relations
    }

    /// Relation reaching other objects under `role`.
    pub fn relation(&self, role: &str) -> Option<&RelationDescription> {
        self.relations
            .iter()
            .find(|relation| relation.other_role == role)
    }

    pub fn require_relation(&self, role: &str) -> PersistenceResult<&RelationDescription> {
        self.relation(role).ok_or_else(|| PersistenceError::UnknownRole {
            type_name: self.name.clone(),
            role: role.to_string(),
        })
    }

    /// All relations whose other end is `type_name`.
    pub fn relations_to(&self, type_name: &str) -> Vec<&RelationDescription> {
        self.relations
            .iter()
            .filter(|relation| relation.other_type == type_name)
            .collect()
    }

    /// Finds the relation reaching `other_type`, by role when given.
    ///
    /// # Errors
    /// - `AmbiguousRelation` when several relations reach `other_type` and
    ///   no role disambiguates them.
    /// - `UnknownRole` when no relation matches.
    pub fn resolve_relation(
        &self,
        other_type: &str,
        role: Option<&str>,
    ) -> PersistenceResult<&RelationDescription> {
        if let Some(role) = role {
            let relation = self.require_relation(role)?;
            if relation.other_type != other_type {
                return Err(PersistenceError::InvalidQuery(format!(
                    "role `{role}` of `{}` reaches `{}`, not `{other_type}`",
                    self.name, relation.other_type
                )));
            }
            return Ok(relation);
        }

        let candidates = self.relations_to(other_type);
        match candidates.as_slice() {
            [relation] => Ok(*relation),
            [] => Err(PersistenceError::UnknownRole {
                type_name: self.name.clone(),
                role: other_type.to_string(),
            }),
            _ => Err(PersistenceError::AmbiguousRelation {
                type_name: self.name.clone(),
                qualifier: other_type.to_string(),
                roles: candidates
                    .iter()
                    .map(|relation| relation.other_role.clone())
                    .collect(),
            }),
        }
    }

    pub fn default_order(&self) -> &[OrderTerm] {
        &self.sortkey
    }

    pub fn version_attribute(&self) -> Option<&str> {
        self.version_attribute.as_deref()
    }

    fn single_primary_key(&self) -> PersistenceResult<&AttributeDescription> {
        let keys = self.primary_keys();
        match keys.as_slice() {
            [key] => Ok(*key),
            _ => Err(PersistenceError::InvalidSchema(format!(
                "type `{}` needs exactly one primary key to take part in a relation",
                self.name
            ))),
        }
    }
}

/// One-to-many association definition (parent 1 : n child).
#[derive(Debug, Clone)]
pub struct OneToManyDef {
    pub parent_type: String,
    pub parent_role: String,
    pub child_type: String,
    pub child_role: String,
    /// Attribute of the child type holding the parent id.
    pub fk_attribute: String,
    pub aggregation: AggregationKind,
    pub parent_multiplicity: Multiplicity,
    pub child_multiplicity: Multiplicity,
}

impl OneToManyDef {
    pub fn new(
        parent_type: &str,
        parent_role: &str,
        child_type: &str,
        child_role: &str,
        fk_attribute: &str,
    ) -> Self {
        Self {
            parent_type: parent_type.to_string(),
            parent_role: parent_role.to_string(),
            child_type: child_type.to_string(),
            child_role: child_role.to_string(),
            fk_attribute: fk_attribute.to_string(),
            aggregation: AggregationKind::None,
            parent_multiplicity: Multiplicity::ZERO_OR_ONE,
            child_multiplicity: Multiplicity::MANY,
        }
    }

    pub fn aggregation(mut self, aggregation: AggregationKind) -> Self {
        self.aggregation = aggregation;
        self
    }

    pub fn parent_required(mut self) -> Self {
        self.parent_multiplicity = Multiplicity::ONE;
        self
    }
}

/// Many-to-many association stored in a junction entity type.
#[derive(Debug, Clone)]
pub struct ManyToManyDef {
    pub left_type: String,
    pub left_role: String,
    pub right_type: String,
    pub right_role: String,
    pub junction_type: String,
    /// Junction attribute referencing the left type.
    pub left_fk: String,
    /// Junction attribute referencing the right type.
    pub right_fk: String,
}

impl ManyToManyDef {
    pub fn new(
        left_type: &str,
        left_role: &str,
        right_type: &str,
        right_role: &str,
        junction_type: &str,
        left_fk: &str,
        right_fk: &str,
    ) -> Self {
        Self {
            left_type: left_type.to_string(),
            left_role: left_role.to_string(),
            right_type: right_type.to_string(),
            right_role: right_role.to_string(),
            junction_type: junction_type.to_string(),
            left_fk: left_fk.to_string(),
            right_fk: right_fk.to_string(),
        }
    }
}

/// Immutable set of entity types.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Schema {
    types: BTreeMap<String, EntityType>,
}

impl Schema {
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::default()
    }

    pub fn entity(&self, type_name: &str) -> PersistenceResult<&EntityType> {
        self.types
            .get(type_name)
            .ok_or_else(|| PersistenceError::UnknownType(type_name.to_string()))
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.types.contains_key(type_name)
    }

    pub fn entities(&self) -> impl Iterator<Item = &EntityType> {
        self.types.values()
    }
}

#[derive(Debug, Default)]
pub struct SchemaBuilder {
    types: Vec<EntityType>,
    one_to_many: Vec<OneToManyDef>,
    many_to_many: Vec<ManyToManyDef>,
}

impl SchemaBuilder {
    pub fn entity(mut self, entity: EntityType) -> Self {
        self.types.push(entity);
        self
    }

    pub fn one_to_many(mut self, def: OneToManyDef) -> Self {
        self.one_to_many.push(def);
        self
    }

    pub fn many_to_many(mut self, def: ManyToManyDef) -> Self {
        self.many_to_many.push(def);
        self
    }

    /// Validates the definitions and derives both relation directions.
    pub fn build(self) -> PersistenceResult<Schema> {
        let mut types = BTreeMap::new();
        for entity in self.types {
            if entity.primary_keys().is_empty() {
                return Err(PersistenceError::InvalidSchema(format!(
                    "type `{}` has no primary key",
                    entity.name
                )));
            }
            let name = entity.name.clone();
            if types.insert(name.clone(), entity).is_some() {
                return Err(PersistenceError::InvalidSchema(format!(
                    "type `{name}` is declared twice"
                )));
            }
        }

        let mut derived = Vec::new();
        for def in &self.one_to_many {
            let parent = lookup(&types, &def.parent_type)?;
            let child = lookup(&types, &def.child_type)?;
            child.require_attribute(&def.fk_attribute)?;
            let relation = RelationDescription {
                this_type: def.parent_type.clone(),
                this_role: def.parent_role.clone(),
                other_type: def.child_type.clone(),
                other_role: def.child_role.clone(),
                this_multiplicity: def.parent_multiplicity,
                other_multiplicity: def.child_multiplicity,
                this_aggregation: def.aggregation,
                other_aggregation: AggregationKind::None,
                this_navigable: true,
                other_navigable: true,
                mapping: RelationMapping::OneToMany {
                    fk_attribute: def.fk_attribute.clone(),
                    id_attribute: parent.single_primary_key()?.name.clone(),
                },
            };
            derived.push(relation.inverse());
            derived.push(relation);
        }

        for def in &self.many_to_many {
            let left = lookup(&types, &def.left_type)?;
            let right = lookup(&types, &def.right_type)?;
            let junction = lookup(&types, &def.junction_type)?;
            junction.require_attribute(&def.left_fk)?;
            junction.require_attribute(&def.right_fk)?;

            let this_end = RelationDescription {
                this_type: def.left_type.clone(),
                this_role: def.left_role.clone(),
                other_type: def.junction_type.clone(),
                other_role: def.junction_type.clone(),
                this_multiplicity: Multiplicity::ONE,
                other_multiplicity: Multiplicity::MANY,
                this_aggregation: AggregationKind::None,
                other_aggregation: AggregationKind::None,
                this_navigable: true,
                other_navigable: true,
                mapping: RelationMapping::OneToMany {
                    fk_attribute: def.left_fk.clone(),
                    id_attribute: left.single_primary_key()?.name.clone(),
                },
            };
            let other_end = RelationDescription {
                this_type: def.junction_type.clone(),
                this_role: def.junction_type.clone(),
                other_type: def.right_type.clone(),
                other_role: def.right_role.clone(),
                this_multiplicity: Multiplicity::MANY,
                other_multiplicity: Multiplicity::ONE,
                this_aggregation: AggregationKind::None,
                other_aggregation: AggregationKind::None,
                this_navigable: true,
                other_navigable: true,
                mapping: RelationMapping::ManyToOne {
                    fk_attribute: def.right_fk.clone(),
                    id_attribute: right.single_primary_key()?.name.clone(),
                },
            };
            let relation = RelationDescription {
                this_type: def.left_type.clone(),
                this_role: def.left_role.clone(),
                other_type: def.right_type.clone(),
                other_role: def.right_role.clone(),
                this_multiplicity: Multiplicity::MANY,
                other_multiplicity: Multiplicity::MANY,
                this_aggregation: AggregationKind::None,
                other_aggregation: AggregationKind::None,
                this_navigable: true,
                other_navigable: true,
                mapping: RelationMapping::ManyToMany {
                    junction_type: def.junction_type.clone(),
                    this_end: Box::new(this_end),
                    other_end: Box::new(other_end),
                },
            };
            derived.push(relation.inverse());
            derived.push(relation);
        }

        for relation in derived {
            let Some(owner) = types.get_mut(&relation.this_type) else {
                return Err(PersistenceError::UnknownType(relation.this_type));
            };
            if owner.relation(&relation.other_role).is_some() {
                return Err(PersistenceError::InvalidSchema(format!(
                    "type `{}` declares role `{}` twice",
                    owner.name, relation.other_role
                )));
            }
            owner.relations.push(relation);
        }

        for entity in types.values() {
            validate_entity(entity, &types)?;
        }

        Ok(Schema { types })
    }
}

fn lookup<'a>(
    types: &'a BTreeMap<String, EntityType>,
    type_name: &str,
) -> PersistenceResult<&'a EntityType> {
    types
        .get(type_name)
        .ok_or_else(|| PersistenceError::UnknownType(type_name.to_string()))
}

fn validate_entity(
    entity: &EntityType,
    types: &BTreeMap<String, EntityType>,
) -> PersistenceResult<()> {
    let mut names = BTreeSet::new();
    let mut columns = BTreeSet::new();
    for attribute in &entity.attributes {
        if !names.insert(attribute.name.as_str()) {
            return Err(PersistenceError::InvalidSchema(format!(
                "type `{}` declares attribute `{}` twice",
                entity.name, attribute.name
            )));
        }
        if !columns.insert(attribute.column.as_str()) {
            return Err(PersistenceError::InvalidSchema(format!(
                "type `{}` maps column `{}` twice",
                entity.name, attribute.column
            )));
        }
    }

    for term in &entity.sortkey {
        if term.attribute.contains(char::is_whitespace) {
            return Err(PersistenceError::InvalidSchema(format!(
                "type `{}` has malformed sortkey `{}`",
                entity.name, term.attribute
            )));
        }
        entity.require_attribute(&term.attribute)?;
    }

    for reference in &entity.references {
        let relation = entity.require_relation(&reference.role)?;
        if relation.kind() != RelationKind::ManyToOne {
            return Err(PersistenceError::InvalidSchema(format!(
                "reference `{}` of `{}` must use a many-to-one role, `{}` is not",
                reference.name, entity.name, reference.role
            )));
        }
        lookup(types, &relation.other_type)?.require_attribute(&reference.attribute)?;
        if entity.attribute_description(&reference.name).is_some() {
            return Err(PersistenceError::InvalidSchema(format!(
                "reference `{}` of `{}` shadows an attribute",
                reference.name, entity.name
            )));
        }
    }

    if let Some(version) = &entity.version_attribute {
        entity.require_attribute(version)?;
    }
    Ok(())
}

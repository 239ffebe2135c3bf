//! Relation metadata between entity types.
//!
//! # Responsibility
//! - Describe one navigable direction of an association between two types.
//! - Carry the foreign key mapping the mapper needs to join and persist it.
//!
//! # Invariants
//! - A description and its `inverse()` agree on the type pair and swap
//!   roles, multiplicities, aggregation kinds and navigability.
//! - `ManyToMany` is the composition of `this -> junction` (one-to-many) and
//!   `junction -> other` (many-to-one).
//! - Mapping fields name entity attributes, not raw columns.

use serde::{Deserialize, Serialize};

/// UML aggregation kind of one relation end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationKind {
    #[default]
    None,
    Shared,
    Composite,
}

/// Cardinality of a relation end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Multiplicity {
    pub min: u32,
    /// `None` means unbounded.
    pub max: Option<u32>,
}

impl Multiplicity {
    pub const ONE: Self = Self {
        min: 1,
        max: Some(1),
    };
    pub const ZERO_OR_ONE: Self = Self {
        min: 0,
        max: Some(1),
    };
    pub const MANY: Self = Self { min: 0, max: None };

    pub fn is_many(&self) -> bool {
        self.max.map_or(true, |max| max > 1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationKind {
    OneToMany,
    ManyToOne,
    ManyToMany,
}

/// Storage mapping of a relation direction.
#[derive(Debug, Clone, PartialEq)]
pub enum RelationMapping {
    /// Foreign key `fk_attribute` lives on this type and references
    /// `id_attribute` of the other type.
    ManyToOne {
        fk_attribute: String,
        id_attribute: String,
    },
    /// Foreign key `fk_attribute` lives on the other type and references
    /// `id_attribute` of this type.
    OneToMany {
        fk_attribute: String,
        id_attribute: String,
    },
    ManyToMany {
        junction_type: String,
        this_end: Box<RelationDescription>,
        other_end: Box<RelationDescription>,
    },
}

/// One direction of an association, seen from `this_type`.
///
/// Objects of `other_type` are reached from `this_type` under `other_role`;
/// the reverse direction reaches `this_type` under `this_role`.
#[derive(Debug, Clone, PartialEq)]
pub struct RelationDescription {
    pub this_type: String,
    pub this_role: String,
    pub other_type: String,
    pub other_role: String,
    pub this_multiplicity: Multiplicity,
    pub other_multiplicity: Multiplicity,
    pub this_aggregation: AggregationKind,
    pub other_aggregation: AggregationKind,
    pub this_navigable: bool,
    pub other_navigable: bool,
    pub mapping: RelationMapping,
}

impl RelationDescription {
    pub fn kind(&self) -> RelationKind {
        match self.mapping {
            RelationMapping::ManyToOne { .. } => RelationKind::ManyToOne,
            RelationMapping::OneToMany { .. } => RelationKind::OneToMany,
            RelationMapping::ManyToMany { .. } => RelationKind::ManyToMany,
        }
    }

    /// True when this type stores the foreign key.
    pub fn this_role_is_fk(&self) -> bool {
        matches!(self.mapping, RelationMapping::ManyToOne { .. })
    }

    pub fn fk_column_on_this(&self) -> Option<&str> {
        match &self.mapping {
            RelationMapping::ManyToOne { fk_attribute, .. } => Some(fk_attribute),
            _ => None,
        }
    }

    /// Returns the same association seen from the other end.
    pub fn inverse(&self) -> Self {
        let mapping = match &self.mapping {
            RelationMapping::ManyToOne {
                fk_attribute,
                id_attribute,
            } => RelationMapping::OneToMany {
                fk_attribute: fk_attribute.clone(),
                id_attribute: id_attribute.clone(),
            },
            RelationMapping::OneToMany {
                fk_attribute,
                id_attribute,
            } => RelationMapping::ManyToOne {
                fk_attribute: fk_attribute.clone(),
                id_attribute: id_attribute.clone(),
            },
            RelationMapping::ManyToMany {
                junction_type,
                this_end,
                other_end,
            } => RelationMapping::ManyToMany {
                junction_type: junction_type.clone(),
                this_end: Box::new(other_end.inverse()),
                other_end: Box::new(this_end.inverse()),
            },
        };

        Self {
            this_type: self.other_type.clone(),
            this_role: self.other_role.clone(),
            other_type: self.this_type.clone(),
            other_role: self.this_role.clone(),
            this_multiplicity: self.other_multiplicity,
            other_multiplicity: self.this_multiplicity,
            this_aggregation: self.other_aggregation,
            other_aggregation: self.this_aggregation,
            this_navigable: self.other_navigable,
            other_navigable: self.this_navigable,
            mapping,
        }
    }

    /// True when `other` describes the same association, from either end.
    pub fn is_same_relation(&self, other: &Self) -> bool {
        let direct = self.this_type == other.this_type
            && self.this_role == other.this_role
            && self.other_type == other.other_type
            && self.other_role == other.other_role
            && self.this_multiplicity == other.this_multiplicity
            && self.other_multiplicity == other.other_multiplicity;
        let inverse = self.this_type == other.other_type
            && self.this_role == other.other_role
            && self.other_type == other.this_type
            && self.other_role == other.this_role
            && self.this_multiplicity == other.other_multiplicity
            && self.other_multiplicity == other.this_multiplicity;
        direct || inverse
    }
}

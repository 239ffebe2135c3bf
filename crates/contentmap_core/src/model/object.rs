//! Generic persistent object.
//!
//! # Responsibility
//! - Hold attribute values, display references and related object ids of one
//!   entity instance.
//! - Track the persistence state the unit of work acts on at commit.
//!
//! # Invariants
//! - The attribute set is fixed at construction; unknown names are rejected.
//! - Primary key values always mirror `oid`.
//! - Setters flip `Clean` to `Dirty` only when a value actually changes.
//! - Setting a foreign key attribute repoints its many-to-one relation.

use crate::error::{PersistenceError, PersistenceResult};
use crate::model::oid::{KeyValue, ObjectId};
use crate::model::schema::EntityType;
use crate::model::value::Value;
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectState {
    Clean,
    Dirty,
    New,
    Deleted,
}

impl ObjectState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Clean => "clean",
            Self::Dirty => "dirty",
            Self::New => "new",
            Self::Deleted => "deleted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PersistentObject {
    oid: ObjectId,
    state: ObjectState,
    primary_keys: Vec<String>,
    values: BTreeMap<String, Value>,
    #[serde(skip)]
    original_values: BTreeMap<String, Value>,
    reference_values: BTreeMap<String, Value>,
    relations: BTreeMap<String, Vec<ObjectId>>,
    #[serde(skip)]
    foreign_keys: BTreeMap<String, ForeignKey>,
}

/// Many-to-one role stored in a foreign key attribute.
#[derive(Debug, Clone, PartialEq)]
struct ForeignKey {
    role: String,
    target_type: String,
}

fn foreign_keys_of(entity: &EntityType) -> BTreeMap<String, ForeignKey> {
    entity
        .relations()
        .iter()
        .filter_map(|relation| {
            relation.fk_column_on_this().map(|fk_attribute| {
                (
                    fk_attribute.to_string(),
                    ForeignKey {
                        role: relation.other_role.clone(),
                        target_type: relation.other_type.clone(),
                    },
                )
            })
        })
        .collect()
}

impl PersistentObject {
    /// Creates a `New` object of `entity` with a dummy id.
    pub fn new(entity: &EntityType) -> Self {
        let primary_keys: Vec<String> = entity
            .primary_keys()
            .iter()
            .map(|attribute| attribute.name.clone())
            .collect();
        let oid = ObjectId::dummy(entity.name(), primary_keys.len());
        let values = entity
            .attributes()
            .iter()
            .map(|attribute| (attribute.name.clone(), Value::Null))
            .collect();

        let mut object = Self {
            oid,
            state: ObjectState::New,
            primary_keys,
            values,
            original_values: BTreeMap::new(),
            reference_values: BTreeMap::new(),
            relations: BTreeMap::new(),
            foreign_keys: foreign_keys_of(entity),
        };
        object.sync_primary_keys();
        object
    }

    /// Creates a `New` object with a caller-provided id.
    pub fn with_oid(entity: &EntityType, oid: ObjectId) -> PersistenceResult<Self> {
        if oid.type_name() != entity.name() {
            return Err(PersistenceError::InvalidObjectId(format!(
                "`{oid}` does not identify a `{}`",
                entity.name()
            )));
        }
        let mut object = Self::new(entity);
        if oid.ids().len() != object.primary_keys.len() {
            return Err(PersistenceError::InvalidObjectId(format!(
                "`{oid}` needs {} key values",
                object.primary_keys.len()
            )));
        }
        object.oid = oid;
        object.sync_primary_keys();
        Ok(object)
    }

    /// Builds a `Clean` object from persisted values.
    pub(crate) fn hydrated(
        entity: &EntityType,
        mut values: BTreeMap<String, Value>,
        reference_values: BTreeMap<String, Value>,
    ) -> PersistenceResult<Self> {
        let mut ids = Vec::new();
        for key in entity.primary_keys() {
            let value = values.get(&key.name).unwrap_or(&Value::Null);
            let id = KeyValue::from_value(value).ok_or_else(|| {
                PersistenceError::InvalidData(format!(
                    "`{}` row has no usable `{}` key",
                    entity.name(),
                    key.name
                ))
            })?;
            ids.push(id);
        }
        let oid = ObjectId::new(entity.name(), ids)?;
        for attribute in entity.attributes() {
            values.entry(attribute.name.clone()).or_insert(Value::Null);
        }

        Ok(Self {
            oid,
            state: ObjectState::Clean,
            primary_keys: entity
                .primary_keys()
                .iter()
                .map(|attribute| attribute.name.clone())
                .collect(),
            original_values: values.clone(),
            values,
            reference_values,
            relations: BTreeMap::new(),
            foreign_keys: foreign_keys_of(entity),
        })
    }

    pub fn oid(&self) -> &ObjectId {
        &self.oid
    }

    pub fn type_name(&self) -> &str {
        self.oid.type_name()
    }

    pub fn state(&self) -> ObjectState {
        self.state
    }

    pub fn value(&self, attribute: &str) -> PersistenceResult<&Value> {
        self.values
            .get(attribute)
            .ok_or_else(|| self.unknown_field(attribute))
    }

    pub fn get_i64(&self, attribute: &str) -> PersistenceResult<Option<i64>> {
        Ok(self.value(attribute)?.as_i64())
    }

    pub fn get_f64(&self, attribute: &str) -> PersistenceResult<Option<f64>> {
        Ok(self.value(attribute)?.as_f64())
    }

    pub fn get_str(&self, attribute: &str) -> PersistenceResult<Option<&str>> {
        Ok(self.value(attribute)?.as_str())
    }

    pub fn values(&self) -> &BTreeMap<String, Value> {
        &self.values
    }

    /// Values as last loaded from or written to storage.
    pub fn original_values(&self) -> &BTreeMap<String, Value> {
        &self.original_values
    }

    /// Display value of a reference attribute, `None` if unknown.
    pub fn reference_value(&self, name: &str) -> Option<&Value> {
        self.reference_values.get(name)
    }

    /// Ids of objects related under `role`, empty when not loaded.
    pub fn related(&self, role: &str) -> &[ObjectId] {
        self.relations.get(role).map_or(&[], Vec::as_slice)
    }

    /// Sets a non-key attribute.
    ///
    /// # Errors
    /// - `UnknownField` when the type does not declare `attribute`.
    /// - `InvalidData` for primary key attributes or deleted objects.
    /// - `InvalidObjectId` when a foreign key value cannot identify an object.
    pub fn set_value(&mut self, attribute: &str, value: impl Into<Value>) -> PersistenceResult<()> {
        if self.state == ObjectState::Deleted {
            return Err(PersistenceError::InvalidData(format!(
                "`{}` is deleted",
                self.oid
            )));
        }
        if self.primary_keys.iter().any(|key| key == attribute) {
            return Err(PersistenceError::InvalidData(format!(
                "primary key `{attribute}` of `{}` is immutable",
                self.oid
            )));
        }
        let value = value.into();
        let target = match self.foreign_keys.get(attribute) {
            Some(fk) => {
                let related = match KeyValue::from_value(&value) {
                    Some(key) => vec![ObjectId::new(fk.target_type.as_str(), vec![key])?],
                    None => Vec::new(),
                };
                Some((fk.role.clone(), related))
            }
            None => None,
        };
        let slot = self
            .values
            .get_mut(attribute)
            .ok_or_else(|| PersistenceError::UnknownField {
                type_name: self.oid.type_name().to_string(),
                field: attribute.to_string(),
            })?;
        if *slot != value {
            *slot = value;
            if let Some((role, related)) = target {
                self.relations.insert(role, related);
            }
            self.mark_dirty();
        }
        Ok(())
    }

    /// Replaces a value without touching the state, for localized copies.
    pub fn translate_value(
        &mut self,
        attribute: &str,
        value: impl Into<Value>,
    ) -> PersistenceResult<()> {
        let slot = self
            .values
            .get_mut(attribute)
            .ok_or_else(|| PersistenceError::UnknownField {
                type_name: self.oid.type_name().to_string(),
                field: attribute.to_string(),
            })?;
        *slot = value.into();
        Ok(())
    }

    pub(crate) fn mark_dirty(&mut self) {
        if self.state == ObjectState::Clean {
            self.state = ObjectState::Dirty;
        }
    }

    pub(crate) fn mark_deleted(&mut self) {
        self.state = ObjectState::Deleted;
    }

    /// Resets to `Clean` and takes the current values as persisted state.
    pub(crate) fn mark_persisted(&mut self) {
        self.state = ObjectState::Clean;
        self.original_values = self.values.clone();
    }

    pub(crate) fn set_value_unchecked(&mut self, attribute: &str, value: Value) {
        if let Some(slot) = self.values.get_mut(attribute) {
            *slot = value;
        }
    }

    pub(crate) fn set_related(&mut self, role: &str, oids: Vec<ObjectId>) {
        self.relations.insert(role.to_string(), oids);
    }

    /// Appends `oid` under `role` unless already present.
    pub(crate) fn add_related(&mut self, role: &str, oid: ObjectId) {
        let related = self.relations.entry(role.to_string()).or_default();
        if !related.contains(&oid) {
            related.push(oid);
        }
    }

    pub(crate) fn remove_related(&mut self, role: &str, oid: &ObjectId) {
        if let Some(related) = self.relations.get_mut(role) {
            related.retain(|candidate| candidate != oid);
        }
    }

    pub(crate) fn has_relation_role(&self, role: &str) -> bool {
        self.relations.contains_key(role)
    }

    pub(crate) fn replace_oid(&mut self, oid: ObjectId) {
        self.oid = oid;
        self.sync_primary_keys();
    }

    /// Rewrites every related id equal to `from` into `to`.
    pub(crate) fn replace_oid_refs(&mut self, from: &ObjectId, to: &ObjectId) {
        for related in self.relations.values_mut() {
            for candidate in related.iter_mut() {
                if candidate == from {
                    *candidate = to.clone();
                }
            }
        }
    }

    pub(crate) fn remove_oid_refs(&mut self, oid: &ObjectId) {
        for related in self.relations.values_mut() {
            related.retain(|candidate| candidate != oid);
        }
    }

    fn sync_primary_keys(&mut self) {
        for (name, id) in self.primary_keys.iter().zip(self.oid.ids()) {
            self.values.insert(name.clone(), id.to_value());
        }
    }

    fn unknown_field(&self, attribute: &str) -> PersistenceError {
        PersistenceError::UnknownField {
            type_name: self.oid.type_name().to_string(),
            field: attribute.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ObjectState, PersistentObject};
    use crate::error::PersistenceError;
    use crate::model::oid::ObjectId;
    use crate::model::schema::{DataType, EntityType, OneToManyDef, Schema};
    use crate::model::value::Value;

    fn article_type() -> EntityType {
        EntityType::new("Article")
            .primary_key("id", DataType::Integer)
            .attribute("title", DataType::Text)
    }

    #[test]
    fn new_object_has_dummy_id_mirrored_in_key_value() {
        let object = PersistentObject::new(&article_type());
        assert!(object.oid().is_dummy());
        assert_eq!(object.state(), ObjectState::New);
        assert_eq!(
            object.value("id").unwrap(),
            &object.oid().first_id().to_value()
        );
    }

    #[test]
    fn unknown_attribute_is_rejected() {
        let mut object = PersistentObject::new(&article_type());
        let result = object.set_value("body", "x");
        assert!(matches!(result, Err(PersistenceError::UnknownField { .. })));
        assert!(matches!(
            object.value("body"),
            Err(PersistenceError::UnknownField { .. })
        ));
    }

    #[test]
    fn setter_flips_clean_to_dirty_only_on_change() {
        let entity = article_type();
        let values = [
            ("id".to_string(), Value::Integer(3)),
            ("title".to_string(), Value::from("a")),
        ]
        .into_iter()
        .collect();
        let mut object = PersistentObject::hydrated(&entity, values, Default::default()).unwrap();
        assert_eq!(object.oid(), &ObjectId::from_int("Article", 3).unwrap());

        object.set_value("title", "a").unwrap();
        assert_eq!(object.state(), ObjectState::Clean);
        object.set_value("title", "b").unwrap();
        assert_eq!(object.state(), ObjectState::Dirty);
        assert_eq!(object.original_values()["title"], Value::from("a"));
    }

    #[test]
    fn foreign_key_setter_repoints_the_relation() {
        let schema = Schema::builder()
            .entity(article_type())
            .entity(
                EntityType::new("Comment")
                    .primary_key("id", DataType::Integer)
                    .attribute("fk_article_id", DataType::Integer),
            )
            .one_to_many(OneToManyDef::new(
                "Article",
                "Article",
                "Comment",
                "Comment",
                "fk_article_id",
            ))
            .build()
            .unwrap();
        let mut comment = PersistentObject::new(schema.entity("Comment").unwrap());

        comment.set_value("fk_article_id", 7_i64).unwrap();
        assert_eq!(
            comment.related("Article"),
            [ObjectId::from_int("Article", 7).unwrap()]
        );

        comment.set_value("fk_article_id", Value::Null).unwrap();
        assert!(comment.related("Article").is_empty());
        assert!(comment.has_relation_role("Article"));
    }

    #[test]
    fn primary_key_is_immutable() {
        let mut object = PersistentObject::new(&article_type());
        assert!(matches!(
            object.set_value("id", 9),
            Err(PersistenceError::InvalidData(_))
        ));
    }
}

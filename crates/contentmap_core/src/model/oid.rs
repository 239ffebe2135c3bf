//! Object identity.
//!
//! # Responsibility
//! - Identify persistent objects by type name plus ordered primary key values.
//! - Provide the canonical `Type:id1:id2` string form.
//!
//! # Invariants
//! - `ObjectId::parse(&oid.to_string()) == Ok(oid)` for every constructed id.
//! - Key values are never empty and never contain `:`.
//! - A text key that is a canonical integer is stored as `KeyValue::Int`.
//! - Dummy ids carry `dummy<uuid>` text keys until first persistence.

use crate::error::{PersistenceError, PersistenceResult};
use crate::model::value::Value;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use uuid::Uuid;

const ID_SEPARATOR: char = ':';
const DUMMY_PREFIX: &str = "dummy";

/// One primary key component.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyValue {
    Int(i64),
    Text(String),
}

impl KeyValue {
    /// Parses a raw key component, normalizing canonical integers.
    pub fn parse(raw: &str) -> PersistenceResult<Self> {
        if raw.is_empty() {
            return Err(PersistenceError::InvalidObjectId(
                "key value cannot be empty".to_string(),
            ));
        }
        if raw.contains(ID_SEPARATOR) {
            return Err(PersistenceError::InvalidObjectId(format!(
                "key value `{raw}` contains `{ID_SEPARATOR}`"
            )));
        }
        if let Ok(number) = raw.parse::<i64>() {
            if number.to_string() == raw {
                return Ok(Self::Int(number));
            }
        }
        Ok(Self::Text(raw.to_string()))
    }

    /// Converts a column value into a key component. `Null` has no key.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::Integer(number) => Some(Self::Int(*number)),
            Value::Real(number) if number.fract() == 0.0 => Some(Self::Int(*number as i64)),
            Value::Real(number) => Self::parse(&number.to_string()).ok(),
            Value::Text(text) => Self::parse(text).ok(),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Self::Int(number) => Value::Integer(*number),
            Self::Text(text) => Value::Text(text.clone()),
        }
    }

    pub fn is_dummy(&self) -> bool {
        match self {
            Self::Int(_) => false,
            Self::Text(text) => text
                .strip_prefix(DUMMY_PREFIX)
                .is_some_and(|rest| Uuid::try_parse(rest).is_ok()),
        }
    }

    fn dummy() -> Self {
        Self::Text(format!("{DUMMY_PREFIX}{}", Uuid::new_v4().simple()))
    }
}

impl Display for KeyValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Int(number) => write!(f, "{number}"),
            Self::Text(text) => write!(f, "{text}"),
        }
    }
}

/// Identity of a persistent object: type name plus ordered key values.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ObjectId {
    type_name: String,
    ids: Vec<KeyValue>,
}

impl ObjectId {
    /// Creates an id after validating the type name and every key value.
    pub fn new(type_name: impl Into<String>, ids: Vec<KeyValue>) -> PersistenceResult<Self> {
        let type_name = type_name.into();
        validate_type_name(&type_name)?;
        if ids.is_empty() {
            return Err(PersistenceError::InvalidObjectId(format!(
                "object id of `{type_name}` needs at least one key value"
            )));
        }
        let ids = ids
            .into_iter()
            .map(|id| match id {
                KeyValue::Int(_) => Ok(id),
                KeyValue::Text(text) => KeyValue::parse(&text),
            })
            .collect::<PersistenceResult<Vec<_>>>()?;
        Ok(Self { type_name, ids })
    }

    /// Shortcut for the common single integer key.
    pub fn from_int(type_name: impl Into<String>, id: i64) -> PersistenceResult<Self> {
        Self::new(type_name, vec![KeyValue::Int(id)])
    }

    /// Parses `Type:id1:id2`.
    pub fn parse(raw: &str) -> PersistenceResult<Self> {
        let mut parts = raw.split(ID_SEPARATOR);
        let type_name = parts.next().unwrap_or_default();
        let ids = parts.map(KeyValue::parse).collect::<PersistenceResult<Vec<_>>>()?;
        Self::new(type_name, ids).map_err(|err| match err {
            PersistenceError::InvalidObjectId(message) => {
                PersistenceError::InvalidObjectId(format!("`{raw}`: {message}"))
            }
            other => other,
        })
    }

    /// Creates a placeholder id with `key_count` dummy key values.
    pub fn dummy(type_name: impl Into<String>, key_count: usize) -> Self {
        Self {
            type_name: type_name.into(),
            ids: (0..key_count.max(1)).map(|_| KeyValue::dummy()).collect(),
        }
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn ids(&self) -> &[KeyValue] {
        &self.ids
    }

    /// Returns the first key value, the whole key for single-key types.
    pub fn first_id(&self) -> &KeyValue {
        &self.ids[0]
    }

    pub fn is_dummy(&self) -> bool {
        self.ids.iter().any(KeyValue::is_dummy)
    }
}

fn validate_type_name(type_name: &str) -> PersistenceResult<()> {
    if type_name.trim().is_empty() {
        return Err(PersistenceError::InvalidObjectId(
            "type name cannot be empty".to_string(),
        ));
    }
    if type_name.contains(ID_SEPARATOR) || type_name.chars().any(char::is_whitespace) {
        return Err(PersistenceError::InvalidObjectId(format!(
            "type name `{type_name}` contains invalid characters"
        )));
    }
    Ok(())
}

impl Display for ObjectId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.type_name)?;
        for id in &self.ids {
            write!(f, "{ID_SEPARATOR}{id}")?;
        }
        Ok(())
    }
}

impl FromStr for ObjectId {
    type Err = PersistenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ObjectId {
    type Error = PersistenceError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ObjectId> for String {
    fn from(value: ObjectId) -> Self {
        value.to_string()
    }
}

//! Attribute criteria.
//!
//! # Responsibility
//! - Express `Type.attribute OP value` predicates and how they chain.
//! - Render predicates against an already qualified column expression.
//!
//! # Invariants
//! - Values are always bound; `= NULL`/`!= NULL` render as `IS [NOT] NULL`.
//! - A criteria list combines flat, so AND binds tighter than OR.

use crate::error::{PersistenceError, PersistenceResult};
use crate::mapper::sql::in_clause;
use crate::model::value::Value;
use rusqlite::types::Value as SqlValue;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Like,
    In,
}

impl Operator {
    /// Parses SQL comparison tokens (`=`, `!=`, `<>`, `LIKE`, ...).
    pub fn from_sql(token: &str) -> PersistenceResult<Self> {
        match token.to_ascii_uppercase().as_str() {
            "=" => Ok(Self::Eq),
            "!=" | "<>" => Ok(Self::Ne),
            "<" => Ok(Self::Lt),
            "<=" => Ok(Self::Le),
            ">" => Ok(Self::Gt),
            ">=" => Ok(Self::Ge),
            "LIKE" => Ok(Self::Like),
            "IN" => Ok(Self::In),
            other => Err(PersistenceError::InvalidQuery(format!(
                "unsupported operator `{other}`"
            ))),
        }
    }

    /// Parses RQL operator names (`eq`, `lte`, `match`, ...).
    pub fn from_rql(name: &str) -> PersistenceResult<Self> {
        match name.to_ascii_lowercase().as_str() {
            "eq" => Ok(Self::Eq),
            "ne" => Ok(Self::Ne),
            "lt" => Ok(Self::Lt),
            "le" | "lte" => Ok(Self::Le),
            "gt" => Ok(Self::Gt),
            "ge" | "gte" => Ok(Self::Ge),
            "like" | "match" => Ok(Self::Like),
            "in" => Ok(Self::In),
            other => Err(PersistenceError::InvalidQuery(format!(
                "unsupported rql operator `{other}`"
            ))),
        }
    }

    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Like => "LIKE",
            Self::In => "IN",
        }
    }
}

/// Boolean operator joining a predicate to its predecessor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Combine {
    #[default]
    And,
    Or,
}

impl Combine {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::And => "AND",
            Self::Or => "OR",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CriteriaValue {
    Single(Value),
    List(Vec<Value>),
}

impl From<Value> for CriteriaValue {
    fn from(value: Value) -> Self {
        Self::Single(value)
    }
}

impl From<Vec<Value>> for CriteriaValue {
    fn from(values: Vec<Value>) -> Self {
        Self::List(values)
    }
}

impl From<i64> for CriteriaValue {
    fn from(value: i64) -> Self {
        Self::Single(Value::Integer(value))
    }
}

impl From<f64> for CriteriaValue {
    fn from(value: f64) -> Self {
        Self::Single(Value::Real(value))
    }
}

impl From<&str> for CriteriaValue {
    fn from(value: &str) -> Self {
        Self::Single(Value::from(value))
    }
}

impl From<String> for CriteriaValue {
    fn from(value: String) -> Self {
        Self::Single(Value::Text(value))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Criteria {
    pub type_name: String,
    pub attribute: String,
    pub operator: Operator,
    pub value: CriteriaValue,
    pub combine: Combine,
}

impl Criteria {
    pub fn new(
        type_name: &str,
        attribute: &str,
        operator: Operator,
        value: impl Into<Value>,
    ) -> Self {
        Self {
            type_name: type_name.to_string(),
            attribute: attribute.to_string(),
            operator,
            value: CriteriaValue::Single(value.into()),
            combine: Combine::And,
        }
    }

    /// Shortcut for `attribute = value`.
    pub fn as_value(type_name: &str, attribute: &str, value: impl Into<Value>) -> Self {
        Self::new(type_name, attribute, Operator::Eq, value)
    }

    pub fn in_list(type_name: &str, attribute: &str, values: Vec<Value>) -> Self {
        Self {
            type_name: type_name.to_string(),
            attribute: attribute.to_string(),
            operator: Operator::In,
            value: CriteriaValue::List(values),
            combine: Combine::And,
        }
    }

    /// Chains this criterion to its predecessor with OR.
    pub fn or(mut self) -> Self {
        self.combine = Combine::Or;
        self
    }

    /// Renders the predicate for `column_sql`.
    pub fn render(&self, column_sql: &str) -> PersistenceResult<(String, Vec<SqlValue>)> {
        match (&self.operator, &self.value) {
            (Operator::In, CriteriaValue::List(values)) => Ok((
                in_clause(column_sql, values.len()),
                values.iter().map(Value::to_sql_value).collect(),
            )),
            (Operator::In, CriteriaValue::Single(value)) => Ok((
                in_clause(column_sql, 1),
                vec![value.to_sql_value()],
            )),
            (Operator::Eq, CriteriaValue::Single(Value::Null)) => {
                Ok((format!("{column_sql} IS NULL"), Vec::new()))
            }
            (Operator::Ne, CriteriaValue::Single(Value::Null)) => {
                Ok((format!("{column_sql} IS NOT NULL"), Vec::new()))
            }
            (operator, CriteriaValue::Single(value)) => Ok((
                format!("{column_sql} {} ?", operator.as_sql()),
                vec![value.to_sql_value()],
            )),
            (operator, CriteriaValue::List(_)) => Err(PersistenceError::InvalidQuery(format!(
                "operator `{}` on `{}.{}` needs a single value",
                operator.as_sql(),
                self.type_name,
                self.attribute
            ))),
        }
    }
}

/// Joins rendered predicates flat, honoring each predicate's combine.
pub(crate) fn join_predicates(parts: Vec<(Combine, String)>) -> Option<String> {
    let mut sql = String::new();
    for (index, (combine, predicate)) in parts.into_iter().enumerate() {
        if index > 0 {
            sql.push(' ');
            sql.push_str(combine.as_sql());
            sql.push(' ');
        }
        sql.push_str(&predicate);
    }
    (!sql.is_empty()).then_some(sql)
}

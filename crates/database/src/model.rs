//! Entity contracts consumed by `DbRepository`.
//!
//! The repository is schema-agnostic: an entity names its table, lists its
//! columns and hands over one `Value` per column in the same order. Nothing
//! else about the table is ever inspected.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value as JsonValue;
use sqlx::{Postgres, QueryBuilder};
use uuid::Uuid;

/// A bindable column value.
///
/// Every variant is nullable so that a NULL still travels with its column
/// type; PostgreSQL rejects an untyped NULL for most target columns.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(Option<bool>),
    Int(Option<i64>),
    Float(Option<f64>),
    Text(Option<String>),
    Decimal(Option<Decimal>),
    Timestamp(Option<DateTime<Utc>>),
    Uuid(Option<Uuid>),
    Json(Option<JsonValue>),
}

impl Value {
    pub(crate) fn push_bind(self, builder: &mut QueryBuilder<'_, Postgres>) {
        match self {
            Value::Bool(v) => builder.push_bind(v),
            Value::Int(v) => builder.push_bind(v),
            Value::Float(v) => builder.push_bind(v),
            Value::Text(v) => builder.push_bind(v),
            Value::Decimal(v) => builder.push_bind(v),
            Value::Timestamp(v) => builder.push_bind(v),
            Value::Uuid(v) => builder.push_bind(v),
            Value::Json(v) => builder.push_bind(v),
        };
    }
}

macro_rules! impl_from_value {
    ($variant:ident, $ty:ty) => {
        impl From<$ty> for Value {
            fn from(v: $ty) -> Self {
                Value::$variant(Some(v.into()))
            }
        }

        impl From<Option<$ty>> for Value {
            fn from(v: Option<$ty>) -> Self {
                Value::$variant(v.map(Into::into))
            }
        }
    };
}

impl_from_value!(Bool, bool);
impl_from_value!(Int, i64);
impl_from_value!(Int, i32);
impl_from_value!(Float, f64);
impl_from_value!(Text, String);
impl_from_value!(Text, &str);
impl_from_value!(Decimal, Decimal);
impl_from_value!(Timestamp, DateTime<Utc>);
impl_from_value!(Uuid, Uuid);
impl_from_value!(Json, JsonValue);

/// A record type that can be written to the store.
pub trait Model: Send + Sync {
    /// The table the entity lives in.
    const TABLE: &'static str;

    /// Every column written on insert and update, in binding order.
    const COLUMNS: &'static [&'static str];

    /// One value per entry of `COLUMNS`, in the same order.
    fn values(&self) -> Vec<Value>;
}

/// A model whose target row(s) can be identified for update and delete.
pub trait UniqueModel: Model {
    fn unique_condition(&self) -> UniqueCondition;
}

/// A WHERE clause with `?` placeholders and the values bound to them in order,
/// e.g. `UniqueCondition::new("open_id = ?", vec!["o6_bmjrPTlm6_2sgVt7hMZOPfL2M".into()])`.
#[derive(Debug, Clone, PartialEq)]
pub struct UniqueCondition {
    pub clause: String,
    pub params: Vec<Value>,
}

impl UniqueCondition {
    pub fn new(clause: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            clause: clause.into(),
            params,
        }
    }

    pub(crate) fn placeholder_count(&self) -> usize {
        self.clause.matches('?').count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversions_keep_null_typed() {
        assert_eq!(Value::from(None::<i64>), Value::Int(None));
        assert_eq!(Value::from(Some("x")), Value::Text(Some("x".to_string())));
        assert_eq!(Value::from(7_i32), Value::Int(Some(7)));
    }

    #[test]
    fn counts_placeholders() {
        let cond =
            UniqueCondition::new("app_id = ? AND open_id = ?", vec![1_i64.into(), "o".into()]);
        assert_eq!(cond.placeholder_count(), 2);
    }
}

// ABOUTME: Typed value model shared by the parser, staging graph and stores
// ABOUTME: Defines member primitive types and the tagged Value enum

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a persisted object, assigned by the store.
pub type ObjectId = u64;

/// Primitive category of an attribute member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PrimitiveType {
    Boolean,
    Integer,
    Long,
    AutoNumber,
    Decimal,
    Float,
    DateTime,
    String,
    Enum,
    /// Write-only credential hash; the current value can never be read back.
    HashString,
    Binary,
}

impl PrimitiveType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrimitiveType::Boolean => "boolean",
            PrimitiveType::Integer => "integer",
            PrimitiveType::Long => "long",
            PrimitiveType::AutoNumber => "auto-number",
            PrimitiveType::Decimal => "decimal",
            PrimitiveType::Float => "float",
            PrimitiveType::DateTime => "date-time",
            PrimitiveType::String => "string",
            PrimitiveType::Enum => "enum",
            PrimitiveType::HashString => "hash-string",
            PrimitiveType::Binary => "binary",
        }
    }

    /// Numeric categories are rendered unquoted in lookup queries.
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            PrimitiveType::Integer
                | PrimitiveType::Long
                | PrimitiveType::AutoNumber
                | PrimitiveType::Decimal
                | PrimitiveType::Float
        )
    }
}

impl fmt::Display for PrimitiveType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed member value.
///
/// Association members hold `Reference` (single link) or `ReferenceSet`
/// (multi-valued link) values made of persisted object ids.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "kebab-case")]
pub enum Value {
    #[default]
    Null,
    Boolean(bool),
    Integer(i32),
    Long(i64),
    Decimal(Decimal),
    Float(f64),
    DateTime(DateTime<Utc>),
    String(String),
    Reference(Option<ObjectId>),
    ReferenceSet(Vec<ObjectId>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null | Value::Reference(None))
    }

    /// Null, the empty string and the literal text "null" all count as empty.
    pub fn is_empty(&self) -> bool {
        match self {
            Value::Null | Value::Reference(None) => true,
            Value::String(s) => s.is_empty() || s == "null",
            _ => false,
        }
    }

    /// Whether this value may be stored in a member of the given type.
    pub fn matches_type(&self, member_type: PrimitiveType) -> bool {
        match (self, member_type) {
            (Value::Null, _) => true,
            (Value::Boolean(_), PrimitiveType::Boolean) => true,
            (Value::Integer(_), PrimitiveType::Integer) => true,
            (Value::Long(_), PrimitiveType::Long | PrimitiveType::AutoNumber) => true,
            (Value::Decimal(_), PrimitiveType::Decimal) => true,
            (Value::Float(_), PrimitiveType::Float) => true,
            (Value::DateTime(_), PrimitiveType::DateTime) => true,
            (
                Value::String(_),
                PrimitiveType::String | PrimitiveType::Enum | PrimitiveType::HashString,
            ) => true,
            _ => false,
        }
    }

    pub fn as_reference(&self) -> Option<ObjectId> {
        match self {
            Value::Reference(id) => *id,
            _ => None,
        }
    }

    pub fn as_reference_set(&self) -> &[ObjectId] {
        match self {
            Value::ReferenceSet(ids) => ids,
            _ => &[],
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(v) => Some(i64::from(*v)),
            Value::Long(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Boolean(v) => write!(f, "{}", v),
            Value::Integer(v) => write!(f, "{}", v),
            Value::Long(v) => write!(f, "{}", v),
            Value::Decimal(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::DateTime(v) => write!(f, "{}", v.to_rfc3339()),
            Value::String(v) => f.write_str(v),
            Value::Reference(Some(id)) => write!(f, "#{}", id),
            Value::Reference(None) => f.write_str("null"),
            Value::ReferenceSet(ids) => {
                let ids: Vec<String> = ids.iter().map(|id| format!("#{}", id)).collect();
                write!(f, "[{}]", ids.join(", "))
            }
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Boolean(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Integer(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Long(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<Decimal> for Value {
    fn from(value: Decimal) -> Self {
        Value::Decimal(value)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(value: DateTime<Utc>) -> Self {
        Value::DateTime(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_values() {
        assert!(Value::Null.is_empty());
        assert!(Value::from("").is_empty());
        assert!(Value::from("null").is_empty());
        assert!(Value::Reference(None).is_empty());
        assert!(!Value::from(" ").is_empty());
        assert!(!Value::Integer(0).is_empty());
    }

    #[test]
    fn test_matches_type() {
        assert!(Value::Long(3).matches_type(PrimitiveType::AutoNumber));
        assert!(Value::from("x").matches_type(PrimitiveType::Enum));
        assert!(Value::Null.matches_type(PrimitiveType::Decimal));
        assert!(!Value::Integer(3).matches_type(PrimitiveType::Long));
        assert!(!Value::from("3").matches_type(PrimitiveType::Integer));
    }

    #[test]
    fn test_snapshot_representation() {
        let json = serde_json::to_string(&Value::Reference(Some(7))).unwrap();
        assert_eq!(json, r#"{"type":"reference","value":7}"#);
        let back: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Value::Reference(Some(7)));
    }
}

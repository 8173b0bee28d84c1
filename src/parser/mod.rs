// ABOUTME: ValueParser - coerces raw field values to typed member values
// ABOUTME: Supports per-field custom parsers and date formats

pub mod key;
pub mod numbers;

pub use key::{build_key, is_key_empty, key_segment, query_literal, KeyField, KEY_SEPARATOR};

use crate::error::{ReplicationError, Result};
use crate::value::{PrimitiveType, Value};
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use rust_decimal::prelude::*;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Default format for textual dates.
pub const DEFAULT_DATE_FORMAT: &str = "%Y-%m-%d";

/// Epoch values that represent "no date" in legacy exports.
const EMPTY_EPOCH_MILLIS: [i64; 2] = [0, -3_600_000];

/// A user supplied parser for one field alias, used instead of the built-in
/// coercion. Its result is still checked against the member's type.
pub trait FieldParser: Send + Sync {
    fn parse(&self, raw: &Value) -> anyhow::Result<Value>;
}

impl<F> FieldParser for F
where
    F: Fn(&Value) -> anyhow::Result<Value> + Send + Sync,
{
    fn parse(&self, raw: &Value) -> anyhow::Result<Value> {
        self(raw)
    }
}

/// Coerces raw values per alias, honoring custom parsers and date formats.
#[derive(Clone, Default)]
pub struct ValueParser {
    custom: HashMap<String, Arc<dyn FieldParser>>,
    date_formats: HashMap<String, String>,
}

impl fmt::Debug for ValueParser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut custom: Vec<&String> = self.custom.keys().collect();
        custom.sort();
        f.debug_struct("ValueParser")
            .field("custom", &custom)
            .field("date_formats", &self.date_formats)
            .finish()
    }
}

impl ValueParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_parser(&mut self, alias: &str, parser: Arc<dyn FieldParser>) {
        self.custom.insert(alias.to_string(), parser);
    }

    pub fn has_parser(&self, alias: &str) -> bool {
        self.custom.contains_key(alias)
    }

    /// Set the chrono format used to read textual dates for `alias`.
    pub fn set_date_format(&mut self, alias: &str, format: &str) {
        self.date_formats
            .insert(alias.to_string(), format.to_string());
    }

    pub fn date_format(&self, alias: &str) -> Option<&str> {
        self.date_formats.get(alias).map(String::as_str)
    }

    /// Coerce a raw value for `alias` into a value of `member_type`.
    pub fn parse(&self, alias: &str, member_type: PrimitiveType, raw: &Value) -> Result<Value> {
        if let Some(parser) = self.custom.get(alias) {
            let parsed = parser
                .parse(raw)
                .map_err(|e| ReplicationError::parse(alias, raw, format!("{:#}", e)))?;
            return validate_parsed_value(alias, member_type, parsed);
        }
        coerce(member_type, raw, self.date_format(alias))
            .map_err(|message| ReplicationError::parse(alias, raw, message))
    }
}

/// Check the output of a custom parser and normalize it to `member_type`.
///
/// Values of a compatible category are accepted (an integer for a decimal
/// member, epoch milliseconds for a date); anything else is a parse error.
pub fn validate_parsed_value(
    alias: &str,
    member_type: PrimitiveType,
    value: Value,
) -> Result<Value> {
    let compatible = match (&value, member_type) {
        (Value::Null, _) => true,
        (Value::Long(v), PrimitiveType::Integer) => i32::try_from(*v).is_ok(),
        (Value::Integer(_), PrimitiveType::Long | PrimitiveType::AutoNumber) => true,
        (
            Value::Integer(_) | Value::Long(_) | Value::Float(_),
            PrimitiveType::Decimal | PrimitiveType::Float,
        ) => true,
        (Value::Decimal(_), PrimitiveType::Float) => true,
        (Value::Long(_), PrimitiveType::DateTime) => true,
        (value, member_type) => value.matches_type(member_type),
    };
    if !compatible {
        return Err(ReplicationError::parse(
            alias,
            &value,
            format!("custom parser returned a value that is not a {}", member_type),
        ));
    }
    coerce(member_type, &value, None).map_err(|message| ReplicationError::parse(alias, &value, message))
}

/// Coerce `raw` to `member_type` using the built-in rules.
pub fn coerce(
    member_type: PrimitiveType,
    raw: &Value,
    date_format: Option<&str>,
) -> std::result::Result<Value, String> {
    match member_type {
        PrimitiveType::Boolean => Ok(Value::Boolean(to_boolean(raw))),
        PrimitiveType::Integer => match raw {
            Value::Null => Ok(Value::Null),
            Value::Integer(v) => Ok(Value::Integer(*v)),
            Value::Long(v) => i32::try_from(*v)
                .map(Value::Integer)
                .map_err(|_| format!("{} does not fit in an integer", v)),
            Value::Boolean(v) => Ok(Value::Integer(i32::from(*v))),
            other => match text_of(other) {
                None => Ok(Value::Null),
                Some(text) => numbers::parse_integer(&text).map(Value::Integer),
            },
        },
        PrimitiveType::Long | PrimitiveType::AutoNumber => match raw {
            Value::Null => Ok(Value::Null),
            Value::Integer(v) => Ok(Value::Long(i64::from(*v))),
            Value::Long(v) => Ok(Value::Long(*v)),
            Value::Boolean(v) => Ok(Value::Long(i64::from(*v))),
            other => match text_of(other) {
                None => Ok(Value::Null),
                Some(text) => numbers::parse_long(&text).map(Value::Long),
            },
        },
        PrimitiveType::Decimal => match raw {
            Value::Null => Ok(Value::Null),
            Value::Decimal(v) => Ok(Value::Decimal(*v)),
            Value::Integer(v) => Ok(Value::Decimal(Decimal::from(*v))),
            Value::Long(v) => Ok(Value::Decimal(Decimal::from(*v))),
            Value::Float(v) => Decimal::from_f64(*v)
                .map(Value::Decimal)
                .ok_or_else(|| format!("{} cannot be represented as a decimal", v)),
            other => match text_of(other) {
                None => Ok(Value::Null),
                Some(text) => numbers::parse_decimal(&text).map(Value::Decimal),
            },
        },
        PrimitiveType::Float => match raw {
            Value::Null => Ok(Value::Null),
            Value::Float(v) => Ok(Value::Float(*v)),
            Value::Integer(v) => Ok(Value::Float(f64::from(*v))),
            Value::Long(v) => Ok(Value::Float(*v as f64)),
            Value::Decimal(v) => v
                .to_f64()
                .map(Value::Float)
                .ok_or_else(|| format!("{} cannot be represented as a float", v)),
            other => match text_of(other) {
                None => Ok(Value::Null),
                Some(text) => numbers::parse_float(&text).map(Value::Float),
            },
        },
        PrimitiveType::DateTime => to_date_time(raw, date_format),
        PrimitiveType::String | PrimitiveType::Enum | PrimitiveType::HashString => match raw {
            Value::Null => Ok(Value::Null),
            Value::String(v) => Ok(Value::String(v.trim().to_string())),
            other => Ok(Value::String(key_segment(other))),
        },
        PrimitiveType::Binary => Err("binary members cannot be imported".to_string()),
    }
}

/// Non-empty trimmed text of a value, `None` for empty input.
fn text_of(raw: &Value) -> Option<String> {
    if raw.is_empty() {
        return None;
    }
    let text = match raw {
        Value::String(v) => v.trim().to_string(),
        other => other.to_string(),
    };
    (!text.is_empty()).then_some(text)
}

fn to_boolean(raw: &Value) -> bool {
    match raw {
        Value::Boolean(v) => *v,
        Value::Integer(v) => *v != 0,
        Value::Long(v) => *v != 0,
        Value::Float(v) => *v != 0.0,
        Value::Decimal(v) => !v.is_zero(),
        Value::String(v) => matches!(
            v.trim().to_lowercase().as_str(),
            "true" | "1" | "yes" | "ja"
        ),
        _ => false,
    }
}

fn to_date_time(raw: &Value, date_format: Option<&str>) -> std::result::Result<Value, String> {
    match raw {
        Value::Null => Ok(Value::Null),
        Value::DateTime(v) => Ok(Value::DateTime(*v)),
        Value::Integer(v) => from_epoch_millis(i64::from(*v)),
        Value::Long(v) => from_epoch_millis(*v),
        other => match text_of(other) {
            None => Ok(Value::Null),
            Some(text) => parse_date_text(&text, date_format.unwrap_or(DEFAULT_DATE_FORMAT))
                .map(Value::DateTime),
        },
    }
}

fn from_epoch_millis(millis: i64) -> std::result::Result<Value, String> {
    if EMPTY_EPOCH_MILLIS.contains(&millis) {
        return Ok(Value::Null);
    }
    Utc.timestamp_millis_opt(millis)
        .single()
        .map(Value::DateTime)
        .ok_or_else(|| format!("{} is not a valid timestamp", millis))
}

fn parse_date_text(text: &str, format: &str) -> std::result::Result<DateTime<Utc>, String> {
    if let Ok(value) = NaiveDateTime::parse_from_str(text, format) {
        return Ok(Utc.from_utc_datetime(&value));
    }
    if let Ok(date) = NaiveDate::parse_from_str(text, format) {
        if let Some(value) = date.and_hms_opt(0, 0, 0) {
            return Ok(Utc.from_utc_datetime(&value));
        }
    }
    DateTime::parse_from_rfc3339(text)
        .map(|value| value.with_timezone(&Utc))
        .map_err(|_| format!("'{}' does not match date format '{}'", text, format))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Datelike;

    #[test]
    fn test_boolean_words() {
        for word in ["TRUE", "1", "yes", "Ja"] {
            assert_eq!(coerce(PrimitiveType::Boolean, &Value::from(word), None).unwrap(), Value::Boolean(true));
        }
        for word in ["false", "0", "no", "nee", "maybe"] {
            assert_eq!(coerce(PrimitiveType::Boolean, &Value::from(word), None).unwrap(), Value::Boolean(false));
        }
        assert_eq!(coerce(PrimitiveType::Boolean, &Value::Null, None).unwrap(), Value::Boolean(false));
    }

    #[test]
    fn test_numeric_coercion() {
        assert_eq!(coerce(PrimitiveType::Integer, &Value::from(" 12 "), None).unwrap(), Value::Integer(12));
        assert_eq!(coerce(PrimitiveType::Long, &Value::from("1.234.567"), None).unwrap(), Value::Long(1_234_567));
        assert_eq!(coerce(PrimitiveType::Float, &Value::from("12,5"), None).unwrap(), Value::Float(12.5));
        assert_eq!(coerce(PrimitiveType::Integer, &Value::from(""), None).unwrap(), Value::Null);
        assert!(coerce(PrimitiveType::Integer, &Value::from("twelve"), None).is_err());
    }

    #[test]
    fn test_date_coercion() {
        let parsed = coerce(PrimitiveType::DateTime, &Value::from("2024-02-29"), None).unwrap();
        match parsed {
            Value::DateTime(d) => assert_eq!((d.year(), d.month(), d.day()), (2024, 2, 29)),
            other => panic!("unexpected {:?}", other),
        }
        let masked = coerce(PrimitiveType::DateTime, &Value::from("29/02/2024"), Some("%d/%m/%Y")).unwrap();
        assert!(matches!(masked, Value::DateTime(_)));
        assert_eq!(coerce(PrimitiveType::DateTime, &Value::Long(0), None).unwrap(), Value::Null);
        assert_eq!(coerce(PrimitiveType::DateTime, &Value::Long(-3_600_000), None).unwrap(), Value::Null);
        assert!(coerce(PrimitiveType::DateTime, &Value::from("yesterday"), None).is_err());
    }

    #[test]
    fn test_strings_are_trimmed_and_binary_rejected() {
        assert_eq!(coerce(PrimitiveType::String, &Value::from("  a b "), None).unwrap(), Value::from("a b"));
        assert_eq!(coerce(PrimitiveType::Enum, &Value::Integer(3), None).unwrap(), Value::from("3"));
        assert!(coerce(PrimitiveType::Binary, &Value::from("x"), None).is_err());
    }

    #[test]
    fn test_custom_parser_result_is_validated() {
        let mut parser = ValueParser::new();
        parser.set_parser(
            "amount",
            Arc::new(|raw: &Value| -> anyhow::Result<Value> {
                Ok(Value::Long(raw.to_string().len() as i64))
            }),
        );
        parser.set_parser(
            "flag",
            Arc::new(|_: &Value| -> anyhow::Result<Value> { Ok(Value::from("not a bool")) }),
        );

        let amount = parser.parse("amount", PrimitiveType::Decimal, &Value::from("abcd")).unwrap();
        assert_eq!(amount, Value::Decimal(Decimal::from(4)));

        let err = parser.parse("flag", PrimitiveType::Boolean, &Value::from("x")).unwrap_err();
        assert!(matches!(err, ReplicationError::Parse { .. }));
    }

    #[test]
    fn test_parse_errors_name_the_alias() {
        let parser = ValueParser::new();
        let err = parser.parse("qty", PrimitiveType::Integer, &Value::from("n/a")).unwrap_err();
        assert!(err.to_string().contains("'qty'"));
    }

    #[test]
    fn test_long_overflow_is_a_recoverable_parse_error() {
        let parser = ValueParser::new();
        let err = parser
            .parse("total", PrimitiveType::Long, &Value::from("9223372036854775808"))
            .unwrap_err();
        assert!(matches!(err, ReplicationError::Parse { .. }));
        assert!(err.is_recoverable());
    }
}

// ABOUTME: Composite key construction and query literal rendering
// ABOUTME: Keys join normalized key-field values with a reserved separator

use crate::value::Value;
use std::collections::HashSet;

/// Separator appended after every key segment. It cannot occur in any legal
/// field value, so the segment count preserves positional meaning.
pub const KEY_SEPARATOR: &str = "|KEY|";

/// One key field as it contributes to a composite key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyField {
    /// Field alias, which determines the segment order
    pub alias: String,
    /// Member the alias is stored in. Aliases sharing a member contribute once.
    pub member: String,
    pub case_sensitive: bool,
}

/// Build the composite key for a set of key fields.
///
/// `fields` must be ordered by alias (the order `ObjectConfig` keeps them in).
/// `value_of` yields the current value for a field, already resolved through
/// any association the field is routed through.
///
/// # Returns
///
/// `None` only when every segment is empty and `ignore_empty_keys` is set,
/// meaning the record must not be staged.
pub fn build_key<F>(fields: &[KeyField], ignore_empty_keys: bool, mut value_of: F) -> Option<String>
where
    F: FnMut(&KeyField) -> Option<Value>,
{
    let mut key = String::new();
    let mut processed: HashSet<&str> = HashSet::new();
    let mut all_empty = true;

    for field in fields {
        if !processed.insert(field.member.as_str()) {
            continue;
        }
        let segment = value_of(field)
            .map(|value| key_segment(&value))
            .unwrap_or_default();
        let segment = if field.case_sensitive {
            segment
        } else {
            segment.to_lowercase()
        };
        if !segment.is_empty() {
            all_empty = false;
        }
        key.push_str(&segment);
        key.push_str(KEY_SEPARATOR);
    }

    if all_empty && ignore_empty_keys {
        None
    } else {
        Some(key)
    }
}

/// Whether a key is missing or consists of separators only.
pub fn is_key_empty(key: Option<&str>) -> bool {
    match key {
        None => true,
        Some(key) => key.replace(KEY_SEPARATOR, "").trim().is_empty(),
    }
}

/// Render a value the way it appears inside a composite key.
pub fn key_segment(value: &Value) -> String {
    match value {
        Value::Null | Value::Reference(None) => String::new(),
        Value::Boolean(v) => v.to_string(),
        Value::Integer(v) => v.to_string(),
        Value::Long(v) => v.to_string(),
        Value::Decimal(v) => with_fraction_digits(&v.round_dp(20).normalize().to_string()),
        Value::Float(v) => with_fraction_digits(&v.to_string()),
        Value::DateTime(v) => v.format("%Y-%m-%d").to_string(),
        Value::String(v) => v.trim().to_string(),
        Value::Reference(Some(id)) => id.to_string(),
        Value::ReferenceSet(ids) => ids
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(","),
    }
}

/// Pad or cut the fraction of a plain decimal rendering to 2..=20 digits.
fn with_fraction_digits(rendered: &str) -> String {
    let (integral, fraction) = rendered.split_once('.').unwrap_or((rendered, ""));
    let mut fraction: String = fraction.chars().take(20).collect();
    while fraction.len() < 2 {
        fraction.push('0');
    }
    format!("{}.{}", integral, fraction)
}

/// Render a value as a literal in a textual lookup query.
///
/// Numeric values are unquoted, dates become epoch milliseconds and every
/// other value is single-quoted with embedded quotes doubled.
pub fn query_literal(value: &Value) -> String {
    match value {
        Value::Null | Value::Reference(None) => "NULL".to_string(),
        Value::Integer(v) => v.to_string(),
        Value::Long(v) => v.to_string(),
        Value::Decimal(v) => v.normalize().to_string(),
        Value::Float(v) => v.to_string(),
        Value::Reference(Some(id)) => id.to_string(),
        Value::DateTime(v) => quote(&v.timestamp_millis().to_string()),
        other => quote(&key_segment(other)),
    }
}

fn quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

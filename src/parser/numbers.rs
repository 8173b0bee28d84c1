// ABOUTME: Numeric text parsing tolerant of US and European separators
// ABOUTME: Detects the thousands/decimal convention from '.' and ',' placement

use rust_decimal::prelude::*;

/// Characters stripped from floating point input before parsing.
const FLOAT_NOISE: [char; 3] = ['%', '$', '€'];

/// Rewrite a number so that '.' is the only decimal separator and no
/// grouping separators remain.
///
/// The convention is decided by how many '.' and ',' characters occur and
/// which one comes first:
/// - `1234.5` and `1234` are already canonical
/// - `1,234,567` and `1,234.50` drop the commas
/// - `1.234.567` and `1.234,50` drop the dots and use the comma as decimal point
/// - `12,5` uses the comma as decimal point
pub fn normalize_separators(text: &str) -> Result<String, String> {
    let text = text.trim();
    let commas = text.matches(',').count();
    let dots = text.matches('.').count();
    let first_comma = text.find(',');
    let first_dot = text.find('.');

    if commas == 0 && dots <= 1 {
        return Ok(text.to_string());
    }

    let dot_after_comma = matches!((first_dot, first_comma), (Some(d), Some(c)) if d > c);
    let dot_before_comma = matches!((first_dot, first_comma), (Some(d), Some(c)) if d < c);

    if (commas > 1 && dots <= 1) || dot_after_comma {
        Ok(text.replace(',', ""))
    } else if (dots > 1 && commas <= 1) || dot_before_comma {
        Ok(text.replace('.', "").replace(',', "."))
    } else if commas == 1 && dots == 0 {
        Ok(text.replace(',', "."))
    } else {
        Err(format!("cannot determine the decimal separator of '{}'", text))
    }
}

pub fn parse_float(text: &str) -> Result<f64, String> {
    let cleaned: String = text.chars().filter(|c| !FLOAT_NOISE.contains(c)).collect();
    let normalized = normalize_separators(&cleaned)?;
    normalized
        .parse::<f64>()
        .map_err(|e| format!("'{}' is not a number: {}", text.trim(), e))
}

pub fn parse_decimal(text: &str) -> Result<Decimal, String> {
    let normalized = normalize_separators(text)?;
    Decimal::from_str(&normalized)
        .or_else(|_| Decimal::from_scientific(&normalized))
        .map_err(|e| format!("'{}' is not a decimal: {}", text.trim(), e))
}

/// Parse an integral number, falling back to the floating point parser for
/// inputs such as `12.0` or `1.234,00`. The fraction is truncated.
pub fn parse_long(text: &str) -> Result<i64, String> {
    let trimmed = text.trim();
    if let Ok(value) = trimmed.parse::<i64>() {
        return Ok(value);
    }
    let value = parse_float(trimmed)?;
    // i64::MAX as f64 rounds up to 2^63, which is already out of range
    if !value.is_finite() || value < i64::MIN as f64 || value >= i64::MAX as f64 {
        return Err(format!("'{}' does not fit in a long", trimmed));
    }
    Ok(value.trunc() as i64)
}

pub fn parse_integer(text: &str) -> Result<i32, String> {
    let value = parse_long(text)?;
    i32::try_from(value).map_err(|_| format!("'{}' does not fit in an integer", text.trim()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_us_and_european_conventions() {
        assert_eq!(normalize_separators("1234.5").unwrap(), "1234.5");
        assert_eq!(normalize_separators("1,234,567").unwrap(), "1234567");
        assert_eq!(normalize_separators("1,234.50").unwrap(), "1234.50");
        assert_eq!(normalize_separators("1.234.567").unwrap(), "1234567");
        assert_eq!(normalize_separators("1.234,50").unwrap(), "1234.50");
        assert_eq!(normalize_separators("12,5").unwrap(), "12.5");
    }

    #[test]
    fn test_parse_float_strips_currency_and_percent() {
        assert_eq!(parse_float("€ 1.250,75").unwrap(), 1250.75);
        assert_eq!(parse_float("$1,250.75").unwrap(), 1250.75);
        assert_eq!(parse_float("12,5%").unwrap(), 12.5);
        assert!(parse_float("abc").is_err());
    }

    #[test]
    fn test_parse_long_falls_back_to_float() {
        assert_eq!(parse_long("42").unwrap(), 42);
        assert_eq!(parse_long("42.9").unwrap(), 42);
        assert_eq!(parse_long("1.234,00").unwrap(), 1234);
        assert!(parse_integer("3000000000").is_err());
    }

    #[test]
    fn test_parse_long_rejects_values_past_the_range() {
        assert!(parse_long("9223372036854775808").is_err());
        assert!(parse_long("9.3e18").is_err());
        assert_eq!(parse_long("-9223372036854775808").unwrap(), i64::MIN);
        assert_eq!(parse_long("9223372036854775807").unwrap(), i64::MAX);
    }

    #[test]
    fn test_parse_decimal_keeps_scale() {
        assert_eq!(parse_decimal("1.234,50").unwrap().to_string(), "1234.50");
        assert_eq!(parse_decimal("0.1").unwrap().to_string(), "0.1");
    }
}

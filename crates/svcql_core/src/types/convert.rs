//! Explicit literal conversion table.
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};
use svcql_error::{DbError, Result};
use svcql_parser::ast::Literal;

use super::{DataType, ScalarValue};

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y/%m/%d %H:%M:%S%.f",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d"];

/// Parse a timestamp from text using the accepted formats.
pub fn parse_timestamp(s: &str) -> Result<NaiveDateTime> {
    let s = s.trim();
    for format in DATETIME_FORMATS {
        if let Ok(ts) = NaiveDateTime::parse_from_str(s, format) {
            return Ok(ts);
        }
    }
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(s, format) {
            return Ok(date.and_time(NaiveTime::MIN));
        }
    }
    Err(DbError::new(format!("Unable to parse '{s}' as a timestamp")))
}

pub fn timestamp_to_millis(ts: &NaiveDateTime) -> i64 {
    ts.and_utc().timestamp_millis()
}

pub fn timestamp_from_millis(millis: i64) -> Result<NaiveDateTime> {
    DateTime::from_timestamp_millis(millis)
        .map(|dt| dt.naive_utc())
        .ok_or_else(|| DbError::new(format!("Timestamp out of range: {millis}")))
}

fn parse_boolean(s: &str) -> Result<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "true" | "t" | "y" | "yes" | "1" => Ok(true),
        "false" | "f" | "n" | "no" | "0" => Ok(false),
        other => Err(DbError::new(format!("Unable to parse '{other}' as a boolean"))),
    }
}

/// Convert a value to the target type.
///
/// NULL converts to NULL for every target. Pairs missing from the table
/// below return an error.
pub fn convert_literal(value: &ScalarValue, target: DataType) -> Result<ScalarValue> {
    let converted = match (value, target) {
        (ScalarValue::Null, _) => ScalarValue::Null,

        (ScalarValue::String(s), DataType::String) => ScalarValue::String(s.clone()),
        (ScalarValue::String(s), DataType::Integer) => ScalarValue::Integer(s.trim().parse()?),
        (ScalarValue::String(s), DataType::Number) => ScalarValue::Number(s.trim().parse()?),
        (ScalarValue::String(s), DataType::Boolean) => ScalarValue::Boolean(parse_boolean(s)?),
        (ScalarValue::String(s), DataType::Timestamp) => {
            ScalarValue::Timestamp(parse_timestamp(s)?)
        }

        (ScalarValue::Integer(v), DataType::Integer) => ScalarValue::Integer(*v),
        (ScalarValue::Integer(v), DataType::Number) => ScalarValue::Number(*v as f64),
        (ScalarValue::Integer(v), DataType::String) => ScalarValue::String(v.to_string()),
        (ScalarValue::Integer(v), DataType::Boolean) => ScalarValue::Boolean(*v != 0),
        (ScalarValue::Integer(v), DataType::Timestamp) => {
            ScalarValue::Timestamp(timestamp_from_millis(*v)?)
        }

        (ScalarValue::Number(v), DataType::Number) => ScalarValue::Number(*v),
        (ScalarValue::Number(v), DataType::Integer) => {
            if v.fract() != 0.0 || !v.is_finite() {
                return Err(DbError::new(format!(
                    "Number {v} cannot be converted to an integer without rounding"
                )));
            }
            ScalarValue::Integer(*v as i64)
        }
        (ScalarValue::Number(v), DataType::String) => ScalarValue::String(v.to_string()),

        (ScalarValue::Boolean(v), DataType::Boolean) => ScalarValue::Boolean(*v),
        (ScalarValue::Boolean(v), DataType::String) => ScalarValue::String(v.to_string()),
        (ScalarValue::Boolean(v), DataType::Integer) => ScalarValue::Integer(*v as i64),
        (ScalarValue::Boolean(v), DataType::Number) => {
            ScalarValue::Number(if *v { 1.0 } else { 0.0 })
        }

        (ScalarValue::Timestamp(v), DataType::Timestamp) => ScalarValue::Timestamp(*v),
        (ScalarValue::Timestamp(_), DataType::String) => ScalarValue::String(value.to_string()),
        (ScalarValue::Timestamp(v), DataType::Integer) => {
            ScalarValue::Integer(timestamp_to_millis(v))
        }

        (value, target) => {
            return Err(DbError::new(format!(
                "Cannot convert {value} to {target}"
            )));
        }
    };
    Ok(converted)
}

/// Turn a parsed SQL literal into a value.
///
/// Numbers that fit in an `i64` become integers, everything else numeric is
/// a floating point number.
pub fn literal_to_scalar(literal: &Literal) -> Result<ScalarValue> {
    Ok(match literal {
        Literal::Null => ScalarValue::Null,
        Literal::Boolean(b) => ScalarValue::Boolean(*b),
        Literal::SingleQuotedString(s) => ScalarValue::String(s.clone()),
        Literal::Number(n) => match n.parse::<i64>() {
            Ok(v) => ScalarValue::Integer(v),
            Err(_) => ScalarValue::Number(n.parse()?),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_to_everything() {
        let s = ScalarValue::from("42");
        assert_eq!(
            ScalarValue::Integer(42),
            convert_literal(&s, DataType::Integer).unwrap()
        );
        assert_eq!(
            ScalarValue::Number(42.0),
            convert_literal(&s, DataType::Number).unwrap()
        );
        assert_eq!(
            ScalarValue::Boolean(true),
            convert_literal(&ScalarValue::from("TRUE"), DataType::Boolean).unwrap()
        );
    }

    #[test]
    fn timestamp_formats() {
        let expected = NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        assert_eq!(expected, parse_timestamp("2024-03-01").unwrap());
        assert_eq!(expected, parse_timestamp("2024/03/01").unwrap());
        assert_eq!(expected, parse_timestamp("2024-03-01 00:00:00").unwrap());
        assert_eq!(expected, parse_timestamp("2024-03-01T00:00:00.000").unwrap());
        parse_timestamp("yesterday").unwrap_err();
    }

    #[test]
    fn timestamp_millis_roundtrip() {
        let ts = parse_timestamp("2024-03-01 10:11:12.345").unwrap();
        let millis = timestamp_to_millis(&ts);
        assert_eq!(ts, timestamp_from_millis(millis).unwrap());
        assert_eq!(
            "2024-03-01 10:11:12.345",
            ScalarValue::Timestamp(ts).to_string()
        );
    }

    #[test]
    fn fractional_number_to_integer_errors() {
        convert_literal(&ScalarValue::Number(1.5), DataType::Integer).unwrap_err();
        assert_eq!(
            ScalarValue::Integer(2),
            convert_literal(&ScalarValue::Number(2.0), DataType::Integer).unwrap()
        );
    }

    #[test]
    fn unsupported_pairs_error() {
        convert_literal(&ScalarValue::Boolean(true), DataType::Timestamp).unwrap_err();
        convert_literal(&ScalarValue::Number(1.0), DataType::Boolean).unwrap_err();
    }

    #[test]
    fn number_literals() {
        assert_eq!(
            ScalarValue::Integer(7),
            literal_to_scalar(&Literal::Number("7".to_string())).unwrap()
        );
        assert_eq!(
            ScalarValue::Number(7.5),
            literal_to_scalar(&Literal::Number("7.5".to_string())).unwrap()
        );
    }
}

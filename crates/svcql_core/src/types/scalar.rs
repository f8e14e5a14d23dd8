use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use chrono::NaiveDateTime;

use super::DataType;

/// Format used when rendering timestamps as text.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

#[derive(Debug, Clone, PartialEq)]
pub enum ScalarValue {
    Null,
    Boolean(bool),
    Integer(i64),
    Number(f64),
    String(String),
    Timestamp(NaiveDateTime),
}

impl ScalarValue {
    /// Data type of this value, `None` for NULL.
    pub fn datatype(&self) -> Option<DataType> {
        Some(match self {
            ScalarValue::Null => return None,
            ScalarValue::Boolean(_) => DataType::Boolean,
            ScalarValue::Integer(_) => DataType::Integer,
            ScalarValue::Number(_) => DataType::Number,
            ScalarValue::String(_) => DataType::String,
            ScalarValue::Timestamp(_) => DataType::Timestamp,
        })
    }

    pub fn is_null(&self) -> bool {
        matches!(self, ScalarValue::Null)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ScalarValue::Integer(v) => Some(*v as f64),
            ScalarValue::Number(v) => Some(*v),
            _ => None,
        }
    }

    /// Truthiness used by conditional expressions. NULL is false.
    pub fn is_truthy(&self) -> bool {
        match self {
            ScalarValue::Boolean(b) => *b,
            ScalarValue::Integer(v) => *v != 0,
            ScalarValue::Number(v) => *v != 0.0,
            ScalarValue::String(s) => !s.is_empty(),
            ScalarValue::Timestamp(_) => true,
            ScalarValue::Null => false,
        }
    }

    /// Compare two values.
    ///
    /// Integers and numbers compare numerically. Mixing any other types falls
    /// back to comparing their text representation. Comparisons involving
    /// NULL return `None`.
    pub fn compare(&self, other: &ScalarValue) -> Option<Ordering> {
        match (self, other) {
            (ScalarValue::Null, _) | (_, ScalarValue::Null) => None,
            (ScalarValue::Boolean(a), ScalarValue::Boolean(b)) => Some(a.cmp(b)),
            (ScalarValue::Integer(a), ScalarValue::Integer(b)) => Some(a.cmp(b)),
            (ScalarValue::String(a), ScalarValue::String(b)) => Some(a.cmp(b)),
            (ScalarValue::Timestamp(a), ScalarValue::Timestamp(b)) => Some(a.cmp(b)),
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(a), Some(b)) => a.partial_cmp(&b),
                _ => Some(a.to_string().cmp(&b.to_string())),
            },
        }
    }

    /// Total ordering used for sorting. NULLs sort first.
    pub fn sort_cmp(&self, other: &ScalarValue) -> Ordering {
        match (self.is_null(), other.is_null()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            (false, false) => self.compare(other).unwrap_or(Ordering::Equal),
        }
    }
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarValue::Null => write!(f, "NULL"),
            ScalarValue::Boolean(v) => write!(f, "{v}"),
            ScalarValue::Integer(v) => write!(f, "{v}"),
            ScalarValue::Number(v) => write!(f, "{v}"),
            ScalarValue::String(v) => write!(f, "{v}"),
            ScalarValue::Timestamp(v) => write!(f, "{}", v.format(TIMESTAMP_FORMAT)),
        }
    }
}

impl From<i64> for ScalarValue {
    fn from(value: i64) -> Self {
        ScalarValue::Integer(value)
    }
}

impl From<i32> for ScalarValue {
    fn from(value: i32) -> Self {
        ScalarValue::Integer(value as i64)
    }
}

impl From<f64> for ScalarValue {
    fn from(value: f64) -> Self {
        ScalarValue::Number(value)
    }
}

impl From<bool> for ScalarValue {
    fn from(value: bool) -> Self {
        ScalarValue::Boolean(value)
    }
}

impl From<&str> for ScalarValue {
    fn from(value: &str) -> Self {
        ScalarValue::String(value.to_string())
    }
}

impl From<String> for ScalarValue {
    fn from(value: String) -> Self {
        ScalarValue::String(value)
    }
}

impl From<NaiveDateTime> for ScalarValue {
    fn from(value: NaiveDateTime) -> Self {
        ScalarValue::Timestamp(value)
    }
}

/// Wrapper providing `Eq` and `Hash` so values can be used as grouping keys.
#[derive(Debug, Clone)]
pub struct GroupValue(pub ScalarValue);

impl PartialEq for GroupValue {
    fn eq(&self, other: &Self) -> bool {
        match (&self.0, &other.0) {
            (ScalarValue::Number(a), ScalarValue::Number(b)) => a.to_bits() == b.to_bits(),
            (a, b) => a == b,
        }
    }
}

impl Eq for GroupValue {}

impl Hash for GroupValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(&self.0).hash(state);
        match &self.0 {
            ScalarValue::Null => (),
            ScalarValue::Boolean(v) => v.hash(state),
            ScalarValue::Integer(v) => v.hash(state),
            ScalarValue::Number(v) => v.to_bits().hash(state),
            ScalarValue::String(v) => v.hash(state),
            ScalarValue::Timestamp(v) => v.hash(state),
        }
    }
}

use std::fmt;

use serde::{Deserialize, Serialize};
use svcql_error::{DbError, Result};

/// Column types a service can expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Boolean,
    Integer,
    Number,
    String,
    Timestamp,
}

impl DataType {
    /// Tag used for this type in the binary row format.
    pub const fn wire_tag(&self) -> u8 {
        match self {
            DataType::Boolean => 1,
            DataType::Integer => 2,
            DataType::Number => 3,
            DataType::String => 4,
            DataType::Timestamp => 5,
        }
    }

    pub fn from_wire_tag(tag: u8) -> Result<Self> {
        Ok(match tag {
            1 => DataType::Boolean,
            2 => DataType::Integer,
            3 => DataType::Number,
            4 => DataType::String,
            5 => DataType::Timestamp,
            other => return Err(DbError::new(format!("Unknown data type tag: {other}"))),
        })
    }

    pub const fn is_numeric(&self) -> bool {
        matches!(self, DataType::Integer | DataType::Number)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DataType::Boolean => "Boolean",
            DataType::Integer => "Integer",
            DataType::Number => "Number",
            DataType::String => "String",
            DataType::Timestamp => "Timestamp",
        };
        write!(f, "{s}")
    }
}

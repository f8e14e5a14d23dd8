use std::fmt;

use serde::{Deserialize, Serialize};

use super::{DataType, ScalarValue};

pub type Row = Vec<ScalarValue>;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub datatype: DataType,
}

impl Field {
    pub fn new(name: impl Into<String>, datatype: DataType) -> Self {
        Field {
            name: name.into(),
            datatype,
        }
    }
}

/// Ordered set of fields describing rows produced by a step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RowSchema {
    pub fields: Vec<Field>,
}

impl RowSchema {
    pub fn new(fields: impl IntoIterator<Item = Field>) -> Self {
        RowSchema {
            fields: fields.into_iter().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Find the index of a field by name.
    ///
    /// Exact matches win over case-insensitive ones.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields
            .iter()
            .position(|f| f.name == name)
            .or_else(|| {
                self.fields
                    .iter()
                    .position(|f| f.name.eq_ignore_ascii_case(name))
            })
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.index_of(name).map(|idx| &self.fields[idx])
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }
}

impl fmt::Display for RowSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (idx, field) in self.fields.iter().enumerate() {
            if idx > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{} {}", field.name, field.datatype)?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_prefers_exact_match() {
        let schema = RowSchema::new([
            Field::new("Name", DataType::String),
            Field::new("name", DataType::Integer),
        ]);
        assert_eq!(Some(1), schema.index_of("name"));
        assert_eq!(Some(0), schema.index_of("NAME"));
        assert_eq!(None, schema.index_of("missing"));
    }
}

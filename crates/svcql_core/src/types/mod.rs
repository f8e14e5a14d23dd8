//! Row model shared by graphs, conditions and the wire protocol.
pub mod convert;
pub mod datatype;
pub mod scalar;
pub mod schema;

use std::collections::BTreeMap;

pub use datatype::DataType;
pub use scalar::ScalarValue;
pub use schema::{Field, Row, RowSchema};

/// Named parameters passed to a graph, ordered by name.
pub type Parameters = BTreeMap<String, String>;

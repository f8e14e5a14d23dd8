use std::fmt::Debug;

use svcql_error::Result;

use crate::types::Row;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorState {
    NeedsMore,
    /// No further input is needed, e.g. a limit was reached.
    Done,
}

/// Transformation applied by a step of a local graph.
pub trait RowOperator: Send + Debug {
    /// Push a single input row, appending any produced rows to `out`.
    fn push(&mut self, row: Row, out: &mut Vec<Row>) -> Result<OperatorState>;

    /// Input is exhausted, flush anything buffered.
    fn finish(&mut self, out: &mut Vec<Row>) -> Result<()>;
}

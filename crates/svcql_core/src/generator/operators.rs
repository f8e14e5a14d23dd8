use std::cmp::Ordering;
use std::collections::HashSet;

use svcql_error::Result;

use super::expr::ScalarExpr;
use crate::condition::Condition;
use crate::graph::operator::{OperatorState, RowOperator};
use crate::types::scalar::GroupValue;
use crate::types::{Row, RowSchema};

/// Passes rows matching a condition.
#[derive(Debug)]
pub struct FilterOperator {
    condition: Condition,
    schema: RowSchema,
}

impl FilterOperator {
    pub fn new(condition: Condition, schema: RowSchema) -> Self {
        FilterOperator { condition, schema }
    }
}

impl RowOperator for FilterOperator {
    fn push(&mut self, row: Row, out: &mut Vec<Row>) -> Result<OperatorState> {
        if self.condition.evaluate(&self.schema, &row)? {
            out.push(row);
        }
        Ok(OperatorState::NeedsMore)
    }

    fn finish(&mut self, _out: &mut Vec<Row>) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug)]
pub struct ProjectionOperator {
    exprs: Vec<ScalarExpr>,
}

impl ProjectionOperator {
    pub fn new(exprs: Vec<ScalarExpr>) -> Self {
        ProjectionOperator { exprs }
    }
}

impl RowOperator for ProjectionOperator {
    fn push(&mut self, row: Row, out: &mut Vec<Row>) -> Result<OperatorState> {
        let mut projected = Vec::with_capacity(self.exprs.len());
        for expr in &self.exprs {
            projected.push(expr.eval(&row)?);
        }
        out.push(projected);
        Ok(OperatorState::NeedsMore)
    }

    fn finish(&mut self, _out: &mut Vec<Row>) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct DistinctOperator {
    seen: HashSet<Vec<GroupValue>>,
}

impl RowOperator for DistinctOperator {
    fn push(&mut self, row: Row, out: &mut Vec<Row>) -> Result<OperatorState> {
        let key: Vec<GroupValue> = row.iter().cloned().map(GroupValue).collect();
        if self.seen.insert(key) {
            out.push(row);
        }
        Ok(OperatorState::NeedsMore)
    }

    fn finish(&mut self, _out: &mut Vec<Row>) -> Result<()> {
        self.seen.clear();
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortKey {
    pub column: usize,
    pub asc: bool,
}

/// Buffers all rows, emitting them sorted on finish.
#[derive(Debug)]
pub struct SortOperator {
    keys: Vec<SortKey>,
    rows: Vec<Row>,
}

impl SortOperator {
    pub fn new(keys: Vec<SortKey>) -> Self {
        SortOperator {
            keys,
            rows: Vec::new(),
        }
    }
}

impl RowOperator for SortOperator {
    fn push(&mut self, row: Row, _out: &mut Vec<Row>) -> Result<OperatorState> {
        self.rows.push(row);
        Ok(OperatorState::NeedsMore)
    }

    fn finish(&mut self, out: &mut Vec<Row>) -> Result<()> {
        let keys = &self.keys;
        self.rows.sort_by(|a, b| {
            for key in keys {
                let ord = a[key.column].sort_cmp(&b[key.column]);
                let ord = if key.asc { ord } else { ord.reverse() };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        });
        out.append(&mut self.rows);
        Ok(())
    }
}

/// Passes at most `limit` rows.
#[derive(Debug)]
pub struct LimitOperator {
    limit: usize,
    emitted: usize,
}

impl LimitOperator {
    pub fn new(limit: usize) -> Self {
        LimitOperator { limit, emitted: 0 }
    }
}

impl RowOperator for LimitOperator {
    fn push(&mut self, row: Row, out: &mut Vec<Row>) -> Result<OperatorState> {
        if self.emitted < self.limit {
            self.emitted += 1;
            out.push(row);
        }
        Ok(if self.emitted >= self.limit {
            OperatorState::Done
        } else {
            OperatorState::NeedsMore
        })
    }

    fn finish(&mut self, _out: &mut Vec<Row>) -> Result<()> {
        Ok(())
    }
}

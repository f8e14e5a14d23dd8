//! Hash aggregation for GROUP BY and aggregate functions.
use std::collections::{HashMap, HashSet};

use svcql_error::{DbError, Result};
use svcql_parser::ast::{Expr, Function, FunctionArg, SelectItem};

use super::expr::ScalarExpr;
use crate::graph::operator::{OperatorState, RowOperator};
use crate::query::SqlQuery;
use crate::types::scalar::GroupValue;
use crate::types::{DataType, Field, Row, RowSchema, ScalarValue};

const AGGREGATE_FUNCTIONS: &[&str] = &["COUNT", "SUM", "MIN", "MAX", "AVG"];

pub fn is_aggregate_function(name: &str) -> bool {
    AGGREGATE_FUNCTIONS.contains(&name)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFunction {
    Count,
    Sum,
    Min,
    Max,
    Avg,
}

impl AggregateFunction {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "COUNT" => Self::Count,
            "SUM" => Self::Sum,
            "MIN" => Self::Min,
            "MAX" => Self::Max,
            "AVG" => Self::Avg,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregateExpr {
    pub function: AggregateFunction,
    /// `None` for `COUNT(*)`.
    pub arg: Option<ScalarExpr>,
    pub distinct: bool,
    /// Output column name, the canonical text of the call.
    pub name: String,
    pub datatype: DataType,
}

impl AggregateExpr {
    fn plan(func: &Function, name: String, input: &RowSchema) -> Result<Self> {
        let function = AggregateFunction::from_name(&func.name())
            .ok_or_else(|| DbError::new(format!("Unknown aggregate: {}", func.name())))?;

        let arg = match func.args.as_slice() {
            [FunctionArg::Wildcard] if function == AggregateFunction::Count => None,
            [FunctionArg::Expr(expr)] => Some(ScalarExpr::compile(expr, input)?),
            _ => {
                return Err(DbError::new(format!(
                    "{name} expects a single argument"
                )));
            }
        };

        let datatype = match (function, &arg) {
            (AggregateFunction::Count, _) => DataType::Integer,
            (AggregateFunction::Avg, _) => DataType::Number,
            (AggregateFunction::Sum, Some(arg)) => match arg.datatype(input) {
                DataType::Integer => DataType::Integer,
                _ => DataType::Number,
            },
            (_, Some(arg)) => arg.datatype(input),
            (_, None) => DataType::Integer,
        };

        Ok(AggregateExpr {
            function,
            arg,
            distinct: func.distinct,
            name,
            datatype,
        })
    }
}

/// What a query aggregates and the schema aggregation produces.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatePlan {
    pub group_exprs: Vec<ScalarExpr>,
    pub aggregates: Vec<AggregateExpr>,
    /// Group columns followed by one column per aggregate.
    pub output_schema: RowSchema,
}

impl AggregatePlan {
    /// Plan aggregation for the query. Returns `None` if the query has no
    /// GROUP BY and uses no aggregate functions.
    pub fn plan(query: &SqlQuery, input: &RowSchema) -> Result<Option<Self>> {
        let mut calls: Vec<(String, Function)> = Vec::new();
        for item in query.select_items() {
            match item {
                SelectItem::Expr(expr) | SelectItem::AliasedExpr(expr, _) => {
                    collect_aggregates(expr, &mut calls)
                }
                SelectItem::Wildcard => (),
            }
        }
        if let Some(having) = query.having_expr() {
            collect_aggregates(having, &mut calls);
        }
        for order_by in query.order_by() {
            collect_aggregates(&order_by.expr, &mut calls);
        }

        if calls.is_empty() && query.group_by().is_empty() {
            if query.having_expr().is_some() {
                return Err(DbError::new("HAVING requires GROUP BY or an aggregate"));
            }
            return Ok(None);
        }

        let mut fields = Vec::new();
        let mut group_exprs = Vec::new();
        for expr in query.group_by() {
            let compiled = ScalarExpr::compile(expr, input)?;
            let name = match expr.column_name() {
                Some(name) => name.to_string(),
                None => expr.to_string(),
            };
            fields.push(Field::new(name, compiled.datatype(input)));
            group_exprs.push(compiled);
        }

        let mut aggregates = Vec::new();
        for (name, func) in calls {
            let agg = AggregateExpr::plan(&func, name, input)?;
            fields.push(Field::new(agg.name.clone(), agg.datatype));
            aggregates.push(agg);
        }

        Ok(Some(AggregatePlan {
            group_exprs,
            aggregates,
            output_schema: RowSchema::new(fields),
        }))
    }
}

/// Collect aggregate calls in `expr`, deduplicated by their text.
fn collect_aggregates(expr: &Expr, out: &mut Vec<(String, Function)>) {
    match expr {
        Expr::Function(func) if is_aggregate_function(&func.name()) => {
            let text = expr.to_string();
            if !out.iter().any(|(existing, _)| *existing == text) {
                out.push((text, func.clone()));
            }
        }
        Expr::Function(func) => {
            for arg in &func.args {
                if let FunctionArg::Expr(expr) = arg {
                    collect_aggregates(expr, out);
                }
            }
        }
        Expr::Nested(inner) | Expr::UnaryExpr { expr: inner, .. } => collect_aggregates(inner, out),
        Expr::BinaryExpr { left, right, .. } => {
            collect_aggregates(left, out);
            collect_aggregates(right, out);
        }
        Expr::IsNull { expr, .. } => collect_aggregates(expr, out),
        Expr::InList { expr, list, .. } => {
            collect_aggregates(expr, out);
            for item in list {
                collect_aggregates(item, out);
            }
        }
        Expr::Like { expr, pattern, .. } => {
            collect_aggregates(expr, out);
            collect_aggregates(pattern, out);
        }
        Expr::Case {
            operand,
            conditions,
            results,
            else_result,
        } => {
            for e in operand.iter().chain(else_result.iter()) {
                collect_aggregates(e, out);
            }
            for e in conditions.iter().chain(results.iter()) {
                collect_aggregates(e, out);
            }
        }
        Expr::Ident(_) | Expr::CompoundIdent(_) | Expr::Literal(_) => (),
    }
}

#[derive(Debug)]
struct Accumulator {
    function: AggregateFunction,
    count: i64,
    int_sum: Option<i64>,
    float_sum: f64,
    saw_float: bool,
    extreme: Option<ScalarValue>,
    seen: Option<HashSet<GroupValue>>,
}

impl Accumulator {
    fn new(agg: &AggregateExpr) -> Self {
        Accumulator {
            function: agg.function,
            count: 0,
            int_sum: Some(0),
            float_sum: 0.0,
            saw_float: false,
            extreme: None,
            seen: agg.distinct.then(HashSet::new),
        }
    }

    fn update(&mut self, value: Option<ScalarValue>) -> Result<()> {
        let value = match value {
            // COUNT(*)
            None => {
                self.count += 1;
                return Ok(());
            }
            Some(ScalarValue::Null) => return Ok(()),
            Some(value) => value,
        };

        if let Some(seen) = &mut self.seen {
            if !seen.insert(GroupValue(value.clone())) {
                return Ok(());
            }
        }

        self.count += 1;
        match self.function {
            AggregateFunction::Count => (),
            AggregateFunction::Sum | AggregateFunction::Avg => {
                match value {
                    ScalarValue::Integer(v) => {
                        self.int_sum = self.int_sum.and_then(|s| s.checked_add(v));
                        self.float_sum += v as f64;
                    }
                    ScalarValue::Number(v) => {
                        self.saw_float = true;
                        self.float_sum += v;
                    }
                    other => {
                        return Err(DbError::new(format!(
                            "Cannot sum non-numeric value {other}"
                        )));
                    }
                }
            }
            AggregateFunction::Min | AggregateFunction::Max => {
                let replace = match &self.extreme {
                    None => true,
                    Some(current) => {
                        let ord = value.sort_cmp(current);
                        if self.function == AggregateFunction::Min {
                            ord.is_lt()
                        } else {
                            ord.is_gt()
                        }
                    }
                };
                if replace {
                    self.extreme = Some(value);
                }
            }
        }
        Ok(())
    }

    fn finish(&self) -> ScalarValue {
        match self.function {
            AggregateFunction::Count => ScalarValue::Integer(self.count),
            AggregateFunction::Sum => {
                if self.count == 0 {
                    ScalarValue::Null
                } else {
                    match (self.saw_float, self.int_sum) {
                        (false, Some(sum)) => ScalarValue::Integer(sum),
                        _ => ScalarValue::Number(self.float_sum),
                    }
                }
            }
            AggregateFunction::Avg => {
                if self.count == 0 {
                    ScalarValue::Null
                } else {
                    ScalarValue::Number(self.float_sum / self.count as f64)
                }
            }
            AggregateFunction::Min | AggregateFunction::Max => {
                self.extreme.clone().unwrap_or(ScalarValue::Null)
            }
        }
    }
}

/// Groups rows and emits one row per group once input is exhausted.
#[derive(Debug)]
pub struct AggregateOperator {
    group_exprs: Vec<ScalarExpr>,
    aggregates: Vec<AggregateExpr>,
    index: HashMap<Vec<GroupValue>, usize>,
    /// Groups in first seen order.
    groups: Vec<(Vec<ScalarValue>, Vec<Accumulator>)>,
}

impl AggregateOperator {
    pub fn new(plan: &AggregatePlan) -> Self {
        AggregateOperator {
            group_exprs: plan.group_exprs.clone(),
            aggregates: plan.aggregates.clone(),
            index: HashMap::new(),
            groups: Vec::new(),
        }
    }

    fn new_accumulators(&self) -> Vec<Accumulator> {
        self.aggregates.iter().map(Accumulator::new).collect()
    }
}

impl RowOperator for AggregateOperator {
    fn push(&mut self, row: Row, _out: &mut Vec<Row>) -> Result<OperatorState> {
        let mut key_values = Vec::with_capacity(self.group_exprs.len());
        for expr in &self.group_exprs {
            key_values.push(expr.eval(&row)?);
        }
        let key: Vec<GroupValue> = key_values.iter().cloned().map(GroupValue).collect();

        let existing = self.index.get(&key).copied();
        let idx = match existing {
            Some(idx) => idx,
            None => {
                let accumulators = self.new_accumulators();
                self.groups.push((key_values, accumulators));
                self.index.insert(key, self.groups.len() - 1);
                self.groups.len() - 1
            }
        };

        for (agg, acc) in self.aggregates.iter().zip(self.groups[idx].1.iter_mut()) {
            let value = match &agg.arg {
                Some(arg) => Some(arg.eval(&row)?),
                None => None,
            };
            acc.update(value)?;
        }

        Ok(OperatorState::NeedsMore)
    }

    fn finish(&mut self, out: &mut Vec<Row>) -> Result<()> {
        // Aggregates without grouping always produce a row.
        if self.groups.is_empty() && self.group_exprs.is_empty() {
            let accumulators = self.new_accumulators();
            self.groups.push((Vec::new(), accumulators));
        }

        for (keys, accumulators) in self.groups.drain(..) {
            let mut row = keys;
            row.extend(accumulators.iter().map(|acc| acc.finish()));
            out.push(row);
        }
        self.index.clear();
        Ok(())
    }
}

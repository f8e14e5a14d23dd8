//! Parsed SQL query model consumed by the orchestrator and the pipeline
//! generator.
use svcql_error::{DbError, Result, ResultExt};
use svcql_parser::ast::{Expr, OrderByNode, QueryNode, SelectItem};

use crate::condition::Condition;

#[derive(Debug, Clone, PartialEq)]
pub struct SqlQuery {
    sql: String,
    ast: QueryNode,
    /// Service the query reads from.
    service_name: Option<String>,
    /// Resolved WHERE tree.
    pub where_condition: Option<Condition>,
    /// Resolved HAVING tree.
    pub having_condition: Option<Condition>,
}

impl SqlQuery {
    pub fn parse(sql: &str) -> Result<Self> {
        let ast = svcql_parser::parse(sql).context("Failed to parse SQL")?;

        let service_name = match &ast.body.from {
            Some(reference) => Some(reference.base()?.value.clone()),
            None => None,
        };
        let where_condition = match &ast.body.where_expr {
            Some(expr) => Some(Condition::from_expr(expr).context("Invalid WHERE clause")?),
            None => None,
        };
        let having_condition = match &ast.body.having {
            Some(expr) => Some(Condition::from_expr(expr).context("Invalid HAVING clause")?),
            None => None,
        };

        Ok(SqlQuery {
            sql: sql.to_string(),
            ast,
            service_name,
            where_condition,
            having_condition,
        })
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn ast(&self) -> &QueryNode {
        &self.ast
    }

    pub fn service_name(&self) -> Option<&str> {
        self.service_name.as_deref()
    }

    /// Error if the query names a service other than `service`.
    pub fn validate_service(&self, service: &str) -> Result<()> {
        match &self.service_name {
            Some(name) if name != service => Err(DbError::new(format!(
                "Query targets service '{name}', expected '{service}'"
            ))
            .with_field("service", service)),
            _ => Ok(()),
        }
    }

    pub fn select_items(&self) -> &[SelectItem] {
        &self.ast.body.projections
    }

    pub fn is_distinct(&self) -> bool {
        self.ast.body.distinct
    }

    pub fn group_by(&self) -> &[Expr] {
        &self.ast.body.group_by
    }

    pub fn having_expr(&self) -> Option<&Expr> {
        self.ast.body.having.as_ref()
    }

    pub fn order_by(&self) -> &[OrderByNode] {
        &self.ast.order_by
    }

    pub fn limit(&self) -> Option<u64> {
        self.ast.limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_query_parts() {
        let query = SqlQuery::parse(
            "SELECT region, SUM(amount) FROM sales WHERE amount > 1 GROUP BY region HAVING SUM(amount) > 10 LIMIT 3",
        )
        .unwrap();
        assert_eq!(Some("sales"), query.service_name());
        assert!(query.where_condition.is_some());
        assert!(query.having_condition.is_some());
        assert_eq!(1, query.group_by().len());
        assert_eq!(Some(3), query.limit());
    }

    #[test]
    fn service_validation() {
        let query = SqlQuery::parse("SELECT * FROM sales").unwrap();
        query.validate_service("sales").unwrap();
        let err = query.validate_service("orders").unwrap_err();
        assert_eq!(Some("orders"), err.get_field("service"));

        let query = SqlQuery::parse("SELECT 1").unwrap();
        query.validate_service("anything").unwrap();
    }

    #[test]
    fn invalid_sql() {
        SqlQuery::parse("DELETE FROM x").unwrap_err();
        SqlQuery::parse("SELECT a FROM t WHERE a + 1").unwrap_err();
    }
}

use std::fmt;

use svcql_error::{DbError, Result};

use super::{AstParseable, Expr, Ident, ObjectReference};
use crate::keywords::Keyword;
use crate::parser::Parser;
use crate::tokens::Token;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SelectItem {
    /// `*`
    Wildcard,
    /// An unnamed expression.
    Expr(Expr),
    /// `<expr> [AS] <alias>`
    AliasedExpr(Expr, Ident),
}

impl SelectItem {
    /// Name of the column produced by this item.
    ///
    /// Aliases win, plain column references keep their name, and anything
    /// else is named after its canonical SQL text.
    pub fn output_name(&self) -> Option<String> {
        match self {
            SelectItem::Wildcard => None,
            SelectItem::AliasedExpr(_, alias) => Some(alias.value.clone()),
            SelectItem::Expr(expr) => Some(match expr.column_name() {
                Some(name) => name.to_string(),
                None => expr.to_string(),
            }),
        }
    }
}

impl AstParseable for SelectItem {
    fn parse(parser: &mut Parser) -> Result<Self> {
        if parser.consume_token(&Token::Mul) {
            return Ok(SelectItem::Wildcard);
        }

        let expr = Expr::parse(parser)?;

        if parser.parse_keyword(Keyword::AS) {
            let alias = Ident::parse(parser)?;
            return Ok(SelectItem::AliasedExpr(expr, alias));
        }

        // Implicit alias, any word that's not a clause keyword.
        let implicit_alias = match parser.peek() {
            Some(tok) => match &tok.token {
                Token::Word(w) => match w.keyword {
                    Some(kw) => !Keyword::RESERVED_FOR_ALIAS.contains(&kw),
                    None => true,
                },
                _ => false,
            },
            None => false,
        };
        if implicit_alias {
            let alias = Ident::parse(parser)?;
            return Ok(SelectItem::AliasedExpr(expr, alias));
        }

        Ok(SelectItem::Expr(expr))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OrderByNode {
    pub expr: Expr,
    pub asc: bool,
}

impl AstParseable for OrderByNode {
    fn parse(parser: &mut Parser) -> Result<Self> {
        let expr = Expr::parse(parser)?;
        let asc = if parser.parse_keyword(Keyword::DESC) {
            false
        } else {
            let _ = parser.parse_keyword(Keyword::ASC);
            true
        };
        Ok(OrderByNode { expr, asc })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SelectNode {
    pub distinct: bool,
    pub projections: Vec<SelectItem>,
    /// Data service the query targets.
    pub from: Option<ObjectReference>,
    pub where_expr: Option<Expr>,
    pub group_by: Vec<Expr>,
    pub having: Option<Expr>,
}

impl AstParseable for SelectNode {
    fn parse(parser: &mut Parser) -> Result<Self> {
        parser.expect_keyword(Keyword::SELECT)?;

        let distinct = if parser.parse_keyword(Keyword::DISTINCT) {
            true
        } else {
            let _ = parser.parse_keyword(Keyword::ALL);
            false
        };

        let projections = parser.parse_comma_separated(SelectItem::parse)?;

        let from = if parser.parse_keyword(Keyword::FROM) {
            Some(ObjectReference::parse(parser)?)
        } else {
            None
        };

        let where_expr = if parser.parse_keyword(Keyword::WHERE) {
            Some(Expr::parse(parser)?)
        } else {
            None
        };

        let group_by = if parser.parse_keyword_sequence(&[Keyword::GROUP, Keyword::BY]) {
            parser.parse_comma_separated(Expr::parse)?
        } else {
            Vec::new()
        };

        let having = if parser.parse_keyword(Keyword::HAVING) {
            Some(Expr::parse(parser)?)
        } else {
            None
        };

        Ok(SelectNode {
            distinct,
            projections,
            from,
            where_expr,
            group_by,
            having,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryNode {
    pub body: SelectNode,
    pub order_by: Vec<OrderByNode>,
    pub limit: Option<u64>,
}

impl AstParseable for QueryNode {
    fn parse(parser: &mut Parser) -> Result<Self> {
        let body = SelectNode::parse(parser)?;

        let order_by = if parser.parse_keyword_sequence(&[Keyword::ORDER, Keyword::BY]) {
            parser.parse_comma_separated(OrderByNode::parse)?
        } else {
            Vec::new()
        };

        let limit = if parser.parse_keyword(Keyword::LIMIT) {
            let tok = match parser.next() {
                Some(tok) => tok.token.clone(),
                None => return Err(DbError::new("Expected LIMIT value, found end of statement")),
            };
            match tok {
                Token::Number(n) => Some(n.parse::<u64>().map_err(|_| {
                    DbError::new(format!("LIMIT must be a non-negative integer, got '{n}'"))
                })?),
                other => {
                    return Err(DbError::new(format!(
                        "Expected LIMIT value, got {other:?}"
                    )));
                }
            }
        } else {
            None
        };

        Ok(QueryNode {
            body,
            order_by,
            limit,
        })
    }
}

impl fmt::Display for QueryNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SELECT ")?;
        if self.body.distinct {
            write!(f, "DISTINCT ")?;
        }
        for (idx, item) in self.body.projections.iter().enumerate() {
            if idx > 0 {
                write!(f, ", ")?;
            }
            match item {
                SelectItem::Wildcard => write!(f, "*")?,
                SelectItem::Expr(expr) => write!(f, "{expr}")?,
                SelectItem::AliasedExpr(expr, alias) => write!(f, "{expr} AS {alias}")?,
            }
        }
        if let Some(from) = &self.body.from {
            write!(f, " FROM {from}")?;
        }
        if let Some(where_expr) = &self.body.where_expr {
            write!(f, " WHERE {where_expr}")?;
        }
        if !self.body.group_by.is_empty() {
            let items: Vec<_> = self.body.group_by.iter().map(|e| e.to_string()).collect();
            write!(f, " GROUP BY {}", items.join(", "))?;
        }
        if let Some(having) = &self.body.having {
            write!(f, " HAVING {having}")?;
        }
        if !self.order_by.is_empty() {
            let items: Vec<_> = self
                .order_by
                .iter()
                .map(|o| format!("{}{}", o.expr, if o.asc { "" } else { " DESC" }))
                .collect();
            write!(f, " ORDER BY {}", items.join(", "))?;
        }
        if let Some(limit) = self.limit {
            write!(f, " LIMIT {limit}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::testutil::parse_ast;

    #[test]
    fn select_with_alias_and_wildcard() {
        let node: SelectNode = parse_ast("SELECT *, a AS x, b y FROM svc").unwrap();
        assert_eq!(
            vec![
                SelectItem::Wildcard,
                SelectItem::AliasedExpr(Expr::Ident(Ident::new("a")), Ident::new("x")),
                SelectItem::AliasedExpr(Expr::Ident(Ident::new("b")), Ident::new("y")),
            ],
            node.projections
        );
        assert_eq!(Some(ObjectReference::from_strings(["svc"])), node.from);
    }

    #[test]
    fn full_query() {
        let query: QueryNode = parse_ast(
            "SELECT region, COUNT(*) FROM sales WHERE amount > 10 GROUP BY region HAVING COUNT(*) > 1 ORDER BY region DESC LIMIT 5",
        )
        .unwrap();
        assert_eq!(1, query.body.group_by.len());
        assert!(query.body.having.is_some());
        assert_eq!(1, query.order_by.len());
        assert!(!query.order_by[0].asc);
        assert_eq!(Some(5), query.limit);
        assert_eq!(
            "SELECT region, COUNT(*) FROM sales WHERE amount > 10 GROUP BY region HAVING COUNT(*) > 1 ORDER BY region DESC LIMIT 5",
            query.to_string()
        );
    }

    #[test]
    fn output_names() {
        let node: SelectNode = parse_ast("SELECT t.a, sum(b), c AS z FROM t").unwrap();
        let names: Vec<_> = node
            .projections
            .iter()
            .map(|p| p.output_name().unwrap())
            .collect();
        assert_eq!(vec!["a", "SUM(b)", "z"], names);
    }

    #[test]
    fn negative_limit_errors() {
        parse_ast::<QueryNode>("SELECT a FROM t LIMIT -1").unwrap_err();
    }
}

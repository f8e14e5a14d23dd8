use std::fmt;

use svcql_error::{DbError, Result};

use super::{AstParseable, Ident, ObjectReference};
use crate::keywords::Keyword;
use crate::parser::Parser;
use crate::tokens::Token;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOperator {
    /// Plus, e.g. `+9`
    Plus,
    /// Minus, e.g. `-9`
    Minus,
    /// Not, e.g. `NOT(true)`
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOperator {
    /// Plus, e.g. `a + b`
    Plus,
    /// Minus, e.g. `a - b`
    Minus,
    /// Multiply, e.g. `a * b`
    Multiply,
    /// Divide, e.g. `a / b`
    Divide,
    /// Modulo, e.g. `a % b`
    Modulo,
    /// String concat operator, e.g. `a || b`
    StringConcat,
    /// Greater than, e.g. `a > b`
    Gt,
    /// Less than, e.g. `a < b`
    Lt,
    /// Greater equal, e.g. `a >= b`
    GtEq,
    /// Less equal, e.g. `a <= b`
    LtEq,
    /// Equal, e.g. `a = b`
    Eq,
    /// Not equal, e.g. `a <> b`
    NotEq,
    /// And, e.g. `a AND b`
    And,
    /// Or, e.g. `a OR b`
    Or,
}

impl BinaryOperator {
    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            Self::Gt | Self::Lt | Self::GtEq | Self::LtEq | Self::Eq | Self::NotEq
        )
    }

    /// Operator with sides swapped, e.g. `1 < a` becomes `a > 1`.
    pub fn flip(&self) -> Self {
        match self {
            Self::Gt => Self::Lt,
            Self::Lt => Self::Gt,
            Self::GtEq => Self::LtEq,
            Self::LtEq => Self::GtEq,
            other => *other,
        }
    }
}

impl fmt::Display for BinaryOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Plus => "+",
            Self::Minus => "-",
            Self::Multiply => "*",
            Self::Divide => "/",
            Self::Modulo => "%",
            Self::StringConcat => "||",
            Self::Gt => ">",
            Self::Lt => "<",
            Self::GtEq => ">=",
            Self::LtEq => "<=",
            Self::Eq => "=",
            Self::NotEq => "<>",
            Self::And => "AND",
            Self::Or => "OR",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Literal {
    /// Unparsed number literal.
    Number(String),
    /// String literal.
    SingleQuotedString(String),
    /// Boolean literal.
    Boolean(bool),
    /// Null literal
    Null,
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::SingleQuotedString(s) => write!(f, "'{}'", s.replace('\'', "''")),
            Self::Boolean(true) => write!(f, "TRUE"),
            Self::Boolean(false) => write!(f, "FALSE"),
            Self::Null => write!(f, "NULL"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FunctionArg {
    /// `*`, only valid for `COUNT(*)`.
    Wildcard,
    Expr(Expr),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Function {
    pub reference: ObjectReference,
    pub distinct: bool,
    pub args: Vec<FunctionArg>,
}

impl Function {
    /// Upper-cased base name of the function.
    pub fn name(&self) -> String {
        self.reference
            .base()
            .map(|ident| ident.value.to_uppercase())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Expr {
    /// Column or table identifier.
    Ident(Ident),
    /// Compound identifier.
    ///
    /// `table.col`
    CompoundIdent(Vec<Ident>),
    /// An expression literal,
    Literal(Literal),
    /// Parenthesized expression.
    Nested(Box<Expr>),
    /// A unary expression.
    UnaryExpr { op: UnaryOperator, expr: Box<Expr> },
    /// A binary expression.
    BinaryExpr {
        left: Box<Expr>,
        op: BinaryOperator,
        right: Box<Expr>,
    },
    /// A scalar or aggregate function call.
    Function(Function),
    /// `<expr> IS [NOT] NULL`
    IsNull { expr: Box<Expr>, negated: bool },
    /// `<expr> [NOT] IN (<list>)`
    InList {
        expr: Box<Expr>,
        list: Vec<Expr>,
        negated: bool,
    },
    /// `<expr> [NOT] LIKE <pattern>`
    Like {
        expr: Box<Expr>,
        pattern: Box<Expr>,
        negated: bool,
    },
    /// `CASE [<operand>] WHEN <cond> THEN <result> ... [ELSE <result>] END`
    Case {
        operand: Option<Box<Expr>>,
        conditions: Vec<Expr>,
        results: Vec<Expr>,
        else_result: Option<Box<Expr>>,
    },
}

impl AstParseable for Expr {
    fn parse(parser: &mut Parser) -> Result<Self> {
        Self::parse_subexpr(parser, 0)
    }
}

const PREC_OR: u8 = 5;
const PREC_AND: u8 = 10;
const PREC_NOT: u8 = 15;
const PREC_IS: u8 = 17;
const PREC_CMP: u8 = 20;
const PREC_ADD: u8 = 30;
const PREC_MUL: u8 = 40;
const PREC_UNARY: u8 = 50;

impl Expr {
    /// Column name if this expression is a (possibly qualified) column
    /// reference.
    pub fn column_name(&self) -> Option<&str> {
        match self {
            Expr::Ident(ident) => Some(ident.value.as_str()),
            Expr::CompoundIdent(idents) => idents.last().map(|ident| ident.value.as_str()),
            Expr::Nested(inner) => inner.column_name(),
            _ => None,
        }
    }

    fn parse_subexpr(parser: &mut Parser, precendence: u8) -> Result<Self> {
        let mut expr = Expr::parse_prefix(parser)?;

        loop {
            let next_precedence = Self::get_infix_precedence(parser);
            if precendence >= next_precedence {
                break;
            }

            expr = Self::parse_infix(parser, expr, next_precedence)?;
        }

        Ok(expr)
    }

    fn parse_prefix(parser: &mut Parser) -> Result<Self> {
        let tok = match parser.next() {
            Some(tok) => tok.token.clone(),
            None => {
                return Err(DbError::new(
                    "Expected prefix expression, found end of statement",
                ));
            }
        };

        let expr = match tok {
            Token::Word(w) => match w.keyword {
                Some(Keyword::TRUE) => Expr::Literal(Literal::Boolean(true)),
                Some(Keyword::FALSE) => Expr::Literal(Literal::Boolean(false)),
                Some(Keyword::NULL) => Expr::Literal(Literal::Null),
                Some(Keyword::NOT) => Expr::UnaryExpr {
                    op: UnaryOperator::Not,
                    expr: Box::new(Self::parse_subexpr(parser, PREC_NOT)?),
                },
                Some(Keyword::CASE) => Self::parse_case(parser)?,
                _ => {
                    let ident = Ident {
                        value: w.value,
                        quoted: w.quote.is_some(),
                    };
                    Self::parse_ident_or_function(parser, ident)?
                }
            },
            Token::SingleQuotedString(s) => Expr::Literal(Literal::SingleQuotedString(s)),
            Token::Number(s) => Expr::Literal(Literal::Number(s)),
            Token::LeftParen => {
                let inner = Expr::parse(parser)?;
                parser.expect_token(&Token::RightParen)?;
                Expr::Nested(Box::new(inner))
            }
            Token::Minus => Expr::UnaryExpr {
                op: UnaryOperator::Minus,
                expr: Box::new(Self::parse_subexpr(parser, PREC_UNARY)?),
            },
            Token::Plus => Expr::UnaryExpr {
                op: UnaryOperator::Plus,
                expr: Box::new(Self::parse_subexpr(parser, PREC_UNARY)?),
            },
            other => {
                return Err(DbError::new(format!(
                    "Unexpected token '{other:?}'. Expected expression."
                )));
            }
        };

        Ok(expr)
    }

    fn parse_ident_or_function(parser: &mut Parser, first: Ident) -> Result<Self> {
        let mut idents = vec![first];
        while parser.consume_token(&Token::Period) {
            idents.push(Ident::parse(parser)?);
        }

        if parser.consume_token(&Token::LeftParen) {
            let distinct = parser.parse_keyword(Keyword::DISTINCT);
            let args = if parser.consume_token(&Token::RightParen) {
                Vec::new()
            } else {
                let args = parser.parse_comma_separated(|parser| {
                    if parser.consume_token(&Token::Mul) {
                        Ok(FunctionArg::Wildcard)
                    } else {
                        Ok(FunctionArg::Expr(Expr::parse(parser)?))
                    }
                })?;
                parser.expect_token(&Token::RightParen)?;
                args
            };

            return Ok(Expr::Function(Function {
                reference: ObjectReference(idents),
                distinct,
                args,
            }));
        }

        if idents.len() == 1 {
            Ok(Expr::Ident(idents.remove(0)))
        } else {
            Ok(Expr::CompoundIdent(idents))
        }
    }

    fn parse_case(parser: &mut Parser) -> Result<Self> {
        let has_operand = !parser
            .peek()
            .is_some_and(|tok| tok.is_keyword(Keyword::WHEN));
        let operand = if has_operand {
            Some(Box::new(Expr::parse(parser)?))
        } else {
            None
        };

        let mut conditions = Vec::new();
        let mut results = Vec::new();
        while parser.parse_keyword(Keyword::WHEN) {
            conditions.push(Expr::parse(parser)?);
            parser.expect_keyword(Keyword::THEN)?;
            results.push(Expr::parse(parser)?);
        }
        if conditions.is_empty() {
            return Err(parser.expected("WHEN"));
        }

        let else_result = if parser.parse_keyword(Keyword::ELSE) {
            Some(Box::new(Expr::parse(parser)?))
        } else {
            None
        };
        parser.expect_keyword(Keyword::END)?;

        Ok(Expr::Case {
            operand,
            conditions,
            results,
            else_result,
        })
    }

    fn parse_infix(parser: &mut Parser, prefix: Expr, precendence: u8) -> Result<Self> {
        let tok = match parser.next() {
            Some(tok) => tok.token.clone(),
            None => {
                return Err(DbError::new(
                    "Expected infix expression, found end of statement",
                ));
            }
        };

        let bin_op: Option<BinaryOperator> = match &tok {
            Token::DoubleEq => Some(BinaryOperator::Eq),
            Token::Eq => Some(BinaryOperator::Eq),
            Token::Neq => Some(BinaryOperator::NotEq),
            Token::Gt => Some(BinaryOperator::Gt),
            Token::GtEq => Some(BinaryOperator::GtEq),
            Token::Lt => Some(BinaryOperator::Lt),
            Token::LtEq => Some(BinaryOperator::LtEq),
            Token::Plus => Some(BinaryOperator::Plus),
            Token::Minus => Some(BinaryOperator::Minus),
            Token::Mul => Some(BinaryOperator::Multiply),
            Token::Div => Some(BinaryOperator::Divide),
            Token::Mod => Some(BinaryOperator::Modulo),
            Token::Concat => Some(BinaryOperator::StringConcat),
            Token::Word(w) => match w.keyword {
                Some(Keyword::AND) => Some(BinaryOperator::And),
                Some(Keyword::OR) => Some(BinaryOperator::Or),
                _ => None,
            },
            _ => None,
        };

        if let Some(op) = bin_op {
            let right = Self::parse_subexpr(parser, precendence)?;
            return Ok(Expr::BinaryExpr {
                left: Box::new(prefix),
                op,
                right: Box::new(right),
            });
        }

        let keyword = match &tok {
            Token::Word(w) => w.keyword,
            _ => None,
        };

        match keyword {
            Some(Keyword::IS) => {
                let negated = parser.parse_keyword(Keyword::NOT);
                parser.expect_keyword(Keyword::NULL)?;
                Ok(Expr::IsNull {
                    expr: Box::new(prefix),
                    negated,
                })
            }
            Some(Keyword::NOT) => {
                if parser.parse_keyword(Keyword::IN) {
                    Self::parse_in_list(parser, prefix, true)
                } else if parser.parse_keyword(Keyword::LIKE) {
                    Self::parse_like(parser, prefix, true, precendence)
                } else {
                    Err(parser.expected("IN or LIKE after NOT"))
                }
            }
            Some(Keyword::IN) => Self::parse_in_list(parser, prefix, false),
            Some(Keyword::LIKE) => Self::parse_like(parser, prefix, false, precendence),
            _ => Err(DbError::new(format!(
                "Unexpected token '{tok:?}'. Expected an operator."
            ))),
        }
    }

    fn parse_in_list(parser: &mut Parser, prefix: Expr, negated: bool) -> Result<Self> {
        parser.expect_token(&Token::LeftParen)?;
        let list = parser.parse_comma_separated(Expr::parse)?;
        parser.expect_token(&Token::RightParen)?;
        Ok(Expr::InList {
            expr: Box::new(prefix),
            list,
            negated,
        })
    }

    fn parse_like(
        parser: &mut Parser,
        prefix: Expr,
        negated: bool,
        precendence: u8,
    ) -> Result<Self> {
        let pattern = Self::parse_subexpr(parser, precendence)?;
        Ok(Expr::Like {
            expr: Box::new(prefix),
            pattern: Box::new(pattern),
            negated,
        })
    }

    fn get_infix_precedence(parser: &Parser) -> u8 {
        let tok = match parser.peek() {
            Some(tok) => &tok.token,
            None => return 0,
        };

        match tok {
            Token::Eq
            | Token::DoubleEq
            | Token::Neq
            | Token::Lt
            | Token::LtEq
            | Token::Gt
            | Token::GtEq => PREC_CMP,
            Token::Plus | Token::Minus | Token::Concat => PREC_ADD,
            Token::Mul | Token::Div | Token::Mod => PREC_MUL,
            Token::Word(w) => match w.keyword {
                Some(Keyword::OR) => PREC_OR,
                Some(Keyword::AND) => PREC_AND,
                Some(Keyword::IS) => PREC_IS,
                Some(Keyword::IN) | Some(Keyword::LIKE) => PREC_CMP,
                Some(Keyword::NOT) => {
                    // Only `NOT IN` and `NOT LIKE` are infix.
                    let next_is_infix = parser.peek_nth(1).is_some_and(|tok| {
                        tok.is_keyword(Keyword::IN) || tok.is_keyword(Keyword::LIKE)
                    });
                    if next_is_infix { PREC_CMP } else { 0 }
                }
                _ => 0,
            },
            _ => 0,
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Ident(ident) => write!(f, "{ident}"),
            Expr::CompoundIdent(idents) => {
                let strings: Vec<_> = idents.iter().map(|i| i.value.as_str()).collect();
                write!(f, "{}", strings.join("."))
            }
            Expr::Literal(lit) => write!(f, "{lit}"),
            Expr::Nested(inner) => write!(f, "({inner})"),
            Expr::UnaryExpr { op, expr } => match op {
                UnaryOperator::Plus => write!(f, "+{expr}"),
                UnaryOperator::Minus => write!(f, "-{expr}"),
                UnaryOperator::Not => write!(f, "NOT {expr}"),
            },
            Expr::BinaryExpr { left, op, right } => write!(f, "{left} {op} {right}"),
            Expr::Function(func) => {
                write!(f, "{}(", func.name())?;
                if func.distinct {
                    write!(f, "DISTINCT ")?;
                }
                for (idx, arg) in func.args.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ", ")?;
                    }
                    match arg {
                        FunctionArg::Wildcard => write!(f, "*")?,
                        FunctionArg::Expr(expr) => write!(f, "{expr}")?,
                    }
                }
                write!(f, ")")
            }
            Expr::IsNull { expr, negated } => {
                if *negated {
                    write!(f, "{expr} IS NOT NULL")
                } else {
                    write!(f, "{expr} IS NULL")
                }
            }
            Expr::InList {
                expr,
                list,
                negated,
            } => {
                let items: Vec<_> = list.iter().map(|e| e.to_string()).collect();
                let not = if *negated { "NOT " } else { "" };
                write!(f, "{expr} {not}IN ({})", items.join(", "))
            }
            Expr::Like {
                expr,
                pattern,
                negated,
            } => {
                let not = if *negated { "NOT " } else { "" };
                write!(f, "{expr} {not}LIKE {pattern}")
            }
            Expr::Case {
                operand,
                conditions,
                results,
                else_result,
            } => {
                write!(f, "CASE")?;
                if let Some(operand) = operand {
                    write!(f, " {operand}")?;
                }
                for (cond, result) in conditions.iter().zip(results) {
                    write!(f, " WHEN {cond} THEN {result}")?;
                }
                if let Some(else_result) = else_result {
                    write!(f, " ELSE {else_result}")?;
                }
                write!(f, " END")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::testutil::parse_ast;

    fn ident(s: &str) -> Box<Expr> {
        Box::new(Expr::Ident(Ident::new(s)))
    }

    fn number(s: &str) -> Box<Expr> {
        Box::new(Expr::Literal(Literal::Number(s.to_string())))
    }

    #[test]
    fn and_binds_tighter_than_or() {
        let expr: Expr = parse_ast("a = 1 OR b = 2 AND c = 3").unwrap();
        let expected = Expr::BinaryExpr {
            left: Box::new(Expr::BinaryExpr {
                left: ident("a"),
                op: BinaryOperator::Eq,
                right: number("1"),
            }),
            op: BinaryOperator::Or,
            right: Box::new(Expr::BinaryExpr {
                left: Box::new(Expr::BinaryExpr {
                    left: ident("b"),
                    op: BinaryOperator::Eq,
                    right: number("2"),
                }),
                op: BinaryOperator::And,
                right: Box::new(Expr::BinaryExpr {
                    left: ident("c"),
                    op: BinaryOperator::Eq,
                    right: number("3"),
                }),
            }),
        };
        assert_eq!(expected, expr);
    }

    #[test]
    fn not_in_list() {
        let expr: Expr = parse_ast("country NOT IN ('US', 'CA')").unwrap();
        assert_eq!(
            Expr::InList {
                expr: ident("country"),
                list: vec![
                    Expr::Literal(Literal::SingleQuotedString("US".to_string())),
                    Expr::Literal(Literal::SingleQuotedString("CA".to_string())),
                ],
                negated: true,
            },
            expr
        );
    }

    #[test]
    fn is_not_null() {
        let expr: Expr = parse_ast("a IS NOT NULL AND b IS NULL").unwrap();
        assert_eq!("a IS NOT NULL AND b IS NULL", expr.to_string());
    }

    #[test]
    fn count_star_display_is_canonical() {
        let expr: Expr = parse_ast("count(*)").unwrap();
        assert_eq!("COUNT(*)", expr.to_string());
    }

    #[test]
    fn parameter_pseudo_function() {
        let expr: Expr = parse_ast("PARAMETER('region') = 'EU'").unwrap();
        match expr {
            Expr::BinaryExpr { left, op, right } => {
                assert_eq!(BinaryOperator::Eq, op);
                assert!(matches!(*left, Expr::Function(ref f) if f.name() == "PARAMETER"));
                assert_eq!(
                    Expr::Literal(Literal::SingleQuotedString("EU".to_string())),
                    *right
                );
            }
            other => panic!("unexpected expression: {other:?}"),
        }
    }

    #[test]
    fn case_expression() {
        let expr: Expr = parse_ast("CASE WHEN a > 1 THEN 'big' ELSE 'small' END").unwrap();
        assert_eq!("CASE WHEN a > 1 THEN 'big' ELSE 'small' END", expr.to_string());
    }

    #[test]
    fn arithmetic_precedence() {
        let expr: Expr = parse_ast("-a + b * 2").unwrap();
        assert_eq!("-a + b * 2", expr.to_string());
        match expr {
            Expr::BinaryExpr { op, .. } => assert_eq!(BinaryOperator::Plus, op),
            other => panic!("unexpected expression: {other:?}"),
        }
    }

    #[test]
    fn not_like() {
        let expr: Expr = parse_ast("name NOT LIKE 'A%'").unwrap();
        assert!(matches!(expr, Expr::Like { negated: true, .. }));
    }
}

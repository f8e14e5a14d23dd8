//! SQL parser for the SELECT subset accepted by data services. Heavily
//! inspired by sqlparser-rs.
pub mod ast;
pub mod keywords;
pub mod parser;
pub mod tokens;

use svcql_error::Result;

/// Parse a single SELECT statement.
pub fn parse(sql: &str) -> Result<ast::QueryNode> {
    let toks = tokens::Tokenizer::new(sql).tokenize()?;
    let mut parser = parser::Parser::with_tokens(toks);
    parser.parse_statement()
}

use svcql_error::{DbError, Result};

use crate::ast::{AstParseable, QueryNode};
use crate::keywords::Keyword;
use crate::tokens::{Token, TokenWithLocation};

#[derive(Debug)]
pub struct Parser {
    toks: Vec<TokenWithLocation>,
    /// Index of token we should process next.
    idx: usize,
}

impl Parser {
    pub fn with_tokens(toks: Vec<TokenWithLocation>) -> Self {
        Parser { toks, idx: 0 }
    }

    /// Parse a single statement. Only queries are supported.
    pub fn parse_statement(&mut self) -> Result<QueryNode> {
        let is_select = match self.peek() {
            Some(tok) => tok.is_keyword(Keyword::SELECT),
            None => return Err(DbError::new("Empty SQL statement")),
        };
        if !is_select {
            return Err(self.expected("SELECT statement"));
        }

        let query = QueryNode::parse(self)?;

        // Allow a single trailing semicolon.
        let _ = self.consume_token(&Token::SemiColon);

        if let Some(tok) = self.peek() {
            return Err(DbError::new(format!(
                "Unexpected trailing token {:?} at line {}, column {}",
                tok.token, tok.line, tok.col
            )));
        }

        Ok(query)
    }

    /// Parse a single keyword.
    pub(crate) fn parse_keyword(&mut self, keyword: Keyword) -> bool {
        let idx = self.idx;
        if let Some(tok) = self.next() {
            if tok.is_keyword(keyword) {
                return true;
            }
        }

        // Keyword doesn't match. Reset index and return.
        self.idx = idx;
        false
    }

    /// Parse an exact sequence of keywords.
    ///
    /// If the sequence doesn't match, idx is not changed, and false is
    /// returned.
    pub(crate) fn parse_keyword_sequence(&mut self, keywords: &[Keyword]) -> bool {
        let idx = self.idx;
        for keyword in keywords {
            if let Some(tok) = self.next() {
                if tok.is_keyword(*keyword) {
                    continue;
                }
            }

            // Keyword doesn't match. Reset index and return.
            self.idx = idx;
            return false;
        }
        true
    }

    pub(crate) fn expect_keyword(&mut self, keyword: Keyword) -> Result<()> {
        if self.parse_keyword(keyword) {
            return Ok(());
        }
        Err(self.expected(&format!("{keyword:?}")))
    }

    /// Consume the next token if it matches the given token.
    pub(crate) fn consume_token(&mut self, token: &Token) -> bool {
        let idx = self.idx;
        if let Some(tok) = self.next() {
            if &tok.token == token {
                return true;
            }
        }

        self.idx = idx;
        false
    }

    pub(crate) fn expect_token(&mut self, token: &Token) -> Result<()> {
        if self.consume_token(token) {
            return Ok(());
        }
        Err(self.expected(&format!("{token:?}")))
    }

    /// Parse a comma separated list of items, requiring at least one item.
    pub(crate) fn parse_comma_separated<T>(
        &mut self,
        mut f: impl FnMut(&mut Parser) -> Result<T>,
    ) -> Result<Vec<T>> {
        let mut items = vec![f(self)?];
        while self.consume_token(&Token::Comma) {
            items.push(f(self)?);
        }
        Ok(items)
    }

    /// Get the next non-whitespace token.
    pub(crate) fn next(&mut self) -> Option<&TokenWithLocation> {
        loop {
            if self.idx >= self.toks.len() {
                return None;
            }

            let tok = &self.toks[self.idx];
            self.idx += 1;

            if matches!(&tok.token, Token::Whitespace) {
                continue;
            }

            return Some(tok);
        }
    }

    /// Peek the next non-whitespace token without advancing.
    pub(crate) fn peek(&self) -> Option<&TokenWithLocation> {
        self.toks[self.idx.min(self.toks.len())..]
            .iter()
            .find(|tok| !matches!(tok.token, Token::Whitespace))
    }

    /// Peek the nth (zero-indexed) non-whitespace token without advancing.
    pub(crate) fn peek_nth(&self, n: usize) -> Option<&TokenWithLocation> {
        self.toks[self.idx.min(self.toks.len())..]
            .iter()
            .filter(|tok| !matches!(tok.token, Token::Whitespace))
            .nth(n)
    }

    /// Create an error describing what was expected at the current position.
    pub(crate) fn expected(&self, what: &str) -> DbError {
        match self.peek() {
            Some(tok) => DbError::new(format!(
                "Expected {what}, found {:?} at line {}, column {}",
                tok.token, tok.line, tok.col
            )),
            None => DbError::new(format!("Expected {what}, found end of statement")),
        }
    }
}

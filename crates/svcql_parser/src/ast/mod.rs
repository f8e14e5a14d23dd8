pub mod expr;
pub use expr::*;
pub mod query;
pub use query::*;

use std::fmt;

use svcql_error::{DbError, Result};

use crate::parser::Parser;
use crate::tokens::Token;

pub trait AstParseable: Sized {
    /// Parse an instance of Self from the provided parser.
    ///
    /// It's assumed that the parser is in the correct state for parsing Self,
    /// and if it isn't, an error should be returned.
    fn parse(parser: &mut Parser) -> Result<Self>;
}


#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ident {
    pub value: String,
    /// If the identifier was quoted, and so case should be preserved exactly.
    pub quoted: bool,
}

impl Ident {
    pub fn new(s: impl Into<String>) -> Self {
        Ident {
            value: s.into(),
            quoted: false,
        }
    }
}

impl AstParseable for Ident {
    fn parse(parser: &mut Parser) -> Result<Self> {
        let tok = match parser.next() {
            Some(tok) => &tok.token,
            None => {
                return Err(DbError::new(
                    "Expected identifier, found end of statement",
                ));
            }
        };

        match tok {
            Token::Word(w) => Ok(Ident {
                value: w.value.clone(),
                quoted: w.quote.is_some(),
            }),
            Token::SingleQuotedString(s) => Ok(Ident {
                value: s.clone(),
                quoted: true,
            }),
            other => Err(DbError::new(format!(
                "Unexpected token: {other:?}. Expected an identifier.",
            ))),
        }
    }
}

impl fmt::Display for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectReference(pub Vec<Ident>);

impl ObjectReference {
    /// Create an object from an iterator of strings.
    pub fn from_strings<S>(strings: impl IntoIterator<Item = S>) -> Self
    where
        S: Into<String>,
    {
        ObjectReference(strings.into_iter().map(Ident::new).collect())
    }

    pub fn base(&self) -> Result<&Ident> {
        match self.0.last() {
            Some(ident) => Ok(ident),
            None => Err(DbError::new("Empty object reference")),
        }
    }
}

impl AstParseable for ObjectReference {
    fn parse(parser: &mut Parser) -> Result<Self> {
        let mut idents = vec![Ident::parse(parser)?];
        // Check if the next token is a period for possible compound
        // identifiers.
        while parser.consume_token(&Token::Period) {
            idents.push(Ident::parse(parser)?);
        }
        Ok(ObjectReference(idents))
    }
}

impl fmt::Display for ObjectReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let strings: Vec<_> = self.0.iter().map(|ident| ident.value.as_str()).collect();
        write!(f, "{}", strings.join("."))
    }
}

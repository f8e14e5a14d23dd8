use std::iter::Peekable;
use std::str::Chars;

use svcql_error::{DbError, Result};

use crate::keywords::{Keyword, keyword_from_str};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// A keyword or an identifier.
    Word(Word),
    /// 'string'
    SingleQuotedString(String),
    /// Unparsed number literal.
    Number(String),
    Whitespace,
    LeftParen,
    RightParen,
    Comma,
    Period,
    SemiColon,
    /// '*'
    Mul,
    Plus,
    Minus,
    Div,
    Mod,
    Eq,
    DoubleEq,
    /// '<>' or '!='
    Neq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    /// '||'
    Concat,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Word {
    pub value: String,
    /// Quote character if the word was quoted.
    pub quote: Option<char>,
    /// Keyword this word represents. Never set for quoted words.
    pub keyword: Option<Keyword>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenWithLocation {
    pub token: Token,
    pub line: usize,
    pub col: usize,
}

impl TokenWithLocation {
    pub fn is_keyword(&self, keyword: Keyword) -> bool {
        match &self.token {
            Token::Word(w) => w.keyword == Some(keyword),
            _ => false,
        }
    }
}

#[derive(Debug)]
pub struct Tokenizer<'a> {
    query: &'a str,
    chars: Peekable<Chars<'a>>,
    line: usize,
    col: usize,
}

impl<'a> Tokenizer<'a> {
    pub fn new(query: &'a str) -> Self {
        Tokenizer {
            query,
            chars: query.chars().peekable(),
            line: 0,
            col: 0,
        }
    }

    pub fn tokenize(mut self) -> Result<Vec<TokenWithLocation>> {
        let mut toks = Vec::new();
        loop {
            let (line, col) = (self.line, self.col);
            let token = match self.next_token()? {
                Some(token) => token,
                None => break,
            };
            toks.push(TokenWithLocation { token, line, col });
        }
        Ok(toks)
    }

    fn next_char(&mut self) -> Option<char> {
        let c = self.chars.next()?;
        if c == '\n' {
            self.line += 1;
            self.col = 0;
        } else {
            self.col += 1;
        }
        Some(c)
    }

    fn next_token(&mut self) -> Result<Option<Token>> {
        let c = match self.chars.peek() {
            Some(c) => *c,
            None => return Ok(None),
        };

        let tok = match c {
            c if c.is_whitespace() => {
                while matches!(self.chars.peek(), Some(c) if c.is_whitespace()) {
                    self.next_char();
                }
                Token::Whitespace
            }
            '\'' => {
                self.next_char();
                Token::SingleQuotedString(self.take_quoted('\'')?)
            }
            '"' | '`' => {
                self.next_char();
                let value = self.take_quoted(c)?;
                Token::Word(Word {
                    value,
                    quote: Some(c),
                    keyword: None,
                })
            }
            c if c.is_ascii_digit() => Token::Number(self.take_number()),
            '.' => {
                self.next_char();
                match self.chars.peek() {
                    Some(d) if d.is_ascii_digit() => {
                        let rest = self.take_number();
                        Token::Number(format!(".{rest}"))
                    }
                    _ => Token::Period,
                }
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut value = String::new();
                while let Some(&c) = self.chars.peek() {
                    if c.is_alphanumeric() || c == '_' || c == '$' {
                        value.push(c);
                        self.next_char();
                    } else {
                        break;
                    }
                }
                let keyword = keyword_from_str(&value);
                Token::Word(Word {
                    value,
                    quote: None,
                    keyword,
                })
            }
            '-' => {
                self.next_char();
                if self.chars.peek() == Some(&'-') {
                    // Line comment.
                    while let Some(c) = self.next_char() {
                        if c == '\n' {
                            break;
                        }
                    }
                    Token::Whitespace
                } else {
                    Token::Minus
                }
            }
            _ => {
                self.next_char();
                match c {
                    '(' => Token::LeftParen,
                    ')' => Token::RightParen,
                    ',' => Token::Comma,
                    ';' => Token::SemiColon,
                    '*' => Token::Mul,
                    '+' => Token::Plus,
                    '/' => Token::Div,
                    '%' => Token::Mod,
                    '=' => match self.chars.peek() {
                        Some('=') => {
                            self.next_char();
                            Token::DoubleEq
                        }
                        _ => Token::Eq,
                    },
                    '!' => match self.chars.peek() {
                        Some('=') => {
                            self.next_char();
                            Token::Neq
                        }
                        _ => return Err(self.unexpected('!')),
                    },
                    '<' => match self.chars.peek() {
                        Some('=') => {
                            self.next_char();
                            Token::LtEq
                        }
                        Some('>') => {
                            self.next_char();
                            Token::Neq
                        }
                        _ => Token::Lt,
                    },
                    '>' => match self.chars.peek() {
                        Some('=') => {
                            self.next_char();
                            Token::GtEq
                        }
                        _ => Token::Gt,
                    },
                    '|' => match self.chars.peek() {
                        Some('|') => {
                            self.next_char();
                            Token::Concat
                        }
                        _ => return Err(self.unexpected('|')),
                    },
                    other => return Err(self.unexpected(other)),
                }
            }
        };

        Ok(Some(tok))
    }

    /// Take characters until the closing quote. A doubled quote character
    /// escapes the quote.
    fn take_quoted(&mut self, quote: char) -> Result<String> {
        let mut s = String::new();
        loop {
            match self.next_char() {
                Some(c) if c == quote => {
                    if self.chars.peek() == Some(&quote) {
                        self.next_char();
                        s.push(quote);
                    } else {
                        return Ok(s);
                    }
                }
                Some(c) => s.push(c),
                None => {
                    return Err(DbError::new(format!(
                        "Unterminated quoted string in '{}'",
                        self.query
                    )));
                }
            }
        }
    }

    fn take_number(&mut self) -> String {
        let mut s = String::new();
        let mut seen_exponent = false;
        while let Some(&c) = self.chars.peek() {
            let accept = match c {
                '0'..='9' | '.' => true,
                'e' | 'E' if !seen_exponent => {
                    seen_exponent = true;
                    true
                }
                _ => false,
            };
            if !accept {
                break;
            }
            s.push(c);
            self.next_char();
        }
        s
    }

    fn unexpected(&self, c: char) -> DbError {
        DbError::new(format!(
            "Unexpected character '{c}' at line {}, column {}",
            self.line, self.col
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(s: &str) -> Vec<Token> {
        Tokenizer::new(s)
            .tokenize()
            .unwrap()
            .into_iter()
            .map(|t| t.token)
            .filter(|t| *t != Token::Whitespace)
            .collect()
    }

    #[test]
    fn tokenize_operators() {
        assert_eq!(
            vec![
                Token::LtEq,
                Token::Neq,
                Token::Neq,
                Token::GtEq,
                Token::Concat,
                Token::DoubleEq
            ],
            tokens("<= <> != >= || ==")
        );
    }

    #[test]
    fn tokenize_escaped_string() {
        assert_eq!(
            vec![Token::SingleQuotedString("it's".to_string())],
            tokens("'it''s'")
        );
    }

    #[test]
    fn tokenize_quoted_word_is_not_keyword() {
        let toks = tokens("\"select\" select");
        match &toks[0] {
            Token::Word(w) => {
                assert_eq!(None, w.keyword);
                assert_eq!(Some('"'), w.quote);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(&toks[1], Token::Word(w) if w.keyword == Some(Keyword::SELECT)));
    }

    #[test]
    fn tokenize_numbers() {
        assert_eq!(
            vec![
                Token::Number("12".to_string()),
                Token::Number("1.5".to_string()),
                Token::Number(".5".to_string()),
                Token::Number("1e3".to_string()),
            ],
            tokens("12 1.5 .5 1e3")
        );
    }

    #[test]
    fn line_comment_is_whitespace() {
        assert_eq!(vec![Token::Mul], tokens("-- hello\n*"));
    }

    #[test]
    fn unterminated_string_errors() {
        Tokenizer::new("'abc").tokenize().unwrap_err();
    }
}

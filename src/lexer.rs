//! Statement splitter shared by the configuration file and the lease
//! database.
//!
//! Both files are a sequence of statements. A statement is a run of
//! tokens ended by `;`, or followed by a `{ ... }` block of nested
//! statements. `#` starts a comment that runs to the end of the line.

use std::{net::Ipv4Addr, time::Duration};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("line {line}: {message}")]
pub struct ParseError {
    pub line: usize,
    pub message: String,
}

impl ParseError {
    pub fn new(line: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    /// The token as written, quotes and escapes included.
    pub raw: String,
    pub quoted: bool,
}

impl Token {
    /// The token with quoting and escapes removed.
    pub fn text(&self) -> String {
        if !self.quoted {
            return self.raw.clone();
        }
        match crate::v4::pretty::unquote(&self.raw) {
            Some(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            None => self.raw.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    pub line: usize,
    pub tokens: Vec<Token>,
    pub block: Option<Vec<Statement>>,
}

impl Statement {
    pub fn keyword(&self) -> &str {
        self.tokens.first().map(|t| t.raw.as_str()).unwrap_or("")
    }

    /// The raw text of the tokens from `from` on, joined by spaces.
    pub fn rest(&self, from: usize) -> String {
        self.tokens
            .iter()
            .skip(from)
            .map(|t| t.raw.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError::new(self.line, message)
    }

    /// The one argument of a `keyword value;` statement.
    pub fn single(&self) -> Result<&Token, ParseError> {
        match self.tokens.as_slice() {
            [_, value] => Ok(value),
            _ => Err(self.error(format!("{}: expecting one value", self.keyword()))),
        }
    }

    pub fn address(&self) -> Result<Ipv4Addr, ParseError> {
        let value = self.single()?;
        value
            .raw
            .parse()
            .map_err(|_| self.error(format!("expecting IP address, found '{}'", value.raw)))
    }

    pub fn seconds(&self) -> Result<Duration, ParseError> {
        let value = self.single()?;
        value
            .raw
            .parse()
            .map(Duration::from_secs)
            .map_err(|_| self.error(format!("expecting number of seconds, found '{}'", value.raw)))
    }
}

enum Lexeme {
    Token(Token),
    Open,
    Close,
    Semi,
}

struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    line: usize,
}

impl<'a> Lexer<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            chars: text.chars().peekable(),
            line: 1,
        }
    }

    fn next(&mut self) -> Result<Option<(usize, Lexeme)>, ParseError> {
        loop {
            match self.chars.peek() {
                None => return Ok(None),
                Some('\n') => {
                    self.line += 1;
                    self.chars.next();
                }
                Some(c) if c.is_whitespace() => {
                    self.chars.next();
                }
                Some('#') => {
                    while self.chars.next_if(|c| *c != '\n').is_some() {}
                }
                Some(_) => break,
            }
        }

        let line = self.line;
        let lexeme = match self.chars.next() {
            Some('{') => Lexeme::Open,
            Some('}') => Lexeme::Close,
            Some(';') => Lexeme::Semi,
            Some('"') => {
                let mut raw = String::from('"');
                loop {
                    match self.chars.next() {
                        None | Some('\n') => {
                            return Err(ParseError::new(line, "unterminated string"));
                        }
                        Some('\\') => {
                            raw.push('\\');
                            match self.chars.next() {
                                Some(c) => raw.push(c),
                                None => return Err(ParseError::new(line, "unterminated string")),
                            }
                        }
                        Some('"') => {
                            raw.push('"');
                            break;
                        }
                        Some(c) => raw.push(c),
                    }
                }
                Lexeme::Token(Token { raw, quoted: true })
            }
            Some(first) => {
                let mut raw = String::from(first);
                while let Some(c) = self
                    .chars
                    .next_if(|c| !c.is_whitespace() && !matches!(c, '{' | '}' | ';' | '"' | '#'))
                {
                    raw.push(c);
                }
                Lexeme::Token(Token { raw, quoted: false })
            }
            None => return Ok(None),
        };
        Ok(Some((line, lexeme)))
    }
}

/// Splits `text` into statements.
pub fn parse_statements(text: &str) -> Result<Vec<Statement>, ParseError> {
    let mut lexer = Lexer::new(text);
    let statements = parse_block(&mut lexer, false)?;
    Ok(statements)
}

fn parse_block(lexer: &mut Lexer<'_>, nested: bool) -> Result<Vec<Statement>, ParseError> {
    let mut statements = Vec::new();
    let mut current: Option<Statement> = None;

    while let Some((line, lexeme)) = lexer.next()? {
        match lexeme {
            Lexeme::Token(token) => current
                .get_or_insert_with(|| Statement {
                    line,
                    tokens: Vec::new(),
                    block: None,
                })
                .tokens
                .push(token),
            Lexeme::Semi => {
                if let Some(statement) = current.take() {
                    statements.push(statement);
                }
            }
            Lexeme::Open => {
                let Some(mut statement) = current.take() else {
                    return Err(ParseError::new(line, "block without a keyword"));
                };
                statement.block = Some(parse_block(lexer, true)?);
                statements.push(statement);
            }
            Lexeme::Close if nested => {
                if let Some(statement) = current {
                    return Err(statement.error("expecting ';'"));
                }
                return Ok(statements);
            }
            Lexeme::Close => return Err(ParseError::new(line, "unexpected '}'")),
        }
    }

    if nested {
        return Err(ParseError::new(lexer.line, "expecting '}'"));
    }
    if let Some(statement) = current {
        return Err(statement.error("expecting ';'"));
    }
    Ok(statements)
}

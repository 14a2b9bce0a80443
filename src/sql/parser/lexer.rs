//! SQL Lexer - Tokenizes SQL input text into a stream of tokens

use std::{fmt::Display, iter::Peekable, str::Chars};

use crate::error::{Error, Result};

/// Represents a single lexical token in the SQL input
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    /// SQL reserved keyword
    Keyword(Keyword),
    /// Identifier such as sheet name or column name (backquotes removed)
    Ident(String),
    /// String literal, single or double quoted
    String(String),
    /// Numeric literal (integer or floating-point)
    Number(String),
    OpenParen,
    CloseParen,
    Comma,
    Semicolon,
    Period,
    Asterisk,
    Plus,
    Minus,
    Slash,
    Equal,
    NotEqual,
    GreaterThan,
    GreaterThanOrEqual,
    LessThan,
    LessThanOrEqual,
}

impl Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Token::Keyword(keyword) => f.write_str(keyword.to_str()),
            Token::Ident(ident) => f.write_str(ident),
            // Rendered as a literal the predicate evaluator can unquote again
            Token::String(v) => write!(f, "'{}'", v.replace('\'', "''")),
            Token::Number(n) => f.write_str(n),
            Token::OpenParen => f.write_str("("),
            Token::CloseParen => f.write_str(")"),
            Token::Comma => f.write_str(","),
            Token::Semicolon => f.write_str(";"),
            Token::Period => f.write_str("."),
            Token::Asterisk => f.write_str("*"),
            Token::Plus => f.write_str("+"),
            Token::Minus => f.write_str("-"),
            Token::Slash => f.write_str("/"),
            Token::Equal => f.write_str("="),
            Token::NotEqual => f.write_str("!="),
            Token::GreaterThan => f.write_str(">"),
            Token::GreaterThanOrEqual => f.write_str(">="),
            Token::LessThan => f.write_str("<"),
            Token::LessThanOrEqual => f.write_str("<="),
        }
    }
}

/// SQL reserved keywords
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Keyword {
    // DML keywords
    Select,
    Distinct,
    From,
    Where,
    Insert,
    Into,
    Values,
    Update,
    Set,
    Delete,
    // Clause keywords
    Group,
    Order,
    By,
    Having,
    Asc,
    Desc,
    Limit,
    Offset,
    As,
    // Predicate keywords
    And,
    Or,
    Not,
    Like,
    In,
    Is,
    // Literal keywords
    True,
    False,
    Null,
}

impl Keyword {
    /// Attempts to parse a string as a keyword (case-insensitive)
    pub fn from_str(ident: &str) -> Option<Keyword> {
        Some(match ident.to_uppercase().as_ref() {
            "SELECT" => Keyword::Select,
            "DISTINCT" => Keyword::Distinct,
            "FROM" => Keyword::From,
            "WHERE" => Keyword::Where,
            "INSERT" => Keyword::Insert,
            "INTO" => Keyword::Into,
            "VALUES" => Keyword::Values,
            "UPDATE" => Keyword::Update,
            "SET" => Keyword::Set,
            "DELETE" => Keyword::Delete,
            "GROUP" => Keyword::Group,
            "ORDER" => Keyword::Order,
            "BY" => Keyword::By,
            "HAVING" => Keyword::Having,
            "ASC" => Keyword::Asc,
            "DESC" => Keyword::Desc,
            "LIMIT" => Keyword::Limit,
            "OFFSET" => Keyword::Offset,
            "AS" => Keyword::As,
            "AND" => Keyword::And,
            "OR" => Keyword::Or,
            "NOT" => Keyword::Not,
            "LIKE" => Keyword::Like,
            "IN" => Keyword::In,
            "IS" => Keyword::Is,
            "TRUE" => Keyword::True,
            "FALSE" => Keyword::False,
            "NULL" => Keyword::Null,
            _ => return None,
        })
    }

    /// Returns the uppercase string representation of the keyword
    pub fn to_str(&self) -> &'static str {
        match self {
            Keyword::Select => "SELECT",
            Keyword::Distinct => "DISTINCT",
            Keyword::From => "FROM",
            Keyword::Where => "WHERE",
            Keyword::Insert => "INSERT",
            Keyword::Into => "INTO",
            Keyword::Values => "VALUES",
            Keyword::Update => "UPDATE",
            Keyword::Set => "SET",
            Keyword::Delete => "DELETE",
            Keyword::Group => "GROUP",
            Keyword::Order => "ORDER",
            Keyword::By => "BY",
            Keyword::Having => "HAVING",
            Keyword::Asc => "ASC",
            Keyword::Desc => "DESC",
            Keyword::Limit => "LIMIT",
            Keyword::Offset => "OFFSET",
            Keyword::As => "AS",
            Keyword::And => "AND",
            Keyword::Or => "OR",
            Keyword::Not => "NOT",
            Keyword::Like => "LIKE",
            Keyword::In => "IN",
            Keyword::Is => "IS",
            Keyword::True => "TRUE",
            Keyword::False => "FALSE",
            Keyword::Null => "NULL",
        }
    }
}

impl Display for Keyword {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.to_str())
    }
}

/// SQL lexical analyzer (lexer/tokenizer)
pub struct Lexer<'a> {
    iter: Peekable<Chars<'a>>,
}

impl<'a> Iterator for Lexer<'a> {
    type Item = Result<Token>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.scan() {
            Ok(Some(token)) => Some(Ok(token)),
            Ok(None) => self
                .iter
                .peek()
                .map(|c| Err(Error::Parse(format!("[Lexer] Unexpected character {}", c)))),
            Err(err) => Some(Err(err)),
        }
    }
}

impl<'a> Lexer<'a> {
    pub fn new(sql_text: &'a str) -> Self {
        Self {
            iter: sql_text.chars().peekable(),
        }
    }

    /// Consumes the next character if it satisfies the predicate
    fn next_if<F: Fn(char) -> bool>(&mut self, predicate: F) -> Option<char> {
        self.iter.peek().filter(|&c| predicate(*c))?;
        self.iter.next()
    }

    /// Consumes consecutive characters while they satisfy the predicate
    fn next_while<F: Fn(char) -> bool>(&mut self, predicate: F) -> Option<String> {
        let mut value = String::new();
        while let Some(c) = self.next_if(&predicate) {
            value.push(c);
        }
        Some(value).filter(|v| !v.is_empty())
    }

    fn erase_whitespace(&mut self) {
        self.next_while(|c| c.is_whitespace());
    }

    fn scan(&mut self) -> Result<Option<Token>> {
        self.erase_whitespace();
        match self.iter.peek() {
            Some('\'') => self.scan_quoted('\'').map(|s| Some(Token::String(s))),
            Some('"') => self.scan_quoted('"').map(|s| Some(Token::String(s))),
            Some('`') => self.scan_quoted('`').map(|s| Some(Token::Ident(s))),
            Some(c) if c.is_ascii_digit() => Ok(self.scan_number()),
            Some(c) if c.is_alphabetic() || *c == '_' => Ok(self.scan_ident()),
            Some(_) => Ok(self.scan_symbol()),
            None => Ok(None),
        }
    }

    /// Scans text enclosed in `quote`; a doubled quote stands for one literal quote
    fn scan_quoted(&mut self, quote: char) -> Result<String> {
        self.iter.next();
        let mut val = String::new();
        loop {
            match self.iter.next() {
                Some(c) if c == quote => {
                    if self.next_if(|n| n == quote).is_some() {
                        val.push(quote);
                    } else {
                        break;
                    }
                }
                Some(c) => val.push(c),
                None => return Err(Error::Parse("[Lexer] Unexpected end of string".into())),
            }
        }
        Ok(val)
    }

    /// Scans a numeric literal (integer or floating-point)
    fn scan_number(&mut self) -> Option<Token> {
        let mut val = self.next_while(|c| c.is_ascii_digit())?;
        if let Some(sep) = self.next_if(|c| c == '.') {
            val.push(sep);
            while let Some(c) = self.next_if(|c| c.is_ascii_digit()) {
                val.push(c);
            }
        }
        Some(Token::Number(val))
    }

    /// Scans an identifier or keyword; identifiers keep their case
    fn scan_ident(&mut self) -> Option<Token> {
        let val = self.next_while(|c| c.is_alphanumeric() || c == '_')?;
        Some(Keyword::from_str(&val).map_or(Token::Ident(val), Token::Keyword))
    }

    /// Scans a one- or two-character symbol token
    fn scan_symbol(&mut self) -> Option<Token> {
        let c = *self.iter.peek()?;
        let token = match c {
            '*' => Token::Asterisk,
            '(' => Token::OpenParen,
            ')' => Token::CloseParen,
            ',' => Token::Comma,
            ';' => Token::Semicolon,
            '.' => Token::Period,
            '+' => Token::Plus,
            '-' => Token::Minus,
            '/' => Token::Slash,
            '=' => Token::Equal,
            '!' | '<' | '>' => {
                self.iter.next();
                return match (c, self.next_if(|n| n == '=' || n == '>')) {
                    ('!', Some('=')) => Some(Token::NotEqual),
                    ('<', Some('=')) => Some(Token::LessThanOrEqual),
                    ('<', Some('>')) => Some(Token::NotEqual),
                    ('<', None) => Some(Token::LessThan),
                    ('>', Some('=')) => Some(Token::GreaterThanOrEqual),
                    ('>', None) => Some(Token::GreaterThan),
                    // `!` alone, `>>`, `!>`
                    _ => None,
                };
            }
            _ => return None,
        };
        self.iter.next();
        Some(token)
    }
}

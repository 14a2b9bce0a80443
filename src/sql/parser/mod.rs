use std::iter::Peekable;

use crate::error::{Error, Result};
use crate::sql::parser::ast::{Aggregate, AggFunc, OrderDirection, SelectItem, TableRef};
use crate::sql::parser::lexer::{Keyword, Lexer, Token};
use crate::sql::types::Value;

pub mod ast;
pub mod ddl;
mod lexer;

pub use ast::{ParsedQuery, SqlKind, Statement};

/// Parses one statement. Workbook and sheet lifecycle statements are matched first, then
/// everything else goes through the token parser.
pub fn parse(sql: &str) -> Result<ParsedQuery> {
    if sql.trim().trim_end_matches(';').trim().is_empty() {
        return Err(Error::Parse("[Parser] Empty statement".into()));
    }
    let statement = match ddl::parse(sql) {
        Some(result) => result?,
        None => Parser::new(sql).parse()?,
    };
    Ok(ParsedQuery {
        sql: sql.trim().to_string(),
        statement,
    })
}

/// Returns the error text for an invalid statement, None when it parses
pub fn validate(sql: &str) -> Option<String> {
    parse(sql).err().map(|err| err.to_string())
}

/// Statement kind from the leading keywords, without a full parse
pub fn classify(sql: &str) -> SqlKind {
    if let Some(kind) = ddl::classify(sql) {
        return kind;
    }
    match Lexer::new(sql).next() {
        Some(Ok(Token::Keyword(Keyword::Select))) => SqlKind::Select,
        Some(Ok(Token::Keyword(Keyword::Insert))) => SqlKind::Insert,
        Some(Ok(Token::Keyword(Keyword::Update))) => SqlKind::Update,
        Some(Ok(Token::Keyword(Keyword::Delete))) => SqlKind::Delete,
        _ => SqlKind::Unknown,
    }
}

/// SQL Parser - Converts tokens of a DML statement into a `Statement`
pub struct Parser<'a> {
    lexer: Peekable<Lexer<'a>>,
}

impl<'a> Parser<'a> {
    /// Creates a new parser for the given SQL input
    pub fn new(input: &'a str) -> Self {
        Parser {
            lexer: Lexer::new(input).peekable(),
        }
    }

    /// Parses the input; a trailing semicolon is optional but nothing may follow it
    pub fn parse(&mut self) -> Result<Statement> {
        let stmt = self.parse_statement()?;
        self.next_if_token(Token::Semicolon);
        if let Some(token) = self.peek()? {
            return Err(Error::Parse(format!("[Parser] Unexpected token {}", token)));
        }
        Ok(stmt)
    }

    /// Parses a statement based on the first token
    fn parse_statement(&mut self) -> Result<Statement> {
        match self.peek()? {
            Some(Token::Keyword(Keyword::Select)) => self.parse_select(),
            Some(Token::Keyword(Keyword::Insert)) => self.parse_insert(),
            Some(Token::Keyword(Keyword::Update)) => self.parse_update(),
            Some(Token::Keyword(Keyword::Delete)) => self.parse_delete(),
            Some(t) => Err(Error::Parse(format!("[Parser] Unexpected token {}", t))),
            None => Err(Error::Parse("[Parser] Unexpected end of input".into())),
        }
    }

    fn parse_select(&mut self) -> Result<Statement> {
        self.next_expect(Token::Keyword(Keyword::Select))?;
        let distinct = self.next_if_token(Token::Keyword(Keyword::Distinct)).is_some();

        let mut items = Vec::new();
        loop {
            items.push(self.parse_select_item()?);
            if self.next_if_token(Token::Comma).is_none() {
                break;
            }
        }

        self.next_expect(Token::Keyword(Keyword::From))?;
        let table = self.parse_table_ref(true)?;
        let predicate = self.parse_where_clause()?;

        let mut group_by = Vec::new();
        if self.next_if_token(Token::Keyword(Keyword::Group)).is_some() {
            self.next_expect(Token::Keyword(Keyword::By))?;
            loop {
                group_by.push(self.next_column()?);
                if self.next_if_token(Token::Comma).is_none() {
                    break;
                }
            }
        }

        let (having, having_aggregates) =
            if self.next_if_token(Token::Keyword(Keyword::Having)).is_some() {
                let tokens = self.collect_clause()?;
                (Some(render(&tokens)), aggregates_in(&tokens))
            } else {
                (None, Vec::new())
            };

        let mut order_by = Vec::new();
        if self.next_if_token(Token::Keyword(Keyword::Order)).is_some() {
            self.next_expect(Token::Keyword(Keyword::By))?;
            loop {
                let name = self.next_column()?;
                // ORDER BY may name an aggregate, which sorts by its synthetic key
                let key = match self.parse_aggregate_call(&name)? {
                    Some(aggregate) => aggregate.key(),
                    None => name,
                };
                let direction = match self.next_if(|t| {
                    matches!(t, Token::Keyword(Keyword::Asc | Keyword::Desc))
                }) {
                    Some(Token::Keyword(Keyword::Desc)) => OrderDirection::Desc,
                    _ => OrderDirection::Asc,
                };
                order_by.push((key, direction));
                if self.next_if_token(Token::Comma).is_none() {
                    break;
                }
            }
        }

        let (mut limit, mut offset) = (None, None);
        if self.next_if_token(Token::Keyword(Keyword::Limit)).is_some() {
            let first = self.next_number()?;
            // MySQL form: LIMIT offset, count
            if self.next_if_token(Token::Comma).is_some() {
                offset = Some(first);
                limit = Some(self.next_number()?);
            } else {
                limit = Some(first);
            }
        }
        if self.next_if_token(Token::Keyword(Keyword::Offset)).is_some() {
            offset = Some(self.next_number()?);
        }

        Ok(Statement::Select(ast::Select {
            table,
            distinct,
            items,
            predicate,
            group_by,
            having,
            having_aggregates,
            order_by,
            limit,
            offset,
        }))
    }

    fn parse_select_item(&mut self) -> Result<SelectItem> {
        if self.next_if_token(Token::Asterisk).is_some() {
            return Ok(SelectItem::Wildcard);
        }
        let name = self.next_ident()?;
        if self.next_if_token(Token::Period).is_some() {
            // t.* or t.col; the qualifier only names the single table in FROM
            if self.next_if_token(Token::Asterisk).is_some() {
                return Ok(SelectItem::Wildcard);
            }
            let column = self.next_ident()?;
            let alias = self.parse_alias()?;
            return Ok(SelectItem::Column { name: column, alias });
        }
        if let Some(aggregate) = self.parse_aggregate_call(&name)? {
            let alias = self.parse_alias()?;
            return Ok(SelectItem::Aggregate { aggregate, alias });
        }
        let alias = self.parse_alias()?;
        Ok(SelectItem::Column { name, alias })
    }

    /// Parses `(col)` or `(*)` after a function name; None when no parenthesis follows
    fn parse_aggregate_call(&mut self, name: &str) -> Result<Option<Aggregate>> {
        if self.next_if_token(Token::OpenParen).is_none() {
            return Ok(None);
        }
        let func = AggFunc::from_str(name)
            .ok_or_else(|| Error::Parse(format!("[Parser] Unsupported function {}", name)))?;
        let column = if self.next_if_token(Token::Asterisk).is_some() {
            if func != AggFunc::Count {
                return Err(Error::Parse(format!("[Parser] {}(*) is not supported", func.to_str())));
            }
            None
        } else {
            Some(self.next_column()?)
        };
        self.next_expect(Token::CloseParen)?;
        Ok(Some(Aggregate { func, column }))
    }

    /// `[AS] alias`
    fn parse_alias(&mut self) -> Result<Option<String>> {
        if self.next_if_token(Token::Keyword(Keyword::As)).is_some() {
            return Ok(Some(self.next_ident()?));
        }
        Ok(self.next_if(|t| matches!(t, Token::Ident(_))).and_then(|t| match t {
            Token::Ident(alias) => Some(alias),
            _ => None,
        }))
    }

    /// `[workbook.]sheet`, optionally followed by an alias
    fn parse_table_ref(&mut self, allow_alias: bool) -> Result<TableRef> {
        let first = self.next_ident()?;
        let mut table = if self.next_if_token(Token::Period).is_some() {
            TableRef {
                workbook: Some(first),
                name: self.next_ident()?,
                alias: None,
            }
        } else {
            TableRef::new(first)
        };
        if allow_alias {
            table.alias = self.parse_alias()?;
        }
        Ok(table)
    }

    fn parse_insert(&mut self) -> Result<Statement> {
        self.next_expect(Token::Keyword(Keyword::Insert))?;
        self.next_expect(Token::Keyword(Keyword::Into))?;
        let table = self.parse_table_ref(false)?;

        // Check if specific columns are specified
        let columns = if self.next_if_token(Token::OpenParen).is_some() {
            let mut cols = Vec::new();
            loop {
                cols.push(self.next_column()?);
                match self.next()? {
                    Token::CloseParen => break,
                    Token::Comma => {}
                    token => {
                        return Err(Error::Parse(format!("[Parser] Unexpected token {}", token)));
                    }
                }
            }
            Some(cols)
        } else {
            None
        };

        if let Some(Token::Keyword(Keyword::Select)) = self.peek()? {
            return Err(Error::Parse("[Parser] INSERT ... SELECT is not supported".into()));
        }
        self.next_expect(Token::Keyword(Keyword::Values))?;

        // Multiple value rows: INSERT INTO t VALUES (1,2),(3,4)
        let mut rows = Vec::new();
        loop {
            self.next_expect(Token::OpenParen)?;
            let mut row = Vec::new();
            loop {
                row.push(self.parse_literal()?);
                match self.next()? {
                    Token::CloseParen => break,
                    Token::Comma => {}
                    token => {
                        return Err(Error::Parse(format!("[Parser] Unexpected token {}", token)));
                    }
                }
            }
            if let Some(cols) = &columns {
                if cols.len() != row.len() {
                    return Err(Error::Cardinality(format!(
                        "row {} has {} values for {} columns ({})",
                        rows.len() + 1,
                        row.len(),
                        cols.len(),
                        cols.join(", ")
                    )));
                }
            }
            rows.push(row);
            if self.next_if_token(Token::Comma).is_none() {
                break;
            }
        }
        Ok(Statement::Insert(ast::Insert { table, columns, rows }))
    }

    fn parse_update(&mut self) -> Result<Statement> {
        self.next_expect(Token::Keyword(Keyword::Update))?;
        let table = self.parse_table_ref(false)?;
        self.next_expect(Token::Keyword(Keyword::Set))?;

        let mut assignments: Vec<(String, String)> = Vec::new();
        loop {
            let column = self.next_column()?;
            self.next_expect(Token::Equal)?;
            let mut tokens = Vec::new();
            while let Some(token) = self.peek()? {
                if matches!(
                    token,
                    Token::Comma | Token::Semicolon | Token::Keyword(Keyword::Where)
                ) {
                    break;
                }
                tokens.push(self.next()?);
            }
            if tokens.is_empty() {
                return Err(Error::Parse(format!("[Parser] Missing value for column {}", column)));
            }
            if assignments.iter().any(|(c, _)| c.eq_ignore_ascii_case(&column)) {
                return Err(Error::Parse(format!(
                    "[Parser] Duplicate column {} for update",
                    column
                )));
            }
            assignments.push((column, render(&tokens)));
            if self.next_if_token(Token::Comma).is_none() {
                break;
            }
        }
        Ok(Statement::Update(ast::Update {
            table,
            assignments,
            predicate: self.parse_where_clause()?,
        }))
    }

    fn parse_delete(&mut self) -> Result<Statement> {
        self.next_expect(Token::Keyword(Keyword::Delete))?;
        self.next_expect(Token::Keyword(Keyword::From))?;
        let table = self.parse_table_ref(false)?;
        Ok(Statement::Delete(ast::Delete {
            table,
            predicate: self.parse_where_clause()?,
        }))
    }

    /// A single literal inside VALUES
    fn parse_literal(&mut self) -> Result<Value> {
        Ok(match self.next()? {
            Token::Number(n) => Value::parse_literal(&n),
            Token::Minus => match self.next()? {
                Token::Number(n) => Value::parse_literal(&format!("-{}", n)),
                t => return Err(Error::Parse(format!("[Parser] Unexpected token {} after -", t))),
            },
            Token::String(s) => Value::String(s),
            Token::Keyword(Keyword::True) => Value::Boolean(true),
            Token::Keyword(Keyword::False) => Value::Boolean(false),
            Token::Keyword(Keyword::Null) => Value::Null,
            t => {
                return Err(Error::Parse(format!(
                    "[Parser] Unexpected expression token {}",
                    t
                )));
            }
        })
    }

    /// WHERE text up to the next clause keyword, or None without WHERE
    fn parse_where_clause(&mut self) -> Result<Option<String>> {
        if self.next_if_token(Token::Keyword(Keyword::Where)).is_none() {
            return Ok(None);
        }
        let tokens = self.collect_clause()?;
        Ok(Some(render(&tokens)))
    }

    /// Collects predicate tokens until a clause keyword, a semicolon or the end
    fn collect_clause(&mut self) -> Result<Vec<Token>> {
        let mut tokens = Vec::new();
        while let Some(token) = self.peek()? {
            if matches!(
                token,
                Token::Semicolon
                    | Token::Keyword(
                        Keyword::Group
                            | Keyword::Having
                            | Keyword::Order
                            | Keyword::Limit
                            | Keyword::Offset
                    )
            ) {
                break;
            }
            tokens.push(self.next()?);
        }
        if tokens.is_empty() {
            return Err(Error::Parse("[Parser] Empty predicate".into()));
        }
        Ok(tokens)
    }

    /// A column name, dropping any `table.` qualifier
    fn next_column(&mut self) -> Result<String> {
        let name = self.next_ident()?;
        if self.next_if_token(Token::Period).is_some() {
            return self.next_ident();
        }
        Ok(name)
    }

    fn next_number(&mut self) -> Result<usize> {
        match self.next()? {
            Token::Number(n) => n
                .parse::<usize>()
                .map_err(|_| Error::Parse(format!("[Parser] Expected a row count, got {}", n))),
            token => Err(Error::Parse(format!(
                "[Parser] Expected number, got token {}",
                token
            ))),
        }
    }

    /// Peeks at the next token
    fn peek(&mut self) -> Result<Option<Token>> {
        self.lexer.peek().cloned().transpose()
    }

    /// Consumes and returns the next token
    fn next(&mut self) -> Result<Token> {
        self.lexer
            .next()
            .unwrap_or_else(|| Err(Error::Parse("[Parser] Unexpected end of input".into())))
    }

    /// Expects and consumes an identifier
    fn next_ident(&mut self) -> Result<String> {
        match self.next()? {
            Token::Ident(ident) => Ok(ident),
            token => Err(Error::Parse(format!(
                "[Parser] Expected ident, got token {}",
                token
            ))),
        }
    }

    /// Expects a specific token, returns error if different
    fn next_expect(&mut self, expect: Token) -> Result<()> {
        let token = self.next()?;
        if token != expect {
            return Err(Error::Parse(format!(
                "[Parser] Expected token {}, got {}",
                expect, token
            )));
        }
        Ok(())
    }

    /// Consumes next token if it satisfies the predicate
    fn next_if<F: Fn(&Token) -> bool>(&mut self, predicate: F) -> Option<Token> {
        self.peek().unwrap_or(None).filter(|t| predicate(t))?;
        self.next().ok()
    }

    /// Consumes next token if it matches the given token
    fn next_if_token(&mut self, token: Token) -> Option<Token> {
        self.next_if(|t| t == &token)
    }
}

/// Re-joins predicate or expression tokens into the text the evaluator reads.
///
/// Tokens are separated by one space, except around `.`, inside parentheses, before commas,
/// between a function name and its `(`, and between a unary minus and its number.
/// Aggregate names are upper-cased so they line up with synthetic keys.
fn render(tokens: &[Token]) -> String {
    let mut out = String::new();
    for (i, token) in tokens.iter().enumerate() {
        let prev = i.checked_sub(1).map(|p| &tokens[p]);
        let glue = match (prev, token) {
            (None, _) => true,
            (_, Token::CloseParen | Token::Comma | Token::Period) => true,
            (Some(Token::OpenParen | Token::Period), _) => true,
            (Some(Token::Ident(_)), Token::OpenParen) => true,
            (Some(Token::Minus), Token::Number(_)) => is_unary(tokens, i - 1),
            _ => false,
        };
        if !glue {
            out.push(' ');
        }
        match token {
            Token::Ident(name)
                if matches!(tokens.get(i + 1), Some(Token::OpenParen))
                    && AggFunc::from_str(name).is_some() =>
            {
                out.push_str(&name.to_uppercase())
            }
            token => out.push_str(&token.to_string()),
        }
    }
    out
}

/// A minus is unary at the start or after anything that cannot end an operand
fn is_unary(tokens: &[Token], pos: usize) -> bool {
    match pos.checked_sub(1).map(|p| &tokens[p]) {
        None => true,
        Some(Token::Ident(_) | Token::Number(_) | Token::String(_) | Token::CloseParen) => false,
        Some(Token::Keyword(Keyword::True | Keyword::False | Keyword::Null)) => false,
        Some(_) => true,
    }
}

/// Aggregate calls written in a HAVING clause
fn aggregates_in(tokens: &[Token]) -> Vec<Aggregate> {
    let mut found: Vec<Aggregate> = Vec::new();
    for window in tokens.windows(4) {
        let aggregate = match window {
            [Token::Ident(f), Token::OpenParen, Token::Asterisk, Token::CloseParen] => {
                AggFunc::from_str(f).map(|func| Aggregate { func, column: None })
            }
            [Token::Ident(f), Token::OpenParen, Token::Ident(c), Token::CloseParen] => {
                AggFunc::from_str(f).map(|func| Aggregate {
                    func,
                    column: Some(c.clone()),
                })
            }
            _ => None,
        };
        if let Some(aggregate) = aggregate {
            if !found.contains(&aggregate) {
                found.push(aggregate);
            }
        }
    }
    found
}

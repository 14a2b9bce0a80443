//! Row predicates and UPDATE right-hand sides
//!
//! The predicate language is flat: comparison clauses joined by `AND`/`OR`, split on `AND`
//! first and then on `OR`, so `a AND b OR c` reads as `a AND (b OR c)`. Column references
//! are resolved once when the predicate is compiled; evaluating a row only compares values.

use std::{borrow::Cow, cmp::Ordering};

use regex::Regex;

use crate::{
    error::{Error, Result},
    sql::types::{Value, strip_quotes, unquote_literal},
};

/// Comparison operators, in the order clauses are searched for them
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Op {
    GreaterThanOrEqual,
    LessThanOrEqual,
    NotEqual,
    GreaterThan,
    LessThan,
    Equal,
}

impl Op {
    const SYMBOLS: [(&'static str, Op); 7] = [
        (">=", Op::GreaterThanOrEqual),
        ("<=", Op::LessThanOrEqual),
        ("<>", Op::NotEqual),
        ("!=", Op::NotEqual),
        (">", Op::GreaterThan),
        ("<", Op::LessThan),
        ("=", Op::Equal),
    ];

    fn accepts(&self, ord: Ordering) -> bool {
        match self {
            Op::GreaterThanOrEqual => ord != Ordering::Less,
            Op::LessThanOrEqual => ord != Ordering::Greater,
            Op::NotEqual => ord != Ordering::Equal,
            Op::GreaterThan => ord == Ordering::Greater,
            Op::LessThan => ord == Ordering::Less,
            Op::Equal => ord == Ordering::Equal,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Clause {
    Compare {
        column: usize,
        op: Op,
        literal: String,
    },
    Like {
        column: usize,
        pattern: Regex,
        negated: bool,
    },
    In {
        column: usize,
        items: Vec<String>,
        negated: bool,
    },
    IsNull {
        column: usize,
        negated: bool,
    },
    /// A clause of no known shape; matches every row
    Unrecognized(String),
}

/// A compiled WHERE or HAVING predicate: every group must match, and a group matches
/// when any of its clauses does
#[derive(Debug, Clone)]
pub struct Predicate {
    groups: Vec<Vec<Clause>>,
}

impl Predicate {
    /// Compiles predicate text. `resolve` maps a column reference to its position in the
    /// rows the predicate will see. With `strict`, clauses of unknown shape are rejected
    /// instead of matching everything.
    pub fn compile(text: &str, resolve: impl Fn(&str) -> Option<usize>, strict: bool) -> Result<Self> {
        let mut groups = Vec::new();
        for conjunct in split_keyword(text, "AND") {
            let mut group = Vec::new();
            for disjunct in split_keyword(conjunct, "OR") {
                let clause = Clause::compile(strip_parens(disjunct.trim()), &resolve)?;
                if let Clause::Unrecognized(text) = &clause {
                    if strict {
                        return Err(Error::Parse(format!("unrecognized condition: {}", text)));
                    }
                    log::warn!("unrecognized condition {} matches every row", text);
                }
                group.push(clause);
            }
            groups.push(group);
        }
        Ok(Self { groups })
    }

    /// Compiles against a list of column names
    pub fn for_columns(text: &str, columns: &[String], strict: bool) -> Result<Self> {
        Self::compile(text, |name| resolve_name(columns, name), strict)
    }

    pub fn matches(&self, row: &[Value]) -> bool {
        self.groups
            .iter()
            .all(|group| group.iter().any(|clause| clause.matches(row)))
    }

    /// `(column, literal)` when the whole predicate is one `col = literal` clause
    pub fn equality(&self) -> Option<(usize, &str)> {
        match self.groups.as_slice() {
            [group] => match group.as_slice() {
                [Clause::Compare {
                    column,
                    op: Op::Equal,
                    literal,
                }] => Some((*column, literal.as_str())),
                _ => None,
            },
            _ => None,
        }
    }

    /// `(column, low, high)` when every group is one ordered comparison of the same column
    /// against a number, as in `n >= 2 AND n < 5`. Bounds are inclusive; an open side is
    /// infinite.
    pub fn numeric_range(&self) -> Option<(usize, f64, f64)> {
        let mut range: Option<(usize, f64, f64)> = None;
        for group in &self.groups {
            let [Clause::Compare { column, op, literal }] = group.as_slice() else {
                return None;
            };
            let bound = literal.trim().parse::<f64>().ok().filter(|b| !b.is_nan())?;
            let (low, high) = match op {
                Op::GreaterThan | Op::GreaterThanOrEqual => (bound, f64::INFINITY),
                Op::LessThan | Op::LessThanOrEqual => (f64::NEG_INFINITY, bound),
                _ => return None,
            };
            range = match range {
                None => Some((*column, low, high)),
                Some((c, l, h)) if c == *column => Some((c, l.max(low), h.min(high))),
                Some(_) => return None,
            };
        }
        range
    }
}

/// Case-insensitive lookup, retrying without a `t.` qualifier
pub fn resolve_name(columns: &[String], name: &str) -> Option<usize> {
    let find = |n: &str| columns.iter().position(|c| c.eq_ignore_ascii_case(n));
    find(name).or_else(|| match name.split_once('.') {
        Some((_, col)) if !name.contains('(') => find(col),
        _ => None,
    })
}

impl Clause {
    fn compile(text: &str, resolve: &impl Fn(&str) -> Option<usize>) -> Result<Self> {
        if let Some((left, op, right)) = find_symbol(text) {
            let column = match resolve_column(left, resolve)? {
                Some(column) => column,
                None => return Ok(Clause::Unrecognized(text.to_string())),
            };
            return Ok(Clause::Compare {
                column,
                op,
                literal: unquote(right).into_owned(),
            });
        }

        for (keyword, negated) in [(" NOT LIKE ", true), (" LIKE ", false)] {
            if let Some(at) = find_outside_quotes(text, keyword) {
                let Some(column) = resolve_column(&text[..at], resolve)? else {
                    break;
                };
                let pattern = like_regex(&unquote(&text[at + keyword.len()..]))?;
                return Ok(Clause::Like {
                    column,
                    pattern,
                    negated,
                });
            }
        }
        for (keyword, negated) in [(" NOT IN ", true), (" IN ", false)] {
            if let Some(at) = find_outside_quotes(text, keyword) {
                let list = text[at + keyword.len()..].trim();
                let Some(inner) = list.strip_prefix('(').and_then(|l| l.strip_suffix(')')) else {
                    break;
                };
                let Some(column) = resolve_column(&text[..at], resolve)? else {
                    break;
                };
                let items = split_outside_quotes(inner, ',')
                    .into_iter()
                    .map(|item| unquote(item).into_owned())
                    .collect();
                return Ok(Clause::In {
                    column,
                    items,
                    negated,
                });
            }
        }
        for (suffix, negated) in [(" IS NOT NULL", true), (" IS NULL", false)] {
            let split = text.len().checked_sub(suffix.len());
            let tail = split.and_then(|at| text.get(at..));
            if let (Some(at), Some(tail)) = (split, tail) {
                if !tail.eq_ignore_ascii_case(suffix) {
                    continue;
                }
                let left = &text[..at];
                if let Some(column) = resolve_column(left, resolve)? {
                    return Ok(Clause::IsNull { column, negated });
                }
                break;
            }
        }
        Ok(Clause::Unrecognized(text.to_string()))
    }

    fn matches(&self, row: &[Value]) -> bool {
        let value = |column: &usize| row.get(*column).unwrap_or(&Value::Null);
        match self {
            Clause::Compare {
                column,
                op,
                literal,
            } => compare(value(column), *op, literal),
            Clause::Like {
                column,
                pattern,
                negated,
            } => match value(column) {
                // NULL never matches LIKE, negated or not
                Value::Null => false,
                v => pattern.is_match(&v.to_string()) != *negated,
            },
            Clause::In {
                column,
                items,
                negated,
            } => {
                let v = value(column);
                let found = items.iter().any(|item| match v {
                    Value::Null => item.eq_ignore_ascii_case("null"),
                    v => compare(v, Op::Equal, item),
                });
                found != *negated
            }
            Clause::IsNull { column, negated } => value(column).is_null() != *negated,
            Clause::Unrecognized(_) => true,
        }
    }
}

/// Compares a row value with literal text: numerically when both sides are numbers,
/// otherwise by their text
fn compare(value: &Value, op: Op, literal: &str) -> bool {
    if value.is_null() {
        let null_literal = literal.is_empty() || literal.eq_ignore_ascii_case("null");
        return op == Op::Equal && null_literal;
    }
    if let (Some(a), Ok(b)) = (value.as_f64(), literal.trim().parse::<f64>()) {
        return a.partial_cmp(&b).is_some_and(|ord| op.accepts(ord));
    }
    op.accepts(value.to_string().as_str().cmp(literal))
}

/// Left side of a clause as a column position. None for text that is not a column
/// reference at all; an identifier naming no column is a reference error.
fn resolve_column(left: &str, resolve: &impl Fn(&str) -> Option<usize>) -> Result<Option<usize>> {
    let left = left.trim();
    let name = left
        .strip_prefix('`')
        .and_then(|l| l.strip_suffix('`'))
        .unwrap_or(left);
    if let Some(column) = resolve(name) {
        return Ok(Some(column));
    }
    let identifier = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_alphanumeric() || matches!(c, '_' | '.' | '(' | ')' | '*'));
    if identifier {
        return Err(Error::Reference(format!("unknown column {}", name)));
    }
    Ok(None)
}

/// First comparison symbol outside quotes, checking the longer symbols first
fn find_symbol(text: &str) -> Option<(&str, Op, &str)> {
    Op::SYMBOLS.iter().find_map(|(symbol, op)| {
        find_outside_quotes(text, symbol).map(|at| (&text[..at], *op, &text[at + symbol.len()..]))
    })
}

/// Byte offset of `needle` (ASCII, case-insensitive) outside quoted literals
fn find_outside_quotes(text: &str, needle: &str) -> Option<usize> {
    let mut quote = None;
    for (i, c) in text.char_indices() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if c == '\'' || c == '"' => quote = Some(c),
            None if text
                .get(i..i + needle.len())
                .is_some_and(|w| w.eq_ignore_ascii_case(needle)) =>
            {
                return Some(i);
            }
            None => {}
        }
    }
    None
}

fn split_outside_quotes(text: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut quote = None;
    let mut start = 0;
    for (i, c) in text.char_indices() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if c == '\'' || c == '"' => quote = Some(c),
            None if c == sep => {
                parts.push(text[start..i].trim());
                start = i + c.len_utf8();
            }
            None => {}
        }
    }
    parts.push(text[start..].trim());
    parts
}

/// Splits at a whitespace-delimited, case-insensitive keyword outside quotes
fn split_keyword<'a>(text: &'a str, keyword: &str) -> Vec<&'a str> {
    let mut parts = Vec::new();
    let mut quote = None;
    let mut start = 0;
    let bytes = text.as_bytes();
    for (i, c) in text.char_indices() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if c == '\'' || c == '"' => quote = Some(c),
            None => {
                let end = i + keyword.len();
                let at_keyword = i > 0
                    && bytes[i - 1].is_ascii_whitespace()
                    && text.get(i..end).is_some_and(|w| w.eq_ignore_ascii_case(keyword))
                    && bytes.get(end).is_some_and(|b| b.is_ascii_whitespace());
                if at_keyword {
                    parts.push(&text[start..i]);
                    start = end;
                }
            }
        }
    }
    parts.push(&text[start..]);
    parts
}

/// Drops grouping parentheses left over from splitting, keeping an `IN (...)` list intact
fn strip_parens(mut text: &str) -> &str {
    loop {
        let opens = text.matches('(').count();
        let closes = text.matches(')').count();
        text = if text.starts_with('(') && opens > closes {
            text[1..].trim()
        } else if text.ends_with(')') && closes > opens {
            text[..text.len() - 1].trim()
        } else if text.starts_with('(') && text.ends_with(')') && wraps(text) {
            text[1..text.len() - 1].trim()
        } else {
            return text;
        };
    }
}

/// Whether the first `(` closes at the last character
fn wraps(text: &str) -> bool {
    let mut depth = 0;
    for (i, c) in text.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return i == text.len() - 1;
                }
            }
            _ => {}
        }
    }
    false
}

fn unquote(text: &str) -> Cow<'_, str> {
    let text = text.trim();
    unquote_literal(text).unwrap_or(Cow::Borrowed(text))
}

/// `%` matches any run of characters and `_` exactly one; everything else is literal
fn like_regex(pattern: &str) -> Result<Regex> {
    let mut re = String::from("(?is)^");
    for c in pattern.chars() {
        match c {
            '%' => re.push_str(".*"),
            '_' => re.push('.'),
            c => re.push_str(&regex::escape(c.encode_utf8(&mut [0; 4]))),
        }
    }
    re.push('$');
    Ok(Regex::new(&re)?)
}

/// Right-hand side of one `SET column = expr`
#[derive(Debug, Clone, PartialEq)]
pub enum Assignment {
    /// A constant, already parsed
    Literal(Value),
    /// `column op number`, evaluated against the row's current value of `column`
    Arithmetic {
        column: usize,
        op: char,
        operand: f64,
        text: String,
    },
}

impl Assignment {
    pub fn compile(expr: &str, resolve: impl Fn(&str) -> Option<usize>) -> Result<Self> {
        let expr = expr.trim();
        if strip_quotes(expr).is_none() {
            if let Some((name, op, operand)) = split_arithmetic(expr) {
                let column = resolve(name)
                    .ok_or_else(|| Error::Reference(format!("unknown column {}", name)))?;
                return Ok(Assignment::Arithmetic {
                    column,
                    op,
                    operand,
                    text: expr.to_string(),
                });
            }
        }
        Ok(Assignment::Literal(Value::parse_literal(expr)))
    }

    /// New value for a row. Division by zero keeps the current value, and a current value
    /// that is not a number stores the expression text unevaluated.
    pub fn evaluate(&self, row: &[Value]) -> Result<Value> {
        let (column, op, operand, text) = match self {
            Assignment::Literal(value) => return Ok(value.clone()),
            Assignment::Arithmetic {
                column,
                op,
                operand,
                text,
            } => (column, op, operand, text),
        };

        let current = row.get(*column).unwrap_or(&Value::Null);
        let number = match current {
            Value::Null => return Ok(Value::number(*operand)),
            v => match v.as_f64().or_else(|| v.to_string().trim().parse().ok()) {
                Some(n) => n,
                None => {
                    log::warn!("{} is not a number, storing {} as text", current, text);
                    return Ok(Value::String(text.clone()));
                }
            },
        };
        let result = match op {
            '+' => number + operand,
            '-' => number - operand,
            '*' => number * operand,
            '/' if *operand == 0.0 => {
                log::warn!("division by zero in {}, value left unchanged", text);
                return Ok(current.clone());
            }
            '/' => number / operand,
            _ => return Err(Error::Internal(format!("unknown operator {}", op))),
        };
        if !result.is_finite() {
            return Err(Error::Internal(format!("{} overflows", text)));
        }
        Ok(Value::number(result))
    }
}

/// `name op number` with `op` one of `+ - * /`
fn split_arithmetic(expr: &str) -> Option<(&str, char, f64)> {
    let (at, op) = expr
        .char_indices()
        .skip(1)
        .find(|(_, c)| matches!(c, '+' | '-' | '*' | '/'))?;
    let name = expr[..at].trim();
    let operand = expr[at + 1..].trim().parse::<f64>().ok()?;
    let identifier = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '.' || c == ' ');
    if !identifier || name.parse::<f64>().is_ok() {
        return None;
    }
    Some((name, op, operand))
}

#[cfg(test)]
mod tests {
    use super::{Assignment, Predicate};
    use crate::{
        error::{Error, Result},
        sql::types::Value,
    };

    fn columns() -> Vec<String> {
        vec!["colA".into(), "colB".into(), "name".into(), "note".into()]
    }

    fn row(a: &str, b: Value, name: Value) -> Vec<Value> {
        vec![Value::String(a.into()), b, name, Value::Null]
    }

    fn matches(text: &str, row: &[Value]) -> Result<bool> {
        Ok(Predicate::for_columns(text, &columns(), false)?.matches(row))
    }

    #[test]
    fn test_and_of_comparisons() -> Result<()> {
        let text = "colA = 'x' AND colB > 5";
        assert!(matches(text, &row("x", Value::Integer(6), Value::Null))?);
        assert!(!matches(text, &row("x", Value::Integer(5), Value::Null))?);
        assert!(!matches(text, &row("y", Value::Integer(9), Value::Null))?);
        // numeric comparison, not lexical: "10" > "5" numerically
        assert!(matches(text, &row("x", Value::Float(10.0), Value::Null))?);
        // lexical fallback when the row value is text
        assert!(!matches("colA > 'y'", &row("x", Value::Null, Value::Null))?);
        assert!(matches("colA <> 'y'", &row("x", Value::Null, Value::Null))?);
        Ok(())
    }

    #[test]
    fn test_and_binds_looser_than_or() -> Result<()> {
        let text = "colB = 1 and colA = 'a' or colA = 'b'";
        assert!(matches(text, &row("b", Value::Integer(1), Value::Null))?);
        assert!(!matches(text, &row("b", Value::Integer(2), Value::Null))?);
        assert!(matches("(colA = 'a' OR colA = 'b') AND colB = 1", &row("a", Value::Integer(1), Value::Null))?);
        // AND inside quotes is data
        assert!(matches("colA = 'salt AND pepper'", &row("salt AND pepper", Value::Null, Value::Null))?);
        Ok(())
    }

    #[test]
    fn test_embedded_quotes() -> Result<()> {
        let r = row("O'Brien", Value::Null, Value::Null);
        assert!(matches("colA = 'O''Brien'", &r)?);
        assert!(matches("colA LIKE 'O''%'", &r)?);
        assert!(matches("colA IN ('x', 'O''Brien')", &r)?);
        assert!(!matches("colA = 'O''''Brien'", &r)?);
        assert_eq!(
            Predicate::for_columns("colA = 'it''s'", &columns(), false)?.equality(),
            Some((0, "it's"))
        );
        Ok(())
    }

    #[test]
    fn test_numeric_range() -> Result<()> {
        let range = |text: &str| Ok::<_, Error>(Predicate::for_columns(text, &columns(), false)?.numeric_range());
        assert_eq!(range("colB >= 2 AND colB < 5")?, Some((1, 2.0, 5.0)));
        assert_eq!(range("colB > 2")?, Some((1, 2.0, f64::INFINITY)));
        assert_eq!(range("colB <= 7 AND colB <= 3")?, Some((1, f64::NEG_INFINITY, 3.0)));
        assert_eq!(range("colB >= 2 AND name < 5")?, None);
        assert_eq!(range("colB >= 2 OR colB < 1")?, None);
        assert_eq!(range("colB >= 'b'")?, None);
        assert_eq!(range("colB = 2")?, None);
        Ok(())
    }

    #[test]
    fn test_null_like_in() -> Result<()> {
        let r = row("Alice", Value::Integer(3), Value::Null);
        assert!(matches("name = null", &r)?);
        assert!(matches("name = ''", &r)?);
        assert!(!matches("name != 'x'", &r)?);
        assert!(!matches("name LIKE '%'", &r)?);
        assert!(!matches("name NOT LIKE 'x%'", &r)?);
        assert!(matches("name IS NULL", &r)?);
        assert!(!matches("colA IS NULL", &r)?);

        assert!(matches("colA LIKE 'a_i%'", &r)?);
        assert!(!matches("colA LIKE 'li%'", &r)?);
        assert!(matches("colA LIKE '%c.'", &row("c.", Value::Null, Value::Null))?);
        assert!(!matches("colA LIKE '%c.'", &row("cx", Value::Null, Value::Null))?);

        assert!(matches("colB IN (1, 2, 3)", &r)?);
        assert!(matches("colA IN ('Bob', 'Alice')", &r)?);
        assert!(matches("colA NOT IN ('Bob')", &r)?);
        assert!(matches("name IN (null, 1)", &r)?);
        Ok(())
    }

    #[test]
    fn test_unrecognized_and_unknown() -> Result<()> {
        let r = row("a", Value::Integer(1), Value::Null);
        // fail-open by default
        assert!(matches("colB BETWEEN 5 AND 9", &r)?);
        assert!(matches("colB - 1 > 2", &r)?);
        assert!(matches!(
            Predicate::for_columns("colB BETWEEN 5", &columns(), true),
            Err(Error::Parse(_))
        ));
        assert!(matches!(
            Predicate::for_columns("missing = 1", &columns(), false),
            Err(Error::Reference(_))
        ));
        assert_eq!(
            Predicate::for_columns("t.colB = 4", &columns(), false)?.equality(),
            Some((1, "4"))
        );
        assert_eq!(Predicate::for_columns("colB >= 4", &columns(), false)?.equality(), None);
        Ok(())
    }

    #[test]
    fn test_assignments() -> Result<()> {
        let resolve = |n: &str| columns().iter().position(|c| c.eq_ignore_ascii_case(n));
        let r = vec![Value::String("x".into()), Value::Integer(1), Value::Null, Value::Null];

        assert_eq!(Assignment::compile("colB + 1", resolve)?.evaluate(&r)?, Value::Integer(2));
        assert_eq!(Assignment::compile("colB * 2.5", resolve)?.evaluate(&r)?, Value::Float(2.5));
        assert_eq!(Assignment::compile("colB / 0", resolve)?.evaluate(&r)?, Value::Integer(1));
        assert_eq!(
            Assignment::compile("colA - 1", resolve)?.evaluate(&r)?,
            Value::String("colA - 1".into())
        );
        assert_eq!(Assignment::compile("name + 4", resolve)?.evaluate(&r)?, Value::Integer(4));
        assert_eq!(Assignment::compile("'b'", resolve)?.evaluate(&r)?, Value::String("b".into()));
        assert_eq!(Assignment::compile("-3", resolve)?.evaluate(&r)?, Value::Integer(-3));
        assert!(Assignment::compile("nope + 1", resolve).is_err());
        Ok(())
    }
}

//! Workbook and sheet lifecycle statements
//!
//! These do not fit the token grammar (names may contain `.` and `-`, option bodies are free
//! form), so they are recognized by anchored, case-insensitive patterns before the token
//! parser runs.

use std::sync::LazyLock;

use regex::Regex;

use super::ast::{ColumnDef, SqlKind, Statement, TableRef};
use crate::{
    error::{Error, Result},
    sql::types::{DataType, strip_quotes},
};

static CREATE_WORKBOOK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)^\s*CREATE\s+WORKBOOK\s+([\w.-]+)\s*(?:\((.*)\))?\s*;?\s*$")
        .expect("valid regex")
});
static CREATE_SHEET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)^\s*CREATE\s+SHEET\s+([\w.-]+)\s*(?:\((.*)\))?\s*;?\s*$")
        .expect("valid regex")
});
static USE_WORKBOOK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)^\s*USE\s+WORKBOOK\s+([\w.-]+)\s*;?\s*$").expect("valid regex")
});
static DROP_WORKBOOK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)^\s*DROP\s+WORKBOOK\s+([\w.-]+)\s*;?\s*$").expect("valid regex")
});
static DROP_SHEET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)^\s*DROP\s+SHEET\s+([\w.-]+)\s*;?\s*$").expect("valid regex")
});
static SHOW_WORKBOOKS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)^\s*SHOW\s+WORKBOOKS\s*;?\s*$").expect("valid regex")
});
static SHOW_SHEETS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)^\s*SHOW\s+SHEETS(?:\s+FROM\s+([\w.-]+))?\s*;?\s*$")
        .expect("valid regex")
});
static INDEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)^\s*(CREATE|DROP)\s+INDEX\s+ON\s+([\w.-]+)\s*\(\s*`?([^`()]+?)`?\s*\)\s*;?\s*$")
        .expect("valid regex")
});
/// Start of a `key=` pair; used both to split options and to tell options from columns
static OPTION_KEY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*[A-Za-z_]\w*\s*=").expect("valid regex")
});

/// Kind of a lifecycle statement, or None if `sql` has none of their shapes.
/// Only the leading keywords are inspected.
pub fn classify(sql: &str) -> Option<SqlKind> {
    let words: Vec<String> = sql
        .split_whitespace()
        .take(3)
        .map(|w| w.trim_end_matches(';').to_uppercase())
        .collect();
    let word = |i: usize| words.get(i).map(String::as_str).unwrap_or("");
    Some(match (word(0), word(1)) {
        ("CREATE", "WORKBOOK") => SqlKind::CreateWorkbook,
        ("CREATE", "SHEET") => SqlKind::CreateSheet,
        ("CREATE", "INDEX") => SqlKind::CreateIndex,
        ("USE", "WORKBOOK") => SqlKind::UseWorkbook,
        ("DROP", "WORKBOOK") => SqlKind::DropWorkbook,
        ("DROP", "SHEET") => SqlKind::DropSheet,
        ("DROP", "INDEX") => SqlKind::DropIndex,
        ("SHOW", "WORKBOOKS") => SqlKind::ShowWorkbooks,
        ("SHOW", "SHEETS") => SqlKind::ShowSheets,
        _ => return None,
    })
}

/// Parses a lifecycle statement. Returns None when `sql` is not one, so the caller can hand
/// it to the token parser.
pub fn parse(sql: &str) -> Option<Result<Statement>> {
    let kind = classify(sql)?;
    let statement = match kind {
        SqlKind::CreateWorkbook => parse_create_workbook(sql),
        SqlKind::CreateSheet => parse_create_sheet(sql),
        SqlKind::UseWorkbook => captures(&USE_WORKBOOK, sql, kind)
            .map(|c| Statement::UseWorkbook { name: c[0].clone() }),
        SqlKind::DropWorkbook => captures(&DROP_WORKBOOK, sql, kind)
            .map(|c| Statement::DropWorkbook { name: c[0].clone() }),
        SqlKind::DropSheet => captures(&DROP_SHEET, sql, kind).map(|c| {
            let (workbook, name) = split_qualified(&c[0]);
            Statement::DropSheet { workbook, name }
        }),
        SqlKind::ShowWorkbooks => captures(&SHOW_WORKBOOKS, sql, kind).map(|_| Statement::ShowWorkbooks),
        SqlKind::ShowSheets => captures(&SHOW_SHEETS, sql, kind).map(|c| Statement::ShowSheets {
            workbook: c.first().cloned().filter(|w| !w.is_empty()),
        }),
        SqlKind::CreateIndex | SqlKind::DropIndex => parse_index(sql),
        _ => return None,
    };
    Some(statement)
}

/// Runs an anchored pattern, returning the capture groups (empty string for unmatched ones)
fn captures(regex: &Regex, sql: &str, kind: SqlKind) -> Result<Vec<String>> {
    let caps = regex
        .captures(sql)
        .ok_or_else(|| Error::Parse(format!("[DDL] Malformed {} statement: {}", kind, sql.trim())))?;
    Ok(caps
        .iter()
        .skip(1)
        .map(|m| m.map(|m| m.as_str().to_string()).unwrap_or_default())
        .collect())
}

/// `wb.sheet` splits at the first period; a bare name has no workbook
fn split_qualified(name: &str) -> (Option<String>, String) {
    match name.split_once('.') {
        Some((wb, sheet)) if !wb.is_empty() && !sheet.is_empty() => {
            (Some(wb.to_string()), sheet.to_string())
        }
        _ => (None, name.to_string()),
    }
}

fn parse_create_workbook(sql: &str) -> Result<Statement> {
    let caps = captures(&CREATE_WORKBOOK, sql, SqlKind::CreateWorkbook)?;
    let mut overwrite = false;
    for (key, value) in parse_options(&caps[1])? {
        match key.as_str() {
            "overwrite" => overwrite = parse_flag(&key, &value)?,
            _ => log::warn!("[DDL] Ignoring unknown workbook option {}", key),
        }
    }
    Ok(Statement::CreateWorkbook {
        name: caps[0].clone(),
        overwrite,
    })
}

fn parse_create_sheet(sql: &str) -> Result<Statement> {
    let caps = captures(&CREATE_SHEET, sql, SqlKind::CreateSheet)?;
    let (workbook, name) = split_qualified(&caps[0]);
    let body = caps[1].trim();

    let mut overwrite = false;
    let mut columns = Vec::new();
    if !body.is_empty() && !OPTION_KEY.is_match(body) {
        columns = parse_columns(body)?;
    } else {
        for (key, value) in parse_options(body)? {
            match key.as_str() {
                "overwrite" => overwrite = parse_flag(&key, &value)?,
                "columns" => columns = parse_columns(&value)?,
                _ => log::warn!("[DDL] Ignoring unknown sheet option {}", key),
            }
        }
    }
    Ok(Statement::CreateSheet {
        workbook,
        name,
        columns,
        overwrite,
    })
}

fn parse_index(sql: &str) -> Result<Statement> {
    let caps = INDEX
        .captures(sql)
        .ok_or_else(|| Error::Parse(format!("[DDL] Malformed index statement: {}", sql.trim())))?;
    let (workbook, name) = split_qualified(&caps[2]);
    let table = TableRef {
        workbook,
        name,
        alias: None,
    };
    let column = caps[3].trim().to_string();
    Ok(if caps[1].eq_ignore_ascii_case("CREATE") {
        Statement::CreateIndex { table, column }
    } else {
        Statement::DropIndex { table, column }
    })
}

/// Splits `key=value, key=value`. A comma only ends a pair when the text after it starts a
/// new `key=`, so `columns=a:NUMBER,b:STRING` keeps its commas.
pub fn parse_options(body: &str) -> Result<Vec<(String, String)>> {
    let mut pairs = Vec::new();
    for segment in split_option_segments(body) {
        let segment = segment.trim();
        if segment.is_empty() {
            continue;
        }
        let (key, value) = segment
            .split_once('=')
            .ok_or_else(|| Error::Parse(format!("[DDL] Expected key=value, got {}", segment)))?;
        let value = value.trim();
        let value = strip_quotes(value).unwrap_or(value);
        pairs.push((key.trim().to_lowercase(), value.to_string()));
    }
    Ok(pairs)
}

fn split_option_segments(body: &str) -> Vec<&str> {
    let mut segments = Vec::new();
    let mut start = 0;
    let mut quote: Option<char> = None;
    for (i, c) in body.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(c),
            (None, ',') if OPTION_KEY.is_match(&body[i + 1..]) => {
                segments.push(&body[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    segments.push(&body[start..]);
    segments
}

/// `name[:TYPE]` (or `name TYPE`) definitions separated by commas; an untyped column is a string
pub fn parse_columns(text: &str) -> Result<Vec<ColumnDef>> {
    let mut columns: Vec<ColumnDef> = Vec::new();
    for def in text.split(',') {
        let def = def.trim();
        if def.is_empty() {
            continue;
        }
        let (name, datatype) = match def.split_once(':') {
            Some((name, ty)) => (name.trim(), Some(ty.trim())),
            None => match def.rsplit_once(char::is_whitespace) {
                Some((name, ty)) if strip_quotes(def).is_none() => (name.trim(), Some(ty.trim())),
                _ => (def, None),
            },
        };
        let name = strip_quotes(name)
            .or_else(|| name.strip_prefix('`').and_then(|n| n.strip_suffix('`')))
            .unwrap_or(name);
        if name.is_empty() {
            return Err(Error::Parse(format!("[DDL] Missing column name in {}", def)));
        }
        if columns.iter().any(|c| c.name.eq_ignore_ascii_case(name)) {
            return Err(Error::Parse(format!("[DDL] Duplicate column {}", name)));
        }
        columns.push(ColumnDef {
            name: name.to_string(),
            datatype: datatype.map_or(DataType::String, DataType::from_declared),
        });
    }
    Ok(columns)
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.to_lowercase().as_str() {
        "true" | "yes" | "1" => Ok(true),
        "false" | "no" | "0" => Ok(false),
        _ => Err(Error::Parse(format!("[DDL] Option {} expects true or false, got {}", key, value))),
    }
}

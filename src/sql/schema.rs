use std::{collections::BTreeMap, path::PathBuf, time::SystemTime};

use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    sql::types::{DataType, Value},
};

/// Placeholder sheet every new or emptied workbook carries
pub const DEFAULT_SHEET: &str = "Sheet1";

/// One spreadsheet file
#[derive(Debug, Clone, PartialEq)]
pub struct Workbook {
    pub name: String,
    pub path: PathBuf,
    pub sheets: Vec<Sheet>,
}

impl Workbook {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            sheets: Vec::new(),
        }
    }

    pub fn sheet(&self, name: &str) -> Option<&Sheet> {
        self.sheets.iter().find(|s| s.name.eq_ignore_ascii_case(name))
    }

    pub fn sheet_names(&self) -> Vec<String> {
        self.sheets.iter().map(|s| s.name.clone()).collect()
    }
}

/// Workbook metadata kept in the workbook cache tier
#[derive(Debug, Clone, PartialEq)]
pub struct WorkbookInfo {
    pub name: String,
    pub path: PathBuf,
    pub sheets: Vec<String>,
    pub mtime: Option<SystemTime>,
}

impl WorkbookInfo {
    /// Case-insensitive sheet lookup returning the stored spelling
    pub fn resolve_sheet(&self, name: &str) -> Option<&str> {
        self.sheets
            .iter()
            .find(|s| s.eq_ignore_ascii_case(name))
            .map(|s| s.as_str())
    }
}

/// A field of a sheet; `ordinal` is its physical column position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub ordinal: usize,
    pub datatype: DataType,
    pub nullable: bool,
}

impl Column {
    pub fn new(name: impl Into<String>, ordinal: usize, datatype: DataType) -> Self {
        Self {
            name: name.into(),
            ordinal,
            datatype,
            nullable: true,
        }
    }
}

/// One record; `values` is aligned with the sheet's column ordinals
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub row_num: usize,
    pub values: Vec<Value>,
}

impl Row {
    pub fn new(row_num: usize, values: Vec<Value>) -> Self {
        Self { row_num, values }
    }

    pub fn get(&self, ordinal: usize) -> &Value {
        self.values.get(ordinal).unwrap_or(&Value::Null)
    }

    pub fn set(&mut self, ordinal: usize, value: Value) {
        if self.values.len() <= ordinal {
            self.values.resize(ordinal + 1, Value::Null);
        }
        self.values[ordinal] = value;
    }

    pub fn is_empty(&self) -> bool {
        self.values.iter().all(Value::is_null)
    }
}

/// Single owner of a sheet's rows, addressed by absolute row number.
/// Indexes refer to rows by number only.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowArena {
    rows: BTreeMap<usize, Row>,
}

impl RowArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a row, replacing any row with the same number
    pub fn insert(&mut self, row: Row) -> Option<Row> {
        self.rows.insert(row.row_num, row)
    }

    pub fn get(&self, row_num: usize) -> Option<&Row> {
        self.rows.get(&row_num)
    }

    pub fn get_mut(&mut self, row_num: usize) -> Option<&mut Row> {
        self.rows.get_mut(&row_num)
    }

    pub fn remove(&mut self, row_num: usize) -> Option<Row> {
        self.rows.remove(&row_num)
    }

    /// Rows in ascending row-number order
    pub fn iter(&self) -> impl Iterator<Item = &Row> {
        self.rows.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Row> {
        self.rows.values_mut()
    }

    /// The `page`-th window of `size` rows
    pub fn page(&self, page: usize, size: usize) -> impl Iterator<Item = &Row> {
        self.rows.values().skip(page.saturating_mul(size)).take(size)
    }

    pub fn max_row_num(&self) -> Option<usize> {
        self.rows.keys().next_back().copied()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn clear(&mut self) {
        self.rows.clear();
    }
}

/// A table: a header row of column names followed by data rows
#[derive(Debug, Clone, PartialEq)]
pub struct Sheet {
    pub name: String,
    pub header_row: usize,
    pub data_start_row: usize,
    pub columns: Vec<Column>,
    pub rows: RowArena,
}

impl Sheet {
    pub fn new(name: impl Into<String>, columns: Vec<Column>) -> Self {
        Self {
            name: name.into(),
            header_row: 0,
            data_start_row: 1,
            columns,
            rows: RowArena::new(),
        }
    }

    /// Case-insensitive column lookup; `t.col` qualifiers are ignored
    pub fn column(&self, name: &str) -> Option<&Column> {
        let name = unqualified(name);
        self.columns.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn must_get_column(&self, name: &str) -> Result<&Column> {
        self.column(name).ok_or_else(|| {
            Error::Reference(format!(
                "column {} does not exist in sheet {}",
                name, self.name
            ))
        })
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Row number the next appended row takes; never reuses an occupied row
    pub fn next_row_num(&self) -> usize {
        match self.rows.max_row_num() {
            Some(max) => (max + 1).max(self.data_start_row),
            None => self.data_start_row,
        }
    }
}

/// Strips a `table.` qualifier from a column reference
pub fn unqualified(name: &str) -> &str {
    match name.rsplit_once('.') {
        Some((_, col)) => col,
        None => name,
    }
}

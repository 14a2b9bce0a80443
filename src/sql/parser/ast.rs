use std::fmt::Display;

use crate::sql::types::{DataType, Value};

/// A parsed statement together with the text it came from; never modified after parsing
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedQuery {
    pub sql: String,
    pub statement: Statement,
}

impl ParsedQuery {
    pub fn kind(&self) -> SqlKind {
        self.statement.kind()
    }
}

/// A statement after parsing; one variant per executable statement kind
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Select(Select),
    Insert(Insert),
    Update(Update),
    Delete(Delete),
    CreateWorkbook {
        name: String,
        overwrite: bool,
    },
    CreateSheet {
        workbook: Option<String>,
        name: String,
        columns: Vec<ColumnDef>,
        overwrite: bool,
    },
    UseWorkbook {
        name: String,
    },
    DropWorkbook {
        name: String,
    },
    DropSheet {
        workbook: Option<String>,
        name: String,
    },
    ShowWorkbooks,
    ShowSheets {
        workbook: Option<String>,
    },
    CreateIndex {
        table: TableRef,
        column: String,
    },
    DropIndex {
        table: TableRef,
        column: String,
    },
}

impl Statement {
    pub fn kind(&self) -> SqlKind {
        match self {
            Statement::Select(_) => SqlKind::Select,
            Statement::Insert(_) => SqlKind::Insert,
            Statement::Update(_) => SqlKind::Update,
            Statement::Delete(_) => SqlKind::Delete,
            Statement::CreateWorkbook { .. } => SqlKind::CreateWorkbook,
            Statement::CreateSheet { .. } => SqlKind::CreateSheet,
            Statement::UseWorkbook { .. } => SqlKind::UseWorkbook,
            Statement::DropWorkbook { .. } => SqlKind::DropWorkbook,
            Statement::DropSheet { .. } => SqlKind::DropSheet,
            Statement::ShowWorkbooks => SqlKind::ShowWorkbooks,
            Statement::ShowSheets { .. } => SqlKind::ShowSheets,
            Statement::CreateIndex { .. } => SqlKind::CreateIndex,
            Statement::DropIndex { .. } => SqlKind::DropIndex,
        }
    }
}

/// Statement kind, available without a full parse
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SqlKind {
    Select,
    Insert,
    Update,
    Delete,
    CreateWorkbook,
    CreateSheet,
    UseWorkbook,
    DropWorkbook,
    DropSheet,
    ShowWorkbooks,
    ShowSheets,
    CreateIndex,
    DropIndex,
    Unknown,
}

impl SqlKind {
    /// Statements that work on workbooks themselves rather than on rows of a sheet
    pub fn is_ddl(&self) -> bool {
        matches!(
            self,
            SqlKind::CreateWorkbook
                | SqlKind::UseWorkbook
                | SqlKind::DropWorkbook
                | SqlKind::ShowWorkbooks
        )
    }

    pub fn is_write(&self) -> bool {
        matches!(
            self,
            SqlKind::Insert
                | SqlKind::Update
                | SqlKind::Delete
                | SqlKind::CreateWorkbook
                | SqlKind::CreateSheet
                | SqlKind::DropWorkbook
                | SqlKind::DropSheet
        )
    }
}

impl Display for SqlKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            SqlKind::Select => "SELECT",
            SqlKind::Insert => "INSERT",
            SqlKind::Update => "UPDATE",
            SqlKind::Delete => "DELETE",
            SqlKind::CreateWorkbook => "CREATE_WORKBOOK",
            SqlKind::CreateSheet => "CREATE_SHEET",
            SqlKind::UseWorkbook => "USE_WORKBOOK",
            SqlKind::DropWorkbook => "DROP_WORKBOOK",
            SqlKind::DropSheet => "DROP_SHEET",
            SqlKind::ShowWorkbooks => "SHOW_WORKBOOKS",
            SqlKind::ShowSheets => "SHOW_SHEETS",
            SqlKind::CreateIndex => "CREATE_INDEX",
            SqlKind::DropIndex => "DROP_INDEX",
            SqlKind::Unknown => "UNKNOWN",
        })
    }
}

/// `[workbook.]sheet [[AS] alias]`
#[derive(Debug, Clone, PartialEq)]
pub struct TableRef {
    pub workbook: Option<String>,
    pub name: String,
    pub alias: Option<String>,
}

impl TableRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            workbook: None,
            name: name.into(),
            alias: None,
        }
    }
}

/// Column declared by CREATE SHEET
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDef {
    pub name: String,
    pub datatype: DataType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggFunc {
    Count,
    Sum,
    Avg,
    Max,
    Min,
}

impl AggFunc {
    pub fn from_str(name: &str) -> Option<Self> {
        Some(match name.to_uppercase().as_ref() {
            "COUNT" => AggFunc::Count,
            "SUM" => AggFunc::Sum,
            "AVG" => AggFunc::Avg,
            "MAX" => AggFunc::Max,
            "MIN" => AggFunc::Min,
            _ => return None,
        })
    }

    pub fn to_str(&self) -> &'static str {
        match self {
            AggFunc::Count => "COUNT",
            AggFunc::Sum => "SUM",
            AggFunc::Avg => "AVG",
            AggFunc::Max => "MAX",
            AggFunc::Min => "MIN",
        }
    }
}

/// An aggregate call; `column` is None for `COUNT(*)`
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregate {
    pub func: AggFunc,
    pub column: Option<String>,
}

impl Aggregate {
    /// Synthetic output key, e.g. `SUM(amount)` or `COUNT(*)`
    pub fn key(&self) -> String {
        format!(
            "{}({})",
            self.func.to_str(),
            self.column.as_deref().unwrap_or("*")
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SelectItem {
    /// `*` or `t.*`
    Wildcard,
    Column {
        name: String,
        alias: Option<String>,
    },
    Aggregate {
        aggregate: Aggregate,
        alias: Option<String>,
    },
}

/// Sort direction (ascending or descending)
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OrderDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Select {
    pub table: TableRef,
    pub distinct: bool,
    pub items: Vec<SelectItem>,
    /// Normalized WHERE text for the predicate evaluator
    pub predicate: Option<String>,
    pub group_by: Vec<String>,
    pub having: Option<String>,
    /// Aggregates HAVING refers to, whether or not they are projected
    pub having_aggregates: Vec<Aggregate>,
    pub order_by: Vec<(String, OrderDirection)>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl Select {
    /// Every aggregate to compute, projected ones first, without duplicates
    pub fn aggregates(&self) -> Vec<Aggregate> {
        let mut out: Vec<Aggregate> = Vec::new();
        let projected = self.items.iter().filter_map(|item| match item {
            SelectItem::Aggregate { aggregate, .. } => Some(aggregate),
            _ => None,
        });
        for agg in projected.chain(self.having_aggregates.iter()) {
            if !out.iter().any(|a| a.key().eq_ignore_ascii_case(&agg.key())) {
                out.push(agg.clone());
            }
        }
        out
    }

    pub fn has_aggregates(&self) -> bool {
        !self.aggregates().is_empty()
    }

    /// `(alias, underlying key)` pairs for every aliased projection
    pub fn aliases(&self) -> Vec<(String, String)> {
        self.items
            .iter()
            .filter_map(|item| match item {
                SelectItem::Column {
                    name,
                    alias: Some(alias),
                } => Some((alias.clone(), name.clone())),
                SelectItem::Aggregate {
                    aggregate,
                    alias: Some(alias),
                } => Some((alias.clone(), aggregate.key())),
                _ => None,
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Insert {
    pub table: TableRef,
    /// None for the positional form; values then map onto the sheet's columns in order
    pub columns: Option<Vec<String>>,
    pub rows: Vec<Vec<Value>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    pub table: TableRef,
    /// `(column, expression text)`; the expression may refer to the column itself
    pub assignments: Vec<(String, String)>,
    pub predicate: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Delete {
    pub table: TableRef,
    pub predicate: Option<String>,
}

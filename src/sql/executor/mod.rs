use std::{path::PathBuf, sync::Arc, time::Instant};

use crate::{
    cache::CacheManager,
    config::Config,
    error::{Error, Result},
    index::IndexManager,
    sql::{
        parser::ast::{SqlKind, Statement},
        schema::{Sheet, Workbook, WorkbookInfo},
        types::Value,
    },
    storage::{FileStamp, FileStorage, codec},
};

pub mod agg;
pub mod eval;
mod mutation;
mod query;
mod schema;

/// Execution result set
#[derive(Debug, Clone, PartialEq)]
pub enum ResultSet {
    Scan {
        columns: Vec<String>,
        rows: Vec<Vec<Value>>,
    },
    Insert {
        count: usize,
    },
    Update {
        count: usize,
    },
    Delete {
        count: usize,
    },
    Ddl {
        kind: SqlKind,
        message: String,
    },
    List {
        items: Vec<String>,
    },
}

impl ResultSet {
    /// Rows written by INSERT, UPDATE or DELETE
    pub fn affected_rows(&self) -> Option<usize> {
        match self {
            ResultSet::Insert { count }
            | ResultSet::Update { count }
            | ResultSet::Delete { count } => Some(*count),
            _ => None,
        }
    }
}

/// SQL executor trait
pub trait Executor {
    fn execute(self: Box<Self>, ctx: &mut Context) -> Result<ResultSet>;
}

/// Builds the executor for a parsed statement
impl dyn Executor {
    pub fn build(statement: Statement) -> Box<dyn Executor> {
        match statement {
            Statement::Select(select) => query::Select::new(select),
            Statement::Insert(insert) => mutation::Insert::new(insert),
            Statement::Update(update) => mutation::Update::new(update),
            Statement::Delete(delete) => mutation::Delete::new(delete),
            Statement::CreateWorkbook { name, overwrite } => {
                schema::CreateWorkbook::new(name, overwrite)
            }
            Statement::CreateSheet {
                workbook,
                name,
                columns,
                overwrite,
            } => schema::CreateSheet::new(workbook, name, columns, overwrite),
            Statement::UseWorkbook { name } => schema::UseWorkbook::new(name),
            Statement::DropWorkbook { name } => schema::DropWorkbook::new(name),
            Statement::DropSheet { workbook, name } => schema::DropSheet::new(workbook, name),
            Statement::ShowWorkbooks => Box::new(schema::ShowWorkbooks),
            Statement::ShowSheets { workbook } => schema::ShowSheets::new(workbook),
            Statement::CreateIndex { table, column } => schema::CreateIndex::new(table, column),
            Statement::DropIndex { table, column } => schema::DropIndex::new(table, column),
        }
    }
}

/// A sheet's rows and the stamp its file carried when they were read
pub struct SheetSnapshot {
    pub sheet: Arc<Sheet>,
    pub path: PathBuf,
    pub stamp: Option<FileStamp>,
}

/// Everything one statement runs against: the engine's shared services plus the session's
/// current workbook and an optional deadline
pub struct Context<'a> {
    pub config: &'a Config,
    pub storage: &'a FileStorage,
    pub loader: &'a codec::Loader,
    pub cache: &'a CacheManager,
    pub indexes: &'a IndexManager,
    pub current_workbook: &'a mut Option<String>,
    pub deadline: Option<Instant>,
}

impl Context<'_> {
    /// The explicit qualifier, else the session's current workbook
    pub fn workbook_name(&self, explicit: Option<&str>) -> Result<String> {
        explicit
            .map(str::to_string)
            .or_else(|| self.current_workbook.clone())
            .ok_or_else(|| {
                Error::Reference(
                    "no workbook selected; run USE WORKBOOK <name> or qualify the table as workbook.sheet"
                        .into(),
                )
            })
    }

    /// Path of a workbook that must already exist
    pub fn existing_path(&self, workbook: &str) -> Result<PathBuf> {
        FileStorage::validate_name(workbook)?;
        if !self.storage.exists(workbook) {
            return Err(Error::Reference(format!("workbook {} does not exist", workbook)));
        }
        Ok(self.storage.workbook_path(workbook))
    }

    /// Workbook metadata, from the cache while the file is unchanged
    pub fn workbook_info(&self, workbook: &str) -> Result<Arc<WorkbookInfo>> {
        if let Some(info) = self.cache.get_workbook(workbook) {
            return Ok(info);
        }
        let path = self.existing_path(workbook)?;
        self.storage.check_size(&path)?;
        let stamp = FileStamp::of(&path);
        let sheets = self.loader.load(workbook, &path, codec::read_sheet_names)?;
        let info = WorkbookInfo {
            name: workbook.to_string(),
            mtime: stamp.and_then(|s| s.mtime),
            path,
            sheets,
        };
        self.cache.put_workbook(info.clone(), stamp);
        Ok(Arc::new(info))
    }

    /// Stored spelling of a sheet name together with its workbook's metadata
    pub fn resolve_sheet(&self, workbook: &str, sheet: &str) -> Result<(Arc<WorkbookInfo>, String)> {
        let info = self.workbook_info(workbook)?;
        let name = info.resolve_sheet(sheet).map(str::to_string).ok_or_else(|| {
            Error::Reference(format!("sheet {} does not exist in workbook {}", sheet, workbook))
        })?;
        Ok((info, name))
    }

    /// A sheet with all of its rows, from the cache while the file is unchanged
    pub fn sheet(&self, workbook: &str, sheet: &str) -> Result<SheetSnapshot> {
        let (info, name) = self.resolve_sheet(workbook, sheet)?;
        if let Some((sheet, stamp)) = self.cache.get_sheet(workbook, &name) {
            return Ok(SheetSnapshot {
                sheet,
                path: info.path.clone(),
                stamp,
            });
        }
        let stamp = FileStamp::of(&info.path);
        let loaded = Arc::new(
            self.loader
                .load(workbook, &info.path, |path| codec::read_sheet(path, &name))?,
        );
        self.cache.put_sheet(workbook, loaded.clone(), &info.path, stamp);
        log::debug!("loaded {}.{} with {} rows", workbook, name, loaded.row_count());
        Ok(SheetSnapshot {
            sheet: loaded,
            path: info.path.clone(),
            stamp,
        })
    }

    /// Every sheet of a workbook, read fresh from disk for a rewrite
    pub fn read_workbook(&self, workbook: &str) -> Result<Workbook> {
        let path = self.existing_path(workbook)?;
        self.storage.check_size(&path)?;
        self.loader
            .load(workbook, &path, |path| codec::read_workbook(workbook, path))
    }

    /// Writes the workbook back and drops everything cached from the old file. When the
    /// write touched one sheet, that sheet's indexes are rebuilt from its new rows.
    pub fn persist(&self, workbook: &Workbook, touched: Option<&str>) -> Result<()> {
        codec::write_workbook(workbook)?;
        self.cache.invalidate_workbook(&workbook.name);
        self.cache.invalidate_path(&workbook.path);
        if let Some(sheet) = touched.and_then(|name| workbook.sheet(name)) {
            self.indexes.refresh_sheet(&workbook.name, sheet)?;
        }
        Ok(())
    }

    /// Fails once the deadline has passed
    pub fn check_deadline(&self) -> Result<()> {
        match self.deadline {
            Some(deadline) if Instant::now() > deadline => Err(Error::Timeout(format!(
                "query exceeded {}s",
                self.config.performance.query_timeout_secs
            ))),
            _ => Ok(()),
        }
    }
}

/// Finds a sheet in a loaded workbook by name, case-insensitively
fn sheet_position(workbook: &Workbook, name: &str) -> Result<usize> {
    workbook
        .sheets
        .iter()
        .position(|s| s.name.eq_ignore_ascii_case(name))
        .ok_or_else(|| {
            Error::Reference(format!(
                "sheet {} does not exist in workbook {}",
                name, workbook.name
            ))
        })
}

use crate::{
    error::{Error, Result},
    sql::{
        executor::{Context, Executor, ResultSet, sheet_position},
        parser::ast::{ColumnDef, SqlKind, TableRef},
        schema::{Column, DEFAULT_SHEET, Sheet, Workbook},
    },
    storage::{FileStorage, codec},
};

fn ddl(kind: SqlKind, message: impl Into<String>) -> Result<ResultSet> {
    Ok(ResultSet::Ddl {
        kind,
        message: message.into(),
    })
}

fn is_csv(workbook: &Workbook) -> bool {
    workbook
        .path
        .extension()
        .is_some_and(|e| e.eq_ignore_ascii_case("csv"))
}

/// CREATE WORKBOOK executor
pub struct CreateWorkbook {
    name: String,
    overwrite: bool,
}

impl CreateWorkbook {
    pub fn new(name: String, overwrite: bool) -> Box<Self> {
        Box::new(Self { name, overwrite })
    }
}

impl Executor for CreateWorkbook {
    fn execute(self: Box<Self>, ctx: &mut Context) -> Result<ResultSet> {
        FileStorage::validate_name(&self.name)?;
        if ctx.storage.exists(&self.name) {
            if !self.overwrite {
                return ddl(SqlKind::CreateWorkbook, "Workbook already exists");
            }
            let old = ctx.storage.remove(&self.name)?;
            ctx.indexes.drop_all(&self.name, None)?;
            ctx.cache.invalidate_workbook(&self.name);
            ctx.cache.invalidate_path(&old);
            log::info!("workbook {} replaced", self.name);
        }

        let path = ctx.storage.workbook_path(&self.name);
        codec::write_workbook(&codec::empty_workbook(&self.name, &path))?;
        log::info!("workbook {} created at {}", self.name, path.display());
        ddl(SqlKind::CreateWorkbook, "Workbook created successfully")
    }
}

/// CREATE SHEET executor; rewrites the whole workbook with the new sheet added
pub struct CreateSheet {
    workbook: Option<String>,
    name: String,
    columns: Vec<ColumnDef>,
    overwrite: bool,
}

impl CreateSheet {
    pub fn new(workbook: Option<String>, name: String, columns: Vec<ColumnDef>, overwrite: bool) -> Box<Self> {
        Box::new(Self {
            workbook,
            name,
            columns,
            overwrite,
        })
    }
}

impl Executor for CreateSheet {
    fn execute(self: Box<Self>, ctx: &mut Context) -> Result<ResultSet> {
        let Self {
            workbook,
            name,
            columns,
            overwrite,
        } = *self;
        let workbook_name = ctx.workbook_name(workbook.as_deref())?;
        let mut workbook = ctx.read_workbook(&workbook_name)?;

        let columns = columns
            .into_iter()
            .enumerate()
            .map(|(i, def)| Column::new(def.name, i, def.datatype))
            .collect();
        let sheet = Sheet::new(name.clone(), columns);

        let replaced = match sheet_position(&workbook, &name) {
            Ok(_) if !overwrite => {
                return ddl(SqlKind::CreateSheet, "Sheet already exists");
            }
            Ok(i) => {
                workbook.sheets[i] = sheet;
                true
            }
            Err(_) if is_csv(&workbook) => {
                return Err(Error::Io(format!(
                    "workbook {} is a csv file and holds a single sheet",
                    workbook_name
                )));
            }
            Err(_) => {
                workbook.sheets.push(sheet);
                false
            }
        };

        ctx.persist(&workbook, None)?;
        // the old rows' indexes stay until the new sheet is on disk
        if replaced {
            ctx.indexes.drop_all(&workbook_name, Some(&name))?;
        }
        log::info!("sheet {}.{} created", workbook_name, name);
        ddl(SqlKind::CreateSheet, "Sheet created successfully")
    }
}

/// USE WORKBOOK executor
pub struct UseWorkbook {
    name: String,
}

impl UseWorkbook {
    pub fn new(name: String) -> Box<Self> {
        Box::new(Self { name })
    }
}

impl Executor for UseWorkbook {
    fn execute(self: Box<Self>, ctx: &mut Context) -> Result<ResultSet> {
        ctx.existing_path(&self.name)?;
        let message = format!("Using workbook: {}", self.name);
        *ctx.current_workbook = Some(self.name);
        ddl(SqlKind::UseWorkbook, message)
    }
}

/// DROP WORKBOOK executor; the file goes together with its indexes and cache entries
pub struct DropWorkbook {
    name: String,
}

impl DropWorkbook {
    pub fn new(name: String) -> Box<Self> {
        Box::new(Self { name })
    }
}

impl Executor for DropWorkbook {
    fn execute(self: Box<Self>, ctx: &mut Context) -> Result<ResultSet> {
        ctx.existing_path(&self.name)?;
        let path = ctx.storage.remove(&self.name)?;
        let indexes = ctx.indexes.drop_all(&self.name, None)?;
        ctx.cache.invalidate_workbook(&self.name);
        ctx.cache.invalidate_path(&path);
        if ctx
            .current_workbook
            .as_deref()
            .is_some_and(|current| current.eq_ignore_ascii_case(&self.name))
        {
            *ctx.current_workbook = None;
        }
        log::info!("workbook {} dropped with {} indexes", self.name, indexes);
        ddl(SqlKind::DropWorkbook, "Workbook deleted successfully")
    }
}

/// DROP SHEET executor; the last sheet of a workbook is replaced by an empty placeholder
pub struct DropSheet {
    workbook: Option<String>,
    name: String,
}

impl DropSheet {
    pub fn new(workbook: Option<String>, name: String) -> Box<Self> {
        Box::new(Self { workbook, name })
    }
}

impl Executor for DropSheet {
    fn execute(self: Box<Self>, ctx: &mut Context) -> Result<ResultSet> {
        let workbook_name = ctx.workbook_name(self.workbook.as_deref())?;
        let mut workbook = ctx.read_workbook(&workbook_name)?;
        let i = sheet_position(&workbook, &self.name)?;
        let dropped = workbook.sheets.remove(i);
        if workbook.sheets.is_empty() {
            log::info!(
                "{} was the last sheet of {}, leaving an empty {}",
                dropped.name,
                workbook_name,
                DEFAULT_SHEET
            );
            workbook.sheets.push(Sheet::new(DEFAULT_SHEET, Vec::new()));
        }

        ctx.persist(&workbook, None)?;
        ctx.indexes.drop_all(&workbook_name, Some(&dropped.name))?;
        ddl(SqlKind::DropSheet, "Sheet deleted successfully")
    }
}

/// SHOW WORKBOOKS executor
pub struct ShowWorkbooks;

impl Executor for ShowWorkbooks {
    fn execute(self: Box<Self>, ctx: &mut Context) -> Result<ResultSet> {
        Ok(ResultSet::List {
            items: ctx.storage.list_workbooks()?,
        })
    }
}

/// SHOW SHEETS executor
pub struct ShowSheets {
    workbook: Option<String>,
}

impl ShowSheets {
    pub fn new(workbook: Option<String>) -> Box<Self> {
        Box::new(Self { workbook })
    }
}

impl Executor for ShowSheets {
    fn execute(self: Box<Self>, ctx: &mut Context) -> Result<ResultSet> {
        let workbook = ctx.workbook_name(self.workbook.as_deref())?;
        Ok(ResultSet::List {
            items: ctx.workbook_info(&workbook)?.sheets.clone(),
        })
    }
}

/// CREATE INDEX executor
pub struct CreateIndex {
    table: TableRef,
    column: String,
}

impl CreateIndex {
    pub fn new(table: TableRef, column: String) -> Box<Self> {
        Box::new(Self { table, column })
    }
}

impl Executor for CreateIndex {
    fn execute(self: Box<Self>, ctx: &mut Context) -> Result<ResultSet> {
        let workbook = ctx.workbook_name(self.table.workbook.as_deref())?;
        let sheet = ctx.sheet(&workbook, &self.table.name)?.sheet;
        let column = sheet.must_get_column(&self.column)?;
        let keys = ctx.indexes.create_index(&workbook, &sheet, &column.name)?;
        ddl(
            SqlKind::CreateIndex,
            format!(
                "Index created on {}.{}({}) with {} keys",
                workbook, sheet.name, column.name, keys
            ),
        )
    }
}

/// DROP INDEX executor
pub struct DropIndex {
    table: TableRef,
    column: String,
}

impl DropIndex {
    pub fn new(table: TableRef, column: String) -> Box<Self> {
        Box::new(Self { table, column })
    }
}

impl Executor for DropIndex {
    fn execute(self: Box<Self>, ctx: &mut Context) -> Result<ResultSet> {
        let Self { table, column } = *self;
        let workbook = ctx.workbook_name(table.workbook.as_deref())?;
        let sheet = ctx
            .workbook_info(&workbook)?
            .resolve_sheet(&table.name)
            .map(str::to_string)
            .unwrap_or(table.name);
        ctx.indexes.drop_index(&workbook, &sheet, &column)?;
        ddl(
            SqlKind::DropIndex,
            format!("Index dropped on {}.{}({})", workbook, sheet, column),
        )
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        config::Config,
        error::{Error, Result},
        sql::{
            engine::Engine,
            executor::ResultSet,
            parser::ast::SqlKind,
            types::Value,
        },
    };

    fn list(result: ResultSet) -> Vec<String> {
        match result {
            ResultSet::List { items } => items,
            other => panic!("expected list, got {:?}", other),
        }
    }

    fn message(result: ResultSet) -> String {
        match result {
            ResultSet::Ddl { message, .. } => message,
            other => panic!("expected ddl, got {:?}", other),
        }
    }

    #[test]
    fn test_workbook_lifecycle() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut s = Engine::new(Config::with_base_path(dir.path()))?.session();

        assert!(matches!(s.execute("SHOW SHEETS;"), Err(Error::Reference(_))));
        assert!(matches!(s.execute("USE WORKBOOK nope;"), Err(Error::Reference(_))));

        assert_eq!(
            s.execute("CREATE WORKBOOK b;")?,
            ResultSet::Ddl {
                kind: SqlKind::CreateWorkbook,
                message: "Workbook created successfully".into()
            }
        );
        s.execute("CREATE WORKBOOK a;")?;
        assert_eq!(message(s.execute("CREATE WORKBOOK a;")?), "Workbook already exists");
        assert_eq!(list(s.execute("SHOW WORKBOOKS;")?), vec!["a", "b"]);

        s.execute("USE WORKBOOK a;")?;
        assert_eq!(s.current_workbook(), Some("a"));
        assert_eq!(list(s.execute("SHOW SHEETS;")?), vec!["Sheet1"]);

        s.execute("DROP WORKBOOK a;")?;
        assert_eq!(s.current_workbook(), None);
        assert_eq!(list(s.execute("SHOW WORKBOOKS;")?), vec!["b"]);
        assert!(matches!(s.execute("DROP WORKBOOK a;"), Err(Error::Reference(_))));
        Ok(())
    }

    #[test]
    fn test_sheet_lifecycle() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut s = Engine::new(Config::with_base_path(dir.path()))?.session();
        s.execute("CREATE WORKBOOK w;")?;
        s.execute("CREATE SHEET w.people (name:STRING, age:NUMBER);")?;
        s.execute("INSERT INTO w.people VALUES ('ann', 31);")?;
        s.execute("CREATE SHEET w.pets (overwrite=false, columns=name:STRING);")?;
        assert_eq!(list(s.execute("SHOW SHEETS FROM w;")?), vec!["Sheet1", "people", "pets"]);

        // rebuilding the file keeps the other sheets' rows
        s.execute("DROP SHEET w.Sheet1;")?;
        match s.execute("SELECT name FROM w.people;")? {
            ResultSet::Scan { rows, .. } => assert_eq!(rows, vec![vec![Value::String("ann".into())]]),
            other => panic!("expected scan, got {:?}", other),
        }

        assert_eq!(message(s.execute("CREATE SHEET w.pets;")?), "Sheet already exists");
        s.execute("CREATE SHEET w.people (overwrite=true, columns=id:NUMBER);")?;
        match s.execute("SELECT * FROM w.people;")? {
            ResultSet::Scan { columns, rows } => {
                assert_eq!(columns, vec!["id"]);
                assert!(rows.is_empty());
            }
            other => panic!("expected scan, got {:?}", other),
        }

        s.execute("DROP SHEET w.people;")?;
        s.execute("DROP SHEET w.pets;")?;
        // the last sheet is never removed outright
        assert_eq!(list(s.execute("SHOW SHEETS FROM w;")?), vec!["Sheet1"]);
        assert!(matches!(s.execute("DROP SHEET w.pets;"), Err(Error::Reference(_))));
        Ok(())
    }

    #[test]
    fn test_csv_workbook_holds_one_sheet() -> Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("flat.csv"), "a,b\n1,x\n2,y\n")?;
        let mut s = Engine::new(Config::with_base_path(dir.path()))?.session();

        assert_eq!(list(s.execute("SHOW SHEETS FROM flat;")?), vec!["flat"]);
        assert!(matches!(s.execute("CREATE SHEET flat.more;"), Err(Error::Io(_))));

        s.execute("INSERT INTO flat.flat VALUES (3, 'z');")?;
        match s.execute("SELECT COUNT(*) FROM flat.flat;")? {
            ResultSet::Scan { rows, .. } => assert_eq!(rows, vec![vec![Value::Integer(3)]]),
            other => panic!("expected scan, got {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn test_index_statements() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut s = Engine::new(Config::with_base_path(dir.path()))?.session();
        s.execute("CREATE WORKBOOK w;")?;
        s.execute("USE WORKBOOK w;")?;
        s.execute("CREATE SHEET t (k:STRING);")?;
        s.execute("INSERT INTO t VALUES ('x'), ('y'), ('x');")?;

        assert_eq!(
            message(s.execute("CREATE INDEX ON t (k);")?),
            "Index created on w.t(k) with 2 keys"
        );
        assert!(matches!(s.execute("CREATE INDEX ON t (nope);"), Err(Error::Reference(_))));
        s.execute("DROP INDEX ON t (k);")?;
        assert!(matches!(s.execute("DROP INDEX ON t (k);"), Err(Error::Reference(_))));
        Ok(())
    }

    #[test]
    fn test_failed_rewrite_keeps_indexes() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut s = Engine::new(Config::with_base_path(dir.path()))?.session();
        s.execute("CREATE WORKBOOK w;")?;
        s.execute("USE WORKBOOK w;")?;
        s.execute("CREATE SHEET t (k:STRING);")?;
        s.execute("INSERT INTO t VALUES ('x');")?;
        s.execute("CREATE INDEX ON t (k);")?;

        // one column past the xlsx limit makes the rewrite fail
        let columns = (0..=16384).map(|i| format!("c{}", i)).collect::<Vec<_>>().join(",");
        let sql = format!("CREATE SHEET t (overwrite=true, columns={});", columns);
        assert!(s.execute(&sql).is_err());

        match s.execute("SELECT k FROM t WHERE k = 'x';")? {
            ResultSet::Scan { rows, .. } => assert_eq!(rows, vec![vec![Value::String("x".into())]]),
            other => panic!("expected scan, got {:?}", other),
        }
        s.execute("DROP INDEX ON t (k);")?;
        Ok(())
    }
}

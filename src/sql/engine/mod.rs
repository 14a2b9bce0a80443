use std::{
    fs,
    sync::Arc,
    time::{Duration, Instant},
};

use serde::Serialize;

use crate::{
    cache::{CacheManager, CacheStats},
    config::Config,
    error::{ErrorResponse, Result},
    index::IndexManager,
    sql::{
        executor::{Context, Executor, ResultSet},
        parser,
        types::Value,
    },
    storage::{FileStorage, codec::Loader},
};

mod pool;

pub use pool::WorkerPool;

/// SQL engine over a directory of workbook files
///
/// Cheap to clone; clones share the cache and index managers.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

struct Inner {
    config: Config,
    storage: FileStorage,
    loader: Loader,
    cache: CacheManager,
    indexes: IndexManager,
}

impl Engine {
    pub fn new(config: Config) -> Result<Self> {
        fs::create_dir_all(&config.storage.base_path)?;
        log::info!(
            "engine started on {} (indexes in {})",
            config.storage.base_path.display(),
            config.storage.index_path.display()
        );
        Ok(Self {
            inner: Arc::new(Inner {
                storage: FileStorage::new(&config.storage),
                loader: Loader::new(&config.storage),
                cache: CacheManager::new(&config.cache),
                indexes: IndexManager::new(&config.storage.index_path),
                config,
            }),
        })
    }

    pub fn session(&self) -> Session {
        Session {
            engine: self.clone(),
            current_workbook: None,
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.inner.cache.stats()
    }

    /// Forgets every cached workbook, sheet, result and in-memory index
    pub fn clear_caches(&self) {
        self.inner.cache.clear_all();
        self.inner.indexes.clear_cache();
        log::info!("caches cleared");
    }

    /// Parses and runs one statement against `current_workbook`
    fn run(&self, sql: &str, current_workbook: &mut Option<String>) -> Result<ResultSet> {
        let start = Instant::now();
        let query = parser::parse(sql)?;
        let kind = query.kind();

        let inner = &self.inner;
        let timeout = Duration::from_secs(inner.config.performance.query_timeout_secs);
        let mut ctx = Context {
            config: &inner.config,
            storage: &inner.storage,
            loader: &inner.loader,
            cache: &inner.cache,
            indexes: &inner.indexes,
            current_workbook,
            deadline: (!timeout.is_zero()).then(|| start + timeout),
        };
        let result = <dyn Executor>::build(query.statement).execute(&mut ctx);

        let elapsed = start.elapsed();
        match &result {
            Ok(_) => log::info!("{} finished in {} ms", kind, elapsed.as_millis()),
            Err(err) => log::warn!("{} failed after {} ms: {}", kind, elapsed.as_millis(), err),
        }
        let slow = Duration::from_millis(inner.config.monitoring.slow_query_threshold_ms);
        if elapsed >= slow {
            log::warn!("slow query ({} ms): {}", elapsed.as_millis(), sql.trim());
        }
        if !timeout.is_zero() && elapsed > timeout {
            log::warn!("query ran past the {}s timeout: {}", timeout.as_secs(), sql.trim());
        }
        result
    }
}

/// SQL session: statements run one at a time against a current workbook
pub struct Session {
    engine: Engine,
    current_workbook: Option<String>,
}

impl Session {
    /// Executes a SQL statement
    pub fn execute(&mut self, sql: &str) -> Result<ResultSet> {
        self.engine.run(sql, &mut self.current_workbook)
    }

    /// Executes a statement with `workbook` as the default for unqualified tables. The
    /// session's current workbook only changes when the statement itself changes it.
    pub fn execute_in(&mut self, sql: &str, workbook: &str) -> Result<ResultSet> {
        let mut scoped = Some(workbook.to_string());
        let result = self.engine.run(sql, &mut scoped);
        if scoped.as_deref() != Some(workbook) {
            self.current_workbook = scoped;
        }
        result
    }

    /// Executes a statement and reports the outcome, failures included, as a response
    pub fn query(&mut self, sql: &str) -> QueryResponse {
        let start = Instant::now();
        let kind = parser::classify(sql);
        let result = self.execute(sql);
        QueryResponse::new(kind.to_string(), result, start.elapsed())
    }

    pub fn current_workbook(&self) -> Option<&str> {
        self.current_workbook.as_deref()
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }
}

/// Serializable outcome of one statement
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum QueryResponse {
    #[serde(rename_all = "camelCase")]
    Rows {
        success: bool,
        columns: Vec<String>,
        rows: Vec<Vec<serde_json::Value>>,
        row_count: usize,
        execution_time_ms: u64,
    },
    #[serde(rename_all = "camelCase")]
    Affected {
        success: bool,
        affected_rows: usize,
        statement_kind: String,
        message: Option<String>,
        execution_time_ms: u64,
    },
    #[serde(rename_all = "camelCase")]
    List {
        success: bool,
        items: Vec<String>,
        execution_time_ms: u64,
    },
    Error(ErrorResponse),
}

impl QueryResponse {
    pub fn new(statement_kind: String, result: Result<ResultSet>, elapsed: Duration) -> Self {
        let execution_time_ms = elapsed.as_millis() as u64;
        match result {
            Ok(ResultSet::Scan { columns, rows }) => QueryResponse::Rows {
                success: true,
                row_count: rows.len(),
                rows: rows
                    .iter()
                    .map(|row| row.iter().map(json_value).collect())
                    .collect(),
                columns,
                execution_time_ms,
            },
            Ok(ResultSet::List { items }) => QueryResponse::List {
                success: true,
                items,
                execution_time_ms,
            },
            Ok(ResultSet::Ddl { kind, message }) => QueryResponse::Affected {
                success: true,
                affected_rows: 0,
                statement_kind: kind.to_string(),
                message: Some(message),
                execution_time_ms,
            },
            Ok(rs) => QueryResponse::Affected {
                success: true,
                affected_rows: rs.affected_rows().unwrap_or(0),
                statement_kind,
                message: None,
                execution_time_ms,
            },
            Err(err) => QueryResponse::Error(ErrorResponse::from(&err)),
        }
    }

    pub fn is_success(&self) -> bool {
        !matches!(self, QueryResponse::Error(_))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Cell value as plain JSON; dates as ISO text, non-finite floats as null
fn json_value(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Boolean(b) => serde_json::Value::Bool(*b),
        Value::Integer(i) => serde_json::Value::from(*i),
        Value::Float(f) => serde_json::Number::from_f64(*f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        v => serde_json::Value::String(v.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::{Engine, QueryResponse};
    use crate::{
        config::Config,
        error::{Error, Result},
        sql::{executor::ResultSet, parser::ast::SqlKind, types::Value},
    };

    fn row(id: i64, name: &str) -> Vec<Value> {
        vec![Value::Integer(id), Value::String(name.into())]
    }

    #[test]
    fn test_orders_scenario() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let engine = Engine::new(Config::with_base_path(dir.path()))?;
        let mut s = engine.session();
        let columns = vec!["id".to_string(), "name".to_string()];

        assert_eq!(
            s.execute("CREATE WORKBOOK orders")?,
            ResultSet::Ddl {
                kind: SqlKind::CreateWorkbook,
                message: "Workbook created successfully".into(),
            }
        );
        assert_eq!(
            s.execute("CREATE SHEET orders.lines (id:NUMBER,name:STRING)")?,
            ResultSet::Ddl {
                kind: SqlKind::CreateSheet,
                message: "Sheet created successfully".into(),
            }
        );
        s.execute("USE WORKBOOK orders")?;
        assert_eq!(
            s.execute("INSERT INTO lines VALUES (1,'a')")?,
            ResultSet::Insert { count: 1 }
        );
        assert_eq!(
            s.execute("SELECT * FROM lines WHERE id=1")?,
            ResultSet::Scan {
                columns: columns.clone(),
                rows: vec![row(1, "a")],
            }
        );
        assert_eq!(
            s.execute("UPDATE lines SET id=id+1 WHERE name='a'")?,
            ResultSet::Update { count: 1 }
        );
        assert_eq!(
            s.execute("SELECT * FROM lines")?,
            ResultSet::Scan {
                columns: columns.clone(),
                rows: vec![row(2, "a")],
            }
        );
        assert_eq!(
            s.execute("DELETE FROM lines WHERE id=2")?,
            ResultSet::Delete { count: 1 }
        );
        assert_eq!(
            s.execute("SELECT * FROM lines")?,
            ResultSet::Scan {
                columns,
                rows: vec![],
            }
        );
        Ok(())
    }

    #[test]
    fn test_update_then_order_by() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let engine = Engine::new(Config::with_base_path(dir.path()))?;
        let mut s = engine.session();

        s.execute("CREATE WORKBOOK orders;")?;
        s.execute("CREATE SHEET orders.lines (id:NUMBER,name:STRING);")?;
        s.execute("USE WORKBOOK orders;")?;
        assert_eq!(
            s.execute("INSERT INTO lines VALUES (1,'a'),(2,'b');")?,
            ResultSet::Insert { count: 2 }
        );
        assert_eq!(
            s.execute("SELECT * FROM lines WHERE id >= 2;")?,
            ResultSet::Scan {
                columns: vec!["id".into(), "name".into()],
                rows: vec![row(2, "b")],
            }
        );
        assert_eq!(
            s.execute("UPDATE lines SET id = id + 10 WHERE name = 'a';")?,
            ResultSet::Update { count: 1 }
        );
        assert_eq!(
            s.execute("SELECT id FROM lines ORDER BY id DESC LIMIT 1;")?,
            ResultSet::Scan {
                columns: vec!["id".into()],
                rows: vec![vec![Value::Integer(11)]],
            }
        );
        Ok(())
    }

    #[test]
    fn test_writes_invalidate_cached_results() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let engine = Engine::new(Config::with_base_path(dir.path()))?;
        let mut s = engine.session();
        s.execute("CREATE WORKBOOK w;")?;
        s.execute("USE WORKBOOK w;")?;
        s.execute("CREATE SHEET t (n:NUMBER);")?;
        s.execute("INSERT INTO t VALUES (1);")?;

        let sql = "SELECT n FROM t;";
        let first = s.execute(sql)?;
        let hits = engine.cache_stats().hits;
        assert_eq!(s.execute(sql)?, first);
        assert!(engine.cache_stats().hits > hits);

        s.execute("UPDATE t SET n = n + 1;")?;
        assert_eq!(
            s.execute(sql)?,
            ResultSet::Scan {
                columns: vec!["n".into()],
                rows: vec![vec![Value::Integer(2)]],
            }
        );

        // a second session sees the first one's writes
        let mut other = engine.session();
        other.execute_in("INSERT INTO t VALUES (5);", "w")?;
        assert_eq!(other.current_workbook(), None);
        match s.execute(sql)? {
            ResultSet::Scan { rows, .. } => assert_eq!(rows.len(), 2),
            rs => panic!("expected scan, got {:?}", rs),
        }
        Ok(())
    }

    #[test]
    fn test_unqualified_without_workbook() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut s = Engine::new(Config::with_base_path(dir.path()))?.session();
        match s.execute("SELECT * FROM t;") {
            Err(Error::Reference(msg)) => assert!(msg.contains("USE WORKBOOK")),
            other => panic!("expected reference error, got {:?}", other),
        }
        assert!(matches!(s.execute(""), Err(Error::Parse(_))));
        Ok(())
    }

    #[test]
    fn test_query_response_json() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut s = Engine::new(Config::with_base_path(dir.path()))?.session();
        s.execute("CREATE WORKBOOK w;")?;
        s.execute("CREATE SHEET w.t (a:NUMBER, b:STRING);")?;

        let response = s.query("INSERT INTO w.t VALUES (1.5, 'x');");
        assert!(matches!(
            response,
            QueryResponse::Affected { affected_rows: 1, ref statement_kind, .. } if statement_kind == "INSERT"
        ));

        let json: serde_json::Value = serde_json::from_str(&s.query("SELECT * FROM w.t;").to_json()?)?;
        assert_eq!(json["columns"], serde_json::json!(["a", "b"]));
        assert_eq!(json["rows"], serde_json::json!([[1.5, "x"]]));
        assert_eq!(json["rowCount"], 1);

        let json: serde_json::Value = serde_json::from_str(&s.query("SELECT * FROM w.nope;").to_json()?)?;
        assert_eq!(json["success"], false);
        assert_eq!(json["errorCode"], "REFERENCE_ERROR");
        Ok(())
    }
}

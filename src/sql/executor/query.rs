use std::{cmp::Ordering, path::Path, sync::Arc};

use crate::{
    error::{Error, Result},
    sql::{
        executor::{
            Context, Executor, ResultSet,
            agg::{self, AggSpec},
            eval::{Predicate, resolve_name},
        },
        parser::ast::{self, OrderDirection, SelectItem},
        schema::{Sheet, unqualified},
        types::Value,
    },
    storage::{FileStamp, codec},
};

/// Matching rows together with the sheet they came from and the file stamp taken before
/// the read
type Scanned = (Arc<Sheet>, Vec<Vec<Value>>, Option<FileStamp>);

/// SELECT executor
///
/// Rows flow through filter, grouping, HAVING, sort, projection, DISTINCT and finally
/// OFFSET/LIMIT. Aggregate values are appended to each grouped row under their synthetic
/// keys (`SUM(x)`), so every later stage resolves names against one column list.
pub struct Select {
    select: ast::Select,
}

impl Select {
    pub fn new(select: ast::Select) -> Box<Self> {
        Box::new(Self { select })
    }

    /// Cache key covering everything that shapes the result
    fn signature(&self, workbook: &str, max_rows: usize) -> String {
        let s = &self.select;
        let cols = s
            .items
            .iter()
            .map(|item| match item {
                SelectItem::Wildcard => "*".to_string(),
                SelectItem::Column { name, alias } => with_alias(name, alias.as_deref()),
                SelectItem::Aggregate { aggregate, alias } => {
                    with_alias(&aggregate.key(), alias.as_deref())
                }
            })
            .collect::<Vec<_>>()
            .join(",");
        let order = s
            .order_by
            .iter()
            .map(|(col, dir)| match dir {
                OrderDirection::Asc => col.clone(),
                OrderDirection::Desc => format!("{} DESC", col),
            })
            .collect::<Vec<_>>()
            .join(",");
        let mut sig = format!(
            "{}:{}:{}{}:{}:{}:LIMIT:{}:OFFSET:{}:MAX:{}",
            workbook.to_lowercase(),
            s.table.name.to_lowercase(),
            if s.distinct { "DISTINCT " } else { "" },
            cols,
            s.predicate.as_deref().unwrap_or(""),
            order,
            s.limit.map(|n| n.to_string()).unwrap_or_default(),
            s.offset.unwrap_or(0),
            max_rows,
        );
        if !s.group_by.is_empty() || s.having.is_some() {
            sig.push_str(&format!(
                ":GROUP:{}:HAVING:{}",
                s.group_by.join(","),
                s.having.as_deref().unwrap_or("")
            ));
        }
        sig
    }

    /// Number of leading matches that settle the result, when nothing after the filter
    /// needs to see every row
    fn early_stop(&self) -> Option<usize> {
        let s = &self.select;
        if s.has_aggregates() || !s.group_by.is_empty() || !s.order_by.is_empty() || s.distinct {
            return None;
        }
        s.limit.map(|limit| limit.saturating_add(s.offset.unwrap_or(0)))
    }

    fn predicate(&self, ctx: &Context, columns: &[String]) -> Result<Option<Predicate>> {
        let strict = ctx.config.security.strict_predicates;
        self.select
            .predicate
            .as_deref()
            .map(|text| Predicate::for_columns(text, columns, strict))
            .transpose()
    }

    /// Reads rows straight from the file until `stop` of them match, leaving the sheet
    /// cache alone. None when the file holds a row wider than its header, which only a
    /// full read can place.
    fn stream(&self, ctx: &Context, workbook: &str, path: &Path, name: &str, stop: usize) -> Result<Option<Scanned>> {
        let stamp = FileStamp::of(path);
        let mut stream = ctx
            .loader
            .load(workbook, path, |path| codec::stream_sheet(path, name))?;
        let width = stream.sheet().columns.len();
        let predicate = self.predicate(ctx, &stream.sheet().column_names())?;
        let page_size = ctx.config.performance.page_size.max(1);

        let mut rows = Vec::new();
        let mut read = 0;
        while rows.len() < stop {
            let Some(row) = stream.next() else {
                break;
            };
            let row = row?;
            if row.values.len() > width {
                log::debug!("{}.{} has rows wider than its header, reading it whole", workbook, name);
                return Ok(None);
            }
            read += 1;
            if read % page_size == 0 {
                ctx.check_deadline()?;
            }
            if predicate.as_ref().is_none_or(|p| p.matches(&row.values)) {
                rows.push(row.values);
            }
        }
        log::debug!("streamed {} rows of {}.{} for {} matches", read, workbook, name, rows.len());
        Ok(Some((Arc::new(stream.into_sheet()), rows, stamp)))
    }

    /// Matching rows, each padded to the sheet's width
    fn scan(&self, ctx: &Context, workbook: &str, sheet: &Sheet, predicate: Option<&Predicate>) -> Result<Vec<Vec<Value>>> {
        let width = sheet.columns.len();
        let row_values = |values: &[Value]| {
            let mut values = values.to_vec();
            values.resize(width, Value::Null);
            values
        };

        if let Some(mut row_nums) = predicate.and_then(|p| self.index_lookup(ctx, workbook, sheet, p)) {
            row_nums.sort_unstable();
            let rows = row_nums
                .into_iter()
                .filter_map(|n| sheet.rows.get(n))
                .map(|row| row_values(&row.values))
                .filter(|values| predicate.is_none_or(|p| p.matches(values)))
                .collect();
            return Ok(rows);
        }

        let page_size = ctx.config.performance.page_size.max(1);
        let stop = self.early_stop();
        let mut rows = Vec::new();
        for page in 0..sheet.row_count().div_ceil(page_size) {
            ctx.check_deadline()?;
            for row in sheet.rows.page(page, page_size) {
                let values = row_values(&row.values);
                if predicate.is_none_or(|p| p.matches(&values)) {
                    rows.push(values);
                }
                if stop.is_some_and(|n| rows.len() >= n) {
                    log::debug!("scan of {} stopped after {} rows", sheet.name, rows.len());
                    return Ok(rows);
                }
            }
        }
        Ok(rows)
    }

    /// Candidate row numbers from an index, when the predicate is one equality or a
    /// numeric range on an indexed column
    fn index_lookup(&self, ctx: &Context, workbook: &str, sheet: &Sheet, predicate: &Predicate) -> Option<Vec<usize>> {
        let (column, rows) = match predicate.equality() {
            Some((ordinal, literal)) => {
                let column = sheet.columns.get(ordinal)?;
                let key = Value::parse_literal(literal).coerce(column.datatype);
                (column, ctx.indexes.query(workbook, &sheet.name, &column.name, &key)?)
            }
            None => {
                let (ordinal, low, high) = predicate.numeric_range()?;
                let column = sheet.columns.get(ordinal)?;
                (column, ctx.indexes.range(workbook, &sheet.name, &column.name, low, high)?)
            }
        };
        log::debug!(
            "index on {}.{}({}) matched {} rows",
            workbook,
            sheet.name,
            column.name,
            rows.len()
        );
        Some(rows)
    }
}

fn with_alias(name: &str, alias: Option<&str>) -> String {
    match alias {
        Some(alias) => format!("{} AS {}", name, alias),
        None => name.to_string(),
    }
}

impl Executor for Select {
    fn execute(self: Box<Self>, ctx: &mut Context) -> Result<ResultSet> {
        let workbook = ctx.workbook_name(self.select.table.workbook.as_deref())?;
        let max_rows = ctx.config.security.max_query_rows;
        let signature = self.signature(&workbook, max_rows);
        if let Some(cached) = ctx.cache.get_query(&signature) {
            return Ok((*cached).clone());
        }

        let (info, name) = ctx.resolve_sheet(&workbook, &self.select.table.name)?;
        // a LIMIT that settles early reads only the leading rows of a sheet not yet loaded;
        // indexed sheets load whole so lookups can address rows by number
        let streamed = match self.early_stop() {
            Some(stop)
                if !ctx.cache.has_sheet(&workbook, &name)
                    && ctx.indexes.indexed_columns(&workbook, &name).is_empty() =>
            {
                self.stream(ctx, &workbook, &info.path, &name, stop)?
            }
            _ => None,
        };
        let (sheet, mut rows, stamp) = match streamed {
            Some(scanned) => scanned,
            None => {
                let snapshot = ctx.sheet(&workbook, &name)?;
                let predicate = self.predicate(ctx, &snapshot.sheet.column_names())?;
                let rows = self.scan(ctx, &workbook, &snapshot.sheet, predicate.as_ref())?;
                (snapshot.sheet, rows, snapshot.stamp)
            }
        };
        ctx.check_deadline()?;
        let strict = ctx.config.security.strict_predicates;
        let s = &self.select;

        // Working columns: the sheet's own, then one per aggregate
        let mut columns = sheet.column_names();

        let aliases = s.aliases();
        if s.has_aggregates() || !s.group_by.is_empty() {
            let group_by = s
                .group_by
                .iter()
                .map(|name| position(&columns, &aliases, name, &sheet.name))
                .collect::<Result<Vec<_>>>()?;
            let aggregates = s.aggregates();
            let specs = aggregates
                .iter()
                .map(|a| {
                    let column = match &a.column {
                        Some(name) => Some(position(&columns, &[], name, &sheet.name)?),
                        None => None,
                    };
                    Ok(AggSpec { func: a.func, column })
                })
                .collect::<Result<Vec<_>>>()?;
            rows = agg::aggregate(&rows, columns.len(), &group_by, &specs);
            columns.extend(aggregates.iter().map(|a| a.key()));

            if let Some(having) = &s.having {
                let having = Predicate::compile(
                    having,
                    |name| lookup(&columns, &aliases, name),
                    strict,
                )?;
                rows.retain(|row| having.matches(row));
            }
        }

        if !s.order_by.is_empty() {
            let keys = s
                .order_by
                .iter()
                .map(|(name, dir)| Ok((position(&columns, &aliases, name, &sheet.name)?, *dir)))
                .collect::<Result<Vec<_>>>()?;
            // stable, so ties keep sheet order
            rows.sort_by(|a, b| {
                for (i, dir) in &keys {
                    match a[*i].total_cmp(&b[*i]) {
                        Ordering::Equal => {}
                        o if *dir == OrderDirection::Asc => return o,
                        o => return o.reverse(),
                    }
                }
                Ordering::Equal
            });
        }

        let (names, positions) = project(&sheet, &columns, &s.items)?;
        let mut rows: Vec<Vec<Value>> = rows
            .into_iter()
            .map(|row| positions.iter().map(|&i| row[i].clone()).collect())
            .collect();
        if s.distinct {
            rows = agg::distinct(rows);
        }

        let mut rows: Vec<Vec<Value>> = rows
            .into_iter()
            .skip(s.offset.unwrap_or(0))
            .take(s.limit.unwrap_or(usize::MAX))
            .collect();
        if rows.len() > max_rows {
            log::warn!(
                "result of {} rows truncated to security.max_query_rows = {}",
                rows.len(),
                max_rows
            );
            rows.truncate(max_rows);
        }

        let result = ResultSet::Scan {
            columns: names,
            rows,
        };
        ctx.cache.put_query(
            &signature,
            &workbook,
            &sheet.name,
            Arc::new(result.clone()),
            vec![(info.path.clone(), stamp)],
        );
        Ok(result)
    }
}

/// Resolves a name against the working columns, then through a projection alias
fn lookup(columns: &[String], aliases: &[(String, String)], name: &str) -> Option<usize> {
    resolve_name(columns, name).or_else(|| {
        aliases
            .iter()
            .find(|(alias, _)| alias.eq_ignore_ascii_case(name))
            .and_then(|(_, key)| resolve_name(columns, key))
    })
}

fn position(columns: &[String], aliases: &[(String, String)], name: &str, sheet: &str) -> Result<usize> {
    lookup(columns, aliases, name).ok_or_else(|| {
        Error::Reference(format!("column {} does not exist in sheet {}", name, sheet))
    })
}

/// Output names and working-row positions of the projected columns
fn project(sheet: &Sheet, columns: &[String], items: &[SelectItem]) -> Result<(Vec<String>, Vec<usize>)> {
    let mut names = Vec::new();
    let mut positions = Vec::new();
    for item in items {
        match item {
            SelectItem::Wildcard => {
                for (i, column) in sheet.columns.iter().enumerate() {
                    names.push(column.name.clone());
                    positions.push(i);
                }
            }
            SelectItem::Column { name, alias } => {
                let i = position(columns, &[], name, &sheet.name)?;
                names.push(alias.clone().unwrap_or_else(|| unqualified(name).to_string()));
                positions.push(i);
            }
            SelectItem::Aggregate { aggregate, alias } => {
                let i = position(columns, &[], &aggregate.key(), &sheet.name)?;
                names.push(alias.clone().unwrap_or_else(|| aggregate.key()));
                positions.push(i);
            }
        }
    }
    Ok((names, positions))
}

#[cfg(test)]
mod tests {
    use crate::{
        config::Config,
        error::{Error, Result},
        sql::{
            engine::{Engine, Session},
            executor::ResultSet,
            types::Value,
        },
    };

    fn setup(dir: &std::path::Path) -> Result<Session> {
        let engine = Engine::new(Config::with_base_path(dir))?;
        let mut s = engine.session();
        s.execute("CREATE WORKBOOK shop;")?;
        s.execute("USE WORKBOOK shop;")?;
        s.execute("CREATE SHEET sales (id:NUMBER, region:STRING, amount:NUMBER);")?;
        s.execute(
            "INSERT INTO sales VALUES (1, 'east', 10), (2, 'west', 20), (3, 'east', 5), \
             (4, 'north', NULL), (5, 'west', 7);",
        )?;
        Ok(s)
    }

    fn scan(result: ResultSet) -> (Vec<String>, Vec<Vec<Value>>) {
        match result {
            ResultSet::Scan { columns, rows } => (columns, rows),
            other => panic!("expected scan, got {:?}", other),
        }
    }

    fn ints(rows: &[Vec<Value>], col: usize) -> Vec<Option<i64>> {
        rows.iter()
            .map(|r| match &r[col] {
                Value::Integer(i) => Some(*i),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_filter_sort_limit() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut s = setup(dir.path())?;

        let (columns, rows) =
            scan(s.execute("SELECT id, amount AS amt FROM sales WHERE amount > 6 ORDER BY amount DESC;")?);
        assert_eq!(columns, vec!["id", "amt"]);
        assert_eq!(ints(&rows, 0), vec![Some(2), Some(1), Some(5)]);

        let (_, rows) = scan(s.execute("SELECT * FROM sales ORDER BY amount LIMIT 2 OFFSET 1;")?);
        // nulls sort first ascending
        assert_eq!(ints(&rows, 0), vec![Some(3), Some(5)]);

        let (_, rows) = scan(s.execute("SELECT id FROM sales ORDER BY amount DESC;")?);
        assert_eq!(ints(&rows, 0).last(), Some(&Some(4)));

        let (_, rows) = scan(s.execute("SELECT s.id FROM sales s WHERE s.region = 'east' LIMIT 1;")?);
        assert_eq!(ints(&rows, 0), vec![Some(1)]);
        Ok(())
    }

    #[test]
    fn test_group_by_having() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut s = setup(dir.path())?;

        let (columns, rows) = scan(s.execute(
            "SELECT region, SUM(amount) AS total, COUNT(*) FROM sales \
             GROUP BY region HAVING total > 10 ORDER BY total DESC;",
        )?);
        assert_eq!(columns, vec!["region", "total", "COUNT(*)"]);
        assert_eq!(
            rows,
            vec![
                vec![Value::String("west".into()), Value::Integer(27), Value::Integer(2)],
                vec![Value::String("east".into()), Value::Integer(15), Value::Integer(2)],
            ]
        );

        let (_, rows) = scan(s.execute("SELECT COUNT(amount), AVG(amount), MAX(id) FROM sales;")?);
        assert_eq!(
            rows,
            vec![vec![Value::Integer(4), Value::Float(10.5), Value::Integer(5)]]
        );
        Ok(())
    }

    #[test]
    fn test_distinct_and_index() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut s = setup(dir.path())?;

        let (_, rows) = scan(s.execute("SELECT DISTINCT region FROM sales LIMIT 2;")?);
        assert_eq!(
            rows,
            vec![vec![Value::String("east".into())], vec![Value::String("west".into())]]
        );

        s.execute("CREATE INDEX ON sales (region);")?;
        let (_, rows) = scan(s.execute("SELECT id FROM sales WHERE region = 'west';")?);
        assert_eq!(ints(&rows, 0), vec![Some(2), Some(5)]);

        // the index follows writes
        s.execute("UPDATE sales SET region = 'west' WHERE id = 1;")?;
        let (_, rows) = scan(s.execute("SELECT id FROM sales WHERE region = 'west';")?);
        assert_eq!(ints(&rows, 0), vec![Some(1), Some(2), Some(5)]);
        Ok(())
    }

    #[test]
    fn test_reference_errors() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut s = setup(dir.path())?;

        assert!(matches!(s.execute("SELECT nope FROM sales;"), Err(Error::Reference(_))));
        assert!(matches!(s.execute("SELECT * FROM nope;"), Err(Error::Reference(_))));
        assert!(matches!(
            s.execute("SELECT * FROM sales ORDER BY nope;"),
            Err(Error::Reference(_))
        ));
        assert!(matches!(
            s.execute("SELECT * FROM sales WHERE nope = 1;"),
            Err(Error::Reference(_))
        ));
        Ok(())
    }

    #[test]
    fn test_max_query_rows() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut config = Config::with_base_path(dir.path());
        config.security.max_query_rows = 2;
        let mut s = Engine::new(config)?.session();
        s.execute("CREATE WORKBOOK w;")?;
        s.execute("CREATE SHEET w.t (a:NUMBER);")?;
        s.execute("INSERT INTO w.t VALUES (1), (2), (3);")?;

        let (_, rows) = scan(s.execute("SELECT * FROM w.t;")?);
        assert_eq!(rows.len(), 2);
        Ok(())
    }

    #[test]
    fn test_limit_reads_only_leading_rows() -> Result<()> {
        let dir = tempfile::tempdir()?;
        // rows past the first 150 are not valid UTF-8, so only a partial read succeeds
        let mut bytes = b"n\n".to_vec();
        for i in 1..=150 {
            bytes.extend(format!("{}\n", i).into_bytes());
        }
        bytes.extend(b"\xff\xfe\n");
        std::fs::write(dir.path().join("big.csv"), bytes)?;

        let mut config = Config::with_base_path(dir.path());
        config.storage.retry_delay_ms = 1;
        let engine = Engine::new(config)?;
        let mut s = engine.session();

        let (columns, rows) = scan(s.execute("SELECT n FROM big.big LIMIT 2;")?);
        assert_eq!(columns, vec!["n"]);
        assert_eq!(ints(&rows, 0), vec![Some(1), Some(2)]);
        let (_, rows) = scan(s.execute("SELECT * FROM big.big WHERE n > 140 LIMIT 2 OFFSET 1;")?);
        assert_eq!(ints(&rows, 0), vec![Some(142), Some(143)]);
        assert_eq!(engine.cache_stats().sheet_entries, 0);

        assert!(s.execute("SELECT n FROM big.big ORDER BY n LIMIT 2;").is_err());
        Ok(())
    }

    #[test]
    fn test_limit_matches_full_read() -> Result<()> {
        let dir = tempfile::tempdir()?;
        setup(dir.path())?;
        let sql = "SELECT id, region FROM sales WHERE amount > 6 LIMIT 2 OFFSET 1;";

        // a fresh engine has nothing cached, so this read stops early
        let engine = Engine::new(Config::with_base_path(dir.path()))?;
        let streamed = engine.session().execute_in(sql, "shop")?;
        assert_eq!(engine.cache_stats().sheet_entries, 0);

        // drop the cached result, then load the sheet whole
        engine.clear_caches();
        engine.session().execute_in("SELECT COUNT(*) FROM sales;", "shop")?;
        assert_eq!(engine.cache_stats().sheet_entries, 1);
        let loaded = engine.session().execute_in(sql, "shop")?;
        assert_eq!(streamed, loaded);
        let (_, rows) = scan(loaded);
        assert_eq!(ints(&rows, 0), vec![Some(2), Some(5)]);
        Ok(())
    }

    #[test]
    fn test_range_uses_index() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut s = setup(dir.path())?;
        s.execute("CREATE INDEX ON sales (amount);")?;

        let (_, rows) = scan(s.execute("SELECT id FROM sales WHERE amount >= 7 AND amount <= 20;")?);
        assert_eq!(ints(&rows, 0), vec![Some(1), Some(2), Some(5)]);
        let (_, rows) = scan(s.execute("SELECT id FROM sales WHERE amount > 7;")?);
        assert_eq!(ints(&rows, 0), vec![Some(1), Some(2)]);

        s.execute("UPDATE sales SET amount = 8 WHERE id = 3;")?;
        let (_, rows) = scan(s.execute("SELECT id FROM sales WHERE amount < 9 AND amount >= 7;")?);
        assert_eq!(ints(&rows, 0), vec![Some(3), Some(5)]);

        // text cells compare as text, so the lookup falls back to a scan
        s.execute("INSERT INTO sales VALUES (6, 'east', '8x');")?;
        let (_, rows) = scan(s.execute("SELECT id FROM sales WHERE amount > 7 AND amount < 9;")?);
        assert_eq!(ints(&rows, 0), vec![Some(3), Some(6)]);
        Ok(())
    }
}

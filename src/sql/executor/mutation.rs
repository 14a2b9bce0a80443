use crate::{
    error::{Error, Result},
    sql::{
        executor::{
            Context, Executor, ResultSet,
            eval::{Assignment, Predicate, resolve_name},
            sheet_position,
        },
        parser::ast,
        schema::{Row, RowArena, Sheet},
        types::Value,
    },
};

/// INSERT executor
pub struct Insert {
    insert: ast::Insert,
}

impl Insert {
    pub fn new(insert: ast::Insert) -> Box<Self> {
        Box::new(Self { insert })
    }
}

/// Spreadsheet files keep no trace of a row without a single non-empty cell
fn is_blank(values: &[Value]) -> bool {
    values
        .iter()
        .all(|v| matches!(v, Value::Null) || matches!(v, Value::String(s) if s.is_empty()))
}

fn check_not_blank(sheet: &Sheet, values: Vec<Value>) -> Result<Vec<Value>> {
    if is_blank(&values) {
        return Err(Error::Cardinality(format!(
            "a row of {} needs at least one non-empty value",
            sheet.name
        )));
    }
    Ok(values)
}

// Positional form: values line up with the sheet's columns one to one.
// insert into t values (1, 'a')   on   a  b  c   -> Cardinality error, missing c
fn positional_row(sheet: &Sheet, values: &[Value]) -> Result<Vec<Value>> {
    let expected = sheet.columns.len();
    if values.len() != expected {
        let detail = if values.len() < expected {
            let missing: Vec<&str> = sheet.columns[values.len()..]
                .iter()
                .map(|c| c.name.as_str())
                .collect();
            format!("missing values for {}", missing.join(", "))
        } else {
            format!("{} extra values", values.len() - expected)
        };
        return Err(Error::Cardinality(format!(
            "sheet {} has {} columns but {} values were given: {}",
            sheet.name,
            expected,
            values.len(),
            detail
        )));
    }
    Ok(sheet
        .columns
        .iter()
        .zip(values)
        .map(|(column, value)| value.clone().coerce(column.datatype))
        .collect())
}

// Named form: columns not listed stay empty.
// insert into t (c, a) values (1, 2)   ->   a=2  b=NULL  c=1
fn named_row(sheet: &Sheet, columns: &[String], values: &[Value]) -> Result<Vec<Value>> {
    let mut row = vec![Value::Null; sheet.columns.len()];
    for (name, value) in columns.iter().zip(values) {
        let column = sheet.must_get_column(name)?;
        row[column.ordinal] = value.clone().coerce(column.datatype);
    }
    Ok(row)
}

impl Executor for Insert {
    fn execute(self: Box<Self>, ctx: &mut Context) -> Result<ResultSet> {
        let table = &self.insert.table;
        let workbook_name = ctx.workbook_name(table.workbook.as_deref())?;
        let mut workbook = ctx.read_workbook(&workbook_name)?;
        let idx = sheet_position(&workbook, &table.name)?;
        let sheet = &mut workbook.sheets[idx];
        if sheet.columns.is_empty() {
            return Err(Error::Reference(format!(
                "sheet {} has no columns to insert into",
                sheet.name
            )));
        }

        // Validate every row before touching the sheet
        let rows = self
            .insert
            .rows
            .iter()
            .map(|values| match &self.insert.columns {
                Some(columns) => named_row(sheet, columns, values),
                None => positional_row(sheet, values),
            })
            .map(|row| check_not_blank(sheet, row?))
            .collect::<Result<Vec<_>>>()?;

        let count = rows.len();
        for values in rows {
            let row_num = sheet.next_row_num();
            sheet.rows.insert(Row::new(row_num, values));
        }
        let sheet_name = sheet.name.clone();
        ctx.persist(&workbook, Some(&sheet_name))?;
        log::debug!("inserted {} rows into {}.{}", count, workbook_name, sheet_name);

        Ok(ResultSet::Insert { count })
    }
}

/// UPDATE executor
pub struct Update {
    update: ast::Update,
}

impl Update {
    pub fn new(update: ast::Update) -> Box<Self> {
        Box::new(Self { update })
    }
}

impl Executor for Update {
    fn execute(self: Box<Self>, ctx: &mut Context) -> Result<ResultSet> {
        let table = &self.update.table;
        let workbook_name = ctx.workbook_name(table.workbook.as_deref())?;
        let mut workbook = ctx.read_workbook(&workbook_name)?;
        let idx = sheet_position(&workbook, &table.name)?;
        let sheet = &mut workbook.sheets[idx];

        let names = sheet.column_names();
        let predicate = self
            .update
            .predicate
            .as_deref()
            .map(|text| Predicate::for_columns(text, &names, ctx.config.security.strict_predicates))
            .transpose()?;
        let assignments = self
            .update
            .assignments
            .iter()
            .map(|(name, expr)| {
                let column = sheet.must_get_column(name)?;
                let assignment = Assignment::compile(expr, |n| resolve_name(&names, n))?;
                Ok((column.ordinal, column.datatype, assignment))
            })
            .collect::<Result<Vec<_>>>()?;

        let width = names.len();
        let mut count = 0;
        'rows: for row in sheet.rows.iter_mut() {
            let mut current = row.values.clone();
            current.resize(width, Value::Null);
            if !predicate.as_ref().is_none_or(|p| p.matches(&current)) {
                continue;
            }
            // every right-hand side sees the row as it was before the update
            let mut changes = Vec::with_capacity(assignments.len());
            for (ordinal, datatype, assignment) in &assignments {
                match assignment.evaluate(&current) {
                    Ok(value) => changes.push((*ordinal, value.coerce(*datatype))),
                    Err(err) => {
                        log::warn!("row {} of {} left unchanged: {}", row.row_num, sheet.name, err);
                        continue 'rows;
                    }
                }
            }
            let mut updated = current;
            for (ordinal, value) in changes {
                updated[ordinal] = value;
            }
            if is_blank(&updated) {
                log::warn!(
                    "row {} of {} left unchanged: it would have no values left",
                    row.row_num,
                    sheet.name
                );
                continue;
            }
            row.values = updated;
            count += 1;
        }

        if count > 0 {
            let sheet_name = sheet.name.clone();
            ctx.persist(&workbook, Some(&sheet_name))?;
        }
        Ok(ResultSet::Update { count })
    }
}

/// DELETE executor
pub struct Delete {
    delete: ast::Delete,
}

impl Delete {
    pub fn new(delete: ast::Delete) -> Box<Self> {
        Box::new(Self { delete })
    }
}

impl Executor for Delete {
    fn execute(self: Box<Self>, ctx: &mut Context) -> Result<ResultSet> {
        let table = &self.delete.table;
        let workbook_name = ctx.workbook_name(table.workbook.as_deref())?;
        let mut workbook = ctx.read_workbook(&workbook_name)?;
        let idx = sheet_position(&workbook, &table.name)?;
        let sheet = &mut workbook.sheets[idx];

        let names = sheet.column_names();
        let predicate = self
            .delete
            .predicate
            .as_deref()
            .map(|text| Predicate::for_columns(text, &names, ctx.config.security.strict_predicates))
            .transpose()?;

        // Survivors move up so the data stays contiguous below the header
        let mut kept = RowArena::new();
        let mut count = 0;
        for row in sheet.rows.iter() {
            let mut current = row.values.clone();
            current.resize(names.len(), Value::Null);
            if predicate.as_ref().is_none_or(|p| p.matches(&current)) {
                count += 1;
                continue;
            }
            let row_num = sheet.data_start_row + kept.len();
            kept.insert(Row::new(row_num, row.values.clone()));
        }

        if count > 0 {
            sheet.rows = kept;
            let sheet_name = sheet.name.clone();
            ctx.persist(&workbook, Some(&sheet_name))?;
        }
        Ok(ResultSet::Delete { count })
    }
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
        let mut s = Engine::new(Config::with_base_path(dir))?.session();
        s.execute("CREATE WORKBOOK inv;")?;
        s.execute("USE WORKBOOK inv;")?;
        s.execute("CREATE SHEET items (sku:STRING, qty:NUMBER, note:STRING);")?;
        Ok(s)
    }

    fn rows(s: &mut Session, sql: &str) -> Result<Vec<Vec<Value>>> {
        match s.execute(sql)? {
            ResultSet::Scan { rows, .. } => Ok(rows),
            other => panic!("expected scan, got {:?}", other),
        }
    }

    #[test]
    fn test_insert() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut s = setup(dir.path())?;

        assert_eq!(
            s.execute("INSERT INTO items VALUES ('a', 1, 'x'), ('b', 2, 'y');")?,
            ResultSet::Insert { count: 2 }
        );
        s.execute("INSERT INTO items (qty, sku) VALUES (3, 'c');")?;

        let got = rows(&mut s, "SELECT sku, qty, note FROM items WHERE sku = 'c';")?;
        assert_eq!(
            got,
            vec![vec![Value::String("c".into()), Value::Integer(3), Value::Null]]
        );

        match s.execute("INSERT INTO items VALUES ('d', 4);") {
            Err(Error::Cardinality(msg)) => assert!(msg.contains("note"), "{}", msg),
            other => panic!("expected cardinality error, got {:?}", other),
        }
        assert!(matches!(
            s.execute("INSERT INTO items (nope) VALUES (1);"),
            Err(Error::Reference(_))
        ));
        // a rejected statement writes nothing
        assert_eq!(rows(&mut s, "SELECT * FROM items;")?.len(), 3);
        Ok(())
    }

    #[test]
    fn test_update_expressions() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut s = setup(dir.path())?;
        s.execute("INSERT INTO items VALUES ('a', 10, 'x'), ('b', NULL, 'y'), ('c', 4, 'z');")?;

        assert_eq!(
            s.execute("UPDATE items SET qty = qty * 2, note = 'doubled' WHERE sku <> 'c';")?,
            ResultSet::Update { count: 2 }
        );
        let got = rows(&mut s, "SELECT qty, note FROM items;")?;
        assert_eq!(
            got,
            vec![
                vec![Value::Integer(20), Value::String("doubled".into())],
                // NULL takes the operand
                vec![Value::Integer(2), Value::String("doubled".into())],
                vec![Value::Integer(4), Value::String("z".into())],
            ]
        );

        s.execute("UPDATE items SET qty = qty / 0;")?;
        let got = rows(&mut s, "SELECT qty FROM items;")?;
        assert_eq!(
            got,
            vec![vec![Value::Integer(20)], vec![Value::Integer(2)], vec![Value::Integer(4)]]
        );

        assert!(matches!(
            s.execute("UPDATE items SET nope = 1;"),
            Err(Error::Reference(_))
        ));
        Ok(())
    }

    #[test]
    fn test_embedded_quotes() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut s = setup(dir.path())?;
        s.execute("INSERT INTO items VALUES ('O''Brien', 1, 'it''s'), ('plain', 2, '');")?;

        let got = rows(&mut s, "SELECT qty, note FROM items WHERE sku = 'O''Brien';")?;
        assert_eq!(got, vec![vec![Value::Integer(1), Value::String("it's".into())]]);

        assert_eq!(
            s.execute("UPDATE items SET sku = 'D''Arcy' WHERE note = 'it''s';")?,
            ResultSet::Update { count: 1 }
        );
        let got = rows(&mut s, "SELECT sku FROM items WHERE sku LIKE 'D''%';")?;
        assert_eq!(got, vec![vec![Value::String("D'Arcy".into())]]);
        assert!(rows(&mut s, "SELECT sku FROM items WHERE sku = 'O''Brien';")?.is_empty());
        Ok(())
    }

    #[test]
    fn test_blank_rows_are_refused() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut s = setup(dir.path())?;

        assert!(matches!(
            s.execute("INSERT INTO items VALUES (NULL, NULL, NULL);"),
            Err(Error::Cardinality(_))
        ));
        assert!(matches!(
            s.execute("INSERT INTO items VALUES ('a', 1, 'x'), ('', NULL, '');"),
            Err(Error::Cardinality(_))
        ));
        assert!(rows(&mut s, "SELECT * FROM items;")?.is_empty());

        s.execute("INSERT INTO items (sku) VALUES ('a'), ('b');")?;
        // blanking the only value of a row would lose it on the next read
        assert_eq!(
            s.execute("UPDATE items SET sku = NULL WHERE sku = 'a';")?,
            ResultSet::Update { count: 0 }
        );
        assert_eq!(
            s.execute("UPDATE items SET sku = NULL, qty = 3 WHERE sku = 'b';")?,
            ResultSet::Update { count: 1 }
        );
        let got = rows(&mut s, "SELECT sku, qty FROM items;")?;
        assert_eq!(
            got,
            vec![
                vec![Value::String("a".into()), Value::Null],
                vec![Value::Null, Value::Integer(3)],
            ]
        );
        Ok(())
    }

    #[test]
    fn test_delete_compacts() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut s = setup(dir.path())?;
        s.execute("INSERT INTO items VALUES ('a', 1, ''), ('b', 2, ''), ('c', 3, ''), ('d', 4, '');")?;

        assert_eq!(
            s.execute("DELETE FROM items WHERE qty >= 2 AND qty <= 3;")?,
            ResultSet::Delete { count: 2 }
        );
        s.execute("INSERT INTO items VALUES ('e', 5, '');")?;
        let got = rows(&mut s, "SELECT sku FROM items;")?;
        let skus: Vec<String> = got.iter().map(|r| r[0].to_string()).collect();
        assert_eq!(skus, vec!["a", "d", "e"]);

        assert_eq!(s.execute("DELETE FROM items;")?, ResultSet::Delete { count: 3 });
        assert!(rows(&mut s, "SELECT * FROM items;")?.is_empty());
        Ok(())
    }
}

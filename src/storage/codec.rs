//! Spreadsheet codec: xlsx/xls through calamine, csv through the csv crate, and
//! writes through rust_xlsxwriter.
//!
//! The first used row of a sheet is its header; a blank header cell is named
//! `Column{n}`. Numbers that are whole read back as integers, date-formatted cells as
//! dates, and a formula cell without a cached value falls back to its formula text.

use std::{
    fs::File,
    io::BufReader,
    path::Path,
    thread,
    time::Duration,
};

use calamine::{Data, Range, Reader, Sheets, open_workbook_auto};
use chrono::{NaiveDate, NaiveDateTime};
use rust_xlsxwriter::Worksheet;

use crate::{
    config::StorageConfig,
    error::{Error, Result},
    sql::{
        schema::{Column, DEFAULT_SHEET, Row, Sheet, Workbook},
        types::{DataType, INFER_SAMPLE, Value, parse_date, parse_datetime},
    },
};

use super::atomic_write;

/// Longest string a spreadsheet cell holds
pub const MAX_CELL_CHARS: usize = 32767;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Format {
    Xlsx,
    Xls,
    Csv,
}

impl Format {
    fn of(path: &Path) -> Self {
        match path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .as_deref()
        {
            Some("csv") => Format::Csv,
            Some("xls") => Format::Xls,
            _ => Format::Xlsx,
        }
    }
}

/// Names of the sheets in file order
pub fn read_sheet_names(path: &Path) -> Result<Vec<String>> {
    match Format::of(path) {
        Format::Csv => Ok(vec![csv_sheet_name(path)]),
        Format::Xlsx | Format::Xls => {
            let workbook = open(path)?;
            Ok(workbook.sheet_names().to_owned())
        }
    }
}

/// Reads one sheet with its header, inferred column types and data rows
pub fn read_sheet(path: &Path, name: &str) -> Result<Sheet> {
    match Format::of(path) {
        Format::Csv => {
            let sheet = read_csv(path)?;
            if !sheet.name.eq_ignore_ascii_case(name) {
                return Err(Error::Reference(format!(
                    "sheet {} does not exist in {}",
                    name,
                    path.display()
                )));
            }
            Ok(sheet)
        }
        Format::Xlsx | Format::Xls => {
            let mut workbook = open(path)?;
            let actual = sheet_name_in(&workbook, name, path)?;
            read_calamine_sheet(&mut workbook, &actual)
        }
    }
}

/// Reads every sheet of a workbook
pub fn read_workbook(name: &str, path: &Path) -> Result<Workbook> {
    let mut workbook = Workbook::new(name, path);
    match Format::of(path) {
        Format::Csv => workbook.sheets.push(read_csv(path)?),
        Format::Xlsx | Format::Xls => {
            let mut source = open(path)?;
            for sheet_name in source.sheet_names().to_owned() {
                workbook
                    .sheets
                    .push(read_calamine_sheet(&mut source, &sheet_name)?);
            }
        }
    }
    Ok(workbook)
}

fn open(path: &Path) -> Result<Sheets<BufReader<File>>> {
    open_workbook_auto(path)
        .map_err(|e| Error::Io(format!("cannot open {}: {}", path.display(), e)))
}

/// Data rows as `(row number, cells)` in file order
type RawRows = Box<dyn Iterator<Item = Result<(usize, Vec<Value>)>>>;

fn calamine_rows(workbook: &mut Sheets<BufReader<File>>, name: &str) -> Result<RawRows> {
    let range = workbook.worksheet_range(name)?;
    // Formula ranges are absent for some formats
    let formulas = workbook.worksheet_formula(name).ok();

    let (row_offset, col_offset) = range.start().unwrap_or((0, 0));
    let (height, width) = range.get_size();
    Ok(Box::new((0..height).map(move |i| {
        let row_num = row_offset as usize + i;
        let values = (0..width)
            .map(|j| {
                let pos = (row_num as u32, col_offset + j as u32);
                range
                    .get((i, j))
                    .map_or(Value::Null, |cell| cell_value(cell, formulas.as_ref(), pos))
            })
            .collect();
        Ok((row_num, values))
    })))
}

fn read_calamine_sheet(workbook: &mut Sheets<BufReader<File>>, name: &str) -> Result<Sheet> {
    let grid = calamine_rows(workbook, name)?.collect::<Result<Vec<_>>>()?;
    Ok(build_sheet(name, grid))
}

/// Converts one calamine cell; formula text stands in for missing or error results
fn cell_value(cell: &Data, formulas: Option<&Range<String>>, pos: (u32, u32)) -> Value {
    let formula = || {
        formulas
            .and_then(|f| f.get_value(pos))
            .filter(|f| !f.is_empty())
            .map(|f| Value::String(format!("={}", f)))
    };
    match cell {
        Data::Empty => formula().unwrap_or(Value::Null),
        Data::String(s) if s.is_empty() => Value::Null,
        Data::String(s) => Value::String(s.clone()),
        Data::Float(f) => Value::number(*f),
        Data::Int(i) => Value::Integer(*i),
        Data::Bool(b) => Value::Boolean(*b),
        Data::DateTime(dt) => from_serial(dt.as_f64()),
        Data::DateTimeIso(s) => parse_datetime(s)
            .map(Value::DateTime)
            .or_else(|| parse_date(s).map(Value::Date))
            .unwrap_or_else(|| Value::String(s.clone())),
        Data::DurationIso(s) => Value::String(s.clone()),
        Data::Error(e) => formula().unwrap_or_else(|| Value::String(e.to_string())),
    }
}

/// Converts a spreadsheet serial date (days since 1899-12-30) to a date or date-time
fn from_serial(serial: f64) -> Value {
    let Some(epoch) = NaiveDate::from_ymd_opt(1899, 12, 30).and_then(|d| d.and_hms_opt(0, 0, 0))
    else {
        return Value::Float(serial);
    };
    let millis = (serial * 86_400_000.0).round();
    let dt: Option<NaiveDateTime> = chrono::Duration::try_milliseconds(millis as i64)
        .filter(|_| millis.is_finite())
        .and_then(|offset| epoch.checked_add_signed(offset));
    let Some(dt) = dt else {
        log::warn!("date serial {} is out of range, kept as a number", serial);
        return Value::number(serial);
    };
    if serial.fract() == 0.0 {
        Value::Date(dt.date())
    } else {
        Value::DateTime(dt)
    }
}

fn csv_sheet_name(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(DEFAULT_SHEET)
        .to_string()
}

fn csv_rows(path: &Path) -> Result<RawRows> {
    let reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)?;
    Ok(Box::new(reader.into_records().enumerate().map(|(row_num, record)| {
        let record = record?;
        Ok((row_num, record.iter().map(Value::from_text).collect()))
    })))
}

fn read_csv(path: &Path) -> Result<Sheet> {
    let grid = csv_rows(path)?.collect::<Result<Vec<_>>>()?;
    Ok(build_sheet(&csv_sheet_name(path), grid))
}

/// Turns a grid of `(row number, cells)` into a sheet: the first row names the columns,
/// fully empty rows are dropped
fn build_sheet(name: &str, grid: Vec<(usize, Vec<Value>)>) -> Sheet {
    let mut grid = grid.into_iter();
    let Some((header_row, header)) = grid.next() else {
        return Sheet::new(name, Vec::new());
    };

    let rows: Vec<Row> = grid
        .map(|(row_num, values)| Row::new(row_num, values))
        .filter(|r| !r.is_empty())
        .collect();
    let width = rows
        .iter()
        .map(|r| r.values.len())
        .max()
        .unwrap_or(0)
        .max(header.len());

    let mut sheet = schema_sheet(name, header_row, &header, &rows, width);
    for row in rows {
        sheet.rows.insert(shape_row(row, &sheet.columns));
    }
    sheet
}

/// A rowless sheet whose column types are inferred from `rows`; a blank header cell is
/// named `Column{n}`
fn schema_sheet(name: &str, header_row: usize, header: &[Value], rows: &[Row], width: usize) -> Sheet {
    let columns: Vec<Column> = (0..width)
        .map(|i| {
            let name = match header.get(i) {
                Some(Value::Null) | None => format!("Column{}", i + 1),
                Some(v) => v.to_string(),
            };
            let datatype = DataType::infer_values(rows.iter().map(|r| r.get(i)));
            Column::new(name, i, datatype)
        })
        .collect();
    let mut sheet = Sheet::new(name, columns);
    sheet.header_row = header_row;
    sheet.data_start_row = header_row + 1;
    sheet
}

/// Pads a row to the sheet's width and turns date text in date columns into dates. Rows
/// wider than the sheet are returned untouched.
fn shape_row(mut row: Row, columns: &[Column]) -> Row {
    if row.values.len() > columns.len() {
        return row;
    }
    row.values.resize(columns.len(), Value::Null);
    for column in columns {
        if matches!(column.datatype, DataType::Date | DataType::DateTime) {
            let value = std::mem::replace(&mut row.values[column.ordinal], Value::Null);
            row.values[column.ordinal] = value.coerce(column.datatype);
        }
    }
    row
}

/// Data rows of one sheet read lazily in file order, blank rows skipped
///
/// Opening the stream reads just enough rows to settle every column's type the way a
/// full read would, so each streamed row equals the row `read_sheet` produces. A row
/// wider than the header seen so far comes back untouched and wider than the sheet.
pub struct RowStream {
    sheet: Sheet,
    sample: std::vec::IntoIter<Row>,
    rest: RawRows,
}

impl RowStream {
    fn open(name: String, mut raw: RawRows) -> Result<Self> {
        let (header_row, header) = match raw.next() {
            Some(first) => first?,
            None => {
                return Ok(Self {
                    sheet: Sheet::new(name, Vec::new()),
                    sample: Vec::new().into_iter(),
                    rest: raw,
                });
            }
        };

        // non-null cells seen per column
        let mut seen = vec![0; header.len()];
        let mut sample = Vec::new();
        while seen.iter().any(|&n| n < INFER_SAMPLE) {
            let Some(next) = raw.next() else {
                break;
            };
            let (row_num, values) = next?;
            let row = Row::new(row_num, values);
            if row.is_empty() {
                continue;
            }
            if seen.len() < row.values.len() {
                seen.resize(row.values.len(), 0);
            }
            for (n, value) in seen.iter_mut().zip(&row.values) {
                if !value.is_null() {
                    *n += 1;
                }
            }
            sample.push(row);
        }

        let sheet = schema_sheet(&name, header_row, &header, &sample, seen.len());
        Ok(Self {
            sheet,
            sample: sample.into_iter(),
            rest: raw,
        })
    }

    /// Name and columns of the sheet; it carries no rows
    pub fn sheet(&self) -> &Sheet {
        &self.sheet
    }

    pub fn into_sheet(self) -> Sheet {
        self.sheet
    }
}

impl Iterator for RowStream {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        let row = match self.sample.next() {
            Some(row) => row,
            None => loop {
                match self.rest.next()? {
                    Ok((row_num, values)) => {
                        let row = Row::new(row_num, values);
                        if !row.is_empty() {
                            break row;
                        }
                    }
                    Err(err) => return Some(Err(err)),
                }
            },
        };
        Some(Ok(shape_row(row, &self.sheet.columns)))
    }
}

/// Opens one sheet for a lazy read
pub fn stream_sheet(path: &Path, name: &str) -> Result<RowStream> {
    match Format::of(path) {
        Format::Csv => {
            let sheet_name = csv_sheet_name(path);
            if !sheet_name.eq_ignore_ascii_case(name) {
                return Err(Error::Reference(format!(
                    "sheet {} does not exist in {}",
                    name,
                    path.display()
                )));
            }
            RowStream::open(sheet_name, csv_rows(path)?)
        }
        Format::Xlsx | Format::Xls => {
            let mut workbook = open(path)?;
            let actual = sheet_name_in(&workbook, name, path)?;
            let rows = calamine_rows(&mut workbook, &actual)?;
            RowStream::open(actual, rows)
        }
    }
}

fn sheet_name_in(workbook: &Sheets<BufReader<File>>, name: &str, path: &Path) -> Result<String> {
    workbook
        .sheet_names()
        .iter()
        .find(|s| s.eq_ignore_ascii_case(name))
        .cloned()
        .ok_or_else(|| Error::Reference(format!("sheet {} does not exist in {}", name, path.display())))
}

/// Writes every sheet of the workbook, replacing the file atomically
pub fn write_workbook(workbook: &Workbook) -> Result<()> {
    let bytes = match Format::of(&workbook.path) {
        Format::Csv => encode_csv(workbook)?,
        Format::Xlsx => encode_xlsx(workbook)?,
        Format::Xls => {
            return Err(Error::Io(format!(
                "{} is a legacy xls workbook and cannot be written",
                workbook.path.display()
            )));
        }
    };
    atomic_write(&workbook.path, &bytes)
}

fn encode_xlsx(workbook: &Workbook) -> Result<Vec<u8>> {
    let mut out = rust_xlsxwriter::Workbook::new();
    if workbook.sheets.is_empty() {
        out.add_worksheet().set_name(DEFAULT_SHEET)?;
    }
    for sheet in &workbook.sheets {
        let worksheet = out.add_worksheet();
        worksheet.set_name(&sheet.name)?;
        for column in &sheet.columns {
            worksheet.write_string(sheet.header_row as u32, column.ordinal as u16, &column.name)?;
        }
        for row in sheet.rows.iter() {
            for (ordinal, value) in row.values.iter().enumerate() {
                write_cell(worksheet, row.row_num as u32, ordinal as u16, value)?;
            }
        }
    }
    Ok(out.save_to_buffer()?)
}

fn write_cell(worksheet: &mut Worksheet, row: u32, col: u16, value: &Value) -> Result<()> {
    match value {
        Value::Null => {}
        // NaN and infinities have no spreadsheet representation; leave the cell empty
        Value::Float(f) if !f.is_finite() => {}
        Value::Float(f) => {
            worksheet.write_number(row, col, *f)?;
        }
        Value::Integer(i) => {
            worksheet.write_number(row, col, *i as f64)?;
        }
        Value::Boolean(b) => {
            worksheet.write_boolean(row, col, *b)?;
        }
        Value::String(s) => {
            worksheet.write_string(row, col, truncate_cell(s))?;
        }
        v @ (Value::Date(_) | Value::DateTime(_)) => {
            worksheet.write_string(row, col, v.to_string())?;
        }
    }
    Ok(())
}

fn truncate_cell(s: &str) -> &str {
    match s.char_indices().nth(MAX_CELL_CHARS) {
        Some((at, _)) => {
            log::warn!("cell text truncated to {} characters", MAX_CELL_CHARS);
            &s[..at]
        }
        None => s,
    }
}

fn encode_csv(workbook: &Workbook) -> Result<Vec<u8>> {
    let Some(sheet) = workbook.sheets.first() else {
        return Ok(Vec::new());
    };
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(sheet.columns.iter().map(|c| c.name.as_str()))?;
    for row in sheet.rows.iter() {
        writer.write_record(row.values.iter().map(|v| match v {
            Value::Null => String::new(),
            Value::Float(f) if !f.is_finite() => String::new(),
            v => v.to_string(),
        }))?;
    }
    writer
        .into_inner()
        .map_err(|e| Error::Io(e.to_string()))
}

/// A workbook holding only the empty placeholder sheet
pub fn empty_workbook(name: &str, path: &Path) -> Workbook {
    let mut workbook = Workbook::new(name, path);
    workbook.sheets.push(Sheet::new(DEFAULT_SHEET, Vec::new()));
    workbook
}

/// Bounded retries around reads of workbook files
#[derive(Debug, Clone)]
pub struct Loader {
    retries: u32,
    delay: Duration,
    auto_repair: bool,
}

impl Loader {
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            retries: config.load_retries.max(1),
            delay: Duration::from_millis(config.retry_delay_ms),
            auto_repair: config.auto_repair_corrupt,
        }
    }

    /// Runs `read` until it succeeds or the retries run out. Only I/O failures are retried.
    /// When auto-repair is enabled the unreadable file is then replaced by an empty
    /// workbook and read once more.
    pub fn load<T>(&self, name: &str, path: &Path, read: impl Fn(&Path) -> Result<T>) -> Result<T> {
        let mut last = None;
        for attempt in 1..=self.retries {
            match read(path) {
                Ok(v) => return Ok(v),
                Err(err @ Error::Io(_)) => {
                    log::warn!(
                        "reading {} failed (attempt {}/{}): {}",
                        path.display(),
                        attempt,
                        self.retries,
                        err
                    );
                    last = Some(err);
                    if attempt < self.retries {
                        thread::sleep(self.delay);
                    }
                }
                Err(err) => return Err(err),
            }
        }

        let err = last.unwrap_or_else(|| Error::Io(format!("cannot read {}", path.display())));
        if !self.auto_repair || !path.exists() {
            return Err(err);
        }
        log::error!(
            "replacing unreadable workbook {} with an empty one: {}",
            path.display(),
            err
        );
        write_workbook(&empty_workbook(name, path))?;
        read(path)
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::{
        Loader, empty_workbook, from_serial, read_sheet, read_sheet_names, read_workbook,
        stream_sheet, write_workbook,
    };
    use crate::{
        config::Config,
        error::{Error, Result},
        sql::{
            schema::{Column, Row, Sheet, Workbook},
            types::{DataType, Value},
        },
    };

    fn people(path: &std::path::Path) -> Workbook {
        let mut sheet = Sheet::new(
            "people",
            vec![
                Column::new("name", 0, DataType::String),
                Column::new("age", 1, DataType::Number),
                Column::new("joined", 2, DataType::Date),
                Column::new("active", 3, DataType::Boolean),
            ],
        );
        let joined = NaiveDate::from_ymd_opt(2023, 4, 1).map(Value::Date).unwrap_or(Value::Null);
        sheet.rows.insert(Row::new(
            1,
            vec![Value::String("ann".into()), Value::Integer(31), joined, Value::Boolean(true)],
        ));
        sheet.rows.insert(Row::new(
            2,
            vec![Value::String("bob".into()), Value::Float(2.5), Value::Null, Value::Boolean(false)],
        ));
        let mut workbook = Workbook::new("hr", path);
        workbook.sheets.push(sheet);
        workbook.sheets.push(Sheet::new("empty", vec![]));
        workbook
    }

    #[test]
    fn test_xlsx_round_trip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("hr.xlsx");
        write_workbook(&people(&path))?;

        assert_eq!(read_sheet_names(&path)?, vec!["people".to_string(), "empty".to_string()]);
        let sheet = read_sheet(&path, "PEOPLE")?;
        assert_eq!(sheet.column_names(), vec!["name", "age", "joined", "active"]);
        assert_eq!(sheet.row_count(), 2);
        assert_eq!(sheet.must_get_column("age")?.datatype, DataType::Number);
        assert_eq!(sheet.must_get_column("joined")?.datatype, DataType::Date);

        let ann = sheet.rows.get(1).cloned().unwrap_or_else(|| Row::new(0, vec![]));
        assert_eq!(ann.get(1), &Value::Integer(31));
        assert_eq!(ann.get(2), &Value::Date(NaiveDate::from_ymd_opt(2023, 4, 1).unwrap_or_default()));
        assert_eq!(ann.get(3), &Value::Boolean(true));

        assert!(matches!(read_sheet(&path, "missing"), Err(Error::Reference(_))));
        assert_eq!(read_workbook("hr", &path)?.sheets.len(), 2);
        Ok(())
    }

    #[test]
    fn test_blank_header_and_nan() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("m.xlsx");
        let mut sheet = Sheet::new("s", vec![Column::new("a", 0, DataType::Number)]);
        sheet.rows.insert(Row::new(1, vec![Value::Float(f64::NAN), Value::Integer(7)]));
        sheet.rows.insert(Row::new(2, vec![Value::Integer(1), Value::String("x".repeat(40000))]));
        let mut workbook = Workbook::new("m", &path);
        workbook.sheets.push(sheet);
        write_workbook(&workbook)?;

        let sheet = read_sheet(&path, "s")?;
        assert_eq!(sheet.column_names(), vec!["a", "Column2"]);
        assert_eq!(sheet.rows.get(1).map(|r| r.get(0).clone()), Some(Value::Null));
        let long = sheet.rows.get(2).map(|r| r.get(1).to_string().chars().count());
        assert_eq!(long, Some(32767));
        Ok(())
    }

    #[test]
    fn test_csv_round_trip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("items.csv");
        std::fs::write(&path, "id,label,price\n1,\"a, b\",2.5\n2,c,\n")?;

        let sheet = read_sheet(&path, "items")?;
        assert_eq!(sheet.column_names(), vec!["id", "label", "price"]);
        assert_eq!(sheet.rows.get(1).map(|r| r.get(1).clone()), Some(Value::String("a, b".into())));
        assert_eq!(sheet.rows.get(2).map(|r| r.get(2).clone()), Some(Value::Null));

        let workbook = read_workbook("items", &path)?;
        write_workbook(&workbook)?;
        let again = read_sheet(&path, "items")?;
        assert_eq!(again.rows, sheet.rows);
        Ok(())
    }

    #[test]
    fn test_loader_repair_is_opt_in() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("broken.xlsx");
        std::fs::write(&path, b"definitely not a zip archive")?;

        let mut config = Config::with_base_path(dir.path());
        config.storage.retry_delay_ms = 1;
        let loader = Loader::new(&config.storage);
        assert!(matches!(
            loader.load("broken", &path, read_sheet_names),
            Err(Error::Io(_))
        ));
        assert_eq!(std::fs::read(&path)?, b"definitely not a zip archive");

        config.storage.auto_repair_corrupt = true;
        let loader = Loader::new(&config.storage);
        assert_eq!(loader.load("broken", &path, read_sheet_names)?, vec!["Sheet1".to_string()]);
        Ok(())
    }

    #[test]
    fn test_empty_workbook() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("new.xlsx");
        write_workbook(&empty_workbook("new", &path))?;
        let sheet = read_sheet(&path, "Sheet1")?;
        assert!(sheet.columns.is_empty());
        assert_eq!(sheet.row_count(), 0);
        Ok(())
    }

    #[test]
    fn test_serial_out_of_range() {
        assert_eq!(
            from_serial(45000.0),
            Value::Date(NaiveDate::from_ymd_opt(2023, 3, 15).unwrap())
        );
        assert_eq!(from_serial(1e20), Value::Float(1e20));
        assert_eq!(from_serial(-1e15), Value::Integer(-1_000_000_000_000_000));
    }

    #[test]
    fn test_stream_matches_full_read() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("people.xlsx");
        write_workbook(&people(&path))?;

        let full = read_sheet(&path, "PEOPLE")?;
        let stream = stream_sheet(&path, "PEOPLE")?;
        assert_eq!(stream.sheet().name, full.name);
        assert_eq!(stream.sheet().columns, full.columns);
        assert!(stream.sheet().rows.is_empty());
        let rows = stream.collect::<Result<Vec<_>>>()?;
        assert_eq!(rows, full.rows.iter().cloned().collect::<Vec<_>>());

        assert!(matches!(stream_sheet(&path, "nope"), Err(Error::Reference(_))));
        Ok(())
    }

    #[test]
    fn test_stream_reads_lazily() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("big.csv");
        let mut bytes = b"n\n".to_vec();
        for i in 1..=150 {
            bytes.extend(format!("{}\n", i).into_bytes());
        }
        bytes.extend(b"\xff\xfe\n");
        std::fs::write(&path, bytes)?;

        assert!(read_sheet(&path, "big").is_err());
        let mut stream = stream_sheet(&path, "big")?;
        assert_eq!(stream.sheet().columns[0].datatype, DataType::Number);
        let first = stream.next().transpose()?.map(|r| r.values);
        assert_eq!(first, Some(vec![Value::Integer(1)]));
        Ok(())
    }

    #[test]
    fn test_stream_returns_wide_rows_untouched() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("ragged.csv");
        let mut text = String::from("a\n");
        for i in 0..120 {
            text.push_str(&format!("{}\n", i));
        }
        text.push_str("1,2\n");
        std::fs::write(&path, text)?;

        let stream = stream_sheet(&path, "ragged")?;
        assert_eq!(stream.sheet().columns.len(), 1);
        let widths: Vec<usize> = stream
            .map(|r| r.map(|r| r.values.len()))
            .collect::<Result<_>>()?;
        assert_eq!(widths.len(), 121);
        assert_eq!(widths[120], 2);
        assert_eq!(read_sheet(&path, "ragged")?.columns.len(), 2);
        Ok(())
    }
}

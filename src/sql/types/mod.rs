use std::{borrow::Cow, cmp::Ordering, fmt::Display};

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

/// Column data types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    String,
    Number,
    Boolean,
    Date,
    DateTime,
}

const DATETIME_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y/%m/%d %H:%M:%S",
];

const DATE_FORMATS: [&str; 3] = ["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y"];

/// Rows sampled per column when inferring its type
pub const INFER_SAMPLE: usize = 100;

impl DataType {
    /// Maps a declared type name (`id:NUMBER`) to a data type, defaulting to String
    pub fn from_declared(name: &str) -> Self {
        match name.trim().to_uppercase().as_ref() {
            "NUMBER" | "INT" | "INTEGER" | "DOUBLE" | "FLOAT" | "DECIMAL" => Self::Number,
            "DATE" => Self::Date,
            "DATETIME" | "TIMESTAMP" => Self::DateTime,
            "BOOLEAN" | "BOOL" => Self::Boolean,
            _ => Self::String,
        }
    }

    /// Infers the type of a single cell's text
    pub fn infer(text: &str) -> Self {
        let text = text.trim();
        let lower = text.to_lowercase();
        if matches!(
            lower.as_ref(),
            "true" | "false" | "1" | "0" | "yes" | "no" | "y" | "n"
        ) {
            return Self::Boolean;
        }
        if text.parse::<f64>().is_ok() {
            return Self::Number;
        }
        if parse_datetime(text).is_some() {
            return Self::DateTime;
        }
        if parse_date(text).is_some() {
            return Self::Date;
        }
        Self::String
    }

    /// Infers a column type from sampled cell texts; empty cells are skipped
    pub fn infer_column<'a>(samples: impl IntoIterator<Item = &'a str>) -> Self {
        let mut found: Option<DataType> = None;
        // 1/0 infer as booleans but still belong in a number column
        let mut all_numeric = true;
        for text in samples
            .into_iter()
            .filter(|t| !t.trim().is_empty())
            .take(INFER_SAMPLE)
        {
            all_numeric &= text.trim().parse::<f64>().is_ok();
            let t = Self::infer(text);
            found = Some(match (found, t) {
                (None, t) => t,
                (Some(a), b) if a == b => a,
                (Some(Self::Boolean | Self::Number), Self::Boolean | Self::Number) if all_numeric => {
                    Self::Number
                }
                (Some(Self::Date | Self::DateTime), Self::Date | Self::DateTime) => Self::DateTime,
                _ => return Self::String,
            });
        }
        found.unwrap_or(Self::String)
    }
}

impl DataType {
    /// Infers a column type from typed cell values. Text-only columns go through text
    /// inference; typed columns keep their type, widening Date to DateTime and anything
    /// else mixed to String.
    pub fn infer_values<'a>(values: impl IntoIterator<Item = &'a Value>) -> Self {
        let samples: Vec<&Value> = values
            .into_iter()
            .filter(|v| !v.is_null())
            .take(INFER_SAMPLE)
            .collect();
        if samples.iter().all(|v| matches!(v, Value::String(_))) {
            return Self::infer_column(samples.iter().filter_map(|v| match v {
                Value::String(s) => Some(s.as_str()),
                _ => None,
            }));
        }

        let mut found: Option<DataType> = None;
        for t in samples.iter().filter_map(|v| v.datatype()) {
            found = Some(match (found, t) {
                (None, t) => t,
                (Some(a), b) if a == b => a,
                (Some(Self::Date | Self::DateTime), Self::Date | Self::DateTime) => Self::DateTime,
                _ => return Self::String,
            });
        }
        found.unwrap_or(Self::String)
    }
}

impl Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            DataType::String => "STRING",
            DataType::Number => "NUMBER",
            DataType::Boolean => "BOOLEAN",
            DataType::Date => "DATE",
            DataType::DateTime => "DATETIME",
        })
    }
}

pub fn parse_datetime(text: &str) -> Option<NaiveDateTime> {
    DATETIME_FORMATS
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(text, f).ok())
}

pub fn parse_date(text: &str) -> Option<NaiveDate> {
    DATE_FORMATS
        .iter()
        .find_map(|f| NaiveDate::parse_from_str(text, f).ok())
}

/// Runtime value of one cell
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(String),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
}

impl Value {
    /// Parses a SQL literal as written in VALUES or SET.
    ///
    /// Matching quotes are stripped and the content kept as a string, with doubled quotes
    /// collapsed. Bare text containing a `.` is tried as a float, other bare text as an
    /// integer, then as a boolean.
    pub fn parse_literal(text: &str) -> Self {
        let text = text.trim();
        if let Some(inner) = unquote_literal(text) {
            return Value::String(inner.into_owned());
        }
        if text.eq_ignore_ascii_case("null") {
            return Value::Null;
        }
        if text.contains('.') {
            if let Ok(f) = text.parse::<f64>() {
                return Value::Float(f);
            }
        } else if let Ok(i) = text.parse::<i64>() {
            return Value::Integer(i);
        }
        if text.eq_ignore_ascii_case("true") {
            return Value::Boolean(true);
        }
        if text.eq_ignore_ascii_case("false") {
            return Value::Boolean(false);
        }
        Value::String(text.to_string())
    }

    /// Converts free cell text into a typed value by inference
    pub fn from_text(text: &str) -> Self {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Value::Null;
        }
        match trimmed.to_lowercase().as_ref() {
            "true" | "yes" | "y" => return Value::Boolean(true),
            "false" | "no" | "n" => return Value::Boolean(false),
            _ => {}
        }
        if let Ok(i) = trimmed.parse::<i64>() {
            return Value::Integer(i);
        }
        if let Ok(f) = trimmed.parse::<f64>() {
            return Value::Float(f);
        }
        if let Some(dt) = parse_datetime(trimmed) {
            return Value::DateTime(dt);
        }
        if let Some(d) = parse_date(trimmed) {
            return Value::Date(d);
        }
        Value::String(text.to_string())
    }

    /// Converts a value into the shape a column of `datatype` stores
    pub fn coerce(self, datatype: DataType) -> Self {
        match (datatype, self) {
            (_, Value::Null) => Value::Null,
            (DataType::Number, Value::String(s)) => match Value::from_text(&s) {
                v @ (Value::Integer(_) | Value::Float(_)) => v,
                _ => Value::String(s),
            },
            (DataType::Boolean, Value::String(s)) => match s.trim().to_lowercase().as_ref() {
                "true" | "yes" | "y" | "1" => Value::Boolean(true),
                "false" | "no" | "n" | "0" => Value::Boolean(false),
                _ => Value::String(s),
            },
            (DataType::Date, Value::String(s)) => match parse_date(s.trim()) {
                Some(d) => Value::Date(d),
                None => Value::String(s),
            },
            (DataType::DateTime, Value::String(s)) => match parse_datetime(s.trim()) {
                Some(dt) => Value::DateTime(dt),
                None => Value::String(s),
            },
            (_, v) => v,
        }
    }

    pub fn datatype(&self) -> Option<DataType> {
        match self {
            Self::Null => None,
            Self::Boolean(_) => Some(DataType::Boolean),
            Self::Integer(_) | Self::Float(_) => Some(DataType::Number),
            Self::String(_) => Some(DataType::String),
            Self::Date(_) => Some(DataType::Date),
            Self::DateTime(_) => Some(DataType::DateTime),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Value::Integer(_) | Value::Float(_))
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Builds a number, narrowing whole floats to integers
    pub fn number(f: f64) -> Self {
        if f.fract() == 0.0 && f.is_finite() && f.abs() < i64::MAX as f64 {
            Value::Integer(f as i64)
        } else {
            Value::Float(f)
        }
    }

    /// Total order used by ORDER BY, MIN/MAX and the index: incomparable pairs fall back
    /// to comparing their text.
    pub fn total_cmp(&self, other: &Self) -> Ordering {
        self.partial_cmp(other)
            .unwrap_or_else(|| self.to_string().cmp(&other.to_string()))
    }
}

/// Returns the inside of `'..'` or `".."`
pub fn strip_quotes(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if (first == b'\'' || first == b'"') && first == last {
            return Some(&text[1..text.len() - 1]);
        }
    }
    None
}

/// Inside of a quoted literal with the doubled quote collapsed, so `'O''Brien'` reads as
/// `O'Brien`
pub fn unquote_literal(text: &str) -> Option<Cow<'_, str>> {
    let inner = strip_quotes(text)?;
    let quote = &text[..1];
    let doubled = quote.repeat(2);
    if inner.contains(&doubled) {
        Some(Cow::Owned(inner.replace(&doubled, quote)))
    } else {
        Some(Cow::Borrowed(inner))
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Integer(v) => write!(f, "{}", v),
            Value::Float(v) if v.fract() == 0.0 && v.is_finite() => write!(f, "{:.1}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::String(v) => write!(f, "{}", v),
            Value::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            Value::DateTime(dt) => write!(f, "{}", dt.format("%Y-%m-%dT%H:%M:%S")),
        }
    }
}

/// Partial ordering with Null lowest and numbers compared across Integer/Float
impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Value::Null, Value::Null) => Some(Ordering::Equal),
            (Value::Null, _) => Some(Ordering::Less),
            (_, Value::Null) => Some(Ordering::Greater),
            (Value::Boolean(a), Value::Boolean(b)) => a.partial_cmp(b),
            (Value::Integer(a), Value::Integer(b)) => a.partial_cmp(b),
            (Value::Integer(a), Value::Float(b)) => (*a as f64).partial_cmp(b),
            (Value::Float(a), Value::Integer(b)) => a.partial_cmp(&(*b as f64)),
            (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
            (Value::String(a), Value::String(b)) => a.partial_cmp(b),
            (Value::Date(a), Value::Date(b)) => a.partial_cmp(b),
            (Value::DateTime(a), Value::DateTime(b)) => a.partial_cmp(b),
            (Value::Date(a), Value::DateTime(b)) => a.and_time(chrono::NaiveTime::MIN).partial_cmp(b),
            (Value::DateTime(a), Value::Date(b)) => a.partial_cmp(&b.and_time(chrono::NaiveTime::MIN)),
            (_, _) => None,
        }
    }
}

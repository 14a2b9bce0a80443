use std::collections::{HashMap, HashSet};

use chrono::{NaiveDate, NaiveDateTime};

use crate::sql::{parser::ast::AggFunc, types::Value};

/// One aggregate to compute: the function and the input column position (None for `COUNT(*)`)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AggSpec {
    pub func: AggFunc,
    pub column: Option<usize>,
}

/// Groups `rows` by the `group_by` positions and appends one value per aggregate.
///
/// Each output row is the first input row of its group followed by the aggregate values, so
/// non-aggregated columns take the first row's value. Groups come out in order of first
/// appearance. Without GROUP BY the whole input is one group, even when it is empty.
pub fn aggregate(rows: &[Vec<Value>], width: usize, group_by: &[usize], specs: &[AggSpec]) -> Vec<Vec<Value>> {
    let mut groups: Vec<Vec<&[Value]>> = Vec::new();
    if group_by.is_empty() {
        groups.push(rows.iter().map(|r| r.as_slice()).collect());
    } else {
        let mut slots: HashMap<Vec<GroupKey>, usize> = HashMap::new();
        for row in rows {
            let key = group_key(row, group_by);
            let slot = *slots.entry(key).or_insert_with(|| {
                groups.push(Vec::new());
                groups.len() - 1
            });
            groups[slot].push(row);
        }
    }

    groups
        .into_iter()
        .map(|members| {
            let mut out = match members.first() {
                Some(first) => first.to_vec(),
                None => vec![Value::Null; width],
            };
            out.resize(width, Value::Null);
            for spec in specs {
                out.push(<dyn Calculator>::build(spec.func).calc(spec.column, &members));
            }
            out
        })
        .collect()
}

/// Hashable form of one cell. Whole floats, -0.0 included, share the integer key, so 2
/// and 2.0 group together.
#[derive(Debug, PartialEq, Eq, Hash)]
enum GroupKey {
    Null,
    Bool(bool),
    Int(i64),
    /// bit pattern
    Float(u64),
    Text(String),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
}

impl From<&Value> for GroupKey {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => GroupKey::Null,
            Value::Boolean(b) => GroupKey::Bool(*b),
            Value::Integer(i) => GroupKey::Int(*i),
            Value::Float(f) => match Value::number(*f) {
                Value::Integer(i) => GroupKey::Int(i),
                _ => GroupKey::Float(f.to_bits()),
            },
            Value::String(s) => GroupKey::Text(s.clone()),
            Value::Date(d) => GroupKey::Date(*d),
            Value::DateTime(dt) => GroupKey::DateTime(*dt),
        }
    }
}

fn group_key(row: &[Value], group_by: &[usize]) -> Vec<GroupKey> {
    group_by
        .iter()
        .map(|&i| row.get(i).map_or(GroupKey::Null, GroupKey::from))
        .collect()
}

/// Removes repeated rows, keeping the first occurrence
pub fn distinct(rows: Vec<Vec<Value>>) -> Vec<Vec<Value>> {
    let mut seen = HashSet::new();
    rows.into_iter()
        .filter(|row| seen.insert(row.iter().map(GroupKey::from).collect::<Vec<_>>()))
        .collect()
}

/// Trait for aggregate function calculations
pub trait Calculator {
    fn calc(&self, column: Option<usize>, rows: &[&[Value]]) -> Value;
}

impl dyn Calculator {
    pub fn build(func: AggFunc) -> Box<dyn Calculator> {
        match func {
            AggFunc::Count => Box::new(Count),
            AggFunc::Sum => Box::new(Sum),
            AggFunc::Avg => Box::new(Avg),
            AggFunc::Max => Box::new(Max),
            AggFunc::Min => Box::new(Min),
        }
    }
}

fn column_values<'a>(column: Option<usize>, rows: &'a [&'a [Value]]) -> impl Iterator<Item = &'a Value> {
    rows.iter()
        .filter_map(move |row| column.and_then(|c| row.get(c)))
        .filter(|v| !v.is_null())
}

/// COUNT(*) counts rows, COUNT(col) non-null values
pub struct Count;

impl Calculator for Count {
    fn calc(&self, column: Option<usize>, rows: &[&[Value]]) -> Value {
        let count = match column {
            None => rows.len(),
            Some(_) => column_values(column, rows).count(),
        };
        Value::Integer(count as i64)
    }
}

/// SUM over numeric values; non-numeric values are skipped
pub struct Sum;

impl Calculator for Sum {
    fn calc(&self, column: Option<usize>, rows: &[&[Value]]) -> Value {
        let mut int_sum: Option<i64> = Some(0);
        let mut float_sum = 0.0;
        let mut seen = false;
        for value in column_values(column, rows) {
            match value {
                Value::Integer(i) => {
                    int_sum = int_sum.and_then(|s| s.checked_add(*i));
                    float_sum += *i as f64;
                }
                Value::Float(f) => {
                    int_sum = None;
                    float_sum += f;
                }
                _ => continue,
            }
            seen = true;
        }
        match (seen, int_sum) {
            (false, _) => Value::Null,
            (true, Some(s)) => Value::Integer(s),
            (true, None) => Value::Float(float_sum),
        }
    }
}

/// AVG = SUM / COUNT over numeric values
pub struct Avg;

impl Calculator for Avg {
    fn calc(&self, column: Option<usize>, rows: &[&[Value]]) -> Value {
        let numbers: Vec<f64> = column_values(column, rows).filter_map(Value::as_f64).collect();
        if numbers.is_empty() {
            return Value::Null;
        }
        Value::Float(numbers.iter().sum::<f64>() / numbers.len() as f64)
    }
}

/// MAX by natural order, comparing as text across types
pub struct Max;

impl Calculator for Max {
    fn calc(&self, column: Option<usize>, rows: &[&[Value]]) -> Value {
        column_values(column, rows)
            .max_by(|a, b| a.total_cmp(b))
            .cloned()
            .unwrap_or(Value::Null)
    }
}

/// MIN by natural order, comparing as text across types
pub struct Min;

impl Calculator for Min {
    fn calc(&self, column: Option<usize>, rows: &[&[Value]]) -> Value {
        column_values(column, rows)
            .min_by(|a, b| a.total_cmp(b))
            .cloned()
            .unwrap_or(Value::Null)
    }
}

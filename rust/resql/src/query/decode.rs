//! Typed decoding of untyped result rows.

use crate::{
    db::{Column, RowSet},
    error::{Result, ServiceError},
    models::{MetricBucket, MetricsBuckets},
    time::parse_datetime,
};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde_json::{Map, Number, Value};

pub const GROUP_SUFFIX: &str = "_group";
pub const SERIES_SUFFIX: &str = "_series";

/// Concrete kind of a ClickHouse column once wrappers are stripped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanType {
    Temporal,
    Float,
    Int,
    UInt,
    Bool,
    Text,
    Composite,
}

impl ScanType {
    pub fn from_clickhouse(type_name: &str) -> Self {
        let inner = strip_wrappers(type_name);
        if inner.starts_with("DateTime") || inner == "Date" || inner == "Date32" {
            ScanType::Temporal
        } else if inner.starts_with("Float") || inner.starts_with("Decimal") {
            ScanType::Float
        } else if inner.starts_with("UInt") {
            ScanType::UInt
        } else if inner.starts_with("Int") {
            ScanType::Int
        } else if inner == "Bool" {
            ScanType::Bool
        } else if inner.starts_with("Map(")
            || inner.starts_with("Array(")
            || inner.starts_with("Tuple(")
        {
            ScanType::Composite
        } else {
            ScanType::Text
        }
    }
}

/// Strips any chain of `Nullable(..)` / `LowCardinality(..)` wrappers.
pub fn strip_wrappers(mut type_name: &str) -> &str {
    loop {
        let trimmed = type_name.trim();
        let inner = ["Nullable(", "LowCardinality("]
            .iter()
            .find_map(|prefix| trimmed.strip_prefix(prefix))
            .and_then(|rest| rest.strip_suffix(')'));
        match inner {
            Some(inner) => type_name = inner,
            None => return trimmed,
        }
    }
}

/// One decoded cell.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanValue {
    Null,
    Time(DateTime<Utc>),
    Float(f64),
    Int(i64),
    UInt(u64),
    Bool(bool),
    Text(String),
    Other(Value),
}

impl ScanValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ScanValue::Float(value) => Some(*value),
            ScanValue::Int(value) => Some(*value as f64),
            ScanValue::UInt(value) => Some(*value as f64),
            ScanValue::Bool(flag) => Some(if *flag { 1.0 } else { 0.0 }),
            ScanValue::Time(ts) => Some(ts.timestamp() as f64),
            ScanValue::Text(text) => text.parse().ok(),
            ScanValue::Null | ScanValue::Other(_) => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            ScanValue::UInt(value) => Some(*value),
            ScanValue::Int(value) => u64::try_from(*value).ok(),
            ScanValue::Float(value) if *value >= 0.0 => Some(*value as u64),
            ScanValue::Time(ts) => u64::try_from(ts.timestamp()).ok(),
            ScanValue::Text(text) => text.parse().ok(),
            _ => None,
        }
    }

    /// Grouping representation: RFC3339 times, shortest round-trip floats, decimal
    /// integers and `true`/`false`.
    pub fn to_group_string(&self) -> String {
        match self {
            ScanValue::Null => String::new(),
            ScanValue::Time(ts) => ts.to_rfc3339_opts(SecondsFormat::Secs, true),
            ScanValue::Float(value) => value.to_string(),
            ScanValue::Int(value) => value.to_string(),
            ScanValue::UInt(value) => value.to_string(),
            ScanValue::Bool(flag) => flag.to_string(),
            ScanValue::Text(text) => text.clone(),
            ScanValue::Other(value) => value.to_string(),
        }
    }
}

/// Decodes `value` according to the declared ClickHouse column type.
pub fn scan(type_name: &str, value: &Value) -> Result<ScanValue> {
    if value.is_null() {
        return Ok(ScanValue::Null);
    }
    let mismatch = || {
        ServiceError::Internal(anyhow::anyhow!(
            "cannot decode {value} as {type_name}"
        ))
    };

    Ok(match ScanType::from_clickhouse(type_name) {
        ScanType::Temporal => ScanValue::Time(scan_time(value).ok_or_else(mismatch)?),
        ScanType::Float => ScanValue::Float(match value {
            Value::Number(number) => number.as_f64().ok_or_else(mismatch)?,
            Value::String(text) => parse_float(text).ok_or_else(mismatch)?,
            _ => return Err(mismatch()),
        }),
        ScanType::Int => ScanValue::Int(match value {
            Value::Number(number) => number.as_i64().ok_or_else(mismatch)?,
            Value::String(text) => text.parse().map_err(|_| mismatch())?,
            _ => return Err(mismatch()),
        }),
        ScanType::UInt => ScanValue::UInt(match value {
            Value::Number(number) => number.as_u64().ok_or_else(mismatch)?,
            Value::String(text) => text.parse().map_err(|_| mismatch())?,
            _ => return Err(mismatch()),
        }),
        ScanType::Bool => ScanValue::Bool(match value {
            Value::Bool(flag) => *flag,
            Value::Number(number) => number.as_u64().is_some_and(|n| n != 0),
            _ => return Err(mismatch()),
        }),
        ScanType::Text => match value {
            Value::String(text) => ScanValue::Text(text.clone()),
            other => ScanValue::Text(other.to_string()),
        },
        ScanType::Composite => ScanValue::Other(value.clone()),
    })
}

fn scan_time(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(text) => parse_datetime(text).ok().or_else(|| {
            chrono::NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .ok()
                .and_then(|date| date.and_hms_opt(0, 0, 0))
                .map(|dt| DateTime::<Utc>::from_naive_utc_and_offset(dt, Utc))
        }),
        Value::Number(number) => number
            .as_i64()
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0)),
        _ => None,
    }
}

fn parse_float(text: &str) -> Option<f64> {
    match text {
        "nan" => Some(f64::NAN),
        "inf" | "+inf" => Some(f64::INFINITY),
        "-inf" => Some(f64::NEG_INFINITY),
        other => other.parse().ok(),
    }
}

/// Decodes arbitrary result rows (raw user SQL) into metric buckets.
///
/// A temporal column without a suffix is the bucket itself; `_group` columns and
/// unsuffixed strings/booleans form the group; every other column yields one bucket
/// value labelled with its suffix-stripped name.
pub fn decode_metric_rows(rows: &RowSet) -> Result<MetricsBuckets> {
    let mut metrics = MetricsBuckets::default();

    for row in &rows.rows {
        let mut bucket_id = 0;
        let mut bucket_value = None;
        let mut groups = Vec::new();
        let mut values: Vec<(&Column, Option<f64>)> = Vec::new();

        for (column, cell) in rows.columns.iter().zip(row) {
            let is_series = column.name.ends_with(SERIES_SUFFIX);
            let is_group = column.name.ends_with(GROUP_SUFFIX);

            match scan(&column.type_name, cell)? {
                ScanValue::Time(ts) => {
                    if is_series {
                        values.push((column, Some(ts.timestamp() as f64)));
                    } else if is_group {
                        groups.push(ScanValue::Time(ts).to_group_string());
                    } else {
                        bucket_id = u64::try_from(ts.timestamp()).unwrap_or_default();
                        bucket_value = Some(ts.timestamp() as f64);
                    }
                }
                ScanValue::Text(text) => {
                    if is_series {
                        // unparsable series values are dropped, not fatal
                        values.push((column, text.parse().ok()));
                    } else {
                        groups.push(text);
                    }
                }
                ScanValue::Bool(flag) => {
                    if is_series {
                        values.push((column, Some(if flag { 1.0 } else { 0.0 })));
                    } else {
                        groups.push(flag.to_string());
                    }
                }
                value @ (ScanValue::Float(_) | ScanValue::Int(_) | ScanValue::UInt(_)) => {
                    if is_group {
                        groups.push(value.to_group_string());
                    } else {
                        values.push((column, value.as_f64()));
                    }
                }
                ScanValue::Null => {
                    if is_group {
                        groups.push(String::new());
                    } else {
                        values.push((column, None));
                    }
                }
                ScanValue::Other(value) => groups.push(value.to_string()),
            }
        }

        for (column, metric_value) in values {
            let label = column
                .name
                .trim_end_matches(SERIES_SUFFIX)
                .trim_end_matches(GROUP_SUFFIX);
            metrics.buckets.push(MetricBucket {
                bucket_id,
                bucket_value,
                bucket_min: None,
                bucket_max: None,
                group: groups.clone(),
                metric_type: label.to_string(),
                column: String::new(),
                metric_value,
            });
        }
    }

    Ok(metrics)
}

/// Normalises one row into a JSON object keyed by column name, with RFC3339 timestamps
/// and numeric integers.
pub fn row_to_object(columns: &[Column], row: &[Value]) -> Result<Map<String, Value>> {
    columns
        .iter()
        .zip(row)
        .map(|(column, cell)| {
            let value = match scan(&column.type_name, cell)? {
                ScanValue::Null => Value::Null,
                ScanValue::Time(ts) => {
                    Value::String(ts.to_rfc3339_opts(SecondsFormat::AutoSi, true))
                }
                ScanValue::Float(value) => {
                    Number::from_f64(value).map_or(Value::Null, Value::Number)
                }
                ScanValue::Int(value) => Value::from(value),
                ScanValue::UInt(value) => Value::from(value),
                ScanValue::Bool(flag) => Value::Bool(flag),
                ScanValue::Text(text) => Value::String(text),
                ScanValue::Other(value) => value,
            };
            Ok((column.name.clone(), value))
        })
        .collect()
}

/// Decodes every row into `T` through its JSON object form.
pub fn decode_rows<T: DeserializeOwned>(rows: &RowSet) -> Result<Vec<T>> {
    rows.rows
        .iter()
        .map(|row| {
            let object = row_to_object(&rows.columns, row)?;
            serde_json::from_value(Value::Object(object)).map_err(|err| {
                ServiceError::Internal(anyhow::Error::new(err).context("failed to decode row"))
            })
        })
        .collect()
}

/// Positional accessor over one row of a [`RowSet`].
pub struct RowReader<'a> {
    columns: &'a [Column],
    row: &'a [Value],
}

impl<'a> RowReader<'a> {
    pub fn new(columns: &'a [Column], row: &'a [Value]) -> Self {
        Self { columns, row }
    }

    pub fn get(&self, idx: usize) -> Result<ScanValue> {
        match (self.columns.get(idx), self.row.get(idx)) {
            (Some(column), Some(cell)) => scan(&column.type_name, cell),
            _ => Err(ServiceError::Internal(anyhow::anyhow!(
                "row has no column {idx}"
            ))),
        }
    }

    pub fn f64(&self, idx: usize) -> Result<Option<f64>> {
        Ok(self.get(idx)?.as_f64())
    }

    pub fn u64(&self, idx: usize) -> Result<u64> {
        Ok(self.get(idx)?.as_u64().unwrap_or_default())
    }

    pub fn string(&self, idx: usize) -> Result<String> {
        Ok(self.get(idx)?.to_group_string())
    }
}

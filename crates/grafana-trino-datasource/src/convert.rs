//! Conversion of Trino result columns into Grafana fields.
//!
//! Each column's Trino type name is matched against a table of [`Converter`]s;
//! the first match decides the field type. SQL NULLs always become nulls of that
//! type rather than zero values.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
};

use chrono::prelude::*;
use chrono_tz::Tz;
use grafana_plugin_sdk::{
    data::{Field, Frame},
    prelude::*,
};
use regex::Regex;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::client::QueryResult;

static NULL: Value = Value::Null;

/// The type of field a column is converted into.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldKind {
    /// Nullable strings.
    String,
    /// Nullable 64-bit floats.
    Float64,
    /// Nullable 64-bit integers.
    Int64,
    /// Nullable 32-bit integers.
    Int32,
    /// Nullable UTC timestamps.
    Time,
    /// Nullable booleans.
    Bool,
    /// Nullable strings: string values as they are, anything else as JSON text.
    ///
    /// Used for columns no converter matches, such as arrays, maps, rows and
    /// `uuid`.
    Json,
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::String => "string",
            Self::Float64 => "float64",
            Self::Int64 => "int64",
            Self::Int32 => "int32",
            Self::Time => "time",
            Self::Bool => "bool",
            Self::Json => "json",
        })
    }
}

/// A value could not be converted to its column's field type.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConvertError {
    /// A value did not have the shape its column type promised.
    #[error("cannot convert {value} in column {column:?} to {kind}")]
    Value {
        /// The column name.
        column: String,
        /// The target field type.
        kind: FieldKind,
        /// The offending value.
        value: Value,
    },
    /// The resulting frame was invalid.
    #[error("invalid frame: {0}")]
    Frame(#[from] grafana_plugin_sdk::data::Error),
}

/// Selects a [`FieldKind`] for Trino types whose name matches a pattern.
#[derive(Clone, Debug)]
pub struct Converter {
    name: &'static str,
    pattern: Regex,
    kind: FieldKind,
}

impl Converter {
    /// Create a converter for type names matching `pattern`.
    ///
    /// The pattern is matched against the start of the lowercased type name, so
    /// `bigint` matches `bigint` but not `array(bigint)`.
    pub fn new(name: &'static str, pattern: &str, kind: FieldKind) -> Result<Self, regex::Error> {
        Ok(Self {
            name,
            pattern: Regex::new(&format!("^(?:{pattern})"))?,
            kind,
        })
    }

    /// The converter's name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The field type this converter produces.
    pub fn kind(&self) -> FieldKind {
        self.kind
    }

    /// Whether this converter handles `type_name`, which must be lowercase.
    pub fn matches(&self, type_name: &str) -> bool {
        self.pattern.is_match(type_name)
    }
}

/// An ordered table of converters.
#[derive(Clone, Debug)]
pub struct Converters(Vec<Converter>);

impl Default for Converters {
    fn default() -> Self {
        let table = [
            (
                "nullable string converter",
                "char|varchar|varbinary|json|interval year to month|interval day to second|decimal|ipaddress|unknown",
                FieldKind::String,
            ),
            ("nullable decimal converter", "real|double", FieldKind::Float64),
            (
                "nullable int64 converter",
                "tinyint|smallint|integer|bigint",
                FieldKind::Int64,
            ),
            (
                "nullable time converter",
                "date|time|time with time zone|timestamp|timestamp with time zone",
                FieldKind::Time,
            ),
            ("nullable bool converter", "boolean", FieldKind::Bool),
        ];
        Self(
            table
                .into_iter()
                .map(|(name, pattern, kind)| {
                    Converter::new(name, pattern, kind).expect("built-in patterns are valid")
                })
                .collect(),
        )
    }
}

impl Converters {
    /// Create a custom converter table. Earlier converters take precedence.
    pub fn new(converters: Vec<Converter>) -> Self {
        Self(converters)
    }

    /// The field type for a Trino type name.
    pub fn kind_for(&self, type_name: &str) -> FieldKind {
        let type_name = type_name.trim().to_lowercase();
        self.0
            .iter()
            .find(|c| c.matches(&type_name))
            .map_or(FieldKind::Json, Converter::kind)
    }

    /// Convert a statement result into a frame named `name`.
    pub fn to_frame(&self, name: &str, result: &QueryResult) -> Result<Frame, ConvertError> {
        let fields = result
            .columns
            .iter()
            .enumerate()
            .map(|(i, column)| {
                let kind = self.kind_for(&column.type_name);
                let values = result
                    .rows
                    .iter()
                    .map(|row| row.get(i).unwrap_or(&NULL));
                to_field(&column.name, kind, values)
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Frame::new(name).with_fields(fields))
    }

    /// Convert a time series result in long format into a wide frame named `name`.
    ///
    /// The first time column becomes the frame's time index, string columns are
    /// labels and every other column is a value. Each value column gets one
    /// field per distinct combination of labels, and a time at which a series
    /// has no row holds a null. Rows are ordered by time; rows with a null time
    /// are dropped.
    ///
    /// Results without a time column or without label columns are already wide
    /// and are converted as they are.
    pub fn to_wide_frame(&self, name: &str, result: &QueryResult) -> Result<Frame, ConvertError> {
        let kinds: Vec<_> = result
            .columns
            .iter()
            .map(|c| self.kind_for(&c.type_name))
            .collect();
        let Some(time_index) = kinds.iter().position(|k| *k == FieldKind::Time) else {
            return self.to_frame(name, result);
        };
        let (factors, values): (Vec<usize>, Vec<usize>) = (0..kinds.len())
            .filter(|i| *i != time_index)
            .partition(|i| matches!(kinds[*i], FieldKind::String | FieldKind::Json));
        if factors.is_empty() {
            return self.to_frame(name, result);
        }

        let time_column = &result.columns[time_index].name;
        let mut rows = Vec::with_capacity(result.rows.len());
        for row in &result.rows {
            let value = row.get(time_index).unwrap_or(&NULL);
            let time = nullable(value, |v| v.as_str().and_then(parse_time)).ok_or_else(|| {
                ConvertError::Value {
                    column: time_column.clone(),
                    kind: FieldKind::Time,
                    value: value.clone(),
                }
            })?;
            if let Some(time) = time {
                rows.push((time, row));
            }
        }
        rows.sort_by_key(|(time, _)| *time);

        let mut times: Vec<DateTime<Utc>> = Vec::new();
        let mut series: Vec<Series<'_>> = Vec::new();
        let mut by_labels: HashMap<Vec<String>, usize> = HashMap::new();
        for (time, row) in rows {
            if times.last() != Some(&time) {
                times.push(time);
                for s in &mut series {
                    s.push_null();
                }
            }
            let key: Vec<String> = factors
                .iter()
                .map(|i| label_value(row.get(*i).unwrap_or(&NULL)))
                .collect();
            let index = *by_labels.entry(key).or_insert_with_key(|key| {
                let labels = factors
                    .iter()
                    .zip(key)
                    .map(|(i, value)| (result.columns[*i].name.clone(), value.clone()))
                    .collect();
                series.push(Series::new(labels, values.len(), times.len()));
                series.len() - 1
            });
            let cells = &mut series[index].cells;
            for (cell, column) in cells.iter_mut().zip(&values) {
                if let Some(last) = cell.last_mut() {
                    *last = row.get(*column).unwrap_or(&NULL);
                }
            }
        }

        let mut fields = vec![times
            .into_iter()
            .map(Some)
            .collect::<Vec<_>>()
            .into_opt_field(time_column)];
        for s in series {
            for (cells, column) in s.cells.into_iter().zip(&values) {
                let column_name = &result.columns[*column].name;
                fields.push(
                    to_field(column_name, kinds[*column], cells.into_iter())?
                        .with_labels(s.labels.clone()),
                );
            }
        }
        Ok(Frame::new(name).with_fields(fields))
    }
}

/// The values of one label combination in a wide frame, one column of cells per
/// value column and one cell per distinct time.
struct Series<'a> {
    labels: BTreeMap<String, String>,
    cells: Vec<Vec<&'a Value>>,
}

impl<'a> Series<'a> {
    fn new(labels: BTreeMap<String, String>, columns: usize, len: usize) -> Self {
        Self {
            labels,
            cells: vec![vec![&NULL; len]; columns],
        }
    }

    fn push_null(&mut self) {
        for cells in &mut self.cells {
            cells.push(&NULL);
        }
    }
}

fn label_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn to_field<'a>(
    column: &str,
    kind: FieldKind,
    values: impl Iterator<Item = &'a Value>,
) -> Result<Field, ConvertError> {
    let invalid = |value: &Value| ConvertError::Value {
        column: column.to_string(),
        kind,
        value: value.clone(),
    };
    Ok(match kind {
        // Unmatched scalar types such as `uuid` arrive as plain strings, so only
        // structured values are rendered as JSON text.
        FieldKind::String | FieldKind::Json => values
            .map(|v| match v {
                Value::Null => None,
                Value::String(s) => Some(s.clone()),
                other => Some(other.to_string()),
            })
            .collect::<Vec<_>>()
            .into_opt_field(column),
        FieldKind::Float64 => values
            .map(|v| nullable(v, to_f64).ok_or_else(|| invalid(v)))
            .collect::<Result<Vec<_>, _>>()?
            .into_opt_field(column),
        FieldKind::Int64 => values
            .map(|v| nullable(v, to_i64).ok_or_else(|| invalid(v)))
            .collect::<Result<Vec<_>, _>>()?
            .into_opt_field(column),
        FieldKind::Int32 => values
            .map(|v| {
                nullable(v, |v| to_i64(v).and_then(|i| i32::try_from(i).ok()))
                    .ok_or_else(|| invalid(v))
            })
            .collect::<Result<Vec<_>, _>>()?
            .into_opt_field(column),
        FieldKind::Bool => values
            .map(|v| nullable(v, Value::as_bool).ok_or_else(|| invalid(v)))
            .collect::<Result<Vec<_>, _>>()?
            .into_opt_field(column),
        FieldKind::Time => values
            .map(|v| {
                nullable(v, |v| v.as_str().and_then(parse_time)).ok_or_else(|| invalid(v))
            })
            .collect::<Result<Vec<_>, _>>()?
            .into_opt_field(column),
    })
}

/// Apply `convert` to non-null values.
///
/// Returns `Some(None)` for SQL NULL and `None` if `convert` fails.
fn nullable<T>(value: &Value, convert: impl FnOnce(&Value) -> Option<T>) -> Option<Option<T>> {
    if value.is_null() {
        Some(None)
    } else {
        convert(value).map(Some)
    }
}

fn to_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        // Trino sends non-finite doubles as strings.
        Value::String(s) => match s.as_str() {
            "NaN" => Some(f64::NAN),
            "Infinity" => Some(f64::INFINITY),
            "-Infinity" => Some(f64::NEG_INFINITY),
            other => other.parse().ok(),
        },
        _ => None,
    }
}

fn to_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

const DATE_TIME: &str = "%Y-%m-%d %H:%M:%S%.f";

/// Parse a Trino `date`, `time` or `timestamp` value, with or without a zone.
///
/// Times without a date are placed on 1970-01-01 and values without a zone are
/// taken to be UTC. Zone names are resolved with the IANA database; an unknown
/// zone, or a local time the zone skips, fails to parse.
fn parse_time(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some(date.and_time(NaiveTime::default()).and_utc());
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(s, DATE_TIME) {
        return Some(dt.and_utc());
    }
    // Trino always puts a zone after the seconds. Try it as an offset first, then
    // as a zone name.
    let has_date = matches!((s.find('-'), s.find(':')), (Some(dash), Some(colon)) if dash < colon);
    let with_date = if has_date {
        s.to_string()
    } else {
        format!("1970-01-01 {s}")
    };
    for format in ["%Y-%m-%d %H:%M:%S%.f %:z", "%Y-%m-%d %H:%M:%S%.f%:z"] {
        if let Ok(dt) = DateTime::parse_from_str(&with_date, format) {
            return Some(dt.with_timezone(&Utc));
        }
    }
    if let Some((local, zone)) = with_date.rsplit_once(' ') {
        if let Ok(dt) = NaiveDateTime::parse_from_str(local, DATE_TIME) {
            if zone.eq_ignore_ascii_case("UTC") || zone.eq_ignore_ascii_case("Z") {
                return Some(dt.and_utc());
            }
            let Ok(tz) = zone.parse::<Tz>() else {
                warn!(zone, "Unknown time zone name");
                return None;
            };
            // Ambiguous local times (the repeated hour at the end of DST) take
            // the earlier instant.
            return tz
                .from_local_datetime(&dt)
                .earliest()
                .map(|dt| dt.with_timezone(&Utc));
        }
    }
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod test {
    use grafana_plugin_sdk::arrow::array::{
        Array, BooleanArray, Float64Array, Int32Array, Int64Array, StringArray,
        TimestampNanosecondArray,
    };
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::client::Column;

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn default_table() {
        let converters = Converters::default();
        for (type_name, kind) in [
            ("varchar", FieldKind::String),
            ("varchar(10)", FieldKind::String),
            ("char(3)", FieldKind::String),
            ("decimal(10,2)", FieldKind::String),
            ("interval day to second", FieldKind::String),
            ("ipaddress", FieldKind::String),
            ("double", FieldKind::Float64),
            ("REAL", FieldKind::Float64),
            ("tinyint", FieldKind::Int64),
            ("bigint", FieldKind::Int64),
            ("date", FieldKind::Time),
            ("time(3)", FieldKind::Time),
            ("timestamp(3) with time zone", FieldKind::Time),
            ("boolean", FieldKind::Bool),
            ("array(bigint)", FieldKind::Json),
            ("map(varchar, bigint)", FieldKind::Json),
            ("uuid", FieldKind::Json),
        ] {
            assert_eq!(converters.kind_for(type_name), kind, "{type_name}");
        }
    }

    #[test]
    fn custom_table_with_int32() {
        let converters = Converters::new(vec![Converter::new(
            "nullable int32 converter",
            "integer",
            FieldKind::Int32,
        )
        .unwrap()]);
        assert_eq!(converters.kind_for("integer"), FieldKind::Int32);
        assert_eq!(converters.kind_for("bigint"), FieldKind::Json);

        let result = QueryResult {
            columns: vec![Column::new("n", "integer")],
            rows: vec![vec![json!(7)], vec![json!(null)]],
        };
        let frame = converters.to_frame("A", &result).unwrap();
        let values = frame.fields()[0]
            .values()
            .as_any()
            .downcast_ref::<Int32Array>()
            .unwrap();
        assert_eq!(values.value(0), 7);
        assert!(values.is_null(1));

        let result = QueryResult {
            columns: vec![Column::new("n", "integer")],
            rows: vec![vec![json!(i64::MAX)]],
        };
        assert!(converters.to_frame("A", &result).is_err());
    }

    #[test]
    fn null_bigint_is_typed_null() {
        let result = QueryResult {
            columns: vec![Column::new("n", "bigint")],
            rows: vec![vec![json!(null)], vec![json!(42)]],
        };
        let frame = Converters::default().to_frame("A", &result).unwrap();
        let values = frame.fields()[0]
            .values()
            .as_any()
            .downcast_ref::<Int64Array>()
            .unwrap();
        assert!(values.is_null(0));
        assert_eq!(values.value(1), 42);
    }

    #[test]
    fn double_keeps_bit_pattern() {
        let x = 0.1_f64 + 0.2_f64;
        let result = QueryResult {
            columns: vec![Column::new("x", "double")],
            rows: vec![
                vec![json!(x)],
                vec![json!("NaN")],
                vec![json!("-Infinity")],
                vec![json!(null)],
            ],
        };
        let frame = Converters::default().to_frame("A", &result).unwrap();
        let values = frame.fields()[0]
            .values()
            .as_any()
            .downcast_ref::<Float64Array>()
            .unwrap();
        assert_eq!(values.value(0).to_bits(), x.to_bits());
        assert!(values.value(1).is_nan());
        assert_eq!(values.value(2), f64::NEG_INFINITY);
        assert!(values.is_null(3));
    }

    #[test]
    fn mixed_columns() {
        let result = QueryResult {
            columns: vec![
                Column::new("name", "varchar"),
                Column::new("ok", "boolean"),
                Column::new("tags", "array(varchar)"),
                Column::new("ts", "timestamp(3)"),
                Column::new("id", "uuid"),
            ],
            rows: vec![
                vec![
                    json!("a"),
                    json!(true),
                    json!(["x", "y"]),
                    json!("2021-01-02 03:04:05.678"),
                    json!("12151fd2-7586-11e9-8f9e-2a86e4085a59"),
                ],
                vec![json!(null), json!(null), json!(null), json!(null), json!(null)],
            ],
        };
        let frame = Converters::default().to_frame("A", &result).unwrap();
        let fields = frame.fields();
        assert_eq!(fields.len(), 5);

        let names = fields[0].values().as_any().downcast_ref::<StringArray>().unwrap();
        assert_eq!(names.value(0), "a");
        assert!(names.is_null(1));

        let ok = fields[1].values().as_any().downcast_ref::<BooleanArray>().unwrap();
        assert!(ok.value(0));
        assert!(ok.is_null(1));

        let tags = fields[2].values().as_any().downcast_ref::<StringArray>().unwrap();
        assert_eq!(tags.value(0), r#"["x","y"]"#);
        assert!(tags.is_null(1));

        let ts = fields[3]
            .values()
            .as_any()
            .downcast_ref::<TimestampNanosecondArray>()
            .unwrap();
        assert_eq!(
            ts.value(0),
            utc("2021-01-02T03:04:05.678Z").timestamp_nanos_opt().unwrap()
        );
        assert!(ts.is_null(1));

        let ids = fields[4].values().as_any().downcast_ref::<StringArray>().unwrap();
        assert_eq!(ids.value(0), "12151fd2-7586-11e9-8f9e-2a86e4085a59");
        assert!(ids.is_null(1));
    }

    fn label<'a>(field: &'a Field, name: &str) -> Option<&'a str> {
        field.labels.get(name).map(String::as_str)
    }

    #[test]
    fn long_series_become_wide() {
        let result = QueryResult {
            columns: vec![
                Column::new("time", "timestamp(3)"),
                Column::new("host", "varchar"),
                Column::new("load", "double"),
            ],
            rows: vec![
                vec![json!("2024-01-01 00:01:00.000"), json!("web-1"), json!(3.0)],
                vec![json!("2024-01-01 00:00:00.000"), json!("web-1"), json!(1.0)],
                vec![json!("2024-01-01 00:00:00.000"), json!("web-2"), json!(2.0)],
                vec![json!(null), json!("web-3"), json!(9.0)],
            ],
        };
        let frame = Converters::default().to_wide_frame("A", &result).unwrap();
        let fields = frame.fields();
        assert_eq!(fields.len(), 3);

        let times = fields[0]
            .values()
            .as_any()
            .downcast_ref::<TimestampNanosecondArray>()
            .unwrap();
        assert_eq!(fields[0].name, "time");
        assert_eq!(times.len(), 2);
        assert_eq!(
            times.value(0),
            utc("2024-01-01T00:00:00Z").timestamp_nanos_opt().unwrap()
        );
        assert_eq!(
            times.value(1),
            utc("2024-01-01T00:01:00Z").timestamp_nanos_opt().unwrap()
        );

        assert_eq!(fields[1].name, "load");
        assert_eq!(label(&fields[1], "host"), Some("web-1"));
        let web1 = fields[1].values().as_any().downcast_ref::<Float64Array>().unwrap();
        assert_eq!(web1.value(0), 1.0);
        assert_eq!(web1.value(1), 3.0);

        assert_eq!(label(&fields[2], "host"), Some("web-2"));
        let web2 = fields[2].values().as_any().downcast_ref::<Float64Array>().unwrap();
        assert_eq!(web2.value(0), 2.0);
        assert!(web2.is_null(1));
    }

    #[test]
    fn wide_results_are_left_alone() {
        let result = QueryResult {
            columns: vec![
                Column::new("time", "timestamp(3)"),
                Column::new("a", "bigint"),
                Column::new("b", "bigint"),
            ],
            rows: vec![vec![json!("2024-01-01 00:00:00.000"), json!(1), json!(2)]],
        };
        let converters = Converters::default();
        let wide = converters.to_wide_frame("A", &result).unwrap();
        let plain = converters.to_frame("A", &result).unwrap();
        assert_eq!(wide.fields().len(), 3);
        assert_eq!(wide.fields(), plain.fields());
        assert!(wide.fields()[1].labels.is_empty());
    }

    #[test]
    fn rejects_mismatched_values() {
        let result = QueryResult {
            columns: vec![Column::new("n", "bigint")],
            rows: vec![vec![json!("not a number")]],
        };
        let err = Converters::default().to_frame("A", &result).unwrap_err();
        assert!(matches!(
            err,
            ConvertError::Value {
                kind: FieldKind::Int64,
                ..
            }
        ));
    }

    #[test]
    fn rejects_unknown_zones() {
        let result = QueryResult {
            columns: vec![Column::new("ts", "timestamp(3) with time zone")],
            rows: vec![vec![json!("2021-01-02 12:34:56.000 Mars/Olympus_Mons")]],
        };
        let err = Converters::default().to_frame("A", &result).unwrap_err();
        assert!(matches!(
            err,
            ConvertError::Value {
                kind: FieldKind::Time,
                ..
            }
        ));
    }

    #[test]
    fn parses_trino_times() {
        assert_eq!(parse_time("2021-01-02"), Some(utc("2021-01-02T00:00:00Z")));
        assert_eq!(
            parse_time("2021-01-02 12:34:56"),
            Some(utc("2021-01-02T12:34:56Z"))
        );
        assert_eq!(
            parse_time("2021-01-02 12:34:56.123456789"),
            Some(utc("2021-01-02T12:34:56.123456789Z"))
        );
        assert_eq!(
            parse_time("2021-01-02 12:34:56.789 UTC"),
            Some(utc("2021-01-02T12:34:56.789Z"))
        );
        assert_eq!(
            parse_time("2021-01-02 12:34:56.789 +01:00"),
            Some(utc("2021-01-02T11:34:56.789Z"))
        );
        assert_eq!(parse_time("12:34:56.789"), Some(utc("1970-01-01T12:34:56.789Z")));
        assert_eq!(
            parse_time("12:34:56.789+01:00"),
            Some(utc("1970-01-01T11:34:56.789Z"))
        );
        assert_eq!(
            parse_time("2021-01-02 12:34:56 Europe/Berlin"),
            Some(utc("2021-01-02T11:34:56Z"))
        );
        assert_eq!(
            parse_time("2021-07-02 12:34:56.500 America/New_York"),
            Some(utc("2021-07-02T16:34:56.500Z"))
        );
        assert_eq!(parse_time("2021-01-02 12:34:56 Mars/Olympus_Mons"), None);
        assert_eq!(parse_time("yesterday"), None);
    }
}

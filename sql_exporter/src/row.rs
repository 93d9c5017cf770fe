//! Map raw query rows into metric points.
//!
//! A query result is a list of [`Row`]s. The columns named as value columns in
//! the query configuration become gauge values, every other column becomes a
//! label. A value cell that cannot be read as a number yields no point; its
//! sibling cells and the remaining rows are unaffected.

use std::{fmt, sync::Arc};

/// A single cell as handed over by a [`crate::source::Source`].
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// SQL `NULL`
    Null,
    /// Boolean cell, numeric as 1.0 or 0.0
    Bool(bool),
    /// Any integer width
    Int(i64),
    /// Any floating point width
    Float(f64),
    /// Character data
    Text(String),
    /// Binary data, read as UTF-8 where possible
    Bytes(Vec<u8>),
}

impl Value {
    /// Interpret this cell as a gauge value.
    ///
    /// Numeric cells are used as-is. Text is parsed as a float after trimming
    /// surrounding whitespace. Returns `None` when no number can be read.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Null => None,
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Text(s) => s.trim().parse().ok(),
            Value::Bytes(b) => std::str::from_utf8(b).ok()?.trim().parse().ok(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Text(s) => f.write_str(s),
            Value::Bytes(b) => f.write_str(&String::from_utf8_lossy(b)),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

/// One result row, columns in the order the data source reported them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    columns: Vec<(String, Value)>,
}

impl Row {
    /// Create an empty row.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a column. A repeated column name replaces the earlier value but
    /// keeps its position.
    pub fn push(&mut self, column: impl Into<String>, value: impl Into<Value>) {
        let column = column.into();
        let value = value.into();
        if let Some(slot) = self.columns.iter_mut().find(|(c, _)| *c == column) {
            slot.1 = value;
        } else {
            self.columns.push((column, value));
        }
    }

    /// Look up a column by name.
    #[must_use]
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .find_map(|(c, v)| (c == column).then_some(v))
    }

    /// Iterate columns in source order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns.iter().map(|(c, v)| (c.as_str(), v))
    }

    /// Number of columns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Whether the row has no columns.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

impl<C, V> FromIterator<(C, V)> for Row
where
    C: Into<String>,
    V: Into<Value>,
{
    fn from_iter<I: IntoIterator<Item = (C, V)>>(iter: I) -> Self {
        let mut row = Row::new();
        for (c, v) in iter {
            row.push(c, v);
        }
        row
    }
}

/// The value of a single label. Holds one or more parts, joined with `_` when
/// rendered. Rows always produce single-part values.
pub type LabelValue = Vec<String>;

/// Ordered label key to label value mapping.
pub type Labels = Vec<(String, LabelValue)>;

/// Join label value parts for display.
#[must_use]
pub fn format_label_value(parts: &[String]) -> String {
    parts.join("_")
}

/// One emittable datum.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricPoint {
    /// Name parts, joined with `_` to form the exported series name
    pub name: Vec<String>,
    /// Labels, shared by every point produced from the same row
    pub labels: Arc<Labels>,
    /// Gauge value
    pub value: f64,
}

impl MetricPoint {
    /// The exported series name.
    #[must_use]
    pub fn metric_name(&self) -> String {
        self.name.join("_")
    }
}

/// Convert a query result into metric points.
///
/// Every column not listed in `value_columns` becomes a label of the row's
/// points. Every listed column produces one point named
/// `name_prefix + "_" + column` when its cell converts to a number.
#[must_use]
pub fn map_rows(rows: &[Row], value_columns: &[String], name_prefix: &str) -> Vec<MetricPoint> {
    let mut points = Vec::with_capacity(rows.len() * value_columns.len());

    for row in rows {
        let labels: Labels = row
            .iter()
            .filter(|(column, _)| !value_columns.iter().any(|vc| vc == column))
            .map(|(column, value)| (column.to_string(), vec![value.to_string()]))
            .collect();
        let labels = Arc::new(labels);

        for column in value_columns {
            let Some(value) = row.get(column).and_then(Value::as_f64) else {
                continue;
            };
            points.push(MetricPoint {
                name: vec![name_prefix.to_string(), column.clone()],
                labels: Arc::clone(&labels),
                value,
            });
        }
    }

    points
}

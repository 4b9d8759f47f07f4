use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// The value type for fields in a stored document.
///
/// Documents are schemaless: nested objects and lists are allowed and are
/// addressed with dotted paths (see [`Document::value_at`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DataValue {
    Null,
    Bool(bool),
    Int64(i64),
    Float64(f64),

    /// String content typically used for keywords, IDs, or non-tokenized metadata.
    String(String),

    /// Text content to be analyzed.
    Text(String),

    /// List of values (e.g. tags, or a list of nested objects).
    List(Vec<DataValue>),

    /// Nested object.
    Object(BTreeMap<String, DataValue>),

    /// Date and time in UTC.
    DateTime(DateTime<Utc>),
}

impl DataValue {
    /// Returns the text value if this is a Text or String variant.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            DataValue::Text(s) | DataValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the integer value if this is an Int64 variant.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            DataValue::Int64(i) => Some(*i),
            _ => None,
        }
    }

    /// Returns the float value if this is a Float64 variant.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            DataValue::Float64(f) => Some(*f),
            _ => None,
        }
    }

    /// Returns the datetime value if this is a DateTime variant.
    pub fn as_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            DataValue::DateTime(dt) => Some(*dt),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, DataValue::Null)
    }

    /// Renders a scalar as the text that gets analyzed or faceted.
    ///
    /// Lists, objects and nulls have no text form.
    pub fn to_text(&self) -> Option<String> {
        match self {
            DataValue::Bool(b) => Some(b.to_string()),
            DataValue::Int64(i) => Some(i.to_string()),
            DataValue::Float64(f) => Some(f.to_string()),
            DataValue::String(s) | DataValue::Text(s) => Some(s.clone()),
            DataValue::DateTime(dt) => Some(dt.to_rfc3339()),
            DataValue::Null | DataValue::List(_) | DataValue::Object(_) => None,
        }
    }

    /// Flattens nested lists into their non-null scalar members.
    pub fn scalars(&self) -> Vec<&DataValue> {
        let mut out = Vec::new();
        self.collect_scalars(&mut out);
        out
    }

    fn collect_scalars<'a>(&'a self, out: &mut Vec<&'a DataValue>) {
        match self {
            DataValue::List(items) => {
                for item in items {
                    item.collect_scalars(out);
                }
            }
            DataValue::Null | DataValue::Object(_) => {}
            other => out.push(other),
        }
    }

    /// Converts a scalar into the typed numeric representation.
    pub fn to_numeric(&self, numeric_type: NumericType) -> Option<NumericValue> {
        match numeric_type {
            NumericType::Int => match self {
                DataValue::Int64(v) => i32::try_from(*v).ok().map(NumericValue::Int),
                DataValue::Float64(f) if f.fract() == 0.0 => {
                    i32::try_from(*f as i64).ok().map(NumericValue::Int)
                }
                DataValue::String(s) | DataValue::Text(s) => {
                    s.trim().parse().ok().map(NumericValue::Int)
                }
                _ => None,
            },
            NumericType::Long => match self {
                DataValue::Int64(v) => Some(NumericValue::Long(*v)),
                DataValue::Float64(f) if f.fract() == 0.0 => Some(NumericValue::Long(*f as i64)),
                DataValue::String(s) | DataValue::Text(s) => {
                    s.trim().parse().ok().map(NumericValue::Long)
                }
                _ => None,
            },
            NumericType::Float => match self {
                DataValue::Int64(v) => Some(NumericValue::Float(*v as f32)),
                DataValue::Float64(f) => Some(NumericValue::Float(*f as f32)),
                DataValue::String(s) | DataValue::Text(s) => {
                    s.trim().parse().ok().map(NumericValue::Float)
                }
                _ => None,
            },
            NumericType::Double => match self {
                DataValue::Int64(v) => Some(NumericValue::Double(*v as f64)),
                DataValue::Float64(f) => Some(NumericValue::Double(*f)),
                DataValue::String(s) | DataValue::Text(s) => {
                    s.trim().parse().ok().map(NumericValue::Double)
                }
                _ => None,
            },
            NumericType::Date => match self {
                DataValue::DateTime(dt) => Some(NumericValue::Date(dt.timestamp_millis())),
                DataValue::Int64(v) => Some(NumericValue::Date(*v)),
                DataValue::String(s) | DataValue::Text(s) => {
                    parse_date_millis(s).map(NumericValue::Date)
                }
                _ => None,
            },
        }
    }

    fn child(&self, key: &str) -> Option<DataValue> {
        match self {
            DataValue::Object(map) => map.get(key).cloned(),
            DataValue::List(items) => {
                let values: Vec<DataValue> =
                    items.iter().filter_map(|item| item.child(key)).collect();
                if values.is_empty() {
                    None
                } else {
                    Some(DataValue::List(values))
                }
            }
            _ => None,
        }
    }
}

/// Parses an RFC 3339 timestamp or a plain `YYYY-MM-DD` date into epoch millis.
pub fn parse_date_millis(text: &str) -> Option<i64> {
    let text = text.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.timestamp_millis());
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|d| d.and_utc().timestamp_millis())
}

// --- Conversions ---

impl From<String> for DataValue {
    fn from(v: String) -> Self {
        DataValue::Text(v)
    }
}

impl From<&str> for DataValue {
    fn from(v: &str) -> Self {
        DataValue::Text(v.to_string())
    }
}

impl From<i64> for DataValue {
    fn from(v: i64) -> Self {
        DataValue::Int64(v)
    }
}

impl From<i32> for DataValue {
    fn from(v: i32) -> Self {
        DataValue::Int64(v as i64)
    }
}

impl From<f64> for DataValue {
    fn from(v: f64) -> Self {
        DataValue::Float64(v)
    }
}

impl From<f32> for DataValue {
    fn from(v: f32) -> Self {
        DataValue::Float64(v as f64)
    }
}

impl From<bool> for DataValue {
    fn from(v: bool) -> Self {
        DataValue::Bool(v)
    }
}

impl From<DateTime<Utc>> for DataValue {
    fn from(dt: DateTime<Utc>) -> Self {
        DataValue::DateTime(dt)
    }
}

impl<T: Into<DataValue>> From<Vec<T>> for DataValue {
    fn from(values: Vec<T>) -> Self {
        DataValue::List(values.into_iter().map(Into::into).collect())
    }
}

impl From<Document> for DataValue {
    fn from(doc: Document) -> Self {
        DataValue::Object(doc.fields)
    }
}

/// Numeric kinds a field can be indexed or sorted as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NumericType {
    Int,
    Long,
    Float,
    Double,
    /// Epoch milliseconds.
    Date,
}

/// A typed numeric value as indexed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum NumericValue {
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Date(i64),
}

impl NumericValue {
    /// Parses query text as the given numeric type.
    pub fn parse(text: &str, numeric_type: NumericType) -> Option<NumericValue> {
        let text = text.trim();
        match numeric_type {
            NumericType::Int => text.parse().ok().map(NumericValue::Int),
            NumericType::Long => text.parse().ok().map(NumericValue::Long),
            NumericType::Float => text.parse().ok().map(NumericValue::Float),
            NumericType::Double => text.parse().ok().map(NumericValue::Double),
            NumericType::Date => parse_date_millis(text).map(NumericValue::Date),
        }
    }

    fn as_i64(&self) -> Option<i64> {
        match self {
            NumericValue::Int(v) => Some(*v as i64),
            NumericValue::Long(v) | NumericValue::Date(v) => Some(*v),
            NumericValue::Float(_) | NumericValue::Double(_) => None,
        }
    }

    pub fn as_f64(&self) -> f64 {
        match self {
            NumericValue::Int(v) => *v as f64,
            NumericValue::Long(v) | NumericValue::Date(v) => *v as f64,
            NumericValue::Float(v) => *v as f64,
            NumericValue::Double(v) => *v,
        }
    }

    /// Total order; integral kinds compare exactly, the rest as doubles.
    pub fn compare(&self, other: &NumericValue) -> Ordering {
        match (self.as_i64(), other.as_i64()) {
            (Some(a), Some(b)) => a.cmp(&b),
            _ => self.as_f64().total_cmp(&other.as_f64()),
        }
    }
}

/// A stored document: a collection of named fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub fields: BTreeMap<String, DataValue>,
}

impl Document {
    /// Create a new empty document.
    pub fn new() -> Self {
        Self {
            fields: BTreeMap::new(),
        }
    }

    /// Add a field to the document.
    pub fn add_field(mut self, name: impl Into<String>, value: impl Into<DataValue>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Get a reference to a top-level field's value.
    pub fn get(&self, name: &str) -> Option<&DataValue> {
        self.fields.get(name)
    }

    /// Resolves a dotted path such as `author.name` through nested objects.
    ///
    /// When a path segment crosses a list, the lookup continues in every
    /// element and the collected values are returned as a list.
    pub fn value_at(&self, path: &str) -> Option<DataValue> {
        let mut parts = path.split('.');
        let first = parts.next()?;
        let mut current = self.fields.get(first)?.clone();
        for part in parts {
            current = current.child(part)?;
        }
        Some(current)
    }

    /// Get all field names.
    pub fn field_names(&self) -> Vec<&str> {
        self.fields.keys().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

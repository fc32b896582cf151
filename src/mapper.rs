//! Declarative extraction of flat typed records from nested API JSON.
//!
//! Each record type declares a static table of [`FieldDescriptor`]s. The single
//! generic [`map_record`] walks that table against a raw object and always
//! produces a value for every descriptor: a missing path, a JSON `null` for a
//! coerced kind, or a value that cannot be coerced all fall back to the
//! descriptor's default. Missing upstream fields are never an error; they are
//! reported at debug level only.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;

/// How the value found at a path is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Keep the JSON value as-is.
    Raw,
    /// Coerce numbers and numeric strings to `i64`.
    Integer,
    /// Unix epoch milliseconds converted to a UTC instant; zero counts as absent.
    Timestamp,
}

/// Value used when a field is absent or cannot be coerced.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldDefault {
    Null,
    Integer(i64),
    Bool(bool),
    Text(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FieldDescriptor {
    pub name: &'static str,
    /// Slash-delimited path, e.g. `/organizer/id` or `/photos/0/id`.
    pub path: &'static str,
    pub kind: FieldKind,
    pub default: FieldDefault,
}

impl FieldDescriptor {
    pub const fn raw(name: &'static str, path: &'static str) -> Self {
        Self {
            name,
            path,
            kind: FieldKind::Raw,
            default: FieldDefault::Null,
        }
    }

    pub const fn integer(name: &'static str, path: &'static str) -> Self {
        Self {
            name,
            path,
            kind: FieldKind::Integer,
            default: FieldDefault::Null,
        }
    }

    pub const fn timestamp(name: &'static str, path: &'static str) -> Self {
        Self {
            name,
            path,
            kind: FieldKind::Timestamp,
            default: FieldDefault::Null,
        }
    }

    pub const fn with_default(self, default: FieldDefault) -> Self {
        Self { default, ..self }
    }
}

/// One extracted field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Raw(Value),
    Integer(i64),
    Timestamp(DateTime<Utc>),
}

impl From<FieldDefault> for FieldValue {
    fn from(default: FieldDefault) -> Self {
        match default {
            FieldDefault::Null => FieldValue::Null,
            FieldDefault::Integer(i) => FieldValue::Integer(i),
            FieldDefault::Bool(b) => FieldValue::Raw(Value::Bool(b)),
            FieldDefault::Text(s) => FieldValue::Raw(Value::String(s.to_string())),
        }
    }
}

/// Fixed-shape result of [`map_record`]: one entry per descriptor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    values: BTreeMap<&'static str, FieldValue>,
}

static NULL_FIELD: FieldValue = FieldValue::Null;

impl Record {
    pub fn get(&self, name: &str) -> &FieldValue {
        self.values.get(name).unwrap_or(&NULL_FIELD)
    }

    pub fn text(&self, name: &str) -> Option<String> {
        match self.get(name) {
            FieldValue::Null => None,
            FieldValue::Raw(Value::Null) => None,
            FieldValue::Raw(Value::String(s)) => Some(s.clone()),
            FieldValue::Raw(other) => Some(other.to_string()),
            FieldValue::Integer(i) => Some(i.to_string()),
            FieldValue::Timestamp(ts) => Some(ts.to_rfc3339()),
        }
    }

    pub fn integer(&self, name: &str) -> Option<i64> {
        match self.get(name) {
            FieldValue::Integer(i) => Some(*i),
            FieldValue::Raw(value) => coerce_integer(value),
            _ => None,
        }
    }

    pub fn float(&self, name: &str) -> Option<f64> {
        match self.get(name) {
            FieldValue::Integer(i) => Some(*i as f64),
            FieldValue::Raw(Value::Number(n)) => n.as_f64(),
            FieldValue::Raw(Value::String(s)) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn boolean(&self, name: &str) -> Option<bool> {
        match self.get(name) {
            FieldValue::Integer(i) => Some(*i != 0),
            FieldValue::Raw(Value::Bool(b)) => Some(*b),
            FieldValue::Raw(Value::Number(n)) => n.as_i64().map(|i| i != 0),
            FieldValue::Raw(Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" => Some(true),
                "false" | "0" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn timestamp(&self, name: &str) -> Option<DateTime<Utc>> {
        match self.get(name) {
            FieldValue::Timestamp(ts) => Some(*ts),
            _ => None,
        }
    }
}

/// A typed record built from a descriptor table.
pub trait ApiRecord: Sized {
    const FIELDS: &'static [FieldDescriptor];

    fn from_record(record: &Record) -> Self;

    fn from_json(raw: &Value) -> Self {
        Self::from_record(&map_record(raw, Self::FIELDS))
    }
}

/// Apply every descriptor to `raw`.
pub fn map_record(raw: &Value, fields: &[FieldDescriptor]) -> Record {
    let values = fields
        .iter()
        .map(|field| (field.name, extract(raw, field)))
        .collect();
    Record { values }
}

/// Resolve a slash-delimited path; numeric segments index into arrays.
pub fn lookup<'a>(obj: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('/')
        .filter(|segment| !segment.is_empty())
        .try_fold(obj, |node, segment| match node {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
}

fn extract(raw: &Value, field: &FieldDescriptor) -> FieldValue {
    let Some(found) = lookup(raw, field.path) else {
        debug!(
            field = field.name,
            path = field.path,
            "field absent upstream, using default"
        );
        return field.default.into();
    };

    match field.kind {
        FieldKind::Raw if found.is_null() => FieldValue::Null,
        FieldKind::Raw => FieldValue::Raw(found.clone()),
        FieldKind::Integer => match coerce_integer(found) {
            Some(i) => FieldValue::Integer(i),
            None => {
                debug!(field = field.name, value = %found, "not an integer, using default");
                field.default.into()
            }
        },
        FieldKind::Timestamp => match coerce_integer(found)
            .filter(|ms| *ms != 0)
            .and_then(DateTime::<Utc>::from_timestamp_millis)
        {
            Some(ts) => FieldValue::Timestamp(ts),
            None => field.default.into(),
        },
    }
}

fn coerce_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.is_finite() && f.fract() == 0.0)
                .map(|f| f as i64)
        }),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

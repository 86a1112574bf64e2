//! Typed attribute values.

use crate::{ClassName, FileRef, Identity, Record};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Decoded attributes of a record, keyed by field name.
pub type Attributes = BTreeMap<String, Value>;

/// A decoded attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Date(DateTime<Utc>),
    /// Base64-encoded binary payload
    Bytes(String),
    GeoPoint {
        latitude: f64,
        longitude: f64,
    },
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
    /// Reference to another record; compares by identity
    Pointer(Record),
    Relation(Relation),
    File(FileRef),
}

impl Value {
    /// Short type name used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Date(_) => "date",
            Value::Bytes(_) => "bytes",
            Value::GeoPoint { .. } => "geopoint",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
            Value::Pointer(_) => "pointer",
            Value::Relation(_) => "relation",
            Value::File(_) => "file",
        }
    }

    /// Whether this is a mutable container (array or plain object).
    pub fn is_container(&self) -> bool {
        matches!(self, Value::Array(_) | Value::Object(_))
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_pointer(&self) -> Option<&Record> {
        match self {
            Value::Pointer(record) => Some(record),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(f64::from(n))
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Record> for Value {
    fn from(record: Record) -> Self {
        Value::Pointer(record)
    }
}

impl From<FileRef> for Value {
    fn from(file: FileRef) -> Self {
        Value::File(file)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(date: DateTime<Utc>) -> Self {
        Value::Date(date)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::Array(items.into_iter().map(Into::into).collect())
    }
}

/// Handle to a relation field. Membership lives on the server; the handle
/// only knows which record and field it belongs to.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Relation {
    pub owner: Option<Identity>,
    pub key: Option<String>,
    pub target_class_name: Option<ClassName>,
}

impl Relation {
    pub fn new(owner: Identity, key: impl Into<String>) -> Self {
        Self {
            owner: Some(owner),
            key: Some(key.into()),
            target_class_name: None,
        }
    }

    pub fn with_target(mut self, target_class_name: impl Into<ClassName>) -> Self {
        self.target_class_name = Some(target_class_name.into());
        self
    }
}

/// Bind a relation decoded from the wire to the record and field it was
/// read from. Relations already bound and other values are returned as is.
pub fn bind_relation(value: Value, owner: &Identity, field: &str) -> Value {
    match value {
        Value::Relation(mut relation) => {
            relation.owner.get_or_insert_with(|| owner.clone());
            relation.key.get_or_insert_with(|| field.to_string());
            Value::Relation(relation)
        }
        other => other,
    }
}

/// Whether `field` addresses a nested key (`a.b.c`).
pub fn is_dot_notation(field: &str) -> bool {
    field.contains('.')
}

/// Top-level attribute a (possibly dot-notation) field lives under.
pub fn root_field(field: &str) -> &str {
    field.split('.').next().unwrap_or(field)
}

/// Look up a dot-notation path.
pub fn get_path<'a>(attributes: &'a Attributes, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = attributes.get(segments.next()?)?;
    for segment in segments {
        match current {
            Value::Object(map) => current = map.get(segment)?,
            _ => return None,
        }
    }
    Some(current)
}

/// Write (or remove, for `None`) the value at a dot-notation path, creating
/// intermediate objects and replacing non-object intermediates.
pub fn set_path(attributes: &mut Attributes, path: &str, value: Option<Value>) {
    match path.split_once('.') {
        None => match value {
            Some(value) => {
                attributes.insert(path.to_string(), value);
            }
            None => {
                attributes.remove(path);
            }
        },
        Some((head, rest)) => {
            let entry = attributes
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(BTreeMap::new()));
            if !matches!(entry, Value::Object(_)) {
                *entry = Value::Object(BTreeMap::new());
            }
            if let Value::Object(map) = entry {
                set_path(map, rest, value);
            }
        }
    }
}

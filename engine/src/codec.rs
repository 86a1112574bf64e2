//! JSON encoding of values and operations.
//!
//! Special types travel as objects tagged with `__type`, operations as objects
//! tagged with `__op`. Plain JSON maps onto the matching [`Value`] variants.

use crate::{
    error::Result, Attributes, Error, FileRef, ObjectId, Operation, Record, Relation,
    RelationEdit, Value,
};
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Map, Number};
use std::collections::{BTreeMap, BTreeSet};

type Json = serde_json::Value;

fn invalid(message: impl Into<String>) -> Error {
    Error::InvalidEncoding(message.into())
}

fn str_field<'a>(map: &'a Map<String, Json>, key: &str) -> Result<&'a str> {
    map.get(key)
        .and_then(Json::as_str)
        .ok_or_else(|| invalid(format!("missing string field '{key}'")))
}

fn f64_field(map: &Map<String, Json>, key: &str) -> Result<f64> {
    map.get(key)
        .and_then(Json::as_f64)
        .ok_or_else(|| invalid(format!("missing numeric field '{key}'")))
}

/// Parse an ISO-8601 timestamp.
pub fn parse_date(iso: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(iso)
        .map(|date| date.with_timezone(&Utc))
        .map_err(|e| invalid(format!("invalid date '{iso}': {e}")))
}

fn encode_number(n: f64) -> Result<Json> {
    if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
        return Ok(Json::from(n as i64));
    }
    Number::from_f64(n)
        .map(Json::Number)
        .ok_or_else(|| invalid(format!("non-finite number {n}")))
}

/// Encode a pointer to a saved record.
pub fn encode_pointer(record: &Record) -> Result<Json> {
    let id = record.id().ok_or_else(|| Error::UnsavedPointer {
        class_name: record.class_name().to_string(),
    })?;
    Ok(json!({
        "__type": "Pointer",
        "className": record.class_name(),
        "objectId": id,
    }))
}

/// Encode a value into its JSON representation.
pub fn encode(value: &Value) -> Result<Json> {
    match value {
        Value::Null => Ok(Json::Null),
        Value::Bool(b) => Ok(Json::Bool(*b)),
        Value::Number(n) => encode_number(*n),
        Value::String(s) => Ok(Json::String(s.clone())),
        Value::Date(date) => Ok(json!({
            "__type": "Date",
            "iso": date.to_rfc3339_opts(SecondsFormat::Millis, true),
        })),
        Value::Bytes(base64) => Ok(json!({"__type": "Bytes", "base64": base64})),
        Value::GeoPoint {
            latitude,
            longitude,
        } => Ok(json!({
            "__type": "GeoPoint",
            "latitude": latitude,
            "longitude": longitude,
        })),
        Value::Array(items) => items
            .iter()
            .map(encode)
            .collect::<Result<Vec<_>>>()
            .map(Json::Array),
        Value::Object(map) => encode_attributes(map).map(Json::Object),
        Value::Pointer(record) => encode_pointer(record),
        Value::Relation(relation) => Ok(json!({
            "__type": "Relation",
            "className": relation.target_class_name,
        })),
        Value::File(file) => {
            let url = file
                .url()
                .ok_or_else(|| invalid(format!("file '{}' has not been uploaded", file.name())))?;
            Ok(json!({"__type": "File", "name": file.name(), "url": url}))
        }
    }
}

/// Encode a map of attributes.
pub fn encode_attributes(attributes: &BTreeMap<String, Value>) -> Result<Map<String, Json>> {
    attributes
        .iter()
        .map(|(key, value)| encode(value).map(|json| (key.clone(), json)))
        .collect()
}

/// Decode a JSON value.
pub fn decode(json: &Json) -> Result<Value> {
    match json {
        Json::Null => Ok(Value::Null),
        Json::Bool(b) => Ok(Value::Bool(*b)),
        Json::Number(n) => n
            .as_f64()
            .map(Value::Number)
            .ok_or_else(|| invalid(format!("unrepresentable number {n}"))),
        Json::String(s) => Ok(Value::String(s.clone())),
        Json::Array(items) => items
            .iter()
            .map(decode)
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        Json::Object(map) => match map.get("__type").and_then(Json::as_str) {
            Some(tag) => decode_tagged(tag, map),
            None if map.contains_key("__op") => {
                Err(invalid("operation found where a value was expected"))
            }
            None => decode_attributes(map).map(Value::Object),
        },
    }
}

fn decode_tagged(tag: &str, map: &Map<String, Json>) -> Result<Value> {
    match tag {
        "Date" => parse_date(str_field(map, "iso")?).map(Value::Date),
        "Pointer" | "Object" => Ok(Value::Pointer(Record::with_id(
            str_field(map, "className")?,
            str_field(map, "objectId")?,
        ))),
        "Relation" => Ok(Value::Relation(Relation {
            target_class_name: map.get("className").and_then(Json::as_str).map(str::to_string),
            ..Relation::default()
        })),
        "File" => {
            let name = str_field(map, "name")?;
            Ok(Value::File(match map.get("url").and_then(Json::as_str) {
                Some(url) => FileRef::uploaded(name, url),
                None => FileRef::new(name),
            }))
        }
        "GeoPoint" => Ok(Value::GeoPoint {
            latitude: f64_field(map, "latitude")?,
            longitude: f64_field(map, "longitude")?,
        }),
        "Bytes" => Ok(Value::Bytes(str_field(map, "base64")?.to_string())),
        other => Err(invalid(format!("unknown type tag '{other}'"))),
    }
}

/// Decode a JSON object into attributes.
pub fn decode_attributes(map: &Map<String, Json>) -> Result<Attributes> {
    map.iter()
        .map(|(key, value)| decode(value).map(|value| (key.clone(), value)))
        .collect()
}

/// Serialized form used by the object cache to detect in-place mutation of
/// containers. `None` when the value cannot be encoded (for instance it
/// holds a pointer to an unsaved record), which callers treat as changed.
pub fn fingerprint(value: &Value) -> Option<String> {
    encode(value).ok().map(|json| json.to_string())
}

fn relation_pointers(class_name: &Option<String>, ids: &BTreeSet<ObjectId>) -> Vec<Json> {
    ids.iter()
        .map(|id| json!({"__type": "Pointer", "className": class_name, "objectId": id}))
        .collect()
}

/// Encode an operation.
pub fn encode_operation(op: &Operation) -> Result<Json> {
    let encode_items = |items: &[Value]| items.iter().map(encode).collect::<Result<Vec<_>>>();
    match op {
        Operation::Set(value) => encode(value),
        Operation::Unset => Ok(json!({"__op": "Delete"})),
        Operation::Increment(amount) => {
            let amount = encode_number(*amount)?;
            Ok(json!({"__op": "Increment", "amount": amount}))
        }
        Operation::Add(items) => {
            let objects = encode_items(items)?;
            Ok(json!({"__op": "Add", "objects": objects}))
        }
        Operation::AddUnique(items) => {
            let objects = encode_items(items)?;
            Ok(json!({"__op": "AddUnique", "objects": objects}))
        }
        Operation::Remove(items) => {
            let objects = encode_items(items)?;
            Ok(json!({"__op": "Remove", "objects": objects}))
        }
        Operation::RelationEdit(edit) => {
            let adds = json!({
                "__op": "AddRelation",
                "objects": relation_pointers(&edit.target_class_name, &edit.adds),
            });
            let removes = json!({
                "__op": "RemoveRelation",
                "objects": relation_pointers(&edit.target_class_name, &edit.removes),
            });
            Ok(match (edit.adds.is_empty(), edit.removes.is_empty()) {
                (false, false) => json!({"__op": "Batch", "ops": [adds, removes]}),
                (true, false) => removes,
                _ => adds,
            })
        }
    }
}

fn decode_items(map: &Map<String, Json>) -> Result<Vec<Value>> {
    match map.get("objects") {
        Some(Json::Array(items)) => items.iter().map(decode).collect(),
        _ => Err(invalid("operation is missing its 'objects' array")),
    }
}

fn decode_relation_edit(map: &Map<String, Json>, adding: bool) -> Result<RelationEdit> {
    let mut edit = RelationEdit::default();
    for item in decode_items(map)? {
        let Value::Pointer(record) = item else {
            return Err(invalid("relation operations only hold pointers"));
        };
        let id = record.id().ok_or_else(|| invalid("relation pointer without an id"))?;
        edit.target_class_name = Some(record.class_name().to_string());
        if adding {
            edit.adds.insert(id);
        } else {
            edit.removes.insert(id);
        }
    }
    Ok(edit)
}

/// Decode an operation. Anything that is not an `__op` object is a `Set`.
pub fn decode_operation(json: &Json) -> Result<Operation> {
    let Some(map) = json.as_object().filter(|map| map.contains_key("__op")) else {
        return decode(json).map(Operation::Set);
    };
    match str_field(map, "__op")? {
        "Delete" => Ok(Operation::Unset),
        "Increment" => Ok(Operation::Increment(f64_field(map, "amount")?)),
        "Add" => Ok(Operation::Add(decode_items(map)?)),
        "AddUnique" => Ok(Operation::add_unique(decode_items(map)?)),
        "Remove" => Ok(Operation::remove(decode_items(map)?)),
        "AddRelation" => decode_relation_edit(map, true).map(Operation::RelationEdit),
        "RemoveRelation" => decode_relation_edit(map, false).map(Operation::RelationEdit),
        "Batch" => {
            let ops = map
                .get("ops")
                .and_then(Json::as_array)
                .ok_or_else(|| invalid("batch operation is missing 'ops'"))?;
            let mut merged: Option<Operation> = None;
            for op in ops {
                let next = decode_operation(op)?;
                merged = Some(next.merge_with(merged.as_ref())?);
            }
            merged.ok_or_else(|| invalid("empty batch operation"))
        }
        other => Err(invalid(format!("unknown operation '{other}'"))),
    }
}

/// Attributes decoded from a save or fetch response.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ServerResponse {
    pub object_id: Option<ObjectId>,
    /// Changed fields; `None` removes the field.
    pub changes: BTreeMap<String, Option<Value>>,
}

/// Decode a server response body. `createdAt`/`updatedAt` arrive as plain ISO
/// strings, `updatedAt` defaults to `createdAt`, and `{"__op": "Delete"}`
/// marks a removed field.
pub fn decode_server_response(map: &Map<String, Json>) -> Result<ServerResponse> {
    let mut response = ServerResponse::default();
    for (key, value) in map {
        match (key.as_str(), value) {
            ("objectId", Json::String(id)) => response.object_id = Some(id.clone()),
            ("objectId", _) => return Err(invalid("objectId must be a string")),
            ("createdAt" | "updatedAt", Json::String(iso)) => {
                response
                    .changes
                    .insert(key.clone(), Some(Value::Date(parse_date(iso)?)));
            }
            (_, Json::Object(inner))
                if inner.get("__op").and_then(Json::as_str) == Some("Delete") =>
            {
                response.changes.insert(key.clone(), None);
            }
            _ => {
                response.changes.insert(key.clone(), Some(decode(value)?));
            }
        }
    }
    if !response.changes.contains_key("updatedAt") {
        if let Some(created) = response.changes.get("createdAt").cloned() {
            response.changes.insert("updatedAt".to_string(), created);
        }
    }
    Ok(response)
}

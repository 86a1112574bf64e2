//! Save payloads and the handling of their results.
//!
//! Each function here works on one record and is called from inside that
//! record's task queue, so the front layer it reads is the one being saved.

use crate::error::{Error, Result};
use crate::transport::{class_path, object_path, Method};
use serde_json::{json, Map, Value as Json};
use tether_engine::{codec, Identity, ObjectStateStore, Operation, Record};
use tracing::debug;

/// One record request, before it is sent alone or inside a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedRequest {
    pub method: Method,
    pub path: String,
    pub body: Json,
}

impl PreparedRequest {
    /// Entry of a `batch` request body.
    pub fn to_batch_entry(&self, mount_path: &str) -> Json {
        json!({
            "method": self.method.as_str(),
            "path": format!("{mount_path}{}", self.path),
            "body": self.body,
        })
    }
}

/// Record containers changed in place as explicit `Set` operations, so they
/// travel with the next layer that is saved.
pub fn stage_dirty_containers(store: &ObjectStateStore, identity: &Identity) -> Result<()> {
    let dirty = store.compute_dirty_container_fields(identity)?;
    if dirty.is_empty() {
        return Ok(());
    }
    let attributes = store.estimate_attributes(identity)?;
    for field in dirty {
        if let Some(value) = attributes.get(&field) {
            debug!(identity = %identity, field = %field, "staging container changed in place");
            store.set_pending_op(identity, &field, Operation::Set(value.clone()))?;
        }
    }
    Ok(())
}

/// Build the request saving the front layer of `record`.
///
/// `None` when the record already exists and the front layer is empty.
pub fn prepare_save(store: &ObjectStateStore, record: &Record) -> Result<Option<PreparedRequest>> {
    let identity = store.identity_of(record);
    let layers = store.pending_ops(&identity);
    let mut body = Map::new();
    if let Some(front) = layers.first() {
        for (field, op) in front {
            body.insert(field.clone(), codec::encode_operation(op)?);
        }
    }

    let request = match record.id() {
        None => PreparedRequest {
            method: Method::Post,
            path: class_path(record.class_name()),
            body: Json::Object(body),
        },
        Some(_) if body.is_empty() => return Ok(None),
        Some(id) => PreparedRequest {
            method: Method::Put,
            path: object_path(record.class_name(), &id),
            body: Json::Object(body),
        },
    };
    Ok(Some(request))
}

/// Commit a successful save response for `record`.
///
/// Pops the front layer, assigns the server id to new records and migrates
/// their state, then commits the response over the saved layer. A response
/// rejected before the pop rolls the front layer back like a failed save, so
/// callers never roll back again.
pub fn handle_save_response(
    store: &ObjectStateStore,
    record: &Record,
    response: &Json,
) -> Result<()> {
    let existed = !record.is_new();
    let decoded = match decode_save_response(record, response) {
        Ok(decoded) => decoded,
        Err(error) => {
            handle_save_error(store, record);
            return Err(error);
        }
    };

    let mut identity = store.identity_of(record);
    let saved = store.pop_front_layer(&identity);

    if let (false, Some(id)) = (existed, decoded.object_id) {
        record.assign_id(id);
        let assigned = store.identity_of(record);
        store.migrate_identity(&identity, &assigned);
        identity = assigned;
    }

    store.commit_saved_layer(&identity, &saved, decoded.changes)?;
    if existed {
        store.set_existed(&identity, true);
    }
    debug!(identity = %identity, fields = saved.len(), "save committed");
    Ok(())
}

fn decode_save_response(record: &Record, response: &Json) -> Result<codec::ServerResponse> {
    let map = response
        .as_object()
        .ok_or_else(|| Error::InvalidResponse(format!("expected an object, got {response}")))?;
    let decoded = codec::decode_server_response(map)?;
    if record.is_new() && decoded.object_id.is_none() {
        return Err(Error::MissingObjectId {
            class_name: record.class_name().to_string(),
        });
    }
    Ok(decoded)
}

/// Roll the front layer of `record` into the next one after a failed save.
pub fn handle_save_error(store: &ObjectStateStore, record: &Record) {
    store.merge_front_into_second(&store.identity_of(record));
}

/// Split a `batch` response into one result per request.
pub fn split_batch_response(response: &Json, expected: usize) -> Result<Vec<Result<Json>>> {
    let items = response
        .as_array()
        .ok_or_else(|| Error::InvalidResponse("batch response must be an array".into()))?;
    if items.len() != expected {
        return Err(Error::InvalidResponse(format!(
            "batch response has {} entries for {expected} requests",
            items.len()
        )));
    }
    Ok(items.iter().map(batch_item_result).collect())
}

fn batch_item_result(item: &Json) -> Result<Json> {
    if let Some(success) = item.get("success") {
        return Ok(success.clone());
    }
    match item.get("error") {
        Some(error) => Err(Error::Server {
            code: error.get("code").and_then(Json::as_i64).unwrap_or(-1),
            message: error
                .get("error")
                .and_then(Json::as_str)
                .unwrap_or("unknown error")
                .to_string(),
        }),
        None => Err(Error::InvalidResponse(format!("unexpected batch entry {item}"))),
    }
}

//! Snapshot types for persisting and restoring record state.
//!
//! A [`RecordSnapshot`] captures everything the store knows about one record:
//! its committed server data and every pending layer, both in their wire
//! encoding. Snapshots say nothing about where they are stored.

use crate::{
    codec, error::Result, value, ClassName, Error, ObjectId, ObjectState, ObjectStateStore,
    OpsLayer, Record,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};
use std::collections::BTreeMap;

/// Version of the snapshot format for future compatibility.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// Serialized state of a single record.
///
/// Uses BTreeMap for deterministic serialization order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordSnapshot {
    /// Snapshot format version
    pub format_version: u32,
    pub class_name: ClassName,
    /// Server id, if the record was saved
    pub object_id: Option<ObjectId>,
    /// Local id of the handle the snapshot was taken from
    pub local_id: ObjectId,
    pub existed: bool,
    /// Encoded server data
    pub server_data: BTreeMap<String, Json>,
    /// Encoded pending operations, oldest layer first
    pub pending_ops: Vec<BTreeMap<String, Json>>,
}

impl RecordSnapshot {
    /// Number of pending operations across all layers.
    pub fn pending_count(&self) -> usize {
        self.pending_ops.iter().map(BTreeMap::len).sum()
    }

    /// Serialize to JSON with deterministic ordering.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Serialize to pretty JSON with deterministic ordering.
    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: Self =
            serde_json::from_str(json).map_err(|e| Error::InvalidSnapshot(e.to_string()))?;

        if snapshot.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(Error::InvalidSnapshot(format!(
                "unsupported snapshot format version: {} (max supported: {})",
                snapshot.format_version, SNAPSHOT_FORMAT_VERSION
            )));
        }

        Ok(snapshot)
    }
}

/// Capture the state of `record`. A record the store has never seen exports
/// as an empty snapshot without being added to the store.
///
/// Fails with [`Error::UnsavedPointer`] if any stored value points at a record
/// that has no server id yet.
pub fn export_record(store: &ObjectStateStore, record: &Record) -> Result<RecordSnapshot> {
    let (server_data, pending_ops, existed) = match store.get(&store.identity_of(record)) {
        Some(state) => encode_state(&state.lock())?,
        None => encode_state(&ObjectState::new())?,
    };

    Ok(RecordSnapshot {
        format_version: SNAPSHOT_FORMAT_VERSION,
        class_name: record.class_name().to_string(),
        object_id: record.id(),
        local_id: record.local_id().to_string(),
        existed,
        server_data,
        pending_ops,
    })
}

type EncodedState = (BTreeMap<String, Json>, Vec<BTreeMap<String, Json>>, bool);

fn encode_state(state: &ObjectState) -> Result<EncodedState> {
    let server_data = state
        .server_data
        .iter()
        .map(|(field, value)| Ok((field.clone(), codec::encode(value)?)))
        .collect::<Result<BTreeMap<_, _>>>()?;
    let pending_ops = state
        .pending_ops
        .iter()
        .map(|layer| {
            layer
                .iter()
                .map(|(field, op)| Ok((field.clone(), codec::encode_operation(op)?)))
                .collect::<Result<BTreeMap<_, _>>>()
        })
        .collect::<Result<Vec<_>>>()?;
    Ok((server_data, pending_ops, state.existed))
}

/// Restore `snapshot` into `store` and return a handle to it.
///
/// Any state already stored under the restored identity is replaced.
pub fn import_record(store: &ObjectStateStore, snapshot: &RecordSnapshot) -> Result<Record> {
    if snapshot.format_version > SNAPSHOT_FORMAT_VERSION {
        return Err(Error::InvalidSnapshot(format!(
            "unsupported snapshot format version: {}",
            snapshot.format_version
        )));
    }

    let record = Record::restore(
        snapshot.class_name.clone(),
        snapshot.object_id.clone(),
        snapshot.local_id.clone(),
    );
    let identity = store.identity_of(&record);

    let server_data: Map<String, Json> = snapshot
        .server_data
        .iter()
        .map(|(field, json)| (field.clone(), json.clone()))
        .collect();
    let server_data = codec::decode_attributes(&server_data)?
        .into_iter()
        .map(|(field, decoded)| {
            let bound = value::bind_relation(decoded, &identity, &field);
            (field, bound)
        })
        .collect();

    let mut pending_ops = snapshot
        .pending_ops
        .iter()
        .map(|layer| {
            layer
                .iter()
                .map(|(field, json)| Ok((field.clone(), codec::decode_operation(json)?)))
                .collect::<Result<OpsLayer>>()
        })
        .collect::<Result<Vec<_>>>()?;
    if pending_ops.is_empty() {
        pending_ops.push(OpsLayer::new());
    }

    let state = store.get_or_create(&identity);
    let mut state = state.lock();
    state.replace_server_data(server_data);
    state.pending_ops = pending_ops;
    state.existed = snapshot.existed;

    Ok(record)
}

//! Store - the in-memory object state container.
//!
//! The [`ObjectStateStore`] maps identities to their [`ObjectState`]. Every
//! mutation of stored state goes through the methods here, which lock one
//! state at a time and never hold a map shard across that lock.

use crate::{
    error::Result, state::ObjectState, value, Attributes, Identity, IdentityPolicy, Operation,
    OpsLayer, Record, TaskQueue, Value,
};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// Shared handle to one identity's state.
pub type SharedState = Arc<Mutex<ObjectState>>;

/// Keyed storage of per-record state.
#[derive(Debug, Default)]
pub struct ObjectStateStore {
    policy: RwLock<IdentityPolicy>,
    states: DashMap<Identity, SharedState>,
}

impl ObjectStateStore {
    /// Create an empty store using `policy` for identity lookups.
    pub fn new(policy: IdentityPolicy) -> Self {
        Self {
            policy: RwLock::new(policy),
            states: DashMap::new(),
        }
    }

    pub fn policy(&self) -> IdentityPolicy {
        *self.policy.read()
    }

    /// Switch the identity policy. Existing entries keep their keys; only
    /// lookups made afterwards use the new policy.
    pub fn set_policy(&self, policy: IdentityPolicy) {
        *self.policy.write() = policy;
    }

    /// The identity `record` maps to under the current policy.
    pub fn identity_of(&self, record: &Record) -> Identity {
        record.identity(self.policy())
    }

    /// Get the state for `identity`, creating an empty one if absent.
    pub fn get_or_create(&self, identity: &Identity) -> SharedState {
        let entry = self.states.entry(identity.clone()).or_insert_with(|| {
            debug!(identity = %identity, "creating object state");
            Arc::new(Mutex::new(ObjectState::new()))
        });
        Arc::clone(entry.value())
    }

    /// Get the state for `identity` without creating it.
    pub fn get(&self, identity: &Identity) -> Option<SharedState> {
        self.states.get(identity).map(|entry| Arc::clone(entry.value()))
    }

    fn with_state<R>(&self, identity: &Identity, f: impl FnOnce(&mut ObjectState) -> R) -> R {
        let state = self.get_or_create(identity);
        let mut guard = state.lock();
        f(&mut guard)
    }

    /// Merge `op` into the newest layer's entry for `field`.
    pub fn set_pending_op(&self, identity: &Identity, field: &str, op: Operation) -> Result<()> {
        self.with_state(identity, |state| state.set_pending_op(identity, field, op))
    }

    pub fn push_layer(&self, identity: &Identity) {
        self.with_state(identity, |state| {
            state.push_layer();
            debug!(identity = %identity, layers = state.pending_ops.len(), "pushed ops layer");
        });
    }

    pub fn pop_front_layer(&self, identity: &Identity) -> OpsLayer {
        self.with_state(identity, |state| {
            let front = state.pop_front_layer();
            debug!(
                identity = %identity,
                fields = front.len(),
                layers = state.pending_ops.len(),
                "popped ops layer"
            );
            front
        })
    }

    /// Fold the front layer into the next one after a failed save. When a
    /// field conflicts the front layer stays where it is.
    pub fn merge_front_into_second(&self, identity: &Identity) {
        self.with_state(identity, |state| {
            let conflicts = state.merge_front_into_second();
            for field in &conflicts {
                warn!(
                    identity = %identity,
                    field = %field,
                    "failed edit conflicts with a newer edit, keeping it in its own layer"
                );
            }
            debug!(identity = %identity, layers = state.pending_ops.len(), "merged front ops layer");
        });
    }

    /// Copy of every pending layer, oldest first.
    pub fn pending_ops(&self, identity: &Identity) -> Vec<OpsLayer> {
        self.with_state(identity, |state| state.pending_ops.clone())
    }

    pub fn commit_server_changes(
        &self,
        identity: &Identity,
        changes: BTreeMap<String, Option<Value>>,
    ) {
        self.with_state(identity, |state| state.commit_server_changes(changes));
    }

    /// Commit the result of a successful save of `layer`.
    pub fn commit_saved_layer(
        &self,
        identity: &Identity,
        layer: &OpsLayer,
        response: BTreeMap<String, Option<Value>>,
    ) -> Result<()> {
        self.with_state(identity, |state| state.commit_saved_layer(identity, layer, response))
    }

    pub fn replace_server_data(&self, identity: &Identity, attributes: Attributes) {
        self.with_state(identity, |state| state.replace_server_data(attributes));
    }

    pub fn server_data(&self, identity: &Identity) -> Attributes {
        self.with_state(identity, |state| state.server_data.clone())
    }

    /// What the application should currently observe for `identity`.
    pub fn estimate_attributes(&self, identity: &Identity) -> Result<Attributes> {
        self.with_state(identity, |state| state.estimate_attributes(identity))
    }

    /// Estimated value of one (possibly dot-notation) field.
    pub fn estimate_attribute(&self, identity: &Identity, field: &str) -> Result<Option<Value>> {
        let attributes = self.estimate_attributes(identity)?;
        Ok(value::get_path(&attributes, field).cloned())
    }

    pub fn compute_dirty_container_fields(&self, identity: &Identity) -> Result<BTreeSet<String>> {
        self.with_state(identity, |state| state.dirty_container_fields(identity))
    }

    /// Fields with unsaved local changes: keys of every layer no save has
    /// taken yet, plus containers mutated in place.
    ///
    /// Every queued save has taken one layer from the front, so with `n`
    /// writes queued the first `n` layers are spoken for. The last layer
    /// never is.
    pub fn dirty_keys(&self, identity: &Identity) -> Result<BTreeSet<String>> {
        self.with_state(identity, |state| {
            let mut keys = state.dirty_container_fields(identity)?;
            let in_flight = state
                .task_queue
                .len()
                .min(state.pending_ops.len().saturating_sub(1));
            for layer in &state.pending_ops[in_flight..] {
                keys.extend(layer.keys().cloned());
            }
            Ok(keys)
        })
    }

    /// Whether `record` has anything to save.
    pub fn is_dirty(&self, record: &Record) -> Result<bool> {
        if record.is_new() {
            return Ok(true);
        }
        Ok(!self.dirty_keys(&self.identity_of(record))?.is_empty())
    }

    /// Drop unsaved edits of the newest layer, for `keys` only if given.
    pub fn clear_pending_ops(&self, identity: &Identity, keys: Option<&[&str]>) {
        self.with_state(identity, |state| {
            let Some(layer) = state.pending_ops.last_mut() else {
                return;
            };
            match keys {
                Some(keys) => {
                    for key in keys {
                        layer.remove(*key);
                    }
                }
                None => layer.clear(),
            }
        });
    }

    /// Mutate a stored server value in place without recording an operation.
    ///
    /// Only containers are tracked afterwards: the change surfaces through
    /// [`compute_dirty_container_fields`](Self::compute_dirty_container_fields)
    /// and is sent as a `Set` on the next save. Returns `false` if the field
    /// has no server value.
    pub fn mutate_in_place(
        &self,
        identity: &Identity,
        field: &str,
        f: impl FnOnce(&mut Value),
    ) -> bool {
        self.with_state(identity, |state| match state.server_data.get_mut(field) {
            Some(value) => {
                f(value);
                true
            }
            None => false,
        })
    }

    pub fn existed(&self, identity: &Identity) -> bool {
        self.with_state(identity, |state| state.existed)
    }

    pub fn set_existed(&self, identity: &Identity, existed: bool) {
        self.with_state(identity, |state| state.existed = existed);
    }

    /// The write queue of `identity`.
    pub fn task_queue(&self, identity: &Identity) -> Arc<TaskQueue> {
        self.with_state(identity, |state| Arc::clone(&state.task_queue))
    }

    /// Rekey the state stored under `from` to `to`, keeping its layers,
    /// server data and task queue. Relation handles owned by `from` are
    /// rebound to `to`.
    ///
    /// A state already stored under `to`, created by an edit made through
    /// the new identity before the migration ran, is absorbed into the moved
    /// one so its edits survive.
    pub fn migrate_identity(&self, from: &Identity, to: &Identity) {
        if from == to {
            return;
        }
        let Some((_, state)) = self.states.remove(from) else {
            debug!(from = %from, to = %to, "nothing to migrate");
            return;
        };
        {
            let mut guard = state.lock();
            for value in guard.server_data.values_mut() {
                if let Value::Relation(relation) = value {
                    if relation.owner.as_ref() == Some(from) {
                        relation.owner = Some(to.clone());
                    }
                }
            }
        }
        if let Some(existing) = self.states.insert(to.clone(), Arc::clone(&state)) {
            let separated = state.lock().absorb(&existing.lock());
            warn!(
                from = %from,
                to = %to,
                separated = separated.len(),
                "merged object state created under the new identity during migration"
            );
        }
        debug!(from = %from, to = %to, "migrated object state");
    }

    /// Remove every stored state.
    pub fn reset(&self) {
        debug!(count = self.states.len(), "resetting object state store");
        self.states.clear();
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Identities currently stored for `class_name`, ordered.
    pub fn identities(&self, class_name: &str) -> Vec<Identity> {
        let mut identities: Vec<_> = self
            .states
            .iter()
            .filter(|entry| entry.key().class_name == class_name)
            .map(|entry| entry.key().clone())
            .collect();
        identities.sort();
        identities
    }
}

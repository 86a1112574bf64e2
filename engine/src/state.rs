//! Per-record object state.
//!
//! An [`ObjectState`] holds the last committed server snapshot of a record
//! and a stack of not-yet-acknowledged operation layers. The first layer is
//! the one currently being saved (or the only one when nothing is in flight);
//! new local edits always land in the last layer.

use crate::{
    codec, error::Result, value, Attributes, Identity, Operation, TaskQueue, Value,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

/// Pending operations of one save attempt, at most one per field.
pub type OpsLayer = BTreeMap<String, Operation>;

/// Apply `op` to the (possibly dot-notation) `field` of `attributes`.
pub fn apply_at_path(
    attributes: &mut Attributes,
    owner: &Identity,
    field: &str,
    op: &Operation,
) -> Result<()> {
    let current = value::get_path(attributes, field).cloned();
    let next = op.apply_to(current.as_ref(), owner, field)?;
    value::set_path(attributes, field, next);
    Ok(())
}

/// Apply every operation of `layers` over `attributes`, oldest layer first.
fn fold_layers<'a>(
    mut attributes: Attributes,
    owner: &Identity,
    layers: impl IntoIterator<Item = &'a OpsLayer>,
) -> Result<Attributes> {
    for layer in layers {
        for (field, op) in layer {
            apply_at_path(&mut attributes, owner, field, op)?;
        }
    }
    Ok(attributes)
}

/// State of one record identity.
#[derive(Debug)]
pub struct ObjectState {
    /// Last committed server values.
    pub server_data: Attributes,
    /// Never empty.
    pub pending_ops: Vec<OpsLayer>,
    /// Serialized container values as of the last commit.
    pub object_cache: HashMap<String, String>,
    /// Whether the server had this record before this process touched it.
    pub existed: bool,
    pub task_queue: Arc<TaskQueue>,
}

impl Default for ObjectState {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectState {
    pub fn new() -> Self {
        Self {
            server_data: Attributes::new(),
            pending_ops: vec![OpsLayer::new()],
            object_cache: HashMap::new(),
            existed: false,
            task_queue: Arc::new(TaskQueue::new()),
        }
    }

    fn top_layer(&mut self) -> &mut OpsLayer {
        if self.pending_ops.is_empty() {
            self.pending_ops.push(OpsLayer::new());
        }
        let last = self.pending_ops.len() - 1;
        &mut self.pending_ops[last]
    }

    /// Merge `op` into the last layer's entry for `field`.
    ///
    /// The merged operation must also apply over the current estimate, so an
    /// edit that cannot apply (incrementing a string) is rejected here and
    /// the layer is left unchanged.
    pub fn set_pending_op(&mut self, owner: &Identity, field: &str, op: Operation) -> Result<()> {
        let mut candidate = self.top_layer().clone();
        let merged = op.merge_with(candidate.get(field))?;
        candidate.insert(field.to_string(), merged);

        let last = self.pending_ops.len() - 1;
        let older = self.pending_ops[..last].iter();
        fold_layers(self.server_data.clone(), owner, older.chain([&candidate]))?;

        self.pending_ops[last] = candidate;
        Ok(())
    }

    pub fn push_layer(&mut self) {
        self.pending_ops.push(OpsLayer::new());
    }

    /// Remove and return the first layer, leaving a fresh empty layer behind
    /// if it was the only one.
    pub fn pop_front_layer(&mut self) -> OpsLayer {
        let front = self.pending_ops.remove(0);
        if self.pending_ops.is_empty() {
            self.pending_ops.push(OpsLayer::new());
        }
        front
    }

    /// Fold the first layer into the second so failed edits are retried with
    /// whatever was queued after them.
    ///
    /// If any field of the first layer cannot be combined with the newer
    /// operation, nothing is merged: the first layer stays in front and is
    /// sent on its own by the next save. The conflicting fields are returned.
    pub fn merge_front_into_second(&mut self) -> Vec<String> {
        if self.pending_ops.len() < 2 {
            return Vec::new();
        }
        let mut next = self.pending_ops[1].clone();
        let mut conflicts = Vec::new();
        for (field, older) in &self.pending_ops[0] {
            let merged = match next.get(field) {
                Some(newer) => match newer.merge_with(Some(older)) {
                    Ok(merged) => merged,
                    Err(_) => {
                        conflicts.push(field.clone());
                        continue;
                    }
                },
                None => older.clone(),
            };
            next.insert(field.clone(), merged);
        }
        if conflicts.is_empty() {
            self.pending_ops.remove(0);
            self.pending_ops[0] = next;
        }
        conflicts
    }

    /// Take over `other`, a state created under the same identity while this
    /// one was still keyed elsewhere.
    ///
    /// Server values already held here win. The operations of `other` are
    /// newer than ours and are merged into the last layer; one that cannot
    /// merge goes into a new layer of its own. Returns those fields.
    pub fn absorb(&mut self, other: &ObjectState) -> Vec<String> {
        for (field, value) in &other.server_data {
            self.server_data
                .entry(field.clone())
                .or_insert_with(|| value.clone());
        }
        for (field, cached) in &other.object_cache {
            self.object_cache
                .entry(field.clone())
                .or_insert_with(|| cached.clone());
        }
        self.existed |= other.existed;

        let mut separated = Vec::new();
        for (field, op) in other.pending_ops.iter().flatten() {
            match op.merge_with(self.top_layer().get(field)) {
                Ok(merged) => {
                    self.top_layer().insert(field.clone(), merged);
                }
                Err(_) => {
                    self.push_layer();
                    self.top_layer().insert(field.clone(), op.clone());
                    separated.push(field.clone());
                }
            }
        }
        separated
    }

    /// Overwrite server values; `None` removes a field. Container values
    /// refresh their cache entry.
    pub fn commit_server_changes(&mut self, changes: BTreeMap<String, Option<Value>>) {
        for (field, change) in changes {
            match change {
                Some(value) => {
                    self.refresh_cache(&field, &value);
                    self.server_data.insert(field, value);
                }
                None => {
                    self.object_cache.remove(&field);
                    self.server_data.remove(&field);
                }
            }
        }
    }

    /// Commit a successfully saved `layer` together with the decoded server
    /// `response`.
    ///
    /// Response values win. Plain objects in the response are merged over the
    /// object as it stands with the saved layer applied. Fields the server
    /// did not echo are committed by applying the saved operation to the
    /// previous server value; relation edits are always applied so the handle
    /// stays bound.
    pub fn commit_saved_layer(
        &mut self,
        owner: &Identity,
        layer: &OpsLayer,
        response: BTreeMap<String, Option<Value>>,
    ) -> Result<()> {
        let saved = fold_layers(self.server_data.clone(), owner, [layer])?;
        let mut committed = self.server_data.clone();
        let mut touched: BTreeSet<String> = BTreeSet::new();

        for (field, change) in response {
            let change = match (change, value::get_path(&saved, &field)) {
                (Some(Value::Object(incoming)), Some(Value::Object(current))) => {
                    let mut merged = current.clone();
                    merged.extend(incoming);
                    Some(Value::Object(merged))
                }
                (change, _) => change,
            };
            touched.insert(value::root_field(&field).to_string());
            value::set_path(&mut committed, &field, change);
        }

        for (field, op) in layer {
            let root = value::root_field(field);
            let echoed = touched.contains(root);
            if echoed && !matches!(op, Operation::RelationEdit(_)) {
                continue;
            }
            apply_at_path(&mut committed, owner, field, op)?;
            touched.insert(root.to_string());
        }

        let changes = touched
            .into_iter()
            .map(|field| {
                let value = committed.remove(&field);
                (field, value)
            })
            .collect();
        self.commit_server_changes(changes);
        Ok(())
    }

    /// Replace the whole server snapshot.
    pub fn replace_server_data(&mut self, attributes: Attributes) {
        self.object_cache.clear();
        for (field, value) in &attributes {
            self.refresh_cache(field, value);
        }
        self.server_data = attributes;
    }

    fn refresh_cache(&mut self, field: &str, value: &Value) {
        match value.is_container().then(|| codec::fingerprint(value)).flatten() {
            Some(serialized) => {
                self.object_cache.insert(field.to_string(), serialized);
            }
            None => {
                self.object_cache.remove(field);
            }
        }
    }

    /// Server data with every pending layer folded on top, oldest first.
    pub fn estimate_attributes(&self, owner: &Identity) -> Result<Attributes> {
        fold_layers(self.server_data.clone(), owner, &self.pending_ops)
    }

    /// Whether any layer holds an operation touching the top-level `field`.
    pub fn has_pending_op_under(&self, field: &str) -> bool {
        self.pending_ops
            .iter()
            .flat_map(|layer| layer.keys())
            .any(|key| value::root_field(key) == field)
    }

    /// Container fields whose serialized value no longer matches the cache.
    ///
    /// This is a heuristic for edits made without an operation: a container
    /// mutated back to an equal serialization is not detected. Fields that
    /// already carry pending operations are tracked through those instead.
    pub fn dirty_container_fields(&self, owner: &Identity) -> Result<BTreeSet<String>> {
        let attributes = self.estimate_attributes(owner)?;
        Ok(attributes
            .iter()
            .filter(|(_, value)| value.is_container())
            .filter(|(field, _)| !self.has_pending_op_under(field))
            .filter(|(field, value)| {
                codec::fingerprint(value).as_ref() != self.object_cache.get(*field)
            })
            .map(|(field, _)| field.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ObjectKey;

    fn owner() -> Identity {
        Identity::new("Post", ObjectKey::Id("p1".into()))
    }

    #[test]
    fn starts_with_one_empty_layer() {
        let state = ObjectState::new();
        assert_eq!(state.pending_ops.len(), 1);
        assert!(state.pending_ops[0].is_empty());
        assert!(!state.existed);
    }

    #[test]
    fn set_then_increment_estimates_sum() {
        let mut state = ObjectState::new();
        state.set_pending_op(&owner(), "x", Operation::set(5)).unwrap();
        state.set_pending_op(&owner(), "x", Operation::increment(3)).unwrap();

        assert_eq!(state.pending_ops[0].len(), 1);
        let attrs = state.estimate_attributes(&owner()).unwrap();
        assert_eq!(attrs["x"], Value::from(8));
    }

    #[test]
    fn incompatible_merge_is_reported() {
        let mut state = ObjectState::new();
        state.set_pending_op(&owner(), "x", Operation::increment(1)).unwrap();
        assert!(state
            .set_pending_op(&owner(), "x", Operation::add(vec![Value::from(1)]))
            .is_err());
        // The original op survives.
        assert_eq!(state.pending_ops[0]["x"], Operation::increment(1));
    }

    #[test]
    fn layers_apply_in_order() {
        let mut state = ObjectState::new();
        state.server_data.insert("n".into(), Value::from(1));
        state.set_pending_op(&owner(), "n", Operation::increment(1)).unwrap();
        state.push_layer();
        state.set_pending_op(&owner(), "n", Operation::set(10)).unwrap();
        state.push_layer();
        state.set_pending_op(&owner(), "n", Operation::increment(5)).unwrap();

        let attrs = state.estimate_attributes(&owner()).unwrap();
        assert_eq!(attrs["n"], Value::from(15));
    }

    #[test]
    fn pop_front_keeps_a_layer() {
        let mut state = ObjectState::new();
        state.set_pending_op(&owner(), "a", Operation::set(1)).unwrap();
        let front = state.pop_front_layer();
        assert_eq!(front.len(), 1);
        assert_eq!(state.pending_ops.len(), 1);
        assert!(state.pending_ops[0].is_empty());
    }

    #[test]
    fn merge_front_into_second_preserves_order() {
        let mut state = ObjectState::new();
        state.set_pending_op(&owner(), "n", Operation::set(1)).unwrap();
        state.set_pending_op(&owner(), "keep", Operation::set("a")).unwrap();
        state.push_layer();
        state.set_pending_op(&owner(), "n", Operation::increment(2)).unwrap();

        let dropped = state.merge_front_into_second();
        assert!(dropped.is_empty());
        assert_eq!(state.pending_ops.len(), 1);
        assert_eq!(state.pending_ops[0]["n"], Operation::set(3));
        assert_eq!(state.pending_ops[0]["keep"], Operation::set("a"));
    }

    #[test]
    fn merge_front_with_single_layer_is_noop() {
        let mut state = ObjectState::new();
        state.set_pending_op(&owner(), "n", Operation::set(1)).unwrap();
        state.merge_front_into_second();
        assert_eq!(state.pending_ops.len(), 1);
        assert_eq!(state.pending_ops[0]["n"], Operation::set(1));
    }

    #[test]
    fn merge_front_keeps_conflicting_layer_in_front() {
        let mut state = ObjectState::new();
        state
            .set_pending_op(&owner(), "tags", Operation::add(vec![Value::from("a")]))
            .unwrap();
        state.set_pending_op(&owner(), "n", Operation::set(1)).unwrap();
        state.push_layer();
        state
            .set_pending_op(&owner(), "tags", Operation::remove(vec![Value::from("a")]))
            .unwrap();

        let conflicts = state.merge_front_into_second();
        assert_eq!(conflicts, vec!["tags".to_string()]);
        assert_eq!(state.pending_ops.len(), 2);
        assert_eq!(
            state.pending_ops[0]["tags"],
            Operation::add(vec![Value::from("a")])
        );
        assert_eq!(state.pending_ops[0]["n"], Operation::set(1));
        assert_eq!(
            state.pending_ops[1]["tags"],
            Operation::remove(vec![Value::from("a")])
        );
        assert!(!state.pending_ops[1].contains_key("n"));

        let attrs = state.estimate_attributes(&owner()).unwrap();
        assert_eq!(attrs["tags"], Value::Array(vec![]));
    }

    #[test]
    fn pending_op_that_cannot_apply_is_rejected() {
        let mut state = ObjectState::new();
        let mut changes = BTreeMap::new();
        changes.insert("title".to_string(), Some(Value::from("x")));
        state.commit_server_changes(changes);

        assert!(matches!(
            state.set_pending_op(&owner(), "title", Operation::increment(1)),
            Err(crate::Error::TypeMismatch { .. })
        ));
        assert!(state.pending_ops[0].is_empty());
        assert_eq!(
            state.estimate_attributes(&owner()).unwrap()["title"],
            Value::from("x")
        );

        // Edits in older layers count too.
        state.set_pending_op(&owner(), "n", Operation::set("text")).unwrap();
        state.push_layer();
        assert!(state
            .set_pending_op(&owner(), "n", Operation::increment(1))
            .is_err());
        assert!(state.pending_ops[1].is_empty());
    }

    #[test]
    fn commit_server_changes_updates_and_removes() {
        let mut state = ObjectState::new();
        state.server_data.insert("gone".into(), Value::from(1));

        let mut changes = BTreeMap::new();
        changes.insert("title".to_string(), Some(Value::from("Hi")));
        changes.insert("gone".to_string(), None);
        state.commit_server_changes(changes);

        assert_eq!(state.server_data["title"], Value::from("Hi"));
        assert!(!state.server_data.contains_key("gone"));
    }

    #[test]
    fn saved_layer_commits_unechoed_fields_from_ops() {
        let mut state = ObjectState::new();
        state.server_data.insert("count".into(), Value::from(2));
        state.set_pending_op(&owner(), "count", Operation::increment(3)).unwrap();
        state.set_pending_op(&owner(), "title", Operation::set("Hi")).unwrap();
        state.push_layer();
        let layer = state.pop_front_layer();

        let mut response = BTreeMap::new();
        response.insert("title".to_string(), Some(Value::from("Hi!")));
        state.commit_saved_layer(&owner(), &layer, response).unwrap();

        assert_eq!(state.server_data["count"], Value::from(5));
        assert_eq!(state.server_data["title"], Value::from("Hi!"));
    }

    #[test]
    fn saved_layer_merges_response_objects() {
        let mut state = ObjectState::new();
        let mut acl = BTreeMap::new();
        acl.insert("*".to_string(), Value::from("read"));
        state.server_data.insert("meta".into(), Value::Object(acl));

        let mut incoming = BTreeMap::new();
        incoming.insert("owner".to_string(), Value::from("u1"));
        let mut response = BTreeMap::new();
        response.insert("meta".to_string(), Some(Value::Object(incoming)));
        response.insert("gone".to_string(), None);
        state
            .commit_saved_layer(&owner(), &OpsLayer::new(), response)
            .unwrap();

        let Value::Object(meta) = &state.server_data["meta"] else {
            panic!("expected object");
        };
        assert_eq!(meta.len(), 2);
        assert!(!state.server_data.contains_key("gone"));
    }

    #[test]
    fn echoed_object_replaces_keys_dropped_by_the_saved_set() {
        let mut state = ObjectState::new();
        let mut old_meta = BTreeMap::new();
        old_meta.insert("a".to_string(), Value::from(1));
        state.server_data.insert("meta".into(), Value::Object(old_meta));

        let mut new_meta = BTreeMap::new();
        new_meta.insert("b".to_string(), Value::from(2));
        state
            .set_pending_op(&owner(), "meta", Operation::set(Value::Object(new_meta.clone())))
            .unwrap();
        state.push_layer();
        let layer = state.pop_front_layer();

        let mut response = BTreeMap::new();
        response.insert("meta".to_string(), Some(Value::Object(new_meta.clone())));
        state.commit_saved_layer(&owner(), &layer, response).unwrap();

        assert_eq!(state.server_data["meta"], Value::Object(new_meta));
    }

    #[test]
    fn saved_relation_edit_binds_handle() {
        let mut state = ObjectState::new();
        let tag = crate::Record::with_id("Tag", "t1");
        state
            .set_pending_op(&owner(), "tags", Operation::add_relation(&[tag]).unwrap())
            .unwrap();
        let layer = state.pop_front_layer();
        state
            .commit_saved_layer(&owner(), &layer, BTreeMap::new())
            .unwrap();

        let Value::Relation(relation) = &state.server_data["tags"] else {
            panic!("expected relation");
        };
        assert_eq!(relation.owner.as_ref(), Some(&owner()));
        assert_eq!(relation.target_class_name.as_deref(), Some("Tag"));
    }

    #[test]
    fn dot_notation_ops_apply_to_nested_objects() {
        let mut state = ObjectState::new();
        let mut profile = BTreeMap::new();
        profile.insert("age".to_string(), Value::from(30));
        state.server_data.insert("profile".into(), Value::Object(profile));
        state
            .set_pending_op(&owner(), "profile.age", Operation::increment(1))
            .unwrap();

        let attrs = state.estimate_attributes(&owner()).unwrap();
        assert_eq!(
            value::get_path(&attrs, "profile.age"),
            Some(&Value::from(31))
        );
    }

    #[test]
    fn in_place_container_edit_is_dirty() {
        let mut state = ObjectState::new();
        let mut changes = BTreeMap::new();
        changes.insert("tags".to_string(), Some(Value::from(vec!["a"])));
        state.commit_server_changes(changes);
        assert!(state.dirty_container_fields(&owner()).unwrap().is_empty());

        if let Some(Value::Array(items)) = state.server_data.get_mut("tags") {
            items.push(Value::from("b"));
        }
        let dirty = state.dirty_container_fields(&owner()).unwrap();
        assert!(dirty.contains("tags"));
    }

    #[test]
    fn container_changed_back_is_not_dirty() {
        let mut state = ObjectState::new();
        let mut changes = BTreeMap::new();
        changes.insert("tags".to_string(), Some(Value::from(vec!["a"])));
        state.commit_server_changes(changes);

        if let Some(Value::Array(items)) = state.server_data.get_mut("tags") {
            items.push(Value::from("b"));
            items.pop();
        }
        // Same serialization as the cache: the heuristic cannot tell.
        assert!(state.dirty_container_fields(&owner()).unwrap().is_empty());
    }

    #[test]
    fn containers_with_pending_ops_are_not_reported() {
        let mut state = ObjectState::new();
        state
            .set_pending_op(&owner(), "tags", Operation::add(vec![Value::from("a")]))
            .unwrap();
        assert!(state.dirty_container_fields(&owner()).unwrap().is_empty());
    }
}

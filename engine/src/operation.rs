//! Field-level operations.
//!
//! Every local mutation of a record attribute is expressed as an
//! [`Operation`]. Operations are applied on top of the last known server value
//! to estimate what the application should observe, and two pending operations
//! on the same field compose into one with [`Operation::merge_with`].
//!
//! Composition is last-writer based and purely local: the newer operation
//! absorbs the older one, so the result depends on arrival order.

use crate::{error::Result, ClassName, Error, Identity, ObjectId, Record, Relation, Value};
use std::collections::BTreeSet;

/// A pending relation membership change.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RelationEdit {
    pub adds: BTreeSet<ObjectId>,
    pub removes: BTreeSet<ObjectId>,
    pub target_class_name: Option<ClassName>,
}

impl RelationEdit {
    /// Build an edit from record handles. Every record must already have a
    /// server id and all of them must share one class.
    pub fn new(adds: &[Record], removes: &[Record]) -> Result<Self> {
        let mut edit = RelationEdit::default();
        for (records, into_adds) in [(adds, true), (removes, false)] {
            for record in records {
                let id = record.id().ok_or_else(|| Error::UnsavedPointer {
                    class_name: record.class_name().to_string(),
                })?;
                match &edit.target_class_name {
                    Some(target) if target != record.class_name() => {
                        return Err(Error::RelationTargetMismatch {
                            expected: target.clone(),
                            found: record.class_name().to_string(),
                        });
                    }
                    Some(_) => {}
                    None => edit.target_class_name = Some(record.class_name().to_string()),
                }
                if into_adds {
                    edit.adds.insert(id);
                } else {
                    edit.removes.insert(id);
                }
            }
        }
        Ok(edit)
    }

    fn agreed_target(&self, other: &RelationEdit) -> Result<Option<ClassName>> {
        match (&self.target_class_name, &other.target_class_name) {
            (Some(a), Some(b)) if a != b => Err(Error::RelationTargetMismatch {
                expected: b.clone(),
                found: a.clone(),
            }),
            (Some(a), _) => Ok(Some(a.clone())),
            (None, b) => Ok(b.clone()),
        }
    }

    fn apply(
        &self,
        current: Option<&Value>,
        owner: Option<&Identity>,
        key: Option<&str>,
    ) -> Result<Value> {
        match current {
            None => Ok(Value::Relation(Relation {
                owner: owner.cloned(),
                key: key.map(str::to_string),
                target_class_name: self.target_class_name.clone(),
            })),
            Some(Value::Relation(existing)) => {
                let mut relation = existing.clone();
                match (&relation.target_class_name, &self.target_class_name) {
                    (Some(expected), Some(found)) if expected != found => {
                        return Err(Error::RelationTargetMismatch {
                            expected: expected.clone(),
                            found: found.clone(),
                        });
                    }
                    (None, Some(target)) => relation.target_class_name = Some(target.clone()),
                    _ => {}
                }
                Ok(Value::Relation(relation))
            }
            Some(other) => Err(Error::TypeMismatch {
                op: "RelationEdit",
                found: other.kind(),
            }),
        }
    }
}

/// One pending mutation of a single field.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Set(Value),
    Unset,
    Increment(f64),
    Add(Vec<Value>),
    /// Items are kept deduplicated; see [`Operation::add_unique`]
    AddUnique(Vec<Value>),
    /// Items are kept deduplicated; see [`Operation::remove`]
    Remove(Vec<Value>),
    RelationEdit(RelationEdit),
}

impl Operation {
    pub fn set(value: impl Into<Value>) -> Self {
        Operation::Set(value.into())
    }

    pub fn increment(amount: impl Into<f64>) -> Self {
        Operation::Increment(amount.into())
    }

    pub fn add(items: Vec<Value>) -> Self {
        Operation::Add(items)
    }

    pub fn add_unique(items: Vec<Value>) -> Self {
        Operation::AddUnique(dedupe(Vec::new(), items))
    }

    pub fn remove(items: Vec<Value>) -> Self {
        Operation::Remove(dedupe(Vec::new(), items))
    }

    pub fn add_relation(records: &[Record]) -> Result<Self> {
        RelationEdit::new(records, &[]).map(Operation::RelationEdit)
    }

    pub fn remove_relation(records: &[Record]) -> Result<Self> {
        RelationEdit::new(&[], records).map(Operation::RelationEdit)
    }

    /// Variant name, as used in error messages.
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Set(_) => "Set",
            Operation::Unset => "Unset",
            Operation::Increment(_) => "Increment",
            Operation::Add(_) => "Add",
            Operation::AddUnique(_) => "AddUnique",
            Operation::Remove(_) => "Remove",
            Operation::RelationEdit(_) => "RelationEdit",
        }
    }

    /// Apply this operation to the current value of `key` on `owner`.
    ///
    /// `None` means the field has no value; a `None` result removes it.
    pub fn apply_to(
        &self,
        current: Option<&Value>,
        owner: &Identity,
        key: &str,
    ) -> Result<Option<Value>> {
        match self {
            Operation::RelationEdit(edit) => edit.apply(current, Some(owner), Some(key)).map(Some),
            _ => self.apply_detached(current),
        }
    }

    /// Apply without a field context. Relation handles created this way are
    /// not bound to an owner.
    pub fn apply_detached(&self, current: Option<&Value>) -> Result<Option<Value>> {
        let mismatch = |found: &Value| Error::TypeMismatch {
            op: self.name(),
            found: found.kind(),
        };
        match self {
            Operation::Set(value) => Ok(Some(value.clone())),
            Operation::Unset => Ok(None),
            Operation::Increment(amount) => match current {
                None => Ok(Some(Value::Number(*amount))),
                Some(Value::Number(n)) => Ok(Some(Value::Number(n + amount))),
                Some(other) => Err(mismatch(other)),
            },
            Operation::Add(items) => match current {
                None => Ok(Some(Value::Array(items.clone()))),
                Some(Value::Array(existing)) => {
                    let mut combined = existing.clone();
                    combined.extend(items.iter().cloned());
                    Ok(Some(Value::Array(combined)))
                }
                Some(other) => Err(mismatch(other)),
            },
            Operation::AddUnique(items) => match current {
                None => Ok(Some(Value::Array(items.clone()))),
                Some(Value::Array(existing)) => Ok(Some(Value::Array(dedupe(
                    existing.clone(),
                    items.iter().cloned(),
                )))),
                Some(other) => Err(mismatch(other)),
            },
            Operation::Remove(items) => match current {
                None => Ok(Some(Value::Array(Vec::new()))),
                Some(Value::Array(existing)) => Ok(Some(Value::Array(
                    existing
                        .iter()
                        .filter(|value| !items.contains(value))
                        .cloned()
                        .collect(),
                ))),
                Some(other) => Err(mismatch(other)),
            },
            Operation::RelationEdit(edit) => edit.apply(current, None, None).map(Some),
        }
    }

    /// Compose this (newer) operation with the `older` pending operation on
    /// the same field into a single operation.
    pub fn merge_with(&self, older: Option<&Operation>) -> Result<Operation> {
        let Some(older) = older else {
            return Ok(self.clone());
        };
        let incompatible = || Error::IncompatibleMerge {
            newer: self.name(),
            older: older.name(),
        };

        match (self, older) {
            (Operation::Set(_), _) | (Operation::Unset, _) => Ok(self.clone()),

            (Operation::RelationEdit(newer), Operation::RelationEdit(prev)) => {
                let target_class_name = newer.agreed_target(prev)?;
                let adds = prev
                    .adds
                    .difference(&newer.removes)
                    .chain(newer.adds.iter())
                    .cloned()
                    .collect();
                let removes = prev
                    .removes
                    .difference(&newer.adds)
                    .chain(newer.removes.iter())
                    .cloned()
                    .collect();
                Ok(Operation::RelationEdit(RelationEdit {
                    adds,
                    removes,
                    target_class_name,
                }))
            }
            (Operation::RelationEdit(_), Operation::Unset) => {
                Err(Error::CannotModifyDeletedRelation)
            }
            (Operation::RelationEdit(_), _) => Err(incompatible()),

            (_, Operation::Set(value)) => {
                let merged = self.apply_detached(Some(value))?;
                Ok(merged.map(Operation::Set).unwrap_or(Operation::Unset))
            }

            (Operation::Increment(amount), Operation::Unset) => {
                Ok(Operation::Set(Value::Number(*amount)))
            }
            (Operation::Increment(amount), Operation::Increment(prev)) => {
                Ok(Operation::Increment(amount + prev))
            }

            (Operation::Add(items), Operation::Unset)
            | (Operation::AddUnique(items), Operation::Unset) => {
                Ok(Operation::Set(Value::Array(items.clone())))
            }
            (Operation::Add(items), Operation::Add(prev)) => {
                let mut combined = prev.clone();
                combined.extend(items.iter().cloned());
                Ok(Operation::Add(combined))
            }
            (Operation::AddUnique(items), Operation::AddUnique(prev)) => Ok(Operation::AddUnique(
                dedupe(prev.clone(), items.iter().cloned()),
            )),

            (Operation::Remove(_), Operation::Unset) => Ok(Operation::Unset),
            (Operation::Remove(items), Operation::Remove(prev)) => Ok(Operation::Remove(dedupe(
                prev.clone(),
                items.iter().cloned(),
            ))),

            _ => Err(incompatible()),
        }
    }
}

/// Append every item of `items` not already present in `base`, preserving order.
fn dedupe(mut base: Vec<Value>, items: impl IntoIterator<Item = Value>) -> Vec<Value> {
    for item in items {
        if !base.contains(&item) {
            base.push(item);
        }
    }
    base
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ObjectKey;

    fn owner() -> Identity {
        Identity::new("Post", ObjectKey::Id("p1".into()))
    }

    fn strings(items: &[&str]) -> Vec<Value> {
        items.iter().map(|s| Value::from(*s)).collect()
    }

    #[test]
    fn set_and_unset() {
        let current = Value::from(1);
        assert_eq!(
            Operation::set("x").apply_detached(Some(&current)).unwrap(),
            Some(Value::from("x"))
        );
        assert_eq!(Operation::Unset.apply_detached(Some(&current)).unwrap(), None);
    }

    #[test]
    fn increment() {
        let op = Operation::increment(3);
        assert_eq!(op.apply_detached(None).unwrap(), Some(Value::from(3)));
        assert_eq!(
            op.apply_detached(Some(&Value::from(5))).unwrap(),
            Some(Value::from(8))
        );
        assert_eq!(
            op.apply_detached(Some(&Value::from("five"))),
            Err(Error::TypeMismatch {
                op: "Increment",
                found: "string"
            })
        );
    }

    #[test]
    fn add_and_add_unique() {
        let current = Value::from(vec!["a", "b"]);
        assert_eq!(
            Operation::add(strings(&["b", "c"]))
                .apply_detached(Some(&current))
                .unwrap(),
            Some(Value::from(vec!["a", "b", "b", "c"]))
        );
        assert_eq!(
            Operation::add_unique(strings(&["b", "c"]))
                .apply_detached(Some(&current))
                .unwrap(),
            Some(Value::from(vec!["a", "b", "c"]))
        );
        assert!(Operation::add(strings(&["a"]))
            .apply_detached(Some(&Value::from(1)))
            .is_err());
    }

    #[test]
    fn add_unique_deduplicates_on_construction() {
        assert_eq!(
            Operation::add_unique(strings(&["a", "a", "b"])),
            Operation::AddUnique(strings(&["a", "b"]))
        );
    }

    #[test]
    fn add_unique_matches_pointers_by_identity() {
        let current = Value::Array(vec![Value::Pointer(Record::with_id("Tag", "t1"))]);
        let op = Operation::add_unique(vec![
            Value::Pointer(Record::with_id("Tag", "t1")),
            Value::Pointer(Record::with_id("Tag", "t2")),
        ]);
        let result = op.apply_detached(Some(&current)).unwrap().unwrap();
        assert_eq!(result.as_array().unwrap().len(), 2);
    }

    #[test]
    fn remove() {
        let current = Value::from(vec!["a", "b", "a", "c"]);
        assert_eq!(
            Operation::remove(strings(&["a"]))
                .apply_detached(Some(&current))
                .unwrap(),
            Some(Value::from(vec!["b", "c"]))
        );
        assert_eq!(
            Operation::remove(strings(&["a"])).apply_detached(None).unwrap(),
            Some(Value::Array(vec![]))
        );
    }

    #[test]
    fn remove_matches_pointers_by_identity() {
        let current = Value::Array(vec![
            Value::Pointer(Record::with_id("Tag", "t1")),
            Value::Pointer(Record::with_id("Tag", "t2")),
        ]);
        let op = Operation::remove(vec![Value::Pointer(Record::with_id("Tag", "t1"))]);
        let result = op.apply_detached(Some(&current)).unwrap().unwrap();
        assert_eq!(
            result,
            Value::Array(vec![Value::Pointer(Record::with_id("Tag", "t2"))])
        );
    }

    #[test]
    fn relation_apply_creates_bound_handle() {
        let op = Operation::add_relation(&[Record::with_id("Tag", "t1")]).unwrap();
        let value = op.apply_to(None, &owner(), "tags").unwrap().unwrap();
        assert_eq!(
            value,
            Value::Relation(Relation::new(owner(), "tags").with_target("Tag"))
        );

        // Reapplying to the handle keeps it unchanged.
        assert_eq!(
            op.apply_to(Some(&value), &owner(), "tags").unwrap(),
            Some(value)
        );
    }

    #[test]
    fn relation_apply_rejects_other_target() {
        let existing = Value::Relation(Relation::new(owner(), "tags").with_target("Tag"));
        let op = Operation::add_relation(&[Record::with_id("User", "u1")]).unwrap();
        assert_eq!(
            op.apply_to(Some(&existing), &owner(), "tags"),
            Err(Error::RelationTargetMismatch {
                expected: "Tag".into(),
                found: "User".into()
            })
        );
        assert!(op.apply_to(Some(&Value::from(1)), &owner(), "tags").is_err());
    }

    #[test]
    fn relation_requires_saved_records_of_one_class() {
        assert!(matches!(
            Operation::add_relation(&[Record::new("Tag")]),
            Err(Error::UnsavedPointer { .. })
        ));
        assert!(matches!(
            Operation::add_relation(&[Record::with_id("Tag", "1"), Record::with_id("User", "2")]),
            Err(Error::RelationTargetMismatch { .. })
        ));
    }

    #[test]
    fn merge_without_older_is_identity() {
        let op = Operation::increment(2);
        assert_eq!(op.merge_with(None).unwrap(), op);
    }

    #[test]
    fn merge_set_then_increment() {
        let merged = Operation::increment(3)
            .merge_with(Some(&Operation::set(5)))
            .unwrap();
        assert_eq!(merged, Operation::Set(Value::from(8)));
    }

    #[test]
    fn merge_increment_table() {
        assert_eq!(
            Operation::increment(3)
                .merge_with(Some(&Operation::Unset))
                .unwrap(),
            Operation::Set(Value::from(3))
        );
        assert_eq!(
            Operation::increment(3)
                .merge_with(Some(&Operation::increment(4)))
                .unwrap(),
            Operation::Increment(7.0)
        );
        assert!(matches!(
            Operation::increment(3).merge_with(Some(&Operation::add(vec![]))),
            Err(Error::IncompatibleMerge { .. })
        ));
        assert!(matches!(
            Operation::increment(3).merge_with(Some(&Operation::set("x"))),
            Err(Error::TypeMismatch { .. })
        ));
    }

    #[test]
    fn merge_add_unique_scenario() {
        let older = Operation::add_unique(strings(&["a", "b"]));
        let newer = Operation::add_unique(strings(&["b", "c"]));
        assert_eq!(
            newer.merge_with(Some(&older)).unwrap(),
            Operation::AddUnique(strings(&["a", "b", "c"]))
        );
    }

    #[test]
    fn merge_list_ops() {
        assert_eq!(
            Operation::add(strings(&["b"]))
                .merge_with(Some(&Operation::add(strings(&["a"]))))
                .unwrap(),
            Operation::Add(strings(&["a", "b"]))
        );
        assert_eq!(
            Operation::add(strings(&["b"]))
                .merge_with(Some(&Operation::set(vec!["a"])))
                .unwrap(),
            Operation::Set(Value::from(vec!["a", "b"]))
        );
        assert_eq!(
            Operation::remove(strings(&["a"]))
                .merge_with(Some(&Operation::Unset))
                .unwrap(),
            Operation::Unset
        );
        assert_eq!(
            Operation::remove(strings(&["b"]))
                .merge_with(Some(&Operation::remove(strings(&["a", "b"]))))
                .unwrap(),
            Operation::Remove(strings(&["a", "b"]))
        );
        assert!(Operation::add(strings(&["a"]))
            .merge_with(Some(&Operation::remove(strings(&["a"]))))
            .is_err());
        assert!(Operation::add_unique(strings(&["a"]))
            .merge_with(Some(&Operation::add(strings(&["a"]))))
            .is_err());
    }

    #[test]
    fn merge_set_and_unset_always_win() {
        let older = Operation::add_relation(&[Record::with_id("Tag", "t1")]).unwrap();
        assert_eq!(
            Operation::set(1).merge_with(Some(&older)).unwrap(),
            Operation::set(1)
        );
        assert_eq!(
            Operation::Unset.merge_with(Some(&older)).unwrap(),
            Operation::Unset
        );
    }

    #[test]
    fn merge_relation_edits() {
        let t1 = Record::with_id("Tag", "t1");
        let t2 = Record::with_id("Tag", "t2");
        let t3 = Record::with_id("Tag", "t3");

        let older = Operation::RelationEdit(
            RelationEdit::new(&[t1.clone(), t2], &[t3.clone()]).unwrap(),
        );
        let newer = Operation::RelationEdit(RelationEdit::new(&[t3], &[t1]).unwrap());

        let Operation::RelationEdit(merged) = newer.merge_with(Some(&older)).unwrap() else {
            panic!("expected a relation edit");
        };
        let ids = |set: &BTreeSet<String>| set.iter().cloned().collect::<Vec<_>>();
        assert_eq!(ids(&merged.adds), vec!["t2", "t3"]);
        assert_eq!(ids(&merged.removes), vec!["t1"]);
        assert_eq!(merged.target_class_name.as_deref(), Some("Tag"));
    }

    #[test]
    fn merge_relation_failures() {
        let edit = Operation::add_relation(&[Record::with_id("Tag", "t1")]).unwrap();
        assert_eq!(
            edit.merge_with(Some(&Operation::Unset)),
            Err(Error::CannotModifyDeletedRelation)
        );
        assert!(matches!(
            edit.merge_with(Some(&Operation::set(1))),
            Err(Error::IncompatibleMerge { .. })
        ));
        let other = Operation::add_relation(&[Record::with_id("User", "u1")]).unwrap();
        assert!(matches!(
            edit.merge_with(Some(&other)),
            Err(Error::RelationTargetMismatch { .. })
        ));
    }

    // Property-based tests using proptest
    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        fn arb_item() -> impl Strategy<Value = Value> {
            prop_oneof![
                "[a-d]".prop_map(Value::String),
                (0i32..4).prop_map(Value::from),
            ]
        }

        fn arb_items() -> impl Strategy<Value = Vec<Value>> {
            prop::collection::vec(arb_item(), 0..4)
        }

        fn arb_op() -> impl Strategy<Value = Operation> {
            prop_oneof![
                (-5i32..5).prop_map(|n| Operation::set(n)),
                arb_items().prop_map(|items| Operation::Set(Value::Array(items))),
                Just(Operation::Unset),
                (-5i32..5).prop_map(|n| Operation::increment(n)),
                arb_items().prop_map(Operation::add),
                arb_items().prop_map(Operation::add_unique),
                arb_items().prop_map(Operation::remove),
            ]
        }

        fn arb_current() -> impl Strategy<Value = Option<Value>> {
            prop_oneof![
                Just(None),
                (-5i32..5).prop_map(|n| Some(Value::from(n))),
                arb_items().prop_map(|items| Some(Value::Array(items))),
            ]
        }

        proptest! {
            #[test]
            fn prop_merge_then_apply_equals_apply_then_apply(
                older in arb_op(),
                newer in arb_op(),
                current in arb_current(),
            ) {
                // Remove over Unset keeps the field deleted instead of
                // materialising an empty list.
                prop_assume!(!matches!((&newer, &older), (Operation::Remove(_), Operation::Unset)));
                if let Ok(merged) = newer.merge_with(Some(&older)) {
                    if let Ok(step) = older.apply_detached(current.as_ref()) {
                        if let Ok(sequential) = newer.apply_detached(step.as_ref()) {
                            let combined = merged.apply_detached(current.as_ref()).unwrap();
                            prop_assert_eq!(combined, sequential);
                        }
                    }
                }
            }

            #[test]
            fn prop_unset_always_clears(older in arb_op(), current in arb_current()) {
                let merged = Operation::Unset.merge_with(Some(&older)).unwrap();
                prop_assert_eq!(merged.apply_detached(current.as_ref()).unwrap(), None);
            }
        }
    }
}

//! Discovery of unsaved dependencies.

use crate::error::Result;
use std::collections::HashSet;
use std::sync::Arc;
use tether_engine::{FileRef, Identity, ObjectStateStore, Record, Value};

/// Something that has to be persisted before a record pointing at it.
#[derive(Debug, Clone)]
pub enum Unsaved {
    Record(Record),
    File(FileRef),
}

/// Finds unsaved records and files reachable from a record.
pub trait DependencyScanner: Send + Sync {
    /// Dirty records and unuploaded files reachable from `root`'s
    /// attributes, in discovery order, files last. `root` itself is never
    /// included.
    ///
    /// Without `deep`, only records referenced directly by `root` may lack
    /// an id; an unsaved record found further down fails with
    /// [`UnsavedPointer`](tether_engine::Error::UnsavedPointer).
    fn unsaved_children(&self, root: &Record, deep: bool) -> Result<Vec<Unsaved>>;

    /// Whether every pointer and file reachable from `record`'s attributes
    /// is already persisted.
    fn can_be_serialized(&self, record: &Record) -> Result<bool>;
}

/// Default scanner walking estimated attributes in an [`ObjectStateStore`].
#[derive(Debug, Clone)]
pub struct AttributeScanner {
    store: Arc<ObjectStateStore>,
}

#[derive(Default)]
struct Encountered {
    seen: HashSet<Identity>,
    records: Vec<Record>,
    files: Vec<FileRef>,
}

impl AttributeScanner {
    pub fn new(store: Arc<ObjectStateStore>) -> Self {
        Self { store }
    }

    fn visit_record(
        &self,
        record: &Record,
        found: &mut Encountered,
        must_be_saved: bool,
        deep: bool,
    ) -> Result<()> {
        if must_be_saved && record.is_new() {
            return Err(tether_engine::Error::UnsavedPointer {
                class_name: record.class_name().to_string(),
            }
            .into());
        }
        if !found.seen.insert(self.store.identity_of(record)) {
            return Ok(());
        }
        if self.store.is_dirty(record)? {
            found.records.push(record.clone());
        }
        for value in self.store.estimate_attributes(&self.store.identity_of(record))?.values() {
            self.visit_value(value, found, !deep, deep)?;
        }
        Ok(())
    }

    fn visit_value(
        &self,
        value: &Value,
        found: &mut Encountered,
        must_be_saved: bool,
        deep: bool,
    ) -> Result<()> {
        match value {
            Value::Pointer(record) => self.visit_record(record, found, must_be_saved, deep),
            Value::File(file) => {
                if file.url().is_none() && !found.files.iter().any(|f| f.same_handle(file)) {
                    found.files.push(file.clone());
                }
                Ok(())
            }
            Value::Array(items) => items
                .iter()
                .try_for_each(|item| self.visit_value(item, found, must_be_saved, deep)),
            Value::Object(map) => map
                .values()
                .try_for_each(|item| self.visit_value(item, found, must_be_saved, deep)),
            _ => Ok(()),
        }
    }
}

fn is_persisted(value: &Value) -> bool {
    match value {
        Value::Pointer(record) => !record.is_new(),
        Value::File(file) => file.url().is_some(),
        Value::Array(items) => items.iter().all(is_persisted),
        Value::Object(map) => map.values().all(is_persisted),
        _ => true,
    }
}

impl DependencyScanner for AttributeScanner {
    fn unsaved_children(&self, root: &Record, deep: bool) -> Result<Vec<Unsaved>> {
        let mut found = Encountered::default();
        found.seen.insert(self.store.identity_of(root));
        for value in self.store.estimate_attributes(&self.store.identity_of(root))?.values() {
            self.visit_value(value, &mut found, false, deep)?;
        }

        Ok(found
            .records
            .into_iter()
            .map(Unsaved::Record)
            .chain(found.files.into_iter().map(Unsaved::File))
            .collect())
    }

    fn can_be_serialized(&self, record: &Record) -> Result<bool> {
        let attributes = self.store.estimate_attributes(&self.store.identity_of(record))?;
        Ok(attributes.values().all(is_persisted))
    }
}

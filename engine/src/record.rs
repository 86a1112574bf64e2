//! Record handles and identities.
//!
//! A [`Record`] is a cheap, clonable handle to one logical remote record. All
//! of its attribute state lives in an [`ObjectStateStore`](crate::ObjectStateStore);
//! the handle only carries what is needed to locate that state: the class
//! name, a locally generated id and, once the server has assigned one, the
//! permanent object id.

use crate::{ClassName, ObjectId};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// How record handles map onto stored object state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityPolicy {
    /// One state per `(class, id)`; every handle to the same server record
    /// observes the same state.
    #[default]
    Shared,
    /// One state per handle instance.
    Isolated,
}

impl FromStr for IdentityPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "shared" => Ok(IdentityPolicy::Shared),
            "isolated" => Ok(IdentityPolicy::Isolated),
            other => Err(format!("unknown identity policy '{other}'")),
        }
    }
}

/// The id half of an [`Identity`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum ObjectKey {
    /// Server-assigned object id
    Id(ObjectId),
    /// Locally generated stand-in
    Local(ObjectId),
}

/// Key used to locate a record's state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub class_name: ClassName,
    pub key: ObjectKey,
}

impl Identity {
    pub fn new(class_name: impl Into<ClassName>, key: ObjectKey) -> Self {
        Self {
            class_name: class_name.into(),
            key,
        }
    }

    /// Whether this identity is still keyed by a local id.
    pub fn is_local(&self) -> bool {
        matches!(self.key, ObjectKey::Local(_))
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.key {
            ObjectKey::Id(id) => write!(f, "{}:{}", self.class_name, id),
            ObjectKey::Local(id) => write!(f, "{}:~{}", self.class_name, id),
        }
    }
}

/// Generate a fresh local id.
pub fn generate_local_id() -> ObjectId {
    format!("local{}", uuid::Uuid::new_v4().simple())
}

struct RecordInner {
    class_name: ClassName,
    local_id: ObjectId,
    id: RwLock<Option<ObjectId>>,
}

/// Handle to a remote record.
///
/// Clones share the same underlying handle, so an id assigned through one
/// clone is visible through all of them.
#[derive(Clone)]
pub struct Record {
    inner: Arc<RecordInner>,
}

impl Record {
    /// Create a handle for a record the server does not know about yet.
    pub fn new(class_name: impl Into<ClassName>) -> Self {
        Self::build(class_name.into(), None)
    }

    /// Create a handle for an existing server record.
    pub fn with_id(class_name: impl Into<ClassName>, id: impl Into<ObjectId>) -> Self {
        Self::build(class_name.into(), Some(id.into()))
    }

    /// Recreate a handle with a known local id, as persisted in a snapshot.
    pub fn restore(
        class_name: impl Into<ClassName>,
        id: Option<ObjectId>,
        local_id: impl Into<ObjectId>,
    ) -> Self {
        Self {
            inner: Arc::new(RecordInner {
                class_name: class_name.into(),
                local_id: local_id.into(),
                id: RwLock::new(id),
            }),
        }
    }

    fn build(class_name: ClassName, id: Option<ObjectId>) -> Self {
        Self::restore(class_name, id, generate_local_id())
    }

    pub fn class_name(&self) -> &str {
        &self.inner.class_name
    }

    /// The server-assigned id, if any.
    pub fn id(&self) -> Option<ObjectId> {
        self.inner.id.read().clone()
    }

    pub fn local_id(&self) -> &str {
        &self.inner.local_id
    }

    /// Whether the server has not assigned an id yet.
    pub fn is_new(&self) -> bool {
        self.inner.id.read().is_none()
    }

    /// Record the server-assigned id. Callers must migrate the stored state
    /// to the new identity afterwards.
    pub fn assign_id(&self, id: impl Into<ObjectId>) {
        *self.inner.id.write() = Some(id.into());
    }

    /// The identity this handle maps to under `policy`.
    pub fn identity(&self, policy: IdentityPolicy) -> Identity {
        let key = match (policy, self.id()) {
            (IdentityPolicy::Shared, Some(id)) => ObjectKey::Id(id),
            _ => ObjectKey::Local(self.inner.local_id.clone()),
        };
        Identity::new(self.inner.class_name.clone(), key)
    }

    /// Whether both values are clones of the same handle.
    pub fn same_handle(&self, other: &Record) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Pointer equality: same class and same server id, or the same local id
/// while either side is unsaved.
impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        if self.class_name() != other.class_name() {
            return false;
        }
        match (self.id(), other.id()) {
            (Some(a), Some(b)) => a == b,
            _ => self.local_id() == other.local_id(),
        }
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Record")
            .field("class_name", &self.inner.class_name)
            .field("id", &self.id())
            .field("local_id", &self.inner.local_id)
            .finish()
    }
}

struct FileInner {
    name: String,
    url: RwLock<Option<String>>,
}

/// Handle to a binary file attached to a record.
#[derive(Clone)]
pub struct FileRef {
    inner: Arc<FileInner>,
}

impl FileRef {
    /// A file that still has to be uploaded.
    pub fn new(name: impl Into<String>) -> Self {
        Self::build(name.into(), None)
    }

    /// A file that already lives at `url`.
    pub fn uploaded(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self::build(name.into(), Some(url.into()))
    }

    fn build(name: String, url: Option<String>) -> Self {
        Self {
            inner: Arc::new(FileInner {
                name,
                url: RwLock::new(url),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn url(&self) -> Option<String> {
        self.inner.url.read().clone()
    }

    pub fn set_url(&self, url: impl Into<String>) {
        *self.inner.url.write() = Some(url.into());
    }

    pub fn same_handle(&self, other: &FileRef) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl PartialEq for FileRef {
    fn eq(&self, other: &Self) -> bool {
        if self.same_handle(other) {
            return true;
        }
        match (self.url(), other.url()) {
            (Some(a), Some(b)) => a == b && self.name() == other.name(),
            _ => false,
        }
    }
}

impl fmt::Debug for FileRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileRef")
            .field("name", &self.inner.name)
            .field("url", &self.url())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_record_has_local_identity() {
        let record = Record::new("Post");
        assert!(record.is_new());
        assert!(record.local_id().starts_with("local"));

        let identity = record.identity(IdentityPolicy::Shared);
        assert!(identity.is_local());
        assert_eq!(identity.class_name, "Post");
    }

    #[test]
    fn shared_policy_keys_by_server_id() {
        let a = Record::with_id("Post", "abc");
        let b = Record::with_id("Post", "abc");

        assert_eq!(
            a.identity(IdentityPolicy::Shared),
            b.identity(IdentityPolicy::Shared)
        );
        assert_ne!(
            a.identity(IdentityPolicy::Isolated),
            b.identity(IdentityPolicy::Isolated)
        );
    }

    #[test]
    fn assign_id_is_visible_through_clones() {
        let record = Record::new("Post");
        let clone = record.clone();
        record.assign_id("xyz");

        assert_eq!(clone.id().as_deref(), Some("xyz"));
        assert_eq!(
            clone.identity(IdentityPolicy::Shared).key,
            ObjectKey::Id("xyz".into())
        );
        // Isolated identities never change.
        assert!(clone.identity(IdentityPolicy::Isolated).is_local());
    }

    #[test]
    fn pointer_equality() {
        assert_eq!(Record::with_id("Post", "1"), Record::with_id("Post", "1"));
        assert_ne!(Record::with_id("Post", "1"), Record::with_id("Tag", "1"));
        assert_ne!(Record::new("Post"), Record::new("Post"));

        let unsaved = Record::new("Post");
        assert_eq!(unsaved, unsaved.clone());
    }

    #[test]
    fn identity_display() {
        let id = Identity::new("Post", ObjectKey::Id("abc".into()));
        assert_eq!(id.to_string(), "Post:abc");
        let local = Identity::new("Post", ObjectKey::Local("local1".into()));
        assert_eq!(local.to_string(), "Post:~local1");
    }

    #[test]
    fn policy_from_str() {
        assert_eq!("shared".parse::<IdentityPolicy>(), Ok(IdentityPolicy::Shared));
        assert_eq!("Isolated".parse::<IdentityPolicy>(), Ok(IdentityPolicy::Isolated));
        assert!("other".parse::<IdentityPolicy>().is_err());
    }

    #[test]
    fn file_equality() {
        let pending = FileRef::new("a.png");
        assert_eq!(pending, pending.clone());
        assert_ne!(pending, FileRef::new("a.png"));
        assert_eq!(
            FileRef::uploaded("a.png", "https://files/a.png"),
            FileRef::uploaded("a.png", "https://files/a.png")
        );
    }
}

//! # Tether Engine
//!
//! Client-side object state for remote, server-owned records.
//!
//! This crate holds the synchronous core of tether: how local edits to a
//! record are expressed, composed and layered on top of the last known server
//! snapshot. It performs no IO; the `tether-client` crate drives saves over a
//! transport and feeds results back in.
//!
//! ## Core Concepts
//!
//! ### Records and identities
//!
//! A [`Record`] is a cheap handle to one remote record. Its state lives in an
//! [`ObjectStateStore`] under an [`Identity`], which depends on the store's
//! [`IdentityPolicy`]: with [`IdentityPolicy::Shared`] every handle to the
//! same server record observes one state.
//!
//! ### Operations
//!
//! Every field mutation is an [`Operation`]. Two pending operations on one
//! field compose with [`Operation::merge_with`]; applying them is
//! [`Operation::apply_to`].
//!
//! ### Layers
//!
//! Pending operations are grouped in [`OpsLayer`]s. A save pushes a new layer
//! so edits made while a request is in flight are kept apart from the ones
//! being sent. Success pops the front layer, failure folds it into the next.
//!
//! ### Task queues
//!
//! Each identity owns a [`TaskQueue`] admitting one write at a time in
//! submission order.
//!
//! ## Quick Start
//!
//! ```rust
//! use tether_engine::{IdentityPolicy, ObjectStateStore, Operation, Record, Value};
//!
//! let store = ObjectStateStore::new(IdentityPolicy::Shared);
//! let post = Record::with_id("Post", "p1");
//! let identity = store.identity_of(&post);
//!
//! store.set_pending_op(&identity, "views", Operation::set(5)).unwrap();
//! store.set_pending_op(&identity, "views", Operation::increment(3)).unwrap();
//!
//! let views = store.estimate_attribute(&identity, "views").unwrap();
//! assert_eq!(views, Some(Value::from(8)));
//! ```
//!
//! ## Persistence
//!
//! Use [`export_record`] and [`import_record`] with [`RecordSnapshot`] to move
//! a record's state in and out of whatever storage the application uses.

pub mod codec;
pub mod error;
pub mod operation;
pub mod record;
pub mod snapshot;
pub mod state;
pub mod store;
pub mod task_queue;
pub mod value;

// Re-export main types at crate root
pub use error::Error;
pub use operation::{Operation, RelationEdit};
pub use record::{generate_local_id, FileRef, Identity, IdentityPolicy, ObjectKey, Record};
pub use snapshot::{export_record, import_record, RecordSnapshot, SNAPSHOT_FORMAT_VERSION};
pub use state::{ObjectState, OpsLayer};
pub use store::{ObjectStateStore, SharedState};
pub use task_queue::TaskQueue;
pub use value::{Attributes, Relation, Value};

/// Type aliases for clarity
pub type ClassName = String;
pub type ObjectId = String;

//! # Tether Client
//!
//! Async save, destroy and fetch orchestration on top of `tether-engine`.
//!
//! An [`ObjectController`] turns the pending layers of records into network
//! requests through a [`Transport`]:
//!
//! - a single save writes the front layer of one record, after its unsaved
//!   children;
//! - a batch save walks the pointer graph, uploads files, then saves records
//!   in waves where every record only points at records already saved;
//! - destroys are chunked into batch requests.
//!
//! Writes to one record are serialized through its task queue, so they reach
//! the server in the order they were issued, while different records proceed
//! concurrently.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use tether_client::{mock::MockTransport, ClientConfig, ObjectController, SaveOptions};
//! use tether_engine::{Operation, Record};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> tether_client::Result<()> {
//! let controller = ObjectController::new(ClientConfig::default(), Arc::new(MockTransport::new()));
//!
//! let post = Record::new("Post");
//! controller.set_pending_op(&post, "title", Operation::set("Hello"))?;
//! controller.save(&post, &SaveOptions::default()).await?;
//!
//! assert!(post.id().is_some());
//! # Ok(())
//! # }
//! ```

pub mod barrier;
pub mod config;
pub mod controller;
pub mod error;
pub mod mock;
pub mod payload;
pub mod scanner;
pub mod session;
pub mod transport;

pub use config::{ClientConfig, ConfigError, SaveOptions};
pub use controller::ObjectController;
pub use error::{Error, MemberError, Result, TransportError};
pub use scanner::{AttributeScanner, DependencyScanner, Unsaved};
pub use session::{CurrentSession, NoSession, SessionProvider};
pub use transport::{Method, RequestOptions, Transport};

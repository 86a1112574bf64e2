//! Transport layer abstraction.

use crate::error::TransportError;
use async_trait::async_trait;
use serde_json::Value as Json;
use std::fmt;
use tether_engine::FileRef;

/// HTTP method of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Options attached to every outgoing request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestOptions {
    /// Opaque auth token
    pub session_token: Option<String>,
}

/// Handles network communication with the backend.
///
/// Each call is treated as a single attempt; any retry or timeout policy
/// lives inside the implementation.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one request and return the decoded response body.
    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Json,
        options: &RequestOptions,
    ) -> Result<Json, TransportError>;

    /// Upload `file` and return its URL.
    async fn upload_file(
        &self,
        file: &FileRef,
        options: &RequestOptions,
    ) -> Result<String, TransportError>;
}

/// Path of a class, used to create records.
pub fn class_path(class_name: &str) -> String {
    format!("classes/{class_name}")
}

/// Path of one record.
pub fn object_path(class_name: &str, id: &str) -> String {
    format!("classes/{class_name}/{id}")
}

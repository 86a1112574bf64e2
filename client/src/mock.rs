//! In-memory [`Transport`] for tests and examples.
//!
//! Behaves like a small backend: creates get sequential ids (`obj1`, `obj2`,
//! ...), updates merge into stored objects, `batch` requests are answered
//! item by item. Chosen records or whole requests can be made to fail.

use crate::error::TransportError;
use crate::transport::{Method, RequestOptions, Transport};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Map, Value as Json};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tether_engine::FileRef;

/// Timestamp returned for every create and update.
pub const MOCK_TIMESTAMP: &str = "2024-01-01T00:00:00.000Z";

/// One request as the transport received it.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedRequest {
    pub method: Method,
    pub path: String,
    pub body: Json,
    pub session_token: Option<String>,
}

#[derive(Debug, Clone)]
enum Rejection {
    /// Writes whose body sets `field` to `value`.
    Field { field: String, value: Json },
    /// Any request addressing this object id.
    Object { id: String },
}

#[derive(Debug, Default)]
struct MockState {
    next_id: u64,
    requests: Vec<RecordedRequest>,
    batch_sizes: Vec<usize>,
    uploads: usize,
    objects: HashMap<String, Map<String, Json>>,
    rejections: Vec<(Rejection, i64, String)>,
    failures: VecDeque<TransportError>,
}

/// Scripted backend.
#[derive(Debug, Default)]
pub struct MockTransport {
    state: Mutex<MockState>,
    latency: Option<Duration>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every call by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Store an object so that it can be fetched.
    pub fn set_object(&self, class_name: &str, id: &str, attributes: Json) {
        let mut object = attributes.as_object().cloned().unwrap_or_default();
        object.insert("objectId".into(), json!(id));
        self.state
            .lock()
            .objects
            .insert(format!("classes/{class_name}/{id}"), object);
    }

    /// Current stored object, if any.
    pub fn object(&self, class_name: &str, id: &str) -> Option<Json> {
        self.state
            .lock()
            .objects
            .get(&format!("classes/{class_name}/{id}"))
            .cloned()
            .map(Json::Object)
    }

    /// Reject every write whose body sets `field` to `value`.
    pub fn reject(&self, field: &str, value: Json, code: i64, message: &str) {
        self.state.lock().rejections.push((
            Rejection::Field {
                field: field.to_string(),
                value,
            },
            code,
            message.to_string(),
        ));
    }

    /// Reject every request addressing the object `id`.
    pub fn reject_object(&self, id: &str, code: i64, message: &str) {
        self.state.lock().rejections.push((
            Rejection::Object { id: id.to_string() },
            code,
            message.to_string(),
        ));
    }

    /// Fail the next call, as a whole, with `error`.
    pub fn fail_next(&self, error: TransportError) {
        self.state.lock().failures.push_back(error);
    }

    /// Every request received, in order. A batch counts as one request.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.lock().requests.clone()
    }

    /// Number of requests received, uploads excluded.
    pub fn call_count(&self) -> usize {
        self.state.lock().requests.len()
    }

    /// Number of entries in each `batch` request, in order.
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.state.lock().batch_sizes.clone()
    }

    pub fn upload_count(&self) -> usize {
        self.state.lock().uploads
    }
}

impl MockState {
    fn rejection(&self, path: &str, body: &Json) -> Option<(i64, String)> {
        self.rejections
            .iter()
            .find(|(rejection, _, _)| match rejection {
                Rejection::Field { field, value } => body.get(field) == Some(value),
                Rejection::Object { id } => path.rsplit('/').next() == Some(id.as_str()),
            })
            .map(|(_, code, message)| (*code, message.clone()))
    }

    fn handle(&mut self, method: Method, path: &str, body: Json) -> Result<Json, (i64, String)> {
        if let Some(rejection) = self.rejection(path, &body) {
            return Err(rejection);
        }
        let segments: Vec<&str> = path.split('/').collect();
        match (method, segments.as_slice()) {
            (Method::Post, ["classes", class_name]) => {
                self.next_id += 1;
                let id = format!("obj{}", self.next_id);
                let mut object = body.as_object().cloned().unwrap_or_default();
                object.insert("objectId".into(), json!(id));
                self.objects
                    .insert(format!("classes/{class_name}/{id}"), object);
                Ok(json!({ "objectId": id, "createdAt": MOCK_TIMESTAMP }))
            }
            (Method::Put, ["classes", _, _]) => {
                let object = self.objects.entry(path.to_string()).or_default();
                if let Some(fields) = body.as_object() {
                    object.extend(fields.clone());
                }
                Ok(json!({ "updatedAt": MOCK_TIMESTAMP }))
            }
            (Method::Delete, ["classes", _, _]) => {
                self.objects.remove(path);
                Ok(json!({}))
            }
            (Method::Get, ["classes", _, _]) => self
                .objects
                .get(path)
                .cloned()
                .map(Json::Object)
                .ok_or_else(|| (101, "Object not found.".to_string())),
            _ => Err((107, format!("unsupported request {method} {path}"))),
        }
    }

    fn handle_batch(&mut self, body: &Json) -> Result<Json, TransportError> {
        let entries = body
            .get("requests")
            .and_then(Json::as_array)
            .ok_or_else(|| TransportError::InvalidResponse("batch without requests".into()))?;
        self.batch_sizes.push(entries.len());

        let mut results = Vec::with_capacity(entries.len());
        for entry in entries {
            let method = entry
                .get("method")
                .and_then(Json::as_str)
                .and_then(parse_method)
                .ok_or_else(|| TransportError::InvalidResponse(format!("bad batch entry {entry}")))?;
            let full_path = entry.get("path").and_then(Json::as_str).unwrap_or_default();
            let path = full_path
                .find("classes/")
                .map_or(full_path, |start| &full_path[start..]);
            let body = entry.get("body").cloned().unwrap_or(Json::Null);
            results.push(match self.handle(method, path, body) {
                Ok(success) => json!({ "success": success }),
                Err((code, error)) => json!({ "error": { "code": code, "error": error } }),
            });
        }
        Ok(Json::Array(results))
    }
}

fn parse_method(name: &str) -> Option<Method> {
    match name {
        "GET" => Some(Method::Get),
        "POST" => Some(Method::Post),
        "PUT" => Some(Method::Put),
        "DELETE" => Some(Method::Delete),
        _ => None,
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Json,
        options: &RequestOptions,
    ) -> Result<Json, TransportError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let mut state = self.state.lock();
        state.requests.push(RecordedRequest {
            method,
            path: path.to_string(),
            body: body.clone(),
            session_token: options.session_token.clone(),
        });
        if let Some(error) = state.failures.pop_front() {
            return Err(error);
        }

        if method == Method::Post && path == "batch" {
            return state.handle_batch(&body);
        }
        state
            .handle(method, path, body)
            .map_err(|(code, message)| TransportError::Server { code, message })
    }

    async fn upload_file(
        &self,
        file: &FileRef,
        _options: &RequestOptions,
    ) -> Result<String, TransportError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let mut state = self.state.lock();
        if let Some(error) = state.failures.pop_front() {
            return Err(error);
        }
        state.uploads += 1;
        Ok(format!("https://files.example/{}", file.name()))
    }
}

//! Save, destroy and fetch orchestration.
//!
//! Every write to a record runs inside that record's task queue, so writes
//! for one identity reach the network in the order they were issued. Batch
//! saves park each member in its own queue and meet at a [`BatchBarrier`]
//! before one combined request is sent.

use crate::barrier::{wait_outcome, BatchBarrier};
use crate::config::{ClientConfig, SaveOptions};
use crate::error::{Error, MemberError, Result};
use crate::payload::{self, PreparedRequest};
use crate::scanner::{AttributeScanner, DependencyScanner, Unsaved};
use crate::session::{self, NoSession, SessionProvider};
use crate::transport::{object_path, Method, RequestOptions, Transport};
use futures::future::try_join_all;
use serde_json::{json, Value as Json};
use std::collections::HashSet;
use std::sync::Arc;
use tether_engine::{
    codec, value, Attributes, FileRef, Identity, IdentityPolicy, ObjectId, ObjectStateStore, Operation,
    Record, Value,
};
use tracing::{debug, info, warn};

/// Per-member results of one batch request, indexed like its members.
/// `None` for members that had nothing to send.
type BatchOutcome = Result<Vec<Option<Result<Json>>>>;

type SaveBarrier = BatchBarrier<PreparedRequest, Arc<BatchOutcome>>;

/// Entry point for persisting records.
///
/// Cheap to clone; clones share the store, the transport and the
/// collaborators.
#[derive(Clone)]
pub struct ObjectController {
    config: ClientConfig,
    store: Arc<ObjectStateStore>,
    transport: Arc<dyn Transport>,
    scanner: Arc<dyn DependencyScanner>,
    session: Arc<dyn SessionProvider>,
}

impl ObjectController {
    /// A controller with its own store, the attribute scanner and no session.
    pub fn new(config: ClientConfig, transport: Arc<dyn Transport>) -> Self {
        let store = Arc::new(ObjectStateStore::new(config.identity_policy));
        let scanner = Arc::new(AttributeScanner::new(Arc::clone(&store)));
        Self {
            config,
            store,
            transport,
            scanner,
            session: Arc::new(NoSession),
        }
    }

    /// Use an existing store. Resets the scanner to one walking that store.
    pub fn with_store(mut self, store: Arc<ObjectStateStore>) -> Self {
        self.scanner = Arc::new(AttributeScanner::new(Arc::clone(&store)));
        self.store = store;
        self
    }

    pub fn with_scanner(mut self, scanner: Arc<dyn DependencyScanner>) -> Self {
        self.scanner = scanner;
        self
    }

    pub fn with_session(mut self, session: Arc<dyn SessionProvider>) -> Self {
        self.session = session;
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<ObjectStateStore> {
        &self.store
    }

    /// Switch how record handles map onto stored state.
    pub fn set_identity_policy(&self, policy: IdentityPolicy) {
        self.store.set_policy(policy);
    }

    pub fn identity_of(&self, record: &Record) -> Identity {
        self.store.identity_of(record)
    }

    /// Record a local edit on `field`, merged over any edit already pending.
    pub fn set_pending_op(&self, record: &Record, field: &str, op: Operation) -> Result<()> {
        Ok(self
            .store
            .set_pending_op(&self.store.identity_of(record), field, op)?)
    }

    /// Server data with every pending layer applied.
    pub fn estimate_attributes(&self, record: &Record) -> Result<Attributes> {
        Ok(self.store.estimate_attributes(&self.store.identity_of(record))?)
    }

    pub fn estimate_attribute(&self, record: &Record, field: &str) -> Result<Option<Value>> {
        Ok(self
            .store
            .estimate_attribute(&self.store.identity_of(record), field)?)
    }

    /// Save one record, after its direct unsaved children when
    /// `options.cascade` is set.
    ///
    /// The write runs on a spawned task: dropping the returned future does
    /// not cancel a save that was already admitted.
    pub async fn save(&self, record: &Record, options: &SaveOptions) -> Result<Record> {
        let this = self.clone();
        let record = record.clone();
        let options = options.clone();
        tokio::spawn(async move { this.save_owned(record, options).await })
            .await
            .map_err(|_| Error::TaskAborted)?
    }

    /// Save `records` and everything unsaved they reach, in as few batch
    /// requests as the pointer graph allows.
    ///
    /// Member failures are collected into [`Error::Aggregate`]; records that
    /// succeeded keep their committed state.
    pub async fn save_all(&self, records: &[Record], options: &SaveOptions) -> Result<Vec<Record>> {
        let this = self.clone();
        let records = records.to_vec();
        let options = options.clone();
        tokio::spawn(async move { this.save_all_owned(records, options).await })
            .await
            .map_err(|_| Error::TaskAborted)?
    }

    /// Delete one record. Records never saved are left alone.
    pub async fn destroy(&self, record: &Record, options: &RequestOptions) -> Result<()> {
        let Some(id) = record.id() else {
            debug!(class_name = %record.class_name(), "destroy of an unsaved record skipped");
            return Ok(());
        };
        let request_options = self.request_options(options.session_token.as_deref());
        self.transport
            .send(
                Method::Delete,
                &object_path(record.class_name(), &id),
                json!({}),
                &request_options,
            )
            .await?;
        debug!(class_name = %record.class_name(), object_id = %id, "record destroyed");
        Ok(())
    }

    /// Delete `records` in chunks of the configured destroy batch size.
    ///
    /// Chunks go out one after another. Deletions that succeeded are not
    /// undone when a later item fails; every item failure is reported in
    /// [`Error::Aggregate`].
    pub async fn destroy_all(&self, records: &[Record], options: &RequestOptions) -> Result<()> {
        let targets: Vec<(Record, ObjectId)> = records
            .iter()
            .filter_map(|record| record.id().map(|id| (record.clone(), id)))
            .collect();
        let request_options = self.request_options(options.session_token.as_deref());
        let mut errors = Vec::new();

        for chunk in targets.chunks(self.config.destroy_batch_size.max(1)) {
            let requests: Vec<Json> = chunk
                .iter()
                .map(|(record, id)| {
                    PreparedRequest {
                        method: Method::Delete,
                        path: object_path(record.class_name(), id),
                        body: json!({}),
                    }
                    .to_batch_entry(&self.config.mount_path)
                })
                .collect();
            info!(count = chunk.len(), "dispatching batch destroy");

            let response = self
                .transport
                .send(
                    Method::Post,
                    "batch",
                    json!({ "requests": requests }),
                    &request_options,
                )
                .await?;
            let results = payload::split_batch_response(&response, chunk.len())?;
            for ((record, _), result) in chunk.iter().zip(results) {
                if let Err(error) = result {
                    errors.push(MemberError {
                        record: record.clone(),
                        error,
                    });
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            warn!(failed = errors.len(), "batch destroy finished with failures");
            Err(Error::Aggregate(errors))
        }
    }

    /// Reload `record` from the server. Pending layers are kept and still
    /// apply over the fresh data.
    pub async fn fetch(&self, record: &Record, options: &RequestOptions) -> Result<Record> {
        let id = record.id().ok_or_else(|| Error::MissingObjectId {
            class_name: record.class_name().to_string(),
        })?;
        let request_options = self.request_options(options.session_token.as_deref());
        let response = self
            .transport
            .send(
                Method::Get,
                &object_path(record.class_name(), &id),
                Json::Null,
                &request_options,
            )
            .await?;
        let map = response
            .as_object()
            .ok_or_else(|| Error::InvalidResponse(format!("expected an object, got {response}")))?;
        let decoded = codec::decode_server_response(map)?;

        let identity = self.store.identity_of(record);
        let attributes: Attributes = decoded
            .changes
            .into_iter()
            .filter_map(|(field, value)| value.map(|value| (field, value)))
            .map(|(field, value)| {
                let value = value::bind_relation(value, &identity, &field);
                (field, value)
            })
            .collect();
        self.store.replace_server_data(&identity, attributes);
        self.store.set_existed(&identity, true);
        debug!(identity = %identity, "record fetched");
        Ok(record.clone())
    }

    fn request_options(&self, explicit: Option<&str>) -> RequestOptions {
        session::request_options(explicit, self.session.as_ref())
    }

    async fn save_owned(self, record: Record, options: SaveOptions) -> Result<Record> {
        let request_options = self.request_options(options.session_token.as_deref());
        if options.cascade {
            let children = self.scanner.unsaved_children(&record, false)?;
            if !children.is_empty() {
                debug!(
                    class_name = %record.class_name(),
                    count = children.len(),
                    "saving unsaved children first"
                );
                self.save_plan(children, &options, &request_options).await?;
            }
        }

        let identity = self.store.identity_of(&record);
        payload::stage_dirty_containers(&self.store, &identity)?;
        self.store.push_layer(&identity);

        let queue = self.store.task_queue(&identity);
        let this = self.clone();
        let target = record.clone();
        queue
            .enqueue(move || async move { this.save_one(&target, &request_options).await })
            .await?;
        Ok(record)
    }

    /// Runs once admitted by the record's queue.
    async fn save_one(&self, record: &Record, options: &RequestOptions) -> Result<()> {
        let request = match payload::prepare_save(&self.store, record) {
            Ok(Some(request)) => request,
            Ok(None) => {
                self.store.pop_front_layer(&self.store.identity_of(record));
                debug!(class_name = %record.class_name(), "nothing to save");
                return Ok(());
            }
            Err(error) => {
                payload::handle_save_error(&self.store, record);
                return Err(error);
            }
        };

        debug!(
            class_name = %record.class_name(),
            method = %request.method,
            path = %request.path,
            "saving record"
        );
        match self
            .transport
            .send(request.method, &request.path, request.body, options)
            .await
        {
            Ok(response) => payload::handle_save_response(&self.store, record, &response),
            Err(error) => {
                payload::handle_save_error(&self.store, record);
                Err(error.into())
            }
        }
    }

    async fn save_all_owned(self, records: Vec<Record>, options: SaveOptions) -> Result<Vec<Record>> {
        let request_options = self.request_options(options.session_token.as_deref());
        let mut seen = HashSet::new();
        let mut plan = Vec::new();

        for root in &records {
            if self.store.is_dirty(root)? && seen.insert(self.store.identity_of(root)) {
                plan.push(Unsaved::Record(root.clone()));
            }
            for child in self.scanner.unsaved_children(root, true)? {
                let fresh = match &child {
                    Unsaved::Record(record) => seen.insert(self.store.identity_of(record)),
                    Unsaved::File(file) => !plan
                        .iter()
                        .any(|item| matches!(item, Unsaved::File(known) if known.same_handle(file))),
                };
                if fresh {
                    plan.push(child);
                }
            }
        }

        if plan.is_empty() {
            debug!(count = records.len(), "nothing to save");
        } else {
            self.save_plan(plan, &options, &request_options).await?;
        }
        Ok(records)
    }

    /// Upload files, then save records wave by wave. A wave holds records
    /// whose pointers are all resolved, up to the batch size.
    async fn save_plan(
        &self,
        plan: Vec<Unsaved>,
        options: &SaveOptions,
        request_options: &RequestOptions,
    ) -> Result<()> {
        let mut pending = Vec::new();
        let mut files = Vec::new();
        for item in plan {
            match item {
                Unsaved::Record(record) => pending.push(record),
                Unsaved::File(file) => files.push(file),
            }
        }

        self.upload_files(&files, request_options).await?;

        let batch_size = options.batch_size.unwrap_or(self.config.batch_size).max(1);
        while !pending.is_empty() {
            let mut ready = Vec::new();
            let mut deferred = Vec::new();
            for record in pending {
                if ready.len() < batch_size && self.scanner.can_be_serialized(&record)? {
                    ready.push(record);
                } else {
                    deferred.push(record);
                }
            }
            if ready.is_empty() {
                warn!(remaining = deferred.len(), "pointer cycle blocks the save");
                return Err(Error::Cycle {
                    remaining: deferred.len(),
                });
            }
            pending = deferred;

            let failed = self.dispatch_batch(ready, request_options).await?;
            if !failed.is_empty() {
                warn!(
                    failed = failed.len(),
                    skipped = pending.len(),
                    "batch save stopped after member failures"
                );
                return Err(Error::Aggregate(failed));
            }
        }
        Ok(())
    }

    async fn upload_files(&self, files: &[FileRef], options: &RequestOptions) -> Result<()> {
        if files.is_empty() {
            return Ok(());
        }
        debug!(count = files.len(), "uploading files");
        try_join_all(files.iter().map(|file| async move {
            let url = self.transport.upload_file(file, options).await?;
            file.set_url(url);
            Ok::<_, Error>(())
        }))
        .await?;
        Ok(())
    }

    /// Save one wave in a single batch request. Returns the members the
    /// server rejected; a failure of the request itself is returned as is.
    async fn dispatch_batch(
        &self,
        ready: Vec<Record>,
        request_options: &RequestOptions,
    ) -> Result<Vec<MemberError>> {
        let identities: Vec<Identity> = ready
            .iter()
            .map(|record| self.store.identity_of(record))
            .collect();
        for identity in &identities {
            payload::stage_dirty_containers(&self.store, identity)?;
        }

        let barrier: Arc<SaveBarrier> = Arc::new(BatchBarrier::new(ready.len()));
        let mut members = Vec::with_capacity(ready.len());
        for (index, (record, identity)) in ready.iter().zip(&identities).enumerate() {
            self.store.push_layer(identity);
            let store = Arc::clone(&self.store);
            let barrier = Arc::clone(&barrier);
            let record = record.clone();
            let task = self.store.task_queue(identity).enqueue(move || async move {
                save_batch_member(&store, &record, index, &barrier).await
            });
            members.push(tokio::spawn(task));
        }

        let deposits = barrier.gathered().await;
        let outcome = self.send_batch(deposits, request_options).await;
        let request_failure = outcome.as_ref().err().cloned();
        barrier.complete(Arc::new(outcome));

        let mut failed = Vec::new();
        for (record, member) in ready.into_iter().zip(members) {
            let result = member.await.unwrap_or_else(|_| Err(Error::TaskAborted));
            if let Err(error) = result {
                failed.push(MemberError { record, error });
            }
        }

        match request_failure {
            Some(error) => Err(error),
            None => Ok(failed),
        }
    }

    async fn send_batch(
        &self,
        deposits: Vec<Option<PreparedRequest>>,
        request_options: &RequestOptions,
    ) -> BatchOutcome {
        let mut results: Vec<Option<Result<Json>>> = vec![None; deposits.len()];
        let participants: Vec<(usize, PreparedRequest)> = deposits
            .into_iter()
            .enumerate()
            .filter_map(|(index, deposit)| deposit.map(|request| (index, request)))
            .collect();
        if participants.is_empty() {
            return Ok(results);
        }

        let requests: Vec<Json> = participants
            .iter()
            .map(|(_, request)| request.to_batch_entry(&self.config.mount_path))
            .collect();
        info!(count = requests.len(), "dispatching batch save");
        let response = self
            .transport
            .send(
                Method::Post,
                "batch",
                json!({ "requests": requests }),
                request_options,
            )
            .await?;

        let split = payload::split_batch_response(&response, participants.len())?;
        for ((index, _), result) in participants.into_iter().zip(split) {
            results[index] = Some(result);
        }
        Ok(results)
    }
}

/// One batch member, run once admitted by its record's queue.
async fn save_batch_member(
    store: &ObjectStateStore,
    record: &Record,
    index: usize,
    barrier: &SaveBarrier,
) -> Result<()> {
    let request = match payload::prepare_save(store, record) {
        Ok(request) => request,
        Err(error) => {
            barrier.arrive(index, None);
            payload::handle_save_error(store, record);
            return Err(error);
        }
    };
    let Some(request) = request else {
        barrier.arrive(index, None);
        store.pop_front_layer(&store.identity_of(record));
        return Ok(());
    };

    let receiver = barrier.arrive(index, Some(request));
    let result = match wait_outcome(receiver).await {
        Some(outcome) => match outcome.as_ref() {
            Ok(results) => results
                .get(index)
                .cloned()
                .flatten()
                .unwrap_or_else(|| Err(Error::InvalidResponse("missing batch result".into()))),
            Err(error) => Err(error.clone()),
        },
        None => Err(Error::TaskAborted),
    };

    match result {
        Ok(response) => payload::handle_save_response(store, record, &response),
        Err(error) => {
            payload::handle_save_error(store, record);
            Err(error)
        }
    }
}

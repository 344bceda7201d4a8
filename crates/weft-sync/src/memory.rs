//! In-process storage and runtime for one resource kind
//!
//! [`MemoryBackend`] holds both sides in memory: storage rows in one table and
//! runtime objects in another, with a change feed for runtime mutations.
//! [`MemoryAdapter`] binds it to the entity contracts and [`MemoryWatcher`]
//! plays the runtime's watch mechanism, forwarding changes into subscribed
//! [`UpdateSink`]s.
//!
//! Used by the operator in local mode and as the reference adapter in tests.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use weft_common::{Error, Result};

use crate::adapter::{RuntimeAdapter, UpdateSink};
use crate::entity::{Fingerprint, RuntimeEntity, StorageEntity};
use crate::supervisor::Runnable;

/// Runtime states after which a job never runs again
pub const TERMINAL_STATES: [&str; 2] = ["succeeded", "failed"];

const CHANGE_FEED_CAPACITY: usize = 256;

/// One record in storage
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageRow {
    /// Record ID
    pub id: String,
    /// Desired configuration
    pub spec: Value,
    /// Last status reported from the runtime
    pub status: Value,
    /// Soft-delete flag
    pub deletion_mark: bool,
    /// Terminal outcome reached
    pub finished: bool,
}

/// One object in the runtime
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeObject {
    /// Object ID, equal to its record's ID
    pub id: String,
    /// Spec the object was built from
    pub spec: Value,
    /// Observed status, `{"state": ...}` by convention
    pub status: Value,
    /// Deletion requested but not yet finalized
    pub deleting: bool,
}

impl RuntimeObject {
    /// True when the observed state is terminal
    pub fn is_terminal(&self) -> bool {
        self.status
            .get("state")
            .and_then(Value::as_str)
            .is_some_and(|state| TERMINAL_STATES.contains(&state))
    }
}

struct Inner {
    kind: String,
    storage: DashMap<String, StorageRow>,
    runtime: DashMap<String, RuntimeObject>,
    changes: broadcast::Sender<String>,
    finalizers: bool,
    unavailable: AtomicBool,
}

/// Shared in-memory storage and runtime for one kind
///
/// Clones share the same tables.
#[derive(Clone)]
pub struct MemoryBackend {
    inner: Arc<Inner>,
}

impl fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBackend")
            .field("kind", &self.inner.kind)
            .field("records", &self.inner.storage.len())
            .field("objects", &self.inner.runtime.len())
            .field("finalizers", &self.inner.finalizers)
            .finish()
    }
}

impl MemoryBackend {
    /// Backend whose runtime deletes objects immediately
    pub fn new(kind: impl Into<String>) -> Self {
        Self::build(kind.into(), false)
    }

    /// Backend whose runtime deletions stay pending until [`MemoryBackend::finalize`]
    pub fn with_finalizers(kind: impl Into<String>) -> Self {
        Self::build(kind.into(), true)
    }

    fn build(kind: String, finalizers: bool) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                kind,
                storage: DashMap::new(),
                runtime: DashMap::new(),
                changes,
                finalizers,
                unavailable: AtomicBool::new(false),
            }),
        }
    }

    /// Resource kind held by this backend
    pub fn kind(&self) -> &str {
        &self.inner.kind
    }

    /// Insert a record, or replace the spec of an existing one
    pub fn put_record(&self, id: &str, spec: Value) {
        self.inner
            .storage
            .entry(id.to_string())
            .and_modify(|row| row.spec = spec.clone())
            .or_insert_with(|| StorageRow {
                id: id.to_string(),
                spec,
                status: Value::Null,
                deletion_mark: false,
                finished: false,
            });
    }

    /// Soft-delete a record; false if it does not exist
    pub fn mark_for_deletion(&self, id: &str) -> bool {
        match self.inner.storage.get_mut(id) {
            Some(mut row) => {
                row.deletion_mark = true;
                true
            }
            None => false,
        }
    }

    /// Snapshot of one record
    pub fn record(&self, id: &str) -> Option<StorageRow> {
        self.inner.storage.get(id).map(|row| row.clone())
    }

    /// Snapshot of one runtime object
    pub fn object(&self, id: &str) -> Option<RuntimeObject> {
        self.inner.runtime.get(id).map(|object| object.clone())
    }

    /// Insert a runtime object directly, bypassing storage
    pub fn insert_object(&self, id: &str, spec: Value) {
        self.inner.runtime.insert(
            id.to_string(),
            RuntimeObject {
                id: id.to_string(),
                spec,
                status: Value::Null,
                deleting: false,
            },
        );
        self.publish(id);
    }

    /// Record a status observed in the runtime; false if the object is gone
    pub fn set_runtime_status(&self, id: &str, status: Value) -> bool {
        let updated = match self.inner.runtime.get_mut(id) {
            Some(mut object) => {
                object.status = status;
                true
            }
            None => false,
        };
        if updated {
            self.publish(id);
        }
        updated
    }

    /// Complete pending deletions; returns how many objects were removed
    pub fn finalize(&self) -> usize {
        let before = self.inner.runtime.len();
        self.inner.runtime.retain(|_, object| !object.deleting);
        before - self.inner.runtime.len()
    }

    /// Make listings fail until switched back
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Subscribe to runtime change notifications, one ID per change
    pub fn changes(&self) -> broadcast::Receiver<String> {
        self.inner.changes.subscribe()
    }

    /// IDs of every runtime object
    pub fn object_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.runtime.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    fn publish(&self, id: &str) {
        // No receivers just means nobody is watching yet
        let _ = self.inner.changes.send(id.to_string());
    }

    fn check_available(&self) -> Result<()> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            return Err(Error::storage(self.kind(), "backend unavailable"));
        }
        Ok(())
    }

    fn create_object(&self, row: &StorageRow) -> Result<()> {
        if self.inner.runtime.contains_key(&row.id) {
            return Err(Error::runtime(
                self.kind(),
                format!("object {} already exists", row.id),
            ));
        }
        self.insert_object(&row.id, row.spec.clone());
        Ok(())
    }

    fn update_object(&self, row: &StorageRow) -> Result<()> {
        {
            let mut object = self
                .inner
                .runtime
                .get_mut(&row.id)
                .ok_or_else(|| Error::not_found(self.kind(), &row.id))?;
            object.spec = row.spec.clone();
            object.status = Value::Null;
        }
        self.publish(&row.id);
        Ok(())
    }

    fn delete_object(&self, id: &str) -> Result<()> {
        if self.inner.finalizers {
            let mut object = self
                .inner
                .runtime
                .get_mut(id)
                .ok_or_else(|| Error::not_found(self.kind(), id))?;
            object.deleting = true;
            return Ok(());
        }
        self.inner
            .runtime
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| Error::not_found(self.kind(), id))
    }

    fn delete_record(&self, id: &str) -> Result<()> {
        self.inner
            .storage
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| Error::not_found(self.kind(), id))
    }

    fn report_status(&self, object: &RuntimeObject) -> Result<()> {
        let object_spec = Fingerprint::of(&object.spec)?;
        let object_status = Fingerprint::of(&object.status)?;

        let mut row = self
            .inner
            .storage
            .get_mut(&object.id)
            .ok_or_else(|| Error::not_found(self.kind(), &object.id))?;
        if Fingerprint::of(&row.spec)? != object_spec {
            return Err(Error::spec_was_touched(self.kind(), &object.id));
        }
        if Fingerprint::of(&row.status)? == object_status {
            return Ok(());
        }

        row.status = object.status.clone();
        if object.is_terminal() {
            row.finished = true;
        }
        debug!(kind = %self.kind(), id = %object.id, finished = row.finished, "Status stored");
        Ok(())
    }
}

/// Storage entity backed by a [`MemoryBackend`] row
#[derive(Clone, Debug)]
pub struct MemoryStorageEntity {
    row: StorageRow,
    backend: MemoryBackend,
}

impl MemoryStorageEntity {
    /// Row snapshot this entity was listed with
    pub fn row(&self) -> &StorageRow {
        &self.row
    }
}

#[async_trait]
impl StorageEntity for MemoryStorageEntity {
    fn id(&self) -> &str {
        &self.row.id
    }

    fn spec_hash(&self) -> Result<Fingerprint> {
        Fingerprint::of(&self.row.spec)
    }

    fn status_hash(&self) -> Result<Fingerprint> {
        Fingerprint::of(&self.row.status)
    }

    fn deletion_mark(&self) -> bool {
        self.row.deletion_mark
    }

    fn finished(&self) -> bool {
        self.row.finished
    }

    async fn create_in_runtime(&self) -> Result<()> {
        self.backend.create_object(&self.row)
    }

    async fn update_in_runtime(&self) -> Result<()> {
        self.backend.update_object(&self.row)
    }

    async fn delete_in_runtime(&self) -> Result<()> {
        self.backend.delete_object(&self.row.id)
    }

    async fn delete_in_storage(&self) -> Result<()> {
        self.backend.delete_record(&self.row.id)
    }
}

/// Runtime entity backed by a [`MemoryBackend`] object
#[derive(Clone, Debug)]
pub struct MemoryRuntimeEntity {
    object: RuntimeObject,
    backend: MemoryBackend,
}

impl MemoryRuntimeEntity {
    /// Object snapshot this entity was listed with
    pub fn object(&self) -> &RuntimeObject {
        &self.object
    }
}

#[async_trait]
impl RuntimeEntity for MemoryRuntimeEntity {
    fn id(&self) -> &str {
        &self.object.id
    }

    fn spec_hash(&self) -> Result<Fingerprint> {
        Fingerprint::of(&self.object.spec)
    }

    fn status_hash(&self) -> Result<Fingerprint> {
        Fingerprint::of(&self.object.status)
    }

    fn is_deleting(&self) -> bool {
        self.object.deleting
    }

    async fn delete(&self) -> Result<()> {
        self.backend.delete_object(&self.object.id)
    }

    async fn report_status(&self) -> Result<()> {
        self.backend.report_status(&self.object)
    }
}

type MemorySink = UpdateSink<MemoryRuntimeEntity, MemoryStorageEntity>;

/// [`RuntimeAdapter`] over a [`MemoryBackend`]
#[derive(Clone)]
pub struct MemoryAdapter {
    backend: MemoryBackend,
    sinks: Arc<Mutex<Vec<MemorySink>>>,
}

impl MemoryAdapter {
    /// Create an adapter with no subscribers
    pub fn new(backend: MemoryBackend) -> Self {
        Self {
            backend,
            sinks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Backend this adapter reads and writes
    pub fn backend(&self) -> &MemoryBackend {
        &self.backend
    }

    /// Watcher forwarding this backend's runtime changes to subscribers
    pub fn watcher(&self) -> MemoryWatcher {
        MemoryWatcher {
            name: format!("{}-watcher", self.backend.kind()),
            adapter: self.clone(),
        }
    }

    fn live_sinks(&self) -> Vec<MemorySink> {
        let mut sinks = self.sinks.lock();
        sinks.retain(|sink| !sink.is_closed());
        sinks.clone()
    }

    fn storage_entity(&self, row: StorageRow) -> MemoryStorageEntity {
        MemoryStorageEntity {
            row,
            backend: self.backend.clone(),
        }
    }

    fn runtime_entity(&self, object: RuntimeObject) -> MemoryRuntimeEntity {
        MemoryRuntimeEntity {
            object,
            backend: self.backend.clone(),
        }
    }
}

#[async_trait]
impl RuntimeAdapter for MemoryAdapter {
    type Storage = MemoryStorageEntity;
    type Runtime = MemoryRuntimeEntity;

    fn kind(&self) -> &str {
        self.backend.kind()
    }

    async fn list_storage(&self) -> Result<Vec<MemoryStorageEntity>> {
        self.backend.check_available()?;
        let mut rows: Vec<StorageRow> = self
            .backend
            .inner
            .storage
            .iter()
            .map(|e| e.value().clone())
            .collect();
        rows.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(rows.into_iter().map(|row| self.storage_entity(row)).collect())
    }

    async fn list_runtime(&self) -> Result<Vec<MemoryRuntimeEntity>> {
        self.backend.check_available()?;
        let mut objects: Vec<RuntimeObject> = self
            .backend
            .inner
            .runtime
            .iter()
            .map(|e| e.value().clone())
            .collect();
        objects.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(objects
            .into_iter()
            .map(|object| self.runtime_entity(object))
            .collect())
    }

    async fn get_from_storage(&self, id: &str) -> Result<MemoryStorageEntity> {
        self.backend
            .record(id)
            .map(|row| self.storage_entity(row))
            .ok_or_else(|| Error::not_found(self.kind(), id))
    }

    async fn get_from_runtime(&self, id: &str) -> Result<MemoryRuntimeEntity> {
        self.backend
            .object(id)
            .map(|object| self.runtime_entity(object))
            .ok_or_else(|| Error::not_found(self.kind(), id))
    }

    async fn subscribe_runtime_updates(&self, sink: MemorySink) -> Result<()> {
        debug!(kind = %self.kind(), "Runtime update subscriber registered");
        self.sinks.lock().push(sink);
        Ok(())
    }
}

/// Watch loop forwarding runtime changes to subscribed sinks
pub struct MemoryWatcher {
    name: String,
    adapter: MemoryAdapter,
}

impl MemoryWatcher {
    async fn dispatch(&self, id: &str) {
        let sinks = self.adapter.live_sinks();
        if sinks.is_empty() {
            return;
        }

        let kind = self.adapter.kind();
        let runtime = match self.adapter.get_from_runtime(id).await {
            Ok(runtime) => runtime,
            Err(e) => {
                debug!(kind = %kind, id = %id, error = %e, "Changed object is gone, skipping");
                return;
            }
        };
        let storage = match self.adapter.get_from_storage(id).await {
            Ok(storage) => storage,
            Err(e) => {
                debug!(kind = %kind, id = %id, error = %e, "Changed object has no record, skipping");
                return;
            }
        };

        for sink in sinks {
            if let Err(e) = sink.notify(runtime.clone(), storage.clone()).await {
                // The next change or reconciliation tick covers it
                debug!(kind = %kind, id = %id, error = %e, "Runtime update not applied");
            }
        }
    }
}

#[async_trait]
impl Runnable for MemoryWatcher {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, token: CancellationToken) -> Result<()> {
        let mut changes = self.adapter.backend.changes();
        info!(kind = %self.adapter.kind(), "Watching runtime changes");

        loop {
            let id = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                change = changes.recv() => match change {
                    Ok(id) => id,
                    Err(RecvError::Lagged(missed)) => {
                        warn!(kind = %self.adapter.kind(), missed, "Change feed lagged, resyncing every object");
                        for id in self.adapter.backend.object_ids() {
                            self.dispatch(&id).await;
                        }
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                },
            };
            self.dispatch(&id).await;
        }

        info!(kind = %self.adapter.kind(), "Stopped watching runtime changes");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn adapter(backend: &MemoryBackend) -> MemoryAdapter {
        MemoryAdapter::new(backend.clone())
    }

    #[tokio::test]
    async fn test_listing_is_sorted_and_reflects_both_sides() {
        let backend = MemoryBackend::new("training");
        backend.put_record("b", json!({"epochs": 1}));
        backend.put_record("a", json!({"epochs": 2}));
        backend.insert_object("z", json!({"epochs": 3}));
        let adapter = adapter(&backend);

        let storage = adapter.list_storage().await.unwrap();
        let ids: Vec<&str> = storage.iter().map(|s| s.id()).collect();
        assert_eq!(ids, vec!["a", "b"]);

        let runtime = adapter.list_runtime().await.unwrap();
        assert_eq!(runtime.len(), 1);
        assert_eq!(runtime[0].id(), "z");
    }

    #[tokio::test]
    async fn test_unavailable_backend_fails_listing() {
        let backend = MemoryBackend::new("training");
        backend.set_unavailable(true);
        let err = adapter(&backend).list_storage().await.unwrap_err();
        assert!(matches!(err, Error::Storage { .. }));

        backend.set_unavailable(false);
        assert!(adapter(&backend).list_runtime().await.is_ok());
    }

    #[tokio::test]
    async fn test_entities_debug_without_dumping_tables() {
        let backend = MemoryBackend::new("packaging");
        backend.put_record("p1", json!({"image": "model:1"}));
        let record = adapter(&backend).get_from_storage("p1").await.unwrap();

        let rendered = format!("{:?}", record);
        assert!(rendered.contains("p1"));
        assert!(rendered.contains("kind: \"packaging\""));
        assert!(rendered.contains("records: 1"));
    }

    #[tokio::test]
    async fn test_entity_actions_mutate_backend() {
        let backend = MemoryBackend::new("route");
        backend.put_record("r1", json!({"weight": 10}));
        let adapter = adapter(&backend);

        let record = adapter.get_from_storage("r1").await.unwrap();
        record.create_in_runtime().await.unwrap();
        assert_eq!(backend.object("r1").unwrap().spec, json!({"weight": 10}));
        assert!(record.create_in_runtime().await.is_err());

        backend.put_record("r1", json!({"weight": 20}));
        let record = adapter.get_from_storage("r1").await.unwrap();
        record.update_in_runtime().await.unwrap();
        assert_eq!(backend.object("r1").unwrap().spec, json!({"weight": 20}));

        record.delete_in_runtime().await.unwrap();
        assert!(backend.object("r1").is_none());
        assert!(record.delete_in_runtime().await.unwrap_err().is_not_found());

        record.delete_in_storage().await.unwrap();
        assert!(backend.record("r1").is_none());
        assert!(adapter.get_from_storage("r1").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_finalizers_keep_deleting_objects() {
        let backend = MemoryBackend::with_finalizers("deployment");
        backend.insert_object("d1", json!({}));
        let object = adapter(&backend).get_from_runtime("d1").await.unwrap();

        object.delete().await.unwrap();
        assert!(backend.object("d1").unwrap().deleting);
        assert_eq!(backend.finalize(), 1);
        assert!(backend.object("d1").is_none());
    }

    #[tokio::test]
    async fn test_report_status_copies_and_finishes() {
        let backend = MemoryBackend::new("training");
        backend.put_record("t1", json!({"epochs": 1}));
        let adapter = adapter(&backend);
        adapter
            .get_from_storage("t1")
            .await
            .unwrap()
            .create_in_runtime()
            .await
            .unwrap();

        backend.set_runtime_status("t1", json!({"state": "running"}));
        let object = adapter.get_from_runtime("t1").await.unwrap();
        object.report_status().await.unwrap();
        let row = backend.record("t1").unwrap();
        assert_eq!(row.status, json!({"state": "running"}));
        assert!(!row.finished);

        backend.set_runtime_status("t1", json!({"state": "succeeded"}));
        let object = adapter.get_from_runtime("t1").await.unwrap();
        assert!(object.object().is_terminal());
        object.report_status().await.unwrap();
        assert!(backend.record("t1").unwrap().finished);
    }

    #[tokio::test]
    async fn test_report_status_detects_races() {
        let backend = MemoryBackend::new("training");
        backend.put_record("t1", json!({"epochs": 1}));
        backend.insert_object("t1", json!({"epochs": 1}));
        backend.set_runtime_status("t1", json!({"state": "running"}));
        let adapter = adapter(&backend);
        let object = adapter.get_from_runtime("t1").await.unwrap();

        backend.put_record("t1", json!({"epochs": 2}));
        let err = object.report_status().await.unwrap_err();
        assert!(matches!(err, Error::SpecWasTouched { .. }));
        assert_eq!(backend.record("t1").unwrap().status, Value::Null);

        backend.mark_for_deletion("t1");
        adapter
            .get_from_storage("t1")
            .await
            .unwrap()
            .delete_in_storage()
            .await
            .unwrap();
        assert!(object.report_status().await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_watcher_forwards_changes_to_sinks() {
        let backend = MemoryBackend::new("training");
        backend.put_record("t1", json!({"epochs": 1}));
        let adapter = adapter(&backend);
        let (sink, mut updates) = UpdateSink::channel("training", 4);
        adapter.subscribe_runtime_updates(sink).await.unwrap();

        let token = CancellationToken::new();
        let watcher = adapter.watcher();
        assert_eq!(watcher.name(), "training-watcher");
        let handle = tokio::spawn({
            let token = token.clone();
            async move { watcher.run(token).await }
        });
        // Let the watcher subscribe to the change feed
        tokio::task::yield_now().await;

        backend.insert_object("t1", json!({"epochs": 1}));
        let update = updates.recv().await.unwrap();
        assert_eq!(update.runtime.id(), "t1");
        assert_eq!(update.storage.id(), "t1");
        update.complete(Ok(()));

        token.cancel();
        handle.await.unwrap().unwrap();
    }

    #[test]
    fn test_closed_sinks_are_pruned() {
        let backend = MemoryBackend::new("route");
        let adapter = adapter(&backend);
        let (open, _rx) = UpdateSink::channel("route", 1);
        let (closed, dropped) = UpdateSink::channel("route", 1);
        drop(dropped);
        adapter.sinks.lock().push(open);
        adapter.sinks.lock().push(closed);

        assert_eq!(adapter.live_sinks().len(), 1);
        assert_eq!(adapter.sinks.lock().len(), 1);
    }
}

//! Runtime adapter contract and the push-update hand-off queue
//!
//! An adapter binds one resource kind's storage repository and runtime client
//! to the entity contracts. Runtime push updates do not call worker logic on
//! the watch mechanism's task: the watch mechanism enqueues into an
//! [`UpdateSink`] and the worker's own consumer task processes the queue.

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use weft_common::{Error, Result};

use crate::entity::{RuntimeEntity, StorageEntity};

/// Capacity of each worker's push-update queue
pub const UPDATE_QUEUE_CAPACITY: usize = 64;

/// Storage and runtime access for one resource kind
#[async_trait]
pub trait RuntimeAdapter: Send + Sync + 'static {
    /// Storage-side entity type
    type Storage: StorageEntity;
    /// Runtime-side entity type
    type Runtime: RuntimeEntity;

    /// Resource kind name, used in logs
    fn kind(&self) -> &str;

    /// List every record of this kind in storage
    async fn list_storage(&self) -> Result<Vec<Self::Storage>>;

    /// List every object of this kind in the runtime
    async fn list_runtime(&self) -> Result<Vec<Self::Runtime>>;

    /// Get one record from storage, [`Error::NotFound`] if absent
    async fn get_from_storage(&self, id: &str) -> Result<Self::Storage>;

    /// Get one object from the runtime, [`Error::NotFound`] if absent
    async fn get_from_runtime(&self, id: &str) -> Result<Self::Runtime>;

    /// Register a sink notified whenever a runtime object of this kind changes
    ///
    /// The adapter's watch mechanism calls [`UpdateSink::notify`] with fresh
    /// entities for the changed ID. Dead sinks (see [`UpdateSink::is_closed`])
    /// may be dropped by the adapter.
    async fn subscribe_runtime_updates(
        &self,
        sink: UpdateSink<Self::Runtime, Self::Storage>,
    ) -> Result<()>;
}

/// One runtime change awaiting status propagation
pub struct RuntimeUpdate<R, S> {
    /// Fresh runtime entity
    pub runtime: R,
    /// Fresh storage entity with the same ID
    pub storage: S,
    reply: oneshot::Sender<Result<()>>,
}

impl<R, S> RuntimeUpdate<R, S> {
    /// Report the propagation result back to the notifier
    pub fn complete(self, result: Result<()>) {
        // The notifier may have given up waiting
        let _ = self.reply.send(result);
    }
}

/// Bounded hand-off queue from a watch mechanism into a worker
pub struct UpdateSink<R, S> {
    kind: String,
    tx: mpsc::Sender<RuntimeUpdate<R, S>>,
}

impl<R, S> Clone for UpdateSink<R, S> {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind.clone(),
            tx: self.tx.clone(),
        }
    }
}

impl<R, S> UpdateSink<R, S>
where
    R: Send + 'static,
    S: Send + 'static,
{
    /// Create a sink and the receiver its worker drains
    pub fn channel(kind: &str, capacity: usize) -> (Self, mpsc::Receiver<RuntimeUpdate<R, S>>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                kind: kind.to_string(),
                tx,
            },
            rx,
        )
    }

    /// Enqueue an update and wait for the worker's propagation result
    ///
    /// Waits for queue capacity when the worker is behind. Fails with
    /// [`Error::Internal`] if the worker has stopped.
    pub async fn notify(&self, runtime: R, storage: S) -> Result<()> {
        let (reply, done) = oneshot::channel();
        self.tx
            .send(RuntimeUpdate {
                runtime,
                storage,
                reply,
            })
            .await
            .map_err(|_| self.stopped())?;
        done.await.map_err(|_| self.stopped())?
    }

    /// True once the consuming worker has stopped
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resource kind this sink feeds
    pub fn kind(&self) -> &str {
        &self.kind
    }

    fn stopped(&self) -> Error {
        Error::internal_with_context(
            "update-sink",
            format!("{} worker stopped consuming runtime updates", self.kind),
        )
    }
}

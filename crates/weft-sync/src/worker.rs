//! Per-kind reconciliation worker
//!
//! A worker owns one [`RuntimeAdapter`] and runs two independent paths:
//!
//! - **Pull** ([`Worker::sync_specs`]): every launch period, list both sides,
//!   diff them into a [`SyncPlan`] and apply the corrective actions. Ticks run
//!   inline in the worker loop, so two diffs for one kind never overlap.
//! - **Push** ([`Worker::sync_status`]): for every runtime change the adapter's
//!   watch mechanism enqueues, copy the observed status back into storage.
//!   A worker-owned consumer task drains the queue; it may run while a tick is
//!   in flight.
//!
//! Neither path keeps state between invocations: both act on fresh entities,
//! which is what makes the interleaving safe without locks.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{join_all, BoxFuture};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};
use weft_common::metrics::{self, ActionResult, TickTimer};
use weft_common::{Error, Result};

use crate::adapter::{RuntimeAdapter, RuntimeUpdate, UpdateSink, UPDATE_QUEUE_CAPACITY};
use crate::entity::{spec_hash_of, RuntimeEntity, StorageEntity};
use crate::supervisor::Runnable;

/// Corrective actions produced by one diff
///
/// `delete_in_runtime` holds deletion-marked records whose runtime object still
/// exists; `zombies` holds runtime objects with no record at all. Together they
/// form the delete-in-runtime set.
pub struct SyncPlan<S, R> {
    /// Records to materialize in the runtime
    pub create: Vec<S>,
    /// Records whose runtime object carries an outdated spec
    pub update: Vec<S>,
    /// Deletion-marked records whose runtime object must go
    pub delete_in_runtime: Vec<S>,
    /// Runtime objects without a storage record
    pub zombies: Vec<R>,
    /// Deletion-marked records whose runtime object is already gone
    pub delete_in_storage: Vec<S>,
    /// IDs left alone this tick because a spec hash failed
    pub skipped: Vec<String>,
}

impl<S: StorageEntity, R: RuntimeEntity> SyncPlan<S, R> {
    fn empty() -> Self {
        Self {
            create: Vec::new(),
            update: Vec::new(),
            delete_in_runtime: Vec::new(),
            zombies: Vec::new(),
            delete_in_storage: Vec::new(),
            skipped: Vec::new(),
        }
    }

    /// Diff storage against runtime
    ///
    /// Each record is matched with the runtime object of the same ID and the
    /// first applicable rule wins:
    ///
    /// 1. no object, not marked, not finished: create
    /// 2. no object, not marked, finished: nothing (completed and reclaimed)
    /// 3. no object, marked: delete the record
    /// 4. either spec hash fails: skip this entity for this tick
    /// 5. finished and spec hashes equal: nothing
    /// 6. marked, object not deleting: delete the object
    /// 7. marked, object deleting: nothing (deletion in flight)
    /// 8. spec hashes differ: update (also reruns a finished record whose spec was edited)
    /// 9. otherwise nothing
    ///
    /// Runtime objects left unmatched are zombies and always deleted.
    pub fn build(kind: &str, storage: Vec<S>, runtime: Vec<R>) -> Self {
        let mut plan = Self::empty();
        let mut runtime_by_id: HashMap<String, R> = runtime
            .into_iter()
            .map(|r| (r.id().to_string(), r))
            .collect();

        for record in storage {
            match runtime_by_id.remove(record.id()) {
                None if record.deletion_mark() => plan.delete_in_storage.push(record),
                None if record.finished() => {}
                None => plan.create.push(record),
                Some(object) => plan.classify_pair(kind, record, &object),
            }
        }

        let mut zombies: Vec<R> = runtime_by_id.into_values().collect();
        zombies.sort_by(|a, b| a.id().cmp(b.id()));
        plan.zombies = zombies;
        plan
    }

    fn classify_pair(&mut self, kind: &str, record: S, object: &R) {
        let hashes = spec_hash_of(record.id(), record.spec_hash())
            .and_then(|s| spec_hash_of(object.id(), object.spec_hash()).map(|r| (s, r)));
        let specs_equal = match hashes {
            Ok((desired, actual)) => desired == actual,
            Err(e) => {
                warn!(
                    kind = %kind,
                    id = %record.id(),
                    error = %e,
                    "Failed to compute spec hash, skipping entity this tick"
                );
                self.skipped.push(record.id().to_string());
                return;
            }
        };

        // Checked before the deletion mark: a finished, marked, unchanged
        // record is never cleaned up here
        if record.finished() && specs_equal {
            return;
        }

        if record.deletion_mark() {
            if !object.is_deleting() {
                self.delete_in_runtime.push(record);
            }
            return;
        }

        if !specs_equal {
            self.update.push(record);
        }
    }

    /// IDs scheduled for creation
    pub fn create_ids(&self) -> Vec<&str> {
        self.create.iter().map(|s| s.id()).collect()
    }

    /// IDs scheduled for update
    pub fn update_ids(&self) -> Vec<&str> {
        self.update.iter().map(|s| s.id()).collect()
    }

    /// IDs scheduled for runtime deletion, marked records first, then zombies
    pub fn delete_runtime_ids(&self) -> Vec<&str> {
        self.delete_in_runtime
            .iter()
            .map(|s| s.id())
            .chain(self.zombies.iter().map(|r| r.id()))
            .collect()
    }

    /// IDs scheduled for storage deletion
    pub fn delete_storage_ids(&self) -> Vec<&str> {
        self.delete_in_storage.iter().map(|s| s.id()).collect()
    }

    /// Number of corrective actions in the plan
    pub fn action_count(&self) -> usize {
        self.create.len()
            + self.update.len()
            + self.delete_in_runtime.len()
            + self.zombies.len()
            + self.delete_in_storage.len()
    }

    /// True when nothing needs to change
    pub fn is_empty(&self) -> bool {
        self.action_count() == 0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Action {
    Create,
    Update,
    DeleteInRuntime,
    DeleteZombie,
    DeleteInStorage,
}

impl Action {
    fn as_str(&self) -> &'static str {
        match self {
            Action::Create => "create-in-runtime",
            Action::Update => "update-in-runtime",
            Action::DeleteInRuntime => "delete-in-runtime",
            Action::DeleteZombie => "delete-zombie",
            Action::DeleteInStorage => "delete-in-storage",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one reconciliation tick
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Actions that succeeded
    pub applied: usize,
    /// Actions that failed and will be retried next tick
    pub failed: usize,
    /// Entities skipped because a spec hash failed
    pub skipped: usize,
}

/// Reconciles one resource kind
pub struct Worker<A: RuntimeAdapter> {
    name: String,
    span: Span,
    adapter: Arc<A>,
    launch_period: Duration,
}

impl<A: RuntimeAdapter> Worker<A> {
    /// Create a worker ticking every `launch_period`
    pub fn new(adapter: Arc<A>, launch_period: Duration) -> Self {
        Self {
            name: format!("{}-worker", adapter.kind()),
            span: info_span!("worker", kind = %adapter.kind()),
            adapter,
            launch_period,
        }
    }

    /// Resource kind this worker reconciles
    pub fn kind(&self) -> &str {
        self.adapter.kind()
    }

    /// Interval between ticks
    pub fn launch_period(&self) -> Duration {
        self.launch_period
    }

    /// Run one diff-and-apply pass
    ///
    /// A listing failure aborts the pass with the error. Action failures are
    /// logged per entity and counted in the report; they never stop the
    /// remaining actions.
    pub async fn sync_specs(&self) -> Result<SyncReport> {
        let timer = TickTimer::start(self.kind());
        match self.reconcile().await {
            Ok(report) => {
                timer.success();
                Ok(report)
            }
            Err(e) => {
                timer.error();
                Err(e)
            }
        }
    }

    async fn reconcile(&self) -> Result<SyncReport> {
        let kind = self.kind();
        let storage = self.adapter.list_storage().await?;
        let runtime = self.adapter.list_runtime().await?;
        debug!(
            kind = %kind,
            storage = storage.len(),
            runtime = runtime.len(),
            "Listed entities"
        );

        let plan = SyncPlan::build(kind, storage, runtime);
        if !plan.is_empty() {
            info!(
                kind = %kind,
                create = plan.create.len(),
                update = plan.update.len(),
                delete_runtime = plan.delete_in_runtime.len() + plan.zombies.len(),
                delete_storage = plan.delete_in_storage.len(),
                "Applying corrective actions"
            );
        }
        Ok(self.apply(plan).await)
    }

    async fn apply(&self, plan: SyncPlan<A::Storage, A::Runtime>) -> SyncReport {
        type Outcome = (Action, String, Result<()>);
        let mut actions: Vec<BoxFuture<'_, Outcome>> = Vec::with_capacity(plan.action_count());

        for record in &plan.create {
            actions.push(Box::pin(async move {
                (Action::Create, record.id().to_string(), record.create_in_runtime().await)
            }));
        }
        for record in &plan.update {
            actions.push(Box::pin(async move {
                (Action::Update, record.id().to_string(), record.update_in_runtime().await)
            }));
        }
        for record in &plan.delete_in_runtime {
            actions.push(Box::pin(async move {
                (
                    Action::DeleteInRuntime,
                    record.id().to_string(),
                    record.delete_in_runtime().await,
                )
            }));
        }
        for object in &plan.zombies {
            actions.push(Box::pin(async move {
                (Action::DeleteZombie, object.id().to_string(), object.delete().await)
            }));
        }
        for record in &plan.delete_in_storage {
            actions.push(Box::pin(async move {
                (
                    Action::DeleteInStorage,
                    record.id().to_string(),
                    record.delete_in_storage().await,
                )
            }));
        }

        let kind = self.kind();
        let mut report = SyncReport {
            skipped: plan.skipped.len(),
            ..Default::default()
        };
        metrics::record_skipped(kind, report.skipped);
        for (action, id, result) in join_all(actions).await {
            match result {
                Ok(()) => {
                    report.applied += 1;
                    metrics::record_action(kind, action.as_str(), ActionResult::Applied);
                    debug!(kind = %kind, id = %id, action = %action, "Action applied");
                }
                Err(e) => {
                    report.failed += 1;
                    metrics::record_action(kind, action.as_str(), ActionResult::Failed);
                    error!(
                        kind = %kind,
                        id = %id,
                        action = %action,
                        error = %e,
                        "Action failed, will retry next tick"
                    );
                }
            }
        }
        report
    }

    /// Propagate a runtime object's status into storage
    ///
    /// Refuses with [`Error::StaleSpec`] when the object was built from a
    /// different spec than storage holds, without calling `report_status`.
    /// `NotFound` and `SpecWasTouched` from `report_status` are races the next
    /// tick resolves, so they are logged and swallowed.
    pub async fn sync_status(&self, runtime: &A::Runtime, storage: &A::Storage) -> Result<()> {
        propagate_status(self.kind(), runtime, storage).await
    }

    /// Subscribe to runtime updates, then tick until cancelled
    ///
    /// A failed subscription is fatal. Cancellation is only observed between
    /// ticks; an in-flight pass always completes first.
    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        let kind = self.kind().to_string();

        let (sink, updates) = UpdateSink::channel(&kind, UPDATE_QUEUE_CAPACITY);
        self.adapter
            .subscribe_runtime_updates(sink)
            .await
            .map_err(|e| match e {
                Error::Registration { .. } => e,
                other => Error::registration(&kind, other.to_string()),
            })?;

        let consumer_token = token.child_token();
        let consumer = tokio::spawn(
            consume_updates(kind.clone(), updates, consumer_token.clone())
                .instrument(self.span.clone()),
        );

        let mut ticker = tokio::time::interval(self.launch_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            kind = %kind,
            period_ms = self.launch_period.as_millis() as u64,
            "Worker started"
        );

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.sync_specs().await {
                Ok(report) if report.failed > 0 || report.skipped > 0 => {
                    warn!(
                        kind = %kind,
                        applied = report.applied,
                        failed = report.failed,
                        skipped = report.skipped,
                        "Reconciliation tick partially failed"
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(kind = %kind, error = %e, "Reconciliation tick failed, retrying next tick");
                }
            }
        }

        consumer_token.cancel();
        if let Err(e) = consumer.await {
            warn!(kind = %kind, error = %e, "Status consumer ended abnormally");
        }
        info!(kind = %kind, "Worker stopped");
        Ok(())
    }
}

#[async_trait]
impl<A: RuntimeAdapter> Runnable for Worker<A> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, token: CancellationToken) -> Result<()> {
        Worker::run(self, token).instrument(self.span.clone()).await
    }
}

async fn propagate_status<R: RuntimeEntity, S: StorageEntity>(
    kind: &str,
    runtime: &R,
    storage: &S,
) -> Result<()> {
    let actual = spec_hash_of(runtime.id(), runtime.spec_hash())?;
    let desired = spec_hash_of(storage.id(), storage.spec_hash())?;
    if actual != desired {
        debug!(
            kind = %kind,
            id = %runtime.id(),
            actual = ?actual,
            desired = ?desired,
            "Runtime spec differs from storage, not propagating status"
        );
        return Err(Error::stale_spec(kind, runtime.id()));
    }

    match runtime.report_status().await {
        Ok(()) => {
            debug!(kind = %kind, id = %runtime.id(), "Status propagated");
            Ok(())
        }
        Err(e) if e.is_benign_race() => {
            debug!(
                kind = %kind,
                id = %runtime.id(),
                error = %e,
                "Status push lost a race, next tick converges"
            );
            Ok(())
        }
        Err(e) => Err(e),
    }
}

async fn consume_updates<R: RuntimeEntity, S: StorageEntity>(
    kind: String,
    mut updates: mpsc::Receiver<RuntimeUpdate<R, S>>,
    token: CancellationToken,
) {
    loop {
        let update = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            update = updates.recv() => match update {
                Some(update) => update,
                None => break,
            },
        };

        let result = propagate_status(&kind, &update.runtime, &update.storage).await;
        if let Err(e) = &result {
            warn!(
                kind = %kind,
                id = %update.runtime.id(),
                error = %e,
                "Status propagation failed"
            );
        }
        update.complete(result);
    }
}

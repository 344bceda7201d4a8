//! Assembling workers and watchers from configuration
//!
//! Every enabled resource kind contributes one worker to the reconciler
//! supervisor and, when its adapter has one, a watcher to the watch
//! supervisor. The coordinator runs the two supervisors side by side.

use std::sync::Arc;

use tracing::{debug, info};
use weft_common::config::{OperatorConfig, ResourceKind};
use weft_sync::memory::{MemoryAdapter, MemoryBackend};
use weft_sync::{RuntimeAdapter, Runnable, Supervisor, Worker};

/// Reconciler and runtime-watch subsystems for one leadership term
pub struct Subsystems {
    /// Supervisor running one worker per enabled kind
    pub reconciler: Arc<Supervisor>,
    /// Supervisor running the runtime watchers
    pub watcher: Arc<Supervisor>,
}

/// Registers adapters against the operator configuration
pub struct SubsystemBuilder<'a> {
    config: &'a OperatorConfig,
    reconciler: Supervisor,
    watcher: Supervisor,
}

impl<'a> SubsystemBuilder<'a> {
    /// Start with empty supervisors
    pub fn new(config: &'a OperatorConfig) -> Self {
        Self {
            config,
            reconciler: Supervisor::new("reconciler"),
            watcher: Supervisor::new("runtime-watch"),
        }
    }

    /// Register a kind's adapter and optional watcher
    ///
    /// Returns false without registering anything when the kind is disabled.
    pub fn register<A: RuntimeAdapter>(
        &mut self,
        kind: ResourceKind,
        adapter: Arc<A>,
        watcher: Option<Arc<dyn Runnable>>,
    ) -> bool {
        let settings = self.config.worker(kind);
        if !settings.enabled {
            debug!(kind = %kind, "Worker disabled, skipping");
            return false;
        }

        self.reconciler
            .add_runnable(Arc::new(Worker::new(adapter, settings.launch_period())));
        if let Some(watcher) = watcher {
            self.watcher.add_runnable(watcher);
        }
        info!(
            kind = %kind,
            period_secs = settings.launch_period_secs,
            "Worker registered"
        );
        true
    }

    /// Finish registration
    pub fn build(self) -> Subsystems {
        Subsystems {
            reconciler: Arc::new(self.reconciler),
            watcher: Arc::new(self.watcher),
        }
    }
}

/// Subsystems over in-process backends, one per enabled kind
///
/// Returns the backends alongside so callers can seed or inspect them.
pub fn local_subsystems(config: &OperatorConfig) -> (Subsystems, Vec<MemoryBackend>) {
    let mut builder = SubsystemBuilder::new(config);
    let mut backends = Vec::new();

    for kind in config.enabled_kinds() {
        let backend = MemoryBackend::new(kind.as_str());
        let adapter = MemoryAdapter::new(backend.clone());
        let watcher: Arc<dyn Runnable> = Arc::new(adapter.watcher());
        builder.register(kind, Arc::new(adapter), Some(watcher));
        backends.push(backend);
    }

    (builder.build(), backends)
}

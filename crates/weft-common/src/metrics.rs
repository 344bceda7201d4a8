//! Metrics registry for weft reconciliation
//!
//! Instruments are created against the global meter provider. Without an OTLP
//! endpoint the provider is a no-op and recording costs nothing.

use std::time::Instant;

use once_cell::sync::Lazy;
use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};
use opentelemetry::{global, KeyValue};

static METER: Lazy<Meter> = Lazy::new(|| global::meter("weft"));

/// Histogram of reconciliation tick duration
///
/// Labels:
/// - `kind`: resource kind
/// - `result`: success, error
pub static TICK_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("weft_sync_tick_duration_seconds")
        .with_description("Duration of one reconciliation tick in seconds")
        .with_unit("s")
        .build()
});

/// Counter of corrective actions
///
/// Labels:
/// - `kind`: resource kind
/// - `action`: create-in-runtime, update-in-runtime, delete-in-runtime,
///   delete-zombie, delete-in-storage
/// - `result`: applied, failed
pub static SYNC_ACTIONS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("weft_sync_actions_total")
        .with_description("Total number of corrective actions by outcome")
        .with_unit("{actions}")
        .build()
});

/// Counter of entities left alone because their spec could not be hashed
///
/// Labels:
/// - `kind`: resource kind
pub static SKIPPED_ENTITIES: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("weft_sync_skipped_total")
        .with_description("Total number of entities skipped by a failed spec hash")
        .with_unit("{entities}")
        .build()
});

/// Gauge set to 1 while this replica holds the lease, 0 otherwise
///
/// Labels:
/// - `identity`: lock holder identity
pub static IS_LEADER: Lazy<Gauge<i64>> = Lazy::new(|| {
    METER
        .i64_gauge("weft_leader_is_leader")
        .with_description("Whether this replica currently leads reconciliation")
        .build()
});

/// Outcome label for a corrective action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionResult {
    /// The action succeeded
    Applied,
    /// The action failed and will be retried next tick
    Failed,
}

impl ActionResult {
    /// Convert to label value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::Failed => "failed",
        }
    }
}

/// Times one reconciliation tick
pub struct TickTimer {
    kind: String,
    start: Instant,
}

impl TickTimer {
    /// Start timing a tick for `kind`
    pub fn start(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            start: Instant::now(),
        }
    }

    /// Record a tick that listed both sides and applied its plan
    pub fn success(self) {
        self.finish("success");
    }

    /// Record a tick aborted before applying anything
    pub fn error(self) {
        self.finish("error");
    }

    fn finish(self, result: &'static str) {
        TICK_DURATION.record(
            self.start.elapsed().as_secs_f64(),
            &[
                KeyValue::new("kind", self.kind),
                KeyValue::new("result", result),
            ],
        );
    }
}

/// Record the outcome of one corrective action
pub fn record_action(kind: &str, action: &str, result: ActionResult) {
    SYNC_ACTIONS.add(
        1,
        &[
            KeyValue::new("kind", kind.to_string()),
            KeyValue::new("action", action.to_string()),
            KeyValue::new("result", result.as_str()),
        ],
    );
}

/// Record entities skipped in one tick
pub fn record_skipped(kind: &str, count: usize) {
    if count > 0 {
        SKIPPED_ENTITIES.add(count as u64, &[KeyValue::new("kind", kind.to_string())]);
    }
}

/// Update the leadership gauge
pub fn set_leader(identity: &str, leading: bool) {
    IS_LEADER.record(
        i64::from(leading),
        &[KeyValue::new("identity", identity.to_string())],
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_result_as_str() {
        assert_eq!(ActionResult::Applied.as_str(), "applied");
        assert_eq!(ActionResult::Failed.as_str(), "failed");
    }

    #[test]
    fn test_tick_timer() {
        let timer = TickTimer::start("training");
        assert_eq!(timer.kind, "training");
        timer.success();
        TickTimer::start("training").error();
    }

    #[test]
    fn test_recording_without_exporter() {
        record_action("training", "create-in-runtime", ActionResult::Applied);
        record_skipped("training", 0);
        record_skipped("training", 2);
        set_leader("replica-a", true);
        set_leader("replica-a", false);
    }
}

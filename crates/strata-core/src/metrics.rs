use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

pub const METRIC_CREATE_TIME: &str = "ImageCreationTime";
pub const METRIC_DELETE_TIME: &str = "ImageDeletionTime";
pub const METRIC_CLEAN_TIME: &str = "ImageCleanTime";

/// Fire-and-forget sink for operation timings. Emitting never fails the
/// operation being timed, so the method has no error to return.
pub trait MetricsEmitter: Send + Sync {
    fn try_emit_duration(&self, name: &str, duration: Duration);
}

/// Emits metrics as `tracing` events on the `strata.metric` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEmitter;

impl MetricsEmitter for TracingEmitter {
    fn try_emit_duration(&self, name: &str, duration: Duration) {
        debug!(
            target: "strata.metric",
            metric = name,
            duration_ms = duration.as_millis() as u64,
            "metric"
        );
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEmitter;

impl MetricsEmitter for NoopEmitter {
    fn try_emit_duration(&self, _name: &str, _duration: Duration) {}
}

/// Keeps every emitted metric in memory. Used by tests.
#[derive(Debug, Default)]
pub struct RecordingEmitter {
    emitted: Mutex<Vec<(String, Duration)>>,
}

impl RecordingEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn names(&self) -> Vec<String> {
        self.emitted
            .lock()
            .map(|e| e.iter().map(|(n, _)| n.clone()).collect())
            .unwrap_or_default()
    }
}

impl MetricsEmitter for RecordingEmitter {
    fn try_emit_duration(&self, name: &str, duration: Duration) {
        match self.emitted.lock() {
            Ok(mut emitted) => emitted.push((name.to_owned(), duration)),
            Err(e) => warn!("dropping metric {name}: {e}"),
        }
    }
}

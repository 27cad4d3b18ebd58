use crate::gc::{GarbageCollector, GcReport};
use crate::measurer::StoreMeasurer;
use crate::metrics::{MetricsEmitter, METRIC_CLEAN_TIME};
use crate::{release, CoreError};
use std::sync::Arc;
use std::time::Instant;
use strata_store::{Locksmith, GLOBAL_LOCK_KEY};
use tracing::{info, info_span};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanReport {
    /// Usage was under the threshold and nothing was collected.
    pub skipped: bool,
    pub gc: GcReport,
}

/// Threshold-gated collection under the global lock.
#[derive(Clone)]
pub struct Cleaner {
    locksmith: Locksmith,
    measurer: StoreMeasurer,
    gc: GarbageCollector,
    metrics: Arc<dyn MetricsEmitter>,
}

impl Cleaner {
    pub fn new(
        locksmith: Locksmith,
        measurer: StoreMeasurer,
        gc: GarbageCollector,
        metrics: Arc<dyn MetricsEmitter>,
    ) -> Self {
        Self {
            locksmith,
            measurer,
            gc,
            metrics,
        }
    }

    /// Collect unreferenced volumes unless the store is still below
    /// `threshold` bytes. A threshold of 0 always collects. Volumes of
    /// `keep_images` survive either way.
    pub fn clean(&self, threshold: u64, keep_images: &[String]) -> Result<CleanReport, CoreError> {
        let _span = info_span!("clean", threshold).entered();
        let start = Instant::now();

        if threshold > 0 {
            let usage = self.measurer.measure_store()?;
            if threshold >= usage {
                info!("store usage {usage} is within threshold {threshold}, skipping clean");
                return Ok(CleanReport {
                    skipped: true,
                    gc: GcReport::default(),
                });
            }
            info!("store usage {usage} exceeds threshold {threshold}");
        }

        let lock = self.locksmith.lock(GLOBAL_LOCK_KEY)?;
        let result = self.gc.collect(keep_images);
        release(lock);

        self.metrics
            .try_emit_duration(METRIC_CLEAN_TIME, start.elapsed());
        let gc = result?;
        info!("clean removed {} volumes", gc.removed.len());
        Ok(CleanReport { skipped: false, gc })
    }
}

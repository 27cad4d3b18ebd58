//! Store orchestration for strata.
//!
//! This crate ties the store persistence layer and the filesystem drivers
//! together into the operations callers use: `Creator` (pull, register,
//! materialize), `Deleter`, `Cleaner` (threshold-gated collection) and the
//! `GarbageCollector` it runs under the global lock. `Store` wires all of
//! them to one store root.

pub mod cleaner;
pub mod creator;
pub mod deleter;
pub mod fetcher;
pub mod gc;
pub mod measurer;
pub mod metrics;
pub mod puller;
pub mod store;

pub use cleaner::{CleanReport, Cleaner};
pub use creator::{CreateSpec, Creator, Image, IMAGE_METADATA_FILE};
pub use deleter::Deleter;
pub use fetcher::{
    BaseImageInfo, BaseImageRef, Fetcher, LayerInfo, LocalFetcher, PullError, SchemeFetcher,
};
pub use gc::{unreferenced_volumes, GarbageCollector, GcReport, STALE_STAGING_AGE};
pub use measurer::StoreMeasurer;
pub use metrics::{
    MetricsEmitter, NoopEmitter, RecordingEmitter, TracingEmitter, METRIC_CLEAN_TIME,
    METRIC_CREATE_TIME, METRIC_DELETE_TIME,
};
pub use puller::{BaseImagePuller, PullSpec, StagedPull};
pub use store::Store;

use strata_driver::DriverError;
use strata_store::{LockHandle, StoreError, VolumeId};
use thiserror::Error;
use tracing::warn;

/// A volume the collector could not remove.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeFailure {
    pub volume: VolumeId,
    pub reason: String,
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("driver error: {0}")]
    Driver(#[from] DriverError),
    #[error("pulling base image: {0}")]
    Pull(#[from] PullError),
    #[error("image '{0}' already exists")]
    AlreadyExists(String),
    #[error("image '{0}' not found")]
    ImageNotFound(String),
    #[error(
        "failed to remove {} of {} unreferenced volumes",
        .failed.len(),
        .report.unreferenced.len()
    )]
    PartialCollection {
        report: GcReport,
        failed: Vec<VolumeFailure>,
    },
    #[error("{cause}; rollback also failed: {cleanup}")]
    Rollback {
        cause: Box<CoreError>,
        cleanup: Box<CoreError>,
    },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CoreError {
    /// The error that made the operation fail, looking through rollback.
    pub fn root_cause(&self) -> &CoreError {
        match self {
            CoreError::Rollback { cause, .. } => cause.root_cause(),
            other => other,
        }
    }

    pub fn pull_error(&self) -> Option<&PullError> {
        match self.root_cause() {
            CoreError::Pull(e) => Some(e),
            _ => None,
        }
    }

    pub fn is_quota_exceeded(&self) -> bool {
        matches!(
            self.root_cause(),
            CoreError::Driver(DriverError::QuotaExceeded { .. })
        )
    }

    pub fn is_namespace_mismatch(&self) -> bool {
        matches!(
            self.root_cause(),
            CoreError::Store(StoreError::NamespaceMismatch)
        )
    }

    pub fn is_lock_failure(&self) -> bool {
        matches!(self.root_cause(), CoreError::Store(StoreError::LockFailed { .. }))
    }
}

/// Release `lock` once its work is done. The work's own result is what the
/// caller reports, so a failed release is only logged.
pub(crate) fn release(lock: LockHandle) {
    let key = lock.key().to_owned();
    if let Err(e) = lock.unlock() {
        warn!("failed to release lock '{key}': {e}");
    }
}

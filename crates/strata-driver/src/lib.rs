//! Filesystem drivers for strata volumes and images.
//!
//! This crate implements the layer below the store orchestration: the
//! pluggable `FilesystemDriver` trait, a plain-directory driver that works on
//! any local filesystem, a fault-injecting mock driver for tests, tar layer
//! unpacking with whiteout and id-mapping support, and disk usage
//! measurement.

pub mod backend;
pub mod dir;
pub mod mock;
pub mod unpack;
pub mod usage;

pub use backend::{select_driver, FilesystemDriver, ImageInfo, ImageSpec, MountInfo};
pub use dir::{remove_tree, DirectoryDriver};
pub use mock::MockDriver;
pub use unpack::unpack_layer;
pub use usage::disk_usage;

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("driver I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("driver '{0}' is not available")]
    Unavailable(String),
    #[error("disk limit of {limit} bytes is smaller than the {required} bytes the base image needs")]
    QuotaExceeded { limit: u64, required: u64 },
    #[error("volume not found: {0}")]
    VolumeNotFound(String),
    #[error("image path already exists: {0}")]
    ImageExists(PathBuf),
    #[error("invalid layer: {0}")]
    InvalidLayer(String),
    #[error("{0}")]
    Injected(String),
}

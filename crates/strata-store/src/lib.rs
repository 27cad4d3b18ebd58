//! On-disk persistence for the strata root filesystem store.
//!
//! This crate owns everything that lives under the store root and is not a
//! filesystem-driver concern: the directory layout (`StoreLayout`), named
//! cross-process locks (`Locksmith`), per-image dependency records
//! (`DependencyManager`), the layer/base-image cache index (`CacheIndex`),
//! and the store-wide uid/gid mapping record (`NamespaceRecord`).

pub mod cache;
pub mod dependencies;
pub mod layout;
pub mod lock;
pub mod namespace;
pub mod types;

pub use cache::CacheIndex;
pub use dependencies::{DependencyManager, DependencyRecord};
pub use layout::{StoreLayout, STORE_FORMAT_VERSION};
pub use lock::{image_lock_key, LockHandle, Locksmith, GLOBAL_LOCK_KEY};
pub use namespace::NamespaceRecord;
pub use types::{
    chain_id, translate_id, validate_image_id, IdMapping, ImageId, LayerDigest, StoreOwner,
    VolumeId,
};

use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;

/// Fsync a directory so that a preceding `rename()` into it is durable.
pub(crate) fn fsync_dir(dir: &Path) -> Result<(), std::io::Error> {
    let f = std::fs::File::open(dir)?;
    f.sync_all()
}

/// Write `content` to `dest` atomically: temp file in the same directory,
/// fsync, rename over the destination, fsync the directory.
pub(crate) fn write_atomic(dest: &Path, content: &[u8]) -> Result<(), StoreError> {
    let dir = dest
        .parent()
        .ok_or_else(|| StoreError::InvalidLayout(dest.to_path_buf()))?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(content)?;
    tmp.as_file().sync_all()?;
    tmp.persist(dest).map_err(|e| StoreError::Io(e.error))?;
    fsync_dir(dir)?;
    Ok(())
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("failed to {action} lock '{key}': {source}")]
    LockFailed {
        key: String,
        action: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("no dependency record for image '{0}'")]
    DependenciesNotFound(String),
    #[error("integrity check failed for record '{name}': expected {expected}, got {actual}")]
    IntegrityFailure {
        name: String,
        expected: String,
        actual: String,
    },
    #[error("invalid image id: {0}")]
    InvalidId(String),
    #[error("invalid id mapping: {0}")]
    InvalidMapping(String),
    #[error("store already initialized with a different uid/gid mapping")]
    NamespaceMismatch,
    #[error("store path '{path}' is owned by {found_uid}:{found_gid}, expected {uid}:{gid}")]
    OwnerMismatch {
        path: PathBuf,
        uid: u32,
        gid: u32,
        found_uid: u32,
        found_gid: u32,
    },
    #[error("store format version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
    #[error("path has no parent directory: {0}")]
    InvalidLayout(PathBuf),
}

use crate::DriverError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use strata_store::{StoreLayout, StoreOwner, VolumeId};

/// How to mount an image's root filesystem, for drivers whose images need
/// an explicit mount rather than a plain directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MountInfo {
    #[serde(rename = "type")]
    pub kind: String,
    pub source: String,
    pub destination: String,
    pub options: Vec<String>,
}

/// Request to materialize one image on top of a volume chain.
#[derive(Debug, Clone)]
pub struct ImageSpec {
    pub image_path: PathBuf,
    /// Bottom layer first.
    pub base_volumes: Vec<VolumeId>,
    /// Bytes, 0 for unlimited.
    pub disk_limit: u64,
    /// When set the limit covers only what the image writes, not its base.
    pub exclude_base_from_quota: bool,
    pub owner: Option<StoreOwner>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageInfo {
    pub rootfs: PathBuf,
    pub base_size: u64,
    pub mount: Option<MountInfo>,
}

/// Storage backend for volumes and images.
///
/// Destruction must be idempotent: removing an absent volume or image
/// succeeds. Sizes are in bytes.
pub trait FilesystemDriver: Send + Sync {
    fn name(&self) -> &str;

    fn volume_path(&self, id: &VolumeId) -> PathBuf;

    fn volume_exists(&self, id: &VolumeId) -> bool {
        self.volume_path(id).is_dir()
    }

    /// Every volume physically present in the store.
    fn volumes(&self) -> Result<Vec<VolumeId>, DriverError>;

    /// Turn a fully unpacked staging directory into volume `id`.
    ///
    /// Returns `false` when the volume already existed; the staged content is
    /// then left in place for the caller to discard.
    fn create_volume(&self, id: &VolumeId, staged: &Path) -> Result<bool, DriverError>;

    /// Remove volume `id`. A volume is unlisted and unreachable through
    /// [`volume_exists`](Self::volume_exists) before any of its content is
    /// removed, so a destruction that fails halfway never leaves a damaged
    /// volume behind.
    fn destroy_volume(&self, id: &VolumeId) -> Result<(), DriverError>;

    /// Finish destructions that were cut short. Returns how many leftovers
    /// were removed.
    fn purge_trash(&self) -> Result<usize, DriverError> {
        Ok(0)
    }

    fn create_image(&self, spec: &ImageSpec) -> Result<ImageInfo, DriverError>;

    fn destroy_image(&self, image_path: &Path) -> Result<(), DriverError>;

    /// Total bytes consumed by volumes and images.
    fn measure_store_usage(&self) -> Result<u64, DriverError>;
}

pub fn select_driver(
    name: &str,
    layout: &StoreLayout,
) -> Result<Box<dyn FilesystemDriver>, DriverError> {
    match name {
        "dir" => Ok(Box::new(crate::dir::DirectoryDriver::new(layout.clone()))),
        "mock" => Ok(Box::new(crate::mock::MockDriver::new(layout.clone()))),
        other => Err(DriverError::Unavailable(other.to_owned())),
    }
}

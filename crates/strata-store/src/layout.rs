use crate::types::StoreOwner;
use crate::{write_atomic, StoreError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Current store format version. Incremented on incompatible layout changes.
pub const STORE_FORMAT_VERSION: u32 = 1;
const VERSION_FILE: &str = "version";

/// Directory layout of one strata store.
///
/// ```text
/// <root>/
///   volumes/<chain-id>/         unpacked layers, shared and immutable
///   images/<image-id>/          one materialized root filesystem per image
///   meta/dependencies/<id>.json image -> volume chain records
///   meta/cache/layers/          layer digest -> volume id
///   meta/cache/images/          base image reference -> volume chain
///   meta/namespace.json         uid/gid mappings the store was set up with
///   locks/<key>.lock            one lock file per lock key
///   staging/                    in-flight unpacks, invisible to collection
/// ```
#[derive(Debug, Clone)]
pub struct StoreLayout {
    root: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreVersion {
    format_version: u32,
}

impl StoreLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[inline]
    pub fn volumes_dir(&self) -> PathBuf {
        self.root.join("volumes")
    }

    #[inline]
    pub fn volume_path(&self, volume_id: &str) -> PathBuf {
        self.volumes_dir().join(volume_id)
    }

    #[inline]
    pub fn images_dir(&self) -> PathBuf {
        self.root.join("images")
    }

    #[inline]
    pub fn image_path(&self, image_id: &str) -> PathBuf {
        self.images_dir().join(image_id)
    }

    #[inline]
    pub fn meta_dir(&self) -> PathBuf {
        self.root.join("meta")
    }

    #[inline]
    pub fn dependencies_dir(&self) -> PathBuf {
        self.meta_dir().join("dependencies")
    }

    #[inline]
    pub fn cache_dir(&self) -> PathBuf {
        self.meta_dir().join("cache")
    }

    #[inline]
    pub fn namespace_file(&self) -> PathBuf {
        self.meta_dir().join("namespace.json")
    }

    #[inline]
    pub fn locks_dir(&self) -> PathBuf {
        self.root.join("locks")
    }

    #[inline]
    pub fn staging_dir(&self) -> PathBuf {
        self.root.join("staging")
    }

    fn version_file(&self) -> PathBuf {
        self.meta_dir().join(VERSION_FILE)
    }

    fn directories(&self) -> [PathBuf; 9] {
        [
            self.root.clone(),
            self.volumes_dir(),
            self.images_dir(),
            self.meta_dir(),
            self.dependencies_dir(),
            self.cache_dir().join("layers"),
            self.cache_dir().join("images"),
            self.locks_dir(),
            self.staging_dir(),
        ]
    }

    /// Whether the store has been initialized.
    pub fn is_initialized(&self) -> bool {
        self.version_file().exists()
    }

    /// Create the store tree and version marker. Idempotent.
    ///
    /// With an `owner`, an existing store root must already belong to that
    /// uid/gid; a freshly created tree is chowned to it when the process has
    /// the privilege to do so.
    pub fn initialize(&self, owner: Option<StoreOwner>) -> Result<(), StoreError> {
        if let Some(owner) = owner {
            self.verify_owner(owner)?;
        }

        for dir in self.directories() {
            fs::create_dir_all(&dir)?;
        }

        if let Some(owner) = owner {
            if StoreOwner::current().uid == 0 {
                for dir in self.directories() {
                    std::os::unix::fs::chown(&dir, Some(owner.uid), Some(owner.gid))?;
                }
            }
        }

        if self.version_file().exists() {
            self.verify_version()?;
        } else {
            debug!("initializing store at {}", self.root.display());
            let ver = StoreVersion {
                format_version: STORE_FORMAT_VERSION,
            };
            write_atomic(&self.version_file(), serde_json::to_string_pretty(&ver)?.as_bytes())?;
        }

        Ok(())
    }

    fn verify_owner(&self, owner: StoreOwner) -> Result<(), StoreError> {
        let meta = match fs::metadata(&self.root) {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if meta.uid() != owner.uid || meta.gid() != owner.gid {
            return Err(StoreError::OwnerMismatch {
                path: self.root.clone(),
                uid: owner.uid,
                gid: owner.gid,
                found_uid: meta.uid(),
                found_gid: meta.gid(),
            });
        }
        Ok(())
    }

    pub fn verify_version(&self) -> Result<(), StoreError> {
        let content = fs::read_to_string(self.version_file())?;
        let ver: StoreVersion = serde_json::from_str(&content)?;

        if ver.format_version != STORE_FORMAT_VERSION {
            return Err(StoreError::VersionMismatch {
                expected: STORE_FORMAT_VERSION,
                found: ver.format_version,
            });
        }
        Ok(())
    }
}

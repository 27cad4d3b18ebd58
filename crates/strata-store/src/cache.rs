//! Persistent index from layer digests and base image references to the
//! volumes they were unpacked into.
//!
//! Entries are hints, not truth: a volume named by the index may have been
//! collected since. Readers check the volume still exists before reusing it,
//! and collection prunes entries for the volumes it removes.

use crate::layout::StoreLayout;
use crate::types::{LayerDigest, VolumeId};
use crate::{write_atomic, StoreError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct LayerEntry {
    parent: Option<VolumeId>,
    digest: LayerDigest,
    volume: VolumeId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct ImageEntry {
    reference: String,
    volumes: Vec<VolumeId>,
}

#[derive(Debug, Clone)]
pub struct CacheIndex {
    layers_dir: PathBuf,
    images_dir: PathBuf,
}

fn key_for(value: &str) -> String {
    format!("{}.json", blake3::hash(value.as_bytes()).to_hex())
}

fn layer_key(parent: Option<&VolumeId>, digest: &LayerDigest) -> String {
    match parent {
        Some(parent) => key_for(&format!("{parent}/{digest}")),
        None => key_for(digest),
    }
}

fn read_entry<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Option<T>, StoreError> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn entry_paths(dir: &Path) -> Result<Vec<PathBuf>, StoreError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut paths = Vec::new();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        if name.to_str().is_some_and(|n| !n.starts_with('.')) {
            paths.push(entry.path());
        }
    }
    Ok(paths)
}

fn remove_entry(path: &Path) -> Result<bool, StoreError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

impl CacheIndex {
    pub fn new(layout: &StoreLayout) -> Self {
        let cache = layout.cache_dir();
        Self {
            layers_dir: cache.join("layers"),
            images_dir: cache.join("images"),
        }
    }

    /// Volume that layer `digest`, stacked on `parent`, was unpacked into.
    pub fn layer_volume(
        &self,
        parent: Option<&VolumeId>,
        digest: &LayerDigest,
    ) -> Result<Option<VolumeId>, StoreError> {
        let entry: Option<LayerEntry> = read_entry(&self.layers_dir.join(layer_key(parent, digest)))?;
        Ok(entry.map(|e| e.volume))
    }

    pub fn record_layer(
        &self,
        parent: Option<&VolumeId>,
        digest: &LayerDigest,
        volume: &VolumeId,
    ) -> Result<(), StoreError> {
        fs::create_dir_all(&self.layers_dir)?;
        let entry = LayerEntry {
            parent: parent.cloned(),
            digest: digest.clone(),
            volume: volume.clone(),
        };
        write_atomic(
            &self.layers_dir.join(layer_key(parent, digest)),
            serde_json::to_string_pretty(&entry)?.as_bytes(),
        )
    }

    /// Volume chain last pulled for `reference`.
    pub fn image_chain(&self, reference: &str) -> Result<Option<Vec<VolumeId>>, StoreError> {
        let entry: Option<ImageEntry> = read_entry(&self.images_dir.join(key_for(reference)))?;
        Ok(entry.map(|e| e.volumes))
    }

    pub fn record_image(&self, reference: &str, volumes: &[VolumeId]) -> Result<(), StoreError> {
        fs::create_dir_all(&self.images_dir)?;
        let entry = ImageEntry {
            reference: reference.to_owned(),
            volumes: volumes.to_vec(),
        };
        write_atomic(
            &self.images_dir.join(key_for(reference)),
            serde_json::to_string_pretty(&entry)?.as_bytes(),
        )
    }

    /// Drop every entry that points at `volume`. An image entry whose chain
    /// includes it is dropped whole, since the chain is no longer complete.
    /// Returns the number of entries removed.
    pub fn prune_volume(&self, volume: &VolumeId) -> Result<usize, StoreError> {
        let mut removed = 0;

        for path in entry_paths(&self.layers_dir)? {
            match read_entry::<LayerEntry>(&path) {
                Ok(Some(entry)) if entry.volume == *volume => {
                    removed += usize::from(remove_entry(&path)?);
                }
                Ok(_) => {}
                Err(e) => warn!("skipping unreadable cache entry {}: {e}", path.display()),
            }
        }

        for path in entry_paths(&self.images_dir)? {
            match read_entry::<ImageEntry>(&path) {
                Ok(Some(entry)) if entry.volumes.contains(volume) => {
                    removed += usize::from(remove_entry(&path)?);
                }
                Ok(_) => {}
                Err(e) => warn!("skipping unreadable cache entry {}: {e}", path.display()),
            }
        }

        if removed > 0 {
            debug!("pruned {removed} cache entries for volume {volume}");
        }
        Ok(removed)
    }
}

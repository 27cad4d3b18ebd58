use crate::layout::StoreLayout;
use crate::types::{ImageId, VolumeId};
use crate::{write_atomic, StoreError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;
use tracing::debug;

/// The ordered volume chain one image was built on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DependencyRecord {
    pub image_id: ImageId,
    pub volumes: Vec<VolumeId>,
    pub registered_at: String,
    /// blake3 over the record with this field unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl DependencyRecord {
    fn compute_checksum(&self) -> Result<String, StoreError> {
        let mut copy = self.clone();
        copy.checksum = None;
        let json = serde_json::to_string_pretty(&copy)?;
        Ok(blake3::hash(json.as_bytes()).to_hex().to_string())
    }
}

/// Persists one dependency record per image id, each in its own file so
/// unrelated ids never contend.
///
/// Nothing is cached in memory: every query reads the directory afresh,
/// because other processes change it underneath us.
#[derive(Debug, Clone)]
pub struct DependencyManager {
    dir: PathBuf,
}

impl DependencyManager {
    pub fn new(layout: &StoreLayout) -> Self {
        Self {
            dir: layout.dependencies_dir(),
        }
    }

    fn record_path(&self, image_id: &str) -> PathBuf {
        self.dir.join(format!("{image_id}.json"))
    }

    /// Persist `volumes` as the chain of `image_id`, replacing any previous
    /// record. Callers hold the global lock.
    pub fn register(&self, image_id: &ImageId, volumes: &[VolumeId]) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir)?;
        let mut record = DependencyRecord {
            image_id: image_id.clone(),
            volumes: volumes.to_vec(),
            registered_at: chrono::Utc::now().to_rfc3339(),
            checksum: None,
        };
        record.checksum = Some(record.compute_checksum()?);
        write_atomic(
            &self.record_path(image_id),
            serde_json::to_string_pretty(&record)?.as_bytes(),
        )?;
        debug!("registered {} volumes for image {image_id}", volumes.len());
        Ok(())
    }

    pub fn record(&self, image_id: &str) -> Result<DependencyRecord, StoreError> {
        let path = self.record_path(image_id);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::DependenciesNotFound(image_id.to_owned()));
            }
            Err(e) => return Err(e.into()),
        };
        let record: DependencyRecord = serde_json::from_str(&content)?;

        if let Some(ref expected) = record.checksum {
            let actual = record.compute_checksum()?;
            if actual != *expected {
                return Err(StoreError::IntegrityFailure {
                    name: image_id.to_owned(),
                    expected: expected.clone(),
                    actual,
                });
            }
        }
        Ok(record)
    }

    /// The volume chain registered for `image_id`, in registration order.
    pub fn dependencies(&self, image_id: &str) -> Result<Vec<VolumeId>, StoreError> {
        Ok(self.record(image_id)?.volumes)
    }

    /// Remove the record for `image_id`. Absent records are not an error.
    pub fn deregister(&self, image_id: &str) -> Result<(), StoreError> {
        match fs::remove_file(self.record_path(image_id)) {
            Ok(()) => {
                debug!("deregistered image {image_id}");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Ids of every image with a record, sorted.
    pub fn image_ids(&self) -> Result<Vec<ImageId>, StoreError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            // Temp files from in-flight atomic writes start with a dot.
            if name.starts_with('.') {
                continue;
            }
            if let Some(id) = name.strip_suffix(".json") {
                ids.push(ImageId::new(id));
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Union of every volume named by any existing record.
    ///
    /// A record that disappears between listing and reading was deregistered
    /// concurrently and is skipped. Any other unreadable record fails the
    /// whole query: treating it as empty could let a live volume be
    /// collected.
    pub fn all_referenced(&self) -> Result<BTreeSet<VolumeId>, StoreError> {
        let mut referenced = BTreeSet::new();
        for id in self.image_ids()? {
            match self.dependencies(&id) {
                Ok(volumes) => referenced.extend(volumes),
                Err(StoreError::DependenciesNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(referenced)
    }
}

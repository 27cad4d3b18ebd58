use crate::layout::StoreLayout;
use crate::types::IdMapping;
use crate::{write_atomic, StoreError};
use serde::{Deserialize, Serialize};
use std::fs;
use tracing::debug;

/// The uid/gid mappings every image in one store shares. Layers are
/// unpacked with ownership already translated, so mixing mappings in one
/// store would hand images files owned by the wrong host ids.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NamespaceRecord {
    pub uid_mappings: Vec<IdMapping>,
    pub gid_mappings: Vec<IdMapping>,
}

impl NamespaceRecord {
    pub fn new(uid_mappings: &[IdMapping], gid_mappings: &[IdMapping]) -> Self {
        Self {
            uid_mappings: uid_mappings.to_vec(),
            gid_mappings: gid_mappings.to_vec(),
        }
    }

    pub fn load(layout: &StoreLayout) -> Result<Option<Self>, StoreError> {
        match fs::read_to_string(layout.namespace_file()) {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Record these mappings if the store has none yet, otherwise require
    /// they match the recorded ones. Callers hold the global lock so two
    /// first-time writers cannot race.
    pub fn check_or_record(&self, layout: &StoreLayout) -> Result<(), StoreError> {
        match Self::load(layout)? {
            Some(existing) if existing == *self => Ok(()),
            Some(_) => Err(StoreError::NamespaceMismatch),
            None => {
                fs::create_dir_all(layout.meta_dir())?;
                write_atomic(
                    &layout.namespace_file(),
                    serde_json::to_string_pretty(self)?.as_bytes(),
                )?;
                debug!("recorded store namespace at {}", layout.namespace_file().display());
                Ok(())
            }
        }
    }
}

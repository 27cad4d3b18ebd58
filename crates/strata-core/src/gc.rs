use crate::fetcher::BaseImageRef;
use crate::{CoreError, VolumeFailure};
use std::collections::BTreeSet;
use std::fs;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use strata_driver::{remove_tree, FilesystemDriver};
use strata_store::{CacheIndex, DependencyManager, StoreLayout, VolumeId};
use tracing::{debug, info, info_span, warn};

/// Staging entries untouched for this long belong to a create that died.
pub const STALE_STAGING_AGE: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct GcReport {
    pub unreferenced: Vec<VolumeId>,
    pub removed: Vec<VolumeId>,
    pub removed_staging: usize,
    /// Leftovers of earlier destructions that were cut short.
    pub purged_trash: usize,
}

/// Volumes in `all` that nothing in `referenced` keeps alive, in listing order.
pub fn unreferenced_volumes(all: &[VolumeId], referenced: &BTreeSet<VolumeId>) -> Vec<VolumeId> {
    all.iter()
        .filter(|v| !referenced.contains(*v))
        .cloned()
        .collect()
}

/// Removes volumes no image depends on.
///
/// Callers must hold the global lock: the referenced set is only meaningful
/// while no create can register new dependencies.
#[derive(Clone)]
pub struct GarbageCollector {
    layout: StoreLayout,
    driver: Arc<dyn FilesystemDriver>,
    dependencies: DependencyManager,
    cache: CacheIndex,
}

impl GarbageCollector {
    pub fn new(layout: StoreLayout, driver: Arc<dyn FilesystemDriver>) -> Self {
        Self {
            dependencies: DependencyManager::new(&layout),
            cache: CacheIndex::new(&layout),
            layout,
            driver,
        }
    }

    /// Every volume some image or some kept base image still needs.
    pub fn referenced_volumes(
        &self,
        keep_images: &[String],
    ) -> Result<BTreeSet<VolumeId>, CoreError> {
        let mut referenced = self.dependencies.all_referenced()?;
        for image in keep_images {
            let key = BaseImageRef::parse(image).map_or_else(|_| image.clone(), |r| r.cache_key());
            match self.cache.image_chain(&key)? {
                Some(chain) => {
                    debug!("keeping {} volumes of {image}", chain.len());
                    referenced.extend(chain);
                }
                None => debug!("kept image {image} has no volumes in the store"),
            }
        }
        Ok(referenced)
    }

    pub fn collect(&self, keep_images: &[String]) -> Result<GcReport, CoreError> {
        let _span = info_span!("collect").entered();

        let referenced = self.referenced_volumes(keep_images)?;
        let all = self.driver.volumes()?;
        let mut report = GcReport {
            unreferenced: unreferenced_volumes(&all, &referenced),
            ..GcReport::default()
        };
        info!(
            "{} of {} volumes unreferenced",
            report.unreferenced.len(),
            all.len()
        );

        let mut failed = Vec::new();
        for volume in &report.unreferenced {
            match self.driver.destroy_volume(volume) {
                Ok(()) => report.removed.push(volume.clone()),
                Err(e) => {
                    warn!("failed to destroy volume {volume}: {e}");
                    failed.push(VolumeFailure {
                        volume: volume.clone(),
                        reason: e.to_string(),
                    });
                    if self.driver.volume_exists(volume) {
                        continue;
                    }
                }
            }
            self.prune_cache(volume);
        }

        report.purged_trash = match self.driver.purge_trash() {
            Ok(n) => n,
            Err(e) => {
                warn!("failed to purge destroyed volumes: {e}");
                0
            }
        };
        report.removed_staging = self.sweep_staging(STALE_STAGING_AGE);

        if failed.is_empty() {
            Ok(report)
        } else {
            Err(CoreError::PartialCollection { report, failed })
        }
    }

    fn prune_cache(&self, volume: &VolumeId) {
        match self.cache.prune_volume(volume) {
            Ok(0) => {}
            Ok(n) => debug!("pruned {n} cache entries for volume {volume}"),
            // The volume is gone; a stale entry only costs a re-unpack.
            Err(e) => warn!("failed to prune cache entries for volume {volume}: {e}"),
        }
    }

    /// Remove staging entries older than `max_age`. Failures are logged and
    /// skipped.
    pub fn sweep_staging(&self, max_age: Duration) -> usize {
        let entries = match fs::read_dir(self.layout.staging_dir()) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return 0,
            Err(e) => {
                warn!("failed to list staging directory: {e}");
                return 0;
            }
        };

        let now = SystemTime::now();
        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            let age = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|mtime| now.duration_since(mtime).ok());
            if !matches!(age, Some(age) if age >= max_age) {
                continue;
            }
            let result = if path.is_dir() {
                remove_tree(&path)
            } else {
                fs::remove_file(&path)
            };
            match result {
                Ok(()) => {
                    debug!("removed stale staging entry {}", path.display());
                    removed += 1;
                }
                Err(e) => warn!("failed to remove staging entry {}: {e}", path.display()),
            }
        }
        removed
    }
}

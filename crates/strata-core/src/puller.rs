use crate::fetcher::{BaseImageRef, Fetcher, LayerInfo, PullError};
use crate::CoreError;
use std::sync::Arc;
use strata_driver::{remove_tree, unpack_layer, FilesystemDriver};
use strata_store::{chain_id, CacheIndex, IdMapping, StoreLayout, VolumeId};
use tempfile::TempDir;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct PullSpec {
    pub base_image: BaseImageRef,
    pub uid_mappings: Vec<IdMapping>,
    pub gid_mappings: Vec<IdMapping>,
}

/// A base image whose missing layers have been unpacked into staging but
/// not yet published as volumes.
#[derive(Debug)]
pub struct StagedPull {
    layers: Vec<StagedLayer>,
}

#[derive(Debug)]
struct StagedLayer {
    info: LayerInfo,
    parent: Option<VolumeId>,
    volume: VolumeId,
    /// `None` when the volume already existed at staging time.
    staged: Option<TempDir>,
}

impl StagedPull {
    /// Number of layers that needed unpacking.
    pub fn unpacked_layers(&self) -> usize {
        self.layers.iter().filter(|l| l.staged.is_some()).count()
    }

    pub fn volumes(&self) -> Vec<VolumeId> {
        self.layers.iter().map(|l| l.volume.clone()).collect()
    }
}

/// Turns a base image reference into an ordered chain of volumes, reusing
/// volumes already in the store.
///
/// Pulling is split in two so that fetch and unpack time stays outside the
/// global lock: [`stage`](Self::stage) runs unlocked and only writes under
/// `staging/`, which collection never inspects; [`commit`](Self::commit)
/// runs under the global lock and publishes staged layers as volumes.
#[derive(Clone)]
pub struct BaseImagePuller {
    layout: StoreLayout,
    driver: Arc<dyn FilesystemDriver>,
    fetcher: Arc<dyn Fetcher>,
    cache: CacheIndex,
}

impl BaseImagePuller {
    pub fn new(
        layout: StoreLayout,
        driver: Arc<dyn FilesystemDriver>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Self {
        let cache = CacheIndex::new(&layout);
        Self {
            layout,
            driver,
            fetcher,
            cache,
        }
    }

    pub fn stage(&self, spec: &PullSpec) -> Result<StagedPull, CoreError> {
        let info = self.fetcher.base_image_info(&spec.base_image)?;

        let mut layers = Vec::with_capacity(info.layers.len());
        let mut parent: Option<VolumeId> = None;
        for layer in info.layers {
            let volume = chain_id(parent.as_ref(), &layer.digest);
            let cached = self.cache.layer_volume(parent.as_ref(), &layer.digest)?;
            let staged = if cached.as_ref() == Some(&volume) && self.driver.volume_exists(&volume)
            {
                debug!("layer {} cached as volume {volume}", layer.digest);
                None
            } else {
                Some(self.unpack(spec, &layer)?)
            };
            layers.push(StagedLayer {
                info: layer,
                parent: parent.replace(volume.clone()),
                volume,
                staged,
            });
        }
        Ok(StagedPull { layers })
    }

    /// Publish staged layers and return the volume chain. The caller must
    /// hold the global lock.
    pub fn commit(&self, spec: &PullSpec, staged: StagedPull) -> Result<Vec<VolumeId>, CoreError> {
        let mut chain = Vec::with_capacity(staged.layers.len());
        for layer in staged.layers {
            if self.driver.volume_exists(&layer.volume) {
                if let Some(dir) = layer.staged {
                    discard(dir);
                }
            } else {
                let dir = match layer.staged {
                    Some(dir) => dir,
                    None => {
                        info!(
                            "volume {} was collected after it was found cached, unpacking again",
                            layer.volume
                        );
                        self.unpack(spec, &layer.info)?
                    }
                };
                if self.driver.create_volume(&layer.volume, dir.path())? {
                    info!("created volume {} for layer {}", layer.volume, layer.info.digest);
                } else {
                    discard(dir);
                }
            }
            self.cache
                .record_layer(layer.parent.as_ref(), &layer.info.digest, &layer.volume)?;
            chain.push(layer.volume);
        }
        self.cache.record_image(&spec.base_image.cache_key(), &chain)?;
        Ok(chain)
    }

    /// Stage and commit in one go. The caller must hold the global lock for
    /// the whole call.
    pub fn pull(&self, spec: &PullSpec) -> Result<Vec<VolumeId>, CoreError> {
        let staged = self.stage(spec)?;
        self.commit(spec, staged)
    }

    fn unpack(&self, spec: &PullSpec, layer: &LayerInfo) -> Result<TempDir, CoreError> {
        std::fs::create_dir_all(self.layout.staging_dir())?;
        let dir = tempfile::Builder::new()
            .prefix("layer-")
            .tempdir_in(self.layout.staging_dir())?;
        let mut blob = self.fetcher.stream_blob(&spec.base_image, layer)?;
        let entries = unpack_layer(
            &mut blob,
            dir.path(),
            &spec.uid_mappings,
            &spec.gid_mappings,
        )?;
        // Read past the end-of-archive padding so the fetcher sees every byte
        // and can check the blob against its digest.
        std::io::copy(&mut blob, &mut std::io::sink()).map_err(|e| PullError::Malformed {
            reference: spec.base_image.to_string(),
            reason: format!("layer {}: {e}", layer.digest),
        })?;
        debug!("staged layer {} ({entries} entries)", layer.digest);
        Ok(dir)
    }
}

/// Drop a staged copy nobody needs. Layers may hold read-only directories
/// that `TempDir`'s own cleanup cannot remove.
fn discard(dir: TempDir) {
    if let Err(e) = remove_tree(dir.path()) {
        warn!("failed to discard staged layer {}: {e}", dir.path().display());
    }
}

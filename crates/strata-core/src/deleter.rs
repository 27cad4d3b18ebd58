use crate::metrics::{MetricsEmitter, METRIC_DELETE_TIME};
use crate::{release, CoreError};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use strata_driver::FilesystemDriver;
use strata_store::{
    image_lock_key, validate_image_id, DependencyManager, Locksmith, StoreError, StoreLayout,
};
use tracing::{info, info_span, warn};

/// Removes one image and its dependency record. Shared volumes are left for
/// the garbage collector.
#[derive(Clone)]
pub struct Deleter {
    layout: StoreLayout,
    locksmith: Locksmith,
    driver: Arc<dyn FilesystemDriver>,
    dependencies: DependencyManager,
    metrics: Arc<dyn MetricsEmitter>,
}

impl Deleter {
    pub fn new(
        layout: StoreLayout,
        driver: Arc<dyn FilesystemDriver>,
        metrics: Arc<dyn MetricsEmitter>,
    ) -> Self {
        Self {
            locksmith: Locksmith::new(&layout),
            dependencies: DependencyManager::new(&layout),
            layout,
            driver,
            metrics,
        }
    }

    pub fn delete(&self, id: &str) -> Result<(), CoreError> {
        validate_image_id(id)?;
        let _span = info_span!("delete", id).entered();
        let start = Instant::now();

        let lock = self.locksmith.lock(&image_lock_key(id))?;
        let result = self.delete_locked(id);
        release(lock);

        if result.is_ok() {
            self.metrics
                .try_emit_duration(METRIC_DELETE_TIME, start.elapsed());
        }
        result
    }

    fn delete_locked(&self, id: &str) -> Result<(), CoreError> {
        let image_path = self.layout.image_path(id);
        if !image_path.is_dir() {
            // A delete that died between destroying the image and dropping
            // the record leaves the record behind; drop it now so its
            // volumes become collectable.
            match self.dependencies.record(id) {
                Ok(_) => {
                    warn!("image {id} is gone but its dependency record is not, removing it");
                    self.dependencies.deregister(id)?;
                }
                Err(StoreError::DependenciesNotFound(_)) => {}
                Err(e) => warn!("failed to inspect dependency record of {id}: {e}"),
            }
            return Err(CoreError::ImageNotFound(id.to_owned()));
        }

        self.driver.destroy_image(&image_path)?;
        self.dependencies.deregister(id)?;
        info!("deleted image {id}");
        Ok(())
    }

    /// Map a delete argument to an image id. Anything containing a path
    /// separator must name a directory directly under `images/`.
    pub fn resolve_id(&self, id_or_path: &str) -> Result<String, CoreError> {
        if !id_or_path.contains('/') {
            return Ok(id_or_path.to_owned());
        }
        let path = Path::new(id_or_path);
        let images_dir = self.layout.images_dir();
        let parent_matches = path
            .parent()
            .map(|p| p == images_dir || same_file(p, &images_dir))
            .unwrap_or(false);
        match path.file_name().and_then(|n| n.to_str()) {
            Some(name) if parent_matches => Ok(name.to_owned()),
            _ => Err(StoreError::InvalidId(format!(
                "{id_or_path} is not an image path in {}",
                images_dir.display()
            ))
            .into()),
        }
    }
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::RecordingEmitter;
    use strata_driver::MockDriver;
    use strata_store::{ImageId, VolumeId};

    fn setup() -> (tempfile::TempDir, StoreLayout, Arc<RecordingEmitter>, Deleter) {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path().join("store"));
        layout.initialize(None).unwrap();
        let metrics = Arc::new(RecordingEmitter::new());
        let deleter = Deleter::new(
            layout.clone(),
            Arc::new(MockDriver::new(layout.clone())),
            metrics.clone(),
        );
        (dir, layout, metrics, deleter)
    }

    fn fake_image(layout: &StoreLayout, id: &str, volumes: &[&str]) {
        std::fs::create_dir_all(layout.image_path(id).join("rootfs")).unwrap();
        let chain: Vec<VolumeId> = volumes.iter().map(|v| VolumeId::from(*v)).collect();
        DependencyManager::new(layout)
            .register(&ImageId::from(id), &chain)
            .unwrap();
    }

    #[test]
    fn delete_removes_image_and_record_but_not_volumes() {
        let (_dir, layout, metrics, deleter) = setup();
        std::fs::create_dir_all(layout.volume_path("v1")).unwrap();
        fake_image(&layout, "img", &["v1"]);

        deleter.delete("img").unwrap();
        assert!(!layout.image_path("img").exists());
        assert!(matches!(
            DependencyManager::new(&layout).dependencies("img"),
            Err(StoreError::DependenciesNotFound(_))
        ));
        assert!(layout.volume_path("v1").is_dir());
        assert_eq!(metrics.names(), vec![METRIC_DELETE_TIME]);
    }

    #[test]
    fn unknown_image_is_not_found() {
        let (_dir, _layout, metrics, deleter) = setup();
        assert!(matches!(
            deleter.delete("ghost"),
            Err(CoreError::ImageNotFound(id)) if id == "ghost"
        ));
        assert!(metrics.names().is_empty());
    }

    #[test]
    fn leftover_record_is_dropped_on_not_found() {
        let (_dir, layout, _metrics, deleter) = setup();
        DependencyManager::new(&layout)
            .register(&ImageId::from("half"), &[VolumeId::from("v1")])
            .unwrap();
        assert!(matches!(
            deleter.delete("half"),
            Err(CoreError::ImageNotFound(_))
        ));
        assert!(DependencyManager::new(&layout)
            .all_referenced()
            .unwrap()
            .is_empty());
    }

    #[test]
    fn invalid_id_rejected_before_locking() {
        let (_dir, layout, _metrics, deleter) = setup();
        assert!(matches!(
            deleter.delete("../etc"),
            Err(CoreError::Store(StoreError::InvalidId(_)))
        ));
        assert!(!layout.locks_dir().join("image.../etc.lock").exists());
    }

    #[test]
    fn resolves_ids_and_image_paths() {
        let (_dir, layout, _metrics, deleter) = setup();
        assert_eq!(deleter.resolve_id("plain").unwrap(), "plain");
        let path = layout.image_path("from-path");
        assert_eq!(
            deleter.resolve_id(path.to_str().unwrap()).unwrap(),
            "from-path"
        );
        assert!(deleter.resolve_id("/tmp/elsewhere/img").is_err());
    }
}

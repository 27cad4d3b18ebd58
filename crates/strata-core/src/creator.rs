use crate::cleaner::Cleaner;
use crate::fetcher::BaseImageRef;
use crate::metrics::{MetricsEmitter, METRIC_CREATE_TIME};
use crate::puller::{BaseImagePuller, PullSpec};
use crate::{release, CoreError};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use strata_driver::{FilesystemDriver, ImageSpec, MountInfo};
use strata_store::{
    image_lock_key, validate_image_id, DependencyManager, IdMapping, ImageId, Locksmith,
    NamespaceRecord, StoreError, StoreLayout, StoreOwner, VolumeId, GLOBAL_LOCK_KEY,
};
use tracing::{debug, info, info_span, warn};

pub const IMAGE_METADATA_FILE: &str = "image.json";

#[derive(Debug, Clone, Default)]
pub struct CreateSpec {
    pub id: String,
    pub base_image: String,
    /// Bytes, 0 for unlimited.
    pub disk_limit: u64,
    pub exclude_base_from_quota: bool,
    pub uid_mappings: Vec<IdMapping>,
    pub gid_mappings: Vec<IdMapping>,
    pub clean_on_create: bool,
    pub clean_threshold: u64,
    pub clean_keep_images: Vec<String>,
}

/// A materialized image, as recorded in its `image.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Image {
    pub id: ImageId,
    pub path: PathBuf,
    pub rootfs: PathBuf,
    pub base_image: String,
    /// Bottom layer first.
    pub volumes: Vec<VolumeId>,
    #[serde(default)]
    pub mount: Option<MountInfo>,
    pub disk_limit: u64,
    pub exclude_base_from_quota: bool,
    pub created_at: String,
}

impl Image {
    pub fn load(layout: &StoreLayout, id: &str) -> Result<Self, CoreError> {
        let path = layout.image_path(id).join(IMAGE_METADATA_FILE);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CoreError::ImageNotFound(id.to_owned()))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_str(&content)?)
    }

    fn save(&self) -> Result<(), CoreError> {
        let mut tmp = tempfile::NamedTempFile::new_in(&self.path)?;
        tmp.write_all(serde_json::to_string_pretty(self)?.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(self.path.join(IMAGE_METADATA_FILE))
            .map_err(|e| CoreError::Io(e.error))?;
        Ok(())
    }
}

/// Builds images: pull and register under the global lock, materialize
/// outside it, roll the registration back if materializing fails.
#[derive(Clone)]
pub struct Creator {
    layout: StoreLayout,
    locksmith: Locksmith,
    driver: Arc<dyn FilesystemDriver>,
    dependencies: DependencyManager,
    puller: BaseImagePuller,
    cleaner: Cleaner,
    metrics: Arc<dyn MetricsEmitter>,
}

impl Creator {
    pub fn new(
        layout: StoreLayout,
        driver: Arc<dyn FilesystemDriver>,
        puller: BaseImagePuller,
        cleaner: Cleaner,
        metrics: Arc<dyn MetricsEmitter>,
    ) -> Self {
        Self {
            locksmith: Locksmith::new(&layout),
            dependencies: DependencyManager::new(&layout),
            layout,
            driver,
            puller,
            cleaner,
            metrics,
        }
    }

    pub fn create(&self, spec: &CreateSpec) -> Result<Image, CoreError> {
        validate_image_id(&spec.id)?;
        let base_image = BaseImageRef::parse(&spec.base_image)?;
        let owner = StoreOwner::from_mappings(&spec.uid_mappings, &spec.gid_mappings)?;

        let _span = info_span!("create", id = %spec.id).entered();
        let start = Instant::now();
        info!("creating image {} from {base_image}", spec.id);

        // Mappings of later creates are policed by the namespace record, not
        // by store ownership.
        if self.layout.is_initialized() {
            self.layout.verify_version()?;
        } else {
            self.layout.initialize(Some(owner))?;
        }

        let lock = self.locksmith.lock(&image_lock_key(&spec.id))?;
        let result = self.create_locked(spec, base_image, owner);
        release(lock);

        if result.is_ok() {
            self.metrics
                .try_emit_duration(METRIC_CREATE_TIME, start.elapsed());
        }
        result
    }

    fn create_locked(
        &self,
        spec: &CreateSpec,
        base_image: BaseImageRef,
        owner: StoreOwner,
    ) -> Result<Image, CoreError> {
        let id = ImageId::new(spec.id.as_str());
        let image_path = self.layout.image_path(&id);
        if image_path.exists() {
            return Err(CoreError::AlreadyExists(spec.id.clone()));
        }

        let namespace = NamespaceRecord::new(&spec.uid_mappings, &spec.gid_mappings);
        // Fail before pulling anything; re-checked under the global lock.
        if let Some(existing) = NamespaceRecord::load(&self.layout)? {
            if existing != namespace {
                return Err(StoreError::NamespaceMismatch.into());
            }
        }

        if spec.clean_on_create {
            match self
                .cleaner
                .clean(spec.clean_threshold, &spec.clean_keep_images)
            {
                Ok(report) if report.skipped => debug!("clean on create skipped"),
                Ok(_) => {}
                Err(CoreError::PartialCollection { failed, .. }) => {
                    warn!("clean on create left {} volumes behind", failed.len());
                }
                Err(e) => return Err(e),
            }
        }

        let pull = PullSpec {
            base_image,
            uid_mappings: spec.uid_mappings.clone(),
            gid_mappings: spec.gid_mappings.clone(),
        };
        let staged = self.puller.stage(&pull)?;

        let global = self.locksmith.lock(GLOBAL_LOCK_KEY)?;
        let registered = (|| -> Result<Vec<VolumeId>, CoreError> {
            namespace.check_or_record(&self.layout)?;
            let chain = self.puller.commit(&pull, staged)?;
            self.dependencies.register(&id, &chain)?;
            Ok(chain)
        })();
        release(global);
        let chain = registered?;
        debug!("registered {} volumes for image {id}", chain.len());

        match self.materialize(spec, &id, &image_path, chain, owner) {
            Ok(image) => {
                info!("created image {id} at {}", image.path.display());
                Ok(image)
            }
            Err(cause) => Err(self.rollback(&id, &image_path, cause)),
        }
    }

    fn materialize(
        &self,
        spec: &CreateSpec,
        id: &ImageId,
        image_path: &Path,
        chain: Vec<VolumeId>,
        owner: StoreOwner,
    ) -> Result<Image, CoreError> {
        let info = self.driver.create_image(&ImageSpec {
            image_path: image_path.to_path_buf(),
            base_volumes: chain.clone(),
            disk_limit: spec.disk_limit,
            exclude_base_from_quota: spec.exclude_base_from_quota,
            owner: Some(owner),
        })?;
        let image = Image {
            id: id.clone(),
            path: image_path.to_path_buf(),
            rootfs: info.rootfs,
            base_image: spec.base_image.clone(),
            volumes: chain,
            mount: info.mount,
            disk_limit: spec.disk_limit,
            exclude_base_from_quota: spec.exclude_base_from_quota,
            created_at: chrono::Utc::now().to_rfc3339(),
        };
        image.save()?;
        Ok(image)
    }

    /// Undo the registration of a failed create. Both cleanup steps are
    /// attempted; the first failure is reported alongside `cause`.
    fn rollback(&self, id: &ImageId, image_path: &Path, cause: CoreError) -> CoreError {
        warn!("materializing image {id} failed, rolling back: {cause}");
        let destroyed = self.driver.destroy_image(image_path).map_err(CoreError::from);
        let deregistered = self.dependencies.deregister(id).map_err(CoreError::from);
        match destroyed.and(deregistered) {
            Ok(()) => cause,
            Err(cleanup) => {
                warn!("rollback of image {id} failed: {cleanup}");
                CoreError::Rollback {
                    cause: Box::new(cause),
                    cleanup: Box::new(cleanup),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::LocalFetcher;
    use crate::gc::GarbageCollector;
    use crate::measurer::StoreMeasurer;
    use crate::metrics::RecordingEmitter;
    use std::fs::File;
    use strata_driver::{DriverError, MockDriver};

    struct Fixture {
        _dir: tempfile::TempDir,
        layout: StoreLayout,
        driver: Arc<MockDriver>,
        metrics: Arc<RecordingEmitter>,
        creator: Creator,
        base: String,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path().join("store"));
        let base = dir.path().join("base.tar");
        let mut builder = tar::Builder::new(File::create(&base).unwrap());
        let data = b"hello";
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "etc/motd", &data[..])
            .unwrap();
        builder.finish().unwrap();

        let driver = Arc::new(MockDriver::new(layout.clone()));
        let metrics = Arc::new(RecordingEmitter::new());
        let puller = BaseImagePuller::new(layout.clone(), driver.clone(), Arc::new(LocalFetcher));
        let cleaner = Cleaner::new(
            Locksmith::new(&layout),
            StoreMeasurer::new(driver.clone()),
            GarbageCollector::new(layout.clone(), driver.clone()),
            metrics.clone(),
        );
        let creator = Creator::new(
            layout.clone(),
            driver.clone(),
            puller,
            cleaner,
            metrics.clone(),
        );
        Fixture {
            base: base.to_str().unwrap().to_owned(),
            _dir: dir,
            layout,
            driver,
            metrics,
            creator,
        }
    }

    fn spec(fx: &Fixture, id: &str) -> CreateSpec {
        CreateSpec {
            id: id.to_owned(),
            base_image: fx.base.clone(),
            ..CreateSpec::default()
        }
    }

    #[test]
    fn create_materializes_and_records() {
        let fx = fixture();
        let image = fx.creator.create(&spec(&fx, "img")).unwrap();
        assert_eq!(image.volumes.len(), 1);
        assert_eq!(
            std::fs::read_to_string(image.rootfs.join("etc/motd")).unwrap(),
            "hello"
        );
        assert_eq!(Image::load(&fx.layout, "img").unwrap(), image);
        assert_eq!(
            DependencyManager::new(&fx.layout).dependencies("img").unwrap(),
            image.volumes
        );
        assert_eq!(fx.metrics.names(), vec![METRIC_CREATE_TIME]);
    }

    #[test]
    fn duplicate_id_fails_and_keeps_first_image() {
        let fx = fixture();
        let first = fx.creator.create(&spec(&fx, "dup")).unwrap();
        assert!(matches!(
            fx.creator.create(&spec(&fx, "dup")),
            Err(CoreError::AlreadyExists(id)) if id == "dup"
        ));
        assert_eq!(Image::load(&fx.layout, "dup").unwrap(), first);
    }

    #[test]
    fn quota_failure_rolls_back_registration() {
        let fx = fixture();
        fx.driver.fail_create_image_with_quota();
        let err = fx
            .creator
            .create(&CreateSpec {
                disk_limit: 1,
                ..spec(&fx, "tiny")
            })
            .unwrap_err();
        assert!(err.is_quota_exceeded());
        assert!(!fx.layout.image_path("tiny").exists());
        assert!(DependencyManager::new(&fx.layout)
            .all_referenced()
            .unwrap()
            .is_empty());
        assert!(fx.metrics.names().is_empty());
    }

    #[test]
    fn namespace_mismatch_rejected() {
        let fx = fixture();
        fx.creator.create(&spec(&fx, "plain")).unwrap();
        let mapped = CreateSpec {
            uid_mappings: vec!["0:1000:1".parse().unwrap()],
            gid_mappings: vec!["0:1000:1".parse().unwrap()],
            ..spec(&fx, "mapped")
        };
        let err = fx.creator.create(&mapped).unwrap_err();
        assert!(err.is_namespace_mismatch(), "{err}");
        assert!(!fx.layout.image_path("mapped").exists());
    }

    #[test]
    fn clean_on_create_collects_orphans_first() {
        let fx = fixture();
        std::fs::create_dir_all(fx.layout.volume_path("orphan")).unwrap();
        fx.creator
            .create(&CreateSpec {
                clean_on_create: true,
                ..spec(&fx, "fresh")
            })
            .unwrap();
        assert!(!fx.layout.volume_path("orphan").exists());
    }

    #[test]
    fn missing_base_image_surfaces_pull_error() {
        let fx = fixture();
        let err = fx
            .creator
            .create(&CreateSpec {
                base_image: "/nonexistent/base.tar".to_owned(),
                ..spec(&fx, "nobase")
            })
            .unwrap_err();
        assert!(err.pull_error().is_some(), "{err}");
        assert!(!fx.layout.image_path("nobase").exists());
    }

    #[test]
    fn rollback_error_carries_both_failures() {
        let fx = fixture();
        let cause = CoreError::Driver(DriverError::QuotaExceeded {
            limit: 1,
            required: 2,
        });
        // Dependency records are files, so a directory in the way makes
        // deregistration fail.
        let id = ImageId::new("stuck");
        std::fs::create_dir_all(fx.layout.dependencies_dir().join("stuck.json/x")).unwrap();
        let err = fx
            .creator
            .rollback(&id, &fx.layout.image_path(&id), cause);
        match err {
            CoreError::Rollback { cause, .. } => assert!(cause.is_quota_exceeded()),
            other => panic!("expected rollback error, got {other}"),
        }
    }
}

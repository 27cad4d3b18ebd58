use crate::backend::{FilesystemDriver, ImageInfo, ImageSpec};
use crate::dir::{remove_any, DirectoryDriver};
use crate::DriverError;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use strata_store::{StoreLayout, VolumeId};

#[derive(Debug, Default)]
struct MockState {
    failing_volumes: HashSet<VolumeId>,
    interrupted_volumes: HashSet<VolumeId>,
    image_failure: Option<DriverFailure>,
    usage: Option<u64>,
    destroyed: Vec<VolumeId>,
    measure_calls: usize,
}

#[derive(Debug, Clone, Copy)]
enum DriverFailure {
    Quota,
    Io,
}

/// Directory driver with switches for injecting failures and faking the
/// measured store size.
pub struct MockDriver {
    inner: DirectoryDriver,
    state: Mutex<MockState>,
}

impl MockDriver {
    pub fn new(layout: StoreLayout) -> Self {
        Self {
            inner: DirectoryDriver::new(layout),
            state: Mutex::new(MockState::default()),
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, MockState>, DriverError> {
        self.state
            .lock()
            .map_err(|e| DriverError::Injected(format!("mutex poisoned: {e}")))
    }

    /// Make every destruction of `id` fail.
    pub fn fail_destroy_volume(&self, id: &VolumeId) {
        if let Ok(mut state) = self.state() {
            state.failing_volumes.insert(id.clone());
        }
    }

    /// Make every destruction of `id` stop partway: the volume is taken out
    /// of the store and some of its content removed before the call fails.
    pub fn interrupt_destroy_volume(&self, id: &VolumeId) {
        if let Ok(mut state) = self.state() {
            state.interrupted_volumes.insert(id.clone());
        }
    }

    /// Make the next image creations fail as if the disk limit were hit.
    pub fn fail_create_image_with_quota(&self) {
        if let Ok(mut state) = self.state() {
            state.image_failure = Some(DriverFailure::Quota);
        }
    }

    /// Make the next image creations fail with an I/O error.
    pub fn fail_create_image(&self) {
        if let Ok(mut state) = self.state() {
            state.image_failure = Some(DriverFailure::Io);
        }
    }

    pub fn clear_failures(&self) {
        if let Ok(mut state) = self.state() {
            state.failing_volumes.clear();
            state.interrupted_volumes.clear();
            state.image_failure = None;
        }
    }

    /// Report `bytes` from every usage measurement instead of walking disk.
    pub fn set_usage(&self, bytes: u64) {
        if let Ok(mut state) = self.state() {
            state.usage = Some(bytes);
        }
    }

    /// Volumes successfully destroyed so far, in order.
    pub fn destroyed_volumes(&self) -> Vec<VolumeId> {
        self.state().map(|s| s.destroyed.clone()).unwrap_or_default()
    }

    pub fn measure_calls(&self) -> usize {
        self.state().map(|s| s.measure_calls).unwrap_or_default()
    }
}

impl FilesystemDriver for MockDriver {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn volume_path(&self, id: &VolumeId) -> PathBuf {
        self.inner.volume_path(id)
    }

    fn volumes(&self) -> Result<Vec<VolumeId>, DriverError> {
        self.inner.volumes()
    }

    fn create_volume(&self, id: &VolumeId, staged: &Path) -> Result<bool, DriverError> {
        self.inner.create_volume(id, staged)
    }

    fn destroy_volume(&self, id: &VolumeId) -> Result<(), DriverError> {
        let (failing, interrupted) = {
            let state = self.state()?;
            (
                state.failing_volumes.contains(id),
                state.interrupted_volumes.contains(id),
            )
        };
        if failing {
            return Err(DriverError::Injected(format!(
                "injected failure destroying volume {id}"
            )));
        }
        if interrupted {
            if let Some(trash) = self.inner.retire_volume(id)? {
                if let Some(entry) = std::fs::read_dir(&trash)?.next() {
                    remove_any(&entry?.path())?;
                }
            }
            return Err(DriverError::Injected(format!(
                "injected failure partway through destroying volume {id}"
            )));
        }
        self.inner.destroy_volume(id)?;
        self.state()?.destroyed.push(id.clone());
        Ok(())
    }

    fn purge_trash(&self) -> Result<usize, DriverError> {
        self.inner.purge_trash()
    }

    fn create_image(&self, spec: &ImageSpec) -> Result<ImageInfo, DriverError> {
        let failure = self.state()?.image_failure;
        match failure {
            Some(DriverFailure::Quota) => Err(DriverError::QuotaExceeded {
                limit: spec.disk_limit,
                required: spec.disk_limit.saturating_add(1),
            }),
            Some(DriverFailure::Io) => Err(DriverError::Injected(format!(
                "injected failure creating image {}",
                spec.image_path.display()
            ))),
            None => self.inner.create_image(spec),
        }
    }

    fn destroy_image(&self, image_path: &Path) -> Result<(), DriverError> {
        self.inner.destroy_image(image_path)
    }

    fn measure_store_usage(&self) -> Result<u64, DriverError> {
        let usage = {
            let mut state = self.state()?;
            state.measure_calls += 1;
            state.usage
        };
        match usage {
            Some(bytes) => Ok(bytes),
            None => self.inner.measure_store_usage(),
        }
    }
}

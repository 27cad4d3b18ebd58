use crate::backend::{FilesystemDriver, ImageInfo, ImageSpec};
use crate::unpack::{OPAQUE_WHITEOUT, WHITEOUT_PREFIX};
use crate::usage::disk_usage;
use crate::DriverError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use strata_store::{StoreLayout, StoreOwner, VolumeId};
use tracing::debug;

/// Driver that keeps volumes as plain directories, one per layer, and
/// materializes an image by merging its chain into a private copy.
///
/// Works on any local filesystem. The disk limit is checked against the
/// base size at creation and recorded for whoever enforces it at runtime.
#[derive(Debug, Clone)]
pub struct DirectoryDriver {
    layout: StoreLayout,
}

/// Quota settings recorded next to each image's rootfs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuotaRecord {
    pub disk_limit: u64,
    pub exclude_base_from_quota: bool,
    pub base_size: u64,
}

const QUOTA_FILE: &str = "quota.json";

/// Prefix of volumes being destroyed. Hidden from [`FilesystemDriver::volumes`].
pub const TRASH_PREFIX: &str = ".trash-";

impl DirectoryDriver {
    pub fn new(layout: StoreLayout) -> Self {
        Self { layout }
    }

    fn base_size(&self, volumes: &[VolumeId]) -> Result<u64, DriverError> {
        let paths: Vec<PathBuf> = volumes
            .iter()
            .map(|v| self.layout.volume_path(v))
            .collect();
        for (id, path) in volumes.iter().zip(&paths) {
            if !path.is_dir() {
                return Err(DriverError::VolumeNotFound(id.to_string()));
            }
        }
        Ok(disk_usage(&paths)?)
    }

    fn trash_path(&self, id: &VolumeId) -> PathBuf {
        self.layout.volumes_dir().join(format!("{TRASH_PREFIX}{id}"))
    }

    /// Move volume `id` out of sight so no reader can pick it up while its
    /// content is being removed. Returns the trash path, or `None` when the
    /// volume did not exist.
    pub(crate) fn retire_volume(&self, id: &VolumeId) -> Result<Option<PathBuf>, DriverError> {
        let trash = self.trash_path(id);
        // Left over from an earlier destroy of the same id that was cut short.
        remove_any(&trash)?;
        match fs::rename(self.layout.volume_path(id), &trash) {
            Ok(()) => Ok(Some(trash)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Give the owner full access to every directory under `dir`, so read-only
/// directories from a layer do not block writing into or removing the tree.
fn make_tree_writable(dir: &Path) -> std::io::Result<()> {
    let meta = fs::symlink_metadata(dir)?;
    if !meta.is_dir() {
        return Ok(());
    }
    make_writable(dir, &meta)?;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            make_tree_writable(&entry.path())?;
        }
    }
    Ok(())
}

fn make_writable(dir: &Path, meta: &fs::Metadata) -> std::io::Result<()> {
    let mode = meta.permissions().mode();
    if mode & 0o700 != 0o700 {
        fs::set_permissions(dir, fs::Permissions::from_mode(mode | 0o700))?;
    }
    Ok(())
}

/// `remove_dir_all` that also clears trees holding read-only directories.
pub fn remove_tree(path: &Path) -> std::io::Result<()> {
    match fs::remove_dir_all(path) {
        Err(e) if e.kind() == ErrorKind::PermissionDenied => {
            make_tree_writable(path)?;
            fs::remove_dir_all(path)
        }
        other => other,
    }
}

pub(crate) fn remove_any(path: &Path) -> std::io::Result<()> {
    let result = match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => remove_tree(path),
        Ok(_) => fs::remove_file(path),
        Err(e) => Err(e),
    };
    match result {
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

fn clear_dir(dir: &Path) -> std::io::Result<()> {
    make_writable(dir, &fs::symlink_metadata(dir)?)?;
    for entry in fs::read_dir(dir)? {
        remove_any(&entry?.path())?;
    }
    Ok(())
}

/// Overlay the tree at `src` onto `dest`, applying whiteouts.
fn merge_layer(src: &Path, dest: &Path, preserve_owner: bool) -> std::io::Result<()> {
    if src.join(OPAQUE_WHITEOUT).exists() && dest.is_dir() {
        clear_dir(dest)?;
    }

    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let name = entry.file_name();
        let name_str = name.to_string_lossy();
        if name_str == OPAQUE_WHITEOUT {
            continue;
        }
        if let Some(hidden) = name_str.strip_prefix(WHITEOUT_PREFIX) {
            remove_any(&dest.join(hidden))?;
            continue;
        }

        let from = entry.path();
        let to = dest.join(&name);
        let meta = fs::symlink_metadata(&from)?;
        let file_type = meta.file_type();

        if file_type.is_dir() {
            if fs::symlink_metadata(&to).is_ok_and(|m| !m.is_dir()) {
                remove_any(&to)?;
            }
            fs::create_dir_all(&to)?;
            make_writable(&to, &fs::symlink_metadata(&to)?)?;
            merge_layer(&from, &to, preserve_owner)?;
            fs::set_permissions(&to, meta.permissions())?;
        } else if file_type.is_symlink() {
            remove_any(&to)?;
            std::os::unix::fs::symlink(fs::read_link(&from)?, &to)?;
        } else if file_type.is_file() {
            if fs::symlink_metadata(&to).is_ok() {
                remove_any(&to)?;
            }
            fs::copy(&from, &to)?;
        } else {
            debug!("skipping special file {}", from.display());
            continue;
        }

        if preserve_owner {
            std::os::unix::fs::lchown(&to, Some(meta.uid()), Some(meta.gid()))?;
        }
    }
    Ok(())
}

impl FilesystemDriver for DirectoryDriver {
    fn name(&self) -> &'static str {
        "dir"
    }

    fn volume_path(&self, id: &VolumeId) -> PathBuf {
        self.layout.volume_path(id)
    }

    fn volumes(&self) -> Result<Vec<VolumeId>, DriverError> {
        let entries = match fs::read_dir(self.layout.volumes_dir()) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut volumes = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.starts_with('.') && entry.file_type()?.is_dir() {
                volumes.push(VolumeId::new(name));
            }
        }
        volumes.sort();
        Ok(volumes)
    }

    fn create_volume(&self, id: &VolumeId, staged: &Path) -> Result<bool, DriverError> {
        let dest = self.layout.volume_path(id);
        if dest.is_dir() {
            return Ok(false);
        }
        fs::create_dir_all(self.layout.volumes_dir())?;
        match fs::rename(staged, &dest) {
            Ok(()) => {
                debug!("created volume {id}");
                Ok(true)
            }
            // Lost a rename race against another creator of the same volume.
            Err(e) if dest.is_dir() && e.kind() != ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn destroy_volume(&self, id: &VolumeId) -> Result<(), DriverError> {
        let Some(trash) = self.retire_volume(id)? else {
            return Ok(());
        };
        remove_any(&trash)?;
        debug!("destroyed volume {id}");
        Ok(())
    }

    fn purge_trash(&self) -> Result<usize, DriverError> {
        let entries = match fs::read_dir(self.layout.volumes_dir()) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let mut purged = 0;
        for entry in entries {
            let entry = entry?;
            if entry.file_name().to_string_lossy().starts_with(TRASH_PREFIX) {
                remove_any(&entry.path())?;
                debug!("purged {}", entry.path().display());
                purged += 1;
            }
        }
        Ok(purged)
    }

    fn create_image(&self, spec: &ImageSpec) -> Result<ImageInfo, DriverError> {
        if spec.image_path.exists() {
            return Err(DriverError::ImageExists(spec.image_path.clone()));
        }

        let base_size = self.base_size(&spec.base_volumes)?;
        if spec.disk_limit > 0 && !spec.exclude_base_from_quota && base_size > spec.disk_limit {
            return Err(DriverError::QuotaExceeded {
                limit: spec.disk_limit,
                required: base_size,
            });
        }

        let rootfs = spec.image_path.join("rootfs");
        fs::create_dir_all(&rootfs)?;
        let privileged = StoreOwner::current().uid == 0;

        let built = (|| -> Result<(), DriverError> {
            for volume in &spec.base_volumes {
                merge_layer(&self.layout.volume_path(volume), &rootfs, privileged)?;
            }
            let quota = QuotaRecord {
                disk_limit: spec.disk_limit,
                exclude_base_from_quota: spec.exclude_base_from_quota,
                base_size,
            };
            fs::write(
                spec.image_path.join(QUOTA_FILE),
                serde_json::to_string_pretty(&quota)?,
            )?;
            if let (Some(owner), true) = (spec.owner, privileged) {
                std::os::unix::fs::chown(&spec.image_path, Some(owner.uid), Some(owner.gid))?;
            }
            Ok(())
        })();

        if let Err(e) = built {
            let _ = remove_any(&spec.image_path);
            return Err(e);
        }

        debug!(
            "materialized {} from {} volumes ({base_size} base bytes)",
            spec.image_path.display(),
            spec.base_volumes.len()
        );
        Ok(ImageInfo {
            rootfs,
            base_size,
            mount: None,
        })
    }

    fn destroy_image(&self, image_path: &Path) -> Result<(), DriverError> {
        remove_any(image_path)?;
        Ok(())
    }

    fn measure_store_usage(&self) -> Result<u64, DriverError> {
        Ok(disk_usage(&[
            self.layout.volumes_dir(),
            self.layout.images_dir(),
        ])?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (tempfile::TempDir, StoreLayout, DirectoryDriver) {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path());
        layout.initialize(None).unwrap();
        let driver = DirectoryDriver::new(layout.clone());
        (dir, layout, driver)
    }

    fn make_volume(
        layout: &StoreLayout,
        driver: &DirectoryDriver,
        id: &str,
        files: &[(&str, &str)],
    ) -> VolumeId {
        let staged = tempfile::tempdir_in(layout.staging_dir()).unwrap();
        for (path, content) in files {
            let p = staged.path().join(path);
            fs::create_dir_all(p.parent().unwrap()).unwrap();
            fs::write(p, content).unwrap();
        }
        let id = VolumeId::new(id);
        assert!(driver.create_volume(&id, staged.path()).unwrap());
        id
    }

    fn spec(layout: &StoreLayout, id: &str, volumes: Vec<VolumeId>) -> ImageSpec {
        ImageSpec {
            image_path: layout.image_path(id),
            base_volumes: volumes,
            disk_limit: 0,
            exclude_base_from_quota: false,
            owner: None,
        }
    }

    #[test]
    fn create_volume_moves_staged_content() {
        let (_dir, layout, driver) = setup();
        let id = make_volume(&layout, &driver, "v1", &[("a.txt", "hello")]);
        assert!(driver.volume_exists(&id));
        assert_eq!(
            fs::read_to_string(layout.volume_path("v1").join("a.txt")).unwrap(),
            "hello"
        );
        assert_eq!(driver.volumes().unwrap(), vec![id]);
    }

    #[test]
    fn create_existing_volume_reports_false() {
        let (_dir, layout, driver) = setup();
        make_volume(&layout, &driver, "v1", &[("a", "1")]);
        let staged = tempfile::tempdir_in(layout.staging_dir()).unwrap();
        fs::write(staged.path().join("a"), "2").unwrap();
        assert!(!driver
            .create_volume(&VolumeId::new("v1"), staged.path())
            .unwrap());
        assert_eq!(
            fs::read_to_string(layout.volume_path("v1").join("a")).unwrap(),
            "1",
            "existing volumes are immutable"
        );
    }

    #[test]
    fn destroy_volume_is_idempotent() {
        let (_dir, layout, driver) = setup();
        let id = make_volume(&layout, &driver, "v1", &[("a", "1")]);
        driver.destroy_volume(&id).unwrap();
        driver.destroy_volume(&id).unwrap();
        assert!(driver.volumes().unwrap().is_empty());
    }

    fn chmod(path: &Path, mode: u32) {
        fs::set_permissions(path, fs::Permissions::from_mode(mode)).unwrap();
    }

    #[test]
    fn destroy_leaves_no_trash_behind() {
        let (_dir, layout, driver) = setup();
        let id = make_volume(&layout, &driver, "v1", &[("usr/bin/sh", "#!")]);
        chmod(&layout.volume_path("v1").join("usr"), 0o555);
        driver.destroy_volume(&id).unwrap();
        assert_eq!(fs::read_dir(layout.volumes_dir()).unwrap().count(), 0);
        assert_eq!(driver.purge_trash().unwrap(), 0);
    }

    #[test]
    fn retired_volume_is_hidden_until_purged() {
        let (_dir, layout, driver) = setup();
        let id = make_volume(&layout, &driver, "v1", &[("a", "1"), ("b", "2")]);
        let trash = driver.retire_volume(&id).unwrap().unwrap();
        fs::remove_file(trash.join("a")).unwrap();

        assert!(!driver.volume_exists(&id));
        assert!(driver.volumes().unwrap().is_empty());
        assert_eq!(driver.purge_trash().unwrap(), 1);
        assert!(!trash.exists());
    }

    #[test]
    fn destroy_replaces_stale_trash_of_same_id() {
        let (_dir, layout, driver) = setup();
        let id = make_volume(&layout, &driver, "v1", &[("a", "1")]);
        driver.retire_volume(&id).unwrap();
        make_volume(&layout, &driver, "v1", &[("a", "again")]);

        driver.destroy_volume(&id).unwrap();
        assert_eq!(fs::read_dir(layout.volumes_dir()).unwrap().count(), 0);
    }

    #[test]
    fn read_only_directories_merge_and_destroy() {
        let (_dir, layout, driver) = setup();
        let lower = make_volume(&layout, &driver, "lower", &[("usr/lib/a", "a")]);
        let upper = make_volume(&layout, &driver, "upper", &[("usr/lib/b", "b")]);
        for v in ["lower", "upper"] {
            chmod(&layout.volume_path(v).join("usr/lib"), 0o555);
            chmod(&layout.volume_path(v).join("usr"), 0o555);
        }

        let info = driver
            .create_image(&spec(&layout, "img", vec![lower, upper]))
            .unwrap();
        assert!(info.rootfs.join("usr/lib/a").is_file());
        assert!(info.rootfs.join("usr/lib/b").is_file());
        let mode = fs::metadata(info.rootfs.join("usr/lib")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o555);

        driver.destroy_image(&layout.image_path("img")).unwrap();
        assert!(!layout.image_path("img").exists());
    }

    #[test]
    fn image_merges_layers_in_order() {
        let (_dir, layout, driver) = setup();
        let lower = make_volume(
            &layout,
            &driver,
            "lower",
            &[("etc/os", "lower"), ("etc/keep", "k"), ("tmp/x", "x")],
        );
        let upper = make_volume(
            &layout,
            &driver,
            "upper",
            &[("etc/os", "upper"), ("etc/.wh.keep", ""), ("new", "n")],
        );

        let info = driver
            .create_image(&spec(&layout, "img", vec![lower, upper]))
            .unwrap();
        assert_eq!(fs::read_to_string(info.rootfs.join("etc/os")).unwrap(), "upper");
        assert!(!info.rootfs.join("etc/keep").exists());
        assert!(!info.rootfs.join("etc/.wh.keep").exists());
        assert!(info.rootfs.join("tmp/x").exists());
        assert!(info.rootfs.join("new").exists());
        assert!(info.base_size > 0);
    }

    #[test]
    fn opaque_directory_hides_lower_content() {
        let (_dir, layout, driver) = setup();
        let lower = make_volume(&layout, &driver, "lower", &[("var/old", "o")]);
        let upper = make_volume(
            &layout,
            &driver,
            "upper",
            &[("var/.wh..wh..opq", ""), ("var/new", "n")],
        );
        let info = driver
            .create_image(&spec(&layout, "img", vec![lower, upper]))
            .unwrap();
        assert!(!info.rootfs.join("var/old").exists());
        assert!(info.rootfs.join("var/new").exists());
        assert!(!info.rootfs.join("var").join(OPAQUE_WHITEOUT).exists());
    }

    #[test]
    fn image_writes_do_not_touch_volumes() {
        let (_dir, layout, driver) = setup();
        let v = make_volume(&layout, &driver, "v", &[("f", "base")]);
        let info = driver.create_image(&spec(&layout, "img", vec![v])).unwrap();
        fs::write(info.rootfs.join("f"), "changed").unwrap();
        assert_eq!(
            fs::read_to_string(layout.volume_path("v").join("f")).unwrap(),
            "base"
        );
    }

    #[test]
    fn inclusive_quota_smaller_than_base_fails() {
        let (_dir, layout, driver) = setup();
        let big = "x".repeat(64 * 1024);
        let v = make_volume(&layout, &driver, "v", &[("big", &big)]);
        let mut s = spec(&layout, "img", vec![v]);
        s.disk_limit = 1024;
        assert!(matches!(
            driver.create_image(&s),
            Err(DriverError::QuotaExceeded { limit: 1024, .. })
        ));
        assert!(!layout.image_path("img").exists(), "no partial image may remain");
    }

    #[test]
    fn exclusive_quota_ignores_base_size() {
        let (_dir, layout, driver) = setup();
        let big = "x".repeat(64 * 1024);
        let v = make_volume(&layout, &driver, "v", &[("big", &big)]);
        let mut s = spec(&layout, "img", vec![v]);
        s.disk_limit = 1024;
        s.exclude_base_from_quota = true;
        driver.create_image(&s).unwrap();
        let quota: QuotaRecord = serde_json::from_str(
            &fs::read_to_string(layout.image_path("img").join(QUOTA_FILE)).unwrap(),
        )
        .unwrap();
        assert!(quota.exclude_base_from_quota);
        assert_eq!(quota.disk_limit, 1024);
    }

    #[test]
    fn missing_volume_fails_image_creation() {
        let (_dir, layout, driver) = setup();
        assert!(matches!(
            driver.create_image(&spec(&layout, "img", vec![VolumeId::new("ghost")])),
            Err(DriverError::VolumeNotFound(v)) if v == "ghost"
        ));
    }

    #[test]
    fn existing_image_path_rejected() {
        let (_dir, layout, driver) = setup();
        fs::create_dir_all(layout.image_path("img")).unwrap();
        assert!(matches!(
            driver.create_image(&spec(&layout, "img", vec![])),
            Err(DriverError::ImageExists(_))
        ));
    }

    #[test]
    fn destroy_image_is_idempotent() {
        let (_dir, layout, driver) = setup();
        let v = make_volume(&layout, &driver, "v", &[("f", "1")]);
        driver.create_image(&spec(&layout, "img", vec![v])).unwrap();
        driver.destroy_image(&layout.image_path("img")).unwrap();
        driver.destroy_image(&layout.image_path("img")).unwrap();
        assert!(!layout.image_path("img").exists());
    }

    #[test]
    fn usage_covers_volumes_and_images() {
        let (_dir, layout, driver) = setup();
        let empty = driver.measure_store_usage().unwrap();
        let big = "y".repeat(128 * 1024);
        let v = make_volume(&layout, &driver, "v", &[("big", &big)]);
        let with_volume = driver.measure_store_usage().unwrap();
        assert!(with_volume >= empty + 128 * 1024);
        driver.create_image(&spec(&layout, "img", vec![v])).unwrap();
        let with_image = driver.measure_store_usage().unwrap();
        assert!(with_image >= with_volume + 128 * 1024);
    }
}

//! Named advisory locks shared between independent processes.
//!
//! Each key maps to one file under `locks/`. Holding a key means holding an
//! exclusive `flock` on an open description of that file, so two handles
//! contend even inside one process, and the kernel drops the lock when the
//! holder dies. There is no timeout: `lock` waits as long as it takes.

use crate::layout::StoreLayout;
use crate::StoreError;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{trace, warn};

/// Key guarding store-wide volume population changes: collection and the
/// pull-and-register phase of every create.
pub const GLOBAL_LOCK_KEY: &str = "global";

/// Key serializing create and delete of one image id. Prefixed so that no
/// image id can alias the global key.
pub fn image_lock_key(image_id: &str) -> String {
    format!("image.{image_id}")
}

#[derive(Debug, Clone)]
pub struct Locksmith {
    dir: PathBuf,
}

/// A held lock. Released by [`LockHandle::unlock`] or, failing that, on drop.
#[derive(Debug)]
pub struct LockHandle {
    key: String,
    file: Option<File>,
}

impl Locksmith {
    pub fn new(layout: &StoreLayout) -> Self {
        Self {
            dir: layout.locks_dir(),
        }
    }

    pub fn lock_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.lock"))
    }

    /// Block until `key` is free, then hold it.
    pub fn lock(&self, key: &str) -> Result<LockHandle, StoreError> {
        let file = self.open(key)?;
        trace!("waiting for lock '{key}'");
        file.lock_exclusive().map_err(|source| StoreError::LockFailed {
            key: key.to_owned(),
            action: "acquire",
            source,
        })?;
        trace!("acquired lock '{key}'");
        Ok(LockHandle {
            key: key.to_owned(),
            file: Some(file),
        })
    }

    /// Take `key` if nobody holds it, without waiting.
    pub fn try_lock(&self, key: &str) -> Result<Option<LockHandle>, StoreError> {
        let file = self.open(key)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(LockHandle {
                key: key.to_owned(),
                file: Some(file),
            })),
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => Ok(None),
            Err(source) => Err(StoreError::LockFailed {
                key: key.to_owned(),
                action: "acquire",
                source,
            }),
        }
    }

    fn open(&self, key: &str) -> Result<File, StoreError> {
        let lock_err = |source| StoreError::LockFailed {
            key: key.to_owned(),
            action: "open",
            source,
        };
        if key.is_empty() || key.contains(['/', '\0']) || key == "." || key == ".." {
            return Err(lock_err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "lock key must be a single path component",
            )));
        }
        ensure_dir(&self.dir).map_err(lock_err)?;
        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(self.lock_path(key))
            .map_err(lock_err)
    }
}

fn ensure_dir(dir: &Path) -> std::io::Result<()> {
    if dir.is_dir() {
        return Ok(());
    }
    std::fs::create_dir_all(dir)
}

impl LockHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Release the lock, reporting a failure to do so.
    pub fn unlock(mut self) -> Result<(), StoreError> {
        match self.file.take() {
            Some(file) => {
                FileExt::unlock(&file).map_err(|source| StoreError::LockFailed {
                    key: self.key.clone(),
                    action: "release",
                    source,
                })?;
                trace!("released lock '{}'", self.key);
                Ok(())
            }
            None => Err(StoreError::LockFailed {
                key: self.key.clone(),
                action: "release",
                source: std::io::Error::other("lock already released"),
            }),
        }
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(e) = FileExt::unlock(&file) {
                warn!("failed to release lock '{}': {e}", self.key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{mpsc, Arc};
    use std::thread;
    use std::time::Duration;

    fn setup() -> (tempfile::TempDir, Locksmith) {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path());
        (dir, Locksmith::new(&layout))
    }

    #[test]
    fn lock_creates_file_per_key() {
        let (_dir, smith) = setup();
        let handle = smith.lock("image-a").unwrap();
        assert_eq!(handle.key(), "image-a");
        assert!(smith.lock_path("image-a").exists());
        handle.unlock().unwrap();
    }

    #[test]
    fn try_lock_contends_with_held_lock() {
        let (_dir, smith) = setup();
        let held = smith.lock(GLOBAL_LOCK_KEY).unwrap();
        assert!(smith.try_lock(GLOBAL_LOCK_KEY).unwrap().is_none());
        held.unlock().unwrap();
        assert!(smith.try_lock(GLOBAL_LOCK_KEY).unwrap().is_some());
    }

    #[test]
    fn distinct_keys_do_not_contend() {
        let (_dir, smith) = setup();
        let _a = smith.lock("a").unwrap();
        assert!(smith.try_lock("b").unwrap().is_some());
    }

    #[test]
    fn drop_releases_lock() {
        let (_dir, smith) = setup();
        {
            let _held = smith.lock("k").unwrap();
        }
        assert!(smith.try_lock("k").unwrap().is_some());
    }

    #[test]
    fn lock_blocks_until_released() {
        let (_dir, smith) = setup();
        let held = smith.lock("k").unwrap();
        let acquired = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel();

        let waiter = {
            let smith = smith.clone();
            let acquired = Arc::clone(&acquired);
            thread::spawn(move || {
                tx.send(()).unwrap();
                let handle = smith.lock("k").unwrap();
                acquired.store(true, Ordering::SeqCst);
                handle.unlock().unwrap();
            })
        };

        rx.recv().unwrap();
        thread::sleep(Duration::from_millis(100));
        assert!(!acquired.load(Ordering::SeqCst), "waiter must block");
        held.unlock().unwrap();
        waiter.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
    }

    #[test]
    fn image_keys_never_alias_global_key() {
        assert_ne!(image_lock_key(GLOBAL_LOCK_KEY), GLOBAL_LOCK_KEY);
        let (_dir, smith) = setup();
        let _global = smith.lock(GLOBAL_LOCK_KEY).unwrap();
        assert!(smith
            .try_lock(&image_lock_key(GLOBAL_LOCK_KEY))
            .unwrap()
            .is_some());
    }

    #[test]
    fn invalid_keys_rejected() {
        let (_dir, smith) = setup();
        for key in ["", "a/b", "..", "."] {
            assert!(
                matches!(smith.lock(key), Err(StoreError::LockFailed { .. })),
                "{key:?} should be rejected"
            );
        }
    }

    #[test]
    fn unwritable_lock_dir_fails() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("locks");
        std::fs::write(&blocker, b"not a directory").unwrap();
        let smith = Locksmith::new(&StoreLayout::new(dir.path()));
        assert!(matches!(
            smith.lock("k"),
            Err(StoreError::LockFailed { action: "open", .. })
        ));
    }
}

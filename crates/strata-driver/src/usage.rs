use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

/// Bytes of disk allocated under `roots`, counting each hard-linked inode
/// once and never following symlinks.
///
/// Entries that vanish mid-walk are ignored: other processes delete volumes
/// and images while we measure, and the figure only has to be good enough
/// for a threshold comparison.
pub fn disk_usage(roots: &[PathBuf]) -> std::io::Result<u64> {
    let mut seen = HashSet::new();
    let mut total = 0u64;
    let mut stack: Vec<PathBuf> = roots.to_vec();

    while let Some(path) = stack.pop() {
        let meta = match fs::symlink_metadata(&path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };

        if meta.nlink() > 1 && !meta.is_dir() && !seen.insert((meta.dev(), meta.ino())) {
            continue;
        }
        total = total.saturating_add(meta.blocks().saturating_mul(512));

        if meta.is_dir() {
            push_children(&path, &mut stack)?;
        }
    }

    Ok(total)
}

fn push_children(dir: &Path, stack: &mut Vec<PathBuf>) -> std::io::Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    for entry in entries {
        match entry {
            Ok(entry) => stack.push(entry.path()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_root_measures_zero() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(disk_usage(&[dir.path().join("absent")]).unwrap(), 0);
    }

    #[test]
    fn usage_grows_with_content() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let before = disk_usage(std::slice::from_ref(&root)).unwrap();
        fs::write(root.join("big"), vec![7u8; 256 * 1024]).unwrap();
        let after = disk_usage(&[root]).unwrap();
        assert!(
            after >= before + 256 * 1024,
            "expected at least 256KiB more, before={before} after={after}"
        );
    }

    #[test]
    fn hard_links_counted_once() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        fs::create_dir_all(&a).unwrap();
        fs::create_dir_all(&b).unwrap();
        fs::write(a.join("f"), vec![1u8; 128 * 1024]).unwrap();

        let single = disk_usage(&[a.clone(), b.clone()]).unwrap();
        fs::hard_link(a.join("f"), b.join("f")).unwrap();
        let linked = disk_usage(&[a, b]).unwrap();
        assert_eq!(single, linked);
    }

    #[test]
    fn symlinks_not_followed() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        fs::write(outside.path().join("big"), vec![1u8; 512 * 1024]).unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("link")).unwrap();
        let usage = disk_usage(&[dir.path().to_path_buf()]).unwrap();
        assert!(usage < 512 * 1024);
    }
}

//! Tar layer extraction into a staging directory.

use crate::DriverError;
use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use strata_store::{translate_id, IdMapping, StoreOwner};
use tracing::{debug, warn};

/// Prefix of OCI whiteout entries. A file `.wh.foo` deletes `foo` from the
/// layers below.
pub const WHITEOUT_PREFIX: &str = ".wh.";
/// Marks a directory as opaque: nothing below it shows through.
pub const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

/// Extract one layer tarball into `dest`.
///
/// Whiteout markers are extracted as ordinary files and applied when an
/// image is materialized. Entries that would escape `dest` are skipped.
/// When running as root with mappings, ownership from the archive is
/// translated into host ids; ids outside the mappings are an error.
///
/// Directories stay writable by the owner until every entry is in place, so
/// a read-only directory does not block the entries that follow it.
///
/// Returns the number of entries extracted.
pub fn unpack_layer(
    reader: impl Read,
    dest: &Path,
    uid_mappings: &[IdMapping],
    gid_mappings: &[IdMapping],
) -> Result<u64, DriverError> {
    fs::create_dir_all(dest)?;
    let translate = StoreOwner::current().uid == 0
        && !(uid_mappings.is_empty() && gid_mappings.is_empty());

    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);
    archive.set_overwrite(true);

    let mut count = 0u64;
    let mut dir_modes: BTreeMap<PathBuf, u32> = BTreeMap::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        let rel = entry.path()?.into_owned();
        if !entry.unpack_in(dest)? {
            warn!("skipping layer entry outside the layer root: {}", rel.display());
            continue;
        }
        count += 1;

        if entry.header().entry_type().is_dir() {
            let path = dest.join(&rel);
            let mode = entry.header().mode()? & 0o7777;
            if mode & 0o700 != 0o700 {
                fs::set_permissions(&path, fs::Permissions::from_mode(mode | 0o700))?;
            }
            dir_modes.insert(path, mode);
        }

        if translate {
            let header = entry.header();
            let uid = map_id(uid_mappings, header.uid()?, "uid")?;
            let gid = map_id(gid_mappings, header.gid()?, "gid")?;
            std::os::unix::fs::lchown(dest.join(&rel), Some(uid), Some(gid))?;
        }
    }
    // Children sort after their parents, so this restores bottom up.
    for (path, mode) in dir_modes.iter().rev() {
        fs::set_permissions(path, fs::Permissions::from_mode(*mode))?;
    }
    debug!("unpacked {count} entries into {}", dest.display());
    Ok(count)
}

fn map_id(mappings: &[IdMapping], raw: u64, kind: &str) -> Result<u32, DriverError> {
    u32::try_from(raw)
        .ok()
        .and_then(|id| translate_id(mappings, id))
        .ok_or_else(|| {
            DriverError::InvalidLayer(format!("{kind} {raw} is not covered by the {kind} mappings"))
        })
}

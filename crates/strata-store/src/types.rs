//! Identifier newtypes and uid/gid mapping tables.
//!
//! Identifiers serialize as plain strings so on-disk records stay readable
//! by hand.

use crate::StoreError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;
use std::str::FromStr;

macro_rules! string_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl AsRef<std::path::Path> for $name {
            fn as_ref(&self) -> &std::path::Path {
                std::path::Path::new(&self.0)
            }
        }

        impl PartialEq<str> for $name {
            fn eq(&self, other: &str) -> bool {
                self.0 == other
            }
        }

        impl PartialEq<&str> for $name {
            fn eq(&self, other: &&str) -> bool {
                self.0 == *other
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

string_newtype!(
    /// Caller-supplied identifier of one materialized image.
    ImageId
);

string_newtype!(
    /// Content-derived identifier of one unpacked layer volume (a chain id).
    VolumeId
);

string_newtype!(
    /// Digest of one compressed or uncompressed layer blob.
    LayerDigest
);

/// Image ids become directory names and lock keys, so they are restricted
/// to a conservative portable character set.
pub fn validate_image_id(id: &str) -> Result<(), StoreError> {
    if id.is_empty() || id.len() > 255 {
        return Err(StoreError::InvalidId(format!(
            "image id must be 1-255 characters, got {}",
            id.len()
        )));
    }
    if id == "." || id == ".." {
        return Err(StoreError::InvalidId(format!("image id '{id}' is reserved")));
    }
    if !id
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-' || b == b'.')
    {
        return Err(StoreError::InvalidId(format!(
            "image id '{id}' must match [A-Za-z0-9._-]"
        )));
    }
    Ok(())
}

/// Chain id of the volume holding `digest` on top of `parent`.
///
/// The first layer's chain id depends only on its digest; each following
/// layer folds in its parent's chain id, so the same digest at a different
/// position in a stack yields a different volume.
pub fn chain_id(parent: Option<&VolumeId>, digest: &LayerDigest) -> VolumeId {
    let input = match parent {
        Some(parent) => format!("{parent} {digest}"),
        None => format!("layer:{digest}"),
    };
    VolumeId::new(blake3::hash(input.as_bytes()).to_hex().to_string())
}

/// One contiguous range of a uid or gid mapping: `size` ids starting at
/// `namespace_id` inside the user namespace map to ids starting at
/// `host_id` on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMapping {
    pub namespace_id: u32,
    pub host_id: u32,
    pub size: u32,
}

impl IdMapping {
    /// Host id for `namespace_id`, if this range covers it.
    pub fn translate(&self, namespace_id: u32) -> Option<u32> {
        let offset = namespace_id.checked_sub(self.namespace_id)?;
        if offset < self.size {
            self.host_id.checked_add(offset)
        } else {
            None
        }
    }
}

impl FromStr for IdMapping {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || {
            StoreError::InvalidMapping(format!(
                "'{s}' is not of the form <namespace id>:<host id>:<size>"
            ))
        };
        let mut parts = s.trim().split(':');
        let mut next = || -> Result<u32, StoreError> {
            parts
                .next()
                .ok_or_else(invalid)?
                .parse::<u32>()
                .map_err(|_| invalid())
        };
        let mapping = IdMapping {
            namespace_id: next()?,
            host_id: next()?,
            size: next()?,
        };
        if parts.next().is_some() || mapping.size == 0 {
            return Err(invalid());
        }
        Ok(mapping)
    }
}

impl fmt::Display for IdMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.namespace_id, self.host_id, self.size)
    }
}

/// Translate a namespace id through a mapping table. An empty table is the
/// identity mapping.
pub fn translate_id(mappings: &[IdMapping], namespace_id: u32) -> Option<u32> {
    if mappings.is_empty() {
        return Some(namespace_id);
    }
    mappings.iter().find_map(|m| m.translate(namespace_id))
}

/// The uid/gid that owns the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreOwner {
    pub uid: u32,
    pub gid: u32,
}

impl StoreOwner {
    /// Owner of the calling process.
    pub fn current() -> Self {
        #[allow(unsafe_code)]
        // SAFETY: getuid/getgid take no arguments and cannot fail.
        let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
        Self { uid, gid }
    }

    /// Derive the store owner from the mappings: the host id that root
    /// inside the namespace maps to. Without mappings the caller owns it.
    pub fn from_mappings(
        uid_mappings: &[IdMapping],
        gid_mappings: &[IdMapping],
    ) -> Result<Self, StoreError> {
        let current = Self::current();
        let uid = root_host_id(uid_mappings, current.uid)?;
        let gid = root_host_id(gid_mappings, current.gid)?;
        Ok(Self { uid, gid })
    }
}

fn root_host_id(mappings: &[IdMapping], fallback: u32) -> Result<u32, StoreError> {
    if mappings.is_empty() {
        return Ok(fallback);
    }
    mappings
        .iter()
        .find(|m| m.namespace_id == 0 && m.size == 1)
        .map(|m| m.host_id)
        .ok_or_else(|| {
            StoreError::InvalidMapping(
                "couldn't determine store owner, missing root user mapping".to_owned(),
            )
        })
}

//! Resolving base image references to layer lists and layer streams.
//!
//! Only local base images are fetched here. Registry schemes are served by
//! whatever [`Fetcher`] the embedding application registers for them.

use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use strata_store::LayerDigest;
use thiserror::Error;
use tracing::debug;

/// Why a base image could not be fetched. Variants are distinct so the CLI
/// can explain each one to a human.
#[derive(Debug, Error)]
pub enum PullError {
    #[error("unknown base image scheme '{0}'")]
    UnknownScheme(String),
    #[error("unauthorized to access {0}")]
    Unauthorized(String),
    #[error("unable to retrieve auth token: 401 unauthorized")]
    InvalidCredentials,
    #[error("x509: certificate signed by unknown authority ({0})")]
    UntrustedCertificate(String),
    #[error("registry unreachable: {0}")]
    Unreachable(String),
    #[error("base image not found: {0}")]
    NotFound(String),
    #[error("malformed base image {reference}: {reason}")]
    Malformed { reference: String, reason: String },
    #[error("fetch I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A parsed base image reference such as `docker:///busybox`,
/// `file:///srv/rootfs.tar`, or a bare path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseImageRef {
    raw: String,
    scheme: String,
    location: String,
}

impl BaseImageRef {
    pub fn parse(raw: &str) -> Result<Self, PullError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(PullError::Malformed {
                reference: raw.to_owned(),
                reason: "empty reference".to_owned(),
            });
        }
        let (scheme, location) = match raw.split_once("://") {
            Some((scheme, rest)) if !scheme.is_empty() => (scheme.to_ascii_lowercase(), rest),
            Some(_) => {
                return Err(PullError::Malformed {
                    reference: raw.to_owned(),
                    reason: "missing scheme".to_owned(),
                })
            }
            None => ("file".to_owned(), raw),
        };
        Ok(Self {
            raw: raw.to_owned(),
            scheme,
            location: location.to_owned(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// `scheme://location`, identical for every spelling of the same image
    /// (`/srv/base.tar`, `file:///srv/base.tar`, `FILE:///srv/base.tar`).
    pub fn cache_key(&self) -> String {
        format!("{}://{}", self.scheme, self.location)
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Everything after `scheme://`, or the whole reference for bare paths.
    pub fn location(&self) -> &str {
        &self.location
    }
}

impl fmt::Display for BaseImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerInfo {
    pub digest: LayerDigest,
    pub size: u64,
    /// Fetcher-specific address of the blob.
    pub location: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseImageInfo {
    /// Bottom layer first.
    pub layers: Vec<LayerInfo>,
}

pub trait Fetcher: Send + Sync {
    fn base_image_info(&self, image: &BaseImageRef) -> Result<BaseImageInfo, PullError>;

    fn stream_blob(
        &self,
        image: &BaseImageRef,
        layer: &LayerInfo,
    ) -> Result<Box<dyn Read + Send>, PullError>;
}

/// Fetches base images from the local filesystem.
///
/// A reference names either one uncompressed layer tarball, or a directory
/// whose `manifest.json` lists layer tarballs bottom first:
///
/// ```json
/// { "layers": ["base.tar", "app.tar"] }
/// ```
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFetcher;

#[derive(Debug, Deserialize)]
struct LocalManifest {
    layers: Vec<String>,
}

const LOCAL_MANIFEST: &str = "manifest.json";

fn blake3_digest(hasher: &blake3::Hasher) -> LayerDigest {
    LayerDigest::new(format!("blake3:{}", hasher.finalize().to_hex()))
}

fn digest_file(path: &Path) -> Result<(LayerDigest, u64), PullError> {
    let mut file = File::open(path)?;
    let mut hasher = blake3::Hasher::new();
    let size = std::io::copy(&mut file, &mut hasher)?;
    Ok((blake3_digest(&hasher), size))
}

/// Hashes a layer file as it is read and fails at end of stream when the
/// content no longer matches the digest it was resolved with.
struct VerifiedBlob {
    file: File,
    hasher: blake3::Hasher,
    expected: LayerDigest,
}

impl Read for VerifiedBlob {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.file.read(buf)?;
        if n > 0 {
            self.hasher.update(&buf[..n]);
            return Ok(n);
        }
        let actual = blake3_digest(&self.hasher);
        if actual != self.expected {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!(
                    "layer content changed: expected {}, read {actual}",
                    self.expected
                ),
            ));
        }
        Ok(0)
    }
}

impl LocalFetcher {
    fn layer_paths(image: &BaseImageRef) -> Result<Vec<PathBuf>, PullError> {
        let root = PathBuf::from(image.location());
        let meta = match std::fs::metadata(&root) {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(PullError::NotFound(image.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        if meta.is_file() {
            return Ok(vec![root]);
        }

        let manifest_path = root.join(LOCAL_MANIFEST);
        let content = match std::fs::read_to_string(&manifest_path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(PullError::Malformed {
                    reference: image.to_string(),
                    reason: format!("directory has no {LOCAL_MANIFEST}"),
                });
            }
            Err(e) => return Err(e.into()),
        };
        let manifest: LocalManifest =
            serde_json::from_str(&content).map_err(|e| PullError::Malformed {
                reference: image.to_string(),
                reason: format!("invalid {LOCAL_MANIFEST}: {e}"),
            })?;

        manifest
            .layers
            .iter()
            .map(|name| {
                let rel = Path::new(name);
                if rel.is_absolute() || rel.components().any(|c| c.as_os_str() == "..") {
                    return Err(PullError::Malformed {
                        reference: image.to_string(),
                        reason: format!("layer path '{name}' leaves the image directory"),
                    });
                }
                Ok(root.join(rel))
            })
            .collect()
    }
}

impl Fetcher for LocalFetcher {
    fn base_image_info(&self, image: &BaseImageRef) -> Result<BaseImageInfo, PullError> {
        let mut layers = Vec::new();
        for path in Self::layer_paths(image)? {
            let (digest, size) = digest_file(&path).map_err(|e| match e {
                PullError::Io(io) if io.kind() == std::io::ErrorKind::NotFound => {
                    PullError::Malformed {
                        reference: image.to_string(),
                        reason: format!("layer {} is missing", path.display()),
                    }
                }
                other => other,
            })?;
            layers.push(LayerInfo {
                digest,
                size,
                location: path.to_string_lossy().into_owned(),
            });
        }
        if layers.is_empty() {
            return Err(PullError::Malformed {
                reference: image.to_string(),
                reason: "no layers".to_owned(),
            });
        }
        debug!("resolved {image} to {} layers", layers.len());
        Ok(BaseImageInfo { layers })
    }

    fn stream_blob(
        &self,
        _image: &BaseImageRef,
        layer: &LayerInfo,
    ) -> Result<Box<dyn Read + Send>, PullError> {
        Ok(Box::new(VerifiedBlob {
            file: File::open(&layer.location)?,
            hasher: blake3::Hasher::new(),
            expected: layer.digest.clone(),
        }))
    }
}

/// Routes each reference to the fetcher registered for its scheme.
#[derive(Clone)]
pub struct SchemeFetcher {
    fetchers: HashMap<String, Arc<dyn Fetcher>>,
}

impl Default for SchemeFetcher {
    fn default() -> Self {
        let mut fetchers: HashMap<String, Arc<dyn Fetcher>> = HashMap::new();
        fetchers.insert("file".to_owned(), Arc::new(LocalFetcher));
        Self { fetchers }
    }
}

impl SchemeFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_fetcher(mut self, scheme: &str, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetchers.insert(scheme.to_ascii_lowercase(), fetcher);
        self
    }

    fn route(&self, image: &BaseImageRef) -> Result<&Arc<dyn Fetcher>, PullError> {
        self.fetchers
            .get(image.scheme())
            .ok_or_else(|| PullError::UnknownScheme(image.scheme().to_owned()))
    }
}

impl Fetcher for SchemeFetcher {
    fn base_image_info(&self, image: &BaseImageRef) -> Result<BaseImageInfo, PullError> {
        self.route(image)?.base_image_info(image)
    }

    fn stream_blob(
        &self,
        image: &BaseImageRef,
        layer: &LayerInfo,
    ) -> Result<Box<dyn Read + Send>, PullError> {
        self.route(image)?.stream_blob(image, layer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_tar(path: &Path, files: &[(&str, &[u8])]) {
        let mut builder = tar::Builder::new(File::create(path).unwrap());
        for (name, data) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.finish().unwrap();
    }

    #[test]
    fn parse_references() {
        let r = BaseImageRef::parse("docker:///cfgarden/empty").unwrap();
        assert_eq!(r.scheme(), "docker");
        assert_eq!(r.location(), "/cfgarden/empty");

        let r = BaseImageRef::parse("/srv/rootfs.tar").unwrap();
        assert_eq!(r.scheme(), "file");
        assert_eq!(r.location(), "/srv/rootfs.tar");

        let r = BaseImageRef::parse("FILE:///srv/x").unwrap();
        assert_eq!(r.scheme(), "file");
        assert_eq!(r.as_str(), "FILE:///srv/x");

        assert_eq!(
            BaseImageRef::parse("/srv/base.tar").unwrap().cache_key(),
            BaseImageRef::parse("FILE:///srv/base.tar").unwrap().cache_key()
        );
        assert_eq!(
            BaseImageRef::parse("docker:///busybox").unwrap().cache_key(),
            "docker:///busybox"
        );

        assert!(BaseImageRef::parse("").is_err());
        assert!(BaseImageRef::parse("://nothing").is_err());
    }

    #[test]
    fn single_tarball_is_one_layer() {
        let dir = tempfile::tempdir().unwrap();
        let tar_path = dir.path().join("rootfs.tar");
        write_tar(&tar_path, &[("hello", b"world")]);

        let image = BaseImageRef::parse(tar_path.to_str().unwrap()).unwrap();
        let info = LocalFetcher.base_image_info(&image).unwrap();
        assert_eq!(info.layers.len(), 1);
        assert!(info.layers[0].digest.starts_with("blake3:"));

        let mut blob = Vec::new();
        LocalFetcher
            .stream_blob(&image, &info.layers[0])
            .unwrap()
            .read_to_end(&mut blob)
            .unwrap();
        assert_eq!(blob.len() as u64, info.layers[0].size);
    }

    #[test]
    fn blob_replaced_after_resolution_fails_at_end() {
        let dir = tempfile::tempdir().unwrap();
        let tar_path = dir.path().join("rootfs.tar");
        write_tar(&tar_path, &[("hello", b"world")]);
        let image = BaseImageRef::parse(tar_path.to_str().unwrap()).unwrap();
        let info = LocalFetcher.base_image_info(&image).unwrap();

        write_tar(&tar_path, &[("hello", b"there")]);
        let err = LocalFetcher
            .stream_blob(&image, &info.layers[0])
            .unwrap()
            .read_to_end(&mut Vec::new())
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[test]
    fn manifest_directory_lists_layers_in_order() {
        let dir = tempfile::tempdir().unwrap();
        write_tar(&dir.path().join("a.tar"), &[("a", b"1")]);
        write_tar(&dir.path().join("b.tar"), &[("b", b"2")]);
        std::fs::write(
            dir.path().join(LOCAL_MANIFEST),
            r#"{"layers": ["a.tar", "b.tar"]}"#,
        )
        .unwrap();

        let image = BaseImageRef::parse(&format!("file://{}", dir.path().display())).unwrap();
        let info = LocalFetcher.base_image_info(&image).unwrap();
        assert_eq!(info.layers.len(), 2);
        assert!(info.layers[0].location.ends_with("a.tar"));
        assert_ne!(info.layers[0].digest, info.layers[1].digest);
    }

    #[test]
    fn identical_content_has_identical_digest() {
        let dir = tempfile::tempdir().unwrap();
        write_tar(&dir.path().join("one.tar"), &[("f", b"same")]);
        std::fs::copy(dir.path().join("one.tar"), dir.path().join("two.tar")).unwrap();
        let one = BaseImageRef::parse(dir.path().join("one.tar").to_str().unwrap()).unwrap();
        let two = BaseImageRef::parse(dir.path().join("two.tar").to_str().unwrap()).unwrap();
        assert_eq!(
            LocalFetcher.base_image_info(&one).unwrap().layers[0].digest,
            LocalFetcher.base_image_info(&two).unwrap().layers[0].digest
        );
    }

    #[test]
    fn missing_image_is_not_found() {
        let image = BaseImageRef::parse("/definitely/not/here.tar").unwrap();
        assert!(matches!(
            LocalFetcher.base_image_info(&image),
            Err(PullError::NotFound(_))
        ));
    }

    #[test]
    fn directory_without_manifest_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let image = BaseImageRef::parse(dir.path().to_str().unwrap()).unwrap();
        assert!(matches!(
            LocalFetcher.base_image_info(&image),
            Err(PullError::Malformed { .. })
        ));
    }

    #[test]
    fn manifest_cannot_escape_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(LOCAL_MANIFEST),
            r#"{"layers": ["../etc/shadow"]}"#,
        )
        .unwrap();
        let image = BaseImageRef::parse(dir.path().to_str().unwrap()).unwrap();
        assert!(matches!(
            LocalFetcher.base_image_info(&image),
            Err(PullError::Malformed { .. })
        ));
    }

    #[test]
    fn unregistered_scheme_is_unknown() {
        let fetcher = SchemeFetcher::new();
        let image = BaseImageRef::parse("docker:///busybox").unwrap();
        assert!(matches!(
            fetcher.base_image_info(&image),
            Err(PullError::UnknownScheme(s)) if s == "docker"
        ));
    }

    struct DeniedFetcher;

    impl Fetcher for DeniedFetcher {
        fn base_image_info(&self, image: &BaseImageRef) -> Result<BaseImageInfo, PullError> {
            Err(PullError::Unauthorized(image.to_string()))
        }

        fn stream_blob(
            &self,
            image: &BaseImageRef,
            _layer: &LayerInfo,
        ) -> Result<Box<dyn Read + Send>, PullError> {
            Err(PullError::Unauthorized(image.to_string()))
        }
    }

    #[test]
    fn registered_scheme_is_routed() {
        let fetcher = SchemeFetcher::new().with_fetcher("docker", Arc::new(DeniedFetcher));
        let image = BaseImageRef::parse("docker:///private").unwrap();
        assert!(matches!(
            fetcher.base_image_info(&image),
            Err(PullError::Unauthorized(_))
        ));
    }
}

use serde::Deserialize;
use std::path::{Path, PathBuf};
use strata_store::IdMapping;

pub const DEFAULT_STORE: &str = "/var/lib/strata/store";
pub const DEFAULT_DRIVER: &str = "dir";

/// Optional settings file. A command-line flag wins over the file, the file
/// wins over the built-in default.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub store: Option<PathBuf>,
    pub driver: Option<String>,
    pub clean_on_create: Option<bool>,
    pub clean_threshold_bytes: Option<u64>,
    #[serde(default)]
    pub keep_images: Vec<String>,
    pub disk_limit_size_bytes: Option<u64>,
    pub exclude_image_from_quota: Option<bool>,
    #[serde(default)]
    pub uid_mappings: Vec<String>,
    #[serde(default)]
    pub gid_mappings: Vec<String>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("config error: failed to read {}: {e}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, String> {
        toml::from_str(content).map_err(|e| format!("config error: {e}"))
    }

    /// `path` if given, else an empty config.
    pub fn load_optional(path: Option<&Path>) -> Result<Self, String> {
        path.map_or_else(|| Ok(Self::default()), Self::load)
    }

    pub fn store_path(&self, flag: Option<&Path>) -> PathBuf {
        flag.map(expand_tilde)
            .or_else(|| self.store.as_deref().map(expand_tilde))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STORE))
    }

    pub fn driver(&self, flag: Option<&str>) -> String {
        flag.or(self.driver.as_deref())
            .unwrap_or(DEFAULT_DRIVER)
            .to_owned()
    }

    pub fn clean_on_create(&self, clean: bool, no_clean: bool) -> Result<bool, String> {
        match (clean, no_clean) {
            (true, true) => Err("config error: --clean and --no-clean are mutually exclusive".to_owned()),
            (true, false) => Ok(true),
            (false, true) => Ok(false),
            (false, false) => Ok(self.clean_on_create.unwrap_or(false)),
        }
    }

    pub fn clean_threshold(&self, flag: Option<u64>) -> u64 {
        flag.or(self.clean_threshold_bytes).unwrap_or(0)
    }

    pub fn keep_images(&self, flag: &[String]) -> Vec<String> {
        if flag.is_empty() {
            self.keep_images.clone()
        } else {
            flag.to_vec()
        }
    }

    pub fn disk_limit(&self, flag: Option<u64>) -> u64 {
        flag.or(self.disk_limit_size_bytes).unwrap_or(0)
    }

    pub fn exclude_image_from_quota(&self, flag: bool) -> bool {
        flag || self.exclude_image_from_quota.unwrap_or(false)
    }

    pub fn uid_mappings(&self, flag: &[String]) -> Result<Vec<IdMapping>, String> {
        parse_mappings(if flag.is_empty() { &self.uid_mappings } else { flag })
    }

    pub fn gid_mappings(&self, flag: &[String]) -> Result<Vec<IdMapping>, String> {
        parse_mappings(if flag.is_empty() { &self.gid_mappings } else { flag })
    }
}

pub fn parse_mappings(raw: &[String]) -> Result<Vec<IdMapping>, String> {
    raw.iter()
        .map(|m| m.parse().map_err(|e| format!("config error: {e}")))
        .collect()
}

fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(stripped);
        }
    }
    path.to_path_buf()
}

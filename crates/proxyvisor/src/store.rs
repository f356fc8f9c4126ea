//! Read-only access to proxy configurations.
//!
//! Creating and editing configurations belongs to whatever front end embeds the
//! service; the core only looks them up.

use anyhow::{Context, Result, bail};
use log::{debug, warn};
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::models::{ProxyConfig, validate_id};

/// Lookup of proxy configurations by id.
pub trait ConfigStore: Send + Sync {
    fn get(&self, id: &str) -> Option<ProxyConfig>;

    /// All configurations, in a stable order.
    fn list(&self) -> Vec<ProxyConfig>;
}

/// In-memory store, for embedding and tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryConfigStore {
    configs: Vec<ProxyConfig>,
}

impl MemoryConfigStore {
    pub fn new(configs: impl IntoIterator<Item = ProxyConfig>) -> Self {
        Self {
            configs: configs.into_iter().collect(),
        }
    }
}

impl ConfigStore for MemoryConfigStore {
    fn get(&self, id: &str) -> Option<ProxyConfig> {
        self.configs.iter().find(|c| c.id == id).cloned()
    }

    fn list(&self) -> Vec<ProxyConfig> {
        self.configs.clone()
    }
}

#[derive(Debug, Default, Deserialize)]
struct StoreFile {
    #[serde(default)]
    configs: Vec<ProxyConfig>,
}

/// Configurations read from a TOML file of `[[configs]]` tables.
///
/// ```toml
/// [[configs]]
/// id = "ssh"
/// role = "client"
/// serverAddr = "1.2.3.4"
/// serverPort = 7000
/// localPort = 22
/// remotePort = 6000
/// autoStart = true
/// ```
#[derive(Debug, Clone)]
pub struct FileConfigStore {
    path: PathBuf,
    configs: Vec<ProxyConfig>,
}

impl FileConfigStore {
    /// Load the file. A missing file is an empty store.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.exists() {
            debug!("config store {} does not exist, starting empty", path.display());
            return Ok(Self {
                path,
                configs: Vec::new(),
            });
        }

        let text = fs::read_to_string(&path)
            .with_context(|| format!("reading config store {}", path.display()))?;
        let file: StoreFile = toml::from_str(&text)
            .with_context(|| format!("parsing config store {}", path.display()))?;

        let mut seen = HashSet::new();
        for config in &file.configs {
            if let Err(e) = validate_id(&config.id) {
                bail!("{}: {}", path.display(), e);
            }
            if !seen.insert(config.id.as_str()) {
                bail!("{}: duplicate config id {:?}", path.display(), config.id);
            }
            if let Err(e) = config.validate() {
                warn!("config {} is incomplete: {}", config.id, e);
            }
        }

        debug!(
            "loaded {} configs from {}",
            file.configs.len(),
            path.display()
        );
        Ok(Self {
            path,
            configs: file.configs,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigStore for FileConfigStore {
    fn get(&self, id: &str) -> Option<ProxyConfig> {
        self.configs.iter().find(|c| c.id == id).cloned()
    }

    fn list(&self) -> Vec<ProxyConfig> {
        self.configs.clone()
    }
}

//! Layered settings: built-in defaults, then the TOML config file, then
//! `PROXYVISOR__SECTION__KEY` environment variables.

use anyhow::{Context, Result, anyhow};
use config::{Config, Environment, File, FileFormat};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::process::{DEFAULT_MAX_OUTPUT_LINES, OutputClassifier};
use crate::provision::{DEFAULT_MIN_BINARY_SIZE, DEFAULT_MIN_EMULATOR_SIZE};
use crate::service::ServiceConfig;

pub const APP_NAME: &str = "proxyvisor";

/// Everything read from the config file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub paths: PathSettings,
    pub runtime: RuntimeSettings,
    pub markers: MarkerSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Directory overrides. Unset entries fall back to the platform data and config
/// directories. Values support `~` and environment variables.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathSettings {
    /// Writable directory holding provisioned executables and sandboxes.
    pub exec_dir: Option<String>,
    /// Directory of bundled assets (`frp/<abi>/frpc`, ...).
    pub assets_dir: Option<String>,
    /// Where synthesized `<id>.toml` files are written.
    pub config_dir: Option<String>,
    /// TOML file of `[[configs]]` entries.
    pub store: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    /// Host ABI list override. Empty means detect.
    pub abis: Vec<String>,
    pub stop_timeout_secs: u64,
    pub max_output_lines: usize,
    pub max_processes: usize,
    /// Shell used to run the full-environment startup script.
    pub system_shell: String,
    pub full_environment: bool,
    pub root_emulation: bool,
    pub min_binary_size: u64,
    pub min_emulator_size: u64,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            abis: Vec::new(),
            stop_timeout_secs: 5,
            max_output_lines: DEFAULT_MAX_OUTPUT_LINES,
            max_processes: 16,
            system_shell: default_system_shell(),
            full_environment: true,
            root_emulation: true,
            min_binary_size: DEFAULT_MIN_BINARY_SIZE,
            min_emulator_size: DEFAULT_MIN_EMULATOR_SIZE,
        }
    }
}

/// Output keyword lists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarkerSettings {
    pub success: Vec<String>,
    pub warning: Vec<String>,
    pub error: Vec<String>,
}

impl Default for MarkerSettings {
    fn default() -> Self {
        let classifier = OutputClassifier::default();
        Self {
            success: classifier.success,
            warning: classifier.warning,
            error: classifier.error,
        }
    }
}

impl MarkerSettings {
    pub fn classifier(&self) -> OutputClassifier {
        OutputClassifier {
            success: self.success.clone(),
            warning: self.warning.clone(),
            error: self.error.clone(),
        }
    }
}

/// Fully resolved directories.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedPaths {
    pub exec_dir: PathBuf,
    pub assets_dir: PathBuf,
    pub config_dir: PathBuf,
    pub store: PathBuf,
}

impl Settings {
    /// Read settings, creating `config_file` with defaults if it does not exist.
    pub fn load_or_init(config_file: &Path) -> Result<Self> {
        if !config_file.exists() {
            write_default_config(config_file)?;
            info!("wrote default config to {}", config_file.display());
        }
        Self::load(config_file)
    }

    /// Read settings without touching the filesystem.
    pub fn load(config_file: &Path) -> Result<Self> {
        let defaults = RuntimeSettings::default();
        let built = Config::builder()
            .set_default("logging.level", "info")?
            .set_default("runtime.stop_timeout_secs", defaults.stop_timeout_secs)?
            .set_default("runtime.max_processes", defaults.max_processes as u64)?
            .add_source(
                File::from(config_file)
                    .format(FileFormat::Toml)
                    .required(false),
            )
            .add_source(
                Environment::with_prefix(&env_prefix())
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("runtime.abis")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("loading config from {}", config_file.display()))?;

        let settings: Settings = built
            .try_deserialize()
            .context("deserializing configuration")?;
        settings.validate()?;
        debug!("loaded settings: {:?}", settings);
        Ok(settings)
    }

    /// Reject values the service cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.runtime.max_processes == 0 {
            return Err(anyhow!("runtime.max_processes must be at least 1"));
        }
        Ok(())
    }

    /// Resolve directory overrides against the platform defaults.
    pub fn resolve_paths(&self) -> Result<ResolvedPaths> {
        let data_dir = default_data_dir()?;
        let pick = |value: &Option<String>, fallback: PathBuf| -> Result<PathBuf> {
            match value {
                Some(text) => expand_str_path(text),
                None => Ok(fallback),
            }
        };
        Ok(ResolvedPaths {
            exec_dir: pick(&self.paths.exec_dir, data_dir.join("exec"))?,
            assets_dir: pick(&self.paths.assets_dir, data_dir.join("assets"))?,
            config_dir: pick(&self.paths.config_dir, data_dir.join("configs"))?,
            store: pick(&self.paths.store, default_config_dir()?.join("proxies.toml"))?,
        })
    }

    /// Build the service configuration.
    pub fn service_config(&self) -> Result<ServiceConfig> {
        self.validate()?;
        let paths = self.resolve_paths()?;
        let runtime = &self.runtime;
        Ok(ServiceConfig {
            exec_dir: paths.exec_dir,
            config_dir: paths.config_dir,
            abis: runtime.abis.clone(),
            system_shell: PathBuf::from(&runtime.system_shell),
            full_environment: runtime.full_environment,
            root_emulation: runtime.root_emulation,
            min_binary_size: runtime.min_binary_size,
            min_emulator_size: runtime.min_emulator_size,
            stop_timeout: Duration::from_secs(runtime.stop_timeout_secs),
            max_output_lines: runtime.max_output_lines,
            max_processes: runtime.max_processes,
            classifier: self.markers.classifier(),
        })
    }
}

/// Write a commented default config file.
pub fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {parent:?}"))?;
    }

    let toml = toml::to_string_pretty(&Settings::default())
        .context("serializing default config to TOML")?;
    let mut body = format!("# Configuration for {APP_NAME}\n# File: {}\n\n", path.display());
    body.push_str(&toml);
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}

/// `<config dir>/config.toml`, or the file named by an override.
pub fn config_file_path(override_path: Option<PathBuf>) -> Result<PathBuf> {
    match override_path {
        Some(path) => {
            let expanded = match path.to_str() {
                Some(text) => expand_str_path(text)?,
                None => path,
            };
            if expanded.is_dir() {
                Ok(expanded.join("config.toml"))
            } else {
                Ok(expanded)
            }
        }
        None => Ok(default_config_dir()?.join("config.toml")),
    }
}

pub fn expand_str_path(text: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(text).context("expanding path")?;
    Ok(PathBuf::from(expanded.to_string()))
}

pub fn default_config_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(mut dir) = dirs::config_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".config").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine configuration directory"))
}

pub fn default_data_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_DATA_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(mut dir) = dirs::data_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".local").join("share").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine data directory"))
}

fn env_prefix() -> String {
    APP_NAME.to_ascii_uppercase()
}

/// Android's shell when present, otherwise the POSIX one.
fn default_system_shell() -> String {
    if Path::new("/system/bin/sh").exists() {
        "/system/bin/sh".to_string()
    } else {
        "/bin/sh".to_string()
    }
}

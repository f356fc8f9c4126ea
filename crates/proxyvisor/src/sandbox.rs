//! Sandbox bootstrapping and readiness.
//!
//! Two launch strategies depend on something being prepared on disk first:
//!
//! - **Full environment**: a minimal userland tree (`<exec>/rootfs`) holding a shell,
//!   a handful of tools, an environment file and a startup script.
//! - **Root emulation**: the `proot` executable at `<exec>/proot/proot`.
//!
//! Preparation is best effort and runs once per service. Readiness is a pure query
//! recomputed from the filesystem every time it is asked for; nothing is cached.

use anyhow::{Context, Result};
use log::{debug, info, warn};
use serde::Serialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::arch::Arch;
use crate::assets::{AssetSource, asset_path};
use crate::provision::{
    BinaryProvisioner, DEFAULT_MIN_EMULATOR_SIZE, copy_asset, is_executable, make_executable,
};

/// Subdirectories created under the full-environment root.
pub const ROOTFS_DIRS: [&str; 6] = ["bin", "lib", "etc", "usr", "tmp", "home"];

/// Tools copied into `<root>/bin`.
pub const ROOTFS_TOOLS: [&str; 5] = ["bash", "sh", "ls", "cat", "echo"];

/// Environment file, relative to the root.
pub const ENV_FILE: &str = "etc/environment.sh";

/// Startup script, relative to the root.
pub const STARTUP_SCRIPT: &str = "startup.sh";

const ROOTFS_CATEGORY: &str = "termux";
const EMULATOR_CATEGORY: &str = "proot";
const EMULATOR_NAME: &str = "proot";

/// Which prepared environment a descriptor describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SandboxKind {
    FullEnvironment,
    RootEmulation,
}

impl fmt::Display for SandboxKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SandboxKind::FullEnvironment => f.write_str("full environment"),
            SandboxKind::RootEmulation => f.write_str("root emulation"),
        }
    }
}

/// One file a sandbox needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Marker {
    pub name: &'static str,
    pub path: PathBuf,
    /// Whether readiness also requires the execute bit.
    pub needs_exec: bool,
    pub present: bool,
    pub executable: bool,
}

impl Marker {
    fn examine(name: &'static str, path: PathBuf, needs_exec: bool) -> Self {
        let present = path.is_file();
        let executable = present && is_executable(&path);
        Self {
            name,
            path,
            needs_exec,
            present,
            executable,
        }
    }

    pub fn satisfied(&self) -> bool {
        self.present && (!self.needs_exec || self.executable)
    }
}

/// Point-in-time readiness of one sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SandboxDescriptor {
    pub kind: SandboxKind,
    pub root: PathBuf,
    pub markers: Vec<Marker>,
    pub ready: bool,
    /// Why the sandbox is not ready.
    pub reason: Option<String>,
}

impl SandboxDescriptor {
    fn from_markers(kind: SandboxKind, root: PathBuf, markers: Vec<Marker>) -> Self {
        let reason = if !root.is_dir() {
            Some(format!("{} does not exist", root.display()))
        } else {
            markers.iter().find(|m| !m.satisfied()).map(|m| {
                if m.present {
                    format!("{} is not executable", m.path.display())
                } else {
                    format!("{} is missing", m.path.display())
                }
            })
        };
        Self {
            kind,
            root,
            markers,
            ready: reason.is_none(),
            reason,
        }
    }

    fn disabled(kind: SandboxKind, root: PathBuf) -> Self {
        Self {
            kind,
            root,
            markers: Vec::new(),
            ready: false,
            reason: Some("disabled".to_string()),
        }
    }

    /// Look up a marker by name.
    pub fn marker(&self, name: &str) -> Option<&Marker> {
        self.markers.iter().find(|m| m.name == name)
    }
}

/// Prepares and inspects both sandboxes under one execution directory.
#[derive(Debug, Clone)]
pub struct SandboxBootstrapper {
    assets: Arc<dyn AssetSource>,
    rootfs: PathBuf,
    emulator: BinaryProvisioner,
    full_environment: bool,
    root_emulation: bool,
}

impl SandboxBootstrapper {
    pub fn new(assets: Arc<dyn AssetSource>, exec_dir: &Path) -> Self {
        let emulator =
            BinaryProvisioner::new(assets.clone(), EMULATOR_CATEGORY, exec_dir.join("proot"))
                .with_min_size(DEFAULT_MIN_EMULATOR_SIZE);
        Self {
            assets,
            rootfs: exec_dir.join("rootfs"),
            emulator,
            full_environment: true,
            root_emulation: true,
        }
    }

    /// Enable or disable each sandbox.
    pub fn with_enabled(mut self, full_environment: bool, root_emulation: bool) -> Self {
        self.full_environment = full_environment;
        self.root_emulation = root_emulation;
        self
    }

    pub fn with_emulator_min_size(mut self, min_size: u64) -> Self {
        self.emulator = self.emulator.with_min_size(min_size);
        self
    }

    /// Root of the full-environment tree.
    pub fn rootfs(&self) -> &Path {
        &self.rootfs
    }

    pub fn env_file(&self) -> PathBuf {
        self.rootfs.join(ENV_FILE)
    }

    pub fn startup_script(&self) -> PathBuf {
        self.rootfs.join(STARTUP_SCRIPT)
    }

    pub fn interpreter(&self) -> PathBuf {
        self.rootfs.join("bin").join("bash")
    }

    /// Path of the root-emulation executable.
    pub fn emulator_path(&self) -> PathBuf {
        self.emulator.path_for(EMULATOR_NAME)
    }

    /// Prepare both enabled sandboxes. Failures are logged, never propagated:
    /// an unprepared sandbox simply reports not ready and the selector moves on.
    pub fn prepare_all(&self, arch: Arch) {
        if self.full_environment {
            if let Err(e) = self.prepare_full_environment(arch) {
                warn!("full environment preparation failed: {:#}", e);
            }
        } else {
            debug!("full environment disabled, skipping preparation");
        }

        if self.root_emulation {
            if let Err(e) = self.prepare_root_emulation(arch) {
                warn!("root emulation preparation failed: {:#}", e);
            }
        } else {
            debug!("root emulation disabled, skipping preparation");
        }
    }

    /// Build the userland tree. Missing tools are skipped with a warning.
    pub fn prepare_full_environment(&self, arch: Arch) -> Result<()> {
        info!("preparing full environment at {}", self.rootfs.display());

        for dir in ROOTFS_DIRS {
            let path = self.rootfs.join(dir);
            fs::create_dir_all(&path)
                .with_context(|| format!("creating {}", path.display()))?;
        }

        let bin = self.rootfs.join("bin");
        for tool in ROOTFS_TOOLS {
            let source = asset_path(ROOTFS_CATEGORY, arch.abi(), &format!("bin/{tool}"));
            if !self.assets.exists(&source) {
                warn!("userland tool {} not bundled for {}, skipping", tool, arch);
                continue;
            }
            let dest = bin.join(tool);
            if !dest.is_file() {
                copy_asset(self.assets.as_ref(), &source, &dest)
                    .with_context(|| format!("copying {tool}"))?;
            }
            if !is_executable(&dest) {
                make_executable(&dest).with_context(|| format!("making {tool} executable"))?;
            }
        }

        let env_file = self.env_file();
        fs::write(&env_file, environment_script(&self.rootfs))
            .with_context(|| format!("writing {}", env_file.display()))?;
        debug!("wrote {}", env_file.display());

        let startup = self.startup_script();
        let source = format!("{ROOTFS_CATEGORY}/{STARTUP_SCRIPT}");
        if self.assets.exists(&source) {
            copy_asset(self.assets.as_ref(), &source, &startup)
                .context("copying startup script")?;
            make_executable(&startup).context("making startup script executable")?;
        } else {
            warn!("startup script {} not bundled", source);
        }

        let descriptor = self.full_environment();
        if descriptor.ready {
            info!("full environment ready");
        } else {
            warn!(
                "full environment not ready: {}",
                descriptor.reason.as_deref().unwrap_or("unknown")
            );
        }
        Ok(())
    }

    /// Provision the root-emulation executable.
    pub fn prepare_root_emulation(&self, arch: Arch) -> Result<()> {
        let path = self
            .emulator
            .ensure(EMULATOR_NAME, arch)
            .context("provisioning proot")?;
        info!("root emulation ready at {}", path.display());
        Ok(())
    }

    /// Readiness of the full environment.
    pub fn full_environment(&self) -> SandboxDescriptor {
        if !self.full_environment {
            return SandboxDescriptor::disabled(SandboxKind::FullEnvironment, self.rootfs.clone());
        }
        let markers = vec![
            Marker::examine("interpreter", self.interpreter(), true),
            Marker::examine("environment", self.env_file(), false),
            Marker::examine("startup", self.startup_script(), true),
        ];
        SandboxDescriptor::from_markers(SandboxKind::FullEnvironment, self.rootfs.clone(), markers)
    }

    /// Readiness of the root-emulation tool.
    pub fn root_emulation(&self) -> SandboxDescriptor {
        let root = self.emulator.dest_dir().to_path_buf();
        if !self.root_emulation {
            return SandboxDescriptor::disabled(SandboxKind::RootEmulation, root);
        }
        let markers = vec![Marker::examine("emulator", self.emulator_path(), true)];
        SandboxDescriptor::from_markers(SandboxKind::RootEmulation, root, markers)
    }

    /// Installed userland tools, for diagnostics.
    pub fn tools(&self) -> Vec<(&'static str, bool)> {
        let bin = self.rootfs.join("bin");
        ROOTFS_TOOLS
            .iter()
            .map(|tool| (*tool, is_executable(&bin.join(tool))))
            .collect()
    }
}

/// Contents of `etc/environment.sh` for a root.
pub fn environment_script(root: &Path) -> String {
    let root = root.display();
    format!(
        "export PATH=\"{root}/bin:$PATH\"\n\
         export LD_LIBRARY_PATH=\"{root}/lib:$LD_LIBRARY_PATH\"\n\
         export TERMUX_PREFIX=\"{root}\"\n\
         export HOME=\"{root}/home\"\n\
         export TMPDIR=\"{root}/tmp\"\n"
    )
}

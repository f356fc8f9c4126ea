//! Environment diagnostics.
//!
//! Strategy fallback is silent on the launch path, so this report is
//! where it becomes visible: which ABI was picked, which sandbox markers are
//! missing, what the provisioned binaries look like and which strategy a launch
//! would use right now. Collecting it never writes anything.

use chrono::{DateTime, Local};
use serde::Serialize;
use std::fmt;

use crate::arch::{Arch, Resolution};
use crate::assets::{AssetSource, asset_path};
use crate::launch::LaunchStrategy;
use crate::models::{Role, RunState};
use crate::provision::BinaryStatus;
use crate::sandbox::{SandboxBootstrapper, SandboxDescriptor};

/// Inputs gathered by the service.
pub struct Inputs<'a> {
    pub abis: &'a [String],
    pub resolution: Resolution,
    pub assets: &'a dyn AssetSource,
    pub sandboxes: &'a SandboxBootstrapper,
    pub binaries: Vec<BinaryStatus>,
    pub running: Vec<RunState>,
    pub recommended: Vec<(Role, Option<LaunchStrategy>)>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AssetStatus {
    pub path: String,
    pub bundled: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolStatus {
    pub name: String,
    pub installed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Recommendation {
    pub role: Role,
    pub strategy: Option<LaunchStrategy>,
}

/// Point-in-time diagnostic report.
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticReport {
    pub generated_at: DateTime<Local>,
    pub abis: Vec<String>,
    pub arch: Arch,
    pub arch_matched: bool,
    pub euid: u32,
    pub asset_source: String,
    pub assets: Vec<AssetStatus>,
    pub full_environment: SandboxDescriptor,
    pub tools: Vec<ToolStatus>,
    pub root_emulation: SandboxDescriptor,
    pub binaries: Vec<BinaryStatus>,
    pub running: Vec<RunState>,
    pub recommended: Vec<Recommendation>,
}

pub fn collect(inputs: Inputs<'_>) -> DiagnosticReport {
    let arch = inputs.resolution.arch;
    let assets = [
        asset_path("frp", arch.abi(), "frpc"),
        asset_path("frp", arch.abi(), "frps"),
        asset_path("proot", arch.abi(), "proot"),
        asset_path("termux", arch.abi(), "bin/bash"),
        "termux/startup.sh".to_string(),
    ]
    .into_iter()
    .map(|path| AssetStatus {
        bundled: inputs.assets.exists(&path),
        path,
    })
    .collect();

    DiagnosticReport {
        generated_at: Local::now(),
        abis: inputs.abis.to_vec(),
        arch,
        arch_matched: inputs.resolution.matched,
        euid: rustix::process::geteuid().as_raw(),
        asset_source: inputs.assets.describe(),
        assets,
        full_environment: inputs.sandboxes.full_environment(),
        tools: inputs
            .sandboxes
            .tools()
            .into_iter()
            .map(|(name, installed)| ToolStatus {
                name: name.to_string(),
                installed,
            })
            .collect(),
        root_emulation: inputs.sandboxes.root_emulation(),
        binaries: inputs.binaries,
        running: inputs.running,
        recommended: inputs
            .recommended
            .into_iter()
            .map(|(role, strategy)| Recommendation { role, strategy })
            .collect(),
    }
}

fn mark(ok: bool) -> &'static str {
    if ok { "ok" } else { "MISSING" }
}

fn write_sandbox(f: &mut fmt::Formatter<'_>, desc: &SandboxDescriptor) -> fmt::Result {
    writeln!(f, "  root: {}", desc.root.display())?;
    for marker in &desc.markers {
        let state = if !marker.present {
            "missing"
        } else if marker.needs_exec && !marker.executable {
            "not executable"
        } else {
            "ok"
        };
        writeln!(f, "  {:<12} {} ({})", marker.name, marker.path.display(), state)?;
    }
    match &desc.reason {
        None => writeln!(f, "  ready: yes"),
        Some(reason) => writeln!(f, "  ready: no ({reason})"),
    }
}

impl fmt::Display for DiagnosticReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== proxyvisor diagnostics ===")?;
        writeln!(f, "time: {}", self.generated_at.format("%Y-%m-%d %H:%M:%S"))?;
        writeln!(f, "euid: {}", self.euid)?;
        writeln!(f)?;

        writeln!(f, "[architecture]")?;
        writeln!(f, "  reported ABIs: {}", self.abis.join(", "))?;
        writeln!(
            f,
            "  selected: {} ({}){}",
            self.arch,
            self.arch.abi(),
            if self.arch_matched {
                ""
            } else {
                " [default, no ABI matched]"
            }
        )?;
        writeln!(f)?;

        writeln!(f, "[assets] {}", self.asset_source)?;
        for asset in &self.assets {
            writeln!(f, "  {:<28} {}", asset.path, mark(asset.bundled))?;
        }
        writeln!(f)?;

        writeln!(f, "[full environment]")?;
        write_sandbox(f, &self.full_environment)?;
        let tools: Vec<String> = self
            .tools
            .iter()
            .map(|t| format!("{}={}", t.name, if t.installed { "yes" } else { "no" }))
            .collect();
        writeln!(f, "  tools: {}", tools.join(" "))?;
        writeln!(f)?;

        writeln!(f, "[root emulation]")?;
        write_sandbox(f, &self.root_emulation)?;
        writeln!(f)?;

        writeln!(f, "[binaries]")?;
        for binary in &self.binaries {
            writeln!(f, "  {}", binary.path.display())?;
            if !binary.exists {
                writeln!(f, "    not provisioned")?;
                continue;
            }
            writeln!(
                f,
                "    size: {} bytes, executable: {}, elf: {}",
                binary.size,
                if binary.executable { "yes" } else { "no" },
                if binary.elf { "yes" } else { "no" }
            )?;
            writeln!(f, "    header: {}", binary.header_hex())?;
        }
        writeln!(f)?;

        writeln!(f, "[running] {}", self.running.len())?;
        for state in &self.running {
            writeln!(
                f,
                "  {} pid={} via={} since={}",
                state.config_id,
                state
                    .pid
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "unknown".into()),
                state
                    .strategy
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "-".into()),
                state
                    .start_time
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "-".into())
            )?;
        }
        writeln!(f)?;

        writeln!(f, "[recommended strategy]")?;
        for rec in &self.recommended {
            match rec.strategy {
                Some(strategy) => writeln!(f, "  {}: {}", rec.role.executable(), strategy)?,
                None => writeln!(
                    f,
                    "  {}: none (binary not provisioned or not executable)",
                    rec.role.executable()
                )?,
            }
        }
        Ok(())
    }
}

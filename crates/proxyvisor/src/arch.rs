//! Host architecture detection.
//!
//! Maps the ABI identifiers reported by the host to one of the four architectures
//! we ship binaries for. The bundled asset tree is laid out by Android ABI name
//! (`frp/arm64-v8a/frpc`, `proot/x86_64/proot`, ...), so each [`Arch`] also knows
//! its asset directory.

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Supported target architectures, in resolution priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Arch {
    Arm64,
    Armv7,
    X86_64,
    X86,
}

impl Arch {
    /// Resolution priority: earlier entries win when several match.
    pub const PRIORITY: [Arch; 4] = [Arch::Arm64, Arch::Armv7, Arch::X86_64, Arch::X86];

    /// Architecture used when nothing in the ABI list is recognized.
    pub const DEFAULT: Arch = Arch::Arm64;

    /// Short architecture name.
    pub fn as_str(self) -> &'static str {
        match self {
            Arch::Arm64 => "arm64",
            Arch::Armv7 => "armv7",
            Arch::X86_64 => "x86_64",
            Arch::X86 => "x86",
        }
    }

    /// Android ABI name, used as the asset directory for this architecture.
    pub fn abi(self) -> &'static str {
        match self {
            Arch::Arm64 => "arm64-v8a",
            Arch::Armv7 => "armeabi-v7a",
            Arch::X86_64 => "x86_64",
            Arch::X86 => "x86",
        }
    }

    /// Whether an ABI identifier names this architecture.
    pub fn matches(self, abi: &str) -> bool {
        let abi = abi.trim().to_ascii_lowercase();
        let aliases: &[&str] = match self {
            Arch::Arm64 => &["arm64-v8a", "arm64", "aarch64"],
            Arch::Armv7 => &["armeabi-v7a", "armeabi", "armv7", "armv7l", "arm"],
            Arch::X86_64 => &["x86_64", "amd64", "x86-64"],
            Arch::X86 => &["x86", "i386", "i686"],
        };
        aliases.contains(&abi.as_str())
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of resolving an ABI list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub arch: Arch,
    /// False when no ABI matched and [`Arch::DEFAULT`] was substituted.
    pub matched: bool,
}

/// Resolve a list of host ABI identifiers to a supported architecture.
///
/// An empty or wholly unrecognized list resolves to `arm64` with a warning; binaries
/// may then fail to execute, which is reported rather than corrected.
pub fn resolve<S: AsRef<str>>(abis: &[S]) -> Resolution {
    for arch in Arch::PRIORITY {
        if abis.iter().any(|abi| arch.matches(abi.as_ref())) {
            debug!("resolved architecture {} from ABIs {:?}", arch, joined(abis));
            return Resolution {
                arch,
                matched: true,
            };
        }
    }

    warn!(
        "no supported architecture in ABIs [{}], defaulting to {}",
        joined(abis),
        Arch::DEFAULT
    );
    Resolution {
        arch: Arch::DEFAULT,
        matched: false,
    }
}

fn joined<S: AsRef<str>>(abis: &[S]) -> String {
    abis.iter()
        .map(|a| a.as_ref())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Discover the ABI identifiers supported by this host.
///
/// Android exposes the full list through `ro.product.cpu.abilist`; everywhere else
/// the compile-time target architecture is the only thing we know.
pub fn host_abis() -> Vec<String> {
    if let Some(list) = android_abi_list() {
        return list;
    }
    vec![std::env::consts::ARCH.to_string()]
}

fn android_abi_list() -> Option<Vec<String>> {
    let output = std::process::Command::new("getprop")
        .arg("ro.product.cpu.abilist")
        .stderr(std::process::Stdio::null())
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let list: Vec<String> = String::from_utf8_lossy(&output.stdout)
        .trim()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect();
    if list.is_empty() { None } else { Some(list) }
}

//! Binary provisioning.
//!
//! Copies architecture-specific executables out of the bundled asset source into
//! a writable execution directory and makes them executable. Provisioning is
//! idempotent: an existing file that passes validation is never re-copied.

use log::{debug, info, warn};
use serde::Serialize;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use crate::arch::Arch;
use crate::assets::{AssetSource, asset_path};
use crate::error::{ProvisionError, ProvisionResult};

/// Leading bytes of every ELF executable.
pub const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];

/// Read buffer used while copying assets.
const COPY_BUFFER_SIZE: usize = 8 * 1024;

/// Default size floor for proxy binaries.
pub const DEFAULT_MIN_BINARY_SIZE: u64 = 1024 * 1024;

/// Default size floor for the root-emulation tool.
pub const DEFAULT_MIN_EMULATOR_SIZE: u64 = 100 * 1024;

/// Copies one category of bundled executables into a destination directory.
#[derive(Debug, Clone)]
pub struct BinaryProvisioner {
    assets: Arc<dyn AssetSource>,
    category: String,
    dest_dir: PathBuf,
    min_size: u64,
}

impl BinaryProvisioner {
    /// Provision `<category>/<abi>/<name>` assets into `dest_dir`.
    pub fn new(
        assets: Arc<dyn AssetSource>,
        category: impl Into<String>,
        dest_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            assets,
            category: category.into(),
            dest_dir: dest_dir.into(),
            min_size: DEFAULT_MIN_BINARY_SIZE,
        }
    }

    /// Override the minimum size a valid binary must exceed.
    pub fn with_min_size(mut self, min_size: u64) -> Self {
        self.min_size = min_size;
        self
    }

    pub fn dest_dir(&self) -> &Path {
        &self.dest_dir
    }

    /// Destination path for an executable name.
    pub fn path_for(&self, name: &str) -> PathBuf {
        self.dest_dir.join(name)
    }

    /// Make sure `name` exists at its destination, is a valid executable and has
    /// execute permission. Returns the destination path.
    ///
    /// Callers must still re-check `exists && executable` before launching; the
    /// filesystem may change underneath us.
    pub fn ensure(&self, name: &str, arch: Arch) -> ProvisionResult<PathBuf> {
        let dest = self.path_for(name);

        match self.validate(&dest) {
            Ok(()) => {
                debug!("{} already provisioned, skipping copy", dest.display());
            }
            Err(reason) => {
                if dest.exists() {
                    warn!("existing {} is invalid ({}), re-copying", dest.display(), reason);
                    fs::remove_file(&dest).map_err(|e| ProvisionError::io(&dest, e))?;
                }
                let source = asset_path(&self.category, arch.abi(), name);
                copy_asset(self.assets.as_ref(), &source, &dest)?;
                self.validate(&dest)
                    .map_err(|reason| ProvisionError::InvalidBinary {
                        path: dest.clone(),
                        reason,
                    })?;
            }
        }

        if !is_executable(&dest) {
            make_executable(&dest)?;
        }
        Ok(dest)
    }

    /// Read-only view of a provisioned file, for diagnostics.
    pub fn inspect(&self, name: &str) -> BinaryStatus {
        BinaryStatus::examine(&self.path_for(name))
    }

    fn validate(&self, path: &Path) -> Result<(), String> {
        let meta = match fs::metadata(path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err("missing".to_string()),
            Err(e) => return Err(e.to_string()),
        };
        if !meta.is_file() {
            return Err("not a regular file".to_string());
        }
        if meta.len() <= self.min_size {
            return Err(format!(
                "size {} bytes does not exceed {} bytes",
                meta.len(),
                self.min_size
            ));
        }
        match read_header(path, ELF_MAGIC.len()) {
            Ok(header) if header == ELF_MAGIC => Ok(()),
            Ok(_) => Err("not an ELF executable".to_string()),
            Err(e) => Err(format!("unreadable header: {e}")),
        }
    }
}

/// Stream one asset to `dest` through an 8 KiB buffer, creating parent directories.
pub fn copy_asset(assets: &dyn AssetSource, source: &str, dest: &Path) -> ProvisionResult<u64> {
    info!("copying asset {} -> {}", source, dest.display());

    let mut reader = assets.open(source).map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            ProvisionError::AssetMissing(source.to_string())
        } else {
            ProvisionError::io(dest, e)
        }
    })?;

    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(|e| ProvisionError::io(parent, e))?;
    }
    let mut out = File::create(dest).map_err(|e| ProvisionError::io(dest, e))?;

    let mut buf = [0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(ProvisionError::io(dest, e)),
        };
        out.write_all(&buf[..n])
            .map_err(|e| ProvisionError::io(dest, e))?;
        total += n as u64;
    }
    out.sync_all().map_err(|e| ProvisionError::io(dest, e))?;

    debug!("copied {} bytes to {}", total, dest.display());
    Ok(total)
}

/// Set mode 0755, falling back to `chmod 755` when the API call fails.
pub fn make_executable(path: &Path) -> ProvisionResult<()> {
    let primary = fs::set_permissions(path, fs::Permissions::from_mode(0o755));
    match primary {
        Ok(()) if is_executable(path) => return Ok(()),
        Ok(()) => warn!(
            "set_permissions succeeded but {} is still not executable, trying chmod",
            path.display()
        ),
        Err(ref e) => warn!(
            "set_permissions failed for {}: {}, trying chmod",
            path.display(),
            e
        ),
    }

    let status = Command::new("chmod").arg("755").arg(path).status();
    match status {
        Ok(status) if status.success() && is_executable(path) => {
            debug!("chmod 755 {} succeeded", path.display());
            Ok(())
        }
        Ok(status) => Err(ProvisionError::NotExecutable {
            path: path.to_path_buf(),
            detail: format!("chmod {status}"),
        }),
        Err(e) => Err(ProvisionError::NotExecutable {
            path: path.to_path_buf(),
            detail: format!("chmod could not run: {e}"),
        }),
    }
}

/// A regular file with at least one execute bit set.
pub fn is_executable(path: &Path) -> bool {
    fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

fn read_header(path: &Path, len: usize) -> io::Result<Vec<u8>> {
    let mut file = File::open(path)?;
    let mut header = Vec::with_capacity(len);
    Read::by_ref(&mut file).take(len as u64).read_to_end(&mut header)?;
    Ok(header)
}

/// Snapshot of one binary on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BinaryStatus {
    pub path: PathBuf,
    pub exists: bool,
    pub executable: bool,
    pub size: u64,
    pub elf: bool,
    /// First 16 bytes, for the diagnostic report.
    pub header: Vec<u8>,
}

impl BinaryStatus {
    pub fn examine(path: &Path) -> Self {
        let meta = fs::metadata(path).ok();
        let header = read_header(path, 16).unwrap_or_default();
        Self {
            path: path.to_path_buf(),
            exists: meta.is_some(),
            executable: is_executable(path),
            size: meta.map(|m| m.len()).unwrap_or(0),
            elf: header.starts_with(&ELF_MAGIC),
            header,
        }
    }

    /// Exists and executable.
    pub fn runnable(&self) -> bool {
        self.exists && self.executable
    }

    pub fn header_hex(&self) -> String {
        self.header
            .iter()
            .map(|b| format!("0x{b:02X}"))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::DirAssetSource;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts how many times an asset is opened.
    struct CountingSource {
        inner: DirAssetSource,
        opens: AtomicUsize,
    }

    impl AssetSource for CountingSource {
        fn open(&self, path: &str) -> io::Result<Box<dyn Read + Send>> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            self.inner.open(path)
        }

        fn exists(&self, path: &str) -> bool {
            self.inner.exists(path)
        }

        fn describe(&self) -> String {
            self.inner.describe()
        }
    }

    fn fake_elf(size: usize) -> Vec<u8> {
        let mut bytes = ELF_MAGIC.to_vec();
        bytes.resize(size, 0xAB);
        bytes
    }

    fn setup() -> (tempfile::TempDir, Arc<CountingSource>, BinaryProvisioner) {
        let dir = tempfile::tempdir().unwrap();
        let assets = dir.path().join("assets");
        fs::create_dir_all(assets.join("frp/x86_64")).unwrap();
        fs::write(assets.join("frp/x86_64/frpc"), fake_elf(20_000)).unwrap();

        let source = Arc::new(CountingSource {
            inner: DirAssetSource::new(&assets),
            opens: AtomicUsize::new(0),
        });
        let provisioner = BinaryProvisioner::new(source.clone(), "frp", dir.path().join("exec"))
            .with_min_size(1024);
        (dir, source, provisioner)
    }

    #[test]
    fn test_ensure_copies_and_sets_executable() {
        let (_dir, source, provisioner) = setup();
        let path = provisioner.ensure("frpc", Arch::X86_64).unwrap();

        assert!(path.exists());
        assert!(is_executable(&path));
        assert_eq!(fs::metadata(&path).unwrap().len(), 20_000);
        assert_eq!(source.opens.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_ensure_is_idempotent() {
        let (_dir, source, provisioner) = setup();
        provisioner.ensure("frpc", Arch::X86_64).unwrap();
        provisioner.ensure("frpc", Arch::X86_64).unwrap();
        provisioner.ensure("frpc", Arch::X86_64).unwrap();
        assert_eq!(source.opens.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_corrupted_binary_is_replaced() {
        let (_dir, source, provisioner) = setup();
        let dest = provisioner.path_for("frpc");
        fs::create_dir_all(dest.parent().unwrap()).unwrap();
        let mut garbage = b"MZ\x90\x00".to_vec();
        garbage.resize(50_000, 0);
        fs::write(&dest, garbage).unwrap();

        let path = provisioner.ensure("frpc", Arch::X86_64).unwrap();
        let status = BinaryStatus::examine(&path);
        assert!(status.exists);
        assert!(status.executable);
        assert!(status.elf);
        assert_eq!(status.size, 20_000);
        assert_eq!(source.opens.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_undersized_binary_is_replaced() {
        let (_dir, source, provisioner) = setup();
        let dest = provisioner.path_for("frpc");
        fs::create_dir_all(dest.parent().unwrap()).unwrap();
        fs::write(&dest, fake_elf(100)).unwrap();

        provisioner.ensure("frpc", Arch::X86_64).unwrap();
        assert_eq!(fs::metadata(&dest).unwrap().len(), 20_000);
        assert_eq!(source.opens.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_valid_but_not_executable_is_fixed_without_copy() {
        let (_dir, source, provisioner) = setup();
        let dest = provisioner.path_for("frpc");
        fs::create_dir_all(dest.parent().unwrap()).unwrap();
        fs::write(&dest, fake_elf(4096)).unwrap();
        fs::set_permissions(&dest, fs::Permissions::from_mode(0o644)).unwrap();

        provisioner.ensure("frpc", Arch::X86_64).unwrap();
        assert!(is_executable(&dest));
        assert_eq!(source.opens.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_missing_asset_for_arch() {
        let (_dir, _source, provisioner) = setup();
        let err = provisioner.ensure("frpc", Arch::Armv7).unwrap_err();
        assert!(matches!(err, ProvisionError::AssetMissing(ref p) if p == "frp/armeabi-v7a/frpc"));
    }

    #[test]
    fn test_invalid_asset_is_rejected_after_copy() {
        let (dir, _source, provisioner) = setup();
        fs::write(dir.path().join("assets/frp/x86_64/frps"), b"#!/bin/sh\necho hi\n").unwrap();
        let err = provisioner.ensure("frps", Arch::X86_64).unwrap_err();
        assert!(matches!(err, ProvisionError::InvalidBinary { .. }));
    }

    #[test]
    fn test_inspect_reports_header() {
        let (_dir, _source, provisioner) = setup();
        assert!(!provisioner.inspect("frpc").exists);

        provisioner.ensure("frpc", Arch::X86_64).unwrap();
        let status = provisioner.inspect("frpc");
        assert!(status.runnable());
        assert!(status.header_hex().starts_with("0x7F 0x45 0x4C 0x46"));
    }

    #[test]
    fn test_read_header_stops_at_file_end() {
        let dir = tempfile::tempdir().unwrap();
        let short = dir.path().join("short");
        fs::write(&short, [0x7F, b'E']).unwrap();
        assert_eq!(read_header(&short, 4).unwrap(), vec![0x7F, b'E']);

        let long = dir.path().join("long");
        fs::write(&long, fake_elf(64)).unwrap();
        assert_eq!(read_header(&long, 4).unwrap(), ELF_MAGIC.to_vec());
        assert!(read_header(&dir.path().join("absent"), 4).is_err());
    }
}

//! Read-only source of bundled payloads (proxy binaries, root-emulation tool,
//! userland tools and scripts).
//!
//! Assets are addressed by slash-separated paths such as `frp/arm64-v8a/frpc`.

use std::fs::File;
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};

/// A source of bundled, read-only byte streams.
pub trait AssetSource: Send + Sync {
    /// Open an asset for reading. Missing assets yield `ErrorKind::NotFound`.
    fn open(&self, path: &str) -> io::Result<Box<dyn Read + Send>>;

    /// Check whether an asset exists without opening it.
    fn exists(&self, path: &str) -> bool;

    /// Human-readable location, for diagnostics.
    fn describe(&self) -> String;
}

impl std::fmt::Debug for dyn AssetSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AssetSource({})", self.describe())
    }
}

/// Build the canonical `<category>/<arch>/<name>` asset path.
pub fn asset_path(category: &str, arch_dir: &str, name: &str) -> String {
    format!("{category}/{arch_dir}/{name}")
}

/// Assets stored as plain files under a directory.
#[derive(Debug, Clone)]
pub struct DirAssetSource {
    root: PathBuf,
}

impl DirAssetSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve an asset path below the root, refusing anything that would escape it.
    fn resolve(&self, path: &str) -> io::Result<PathBuf> {
        let relative = Path::new(path.trim_start_matches('/'));
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid asset path: {path}"),
            ));
        }
        Ok(self.root.join(relative))
    }
}

impl AssetSource for DirAssetSource {
    fn open(&self, path: &str) -> io::Result<Box<dyn Read + Send>> {
        let full = self.resolve(path)?;
        if full.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("asset is a directory: {path}"),
            ));
        }
        Ok(Box::new(File::open(full)?))
    }

    fn exists(&self, path: &str) -> bool {
        self.resolve(path).map(|p| p.is_file()).unwrap_or(false)
    }

    fn describe(&self) -> String {
        self.root.display().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_existing_asset() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("frp/x86_64")).unwrap();
        std::fs::write(dir.path().join("frp/x86_64/frpc"), b"payload").unwrap();

        let source = DirAssetSource::new(dir.path());
        let path = asset_path("frp", "x86_64", "frpc");
        assert!(source.exists(&path));

        let mut buf = String::new();
        source.open(&path).unwrap().read_to_string(&mut buf).unwrap();
        assert_eq!(buf, "payload");
    }

    #[test]
    fn test_missing_asset_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let source = DirAssetSource::new(dir.path());
        assert!(!source.exists("frp/x86/frps"));
        let err = source.open("frp/x86/frps").err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_rejects_escaping_paths() {
        let dir = tempfile::tempdir().unwrap();
        let source = DirAssetSource::new(dir.path());
        let err = source.open("../etc/passwd").err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert!(!source.exists("frp/../../x"));
    }
}

use std::path::{Path, PathBuf};

use crate::{AssetError, AssetStore, normalize_path};

/// Asset store rooted at a directory on disk.
#[derive(Debug, Clone)]
pub struct FileAssetStore {
    root: PathBuf,
}

impl FileAssetStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        log::debug!("Asset store rooted at {}", root.display());
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(normalize_path(path))
    }
}

impl AssetStore for FileAssetStore {
    fn read_bytes(&self, path: &str) -> Result<Vec<u8>, AssetError> {
        let full = self.resolve(path);
        std::fs::read(&full).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                AssetError::NotFound {
                    path: path.to_string(),
                }
            } else {
                AssetError::Io {
                    path: path.to_string(),
                    source,
                }
            }
        })
    }

    fn exists(&self, path: &str) -> bool {
        self.resolve(path).is_file()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reads_file_under_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("shaders")).unwrap();
        std::fs::write(dir.path().join("shaders/basic.wgsl"), "// wgsl").unwrap();

        let store = FileAssetStore::new(dir.path());
        assert!(store.exists("shaders/basic.wgsl"));
        assert_eq!(store.read_text("shaders\\basic.wgsl").unwrap(), "// wgsl");
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileAssetStore::new(dir.path());
        assert!(!store.exists("missing.json"));
        assert!(matches!(
            store.read_bytes("missing.json"),
            Err(AssetError::NotFound { .. })
        ));
    }

    #[test]
    fn test_directory_is_not_an_asset() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("textures")).unwrap();
        let store = FileAssetStore::new(dir.path());
        assert!(!store.exists("textures"));
    }
}

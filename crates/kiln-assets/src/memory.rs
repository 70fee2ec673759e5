use rustc_hash::FxHashMap;

use crate::{AssetError, AssetStore, normalize_path};

/// Asset store holding its content in memory.
#[derive(Debug, Default, Clone)]
pub struct MemoryAssetStore {
    entries: FxHashMap<String, Vec<u8>>,
}

impl MemoryAssetStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a text asset.
    pub fn insert_text(&mut self, path: &str, text: &str) {
        self.insert_bytes(path, text.as_bytes().to_vec());
    }

    /// Insert or replace a binary asset.
    pub fn insert_bytes(&mut self, path: &str, bytes: Vec<u8>) {
        self.entries.insert(normalize_path(path), bytes);
    }

    pub fn remove(&mut self, path: &str) -> bool {
        self.entries.remove(&normalize_path(path)).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl AssetStore for MemoryAssetStore {
    fn read_bytes(&self, path: &str) -> Result<Vec<u8>, AssetError> {
        self.entries
            .get(&normalize_path(path))
            .cloned()
            .ok_or_else(|| AssetError::NotFound {
                path: path.to_string(),
            })
    }

    fn exists(&self, path: &str) -> bool {
        self.entries.contains_key(&normalize_path(path))
    }
}

//! Asset access for Kiln.
//!
//! The renderer never touches the filesystem directly. Definitions, shader
//! sources and texture images are read through an [`AssetStore`], which is
//! either backed by a directory ([`FileAssetStore`]) or by an in-memory map
//! ([`MemoryAssetStore`]) used for built-in content and tests.

mod file;
mod memory;

use thiserror::Error;

pub use file::FileAssetStore;
pub use memory::MemoryAssetStore;

/// Shader definition used by the G-buffer geometry pass.
pub const SHADER_DEFINITION_GBUFFER: &str = "renderer/shaders/gbuffer.shader.json";
/// Shader definition used by the deferred lighting pass.
pub const SHADER_DEFINITION_LIGHTING: &str = "renderer/shaders/gbuffer_lighting.shader.json";

/// Errors raised while reading an asset.
#[derive(Debug, Error)]
pub enum AssetError {
    #[error("asset not found: {path}")]
    NotFound { path: String },

    #[error("failed to read asset {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("asset {path} is not valid UTF-8")]
    InvalidUtf8 { path: String },
}

/// Read-only access to engine content by relative path.
pub trait AssetStore {
    /// Raw bytes of the asset at `path`.
    fn read_bytes(&self, path: &str) -> Result<Vec<u8>, AssetError>;

    /// Whether an asset exists at `path`.
    fn exists(&self, path: &str) -> bool;

    /// The asset at `path` decoded as UTF-8 text.
    fn read_text(&self, path: &str) -> Result<String, AssetError> {
        let bytes = self.read_bytes(path)?;
        String::from_utf8(bytes).map_err(|_| AssetError::InvalidUtf8 {
            path: path.to_string(),
        })
    }
}

/// Normalise separators so `a\\b.json` and `./a/b.json` name the same asset.
pub(crate) fn normalize_path(path: &str) -> String {
    let unified = path.replace('\\', "/");
    unified
        .split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect::<Vec<_>>()
        .join("/")
}

//! Device images and the texture cache.
//!
//! Texture requests decode the image immediately so a bad asset fails the
//! caller, but the device image is only created in [`TextureCache::create_pending`].

use std::rc::Rc;

use kiln_assets::{AssetError, AssetStore};
use rustc_hash::FxHashMap;

use crate::backend::{
    BackendError, Extent2d, GpuBackend, ImageAspect, ImageDesc, ImageLayout, ImageUsage,
    TextureFilter, TextureFormat,
};

/// Format every asset-backed texture is uploaded as.
pub const ASSET_TEXTURE_FORMAT: TextureFormat = TextureFormat::Rgba8UnormSrgb;

/// Errors that can occur while requesting a texture.
#[derive(Debug, thiserror::Error)]
pub enum TextureError {
    #[error("failed to read texture {path}: {source}")]
    Asset {
        path: String,
        #[source]
        source: AssetError,
    },

    #[error("failed to decode texture {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: image::ImageError,
    },

    #[error("texture {path} has zero dimensions ({width}x{height})")]
    ZeroDimensions {
        path: String,
        width: u32,
        height: u32,
    },
}

/// An image with one view and one sampler.
pub struct GpuImage<B: GpuBackend> {
    pub image: B::Image,
    pub view: B::ImageView,
    pub sampler: B::Sampler,
    pub format: TextureFormat,
    pub extent: Extent2d,
    pub samples: u32,
}

impl<B: GpuBackend> GpuImage<B> {
    /// Create the image, its view and a sampler. Nothing is left behind on
    /// failure.
    pub fn create(
        backend: &mut B,
        desc: &ImageDesc<'_>,
        aspect: ImageAspect,
        filter: TextureFilter,
    ) -> Result<Self, BackendError> {
        let image = backend.create_image(desc)?;
        let view = match backend.create_image_view(&image, aspect) {
            Ok(view) => view,
            Err(err) => {
                backend.destroy_image(image);
                return Err(err);
            }
        };
        let sampler = match backend.create_sampler(filter, desc.mip_levels) {
            Ok(sampler) => sampler,
            Err(err) => {
                backend.destroy_image_view(view);
                backend.destroy_image(image);
                return Err(err);
            }
        };
        Ok(Self {
            image,
            view,
            sampler,
            format: desc.format,
            extent: desc.extent,
            samples: desc.samples,
        })
    }

    /// A single-sample render target sized `extent`, sampled linearly.
    pub fn attachment(
        backend: &mut B,
        label: &str,
        format: TextureFormat,
        extent: Extent2d,
    ) -> Result<Self, BackendError> {
        let (usage, aspect) = if format.is_depth() {
            (
                ImageUsage::DEPTH_STENCIL_ATTACHMENT | ImageUsage::SAMPLED,
                ImageAspect::Depth,
            )
        } else {
            (
                ImageUsage::COLOR_ATTACHMENT | ImageUsage::TRANSFER_SRC | ImageUsage::SAMPLED,
                ImageAspect::Color,
            )
        };
        let desc = ImageDesc {
            label,
            extent,
            mip_levels: 1,
            samples: 1,
            format,
            usage,
        };
        Self::create(backend, &desc, aspect, TextureFilter::Linear)
    }

    pub fn aspect(&self) -> ImageAspect {
        if self.format.is_depth() {
            ImageAspect::Depth
        } else {
            ImageAspect::Color
        }
    }

    pub fn destroy(self, backend: &mut B) {
        backend.destroy_sampler(self.sampler);
        backend.destroy_image_view(self.view);
        backend.destroy_image(self.image);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureId(usize);

/// A resolved texture: cache slot plus the key instance caches are built from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TextureRef {
    pub id: TextureId,
    pub key: Rc<str>,
}

/// Cache key for an asset texture: its path plus the sampler filter.
pub fn texture_key(path: &str, filter: TextureFilter) -> String {
    format!("{path}#{filter}")
}

pub struct Texture<B: GpuBackend> {
    key: Rc<str>,
    path: String,
    filter: TextureFilter,
    extent: Extent2d,
    pixels: Option<Vec<u8>>,
    gpu: Option<GpuImage<B>>,
    failed: bool,
}

impl<B: GpuBackend> Texture<B> {
    pub fn key(&self) -> &Rc<str> {
        &self.key
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn filter(&self) -> TextureFilter {
        self.filter
    }

    pub fn extent(&self) -> Extent2d {
        self.extent
    }

    /// The device image once `create_pending` has uploaded it.
    pub fn gpu(&self) -> Option<&GpuImage<B>> {
        self.gpu.as_ref()
    }

    pub fn is_ready(&self) -> bool {
        self.gpu.is_some()
    }

    /// Whether device creation was attempted and failed.
    pub fn has_failed(&self) -> bool {
        self.failed
    }
}

/// Asset textures keyed by path and filter.
pub struct TextureCache<B: GpuBackend> {
    textures: Vec<Texture<B>>,
    by_key: FxHashMap<Rc<str>, TextureId>,
    pending: Vec<TextureId>,
}

impl<B: GpuBackend> Default for TextureCache<B> {
    fn default() -> Self {
        Self {
            textures: Vec::new(),
            by_key: FxHashMap::default(),
            pending: Vec::new(),
        }
    }
}

impl<B: GpuBackend> TextureCache<B> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the texture for `path` sampled with `filter`.
    pub fn texture(
        &mut self,
        assets: &dyn AssetStore,
        path: &str,
        filter: TextureFilter,
    ) -> Result<TextureRef, TextureError> {
        let key = texture_key(path, filter);
        if let Some(&id) = self.by_key.get(key.as_str()) {
            return Ok(TextureRef {
                id,
                key: Rc::clone(&self.textures[id.0].key),
            });
        }

        let bytes = assets.read_bytes(path).map_err(|source| TextureError::Asset {
            path: path.to_string(),
            source,
        })?;
        let rgba = image::load_from_memory(&bytes)
            .map_err(|source| TextureError::Decode {
                path: path.to_string(),
                source,
            })?
            .to_rgba8();
        let (width, height) = rgba.dimensions();
        if width == 0 || height == 0 {
            return Err(TextureError::ZeroDimensions {
                path: path.to_string(),
                width,
                height,
            });
        }

        let id = TextureId(self.textures.len());
        let key: Rc<str> = Rc::from(key);
        self.textures.push(Texture {
            key: Rc::clone(&key),
            path: path.to_string(),
            filter,
            extent: Extent2d::new(width, height),
            pixels: Some(rgba.into_raw()),
            gpu: None,
            failed: false,
        });
        self.by_key.insert(Rc::clone(&key), id);
        self.pending.push(id);
        log::debug!("Queued texture {path} ({width}x{height}, {filter})");
        Ok(TextureRef { id, key })
    }

    pub fn get(&self, id: TextureId) -> Option<&Texture<B>> {
        self.textures.get(id.0)
    }

    pub fn find(&self, path: &str, filter: TextureFilter) -> Option<TextureId> {
        self.by_key.get(texture_key(path, filter).as_str()).copied()
    }

    pub fn len(&self) -> usize {
        self.textures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.textures.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Create and upload every texture requested since the last flush.
    /// Returns how many became ready.
    pub fn create_pending(&mut self, backend: &mut B) -> usize {
        let mut created = 0;
        for id in std::mem::take(&mut self.pending) {
            let texture = &mut self.textures[id.0];
            let Some(pixels) = texture.pixels.take() else {
                continue;
            };
            match upload(backend, texture, &pixels) {
                Ok(gpu) => {
                    texture.gpu = Some(gpu);
                    created += 1;
                }
                Err(err) => {
                    log::error!("Failed to create texture {}: {err}", texture.path);
                    texture.failed = true;
                }
            }
        }
        created
    }

    /// Release every device image.
    pub fn destroy(&mut self, backend: &mut B) {
        for texture in self.textures.drain(..) {
            if let Some(gpu) = texture.gpu {
                gpu.destroy(backend);
            }
        }
        self.by_key.clear();
        self.pending.clear();
    }
}

fn upload<B: GpuBackend>(
    backend: &mut B,
    texture: &Texture<B>,
    pixels: &[u8],
) -> Result<GpuImage<B>, BackendError> {
    let desc = ImageDesc {
        label: &texture.path,
        extent: texture.extent,
        mip_levels: 1,
        samples: 1,
        format: ASSET_TEXTURE_FORMAT,
        usage: ImageUsage::SAMPLED | ImageUsage::TRANSFER_DST,
    };
    let gpu = GpuImage::create(backend, &desc, ImageAspect::Color, texture.filter)?;
    let uploaded = backend
        .transition_image_layout(&gpu.image, ImageLayout::TransferDstOptimal, ImageAspect::Color)
        .and_then(|()| backend.write_image(&gpu.image, pixels))
        .and_then(|()| {
            backend.transition_image_layout(
                &gpu.image,
                ImageLayout::ShaderReadOnlyOptimal,
                ImageAspect::Color,
            )
        });
    match uploaded {
        Ok(()) => Ok(gpu),
        Err(err) => {
            gpu.destroy(backend);
            Err(err)
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use kiln_assets::MemoryAssetStore;

    use super::*;
    use crate::backend::recording::{Call, RecordingBackend};

    /// PNG bytes of a solid `width`x`height` image.
    pub(crate) fn png_bytes(width: u32, height: u32, rgba: [u8; 4]) -> Vec<u8> {
        let img = image::RgbaImage::from_pixel(width, height, image::Rgba(rgba));
        let mut bytes = std::io::Cursor::new(Vec::new());
        img.write_to(&mut bytes, image::ImageFormat::Png).unwrap();
        bytes.into_inner()
    }

    fn store_with(paths: &[&str]) -> MemoryAssetStore {
        let mut assets = MemoryAssetStore::new();
        for path in paths {
            assets.insert_bytes(path, png_bytes(2, 2, [255, 0, 0, 255]));
        }
        assets
    }

    #[test]
    fn test_texture_key_includes_filter() {
        assert_eq!(texture_key("a.png", TextureFilter::Linear), "a.png#linear");
        assert_ne!(
            texture_key("a.png", TextureFilter::Linear),
            texture_key("a.png", TextureFilter::Nearest)
        );
    }

    #[test]
    fn test_same_request_is_cached() {
        let assets = store_with(&["a.png"]);
        let mut cache = TextureCache::<RecordingBackend>::new();
        let first = cache.texture(&assets, "a.png", TextureFilter::Linear).unwrap();
        let second = cache.texture(&assets, "a.png", TextureFilter::Linear).unwrap();
        assert_eq!(first, second);
        assert!(Rc::ptr_eq(&first.key, &second.key));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.pending_count(), 1);
    }

    #[test]
    fn test_filter_makes_distinct_texture() {
        let assets = store_with(&["a.png"]);
        let mut cache = TextureCache::<RecordingBackend>::new();
        let linear = cache.texture(&assets, "a.png", TextureFilter::Linear).unwrap();
        let nearest = cache.texture(&assets, "a.png", TextureFilter::Nearest).unwrap();
        assert_ne!(linear.id, nearest.id);
        assert_eq!(cache.find("a.png", TextureFilter::Nearest), Some(nearest.id));
    }

    #[test]
    fn test_missing_texture_fails() {
        let assets = MemoryAssetStore::new();
        let mut cache = TextureCache::<RecordingBackend>::new();
        let err = cache
            .texture(&assets, "missing.png", TextureFilter::Linear)
            .unwrap_err();
        assert!(matches!(err, TextureError::Asset { ref path, .. } if path == "missing.png"));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_undecodable_texture_fails() {
        let mut assets = MemoryAssetStore::new();
        assets.insert_bytes("bad.png", vec![1, 2, 3, 4]);
        let mut cache = TextureCache::<RecordingBackend>::new();
        let err = cache.texture(&assets, "bad.png", TextureFilter::Linear).unwrap_err();
        assert!(matches!(err, TextureError::Decode { .. }));
    }

    #[test]
    fn test_create_pending_uploads_once() {
        let assets = store_with(&["a.png"]);
        let mut backend = RecordingBackend::new();
        let mut cache = TextureCache::new();
        let tex = cache.texture(&assets, "a.png", TextureFilter::Nearest).unwrap();

        assert!(!cache.get(tex.id).unwrap().is_ready());
        assert_eq!(cache.create_pending(&mut backend), 1);
        assert!(cache.get(tex.id).unwrap().is_ready());
        assert_eq!(cache.create_pending(&mut backend), 0);

        assert!(backend.calls.contains(&Call::CreateSampler {
            filter: TextureFilter::Nearest
        }));
        assert!(backend
            .calls
            .iter()
            .any(|c| matches!(c, Call::WriteImage { bytes: 16, .. })));
    }

    #[test]
    fn test_failed_upload_is_logged_and_cleaned() {
        let assets = store_with(&["a.png"]);
        let mut backend = RecordingBackend::new();
        backend.fail_always("write_image");
        let mut cache = TextureCache::new();
        let tex = cache.texture(&assets, "a.png", TextureFilter::Linear).unwrap();

        assert_eq!(cache.create_pending(&mut backend), 0);
        let texture = cache.get(tex.id).unwrap();
        assert!(!texture.is_ready());
        assert!(texture.has_failed());
        assert_eq!(backend.live_handles(), 0);
    }

    #[test]
    fn test_gpu_image_cleans_up_on_sampler_failure() {
        let mut backend = RecordingBackend::new();
        backend.fail_always("create_sampler");
        let result = GpuImage::attachment(
            &mut backend,
            "albedo",
            TextureFormat::Rgba8Unorm,
            Extent2d::new(4, 4),
        );
        assert!(result.is_err());
        assert_eq!(backend.live_handles(), 0);
    }

    #[test]
    fn test_destroy_releases_images() {
        let assets = store_with(&["a.png", "b.png"]);
        let mut backend = RecordingBackend::new();
        let mut cache = TextureCache::new();
        cache.texture(&assets, "a.png", TextureFilter::Linear).unwrap();
        cache.texture(&assets, "b.png", TextureFilter::Linear).unwrap();
        cache.create_pending(&mut backend);
        assert_eq!(backend.live_handles(), 6);

        cache.destroy(&mut backend);
        assert_eq!(backend.live_handles(), 0);
        assert!(cache.is_empty());
    }
}

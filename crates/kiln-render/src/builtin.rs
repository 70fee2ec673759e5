//! Built-in renderer content: the G-buffer and lighting shaders, the
//! G-buffer render pass and pipeline state, a white texture and a default
//! material that ties them together.

use kiln_assets::{MemoryAssetStore, SHADER_DEFINITION_GBUFFER, SHADER_DEFINITION_LIGHTING};

pub const GBUFFER_RENDER_PASS: &str = "renderer/passes/gbuffer.renderpass.json";
pub const GBUFFER_PIPELINE: &str = "renderer/pipelines/gbuffer.pipeline.json";
pub const DEFAULT_MATERIAL: &str = "renderer/materials/gbuffer_default.material.json";
pub const WHITE_TEXTURE: &str = "renderer/textures/white.png";

const TEXT_ASSETS: &[(&str, &str)] = &[
    (
        SHADER_DEFINITION_GBUFFER,
        include_str!("../assets/renderer/shaders/gbuffer.shader.json"),
    ),
    (
        SHADER_DEFINITION_LIGHTING,
        include_str!("../assets/renderer/shaders/gbuffer_lighting.shader.json"),
    ),
    (
        "renderer/shaders/gbuffer.vert.wgsl",
        include_str!("shaders/gbuffer.vert.wgsl"),
    ),
    (
        "renderer/shaders/gbuffer.frag.wgsl",
        include_str!("shaders/gbuffer.frag.wgsl"),
    ),
    (
        "renderer/shaders/gbuffer_lighting.vert.wgsl",
        include_str!("shaders/gbuffer_lighting.vert.wgsl"),
    ),
    (
        "renderer/shaders/gbuffer_lighting.frag.wgsl",
        include_str!("shaders/gbuffer_lighting.frag.wgsl"),
    ),
    (
        GBUFFER_RENDER_PASS,
        include_str!("../assets/renderer/passes/gbuffer.renderpass.json"),
    ),
    (
        GBUFFER_PIPELINE,
        include_str!("../assets/renderer/pipelines/gbuffer.pipeline.json"),
    ),
    (
        DEFAULT_MATERIAL,
        include_str!("../assets/renderer/materials/gbuffer_default.material.json"),
    ),
];

/// Path and contents of every built-in text asset.
pub fn text_assets() -> impl Iterator<Item = (&'static str, &'static str)> {
    TEXT_ASSETS.iter().copied()
}

/// PNG encoding of a single opaque white pixel.
pub fn white_png() -> Result<Vec<u8>, image::ImageError> {
    let pixel = image::RgbaImage::from_pixel(1, 1, image::Rgba([255; 4]));
    let mut bytes = std::io::Cursor::new(Vec::new());
    pixel.write_to(&mut bytes, image::ImageFormat::Png)?;
    Ok(bytes.into_inner())
}

/// Add every built-in asset to `store`.
pub fn install(store: &mut MemoryAssetStore) -> Result<(), image::ImageError> {
    for (path, text) in text_assets() {
        store.insert_text(path, text);
    }
    store.insert_bytes(WHITE_TEXTURE, white_png()?);
    log::debug!("Installed {} built-in assets", TEXT_ASSETS.len() + 1);
    Ok(())
}

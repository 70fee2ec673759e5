//! Headless Kiln host: loads config, starts logging and renders a few
//! deferred frames of the built-in material into an offscreen target.

use std::path::Path;

use clap::Parser;
use glam::{Mat4, Vec3};
use kiln_assets::{AssetError, AssetStore, FileAssetStore, MemoryAssetStore};
use kiln_config::{CliArgs, Config};
use kiln_render::backend::Extent2d;
use kiln_render::{
    Drawing, Drawings, GBUFFER_CANVAS, Renderer, ShaderDataBase, WgpuBackend, builtin,
};

const FRAMES: u32 = 3;
const EXTENT: Extent2d = Extent2d::new(640, 360);

/// Files under the asset root win over the built-in assets.
struct OverlayAssets {
    files: Option<FileAssetStore>,
    builtin: MemoryAssetStore,
}

impl OverlayAssets {
    fn new(root: &Path) -> Self {
        let mut builtin = MemoryAssetStore::new();
        if let Err(e) = builtin::install(&mut builtin) {
            tracing::error!("Failed to install built-in assets: {e}");
        }
        let files = root.is_dir().then(|| FileAssetStore::new(root));
        Self { files, builtin }
    }
}

impl AssetStore for OverlayAssets {
    fn read_bytes(&self, path: &str) -> Result<Vec<u8>, AssetError> {
        match &self.files {
            Some(files) if files.exists(path) => files.read_bytes(path),
            _ => self.builtin.read_bytes(path),
        }
    }

    fn exists(&self, path: &str) -> bool {
        self.files.as_ref().is_some_and(|f| f.exists(path)) || self.builtin.exists(path)
    }
}

fn main() {
    let args = CliArgs::parse();
    let config_dir = args.config_dir();

    let mut config = Config::load_or_create(&config_dir).unwrap_or_else(|e| {
        eprintln!("Failed to load config: {e}, using defaults");
        Config::default()
    });
    config.apply_cli_overrides(&args);

    let log_dir = config
        .debug
        .log_dir
        .clone()
        .unwrap_or_else(|| config_dir.join("logs"));
    kiln_log::init_logging(Some(&log_dir), cfg!(debug_assertions), Some(&config));

    if let Err(e) = run(&config) {
        tracing::error!("{e}");
        std::process::exit(1);
    }
}

fn run(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let assets = OverlayAssets::new(&config.assets.root);
    let backend = WgpuBackend::headless_blocking(EXTENT)?;
    let mut renderer = Renderer::new(backend, &config.render);

    renderer.register_gbuffer_canvas(&assets)?;
    let material = renderer.material(&assets, builtin::DEFAULT_MATERIAL)?;
    let quad = renderer.meshes_mut().quad();
    let mut drawings = Drawings::new();

    for frame in 0..FRAMES {
        renderer.create_pending(&assets);

        let angle = frame as f32 * 0.25;
        let model = Mat4::from_rotation_z(angle) * Mat4::from_scale(Vec3::splat(0.5));
        drawings.add(Drawing::from_material(
            GBUFFER_CANVAS,
            &material,
            quad,
            ShaderDataBase::new(model),
        ));

        renderer.begin_frame()?;
        renderer.render(&mut drawings)?;
        renderer.end_frame()?;
        tracing::info!(frame, "Rendered deferred frame");
    }

    renderer.destroy();
    Ok(())
}

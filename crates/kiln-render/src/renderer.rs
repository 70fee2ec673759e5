//! The frame driver. Owns the backend, every cache and the registered
//! canvases, and sequences deferred construction, recording and submission.

use std::rc::Rc;

use kiln_assets::AssetStore;
use kiln_config::RenderConfig;

use crate::backend::{BackendError, Extent2d, GpuBackend};
use crate::canvas::{Canvas, CanvasError, FrameContext, GBUFFER_CANVAS, GBufferCanvas};
use crate::draw::Drawings;
use crate::frame::FrameCommands;
use crate::material::{Material, MaterialCache, MaterialError, load_material};
use crate::mesh::MeshCache;
use crate::pipeline::{PipelineError, build_pipeline};
use crate::render_pass::RenderPassCache;
use crate::shader::{PipelineBuild, Shader, ShaderCache, ShaderError, ShaderId};
use crate::texture::{ASSET_TEXTURE_FORMAT, TextureCache};

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("canvas {0} is already registered")]
    DuplicateCanvas(String),

    #[error("canvas {canvas}: {source}")]
    Canvas {
        canvas: String,
        #[source]
        source: CanvasError,
    },

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Material(#[from] MaterialError),

    #[error(transparent)]
    Shader(#[from] ShaderError),
}

type CanvasList<B> = Vec<(String, Box<dyn Canvas<B>>)>;

pub struct Renderer<B: GpuBackend> {
    pub(crate) backend: B,
    config: RenderConfig,
    pub(crate) shaders: ShaderCache<B>,
    pub(crate) textures: TextureCache<B>,
    pub(crate) meshes: MeshCache<B>,
    pub(crate) render_passes: RenderPassCache<B>,
    materials: MaterialCache,
    commands: FrameCommands,
    canvases: CanvasList<B>,
    frame_counter: u64,
}

impl<B: GpuBackend> Renderer<B> {
    pub fn new(backend: B, config: &RenderConfig) -> Self {
        let frames_in_flight = config.frames_in_flight.max(1) as usize;
        let per_frame = config.command_buffers_per_frame.max(1) as usize;
        log::info!(
            "Renderer: {frames_in_flight} frames in flight, {per_frame} command buffers per frame"
        );
        Self {
            backend,
            config: config.clone(),
            shaders: ShaderCache::new(),
            textures: TextureCache::new(),
            meshes: MeshCache::new(),
            render_passes: RenderPassCache::new(),
            materials: MaterialCache::new(),
            commands: FrameCommands::new(frames_in_flight, per_frame),
            canvases: Vec::new(),
            frame_counter: 0,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn config(&self) -> &RenderConfig {
        &self.config
    }

    pub fn shaders(&self) -> &ShaderCache<B> {
        &self.shaders
    }

    pub fn shaders_mut(&mut self) -> &mut ShaderCache<B> {
        &mut self.shaders
    }

    pub fn textures(&self) -> &TextureCache<B> {
        &self.textures
    }

    pub fn textures_mut(&mut self) -> &mut TextureCache<B> {
        &mut self.textures
    }

    pub fn meshes(&self) -> &MeshCache<B> {
        &self.meshes
    }

    pub fn meshes_mut(&mut self) -> &mut MeshCache<B> {
        &mut self.meshes
    }

    pub fn render_passes(&self) -> &RenderPassCache<B> {
        &self.render_passes
    }

    pub fn frame_counter(&self) -> u64 {
        self.frame_counter
    }

    pub fn commands(&self) -> &FrameCommands {
        &self.commands
    }

    /// Create and initialize `canvas`, then route drawings for `id` to it.
    /// A canvas that fails to create is torn down before the error returns.
    pub fn register_canvas(
        &mut self,
        id: &str,
        mut canvas: Box<dyn Canvas<B>>,
        assets: &dyn AssetStore,
    ) -> Result<(), RenderError> {
        if self.canvas(id).is_some() {
            return Err(RenderError::DuplicateCanvas(id.to_string()));
        }
        let created = canvas
            .create(&mut self.backend)
            .and_then(|()| canvas.initialize(&mut self.shaders, &mut self.meshes, assets));
        if let Err(source) = created {
            log::error!("Failed to set up canvas {id}: {source}");
            canvas.destroy(&mut self.backend);
            canvas.destroy_swap_chain_resources(&mut self.backend);
            return Err(RenderError::Canvas {
                canvas: id.to_string(),
                source,
            });
        }
        log::info!("Registered canvas {id}");
        self.canvases.push((id.to_string(), canvas));
        Ok(())
    }

    /// Register the deferred canvas with the configured lighting shader and
    /// queue the configured geometry shader.
    pub fn register_gbuffer_canvas(&mut self, assets: &dyn AssetStore) -> Result<ShaderId, RenderError> {
        let canvas = GBufferCanvas::<B>::new(self.config.lighting_shader.clone());
        self.register_canvas(GBUFFER_CANVAS, Box::new(canvas), assets)?;
        Ok(self.shaders.shader(assets, &self.config.gbuffer_shader)?)
    }

    pub fn canvas(&self, id: &str) -> Option<&dyn Canvas<B>> {
        self.canvases
            .iter()
            .find(|(name, _)| name == id)
            .map(|(_, canvas)| canvas.as_ref())
    }

    /// Compiled material for the definition at `path`, compiling on first use.
    pub fn material(&mut self, assets: &dyn AssetStore, path: &str) -> Result<Rc<Material>, MaterialError> {
        if let Some(material) = self.materials.get(path) {
            return Ok(material);
        }
        let material = load_material(assets, self, path)?;
        log::debug!("Compiled material {} from {path}", material.name);
        Ok(self.materials.insert(path, material))
    }

    /// Perform all deferred GPU construction: shaders, then textures, then
    /// meshes. Call once per frame before recording.
    pub fn create_pending(&mut self, assets: &dyn AssetStore) {
        let canvases = &self.canvases;
        let render_passes = &self.render_passes;
        self.shaders
            .create_pending(&mut self.backend, assets, |backend, shader| {
                match shader.definition().canvas.as_deref() {
                    Some(id) => match canvases.iter().find(|(name, _)| name == id) {
                        Some((_, canvas)) => canvas.create_pipeline(backend, shader),
                        None => PipelineBuild::Failed(PipelineError::UnknownCanvas {
                            pipeline: shader.key().to_string(),
                            canvas: id.to_string(),
                        }),
                    },
                    None => material_pipeline(backend, shader, render_passes),
                }
            });
        self.textures.create_pending(&mut self.backend);
        self.meshes.create_pending(&mut self.backend);
    }

    /// Advance to the next frame in flight and acquire its swap-chain image.
    pub fn begin_frame(&mut self) -> Result<(), RenderError> {
        let frame = (self.frame_counter % self.commands.frames_in_flight() as u64) as usize;
        self.commands.begin(frame);
        self.backend.begin_frame(frame)?;
        Ok(())
    }

    /// Record every canvas. Drawings for canvases that are not registered
    /// are skipped. Instances are cleared afterwards.
    pub fn render(&mut self, drawings: &mut Drawings<B>) -> Result<(), RenderError> {
        for id in drawings.canvases() {
            if self.canvas(id).is_none() {
                log::warn!("Skipping drawings for unknown canvas {id}");
            }
        }
        drawings.prepare(&mut self.backend);

        let mut result = Ok(());
        for (id, canvas) in &mut self.canvases {
            let mut frame = FrameContext {
                backend: &mut self.backend,
                commands: &mut self.commands,
                shaders: &self.shaders,
                textures: &self.textures,
                meshes: &self.meshes,
            };
            let draws = drawings.canvas_mut(id).unwrap_or_default();
            if let Err(source) = canvas.draw(&mut frame, draws) {
                log::error!("Canvas {id} failed to draw: {source}");
                result = Err(RenderError::Canvas {
                    canvas: id.clone(),
                    source,
                });
                break;
            }
        }
        drawings.clear_instances();
        result
    }

    /// Submit the command buffers recorded this frame, in slot order.
    pub fn end_frame(&mut self) -> Result<(), RenderError> {
        let slots = self.commands.recorded();
        self.frame_counter += 1;
        self.backend.end_frame(&slots)?;
        Ok(())
    }

    /// Resize the swap chain and rebuild every canvas at the new size.
    pub fn resize(&mut self, extent: Extent2d) -> Result<(), RenderError> {
        self.backend.wait_idle();
        self.backend.resize(extent)?;
        for (id, canvas) in &mut self.canvases {
            canvas
                .resize(&mut self.backend)
                .map_err(|source| RenderError::Canvas {
                    canvas: id.clone(),
                    source,
                })?;
        }
        log::info!("Resized to {}x{}", extent.width, extent.height);
        Ok(())
    }

    /// Release every GPU resource the renderer owns.
    pub fn destroy(&mut self) {
        self.backend.wait_idle();
        for (_, mut canvas) in self.canvases.drain(..) {
            canvas.destroy(&mut self.backend);
            canvas.destroy_swap_chain_resources(&mut self.backend);
        }
        self.materials.clear();
        self.shaders.destroy(&mut self.backend);
        self.render_passes.destroy(&mut self.backend);
        self.textures.destroy(&mut self.backend);
        self.meshes.destroy(&mut self.backend);
    }
}

/// Pipeline for a shader outside any canvas: built from the state and render
/// pass its material attached.
fn material_pipeline<B: GpuBackend>(
    backend: &mut B,
    shader: &Shader<B>,
    render_passes: &RenderPassCache<B>,
) -> PipelineBuild<B> {
    let Some(info) = shader.pipeline_info() else {
        return PipelineBuild::NotReady;
    };
    let Some(pass) = shader.render_pass().and_then(|id| render_passes.get(id)) else {
        return PipelineBuild::Failed(PipelineError::MissingRenderPass {
            pipeline: shader.key().to_string(),
        });
    };
    let formats = vec![ASSET_TEXTURE_FORMAT; shader.definition().textures as usize];
    match build_pipeline(backend, shader, info, pass, &formats) {
        Ok(pipeline) => PipelineBuild::Built(pipeline),
        Err(err) => PipelineBuild::Failed(err),
    }
}

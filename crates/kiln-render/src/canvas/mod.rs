//! Canvases own the passes a group of shaders renders into and record those
//! passes each frame.

mod gbuffer;

pub use gbuffer::{CanvasState, GBUFFER_CANVAS, GBufferCanvas};

use kiln_assets::AssetStore;

use crate::backend::{BackendError, GpuBackend};
use crate::draw::ShaderDraw;
use crate::frame::{FrameCommands, FrameError};
use crate::mesh::MeshCache;
use crate::render_pass::RenderPass;
use crate::shader::{PipelineBuild, Shader, ShaderCache, ShaderError};
use crate::texture::{GpuImage, TextureCache};

#[derive(Debug, thiserror::Error)]
pub enum CanvasError {
    /// One or more images or passes failed; details are logged where they
    /// happened.
    #[error("failed to create deferred rendering resources")]
    DeferredResources,

    #[error("canvas is {state:?}, expected {expected:?}")]
    InvalidState {
        state: CanvasState,
        expected: CanvasState,
    },

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Shader(#[from] ShaderError),
}

/// What a canvas needs while recording a frame.
pub struct FrameContext<'a, B: GpuBackend> {
    pub backend: &'a mut B,
    pub commands: &'a mut FrameCommands,
    pub shaders: &'a ShaderCache<B>,
    pub textures: &'a TextureCache<B>,
    pub meshes: &'a MeshCache<B>,
}

pub trait Canvas<B: GpuBackend> {
    /// Allocate images and passes.
    fn create(&mut self, backend: &mut B) -> Result<(), CanvasError>;

    /// Resolve the shaders and meshes the canvas draws with itself.
    fn initialize(
        &mut self,
        shaders: &mut ShaderCache<B>,
        meshes: &mut MeshCache<B>,
        assets: &dyn AssetStore,
    ) -> Result<(), CanvasError>;

    /// Record this frame's passes, taking one command slot per pass.
    fn draw(
        &mut self,
        frame: &mut FrameContext<'_, B>,
        drawings: &mut [ShaderDraw<B>],
    ) -> Result<(), CanvasError>;

    fn pass(&self, name: &str) -> Option<&RenderPass<B>>;

    /// The image the canvas renders its colour output into, if it keeps one.
    fn color(&self) -> Option<&GpuImage<B>>;

    /// Build the pipeline of a shader that targets this canvas.
    fn create_pipeline(&self, backend: &mut B, shader: &Shader<B>) -> PipelineBuild<B>;

    /// Rebuild everything sized to the swap chain.
    fn resize(&mut self, backend: &mut B) -> Result<(), CanvasError>;

    fn destroy(&mut self, backend: &mut B);

    /// Release passes that reference swap-chain images.
    fn destroy_swap_chain_resources(&mut self, _backend: &mut B) {}
}

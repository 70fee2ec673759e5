//! Rendering-resource compiler and deferred G-buffer renderer.
//!
//! Declarative shader, render-pass, pipeline-state and material definitions
//! are loaded through an [`kiln_assets::AssetStore`], compiled into backend
//! objects, cached by key and drawn each frame by a [`canvas::Canvas`].

pub mod backend;
pub mod builtin;
pub mod canvas;
pub mod definition;
pub mod draw;
pub mod frame;
pub mod material;
pub mod mesh;
pub mod pipeline;
pub mod render_pass;
pub mod renderer;
pub mod shader;
pub mod texture;

pub use backend::{BackendError, Extent2d, GpuBackend, RenderContextError, WgpuBackend};
pub use canvas::{Canvas, CanvasError, GBUFFER_CANVAS, GBufferCanvas};
pub use definition::DefinitionError;
pub use draw::{Drawing, Drawings, ShaderDataBase};
pub use material::{Material, MaterialError};
pub use mesh::{Mesh, MeshId, Vertex};
pub use pipeline::{CompiledPipelineInfo, PipelineError};
pub use render_pass::{RenderPassError, RenderPassId};
pub use renderer::{RenderError, Renderer};
pub use shader::{ShaderError, ShaderId};
pub use texture::{TextureError, TextureId};

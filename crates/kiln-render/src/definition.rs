//! JSON resource descriptions and the loader that reads them from the asset
//! store.
//!
//! Field names are PascalCase on the wire. Every definition tolerates missing
//! fields; the compilers decide what a missing value means.

use kiln_assets::{AssetError, AssetStore};
use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::backend::{
    BlendFactor, BlendOp, ClearValue, CompareOp, CullMode, DynamicState, FrontFace, ImageLayout,
    LoadOp, LogicOp, PolygonMode, ShaderStage, StoreOp, TextureFilter, TextureFormat,
};

/// Errors raised while loading a definition file.
#[derive(Debug, thiserror::Error)]
pub enum DefinitionError {
    #[error("failed to read definition {path}: {source}")]
    Asset {
        path: String,
        #[source]
        source: AssetError,
    },

    #[error("failed to parse definition {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Read `path` as text and parse it as JSON into `T`.
pub fn load_definition<T: DeserializeOwned>(
    assets: &dyn AssetStore,
    path: &str,
) -> Result<T, DefinitionError> {
    let text = assets
        .read_text(path)
        .map_err(|source| DefinitionError::Asset {
            path: path.to_string(),
            source,
        })?;
    serde_json::from_str(&text).map_err(|source| DefinitionError::Parse {
        path: path.to_string(),
        source,
    })
}

// ---------------------------------------------------------------------------
// Shader
// ---------------------------------------------------------------------------

/// Declared primitive type of a shader's geometry.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(from = "String")]
pub enum DrawMode {
    Points,
    Lines,
    #[default]
    Triangles,
    Patches,
    /// Any other value; compiles to a triangle list.
    Unrecognized(String),
}

impl From<String> for DrawMode {
    fn from(value: String) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "points" => Self::Points,
            "lines" => Self::Lines,
            "triangles" => Self::Triangles,
            "patches" => Self::Patches,
            _ => Self::Unrecognized(value),
        }
    }
}

/// Source path per programmable stage. Empty means the stage is absent.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ShaderStages {
    pub vert: String,
    pub frag: String,
    pub geom: String,
    pub tesc: String,
    pub tese: String,
}

impl ShaderStages {
    /// Present stages in pipeline order.
    pub fn iter(&self) -> impl Iterator<Item = (ShaderStage, &str)> {
        [
            (ShaderStage::Vertex, self.vert.as_str()),
            (ShaderStage::TessellationControl, self.tesc.as_str()),
            (ShaderStage::TessellationEvaluation, self.tese.as_str()),
            (ShaderStage::Geometry, self.geom.as_str()),
            (ShaderStage::Fragment, self.frag.as_str()),
        ]
        .into_iter()
        .filter(|(_, path)| !path.trim().is_empty())
    }

    pub fn has_tessellation(&self) -> bool {
        !self.tesc.trim().is_empty() || !self.tese.trim().is_empty()
    }

    fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }
}

/// A shader as described on disk.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ShaderDefinition {
    #[serde(flatten)]
    pub stages: ShaderStages,
    /// Stage paths nested under `GLSL` (or `Stages`) take precedence.
    #[serde(rename = "GLSL", alias = "Stages")]
    pub nested_stages: Option<ShaderStages>,
    pub draw_mode: DrawMode,
    pub cull_mode: Option<CullMode>,
    /// Number of sampled textures the shader binds.
    pub textures: u32,
    /// Canvas whose pipeline factory builds this shader's pipeline.
    pub canvas: Option<String>,
    /// Pass of that canvas the pipeline renders into.
    pub pass: Option<String>,
}

impl ShaderDefinition {
    pub fn stages(&self) -> &ShaderStages {
        match &self.nested_stages {
            Some(nested) if !nested.is_empty() => nested,
            _ => &self.stages,
        }
    }

    pub fn has_tessellation(&self) -> bool {
        self.stages().has_tessellation()
    }
}

// ---------------------------------------------------------------------------
// Render pass
// ---------------------------------------------------------------------------

/// Attachment format as written in a render-pass file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum FormatSpec {
    /// The swap chain's format; the attachment is the frame's swap image.
    Swapchain,
    /// The device's preferred depth format.
    Depth,
    #[serde(untagged)]
    Concrete(TextureFormat),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct AttachmentDefinition {
    pub format: FormatSpec,
    pub samples: u32,
    pub load_op: LoadOp,
    pub store_op: StoreOp,
    pub stencil_load_op: LoadOp,
    pub stencil_store_op: StoreOp,
    pub initial_layout: ImageLayout,
    pub final_layout: ImageLayout,
}

impl Default for AttachmentDefinition {
    fn default() -> Self {
        Self {
            format: FormatSpec::Concrete(TextureFormat::Rgba8Unorm),
            samples: 1,
            load_op: LoadOp::Clear,
            store_op: StoreOp::Store,
            stencil_load_op: LoadOp::DontCare,
            stencil_store_op: StoreOp::DontCare,
            initial_layout: ImageLayout::Undefined,
            final_layout: ImageLayout::ColorAttachmentOptimal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AttachmentReferenceDefinition {
    pub attachment: u32,
    #[serde(default)]
    pub layout: ImageLayout,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SubpassDefinition {
    pub color_attachments: Vec<AttachmentReferenceDefinition>,
    pub depth_stencil_attachment: Option<AttachmentReferenceDefinition>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RenderPassDefinition {
    pub name: String,
    pub attachments: Vec<AttachmentDefinition>,
    pub subpasses: Vec<SubpassDefinition>,
}

// ---------------------------------------------------------------------------
// Pipeline state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RasterizationDefinition {
    pub depth_clamp: bool,
    pub rasterizer_discard: bool,
    pub polygon_mode: PolygonMode,
    pub cull_mode: Option<CullMode>,
    pub front_face: FrontFace,
    pub line_width: Option<f32>,
    pub depth_bias_enable: bool,
    pub depth_bias_constant: f32,
    pub depth_bias_clamp: f32,
    pub depth_bias_slope: f32,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct MultisampleDefinition {
    pub samples: Option<u32>,
    pub sample_shading: bool,
    pub min_sample_shading: f32,
    pub alpha_to_coverage: bool,
    pub alpha_to_one: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct DepthStencilDefinition {
    pub depth_test: bool,
    pub depth_write: bool,
    pub compare_op: CompareOp,
    pub depth_bounds_test: bool,
    pub stencil_test: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct BlendAttachmentDefinition {
    pub blend_enable: bool,
    pub src_color_factor: BlendFactor,
    pub dst_color_factor: BlendFactor,
    pub color_op: BlendOp,
    pub src_alpha_factor: BlendFactor,
    pub dst_alpha_factor: BlendFactor,
    pub alpha_op: BlendOp,
    /// Channels written, e.g. `"RGBA"` or `"RGB"`.
    pub write_mask: String,
}

impl Default for BlendAttachmentDefinition {
    fn default() -> Self {
        Self {
            blend_enable: false,
            src_color_factor: BlendFactor::One,
            dst_color_factor: BlendFactor::Zero,
            color_op: BlendOp::Add,
            src_alpha_factor: BlendFactor::One,
            dst_alpha_factor: BlendFactor::Zero,
            alpha_op: BlendOp::Add,
            write_mask: "RGBA".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ColorBlendDefinition {
    pub logic_op_enable: bool,
    pub logic_op: LogicOp,
    pub attachments: Vec<BlendAttachmentDefinition>,
    pub blend_constants: [f32; 4],
}

/// Fixed-function pipeline state as described on disk.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct PipelineStateDefinition {
    /// Overrides the shader's draw mode when present.
    pub topology: Option<DrawMode>,
    pub primitive_restart: bool,
    pub rasterization: RasterizationDefinition,
    pub multisample: MultisampleDefinition,
    pub depth_stencil: DepthStencilDefinition,
    pub color_blend: ColorBlendDefinition,
    pub patch_control_points: Option<u32>,
    pub dynamic_states: Vec<DynamicState>,
}

// ---------------------------------------------------------------------------
// Material
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct MaterialTextureDefinition {
    pub texture: String,
    pub filter: String,
}

impl MaterialTextureDefinition {
    /// `Nearest` and `Linear` map directly; `CubicImg` and anything else fall
    /// back to linear filtering.
    pub fn filter(&self) -> TextureFilter {
        match self.filter.as_str() {
            "Nearest" => TextureFilter::Nearest,
            _ => TextureFilter::Linear,
        }
    }
}

/// Problem found while resolving a [`ClearDefinition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearIssue {
    /// Both `IsColor` and `IsDepthStencil` were set; the depth/stencil clear wins.
    BothSet,
    /// Neither flag was set; the colour clear is used.
    NeitherSet,
}

impl std::fmt::Display for ClearIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BothSet => f.write_str("clear is marked both color and depth stencil"),
            Self::NeitherSet => f.write_str("clear is marked neither color nor depth stencil"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ClearDefinition {
    pub is_color: bool,
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
    pub is_depth_stencil: bool,
    pub depth: f32,
    pub stencil: u32,
}

impl ClearDefinition {
    /// The clear value this entry produces, plus the issue when its flags
    /// are inconsistent.
    pub fn resolve(&self) -> (ClearValue, Option<ClearIssue>) {
        let issue = match (self.is_color, self.is_depth_stencil) {
            (true, true) => Some(ClearIssue::BothSet),
            (false, false) => Some(ClearIssue::NeitherSet),
            _ => None,
        };
        let value = if self.is_depth_stencil {
            ClearValue::DepthStencil {
                depth: self.depth,
                stencil: self.stencil,
            }
        } else {
            ClearValue::Color([self.r, self.g, self.b, self.a])
        };
        (value, issue)
    }
}

/// A material as described on disk.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct MaterialDefinition {
    pub name: String,
    pub shader: String,
    pub render_pass: String,
    pub shader_pipeline: String,
    pub textures: Vec<MaterialTextureDefinition>,
    pub clears: Vec<ClearDefinition>,
}

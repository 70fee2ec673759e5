//! Pipeline-state compilation: definitions become [`CompiledPipelineInfo`],
//! which together with a shader and a render pass builds a backend pipeline.

use crate::backend::{
    BackendError, BlendFactor, BlendOp, ColorWriteMask, CompareOp, CullMode, DynamicState,
    FrontFace, GpuBackend, GraphicsPipelineDesc, LogicOp, PipelineStage, PolygonMode,
    PrimitiveTopology, TextureFormat,
};
use crate::definition::{
    BlendAttachmentDefinition, DrawMode, PipelineStateDefinition, ShaderDefinition,
};
use crate::mesh;
use crate::render_pass::RenderPass;
use crate::shader::Shader;

/// Control points per patch when a tessellated shader does not say otherwise.
pub const DEFAULT_PATCH_CONTROL_POINTS: u32 = 3;

/// Errors raised while building a graphics pipeline.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(
        "pipeline {pipeline} declares {blend_attachments} blend attachments but its render pass has {color_attachments} color attachments"
    )]
    ColorAttachmentMismatch {
        pipeline: String,
        blend_attachments: usize,
        color_attachments: usize,
    },

    #[error("pipeline {pipeline} targets unknown canvas {canvas}")]
    UnknownCanvas { pipeline: String, canvas: String },

    #[error("pipeline {pipeline} has no render pass to build against")]
    MissingRenderPass { pipeline: String },

    #[error("pipeline {pipeline} has no compiled vertex stage")]
    MissingVertexStage { pipeline: String },

    #[error("backend failed to create pipeline {pipeline}: {source}")]
    Backend {
        pipeline: String,
        #[source]
        source: BackendError,
    },
}

/// Native topology for a declared draw mode. Unrecognised modes draw
/// triangle lists.
pub fn topology_for_draw_mode(mode: &DrawMode) -> PrimitiveTopology {
    match mode {
        DrawMode::Points => PrimitiveTopology::PointList,
        DrawMode::Lines => PrimitiveTopology::LineList,
        DrawMode::Triangles => PrimitiveTopology::TriangleList,
        DrawMode::Patches => PrimitiveTopology::PatchList,
        DrawMode::Unrecognized(_) => PrimitiveTopology::TriangleList,
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InputAssemblyState {
    /// `None` until resolved against a shader's draw mode.
    pub topology: Option<PrimitiveTopology>,
    pub primitive_restart: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DepthBias {
    pub constant: f32,
    pub clamp: f32,
    pub slope: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RasterizationState {
    pub depth_clamp: bool,
    pub rasterizer_discard: bool,
    pub polygon_mode: PolygonMode,
    pub cull_mode: CullMode,
    pub front_face: FrontFace,
    pub line_width: f32,
    pub depth_bias: Option<DepthBias>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MultisampleState {
    pub samples: u32,
    pub sample_shading: bool,
    pub min_sample_shading: f32,
    pub alpha_to_coverage: bool,
    pub alpha_to_one: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DepthStencilState {
    pub depth_test: bool,
    pub depth_write: bool,
    pub compare: CompareOp,
    pub depth_bounds_test: bool,
    pub stencil_test: bool,
}

impl DepthStencilState {
    pub const DISABLED: Self = Self {
        depth_test: false,
        depth_write: false,
        compare: CompareOp::Always,
        depth_bounds_test: false,
        stencil_test: false,
    };
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlendComponent {
    pub src: BlendFactor,
    pub dst: BlendFactor,
    pub op: BlendOp,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColorBlendAttachment {
    /// `(color, alpha)` when blending is enabled.
    pub blend: Option<(BlendComponent, BlendComponent)>,
    pub write_mask: ColorWriteMask,
}

impl ColorBlendAttachment {
    /// Blending off, every channel written.
    pub const OPAQUE: Self = Self {
        blend: None,
        write_mask: ColorWriteMask::ALL,
    };
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColorBlendState {
    pub logic_op: Option<LogicOp>,
    pub attachments: Vec<ColorBlendAttachment>,
    pub blend_constants: [f32; 4],
}

/// Fixed-function state ready to hand to a backend.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledPipelineInfo {
    pub input_assembly: InputAssemblyState,
    pub rasterization: RasterizationState,
    pub multisample: MultisampleState,
    pub depth_stencil: DepthStencilState,
    pub color_blend: ColorBlendState,
    /// Present only for tessellated shaders.
    pub patch_control_points: Option<u32>,
    /// Always contains viewport and scissor.
    pub dynamic_states: Vec<DynamicState>,
}

impl CompiledPipelineInfo {
    /// Topology and tessellation settled against the shader that will use
    /// this state. An explicit topology in the state wins over the shader's
    /// draw mode.
    pub fn resolve_for(&self, shader: &ShaderDefinition) -> Self {
        let mut resolved = self.clone();
        if resolved.input_assembly.topology.is_none() {
            resolved.input_assembly.topology = Some(topology_for_draw_mode(&shader.draw_mode));
        }
        resolved.patch_control_points = if shader.has_tessellation() {
            Some(
                self.patch_control_points
                    .unwrap_or(DEFAULT_PATCH_CONTROL_POINTS),
            )
        } else {
            None
        };
        resolved
    }

    pub fn topology(&self) -> PrimitiveTopology {
        self.input_assembly.topology.unwrap_or_default()
    }
}

fn with_required_dynamic_states(mut states: Vec<DynamicState>) -> Vec<DynamicState> {
    for required in [DynamicState::Viewport, DynamicState::Scissor] {
        if !states.contains(&required) {
            states.push(required);
        }
    }
    states
}

fn parse_write_mask(mask: &str) -> ColorWriteMask {
    mask.chars().fold(ColorWriteMask::empty(), |acc, c| {
        acc | match c.to_ascii_uppercase() {
            'R' => ColorWriteMask::R,
            'G' => ColorWriteMask::G,
            'B' => ColorWriteMask::B,
            'A' => ColorWriteMask::A,
            _ => ColorWriteMask::empty(),
        }
    })
}

fn compile_blend_attachment(def: &BlendAttachmentDefinition) -> ColorBlendAttachment {
    let blend = def.blend_enable.then_some((
        BlendComponent {
            src: def.src_color_factor,
            dst: def.dst_color_factor,
            op: def.color_op,
        },
        BlendComponent {
            src: def.src_alpha_factor,
            dst: def.dst_alpha_factor,
            op: def.alpha_op,
        },
    ));
    ColorBlendAttachment {
        blend,
        write_mask: parse_write_mask(&def.write_mask),
    }
}

impl PipelineStateDefinition {
    /// Field-by-field translation. Omitted numeric fields stay zero or
    /// disabled, except line width which is always at least 1.0.
    pub fn compile(&self) -> CompiledPipelineInfo {
        let raster = &self.rasterization;
        let depth_bias = raster.depth_bias_enable.then_some(DepthBias {
            constant: raster.depth_bias_constant,
            clamp: raster.depth_bias_clamp,
            slope: raster.depth_bias_slope,
        });
        let line_width = raster.line_width.filter(|w| *w > 0.0).unwrap_or(1.0);

        CompiledPipelineInfo {
            input_assembly: InputAssemblyState {
                topology: self.topology.as_ref().map(topology_for_draw_mode),
                primitive_restart: self.primitive_restart,
            },
            rasterization: RasterizationState {
                depth_clamp: raster.depth_clamp,
                rasterizer_discard: raster.rasterizer_discard,
                polygon_mode: raster.polygon_mode,
                cull_mode: raster.cull_mode.unwrap_or_default(),
                front_face: raster.front_face,
                line_width,
                depth_bias,
            },
            multisample: MultisampleState {
                samples: self.multisample.samples.unwrap_or(1).max(1),
                sample_shading: self.multisample.sample_shading,
                min_sample_shading: self.multisample.min_sample_shading,
                alpha_to_coverage: self.multisample.alpha_to_coverage,
                alpha_to_one: self.multisample.alpha_to_one,
            },
            depth_stencil: DepthStencilState {
                depth_test: self.depth_stencil.depth_test,
                depth_write: self.depth_stencil.depth_write,
                compare: self.depth_stencil.compare_op,
                depth_bounds_test: self.depth_stencil.depth_bounds_test,
                stencil_test: self.depth_stencil.stencil_test,
            },
            color_blend: ColorBlendState {
                logic_op: self
                    .color_blend
                    .logic_op_enable
                    .then_some(self.color_blend.logic_op),
                attachments: self
                    .color_blend
                    .attachments
                    .iter()
                    .map(compile_blend_attachment)
                    .collect(),
                blend_constants: self.color_blend.blend_constants,
            },
            patch_control_points: self.patch_control_points,
            dynamic_states: with_required_dynamic_states(self.dynamic_states.clone()),
        }
    }
}

fn opaque_state(
    topology: PrimitiveTopology,
    cull_mode: CullMode,
    depth_stencil: DepthStencilState,
    color_attachments: usize,
) -> CompiledPipelineInfo {
    CompiledPipelineInfo {
        input_assembly: InputAssemblyState {
            topology: Some(topology),
            primitive_restart: false,
        },
        rasterization: RasterizationState {
            depth_clamp: false,
            rasterizer_discard: false,
            polygon_mode: PolygonMode::Fill,
            cull_mode,
            front_face: FrontFace::Ccw,
            line_width: 1.0,
            depth_bias: None,
        },
        multisample: MultisampleState {
            samples: 1,
            sample_shading: false,
            min_sample_shading: 1.0,
            alpha_to_coverage: false,
            alpha_to_one: false,
        },
        depth_stencil,
        color_blend: ColorBlendState {
            logic_op: None,
            attachments: vec![ColorBlendAttachment::OPAQUE; color_attachments],
            blend_constants: [0.0; 4],
        },
        patch_control_points: None,
        dynamic_states: vec![DynamicState::Viewport, DynamicState::Scissor],
    }
}

/// State for the G-buffer geometry pass: depth test and write with `Less`,
/// three opaque colour targets, culling from the shader (back by default).
pub fn gbuffer_pipeline_state(shader: &ShaderDefinition) -> CompiledPipelineInfo {
    let depth = DepthStencilState {
        depth_test: true,
        depth_write: true,
        compare: CompareOp::Less,
        depth_bounds_test: false,
        stencil_test: false,
    };
    let mut state = opaque_state(
        topology_for_draw_mode(&shader.draw_mode),
        shader.cull_mode.unwrap_or(CullMode::Back),
        depth,
        3,
    );
    if shader.has_tessellation() {
        state.patch_control_points = Some(DEFAULT_PATCH_CONTROL_POINTS);
    }
    state
}

/// State for the full-screen lighting pass: no culling, no depth, one target.
pub fn lighting_pipeline_state() -> CompiledPipelineInfo {
    opaque_state(
        PrimitiveTopology::TriangleList,
        CullMode::None,
        DepthStencilState::DISABLED,
        1,
    )
}

/// Build `shader`'s pipeline for `pass` with the standard mesh and instance
/// vertex layouts.
pub fn build_pipeline<B: GpuBackend>(
    backend: &mut B,
    shader: &Shader<B>,
    state: &CompiledPipelineInfo,
    pass: &RenderPass<B>,
    texture_formats: &[TextureFormat],
) -> Result<B::Pipeline, PipelineError> {
    let label = shader.key();
    let color_attachments = pass.color_attachment_count(0);
    if state.color_blend.attachments.len() != color_attachments {
        let err = PipelineError::ColorAttachmentMismatch {
            pipeline: label.to_string(),
            blend_attachments: state.color_blend.attachments.len(),
            color_attachments,
        };
        log::error!("{err}");
        return Err(err);
    }

    let stages: Vec<PipelineStage<'_, B>> = shader
        .modules()
        .map(|(stage, module)| PipelineStage { stage, module })
        .collect();
    if !stages
        .iter()
        .any(|s| s.stage == crate::backend::ShaderStage::Vertex)
    {
        return Err(PipelineError::MissingVertexStage {
            pipeline: label.to_string(),
        });
    }

    let desc = GraphicsPipelineDesc {
        label,
        stages,
        render_pass: pass.handle(),
        subpass: 0,
        vertex_layouts: &mesh::VERTEX_LAYOUTS,
        state,
        texture_formats,
    };
    backend.create_graphics_pipeline(&desc).map_err(|source| {
        log::error!(
            "Failed to create pipeline for shader {label} in pass {}: {source}",
            pass.name()
        );
        PipelineError::Backend {
            pipeline: label.to_string(),
            source,
        }
    })
}

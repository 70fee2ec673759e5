//! Backend-neutral descriptions of GPU objects and fixed-function state.

use bitflags::bitflags;
use serde::Deserialize;

/// Width and height in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Extent2d {
    pub width: u32,
    pub height: u32,
}

impl Extent2d {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Clamp both sides to at least one pixel.
    pub fn clamped(self) -> Self {
        Self {
            width: self.width.max(1),
            height: self.height.max(1),
        }
    }
}

/// Pixel formats the renderer creates or renders into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
pub enum TextureFormat {
    Rgba8Unorm,
    Rgba8UnormSrgb,
    Bgra8Unorm,
    Bgra8UnormSrgb,
    Rgba16Float,
    Rgba32Float,
    Depth16Unorm,
    Depth32Float,
    Depth24PlusStencil8,
    Depth32FloatStencil8,
}

impl TextureFormat {
    pub fn is_depth(self) -> bool {
        matches!(
            self,
            Self::Depth16Unorm
                | Self::Depth32Float
                | Self::Depth24PlusStencil8
                | Self::Depth32FloatStencil8
        )
    }

    pub fn has_stencil(self) -> bool {
        matches!(self, Self::Depth24PlusStencil8 | Self::Depth32FloatStencil8)
    }

    /// Whether a linear sampler may read this format without extra device features.
    pub fn is_filterable(self) -> bool {
        !self.is_depth() && self != Self::Rgba32Float
    }

    /// Bytes per texel for tightly packed uploads; `None` for depth formats.
    pub fn bytes_per_pixel(self) -> Option<u32> {
        match self {
            Self::Rgba8Unorm | Self::Rgba8UnormSrgb | Self::Bgra8Unorm | Self::Bgra8UnormSrgb => {
                Some(4)
            }
            Self::Rgba16Float => Some(8),
            Self::Rgba32Float => Some(16),
            _ => None,
        }
    }
}

/// What happens to an attachment's contents when a pass begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum LoadOp {
    #[default]
    Clear,
    Load,
    DontCare,
}

/// What happens to an attachment's contents when a pass ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum StoreOp {
    #[default]
    Store,
    DontCare,
}

/// Image layouts as tracked by explicit-layout APIs. Backends that manage
/// layouts implicitly only validate them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum ImageLayout {
    #[default]
    Undefined,
    ColorAttachmentOptimal,
    DepthStencilAttachmentOptimal,
    ShaderReadOnlyOptimal,
    TransferDstOptimal,
    PresentSrc,
}

/// One attachment of a render pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AttachmentDescription {
    pub format: TextureFormat,
    pub samples: u32,
    pub load_op: LoadOp,
    pub store_op: StoreOp,
    pub stencil_load_op: LoadOp,
    pub stencil_store_op: StoreOp,
    pub initial_layout: ImageLayout,
    pub final_layout: ImageLayout,
}

impl AttachmentDescription {
    /// Cleared on load and stored at the end, the way both deferred passes use
    /// their attachments.
    pub fn cleared(format: TextureFormat, initial: ImageLayout, final_layout: ImageLayout) -> Self {
        Self {
            format,
            samples: 1,
            load_op: LoadOp::Clear,
            store_op: StoreOp::Store,
            stencil_load_op: LoadOp::DontCare,
            stencil_store_op: StoreOp::DontCare,
            initial_layout: initial,
            final_layout,
        }
    }
}

/// Index of an attachment inside its render pass plus the layout used during
/// the subpass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachmentReference {
    pub attachment: u32,
    pub layout: ImageLayout,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SubpassDescription {
    pub color_attachments: Vec<AttachmentReference>,
    pub depth_stencil_attachment: Option<AttachmentReference>,
}

/// Which aspect of an image a view exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageAspect {
    Color,
    Depth,
}

bitflags! {
    /// How an image will be used after creation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ImageUsage: u32 {
        const COLOR_ATTACHMENT = 1 << 0;
        const DEPTH_STENCIL_ATTACHMENT = 1 << 1;
        const SAMPLED = 1 << 2;
        const TRANSFER_SRC = 1 << 3;
        const TRANSFER_DST = 1 << 4;
    }
}

bitflags! {
    /// How a buffer will be bound.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        const VERTEX = 1 << 0;
        const INDEX = 1 << 1;
        const UNIFORM = 1 << 2;
        const COPY_DST = 1 << 3;
    }
}

bitflags! {
    /// Colour channels a pipeline writes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ColorWriteMask: u8 {
        const R = 1 << 0;
        const G = 1 << 1;
        const B = 1 << 2;
        const A = 1 << 3;
        const ALL = Self::R.bits() | Self::G.bits() | Self::B.bits() | Self::A.bits();
    }
}

/// Parameters for [`GpuBackend::create_image`](super::GpuBackend::create_image).
#[derive(Debug, Clone)]
pub struct ImageDesc<'a> {
    pub label: &'a str,
    pub extent: Extent2d,
    pub mip_levels: u32,
    pub samples: u32,
    pub format: TextureFormat,
    pub usage: ImageUsage,
}

/// Sampler filtering mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TextureFilter {
    Nearest,
    #[default]
    Linear,
}

impl TextureFilter {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Nearest => "nearest",
            Self::Linear => "linear",
        }
    }
}

impl std::fmt::Display for TextureFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Value an attachment is cleared to at the start of a pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClearValue {
    Color([f32; 4]),
    DepthStencil { depth: f32, stencil: u32 },
}

impl ClearValue {
    pub const OPAQUE_BLACK: Self = Self::Color([0.0, 0.0, 0.0, 1.0]);
    pub const FAR_DEPTH: Self = Self::DepthStencil {
        depth: 1.0,
        stencil: 0,
    };

    pub fn is_color(&self) -> bool {
        matches!(self, Self::Color(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
pub enum PrimitiveTopology {
    PointList,
    LineList,
    LineStrip,
    #[default]
    TriangleList,
    TriangleStrip,
    PatchList,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
pub enum PolygonMode {
    #[default]
    Fill,
    Line,
    Point,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
pub enum CullMode {
    None,
    Front,
    #[default]
    Back,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
pub enum FrontFace {
    #[default]
    #[serde(alias = "CounterClockwise")]
    Ccw,
    #[serde(alias = "Clockwise")]
    Cw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
pub enum CompareOp {
    Never,
    #[default]
    Less,
    Equal,
    LessOrEqual,
    Greater,
    NotEqual,
    GreaterOrEqual,
    Always,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
pub enum BlendFactor {
    Zero,
    One,
    SrcColor,
    OneMinusSrcColor,
    DstColor,
    OneMinusDstColor,
    SrcAlpha,
    OneMinusSrcAlpha,
    DstAlpha,
    OneMinusDstAlpha,
    ConstantColor,
    OneMinusConstantColor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
pub enum BlendOp {
    #[default]
    Add,
    Subtract,
    ReverseSubtract,
    Min,
    Max,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
pub enum LogicOp {
    Clear,
    And,
    #[default]
    Copy,
    Xor,
    Or,
    NoOp,
    Invert,
    Set,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
pub enum DynamicState {
    Viewport,
    Scissor,
    LineWidth,
    DepthBias,
    BlendConstants,
    StencilReference,
}

/// Programmable pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Fragment,
    Geometry,
    TessellationControl,
    TessellationEvaluation,
}

impl ShaderStage {
    /// Entry point name each stage's source is expected to export.
    pub fn entry_point(self) -> &'static str {
        match self {
            Self::Vertex => "vs_main",
            Self::Fragment => "fs_main",
            Self::Geometry => "gs_main",
            Self::TessellationControl => "tcs_main",
            Self::TessellationEvaluation => "tes_main",
        }
    }

    pub fn is_tessellation(self) -> bool {
        matches!(self, Self::TessellationControl | Self::TessellationEvaluation)
    }
}

/// Vertex attribute formats used by the mesh and instance layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VertexFormat {
    Float32x2,
    Float32x3,
    Float32x4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexAttribute {
    pub location: u32,
    pub format: VertexFormat,
    pub offset: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VertexStep {
    Vertex,
    Instance,
}

/// One vertex buffer binding of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexLayout {
    pub stride: u64,
    pub step: VertexStep,
    pub attributes: &'static [VertexAttribute],
}

/// Position of a recorded command buffer in the frame's submission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommandSlot(pub usize);

/// Errors reported by a [`GpuBackend`](super::GpuBackend).
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BackendError {
    /// The request is valid but the backend cannot express it.
    #[error("unsupported by this backend: {0}")]
    Unsupported(String),

    #[error("out of device memory")]
    OutOfMemory,

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("surface error: {0}")]
    Surface(String),

    #[error("device error: {0}")]
    Device(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_depth_formats() {
        assert!(TextureFormat::Depth32Float.is_depth());
        assert!(!TextureFormat::Depth32Float.has_stencil());
        assert!(TextureFormat::Depth24PlusStencil8.has_stencil());
        assert!(!TextureFormat::Rgba16Float.is_depth());
    }

    #[test]
    fn test_filterable_formats() {
        assert!(TextureFormat::Rgba8Unorm.is_filterable());
        assert!(TextureFormat::Rgba16Float.is_filterable());
        assert!(!TextureFormat::Rgba32Float.is_filterable());
        assert!(!TextureFormat::Depth32Float.is_filterable());
    }

    #[test]
    fn test_bytes_per_pixel() {
        assert_eq!(TextureFormat::Rgba8UnormSrgb.bytes_per_pixel(), Some(4));
        assert_eq!(TextureFormat::Rgba32Float.bytes_per_pixel(), Some(16));
        assert_eq!(TextureFormat::Depth32Float.bytes_per_pixel(), None);
    }

    #[test]
    fn test_extent_clamped() {
        assert_eq!(Extent2d::new(0, 720).clamped(), Extent2d::new(1, 720));
    }

    #[test]
    fn test_color_write_all() {
        assert_eq!(
            ColorWriteMask::ALL,
            ColorWriteMask::R | ColorWriteMask::G | ColorWriteMask::B | ColorWriteMask::A
        );
    }

    #[test]
    fn test_front_face_aliases() {
        let face: FrontFace = serde_json::from_str("\"Clockwise\"").unwrap();
        assert_eq!(face, FrontFace::Cw);
        let face: FrontFace = serde_json::from_str("\"Ccw\"").unwrap();
        assert_eq!(face, FrontFace::Ccw);
        assert_eq!(FrontFace::default(), FrontFace::Ccw);
    }
}

//! [`GpuBackend`] on wgpu.
//!
//! wgpu has no explicit render-pass objects, subpasses or image layouts, so a
//! render pass here is the attachment list of its single subpass, a
//! framebuffer is the matching list of views and layout transitions only
//! validate. Command buffers are recorded per slot and submitted together in
//! `end_frame`.

use wgpu::util::DeviceExt;

use super::{
    AttachmentDescription, BackendError, BlendFactor, BlendOp, BufferUsage, ClearValue,
    CommandSlot, CompareOp, CullMode, Extent2d, FramebufferAttachment, FrontFace, GpuBackend,
    GraphicsPipelineDesc, ImageAspect, ImageDesc, ImageLayout, ImageUsage, LoadOp, PolygonMode,
    PrimitiveTopology, RecordPass, ShaderStage, StoreOp, SubpassDescription, TextureBinding,
    TextureFilter, TextureFormat, VertexFormat, VertexLayout, VertexStep,
};
use crate::pipeline::CompiledPipelineInfo;

/// Format of the offscreen target a headless backend presents into.
pub const HEADLESS_FORMAT: TextureFormat = TextureFormat::Rgba8UnormSrgb;

/// Optional device features the backend turns on when the adapter has them.
fn optional_features() -> wgpu::Features {
    wgpu::Features::POLYGON_MODE_LINE
        | wgpu::Features::POLYGON_MODE_POINT
        | wgpu::Features::DEPTH_CLIP_CONTROL
}

/// Error type for device initialization failures.
#[derive(Debug, thiserror::Error)]
pub enum RenderContextError {
    /// No compatible GPU adapter found.
    #[error("no compatible GPU adapter found")]
    NoAdapter,

    /// Failed to request GPU device.
    #[error("failed to request GPU device: {0}")]
    DeviceRequest(#[from] wgpu::RequestDeviceError),

    /// Failed to create surface.
    #[error("failed to create surface: {0}")]
    SurfaceCreation(#[from] wgpu::CreateSurfaceError),

    /// The surface offers no format the renderer can target.
    #[error("surface supports no usable format")]
    NoSurfaceFormat,
}

/// Attachments of a render pass's only subpass.
#[derive(Debug)]
pub struct WgpuRenderPass {
    label: String,
    attachments: Vec<AttachmentDescription>,
    subpass: SubpassDescription,
}

impl WgpuRenderPass {
    pub fn label(&self) -> &str {
        &self.label
    }
}

#[derive(Debug)]
enum FramebufferView {
    View(wgpu::TextureView),
    SwapChain,
}

#[derive(Debug)]
pub struct WgpuFramebuffer {
    views: Vec<FramebufferView>,
    extent: Extent2d,
}

#[derive(Debug)]
pub struct WgpuPipeline {
    pipeline: wgpu::RenderPipeline,
    bind_group_layout: Option<wgpu::BindGroupLayout>,
    texture_formats: Vec<TextureFormat>,
    blend_constants: Option<wgpu::Color>,
}

/// Where finished frames go.
enum Presenter {
    Surface {
        surface: wgpu::Surface<'static>,
        config: wgpu::SurfaceConfiguration,
    },
    Offscreen {
        texture: wgpu::Texture,
    },
}

struct AcquiredFrame {
    surface_texture: Option<wgpu::SurfaceTexture>,
    view: wgpu::TextureView,
}

/// Owns the wgpu device, queue and presentation target.
pub struct WgpuBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,
    presenter: Presenter,
    format: TextureFormat,
    extent: Extent2d,
    depth_format: TextureFormat,
    /// Non-filtering sampler bound in place of the caller's for formats that
    /// cannot be linearly filtered.
    nearest_sampler: wgpu::Sampler,
    commands: Vec<Option<wgpu::CommandBuffer>>,
    frame: Option<AcquiredFrame>,
}

impl WgpuBackend {
    /// Initialize the GPU and configure a surface on `target`.
    pub async fn new(
        target: impl Into<wgpu::SurfaceTarget<'static>>,
        size: Extent2d,
        vsync: bool,
    ) -> Result<Self, RenderContextError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });
        let surface = instance.create_surface(target)?;
        let adapter = request_adapter(&instance, Some(&surface)).await?;
        let (device, queue) = request_device(&adapter).await?;

        let caps = surface.get_capabilities(&adapter);
        let (surface_format, format) =
            select_surface_format(&caps.formats).ok_or(RenderContextError::NoSurfaceFormat)?;
        let present_mode = if vsync || !caps.present_modes.contains(&wgpu::PresentMode::Mailbox) {
            wgpu::PresentMode::Fifo
        } else {
            wgpu::PresentMode::Mailbox
        };
        let extent = size.clamped();
        let config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
            format: surface_format,
            width: extent.width,
            height: extent.height,
            present_mode,
            alpha_mode: caps.alpha_modes[0],
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        };
        surface.configure(&device, &config);
        log::info!(
            "Configured surface {}x{} ({:?}, {:?})",
            extent.width,
            extent.height,
            surface_format,
            present_mode
        );

        Ok(Self::from_parts(
            &adapter,
            device,
            queue,
            Presenter::Surface { surface, config },
            format,
            extent,
        ))
    }

    /// Initialize the GPU without a window; frames render into an offscreen
    /// texture of [`HEADLESS_FORMAT`].
    pub async fn headless(size: Extent2d) -> Result<Self, RenderContextError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });
        let adapter = request_adapter(&instance, None).await?;
        let (device, queue) = request_device(&adapter).await?;
        let extent = size.clamped();
        let texture = create_offscreen_target(&device, extent);

        Ok(Self::from_parts(
            &adapter,
            device,
            queue,
            Presenter::Offscreen { texture },
            HEADLESS_FORMAT,
            extent,
        ))
    }

    pub fn new_blocking(
        target: impl Into<wgpu::SurfaceTarget<'static>>,
        size: Extent2d,
        vsync: bool,
    ) -> Result<Self, RenderContextError> {
        pollster::block_on(Self::new(target, size, vsync))
    }

    pub fn headless_blocking(size: Extent2d) -> Result<Self, RenderContextError> {
        pollster::block_on(Self::headless(size))
    }

    fn from_parts(
        adapter: &wgpu::Adapter,
        device: wgpu::Device,
        queue: wgpu::Queue,
        presenter: Presenter,
        format: TextureFormat,
        extent: Extent2d,
    ) -> Self {
        let depth_format = select_depth_format(adapter);
        let nearest_sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("kiln-nearest-sampler"),
            mag_filter: wgpu::FilterMode::Nearest,
            min_filter: wgpu::FilterMode::Nearest,
            mipmap_filter: wgpu::MipmapFilterMode::Nearest,
            ..Default::default()
        });
        Self {
            device,
            queue,
            presenter,
            format,
            extent,
            depth_format,
            nearest_sampler,
            commands: Vec::new(),
            frame: None,
        }
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    /// Copies the offscreen target back to the CPU as tightly packed RGBA8
    /// rows. Returns `Ok(None)` when presenting to a window surface.
    pub fn read_offscreen(&self) -> Result<Option<Vec<u8>>, BackendError> {
        let Presenter::Offscreen { texture } = &self.presenter else {
            return Ok(None);
        };
        let Extent2d { width, height } = self.extent;
        let row_bytes = width * 4;
        let padded_row = padded_bytes_per_row(width);
        let readback = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("offscreen_readback"),
            size: u64::from(padded_row) * u64::from(height),
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("offscreen_readback"),
            });
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &readback,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_row),
                    rows_per_image: None,
                },
            },
            extent_3d(self.extent),
        );
        self.queue.submit(std::iter::once(encoder.finish()));

        let slice = readback.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        let _ = self.device.poll(wgpu::PollType::Wait {
            submission_index: None,
            timeout: None,
        });
        match rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(BackendError::Device(e.to_string())),
            Err(e) => return Err(BackendError::Device(e.to_string())),
        }

        let mapped = slice.get_mapped_range();
        let mut pixels = Vec::with_capacity((row_bytes * height) as usize);
        for row in mapped.chunks(padded_row as usize).take(height as usize) {
            pixels.extend_from_slice(&row[..row_bytes as usize]);
        }
        drop(mapped);
        readback.unmap();
        Ok(Some(pixels))
    }

    fn acquire(&self) -> Result<AcquiredFrame, BackendError> {
        let (surface, config) = match &self.presenter {
            Presenter::Offscreen { texture } => {
                return Ok(AcquiredFrame {
                    surface_texture: None,
                    view: texture.create_view(&wgpu::TextureViewDescriptor::default()),
                });
            }
            Presenter::Surface { surface, config } => (surface, config),
        };

        let texture = match surface.get_current_texture() {
            Ok(texture) => texture,
            Err(wgpu::SurfaceError::Lost | wgpu::SurfaceError::Outdated) => {
                log::warn!("Surface lost or outdated, reconfiguring");
                surface.configure(&self.device, config);
                surface
                    .get_current_texture()
                    .map_err(|e| BackendError::Surface(e.to_string()))?
            }
            Err(wgpu::SurfaceError::OutOfMemory) => return Err(BackendError::OutOfMemory),
            Err(e) => return Err(BackendError::Surface(e.to_string())),
        };
        let view = texture
            .texture
            .create_view(&wgpu::TextureViewDescriptor::default());
        Ok(AcquiredFrame {
            surface_texture: Some(texture),
            view,
        })
    }

    fn bind_group_layout(&self, label: &str, formats: &[TextureFormat]) -> wgpu::BindGroupLayout {
        let entries: Vec<wgpu::BindGroupLayoutEntry> = formats
            .iter()
            .enumerate()
            .flat_map(|(slot, format)| {
                let slot = slot as u32;
                let sample_type = if format.is_depth() {
                    wgpu::TextureSampleType::Depth
                } else {
                    wgpu::TextureSampleType::Float {
                        filterable: format.is_filterable(),
                    }
                };
                let sampler = if format.is_filterable() {
                    wgpu::SamplerBindingType::Filtering
                } else {
                    wgpu::SamplerBindingType::NonFiltering
                };
                [
                    wgpu::BindGroupLayoutEntry {
                        binding: slot * 2,
                        visibility: wgpu::ShaderStages::FRAGMENT,
                        ty: wgpu::BindingType::Texture {
                            sample_type,
                            view_dimension: wgpu::TextureViewDimension::D2,
                            multisampled: false,
                        },
                        count: None,
                    },
                    wgpu::BindGroupLayoutEntry {
                        binding: slot * 2 + 1,
                        visibility: wgpu::ShaderStages::FRAGMENT,
                        ty: wgpu::BindingType::Sampler(sampler),
                        count: None,
                    },
                ]
            })
            .collect();

        self.device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some(label),
                entries: &entries,
            })
    }
}

async fn request_adapter(
    instance: &wgpu::Instance,
    surface: Option<&wgpu::Surface<'_>>,
) -> Result<wgpu::Adapter, RenderContextError> {
    let adapter = instance
        .request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: surface,
            force_fallback_adapter: false,
        })
        .await
        .map_err(|_| RenderContextError::NoAdapter)?;

    let info = adapter.get_info();
    log::info!(
        "Selected GPU: {} ({:?}, {:?})",
        info.name,
        info.backend,
        info.device_type
    );
    Ok(adapter)
}

async fn request_device(
    adapter: &wgpu::Adapter,
) -> Result<(wgpu::Device, wgpu::Queue), RenderContextError> {
    let (device, queue) = adapter
        .request_device(&wgpu::DeviceDescriptor {
            label: Some("kiln-device"),
            required_features: adapter.features() & optional_features(),
            required_limits: wgpu::Limits::default(),
            memory_hints: wgpu::MemoryHints::default(),
            experimental_features: wgpu::ExperimentalFeatures::default(),
            trace: wgpu::Trace::Off,
        })
        .await?;
    Ok((device, queue))
}

fn padded_bytes_per_row(width: u32) -> u32 {
    (width * 4).next_multiple_of(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT)
}

fn create_offscreen_target(device: &wgpu::Device, extent: Extent2d) -> wgpu::Texture {
    device.create_texture(&wgpu::TextureDescriptor {
        label: Some("kiln-offscreen-target"),
        size: extent_3d(extent),
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: texture_format(HEADLESS_FORMAT),
        usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
        view_formats: &[],
    })
}

/// Prefer an sRGB surface format, then anything the renderer can describe.
fn select_surface_format(
    formats: &[wgpu::TextureFormat],
) -> Option<(wgpu::TextureFormat, TextureFormat)> {
    let known = || {
        formats
            .iter()
            .filter_map(|&f| from_wgpu_format(f).map(|ours| (f, ours)))
    };
    known()
        .find(|(f, _)| f.is_srgb())
        .or_else(|| known().next())
}

/// First depth format usable as both attachment and sampled texture.
fn select_depth_format(adapter: &wgpu::Adapter) -> TextureFormat {
    const CANDIDATES: [TextureFormat; 3] = [
        TextureFormat::Depth32Float,
        TextureFormat::Depth32FloatStencil8,
        TextureFormat::Depth24PlusStencil8,
    ];
    let required =
        wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING;
    CANDIDATES
        .into_iter()
        .find(|&format| {
            adapter
                .get_texture_format_features(texture_format(format))
                .allowed_usages
                .contains(required)
        })
        .unwrap_or(TextureFormat::Depth32Float)
}

/// Reject state wgpu cannot express before handing anything to the device.
fn check_pipeline_supported(
    label: &str,
    stages: &[ShaderStage],
    subpass: u32,
    state: &CompiledPipelineInfo,
    features: wgpu::Features,
) -> Result<(), BackendError> {
    let unsupported = |what: &str| {
        Err(BackendError::Unsupported(format!(
            "pipeline {label}: {what}"
        )))
    };

    if let Some(stage) = stages
        .iter()
        .find(|s| s.is_tessellation() || **s == ShaderStage::Geometry)
    {
        return unsupported(&format!("{stage:?} stage"));
    }
    if !stages.contains(&ShaderStage::Vertex) {
        return Err(BackendError::Validation(format!(
            "pipeline {label} has no vertex stage"
        )));
    }
    if subpass > 0 {
        return unsupported(&format!("subpass {subpass}"));
    }
    if state.topology() == PrimitiveTopology::PatchList {
        return unsupported("patch list topology");
    }
    let raster = &state.rasterization;
    if raster.rasterizer_discard {
        return unsupported("rasterizer discard");
    }
    if let Some(op) = state.color_blend.logic_op {
        return unsupported(&format!("logic op {op:?}"));
    }
    match raster.polygon_mode {
        PolygonMode::Line if !features.contains(wgpu::Features::POLYGON_MODE_LINE) => {
            return unsupported("line polygon mode");
        }
        PolygonMode::Point if !features.contains(wgpu::Features::POLYGON_MODE_POINT) => {
            return unsupported("point polygon mode");
        }
        _ => {}
    }
    if raster.depth_clamp && !features.contains(wgpu::Features::DEPTH_CLIP_CONTROL) {
        return unsupported("depth clamp");
    }

    if raster.line_width != 1.0 {
        log::warn!("Pipeline {label}: line width {} ignored", raster.line_width);
    }
    if state.depth_stencil.stencil_test || state.depth_stencil.depth_bounds_test {
        log::warn!("Pipeline {label}: stencil and depth-bounds tests ignored");
    }
    if state.multisample.sample_shading || state.multisample.alpha_to_one {
        log::warn!("Pipeline {label}: sample shading and alpha-to-one ignored");
    }
    Ok(())
}

/// Parse and validate WGSL so broken sources surface as errors instead of
/// device-lost panics.
fn validate_wgsl(label: &str, source: &str) -> Result<(), BackendError> {
    let module = naga::front::wgsl::parse_str(source).map_err(|e| {
        BackendError::Validation(format!("{label}: {}", e.emit_to_string(source)))
    })?;
    naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::default(),
    )
    .validate(&module)
    .map_err(|e| BackendError::Validation(format!("{label}: {}", e.into_inner())))?;
    Ok(())
}

fn extent_3d(extent: Extent2d) -> wgpu::Extent3d {
    wgpu::Extent3d {
        width: extent.width,
        height: extent.height,
        depth_or_array_layers: 1,
    }
}

fn texture_format(format: TextureFormat) -> wgpu::TextureFormat {
    match format {
        TextureFormat::Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
        TextureFormat::Rgba8UnormSrgb => wgpu::TextureFormat::Rgba8UnormSrgb,
        TextureFormat::Bgra8Unorm => wgpu::TextureFormat::Bgra8Unorm,
        TextureFormat::Bgra8UnormSrgb => wgpu::TextureFormat::Bgra8UnormSrgb,
        TextureFormat::Rgba16Float => wgpu::TextureFormat::Rgba16Float,
        TextureFormat::Rgba32Float => wgpu::TextureFormat::Rgba32Float,
        TextureFormat::Depth16Unorm => wgpu::TextureFormat::Depth16Unorm,
        TextureFormat::Depth32Float => wgpu::TextureFormat::Depth32Float,
        TextureFormat::Depth24PlusStencil8 => wgpu::TextureFormat::Depth24PlusStencil8,
        TextureFormat::Depth32FloatStencil8 => wgpu::TextureFormat::Depth32FloatStencil8,
    }
}

fn from_wgpu_format(format: wgpu::TextureFormat) -> Option<TextureFormat> {
    Some(match format {
        wgpu::TextureFormat::Rgba8Unorm => TextureFormat::Rgba8Unorm,
        wgpu::TextureFormat::Rgba8UnormSrgb => TextureFormat::Rgba8UnormSrgb,
        wgpu::TextureFormat::Bgra8Unorm => TextureFormat::Bgra8Unorm,
        wgpu::TextureFormat::Bgra8UnormSrgb => TextureFormat::Bgra8UnormSrgb,
        wgpu::TextureFormat::Rgba16Float => TextureFormat::Rgba16Float,
        wgpu::TextureFormat::Rgba32Float => TextureFormat::Rgba32Float,
        _ => return None,
    })
}

fn texture_usage(usage: ImageUsage) -> wgpu::TextureUsages {
    let mut out = wgpu::TextureUsages::empty();
    if usage.intersects(ImageUsage::COLOR_ATTACHMENT | ImageUsage::DEPTH_STENCIL_ATTACHMENT) {
        out |= wgpu::TextureUsages::RENDER_ATTACHMENT;
    }
    if usage.contains(ImageUsage::SAMPLED) {
        out |= wgpu::TextureUsages::TEXTURE_BINDING;
    }
    if usage.contains(ImageUsage::TRANSFER_SRC) {
        out |= wgpu::TextureUsages::COPY_SRC;
    }
    if usage.contains(ImageUsage::TRANSFER_DST) {
        out |= wgpu::TextureUsages::COPY_DST;
    }
    out
}

fn buffer_usage(usage: BufferUsage) -> wgpu::BufferUsages {
    let mut out = wgpu::BufferUsages::empty();
    if usage.contains(BufferUsage::VERTEX) {
        out |= wgpu::BufferUsages::VERTEX;
    }
    if usage.contains(BufferUsage::INDEX) {
        out |= wgpu::BufferUsages::INDEX;
    }
    if usage.contains(BufferUsage::UNIFORM) {
        out |= wgpu::BufferUsages::UNIFORM;
    }
    if usage.contains(BufferUsage::COPY_DST) {
        out |= wgpu::BufferUsages::COPY_DST;
    }
    out
}

fn filter_mode(filter: TextureFilter) -> (wgpu::FilterMode, wgpu::MipmapFilterMode) {
    match filter {
        TextureFilter::Nearest => (wgpu::FilterMode::Nearest, wgpu::MipmapFilterMode::Nearest),
        TextureFilter::Linear => (wgpu::FilterMode::Linear, wgpu::MipmapFilterMode::Linear),
    }
}

fn compare_function(op: CompareOp) -> wgpu::CompareFunction {
    match op {
        CompareOp::Never => wgpu::CompareFunction::Never,
        CompareOp::Less => wgpu::CompareFunction::Less,
        CompareOp::Equal => wgpu::CompareFunction::Equal,
        CompareOp::LessOrEqual => wgpu::CompareFunction::LessEqual,
        CompareOp::Greater => wgpu::CompareFunction::Greater,
        CompareOp::NotEqual => wgpu::CompareFunction::NotEqual,
        CompareOp::GreaterOrEqual => wgpu::CompareFunction::GreaterEqual,
        CompareOp::Always => wgpu::CompareFunction::Always,
    }
}

fn blend_factor(factor: BlendFactor) -> wgpu::BlendFactor {
    match factor {
        BlendFactor::Zero => wgpu::BlendFactor::Zero,
        BlendFactor::One => wgpu::BlendFactor::One,
        BlendFactor::SrcColor => wgpu::BlendFactor::Src,
        BlendFactor::OneMinusSrcColor => wgpu::BlendFactor::OneMinusSrc,
        BlendFactor::DstColor => wgpu::BlendFactor::Dst,
        BlendFactor::OneMinusDstColor => wgpu::BlendFactor::OneMinusDst,
        BlendFactor::SrcAlpha => wgpu::BlendFactor::SrcAlpha,
        BlendFactor::OneMinusSrcAlpha => wgpu::BlendFactor::OneMinusSrcAlpha,
        BlendFactor::DstAlpha => wgpu::BlendFactor::DstAlpha,
        BlendFactor::OneMinusDstAlpha => wgpu::BlendFactor::OneMinusDstAlpha,
        BlendFactor::ConstantColor => wgpu::BlendFactor::Constant,
        BlendFactor::OneMinusConstantColor => wgpu::BlendFactor::OneMinusConstant,
    }
}

fn blend_operation(op: BlendOp) -> wgpu::BlendOperation {
    match op {
        BlendOp::Add => wgpu::BlendOperation::Add,
        BlendOp::Subtract => wgpu::BlendOperation::Subtract,
        BlendOp::ReverseSubtract => wgpu::BlendOperation::ReverseSubtract,
        BlendOp::Min => wgpu::BlendOperation::Min,
        BlendOp::Max => wgpu::BlendOperation::Max,
    }
}

fn primitive_topology(topology: PrimitiveTopology) -> wgpu::PrimitiveTopology {
    match topology {
        PrimitiveTopology::PointList => wgpu::PrimitiveTopology::PointList,
        PrimitiveTopology::LineList => wgpu::PrimitiveTopology::LineList,
        PrimitiveTopology::LineStrip => wgpu::PrimitiveTopology::LineStrip,
        PrimitiveTopology::TriangleList => wgpu::PrimitiveTopology::TriangleList,
        PrimitiveTopology::TriangleStrip => wgpu::PrimitiveTopology::TriangleStrip,
        // Rejected before pipeline creation.
        PrimitiveTopology::PatchList => wgpu::PrimitiveTopology::TriangleList,
    }
}

fn vertex_format(format: VertexFormat) -> wgpu::VertexFormat {
    match format {
        VertexFormat::Float32x2 => wgpu::VertexFormat::Float32x2,
        VertexFormat::Float32x3 => wgpu::VertexFormat::Float32x3,
        VertexFormat::Float32x4 => wgpu::VertexFormat::Float32x4,
    }
}

fn color_value(clear: Option<&ClearValue>) -> wgpu::Color {
    match clear {
        Some(ClearValue::Color([r, g, b, a])) => wgpu::Color {
            r: *r as f64,
            g: *g as f64,
            b: *b as f64,
            a: *a as f64,
        },
        _ => wgpu::Color::BLACK,
    }
}

fn color_ops(
    attachment: &AttachmentDescription,
    clear: Option<&ClearValue>,
) -> wgpu::Operations<wgpu::Color> {
    wgpu::Operations {
        load: match attachment.load_op {
            LoadOp::Clear => wgpu::LoadOp::Clear(color_value(clear)),
            LoadOp::Load | LoadOp::DontCare => wgpu::LoadOp::Load,
        },
        store: store_op(attachment.store_op),
    }
}

fn store_op(op: StoreOp) -> wgpu::StoreOp {
    match op {
        StoreOp::Store => wgpu::StoreOp::Store,
        StoreOp::DontCare => wgpu::StoreOp::Discard,
    }
}

fn depth_stencil_ops(
    attachment: &AttachmentDescription,
    clear: Option<&ClearValue>,
) -> (wgpu::Operations<f32>, Option<wgpu::Operations<u32>>) {
    let (depth, stencil) = match clear {
        Some(ClearValue::DepthStencil { depth, stencil }) => (*depth, *stencil),
        _ => (1.0, 0),
    };
    let depth_ops = wgpu::Operations {
        load: match attachment.load_op {
            LoadOp::Clear => wgpu::LoadOp::Clear(depth),
            LoadOp::Load | LoadOp::DontCare => wgpu::LoadOp::Load,
        },
        store: store_op(attachment.store_op),
    };
    let stencil_ops = attachment.format.has_stencil().then(|| wgpu::Operations {
        load: match attachment.stencil_load_op {
            LoadOp::Clear => wgpu::LoadOp::Clear(stencil),
            LoadOp::Load | LoadOp::DontCare => wgpu::LoadOp::Load,
        },
        store: store_op(attachment.stencil_store_op),
    });
    (depth_ops, stencil_ops)
}

fn color_target(
    attachment: &AttachmentDescription,
    state: &CompiledPipelineInfo,
    index: usize,
) -> wgpu::ColorTargetState {
    let blend_state = state.color_blend.attachments.get(index);
    let blend = blend_state
        .and_then(|b| b.blend)
        .map(|(color, alpha)| wgpu::BlendState {
            color: wgpu::BlendComponent {
                src_factor: blend_factor(color.src),
                dst_factor: blend_factor(color.dst),
                operation: blend_operation(color.op),
            },
            alpha: wgpu::BlendComponent {
                src_factor: blend_factor(alpha.src),
                dst_factor: blend_factor(alpha.dst),
                operation: blend_operation(alpha.op),
            },
        });
    let write_mask = blend_state
        .map(|b| wgpu::ColorWrites::from_bits_truncate(b.write_mask.bits() as u32))
        .unwrap_or(wgpu::ColorWrites::ALL);
    wgpu::ColorTargetState {
        format: texture_format(attachment.format),
        blend,
        write_mask,
    }
}

fn uses_blend_constants(state: &CompiledPipelineInfo) -> bool {
    let constant = |f: BlendFactor| {
        matches!(
            f,
            BlendFactor::ConstantColor | BlendFactor::OneMinusConstantColor
        )
    };
    state
        .color_blend
        .attachments
        .iter()
        .filter_map(|a| a.blend)
        .any(|(color, alpha)| {
            constant(color.src) || constant(color.dst) || constant(alpha.src) || constant(alpha.dst)
        })
}

fn owned_attributes(layouts: &[VertexLayout]) -> Vec<Vec<wgpu::VertexAttribute>> {
    layouts
        .iter()
        .map(|layout| {
            layout
                .attributes
                .iter()
                .map(|a| wgpu::VertexAttribute {
                    format: vertex_format(a.format),
                    offset: a.offset,
                    shader_location: a.location,
                })
                .collect()
        })
        .collect()
}

impl GpuBackend for WgpuBackend {
    type Image = wgpu::Texture;
    type ImageView = wgpu::TextureView;
    type Sampler = wgpu::Sampler;
    type ShaderModule = wgpu::ShaderModule;
    type RenderPass = WgpuRenderPass;
    type Framebuffer = WgpuFramebuffer;
    type Pipeline = WgpuPipeline;
    type Buffer = wgpu::Buffer;
    type BindGroup = wgpu::BindGroup;

    fn swap_chain_extent(&self) -> Extent2d {
        self.extent
    }

    fn swap_chain_format(&self) -> TextureFormat {
        self.format
    }

    fn find_depth_format(&self) -> TextureFormat {
        self.depth_format
    }

    fn create_image(&mut self, desc: &ImageDesc<'_>) -> Result<wgpu::Texture, BackendError> {
        if desc.extent.width == 0 || desc.extent.height == 0 {
            return Err(BackendError::Validation(format!(
                "image {} has zero extent",
                desc.label
            )));
        }
        Ok(self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(desc.label),
            size: extent_3d(desc.extent),
            mip_level_count: desc.mip_levels.max(1),
            sample_count: desc.samples.max(1),
            dimension: wgpu::TextureDimension::D2,
            format: texture_format(desc.format),
            usage: texture_usage(desc.usage),
            view_formats: &[],
        }))
    }

    fn create_image_view(
        &mut self,
        image: &wgpu::Texture,
        aspect: ImageAspect,
    ) -> Result<wgpu::TextureView, BackendError> {
        let aspect = match aspect {
            ImageAspect::Color => wgpu::TextureAspect::All,
            ImageAspect::Depth if image.format().has_stencil_aspect() => {
                wgpu::TextureAspect::DepthOnly
            }
            ImageAspect::Depth => wgpu::TextureAspect::All,
        };
        Ok(image.create_view(&wgpu::TextureViewDescriptor {
            aspect,
            ..Default::default()
        }))
    }

    fn create_sampler(
        &mut self,
        filter: TextureFilter,
        mip_levels: u32,
    ) -> Result<wgpu::Sampler, BackendError> {
        let (filter, mipmap_filter) = filter_mode(filter);
        Ok(self.device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("kiln-texture-sampler"),
            mag_filter: filter,
            min_filter: filter,
            mipmap_filter,
            lod_max_clamp: mip_levels.max(1) as f32,
            ..Default::default()
        }))
    }

    fn transition_image_layout(
        &mut self,
        image: &wgpu::Texture,
        layout: ImageLayout,
        aspect: ImageAspect,
    ) -> Result<(), BackendError> {
        let is_depth = image.format().is_depth_stencil_format();
        let aspect_matches = match aspect {
            ImageAspect::Color => !is_depth,
            ImageAspect::Depth => is_depth,
        };
        if !aspect_matches {
            return Err(BackendError::Validation(format!(
                "{aspect:?} aspect does not match image format {:?}",
                image.format()
            )));
        }
        let usage = image.usage();
        let allowed = match layout {
            ImageLayout::Undefined | ImageLayout::PresentSrc => true,
            ImageLayout::ColorAttachmentOptimal | ImageLayout::DepthStencilAttachmentOptimal => {
                usage.contains(wgpu::TextureUsages::RENDER_ATTACHMENT)
            }
            ImageLayout::ShaderReadOnlyOptimal => {
                usage.contains(wgpu::TextureUsages::TEXTURE_BINDING)
            }
            ImageLayout::TransferDstOptimal => usage.contains(wgpu::TextureUsages::COPY_DST),
        };
        if allowed {
            Ok(())
        } else {
            Err(BackendError::Validation(format!(
                "image usage {usage:?} does not allow layout {layout:?}"
            )))
        }
    }

    fn write_image(&mut self, image: &wgpu::Texture, pixels: &[u8]) -> Result<(), BackendError> {
        let format = image.format();
        let bytes_per_pixel = format.block_copy_size(None).ok_or_else(|| {
            BackendError::Unsupported(format!("uploading pixels to {format:?}"))
        })?;
        let size = image.size();
        let bytes_per_row = size.width * bytes_per_pixel;
        let expected = bytes_per_row as usize * size.height as usize;
        if pixels.len() != expected {
            return Err(BackendError::Validation(format!(
                "expected {expected} bytes of pixel data, got {}",
                pixels.len()
            )));
        }

        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: image,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            pixels,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(bytes_per_row),
                rows_per_image: None,
            },
            wgpu::Extent3d {
                depth_or_array_layers: 1,
                ..size
            },
        );
        Ok(())
    }

    fn destroy_image(&mut self, image: wgpu::Texture) {
        image.destroy();
    }

    fn destroy_image_view(&mut self, _view: wgpu::TextureView) {}

    fn destroy_sampler(&mut self, _sampler: wgpu::Sampler) {}

    fn create_render_pass(
        &mut self,
        label: &str,
        attachments: &[AttachmentDescription],
        subpasses: &[SubpassDescription],
    ) -> Result<WgpuRenderPass, BackendError> {
        let subpass = match subpasses {
            [subpass] => subpass,
            [] => {
                return Err(BackendError::Validation(format!(
                    "render pass {label} has no subpasses"
                )));
            }
            _ => {
                return Err(BackendError::Unsupported(format!(
                    "render pass {label} has {} subpasses",
                    subpasses.len()
                )));
            }
        };

        let references = subpass
            .color_attachments
            .iter()
            .chain(subpass.depth_stencil_attachment.iter());
        for reference in references {
            if reference.attachment as usize >= attachments.len() {
                return Err(BackendError::Validation(format!(
                    "render pass {label} references attachment {} of {}",
                    reference.attachment,
                    attachments.len()
                )));
            }
        }
        if attachments.iter().any(|a| a.samples > 1) {
            return Err(BackendError::Unsupported(format!(
                "render pass {label} has multisampled attachments without resolve targets"
            )));
        }

        Ok(WgpuRenderPass {
            label: label.to_string(),
            attachments: attachments.to_vec(),
            subpass: subpass.clone(),
        })
    }

    fn destroy_render_pass(&mut self, _pass: WgpuRenderPass) {}

    fn create_framebuffer(
        &mut self,
        pass: &WgpuRenderPass,
        attachments: &[FramebufferAttachment<'_, wgpu::TextureView>],
        extent: Extent2d,
    ) -> Result<WgpuFramebuffer, BackendError> {
        if attachments.len() != pass.attachments.len() {
            return Err(BackendError::Validation(format!(
                "framebuffer for {} has {} views, pass expects {}",
                pass.label,
                attachments.len(),
                pass.attachments.len()
            )));
        }
        let views = attachments
            .iter()
            .map(|attachment| match attachment {
                FramebufferAttachment::View(view) => FramebufferView::View((*view).clone()),
                FramebufferAttachment::SwapChain => FramebufferView::SwapChain,
            })
            .collect();
        Ok(WgpuFramebuffer { views, extent })
    }

    fn destroy_framebuffer(&mut self, _framebuffer: WgpuFramebuffer) {}

    fn create_shader_module(
        &mut self,
        label: &str,
        stage: ShaderStage,
        source: &str,
    ) -> Result<wgpu::ShaderModule, BackendError> {
        if stage.is_tessellation() || stage == ShaderStage::Geometry {
            return Err(BackendError::Unsupported(format!("{stage:?} stage in {label}")));
        }
        validate_wgsl(label, source)?;
        Ok(self
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(label),
                source: wgpu::ShaderSource::Wgsl(source.into()),
            }))
    }

    fn destroy_shader_module(&mut self, _module: wgpu::ShaderModule) {}

    fn create_graphics_pipeline(
        &mut self,
        desc: &GraphicsPipelineDesc<'_, Self>,
    ) -> Result<WgpuPipeline, BackendError> {
        let stages: Vec<ShaderStage> = desc.stages.iter().map(|s| s.stage).collect();
        check_pipeline_supported(
            desc.label,
            &stages,
            desc.subpass,
            desc.state,
            self.device.features(),
        )?;
        let state = desc.state;
        let pass = desc.render_pass;
        let module_for = |stage: ShaderStage| {
            desc.stages
                .iter()
                .find(|s| s.stage == stage)
                .map(|s| s.module)
        };
        let vertex_module = module_for(ShaderStage::Vertex).ok_or_else(|| {
            BackendError::Validation(format!("pipeline {} has no vertex stage", desc.label))
        })?;

        let bind_group_layout = (!desc.texture_formats.is_empty())
            .then(|| self.bind_group_layout(desc.label, desc.texture_formats));
        let layouts: Vec<&wgpu::BindGroupLayout> = bind_group_layout.iter().collect();
        let pipeline_layout = self
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(desc.label),
                bind_group_layouts: &layouts,
                immediate_size: 0,
            });

        let attributes = owned_attributes(desc.vertex_layouts);
        let buffers: Vec<wgpu::VertexBufferLayout> = desc
            .vertex_layouts
            .iter()
            .zip(&attributes)
            .map(|(layout, attributes)| wgpu::VertexBufferLayout {
                array_stride: layout.stride,
                step_mode: match layout.step {
                    VertexStep::Vertex => wgpu::VertexStepMode::Vertex,
                    VertexStep::Instance => wgpu::VertexStepMode::Instance,
                },
                attributes,
            })
            .collect();

        let targets: Vec<Option<wgpu::ColorTargetState>> = pass
            .subpass
            .color_attachments
            .iter()
            .enumerate()
            .map(|(i, r)| Some(color_target(&pass.attachments[r.attachment as usize], state, i)))
            .collect();

        let depth_stencil = pass.subpass.depth_stencil_attachment.map(|r| {
            let attachment = &pass.attachments[r.attachment as usize];
            let depth = &state.depth_stencil;
            wgpu::DepthStencilState {
                format: texture_format(attachment.format),
                depth_write_enabled: depth.depth_test && depth.depth_write,
                depth_compare: if depth.depth_test {
                    compare_function(depth.compare)
                } else {
                    wgpu::CompareFunction::Always
                },
                stencil: wgpu::StencilState::default(),
                bias: state
                    .rasterization
                    .depth_bias
                    .map(|bias| wgpu::DepthBiasState {
                        constant: bias.constant as i32,
                        slope_scale: bias.slope,
                        clamp: bias.clamp,
                    })
                    .unwrap_or_default(),
            }
        });

        let raster = &state.rasterization;
        let topology = state.topology();
        let strip = matches!(
            topology,
            PrimitiveTopology::LineStrip | PrimitiveTopology::TriangleStrip
        );

        let pipeline = self
            .device
            .create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some(desc.label),
                layout: Some(&pipeline_layout),
                vertex: wgpu::VertexState {
                    module: vertex_module,
                    entry_point: Some(ShaderStage::Vertex.entry_point()),
                    buffers: &buffers,
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                },
                fragment: module_for(ShaderStage::Fragment).map(|module| wgpu::FragmentState {
                    module,
                    entry_point: Some(ShaderStage::Fragment.entry_point()),
                    targets: &targets,
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                }),
                primitive: wgpu::PrimitiveState {
                    topology: primitive_topology(topology),
                    strip_index_format: strip.then_some(wgpu::IndexFormat::Uint32),
                    front_face: match raster.front_face {
                        FrontFace::Ccw => wgpu::FrontFace::Ccw,
                        FrontFace::Cw => wgpu::FrontFace::Cw,
                    },
                    cull_mode: match raster.cull_mode {
                        CullMode::None => None,
                        CullMode::Front => Some(wgpu::Face::Front),
                        CullMode::Back => Some(wgpu::Face::Back),
                    },
                    unclipped_depth: raster.depth_clamp,
                    polygon_mode: match raster.polygon_mode {
                        PolygonMode::Fill => wgpu::PolygonMode::Fill,
                        PolygonMode::Line => wgpu::PolygonMode::Line,
                        PolygonMode::Point => wgpu::PolygonMode::Point,
                    },
                    conservative: false,
                },
                depth_stencil,
                multisample: wgpu::MultisampleState {
                    count: state.multisample.samples,
                    mask: !0,
                    alpha_to_coverage_enabled: state.multisample.alpha_to_coverage,
                },
                multiview_mask: None,
                cache: None,
            });

        let [r, g, b, a] = state.color_blend.blend_constants;
        Ok(WgpuPipeline {
            pipeline,
            bind_group_layout,
            texture_formats: desc.texture_formats.to_vec(),
            blend_constants: uses_blend_constants(state).then_some(wgpu::Color {
                r: r as f64,
                g: g as f64,
                b: b as f64,
                a: a as f64,
            }),
        })
    }

    fn destroy_pipeline(&mut self, _pipeline: WgpuPipeline) {}

    fn create_buffer(
        &mut self,
        label: &str,
        usage: BufferUsage,
        contents: &[u8],
    ) -> Result<wgpu::Buffer, BackendError> {
        if contents.is_empty() {
            return Err(BackendError::Validation(format!("buffer {label} is empty")));
        }
        Ok(self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(label),
                contents,
                usage: buffer_usage(usage),
            }))
    }

    fn write_buffer(&mut self, buffer: &wgpu::Buffer, offset: u64, data: &[u8]) {
        self.queue.write_buffer(buffer, offset, data);
    }

    fn destroy_buffer(&mut self, buffer: wgpu::Buffer) {
        buffer.destroy();
    }

    fn write_descriptors(
        &mut self,
        pipeline: &WgpuPipeline,
        textures: &[TextureBinding<'_, Self>],
    ) -> Result<wgpu::BindGroup, BackendError> {
        let layout = pipeline.bind_group_layout.as_ref().ok_or_else(|| {
            BackendError::Validation("pipeline samples no textures".to_string())
        })?;
        if textures.len() != pipeline.texture_formats.len() {
            return Err(BackendError::Validation(format!(
                "pipeline samples {} textures, got {}",
                pipeline.texture_formats.len(),
                textures.len()
            )));
        }

        let entries: Vec<wgpu::BindGroupEntry> = textures
            .iter()
            .zip(&pipeline.texture_formats)
            .enumerate()
            .flat_map(|(slot, (binding, format))| {
                let slot = slot as u32;
                let sampler = if format.is_filterable() {
                    binding.sampler
                } else {
                    &self.nearest_sampler
                };
                [
                    wgpu::BindGroupEntry {
                        binding: slot * 2,
                        resource: wgpu::BindingResource::TextureView(binding.view),
                    },
                    wgpu::BindGroupEntry {
                        binding: slot * 2 + 1,
                        resource: wgpu::BindingResource::Sampler(sampler),
                    },
                ]
            })
            .collect();

        Ok(self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("kiln-texture-bind-group"),
            layout,
            entries: &entries,
        }))
    }

    fn destroy_bind_group(&mut self, _group: wgpu::BindGroup) {}

    fn record_pass(
        &mut self,
        slot: CommandSlot,
        pass: &RecordPass<'_, Self>,
    ) -> Result<(), BackendError> {
        let render_pass = pass.render_pass;
        let framebuffer = pass.framebuffer;
        let view_at = |index: u32| {
            match framebuffer.views.get(index as usize) {
                Some(FramebufferView::View(view)) => Ok(view),
                Some(FramebufferView::SwapChain) => self
                    .frame
                    .as_ref()
                    .map(|frame| &frame.view)
                    .ok_or_else(|| {
                        BackendError::Surface("no swap-chain image acquired".to_string())
                    }),
                None => Err(BackendError::Validation(format!(
                    "framebuffer has no attachment {index}"
                ))),
            }
        };

        let mut color_attachments = Vec::with_capacity(render_pass.subpass.color_attachments.len());
        for reference in &render_pass.subpass.color_attachments {
            let index = reference.attachment as usize;
            color_attachments.push(Some(wgpu::RenderPassColorAttachment {
                view: view_at(reference.attachment)?,
                resolve_target: None,
                ops: color_ops(&render_pass.attachments[index], pass.clears.get(index)),
                depth_slice: None,
            }));
        }
        let depth_stencil_attachment = match render_pass.subpass.depth_stencil_attachment {
            Some(reference) => {
                let index = reference.attachment as usize;
                let (depth_ops, stencil_ops) =
                    depth_stencil_ops(&render_pass.attachments[index], pass.clears.get(index));
                Some(wgpu::RenderPassDepthStencilAttachment {
                    view: view_at(reference.attachment)?,
                    depth_ops: Some(depth_ops),
                    stencil_ops,
                })
            }
            None => None,
        };

        let extent = Extent2d::new(
            pass.extent.width.min(framebuffer.extent.width),
            pass.extent.height.min(framebuffer.extent.height),
        )
        .clamped();

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some(pass.label),
            });
        {
            let mut rpass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some(pass.label),
                color_attachments: &color_attachments,
                depth_stencil_attachment,
                timestamp_writes: None,
                occlusion_query_set: None,
                multiview_mask: None,
            });
            rpass.set_viewport(
                0.0,
                0.0,
                extent.width as f32,
                extent.height as f32,
                0.0,
                1.0,
            );
            rpass.set_scissor_rect(0, 0, extent.width, extent.height);

            for draw in pass.draws {
                rpass.set_pipeline(&draw.pipeline.pipeline);
                if let Some(color) = draw.pipeline.blend_constants {
                    rpass.set_blend_constant(color);
                }
                if let Some(group) = draw.bind_group {
                    rpass.set_bind_group(0, group, &[]);
                }
                rpass.set_vertex_buffer(0, draw.vertex_buffer.slice(..));
                rpass.set_vertex_buffer(1, draw.instance_buffer.slice(..));
                rpass.set_index_buffer(draw.index_buffer.slice(..), wgpu::IndexFormat::Uint32);
                rpass.draw_indexed(0..draw.index_count, 0, 0..draw.instance_count);
            }
        }

        if self.commands.len() <= slot.0 {
            self.commands.resize_with(slot.0 + 1, || None);
        }
        self.commands[slot.0] = Some(encoder.finish());
        Ok(())
    }

    fn begin_frame(&mut self, _frame_in_flight: usize) -> Result<(), BackendError> {
        // An unpresented image from a failed frame is dropped here.
        self.frame = None;
        self.frame = Some(self.acquire()?);
        Ok(())
    }

    fn end_frame(&mut self, slots: &[CommandSlot]) -> Result<(), BackendError> {
        let mut buffers = Vec::with_capacity(slots.len());
        for slot in slots {
            match self.commands.get_mut(slot.0).and_then(Option::take) {
                Some(buffer) => buffers.push(buffer),
                None => log::warn!("Command slot {} was not recorded this frame", slot.0),
            }
        }
        self.queue.submit(buffers);

        let frame = self.frame.take().ok_or_else(|| {
            BackendError::Surface("end_frame without an acquired image".to_string())
        })?;
        if let Some(texture) = frame.surface_texture {
            texture.present();
        }
        Ok(())
    }

    fn wait_idle(&mut self) {
        let _ = self.device.poll(wgpu::PollType::Wait {
            submission_index: None,
            timeout: None,
        });
    }

    fn resize(&mut self, extent: Extent2d) -> Result<(), BackendError> {
        let extent = extent.clamped();
        self.frame = None;
        match &mut self.presenter {
            Presenter::Surface { surface, config } => {
                config.width = extent.width;
                config.height = extent.height;
                surface.configure(&self.device, config);
            }
            Presenter::Offscreen { texture } => {
                texture.destroy();
                *texture = create_offscreen_target(&self.device, extent);
            }
        }
        self.extent = extent;
        log::debug!("Resized swap chain to {}x{}", extent.width, extent.height);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{gbuffer_pipeline_state, lighting_pipeline_state};

    fn create_test_backend() -> Option<WgpuBackend> {
        WgpuBackend::headless_blocking(Extent2d::new(64, 64)).ok()
    }

    fn lighting_state() -> CompiledPipelineInfo {
        lighting_pipeline_state()
    }

    #[test]
    fn test_format_mapping_round_trips_color_formats() {
        for format in [
            TextureFormat::Rgba8Unorm,
            TextureFormat::Rgba8UnormSrgb,
            TextureFormat::Bgra8Unorm,
            TextureFormat::Bgra8UnormSrgb,
            TextureFormat::Rgba16Float,
            TextureFormat::Rgba32Float,
        ] {
            assert_eq!(from_wgpu_format(texture_format(format)), Some(format));
        }
        assert_eq!(from_wgpu_format(wgpu::TextureFormat::R8Unorm), None);
    }

    #[test]
    fn test_readback_rows_are_copy_aligned() {
        assert_eq!(padded_bytes_per_row(64), 256);
        assert_eq!(padded_bytes_per_row(65), 512);
        assert_eq!(padded_bytes_per_row(1), 256);
    }

    #[test]
    fn test_surface_format_prefers_srgb() {
        let formats = [
            wgpu::TextureFormat::Rgba16Float,
            wgpu::TextureFormat::Bgra8Unorm,
            wgpu::TextureFormat::Bgra8UnormSrgb,
        ];
        assert_eq!(
            select_surface_format(&formats),
            Some((
                wgpu::TextureFormat::Bgra8UnormSrgb,
                TextureFormat::Bgra8UnormSrgb
            ))
        );
        assert_eq!(
            select_surface_format(&[wgpu::TextureFormat::R8Unorm, wgpu::TextureFormat::Rgba8Unorm]),
            Some((wgpu::TextureFormat::Rgba8Unorm, TextureFormat::Rgba8Unorm))
        );
        assert_eq!(select_surface_format(&[wgpu::TextureFormat::R8Unorm]), None);
    }

    #[test]
    fn test_usage_mapping() {
        let usage = texture_usage(ImageUsage::DEPTH_STENCIL_ATTACHMENT | ImageUsage::SAMPLED);
        assert_eq!(
            usage,
            wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING
        );
        assert_eq!(
            buffer_usage(BufferUsage::VERTEX | BufferUsage::COPY_DST),
            wgpu::BufferUsages::VERTEX | wgpu::BufferUsages::COPY_DST
        );
    }

    #[test]
    fn test_supported_pipeline_passes() {
        let state = lighting_state();
        let stages = [ShaderStage::Vertex, ShaderStage::Fragment];
        assert!(check_pipeline_supported("p", &stages, 0, &state, wgpu::Features::empty()).is_ok());
    }

    #[test]
    fn test_tessellation_is_unsupported() {
        let state = lighting_state();
        let stages = [
            ShaderStage::Vertex,
            ShaderStage::TessellationControl,
            ShaderStage::Fragment,
        ];
        let err = check_pipeline_supported("p", &stages, 0, &state, wgpu::Features::empty())
            .unwrap_err();
        assert!(matches!(err, BackendError::Unsupported(_)));
    }

    #[test]
    fn test_missing_vertex_stage_fails_validation() {
        let state = lighting_state();
        let err = check_pipeline_supported(
            "p",
            &[ShaderStage::Fragment],
            0,
            &state,
            wgpu::Features::empty(),
        )
        .unwrap_err();
        assert!(matches!(err, BackendError::Validation(_)));
    }

    #[test]
    fn test_state_wgpu_cannot_express_is_unsupported() {
        let stages = [ShaderStage::Vertex, ShaderStage::Fragment];
        let no_features = wgpu::Features::empty();

        let mut state = lighting_state();
        state.rasterization.rasterizer_discard = true;
        assert!(check_pipeline_supported("p", &stages, 0, &state, no_features).is_err());

        let mut state = lighting_state();
        state.color_blend.logic_op = Some(crate::backend::LogicOp::Xor);
        assert!(check_pipeline_supported("p", &stages, 0, &state, no_features).is_err());

        let mut state = lighting_state();
        state.input_assembly.topology = Some(PrimitiveTopology::PatchList);
        assert!(check_pipeline_supported("p", &stages, 0, &state, no_features).is_err());

        let state = lighting_state();
        assert!(check_pipeline_supported("p", &stages, 1, &state, no_features).is_err());

        let mut state = lighting_state();
        state.rasterization.polygon_mode = PolygonMode::Line;
        assert!(check_pipeline_supported("p", &stages, 0, &state, no_features).is_err());
        assert!(
            check_pipeline_supported(
                "p",
                &stages,
                0,
                &state,
                wgpu::Features::POLYGON_MODE_LINE
            )
            .is_ok()
        );
    }

    #[test]
    fn test_invalid_wgsl_is_rejected() {
        assert!(validate_wgsl("bad", "fn vs_main( {").is_err());
        assert!(
            validate_wgsl(
                "good",
                "@vertex fn vs_main() -> @builtin(position) vec4<f32> { return vec4<f32>(0.0); }"
            )
            .is_ok()
        );
    }

    #[test]
    fn test_builtin_shaders_validate() {
        for (path, source) in crate::builtin::text_assets() {
            if path.ends_with(".wgsl") {
                validate_wgsl(path, source).unwrap();
            }
        }
    }

    #[test]
    fn test_blend_constants_detected() {
        let mut state = gbuffer_pipeline_state(&Default::default());
        assert!(!uses_blend_constants(&state));
        let constant = crate::pipeline::BlendComponent {
            src: BlendFactor::ConstantColor,
            dst: BlendFactor::Zero,
            op: BlendOp::Add,
        };
        state.color_blend.attachments[0].blend = Some((constant, constant));
        assert!(uses_blend_constants(&state));
    }

    #[test]
    fn test_headless_backend_reports_swap_chain() {
        let Some(backend) = create_test_backend() else {
            return;
        };
        assert_eq!(backend.swap_chain_extent(), Extent2d::new(64, 64));
        assert_eq!(backend.swap_chain_format(), HEADLESS_FORMAT);
        assert!(backend.find_depth_format().is_depth());
    }

    #[test]
    fn test_write_image_checks_size() {
        let Some(mut backend) = create_test_backend() else {
            return;
        };
        let image = backend
            .create_image(&ImageDesc {
                label: "test",
                extent: Extent2d::new(2, 2),
                mip_levels: 1,
                samples: 1,
                format: TextureFormat::Rgba8UnormSrgb,
                usage: ImageUsage::SAMPLED | ImageUsage::TRANSFER_DST,
            })
            .unwrap();
        backend
            .transition_image_layout(&image, ImageLayout::TransferDstOptimal, ImageAspect::Color)
            .unwrap();
        assert!(backend.write_image(&image, &[255; 16]).is_ok());
        assert!(matches!(
            backend.write_image(&image, &[255; 12]),
            Err(BackendError::Validation(_))
        ));
        assert!(
            backend
                .transition_image_layout(&image, ImageLayout::ColorAttachmentOptimal, ImageAspect::Color)
                .is_err()
        );
        backend.destroy_image(image);
    }

    #[test]
    fn test_render_pass_rejects_multiple_subpasses() {
        let Some(mut backend) = create_test_backend() else {
            return;
        };
        let attachment = AttachmentDescription::cleared(
            TextureFormat::Rgba8Unorm,
            ImageLayout::Undefined,
            ImageLayout::ShaderReadOnlyOptimal,
        );
        let subpass = SubpassDescription {
            color_attachments: vec![crate::backend::AttachmentReference {
                attachment: 0,
                layout: ImageLayout::ColorAttachmentOptimal,
            }],
            depth_stencil_attachment: None,
        };
        assert!(matches!(
            backend.create_render_pass("two", &[attachment], &[subpass.clone(), subpass.clone()]),
            Err(BackendError::Unsupported(_))
        ));
        let pass = backend
            .create_render_pass("one", &[attachment], &[subpass])
            .unwrap();
        assert_eq!(pass.label(), "one");
        assert!(
            backend
                .create_framebuffer(&pass, &[], Extent2d::new(64, 64))
                .is_err()
        );
    }

    #[test]
    fn test_deferred_frame_on_device() {
        use kiln_assets::MemoryAssetStore;
        use kiln_config::RenderConfig;

        use crate::builtin;
        use crate::canvas::GBUFFER_CANVAS;
        use crate::draw::{Drawing, Drawings, ShaderDataBase};
        use crate::renderer::Renderer;

        let Some(backend) = create_test_backend() else {
            return;
        };
        let mut assets = MemoryAssetStore::new();
        builtin::install(&mut assets).unwrap();

        let mut renderer = Renderer::new(backend, &RenderConfig::default());
        renderer.register_gbuffer_canvas(&assets).unwrap();
        let material = renderer.material(&assets, builtin::DEFAULT_MATERIAL).unwrap();
        let quad = renderer.meshes_mut().quad();
        renderer.create_pending(&assets);
        assert!(renderer.shaders().get(material.shader).unwrap().is_ready());

        let mut drawings = Drawings::new();
        drawings.add(Drawing::from_material(
            GBUFFER_CANVAS,
            &material,
            quad,
            ShaderDataBase::default(),
        ));
        renderer.begin_frame().unwrap();
        renderer.render(&mut drawings).unwrap();
        renderer.end_frame().unwrap();
        assert_eq!(renderer.frame_counter(), 1);

        // An identity-model quad covers the whole target, so the lit centre
        // texel must not be the cleared black.
        let pixels = renderer.backend().read_offscreen().unwrap().unwrap();
        assert_eq!(pixels.len(), 64 * 64 * 4);
        let centre = (32 * 64 + 32) * 4;
        let texel = &pixels[centre..centre + 4];
        assert!(texel[..3].iter().any(|&c| c > 0), "centre texel is black: {texel:?}");

        renderer.resize(Extent2d::new(32, 48)).unwrap();
        assert_eq!(renderer.backend().swap_chain_extent(), Extent2d::new(32, 48));
        renderer.destroy();
    }
}

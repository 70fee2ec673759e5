//! The graphics device seam.
//!
//! Everything above this module talks to the GPU through [`GpuBackend`]. The
//! renderer, caches and canvases are generic over it and resolved at compile
//! time; [`WgpuBackend`] is the production implementation.

mod types;
mod wgpu_backend;

#[cfg(test)]
pub(crate) mod recording;

pub use types::*;
pub use wgpu_backend::{
    HEADLESS_FORMAT, RenderContextError, WgpuBackend, WgpuFramebuffer, WgpuPipeline, WgpuRenderPass,
};

use crate::pipeline::CompiledPipelineInfo;

/// A framebuffer slot: either a concrete view or the swap-chain image of
/// whichever frame is being recorded.
pub enum FramebufferAttachment<'a, V> {
    View(&'a V),
    SwapChain,
}

impl<V> Clone for FramebufferAttachment<'_, V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<V> Copy for FramebufferAttachment<'_, V> {}

/// A compiled stage module handed to pipeline creation.
pub struct PipelineStage<'a, B: GpuBackend> {
    pub stage: ShaderStage,
    pub module: &'a B::ShaderModule,
}

/// Everything a backend needs to build one graphics pipeline.
pub struct GraphicsPipelineDesc<'a, B: GpuBackend> {
    pub label: &'a str,
    pub stages: Vec<PipelineStage<'a, B>>,
    pub render_pass: &'a B::RenderPass,
    pub subpass: u32,
    pub vertex_layouts: &'a [VertexLayout],
    pub state: &'a CompiledPipelineInfo,
    /// Format of the texture bound at each sampled slot, in binding order.
    pub texture_formats: &'a [TextureFormat],
}

/// One sampled texture written into a descriptor set.
pub struct TextureBinding<'a, B: GpuBackend> {
    pub view: &'a B::ImageView,
    pub sampler: &'a B::Sampler,
}

/// An indexed, instanced draw recorded into a pass.
pub struct DrawCommand<'a, B: GpuBackend> {
    pub pipeline: &'a B::Pipeline,
    pub bind_group: Option<&'a B::BindGroup>,
    pub vertex_buffer: &'a B::Buffer,
    pub index_buffer: &'a B::Buffer,
    pub index_count: u32,
    pub instance_buffer: &'a B::Buffer,
    pub instance_count: u32,
}

/// A complete render pass recording: begin with `clears`, set the dynamic
/// viewport and scissor to `extent`, issue `draws`, end.
pub struct RecordPass<'a, B: GpuBackend> {
    pub label: &'a str,
    pub render_pass: &'a B::RenderPass,
    pub framebuffer: &'a B::Framebuffer,
    pub extent: Extent2d,
    pub clears: &'a [ClearValue],
    pub draws: &'a [DrawCommand<'a, B>],
}

/// Graphics device operations the renderer is built on.
///
/// Handles are owned values; every `create_*` has a matching `destroy_*` that
/// consumes the handle. Callers wait for idle before destroying anything a
/// submitted frame may still reference.
pub trait GpuBackend: Sized + 'static {
    type Image;
    type ImageView;
    type Sampler;
    type ShaderModule;
    type RenderPass;
    type Framebuffer;
    type Pipeline;
    type Buffer;
    type BindGroup;

    fn swap_chain_extent(&self) -> Extent2d;
    fn swap_chain_format(&self) -> TextureFormat;
    /// Best depth format the device can render to and sample.
    fn find_depth_format(&self) -> TextureFormat;

    fn create_image(&mut self, desc: &ImageDesc<'_>) -> Result<Self::Image, BackendError>;
    fn create_image_view(
        &mut self,
        image: &Self::Image,
        aspect: ImageAspect,
    ) -> Result<Self::ImageView, BackendError>;
    fn create_sampler(
        &mut self,
        filter: TextureFilter,
        mip_levels: u32,
    ) -> Result<Self::Sampler, BackendError>;
    fn transition_image_layout(
        &mut self,
        image: &Self::Image,
        layout: ImageLayout,
        aspect: ImageAspect,
    ) -> Result<(), BackendError>;
    /// Upload tightly packed pixels into mip level 0.
    fn write_image(&mut self, image: &Self::Image, pixels: &[u8]) -> Result<(), BackendError>;
    fn destroy_image(&mut self, image: Self::Image);
    fn destroy_image_view(&mut self, view: Self::ImageView);
    fn destroy_sampler(&mut self, sampler: Self::Sampler);

    fn create_render_pass(
        &mut self,
        label: &str,
        attachments: &[AttachmentDescription],
        subpasses: &[SubpassDescription],
    ) -> Result<Self::RenderPass, BackendError>;
    fn destroy_render_pass(&mut self, pass: Self::RenderPass);
    fn create_framebuffer(
        &mut self,
        pass: &Self::RenderPass,
        attachments: &[FramebufferAttachment<'_, Self::ImageView>],
        extent: Extent2d,
    ) -> Result<Self::Framebuffer, BackendError>;
    fn destroy_framebuffer(&mut self, framebuffer: Self::Framebuffer);

    fn create_shader_module(
        &mut self,
        label: &str,
        stage: ShaderStage,
        source: &str,
    ) -> Result<Self::ShaderModule, BackendError>;
    fn destroy_shader_module(&mut self, module: Self::ShaderModule);
    fn create_graphics_pipeline(
        &mut self,
        desc: &GraphicsPipelineDesc<'_, Self>,
    ) -> Result<Self::Pipeline, BackendError>;
    fn destroy_pipeline(&mut self, pipeline: Self::Pipeline);

    fn create_buffer(
        &mut self,
        label: &str,
        usage: BufferUsage,
        contents: &[u8],
    ) -> Result<Self::Buffer, BackendError>;
    fn write_buffer(&mut self, buffer: &Self::Buffer, offset: u64, data: &[u8]);
    fn destroy_buffer(&mut self, buffer: Self::Buffer);

    /// Bind `textures` to the pipeline's sampled slots.
    fn write_descriptors(
        &mut self,
        pipeline: &Self::Pipeline,
        textures: &[TextureBinding<'_, Self>],
    ) -> Result<Self::BindGroup, BackendError>;
    fn destroy_bind_group(&mut self, group: Self::BindGroup);

    /// Record one render pass into the command buffer at `slot`.
    fn record_pass(
        &mut self,
        slot: CommandSlot,
        pass: &RecordPass<'_, Self>,
    ) -> Result<(), BackendError>;

    /// Acquire the frame's swap-chain image.
    fn begin_frame(&mut self, frame_in_flight: usize) -> Result<(), BackendError>;
    /// Submit the command buffers recorded at `slots`, in order, and present.
    fn end_frame(&mut self, slots: &[CommandSlot]) -> Result<(), BackendError>;
    fn wait_idle(&mut self);
    fn resize(&mut self, extent: Extent2d) -> Result<(), BackendError>;
}

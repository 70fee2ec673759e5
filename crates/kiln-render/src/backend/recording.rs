//! In-memory backend for tests: hands out integer handles, records every call
//! and fails on request.

use rustc_hash::{FxHashMap, FxHashSet};

use super::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct Handle(pub u64);

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Call {
    CreateImage {
        image: Handle,
        label: String,
        format: TextureFormat,
        usage: ImageUsage,
    },
    CreateImageView {
        image: Handle,
        aspect: ImageAspect,
    },
    CreateSampler {
        filter: TextureFilter,
    },
    Transition {
        image: Handle,
        layout: ImageLayout,
    },
    WriteImage {
        image: Handle,
        bytes: usize,
    },
    CreateRenderPass {
        label: String,
        attachments: Vec<AttachmentDescription>,
        subpasses: Vec<SubpassDescription>,
    },
    CreateFramebuffer {
        pass: Handle,
        views: usize,
        swap_chain: usize,
    },
    CreateShaderModule {
        label: String,
        stage: ShaderStage,
    },
    CreatePipeline {
        label: String,
        topology: Option<PrimitiveTopology>,
        cull_mode: CullMode,
        depth_test: bool,
        color_attachments: usize,
        texture_formats: Vec<TextureFormat>,
        stages: Vec<ShaderStage>,
    },
    CreateBuffer {
        label: String,
        size: usize,
    },
    WriteBuffer {
        buffer: Handle,
        size: usize,
    },
    WriteDescriptors {
        pipeline: Handle,
        textures: usize,
    },
    RecordPass {
        slot: CommandSlot,
        label: String,
        clears: Vec<ClearValue>,
        draws: usize,
        extent: Extent2d,
    },
    BeginFrame(usize),
    EndFrame(Vec<CommandSlot>),
    WaitIdle,
    Resize(Extent2d),
    Destroy {
        kind: &'static str,
        handle: Handle,
    },
}

/// Backend double used by the compiler, cache and canvas tests.
pub(crate) struct RecordingBackend {
    pub extent: Extent2d,
    pub format: TextureFormat,
    pub depth_format: TextureFormat,
    pub calls: Vec<Call>,
    next_handle: u64,
    counts: FxHashMap<&'static str, usize>,
    failures: Vec<(&'static str, Option<usize>)>,
    live: FxHashSet<Handle>,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self {
            extent: Extent2d::new(1280, 720),
            format: TextureFormat::Bgra8UnormSrgb,
            depth_format: TextureFormat::Depth32Float,
            calls: Vec::new(),
            next_handle: 1,
            counts: FxHashMap::default(),
            failures: Vec::new(),
            live: FxHashSet::default(),
        }
    }

    /// Fail the `n`th (zero-based) call to `op`.
    pub fn fail_nth(&mut self, op: &'static str, n: usize) {
        self.failures.push((op, Some(n)));
    }

    /// Fail every call to `op`.
    pub fn fail_always(&mut self, op: &'static str) {
        self.failures.push((op, None));
    }

    /// Handles created and not yet destroyed.
    pub fn live_handles(&self) -> usize {
        self.live.len()
    }

    pub fn count(&self, op: &'static str) -> usize {
        self.counts.get(op).copied().unwrap_or(0)
    }

    pub fn recorded_passes(&self) -> Vec<(CommandSlot, String, Vec<ClearValue>, usize)> {
        self.calls
            .iter()
            .filter_map(|call| match call {
                Call::RecordPass {
                    slot,
                    label,
                    clears,
                    draws,
                    ..
                } => Some((*slot, label.clone(), clears.clone(), *draws)),
                _ => None,
            })
            .collect()
    }

    pub fn created_images(&self) -> Vec<(String, TextureFormat, ImageUsage)> {
        self.calls
            .iter()
            .filter_map(|call| match call {
                Call::CreateImage {
                    label,
                    format,
                    usage,
                    ..
                } => Some((label.clone(), *format, *usage)),
                _ => None,
            })
            .collect()
    }

    fn enter(&mut self, op: &'static str) -> Result<(), BackendError> {
        let index = self.counts.entry(op).or_insert(0);
        let current = *index;
        *index += 1;
        let fails = self
            .failures
            .iter()
            .any(|(name, nth)| *name == op && nth.is_none_or(|n| n == current));
        if fails {
            Err(BackendError::Device(format!("injected failure in {op}")))
        } else {
            Ok(())
        }
    }

    fn handle(&mut self) -> Handle {
        let handle = Handle(self.next_handle);
        self.next_handle += 1;
        self.live.insert(handle);
        handle
    }

    fn release(&mut self, kind: &'static str, handle: Handle) {
        self.live.remove(&handle);
        self.calls.push(Call::Destroy { kind, handle });
    }
}

impl GpuBackend for RecordingBackend {
    type Image = Handle;
    type ImageView = Handle;
    type Sampler = Handle;
    type ShaderModule = Handle;
    type RenderPass = Handle;
    type Framebuffer = Handle;
    type Pipeline = Handle;
    type Buffer = Handle;
    type BindGroup = Handle;

    fn swap_chain_extent(&self) -> Extent2d {
        self.extent
    }

    fn swap_chain_format(&self) -> TextureFormat {
        self.format
    }

    fn find_depth_format(&self) -> TextureFormat {
        self.depth_format
    }

    fn create_image(&mut self, desc: &ImageDesc<'_>) -> Result<Handle, BackendError> {
        self.enter("create_image")?;
        let image = self.handle();
        self.calls.push(Call::CreateImage {
            image,
            label: desc.label.to_string(),
            format: desc.format,
            usage: desc.usage,
        });
        Ok(image)
    }

    fn create_image_view(
        &mut self,
        image: &Handle,
        aspect: ImageAspect,
    ) -> Result<Handle, BackendError> {
        self.enter("create_image_view")?;
        self.calls.push(Call::CreateImageView {
            image: *image,
            aspect,
        });
        Ok(self.handle())
    }

    fn create_sampler(
        &mut self,
        filter: TextureFilter,
        _mip_levels: u32,
    ) -> Result<Handle, BackendError> {
        self.enter("create_sampler")?;
        self.calls.push(Call::CreateSampler { filter });
        Ok(self.handle())
    }

    fn transition_image_layout(
        &mut self,
        image: &Handle,
        layout: ImageLayout,
        _aspect: ImageAspect,
    ) -> Result<(), BackendError> {
        self.enter("transition_image_layout")?;
        self.calls.push(Call::Transition {
            image: *image,
            layout,
        });
        Ok(())
    }

    fn write_image(&mut self, image: &Handle, pixels: &[u8]) -> Result<(), BackendError> {
        self.enter("write_image")?;
        self.calls.push(Call::WriteImage {
            image: *image,
            bytes: pixels.len(),
        });
        Ok(())
    }

    fn destroy_image(&mut self, image: Handle) {
        self.release("image", image);
    }

    fn destroy_image_view(&mut self, view: Handle) {
        self.release("image_view", view);
    }

    fn destroy_sampler(&mut self, sampler: Handle) {
        self.release("sampler", sampler);
    }

    fn create_render_pass(
        &mut self,
        label: &str,
        attachments: &[AttachmentDescription],
        subpasses: &[SubpassDescription],
    ) -> Result<Handle, BackendError> {
        self.enter("create_render_pass")?;
        self.calls.push(Call::CreateRenderPass {
            label: label.to_string(),
            attachments: attachments.to_vec(),
            subpasses: subpasses.to_vec(),
        });
        Ok(self.handle())
    }

    fn destroy_render_pass(&mut self, pass: Handle) {
        self.release("render_pass", pass);
    }

    fn create_framebuffer(
        &mut self,
        pass: &Handle,
        attachments: &[FramebufferAttachment<'_, Handle>],
        _extent: Extent2d,
    ) -> Result<Handle, BackendError> {
        self.enter("create_framebuffer")?;
        let swap_chain = attachments
            .iter()
            .filter(|a| matches!(a, FramebufferAttachment::SwapChain))
            .count();
        self.calls.push(Call::CreateFramebuffer {
            pass: *pass,
            views: attachments.len(),
            swap_chain,
        });
        Ok(self.handle())
    }

    fn destroy_framebuffer(&mut self, framebuffer: Handle) {
        self.release("framebuffer", framebuffer);
    }

    fn create_shader_module(
        &mut self,
        label: &str,
        stage: ShaderStage,
        _source: &str,
    ) -> Result<Handle, BackendError> {
        self.enter("create_shader_module")?;
        self.calls.push(Call::CreateShaderModule {
            label: label.to_string(),
            stage,
        });
        Ok(self.handle())
    }

    fn destroy_shader_module(&mut self, module: Handle) {
        self.release("shader_module", module);
    }

    fn create_graphics_pipeline(
        &mut self,
        desc: &GraphicsPipelineDesc<'_, Self>,
    ) -> Result<Handle, BackendError> {
        self.enter("create_graphics_pipeline")?;
        self.calls.push(Call::CreatePipeline {
            label: desc.label.to_string(),
            topology: desc.state.input_assembly.topology,
            cull_mode: desc.state.rasterization.cull_mode,
            depth_test: desc.state.depth_stencil.depth_test,
            color_attachments: desc.state.color_blend.attachments.len(),
            texture_formats: desc.texture_formats.to_vec(),
            stages: desc.stages.iter().map(|s| s.stage).collect(),
        });
        Ok(self.handle())
    }

    fn destroy_pipeline(&mut self, pipeline: Handle) {
        self.release("pipeline", pipeline);
    }

    fn create_buffer(
        &mut self,
        label: &str,
        _usage: BufferUsage,
        contents: &[u8],
    ) -> Result<Handle, BackendError> {
        self.enter("create_buffer")?;
        self.calls.push(Call::CreateBuffer {
            label: label.to_string(),
            size: contents.len(),
        });
        Ok(self.handle())
    }

    fn write_buffer(&mut self, buffer: &Handle, _offset: u64, data: &[u8]) {
        self.calls.push(Call::WriteBuffer {
            buffer: *buffer,
            size: data.len(),
        });
    }

    fn destroy_buffer(&mut self, buffer: Handle) {
        self.release("buffer", buffer);
    }

    fn write_descriptors(
        &mut self,
        pipeline: &Handle,
        textures: &[TextureBinding<'_, Self>],
    ) -> Result<Handle, BackendError> {
        self.enter("write_descriptors")?;
        self.calls.push(Call::WriteDescriptors {
            pipeline: *pipeline,
            textures: textures.len(),
        });
        Ok(self.handle())
    }

    fn destroy_bind_group(&mut self, group: Handle) {
        self.release("bind_group", group);
    }

    fn record_pass(
        &mut self,
        slot: CommandSlot,
        pass: &RecordPass<'_, Self>,
    ) -> Result<(), BackendError> {
        self.enter("record_pass")?;
        self.calls.push(Call::RecordPass {
            slot,
            label: pass.label.to_string(),
            clears: pass.clears.to_vec(),
            draws: pass.draws.len(),
            extent: pass.extent,
        });
        Ok(())
    }

    fn begin_frame(&mut self, frame_in_flight: usize) -> Result<(), BackendError> {
        self.enter("begin_frame")?;
        self.calls.push(Call::BeginFrame(frame_in_flight));
        Ok(())
    }

    fn end_frame(&mut self, slots: &[CommandSlot]) -> Result<(), BackendError> {
        self.enter("end_frame")?;
        self.calls.push(Call::EndFrame(slots.to_vec()));
        Ok(())
    }

    fn wait_idle(&mut self) {
        self.calls.push(Call::WaitIdle);
    }

    fn resize(&mut self, extent: Extent2d) -> Result<(), BackendError> {
        self.enter("resize")?;
        self.extent = extent.clamped();
        self.calls.push(Call::Resize(extent));
        Ok(())
    }
}

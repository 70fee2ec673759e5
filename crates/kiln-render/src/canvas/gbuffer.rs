//! Deferred G-buffer canvas.
//!
//! The geometry pass writes position, normal and albedo into three colour
//! targets plus depth. The lighting pass then draws a full-screen quad that
//! samples those four images into the swap-chain image.

use kiln_assets::AssetStore;

use crate::backend::{
    AttachmentDescription, AttachmentReference, ClearValue, Extent2d, FramebufferAttachment,
    GpuBackend, ImageLayout, RecordPass, SubpassDescription, TextureBinding, TextureFormat,
};
use crate::draw::{DrawInstanceGroup, ShaderDataBase, ShaderDraw};
use crate::mesh::MeshCache;
use crate::pipeline::{build_pipeline, gbuffer_pipeline_state, lighting_pipeline_state};
use crate::render_pass::{AttachmentSource, CompiledRenderPass, RenderPass};
use crate::shader::{PipelineBuild, Shader, ShaderCache, ShaderId};
use crate::texture::{ASSET_TEXTURE_FORMAT, GpuImage};

use super::{Canvas, CanvasError, FrameContext};

/// Canvas id drawings use to target the G-buffer.
pub const GBUFFER_CANVAS: &str = "gbuffer";

pub const GEOMETRY_PASS: &str = "geometry";
pub const LIGHTING_PASS: &str = "lighting";

pub const POSITION_FORMAT: TextureFormat = TextureFormat::Rgba32Float;
pub const NORMAL_FORMAT: TextureFormat = TextureFormat::Rgba16Float;
pub const ALBEDO_FORMAT: TextureFormat = TextureFormat::Rgba8Unorm;

/// Three opaque black colour clears then depth 1.0, stencil 0. The lighting
/// pass is begun with the same array and only uses the first entry.
const CLEARS: [ClearValue; 4] = [
    ClearValue::OPAQUE_BLACK,
    ClearValue::OPAQUE_BLACK,
    ClearValue::OPAQUE_BLACK,
    ClearValue::FAR_DEPTH,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanvasState {
    Uninitialized,
    ImagesCreated,
    PassesCreated,
    Ready,
    Destroyed,
}

pub struct GBufferCanvas<B: GpuBackend> {
    state: CanvasState,
    lighting_shader_path: String,
    position: Option<GpuImage<B>>,
    normal: Option<GpuImage<B>>,
    albedo: Option<GpuImage<B>>,
    depth: Option<GpuImage<B>>,
    geometry_pass: Option<RenderPass<B>>,
    lighting_pass: Option<RenderPass<B>>,
    lighting_shader: Option<ShaderId>,
    quad: Option<DrawInstanceGroup<B>>,
}

impl<B: GpuBackend> GBufferCanvas<B> {
    /// A canvas that lights with the shader defined at `lighting_shader`.
    pub fn new(lighting_shader: impl Into<String>) -> Self {
        Self {
            state: CanvasState::Uninitialized,
            lighting_shader_path: lighting_shader.into(),
            position: None,
            normal: None,
            albedo: None,
            depth: None,
            geometry_pass: None,
            lighting_pass: None,
            lighting_shader: None,
            quad: None,
        }
    }

    pub fn state(&self) -> CanvasState {
        self.state
    }

    pub fn lighting_shader(&self) -> Option<ShaderId> {
        self.lighting_shader
    }

    /// Position, normal, albedo and depth, in binding order.
    pub fn images(&self) -> [Option<&GpuImage<B>>; 4] {
        [
            self.position.as_ref(),
            self.normal.as_ref(),
            self.albedo.as_ref(),
            self.depth.as_ref(),
        ]
    }

    fn create_images(&mut self, backend: &mut B) -> Result<(), CanvasError> {
        let extent = backend.swap_chain_extent();
        let depth_format = backend.find_depth_format();
        let targets = [
            (&mut self.position, "gbuffer-position", POSITION_FORMAT),
            (&mut self.normal, "gbuffer-normal", NORMAL_FORMAT),
            (&mut self.albedo, "gbuffer-albedo", ALBEDO_FORMAT),
            (&mut self.depth, "gbuffer-depth", depth_format),
        ];

        for (slot, label, format) in targets {
            let image = GpuImage::attachment(backend, label, format, extent).map_err(|err| {
                log::error!("Failed to create {label} image: {err}");
                CanvasError::DeferredResources
            })?;
            let layout = if format.is_depth() {
                ImageLayout::DepthStencilAttachmentOptimal
            } else {
                ImageLayout::ColorAttachmentOptimal
            };
            let transitioned = backend.transition_image_layout(&image.image, layout, image.aspect());
            *slot = Some(image);
            if let Err(err) = transitioned {
                log::error!("Failed to transition {label} image: {err}");
                return Err(CanvasError::DeferredResources);
            }
        }
        Ok(())
    }

    fn create_passes(&mut self, backend: &mut B) -> Result<(), CanvasError> {
        let (Some(position), Some(normal), Some(albedo), Some(depth)) =
            (&self.position, &self.normal, &self.albedo, &self.depth)
        else {
            return Err(CanvasError::DeferredResources);
        };
        let extent = position.extent;

        let geometry = geometry_pass_layout(depth.format);
        let views = [
            FramebufferAttachment::View(&position.view),
            FramebufferAttachment::View(&normal.view),
            FramebufferAttachment::View(&albedo.view),
            FramebufferAttachment::View(&depth.view),
        ];
        let geometry_pass = geometry
            .construct_with(backend, &views, extent)
            .map_err(|_| CanvasError::DeferredResources)?;
        self.geometry_pass = Some(geometry_pass);

        self.create_lighting_pass(backend, extent)
    }

    fn create_lighting_pass(&mut self, backend: &mut B, extent: Extent2d) -> Result<(), CanvasError> {
        let lighting = lighting_pass_layout(backend.swap_chain_format());
        let pass = lighting
            .construct_with(backend, &[FramebufferAttachment::SwapChain], extent)
            .map_err(|_| CanvasError::DeferredResources)?;
        self.lighting_pass = Some(pass);
        Ok(())
    }

    fn release_images(&mut self, backend: &mut B) {
        for image in [
            self.position.take(),
            self.normal.take(),
            self.albedo.take(),
            self.depth.take(),
        ]
        .into_iter()
        .flatten()
        {
            image.destroy(backend);
        }
    }

    fn record_lighting(&mut self, frame: &mut FrameContext<'_, B>) -> Result<(), CanvasError> {
        let shaders = frame.shaders;
        let pipeline = self
            .lighting_shader
            .and_then(|id| shaders.get(id))
            .and_then(Shader::pipeline);

        if let (Some(pipeline), Some(quad)) = (pipeline, self.quad.as_mut())
            && !quad.is_bound()
        {
            if let [Some(position), Some(normal), Some(albedo), Some(depth)] = [
                self.position.as_ref(),
                self.normal.as_ref(),
                self.albedo.as_ref(),
                self.depth.as_ref(),
            ] {
                let bindings: [TextureBinding<'_, B>; 4] =
                    [position, normal, albedo, depth].map(|image| TextureBinding {
                    view: &image.view,
                    sampler: &image.sampler,
                });
                quad.prepare(frame.backend)?;
                quad.bind_with(frame.backend, pipeline, &bindings)?;
            }
        }

        let draw = match (pipeline, self.quad.as_ref()) {
            (Some(pipeline), Some(quad)) => quad.draw_command(pipeline, frame.meshes),
            _ => None,
        };
        let Some(pass) = self.lighting_pass.as_ref() else {
            return Err(CanvasError::InvalidState {
                state: self.state,
                expected: CanvasState::Ready,
            });
        };

        let slot = frame.commands.next_slot()?;
        let draws: Vec<_> = draw.into_iter().collect();
        frame.backend.record_pass(
            slot,
            &RecordPass {
                label: "gbuffer-lighting",
                render_pass: pass.handle(),
                framebuffer: pass.framebuffer(),
                extent: pass.extent(),
                clears: &CLEARS,
                draws: &draws,
            },
        )?;
        Ok(())
    }
}

fn geometry_pass_layout(depth_format: TextureFormat) -> CompiledRenderPass {
    let color = |format| {
        AttachmentDescription::cleared(
            format,
            ImageLayout::ColorAttachmentOptimal,
            ImageLayout::ColorAttachmentOptimal,
        )
    };
    let color_ref = |attachment| AttachmentReference {
        attachment,
        layout: ImageLayout::ColorAttachmentOptimal,
    };
    CompiledRenderPass {
        name: "gbuffer-geometry".to_string(),
        attachments: vec![
            color(POSITION_FORMAT),
            color(NORMAL_FORMAT),
            color(ALBEDO_FORMAT),
            AttachmentDescription::cleared(
                depth_format,
                ImageLayout::DepthStencilAttachmentOptimal,
                ImageLayout::DepthStencilAttachmentOptimal,
            ),
        ],
        sources: vec![AttachmentSource::Owned; 4],
        subpasses: vec![SubpassDescription {
            color_attachments: vec![color_ref(0), color_ref(1), color_ref(2)],
            depth_stencil_attachment: Some(AttachmentReference {
                attachment: 3,
                layout: ImageLayout::DepthStencilAttachmentOptimal,
            }),
        }],
    }
}

fn lighting_pass_layout(swap_chain_format: TextureFormat) -> CompiledRenderPass {
    CompiledRenderPass {
        name: "gbuffer-lighting".to_string(),
        attachments: vec![AttachmentDescription::cleared(
            swap_chain_format,
            ImageLayout::Undefined,
            ImageLayout::PresentSrc,
        )],
        sources: vec![AttachmentSource::SwapChain],
        subpasses: vec![SubpassDescription {
            color_attachments: vec![AttachmentReference {
                attachment: 0,
                layout: ImageLayout::ColorAttachmentOptimal,
            }],
            depth_stencil_attachment: None,
        }],
    }
}

impl<B: GpuBackend> Canvas<B> for GBufferCanvas<B> {
    fn create(&mut self, backend: &mut B) -> Result<(), CanvasError> {
        if !matches!(self.state, CanvasState::Uninitialized | CanvasState::Destroyed) {
            return Err(CanvasError::InvalidState {
                state: self.state,
                expected: CanvasState::Uninitialized,
            });
        }
        // Left over from a create that failed partway.
        self.release_images(backend);
        self.create_images(backend)?;
        self.state = CanvasState::ImagesCreated;
        self.create_passes(backend)?;
        self.state = CanvasState::PassesCreated;
        log::debug!("Created G-buffer at {:?}", backend.swap_chain_extent());
        Ok(())
    }

    fn initialize(
        &mut self,
        shaders: &mut ShaderCache<B>,
        meshes: &mut MeshCache<B>,
        assets: &dyn AssetStore,
    ) -> Result<(), CanvasError> {
        if self.state != CanvasState::PassesCreated {
            return Err(CanvasError::InvalidState {
                state: self.state,
                expected: CanvasState::PassesCreated,
            });
        }
        self.lighting_shader = Some(shaders.shader(assets, &self.lighting_shader_path)?);
        if self.quad.is_none() {
            let mut quad = DrawInstanceGroup::new(meshes.quad(), Vec::new());
            quad.push(ShaderDataBase::default().instance_data());
            self.quad = Some(quad);
        }
        self.state = CanvasState::Ready;
        Ok(())
    }

    fn draw(
        &mut self,
        frame: &mut FrameContext<'_, B>,
        drawings: &mut [ShaderDraw<B>],
    ) -> Result<(), CanvasError> {
        if self.state != CanvasState::Ready {
            return Err(CanvasError::InvalidState {
                state: self.state,
                expected: CanvasState::Ready,
            });
        }
        let Some(geometry) = self.geometry_pass.as_ref() else {
            return Err(CanvasError::DeferredResources);
        };

        let (shaders, textures, meshes) = (frame.shaders, frame.textures, frame.meshes);
        let slot = frame.commands.next_slot()?;
        for draw in drawings.iter_mut() {
            draw.bind(frame.backend, shaders, textures)?;
        }
        let draws: Vec<_> = drawings
            .iter()
            .flat_map(|draw| draw.draw_commands(shaders, meshes))
            .collect();
        frame.backend.record_pass(
            slot,
            &RecordPass {
                label: "gbuffer-geometry",
                render_pass: geometry.handle(),
                framebuffer: geometry.framebuffer(),
                extent: geometry.extent(),
                clears: &CLEARS,
                draws: &draws,
            },
        )?;

        self.record_lighting(frame)
    }

    fn pass(&self, name: &str) -> Option<&RenderPass<B>> {
        match name {
            GEOMETRY_PASS => self.geometry_pass.as_ref(),
            LIGHTING_PASS => self.lighting_pass.as_ref(),
            _ => None,
        }
    }

    fn color(&self) -> Option<&GpuImage<B>> {
        self.albedo.as_ref()
    }

    fn create_pipeline(&self, backend: &mut B, shader: &Shader<B>) -> PipelineBuild<B> {
        let definition = shader.definition();
        let pass_name = definition.pass.as_deref().unwrap_or(GEOMETRY_PASS);
        let Some(pass) = self.pass(pass_name) else {
            return PipelineBuild::NotReady;
        };

        let (state, formats) = if pass_name == LIGHTING_PASS {
            let formats: Option<Vec<TextureFormat>> = self
                .images()
                .into_iter()
                .map(|image| image.map(|i| i.format))
                .collect();
            let Some(formats) = formats else {
                return PipelineBuild::NotReady;
            };
            (lighting_pipeline_state(), formats)
        } else {
            (
                gbuffer_pipeline_state(definition),
                vec![ASSET_TEXTURE_FORMAT; definition.textures as usize],
            )
        };

        match build_pipeline(backend, shader, &state, pass, &formats) {
            Ok(pipeline) => PipelineBuild::Built(pipeline),
            Err(err) => PipelineBuild::Failed(err),
        }
    }

    fn resize(&mut self, backend: &mut B) -> Result<(), CanvasError> {
        if matches!(self.state, CanvasState::Uninitialized | CanvasState::Destroyed) {
            return Ok(());
        }
        let initialized = self.lighting_shader.is_some();
        backend.wait_idle();
        self.destroy_swap_chain_resources(backend);
        if let Some(pass) = self.geometry_pass.take() {
            pass.destroy(backend);
        }
        self.release_images(backend);
        if let Some(quad) = self.quad.as_mut() {
            quad.unbind(backend);
        }

        self.state = CanvasState::Uninitialized;
        self.create(backend)?;
        if initialized {
            self.state = CanvasState::Ready;
        }
        Ok(())
    }

    fn destroy(&mut self, backend: &mut B) {
        if self.state == CanvasState::Destroyed {
            return;
        }
        backend.wait_idle();
        if let Some(pass) = self.geometry_pass.take() {
            pass.destroy(backend);
        }
        self.release_images(backend);
        if let Some(quad) = self.quad.take() {
            quad.destroy(backend);
        }
        self.lighting_shader = None;
        self.state = CanvasState::Destroyed;
    }

    fn destroy_swap_chain_resources(&mut self, backend: &mut B) {
        if let Some(pass) = self.lighting_pass.take() {
            pass.destroy(backend);
        }
    }
}

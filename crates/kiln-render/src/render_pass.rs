//! Render-pass compilation, construction and the render-pass cache.

use rustc_hash::FxHashMap;

use crate::backend::{
    AttachmentDescription, AttachmentReference, BackendError, Extent2d, FramebufferAttachment,
    GpuBackend, SubpassDescription, TextureFormat,
};
use crate::definition::{FormatSpec, RenderPassDefinition};
use crate::texture::GpuImage;

/// Errors raised while validating or constructing a render pass.
#[derive(Debug, thiserror::Error)]
pub enum RenderPassError {
    #[error("render pass {pass} has no subpasses")]
    NoSubpasses { pass: String },

    #[error("render pass {pass} has no attachments")]
    NoAttachments { pass: String },

    #[error(
        "render pass {pass} subpass {subpass} references attachment {attachment} but only {count} exist"
    )]
    AttachmentOutOfRange {
        pass: String,
        subpass: usize,
        attachment: u32,
        count: usize,
    },

    #[error("render pass {pass} uses depth format {format:?} as color attachment {attachment}")]
    NotColorFormat {
        pass: String,
        attachment: u32,
        format: TextureFormat,
    },

    #[error("render pass {pass} uses color format {format:?} as depth attachment {attachment}")]
    NotDepthFormat {
        pass: String,
        attachment: u32,
        format: TextureFormat,
    },

    #[error("render pass {pass} subpass {subpass} references attachment {attachment} twice")]
    DuplicateReference {
        pass: String,
        subpass: usize,
        attachment: u32,
    },

    #[error("render pass {pass} expects {expected} framebuffer attachments, got {actual}")]
    FramebufferMismatch {
        pass: String,
        expected: usize,
        actual: usize,
    },

    #[error("backend failed to construct render pass {pass}: {source}")]
    Backend {
        pass: String,
        #[source]
        source: BackendError,
    },
}

/// Where a framebuffer attachment's image comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentSource {
    /// The pass allocates and owns an image for the attachment.
    Owned,
    /// The attachment is the swap-chain image of the frame being recorded.
    SwapChain,
}

/// A render pass with every format resolved, ready for construction.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledRenderPass {
    pub name: String,
    pub attachments: Vec<AttachmentDescription>,
    pub sources: Vec<AttachmentSource>,
    pub subpasses: Vec<SubpassDescription>,
}

impl RenderPassDefinition {
    /// Resolve `Swapchain` and `Depth` formats against `backend`.
    pub fn compile<B: GpuBackend>(&self, backend: &B) -> CompiledRenderPass {
        let mut attachments = Vec::with_capacity(self.attachments.len());
        let mut sources = Vec::with_capacity(self.attachments.len());
        for def in &self.attachments {
            let (format, source) = match def.format {
                FormatSpec::Swapchain => (backend.swap_chain_format(), AttachmentSource::SwapChain),
                FormatSpec::Depth => (backend.find_depth_format(), AttachmentSource::Owned),
                FormatSpec::Concrete(format) => (format, AttachmentSource::Owned),
            };
            attachments.push(AttachmentDescription {
                format,
                samples: def.samples.max(1),
                load_op: def.load_op,
                store_op: def.store_op,
                stencil_load_op: def.stencil_load_op,
                stencil_store_op: def.stencil_store_op,
                initial_layout: def.initial_layout,
                final_layout: def.final_layout,
            });
            sources.push(source);
        }

        let subpasses = self
            .subpasses
            .iter()
            .map(|sub| SubpassDescription {
                color_attachments: sub
                    .color_attachments
                    .iter()
                    .map(|r| AttachmentReference {
                        attachment: r.attachment,
                        layout: r.layout,
                    })
                    .collect(),
                depth_stencil_attachment: sub.depth_stencil_attachment.map(|r| {
                    AttachmentReference {
                        attachment: r.attachment,
                        layout: r.layout,
                    }
                }),
            })
            .collect();

        CompiledRenderPass {
            name: self.name.clone(),
            attachments,
            sources,
            subpasses,
        }
    }
}

impl CompiledRenderPass {
    /// Check that every subpass references existing attachments of the right
    /// kind, at most once each.
    pub fn validate(&self) -> Result<(), RenderPassError> {
        let pass = || self.name.clone();
        if self.attachments.is_empty() {
            return Err(RenderPassError::NoAttachments { pass: pass() });
        }
        if self.subpasses.is_empty() {
            return Err(RenderPassError::NoSubpasses { pass: pass() });
        }

        let count = self.attachments.len();
        for (index, subpass) in self.subpasses.iter().enumerate() {
            let mut seen = Vec::with_capacity(subpass.color_attachments.len() + 1);
            let refs = subpass
                .color_attachments
                .iter()
                .map(|r| (r, false))
                .chain(subpass.depth_stencil_attachment.iter().map(|r| (r, true)));

            for (reference, is_depth) in refs {
                let attachment = reference.attachment;
                let Some(desc) = self.attachments.get(attachment as usize) else {
                    return Err(RenderPassError::AttachmentOutOfRange {
                        pass: pass(),
                        subpass: index,
                        attachment,
                        count,
                    });
                };
                if seen.contains(&attachment) {
                    return Err(RenderPassError::DuplicateReference {
                        pass: pass(),
                        subpass: index,
                        attachment,
                    });
                }
                seen.push(attachment);

                match (is_depth, desc.format.is_depth()) {
                    (false, true) => {
                        return Err(RenderPassError::NotColorFormat {
                            pass: pass(),
                            attachment,
                            format: desc.format,
                        });
                    }
                    (true, false) => {
                        return Err(RenderPassError::NotDepthFormat {
                            pass: pass(),
                            attachment,
                            format: desc.format,
                        });
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }

    /// Construct the pass, allocating an image for every owned attachment and
    /// a framebuffer at the swap-chain extent. Failures are logged and
    /// nothing is leaked.
    pub fn construct<B: GpuBackend>(
        &self,
        backend: &mut B,
    ) -> Result<RenderPass<B>, RenderPassError> {
        self.validate().inspect_err(|err| log::error!("{err}"))?;

        let extent = backend.swap_chain_extent();
        let mut images = Vec::new();
        for (index, (desc, source)) in self.attachments.iter().zip(&self.sources).enumerate() {
            if *source == AttachmentSource::SwapChain {
                continue;
            }
            let label = format!("{}-attachment-{index}", self.name);
            match GpuImage::attachment(backend, &label, desc.format, extent) {
                Ok(image) => images.push(image),
                Err(source) => {
                    for image in images {
                        image.destroy(backend);
                    }
                    return Err(self.backend_failure(source));
                }
            }
        }

        let mut owned = images.iter();
        let views: Vec<FramebufferAttachment<'_, B::ImageView>> = self
            .sources
            .iter()
            .filter_map(|source| match source {
                AttachmentSource::SwapChain => Some(FramebufferAttachment::SwapChain),
                AttachmentSource::Owned => owned.next().map(|img| FramebufferAttachment::View(&img.view)),
            })
            .collect();

        let built = self.build(backend, &views, extent);
        drop(views);
        match built {
            Ok((handle, framebuffer)) => Ok(RenderPass {
                name: self.name.clone(),
                handle,
                framebuffer,
                attachments: self.attachments.clone(),
                subpasses: self.subpasses.clone(),
                images,
                extent,
            }),
            Err(err) => {
                for image in images {
                    image.destroy(backend);
                }
                Err(err)
            }
        }
    }

    /// Construct the pass over caller-owned views. The returned pass owns no
    /// images.
    pub fn construct_with<B: GpuBackend>(
        &self,
        backend: &mut B,
        views: &[FramebufferAttachment<'_, B::ImageView>],
        extent: Extent2d,
    ) -> Result<RenderPass<B>, RenderPassError> {
        self.validate().inspect_err(|err| log::error!("{err}"))?;
        if views.len() != self.attachments.len() {
            let err = RenderPassError::FramebufferMismatch {
                pass: self.name.clone(),
                expected: self.attachments.len(),
                actual: views.len(),
            };
            log::error!("{err}");
            return Err(err);
        }

        let (handle, framebuffer) = self.build(backend, views, extent)?;
        Ok(RenderPass {
            name: self.name.clone(),
            handle,
            framebuffer,
            attachments: self.attachments.clone(),
            subpasses: self.subpasses.clone(),
            images: Vec::new(),
            extent,
        })
    }

    fn build<B: GpuBackend>(
        &self,
        backend: &mut B,
        views: &[FramebufferAttachment<'_, B::ImageView>],
        extent: Extent2d,
    ) -> Result<(B::RenderPass, B::Framebuffer), RenderPassError> {
        let handle = backend
            .create_render_pass(&self.name, &self.attachments, &self.subpasses)
            .map_err(|source| self.backend_failure(source))?;
        match backend.create_framebuffer(&handle, views, extent) {
            Ok(framebuffer) => Ok((handle, framebuffer)),
            Err(source) => {
                backend.destroy_render_pass(handle);
                Err(self.backend_failure(source))
            }
        }
    }

    fn backend_failure(&self, source: BackendError) -> RenderPassError {
        let err = RenderPassError::Backend {
            pass: self.name.clone(),
            source,
        };
        log::error!("{err}");
        err
    }
}

/// A constructed render pass with its framebuffer and any images it owns.
pub struct RenderPass<B: GpuBackend> {
    name: String,
    handle: B::RenderPass,
    framebuffer: B::Framebuffer,
    attachments: Vec<AttachmentDescription>,
    subpasses: Vec<SubpassDescription>,
    images: Vec<GpuImage<B>>,
    extent: Extent2d,
}

impl<B: GpuBackend> RenderPass<B> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handle(&self) -> &B::RenderPass {
        &self.handle
    }

    pub fn framebuffer(&self) -> &B::Framebuffer {
        &self.framebuffer
    }

    pub fn extent(&self) -> Extent2d {
        self.extent
    }

    pub fn attachments(&self) -> &[AttachmentDescription] {
        &self.attachments
    }

    /// Images owned by this pass, in attachment order, skipping swap-chain slots.
    pub fn images(&self) -> &[GpuImage<B>] {
        &self.images
    }

    pub fn color_attachment_count(&self, subpass: usize) -> usize {
        self.subpasses
            .get(subpass)
            .map_or(0, |s| s.color_attachments.len())
    }

    pub fn has_depth(&self, subpass: usize) -> bool {
        self.subpasses
            .get(subpass)
            .is_some_and(|s| s.depth_stencil_attachment.is_some())
    }

    pub fn destroy(self, backend: &mut B) {
        backend.destroy_framebuffer(self.framebuffer);
        backend.destroy_render_pass(self.handle);
        for image in self.images {
            image.destroy(backend);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RenderPassId(usize);

/// Constructed render passes keyed by name.
pub struct RenderPassCache<B: GpuBackend> {
    passes: Vec<RenderPass<B>>,
    by_name: FxHashMap<String, RenderPassId>,
}

impl<B: GpuBackend> Default for RenderPassCache<B> {
    fn default() -> Self {
        Self {
            passes: Vec::new(),
            by_name: FxHashMap::default(),
        }
    }
}

impl<B: GpuBackend> RenderPassCache<B> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find(&self, name: &str) -> Option<RenderPassId> {
        self.by_name.get(name).copied()
    }

    pub fn get(&self, id: RenderPassId) -> Option<&RenderPass<B>> {
        self.passes.get(id.0)
    }

    /// Insert `pass` under its name. An existing pass of the same name is
    /// kept and `pass` is destroyed.
    pub fn insert(&mut self, backend: &mut B, pass: RenderPass<B>) -> RenderPassId {
        if let Some(id) = self.find(pass.name()) {
            log::warn!("Render pass {} already cached, discarding duplicate", pass.name());
            pass.destroy(backend);
            return id;
        }
        let id = RenderPassId(self.passes.len());
        self.by_name.insert(pass.name().to_string(), id);
        self.passes.push(pass);
        id
    }

    /// Cached pass for `def.name`, compiling and constructing it on a miss.
    pub fn get_or_construct(
        &mut self,
        backend: &mut B,
        def: &RenderPassDefinition,
    ) -> Result<RenderPassId, RenderPassError> {
        if let Some(id) = self.find(&def.name) {
            return Ok(id);
        }
        let pass = def.compile(backend).construct(backend)?;
        Ok(self.insert(backend, pass))
    }

    pub fn len(&self) -> usize {
        self.passes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passes.is_empty()
    }

    pub fn destroy(&mut self, backend: &mut B) {
        for pass in self.passes.drain(..) {
            pass.destroy(backend);
        }
        self.by_name.clear();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::backend::recording::{Call, RecordingBackend};
    use crate::backend::{ImageLayout, ImageUsage};

    pub(crate) fn forward_pass_json() -> &'static str {
        r#"{
            "Name": "forward",
            "Attachments": [
                { "Format": "Rgba16Float", "FinalLayout": "ShaderReadOnlyOptimal" },
                { "Format": "Depth", "FinalLayout": "DepthStencilAttachmentOptimal" }
            ],
            "Subpasses": [{
                "ColorAttachments": [{ "Attachment": 0, "Layout": "ColorAttachmentOptimal" }],
                "DepthStencilAttachment": { "Attachment": 1, "Layout": "DepthStencilAttachmentOptimal" }
            }]
        }"#
    }

    fn definition(json: &str) -> RenderPassDefinition {
        serde_json::from_str(json).unwrap()
    }

    fn color_ref(attachment: u32) -> AttachmentReference {
        AttachmentReference {
            attachment,
            layout: ImageLayout::ColorAttachmentOptimal,
        }
    }

    fn compiled(formats: &[TextureFormat], subpasses: Vec<SubpassDescription>) -> CompiledRenderPass {
        CompiledRenderPass {
            name: "test".to_string(),
            attachments: formats
                .iter()
                .map(|f| {
                    AttachmentDescription::cleared(
                        *f,
                        ImageLayout::Undefined,
                        ImageLayout::ColorAttachmentOptimal,
                    )
                })
                .collect(),
            sources: vec![AttachmentSource::Owned; formats.len()],
            subpasses,
        }
    }

    #[test]
    fn test_compile_resolves_formats() {
        let mut backend = RecordingBackend::new();
        backend.depth_format = TextureFormat::Depth24PlusStencil8;
        let json = r#"{
            "Name": "present",
            "Attachments": [{ "Format": "Swapchain" }, { "Format": "Depth" }],
            "Subpasses": [{ "ColorAttachments": [{ "Attachment": 0 }], "DepthStencilAttachment": { "Attachment": 1 } }]
        }"#;
        let pass = definition(json).compile(&backend);
        assert_eq!(pass.attachments[0].format, TextureFormat::Bgra8UnormSrgb);
        assert_eq!(pass.attachments[1].format, TextureFormat::Depth24PlusStencil8);
        assert_eq!(
            pass.sources,
            vec![AttachmentSource::SwapChain, AttachmentSource::Owned]
        );
    }

    #[test]
    fn test_validate_rejects_missing_subpass() {
        let pass = compiled(&[TextureFormat::Rgba8Unorm], vec![]);
        assert!(matches!(pass.validate(), Err(RenderPassError::NoSubpasses { .. })));
    }

    #[test]
    fn test_validate_rejects_out_of_range_reference() {
        let pass = compiled(
            &[TextureFormat::Rgba8Unorm],
            vec![SubpassDescription {
                color_attachments: vec![color_ref(2)],
                depth_stencil_attachment: None,
            }],
        );
        assert!(matches!(
            pass.validate(),
            Err(RenderPassError::AttachmentOutOfRange {
                attachment: 2,
                count: 1,
                ..
            })
        ));
    }

    #[test]
    fn test_validate_rejects_depth_as_color() {
        let pass = compiled(
            &[TextureFormat::Depth32Float],
            vec![SubpassDescription {
                color_attachments: vec![color_ref(0)],
                depth_stencil_attachment: None,
            }],
        );
        assert!(matches!(pass.validate(), Err(RenderPassError::NotColorFormat { .. })));
    }

    #[test]
    fn test_validate_rejects_color_as_depth() {
        let pass = compiled(
            &[TextureFormat::Rgba8Unorm],
            vec![SubpassDescription {
                color_attachments: vec![],
                depth_stencil_attachment: Some(color_ref(0)),
            }],
        );
        assert!(matches!(pass.validate(), Err(RenderPassError::NotDepthFormat { .. })));
    }

    #[test]
    fn test_validate_rejects_duplicate_reference() {
        let pass = compiled(
            &[TextureFormat::Rgba8Unorm],
            vec![SubpassDescription {
                color_attachments: vec![color_ref(0), color_ref(0)],
                depth_stencil_attachment: None,
            }],
        );
        assert!(matches!(
            pass.validate(),
            Err(RenderPassError::DuplicateReference { attachment: 0, .. })
        ));
    }

    #[test]
    fn test_construct_allocates_owned_images() {
        let mut backend = RecordingBackend::new();
        let pass = definition(forward_pass_json())
            .compile(&backend)
            .construct(&mut backend)
            .unwrap();

        assert_eq!(pass.images().len(), 2);
        assert_eq!(pass.extent(), backend.extent);
        assert_eq!(pass.color_attachment_count(0), 1);
        assert!(pass.has_depth(0));
        let images = backend.created_images();
        assert!(images[0].2.contains(ImageUsage::COLOR_ATTACHMENT));
        assert!(images[1].2.contains(ImageUsage::DEPTH_STENCIL_ATTACHMENT));
        assert!(backend.calls.iter().any(|c| matches!(
            c,
            Call::CreateFramebuffer {
                views: 2,
                swap_chain: 0,
                ..
            }
        )));

        pass.destroy(&mut backend);
        assert_eq!(backend.live_handles(), 0);
    }

    #[test]
    fn test_construct_failure_leaks_nothing() {
        let mut backend = RecordingBackend::new();
        backend.fail_always("create_framebuffer");
        let result = definition(forward_pass_json())
            .compile(&backend)
            .construct(&mut backend);
        assert!(matches!(result, Err(RenderPassError::Backend { .. })));
        assert_eq!(backend.live_handles(), 0);
    }

    #[test]
    fn test_construct_with_checks_view_count() {
        let mut backend = RecordingBackend::new();
        let pass = compiled(
            &[TextureFormat::Bgra8UnormSrgb],
            vec![SubpassDescription {
                color_attachments: vec![color_ref(0)],
                depth_stencil_attachment: None,
            }],
        );
        let err = pass
            .construct_with(&mut backend, &[], Extent2d::new(8, 8))
            .err()
            .unwrap();
        assert!(matches!(err, RenderPassError::FramebufferMismatch { expected: 1, actual: 0, .. }));

        let built = pass
            .construct_with(
                &mut backend,
                &[FramebufferAttachment::SwapChain],
                Extent2d::new(8, 8),
            )
            .unwrap();
        assert!(built.images().is_empty());
    }

    #[test]
    fn test_cache_constructs_once_per_name() {
        let mut backend = RecordingBackend::new();
        let mut cache = RenderPassCache::new();
        let def = definition(forward_pass_json());
        let first = cache.get_or_construct(&mut backend, &def).unwrap();
        let second = cache.get_or_construct(&mut backend, &def).unwrap();
        assert_eq!(first, second);
        assert_eq!(backend.count("create_render_pass"), 1);
        assert_eq!(cache.len(), 1);

        cache.destroy(&mut backend);
        assert_eq!(backend.live_handles(), 0);
    }
}

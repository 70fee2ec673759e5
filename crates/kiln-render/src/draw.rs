//! Per-frame draw submission.
//!
//! Drawings are grouped by canvas, then shader, then (mesh, texture set).
//! Each group keeps its instance buffer and bind group across frames; only
//! the instance list is cleared after rendering.

use glam::Mat4;

use crate::backend::{BackendError, BufferUsage, DrawCommand, GpuBackend, TextureBinding};
use crate::material::Material;
use crate::mesh::{InstanceData, MeshCache, MeshId};
use crate::shader::{ShaderCache, ShaderId};
use crate::texture::{TextureCache, TextureId, TextureRef};

/// Per-instance data every shader receives.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShaderDataBase {
    pub model: Mat4,
}

impl Default for ShaderDataBase {
    fn default() -> Self {
        Self {
            model: Mat4::IDENTITY,
        }
    }
}

impl ShaderDataBase {
    pub fn new(model: Mat4) -> Self {
        Self { model }
    }

    pub fn instance_data(&self) -> InstanceData {
        InstanceData {
            model: self.model.to_cols_array_2d(),
        }
    }
}

/// One object to draw this frame.
#[derive(Debug, Clone)]
pub struct Drawing {
    pub canvas: String,
    pub shader: ShaderId,
    pub mesh: MeshId,
    pub textures: Vec<TextureRef>,
    pub shader_data: ShaderDataBase,
}

impl Drawing {
    /// Draw `mesh` with `material`'s shader and textures.
    pub fn from_material(
        canvas: impl Into<String>,
        material: &Material,
        mesh: MeshId,
        shader_data: ShaderDataBase,
    ) -> Self {
        Self {
            canvas: canvas.into(),
            shader: material.shader,
            mesh,
            textures: material.textures.clone(),
            shader_data,
        }
    }
}

/// Instances of one mesh drawn with one texture set.
pub struct DrawInstanceGroup<B: GpuBackend> {
    pub mesh: MeshId,
    pub textures: Vec<TextureId>,
    instances: Vec<InstanceData>,
    instance_buffer: Option<B::Buffer>,
    capacity: usize,
    bind_group: Option<B::BindGroup>,
    bound: bool,
}

impl<B: GpuBackend> DrawInstanceGroup<B> {
    pub fn new(mesh: MeshId, textures: Vec<TextureId>) -> Self {
        Self {
            mesh,
            textures,
            instances: Vec::new(),
            instance_buffer: None,
            capacity: 0,
            bind_group: None,
            bound: false,
        }
    }

    pub fn push(&mut self, data: InstanceData) {
        self.instances.push(data);
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    pub fn is_bound(&self) -> bool {
        self.bound
    }

    /// Upload this frame's instances, growing the buffer when needed.
    pub fn prepare(&mut self, backend: &mut B) -> Result<(), BackendError> {
        if self.instances.is_empty() {
            return Ok(());
        }
        let bytes: &[u8] = bytemuck::cast_slice(&self.instances);
        if let (Some(buffer), true) = (&self.instance_buffer, self.instances.len() <= self.capacity) {
            backend.write_buffer(buffer, 0, bytes);
            return Ok(());
        }

        let capacity = self.instances.len().next_power_of_two();
        let mut contents = vec![0u8; capacity * std::mem::size_of::<InstanceData>()];
        contents[..bytes.len()].copy_from_slice(bytes);
        let buffer = backend.create_buffer(
            "instances",
            BufferUsage::VERTEX | BufferUsage::COPY_DST,
            &contents,
        )?;
        if let Some(old) = self.instance_buffer.replace(buffer) {
            backend.destroy_buffer(old);
        }
        self.capacity = capacity;
        Ok(())
    }

    /// Write the group's descriptors once. Groups without textures need no
    /// bind group.
    pub fn bind_with(
        &mut self,
        backend: &mut B,
        pipeline: &B::Pipeline,
        bindings: &[TextureBinding<'_, B>],
    ) -> Result<(), BackendError> {
        if self.bound {
            return Ok(());
        }
        if !bindings.is_empty() {
            self.bind_group = Some(backend.write_descriptors(pipeline, bindings)?);
        }
        self.bound = true;
        Ok(())
    }

    /// Bind the group's cached textures. Returns `false` while any of them
    /// is still waiting for upload.
    pub fn bind(
        &mut self,
        backend: &mut B,
        pipeline: &B::Pipeline,
        textures: &TextureCache<B>,
    ) -> Result<bool, BackendError> {
        if self.bound {
            return Ok(true);
        }
        let Some(images) = self
            .textures
            .iter()
            .map(|id| textures.get(*id).and_then(|t| t.gpu()))
            .collect::<Option<Vec<_>>>()
        else {
            return Ok(false);
        };
        let bindings: Vec<TextureBinding<'_, B>> = images
            .iter()
            .map(|image| TextureBinding {
                view: &image.view,
                sampler: &image.sampler,
            })
            .collect();
        self.bind_with(backend, pipeline, &bindings)?;
        Ok(true)
    }

    /// The indexed instanced draw for this group, if everything it needs
    /// exists and there is something to draw.
    pub fn draw_command<'a>(
        &'a self,
        pipeline: &'a B::Pipeline,
        meshes: &'a MeshCache<B>,
    ) -> Option<DrawCommand<'a, B>> {
        if self.instances.is_empty() || !self.bound {
            return None;
        }
        let mesh = meshes.gpu(self.mesh)?;
        Some(DrawCommand {
            pipeline,
            bind_group: self.bind_group.as_ref(),
            vertex_buffer: &mesh.vertex_buffer,
            index_buffer: &mesh.index_buffer,
            index_count: mesh.index_count,
            instance_buffer: self.instance_buffer.as_ref()?,
            instance_count: self.instances.len() as u32,
        })
    }

    /// Drop the bind group so the next `bind` writes fresh descriptors.
    pub fn unbind(&mut self, backend: &mut B) {
        if let Some(group) = self.bind_group.take() {
            backend.destroy_bind_group(group);
        }
        self.bound = false;
    }

    fn clear_instances(&mut self) {
        self.instances.clear();
    }

    pub fn destroy(self, backend: &mut B) {
        if let Some(buffer) = self.instance_buffer {
            backend.destroy_buffer(buffer);
        }
        if let Some(group) = self.bind_group {
            backend.destroy_bind_group(group);
        }
    }
}

/// Every group drawn with one shader.
pub struct ShaderDraw<B: GpuBackend> {
    pub shader: ShaderId,
    pub groups: Vec<DrawInstanceGroup<B>>,
}

impl<B: GpuBackend> ShaderDraw<B> {
    /// Write descriptors for every group whose textures are ready. Does
    /// nothing until the shader's pipeline exists.
    pub fn bind(
        &mut self,
        backend: &mut B,
        shaders: &ShaderCache<B>,
        textures: &TextureCache<B>,
    ) -> Result<(), BackendError> {
        let Some(pipeline) = shaders.get(self.shader).and_then(|s| s.pipeline()) else {
            return Ok(());
        };
        for group in &mut self.groups {
            if group.instance_count() > 0 {
                group.bind(backend, pipeline, textures)?;
            }
        }
        Ok(())
    }

    pub fn draw_commands<'a>(
        &'a self,
        shaders: &'a ShaderCache<B>,
        meshes: &'a MeshCache<B>,
    ) -> Vec<DrawCommand<'a, B>> {
        let Some(pipeline) = shaders.get(self.shader).and_then(|s| s.pipeline()) else {
            return Vec::new();
        };
        self.groups
            .iter()
            .filter_map(|group| group.draw_command(pipeline, meshes))
            .collect()
    }
}

struct CanvasDraws<B: GpuBackend> {
    canvas: String,
    shaders: Vec<ShaderDraw<B>>,
}

/// This frame's drawings plus the persistent per-group GPU state.
pub struct Drawings<B: GpuBackend> {
    canvases: Vec<CanvasDraws<B>>,
}

impl<B: GpuBackend> Default for Drawings<B> {
    fn default() -> Self {
        Self {
            canvases: Vec::new(),
        }
    }
}

impl<B: GpuBackend> Drawings<B> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, drawing: Drawing) {
        let canvas = match self.canvases.iter().position(|c| c.canvas == drawing.canvas) {
            Some(index) => &mut self.canvases[index],
            None => {
                self.canvases.push(CanvasDraws {
                    canvas: drawing.canvas.clone(),
                    shaders: Vec::new(),
                });
                let last = self.canvases.len() - 1;
                &mut self.canvases[last]
            }
        };

        let shader = match canvas.shaders.iter().position(|s| s.shader == drawing.shader) {
            Some(index) => &mut canvas.shaders[index],
            None => {
                canvas.shaders.push(ShaderDraw {
                    shader: drawing.shader,
                    groups: Vec::new(),
                });
                let last = canvas.shaders.len() - 1;
                &mut canvas.shaders[last]
            }
        };

        let textures: Vec<TextureId> = drawing.textures.iter().map(|t| t.id).collect();
        let group = match shader
            .groups
            .iter()
            .position(|g| g.mesh == drawing.mesh && g.textures == textures)
        {
            Some(index) => &mut shader.groups[index],
            None => {
                shader.groups.push(DrawInstanceGroup::new(drawing.mesh, textures));
                let last = shader.groups.len() - 1;
                &mut shader.groups[last]
            }
        };
        group.push(drawing.shader_data.instance_data());
    }

    /// Upload every group's instances. Failures are logged and the group is
    /// skipped this frame.
    pub fn prepare(&mut self, backend: &mut B) {
        for group in self
            .canvases
            .iter_mut()
            .flat_map(|c| c.shaders.iter_mut())
            .flat_map(|s| s.groups.iter_mut())
        {
            if let Err(err) = group.prepare(backend) {
                log::error!("Failed to upload instance data: {err}");
                group.clear_instances();
            }
        }
    }

    /// Canvas ids that received drawings.
    pub fn canvases(&self) -> impl Iterator<Item = &str> {
        self.canvases.iter().map(|c| c.canvas.as_str())
    }

    pub fn canvas_mut(&mut self, canvas: &str) -> Option<&mut [ShaderDraw<B>]> {
        self.canvases
            .iter_mut()
            .find(|c| c.canvas == canvas)
            .map(|c| c.shaders.as_mut_slice())
    }

    pub fn instance_count(&self) -> usize {
        self.canvases
            .iter()
            .flat_map(|c| c.shaders.iter())
            .flat_map(|s| s.groups.iter())
            .map(DrawInstanceGroup::instance_count)
            .sum()
    }

    /// Drop this frame's instances, keeping groups and their buffers.
    pub fn clear_instances(&mut self) {
        for group in self
            .canvases
            .iter_mut()
            .flat_map(|c| c.shaders.iter_mut())
            .flat_map(|s| s.groups.iter_mut())
        {
            group.clear_instances();
        }
    }

    pub fn destroy(&mut self, backend: &mut B) {
        for canvas in self.canvases.drain(..) {
            for shader in canvas.shaders {
                for group in shader.groups {
                    group.destroy(backend);
                }
            }
        }
    }
}

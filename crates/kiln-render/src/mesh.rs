//! Mesh vertex format, vertex layouts and the mesh cache.

use bytemuck::{Pod, Zeroable};
use rustc_hash::FxHashMap;

use crate::backend::{
    BackendError, BufferUsage, GpuBackend, VertexAttribute, VertexFormat, VertexLayout, VertexStep,
};

/// Key of the shared full-screen quad.
pub const QUAD_KEY: &str = "kiln::quad";

/// Vertex with position, normal, UV and colour (48 bytes).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub uv: [f32; 2],
    pub color: [f32; 4],
}

impl Vertex {
    pub const ATTRIBUTES: [VertexAttribute; 4] = [
        VertexAttribute {
            location: 0,
            format: VertexFormat::Float32x3,
            offset: 0,
        },
        VertexAttribute {
            location: 1,
            format: VertexFormat::Float32x3,
            offset: 12,
        },
        VertexAttribute {
            location: 2,
            format: VertexFormat::Float32x2,
            offset: 24,
        },
        VertexAttribute {
            location: 3,
            format: VertexFormat::Float32x4,
            offset: 32,
        },
    ];

    pub const fn layout() -> VertexLayout {
        VertexLayout {
            stride: std::mem::size_of::<Vertex>() as u64,
            step: VertexStep::Vertex,
            attributes: &Self::ATTRIBUTES,
        }
    }
}

/// Per-instance model matrix, one column per location (64 bytes).
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct InstanceData {
    pub model: [[f32; 4]; 4],
}

impl InstanceData {
    pub const ATTRIBUTES: [VertexAttribute; 4] = [
        VertexAttribute {
            location: 4,
            format: VertexFormat::Float32x4,
            offset: 0,
        },
        VertexAttribute {
            location: 5,
            format: VertexFormat::Float32x4,
            offset: 16,
        },
        VertexAttribute {
            location: 6,
            format: VertexFormat::Float32x4,
            offset: 32,
        },
        VertexAttribute {
            location: 7,
            format: VertexFormat::Float32x4,
            offset: 48,
        },
    ];

    pub const fn layout() -> VertexLayout {
        VertexLayout {
            stride: std::mem::size_of::<InstanceData>() as u64,
            step: VertexStep::Instance,
            attributes: &Self::ATTRIBUTES,
        }
    }
}

/// Buffer 0 holds mesh vertices, buffer 1 per-instance data.
pub const VERTEX_LAYOUTS: [VertexLayout; 2] = [Vertex::layout(), InstanceData::layout()];

/// Errors raised when adding a mesh.
#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    #[error("mesh {key} has no vertices or indices")]
    Empty { key: String },

    #[error("mesh {key} index {index} is out of range for {vertex_count} vertices")]
    IndexOutOfRange {
        key: String,
        index: u32,
        vertex_count: usize,
    },
}

/// CPU-side indexed triangle mesh.
#[derive(Debug, Clone, PartialEq)]
pub struct Mesh {
    pub key: String,
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
}

impl Mesh {
    pub fn new(key: impl Into<String>, vertices: Vec<Vertex>, indices: Vec<u32>) -> Self {
        Self {
            key: key.into(),
            vertices,
            indices,
        }
    }

    /// Quad covering normalised device coordinates, UV origin top-left.
    pub fn quad() -> Self {
        let corner = |x: f32, y: f32, u: f32, v: f32| Vertex {
            position: [x, y, 0.0],
            normal: [0.0, 0.0, 1.0],
            uv: [u, v],
            color: [1.0; 4],
        };
        Self::new(
            QUAD_KEY,
            vec![
                corner(-1.0, -1.0, 0.0, 1.0),
                corner(1.0, -1.0, 1.0, 1.0),
                corner(1.0, 1.0, 1.0, 0.0),
                corner(-1.0, 1.0, 0.0, 0.0),
            ],
            vec![0, 1, 2, 2, 3, 0],
        )
    }

    fn validate(&self) -> Result<(), MeshError> {
        if self.vertices.is_empty() || self.indices.is_empty() {
            return Err(MeshError::Empty {
                key: self.key.clone(),
            });
        }
        let vertex_count = self.vertices.len();
        if let Some(&index) = self.indices.iter().find(|&&i| i as usize >= vertex_count) {
            return Err(MeshError::IndexOutOfRange {
                key: self.key.clone(),
                index,
                vertex_count,
            });
        }
        Ok(())
    }
}

/// Vertex and index buffers for one mesh.
pub struct GpuMesh<B: GpuBackend> {
    pub vertex_buffer: B::Buffer,
    pub index_buffer: B::Buffer,
    pub index_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MeshId(usize);

struct MeshEntry<B: GpuBackend> {
    mesh: Mesh,
    gpu: Option<GpuMesh<B>>,
}

/// Meshes keyed by name; buffers are created in [`MeshCache::create_pending`].
pub struct MeshCache<B: GpuBackend> {
    entries: Vec<MeshEntry<B>>,
    by_key: FxHashMap<String, MeshId>,
    pending: Vec<MeshId>,
}

impl<B: GpuBackend> Default for MeshCache<B> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            by_key: FxHashMap::default(),
            pending: Vec::new(),
        }
    }
}

impl<B: GpuBackend> MeshCache<B> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `mesh`, or return the existing entry with the same key.
    pub fn add_mesh(&mut self, mesh: Mesh) -> Result<MeshId, MeshError> {
        if let Some(&id) = self.by_key.get(&mesh.key) {
            return Ok(id);
        }
        mesh.validate()?;
        let id = MeshId(self.entries.len());
        self.by_key.insert(mesh.key.clone(), id);
        self.entries.push(MeshEntry { mesh, gpu: None });
        self.pending.push(id);
        Ok(id)
    }

    pub fn mesh(&self, key: &str) -> Option<MeshId> {
        self.by_key.get(key).copied()
    }

    /// The shared full-screen quad, added on first use.
    pub fn quad(&mut self) -> MeshId {
        if let Some(id) = self.mesh(QUAD_KEY) {
            return id;
        }
        let quad = Mesh::quad();
        let id = MeshId(self.entries.len());
        self.by_key.insert(quad.key.clone(), id);
        self.entries.push(MeshEntry {
            mesh: quad,
            gpu: None,
        });
        self.pending.push(id);
        id
    }

    pub fn get(&self, id: MeshId) -> Option<&Mesh> {
        self.entries.get(id.0).map(|e| &e.mesh)
    }

    pub fn gpu(&self, id: MeshId) -> Option<&GpuMesh<B>> {
        self.entries.get(id.0).and_then(|e| e.gpu.as_ref())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Upload every mesh added since the last flush. Failed uploads are
    /// logged and retried next frame.
    pub fn create_pending(&mut self, backend: &mut B) -> usize {
        let mut created = 0;
        let mut retry = Vec::new();
        for id in std::mem::take(&mut self.pending) {
            let entry = &mut self.entries[id.0];
            match upload(backend, &entry.mesh) {
                Ok(gpu) => {
                    entry.gpu = Some(gpu);
                    created += 1;
                }
                Err(err) => {
                    log::error!("Failed to upload mesh {}: {err}", entry.mesh.key);
                    retry.push(id);
                }
            }
        }
        self.pending = retry;
        created
    }

    pub fn destroy(&mut self, backend: &mut B) {
        for entry in self.entries.drain(..) {
            if let Some(gpu) = entry.gpu {
                backend.destroy_buffer(gpu.vertex_buffer);
                backend.destroy_buffer(gpu.index_buffer);
            }
        }
        self.by_key.clear();
        self.pending.clear();
    }
}

fn upload<B: GpuBackend>(backend: &mut B, mesh: &Mesh) -> Result<GpuMesh<B>, BackendError> {
    let vertex_buffer = backend.create_buffer(
        &format!("{}-vertices", mesh.key),
        BufferUsage::VERTEX,
        bytemuck::cast_slice(&mesh.vertices),
    )?;
    let index_buffer = match backend.create_buffer(
        &format!("{}-indices", mesh.key),
        BufferUsage::INDEX,
        bytemuck::cast_slice(&mesh.indices),
    ) {
        Ok(buffer) => buffer,
        Err(err) => {
            backend.destroy_buffer(vertex_buffer);
            return Err(err);
        }
    };
    Ok(GpuMesh {
        vertex_buffer,
        index_buffer,
        index_count: mesh.indices.len() as u32,
    })
}

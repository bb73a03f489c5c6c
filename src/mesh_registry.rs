//! Mesh registry
//!
//! All meshes share one vertex arena and one index arena. Uploading a mesh
//! appends its data to both and records where it landed under the next dense
//! [`MeshId`]. Records are never removed, so ids stay valid for the lifetime
//! of the registry and index straight into the record array.

use std::sync::Arc;

use crate::backend::{BufferHandle, BufferUsage, GpuBackend, Vertex};
use crate::error::{RendererError, RendererResult};
use crate::resources::{GpuArena, Mesh};

const INDEX_SIZE: u64 = std::mem::size_of::<u32>() as u64;

/// Dense, stable mesh identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MeshId(pub(crate) u32);

impl MeshId {
    pub fn index(&self) -> usize {
        self.0 as usize
    }

    pub fn raw(&self) -> u32 {
        self.0
    }
}

/// Where a mesh lives inside the shared arenas. Offsets are in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeshRecord {
    pub id: MeshId,
    pub vertex_offset: u64,
    pub vertex_count: u32,
    pub index_offset: u64,
    pub index_count: u32,
}

impl MeshRecord {
    /// Index of the mesh's first vertex in the vertex buffer.
    pub fn base_vertex(&self) -> i32 {
        (self.vertex_offset / Vertex::STRIDE) as i32
    }

    /// Index of the mesh's first index in the index buffer.
    pub fn first_index(&self) -> u32 {
        (self.index_offset / INDEX_SIZE) as u32
    }
}

pub struct MeshRegistry {
    vertex_arena: GpuArena,
    index_arena: GpuArena,
    records: Vec<MeshRecord>,
    max_meshes: usize,
}

impl MeshRegistry {
    pub fn new(
        backend: Arc<dyn GpuBackend>,
        vertex_arena_bytes: u64,
        index_arena_bytes: u64,
        max_meshes: usize,
    ) -> RendererResult<Self> {
        if max_meshes == 0 {
            return Err(RendererError::InvalidConfig(
                "max_meshes must be non-zero".to_string(),
            ));
        }
        let vertex_arena = GpuArena::new(
            backend.clone(),
            vertex_arena_bytes,
            BufferUsage::VERTEX,
            "vertex",
        )?;
        let index_arena = GpuArena::new(backend, index_arena_bytes, BufferUsage::INDEX, "index")?;

        Ok(Self {
            vertex_arena,
            index_arena,
            records: Vec::with_capacity(max_meshes),
            max_meshes,
        })
    }

    /// Copy a mesh into the shared arenas and return its id.
    ///
    /// Nothing stays allocated unless both copies succeed.
    pub fn upload(&mut self, vertices: &[Vertex], indices: &[u32]) -> RendererResult<MeshId> {
        if self.records.len() >= self.max_meshes {
            return Err(RendererError::CapacityExceeded {
                resource: "mesh",
                capacity: self.max_meshes,
            });
        }

        let vertex_bytes = vertices.len() as u64 * Vertex::STRIDE;
        let index_bytes = indices.len() as u64 * INDEX_SIZE;
        for (arena, bytes) in [
            (&self.vertex_arena, vertex_bytes),
            (&self.index_arena, index_bytes),
        ] {
            if bytes > arena.remaining() {
                return Err(RendererError::OutOfMemory {
                    arena: arena.label(),
                    requested: bytes,
                    available: arena.remaining(),
                });
            }
        }

        let vertex_offset = self.vertex_arena.push_slice(vertices)?;
        let index_offset = match self.index_arena.push_slice(indices) {
            Ok(offset) => offset,
            Err(e) => {
                self.vertex_arena.rewind(vertex_offset);
                return Err(e);
            }
        };

        let id = MeshId(self.records.len() as u32);
        self.records.push(MeshRecord {
            id,
            vertex_offset,
            vertex_count: vertices.len() as u32,
            index_offset,
            index_count: indices.len() as u32,
        });
        log::debug!(
            "Uploaded mesh {} ({} vertices, {} indices)",
            id.0,
            vertices.len(),
            indices.len()
        );

        Ok(id)
    }

    pub fn upload_mesh(&mut self, mesh: &Mesh) -> RendererResult<MeshId> {
        self.upload(&mesh.vertices, &mesh.indices)
    }

    pub fn get(&self, id: MeshId) -> RendererResult<&MeshRecord> {
        self.records
            .get(id.index())
            .ok_or_else(|| RendererError::InvalidHandle(format!("unknown mesh id {}", id.0)))
    }

    pub fn contains(&self, id: MeshId) -> bool {
        id.index() < self.records.len()
    }

    pub fn records(&self) -> &[MeshRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_meshes
    }

    pub fn vertex_buffer(&self) -> BufferHandle {
        self.vertex_arena.buffer()
    }

    pub fn index_buffer(&self) -> BufferHandle {
        self.index_arena.buffer()
    }

    pub fn vertex_arena(&self) -> &GpuArena {
        &self.vertex_arena
    }

    pub fn index_arena(&self) -> &GpuArena {
        &self.index_arena
    }
}

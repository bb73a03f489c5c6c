//! Instance batching for indirect drawing.
//!
//! Every frame the caller pushes one [`InstanceRecord`] per visible object. The
//! batcher groups them by mesh: one [`Batch`] per distinct mesh, in the order
//! meshes were first pushed this frame. [`InstanceBatcher::build_draw_list`]
//! then lays the instances out so that each batch is a contiguous run and emits
//! one [`IndirectDrawCommand`] per batch.
//!
//! Pushes for different meshes may interleave freely:
//!
//! ```text
//! push order:    A0 B0 A1 C0 B1
//! batches:       A(first 0, count 2)  B(first 2, count 2)  C(first 4, count 1)
//! instance data: A0 A1 | B0 B1 | C0
//! ```
//!
//! The layout is a counting sort keyed by batch, so instances of one mesh keep
//! their push order.
//!
//! # Per-frame buffers
//!
//! The batcher owns one instance arena and one indirect arena per frame slot.
//! [`commit`](InstanceBatcher::commit) resets the slot's arenas and writes the
//! frame's data into them; it must only be called once that slot's previous
//! frame has completed on the GPU.

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec4};

use crate::backend::{BufferHandle, BufferUsage, GpuBackend};
use crate::error::{RendererError, RendererResult};
use crate::mesh_registry::{MeshId, MeshRegistry};
use crate::resources::GpuArena;

/// One indexed indirect draw, laid out as `VkDrawIndexedIndirectCommand`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct IndirectDrawCommand {
    pub index_count: u32,
    pub instance_count: u32,
    pub first_index: u32,
    pub vertex_offset: i32,
    pub first_instance: u32,
}

impl IndirectDrawCommand {
    pub const STRIDE: u32 = std::mem::size_of::<IndirectDrawCommand>() as u32;
}

/// Per-instance data as the vertex shader reads it (std430).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct InstanceData {
    pub transform: [[f32; 4]; 4],
    pub color: [f32; 4],
    pub mesh_id: u32,
    pub _padding: [u32; 3],
}

impl InstanceData {
    pub const SIZE: u64 = std::mem::size_of::<InstanceData>() as u64;

    pub fn new(mesh: MeshId, transform: Mat4, color: Vec4) -> Self {
        Self {
            transform: transform.to_cols_array_2d(),
            color: color.to_array(),
            mesh_id: mesh.raw(),
            _padding: [0; 3],
        }
    }
}

/// What the caller pushes for each visible object.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InstanceRecord {
    pub mesh: MeshId,
    pub transform: Mat4,
    /// White when `None`.
    pub color: Option<Vec4>,
}

impl InstanceRecord {
    pub fn new(mesh: MeshId, transform: Mat4) -> Self {
        Self {
            mesh,
            transform,
            color: None,
        }
    }

    pub fn with_color(mut self, color: Vec4) -> Self {
        self.color = Some(color);
        self
    }
}

/// A contiguous run of same-mesh instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Batch {
    pub mesh_id: MeshId,
    pub first_instance: u32,
    pub instance_count: u32,
}

/// Buffers to bind for one committed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommittedDraw {
    pub instance_buffer: BufferHandle,
    pub indirect_buffer: BufferHandle,
    pub draw_count: u32,
    pub instance_count: u32,
}

struct SlotBuffers {
    instances: GpuArena,
    commands: GpuArena,
}

/// Groups instances by mesh and produces the indirect draw list.
pub struct InstanceBatcher {
    /// Instances in push order, with the index of their batch.
    pending: Vec<(u32, InstanceData)>,
    batches: Vec<Batch>,
    /// Batch index per mesh id, for meshes seen this frame.
    batch_of_mesh: Vec<Option<u32>>,
    sorted: Vec<InstanceData>,
    commands: Vec<IndirectDrawCommand>,
    built: bool,
    slots: Vec<SlotBuffers>,
    max_instances: usize,
    max_batches: usize,
}

impl InstanceBatcher {
    /// Create a batcher with per-slot buffers for `frames_in_flight` slots.
    pub fn new(
        backend: Arc<dyn GpuBackend>,
        frames_in_flight: usize,
        max_instances: usize,
        max_batches: usize,
    ) -> RendererResult<Self> {
        if max_instances == 0 || max_batches == 0 {
            return Err(RendererError::InvalidConfig(
                "instance and batch capacities must be non-zero".to_string(),
            ));
        }

        let mut slots = Vec::with_capacity(frames_in_flight);
        for _ in 0..frames_in_flight {
            slots.push(SlotBuffers {
                instances: GpuArena::new(
                    backend.clone(),
                    max_instances as u64 * InstanceData::SIZE,
                    BufferUsage::STORAGE,
                    "instance",
                )?,
                commands: GpuArena::new(
                    backend.clone(),
                    max_batches as u64 * IndirectDrawCommand::STRIDE as u64,
                    BufferUsage::INDIRECT,
                    "indirect",
                )?,
            });
        }

        Ok(Self {
            pending: Vec::with_capacity(max_instances),
            batches: Vec::with_capacity(max_batches),
            batch_of_mesh: Vec::new(),
            sorted: Vec::with_capacity(max_instances),
            commands: Vec::with_capacity(max_batches),
            built: false,
            slots,
            max_instances,
            max_batches,
        })
    }

    /// Start a new frame with no instances.
    pub fn clear(&mut self) {
        for batch in &self.batches {
            self.batch_of_mesh[batch.mesh_id.index()] = None;
        }
        self.batches.clear();
        self.pending.clear();
        self.sorted.clear();
        self.commands.clear();
        self.built = false;
    }

    /// Add one instance of `mesh`.
    ///
    /// On error nothing is recorded.
    pub fn push(
        &mut self,
        registry: &MeshRegistry,
        mesh: MeshId,
        transform: Mat4,
        color: Option<Vec4>,
    ) -> RendererResult<()> {
        registry.get(mesh)?;

        if self.pending.len() >= self.max_instances {
            return Err(RendererError::CapacityExceeded {
                resource: "instance",
                capacity: self.max_instances,
            });
        }

        let batch_index = match self.batch_of_mesh.get(mesh.index()).copied().flatten() {
            Some(index) => index,
            None => {
                if self.batches.len() >= self.max_batches {
                    return Err(RendererError::CapacityExceeded {
                        resource: "batch",
                        capacity: self.max_batches,
                    });
                }
                let index = self.batches.len() as u32;
                self.batches.push(Batch {
                    mesh_id: mesh,
                    first_instance: 0,
                    instance_count: 0,
                });
                if self.batch_of_mesh.len() <= mesh.index() {
                    self.batch_of_mesh.resize(mesh.index() + 1, None);
                }
                self.batch_of_mesh[mesh.index()] = Some(index);
                index
            }
        };

        self.batches[batch_index as usize].instance_count += 1;
        self.pending.push((
            batch_index,
            InstanceData::new(mesh, transform, color.unwrap_or(Vec4::ONE)),
        ));
        self.built = false;
        Ok(())
    }

    pub fn push_record(&mut self, registry: &MeshRegistry, record: &InstanceRecord) -> RendererResult<()> {
        self.push(registry, record.mesh, record.transform, record.color)
    }

    /// Lay instances out batch by batch and emit one command per batch.
    pub fn build_draw_list(&mut self, registry: &MeshRegistry) -> RendererResult<&[IndirectDrawCommand]> {
        if self.built {
            return Ok(&self.commands);
        }

        let mut cursors = Vec::with_capacity(self.batches.len());
        let mut running_total = 0u32;
        for batch in &mut self.batches {
            batch.first_instance = running_total;
            cursors.push(running_total as usize);
            running_total += batch.instance_count;
        }

        self.sorted.clear();
        self.sorted
            .resize(self.pending.len(), InstanceData::zeroed());
        for (batch_index, data) in &self.pending {
            let cursor = &mut cursors[*batch_index as usize];
            self.sorted[*cursor] = *data;
            *cursor += 1;
        }

        self.commands.clear();
        for batch in &self.batches {
            let mesh = registry.get(batch.mesh_id)?;
            self.commands.push(IndirectDrawCommand {
                index_count: mesh.index_count,
                instance_count: batch.instance_count,
                first_index: mesh.first_index(),
                vertex_offset: mesh.base_vertex(),
                first_instance: batch.first_instance,
            });
        }

        self.built = true;
        log::trace!(
            "Built draw list: {} instances in {} batches",
            self.pending.len(),
            self.batches.len()
        );
        Ok(&self.commands)
    }

    /// Write this frame's instances and commands into `slot`'s buffers.
    pub fn commit(&mut self, registry: &MeshRegistry, slot: usize) -> RendererResult<CommittedDraw> {
        self.build_draw_list(registry)?;

        let buffers = self.slots.get_mut(slot).ok_or_else(|| {
            RendererError::InvalidHandle(format!("frame slot {} does not exist", slot))
        })?;
        buffers.instances.reset();
        buffers.commands.reset();
        if !self.sorted.is_empty() {
            buffers.instances.push_slice(&self.sorted)?;
            buffers.commands.push_slice(&self.commands)?;
        }

        Ok(CommittedDraw {
            instance_buffer: buffers.instances.buffer(),
            indirect_buffer: buffers.commands.buffer(),
            draw_count: self.commands.len() as u32,
            instance_count: self.sorted.len() as u32,
        })
    }

    /// Batches in first-seen order. Instance ranges are filled in by
    /// [`build_draw_list`](Self::build_draw_list).
    pub fn batches(&self) -> &[Batch] {
        &self.batches
    }

    /// Instance data grouped by batch, after `build_draw_list`.
    pub fn instances(&self) -> &[InstanceData] {
        &self.sorted
    }

    pub fn commands(&self) -> &[IndirectDrawCommand] {
        &self.commands
    }

    pub fn instance_count(&self) -> usize {
        self.pending.len()
    }

    pub fn batch_count(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn instance_buffer(&self, slot: usize) -> Option<BufferHandle> {
        self.slots.get(slot).map(|s| s.instances.buffer())
    }

    pub fn indirect_buffer(&self, slot: usize) -> Option<BufferHandle> {
        self.slots.get(slot).map(|s| s.commands.buffer())
    }

    pub fn max_instances(&self) -> usize {
        self.max_instances
    }

    pub fn max_batches(&self) -> usize {
        self.max_batches
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyBackend;
    use crate::resources::Mesh;
    use glam::Vec3;

    fn setup(max_instances: usize, max_batches: usize) -> (MeshRegistry, InstanceBatcher, [MeshId; 3]) {
        let backend = Arc::new(DummyBackend::new());
        let mut registry = MeshRegistry::new(backend.clone(), 1 << 16, 1 << 16, 16).unwrap();
        let ids = [
            registry.upload_mesh(&Mesh::quad()).unwrap(),
            registry.upload_mesh(&Mesh::cube()).unwrap(),
            registry.upload_mesh(&Mesh::quad()).unwrap(),
        ];
        let batcher = InstanceBatcher::new(backend, 2, max_instances, max_batches).unwrap();
        (registry, batcher, ids)
    }

    fn at(x: f32) -> Mat4 {
        Mat4::from_translation(Vec3::new(x, 0.0, 0.0))
    }

    #[test]
    fn test_indirect_command_layout() {
        assert_eq!(IndirectDrawCommand::STRIDE, 20);
        assert_eq!(InstanceData::SIZE % 16, 0);
    }

    #[test]
    fn test_single_mesh_batch() {
        let (registry, mut batcher, [quad, ..]) = setup(16, 4);
        batcher.push(&registry, quad, at(1.0), None).unwrap();
        batcher.push(&registry, quad, at(2.0), None).unwrap();

        let commands = batcher.build_draw_list(&registry).unwrap().to_vec();
        assert_eq!(
            commands,
            vec![IndirectDrawCommand {
                index_count: 6,
                instance_count: 2,
                first_index: 0,
                vertex_offset: 0,
                first_instance: 0,
            }]
        );
        assert_eq!(
            batcher.batches(),
            &[Batch {
                mesh_id: quad,
                first_instance: 0,
                instance_count: 2
            }]
        );
    }

    #[test]
    fn test_interleaved_pushes_are_grouped() {
        let (registry, mut batcher, [a, b, _]) = setup(16, 4);
        batcher.push(&registry, a, at(0.0), None).unwrap();
        batcher.push(&registry, b, at(1.0), None).unwrap();
        batcher.push(&registry, a, at(2.0), None).unwrap();

        let commands = batcher.build_draw_list(&registry).unwrap().to_vec();
        assert_eq!(commands.len(), 2);
        assert_eq!((commands[0].first_instance, commands[0].instance_count), (0, 2));
        assert_eq!((commands[1].first_instance, commands[1].instance_count), (2, 1));

        let instances = batcher.instances();
        for batch in batcher.batches() {
            let range = batch.first_instance as usize..(batch.first_instance + batch.instance_count) as usize;
            assert!(instances[range].iter().all(|i| i.mesh_id == batch.mesh_id.raw()));
        }
        // Push order is kept within a batch
        assert_eq!(instances[0].transform[3][0], 0.0);
        assert_eq!(instances[1].transform[3][0], 2.0);
    }

    #[test]
    fn test_second_mesh_uses_base_vertex() {
        let (registry, mut batcher, [quad, cube, _]) = setup(16, 4);
        batcher.push(&registry, cube, Mat4::IDENTITY, None).unwrap();
        batcher.push(&registry, quad, Mat4::IDENTITY, None).unwrap();

        let commands = batcher.build_draw_list(&registry).unwrap();
        assert_eq!(commands[0].index_count, 36);
        assert_eq!(commands[0].first_index, 6);
        assert_eq!(commands[0].vertex_offset, 4);
        assert_eq!(commands[1].first_index, 0);
        assert_eq!(commands[1].first_instance, 1);
    }

    #[test]
    fn test_default_color_is_white() {
        let (registry, mut batcher, [quad, ..]) = setup(16, 4);
        let red = Vec4::new(1.0, 0.0, 0.0, 1.0);
        batcher.push(&registry, quad, Mat4::IDENTITY, None).unwrap();
        batcher
            .push_record(&registry, &InstanceRecord::new(quad, Mat4::IDENTITY).with_color(red))
            .unwrap();
        batcher.build_draw_list(&registry).unwrap();

        assert_eq!(batcher.instances()[0].color, [1.0; 4]);
        assert_eq!(batcher.instances()[1].color, red.to_array());
    }

    #[test]
    fn test_unknown_mesh_rejected() {
        let (registry, mut batcher, _) = setup(16, 4);
        assert!(matches!(
            batcher.push(&registry, MeshId(42), Mat4::IDENTITY, None),
            Err(RendererError::InvalidHandle(_))
        ));
        assert!(batcher.is_empty());
    }

    #[test]
    fn test_instance_capacity() {
        let (registry, mut batcher, [quad, ..]) = setup(2, 4);
        batcher.push(&registry, quad, Mat4::IDENTITY, None).unwrap();
        batcher.push(&registry, quad, Mat4::IDENTITY, None).unwrap();
        assert!(matches!(
            batcher.push(&registry, quad, Mat4::IDENTITY, None),
            Err(RendererError::CapacityExceeded {
                resource: "instance",
                capacity: 2
            })
        ));
        assert_eq!(batcher.instance_count(), 2);
    }

    #[test]
    fn test_batch_capacity() {
        let (registry, mut batcher, [a, b, c]) = setup(16, 2);
        batcher.push(&registry, a, Mat4::IDENTITY, None).unwrap();
        batcher.push(&registry, b, Mat4::IDENTITY, None).unwrap();
        assert!(matches!(
            batcher.push(&registry, c, Mat4::IDENTITY, None),
            Err(RendererError::CapacityExceeded {
                resource: "batch",
                ..
            })
        ));
        // Existing batches still accept instances
        batcher.push(&registry, a, Mat4::IDENTITY, None).unwrap();
        assert_eq!(batcher.batch_count(), 2);
        assert_eq!(batcher.instance_count(), 3);
    }

    #[test]
    fn test_clear_starts_empty_frame() {
        let (registry, mut batcher, [a, b, _]) = setup(16, 4);
        batcher.push(&registry, a, Mat4::IDENTITY, None).unwrap();
        batcher.push(&registry, b, Mat4::IDENTITY, None).unwrap();
        batcher.build_draw_list(&registry).unwrap();
        batcher.clear();

        assert!(batcher.is_empty());
        assert!(batcher.build_draw_list(&registry).unwrap().is_empty());

        batcher.push(&registry, b, Mat4::IDENTITY, None).unwrap();
        assert_eq!(batcher.batches()[0].mesh_id, b);
    }

    #[test]
    fn test_commit_writes_slot_buffers() {
        let backend = Arc::new(DummyBackend::new());
        let mut registry = MeshRegistry::new(backend.clone(), 1 << 16, 1 << 16, 4).unwrap();
        let quad = registry.upload_mesh(&Mesh::quad()).unwrap();
        let mut batcher = InstanceBatcher::new(backend.clone(), 2, 8, 2).unwrap();

        batcher.push(&registry, quad, Mat4::IDENTITY, None).unwrap();
        let draw = batcher.commit(&registry, 1).unwrap();
        assert_eq!(draw.draw_count, 1);
        assert_eq!(draw.instance_count, 1);
        assert_eq!(Some(draw.indirect_buffer), batcher.indirect_buffer(1));
        assert_ne!(batcher.indirect_buffer(0), batcher.indirect_buffer(1));

        let bytes = backend
            .read_buffer(draw.indirect_buffer, 0, IndirectDrawCommand::STRIDE as u64)
            .unwrap();
        let command: IndirectDrawCommand = bytemuck::pod_read_unaligned(&bytes);
        assert_eq!(command.index_count, 6);
        assert_eq!(command.instance_count, 1);

        assert!(matches!(
            batcher.commit(&registry, 2),
            Err(RendererError::InvalidHandle(_))
        ));
    }
}

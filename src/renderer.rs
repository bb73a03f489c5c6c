//! The renderer context
//!
//! [`Renderer`] ties the pieces together and drives one frame:
//!
//! ```text
//! begin_frame ─► push_instance × N ─► draw ─► end_frame
//!   │                                   │
//!   │ wait slot fence, acquire image    │ commit instances + commands to the slot,
//!   │ clear the batcher                 │ bind pipeline, set, vertex/index buffers,
//!   │                                   │ one indirect draw for all batches
//! ```
//!
//! There is no global state; everything the frame loop touches hangs off the
//! `Renderer` value.

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec4};

use crate::backend::{
    self, BindGroupHandle, BufferUsage, Extent2d, GpuBackend, IndexFormat, PipelineDescriptor,
    PipelineHandle, PresentStatus, Vertex,
};
use crate::batch::{IndirectDrawCommand, InstanceBatcher};
use crate::error::{RendererError, RendererResult};
use crate::frame::{FrameHandle, FrameStats, FrameStatus, FrameSynchronizer};
use crate::mesh_registry::{MeshId, MeshRecord, MeshRegistry};
use crate::resources::{GpuArena, Mesh};
use crate::shader::ShaderSet;
use crate::swapchain::SurfaceManager;
use crate::window::Window;
use crate::RendererConfig;

/// Camera matrices, uniform binding 0.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct CameraUniform {
    pub projection: Mat4,
    pub view: Mat4,
}

impl Default for CameraUniform {
    fn default() -> Self {
        Self {
            projection: Mat4::IDENTITY,
            view: Mat4::IDENTITY,
        }
    }
}

/// Frame loop, mesh storage and instance batching behind one context object.
pub struct Renderer {
    backend: Arc<dyn GpuBackend>,
    frames: FrameSynchronizer,
    meshes: MeshRegistry,
    batcher: InstanceBatcher,
    camera_buffers: Vec<GpuArena>,
    bind_groups: Vec<BindGroupHandle>,
    pipeline: PipelineHandle,
    camera: CameraUniform,
    /// Frame number whose draw has been recorded.
    drawn_frame: Option<u64>,
}

impl Renderer {
    /// Create a renderer for `window`, loading shaders from the configured paths.
    pub fn new(window: &Window, config: &RendererConfig) -> RendererResult<Self> {
        config.validate()?;
        let shaders = ShaderSet::load(config)?;
        let backend = backend::create_backend(window.window(), config)?;
        Self::with_backend(backend, window.extent(), config, &shaders)
    }

    /// Create a renderer on an existing backend.
    pub fn with_backend(
        backend: Arc<dyn GpuBackend>,
        window_extent: Extent2d,
        config: &RendererConfig,
        shaders: &ShaderSet,
    ) -> RendererResult<Self> {
        config.validate()?;
        log::info!("Creating renderer on {}", backend.name());

        let surface = SurfaceManager::create(
            backend.clone(),
            window_extent,
            config.preferred_format,
            config.present_policy,
        )?;
        let color_format = surface.state()?.format.format;
        let frames = FrameSynchronizer::new(
            backend.clone(),
            surface,
            config.frames_in_flight,
            window_extent,
            config.clear_color,
        )?;

        let meshes = MeshRegistry::new(
            backend.clone(),
            config.vertex_arena_bytes,
            config.index_arena_bytes,
            config.max_meshes,
        )?;
        let batcher = InstanceBatcher::new(
            backend.clone(),
            config.frames_in_flight,
            config.max_instances,
            config.max_batches,
        )?;

        let mut camera_buffers = Vec::with_capacity(config.frames_in_flight);
        for _ in 0..config.frames_in_flight {
            camera_buffers.push(GpuArena::new(
                backend.clone(),
                std::mem::size_of::<CameraUniform>() as u64,
                BufferUsage::UNIFORM,
                "camera",
            )?);
        }

        let pipeline = backend.create_pipeline(&PipelineDescriptor {
            label: Some("instanced".to_string()),
            vertex_spirv: shaders.vertex.clone(),
            fragment_spirv: shaders.fragment.clone(),
            vertex_stride: Vertex::STRIDE as u32,
            color_format,
        })?;

        let mut bind_groups = Vec::with_capacity(config.frames_in_flight);
        for (slot, camera) in camera_buffers.iter().enumerate() {
            let instances = batcher.instance_buffer(slot).ok_or_else(|| {
                RendererError::InvalidHandle(format!("no instance buffer for slot {}", slot))
            })?;
            match backend.create_bind_group(pipeline, camera.buffer(), instances) {
                Ok(group) => bind_groups.push(group),
                Err(e) => {
                    for group in bind_groups {
                        backend.destroy_bind_group(group);
                    }
                    backend.destroy_pipeline(pipeline);
                    return Err(e.into());
                }
            }
        }

        Ok(Self {
            backend,
            frames,
            meshes,
            batcher,
            camera_buffers,
            bind_groups,
            pipeline,
            camera: CameraUniform::default(),
            drawn_frame: None,
        })
    }

    /// Wait for the next frame slot and start recording.
    ///
    /// On [`FrameStatus::Skipped`] nothing may be recorded or submitted.
    pub fn begin_frame(&mut self) -> RendererResult<FrameStatus> {
        let status = self.frames.begin_frame()?;
        if let FrameStatus::Ready(_) = status {
            self.batcher.clear();
        }
        Ok(status)
    }

    /// Queue one instance of `mesh` for the current frame. `None` draws it white.
    pub fn push_instance(
        &mut self,
        mesh: MeshId,
        transform: Mat4,
        color: Option<Vec4>,
    ) -> RendererResult<()> {
        self.batcher.push(&self.meshes, mesh, transform, color)
    }

    /// Copy mesh data into the shared vertex and index arenas.
    pub fn upload(&mut self, vertices: &[Vertex], indices: &[u32]) -> RendererResult<MeshId> {
        self.meshes.upload(vertices, indices)
    }

    pub fn upload_mesh(&mut self, mesh: &Mesh) -> RendererResult<MeshId> {
        self.meshes.upload_mesh(mesh)
    }

    pub fn mesh(&self, id: MeshId) -> RendererResult<&MeshRecord> {
        self.meshes.get(id)
    }

    /// Camera used by the next `draw`.
    pub fn set_camera(&mut self, camera: CameraUniform) {
        self.camera = camera;
    }

    pub fn camera(&self) -> &CameraUniform {
        &self.camera
    }

    /// Record the frame's single indirect draw.
    ///
    /// Writes the camera, the grouped instances and the command list into the
    /// frame slot's buffers, then binds everything and issues one
    /// `draw_indexed_indirect` covering every batch.
    pub fn draw(&mut self, frame: &FrameHandle) -> RendererResult<()> {
        self.frames.check(frame)?;
        if self.drawn_frame == Some(frame.frame_number()) {
            return Err(RendererError::InvalidHandle(format!(
                "frame {} was already drawn",
                frame.frame_number()
            )));
        }

        let slot = frame.slot();
        let committed = self.batcher.commit(&self.meshes, slot)?;
        let camera = &mut self.camera_buffers[slot];
        camera.reset();
        camera.push_slice(std::slice::from_ref(&self.camera))?;

        let cmd = frame.command_buffer();
        self.backend.cmd_bind_pipeline(cmd, self.pipeline);
        self.backend
            .cmd_bind_group(cmd, self.pipeline, self.bind_groups[slot]);
        self.backend
            .cmd_bind_vertex_buffer(cmd, self.meshes.vertex_buffer(), 0);
        self.backend
            .cmd_bind_index_buffer(cmd, self.meshes.index_buffer(), 0, IndexFormat::Uint32);
        if committed.draw_count > 0 {
            self.backend.cmd_draw_indexed_indirect(
                cmd,
                committed.indirect_buffer,
                0,
                committed.draw_count,
                IndirectDrawCommand::STRIDE,
            );
        }

        self.drawn_frame = Some(frame.frame_number());
        let stats = self.frames.stats_mut();
        stats.last_batch_count = committed.draw_count as usize;
        stats.last_instance_count = committed.instance_count as usize;
        log::trace!(
            "Frame {}: {} instances in {} draws",
            frame.frame_number(),
            committed.instance_count,
            committed.draw_count
        );
        Ok(())
    }

    /// Submit and present the frame.
    pub fn end_frame(&mut self, frame: FrameHandle) -> RendererResult<PresentStatus> {
        self.frames.end_frame(frame)
    }

    /// Give up on a frame without submitting it, for example after
    /// `push_instance` ran out of capacity. Queued instances are discarded.
    pub fn abandon_frame(&mut self, frame: FrameHandle) -> RendererResult<()> {
        self.frames.abandon_frame(frame)?;
        self.batcher.clear();
        Ok(())
    }

    /// Recreate the surface for a new window size on the next `begin_frame`.
    pub fn resize(&mut self, width: u32, height: u32) {
        log::debug!("Resize to {}x{}", width, height);
        self.frames.resize(Extent2d::new(width, height));
    }

    /// Block until the GPU has finished every submitted frame.
    pub fn wait_idle(&mut self) -> RendererResult<()> {
        self.frames.wait_idle()
    }

    pub fn stats(&self) -> FrameStats {
        *self.frames.stats()
    }

    pub fn frames(&self) -> &FrameSynchronizer {
        &self.frames
    }

    pub fn meshes(&self) -> &MeshRegistry {
        &self.meshes
    }

    pub fn batcher(&self) -> &InstanceBatcher {
        &self.batcher
    }

    pub fn backend(&self) -> &Arc<dyn GpuBackend> {
        &self.backend
    }

    pub fn pipeline(&self) -> PipelineHandle {
        self.pipeline
    }

    /// Uniform buffer holding `slot`'s camera.
    pub fn camera_buffer(&self, slot: usize) -> Option<backend::BufferHandle> {
        self.camera_buffers.get(slot).map(|arena| arena.buffer())
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        if let Err(e) = self.frames.wait_idle() {
            log::error!("wait_idle failed while dropping renderer: {}", e);
        }
        for group in self.bind_groups.drain(..) {
            self.backend.destroy_bind_group(group);
        }
        self.backend.destroy_pipeline(self.pipeline);
    }
}

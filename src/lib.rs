//! Indirect Renderer - frame-in-flight presentation and mesh-batched indirect drawing
//!
//! The crate is the presentation-and-batching core of a real-time renderer:
//! - A frame synchronizer that keeps at most N frames of GPU work in flight
//! - A surface manager that recreates the swapchain when it goes stale
//! - Bump arenas over persistently-mapped device buffers
//! - A mesh registry sharing one vertex and one index arena between all meshes
//! - An instance batcher that groups instances by mesh and emits one indirect
//!   draw command per mesh
//!
//! Everything goes through [`Renderer`], an explicit context object:
//!
//! ```no_run
//! # use indirect_renderer::*;
//! # fn frame(renderer: &mut Renderer, quad: MeshId) -> RendererResult<()> {
//! if let FrameStatus::Ready(frame) = renderer.begin_frame()? {
//!     renderer.push_instance(quad, glam::Mat4::IDENTITY, None)?;
//!     renderer.draw(&frame)?;
//!     renderer.end_frame(frame)?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod batch;
pub mod error;
pub mod frame;
pub mod mesh_registry;
pub mod module;
pub mod renderer;
pub mod resources;
pub mod scene;
pub mod shader;
pub mod swapchain;
pub mod window;

pub use backend::{Extent2d, GpuBackend, TextureFormat, Vertex};
pub use batch::{Batch, IndirectDrawCommand, InstanceBatcher, InstanceData, InstanceRecord};
pub use error::{RendererError, RendererResult};
pub use frame::{FrameHandle, FrameStats, FrameStatus, FrameSynchronizer};
pub use mesh_registry::{MeshId, MeshRecord, MeshRegistry};
pub use module::{GameModule, RenderApi};
pub use renderer::{CameraUniform, Renderer};
pub use resources::{GpuArena, Mesh};
pub use shader::ShaderSet;
pub use swapchain::{SurfaceImage, SurfaceManager, SurfaceState};
pub use window::Window;

use std::path::PathBuf;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Backend selection for the renderer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendType {
    /// Headless backend, no GPU required
    Dummy,
    /// Vulkan backend via ash
    #[default]
    Vulkan,
}

/// How presentation trades latency against tearing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PresentPolicy {
    /// FIFO presentation, never tears
    #[default]
    Vsync,
    /// Mailbox (or immediate) presentation with an extra swapchain image when supported
    LowLatency,
}

/// Configuration for initializing the renderer
#[derive(Debug, Clone)]
pub struct RendererConfig {
    /// Window title
    pub title: String,
    /// Initial window width
    pub width: u32,
    /// Initial window height
    pub height: u32,
    /// Which backend to use
    pub backend: BackendType,
    pub present_policy: PresentPolicy,
    /// Frames the CPU may run ahead of the GPU
    pub frames_in_flight: usize,
    /// Surface format used when the surface supports it
    pub preferred_format: TextureFormat,
    pub clear_color: [f32; 4],
    /// Size of the shared vertex arena in bytes
    pub vertex_arena_bytes: u64,
    /// Size of the shared index arena in bytes
    pub index_arena_bytes: u64,
    pub max_meshes: usize,
    /// Instances per frame
    pub max_instances: usize,
    /// Distinct meshes per frame
    pub max_batches: usize,
    /// Compiled SPIR-V vertex shader
    pub vertex_shader: PathBuf,
    /// Compiled SPIR-V fragment shader
    pub fragment_shader: PathBuf,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            title: "Indirect Renderer".to_string(),
            width: 1280,
            height: 720,
            backend: BackendType::Vulkan,
            present_policy: PresentPolicy::Vsync,
            frames_in_flight: 2,
            preferred_format: TextureFormat::Bgra8UnormSrgb,
            clear_color: [0.0, 0.0, 0.0, 0.0],
            vertex_arena_bytes: 100 * 1024 * 1024,
            index_arena_bytes: 100 * 1024 * 1024,
            max_meshes: 1024,
            max_instances: 20_000,
            max_batches: 200,
            vertex_shader: PathBuf::from("shaders/instanced.vert.spv"),
            fragment_shader: PathBuf::from("shaders/instanced.frag.spv"),
        }
    }
}

impl RendererConfig {
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_backend(mut self, backend: BackendType) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_present_policy(mut self, present_policy: PresentPolicy) -> Self {
        self.present_policy = present_policy;
        self
    }

    pub fn with_frames_in_flight(mut self, frames_in_flight: usize) -> Self {
        self.frames_in_flight = frames_in_flight;
        self
    }

    pub fn with_clear_color(mut self, clear_color: [f32; 4]) -> Self {
        self.clear_color = clear_color;
        self
    }

    pub fn with_arena_sizes(mut self, vertex_bytes: u64, index_bytes: u64) -> Self {
        self.vertex_arena_bytes = vertex_bytes;
        self.index_arena_bytes = index_bytes;
        self
    }

    pub fn with_capacities(mut self, max_meshes: usize, max_instances: usize, max_batches: usize) -> Self {
        self.max_meshes = max_meshes;
        self.max_instances = max_instances;
        self.max_batches = max_batches;
        self
    }

    pub fn with_shaders(mut self, vertex: impl Into<PathBuf>, fragment: impl Into<PathBuf>) -> Self {
        self.vertex_shader = vertex.into();
        self.fragment_shader = fragment.into();
        self
    }

    /// Reject configurations no renderer can be built from.
    pub fn validate(&self) -> RendererResult<()> {
        if self.frames_in_flight == 0 {
            return Err(RendererError::InvalidConfig(
                "frames_in_flight must be at least 1".to_string(),
            ));
        }
        let zero = [
            ("vertex_arena_bytes", self.vertex_arena_bytes == 0),
            ("index_arena_bytes", self.index_arena_bytes == 0),
            ("max_meshes", self.max_meshes == 0),
            ("max_instances", self.max_instances == 0),
            ("max_batches", self.max_batches == 0),
        ];
        if let Some((name, _)) = zero.iter().find(|(_, is_zero)| *is_zero) {
            return Err(RendererError::InvalidConfig(format!("{} must be non-zero", name)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RendererConfig::default();
        assert_eq!(config.frames_in_flight, 2);
        assert_eq!(config.max_instances, 20_000);
        assert_eq!(config.max_batches, 200);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_frames_in_flight_rejected() {
        let config = RendererConfig::default().with_frames_in_flight(0);
        assert!(matches!(
            config.validate(),
            Err(RendererError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let config = RendererConfig::default().with_capacities(16, 0, 4);
        match config.validate() {
            Err(RendererError::InvalidConfig(msg)) => assert!(msg.contains("max_instances")),
            other => panic!("unexpected {:?}", other),
        }
    }
}

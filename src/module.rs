//! Boundary between the renderer and game logic
//!
//! Game logic talks to the renderer only through [`RenderApi`], so a logic
//! module built as a separate library can be swapped out while the renderer
//! keeps running. Loading and reloading such libraries is left to the host.

use glam::{Mat4, Vec4};

use crate::error::RendererResult;
use crate::mesh_registry::MeshId;
use crate::renderer::{CameraUniform, Renderer};
use crate::resources::Mesh;

/// What game logic may ask of the renderer.
pub trait RenderApi {
    fn upload_mesh(&mut self, mesh: &Mesh) -> RendererResult<MeshId>;

    /// Queue one instance for the frame being recorded.
    fn push_instance(
        &mut self,
        mesh: MeshId,
        transform: Mat4,
        color: Option<Vec4>,
    ) -> RendererResult<()>;

    fn set_camera(&mut self, camera: CameraUniform);
}

impl RenderApi for Renderer {
    fn upload_mesh(&mut self, mesh: &Mesh) -> RendererResult<MeshId> {
        Renderer::upload_mesh(self, mesh)
    }

    fn push_instance(
        &mut self,
        mesh: MeshId,
        transform: Mat4,
        color: Option<Vec4>,
    ) -> RendererResult<()> {
        Renderer::push_instance(self, mesh, transform, color)
    }

    fn set_camera(&mut self, camera: CameraUniform) {
        Renderer::set_camera(self, camera)
    }
}

/// A unit of game logic driven by the host's frame loop.
///
/// `update` is called once per frame between `begin_frame` and `draw`.
pub trait GameModule {
    fn init(&mut self, api: &mut dyn RenderApi) -> RendererResult<()>;

    fn update(&mut self, api: &mut dyn RenderApi, dt: f32) -> RendererResult<()>;

    fn shutdown(&mut self) {}
}

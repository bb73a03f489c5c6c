//! ECS adapter
//!
//! Entities with a [`Transform`] and a [`MeshInstance`] become one instance
//! each in the current frame.

mod camera;
mod transform;

pub use camera::*;
pub use transform::*;

use bevy_ecs::prelude::*;
use glam::Vec4;

use crate::error::RendererResult;
use crate::mesh_registry::MeshId;
use crate::module::RenderApi;

/// Draws the entity's transform with an uploaded mesh.
#[derive(Component, Debug, Clone, Copy, PartialEq)]
pub struct MeshInstance {
    pub mesh: MeshId,
    /// `None` draws white
    pub color: Option<Vec4>,
}

impl MeshInstance {
    pub fn new(mesh: MeshId) -> Self {
        Self { mesh, color: None }
    }

    pub fn with_color(mut self, color: Vec4) -> Self {
        self.color = Some(color);
        self
    }
}

/// Push every `(Transform, MeshInstance)` entity in `world` to `api`.
///
/// Returns the number of instances queued. Stops at the first error, so a
/// full batcher leaves the remaining entities undrawn for this frame.
pub fn queue_instances(world: &mut World, api: &mut impl RenderApi) -> RendererResult<usize> {
    let mut query = world.query::<(&Transform, &MeshInstance)>();
    let mut queued = 0;
    for (transform, instance) in query.iter(world) {
        api.push_instance(instance.mesh, transform.matrix(), instance.color)?;
        queued += 1;
    }
    Ok(queued)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RendererError;
    use crate::renderer::CameraUniform;
    use crate::resources::Mesh;
    use glam::{Mat4, Vec3};

    struct LimitedApi {
        limit: usize,
        pushed: Vec<(MeshId, Mat4, Option<Vec4>)>,
    }

    impl RenderApi for LimitedApi {
        fn upload_mesh(&mut self, _mesh: &Mesh) -> RendererResult<MeshId> {
            Ok(MeshId(0))
        }

        fn push_instance(
            &mut self,
            mesh: MeshId,
            transform: Mat4,
            color: Option<Vec4>,
        ) -> RendererResult<()> {
            if self.pushed.len() == self.limit {
                return Err(RendererError::CapacityExceeded {
                    resource: "instances",
                    capacity: self.limit,
                });
            }
            self.pushed.push((mesh, transform, color));
            Ok(())
        }

        fn set_camera(&mut self, _camera: CameraUniform) {}
    }

    #[test]
    fn test_queue_instances() {
        let mut world = World::new();
        world.spawn((
            Transform::from_position(Vec3::new(1.0, 0.0, 0.0)),
            MeshInstance::new(MeshId(0)),
        ));
        world.spawn((
            Transform::from_position(Vec3::new(0.0, 2.0, 0.0)),
            MeshInstance::new(MeshId(1)).with_color(Vec4::new(1.0, 0.0, 0.0, 1.0)),
        ));
        // No mesh, not drawn
        world.spawn(Transform::default());

        let mut api = LimitedApi {
            limit: 16,
            pushed: Vec::new(),
        };
        assert_eq!(queue_instances(&mut world, &mut api).unwrap(), 2);
        assert_eq!(api.pushed.len(), 2);

        let red = api
            .pushed
            .iter()
            .find(|(mesh, _, _)| *mesh == MeshId(1))
            .unwrap();
        assert_eq!(red.1, Mat4::from_translation(Vec3::new(0.0, 2.0, 0.0)));
        assert_eq!(red.2, Some(Vec4::new(1.0, 0.0, 0.0, 1.0)));
    }

    #[test]
    fn test_queue_instances_propagates_capacity_error() {
        let mut world = World::new();
        for _ in 0..3 {
            world.spawn((Transform::default(), MeshInstance::new(MeshId(0))));
        }
        let mut api = LimitedApi {
            limit: 2,
            pushed: Vec::new(),
        };
        assert!(matches!(
            queue_instances(&mut world, &mut api),
            Err(RendererError::CapacityExceeded { .. })
        ));
        assert_eq!(api.pushed.len(), 2);
    }
}

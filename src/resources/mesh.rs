//! CPU-side mesh data and primitive generators

use crate::backend::types::Vertex;
use glam::{Vec2, Vec3, Vec4};

/// A mesh with vertex and index data, ready for upload
#[derive(Debug, Clone)]
pub struct Mesh {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
    pub name: String,
}

impl Mesh {
    pub fn new(name: &str) -> Self {
        Self {
            vertices: Vec::new(),
            indices: Vec::new(),
            name: name.to_string(),
        }
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    pub fn index_count(&self) -> usize {
        self.indices.len()
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    /// Get vertex data as bytes
    pub fn vertex_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.vertices)
    }

    /// Get index data as bytes
    pub fn index_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.indices)
    }

    /// Tint every vertex
    pub fn with_color(mut self, color: Vec4) -> Self {
        for vertex in &mut self.vertices {
            vertex.color = color;
        }
        self
    }

    /// A 2x2 quad in the XY plane facing +Z
    pub fn quad() -> Self {
        let mut mesh = Mesh::new("quad");

        let corners = [
            (Vec3::new(-1.0, -1.0, 0.0), Vec2::new(0.0, 0.0)),
            (Vec3::new(1.0, -1.0, 0.0), Vec2::new(1.0, 0.0)),
            (Vec3::new(1.0, 1.0, 0.0), Vec2::new(1.0, 1.0)),
            (Vec3::new(-1.0, 1.0, 0.0), Vec2::new(0.0, 1.0)),
        ];
        for (position, uv) in corners {
            mesh.vertices.push(Vertex::new(position, Vec3::Z, uv));
        }
        mesh.indices.extend_from_slice(&[0, 1, 2, 2, 3, 0]);

        mesh
    }

    /// Create a unit cube centered at origin
    pub fn cube() -> Self {
        let mut mesh = Mesh::new("cube");

        // (normal, u axis, v axis) per face
        let faces = [
            (Vec3::Z, Vec3::X, Vec3::Y),
            (-Vec3::Z, -Vec3::X, Vec3::Y),
            (Vec3::X, -Vec3::Z, Vec3::Y),
            (-Vec3::X, Vec3::Z, Vec3::Y),
            (Vec3::Y, Vec3::X, -Vec3::Z),
            (-Vec3::Y, Vec3::X, Vec3::Z),
        ];

        for (face, (normal, u, v)) in faces.into_iter().enumerate() {
            let center = normal * 0.5;
            let corners = [
                (-0.5, -0.5, Vec2::new(0.0, 1.0)),
                (0.5, -0.5, Vec2::new(1.0, 1.0)),
                (0.5, 0.5, Vec2::new(1.0, 0.0)),
                (-0.5, 0.5, Vec2::new(0.0, 0.0)),
            ];
            for (du, dv, uv) in corners {
                mesh.vertices
                    .push(Vertex::new(center + u * du + v * dv, normal, uv));
            }

            let base = face as u32 * 4;
            mesh.indices
                .extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
        }

        mesh
    }
}

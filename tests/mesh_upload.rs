//! Mesh registry uploads into the shared vertex and index arenas.

mod common;

use rstest::rstest;

use common::{auto_backend, create_registry};
use indirect_renderer::backend::dummy::DummyBackend;
use indirect_renderer::backend::{BufferUsage, GpuBackend};
use indirect_renderer::{GpuArena, Mesh, MeshRegistry, RendererError, Vertex};
use std::sync::Arc;

#[test]
fn test_mesh_id_stability() {
    let backend = auto_backend();
    let mut registry = create_registry(&backend, 1 << 16);

    let first = registry.upload_mesh(&Mesh::quad()).unwrap();
    let record = *registry.get(first).unwrap();
    let second = registry.upload_mesh(&Mesh::cube()).unwrap();

    assert_ne!(first, second);
    assert_eq!(*registry.get(first).unwrap(), record);
    assert_eq!(registry.get(second).unwrap().vertex_offset, 4 * Vertex::STRIDE);
    assert_eq!(registry.get(second).unwrap().index_offset, 6 * 4);
}

#[test]
fn test_uploaded_bytes_reach_the_buffer() {
    let backend = auto_backend();
    let mut registry = create_registry(&backend, 1 << 16);
    let quad = Mesh::quad();
    let id = registry.upload_mesh(&quad).unwrap();
    let record = *registry.get(id).unwrap();

    let bytes = backend
        .read_buffer(
            registry.index_buffer(),
            record.index_offset,
            quad.index_bytes().len() as u64,
        )
        .unwrap();
    assert_eq!(bytes, quad.index_bytes());
}

#[rstest]
#[case::vertex_arena_full(4 * Vertex::STRIDE, 1 << 12, "vertex")]
#[case::index_arena_full(1 << 12, 24, "index")]
fn test_out_of_memory_leaves_arenas_untouched(
    #[case] vertex_bytes: u64,
    #[case] index_bytes: u64,
    #[case] full_arena: &str,
) {
    let backend = auto_backend();
    let mut registry = MeshRegistry::new(backend.clone(), vertex_bytes, index_bytes, 16).unwrap();
    registry.upload_mesh(&Mesh::quad()).unwrap();

    let used = (
        registry.vertex_arena().bytes_used(),
        registry.index_arena().bytes_used(),
    );
    match registry.upload_mesh(&Mesh::quad()) {
        Err(RendererError::OutOfMemory { arena, .. }) => assert_eq!(arena, full_arena),
        other => panic!("expected OutOfMemory, got {:?}", other),
    }
    assert_eq!(
        (
            registry.vertex_arena().bytes_used(),
            registry.index_arena().bytes_used()
        ),
        used
    );
    assert_eq!(registry.len(), 1);
}

#[test]
fn test_mesh_capacity() {
    let backend = auto_backend();
    let mut registry = MeshRegistry::new(backend.clone(), 1 << 16, 1 << 16, 2).unwrap();
    registry.upload_mesh(&Mesh::quad()).unwrap();
    registry.upload_mesh(&Mesh::quad()).unwrap();
    assert!(matches!(
        registry.upload_mesh(&Mesh::quad()),
        Err(RendererError::CapacityExceeded { resource: "mesh", capacity: 2 })
    ));
}

/// Offsets are the running sum of earlier sizes until the arena is full.
#[rstest]
#[case(&[16, 32, 48], 128)]
#[case(&[64, 64], 128)]
#[case(&[100, 20, 8, 1], 128)]
fn test_arena_monotonic(#[case] sizes: &[u64], #[case] capacity: u64) {
    let backend = auto_backend();
    let mut arena = GpuArena::new(backend.clone(), capacity, BufferUsage::VERTEX, "test").unwrap();

    let mut expected = 0;
    for &size in sizes {
        if expected + size > capacity {
            let used = arena.bytes_used();
            assert!(arena.allocate(size).is_err());
            assert_eq!(arena.bytes_used(), used);
            return;
        }
        assert_eq!(arena.allocate(size).unwrap(), expected);
        expected += size;
    }
    assert_eq!(arena.bytes_used(), expected);
    assert!(matches!(
        arena.allocate(capacity - expected + 1),
        Err(RendererError::OutOfMemory { arena: "test", .. })
    ));
}

#[test]
fn test_device_memory_exhaustion() {
    common::init_logger();
    let backend = Arc::new(DummyBackend::new().with_memory_budget(1024));
    assert!(MeshRegistry::new(backend.clone(), 512, 256, 4).is_ok());
    assert!(matches!(
        MeshRegistry::new(backend, 4096, 256, 4),
        Err(RendererError::Backend(_))
    ));
}

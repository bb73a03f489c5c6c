//! Instance batching: grouping by mesh and the indirect command list.

mod common;

use glam::{Mat4, Vec3, Vec4};
use rstest::rstest;

use common::{auto_backend, create_registry, create_renderer, ready};
use indirect_renderer::backend::dummy::Command;
use indirect_renderer::backend::GpuBackend;
use indirect_renderer::{
    IndirectDrawCommand, InstanceBatcher, InstanceData, Mesh, MeshId, RendererError,
};

fn translation(x: f32) -> Mat4 {
    Mat4::from_translation(Vec3::new(x, 0.0, 0.0))
}

/// Push sequences given as indices into the uploaded meshes.
#[rstest]
#[case::single_mesh(&[0, 0, 0])]
#[case::interleaved(&[0, 1, 0])]
#[case::alternating(&[0, 1, 0, 1, 0, 1])]
#[case::three_meshes(&[2, 0, 1, 2, 2, 0, 1, 0])]
fn test_batches_are_contiguous(#[case] pushes: &[usize]) {
    let backend = auto_backend();
    let mut registry = create_registry(&backend, 1 << 16);
    let meshes: Vec<MeshId> = (0..3)
        .map(|_| registry.upload_mesh(&Mesh::quad()).unwrap())
        .collect();

    let mut batcher = InstanceBatcher::new(backend.clone(), 2, 64, 8).unwrap();
    for (i, &mesh) in pushes.iter().enumerate() {
        batcher
            .push(&registry, meshes[mesh], translation(i as f32), None)
            .unwrap();
    }
    batcher.build_draw_list(&registry).unwrap();

    let total: u32 = batcher.batches().iter().map(|b| b.instance_count).sum();
    assert_eq!(total as usize, pushes.len());

    let instances = batcher.instances();
    for batch in batcher.batches() {
        let range = batch.first_instance as usize..(batch.first_instance + batch.instance_count) as usize;
        for instance in &instances[range] {
            assert_eq!(instance.mesh_id, batch.mesh_id.raw());
        }
    }

    // Within a batch, instances keep their push order
    for batch in batcher.batches() {
        let xs: Vec<f32> = instances[batch.first_instance as usize..]
            .iter()
            .take(batch.instance_count as usize)
            .map(|instance| instance.transform[3][0])
            .collect();
        assert!(xs.windows(2).all(|w| w[0] < w[1]));
    }
}

#[test]
fn test_interleaved_commands_point_at_batches() {
    let backend = auto_backend();
    let mut registry = create_registry(&backend, 1 << 16);
    let a = registry.upload_mesh(&Mesh::quad()).unwrap();
    let b = registry.upload_mesh(&Mesh::cube()).unwrap();

    let mut batcher = InstanceBatcher::new(backend.clone(), 2, 64, 8).unwrap();
    batcher.push(&registry, a, translation(0.0), None).unwrap();
    batcher.push(&registry, b, translation(1.0), None).unwrap();
    batcher.push(&registry, a, translation(2.0), None).unwrap();

    let commands = batcher.build_draw_list(&registry).unwrap().to_vec();
    assert_eq!(
        commands,
        vec![
            IndirectDrawCommand {
                index_count: 6,
                instance_count: 2,
                first_index: 0,
                vertex_offset: 0,
                first_instance: 0,
            },
            IndirectDrawCommand {
                index_count: 36,
                instance_count: 1,
                first_index: 6,
                vertex_offset: 4,
                first_instance: 2,
            },
        ]
    );
}

/// upload a quad as mesh 0, push it twice, get one batch and one command.
#[test]
fn test_example_scenario() {
    let backend = auto_backend();
    let mut registry = create_registry(&backend, 1 << 16);
    let quad = Mesh::quad();
    assert_eq!(quad.vertex_count(), 4);
    assert_eq!(quad.index_count(), 6);
    let id = registry.upload(&quad.vertices, &quad.indices).unwrap();
    assert_eq!(id.raw(), 0);

    let mut batcher = InstanceBatcher::new(backend.clone(), 2, 64, 8).unwrap();
    batcher.push(&registry, id, translation(1.0), None).unwrap();
    batcher.push(&registry, id, translation(2.0), None).unwrap();

    let commands = batcher.build_draw_list(&registry).unwrap().to_vec();
    assert_eq!(batcher.batches().len(), 1);
    let batch = batcher.batches()[0];
    assert_eq!(batch.mesh_id, id);
    assert_eq!(batch.first_instance, 0);
    assert_eq!(batch.instance_count, 2);

    assert_eq!(commands.len(), 1);
    assert_eq!(commands[0].index_count, 6);
    assert_eq!(commands[0].instance_count, 2);
    assert_eq!(commands[0].first_index, 0);
    assert_eq!(commands[0].first_instance, 0);
}

#[test]
fn test_commit_writes_slot_buffers() {
    let backend = auto_backend();
    let mut registry = create_registry(&backend, 1 << 16);
    let a = registry.upload_mesh(&Mesh::quad()).unwrap();
    let b = registry.upload_mesh(&Mesh::quad()).unwrap();
    let red = Vec4::new(1.0, 0.0, 0.0, 1.0);

    let mut batcher = InstanceBatcher::new(backend.clone(), 2, 64, 8).unwrap();
    batcher.push(&registry, b, translation(0.0), Some(red)).unwrap();
    batcher.push(&registry, a, translation(1.0), None).unwrap();
    let committed = batcher.commit(&registry, 1).unwrap();
    assert_eq!(committed.draw_count, 2);
    assert_eq!(committed.instance_count, 2);
    assert_eq!(Some(committed.instance_buffer), batcher.instance_buffer(1));

    let bytes = backend
        .read_buffer(committed.instance_buffer, 0, 2 * InstanceData::SIZE)
        .unwrap();
    let first: InstanceData = bytemuck::pod_read_unaligned(&bytes[..InstanceData::SIZE as usize]);
    let second: InstanceData = bytemuck::pod_read_unaligned(&bytes[InstanceData::SIZE as usize..]);
    assert_eq!(first.mesh_id, b.raw());
    assert_eq!(first.color, red.to_array());
    assert_eq!(second.mesh_id, a.raw());
    assert_eq!(second.color, [1.0; 4]);

    let stride = IndirectDrawCommand::STRIDE as u64;
    let bytes = backend
        .read_buffer(committed.indirect_buffer, 0, 2 * stride)
        .unwrap();
    let command: IndirectDrawCommand = bytemuck::pod_read_unaligned(&bytes[..stride as usize]);
    assert_eq!(command.first_instance, 0);
    assert_eq!(command.instance_count, 1);
}

#[test]
fn test_capacity_limits() {
    let backend = auto_backend();
    let mut registry = create_registry(&backend, 1 << 16);
    let a = registry.upload_mesh(&Mesh::quad()).unwrap();
    let b = registry.upload_mesh(&Mesh::quad()).unwrap();

    let mut batcher = InstanceBatcher::new(backend.clone(), 1, 2, 1).unwrap();
    batcher.push(&registry, a, Mat4::IDENTITY, None).unwrap();
    assert!(matches!(
        batcher.push(&registry, b, Mat4::IDENTITY, None),
        Err(RendererError::CapacityExceeded { resource: "batch", capacity: 1 })
    ));
    batcher.push(&registry, a, Mat4::IDENTITY, None).unwrap();
    assert!(matches!(
        batcher.push(&registry, a, Mat4::IDENTITY, None),
        Err(RendererError::CapacityExceeded { resource: "instance", capacity: 2 })
    ));
    assert_eq!(batcher.instance_count(), 2);
}

#[test]
fn test_renderer_issues_one_indirect_draw() {
    let backend = auto_backend();
    let mut renderer = create_renderer(&backend);
    let quad = renderer.upload_mesh(&Mesh::quad()).unwrap();
    let cube = renderer.upload_mesh(&Mesh::cube()).unwrap();

    let frame = ready(renderer.begin_frame().unwrap());
    for i in 0..10 {
        let mesh = if i % 3 == 0 { cube } else { quad };
        renderer.push_instance(mesh, translation(i as f32), None).unwrap();
    }
    renderer.draw(&frame).unwrap();
    renderer.end_frame(frame).unwrap();

    let submissions = backend.submissions();
    let draws: Vec<&Command> = submissions[0]
        .commands
        .iter()
        .filter(|c| matches!(c, Command::DrawIndexedIndirect { .. }))
        .collect();
    assert_eq!(draws.len(), 1);
    assert!(matches!(
        draws[0],
        Command::DrawIndexedIndirect { draw_count: 2, .. }
    ));
    assert_eq!(renderer.stats().last_instance_count, 10);
}

//! Shared setup for the integration tests.
//!
//! Everything runs on the dummy backend, which models the GPU as a queue of
//! submissions that only retire when a test says so.

#![allow(dead_code)]

use std::sync::Arc;

use indirect_renderer::backend::dummy::DummyBackend;
use indirect_renderer::shader::SPIRV_MAGIC;
use indirect_renderer::{
    Extent2d, FrameHandle, FrameStatus, FrameSynchronizer, MeshRegistry, PresentPolicy, Renderer,
    RendererConfig, ShaderSet, SurfaceManager, TextureFormat,
};

pub const WINDOW: Extent2d = Extent2d::new(800, 600);

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A dummy backend whose fences only signal on `complete_submissions`.
pub fn manual_backend() -> Arc<DummyBackend> {
    init_logger();
    Arc::new(DummyBackend::new().with_window_extent(WINDOW))
}

/// A dummy backend that retires every submission immediately.
pub fn auto_backend() -> Arc<DummyBackend> {
    init_logger();
    Arc::new(
        DummyBackend::new()
            .with_window_extent(WINDOW)
            .with_auto_complete(true),
    )
}

pub fn create_synchronizer(backend: &Arc<DummyBackend>, frames_in_flight: usize) -> FrameSynchronizer {
    let surface = SurfaceManager::create(
        backend.clone(),
        WINDOW,
        TextureFormat::Bgra8UnormSrgb,
        PresentPolicy::Vsync,
    )
    .expect("surface");
    FrameSynchronizer::new(backend.clone(), surface, frames_in_flight, WINDOW, [0.0; 4])
        .expect("synchronizer")
}

pub fn create_registry(backend: &Arc<DummyBackend>, arena_bytes: u64) -> MeshRegistry {
    MeshRegistry::new(backend.clone(), arena_bytes, arena_bytes, 16).expect("registry")
}

/// Shader words that pass the SPIR-V header check.
pub fn test_shaders() -> ShaderSet {
    ShaderSet {
        vertex: vec![SPIRV_MAGIC, 0x0001_0300, 0, 1, 0],
        fragment: vec![SPIRV_MAGIC, 0x0001_0300, 0, 1, 0],
    }
}

pub fn create_renderer(backend: &Arc<DummyBackend>) -> Renderer {
    let config = RendererConfig::default()
        .with_arena_sizes(1 << 16, 1 << 16)
        .with_capacities(16, 256, 16);
    Renderer::with_backend(backend.clone(), WINDOW, &config, &test_shaders()).expect("renderer")
}

pub fn ready(status: FrameStatus) -> FrameHandle {
    match status {
        FrameStatus::Ready(frame) => frame,
        FrameStatus::Skipped => panic!("frame unexpectedly skipped"),
    }
}

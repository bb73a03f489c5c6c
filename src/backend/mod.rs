//! Backend abstraction layer
//!
//! The renderer is written against [`GpuBackend`]. Two implementations exist:
//! a native Vulkan backend (ash + gpu-allocator, feature `vulkan`) and a
//! headless dummy backend that models the GPU as a queue the caller drains.

pub mod dummy;
pub mod error;
pub mod traits;
pub mod types;

#[cfg(feature = "vulkan")]
pub mod vulkan;

pub use error::*;
pub use traits::*;
pub use types::*;

use crate::{BackendType, RendererConfig, RendererResult};
use std::sync::Arc;
use winit::window::Window;

/// Create the backend requested by `config`, falling back to the dummy backend.
pub fn create_backend(
    window: &Window,
    config: &RendererConfig,
) -> RendererResult<Arc<dyn GpuBackend>> {
    let size = window.inner_size();

    if config.backend == BackendType::Vulkan {
        #[cfg(feature = "vulkan")]
        {
            match vulkan::VulkanBackend::new(window) {
                Ok(backend) => {
                    log::info!("Using Vulkan backend (ash)");
                    return Ok(Arc::new(backend));
                }
                Err(e) => {
                    log::warn!("Failed to create Vulkan backend: {}", e);
                }
            }
        }

        #[cfg(not(feature = "vulkan"))]
        log::warn!("Vulkan backend requested but the `vulkan` feature is disabled");
    }

    log::info!("Using dummy backend");
    Ok(Arc::new(
        dummy::DummyBackend::new()
            .with_window_extent(Extent2d::new(size.width, size.height))
            .with_auto_complete(true),
    ))
}

/// Check if a real GPU backend is compiled in.
pub fn has_gpu_backend() -> bool {
    cfg!(feature = "vulkan")
}

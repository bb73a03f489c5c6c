use thiserror::Error;

/// Backend error type
///
/// Out-of-date or suboptimal surfaces are not errors; they are reported as
/// [`AcquiredImage::Stale`](super::AcquiredImage::Stale) and
/// [`PresentStatus::Stale`](super::PresentStatus::Stale).
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Failed to initialize backend: {0}")]
    InitializationFailed(String),
    #[error("No suitable physical device found")]
    NoSuitableDevice,
    #[error("Failed to create surface: {0}")]
    SurfaceCreationFailed(String),
    #[error("Failed to create swapchain: {0}")]
    SwapchainCreationFailed(String),
    #[error("Failed to create buffer: {0}")]
    BufferCreationFailed(String),
    #[error("Failed to create shader module: {0}")]
    ShaderModuleCreationFailed(String),
    #[error("Failed to create pipeline: {0}")]
    PipelineCreationFailed(String),
    #[error("Invalid {0} handle")]
    InvalidHandle(&'static str),
    #[error("Access of {size} bytes at offset {offset} exceeds buffer of {capacity} bytes")]
    OutOfBounds { offset: u64, size: u64, capacity: u64 },
    #[error("Out of device memory")]
    OutOfMemory,
    #[error("Device lost")]
    DeviceLost,
    #[error("Vulkan error: {0}")]
    Vulkan(String),
}

pub type BackendResult<T> = Result<T, BackendError>;

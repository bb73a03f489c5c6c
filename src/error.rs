//! Renderer error type

use std::path::PathBuf;
use thiserror::Error;

use crate::backend::BackendError;

/// Errors returned by every public renderer operation.
///
/// A stale surface is never reported here: acquire/present staleness is
/// handled by recreating the surface and skipping the frame.
#[derive(Error, Debug)]
pub enum RendererError {
    /// An arena could not fit the requested allocation.
    #[error("{arena} arena out of memory: requested {requested} bytes, {available} available")]
    OutOfMemory {
        arena: &'static str,
        requested: u64,
        available: u64,
    },

    /// A fixed capacity (meshes, instances, batches) was exceeded.
    #[error("{resource} capacity of {capacity} exceeded")]
    CapacityExceeded {
        resource: &'static str,
        capacity: usize,
    },

    /// Unknown mesh id, stale surface generation, or a frame used out of order.
    #[error("Invalid handle: {0}")]
    InvalidHandle(String),

    #[error("Device lost")]
    DeviceLost,

    #[error("Shader not found: {}", .0.display())]
    ShaderNotFound(PathBuf),

    #[error("Invalid shader: {0}")]
    InvalidShader(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Window error: {0}")]
    Window(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Backend error: {0}")]
    Backend(BackendError),
}

impl From<BackendError> for RendererError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::DeviceLost => RendererError::DeviceLost,
            other => RendererError::Backend(other),
        }
    }
}

pub type RendererResult<T> = Result<T, RendererError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_lost_is_lifted() {
        let err: RendererError = BackendError::DeviceLost.into();
        assert!(matches!(err, RendererError::DeviceLost));

        let err: RendererError = BackendError::OutOfMemory.into();
        assert!(matches!(err, RendererError::Backend(BackendError::OutOfMemory)));
    }

    #[test]
    fn test_error_messages() {
        let err = RendererError::OutOfMemory {
            arena: "vertex",
            requested: 64,
            available: 16,
        };
        assert_eq!(
            err.to_string(),
            "vertex arena out of memory: requested 64 bytes, 16 available"
        );

        let err = RendererError::CapacityExceeded {
            resource: "instance",
            capacity: 4,
        };
        assert_eq!(err.to_string(), "instance capacity of 4 exceeded");
    }
}

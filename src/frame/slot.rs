//! Per-slot synchronization objects

use crate::backend::{CommandBufferHandle, FenceHandle, GpuBackend, SemaphoreHandle};
use crate::error::RendererResult;

/// Where a slot is in the frame protocol.
///
/// ```text
/// Idle ──begin_frame──► Acquiring ──image ready──► Recording ──end_frame──► Submitted
///  ▲                        │                                                  │
///  └────── surface stale ───┘◄──────────────── fence signaled ─────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    Acquiring,
    Recording,
    /// GPU work is queued; the submit fence has not been observed signaled.
    Submitted,
}

/// One frame-in-flight slot.
///
/// The submit fence is only waited on while the slot is [`SlotState::Submitted`].
/// A slot abandoned mid-frame (surface recreated under it) goes back to `Idle`
/// with its fence unsignaled, which is exactly what the next submit requires.
#[derive(Debug)]
pub struct FrameSlot {
    pub(crate) command_buffer: CommandBufferHandle,
    pub(crate) submit_fence: FenceHandle,
    pub(crate) acquire_semaphore: SemaphoreHandle,
    pub(crate) present_semaphore: SemaphoreHandle,
    pub(crate) state: SlotState,
    /// Frame number of the last frame begun in this slot.
    pub(crate) frame_number: u64,
}

impl FrameSlot {
    pub(crate) fn new(backend: &dyn GpuBackend) -> RendererResult<Self> {
        Ok(Self {
            command_buffer: backend.allocate_command_buffer()?,
            submit_fence: backend.create_fence(true)?,
            acquire_semaphore: backend.create_semaphore()?,
            present_semaphore: backend.create_semaphore()?,
            state: SlotState::Idle,
            frame_number: 0,
        })
    }

    /// Replace both semaphores. Only valid while the device is idle.
    pub(crate) fn recreate_semaphores(&mut self, backend: &dyn GpuBackend) -> RendererResult<()> {
        backend.destroy_semaphore(self.acquire_semaphore);
        backend.destroy_semaphore(self.present_semaphore);
        self.acquire_semaphore = backend.create_semaphore()?;
        self.present_semaphore = backend.create_semaphore()?;
        Ok(())
    }

    pub(crate) fn destroy(&self, backend: &dyn GpuBackend) {
        backend.free_command_buffer(self.command_buffer);
        backend.destroy_fence(self.submit_fence);
        backend.destroy_semaphore(self.acquire_semaphore);
        backend.destroy_semaphore(self.present_semaphore);
    }

    pub fn state(&self) -> SlotState {
        self.state
    }

    pub fn command_buffer(&self) -> CommandBufferHandle {
        self.command_buffer
    }

    pub fn submit_fence(&self) -> FenceHandle {
        self.submit_fence
    }
}

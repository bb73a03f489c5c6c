//! The GPU seam
//!
//! Every component of the renderer talks to the device through [`GpuBackend`].
//! Implementations use interior mutability so a single `Arc<dyn GpuBackend>` can
//! be shared by the arenas, the surface manager and the frame synchronizer.

use crate::backend::error::BackendResult;
use crate::backend::types::*;
use std::time::Duration;

macro_rules! handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(pub(crate) u64);

        impl $name {
            /// Raw backend id, for logging.
            pub fn raw(&self) -> u64 {
                self.0
            }
        }
    };
}

handle!(
    /// Handle to a GPU buffer
    BufferHandle
);
handle!(
    /// Handle to a CPU/GPU fence
    FenceHandle
);
handle!(
    /// Handle to a GPU/GPU semaphore
    SemaphoreHandle
);
handle!(
    /// Handle to a primary command buffer
    CommandBufferHandle
);
handle!(
    /// Handle to a swapchain
    SwapchainHandle
);
handle!(
    /// Handle to a swapchain image
    ImageHandle
);
handle!(
    /// Handle to an image view
    ImageViewHandle
);
handle!(
    /// Handle to a graphics pipeline
    PipelineHandle
);
handle!(
    /// Handle to a descriptor set with the fixed camera/instance layout
    BindGroupHandle
);

/// The device operations the renderer needs.
pub trait GpuBackend: Send + Sync + 'static {
    /// Human readable backend name
    fn name(&self) -> &'static str;

    // === Buffers ===

    fn create_buffer(&self, descriptor: &BufferDescriptor) -> BackendResult<BufferHandle>;
    /// Copy `data` into a host-visible buffer at `offset`.
    fn write_buffer(&self, buffer: BufferHandle, offset: u64, data: &[u8]) -> BackendResult<()>;
    /// Read back `size` bytes of a host-visible buffer.
    fn read_buffer(&self, buffer: BufferHandle, offset: u64, size: u64) -> BackendResult<Vec<u8>>;
    fn destroy_buffer(&self, buffer: BufferHandle);

    // === Synchronization ===

    fn create_fence(&self, signaled: bool) -> BackendResult<FenceHandle>;
    /// Block until the fence is signaled. No timeout.
    fn wait_fence(&self, fence: FenceHandle) -> BackendResult<()>;
    /// Returns `true` if the fence signaled before the timeout elapsed.
    fn wait_fence_timeout(&self, fence: FenceHandle, timeout: Duration) -> BackendResult<bool>;
    fn is_fence_signaled(&self, fence: FenceHandle) -> BackendResult<bool>;
    fn reset_fence(&self, fence: FenceHandle) -> BackendResult<()>;
    fn destroy_fence(&self, fence: FenceHandle);
    fn create_semaphore(&self) -> BackendResult<SemaphoreHandle>;
    fn destroy_semaphore(&self, semaphore: SemaphoreHandle);
    /// Wait until all submitted work has completed.
    fn wait_idle(&self) -> BackendResult<()>;

    // === Command recording ===

    fn allocate_command_buffer(&self) -> BackendResult<CommandBufferHandle>;
    fn free_command_buffer(&self, cmd: CommandBufferHandle);
    fn reset_command_buffer(&self, cmd: CommandBufferHandle) -> BackendResult<()>;
    fn begin_command_buffer(&self, cmd: CommandBufferHandle) -> BackendResult<()>;
    fn end_command_buffer(&self, cmd: CommandBufferHandle) -> BackendResult<()>;
    fn cmd_transition_image(
        &self,
        cmd: CommandBufferHandle,
        image: ImageHandle,
        old_layout: ImageLayout,
        new_layout: ImageLayout,
    );
    fn cmd_begin_rendering(
        &self,
        cmd: CommandBufferHandle,
        view: ImageViewHandle,
        extent: Extent2d,
        clear: [f32; 4],
    );
    fn cmd_end_rendering(&self, cmd: CommandBufferHandle);
    fn cmd_set_viewport(&self, cmd: CommandBufferHandle, extent: Extent2d);
    fn cmd_set_scissor(&self, cmd: CommandBufferHandle, extent: Extent2d);
    fn cmd_bind_pipeline(&self, cmd: CommandBufferHandle, pipeline: PipelineHandle);
    fn cmd_bind_group(
        &self,
        cmd: CommandBufferHandle,
        pipeline: PipelineHandle,
        group: BindGroupHandle,
    );
    fn cmd_bind_vertex_buffer(&self, cmd: CommandBufferHandle, buffer: BufferHandle, offset: u64);
    fn cmd_bind_index_buffer(
        &self,
        cmd: CommandBufferHandle,
        buffer: BufferHandle,
        offset: u64,
        format: IndexFormat,
    );
    fn cmd_draw_indexed_indirect(
        &self,
        cmd: CommandBufferHandle,
        buffer: BufferHandle,
        offset: u64,
        draw_count: u32,
        stride: u32,
    );

    // === Queue ===

    fn submit(&self, info: &SubmitInfo) -> BackendResult<()>;

    // === Surface ===

    fn surface_capabilities(&self) -> BackendResult<SurfaceCapabilities>;
    fn surface_formats(&self) -> BackendResult<Vec<SurfaceFormat>>;
    fn present_modes(&self) -> BackendResult<Vec<PresentMode>>;
    fn create_swapchain(&self, descriptor: &SwapchainDescriptor) -> BackendResult<SwapchainHandle>;
    fn swapchain_images(&self, swapchain: SwapchainHandle) -> BackendResult<Vec<ImageHandle>>;
    fn destroy_swapchain(&self, swapchain: SwapchainHandle);
    fn create_image_view(
        &self,
        image: ImageHandle,
        format: TextureFormat,
    ) -> BackendResult<ImageViewHandle>;
    fn destroy_image_view(&self, view: ImageViewHandle);
    /// Acquire the next presentable image, signaling `semaphore` when it is ready.
    fn acquire_next_image(
        &self,
        swapchain: SwapchainHandle,
        semaphore: SemaphoreHandle,
    ) -> BackendResult<AcquiredImage>;
    fn present(
        &self,
        swapchain: SwapchainHandle,
        image_index: u32,
        wait_semaphore: SemaphoreHandle,
    ) -> BackendResult<PresentStatus>;

    // === Pipelines ===

    fn create_pipeline(&self, descriptor: &PipelineDescriptor) -> BackendResult<PipelineHandle>;
    fn destroy_pipeline(&self, pipeline: PipelineHandle);
    /// Descriptor set with binding 0 = `uniform`, binding 1 = `storage`.
    fn create_bind_group(
        &self,
        pipeline: PipelineHandle,
        uniform: BufferHandle,
        storage: BufferHandle,
    ) -> BackendResult<BindGroupHandle>;
    fn destroy_bind_group(&self, group: BindGroupHandle);
}

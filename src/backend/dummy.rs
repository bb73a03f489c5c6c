//! Dummy GPU backend for testing and development.
//!
//! This backend doesn't perform actual GPU operations. Buffers live in host
//! memory, recorded commands are kept in an inspectable log, and the "GPU" is a
//! queue of submitted fences that only signal when the owner calls
//! [`DummyBackend::complete_submissions`] (or immediately, in auto-complete mode).

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::error::{BackendError, BackendResult};
use super::traits::*;
use super::types::*;

/// A command recorded into a dummy command buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    TransitionImage {
        image: ImageHandle,
        old_layout: ImageLayout,
        new_layout: ImageLayout,
    },
    BeginRendering {
        view: ImageViewHandle,
        extent: Extent2d,
        clear: [f32; 4],
    },
    EndRendering,
    SetViewport(Extent2d),
    SetScissor(Extent2d),
    BindPipeline(PipelineHandle),
    BindGroup(BindGroupHandle),
    BindVertexBuffer {
        buffer: BufferHandle,
        offset: u64,
    },
    BindIndexBuffer {
        buffer: BufferHandle,
        offset: u64,
        format: IndexFormat,
    },
    DrawIndexedIndirect {
        buffer: BufferHandle,
        offset: u64,
        draw_count: u32,
        stride: u32,
    },
}

/// A submission as the dummy queue saw it.
#[derive(Debug, Clone)]
pub struct Submission {
    pub command_buffer: CommandBufferHandle,
    pub commands: Vec<Command>,
    pub wait_semaphore: Option<SemaphoreHandle>,
    pub signal_semaphore: Option<SemaphoreHandle>,
    pub fence: Option<FenceHandle>,
}

#[derive(Default)]
struct CommandBufferState {
    recording: bool,
    commands: Vec<Command>,
}

struct SwapchainState {
    descriptor: SwapchainDescriptor,
    images: Vec<ImageHandle>,
    next_image: u32,
}

struct DummyState {
    next_id: u64,
    buffers: HashMap<u64, Vec<u8>>,
    memory_used: u64,
    memory_budget: Option<u64>,
    fences: HashMap<u64, bool>,
    semaphores: HashMap<u64, bool>,
    command_buffers: HashMap<u64, CommandBufferState>,
    swapchains: HashMap<u64, SwapchainState>,
    views: HashMap<u64, ImageHandle>,
    pipelines: HashMap<u64, PipelineDescriptor>,
    bind_groups: HashMap<u64, (BufferHandle, BufferHandle)>,
    pending: VecDeque<FenceHandle>,
    submissions: Vec<Submission>,
    presents: Vec<u32>,
    capabilities: SurfaceCapabilities,
    window_extent: Extent2d,
    formats: Vec<SurfaceFormat>,
    present_modes: Vec<PresentMode>,
    stale_acquires: u32,
    stale_presents: u32,
    failing_write: Option<u32>,
    idle_waits: u32,
    auto_complete: bool,
    device_lost: bool,
}

/// `offset..offset + size` if it lies inside a buffer of `len` bytes.
fn byte_range(offset: u64, size: u64, len: usize) -> Option<std::ops::Range<usize>> {
    let end = offset.checked_add(size)?;
    if end > len as u64 {
        return None;
    }
    Some(offset as usize..end as usize)
}

impl DummyState {
    fn alloc_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn check_device(&self) -> BackendResult<()> {
        if self.device_lost {
            Err(BackendError::DeviceLost)
        } else {
            Ok(())
        }
    }

    fn record(&mut self, cmd: CommandBufferHandle, command: Command) {
        match self.command_buffers.get_mut(&cmd.0) {
            Some(state) if state.recording => state.commands.push(command),
            Some(_) => log::warn!("DummyBackend: {:?} recorded outside begin/end", command),
            None => log::warn!("DummyBackend: {:?} recorded into unknown command buffer", command),
        }
    }

    /// Extent the surface wants right now, already clamped.
    fn surface_extent(&self) -> Extent2d {
        let caps = &self.capabilities;
        if caps.current_extent.is_follow_window() {
            self.window_extent
                .clamp(caps.min_image_extent, caps.max_image_extent)
        } else {
            caps.current_extent
        }
    }

    fn retire(&mut self, fence: FenceHandle) {
        if let Some(signaled) = self.fences.get_mut(&fence.0) {
            *signaled = true;
        }
    }
}

/// Dummy GPU backend.
pub struct DummyBackend {
    state: Mutex<DummyState>,
    fence_signaled: Condvar,
}

impl DummyBackend {
    /// Create a new dummy backend with an 800x600 surface.
    pub fn new() -> Self {
        let extent = Extent2d::new(800, 600);
        Self {
            state: Mutex::new(DummyState {
                next_id: 0,
                buffers: HashMap::new(),
                memory_used: 0,
                memory_budget: None,
                fences: HashMap::new(),
                semaphores: HashMap::new(),
                command_buffers: HashMap::new(),
                swapchains: HashMap::new(),
                views: HashMap::new(),
                pipelines: HashMap::new(),
                bind_groups: HashMap::new(),
                pending: VecDeque::new(),
                submissions: Vec::new(),
                presents: Vec::new(),
                capabilities: SurfaceCapabilities {
                    current_extent: extent,
                    min_image_extent: Extent2d::new(1, 1),
                    max_image_extent: Extent2d::new(16384, 16384),
                    min_image_count: 2,
                    max_image_count: 8,
                },
                window_extent: extent,
                formats: vec![
                    SurfaceFormat::new(TextureFormat::Bgra8Unorm),
                    SurfaceFormat::new(TextureFormat::Bgra8UnormSrgb),
                ],
                present_modes: vec![PresentMode::Fifo, PresentMode::Mailbox],
                stale_acquires: 0,
                stale_presents: 0,
                failing_write: None,
                idle_waits: 0,
                auto_complete: false,
                device_lost: false,
            }),
            fence_signaled: Condvar::new(),
        }
    }

    /// Signal fences as soon as their submission arrives.
    pub fn with_auto_complete(self, auto_complete: bool) -> Self {
        self.state.lock().auto_complete = auto_complete;
        self
    }

    pub fn with_capabilities(self, capabilities: SurfaceCapabilities) -> Self {
        self.state.lock().capabilities = capabilities;
        self
    }

    pub fn with_formats(self, formats: Vec<SurfaceFormat>) -> Self {
        self.state.lock().formats = formats;
        self
    }

    pub fn with_present_modes(self, present_modes: Vec<PresentMode>) -> Self {
        self.state.lock().present_modes = present_modes;
        self
    }

    /// Fail buffer creation once this many bytes are live.
    pub fn with_memory_budget(self, bytes: u64) -> Self {
        self.state.lock().memory_budget = Some(bytes);
        self
    }

    /// Set the window's pixel size. The surface extent follows it.
    pub fn with_window_extent(self, extent: Extent2d) -> Self {
        self.set_window_extent(extent);
        self
    }

    /// Resize the modelled window.
    ///
    /// Unless the surface reports [`Extent2d::FOLLOW_WINDOW`], its current
    /// extent changes too, which makes the next acquire report `Stale`.
    pub fn set_window_extent(&self, extent: Extent2d) {
        let mut state = self.state.lock();
        state.window_extent = extent;
        if !state.capabilities.current_extent.is_follow_window() {
            state.capabilities.current_extent = extent;
        }
    }

    /// Report the next `count` acquires as out of date.
    pub fn inject_stale_acquire(&self, count: u32) {
        self.state.lock().stale_acquires += count;
    }

    /// Report the next `count` presents as out of date.
    pub fn inject_stale_present(&self, count: u32) {
        self.state.lock().stale_presents += count;
    }

    /// Let `successes` more buffer writes through, then fail one with `DeviceLost`.
    pub fn inject_write_failure(&self, successes: u32) {
        self.state.lock().failing_write = Some(successes);
    }

    /// Every subsequent wait, submit and present fails with `DeviceLost`.
    pub fn lose_device(&self) {
        self.state.lock().device_lost = true;
        self.fence_signaled.notify_all();
    }

    /// Retire every pending submission, signaling its fence.
    ///
    /// Returns the number of submissions retired.
    pub fn complete_submissions(&self) -> usize {
        let mut state = self.state.lock();
        let count = state.pending.len();
        while let Some(fence) = state.pending.pop_front() {
            state.retire(fence);
        }
        drop(state);
        self.fence_signaled.notify_all();
        count
    }

    /// Retire the oldest pending submission.
    pub fn complete_next_submission(&self) -> bool {
        let mut state = self.state.lock();
        let Some(fence) = state.pending.pop_front() else {
            return false;
        };
        state.retire(fence);
        drop(state);
        self.fence_signaled.notify_all();
        true
    }

    /// Submissions not yet retired.
    pub fn pending_submissions(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Every submission seen so far, oldest first.
    pub fn submissions(&self) -> Vec<Submission> {
        self.state.lock().submissions.clone()
    }

    /// Image indices presented so far.
    pub fn presents(&self) -> Vec<u32> {
        self.state.lock().presents.clone()
    }

    /// Number of `wait_idle` calls.
    pub fn idle_waits(&self) -> u32 {
        self.state.lock().idle_waits
    }

    /// Number of live swapchains.
    pub fn live_swapchains(&self) -> usize {
        self.state.lock().swapchains.len()
    }

    /// Number of live image views.
    pub fn live_image_views(&self) -> usize {
        self.state.lock().views.len()
    }

    /// Number of live buffers.
    pub fn live_buffers(&self) -> usize {
        self.state.lock().buffers.len()
    }

    /// Descriptor of a live swapchain.
    pub fn swapchain_descriptor(&self, swapchain: SwapchainHandle) -> Option<SwapchainDescriptor> {
        self.state
            .lock()
            .swapchains
            .get(&swapchain.0)
            .map(|s| s.descriptor)
    }
}

impl Default for DummyBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuBackend for DummyBackend {
    fn name(&self) -> &'static str {
        "Dummy Backend"
    }

    fn create_buffer(&self, descriptor: &BufferDescriptor) -> BackendResult<BufferHandle> {
        if descriptor.size == 0 {
            return Err(BackendError::BufferCreationFailed(
                "zero-sized buffer".to_string(),
            ));
        }
        let mut state = self.state.lock();
        if let Some(budget) = state.memory_budget {
            if state.memory_used + descriptor.size > budget {
                return Err(BackendError::OutOfMemory);
            }
        }
        let id = state.alloc_id();
        state.buffers.insert(id, vec![0; descriptor.size as usize]);
        state.memory_used += descriptor.size;
        log::trace!(
            "DummyBackend: creating buffer {:?} (size: {})",
            descriptor.label,
            descriptor.size
        );
        Ok(BufferHandle(id))
    }

    fn write_buffer(&self, buffer: BufferHandle, offset: u64, data: &[u8]) -> BackendResult<()> {
        let mut state = self.state.lock();
        match state.failing_write {
            Some(0) => {
                state.failing_write = None;
                return Err(BackendError::DeviceLost);
            }
            Some(remaining) => state.failing_write = Some(remaining - 1),
            None => {}
        }
        let storage = state
            .buffers
            .get_mut(&buffer.0)
            .ok_or(BackendError::InvalidHandle("buffer"))?;
        let range = byte_range(offset, data.len() as u64, storage.len()).ok_or(
            BackendError::OutOfBounds {
                offset,
                size: data.len() as u64,
                capacity: storage.len() as u64,
            },
        )?;
        storage[range].copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(&self, buffer: BufferHandle, offset: u64, size: u64) -> BackendResult<Vec<u8>> {
        let state = self.state.lock();
        let storage = state
            .buffers
            .get(&buffer.0)
            .ok_or(BackendError::InvalidHandle("buffer"))?;
        let range = byte_range(offset, size, storage.len()).ok_or(BackendError::OutOfBounds {
            offset,
            size,
            capacity: storage.len() as u64,
        })?;
        Ok(storage[range].to_vec())
    }

    fn destroy_buffer(&self, buffer: BufferHandle) {
        let mut state = self.state.lock();
        if let Some(storage) = state.buffers.remove(&buffer.0) {
            state.memory_used -= storage.len() as u64;
        }
    }

    fn create_fence(&self, signaled: bool) -> BackendResult<FenceHandle> {
        let mut state = self.state.lock();
        let id = state.alloc_id();
        state.fences.insert(id, signaled);
        Ok(FenceHandle(id))
    }

    fn wait_fence(&self, fence: FenceHandle) -> BackendResult<()> {
        let mut state = self.state.lock();
        loop {
            state.check_device()?;
            match state.fences.get(&fence.0).copied() {
                Some(true) => return Ok(()),
                Some(false) => self.fence_signaled.wait(&mut state),
                None => return Err(BackendError::InvalidHandle("fence")),
            }
        }
    }

    fn wait_fence_timeout(&self, fence: FenceHandle, timeout: Duration) -> BackendResult<bool> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            state.check_device()?;
            match state.fences.get(&fence.0).copied() {
                Some(true) => return Ok(true),
                Some(false) => {
                    if self
                        .fence_signaled
                        .wait_until(&mut state, deadline)
                        .timed_out()
                    {
                        return Ok(state.fences.get(&fence.0).copied().unwrap_or(false));
                    }
                }
                None => return Err(BackendError::InvalidHandle("fence")),
            }
        }
    }

    fn is_fence_signaled(&self, fence: FenceHandle) -> BackendResult<bool> {
        let state = self.state.lock();
        state.check_device()?;
        state
            .fences
            .get(&fence.0)
            .copied()
            .ok_or(BackendError::InvalidHandle("fence"))
    }

    fn reset_fence(&self, fence: FenceHandle) -> BackendResult<()> {
        let mut state = self.state.lock();
        let signaled = state
            .fences
            .get_mut(&fence.0)
            .ok_or(BackendError::InvalidHandle("fence"))?;
        *signaled = false;
        Ok(())
    }

    fn destroy_fence(&self, fence: FenceHandle) {
        self.state.lock().fences.remove(&fence.0);
    }

    fn create_semaphore(&self) -> BackendResult<SemaphoreHandle> {
        let mut state = self.state.lock();
        let id = state.alloc_id();
        state.semaphores.insert(id, false);
        Ok(SemaphoreHandle(id))
    }

    fn destroy_semaphore(&self, semaphore: SemaphoreHandle) {
        self.state.lock().semaphores.remove(&semaphore.0);
    }

    fn wait_idle(&self) -> BackendResult<()> {
        let mut state = self.state.lock();
        state.check_device()?;
        state.idle_waits += 1;
        // A real device always drains eventually.
        while let Some(fence) = state.pending.pop_front() {
            state.retire(fence);
        }
        drop(state);
        self.fence_signaled.notify_all();
        Ok(())
    }

    fn allocate_command_buffer(&self) -> BackendResult<CommandBufferHandle> {
        let mut state = self.state.lock();
        let id = state.alloc_id();
        state
            .command_buffers
            .insert(id, CommandBufferState::default());
        Ok(CommandBufferHandle(id))
    }

    fn free_command_buffer(&self, cmd: CommandBufferHandle) {
        self.state.lock().command_buffers.remove(&cmd.0);
    }

    fn reset_command_buffer(&self, cmd: CommandBufferHandle) -> BackendResult<()> {
        let mut state = self.state.lock();
        let buffer = state
            .command_buffers
            .get_mut(&cmd.0)
            .ok_or(BackendError::InvalidHandle("command buffer"))?;
        buffer.recording = false;
        buffer.commands.clear();
        Ok(())
    }

    fn begin_command_buffer(&self, cmd: CommandBufferHandle) -> BackendResult<()> {
        let mut state = self.state.lock();
        let buffer = state
            .command_buffers
            .get_mut(&cmd.0)
            .ok_or(BackendError::InvalidHandle("command buffer"))?;
        buffer.recording = true;
        Ok(())
    }

    fn end_command_buffer(&self, cmd: CommandBufferHandle) -> BackendResult<()> {
        let mut state = self.state.lock();
        let buffer = state
            .command_buffers
            .get_mut(&cmd.0)
            .ok_or(BackendError::InvalidHandle("command buffer"))?;
        buffer.recording = false;
        Ok(())
    }

    fn cmd_transition_image(
        &self,
        cmd: CommandBufferHandle,
        image: ImageHandle,
        old_layout: ImageLayout,
        new_layout: ImageLayout,
    ) {
        self.state.lock().record(
            cmd,
            Command::TransitionImage {
                image,
                old_layout,
                new_layout,
            },
        );
    }

    fn cmd_begin_rendering(
        &self,
        cmd: CommandBufferHandle,
        view: ImageViewHandle,
        extent: Extent2d,
        clear: [f32; 4],
    ) {
        self.state.lock().record(
            cmd,
            Command::BeginRendering {
                view,
                extent,
                clear,
            },
        );
    }

    fn cmd_end_rendering(&self, cmd: CommandBufferHandle) {
        self.state.lock().record(cmd, Command::EndRendering);
    }

    fn cmd_set_viewport(&self, cmd: CommandBufferHandle, extent: Extent2d) {
        self.state.lock().record(cmd, Command::SetViewport(extent));
    }

    fn cmd_set_scissor(&self, cmd: CommandBufferHandle, extent: Extent2d) {
        self.state.lock().record(cmd, Command::SetScissor(extent));
    }

    fn cmd_bind_pipeline(&self, cmd: CommandBufferHandle, pipeline: PipelineHandle) {
        self.state.lock().record(cmd, Command::BindPipeline(pipeline));
    }

    fn cmd_bind_group(
        &self,
        cmd: CommandBufferHandle,
        _pipeline: PipelineHandle,
        group: BindGroupHandle,
    ) {
        self.state.lock().record(cmd, Command::BindGroup(group));
    }

    fn cmd_bind_vertex_buffer(&self, cmd: CommandBufferHandle, buffer: BufferHandle, offset: u64) {
        self.state
            .lock()
            .record(cmd, Command::BindVertexBuffer { buffer, offset });
    }

    fn cmd_bind_index_buffer(
        &self,
        cmd: CommandBufferHandle,
        buffer: BufferHandle,
        offset: u64,
        format: IndexFormat,
    ) {
        self.state.lock().record(
            cmd,
            Command::BindIndexBuffer {
                buffer,
                offset,
                format,
            },
        );
    }

    fn cmd_draw_indexed_indirect(
        &self,
        cmd: CommandBufferHandle,
        buffer: BufferHandle,
        offset: u64,
        draw_count: u32,
        stride: u32,
    ) {
        self.state.lock().record(
            cmd,
            Command::DrawIndexedIndirect {
                buffer,
                offset,
                draw_count,
                stride,
            },
        );
    }

    fn submit(&self, info: &SubmitInfo) -> BackendResult<()> {
        let mut state = self.state.lock();
        state.check_device()?;

        let commands = match state.command_buffers.get(&info.command_buffer.0) {
            Some(buffer) if !buffer.recording => buffer.commands.clone(),
            Some(_) => return Err(BackendError::Vulkan("command buffer still recording".into())),
            None => return Err(BackendError::InvalidHandle("command buffer")),
        };

        if let Some(wait) = info.wait_semaphore {
            match state.semaphores.get_mut(&wait.0) {
                Some(signaled) => *signaled = false,
                None => return Err(BackendError::InvalidHandle("semaphore")),
            }
        }
        if let Some(signal) = info.signal_semaphore {
            match state.semaphores.get_mut(&signal.0) {
                Some(signaled) => *signaled = true,
                None => return Err(BackendError::InvalidHandle("semaphore")),
            }
        }

        if let Some(fence) = info.fence {
            match state.fences.get(&fence.0) {
                Some(true) => log::warn!("DummyBackend: submitting with a signaled fence"),
                Some(false) => {}
                None => return Err(BackendError::InvalidHandle("fence")),
            }
            if state.auto_complete {
                state.retire(fence);
            } else {
                state.pending.push_back(fence);
            }
        }

        log::trace!(
            "DummyBackend: submit {} commands (pending: {})",
            commands.len(),
            state.pending.len()
        );
        state.submissions.push(Submission {
            command_buffer: info.command_buffer,
            commands,
            wait_semaphore: info.wait_semaphore,
            signal_semaphore: info.signal_semaphore,
            fence: info.fence,
        });
        drop(state);
        self.fence_signaled.notify_all();
        Ok(())
    }

    fn surface_capabilities(&self) -> BackendResult<SurfaceCapabilities> {
        Ok(self.state.lock().capabilities)
    }

    fn surface_formats(&self) -> BackendResult<Vec<SurfaceFormat>> {
        Ok(self.state.lock().formats.clone())
    }

    fn present_modes(&self) -> BackendResult<Vec<PresentMode>> {
        Ok(self.state.lock().present_modes.clone())
    }

    fn create_swapchain(&self, descriptor: &SwapchainDescriptor) -> BackendResult<SwapchainHandle> {
        let mut state = self.state.lock();
        state.check_device()?;
        if descriptor.extent.is_empty() || descriptor.image_count == 0 {
            return Err(BackendError::SwapchainCreationFailed(format!(
                "{:?}",
                descriptor
            )));
        }
        let id = state.alloc_id();
        let images = (0..descriptor.image_count)
            .map(|_| ImageHandle(state.alloc_id()))
            .collect();
        state.swapchains.insert(
            id,
            SwapchainState {
                descriptor: *descriptor,
                images,
                next_image: 0,
            },
        );
        log::debug!(
            "DummyBackend: swapchain {}x{} with {} images",
            descriptor.extent.width,
            descriptor.extent.height,
            descriptor.image_count
        );
        Ok(SwapchainHandle(id))
    }

    fn swapchain_images(&self, swapchain: SwapchainHandle) -> BackendResult<Vec<ImageHandle>> {
        self.state
            .lock()
            .swapchains
            .get(&swapchain.0)
            .map(|s| s.images.clone())
            .ok_or(BackendError::InvalidHandle("swapchain"))
    }

    fn destroy_swapchain(&self, swapchain: SwapchainHandle) {
        self.state.lock().swapchains.remove(&swapchain.0);
    }

    fn create_image_view(
        &self,
        image: ImageHandle,
        _format: TextureFormat,
    ) -> BackendResult<ImageViewHandle> {
        let mut state = self.state.lock();
        let id = state.alloc_id();
        state.views.insert(id, image);
        Ok(ImageViewHandle(id))
    }

    fn destroy_image_view(&self, view: ImageViewHandle) {
        self.state.lock().views.remove(&view.0);
    }

    fn acquire_next_image(
        &self,
        swapchain: SwapchainHandle,
        semaphore: SemaphoreHandle,
    ) -> BackendResult<AcquiredImage> {
        let mut state = self.state.lock();
        state.check_device()?;

        if state.stale_acquires > 0 {
            state.stale_acquires -= 1;
            return Ok(AcquiredImage::Stale);
        }

        let wanted = state.surface_extent();
        let chain = state
            .swapchains
            .get_mut(&swapchain.0)
            .ok_or(BackendError::InvalidHandle("swapchain"))?;
        if chain.descriptor.extent != wanted {
            return Ok(AcquiredImage::Stale);
        }
        let index = chain.next_image;
        chain.next_image = (chain.next_image + 1) % chain.images.len() as u32;

        match state.semaphores.get_mut(&semaphore.0) {
            Some(signaled) => *signaled = true,
            None => return Err(BackendError::InvalidHandle("semaphore")),
        }
        Ok(AcquiredImage::Ready(index))
    }

    fn present(
        &self,
        swapchain: SwapchainHandle,
        image_index: u32,
        wait_semaphore: SemaphoreHandle,
    ) -> BackendResult<PresentStatus> {
        let mut state = self.state.lock();
        state.check_device()?;
        if !state.swapchains.contains_key(&swapchain.0) {
            return Err(BackendError::InvalidHandle("swapchain"));
        }
        match state.semaphores.get_mut(&wait_semaphore.0) {
            Some(signaled) => *signaled = false,
            None => return Err(BackendError::InvalidHandle("semaphore")),
        }
        state.presents.push(image_index);

        if state.stale_presents > 0 {
            state.stale_presents -= 1;
            return Ok(PresentStatus::Stale);
        }
        Ok(PresentStatus::Presented)
    }

    fn create_pipeline(&self, descriptor: &PipelineDescriptor) -> BackendResult<PipelineHandle> {
        if descriptor.vertex_spirv.is_empty() || descriptor.fragment_spirv.is_empty() {
            return Err(BackendError::ShaderModuleCreationFailed(
                "empty SPIR-V module".to_string(),
            ));
        }
        let mut state = self.state.lock();
        let id = state.alloc_id();
        state.pipelines.insert(id, descriptor.clone());
        log::debug!("DummyBackend: creating pipeline {:?}", descriptor.label);
        Ok(PipelineHandle(id))
    }

    fn destroy_pipeline(&self, pipeline: PipelineHandle) {
        self.state.lock().pipelines.remove(&pipeline.0);
    }

    fn create_bind_group(
        &self,
        pipeline: PipelineHandle,
        uniform: BufferHandle,
        storage: BufferHandle,
    ) -> BackendResult<BindGroupHandle> {
        let mut state = self.state.lock();
        if !state.pipelines.contains_key(&pipeline.0) {
            return Err(BackendError::InvalidHandle("pipeline"));
        }
        if !state.buffers.contains_key(&uniform.0) || !state.buffers.contains_key(&storage.0) {
            return Err(BackendError::InvalidHandle("buffer"));
        }
        let id = state.alloc_id();
        state.bind_groups.insert(id, (uniform, storage));
        Ok(BindGroupHandle(id))
    }

    fn destroy_bind_group(&self, group: BindGroupHandle) {
        self.state.lock().bind_groups.remove(&group.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fence_waits_for_completion() {
        let backend = DummyBackend::new();
        let fence = backend.create_fence(false).unwrap();
        let cmd = backend.allocate_command_buffer().unwrap();
        backend.begin_command_buffer(cmd).unwrap();
        backend.end_command_buffer(cmd).unwrap();
        backend
            .submit(&SubmitInfo {
                command_buffer: cmd,
                wait_semaphore: None,
                wait_stage: PipelineStage::AllCommands,
                signal_semaphore: None,
                fence: Some(fence),
            })
            .unwrap();

        assert!(!backend.is_fence_signaled(fence).unwrap());
        assert!(!backend
            .wait_fence_timeout(fence, Duration::from_millis(10))
            .unwrap());

        assert_eq!(backend.complete_submissions(), 1);
        assert!(backend.is_fence_signaled(fence).unwrap());
        backend.wait_fence(fence).unwrap();
    }

    #[test]
    fn test_auto_complete_signals_on_submit() {
        let backend = DummyBackend::new().with_auto_complete(true);
        let fence = backend.create_fence(false).unwrap();
        let cmd = backend.allocate_command_buffer().unwrap();
        backend
            .submit(&SubmitInfo {
                command_buffer: cmd,
                wait_semaphore: None,
                wait_stage: PipelineStage::AllCommands,
                signal_semaphore: None,
                fence: Some(fence),
            })
            .unwrap();
        assert!(backend.is_fence_signaled(fence).unwrap());
        assert_eq!(backend.pending_submissions(), 0);
    }

    #[test]
    fn test_buffer_write_read() {
        let backend = DummyBackend::new();
        let buffer = backend
            .create_buffer(&BufferDescriptor::new(16, BufferUsage::STORAGE))
            .unwrap();
        backend.write_buffer(buffer, 4, &[1, 2, 3, 4]).unwrap();
        assert_eq!(backend.read_buffer(buffer, 4, 4).unwrap(), vec![1, 2, 3, 4]);
        assert!(matches!(
            backend.write_buffer(buffer, 14, &[0; 4]),
            Err(BackendError::OutOfBounds { .. })
        ));
        assert!(matches!(
            backend.read_buffer(buffer, u64::MAX, 2),
            Err(BackendError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn test_injected_write_failure() {
        let backend = DummyBackend::new();
        let buffer = backend
            .create_buffer(&BufferDescriptor::new(8, BufferUsage::STORAGE))
            .unwrap();
        backend.inject_write_failure(1);
        backend.write_buffer(buffer, 0, &[1; 4]).unwrap();
        assert!(matches!(
            backend.write_buffer(buffer, 4, &[2; 4]),
            Err(BackendError::DeviceLost)
        ));
        backend.write_buffer(buffer, 4, &[2; 4]).unwrap();
    }

    #[test]
    fn test_memory_budget() {
        let backend = DummyBackend::new().with_memory_budget(32);
        backend
            .create_buffer(&BufferDescriptor::new(24, BufferUsage::VERTEX))
            .unwrap();
        assert!(matches!(
            backend.create_buffer(&BufferDescriptor::new(16, BufferUsage::VERTEX)),
            Err(BackendError::OutOfMemory)
        ));
    }

    #[test]
    fn test_acquire_goes_stale_after_resize() {
        let backend = DummyBackend::new();
        let swapchain = backend
            .create_swapchain(&SwapchainDescriptor {
                format: SurfaceFormat::new(TextureFormat::Bgra8UnormSrgb),
                extent: Extent2d::new(800, 600),
                image_count: 2,
                present_mode: PresentMode::Fifo,
            })
            .unwrap();
        let semaphore = backend.create_semaphore().unwrap();

        assert_eq!(
            backend.acquire_next_image(swapchain, semaphore).unwrap(),
            AcquiredImage::Ready(0)
        );
        backend.set_window_extent(Extent2d::new(1024, 768));
        assert_eq!(
            backend.acquire_next_image(swapchain, semaphore).unwrap(),
            AcquiredImage::Stale
        );
    }

    #[test]
    fn test_lost_device_fails_waits() {
        let backend = DummyBackend::new();
        let fence = backend.create_fence(false).unwrap();
        backend.lose_device();
        assert!(matches!(
            backend.wait_fence(fence),
            Err(BackendError::DeviceLost)
        ));
    }
}

//! Frame synchronization for multiple frames in flight.
//!
//! [`FrameSynchronizer`] owns N frame slots, each with a command buffer, a
//! submit fence and an acquire/present semaphore pair, plus the
//! [`SurfaceManager`] it presents to. With N slots the CPU can run at most N
//! frames ahead of the GPU:
//!
//! ```text
//! frames_in_flight = 2
//!
//! Slot 0: [Frame 0] ──► [Frame 2] ──► [Frame 4] ──►
//! Slot 1: [Frame 1] ──► [Frame 3] ──► [Frame 5] ──►
//! ```
//!
//! Before a slot is reused, [`begin_frame`](FrameSynchronizer::begin_frame)
//! blocks on the slot's submit fence. That wait is the only thing keeping the
//! CPU from overwriting per-frame data the GPU is still reading.
//!
//! # Stale surfaces
//!
//! When acquire or present reports the surface out of date, the synchronizer
//! waits for the device to go idle, recreates the swapchain and every slot's
//! semaphores, and carries on. A stale acquire skips the frame
//! ([`FrameStatus::Skipped`]); a stale present is handled after the frame was
//! submitted. Neither is reported as an error.
//!
//! # Example
//!
//! ```ignore
//! loop {
//!     match sync.begin_frame()? {
//!         FrameStatus::Ready(frame) => {
//!             // record into frame.command_buffer()
//!             sync.end_frame(frame)?;
//!         }
//!         FrameStatus::Skipped => continue,
//!     }
//! }
//! ```

mod slot;

pub use slot::{FrameSlot, SlotState};

use std::sync::Arc;
use std::time::Duration;

use crate::backend::{
    CommandBufferHandle, Extent2d, GpuBackend, ImageLayout, PipelineStage, PresentStatus,
    SubmitInfo,
};
use crate::error::{RendererError, RendererResult};
use crate::swapchain::{SurfaceImage, SurfaceManager};

/// A frame being recorded.
///
/// Only [`FrameSynchronizer::begin_frame`] creates these, and
/// [`FrameSynchronizer::end_frame`] consumes them.
#[derive(Debug, PartialEq, Eq)]
pub struct FrameHandle {
    slot: usize,
    image: SurfaceImage,
    frame_number: u64,
    command_buffer: CommandBufferHandle,
    extent: Extent2d,
}

impl FrameHandle {
    /// Frame slot index, `0..frames_in_flight`.
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn image(&self) -> SurfaceImage {
        self.image
    }

    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    pub fn command_buffer(&self) -> CommandBufferHandle {
        self.command_buffer
    }

    pub fn extent(&self) -> Extent2d {
        self.extent
    }

    /// Surface generation the frame was acquired from.
    pub fn generation(&self) -> u64 {
        self.image.generation
    }
}

/// Outcome of [`FrameSynchronizer::begin_frame`].
#[derive(Debug, PartialEq, Eq)]
pub enum FrameStatus {
    /// Record into this frame, then hand it to `end_frame`.
    Ready(FrameHandle),
    /// The surface was stale or zero-sized. Record nothing.
    Skipped,
}

impl FrameStatus {
    pub fn is_skipped(&self) -> bool {
        matches!(self, FrameStatus::Skipped)
    }
}

/// Frame loop counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub frames_begun: u64,
    pub frames_presented: u64,
    pub frames_skipped: u64,
    /// Frames dropped after `begin_frame` without being submitted.
    pub frames_abandoned: u64,
    pub recreations: u64,
    /// Batches drawn in the last recorded frame.
    pub last_batch_count: usize,
    /// Instances drawn in the last recorded frame.
    pub last_instance_count: usize,
}

/// Owns the frame slots and the acquire/submit/present protocol.
///
/// Not thread-safe; it is driven by the one thread running the frame loop.
pub struct FrameSynchronizer {
    backend: Arc<dyn GpuBackend>,
    surface: SurfaceManager,
    slots: Vec<FrameSlot>,
    current_slot: usize,
    frame_count: u64,
    clear_color: [f32; 4],
    window_extent: Extent2d,
    needs_recreate: bool,
    stats: FrameStats,
}

impl FrameSynchronizer {
    /// Create `frames_in_flight` slots presenting to `surface`.
    pub fn new(
        backend: Arc<dyn GpuBackend>,
        surface: SurfaceManager,
        frames_in_flight: usize,
        window_extent: Extent2d,
        clear_color: [f32; 4],
    ) -> RendererResult<Self> {
        if frames_in_flight == 0 {
            return Err(RendererError::InvalidConfig(
                "frames_in_flight must be at least 1".to_string(),
            ));
        }

        let mut slots = Vec::with_capacity(frames_in_flight);
        for _ in 0..frames_in_flight {
            match FrameSlot::new(backend.as_ref()) {
                Ok(slot) => slots.push(slot),
                Err(e) => {
                    for slot in &slots {
                        slot.destroy(backend.as_ref());
                    }
                    return Err(e);
                }
            }
        }
        log::debug!("Created {} frame slots", frames_in_flight);

        Ok(Self {
            backend,
            surface,
            slots,
            current_slot: 0,
            frame_count: 0,
            clear_color,
            window_extent,
            needs_recreate: false,
            stats: FrameStats::default(),
        })
    }

    /// Wait for the current slot, acquire an image and start recording.
    ///
    /// Blocks while the GPU still owns the slot.
    pub fn begin_frame(&mut self) -> RendererResult<FrameStatus> {
        self.begin_frame_inner(None)
            .map(|status| status.unwrap_or(FrameStatus::Skipped))
    }

    /// Like [`begin_frame`](Self::begin_frame), but gives up after `timeout`.
    ///
    /// Returns `None` if the slot's previous frame did not complete in time.
    /// Nothing has changed in that case; the call can be repeated.
    pub fn begin_frame_timeout(&mut self, timeout: Duration) -> RendererResult<Option<FrameStatus>> {
        self.begin_frame_inner(Some(timeout))
    }

    fn begin_frame_inner(&mut self, timeout: Option<Duration>) -> RendererResult<Option<FrameStatus>> {
        let index = self.current_slot;
        if let SlotState::Acquiring | SlotState::Recording = self.slots[index].state {
            // The previous frame's handle was dropped without end_frame
            log::warn!(
                "Frame {} in slot {} was never ended, abandoning it",
                self.slots[index].frame_number,
                index
            );
            self.recreate_surface()?;
        }

        if self.slots[index].state == SlotState::Submitted {
            let fence = self.slots[index].submit_fence;
            match timeout {
                Some(timeout) => {
                    if !self.backend.wait_fence_timeout(fence, timeout)? {
                        log::trace!("Slot {} still in flight after {:?}", index, timeout);
                        return Ok(None);
                    }
                }
                None => self.backend.wait_fence(fence)?,
            }
            self.slots[index].state = SlotState::Idle;
        }

        if self.window_extent.is_empty() {
            self.stats.frames_skipped += 1;
            return Ok(Some(FrameStatus::Skipped));
        }
        if self.needs_recreate {
            self.recreate_surface()?;
        }

        self.slots[index].state = SlotState::Acquiring;
        let acquire_semaphore = self.slots[index].acquire_semaphore;
        let image = match self.surface.acquire(acquire_semaphore)? {
            Some(image) => image,
            None => {
                log::warn!("Surface out of date on acquire, skipping frame");
                self.slots[index].state = SlotState::Idle;
                self.recreate_surface()?;
                self.stats.frames_skipped += 1;
                return Ok(Some(FrameStatus::Skipped));
            }
        };

        let slot = &mut self.slots[index];
        let cmd = slot.command_buffer;
        self.backend.reset_fence(slot.submit_fence)?;
        self.backend.reset_command_buffer(cmd)?;
        self.backend.begin_command_buffer(cmd)?;

        let (target, view) = self.surface.image(image)?;
        let extent = self.surface.extent()?;
        self.backend
            .cmd_transition_image(cmd, target, ImageLayout::Undefined, ImageLayout::ColorAttachment);
        self.backend
            .cmd_begin_rendering(cmd, view, extent, self.clear_color);
        self.backend.cmd_set_viewport(cmd, extent);
        self.backend.cmd_set_scissor(cmd, extent);

        self.frame_count += 1;
        slot.state = SlotState::Recording;
        slot.frame_number = self.frame_count;
        self.stats.frames_begun += 1;
        log::trace!(
            "Begin frame {} (slot {}, image {})",
            self.frame_count,
            index,
            image.index
        );

        Ok(Some(FrameStatus::Ready(FrameHandle {
            slot: index,
            image,
            frame_number: self.frame_count,
            command_buffer: cmd,
            extent,
        })))
    }

    /// Finish recording, submit and present the frame.
    ///
    /// Always advances to the next slot once the frame was submitted, even if
    /// presenting required a surface recreation.
    pub fn end_frame(&mut self, frame: FrameHandle) -> RendererResult<PresentStatus> {
        self.check(&frame)?;

        let slot = &mut self.slots[frame.slot];
        let cmd = slot.command_buffer;
        let (target, _) = self.surface.image(frame.image)?;
        self.backend.cmd_end_rendering(cmd);
        self.backend
            .cmd_transition_image(cmd, target, ImageLayout::ColorAttachment, ImageLayout::Present);
        self.backend.end_command_buffer(cmd)?;

        self.backend.submit(&SubmitInfo {
            command_buffer: cmd,
            wait_semaphore: Some(slot.acquire_semaphore),
            wait_stage: PipelineStage::ColorAttachmentOutput,
            signal_semaphore: Some(slot.present_semaphore),
            fence: Some(slot.submit_fence),
        })?;
        slot.state = SlotState::Submitted;
        let present_semaphore = slot.present_semaphore;

        self.current_slot = (self.current_slot + 1) % self.slots.len();

        let status = self.surface.present(frame.image, present_semaphore)?;
        match status {
            PresentStatus::Presented => self.stats.frames_presented += 1,
            PresentStatus::Stale => {
                log::warn!("Surface out of date on present, recreating");
                self.recreate_surface()?;
            }
        }
        log::trace!("End frame {} (slot {})", frame.frame_number, frame.slot);

        Ok(status)
    }

    /// Drop a frame without submitting it.
    ///
    /// The acquired image is never presented, so the surface and the slot
    /// semaphores are rebuilt right away. The next `begin_frame` reuses the
    /// same slot.
    pub fn abandon_frame(&mut self, frame: FrameHandle) -> RendererResult<()> {
        self.check(&frame)?;
        log::debug!("Abandoning frame {} (slot {})", frame.frame_number, frame.slot);
        self.recreate_surface()
    }

    /// Reject a handle that is not the frame currently being recorded.
    pub fn check(&self, frame: &FrameHandle) -> RendererResult<()> {
        let slot = self.slots.get(frame.slot).ok_or_else(|| {
            RendererError::InvalidHandle(format!("frame slot {} does not exist", frame.slot))
        })?;
        if frame.slot != self.current_slot
            || slot.state != SlotState::Recording
            || slot.frame_number != frame.frame_number
        {
            return Err(RendererError::InvalidHandle(format!(
                "frame {} is not being recorded",
                frame.frame_number
            )));
        }
        self.surface.check(frame.image)
    }

    /// Recreate the surface on the next `begin_frame` using the new window size.
    pub fn resize(&mut self, window_extent: Extent2d) {
        self.window_extent = window_extent;
        self.needs_recreate = true;
    }

    /// Rebuild the swapchain and every slot's semaphores now.
    ///
    /// A frame still being recorded is abandoned; its handle becomes invalid.
    pub fn recreate_surface(&mut self) -> RendererResult<()> {
        self.surface.recreate(self.window_extent)?;

        for (index, slot) in self.slots.iter_mut().enumerate() {
            slot.recreate_semaphores(self.backend.as_ref())?;
            match slot.state {
                SlotState::Acquiring | SlotState::Recording => {
                    log::debug!("Abandoning frame {} in slot {}", slot.frame_number, index);
                    self.backend.reset_command_buffer(slot.command_buffer)?;
                    slot.state = SlotState::Idle;
                    self.stats.frames_abandoned += 1;
                }
                // The device is idle, so every submitted frame has completed.
                SlotState::Submitted => slot.state = SlotState::Idle,
                SlotState::Idle => {}
            }
        }

        self.needs_recreate = false;
        self.stats.recreations += 1;
        Ok(())
    }

    /// Block until all in-flight frames have completed.
    pub fn wait_idle(&mut self) -> RendererResult<()> {
        self.backend.wait_idle()?;
        for slot in &mut self.slots {
            if slot.state == SlotState::Submitted {
                slot.state = SlotState::Idle;
            }
        }
        log::debug!("Frame synchronizer idle after {} frames", self.frame_count);
        Ok(())
    }

    /// Slot the next `begin_frame` uses.
    pub fn current_slot(&self) -> usize {
        self.current_slot
    }

    pub fn frames_in_flight(&self) -> usize {
        self.slots.len()
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn slot(&self, index: usize) -> Option<&FrameSlot> {
        self.slots.get(index)
    }

    /// Slots whose GPU work has not been observed complete.
    pub fn frames_pending(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.state == SlotState::Submitted)
            .count()
    }

    pub fn surface(&self) -> &SurfaceManager {
        &self.surface
    }

    pub fn window_extent(&self) -> Extent2d {
        self.window_extent
    }

    pub fn stats(&self) -> &FrameStats {
        &self.stats
    }

    pub(crate) fn stats_mut(&mut self) -> &mut FrameStats {
        &mut self.stats
    }

    pub fn backend(&self) -> &Arc<dyn GpuBackend> {
        &self.backend
    }
}

impl Drop for FrameSynchronizer {
    fn drop(&mut self) {
        if let Err(e) = self.backend.wait_idle() {
            log::error!("wait_idle failed while dropping frame slots: {}", e);
        }
        for slot in &self.slots {
            slot.destroy(self.backend.as_ref());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::{Command, DummyBackend};
    use crate::backend::TextureFormat;
    use crate::PresentPolicy;

    fn create_test_sync(frames_in_flight: usize) -> (Arc<DummyBackend>, FrameSynchronizer) {
        let backend = Arc::new(DummyBackend::new());
        let extent = Extent2d::new(800, 600);
        let surface = SurfaceManager::create(
            backend.clone(),
            extent,
            TextureFormat::Bgra8UnormSrgb,
            PresentPolicy::Vsync,
        )
        .unwrap();
        let sync =
            FrameSynchronizer::new(backend.clone(), surface, frames_in_flight, extent, [0.0; 4])
                .unwrap();
        (backend, sync)
    }

    fn ready(status: FrameStatus) -> FrameHandle {
        match status {
            FrameStatus::Ready(frame) => frame,
            FrameStatus::Skipped => panic!("frame skipped"),
        }
    }

    #[test]
    fn test_zero_frames_in_flight() {
        let backend = Arc::new(DummyBackend::new());
        let surface = SurfaceManager::create(
            backend.clone(),
            Extent2d::new(800, 600),
            TextureFormat::Bgra8UnormSrgb,
            PresentPolicy::Vsync,
        )
        .unwrap();
        assert!(matches!(
            FrameSynchronizer::new(backend, surface, 0, Extent2d::new(800, 600), [0.0; 4]),
            Err(RendererError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_slot_rotation() {
        let (backend, mut sync) = create_test_sync(2);

        for expected in [0, 1, 0, 1] {
            let frame = ready(sync.begin_frame().unwrap());
            assert_eq!(frame.slot(), expected);
            sync.end_frame(frame).unwrap();
            backend.complete_submissions();
        }
        assert_eq!(sync.frame_count(), 4);
        assert_eq!(sync.stats().frames_presented, 4);
    }

    #[test]
    fn test_third_frame_times_out_without_gpu_progress() {
        let (backend, mut sync) = create_test_sync(2);

        for _ in 0..2 {
            let frame = ready(sync.begin_frame().unwrap());
            sync.end_frame(frame).unwrap();
        }
        assert_eq!(sync.frames_pending(), 2);
        assert!(sync
            .begin_frame_timeout(Duration::from_millis(20))
            .unwrap()
            .is_none());
        assert_eq!(sync.frame_count(), 2);

        backend.complete_next_submission();
        let frame = ready(
            sync.begin_frame_timeout(Duration::from_millis(20))
                .unwrap()
                .unwrap(),
        );
        assert_eq!(frame.slot(), 0);
    }

    #[test]
    fn test_recorded_command_order() {
        let (backend, mut sync) = create_test_sync(2);

        let frame = ready(sync.begin_frame().unwrap());
        sync.end_frame(frame).unwrap();

        let submissions = backend.submissions();
        assert_eq!(submissions.len(), 1);
        let commands = &submissions[0].commands;
        assert!(matches!(
            commands.first(),
            Some(Command::TransitionImage {
                old_layout: ImageLayout::Undefined,
                new_layout: ImageLayout::ColorAttachment,
                ..
            })
        ));
        assert!(matches!(commands[1], Command::BeginRendering { .. }));
        assert_eq!(commands[2], Command::SetViewport(Extent2d::new(800, 600)));
        assert_eq!(commands[3], Command::SetScissor(Extent2d::new(800, 600)));
        assert_eq!(commands[commands.len() - 2], Command::EndRendering);
        assert!(matches!(
            commands.last(),
            Some(Command::TransitionImage {
                new_layout: ImageLayout::Present,
                ..
            })
        ));

        let slot = sync.slot(0).unwrap();
        assert_eq!(submissions[0].fence, Some(slot.submit_fence()));
    }

    #[test]
    fn test_stale_acquire_skips_and_recreates() {
        let (backend, mut sync) = create_test_sync(2);
        backend.inject_stale_acquire(1);

        assert_eq!(sync.begin_frame().unwrap(), FrameStatus::Skipped);
        assert_eq!(sync.surface().generation(), 1);
        assert_eq!(sync.stats().recreations, 1);
        assert_eq!(sync.stats().frames_skipped, 1);
        assert!(backend.submissions().is_empty());

        let frame = ready(sync.begin_frame().unwrap());
        assert_eq!(frame.generation(), 1);
        sync.end_frame(frame).unwrap();
    }

    #[test]
    fn test_stale_present_recreates_and_advances() {
        let (backend, mut sync) = create_test_sync(2);
        backend.inject_stale_present(1);

        let frame = ready(sync.begin_frame().unwrap());
        assert_eq!(sync.end_frame(frame).unwrap(), PresentStatus::Stale);
        assert_eq!(sync.current_slot(), 1);
        assert_eq!(sync.surface().generation(), 1);
        assert_eq!(backend.submissions().len(), 1);
    }

    #[test]
    fn test_end_frame_rejects_handle_from_old_surface() {
        let (_, mut sync) = create_test_sync(2);

        let frame = ready(sync.begin_frame().unwrap());
        sync.recreate_surface().unwrap();
        assert!(matches!(
            sync.end_frame(frame),
            Err(RendererError::InvalidHandle(_))
        ));

        // The abandoned slot is usable again
        let frame = ready(sync.begin_frame().unwrap());
        assert_eq!(frame.slot(), 0);
        sync.end_frame(frame).unwrap();
    }

    #[test]
    fn test_begin_twice_abandons_previous_frame() {
        let (backend, mut sync) = create_test_sync(2);
        let first = ready(sync.begin_frame().unwrap());

        let second = ready(sync.begin_frame().unwrap());
        assert_eq!(second.slot(), 0);
        assert_eq!(second.generation(), 1);
        assert_eq!(sync.stats().frames_abandoned, 1);
        assert!(matches!(
            sync.end_frame(first),
            Err(RendererError::InvalidHandle(_))
        ));

        sync.end_frame(second).unwrap();
        assert_eq!(backend.submissions().len(), 1);
    }

    #[test]
    fn test_abandon_frame() {
        let (backend, mut sync) = create_test_sync(2);
        let frame = ready(sync.begin_frame().unwrap());
        sync.abandon_frame(frame).unwrap();

        assert_eq!(sync.slot(0).unwrap().state(), SlotState::Idle);
        assert_eq!(sync.current_slot(), 0);
        assert_eq!(sync.surface().generation(), 1);
        assert_eq!(sync.stats().frames_abandoned, 1);
        assert_eq!(sync.frames_pending(), 0);

        let frame = ready(sync.begin_frame().unwrap());
        assert_eq!(frame.slot(), 0);
        sync.end_frame(frame).unwrap();
        assert_eq!(backend.submissions().len(), 1);
        assert_eq!(sync.stats().frames_presented, 1);
    }

    #[test]
    fn test_zero_sized_window_skips() {
        let (backend, mut sync) = create_test_sync(2);
        sync.resize(Extent2d::new(0, 0));
        assert_eq!(sync.begin_frame().unwrap(), FrameStatus::Skipped);
        assert_eq!(sync.stats().recreations, 0);

        backend.set_window_extent(Extent2d::new(640, 480));
        sync.resize(Extent2d::new(640, 480));
        let frame = ready(sync.begin_frame().unwrap());
        assert_eq!(frame.extent(), Extent2d::new(640, 480));
        assert_eq!(sync.stats().recreations, 1);
    }

    #[test]
    fn test_wait_idle_retires_frames() {
        let (_, mut sync) = create_test_sync(3);
        for _ in 0..3 {
            let frame = ready(sync.begin_frame().unwrap());
            sync.end_frame(frame).unwrap();
        }
        assert_eq!(sync.frames_pending(), 3);
        sync.wait_idle().unwrap();
        assert_eq!(sync.frames_pending(), 0);
    }
}

//! Surface and swapchain management
//!
//! [`SurfaceManager`] owns the swapchain and the views of its images. Whenever
//! acquire or present reports the surface as stale, the frame synchronizer asks
//! it to [`recreate`](SurfaceManager::recreate) everything. Each recreation
//! bumps the surface generation; a [`SurfaceImage`] from an older generation is
//! rejected with [`RendererError::InvalidHandle`].

use std::sync::Arc;

use crate::backend::{
    AcquiredImage, Extent2d, GpuBackend, ImageHandle, ImageViewHandle, PresentMode,
    PresentStatus, SemaphoreHandle, SurfaceCapabilities, SurfaceFormat, SwapchainDescriptor,
    SwapchainHandle, TextureFormat,
};
use crate::error::{RendererError, RendererResult};
use crate::PresentPolicy;

/// Everything derived from one swapchain creation.
#[derive(Debug, Clone)]
pub struct SurfaceState {
    pub swapchain: SwapchainHandle,
    pub images: Vec<ImageHandle>,
    pub views: Vec<ImageViewHandle>,
    pub format: SurfaceFormat,
    pub extent: Extent2d,
    pub present_mode: PresentMode,
    pub generation: u64,
}

impl SurfaceState {
    pub fn image_count(&self) -> usize {
        self.images.len()
    }
}

/// An acquired swapchain image, stamped with the generation it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceImage {
    pub index: u32,
    pub generation: u64,
}

/// Owns the presentable surface and recreates it on resize or loss.
pub struct SurfaceManager {
    backend: Arc<dyn GpuBackend>,
    preferred_format: TextureFormat,
    policy: PresentPolicy,
    state: Option<SurfaceState>,
    generation: u64,
}

impl SurfaceManager {
    /// Create the swapchain for a window of `window_extent` pixels.
    pub fn create(
        backend: Arc<dyn GpuBackend>,
        window_extent: Extent2d,
        preferred_format: TextureFormat,
        policy: PresentPolicy,
    ) -> RendererResult<Self> {
        let state = build(backend.as_ref(), window_extent, preferred_format, policy, 0)?;
        log::info!(
            "Surface created: {}x{} {:?} {:?}, {} images",
            state.extent.width,
            state.extent.height,
            state.format.format,
            state.present_mode,
            state.image_count()
        );

        Ok(Self {
            backend,
            preferred_format,
            policy,
            state: Some(state),
            generation: 0,
        })
    }

    /// Wait for the device to go idle, tear the swapchain down and build it again.
    ///
    /// On failure no surface is left; every later call reports `InvalidHandle`.
    pub fn recreate(&mut self, window_extent: Extent2d) -> RendererResult<()> {
        self.backend.wait_idle()?;
        self.release();

        self.generation += 1;
        let state = build(
            self.backend.as_ref(),
            window_extent,
            self.preferred_format,
            self.policy,
            self.generation,
        )?;
        log::info!(
            "Surface recreated (generation {}): {}x{}, {} images",
            state.generation,
            state.extent.width,
            state.extent.height,
            state.image_count()
        );
        self.state = Some(state);
        Ok(())
    }

    /// The live surface.
    pub fn state(&self) -> RendererResult<&SurfaceState> {
        self.state
            .as_ref()
            .ok_or_else(|| RendererError::InvalidHandle("surface was not recreated".to_string()))
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn extent(&self) -> RendererResult<Extent2d> {
        Ok(self.state()?.extent)
    }

    /// Acquire the next image. `None` means the surface is stale.
    pub fn acquire(&self, semaphore: SemaphoreHandle) -> RendererResult<Option<SurfaceImage>> {
        let state = self.state()?;
        match self.backend.acquire_next_image(state.swapchain, semaphore)? {
            AcquiredImage::Ready(index) => Ok(Some(SurfaceImage {
                index,
                generation: state.generation,
            })),
            AcquiredImage::Stale => Ok(None),
        }
    }

    /// Present an image once `wait_semaphore` signals.
    pub fn present(
        &self,
        image: SurfaceImage,
        wait_semaphore: SemaphoreHandle,
    ) -> RendererResult<PresentStatus> {
        self.check(image)?;
        let state = self.state()?;
        Ok(self
            .backend
            .present(state.swapchain, image.index, wait_semaphore)?)
    }

    /// Reject images from an older generation or out of range.
    pub fn check(&self, image: SurfaceImage) -> RendererResult<()> {
        let state = self.state()?;
        if image.generation != state.generation {
            return Err(RendererError::InvalidHandle(format!(
                "surface image from generation {} used with generation {}",
                image.generation, state.generation
            )));
        }
        if image.index as usize >= state.images.len() {
            return Err(RendererError::InvalidHandle(format!(
                "surface image index {} out of {} images",
                image.index,
                state.images.len()
            )));
        }
        Ok(())
    }

    /// Image and view behind an acquired image.
    pub fn image(&self, image: SurfaceImage) -> RendererResult<(ImageHandle, ImageViewHandle)> {
        self.check(image)?;
        let state = self.state()?;
        let index = image.index as usize;
        Ok((state.images[index], state.views[index]))
    }

    fn release(&mut self) {
        if let Some(state) = self.state.take() {
            for view in state.views {
                self.backend.destroy_image_view(view);
            }
            self.backend.destroy_swapchain(state.swapchain);
        }
    }
}

impl Drop for SurfaceManager {
    fn drop(&mut self) {
        self.release();
    }
}

fn build(
    backend: &dyn GpuBackend,
    window_extent: Extent2d,
    preferred_format: TextureFormat,
    policy: PresentPolicy,
    generation: u64,
) -> RendererResult<SurfaceState> {
    let capabilities = backend.surface_capabilities()?;
    let formats = backend.surface_formats()?;
    let present_modes = backend.present_modes()?;

    let format = choose_format(&formats, preferred_format).ok_or_else(|| {
        RendererError::InvalidConfig("surface reports no supported formats".to_string())
    })?;
    let extent = choose_extent(&capabilities, window_extent);
    let present_mode = choose_present_mode(&present_modes, policy);
    let image_count = choose_image_count(&capabilities, present_mode);

    let swapchain = backend.create_swapchain(&SwapchainDescriptor {
        format,
        extent,
        image_count,
        present_mode,
    })?;
    let images = backend.swapchain_images(swapchain)?;

    let mut views = Vec::with_capacity(images.len());
    for &image in &images {
        match backend.create_image_view(image, format.format) {
            Ok(view) => views.push(view),
            Err(e) => {
                for view in views {
                    backend.destroy_image_view(view);
                }
                backend.destroy_swapchain(swapchain);
                return Err(e.into());
            }
        }
    }

    Ok(SurfaceState {
        swapchain,
        images,
        views,
        format,
        extent,
        present_mode,
        generation,
    })
}

/// First format matching `preferred`, otherwise the first one reported.
pub fn choose_format(formats: &[SurfaceFormat], preferred: TextureFormat) -> Option<SurfaceFormat> {
    formats
        .iter()
        .find(|f| f.format == preferred)
        .or_else(|| formats.first())
        .copied()
}

/// The surface's own extent, or the window size clamped to the surface limits.
pub fn choose_extent(capabilities: &SurfaceCapabilities, window_extent: Extent2d) -> Extent2d {
    if capabilities.current_extent.is_follow_window() {
        window_extent.clamp(capabilities.min_image_extent, capabilities.max_image_extent)
    } else {
        capabilities.current_extent
    }
}

pub fn choose_present_mode(modes: &[PresentMode], policy: PresentPolicy) -> PresentMode {
    match policy {
        PresentPolicy::Vsync => PresentMode::Fifo,
        PresentPolicy::LowLatency => [PresentMode::Mailbox, PresentMode::Immediate]
            .into_iter()
            .find(|mode| modes.contains(mode))
            .unwrap_or(PresentMode::Fifo),
    }
}

/// Two images, or three for a non-blocking present mode, within the surface limits.
pub fn choose_image_count(capabilities: &SurfaceCapabilities, mode: PresentMode) -> u32 {
    let wanted = if mode.is_non_blocking() { 3 } else { 2 };
    let count = capabilities.min_image_count.max(wanted);
    if capabilities.max_image_count > 0 {
        count.min(capabilities.max_image_count)
    } else {
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyBackend;
    use crate::backend::ColorSpace;

    fn caps(current: Extent2d, min_count: u32, max_count: u32) -> SurfaceCapabilities {
        SurfaceCapabilities {
            current_extent: current,
            min_image_extent: Extent2d::new(64, 64),
            max_image_extent: Extent2d::new(2048, 2048),
            min_image_count: min_count,
            max_image_count: max_count,
        }
    }

    #[test]
    fn test_choose_format_prefers_match() {
        let formats = [
            SurfaceFormat::new(TextureFormat::Rgba8Unorm),
            SurfaceFormat::new(TextureFormat::Bgra8UnormSrgb),
        ];
        assert_eq!(
            choose_format(&formats, TextureFormat::Bgra8UnormSrgb).unwrap().format,
            TextureFormat::Bgra8UnormSrgb
        );
        assert_eq!(
            choose_format(&formats, TextureFormat::Rgba16Float).unwrap().format,
            TextureFormat::Rgba8Unorm
        );
        assert!(choose_format(&[], TextureFormat::Rgba8Unorm).is_none());
    }

    #[test]
    fn test_choose_format_keeps_color_space() {
        let formats = [SurfaceFormat {
            format: TextureFormat::Rgba16Float,
            color_space: ColorSpace::ExtendedSrgbLinear,
        }];
        let chosen = choose_format(&formats, TextureFormat::Bgra8UnormSrgb).unwrap();
        assert_eq!(chosen.color_space, ColorSpace::ExtendedSrgbLinear);
    }

    #[test]
    fn test_choose_extent() {
        let fixed = caps(Extent2d::new(640, 480), 2, 0);
        assert_eq!(
            choose_extent(&fixed, Extent2d::new(1000, 1000)),
            Extent2d::new(640, 480)
        );

        let follow = caps(Extent2d::FOLLOW_WINDOW, 2, 0);
        assert_eq!(
            choose_extent(&follow, Extent2d::new(4000, 10)),
            Extent2d::new(2048, 64)
        );
    }

    #[test]
    fn test_choose_image_count() {
        assert_eq!(choose_image_count(&caps(Extent2d::FOLLOW_WINDOW, 1, 0), PresentMode::Fifo), 2);
        assert_eq!(choose_image_count(&caps(Extent2d::FOLLOW_WINDOW, 3, 0), PresentMode::Fifo), 3);
        assert_eq!(choose_image_count(&caps(Extent2d::FOLLOW_WINDOW, 2, 0), PresentMode::Mailbox), 3);
        assert_eq!(choose_image_count(&caps(Extent2d::FOLLOW_WINDOW, 2, 2), PresentMode::Mailbox), 2);
    }

    #[test]
    fn test_choose_present_mode() {
        let modes = [PresentMode::Fifo, PresentMode::Immediate];
        assert_eq!(choose_present_mode(&modes, PresentPolicy::Vsync), PresentMode::Fifo);
        assert_eq!(choose_present_mode(&modes, PresentPolicy::LowLatency), PresentMode::Immediate);
        assert_eq!(
            choose_present_mode(&[PresentMode::Fifo], PresentPolicy::LowLatency),
            PresentMode::Fifo
        );
    }

    #[test]
    fn test_recreate_bumps_generation_and_invalidates_images() {
        let backend = Arc::new(DummyBackend::new());
        let mut manager = SurfaceManager::create(
            backend.clone(),
            Extent2d::new(800, 600),
            TextureFormat::Bgra8UnormSrgb,
            PresentPolicy::Vsync,
        )
        .unwrap();
        let semaphore = backend.create_semaphore().unwrap();
        let image = manager.acquire(semaphore).unwrap().unwrap();
        assert_eq!(image.generation, 0);
        assert!(manager.check(image).is_ok());

        manager.recreate(Extent2d::new(800, 600)).unwrap();
        assert_eq!(manager.generation(), 1);
        assert_eq!(backend.idle_waits(), 1);
        assert!(matches!(
            manager.check(image),
            Err(RendererError::InvalidHandle(_))
        ));
        assert_eq!(backend.live_swapchains(), 1);
    }

    #[test]
    fn test_drop_releases_views() {
        let backend = Arc::new(DummyBackend::new());
        let manager = SurfaceManager::create(
            backend.clone(),
            Extent2d::new(800, 600),
            TextureFormat::Bgra8UnormSrgb,
            PresentPolicy::Vsync,
        )
        .unwrap();
        assert_eq!(backend.live_image_views(), 2);
        drop(manager);
        assert_eq!(backend.live_image_views(), 0);
        assert_eq!(backend.live_swapchains(), 0);
    }
}

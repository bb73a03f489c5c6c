//! Common types shared between backends

use bytemuck::{Pod, Zeroable};
use glam::{Vec2, Vec3, Vec4};

/// Surface / image format enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    Rgba8Unorm,
    Rgba8UnormSrgb,
    Bgra8Unorm,
    Bgra8UnormSrgb,
    Rgba16Float,
    Rgb10A2Unorm,
}

impl TextureFormat {
    pub fn is_srgb(&self) -> bool {
        matches!(
            self,
            TextureFormat::Rgba8UnormSrgb | TextureFormat::Bgra8UnormSrgb
        )
    }

    pub fn bytes_per_pixel(&self) -> u32 {
        match self {
            TextureFormat::Rgba8Unorm
            | TextureFormat::Rgba8UnormSrgb
            | TextureFormat::Bgra8Unorm
            | TextureFormat::Bgra8UnormSrgb
            | TextureFormat::Rgb10A2Unorm => 4,
            TextureFormat::Rgba16Float => 8,
        }
    }
}

/// Color space a surface format is presented in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ColorSpace {
    #[default]
    SrgbNonLinear,
    ExtendedSrgbLinear,
}

/// A format/color-space pair reported by the surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SurfaceFormat {
    pub format: TextureFormat,
    pub color_space: ColorSpace,
}

impl SurfaceFormat {
    pub fn new(format: TextureFormat) -> Self {
        Self {
            format,
            color_space: ColorSpace::SrgbNonLinear,
        }
    }
}

/// Two-dimensional pixel extent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Extent2d {
    pub width: u32,
    pub height: u32,
}

impl Extent2d {
    /// Sentinel reported by surfaces whose extent follows the window size.
    pub const FOLLOW_WINDOW: Self = Self {
        width: u32::MAX,
        height: u32::MAX,
    };

    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_follow_window(&self) -> bool {
        self.width == u32::MAX
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Clamp each dimension into `[min, max]`.
    pub fn clamp(self, min: Extent2d, max: Extent2d) -> Self {
        Self {
            width: self.width.clamp(min.width, max.width.max(min.width)),
            height: self.height.clamp(min.height, max.height.max(min.height)),
        }
    }
}

/// Presentation mode of a swapchain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PresentMode {
    /// No synchronization, may tear.
    Immediate,
    /// Non-blocking replace-latest queue.
    Mailbox,
    /// VSync. Always supported.
    #[default]
    Fifo,
    FifoRelaxed,
}

impl PresentMode {
    /// Present modes that never block the presenting thread on vblank.
    pub fn is_non_blocking(&self) -> bool {
        matches!(self, PresentMode::Immediate | PresentMode::Mailbox)
    }
}

/// What the surface reports it can do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceCapabilities {
    /// Current extent, or [`Extent2d::FOLLOW_WINDOW`].
    pub current_extent: Extent2d,
    pub min_image_extent: Extent2d,
    pub max_image_extent: Extent2d,
    pub min_image_count: u32,
    /// Zero means "no limit".
    pub max_image_count: u32,
}

/// Parameters for swapchain creation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainDescriptor {
    pub format: SurfaceFormat,
    pub extent: Extent2d,
    pub image_count: u32,
    pub present_mode: PresentMode,
}

/// Result of asking the swapchain for the next image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquiredImage {
    /// An image is ready at this index.
    Ready(u32),
    /// The surface is out of date or suboptimal and must be recreated.
    Stale,
}

/// Result of presenting an image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentStatus {
    Presented,
    /// The surface is out of date or suboptimal and must be recreated.
    Stale,
}

/// Image layouts the frame loop moves swapchain images through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageLayout {
    Undefined,
    ColorAttachment,
    Present,
}

/// Pipeline stage a submission waits at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    ColorAttachmentOutput,
    AllCommands,
}

/// Buffer usage flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferUsage(u32);

impl BufferUsage {
    pub const COPY_SRC: Self = Self(1 << 0);
    pub const COPY_DST: Self = Self(1 << 1);
    pub const INDEX: Self = Self(1 << 2);
    pub const VERTEX: Self = Self(1 << 3);
    pub const UNIFORM: Self = Self(1 << 4);
    pub const STORAGE: Self = Self(1 << 5);
    pub const INDIRECT: Self = Self(1 << 6);

    pub fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    pub fn bits(&self) -> u32 {
        self.0
    }
}

impl std::ops::BitOr for BufferUsage {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

/// Buffer descriptor
#[derive(Debug, Clone)]
pub struct BufferDescriptor {
    pub label: Option<String>,
    pub size: u64,
    pub usage: BufferUsage,
    /// Host-visible and persistently mapped for the buffer's whole lifetime.
    pub mapped: bool,
}

impl BufferDescriptor {
    pub fn new(size: u64, usage: BufferUsage) -> Self {
        Self {
            label: None,
            size,
            usage,
            mapped: true,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

/// Index element type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexFormat {
    Uint16,
    Uint32,
}

/// Fixed graphics pipeline description.
///
/// The set layout is not configurable: binding 0 is the camera uniform
/// buffer and binding 1 the instance storage buffer, both vertex-stage.
#[derive(Debug, Clone)]
pub struct PipelineDescriptor {
    pub label: Option<String>,
    pub vertex_spirv: Vec<u32>,
    pub fragment_spirv: Vec<u32>,
    pub vertex_stride: u32,
    pub color_format: TextureFormat,
}

/// One queue submission of a single command buffer
#[derive(Debug, Clone, Copy)]
pub struct SubmitInfo {
    pub command_buffer: super::CommandBufferHandle,
    pub wait_semaphore: Option<super::SemaphoreHandle>,
    pub wait_stage: PipelineStage,
    pub signal_semaphore: Option<super::SemaphoreHandle>,
    pub fence: Option<super::FenceHandle>,
}

/// Standard vertex format
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct Vertex {
    pub position: Vec3,
    pub normal: Vec3,
    pub uv: Vec2,
    pub color: Vec4,
}

impl Vertex {
    pub fn new(position: Vec3, normal: Vec3, uv: Vec2) -> Self {
        Self {
            position,
            normal,
            uv,
            color: Vec4::ONE,
        }
    }

    pub fn with_color(mut self, color: Vec4) -> Self {
        self.color = color;
        self
    }

    /// Byte stride of one vertex in the shared vertex arena.
    pub const STRIDE: u64 = std::mem::size_of::<Vertex>() as u64;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vertex_stride() {
        // 3 + 3 + 2 + 4 floats
        assert_eq!(Vertex::STRIDE, 48);
    }

    #[test]
    fn test_extent_clamp() {
        let clamped = Extent2d::new(5000, 10).clamp(Extent2d::new(16, 16), Extent2d::new(4096, 4096));
        assert_eq!(clamped, Extent2d::new(4096, 16));
    }

    #[test]
    fn test_follow_window_sentinel() {
        assert!(Extent2d::FOLLOW_WINDOW.is_follow_window());
        assert!(!Extent2d::new(800, 600).is_follow_window());
    }

    #[test]
    fn test_buffer_usage_flags() {
        let usage = BufferUsage::STORAGE | BufferUsage::VERTEX;
        assert!(usage.contains(BufferUsage::VERTEX));
        assert!(!usage.contains(BufferUsage::INDEX));
    }
}

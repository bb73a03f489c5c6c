//! Vulkan backend implementation using ash
//!
//! Vulkan 1.3 with dynamic rendering, so there are no render passes or
//! framebuffers to rebuild when the swapchain changes. Buffers are
//! allocated with gpu-allocator; buffers created `mapped` live in
//! host-visible memory and stay mapped for their lifetime.
//!
//! Objects are kept in handle maps behind one mutex. The mutex also provides
//! the external synchronization Vulkan requires for the command pool and
//! descriptor pool. Fence waits resolve the handle under the lock and then
//! block without it.

mod conversion;

use crate::backend::error::{BackendError, BackendResult};
use crate::backend::traits::*;
use crate::backend::types::*;
use ash::khr::{surface, swapchain};
use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::collections::HashMap;
use std::time::Duration;

/// Descriptor sets the pool can hold at once.
const MAX_BIND_GROUPS: u32 = 64;

struct VkBuffer {
    buffer: vk::Buffer,
    allocation: Allocation,
    size: u64,
}

struct VkSwapchain {
    swapchain: vk::SwapchainKHR,
    images: Vec<u64>,
}

struct VkPipeline {
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
}

#[derive(Default)]
struct VulkanState {
    allocator: Option<Allocator>,
    next_id: u64,
    buffers: HashMap<u64, VkBuffer>,
    fences: HashMap<u64, vk::Fence>,
    semaphores: HashMap<u64, vk::Semaphore>,
    command_buffers: HashMap<u64, vk::CommandBuffer>,
    swapchains: HashMap<u64, VkSwapchain>,
    images: HashMap<u64, vk::Image>,
    views: HashMap<u64, vk::ImageView>,
    pipelines: HashMap<u64, VkPipeline>,
    bind_groups: HashMap<u64, vk::DescriptorSet>,
}

impl VulkanState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

fn lookup<T: Copy>(map: &HashMap<u64, T>, id: u64, what: &'static str) -> BackendResult<T> {
    map.get(&id).copied().ok_or(BackendError::InvalidHandle(what))
}

/// Vulkan backend implementation
pub struct VulkanBackend {
    _entry: ash::Entry,
    instance: ash::Instance,
    surface_fn: surface::Instance,
    swapchain_fn: swapchain::Device,
    surface: vk::SurfaceKHR,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
    queue: Mutex<vk::Queue>,
    command_pool: vk::CommandPool,
    descriptor_pool: vk::DescriptorPool,
    set_layout: vk::DescriptorSetLayout,
    device_name: String,
    state: Mutex<VulkanState>,
}

impl VulkanBackend {
    /// Create an instance, a surface for `window` and a device that can present to it.
    pub fn new(window: &winit::window::Window) -> BackendResult<Self> {
        unsafe {
            let entry = ash::Entry::load()
                .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;

            let app_info = vk::ApplicationInfo::default()
                .application_name(c"indirect-renderer")
                .application_version(vk::make_api_version(0, 0, 1, 0))
                .engine_name(c"indirect-renderer")
                .engine_version(vk::make_api_version(0, 0, 1, 0))
                .api_version(vk::API_VERSION_1_3);

            let display_handle = window
                .display_handle()
                .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;
            let window_handle = window
                .window_handle()
                .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;

            let extensions = ash_window::enumerate_required_extensions(display_handle.as_raw())
                .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;

            let instance_info = vk::InstanceCreateInfo::default()
                .application_info(&app_info)
                .enabled_extension_names(extensions);

            let instance = entry
                .create_instance(&instance_info, None)
                .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;

            let surface_fn = surface::Instance::new(&entry, &instance);
            let surface = match ash_window::create_surface(
                &entry,
                &instance,
                display_handle.as_raw(),
                window_handle.as_raw(),
                None,
            ) {
                Ok(surface) => surface,
                Err(e) => {
                    instance.destroy_instance(None);
                    return Err(BackendError::SurfaceCreationFailed(e.to_string()));
                }
            };

            let selected = Self::select_device(&instance, &surface_fn, surface);
            let (physical_device, queue_family) = match selected {
                Some(found) => found,
                None => {
                    surface_fn.destroy_surface(surface, None);
                    instance.destroy_instance(None);
                    return Err(BackendError::NoSuitableDevice);
                }
            };

            let properties = instance.get_physical_device_properties(physical_device);
            let device_name = properties
                .device_name_as_c_str()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "unknown device".to_string());
            log::info!("Selected Vulkan device: {}", device_name);

            let queue_priorities = [1.0f32];
            let queue_infos = [vk::DeviceQueueCreateInfo::default()
                .queue_family_index(queue_family)
                .queue_priorities(&queue_priorities)];
            let device_extensions = [swapchain::NAME.as_ptr()];
            let mut features13 = vk::PhysicalDeviceVulkan13Features::default()
                .dynamic_rendering(true);

            let device_info = vk::DeviceCreateInfo::default()
                .queue_create_infos(&queue_infos)
                .enabled_extension_names(&device_extensions)
                .push_next(&mut features13);

            let device = match instance.create_device(physical_device, &device_info, None) {
                Ok(device) => device,
                Err(e) => {
                    surface_fn.destroy_surface(surface, None);
                    instance.destroy_instance(None);
                    return Err(BackendError::InitializationFailed(e.to_string()));
                }
            };
            let queue = device.get_device_queue(queue_family, 0);
            let swapchain_fn = swapchain::Device::new(&instance, &device);

            // From here on, partially built state is released by Drop.
            let mut backend = Self {
                _entry: entry,
                instance,
                surface_fn,
                swapchain_fn,
                surface,
                physical_device,
                device,
                queue: Mutex::new(queue),
                command_pool: vk::CommandPool::null(),
                descriptor_pool: vk::DescriptorPool::null(),
                set_layout: vk::DescriptorSetLayout::null(),
                device_name,
                state: Mutex::new(VulkanState::default()),
            };

            let allocator = Allocator::new(&AllocatorCreateDesc {
                instance: backend.instance.clone(),
                device: backend.device.clone(),
                physical_device,
                debug_settings: Default::default(),
                buffer_device_address: false,
                allocation_sizes: Default::default(),
            })
            .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;
            backend.state.get_mut().allocator = Some(allocator);

            let pool_info = vk::CommandPoolCreateInfo::default()
                .queue_family_index(queue_family)
                .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
            backend.command_pool = backend
                .device
                .create_command_pool(&pool_info, None)
                .map_err(|e| conversion::error(e, "create_command_pool"))?;

            let pool_sizes = [
                vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::UNIFORM_BUFFER,
                    descriptor_count: MAX_BIND_GROUPS,
                },
                vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::STORAGE_BUFFER,
                    descriptor_count: MAX_BIND_GROUPS,
                },
            ];
            let descriptor_pool_info = vk::DescriptorPoolCreateInfo::default()
                .pool_sizes(&pool_sizes)
                .max_sets(MAX_BIND_GROUPS)
                .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET);
            backend.descriptor_pool = backend
                .device
                .create_descriptor_pool(&descriptor_pool_info, None)
                .map_err(|e| conversion::error(e, "create_descriptor_pool"))?;

            // binding 0: camera uniform, binding 1: instance storage
            let bindings = [
                vk::DescriptorSetLayoutBinding::default()
                    .binding(0)
                    .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                    .descriptor_count(1)
                    .stage_flags(vk::ShaderStageFlags::VERTEX),
                vk::DescriptorSetLayoutBinding::default()
                    .binding(1)
                    .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                    .descriptor_count(1)
                    .stage_flags(vk::ShaderStageFlags::VERTEX),
            ];
            let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
            backend.set_layout = backend
                .device
                .create_descriptor_set_layout(&layout_info, None)
                .map_err(|e| conversion::error(e, "create_descriptor_set_layout"))?;

            Ok(backend)
        }
    }

    /// Name of the physical device in use
    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// Pick a Vulkan 1.3 device with a queue family that can both draw and
    /// present, preferring discrete GPUs.
    unsafe fn select_device(
        instance: &ash::Instance,
        surface_fn: &surface::Instance,
        surface: vk::SurfaceKHR,
    ) -> Option<(vk::PhysicalDevice, u32)> {
        let physical_devices = instance.enumerate_physical_devices().ok()?;

        let mut candidates: Vec<(vk::PhysicalDevice, u32, bool)> = physical_devices
            .into_iter()
            .filter_map(|pd| {
                let properties = instance.get_physical_device_properties(pd);
                if properties.api_version < vk::API_VERSION_1_3 {
                    return None;
                }
                if !Self::supports_swapchain(instance, pd) {
                    return None;
                }
                let family = Self::find_queue_family(instance, pd, surface_fn, surface)?;
                let discrete = properties.device_type == vk::PhysicalDeviceType::DISCRETE_GPU;
                Some((pd, family, discrete))
            })
            .collect();

        candidates.sort_by_key(|(_, _, discrete)| !discrete);
        candidates.first().map(|&(pd, family, _)| (pd, family))
    }

    unsafe fn supports_swapchain(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> bool {
        instance
            .enumerate_device_extension_properties(physical_device)
            .map(|extensions| {
                extensions
                    .iter()
                    .any(|ext| ext.extension_name_as_c_str().is_ok_and(|name| name == swapchain::NAME))
            })
            .unwrap_or(false)
    }

    fn find_queue_family(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        surface_fn: &surface::Instance,
        surface: vk::SurfaceKHR,
    ) -> Option<u32> {
        let queue_families =
            unsafe { instance.get_physical_device_queue_family_properties(physical_device) };

        for (index, family) in queue_families.iter().enumerate() {
            let supports_graphics = family.queue_flags.contains(vk::QueueFlags::GRAPHICS);
            let supports_surface = unsafe {
                surface_fn
                    .get_physical_device_surface_support(physical_device, index as u32, surface)
                    .unwrap_or(false)
            };

            if supports_graphics && supports_surface {
                return Some(index as u32);
            }
        }
        None
    }

    /// Resolve a command buffer for recording, logging unknown handles.
    fn recording(&self, state: &VulkanState, cmd: CommandBufferHandle) -> Option<vk::CommandBuffer> {
        let found = state.command_buffers.get(&cmd.0).copied();
        if found.is_none() {
            log::error!("Recording into unknown command buffer {}", cmd.0);
        }
        found
    }

    unsafe fn create_shader_module(&self, words: &[u32]) -> BackendResult<vk::ShaderModule> {
        let info = vk::ShaderModuleCreateInfo::default().code(words);
        self.device
            .create_shader_module(&info, None)
            .map_err(|e| BackendError::ShaderModuleCreationFailed(e.to_string()))
    }
}

impl GpuBackend for VulkanBackend {
    fn name(&self) -> &'static str {
        "Vulkan"
    }

    fn create_buffer(&self, descriptor: &BufferDescriptor) -> BackendResult<BufferHandle> {
        let mut state = self.state.lock();
        unsafe {
            let buffer_info = vk::BufferCreateInfo::default()
                .size(descriptor.size)
                .usage(conversion::buffer_usage(descriptor.usage))
                .sharing_mode(vk::SharingMode::EXCLUSIVE);

            let buffer = self
                .device
                .create_buffer(&buffer_info, None)
                .map_err(|e| BackendError::BufferCreationFailed(e.to_string()))?;
            let requirements = self.device.get_buffer_memory_requirements(buffer);

            let location = if descriptor.mapped {
                MemoryLocation::CpuToGpu
            } else {
                MemoryLocation::GpuOnly
            };

            let allocator = match state.allocator.as_mut() {
                Some(allocator) => allocator,
                None => {
                    self.device.destroy_buffer(buffer, None);
                    return Err(BackendError::BufferCreationFailed(
                        "allocator not available".into(),
                    ));
                }
            };
            let allocation = match allocator.allocate(&AllocationCreateDesc {
                name: descriptor.label.as_deref().unwrap_or("buffer"),
                requirements,
                location,
                linear: true,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            }) {
                Ok(allocation) => allocation,
                Err(gpu_allocator::AllocationError::OutOfMemory) => {
                    self.device.destroy_buffer(buffer, None);
                    return Err(BackendError::OutOfMemory);
                }
                Err(e) => {
                    self.device.destroy_buffer(buffer, None);
                    return Err(BackendError::BufferCreationFailed(e.to_string()));
                }
            };

            if let Err(e) =
                self.device
                    .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
            {
                self.device.destroy_buffer(buffer, None);
                let _ = allocator.free(allocation);
                return Err(BackendError::BufferCreationFailed(e.to_string()));
            }

            let id = state.next_id();
            state.buffers.insert(
                id,
                VkBuffer {
                    buffer,
                    allocation,
                    size: descriptor.size,
                },
            );
            log::debug!(
                "Created buffer {:?} ({} bytes)",
                descriptor.label,
                descriptor.size
            );
            Ok(BufferHandle(id))
        }
    }

    fn write_buffer(&self, buffer: BufferHandle, offset: u64, data: &[u8]) -> BackendResult<()> {
        let mut state = self.state.lock();
        let vk_buffer = state
            .buffers
            .get_mut(&buffer.0)
            .ok_or(BackendError::InvalidHandle("buffer"))?;
        let end = offset
            .checked_add(data.len() as u64)
            .filter(|&end| end <= vk_buffer.size)
            .ok_or(BackendError::OutOfBounds {
                offset,
                size: data.len() as u64,
                capacity: vk_buffer.size,
            })?;
        let mapped = vk_buffer
            .allocation
            .mapped_slice_mut()
            .ok_or(BackendError::InvalidHandle("buffer is not host-mapped"))?;
        mapped[offset as usize..end as usize].copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(&self, buffer: BufferHandle, offset: u64, size: u64) -> BackendResult<Vec<u8>> {
        let state = self.state.lock();
        let vk_buffer = state
            .buffers
            .get(&buffer.0)
            .ok_or(BackendError::InvalidHandle("buffer"))?;
        let end = offset
            .checked_add(size)
            .filter(|&end| end <= vk_buffer.size)
            .ok_or(BackendError::OutOfBounds {
                offset,
                size,
                capacity: vk_buffer.size,
            })?;
        let mapped = vk_buffer
            .allocation
            .mapped_slice()
            .ok_or(BackendError::InvalidHandle("buffer is not host-mapped"))?;
        Ok(mapped[offset as usize..end as usize].to_vec())
    }

    fn destroy_buffer(&self, buffer: BufferHandle) {
        let mut state = self.state.lock();
        if let Some(vk_buffer) = state.buffers.remove(&buffer.0) {
            unsafe {
                self.device.destroy_buffer(vk_buffer.buffer, None);
            }
            if let Some(allocator) = state.allocator.as_mut() {
                if let Err(e) = allocator.free(vk_buffer.allocation) {
                    log::warn!("Failed to free buffer memory: {}", e);
                }
            }
        }
    }

    fn create_fence(&self, signaled: bool) -> BackendResult<FenceHandle> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let info = vk::FenceCreateInfo::default().flags(flags);
        let fence = unsafe { self.device.create_fence(&info, None) }
            .map_err(|e| conversion::error(e, "create_fence"))?;
        let mut state = self.state.lock();
        let id = state.next_id();
        state.fences.insert(id, fence);
        Ok(FenceHandle(id))
    }

    fn wait_fence(&self, fence: FenceHandle) -> BackendResult<()> {
        let vk_fence = lookup(&self.state.lock().fences, fence.0, "fence")?;
        unsafe { self.device.wait_for_fences(&[vk_fence], true, u64::MAX) }
            .map_err(|e| conversion::error(e, "wait_for_fences"))
    }

    fn wait_fence_timeout(&self, fence: FenceHandle, timeout: Duration) -> BackendResult<bool> {
        let vk_fence = lookup(&self.state.lock().fences, fence.0, "fence")?;
        let nanos = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
        match unsafe { self.device.wait_for_fences(&[vk_fence], true, nanos) } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(e) => Err(conversion::error(e, "wait_for_fences")),
        }
    }

    fn is_fence_signaled(&self, fence: FenceHandle) -> BackendResult<bool> {
        let vk_fence = lookup(&self.state.lock().fences, fence.0, "fence")?;
        unsafe { self.device.get_fence_status(vk_fence) }
            .map_err(|e| conversion::error(e, "get_fence_status"))
    }

    fn reset_fence(&self, fence: FenceHandle) -> BackendResult<()> {
        let vk_fence = lookup(&self.state.lock().fences, fence.0, "fence")?;
        unsafe { self.device.reset_fences(&[vk_fence]) }
            .map_err(|e| conversion::error(e, "reset_fences"))
    }

    fn destroy_fence(&self, fence: FenceHandle) {
        if let Some(vk_fence) = self.state.lock().fences.remove(&fence.0) {
            unsafe { self.device.destroy_fence(vk_fence, None) };
        }
    }

    fn create_semaphore(&self) -> BackendResult<SemaphoreHandle> {
        let info = vk::SemaphoreCreateInfo::default();
        let semaphore = unsafe { self.device.create_semaphore(&info, None) }
            .map_err(|e| conversion::error(e, "create_semaphore"))?;
        let mut state = self.state.lock();
        let id = state.next_id();
        state.semaphores.insert(id, semaphore);
        Ok(SemaphoreHandle(id))
    }

    fn destroy_semaphore(&self, semaphore: SemaphoreHandle) {
        if let Some(vk_semaphore) = self.state.lock().semaphores.remove(&semaphore.0) {
            unsafe { self.device.destroy_semaphore(vk_semaphore, None) };
        }
    }

    fn wait_idle(&self) -> BackendResult<()> {
        unsafe { self.device.device_wait_idle() }
            .map_err(|e| conversion::error(e, "device_wait_idle"))
    }

    fn allocate_command_buffer(&self) -> BackendResult<CommandBufferHandle> {
        let mut state = self.state.lock();
        let info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffers = unsafe { self.device.allocate_command_buffers(&info) }
            .map_err(|e| conversion::error(e, "allocate_command_buffers"))?;
        let cmd = buffers
            .first()
            .copied()
            .ok_or_else(|| BackendError::Vulkan("no command buffer allocated".into()))?;
        let id = state.next_id();
        state.command_buffers.insert(id, cmd);
        Ok(CommandBufferHandle(id))
    }

    fn free_command_buffer(&self, cmd: CommandBufferHandle) {
        let mut state = self.state.lock();
        if let Some(vk_cmd) = state.command_buffers.remove(&cmd.0) {
            unsafe { self.device.free_command_buffers(self.command_pool, &[vk_cmd]) };
        }
    }

    fn reset_command_buffer(&self, cmd: CommandBufferHandle) -> BackendResult<()> {
        let state = self.state.lock();
        let vk_cmd = lookup(&state.command_buffers, cmd.0, "command buffer")?;
        unsafe {
            self.device
                .reset_command_buffer(vk_cmd, vk::CommandBufferResetFlags::empty())
        }
        .map_err(|e| conversion::error(e, "reset_command_buffer"))
    }

    fn begin_command_buffer(&self, cmd: CommandBufferHandle) -> BackendResult<()> {
        let state = self.state.lock();
        let vk_cmd = lookup(&state.command_buffers, cmd.0, "command buffer")?;
        let info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.device.begin_command_buffer(vk_cmd, &info) }
            .map_err(|e| conversion::error(e, "begin_command_buffer"))
    }

    fn end_command_buffer(&self, cmd: CommandBufferHandle) -> BackendResult<()> {
        let state = self.state.lock();
        let vk_cmd = lookup(&state.command_buffers, cmd.0, "command buffer")?;
        unsafe { self.device.end_command_buffer(vk_cmd) }
            .map_err(|e| conversion::error(e, "end_command_buffer"))
    }

    fn cmd_transition_image(
        &self,
        cmd: CommandBufferHandle,
        image: ImageHandle,
        old_layout: ImageLayout,
        new_layout: ImageLayout,
    ) {
        let state = self.state.lock();
        let Some(vk_cmd) = self.recording(&state, cmd) else {
            return;
        };
        let Some(&vk_image) = state.images.get(&image.0) else {
            log::error!("Transition of unknown image {}", image.0);
            return;
        };

        let masks = conversion::transition_masks(old_layout, new_layout);
        let barrier = vk::ImageMemoryBarrier::default()
            .old_layout(conversion::image_layout(old_layout))
            .new_layout(conversion::image_layout(new_layout))
            .src_access_mask(masks.src_access)
            .dst_access_mask(masks.dst_access)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(vk_image)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });

        unsafe {
            self.device.cmd_pipeline_barrier(
                vk_cmd,
                masks.src_stage,
                masks.dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
        }
    }

    fn cmd_begin_rendering(
        &self,
        cmd: CommandBufferHandle,
        view: ImageViewHandle,
        extent: Extent2d,
        clear: [f32; 4],
    ) {
        let state = self.state.lock();
        let Some(vk_cmd) = self.recording(&state, cmd) else {
            return;
        };
        let Some(&vk_view) = state.views.get(&view.0) else {
            log::error!("Rendering to unknown image view {}", view.0);
            return;
        };

        let attachments = [vk::RenderingAttachmentInfo::default()
            .image_view(vk_view)
            .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .clear_value(vk::ClearValue {
                color: vk::ClearColorValue { float32: clear },
            })];
        let rendering_info = vk::RenderingInfo::default()
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: conversion::extent(extent),
            })
            .layer_count(1)
            .color_attachments(&attachments);

        unsafe { self.device.cmd_begin_rendering(vk_cmd, &rendering_info) };
    }

    fn cmd_end_rendering(&self, cmd: CommandBufferHandle) {
        let state = self.state.lock();
        if let Some(vk_cmd) = self.recording(&state, cmd) {
            unsafe { self.device.cmd_end_rendering(vk_cmd) };
        }
    }

    fn cmd_set_viewport(&self, cmd: CommandBufferHandle, extent: Extent2d) {
        let state = self.state.lock();
        let Some(vk_cmd) = self.recording(&state, cmd) else {
            return;
        };
        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        unsafe { self.device.cmd_set_viewport(vk_cmd, 0, &[viewport]) };
    }

    fn cmd_set_scissor(&self, cmd: CommandBufferHandle, extent: Extent2d) {
        let state = self.state.lock();
        let Some(vk_cmd) = self.recording(&state, cmd) else {
            return;
        };
        let scissor = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: conversion::extent(extent),
        };
        unsafe { self.device.cmd_set_scissor(vk_cmd, 0, &[scissor]) };
    }

    fn cmd_bind_pipeline(&self, cmd: CommandBufferHandle, pipeline: PipelineHandle) {
        let state = self.state.lock();
        let Some(vk_cmd) = self.recording(&state, cmd) else {
            return;
        };
        let Some(vk_pipeline) = state.pipelines.get(&pipeline.0) else {
            log::error!("Binding unknown pipeline {}", pipeline.0);
            return;
        };
        unsafe {
            self.device.cmd_bind_pipeline(
                vk_cmd,
                vk::PipelineBindPoint::GRAPHICS,
                vk_pipeline.pipeline,
            )
        };
    }

    fn cmd_bind_group(
        &self,
        cmd: CommandBufferHandle,
        pipeline: PipelineHandle,
        group: BindGroupHandle,
    ) {
        let state = self.state.lock();
        let Some(vk_cmd) = self.recording(&state, cmd) else {
            return;
        };
        let (Some(vk_pipeline), Some(&set)) = (
            state.pipelines.get(&pipeline.0),
            state.bind_groups.get(&group.0),
        ) else {
            log::error!("Binding unknown bind group {} / pipeline {}", group.0, pipeline.0);
            return;
        };
        unsafe {
            self.device.cmd_bind_descriptor_sets(
                vk_cmd,
                vk::PipelineBindPoint::GRAPHICS,
                vk_pipeline.layout,
                0,
                &[set],
                &[],
            )
        };
    }

    fn cmd_bind_vertex_buffer(&self, cmd: CommandBufferHandle, buffer: BufferHandle, offset: u64) {
        let state = self.state.lock();
        let Some(vk_cmd) = self.recording(&state, cmd) else {
            return;
        };
        let Some(vk_buffer) = state.buffers.get(&buffer.0) else {
            log::error!("Binding unknown vertex buffer {}", buffer.0);
            return;
        };
        unsafe {
            self.device
                .cmd_bind_vertex_buffers(vk_cmd, 0, &[vk_buffer.buffer], &[offset])
        };
    }

    fn cmd_bind_index_buffer(
        &self,
        cmd: CommandBufferHandle,
        buffer: BufferHandle,
        offset: u64,
        format: IndexFormat,
    ) {
        let state = self.state.lock();
        let Some(vk_cmd) = self.recording(&state, cmd) else {
            return;
        };
        let Some(vk_buffer) = state.buffers.get(&buffer.0) else {
            log::error!("Binding unknown index buffer {}", buffer.0);
            return;
        };
        unsafe {
            self.device.cmd_bind_index_buffer(
                vk_cmd,
                vk_buffer.buffer,
                offset,
                conversion::index_type(format),
            )
        };
    }

    fn cmd_draw_indexed_indirect(
        &self,
        cmd: CommandBufferHandle,
        buffer: BufferHandle,
        offset: u64,
        draw_count: u32,
        stride: u32,
    ) {
        let state = self.state.lock();
        let Some(vk_cmd) = self.recording(&state, cmd) else {
            return;
        };
        let Some(vk_buffer) = state.buffers.get(&buffer.0) else {
            log::error!("Indirect draw from unknown buffer {}", buffer.0);
            return;
        };
        unsafe {
            self.device.cmd_draw_indexed_indirect(
                vk_cmd,
                vk_buffer.buffer,
                offset,
                draw_count,
                stride,
            )
        };
    }

    fn submit(&self, info: &SubmitInfo) -> BackendResult<()> {
        let (cmd, wait, signal, fence) = {
            let state = self.state.lock();
            let cmd = lookup(&state.command_buffers, info.command_buffer.0, "command buffer")?;
            let wait = info
                .wait_semaphore
                .map(|s| lookup(&state.semaphores, s.0, "semaphore"))
                .transpose()?;
            let signal = info
                .signal_semaphore
                .map(|s| lookup(&state.semaphores, s.0, "semaphore"))
                .transpose()?;
            let fence = info
                .fence
                .map(|f| lookup(&state.fences, f.0, "fence"))
                .transpose()?
                .unwrap_or(vk::Fence::null());
            (cmd, wait, signal, fence)
        };

        let command_buffers = [cmd];
        let wait_semaphores: Vec<vk::Semaphore> = wait.into_iter().collect();
        let wait_stages: Vec<vk::PipelineStageFlags> = wait
            .iter()
            .map(|_| conversion::pipeline_stage(info.wait_stage))
            .collect();
        let signal_semaphores: Vec<vk::Semaphore> = signal.into_iter().collect();

        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        let queue = self.queue.lock();
        unsafe { self.device.queue_submit(*queue, &[submit_info], fence) }
            .map_err(|e| conversion::error(e, "queue_submit"))
    }

    fn surface_capabilities(&self) -> BackendResult<SurfaceCapabilities> {
        let caps = unsafe {
            self.surface_fn
                .get_physical_device_surface_capabilities(self.physical_device, self.surface)
        }
        .map_err(|e| conversion::error(e, "get_physical_device_surface_capabilities"))?;

        Ok(SurfaceCapabilities {
            current_extent: conversion::extent_back(caps.current_extent),
            min_image_extent: conversion::extent_back(caps.min_image_extent),
            max_image_extent: conversion::extent_back(caps.max_image_extent),
            min_image_count: caps.min_image_count,
            max_image_count: caps.max_image_count,
        })
    }

    fn surface_formats(&self) -> BackendResult<Vec<SurfaceFormat>> {
        let formats = unsafe {
            self.surface_fn
                .get_physical_device_surface_formats(self.physical_device, self.surface)
        }
        .map_err(|e| conversion::error(e, "get_physical_device_surface_formats"))?;

        Ok(formats
            .iter()
            .filter_map(|f| {
                Some(SurfaceFormat {
                    format: conversion::format_back(f.format)?,
                    color_space: conversion::color_space_back(f.color_space)?,
                })
            })
            .collect())
    }

    fn present_modes(&self) -> BackendResult<Vec<PresentMode>> {
        let modes = unsafe {
            self.surface_fn
                .get_physical_device_surface_present_modes(self.physical_device, self.surface)
        }
        .map_err(|e| conversion::error(e, "get_physical_device_surface_present_modes"))?;

        Ok(modes
            .into_iter()
            .filter_map(conversion::present_mode_back)
            .collect())
    }

    fn create_swapchain(&self, descriptor: &SwapchainDescriptor) -> BackendResult<SwapchainHandle> {
        let caps = unsafe {
            self.surface_fn
                .get_physical_device_surface_capabilities(self.physical_device, self.surface)
        }
        .map_err(|e| conversion::error(e, "get_physical_device_surface_capabilities"))?;

        let info = vk::SwapchainCreateInfoKHR::default()
            .surface(self.surface)
            .min_image_count(descriptor.image_count)
            .image_format(conversion::format(descriptor.format.format))
            .image_color_space(conversion::color_space(descriptor.format.color_space))
            .image_extent(conversion::extent(descriptor.extent))
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(conversion::present_mode(descriptor.present_mode))
            .clipped(true);

        let swapchain = unsafe { self.swapchain_fn.create_swapchain(&info, None) }
            .map_err(|e| BackendError::SwapchainCreationFailed(e.to_string()))?;
        let vk_images = match unsafe { self.swapchain_fn.get_swapchain_images(swapchain) } {
            Ok(images) => images,
            Err(e) => {
                unsafe { self.swapchain_fn.destroy_swapchain(swapchain, None) };
                return Err(BackendError::SwapchainCreationFailed(e.to_string()));
            }
        };

        let mut state = self.state.lock();
        let mut images = Vec::with_capacity(vk_images.len());
        for image in vk_images {
            let id = state.next_id();
            state.images.insert(id, image);
            images.push(id);
        }
        let id = state.next_id();
        state.swapchains.insert(id, VkSwapchain { swapchain, images });
        log::debug!(
            "Created swapchain {}x{} ({:?}, {} images)",
            descriptor.extent.width,
            descriptor.extent.height,
            descriptor.present_mode,
            descriptor.image_count
        );
        Ok(SwapchainHandle(id))
    }

    fn swapchain_images(&self, swapchain: SwapchainHandle) -> BackendResult<Vec<ImageHandle>> {
        let state = self.state.lock();
        let vk_swapchain = state
            .swapchains
            .get(&swapchain.0)
            .ok_or(BackendError::InvalidHandle("swapchain"))?;
        Ok(vk_swapchain.images.iter().map(|&id| ImageHandle(id)).collect())
    }

    fn destroy_swapchain(&self, swapchain: SwapchainHandle) {
        let mut state = self.state.lock();
        if let Some(vk_swapchain) = state.swapchains.remove(&swapchain.0) {
            for id in &vk_swapchain.images {
                state.images.remove(id);
            }
            unsafe {
                self.swapchain_fn
                    .destroy_swapchain(vk_swapchain.swapchain, None)
            };
        }
    }

    fn create_image_view(
        &self,
        image: ImageHandle,
        format: TextureFormat,
    ) -> BackendResult<ImageViewHandle> {
        let mut state = self.state.lock();
        let vk_image = lookup(&state.images, image.0, "image")?;
        let info = vk::ImageViewCreateInfo::default()
            .image(vk_image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(conversion::format(format))
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });
        let view = unsafe { self.device.create_image_view(&info, None) }
            .map_err(|e| conversion::error(e, "create_image_view"))?;
        let id = state.next_id();
        state.views.insert(id, view);
        Ok(ImageViewHandle(id))
    }

    fn destroy_image_view(&self, view: ImageViewHandle) {
        if let Some(vk_view) = self.state.lock().views.remove(&view.0) {
            unsafe { self.device.destroy_image_view(vk_view, None) };
        }
    }

    fn acquire_next_image(
        &self,
        swapchain: SwapchainHandle,
        semaphore: SemaphoreHandle,
    ) -> BackendResult<AcquiredImage> {
        let (vk_swapchain, vk_semaphore) = {
            let state = self.state.lock();
            let vk_swapchain = state
                .swapchains
                .get(&swapchain.0)
                .map(|s| s.swapchain)
                .ok_or(BackendError::InvalidHandle("swapchain"))?;
            (vk_swapchain, lookup(&state.semaphores, semaphore.0, "semaphore")?)
        };

        let result = unsafe {
            self.swapchain_fn.acquire_next_image(
                vk_swapchain,
                u64::MAX,
                vk_semaphore,
                vk::Fence::null(),
            )
        };
        match result {
            Ok((index, false)) => Ok(AcquiredImage::Ready(index)),
            Ok((_, true)) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquiredImage::Stale),
            Err(e) => Err(conversion::error(e, "acquire_next_image")),
        }
    }

    fn present(
        &self,
        swapchain: SwapchainHandle,
        image_index: u32,
        wait_semaphore: SemaphoreHandle,
    ) -> BackendResult<PresentStatus> {
        let (vk_swapchain, vk_semaphore) = {
            let state = self.state.lock();
            let vk_swapchain = state
                .swapchains
                .get(&swapchain.0)
                .map(|s| s.swapchain)
                .ok_or(BackendError::InvalidHandle("swapchain"))?;
            (vk_swapchain, lookup(&state.semaphores, wait_semaphore.0, "semaphore")?)
        };

        let wait_semaphores = [vk_semaphore];
        let swapchains = [vk_swapchain];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let queue = self.queue.lock();
        match unsafe { self.swapchain_fn.queue_present(*queue, &present_info) } {
            Ok(false) => Ok(PresentStatus::Presented),
            Ok(true) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentStatus::Stale),
            Err(e) => Err(conversion::error(e, "queue_present")),
        }
    }

    fn create_pipeline(&self, descriptor: &PipelineDescriptor) -> BackendResult<PipelineHandle> {
        unsafe {
            let vertex_module = self.create_shader_module(&descriptor.vertex_spirv)?;
            let fragment_module = match self.create_shader_module(&descriptor.fragment_spirv) {
                Ok(module) => module,
                Err(e) => {
                    self.device.destroy_shader_module(vertex_module, None);
                    return Err(e);
                }
            };

            let result = self.build_pipeline(descriptor, vertex_module, fragment_module);

            self.device.destroy_shader_module(vertex_module, None);
            self.device.destroy_shader_module(fragment_module, None);

            let pipeline = result?;
            let mut state = self.state.lock();
            let id = state.next_id();
            state.pipelines.insert(id, pipeline);
            log::debug!("Created pipeline {:?}", descriptor.label);
            Ok(PipelineHandle(id))
        }
    }

    fn destroy_pipeline(&self, pipeline: PipelineHandle) {
        if let Some(vk_pipeline) = self.state.lock().pipelines.remove(&pipeline.0) {
            unsafe {
                self.device.destroy_pipeline(vk_pipeline.pipeline, None);
                self.device.destroy_pipeline_layout(vk_pipeline.layout, None);
            }
        }
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
        let uniform = state
            .buffers
            .get(&uniform.0)
            .map(|b| b.buffer)
            .ok_or(BackendError::InvalidHandle("uniform buffer"))?;
        let storage = state
            .buffers
            .get(&storage.0)
            .map(|b| b.buffer)
            .ok_or(BackendError::InvalidHandle("storage buffer"))?;

        let layouts = [self.set_layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.descriptor_pool)
            .set_layouts(&layouts);
        let sets = unsafe { self.device.allocate_descriptor_sets(&alloc_info) }
            .map_err(|e| BackendError::PipelineCreationFailed(e.to_string()))?;
        let set = sets
            .first()
            .copied()
            .ok_or_else(|| BackendError::PipelineCreationFailed("no descriptor set".into()))?;

        let uniform_info = [vk::DescriptorBufferInfo {
            buffer: uniform,
            offset: 0,
            range: vk::WHOLE_SIZE,
        }];
        let storage_info = [vk::DescriptorBufferInfo {
            buffer: storage,
            offset: 0,
            range: vk::WHOLE_SIZE,
        }];
        let writes = [
            vk::WriteDescriptorSet::default()
                .dst_set(set)
                .dst_binding(0)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                .buffer_info(&uniform_info),
            vk::WriteDescriptorSet::default()
                .dst_set(set)
                .dst_binding(1)
                .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                .buffer_info(&storage_info),
        ];
        unsafe { self.device.update_descriptor_sets(&writes, &[]) };

        let id = state.next_id();
        state.bind_groups.insert(id, set);
        Ok(BindGroupHandle(id))
    }

    fn destroy_bind_group(&self, group: BindGroupHandle) {
        if let Some(set) = self.state.lock().bind_groups.remove(&group.0) {
            if let Err(e) =
                unsafe { self.device.free_descriptor_sets(self.descriptor_pool, &[set]) }
            {
                log::warn!("Failed to free descriptor set: {}", e);
            }
        }
    }
}

impl VulkanBackend {
    /// Instanced pipeline: one interleaved vertex binding, dynamic viewport and
    /// scissor, no depth, back faces culled.
    unsafe fn build_pipeline(
        &self,
        descriptor: &PipelineDescriptor,
        vertex_module: vk::ShaderModule,
        fragment_module: vk::ShaderModule,
    ) -> BackendResult<VkPipeline> {
        let layouts = [self.set_layout];
        let layout_info = vk::PipelineLayoutCreateInfo::default().set_layouts(&layouts);
        let layout = self
            .device
            .create_pipeline_layout(&layout_info, None)
            .map_err(|e| BackendError::PipelineCreationFailed(e.to_string()))?;

        let stages = [
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(vertex_module)
                .name(c"main"),
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(fragment_module)
                .name(c"main"),
        ];

        // position, normal, uv, color
        let bindings = [vk::VertexInputBindingDescription {
            binding: 0,
            stride: descriptor.vertex_stride,
            input_rate: vk::VertexInputRate::VERTEX,
        }];
        let attributes = [
            (0, vk::Format::R32G32B32_SFLOAT, 0),
            (1, vk::Format::R32G32B32_SFLOAT, 12),
            (2, vk::Format::R32G32_SFLOAT, 24),
            (3, vk::Format::R32G32B32A32_SFLOAT, 32),
        ]
        .map(|(location, format, offset)| vk::VertexInputAttributeDescription {
            location,
            binding: 0,
            format,
            offset,
        });
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&bindings)
            .vertex_attribute_descriptions(&attributes);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST);
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);
        // The camera projection flips Y, which reverses on-screen winding.
        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(vk::PolygonMode::FILL)
            .cull_mode(vk::CullModeFlags::BACK)
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .line_width(1.0);
        let multisample = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);
        let blend_attachments = [vk::PipelineColorBlendAttachmentState::default()
            .color_write_mask(vk::ColorComponentFlags::RGBA)];
        let color_blend =
            vk::PipelineColorBlendStateCreateInfo::default().attachments(&blend_attachments);
        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let color_formats = [conversion::format(descriptor.color_format)];
        let mut rendering =
            vk::PipelineRenderingCreateInfo::default().color_attachment_formats(&color_formats);

        let info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .color_blend_state(&color_blend)
            .dynamic_state(&dynamic_state)
            .layout(layout)
            .push_next(&mut rendering);

        match self
            .device
            .create_graphics_pipelines(vk::PipelineCache::null(), &[info], None)
        {
            Ok(pipelines) => match pipelines.first() {
                Some(&pipeline) => Ok(VkPipeline { pipeline, layout }),
                None => {
                    self.device.destroy_pipeline_layout(layout, None);
                    Err(BackendError::PipelineCreationFailed("no pipeline created".into()))
                }
            },
            Err((_, e)) => {
                self.device.destroy_pipeline_layout(layout, None);
                Err(BackendError::PipelineCreationFailed(e.to_string()))
            }
        }
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            let state = self.state.get_mut();

            for (_, pipeline) in state.pipelines.drain() {
                self.device.destroy_pipeline(pipeline.pipeline, None);
                self.device.destroy_pipeline_layout(pipeline.layout, None);
            }
            state.bind_groups.clear();

            for (_, view) in state.views.drain() {
                self.device.destroy_image_view(view, None);
            }
            for (_, swapchain) in state.swapchains.drain() {
                self.swapchain_fn.destroy_swapchain(swapchain.swapchain, None);
            }
            state.images.clear();

            for (_, buffer) in state.buffers.drain() {
                self.device.destroy_buffer(buffer.buffer, None);
                if let Some(allocator) = state.allocator.as_mut() {
                    let _ = allocator.free(buffer.allocation);
                }
            }
            // The allocator must go before the device
            drop(state.allocator.take());

            for (_, fence) in state.fences.drain() {
                self.device.destroy_fence(fence, None);
            }
            for (_, semaphore) in state.semaphores.drain() {
                self.device.destroy_semaphore(semaphore, None);
            }
            state.command_buffers.clear();

            if self.set_layout != vk::DescriptorSetLayout::null() {
                self.device.destroy_descriptor_set_layout(self.set_layout, None);
            }
            if self.descriptor_pool != vk::DescriptorPool::null() {
                self.device.destroy_descriptor_pool(self.descriptor_pool, None);
            }
            if self.command_pool != vk::CommandPool::null() {
                self.device.destroy_command_pool(self.command_pool, None);
            }

            self.device.destroy_device(None);
            self.surface_fn.destroy_surface(self.surface, None);
            self.instance.destroy_instance(None);
        }
    }
}

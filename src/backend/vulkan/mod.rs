//! Vulkan backend implementation using ash
//!
//! Dynamic rendering, one frame in flight, host-visible buffers. WGSL is
//! translated to SPIR-V with naga when a pipeline is created.

mod conversion;
mod deferred;

use crate::backend::shader::ParsedShader;
use crate::backend::traits::*;
use crate::backend::types::*;
use ash::khr::{dynamic_rendering, surface, swapchain};
use ash::vk;
use conversion::*;
use deferred::{DeferredDestructor, Retired};
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc};
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::collections::HashMap;
use std::ffi::CString;
use std::sync::Arc;

/// Vulkan backend implementation
pub struct VulkanBackend {
    _entry: ash::Entry,
    instance: ash::Instance,
    surface_fn: surface::Instance,
    swapchain_fn: swapchain::Device,
    dynamic_rendering: dynamic_rendering::Device,
    surface: vk::SurfaceKHR,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
    graphics_queue: vk::Queue,
    allocator: Option<Mutex<Allocator>>,

    // Swapchain
    swapchain: vk::SwapchainKHR,
    swapchain_images: Vec<vk::Image>,
    swapchain_view_ids: Vec<u64>,
    swapchain_format: vk::Format,
    swapchain_extent: vk::Extent2D,
    current_image_index: u32,
    swapchain_outdated: bool,
    vsync: bool,

    // Synchronization
    image_available_semaphore: vk::Semaphore,
    render_finished_semaphore: vk::Semaphore,
    in_flight_fence: vk::Fence,

    command_pool: vk::CommandPool,
    command_buffer: vk::CommandBuffer,
    is_recording: bool,
    pass: Option<PassState>,

    // Resource storage
    buffers: HashMap<u64, VkBuffer>,
    textures: HashMap<u64, VkTexture>,
    texture_views: HashMap<u64, VkView>,
    samplers: HashMap<u64, vk::Sampler>,
    shader_modules: HashMap<u64, ParsedShader>,
    descriptor_set_layouts: HashMap<u64, vk::DescriptorSetLayout>,
    descriptor_sets: HashMap<u64, vk::DescriptorSet>,
    render_pipelines: HashMap<u64, VkRenderPipeline>,
    image_layouts: HashMap<vk::Image, vk::ImageLayout>,

    descriptor_pool: vk::DescriptorPool,
    deferred: DeferredDestructor,
    next_id: u64,
}

struct VkBuffer {
    buffer: vk::Buffer,
    allocation: Allocation,
}

struct VkTexture {
    image: vk::Image,
    allocation: Allocation,
    format: vk::Format,
    extent: vk::Extent2D,
}

#[derive(Clone, Copy)]
struct VkView {
    view: vk::ImageView,
    image: vk::Image,
    format: vk::Format,
    extent: vk::Extent2D,
    swapchain: bool,
}

struct VkRenderPipeline {
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
}

struct PassState {
    color_images: Vec<VkView>,
    layout: Option<vk::PipelineLayout>,
}

fn init_error(e: impl std::fmt::Display) -> BackendError {
    BackendError::InitializationFailed(e.to_string())
}

impl VulkanBackend {
    pub fn new(window: Arc<winit::window::Window>, vsync: bool) -> BackendResult<Self> {
        unsafe {
            let entry = ash::Entry::load().map_err(init_error)?;

            let app_info = vk::ApplicationInfo::default()
                .application_name(c"Render Environment")
                .application_version(vk::make_api_version(0, 0, 1, 0))
                .engine_name(c"Render Environment")
                .engine_version(vk::make_api_version(0, 0, 1, 0))
                .api_version(vk::API_VERSION_1_3);

            let display_handle = window.display_handle().map_err(init_error)?;
            let window_handle = window.window_handle().map_err(init_error)?;

            let extensions = ash_window::enumerate_required_extensions(display_handle.as_raw())
                .map_err(init_error)?
                .to_vec();

            let instance_info = vk::InstanceCreateInfo::default()
                .application_info(&app_info)
                .enabled_extension_names(&extensions);

            let instance = entry.create_instance(&instance_info, None).map_err(init_error)?;

            let surface_fn = surface::Instance::new(&entry, &instance);
            let surface = ash_window::create_surface(
                &entry,
                &instance,
                display_handle.as_raw(),
                window_handle.as_raw(),
                None,
            )
            .map_err(|e| BackendError::SurfaceCreationFailed(e.to_string()))?;

            let (physical_device, queue_family) = instance
                .enumerate_physical_devices()
                .map_err(init_error)?
                .into_iter()
                .filter(|&pd| {
                    let properties = instance.get_physical_device_properties(pd);
                    vk::api_version_minor(properties.api_version) >= 3
                })
                .find_map(|pd| Self::find_queue_family(&instance, pd, &surface_fn, surface).map(|family| (pd, family)))
                .ok_or_else(|| BackendError::InitializationFailed("No Vulkan 1.3 device with presentation support".into()))?;

            let properties = instance.get_physical_device_properties(physical_device);
            log::info!(
                "Selected GPU: {:?} (Vulkan backend)",
                properties.device_name_as_c_str().unwrap_or(c"unknown")
            );

            let queue_priorities = [1.0f32];
            let queue_create_infos = [vk::DeviceQueueCreateInfo::default()
                .queue_family_index(queue_family)
                .queue_priorities(&queue_priorities)];
            let device_extensions = [swapchain::NAME.as_ptr(), dynamic_rendering::NAME.as_ptr()];
            let features = vk::PhysicalDeviceFeatures::default();
            let mut vulkan_13_features = vk::PhysicalDeviceVulkan13Features::default().dynamic_rendering(true);

            let device_info = vk::DeviceCreateInfo::default()
                .queue_create_infos(&queue_create_infos)
                .enabled_extension_names(&device_extensions)
                .enabled_features(&features)
                .push_next(&mut vulkan_13_features);

            let device = instance
                .create_device(physical_device, &device_info, None)
                .map_err(|e| BackendError::DeviceCreationFailed(e.to_string()))?;
            let graphics_queue = device.get_device_queue(queue_family, 0);

            let allocator = Allocator::new(&AllocatorCreateDesc {
                instance: instance.clone(),
                device: device.clone(),
                physical_device,
                debug_settings: Default::default(),
                buffer_device_address: false,
                allocation_sizes: Default::default(),
            })
            .map_err(init_error)?;

            let swapchain_fn = swapchain::Device::new(&instance, &device);
            let dynamic_rendering = dynamic_rendering::Device::new(&instance, &device);

            let pool_info = vk::CommandPoolCreateInfo::default()
                .queue_family_index(queue_family)
                .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
            let command_pool = device.create_command_pool(&pool_info, None).map_err(init_error)?;

            let alloc_info = vk::CommandBufferAllocateInfo::default()
                .command_pool(command_pool)
                .level(vk::CommandBufferLevel::PRIMARY)
                .command_buffer_count(1);
            let command_buffer = device
                .allocate_command_buffers(&alloc_info)
                .map_err(init_error)?
                .into_iter()
                .next()
                .ok_or_else(|| init_error("no command buffer allocated"))?;

            let semaphore_info = vk::SemaphoreCreateInfo::default();
            let fence_info = vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED);
            let image_available_semaphore = device.create_semaphore(&semaphore_info, None).map_err(init_error)?;
            let render_finished_semaphore = device.create_semaphore(&semaphore_info, None).map_err(init_error)?;
            let in_flight_fence = device.create_fence(&fence_info, None).map_err(init_error)?;

            let pool_sizes = [
                vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::UNIFORM_BUFFER,
                    descriptor_count: 1000,
                },
                vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::SAMPLED_IMAGE,
                    descriptor_count: 1000,
                },
                vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::SAMPLER,
                    descriptor_count: 1000,
                },
            ];
            let descriptor_pool_info = vk::DescriptorPoolCreateInfo::default()
                .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
                .max_sets(1000)
                .pool_sizes(&pool_sizes);
            let descriptor_pool = device
                .create_descriptor_pool(&descriptor_pool_info, None)
                .map_err(init_error)?;

            let mut backend = Self {
                _entry: entry,
                instance,
                surface_fn,
                swapchain_fn,
                dynamic_rendering,
                surface,
                physical_device,
                device,
                graphics_queue,
                allocator: Some(Mutex::new(allocator)),
                swapchain: vk::SwapchainKHR::null(),
                swapchain_images: Vec::new(),
                swapchain_view_ids: Vec::new(),
                swapchain_format: vk::Format::B8G8R8A8_SRGB,
                swapchain_extent: vk::Extent2D { width: 0, height: 0 },
                current_image_index: 0,
                swapchain_outdated: false,
                vsync,
                image_available_semaphore,
                render_finished_semaphore,
                in_flight_fence,
                command_pool,
                command_buffer,
                is_recording: false,
                pass: None,
                buffers: HashMap::new(),
                textures: HashMap::new(),
                texture_views: HashMap::new(),
                samplers: HashMap::new(),
                shader_modules: HashMap::new(),
                descriptor_set_layouts: HashMap::new(),
                descriptor_sets: HashMap::new(),
                render_pipelines: HashMap::new(),
                image_layouts: HashMap::new(),
                descriptor_pool,
                deferred: DeferredDestructor::default(),
                next_id: 1,
            };

            let size = window.inner_size();
            backend.create_swapchain(size.width.max(1), size.height.max(1))?;
            Ok(backend)
        }
    }

    fn find_queue_family(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        surface_fn: &surface::Instance,
        surface: vk::SurfaceKHR,
    ) -> Option<u32> {
        let queue_families = unsafe { instance.get_physical_device_queue_family_properties(physical_device) };

        queue_families.iter().enumerate().find_map(|(index, family)| {
            let supports_graphics = family.queue_flags.contains(vk::QueueFlags::GRAPHICS);
            let supports_surface = unsafe {
                surface_fn
                    .get_physical_device_surface_support(physical_device, index as u32, surface)
                    .unwrap_or(false)
            };
            (supports_graphics && supports_surface).then_some(index as u32)
        })
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn allocator(&self) -> BackendResult<&Mutex<Allocator>> {
        self.allocator
            .as_ref()
            .ok_or_else(|| BackendError::InitializationFailed("Allocator not available".into()))
    }

    fn destroy_swapchain_views(&mut self) {
        for id in std::mem::take(&mut self.swapchain_view_ids) {
            if let Some(view) = self.texture_views.remove(&id) {
                unsafe { self.device.destroy_image_view(view.view, None) };
                self.image_layouts.remove(&view.image);
            }
        }
    }

    fn create_swapchain(&mut self, width: u32, height: u32) -> BackendResult<()> {
        unsafe {
            self.device.device_wait_idle().ok();
            self.destroy_swapchain_views();
            let old_swapchain = self.swapchain;

            let swapchain_error = |e: vk::Result| BackendError::SwapchainCreationFailed(e.to_string());
            let capabilities = self
                .surface_fn
                .get_physical_device_surface_capabilities(self.physical_device, self.surface)
                .map_err(swapchain_error)?;
            let formats = self
                .surface_fn
                .get_physical_device_surface_formats(self.physical_device, self.surface)
                .map_err(swapchain_error)?;
            let present_modes = self
                .surface_fn
                .get_physical_device_surface_present_modes(self.physical_device, self.surface)
                .map_err(swapchain_error)?;

            // Prefer SRGB
            let format = formats
                .iter()
                .find(|f| f.format == vk::Format::B8G8R8A8_SRGB && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR)
                .or_else(|| formats.first())
                .copied()
                .ok_or_else(|| BackendError::SwapchainCreationFailed("Surface reports no formats".into()))?;

            let present_mode = if self.vsync {
                vk::PresentModeKHR::FIFO
            } else {
                present_modes
                    .iter()
                    .copied()
                    .find(|&m| m == vk::PresentModeKHR::MAILBOX)
                    .unwrap_or(vk::PresentModeKHR::FIFO)
            };

            let extent = if capabilities.current_extent.width != u32::MAX {
                capabilities.current_extent
            } else {
                vk::Extent2D {
                    width: width.clamp(capabilities.min_image_extent.width, capabilities.max_image_extent.width),
                    height: height.clamp(capabilities.min_image_extent.height, capabilities.max_image_extent.height),
                }
            };

            let image_count = (capabilities.min_image_count + 1).min(if capabilities.max_image_count > 0 {
                capabilities.max_image_count
            } else {
                u32::MAX
            });

            let swapchain_info = vk::SwapchainCreateInfoKHR::default()
                .surface(self.surface)
                .min_image_count(image_count)
                .image_format(format.format)
                .image_color_space(format.color_space)
                .image_extent(extent)
                .image_array_layers(1)
                .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
                .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
                .pre_transform(capabilities.current_transform)
                .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
                .present_mode(present_mode)
                .clipped(true)
                .old_swapchain(old_swapchain);

            self.swapchain = self
                .swapchain_fn
                .create_swapchain(&swapchain_info, None)
                .map_err(swapchain_error)?;
            if old_swapchain != vk::SwapchainKHR::null() {
                self.swapchain_fn.destroy_swapchain(old_swapchain, None);
            }

            self.swapchain_images = self
                .swapchain_fn
                .get_swapchain_images(self.swapchain)
                .map_err(swapchain_error)?;
            self.swapchain_format = format.format;
            self.swapchain_extent = extent;

            for image in self.swapchain_images.clone() {
                let view = self.create_image_view(image, format.format).map_err(swapchain_error)?;
                let id = self.allocate_id();
                self.texture_views.insert(
                    id,
                    VkView {
                        view,
                        image,
                        format: format.format,
                        extent,
                        swapchain: true,
                    },
                );
                self.swapchain_view_ids.push(id);
            }
            self.swapchain_outdated = false;

            log::debug!("Swapchain created: {}x{} {:?}", extent.width, extent.height, format.format);
            Ok(())
        }
    }

    fn create_image_view(&self, image: vk::Image, format: vk::Format) -> Result<vk::ImageView, vk::Result> {
        let view_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(aspect_mask(format))
                    .level_count(1)
                    .layer_count(1),
            );
        unsafe { self.device.create_image_view(&view_info, None) }
    }

    /// Record a layout transition for `image`. `discard` ignores the current contents.
    fn transition(&mut self, cmd: vk::CommandBuffer, image: vk::Image, format: vk::Format, new_layout: vk::ImageLayout, discard: bool) {
        let old_layout = if discard {
            vk::ImageLayout::UNDEFINED
        } else {
            self.image_layouts
                .get(&image)
                .copied()
                .unwrap_or(vk::ImageLayout::UNDEFINED)
        };
        self.image_layouts.insert(image, new_layout);
        if old_layout == new_layout {
            return;
        }

        let barrier = vk::ImageMemoryBarrier::default()
            .old_layout(old_layout)
            .new_layout(new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(aspect_mask(format))
                    .level_count(1)
                    .layer_count(1),
            )
            .src_access_mask(vk::AccessFlags::MEMORY_WRITE)
            .dst_access_mask(vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE);

        unsafe {
            self.device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
        }
    }

    /// Record and synchronously execute a one-off command buffer
    fn immediate_submit(&mut self, record: impl FnOnce(&mut Self, vk::CommandBuffer)) -> BackendResult<()> {
        let submit_error = |e: vk::Result| BackendError::TextureCreationFailed(e.to_string());
        unsafe {
            let alloc_info = vk::CommandBufferAllocateInfo::default()
                .command_pool(self.command_pool)
                .level(vk::CommandBufferLevel::PRIMARY)
                .command_buffer_count(1);
            let cmd = self
                .device
                .allocate_command_buffers(&alloc_info)
                .map_err(submit_error)?
                .into_iter()
                .next()
                .ok_or_else(|| BackendError::TextureCreationFailed("no command buffer allocated".into()))?;

            let begin_info = vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            self.device.begin_command_buffer(cmd, &begin_info).map_err(submit_error)?;
            record(self, cmd);
            self.device.end_command_buffer(cmd).map_err(submit_error)?;

            let command_buffers = [cmd];
            let submit_info = vk::SubmitInfo::default().command_buffers(&command_buffers);
            let result = self
                .device
                .queue_submit(self.graphics_queue, &[submit_info], vk::Fence::null())
                .and_then(|_| self.device.queue_wait_idle(self.graphics_queue));
            self.device.free_command_buffers(self.command_pool, &command_buffers);
            result.map_err(submit_error)
        }
    }

    fn create_raw_buffer(
        &mut self,
        size: u64,
        usage: vk::BufferUsageFlags,
        name: &str,
    ) -> BackendResult<VkBuffer> {
        let buffer_error = |e: String| BackendError::BufferCreationFailed(e);
        unsafe {
            let buffer_info = vk::BufferCreateInfo::default()
                .size(size.max(4))
                .usage(usage)
                .sharing_mode(vk::SharingMode::EXCLUSIVE);
            let buffer = self
                .device
                .create_buffer(&buffer_info, None)
                .map_err(|e| buffer_error(e.to_string()))?;
            let requirements = self.device.get_buffer_memory_requirements(buffer);

            let allocation = match self.allocator()?.lock().allocate(&AllocationCreateDesc {
                name,
                requirements,
                location: MemoryLocation::CpuToGpu,
                linear: true,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            }) {
                Ok(allocation) => allocation,
                Err(e) => {
                    self.device.destroy_buffer(buffer, None);
                    return Err(buffer_error(e.to_string()));
                }
            };

            if let Err(e) = self
                .device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
            {
                self.deferred.retire(Retired::Buffer { buffer, allocation });
                return Err(buffer_error(e.to_string()));
            }
            Ok(VkBuffer { buffer, allocation })
        }
    }

    fn wait_for_frame(&mut self) -> BackendResult<()> {
        unsafe {
            self.device
                .wait_for_fences(&[self.in_flight_fence], true, u64::MAX)
                .map_err(|e| BackendError::AcquireImageFailed(e.to_string()))?;
        }
        self.collect_garbage();
        Ok(())
    }

    fn collect_garbage(&mut self) {
        if let Some(allocator) = &self.allocator {
            unsafe { self.deferred.collect(&self.device, allocator, self.descriptor_pool) };
        }
    }
}

impl GraphicsBackend for VulkanBackend {
    fn name(&self) -> &'static str {
        "Vulkan"
    }

    fn resize(&mut self, width: u32, height: u32) {
        if width > 0 && height > 0 {
            if let Err(e) = self.create_swapchain(width, height) {
                log::error!("Failed to recreate swapchain: {e}");
            }
        }
    }

    fn surface_size(&self) -> (u32, u32) {
        (self.swapchain_extent.width, self.swapchain_extent.height)
    }

    fn begin_frame(&mut self) -> BackendResult<FrameContext> {
        if self.is_recording {
            return Err(BackendError::AcquireImageFailed("frame already in progress".into()));
        }
        self.wait_for_frame()?;

        if self.swapchain_outdated {
            let (width, height) = (self.swapchain_extent.width, self.swapchain_extent.height);
            self.create_swapchain(width, height)?;
        }

        unsafe {
            let (image_index, _) = self
                .swapchain_fn
                .acquire_next_image(self.swapchain, u64::MAX, self.image_available_semaphore, vk::Fence::null())
                .map_err(|e| match e {
                    vk::Result::ERROR_OUT_OF_DATE_KHR => {
                        self.swapchain_outdated = true;
                        BackendError::SurfaceLost
                    }
                    _ => BackendError::AcquireImageFailed(e.to_string()),
                })?;
            self.current_image_index = image_index;

            self.device
                .reset_fences(&[self.in_flight_fence])
                .map_err(|e| BackendError::AcquireImageFailed(e.to_string()))?;
            self.device
                .reset_command_buffer(self.command_buffer, vk::CommandBufferResetFlags::empty())
                .map_err(|e| BackendError::AcquireImageFailed(e.to_string()))?;
            let begin_info = vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            self.device
                .begin_command_buffer(self.command_buffer, &begin_info)
                .map_err(|e| BackendError::AcquireImageFailed(e.to_string()))?;
        }
        self.is_recording = true;

        let view_id = self.swapchain_view_ids[self.current_image_index as usize];
        // Presented contents are never reused
        let image = self.swapchain_images[self.current_image_index as usize];
        self.image_layouts.insert(image, vk::ImageLayout::UNDEFINED);

        Ok(FrameContext {
            swapchain_view: TextureViewHandle(view_id),
            width: self.swapchain_extent.width,
            height: self.swapchain_extent.height,
        })
    }

    fn end_frame(&mut self) -> BackendResult<()> {
        if !self.is_recording {
            return Err(BackendError::PresentFailed("no frame in progress".into()));
        }
        if self.pass.is_some() {
            self.end_render_pass();
        }

        let image = self.swapchain_images[self.current_image_index as usize];
        self.transition(
            self.command_buffer,
            image,
            self.swapchain_format,
            vk::ImageLayout::PRESENT_SRC_KHR,
            false,
        );

        unsafe {
            self.device
                .end_command_buffer(self.command_buffer)
                .map_err(|e| BackendError::PresentFailed(e.to_string()))?;
            self.is_recording = false;

            let wait_semaphores = [self.image_available_semaphore];
            let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
            let signal_semaphores = [self.render_finished_semaphore];
            let command_buffers = [self.command_buffer];
            let submit_info = vk::SubmitInfo::default()
                .wait_semaphores(&wait_semaphores)
                .wait_dst_stage_mask(&wait_stages)
                .command_buffers(&command_buffers)
                .signal_semaphores(&signal_semaphores);

            self.device
                .queue_submit(self.graphics_queue, &[submit_info], self.in_flight_fence)
                .map_err(|e| BackendError::PresentFailed(e.to_string()))?;
            self.deferred.frame_submitted();

            let swapchains = [self.swapchain];
            let image_indices = [self.current_image_index];
            let present_info = vk::PresentInfoKHR::default()
                .wait_semaphores(&signal_semaphores)
                .swapchains(&swapchains)
                .image_indices(&image_indices);

            match self.swapchain_fn.queue_present(self.graphics_queue, &present_info) {
                Ok(false) => Ok(()),
                Ok(true) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                    self.swapchain_outdated = true;
                    Ok(())
                }
                Err(e) => Err(BackendError::PresentFailed(e.to_string())),
            }
        }
    }

    fn swapchain_format(&self) -> TextureFormat {
        convert_format_back(self.swapchain_format)
    }

    fn wait_idle(&mut self) {
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                log::error!("vkDeviceWaitIdle failed: {e}");
                return;
            }
            if let Some(allocator) = &self.allocator {
                if !self.is_recording {
                    log::trace!("Destroying {} retired objects", self.deferred.pending());
                    self.deferred.collect_all(&self.device, allocator, self.descriptor_pool);
                }
            }
        }
    }

    fn create_buffer_init(&mut self, desc: &BufferDescriptor, data: &[u8]) -> BackendResult<BufferHandle> {
        let mut buffer = self.create_raw_buffer(
            desc.size,
            convert_buffer_usage(desc.usage),
            desc.label.as_deref().unwrap_or("buffer"),
        )?;
        if let Some(mapped) = buffer.allocation.mapped_slice_mut() {
            let len = data.len().min(mapped.len());
            mapped[..len].copy_from_slice(&data[..len]);
        }

        let id = self.allocate_id();
        self.buffers.insert(id, buffer);
        Ok(BufferHandle(id))
    }

    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) {
        if let Some(vk_buffer) = self.buffers.get_mut(&buffer.0) {
            if let Some(mapped) = vk_buffer.allocation.mapped_slice_mut() {
                let start = offset as usize;
                let end = start + data.len();
                if end <= mapped.len() {
                    mapped[start..end].copy_from_slice(data);
                } else {
                    log::warn!("Write past the end of buffer #{}", buffer.0);
                }
            }
        }
    }

    fn create_texture(&mut self, desc: &TextureDescriptor) -> BackendResult<TextureHandle> {
        let format = convert_format(desc.format);
        let texture_error = |e: String| BackendError::TextureCreationFailed(e);

        let (image, allocation) = unsafe {
            let image_info = vk::ImageCreateInfo::default()
                .image_type(vk::ImageType::TYPE_2D)
                .extent(vk::Extent3D {
                    width: desc.width,
                    height: desc.height,
                    depth: 1,
                })
                .mip_levels(desc.mip_levels)
                .array_layers(1)
                .format(format)
                .tiling(vk::ImageTiling::OPTIMAL)
                .initial_layout(vk::ImageLayout::UNDEFINED)
                .usage(convert_texture_usage(desc.usage, desc.format.is_depth()))
                .sharing_mode(vk::SharingMode::EXCLUSIVE)
                .samples(vk::SampleCountFlags::TYPE_1);

            let image = self
                .device
                .create_image(&image_info, None)
                .map_err(|e| texture_error(e.to_string()))?;
            let requirements = self.device.get_image_memory_requirements(image);

            let allocation = match self.allocator()?.lock().allocate(&AllocationCreateDesc {
                name: desc.label.as_deref().unwrap_or("texture"),
                requirements,
                location: MemoryLocation::GpuOnly,
                linear: false,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            }) {
                Ok(allocation) => allocation,
                Err(e) => {
                    self.device.destroy_image(image, None);
                    return Err(texture_error(e.to_string()));
                }
            };

            if let Err(e) = self
                .device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
            {
                self.deferred.retire(Retired::Image { image, allocation });
                return Err(texture_error(e.to_string()));
            }
            (image, allocation)
        };

        // Sampled textures always sit in SHADER_READ_ONLY outside of passes
        if desc.usage.contains(TextureUsage::TEXTURE_BINDING) && !desc.format.is_depth() {
            self.immediate_submit(|backend, cmd| {
                backend.transition(cmd, image, format, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL, true);
            })?;
        }

        let id = self.allocate_id();
        self.textures.insert(
            id,
            VkTexture {
                image,
                allocation,
                format,
                extent: vk::Extent2D {
                    width: desc.width,
                    height: desc.height,
                },
            },
        );
        log::trace!("Created texture #{id} {}x{}", desc.width, desc.height);
        Ok(TextureHandle(id))
    }

    fn create_texture_view(&mut self, texture: TextureHandle) -> BackendResult<TextureViewHandle> {
        let tex = self
            .textures
            .get(&texture.0)
            .ok_or_else(|| BackendError::TextureCreationFailed("Texture not found".into()))?;
        let (image, format, extent) = (tex.image, tex.format, tex.extent);

        let view = self
            .create_image_view(image, format)
            .map_err(|e| BackendError::TextureCreationFailed(e.to_string()))?;

        let id = self.allocate_id();
        self.texture_views.insert(
            id,
            VkView {
                view,
                image,
                format,
                extent,
                swapchain: false,
            },
        );
        Ok(TextureViewHandle(id))
    }

    fn write_texture(&mut self, texture: TextureHandle, data: &[u8], width: u32, height: u32) {
        let Some(tex) = self.textures.get(&texture.0) else {
            return;
        };
        let (image, format) = (tex.image, tex.format);

        let mut staging = match self.create_raw_buffer(data.len() as u64, vk::BufferUsageFlags::TRANSFER_SRC, "staging") {
            Ok(staging) => staging,
            Err(e) => {
                log::error!("Failed to create staging buffer: {e}");
                return;
            }
        };
        if let Some(mapped) = staging.allocation.mapped_slice_mut() {
            mapped[..data.len()].copy_from_slice(data);
        }
        let staging_buffer = staging.buffer;

        let result = self.immediate_submit(|backend, cmd| {
            backend.transition(cmd, image, format, vk::ImageLayout::TRANSFER_DST_OPTIMAL, true);
            let region = vk::BufferImageCopy::default()
                .image_subresource(
                    vk::ImageSubresourceLayers::default()
                        .aspect_mask(vk::ImageAspectFlags::COLOR)
                        .layer_count(1),
                )
                .image_extent(vk::Extent3D {
                    width,
                    height,
                    depth: 1,
                });
            unsafe {
                backend.device.cmd_copy_buffer_to_image(
                    cmd,
                    staging_buffer,
                    image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[region],
                );
            }
            backend.transition(cmd, image, format, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL, false);
        });
        if let Err(e) = result {
            log::error!("Texture upload failed: {e}");
        }

        // The upload waited for the queue, the staging buffer is free
        if let Some(allocator) = &self.allocator {
            if let Err(e) = allocator.lock().free(staging.allocation) {
                log::error!("Failed to free staging allocation: {e}");
            }
        }
        unsafe { self.device.destroy_buffer(staging_buffer, None) };
    }

    fn create_sampler(&mut self, desc: &SamplerDescriptor) -> BackendResult<SamplerHandle> {
        let sampler_info = vk::SamplerCreateInfo::default()
            .mag_filter(convert_filter(desc.mag_filter))
            .min_filter(convert_filter(desc.min_filter))
            .mipmap_mode(convert_mipmap_mode(desc.mipmap_filter))
            .address_mode_u(convert_address_mode(desc.address_mode_u))
            .address_mode_v(convert_address_mode(desc.address_mode_v))
            .address_mode_w(convert_address_mode(desc.address_mode_w))
            .compare_enable(desc.compare.is_some())
            .compare_op(desc.compare.map(convert_compare_op).unwrap_or(vk::CompareOp::ALWAYS))
            .min_lod(0.0)
            .max_lod(vk::LOD_CLAMP_NONE)
            .border_color(vk::BorderColor::FLOAT_OPAQUE_BLACK);

        let sampler = unsafe {
            self.device
                .create_sampler(&sampler_info, None)
                .map_err(|e| BackendError::TextureCreationFailed(e.to_string()))?
        };

        let id = self.allocate_id();
        self.samplers.insert(id, sampler);
        Ok(SamplerHandle(id))
    }

    fn create_shader_module(&mut self, desc: &ShaderModuleDescriptor) -> BackendResult<ShaderModuleHandle> {
        let parsed = ParsedShader::parse(&desc.source).map_err(|e| BackendError::ShaderCreationFailed(e.to_string()))?;
        let id = self.allocate_id();
        self.shader_modules.insert(id, parsed);
        Ok(ShaderModuleHandle(id))
    }

    fn create_bind_group_layout(&mut self, entries: &[BindGroupLayoutEntry]) -> BackendResult<BindGroupLayoutHandle> {
        let bindings: Vec<vk::DescriptorSetLayoutBinding> = entries
            .iter()
            .map(|e| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(e.binding)
                    .descriptor_type(convert_descriptor_type(&e.ty))
                    .descriptor_count(1)
                    .stage_flags(convert_stage_flags(e.visibility))
            })
            .collect();

        let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
        let layout = unsafe {
            self.device
                .create_descriptor_set_layout(&layout_info, None)
                .map_err(|e| BackendError::PipelineCreationFailed(e.to_string()))?
        };

        let id = self.allocate_id();
        self.descriptor_set_layouts.insert(id, layout);
        Ok(BindGroupLayoutHandle(id))
    }

    fn create_bind_group(
        &mut self,
        layout: BindGroupLayoutHandle,
        entries: &[(u32, BindGroupEntry)],
    ) -> BackendResult<BindGroupHandle> {
        let pipeline_error = |e: String| BackendError::PipelineCreationFailed(e);
        let layout_handle = *self
            .descriptor_set_layouts
            .get(&layout.0)
            .ok_or_else(|| pipeline_error("Layout not found".into()))?;

        let layouts = [layout_handle];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.descriptor_pool)
            .set_layouts(&layouts);
        let descriptor_set = unsafe {
            self.device
                .allocate_descriptor_sets(&alloc_info)
                .map_err(|e| pipeline_error(e.to_string()))?
                .into_iter()
                .next()
                .ok_or_else(|| pipeline_error("no descriptor set allocated".into()))?
        };

        for (binding, entry) in entries {
            let write = vk::WriteDescriptorSet::default()
                .dst_set(descriptor_set)
                .dst_binding(*binding);
            match entry {
                BindGroupEntry::Buffer { buffer, offset, size } => {
                    let Some(vk_buffer) = self.buffers.get(&buffer.0) else {
                        return Err(pipeline_error(format!("buffer #{} not found", buffer.0)));
                    };
                    let infos = [vk::DescriptorBufferInfo {
                        buffer: vk_buffer.buffer,
                        offset: *offset,
                        range: size.unwrap_or(vk::WHOLE_SIZE),
                    }];
                    let write = write
                        .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                        .buffer_info(&infos);
                    unsafe { self.device.update_descriptor_sets(&[write], &[]) };
                }
                BindGroupEntry::Texture(view) => {
                    let Some(vk_view) = self.texture_views.get(&view.0) else {
                        return Err(pipeline_error(format!("texture view #{} not found", view.0)));
                    };
                    let infos = [vk::DescriptorImageInfo {
                        sampler: vk::Sampler::null(),
                        image_view: vk_view.view,
                        image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    }];
                    let write = write
                        .descriptor_type(vk::DescriptorType::SAMPLED_IMAGE)
                        .image_info(&infos);
                    unsafe { self.device.update_descriptor_sets(&[write], &[]) };
                }
                BindGroupEntry::Sampler(sampler) => {
                    let Some(vk_sampler) = self.samplers.get(&sampler.0) else {
                        return Err(pipeline_error(format!("sampler #{} not found", sampler.0)));
                    };
                    let infos = [vk::DescriptorImageInfo {
                        sampler: *vk_sampler,
                        image_view: vk::ImageView::null(),
                        image_layout: vk::ImageLayout::UNDEFINED,
                    }];
                    let write = write
                        .descriptor_type(vk::DescriptorType::SAMPLER)
                        .image_info(&infos);
                    unsafe { self.device.update_descriptor_sets(&[write], &[]) };
                }
            }
        }

        let id = self.allocate_id();
        self.descriptor_sets.insert(id, descriptor_set);
        Ok(BindGroupHandle(id))
    }

    fn create_render_pipeline(&mut self, desc: &RenderPipelineDescriptor) -> BackendResult<RenderPipelineHandle> {
        let pipeline_error = |e: String| BackendError::PipelineCreationFailed(e);
        let shader = self
            .shader_modules
            .get(&desc.shader.0)
            .ok_or_else(|| pipeline_error("Shader module not found".into()))?;

        let vertex_spv = shader
            .to_spirv(naga::ShaderStage::Vertex, &desc.vertex_entry)
            .map_err(|e| pipeline_error(e.to_string()))?;
        let fragment_spv = desc
            .fragment_entry
            .as_ref()
            .map(|entry| shader.to_spirv(naga::ShaderStage::Fragment, entry))
            .transpose()
            .map_err(|e| pipeline_error(e.to_string()))?;

        let vertex_entry = CString::new(desc.vertex_entry.as_str()).map_err(|e| pipeline_error(e.to_string()))?;
        let fragment_entry = desc
            .fragment_entry
            .as_deref()
            .map(CString::new)
            .transpose()
            .map_err(|e| pipeline_error(e.to_string()))?;

        let set_layouts: Vec<vk::DescriptorSetLayout> = desc
            .bind_group_layouts
            .iter()
            .filter_map(|h| self.descriptor_set_layouts.get(&h.0).copied())
            .collect();

        unsafe {
            let vertex_module = self
                .device
                .create_shader_module(&vk::ShaderModuleCreateInfo::default().code(&vertex_spv), None)
                .map_err(|e| pipeline_error(e.to_string()))?;
            let fragment_module = match &fragment_spv {
                Some(spv) => match self
                    .device
                    .create_shader_module(&vk::ShaderModuleCreateInfo::default().code(spv), None)
                {
                    Ok(module) => Some(module),
                    Err(e) => {
                        self.device.destroy_shader_module(vertex_module, None);
                        return Err(pipeline_error(e.to_string()));
                    }
                },
                None => None,
            };
            let destroy_modules = |device: &ash::Device| {
                device.destroy_shader_module(vertex_module, None);
                if let Some(module) = fragment_module {
                    device.destroy_shader_module(module, None);
                }
            };

            let layout_info = vk::PipelineLayoutCreateInfo::default().set_layouts(&set_layouts);
            let layout = match self.device.create_pipeline_layout(&layout_info, None) {
                Ok(layout) => layout,
                Err(e) => {
                    destroy_modules(&self.device);
                    return Err(pipeline_error(e.to_string()));
                }
            };

            let mut stages = vec![vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(vertex_module)
                .name(&vertex_entry)];
            if let (Some(module), Some(entry)) = (fragment_module, fragment_entry.as_ref()) {
                stages.push(
                    vk::PipelineShaderStageCreateInfo::default()
                        .stage(vk::ShaderStageFlags::FRAGMENT)
                        .module(module)
                        .name(entry),
                );
            }

            let binding_descriptions: Vec<vk::VertexInputBindingDescription> = desc
                .vertex_layouts
                .iter()
                .enumerate()
                .map(|(i, layout)| {
                    vk::VertexInputBindingDescription::default()
                        .binding(i as u32)
                        .stride(layout.array_stride as u32)
                        .input_rate(match layout.step_mode {
                            VertexStepMode::Vertex => vk::VertexInputRate::VERTEX,
                            VertexStepMode::Instance => vk::VertexInputRate::INSTANCE,
                        })
                })
                .collect();
            let attribute_descriptions: Vec<vk::VertexInputAttributeDescription> = desc
                .vertex_layouts
                .iter()
                .enumerate()
                .flat_map(|(i, layout)| {
                    layout.attributes.iter().map(move |attr| {
                        vk::VertexInputAttributeDescription::default()
                            .location(attr.location)
                            .binding(i as u32)
                            .format(convert_vertex_format(attr.format))
                            .offset(attr.offset as u32)
                    })
                })
                .collect();
            let vertex_input_state = vk::PipelineVertexInputStateCreateInfo::default()
                .vertex_binding_descriptions(&binding_descriptions)
                .vertex_attribute_descriptions(&attribute_descriptions);

            let input_assembly_state = vk::PipelineInputAssemblyStateCreateInfo::default()
                .topology(convert_topology(desc.primitive_topology))
                .primitive_restart_enable(desc.strip_index_format.is_some() && desc.primitive_topology.is_strip());

            let viewport_state = vk::PipelineViewportStateCreateInfo::default()
                .viewport_count(1)
                .scissor_count(1);

            let rasterization_state = vk::PipelineRasterizationStateCreateInfo::default()
                .polygon_mode(vk::PolygonMode::FILL)
                .line_width(1.0)
                .cull_mode(convert_cull_mode(desc.cull_mode))
                .front_face(convert_front_face(desc.front_face));

            let multisample_state =
                vk::PipelineMultisampleStateCreateInfo::default().rasterization_samples(vk::SampleCountFlags::TYPE_1);

            let depth_stencil_state = match &desc.depth_stencil {
                Some(ds) => vk::PipelineDepthStencilStateCreateInfo::default()
                    .depth_test_enable(true)
                    .depth_write_enable(ds.depth_write_enabled)
                    .depth_compare_op(convert_compare_op(ds.depth_compare)),
                None => vk::PipelineDepthStencilStateCreateInfo::default(),
            };

            let color_blend_attachments: Vec<vk::PipelineColorBlendAttachmentState> =
                desc.color_targets.iter().map(convert_color_target).collect();
            let color_blend_state =
                vk::PipelineColorBlendStateCreateInfo::default().attachments(&color_blend_attachments);

            let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
            let dynamic_state = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

            let color_formats: Vec<vk::Format> = desc.color_targets.iter().map(|t| convert_format(t.format)).collect();
            let depth_format = desc
                .depth_stencil
                .as_ref()
                .map(|ds| convert_format(ds.format))
                .unwrap_or(vk::Format::UNDEFINED);
            let mut rendering_info = vk::PipelineRenderingCreateInfo::default()
                .color_attachment_formats(&color_formats)
                .depth_attachment_format(depth_format);

            let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
                .stages(&stages)
                .vertex_input_state(&vertex_input_state)
                .input_assembly_state(&input_assembly_state)
                .viewport_state(&viewport_state)
                .rasterization_state(&rasterization_state)
                .multisample_state(&multisample_state)
                .depth_stencil_state(&depth_stencil_state)
                .color_blend_state(&color_blend_state)
                .dynamic_state(&dynamic_state)
                .layout(layout)
                .push_next(&mut rendering_info);

            let result = self
                .device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None);
            destroy_modules(&self.device);

            let pipeline = match result {
                Ok(pipelines) => pipelines[0],
                Err((_, e)) => {
                    self.device.destroy_pipeline_layout(layout, None);
                    return Err(pipeline_error(e.to_string()));
                }
            };

            let id = self.allocate_id();
            self.render_pipelines.insert(id, VkRenderPipeline { pipeline, layout });
            log::trace!("Created pipeline #{id} {:?}", desc.label);
            Ok(RenderPipelineHandle(id))
        }
    }

    fn begin_render_pass(&mut self, desc: &RenderPassDescriptor) {
        if !self.is_recording {
            log::warn!("Render pass begun outside of a frame");
            return;
        }
        if self.pass.is_some() {
            self.end_render_pass();
        }
        let cmd = self.command_buffer;

        let mut color_images = Vec::new();
        let mut color_attachments = Vec::new();
        for attachment in &desc.color_attachments {
            let Some(view) = self.texture_views.get(&attachment.view.0).copied() else {
                log::warn!("Color attachment #{} not found", attachment.view.0);
                continue;
            };
            let discard = matches!(attachment.load_op, LoadOp::Clear(_));
            self.transition(cmd, view.image, view.format, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL, discard);

            let (load_op, clear) = match attachment.load_op {
                LoadOp::Clear(color) => (vk::AttachmentLoadOp::CLEAR, color),
                LoadOp::Load => (vk::AttachmentLoadOp::LOAD, [0.0; 4]),
            };
            color_attachments.push(
                vk::RenderingAttachmentInfo::default()
                    .image_view(view.view)
                    .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                    .load_op(load_op)
                    .store_op(match attachment.store_op {
                        StoreOp::Store => vk::AttachmentStoreOp::STORE,
                        StoreOp::Discard => vk::AttachmentStoreOp::DONT_CARE,
                    })
                    .clear_value(vk::ClearValue {
                        color: vk::ClearColorValue { float32: clear },
                    }),
            );
            color_images.push(view);
        }

        let depth_attachment = desc.depth_stencil_attachment.as_ref().and_then(|attachment| {
            let view = self.texture_views.get(&attachment.view.0).copied()?;
            let discard = matches!(attachment.depth_load_op, LoadOp::Clear(_));
            self.transition(
                cmd,
                view.image,
                view.format,
                vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                discard,
            );
            Some(
                vk::RenderingAttachmentInfo::default()
                    .image_view(view.view)
                    .image_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
                    .load_op(if discard {
                        vk::AttachmentLoadOp::CLEAR
                    } else {
                        vk::AttachmentLoadOp::LOAD
                    })
                    .store_op(match attachment.depth_store_op {
                        StoreOp::Store => vk::AttachmentStoreOp::STORE,
                        StoreOp::Discard => vk::AttachmentStoreOp::DONT_CARE,
                    })
                    .clear_value(vk::ClearValue {
                        depth_stencil: vk::ClearDepthStencilValue {
                            depth: attachment.depth_clear_value,
                            stencil: 0,
                        },
                    }),
            )
        });

        let extent = color_images
            .first()
            .map(|v| v.extent)
            .unwrap_or(self.swapchain_extent);
        let render_area = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        };

        let mut rendering_info = vk::RenderingInfo::default()
            .render_area(render_area)
            .layer_count(1)
            .color_attachments(&color_attachments);
        if let Some(ref depth) = depth_attachment {
            rendering_info = rendering_info.depth_attachment(depth);
        }

        // Negative height flips Y to match wgpu clip space
        let viewport = vk::Viewport {
            x: 0.0,
            y: extent.height as f32,
            width: extent.width as f32,
            height: -(extent.height as f32),
            min_depth: 0.0,
            max_depth: 1.0,
        };

        unsafe {
            self.dynamic_rendering.cmd_begin_rendering(cmd, &rendering_info);
            self.device.cmd_set_viewport(cmd, 0, &[viewport]);
            self.device.cmd_set_scissor(cmd, 0, &[render_area]);
        }

        self.pass = Some(PassState {
            color_images,
            layout: None,
        });
    }

    fn end_render_pass(&mut self) {
        let Some(pass) = self.pass.take() else {
            return;
        };
        let cmd = self.command_buffer;
        unsafe { self.dynamic_rendering.cmd_end_rendering(cmd) };

        // Offscreen targets become sampleable again
        for view in pass.color_images.iter().filter(|v| !v.swapchain) {
            self.transition(cmd, view.image, view.format, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL, false);
        }
    }

    fn set_render_pipeline(&mut self, pipeline: RenderPipelineHandle) {
        let Some(pass) = self.pass.as_mut() else {
            return;
        };
        if let Some(vk_pipeline) = self.render_pipelines.get(&pipeline.0) {
            unsafe {
                self.device
                    .cmd_bind_pipeline(self.command_buffer, vk::PipelineBindPoint::GRAPHICS, vk_pipeline.pipeline);
            }
            pass.layout = Some(vk_pipeline.layout);
        }
    }

    fn set_bind_group(&mut self, index: u32, bind_group: BindGroupHandle) {
        let Some(layout) = self.pass.as_ref().and_then(|p| p.layout) else {
            return;
        };
        if let Some(set) = self.descriptor_sets.get(&bind_group.0) {
            unsafe {
                self.device.cmd_bind_descriptor_sets(
                    self.command_buffer,
                    vk::PipelineBindPoint::GRAPHICS,
                    layout,
                    index,
                    &[*set],
                    &[],
                );
            }
        }
    }

    fn set_vertex_buffer(&mut self, slot: u32, buffer: BufferHandle, offset: u64) {
        if self.pass.is_none() {
            return;
        }
        if let Some(vk_buffer) = self.buffers.get(&buffer.0) {
            unsafe {
                self.device
                    .cmd_bind_vertex_buffers(self.command_buffer, slot, &[vk_buffer.buffer], &[offset]);
            }
        }
    }

    fn set_index_buffer(&mut self, buffer: BufferHandle, offset: u64, format: IndexFormat) {
        if self.pass.is_none() {
            return;
        }
        if let Some(vk_buffer) = self.buffers.get(&buffer.0) {
            unsafe {
                self.device.cmd_bind_index_buffer(
                    self.command_buffer,
                    vk_buffer.buffer,
                    offset,
                    convert_index_type(format),
                );
            }
        }
    }

    fn draw(&mut self, vertices: std::ops::Range<u32>, instances: std::ops::Range<u32>) {
        if self.pass.is_none() {
            return;
        }
        unsafe {
            self.device.cmd_draw(
                self.command_buffer,
                vertices.end - vertices.start,
                instances.end - instances.start,
                vertices.start,
                instances.start,
            );
        }
    }

    fn draw_indexed(&mut self, indices: std::ops::Range<u32>, base_vertex: i32, instances: std::ops::Range<u32>) {
        if self.pass.is_none() {
            return;
        }
        unsafe {
            self.device.cmd_draw_indexed(
                self.command_buffer,
                indices.end - indices.start,
                instances.end - instances.start,
                indices.start,
                base_vertex,
                instances.start,
            );
        }
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        if let Some(vk_buffer) = self.buffers.remove(&buffer.0) {
            self.deferred.retire(Retired::Buffer {
                buffer: vk_buffer.buffer,
                allocation: vk_buffer.allocation,
            });
        }
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        if let Some(vk_texture) = self.textures.remove(&texture.0) {
            self.image_layouts.remove(&vk_texture.image);
            self.deferred.retire(Retired::Image {
                image: vk_texture.image,
                allocation: vk_texture.allocation,
            });
        }
    }

    fn destroy_texture_view(&mut self, view: TextureViewHandle) {
        match self.texture_views.get(&view.0) {
            Some(vk_view) if vk_view.swapchain => {
                log::warn!("Swapchain views are owned by the swapchain");
            }
            Some(_) => {
                if let Some(vk_view) = self.texture_views.remove(&view.0) {
                    self.deferred.retire(Retired::ImageView(vk_view.view));
                }
            }
            None => {}
        }
    }

    fn destroy_sampler(&mut self, sampler: SamplerHandle) {
        if let Some(sampler) = self.samplers.remove(&sampler.0) {
            self.deferred.retire(Retired::Sampler(sampler));
        }
    }

    fn destroy_shader_module(&mut self, module: ShaderModuleHandle) {
        self.shader_modules.remove(&module.0);
    }

    fn destroy_bind_group_layout(&mut self, layout: BindGroupLayoutHandle) {
        if let Some(layout) = self.descriptor_set_layouts.remove(&layout.0) {
            self.deferred.retire(Retired::DescriptorSetLayout(layout));
        }
    }

    fn destroy_bind_group(&mut self, bind_group: BindGroupHandle) {
        if let Some(set) = self.descriptor_sets.remove(&bind_group.0) {
            self.deferred.retire(Retired::DescriptorSet(set));
        }
    }

    fn destroy_render_pipeline(&mut self, pipeline: RenderPipelineHandle) {
        if let Some(vk_pipeline) = self.render_pipelines.remove(&pipeline.0) {
            self.deferred.retire(Retired::Pipeline {
                pipeline: vk_pipeline.pipeline,
                layout: vk_pipeline.layout,
            });
        }
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();

            let buffers: Vec<BufferHandle> = self.buffers.keys().map(|&id| BufferHandle(id)).collect();
            for buffer in buffers {
                self.destroy_buffer(buffer);
            }
            let textures: Vec<TextureHandle> = self.textures.keys().map(|&id| TextureHandle(id)).collect();
            for texture in textures {
                self.destroy_texture(texture);
            }
            for (_, view) in self.texture_views.iter().filter(|(_, v)| !v.swapchain) {
                self.device.destroy_image_view(view.view, None);
            }
            self.texture_views.retain(|_, v| v.swapchain);
            for (_, sampler) in self.samplers.drain() {
                self.device.destroy_sampler(sampler, None);
            }
            for (_, layout) in self.descriptor_set_layouts.drain() {
                self.device.destroy_descriptor_set_layout(layout, None);
            }
            for (_, pipeline) in self.render_pipelines.drain() {
                self.device.destroy_pipeline(pipeline.pipeline, None);
                self.device.destroy_pipeline_layout(pipeline.layout, None);
            }
            self.descriptor_sets.clear();

            if let Some(allocator) = &self.allocator {
                self.deferred.collect_all(&self.device, allocator, self.descriptor_pool);
            }
            // The allocator must go before the device
            drop(self.allocator.take());

            self.device.destroy_descriptor_pool(self.descriptor_pool, None);
            self.device.destroy_command_pool(self.command_pool, None);
            self.device.destroy_semaphore(self.image_available_semaphore, None);
            self.device.destroy_semaphore(self.render_finished_semaphore, None);
            self.device.destroy_fence(self.in_flight_fence, None);

            self.destroy_swapchain_views();
            self.swapchain_fn.destroy_swapchain(self.swapchain, None);

            self.device.destroy_device(None);
            self.surface_fn.destroy_surface(self.surface, None);
            self.instance.destroy_instance(None);
        }
    }
}

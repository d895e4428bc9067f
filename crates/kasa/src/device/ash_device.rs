use std::sync::Arc;

use core::ptr::NonNull;

use ash::vk::{self, Handle};

use super::*;

/// [`RawDevice`] over a live `ash::Device`.
pub struct AshDevice {
    device: Arc<ash::Device>,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    limits: DeviceLimits,
    dedicated_allocation: bool,
}

impl AshDevice {

    /// # Safety
    /// `physical_device` must belong to `instance` and `device` must have been created from it.
    /// `dedicated_allocation` may only be set when the device was created with Vulkan 1.1 or
    /// `VK_KHR_dedicated_allocation` and `VK_KHR_get_memory_requirements2`.
    pub unsafe fn new(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: Arc<ash::Device>,
        dedicated_allocation: bool,
    ) -> Self
    {
        let memory_properties = unsafe {
            instance.get_physical_device_memory_properties(physical_device)
        };
        let properties = unsafe {
            instance.get_physical_device_properties(physical_device)
        };
        Self {
            device,
            memory_properties,
            limits: DeviceLimits::from_vk(&properties.limits),
            dedicated_allocation,
        }
    }

    #[inline(always)]
    pub fn device(&self) -> &Arc<ash::Device> {
        &self.device
    }
}

impl RawDevice for AshDevice {

    #[inline(always)]
    fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    #[inline(always)]
    fn limits(&self) -> DeviceLimits {
        self.limits
    }

    #[inline(always)]
    fn supports_dedicated_allocation(&self) -> bool {
        self.dedicated_allocation
    }

    fn allocate_memory(
        &self,
        size: vk::DeviceSize,
        memory_type_index: u32,
        dedicated: Option<DedicatedTarget>,
    ) -> VkResult<vk::DeviceMemory>
    {
        let mut dedicated_info = vk::MemoryDedicatedAllocateInfo::default();
        let mut allocate_info = vk::MemoryAllocateInfo {
            s_type: vk::StructureType::MEMORY_ALLOCATE_INFO,
            allocation_size: size,
            memory_type_index,
            ..Default::default()
        };
        if let Some(target) = dedicated.filter(|_| self.dedicated_allocation) {
            match target {
                DedicatedTarget::Image(image) => dedicated_info.image = image,
                DedicatedTarget::Buffer(buffer) => dedicated_info.buffer = buffer,
            }
            allocate_info = allocate_info.push_next(&mut dedicated_info);
        }
        unsafe {
            self.device.allocate_memory(&allocate_info, None)
        }
    }

    unsafe fn free_memory(&self, memory: vk::DeviceMemory) {
        unsafe {
            self.device.free_memory(memory, None);
        }
    }

    unsafe fn map_memory(&self, memory: vk::DeviceMemory) -> VkResult<NonNull<u8>> {
        let ptr = unsafe {
            self.device.map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())?
        };
        NonNull::new(ptr as *mut u8).ok_or(vk::Result::ERROR_MEMORY_MAP_FAILED)
    }

    unsafe fn unmap_memory(&self, memory: vk::DeviceMemory) {
        unsafe {
            self.device.unmap_memory(memory);
        }
    }

    unsafe fn flush_mapped_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> VkResult<()>
    {
        let range = vk::MappedMemoryRange {
            s_type: vk::StructureType::MAPPED_MEMORY_RANGE,
            memory,
            offset,
            size,
            ..Default::default()
        };
        unsafe {
            self.device.flush_mapped_memory_ranges(&[range])
        }
    }

    unsafe fn invalidate_mapped_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> VkResult<()>
    {
        let range = vk::MappedMemoryRange {
            s_type: vk::StructureType::MAPPED_MEMORY_RANGE,
            memory,
            offset,
            size,
            ..Default::default()
        };
        unsafe {
            self.device.invalidate_mapped_memory_ranges(&[range])
        }
    }

    fn create_buffer(&self, size: vk::DeviceSize, usage: vk::BufferUsageFlags) -> VkResult<vk::Buffer> {
        let create_info = vk::BufferCreateInfo {
            s_type: vk::StructureType::BUFFER_CREATE_INFO,
            size,
            usage,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            ..Default::default()
        };
        unsafe {
            self.device.create_buffer(&create_info, None)
        }
    }

    unsafe fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        unsafe {
            self.device.get_buffer_memory_requirements(buffer)
        }
    }

    unsafe fn image_memory_requirements(&self, image: vk::Image) -> ImageRequirements {
        if !self.dedicated_allocation {
            let requirements = unsafe {
                self.device.get_image_memory_requirements(image)
            };
            return ImageRequirements {
                requirements,
                prefers_dedicated: false,
                requires_dedicated: false,
            }
        }
        let info = vk::ImageMemoryRequirementsInfo2 {
            s_type: vk::StructureType::IMAGE_MEMORY_REQUIREMENTS_INFO_2,
            image,
            ..Default::default()
        };
        let mut dedicated = vk::MemoryDedicatedRequirements::default();
        let mut requirements2 = vk::MemoryRequirements2::default()
            .push_next(&mut dedicated);
        unsafe {
            self.device.get_image_memory_requirements2(&info, &mut requirements2);
        }
        let requirements = requirements2.memory_requirements;
        ImageRequirements {
            requirements,
            prefers_dedicated: dedicated.prefers_dedicated_allocation == vk::TRUE,
            requires_dedicated: dedicated.requires_dedicated_allocation == vk::TRUE,
        }
    }

    unsafe fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> VkResult<()>
    {
        unsafe {
            self.device.bind_buffer_memory(buffer, memory, offset)
        }
    }

    unsafe fn bind_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> VkResult<()>
    {
        unsafe {
            self.device.bind_image_memory(image, memory, offset)
        }
    }

    unsafe fn destroy_buffer(&self, buffer: vk::Buffer) {
        unsafe {
            self.device.destroy_buffer(buffer, None);
        }
    }

    unsafe fn destroy_object(&self, kind: ObjectKind, raw: u64) {
        let device = &self.device;
        unsafe {
            match kind {
                ObjectKind::RenderPass => device.destroy_render_pass(vk::RenderPass::from_raw(raw), None),
                ObjectKind::Buffer => device.destroy_buffer(vk::Buffer::from_raw(raw), None),
                ObjectKind::BufferView => device.destroy_buffer_view(vk::BufferView::from_raw(raw), None),
                ObjectKind::Image => device.destroy_image(vk::Image::from_raw(raw), None),
                ObjectKind::ImageView => device.destroy_image_view(vk::ImageView::from_raw(raw), None),
                ObjectKind::Pipeline => device.destroy_pipeline(vk::Pipeline::from_raw(raw), None),
                ObjectKind::PipelineLayout => device.destroy_pipeline_layout(vk::PipelineLayout::from_raw(raw), None),
                ObjectKind::Framebuffer => device.destroy_framebuffer(vk::Framebuffer::from_raw(raw), None),
                ObjectKind::DescriptorSetLayout => {
                    device.destroy_descriptor_set_layout(vk::DescriptorSetLayout::from_raw(raw), None)
                },
                ObjectKind::Sampler => device.destroy_sampler(vk::Sampler::from_raw(raw), None),
                ObjectKind::Semaphore => device.destroy_semaphore(vk::Semaphore::from_raw(raw), None),
                ObjectKind::ShaderModule => device.destroy_shader_module(vk::ShaderModule::from_raw(raw), None),
                ObjectKind::Event => device.destroy_event(vk::Event::from_raw(raw), None),
            }
        }
    }

    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence> {
        let create_info = vk::FenceCreateInfo {
            s_type: vk::StructureType::FENCE_CREATE_INFO,
            flags: if signaled { vk::FenceCreateFlags::SIGNALED } else { vk::FenceCreateFlags::empty() },
            ..Default::default()
        };
        unsafe {
            self.device.create_fence(&create_info, None)
        }
    }

    unsafe fn fence_status(&self, fence: vk::Fence) -> VkResult<bool> {
        unsafe {
            self.device.get_fence_status(fence)
        }
    }

    unsafe fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> VkResult<bool> {
        match unsafe { self.device.wait_for_fences(&[fence], true, timeout_ns) } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(err) => Err(err),
        }
    }

    unsafe fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        unsafe {
            self.device.reset_fences(&[fence])
        }
    }

    unsafe fn destroy_fence(&self, fence: vk::Fence) {
        unsafe {
            self.device.destroy_fence(fence, None);
        }
    }
}

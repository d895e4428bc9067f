mod ash_device;
mod headless;

use core::ptr::NonNull;

use ash::vk;

pub use ash_device::AshDevice;
pub use headless::{HeadlessDevice, HeadlessImage};

pub type VkResult<T> = core::result::Result<T, vk::Result>;

/// Device limits the allocator aligns and budgets against.
#[derive(Clone, Copy, Debug)]
pub struct DeviceLimits {
    pub max_memory_allocation_count: u32,
    pub min_uniform_buffer_offset_alignment: vk::DeviceSize,
    pub min_storage_buffer_offset_alignment: vk::DeviceSize,
    pub min_texel_buffer_offset_alignment: vk::DeviceSize,
    pub non_coherent_atom_size: vk::DeviceSize,
    pub buffer_image_granularity: vk::DeviceSize,
}

impl DeviceLimits {

    pub fn from_vk(limits: &vk::PhysicalDeviceLimits) -> Self {
        Self {
            max_memory_allocation_count: limits.max_memory_allocation_count,
            min_uniform_buffer_offset_alignment: limits.min_uniform_buffer_offset_alignment,
            min_storage_buffer_offset_alignment: limits.min_storage_buffer_offset_alignment,
            min_texel_buffer_offset_alignment: limits.min_texel_buffer_offset_alignment,
            non_coherent_atom_size: limits.non_coherent_atom_size,
            buffer_image_granularity: limits.buffer_image_granularity,
        }
    }
}

/// Image memory requirements together with the driver's dedicated allocation hints.
#[derive(Clone, Copy, Debug, Default)]
pub struct ImageRequirements {
    pub requirements: vk::MemoryRequirements,
    pub prefers_dedicated: bool,
    pub requires_dedicated: bool,
}

/// Resource a dedicated allocation is made for.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DedicatedTarget {
    Image(vk::Image),
    Buffer(vk::Buffer),
}

/// Kinds of driver objects the deferred deletion queue can destroy.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ObjectKind {
    RenderPass,
    Buffer,
    BufferView,
    Image,
    ImageView,
    Pipeline,
    PipelineLayout,
    Framebuffer,
    DescriptorSetLayout,
    Sampler,
    Semaphore,
    ShaderModule,
    Event,
}

/// The driver surface the allocator is built on.
///
/// Every call may be made from any thread. Functions taking raw handles are
/// unsafe because the caller guarantees the handle was created by this device
/// and is not in use by the GPU.
pub trait RawDevice: Send + Sync {

    fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties;

    fn limits(&self) -> DeviceLimits;

    fn supports_dedicated_allocation(&self) -> bool;

    fn allocate_memory(
        &self,
        size: vk::DeviceSize,
        memory_type_index: u32,
        dedicated: Option<DedicatedTarget>,
    ) -> VkResult<vk::DeviceMemory>;

    unsafe fn free_memory(&self, memory: vk::DeviceMemory);

    /// Maps the whole allocation.
    unsafe fn map_memory(&self, memory: vk::DeviceMemory) -> VkResult<NonNull<u8>>;

    unsafe fn unmap_memory(&self, memory: vk::DeviceMemory);

    unsafe fn flush_mapped_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> VkResult<()>;

    unsafe fn invalidate_mapped_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> VkResult<()>;

    fn create_buffer(&self, size: vk::DeviceSize, usage: vk::BufferUsageFlags) -> VkResult<vk::Buffer>;

    unsafe fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements;

    unsafe fn image_memory_requirements(&self, image: vk::Image) -> ImageRequirements;

    unsafe fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> VkResult<()>;

    unsafe fn bind_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> VkResult<()>;

    unsafe fn destroy_buffer(&self, buffer: vk::Buffer);

    unsafe fn destroy_object(&self, kind: ObjectKind, raw: u64);

    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence>;

    /// Returns `true` when the fence is signaled.
    unsafe fn fence_status(&self, fence: vk::Fence) -> VkResult<bool>;

    /// Returns `false` when the timeout elapsed first.
    unsafe fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> VkResult<bool>;

    unsafe fn reset_fence(&self, fence: vk::Fence) -> VkResult<()>;

    unsafe fn destroy_fence(&self, fence: vk::Fence);
}

/// Driver objects that can be handed to the deferred deletion queue.
pub trait DeletableObject: vk::Handle + Copy {
    const KIND: ObjectKind;
}

macro_rules! impl_deletable {
    ($($handle:ident => $kind:ident),* $(,)?) => {
        $(
            impl DeletableObject for vk::$handle {
                const KIND: ObjectKind = ObjectKind::$kind;
            }
        )*
    };
}

impl_deletable!(
    RenderPass => RenderPass,
    Buffer => Buffer,
    BufferView => BufferView,
    Image => Image,
    ImageView => ImageView,
    Pipeline => Pipeline,
    PipelineLayout => PipelineLayout,
    Framebuffer => Framebuffer,
    DescriptorSetLayout => DescriptorSetLayout,
    Sampler => Sampler,
    Semaphore => Semaphore,
    ShaderModule => ShaderModule,
    Event => Event,
);

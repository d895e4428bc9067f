use std::time::{Duration, Instant};

use core::{
    ptr::NonNull,
    sync::atomic::{AtomicU64, Ordering},
};

use ash::vk::{self, Handle};

use parking_lot::{Mutex, Condvar};

use ahash::AHashMap;

use crate::dev::{has_bits, align_up};

use super::*;

/// Memory requirements of an image registered with [`HeadlessDevice::create_image`].
#[derive(Clone, Copy, Debug)]
pub struct HeadlessImage {
    pub size: vk::DeviceSize,
    pub alignment: vk::DeviceSize,
    pub memory_type_bits: u32,
    pub prefers_dedicated: bool,
    pub requires_dedicated: bool,
}

impl HeadlessImage {

    #[inline(always)]
    pub fn new(size: vk::DeviceSize, alignment: vk::DeviceSize) -> Self {
        Self {
            size,
            alignment,
            memory_type_bits: !0,
            prefers_dedicated: false,
            requires_dedicated: false,
        }
    }

    #[inline(always)]
    pub fn with_memory_type_bits(mut self, bits: u32) -> Self {
        self.memory_type_bits = bits;
        self
    }

    #[inline(always)]
    pub fn prefer_dedicated(mut self) -> Self {
        self.prefers_dedicated = true;
        self
    }
}

struct HeadlessMemory {
    size: vk::DeviceSize,
    heap_index: u32,
    host_visible: bool,
    host: Option<Box<[u64]>>,
    mapped: bool,
    dedicated: Option<DedicatedTarget>,
}

struct HeadlessBuffer {
    size: vk::DeviceSize,
    binding: Option<(vk::DeviceMemory, vk::DeviceSize)>,
}

struct HeadlessImageState {
    image: HeadlessImage,
    binding: Option<(vk::DeviceMemory, vk::DeviceSize)>,
}

#[derive(Default)]
struct HeadlessState {
    memory: AHashMap<vk::DeviceMemory, HeadlessMemory>,
    buffers: AHashMap<vk::Buffer, HeadlessBuffer>,
    images: AHashMap<vk::Image, HeadlessImageState>,
    fences: AHashMap<vk::Fence, bool>,
    heap_usage: Vec<vk::DeviceSize>,
    destroyed: Vec<(ObjectKind, u64)>,
    fail_above: Option<vk::DeviceSize>,
    fail_next: u32,
    allocation_calls: u64,
    flushes: u64,
    invalidations: u64,
}

/// Software [`RawDevice`] without a GPU.
///
/// Memory types:
/// - `0`: `DEVICE_LOCAL`, heap 0
/// - `1`: `HOST_VISIBLE | HOST_COHERENT`, heap 1
/// - `2`: `HOST_VISIBLE | HOST_COHERENT | HOST_CACHED`, heap 1
///
/// Host memory is only backed once mapped. Fences are signaled by calling
/// [`HeadlessDevice::signal_fence`]; waits block until then or until the
/// timeout elapses.
pub struct HeadlessDevice {
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    limits: DeviceLimits,
    dedicated_allocation: bool,
    next_handle: AtomicU64,
    state: Mutex<HeadlessState>,
    fence_signal: Condvar,
}

impl Default for HeadlessDevice {

    fn default() -> Self {
        Self::new()
    }
}

impl HeadlessDevice {

    pub const BUFFER_ALIGNMENT: vk::DeviceSize = 256;

    pub fn new() -> Self {
        Self::with_heap_sizes(2 << 30, 1 << 30)
    }

    pub fn with_heap_sizes(device_local: vk::DeviceSize, host_visible: vk::DeviceSize) -> Self {
        let mut memory_properties = vk::PhysicalDeviceMemoryProperties::default();
        memory_properties.memory_heap_count = 2;
        memory_properties.memory_heaps[0] = vk::MemoryHeap {
            size: device_local,
            flags: vk::MemoryHeapFlags::DEVICE_LOCAL,
        };
        memory_properties.memory_heaps[1] = vk::MemoryHeap {
            size: host_visible,
            flags: vk::MemoryHeapFlags::empty(),
        };
        memory_properties.memory_type_count = 3;
        memory_properties.memory_types[0] = vk::MemoryType {
            property_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL,
            heap_index: 0,
        };
        memory_properties.memory_types[1] = vk::MemoryType {
            property_flags: vk::MemoryPropertyFlags::HOST_VISIBLE |
                vk::MemoryPropertyFlags::HOST_COHERENT,
            heap_index: 1,
        };
        memory_properties.memory_types[2] = vk::MemoryType {
            property_flags: vk::MemoryPropertyFlags::HOST_VISIBLE |
                vk::MemoryPropertyFlags::HOST_COHERENT |
                vk::MemoryPropertyFlags::HOST_CACHED,
            heap_index: 1,
        };
        Self {
            memory_properties,
            limits: DeviceLimits {
                max_memory_allocation_count: 4096,
                min_uniform_buffer_offset_alignment: 256,
                min_storage_buffer_offset_alignment: 64,
                min_texel_buffer_offset_alignment: 64,
                non_coherent_atom_size: 64,
                buffer_image_granularity: 1024,
            },
            dedicated_allocation: true,
            next_handle: AtomicU64::new(1),
            state: Mutex::new(HeadlessState {
                heap_usage: vec![0; 2],
                ..Default::default()
            }),
            fence_signal: Condvar::new(),
        }
    }

    #[inline(always)]
    pub fn with_limits(mut self, limits: DeviceLimits) -> Self {
        self.limits = limits;
        self
    }

    #[inline(always)]
    pub fn with_dedicated_allocation(mut self, supported: bool) -> Self {
        self.dedicated_allocation = supported;
        self
    }

    #[inline(always)]
    fn next_raw(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    /// Registers an image whose memory the allocator can then bind.
    pub fn create_image(&self, image: HeadlessImage) -> vk::Image {
        let handle = vk::Image::from_raw(self.next_raw());
        self.state.lock().images.insert(handle, HeadlessImageState {
            image,
            binding: None,
        });
        handle
    }

    /// Creates a raw handle of any deletable kind for deferred deletion tests.
    pub fn create_object<T: DeletableObject>(&self) -> T {
        T::from_raw(self.next_raw())
    }

    pub fn signal_fence(&self, fence: vk::Fence) {
        let mut state = self.state.lock();
        if let Some(signaled) = state.fences.get_mut(&fence) {
            *signaled = true;
        }
        self.fence_signal.notify_all();
    }

    /// Makes every allocation larger than `size` fail with out of device memory.
    pub fn fail_allocations_above(&self, size: Option<vk::DeviceSize>) {
        self.state.lock().fail_above = size;
    }

    /// Makes the next `count` allocations fail with out of device memory.
    pub fn fail_next_allocations(&self, count: u32) {
        self.state.lock().fail_next = count;
    }

    pub fn live_memory_count(&self) -> usize {
        self.state.lock().memory.len()
    }

    pub fn live_buffer_count(&self) -> usize {
        self.state.lock().buffers.len()
    }

    pub fn live_fence_count(&self) -> usize {
        self.state.lock().fences.len()
    }

    pub fn heap_usage(&self, heap_index: u32) -> vk::DeviceSize {
        self.state.lock().heap_usage[heap_index as usize]
    }

    pub fn allocation_calls(&self) -> u64 {
        self.state.lock().allocation_calls
    }

    pub fn flush_count(&self) -> u64 {
        self.state.lock().flushes
    }

    pub fn invalidate_count(&self) -> u64 {
        self.state.lock().invalidations
    }

    pub fn destroyed_objects(&self) -> Vec<(ObjectKind, u64)> {
        self.state.lock().destroyed.clone()
    }

    pub fn was_destroyed<T: DeletableObject>(&self, object: T) -> bool {
        self.state.lock().destroyed.contains(&(T::KIND, object.as_raw()))
    }

    pub fn is_mapped(&self, memory: vk::DeviceMemory) -> bool {
        self.state.lock().memory.get(&memory).is_some_and(|memory| memory.mapped)
    }

    pub fn memory_size(&self, memory: vk::DeviceMemory) -> Option<vk::DeviceSize> {
        self.state.lock().memory.get(&memory).map(|memory| memory.size)
    }

    pub fn dedicated_target(&self, memory: vk::DeviceMemory) -> Option<DedicatedTarget> {
        self.state.lock().memory.get(&memory).and_then(|memory| memory.dedicated)
    }

    pub fn buffer_binding(&self, buffer: vk::Buffer) -> Option<(vk::DeviceMemory, vk::DeviceSize)> {
        self.state.lock().buffers.get(&buffer).and_then(|buffer| buffer.binding)
    }

    pub fn image_binding(&self, image: vk::Image) -> Option<(vk::DeviceMemory, vk::DeviceSize)> {
        self.state.lock().images.get(&image).and_then(|image| image.binding)
    }
}

impl RawDevice for HeadlessDevice {

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
        if memory_type_index >= self.memory_properties.memory_type_count {
            return Err(vk::Result::ERROR_UNKNOWN)
        }
        let memory_type = self.memory_properties.memory_types[memory_type_index as usize];
        let heap_index = memory_type.heap_index;
        let heap_size = self.memory_properties.memory_heaps[heap_index as usize].size;
        let mut state = self.state.lock();
        state.allocation_calls += 1;
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)
        }
        if state.fail_above.is_some_and(|limit| size > limit) ||
            state.heap_usage[heap_index as usize] + size > heap_size
        {
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)
        }
        state.heap_usage[heap_index as usize] += size;
        let handle = vk::DeviceMemory::from_raw(self.next_raw());
        state.memory.insert(handle, HeadlessMemory {
            size,
            heap_index,
            host_visible: has_bits!(memory_type.property_flags, vk::MemoryPropertyFlags::HOST_VISIBLE),
            host: None,
            mapped: false,
            dedicated: dedicated.filter(|_| self.dedicated_allocation),
        });
        Ok(handle)
    }

    unsafe fn free_memory(&self, memory: vk::DeviceMemory) {
        let mut state = self.state.lock();
        let Some(freed) = state.memory.remove(&memory) else {
            panic!("freeing unknown device memory {:#x}", memory.as_raw())
        };
        state.heap_usage[freed.heap_index as usize] -= freed.size;
    }

    unsafe fn map_memory(&self, memory: vk::DeviceMemory) -> VkResult<NonNull<u8>> {
        let mut state = self.state.lock();
        let memory = state.memory
            .get_mut(&memory)
            .ok_or(vk::Result::ERROR_MEMORY_MAP_FAILED)?;
        if !memory.host_visible || memory.mapped {
            return Err(vk::Result::ERROR_MEMORY_MAP_FAILED)
        }
        let words = memory.size.div_ceil(8) as usize;
        let host = memory.host.get_or_insert_with(|| vec![0u64; words].into_boxed_slice());
        memory.mapped = true;
        NonNull::new(host.as_mut_ptr() as *mut u8).ok_or(vk::Result::ERROR_MEMORY_MAP_FAILED)
    }

    unsafe fn unmap_memory(&self, memory: vk::DeviceMemory) {
        if let Some(memory) = self.state.lock().memory.get_mut(&memory) {
            memory.mapped = false;
        }
    }

    unsafe fn flush_mapped_memory(
        &self,
        memory: vk::DeviceMemory,
        _offset: vk::DeviceSize,
        _size: vk::DeviceSize,
    ) -> VkResult<()>
    {
        let mut state = self.state.lock();
        if !state.memory.get(&memory).is_some_and(|memory| memory.mapped) {
            return Err(vk::Result::ERROR_MEMORY_MAP_FAILED)
        }
        state.flushes += 1;
        Ok(())
    }

    unsafe fn invalidate_mapped_memory(
        &self,
        memory: vk::DeviceMemory,
        _offset: vk::DeviceSize,
        _size: vk::DeviceSize,
    ) -> VkResult<()>
    {
        let mut state = self.state.lock();
        if !state.memory.get(&memory).is_some_and(|memory| memory.mapped) {
            return Err(vk::Result::ERROR_MEMORY_MAP_FAILED)
        }
        state.invalidations += 1;
        Ok(())
    }

    fn create_buffer(&self, size: vk::DeviceSize, _usage: vk::BufferUsageFlags) -> VkResult<vk::Buffer> {
        let handle = vk::Buffer::from_raw(self.next_raw());
        self.state.lock().buffers.insert(handle, HeadlessBuffer {
            size,
            binding: None,
        });
        Ok(handle)
    }

    unsafe fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        let size = self.state.lock().buffers
            .get(&buffer)
            .map(|buffer| buffer.size)
            .unwrap_or_default();
        vk::MemoryRequirements {
            size: align_up(size, Self::BUFFER_ALIGNMENT),
            alignment: Self::BUFFER_ALIGNMENT,
            memory_type_bits: (1 << self.memory_properties.memory_type_count) - 1,
        }
    }

    unsafe fn image_memory_requirements(&self, image: vk::Image) -> ImageRequirements {
        let Some(state) = self.state.lock().images.get(&image).map(|state| state.image) else {
            return ImageRequirements::default()
        };
        ImageRequirements {
            requirements: vk::MemoryRequirements {
                size: state.size,
                alignment: state.alignment,
                memory_type_bits: state.memory_type_bits & ((1 << self.memory_properties.memory_type_count) - 1),
            },
            prefers_dedicated: state.prefers_dedicated && self.dedicated_allocation,
            requires_dedicated: state.requires_dedicated && self.dedicated_allocation,
        }
    }

    unsafe fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> VkResult<()>
    {
        let mut state = self.state.lock();
        let memory_size = state.memory
            .get(&memory)
            .map(|memory| memory.size)
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        let buffer = state.buffers
            .get_mut(&buffer)
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        if buffer.binding.is_some() || offset + buffer.size > memory_size {
            return Err(vk::Result::ERROR_UNKNOWN)
        }
        buffer.binding = Some((memory, offset));
        Ok(())
    }

    unsafe fn bind_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> VkResult<()>
    {
        let mut state = self.state.lock();
        let memory_size = state.memory
            .get(&memory)
            .map(|memory| memory.size)
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        let image = state.images
            .get_mut(&image)
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        if image.binding.is_some() ||
            offset % image.image.alignment.max(1) != 0 ||
            offset + image.image.size > memory_size
        {
            return Err(vk::Result::ERROR_UNKNOWN)
        }
        image.binding = Some((memory, offset));
        Ok(())
    }

    unsafe fn destroy_buffer(&self, buffer: vk::Buffer) {
        let mut state = self.state.lock();
        if state.buffers.remove(&buffer).is_none() {
            panic!("destroying unknown buffer {:#x}", buffer.as_raw())
        }
        state.destroyed.push((ObjectKind::Buffer, buffer.as_raw()));
    }

    unsafe fn destroy_object(&self, kind: ObjectKind, raw: u64) {
        let mut state = self.state.lock();
        match kind {
            ObjectKind::Buffer => {
                state.buffers.remove(&vk::Buffer::from_raw(raw));
            },
            ObjectKind::Image => {
                state.images.remove(&vk::Image::from_raw(raw));
            },
            _ => {},
        }
        state.destroyed.push((kind, raw));
    }

    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence> {
        let handle = vk::Fence::from_raw(self.next_raw());
        self.state.lock().fences.insert(handle, signaled);
        Ok(handle)
    }

    unsafe fn fence_status(&self, fence: vk::Fence) -> VkResult<bool> {
        self.state.lock().fences
            .get(&fence)
            .copied()
            .ok_or(vk::Result::ERROR_UNKNOWN)
    }

    unsafe fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> VkResult<bool> {
        let deadline = Instant::now().checked_add(Duration::from_nanos(timeout_ns));
        let mut state = self.state.lock();
        loop {
            match state.fences.get(&fence) {
                None => return Err(vk::Result::ERROR_UNKNOWN),
                Some(true) => return Ok(true),
                Some(false) => {},
            }
            match deadline {
                Some(deadline) => {
                    if self.fence_signal.wait_until(&mut state, deadline).timed_out() {
                        return Ok(state.fences.get(&fence).copied().unwrap_or(false))
                    }
                },
                None => self.fence_signal.wait(&mut state),
            }
        }
    }

    unsafe fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        let mut state = self.state.lock();
        let signaled = state.fences
            .get_mut(&fence)
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        *signaled = false;
        Ok(())
    }

    unsafe fn destroy_fence(&self, fence: vk::Fence) {
        let mut state = self.state.lock();
        if state.fences.remove(&fence).is_none() {
            panic!("destroying unknown fence {:#x}", fence.as_raw())
        }
    }
}

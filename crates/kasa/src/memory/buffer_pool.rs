use std::sync::Arc;

use core::ptr::NonNull;

use ash::vk;

use parking_lot::Mutex;

use kasa_log::{debug, warn};

use crate::{
    dev::has_bits,
    device::RawDevice,
    error::{Error, Result},
    settings::{AllocatorSettings, BufferBucket},
};

use super::{
    arena::{Arena, SlotIndex},
    free_list::{FreeList, Carve},
    device_memory::{DeviceMemoryManager, DeviceMemoryAllocation, MappedPtr, MappedRange},
};

/// Usages every pooled non-storage buffer is created with, so more requests can share one.
const SHARED_BUFFER_USAGE: vk::BufferUsageFlags = vk::BufferUsageFlags::from_raw(
    vk::BufferUsageFlags::UNIFORM_BUFFER.as_raw() |
    vk::BufferUsageFlags::INDEX_BUFFER.as_raw() |
    vk::BufferUsageFlags::VERTEX_BUFFER.as_raw() |
    vk::BufferUsageFlags::INDIRECT_BUFFER.as_raw()
);

pub(crate) struct BufferAllocation {
    buffer: vk::Buffer,
    memory: DeviceMemoryAllocation,
    free_list: FreeList,
    usage: vk::BufferUsageFlags,
    properties: vk::MemoryPropertyFlags,
    bucket: usize,
    frame_freed: u64,
}

impl BufferAllocation {

    #[inline(always)]
    fn is_compatible(&self, usage: vk::BufferUsageFlags, properties: vk::MemoryPropertyFlags) -> bool {
        has_bits!(self.usage, usage) && has_bits!(self.properties, properties)
    }

    fn try_allocate(
        &mut self,
        index: SlotIndex<BufferAllocation>,
        size: vk::DeviceSize,
        alignment: vk::DeviceSize,
    ) -> Option<BufferSuballocation>
    {
        let carve = self.free_list.try_allocate(size, alignment)?;
        Some(BufferSuballocation {
            buffer: self.buffer,
            memory: self.memory.handle(),
            memory_size: self.memory.size(),
            coherent: self.memory.is_coherent(),
            mapped: self.memory.mapped(),
            usage: self.usage,
            carve,
            owner: index,
        })
    }
}

/// A range of a pooled buffer.
///
/// Return it with [`BufferPool::release`].
#[derive(Debug)]
pub struct BufferSuballocation {
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    memory_size: vk::DeviceSize,
    coherent: bool,
    mapped: Option<MappedPtr>,
    usage: vk::BufferUsageFlags,
    carve: Carve,
    owner: SlotIndex<BufferAllocation>,
}

impl BufferSuballocation {

    #[inline(always)]
    pub fn buffer(&self) -> vk::Buffer {
        self.buffer
    }

    #[inline(always)]
    pub fn memory(&self) -> vk::DeviceMemory {
        self.memory
    }

    /// Usage the backing buffer was created with, a superset of the requested one.
    #[inline(always)]
    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.usage
    }

    /// Offset inside the buffer.
    #[inline(always)]
    pub fn offset(&self) -> vk::DeviceSize {
        self.carve.offset
    }

    #[inline(always)]
    pub fn size(&self) -> vk::DeviceSize {
        self.carve.size
    }

    #[inline(always)]
    pub fn allocation_offset(&self) -> vk::DeviceSize {
        self.carve.allocation_offset
    }

    #[inline(always)]
    pub fn allocation_size(&self) -> vk::DeviceSize {
        self.carve.allocation_size
    }

    #[inline(always)]
    pub fn mapped_ptr(&self) -> Option<NonNull<u8>> {
        self.mapped.map(|ptr| ptr.offset(self.carve.offset).get())
    }

    /// `size` bytes at `offset` relative to this suballocation. Buffers are bound at memory
    /// offset zero, so buffer and memory offsets coincide.
    #[inline(always)]
    pub fn mapped_range(&self, offset: vk::DeviceSize, size: vk::DeviceSize) -> MappedRange {
        MappedRange {
            memory: self.memory,
            memory_size: self.memory_size,
            coherent: self.coherent,
            offset: self.carve.offset + offset,
            size,
        }
    }
}

#[derive(Default, Clone, Debug)]
pub struct BucketReport {
    /// `None` for the unbounded bucket.
    pub size: Option<vk::DeviceSize>,
    pub used_buffers: usize,
    pub free_buffers: usize,
    pub live_suballocations: usize,
    pub used_bytes: vk::DeviceSize,
    pub total_bytes: vk::DeviceSize,
}

#[derive(Default, Clone, Copy, Debug)]
pub struct BufferLeaks {
    pub buffers: usize,
    pub suballocations: usize,
    pub bytes: vk::DeviceSize,
}

struct BufferPoolState {
    allocations: Arena<BufferAllocation>,
    used: Vec<Vec<SlotIndex<BufferAllocation>>>,
    free: Vec<Vec<SlotIndex<BufferAllocation>>>,
    released_all: bool,
}

/// Buffers pooled by size class, each carved with a [`FreeList`].
pub struct BufferPool {
    memory: Arc<DeviceMemoryManager>,
    buckets: Vec<BufferBucket>,
    large_buffer_size: vk::DeviceSize,
    binning: bool,
    frames_before_release: u64,
    state: Mutex<BufferPoolState>,
}

impl BufferPool {

    pub fn new(memory: Arc<DeviceMemoryManager>, settings: &AllocatorSettings) -> Self {
        let mut buckets = settings.buffer_buckets.clone();
        buckets.sort_by_key(|bucket| bucket.size);
        let bucket_count = buckets.len() + 1;
        Self {
            memory,
            buckets,
            large_buffer_size: settings.large_buffer_size,
            binning: settings.buffer_binning,
            frames_before_release: settings.frames_before_release,
            state: Mutex::new(BufferPoolState {
                allocations: Arena::new(),
                used: vec![Vec::new(); bucket_count],
                free: vec![Vec::new(); bucket_count],
                released_all: false,
            }),
        }
    }

    #[inline(always)]
    fn device(&self) -> &Arc<dyn RawDevice> {
        self.memory.device()
    }

    /// Smallest bucket that fits `size`, or the unbounded bucket.
    pub fn bucket_index(&self, size: vk::DeviceSize) -> usize {
        if !self.binning {
            return self.buckets.len()
        }
        self.buckets
            .iter()
            .position(|bucket| size <= bucket.size)
            .unwrap_or(self.buckets.len())
    }

    /// Size class a request of `size` is rounded up to. The unbounded bucket does not round.
    pub fn bucket_size(&self, size: vk::DeviceSize) -> vk::DeviceSize {
        self.buckets
            .get(self.bucket_index(size))
            .map(|bucket| bucket.size)
            .unwrap_or(size)
    }

    #[inline(always)]
    fn bucket_buffer_size(&self, bucket: usize) -> vk::DeviceSize {
        self.buckets
            .get(bucket)
            .map(|bucket| bucket.buffer_size)
            .unwrap_or(self.large_buffer_size)
    }

    /// Alignment and effective usage of a request.
    ///
    /// Storage and texel buffers align to their offset limits, everything else to the
    /// uniform offset limit with the shared usage set added.
    pub fn request_layout(&self, usage: vk::BufferUsageFlags) -> (vk::DeviceSize, vk::BufferUsageFlags) {
        let limits = self.memory.limits();
        let storage = usage.intersects(vk::BufferUsageFlags::STORAGE_BUFFER);
        let texel = usage.intersects(
            vk::BufferUsageFlags::UNIFORM_TEXEL_BUFFER | vk::BufferUsageFlags::STORAGE_TEXEL_BUFFER
        );
        if storage || texel {
            let mut alignment = 1;
            if texel {
                alignment = limits.min_texel_buffer_offset_alignment.max(alignment);
            }
            if storage {
                alignment = limits.min_storage_buffer_offset_alignment.max(alignment);
            }
            (alignment, usage)
        } else {
            (limits.min_uniform_buffer_offset_alignment.max(1), usage | SHARED_BUFFER_USAGE)
        }
    }

    pub fn allocate(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        properties: vk::MemoryPropertyFlags,
    ) -> Result<BufferSuballocation>
    {
        if size == 0 {
            return Err(Error::ZeroSizeAlloc)
        }
        let (alignment, usage) = self.request_layout(usage);
        let bucket = self.bucket_index(size);
        let size = self.bucket_size(size);
        {
            let mut state = self.state.lock();
            let state = &mut *state;
            for &index in &state.used[bucket] {
                let Some(allocation) = state.allocations.get_mut(index) else {
                    continue
                };
                if !allocation.is_compatible(usage, properties) {
                    continue
                }
                if let Some(suballocation) = allocation.try_allocate(index, size, alignment) {
                    return Ok(suballocation)
                }
            }
            for i in 0..state.free[bucket].len() {
                let index = state.free[bucket][i];
                let Some(allocation) = state.allocations.get_mut(index) else {
                    continue
                };
                if !allocation.is_compatible(usage, properties) {
                    continue
                }
                if let Some(suballocation) = allocation.try_allocate(index, size, alignment) {
                    state.free[bucket].remove(i);
                    state.used[bucket].push(index);
                    return Ok(suballocation)
                }
            }
        }
        let allocation = self.create_allocation(
            size.max(self.bucket_buffer_size(bucket)), usage, properties, bucket
        )?;
        let mut state = self.state.lock();
        let index = state.allocations.insert(allocation);
        state.used[bucket].push(index);
        let memory_type_index = state.allocations
            .get(index)
            .map(|allocation| allocation.memory.memory_type_index())
            .unwrap_or_default();
        state.allocations
            .get_mut(index)
            .and_then(|allocation| allocation.try_allocate(index, size, alignment))
            .ok_or(Error::OutOfDeviceMemory { size, memory_type_index })
    }

    fn create_allocation(
        &self,
        buffer_size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        properties: vk::MemoryPropertyFlags,
        bucket: usize,
    ) -> Result<BufferAllocation>
    {
        let device = self.device();
        let buffer = device.create_buffer(buffer_size, usage)?;
        let requirements = unsafe {
            device.buffer_memory_requirements(buffer)
        };
        let memory_type_index = match find_buffer_memory_type(&self.memory, requirements.memory_type_bits, properties) {
            Some(index) => index,
            None => {
                unsafe { device.destroy_buffer(buffer); }
                return Err(Error::NoCompatibleMemoryType {
                    type_bits: requirements.memory_type_bits,
                    properties,
                })
            },
        };
        let mut memory = match self.memory.alloc(false, requirements.size, memory_type_index, None) {
            Ok(memory) => memory,
            Err(err) => {
                unsafe { device.destroy_buffer(buffer); }
                return Err(err)
            },
        };
        let bound = unsafe {
            device.bind_buffer_memory(buffer, memory.handle(), 0)
        };
        let mapped = match bound {
            Ok(()) if memory.can_be_mapped() => self.memory.map(&mut memory).map(|_| ()),
            Ok(()) => Ok(()),
            Err(err) => Err(err.into()),
        };
        if let Err(err) = mapped {
            unsafe { device.destroy_buffer(buffer); }
            self.memory.free(memory);
            return Err(err)
        }
        debug!("new pooled buffer of {} bytes in bucket {} (usage {:?})", buffer_size, bucket, usage);
        Ok(BufferAllocation {
            buffer,
            properties: memory.property_flags(),
            memory,
            free_list: FreeList::new(buffer_size),
            usage,
            bucket,
            frame_freed: 0,
        })
    }

    /// Returns a suballocation to its buffer.
    ///
    /// Suballocations released after [`release_all`](Self::release_all) are ignored with a
    /// warning.
    ///
    /// # Panics
    /// If the buffer it came from no longer exists otherwise.
    pub fn release(&self, suballocation: BufferSuballocation, frame: u64) {
        let mut state = self.state.lock();
        let index = suballocation.owner;
        let released_all = state.released_all;
        let Some(allocation) = state.allocations.get_mut(index) else {
            assert!(released_all, "double free of buffer suballocation {:?}", index);
            warn!("buffer suballocation {:?} released after shutdown", index);
            return
        };
        allocation.free_list.release_carve(&suballocation.carve);
        if allocation.free_list.is_fully_free() {
            allocation.frame_freed = frame;
            let bucket = allocation.bucket;
            state.used[bucket].retain(|&other| other != index);
            state.free[bucket].push(index);
        }
    }

    /// Destroys one buffer that sat idle long enough, or every idle buffer when
    /// `immediately` is set. Returns the number destroyed.
    pub fn release_freed_resources(&self, immediately: bool, frame: u64) -> usize {
        let mut released = Vec::new();
        {
            let mut state = self.state.lock();
            let state = &mut *state;
            'buckets: for free in &mut state.free {
                let mut i = 0;
                while i < free.len() {
                    let index = free[i];
                    let expired = state.allocations
                        .get(index)
                        .is_some_and(|allocation| allocation.frame_freed + self.frames_before_release < frame);
                    if !immediately && !expired {
                        i += 1;
                        continue
                    }
                    free.remove(i);
                    if let Some(allocation) = state.allocations.remove(index) {
                        released.push(allocation);
                    }
                    if !immediately {
                        break 'buckets
                    }
                }
            }
        }
        let count = released.len();
        for allocation in released {
            self.destroy_allocation(allocation);
        }
        count
    }

    fn destroy_allocation(&self, allocation: BufferAllocation) {
        debug!("destroying pooled buffer of {} bytes", allocation.free_list.capacity());
        unsafe {
            self.device().destroy_buffer(allocation.buffer);
        }
        self.memory.free(allocation.memory);
    }

    pub fn report(&self) -> Vec<BucketReport> {
        let state = self.state.lock();
        (0..state.used.len())
            .map(|bucket| {
                let mut report = BucketReport {
                    size: self.buckets.get(bucket).map(|bucket| bucket.size),
                    used_buffers: state.used[bucket].len(),
                    free_buffers: state.free[bucket].len(),
                    ..Default::default()
                };
                for index in state.used[bucket].iter().chain(&state.free[bucket]) {
                    if let Some(allocation) = state.allocations.get(*index) {
                        report.live_suballocations += allocation.free_list.live_count();
                        report.used_bytes += allocation.free_list.used();
                        report.total_bytes += allocation.free_list.capacity();
                    }
                }
                report
            })
            .collect()
    }

    /// Destroys every pooled buffer, counting the ones with live suballocations.
    pub fn release_all(&self) -> BufferLeaks {
        let mut leaks = BufferLeaks::default();
        let allocations = {
            let mut state = self.state.lock();
            state.used.iter_mut().for_each(Vec::clear);
            state.free.iter_mut().for_each(Vec::clear);
            state.released_all = true;
            state.allocations.drain()
        };
        for allocation in allocations {
            let live = allocation.free_list.live_count();
            if live > 0 {
                leaks.buffers += 1;
                leaks.suballocations += live;
                leaks.bytes += allocation.free_list.used();
            }
            self.destroy_allocation(allocation);
        }
        leaks
    }
}

/// Memory type for buffer memory, dropping `HOST_CACHED` and `LAZILY_ALLOCATED`
/// when no type offers them.
pub(crate) fn find_buffer_memory_type(
    memory: &DeviceMemoryManager,
    type_bits: u32,
    properties: vk::MemoryPropertyFlags,
) -> Option<u32>
{
    if let Some(index) = memory.find_memory_type_index(type_bits, properties) {
        return Some(index)
    }
    let optional = vk::MemoryPropertyFlags::HOST_CACHED | vk::MemoryPropertyFlags::LAZILY_ALLOCATED;
    if !properties.intersects(optional) {
        return None
    }
    memory.find_memory_type_index(type_bits, properties & !optional)
}

#[cfg(test)]
mod tests {

    use super::*;

    use crate::{
        device::HeadlessDevice,
        settings::DebugSettings,
    };

    fn pool(settings: AllocatorSettings) -> (Arc<HeadlessDevice>, BufferPool) {
        let device = Arc::new(HeadlessDevice::new());
        let memory = Arc::new(DeviceMemoryManager::new(device.clone(), DebugSettings::default()));
        (device, BufferPool::new(memory, &settings))
    }

    const HOST: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::from_raw(
        vk::MemoryPropertyFlags::HOST_VISIBLE.as_raw() | vk::MemoryPropertyFlags::HOST_COHERENT.as_raw()
    );

    #[test]
    fn requests_round_up_to_smallest_bucket() {
        let (_device, binned) = pool(AllocatorSettings::default());
        assert_eq!(binned.bucket_size(1), 128);
        assert_eq!(binned.bucket_size(128), 128);
        assert_eq!(binned.bucket_size(129), 256);
        assert_eq!(binned.bucket_size(3000), 8192);
        assert_eq!(binned.bucket_size(8193), 8193);
        assert_eq!(binned.bucket_index(8193), DEFAULT_BUCKETS);
        let (_device, unbinned) = pool(AllocatorSettings::default().with_buffer_binning(false));
        assert_eq!(unbinned.bucket_size(100), 100);
    }

    const DEFAULT_BUCKETS: usize = crate::settings::DEFAULT_BUFFER_BUCKETS.len();

    #[test]
    fn alignment_follows_usage() {
        let (_device, pool) = pool(AllocatorSettings::default());
        let (alignment, usage) = pool.request_layout(vk::BufferUsageFlags::VERTEX_BUFFER);
        assert_eq!(alignment, 256);
        assert!(usage.contains(SHARED_BUFFER_USAGE));
        let (alignment, usage) = pool.request_layout(vk::BufferUsageFlags::STORAGE_BUFFER);
        assert_eq!(alignment, 64);
        assert_eq!(usage, vk::BufferUsageFlags::STORAGE_BUFFER);
    }

    #[test]
    fn bucket_shares_one_buffer_until_exhausted() {
        let settings = AllocatorSettings::default()
            .with_buffer_buckets(&[BufferBucket::new(256, 768)], 4096);
        let (device, pool) = pool(settings);
        let usage = vk::BufferUsageFlags::UNIFORM_BUFFER;
        let allocations: Vec<_> = (0..3)
            .map(|_| pool.allocate(200, usage, HOST).unwrap())
            .collect();
        assert!(allocations.iter().all(|a| a.buffer() == allocations[0].buffer()));
        let offsets: Vec<_> = allocations.iter().map(|a| a.offset()).collect();
        assert_eq!(offsets, vec![0, 256, 512]);
        assert!(allocations.iter().all(|a| a.size() == 256));
        let fourth = pool.allocate(200, usage, HOST).unwrap();
        assert_ne!(fourth.buffer(), allocations[0].buffer());
        assert_eq!(device.live_buffer_count(), 2);
        for allocation in allocations {
            pool.release(allocation, 0);
        }
        pool.release(fourth, 0);
        let report = pool.report();
        assert_eq!(report[0].free_buffers, 2);
        assert_eq!(report[0].live_suballocations, 0);
    }

    #[test]
    fn incompatible_properties_get_their_own_buffer() {
        let (_device, pool) = pool(AllocatorSettings::default());
        let usage = vk::BufferUsageFlags::VERTEX_BUFFER;
        let host = pool.allocate(64, usage, HOST).unwrap();
        let local = pool.allocate(64, usage, vk::MemoryPropertyFlags::DEVICE_LOCAL).unwrap();
        assert_ne!(host.buffer(), local.buffer());
        assert!(host.mapped_ptr().is_some());
        assert!(local.mapped_ptr().is_none());
        let storage = pool.allocate(64, vk::BufferUsageFlags::STORAGE_BUFFER, HOST).unwrap();
        assert_ne!(storage.buffer(), host.buffer());
        pool.release(host, 0);
        pool.release(local, 0);
        pool.release(storage, 0);
    }

    #[test]
    fn idle_buffers_are_destroyed_one_per_call() {
        let settings = AllocatorSettings::default().with_frames_before_release(1);
        let (device, pool) = pool(settings);
        let usage = vk::BufferUsageFlags::VERTEX_BUFFER;
        let a = pool.allocate(64, usage, HOST).unwrap();
        let b = pool.allocate(64, usage, vk::MemoryPropertyFlags::DEVICE_LOCAL).unwrap();
        pool.release(a, 5);
        pool.release(b, 5);
        assert_eq!(pool.release_freed_resources(false, 6), 0);
        assert_eq!(pool.release_freed_resources(false, 7), 1);
        assert_eq!(pool.release_freed_resources(false, 7), 1);
        assert_eq!(device.live_buffer_count(), 0);
        assert_eq!(device.live_memory_count(), 0);
    }

    #[test]
    fn cached_request_falls_back_when_unavailable() {
        let (_device, pool) = pool(AllocatorSettings::default());
        let memory = &pool.memory;
        let lazy = vk::MemoryPropertyFlags::DEVICE_LOCAL | vk::MemoryPropertyFlags::LAZILY_ALLOCATED;
        assert_eq!(find_buffer_memory_type(memory, !0, lazy), Some(0));
        assert_eq!(find_buffer_memory_type(memory, 0b100, HOST | vk::MemoryPropertyFlags::HOST_CACHED), Some(2));
        assert_eq!(find_buffer_memory_type(memory, 0b001, HOST), None);
    }

    #[test]
    fn suballocations_released_after_release_all_are_ignored() {
        let (device, pool) = pool(AllocatorSettings::default());
        let buffer = pool.allocate(64, vk::BufferUsageFlags::VERTEX_BUFFER, HOST).unwrap();
        let leaks = pool.release_all();
        assert_eq!(leaks.suballocations, 1);
        pool.release(buffer, 0);
        assert_eq!(device.live_buffer_count(), 0);
        assert!(pool.report().iter().all(|bucket| bucket.live_suballocations == 0));
    }
}

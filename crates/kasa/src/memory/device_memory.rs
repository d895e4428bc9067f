use std::sync::Arc;

use core::ptr::NonNull;

use ash::vk;

use parking_lot::Mutex;

use kasa_log::{debug, warn, error};

use crate::{
    dev::{has_bits, align_up, align_down},
    device::{RawDevice, DedicatedTarget, DeviceLimits},
    error::{Error, Result},
    settings::DebugSettings,
};

/// Host address of mapped device memory.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct MappedPtr(NonNull<u8>);

unsafe impl Send for MappedPtr {}
unsafe impl Sync for MappedPtr {}

impl MappedPtr {

    #[inline(always)]
    pub fn new(ptr: NonNull<u8>) -> Self {
        Self(ptr)
    }

    #[inline(always)]
    pub fn get(self) -> NonNull<u8> {
        self.0
    }

    #[inline(always)]
    pub fn offset(self, offset: vk::DeviceSize) -> Self {
        Self(unsafe { self.0.add(offset as usize) })
    }
}

/// One raw allocation made against a device heap.
///
/// Only [`DeviceMemoryManager::free`] returns it to the device. Dropping a live
/// allocation leaks it and logs a warning.
#[derive(Debug)]
pub struct DeviceMemoryAllocation {
    handle: vk::DeviceMemory,
    size: vk::DeviceSize,
    memory_type_index: u32,
    heap_index: u32,
    property_flags: vk::MemoryPropertyFlags,
    dedicated: bool,
    mapped: Option<MappedPtr>,
    freed: bool,
}

impl DeviceMemoryAllocation {

    #[inline(always)]
    pub fn handle(&self) -> vk::DeviceMemory {
        self.handle
    }

    #[inline(always)]
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    #[inline(always)]
    pub fn memory_type_index(&self) -> u32 {
        self.memory_type_index
    }

    #[inline(always)]
    pub fn heap_index(&self) -> u32 {
        self.heap_index
    }

    #[inline(always)]
    pub fn property_flags(&self) -> vk::MemoryPropertyFlags {
        self.property_flags
    }

    #[inline(always)]
    pub fn is_dedicated(&self) -> bool {
        self.dedicated
    }

    #[inline(always)]
    pub fn can_be_mapped(&self) -> bool {
        has_bits!(self.property_flags, vk::MemoryPropertyFlags::HOST_VISIBLE)
    }

    #[inline(always)]
    pub fn is_coherent(&self) -> bool {
        has_bits!(self.property_flags, vk::MemoryPropertyFlags::HOST_COHERENT)
    }

    #[inline(always)]
    pub fn is_cached(&self) -> bool {
        has_bits!(self.property_flags, vk::MemoryPropertyFlags::HOST_CACHED)
    }

    #[inline(always)]
    pub fn is_mapped(&self) -> bool {
        self.mapped.is_some()
    }

    #[inline(always)]
    pub fn mapped_ptr(&self) -> Option<NonNull<u8>> {
        self.mapped.map(MappedPtr::get)
    }

    #[inline(always)]
    pub(crate) fn mapped(&self) -> Option<MappedPtr> {
        self.mapped
    }

    /// Describes `size` bytes at `offset` for flushing or invalidating.
    #[inline(always)]
    pub fn range(&self, offset: vk::DeviceSize, size: vk::DeviceSize) -> MappedRange {
        MappedRange {
            memory: self.handle,
            memory_size: self.size,
            coherent: self.is_coherent(),
            offset,
            size,
        }
    }
}

impl Drop for DeviceMemoryAllocation {

    fn drop(&mut self) {
        if !self.freed && !std::thread::panicking() {
            warn!("leaked device memory allocation of {} bytes from memory type {}",
                self.size, self.memory_type_index);
        }
    }
}

/// Host visible range of a device memory allocation.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct MappedRange {
    pub memory: vk::DeviceMemory,
    pub memory_size: vk::DeviceSize,
    pub coherent: bool,
    pub offset: vk::DeviceSize,
    pub size: vk::DeviceSize,
}

#[derive(Clone, Copy, Default, Debug)]
pub struct HeapStatistics {
    pub heap_index: u32,
    pub size: vk::DeviceSize,
    pub budget: vk::DeviceSize,
    pub used: vk::DeviceSize,
    pub peak: vk::DeviceSize,
    pub allocation_count: u32,
    pub device_local: bool,
}

#[derive(Default)]
struct MemoryStats {
    heaps: Vec<HeapStatistics>,
    live_allocations: u32,
    peak_allocations: u32,
    /// Armed again once the live count drops back under the device limit.
    over_limit: bool,
    limit_warnings: u32,
}

/// Owns every raw allocation made against the device heaps.
pub struct DeviceMemoryManager {
    device: Arc<dyn RawDevice>,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    limits: DeviceLimits,
    debug: DebugSettings,
    stats: Mutex<MemoryStats>,
}

impl DeviceMemoryManager {

    pub fn new(device: Arc<dyn RawDevice>, debug: DebugSettings) -> Self {
        let memory_properties = *device.memory_properties();
        let limits = device.limits();
        let heaps = memory_properties.memory_heaps[..memory_properties.memory_heap_count as usize]
            .iter()
            .enumerate()
            .map(|(i, heap)| {
                let device_local = heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL);
                HeapStatistics {
                    heap_index: i as u32,
                    size: heap.size,
                    budget: if device_local { heap.size / 100 * 95 } else { heap.size },
                    device_local,
                    ..Default::default()
                }
            })
            .collect();
        Self {
            device,
            memory_properties,
            limits,
            debug,
            stats: Mutex::new(MemoryStats {
                heaps,
                ..Default::default()
            }),
        }
    }

    #[inline(always)]
    pub fn device(&self) -> &Arc<dyn RawDevice> {
        &self.device
    }

    #[inline(always)]
    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    #[inline(always)]
    pub fn limits(&self) -> &DeviceLimits {
        &self.limits
    }

    #[inline(always)]
    pub fn memory_type_count(&self) -> u32 {
        self.memory_properties.memory_type_count
    }

    #[inline(always)]
    pub fn memory_type_properties(&self, memory_type_index: u32) -> vk::MemoryPropertyFlags {
        self.memory_properties.memory_types[memory_type_index as usize].property_flags
    }

    #[inline(always)]
    pub fn heap_index(&self, memory_type_index: u32) -> u32 {
        self.memory_properties.memory_types[memory_type_index as usize].heap_index
    }

    #[inline(always)]
    pub fn heap_size(&self, heap_index: u32) -> vk::DeviceSize {
        self.memory_properties.memory_heaps[heap_index as usize].size
    }

    /// First memory type in `type_bits` whose flags contain `required`.
    pub fn find_memory_type_index(&self, type_bits: u32, required: vk::MemoryPropertyFlags) -> Option<u32> {
        self.find_memory_type_index_excluding(type_bits, required, None)
    }

    /// Like [`Self::find_memory_type_index`], skipping `excluded`.
    pub fn find_memory_type_index_excluding(
        &self,
        type_bits: u32,
        required: vk::MemoryPropertyFlags,
        excluded: Option<u32>,
    ) -> Option<u32>
    {
        let count = self.memory_properties.memory_type_count as usize;
        self.memory_properties.memory_types[..count]
            .iter()
            .enumerate()
            .find(|&(i, memory_type)| {
                type_bits & (1 << i) != 0 &&
                Some(i as u32) != excluded &&
                has_bits!(memory_type.property_flags, required)
            })
            .map(|(i, _)| i as u32)
    }

    /// Whether some memory type has exactly `flags`.
    pub fn supports_memory_type(&self, flags: vk::MemoryPropertyFlags) -> bool {
        let count = self.memory_properties.memory_type_count as usize;
        self.memory_properties.memory_types[..count]
            .iter()
            .any(|memory_type| memory_type.property_flags == flags)
    }

    /// Allocates `size` bytes from `memory_type_index`.
    ///
    /// Running out of memory is logged as a warning when `can_fail` is set and as an
    /// error otherwise. Either way the error is returned.
    pub fn alloc(
        &self,
        can_fail: bool,
        size: vk::DeviceSize,
        memory_type_index: u32,
        dedicated: Option<DedicatedTarget>,
    ) -> Result<DeviceMemoryAllocation>
    {
        if size == 0 {
            return Err(Error::ZeroSizeAlloc)
        }
        assert!(memory_type_index < self.memory_type_count(), "invalid memory type index {memory_type_index}");
        {
            let mut stats = self.stats.lock();
            if stats.live_allocations >= self.limits.max_memory_allocation_count && !stats.over_limit {
                stats.over_limit = true;
                stats.limit_warnings += 1;
                warn!("hit the device allocation limit of {} raw allocations",
                    self.limits.max_memory_allocation_count);
            }
        }
        let handle = match self.device.allocate_memory(size, memory_type_index, dedicated) {
            Ok(handle) => handle,
            Err(result) => {
                let err = Error::allocation(result, size, memory_type_index);
                if err.is_out_of_memory() && can_fail {
                    warn!("failed to allocate {} bytes from memory type {}: {}", size, memory_type_index, err);
                } else {
                    error!("failed to allocate {} bytes from memory type {}: {}", size, memory_type_index, err);
                }
                return Err(err)
            },
        };
        let heap_index = self.heap_index(memory_type_index);
        {
            let mut stats = self.stats.lock();
            stats.live_allocations += 1;
            stats.peak_allocations = stats.peak_allocations.max(stats.live_allocations);
            let heap = &mut stats.heaps[heap_index as usize];
            heap.used += size;
            heap.peak = heap.peak.max(heap.used);
            heap.allocation_count += 1;
        }
        if self.debug.log_allocations {
            debug!("allocated {} bytes from memory type {} (heap {}){}",
                size, memory_type_index, heap_index,
                if dedicated.is_some() { " dedicated" } else { "" });
        }
        Ok(DeviceMemoryAllocation {
            handle,
            size,
            memory_type_index,
            heap_index,
            property_flags: self.memory_type_properties(memory_type_index),
            dedicated: dedicated.is_some(),
            mapped: None,
            freed: false,
        })
    }

    /// Unmaps if needed and returns the allocation to the device.
    pub fn free(&self, mut allocation: DeviceMemoryAllocation) {
        unsafe {
            if allocation.mapped.take().is_some() {
                self.device.unmap_memory(allocation.handle);
            }
            self.device.free_memory(allocation.handle);
        }
        allocation.freed = true;
        let mut stats = self.stats.lock();
        stats.live_allocations -= 1;
        if stats.live_allocations < self.limits.max_memory_allocation_count {
            stats.over_limit = false;
        }
        let heap = &mut stats.heaps[allocation.heap_index as usize];
        heap.used -= allocation.size;
        heap.allocation_count -= 1;
        drop(stats);
        if self.debug.log_allocations {
            debug!("freed {} bytes from memory type {}", allocation.size, allocation.memory_type_index);
        }
    }

    /// Maps the whole allocation.
    ///
    /// # Panics
    /// If the allocation is already mapped.
    pub fn map(&self, allocation: &mut DeviceMemoryAllocation) -> Result<NonNull<u8>> {
        assert!(allocation.mapped.is_none(), "device memory mapped twice");
        if !allocation.can_be_mapped() {
            return Err(Error::UnmappableMemory(allocation.memory_type_index))
        }
        let ptr = unsafe {
            self.device.map_memory(allocation.handle)?
        };
        allocation.mapped = Some(MappedPtr(ptr));
        Ok(ptr)
    }

    /// # Panics
    /// If the allocation is not mapped.
    pub fn unmap(&self, allocation: &mut DeviceMemoryAllocation) {
        assert!(allocation.mapped.take().is_some(), "unmapping device memory that is not mapped");
        unsafe {
            self.device.unmap_memory(allocation.handle);
        }
    }

    /// Rounds a range out to the non-coherent atom size, clamped to the allocation.
    fn atom_range(&self, range: &MappedRange) -> (vk::DeviceSize, vk::DeviceSize) {
        let atom = self.limits.non_coherent_atom_size;
        let start = align_down(range.offset, atom);
        let end = align_up(range.offset + range.size, atom);
        if end >= range.memory_size {
            (start, vk::WHOLE_SIZE)
        } else {
            (start, end - start)
        }
    }

    /// Makes host writes visible to the device. No-op on coherent memory.
    pub fn flush(&self, range: &MappedRange) -> Result<()> {
        if range.coherent && !self.debug.force_coherent_operations {
            return Ok(())
        }
        let (offset, size) = self.atom_range(range);
        unsafe {
            self.device.flush_mapped_memory(range.memory, offset, size)?;
        }
        Ok(())
    }

    /// Makes device writes visible to the host. No-op on coherent memory.
    pub fn invalidate(&self, range: &MappedRange) -> Result<()> {
        if range.coherent && !self.debug.force_coherent_operations {
            return Ok(())
        }
        let (offset, size) = self.atom_range(range);
        unsafe {
            self.device.invalidate_mapped_memory(range.memory, offset, size)?;
        }
        Ok(())
    }

    pub fn heap_stats(&self) -> Vec<HeapStatistics> {
        self.stats.lock().heaps.clone()
    }

    #[inline(always)]
    pub fn live_allocation_count(&self) -> u32 {
        self.stats.lock().live_allocations
    }

    #[inline(always)]
    pub fn peak_allocation_count(&self) -> u32 {
        self.stats.lock().peak_allocations
    }

    /// Times the live allocation count reached the device limit.
    #[inline(always)]
    pub fn allocation_limit_warnings(&self) -> u32 {
        self.stats.lock().limit_warnings
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    use crate::device::HeadlessDevice;

    fn manager(debug: DebugSettings) -> (Arc<HeadlessDevice>, DeviceMemoryManager) {
        let device = Arc::new(HeadlessDevice::with_heap_sizes(1 << 20, 1 << 20));
        let manager = DeviceMemoryManager::new(device.clone(), debug);
        (device, manager)
    }

    #[test]
    fn finds_memory_types_by_superset() {
        let (_device, manager) = manager(DebugSettings::default());
        let host = vk::MemoryPropertyFlags::HOST_VISIBLE;
        let cached = host | vk::MemoryPropertyFlags::HOST_CACHED;
        assert_eq!(manager.find_memory_type_index(!0, vk::MemoryPropertyFlags::DEVICE_LOCAL), Some(0));
        assert_eq!(manager.find_memory_type_index(!0, host), Some(1));
        assert_eq!(manager.find_memory_type_index(!0, cached), Some(2));
        assert_eq!(manager.find_memory_type_index(0b001, host), None);
        assert_eq!(manager.find_memory_type_index_excluding(!0, host, Some(1)), Some(2));
        assert!(manager.supports_memory_type(vk::MemoryPropertyFlags::DEVICE_LOCAL));
        assert!(!manager.supports_memory_type(vk::MemoryPropertyFlags::LAZILY_ALLOCATED));
    }

    #[test]
    fn tracks_heap_usage_and_peaks() {
        let (device, manager) = manager(DebugSettings::default());
        let a = manager.alloc(false, 4096, 0, None).unwrap();
        let b = manager.alloc(false, 8192, 0, None).unwrap();
        manager.free(a);
        let stats = manager.heap_stats();
        assert_eq!(stats[0].used, 8192);
        assert_eq!(stats[0].peak, 12288);
        assert_eq!(stats[0].allocation_count, 1);
        assert!(stats[0].device_local);
        assert_eq!(manager.peak_allocation_count(), 2);
        manager.free(b);
        assert_eq!(manager.live_allocation_count(), 0);
        assert_eq!(device.live_memory_count(), 0);
    }

    #[test]
    fn out_of_memory_is_returned() {
        let (_device, manager) = manager(DebugSettings::default());
        let err = manager.alloc(true, 2 << 20, 0, None).unwrap_err();
        assert!(matches!(err, Error::OutOfDeviceMemory { size, memory_type_index: 0 } if size == 2 << 20));
        assert!(matches!(manager.alloc(true, 0, 0, None), Err(Error::ZeroSizeAlloc)));
        assert_eq!(manager.live_allocation_count(), 0);
    }

    #[test]
    fn map_and_flush_respect_coherency() {
        let debug = DebugSettings {
            force_coherent_operations: false,
            ..Default::default()
        };
        let (device, manager) = manager(debug);
        let mut local = manager.alloc(false, 256, 0, None).unwrap();
        assert!(matches!(manager.map(&mut local), Err(Error::UnmappableMemory(0))));
        let mut host = manager.alloc(false, 1024, 1, None).unwrap();
        manager.map(&mut host).unwrap();
        assert!(device.is_mapped(host.handle()));
        manager.flush(&host.range(0, 16)).unwrap();
        assert_eq!(device.flush_count(), 0);
        manager.free(host);
        manager.free(local);
        assert_eq!(device.live_memory_count(), 0);
    }

    #[test]
    fn forced_flush_rounds_to_atoms() {
        let debug = DebugSettings {
            force_coherent_operations: true,
            ..Default::default()
        };
        let (device, manager) = manager(debug);
        let mut host = manager.alloc(false, 1024, 1, None).unwrap();
        manager.map(&mut host).unwrap();
        assert_eq!(manager.atom_range(&host.range(70, 10)), (64, 64));
        assert_eq!(manager.atom_range(&host.range(1000, 24)), (960, vk::WHOLE_SIZE));
        manager.flush(&host.range(70, 10)).unwrap();
        manager.invalidate(&host.range(70, 10)).unwrap();
        assert_eq!(device.flush_count(), 1);
        assert_eq!(device.invalidate_count(), 1);
        manager.unmap(&mut host);
        assert!(!device.is_mapped(host.handle()));
        manager.free(host);
    }

    #[test]
    #[should_panic(expected = "mapped twice")]
    fn double_map_panics() {
        let (_device, manager) = manager(DebugSettings::default());
        let mut host = manager.alloc(false, 64, 1, None).unwrap();
        manager.map(&mut host).unwrap();
        let _ = manager.map(&mut host);
    }

    #[test]
    fn allocation_limit_warning_rearms_below_the_limit() {
        let device = HeadlessDevice::with_heap_sizes(1 << 20, 1 << 20);
        let limits = DeviceLimits {
            max_memory_allocation_count: 2,
            ..device.limits()
        };
        let manager = DeviceMemoryManager::new(Arc::new(device.with_limits(limits)), DebugSettings::default());
        let mut live: Vec<_> = (0..3).map(|_| manager.alloc(true, 256, 0, None).unwrap()).collect();
        assert_eq!(manager.allocation_limit_warnings(), 1);
        live.push(manager.alloc(true, 256, 0, None).unwrap());
        assert_eq!(manager.allocation_limit_warnings(), 1);
        for allocation in live.drain(1..) {
            manager.free(allocation);
        }
        live.push(manager.alloc(true, 256, 0, None).unwrap());
        assert_eq!(manager.allocation_limit_warnings(), 1);
        live.push(manager.alloc(true, 256, 0, None).unwrap());
        assert_eq!(manager.allocation_limit_warnings(), 2);
        for allocation in live {
            manager.free(allocation);
        }
    }
}

use std::sync::Arc;

use core::ptr::NonNull;

use ash::vk;

use parking_lot::Mutex;

use kasa_log::{debug, warn};

use crate::{
    dev::has_bits,
    device::DedicatedTarget,
    error::{Error, Result},
    settings::AllocatorSettings,
};

use super::{
    arena::{Arena, SlotIndex},
    free_list::{FreeList, Carve},
    device_memory::{DeviceMemoryManager, DeviceMemoryAllocation, MappedPtr, MappedRange},
};

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ResourceKind {
    Image,
    Buffer,
}

impl ResourceKind {

    #[inline(always)]
    fn index(self) -> usize {
        match self {
            Self::Image => 0,
            Self::Buffer => 1,
        }
    }
}

pub(crate) struct HeapPage {
    memory: DeviceMemoryAllocation,
    free_list: FreeList,
    kind: ResourceKind,
    frame_freed: u64,
}

impl HeapPage {

    fn try_allocate(
        &mut self,
        index: SlotIndex<HeapPage>,
        size: vk::DeviceSize,
        alignment: vk::DeviceSize,
    ) -> Option<ResourceAllocation>
    {
        let carve = self.free_list.try_allocate(size, alignment)?;
        Some(ResourceAllocation::new(PageMemory::of(&self.memory), carve, PageOwner::Shared(index)))
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum PageOwner {
    Shared(SlotIndex<HeapPage>),
    Dedicated(SlotIndex<HeapPage>),
}

#[derive(Clone, Copy, Debug)]
struct PageMemory {
    handle: vk::DeviceMemory,
    size: vk::DeviceSize,
    memory_type_index: u32,
    coherent: bool,
    mapped: Option<MappedPtr>,
}

impl PageMemory {

    #[inline(always)]
    fn of(memory: &DeviceMemoryAllocation) -> Self {
        Self {
            handle: memory.handle(),
            size: memory.size(),
            memory_type_index: memory.memory_type_index(),
            coherent: memory.is_coherent(),
            mapped: memory.mapped(),
        }
    }
}

/// A byte range of a page, or a whole dedicated allocation.
///
/// Return it with [`PageAllocator::release`].
#[derive(Debug)]
pub struct ResourceAllocation {
    page: PageMemory,
    carve: Carve,
    owner: PageOwner,
}

impl ResourceAllocation {

    #[inline(always)]
    fn new(page: PageMemory, carve: Carve, owner: PageOwner) -> Self {
        Self {
            page,
            carve,
            owner,
        }
    }

    #[inline(always)]
    pub fn memory(&self) -> vk::DeviceMemory {
        self.page.handle
    }

    #[inline(always)]
    pub fn memory_type_index(&self) -> u32 {
        self.page.memory_type_index
    }

    /// Offset of the aligned range inside the device memory.
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
    pub fn is_dedicated(&self) -> bool {
        matches!(self.owner, PageOwner::Dedicated(_))
    }

    /// Host address of the range when its page is mapped.
    #[inline(always)]
    pub fn mapped_ptr(&self) -> Option<NonNull<u8>> {
        self.page.mapped.map(|ptr| ptr.offset(self.carve.offset).get())
    }

    /// `size` bytes at `offset` relative to this allocation.
    #[inline(always)]
    pub fn mapped_range(&self, offset: vk::DeviceSize, size: vk::DeviceSize) -> MappedRange {
        MappedRange {
            memory: self.page.handle,
            memory_size: self.page.size,
            coherent: self.page.coherent,
            offset: self.carve.offset + offset,
            size,
        }
    }
}

#[derive(Default, Clone, Debug)]
pub struct PageReport {
    pub size: vk::DeviceSize,
    pub used: vk::DeviceSize,
    pub live_allocations: usize,
    pub free_ranges: usize,
    pub largest_free: vk::DeviceSize,
    pub mapped: bool,
}

#[derive(Default, Clone, Debug)]
pub struct ResourceHeapReport {
    pub memory_type_index: u32,
    pub used_image_pages: Vec<PageReport>,
    pub used_buffer_pages: Vec<PageReport>,
    pub free_pages: usize,
    pub dedicated_allocations: usize,
    pub dedicated_bytes: vk::DeviceSize,
    pub peak_page_count: usize,
}

impl ResourceHeapReport {

    pub fn total_bytes(&self) -> vk::DeviceSize {
        self.used_image_pages
            .iter()
            .chain(&self.used_buffer_pages)
            .map(|page| page.size)
            .sum::<vk::DeviceSize>() + self.dedicated_bytes
    }

    pub fn used_bytes(&self) -> vk::DeviceSize {
        self.used_image_pages
            .iter()
            .chain(&self.used_buffer_pages)
            .map(|page| page.used)
            .sum::<vk::DeviceSize>() + self.dedicated_bytes
    }
}

/// Pages of one memory type.
struct ResourceHeap {
    memory_type_index: u32,
    page_sizes: [vk::DeviceSize; 2],
    shared_free_pages: bool,
    pages: Arena<HeapPage>,
    used: [Vec<SlotIndex<HeapPage>>; 2],
    free: [Vec<SlotIndex<HeapPage>>; 2],
    dedicated: Vec<SlotIndex<HeapPage>>,
    peak_page_count: usize,
    /// Set by `release_all`, after which stale allocations may still come back.
    released_all: bool,
}

impl ResourceHeap {

    #[inline(always)]
    fn free_list_index(&self, kind: ResourceKind) -> usize {
        if self.shared_free_pages { 0 } else { kind.index() }
    }

    #[inline(always)]
    fn page_size(&self, kind: ResourceKind) -> vk::DeviceSize {
        self.page_sizes[kind.index()]
    }

    fn try_allocate_existing(
        &mut self,
        kind: ResourceKind,
        size: vk::DeviceSize,
        alignment: vk::DeviceSize,
        map: bool,
    ) -> Option<ResourceAllocation>
    {
        if size < self.page_size(kind) {
            for &index in &self.used[kind.index()] {
                let Some(page) = self.pages.get_mut(index) else {
                    continue
                };
                if page.memory.is_mapped() != map {
                    continue
                }
                if let Some(allocation) = page.try_allocate(index, size, alignment) {
                    return Some(allocation)
                }
            }
        }
        let free_index = self.free_list_index(kind);
        for i in 0..self.free[free_index].len() {
            let index = self.free[free_index][i];
            let Some(page) = self.pages.get_mut(index) else {
                continue
            };
            if page.memory.is_mapped() != map {
                continue
            }
            if let Some(allocation) = page.try_allocate(index, size, alignment) {
                page.kind = kind;
                self.free[free_index].remove(i);
                self.used[kind.index()].push(index);
                return Some(allocation)
            }
        }
        None
    }

    fn insert_page(&mut self, kind: ResourceKind, memory: DeviceMemoryAllocation) -> SlotIndex<HeapPage> {
        let free_list = FreeList::new(memory.size());
        let index = self.pages.insert(HeapPage {
            memory,
            free_list,
            kind,
            frame_freed: 0,
        });
        self.used[kind.index()].push(index);
        self.peak_page_count = self.peak_page_count.max(self.pages.len());
        index
    }

    fn report(&self) -> ResourceHeapReport {
        let page_report = |index: &SlotIndex<HeapPage>| {
            self.pages.get(*index).map(|page| PageReport {
                size: page.free_list.capacity(),
                used: page.free_list.used(),
                live_allocations: page.free_list.live_count(),
                free_ranges: page.free_list.ranges().len(),
                largest_free: page.free_list.largest_free(),
                mapped: page.memory.is_mapped(),
            })
        };
        ResourceHeapReport {
            memory_type_index: self.memory_type_index,
            used_image_pages: self.used[0].iter().filter_map(page_report).collect(),
            used_buffer_pages: self.used[1].iter().filter_map(page_report).collect(),
            free_pages: self.free[0].len() + self.free[1].len(),
            dedicated_allocations: self.dedicated.len(),
            dedicated_bytes: self.dedicated
                .iter()
                .filter_map(|index| self.pages.get(*index))
                .map(|page| page.memory.size())
                .sum(),
            peak_page_count: self.peak_page_count,
        }
    }
}

/// Outcome of [`PageAllocator::release_all`].
#[derive(Default, Clone, Copy, Debug)]
pub struct PageLeaks {
    pub pages: usize,
    pub allocations: usize,
    pub bytes: vk::DeviceSize,
}

/// Suballocates image and buffer memory out of large per memory type pages.
pub struct PageAllocator {
    memory: Arc<DeviceMemoryManager>,
    heaps: Vec<Mutex<ResourceHeap>>,
    retained_free_pages: usize,
    frames_before_release: u64,
}

impl PageAllocator {

    pub fn new(memory: Arc<DeviceMemoryManager>, settings: &AllocatorSettings) -> Self {
        let heaps = (0..memory.memory_type_count())
            .map(|memory_type_index| {
                let flags = memory.memory_type_properties(memory_type_index);
                let heap_size = memory.heap_size(memory.heap_index(memory_type_index));
                let device_local = has_bits!(flags, vk::MemoryPropertyFlags::DEVICE_LOCAL) &&
                    !flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE);
                let page_sizes = if !device_local {
                    [settings.host_visible_page_size; 2]
                } else if settings.shared_free_pages {
                    [settings.device_local_page_size.min(heap_size / 8); 2]
                } else {
                    [settings.image_page_size, settings.buffer_page_size]
                };
                Mutex::new(ResourceHeap {
                    memory_type_index,
                    page_sizes,
                    shared_free_pages: settings.shared_free_pages,
                    pages: Arena::new(),
                    used: Default::default(),
                    free: Default::default(),
                    dedicated: Vec::new(),
                    peak_page_count: 0,
                    released_all: false,
                })
            })
            .collect();
        Self {
            memory,
            heaps,
            retained_free_pages: settings.retained_free_pages,
            frames_before_release: settings.frames_before_release,
        }
    }

    #[inline(always)]
    pub fn memory(&self) -> &Arc<DeviceMemoryManager> {
        &self.memory
    }

    #[inline(always)]
    pub fn page_size(&self, memory_type_index: u32, kind: ResourceKind) -> vk::DeviceSize {
        self.heaps[memory_type_index as usize].lock().page_size(kind)
    }

    /// Carves `size` bytes out of a page of `memory_type_index`.
    ///
    /// Tries used pages, then idle pages, then a new page of at least the default
    /// page size. If the device cannot back a full page, a page of exactly `size`
    /// is tried once more, failing with `can_fail` semantics.
    pub fn allocate_resource(
        &self,
        kind: ResourceKind,
        memory_type_index: u32,
        size: vk::DeviceSize,
        alignment: vk::DeviceSize,
        map: bool,
        can_fail: bool,
    ) -> Result<ResourceAllocation>
    {
        if size == 0 {
            return Err(Error::ZeroSizeAlloc)
        }
        let heap = &self.heaps[memory_type_index as usize];
        let page_size = {
            let mut heap = heap.lock();
            if let Some(allocation) = heap.try_allocate_existing(kind, size, alignment, map) {
                return Ok(allocation)
            }
            heap.page_size(kind)
        };
        let mut memory = match self.memory.alloc(true, size.max(page_size), memory_type_index, None) {
            Ok(memory) => memory,
            Err(err) if err.is_out_of_memory() => {
                self.memory.alloc(can_fail, size, memory_type_index, None)?
            },
            Err(err) => return Err(err),
        };
        if map {
            if let Err(err) = self.memory.map(&mut memory) {
                self.memory.free(memory);
                return Err(err)
            }
        }
        debug!("new {:?} page of {} bytes in memory type {}", kind, memory.size(), memory_type_index);
        let mut heap = heap.lock();
        let index = heap.insert_page(kind, memory);
        heap.pages
            .get_mut(index)
            .and_then(|page| page.try_allocate(index, size, alignment))
            .ok_or(Error::OutOfDeviceMemory { size, memory_type_index })
    }

    /// Gives `target` a private allocation of `size` bytes.
    pub fn allocate_dedicated(
        &self,
        target: DedicatedTarget,
        memory_type_index: u32,
        size: vk::DeviceSize,
        can_fail: bool,
    ) -> Result<ResourceAllocation>
    {
        let memory = self.memory.alloc(can_fail, size, memory_type_index, Some(target))?;
        let mut free_list = FreeList::new(memory.size());
        let carve = free_list
            .try_allocate(size, 1)
            .ok_or(Error::ZeroSizeAlloc)?;
        let page_memory = PageMemory::of(&memory);
        let kind = match target {
            DedicatedTarget::Image(_) => ResourceKind::Image,
            DedicatedTarget::Buffer(_) => ResourceKind::Buffer,
        };
        let mut heap = self.heaps[memory_type_index as usize].lock();
        let index = heap.pages.insert(HeapPage {
            memory,
            free_list,
            kind,
            frame_freed: 0,
        });
        heap.dedicated.push(index);
        heap.peak_page_count = heap.peak_page_count.max(heap.pages.len());
        Ok(ResourceAllocation::new(page_memory, carve, PageOwner::Dedicated(index)))
    }

    /// Returns an allocation to its page.
    ///
    /// A page that becomes empty moves to the idle list stamped with `frame`; dedicated
    /// memory goes straight back to the device.
    ///
    /// Allocations released after [`release_all`](Self::release_all) are ignored with a
    /// warning, their memory is already gone.
    ///
    /// # Panics
    /// If the allocation's page no longer exists otherwise.
    pub fn release(&self, allocation: ResourceAllocation, frame: u64) {
        let mut heap = self.heaps[allocation.page.memory_type_index as usize].lock();
        match allocation.owner {
            PageOwner::Dedicated(index) => {
                let Some(page) = heap.pages.remove(index) else {
                    assert!(heap.released_all, "double free of dedicated allocation {:?}", index);
                    warn!("dedicated allocation {:?} released after shutdown", index);
                    return
                };
                heap.dedicated.retain(|&other| other != index);
                drop(heap);
                self.memory.free(page.memory);
            },
            PageOwner::Shared(index) => {
                let released_all = heap.released_all;
                let Some(page) = heap.pages.get_mut(index) else {
                    assert!(released_all, "double free of page allocation {:?}", index);
                    warn!("page allocation {:?} released after shutdown", index);
                    return
                };
                page.free_list.release_carve(&allocation.carve);
                if !page.free_list.is_fully_free() {
                    return
                }
                page.frame_freed = frame;
                let kind = page.kind;
                let free_index = heap.free_list_index(kind);
                heap.used[kind.index()].retain(|&other| other != index);
                heap.free[free_index].push(index);
            },
        }
    }

    /// Returns idle pages to the device once they sat unused for long enough.
    ///
    /// Frees at most one page unless `immediately` is set, and keeps the configured
    /// number of most recently idled pages per list around otherwise. Returns the number
    /// of pages freed.
    pub fn release_freed_pages(&self, immediately: bool, frame: u64) -> usize {
        let mut freed = Vec::new();
        let heap_count = self.heaps.len();
        for offset in 0..heap_count {
            let heap_index = (frame as usize + offset) % heap_count;
            let mut heap = self.heaps[heap_index].lock();
            let keep = if immediately { 0 } else { self.retained_free_pages };
            for list in 0..2 {
                // oldest first, the newest `keep` stay
                let mut i = 0;
                while i + keep < heap.free[list].len() {
                    let index = heap.free[list][i];
                    let expired = heap.pages
                        .get(index)
                        .is_some_and(|page| page.frame_freed + self.frames_before_release < frame);
                    if !immediately && !expired {
                        i += 1;
                        continue
                    }
                    heap.free[list].remove(i);
                    if let Some(page) = heap.pages.remove(index) {
                        freed.push(page.memory);
                    }
                    if !immediately {
                        break
                    }
                }
                if !immediately && !freed.is_empty() {
                    break
                }
            }
            if !immediately && !freed.is_empty() {
                break
            }
        }
        let count = freed.len();
        for memory in freed {
            debug!("releasing idle page of {} bytes in memory type {}", memory.size(), memory.memory_type_index());
            self.memory.free(memory);
        }
        count
    }

    pub fn report(&self) -> Vec<ResourceHeapReport> {
        self.heaps
            .iter()
            .map(|heap| heap.lock().report())
            .filter(|report| report.peak_page_count > 0)
            .collect()
    }

    /// Frees every page, counting the ones that still had live allocations.
    pub fn release_all(&self) -> PageLeaks {
        let mut leaks = PageLeaks::default();
        let mut freed = Vec::new();
        for heap in &self.heaps {
            let mut heap = heap.lock();
            for page in heap.pages.drain() {
                if page.free_list.live_count() > 0 {
                    leaks.pages += 1;
                    leaks.allocations += page.free_list.live_count();
                    leaks.bytes += page.free_list.used();
                }
                freed.push(page.memory);
            }
            heap.used = Default::default();
            heap.free = Default::default();
            heap.dedicated.clear();
            heap.released_all = true;
        }
        for memory in freed {
            self.memory.free(memory);
        }
        leaks
    }
}

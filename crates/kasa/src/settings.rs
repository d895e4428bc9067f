use ash::vk;

const MIB: vk::DeviceSize = 1 << 20;

/// Diagnostics toggles of the allocator.
#[derive(Clone, Copy, Debug)]
pub struct DebugSettings {
    /// Logs the device heaps and memory types when the context is created.
    pub log_memory_information: bool,
    /// Logs everything that is still alive on shutdown.
    pub log_leaks_on_shutdown: bool,
    /// Logs every raw device allocation and free at debug level.
    pub log_allocations: bool,
    /// Flushes and invalidates even coherent memory.
    pub force_coherent_operations: bool,
}

impl Default for DebugSettings {

    fn default() -> Self {
        Self {
            log_memory_information: false,
            log_leaks_on_shutdown: true,
            log_allocations: false,
            force_coherent_operations: false,
        }
    }
}

/// One size class of the binned buffer suballocator.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct BufferBucket {
    /// Requests up to this size are rounded up to it.
    pub size: vk::DeviceSize,
    /// Size of the buffers created for this bucket.
    pub buffer_size: vk::DeviceSize,
}

impl BufferBucket {

    #[inline(always)]
    pub const fn new(size: vk::DeviceSize, buffer_size: vk::DeviceSize) -> Self {
        Self {
            size,
            buffer_size,
        }
    }
}

pub const DEFAULT_BUFFER_BUCKETS: [BufferBucket; 6] = [
    BufferBucket::new(128, 128 << 10),
    BufferBucket::new(256, 128 << 10),
    BufferBucket::new(512, 256 << 10),
    BufferBucket::new(1024, 256 << 10),
    BufferBucket::new(2048, 512 << 10),
    BufferBucket::new(8192, 512 << 10),
];

#[derive(Clone, Debug)]
pub struct AllocatorSettings {
    /// Upper bound of pages in device local heaps, also capped to an eighth of the heap.
    pub device_local_page_size: vk::DeviceSize,
    /// Page size of host visible memory types.
    pub host_visible_page_size: vk::DeviceSize,
    /// Device local image page size when free pages are not shared.
    pub image_page_size: vk::DeviceSize,
    /// Device local buffer page size when free pages are not shared.
    pub buffer_page_size: vk::DeviceSize,
    /// Whether image and buffer requests draw from the same free pages.
    pub shared_free_pages: bool,
    /// Idle pages kept per free list unless releasing immediately.
    pub retained_free_pages: usize,
    /// Frames an idle page, buffer or staging buffer waits before it is returned to the device.
    pub frames_before_release: u64,
    pub buffer_binning: bool,
    pub buffer_buckets: Vec<BufferBucket>,
    /// Buffer size of the unbounded bucket.
    pub large_buffer_size: vk::DeviceSize,
    /// Frames a deferred deletion waits in addition to its fence.
    pub deletion_frame_delay: u64,
    pub temp_frame_buffer_size: vk::DeviceSize,
    pub dedicated_allocations: bool,
    /// Aborts the process when a non failable allocation runs out of memory.
    pub abort_on_out_of_memory: bool,
    pub debug: DebugSettings,
}

impl Default for AllocatorSettings {

    fn default() -> Self {
        Self {
            device_local_page_size: 256 * MIB,
            host_visible_page_size: 32 * MIB,
            image_page_size: 16 * MIB,
            buffer_page_size: 4 * MIB,
            shared_free_pages: true,
            retained_free_pages: 1,
            frames_before_release: 10,
            buffer_binning: true,
            buffer_buckets: DEFAULT_BUFFER_BUCKETS.to_vec(),
            large_buffer_size: MIB,
            deletion_frame_delay: 3,
            temp_frame_buffer_size: 4 * MIB,
            dedicated_allocations: true,
            abort_on_out_of_memory: true,
            debug: DebugSettings::default(),
        }
    }
}

impl AllocatorSettings {

    /// Settings tuned for tiled mobile GPUs: split page lists and a shorter idle threshold.
    pub fn mobile() -> Self {
        Self {
            shared_free_pages: false,
            frames_before_release: 3,
            ..Default::default()
        }
    }

    #[inline(always)]
    pub fn with_device_local_page_size(mut self, size: vk::DeviceSize) -> Self {
        self.device_local_page_size = size;
        self
    }

    #[inline(always)]
    pub fn with_host_visible_page_size(mut self, size: vk::DeviceSize) -> Self {
        self.host_visible_page_size = size;
        self
    }

    #[inline(always)]
    pub fn with_split_page_sizes(mut self, image: vk::DeviceSize, buffer: vk::DeviceSize) -> Self {
        self.shared_free_pages = false;
        self.image_page_size = image;
        self.buffer_page_size = buffer;
        self
    }

    #[inline(always)]
    pub fn with_shared_free_pages(mut self, shared: bool) -> Self {
        self.shared_free_pages = shared;
        self
    }

    #[inline(always)]
    pub fn with_retained_free_pages(mut self, count: usize) -> Self {
        self.retained_free_pages = count;
        self
    }

    #[inline(always)]
    pub fn with_frames_before_release(mut self, frames: u64) -> Self {
        self.frames_before_release = frames;
        self
    }

    #[inline(always)]
    pub fn with_buffer_binning(mut self, binning: bool) -> Self {
        self.buffer_binning = binning;
        self
    }

    /// Replaces the size classes. Buckets are sorted by size.
    pub fn with_buffer_buckets(mut self, buckets: &[BufferBucket], large_buffer_size: vk::DeviceSize) -> Self {
        self.buffer_buckets = buckets.to_vec();
        self.buffer_buckets.sort_by_key(|bucket| bucket.size);
        self.large_buffer_size = large_buffer_size;
        self
    }

    #[inline(always)]
    pub fn with_deletion_frame_delay(mut self, frames: u64) -> Self {
        self.deletion_frame_delay = frames;
        self
    }

    #[inline(always)]
    pub fn with_temp_frame_buffer_size(mut self, size: vk::DeviceSize) -> Self {
        self.temp_frame_buffer_size = size;
        self
    }

    #[inline(always)]
    pub fn with_dedicated_allocations(mut self, enabled: bool) -> Self {
        self.dedicated_allocations = enabled;
        self
    }

    #[inline(always)]
    pub fn with_abort_on_out_of_memory(mut self, abort: bool) -> Self {
        self.abort_on_out_of_memory = abort;
        self
    }

    #[inline(always)]
    pub fn with_debug(mut self, debug: DebugSettings) -> Self {
        self.debug = debug;
        self
    }
}

use std::sync::Arc;

use core::sync::atomic::{AtomicU64, AtomicBool, Ordering};

use ash::vk;

use kasa_log::{info, warn, error};

use crate::{
    device::{RawDevice, DedicatedTarget, DeletableObject, ObjectKind},
    error::{Error, Result},
    fence::{Fence, FencePool},
    memory::{
        DeviceMemoryManager, PageAllocator, ResourceAllocation, ResourceKind,
        BufferPool, BufferSuballocation, MappedRange,
        buffer_pool::find_buffer_memory_type,
    },
    report::{MemoryReport, LeakReport},
    settings::AllocatorSettings,
    staging::{StagingManager, StagingBuffer},
    submission::{CmdBufferId, SubmissionTracker},
    deletion::DeferredDeletionQueue,
    temp_frame::{TempFrameRing, TempAllocation},
};

/// Owns every memory pool of one device.
///
/// Create one per logical device and shut it down before the device is destroyed.
/// Every method takes `&self` and may be called from any thread.
pub struct AllocatorContext {
    device: Arc<dyn RawDevice>,
    settings: AllocatorSettings,
    memory: Arc<DeviceMemoryManager>,
    pages: Arc<PageAllocator>,
    buffers: Arc<BufferPool>,
    staging: StagingManager,
    deletion: DeferredDeletionQueue,
    fences: FencePool,
    temp_frames: TempFrameRing,
    submissions: SubmissionTracker,
    frame: AtomicU64,
    shut_down: AtomicBool,
}

impl AllocatorContext {

    pub fn new(device: Arc<dyn RawDevice>, settings: AllocatorSettings) -> Result<Self> {
        let memory = Arc::new(DeviceMemoryManager::new(device.clone(), settings.debug));
        if settings.debug.log_memory_information {
            log_memory_layout(&memory);
        }
        let pages = Arc::new(PageAllocator::new(memory.clone(), &settings));
        let buffers = Arc::new(BufferPool::new(memory.clone(), &settings));
        let temp_frames = TempFrameRing::new(buffers.clone(), settings.temp_frame_buffer_size)?;
        Ok(Self {
            staging: StagingManager::new(pages.clone(), settings.frames_before_release),
            deletion: DeferredDeletionQueue::new(device.clone(), settings.deletion_frame_delay),
            fences: FencePool::new(device.clone()),
            temp_frames,
            submissions: SubmissionTracker::new(),
            frame: AtomicU64::new(0),
            shut_down: AtomicBool::new(false),
            device,
            settings,
            memory,
            pages,
            buffers,
        })
    }

    #[inline(always)]
    pub fn device(&self) -> &Arc<dyn RawDevice> {
        &self.device
    }

    #[inline(always)]
    pub fn settings(&self) -> &AllocatorSettings {
        &self.settings
    }

    #[inline(always)]
    pub fn memory(&self) -> &DeviceMemoryManager {
        &self.memory
    }

    #[inline(always)]
    pub fn frame_number(&self) -> u64 {
        self.frame.load(Ordering::Acquire)
    }

    /// Logs everything and aborts if the failure was not allowed to happen.
    fn check<T>(&self, result: Result<T>, can_fail: bool) -> Result<T> {
        match &result {
            Err(err) if err.is_out_of_memory() && !can_fail => {
                error!("fatal out of memory: {}\n{}", err, self.report());
                if self.settings.abort_on_out_of_memory {
                    std::process::abort()
                }
            },
            _ => {},
        }
        result
    }

    /// Suballocates a pooled buffer range.
    pub fn allocate_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        properties: vk::MemoryPropertyFlags,
    ) -> Result<BufferSuballocation>
    {
        self.check(self.buffers.allocate(size, usage, properties), false)
    }

    pub fn release_buffer(&self, buffer: BufferSuballocation) {
        self.buffers.release(buffer, self.frame_number());
    }

    /// Allocates page memory for `buffer` and binds it.
    pub fn allocate_buffer_memory(
        &self,
        buffer: vk::Buffer,
        properties: vk::MemoryPropertyFlags,
        map: bool,
    ) -> Result<ResourceAllocation>
    {
        let requirements = unsafe {
            self.device.buffer_memory_requirements(buffer)
        };
        let memory_type_index = find_buffer_memory_type(&self.memory, requirements.memory_type_bits, properties)
            .ok_or(Error::NoCompatibleMemoryType {
                type_bits: requirements.memory_type_bits,
                properties,
            })?;
        let allocation = self.check(self.pages.allocate_resource(
            ResourceKind::Buffer, memory_type_index, requirements.size, requirements.alignment, map, false,
        ), false)?;
        let bound = unsafe {
            self.device.bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        };
        if let Err(err) = bound {
            self.pages.release(allocation, self.frame_number());
            return Err(err.into())
        }
        Ok(allocation)
    }

    /// Allocates memory for `image` and binds it.
    ///
    /// Images the driver wants in their own allocation get one when dedicated
    /// allocations are enabled. When the preferred memory type is exhausted, another
    /// type with the same properties is tried before failing for good.
    pub fn allocate_image_memory(
        &self,
        image: vk::Image,
        properties: vk::MemoryPropertyFlags,
    ) -> Result<ResourceAllocation>
    {
        let requirements = unsafe {
            self.device.image_memory_requirements(image)
        };
        if requirements.requires_dedicated ||
            (requirements.prefers_dedicated && self.settings.dedicated_allocations)
        {
            return self.allocate_dedicated_image_memory(image, properties)
        }
        let vk::MemoryRequirements { size, alignment, memory_type_bits } = requirements.requirements;
        let memory_type_index = self.memory
            .find_memory_type_index(memory_type_bits, properties)
            .ok_or(Error::NoCompatibleMemoryType { type_bits: memory_type_bits, properties })?;
        let allocation = match self.pages.allocate_resource(
            ResourceKind::Image, memory_type_index, size, alignment, false, true,
        ) {
            Ok(allocation) => allocation,
            Err(err) if err.is_out_of_memory() => {
                let Some(fallback) = self.memory.find_memory_type_index_excluding(
                    memory_type_bits, properties, Some(memory_type_index),
                ) else {
                    return self.check(Err(err), false)
                };
                warn!("memory type {} exhausted, falling back to memory type {}", memory_type_index, fallback);
                self.check(self.pages.allocate_resource(
                    ResourceKind::Image, fallback, size, alignment, false, false,
                ), false)?
            },
            Err(err) => return Err(err),
        };
        let bound = unsafe {
            self.device.bind_image_memory(image, allocation.memory(), allocation.offset())
        };
        if let Err(err) = bound {
            self.pages.release(allocation, self.frame_number());
            return Err(err.into())
        }
        Ok(allocation)
    }

    /// Gives `image` its own device memory allocation and binds it.
    pub fn allocate_dedicated_image_memory(
        &self,
        image: vk::Image,
        properties: vk::MemoryPropertyFlags,
    ) -> Result<ResourceAllocation>
    {
        let requirements = unsafe {
            self.device.image_memory_requirements(image)
        }.requirements;
        let memory_type_index = self.memory
            .find_memory_type_index(requirements.memory_type_bits, properties)
            .ok_or(Error::NoCompatibleMemoryType {
                type_bits: requirements.memory_type_bits,
                properties,
            })?;
        let allocation = self.check(self.pages.allocate_dedicated(
            DedicatedTarget::Image(image), memory_type_index, requirements.size, false,
        ), false)?;
        let bound = unsafe {
            self.device.bind_image_memory(image, allocation.memory(), 0)
        };
        if let Err(err) = bound {
            self.pages.release(allocation, self.frame_number());
            return Err(err.into())
        }
        Ok(allocation)
    }

    /// Returns image or buffer memory to its page.
    ///
    /// The resource bound to it must already be destroyed or unused by the GPU.
    pub fn release_resource(&self, allocation: ResourceAllocation) {
        self.pages.release(allocation, self.frame_number());
    }

    pub fn acquire_staging_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        cpu_readable: bool,
    ) -> Result<StagingBuffer>
    {
        self.check(self.staging.acquire(size, usage, cpu_readable), false)
    }

    /// Returns a staging buffer. With `cmd` it is reused only after the work recorded
    /// into `cmd` so far completes.
    pub fn release_staging_buffer(&self, buffer: StagingBuffer, cmd: Option<CmdBufferId>) {
        let submission = cmd.and_then(|cmd| {
            self.submissions
                .signaled_counter(cmd)
                .map(|counter| (cmd, counter))
        });
        self.staging.release(buffer, submission, self.frame_number());
    }

    /// Destroys `object` once the frame delay has passed and the command buffer that
    /// was active at this point completed.
    pub fn enqueue_deferred_deletion<T: DeletableObject>(&self, object: T) {
        self.deletion.enqueue(object, self.submissions.active(), self.frame_number());
    }

    pub fn enqueue_deferred_deletion_raw(&self, kind: ObjectKind, raw: u64) {
        self.deletion.enqueue_raw(kind, raw, self.submissions.active(), self.frame_number());
    }

    #[inline(always)]
    pub fn allocate_fence(&self, create_signaled: bool) -> Result<Fence> {
        self.fences.allocate(create_signaled)
    }

    #[inline(always)]
    pub fn wait_for_fence(&self, fence: &mut Fence, timeout_ns: u64) -> Result<bool> {
        self.fences.wait(fence, timeout_ns)
    }

    #[inline(always)]
    pub fn is_fence_signaled(&self, fence: &mut Fence) -> Result<bool> {
        self.fences.is_signaled(fence)
    }

    #[inline(always)]
    pub fn reset_fence(&self, fence: &mut Fence) -> Result<()> {
        self.fences.reset(fence)
    }

    #[inline(always)]
    pub fn release_fence(&self, fence: Fence) -> Result<()> {
        self.fences.release(fence)
    }

    /// Returns `Some(fence)` if it did not signal within the timeout.
    #[inline(always)]
    pub fn wait_and_release_fence(&self, fence: Fence, timeout_ns: u64) -> Result<Option<Fence>> {
        self.fences.wait_and_release(fence, timeout_ns)
    }

    pub fn temp_frame_alloc(&self, size: vk::DeviceSize, alignment: vk::DeviceSize) -> Result<TempAllocation> {
        self.check(self.temp_frames.alloc(size, alignment), false)
    }

    pub fn temp_frame_reset(&self) {
        self.temp_frames.reset(self.frame_number());
    }

    /// Advances the frame counter and runs the per frame reclamation passes.
    ///
    /// Returns the new frame number.
    pub fn begin_frame(&self) -> u64 {
        let frame = self.frame.fetch_add(1, Ordering::AcqRel) + 1;
        self.temp_frame_reset();
        self.process_pending_free(false, true);
        self.release_deferred_resources(false);
        self.release_freed_pages(false);
        frame
    }

    /// Returns idle pages and idle pooled buffers to the device.
    pub fn release_freed_pages(&self, immediately: bool) -> usize {
        let frame = self.frame_number();
        self.buffers.release_freed_resources(immediately, frame) +
            self.pages.release_freed_pages(immediately, frame)
    }

    /// Recycles staging buffers whose work completed and, with `free_to_os`, destroys
    /// idle ones.
    pub fn process_pending_free(&self, immediately: bool, free_to_os: bool) -> usize {
        let snapshot = self.submissions.snapshot();
        self.staging.process_pending_free(immediately, free_to_os, self.frame_number(), &snapshot)
    }

    pub fn release_deferred_resources(&self, immediately: bool) -> usize {
        let snapshot = self.submissions.snapshot();
        self.deletion.release_resources(immediately, self.frame_number(), &snapshot)
    }

    /// Where the submission layer publishes its command buffers.
    #[inline(always)]
    pub fn submissions(&self) -> &SubmissionTracker {
        &self.submissions
    }

    /// Forgets `cmd` and lets everything waiting on it go.
    pub fn on_command_buffer_retired(&self, cmd: CmdBufferId) {
        self.submissions.retire(cmd);
        self.staging.on_command_buffer_retired(cmd, self.frame_number());
        self.deletion.on_command_buffer_retired(cmd);
    }

    /// Publishes `cmd`'s fence signal once `fence` is signaled and resets the fence for
    /// the next submission. Returns whether it signaled.
    pub fn poll_submission(&self, cmd: CmdBufferId, fence: &mut Fence) -> Result<bool> {
        if !self.fences.is_signaled(fence)? {
            return Ok(false)
        }
        self.submissions.on_fence_signaled(cmd);
        self.fences.reset(fence)?;
        Ok(true)
    }

    #[inline(always)]
    pub fn flush_mapped_memory(&self, range: &MappedRange) -> Result<()> {
        self.memory.flush(range)
    }

    #[inline(always)]
    pub fn invalidate_mapped_memory(&self, range: &MappedRange) -> Result<()> {
        self.memory.invalidate(range)
    }

    pub fn report(&self) -> MemoryReport {
        MemoryReport {
            frame: self.frame_number(),
            heaps: self.memory.heap_stats(),
            live_allocations: self.memory.live_allocation_count(),
            peak_allocations: self.memory.peak_allocation_count(),
            max_allocations: self.memory.limits().max_memory_allocation_count,
            page_heaps: self.pages.report(),
            buckets: self.buffers.report(),
            staging: self.staging.report(),
            fences: self.fences.report(),
            pending_deletions: self.deletion.pending_count(),
            temp_frames: self.temp_frames.report(),
        }
    }

    pub fn dump_memory(&self) {
        info!("{}", self.report());
    }

    /// Flushes every queue and returns all memory to the device.
    ///
    /// The GPU must be idle. Later calls return an empty report.
    pub fn shutdown(&self) -> LeakReport {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return LeakReport::default()
        }
        let report = self.settings.debug.log_leaks_on_shutdown.then(|| self.report());
        let frame = self.frame_number();
        let mut leaks = LeakReport {
            flushed_deletions: self.release_deferred_resources(true),
            ..Default::default()
        };
        self.temp_frames.release_all(frame);
        self.process_pending_free(true, true);
        leaks.staging_buffers = self.staging.release_all(frame);
        leaks.buffers = self.buffers.release_all();
        leaks.pages = self.pages.release_all();
        leaks.fences = self.fences.destroy_free();
        if leaks.has_leaks() {
            if let Some(report) = report {
                warn!("leaks at shutdown: {}\n{}", leaks, report);
            }
        }
        leaks
    }
}

impl Drop for AllocatorContext {

    fn drop(&mut self) {
        self.shutdown();
    }
}

fn log_memory_layout(memory: &DeviceMemoryManager) {
    let properties = memory.memory_properties();
    for (i, heap) in properties.memory_heaps[..properties.memory_heap_count as usize].iter().enumerate() {
        info!("memory heap {}: {} MiB {:?}", i, heap.size >> 20, heap.flags);
    }
    for i in 0..memory.memory_type_count() {
        info!("memory type {}: heap {} {:?}", i, memory.heap_index(i), memory.memory_type_properties(i));
    }
    info!("max memory allocations: {}", memory.limits().max_memory_allocation_count);
}

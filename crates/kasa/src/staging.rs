use std::sync::Arc;

use core::ptr::NonNull;

use ash::vk;

use parking_lot::Mutex;

use kasa_log::{debug, warn};

use crate::{
    dev::{has_bits, align_up},
    device::RawDevice,
    error::{Error, Result},
    memory::{
        PageAllocator, ResourceAllocation, ResourceKind, MappedRange,
        buffer_pool::find_buffer_memory_type,
        device_memory::MappedPtr,
    },
    submission::{CmdBufferId, SubmissionSnapshot},
};

/// Minimum alignment of staging memory.
const STAGING_ALIGNMENT: vk::DeviceSize = 16;

/// A persistently mapped host buffer for uploads and readbacks.
#[derive(Debug)]
pub struct StagingBuffer {
    buffer: vk::Buffer,
    allocation: ResourceAllocation,
    ptr: MappedPtr,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    cpu_readable: bool,
}

impl StagingBuffer {

    #[inline(always)]
    pub fn buffer(&self) -> vk::Buffer {
        self.buffer
    }

    #[inline(always)]
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    #[inline(always)]
    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.usage
    }

    #[inline(always)]
    pub fn is_cpu_readable(&self) -> bool {
        self.cpu_readable
    }

    #[inline(always)]
    pub fn memory(&self) -> vk::DeviceMemory {
        self.allocation.memory()
    }

    #[inline(always)]
    pub fn mapped_ptr(&self) -> NonNull<u8> {
        self.ptr.get()
    }

    #[inline(always)]
    pub fn mapped_range(&self) -> MappedRange {
        self.allocation.mapped_range(0, self.size)
    }

    /// Copies `data` into the buffer at `offset`.
    ///
    /// # Safety
    /// The GPU must not be accessing the written range.
    ///
    /// # Panics
    /// If the write does not fit in the buffer.
    pub unsafe fn write(&self, offset: vk::DeviceSize, data: &[u8]) {
        assert!(offset + data.len() as vk::DeviceSize <= self.size, "staging write out of bounds");
        unsafe {
            self.ptr
                .offset(offset)
                .get()
                .as_ptr()
                .copy_from_nonoverlapping(data.as_ptr(), data.len());
        }
    }

    /// Copies `out.len()` bytes at `offset` out of the buffer.
    ///
    /// # Safety
    /// The GPU must not be writing the read range, and non-coherent memory must
    /// have been invalidated first.
    ///
    /// # Panics
    /// If the read does not fit in the buffer.
    pub unsafe fn read(&self, offset: vk::DeviceSize, out: &mut [u8]) {
        assert!(offset + out.len() as vk::DeviceSize <= self.size, "staging read out of bounds");
        unsafe {
            out.as_mut_ptr().copy_from_nonoverlapping(
                self.ptr.offset(offset).get().as_ptr(),
                out.len(),
            );
        }
    }
}

struct PendingStaging {
    cmd: CmdBufferId,
    fence_counter: u64,
    buffers: Vec<StagingBuffer>,
}

struct FreeStaging {
    buffer: StagingBuffer,
    frame: u64,
}

#[derive(Default)]
struct StagingState {
    used_buffers: usize,
    used_bytes: vk::DeviceSize,
    peak_bytes: vk::DeviceSize,
    pending: Vec<PendingStaging>,
    free: Vec<FreeStaging>,
    released_all: bool,
}

#[derive(Default, Clone, Copy, Debug)]
pub struct StagingReport {
    pub used_buffers: usize,
    pub used_bytes: vk::DeviceSize,
    pub peak_bytes: vk::DeviceSize,
    pub pending_buffers: usize,
    pub free_buffers: usize,
    pub free_bytes: vk::DeviceSize,
}

/// Recycles staging buffers once the GPU work using them completed.
pub struct StagingManager {
    pages: Arc<PageAllocator>,
    frames_before_release: u64,
    state: Mutex<StagingState>,
}

impl StagingManager {

    pub fn new(pages: Arc<PageAllocator>, frames_before_release: u64) -> Self {
        Self {
            pages,
            frames_before_release,
            state: Mutex::new(StagingState::default()),
        }
    }

    #[inline(always)]
    fn device(&self) -> &Arc<dyn RawDevice> {
        self.pages.memory().device()
    }

    /// Hands out a free buffer of exactly the requested size and readability, or
    /// creates one.
    pub fn acquire(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        cpu_readable: bool,
    ) -> Result<StagingBuffer>
    {
        if size == 0 {
            return Err(Error::ZeroSizeAlloc)
        }
        let atom = self.pages.memory().limits().non_coherent_atom_size;
        let size = if cpu_readable { align_up(size, atom) } else { size };
        {
            let mut state = self.state.lock();
            let reused = state.free
                .iter()
                .position(|free|
                    free.buffer.size == size &&
                    free.buffer.cpu_readable == cpu_readable &&
                    has_bits!(free.buffer.usage, usage)
                );
            if let Some(index) = reused {
                let free = state.free.swap_remove(index);
                state.track_acquire(size);
                return Ok(free.buffer)
            }
        }
        let buffer = self.create_buffer(size, usage, cpu_readable, atom)?;
        self.state.lock().track_acquire(size);
        Ok(buffer)
    }

    fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        cpu_readable: bool,
        atom: vk::DeviceSize,
    ) -> Result<StagingBuffer>
    {
        let device = self.device();
        let buffer = device.create_buffer(size, usage)?;
        let requirements = unsafe {
            device.buffer_memory_requirements(buffer)
        };
        let mut alignment = requirements.alignment.max(STAGING_ALIGNMENT);
        if cpu_readable {
            alignment = align_up(alignment, atom);
        }
        let properties = vk::MemoryPropertyFlags::HOST_VISIBLE | if cpu_readable {
            vk::MemoryPropertyFlags::HOST_CACHED
        } else {
            vk::MemoryPropertyFlags::HOST_COHERENT
        };
        let memory_type_index = find_buffer_memory_type(self.pages.memory(), requirements.memory_type_bits, properties)
            .or_else(|| self.pages.memory().find_memory_type_index(
                requirements.memory_type_bits,
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            ));
        let Some(memory_type_index) = memory_type_index else {
            unsafe { device.destroy_buffer(buffer); }
            return Err(Error::NoCompatibleMemoryType {
                type_bits: requirements.memory_type_bits,
                properties,
            })
        };
        let allocation = match self.pages.allocate_resource(
            ResourceKind::Buffer, memory_type_index, requirements.size, alignment, true, false,
        ) {
            Ok(allocation) => allocation,
            Err(err) => {
                unsafe { device.destroy_buffer(buffer); }
                return Err(err)
            },
        };
        let bound = unsafe {
            device.bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        };
        let ptr = match (bound, allocation.mapped_ptr()) {
            (Ok(()), Some(ptr)) => MappedPtr::new(ptr),
            (bound, _) => {
                unsafe { device.destroy_buffer(buffer); }
                self.pages.release(allocation, 0);
                return Err(bound.err().map(Error::from).unwrap_or(Error::UnmappableMemory(memory_type_index)))
            },
        };
        debug!("new staging buffer of {} bytes (readable {})", size, cpu_readable);
        Ok(StagingBuffer {
            buffer,
            allocation,
            ptr,
            size,
            usage,
            cpu_readable,
        })
    }

    /// Takes a buffer back.
    ///
    /// With a submission the buffer waits until that command buffer's fence moves past
    /// the given counter, otherwise it is free again right away.
    pub fn release(
        &self,
        buffer: StagingBuffer,
        submission: Option<(CmdBufferId, u64)>,
        frame: u64,
    ) {
        let mut state = self.state.lock();
        if state.released_all {
            drop(state);
            warn!("staging buffer {:?} released after shutdown", buffer.buffer);
            self.destroy_buffer(buffer, frame);
            return
        }
        state.used_buffers -= 1;
        state.used_bytes -= buffer.size;
        match submission {
            Some((cmd, fence_counter)) => {
                match state.pending
                    .iter_mut()
                    .find(|pending| pending.cmd == cmd && pending.fence_counter == fence_counter)
                {
                    Some(pending) => pending.buffers.push(buffer),
                    None => state.pending.push(PendingStaging {
                        cmd,
                        fence_counter,
                        buffers: vec![buffer],
                    }),
                }
            },
            None => state.free.push(FreeStaging { buffer, frame }),
        }
    }

    /// Moves buffers whose GPU work completed to the free pool and, with `free_to_os`,
    /// destroys free buffers that sat idle past the frame threshold.
    ///
    /// Buffers that became free during this call are only destroyed when `immediately`
    /// is set, in which case every pending and free buffer is destroyed. Returns the
    /// number of buffers destroyed.
    pub fn process_pending_free(
        &self,
        immediately: bool,
        free_to_os: bool,
        frame: u64,
        submissions: &SubmissionSnapshot,
    ) -> usize
    {
        let evicted = {
            let mut state = self.state.lock();
            let state = &mut *state;
            let previously_free = state.free.len();
            let mut i = 0;
            while i < state.pending.len() {
                let pending = &state.pending[i];
                if immediately || submissions.has_completed(pending.cmd, pending.fence_counter) {
                    let pending = state.pending.swap_remove(i);
                    state.free.extend(pending.buffers
                        .into_iter()
                        .map(|buffer| FreeStaging { buffer, frame })
                    );
                } else {
                    i += 1;
                }
            }
            if !free_to_os {
                return 0
            }
            let candidates = if immediately { state.free.len() } else { previously_free };
            let mut evicted = vec![];
            let mut i = 0;
            let mut remaining = candidates;
            while remaining > 0 {
                remaining -= 1;
                let free = &state.free[i];
                if immediately || free.frame + self.frames_before_release < frame {
                    evicted.push(state.free.remove(i).buffer);
                } else {
                    i += 1;
                }
            }
            evicted
        };
        let count = evicted.len();
        for buffer in evicted {
            self.destroy_buffer(buffer, frame);
        }
        count
    }

    /// Makes every buffer waiting on `cmd` free.
    pub fn on_command_buffer_retired(&self, cmd: CmdBufferId, frame: u64) {
        let mut state = self.state.lock();
        let state = &mut *state;
        let mut i = 0;
        while i < state.pending.len() {
            if state.pending[i].cmd == cmd {
                let pending = state.pending.swap_remove(i);
                state.free.extend(pending.buffers
                    .into_iter()
                    .map(|buffer| FreeStaging { buffer, frame })
                );
            } else {
                i += 1;
            }
        }
    }

    fn destroy_buffer(&self, buffer: StagingBuffer, frame: u64) {
        unsafe {
            self.device().destroy_buffer(buffer.buffer);
        }
        self.pages.release(buffer.allocation, frame);
    }

    pub fn report(&self) -> StagingReport {
        let state = self.state.lock();
        StagingReport {
            used_buffers: state.used_buffers,
            used_bytes: state.used_bytes,
            peak_bytes: state.peak_bytes,
            pending_buffers: state.pending.iter().map(|pending| pending.buffers.len()).sum(),
            free_buffers: state.free.len(),
            free_bytes: state.free.iter().map(|free| free.buffer.size).sum(),
        }
    }

    /// Destroys every pending and free buffer. Returns the number of buffers still
    /// acquired.
    pub fn release_all(&self, frame: u64) -> usize {
        let (buffers, used) = {
            let mut state = self.state.lock();
            let mut buffers: Vec<_> = state.pending
                .drain(..)
                .flat_map(|pending| pending.buffers)
                .collect();
            buffers.extend(state.free.drain(..).map(|free| free.buffer));
            state.released_all = true;
            (buffers, state.used_buffers)
        };
        for buffer in buffers {
            self.destroy_buffer(buffer, frame);
        }
        used
    }
}

impl StagingState {

    #[inline(always)]
    fn track_acquire(&mut self, size: vk::DeviceSize) {
        self.used_buffers += 1;
        self.used_bytes += size;
        self.peak_bytes = self.peak_bytes.max(self.used_bytes);
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    use crate::{
        device::HeadlessDevice,
        memory::DeviceMemoryManager,
        settings::{AllocatorSettings, DebugSettings},
        submission::SubmissionTracker,
    };

    fn staging() -> (Arc<HeadlessDevice>, StagingManager) {
        let device = Arc::new(HeadlessDevice::new());
        let memory = Arc::new(DeviceMemoryManager::new(device.clone(), DebugSettings::default()));
        let settings = AllocatorSettings::default()
            .with_host_visible_page_size(1 << 20)
            .with_frames_before_release(2);
        let pages = Arc::new(PageAllocator::new(memory, &settings));
        (device, StagingManager::new(pages, settings.frames_before_release))
    }

    #[test]
    fn released_buffers_are_reused_by_exact_size() {
        let (device, staging) = staging();
        let a = staging.acquire(1000, vk::BufferUsageFlags::TRANSFER_SRC, false).unwrap();
        let handle = a.buffer();
        assert_eq!(device.buffer_binding(handle).map(|(memory, _)| memory), Some(a.memory()));
        staging.release(a, None, 0);
        let other = staging.acquire(1001, vk::BufferUsageFlags::TRANSFER_SRC, false).unwrap();
        assert_ne!(other.buffer(), handle);
        let b = staging.acquire(1000, vk::BufferUsageFlags::TRANSFER_SRC, false).unwrap();
        assert_eq!(b.buffer(), handle);
        staging.release(b, None, 0);
        staging.release(other, None, 0);
        assert_eq!(staging.release_all(0), 0);
    }

    #[test]
    fn readable_buffers_round_to_the_atom_and_use_cached_memory() {
        let (device, staging) = staging();
        let readback = staging.acquire(100, vk::BufferUsageFlags::TRANSFER_DST, true).unwrap();
        assert_eq!(readback.size(), 128);
        assert!(readback.is_cpu_readable());
        assert_eq!(readback.allocation.memory_type_index(), 2);
        assert_eq!(readback.allocation.offset() % 64, 0);
        unsafe {
            readback.write(0, &[1, 2, 3]);
            let mut out = [0u8; 3];
            readback.read(0, &mut out);
            assert_eq!(out, [1, 2, 3]);
        }
        let upload = staging.acquire(128, vk::BufferUsageFlags::TRANSFER_DST, false).unwrap();
        assert_eq!(upload.allocation.memory_type_index(), 1);
        staging.release(readback, None, 0);
        staging.release(upload, None, 0);
        staging.release_all(0);
        assert_eq!(device.live_buffer_count(), 0);
    }

    #[test]
    fn pending_buffers_wait_for_their_fence() {
        let (_device, staging) = staging();
        let tracker = SubmissionTracker::new();
        let cmd = tracker.register();
        tracker.set_active(cmd);
        let buffer = staging.acquire(256, vk::BufferUsageFlags::TRANSFER_SRC, false).unwrap();
        staging.release(buffer, tracker.active(), 0);
        assert_eq!(staging.process_pending_free(false, true, 1, &tracker.snapshot()), 0);
        assert_eq!(staging.report().pending_buffers, 1);
        tracker.on_fence_signaled(cmd);
        assert_eq!(staging.process_pending_free(false, true, 1, &tracker.snapshot()), 0);
        let report = staging.report();
        assert_eq!(report.pending_buffers, 0);
        assert_eq!(report.free_buffers, 1);
    }

    #[test]
    fn idle_buffers_are_destroyed_after_the_threshold() {
        let (device, staging) = staging();
        let none = SubmissionSnapshot::default();
        let buffer = staging.acquire(256, vk::BufferUsageFlags::TRANSFER_SRC, false).unwrap();
        staging.release(buffer, None, 5);
        assert_eq!(staging.process_pending_free(false, true, 7, &none), 0);
        assert_eq!(staging.process_pending_free(false, false, 8, &none), 0);
        assert_eq!(staging.process_pending_free(false, true, 8, &none), 1);
        assert_eq!(device.live_buffer_count(), 0);
    }

    #[test]
    fn immediate_processing_frees_pending_buffers_without_their_fence() {
        let (_device, staging) = staging();
        let tracker = SubmissionTracker::new();
        let cmd = tracker.register();
        tracker.set_active(cmd);
        tracker.on_submitted(cmd);
        let buffer = staging.acquire(512, vk::BufferUsageFlags::TRANSFER_SRC, false).unwrap();
        let handle = buffer.buffer();
        staging.release(buffer, tracker.active(), 0);
        assert_eq!(staging.process_pending_free(true, false, 0, &tracker.snapshot()), 0);
        let report = staging.report();
        assert_eq!(report.pending_buffers, 0);
        assert_eq!(report.free_buffers, 1);
        let again = staging.acquire(512, vk::BufferUsageFlags::TRANSFER_SRC, false).unwrap();
        assert_eq!(again.buffer(), handle);
        staging.release(again, None, 0);
    }

    #[test]
    fn eviction_only_considers_buffers_that_were_already_free() {
        let (device, staging) = staging();
        let tracker = SubmissionTracker::new();
        let cmd = tracker.register();
        tracker.set_active(cmd);
        let old = staging.acquire(256, vk::BufferUsageFlags::TRANSFER_SRC, false).unwrap();
        let fresh = staging.acquire(256, vk::BufferUsageFlags::TRANSFER_SRC, false).unwrap();
        staging.release(old, None, 0);
        staging.release(fresh, tracker.active(), 0);
        tracker.on_fence_signaled(cmd);
        assert_eq!(staging.process_pending_free(false, true, 10, &tracker.snapshot()), 1);
        let report = staging.report();
        assert_eq!(report.pending_buffers, 0);
        assert_eq!(report.free_buffers, 1);
        assert_eq!(device.live_buffer_count(), 1);
        assert_eq!(staging.process_pending_free(true, true, 10, &tracker.snapshot()), 1);
        assert_eq!(device.live_buffer_count(), 0);
    }

    #[test]
    fn retirement_frees_pending_buffers() {
        let (_device, staging) = staging();
        let tracker = SubmissionTracker::new();
        let cmd = tracker.register();
        tracker.set_active(cmd);
        let buffer = staging.acquire(64, vk::BufferUsageFlags::TRANSFER_SRC, false).unwrap();
        let handle = buffer.buffer();
        staging.release(buffer, tracker.active(), 0);
        staging.on_command_buffer_retired(cmd, 0);
        let again = staging.acquire(64, vk::BufferUsageFlags::TRANSFER_SRC, false).unwrap();
        assert_eq!(again.buffer(), handle);
        staging.release(again, None, 0);
    }
}

//! Per frame bump allocation of transient vertex, index and uniform data.

use std::sync::Arc;

use core::ptr::NonNull;

use ash::vk;

use parking_lot::Mutex;

use kasa_log::debug;

use crate::{
    dev::align_up,
    error::{Error, Result},
    memory::{BufferPool, BufferSuballocation},
};

pub const NUM_TEMP_FRAME_BUFFERS: usize = 3;

const TEMP_FRAME_USAGE: vk::BufferUsageFlags = vk::BufferUsageFlags::from_raw(
    vk::BufferUsageFlags::VERTEX_BUFFER.as_raw() |
    vk::BufferUsageFlags::INDEX_BUFFER.as_raw() |
    vk::BufferUsageFlags::UNIFORM_BUFFER.as_raw() |
    vk::BufferUsageFlags::UNIFORM_TEXEL_BUFFER.as_raw()
);

const TEMP_FRAME_PROPERTIES: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::from_raw(
    vk::MemoryPropertyFlags::HOST_VISIBLE.as_raw() |
    vk::MemoryPropertyFlags::HOST_COHERENT.as_raw()
);

/// Memory valid until the ring comes back around to the current slot.
#[derive(Clone, Copy, Debug)]
pub struct TempAllocation {
    pub ptr: NonNull<u8>,
    pub buffer: vk::Buffer,
    /// Offset to bind `buffer` at.
    pub bind_offset: vk::DeviceSize,
    /// Offset inside the slot's tape.
    pub offset: vk::DeviceSize,
    pub size: vk::DeviceSize,
}

impl TempAllocation {

    /// # Safety
    /// The allocation must belong to the current frame.
    ///
    /// # Panics
    /// If `data` is larger than the allocation.
    pub unsafe fn write(&self, data: &[u8]) {
        assert!(data.len() as vk::DeviceSize <= self.size, "temp frame write out of bounds");
        unsafe {
            self.ptr.as_ptr().copy_from_nonoverlapping(data.as_ptr(), data.len());
        }
    }
}

struct TempFrameEntry {
    tape: Option<BufferSuballocation>,
    /// Requested tape size. Binning may have rounded the suballocation up.
    capacity: vk::DeviceSize,
    cursor: vk::DeviceSize,
    peak: vk::DeviceSize,
    pending: Vec<BufferSuballocation>,
}

impl TempFrameEntry {

    fn try_alloc(&mut self, size: vk::DeviceSize, alignment: vk::DeviceSize) -> Option<TempAllocation> {
        let tape = self.tape.as_ref()?;
        let base = tape.offset();
        let offset = align_up(base + self.cursor, alignment) - base;
        if offset + size > self.capacity {
            return None
        }
        let ptr = tape.mapped_ptr()?;
        self.cursor = offset + size;
        self.peak = self.peak.max(self.cursor);
        Some(TempAllocation {
            ptr: unsafe { ptr.add(offset as usize) },
            buffer: tape.buffer(),
            bind_offset: base + offset,
            offset,
            size,
        })
    }
}

struct TempFrameState {
    current: usize,
    entries: [TempFrameEntry; NUM_TEMP_FRAME_BUFFERS],
}

#[derive(Default, Clone, Copy, Debug)]
pub struct TempFrameReport {
    pub capacity: vk::DeviceSize,
    pub used: vk::DeviceSize,
    pub peak: vk::DeviceSize,
    pub parked: usize,
}

pub struct TempFrameRing {
    pool: Arc<BufferPool>,
    tape_size: vk::DeviceSize,
    state: Mutex<TempFrameState>,
}

impl TempFrameRing {

    /// Creates one tape of `tape_size` bytes per slot.
    pub fn new(pool: Arc<BufferPool>, tape_size: vk::DeviceSize) -> Result<Self> {
        let mut tapes = Vec::with_capacity(NUM_TEMP_FRAME_BUFFERS);
        for _ in 0..NUM_TEMP_FRAME_BUFFERS {
            match Self::create_tape(&pool, tape_size) {
                Ok(tape) => tapes.push(tape),
                Err(err) => {
                    for tape in tapes {
                        pool.release(tape, 0);
                    }
                    return Err(err)
                },
            }
        }
        let mut tapes = tapes.into_iter();
        let entries = core::array::from_fn(|_| TempFrameEntry {
            tape: tapes.next(),
            capacity: tape_size,
            cursor: 0,
            peak: 0,
            pending: vec![],
        });
        Ok(Self {
            pool,
            tape_size,
            state: Mutex::new(TempFrameState {
                current: 0,
                entries,
            }),
        })
    }

    fn create_tape(pool: &BufferPool, size: vk::DeviceSize) -> Result<BufferSuballocation> {
        let tape = pool.allocate(size, TEMP_FRAME_USAGE, TEMP_FRAME_PROPERTIES)?;
        if tape.mapped_ptr().is_none() {
            pool.release(tape, 0);
            return Err(Error::NoCompatibleMemoryType {
                type_bits: 0,
                properties: TEMP_FRAME_PROPERTIES,
            })
        }
        Ok(tape)
    }

    #[inline(always)]
    pub fn current_slot(&self) -> usize {
        self.state.lock().current
    }

    /// Bumps `size` bytes aligned to `alignment` off the current slot's tape.
    ///
    /// A full tape is parked until the slot comes around again and replaced with a
    /// larger one.
    pub fn alloc(&self, size: vk::DeviceSize, alignment: vk::DeviceSize) -> Result<TempAllocation> {
        if size == 0 {
            return Err(Error::ZeroSizeAlloc)
        }
        let alignment = alignment.max(1);
        loop {
            let (slot, capacity) = {
                let mut state = self.state.lock();
                let current = state.current;
                let entry = &mut state.entries[current];
                if let Some(allocation) = entry.try_alloc(size, alignment) {
                    return Ok(allocation)
                }
                (current, entry.capacity)
            };
            let new_size = align_up(capacity.max(self.tape_size) + size + alignment, self.tape_size);
            debug!("temp frame slot {} full, growing tape to {} bytes", slot, new_size);
            let tape = Self::create_tape(&self.pool, new_size)?;
            let mut state = self.state.lock();
            let entry = &mut state.entries[slot];
            if entry.capacity != capacity {
                // grown by another thread in the meantime
                drop(state);
                self.pool.release(tape, 0);
                continue
            }
            if let Some(old) = entry.tape.replace(tape) {
                entry.pending.push(old);
            }
            entry.capacity = new_size;
            entry.cursor = 0;
        }
    }

    /// Moves to the next slot and rewinds it, releasing the tapes parked there.
    pub fn reset(&self, frame: u64) {
        let parked = {
            let mut state = self.state.lock();
            state.current = (state.current + 1) % NUM_TEMP_FRAME_BUFFERS;
            let current = state.current;
            let entry = &mut state.entries[current];
            entry.cursor = 0;
            core::mem::take(&mut entry.pending)
        };
        for tape in parked {
            self.pool.release(tape, frame);
        }
    }

    pub fn report(&self) -> [TempFrameReport; NUM_TEMP_FRAME_BUFFERS] {
        let state = self.state.lock();
        core::array::from_fn(|i| {
            let entry = &state.entries[i];
            TempFrameReport {
                capacity: if entry.tape.is_some() { entry.capacity } else { 0 },
                used: entry.cursor,
                peak: entry.peak,
                parked: entry.pending.len(),
            }
        })
    }

    /// Returns every tape to the buffer pool.
    pub fn release_all(&self, frame: u64) {
        let mut tapes = vec![];
        {
            let mut state = self.state.lock();
            for entry in &mut state.entries {
                entry.cursor = 0;
                tapes.extend(entry.tape.take());
                tapes.append(&mut entry.pending);
            }
        }
        for tape in tapes {
            self.pool.release(tape, frame);
        }
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    use crate::{
        device::HeadlessDevice,
        memory::DeviceMemoryManager,
        settings::{AllocatorSettings, DebugSettings},
    };

    const TAPE: vk::DeviceSize = 4096;

    fn ring() -> (Arc<BufferPool>, TempFrameRing) {
        let device = Arc::new(HeadlessDevice::new());
        let memory = Arc::new(DeviceMemoryManager::new(device, DebugSettings::default()));
        let settings = AllocatorSettings::default()
            .with_buffer_buckets(&[], 1024);
        let pool = Arc::new(BufferPool::new(memory, &settings));
        let ring = TempFrameRing::new(pool.clone(), TAPE).unwrap();
        (pool, ring)
    }

    #[test]
    fn allocations_bump_with_alignment() {
        let (_pool, ring) = ring();
        let a = ring.alloc(10, 1).unwrap();
        let b = ring.alloc(16, 64).unwrap();
        assert_eq!(a.offset, 0);
        assert_eq!(b.buffer, a.buffer);
        assert_eq!(b.bind_offset % 64, 0);
        assert!(b.offset >= 10);
        unsafe {
            b.write(&[9; 16]);
            assert_eq!(b.ptr.as_ptr().read(), 9);
        }
        assert_eq!(ring.report()[0].used, b.offset + 16);
    }

    #[test]
    fn full_tapes_are_parked_until_their_slot_returns() {
        let (pool, ring) = ring();
        let first = ring.alloc(TAPE - 128, 1).unwrap();
        let grown = ring.alloc(1024, 256).unwrap();
        assert_ne!(grown.buffer, first.buffer);
        assert_eq!(grown.offset, 0);
        let report = ring.report()[0];
        assert_eq!(report.capacity, align_up(TAPE + 1024 + 256, TAPE));
        assert_eq!(report.parked, 1);
        let live = pool.report().iter().map(|bucket| bucket.live_suballocations).sum::<usize>();
        assert_eq!(live, NUM_TEMP_FRAME_BUFFERS + 1);
        for frame in 1..NUM_TEMP_FRAME_BUFFERS as u64 {
            ring.reset(frame);
            assert_eq!(ring.report()[0].parked, 1);
        }
        ring.reset(3);
        assert_eq!(ring.current_slot(), 0);
        assert_eq!(ring.report()[0].parked, 0);
        assert_eq!(ring.report()[0].used, 0);
        let live = pool.report().iter().map(|bucket| bucket.live_suballocations).sum::<usize>();
        assert_eq!(live, NUM_TEMP_FRAME_BUFFERS);
    }

    #[test]
    fn grown_tapes_grow_again_from_their_own_size() {
        let (_pool, ring) = ring();
        ring.alloc(4000, 1).unwrap();
        ring.alloc(200, 1).unwrap();
        let grown = ring.report()[0].capacity;
        assert_eq!(grown, 2 * TAPE);
        ring.alloc(grown - 300, 1).unwrap();
        let last = ring.alloc(200, 16).unwrap();
        let report = ring.report()[0];
        assert!(report.capacity > grown);
        assert_eq!(report.capacity, align_up(grown + 200 + 16, TAPE));
        assert_eq!(report.parked, 2);
        assert_eq!(last.offset, 0);
    }

    #[test]
    fn each_slot_has_its_own_tape() {
        let (_pool, ring) = ring();
        let a = ring.alloc(64, 16).unwrap();
        ring.reset(1);
        let b = ring.alloc(64, 16).unwrap();
        assert_ne!((a.buffer, a.bind_offset), (b.buffer, b.bind_offset));
        assert_eq!(b.offset, 0);
        ring.release_all(2);
        assert!(ring.report().iter().all(|report| report.capacity == 0));
    }
}

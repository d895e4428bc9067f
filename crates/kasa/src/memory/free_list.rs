use ash::vk;

use crate::dev::align_up;

/// A free byte range.
#[derive(Default, Clone, Copy, PartialEq, Eq, Debug)]
pub struct Range {
    pub offset: vk::DeviceSize,
    pub size: vk::DeviceSize,
}

impl Range {

    #[inline(always)]
    fn new(offset: vk::DeviceSize, size: vk::DeviceSize) -> Self {
        Self {
            offset,
            size,
        }
    }

    #[inline(always)]
    pub fn end(&self) -> vk::DeviceSize {
        self.offset + self.size
    }
}

/// Result of carving a request out of a [`FreeList`].
///
/// Alignment padding belongs to the allocation, so `allocation_offset` and
/// `allocation_size` are what goes back on release.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Carve {
    pub offset: vk::DeviceSize,
    pub size: vk::DeviceSize,
    pub allocation_offset: vk::DeviceSize,
    pub allocation_size: vk::DeviceSize,
}

/// Address-sorted first-fit free list over `capacity` bytes.
///
/// Adjacent free ranges are always merged, so a list with no live
/// allocations is exactly one range spanning the whole capacity.
#[derive(Debug)]
pub struct FreeList {
    capacity: vk::DeviceSize,
    ranges: Vec<Range>,
    used: vk::DeviceSize,
    live: usize,
}

impl FreeList {

    pub fn new(capacity: vk::DeviceSize) -> Self {
        let mut ranges = Vec::with_capacity(4);
        if capacity > 0 {
            ranges.push(Range::new(0, capacity));
        }
        Self {
            capacity,
            ranges,
            used: 0,
            live: 0,
        }
    }

    pub fn try_allocate(&mut self, size: vk::DeviceSize, alignment: vk::DeviceSize) -> Option<Carve> {
        if size == 0 {
            return None
        }
        for i in 0..self.ranges.len() {
            let range = &mut self.ranges[i];
            let aligned_offset = align_up(range.offset, alignment);
            let padding = aligned_offset - range.offset;
            let total = padding + size;
            if total <= range.size {
                let allocation_offset = range.offset;
                let remaining = range.size - total;
                if remaining > 0 {
                    range.offset = aligned_offset + size;
                    range.size = remaining;
                }
                else {
                    self.ranges.remove(i);
                }
                self.used += total;
                self.live += 1;
                return Some(Carve {
                    offset: aligned_offset,
                    size,
                    allocation_offset,
                    allocation_size: total,
                })
            }
        }
        None
    }

    /// Returns a carved range and merges it with its neighbours.
    ///
    /// # Panics
    /// If the range overlaps a free range or lies outside the capacity, which means it was
    /// released twice or never carved from this list.
    pub fn release(&mut self, allocation_offset: vk::DeviceSize, allocation_size: vk::DeviceSize) {
        let end = allocation_offset + allocation_size;
        assert!(
            allocation_size > 0 && end <= self.capacity && self.live > 0,
            "double free of range {allocation_offset}..{end} (capacity {})", self.capacity,
        );
        let mut i = self.ranges.partition_point(|range| range.offset < allocation_offset);
        if i > 0 {
            assert!(self.ranges[i - 1].end() <= allocation_offset,
                "double free of range {allocation_offset}..{end}");
        }
        if i < self.ranges.len() {
            assert!(end <= self.ranges[i].offset,
                "double free of range {allocation_offset}..{end}");
        }
        let mut new_offset = allocation_offset;
        let mut new_size = allocation_size;
        // merge previous
        if i > 0 {
            let prev = self.ranges[i - 1];
            if prev.end() == allocation_offset {
                new_offset = prev.offset;
                new_size += prev.size;
                self.ranges.remove(i - 1);
                i -= 1;
            }
        }
        // merge next
        if i < self.ranges.len() {
            let next = self.ranges[i];
            if next.offset == end {
                new_size += next.size;
                self.ranges.remove(i);
            }
        }
        self.ranges.insert(i, Range::new(new_offset, new_size));
        self.used -= allocation_size;
        self.live -= 1;
    }

    #[inline(always)]
    pub fn release_carve(&mut self, carve: &Carve) {
        self.release(carve.allocation_offset, carve.allocation_size)
    }

    #[inline(always)]
    pub fn capacity(&self) -> vk::DeviceSize {
        self.capacity
    }

    #[inline(always)]
    pub fn used(&self) -> vk::DeviceSize {
        self.used
    }

    #[inline(always)]
    pub fn free(&self) -> vk::DeviceSize {
        self.capacity - self.used
    }

    #[inline(always)]
    pub fn live_count(&self) -> usize {
        self.live
    }

    #[inline(always)]
    pub fn ranges(&self) -> &[Range] {
        &self.ranges
    }

    pub fn largest_free(&self) -> vk::DeviceSize {
        self.ranges
            .iter()
            .map(|range| range.size)
            .max()
            .unwrap_or(0)
    }

    /// Whether the list collapsed back into a single range spanning the capacity.
    #[inline(always)]
    pub fn is_fully_free(&self) -> bool {
        self.live == 0 &&
        self.ranges.len() == 1 &&
        self.ranges[0] == Range::new(0, self.capacity)
    }

    /// Checks ordering, disjointness, merging and byte accounting.
    pub fn validate(&self) -> bool {
        let mut free = 0;
        for (i, range) in self.ranges.iter().enumerate() {
            if range.size == 0 || range.end() > self.capacity {
                return false
            }
            if i > 0 && self.ranges[i - 1].end() >= range.offset {
                return false
            }
            free += range.size;
        }
        free + self.used == self.capacity
    }
}

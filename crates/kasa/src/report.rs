use core::fmt::{self, Display};

use ash::vk;

use crate::{
    fence::FenceReport,
    memory::{
        HeapStatistics,
        heap::{ResourceHeapReport, PageLeaks},
        buffer_pool::{BucketReport, BufferLeaks},
    },
    staging::StagingReport,
    temp_frame::{TempFrameReport, NUM_TEMP_FRAME_BUFFERS},
};

const MIB: f64 = (1 << 20) as f64;

#[inline(always)]
fn mib(bytes: vk::DeviceSize) -> f64 {
    bytes as f64 / MIB
}

#[inline(always)]
fn percent(used: vk::DeviceSize, total: vk::DeviceSize) -> f64 {
    if total == 0 {
        return 0.0
    }
    used as f64 * 100.0 / total as f64
}

/// State of every pool at one point in time.
#[derive(Clone, Debug)]
pub struct MemoryReport {
    pub frame: u64,
    pub heaps: Vec<HeapStatistics>,
    pub live_allocations: u32,
    pub peak_allocations: u32,
    pub max_allocations: u32,
    pub page_heaps: Vec<ResourceHeapReport>,
    pub buckets: Vec<BucketReport>,
    pub staging: StagingReport,
    pub fences: FenceReport,
    pub pending_deletions: usize,
    pub temp_frames: [TempFrameReport; NUM_TEMP_FRAME_BUFFERS],
}

impl Display for MemoryReport {

    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "memory report at frame {}", self.frame)?;
        writeln!(f, "  raw allocations: {} live, {} peak, {} max",
            self.live_allocations, self.peak_allocations, self.max_allocations)?;
        for heap in &self.heaps {
            writeln!(f, "  heap {}{}: {:.2}/{:.2} MiB used ({:.1}%, peak {:.2}, budget {:.2}) in {} allocations",
                heap.heap_index,
                if heap.device_local { " (device local)" } else { "" },
                mib(heap.used), mib(heap.size), percent(heap.used, heap.size),
                mib(heap.peak), mib(heap.budget), heap.allocation_count,
            )?;
        }
        for heap in &self.page_heaps {
            writeln!(f, "  memory type {}: {:.2}/{:.2} MiB ({:.1}%) in {} image pages, {} buffer pages, {} idle, {} dedicated (peak {} pages)",
                heap.memory_type_index,
                mib(heap.used_bytes()), mib(heap.total_bytes()),
                percent(heap.used_bytes(), heap.total_bytes()),
                heap.used_image_pages.len(), heap.used_buffer_pages.len(),
                heap.free_pages, heap.dedicated_allocations, heap.peak_page_count,
            )?;
            for page in heap.used_image_pages.iter().chain(&heap.used_buffer_pages) {
                writeln!(f, "    page {:.2} MiB: {:.2} MiB ({:.1}%) in {} allocations, {} free ranges, largest {:.2} MiB{}",
                    mib(page.size), mib(page.used), percent(page.used, page.size), page.live_allocations,
                    page.free_ranges, mib(page.largest_free),
                    if page.mapped { ", mapped" } else { "" },
                )?;
            }
        }
        for bucket in &self.buckets {
            if bucket.used_buffers + bucket.free_buffers == 0 {
                continue
            }
            match bucket.size {
                Some(size) => write!(f, "  bucket {size}")?,
                None => write!(f, "  large bucket")?,
            }
            writeln!(f, ": {} buffers ({} idle), {} suballocations, {:.2}/{:.2} MiB ({:.1}%)",
                bucket.used_buffers + bucket.free_buffers, bucket.free_buffers,
                bucket.live_suballocations, mib(bucket.used_bytes), mib(bucket.total_bytes),
                percent(bucket.used_bytes, bucket.total_bytes),
            )?;
        }
        writeln!(f, "  staging: {} buffers in use ({:.2} MiB, peak {:.2}), {} pending, {} free ({:.2} MiB)",
            self.staging.used_buffers, mib(self.staging.used_bytes), mib(self.staging.peak_bytes),
            self.staging.pending_buffers, self.staging.free_buffers, mib(self.staging.free_bytes),
        )?;
        writeln!(f, "  fences: {} in use, {} free", self.fences.used, self.fences.free)?;
        writeln!(f, "  pending deletions: {}", self.pending_deletions)?;
        for (i, temp) in self.temp_frames.iter().enumerate() {
            writeln!(f, "  temp frame {}: {}/{} bytes ({:.1}%, peak {}), {} parked",
                i, temp.used, temp.capacity, percent(temp.used, temp.capacity), temp.peak, temp.parked)?;
        }
        Ok(())
    }
}

/// What was still alive when the context shut down.
#[derive(Default, Clone, Copy, Debug)]
pub struct LeakReport {
    pub pages: PageLeaks,
    pub buffers: BufferLeaks,
    pub staging_buffers: usize,
    pub fences: usize,
    /// Deferred deletions that were still waiting and got flushed.
    pub flushed_deletions: usize,
}

impl LeakReport {

    pub fn has_leaks(&self) -> bool {
        self.pages.allocations != 0 ||
        self.buffers.suballocations != 0 ||
        self.staging_buffers != 0 ||
        self.fences != 0
    }
}

impl Display for LeakReport {

    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.has_leaks() {
            return write!(f, "no leaks")
        }
        write!(f,
            "{} page allocations ({} bytes in {} pages), {} buffer suballocations ({} bytes in {} buffers), {} staging buffers, {} fences",
            self.pages.allocations, self.pages.bytes, self.pages.pages,
            self.buffers.suballocations, self.buffers.bytes, self.buffers.buffers,
            self.staging_buffers, self.fences,
        )
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn utilization_is_a_percentage_of_the_total() {
        assert_eq!(percent(0, 0), 0.0);
        assert_eq!(percent(256, 1024), 25.0);
        assert_eq!(format!("{:.1}%", percent(1, 3)), "33.3%");
    }

    #[test]
    fn leak_report_summarizes() {
        let mut leaks = LeakReport::default();
        assert!(!leaks.has_leaks());
        assert_eq!(leaks.to_string(), "no leaks");
        leaks.fences = 2;
        leaks.flushed_deletions = 5;
        assert!(leaks.has_leaks());
        assert!(leaks.to_string().ends_with("0 staging buffers, 2 fences"));
    }
}

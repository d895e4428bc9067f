pub mod arena;
pub mod free_list;
pub mod device_memory;
pub mod heap;
pub mod buffer_pool;

pub use arena::{Arena, SlotIndex};
pub use free_list::{FreeList, Range, Carve};
pub use device_memory::{DeviceMemoryManager, DeviceMemoryAllocation, HeapStatistics, MappedRange};
pub use heap::{PageAllocator, ResourceAllocation, ResourceKind};
pub use buffer_pool::{BufferPool, BufferSuballocation};

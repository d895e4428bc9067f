#[macro_use]

mod dev;

pub mod device;
pub mod memory;
pub mod fence;
pub mod staging;
pub mod deletion;
pub mod temp_frame;
pub mod submission;
pub mod report;

mod context;
mod error;
mod settings;

pub use ash::vk;
pub use kasa_log as log;

pub use error::{Error, Result};
pub use settings::*;
pub use context::AllocatorContext;
pub use device::{
    RawDevice, AshDevice, HeadlessDevice, HeadlessImage,
    DeviceLimits, ImageRequirements, DedicatedTarget, ObjectKind, DeletableObject,
};
pub use memory::{ResourceAllocation, BufferSuballocation, MappedRange, HeapStatistics};
pub use fence::{Fence, FenceState};
pub use staging::StagingBuffer;
pub use submission::{CmdBufferId, SubmissionTracker, SubmissionSnapshot};
pub use temp_frame::{TempAllocation, NUM_TEMP_FRAME_BUFFERS};
pub use report::{MemoryReport, LeakReport};

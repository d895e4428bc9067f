use ash::vk;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("out of device memory allocating {size} bytes from memory type {memory_type_index}")]
    OutOfDeviceMemory {
        size: vk::DeviceSize,
        memory_type_index: u32,
    },
    #[error("out of host memory allocating {size} bytes from memory type {memory_type_index}")]
    OutOfHostMemory {
        size: vk::DeviceSize,
        memory_type_index: u32,
    },
    #[error("no memory type in {type_bits:#b} has properties {properties:?}")]
    NoCompatibleMemoryType {
        type_bits: u32,
        properties: vk::MemoryPropertyFlags,
    },
    #[error("zero size allocation")]
    ZeroSizeAlloc,
    #[error("memory type {0} is not host visible")]
    UnmappableMemory(u32),
    #[error("vulkan error {0}")]
    Vulkan(#[from] vk::Result),
}

pub type Result<T> = core::result::Result<T, Error>;

impl Error {

    /// Maps a failed raw allocation to the matching out of memory error.
    pub(crate) fn allocation(result: vk::Result, size: vk::DeviceSize, memory_type_index: u32) -> Self {
        match result {
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => Self::OutOfDeviceMemory { size, memory_type_index },
            vk::Result::ERROR_OUT_OF_HOST_MEMORY => Self::OutOfHostMemory { size, memory_type_index },
            other => Self::Vulkan(other),
        }
    }

    #[inline(always)]
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, Self::OutOfDeviceMemory { .. } | Self::OutOfHostMemory { .. })
    }
}

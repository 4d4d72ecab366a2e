use kernel_alloc::{ArenaError, OutOfMemory};
use kernel_memory_addresses::VirtualAddress;
use kernel_vmem::PagemapError;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum VmError {
    #[error("out of memory")]
    OutOfMemory,
    #[error("no mapping at the given address")]
    NotFound,
    #[error("intermediate page table level missing")]
    NotADirectory,
    #[error("operation not implemented")]
    NotImplemented,
    #[error("invalid parameters: {0}")]
    InvalidParameters(&'static str),
    #[error("unresolved access at {0}")]
    AccessViolation(VirtualAddress),
}

impl From<OutOfMemory> for VmError {
    fn from(_: OutOfMemory) -> Self {
        Self::OutOfMemory
    }
}

impl From<PagemapError> for VmError {
    fn from(e: PagemapError) -> Self {
        match e {
            PagemapError::OutOfMemory => Self::OutOfMemory,
            PagemapError::NotADirectory => Self::NotADirectory,
            PagemapError::NotFound => Self::NotFound,
            PagemapError::NotImplemented => Self::NotImplemented,
            PagemapError::InvalidParameters(why) => Self::InvalidParameters(why),
        }
    }
}

impl From<ArenaError> for VmError {
    fn from(e: ArenaError) -> Self {
        match e {
            ArenaError::OutOfMemory => Self::OutOfMemory,
            ArenaError::NotFound => Self::NotFound,
            ArenaError::InvalidParameters(why) => Self::InvalidParameters(why),
        }
    }
}

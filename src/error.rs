//! Error types for the kernel core
//!
//! User programs never see these: handlers collapse them to the `-1`
//! sentinel in the result register, and the paging path turns them into
//! a machine halt.

use alloc::string::String;
use thiserror::Error;

use crate::machine::ExceptionType;
use crate::types::{FrameNumber, VirtAddr};

/// Physical frame bookkeeping failures
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("no free physical frames")]
    Exhausted,

    #[error("frame {0} is outside the arena")]
    OutOfRange(FrameNumber),

    #[error("frame {0} is not allocated")]
    NotAllocated(FrameNumber),
}

/// Failures translating or touching a user virtual address
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum MemoryError {
    #[error("page for address {vaddr:#x} is not mapped")]
    NotMapped { vaddr: VirtAddr },

    #[error("address {vaddr:#x} is beyond the page table")]
    AddressOutOfRange { vaddr: VirtAddr },

    #[error("write to read-only page at {vaddr:#x}")]
    ReadOnly { vaddr: VirtAddr },

    #[error("misaligned access at {vaddr:#x}")]
    Misaligned { vaddr: VirtAddr },

    #[error("physical frame {frame} does not exist")]
    BusError { frame: FrameNumber },
}

impl MemoryError {
    /// CPU exception this failure raises when it happens in user mode
    pub fn exception(&self) -> ExceptionType {
        match self {
            Self::NotMapped { .. } => ExceptionType::PageFault,
            Self::AddressOutOfRange { .. } | Self::Misaligned { .. } => ExceptionType::AddressError,
            Self::ReadOnly { .. } => ExceptionType::ReadOnly,
            Self::BusError { .. } => ExceptionType::BusError,
        }
    }

    /// Faulting virtual address, when there is one
    pub fn vaddr(&self) -> Option<VirtAddr> {
        match *self {
            Self::NotMapped { vaddr }
            | Self::AddressOutOfRange { vaddr }
            | Self::ReadOnly { vaddr }
            | Self::Misaligned { vaddr } => Some(vaddr),
            Self::BusError { .. } => None,
        }
    }
}

/// Reasons the page-fault handler could not populate a page
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum FaultError {
    #[error("fault at {vaddr:#x} is outside the address space")]
    OutOfRange { vaddr: VirtAddr },

    #[error(transparent)]
    Frames(#[from] FrameError),
}

/// User/kernel copy failures
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum CopyError {
    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    Fault(#[from] FaultError),

    #[error("bad length {0}")]
    BadLength(i32),

    #[error("no user address space is active")]
    NoAddressSpace,
}

/// Exec and fork failures
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SpawnError {
    #[error("no program named {0:?}")]
    NoSuchProgram(String),

    #[error("process table is full")]
    ProcessTableFull,

    #[error("no thread is running")]
    NoCurrentThread,

    #[error(transparent)]
    Frames(#[from] FrameError),
}

/// Invalid kernel configuration
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("page size {0} must be a power of two of at least one instruction")]
    PageSize(usize),

    #[error("physical memory needs at least one frame")]
    NoFrames,

    #[error("timer interval must be non-zero")]
    TimerInterval,

    #[error("process table needs at least one slot")]
    NoProcessSlots,

    #[error("page size {config} does not match the machine's frame size {machine}")]
    PageSizeMismatch { config: usize, machine: usize },
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn test_memory_error_maps_to_exception() {
        assert_eq!(
            MemoryError::NotMapped { vaddr: 0x80 }.exception(),
            ExceptionType::PageFault
        );
        assert_eq!(
            MemoryError::Misaligned { vaddr: 3 }.exception(),
            ExceptionType::AddressError
        );
        assert_eq!(
            MemoryError::BusError { frame: FrameNumber(9) }.exception(),
            ExceptionType::BusError
        );
        assert_eq!(MemoryError::BusError { frame: FrameNumber(9) }.vaddr(), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(FrameError::Exhausted.to_string(), "no free physical frames");
        assert_eq!(
            FaultError::from(FrameError::NotAllocated(FrameNumber(3))).to_string(),
            "frame 3 is not allocated"
        );
        assert_eq!(
            SpawnError::NoSuchProgram("add".to_string()).to_string(),
            "no program named \"add\""
        );
    }
}

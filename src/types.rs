//! Common types used across coopkern
//!
//! This module defines shared identifiers to avoid circular dependencies
//! between the scheduler, the virtual memory layer and the dispatcher.

use core::fmt;

/// Thread identifier, the stable key into the thread arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ThreadId(pub u64);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

/// User-visible process identifier, as returned by Exec and GetPid
///
/// Kept as `i32` because it crosses the trap ABI in a register and
/// negative values are the failure sentinel there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ProcessId(pub i32);

impl ProcessId {
    /// Pid of the first program started at boot
    pub const INIT: ProcessId = ProcessId(0);
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Index of a physical frame in the frame arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct FrameNumber(pub usize);

impl fmt::Display for FrameNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// User virtual address
pub type VirtAddr = u32;

/// Raw machine word as seen in a register
pub type Word = i32;

//! Physical memory and frame allocation
//!
//! Physical memory is a fixed arena of equally sized frames, addressed by
//! (frame index, offset) only. The allocator tracks which frames back a
//! live mapping with one bit per frame.

use alloc::vec;
use alloc::vec::Vec;
use bitvec::prelude::*;
use core::ops::Range;

use crate::error::{FrameError, MemoryError};
use crate::types::FrameNumber;

// ============================================================================
// Physical Memory
// ============================================================================

#[derive(Debug, Clone)]
pub struct PhysicalMemory {
    bytes: Vec<u8>,
    page_size: usize,
}

impl PhysicalMemory {
    pub fn new(num_frames: usize, page_size: usize) -> Self {
        Self {
            bytes: vec![0; num_frames * page_size],
            page_size,
        }
    }

    pub fn num_frames(&self) -> usize {
        self.bytes.len() / self.page_size
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    fn span(&self, frame: FrameNumber) -> Result<Range<usize>, MemoryError> {
        if frame.0 >= self.num_frames() {
            return Err(MemoryError::BusError { frame });
        }
        let start = frame.0 * self.page_size;
        Ok(start..start + self.page_size)
    }

    pub fn frame(&self, frame: FrameNumber) -> Result<&[u8], MemoryError> {
        let span = self.span(frame)?;
        Ok(&self.bytes[span])
    }

    pub fn frame_mut(&mut self, frame: FrameNumber) -> Result<&mut [u8], MemoryError> {
        let span = self.span(frame)?;
        Ok(&mut self.bytes[span])
    }

    pub fn zero_frame(&mut self, frame: FrameNumber) -> Result<(), MemoryError> {
        self.frame_mut(frame)?.fill(0);
        Ok(())
    }

    /// Copy the whole of `src` over `dst`
    pub fn copy_frame(&mut self, src: FrameNumber, dst: FrameNumber) -> Result<(), MemoryError> {
        let from = self.span(src)?;
        let to = self.span(dst)?;
        self.bytes.copy_within(from, to.start);
        Ok(())
    }

    pub fn read_byte(&self, frame: FrameNumber, offset: usize) -> Result<u8, MemoryError> {
        self.frame(frame)?
            .get(offset)
            .copied()
            .ok_or(MemoryError::BusError { frame })
    }

    pub fn write_byte(&mut self, frame: FrameNumber, offset: usize, value: u8) -> Result<(), MemoryError> {
        let slot = self
            .frame_mut(frame)?
            .get_mut(offset)
            .ok_or(MemoryError::BusError { frame })?;
        *slot = value;
        Ok(())
    }

    /// Little-endian word at `offset`; the word must not straddle frames
    pub fn read_word(&self, frame: FrameNumber, offset: usize) -> Result<u32, MemoryError> {
        let bytes = self
            .frame(frame)?
            .get(offset..offset + 4)
            .ok_or(MemoryError::BusError { frame })?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn write_word(&mut self, frame: FrameNumber, offset: usize, value: u32) -> Result<(), MemoryError> {
        let bytes = self
            .frame_mut(frame)?
            .get_mut(offset..offset + 4)
            .ok_or(MemoryError::BusError { frame })?;
        bytes.copy_from_slice(&value.to_le_bytes());
        Ok(())
    }
}

// ============================================================================
// Frame Allocator
// ============================================================================

/// One bit per physical frame: set means allocated
#[derive(Debug, Clone)]
pub struct FrameAllocator {
    bits: BitVec<u8, Lsb0>,
}

impl FrameAllocator {
    pub fn new(num_frames: usize) -> Self {
        Self {
            bits: BitVec::repeat(false, num_frames),
        }
    }

    pub fn num_frames(&self) -> usize {
        self.bits.len()
    }

    pub fn num_free(&self) -> usize {
        self.bits.count_zeros()
    }

    pub fn is_allocated(&self, frame: FrameNumber) -> bool {
        self.bits.get(frame.0).map(|bit| *bit).unwrap_or(false)
    }

    /// Claim the lowest free frame
    pub fn allocate(&mut self) -> Result<FrameNumber, FrameError> {
        let index = self.bits.first_zero().ok_or(FrameError::Exhausted)?;
        self.bits.set(index, true);
        Ok(FrameNumber(index))
    }

    /// Return a frame to the pool
    pub fn free(&mut self, frame: FrameNumber) -> Result<(), FrameError> {
        if frame.0 >= self.bits.len() {
            return Err(FrameError::OutOfRange(frame));
        }
        if !self.bits[frame.0] {
            return Err(FrameError::NotAllocated(frame));
        }
        self.bits.set(frame.0, false);
        Ok(())
    }
}

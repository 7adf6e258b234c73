//! Copyin/Copyout - User↔Kernel Data Transfer
//!
//! User memory is a separate address space the kernel cannot address
//! directly. Everything crosses through the [`UserMemory`] capability,
//! which the kernel implements over a paged address space and tests
//! implement over a flat buffer ([`FlatMemory`]).
//!
//! Two inbound modes:
//! - string: up to (not including) the first NUL
//! - bounded: exactly `len` bytes, embedded zeros included
//!
//! Outbound copies always write a trailing NUL after the payload, so
//! fixed-length and string results share one routine.

use alloc::vec;
use alloc::vec::Vec;

use crate::error::{CopyError, MemoryError};
use crate::types::VirtAddr;

/// Largest bounded copy accepted in one call
pub const COPYIO_MAX_SIZE: usize = 64 * 1024;

/// Read and write bytes at user virtual addresses
pub trait UserMemory {
    fn read(&mut self, vaddr: VirtAddr, buf: &mut [u8]) -> Result<(), CopyError>;

    fn write(&mut self, vaddr: VirtAddr, data: &[u8]) -> Result<(), CopyError>;
}

/// Copy a NUL-terminated string in; the NUL is not included
pub fn copyin_string<U: UserMemory + ?Sized>(mem: &mut U, vaddr: VirtAddr) -> Result<Vec<u8>, CopyError> {
    let mut out = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let addr = vaddr
            .checked_add(out.len() as u32)
            .ok_or(MemoryError::AddressOutOfRange { vaddr })?;
        mem.read(addr, &mut byte)?;
        if byte[0] == 0 {
            return Ok(out);
        }
        out.push(byte[0]);
    }
}

/// Copy exactly `len` bytes in
pub fn copyin<U: UserMemory + ?Sized>(mem: &mut U, vaddr: VirtAddr, len: i32) -> Result<Vec<u8>, CopyError> {
    let len = usize::try_from(len).map_err(|_| CopyError::BadLength(len))?;
    if len > COPYIO_MAX_SIZE {
        return Err(CopyError::BadLength(len as i32));
    }
    let mut buf = vec![0u8; len];
    mem.read(vaddr, &mut buf)?;
    Ok(buf)
}

/// Copy `data` out, followed by a NUL
pub fn copyout<U: UserMemory + ?Sized>(mem: &mut U, vaddr: VirtAddr, data: &[u8]) -> Result<(), CopyError> {
    mem.write(vaddr, data)?;
    let end = vaddr
        .checked_add(data.len() as u32)
        .ok_or(MemoryError::AddressOutOfRange { vaddr })?;
    mem.write(end, &[0])
}

/// A plain byte buffer standing in for a user address space
#[derive(Debug, Clone, Default)]
pub struct FlatMemory {
    bytes: Vec<u8>,
}

impl FlatMemory {
    pub fn new(size: usize) -> Self {
        Self { bytes: vec![0; size] }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn span(&self, vaddr: VirtAddr, len: usize) -> Result<core::ops::Range<usize>, CopyError> {
        let start = vaddr as usize;
        let end = start
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .ok_or(MemoryError::AddressOutOfRange { vaddr })?;
        Ok(start..end)
    }
}

impl UserMemory for FlatMemory {
    fn read(&mut self, vaddr: VirtAddr, buf: &mut [u8]) -> Result<(), CopyError> {
        let span = self.span(vaddr, buf.len())?;
        buf.copy_from_slice(&self.bytes[span]);
        Ok(())
    }

    fn write(&mut self, vaddr: VirtAddr, data: &[u8]) -> Result<(), CopyError> {
        let span = self.span(vaddr, data.len())?;
        self.bytes[span].copy_from_slice(data);
        Ok(())
    }
}

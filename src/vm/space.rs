//! Per-process address spaces
//!
//! An address space is a page table sized to cover the executable image
//! plus the user stack, together with the image it is paged in from.
//! [`UserSpace`] is the kernel's window onto it: reads and writes that hit
//! an unmapped page are paged in on the spot and retried.

use alloc::sync::Arc;
use log::warn;

use super::executable::ExecutableImage;
use super::fault::PageFaultHandler;
use super::frame::{FrameAllocator, PhysicalMemory};
use super::page_table::PageTable;
use crate::config::INSTRUCTION_WIDTH;
use crate::error::{CopyError, FrameError, MemoryError};
use crate::kern::copyio::UserMemory;
use crate::machine::{RegisterFile, NEXT_PC_REG, NUM_TOTAL_REGS, PC_REG, STACK_REG};
use crate::types::{FrameNumber, VirtAddr};

/// Gap left between the top of the stack and the end of the space
const STACK_TOP_PAD: usize = 16;

#[derive(Debug, Clone)]
pub struct AddressSpace {
    page_table: PageTable,
    image: Arc<ExecutableImage>,
}

impl AddressSpace {
    pub fn new(image: Arc<ExecutableImage>, page_size: usize, stack_size: usize) -> Self {
        let size = image.image_size() as usize + stack_size;
        let num_pages = size.div_ceil(page_size);
        Self {
            page_table: PageTable::new(num_pages, page_size),
            image,
        }
    }

    pub fn page_table(&self) -> &PageTable {
        &self.page_table
    }

    pub fn page_table_mut(&mut self) -> &mut PageTable {
        &mut self.page_table
    }

    pub fn image(&self) -> &Arc<ExecutableImage> {
        &self.image
    }

    /// The table to mutate and the image to page from, borrowed together
    pub fn split_mut(&mut self) -> (&mut PageTable, &ExecutableImage) {
        (&mut self.page_table, &self.image)
    }

    /// Registers for a fresh process: start of code, stack at the top
    pub fn initial_registers(&self) -> RegisterFile {
        let mut regs = [0; NUM_TOTAL_REGS];
        let entry = self.image.code.virtual_addr as i32;
        regs[PC_REG] = entry;
        regs[NEXT_PC_REG] = entry + INSTRUCTION_WIDTH;
        regs[STACK_REG] = self.page_table.size().saturating_sub(STACK_TOP_PAD) as i32;
        regs
    }

    /// Return every backing frame to the allocator
    pub fn release(&mut self, frames: &mut FrameAllocator) -> usize {
        let released = self.page_table.clear();
        for frame in &released {
            if let Err(err) = frames.free(*frame) {
                warn!(target: "addr", "releasing frame {}: {}", frame, err);
            }
        }
        released.len()
    }

    /// Eagerly copy every resident page into freshly allocated frames
    ///
    /// Pages that were never touched stay unmapped in the copy and fault
    /// in from the shared image as usual.
    pub fn duplicate(
        &self,
        memory: &mut PhysicalMemory,
        frames: &mut FrameAllocator,
    ) -> Result<Self, FrameError> {
        let mut copy = Self {
            page_table: PageTable::new(self.page_table.len(), self.page_table.page_size()),
            image: Arc::clone(&self.image),
        };
        for entry in self.page_table.entries().filter(|entry| entry.valid) {
            let frame = match frames.allocate() {
                Ok(frame) => frame,
                Err(err) => {
                    copy.release(frames);
                    return Err(err);
                }
            };
            if memory.copy_frame(entry.physical_page, frame).is_err() {
                if let Err(err) = frames.free(frame) {
                    warn!(target: "addr", "returning frame {}: {}", frame, err);
                }
                copy.release(frames);
                return Err(FrameError::OutOfRange(frame));
            }
            copy.page_table.map(entry.virtual_page, frame);
        }
        Ok(copy)
    }
}

/// Kernel access to a user address space with demand paging
pub struct UserSpace<'a> {
    pub space: &'a mut AddressSpace,
    pub memory: &'a mut PhysicalMemory,
    pub frames: &'a mut FrameAllocator,
    pub pager: &'a PageFaultHandler,
}

impl UserSpace<'_> {
    fn locate(&mut self, vaddr: VirtAddr, writing: bool) -> Result<(FrameNumber, usize), CopyError> {
        match self.space.page_table.translate(vaddr, writing) {
            Err(MemoryError::NotMapped { .. }) => {
                self.pager
                    .handle(vaddr, &mut *self.space, &mut *self.memory, &mut *self.frames)?;
                Ok(self.space.page_table.translate(vaddr, writing)?)
            }
            other => Ok(other?),
        }
    }

    /// Walk `len` bytes from `vaddr` one page-bounded chunk at a time
    fn for_each_chunk(
        &mut self,
        vaddr: VirtAddr,
        len: usize,
        writing: bool,
        mut f: impl FnMut(&mut PhysicalMemory, FrameNumber, usize, core::ops::Range<usize>) -> Result<(), MemoryError>,
    ) -> Result<(), CopyError> {
        let page_size = self.space.page_table.page_size();
        let mut done = 0;
        while done < len {
            let addr = vaddr
                .checked_add(done as u32)
                .ok_or(MemoryError::AddressOutOfRange { vaddr })?;
            let (frame, offset) = self.locate(addr, writing)?;
            let n = (page_size - offset).min(len - done);
            f(&mut *self.memory, frame, offset, done..done + n)?;
            done += n;
        }
        Ok(())
    }
}

impl UserMemory for UserSpace<'_> {
    fn read(&mut self, vaddr: VirtAddr, buf: &mut [u8]) -> Result<(), CopyError> {
        self.for_each_chunk(vaddr, buf.len(), false, |memory, frame, offset, range| {
            let src = memory.frame(frame)?;
            let n = range.len();
            buf[range].copy_from_slice(&src[offset..offset + n]);
            Ok(())
        })
    }

    fn write(&mut self, vaddr: VirtAddr, data: &[u8]) -> Result<(), CopyError> {
        self.for_each_chunk(vaddr, data.len(), true, |memory, frame, offset, range| {
            let dst = memory.frame_mut(frame)?;
            let n = range.len();
            dst[offset..offset + n].copy_from_slice(&data[range]);
            Ok(())
        })
    }
}

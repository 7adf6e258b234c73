//! Linear per-process page table
//!
//! One entry per virtual page. Entries start unmapped and become valid
//! exactly once, when the fault handler (or a fork copy) gives them a
//! frame; nothing ever evicts them.

use alloc::vec::Vec;

use crate::error::MemoryError;
use crate::types::{FrameNumber, VirtAddr};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageTableEntry {
    /// Page number in the virtual address space
    pub virtual_page: usize,
    /// Backing frame, meaningful only while `valid`
    pub physical_page: FrameNumber,
    /// Translation may be used
    pub valid: bool,
    /// Set by the CPU on every reference
    pub used: bool,
    /// Set by the CPU on every write
    pub dirty: bool,
    /// Writes raise `ReadOnly`
    pub read_only: bool,
}

impl PageTableEntry {
    pub const fn unmapped(virtual_page: usize) -> Self {
        Self {
            virtual_page,
            physical_page: FrameNumber(0),
            valid: false,
            used: false,
            dirty: false,
            read_only: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PageTable {
    entries: Vec<PageTableEntry>,
    page_size: usize,
}

impl PageTable {
    pub fn new(num_pages: usize, page_size: usize) -> Self {
        Self {
            entries: (0..num_pages).map(PageTableEntry::unmapped).collect(),
            page_size,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Bytes covered by the table
    pub fn size(&self) -> usize {
        self.entries.len() * self.page_size
    }

    pub fn vpn_of(&self, vaddr: VirtAddr) -> usize {
        vaddr as usize / self.page_size
    }

    pub fn entry(&self, vpn: usize) -> Option<&PageTableEntry> {
        self.entries.get(vpn)
    }

    pub fn entries(&self) -> impl Iterator<Item = &PageTableEntry> {
        self.entries.iter()
    }

    /// Install a fresh translation with every flag cleared but `valid`
    ///
    /// Returns `false` if `vpn` is outside the table.
    pub fn map(&mut self, vpn: usize, frame: FrameNumber) -> bool {
        let Some(entry) = self.entries.get_mut(vpn) else {
            return false;
        };
        *entry = PageTableEntry {
            virtual_page: vpn,
            physical_page: frame,
            valid: true,
            used: false,
            dirty: false,
            read_only: false,
        };
        true
    }

    /// Frames backing valid entries
    pub fn mapped_frames(&self) -> impl Iterator<Item = FrameNumber> + '_ {
        self.entries
            .iter()
            .filter(|entry| entry.valid)
            .map(|entry| entry.physical_page)
    }

    /// Drop every translation, returning the frames that backed them
    pub fn clear(&mut self) -> Vec<FrameNumber> {
        let frames = self.mapped_frames().collect();
        for (vpn, entry) in self.entries.iter_mut().enumerate() {
            *entry = PageTableEntry::unmapped(vpn);
        }
        frames
    }

    /// Translate a virtual address to (frame, offset), updating use/dirty
    pub fn translate(&mut self, vaddr: VirtAddr, writing: bool) -> Result<(FrameNumber, usize), MemoryError> {
        let vpn = self.vpn_of(vaddr);
        let offset = vaddr as usize % self.page_size;
        let entry = self
            .entries
            .get_mut(vpn)
            .ok_or(MemoryError::AddressOutOfRange { vaddr })?;
        if !entry.valid {
            return Err(MemoryError::NotMapped { vaddr });
        }
        if writing && entry.read_only {
            return Err(MemoryError::ReadOnly { vaddr });
        }
        entry.used = true;
        if writing {
            entry.dirty = true;
        }
        Ok((entry.physical_page, offset))
    }
}

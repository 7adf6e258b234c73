//! Page Fault Handling
//!
//! Demand paging with no eviction. A fault on virtual page `p`:
//!
//! 1. takes the pager lock, which serializes frame allocation and
//!    page-table mutation against any other fault in flight
//! 2. allocates one frame and zero-fills it
//! 3. copies in whatever part of the page the code and init-data segments
//!    cover, read from the executable at the matching file offset
//! 4. marks the entry valid with use, dirty and read-only cleared
//!
//! Pages covered by neither segment (uninitialized data, stack) stay
//! zero-filled. A valid entry is never populated again.

use core::sync::atomic::{AtomicU64, Ordering};
use log::{debug, trace, warn};
use spin::Mutex;

use super::executable::{ExecutableImage, Segment};
use super::frame::{FrameAllocator, PhysicalMemory};
use super::space::AddressSpace;
use crate::error::{FaultError, FrameError};
use crate::types::{FrameNumber, VirtAddr};

// ============================================================================
// Fault Statistics
// ============================================================================

#[derive(Debug)]
pub struct FaultStats {
    /// Total faults serviced
    pub total: AtomicU64,
    /// Pages with bytes from the code segment
    pub code_pages: AtomicU64,
    /// Pages with bytes from the init-data segment
    pub data_pages: AtomicU64,
    /// Pages left all zero
    pub zero_fill: AtomicU64,
    /// Faults on an entry that was already valid
    pub spurious: AtomicU64,
    /// Failed faults
    pub failures: AtomicU64,
}

impl FaultStats {
    pub const fn new() -> Self {
        Self {
            total: AtomicU64::new(0),
            code_pages: AtomicU64::new(0),
            data_pages: AtomicU64::new(0),
            zero_fill: AtomicU64::new(0),
            spurious: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }
}

impl Default for FaultStats {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Page Fault Handler
// ============================================================================

#[derive(Debug, Default)]
pub struct PageFaultHandler {
    lock: Mutex<()>,
    stats: FaultStats,
}

impl PageFaultHandler {
    pub const fn new() -> Self {
        Self {
            lock: Mutex::new(()),
            stats: FaultStats::new(),
        }
    }

    pub fn stats(&self) -> &FaultStats {
        &self.stats
    }

    /// Populate the page containing `vaddr` and return its frame
    pub fn handle(
        &self,
        vaddr: VirtAddr,
        space: &mut AddressSpace,
        memory: &mut PhysicalMemory,
        frames: &mut FrameAllocator,
    ) -> Result<FrameNumber, FaultError> {
        let _guard = self.lock.lock();
        self.stats.total.fetch_add(1, Ordering::Relaxed);

        let result = self.populate(vaddr, space, memory, frames);
        if result.is_err() {
            self.stats.failures.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    fn populate(
        &self,
        vaddr: VirtAddr,
        space: &mut AddressSpace,
        memory: &mut PhysicalMemory,
        frames: &mut FrameAllocator,
    ) -> Result<FrameNumber, FaultError> {
        let (table, image) = space.split_mut();
        let page_size = table.page_size();
        let vpn = table.vpn_of(vaddr);
        let entry = table.entry(vpn).ok_or(FaultError::OutOfRange { vaddr })?;
        if entry.valid {
            debug!(target: "addr", "page {} already resident", vpn);
            self.stats.spurious.fetch_add(1, Ordering::Relaxed);
            return Ok(entry.physical_page);
        }

        let frame = frames.allocate()?;
        let bytes = match memory.frame_mut(frame) {
            Ok(bytes) => bytes,
            Err(_) => {
                if let Err(err) = frames.free(frame) {
                    warn!(target: "addr", "returning frame {}: {}", frame, err);
                }
                return Err(FrameError::OutOfRange(frame).into());
            }
        };
        bytes.fill(0);

        let start = (vpn * page_size) as u32;
        let end = start + page_size as u32;
        let code = copy_segment(&image.code, image, start, end, bytes);
        let data = copy_segment(&image.init_data, image, start, end, bytes);
        if code > 0 {
            self.stats.code_pages.fetch_add(1, Ordering::Relaxed);
        }
        if data > 0 {
            self.stats.data_pages.fetch_add(1, Ordering::Relaxed);
        }
        if code == 0 && data == 0 {
            self.stats.zero_fill.fetch_add(1, Ordering::Relaxed);
        }

        table.map(vpn, frame);
        trace!(
            target: "addr",
            "fault {:#x}: page {} -> frame {} ({} code, {} data bytes)",
            vaddr,
            vpn,
            frame,
            code,
            data
        );
        Ok(frame)
    }
}

/// Copy the part of `[start, end)` that `segment` covers into `frame`
fn copy_segment(segment: &Segment, image: &ExecutableImage, start: u32, end: u32, frame: &mut [u8]) -> usize {
    let Some((lo, hi)) = segment.overlap(start, end) else {
        return 0;
    };
    let file_offset = (segment.in_file_addr + (lo - segment.virtual_addr)) as usize;
    image.read_at(&mut frame[(lo - start) as usize..(hi - start) as usize], file_offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::executable::HEADER_SIZE;
    use alloc::sync::Arc;
    use alloc::vec::Vec;

    const PAGE: usize = 128;

    struct Fixture {
        space: AddressSpace,
        memory: PhysicalMemory,
        frames: FrameAllocator,
        pager: PageFaultHandler,
    }

    impl Fixture {
        fn new(image: ExecutableImage) -> Self {
            Self {
                space: AddressSpace::new(Arc::new(image), PAGE, 256),
                memory: PhysicalMemory::new(16, PAGE),
                frames: FrameAllocator::new(16),
                pager: PageFaultHandler::new(),
            }
        }

        fn fault(&mut self, vaddr: VirtAddr) -> Result<FrameNumber, FaultError> {
            self.pager
                .handle(vaddr, &mut self.space, &mut self.memory, &mut self.frames)
        }

        fn frame_bytes(&self, frame: FrameNumber) -> &[u8] {
            self.memory.frame(frame).unwrap()
        }
    }

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(7).wrapping_add(seed)).collect()
    }

    #[test]
    fn test_code_page_matches_file() {
        let code = pattern(300, 1);
        let mut fx = Fixture::new(ExecutableImage::builder().code(code.clone()).build());
        let frame = fx.fault(2 * PAGE as u32 + 5).unwrap();
        // Last code page holds 300 - 256 = 44 bytes, then zeros
        let bytes = fx.frame_bytes(frame);
        assert_eq!(&bytes[..44], &code[256..300]);
        assert!(bytes[44..].iter().all(|b| *b == 0));
        assert!(fx.space.page_table().entry(2).unwrap().valid);
    }

    #[test]
    fn test_init_data_fault_loads_file_bytes() {
        let data = pattern(100, 9);
        let image = ExecutableImage::builder()
            .code(pattern(64, 3))
            .data(384, data.clone())
            .build();
        let data_offset = image.init_data.in_file_addr as usize;
        assert_eq!(data_offset, HEADER_SIZE as usize + 64);

        let mut fx = Fixture::new(image);
        let frame = fx.fault(400).unwrap();
        assert_eq!(&fx.frame_bytes(frame)[..100], &data[..]);
        assert_eq!(fx.pager.stats().data_pages.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_stack_page_is_zero() {
        let mut fx = Fixture::new(ExecutableImage::builder().code(pattern(64, 3)).build());
        // Dirty the frame the fault will receive
        fx.memory.frame_mut(FrameNumber(0)).unwrap().fill(0xee);
        let frame = fx.fault(200).unwrap();
        assert_eq!(frame, FrameNumber(0));
        assert!(fx.frame_bytes(frame).iter().all(|b| *b == 0));
        assert_eq!(fx.pager.stats().zero_fill.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_shared_page_gets_both_segments() {
        let code = pattern(40, 1);
        let data = pattern(20, 50);
        let image = ExecutableImage::builder()
            .code(code.clone())
            .data(40, data.clone())
            .build();
        let mut fx = Fixture::new(image);
        let frame = fx.fault(0).unwrap();
        let bytes = fx.frame_bytes(frame);
        assert_eq!(&bytes[..40], &code[..]);
        assert_eq!(&bytes[40..60], &data[..]);
    }

    #[test]
    fn test_one_frame_per_fault_and_no_refault() {
        let mut fx = Fixture::new(ExecutableImage::builder().code(pattern(300, 1)).build());
        let before = fx.frames.num_free();
        let first = fx.fault(10).unwrap();
        assert_eq!(fx.frames.num_free(), before - 1);
        fx.fault(130).unwrap();
        assert_eq!(fx.frames.num_free(), before - 2);

        // Resolved entries are left alone
        assert_eq!(fx.fault(20), Ok(first));
        assert_eq!(fx.frames.num_free(), before - 2);
        assert_eq!(fx.pager.stats().spurious.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_fresh_entry_flags() {
        let mut fx = Fixture::new(ExecutableImage::builder().code(pattern(8, 1)).build());
        fx.fault(0).unwrap();
        let entry = *fx.space.page_table().entry(0).unwrap();
        assert!(entry.valid);
        assert!(!entry.used);
        assert!(!entry.dirty);
        assert!(!entry.read_only);
        assert_eq!(entry.virtual_page, 0);
    }

    #[test]
    fn test_frame_past_memory_is_returned() {
        let mut fx = Fixture::new(ExecutableImage::builder().code(pattern(8, 1)).build());
        fx.memory = PhysicalMemory::new(1, PAGE);
        fx.frames = FrameAllocator::new(2);
        fx.fault(0).unwrap();

        assert_eq!(
            fx.fault(PAGE as u32),
            Err(FaultError::Frames(FrameError::OutOfRange(FrameNumber(1))))
        );
        assert_eq!(fx.frames.num_free(), 1);
        assert!(!fx.space.page_table().entry(1).unwrap().valid);
    }

    #[test]
    fn test_failures() {
        let mut fx = Fixture::new(ExecutableImage::builder().code(pattern(8, 1)).build());
        let beyond = fx.space.page_table().size() as u32;
        assert_eq!(fx.fault(beyond), Err(FaultError::OutOfRange { vaddr: beyond }));

        fx.frames = FrameAllocator::new(0);
        assert_eq!(fx.fault(0), Err(FaultError::Frames(FrameError::Exhausted)));
        assert_eq!(fx.pager.stats().failures.load(Ordering::Relaxed), 2);
    }
}

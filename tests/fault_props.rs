//! Property-based tests for demand paging

use std::sync::Arc;

use coopkern::error::{FaultError, FrameError};
use coopkern::vm::{AddressSpace, ExecutableImage, FrameAllocator, PageFaultHandler, PhysicalMemory};
use proptest::prelude::*;

const PAGE: usize = 64;
const STACK: usize = 256;

#[derive(Debug, Clone)]
struct Layout {
    code: Vec<u8>,
    data_vaddr: u32,
    data: Vec<u8>,
    bss: u32,
}

fn layout() -> impl Strategy<Value = Layout> {
    (
        prop::collection::vec(any::<u8>(), 1..600),
        0u32..200,
        prop::collection::vec(any::<u8>(), 0..300),
        0u32..200,
    )
        .prop_map(|(code, gap, data, bss)| Layout {
            data_vaddr: code.len() as u32 + gap,
            code,
            data,
            bss,
        })
}

impl Layout {
    fn image(&self) -> ExecutableImage {
        ExecutableImage::builder()
            .code(self.code.clone())
            .data(self.data_vaddr, self.data.clone())
            .bss(self.bss)
            .build()
    }

    /// What user memory must look like once every page is resident
    fn expected(&self, size: usize) -> Vec<u8> {
        let mut memory = vec![0u8; size];
        memory[..self.code.len()].copy_from_slice(&self.code);
        let start = self.data_vaddr as usize;
        memory[start..start + self.data.len()].copy_from_slice(&self.data);
        memory
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Faulting every page in any order reproduces the image exactly and
    /// uses one frame per page
    #[test]
    fn every_page_matches_image(layout in layout(), seed in any::<u64>()) {
        let image = layout.image();
        let mut space = AddressSpace::new(Arc::new(image), PAGE, STACK);
        let pages = space.page_table().len();
        let mut memory = PhysicalMemory::new(pages, PAGE);
        let mut frames = FrameAllocator::new(pages);
        let pager = PageFaultHandler::new();

        let mut order: Vec<usize> = (0..pages).collect();
        let mut state = seed | 1;
        for i in (1..order.len()).rev() {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            order.swap(i, (state % (i as u64 + 1)) as usize);
        }

        for &vpn in &order {
            let vaddr = (vpn * PAGE + PAGE / 2) as u32;
            prop_assert!(pager.handle(vaddr, &mut space, &mut memory, &mut frames).is_ok());
        }
        prop_assert_eq!(frames.num_free(), 0);

        let expected = layout.expected(space.page_table().size());
        for vpn in 0..pages {
            let entry = space.page_table().entry(vpn).unwrap();
            prop_assert!(entry.valid);
            let bytes = memory.frame(entry.physical_page).unwrap();
            prop_assert_eq!(bytes, &expected[vpn * PAGE..(vpn + 1) * PAGE]);
        }

        // Resident pages fault spuriously without taking frames
        let again = pager.handle(0, &mut space, &mut memory, &mut frames);
        prop_assert_eq!(again.ok(), Some(space.page_table().entry(0).unwrap().physical_page));

        prop_assert_eq!(space.release(&mut frames), pages);
        prop_assert_eq!(frames.num_free(), pages);
    }

    /// Running out of frames fails cleanly and leaks nothing
    #[test]
    fn exhaustion_leaves_allocator_consistent(layout in layout(), spare in 0usize..4) {
        let image = layout.image();
        let mut space = AddressSpace::new(Arc::new(image), PAGE, STACK);
        let pages = space.page_table().len();
        let available = spare.min(pages.saturating_sub(1));
        let mut memory = PhysicalMemory::new(available.max(1), PAGE);
        let mut frames = FrameAllocator::new(available.max(1));
        let pager = PageFaultHandler::new();

        let mut mapped = 0;
        for vpn in 0..pages {
            match pager.handle((vpn * PAGE) as u32, &mut space, &mut memory, &mut frames) {
                Ok(_) => mapped += 1,
                Err(err) => {
                    prop_assert_eq!(err, FaultError::Frames(FrameError::Exhausted));
                    prop_assert!(!space.page_table().entry(vpn).unwrap().valid);
                }
            }
        }
        prop_assert_eq!(mapped, available.max(1));
        prop_assert_eq!(space.release(&mut frames), mapped);
        prop_assert_eq!(frames.num_free(), frames.num_frames());
    }

    /// Addresses past the last page are rejected without allocating
    #[test]
    fn beyond_space_is_rejected(layout in layout(), past in 0u32..10_000) {
        let mut space = AddressSpace::new(Arc::new(layout.image()), PAGE, STACK);
        let size = space.page_table().size() as u32;
        let mut memory = PhysicalMemory::new(4, PAGE);
        let mut frames = FrameAllocator::new(4);
        let pager = PageFaultHandler::new();

        let vaddr = size + past;
        prop_assert_eq!(
            pager.handle(vaddr, &mut space, &mut memory, &mut frames),
            Err(FaultError::OutOfRange { vaddr })
        );
        prop_assert_eq!(frames.num_free(), 4);
    }
}

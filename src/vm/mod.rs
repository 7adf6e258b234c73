//! Virtual memory
//!
//! Index-addressed physical frames, per-process linear page tables, the
//! executable images pages are filled from, and the demand pager.

pub mod executable;
pub mod fault;
pub mod frame;
pub mod page_table;
pub mod space;

pub use executable::{DataSection, ExecutableImage, ImageBuilder, Segment};
pub use fault::{FaultStats, PageFaultHandler};
pub use frame::{FrameAllocator, PhysicalMemory};
pub use page_table::{PageTable, PageTableEntry};
pub use space::{AddressSpace, UserSpace};

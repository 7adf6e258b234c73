//! Simulated CPU interface
//!
//! The kernel core only talks to the CPU through [`Machine`]: a register
//! file, the physical frame arena, and a single-step entry that runs one
//! user instruction through a page table. [`SimMachine`] is the reference
//! implementation used by the demo and the tests.
//!
//! ## Trap ABI
//!
//! - r2: syscall code on entry, result on return
//! - r4..r7: up to four arguments
//! - PrevPC / PC / NextPC: advanced together by one instruction width

pub mod isa;
pub mod sim;

pub use isa::{Assembler, Instruction};
pub use sim::SimMachine;

use crate::config::INSTRUCTION_WIDTH;
use crate::types::Word;
use crate::vm::frame::PhysicalMemory;
use crate::vm::page_table::PageTable;

// ============================================================================
// Register File Layout
// ============================================================================

/// General purpose registers
pub const NUM_GP_REGS: usize = 32;
/// Syscall code on trap entry
pub const SYSCALL_CODE_REG: usize = 2;
/// Syscall result on trap return
pub const RESULT_REG: usize = 2;
/// Syscall argument registers, in order
pub const ARG_REGS: [usize; 4] = [4, 5, 6, 7];
/// User stack pointer
pub const STACK_REG: usize = 29;
/// Return address
pub const RET_ADDR_REG: usize = 31;
pub const HI_REG: usize = 32;
pub const LO_REG: usize = 33;
/// Current program counter
pub const PC_REG: usize = 34;
/// Next program counter
pub const NEXT_PC_REG: usize = 35;
/// Previous program counter, for debugging
pub const PREV_PC_REG: usize = 36;
/// Register being loaded by a delayed load
pub const LOAD_REG: usize = 37;
pub const LOAD_VALUE_REG: usize = 38;
/// Failing virtual address on an address exception
pub const BAD_VADDR_REG: usize = 39;
pub const NUM_TOTAL_REGS: usize = 40;

/// Complete saved user context
pub type RegisterFile = [Word; NUM_TOTAL_REGS];

// ============================================================================
// Exception Classification
// ============================================================================

/// Why the CPU transferred control to the kernel
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExceptionType {
    /// Control returned to the kernel with nothing to handle
    NoException = 0,
    /// Program executed a syscall
    Syscall = 1,
    /// No valid translation found
    PageFault = 2,
    /// Write attempted to a page marked read-only
    ReadOnly = 3,
    /// Translation produced an invalid physical address
    BusError = 4,
    /// Unaligned reference or beyond the end of the address space
    AddressError = 5,
    /// Integer overflow in add or sub
    Overflow = 6,
    /// Unimplemented or reserved instruction
    IllegalInstr = 7,
}

impl ExceptionType {
    /// Decode a raw classification tag; unknown tags have no variant
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::NoException),
            1 => Some(Self::Syscall),
            2 => Some(Self::PageFault),
            3 => Some(Self::ReadOnly),
            4 => Some(Self::BusError),
            5 => Some(Self::AddressError),
            6 => Some(Self::Overflow),
            7 => Some(Self::IllegalInstr),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::NoException => "NoException",
            Self::Syscall => "SyscallException",
            Self::PageFault => "PageFaultException",
            Self::ReadOnly => "ReadOnlyException",
            Self::BusError => "BusErrorException",
            Self::AddressError => "AddressErrorException",
            Self::Overflow => "OverflowException",
            Self::IllegalInstr => "IllegalInstrException",
        }
    }

    /// Whether this exception always halts the machine
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::NoException | Self::Syscall | Self::PageFault)
    }
}

// ============================================================================
// Machine Trait
// ============================================================================

/// The CPU and physical memory the kernel runs user programs on
pub trait Machine {
    fn read_register(&self, reg: usize) -> Word;

    fn write_register(&mut self, reg: usize, value: Word);

    fn memory(&self) -> &PhysicalMemory;

    fn memory_mut(&mut self) -> &mut PhysicalMemory;

    /// Execute one user instruction, translating through `page_table`
    ///
    /// Returns the exception raised, if any. On an exception the PC is
    /// left pointing at the trapping instruction.
    fn execute_one(&mut self, page_table: &mut PageTable) -> Option<ExceptionType>;

    /// Stop the machine; no further instructions execute
    fn halt(&mut self);

    fn is_halted(&self) -> bool;

    /// Snapshot the full register file
    fn save_registers(&self) -> RegisterFile {
        let mut regs = [0; NUM_TOTAL_REGS];
        for (reg, slot) in regs.iter_mut().enumerate() {
            *slot = self.read_register(reg);
        }
        regs
    }

    /// Load a previously saved register file
    fn restore_registers(&mut self, regs: &RegisterFile) {
        for (reg, value) in regs.iter().enumerate() {
            self.write_register(reg, *value);
        }
    }

    /// Step past the current instruction: PrevPC <- PC, PC <- NextPC,
    /// NextPC <- NextPC + width
    fn advance_pc(&mut self) {
        let pc = self.read_register(PC_REG);
        let next = self.read_register(NEXT_PC_REG);
        self.write_register(PREV_PC_REG, pc);
        self.write_register(PC_REG, next);
        self.write_register(NEXT_PC_REG, next.wrapping_add(INSTRUCTION_WIDTH));
    }
}

//! Reference simulated CPU
//!
//! Fetch, decode and execute one instruction at a time. Every memory
//! reference, including instruction fetch, is translated through the
//! page table handed in by the kernel, so an unmapped page surfaces as a
//! `PageFault` with the failing address in `BAD_VADDR_REG`.

use core::sync::atomic::{AtomicU64, Ordering};

use super::isa::Instruction;
use super::{
    ExceptionType, Machine, RegisterFile, BAD_VADDR_REG, NEXT_PC_REG, NUM_TOTAL_REGS, PC_REG,
    PREV_PC_REG,
};
use crate::config::INSTRUCTION_WIDTH;
use crate::error::MemoryError;
use crate::types::{FrameNumber, VirtAddr, Word};
use crate::vm::frame::PhysicalMemory;
use crate::vm::page_table::PageTable;

/// CPU statistics
#[derive(Debug, Default)]
pub struct CpuStats {
    /// Instructions retired
    pub instructions: AtomicU64,
    /// Exceptions raised
    pub exceptions: AtomicU64,
}

#[derive(Debug)]
pub struct SimMachine {
    registers: RegisterFile,
    memory: PhysicalMemory,
    halted: bool,
    stats: CpuStats,
}

impl SimMachine {
    pub fn new(page_size: usize, num_frames: usize) -> Self {
        Self {
            registers: [0; NUM_TOTAL_REGS],
            memory: PhysicalMemory::new(num_frames, page_size),
            halted: false,
            stats: CpuStats::default(),
        }
    }

    pub fn stats(&self) -> &CpuStats {
        &self.stats
    }

    pub fn instructions_executed(&self) -> u64 {
        self.stats.instructions.load(Ordering::Relaxed)
    }

    fn reg(&self, r: u8) -> Word {
        if r == 0 {
            0
        } else {
            self.registers[r as usize]
        }
    }

    fn set_reg(&mut self, r: u8, value: Word) {
        // r0 is hardwired to zero
        if r != 0 {
            self.registers[r as usize] = value;
        }
    }

    fn jump(&mut self, target: u32) {
        self.registers[PREV_PC_REG] = self.registers[PC_REG];
        self.registers[PC_REG] = target as Word;
        self.registers[NEXT_PC_REG] = target.wrapping_add(INSTRUCTION_WIDTH as u32) as Word;
    }

    fn branch(&mut self, offset: i16) {
        let pc = self.registers[PC_REG] as u32;
        let target = pc
            .wrapping_add(INSTRUCTION_WIDTH as u32)
            .wrapping_add((offset as i32 * INSTRUCTION_WIDTH) as u32);
        self.jump(target);
    }

    fn raise(&mut self, err: MemoryError) -> ExceptionType {
        if let Some(vaddr) = err.vaddr() {
            self.registers[BAD_VADDR_REG] = vaddr as Word;
        }
        self.raise_exception(err.exception())
    }

    fn raise_exception(&mut self, which: ExceptionType) -> ExceptionType {
        self.stats.exceptions.fetch_add(1, Ordering::Relaxed);
        which
    }
}

fn word_location(
    table: &mut PageTable,
    vaddr: VirtAddr,
    writing: bool,
) -> Result<(FrameNumber, usize), MemoryError> {
    if vaddr % INSTRUCTION_WIDTH as u32 != 0 {
        return Err(MemoryError::Misaligned { vaddr });
    }
    table.translate(vaddr, writing)
}

fn load_word(memory: &PhysicalMemory, table: &mut PageTable, vaddr: VirtAddr) -> Result<u32, MemoryError> {
    let (frame, offset) = word_location(table, vaddr, false)?;
    memory.read_word(frame, offset)
}

fn store_word(
    memory: &mut PhysicalMemory,
    table: &mut PageTable,
    vaddr: VirtAddr,
    value: u32,
) -> Result<(), MemoryError> {
    let (frame, offset) = word_location(table, vaddr, true)?;
    memory.write_word(frame, offset, value)
}

impl Machine for SimMachine {
    fn read_register(&self, reg: usize) -> Word {
        self.registers[reg]
    }

    fn write_register(&mut self, reg: usize, value: Word) {
        self.registers[reg] = value;
    }

    fn memory(&self) -> &PhysicalMemory {
        &self.memory
    }

    fn memory_mut(&mut self) -> &mut PhysicalMemory {
        &mut self.memory
    }

    fn execute_one(&mut self, page_table: &mut PageTable) -> Option<ExceptionType> {
        if self.halted {
            return None;
        }

        let pc = self.registers[PC_REG] as u32;
        let word = match load_word(&self.memory, page_table, pc) {
            Ok(word) => word,
            Err(err) => return Some(self.raise(err)),
        };
        let Some(instr) = Instruction::decode(word) else {
            return Some(self.raise_exception(ExceptionType::IllegalInstr));
        };

        match instr {
            Instruction::Syscall => return Some(self.raise_exception(ExceptionType::Syscall)),
            Instruction::Addi { rt, rs, imm } => match self.reg(rs).checked_add(imm as Word) {
                Some(value) => self.set_reg(rt, value),
                None => return Some(self.raise_exception(ExceptionType::Overflow)),
            },
            Instruction::Lw { rt, base, offset } => {
                let vaddr = self.reg(base).wrapping_add(offset as Word) as u32;
                match load_word(&self.memory, page_table, vaddr) {
                    Ok(value) => self.set_reg(rt, value as Word),
                    Err(err) => return Some(self.raise(err)),
                }
            }
            Instruction::Sw { rt, base, offset } => {
                let vaddr = self.reg(base).wrapping_add(offset as Word) as u32;
                let value = self.reg(rt) as u32;
                if let Err(err) = store_word(&mut self.memory, page_table, vaddr, value) {
                    return Some(self.raise(err));
                }
            }
            Instruction::Beq { rs, rt, offset } => {
                if self.reg(rs) == self.reg(rt) {
                    self.branch(offset);
                    self.stats.instructions.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
            }
            Instruction::Bltz { rs, offset } => {
                if self.reg(rs) < 0 {
                    self.branch(offset);
                    self.stats.instructions.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
            }
            Instruction::J { target } => {
                self.jump(target.wrapping_mul(INSTRUCTION_WIDTH as u32));
                self.stats.instructions.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        }

        self.stats.instructions.fetch_add(1, Ordering::Relaxed);
        self.advance_pc();
        None
    }

    fn halt(&mut self) {
        self.halted = true;
    }

    fn is_halted(&self) -> bool {
        self.halted
    }
}

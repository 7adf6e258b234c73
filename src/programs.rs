//! Built-in user programs
//!
//! Small programs assembled at start-up for the demo binary and the
//! tests. Code sits at virtual address 0 and initialized data at
//! [`DATA_BASE`], so string addresses fit a 16-bit immediate.
//!
//! - `main`: Execs `add` and `help`, reports a failed Exec, otherwise
//!   Joins both
//! - `add`: prints 42 + 23
//! - `help`: prints a short banner

use crate::kern::services::{ImageRegistry, STDOUT};
use crate::kern::syscall_sw::{SC_ADD, SC_EXEC, SC_EXIT, SC_JOIN, SC_PRINT_CHAR, SC_PRINT_NUM, SC_PRINT_STRING, SC_WRITE};
use crate::machine::isa::AsmError;
use crate::machine::Assembler;
use crate::vm::{DataSection, ExecutableImage};

/// Virtual address of every built-in program's init-data segment
pub const DATA_BASE: u32 = 0x400;

/// Registers the programs keep values in across syscalls
const S0: u8 = 16;
const S1: u8 = 17;
const A0: u8 = 4;
const A1: u8 = 5;
const A2: u8 = 6;
const V0: u8 = 2;

pub const HELP_TEXT: &str = "coopkern: main runs add and help side by side\n";

/// Combine assembled code and a data section into one image
pub fn link(asm: &Assembler, data: DataSection) -> Result<ExecutableImage, AsmError> {
    let code = asm.assemble()?;
    let code_end = code.len() as u32;
    if code_end > data.base() {
        return Err(AsmError::CodeOverlapsData {
            code_end,
            data_base: data.base(),
        });
    }
    let base = data.base();
    Ok(ExecutableImage::builder().code(code).data(base, data.into_bytes()).build())
}

/// Address as a load-immediate operand
fn imm(addr: u32) -> i16 {
    addr as i16
}

/// The multiprogramming driver
pub fn multiprogram() -> Result<ExecutableImage, AsmError> {
    let mut data = DataSection::at(DATA_BASE);
    let add = data.cstr("add");
    let help = data.cstr("help");
    let failed = data.cstr("Exec failed: ");

    let mut asm = Assembler::new();
    asm.li(A0, imm(add))
        .syscall(SC_EXEC as i16)
        .mov(S0, V0)
        .li(A0, imm(help))
        .syscall(SC_EXEC as i16)
        .mov(S1, V0)
        .bltz(S0, "first_failed")
        .bltz(S1, "second_failed")
        .mov(A0, S0)
        .syscall(SC_JOIN as i16)
        .mov(A0, S1)
        .syscall(SC_JOIN as i16)
        .j("exit");

    for (label, reg) in [("first_failed", S0), ("second_failed", S1)] {
        asm.label(label)
            .li(A0, imm(failed))
            .li(A1, 14)
            .li(A2, STDOUT as i16)
            .syscall(SC_WRITE as i16)
            .mov(A0, reg)
            .syscall(SC_PRINT_NUM as i16)
            .j("exit");
    }

    asm.label("exit").li(A0, 0).syscall(SC_EXIT as i16);
    link(&asm, data)
}

/// Prints 42 + 23 and a newline
pub fn add() -> Result<ExecutableImage, AsmError> {
    let mut asm = Assembler::new();
    asm.li(A0, 42)
        .li(A1, 23)
        .syscall(SC_ADD as i16)
        .mov(A0, V0)
        .syscall(SC_PRINT_NUM as i16)
        .li(A0, b'\n' as i16)
        .syscall(SC_PRINT_CHAR as i16)
        .li(A0, 0)
        .syscall(SC_EXIT as i16);
    link(&asm, DataSection::at(DATA_BASE))
}

pub fn help() -> Result<ExecutableImage, AsmError> {
    let mut data = DataSection::at(DATA_BASE);
    let text = data.cstr(HELP_TEXT);

    let mut asm = Assembler::new();
    asm.li(A0, imm(text))
        .syscall(SC_PRINT_STRING as i16)
        .li(A0, 0)
        .syscall(SC_EXIT as i16);
    link(&asm, data)
}

/// `main`, `add` and `help`
pub fn demo_registry() -> Result<ImageRegistry, AsmError> {
    let mut programs = ImageRegistry::new();
    programs.register("main", multiprogram()?);
    programs.register("add", add()?);
    programs.register("help", help()?);
    Ok(programs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_demo_programs_link() {
        let programs = demo_registry().unwrap();
        let mut names: alloc::vec::Vec<_> = programs.names().collect();
        names.sort_unstable();
        assert_eq!(names, ["add", "help", "main"]);
    }

    #[test]
    fn test_data_lands_at_base() {
        let image = help().unwrap();
        assert_eq!(image.init_data.virtual_addr, DATA_BASE);
        assert_eq!(image.init_data.size as usize, HELP_TEXT.len() + 1);
        assert!(image.code.size < DATA_BASE);
    }

    #[test]
    fn test_link_rejects_overlap() {
        let mut asm = Assembler::new();
        for _ in 0..8 {
            asm.li(A0, 0);
        }
        let err = link(&asm, DataSection::at(16)).unwrap_err();
        assert_eq!(err, AsmError::CodeOverlapsData { code_end: 32, data_base: 16 });
    }
}

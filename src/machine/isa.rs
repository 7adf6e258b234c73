//! Instruction set of the simulated CPU
//!
//! A small MIPS-flavoured subset, encoded with the MIPS field layout so
//! words read naturally in a hex dump:
//!
//! | op (6) | rs (5) | rt (5) | immediate (16) |
//!
//! There are no branch delay slots. A taken branch lands on
//! `pc + 4 + offset * 4`.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use thiserror::Error;

use crate::config::INSTRUCTION_WIDTH;

const OP_SPECIAL: u32 = 0x00;
const OP_REGIMM: u32 = 0x01;
const OP_J: u32 = 0x02;
const OP_BEQ: u32 = 0x04;
const OP_ADDI: u32 = 0x08;
const OP_LW: u32 = 0x23;
const OP_SW: u32 = 0x2b;
const FUNCT_SYSCALL: u32 = 0x0c;

/// Jump target field mask, in words
const TARGET_MASK: u32 = 0x03ff_ffff;

/// Decoded instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    /// rt <- rs + imm, trapping on signed overflow
    Addi { rt: u8, rs: u8, imm: i16 },
    /// rt <- mem[rs + offset]
    Lw { rt: u8, base: u8, offset: i16 },
    /// mem[rs + offset] <- rt
    Sw { rt: u8, base: u8, offset: i16 },
    /// Branch if rs == rt
    Beq { rs: u8, rt: u8, offset: i16 },
    /// Branch if rs < 0
    Bltz { rs: u8, offset: i16 },
    /// Jump to word index `target`
    J { target: u32 },
    /// Trap into the kernel
    Syscall,
}

impl Instruction {
    pub fn decode(word: u32) -> Option<Self> {
        let op = word >> 26;
        let rs = ((word >> 21) & 0x1f) as u8;
        let rt = ((word >> 16) & 0x1f) as u8;
        let imm = word as u16 as i16;
        match op {
            OP_SPECIAL if word & 0x3f == FUNCT_SYSCALL => Some(Self::Syscall),
            OP_REGIMM if rt == 0 => Some(Self::Bltz { rs, offset: imm }),
            OP_J => Some(Self::J { target: word & TARGET_MASK }),
            OP_BEQ => Some(Self::Beq { rs, rt, offset: imm }),
            OP_ADDI => Some(Self::Addi { rt, rs, imm }),
            OP_LW => Some(Self::Lw { rt, base: rs, offset: imm }),
            OP_SW => Some(Self::Sw { rt, base: rs, offset: imm }),
            _ => None,
        }
    }

    pub fn encode(&self) -> u32 {
        fn itype(op: u32, rs: u8, rt: u8, imm: i16) -> u32 {
            (op << 26) | ((rs as u32 & 0x1f) << 21) | ((rt as u32 & 0x1f) << 16) | (imm as u16 as u32)
        }
        match *self {
            Self::Addi { rt, rs, imm } => itype(OP_ADDI, rs, rt, imm),
            Self::Lw { rt, base, offset } => itype(OP_LW, base, rt, offset),
            Self::Sw { rt, base, offset } => itype(OP_SW, base, rt, offset),
            Self::Beq { rs, rt, offset } => itype(OP_BEQ, rs, rt, offset),
            Self::Bltz { rs, offset } => itype(OP_REGIMM, rs, 0, offset),
            Self::J { target } => (OP_J << 26) | (target & TARGET_MASK),
            Self::Syscall => (OP_SPECIAL << 26) | FUNCT_SYSCALL,
        }
    }
}

// ============================================================================
// Assembler
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AsmError {
    #[error("undefined label {0:?}")]
    UndefinedLabel(&'static str),

    #[error("label {0:?} defined twice")]
    DuplicateLabel(&'static str),

    #[error("branch to {0:?} is out of range")]
    BranchRange(&'static str),

    #[error("code ends at {code_end:#x}, past the data segment at {data_base:#x}")]
    CodeOverlapsData { code_end: u32, data_base: u32 },
}

#[derive(Debug, Clone, Copy)]
enum Fixup {
    Beq { rs: u8, rt: u8 },
    Bltz { rs: u8 },
    J,
}

/// Tiny two-pass assembler with symbolic branch targets
///
/// Code is laid out from virtual address 0.
#[derive(Debug, Default)]
pub struct Assembler {
    code: Vec<Instruction>,
    labels: BTreeMap<&'static str, u32>,
    fixups: Vec<(usize, &'static str, Fixup)>,
    duplicate: Option<&'static str>,
}

impl Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Address of the next instruction
    pub fn here(&self) -> u32 {
        (self.code.len() as u32) * INSTRUCTION_WIDTH as u32
    }

    pub fn emit(&mut self, instr: Instruction) -> &mut Self {
        self.code.push(instr);
        self
    }

    pub fn label(&mut self, name: &'static str) -> &mut Self {
        let here = self.here();
        if self.labels.insert(name, here).is_some() {
            self.duplicate.get_or_insert(name);
        }
        self
    }

    /// rt <- imm
    pub fn li(&mut self, rt: u8, imm: i16) -> &mut Self {
        self.emit(Instruction::Addi { rt, rs: 0, imm })
    }

    /// rt <- rs
    pub fn mov(&mut self, rt: u8, rs: u8) -> &mut Self {
        self.emit(Instruction::Addi { rt, rs, imm: 0 })
    }

    /// Load the syscall code into r2 and trap
    pub fn syscall(&mut self, code: i16) -> &mut Self {
        self.li(2, code).emit(Instruction::Syscall)
    }

    pub fn beq(&mut self, rs: u8, rt: u8, target: &'static str) -> &mut Self {
        self.placeholder(target, Fixup::Beq { rs, rt })
    }

    pub fn bltz(&mut self, rs: u8, target: &'static str) -> &mut Self {
        self.placeholder(target, Fixup::Bltz { rs })
    }

    pub fn j(&mut self, target: &'static str) -> &mut Self {
        self.placeholder(target, Fixup::J)
    }

    fn placeholder(&mut self, target: &'static str, fixup: Fixup) -> &mut Self {
        self.fixups.push((self.code.len(), target, fixup));
        self.emit(Instruction::J { target: 0 })
    }

    /// Resolve labels and produce little-endian machine code
    pub fn assemble(&self) -> Result<Vec<u8>, AsmError> {
        if let Some(name) = self.duplicate {
            return Err(AsmError::DuplicateLabel(name));
        }
        let mut code = self.code.clone();
        for &(index, name, fixup) in &self.fixups {
            let target = *self.labels.get(name).ok_or(AsmError::UndefinedLabel(name))?;
            let from = (index as i64 + 1) * INSTRUCTION_WIDTH as i64;
            let delta = (target as i64 - from) / INSTRUCTION_WIDTH as i64;
            let offset = i16::try_from(delta).map_err(|_| AsmError::BranchRange(name))?;
            code[index] = match fixup {
                Fixup::Beq { rs, rt } => Instruction::Beq { rs, rt, offset },
                Fixup::Bltz { rs } => Instruction::Bltz { rs, offset },
                Fixup::J => Instruction::J {
                    target: target / INSTRUCTION_WIDTH as u32,
                },
            };
        }
        Ok(code.iter().flat_map(|instr| instr.encode().to_le_bytes()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_known_words() {
        // addi $4, $0, 7
        assert_eq!(
            Instruction::decode(0x2004_0007),
            Some(Instruction::Addi { rt: 4, rs: 0, imm: 7 })
        );
        assert_eq!(Instruction::decode(0x0000_000c), Some(Instruction::Syscall));
        // lw $8, -4($29)
        assert_eq!(
            Instruction::decode(0x8fa8_fffc),
            Some(Instruction::Lw { rt: 8, base: 29, offset: -4 })
        );
    }

    #[test]
    fn test_unknown_words_do_not_decode() {
        assert_eq!(Instruction::decode(0xffff_ffff), None);
        // SPECIAL with a funct other than syscall
        assert_eq!(Instruction::decode(0x0000_0020), None);
        // REGIMM with rt != 0 (bgez)
        assert_eq!(Instruction::decode(0x0401_0000), None);
    }

    #[test]
    fn test_encode_matches_decode() {
        let samples = [
            Instruction::Addi { rt: 31, rs: 1, imm: i16::MIN },
            Instruction::Sw { rt: 3, base: 29, offset: 12 },
            Instruction::Beq { rs: 16, rt: 0, offset: -3 },
            Instruction::Bltz { rs: 17, offset: 5 },
            Instruction::J { target: 0x12345 },
            Instruction::Syscall,
        ];
        for instr in samples {
            assert_eq!(Instruction::decode(instr.encode()), Some(instr));
        }
    }

    #[test]
    fn test_assembler_resolves_labels() {
        let mut asm = Assembler::new();
        asm.label("top")
            .li(8, 1)
            .bltz(8, "done")
            .j("top")
            .label("done")
            .syscall(0);
        let bytes = asm.assemble().unwrap();
        assert_eq!(bytes.len(), 5 * 4);

        let word = |i: usize| u32::from_le_bytes(bytes[i * 4..i * 4 + 4].try_into().unwrap());
        // bltz at 4 jumps to 12: offset (12 - 8) / 4 = 1
        assert_eq!(Instruction::decode(word(1)), Some(Instruction::Bltz { rs: 8, offset: 1 }));
        assert_eq!(Instruction::decode(word(2)), Some(Instruction::J { target: 0 }));
        assert_eq!(Instruction::decode(word(4)), Some(Instruction::Syscall));
    }

    #[test]
    fn test_assembler_errors() {
        let mut asm = Assembler::new();
        asm.j("nowhere");
        assert_eq!(asm.assemble(), Err(AsmError::UndefinedLabel("nowhere")));

        let mut asm = Assembler::new();
        asm.label("a").label("a");
        assert_eq!(asm.assemble(), Err(AsmError::DuplicateLabel("a")));
    }
}

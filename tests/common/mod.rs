//! Shared fixtures for the end-to-end tests

#![allow(dead_code)]

use coopkern::config::KernelConfig;
use coopkern::kern::{ImageRegistry, Kernel, OutputHandle, Services};
use coopkern::machine::{Assembler, SimMachine};
use coopkern::programs::{link, DATA_BASE};
use coopkern::vm::{DataSection, ExecutableImage};

pub const A0: u8 = 4;
pub const A1: u8 = 5;
pub const A2: u8 = 6;
pub const V0: u8 = 2;
pub const S0: u8 = 16;
pub const S1: u8 = 17;

/// Assemble a program whose data section starts at the usual base
pub fn program(build: impl FnOnce(&mut Assembler, &mut DataSection)) -> ExecutableImage {
    let mut asm = Assembler::new();
    let mut data = DataSection::at(DATA_BASE);
    build(&mut asm, &mut data);
    link(&asm, data).expect("program assembles")
}

pub fn boot(programs: ImageRegistry, input: &[u8], config: KernelConfig) -> (Kernel<SimMachine>, OutputHandle) {
    let (services, output) = Services::in_memory(input, programs);
    let machine = SimMachine::new(config.page_size, config.num_phys_pages);
    let mut kernel = Kernel::new(machine, config, services).expect("valid config");
    kernel.boot("main").expect("main loads");
    (kernel, output)
}

/// Register `main` alone and boot it with the default configuration
pub fn boot_main(main: ExecutableImage, input: &[u8]) -> (Kernel<SimMachine>, OutputHandle) {
    let mut programs = ImageRegistry::new();
    programs.register("main", main);
    boot(programs, input, KernelConfig::default())
}

pub fn imm(addr: u32) -> i16 {
    addr as i16
}

//! coopkern - core of a small teaching kernel
//!
//! A cooperative scheduler with FIFO or priority ready lists, an
//! exception and syscall dispatcher, and demand paging over a simulated
//! CPU. Everything runs on a single simulated processor; interrupt
//! masking is the only mutual exclusion the core needs.
//!
//! The crate is `no_std` + `alloc`. The host binary supplies the console
//! sink and drives [`kern::Kernel::run`].

#![no_std]

extern crate alloc;

// Core types
pub mod config;
pub mod error;
pub mod types;

// Diagnostics
pub mod console;

// Simulated hardware
pub mod interrupt;
pub mod machine;

// Kernel core
pub mod kern;
pub mod scheduler;
pub mod vm;

// Built-in user programs
pub mod programs;

/// Kernel version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Kernel name
pub const NAME: &str = "coopkern";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(NAME, "coopkern");
        assert!(!VERSION.is_empty());
    }
}

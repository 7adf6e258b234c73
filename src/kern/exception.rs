//! Exception Dispatcher
//!
//! The single entry point from user mode. Each trap is classified once:
//!
//! - `NoException`: back to system mode, nothing else
//! - `PageFault`: page the faulting address in; the instruction retries
//! - `Syscall`: demultiplex through the syscall table
//! - everything else, including tags with no [`ExceptionType`]: fatal,
//!   the machine halts

use log::{debug, error, warn};

use super::kernel::{HaltReason, Kernel};
use super::syscall_sw::{SyscallArgs, SyscallEntry, SyscallOutcome};
use crate::error::CopyError;
use crate::interrupt::MachineStatus;
use crate::machine::{ExceptionType, Machine, BAD_VADDR_REG, RESULT_REG};
use core::sync::atomic::Ordering;

/// What one trap did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapOutcome {
    /// Nothing to handle
    Resume,
    /// Page populated; the faulting instruction runs again
    Retry,
    /// Syscall serviced, result written and PC advanced
    Handled,
    /// Declared syscall with no implementation; PC advanced only
    Unimplemented,
    /// Syscall code not in the table; PC left in place
    Unexpected,
    /// The machine halted
    Halted,
}

impl<M: Machine> Kernel<M> {
    /// Dispatch a raw classification tag
    pub fn handle_raw_exception(&mut self, raw: u32) -> TrapOutcome {
        match ExceptionType::from_raw(raw) {
            Some(which) => self.handle_exception(which),
            None => {
                error!("Unexpected user mode exception {}", raw);
                self.halt(HaltReason::UnknownException(raw));
                TrapOutcome::Halted
            }
        }
    }

    pub fn handle_exception(&mut self, which: ExceptionType) -> TrapOutcome {
        match which {
            ExceptionType::NoException => {
                self.interrupt.set_status(MachineStatus::SystemMode);
                TrapOutcome::Resume
            }
            ExceptionType::PageFault => self.handle_page_fault(),
            ExceptionType::Syscall => self.dispatch_syscall(),
            ExceptionType::ReadOnly
            | ExceptionType::BusError
            | ExceptionType::AddressError
            | ExceptionType::Overflow
            | ExceptionType::IllegalInstr => {
                error!("Error {} occurs", which.name());
                self.halt(HaltReason::Fatal(which));
                TrapOutcome::Halted
            }
        }
    }

    fn handle_page_fault(&mut self) -> TrapOutcome {
        let vaddr = self.machine.read_register(BAD_VADDR_REG) as u32;
        let space = self
            .scheduler
            .current()
            .and_then(|current| self.threads.get_mut(current))
            .and_then(|thread| thread.space.as_mut());
        let Some(space) = space else {
            error!(target: "addr", "page fault at {:#x} with no address space", vaddr);
            self.halt(HaltReason::Fatal(ExceptionType::PageFault));
            return TrapOutcome::Halted;
        };
        match self
            .pager
            .handle(vaddr, space, self.machine.memory_mut(), &mut self.frames)
        {
            Ok(_) => TrapOutcome::Retry,
            Err(err) => {
                error!(target: "addr", "page fault at {:#x}: {}", vaddr, err);
                self.halt(HaltReason::PagingFailure(err));
                TrapOutcome::Halted
            }
        }
    }

    fn dispatch_syscall(&mut self) -> TrapOutcome {
        let args = SyscallArgs::from_machine(&self.machine);
        let stats = self.syscalls.stats();
        stats.total_calls.fetch_add(1, Ordering::Relaxed);

        match self.syscalls.lookup(args.code) {
            None => {
                stats.unexpected_calls.fetch_add(1, Ordering::Relaxed);
                warn!(target: "sys", "Unexpected system call {}", args.code);
                TrapOutcome::Unexpected
            }
            Some(SyscallEntry::Unimplemented { name }) => {
                stats.unimplemented_calls.fetch_add(1, Ordering::Relaxed);
                debug!(target: "sys", "{} is not implemented", name);
                self.machine.advance_pc();
                TrapOutcome::Unimplemented
            }
            Some(SyscallEntry::Implemented { name, handler }) => {
                debug!(target: "sys", "{} {:?}", name, args.args);
                self.in_handler = true;
                let outcome = handler(self, &args);
                self.in_handler = false;
                match outcome {
                    SyscallOutcome::Return(value) => {
                        self.machine.write_register(RESULT_REG, value);
                        self.machine.advance_pc();
                    }
                    SyscallOutcome::ReturnThen(value, action) => {
                        self.machine.write_register(RESULT_REG, value);
                        self.machine.advance_pc();
                        self.reschedule(action);
                    }
                    SyscallOutcome::Halted => {
                        self.timer_deferred = false;
                        return TrapOutcome::Halted;
                    }
                }
                if core::mem::take(&mut self.timer_deferred) {
                    self.timer_interrupt();
                }
                TrapOutcome::Handled
            }
        }
    }

    /// A user copy failed: -1 for a bad user address, a halt when paging
    /// itself broke
    pub(crate) fn copy_failed(&mut self, syscall: &str, err: CopyError) -> SyscallOutcome {
        match err {
            CopyError::Fault(fault) => {
                error!(target: "addr", "{}: {}", syscall, fault);
                self.halt(HaltReason::PagingFailure(fault));
                SyscallOutcome::Halted
            }
            other => {
                warn!(target: "sys", "{}: {}", syscall, other);
                SyscallOutcome::Return(-1)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{KernelConfig, INSTRUCTION_WIDTH};
    use crate::kern::services::{ImageRegistry, Services};
    use crate::kern::syscall_sw::{SC_ADD, SC_CREATE, SC_GET_PID};
    use crate::machine::{SimMachine, ARG_REGS, NEXT_PC_REG, PC_REG, PREV_PC_REG, SYSCALL_CODE_REG};
    use crate::vm::ExecutableImage;
    use alloc::string::ToString;
    use alloc::vec;

    /// Kernel with one process dispatched and its registers loaded
    fn running_kernel() -> Kernel<SimMachine> {
        let mut programs = ImageRegistry::new();
        programs.register("idle", ExecutableImage::builder().code(vec![0; 16]).build());
        let config = KernelConfig::default();
        let machine = SimMachine::new(config.page_size, config.num_phys_pages);
        let (services, _) = Services::in_memory(b"", programs);
        let mut kernel = Kernel::new(machine, config, services).unwrap();
        kernel.boot("idle").unwrap();
        let next = kernel.scheduler.find_next_to_run(&kernel.threads);
        kernel
            .scheduler
            .run(&mut kernel.threads, &mut kernel.machine, next, false);
        kernel
    }

    fn trap(kernel: &mut Kernel<SimMachine>, code: i32, args: [i32; 4]) -> TrapOutcome {
        kernel.machine.write_register(SYSCALL_CODE_REG, code);
        for (reg, value) in ARG_REGS.iter().zip(args) {
            kernel.machine.write_register(*reg, value);
        }
        kernel.handle_exception(ExceptionType::Syscall)
    }

    fn pcs(kernel: &Kernel<SimMachine>) -> (i32, i32, i32) {
        let m = &kernel.machine;
        (m.read_register(PREV_PC_REG), m.read_register(PC_REG), m.read_register(NEXT_PC_REG))
    }

    #[test]
    fn test_handled_syscall_writes_result_and_advances() {
        let mut kernel = running_kernel();
        assert_eq!(pcs(&kernel), (0, 0, 4));
        assert_eq!(trap(&mut kernel, SC_ADD, [40, 2, 0, 0]), TrapOutcome::Handled);
        assert_eq!(kernel.machine.read_register(RESULT_REG), 42);
        assert_eq!(pcs(&kernel), (0, 4, 4 + INSTRUCTION_WIDTH));

        assert_eq!(trap(&mut kernel, SC_GET_PID, [0; 4]), TrapOutcome::Handled);
        assert_eq!(kernel.machine.read_register(RESULT_REG), 0);
    }

    /// Lets a full timer interval elapse with interrupts masked
    fn masked_wait<M: Machine>(kernel: &mut Kernel<M>, _args: &SyscallArgs) -> SyscallOutcome {
        let old = kernel.interrupts_off();
        for _ in 0..2 * kernel.config.timer_interval {
            kernel.interrupt.one_tick();
        }
        kernel.restore_interrupts(old);
        SyscallOutcome::Return(99)
    }

    #[test]
    fn test_timer_due_in_handler_waits_for_result() {
        let mut kernel = running_kernel();
        kernel.syscalls.implement(70, "MaskedWait", masked_wait);
        kernel.spawn("idle".to_string(), None).unwrap();
        let first = kernel.scheduler.current().unwrap();

        assert_eq!(trap(&mut kernel, 70, [0; 4]), TrapOutcome::Handled);
        assert_ne!(kernel.scheduler.current(), Some(first));
        assert!(!kernel.timer_deferred);
        let saved = &kernel.threads.get(first).unwrap().context;
        assert_eq!(saved[RESULT_REG], 99);
        assert_eq!(saved[PC_REG], 4);
    }

    #[test]
    fn test_unknown_syscall_changes_nothing() {
        let mut kernel = running_kernel();
        assert_eq!(trap(&mut kernel, 77, [0; 4]), TrapOutcome::Unexpected);
        assert_eq!(pcs(&kernel), (0, 0, 4));
        assert_eq!(kernel.machine.read_register(RESULT_REG), 77);
        assert!(!kernel.is_halted());
        assert_eq!(kernel.syscalls.stats().snapshot().unexpected_calls, 1);
    }

    #[test]
    fn test_unimplemented_syscall_only_advances() {
        let mut kernel = running_kernel();
        assert_eq!(trap(&mut kernel, SC_CREATE, [0; 4]), TrapOutcome::Unimplemented);
        assert_eq!(pcs(&kernel), (0, 4, 8));
        assert_eq!(kernel.machine.read_register(RESULT_REG), SC_CREATE);
        assert!(!kernel.is_halted());
    }

    #[test]
    fn test_fatal_exceptions_halt() {
        for which in [
            ExceptionType::ReadOnly,
            ExceptionType::BusError,
            ExceptionType::AddressError,
            ExceptionType::Overflow,
            ExceptionType::IllegalInstr,
        ] {
            let mut kernel = running_kernel();
            assert_eq!(kernel.handle_exception(which), TrapOutcome::Halted);
            assert!(kernel.is_halted());
            assert_eq!(kernel.halt_reason(), Some(&HaltReason::Fatal(which)));
        }
    }

    #[test]
    fn test_unknown_tag_is_fatal() {
        let mut kernel = running_kernel();
        assert_eq!(kernel.handle_raw_exception(42), TrapOutcome::Halted);
        assert_eq!(kernel.halt_reason(), Some(&HaltReason::UnknownException(42)));
    }

    #[test]
    fn test_no_exception_returns_to_system_mode() {
        let mut kernel = running_kernel();
        kernel.interrupt.set_status(MachineStatus::UserMode);
        assert_eq!(kernel.handle_raw_exception(0), TrapOutcome::Resume);
        assert_eq!(kernel.interrupt.status(), MachineStatus::SystemMode);
    }

    #[test]
    fn test_page_fault_retries_without_advancing() {
        let mut kernel = running_kernel();
        kernel.machine.write_register(BAD_VADDR_REG, 300);
        assert_eq!(kernel.handle_exception(ExceptionType::PageFault), TrapOutcome::Retry);
        assert_eq!(pcs(&kernel), (0, 0, 4));
        assert_eq!(kernel.frames.num_free(), kernel.frames.num_frames() - 1);
    }

    #[test]
    fn test_page_fault_beyond_space_halts() {
        let mut kernel = running_kernel();
        kernel.machine.write_register(BAD_VADDR_REG, 0x7fff_0000);
        assert_eq!(kernel.handle_exception(ExceptionType::PageFault), TrapOutcome::Halted);
        assert!(matches!(kernel.halt_reason(), Some(HaltReason::PagingFailure(_))));
    }
}

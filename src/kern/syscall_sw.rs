//! System Call Switch
//!
//! Maps syscall codes to handlers. Every code lands in one of three
//! buckets:
//!
//! - implemented: the handler runs, its result goes to r2 and the PC
//!   advances
//! - unimplemented: declared in the ABI but not serviced; logged and the
//!   PC advances
//! - unknown: not in the table at all; logged, PC left in place
//!
//! ## Codes
//!
//! - 0-15: process control and file I/O (Halt, Exit, Exec, Join, Create,
//!   Remove, Open, Read, Write, Seek, Close, and the generic thread calls)
//! - 42-57: console I/O, semaphores, GetPid, ThreadSleep and clone-style
//!   ThreadFork

use alloc::collections::BTreeMap;
use core::sync::atomic::{AtomicU64, Ordering};

use super::kernel::Kernel;
use super::{sys_io, sys_proc};
use crate::machine::{Machine, ARG_REGS, SYSCALL_CODE_REG};
use crate::types::VirtAddr;

// ============================================================================
// Syscall Codes
// ============================================================================

pub const SC_HALT: i32 = 0;
pub const SC_EXIT: i32 = 1;
pub const SC_EXEC: i32 = 2;
pub const SC_JOIN: i32 = 3;
pub const SC_CREATE: i32 = 4;
pub const SC_REMOVE: i32 = 5;
pub const SC_OPEN: i32 = 6;
pub const SC_READ: i32 = 7;
pub const SC_WRITE: i32 = 8;
pub const SC_SEEK: i32 = 9;
pub const SC_CLOSE: i32 = 10;
pub const SC_THREAD_FORK: i32 = 11;
pub const SC_THREAD_YIELD: i32 = 12;
pub const SC_EXEC_V: i32 = 13;
pub const SC_THREAD_EXIT: i32 = 14;
pub const SC_THREAD_JOIN: i32 = 15;

pub const SC_ADD: i32 = 42;
pub const SC_READ_NUM: i32 = 43;
pub const SC_PRINT_NUM: i32 = 44;
pub const SC_READ_CHAR: i32 = 45;
pub const SC_PRINT_CHAR: i32 = 46;
pub const SC_RANDOM_NUM: i32 = 47;
pub const SC_READ_STRING: i32 = 48;
pub const SC_PRINT_STRING: i32 = 49;
pub const SC_CREATE_FILE: i32 = 50;
pub const SC_CREATE_SEMAPHORE: i32 = 51;
pub const SC_WAIT: i32 = 52;
pub const SC_SIGNAL: i32 = 53;
pub const SC_GET_PID: i32 = 54;
pub const SC_PRINT_STRING_UC: i32 = 55;
pub const SC_THREAD_SLEEP: i32 = 56;
/// Clone-style fork: 0 in the child, the child's pid in the parent
pub const SC_FORK: i32 = 57;

// ============================================================================
// Arguments and Results
// ============================================================================

/// Syscall code and the four argument registers, read at trap entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyscallArgs {
    pub code: i32,
    pub args: [i32; 4],
}

impl SyscallArgs {
    pub fn new(code: i32, args: [i32; 4]) -> Self {
        Self { code, args }
    }

    pub fn from_machine<M: Machine + ?Sized>(machine: &M) -> Self {
        Self {
            code: machine.read_register(SYSCALL_CODE_REG),
            args: ARG_REGS.map(|reg| machine.read_register(reg)),
        }
    }

    pub fn arg(&self, index: usize) -> i32 {
        self.args.get(index).copied().unwrap_or(0)
    }

    /// Argument reinterpreted as a user virtual address
    pub fn addr(&self, index: usize) -> VirtAddr {
        self.arg(index) as VirtAddr
    }
}

/// What happens to the calling thread after its result is written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reschedule {
    /// Sleep for this many timer ticks
    Sleep(u32),
    /// Leave the CPU until another thread readies the caller
    Block,
    /// Finish the caller with this exit code
    Exit(i32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallOutcome {
    /// Write the value to r2 and advance the PC
    Return(i32),
    /// As `Return`, then switch the caller out
    ReturnThen(i32, Reschedule),
    /// The machine halted; nothing is written
    Halted,
}

/// Handler function signature
pub type SyscallHandler<M> = fn(&mut Kernel<M>, &SyscallArgs) -> SyscallOutcome;

// ============================================================================
// Syscall Table
// ============================================================================

pub enum SyscallEntry<M: Machine> {
    Implemented {
        name: &'static str,
        handler: SyscallHandler<M>,
    },
    /// Declared in the ABI but not serviced
    Unimplemented { name: &'static str },
}

impl<M: Machine> SyscallEntry<M> {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Implemented { name, .. } | Self::Unimplemented { name } => name,
        }
    }
}

impl<M: Machine> Clone for SyscallEntry<M> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<M: Machine> Copy for SyscallEntry<M> {}

impl<M: Machine> core::fmt::Debug for SyscallEntry<M> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Implemented { name, .. } => f.debug_struct("Implemented").field("name", name).finish(),
            Self::Unimplemented { name } => f.debug_struct("Unimplemented").field("name", name).finish(),
        }
    }
}

/// Syscall statistics
#[derive(Debug)]
pub struct TrapStats {
    /// Total syscalls dispatched
    pub total_calls: AtomicU64,
    /// Calls to unimplemented codes
    pub unimplemented_calls: AtomicU64,
    /// Calls to codes not in the table
    pub unexpected_calls: AtomicU64,
}

impl TrapStats {
    pub const fn new() -> Self {
        Self {
            total_calls: AtomicU64::new(0),
            unimplemented_calls: AtomicU64::new(0),
            unexpected_calls: AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self) -> TrapStatsSnapshot {
        TrapStatsSnapshot {
            total_calls: self.total_calls.load(Ordering::Relaxed),
            unimplemented_calls: self.unimplemented_calls.load(Ordering::Relaxed),
            unexpected_calls: self.unexpected_calls.load(Ordering::Relaxed),
        }
    }
}

impl Default for TrapStats {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrapStatsSnapshot {
    pub total_calls: u64,
    pub unimplemented_calls: u64,
    pub unexpected_calls: u64,
}

pub struct SyscallTable<M: Machine> {
    entries: BTreeMap<i32, SyscallEntry<M>>,
    stats: TrapStats,
}

impl<M: Machine> SyscallTable<M> {
    /// A table with no codes at all
    pub fn empty() -> Self {
        Self {
            entries: BTreeMap::new(),
            stats: TrapStats::new(),
        }
    }

    /// The full kernel ABI
    pub fn standard() -> Self {
        let mut table = Self::empty();

        table.implement(SC_HALT, "Halt", sys_proc::halt);
        table.implement(SC_EXIT, "Exit", sys_proc::exit);
        table.implement(SC_EXEC, "Exec", sys_proc::exec);
        table.implement(SC_JOIN, "Join", sys_proc::join);
        table.unimplemented(SC_CREATE, "Create");
        table.unimplemented(SC_REMOVE, "Remove");
        table.implement(SC_OPEN, "Open", sys_io::open);
        table.implement(SC_READ, "Read", sys_io::read);
        table.implement(SC_WRITE, "Write", sys_io::write);
        table.implement(SC_SEEK, "Seek", sys_io::seek);
        table.implement(SC_CLOSE, "Close", sys_io::close);
        table.unimplemented(SC_THREAD_FORK, "ThreadFork");
        table.unimplemented(SC_THREAD_YIELD, "ThreadYield");
        table.unimplemented(SC_EXEC_V, "ExecV");
        table.unimplemented(SC_THREAD_EXIT, "ThreadExit");
        table.unimplemented(SC_THREAD_JOIN, "ThreadJoin");

        table.implement(SC_ADD, "Add", sys_io::add);
        table.implement(SC_READ_NUM, "ReadNum", sys_io::read_num);
        table.implement(SC_PRINT_NUM, "PrintNum", sys_io::print_num);
        table.implement(SC_READ_CHAR, "ReadChar", sys_io::read_char);
        table.implement(SC_PRINT_CHAR, "PrintChar", sys_io::print_char);
        table.implement(SC_RANDOM_NUM, "RandomNum", sys_io::random_num);
        table.implement(SC_READ_STRING, "ReadString", sys_io::read_string);
        table.implement(SC_PRINT_STRING, "PrintString", sys_io::print_string);
        table.implement(SC_CREATE_FILE, "CreateFile", sys_io::create_file);
        table.implement(SC_CREATE_SEMAPHORE, "CreateSemaphore", sys_proc::create_semaphore);
        table.implement(SC_WAIT, "Wait", sys_proc::wait);
        table.implement(SC_SIGNAL, "Signal", sys_proc::signal);
        table.implement(SC_GET_PID, "GetPid", sys_proc::get_pid);
        table.implement(SC_PRINT_STRING_UC, "PrintStringUC", sys_io::print_string_uc);
        table.implement(SC_THREAD_SLEEP, "ThreadSleep", sys_proc::thread_sleep);
        table.implement(SC_FORK, "ThreadFork", sys_proc::fork);

        table
    }

    /// Install or replace the entry for `code`
    pub fn register(&mut self, code: i32, entry: SyscallEntry<M>) -> Option<SyscallEntry<M>> {
        self.entries.insert(code, entry)
    }

    pub fn implement(&mut self, code: i32, name: &'static str, handler: SyscallHandler<M>) {
        self.register(code, SyscallEntry::Implemented { name, handler });
    }

    pub fn unimplemented(&mut self, code: i32, name: &'static str) {
        self.register(code, SyscallEntry::Unimplemented { name });
    }

    pub fn lookup(&self, code: i32) -> Option<SyscallEntry<M>> {
        self.entries.get(&code).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> &TrapStats {
        &self.stats
    }
}

impl<M: Machine> Default for SyscallTable<M> {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::SimMachine;

    fn forty_two(_kernel: &mut Kernel<SimMachine>, _args: &SyscallArgs) -> SyscallOutcome {
        SyscallOutcome::Return(42)
    }

    #[test]
    fn test_standard_buckets() {
        let table = SyscallTable::<SimMachine>::standard();
        assert_eq!(table.len(), 32);
        for code in [SC_CREATE, SC_REMOVE, SC_THREAD_FORK, SC_THREAD_YIELD, SC_EXEC_V, SC_THREAD_EXIT, SC_THREAD_JOIN] {
            assert!(matches!(table.lookup(code), Some(SyscallEntry::Unimplemented { .. })));
        }
        for code in (SC_ADD..=SC_FORK).chain([SC_HALT, SC_EXIT, SC_EXEC, SC_JOIN, SC_OPEN, SC_CLOSE]) {
            assert!(matches!(table.lookup(code), Some(SyscallEntry::Implemented { .. })));
        }
        assert!(table.lookup(16).is_none());
        assert!(table.lookup(-1).is_none());
        assert_eq!(table.lookup(SC_FORK).unwrap().name(), "ThreadFork");
    }

    #[test]
    fn test_register_replaces() {
        let mut table = SyscallTable::<SimMachine>::empty();
        assert!(table.is_empty());
        table.implement(99, "FortyTwo", forty_two);
        let old = table.register(99, SyscallEntry::Unimplemented { name: "Gone" });
        assert_eq!(old.unwrap().name(), "FortyTwo");
        assert_eq!(table.lookup(99).unwrap().name(), "Gone");
    }

    #[test]
    fn test_args_from_machine() {
        let mut machine = SimMachine::new(128, 1);
        machine.write_register(SYSCALL_CODE_REG, SC_ADD);
        for (i, reg) in ARG_REGS.iter().enumerate() {
            machine.write_register(*reg, 10 + i as i32);
        }
        let args = SyscallArgs::from_machine(&machine);
        assert_eq!(args, SyscallArgs::new(SC_ADD, [10, 11, 12, 13]));
        assert_eq!(args.arg(7), 0);
        assert_eq!(SyscallArgs::new(0, [-1, 0, 0, 0]).addr(0), u32::MAX);
    }
}

//! Kern subsystem - Core kernel primitives
//!
//! Threads and processes, the syscall switch and its handlers, the
//! exception dispatcher, user/kernel copies, and the kernel context that
//! ties them to the machine.

pub mod copyio;
pub mod exception;
pub mod kernel;
pub mod process;
pub mod services;
pub mod sys_io;
pub mod sys_proc;
pub mod syscall_sw;
pub mod thread;

pub use copyio::{copyin, copyin_string, copyout, FlatMemory, UserMemory};
pub use exception::TrapOutcome;
pub use kernel::{HaltReason, Kernel, RunOutcome};
pub use process::{JoinStatus, ProcessTable};
pub use services::{
    BufferConsole, ConsoleIo, FileSystem, ImageRegistry, MemFileSystem, OutputHandle, ProgramLoader, SemaphoreTable,
    Services, SyncRegistry,
};
pub use syscall_sw::{SyscallArgs, SyscallEntry, SyscallOutcome, SyscallTable};
pub use thread::{Thread, ThreadState, ThreadTable};

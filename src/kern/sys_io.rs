//! Console and file syscalls
//!
//! Arithmetic, console numbers/characters/strings, and the file calls
//! (CreateFile, Open, Close, Read, Write, Seek). Ids 0 and 1 are the
//! console and never reach the file system.

use alloc::string::String;
use log::{debug, error};

use super::kernel::{HaltReason, Kernel};
use super::services::{OpenMode, STDIN, STDOUT};
use super::syscall_sw::{SyscallArgs, SyscallOutcome};
use crate::machine::Machine;

/// Decode a user string argument, or bail out of the handler
macro_rules! user_string {
    ($kernel:expr, $args:expr, $index:expr, $syscall:literal) => {
        match $kernel.copyin_string($args.addr($index)) {
            Ok(bytes) => bytes,
            Err(err) => return $kernel.copy_failed($syscall, err),
        }
    };
}

pub(crate) use user_string;

// ============================================================================
// Arithmetic and Console
// ============================================================================

pub fn add<M: Machine>(_kernel: &mut Kernel<M>, args: &SyscallArgs) -> SyscallOutcome {
    SyscallOutcome::Return(args.arg(0).wrapping_add(args.arg(1)))
}

pub fn read_num<M: Machine>(kernel: &mut Kernel<M>, _args: &SyscallArgs) -> SyscallOutcome {
    SyscallOutcome::Return(kernel.services.console.read_num())
}

pub fn print_num<M: Machine>(kernel: &mut Kernel<M>, args: &SyscallArgs) -> SyscallOutcome {
    kernel.services.console.print_num(args.arg(0));
    SyscallOutcome::Return(0)
}

pub fn read_char<M: Machine>(kernel: &mut Kernel<M>, _args: &SyscallArgs) -> SyscallOutcome {
    let c = kernel.services.console.read_char().unwrap_or(0);
    // Bytes above 0x7f come back negative, as a signed char would
    SyscallOutcome::Return(i32::from(c as i8))
}

pub fn print_char<M: Machine>(kernel: &mut Kernel<M>, args: &SyscallArgs) -> SyscallOutcome {
    kernel.services.console.print_char(args.arg(0) as u8);
    SyscallOutcome::Return(0)
}

pub fn random_num<M: Machine>(kernel: &mut Kernel<M>, _args: &SyscallArgs) -> SyscallOutcome {
    SyscallOutcome::Return(kernel.rng.next_positive())
}

/// ReadString(buffer, length): a length over the limit halts the machine
pub fn read_string<M: Machine>(kernel: &mut Kernel<M>, args: &SyscallArgs) -> SyscallOutcome {
    let length = args.arg(1);
    if length > kernel.config.max_read_string as i32 {
        error!(target: "sys", "String length exceeds {}", kernel.config.max_read_string);
        kernel.halt(HaltReason::ReadStringTooLong(length));
        return SyscallOutcome::Halted;
    }
    let Ok(length) = usize::try_from(length) else {
        return SyscallOutcome::Return(-1);
    };
    let input = kernel.services.console.read_string(length);
    match kernel.copyout(args.addr(0), &input) {
        Ok(()) => SyscallOutcome::Return(0),
        Err(err) => kernel.copy_failed("ReadString", err),
    }
}

pub fn print_string<M: Machine>(kernel: &mut Kernel<M>, args: &SyscallArgs) -> SyscallOutcome {
    let text = user_string!(kernel, args, 0, "PrintString");
    kernel.services.console.print_string(&text);
    SyscallOutcome::Return(0)
}

/// PrintString with ASCII a-z raised to upper case
pub fn print_string_uc<M: Machine>(kernel: &mut Kernel<M>, args: &SyscallArgs) -> SyscallOutcome {
    let mut text = user_string!(kernel, args, 0, "PrintStringUC");
    text.make_ascii_uppercase();
    kernel.services.console.print_string(&text);
    SyscallOutcome::Return(0)
}

// ============================================================================
// Files
// ============================================================================

fn file_name(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// CreateFile(name): 0 or -1
pub fn create_file<M: Machine>(kernel: &mut Kernel<M>, args: &SyscallArgs) -> SyscallOutcome {
    let name = file_name(&user_string!(kernel, args, 0, "CreateFile"));
    if kernel.services.files.create(&name) {
        debug!(target: "file", "created {:?}", name);
        SyscallOutcome::Return(0)
    } else {
        debug!(target: "file", "cannot create {:?}", name);
        SyscallOutcome::Return(-1)
    }
}

/// Open(name, type): the new id or -1
pub fn open<M: Machine>(kernel: &mut Kernel<M>, args: &SyscallArgs) -> SyscallOutcome {
    let name = file_name(&user_string!(kernel, args, 0, "Open"));
    let Some(mode) = OpenMode::from_raw(args.arg(1)) else {
        return SyscallOutcome::Return(-1);
    };
    let id = kernel.services.files.open(&name, mode).unwrap_or(-1);
    debug!(target: "file", "Open {:?} -> {}", name, id);
    SyscallOutcome::Return(id)
}

/// Close(id): 0 or -1
pub fn close<M: Machine>(kernel: &mut Kernel<M>, args: &SyscallArgs) -> SyscallOutcome {
    let id = args.arg(0);
    let closed = id != STDIN && id != STDOUT && kernel.services.files.close(id);
    SyscallOutcome::Return(if closed { 0 } else { -1 })
}

/// Read(buffer, count, id): bytes read or -1
///
/// The whole `count`-byte buffer is copied back out, plus a NUL, however
/// many bytes the read produced.
pub fn read<M: Machine>(kernel: &mut Kernel<M>, args: &SyscallArgs) -> SyscallOutcome {
    let (vaddr, count, id) = (args.addr(0), args.arg(1), args.arg(2));
    let mut buffer = match kernel.copyin(vaddr, count) {
        Ok(buffer) => buffer,
        Err(err) => return kernel.copy_failed("Read", err),
    };
    debug!(target: "file", "Read {} chars from file {}", count, id);

    let result = match id {
        STDIN => {
            let input = kernel.services.console.read_string(buffer.len());
            let n = input.len().min(buffer.len());
            buffer[..n].copy_from_slice(&input[..n]);
            n as i32
        }
        STDOUT => -1,
        _ => kernel
            .services
            .files
            .read(id, &mut buffer)
            .map_or(-1, |n| n as i32),
    };

    match kernel.copyout(vaddr, &buffer) {
        Ok(()) => SyscallOutcome::Return(result),
        Err(err) => kernel.copy_failed("Read", err),
    }
}

/// Write(buffer, count, id): bytes written or -1
pub fn write<M: Machine>(kernel: &mut Kernel<M>, args: &SyscallArgs) -> SyscallOutcome {
    let (vaddr, count, id) = (args.addr(0), args.arg(1), args.arg(2));
    let buffer = match kernel.copyin(vaddr, count) {
        Ok(buffer) => buffer,
        Err(err) => return kernel.copy_failed("Write", err),
    };
    debug!(target: "file", "Write {} chars to file {}", count, id);

    let result = match id {
        STDOUT => {
            kernel.services.console.print_string(&buffer);
            buffer.len() as i32
        }
        STDIN => -1,
        _ => kernel
            .services
            .files
            .write(id, &buffer)
            .map_or(-1, |n| n as i32),
    };

    match kernel.copyout(vaddr, &buffer) {
        Ok(()) => SyscallOutcome::Return(result),
        Err(err) => kernel.copy_failed("Write", err),
    }
}

/// Seek(position, id): the new position or -1; -1 seeks to the end
pub fn seek<M: Machine>(kernel: &mut Kernel<M>, args: &SyscallArgs) -> SyscallOutcome {
    let (pos, id) = (args.arg(0), args.arg(1));
    if id == STDIN || id == STDOUT {
        return SyscallOutcome::Return(-1);
    }
    SyscallOutcome::Return(kernel.services.files.seek(id, pos).unwrap_or(-1))
}

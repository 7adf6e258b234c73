//! Process, thread and semaphore syscalls

use alloc::string::String;
use log::{info, warn};

use super::kernel::{HaltReason, Kernel};
use super::process::JoinStatus;
use super::services::{SignalOutcome, WaitOutcome};
use super::sys_io::user_string;
use super::syscall_sw::{Reschedule, SyscallArgs, SyscallOutcome};
use crate::machine::Machine;
use crate::types::ProcessId;

pub fn halt<M: Machine>(kernel: &mut Kernel<M>, _args: &SyscallArgs) -> SyscallOutcome {
    info!(target: "sys", "Shutdown, initiated by user program");
    kernel.halt(HaltReason::UserRequest);
    SyscallOutcome::Halted
}

/// Exit(code): never returns to the caller
pub fn exit<M: Machine>(_kernel: &mut Kernel<M>, args: &SyscallArgs) -> SyscallOutcome {
    let code = args.arg(0);
    SyscallOutcome::ReturnThen(code, Reschedule::Exit(code))
}

/// Exec(name): the child's pid or -1
pub fn exec<M: Machine>(kernel: &mut Kernel<M>, args: &SyscallArgs) -> SyscallOutcome {
    let name = user_string!(kernel, args, 0, "Exec");
    let name = String::from_utf8_lossy(&name).into_owned();
    let parent = kernel.current_pid();
    match kernel.spawn(name, parent) {
        Ok(pid) => SyscallOutcome::Return(pid.0),
        Err(err) => {
            warn!(target: "sys", "Exec: {}", err);
            SyscallOutcome::Return(-1)
        }
    }
}

/// Join(pid): the child's exit code, or -1 if it is not our child
pub fn join<M: Machine>(kernel: &mut Kernel<M>, args: &SyscallArgs) -> SyscallOutcome {
    let (Some(caller), Some(thread)) = (kernel.current_pid(), kernel.current_thread()) else {
        return SyscallOutcome::Return(-1);
    };
    match kernel.processes.join(caller, ProcessId(args.arg(0)), thread) {
        JoinStatus::Invalid => SyscallOutcome::Return(-1),
        JoinStatus::Finished(code) => SyscallOutcome::Return(code),
        // The exit code lands in r2 when the child exits
        JoinStatus::Wait => SyscallOutcome::ReturnThen(0, Reschedule::Block),
    }
}

pub fn get_pid<M: Machine>(kernel: &mut Kernel<M>, _args: &SyscallArgs) -> SyscallOutcome {
    SyscallOutcome::Return(kernel.current_pid().map_or(-1, |pid| pid.0))
}

/// ThreadSleep(ticks): sleep for that many timer interrupts
pub fn thread_sleep<M: Machine>(_kernel: &mut Kernel<M>, args: &SyscallArgs) -> SyscallOutcome {
    let ticks = u32::try_from(args.arg(0)).unwrap_or(0);
    SyscallOutcome::ReturnThen(0, Reschedule::Sleep(ticks))
}

/// ThreadFork(): 0 in the clone, the clone's pid (or -1) in the caller
pub fn fork<M: Machine>(kernel: &mut Kernel<M>, _args: &SyscallArgs) -> SyscallOutcome {
    let Some(current) = kernel.current_thread() else {
        return SyscallOutcome::Return(-1);
    };
    if let Some(thread) = kernel.threads.get_mut(current) {
        if thread.is_clone {
            thread.is_clone = false;
            return SyscallOutcome::Return(0);
        }
    }
    match kernel.fork_current() {
        Ok(pid) => SyscallOutcome::Return(pid.0),
        Err(err) => {
            warn!(target: "sys", "ThreadFork: {}", err);
            SyscallOutcome::Return(-1)
        }
    }
}

// ============================================================================
// Semaphores
// ============================================================================

fn sem_name(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// CreateSemaphore(name, value): 0 or -1
pub fn create_semaphore<M: Machine>(kernel: &mut Kernel<M>, args: &SyscallArgs) -> SyscallOutcome {
    let name = sem_name(&user_string!(kernel, args, 0, "CreateSemaphore"));
    let created = kernel.services.sync.create(&name, args.arg(1));
    SyscallOutcome::Return(if created { 0 } else { -1 })
}

/// Wait(name): 0 once the semaphore is taken, -1 for an unknown name
pub fn wait<M: Machine>(kernel: &mut Kernel<M>, args: &SyscallArgs) -> SyscallOutcome {
    let name = sem_name(&user_string!(kernel, args, 0, "Wait"));
    let Some(thread) = kernel.current_thread() else {
        return SyscallOutcome::Return(-1);
    };
    match kernel.services.sync.wait(&name, thread) {
        WaitOutcome::Acquired => SyscallOutcome::Return(0),
        WaitOutcome::MustBlock => SyscallOutcome::ReturnThen(0, Reschedule::Block),
        WaitOutcome::Unknown => SyscallOutcome::Return(-1),
    }
}

/// Signal(name): 0 or -1 for an unknown name
pub fn signal<M: Machine>(kernel: &mut Kernel<M>, args: &SyscallArgs) -> SyscallOutcome {
    let name = sem_name(&user_string!(kernel, args, 0, "Signal"));
    match kernel.services.sync.signal(&name) {
        SignalOutcome::Released(waiter) => {
            if let Some(waiter) = waiter {
                kernel.make_ready(waiter);
            }
            SyscallOutcome::Return(0)
        }
        SignalOutcome::Unknown => SyscallOutcome::Return(-1),
    }
}

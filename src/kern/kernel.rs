//! Kernel context and run loop
//!
//! [`Kernel`] is built once and owns every piece of kernel state: the
//! machine, the interrupt controller, the scheduler and thread arena, the
//! frame allocator and pager, the process table, the syscall table and the
//! external services. The dispatcher and the syscall handlers receive it
//! by `&mut` instead of reaching for globals.
//!
//! The run loop single-steps the current thread, dispatches whatever
//! exception the step raised, then advances the clock one tick. A switch
//! takes effect at the next step: the machine's registers always belong
//! to the thread recorded as current.

use alloc::string::{String, ToString};
use alloc::vec::Vec;
use log::{debug, info, warn};

use super::copyio;
use super::process::ProcessTable;
use super::services::{Rng, Services};
use super::syscall_sw::{Reschedule, SyscallTable};
use super::thread::{ThreadState, ThreadTable};
use crate::config::KernelConfig;
use crate::error::{ConfigError, CopyError, FaultError, SpawnError};
use crate::interrupt::{IntLevel, InterruptController, MachineStatus};
use crate::machine::{ExceptionType, Machine, RESULT_REG};
use crate::scheduler::Scheduler;
use crate::types::{ProcessId, ThreadId, VirtAddr};
use crate::vm::{AddressSpace, FrameAllocator, PageFaultHandler, UserSpace};

/// Why the machine stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HaltReason {
    /// A program called Halt
    UserRequest,
    /// A fatal CPU exception
    Fatal(ExceptionType),
    /// The dispatcher got a classification tag it does not know
    UnknownException(u32),
    /// ReadString asked for more than the configured maximum
    ReadStringTooLong(i32),
    /// A page could not be populated
    PagingFailure(FaultError),
}

/// How [`Kernel::run`] ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every thread finished and nothing is left to run
    AllFinished,
    Halted(HaltReason),
    /// The tick budget ran out
    TickLimit,
    /// Threads remain but all of them are blocked
    Deadlocked,
}

pub struct Kernel<M: Machine> {
    pub(crate) config: KernelConfig,
    pub(crate) machine: M,
    pub(crate) interrupt: InterruptController,
    pub(crate) scheduler: Scheduler,
    pub(crate) threads: ThreadTable,
    pub(crate) frames: FrameAllocator,
    pub(crate) pager: PageFaultHandler,
    pub(crate) processes: ProcessTable,
    pub(crate) syscalls: SyscallTable<M>,
    pub(crate) services: Services,
    pub(crate) rng: Rng,
    /// Set while a syscall handler runs; timer delivery waits for it
    pub(crate) in_handler: bool,
    pub(crate) timer_deferred: bool,
    halt_reason: Option<HaltReason>,
}

impl<M: Machine> Kernel<M> {
    pub fn new(machine: M, config: KernelConfig, services: Services) -> Result<Self, ConfigError> {
        config.validate()?;
        let memory = machine.memory();
        if memory.page_size() != config.page_size {
            return Err(ConfigError::PageSizeMismatch {
                config: config.page_size,
                machine: memory.page_size(),
            });
        }
        let frames = FrameAllocator::new(memory.num_frames());
        info!(
            "kernel: {} frames of {} bytes, {} scheduling, timer every {} ticks",
            memory.num_frames(),
            config.page_size,
            config.policy.name(),
            config.timer_interval
        );
        Ok(Self {
            interrupt: InterruptController::new(config.timer_interval),
            scheduler: Scheduler::new(config.policy),
            threads: ThreadTable::new(),
            frames,
            pager: PageFaultHandler::new(),
            processes: ProcessTable::new(config.max_processes),
            syscalls: SyscallTable::standard(),
            services,
            rng: Rng::new(config.random_seed),
            in_handler: false,
            timer_deferred: false,
            halt_reason: None,
            machine,
            config,
        })
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn machine(&self) -> &M {
        &self.machine
    }

    pub fn machine_mut(&mut self) -> &mut M {
        &mut self.machine
    }

    pub fn interrupt(&self) -> &InterruptController {
        &self.interrupt
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn threads(&self) -> &ThreadTable {
        &self.threads
    }

    pub fn frames(&self) -> &FrameAllocator {
        &self.frames
    }

    pub fn pager(&self) -> &PageFaultHandler {
        &self.pager
    }

    pub fn processes(&self) -> &ProcessTable {
        &self.processes
    }

    pub fn syscalls(&self) -> &SyscallTable<M> {
        &self.syscalls
    }

    /// Swap handlers in or out of the syscall table
    pub fn syscalls_mut(&mut self) -> &mut SyscallTable<M> {
        &mut self.syscalls
    }

    pub fn services_mut(&mut self) -> &mut Services {
        &mut self.services
    }

    pub fn halt_reason(&self) -> Option<&HaltReason> {
        self.halt_reason.as_ref()
    }

    pub fn current_thread(&self) -> Option<ThreadId> {
        self.scheduler.current()
    }

    /// Pid of the running process
    pub fn current_pid(&self) -> Option<ProcessId> {
        let id = self.scheduler.current()?;
        self.threads.get(id).map(|thread| thread.pid)
    }

    // ========================================================================
    // Processes
    // ========================================================================

    /// Start the first program
    pub fn boot(&mut self, name: &str) -> Result<ProcessId, SpawnError> {
        self.spawn(name.to_string(), None)
    }

    /// Load `name` into a new process and make it ready
    ///
    /// The thread takes ownership of `name`.
    pub fn spawn(&mut self, name: String, parent: Option<ProcessId>) -> Result<ProcessId, SpawnError> {
        let image = self
            .services
            .loader
            .load(&name)
            .ok_or_else(|| SpawnError::NoSuchProgram(name.clone()))?;
        let space = AddressSpace::new(image, self.config.page_size, self.config.user_stack_size);

        let tid = self.threads.spawn(name, self.config.default_priority);
        let pid = match self.processes.allocate(tid, parent) {
            Ok(pid) => pid,
            Err(err) => {
                self.threads.remove(tid);
                return Err(err);
            }
        };
        if let Some(thread) = self.threads.get_mut(tid) {
            thread.pid = pid;
            thread.parent = parent;
            thread.context = space.initial_registers();
            thread.space = Some(space);
            debug!(target: "thread", "exec {} as pid {} on {}", thread.name, pid, tid);
        }
        self.make_ready(tid);
        Ok(pid)
    }

    /// Clone the running process: registers plus an eager copy of every
    /// resident page
    ///
    /// The child resumes at the same syscall with its clone flag set.
    pub fn fork_current(&mut self) -> Result<ProcessId, SpawnError> {
        let current = self.scheduler.current().ok_or(SpawnError::NoCurrentThread)?;
        let parent = self.threads.get(current).ok_or(SpawnError::NoCurrentThread)?;
        let space = parent
            .space
            .as_ref()
            .ok_or(SpawnError::NoCurrentThread)?
            .duplicate(self.machine.memory_mut(), &mut self.frames)?;
        let name = parent.name.clone();
        let priority = parent.priority;
        let parent_pid = parent.pid;

        let tid = self.threads.spawn(name, priority);
        let pid = match self.processes.allocate(tid, Some(parent_pid)) {
            Ok(pid) => pid,
            Err(err) => {
                self.threads.remove(tid);
                let mut space = space;
                space.release(&mut self.frames);
                return Err(err);
            }
        };
        let context = self.machine.save_registers();
        if let Some(thread) = self.threads.get_mut(tid) {
            thread.pid = pid;
            thread.parent = Some(parent_pid);
            thread.is_clone = true;
            thread.context = context;
            thread.space = Some(space);
        }
        debug!(target: "thread", "fork pid {} -> pid {}", parent_pid, pid);
        self.make_ready(tid);
        Ok(pid)
    }

    // ========================================================================
    // Interrupt Masking
    // ========================================================================

    /// Mask interrupts, returning the level to restore
    pub(crate) fn interrupts_off(&mut self) -> IntLevel {
        self.interrupt.set_level(IntLevel::Off).0
    }

    /// Restore a saved level, delivering a timer interrupt that came due
    /// while masked
    ///
    /// Inside a syscall handler the interrupt is held until the result and
    /// PC of the calling thread are written.
    pub(crate) fn restore_interrupts(&mut self, level: IntLevel) {
        let (_, deliver) = self.interrupt.set_level(level);
        if deliver {
            if self.in_handler {
                self.timer_deferred = true;
            } else {
                self.timer_interrupt();
            }
        }
    }

    /// ReadyToRun with interrupts masked
    pub(crate) fn make_ready(&mut self, id: ThreadId) {
        let old = self.interrupts_off();
        self.scheduler.ready_to_run(&mut self.threads, id);
        self.restore_interrupts(old);
    }

    // ========================================================================
    // Switching
    // ========================================================================

    /// Switch out the caller of the syscall just handled
    pub(crate) fn reschedule(&mut self, action: Reschedule) {
        let Some(current) = self.scheduler.current() else {
            return;
        };
        let old = self.interrupts_off();
        match action {
            Reschedule::Sleep(ticks) => {
                self.scheduler.sleep(&mut self.threads, current, ticks);
                self.switch_to_next(false);
            }
            Reschedule::Block => {
                self.threads.set_state(current, ThreadState::Blocked);
                self.switch_to_next(false);
            }
            Reschedule::Exit(code) => self.finish_current(code),
        }
        self.restore_interrupts(old);
    }

    /// Give the CPU to the next ready thread, if there is one
    pub fn yield_current(&mut self) {
        let Some(current) = self.scheduler.current() else {
            return;
        };
        let old = self.interrupts_off();
        if let Some(next) = self.scheduler.find_next_to_run(&self.threads) {
            self.scheduler.ready_to_run(&mut self.threads, current);
            self.scheduler
                .run(&mut self.threads, &mut self.machine, Some(next), false);
            self.reap();
        }
        self.restore_interrupts(old);
    }

    /// Record the exit, wake joiners and switch away for good
    fn finish_current(&mut self, code: i32) {
        let Some(current) = self.scheduler.current() else {
            return;
        };
        let pid = match self.threads.get_mut(current) {
            Some(thread) => {
                thread.exit_code = code;
                thread.pid
            }
            None => return,
        };
        info!(target: "thread", "pid {} exited with {}", pid, code);
        for joiner in self.processes.exit(pid, code) {
            if let Some(thread) = self.threads.get_mut(joiner) {
                thread.context[RESULT_REG] = code;
            }
            self.scheduler.ready_to_run(&mut self.threads, joiner);
        }
        self.switch_to_next(true);
    }

    /// FindNextToRun then Run; the CPU idles when nothing is ready
    fn switch_to_next(&mut self, finishing: bool) {
        let next = self.scheduler.find_next_to_run(&self.threads);
        self.scheduler
            .run(&mut self.threads, &mut self.machine, next, finishing);
        self.reap();
        if next.is_none() {
            self.interrupt.set_status(MachineStatus::Idle);
        }
    }

    /// CheckToBeDestroyed, returning the dead thread's frames
    fn reap(&mut self) {
        if let Some(mut dead) = self.scheduler.check_to_be_destroyed(&mut self.threads) {
            if let Some(space) = dead.space.as_mut() {
                let released = space.release(&mut self.frames);
                debug!(target: "addr", "{} released {} frames", dead.id(), released);
            }
        }
    }

    /// Timer interrupt: WakeUp, then preempt the running thread if another
    /// one is ready
    pub(crate) fn timer_interrupt(&mut self) {
        let old = self.interrupts_off();
        self.scheduler.wake_up(&mut self.threads);
        let preempt = self.config.preemptive && self.scheduler.current().is_some() && self.scheduler.has_ready();
        self.restore_interrupts(old);
        if preempt {
            self.yield_current();
        }
    }

    // ========================================================================
    // Machine Control
    // ========================================================================

    /// Stop the machine; only the first reason is kept
    pub fn halt(&mut self, reason: HaltReason) {
        if self.halt_reason.is_some() {
            return;
        }
        info!("machine halting: {:?}", reason);
        self.machine.halt();
        self.halt_reason = Some(reason);
    }

    pub fn is_halted(&self) -> bool {
        self.machine.is_halted()
    }

    /// Demand-paged view of the running process's memory
    pub fn user_space(&mut self) -> Result<UserSpace<'_>, CopyError> {
        let current = self.scheduler.current().ok_or(CopyError::NoAddressSpace)?;
        let space = self
            .threads
            .get_mut(current)
            .and_then(|thread| thread.space.as_mut())
            .ok_or(CopyError::NoAddressSpace)?;
        Ok(UserSpace {
            space,
            memory: self.machine.memory_mut(),
            frames: &mut self.frames,
            pager: &self.pager,
        })
    }

    /// NUL-terminated string from the running process
    pub fn copyin_string(&mut self, vaddr: VirtAddr) -> Result<Vec<u8>, CopyError> {
        self.user_space()
            .and_then(|mut user| copyio::copyin_string(&mut user, vaddr))
    }

    /// Exactly `len` bytes from the running process
    pub fn copyin(&mut self, vaddr: VirtAddr, len: i32) -> Result<Vec<u8>, CopyError> {
        self.user_space()
            .and_then(|mut user| copyio::copyin(&mut user, vaddr, len))
    }

    /// `data` plus a trailing NUL into the running process
    pub fn copyout(&mut self, vaddr: VirtAddr, data: &[u8]) -> Result<(), CopyError> {
        self.user_space()
            .and_then(|mut user| copyio::copyout(&mut user, vaddr, data))
    }

    // ========================================================================
    // Run Loop
    // ========================================================================

    /// Run until everything finishes, the machine halts or the tick
    /// budget runs out
    pub fn run(&mut self) -> RunOutcome {
        loop {
            if self.machine.is_halted() {
                let reason = self.halt_reason.clone().unwrap_or(HaltReason::UserRequest);
                return RunOutcome::Halted(reason);
            }
            if self.interrupt.total_ticks() >= self.config.max_ticks {
                warn!("tick limit {} reached", self.config.max_ticks);
                return RunOutcome::TickLimit;
            }

            match self.scheduler.current() {
                Some(current) => self.step(current),
                None => {
                    if let Err(outcome) = self.idle() {
                        return outcome;
                    }
                }
            }

            if self.interrupt.one_tick() {
                self.timer_interrupt();
            }
        }
    }

    /// Execute one instruction of `current` and handle what it raised
    fn step(&mut self, current: ThreadId) {
        let runnable = self
            .threads
            .get(current)
            .is_some_and(|thread| thread.space.is_some());
        if !runnable {
            // Nothing to execute without an address space
            let old = self.interrupts_off();
            self.finish_current(0);
            self.restore_interrupts(old);
            return;
        }
        let Some(space) = self.threads.get_mut(current).and_then(|thread| thread.space.as_mut()) else {
            return;
        };
        self.interrupt.set_status(MachineStatus::UserMode);
        let raised = self.machine.execute_one(space.page_table_mut());
        self.interrupt.set_status(MachineStatus::SystemMode);
        if let Some(which) = raised {
            self.handle_exception(which);
        }
    }

    /// Nothing is running: dispatch a ready thread, or skip ahead to the
    /// next timer interrupt while sleepers exist
    fn idle(&mut self) -> Result<(), RunOutcome> {
        let old = self.interrupts_off();
        let next = self.scheduler.find_next_to_run(&self.threads);
        if next.is_some() {
            self.scheduler
                .run(&mut self.threads, &mut self.machine, next, false);
            self.reap();
            self.interrupt.set_status(MachineStatus::SystemMode);
        }
        self.restore_interrupts(old);
        if next.is_some() {
            return Ok(());
        }

        if self.scheduler.has_sleepers() {
            self.interrupt.set_status(MachineStatus::Idle);
            self.interrupt.idle_until_timer();
            return Ok(());
        }
        if self.threads.is_empty() {
            info!("no threads left");
            return Err(RunOutcome::AllFinished);
        }
        warn!(target: "thread", "{} threads left, all blocked", self.threads.len());
        Err(RunOutcome::Deadlocked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kern::services::ImageRegistry;
    use crate::machine::{Assembler, SimMachine, PC_REG};
    use crate::vm::ExecutableImage;
    use alloc::vec;

    fn image(asm: &mut Assembler) -> ExecutableImage {
        ExecutableImage::builder().code(asm.assemble().unwrap()).build()
    }

    fn kernel_with(programs: ImageRegistry, config: KernelConfig) -> Kernel<SimMachine> {
        let machine = SimMachine::new(config.page_size, config.num_phys_pages);
        let (services, _) = Services::in_memory(b"", programs);
        Kernel::new(machine, config, services).unwrap()
    }

    fn exit_with(code: i16) -> ExecutableImage {
        let mut asm = Assembler::new();
        asm.li(4, code).syscall(1);
        image(&mut asm)
    }

    /// Dispatch `name` and run it until it goes to sleep
    fn run_until_asleep(kernel: &mut Kernel<SimMachine>, name: &str) -> ThreadId {
        kernel.boot(name).unwrap();
        kernel.idle().unwrap();
        let tid = kernel.scheduler.current().unwrap();
        for _ in 0..32 {
            if kernel.threads.state(tid) == Some(ThreadState::Sleeping) {
                break;
            }
            kernel.step(tid);
        }
        assert_eq!(kernel.threads.state(tid), Some(ThreadState::Sleeping));
        assert_eq!(kernel.scheduler.current(), None);
        tid
    }

    fn sleep_then_exit(ticks: i16) -> ExecutableImage {
        let mut asm = Assembler::new();
        asm.li(4, ticks).syscall(56).li(4, 0).syscall(1);
        image(&mut asm)
    }

    #[test]
    fn test_sleep_counts_down_one_interrupt_at_a_time() {
        let mut programs = ImageRegistry::new();
        programs.register("nap", sleep_then_exit(3));
        let mut kernel = kernel_with(programs, KernelConfig::default());
        let tid = run_until_asleep(&mut kernel, "nap");

        assert_eq!(kernel.scheduler.remaining_ticks(tid), Some(3));
        assert!(!kernel.scheduler.snapshot().ready.contains(&tid));

        for left in [2, 1] {
            kernel.timer_interrupt();
            assert_eq!(kernel.scheduler.remaining_ticks(tid), Some(left));
            assert_eq!(kernel.threads.state(tid), Some(ThreadState::Sleeping));
            assert!(!kernel.scheduler.snapshot().ready.contains(&tid));
        }

        kernel.timer_interrupt();
        assert_eq!(kernel.scheduler.remaining_ticks(tid), None);
        assert_eq!(kernel.threads.state(tid), Some(ThreadState::Ready));
        assert_eq!(kernel.scheduler.snapshot().ready, vec![tid]);
        assert!(!kernel.scheduler.has_sleepers());
    }

    #[test]
    fn test_sleep_zero_lasts_one_interrupt() {
        let mut programs = ImageRegistry::new();
        programs.register("blink", sleep_then_exit(0));
        let mut kernel = kernel_with(programs, KernelConfig::default());
        let tid = run_until_asleep(&mut kernel, "blink");

        assert_eq!(kernel.scheduler.remaining_ticks(tid), Some(1));
        kernel.timer_interrupt();
        assert_eq!(kernel.threads.state(tid), Some(ThreadState::Ready));
        assert_eq!(kernel.scheduler.snapshot().ready, vec![tid]);

        assert_eq!(kernel.run(), RunOutcome::AllFinished);
    }

    #[test]
    fn test_rejects_mismatched_memory() {
        let machine = SimMachine::new(64, 8);
        let (services, _) = Services::in_memory(b"", ImageRegistry::new());
        let err = Kernel::new(machine, KernelConfig::default(), services).err();
        assert_eq!(err, Some(ConfigError::PageSizeMismatch { config: 128, machine: 64 }));
    }

    #[test]
    fn test_boot_unknown_program() {
        let mut kernel = kernel_with(ImageRegistry::new(), KernelConfig::default());
        assert_eq!(
            kernel.boot("nope"),
            Err(SpawnError::NoSuchProgram("nope".to_string()))
        );
        assert!(kernel.threads().is_empty());
        assert_eq!(kernel.run(), RunOutcome::AllFinished);
    }

    #[test]
    fn test_single_exit_finishes_and_frees_frames() {
        let mut programs = ImageRegistry::new();
        programs.register("quit", exit_with(3));
        let mut kernel = kernel_with(programs, KernelConfig::default());
        let pid = kernel.boot("quit").unwrap();
        assert_eq!(pid, ProcessId::INIT);

        assert_eq!(kernel.run(), RunOutcome::AllFinished);
        assert!(kernel.threads().is_empty());
        assert_eq!(kernel.frames().num_free(), kernel.frames().num_frames());
        assert!(!kernel.is_halted());
    }

    #[test]
    fn test_halt_stops_once() {
        let mut programs = ImageRegistry::new();
        let mut asm = Assembler::new();
        asm.syscall(0).syscall(0);
        programs.register("halt", image(&mut asm));
        let mut kernel = kernel_with(programs, KernelConfig::default());
        kernel.boot("halt").unwrap();

        assert_eq!(kernel.run(), RunOutcome::Halted(HaltReason::UserRequest));
        let pc = kernel.machine().read_register(PC_REG);
        kernel.halt(HaltReason::Fatal(ExceptionType::Overflow));
        assert_eq!(kernel.halt_reason(), Some(&HaltReason::UserRequest));
        // Nothing more runs after a halt
        assert_eq!(kernel.run(), RunOutcome::Halted(HaltReason::UserRequest));
        assert_eq!(kernel.machine().read_register(PC_REG), pc);
    }

    #[test]
    fn test_spin_hits_tick_limit() {
        let mut programs = ImageRegistry::new();
        let mut asm = Assembler::new();
        asm.label("top").j("top");
        programs.register("spin", image(&mut asm));
        let config = KernelConfig::default().with_max_ticks(500);
        let mut kernel = kernel_with(programs, config);
        kernel.boot("spin").unwrap();
        assert_eq!(kernel.run(), RunOutcome::TickLimit);
        assert_eq!(kernel.interrupt().total_ticks(), 500);
    }

    #[test]
    fn test_process_slots_are_bounded() {
        let mut programs = ImageRegistry::new();
        programs.register("quit", exit_with(0));
        let mut config = KernelConfig::default();
        config.max_processes = 2;
        let mut kernel = kernel_with(programs, config);
        kernel.boot("quit").unwrap();
        kernel.boot("quit").unwrap();
        assert_eq!(kernel.boot("quit"), Err(SpawnError::ProcessTableFull));
        assert_eq!(kernel.threads().len(), 2);
    }
}

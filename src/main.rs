//! coopkern host binary
//!
//! Builds the simulated machine, boots the multiprogramming demo and runs
//! it to completion. Kernel diagnostics go to stderr; whatever the user
//! programs print goes to stdout.

use std::process::ExitCode;
use std::sync::atomic::Ordering;

use clap::{Parser, ValueEnum};
use coopkern::config::{KernelConfig, SchedPolicy};
use coopkern::kern::{Kernel, RunOutcome, Services};
use coopkern::machine::SimMachine;
use coopkern::{console, programs};
use log::LevelFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Policy {
    Fifo,
    Priority,
}

impl From<Policy> for SchedPolicy {
    fn from(policy: Policy) -> Self {
        match policy {
            Policy::Fifo => SchedPolicy::Fifo,
            Policy::Priority => SchedPolicy::Priority,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Level {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<Level> for LevelFilter {
    fn from(level: Level) -> Self {
        match level {
            Level::Off => LevelFilter::Off,
            Level::Error => LevelFilter::Error,
            Level::Warn => LevelFilter::Warn,
            Level::Info => LevelFilter::Info,
            Level::Debug => LevelFilter::Debug,
            Level::Trace => LevelFilter::Trace,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "coopkern", version, about = "Run the coopkern multiprogramming demo")]
struct Args {
    /// Ready-list discipline
    #[arg(long, value_enum, default_value_t = Policy::Fifo)]
    policy: Policy,

    /// Physical frames in the simulated memory
    #[arg(long, default_value_t = 128)]
    frames: usize,

    /// Page and frame size in bytes
    #[arg(long, default_value_t = 128)]
    page_size: usize,

    /// Ticks between timer interrupts
    #[arg(long, default_value_t = 100)]
    quantum: u64,

    /// Do not switch threads on timer interrupts
    #[arg(long)]
    no_preempt: bool,

    /// Stop after this many ticks
    #[arg(long, default_value_t = 1_000_000)]
    max_ticks: u64,

    /// Text fed to the user console
    #[arg(long, default_value = "")]
    input: String,

    /// Program to boot
    #[arg(long, default_value = "main")]
    program: String,

    #[arg(long, value_enum, default_value_t = Level::Info)]
    log_level: Level,
}

fn log_line(line: &str) {
    eprintln!("{}", line);
}

fn main() -> ExitCode {
    let args = Args::parse();

    console::init(Some(log_line));
    console::init_logger(args.log_level.into());

    let config = KernelConfig::default()
        .with_policy(args.policy.into())
        .with_frames(args.frames)
        .with_page_size(args.page_size)
        .with_timer_interval(args.quantum)
        .with_preemption(!args.no_preempt)
        .with_max_ticks(args.max_ticks);

    let registry = match programs::demo_registry() {
        Ok(registry) => registry,
        Err(err) => {
            eprintln!("cannot assemble the demo programs: {}", err);
            return ExitCode::FAILURE;
        }
    };
    let (services, output) = Services::in_memory(args.input.as_bytes(), registry);
    let machine = SimMachine::new(config.page_size, config.num_phys_pages);
    let mut kernel = match Kernel::new(machine, config, services) {
        Ok(kernel) => kernel,
        Err(err) => {
            eprintln!("bad configuration: {}", err);
            return ExitCode::FAILURE;
        }
    };
    if let Err(err) = kernel.boot(&args.program) {
        eprintln!("cannot boot {:?}: {}", args.program, err);
        return ExitCode::FAILURE;
    }

    let outcome = kernel.run();

    print!("{}", output.to_string_lossy());
    report(&kernel, &outcome);

    match outcome {
        RunOutcome::AllFinished => ExitCode::SUCCESS,
        RunOutcome::Halted(_) | RunOutcome::TickLimit | RunOutcome::Deadlocked => ExitCode::FAILURE,
    }
}

fn report(kernel: &Kernel<SimMachine>, outcome: &RunOutcome) {
    let sched = kernel.scheduler().stats();
    let faults = kernel.pager().stats();
    let traps = kernel.syscalls().stats().snapshot();
    eprintln!("outcome: {:?}", outcome);
    eprintln!(
        "ticks: {}  context switches: {}  wakeups: {}  threads destroyed: {}",
        kernel.interrupt().total_ticks(),
        sched.context_switches.load(Ordering::Relaxed),
        sched.wakeups.load(Ordering::Relaxed),
        sched.destroyed.load(Ordering::Relaxed),
    );
    eprintln!(
        "page faults: {}  zero-filled: {}  frames free: {}/{}",
        faults.total.load(Ordering::Relaxed),
        faults.zero_fill.load(Ordering::Relaxed),
        kernel.frames().num_free(),
        kernel.frames().num_frames(),
    );
    eprintln!(
        "syscalls: {}  unimplemented: {}  unexpected: {}",
        traps.total_calls, traps.unimplemented_calls, traps.unexpected_calls,
    );
}

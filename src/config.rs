//! Kernel configuration
//!
//! Every tunable the core reads lives here so the kernel context can be
//! built once from a single value instead of consulting globals.

use crate::error::ConfigError;

/// Ready-list discipline, fixed when the scheduler is constructed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedPolicy {
    /// Insertion order
    #[default]
    Fifo,
    /// Numerically smallest priority first
    Priority,
}

impl SchedPolicy {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Fifo => "fifo",
            Self::Priority => "priority",
        }
    }
}

/// Size in bytes of one instruction, and the PC step per handled trap
pub const INSTRUCTION_WIDTH: i32 = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelConfig {
    /// Bytes per page and per physical frame
    pub page_size: usize,
    /// Frames in the physical arena
    pub num_phys_pages: usize,
    /// Bytes reserved above the program image for the user stack
    pub user_stack_size: usize,
    pub policy: SchedPolicy,
    /// Priority given to threads created by Exec
    pub default_priority: i32,
    /// Ticks between timer interrupts
    pub timer_interval: u64,
    /// Yield the running thread on each timer interrupt
    pub preemptive: bool,
    /// Run loop gives up after this many ticks
    pub max_ticks: u64,
    /// Live process slots
    pub max_processes: usize,
    /// Longest string ReadString accepts before halting
    pub max_read_string: usize,
    pub random_seed: u64,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            page_size: 128,
            num_phys_pages: 128,
            user_stack_size: 1024,
            policy: SchedPolicy::Fifo,
            default_priority: 0,
            timer_interval: 100,
            preemptive: true,
            max_ticks: 1_000_000,
            max_processes: 10,
            max_read_string: 255,
            random_seed: 0x2545_f491_4f6c_dd1d,
        }
    }
}

impl KernelConfig {
    pub fn with_policy(mut self, policy: SchedPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_frames(mut self, frames: usize) -> Self {
        self.num_phys_pages = frames;
        self
    }

    pub fn with_timer_interval(mut self, ticks: u64) -> Self {
        self.timer_interval = ticks;
        self
    }

    pub fn with_preemption(mut self, preemptive: bool) -> Self {
        self.preemptive = preemptive;
        self
    }

    pub fn with_max_ticks(mut self, ticks: u64) -> Self {
        self.max_ticks = ticks;
        self
    }

    /// Reject layouts the pager and the simulated CPU cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.page_size.is_power_of_two() || self.page_size < INSTRUCTION_WIDTH as usize {
            return Err(ConfigError::PageSize(self.page_size));
        }
        if self.num_phys_pages == 0 {
            return Err(ConfigError::NoFrames);
        }
        if self.timer_interval == 0 {
            return Err(ConfigError::TimerInterval);
        }
        if self.max_processes == 0 {
            return Err(ConfigError::NoProcessSlots);
        }
        Ok(())
    }
}

//! Interrupt controller for the simulated CPU
//!
//! Tracks the interrupt level, the execution mode and the tick clock.
//! A periodic timer comes due every `timer_interval` ticks; if that
//! happens while interrupts are masked the interrupt stays pending and is
//! delivered by the first [`InterruptController::set_level`] back to `On`.

use core::sync::atomic::{AtomicU64, Ordering};

/// Interrupt mask level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntLevel {
    Off,
    On,
}

/// Who is executing on the CPU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineStatus {
    Idle,
    SystemMode,
    UserMode,
}

/// Interrupt statistics
#[derive(Debug, Default)]
pub struct InterruptStats {
    /// Timer interrupts delivered
    pub timer_interrupts: AtomicU64,
    /// Timer interrupts that had to wait for interrupts to be re-enabled
    pub deferred: AtomicU64,
    /// Ticks skipped while idle
    pub idle_ticks: AtomicU64,
}

impl InterruptStats {
    pub const fn new() -> Self {
        Self {
            timer_interrupts: AtomicU64::new(0),
            deferred: AtomicU64::new(0),
            idle_ticks: AtomicU64::new(0),
        }
    }
}

#[derive(Debug)]
pub struct InterruptController {
    level: IntLevel,
    status: MachineStatus,
    total_ticks: u64,
    timer_interval: u64,
    next_timer: u64,
    pending_timer: bool,
    stats: InterruptStats,
}

impl InterruptController {
    pub fn new(timer_interval: u64) -> Self {
        let timer_interval = timer_interval.max(1);
        Self {
            level: IntLevel::On,
            status: MachineStatus::SystemMode,
            total_ticks: 0,
            timer_interval,
            next_timer: timer_interval,
            pending_timer: false,
            stats: InterruptStats::new(),
        }
    }

    pub fn level(&self) -> IntLevel {
        self.level
    }

    /// Change the interrupt level and return the previous one
    ///
    /// Returns `true` in the second slot when re-enabling uncovered a
    /// pending timer interrupt that the caller must now deliver.
    pub fn set_level(&mut self, level: IntLevel) -> (IntLevel, bool) {
        let old = self.level;
        self.level = level;
        let deliver = old == IntLevel::Off && level == IntLevel::On && self.pending_timer;
        if deliver {
            self.pending_timer = false;
        }
        (old, deliver)
    }

    pub fn status(&self) -> MachineStatus {
        self.status
    }

    pub fn set_status(&mut self, status: MachineStatus) {
        self.status = status;
    }

    pub fn total_ticks(&self) -> u64 {
        self.total_ticks
    }

    pub fn stats(&self) -> &InterruptStats {
        &self.stats
    }

    /// Advance the clock by one tick
    ///
    /// Returns `true` when the timer fired and interrupts are enabled, in
    /// which case the caller delivers it immediately.
    pub fn one_tick(&mut self) -> bool {
        self.total_ticks += 1;
        if self.total_ticks < self.next_timer {
            return false;
        }
        self.next_timer += self.timer_interval;
        match self.level {
            IntLevel::On => {
                self.stats.timer_interrupts.fetch_add(1, Ordering::Relaxed);
                true
            }
            IntLevel::Off => {
                self.pending_timer = true;
                self.stats.deferred.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Jump the clock to the next timer interrupt, as an idle CPU would
    pub fn idle_until_timer(&mut self) {
        let skipped = self.next_timer.saturating_sub(self.total_ticks + 1);
        self.stats.idle_ticks.fetch_add(skipped, Ordering::Relaxed);
        self.total_ticks += skipped;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timer_fires_on_interval() {
        let mut intr = InterruptController::new(3);
        assert!(!intr.one_tick());
        assert!(!intr.one_tick());
        assert!(intr.one_tick());
        assert!(!intr.one_tick());
        assert_eq!(intr.total_ticks(), 4);
    }

    #[test]
    fn test_masked_timer_is_deferred() {
        let mut intr = InterruptController::new(2);
        let (old, deliver) = intr.set_level(IntLevel::Off);
        assert_eq!(old, IntLevel::On);
        assert!(!deliver);

        assert!(!intr.one_tick());
        assert!(!intr.one_tick());
        assert_eq!(intr.stats().deferred.load(Ordering::Relaxed), 1);

        let (old, deliver) = intr.set_level(IntLevel::On);
        assert_eq!(old, IntLevel::Off);
        assert!(deliver);

        // Delivered only once
        let (_, deliver) = intr.set_level(IntLevel::On);
        assert!(!deliver);
    }

    #[test]
    fn test_idle_jumps_to_timer() {
        let mut intr = InterruptController::new(10);
        intr.one_tick();
        intr.idle_until_timer();
        assert_eq!(intr.total_ticks(), 9);
        assert!(intr.one_tick());
        assert_eq!(intr.stats().idle_ticks.load(Ordering::Relaxed), 8);
    }

    #[test]
    fn test_status() {
        let mut intr = InterruptController::new(1);
        assert_eq!(intr.status(), MachineStatus::SystemMode);
        intr.set_status(MachineStatus::UserMode);
        assert_eq!(intr.status(), MachineStatus::UserMode);
    }
}

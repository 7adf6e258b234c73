//! Thread scheduler for coopkern
//!
//! Cooperative switching on a single CPU. The scheduler owns three things:
//! the ready set, the sleep set, and the one-slot deferred-destruction
//! register. Threads themselves live in the [`ThreadTable`] arena and are
//! referred to by id here.
//!
//! Callers mask interrupts around any read-then-write sequence on this
//! state (e.g. `sleep` then `find_next_to_run` then `run`); the kernel
//! context does this for them.

use alloc::collections::{BinaryHeap, VecDeque};
use alloc::vec::Vec;
use core::cmp::Ordering as CmpOrdering;
use core::sync::atomic::{AtomicU64, Ordering};
use log::{debug, trace, warn};

use crate::config::SchedPolicy;
use crate::kern::thread::{Thread, ThreadState, ThreadTable};
use crate::machine::Machine;
use crate::types::ThreadId;

/// Scheduler statistics
#[derive(Debug)]
pub struct SchedStats {
    /// Total context switches
    pub context_switches: AtomicU64,
    /// Threads moved from the sleep set to the ready set
    pub wakeups: AtomicU64,
    /// Threads released from the deferred-destruction slot
    pub destroyed: AtomicU64,
}

impl SchedStats {
    pub const fn new() -> Self {
        Self {
            context_switches: AtomicU64::new(0),
            wakeups: AtomicU64::new(0),
            destroyed: AtomicU64::new(0),
        }
    }
}

impl Default for SchedStats {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Ready List
// ============================================================================

/// Entry in the priority-ordered ready set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ReadyEntry {
    priority: i32,
    /// Insertion sequence, breaks ties between equal priorities
    seq: u64,
    thread: ThreadId,
}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reverse order for min-heap (smallest priority value first)
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug)]
enum ReadyList {
    Fifo(VecDeque<ThreadId>),
    Priority { heap: BinaryHeap<ReadyEntry>, seq: u64 },
}

impl ReadyList {
    fn new(policy: SchedPolicy) -> Self {
        match policy {
            SchedPolicy::Fifo => Self::Fifo(VecDeque::new()),
            SchedPolicy::Priority => Self::Priority {
                heap: BinaryHeap::new(),
                seq: 0,
            },
        }
    }

    fn push(&mut self, thread: ThreadId, priority: i32) {
        match self {
            Self::Fifo(queue) => queue.push_back(thread),
            Self::Priority { heap, seq } => {
                heap.push(ReadyEntry {
                    priority,
                    seq: *seq,
                    thread,
                });
                *seq += 1;
            }
        }
    }

    fn pop(&mut self) -> Option<ThreadId> {
        match self {
            Self::Fifo(queue) => queue.pop_front(),
            Self::Priority { heap, .. } => heap.pop().map(|entry| entry.thread),
        }
    }

    fn len(&self) -> usize {
        match self {
            Self::Fifo(queue) => queue.len(),
            Self::Priority { heap, .. } => heap.len(),
        }
    }

    /// Contents in dequeue order
    fn ordered(&self) -> Vec<ThreadId> {
        match self {
            Self::Fifo(queue) => queue.iter().copied().collect(),
            Self::Priority { heap, .. } => {
                let mut entries: Vec<ReadyEntry> = heap.iter().copied().collect();
                // Ord is reversed, so descending order is dequeue order
                entries.sort_by(|a, b| b.cmp(a));
                entries.into_iter().map(|entry| entry.thread).collect()
            }
        }
    }
}

/// A thread in the sleep set and the timer ticks it still has to wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SleepEntry {
    pub thread: ThreadId,
    pub remaining: u32,
}

/// Point-in-time view of the scheduler's sets, for diagnostics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedSnapshot {
    pub policy: SchedPolicy,
    pub ready: Vec<ThreadId>,
    pub sleeping: Vec<SleepEntry>,
    pub current: Option<ThreadId>,
    pub to_be_destroyed: Option<ThreadId>,
}

// ============================================================================
// Scheduler
// ============================================================================

#[derive(Debug)]
pub struct Scheduler {
    policy: SchedPolicy,
    ready: ReadyList,
    sleeping: Vec<SleepEntry>,
    current: Option<ThreadId>,
    to_be_destroyed: Option<ThreadId>,
    stats: SchedStats,
}

impl Scheduler {
    pub fn new(policy: SchedPolicy) -> Self {
        Self {
            policy,
            ready: ReadyList::new(policy),
            sleeping: Vec::new(),
            current: None,
            to_be_destroyed: None,
            stats: SchedStats::new(),
        }
    }

    pub fn policy(&self) -> SchedPolicy {
        self.policy
    }

    /// Thread owning the CPU, if any
    pub fn current(&self) -> Option<ThreadId> {
        self.current
    }

    pub fn stats(&self) -> &SchedStats {
        &self.stats
    }

    pub fn has_ready(&self) -> bool {
        self.ready.len() > 0
    }

    pub fn has_sleepers(&self) -> bool {
        !self.sleeping.is_empty()
    }

    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    /// Ticks left for a sleeping thread
    pub fn remaining_ticks(&self, thread: ThreadId) -> Option<u32> {
        self.sleeping
            .iter()
            .find(|entry| entry.thread == thread)
            .map(|entry| entry.remaining)
    }

    /// Mark a thread ready and put it in the ready set
    pub fn ready_to_run(&mut self, threads: &mut ThreadTable, id: ThreadId) {
        let Some(thread) = threads.get_mut(id) else {
            warn!(target: "thread", "ready_to_run: no thread {}", id);
            return;
        };
        if thread.state() == ThreadState::Ready {
            warn!(target: "thread", "{} is already ready", id);
            return;
        }
        trace!(target: "thread", "putting {} ({}) on the ready list", id, thread.name);
        thread.set_state(ThreadState::Ready);
        self.ready.push(id, thread.priority);
    }

    /// Remove and return the next thread to run, or `None` if the CPU
    /// should idle
    pub fn find_next_to_run(&mut self, threads: &ThreadTable) -> Option<ThreadId> {
        while let Some(id) = self.ready.pop() {
            // Entries for threads that left the arena are dropped
            if threads.state(id) == Some(ThreadState::Ready) {
                return Some(id);
            }
        }
        None
    }

    /// Switch the CPU from the current thread to `next`
    ///
    /// The outgoing thread's registers are saved into its context. When
    /// `finishing` is set it is marked finished and parked in the
    /// deferred-destruction slot; the caller must follow up with
    /// [`Scheduler::check_to_be_destroyed`] once the switch is complete.
    /// Passing `None` leaves the CPU idle.
    pub fn run<M: Machine + ?Sized>(
        &mut self,
        threads: &mut ThreadTable,
        machine: &mut M,
        next: Option<ThreadId>,
        finishing: bool,
    ) {
        if let Some(old) = self.current.take() {
            if let Some(thread) = threads.get_mut(old) {
                thread.context = machine.save_registers();
                if finishing {
                    thread.set_state(ThreadState::Finished);
                }
            }
            if finishing {
                debug_assert!(self.to_be_destroyed.is_none());
                self.to_be_destroyed = Some(old);
            }
        }

        if let Some(id) = next {
            if let Some(thread) = threads.get_mut(id) {
                debug!(target: "thread", "switching to {} ({})", id, thread.name);
                thread.set_state(ThreadState::Running);
                machine.restore_registers(&thread.context);
                self.current = Some(id);
                self.stats.context_switches.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Release the thread parked by the last finishing switch
    ///
    /// The running thread is never released. The removed thread is handed
    /// back so the caller can return its frames.
    pub fn check_to_be_destroyed(&mut self, threads: &mut ThreadTable) -> Option<Thread> {
        let id = self.to_be_destroyed?;
        if Some(id) == self.current {
            return None;
        }
        self.to_be_destroyed = None;
        let thread = threads.remove(id)?;
        debug!(target: "thread", "destroying {} ({})", id, thread.name);
        self.stats.destroyed.fetch_add(1, Ordering::Relaxed);
        Some(thread)
    }

    pub fn to_be_destroyed(&self) -> Option<ThreadId> {
        self.to_be_destroyed
    }

    /// Put a thread to sleep for `ticks` timer ticks
    ///
    /// A zero count still waits for the next tick. If the thread is the
    /// running one it stays recorded as current until the caller switches
    /// away with [`Scheduler::run`].
    pub fn sleep(&mut self, threads: &mut ThreadTable, id: ThreadId, ticks: u32) {
        let Some(thread) = threads.get_mut(id) else {
            return;
        };
        debug_assert_ne!(thread.state(), ThreadState::Ready);
        thread.set_state(ThreadState::Sleeping);
        self.sleeping.push(SleepEntry {
            thread: id,
            remaining: ticks.max(1),
        });
        trace!(target: "thread", "{} sleeping for {} ticks", id, ticks.max(1));
    }

    /// Count one timer tick down for every sleeper and make the expired
    /// ones ready; returns how many woke
    pub fn wake_up(&mut self, threads: &mut ThreadTable) -> usize {
        let mut expired = Vec::new();
        self.sleeping.retain_mut(|entry| {
            entry.remaining = entry.remaining.saturating_sub(1);
            if entry.remaining == 0 {
                expired.push(entry.thread);
                false
            } else {
                true
            }
        });
        for id in &expired {
            self.ready_to_run(threads, *id);
        }
        self.stats
            .wakeups
            .fetch_add(expired.len() as u64, Ordering::Relaxed);
        expired.len()
    }

    pub fn snapshot(&self) -> SchedSnapshot {
        SchedSnapshot {
            policy: self.policy,
            ready: self.ready.ordered(),
            sleeping: self.sleeping.clone(),
            current: self.current,
            to_be_destroyed: self.to_be_destroyed,
        }
    }

    /// Dump both sets to the log
    pub fn print(&self) {
        let snapshot = self.snapshot();
        debug!(
            target: "thread",
            "{} ready list: {:?}, sleeping: {:?}, current: {:?}",
            snapshot.policy.name(),
            snapshot.ready,
            snapshot.sleeping,
            snapshot.current
        );
    }
}

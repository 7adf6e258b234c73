//! Threads and the thread arena
//!
//! Every user process runs as exactly one thread. Threads live in a
//! [`ThreadTable`] keyed by a stable [`ThreadId`]; the scheduler and the
//! process table refer to them only by id, and a finished thread leaves
//! the arena at the next safe point after the switch away from it.

use alloc::collections::BTreeMap;
use alloc::string::String;

use crate::machine::{RegisterFile, NUM_TOTAL_REGS};
use crate::types::{ProcessId, ThreadId};
use crate::vm::AddressSpace;

// ============================================================================
// Thread State
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Just created, not yet handed to the scheduler
    JustCreated,
    /// In the ready set
    Ready,
    /// Owns the CPU
    Running,
    /// In the sleep set
    Sleeping,
    /// Waiting on a join or a semaphore; in no scheduler set
    Blocked,
    /// Exited; waiting in the deferred-destruction slot
    Finished,
}

impl ThreadState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::JustCreated => "JUST_CREATED",
            Self::Ready => "READY",
            Self::Running => "RUNNING",
            Self::Sleeping => "SLEEPING",
            Self::Blocked => "BLOCKED",
            Self::Finished => "FINISHED",
        }
    }
}

// ============================================================================
// Thread Structure
// ============================================================================

#[derive(Debug)]
pub struct Thread {
    id: ThreadId,
    /// Program name; owned here from the moment Exec decodes it
    pub name: String,
    /// User-visible process id
    pub pid: ProcessId,
    /// Process that created this one, if still meaningful
    pub parent: Option<ProcessId>,
    /// Lower is more urgent
    pub priority: i32,
    state: ThreadState,
    /// Set on a fork child until it first returns from ThreadFork
    pub is_clone: bool,
    /// None for threads that never run user code
    pub space: Option<AddressSpace>,
    pub exit_code: i32,
    /// User registers while the thread is off the CPU
    pub context: RegisterFile,
}

impl Thread {
    pub fn new(id: ThreadId, name: String, priority: i32) -> Self {
        Self {
            id,
            name,
            pid: ProcessId(-1),
            parent: None,
            priority,
            state: ThreadState::JustCreated,
            is_clone: false,
            space: None,
            exit_code: 0,
            context: [0; NUM_TOTAL_REGS],
        }
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn state(&self) -> ThreadState {
        self.state
    }

    pub fn set_state(&mut self, state: ThreadState) {
        self.state = state;
    }
}

// ============================================================================
// Thread Arena
// ============================================================================

#[derive(Debug, Default)]
pub struct ThreadTable {
    threads: BTreeMap<ThreadId, Thread>,
    next_id: u64,
}

impl ThreadTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a thread and return its id
    pub fn spawn(&mut self, name: String, priority: i32) -> ThreadId {
        let id = ThreadId(self.next_id);
        self.next_id += 1;
        self.threads.insert(id, Thread::new(id, name, priority));
        id
    }

    pub fn get(&self, id: ThreadId) -> Option<&Thread> {
        self.threads.get(&id)
    }

    pub fn get_mut(&mut self, id: ThreadId) -> Option<&mut Thread> {
        self.threads.get_mut(&id)
    }

    pub fn remove(&mut self, id: ThreadId) -> Option<Thread> {
        self.threads.remove(&id)
    }

    pub fn contains(&self, id: ThreadId) -> bool {
        self.threads.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    pub fn set_state(&mut self, id: ThreadId, state: ThreadState) {
        if let Some(thread) = self.threads.get_mut(&id) {
            thread.state = state;
        }
    }

    pub fn state(&self, id: ThreadId) -> Option<ThreadState> {
        self.threads.get(&id).map(|thread| thread.state)
    }
}

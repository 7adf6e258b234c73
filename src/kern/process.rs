//! Process table
//!
//! Maps user-visible pids to the thread running each process and keeps
//! what Join needs: the parent link, the exit code of a finished child
//! until its parent collects it, and the threads blocked waiting for it.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use log::trace;

use crate::error::SpawnError;
use crate::types::{ProcessId, ThreadId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Live,
    /// Exited; holds the exit code until the parent joins
    Zombie(i32),
}

#[derive(Debug, Clone)]
pub struct Process {
    pub pid: ProcessId,
    pub thread: ThreadId,
    pub parent: Option<ProcessId>,
    pub state: ProcessState,
    joiners: Vec<ThreadId>,
}

/// Result of a Join request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinStatus {
    /// Not a child of the caller
    Invalid,
    /// Child already exited with this code
    Finished(i32),
    /// Caller must block until the child exits
    Wait,
}

#[derive(Debug)]
pub struct ProcessTable {
    procs: BTreeMap<ProcessId, Process>,
    capacity: usize,
    next_pid: i32,
}

impl ProcessTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            procs: BTreeMap::new(),
            capacity,
            next_pid: ProcessId::INIT.0,
        }
    }

    pub fn len(&self) -> usize {
        self.procs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.procs.is_empty()
    }

    pub fn get(&self, pid: ProcessId) -> Option<&Process> {
        self.procs.get(&pid)
    }

    /// Register a new process run by `thread`
    pub fn allocate(&mut self, thread: ThreadId, parent: Option<ProcessId>) -> Result<ProcessId, SpawnError> {
        if self.procs.len() >= self.capacity {
            return Err(SpawnError::ProcessTableFull);
        }
        let pid = ProcessId(self.next_pid);
        self.next_pid += 1;
        self.procs.insert(
            pid,
            Process {
                pid,
                thread,
                parent,
                state: ProcessState::Live,
                joiners: Vec::new(),
            },
        );
        trace!(target: "thread", "pid {} -> {} (parent {:?})", pid, thread, parent);
        Ok(pid)
    }

    /// `caller` (running as `caller_thread`) asks to join `child`
    pub fn join(&mut self, caller: ProcessId, child: ProcessId, caller_thread: ThreadId) -> JoinStatus {
        let Some(proc) = self.procs.get_mut(&child) else {
            return JoinStatus::Invalid;
        };
        if proc.parent != Some(caller) {
            return JoinStatus::Invalid;
        }
        match proc.state {
            ProcessState::Zombie(code) => {
                self.procs.remove(&child);
                JoinStatus::Finished(code)
            }
            ProcessState::Live => {
                proc.joiners.push(caller_thread);
                JoinStatus::Wait
            }
        }
    }

    /// Record that `pid` exited with `code`
    ///
    /// Returns the threads blocked joining it; they receive `code`. The
    /// entry stays as a zombie only while a live parent could still join.
    pub fn exit(&mut self, pid: ProcessId, code: i32) -> Vec<ThreadId> {
        let Some(proc) = self.procs.get_mut(&pid) else {
            return Vec::new();
        };
        let joiners = core::mem::take(&mut proc.joiners);
        let parent = proc.parent;
        let parent_live = parent
            .and_then(|parent| self.procs.get(&parent))
            .is_some_and(|parent| parent.state == ProcessState::Live);

        if joiners.is_empty() && parent_live {
            if let Some(proc) = self.procs.get_mut(&pid) {
                proc.state = ProcessState::Zombie(code);
            }
        } else {
            self.procs.remove(&pid);
        }

        // Children of the exiting process can no longer be joined
        let orphans: Vec<ProcessId> = self
            .procs
            .values()
            .filter(|child| child.parent == Some(pid))
            .map(|child| child.pid)
            .collect();
        for orphan in orphans {
            match self.procs.get(&orphan).map(|child| child.state) {
                Some(ProcessState::Zombie(_)) => {
                    self.procs.remove(&orphan);
                }
                Some(ProcessState::Live) => {
                    if let Some(child) = self.procs.get_mut(&orphan) {
                        child.parent = None;
                    }
                }
                None => {}
            }
        }
        joiners
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pids_count_up_from_init() {
        let mut procs = ProcessTable::new(4);
        assert_eq!(procs.allocate(ThreadId(0), None), Ok(ProcessId::INIT));
        assert_eq!(procs.allocate(ThreadId(1), Some(ProcessId(0))), Ok(ProcessId(1)));
    }

    #[test]
    fn test_table_full() {
        let mut procs = ProcessTable::new(1);
        procs.allocate(ThreadId(0), None).unwrap();
        assert_eq!(procs.allocate(ThreadId(1), None), Err(SpawnError::ProcessTableFull));
    }

    #[test]
    fn test_join_only_children() {
        let mut procs = ProcessTable::new(4);
        let parent = procs.allocate(ThreadId(0), None).unwrap();
        let child = procs.allocate(ThreadId(1), Some(parent)).unwrap();
        assert_eq!(procs.join(child, parent, ThreadId(1)), JoinStatus::Invalid);
        assert_eq!(procs.join(parent, ProcessId(99), ThreadId(0)), JoinStatus::Invalid);
        assert_eq!(procs.join(parent, child, ThreadId(0)), JoinStatus::Wait);
    }

    #[test]
    fn test_exit_wakes_joiner() {
        let mut procs = ProcessTable::new(4);
        let parent = procs.allocate(ThreadId(0), None).unwrap();
        let child = procs.allocate(ThreadId(1), Some(parent)).unwrap();
        procs.join(parent, child, ThreadId(0));
        assert_eq!(procs.exit(child, 7), [ThreadId(0)]);
        assert!(procs.get(child).is_none());
    }

    #[test]
    fn test_zombie_until_joined() {
        let mut procs = ProcessTable::new(4);
        let parent = procs.allocate(ThreadId(0), None).unwrap();
        let child = procs.allocate(ThreadId(1), Some(parent)).unwrap();
        assert!(procs.exit(child, 3).is_empty());
        assert_eq!(procs.get(child).unwrap().state, ProcessState::Zombie(3));
        assert_eq!(procs.join(parent, child, ThreadId(0)), JoinStatus::Finished(3));
        assert_eq!(procs.join(parent, child, ThreadId(0)), JoinStatus::Invalid);
    }

    #[test]
    fn test_parent_exit_reaps_children() {
        let mut procs = ProcessTable::new(4);
        let parent = procs.allocate(ThreadId(0), None).unwrap();
        let done = procs.allocate(ThreadId(1), Some(parent)).unwrap();
        let running = procs.allocate(ThreadId(2), Some(parent)).unwrap();
        procs.exit(done, 0);
        procs.exit(parent, 0);
        assert!(procs.get(done).is_none());
        assert_eq!(procs.get(running).unwrap().parent, None);
        // Orphans do not linger once they exit
        procs.exit(running, 1);
        assert!(procs.is_empty());
    }
}

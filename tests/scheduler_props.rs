//! Property-based tests for the ready and sleep sets

use coopkern::config::SchedPolicy;
use coopkern::kern::{ThreadState, ThreadTable};
use coopkern::scheduler::Scheduler;
use coopkern::types::ThreadId;
use proptest::prelude::*;

fn spawn_all(threads: &mut ThreadTable, priorities: &[i32]) -> Vec<ThreadId> {
    priorities
        .iter()
        .enumerate()
        .map(|(i, &p)| threads.spawn(format!("t{}", i), p))
        .collect()
}

fn drain(scheduler: &mut Scheduler, threads: &ThreadTable) -> Vec<ThreadId> {
    std::iter::from_fn(|| scheduler.find_next_to_run(threads)).collect()
}

// ════════════════════════════════════════════════════════════
// Ready List
// ════════════════════════════════════════════════════════════

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// FIFO hands threads back in insertion order, priorities ignored
    #[test]
    fn fifo_preserves_insertion_order(priorities in prop::collection::vec(-5i32..5, 0..24)) {
        let mut threads = ThreadTable::new();
        let mut scheduler = Scheduler::new(SchedPolicy::Fifo);
        let ids = spawn_all(&mut threads, &priorities);
        for &id in &ids {
            scheduler.ready_to_run(&mut threads, id);
        }
        prop_assert_eq!(drain(&mut scheduler, &threads), ids);
    }

    /// Priority order is a stable sort by priority, smallest first
    #[test]
    fn priority_is_stable_sort(priorities in prop::collection::vec(-5i32..5, 0..24)) {
        let mut threads = ThreadTable::new();
        let mut scheduler = Scheduler::new(SchedPolicy::Priority);
        let ids = spawn_all(&mut threads, &priorities);
        for &id in &ids {
            scheduler.ready_to_run(&mut threads, id);
        }

        let mut expected: Vec<(i32, ThreadId)> = priorities.iter().copied().zip(ids.iter().copied()).collect();
        expected.sort_by_key(|&(p, _)| p);
        let expected: Vec<ThreadId> = expected.into_iter().map(|(_, id)| id).collect();
        prop_assert_eq!(drain(&mut scheduler, &threads), expected);
    }

    /// Readying a thread twice never duplicates it
    #[test]
    fn ready_twice_is_ignored(
        count in 1usize..12,
        repeats in prop::collection::vec(0usize..12, 0..12),
    ) {
        let mut threads = ThreadTable::new();
        let mut scheduler = Scheduler::new(SchedPolicy::Fifo);
        let ids = spawn_all(&mut threads, &vec![0; count]);
        for &id in &ids {
            scheduler.ready_to_run(&mut threads, id);
        }
        for r in repeats {
            scheduler.ready_to_run(&mut threads, ids[r % count]);
        }
        prop_assert_eq!(scheduler.ready_len(), count);
        prop_assert_eq!(drain(&mut scheduler, &threads), ids);
    }
}

// ════════════════════════════════════════════════════════════
// Sleep Set
// ════════════════════════════════════════════════════════════

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// A sleeper becomes ready on exactly the max(ticks, 1)-th wake-up
    #[test]
    fn sleepers_wake_on_schedule(durations in prop::collection::vec(0u32..20, 1..10)) {
        let mut threads = ThreadTable::new();
        let mut scheduler = Scheduler::new(SchedPolicy::Fifo);
        let ids = spawn_all(&mut threads, &vec![0; durations.len()]);
        for (&id, &ticks) in ids.iter().zip(&durations) {
            scheduler.sleep(&mut threads, id, ticks);
        }

        let longest = durations.iter().map(|&t| t.max(1)).max().unwrap_or(1);
        for tick in 1..=longest {
            scheduler.wake_up(&mut threads);
            for (&id, &ticks) in ids.iter().zip(&durations) {
                let expected = if tick >= ticks.max(1) {
                    ThreadState::Ready
                } else {
                    ThreadState::Sleeping
                };
                prop_assert_eq!(threads.state(id), Some(expected));
            }
        }
        prop_assert!(!scheduler.has_sleepers());
        prop_assert_eq!(scheduler.ready_len(), ids.len());
    }
}

// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Property tests for the fiber accounting invariants.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::Arc;

use proptest::prelude::*;
use weft_fiber::{
    Baton, FiberId, FiberManager, FiberState, FiberStats, Options, SimpleLoopController,
};

#[derive(Debug, Clone)]
enum Op {
    /// Plain task.
    Spawn,
    /// Task that parks on a fresh baton.
    SpawnWaiter,
    /// Task that panics.
    SpawnFaulty,
    /// Post the oldest outstanding baton.
    PostOldest,
    /// Run one scheduler pass.
    Pass,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => Just(Op::Spawn),
        2 => Just(Op::SpawnWaiter),
        1 => Just(Op::SpawnFaulty),
        2 => Just(Op::PostOldest),
        2 => Just(Op::Pass),
    ]
}

fn check_balanced(stats: FiberStats, max_pool: usize) -> Result<(), TestCaseError> {
    prop_assert_eq!(
        stats.allocated,
        stats.active + stats.queued + stats.pooled,
        "unbalanced: {:?}",
        stats
    );
    prop_assert!(stats.pooled <= max_pool, "pool overflow: {:?}", stats);
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn counts_stay_balanced(
        max_pool in 0usize..6,
        ops in prop::collection::vec(op_strategy(), 1..40),
    ) {
        let controller = Arc::new(SimpleLoopController::new());
        let manager = FiberManager::with_options(
            controller,
            Options::new()
                .with_stack_size(64 * 1024)
                .with_max_fibers_pool_size(max_pool),
        );
        manager.set_fault_hook(|_, _| {});
        let mut batons = VecDeque::new();

        for op in ops {
            match op {
                Op::Spawn => manager.add_task(|| {}).unwrap(),
                Op::SpawnWaiter => {
                    let baton = Baton::new();
                    let waiter = baton.clone();
                    manager.add_task(move || waiter.wait()).unwrap();
                    batons.push_back(baton);
                }
                Op::SpawnFaulty => manager.add_task(|| panic!("faulty task")).unwrap(),
                Op::PostOldest => {
                    if let Some(baton) = batons.pop_front() {
                        baton.post().unwrap();
                    }
                }
                Op::Pass => {
                    manager.loop_until_no_ready();
                }
            }
            check_balanced(manager.stats(), max_pool)?;
        }

        for baton in batons {
            baton.post().unwrap();
        }
        manager.loop_until_no_ready();
        let stats = manager.stats();
        check_balanced(stats, max_pool)?;
        prop_assert_eq!(stats.active + stats.queued, 0);
        prop_assert!(!manager.has_tasks());
    }

    #[test]
    fn waiters_park_and_finish(waiters in 1usize..6, plain in 0usize..6) {
        let controller = Arc::new(SimpleLoopController::new());
        let manager = FiberManager::with_options(
            controller,
            Options::new().with_stack_size(64 * 1024),
        );
        let seen: Rc<RefCell<Vec<(FiberId, Option<FiberState>)>>> = Rc::default();
        let mut batons = Vec::new();

        for _ in 0..waiters {
            let baton = Baton::new();
            let waiter = baton.clone();
            let (m, s) = (manager.clone(), seen.clone());
            manager
                .add_task(move || {
                    let me = m.current_fiber_id().unwrap();
                    s.borrow_mut().push((me, m.fiber_state(me)));
                    waiter.wait();
                    s.borrow_mut().push((me, m.fiber_state(me)));
                })
                .unwrap();
            batons.push(baton);
        }
        for _ in 0..plain {
            manager.add_task(|| {}).unwrap();
        }

        manager.loop_until_no_ready();
        prop_assert_eq!(manager.stats().active, waiters);
        let ids: Vec<FiberId> = seen.borrow().iter().map(|(id, _)| *id).collect();
        for id in &ids {
            prop_assert_eq!(manager.fiber_state(*id), Some(FiberState::Awaiting));
        }

        for baton in batons {
            baton.post().unwrap();
        }
        manager.loop_until_no_ready();
        prop_assert_eq!(seen.borrow().len(), waiters * 2);
        prop_assert!(seen.borrow().iter().all(|(_, s)| *s == Some(FiberState::Running)));
        // Finished fibers were recycled under fresh handles.
        for id in &ids {
            prop_assert_eq!(manager.fiber_state(*id), None);
        }
    }
}

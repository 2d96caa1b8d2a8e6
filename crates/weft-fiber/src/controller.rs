// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Loop controllers decide when a scheduler pass runs.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{Condvar, Mutex};

use crate::manager::FiberManager;

/// Hook between a fiber manager and whatever event loop drives it.
///
/// `schedule` is called on the owning thread; `schedule_thread_safe` may be
/// called from any thread. Both should lead to `loop_until_no_ready` running
/// on the owning thread soon.
pub trait LoopController: Send + Sync {
    fn schedule(&self);
    fn schedule_thread_safe(&self);
}

#[derive(Default)]
struct LoopState {
    scheduled: bool,
    stopped: bool,
}

/// Blocking controller for a thread that does nothing but run fibers.
#[derive(Default)]
pub struct SimpleLoopController {
    state: Mutex<LoopState>,
    wakeup: Condvar,
    remote_schedules: AtomicUsize,
}

impl SimpleLoopController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run passes until no fiber holds a task and no remote work is queued,
    /// or until `stop` is called.
    ///
    /// Parks the thread while fibers are awaiting something posted from
    /// elsewhere.
    pub fn run_until_idle(&self, manager: &FiberManager) {
        loop {
            let run = {
                let mut state = self.state.lock();
                if state.stopped {
                    return;
                }
                std::mem::take(&mut state.scheduled)
            };
            if run {
                manager.loop_until_no_ready();
                continue;
            }
            if !manager.has_tasks() {
                return;
            }
            let mut state = self.state.lock();
            while !state.scheduled && !state.stopped {
                self.wakeup.wait(&mut state);
            }
        }
    }

    /// Make `run_until_idle` return at its next check.
    pub fn stop(&self) {
        self.state.lock().stopped = true;
        self.wakeup.notify_all();
    }

    /// How many cross-thread schedule requests have arrived.
    pub fn remote_schedule_count(&self) -> usize {
        self.remote_schedules.load(Ordering::Relaxed)
    }

    pub fn is_scheduled(&self) -> bool {
        self.state.lock().scheduled
    }

    fn request(&self) {
        self.state.lock().scheduled = true;
        self.wakeup.notify_one();
    }
}

impl LoopController for SimpleLoopController {
    fn schedule(&self) {
        self.request();
    }

    fn schedule_thread_safe(&self) {
        self.remote_schedules.fetch_add(1, Ordering::Relaxed);
        self.request();
    }
}

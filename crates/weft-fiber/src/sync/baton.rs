// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Baton: one waiter, one post.
//!
//! A fiber waiting on a baton is parked, not blocked; the thread keeps
//! running other fibers. Posting from the owning thread during a pass
//! requeues the fiber locally, anything else goes through the manager's
//! remote-ready queue. Outside a fiber, `wait` blocks the OS thread.

use std::fmt;
use std::mem;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::context;
use crate::error::{self, Fault, FiberError};
use crate::fiber::{FiberId, MainContextFn, Switch};
use crate::manager::ManagerId;
use crate::remote::RemoteShared;

/// A parked fiber and the way back to its manager.
struct FiberWaiter {
    manager: ManagerId,
    fiber: FiberId,
    remote: Arc<RemoteShared>,
}

impl FiberWaiter {
    fn wake(self) {
        if let Some(manager) = context::current_manager() {
            if manager.id == self.manager {
                manager.make_ready(self.fiber);
                return;
            }
        }
        if let Err(err) = self.remote.push_ready(self.fiber) {
            tracing::warn!(fiber = %self.fiber, %err, "baton posted after its manager was dropped");
        }
    }
}

enum BatonState {
    Idle,
    Waiting(FiberWaiter),
    Posted,
    /// The waiter's setup panicked and it left without a post. A late post
    /// from whoever the baton was handed to is absorbed.
    Abandoned,
}

struct BatonInner {
    state: Mutex<BatonState>,
    posted: Condvar,
}

/// One-shot wakeup, cloneable and shareable across threads.
#[derive(Clone)]
pub struct Baton {
    inner: Arc<BatonInner>,
}

impl Baton {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BatonInner {
                state: Mutex::new(BatonState::Idle),
                posted: Condvar::new(),
            }),
        }
    }

    pub fn is_posted(&self) -> bool {
        matches!(*self.inner.state.lock(), BatonState::Posted)
    }

    /// Wake the waiter, now or whenever it arrives.
    ///
    /// A second post is refused with `ProtocolViolation` and changes
    /// nothing.
    pub fn post(&self) -> Result<(), FiberError> {
        let waiter = {
            let mut state = self.inner.state.lock();
            match mem::replace(&mut *state, BatonState::Posted) {
                BatonState::Idle | BatonState::Abandoned => None,
                BatonState::Waiting(waiter) => Some(waiter),
                BatonState::Posted => {
                    tracing::error!("baton posted more than once");
                    return Err(FiberError::ProtocolViolation);
                }
            }
        };
        self.inner.posted.notify_all();
        if let Some(waiter) = waiter {
            waiter.wake();
        }
        Ok(())
    }

    /// Release a fiber whose setup panicked, unless a post got there first.
    fn abandon(&self) {
        let waiter = {
            let mut state = self.inner.state.lock();
            match mem::replace(&mut *state, BatonState::Abandoned) {
                BatonState::Idle => None,
                BatonState::Waiting(waiter) => Some(waiter),
                settled @ (BatonState::Posted | BatonState::Abandoned) => {
                    *state = settled;
                    None
                }
            }
        };
        if let Some(waiter) = waiter {
            waiter.wake();
        }
    }

    /// Suspend until posted.
    pub fn wait(&self) {
        self.wait_with(|| {})
    }

    /// Suspend, run `f`, and stay suspended until posted.
    ///
    /// Inside a fiber, `f` runs on the manager's stack after the fiber is
    /// parked, so it may hand the baton to code that posts it at once. If `f`
    /// panics the fiber is released, a later post is still accepted, and the
    /// panic resumes here.
    /// Outside a fiber, `f` runs first and the thread then blocks.
    pub fn wait_with<F: FnOnce()>(&self, f: F) {
        let scope = context::current_manager()
            .and_then(|manager| manager.current_fiber().map(|fiber| (manager, fiber)));
        match scope {
            Some((manager, fiber)) if context::has_active_fiber() => {
                let waiter = FiberWaiter {
                    manager: manager.id,
                    fiber,
                    remote: Arc::clone(&manager.remote),
                };
                drop(manager);
                self.wait_fiber(waiter, f);
            }
            _ => {
                f();
                self.wait_thread();
            }
        }
    }

    fn wait_fiber<F: FnOnce()>(&self, waiter: FiberWaiter, f: F) {
        let mut waiter = Some(waiter);
        let mut setup = Some(f);
        let mut fault: Option<Fault> = None;
        {
            let mut on_main = || {
                if let Some(waiter) = waiter.take() {
                    if let Err(err) = self.register(waiter) {
                        fault = Some(Fault::new(err));
                        return;
                    }
                }
                if let Some(f) = setup.take() {
                    if let Err(err) = error::catch(f) {
                        fault = Some(err);
                        self.abandon();
                    }
                }
            };
            // SAFETY: `on_main` lives in this frame, which stays put until the
            // fiber is resumed.
            let on_main = unsafe { MainContextFn::erase(&mut on_main) };
            context::switch_to_manager(Switch::Await(on_main));
        }
        if let Some(fault) = fault {
            fault.resume();
        }
    }

    /// Attach the parked fiber, or wake it at once if already posted.
    ///
    /// A baton has room for one waiter. A second one is woken only to
    /// fail with `ProtocolViolation` at its wait site.
    fn register(&self, waiter: FiberWaiter) -> Result<(), FiberError> {
        let mut state = self.inner.state.lock();
        if matches!(*state, BatonState::Idle) {
            *state = BatonState::Waiting(waiter);
            return Ok(());
        }
        let outcome = if matches!(*state, BatonState::Posted) {
            Ok(())
        } else {
            tracing::error!(fiber = %waiter.fiber, "baton already has a waiter");
            Err(FiberError::ProtocolViolation)
        };
        drop(state);
        waiter.wake();
        outcome
    }

    fn wait_thread(&self) {
        let mut state = self.inner.state.lock();
        while !matches!(*state, BatonState::Posted) {
            self.inner.posted.wait(&mut state);
        }
    }
}

impl Default for Baton {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Baton {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Baton")
            .field("posted", &self.is_posted())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn post_then_wait_returns_at_once() {
        let baton = Baton::new();
        baton.post().unwrap();
        assert!(baton.is_posted());
        baton.wait();
    }

    #[test]
    fn double_post_is_a_protocol_violation() {
        let baton = Baton::new();
        baton.post().unwrap();
        assert!(matches!(baton.post(), Err(FiberError::ProtocolViolation)));
        assert!(baton.is_posted());
    }

    #[test]
    fn thread_wait_blocks_until_posted() {
        let baton = Baton::new();
        let remote = baton.clone();
        let poster = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(5));
            remote.post().unwrap();
        });
        baton.wait();
        assert!(baton.is_posted());
        poster.join().unwrap();
    }

    #[test]
    fn wait_with_runs_setup_first() {
        let baton = Baton::new();
        let b = baton.clone();
        baton.wait_with(move || b.post().unwrap());
        assert!(baton.is_posted());
    }
}

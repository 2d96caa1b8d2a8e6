// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Thread-local execution context.
//!
//! Two registries, both empty outside the scheduler:
//! - the manager whose pass is running on this thread;
//! - the yielder of the fiber currently executing on this thread.

use std::cell::{Cell, RefCell};
use std::ptr::NonNull;
use std::rc::Rc;

use crate::fiber::{FiberYielder, Resume, Switch};
use crate::manager::ManagerInner;

thread_local! {
    static CURRENT_MANAGER: RefCell<Option<Rc<ManagerInner>>> = const { RefCell::new(None) };
    static ACTIVE_FIBER: Cell<Option<NonNull<FiberYielder>>> = const { Cell::new(None) };
}

/// Marks `inner` as this thread's current manager until dropped.
pub(crate) struct ManagerScope {
    previous: Option<Rc<ManagerInner>>,
}

impl ManagerScope {
    pub fn enter(inner: Rc<ManagerInner>) -> Self {
        let previous = CURRENT_MANAGER.with(|cell| cell.replace(Some(inner)));
        Self { previous }
    }
}

impl Drop for ManagerScope {
    fn drop(&mut self) {
        let previous = self.previous.take();
        let _ = CURRENT_MANAGER.with(|cell| cell.replace(previous));
    }
}

/// The manager whose pass is running on this thread, if any.
pub(crate) fn current_manager() -> Option<Rc<ManagerInner>> {
    CURRENT_MANAGER.with(|cell| cell.borrow().clone())
}

/// Called by a fiber right after it is switched in.
pub(crate) fn enter_fiber(yielder: &FiberYielder) {
    ACTIVE_FIBER.with(|cell| cell.set(Some(NonNull::from(yielder))));
}

/// Called by a fiber right before it switches out for good.
pub(crate) fn leave_fiber() {
    ACTIVE_FIBER.with(|cell| cell.set(None));
}

/// Detach whatever fiber is active while a manager switches into its own
/// fibers. Matters when one manager's pass runs inside another's fiber.
pub(crate) fn detach_active_fiber() -> Option<NonNull<FiberYielder>> {
    ACTIVE_FIBER.with(|cell| cell.take())
}

pub(crate) fn reattach_active_fiber(outer: Option<NonNull<FiberYielder>>) {
    ACTIVE_FIBER.with(|cell| cell.set(outer));
}

/// Is a fiber executing on this thread right now?
///
/// False on the manager's own context, including while it runs immediate
/// functions on a fiber's behalf.
pub fn has_active_fiber() -> bool {
    ACTIVE_FIBER.with(|cell| cell.get().is_some())
}

/// Switch from the running fiber back to the manager.
///
/// Returns `None` without switching when no fiber is active.
pub(crate) fn switch_to_manager(switch: Switch) -> Option<Resume> {
    let yielder = ACTIVE_FIBER.with(|cell| cell.take())?;
    // SAFETY: the pointer was set by the coroutine body executing on this
    // thread right now, and its yielder lives as long as that body.
    let resume = unsafe { yielder.as_ref() }.suspend(switch);
    ACTIVE_FIBER.with(|cell| cell.set(Some(yielder)));
    Some(resume)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_fiber_outside_scheduler() {
        assert!(!has_active_fiber());
        assert!(current_manager().is_none());
    }

    #[test]
    fn switch_without_fiber_is_refused() {
        assert!(switch_to_manager(Switch::Done(None)).is_none());
    }
}

// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Fiber representation and state machine.
//!
//! Each fiber owns a stackful coroutine whose body loops forever: receive a
//! task, run it, report completion, wait for the next task. A recycled fiber
//! keeps its stack and coroutine, so reuse costs nothing beyond a resume.

use std::fmt;
use std::ptr::NonNull;

use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, Yielder};

use crate::context;
use crate::error::{self, Fault, FiberError};
use crate::local::LocalData;
use crate::options::Options;
use crate::scratch::{ScratchBuffer, TaskFn};

/// Fiber lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FiberState {
    /// Holds a task that has not been entered yet.
    NotStarted,
    /// Suspended and queued to continue.
    ReadyToRun,
    /// Swapped in and executing.
    Running,
    /// Parked while the manager runs a callable on its own stack.
    AwaitingImmediate,
    /// Parked until some agent posts the baton it waits on.
    Awaiting,
    /// Task finished; the fiber is being finalized or sits in the pool.
    Invalid,
}

impl FiberState {
    /// Whether `self -> next` is an edge of the state machine.
    pub fn can_transition_to(self, next: FiberState) -> bool {
        use FiberState::*;
        matches!(
            (self, next),
            (NotStarted, Running)
                | (ReadyToRun, Running)
                | (Running, AwaitingImmediate)
                | (Running, Awaiting)
                | (Running, Invalid)
                | (AwaitingImmediate, ReadyToRun)
                | (Awaiting, ReadyToRun)
                | (Invalid, NotStarted)
        )
    }

    /// Can the scheduler switch into a fiber in this state?
    pub fn is_runnable(self) -> bool {
        matches!(self, FiberState::NotStarted | FiberState::ReadyToRun)
    }
}

/// Handle to a fiber slot. Stale handles are rejected by generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FiberId {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fiber#{}.{}", self.index, self.generation)
    }
}

/// Value passed into a fiber when it is switched in.
pub(crate) enum Resume {
    /// Run a freshly assigned task.
    Start(TaskFn),
    /// Continue after a suspension point.
    Continue,
    /// Leave the task loop so the coroutine returns; used on retirement.
    Exit,
}

/// Value passed out of a fiber when it switches back to the manager.
pub(crate) enum Switch {
    /// Run this on the manager's stack, then resume me right away.
    Immediate(MainContextFn),
    /// Run this on the manager's stack, then leave me parked.
    Await(MainContextFn),
    /// The task returned; carries the fault if it panicked.
    Done(Option<Fault>),
}

pub(crate) type FiberYielder = Yielder<Resume, Switch>;
pub(crate) type FiberCoroutine = Coroutine<Resume, Switch, (), DefaultStack>;

/// Callable that lives on a suspended fiber's stack and is invoked from the
/// manager's context.
pub(crate) struct MainContextFn(NonNull<dyn FnMut()>);

impl MainContextFn {
    /// Erase the borrow of `f`.
    ///
    /// # Safety
    ///
    /// `f` must stay alive and unmoved until the manager has finished calling
    /// it. Holds when `f` is a local of the fiber that yields this value: the
    /// fiber's frame stays intact while it is suspended.
    pub(crate) unsafe fn erase<'a>(f: &mut (dyn FnMut() + 'a)) -> Self {
        let ptr: NonNull<dyn FnMut() + 'a> = NonNull::from(f);
        Self(std::mem::transmute::<NonNull<dyn FnMut() + 'a>, NonNull<dyn FnMut() + 'static>>(ptr))
    }

    /// # Safety
    ///
    /// The fiber that produced this value must still be suspended.
    pub(crate) unsafe fn call(&mut self) {
        (*self.0.as_ptr())()
    }
}

/// A fiber slot: everything that survives across task assignments.
pub(crate) struct Fiber {
    state: FiberState,
    /// Taken out by the scheduler while the fiber is switched in.
    pub(crate) coroutine: Option<FiberCoroutine>,
    pub(crate) task: Option<TaskFn>,
    pub(crate) finally: Option<TaskFn>,
    pub(crate) local_data: LocalData,
    pub(crate) scratch: ScratchBuffer,
}

impl Fiber {
    /// Map a stack and build the coroutine. Fails if the stack can't be mapped.
    pub fn new(options: &Options) -> Result<Self, FiberError> {
        let stack = DefaultStack::new(options.stack_size)?;
        Ok(Self {
            state: FiberState::NotStarted,
            coroutine: Some(Coroutine::with_stack(stack, fiber_main)),
            task: None,
            finally: None,
            local_data: LocalData::default(),
            scratch: ScratchBuffer::new(options.user_buffer_size),
        })
    }

    pub fn state(&self) -> FiberState {
        self.state
    }

    pub fn set_state(&mut self, next: FiberState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid fiber transition {:?} -> {:?}",
            self.state,
            next
        );
        tracing::trace!(from = ?self.state, to = ?next, "fiber state");
        self.state = next;
    }

    /// Install a task body, in the scratch buffer when it fits.
    pub fn set_task<F: FnOnce() + 'static>(&mut self, f: F) {
        // SAFETY: the buffer lives in this slot and is reset only by
        // `reset`, after `task` and `finally` have been cleared.
        let task = unsafe { TaskFn::place(&mut self.scratch, f) };
        tracing::trace!(inline = task.is_inline(), "task installed");
        self.task = Some(task);
    }

    /// Install a task body together with its finally callback.
    pub fn set_task_finally<F, G>(&mut self, f: F, g: G)
    where
        F: FnOnce() + 'static,
        G: FnOnce() + 'static,
    {
        // SAFETY: as in `set_task`.
        let (task, finally) = unsafe { TaskFn::place_pair(&mut self.scratch, f, g) };
        tracing::trace!(inline = task.is_inline(), "task and finally installed");
        self.task = Some(task);
        self.finally = Some(finally);
    }

    pub fn set_boxed_task(&mut self, f: Box<dyn FnOnce() + Send>) {
        self.task = Some(TaskFn::from_box(f));
    }

    /// Clear per-task leftovers before the fiber goes back to the pool.
    pub fn reset(&mut self) {
        debug_assert!(self.task.is_none() && self.finally.is_none());
        self.scratch.reset();
    }

    /// Let the coroutine return so its stack can be released without
    /// unwinding. Fibers suspended mid-task are leaked instead.
    pub fn retire(mut self) {
        let Some(mut coroutine) = self.coroutine.take() else {
            return;
        };
        if !coroutine.started() || coroutine.done() {
            return;
        }
        // Between tasks the coroutine is parked at the top of its loop.
        if matches!(self.state, FiberState::Invalid | FiberState::NotStarted) {
            let _ = coroutine.resume(Resume::Exit);
        } else {
            tracing::warn!(state = ?self.state, "leaking stack of a fiber suspended mid-task");
            std::mem::forget(coroutine);
        }
    }
}

/// Coroutine body shared by every fiber.
fn fiber_main(yielder: &FiberYielder, mut input: Resume) {
    loop {
        let done = match input {
            Resume::Start(task) => {
                context::enter_fiber(yielder);
                let outcome = error::catch(|| task.run());
                context::leave_fiber();
                Switch::Done(outcome.err())
            }
            Resume::Continue => {
                tracing::error!("idle fiber resumed without a task");
                Switch::Done(None)
            }
            Resume::Exit => return,
        };
        input = yielder.suspend(done);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use FiberState::*;

    #[test]
    fn state_machine_edges() {
        assert!(NotStarted.can_transition_to(Running));
        assert!(ReadyToRun.can_transition_to(Running));
        assert!(Running.can_transition_to(AwaitingImmediate));
        assert!(Running.can_transition_to(Awaiting));
        assert!(Running.can_transition_to(Invalid));
        assert!(AwaitingImmediate.can_transition_to(ReadyToRun));
        assert!(Awaiting.can_transition_to(ReadyToRun));
        assert!(Invalid.can_transition_to(NotStarted));
    }

    #[test]
    fn state_machine_rejects_shortcuts() {
        assert!(!NotStarted.can_transition_to(Invalid));
        assert!(!Awaiting.can_transition_to(Running));
        assert!(!Invalid.can_transition_to(Running));
        assert!(!Invalid.can_transition_to(Invalid));
        assert!(!AwaitingImmediate.can_transition_to(Awaiting));
    }

    #[test]
    fn runnable_states() {
        assert!(NotStarted.is_runnable());
        assert!(ReadyToRun.is_runnable());
        assert!(!Awaiting.is_runnable());
        assert!(!Invalid.is_runnable());
    }

    #[test]
    fn coroutine_runs_successive_tasks() {
        let mut fiber = Fiber::new(&Options::default()).unwrap();
        let mut co = fiber.coroutine.take().unwrap();
        let hits = std::rc::Rc::new(std::cell::Cell::new(0));

        for _ in 0..3 {
            let h = hits.clone();
            let task = TaskFn::boxed(move || h.set(h.get() + 1));
            match co.resume(Resume::Start(task)) {
                corosensei::CoroutineResult::Yield(Switch::Done(None)) => {}
                _ => panic!("expected clean completion"),
            }
        }
        assert_eq!(hits.get(), 3);

        assert!(matches!(
            co.resume(Resume::Exit),
            corosensei::CoroutineResult::Return(())
        ));
    }

    #[test]
    fn coroutine_reports_task_panic() {
        let mut fiber = Fiber::new(&Options::default()).unwrap();
        let mut co = fiber.coroutine.take().unwrap();
        let task = TaskFn::boxed(|| panic!("inside fiber"));
        match co.resume(Resume::Start(task)) {
            corosensei::CoroutineResult::Yield(Switch::Done(Some(fault))) => {
                assert_eq!(fault.message(), "inside fiber");
            }
            _ => panic!("expected a captured fault"),
        }
        let _ = co.resume(Resume::Exit);
    }

    #[test]
    fn fiber_id_display() {
        let id = FiberId { index: 3, generation: 1 };
        assert_eq!(id.to_string(), "fiber#3.1");
    }
}

// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! The fiber manager: submission, the scheduling loop and finalization.
//!
//! One manager per worker thread. Local work goes through a plain FIFO of
//! fiber ids; remote work arrives through the queues in `RemoteShared` and
//! is picked up when a pass sweeps them. A pass runs until neither source
//! yields anything new.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use corosensei::CoroutineResult;

use crate::context::{self, ManagerScope};
use crate::controller::LoopController;
use crate::error::{self, Fault, FaultPhase, FiberError};
use crate::fiber::{Fiber, FiberCoroutine, FiberId, FiberState, MainContextFn, Resume, Switch};
use crate::local::LocalData;
use crate::options::Options;
use crate::pool::FiberPool;
use crate::remote::{RemoteHandle, RemoteShared, RemoteTask};

static NEXT_MANAGER_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique manager identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ManagerId(u64);

impl ManagerId {
    pub(crate) fn next() -> Self {
        Self(NEXT_MANAGER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ManagerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "manager#{}", self.0)
    }
}

/// Snapshot of a manager's fiber counts.
///
/// `allocated == active + queued + pooled` holds at every observation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FiberStats {
    /// Fibers with a live slot, idle ones included.
    pub allocated: usize,
    /// Fibers holding a task outside the local ready queue: running,
    /// awaiting, or waiting in the remote-ready queue.
    pub active: usize,
    /// Fibers in the local ready queue.
    pub queued: usize,
    /// Idle fibers kept for reuse.
    pub pooled: usize,
}

type FaultHook = Rc<dyn Fn(&Fault, FaultPhase)>;

fn log_fault(fault: &Fault, phase: FaultPhase) {
    tracing::error!(%phase, fault = %fault, "fiber fault");
}

pub(crate) struct ManagerInner {
    pub(crate) id: ManagerId,
    options: Options,
    pool: RefCell<FiberPool<Fiber>>,
    ready: RefCell<VecDeque<FiberId>>,
    /// Fibers acquired and not yet finalized.
    fibers_active: Cell<usize>,
    current_fiber: Cell<Option<FiberId>>,
    loop_scheduled: Cell<bool>,
    looping: Cell<bool>,
    fault_hook: RefCell<FaultHook>,
    pub(crate) remote: Arc<RemoteShared>,
}

impl ManagerInner {
    fn new(controller: Arc<dyn LoopController>, options: Options) -> Self {
        let id = ManagerId::next();
        Self {
            id,
            pool: RefCell::new(FiberPool::new(options.max_fibers_pool_size)),
            options,
            ready: RefCell::new(VecDeque::new()),
            fibers_active: Cell::new(0),
            current_fiber: Cell::new(None),
            loop_scheduled: Cell::new(false),
            looping: Cell::new(false),
            fault_hook: RefCell::new(Rc::new(log_fault)),
            remote: Arc::new(RemoteShared::new(id, controller)),
        }
    }

    /// Fiber whose task is being run, including while the manager runs an
    /// immediate or await callable on its behalf.
    pub(crate) fn current_fiber(&self) -> Option<FiberId> {
        self.current_fiber.get()
    }

    /// Hand a fault to the hook. A panicking hook is logged and otherwise
    /// ignored; the pass carries on.
    fn report(&self, fault: &Fault, phase: FaultPhase) {
        let hook = Rc::clone(&self.fault_hook.borrow());
        if let Err(hook_fault) = error::catch(|| hook(fault, phase)) {
            tracing::error!(%phase, fault = %fault, hook = %hook_fault, "fault hook panicked");
        }
    }

    fn ensure_loop_scheduled(&self) {
        if !self.loop_scheduled.replace(true) {
            self.remote.controller.schedule();
        }
    }

    fn set_fiber_state(&self, id: FiberId, next: FiberState) {
        match self.pool.borrow_mut().get_mut(id) {
            Some(fiber) => fiber.set_state(next),
            None => tracing::warn!(fiber = %id, "state change for stale fiber"),
        }
    }

    // Local data

    /// Copy of the current fiber's local data.
    pub(crate) fn snapshot_local(&self) -> Option<LocalData> {
        let id = self.current_fiber.get()?;
        let data = self
            .pool
            .borrow_mut()
            .get_mut(id)
            .map(|fiber| std::mem::take(&mut fiber.local_data))?;
        let copy = data.clone();
        if let Some(fiber) = self.pool.borrow_mut().get_mut(id) {
            fiber.local_data = data;
        }
        Some(copy)
    }

    pub(crate) fn take_local<T: Default + Clone + Send + 'static>(&self, id: FiberId) -> Box<T> {
        let taken = self
            .pool
            .borrow_mut()
            .get_mut(id)
            .map(|fiber| fiber.local_data.take::<T>());
        taken.unwrap_or_default()
    }

    pub(crate) fn put_local<T: Default + Clone + Send + 'static>(&self, id: FiberId, value: Box<T>) {
        let leftover = match self.pool.borrow_mut().get_mut(id) {
            Some(fiber) => {
                fiber.local_data.put(value);
                None
            }
            None => Some(value),
        };
        drop(leftover);
    }

    // Fiber lifecycle

    fn acquire_fiber(&self) -> Result<FiberId, FiberError> {
        let recycled = self.pool.borrow_mut().acquire_idle();
        let id = match recycled {
            Some(id) => {
                self.set_fiber_state(id, FiberState::NotStarted);
                id
            }
            None => {
                let fiber = Fiber::new(&self.options)?;
                let id = self.pool.borrow_mut().insert(fiber);
                tracing::debug!(fiber = %id, manager = %self.id, "allocated fiber");
                id
            }
        };
        self.fibers_active.set(self.fibers_active.get() + 1);
        Ok(id)
    }

    fn install<I>(&self, id: FiberId, local_data: Option<LocalData>, install: I)
    where
        I: FnOnce(&mut Fiber),
    {
        let mut pool = self.pool.borrow_mut();
        if let Some(fiber) = pool.get_mut(id) {
            if let Some(data) = local_data {
                fiber.local_data = data;
            }
            install(fiber);
        }
    }

    /// Put the coroutine back into its slot after a switch.
    fn park(&self, id: FiberId, coroutine: FiberCoroutine) {
        let orphan = match self.pool.borrow_mut().get_mut(id) {
            Some(fiber) => {
                fiber.coroutine = Some(coroutine);
                None
            }
            None => Some(coroutine),
        };
        if let Some(coroutine) = orphan {
            tracing::error!(fiber = %id, "fiber slot vanished while switched in");
            std::mem::forget(coroutine);
        }
    }

    fn run_ready_fiber(&self, id: FiberId) {
        let taken = {
            let mut pool = self.pool.borrow_mut();
            match pool.get_mut(id) {
                Some(fiber) if fiber.state().is_runnable() => {
                    let input = match (fiber.state(), fiber.task.take()) {
                        (FiberState::NotStarted, Some(task)) => Resume::Start(task),
                        (_, task) => {
                            fiber.task = task;
                            Resume::Continue
                        }
                    };
                    fiber.coroutine.take().map(|coroutine| (coroutine, input))
                }
                Some(fiber) => {
                    tracing::warn!(fiber = %id, state = ?fiber.state(), "fiber is not runnable");
                    None
                }
                None => {
                    tracing::warn!(fiber = %id, "stale fiber in ready queue");
                    None
                }
            }
        };
        let Some((mut coroutine, mut input)) = taken else {
            return;
        };

        let previous = self.current_fiber.replace(Some(id));
        let outer = context::detach_active_fiber();
        loop {
            self.set_fiber_state(id, FiberState::Running);
            match coroutine.resume(input) {
                CoroutineResult::Yield(Switch::Immediate(mut func)) => {
                    self.set_fiber_state(id, FiberState::AwaitingImmediate);
                    // SAFETY: the fiber that yielded `func` is suspended.
                    if let Err(fault) = error::catch(|| unsafe { func.call() }) {
                        self.report(&fault, FaultPhase::Immediate);
                    }
                    self.set_fiber_state(id, FiberState::ReadyToRun);
                    input = Resume::Continue;
                }
                CoroutineResult::Yield(Switch::Await(mut func)) => {
                    self.set_fiber_state(id, FiberState::Awaiting);
                    self.park(id, coroutine);
                    // SAFETY: as above; the fiber stays parked until this
                    // callable or someone it hands off to posts its baton.
                    if let Err(fault) = error::catch(|| unsafe { func.call() }) {
                        self.report(&fault, FaultPhase::Immediate);
                    }
                    break;
                }
                CoroutineResult::Yield(Switch::Done(fault)) => {
                    self.set_fiber_state(id, FiberState::Invalid);
                    self.park(id, coroutine);
                    if let Some(fault) = fault {
                        self.report(&fault, FaultPhase::Task);
                    }
                    self.finalize(id);
                    break;
                }
                CoroutineResult::Return(()) => {
                    tracing::error!(fiber = %id, "fiber coroutine returned");
                    drop(self.pool.borrow_mut().remove(id));
                    self.fibers_active.set(self.fibers_active.get().saturating_sub(1));
                    break;
                }
            }
        }
        context::reattach_active_fiber(outer);
        self.current_fiber.set(previous);
    }

    /// Run the finally callback, drop local data, then recycle or retire.
    fn finalize(&self, id: FiberId) {
        let taken = self
            .pool
            .borrow_mut()
            .get_mut(id)
            .map(|fiber| (fiber.task.take(), fiber.finally.take()));
        if let Some((task, finally)) = taken {
            drop(task);
            if let Some(finally) = finally {
                if let Err(fault) = error::catch(|| finally.run()) {
                    self.report(&fault, FaultPhase::Finally);
                }
            }
        }

        let local_data = self
            .pool
            .borrow_mut()
            .get_mut(id)
            .map(|fiber| std::mem::take(&mut fiber.local_data));
        drop(local_data);

        let retired = {
            let mut pool = self.pool.borrow_mut();
            if let Some(fiber) = pool.get_mut(id) {
                fiber.reset();
            }
            if pool.release(id) {
                None
            } else {
                pool.remove(id)
            }
        };
        self.fibers_active.set(self.fibers_active.get().saturating_sub(1));
        if let Some(fiber) = retired {
            tracing::debug!(fiber = %id, "retiring fiber, pool is full");
            fiber.retire();
        }
    }

    /// Mark an awaiting fiber ready and queue it locally.
    pub(crate) fn make_ready(&self, id: FiberId) {
        let woken = match self.pool.borrow_mut().get_mut(id) {
            Some(fiber) if fiber.state() == FiberState::Awaiting => {
                fiber.set_state(FiberState::ReadyToRun);
                true
            }
            Some(fiber) => {
                tracing::warn!(fiber = %id, state = ?fiber.state(), "wakeup for fiber that is not awaiting");
                false
            }
            None => {
                tracing::warn!(fiber = %id, "wakeup for stale fiber");
                false
            }
        };
        if woken {
            self.ready.borrow_mut().push_back(id);
            self.ensure_loop_scheduled();
        }
    }

    // Scheduling loop

    fn drain_ready(&self) {
        loop {
            let next = self.ready.borrow_mut().pop_front();
            let Some(id) = next else { break };
            self.run_ready_fiber(id);
        }
    }

    fn resume_remote(&self, id: FiberId) {
        let woken = match self.pool.borrow_mut().get_mut(id) {
            Some(fiber) if fiber.state() == FiberState::Awaiting => {
                fiber.set_state(FiberState::ReadyToRun);
                true
            }
            _ => false,
        };
        if woken {
            self.run_ready_fiber(id);
        } else {
            tracing::warn!(fiber = %id, "ignoring remote wakeup");
        }
    }

    fn start_remote(&self, remote: RemoteTask) {
        let id = match self.acquire_fiber() {
            Ok(id) => id,
            Err(err) => {
                self.report(&Fault::new(err), FaultPhase::Task);
                return;
            }
        };
        let RemoteTask { task, local_data } = remote;
        self.install(id, local_data, move |fiber| fiber.set_boxed_task(task));
        self.run_ready_fiber(id);
    }
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        self.remote.close();
        let fibers = self.pool.get_mut().drain();
        tracing::debug!(manager = %self.id, fibers = fibers.len(), "tearing down fiber manager");
        for (_, fiber) in fibers {
            fiber.retire();
        }
        self.remote.tasks.sweep(drop);
        self.remote.ready.sweep(drop);
    }
}

/// Resets the loop flags when a pass ends, also on unwind.
struct PassGuard<'a>(&'a ManagerInner);

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.looping.set(false);
        self.0.loop_scheduled.set(false);
    }
}

/// Cooperative scheduler for fibers on one thread.
///
/// Handles are cheap clones of one shared manager; it is torn down when the
/// last handle is dropped. Not `Send`: every fiber runs on the thread that
/// created its manager. Use [`RemoteHandle`] to submit from elsewhere.
#[derive(Clone)]
pub struct FiberManager {
    inner: Rc<ManagerInner>,
}

impl FiberManager {
    pub fn new(controller: Arc<dyn LoopController>) -> Self {
        Self::with_options(controller, Options::default())
    }

    pub fn with_options(controller: Arc<dyn LoopController>, options: Options) -> Self {
        Self {
            inner: Rc::new(ManagerInner::new(controller, options)),
        }
    }

    /// The manager whose pass is running on this thread.
    pub fn current() -> Option<FiberManager> {
        context::current_manager().map(|inner| FiberManager { inner })
    }

    pub fn id(&self) -> ManagerId {
        self.inner.id
    }

    pub fn options(&self) -> &Options {
        &self.inner.options
    }

    /// Thread-safe submission handle.
    pub fn remote(&self) -> RemoteHandle {
        RemoteHandle {
            shared: Arc::clone(&self.inner.remote),
        }
    }

    /// Replace the callback that receives faults from tasks, finally
    /// callbacks and immediate functions. The default logs them.
    pub fn set_fault_hook<H>(&self, hook: H)
    where
        H: Fn(&Fault, FaultPhase) + 'static,
    {
        *self.inner.fault_hook.borrow_mut() = Rc::new(hook);
    }

    /// Queue `f` to run in a fiber during the next pass.
    ///
    /// Inherits a copy of the current fiber's local data when called from
    /// inside one.
    pub fn add_task<F>(&self, f: F) -> Result<(), FiberError>
    where
        F: FnOnce() + 'static,
    {
        let inner = &self.inner;
        let local_data = inner.snapshot_local();
        let id = inner.acquire_fiber()?;
        inner.install(id, local_data, move |fiber| fiber.set_task(f));
        inner.ready.borrow_mut().push_back(id);
        inner.ensure_loop_scheduled();
        Ok(())
    }

    /// Queue `f`, then run `finally` with its outcome on the manager's
    /// context. `finally` runs exactly once, also when `f` panics; a panic in
    /// `finally` goes to the fault hook.
    pub fn add_task_finally<T, F, G>(&self, f: F, finally: G) -> Result<(), FiberError>
    where
        T: 'static,
        F: FnOnce() -> T + 'static,
        G: FnOnce(Result<T, Fault>) + 'static,
    {
        let slot: Rc<Cell<Option<Result<T, Fault>>>> = Rc::new(Cell::new(None));
        let out = Rc::clone(&slot);
        let body = move || out.set(Some(error::catch(f)));
        let tail = move || {
            if let Some(outcome) = slot.take() {
                finally(outcome);
            }
        };

        let inner = &self.inner;
        let local_data = inner.snapshot_local();
        let id = inner.acquire_fiber()?;
        inner.install(id, local_data, move |fiber| fiber.set_task_finally(body, tail));
        inner.ready.borrow_mut().push_back(id);
        inner.ensure_loop_scheduled();
        Ok(())
    }

    /// Same as [`RemoteHandle::add_task_remote`].
    pub fn add_task_remote<F>(&self, f: F) -> Result<(), FiberError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.remote().add_task_remote(f)
    }

    /// Run fibers until the local ready queue and both remote queues are
    /// empty. Returns true if some fiber still holds a task, i.e. awaits.
    ///
    /// Calling this from inside a pass does nothing.
    pub fn loop_until_no_ready(&self) -> bool {
        let inner = &*self.inner;
        if inner.looping.replace(true) {
            tracing::warn!(manager = %inner.id, "nested loop_until_no_ready ignored");
            return inner.fibers_active.get() > 0;
        }
        let _scope = ManagerScope::enter(Rc::clone(&self.inner));
        let _pass = PassGuard(inner);
        inner.loop_scheduled.set(true);

        loop {
            inner.drain_ready();
            let woken = inner.remote.ready.sweep(|id| inner.resume_remote(id));
            let started = inner.remote.tasks.sweep(|task| inner.start_remote(task));
            tracing::trace!(manager = %inner.id, woken, started, "swept remote queues");
            if woken == 0 && started == 0 {
                break;
            }
        }
        inner.fibers_active.get() > 0
    }

    /// Is one of this manager's fibers executing on this thread?
    pub fn has_active_fiber(&self) -> bool {
        let running_here = context::current_manager()
            .is_some_and(|current| Rc::ptr_eq(&current, &self.inner));
        running_here && self.inner.current_fiber.get().is_some() && context::has_active_fiber()
    }

    /// Any fiber holding a task, or remote work not yet swept.
    pub fn has_tasks(&self) -> bool {
        self.inner.fibers_active.get() > 0
            || !self.inner.remote.tasks.is_empty()
            || !self.inner.remote.ready.is_empty()
    }

    pub fn stats(&self) -> FiberStats {
        let pool = self.inner.pool.borrow();
        let queued = self.inner.ready.borrow().len();
        FiberStats {
            allocated: pool.len(),
            active: self.inner.fibers_active.get().saturating_sub(queued),
            queued,
            pooled: pool.idle_len(),
        }
    }

    /// State of a fiber; `None` once its task has finished.
    pub fn fiber_state(&self, id: FiberId) -> Option<FiberState> {
        self.inner.pool.borrow().get(id).map(Fiber::state)
    }

    pub fn current_fiber_id(&self) -> Option<FiberId> {
        self.inner.current_fiber.get()
    }
}

impl fmt::Debug for FiberManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiberManager")
            .field("id", &self.inner.id)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Run `f` on the manager's own stack and return its result.
///
/// Inside a fiber, the fiber is suspended while `f` runs and resumed right
/// after, without going through the ready queue. A panic in `f` resumes in
/// the caller. Outside a fiber `f` simply runs in place.
pub fn run_in_main_context<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    if !context::has_active_fiber() {
        return f();
    }
    let mut func = Some(f);
    let mut outcome: Option<Result<R, Fault>> = None;
    {
        let mut call = || {
            if let Some(f) = func.take() {
                outcome = Some(error::catch(f));
            }
        };
        // SAFETY: `call` lives in this frame, which stays put until the
        // manager has run it and switched back.
        let call = unsafe { MainContextFn::erase(&mut call) };
        context::switch_to_manager(Switch::Immediate(call));
    }
    match (outcome, func) {
        (Some(Ok(value)), _) => value,
        (Some(Err(fault)), _) => fault.resume(),
        (None, Some(f)) => f(),
        (None, None) => unreachable!("immediate function consumed without an outcome"),
    }
}

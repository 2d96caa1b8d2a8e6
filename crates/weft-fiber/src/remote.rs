// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Cross-thread entry points into a fiber manager.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::context;
use crate::controller::LoopController;
use crate::error::FiberError;
use crate::fiber::FiberId;
use crate::local::LocalData;
use crate::manager::ManagerId;
use crate::queue::RemoteQueue;

/// A task submitted from another thread, waiting for the next sweep.
pub(crate) struct RemoteTask {
    pub task: Box<dyn FnOnce() + Send>,
    pub local_data: Option<LocalData>,
}

/// State shared between a manager and its remote handles.
pub(crate) struct RemoteShared {
    pub id: ManagerId,
    pub tasks: RemoteQueue<RemoteTask>,
    /// Awaiting fibers whose baton was posted off the owning thread.
    pub ready: RemoteQueue<FiberId>,
    pub controller: Arc<dyn LoopController>,
    closed: AtomicBool,
}

impl RemoteShared {
    pub fn new(id: ManagerId, controller: Arc<dyn LoopController>) -> Self {
        Self {
            id,
            tasks: RemoteQueue::new(),
            ready: RemoteQueue::new(),
            controller,
            closed: AtomicBool::new(false),
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn push_task(&self, task: RemoteTask) -> Result<(), FiberError> {
        if self.is_closed() {
            return Err(FiberError::ManagerClosed);
        }
        if self.tasks.insert_head(task) {
            self.controller.schedule_thread_safe();
        }
        Ok(())
    }

    /// Queue an awaiting fiber for resumption on the owning thread.
    pub fn push_ready(&self, fiber: FiberId) -> Result<(), FiberError> {
        if self.is_closed() {
            return Err(FiberError::ManagerClosed);
        }
        tracing::trace!(%fiber, manager = %self.id, "remote wakeup");
        if self.ready.insert_head(fiber) {
            self.controller.schedule_thread_safe();
        }
        Ok(())
    }
}

/// Thread-safe handle for submitting work to a fiber manager.
#[derive(Clone)]
pub struct RemoteHandle {
    pub(crate) shared: Arc<RemoteShared>,
}

impl RemoteHandle {
    pub fn manager_id(&self) -> ManagerId {
        self.shared.id
    }

    /// True once the manager has been dropped.
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Submit `f` to run in a fresh fiber on the manager's thread.
    ///
    /// If a fiber is running on the calling thread, its local data is copied
    /// into the new task.
    pub fn add_task_remote<F>(&self, f: F) -> Result<(), FiberError>
    where
        F: FnOnce() + Send + 'static,
    {
        let local_data = context::current_manager().and_then(|m| m.snapshot_local());
        self.shared.push_task(RemoteTask {
            task: Box::new(f),
            local_data,
        })
    }
}

impl fmt::Debug for RemoteHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteHandle")
            .field("manager", &self.shared.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

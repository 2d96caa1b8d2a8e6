// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Errors and captured faults.
//!
//! A `Fault` is a panic payload caught at a context-switch boundary. It is
//! either handed to the manager's fault hook or re-raised at the call site
//! that asked for it (`run_in_main_context`, `await_promise`).

use std::any::Any;
use std::fmt;
use std::io;
use std::panic;

use thiserror::Error;

/// Errors returned by the fiber manager and its synchronisation primitives.
#[derive(Debug, Error)]
pub enum FiberError {
    /// The stack for a fresh fiber could not be mapped.
    #[error("failed to allocate fiber stack: {0}")]
    StackAllocation(#[from] io::Error),

    /// A baton was posted after it had already been posted.
    #[error("baton posted more than once")]
    ProtocolViolation,

    /// A promise was dropped without a value or fault.
    #[error("promise dropped without being fulfilled")]
    BrokenPromise,

    /// The owning manager is gone; remote work can no longer be delivered.
    #[error("fiber manager has been dropped")]
    ManagerClosed,
}

/// Where a fault was caught.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPhase {
    /// Body of a submitted task.
    Task,
    /// Finally callback registered with `add_task_finally`.
    Finally,
    /// Callable executed on the manager's own context on behalf of a fiber.
    Immediate,
}

impl fmt::Display for FaultPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultPhase::Task => write!(f, "running task"),
            FaultPhase::Finally => write!(f, "running finally callback"),
            FaultPhase::Immediate => write!(f, "running immediate function"),
        }
    }
}

/// A captured panic.
pub struct Fault {
    payload: Box<dyn Any + Send>,
}

impl Fault {
    /// Wrap a payload returned by `catch_unwind`.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        Self { payload }
    }

    /// Wrap an error value. `downcast_ref::<E>()` recovers it.
    pub fn new<E: Any + Send>(error: E) -> Self {
        Self {
            payload: Box::new(error),
        }
    }

    /// Human-readable description of the payload.
    pub fn message(&self) -> String {
        if let Some(s) = self.payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = self.payload.downcast_ref::<String>() {
            s.clone()
        } else if let Some(e) = self.payload.downcast_ref::<FiberError>() {
            e.to_string()
        } else {
            "unknown panic".to_string()
        }
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.payload.downcast_ref::<T>()
    }

    pub fn is<T: Any>(&self) -> bool {
        self.payload.is::<T>()
    }

    pub fn into_panic(self) -> Box<dyn Any + Send> {
        self.payload
    }

    /// Continue unwinding with the original payload.
    pub fn resume(self) -> ! {
        panic::resume_unwind(self.payload)
    }
}

impl fmt::Debug for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Fault").field(&self.message()).finish()
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message())
    }
}

/// Run `f`, turning a panic into a `Fault`.
pub(crate) fn catch<R>(f: impl FnOnce() -> R) -> Result<R, Fault> {
    panic::catch_unwind(panic::AssertUnwindSafe(f)).map_err(Fault::from_panic)
}

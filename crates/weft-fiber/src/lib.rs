// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Cooperative fibers on a single thread.
//!
//! A [`FiberManager`] multiplexes many tasks onto the thread that owns it.
//! Each task runs on a pooled stackful fiber and may park itself until
//! some other agent, on any thread, hands it a value. Code inside a fiber
//! reads as plain blocking code.
//!
//! Components:
//! - manager: submission, scheduling loop, fiber finalization and reuse
//! - fiber: per-fiber state machine and coroutine body
//! - sync: `Baton`, `Promise` and `await_promise`
//! - local: fiber-scoped and thread-scoped storage
//! - controller: the hook that decides when a pass runs
//! - remote: thread-safe submission handle
//!
//! ```no_run
//! use std::sync::Arc;
//! use weft_fiber::{await_promise, FiberManager, SimpleLoopController};
//!
//! let controller = Arc::new(SimpleLoopController::new());
//! let manager = FiberManager::new(controller.clone());
//! manager
//!     .add_task(|| {
//!         let n: u32 = await_promise(|promise| {
//!             std::thread::spawn(move || promise.set_value(42));
//!         });
//!         assert_eq!(n, 42);
//!     })
//!     .unwrap();
//! controller.run_until_idle(&manager);
//! ```

mod context;
pub mod controller;
pub mod error;
pub mod fiber;
mod local;
pub mod manager;
pub mod options;
mod pool;
mod queue;
pub mod remote;
mod scratch;
pub mod sync;

pub use context::has_active_fiber;
pub use controller::{LoopController, SimpleLoopController};
pub use error::{Fault, FaultPhase, FiberError};
pub use fiber::{FiberId, FiberState};
pub use local::{local, local_thread};
pub use manager::{run_in_main_context, FiberManager, FiberStats, ManagerId};
pub use options::Options;
pub use remote::RemoteHandle;
pub use sync::{await_promise, Baton, Promise};

// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Promise / await: park a fiber until a value arrives.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use super::Baton;
use crate::error::{self, Fault, FiberError};

struct PromiseShared<T> {
    outcome: Mutex<Option<Result<T, Fault>>>,
    baton: Baton,
}

impl<T> PromiseShared<T> {
    fn complete(&self, outcome: Result<T, Fault>) {
        *self.outcome.lock() = Some(outcome);
        if let Err(err) = self.baton.post() {
            tracing::error!(%err, "promise completed twice");
        }
    }
}

/// Producer side of [`await_promise`]. Consumed by fulfilment; dropping it
/// unfulfilled hands the waiter a `BrokenPromise` fault.
pub struct Promise<T> {
    shared: Option<Arc<PromiseShared<T>>>,
}

impl<T> Promise<T> {
    pub fn set_value(self, value: T) {
        self.fulfil(Ok(value))
    }

    pub fn set_fault(self, fault: Fault) {
        self.fulfil(Err(fault))
    }

    pub fn fulfil(mut self, outcome: Result<T, Fault>) {
        if let Some(shared) = self.shared.take() {
            shared.complete(outcome);
        }
    }

    /// Fulfil with the result of `f`, or with its panic.
    pub fn set_with<F: FnOnce() -> T>(self, f: F) {
        self.fulfil(error::catch(f))
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            tracing::debug!("promise dropped unfulfilled");
            shared.complete(Err(Fault::new(FiberError::BrokenPromise)));
        }
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise").finish_non_exhaustive()
    }
}

/// Suspend the current fiber, hand `setup` a promise, and return the value
/// it is fulfilled with.
///
/// `setup` runs on the manager's stack once the fiber is parked. The promise
/// may be fulfilled from any thread; the fiber always resumes on its own.
/// A fault set on the promise, or a panic in `setup`, resumes here. Outside
/// a fiber, `setup` runs inline and the thread blocks until fulfilment.
pub fn await_promise<T, S>(setup: S) -> T
where
    S: FnOnce(Promise<T>),
{
    let shared = Arc::new(PromiseShared {
        outcome: Mutex::new(None),
        baton: Baton::new(),
    });
    let promise = Promise {
        shared: Some(Arc::clone(&shared)),
    };

    let mut setup_fault = None;
    shared.baton.wait_with(|| {
        if let Err(fault) = error::catch(|| setup(promise)) {
            setup_fault = Some(fault);
        }
    });
    if let Some(fault) = setup_fault {
        fault.resume();
    }

    let outcome = shared.outcome.lock().take();
    match outcome {
        Some(Ok(value)) => value,
        Some(Err(fault)) => fault.resume(),
        None => Fault::new(FiberError::BrokenPromise).resume(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn inline_fulfilment_outside_fiber() {
        assert_eq!(await_promise(|p: Promise<u32>| p.set_value(7)), 7);
    }

    #[test]
    fn thread_fulfilment_outside_fiber() {
        let v = await_promise(|p: Promise<String>| {
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(5));
                p.set_value("late".to_string());
            });
        });
        assert_eq!(v, "late");
    }

    #[test]
    fn dropped_promise_is_broken() {
        let fault = error::catch(|| await_promise(|p: Promise<u8>| drop(p))).unwrap_err();
        assert!(matches!(
            fault.downcast_ref::<FiberError>(),
            Some(FiberError::BrokenPromise)
        ));
    }

    #[test]
    fn set_fault_reraises() {
        let fault = error::catch(|| {
            await_promise(|p: Promise<u8>| p.set_fault(Fault::new("bad input".to_string())))
        })
        .unwrap_err();
        assert_eq!(fault.message(), "bad input");
    }

    #[test]
    fn set_with_captures_panic() {
        let fault = error::catch(|| {
            await_promise(|p: Promise<u8>| p.set_with(|| panic!("producer failed")))
        })
        .unwrap_err();
        assert_eq!(fault.message(), "producer failed");
    }

    #[test]
    fn setup_panic_wins_over_broken_promise() {
        let fault = error::catch(|| await_promise(|_p: Promise<u8>| panic!("setup failed")))
            .unwrap_err();
        assert_eq!(fault.message(), "setup failed");
    }
}

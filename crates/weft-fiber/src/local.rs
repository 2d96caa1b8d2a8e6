// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Fiber-local and thread-local storage.
//!
//! Closure-based access, no escaping references. The value is moved out of
//! its store while the closure runs, so the closure may submit tasks or
//! touch other local types without tripping over a held borrow.

use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::collections::HashMap;

use crate::context;

/// Object-safe view of a fiber-local value.
pub(crate) trait LocalValue: Any + Send {
    fn clone_value(&self) -> Box<dyn LocalValue>;
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;
}

impl<T: Any + Send + Clone> LocalValue for T {
    fn clone_value(&self) -> Box<dyn LocalValue> {
        Box::new(self.clone())
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

/// Per-fiber values keyed by type. Cloned wholesale when a task inherits
/// its submitter's data.
#[derive(Default)]
pub(crate) struct LocalData {
    values: HashMap<TypeId, Box<dyn LocalValue>>,
}

impl LocalData {
    /// Remove the `T` slot, or make a default one.
    pub fn take<T: Default + Clone + Send + 'static>(&mut self) -> Box<T> {
        match self.values.remove(&TypeId::of::<T>()) {
            Some(value) => value.into_any().downcast::<T>().unwrap_or_default(),
            None => Box::default(),
        }
    }

    pub fn put<T: Default + Clone + Send + 'static>(&mut self, value: Box<T>) {
        self.values.insert(TypeId::of::<T>(), value);
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl Clone for LocalData {
    fn clone(&self) -> Self {
        Self {
            values: self
                .values
                .iter()
                .map(|(id, value)| (*id, value.clone_value()))
                .collect(),
        }
    }
}

thread_local! {
    static THREAD_LOCALS: RefCell<HashMap<TypeId, Box<dyn Any>>> = RefCell::new(HashMap::new());
}

/// Puts a taken value back into its store, also on unwind.
struct Restore<T: Default, P: FnOnce(Box<T>)> {
    value: Box<T>,
    put: Option<P>,
}

impl<T: Default, P: FnOnce(Box<T>)> Drop for Restore<T, P> {
    fn drop(&mut self) {
        if let Some(put) = self.put.take() {
            put(std::mem::take(&mut self.value));
        }
    }
}

/// Access the calling fiber's `T`, or this thread's `T` outside a fiber.
///
/// The fiber-scoped value is created on first use and dropped when the fiber
/// finishes its task. Tasks submitted from inside a fiber start with a copy
/// of the submitter's values.
pub fn local<T, R, F>(f: F) -> R
where
    T: Default + Clone + Send + 'static,
    F: FnOnce(&mut T) -> R,
{
    let scope = context::current_manager()
        .and_then(|manager| manager.current_fiber().map(|fiber| (manager, fiber)));

    match scope {
        Some((manager, fiber)) => {
            let value = manager.take_local::<T>(fiber);
            let mut guard = Restore {
                value,
                put: Some(move |value: Box<T>| manager.put_local(fiber, value)),
            };
            f(&mut *guard.value)
        }
        None => local_thread(f),
    }
}

/// Access this thread's `T`, created on first use, living as long as the
/// thread.
pub fn local_thread<T, R, F>(f: F) -> R
where
    T: Default + 'static,
    F: FnOnce(&mut T) -> R,
{
    let value = THREAD_LOCALS
        .with(|map| map.borrow_mut().remove(&TypeId::of::<T>()))
        .and_then(|value| value.downcast::<T>().ok())
        .unwrap_or_default();
    let mut guard = Restore {
        value,
        put: Some(|value: Box<T>| {
            THREAD_LOCALS.with(|map| {
                map.borrow_mut().insert(TypeId::of::<T>(), value);
            })
        }),
    };
    f(&mut *guard.value)
}

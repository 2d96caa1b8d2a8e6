// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Multi-producer queue drained by the owning thread.
//!
//! Producers on any thread push under a short lock. The owner swaps the
//! whole batch out in one step and visits it outside the lock, oldest
//! first.

use std::mem;

use parking_lot::Mutex;

pub(crate) struct RemoteQueue<T> {
    items: Mutex<Vec<T>>,
}

impl<T> RemoteQueue<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(Vec::new()),
        }
    }

    /// Push an item. Returns true if the queue was empty before, meaning
    /// the owner may need a wakeup.
    pub fn insert_head(&self, item: T) -> bool {
        let mut items = self.items.lock();
        let was_empty = items.is_empty();
        items.push(item);
        was_empty
    }

    /// Take everything queued so far and visit it in insertion order.
    ///
    /// Items pushed while `f` runs wait for the next sweep. Returns the
    /// number of items visited.
    pub fn sweep(&self, mut f: impl FnMut(T)) -> usize {
        let batch = mem::take(&mut *self.items.lock());
        let count = batch.len();
        for item in batch {
            f(item);
        }
        count
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }
}

impl<T> Default for RemoteQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Fiber slots and the idle pool.
//!
//! Every allocated fiber lives in a generational arena. Finished fibers go
//! onto an idle list, bounded by `max_fibers_pool_size`, and are handed out
//! again before any new stack is mapped. A slot's generation moves forward
//! whenever it is recycled or freed, so handles held past a task's end stop
//! resolving.

use crate::fiber::FiberId;

enum Slot<T> {
    Occupied { value: T, generation: u32 },
    Vacant { next_free: Option<u32>, generation: u32 },
}

pub(crate) struct FiberPool<T> {
    slots: Vec<Slot<T>>,
    free_head: Option<u32>,
    len: usize,
    idle: Vec<FiberId>,
    max_idle: usize,
}

impl<T> FiberPool<T> {
    pub fn new(max_idle: usize) -> Self {
        Self {
            slots: Vec::new(),
            free_head: None,
            len: 0,
            idle: Vec::new(),
            max_idle,
        }
    }

    /// Number of live slots, idle ones included.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn idle_len(&self) -> usize {
        self.idle.len()
    }

    pub fn is_idle_full(&self) -> bool {
        self.idle.len() >= self.max_idle
    }

    pub fn insert(&mut self, value: T) -> FiberId {
        self.len += 1;
        if let Some(index) = self.free_head {
            let slot = &mut self.slots[index as usize];
            if let Slot::Vacant {
                next_free,
                generation,
            } = *slot
            {
                self.free_head = next_free;
                *slot = Slot::Occupied { value, generation };
                return FiberId { index, generation };
            }
            // Free list pointed at a live slot; drop the list and append.
            tracing::error!(index, "fiber free list corrupted");
            self.free_head = None;
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot::Occupied {
            value,
            generation: 0,
        });
        FiberId {
            index,
            generation: 0,
        }
    }

    pub fn get(&self, id: FiberId) -> Option<&T> {
        match self.slots.get(id.index as usize)? {
            Slot::Occupied { value, generation } if *generation == id.generation => Some(value),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, id: FiberId) -> Option<&mut T> {
        match self.slots.get_mut(id.index as usize)? {
            Slot::Occupied { value, generation } if *generation == id.generation => Some(value),
            _ => None,
        }
    }

    #[cfg(test)]
    pub fn contains(&self, id: FiberId) -> bool {
        self.get(id).is_some()
    }

    /// Free the slot and return its value.
    pub fn remove(&mut self, id: FiberId) -> Option<T> {
        let slot = self.slots.get_mut(id.index as usize)?;
        match slot {
            Slot::Occupied { generation, .. } if *generation == id.generation => {}
            _ => return None,
        }
        let vacant = Slot::Vacant {
            next_free: self.free_head,
            generation: id.generation.wrapping_add(1),
        };
        let Slot::Occupied { value, .. } = std::mem::replace(slot, vacant) else {
            return None;
        };
        self.free_head = Some(id.index);
        self.len -= 1;
        Some(value)
    }

    /// Park a finished fiber for reuse under a fresh handle.
    ///
    /// Returns false, leaving the slot untouched, when the idle list is full
    /// or `id` is stale.
    pub fn release(&mut self, id: FiberId) -> bool {
        if self.is_idle_full() {
            return false;
        }
        let Some(Slot::Occupied { generation, .. }) = self.slots.get_mut(id.index as usize) else {
            return false;
        };
        if *generation != id.generation {
            return false;
        }
        *generation = generation.wrapping_add(1);
        self.idle.push(FiberId {
            index: id.index,
            generation: *generation,
        });
        true
    }

    /// Most recently parked fiber, if any.
    pub fn acquire_idle(&mut self) -> Option<FiberId> {
        self.idle.pop()
    }

    /// Empty the arena, idle fibers first. Used on teardown.
    pub fn drain(&mut self) -> Vec<(FiberId, T)> {
        self.idle.clear();
        self.free_head = None;
        self.len = 0;
        std::mem::take(&mut self.slots)
            .into_iter()
            .enumerate()
            .filter_map(|(index, slot)| match slot {
                Slot::Occupied { value, generation } => Some((
                    FiberId {
                        index: index as u32,
                        generation,
                    },
                    value,
                )),
                Slot::Vacant { .. } => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_get() {
        let mut pool = FiberPool::new(4);
        let a = pool.insert("a");
        let b = pool.insert("b");
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.get(a), Some(&"a"));
        assert_eq!(pool.get(b), Some(&"b"));
    }

    #[test]
    fn removed_slot_is_reused_with_new_generation() {
        let mut pool = FiberPool::new(4);
        let a = pool.insert(1);
        assert_eq!(pool.remove(a), Some(1));
        assert_eq!(pool.len(), 0);
        assert!(!pool.contains(a));

        let b = pool.insert(2);
        assert_eq!(b.index, a.index);
        assert_ne!(b.generation, a.generation);
        assert_eq!(pool.get(a), None);
        assert_eq!(pool.get(b), Some(&2));
    }

    #[test]
    fn remove_twice_is_harmless() {
        let mut pool = FiberPool::new(4);
        let a = pool.insert(1);
        assert!(pool.remove(a).is_some());
        assert!(pool.remove(a).is_none());
        assert_eq!(pool.len(), 0);
    }

    #[test]
    fn release_renews_handle() {
        let mut pool = FiberPool::new(4);
        let a = pool.insert('x');
        assert!(pool.release(a));
        assert_eq!(pool.idle_len(), 1);
        assert_eq!(pool.get(a), None);

        let again = pool.acquire_idle().unwrap();
        assert_eq!(again.index, a.index);
        assert_eq!(pool.get_mut(again), Some(&mut 'x'));
        assert_eq!(pool.idle_len(), 0);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn release_respects_bound() {
        let mut pool = FiberPool::new(2);
        let ids: Vec<_> = (0..3).map(|i| pool.insert(i)).collect();
        assert!(pool.release(ids[0]));
        assert!(pool.release(ids[1]));
        assert!(pool.is_idle_full());
        assert!(!pool.release(ids[2]));
        assert_eq!(pool.idle_len(), 2);
        assert_eq!(pool.get(ids[2]), Some(&2));
    }

    #[test]
    fn zero_sized_pool_keeps_nothing() {
        let mut pool = FiberPool::new(0);
        let a = pool.insert(());
        assert!(!pool.release(a));
        assert_eq!(pool.idle_len(), 0);
    }

    #[test]
    fn drain_returns_live_slots() {
        let mut pool = FiberPool::new(4);
        let a = pool.insert(10);
        let b = pool.insert(20);
        let c = pool.insert(30);
        pool.remove(b);
        pool.release(c);
        let mut values: Vec<_> = pool.drain().into_iter().map(|(_, v)| v).collect();
        values.sort();
        assert_eq!(values, vec![10, 30]);
        assert_eq!(pool.len(), 0);
        assert_eq!(pool.idle_len(), 0);
        assert!(!pool.contains(a));
    }
}

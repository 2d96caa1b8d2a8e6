// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Per-fiber scratch buffer and type-erased task closures.
//!
//! Small closures are moved into the fiber's own buffer instead of a fresh
//! heap allocation. The fits-or-box decision is made from the closure's
//! `Layout` when the task is submitted.

use std::alloc::Layout;
use std::mem::{self, MaybeUninit};
use std::ptr::NonNull;

/// Alignment (and granularity) of the buffer.
const CHUNK: usize = 16;

#[derive(Clone, Copy)]
#[repr(C, align(16))]
struct Chunk([u8; CHUNK]);

/// Bump region owned by a fiber. Reset when the fiber is recycled.
pub(crate) struct ScratchBuffer {
    storage: Box<[MaybeUninit<Chunk>]>,
    used: usize,
}

impl ScratchBuffer {
    pub fn new(size: usize) -> Self {
        let chunks = size.div_ceil(CHUNK);
        let storage = std::iter::repeat_with(MaybeUninit::uninit)
            .take(chunks)
            .collect();
        Self { storage, used: 0 }
    }

    pub fn capacity(&self) -> usize {
        self.storage.len() * CHUNK
    }

    /// Would `layouts`, placed in order after the bytes in use, all fit?
    pub fn fits(&self, layouts: &[Layout]) -> bool {
        let mut offset = self.used;
        for layout in layouts {
            if layout.align() > CHUNK {
                return false;
            }
            offset = align_up(offset, layout.align());
            offset = match offset.checked_add(layout.size()) {
                Some(end) => end,
                None => return false,
            };
            if offset > self.capacity() {
                return false;
            }
        }
        true
    }

    /// Move `value` into the buffer.
    ///
    /// # Safety
    ///
    /// `self.fits(&[Layout::new::<T>()])` must hold.
    unsafe fn place<T>(&mut self, value: T) -> NonNull<T> {
        let offset = align_up(self.used, mem::align_of::<T>());
        debug_assert!(offset + mem::size_of::<T>() <= self.capacity());
        let base = self.storage.as_mut_ptr().cast::<u8>();
        let ptr = base.add(offset).cast::<T>();
        ptr.write(value);
        self.used = offset + mem::size_of::<T>();
        NonNull::new_unchecked(ptr)
    }

    /// Forget everything placed so far. Placed values must already be gone.
    pub fn reset(&mut self) {
        self.used = 0;
    }
}

fn align_up(offset: usize, align: usize) -> usize {
    (offset + align - 1) & !(align - 1)
}

enum Repr {
    Inline {
        ptr: NonNull<u8>,
        call: unsafe fn(NonNull<u8>),
        drop_fn: unsafe fn(NonNull<u8>),
    },
    Boxed(Box<dyn FnOnce()>),
    Spent,
}

/// A one-shot closure living either in a scratch buffer or on the heap.
pub(crate) struct TaskFn {
    repr: Repr,
}

impl TaskFn {
    pub fn boxed<F: FnOnce() + 'static>(f: F) -> Self {
        Self {
            repr: Repr::Boxed(Box::new(f)),
        }
    }

    pub fn from_box(f: Box<dyn FnOnce()>) -> Self {
        Self {
            repr: Repr::Boxed(f),
        }
    }

    /// Place `f` in `buffer` if it fits, otherwise box it.
    ///
    /// # Safety
    ///
    /// `buffer` must outlive the returned value and must not be reset
    /// until the value has been run or dropped.
    pub unsafe fn place<F: FnOnce() + 'static>(buffer: &mut ScratchBuffer, f: F) -> Self {
        if buffer.fits(&[Layout::new::<F>()]) {
            Self::inline(buffer, f)
        } else {
            Self::boxed(f)
        }
    }

    /// Place both closures in `buffer` if together they fit, otherwise box
    /// both.
    ///
    /// # Safety
    ///
    /// Same contract as [`TaskFn::place`].
    pub unsafe fn place_pair<F, G>(buffer: &mut ScratchBuffer, f: F, g: G) -> (Self, Self)
    where
        F: FnOnce() + 'static,
        G: FnOnce() + 'static,
    {
        if buffer.fits(&[Layout::new::<F>(), Layout::new::<G>()]) {
            let f = Self::inline(buffer, f);
            let g = Self::inline(buffer, g);
            (f, g)
        } else {
            (Self::boxed(f), Self::boxed(g))
        }
    }

    unsafe fn inline<F: FnOnce() + 'static>(buffer: &mut ScratchBuffer, f: F) -> Self {
        let ptr = buffer.place(f).cast::<u8>();
        Self {
            repr: Repr::Inline {
                ptr,
                call: call_inline::<F>,
                drop_fn: drop_inline::<F>,
            },
        }
    }

    pub fn is_inline(&self) -> bool {
        matches!(self.repr, Repr::Inline { .. })
    }

    pub fn run(mut self) {
        match mem::replace(&mut self.repr, Repr::Spent) {
            // SAFETY: the closure was written by `inline` and not consumed yet.
            Repr::Inline { ptr, call, .. } => unsafe { call(ptr) },
            Repr::Boxed(f) => f(),
            Repr::Spent => {}
        }
    }
}

impl Drop for TaskFn {
    fn drop(&mut self) {
        if let Repr::Inline { ptr, drop_fn, .. } = self.repr {
            // SAFETY: still holding the closure; `run` swaps in `Spent` first.
            unsafe { drop_fn(ptr) }
        }
    }
}

unsafe fn call_inline<F: FnOnce()>(ptr: NonNull<u8>) {
    let f = ptr.cast::<F>().as_ptr().read();
    f()
}

unsafe fn drop_inline<F>(ptr: NonNull<u8>) {
    ptr.cast::<F>().as_ptr().drop_in_place()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    struct DropFlag(Rc<Cell<u32>>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.set(self.0.get() + 1);
        }
    }

    #[test]
    fn capacity_rounds_to_chunks() {
        assert_eq!(ScratchBuffer::new(0).capacity(), 0);
        assert_eq!(ScratchBuffer::new(1).capacity(), 16);
        assert_eq!(ScratchBuffer::new(256).capacity(), 256);
    }

    #[test]
    fn small_closure_goes_inline() {
        let mut buf = ScratchBuffer::new(64);
        let hits = Rc::new(Cell::new(0));
        let h = hits.clone();
        let task = unsafe { TaskFn::place(&mut buf, move || h.set(h.get() + 1)) };
        assert!(task.is_inline());
        task.run();
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn large_closure_is_boxed() {
        let mut buf = ScratchBuffer::new(32);
        let big = [7u8; 128];
        let out = Rc::new(Cell::new(0u32));
        let o = out.clone();
        let task = unsafe { TaskFn::place(&mut buf, move || o.set(big.iter().map(|&b| b as u32).sum())) };
        assert!(!task.is_inline());
        task.run();
        assert_eq!(out.get(), 7 * 128);
    }

    #[test]
    fn over_aligned_closure_is_boxed() {
        #[repr(align(64))]
        struct Wide(u8);
        let mut buf = ScratchBuffer::new(256);
        let w = Wide(3);
        let task = unsafe {
            TaskFn::place(&mut buf, move || {
                let _ = &w;
            })
        };
        assert!(!task.is_inline());
    }

    #[test]
    fn dropping_unrun_inline_closure_drops_captures() {
        let mut buf = ScratchBuffer::new(64);
        let drops = Rc::new(Cell::new(0));
        let flag = DropFlag(drops.clone());
        let task = unsafe {
            TaskFn::place(&mut buf, move || {
                let _ = &flag;
            })
        };
        assert!(task.is_inline());
        drop(task);
        assert_eq!(drops.get(), 1);
    }

    #[test]
    fn run_drops_captures_once() {
        let mut buf = ScratchBuffer::new(64);
        let drops = Rc::new(Cell::new(0));
        let flag = DropFlag(drops.clone());
        let task = unsafe {
            TaskFn::place(&mut buf, move || {
                let _ = &flag;
            })
        };
        task.run();
        assert_eq!(drops.get(), 1);
    }

    #[test]
    fn pair_is_placed_together_or_not_at_all() {
        let a = [1u64; 3];
        let b = [2u64; 3];

        let mut roomy = ScratchBuffer::new(64);
        let (f, g) = unsafe {
            TaskFn::place_pair(
                &mut roomy,
                move || {
                    let _ = &a;
                },
                move || {
                    let _ = &b;
                },
            )
        };
        assert!(f.is_inline() && g.is_inline());

        // Each closure alone fits, both together do not.
        let mut tight = ScratchBuffer::new(32);
        let (f, g) = unsafe {
            TaskFn::place_pair(
                &mut tight,
                move || {
                    let _ = &a;
                },
                move || {
                    let _ = &b;
                },
            )
        };
        assert!(!f.is_inline() && !g.is_inline());
    }

    #[test]
    fn zero_sized_closure_fits_empty_buffer() {
        let mut buf = ScratchBuffer::new(0);
        let task = unsafe { TaskFn::place(&mut buf, || {}) };
        assert!(task.is_inline());
        task.run();
    }

    #[test]
    fn reset_reclaims_space() {
        let mut buf = ScratchBuffer::new(32);
        let payload = [0u8; 24];
        let first = unsafe {
            TaskFn::place(&mut buf, move || {
                let _ = &payload;
            })
        };
        assert!(first.is_inline());
        first.run();
        assert!(!buf.fits(&[Layout::new::<[u8; 24]>()]));
        buf.reset();
        assert!(buf.fits(&[Layout::new::<[u8; 24]>()]));
    }
}

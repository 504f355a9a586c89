//! Runtime-capacity single-producer/single-consumer ring buffer.
//!
//! Generalises the teacher crate's const-generic SPSC channel
//! (`head`/`tail` atomics over a fixed `[Slot<T>; N]`) to a capacity
//! chosen at construction time, since the operator's `prefetch` is a
//! runtime [`PrefetchConfig`](crate::config::PrefetchConfig) value rather
//! than a compile-time constant. The synchronization discipline is
//! unchanged:
//!
//! | Operation        | Ordering   | Purpose                              |
//! |------------------|------------|---------------------------------------|
//! | read own cursor  | `Relaxed`  | only one thread ever writes it        |
//! | read peer cursor | `Acquire`  | see the peer's writes to the buffer   |
//! | write own cursor | `Release`  | publish this thread's buffer writes   |
//!
//! Indexing uses `seq % capacity` rather than an `& mask`, since
//! `capacity` is no longer guaranteed to be a power of two.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

use super::Queue;

struct Slot<T>(UnsafeCell<MaybeUninit<T>>);

unsafe impl<T: Send> Sync for Slot<T> {}

impl<T> Slot<T> {
    fn empty() -> Self {
        Self(UnsafeCell::new(MaybeUninit::uninit()))
    }

    /// # Safety
    /// Caller must ensure no concurrent access to this slot's value, and
    /// that the slot is not currently holding an initialised value that
    /// would leak by being overwritten.
    unsafe fn write(&self, value: T) {
        unsafe { ptr::write((*self.0.get()).as_mut_ptr(), value) };
    }

    /// # Safety
    /// Caller must ensure the slot currently holds an initialised value
    /// and that no concurrent access is in flight.
    unsafe fn read(&self) -> T {
        unsafe { ptr::read((*self.0.get()).as_ptr()) }
    }

    /// # Safety
    /// Caller must ensure the slot currently holds an initialised value.
    unsafe fn drop_in_place(&self) {
        unsafe { ptr::drop_in_place((*self.0.get()).as_mut_ptr()) };
    }
}

/// Lock-free bounded FIFO with a single producer and a single consumer,
/// sized at construction time. See the module docs for the
/// synchronization discipline.
pub struct ArrayQueue<T> {
    buffer: Box<[Slot<T>]>,
    capacity: usize,
    /// Producer's cursor — only [`Self::offer`] modifies it.
    tail: CachePadded<AtomicUsize>,
    /// Consumer's cursor — only [`Self::poll`]/[`Self::clear_with`] modify it.
    head: CachePadded<AtomicUsize>,
}

unsafe impl<T: Send> Sync for ArrayQueue<T> {}
unsafe impl<T: Send> Send for ArrayQueue<T> {}

impl<T> ArrayQueue<T> {
    /// Builds a queue holding up to `capacity` elements.
    ///
    /// # Panics
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ArrayQueue capacity must be positive");
        let buffer = (0..capacity).map(|_| Slot::empty()).collect();
        Self {
            buffer,
            capacity,
            tail: CachePadded::new(AtomicUsize::new(0)),
            head: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    #[inline]
    fn index(&self, seq: usize) -> usize {
        seq % self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<T: Send> Queue<T> for ArrayQueue<T> {
    fn offer(&self, value: T) -> Result<(), T> {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);

        if tail.wrapping_sub(head) >= self.capacity {
            return Err(value);
        }

        let i = self.index(tail);
        unsafe { self.buffer[i].write(value) };
        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    fn poll(&self) -> Option<T> {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);

        if head == tail {
            return None;
        }

        let i = self.index(head);
        let value = unsafe { self.buffer[i].read() };
        self.head.store(head.wrapping_add(1), Ordering::Release);
        Some(value)
    }

    fn clear_with(&self, discard: &mut dyn FnMut(T)) {
        while let Some(value) = self.poll() {
            discard(value);
        }
    }

    fn is_empty(&self) -> bool {
        self.head.load(Ordering::Relaxed) == self.tail.load(Ordering::Acquire)
    }

    fn len(&self) -> usize {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        tail.wrapping_sub(head)
    }
}

impl<T> Drop for ArrayQueue<T> {
    fn drop(&mut self) {
        // `&mut self`: exclusive access, so plain reads of the cursors
        // suffice — no atomic operation needed.
        let head = *self.head.get_mut();
        let tail = *self.tail.get_mut();
        let count = tail.wrapping_sub(head);
        for s in 0..count {
            let i = self.index(head.wrapping_add(s));
            unsafe { self.buffer[i].drop_in_place() };
        }
    }
}

//! C1: the bounded queue the operator sits on top of.
//!
//! The queue itself is "supplied" per §2 — the operator core is generic
//! over [`Queue`], never over a concrete storage type. [`array_queue`]
//! provides the one first-party implementation: a lock-free, single
//! writer/single reader ring buffer generalising the teacher crate's
//! const-generic SPSC channel to the operator's runtime-sized `prefetch`.

mod array_queue;

pub use array_queue::ArrayQueue;

use std::sync::Arc;

/// Single-producer / single-consumer bounded FIFO, §2 C1.
///
/// Implementors must uphold: at most one thread calls `offer` at a time,
/// at most one (possibly different) thread calls `poll`/`clear` at a
/// time, and those two roles never execute concurrently with themselves
/// — exactly the discipline a Reactive Streams upstream (`on_next`) and
/// a WIP-guarded drain loop already provide by construction.
pub trait Queue<T>: Send + Sync {
    /// Attempts to enqueue `value`. Returns it back on failure (queue at
    /// capacity).
    fn offer(&self, value: T) -> Result<(), T>;

    /// Dequeues the oldest element, if any.
    fn poll(&self) -> Option<T>;

    /// Discards every queued element, passing each to `discard` before
    /// dropping it.
    fn clear_with(&self, discard: &mut dyn FnMut(T));

    /// Discards every queued element without inspecting them.
    fn clear(&self) {
        self.clear_with(&mut |_| {})
    }

    fn is_empty(&self) -> bool;

    fn len(&self) -> usize;
}

/// Constructs a queue of at least `capacity` slots. Mirrors §6's
/// `queueFactory: ()→Queue<T>`, generalised to take the capacity hint the
/// operator computes from `prefetch` (a `Queue` impl backed by a fixed
/// const-generic buffer would otherwise have no way to size itself).
pub type QueueFactory<T> = Arc<dyn Fn(usize) -> Arc<dyn Queue<T>> + Send + Sync>;

/// The default queue factory: one [`ArrayQueue`] per subscription, sized
/// exactly to the requested capacity.
pub fn array_queue_factory<T: Send + 'static>() -> QueueFactory<T> {
    Arc::new(|capacity| Arc::new(ArrayQueue::new(capacity)) as Arc<dyn Queue<T>>)
}

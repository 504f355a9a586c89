//! The two contracts the operator sits between (§6): the upstream
//! Reactive Streams publisher/subscription it consumes, and the
//! subscriber/subscription pair it exposes downstream.

use std::sync::Arc;

use crate::error::OperatorError;
use crate::fusion::Fuseable;

/// Handle a subscriber holds on its upstream: `request`/`cancel`.
///
/// Implemented by the operator itself (seen from its own upstream's point
/// of view) and by whatever the caller's publisher hands out.
pub trait Subscription: Send + Sync {
    /// Requests `n` more elements. `n == 0` is a protocol violation and
    /// must surface as [`OperatorError::ProtocolViolation`] through the
    /// subscriber's `on_error`, per §4.2.
    fn request(&self, n: u64);

    /// Cancels the subscription. Idempotent and safe from any thread.
    fn cancel(&self);
}

/// A [`Subscription`] whose source can additionally hand off a shared
/// queue instead of using push/pull (§4.1).
pub trait FuseableSubscription<T>: Subscription + Fuseable {
    /// Pulls the next element directly from the shared queue. Only valid
    /// after a successful [`Fuseable::request_fusion`] negotiation.
    fn poll(&self) -> Result<Option<T>, OperatorError>;

    /// True if the shared queue currently holds no elements.
    fn is_empty(&self) -> bool;

    /// Discards every currently queued element without delivering it.
    fn clear(&self);

    /// Approximate number of elements currently queued.
    fn size(&self) -> usize;
}

/// Receives the upstream's signals: `on_subscribe` exactly once, then any
/// number of `on_next` up to the demand requested, then at most one of
/// `on_error`/`on_complete`.
///
/// `on_subscribe` hands back a [`FuseableSubscription`] rather than a bare
/// [`Subscription`]: per §6, "the prefetch operator is itself a fuseable
/// subscription," so whatever it gives its downstream always supports
/// `request_fusion`/`poll`/`is_empty`/`clear`/`size`, regardless of
/// whether its own upstream happens to support fusion.
pub trait Subscriber<T>: Send + Sync {
    fn on_subscribe(&self, subscription: Arc<dyn FuseableSubscription<T>>);
    fn on_next(&self, value: T);
    fn on_error(&self, error: OperatorError);
    fn on_complete(&self);

    /// The output-fusion poke (§4.1): "data is available, come `poll()`."
    ///
    /// The source protocol models this as calling `on_next(null)`; Rust has
    /// no sentinel value of type `T` to spare, so the poke gets its own
    /// method instead. A downstream that never negotiates output fusion can
    /// ignore it — the default does nothing. [`PrefetchStream`](crate::stream::PrefetchStream)
    /// is the one implementation that cares, turning this into a waker wake.
    fn on_fused_ready(&self) {}
}

/// A [`Subscriber`] that may decline an element without consuming demand
/// for it (§4.4). `try_on_next` replaces `on_next` as the emission path;
/// the operator never calls both for the same element.
pub trait ConditionalSubscriber<T>: Subscriber<T> {
    /// Returns `true` if the element was accepted (consumes one unit of
    /// downstream demand), `false` if declined (the element is dropped,
    /// demand is untouched).
    fn try_on_next(&self, value: T) -> bool;
}

/// The upstream half of the contract (§6, "Upstream contract (consumed)"):
/// something the operator can subscribe a [`Subscriber`] to. Implemented by
/// whatever publisher the caller's dataflow library hands the operator —
/// out of scope per §1, the operator only consumes this interface.
pub trait Publisher<T>: Send + Sync {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>);
}

/// The downstream half of an operator subscription: either a plain
/// [`Subscriber`] or a [`ConditionalSubscriber`].
///
/// Real Reactive Streams implementations detect the conditional
/// capability with an `instanceof` check at subscribe time; Rust has no
/// such runtime capability query, so the caller states its shape
/// explicitly by choosing a variant, and [`PrefetchOperator::subscribe`]
/// (§4.5) dispatches to the plain or conditional drain accordingly.
pub enum Downstream<T> {
    Plain(Arc<dyn Subscriber<T>>),
    Conditional(Arc<dyn ConditionalSubscriber<T>>),
}

impl<T> Downstream<T> {
    pub fn plain(subscriber: Arc<dyn Subscriber<T>>) -> Self {
        Self::Plain(subscriber)
    }

    pub fn conditional(subscriber: Arc<dyn ConditionalSubscriber<T>>) -> Self {
        Self::Conditional(subscriber)
    }
}

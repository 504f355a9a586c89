//! `futures::Stream` bridge over the operator (feature = `async`).
//!
//! The core's downstream contract is push-based (`on_next`) with an
//! optional poll-based escape hatch for fused consumers (§4.1). Rust's
//! `Stream` trait is pull-based: something has to turn "the operator
//! pushed a value" into "a `poll_next` call returns `Ready`". [`PrefetchStream`]
//! does that by negotiating ASYNC output fusion at subscribe time and
//! parking a [`futures::task::AtomicWaker`] — the same primitive
//! `veloce`'s own `SendFuture`/`RecvFuture` use — instead of ever
//! receiving a pushed value.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::task::{Context, Poll};

use futures::Stream;
use futures::task::AtomicWaker;

use crate::error::OperatorError;
use crate::fusion::{Fuseable, FusionMode};
use crate::operator::PrefetchOperator;
use crate::reactive::{Downstream, FuseableSubscription, Publisher, Subscriber};

struct StreamInner<T: Send + 'static> {
    subscription: OnceLock<Arc<dyn FuseableSubscription<T>>>,
    waker: AtomicWaker,
    done: AtomicBool,
    error: Mutex<Option<OperatorError>>,
}

impl<T: Send + 'static> Subscriber<T> for StreamInner<T> {
    fn on_subscribe(&self, subscription: Arc<dyn FuseableSubscription<T>>) {
        let granted = subscription.request_fusion(FusionMode::Async);
        debug_assert!(
            matches!(granted, FusionMode::Async),
            "the engine always grants ASYNC output fusion to a non-SYNC-requesting downstream"
        );
        // `on_subscribe` is only ever called once (§4.2, invariant 1); a
        // second call would mean the operator itself violated its own
        // contract, which `set` would silently ignore rather than panic on.
        let _ = self.subscription.set(subscription);
    }

    fn on_next(&self, _value: T) {
        // Unreachable in practice: we always negotiate ASYNC fusion before
        // the operator can deliver its first element, so it never falls
        // back to pushing through `on_next`. Kept non-panicking since this
        // is a downstream-facing boundary, not an internal assertion.
        tracing::error!("PrefetchStream received a pushed value despite output fusion");
    }

    fn on_error(&self, error: OperatorError) {
        *self.error.lock().unwrap() = Some(error);
        self.done.store(true, Ordering::Release);
        self.waker.wake();
    }

    fn on_complete(&self) {
        self.done.store(true, Ordering::Release);
        self.waker.wake();
    }

    fn on_fused_ready(&self) {
        self.waker.wake();
    }
}

/// A `futures::Stream` adapter wired to a [`PrefetchOperator`].
///
/// Each item is `Ok(value)` for a delivered element or `Err(operator_error)`
/// for the one terminal error the stream can carry, after which the stream
/// ends. Dropping the stream drops its subscription, which the engine's
/// cancellation path then unwinds the usual way.
pub struct PrefetchStream<T: Send + 'static> {
    inner: Arc<StreamInner<T>>,
}

impl<T: Send + 'static> PrefetchStream<T> {
    /// Subscribes a fresh prefetch operator between `upstream` and this
    /// stream. Output fusion is negotiated synchronously, inside this call,
    /// before any element can flow.
    pub fn new(operator: &PrefetchOperator<T>, upstream: &dyn Publisher<T>) -> Self {
        let inner = Arc::new(StreamInner {
            subscription: OnceLock::new(),
            waker: AtomicWaker::new(),
            done: AtomicBool::new(false),
            error: Mutex::new(None),
        });
        let _ = operator.subscribe(upstream, Downstream::plain(inner.clone() as Arc<dyn Subscriber<T>>));
        Self { inner }
    }
}

/// Not self-referential: every field the poll loop touches is reached
/// through `Arc`/interior mutability, never through a pinned address.
impl<T: Send + 'static> Unpin for PrefetchStream<T> {}

impl<T: Send + 'static> Stream for PrefetchStream<T> {
    type Item = Result<T, OperatorError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let inner = &self.inner;
        let subscription = inner
            .subscription
            .get()
            .expect("PrefetchStream polled before the upstream called on_subscribe");

        match subscription.poll() {
            Ok(Some(value)) => Poll::Ready(Some(Ok(value))),
            Ok(None) => {
                if let Some(error) = inner.error.lock().unwrap().take() {
                    return Poll::Ready(Some(Err(error)));
                }
                if inner.done.load(Ordering::Acquire) && subscription.is_empty() {
                    return Poll::Ready(None);
                }
                inner.waker.register(cx.waker());
                // A value or terminal signal may have landed between the
                // `poll()` above and registering the waker; give it a
                // second shot before actually parking.
                if !subscription.is_empty() || inner.done.load(Ordering::Acquire) {
                    cx.waker().wake_by_ref();
                }
                Poll::Pending
            }
            Err(error) => Poll::Ready(Some(Err(error))),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration;

    use futures::StreamExt;

    use super::*;
    use crate::config::PrefetchConfig;

    /// Hands out a subscription that never receives a real upstream
    /// `request`/`cancel` (the stream never calls either in ASYNC-output
    /// mode), then pushes its items from a background thread after a short
    /// delay, exercising the cross-thread wake path.
    struct ThreadedPublisher {
        items: Vec<i32>,
    }

    struct NoopSubscription {
        requested: AtomicUsize,
    }

    impl crate::reactive::Subscription for NoopSubscription {
        fn request(&self, n: u64) {
            self.requested.fetch_add(n as usize, Ordering::AcqRel);
        }
        fn cancel(&self) {}
    }

    impl Fuseable for NoopSubscription {
        fn request_fusion(&self, _requested: FusionMode) -> FusionMode {
            FusionMode::None
        }
    }

    impl FuseableSubscription<i32> for NoopSubscription {
        fn poll(&self) -> Result<Option<i32>, OperatorError> {
            Ok(None)
        }
        fn is_empty(&self) -> bool {
            true
        }
        fn clear(&self) {}
        fn size(&self) -> usize {
            0
        }
    }

    impl Publisher<i32> for ThreadedPublisher {
        fn subscribe(&self, subscriber: Arc<dyn Subscriber<i32>>) {
            subscriber.on_subscribe(Arc::new(NoopSubscription {
                requested: AtomicUsize::new(0),
            }));
            let items = self.items.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                for v in items {
                    subscriber.on_next(v);
                }
                subscriber.on_complete();
            });
        }
    }

    #[tokio::test]
    async fn stream_yields_pushed_items_then_ends() {
        let operator = PrefetchOperator::new(PrefetchConfig::new(4).unwrap());
        let upstream = ThreadedPublisher { items: vec![1, 2, 3] };
        let stream = PrefetchStream::new(&operator, &upstream);
        tokio::pin!(stream);

        let mut collected = Vec::new();
        while let Some(item) = stream.next().await {
            collected.push(item.unwrap());
        }
        assert_eq!(collected, vec![1, 2, 3]);
    }

    struct FailingPublisher;

    struct FailingSubscription;

    impl crate::reactive::Subscription for FailingSubscription {
        fn request(&self, _n: u64) {}
        fn cancel(&self) {}
    }

    impl Fuseable for FailingSubscription {
        fn request_fusion(&self, _requested: FusionMode) -> FusionMode {
            FusionMode::None
        }
    }

    impl FuseableSubscription<i32> for FailingSubscription {
        fn poll(&self) -> Result<Option<i32>, OperatorError> {
            Ok(None)
        }
        fn is_empty(&self) -> bool {
            true
        }
        fn clear(&self) {}
        fn size(&self) -> usize {
            0
        }
    }

    impl Publisher<i32> for FailingPublisher {
        fn subscribe(&self, subscriber: Arc<dyn Subscriber<i32>>) {
            subscriber.on_subscribe(Arc::new(FailingSubscription));
            subscriber.on_error(OperatorError::BackpressureOverflow);
        }
    }

    #[tokio::test]
    async fn stream_surfaces_terminal_error() {
        let operator = PrefetchOperator::new(PrefetchConfig::new(4).unwrap());
        let upstream = FailingPublisher;
        let stream = PrefetchStream::new(&operator, &upstream);
        tokio::pin!(stream);

        let first = stream.next().await.expect("one terminal item");
        assert!(matches!(first, Err(OperatorError::BackpressureOverflow)));
        assert!(stream.next().await.is_none());
    }
}

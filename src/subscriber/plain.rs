//! C4: the plain prefetch subscriber (§4.3) — emission goes through
//! [`Subscriber::on_next`], which always consumes one unit of downstream
//! demand.

use std::sync::{Arc, Weak};

use crate::config::PrefetchConfig;
use crate::error::OperatorError;
use crate::fusion::{Fuseable, FusionMode};
use crate::queue::QueueFactory;
use crate::reactive::{FuseableSubscription, Subscriber, Subscription};

use super::{EmitTarget, Engine};

struct PlainTarget<T> {
    downstream: Arc<dyn Subscriber<T>>,
}

impl<T: Send + 'static> EmitTarget<T> for PlainTarget<T> {
    fn on_subscribe(&self, subscription: Arc<dyn FuseableSubscription<T>>) {
        self.downstream.on_subscribe(subscription);
    }

    fn emit(&self, value: T) -> bool {
        self.downstream.on_next(value);
        true
    }

    fn on_fused_ready(&self) {
        self.downstream.on_fused_ready();
    }

    fn on_error(&self, error: OperatorError) {
        self.downstream.on_error(error);
    }

    fn on_complete(&self) {
        self.downstream.on_complete();
    }
}

/// C4: a prefetch subscriber/subscription pair wired to a plain
/// [`Subscriber`] downstream.
///
/// Plays both roles the operator sits between: it is the [`Subscriber`]
/// the upstream publisher drives, and the [`FuseableSubscription`] the
/// downstream holds. Both roles delegate straight to the shared
/// [`Engine`]; this type exists only to plug a [`PlainTarget`] into it and
/// implement the four trait surfaces a "subscriber that is itself a
/// subscription" requires (§4.5 names this the operator's one entry
/// point's C4 arm).
pub struct PlainPrefetchSubscriber<T: Send + 'static> {
    engine: Engine<T, PlainTarget<T>>,
}

impl<T: Send + 'static> PlainPrefetchSubscriber<T> {
    pub fn new(
        downstream: Arc<dyn Subscriber<T>>,
        config: PrefetchConfig,
        queue_factory: QueueFactory<T>,
        discard_hook: Arc<dyn Fn(T) + Send + Sync>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let self_handle: Weak<dyn FuseableSubscription<T>> = weak.clone();
            Self {
                engine: Engine::new(
                    PlainTarget { downstream },
                    config,
                    queue_factory,
                    discard_hook,
                    self_handle,
                ),
            }
        })
    }
}

impl<T: Send + 'static> Subscriber<T> for PlainPrefetchSubscriber<T> {
    fn on_subscribe(&self, subscription: Arc<dyn FuseableSubscription<T>>) {
        self.engine.on_subscribe(subscription);
    }

    fn on_next(&self, value: T) {
        self.engine.on_next(value);
    }

    fn on_error(&self, error: OperatorError) {
        self.engine.on_error(error);
    }

    fn on_complete(&self) {
        self.engine.on_complete();
    }

    fn on_fused_ready(&self) {
        // An ASYNC-fused upstream pokes through here instead of `on_next`;
        // translate the poke into a drain kick.
        self.engine.notify();
    }
}

impl<T: Send + 'static> Subscription for PlainPrefetchSubscriber<T> {
    fn request(&self, n: u64) {
        self.engine.request(n);
    }

    fn cancel(&self) {
        self.engine.cancel();
    }
}

impl<T: Send + 'static> Fuseable for PlainPrefetchSubscriber<T> {
    fn request_fusion(&self, requested: FusionMode) -> FusionMode {
        self.engine.request_fusion(requested)
    }
}

impl<T: Send + 'static> FuseableSubscription<T> for PlainPrefetchSubscriber<T> {
    fn poll(&self) -> Result<Option<T>, OperatorError> {
        self.engine.poll()
    }

    fn is_empty(&self) -> bool {
        self.engine.is_empty()
    }

    fn clear(&self) {
        self.engine.clear()
    }

    fn size(&self) -> usize {
        self.engine.size()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;
    use crate::queue::array_queue_factory;
    use crate::request::RequestMode;

    /// Minimal in-process `Publisher`/`Subscription` pair: a `Vec<T>`
    /// delivered synchronously (NONE fusion) under an explicit request
    /// count, used across the subscriber tests to drive the drain loop
    /// without needing a real upstream crate.
    struct VecUpstream<T> {
        items: Mutex<Vec<T>>,
        requested: AtomicUsize,
        cancelled: Mutex<bool>,
    }

    impl<T: Send + 'static> VecUpstream<T> {
        fn new(items: Vec<T>) -> Arc<Self> {
            Arc::new(Self {
                items: Mutex::new(items),
                requested: AtomicUsize::new(0),
                cancelled: Mutex::new(false),
            })
        }

        fn deliver_all(self: &Arc<Self>, subscriber: &dyn Subscriber<T>) {
            loop {
                if *self.cancelled.lock().unwrap() {
                    return;
                }
                if self.requested.load(Ordering::Acquire) == 0 {
                    return;
                }
                let next = self.items.lock().unwrap().pop();
                match next {
                    Some(v) => {
                        self.requested.fetch_sub(1, Ordering::AcqRel);
                        subscriber.on_next(v);
                    }
                    None => {
                        subscriber.on_complete();
                        return;
                    }
                }
            }
        }
    }

    impl<T: Send + 'static> Subscription for VecUpstream<T> {
        fn request(&self, n: u64) {
            self.requested.fetch_add(n as usize, Ordering::AcqRel);
        }
        fn cancel(&self) {
            *self.cancelled.lock().unwrap() = true;
        }
    }

    impl<T: Send + 'static> Fuseable for VecUpstream<T> {
        fn request_fusion(&self, _requested: FusionMode) -> FusionMode {
            FusionMode::None
        }
    }

    impl<T: Send + 'static> FuseableSubscription<T> for VecUpstream<T> {
        fn poll(&self) -> Result<Option<T>, OperatorError> {
            Ok(self.items.lock().unwrap().pop())
        }
        fn is_empty(&self) -> bool {
            self.items.lock().unwrap().is_empty()
        }
        fn clear(&self) {
            self.items.lock().unwrap().clear();
        }
        fn size(&self) -> usize {
            self.items.lock().unwrap().len()
        }
    }

    struct RecordingSubscriber<T> {
        received: Mutex<Vec<T>>,
        completed: Mutex<bool>,
        errored: Mutex<Option<OperatorError>>,
    }

    impl<T> RecordingSubscriber<T> {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                received: Mutex::new(Vec::new()),
                completed: Mutex::new(false),
                errored: Mutex::new(None),
            })
        }
    }

    impl<T: Send + Sync + 'static> Subscriber<T> for RecordingSubscriber<T> {
        fn on_subscribe(&self, _subscription: Arc<dyn FuseableSubscription<T>>) {
            // Passive: tests drive demand explicitly via `op.request(n)`.
        }
        fn on_next(&self, value: T) {
            self.received.lock().unwrap().push(value);
        }
        fn on_error(&self, error: OperatorError) {
            *self.errored.lock().unwrap() = Some(error);
        }
        fn on_complete(&self) {
            *self.completed.lock().unwrap() = true;
        }
    }

    #[test]
    fn finite_source_delivers_in_order_then_completes() {
        let config = PrefetchConfig::new(4).unwrap();
        let downstream = RecordingSubscriber::new();
        let op = PlainPrefetchSubscriber::new(
            downstream.clone(),
            config,
            array_queue_factory::<i32>(),
            Arc::new(|_| {}),
        );

        let mut items: Vec<i32> = (0..10).collect();
        items.reverse();
        let upstream = VecUpstream::new(items);
        op.on_subscribe(upstream.clone() as Arc<dyn FuseableSubscription<i32>>);
        op.request(u64::MAX);
        upstream.deliver_all(op.as_ref());

        assert_eq!(*downstream.received.lock().unwrap(), (0..10).collect::<Vec<_>>());
        assert!(*downstream.completed.lock().unwrap());
        assert!(downstream.errored.lock().unwrap().is_none());
    }

    #[test]
    fn cancel_stops_further_emission() {
        let config = PrefetchConfig::new(4).unwrap();
        let downstream = RecordingSubscriber::new();
        let op = PlainPrefetchSubscriber::new(
            downstream.clone(),
            config,
            array_queue_factory::<i32>(),
            Arc::new(|_| {}),
        );

        let mut items: Vec<i32> = (0..1000).collect();
        items.reverse();
        let upstream = VecUpstream::new(items);
        op.on_subscribe(upstream.clone() as Arc<dyn FuseableSubscription<i32>>);

        // Limit demand so the upstream stalls after 5, then cancel.
        op.request(5);
        upstream.deliver_all(op.as_ref());
        op.cancel();
        upstream.deliver_all(op.as_ref());

        assert_eq!(downstream.received.lock().unwrap().len(), 5);
        assert!(!*downstream.completed.lock().unwrap());
    }

    #[test]
    fn upstream_error_propagates_after_partial_emission() {
        let config = PrefetchConfig::new(8).unwrap();
        let downstream = RecordingSubscriber::new();
        let op = PlainPrefetchSubscriber::new(
            downstream.clone(),
            config,
            array_queue_factory::<i32>(),
            Arc::new(|_| {}),
        );

        let upstream = VecUpstream::new(vec![2, 1, 0]);
        op.on_subscribe(upstream.clone() as Arc<dyn FuseableSubscription<i32>>);
        op.request(u64::MAX);
        upstream.deliver_all(op.as_ref());
        op.on_error(OperatorError::BackpressureOverflow);

        assert_eq!(*downstream.received.lock().unwrap(), vec![0, 1, 2]);
        assert!(downstream.errored.lock().unwrap().is_some());
        assert!(!*downstream.completed.lock().unwrap());
    }

    /// Unlike [`RecordingSubscriber`], never requests on its own — lets the
    /// test control exactly when downstream demand is issued.
    struct PassiveSubscriber;

    impl<T: Send + Sync + 'static> Subscriber<T> for PassiveSubscriber {
        fn on_subscribe(&self, _subscription: Arc<dyn FuseableSubscription<T>>) {}
        fn on_next(&self, _value: T) {}
        fn on_error(&self, _error: OperatorError) {}
        fn on_complete(&self) {}
    }

    #[test]
    fn lazy_mode_defers_initial_request_until_first_downstream_request() {
        let config = PrefetchConfig::builder(4)
            .request_mode(RequestMode::Lazy)
            .build()
            .unwrap();
        let op = PlainPrefetchSubscriber::new(
            Arc::new(PassiveSubscriber),
            config,
            array_queue_factory::<i32>(),
            Arc::new(|_| {}),
        );

        let upstream = VecUpstream::new(vec![1, 0]);
        op.on_subscribe(upstream.clone() as Arc<dyn FuseableSubscription<i32>>);
        assert_eq!(upstream.requested.load(Ordering::Acquire), 0);

        op.request(4);
        assert_eq!(upstream.requested.load(Ordering::Acquire), 4);
    }

    #[test]
    fn lazy_mode_triggers_initial_request_on_first_poll() {
        // A poll-driven, output-fused downstream never calls `request(n)` at
        // all; the first `poll()` must flip the LAZY first-request guard on
        // its own.
        let config = PrefetchConfig::builder(4)
            .request_mode(RequestMode::Lazy)
            .build()
            .unwrap();
        let op = PlainPrefetchSubscriber::new(
            Arc::new(PassiveSubscriber),
            config,
            array_queue_factory::<i32>(),
            Arc::new(|_| {}),
        );

        let upstream = VecUpstream::new(vec![1, 0]);
        op.on_subscribe(upstream.clone() as Arc<dyn FuseableSubscription<i32>>);
        assert_eq!(upstream.requested.load(Ordering::Acquire), 0);

        let _ = op.poll();
        assert_eq!(upstream.requested.load(Ordering::Acquire), 4);
    }
}

//! C5: the conditional prefetch subscriber (§4.4) — emission goes through
//! [`ConditionalSubscriber::try_on_next`], which may decline an element
//! without consuming downstream demand.

use std::sync::{Arc, Weak};

use crate::config::PrefetchConfig;
use crate::error::OperatorError;
use crate::fusion::{Fuseable, FusionMode};
use crate::queue::QueueFactory;
use crate::reactive::{ConditionalSubscriber, FuseableSubscription, Subscriber, Subscription};

use super::{EmitTarget, Engine};

struct ConditionalTarget<T> {
    downstream: Arc<dyn ConditionalSubscriber<T>>,
}

impl<T: Send + 'static> EmitTarget<T> for ConditionalTarget<T> {
    fn on_subscribe(&self, subscription: Arc<dyn FuseableSubscription<T>>) {
        self.downstream.on_subscribe(subscription);
    }

    fn emit(&self, value: T) -> bool {
        self.downstream.try_on_next(value)
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

/// C5: a prefetch subscriber/subscription pair wired to a
/// [`ConditionalSubscriber`] downstream.
///
/// Structurally identical to [`PlainPrefetchSubscriber`](super::plain::PlainPrefetchSubscriber) —
/// it plugs a [`ConditionalTarget`] into the same [`Engine`] instead of a
/// `PlainTarget`. The only behavioral difference lives in
/// [`EmitTarget::emit`] returning whatever `try_on_next` decided rather
/// than always `true`; everything downstream of that (replenishment on
/// `polled == limit` rather than `emitted == limit`, demand decremented
/// only by `emitted`) is already the engine's job per §4.4, not this
/// wrapper's.
pub struct ConditionalPrefetchSubscriber<T: Send + 'static> {
    engine: Engine<T, ConditionalTarget<T>>,
}

impl<T: Send + 'static> ConditionalPrefetchSubscriber<T> {
    pub fn new(
        downstream: Arc<dyn ConditionalSubscriber<T>>,
        config: PrefetchConfig,
        queue_factory: QueueFactory<T>,
        discard_hook: Arc<dyn Fn(T) + Send + Sync>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let self_handle: Weak<dyn FuseableSubscription<T>> = weak.clone();
            Self {
                engine: Engine::new(
                    ConditionalTarget { downstream },
                    config,
                    queue_factory,
                    discard_hook,
                    self_handle,
                ),
            }
        })
    }
}

impl<T: Send + 'static> Subscriber<T> for ConditionalPrefetchSubscriber<T> {
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
        self.engine.notify();
    }
}

impl<T: Send + 'static> Subscription for ConditionalPrefetchSubscriber<T> {
    fn request(&self, n: u64) {
        self.engine.request(n);
    }

    fn cancel(&self) {
        self.engine.cancel();
    }
}

impl<T: Send + 'static> Fuseable for ConditionalPrefetchSubscriber<T> {
    fn request_fusion(&self, requested: FusionMode) -> FusionMode {
        self.engine.request_fusion(requested)
    }
}

impl<T: Send + 'static> FuseableSubscription<T> for ConditionalPrefetchSubscriber<T> {
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

//! C6: the operator factory (§4.5) — the crate's single entry point.
//!
//! Construction validates the configuration once
//! ([`PrefetchConfig::build`](crate::config::PrefetchConfig)); `subscribe`
//! then picks the plain (C4) or conditional (C5) drain engine depending on
//! which [`Downstream`] variant the caller hands it, and wires it to the
//! upstream [`Publisher`].

use std::sync::Arc;

use crate::config::PrefetchConfig;
use crate::queue::{array_queue_factory, Queue, QueueFactory};
use crate::reactive::{Downstream, FuseableSubscription, Publisher, Subscriber};
use crate::subscriber::conditional::ConditionalPrefetchSubscriber;
use crate::subscriber::plain::PlainPrefetchSubscriber;

/// Validated, reusable configuration for subscribing a prefetch operator
/// between an upstream [`Publisher`] and a [`Downstream`].
///
/// One `PrefetchOperator` can be subscribed to many upstream/downstream
/// pairs — §3's per-subscription state lives entirely in the C4/C5
/// instance `subscribe` creates, not in the operator itself (§9: "the
/// operator holds no process-wide state").
pub struct PrefetchOperator<T: Send + 'static> {
    config: PrefetchConfig,
    queue_factory: QueueFactory<T>,
    discard_hook: Arc<dyn Fn(T) + Send + Sync>,
}

impl<T: Send + 'static> PrefetchOperator<T> {
    /// Builds an operator with the default queue factory
    /// ([`array_queue_factory`]) and a no-op discard hook.
    pub fn new(config: PrefetchConfig) -> Self {
        Self {
            config,
            queue_factory: array_queue_factory::<T>(),
            discard_hook: Arc::new(|_| {}),
        }
    }

    /// Overrides the queue implementation a non-fused subscription
    /// allocates (§6's `queueFactory`). The default is [`array_queue_factory`];
    /// callers with a different SPSC queue (e.g. one backed by `flume` or
    /// `crossbeam-channel`) can supply it here as long as it implements
    /// [`Queue`].
    pub fn with_queue_factory(mut self, queue_factory: QueueFactory<T>) -> Self {
        self.queue_factory = queue_factory;
        self
    }

    /// Installs a hook invoked once per element the operator discards
    /// (overflow, cancellation, or error unwind) instead of delivering it
    /// downstream — the "discard hook" of the glossary.
    pub fn with_discard_hook(mut self, hook: impl Fn(T) + Send + Sync + 'static) -> Self {
        self.discard_hook = Arc::new(hook);
        self
    }

    pub fn config(&self) -> PrefetchConfig {
        self.config
    }

    /// Subscribes `downstream` to `upstream` through a freshly created C4
    /// or C5 drain engine, chosen by which [`Downstream`] variant was
    /// supplied (§4.5). Returns the engine's own handle — the
    /// [`FuseableSubscription`] the downstream actually holds, usable for
    /// driving it outside of the `Subscriber::on_subscribe` callback (e.g.
    /// in tests, or by [`PrefetchStream`](crate::stream::PrefetchStream)).
    pub fn subscribe(
        &self,
        upstream: &dyn Publisher<T>,
        downstream: Downstream<T>,
    ) -> Arc<dyn FuseableSubscription<T>> {
        match downstream {
            Downstream::Plain(subscriber) => {
                let op = PlainPrefetchSubscriber::new(
                    subscriber,
                    self.config,
                    self.queue_factory.clone(),
                    self.discard_hook.clone(),
                );
                upstream.subscribe(op.clone() as Arc<dyn Subscriber<T>>);
                op as Arc<dyn FuseableSubscription<T>>
            }
            Downstream::Conditional(subscriber) => {
                let op = ConditionalPrefetchSubscriber::new(
                    subscriber,
                    self.config,
                    self.queue_factory.clone(),
                    self.discard_hook.clone(),
                );
                upstream.subscribe(op.clone() as Arc<dyn Subscriber<T>>);
                op as Arc<dyn FuseableSubscription<T>>
            }
        }
    }
}

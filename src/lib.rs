//! A lock-free reactive-streams prefetch operator.
//!
//! `preflux` interposes a bounded queue between an upstream
//! [`Publisher`](reactive::Publisher) and a downstream
//! [`Subscriber`](reactive::Subscriber)/[`ConditionalSubscriber`](reactive::ConditionalSubscriber),
//! decoupling the two so the upstream can run ahead by a fixed window
//! (`prefetch`) while the downstream pulls at its own pace under full
//! backpressure. The operator itself conforms to the Reactive Streams
//! protocol: serialised signals, non-blocking delivery, at-most-one
//! terminal signal, safe cancellation.
//!
//! The crate's only entry point is [`PrefetchOperator`](operator::PrefetchOperator);
//! everything else — [`reactive`]'s trait contracts, [`fusion`]'s queue
//! negotiation, [`request`]'s demand accounting, [`queue`]'s SPSC ring
//! buffer — is plumbing it builds on.
//!
//! With the `async` feature (on by default), [`stream::PrefetchStream`]
//! bridges a subscription into a `futures::Stream` for callers who would
//! rather `.await` than hand-write a [`Subscriber`](reactive::Subscriber).

pub mod config;
pub mod error;
pub mod fusion;
pub mod operator;
pub mod queue;
pub mod reactive;
pub mod request;
pub mod subscriber;

#[cfg(feature = "async")]
pub mod stream;

pub use config::{ConfigError, PrefetchConfig};
pub use error::OperatorError;
pub use fusion::{Fuseable, FusionMode};
pub use operator::PrefetchOperator;
pub use reactive::{ConditionalSubscriber, Downstream, FuseableSubscription, Publisher, Subscriber, Subscription};
pub use request::RequestMode;

#[cfg(feature = "async")]
pub use stream::PrefetchStream;

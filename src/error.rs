//! Error taxonomy for the prefetch operator.
//!
//! Mirrors the failure modes an upstream/downstream pair can produce: a
//! protocol violation (malformed `request`/double `on_subscribe`), queue
//! overflow, or a propagated failure from a user-supplied queue's `poll`.
//! Panics unwinding out of a downstream or queue callback are never caught
//! here — they are not part of this taxonomy and are left to propagate.

use std::error::Error as StdError;
use std::fmt;

/// Failure surfaced to a downstream [`Subscriber`](crate::reactive::Subscriber)
/// through `on_error`.
#[derive(thiserror::Error, Debug)]
pub enum OperatorError {
    /// The Reactive Streams protocol was violated by a collaborator:
    /// a second `on_subscribe`, or `request(n)` with `n <= 0`.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    /// A non-fused upstream produced an element the queue could not
    /// accept because it was already at `prefetch` capacity.
    #[error("queue overflow: upstream produced beyond the requested prefetch window")]
    BackpressureOverflow,

    /// A user-supplied queue or upstream `poll` returned an error.
    #[error("poll failed: {0}")]
    Poll(#[source] BoxedError),
}

/// Type-erased error, boxed once at the boundary where it is first observed.
pub type BoxedError = Box<dyn StdError + Send + Sync + 'static>;

impl OperatorError {
    pub fn poll(source: impl StdError + Send + Sync + 'static) -> Self {
        Self::Poll(Box::new(source))
    }
}

/// Helper for queue/iterator adapters whose `poll` is infallible but whose
/// signature still needs a `Display`-able error type to satisfy a generic
/// bound (e.g. in tests exercising a poisoned queue).
#[derive(Debug)]
pub struct Opaque(pub String);

impl fmt::Display for Opaque {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl StdError for Opaque {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_violation_displays_reason() {
        let err = OperatorError::ProtocolViolation("request(n) with n <= 0");
        assert_eq!(
            err.to_string(),
            "protocol violation: request(n) with n <= 0"
        );
    }

    #[test]
    fn poll_wraps_source() {
        let err = OperatorError::poll(Opaque("boom".into()));
        assert!(err.to_string().contains("boom"));
    }
}

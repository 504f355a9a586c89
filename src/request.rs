//! Request accounting (§4.2): saturating demand arithmetic and the
//! eager/lazy policy for when the operator issues its first request to
//! upstream.

use std::sync::atomic::{AtomicU64, Ordering};

/// Sentinel meaning "unbounded demand," mirroring `Integer.MAX_VALUE`'s
/// role in the source protocol. `u64::MAX` plays that role here: once
/// `requested` saturates to it, the drain loop never decrements it back
/// down to a finite value, exactly like the unbounded sentinel it models.
pub const UNBOUNDED: u64 = u64::MAX;

/// Policy for when the operator issues its first `request(prefetch)` to
/// upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
    /// Request `prefetch` in `on_subscribe`, before the downstream has
    /// asked for anything.
    #[default]
    Eager,
    /// Defer the initial request until the first non-zero downstream
    /// `request` call (or the first drain entry, for fused sources).
    Lazy,
}

/// Saturating add, capped at [`UNBOUNDED`] rather than wrapping.
#[inline]
pub fn add_cap(a: u64, b: u64) -> u64 {
    let sum = a.saturating_add(b);
    if sum == u64::MAX { UNBOUNDED } else { sum }
}

/// `prefetch` itself, or [`UNBOUNDED`] if the caller asked for an
/// unbounded window (`prefetch == usize::MAX`).
#[inline]
pub fn unbounded_or_prefetch(prefetch: usize) -> u64 {
    if prefetch == usize::MAX {
        UNBOUNDED
    } else {
        prefetch as u64
    }
}

/// Atomically adds `n` to `requested`, saturating at [`UNBOUNDED`], and
/// returns the previous value (mirrors `AtomicLong.getAndAdd` with a
/// saturating add instead of wrapping on overflow).
#[inline]
pub fn request_add(requested: &AtomicU64, n: u64) -> u64 {
    requested
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
            if current == UNBOUNDED {
                Some(UNBOUNDED)
            } else {
                Some(add_cap(current, n))
            }
        })
        .unwrap_or_else(|prev| prev)
}

/// Subtracts `n` from `requested` unless it is already unbounded, in
/// which case it is left untouched (an unbounded subscriber never runs
/// out of demand to account for).
#[inline]
pub fn request_sub(requested: &AtomicU64, n: u64) {
    if n == 0 {
        return;
    }
    let _ = requested.fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
        if current == UNBOUNDED {
            Some(UNBOUNDED)
        } else {
            Some(current.saturating_sub(n))
        }
    });
}

//! Shared drain engine behind both C4 ([`plain`]) and C5 ([`conditional`]).
//!
//! §9 notes that the plain and conditional subscribers "share ≥80% of the
//! drain structure" and suggests parameterising over the emit function
//! `(value) → consumedDemand:bool` rather than duplicating the state
//! machine. [`Engine`] is that parameterisation: it owns every atomic
//! field from §3's data model and the three drain loops from §4.3.2,
//! generic over an [`EmitTarget`] that knows how to hand a value to the
//! concrete downstream (`on_next`, always consuming demand, for plain;
//! `try_on_next`, maybe declining, for conditional). [`plain`] and
//! [`conditional`] are thin public wrappers that plug in the right
//! target and otherwise just delegate.

pub mod conditional;
pub mod plain;


use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use crate::config::PrefetchConfig;
use crate::error::OperatorError;
use crate::fusion::{Fuseable, FusionMode};
use crate::queue::{Queue, QueueFactory};
use crate::reactive::{FuseableSubscription, Subscription};
use crate::request::{request_add, request_sub, unbounded_or_prefetch, RequestMode};

/// Translates the engine's emission decision into a concrete downstream
/// call. Plain targets always consume demand; conditional targets may
/// decline (§4.4).
pub(crate) trait EmitTarget<T>: Send + Sync {
    fn on_subscribe(&self, subscription: Arc<dyn FuseableSubscription<T>>);
    /// Hands `value` to the downstream. Returns whether it consumed a
    /// unit of demand (always `true` for a plain target).
    fn emit(&self, value: T) -> bool;
    /// The output-fusion "poke": downstream should call `poll()` now.
    fn on_fused_ready(&self);
    fn on_error(&self, error: OperatorError);
    fn on_complete(&self);
}

/// A single-writer-before-release, single-reader-after-acquire terminal
/// error slot. Resolves §9's open question ("`error` is written before
/// `done=true` but not declared volatile") by construction: `publish` is
/// only ever called by the one thread processing upstream terminal
/// signals (they are mutually exclusive with themselves by the Reactive
/// Streams contract), and `take` is only ever called by the single
/// WIP-owning drain thread after observing `done` with `Acquire`.
struct TerminalError {
    done: AtomicBool,
    slot: UnsafeCell<Option<OperatorError>>,
}

unsafe impl Sync for TerminalError {}

impl TerminalError {
    fn new() -> Self {
        Self {
            done: AtomicBool::new(false),
            slot: UnsafeCell::new(None),
        }
    }

    /// Stores `error` (or `None` for a clean completion) and publishes
    /// `done`. Must be called at most once.
    fn publish(&self, error: Option<OperatorError>) {
        unsafe { *self.slot.get() = error };
        self.done.store(true, Ordering::Release);
    }

    fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Takes the stored error, leaving `None` behind. Must only be
    /// called by the drain thread, after `is_done()` observed `true`.
    unsafe fn take(&self) -> Option<OperatorError> {
        unsafe { (*self.slot.get()).take() }
    }
}

/// The thing a drain pass polls from and discards into: either our own
/// owned queue, or an upstream-owned queue we were fused onto. Kept as a
/// trait (rather than matching on [`Source`] inside every pass) so the
/// three drain loops share one body generic over `P`.
trait PollSource<T> {
    fn poll_one(&self) -> Result<Option<T>, OperatorError>;
    fn is_empty_now(&self) -> bool;
    fn size_hint(&self) -> usize;
    fn discard_all(&self, discard: &mut dyn FnMut(T));
}

/// Our own queue (§2 C1), used when upstream offered no fusion.
struct OwnedQueueSource<T>(Arc<dyn Queue<T>>);

impl<T: Send> PollSource<T> for OwnedQueueSource<T> {
    fn poll_one(&self) -> Result<Option<T>, OperatorError> {
        Ok(self.0.poll())
    }
    fn is_empty_now(&self) -> bool {
        self.0.is_empty()
    }
    fn size_hint(&self) -> usize {
        self.0.len()
    }
    fn discard_all(&self, discard: &mut dyn FnMut(T)) {
        self.0.clear_with(discard)
    }
}

/// Upstream adopted as a finite synchronous source (§4.1 SYNC).
struct SyncQueueSource<T>(Arc<dyn FuseableSubscription<T>>);

impl<T> PollSource<T> for SyncQueueSource<T> {
    fn poll_one(&self) -> Result<Option<T>, OperatorError> {
        self.0.poll()
    }
    fn is_empty_now(&self) -> bool {
        self.0.is_empty()
    }
    fn size_hint(&self) -> usize {
        self.0.size()
    }
    fn discard_all(&self, discard: &mut dyn FnMut(T)) {
        // A SYNC source has no concurrent producer, so polling it to
        // exhaustion to run the discard hook is safe (§4.3.4).
        while let Ok(Some(v)) = self.0.poll() {
            discard(v);
        }
    }
}

/// Upstream adopted as a shared async queue (§4.1 ASYNC).
struct AsyncQueueSource<T>(Arc<dyn FuseableSubscription<T>>);

impl<T> AsyncQueueSource<T> {
    fn request(&self, n: u64) {
        self.0.request(n);
    }
}

impl<T> PollSource<T> for AsyncQueueSource<T> {
    fn poll_one(&self) -> Result<Option<T>, OperatorError> {
        self.0.poll()
    }
    fn is_empty_now(&self) -> bool {
        self.0.is_empty()
    }
    fn size_hint(&self) -> usize {
        self.0.size()
    }
    fn discard_all(&self, _discard: &mut dyn FnMut(T)) {
        // §4.3.4: the ASYNC source owns the queue; iterating it from the
        // drain side would race its producer, so we defer to its own
        // `clear()` instead of polling element-by-element.
        self.0.clear();
    }
}

/// Tagged `sourceMode` (§3/§9): which kind of upstream we ended up with,
/// and where the queue we poll from actually lives.
enum Source<T> {
    None {
        queue: OwnedQueueSource<T>,
        upstream: Arc<dyn FuseableSubscription<T>>,
    },
    Sync(SyncQueueSource<T>),
    Async(AsyncQueueSource<T>),
}

/// The shared state machine and drain loop (§3, §4.3, §4.4), generic
/// over how emission is delivered to the downstream.
pub(crate) struct Engine<T: Send + 'static, E: EmitTarget<T>> {
    target: E,
    config: PrefetchConfig,
    queue_factory: QueueFactory<T>,
    discard_hook: Arc<dyn Fn(T) + Send + Sync>,
    /// Handle to this engine's own outer `Arc`, handed to the downstream
    /// in `on_subscribe`. Populated via `Arc::new_cyclic` at construction
    /// so `on_subscribe` can stay a plain `&self` method, matching the
    /// [`crate::reactive::Subscriber`] trait's fixed receiver.
    self_handle: Weak<dyn FuseableSubscription<T>>,
    source: OnceLock<Source<T>>,
    requested: AtomicU64,
    wip: AtomicU32,
    cancelled: AtomicBool,
    /// Latches once a terminal signal has actually been delivered
    /// downstream, so a spurious re-entry into drain (e.g. a downstream
    /// `request` arriving after `on_complete`) can never deliver a
    /// second terminal signal (invariant 5).
    finished: AtomicBool,
    terminal: TerminalError,
    output_fused: AtomicBool,
    first_request_issued: AtomicBool,
    /// Mutual exclusion for every direct touch of the queue outside the
    /// drain loop's own `wip` guard: an output-fused downstream's
    /// `poll()`/`clear()` never takes `wip` (it isn't part of the drain
    /// loop), so without a guard of its own it can land on the same
    /// `ArrayQueue` slot at the same instant as the drain thread's
    /// cancel/terminal-error discard. Unlike `wip`'s missed-work
    /// handshake, `poll()` can't hand its work off to a different
    /// invocation — its caller needs that exact value back — so
    /// contention here is resolved with a short busy-spin instead, the
    /// same `spin_loop` idiom `veloce`'s own `send_spin`/`recv_spin` use.
    access_lock: AtomicBool,
    /// Emission/poll counter since the last replenish. Owned by whichever
    /// thread is exclusively allowed to touch it at a time: the
    /// WIP-guarded drain thread while non-fused, or the sole polling
    /// thread while output-fused (the two are mutually exclusive via
    /// `output_fused`, never active at once).
    produced: UnsafeCell<u64>,
}

unsafe impl<T: Send, E: EmitTarget<T>> Sync for Engine<T, E> {}

impl<T: Send + 'static, E: EmitTarget<T>> Engine<T, E> {
    pub(crate) fn new(
        target: E,
        config: PrefetchConfig,
        queue_factory: QueueFactory<T>,
        discard_hook: Arc<dyn Fn(T) + Send + Sync>,
        self_handle: Weak<dyn FuseableSubscription<T>>,
    ) -> Self {
        Self {
            target,
            config,
            queue_factory,
            discard_hook,
            self_handle,
            source: OnceLock::new(),
            requested: AtomicU64::new(0),
            wip: AtomicU32::new(0),
            cancelled: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            terminal: TerminalError::new(),
            output_fused: AtomicBool::new(false),
            first_request_issued: AtomicBool::new(false),
            access_lock: AtomicBool::new(false),
            produced: UnsafeCell::new(0),
        }
    }

    // ---- Subscriber<Upstream> role (§4.3.1) --------------------------

    pub(crate) fn on_subscribe(&self, upstream: Arc<dyn FuseableSubscription<T>>) {
        if self.source.get().is_some() {
            upstream.cancel();
            self.target.on_error(OperatorError::ProtocolViolation(
                "on_subscribe called more than once",
            ));
            return;
        }

        let negotiated = upstream.request_fusion(FusionMode::Any);
        tracing::debug!(?negotiated, "negotiated upstream fusion");
        let source = match negotiated {
            FusionMode::Sync => {
                // Invariant 6: a SYNC source has no async termination
                // signal, so completion is implied from construction.
                self.terminal.publish(None);
                Source::Sync(SyncQueueSource(upstream))
            }
            FusionMode::Async => Source::Async(AsyncQueueSource(upstream)),
            _ => {
                let queue = (self.queue_factory)(self.config.prefetch());
                Source::None {
                    queue: OwnedQueueSource(queue),
                    upstream,
                }
            }
        };
        // Single-call protocol already checked above.
        let _ = self.source.set(source);

        let handle = self
            .self_handle
            .upgrade()
            .expect("engine's own Arc is alive for the duration of on_subscribe");
        self.target.on_subscribe(handle);

        if self.config.request_mode() == RequestMode::Eager {
            self.issue_initial_request();
        }
    }

    fn issue_initial_request(&self) {
        let n = unbounded_or_prefetch(self.config.prefetch());
        match self.source.get() {
            Some(Source::None { upstream, .. }) => upstream.request(n),
            Some(Source::Async(s)) => s.request(n),
            // A SYNC source is poll-driven; it never receives a request.
            Some(Source::Sync(_)) | None => {}
        }
    }

    /// LAZY policy's first-request guard (§3 `firstRequest`, §6): flips on
    /// whichever of `request()`/`drain()`/`poll()` runs first, not just an
    /// explicit downstream `request(n)` — a poll-only, output-fused
    /// downstream (e.g. [`PrefetchStream`](crate::stream::PrefetchStream))
    /// never calls `request()` at all, so gating the initial upstream
    /// request on that call alone would deadlock it forever.
    fn maybe_issue_lazy_initial_request(&self) {
        if self.config.request_mode() == RequestMode::Lazy
            && self
                .first_request_issued
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            self.issue_initial_request();
        }
    }

    pub(crate) fn on_next(&self, value: T) {
        match self.source.get() {
            Some(Source::None { queue, .. }) => {
                if self.terminal.is_done() || self.cancelled.load(Ordering::Acquire) {
                    self.discard_one(value);
                    return;
                }
                if let Err(overflowed) = queue.0.offer(value) {
                    self.discard_one(overflowed);
                    if !self.terminal.is_done() {
                        tracing::warn!("prefetch queue overflow, beyond requested window");
                        self.terminal.publish(Some(OperatorError::BackpressureOverflow));
                    }
                }
                self.drain();
            }
            Some(Source::Sync(_)) => {
                self.discard_one(value);
                self.target.on_error(OperatorError::ProtocolViolation(
                    "on_next called on a SYNC-fused subscription",
                ));
            }
            Some(Source::Async(_)) => {
                // An ASYNC-fused upstream should signal through `notify`
                // (see plain/conditional), not push a value through us;
                // treat a stray on_next defensively as just a drain kick.
                self.discard_one(value);
                self.drain();
            }
            None => self.discard_one(value),
        }
    }

    /// Kicks the drain loop without pushing a value. This is how an
    /// ASYNC-fused upstream notifies us that it has enqueued something
    /// into the queue we share with it — the Rust analogue of the source
    /// protocol's `onNext(null)` poke, expressed without requiring a
    /// sentinel value of type `T`.
    pub(crate) fn notify(&self) {
        self.drain();
    }

    pub(crate) fn on_error(&self, error: OperatorError) {
        if self.terminal.is_done() {
            return;
        }
        tracing::trace!("upstream on_error");
        self.terminal.publish(Some(error));
        self.drain();
    }

    pub(crate) fn on_complete(&self) {
        if self.terminal.is_done() {
            return;
        }
        tracing::trace!("upstream on_complete");
        self.terminal.publish(None);
        self.drain();
    }

    // ---- Subscription role, exposed to our downstream (§4.2, §4.3.1) -

    pub(crate) fn request(&self, n: u64) {
        if n == 0 {
            self.target.on_error(OperatorError::ProtocolViolation(
                "request(n) called with n == 0",
            ));
            return;
        }
        request_add(&self.requested, n);
        self.maybe_issue_lazy_initial_request();
        self.drain();
    }

    pub(crate) fn cancel(&self) {
        if self
            .cancelled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        tracing::debug!("cancelled");
        match self.source.get() {
            Some(Source::None { upstream, .. }) => upstream.cancel(),
            Some(Source::Sync(s)) => s.0.cancel(),
            Some(Source::Async(s)) => s.0.cancel(),
            None => {}
        }
        self.drain();
    }

    // ---- FuseableSubscription role, exposed to our downstream (§4.1) -

    pub(crate) fn request_fusion(&self, requested: FusionMode) -> FusionMode {
        let granted = match self.source.get() {
            Some(Source::Sync(_)) if matches!(requested, FusionMode::Sync | FusionMode::Any) => {
                FusionMode::Sync
            }
            Some(_) if matches!(requested, FusionMode::Async | FusionMode::Any) => {
                FusionMode::Async
            }
            _ => FusionMode::None,
        };
        if granted.is_fused() {
            self.output_fused.store(true, Ordering::Release);
        }
        granted
    }

    pub(crate) fn poll(&self) -> Result<Option<T>, OperatorError> {
        // LAZY policy (§3 `firstRequest`, §6): a poll-driven, output-fused
        // downstream never calls `request()`, so the initial upstream
        // request has to flip here too.
        self.maybe_issue_lazy_initial_request();
        self.with_queue_access(|| match self.source.get().expect("poll before on_subscribe") {
            Source::Sync(s) => s.poll_one(),
            Source::None { queue, upstream } => {
                let value = queue.poll_one()?;
                if value.is_some() {
                    self.bump_and_maybe_replenish(|n| upstream.request(n));
                }
                Ok(value)
            }
            Source::Async(s) => {
                let value = s.poll_one()?;
                if value.is_some() {
                    self.bump_and_maybe_replenish(|n| s.request(n));
                }
                Ok(value)
            }
        })
    }

    pub(crate) fn is_empty(&self) -> bool {
        match self.source.get() {
            Some(Source::None { queue, .. }) => queue.is_empty_now(),
            Some(Source::Sync(s)) => s.is_empty_now(),
            Some(Source::Async(s)) => s.is_empty_now(),
            None => true,
        }
    }

    pub(crate) fn size(&self) -> usize {
        match self.source.get() {
            Some(Source::None { queue, .. }) => queue.size_hint(),
            Some(Source::Sync(s)) => s.size_hint(),
            Some(Source::Async(s)) => s.size_hint(),
            None => 0,
        }
    }

    pub(crate) fn clear(&self) {
        // §4.3.4: a downstream-initiated `clear()` never runs the
        // discard hook (the hook models *our* internal discard policy on
        // overflow/cancel/error, not a capability of the bare Reactive
        // Streams `Fuseable.QueueSubscription.clear()` contract downstream
        // is exercising here) — and it must go through the same
        // `access_lock` as `poll()` and the drain thread's own discard, so
        // it can never run concurrently with either (§4.3.4, §5). Calling
        // `clear()` on an already-empty queue is a no-op, so two `clear()`
        // calls serialised one after another by the lock is harmless.
        self.with_queue_access(|| match self.source.get() {
            Some(Source::None { queue, .. }) => queue.0.clear(),
            Some(Source::Sync(s)) => s.0.clear(),
            Some(Source::Async(s)) => s.0.clear(),
            None => {}
        });
    }

    /// Busy-spins until exclusive access to the queue is acquired, runs
    /// `f`, then releases. Guards every direct queue touch that can race
    /// an output-fused downstream's own `poll()`/`clear()`: `poll()`
    /// itself, `clear()`, and the drain thread's discard on
    /// cancel/terminal error (§4.3.4, §5). `wip` cannot serve this role —
    /// an output-fused downstream's `poll()` is not part of the drain
    /// loop and never touches `wip` at all.
    fn with_queue_access<R>(&self, f: impl FnOnce() -> R) -> R {
        while self
            .access_lock
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
        let result = f();
        self.access_lock.store(false, Ordering::Release);
        result
    }

    // ---- Drain loop (§4.3.2) ------------------------------------------

    fn drain(&self) {
        if self.wip.fetch_add(1, Ordering::AcqRel) != 0 {
            return;
        }
        // LAZY policy (§3 `firstRequest`, §6): the first drain entry
        // issues the initial upstream request just as much as an explicit
        // downstream `request(n)` does.
        self.maybe_issue_lazy_initial_request();
        let mut missed = 1u32;
        loop {
            match self.source.get().expect("drain entered before on_subscribe") {
                Source::None { queue, upstream } => {
                    if self.output_fused.load(Ordering::Acquire) {
                        self.drain_output_pass(queue);
                    } else {
                        self.drain_async_pass(queue, |n| upstream.request(n));
                    }
                }
                Source::Sync(s) => {
                    if self.output_fused.load(Ordering::Acquire) {
                        self.drain_output_pass(s);
                    } else {
                        self.drain_sync_pass(s);
                    }
                }
                Source::Async(s) => {
                    if self.output_fused.load(Ordering::Acquire) {
                        self.drain_output_pass(s);
                    } else {
                        self.drain_async_pass(s, |n| s.request(n));
                    }
                }
            }
            missed = self.wip.fetch_sub(missed, Ordering::AcqRel) - missed;
            if missed == 0 {
                break;
            }
        }
    }

    fn drain_sync_pass<P: PollSource<T>>(&self, source: &P) {
        // Cancellation/error/exhaustion must be observable even when the
        // downstream currently has zero outstanding demand — terminal
        // signals and discard are not gated on `requested` (§5, §8
        // invariant 4). Without this upfront check, `requested == 0`
        // would make the loop below a no-op and strand queued elements
        // and a pending terminal signal indefinitely.
        if self.check_terminated(source, source.is_empty_now(), &mut None) {
            return;
        }
        let requested = self.requested.load(Ordering::Acquire);
        let mut emitted: u64 = 0;
        while emitted != requested {
            let mut value = source.poll_one().unwrap_or_else(|e| {
                if !self.terminal.is_done() {
                    self.terminal.publish(Some(e));
                }
                None
            });
            let empty = value.is_none();
            if self.check_terminated(source, empty, &mut value) {
                return;
            }
            if empty {
                break;
            }
            let v = value.take().unwrap();
            if self.target.emit(v) {
                emitted += 1;
            }
        }
        if emitted != 0 {
            request_sub(&self.requested, emitted);
        }
    }

    fn drain_async_pass<P: PollSource<T>>(&self, source: &P, request: impl Fn(u64)) {
        // See the comment in `drain_sync_pass`: same rationale.
        if self.check_terminated(source, source.is_empty_now(), &mut None) {
            return;
        }
        let requested = self.requested.load(Ordering::Acquire);
        let mut emitted: u64 = 0;
        while emitted != requested {
            let mut value = source.poll_one().unwrap_or_else(|e| {
                if !self.terminal.is_done() {
                    self.terminal.publish(Some(e));
                }
                None
            });
            let empty = value.is_none();
            if self.check_terminated(source, empty, &mut value) {
                return;
            }
            if empty {
                break;
            }
            let v = value.take().unwrap();
            if self.target.emit(v) {
                emitted += 1;
            }
            self.bump_and_maybe_replenish(&request);
        }
        if emitted != 0 {
            request_sub(&self.requested, emitted);
        }
    }

    fn drain_output_pass<P: PollSource<T>>(&self, source: &P) {
        if self.cancelled.load(Ordering::Acquire) {
            self.discard_remaining(source);
            return;
        }
        self.target.on_fused_ready();
        if self.terminal.is_done() {
            let empty = source.is_empty_now();
            let mut none = None;
            self.check_terminated(source, empty, &mut none);
        }
    }

    /// §4.3.3's `checkTerminated`. `current` is only consumed (via
    /// `take`) on a branch that actually terminates; otherwise the
    /// caller gets it back to go on and emit it.
    fn check_terminated<P: PollSource<T>>(
        &self,
        source: &P,
        empty: bool,
        current: &mut Option<T>,
    ) -> bool {
        if self.finished.load(Ordering::Acquire) {
            if let Some(v) = current.take() {
                self.discard_one(v);
            }
            return true;
        }
        if self.cancelled.load(Ordering::Acquire) {
            if let Some(v) = current.take() {
                self.discard_one(v);
            }
            self.discard_remaining(source);
            self.finished.store(true, Ordering::Release);
            return true;
        }
        if self.terminal.is_done() {
            // SAFETY: only the WIP-owning drain thread reaches this call.
            let error = unsafe { self.terminal.take() };
            if let Some(err) = error {
                if let Some(v) = current.take() {
                    self.discard_one(v);
                }
                self.discard_remaining(source);
                self.finished.store(true, Ordering::Release);
                self.target.on_error(err);
                return true;
            } else if empty {
                self.finished.store(true, Ordering::Release);
                self.target.on_complete();
                return true;
            }
        }
        false
    }

    fn discard_one(&self, value: T) {
        (self.discard_hook)(value);
    }

    fn discard_remaining<P: PollSource<T>>(&self, source: &P) {
        // Same `access_lock` as `poll()`/`clear()` (§4.3.4, §5): an
        // output-fused downstream's `poll()` isn't serialised by `wip`, so
        // without this the drain thread's cancel/terminal-error discard
        // could run concurrently with a downstream `poll()` on the same
        // queue.
        self.with_queue_access(|| source.discard_all(&mut |v| (self.discard_hook)(v)));
    }

    fn bump_and_maybe_replenish(&self, request: impl FnOnce(u64)) {
        // SAFETY: see the `produced` field doc — exclusive by construction.
        let produced = unsafe { &mut *self.produced.get() };
        *produced += 1;
        let limit = self.config.limit() as u64;
        // `limit == 0` (prefetch small enough that 3/4 of it rounds down
        // to nothing) and `limit == usize::MAX` (unbounded prefetch, §3:
        // "limit = ... or ∞ if prefetch is ∞") both mean "never replenish".
        if limit != 0 && limit != crate::request::UNBOUNDED && *produced >= limit {
            *produced = 0;
            request(limit);
        }
    }
}

#![forbid(unsafe_code)]

//! Fan-in completion barrier.
//!
//! A [`Signal`] counts outstanding work. Each call to [`Signal::pending`]
//! hands out a [`Token`] for one unit of work; releasing the token marks that
//! unit done. Callbacks registered with [`Signal::wait_for_all`] run once the
//! count reaches zero.
//!
//! Signals compose: [`Signal::fan_into`] makes one signal hold a token on
//! another until it goes idle, so a tree of signals completes bottom-up.
//!
//! # Invariants
//!
//! 1. A registered callback runs at most once.
//! 2. Callbacks registered on the same signal run in registration order.
//! 3. Registering while the count is zero runs the callback right away
//!    ([`Dispatch::Now`]) or on the next scheduler tick
//!    ([`Dispatch::NextTick`]).
//! 4. A token releases exactly one unit. Tokens are consumed on release, so
//!    double release cannot be expressed.
//! 5. No internal borrow is held while callbacks run.
//!
//! # Failure Modes
//!
//! | Failure | Behavior |
//! |---------|----------|
//! | Tolerant resolver returns `Err` | Logged at WARN, unit still released |
//! | Strict resolver returns `Err` | Error returned, unit stays outstanding |
//! | Token dropped unreleased | Logged at WARN, unit released without resolver |
//! | Token released after `force_complete` | Ignored |

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use tracing::{trace, warn};

use crate::error::ResolveError;
use crate::scheduler::Scheduler;

/// When a completion callback runs if the signal is already idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Dispatch {
    /// Synchronously, inside the call that made the signal idle.
    #[default]
    Now,
    /// On the next [`Scheduler::tick`].
    NextTick,
}

type Waiter = Box<dyn FnOnce()>;

struct SignalState {
    label: String,
    pending: usize,
    epoch: u64,
    waiters: VecDeque<(Dispatch, Waiter)>,
}

/// Shared completion barrier. Clones refer to the same signal.
#[derive(Clone)]
pub struct Signal {
    state: Rc<RefCell<SignalState>>,
    scheduler: Scheduler,
}

impl Signal {
    /// Create an idle signal. `label` is only used for diagnostics.
    #[must_use]
    pub fn new(label: impl Into<String>, scheduler: &Scheduler) -> Self {
        Self {
            state: Rc::new(RefCell::new(SignalState {
                label: label.into(),
                pending: 0,
                epoch: 0,
                waiters: VecDeque::new(),
            })),
            scheduler: scheduler.clone(),
        }
    }

    #[must_use]
    pub fn label(&self) -> String {
        self.state.borrow().label.clone()
    }

    /// Number of unreleased tokens.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.state.borrow().pending
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.pending_count() == 0
    }

    /// Number of callbacks waiting for the count to reach zero.
    #[must_use]
    pub fn waiter_count(&self) -> usize {
        self.state.borrow().waiters.len()
    }

    /// Acquire a token for one unit of outstanding work.
    pub fn pending(&self) -> Token {
        Token {
            slot: self.acquire(),
        }
    }

    /// Acquire a token whose release first runs `on_resolve` with the value
    /// passed to [`ResolvingToken::resolve`].
    ///
    /// With `tolerant` set, an error from `on_resolve` is logged and the unit
    /// is released anyway, so one failing waiter cannot stall the others.
    pub fn pending_with<A: 'static>(
        &self,
        tolerant: bool,
        on_resolve: impl FnOnce(A) -> Result<(), ResolveError> + 'static,
    ) -> ResolvingToken<A> {
        ResolvingToken {
            slot: self.acquire(),
            tolerant,
            on_resolve: Box::new(on_resolve),
        }
    }

    /// Run `callback` once the count is (or becomes) zero.
    pub fn wait_for_all(&self, dispatch: Dispatch, callback: impl FnOnce() + 'static) {
        {
            let mut state = self.state.borrow_mut();
            if state.pending > 0 {
                state.waiters.push_back((dispatch, Box::new(callback)));
                return;
            }
        }
        self.dispatch(dispatch, Box::new(callback));
    }

    /// Hold a token on `target` until this signal next goes idle.
    pub fn fan_into(&self, target: &Signal) {
        let token = target.pending();
        self.wait_for_all(Dispatch::Now, move || token.release());
    }

    /// Future that resolves the next time the count is zero.
    pub fn idle(&self) -> SignalIdle {
        let shared = Rc::new(IdleShared::default());
        let notify = Rc::clone(&shared);
        self.wait_for_all(Dispatch::Now, move || {
            notify.done.set(true);
            let waker = notify.waker.borrow_mut().take();
            if let Some(waker) = waker {
                waker.wake();
            }
        });
        SignalIdle { shared }
    }

    /// Drop the count to zero and run every waiter, bypassing normal
    /// resolution. Tokens issued before this call are ignored when released.
    ///
    /// Returns the number of waiters that were run.
    pub fn force_complete(&self) -> usize {
        let (label, abandoned, waiters) = {
            let mut state = self.state.borrow_mut();
            let abandoned = state.pending;
            state.pending = 0;
            state.epoch += 1;
            let waiters: Vec<_> = state.waiters.drain(..).collect();
            (state.label.clone(), abandoned, waiters)
        };
        warn!(signal = %label, abandoned, waiters = waiters.len(), "signal force-completed");
        let count = waiters.len();
        for (dispatch, waiter) in waiters {
            self.dispatch(dispatch, waiter);
        }
        count
    }

    fn acquire(&self) -> Slot {
        let mut state = self.state.borrow_mut();
        state.pending += 1;
        trace!(signal = %state.label, pending = state.pending, "token acquired");
        Slot {
            signal: self.clone(),
            epoch: state.epoch,
            armed: true,
        }
    }

    fn release_slot(&self, epoch: u64) {
        let waiters: Vec<_> = {
            let mut state = self.state.borrow_mut();
            if epoch != state.epoch {
                trace!(signal = %state.label, "stale token ignored");
                return;
            }
            debug_assert!(state.pending > 0, "signal count underflow");
            state.pending = state.pending.saturating_sub(1);
            trace!(signal = %state.label, pending = state.pending, "token released");
            if state.pending > 0 {
                return;
            }
            state.waiters.drain(..).collect()
        };
        for (dispatch, waiter) in waiters {
            self.dispatch(dispatch, waiter);
        }
    }

    fn dispatch(&self, dispatch: Dispatch, waiter: Waiter) {
        match dispatch {
            Dispatch::Now => waiter(),
            Dispatch::NextTick => self.scheduler.defer(waiter),
        }
    }
}

impl std::fmt::Debug for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("Signal")
            .field("label", &state.label)
            .field("pending", &state.pending)
            .field("waiters", &state.waiters.len())
            .finish()
    }
}

/// One acquired unit of a signal's count.
struct Slot {
    signal: Signal,
    epoch: u64,
    armed: bool,
}

impl Slot {
    fn release(mut self) {
        self.armed = false;
        self.signal.release_slot(self.epoch);
    }

    /// Give up the unit without releasing it.
    fn leak(mut self) {
        self.armed = false;
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        if self.armed {
            self.armed = false;
            warn!(signal = %self.signal.label(), "token dropped without being released");
            self.signal.release_slot(self.epoch);
        }
    }
}

/// Outstanding unit of work on a [`Signal`].
#[must_use = "an unreleased token keeps its signal pending"]
pub struct Token {
    slot: Slot,
}

impl Token {
    /// Mark the unit done.
    pub fn release(self) {
        self.slot.release();
    }
}

impl std::fmt::Debug for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Token")
            .field("signal", &self.slot.signal.label())
            .finish()
    }
}

/// Outstanding unit of work whose release runs a resolver first.
#[must_use = "an unresolved token keeps its signal pending"]
pub struct ResolvingToken<A> {
    slot: Slot,
    tolerant: bool,
    on_resolve: Box<dyn FnOnce(A) -> Result<(), ResolveError>>,
}

impl<A> ResolvingToken<A> {
    /// Run the resolver with `value`, then release the unit.
    ///
    /// # Errors
    ///
    /// For a strict (non-tolerant) token, returns the resolver's error. The
    /// unit then stays outstanding and the signal does not complete.
    pub fn resolve(self, value: A) -> Result<(), ResolveError> {
        let Self {
            slot,
            tolerant,
            on_resolve,
        } = self;
        match on_resolve(value) {
            Ok(()) => {
                slot.release();
                Ok(())
            }
            Err(err) if tolerant => {
                warn!(signal = %slot.signal.label(), error = %err, "tolerant resolver failed");
                slot.release();
                Ok(())
            }
            Err(err) => {
                slot.leak();
                Err(err)
            }
        }
    }
}

impl<A> std::fmt::Debug for ResolvingToken<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvingToken")
            .field("signal", &self.slot.signal.label())
            .field("tolerant", &self.tolerant)
            .finish()
    }
}

#[derive(Default)]
struct IdleShared {
    done: Cell<bool>,
    waker: RefCell<Option<Waker>>,
}

/// Future returned by [`Signal::idle`].
#[must_use = "futures do nothing unless polled"]
pub struct SignalIdle {
    shared: Rc<IdleShared>,
}

impl Future for SignalIdle {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.shared.done.get() {
            return Poll::Ready(());
        }
        *self.shared.waker.borrow_mut() = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl std::fmt::Debug for SignalIdle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalIdle")
            .field("done", &self.shared.done.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::capture_warnings;
    use futures::FutureExt;

    fn signal(label: &str) -> (Signal, Scheduler) {
        let scheduler = Scheduler::new();
        (Signal::new(label, &scheduler), scheduler)
    }

    fn counter() -> (Rc<Cell<u32>>, impl FnOnce() + 'static) {
        let count = Rc::new(Cell::new(0));
        let c = Rc::clone(&count);
        (count, move || c.set(c.get() + 1))
    }

    #[test]
    fn waiter_fires_once_after_token_release() {
        let (signal, _) = signal("s");
        let token = signal.pending();
        let (fired, callback) = counter();
        signal.wait_for_all(Dispatch::Now, callback);
        assert_eq!(fired.get(), 0);

        token.release();
        assert_eq!(fired.get(), 1);
        assert!(signal.is_idle());
        assert_eq!(signal.waiter_count(), 0);
    }

    #[test]
    fn idle_signal_runs_waiter_immediately() {
        let (signal, _) = signal("s");
        let (fired, callback) = counter();
        signal.wait_for_all(Dispatch::Now, callback);
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn next_tick_defers_until_scheduler_runs() {
        let (signal, scheduler) = signal("s");
        let (fired, callback) = counter();
        signal.wait_for_all(Dispatch::NextTick, callback);
        assert_eq!(fired.get(), 0);
        scheduler.tick();
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn next_tick_waiter_deferred_after_release() {
        let (signal, scheduler) = signal("s");
        let token = signal.pending();
        let (fired, callback) = counter();
        signal.wait_for_all(Dispatch::NextTick, callback);
        token.release();
        assert_eq!(fired.get(), 0);
        assert_eq!(scheduler.run_until_idle(), 1);
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn waiters_run_in_registration_order() {
        let (signal, _) = signal("s");
        let token = signal.pending();
        let order = Rc::new(RefCell::new(Vec::new()));
        for i in 0..4 {
            let o = Rc::clone(&order);
            signal.wait_for_all(Dispatch::Now, move || o.borrow_mut().push(i));
        }
        token.release();
        assert_eq!(*order.borrow(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn waits_for_every_token() {
        let (signal, _) = signal("s");
        let a = signal.pending();
        let b = signal.pending();
        let (fired, callback) = counter();
        signal.wait_for_all(Dispatch::Now, callback);
        a.release();
        assert_eq!(fired.get(), 0);
        assert_eq!(signal.pending_count(), 1);
        b.release();
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn signal_is_reusable() {
        let (signal, _) = signal("s");
        signal.pending().release();
        let token = signal.pending();
        let (fired, callback) = counter();
        signal.wait_for_all(Dispatch::Now, callback);
        assert_eq!(fired.get(), 0);
        token.release();
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn resolving_token_passes_value() {
        let (signal, _) = signal("s");
        let seen = Rc::new(Cell::new(0));
        let s = Rc::clone(&seen);
        let token = signal.pending_with(false, move |v: u32| {
            s.set(v);
            Ok(())
        });
        token.resolve(7).unwrap();
        assert_eq!(seen.get(), 7);
        assert!(signal.is_idle());
    }

    #[test]
    fn tolerant_failure_is_logged_and_completes() {
        let (signal, _) = signal("tolerant");
        let failing = signal.pending_with(true, |_: ()| Err("boom".into()));
        let healthy = signal.pending();
        let (fired, callback) = counter();
        signal.wait_for_all(Dispatch::Now, callback);

        let (result, warnings) = capture_warnings(|| failing.resolve(()));
        assert!(result.is_ok());
        assert!(warnings.iter().any(|w| w.contains("tolerant resolver failed")));

        healthy.release();
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn strict_failure_propagates_and_keeps_signal_pending() {
        let (signal, _) = signal("strict");
        let failing = signal.pending_with(false, |_: ()| Err("boom".into()));
        let (fired, callback) = counter();
        signal.wait_for_all(Dispatch::Now, callback);

        let err = failing.resolve(()).unwrap_err();
        assert_eq!(err.to_string(), "boom");
        assert_eq!(signal.pending_count(), 1);
        assert_eq!(fired.get(), 0);
    }

    #[test]
    fn fan_into_composes_signals() {
        let scheduler = Scheduler::new();
        let parent = Signal::new("parent", &scheduler);
        let left = Signal::new("left", &scheduler);
        let right = Signal::new("right", &scheduler);
        let l = left.pending();
        let r = right.pending();
        left.fan_into(&parent);
        right.fan_into(&parent);
        let (fired, callback) = counter();
        parent.wait_for_all(Dispatch::Now, callback);

        assert_eq!(parent.pending_count(), 2);
        l.release();
        assert_eq!(fired.get(), 0);
        r.release();
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn force_complete_runs_waiters_and_ignores_stale_tokens() {
        let (signal, _) = signal("stuck");
        let stale = signal.pending();
        let (fired, callback) = counter();
        signal.wait_for_all(Dispatch::Now, callback);

        let (ran, warnings) = capture_warnings(|| signal.force_complete());
        assert_eq!(ran, 1);
        assert_eq!(fired.get(), 1);
        assert!(warnings.iter().any(|w| w.contains("force-completed")));

        let fresh = signal.pending();
        stale.release();
        assert_eq!(signal.pending_count(), 1);
        fresh.release();
        assert!(signal.is_idle());
    }

    #[test]
    fn dropped_token_releases_with_warning() {
        let (signal, _) = signal("leaky");
        let token = signal.pending();
        let (fired, callback) = counter();
        signal.wait_for_all(Dispatch::Now, callback);

        let ((), warnings) = capture_warnings(|| drop(token));
        assert_eq!(fired.get(), 1);
        assert!(warnings.iter().any(|w| w.contains("dropped without being released")));
    }

    #[test]
    fn idle_future_resolves_after_release() {
        let (signal, _) = signal("s");
        let token = signal.pending();
        let mut idle = signal.idle();
        assert!((&mut idle).now_or_never().is_none());
        token.release();
        assert!(idle.now_or_never().is_some());
    }

    #[test]
    fn idle_future_ready_when_already_idle() {
        let (signal, _) = signal("s");
        assert!(signal.idle().now_or_never().is_some());
    }

    #[test]
    fn waiter_may_reenter_signal() {
        let (signal, _) = signal("s");
        let token = signal.pending();
        let inner = signal.clone();
        let (fired, callback) = counter();
        signal.wait_for_all(Dispatch::Now, move || {
            inner.wait_for_all(Dispatch::Now, callback);
        });
        token.release();
        assert_eq!(fired.get(), 1);
    }
}

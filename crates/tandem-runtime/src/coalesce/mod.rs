#![forbid(unsafe_code)]

//! Request coalescing.
//!
//! A *flight* is one underlying provider operation. While a flight for a key
//! is outstanding, further calls with the same key attach to it instead of
//! starting another one; every attached caller receives a clone of the
//! flight's result.
//!
//! - [`Coalescer`]: one key per call.
//! - [`KeyedProvider`]: a coalescer plus the function deriving the key from
//!   the call arguments.
//! - [`PartitionedCoalescer`]: calls whose key is a set of sub-keys. Sub-keys
//!   already in flight re-attach; the rest form one new flight.
//!
//! # Invariants
//!
//! 1. At most one flight per key is outstanding.
//! 2. Waiters are registered before the flight starts, so a provider that
//!    answers synchronously is handled.
//! 3. A key is cleared as soon as its flight delivers; later calls start a
//!    new flight.
//! 4. Waiters of one flight are called in the order they attached.

mod keyed;
mod partitioned;

pub use keyed::KeyedProvider;
pub use partitioned::{KeyedResults, Partition, PartitionedCoalescer};

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::rc::Rc;

use futures::FutureExt;
use futures::channel::oneshot;
use futures::future::LocalBoxFuture;
use tracing::debug;

use crate::error::ProviderError;
use crate::provider::Responder;

/// Callback receiving the result of a flight.
pub type Completion<V> = Box<dyn FnOnce(Result<V, ProviderError>)>;

/// Whether a call started a flight or attached to one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Started,
    Joined,
}

/// Single-key request coalescer. Clones share the same flight table.
pub struct Coalescer<K, V> {
    label: Rc<str>,
    flights: Rc<RefCell<HashMap<K, Vec<Completion<V>>>>>,
}

impl<K, V> Clone for Coalescer<K, V> {
    fn clone(&self) -> Self {
        Self {
            label: Rc::clone(&self.label),
            flights: Rc::clone(&self.flights),
        }
    }
}

impl<K, V> Coalescer<K, V>
where
    K: Eq + Hash + Clone + fmt::Debug + 'static,
    V: Clone + 'static,
{
    /// `label` names the provider in logs and errors.
    #[must_use]
    pub fn new(label: &str) -> Self {
        Self {
            label: Rc::from(label),
            flights: Rc::new(RefCell::new(HashMap::new())),
        }
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Deliver the result for `key` to `callback`, calling `start` only when
    /// no flight for `key` is outstanding.
    pub fn call(
        &self,
        key: K,
        start: impl FnOnce(Responder<V>),
        callback: impl FnOnce(Result<V, ProviderError>) + 'static,
    ) -> CallOutcome {
        {
            let mut flights = self.flights.borrow_mut();
            if let Some(waiters) = flights.get_mut(&key) {
                waiters.push(Box::new(callback));
                debug!(coalescer = %self.label, key = ?key, waiters = waiters.len(), "joined in-flight request");
                return CallOutcome::Joined;
            }
            flights.insert(key.clone(), vec![Box::new(callback)]);
        }
        debug!(coalescer = %self.label, key = ?key, "starting request");
        let flights = Rc::clone(&self.flights);
        let responder = Responder::new(&*self.label, move |result: Result<V, ProviderError>| {
            let mut waiters = flights.borrow_mut().remove(&key).unwrap_or_default();
            if let Some(last) = waiters.pop() {
                for waiter in waiters {
                    waiter(result.clone());
                }
                last(result);
            }
        });
        start(responder);
        CallOutcome::Started
    }

    /// Future flavor of [`Coalescer::call`].
    pub fn call_async(
        &self,
        key: K,
        start: impl FnOnce(Responder<V>),
    ) -> LocalBoxFuture<'static, Result<V, ProviderError>> {
        let (tx, rx) = oneshot::channel();
        let provider = self.label.to_string();
        self.call(key, start, move |result| {
            let _ = tx.send(result);
        });
        async move {
            rx.await
                .unwrap_or_else(|_| Err(ProviderError::Abandoned { provider }))
        }
        .boxed_local()
    }

    /// Number of outstanding flights.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.flights.borrow().len()
    }

    #[must_use]
    pub fn is_in_flight(&self, key: &K) -> bool {
        self.flights.borrow().contains_key(key)
    }
}

impl<K, V> fmt::Debug for Coalescer<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coalescer")
            .field("label", &self.label)
            .field("in_flight", &self.flights.borrow().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    type Parked = Rc<RefCell<Vec<Responder<u32>>>>;

    fn parking() -> (Parked, Rc<Cell<u32>>, impl Fn() -> Box<dyn FnOnce(Responder<u32>)>) {
        let parked: Parked = Rc::new(RefCell::new(Vec::new()));
        let starts = Rc::new(Cell::new(0));
        let p = Rc::clone(&parked);
        let s = Rc::clone(&starts);
        let make = move || -> Box<dyn FnOnce(Responder<u32>)> {
            let p = Rc::clone(&p);
            let s = Rc::clone(&s);
            Box::new(move |responder| {
                s.set(s.get() + 1);
                p.borrow_mut().push(responder);
            })
        };
        (parked, starts, make)
    }

    fn sink() -> (Rc<RefCell<Vec<Result<u32, ProviderError>>>>, impl Fn() -> Completion<u32>) {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let s = Rc::clone(&seen);
        let make = move || -> Completion<u32> {
            let s = Rc::clone(&s);
            Box::new(move |r| s.borrow_mut().push(r))
        };
        (seen, make)
    }

    #[test]
    fn concurrent_calls_share_one_flight() {
        let coalescer = Coalescer::<&str, u32>::new("type");
        let (parked, starts, start) = parking();
        let (seen, callback) = sink();

        assert_eq!(coalescer.call("k", start(), callback()), CallOutcome::Started);
        assert_eq!(coalescer.call("k", start(), callback()), CallOutcome::Joined);
        assert_eq!(starts.get(), 1);
        assert!(coalescer.is_in_flight(&"k"));

        let responder = parked.borrow_mut().remove(0);
        responder.succeed(9);
        assert_eq!(*seen.borrow(), vec![Ok(9), Ok(9)]);
        assert_eq!(coalescer.in_flight(), 0);

        coalescer.call("k", start(), callback());
        assert_eq!(starts.get(), 2);
    }

    #[test]
    fn distinct_keys_fly_separately() {
        let coalescer = Coalescer::<&str, u32>::new("type");
        let (_parked, starts, start) = parking();
        let (_seen, callback) = sink();
        coalescer.call("a", start(), callback());
        coalescer.call("b", start(), callback());
        assert_eq!(starts.get(), 2);
        assert_eq!(coalescer.in_flight(), 2);
    }

    #[test]
    fn synchronous_responder_is_delivered() {
        let coalescer = Coalescer::<u8, u32>::new("type");
        let (seen, callback) = sink();
        let outcome = coalescer.call(1, |responder| responder.succeed(3), callback());
        assert_eq!(outcome, CallOutcome::Started);
        assert_eq!(*seen.borrow(), vec![Ok(3)]);
        assert_eq!(coalescer.in_flight(), 0);
    }

    #[test]
    fn failure_reaches_every_waiter() {
        let coalescer = Coalescer::<&str, u32>::new("query");
        let (parked, _starts, start) = parking();
        let (seen, callback) = sink();
        coalescer.call("k", start(), callback());
        coalescer.call("k", start(), callback());
        let responder = parked.borrow_mut().remove(0);
        responder.fail("down");
        let expected = Err(ProviderError::Failed {
            provider: "query".into(),
            message: "down".into(),
        });
        assert_eq!(*seen.borrow(), vec![expected.clone(), expected]);
    }

    #[test]
    fn waiter_may_restart_same_key() {
        let coalescer = Coalescer::<&str, u32>::new("type");
        let (parked, starts, start) = parking();
        let inner = coalescer.clone();
        let restart = start();
        coalescer.call("k", start(), move |_| {
            inner.call("k", restart, |_| {});
        });
        let responder = parked.borrow_mut().remove(0);
        responder.succeed(1);
        assert_eq!(starts.get(), 2);
        assert!(coalescer.is_in_flight(&"k"));
    }

    #[test]
    fn call_async_resolves_with_shared_result() {
        let coalescer = Coalescer::<&str, u32>::new("type");
        let (parked, starts, start) = parking();
        let first = coalescer.call_async("k", start());
        let second = coalescer.call_async("k", start());
        assert_eq!(starts.get(), 1);
        let responder = parked.borrow_mut().remove(0);
        responder.succeed(4);
        assert_eq!(first.now_or_never(), Some(Ok(4)));
        assert_eq!(second.now_or_never(), Some(Ok(4)));
    }
}

#![forbid(unsafe_code)]

use std::fmt;
use std::hash::Hash;
use std::rc::Rc;

use futures::future::LocalBoxFuture;

use super::{CallOutcome, Coalescer};
use crate::error::ProviderError;
use crate::provider::Responder;

/// A provider-shaped function wrapped in a [`Coalescer`], with the key derived
/// from the call arguments.
pub struct KeyedProvider<A, K, V> {
    coalescer: Coalescer<K, V>,
    key_of: Rc<dyn Fn(&A) -> K>,
    provider: Rc<dyn Fn(A, Responder<V>)>,
}

impl<A, K, V> Clone for KeyedProvider<A, K, V> {
    fn clone(&self) -> Self {
        Self {
            coalescer: self.coalescer.clone(),
            key_of: Rc::clone(&self.key_of),
            provider: Rc::clone(&self.provider),
        }
    }
}

impl<A, K, V> KeyedProvider<A, K, V>
where
    A: 'static,
    K: Eq + Hash + Clone + fmt::Debug + 'static,
    V: Clone + 'static,
{
    pub fn new(
        label: &str,
        key_of: impl Fn(&A) -> K + 'static,
        provider: impl Fn(A, Responder<V>) + 'static,
    ) -> Self {
        Self {
            coalescer: Coalescer::new(label),
            key_of: Rc::new(key_of),
            provider: Rc::new(provider),
        }
    }

    /// Call the provider with `args` unless an equal-keyed call is already
    /// in flight.
    pub fn call(
        &self,
        args: A,
        callback: impl FnOnce(Result<V, ProviderError>) + 'static,
    ) -> CallOutcome {
        let key = (self.key_of)(&args);
        let provider = Rc::clone(&self.provider);
        self.coalescer
            .call(key, move |responder| provider(args, responder), callback)
    }

    /// Call the provider without coalescing.
    pub fn call_direct(
        &self,
        args: A,
        callback: impl FnOnce(Result<V, ProviderError>) + 'static,
    ) {
        (self.provider)(args, Responder::new(self.coalescer.label(), callback));
    }

    pub fn call_async(&self, args: A) -> LocalBoxFuture<'static, Result<V, ProviderError>> {
        let key = (self.key_of)(&args);
        let provider = Rc::clone(&self.provider);
        self.coalescer
            .call_async(key, move |responder| provider(args, responder))
    }

    #[must_use]
    pub fn coalescer(&self) -> &Coalescer<K, V> {
        &self.coalescer
    }
}

impl<A, K, V> fmt::Debug for KeyedProvider<A, K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedProvider")
            .field("coalescer", &self.coalescer)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[derive(Debug, Clone)]
    struct Fetch {
        type_name: &'static str,
        attempt: u32,
    }

    #[test]
    fn key_function_decides_sharing() {
        let calls = Rc::new(RefCell::new(Vec::new()));
        let parked = Rc::new(RefCell::new(Vec::new()));
        let (c, p) = (Rc::clone(&calls), Rc::clone(&parked));
        let keyed = KeyedProvider::new(
            "type",
            |args: &Fetch| args.type_name,
            move |args: Fetch, responder: Responder<u32>| {
                c.borrow_mut().push(args.attempt);
                p.borrow_mut().push(responder);
            },
        );

        let results = Rc::new(RefCell::new(Vec::new()));
        for (type_name, attempt) in [("Order", 1), ("Order", 2), ("Line", 3)] {
            let r = Rc::clone(&results);
            keyed.call(Fetch { type_name, attempt }, move |res| {
                r.borrow_mut().push(res)
            });
        }
        // The second Order fetch attached to the first.
        assert_eq!(*calls.borrow(), vec![1, 3]);
        assert_eq!(keyed.coalescer().in_flight(), 2);

        let responders: Vec<_> = parked.borrow_mut().drain(..).collect();
        for (responder, value) in responders.into_iter().zip([10, 20]) {
            responder.succeed(value);
        }
        assert_eq!(*results.borrow(), vec![Ok(10), Ok(10), Ok(20)]);
    }

    #[test]
    fn async_call_resolves() {
        use futures::FutureExt;

        let keyed = KeyedProvider::new(
            "type",
            |n: &u8| *n,
            |n: u8, responder: Responder<u32>| responder.succeed(u32::from(n) * 2),
        );
        assert_eq!(keyed.call_async(21).now_or_never(), Some(Ok(42)));
    }

    #[test]
    fn direct_call_never_joins() {
        let parked = Rc::new(RefCell::new(Vec::new()));
        let p = Rc::clone(&parked);
        let keyed = KeyedProvider::new(
            "query",
            |_: &u8| (),
            move |_: u8, responder: Responder<u32>| p.borrow_mut().push(responder),
        );
        keyed.call(1, |_| {});
        keyed.call_direct(2, |_| {});
        assert_eq!(parked.borrow().len(), 2);
        assert_eq!(keyed.coalescer().in_flight(), 1);
    }
}

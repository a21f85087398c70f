#![forbid(unsafe_code)]

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::Hash;
use std::rc::Rc;

use futures::FutureExt;
use futures::channel::oneshot;
use futures::future::LocalBoxFuture;
use tracing::debug;

use crate::error::ProviderError;
use crate::provider::Responder;
use crate::scheduler::Scheduler;
use crate::signal::{Dispatch, Signal, Token};

/// Per-key results, in the order the caller asked for the keys.
pub type KeyedResults<K, V> = Vec<(K, Result<V, ProviderError>)>;

type FlightResult<K, V> = Result<HashMap<K, V>, ProviderError>;
type FlightWaiter<K, V> = Box<dyn FnOnce(&FlightResult<K, V>)>;
type Collected<K, V> = Rc<RefCell<HashMap<K, Result<V, ProviderError>>>>;

/// How a partitioned call was split.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition<K> {
    /// Keys sent to the provider in a new flight.
    pub fresh: Vec<K>,
    /// Keys served by flights that were already outstanding.
    pub joined: Vec<K>,
}

impl<K> Partition<K> {
    /// True when no new flight was needed.
    #[must_use]
    pub fn fully_joined(&self) -> bool {
        self.fresh.is_empty()
    }
}

struct FlightTable<K, V> {
    next_flight: u64,
    by_key: HashMap<K, u64>,
    waiters: HashMap<u64, Vec<FlightWaiter<K, V>>>,
}

/// Coalescer for calls whose key is a set of sub-keys.
///
/// Sub-keys already covered by an outstanding flight re-attach to it; the
/// remaining sub-keys go out together in one new flight. The caller's callback
/// runs once every flight it depends on has delivered, through a [`Signal`]
/// fan-in.
pub struct PartitionedCoalescer<K, V> {
    label: Rc<str>,
    table: Rc<RefCell<FlightTable<K, V>>>,
    scheduler: Scheduler,
}

impl<K, V> Clone for PartitionedCoalescer<K, V> {
    fn clone(&self) -> Self {
        Self {
            label: Rc::clone(&self.label),
            table: Rc::clone(&self.table),
            scheduler: self.scheduler.clone(),
        }
    }
}

impl<K, V> PartitionedCoalescer<K, V>
where
    K: Eq + Hash + Clone + fmt::Display + fmt::Debug + 'static,
    V: Clone + 'static,
{
    #[must_use]
    pub fn new(label: &str, scheduler: &Scheduler) -> Self {
        Self {
            label: Rc::from(label),
            table: Rc::new(RefCell::new(FlightTable {
                next_flight: 0,
                by_key: HashMap::new(),
                waiters: HashMap::new(),
            })),
            scheduler: scheduler.clone(),
        }
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Fetch `keys`, starting a flight only for those not already in flight.
    ///
    /// `start` receives the fresh keys and is not called when every key
    /// joined an existing flight. `callback` receives one entry per requested
    /// key, in request order. A key missing from a successful response gets
    /// [`ProviderError::MissingResult`]; a failed flight fails only the keys
    /// it carried.
    pub fn call(
        &self,
        keys: Vec<K>,
        start: impl FnOnce(Vec<K>, Responder<HashMap<K, V>>),
        callback: impl FnOnce(KeyedResults<K, V>) + 'static,
    ) -> Partition<K> {
        let fan_in = Signal::new(format!("{} partition", self.label), &self.scheduler);
        let collected: Collected<K, V> = Rc::new(RefCell::new(HashMap::new()));

        let (partition, fresh_flight) = {
            let mut table = self.table.borrow_mut();
            let mut seen = HashSet::new();
            let mut fresh = Vec::new();
            let mut joined = Vec::new();
            let mut by_flight: Vec<(u64, Vec<K>)> = Vec::new();
            for key in &keys {
                if !seen.insert(key.clone()) {
                    continue;
                }
                match table.by_key.get(key) {
                    Some(&flight) => {
                        joined.push(key.clone());
                        match by_flight.iter_mut().find(|(f, _)| *f == flight) {
                            Some((_, group)) => group.push(key.clone()),
                            None => by_flight.push((flight, vec![key.clone()])),
                        }
                    }
                    None => fresh.push(key.clone()),
                }
            }

            for (flight, group) in by_flight {
                let waiter = self.collector(group, Rc::clone(&collected), fan_in.pending());
                table.waiters.entry(flight).or_default().push(waiter);
            }

            let fresh_flight = if fresh.is_empty() {
                None
            } else {
                table.next_flight += 1;
                let flight = table.next_flight;
                for key in &fresh {
                    table.by_key.insert(key.clone(), flight);
                }
                let waiter = self.collector(fresh.clone(), Rc::clone(&collected), fan_in.pending());
                table.waiters.insert(flight, vec![waiter]);
                Some(flight)
            };
            (Partition { fresh, joined }, fresh_flight)
        };

        debug!(
            coalescer = %self.label,
            fresh = partition.fresh.len(),
            joined = partition.joined.len(),
            "partitioned request"
        );

        let provider = self.label.to_string();
        fan_in.wait_for_all(Dispatch::Now, move || {
            let collected = collected.borrow();
            let results = keys
                .into_iter()
                .map(|key| {
                    let result = collected.get(&key).cloned().unwrap_or_else(|| {
                        Err(ProviderError::MissingResult {
                            provider: provider.clone(),
                            key: key.to_string(),
                        })
                    });
                    (key, result)
                })
                .collect();
            drop(collected);
            callback(results);
        });

        if let Some(flight) = fresh_flight {
            let table = Rc::clone(&self.table);
            let responder = Responder::new(&*self.label, move |result: FlightResult<K, V>| {
                let waiters = {
                    let mut table = table.borrow_mut();
                    table.by_key.retain(|_, f| *f != flight);
                    table.waiters.remove(&flight).unwrap_or_default()
                };
                for waiter in waiters {
                    waiter(&result);
                }
            });
            start(partition.fresh.clone(), responder);
        }
        partition
    }

    /// Future flavor of [`PartitionedCoalescer::call`].
    pub fn call_async(
        &self,
        keys: Vec<K>,
        start: impl FnOnce(Vec<K>, Responder<HashMap<K, V>>),
    ) -> LocalBoxFuture<'static, KeyedResults<K, V>> {
        let (tx, rx) = oneshot::channel();
        let provider = self.label.to_string();
        let requested = keys.clone();
        self.call(keys, start, move |results| {
            let _ = tx.send(results);
        });
        async move {
            rx.await.unwrap_or_else(|_| {
                requested
                    .into_iter()
                    .map(|key| {
                        let err = ProviderError::Abandoned {
                            provider: provider.clone(),
                        };
                        (key, Err(err))
                    })
                    .collect()
            })
        }
        .boxed_local()
    }

    /// Number of keys covered by outstanding flights.
    #[must_use]
    pub fn in_flight_keys(&self) -> usize {
        self.table.borrow().by_key.len()
    }

    /// Number of outstanding flights.
    #[must_use]
    pub fn flights(&self) -> usize {
        self.table.borrow().waiters.len()
    }

    #[must_use]
    pub fn is_in_flight(&self, key: &K) -> bool {
        self.table.borrow().by_key.contains_key(key)
    }

    /// Waiter that copies the results for `keys` out of a flight result.
    fn collector(
        &self,
        keys: Vec<K>,
        collected: Collected<K, V>,
        token: Token,
    ) -> FlightWaiter<K, V> {
        let provider = self.label.to_string();
        Box::new(move |outcome: &FlightResult<K, V>| {
            {
                let mut collected = collected.borrow_mut();
                for key in keys {
                    let result = match outcome {
                        Ok(values) => values.get(&key).cloned().ok_or_else(|| {
                            ProviderError::MissingResult {
                                provider: provider.clone(),
                                key: key.to_string(),
                            }
                        }),
                        Err(err) => Err(err.clone()),
                    };
                    collected.insert(key, result);
                }
            }
            token.release();
        })
    }
}

impl<K, V> fmt::Debug for PartitionedCoalescer<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let table = self.table.borrow();
        f.debug_struct("PartitionedCoalescer")
            .field("label", &self.label)
            .field("flights", &table.waiters.len())
            .field("keys", &table.by_key.len())
            .finish()
    }
}

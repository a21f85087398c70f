#![forbid(unsafe_code)]

//! Asynchronous coordination for Tandem.
//!
//! - [`Scheduler`]: the "next tick" queue, pumped by the host event loop.
//! - [`Signal`]: fan-in completion barrier handing out release tokens.
//! - [`Batches`]: stack of nested work scopes with suspend, resume and
//!   transfer.
//! - [`Coalescer`], [`KeyedProvider`], [`PartitionedCoalescer`]: at most one
//!   provider round trip per key in flight.
//! - [`provider`]: the provider traits and the one-shot [`Responder`].
//! - [`Session`]: owns all of the above plus the change log, id translator
//!   and entity registry for one client session.
//!
//! # Architecture
//!
//! Everything is single-threaded. Shared state lives in `Rc<RefCell<..>>`,
//! so the types are `!Send`; concurrency means interleaved callbacks driven
//! by an external event loop. No internal borrow is held while user
//! callbacks run, so callbacks may freely re-enter the runtime.
//!
//! Callback registration is the primitive; `idle()` and the `*_async`
//! methods expose the same completions as futures.

pub mod batch;
pub mod coalesce;
pub mod config;
pub mod error;
pub mod provider;
pub mod scheduler;
pub mod session;
pub mod signal;

#[cfg(test)]
mod test_support;

pub use batch::{BatchId, BatchInfo, BatchState, Batches, SuspendedBatch};
pub use coalesce::{
    CallOutcome, Coalescer, Completion, KeyedProvider, KeyedResults, Partition,
    PartitionedCoalescer,
};
pub use config::SessionConfig;
pub use error::{BatchError, ConfigError, ProviderError, ProviderKind, ResolveError};
pub use provider::{Providers, Responder, SyncResponse};
pub use scheduler::Scheduler;
pub use session::Session;
pub use signal::{Dispatch, ResolvingToken, Signal, SignalIdle, Token};

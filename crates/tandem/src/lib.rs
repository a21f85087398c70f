#![forbid(unsafe_code)]

//! Tandem: client-side change tracking and provider coordination.
//!
//! This crate re-exports the public surface of the workspace crates:
//!
//! - [`model`]: change records, the change log, id translation and the
//!   entity registry.
//! - [`runtime`]: signals, batches, request coalescing and [`Session`].
//!
//! Most applications only need the [`prelude`].
//!
//! # Example
//!
//! ```
//! use tandem::prelude::*;
//!
//! let providers = Providers::new().with_save(|request: SaveRequest, responder: Responder<SyncResponse>| {
//!     assert_eq!(request.changes.len(), 1);
//!     responder.succeed(SyncResponse::default());
//! });
//! let session = Session::new(SessionConfig::default(), providers).unwrap();
//! let order = session.new_instance("Order");
//! assert!(order.is_new());
//!
//! session.save(None, |result| assert!(result.is_ok()));
//! assert!(session.pending_changes().is_empty());
//! ```

pub use tandem_model as model;
pub use tandem_runtime as runtime;

pub use tandem_model::{
    ChangeKind, ChangeLog, ChangeRecord, IdChange, IdPolicy, IdTranslator, InstanceRef, ObjectId,
    TypeName,
};
pub use tandem_runtime::{
    BatchError, BatchId, Batches, ConfigError, Dispatch, ProviderError, Providers, Responder,
    Scheduler, Session, SessionConfig, Signal, SyncResponse, Token,
};

/// Everything needed to wire providers into a session and drive it.
pub mod prelude {
    pub use tandem_model::{
        ChangeKind, ChangeRecord, IdChange, InstanceRef, ObjectId, Resolution, TypeName,
    };
    pub use tandem_runtime::provider::{
        EventRequest, ListRequest, ObjectRequest, ObjectResponse, QueryRequest, RoundtripRequest,
        SaveRequest, TypeRequest,
    };
    pub use tandem_runtime::{
        BatchId, Batches, Dispatch, ProviderError, Providers, Responder, Session, SessionConfig,
        Signal, SyncResponse,
    };
}

#![forbid(unsafe_code)]

//! Change tracking and identity reconciliation for Tandem.
//!
//! - [`ChangeLog`]: ordered record of local mutations, with adjacent list
//!   additions (or removals) on the same property merged into one record.
//! - [`IdTranslator`]: bidirectional map between client-minted temporary ids
//!   and the ids the server assigns when a save completes.
//! - [`EntityRegistry`]: which entities are materialized locally, and which
//!   are ghosts waiting to be loaded.
//! - [`IdPolicy`]: the rule deciding which ids are client-minted.
//!
//! Everything here is plain data. Scheduling, batching, and provider calls
//! live in `tandem-runtime`.

pub mod change;
pub mod changelog;
pub mod error;
pub mod ids;
pub mod registry;
pub mod translator;

pub use change::{ChangeKind, ChangeRecord, IdChange};
pub use changelog::ChangeLog;
pub use error::TranslateError;
pub use ids::{
    DEFAULT_TEMP_ID_PREFIX, IdPolicy, InstanceRef, ObjectId, Origin, TempIdGenerator, TypeName,
};
pub use registry::{EntityRegistry, EntityState, Resolution};
pub use translator::IdTranslator;

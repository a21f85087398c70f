#![forbid(unsafe_code)]

//! Error types for the runtime.
//!
//! | Type | Raised by | Meaning |
//! |------|-----------|---------|
//! | [`BatchError`] | [`Batches`](crate::Batches) | Structural misuse of the batch stack |
//! | [`ProviderError`] | providers, coalescers | A round trip failed; delivered to callbacks |
//! | [`ConfigError`] | [`SessionConfig`](crate::SessionConfig) | Configuration could not be loaded |
//! | [`ResolveError`] | token resolvers | Failure inside a `pending_with` callback |
//!
//! Batch errors indicate a defect in the calling code and are returned from
//! the offending call. Provider errors never unwind into unrelated call
//! stacks; they only reach the callback of the operation that issued the
//! request (and every waiter coalesced onto it).

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::batch::BatchId;

/// Error returned by a token's `on_resolve` callback.
pub type ResolveError = Box<dyn std::error::Error>;

/// Structural misuse of the batch stack.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BatchError {
    /// The batch was never started, or has already ended.
    #[error("{0} is not open")]
    NotOpen(BatchId),

    /// An active batch can only end once every batch stacked above it has
    /// ended or been suspended.
    #[error("cannot end {batch}: {innermost} is still active above it")]
    NotInnermost { batch: BatchId, innermost: BatchId },

    /// Only a suspended batch can be resumed.
    #[error("{0} is not suspended")]
    NotSuspended(BatchId),

    /// The batch enclosing `batch` at suspension time must be resumed first.
    #[error("cannot resume {batch} before {blocked_by}")]
    ResumeOutOfOrder { batch: BatchId, blocked_by: BatchId },
}

/// Which collaborator a provider call went to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    Type,
    Object,
    List,
    Query,
    Save,
    Roundtrip,
    Event,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Type => "type",
            Self::Object => "object",
            Self::List => "list",
            Self::Query => "query",
            Self::Save => "save",
            Self::Roundtrip => "roundtrip",
            Self::Event => "event",
        })
    }
}

/// A provider round trip failed.
///
/// `Clone` so one failure can be fanned out to every coalesced waiter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("{provider} provider failed: {message}")]
    Failed { provider: String, message: String },

    #[error("{provider} provider dropped its responder without answering")]
    Abandoned { provider: String },

    #[error("{provider} provider returned no result for {key}")]
    MissingResult { provider: String, key: String },

    #[error("no {0} provider is configured")]
    NotConfigured(ProviderKind),

    #[error("{provider} response rejected: {message}")]
    Rejected { provider: String, message: String },
}

/// Configuration could not be loaded or is invalid.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid JSON config: {0}")]
    Json(#[from] serde_json::Error),

    #[cfg(feature = "policy-config")]
    #[error("invalid TOML config: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("unsupported config format: {0}")]
    UnsupportedFormat(PathBuf),

    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: &'static str, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_error_display() {
        let err = BatchError::NotInnermost {
            batch: BatchId::from_raw(1),
            innermost: BatchId::from_raw(2),
        };
        assert_eq!(
            err.to_string(),
            "cannot end batch#1: batch#2 is still active above it"
        );
        assert_eq!(
            BatchError::NotOpen(BatchId::from_raw(7)).to_string(),
            "batch#7 is not open"
        );
    }

    #[test]
    fn provider_error_display() {
        let err = ProviderError::Failed {
            provider: "object".into(),
            message: "timeout".into(),
        };
        assert_eq!(err.to_string(), "object provider failed: timeout");
        assert_eq!(
            ProviderError::NotConfigured(ProviderKind::Save).to_string(),
            "no save provider is configured"
        );
    }

    #[test]
    fn json_error_converts() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: ConfigError = json_err.into();
        assert!(matches!(err, ConfigError::Json(_)));
    }
}

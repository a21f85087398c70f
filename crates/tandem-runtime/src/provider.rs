#![forbid(unsafe_code)]

//! Provider boundary: the collaborators that talk to the remote store.
//!
//! Every provider is invoked as `call(request, responder)` and must answer
//! through the [`Responder`] exactly once. The responder is consumed by
//! [`Responder::succeed`] or [`Responder::fail`], so answering twice does not
//! compile; dropping it unanswered delivers [`ProviderError::Abandoned`] so
//! no caller waits forever.
//!
//! Closures with the right shape implement the provider traits directly:
//!
//! ```
//! use tandem_runtime::provider::{Providers, Responder, TypeRequest};
//! use serde_json::{Value, json};
//!
//! let providers = Providers::new().with_type(|req: TypeRequest, res: Responder<Value>| {
//!     res.succeed(json!({ "name": req.type_name.as_str() }));
//! });
//! assert!(providers.is_configured(tandem_runtime::ProviderKind::Type));
//! ```

use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tandem_model::{ChangeRecord, IdChange, InstanceRef, ObjectId, TypeName};
use tracing::warn;

use crate::error::{ProviderError, ProviderKind};

type Deliver<T> = Box<dyn FnOnce(Result<T, ProviderError>)>;

/// One-shot completion handle passed to a provider.
#[must_use = "a provider must answer through its responder"]
pub struct Responder<T> {
    provider: String,
    deliver: Option<Deliver<T>>,
}

impl<T: 'static> Responder<T> {
    pub fn new(
        provider: impl Into<String>,
        deliver: impl FnOnce(Result<T, ProviderError>) + 'static,
    ) -> Self {
        Self {
            provider: provider.into(),
            deliver: Some(Box::new(deliver)),
        }
    }

    #[must_use]
    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn succeed(self, value: T) {
        self.respond(Ok(value));
    }

    pub fn fail(self, message: impl Into<String>) {
        let error = ProviderError::Failed {
            provider: self.provider.clone(),
            message: message.into(),
        };
        self.respond(Err(error));
    }

    pub fn respond(mut self, result: Result<T, ProviderError>) {
        if let Some(deliver) = self.deliver.take() {
            deliver(result);
        }
    }

    /// Adapt this responder to accept a `U`, converted with `f` on success.
    pub fn map<U: 'static>(mut self, f: impl FnOnce(U) -> T + 'static) -> Responder<U> {
        let provider = std::mem::take(&mut self.provider);
        let deliver = self.deliver.take().map(|deliver| -> Deliver<U> {
            Box::new(move |result: Result<U, ProviderError>| deliver(result.map(f)))
        });
        Responder { provider, deliver }
    }
}

impl<T> Drop for Responder<T> {
    fn drop(&mut self) {
        if let Some(deliver) = self.deliver.take() {
            warn!(provider = %self.provider, "responder dropped without answering");
            deliver(Err(ProviderError::Abandoned {
                provider: std::mem::take(&mut self.provider),
            }));
        }
    }
}

impl<T> fmt::Debug for Responder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Responder")
            .field("provider", &self.provider)
            .field("answered", &self.deliver.is_none())
            .finish()
    }
}

/// Metadata request for one entity type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeRequest {
    pub type_name: TypeName,
}

/// Load a set of entities of one type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectRequest {
    pub type_name: TypeName,
    pub ids: Vec<ObjectId>,
    /// Property paths to include alongside each entity.
    pub paths: Vec<String>,
}

/// Load the items of a lazily loaded list property.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListRequest {
    pub owner: InstanceRef,
    pub property: String,
}

/// Run a named query against one entity type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    pub type_name: TypeName,
    pub filter: Option<String>,
    pub paths: Vec<String>,
}

/// Push pending changes to the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveRequest {
    pub root: Option<InstanceRef>,
    pub changes: Vec<ChangeRecord>,
}

/// Send pending changes and pull the server's changes in one trip, without
/// committing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundtripRequest {
    pub root: Option<InstanceRef>,
    pub changes: Vec<ChangeRecord>,
}

/// Raise a named server-side event on an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRequest {
    pub root: InstanceRef,
    pub name: String,
    pub payload: Value,
    pub changes: Vec<ChangeRecord>,
}

/// What the store reports back after save, roundtrip and event calls.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncResponse {
    /// Temporary ids the store replaced with permanent ones.
    pub id_changes: Vec<IdChange>,
    /// Changes made on the server that the client should apply.
    pub changes: Vec<ChangeRecord>,
}

/// Entities returned by an object provider, keyed by id.
pub type ObjectResponse = HashMap<ObjectId, Value>;

macro_rules! provider_trait {
    ($(#[$meta:meta])* $name:ident, $request:ty => $response:ty) => {
        $(#[$meta])*
        pub trait $name {
            fn call(&self, request: $request, responder: Responder<$response>);
        }

        impl<F> $name for F
        where
            F: Fn($request, Responder<$response>),
        {
            fn call(&self, request: $request, responder: Responder<$response>) {
                self(request, responder)
            }
        }
    };
}

provider_trait!(
    /// Loads type metadata.
    TypeProvider, TypeRequest => Value
);
provider_trait!(
    /// Loads entities by id.
    ObjectProvider, ObjectRequest => ObjectResponse
);
provider_trait!(
    /// Loads list property contents.
    ListProvider, ListRequest => Value
);
provider_trait!(
    /// Runs queries.
    QueryProvider, QueryRequest => Value
);
provider_trait!(
    /// Persists changes.
    SaveProvider, SaveRequest => SyncResponse
);
provider_trait!(
    /// Exchanges changes without committing.
    RoundtripProvider, RoundtripRequest => SyncResponse
);
provider_trait!(
    /// Raises server events.
    EventProvider, EventRequest => SyncResponse
);

/// The set of providers a session talks to. Any of them may be absent.
#[derive(Clone, Default)]
pub struct Providers {
    pub(crate) type_provider: Option<Rc<dyn TypeProvider>>,
    pub(crate) object: Option<Rc<dyn ObjectProvider>>,
    pub(crate) list: Option<Rc<dyn ListProvider>>,
    pub(crate) query: Option<Rc<dyn QueryProvider>>,
    pub(crate) save: Option<Rc<dyn SaveProvider>>,
    pub(crate) roundtrip: Option<Rc<dyn RoundtripProvider>>,
    pub(crate) event: Option<Rc<dyn EventProvider>>,
}

impl Providers {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_type(mut self, provider: impl TypeProvider + 'static) -> Self {
        self.type_provider = Some(Rc::new(provider));
        self
    }

    #[must_use]
    pub fn with_object(mut self, provider: impl ObjectProvider + 'static) -> Self {
        self.object = Some(Rc::new(provider));
        self
    }

    #[must_use]
    pub fn with_list(mut self, provider: impl ListProvider + 'static) -> Self {
        self.list = Some(Rc::new(provider));
        self
    }

    #[must_use]
    pub fn with_query(mut self, provider: impl QueryProvider + 'static) -> Self {
        self.query = Some(Rc::new(provider));
        self
    }

    #[must_use]
    pub fn with_save(mut self, provider: impl SaveProvider + 'static) -> Self {
        self.save = Some(Rc::new(provider));
        self
    }

    #[must_use]
    pub fn with_roundtrip(mut self, provider: impl RoundtripProvider + 'static) -> Self {
        self.roundtrip = Some(Rc::new(provider));
        self
    }

    #[must_use]
    pub fn with_event(mut self, provider: impl EventProvider + 'static) -> Self {
        self.event = Some(Rc::new(provider));
        self
    }

    #[must_use]
    pub fn is_configured(&self, kind: ProviderKind) -> bool {
        match kind {
            ProviderKind::Type => self.type_provider.is_some(),
            ProviderKind::Object => self.object.is_some(),
            ProviderKind::List => self.list.is_some(),
            ProviderKind::Query => self.query.is_some(),
            ProviderKind::Save => self.save.is_some(),
            ProviderKind::Roundtrip => self.roundtrip.is_some(),
            ProviderKind::Event => self.event.is_some(),
        }
    }
}

impl fmt::Debug for Providers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const KINDS: [ProviderKind; 7] = [
            ProviderKind::Type,
            ProviderKind::Object,
            ProviderKind::List,
            ProviderKind::Query,
            ProviderKind::Save,
            ProviderKind::Roundtrip,
            ProviderKind::Event,
        ];
        let configured: Vec<String> = KINDS
            .iter()
            .filter(|kind| self.is_configured(**kind))
            .map(ToString::to_string)
            .collect();
        f.debug_struct("Providers")
            .field("configured", &configured)
            .finish()
    }
}

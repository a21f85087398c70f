#![forbid(unsafe_code)]

//! The coordinator for one client session.
//!
//! A [`Session`] owns everything that would otherwise be process-wide state:
//! the scheduler, the batch stack, the coalescer flight tables, the change
//! log, the id translator and the entity registry. Independent sessions in
//! one process never observe each other.
//!
//! # Provider round trips
//!
//! Every provider call goes through the same wrapper:
//!
//! 1. The current batch is suspended, so unrelated work started while the
//!    request is outstanding does not nest under it.
//! 2. A token is held on the suspended batch's signal, so that batch reports
//!    pending work until the response arrives.
//! 3. In the continuation the batch is resumed, the caller's callback runs,
//!    and the token is released. If the resume is blocked by an enclosing
//!    batch that is still suspended, all three wait for it.
//!
//! Type, list and query requests are coalesced by request key; object loads
//! are coalesced per entity. Save, roundtrip and event calls carry mutations
//! and are never coalesced.
//!
//! # Failure Modes
//!
//! | Failure | Behavior |
//! |---------|----------|
//! | Provider not configured | Callback gets [`ProviderError::NotConfigured`] immediately |
//! | Provider fails or abandons its responder | Callback gets the error; the batch still resumes |
//! | Save reports a conflicting id change | Callback gets [`ProviderError::Rejected`]; nothing is committed |
//! | Batch ended while its request was outstanding | Resume is skipped (traced) |
//! | Answer arrives while an enclosing batch is still suspended | Resume and callback are parked until that batch is resumed or ended, then run on the next tick |

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};
use std::time::Duration;

use futures::FutureExt;
use futures::channel::oneshot;
use futures::future::LocalBoxFuture;
use serde_json::Value;
use tandem_model::{
    ChangeLog, ChangeRecord, EntityRegistry, IdPolicy, IdTranslator, InstanceRef, ObjectId,
    Resolution, TempIdGenerator, TypeName,
};
use tracing::{debug, debug_span, trace, warn};

use crate::batch::{BatchId, Batches};
use crate::coalesce::{KeyedProvider, KeyedResults, PartitionedCoalescer};
use crate::config::SessionConfig;
use crate::error::{BatchError, ConfigError, ProviderError, ProviderKind};
use crate::provider::{
    EventRequest, ListRequest, ObjectRequest, ObjectResponse, Providers, QueryRequest, Responder,
    RoundtripRequest, SaveRequest, SyncResponse, TypeRequest,
};
use crate::scheduler::Scheduler;

type Continuation<R> = Box<dyn FnOnce(R)>;

struct SessionInner {
    config: SessionConfig,
    policy: IdPolicy,
    scheduler: Scheduler,
    batches: Batches,
    providers: Providers,
    log: RefCell<ChangeLog>,
    translator: RefCell<IdTranslator>,
    registry: RefCell<EntityRegistry>,
    temp_ids: RefCell<TempIdGenerator>,
    types: Option<KeyedProvider<TypeRequest, TypeName, Value>>,
    lists: Option<KeyedProvider<ListRequest, ListRequest, Value>>,
    queries: Option<KeyedProvider<QueryRequest, QueryRequest, Value>>,
    objects: PartitionedCoalescer<InstanceRef, Value>,
}

impl SessionInner {
    /// Register the id changes reported by the store.
    fn register_translations(
        &self,
        provider: ProviderKind,
        response: &SyncResponse,
    ) -> Result<(), ProviderError> {
        self.translator
            .borrow_mut()
            .apply(&response.id_changes)
            .map_err(|err| ProviderError::Rejected {
                provider: provider.to_string(),
                message: err.to_string(),
            })?;
        let mut registry = self.registry.borrow_mut();
        for change in &response.id_changes {
            registry.mark_loaded(&change.type_name, &change.old_id);
        }
        Ok(())
    }
}

/// One client session. Clones share the same session.
#[derive(Clone)]
pub struct Session {
    inner: Rc<SessionInner>,
}

impl Session {
    /// Create a session talking to `providers`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] when `config` fails validation.
    pub fn new(config: SessionConfig, providers: Providers) -> Result<Self, ConfigError> {
        config.validate()?;
        let policy = config.id_policy();
        let scheduler = Scheduler::new();

        let types = providers.type_provider.clone().map(|provider| {
            KeyedProvider::new(
                "type",
                |request: &TypeRequest| request.type_name.clone(),
                move |request, responder| provider.call(request, responder),
            )
        });
        let lists = providers.list.clone().map(|provider| {
            KeyedProvider::new(
                "list",
                |request: &ListRequest| request.clone(),
                move |request, responder| provider.call(request, responder),
            )
        });
        let queries = providers.query.clone().map(|provider| {
            KeyedProvider::new(
                "query",
                |request: &QueryRequest| request.clone(),
                move |request, responder| provider.call(request, responder),
            )
        });

        debug!(?config, ?providers, "session created");
        Ok(Self {
            inner: Rc::new(SessionInner {
                batches: Batches::new(&scheduler),
                objects: PartitionedCoalescer::new("object", &scheduler),
                log: RefCell::new(ChangeLog::new(policy.clone())),
                translator: RefCell::new(IdTranslator::new()),
                registry: RefCell::new(EntityRegistry::new()),
                temp_ids: RefCell::new(TempIdGenerator::new(policy.clone())),
                config,
                policy,
                scheduler,
                providers,
                types,
                lists,
                queries,
            }),
        })
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn policy(&self) -> &IdPolicy {
        &self.inner.policy
    }

    #[must_use]
    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    #[must_use]
    pub fn batches(&self) -> &Batches {
        &self.inner.batches
    }

    /// Run deferred callbacks until none are left.
    pub fn run_until_idle(&self) -> usize {
        self.inner.scheduler.run_until_idle()
    }

    /// Force-complete batches older than the configured
    /// `force_complete_after_ms`. Does nothing when that is unset.
    pub fn force_complete_stale(&self) -> Vec<BatchId> {
        match self.inner.config.force_complete_after() {
            Some(max_age) => self.force_complete_older_than(max_age),
            None => Vec::new(),
        }
    }

    pub fn force_complete_older_than(&self, max_age: Duration) -> Vec<BatchId> {
        self.inner.batches.force_complete_stale(max_age)
    }

    // ---- identity and change recording ----

    /// Reference to an entity under this session's id policy.
    pub fn instance(&self, type_name: impl Into<TypeName>, id: impl Into<ObjectId>) -> InstanceRef {
        self.inner.policy.instance(type_name, id)
    }

    /// Mint a temporary id for a new entity, register it as loaded, and
    /// record its creation.
    pub fn new_instance(&self, type_name: impl Into<TypeName>) -> InstanceRef {
        let type_name = type_name.into();
        let id = self.inner.temp_ids.borrow_mut().next_id();
        self.inner.registry.borrow_mut().mark_loaded(&type_name, &id);
        let instance = self.inner.policy.instance(type_name, id);
        self.inner.log.borrow_mut().init_new(instance.clone());
        instance
    }

    /// Mutate the change log.
    pub fn record<R>(&self, f: impl FnOnce(&mut ChangeLog) -> R) -> R {
        f(&mut self.inner.log.borrow_mut())
    }

    /// Copy of every recorded change.
    #[must_use]
    pub fn changes(&self) -> Vec<ChangeRecord> {
        self.inner.log.borrow().build()
    }

    /// Changes recorded since the last commit.
    #[must_use]
    pub fn pending_changes(&self) -> Vec<ChangeRecord> {
        self.inner.log.borrow().since_last_commit().to_vec()
    }

    /// Changes since the last commit as the store should see them: every
    /// entity reference carries its server id once one is known.
    #[must_use]
    pub fn outbound_changes(&self) -> Vec<ChangeRecord> {
        let translator = self.inner.translator.borrow();
        self.inner
            .log
            .borrow()
            .since_last_commit()
            .iter()
            .map(|record| record.translated(&translator, &self.inner.policy))
            .collect()
    }

    /// Server id for a client id (or the input when untranslated).
    #[must_use]
    pub fn forward(&self, type_name: &str, client_id: &str) -> ObjectId {
        self.inner.translator.borrow().forward(type_name, client_id)
    }

    /// Client id for a server id (or the input when untranslated).
    #[must_use]
    pub fn reverse(&self, type_name: &str, server_id: &str) -> ObjectId {
        self.inner.translator.borrow().reverse(type_name, server_id)
    }

    /// Resolve a reference from an incoming payload, creating a ghost when
    /// the entity is unknown.
    pub fn resolve_reference(&self, type_name: impl Into<TypeName>, id: impl Into<ObjectId>) -> Resolution {
        let (type_name, id) = (type_name.into(), id.into());
        let translator = self.inner.translator.borrow();
        self.inner
            .registry
            .borrow_mut()
            .resolve_reference(&translator, &self.inner.policy, &type_name, &id)
    }

    #[must_use]
    pub fn ghosts_of(&self, type_name: &str) -> Vec<ObjectId> {
        self.inner.registry.borrow().ghosts_of(type_name)
    }

    #[must_use]
    pub fn is_loaded(&self, type_name: &str, id: &str) -> bool {
        self.inner.registry.borrow().state(type_name, id) == Some(tandem_model::EntityState::Loaded)
    }

    // ---- provider operations ----

    /// Load metadata for `type_name`.
    pub fn fetch_type(
        &self,
        type_name: impl Into<TypeName>,
        callback: impl FnOnce(Result<Value, ProviderError>) + 'static,
    ) {
        let Some(keyed) = self.inner.types.clone() else {
            callback(Err(ProviderError::NotConfigured(ProviderKind::Type)));
            return;
        };
        let request = TypeRequest {
            type_name: type_name.into(),
        };
        let label = request.type_name.to_string();
        let coalesce = self.inner.config.coalesce;
        self.around_provider(
            ProviderKind::Type,
            &label,
            move |done| dispatch_keyed(&keyed, coalesce, request, done),
            callback,
        );
    }

    pub fn fetch_type_async(
        &self,
        type_name: impl Into<TypeName>,
    ) -> LocalBoxFuture<'static, Result<Value, ProviderError>> {
        let type_name = type_name.into();
        into_future(ProviderKind::Type, |done| self.fetch_type(type_name, done))
    }

    /// Load the contents of a list property.
    pub fn fetch_list(
        &self,
        owner: InstanceRef,
        property: impl Into<String>,
        callback: impl FnOnce(Result<Value, ProviderError>) + 'static,
    ) {
        let Some(keyed) = self.inner.lists.clone() else {
            callback(Err(ProviderError::NotConfigured(ProviderKind::List)));
            return;
        };
        let owner_id = self.forward(owner.type_name().as_str(), owner.id().as_str());
        let request = ListRequest {
            owner: self.inner.policy.instance(owner.type_name().clone(), owner_id),
            property: property.into(),
        };
        let label = format!("{}.{}", request.owner, request.property);
        let coalesce = self.inner.config.coalesce;
        self.around_provider(
            ProviderKind::List,
            &label,
            move |done| dispatch_keyed(&keyed, coalesce, request, done),
            callback,
        );
    }

    pub fn query(
        &self,
        request: QueryRequest,
        callback: impl FnOnce(Result<Value, ProviderError>) + 'static,
    ) {
        let Some(keyed) = self.inner.queries.clone() else {
            callback(Err(ProviderError::NotConfigured(ProviderKind::Query)));
            return;
        };
        let label = request.type_name.to_string();
        let coalesce = self.inner.config.coalesce;
        self.around_provider(
            ProviderKind::Query,
            &label,
            move |done| dispatch_keyed(&keyed, coalesce, request, done),
            callback,
        );
    }

    pub fn query_async(&self, request: QueryRequest) -> LocalBoxFuture<'static, Result<Value, ProviderError>> {
        into_future(ProviderKind::Query, |done| self.query(request, done))
    }

    /// Load entities of one type by id.
    ///
    /// Ids of entities that are already being loaded attach to the
    /// outstanding request. Client ids of saved entities are sent as their
    /// server ids. Results come back in `ids` order, and every entity that
    /// loaded is marked as such in the registry.
    pub fn fetch_objects(
        &self,
        type_name: impl Into<TypeName>,
        ids: Vec<ObjectId>,
        paths: Vec<String>,
        callback: impl FnOnce(KeyedResults<ObjectId, Value>) + 'static,
    ) {
        let type_name = type_name.into();
        let Some(provider) = self.inner.providers.object.clone() else {
            let error = ProviderError::NotConfigured(ProviderKind::Object);
            callback(ids.into_iter().map(|id| (id, Err(error.clone()))).collect());
            return;
        };
        let policy = self.inner.policy.clone();
        let keys: Vec<InstanceRef> = {
            let translator = self.inner.translator.borrow();
            ids.iter()
                .map(|id| {
                    let server_id = translator.forward(type_name.as_str(), id.as_str());
                    policy.instance(type_name.clone(), server_id)
                })
                .collect()
        };
        let objects = self.inner.objects.clone();
        let session = Rc::downgrade(&self.inner);
        let request_type = type_name.clone();
        let label = type_name.to_string();

        self.around_provider(
            ProviderKind::Object,
            &label,
            move |done: Continuation<KeyedResults<InstanceRef, Value>>| {
                objects.call(
                    keys,
                    move |fresh: Vec<InstanceRef>, responder: Responder<_>| {
                        let request = ObjectRequest {
                            type_name: request_type.clone(),
                            ids: fresh.iter().map(|key| key.id().clone()).collect(),
                            paths,
                        };
                        let responder = responder.map(move |found: ObjectResponse| {
                            found
                                .into_iter()
                                .map(|(id, value)| (policy.instance(request_type.clone(), id), value))
                                .collect()
                        });
                        provider.call(request, responder);
                    },
                    done,
                );
            },
            move |results: KeyedResults<InstanceRef, Value>| {
                if let Some(inner) = upgrade(&session) {
                    let mut registry = inner.registry.borrow_mut();
                    for (id, (_, result)) in ids.iter().zip(&results) {
                        if result.is_ok() {
                            registry.mark_loaded(&type_name, id);
                        }
                    }
                }
                callback(
                    ids.into_iter()
                        .zip(results)
                        .map(|(id, (_, result))| (id, result))
                        .collect(),
                );
            },
        );
    }

    /// Load every ghost of `type_name`.
    pub fn load_ghosts(
        &self,
        type_name: impl Into<TypeName>,
        callback: impl FnOnce(KeyedResults<ObjectId, Value>) + 'static,
    ) {
        let type_name = type_name.into();
        let ghosts = self.ghosts_of(type_name.as_str());
        trace!(type_name = %type_name, count = ghosts.len(), "loading ghosts");
        self.fetch_objects(type_name, ghosts, Vec::new(), callback);
    }

    /// Send the changes recorded since the last commit.
    ///
    /// On success every reported id change is registered with the
    /// translator, the new entities are marked loaded, and a commit record is
    /// appended to the change log.
    pub fn save(
        &self,
        root: Option<InstanceRef>,
        callback: impl FnOnce(Result<SyncResponse, ProviderError>) + 'static,
    ) {
        let Some(provider) = self.inner.providers.save.clone() else {
            callback(Err(ProviderError::NotConfigured(ProviderKind::Save)));
            return;
        };
        let request = SaveRequest {
            root,
            changes: self.outbound_changes(),
        };
        let label = format!("{} changes", request.changes.len());
        let session = Rc::downgrade(&self.inner);
        self.around_provider(
            ProviderKind::Save,
            &label,
            move |done| provider.call(request, Responder::new("save", done)),
            move |result: Result<SyncResponse, ProviderError>| {
                let result = result.and_then(|response| {
                    if let Some(inner) = upgrade(&session) {
                        inner.register_translations(ProviderKind::Save, &response)?;
                        inner.log.borrow_mut().commit(response.id_changes.clone());
                        debug!(id_changes = response.id_changes.len(), "save committed");
                    }
                    Ok(response)
                });
                callback(result);
            },
        );
    }

    pub fn save_async(
        &self,
        root: Option<InstanceRef>,
    ) -> LocalBoxFuture<'static, Result<SyncResponse, ProviderError>> {
        into_future(ProviderKind::Save, |done| self.save(root, done))
    }

    /// Exchange pending changes with the store without committing.
    ///
    /// Id changes in the response are still registered with the translator.
    pub fn roundtrip(
        &self,
        root: Option<InstanceRef>,
        callback: impl FnOnce(Result<SyncResponse, ProviderError>) + 'static,
    ) {
        let Some(provider) = self.inner.providers.roundtrip.clone() else {
            callback(Err(ProviderError::NotConfigured(ProviderKind::Roundtrip)));
            return;
        };
        let request = RoundtripRequest {
            root,
            changes: self.outbound_changes(),
        };
        let session = Rc::downgrade(&self.inner);
        self.around_provider(
            ProviderKind::Roundtrip,
            "roundtrip",
            move |done| provider.call(request, Responder::new("roundtrip", done)),
            move |result: Result<SyncResponse, ProviderError>| {
                callback(register_response(&session, ProviderKind::Roundtrip, result));
            },
        );
    }

    /// Raise a named server event on `root`, sending pending changes along.
    pub fn raise_event(
        &self,
        root: InstanceRef,
        name: impl Into<String>,
        payload: Value,
        callback: impl FnOnce(Result<SyncResponse, ProviderError>) + 'static,
    ) {
        let Some(provider) = self.inner.providers.event.clone() else {
            callback(Err(ProviderError::NotConfigured(ProviderKind::Event)));
            return;
        };
        let request = EventRequest {
            root,
            name: name.into(),
            payload,
            changes: self.outbound_changes(),
        };
        let label = request.name.clone();
        let session = Rc::downgrade(&self.inner);
        self.around_provider(
            ProviderKind::Event,
            &label,
            move |done| provider.call(request, Responder::new("event", done)),
            move |result: Result<SyncResponse, ProviderError>| {
                callback(register_response(&session, ProviderKind::Event, result));
            },
        );
    }

    /// Suspend the current batch around a provider call.
    fn around_provider<R: 'static>(
        &self,
        kind: ProviderKind,
        label: &str,
        issue: impl FnOnce(Continuation<R>),
        callback: impl FnOnce(R) + 'static,
    ) {
        let span = debug_span!("provider", kind = %kind, label = %label);
        let _entered = span.enter();

        let batches = self.inner.batches.clone();
        let handle = batches.suspend_current(format!("{kind}: {label}"));
        let hold = handle
            .id()
            .and_then(|id| batches.signal_of(id))
            .map(|signal| signal.pending());
        trace!(suspended = ?handle.id(), "issuing provider call");

        issue(Box::new(move |result: R| {
            // Answers may arrive out of order; the callback waits until its
            // batch is back on the stack.
            batches.resume_or_park(handle, move |resumed| {
                match resumed {
                    Ok(()) => {}
                    Err(BatchError::NotOpen(id)) => {
                        trace!(batch = %id, "batch ended before the provider answered");
                    }
                    Err(err) => warn!(error = %err, "could not resume batch after provider call"),
                }
                callback(result);
                if let Some(hold) = hold {
                    hold.release();
                }
            });
        }));
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("config", &self.inner.config)
            .field("batches", &self.inner.batches)
            .field("changes", &self.inner.log.borrow().len())
            .field("translations", &self.inner.translator.borrow().len())
            .field("entities", &self.inner.registry.borrow().len())
            .finish_non_exhaustive()
    }
}

fn upgrade(session: &Weak<SessionInner>) -> Option<Rc<SessionInner>> {
    let inner = session.upgrade();
    if inner.is_none() {
        trace!("session dropped before the provider answered");
    }
    inner
}

fn register_response(
    session: &Weak<SessionInner>,
    kind: ProviderKind,
    result: Result<SyncResponse, ProviderError>,
) -> Result<SyncResponse, ProviderError> {
    let response = result?;
    if let Some(inner) = upgrade(session) {
        inner.register_translations(kind, &response)?;
    }
    Ok(response)
}

fn dispatch_keyed<A, K>(
    keyed: &KeyedProvider<A, K, Value>,
    coalesce: bool,
    request: A,
    done: Continuation<Result<Value, ProviderError>>,
) where
    A: 'static,
    K: Eq + std::hash::Hash + Clone + fmt::Debug + 'static,
{
    if coalesce {
        keyed.call(request, done);
    } else {
        keyed.call_direct(request, done);
    }
}

fn into_future<T: 'static>(
    kind: ProviderKind,
    register: impl FnOnce(Continuation<Result<T, ProviderError>>),
) -> LocalBoxFuture<'static, Result<T, ProviderError>> {
    let (tx, rx) = oneshot::channel();
    register(Box::new(move |result| {
        let _ = tx.send(result);
    }));
    async move {
        rx.await.unwrap_or_else(|_| {
            Err(ProviderError::Abandoned {
                provider: kind.to_string(),
            })
        })
    }
    .boxed_local()
}

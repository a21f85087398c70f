#![forbid(unsafe_code)]

//! Local entity registry and ghost tracking.
//!
//! Incoming payloads can reference entities the client has never loaded.
//! Rather than failing, [`EntityRegistry::resolve_reference`] materializes a
//! ghost for such an id and remembers it so it can be fetched on demand.
//!
//! # Failure Modes
//!
//! | Situation | Behavior |
//! |-----------|----------|
//! | Reference to a translated server id | Resolves to the local client id |
//! | Reference to a known entity | Resolves to it unchanged |
//! | Reference to an unknown entity | Registers a ghost |
//! | `mark_loaded` on an unknown entity | Registers it as loaded |

use std::collections::BTreeMap;

use tracing::debug;

use crate::ids::{IdPolicy, InstanceRef, ObjectId, TypeName};
use crate::translator::IdTranslator;

/// Materialization state of a locally known entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityState {
    Loaded,
    /// Placeholder awaiting a lazy load.
    Ghost,
}

/// Outcome of resolving an incoming reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// The entity is materialized locally.
    Loaded(InstanceRef),
    /// The entity is a ghost. `created` is true when this call registered it.
    Ghost { instance: InstanceRef, created: bool },
}

impl Resolution {
    #[must_use]
    pub fn instance(&self) -> &InstanceRef {
        match self {
            Self::Loaded(instance) | Self::Ghost { instance, .. } => instance,
        }
    }

    #[must_use]
    pub fn is_ghost(&self) -> bool {
        matches!(self, Self::Ghost { .. })
    }
}

/// Which `(type, id)` pairs exist locally, and in what state.
#[derive(Debug, Clone, Default)]
pub struct EntityRegistry {
    entities: BTreeMap<TypeName, BTreeMap<ObjectId, EntityState>>,
}

impl EntityRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn state(&self, type_name: &str, id: &str) -> Option<EntityState> {
        self.entities
            .get(type_name)
            .and_then(|ids| ids.get(id))
            .copied()
    }

    /// Record that the entity is fully materialized (promoting a ghost).
    pub fn mark_loaded(&mut self, type_name: &TypeName, id: &ObjectId) {
        self.entities
            .entry(type_name.clone())
            .or_default()
            .insert(id.clone(), EntityState::Loaded);
    }

    /// Resolve a reference found in an incoming payload.
    ///
    /// The id is first mapped back through `translator` so that server ids of
    /// optimistically created entities land on their local client id.
    pub fn resolve_reference(
        &mut self,
        translator: &IdTranslator,
        policy: &IdPolicy,
        type_name: &TypeName,
        id: &ObjectId,
    ) -> Resolution {
        let local = translator.resolve(type_name.as_str(), id.as_str());
        let instance = policy.instance(type_name.clone(), local.clone());
        match self.state(type_name.as_str(), local.as_str()) {
            Some(EntityState::Loaded) => Resolution::Loaded(instance),
            Some(EntityState::Ghost) => Resolution::Ghost {
                instance,
                created: false,
            },
            None if local != *id => {
                // Translated ids only exist for entities created on this client.
                self.mark_loaded(type_name, &local);
                Resolution::Loaded(instance)
            }
            None => {
                debug!(type_name = %type_name, id = %id, "registered ghost entity");
                self.entities
                    .entry(type_name.clone())
                    .or_default()
                    .insert(local, EntityState::Ghost);
                Resolution::Ghost {
                    instance,
                    created: true,
                }
            }
        }
    }

    /// Ids of every ghost of `type_name`, in id order.
    #[must_use]
    pub fn ghosts_of(&self, type_name: &str) -> Vec<ObjectId> {
        self.entities
            .get(type_name)
            .map(|ids| {
                ids.iter()
                    .filter(|(_, state)| **state == EntityState::Ghost)
                    .map(|(id, _)| id.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    #[must_use]
    pub fn ghost_count(&self) -> usize {
        self.entities
            .values()
            .flat_map(BTreeMap::values)
            .filter(|state| **state == EntityState::Ghost)
            .count()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entities.values().map(BTreeMap::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

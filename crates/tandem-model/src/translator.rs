#![forbid(unsafe_code)]

//! Bidirectional client ↔ server id translation.
//!
//! # Invariants
//!
//! 1. For every registered `(type, client, server)`, `forward(type, client)`
//!    is `server` and `reverse(type, server)` is `client`.
//! 2. Unregistered ids translate to themselves in both directions.
//! 3. Entries are never removed. Registering the same pair again is a no-op;
//!    registering a conflicting pair is rejected.

use std::collections::HashMap;

use tracing::debug;

use crate::change::IdChange;
use crate::error::{Result, TranslateError};
use crate::ids::{ObjectId, TypeName};

type IdMap = HashMap<TypeName, HashMap<ObjectId, ObjectId>>;

/// Maps client-minted ids to server-assigned ids and back, per entity type.
#[derive(Debug, Clone, Default)]
pub struct IdTranslator {
    to_server: IdMap,
    to_client: IdMap,
}

impl IdTranslator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Server id for `client_id`, or `client_id` itself when untranslated.
    #[must_use]
    pub fn forward(&self, type_name: &str, client_id: &str) -> ObjectId {
        lookup(&self.to_server, type_name, client_id)
            .cloned()
            .unwrap_or_else(|| ObjectId::from(client_id))
    }

    /// Client id for `server_id`, or `server_id` itself when untranslated.
    #[must_use]
    pub fn reverse(&self, type_name: &str, server_id: &str) -> ObjectId {
        lookup(&self.to_client, type_name, server_id)
            .cloned()
            .unwrap_or_else(|| ObjectId::from(server_id))
    }

    /// Resolve an incoming server reference to the id the entity is known by
    /// locally.
    #[must_use]
    pub fn resolve(&self, type_name: &str, server_id: &str) -> ObjectId {
        self.reverse(type_name, server_id)
    }

    /// Whether a server id has been recorded for `client_id`.
    #[must_use]
    pub fn is_translated(&self, type_name: &str, client_id: &str) -> bool {
        lookup(&self.to_server, type_name, client_id).is_some()
    }

    /// Record that `client_id` is now known to the server as `server_id`.
    ///
    /// # Errors
    ///
    /// Returns [`TranslateError`] when either id is already paired with a
    /// different partner.
    pub fn register_translation(
        &mut self,
        type_name: &TypeName,
        client_id: &ObjectId,
        server_id: &ObjectId,
    ) -> Result<()> {
        if self.check(type_name, client_id, server_id)? {
            debug!(type_name = %type_name, client = %client_id, server = %server_id, "id translated");
            self.insert(type_name, client_id, server_id);
        }
        Ok(())
    }

    /// Register every id change reported by a save.
    ///
    /// Changes are validated before any is applied, so a rejected batch leaves
    /// the translator untouched.
    ///
    /// # Errors
    ///
    /// Returns the first conflict found.
    pub fn apply(&mut self, changes: &[IdChange]) -> Result<()> {
        // Pairs from this batch, checked against each other as well as `self`.
        let mut staged = IdTranslator::new();
        for change in changes {
            let (type_name, client_id, server_id) =
                (&change.type_name, &change.old_id, &change.new_id);
            if self.check(type_name, client_id, server_id)?
                && staged.check(type_name, client_id, server_id)?
            {
                staged.insert(type_name, client_id, server_id);
            }
        }
        for (type_name, ids) in staged.to_server {
            for (client_id, server_id) in ids {
                debug!(type_name = %type_name, client = %client_id, server = %server_id, "id translated");
                self.insert(&type_name, &client_id, &server_id);
            }
        }
        Ok(())
    }

    /// `Ok(true)` when the pair is new, `Ok(false)` when already registered.
    fn check(&self, type_name: &TypeName, client_id: &ObjectId, server_id: &ObjectId) -> Result<bool> {
        if let Some(existing) = lookup(&self.to_server, type_name.as_str(), client_id.as_str()) {
            if existing == server_id {
                return Ok(false);
            }
            return Err(TranslateError::ClientAlreadyMapped {
                type_name: type_name.clone(),
                client_id: client_id.clone(),
                existing: existing.clone(),
                requested: server_id.clone(),
            });
        }
        if let Some(existing) = lookup(&self.to_client, type_name.as_str(), server_id.as_str()) {
            return Err(TranslateError::ServerAlreadyMapped {
                type_name: type_name.clone(),
                server_id: server_id.clone(),
                existing: existing.clone(),
            });
        }
        Ok(true)
    }

    fn insert(&mut self, type_name: &TypeName, client_id: &ObjectId, server_id: &ObjectId) {
        self.to_server
            .entry(type_name.clone())
            .or_default()
            .insert(client_id.clone(), server_id.clone());
        self.to_client
            .entry(type_name.clone())
            .or_default()
            .insert(server_id.clone(), client_id.clone());
    }

    /// Number of translated entities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.to_server.values().map(HashMap::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn lookup<'a>(map: &'a IdMap, type_name: &str, id: &str) -> Option<&'a ObjectId> {
    map.get(type_name).and_then(|ids| ids.get(id))
}

#![forbid(unsafe_code)]

//! Entity identifiers and the temporary-id policy.
//!
//! Identifiers are opaque strings. Whether an id was minted on the client
//! (and is therefore waiting for a server-assigned replacement) is a policy
//! decision owned by [`IdPolicy`], not a property of [`ObjectId`] itself.
//!
//! # Invariants
//!
//! 1. [`TempIdGenerator`] never hands out the same id twice for one policy.
//! 2. Every id produced by [`TempIdGenerator`] satisfies [`IdPolicy::is_new`].
//! 3. [`InstanceRef`] values are only built through [`IdPolicy::instance`],
//!    so `is_new` always agrees with the policy that built them.

use std::borrow::Borrow;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Default prefix reserved for client-minted ids (`+c1`, `+c2`, ...).
pub const DEFAULT_TEMP_ID_PREFIX: &str = "+c";

/// Name of an entity type (e.g. `"Order"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TypeName(String);

impl TypeName {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TypeName {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for TypeName {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl Borrow<str> for TypeName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TypeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque entity identifier, either client-minted or server-assigned.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(String);

impl ObjectId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ObjectId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for ObjectId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl Borrow<str> for ObjectId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which id space an identifier belongs to under a given policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Minted locally; the server has not assigned a permanent id yet.
    Client,
    /// Assumed to come from the server.
    Server,
}

/// Decides which ids are client-minted temporaries.
///
/// An id is "new" when it is the reserved prefix followed by one or more
/// ASCII digits. Every other id is assumed to be server-assigned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdPolicy {
    prefix: String,
}

impl Default for IdPolicy {
    fn default() -> Self {
        Self::with_prefix(DEFAULT_TEMP_ID_PREFIX)
    }
}

impl IdPolicy {
    #[must_use]
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Whether `id` matches the client-minted pattern.
    #[must_use]
    pub fn is_new(&self, id: &str) -> bool {
        id.strip_prefix(self.prefix.as_str())
            .is_some_and(|suffix| !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit()))
    }

    #[must_use]
    pub fn origin(&self, id: &str) -> Origin {
        if self.is_new(id) {
            Origin::Client
        } else {
            Origin::Server
        }
    }

    /// Build a reference to `(type_name, id)` with `is_new` derived from this policy.
    #[must_use]
    pub fn instance(&self, type_name: impl Into<TypeName>, id: impl Into<ObjectId>) -> InstanceRef {
        let id = id.into();
        let is_new = self.is_new(id.as_str());
        InstanceRef {
            id,
            is_new,
            type_name: type_name.into(),
        }
    }
}

/// Mints temporary ids for optimistically created entities.
#[derive(Debug, Clone)]
pub struct TempIdGenerator {
    policy: IdPolicy,
    next: u64,
}

impl TempIdGenerator {
    #[must_use]
    pub fn new(policy: IdPolicy) -> Self {
        Self { policy, next: 1 }
    }

    /// Return the next id in the sequence (`+c1`, `+c2`, ...).
    pub fn next_id(&mut self) -> ObjectId {
        let id = ObjectId(format!("{}{}", self.policy.prefix, self.next));
        self.next += 1;
        id
    }

    #[must_use]
    pub fn policy(&self) -> &IdPolicy {
        &self.policy
    }
}

/// Reference to one entity instance as it appears in change records.
///
/// Serializes as `{"id": ..., "isNew": ..., "type": ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceRef {
    id: ObjectId,
    #[serde(rename = "isNew")]
    is_new: bool,
    #[serde(rename = "type")]
    type_name: TypeName,
}

impl InstanceRef {
    #[must_use]
    pub fn id(&self) -> &ObjectId {
        &self.id
    }

    #[must_use]
    pub fn type_name(&self) -> &TypeName {
        &self.type_name
    }

    #[must_use]
    pub fn is_new(&self) -> bool {
        self.is_new
    }

    /// Same `(type, id)` pair, ignoring `is_new`.
    #[must_use]
    pub fn same_instance(&self, other: &InstanceRef) -> bool {
        self.id == other.id && self.type_name == other.type_name
    }
}

impl fmt::Display for InstanceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.type_name, self.id)
    }
}

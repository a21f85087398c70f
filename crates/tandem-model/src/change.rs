#![forbid(unsafe_code)]

//! Change records and their wire format.
//!
//! Every record serializes as a JSON object tagged with
//! `"__type": "<Kind>:#Model"`:
//!
//! ```text
//! {"__type":"ValueChange:#Model","instance":{"id":"+c1","isNew":true,"type":"Order"},
//!  "property":"Total","oldValue":null,"newValue":12.5}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{IdPolicy, InstanceRef, ObjectId, TypeName};
use crate::translator::IdTranslator;

/// One id reassignment reported by a completed save.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdChange {
    #[serde(rename = "type")]
    pub type_name: TypeName,
    pub old_id: ObjectId,
    pub new_id: ObjectId,
}

impl IdChange {
    #[must_use]
    pub fn new(
        type_name: impl Into<TypeName>,
        old_id: impl Into<ObjectId>,
        new_id: impl Into<ObjectId>,
    ) -> Self {
        Self {
            type_name: type_name.into(),
            old_id: old_id.into(),
            new_id: new_id.into(),
        }
    }
}

/// Discriminant of a [`ChangeRecord`], handy for filtering and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    InitNew,
    ValueChange,
    ReferenceChange,
    ListChange,
    Save,
}

/// A single mutation (or commit marker) in a [`ChangeLog`](crate::ChangeLog).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "__type")]
pub enum ChangeRecord {
    /// An entity was created locally.
    #[serde(rename = "InitNew:#Model")]
    InitNew { instance: InstanceRef },

    /// A scalar property changed.
    #[serde(rename = "ValueChange:#Model", rename_all = "camelCase")]
    ValueChange {
        instance: InstanceRef,
        property: String,
        old_value: Value,
        new_value: Value,
    },

    /// A single-valued reference property changed.
    #[serde(rename = "ReferenceChange:#Model", rename_all = "camelCase")]
    ReferenceChange {
        instance: InstanceRef,
        property: String,
        old_value: Option<InstanceRef>,
        new_value: Option<InstanceRef>,
    },

    /// Items were added to and/or removed from a list property.
    #[serde(rename = "ListChange:#Model")]
    ListChange {
        instance: InstanceRef,
        property: String,
        added: Vec<InstanceRef>,
        removed: Vec<InstanceRef>,
    },

    /// Commit marker appended when a save completes.
    #[serde(rename = "Save:#Model", rename_all = "camelCase")]
    Save { id_changes: Vec<IdChange> },
}

impl ChangeRecord {
    #[must_use]
    pub fn kind(&self) -> ChangeKind {
        match self {
            Self::InitNew { .. } => ChangeKind::InitNew,
            Self::ValueChange { .. } => ChangeKind::ValueChange,
            Self::ReferenceChange { .. } => ChangeKind::ReferenceChange,
            Self::ListChange { .. } => ChangeKind::ListChange,
            Self::Save { .. } => ChangeKind::Save,
        }
    }

    /// Target instance; `None` for commit markers.
    #[must_use]
    pub fn instance(&self) -> Option<&InstanceRef> {
        match self {
            Self::InitNew { instance }
            | Self::ValueChange { instance, .. }
            | Self::ReferenceChange { instance, .. }
            | Self::ListChange { instance, .. } => Some(instance),
            Self::Save { .. } => None,
        }
    }

    #[must_use]
    pub fn property(&self) -> Option<&str> {
        match self {
            Self::ValueChange { property, .. }
            | Self::ReferenceChange { property, .. }
            | Self::ListChange { property, .. } => Some(property),
            Self::InitNew { .. } | Self::Save { .. } => None,
        }
    }

    #[must_use]
    pub fn is_commit(&self) -> bool {
        matches!(self, Self::Save { .. })
    }

    /// Copy of this record with every entity reference rewritten to the id
    /// the server knows it by, `is_new` re-derived from `policy`.
    #[must_use]
    pub fn translated(&self, translator: &IdTranslator, policy: &IdPolicy) -> Self {
        let outbound = |instance: &InstanceRef| {
            let type_name = instance.type_name();
            let id = translator.forward(type_name.as_str(), instance.id().as_str());
            policy.instance(type_name.clone(), id)
        };
        match self {
            Self::InitNew { instance } => Self::InitNew {
                instance: outbound(instance),
            },
            Self::ValueChange {
                instance,
                property,
                old_value,
                new_value,
            } => Self::ValueChange {
                instance: outbound(instance),
                property: property.clone(),
                old_value: old_value.clone(),
                new_value: new_value.clone(),
            },
            Self::ReferenceChange {
                instance,
                property,
                old_value,
                new_value,
            } => Self::ReferenceChange {
                instance: outbound(instance),
                property: property.clone(),
                old_value: old_value.as_ref().map(outbound),
                new_value: new_value.as_ref().map(outbound),
            },
            Self::ListChange {
                instance,
                property,
                added,
                removed,
            } => Self::ListChange {
                instance: outbound(instance),
                property: property.clone(),
                added: added.iter().map(outbound).collect(),
                removed: removed.iter().map(outbound).collect(),
            },
            Self::Save { id_changes } => Self::Save {
                id_changes: id_changes.clone(),
            },
        }
    }
}

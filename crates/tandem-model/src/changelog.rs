#![forbid(unsafe_code)]

//! Ordered log of pending mutations.
//!
//! # Invariants
//!
//! 1. Records appear in the order the mutations were applied.
//! 2. Appending never reorders existing records. The only in-place edit is the
//!    list merge rule below, and it only touches the most recent record.
//! 3. Every [`InstanceRef`] in the log was derived by the log's [`IdPolicy`].
//!
//! # List merge rule
//!
//! When the last record is a `ListChange` for the same instance and property
//! as an incoming `ListChange`, and both are pure additions (or both are pure
//! removals), the incoming items are appended to the existing record instead
//! of starting a new one. Mixed records, a different instance or property, or
//! any other record in between start a fresh record.

use serde_json::Value;

use crate::change::{ChangeRecord, IdChange};
use crate::ids::{IdPolicy, InstanceRef, ObjectId, TypeName};

/// Append-only sequence of [`ChangeRecord`]s awaiting synchronization.
#[derive(Debug, Clone, Default)]
pub struct ChangeLog {
    policy: IdPolicy,
    records: Vec<ChangeRecord>,
}

impl ChangeLog {
    #[must_use]
    pub fn new(policy: IdPolicy) -> Self {
        Self {
            policy,
            records: Vec::new(),
        }
    }

    #[must_use]
    pub fn policy(&self) -> &IdPolicy {
        &self.policy
    }

    /// Whether `id` is a client-minted temporary id under this log's policy.
    #[must_use]
    pub fn is_new_id(&self, id: &str) -> bool {
        self.policy.is_new(id)
    }

    /// Reference to `(type_name, id)` suitable for the constructors below.
    #[must_use]
    pub fn instance(&self, type_name: impl Into<TypeName>, id: impl Into<ObjectId>) -> InstanceRef {
        self.policy.instance(type_name, id)
    }

    /// Append `record`, merging it into the last record when the list merge
    /// rule applies.
    pub fn append(&mut self, record: ChangeRecord) {
        let Some(last) = self.records.last_mut() else {
            self.records.push(record);
            return;
        };
        if let Some(unmerged) = merge_list_change(last, record) {
            self.records.push(unmerged);
        }
    }

    pub fn init_new(&mut self, instance: InstanceRef) {
        self.append(ChangeRecord::InitNew { instance });
    }

    pub fn value_change(
        &mut self,
        instance: InstanceRef,
        property: impl Into<String>,
        old_value: Value,
        new_value: Value,
    ) {
        self.append(ChangeRecord::ValueChange {
            instance,
            property: property.into(),
            old_value,
            new_value,
        });
    }

    pub fn reference_change(
        &mut self,
        instance: InstanceRef,
        property: impl Into<String>,
        old_value: Option<InstanceRef>,
        new_value: Option<InstanceRef>,
    ) {
        self.append(ChangeRecord::ReferenceChange {
            instance,
            property: property.into(),
            old_value,
            new_value,
        });
    }

    /// Record items added to a list property. An empty `items` records nothing.
    pub fn add_to_list(
        &mut self,
        instance: InstanceRef,
        property: impl Into<String>,
        items: impl IntoIterator<Item = InstanceRef>,
    ) {
        let added: Vec<_> = items.into_iter().collect();
        if added.is_empty() {
            return;
        }
        self.append(ChangeRecord::ListChange {
            instance,
            property: property.into(),
            added,
            removed: Vec::new(),
        });
    }

    /// Record items removed from a list property. An empty `items` records nothing.
    pub fn remove_from_list(
        &mut self,
        instance: InstanceRef,
        property: impl Into<String>,
        items: impl IntoIterator<Item = InstanceRef>,
    ) {
        let removed: Vec<_> = items.into_iter().collect();
        if removed.is_empty() {
            return;
        }
        self.append(ChangeRecord::ListChange {
            instance,
            property: property.into(),
            added: Vec::new(),
            removed,
        });
    }

    /// Append a commit marker for a completed save.
    pub fn commit(&mut self, id_changes: Vec<IdChange>) {
        self.append(ChangeRecord::Save { id_changes });
    }

    /// Copy of every record, in order.
    #[must_use]
    pub fn build(&self) -> Vec<ChangeRecord> {
        self.records.clone()
    }

    #[must_use]
    pub fn records(&self) -> &[ChangeRecord] {
        &self.records
    }

    /// Records appended after the most recent commit marker.
    #[must_use]
    pub fn since_last_commit(&self) -> &[ChangeRecord] {
        let start = self
            .records
            .iter()
            .rposition(ChangeRecord::is_commit)
            .map_or(0, |idx| idx + 1);
        &self.records[start..]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Serialize the whole log in wire format (a JSON array).
    pub fn to_json(&self) -> serde_json::Result<Value> {
        serde_json::to_value(&self.records)
    }

    /// Rebuild a log from its wire format. Records are taken as-is; the merge
    /// rule is not re-applied.
    pub fn from_json(policy: IdPolicy, json: Value) -> serde_json::Result<Self> {
        let records = serde_json::from_value(json)?;
        Ok(Self { policy, records })
    }
}

/// Merge `incoming` into `last` when both are compatible pure list changes.
/// Returns the record back when it has to be appended on its own.
fn merge_list_change(last: &mut ChangeRecord, incoming: ChangeRecord) -> Option<ChangeRecord> {
    let ChangeRecord::ListChange {
        instance: last_instance,
        property: last_property,
        added: last_added,
        removed: last_removed,
    } = last
    else {
        return Some(incoming);
    };
    let (instance, property, added, removed) = match incoming {
        ChangeRecord::ListChange {
            instance,
            property,
            added,
            removed,
        } => (instance, property, added, removed),
        other => return Some(other),
    };

    let same_target = last_instance.same_instance(&instance) && *last_property == property;
    let both_added =
        !last_added.is_empty() && last_removed.is_empty() && !added.is_empty() && removed.is_empty();
    let both_removed =
        last_added.is_empty() && !last_removed.is_empty() && added.is_empty() && !removed.is_empty();

    match (same_target, both_added, both_removed) {
        (true, true, _) => {
            last_added.extend(added);
            None
        }
        (true, _, true) => {
            last_removed.extend(removed);
            None
        }
        _ => Some(ChangeRecord::ListChange {
            instance,
            property,
            added,
            removed,
        }),
    }
}

//! Unit-of-Work Adapter
//!
//! The narrow surface listeners use to talk to the persistence layer during a
//! flush: read change sets, ask for recomputation after mutating an object,
//! and schedule follow-up writes that are applied later in the same flush.

use std::collections::btree_map;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::entity::{Entity, Fields};
use crate::error::BehaviorResult;
use crate::mapping::ClassMetadata;

/// Identity of a managed object within one object manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId(pub u64);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Old and new value of one field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub old: Value,
    pub new: Value,
}

impl FieldChange {
    pub fn new(old: impl Into<Value>, new: impl Into<Value>) -> Self {
        Self {
            old: old.into(),
            new: new.into(),
        }
    }
}

/// Pending field changes of one object
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    changes: BTreeMap<String, FieldChange>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Change set holding a single field
    pub fn single(field: impl Into<String>, old: impl Into<Value>, new: impl Into<Value>) -> Self {
        Self::new().with(field, old, new)
    }

    pub fn with(mut self, field: impl Into<String>, old: impl Into<Value>, new: impl Into<Value>) -> Self {
        self.insert(field, FieldChange::new(old, new));
        self
    }

    pub fn insert(&mut self, field: impl Into<String>, change: FieldChange) {
        self.changes.insert(field.into(), change);
    }

    pub fn get(&self, field: &str) -> Option<&FieldChange> {
        self.changes.get(field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.changes.contains_key(field)
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.changes.keys().map(String::as_str)
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, FieldChange> {
        self.changes.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// Fold `later` into this set: the first old value is kept, the latest
    /// new value wins. A field merged twice still appears once.
    pub fn merge(&mut self, later: ChangeSet) {
        for (field, change) in later.changes {
            match self.changes.get_mut(&field) {
                Some(existing) => existing.new = change.new,
                None => {
                    self.changes.insert(field, change);
                }
            }
        }
    }

    /// Fields whose new value differs from the old one
    pub fn without_noops(mut self) -> Self {
        self.changes.retain(|_, change| change.old != change.new);
        self
    }
}

impl<'a> IntoIterator for &'a ChangeSet {
    type Item = (&'a String, &'a FieldChange);
    type IntoIter = btree_map::Iter<'a, String, FieldChange>;

    fn into_iter(self) -> Self::IntoIter {
        self.changes.iter()
    }
}

/// Persistence operations exposed to listeners during a flush
pub trait UnitOfWork {
    /// Resolved mapping of a class known to the persistence layer
    fn class_metadata(&self, class: &str) -> Option<Arc<ClassMetadata>>;

    /// Changes computed for `oid` in the current flush
    fn change_set(&self, oid: ObjectId) -> Option<ChangeSet>;

    /// Re-diff `entity` after a listener mutated it so the new values are
    /// part of the pending write
    fn recompute_change_set(&mut self, class: &ClassMetadata, oid: ObjectId, entity: &dyn Entity) -> BehaviorResult<()>;

    /// Queue an extra update applied after the main writes of this flush.
    /// Scheduling the same field of the same object twice keeps one entry.
    fn schedule_extra_update(&mut self, oid: ObjectId, changes: ChangeSet) -> BehaviorResult<()>;

    /// Queue a companion insert (e.g. a log entry) for this flush
    fn schedule_extra_insert(&mut self, entity: Box<dyn Entity>) -> BehaviorResult<ObjectId>;

    /// Whether `oid` is a new object whose insert has not been written yet
    fn is_scheduled_for_insert(&self, oid: ObjectId) -> bool;

    /// Keep a scheduled removal from reaching storage
    fn cancel_removal(&mut self, oid: ObjectId) -> BehaviorResult<()>;

    /// Objects of `class` whose fields equal every given criterion, as seen
    /// by this flush (stored rows overlaid with pending state)
    fn find_by(&self, class: &str, criteria: &[(&str, Value)]) -> Vec<(ObjectId, Fields)>;
}

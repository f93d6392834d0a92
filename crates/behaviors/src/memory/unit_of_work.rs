//! In-memory unit of work: identity map, stored rows and flush queues

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use serde_json::Value;
use tracing::{trace, warn};

use crate::entity::{is_blank, Entity, Fields, Record};
use crate::error::{BehaviorError, BehaviorResult, MutationError};
use crate::mapping::{ClassMetadata, MappingRegistry};
use crate::unit_of_work::{ChangeSet, FieldChange, ObjectId, UnitOfWork};

/// Where a managed object stands in the current unit of work
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectState {
    /// Persisted but not yet flushed
    New,
    /// In sync with a stored row as of the last flush
    Managed,
    /// Scheduled for deletion
    Removed,
}

struct Slot {
    class: String,
    /// `None` while the object is lent to a listener
    entity: Option<Box<dyn Entity>>,
    /// Field values at the time the object was lent
    lent_fields: Fields,
    state: ObjectState,
    /// Stored values as of the last flush, empty for new objects
    original: Fields,
}

#[derive(Debug, Clone)]
pub(crate) struct StoredRow {
    pub class: String,
    pub fields: Fields,
}

/// Saved state used to roll a failed flush back
pub(crate) struct Snapshot {
    rows: BTreeMap<ObjectId, StoredRow>,
    slots: BTreeMap<ObjectId, (ObjectState, Fields, Fields)>,
    sequences: HashMap<String, i64>,
    next_oid: u64,
}

/// Objects touched by one flush, in processing order
#[derive(Debug, Default)]
pub(crate) struct FlushPlan {
    pub inserts: Vec<ObjectId>,
    pub updates: Vec<ObjectId>,
    pub deletes: Vec<ObjectId>,
}

impl FlushPlan {
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }
}

pub struct MemoryUnitOfWork {
    mappings: Arc<MappingRegistry>,
    slots: BTreeMap<ObjectId, Slot>,
    rows: BTreeMap<ObjectId, StoredRow>,
    sequences: HashMap<String, i64>,
    next_oid: u64,
    change_sets: BTreeMap<ObjectId, ChangeSet>,
    extra_updates: BTreeMap<ObjectId, ChangeSet>,
    extra_inserts: Vec<(ObjectId, Box<dyn Entity>)>,
    cancelled_removals: BTreeSet<ObjectId>,
}

impl MemoryUnitOfWork {
    pub fn new(mappings: Arc<MappingRegistry>) -> Self {
        Self {
            mappings,
            slots: BTreeMap::new(),
            rows: BTreeMap::new(),
            sequences: HashMap::new(),
            next_oid: 1,
            change_sets: BTreeMap::new(),
            extra_updates: BTreeMap::new(),
            extra_inserts: Vec::new(),
            cancelled_removals: BTreeSet::new(),
        }
    }

    pub fn mappings(&self) -> &Arc<MappingRegistry> {
        &self.mappings
    }

    pub fn state(&self, oid: ObjectId) -> Option<ObjectState> {
        self.slots.get(&oid).map(|slot| slot.state)
    }

    pub fn entity(&self, oid: ObjectId) -> Option<&dyn Entity> {
        match self.slots.get(&oid) {
            Some(Slot { entity: Some(entity), .. }) => Some(&**entity),
            _ => None,
        }
    }

    pub fn entity_mut(&mut self, oid: ObjectId) -> Option<&mut dyn Entity> {
        match self.slots.get_mut(&oid) {
            Some(Slot { entity: Some(entity), .. }) => Some(&mut **entity),
            _ => None,
        }
    }

    /// Stored row of an object as of the last flush
    pub fn row(&self, oid: ObjectId) -> Option<&Fields> {
        self.rows.get(&oid).map(|row| &row.fields)
    }

    /// Stored rows of `class` and its subclasses
    pub fn rows_of(&self, class: &str) -> Vec<(ObjectId, &Fields)> {
        self.rows
            .iter()
            .filter(|(_, row)| self.is_a(&row.class, class))
            .map(|(oid, row)| (*oid, &row.fields))
            .collect()
    }

    pub(crate) fn attach_new(&mut self, entity: Box<dyn Entity>) -> BehaviorResult<ObjectId> {
        let class = entity.class_name().to_string();
        if !self.mappings.is_mapped(&class) {
            return Err(BehaviorError::unmapped(class));
        }
        let oid = self.allocate();
        self.slots.insert(
            oid,
            Slot {
                class,
                entity: Some(entity),
                lent_fields: Fields::new(),
                state: ObjectState::New,
                original: Fields::new(),
            },
        );
        Ok(oid)
    }

    /// Attach a stored row as a managed record; returns false if already attached
    pub(crate) fn attach_stored(&mut self, oid: ObjectId) -> bool {
        if self.slots.contains_key(&oid) {
            return false;
        }
        let Some(row) = self.rows.get(&oid) else {
            return false;
        };
        self.slots.insert(
            oid,
            Slot {
                class: row.class.clone(),
                entity: Some(Box::new(Record::from_fields(row.class.clone(), row.fields.clone()))),
                lent_fields: Fields::new(),
                state: ObjectState::Managed,
                original: row.fields.clone(),
            },
        );
        true
    }

    pub(crate) fn schedule_removal(&mut self, oid: ObjectId) -> BehaviorResult<()> {
        let slot = self
            .slots
            .get_mut(&oid)
            .ok_or(MutationError::UnknownObject(oid.0))?;
        match slot.state {
            // never reached storage
            ObjectState::New => {
                self.slots.remove(&oid);
            }
            ObjectState::Managed => slot.state = ObjectState::Removed,
            ObjectState::Removed => {}
        }
        Ok(())
    }

    pub(crate) fn detach_all(&mut self) {
        self.slots.clear();
        self.change_sets.clear();
    }

    /// Find a stored object by class and identifier value
    pub(crate) fn lookup(&self, class: &str, id: &Value) -> BehaviorResult<Option<ObjectId>> {
        let meta = self
            .mappings
            .metadata(class)
            .ok_or_else(|| BehaviorError::unmapped(class))?;
        Ok(self
            .rows
            .iter()
            .find(|(_, row)| self.is_a(&row.class, class) && row.fields.get(&meta.identifier) == Some(id))
            .map(|(oid, _)| *oid))
    }

    /// Take an object out of its slot for the length of a dispatch
    pub(crate) fn lend(&mut self, oid: ObjectId) -> BehaviorResult<(Arc<ClassMetadata>, Box<dyn Entity>)> {
        let slot = self
            .slots
            .get_mut(&oid)
            .ok_or(MutationError::UnknownObject(oid.0))?;
        let class = self
            .mappings
            .metadata(&slot.class)
            .ok_or_else(|| BehaviorError::unmapped(slot.class.clone()))?;
        let entity = slot.entity.take().ok_or(MutationError::UnknownObject(oid.0))?;
        slot.lent_fields = entity.to_fields();
        Ok((class, entity))
    }

    pub(crate) fn give_back(&mut self, oid: ObjectId, entity: Box<dyn Entity>) {
        if let Some(slot) = self.slots.get_mut(&oid) {
            slot.entity = Some(entity);
            slot.lent_fields.clear();
        }
    }

    pub(crate) fn snapshot(&self) -> Snapshot {
        Snapshot {
            rows: self.rows.clone(),
            slots: self
                .slots
                .iter()
                .map(|(oid, slot)| {
                    let current = slot.entity.as_ref().map(|e| e.to_fields()).unwrap_or_default();
                    (*oid, (slot.state, slot.original.clone(), current))
                })
                .collect(),
            sequences: self.sequences.clone(),
            next_oid: self.next_oid,
        }
    }

    /// Put rows and managed objects back the way they were before the flush
    pub(crate) fn restore(&mut self, snapshot: Snapshot) {
        self.rows = snapshot.rows;
        self.sequences = snapshot.sequences;
        self.next_oid = snapshot.next_oid;
        self.slots.retain(|oid, _| snapshot.slots.contains_key(oid));

        for (oid, (state, original, fields)) in snapshot.slots {
            let Some(slot) = self.slots.get_mut(&oid) else {
                continue;
            };
            slot.state = state;
            slot.original = original;
            if let Some(entity) = slot.entity.as_mut() {
                for (name, value) in entity.to_fields() {
                    let before = fields.get(&name).cloned().unwrap_or(Value::Null);
                    if before != value {
                        if let Err(err) = entity.set_field(&name, before) {
                            warn!(object = %oid, field = %name, error = %err, "could not roll back field");
                        }
                    }
                }
            }
        }
        self.reset_queues();
    }

    /// Compute change sets and sort objects into inserts, updates and deletes
    pub(crate) fn plan(&mut self) -> BehaviorResult<FlushPlan> {
        let mut plan = FlushPlan::default();
        let oids: Vec<ObjectId> = self.slots.keys().copied().collect();

        for oid in oids {
            let (state, class) = match self.slots.get(&oid) {
                Some(slot) => (slot.state, slot.class.clone()),
                None => continue,
            };
            match state {
                ObjectState::New => {
                    self.refresh_change_set(&class, oid)?;
                    plan.inserts.push(oid);
                }
                ObjectState::Managed => {
                    self.refresh_change_set(&class, oid)?;
                    if self.change_sets.get(&oid).is_some_and(|cs| !cs.is_empty()) {
                        plan.updates.push(oid);
                    }
                }
                ObjectState::Removed => plan.deletes.push(oid),
            }
        }
        Ok(plan)
    }

    fn refresh_change_set(&mut self, class: &str, oid: ObjectId) -> BehaviorResult<()> {
        let meta = self
            .mappings
            .metadata(class)
            .ok_or_else(|| BehaviorError::unmapped(class))?;
        let changes = match self.slots.get(&oid) {
            Some(Slot { entity: Some(entity), original, .. }) => diff(&meta, original, &**entity),
            _ => return Err(MutationError::UnknownObject(oid.0).into()),
        };
        self.change_sets.insert(oid, changes);
        Ok(())
    }

    /// Write a new object's row, assigning its identifier
    pub(crate) fn write_insert(&mut self, oid: ObjectId) -> BehaviorResult<()> {
        let class = self
            .slots
            .get(&oid)
            .map(|slot| slot.class.clone())
            .ok_or(MutationError::UnknownObject(oid.0))?;
        let meta = self
            .mappings
            .metadata(&class)
            .ok_or_else(|| BehaviorError::unmapped(class.clone()))?;
        let sequence = self.sequence_key(&class);

        let slot = self
            .slots
            .get_mut(&oid)
            .ok_or(MutationError::UnknownObject(oid.0))?;
        let entity = slot.entity.as_mut().ok_or(MutationError::UnknownObject(oid.0))?;

        let current = entity.field(&meta.identifier);
        if is_blank(current.as_ref()) {
            if !meta.generated_identifier {
                return Err(MutationError::invalid_value(
                    &class,
                    &meta.identifier,
                    "assigned identifier is missing",
                )
                .into());
            }
            let next = self.sequences.entry(sequence).or_insert(0);
            *next += 1;
            entity.set_field(&meta.identifier, Value::from(*next))?;
        } else if let Some(assigned) = current.as_ref().and_then(Value::as_i64) {
            let next = self.sequences.entry(sequence).or_insert(0);
            *next = (*next).max(assigned);
        }

        let fields = row_fields(&meta, &**entity);
        slot.original = fields.clone();
        slot.state = ObjectState::Managed;
        trace!(object = %oid, class = %class, "inserted row");
        self.rows.insert(oid, StoredRow { class, fields });
        Ok(())
    }

    pub(crate) fn write_update(&mut self, oid: ObjectId) -> BehaviorResult<()> {
        let slot = self
            .slots
            .get_mut(&oid)
            .ok_or(MutationError::UnknownObject(oid.0))?;
        let meta = self
            .mappings
            .metadata(&slot.class)
            .ok_or_else(|| BehaviorError::unmapped(slot.class.clone()))?;
        let entity = slot.entity.as_ref().ok_or(MutationError::UnknownObject(oid.0))?;

        let fields = row_fields(&meta, &**entity);
        slot.original = fields.clone();
        trace!(object = %oid, class = %slot.class, "updated row");
        self.rows.insert(
            oid,
            StoredRow {
                class: slot.class.clone(),
                fields,
            },
        );
        Ok(())
    }

    /// Delete a row unless a listener cancelled the removal; returns whether
    /// the row was deleted
    pub(crate) fn write_delete(&mut self, oid: ObjectId) -> bool {
        if self.cancelled_removals.contains(&oid) {
            if let Some(slot) = self.slots.get_mut(&oid) {
                slot.state = ObjectState::Managed;
            }
            return false;
        }
        self.rows.remove(&oid);
        true
    }

    /// Apply queued companion inserts and extra updates until none are left;
    /// returns how many writes were made
    pub(crate) fn drain_extras(&mut self) -> BehaviorResult<usize> {
        let mut writes = 0;
        while !self.extra_inserts.is_empty() || !self.extra_updates.is_empty() {
            for (oid, entity) in std::mem::take(&mut self.extra_inserts) {
                let class = entity.class_name().to_string();
                self.slots.insert(
                    oid,
                    Slot {
                        class,
                        entity: Some(entity),
                        lent_fields: Fields::new(),
                        state: ObjectState::New,
                        original: Fields::new(),
                    },
                );
                self.write_insert(oid)?;
                writes += 1;
            }

            for (oid, changes) in std::mem::take(&mut self.extra_updates) {
                self.apply_extra_update(oid, changes)?;
                writes += 1;
            }
        }
        Ok(writes)
    }

    fn apply_extra_update(&mut self, oid: ObjectId, changes: ChangeSet) -> BehaviorResult<()> {
        let Some(row) = self.rows.get_mut(&oid) else {
            trace!(object = %oid, "skipping extra update of a deleted row");
            return Ok(());
        };
        for (field, change) in &changes {
            row.fields.insert(field.clone(), change.new.clone());
        }

        if let Some(slot) = self.slots.get_mut(&oid) {
            for (field, change) in &changes {
                slot.original.insert(field.clone(), change.new.clone());
                if let Some(entity) = slot.entity.as_mut() {
                    entity.set_field(field, change.new.clone())?;
                }
            }
        }
        Ok(())
    }

    /// Drop flush bookkeeping and detach deleted objects
    pub(crate) fn finish(&mut self) {
        self.slots.retain(|_, slot| slot.state != ObjectState::Removed);
        self.reset_queues();
    }

    fn reset_queues(&mut self) {
        self.change_sets.clear();
        self.extra_updates.clear();
        self.extra_inserts.clear();
        self.cancelled_removals.clear();
    }

    fn allocate(&mut self) -> ObjectId {
        let oid = ObjectId(self.next_oid);
        self.next_oid += 1;
        oid
    }

    /// Identifier sequences are shared by a whole class hierarchy
    fn sequence_key(&self, class: &str) -> String {
        self.mappings
            .lineage(class)
            .ok()
            .and_then(|lineage| lineage.first().map(|root| root.name.clone()))
            .unwrap_or_else(|| class.to_string())
    }

    fn is_a(&self, candidate: &str, class: &str) -> bool {
        candidate == class
            || self
                .mappings
                .lineage(candidate)
                .map(|lineage| lineage.iter().any(|meta| meta.name == class))
                .unwrap_or(false)
    }

    fn is_known(&self, oid: ObjectId) -> bool {
        self.slots.contains_key(&oid)
            || self.rows.contains_key(&oid)
            || self.extra_inserts.iter().any(|(pending, _)| *pending == oid)
    }

    fn overlay(&self, oid: ObjectId, mut fields: Fields) -> Fields {
        if let Some(changes) = self.extra_updates.get(&oid) {
            for (field, change) in changes {
                fields.insert(field.clone(), change.new.clone());
            }
        }
        fields
    }
}

impl UnitOfWork for MemoryUnitOfWork {
    fn class_metadata(&self, class: &str) -> Option<Arc<ClassMetadata>> {
        self.mappings.metadata(class)
    }

    fn change_set(&self, oid: ObjectId) -> Option<ChangeSet> {
        self.change_sets.get(&oid).cloned()
    }

    fn recompute_change_set(&mut self, class: &ClassMetadata, oid: ObjectId, entity: &dyn Entity) -> BehaviorResult<()> {
        let slot = self
            .slots
            .get(&oid)
            .ok_or(MutationError::UnknownObject(oid.0))?;
        let changes = diff(class, &slot.original, entity);
        trace!(object = %oid, fields = changes.len(), "recomputed change set");
        self.change_sets.insert(oid, changes);
        Ok(())
    }

    fn schedule_extra_update(&mut self, oid: ObjectId, changes: ChangeSet) -> BehaviorResult<()> {
        if !self.is_known(oid) {
            return Err(MutationError::UnknownObject(oid.0).into());
        }
        self.extra_updates.entry(oid).or_default().merge(changes);
        Ok(())
    }

    fn schedule_extra_insert(&mut self, entity: Box<dyn Entity>) -> BehaviorResult<ObjectId> {
        if !self.mappings.is_mapped(entity.class_name()) {
            return Err(BehaviorError::unmapped(entity.class_name()));
        }
        let oid = self.allocate();
        self.extra_inserts.push((oid, entity));
        Ok(oid)
    }

    fn is_scheduled_for_insert(&self, oid: ObjectId) -> bool {
        self.slots.get(&oid).is_some_and(|slot| slot.state == ObjectState::New)
    }

    fn cancel_removal(&mut self, oid: ObjectId) -> BehaviorResult<()> {
        match self.slots.get(&oid) {
            Some(slot) if slot.state == ObjectState::Removed => {
                self.cancelled_removals.insert(oid);
                Ok(())
            }
            Some(_) => Ok(()),
            None => Err(MutationError::UnknownObject(oid.0).into()),
        }
    }

    fn find_by(&self, class: &str, criteria: &[(&str, Value)]) -> Vec<(ObjectId, Fields)> {
        let accepts = |fields: &Fields| {
            criteria
                .iter()
                .all(|(field, value)| fields.get(*field).unwrap_or(&Value::Null) == value)
        };

        let mut found = Vec::new();
        for (oid, slot) in &self.slots {
            let removed = slot.state == ObjectState::Removed && !self.cancelled_removals.contains(oid);
            if removed || !self.is_a(&slot.class, class) {
                continue;
            }
            let current = match &slot.entity {
                Some(entity) => entity.to_fields(),
                None => slot.lent_fields.clone(),
            };
            let fields = self.overlay(*oid, current);
            if accepts(&fields) {
                found.push((*oid, fields));
            }
        }

        for (oid, row) in &self.rows {
            if self.slots.contains_key(oid) || !self.is_a(&row.class, class) {
                continue;
            }
            let fields = self.overlay(*oid, row.fields.clone());
            if accepts(&fields) {
                found.push((*oid, fields));
            }
        }

        for (oid, entity) in &self.extra_inserts {
            if !self.is_a(entity.class_name(), class) {
                continue;
            }
            let fields = self.overlay(*oid, entity.to_fields());
            if accepts(&fields) {
                found.push((*oid, fields));
            }
        }

        found.sort_by_key(|(oid, _)| *oid);
        found
    }
}

/// Persisted members whose current value differs from the stored one
fn diff(class: &ClassMetadata, original: &Fields, entity: &dyn Entity) -> ChangeSet {
    let mut changes = ChangeSet::new();
    for member in class.persisted_members() {
        let old = original.get(&member).cloned().unwrap_or(Value::Null);
        let new = entity.field(&member).unwrap_or(Value::Null);
        if old != new {
            changes.insert(member, FieldChange { old, new });
        }
    }
    changes
}

fn row_fields(class: &ClassMetadata, entity: &dyn Entity) -> Fields {
    class
        .persisted_members()
        .into_iter()
        .map(|member| {
            let value = entity.field(&member).unwrap_or(Value::Null);
            (member, value)
        })
        .collect()
}

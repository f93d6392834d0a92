//! Sortable: keeps an integer position column ordered within its group
//!
//! Positions start at 0. A new object without a position is appended; an
//! explicit position inserts it and shifts the objects at and after that
//! slot. Negative positions count from the end (`-1` is last). Removal
//! compacts the remaining positions of the group.

use std::collections::HashSet;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::trace;

use super::hierarchy_root;
use crate::entity::Entity;
use crate::error::{BehaviorResult, ConfigurationError};
use crate::event::{LifecycleEvent, Phase};
use crate::listener::BehaviorListener;
use crate::mapping::{ClassMetadata, ExtensionConfig, ExtensionSchema, FieldType};
use crate::unit_of_work::{ChangeSet, ObjectId, UnitOfWork};

const NAME: &str = "sortable";
pub const POSITION: &str = "position";
pub const GROUP: &str = "group";

const SUBSCRIBED: &[Phase] = &[
    Phase::LoadClassMetadata,
    Phase::OnFlush,
    Phase::PrePersist,
    Phase::PreUpdate,
    Phase::PreRemove,
];

struct Sorting<'c> {
    field: &'c str,
    groups: Vec<&'c str>,
}

impl<'c> Sorting<'c> {
    fn from_config(config: &'c ExtensionConfig) -> Option<Self> {
        let field = config.fields_for(POSITION).first().copied()?;
        Some(Self {
            field,
            groups: config.fields_for(GROUP),
        })
    }

    fn group_of(&self, entity: &dyn Entity) -> Vec<(&'c str, Value)> {
        self.groups
            .iter()
            .map(|group| (*group, entity.field(group).unwrap_or(Value::Null)))
            .collect()
    }
}

#[derive(Default)]
pub struct SortableListener {
    /// New objects of the running flush that already received a position
    placed: Mutex<HashSet<ObjectId>>,
}

impl SortableListener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Positioned members of a group other than `oid`. Pending inserts that
    /// have not been placed yet are left out.
    fn siblings(
        &self,
        uow: &dyn UnitOfWork,
        scope: &str,
        group: &[(&str, Value)],
        field: &str,
        oid: ObjectId,
    ) -> Vec<(ObjectId, i64)> {
        let placed = self.placed.lock();
        uow.find_by(scope, group)
            .into_iter()
            .filter(|(other, _)| *other != oid)
            .filter(|(other, _)| !uow.is_scheduled_for_insert(*other) || placed.contains(other))
            .filter_map(|(other, fields)| fields.get(field).and_then(Value::as_i64).map(|p| (other, p)))
            .collect()
    }

    fn place(
        &self,
        class: &ClassMetadata,
        oid: ObjectId,
        entity: &mut dyn Entity,
        uow: &mut dyn UnitOfWork,
        field: &str,
        position: i64,
    ) -> BehaviorResult<()> {
        if entity.field(field) != Some(Value::from(position)) {
            entity.set_field(field, Value::from(position))?;
            uow.recompute_change_set(class, oid, &*entity)?;
        }
        trace!(class = %class.name, object = %oid, position, "positioned");
        self.placed.lock().insert(oid);
        Ok(())
    }

    fn on_persist(&self, event: &mut LifecycleEvent<'_>, sorting: &Sorting<'_>) -> BehaviorResult<()> {
        let class = event.class_metadata()?.clone();
        let scope = hierarchy_root(event, &class)?;
        let (oid, entity, uow) = event.split()?;

        let group = sorting.group_of(&*entity);
        let siblings = self.siblings(&*uow, &scope, &group, sorting.field, oid);
        let target = resolve(entity.field(sorting.field).and_then(|v| v.as_i64()), next_position(&siblings));

        shift(uow, &siblings, sorting.field, |p| p >= target, 1)?;
        self.place(&class, oid, entity, uow, sorting.field, target)
    }

    fn on_update(&self, event: &mut LifecycleEvent<'_>, sorting: &Sorting<'_>) -> BehaviorResult<()> {
        let class = event.class_metadata()?.clone();
        let changes = event.change_set()?;
        let group_changed = sorting.groups.iter().any(|group| changes.contains(group));
        let position_change = changes.get(sorting.field).cloned();
        if !group_changed && position_change.is_none() {
            return Ok(());
        }

        let scope = hierarchy_root(event, &class)?;
        let (oid, entity, uow) = event.split()?;
        let field = sorting.field;
        let group = sorting.group_of(&*entity);
        let old_position = match &position_change {
            Some(change) => change.old.as_i64(),
            None => entity.field(field).and_then(|v| v.as_i64()),
        };
        let requested = position_change.as_ref().and_then(|change| change.new.as_i64());

        if group_changed {
            if let Some(old) = old_position {
                let previous: Vec<(&str, Value)> = group
                    .iter()
                    .map(|(name, current)| {
                        let old_value = changes.get(name).map(|change| change.old.clone());
                        (*name, old_value.unwrap_or_else(|| current.clone()))
                    })
                    .collect();
                let left = self.siblings(&*uow, &scope, &previous, field, oid);
                shift(uow, &left, field, |p| p > old, -1)?;
            }

            let siblings = self.siblings(&*uow, &scope, &group, field, oid);
            let target = resolve(requested, next_position(&siblings));
            shift(uow, &siblings, field, |p| p >= target, 1)?;
            return self.place(&class, oid, entity, uow, field, target);
        }

        let siblings = self.siblings(&*uow, &scope, &group, field, oid);
        let last = match old_position {
            Some(old) => siblings.iter().map(|(_, p)| *p).max().map_or(old, |max| max.max(old)),
            None => next_position(&siblings),
        };
        let target = resolve(requested, last);
        match old_position {
            Some(old) if target < old => shift(uow, &siblings, field, |p| p >= target && p < old, 1)?,
            Some(old) if target > old => shift(uow, &siblings, field, |p| p > old && p <= target, -1)?,
            Some(_) => {}
            None => shift(uow, &siblings, field, |p| p >= target, 1)?,
        }
        self.place(&class, oid, entity, uow, field, target)
    }

    fn on_remove(&self, event: &mut LifecycleEvent<'_>, sorting: &Sorting<'_>) -> BehaviorResult<()> {
        let class = event.class_metadata()?.clone();
        let scope = hierarchy_root(event, &class)?;
        let (oid, entity, uow) = event.split()?;

        let group = sorting.group_of(&*entity);
        let mut remaining = self.siblings(&*uow, &scope, &group, sorting.field, oid);
        remaining.sort_by_key(|(other, position)| (*position, *other));

        for (index, (other, position)) in (0_i64..).zip(remaining) {
            if position != index {
                uow.schedule_extra_update(other, ChangeSet::single(sorting.field, position, index))?;
            }
        }
        Ok(())
    }
}

impl ExtensionSchema for SortableListener {
    fn name(&self) -> &'static str {
        NAME
    }

    fn validate(&self, class: &ClassMetadata, config: &ExtensionConfig) -> Result<(), ConfigurationError> {
        if let Some(role) = config.role_names().find(|role| *role != POSITION && *role != GROUP) {
            return Err(ConfigurationError::unknown_role(&class.name, NAME, role));
        }

        let positions = config.fields_for(POSITION);
        let [position] = positions.as_slice() else {
            return Err(ConfigurationError::invalid_option(
                &class.name,
                NAME,
                POSITION,
                format!("exactly one position field is required, found {}", positions.len()),
            ));
        };
        match class.field_mapping(position) {
            Some(mapping) if mapping.field_type == FieldType::Integer => {}
            Some(mapping) => {
                return Err(ConfigurationError::invalid_field_type(
                    &class.name,
                    NAME,
                    *position,
                    mapping.field_type.as_str(),
                    "integer",
                ))
            }
            None => {
                return Err(ConfigurationError::invalid_field_type(
                    &class.name,
                    NAME,
                    *position,
                    "association",
                    "integer",
                ))
            }
        }

        for group in config.fields_for(GROUP) {
            if let Some(association) = class.association_mapping(group) {
                if !association.kind.is_single_valued() {
                    return Err(ConfigurationError::invalid_field_type(
                        &class.name,
                        NAME,
                        group,
                        "collection association",
                        "a column or single-valued association",
                    ));
                }
            }
        }
        Ok(())
    }
}

impl BehaviorListener for SortableListener {
    fn subscribed_events(&self) -> &'static [Phase] {
        SUBSCRIBED
    }

    fn handle(&self, event: &mut LifecycleEvent<'_>) -> BehaviorResult<()> {
        if event.phase() == Phase::OnFlush {
            self.placed.lock().clear();
            return Ok(());
        }

        let config = event.configuration(NAME)?;
        let Some(sorting) = Sorting::from_config(&config) else {
            return Ok(());
        };
        match event.phase() {
            Phase::PrePersist => self.on_persist(event, &sorting),
            Phase::PreUpdate => self.on_update(event, &sorting),
            Phase::PreRemove => self.on_remove(event, &sorting),
            _ => Ok(()),
        }
    }
}

fn next_position(siblings: &[(ObjectId, i64)]) -> i64 {
    siblings.iter().map(|(_, position)| *position).max().map_or(0, |max| max + 1)
}

/// Clamp a requested position into `0..=last`; negatives count back from `last`
fn resolve(requested: Option<i64>, last: i64) -> i64 {
    match requested {
        None => last,
        Some(position) if position < 0 => (last + 1 + position).max(0),
        Some(position) => position.min(last),
    }
}

fn shift(
    uow: &mut dyn UnitOfWork,
    siblings: &[(ObjectId, i64)],
    field: &str,
    moves: impl Fn(i64) -> bool,
    delta: i64,
) -> BehaviorResult<()> {
    for &(other, position) in siblings.iter().filter(|(_, position)| moves(*position)) {
        uow.schedule_extra_update(other, ChangeSet::single(field, position, position + delta))?;
    }
    Ok(())
}

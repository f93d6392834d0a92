//! SoftDeleteable: removal stamps a deletion time instead of deleting the row

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;
use tracing::debug;

use crate::behaviors::tracking::{format_timestamp, Clock, SystemClock};
use crate::entity::Fields;
use crate::error::{BehaviorResult, ConfigurationError, MutationError};
use crate::event::{LifecycleEvent, Phase};
use crate::listener::BehaviorListener;
use crate::mapping::{ClassMetadata, ExtensionConfig, ExtensionSchema, FieldType};
use crate::memory::MemoryObjectManager;
use crate::unit_of_work::{ChangeSet, ObjectId};

const NAME: &str = "softDeleteable";
const DEFAULT_FIELD: &str = "deletedAt";

const SUBSCRIBED: &[Phase] = &[Phase::LoadClassMetadata, Phase::PreRemove];

pub struct SoftDeleteableListener {
    clock: Arc<dyn Clock>,
}

impl SoftDeleteableListener {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// Whether stored `fields` describe a soft-deleted object. With
    /// `timeAware`, a deletion time in the future does not count yet.
    pub fn is_deleted(&self, config: &ExtensionConfig, fields: &Fields) -> bool {
        let field = config.option_str("fieldName").unwrap_or(DEFAULT_FIELD);
        let Some(deleted_at) = fields.get(field).filter(|value| !value.is_null()) else {
            return false;
        };
        if !config.option_bool("timeAware", false) {
            return true;
        }
        match parse_moment(deleted_at) {
            Some(at) => at <= self.clock.now(),
            None => true,
        }
    }

    /// Stored rows of `class` that are not soft-deleted
    pub fn visible(&self, manager: &MemoryObjectManager, class: &str) -> BehaviorResult<Vec<(ObjectId, Fields)>> {
        let config = manager.metadata().extension_metadata(class, NAME)?;
        Ok(manager
            .rows(class)
            .into_iter()
            .filter(|(_, fields)| config.is_empty() || !self.is_deleted(&config, fields))
            .map(|(oid, fields)| (oid, fields.clone()))
            .collect())
    }

    fn on_remove(&self, event: &mut LifecycleEvent<'_>, config: &ExtensionConfig) -> BehaviorResult<()> {
        let class = event.class_metadata()?.clone();
        let field = config.option_str("fieldName").unwrap_or(DEFAULT_FIELD);
        let (oid, entity, uow) = event.split()?;

        let current = entity.field(field).unwrap_or(Value::Null);
        let stamped = Fields::from([(field.to_string(), current.clone())]);
        if self.is_deleted(config, &stamped) && config.option_bool("hardDelete", true) {
            debug!(class = %class.name, object = %oid, "hard delete of soft-deleted object");
            return Ok(());
        }

        let field_type = class
            .field_mapping(field)
            .map(|mapping| mapping.field_type)
            .ok_or_else(|| MutationError::unknown_field(&class.name, field))?;
        let now = format_timestamp(self.clock.now(), field_type)
            .ok_or_else(|| MutationError::invalid_value(&class.name, field, "cannot hold a deletion time"))?;

        uow.schedule_extra_update(oid, ChangeSet::single(field, current, now))?;
        uow.cancel_removal(oid)?;
        debug!(class = %class.name, object = %oid, "soft deleted");
        Ok(())
    }
}

impl Default for SoftDeleteableListener {
    fn default() -> Self {
        Self::new()
    }
}

impl ExtensionSchema for SoftDeleteableListener {
    fn name(&self) -> &'static str {
        NAME
    }

    fn validate(&self, class: &ClassMetadata, config: &ExtensionConfig) -> Result<(), ConfigurationError> {
        if let Some(role) = config.role_names().next() {
            return Err(ConfigurationError::unknown_role(&class.name, NAME, role));
        }

        let field = match config.option("fieldName") {
            None => DEFAULT_FIELD,
            Some(Value::String(field)) => field.as_str(),
            Some(_) => {
                return Err(ConfigurationError::invalid_option(&class.name, NAME, "fieldName", "expected a field name"))
            }
        };
        match class.field_mapping(field) {
            None => Err(ConfigurationError::missing_field(&class.name, NAME, "fieldName", field)),
            Some(mapping) if mapping.field_type.is_temporal() || mapping.field_type == FieldType::Integer => {
                for flag in ["timeAware", "hardDelete"] {
                    if config.option(flag).is_some_and(|value| !value.is_boolean()) {
                        return Err(ConfigurationError::invalid_option(&class.name, NAME, flag, "expected a boolean"));
                    }
                }
                Ok(())
            }
            Some(mapping) => Err(ConfigurationError::invalid_field_type(
                &class.name,
                NAME,
                field,
                mapping.field_type.as_str(),
                "date, datetime or integer",
            )),
        }
    }
}

impl BehaviorListener for SoftDeleteableListener {
    fn subscribed_events(&self) -> &'static [Phase] {
        SUBSCRIBED
    }

    fn handle(&self, event: &mut LifecycleEvent<'_>) -> BehaviorResult<()> {
        let config = event.configuration(NAME)?;
        if config.is_empty() || event.phase() != Phase::PreRemove {
            return Ok(());
        }
        self.on_remove(event, &config)
    }
}

fn parse_moment(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => n.as_i64().and_then(|secs| DateTime::from_timestamp(secs, 0)),
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|at| at.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                NaiveDate::parse_from_str(s, "%Y-%m-%d")
                    .ok()
                    .and_then(|day| day.and_hms_opt(0, 0, 0))
                    .map(|at| at.and_utc())
            }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::behaviors::tracking::FixedClock;
    use chrono::TimeZone;
    use serde_json::json;

    fn listener() -> SoftDeleteableListener {
        SoftDeleteableListener::with_clock(Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
        )))
    }

    #[test]
    fn test_is_deleted() {
        let listener = listener();
        let config = ExtensionConfig::new().with_option("fieldName", "deletedAt");

        let mut fields = Fields::new();
        assert!(!listener.is_deleted(&config, &fields));

        fields.insert("deletedAt".to_string(), json!("2099-01-01T00:00:00Z"));
        assert!(listener.is_deleted(&config, &fields));

        let time_aware = config.with_option("timeAware", true);
        assert!(!listener.is_deleted(&time_aware, &fields));

        fields.insert("deletedAt".to_string(), json!("2024-06-01"));
        assert!(listener.is_deleted(&time_aware, &fields));
    }

    #[test]
    fn test_validation() {
        let listener = listener();
        let class = ClassMetadata::new("app::Article")
            .field("deletedAt", FieldType::DateTime)
            .field("title", FieldType::String);

        assert!(listener.validate(&class, &ExtensionConfig::new().with_option("fieldName", "deletedAt")).is_ok());
        assert!(matches!(
            listener.validate(&class, &ExtensionConfig::new().with_option("fieldName", "title")),
            Err(ConfigurationError::InvalidFieldType { .. })
        ));
        assert!(matches!(
            listener.validate(&class, &ExtensionConfig::new().with_option("fieldName", "removedOn")),
            Err(ConfigurationError::MissingField { .. })
        ));
    }
}

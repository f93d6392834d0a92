//! Loggable: versioned audit trail of selected fields
//!
//! Every insert, update touching a versioned field, and removal of a loggable
//! object adds a companion log entry row in the same flush. Entries carry a
//! per-object version number starting at 1.

use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::{Map, Value};
use tracing::debug;

use crate::behaviors::tracking::{format_timestamp, Clock, SystemClock};
use crate::config::ExtensionsConfig;
use crate::entity::{Entity, Fields, Record};
use crate::error::{BehaviorError, BehaviorResult, ConfigurationError, MutationError};
use crate::event::{LifecycleEvent, Phase};
use crate::listener::BehaviorListener;
use crate::mapping::{AssociationKind, ClassMetadata, ExtensionConfig, ExtensionSchema, FieldType, MappingRegistry};
use crate::memory::MemoryObjectManager;
use crate::unit_of_work::{ObjectId, UnitOfWork};

const NAME: &str = "loggable";
pub const VERSIONED: &str = "versioned";
pub const DEFAULT_LOG_ENTRY_CLASS: &str = "behaviors::LogEntry";

/// Columns every log entry class must map
const LOG_COLUMNS: &[&str] = &["action", "loggedAt", "objectId", "objectClass", "version", "data", "username"];

const SUBSCRIBED: &[Phase] = &[
    Phase::LoadClassMetadata,
    Phase::PostPersist,
    Phase::PostUpdate,
    Phase::PostRemove,
];

/// Kind of change a log entry records
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogAction {
    Create,
    Update,
    Remove,
}

impl LogAction {
    pub fn as_str(self) -> &'static str {
        match self {
            LogAction::Create => "create",
            LogAction::Update => "update",
            LogAction::Remove => "remove",
        }
    }
}

/// Mapping for a log entry class with the columns the listener writes
pub fn log_entry_mapping(name: impl Into<String>) -> ClassMetadata {
    ClassMetadata::new(name)
        .required_field("action", FieldType::String)
        .required_field("loggedAt", FieldType::DateTime)
        .field("objectId", FieldType::Json)
        .required_field("objectClass", FieldType::String)
        .required_field("version", FieldType::Integer)
        .field("data", FieldType::Json)
        .field("username", FieldType::String)
}

pub struct LoggableListener {
    username: RwLock<Option<String>>,
    clock: Arc<dyn Clock>,
}

impl LoggableListener {
    pub fn new() -> Self {
        Self {
            username: RwLock::new(None),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn from_config(config: &ExtensionsConfig) -> Self {
        let listener = Self::new();
        *listener.username.write() = config.default_username.clone();
        listener
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// User recorded on subsequent log entries
    pub fn set_username(&self, username: impl Into<String>) {
        *self.username.write() = Some(username.into());
    }

    fn log(&self, event: &mut LifecycleEvent<'_>, config: &ExtensionConfig, action: LogAction) -> BehaviorResult<()> {
        let class = event.class_metadata()?.clone();
        let changes = match action {
            LogAction::Update => Some(event.change_set()?),
            _ => None,
        };
        let (_, entity, uow) = event.split()?;

        let data = match (action, &changes) {
            (LogAction::Remove, _) => Value::Null,
            (LogAction::Update, Some(changes)) => {
                let data: Map<String, Value> = config
                    .fields_for(VERSIONED)
                    .into_iter()
                    .filter_map(|field| changes.get(field).map(|change| (field.to_string(), change.new.clone())))
                    .collect();
                if data.is_empty() {
                    return Ok(());
                }
                Value::Object(data)
            }
            _ => Value::Object(
                config
                    .fields_for(VERSIONED)
                    .into_iter()
                    .filter_map(|field| {
                        entity
                            .field(field)
                            .filter(|value| !value.is_null())
                            .map(|value| (field.to_string(), value))
                    })
                    .collect(),
            ),
        };

        let object_id = entity.field(&class.identifier).unwrap_or(Value::Null);
        let log_class = config.option_str("logEntryClass").unwrap_or(DEFAULT_LOG_ENTRY_CLASS);
        let version = next_version(&*uow, log_class, entity.class_name(), &object_id);
        let logged_at = format_timestamp(self.clock.now(), FieldType::DateTime).unwrap_or(Value::Null);

        let entry = Record::new(log_class)
            .with("action", action.as_str())
            .with("loggedAt", logged_at)
            .with("objectId", object_id.clone())
            .with("objectClass", entity.class_name())
            .with("version", version)
            .with("data", data)
            .with("username", self.username.read().clone());

        debug!(class = %class.name, object = %object_id, version, action = action.as_str(), "log entry scheduled");
        uow.schedule_extra_insert(Box::new(entry))?;
        Ok(())
    }
}

impl Default for LoggableListener {
    fn default() -> Self {
        Self::new()
    }
}

impl ExtensionSchema for LoggableListener {
    fn name(&self) -> &'static str {
        NAME
    }

    fn validate(&self, class: &ClassMetadata, config: &ExtensionConfig) -> Result<(), ConfigurationError> {
        if let Some(role) = config.role_names().find(|role| *role != VERSIONED) {
            return Err(ConfigurationError::unknown_role(&class.name, NAME, role));
        }
        if config.has_role(VERSIONED) && !config.option_bool("loggable", false) {
            return Err(ConfigurationError::invalid_option(
                &class.name,
                NAME,
                "loggable",
                "versioned fields require the class to be loggable",
            ));
        }
        if config.option("logEntryClass").is_some_and(|value| !value.is_string()) {
            return Err(ConfigurationError::invalid_option(&class.name, NAME, "logEntryClass", "expected a class name"));
        }

        for field in config.fields_for(VERSIONED) {
            if let Some(association) = class.association_mapping(field) {
                if !association.kind.is_single_valued() {
                    let kind = match association.kind {
                        AssociationKind::OneToMany => "one-to-many association",
                        _ => "many-to-many association",
                    };
                    return Err(ConfigurationError::invalid_field_type(
                        &class.name,
                        NAME,
                        field,
                        kind,
                        "a column or single-valued association",
                    ));
                }
            }
        }
        Ok(())
    }

    fn validate_references(
        &self,
        class: &ClassMetadata,
        config: &ExtensionConfig,
        mappings: &MappingRegistry,
    ) -> Result<(), ConfigurationError> {
        if !config.option_bool("loggable", false) {
            return Ok(());
        }

        let log_class = config.option_str("logEntryClass").unwrap_or(DEFAULT_LOG_ENTRY_CLASS);
        let Some(log_mapping) = mappings.metadata(log_class) else {
            return Err(ConfigurationError::invalid_option(
                &class.name,
                NAME,
                "logEntryClass",
                format!("log entry class '{}' is not mapped", log_class),
            ));
        };
        match LOG_COLUMNS.iter().find(|column| !log_mapping.has_field(column)) {
            Some(column) => Err(ConfigurationError::invalid_option(
                &class.name,
                NAME,
                "logEntryClass",
                format!("log entry class '{}' does not map '{}'", log_class, column),
            )),
            None => Ok(()),
        }
    }
}

impl BehaviorListener for LoggableListener {
    fn subscribed_events(&self) -> &'static [Phase] {
        SUBSCRIBED
    }

    fn handle(&self, event: &mut LifecycleEvent<'_>) -> BehaviorResult<()> {
        let config = event.configuration(NAME)?;
        if !config.option_bool("loggable", false) {
            return Ok(());
        }

        match event.phase() {
            Phase::PostPersist => self.log(event, &config, LogAction::Create),
            Phase::PostUpdate => self.log(event, &config, LogAction::Update),
            Phase::PostRemove => self.log(event, &config, LogAction::Remove),
            _ => Ok(()),
        }
    }
}

fn next_version(uow: &dyn UnitOfWork, log_class: &str, object_class: &str, object_id: &Value) -> i64 {
    let entries = uow.find_by(
        log_class,
        &[("objectClass", Value::from(object_class)), ("objectId", object_id.clone())],
    );
    entries
        .iter()
        .filter_map(|(_, fields)| fields.get("version").and_then(Value::as_i64))
        .max()
        .unwrap_or(0)
        + 1
}

/// Log entries of one object, latest version first
pub fn log_entries(manager: &MemoryObjectManager, log_class: &str, object_class: &str, object_id: &Value) -> Vec<Fields> {
    let mut entries: Vec<Fields> = manager
        .find_by(
            log_class,
            &[("objectClass", Value::from(object_class)), ("objectId", object_id.clone())],
        )
        .into_iter()
        .map(|(_, fields)| fields)
        .collect();
    entries.sort_by_key(|fields| std::cmp::Reverse(fields.get("version").and_then(Value::as_i64).unwrap_or(0)));
    entries
}

/// Restore the logged field values of a managed object as of `version`.
/// The object is changed in memory; the next flush writes it.
pub fn revert(manager: &mut MemoryObjectManager, log_class: &str, oid: ObjectId, version: i64) -> BehaviorResult<()> {
    let (object_class, object_id) = {
        let entity = manager.entity(oid).ok_or(MutationError::UnknownObject(oid.0))?;
        let class = manager
            .metadata()
            .mappings()
            .metadata(entity.class_name())
            .ok_or_else(|| BehaviorError::unmapped(entity.class_name()))?;
        (
            entity.class_name().to_string(),
            entity.field(&class.identifier).unwrap_or(Value::Null),
        )
    };

    let mut entries = log_entries(manager, log_class, &object_class, &object_id);
    entries.retain(|fields| fields.get("version").and_then(Value::as_i64).is_some_and(|v| v <= version));
    if entries.is_empty() {
        return Err(MutationError::rejected(
            object_class,
            format!("no log entries up to version {}", version),
        )
        .into());
    }

    let mut state = Fields::new();
    for entry in entries.iter().rev() {
        if let Some(Value::Object(data)) = entry.get("data") {
            state.extend(data.iter().map(|(field, value)| (field.clone(), value.clone())));
        }
    }

    let entity: &mut dyn Entity = manager
        .entity_mut(oid)
        .ok_or(MutationError::UnknownObject(oid.0))?;
    for (field, value) in state {
        entity.set_field(&field, value)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::RoleDescriptor;

    fn article() -> ClassMetadata {
        ClassMetadata::new("app::Article")
            .field("title", FieldType::String)
            .association("tags", "app::Tag", AssociationKind::ManyToMany, None)
    }

    #[test]
    fn test_versioned_requires_loggable() {
        let listener = LoggableListener::new();
        let config = ExtensionConfig::new().with_role(VERSIONED, RoleDescriptor::new("title"));
        assert!(matches!(
            listener.validate(&article(), &config),
            Err(ConfigurationError::InvalidOption { .. })
        ));

        let config = config.with_option("loggable", true);
        assert!(listener.validate(&article(), &config).is_ok());
    }

    #[test]
    fn test_collections_cannot_be_versioned() {
        let listener = LoggableListener::new();
        let config = ExtensionConfig::new()
            .with_option("loggable", true)
            .with_role(VERSIONED, RoleDescriptor::new("tags"));
        assert!(matches!(
            listener.validate(&article(), &config),
            Err(ConfigurationError::InvalidFieldType { .. })
        ));
    }

    #[test]
    fn test_log_entry_mapping_columns() {
        let mapping = log_entry_mapping("app::ArticleLog");
        for column in LOG_COLUMNS {
            assert!(mapping.has_field(column), "missing column {}", column);
        }
    }

    #[test]
    fn test_log_entry_class_must_be_mapped() {
        let listener = LoggableListener::new();
        let mappings = MappingRegistry::new();
        mappings.register(log_entry_mapping(DEFAULT_LOG_ENTRY_CLASS)).unwrap();
        mappings
            .register(ClassMetadata::new("app::ThinLog").field("action", FieldType::String))
            .unwrap();

        let config = ExtensionConfig::new().with_option("loggable", true);
        assert!(listener.validate_references(&article(), &config, &mappings).is_ok());

        for log_class in ["app::NoSuchLog", "app::ThinLog"] {
            let custom = config.clone().with_option("logEntryClass", log_class);
            assert!(matches!(
                listener.validate_references(&article(), &custom, &mappings),
                Err(ConfigurationError::InvalidOption { option, .. }) if option == "logEntryClass"
            ));
        }
    }
}

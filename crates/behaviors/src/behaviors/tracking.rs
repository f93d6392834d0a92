//! Field tracking behaviors: Timestampable, Blameable and IpTraceable
//!
//! All three share one vocabulary. `create` fields are filled once, when the
//! object is inserted and the field is still blank. `update` fields are
//! refreshed on every update whose change set does not already carry them.
//! `change` fields are refreshed when their tracked field changes, optionally
//! only when it changes to one of the configured `value`s.

use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::trace;

use crate::config::ExtensionsConfig;
use crate::entity::{is_blank, value_to_text, Entity};
use crate::error::{BehaviorResult, ConfigurationError};
use crate::event::{LifecycleEvent, Phase};
use crate::listener::BehaviorListener;
use crate::mapping::{ClassMetadata, ExtensionConfig, ExtensionSchema, FieldType, RoleDescriptor};
use crate::unit_of_work::ChangeSet;

pub const CREATE: &str = "create";
pub const UPDATE: &str = "update";
pub const CHANGE: &str = "change";

const SUBSCRIBED: &[Phase] = &[Phase::LoadClassMetadata, Phase::PrePersist, Phase::PreUpdate];

/// What a tracking listener writes into its fields
pub trait TrackingSource: Send + Sync {
    fn extension(&self) -> &'static str;

    /// Reject fields that cannot hold the tracked value
    fn check_field(&self, class: &ClassMetadata, field: &str) -> Result<(), ConfigurationError>;

    /// Value for `field` right now; `None` leaves the field untouched
    fn current_value(&self, class: &ClassMetadata, field: &str) -> Option<Value>;
}

/// Listener shared by every tracking behavior
pub struct TrackingListener<S> {
    source: S,
}

impl<S: TrackingSource> TrackingListener<S> {
    pub fn with_source(source: S) -> Self {
        Self { source }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    fn on_persist(&self, event: &mut LifecycleEvent<'_>, config: &ExtensionConfig) -> BehaviorResult<()> {
        let class = event.class_metadata()?.clone();
        let (oid, entity, uow) = event.split()?;
        let mut touched = false;

        for descriptor in config.role(CREATE) {
            if is_blank(entity.field(&descriptor.field).as_ref()) {
                touched |= self.write(&class, entity, &descriptor.field)?;
            }
        }

        for descriptor in config.role(CHANGE) {
            let Some(tracked) = descriptor.sources.first() else {
                continue;
            };
            let tracked_value = entity.field(tracked).unwrap_or(Value::Null);
            if tracked_value.is_null() || !value_matches(descriptor, &tracked_value) {
                continue;
            }
            if is_blank(entity.field(&descriptor.field).as_ref()) {
                touched |= self.write(&class, entity, &descriptor.field)?;
            }
        }

        if touched {
            uow.recompute_change_set(&class, oid, &*entity)?;
        }
        Ok(())
    }

    fn on_update(&self, event: &mut LifecycleEvent<'_>, config: &ExtensionConfig) -> BehaviorResult<()> {
        let class = event.class_metadata()?.clone();
        let changes = event.change_set()?;
        let (oid, entity, uow) = event.split()?;
        let mut touched = false;

        for descriptor in config.role(UPDATE) {
            if !changes.contains(&descriptor.field) {
                touched |= self.write(&class, entity, &descriptor.field)?;
            }
        }

        for descriptor in config.role(CHANGE) {
            if changes.contains(&descriptor.field) || !tracked_change_matches(descriptor, &changes) {
                continue;
            }
            touched |= self.write(&class, entity, &descriptor.field)?;
        }

        if touched {
            uow.recompute_change_set(&class, oid, &*entity)?;
        }
        Ok(())
    }

    fn write(&self, class: &ClassMetadata, entity: &mut dyn Entity, field: &str) -> BehaviorResult<bool> {
        let Some(value) = self.source.current_value(class, field) else {
            return Ok(false);
        };
        trace!(class = %class.name, field, extension = self.source.extension(), "tracking field updated");
        entity.set_field(field, value)?;
        Ok(true)
    }
}

impl<S: TrackingSource> ExtensionSchema for TrackingListener<S> {
    fn name(&self) -> &'static str {
        self.source.extension()
    }

    fn validate(&self, class: &ClassMetadata, config: &ExtensionConfig) -> Result<(), ConfigurationError> {
        let extension = self.source.extension();
        for role in config.role_names() {
            if ![CREATE, UPDATE, CHANGE].contains(&role) {
                return Err(ConfigurationError::unknown_role(&class.name, extension, role));
            }
        }

        for (role, descriptor) in config.roles() {
            self.source.check_field(class, &descriptor.field)?;
            match (role, descriptor.sources.len()) {
                (CHANGE, 1) => {}
                (CHANGE, _) => {
                    return Err(ConfigurationError::invalid_option(
                        &class.name,
                        extension,
                        "trackedField",
                        format!("change field '{}' needs exactly one tracked field", descriptor.field),
                    ))
                }
                (_, 0) => {}
                _ => {
                    return Err(ConfigurationError::invalid_option(
                        &class.name,
                        extension,
                        "trackedField",
                        format!("only change fields track another field, '{}' is {}", descriptor.field, role),
                    ))
                }
            }
        }
        Ok(())
    }
}

impl<S: TrackingSource> BehaviorListener for TrackingListener<S> {
    fn subscribed_events(&self) -> &'static [Phase] {
        SUBSCRIBED
    }

    fn handle(&self, event: &mut LifecycleEvent<'_>) -> BehaviorResult<()> {
        let config = event.configuration(self.source.extension())?;
        if config.is_empty() {
            return Ok(());
        }

        match event.phase() {
            Phase::PrePersist => self.on_persist(event, &config),
            Phase::PreUpdate => self.on_update(event, &config),
            _ => Ok(()),
        }
    }
}

fn tracked_change_matches(descriptor: &RoleDescriptor, changes: &ChangeSet) -> bool {
    let Some(change) = descriptor.sources.first().and_then(|tracked| changes.get(tracked)) else {
        return false;
    };
    value_matches(descriptor, &change.new)
}

/// A `change` field without `value` fires on any change of its tracked field
fn value_matches(descriptor: &RoleDescriptor, actual: &Value) -> bool {
    match descriptor.option("value") {
        None => true,
        Some(Value::Array(candidates)) => candidates.iter().any(|candidate| same_value(candidate, actual)),
        Some(expected) => same_value(expected, actual),
    }
}

fn same_value(expected: &Value, actual: &Value) -> bool {
    expected == actual || (value_to_text(expected).is_some() && value_to_text(expected) == value_to_text(actual))
}

fn member_type(class: &ClassMetadata, field: &str) -> Option<FieldType> {
    class.field_mapping(field).map(|mapping| mapping.field_type)
}

/// Source of the current time
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(now) }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock() = now;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock();
        *now = *now + by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Render a point in time for a field of the given type
pub fn format_timestamp(at: DateTime<Utc>, field_type: FieldType) -> Option<Value> {
    match field_type {
        FieldType::DateTime => Some(Value::from(at.to_rfc3339_opts(SecondsFormat::Secs, true))),
        FieldType::Date => Some(Value::from(at.format("%Y-%m-%d").to_string())),
        FieldType::Integer => Some(Value::from(at.timestamp())),
        _ => None,
    }
}

pub struct Timestamps {
    clock: Arc<dyn Clock>,
}

impl TrackingSource for Timestamps {
    fn extension(&self) -> &'static str {
        "timestampable"
    }

    fn check_field(&self, class: &ClassMetadata, field: &str) -> Result<(), ConfigurationError> {
        match member_type(class, field) {
            Some(field_type) if field_type.is_temporal() || field_type == FieldType::Integer => Ok(()),
            Some(field_type) => Err(ConfigurationError::invalid_field_type(
                &class.name,
                self.extension(),
                field,
                field_type.as_str(),
                "date, datetime or integer",
            )),
            None => Err(ConfigurationError::invalid_field_type(
                &class.name,
                self.extension(),
                field,
                "association",
                "date, datetime or integer",
            )),
        }
    }

    fn current_value(&self, class: &ClassMetadata, field: &str) -> Option<Value> {
        format_timestamp(self.clock.now(), member_type(class, field)?)
    }
}

pub type TimestampableListener = TrackingListener<Timestamps>;

impl TrackingListener<Timestamps> {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self::with_source(Timestamps { clock })
    }
}

impl Default for TrackingListener<Timestamps> {
    fn default() -> Self {
        Self::new()
    }
}

/// Current user, written into string fields or single-valued associations
#[derive(Default)]
pub struct Blame {
    user: RwLock<Option<Value>>,
}

impl TrackingSource for Blame {
    fn extension(&self) -> &'static str {
        "blameable"
    }

    fn check_field(&self, class: &ClassMetadata, field: &str) -> Result<(), ConfigurationError> {
        if let Some(association) = class.association_mapping(field) {
            if association.kind.is_single_valued() {
                return Ok(());
            }
        }
        match member_type(class, field) {
            Some(field_type) if field_type.is_textual() => Ok(()),
            other => Err(ConfigurationError::invalid_field_type(
                &class.name,
                self.extension(),
                field,
                other.map(FieldType::as_str).unwrap_or("collection"),
                "string or single-valued association",
            )),
        }
    }

    fn current_value(&self, _class: &ClassMetadata, _field: &str) -> Option<Value> {
        self.user.read().clone()
    }
}

pub type BlameableListener = TrackingListener<Blame>;

impl TrackingListener<Blame> {
    pub fn new() -> Self {
        Self::with_source(Blame::default())
    }

    pub fn from_config(config: &ExtensionsConfig) -> Self {
        let listener = Self::new();
        if let Some(user) = &config.default_username {
            listener.set_user(user.as_str());
        }
        listener
    }

    /// Set the user written by subsequent flushes: a name, or the
    /// identifier of a user object for association fields
    pub fn set_user(&self, user: impl Into<Value>) {
        *self.source.user.write() = Some(user.into());
    }

    pub fn clear_user(&self) {
        *self.source.user.write() = None;
    }
}

impl Default for TrackingListener<Blame> {
    fn default() -> Self {
        Self::new()
    }
}

/// Client address of the current request
#[derive(Default)]
pub struct IpTrace {
    ip: RwLock<Option<String>>,
}

impl TrackingSource for IpTrace {
    fn extension(&self) -> &'static str {
        "ipTraceable"
    }

    fn check_field(&self, class: &ClassMetadata, field: &str) -> Result<(), ConfigurationError> {
        match member_type(class, field) {
            Some(field_type) if field_type.is_textual() => Ok(()),
            other => Err(ConfigurationError::invalid_field_type(
                &class.name,
                self.extension(),
                field,
                other.map(FieldType::as_str).unwrap_or("association"),
                "string",
            )),
        }
    }

    fn current_value(&self, _class: &ClassMetadata, _field: &str) -> Option<Value> {
        self.ip.read().clone().map(Value::from)
    }
}

pub type IpTraceableListener = TrackingListener<IpTrace>;

impl TrackingListener<IpTrace> {
    pub fn new() -> Self {
        Self::with_source(IpTrace::default())
    }

    pub fn from_config(config: &ExtensionsConfig) -> BehaviorResult<Self> {
        let listener = Self::new();
        if let Some(ip) = &config.default_ip {
            listener.set_ip(ip)?;
        }
        Ok(listener)
    }

    /// Set the address written by subsequent flushes; must be IPv4 or IPv6
    pub fn set_ip(&self, ip: &str) -> BehaviorResult<()> {
        let parsed: IpAddr = ip.trim().parse().map_err(|_| {
            ConfigurationError::invalid_option("*", "ipTraceable", "ip", format!("'{}' is not a valid IP address", ip))
        })?;
        *self.source.ip.write() = Some(parsed.to_string());
        Ok(())
    }
}

impl Default for TrackingListener<IpTrace> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn article() -> ClassMetadata {
        ClassMetadata::new("app::Article")
            .field("title", FieldType::String)
            .field("created", FieldType::DateTime)
            .field("day", FieldType::Date)
            .field("stamp", FieldType::Integer)
    }

    #[test]
    fn test_format_timestamp() {
        let at = Utc.with_ymd_and_hms(2024, 5, 17, 10, 30, 0).unwrap();
        assert_eq!(format_timestamp(at, FieldType::DateTime), Some(json!("2024-05-17T10:30:00Z")));
        assert_eq!(format_timestamp(at, FieldType::Date), Some(json!("2024-05-17")));
        assert_eq!(format_timestamp(at, FieldType::Integer), Some(json!(at.timestamp())));
        assert_eq!(format_timestamp(at, FieldType::String), None);
    }

    #[test]
    fn test_timestampable_rejects_string_field() {
        let listener = TimestampableListener::new();
        let config = ExtensionConfig::new().with_role(CREATE, RoleDescriptor::new("title"));
        let result = listener.validate(&article(), &config);
        assert!(matches!(result, Err(ConfigurationError::InvalidFieldType { .. })));
    }

    #[test]
    fn test_change_role_needs_tracked_field() {
        let listener = TimestampableListener::new();
        let config = ExtensionConfig::new().with_role(CHANGE, RoleDescriptor::new("created"));
        assert!(matches!(
            listener.validate(&article(), &config),
            Err(ConfigurationError::InvalidOption { .. })
        ));

        let config = ExtensionConfig::new().with_role("publish", RoleDescriptor::new("created"));
        assert!(matches!(
            listener.validate(&article(), &config),
            Err(ConfigurationError::UnknownRole { .. })
        ));
    }

    #[test]
    fn test_value_matching() {
        let single = RoleDescriptor::new("published").with_sources(["status"]).with_option("value", "live");
        assert!(value_matches(&single, &json!("live")));
        assert!(!value_matches(&single, &json!("draft")));

        let many = RoleDescriptor::new("published")
            .with_sources(["status"])
            .with_option("value", json!(["live", 2]));
        assert!(value_matches(&many, &json!(2)));
        assert!(value_matches(&many, &json!("2")));

        let any = RoleDescriptor::new("changed").with_sources(["title"]);
        assert!(value_matches(&any, &json!("whatever")));
    }

    #[test]
    fn test_ip_validation() {
        let listener = IpTraceableListener::new();
        assert!(listener.set_ip("127.0.0.1").is_ok());
        assert!(listener.set_ip("::1").is_ok());
        assert!(listener.set_ip("not-an-ip").is_err());
    }

    #[test]
    fn test_blameable_from_config() {
        let config = ExtensionsConfig {
            default_username: Some("jules".to_string()),
            ..Default::default()
        };
        let listener = BlameableListener::from_config(&config);
        let class = ClassMetadata::new("app::Article").field("createdBy", FieldType::String);
        assert_eq!(listener.source().current_value(&class, "createdBy"), Some(json!("jules")));

        listener.clear_user();
        assert_eq!(listener.source().current_value(&class, "createdBy"), None);
    }

    #[test]
    fn test_fixed_clock() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let clock = FixedClock::new(start);
        clock.advance(chrono::Duration::hours(1));
        assert_eq!(clock.now(), Utc.with_ymd_and_hms(2024, 1, 1, 1, 0, 0).unwrap());
    }
}

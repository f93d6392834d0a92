use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use elif_behaviors::{
    AttributeReader, BehaviorError, BehaviorListener, BehaviorResult, ChangeSet, ClassMetadata, ExtensionConfig,
    ExtensionSchema, ExtensionsConfig, FieldType, FixedClock, LifecycleEvent, MemoryObjectManager, MutationError,
    Phase, Record, RoleDescriptor, SluggableListener, TimestampableListener,
};
use parking_lot::Mutex;
use serde_json::{json, Value};

fn article() -> ClassMetadata {
    ClassMetadata::new("app::Article")
        .field("title", FieldType::String)
        .field("status", FieldType::String)
        .field("slug", FieldType::String)
        .field("audit", FieldType::String)
        .field("created", FieldType::DateTime)
        .field("updated", FieldType::DateTime)
        .field("published", FieldType::DateTime)
}

fn reader() -> AttributeReader {
    AttributeReader::new()
        .with(
            "app::Article",
            "timestampable",
            ExtensionConfig::new()
                .with_role("create", RoleDescriptor::new("created"))
                .with_role("update", RoleDescriptor::new("updated"))
                .with_role(
                    "change",
                    RoleDescriptor::new("published")
                        .with_sources(["status"])
                        .with_option("value", "published"),
                ),
        )
        .with(
            "app::Article",
            "sluggable",
            ExtensionConfig::new().with_role("slug", RoleDescriptor::new("slug").with_sources(["title"])),
        )
}

fn clock() -> Arc<FixedClock> {
    Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap()))
}

fn stored(manager: &MemoryObjectManager, oid: elif_behaviors::ObjectId, field: &str) -> Value {
    manager
        .row(oid)
        .and_then(|row| row.get(field).cloned())
        .unwrap_or(Value::Null)
}

/// Records the order in which listeners see `prePersist`
struct Probe {
    label: &'static str,
    seen: Arc<Mutex<Vec<&'static str>>>,
}

impl ExtensionSchema for Probe {
    fn name(&self) -> &'static str {
        self.label
    }
}

impl BehaviorListener for Probe {
    fn subscribed_events(&self) -> &'static [Phase] {
        &[Phase::PrePersist]
    }

    fn handle(&self, _event: &mut LifecycleEvent<'_>) -> BehaviorResult<()> {
        self.seen.lock().push(self.label);
        Ok(())
    }
}

/// Schedules the same audit write twice for every update
struct DoubleAudit;

impl ExtensionSchema for DoubleAudit {
    fn name(&self) -> &'static str {
        "doubleAudit"
    }
}

impl BehaviorListener for DoubleAudit {
    fn subscribed_events(&self) -> &'static [Phase] {
        &[Phase::PreUpdate]
    }

    fn handle(&self, event: &mut LifecycleEvent<'_>) -> BehaviorResult<()> {
        let (oid, entity, uow) = event.split()?;
        let old = entity.field("audit").unwrap_or(Value::Null);
        uow.schedule_extra_update(oid, ChangeSet::single("audit", old.clone(), "audited"))?;
        uow.schedule_extra_update(oid, ChangeSet::single("audit", old, "audited"))?;
        Ok(())
    }
}

/// Rejects objects titled "boom"
struct Tripwire;

impl ExtensionSchema for Tripwire {
    fn name(&self) -> &'static str {
        "tripwire"
    }
}

impl BehaviorListener for Tripwire {
    fn subscribed_events(&self) -> &'static [Phase] {
        &[Phase::PrePersist, Phase::PreUpdate]
    }

    fn handle(&self, event: &mut LifecycleEvent<'_>) -> BehaviorResult<()> {
        let entity = event.entity()?;
        if entity.field("title") == Some(json!("boom")) {
            return Err(MutationError::rejected(entity.class_name(), "tripwire").into());
        }
        Ok(())
    }
}

fn manager(clock: Arc<FixedClock>) -> MemoryObjectManager {
    let mut manager = MemoryObjectManager::new(ExtensionsConfig::default(), Arc::new(reader())).unwrap();
    manager.add_listener(Arc::new(TimestampableListener::with_clock(clock)));
    manager.add_listener(Arc::new(SluggableListener::new()));
    manager.register_class(article()).unwrap();
    manager
}

#[test]
fn test_create_is_set_once_and_update_is_not_set_on_insert() {
    let clock = clock();
    let mut manager = manager(clock.clone());

    let oid = manager
        .persist(Record::new("app::Article").with("title", "First").with("status", "draft"))
        .unwrap();
    manager.flush().unwrap();

    assert_eq!(stored(&manager, oid, "created"), json!("2024-01-01T10:00:00Z"));
    assert_eq!(stored(&manager, oid, "updated"), Value::Null);
    assert_eq!(stored(&manager, oid, "published"), Value::Null);

    clock.advance(Duration::hours(1));
    manager.set(oid, "title", "Second").unwrap();
    manager.flush().unwrap();

    assert_eq!(stored(&manager, oid, "created"), json!("2024-01-01T10:00:00Z"));
    assert_eq!(stored(&manager, oid, "updated"), json!("2024-01-01T11:00:00Z"));
    assert_eq!(stored(&manager, oid, "published"), Value::Null);
}

#[test]
fn test_change_field_follows_tracked_value() {
    let clock = clock();
    let mut manager = manager(clock.clone());

    let oid = manager
        .persist(Record::new("app::Article").with("title", "News").with("status", "draft"))
        .unwrap();
    manager.flush().unwrap();

    clock.advance(Duration::minutes(30));
    manager.set(oid, "status", "review").unwrap();
    manager.flush().unwrap();
    assert_eq!(stored(&manager, oid, "published"), Value::Null);

    clock.advance(Duration::minutes(30));
    manager.set(oid, "status", "published").unwrap();
    manager.flush().unwrap();
    assert_eq!(stored(&manager, oid, "published"), json!("2024-01-01T11:00:00Z"));
    assert_eq!(manager.get(oid, "published"), Some(json!("2024-01-01T11:00:00Z")));
}

#[test]
fn test_listeners_run_in_registration_order() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut manager = manager(clock());
    manager.add_listener(Arc::new(Probe {
        label: "first",
        seen: seen.clone(),
    }));
    manager.add_listener(Arc::new(Probe {
        label: "second",
        seen: seen.clone(),
    }));

    let oid = manager.persist(Record::new("app::Article").with("title", "Hello World")).unwrap();
    manager.flush().unwrap();

    assert_eq!(*seen.lock(), vec!["first", "second"]);
    // both behaviors applied in the same flush
    assert_eq!(stored(&manager, oid, "slug"), json!("hello-world"));
    assert_eq!(stored(&manager, oid, "created"), json!("2024-01-01T10:00:00Z"));
}

#[test]
fn test_repeated_extra_update_is_written_once() {
    let mut manager = manager(clock());
    manager.add_listener(Arc::new(DoubleAudit));

    let oid = manager.persist(Record::new("app::Article").with("title", "Audit me")).unwrap();
    manager.flush().unwrap();

    manager.set(oid, "title", "Audited").unwrap();
    let summary = manager.flush().unwrap();

    assert_eq!(summary.updated, 1);
    assert_eq!(summary.extra_writes, 1);
    assert_eq!(stored(&manager, oid, "audit"), json!("audited"));
    assert_eq!(manager.get(oid, "audit"), Some(json!("audited")));
    assert_eq!(manager.flush().unwrap().updated, 0);
}

#[test]
fn test_failed_flush_rolls_back_everything() {
    let mut manager = manager(clock());
    manager.add_listener(Arc::new(Tripwire));

    let good = manager.persist(Record::new("app::Article").with("title", "Fine")).unwrap();
    let bad = manager.persist(Record::new("app::Article").with("title", "boom")).unwrap();

    let err = manager.flush().unwrap_err();
    assert!(matches!(err, BehaviorError::Mutation(MutationError::Rejected { .. })));
    assert!(manager.rows("app::Article").is_empty());
    assert!(manager.get(good, "slug").unwrap_or(Value::Null).is_null());
    assert!(manager.get(good, "created").unwrap_or(Value::Null).is_null());

    manager.set(bad, "title", "Defused").unwrap();
    let summary = manager.flush().unwrap();
    assert_eq!(summary.inserted, 2);
    assert_eq!(stored(&manager, good, "id"), json!(1));
    assert_eq!(stored(&manager, bad, "slug"), json!("defused"));
}

#[test]
fn test_failed_update_keeps_stored_row() {
    let mut manager = manager(clock());
    manager.add_listener(Arc::new(Tripwire));

    let oid = manager.persist(Record::new("app::Article").with("title", "Stable")).unwrap();
    manager.flush().unwrap();

    manager.set(oid, "title", "boom").unwrap();
    assert!(manager.flush().is_err());
    assert_eq!(stored(&manager, oid, "title"), json!("Stable"));
    assert_eq!(stored(&manager, oid, "slug"), json!("stable"));
}

#[test]
fn test_invalid_metadata_fails_class_registration() {
    let reader = AttributeReader::new().with(
        "app::Article",
        "timestampable",
        ExtensionConfig::new().with_role("create", RoleDescriptor::new("title")),
    );
    let mut manager = MemoryObjectManager::new(ExtensionsConfig::default(), Arc::new(reader)).unwrap();
    manager.add_listener(Arc::new(TimestampableListener::new()));

    let err = manager.register_class(article()).unwrap_err();
    assert!(err.is_configuration());
}

//! In-memory object manager driving behavior listeners through a full flush

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::config::ExtensionsConfig;
use crate::entity::{Entity, Fields};
use crate::error::{BehaviorError, BehaviorResult, MutationError};
use crate::event::{LifecycleEvent, Phase};
use crate::listener::{BehaviorListener, EventDispatcher};
use crate::mapping::{ClassMetadata, ExtensionMetadataFactory, MetadataReader};
use crate::unit_of_work::{ObjectId, UnitOfWork};
use super::unit_of_work::{FlushPlan, MemoryUnitOfWork, ObjectState};

/// Counts of a completed flush
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushSummary {
    pub inserted: usize,
    pub updated: usize,
    pub removed: usize,
    pub extra_writes: usize,
}

/// Persistence engine keeping rows in memory.
///
/// Objects are persisted and removed against an identity map and written on
/// [`flush`](Self::flush), which fires the lifecycle phases to every
/// subscribed listener and rolls back completely when any step fails.
pub struct MemoryObjectManager {
    config: ExtensionsConfig,
    factory: Arc<ExtensionMetadataFactory>,
    dispatcher: EventDispatcher,
    uow: MemoryUnitOfWork,
}

impl MemoryObjectManager {
    /// Build a manager with a fresh mapping registry and metadata cache
    pub fn new(config: ExtensionsConfig, reader: Arc<dyn MetadataReader>) -> BehaviorResult<Self> {
        let factory = Arc::new(ExtensionMetadataFactory::from_config(&config, reader)?);
        Ok(Self::with_factory(config, factory))
    }

    /// Build a manager around an existing factory, sharing its registry and cache
    pub fn with_factory(config: ExtensionsConfig, factory: Arc<ExtensionMetadataFactory>) -> Self {
        let uow = MemoryUnitOfWork::new(factory.mappings().clone());
        Self {
            config,
            factory,
            dispatcher: EventDispatcher::new(),
            uow,
        }
    }

    pub fn config(&self) -> &ExtensionsConfig {
        &self.config
    }

    pub fn metadata(&self) -> &Arc<ExtensionMetadataFactory> {
        &self.factory
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    /// Subscribe a listener and register its vocabulary with the factory
    pub fn add_listener<L: BehaviorListener + 'static>(&mut self, listener: Arc<L>) {
        self.factory.register_schema(listener.clone());
        self.dispatcher.subscribe(listener);
    }

    /// Register (or reload) a class mapping and fire `loadClassMetadata`
    pub fn register_class(&mut self, metadata: ClassMetadata) -> BehaviorResult<Arc<ClassMetadata>> {
        let class = self.factory.mappings().register(metadata)?;
        self.load_class(&class)?;
        Ok(class)
    }

    /// Register mappings that refer to each other. Every class is mapped
    /// before the first `loadClassMetadata` fires.
    pub fn register_classes(
        &mut self,
        mappings: impl IntoIterator<Item = ClassMetadata>,
    ) -> BehaviorResult<Vec<Arc<ClassMetadata>>> {
        let classes = mappings
            .into_iter()
            .map(|metadata| self.factory.mappings().register(metadata))
            .collect::<BehaviorResult<Vec<_>>>()?;
        for class in &classes {
            self.load_class(class)?;
        }
        Ok(classes)
    }

    fn load_class(&self, class: &Arc<ClassMetadata>) -> BehaviorResult<()> {
        if self.config.validate_eagerly {
            let mut event = LifecycleEvent::class_loaded(class.clone(), &self.factory);
            self.dispatcher.dispatch(&mut event)?;
        }
        Ok(())
    }

    /// Schedule a new object for insertion
    pub fn persist(&mut self, entity: impl Entity + 'static) -> BehaviorResult<ObjectId> {
        self.persist_boxed(Box::new(entity))
    }

    pub fn persist_boxed(&mut self, entity: Box<dyn Entity>) -> BehaviorResult<ObjectId> {
        let oid = self.uow.attach_new(entity)?;
        debug!(object = %oid, "scheduled insert");
        Ok(oid)
    }

    /// Schedule a managed object for removal
    pub fn remove(&mut self, oid: ObjectId) -> BehaviorResult<()> {
        self.uow.schedule_removal(oid)
    }

    pub fn contains(&self, oid: ObjectId) -> bool {
        self.uow.state(oid).is_some()
    }

    pub fn state(&self, oid: ObjectId) -> Option<ObjectState> {
        self.uow.state(oid)
    }

    pub fn entity(&self, oid: ObjectId) -> Option<&dyn Entity> {
        self.uow.entity(oid)
    }

    pub fn entity_mut(&mut self, oid: ObjectId) -> Option<&mut dyn Entity> {
        self.uow.entity_mut(oid)
    }

    /// Current in-memory value of a field
    pub fn get(&self, oid: ObjectId, field: &str) -> Option<Value> {
        self.uow.entity(oid).and_then(|entity| entity.field(field))
    }

    /// Change a mapped field of a managed object; written on the next flush
    pub fn set(&mut self, oid: ObjectId, field: &str, value: impl Into<Value>) -> BehaviorResult<()> {
        let mappings = self.factory.mappings().clone();
        let entity = self
            .uow
            .entity_mut(oid)
            .ok_or(MutationError::UnknownObject(oid.0))?;
        let class = mappings
            .metadata(entity.class_name())
            .ok_or_else(|| BehaviorError::unmapped(entity.class_name()))?;
        if !class.has_member(field) {
            return Err(MutationError::unknown_field(&class.name, field).into());
        }
        entity.set_field(field, value.into())
    }

    /// Stored row as of the last flush
    pub fn row(&self, oid: ObjectId) -> Option<&Fields> {
        self.uow.row(oid)
    }

    /// Stored rows of a class and its subclasses
    pub fn rows(&self, class: &str) -> Vec<(ObjectId, &Fields)> {
        self.uow.rows_of(class)
    }

    /// Equality lookup over stored and pending state
    pub fn find_by(&self, class: &str, criteria: &[(&str, Value)]) -> Vec<(ObjectId, Fields)> {
        self.uow.find_by(class, criteria)
    }

    /// Load a stored object by identifier. Objects not yet attached are
    /// rehydrated as records and receive `postLoad`.
    pub fn find(&mut self, class: &str, id: impl Into<Value>) -> BehaviorResult<Option<ObjectId>> {
        let Some(oid) = self.uow.lookup(class, &id.into())? else {
            return Ok(None);
        };
        if self.uow.attach_stored(oid) {
            self.dispatch_entity(Phase::PostLoad, oid)?;
        }
        Ok(Some(oid))
    }

    /// Detach every object; stored rows stay
    pub fn clear(&mut self) {
        self.uow.detach_all();
    }

    /// Write every pending change. On failure storage and managed objects
    /// are restored to their state before the call.
    pub fn flush(&mut self) -> BehaviorResult<FlushSummary> {
        let snapshot = self.uow.snapshot();
        match self.run_flush() {
            Ok(summary) => {
                self.uow.finish();
                debug!(
                    inserted = summary.inserted,
                    updated = summary.updated,
                    removed = summary.removed,
                    extra_writes = summary.extra_writes,
                    "flush completed"
                );
                Ok(summary)
            }
            Err(err) => {
                self.uow.restore(snapshot);
                warn!(error = %err, "flush failed, changes rolled back");
                Err(err)
            }
        }
    }

    fn run_flush(&mut self) -> BehaviorResult<FlushSummary> {
        self.uow.plan()?;
        {
            let mut event = LifecycleEvent::flush(&mut self.uow, &self.factory);
            self.dispatcher.dispatch(&mut event)?;
        }

        // onFlush listeners may have touched objects
        let plan = self.uow.plan()?;
        if plan.is_empty() && !self.dispatcher.has_listeners(Phase::OnFlush) {
            return Ok(FlushSummary::default());
        }
        self.run_pre_phases(&plan)?;

        let mut summary = FlushSummary::default();
        for &oid in &plan.inserts {
            self.uow.write_insert(oid)?;
            self.dispatch_entity(Phase::PostPersist, oid)?;
            summary.inserted += 1;
        }
        for &oid in &plan.updates {
            self.uow.write_update(oid)?;
            self.dispatch_entity(Phase::PostUpdate, oid)?;
            summary.updated += 1;
        }
        for &oid in &plan.deletes {
            if self.uow.write_delete(oid) {
                self.dispatch_entity(Phase::PostRemove, oid)?;
                summary.removed += 1;
            }
        }

        summary.extra_writes = self.uow.drain_extras()?;
        Ok(summary)
    }

    fn run_pre_phases(&mut self, plan: &FlushPlan) -> BehaviorResult<()> {
        for &oid in &plan.inserts {
            self.dispatch_entity(Phase::PrePersist, oid)?;
        }
        for &oid in &plan.deletes {
            self.dispatch_entity(Phase::PreRemove, oid)?;
        }
        for &oid in &plan.updates {
            self.dispatch_entity(Phase::PreUpdate, oid)?;
        }
        Ok(())
    }

    fn dispatch_entity(&mut self, phase: Phase, oid: ObjectId) -> BehaviorResult<()> {
        if !self.dispatcher.has_listeners(phase) {
            return Ok(());
        }

        let (class, mut entity) = self.uow.lend(oid)?;
        let result = {
            let mut event = LifecycleEvent::for_entity(phase, class, oid, &mut *entity, &mut self.uow, &self.factory);
            self.dispatcher.dispatch(&mut event)
        };
        self.uow.give_back(oid, entity);
        result
    }
}

impl std::fmt::Debug for MemoryObjectManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryObjectManager")
            .field("config", &self.config)
            .field("listeners", &self.dispatcher.listener_count())
            .field("classes", &self.factory.mappings().class_names())
            .finish()
    }
}

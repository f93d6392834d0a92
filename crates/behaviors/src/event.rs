//! Lifecycle phases and the event handle passed to listeners

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::entity::Entity;
use crate::error::{BehaviorError, BehaviorResult, MutationError};
use crate::mapping::{ClassMetadata, ExtensionConfig, ExtensionMetadataFactory};
use crate::unit_of_work::{ChangeSet, ObjectId, UnitOfWork};

/// Named points of the persistence lifecycle a listener can subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Phase {
    LoadClassMetadata,
    OnFlush,
    PrePersist,
    PostPersist,
    PreUpdate,
    PostUpdate,
    PreRemove,
    PostRemove,
    PostLoad,
}

impl Phase {
    pub const ALL: [Phase; 9] = [
        Phase::LoadClassMetadata,
        Phase::OnFlush,
        Phase::PrePersist,
        Phase::PostPersist,
        Phase::PreUpdate,
        Phase::PostUpdate,
        Phase::PreRemove,
        Phase::PostRemove,
        Phase::PostLoad,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::LoadClassMetadata => "loadClassMetadata",
            Phase::OnFlush => "onFlush",
            Phase::PrePersist => "prePersist",
            Phase::PostPersist => "postPersist",
            Phase::PreUpdate => "preUpdate",
            Phase::PostUpdate => "postUpdate",
            Phase::PreRemove => "preRemove",
            Phase::PostRemove => "postRemove",
            Phase::PostLoad => "postLoad",
        }
    }

    /// Phases that run before the object is written
    pub fn is_pre_write(self) -> bool {
        matches!(self, Phase::PrePersist | Phase::PreUpdate | Phase::PreRemove)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Phase::ALL
            .iter()
            .copied()
            .find(|phase| phase.as_str() == s)
            .ok_or_else(|| format!("Unknown lifecycle phase: {}", s))
    }
}

/// Handle given to a listener for one fired event.
///
/// Which parts are present depends on the phase: `loadClassMetadata` carries
/// only the class, `onFlush` only the unit of work, and per-object phases
/// carry the class, the object and the unit of work.
pub struct LifecycleEvent<'a> {
    phase: Phase,
    class: Option<Arc<ClassMetadata>>,
    target: Option<(ObjectId, &'a mut dyn Entity)>,
    uow: Option<&'a mut dyn UnitOfWork>,
    metadata: &'a ExtensionMetadataFactory,
}

impl<'a> LifecycleEvent<'a> {
    pub fn class_loaded(class: Arc<ClassMetadata>, metadata: &'a ExtensionMetadataFactory) -> Self {
        Self {
            phase: Phase::LoadClassMetadata,
            class: Some(class),
            target: None,
            uow: None,
            metadata,
        }
    }

    pub fn flush(uow: &'a mut dyn UnitOfWork, metadata: &'a ExtensionMetadataFactory) -> Self {
        Self {
            phase: Phase::OnFlush,
            class: None,
            target: None,
            uow: Some(uow),
            metadata,
        }
    }

    pub fn for_entity(
        phase: Phase,
        class: Arc<ClassMetadata>,
        oid: ObjectId,
        entity: &'a mut dyn Entity,
        uow: &'a mut dyn UnitOfWork,
        metadata: &'a ExtensionMetadataFactory,
    ) -> Self {
        Self {
            phase,
            class: Some(class),
            target: Some((oid, entity)),
            uow: Some(uow),
            metadata,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn metadata(&self) -> &'a ExtensionMetadataFactory {
        self.metadata
    }

    pub fn class_metadata(&self) -> BehaviorResult<&Arc<ClassMetadata>> {
        self.class.as_ref().ok_or_else(|| self.missing("class"))
    }

    pub fn object_id(&self) -> BehaviorResult<ObjectId> {
        self.target
            .as_ref()
            .map(|(oid, _)| *oid)
            .ok_or_else(|| self.missing("object"))
    }

    pub fn entity(&self) -> BehaviorResult<&dyn Entity> {
        match &self.target {
            Some((_, entity)) => Ok(&**entity),
            None => Err(self.missing("object")),
        }
    }

    pub fn entity_mut(&mut self) -> BehaviorResult<&mut dyn Entity> {
        let phase = self.phase;
        match &mut self.target {
            Some((_, entity)) => Ok(&mut **entity),
            None => Err(missing_subject(phase, "object")),
        }
    }

    pub fn unit_of_work(&mut self) -> BehaviorResult<&mut dyn UnitOfWork> {
        let phase = self.phase;
        match &mut self.uow {
            Some(uow) => Ok(&mut **uow),
            None => Err(missing_subject(phase, "unit of work")),
        }
    }

    /// Borrow the object and the unit of work at the same time
    pub fn split(&mut self) -> BehaviorResult<(ObjectId, &mut dyn Entity, &mut dyn UnitOfWork)> {
        let phase = self.phase;
        let (oid, entity) = match &mut self.target {
            Some((oid, entity)) => (*oid, &mut **entity),
            None => return Err(missing_subject(phase, "object")),
        };
        let uow = match &mut self.uow {
            Some(uow) => &mut **uow,
            None => return Err(missing_subject(phase, "unit of work")),
        };
        Ok((oid, entity, uow))
    }

    /// Configuration of `extension` for the event's class
    pub fn configuration(&self, extension: &str) -> BehaviorResult<Arc<ExtensionConfig>> {
        let class = self.class_metadata()?;
        self.metadata.extension_metadata(&class.name, extension)
    }

    /// Pending changes of the event's object
    pub fn change_set(&self) -> BehaviorResult<ChangeSet> {
        let oid = self.object_id()?;
        let uow = self.uow.as_ref().ok_or_else(|| self.missing("unit of work"))?;
        Ok(uow.change_set(oid).unwrap_or_default())
    }

    /// Fold mutations made through [`entity_mut`](Self::entity_mut) back into
    /// the object's change set
    pub fn recompute_change_set(&mut self) -> BehaviorResult<()> {
        let class = self.class_metadata()?.clone();
        let (oid, entity, uow) = self.split()?;
        uow.recompute_change_set(&class, oid, &*entity)
    }

    fn missing(&self, subject: &str) -> BehaviorError {
        missing_subject(self.phase, subject)
    }
}

impl fmt::Debug for LifecycleEvent<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleEvent")
            .field("phase", &self.phase)
            .field("class", &self.class.as_ref().map(|class| class.name.as_str()))
            .field("object", &self.target.as_ref().map(|(oid, _)| *oid))
            .field("has_unit_of_work", &self.uow.is_some())
            .finish()
    }
}

fn missing_subject(phase: Phase, subject: &str) -> BehaviorError {
    MutationError::MissingSubject {
        phase: phase.to_string(),
        subject: subject.to_string(),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::{AttributeReader, MappingRegistry, MetadataCache};

    fn factory() -> ExtensionMetadataFactory {
        ExtensionMetadataFactory::new(
            Arc::new(MappingRegistry::new()),
            Arc::new(AttributeReader::new()),
            Arc::new(MetadataCache::new()),
        )
    }

    #[test]
    fn test_phase_names() {
        assert_eq!(Phase::PrePersist.to_string(), "prePersist");
        assert_eq!("loadClassMetadata".parse::<Phase>().unwrap(), Phase::LoadClassMetadata);
        assert!("beforeSave".parse::<Phase>().is_err());
        for phase in Phase::ALL {
            assert_eq!(phase.as_str().parse::<Phase>().unwrap(), phase);
        }
    }

    #[test]
    fn test_class_loaded_event_has_no_object() {
        let factory = factory();
        let class = Arc::new(ClassMetadata::new("app::Article"));
        let mut event = LifecycleEvent::class_loaded(class, &factory);

        assert_eq!(event.phase(), Phase::LoadClassMetadata);
        assert_eq!(event.class_metadata().unwrap().name, "app::Article");
        match event.split() {
            Err(BehaviorError::Mutation(MutationError::MissingSubject { phase, subject })) => {
                assert_eq!(phase, "loadClassMetadata");
                assert_eq!(subject, "object");
            }
            other => panic!("Expected missing subject, got {:?}", other.map(|(oid, _, _)| oid)),
        }
    }
}

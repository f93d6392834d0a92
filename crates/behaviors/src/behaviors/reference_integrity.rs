//! ReferenceIntegrity: guard objects still referenced through a one-to-many
//! association when they are removed

use std::fmt;

use serde_json::Value;
use tracing::debug;

use crate::error::{BehaviorResult, ConfigurationError, MutationError};
use crate::event::{LifecycleEvent, Phase};
use crate::listener::BehaviorListener;
use crate::mapping::{AssociationKind, AssociationMapping, ClassMetadata, ExtensionConfig, ExtensionSchema, RoleDescriptor};
use crate::unit_of_work::ChangeSet;

const NAME: &str = "referenceIntegrity";
pub const REFERENCE: &str = "reference";

const SUBSCRIBED: &[Phase] = &[Phase::LoadClassMetadata, Phase::PreRemove];

/// What happens to referencing objects when the referenced one is removed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityAction {
    /// Clear the back reference on every referencing object
    Nullify,
    /// Refuse the removal while references exist
    Restrict,
}

impl IntegrityAction {
    pub fn parse(action: &str) -> Option<Self> {
        match action {
            "nullify" => Some(Self::Nullify),
            "restrict" => Some(Self::Restrict),
            _ => None,
        }
    }
}

impl fmt::Display for IntegrityAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nullify => f.write_str("nullify"),
            Self::Restrict => f.write_str("restrict"),
        }
    }
}

#[derive(Debug, Default)]
pub struct ReferenceIntegrityListener;

impl ReferenceIntegrityListener {
    pub fn new() -> Self {
        Self
    }

    fn on_remove(&self, event: &mut LifecycleEvent<'_>, config: &ExtensionConfig) -> BehaviorResult<()> {
        let class = event.class_metadata()?.clone();
        let (oid, entity, uow) = event.split()?;
        let id = entity.field(&class.identifier).unwrap_or(Value::Null);
        if id.is_null() {
            return Ok(());
        }

        for descriptor in config.role(REFERENCE) {
            let association = class
                .association_mapping(&descriptor.field)
                .ok_or_else(|| MutationError::unknown_field(&class.name, &descriptor.field))?;
            let action = action_of(descriptor).ok_or_else(|| {
                MutationError::invalid_value(&class.name, &descriptor.field, "unknown reference action")
            })?;
            let mapped_by = mapped_by(descriptor, association).ok_or_else(|| {
                MutationError::invalid_value(&class.name, &descriptor.field, "association has no mappedBy side")
            })?;

            let referencing = uow.find_by(&association.target, &[(mapped_by, id.clone())]);
            if referencing.is_empty() {
                continue;
            }

            match action {
                IntegrityAction::Restrict => {
                    return Err(MutationError::rejected(
                        &class.name,
                        format!(
                            "object {} is still referenced by {} {} through '{}'",
                            oid,
                            referencing.len(),
                            association.target,
                            descriptor.field
                        ),
                    )
                    .into());
                }
                IntegrityAction::Nullify => {
                    for (other, _) in &referencing {
                        uow.schedule_extra_update(*other, ChangeSet::single(mapped_by, id.clone(), Value::Null))?;
                    }
                    debug!(
                        class = %class.name,
                        object = %oid,
                        target = %association.target,
                        count = referencing.len(),
                        "references nullified"
                    );
                }
            }
        }
        Ok(())
    }
}

impl ExtensionSchema for ReferenceIntegrityListener {
    fn name(&self) -> &'static str {
        NAME
    }

    fn validate(&self, class: &ClassMetadata, config: &ExtensionConfig) -> Result<(), ConfigurationError> {
        if let Some(role) = config.role_names().find(|role| *role != REFERENCE) {
            return Err(ConfigurationError::unknown_role(&class.name, NAME, role));
        }

        for descriptor in config.role(REFERENCE) {
            let Some(association) = class.association_mapping(&descriptor.field) else {
                return Err(ConfigurationError::invalid_field_type(
                    &class.name,
                    NAME,
                    &descriptor.field,
                    "column",
                    "a one-to-many association",
                ));
            };
            if association.kind != AssociationKind::OneToMany {
                return Err(ConfigurationError::invalid_field_type(
                    &class.name,
                    NAME,
                    &descriptor.field,
                    format!("{:?}", association.kind),
                    "a one-to-many association",
                ));
            }
            if action_of(descriptor).is_none() {
                return Err(ConfigurationError::invalid_option(
                    &class.name,
                    NAME,
                    "action",
                    format!("'{}' needs an action of nullify or restrict", descriptor.field),
                ));
            }
            if mapped_by(descriptor, association).is_none() {
                return Err(ConfigurationError::invalid_option(
                    &class.name,
                    NAME,
                    "mappedBy",
                    format!("'{}' has no inverse field to follow", descriptor.field),
                ));
            }
        }
        Ok(())
    }
}

impl BehaviorListener for ReferenceIntegrityListener {
    fn subscribed_events(&self) -> &'static [Phase] {
        SUBSCRIBED
    }

    fn handle(&self, event: &mut LifecycleEvent<'_>) -> BehaviorResult<()> {
        let config = event.configuration(NAME)?;
        if !config.has_role(REFERENCE) || event.phase() != Phase::PreRemove {
            return Ok(());
        }
        self.on_remove(event, &config)
    }
}

fn action_of(descriptor: &RoleDescriptor) -> Option<IntegrityAction> {
    descriptor.option_str("action").and_then(IntegrityAction::parse)
}

fn mapped_by<'a>(descriptor: &'a RoleDescriptor, association: &'a AssociationMapping) -> Option<&'a str> {
    descriptor
        .option_str("mappedBy")
        .or(association.mapped_by.as_deref())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn category() -> ClassMetadata {
        ClassMetadata::new("app::Category")
            .association("articles", "app::Article", AssociationKind::OneToMany, Some("category"))
            .association("tags", "app::Tag", AssociationKind::ManyToMany, None)
    }

    #[test]
    fn test_action_parsing() {
        assert_eq!(IntegrityAction::parse("nullify"), Some(IntegrityAction::Nullify));
        assert_eq!(IntegrityAction::parse("restrict"), Some(IntegrityAction::Restrict));
        assert_eq!(IntegrityAction::parse("pull"), None);
        assert_eq!(IntegrityAction::Restrict.to_string(), "restrict");
    }

    #[test]
    fn test_validation() {
        let listener = ReferenceIntegrityListener::new();
        let nullify = ExtensionConfig::new()
            .with_role(REFERENCE, RoleDescriptor::new("articles").with_option("action", "nullify"));
        assert!(listener.validate(&category(), &nullify).is_ok());

        let missing_action = ExtensionConfig::new().with_role(REFERENCE, RoleDescriptor::new("articles"));
        assert!(matches!(
            listener.validate(&category(), &missing_action),
            Err(ConfigurationError::InvalidOption { .. })
        ));

        let many_to_many = ExtensionConfig::new()
            .with_role(REFERENCE, RoleDescriptor::new("tags").with_option("action", "restrict"));
        assert!(matches!(
            listener.validate(&category(), &many_to_many),
            Err(ConfigurationError::InvalidFieldType { .. })
        ));
    }

    #[test]
    fn test_mapped_by_option_overrides_mapping() {
        let class = category();
        let association = class.association_mapping("articles").unwrap();
        let descriptor = RoleDescriptor::new("articles").with_option("mappedBy", "section");
        assert_eq!(mapped_by(&descriptor, association), Some("section"));
        assert_eq!(mapped_by(&RoleDescriptor::new("articles"), association), Some("category"));
    }
}

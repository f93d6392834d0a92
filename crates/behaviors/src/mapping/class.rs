//! Persistence mapping of a class as the host ORM describes it
//!
//! Extension metadata is validated against this mapping: a role may only
//! reference fields or associations that exist here.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Column type of a mapped field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Text,
    Integer,
    Float,
    Boolean,
    Date,
    DateTime,
    Json,
    Uuid,
}

impl FieldType {
    /// Returns true for date and datetime columns
    pub fn is_temporal(self) -> bool {
        matches!(self, Self::Date | Self::DateTime)
    }

    /// Returns true for columns holding free text
    pub fn is_textual(self) -> bool {
        matches!(self, Self::String | Self::Text)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Text => "text",
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Boolean => "boolean",
            Self::Date => "date",
            Self::DateTime => "datetime",
            Self::Json => "json",
            Self::Uuid => "uuid",
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A mapped column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMapping {
    pub name: String,
    pub field_type: FieldType,
    pub nullable: bool,
}

/// Cardinality of an association
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssociationKind {
    ManyToOne,
    OneToOne,
    OneToMany,
    ManyToMany,
}

impl AssociationKind {
    /// Returns true if the owning side stores the referenced identifier
    pub fn is_single_valued(self) -> bool {
        matches!(self, Self::ManyToOne | Self::OneToOne)
    }
}

/// A mapped association to another class
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssociationMapping {
    pub name: String,
    pub target: String,
    pub kind: AssociationKind,
    /// Field on the target class pointing back at this class
    pub mapped_by: Option<String>,
}

/// Mapping of one persistent class
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassMetadata {
    pub name: String,
    pub parent: Option<String>,
    pub identifier: String,
    pub generated_identifier: bool,
    fields: BTreeMap<String, FieldMapping>,
    associations: BTreeMap<String, AssociationMapping>,
}

impl ClassMetadata {
    /// Create a mapping with a generated integer `id` identifier
    pub fn new(name: impl Into<String>) -> Self {
        let mut fields = BTreeMap::new();
        fields.insert(
            "id".to_string(),
            FieldMapping {
                name: "id".to_string(),
                field_type: FieldType::Integer,
                nullable: false,
            },
        );

        Self {
            name: name.into(),
            parent: None,
            identifier: "id".to_string(),
            generated_identifier: true,
            fields,
            associations: BTreeMap::new(),
        }
    }

    /// Declare the parent class this mapping inherits from
    pub fn extends(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    /// Use an application-assigned identifier instead of a generated one
    pub fn assigned_identifier(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.fields.remove(&self.identifier);
        self.identifier = name.into();
        self.generated_identifier = false;
        self.fields.insert(
            self.identifier.clone(),
            FieldMapping {
                name: self.identifier.clone(),
                field_type,
                nullable: false,
            },
        );
        self
    }

    /// Add a nullable column
    pub fn field(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        let name = name.into();
        self.fields.insert(
            name.clone(),
            FieldMapping {
                name,
                field_type,
                nullable: true,
            },
        );
        self
    }

    /// Add a non-nullable column
    pub fn required_field(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        let name = name.into();
        self.fields.insert(
            name.clone(),
            FieldMapping {
                name,
                field_type,
                nullable: false,
            },
        );
        self
    }

    /// Add an association
    pub fn association(
        mut self,
        name: impl Into<String>,
        target: impl Into<String>,
        kind: AssociationKind,
        mapped_by: Option<&str>,
    ) -> Self {
        let name = name.into();
        self.associations.insert(
            name.clone(),
            AssociationMapping {
                name,
                target: target.into(),
                kind,
                mapped_by: mapped_by.map(str::to_string),
            },
        );
        self
    }

    pub fn field_mapping(&self, name: &str) -> Option<&FieldMapping> {
        self.fields.get(name)
    }

    pub fn association_mapping(&self, name: &str) -> Option<&AssociationMapping> {
        self.associations.get(name)
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn has_association(&self, name: &str) -> bool {
        self.associations.contains_key(name)
    }

    /// Whether `name` is a field or an association
    pub fn has_member(&self, name: &str) -> bool {
        self.has_field(name) || self.has_association(name)
    }

    pub fn fields(&self) -> impl Iterator<Item = &FieldMapping> {
        self.fields.values()
    }

    pub fn associations(&self) -> impl Iterator<Item = &AssociationMapping> {
        self.associations.values()
    }

    /// Names persisted in a row: columns plus single-valued associations
    pub fn persisted_members(&self) -> Vec<String> {
        let mut members: Vec<String> = self.fields.keys().cloned().collect();
        members.extend(
            self.associations
                .values()
                .filter(|assoc| assoc.kind.is_single_valued())
                .map(|assoc| assoc.name.clone()),
        );
        members
    }

    /// Copy members from a parent mapping, keeping this class's own on collision
    pub(crate) fn inherit_from(&mut self, parent: &ClassMetadata) {
        for (name, mapping) in &parent.fields {
            self.fields.entry(name.clone()).or_insert_with(|| mapping.clone());
        }
        for (name, mapping) in &parent.associations {
            self.associations
                .entry(name.clone())
                .or_insert_with(|| mapping.clone());
        }
        // identifiers are declared on the root of the hierarchy
        if parent.identifier != self.identifier {
            self.fields.remove(&self.identifier);
            self.identifier = parent.identifier.clone();
        }
        self.generated_identifier = parent.generated_identifier;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_identifier() {
        let meta = ClassMetadata::new("app::Article");
        assert_eq!(meta.identifier, "id");
        assert!(meta.generated_identifier);
        assert!(meta.has_field("id"));
    }

    #[test]
    fn test_members() {
        let meta = ClassMetadata::new("app::Comment")
            .field("message", FieldType::Text)
            .association("article", "app::Article", AssociationKind::ManyToOne, None)
            .association("replies", "app::Reply", AssociationKind::OneToMany, Some("comment"));

        assert!(meta.has_member("message"));
        assert!(meta.has_member("article"));
        assert!(!meta.has_member("missing"));

        let persisted = meta.persisted_members();
        assert!(persisted.contains(&"article".to_string()));
        assert!(!persisted.contains(&"replies".to_string()));
    }

    #[test]
    fn test_inherit_keeps_own_members() {
        let parent = ClassMetadata::new("app::Base")
            .field("created", FieldType::DateTime)
            .field("title", FieldType::Text);
        let mut child = ClassMetadata::new("app::Child")
            .extends("app::Base")
            .field("title", FieldType::String);

        child.inherit_from(&parent);

        assert!(child.has_field("created"));
        assert_eq!(child.field_mapping("title").unwrap().field_type, FieldType::String);
    }
}

//! Normalized extension configuration
//!
//! Every metadata format is read into the same shape: a set of roles, each a
//! list of descriptors naming the field that plays the role, plus class-level
//! options. A class without any declarations yields an empty configuration.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One field playing a role, with its role-specific settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoleDescriptor {
    pub field: String,
    /// Fields the role reads from (slug sources, tracked field)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, Value>,
}

impl RoleDescriptor {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            ..Default::default()
        }
    }

    pub fn with_sources<I, S>(mut self, sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sources = sources.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn option(&self, key: &str) -> Option<&Value> {
        self.options.get(key)
    }

    pub fn option_str(&self, key: &str) -> Option<&str> {
        self.options.get(key).and_then(Value::as_str)
    }

    pub fn option_bool(&self, key: &str, default: bool) -> bool {
        self.options
            .get(key)
            .and_then(Value::as_bool)
            .unwrap_or(default)
    }
}

/// Configuration of one extension for one class
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtensionConfig {
    #[serde(default)]
    roles: BTreeMap<String, Vec<RoleDescriptor>>,
    #[serde(default)]
    options: BTreeMap<String, Value>,
}

impl ExtensionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when the class declares nothing for this extension
    pub fn is_empty(&self) -> bool {
        self.roles.values().all(Vec::is_empty) && self.options.is_empty()
    }

    /// Add a descriptor, replacing an existing one for the same field
    pub fn with_role(mut self, role: impl Into<String>, descriptor: RoleDescriptor) -> Self {
        self.add_role(role, descriptor);
        self
    }

    /// Add a class-level option
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub(crate) fn add_role(&mut self, role: impl Into<String>, descriptor: RoleDescriptor) {
        let descriptors = self.roles.entry(role.into()).or_default();
        match descriptors.iter_mut().find(|d| d.field == descriptor.field) {
            Some(existing) => *existing = descriptor,
            None => descriptors.push(descriptor),
        }
    }

    pub(crate) fn set_option(&mut self, key: impl Into<String>, value: Value) {
        self.options.insert(key.into(), value);
    }

    /// Descriptors declared for a role, empty if none
    pub fn role(&self, role: &str) -> &[RoleDescriptor] {
        self.roles.get(role).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn has_role(&self, role: &str) -> bool {
        !self.role(role).is_empty()
    }

    /// Field names playing a role
    pub fn fields_for(&self, role: &str) -> Vec<&str> {
        self.role(role).iter().map(|d| d.field.as_str()).collect()
    }

    /// Iterate over (role, descriptor) pairs
    pub fn roles(&self) -> impl Iterator<Item = (&str, &RoleDescriptor)> {
        self.roles
            .iter()
            .flat_map(|(role, descriptors)| descriptors.iter().map(move |d| (role.as_str(), d)))
    }

    pub fn role_names(&self) -> impl Iterator<Item = &str> {
        self.roles.keys().map(String::as_str)
    }

    pub fn option(&self, key: &str) -> Option<&Value> {
        self.options.get(key)
    }

    pub fn option_str(&self, key: &str) -> Option<&str> {
        self.options.get(key).and_then(Value::as_str)
    }

    pub fn option_bool(&self, key: &str, default: bool) -> bool {
        self.options
            .get(key)
            .and_then(Value::as_bool)
            .unwrap_or(default)
    }

    /// Merge a subclass configuration on top of this one.
    ///
    /// A descriptor for the same (role, field) and an option with the same key
    /// are replaced by the child's; everything else from the parent stays.
    pub fn merge(&mut self, child: ExtensionConfig) {
        for (role, descriptors) in child.roles {
            for descriptor in descriptors {
                self.add_role(role.clone(), descriptor);
            }
        }
        self.options.extend(child.options);
    }
}

use dashmap::DashMap;

use crate::error::BehaviorResult;
use crate::mapping::class::ClassMetadata;
use crate::mapping::extension::ExtensionConfig;
use super::MetadataReader;

/// Reads declarations attached to classes in code.
///
/// This is the attribute/annotation flavour: the application declares roles
/// next to its types at startup instead of shipping a mapping document.
#[derive(Debug, Default)]
pub struct AttributeReader {
    declarations: DashMap<(String, String), ExtensionConfig>,
}

impl AttributeReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style declaration
    pub fn with(self, class: &str, extension: &str, config: ExtensionConfig) -> Self {
        self.declare(class, extension, config);
        self
    }

    /// Declare roles for a class; repeated declarations are merged
    pub fn declare(&self, class: &str, extension: &str, config: ExtensionConfig) {
        self.declarations
            .entry((class.to_string(), extension.to_string()))
            .or_default()
            .merge(config);
    }

    pub fn declared(&self, class: &str, extension: &str) -> bool {
        self.declarations
            .contains_key(&(class.to_string(), extension.to_string()))
    }
}

impl MetadataReader for AttributeReader {
    fn read(&self, class: &ClassMetadata, extension: &str) -> BehaviorResult<ExtensionConfig> {
        Ok(self
            .declarations
            .get(&(class.name.clone(), extension.to_string()))
            .map(|entry| entry.value().clone())
            .unwrap_or_default())
    }
}

use std::sync::Arc;

use tracing::trace;

use crate::error::BehaviorResult;
use crate::mapping::class::ClassMetadata;
use crate::mapping::extension::ExtensionConfig;
use super::MetadataReader;

/// Delegates to the first reader whose namespace prefix matches the class.
pub struct ChainReader {
    readers: Vec<(String, Arc<dyn MetadataReader>)>,
    default: Option<Arc<dyn MetadataReader>>,
}

impl ChainReader {
    pub fn new() -> Self {
        Self {
            readers: Vec::new(),
            default: None,
        }
    }

    /// Route classes under `namespace` to `reader`
    pub fn add(mut self, namespace: impl Into<String>, reader: Arc<dyn MetadataReader>) -> Self {
        self.readers.push((namespace.into(), reader));
        self
    }

    /// Reader used when no namespace matches
    pub fn with_default(mut self, reader: Arc<dyn MetadataReader>) -> Self {
        self.default = Some(reader);
        self
    }

    fn reader_for(&self, class: &str) -> Option<&Arc<dyn MetadataReader>> {
        self.readers
            .iter()
            .find(|(namespace, _)| class.starts_with(namespace.as_str()))
            .map(|(_, reader)| reader)
            .or(self.default.as_ref())
    }
}

impl Default for ChainReader {
    fn default() -> Self {
        Self::new()
    }
}

impl MetadataReader for ChainReader {
    fn read(&self, class: &ClassMetadata, extension: &str) -> BehaviorResult<ExtensionConfig> {
        match self.reader_for(&class.name) {
            Some(reader) => reader.read(class, extension),
            None => {
                trace!(class = %class.name, "no metadata reader in chain");
                Ok(ExtensionConfig::new())
            }
        }
    }
}

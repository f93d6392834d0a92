//! Extension Metadata Factory - cached, inheritance-aware metadata lookup
//!
//! On a cache miss the factory reads every mapped class of the hierarchy from
//! root to leaf, merges the declarations (child wins per role and field),
//! validates the result against the leaf class mapping and caches it. Empty
//! results are cached too.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::config::ExtensionsConfig;
use crate::error::{BehaviorError, BehaviorResult, ConfigurationError};
use super::cache::{cache_id, FileStore, MetadataCache};
use super::class::ClassMetadata;
use super::extension::ExtensionConfig;
use super::reader::MetadataReader;
use super::registry::MappingRegistry;

/// Vocabulary rules of one extension
pub trait ExtensionSchema: Send + Sync {
    /// Extension name used in cache keys and metadata documents
    fn name(&self) -> &'static str;

    /// Extension-specific checks on a merged, field-checked configuration
    fn validate(&self, _class: &ClassMetadata, _config: &ExtensionConfig) -> Result<(), ConfigurationError> {
        Ok(())
    }

    /// Checks against other mapped classes, run after [`validate`](Self::validate)
    fn validate_references(
        &self,
        _class: &ClassMetadata,
        _config: &ExtensionConfig,
        _mappings: &MappingRegistry,
    ) -> Result<(), ConfigurationError> {
        Ok(())
    }
}

pub struct ExtensionMetadataFactory {
    mappings: Arc<MappingRegistry>,
    reader: Arc<dyn MetadataReader>,
    cache: Arc<MetadataCache>,
    schemas: DashMap<String, Arc<dyn ExtensionSchema>>,
}

impl ExtensionMetadataFactory {
    /// Wire a factory; the cache is subscribed to mapping reloads
    pub fn new(
        mappings: Arc<MappingRegistry>,
        reader: Arc<dyn MetadataReader>,
        cache: Arc<MetadataCache>,
    ) -> Self {
        mappings.subscribe(cache.clone());
        Self {
            mappings,
            reader,
            cache,
            schemas: DashMap::new(),
        }
    }

    /// Build a factory with a fresh registry and a cache set up from `config`
    pub fn from_config(config: &ExtensionsConfig, reader: Arc<dyn MetadataReader>) -> BehaviorResult<Self> {
        let cache = match &config.cache_dir {
            Some(dir) => MetadataCache::with_store(FileStore::new(dir)?),
            None => MetadataCache::new(),
        };
        Ok(Self::new(
            Arc::new(MappingRegistry::new()),
            reader,
            Arc::new(cache),
        ))
    }

    pub fn register_schema(&self, schema: Arc<dyn ExtensionSchema>) {
        self.schemas.insert(schema.name().to_string(), schema);
    }

    pub fn mappings(&self) -> &Arc<MappingRegistry> {
        &self.mappings
    }

    pub fn cache(&self) -> &Arc<MetadataCache> {
        &self.cache
    }

    /// Merged, validated configuration of `extension` for `class`
    pub fn extension_metadata(&self, class: &str, extension: &str) -> BehaviorResult<Arc<ExtensionConfig>> {
        if !self.mappings.is_mapped(class) {
            return Err(BehaviorError::unmapped(class));
        }

        let id = cache_id(class, extension);
        // stored entries may predate a mapping change made between runs
        let current = |stored: &ExtensionConfig| {
            self.mappings
                .metadata(class)
                .is_some_and(|leaf| self.validate(&leaf, extension, stored).is_ok())
        };
        if let Some(config) = self.cache.get_checked(&id, current) {
            return Ok(config);
        }

        let lineage = self.mappings.lineage(class)?;
        let mut config = ExtensionConfig::new();
        for ancestor in &lineage {
            config.merge(self.reader.read(ancestor, extension)?);
        }

        // lineage always ends with the class itself
        let leaf = lineage
            .last()
            .ok_or_else(|| BehaviorError::unmapped(class))?;
        self.validate(leaf, extension, &config)?;

        debug!(
            class,
            extension,
            roles = config.role_names().count(),
            empty = config.is_empty(),
            "read extension metadata"
        );
        Ok(self.cache.put(&id, config))
    }

    /// Read every registered extension for `class`, surfacing errors now
    pub fn load_class_metadata(&self, class: &str) -> BehaviorResult<()> {
        let names: Vec<String> = self.schemas.iter().map(|entry| entry.key().clone()).collect();
        for name in names {
            self.extension_metadata(class, &name)?;
        }
        Ok(())
    }

    fn validate(&self, class: &ClassMetadata, extension: &str, config: &ExtensionConfig) -> Result<(), ConfigurationError> {
        let mut claimed: Vec<(&str, &str)> = Vec::new();

        for (role, descriptor) in config.roles() {
            if !class.has_member(&descriptor.field) {
                return Err(ConfigurationError::missing_field(&class.name, extension, role, &descriptor.field));
            }
            for source in &descriptor.sources {
                if !class.has_member(source) {
                    return Err(ConfigurationError::missing_field(&class.name, extension, role, source));
                }
            }

            if let Some((_, first)) = claimed
                .iter()
                .find(|(field, first)| *field == descriptor.field && *first != role)
            {
                return Err(ConfigurationError::ConflictingRoles {
                    class: class.name.clone(),
                    extension: extension.to_string(),
                    field: descriptor.field.clone(),
                    first: first.to_string(),
                    second: role.to_string(),
                });
            }
            claimed.push((descriptor.field.as_str(), role));
        }

        let schema = self.schemas.get(extension).map(|entry| entry.value().clone());
        match schema {
            Some(schema) if !config.is_empty() => {
                schema.validate(class, config)?;
                schema.validate_references(class, config, &self.mappings)
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::class::FieldType;
    use crate::mapping::extension::RoleDescriptor;
    use crate::mapping::reader::AttributeReader;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingReader {
        inner: AttributeReader,
        reads: AtomicUsize,
    }

    impl MetadataReader for CountingReader {
        fn read(&self, class: &ClassMetadata, extension: &str) -> BehaviorResult<ExtensionConfig> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.inner.read(class, extension)
        }
    }

    fn factory_with(reader: Arc<dyn MetadataReader>) -> ExtensionMetadataFactory {
        ExtensionMetadataFactory::new(
            Arc::new(MappingRegistry::new()),
            reader,
            Arc::new(MetadataCache::new()),
        )
    }

    #[test]
    fn test_second_lookup_hits_cache() {
        let reader = Arc::new(CountingReader {
            inner: AttributeReader::new().with(
                "app::Article",
                "timestampable",
                ExtensionConfig::new().with_role("create", RoleDescriptor::new("created")),
            ),
            reads: AtomicUsize::new(0),
        });
        let factory = factory_with(reader.clone());
        factory
            .mappings()
            .register(ClassMetadata::new("app::Article").field("created", FieldType::DateTime))
            .unwrap();

        let first = factory.extension_metadata("app::Article", "timestampable").unwrap();
        let second = factory.extension_metadata("app::Article", "timestampable").unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(reader.reads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_empty_config_is_cached_too() {
        let reader = Arc::new(CountingReader {
            inner: AttributeReader::new(),
            reads: AtomicUsize::new(0),
        });
        let factory = factory_with(reader.clone());
        factory.mappings().register(ClassMetadata::new("app::Plain")).unwrap();

        assert!(factory.extension_metadata("app::Plain", "sluggable").unwrap().is_empty());
        assert!(factory.extension_metadata("app::Plain", "sluggable").unwrap().is_empty());
        assert_eq!(reader.reads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unmapped_class() {
        let factory = factory_with(Arc::new(AttributeReader::new()));
        let result = factory.extension_metadata("app::Ghost", "timestampable");
        assert!(matches!(result, Err(BehaviorError::UnmappedClass { .. })));
    }

    #[test]
    fn test_missing_field_fails_on_first_read() {
        let reader = AttributeReader::new().with(
            "app::Article",
            "loggable",
            ExtensionConfig::new()
                .with_option("loggable", true)
                .with_role("versioned", RoleDescriptor::new("missingField")),
        );
        let factory = factory_with(Arc::new(reader));
        factory.mappings().register(ClassMetadata::new("app::Article")).unwrap();

        let result = factory.extension_metadata("app::Article", "loggable");
        match result {
            Err(BehaviorError::Configuration(ConfigurationError::MissingField { field, role, .. })) => {
                assert_eq!(field, "missingField");
                assert_eq!(role, "versioned");
            }
            other => panic!("Expected missing field error, got {:?}", other),
        }
        assert!(factory.cache().is_empty());
    }

    #[test]
    fn test_conflicting_roles() {
        let reader = AttributeReader::new().with(
            "app::Article",
            "timestampable",
            ExtensionConfig::new()
                .with_role("create", RoleDescriptor::new("stamp"))
                .with_role("update", RoleDescriptor::new("stamp")),
        );
        let factory = factory_with(Arc::new(reader));
        factory
            .mappings()
            .register(ClassMetadata::new("app::Article").field("stamp", FieldType::DateTime))
            .unwrap();

        let result = factory.extension_metadata("app::Article", "timestampable");
        assert!(matches!(
            result,
            Err(BehaviorError::Configuration(ConfigurationError::ConflictingRoles { .. }))
        ));
    }

    #[test]
    fn test_hierarchy_merge() {
        let reader = AttributeReader::new()
            .with(
                "app::Base",
                "timestampable",
                ExtensionConfig::new()
                    .with_role("create", RoleDescriptor::new("created"))
                    .with_role("change", RoleDescriptor::new("published").with_sources(["status"]).with_option("value", "draft")),
            )
            .with(
                "app::Article",
                "timestampable",
                ExtensionConfig::new()
                    .with_role("change", RoleDescriptor::new("published").with_sources(["status"]).with_option("value", "live")),
            );
        let factory = factory_with(Arc::new(reader));
        factory
            .mappings()
            .register(
                ClassMetadata::new("app::Base")
                    .field("created", FieldType::DateTime)
                    .field("published", FieldType::DateTime)
                    .field("status", FieldType::String),
            )
            .unwrap();
        factory
            .mappings()
            .register(ClassMetadata::new("app::Article").extends("app::Base"))
            .unwrap();

        let config = factory.extension_metadata("app::Article", "timestampable").unwrap();
        assert_eq!(config.fields_for("create"), vec!["created"]);
        assert_eq!(config.role("change")[0].option_str("value"), Some("live"));

        let base = factory.extension_metadata("app::Base", "timestampable").unwrap();
        assert_eq!(base.role("change")[0].option_str("value"), Some("draft"));
    }

    #[test]
    fn test_mapping_reload_invalidates_cache() {
        let reader = Arc::new(CountingReader {
            inner: AttributeReader::new(),
            reads: AtomicUsize::new(0),
        });
        let factory = factory_with(reader.clone());
        factory.mappings().register(ClassMetadata::new("app::Article")).unwrap();

        factory.extension_metadata("app::Article", "sluggable").unwrap();
        factory
            .mappings()
            .register(ClassMetadata::new("app::Article").field("slug", FieldType::String))
            .unwrap();
        factory.extension_metadata("app::Article", "sluggable").unwrap();

        assert_eq!(reader.reads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_schema_validation_runs_for_declared_extensions() {
        struct RejectAll;
        impl ExtensionSchema for RejectAll {
            fn name(&self) -> &'static str {
                "strict"
            }
            fn validate(&self, class: &ClassMetadata, _config: &ExtensionConfig) -> Result<(), ConfigurationError> {
                Err(ConfigurationError::invalid_option(&class.name, "strict", "any", "rejected"))
            }
        }

        let reader = AttributeReader::new().with("app::Declared", "strict", ExtensionConfig::new().with_option("on", true));
        let factory = factory_with(Arc::new(reader));
        factory.register_schema(Arc::new(RejectAll));
        factory.mappings().register(ClassMetadata::new("app::Declared")).unwrap();
        factory.mappings().register(ClassMetadata::new("app::Silent")).unwrap();

        assert!(factory.load_class_metadata("app::Declared").is_err());
        assert!(factory.load_class_metadata("app::Silent").is_ok());
    }
}

//! Extension metadata: class mappings, declarations, merging and caching

pub mod cache;
pub mod class;
pub mod extension;
pub mod factory;
pub mod reader;
pub mod registry;

pub use cache::{cache_id, CacheStats, CacheStore, FileStore, MetadataCache};
pub use class::{AssociationKind, AssociationMapping, ClassMetadata, FieldMapping, FieldType};
pub use extension::{ExtensionConfig, RoleDescriptor};
pub use factory::{ExtensionMetadataFactory, ExtensionSchema};
pub use reader::{AttributeReader, ChainReader, MetadataReader, YamlReader};
pub use registry::{MappingObserver, MappingRegistry};

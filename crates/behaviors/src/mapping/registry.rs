//! Mapping Registry - mapped classes and their resolved ancestor chains
//!
//! The ancestor chain of a class is resolved once, when the class is
//! registered, and stored flat. Re-registering a class counts as a mapping
//! reload: observers (the metadata cache) are told about the class and every
//! class that inherits from it.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::debug;

use crate::error::{BehaviorError, BehaviorResult};
use super::class::ClassMetadata;

/// Receives mapping reload notifications
pub trait MappingObserver: Send + Sync {
    fn mapping_reloaded(&self, class: &str);
}

#[derive(Debug, Clone)]
struct MappedClass {
    declared: ClassMetadata,
    resolved: Arc<ClassMetadata>,
    /// Root-to-leaf, excluding the class itself
    ancestors: Arc<[String]>,
}

/// Thread-safe registry of mapped classes
#[derive(Default)]
pub struct MappingRegistry {
    classes: DashMap<String, MappedClass>,
    observers: RwLock<Vec<Arc<dyn MappingObserver>>>,
}

impl MappingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to mapping reloads
    pub fn subscribe(&self, observer: Arc<dyn MappingObserver>) {
        self.observers.write().push(observer);
    }

    /// Register (or reload) a class mapping.
    ///
    /// The parent, when declared, must already be registered.
    pub fn register(&self, metadata: ClassMetadata) -> BehaviorResult<Arc<ClassMetadata>> {
        let name = metadata.name.clone();
        let reloaded = self.classes.contains_key(&name);

        let mapped = self.resolve(metadata)?;
        let resolved = mapped.resolved.clone();
        self.classes.insert(name.clone(), mapped);
        debug!(class = %name, reloaded, "registered class mapping");

        if reloaded {
            self.reload_descendants(&name)?;
            self.notify(&name);
        }

        Ok(resolved)
    }

    /// Signal that the host dropped its own mapping cache for `class`
    pub fn invalidate(&self, class: &str) {
        self.notify(class);
    }

    pub fn metadata(&self, class: &str) -> Option<Arc<ClassMetadata>> {
        self.classes.get(class).map(|entry| entry.resolved.clone())
    }

    pub fn is_mapped(&self, class: &str) -> bool {
        self.classes.contains_key(class)
    }

    /// Mapped classes from the hierarchy root down to `class` itself
    pub fn lineage(&self, class: &str) -> BehaviorResult<Vec<Arc<ClassMetadata>>> {
        let ancestors = self
            .classes
            .get(class)
            .map(|entry| entry.ancestors.clone())
            .ok_or_else(|| BehaviorError::unmapped(class))?;

        let mut lineage = Vec::with_capacity(ancestors.len() + 1);
        for ancestor in ancestors.iter().map(String::as_str).chain(std::iter::once(class)) {
            let meta = self
                .metadata(ancestor)
                .ok_or_else(|| BehaviorError::unmapped(ancestor))?;
            lineage.push(meta);
        }
        Ok(lineage)
    }

    /// Names of every registered class
    pub fn class_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.classes.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }

    fn resolve(&self, declared: ClassMetadata) -> BehaviorResult<MappedClass> {
        let mut resolved = declared.clone();
        let ancestors: Vec<String> = match &declared.parent {
            Some(parent) => {
                let parent_entry = self
                    .classes
                    .get(parent)
                    .ok_or_else(|| BehaviorError::unmapped(parent.clone()))?;
                resolved.inherit_from(&parent_entry.resolved);
                let mut chain = parent_entry.ancestors.to_vec();
                chain.push(parent.clone());
                chain
            }
            None => Vec::new(),
        };

        Ok(MappedClass {
            declared,
            resolved: Arc::new(resolved),
            ancestors: ancestors.into(),
        })
    }

    fn reload_descendants(&self, class: &str) -> BehaviorResult<()> {
        let mut descendants: Vec<(usize, ClassMetadata)> = self
            .classes
            .iter()
            .filter(|entry| entry.ancestors.iter().any(|a| a == class))
            .map(|entry| (entry.ancestors.len(), entry.declared.clone()))
            .collect();
        // parents before children
        descendants.sort_by_key(|(depth, _)| *depth);

        for (_, declared) in descendants {
            let name = declared.name.clone();
            let mapped = self.resolve(declared)?;
            self.classes.insert(name.clone(), mapped);
            self.notify(&name);
        }
        Ok(())
    }

    fn notify(&self, class: &str) {
        for observer in self.observers.read().iter() {
            observer.mapping_reloaded(class);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::class::FieldType;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingObserver {
        reloaded: Mutex<Vec<String>>,
    }

    impl MappingObserver for RecordingObserver {
        fn mapping_reloaded(&self, class: &str) {
            self.reloaded.lock().push(class.to_string());
        }
    }

    #[test]
    fn test_lineage_is_root_to_leaf() {
        let registry = MappingRegistry::new();
        registry.register(ClassMetadata::new("app::Base")).unwrap();
        registry
            .register(ClassMetadata::new("app::Middle").extends("app::Base"))
            .unwrap();
        registry
            .register(ClassMetadata::new("app::Leaf").extends("app::Middle"))
            .unwrap();

        let names: Vec<String> = registry
            .lineage("app::Leaf")
            .unwrap()
            .iter()
            .map(|meta| meta.name.clone())
            .collect();
        assert_eq!(names, vec!["app::Base", "app::Middle", "app::Leaf"]);
    }

    #[test]
    fn test_unregistered_parent_is_rejected() {
        let registry = MappingRegistry::new();
        let result = registry.register(ClassMetadata::new("app::Orphan").extends("app::Missing"));
        assert!(matches!(result, Err(BehaviorError::UnmappedClass { class }) if class == "app::Missing"));
    }

    #[test]
    fn test_children_inherit_parent_fields() {
        let registry = MappingRegistry::new();
        registry
            .register(ClassMetadata::new("app::Base").field("created", FieldType::DateTime))
            .unwrap();
        let child = registry
            .register(ClassMetadata::new("app::Child").extends("app::Base"))
            .unwrap();
        assert!(child.has_field("created"));
    }

    #[test]
    fn test_reload_notifies_class_and_descendants() {
        let registry = MappingRegistry::new();
        let observer = Arc::new(RecordingObserver::default());
        registry.subscribe(observer.clone());

        registry.register(ClassMetadata::new("app::Base")).unwrap();
        registry
            .register(ClassMetadata::new("app::Child").extends("app::Base"))
            .unwrap();
        assert!(observer.reloaded.lock().is_empty());

        registry
            .register(ClassMetadata::new("app::Base").field("extra", FieldType::String))
            .unwrap();

        let reloaded = observer.reloaded.lock().clone();
        assert!(reloaded.contains(&"app::Base".to_string()));
        assert!(reloaded.contains(&"app::Child".to_string()));
        assert!(registry.metadata("app::Child").unwrap().has_field("extra"));
    }

    #[test]
    fn test_unmapped_lineage() {
        let registry = MappingRegistry::new();
        assert!(registry.lineage("app::Ghost").is_err());
        assert!(!registry.is_mapped("app::Ghost"));
    }
}

//! # elif-behaviors
//!
//! Metadata-driven lifecycle behaviors for elif.rs persistence.
//!
//! ## Features
//!
//! - **Declarative metadata**: roles declared in code or YAML documents, merged
//!   along the class hierarchy and validated once per class
//! - **Metadata cache**: shared, write-once configurations with an optional
//!   file-backed store that survives restarts
//! - **Lifecycle dispatch**: listeners subscribe to flush phases and run in
//!   registration order
//! - **Unit-of-work adapter**: change sets, recomputation, extra updates and
//!   companion inserts inside the same flush
//! - **Behaviors**: timestampable, blameable, ip-traceable, sluggable,
//!   loggable, soft-deleteable, sortable and reference integrity
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use elif_behaviors::{
//!     AttributeReader, ClassMetadata, ExtensionConfig, ExtensionsConfig, FieldType,
//!     MemoryObjectManager, Record, RoleDescriptor, SluggableListener,
//! };
//!
//! let reader = AttributeReader::new().with(
//!     "app::Article",
//!     "sluggable",
//!     ExtensionConfig::new().with_role("slug", RoleDescriptor::new("slug").with_sources(["title"])),
//! );
//! let mut manager = MemoryObjectManager::new(ExtensionsConfig::default(), Arc::new(reader)).unwrap();
//! manager.add_listener(Arc::new(SluggableListener::new()));
//! manager
//!     .register_class(
//!         ClassMetadata::new("app::Article")
//!             .field("title", FieldType::String)
//!             .field("slug", FieldType::String),
//!     )
//!     .unwrap();
//!
//! let oid = manager.persist(Record::new("app::Article").with("title", "Hello World")).unwrap();
//! manager.flush().unwrap();
//! assert_eq!(manager.get(oid, "slug"), Some(serde_json::json!("hello-world")));
//! ```

pub mod behaviors;
pub mod config;
pub mod entity;
pub mod error;
pub mod event;
pub mod listener;
pub mod mapping;
pub mod memory;
pub mod unit_of_work;

pub use behaviors::*;
pub use config::ExtensionsConfig;
pub use entity::{Entity, Fields, Record};
pub use error::{BehaviorError, BehaviorResult, ConfigurationError, MutationError};
pub use event::{LifecycleEvent, Phase};
pub use listener::{BehaviorListener, EventDispatcher};
pub use mapping::*;
pub use memory::{FlushSummary, MemoryObjectManager, MemoryUnitOfWork, ObjectState};
pub use unit_of_work::{ChangeSet, FieldChange, ObjectId, UnitOfWork};

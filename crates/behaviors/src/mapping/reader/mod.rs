//! Metadata readers
//!
//! A reader turns declarations made on one class (never its ancestors) into an
//! [`ExtensionConfig`]. The factory walks the hierarchy and merges the results,
//! so readers stay format-specific and know nothing about inheritance.

mod attribute;
mod chain;
mod yaml;

pub use attribute::AttributeReader;
pub use chain::ChainReader;
pub use yaml::YamlReader;

use crate::error::BehaviorResult;
use super::class::ClassMetadata;
use super::extension::ExtensionConfig;

/// Source of declarative extension metadata
pub trait MetadataReader: Send + Sync {
    /// Declarations made directly on `class` for `extension`.
    ///
    /// Returns an empty configuration when the class declares nothing.
    fn read(&self, class: &ClassMetadata, extension: &str) -> BehaviorResult<ExtensionConfig>;
}

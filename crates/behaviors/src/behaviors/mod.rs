//! Behavior listeners
//!
//! Each listener owns one extension name, validates its vocabulary when a
//! class is loaded and applies its mutation during the flush phases it
//! subscribes to.

pub mod loggable;
pub mod reference_integrity;
pub mod sluggable;
pub mod soft_deleteable;
pub mod sortable;
pub mod tracking;

pub use loggable::{log_entries, log_entry_mapping, revert, LogAction, LoggableListener, DEFAULT_LOG_ENTRY_CLASS};
pub use reference_integrity::{IntegrityAction, ReferenceIntegrityListener};
pub use sluggable::{slugify, SlugStyle, SluggableListener};
pub use soft_deleteable::SoftDeleteableListener;
pub use sortable::SortableListener;
pub use tracking::{
    format_timestamp, Blame, BlameableListener, Clock, FixedClock, IpTrace, IpTraceableListener, SystemClock,
    TimestampableListener, Timestamps, TrackingListener, TrackingSource,
};

use crate::error::BehaviorResult;
use crate::event::LifecycleEvent;
use crate::mapping::ClassMetadata;

/// Root class of the hierarchy `class` belongs to; lookups that must span
/// sibling subclasses are made against it
pub(crate) fn hierarchy_root(event: &LifecycleEvent<'_>, class: &ClassMetadata) -> BehaviorResult<String> {
    let lineage = event.metadata().mappings().lineage(&class.name)?;
    Ok(lineage
        .first()
        .map(|root| root.name.clone())
        .unwrap_or_else(|| class.name.clone()))
}

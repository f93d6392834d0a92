//! In-memory persistence engine
//!
//! A complete implementation of the [`UnitOfWork`](crate::UnitOfWork)
//! contract: identity map, change-set computation, extra insert and update
//! queues, and an atomic flush that fires every lifecycle phase.

pub mod manager;
pub mod unit_of_work;

pub use manager::{FlushSummary, MemoryObjectManager};
pub use unit_of_work::{MemoryUnitOfWork, ObjectState};

//! Behavior listeners and the lifecycle dispatcher

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tracing::trace;

use crate::error::BehaviorResult;
use crate::event::{LifecycleEvent, Phase};
use crate::mapping::ExtensionSchema;

/// A behavior attached to the persistence lifecycle.
///
/// The extension name and metadata vocabulary come from [`ExtensionSchema`].
/// A class without configuration for the listener's extension must be a
/// silent no-op.
pub trait BehaviorListener: ExtensionSchema {
    /// Phases this listener wants to receive
    fn subscribed_events(&self) -> &'static [Phase];

    fn handle(&self, event: &mut LifecycleEvent<'_>) -> BehaviorResult<()>;
}

/// Owns phase -> ordered subscribers; listeners run in registration order
#[derive(Clone, Default)]
pub struct EventDispatcher {
    listeners: Vec<Arc<dyn BehaviorListener>>,
    by_phase: HashMap<Phase, Vec<Arc<dyn BehaviorListener>>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, listener: Arc<dyn BehaviorListener>) {
        let phases: BTreeSet<Phase> = listener.subscribed_events().iter().copied().collect();
        for phase in phases {
            self.by_phase.entry(phase).or_default().push(listener.clone());
        }
        self.listeners.push(listener);
    }

    pub fn listeners(&self) -> &[Arc<dyn BehaviorListener>] {
        &self.listeners
    }

    pub fn listeners_for(&self, phase: Phase) -> &[Arc<dyn BehaviorListener>] {
        self.by_phase.get(&phase).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn has_listeners(&self, phase: Phase) -> bool {
        !self.listeners_for(phase).is_empty()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Hand the event to every subscriber of its phase; the first error stops
    /// the dispatch and is returned unchanged
    pub fn dispatch(&self, event: &mut LifecycleEvent<'_>) -> BehaviorResult<()> {
        for listener in self.listeners_for(event.phase()) {
            trace!(phase = %event.phase(), listener = listener.name(), "dispatching lifecycle event");
            listener.handle(event)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{BehaviorError, MutationError};
    use crate::mapping::{AttributeReader, ClassMetadata, ExtensionMetadataFactory, MappingRegistry, MetadataCache};
    use parking_lot::Mutex;

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    impl ExtensionSchema for Recorder {
        fn name(&self) -> &'static str {
            self.name
        }
    }

    impl BehaviorListener for Recorder {
        fn subscribed_events(&self) -> &'static [Phase] {
            &[Phase::LoadClassMetadata, Phase::PrePersist, Phase::LoadClassMetadata]
        }

        fn handle(&self, event: &mut LifecycleEvent<'_>) -> BehaviorResult<()> {
            self.log.lock().push(format!("{}:{}", self.name, event.phase()));
            if self.fail {
                return Err(MutationError::rejected("app::Article", "refused").into());
            }
            Ok(())
        }
    }

    fn factory() -> ExtensionMetadataFactory {
        ExtensionMetadataFactory::new(
            Arc::new(MappingRegistry::new()),
            Arc::new(AttributeReader::new()),
            Arc::new(MetadataCache::new()),
        )
    }

    #[test]
    fn test_dispatch_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = EventDispatcher::new();
        for name in ["timestampable", "sluggable"] {
            dispatcher.subscribe(Arc::new(Recorder { name, log: log.clone(), fail: false }));
        }

        let factory = factory();
        let mut event = LifecycleEvent::class_loaded(Arc::new(ClassMetadata::new("app::Article")), &factory);
        dispatcher.dispatch(&mut event).unwrap();

        assert_eq!(
            *log.lock(),
            vec!["timestampable:loadClassMetadata", "sluggable:loadClassMetadata"]
        );
        assert_eq!(dispatcher.listeners_for(Phase::LoadClassMetadata).len(), 2);
        assert!(!dispatcher.has_listeners(Phase::PostLoad));
    }

    #[test]
    fn test_first_error_stops_dispatch() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = EventDispatcher::new();
        dispatcher.subscribe(Arc::new(Recorder { name: "first", log: log.clone(), fail: true }));
        dispatcher.subscribe(Arc::new(Recorder { name: "second", log: log.clone(), fail: false }));

        let factory = factory();
        let mut event = LifecycleEvent::class_loaded(Arc::new(ClassMetadata::new("app::Article")), &factory);
        let result = dispatcher.dispatch(&mut event);

        assert!(matches!(result, Err(BehaviorError::Mutation(MutationError::Rejected { .. }))));
        assert_eq!(*log.lock(), vec!["first:loadClassMetadata"]);
        assert_eq!(dispatcher.listener_count(), 2);
    }
}

//! Flight class registry
//!
//! Steps and retry rules are plain Rust values, not serializable, so a
//! flight recovered from the journal after a process restart needs some way
//! to rebuild its step list and retry rules from just the `class_name`
//! stored on the row. Callers register a factory per class name once at
//! startup; the registry is then the single place
//! [`crate::engine::Stairway`] looks up "how do I build this flight class"
//! whether the flight was just submitted or is being recovered.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::retry::RetryRule;
use crate::step::Step;

/// One step paired with the retry rule that governs it. `FlightRunner::new`
/// requires the two vectors built from this to be the same length.
pub type StepWithRetry = (Arc<dyn Step>, Box<dyn RetryRule>);

/// Builds a fresh, ordered step list for a flight class, each step paired
/// with its own fresh retry rule instance. Called once per flight
/// instantiation — the returned steps and rules are owned by that flight's
/// runner for its lifetime, never shared across concurrent flights.
pub type FlightFactory = Arc<dyn Fn() -> Vec<StepWithRetry> + Send + Sync>;

/// Name-keyed registry of flight class factories.
#[derive(Default)]
pub struct FlightRegistry {
    factories: RwLock<HashMap<String, FlightFactory>>,
}

impl FlightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory for `class_name`, replacing any existing one.
    pub fn register(&self, class_name: impl Into<String>, factory: FlightFactory) {
        self.factories.write().insert(class_name.into(), factory);
    }

    /// Look up the factory for `class_name`, registering `default_factory`
    /// under that name first if none exists yet. Returns the resolved
    /// factory either way.
    pub fn find_or_create(
        &self,
        class_name: &str,
        default_factory: impl FnOnce() -> FlightFactory,
    ) -> FlightFactory {
        if let Some(existing) = self.factories.read().get(class_name) {
            return existing.clone();
        }
        let mut factories = self.factories.write();
        factories
            .entry(class_name.to_string())
            .or_insert_with(default_factory)
            .clone()
    }

    /// Build the steps and retry rules for `class_name`, if a factory is
    /// registered, split into the two vectors `FlightRunner::new` expects.
    pub fn build(&self, class_name: &str) -> Option<(Vec<Arc<dyn Step>>, Vec<Box<dyn RetryRule>>)> {
        let factory = self.factories.read().get(class_name)?.clone();
        let (steps, rules) = factory().into_iter().unzip();
        Some((steps, rules))
    }

    pub fn list(&self) -> Vec<String> {
        self.factories.read().keys().cloned().collect()
    }

    pub fn delete(&self, class_name: &str) -> bool {
        self.factories.write().remove(class_name).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::FlightContext;
    use crate::retry::NoRetry;
    use crate::step::StepResult;
    use async_trait::async_trait;

    struct NoopStep;

    #[async_trait]
    impl Step for NoopStep {
        async fn do_(&self, _ctx: &mut FlightContext) -> StepResult {
            StepResult::success()
        }
    }

    fn noop_factory() -> FlightFactory {
        Arc::new(|| {
            vec![(
                Arc::new(NoopStep) as Arc<dyn Step>,
                Box::new(NoRetry) as Box<dyn RetryRule>,
            )]
        })
    }

    #[test]
    fn register_then_build_returns_steps() {
        let registry = FlightRegistry::new();
        registry.register("OrderFlight", noop_factory());
        let (steps, rules) = registry.build("OrderFlight").unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(rules.len(), 1);
    }

    #[test]
    fn build_returns_none_for_unknown_class() {
        let registry = FlightRegistry::new();
        assert!(registry.build("Missing").is_none());
    }

    #[test]
    fn find_or_create_registers_default_once() {
        let registry = FlightRegistry::new();
        registry.find_or_create("OrderFlight", noop_factory);
        registry.find_or_create("OrderFlight", || {
            panic!("default factory should not be called again")
        });
        assert_eq!(registry.list(), vec!["OrderFlight".to_string()]);
    }

    #[test]
    fn delete_removes_class() {
        let registry = FlightRegistry::new();
        registry.register("OrderFlight", noop_factory());
        assert!(registry.delete("OrderFlight"));
        assert!(!registry.delete("OrderFlight"));
        assert!(registry.list().is_empty());
    }
}

//! Lifecycle hooks
//!
//! Hooks observe flight lifecycle events without participating in the
//! do/undo state machine. Two registration styles compose: *static* hooks
//! run for every flight regardless of class, and *dynamic* hooks are
//! resolved per flight by a caller-supplied factory keyed on class name —
//! the same factory-closure shape [`crate::registry::FlightRegistry`] uses
//! for steps.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::context::{FlightContext, FlightStatus};
use crate::step::StepResult;

/// Outcome of invoking a hook. `Continue` is the common case; `Unknown`
/// carries forward an action tag a newer hook implementation emitted that
/// this version of the crate does not recognize, so callers can log it
/// rather than silently drop it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookAction {
    Continue,
    Unknown(String),
}

impl Default for HookAction {
    fn default() -> Self {
        Self::Continue
    }
}

/// Observer of flight lifecycle events.
///
/// Every method has a default no-op body; implementers override only the
/// events they care about.
#[async_trait]
pub trait StairwayHook: Send + Sync {
    async fn start_flight(&self, ctx: &FlightContext) -> HookAction {
        let _ = ctx;
        HookAction::Continue
    }

    async fn end_flight(&self, ctx: &FlightContext) -> HookAction {
        let _ = ctx;
        HookAction::Continue
    }

    async fn start_step(&self, ctx: &FlightContext, step_class: &str) -> HookAction {
        let _ = (ctx, step_class);
        HookAction::Continue
    }

    async fn end_step(&self, ctx: &FlightContext, step_class: &str, result: &StepResult) -> HookAction {
        let _ = (ctx, step_class, result);
        HookAction::Continue
    }

    async fn state_transition(
        &self,
        ctx: &FlightContext,
        from: FlightStatus,
        to: FlightStatus,
    ) -> HookAction {
        let _ = (ctx, from, to);
        HookAction::Continue
    }
}

/// Factory resolving a class name to a hook instance, or `None` if it has
/// nothing to attach for that class.
pub type DynamicHookFactory = Arc<dyn Fn(&str) -> Option<Arc<dyn StairwayHook>> + Send + Sync>;

/// Aggregates static and dynamic hooks and fans every lifecycle event out to
/// all of them in registration order.
#[derive(Clone, Default)]
pub struct HookWrapper {
    static_hooks: Vec<Arc<dyn StairwayHook>>,
    dynamic_factories: Vec<DynamicHookFactory>,
}

impl fmt::Debug for HookWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookWrapper")
            .field("static_hooks", &self.static_hooks.len())
            .field("dynamic_factories", &self.dynamic_factories.len())
            .finish()
    }
}

impl HookWrapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_static_hook(mut self, hook: Arc<dyn StairwayHook>) -> Self {
        self.static_hooks.push(hook);
        self
    }

    pub fn with_dynamic_factory(mut self, factory: DynamicHookFactory) -> Self {
        self.dynamic_factories.push(factory);
        self
    }

    fn resolve(&self, class_name: &str) -> Vec<Arc<dyn StairwayHook>> {
        let mut hooks = self.static_hooks.clone();
        for factory in &self.dynamic_factories {
            if let Some(hook) = factory(class_name) {
                hooks.push(hook);
            }
        }
        hooks
    }

    /// Fold the first non-`Continue` result into the overall outcome while
    /// still invoking every hook; no hook can abort another's invocation.
    fn fold(results: Vec<HookAction>) -> HookAction {
        results
            .into_iter()
            .find(|action| !matches!(action, HookAction::Continue))
            .unwrap_or(HookAction::Continue)
    }

    pub async fn start_flight(&self, ctx: &FlightContext) -> HookAction {
        let mut results = Vec::new();
        for hook in self.resolve(&ctx.class_name) {
            results.push(hook.start_flight(ctx).await);
        }
        Self::fold(results)
    }

    pub async fn end_flight(&self, ctx: &FlightContext) -> HookAction {
        let mut results = Vec::new();
        for hook in self.resolve(&ctx.class_name) {
            results.push(hook.end_flight(ctx).await);
        }
        Self::fold(results)
    }

    pub async fn start_step(&self, ctx: &FlightContext, step_class: &str) -> HookAction {
        let mut results = Vec::new();
        for hook in self.resolve(&ctx.class_name) {
            results.push(hook.start_step(ctx, step_class).await);
        }
        Self::fold(results)
    }

    pub async fn end_step(&self, ctx: &FlightContext, step_class: &str, result: &StepResult) -> HookAction {
        let mut results = Vec::new();
        for hook in self.resolve(&ctx.class_name) {
            results.push(hook.end_step(ctx, step_class, result).await);
        }
        Self::fold(results)
    }

    pub async fn state_transition(
        &self,
        ctx: &FlightContext,
        from: FlightStatus,
        to: FlightStatus,
    ) -> HookAction {
        let mut results = Vec::new();
        for hook in self.resolve(&ctx.class_name) {
            results.push(hook.state_transition(ctx, from, to).await);
        }
        Self::fold(results)
    }
}

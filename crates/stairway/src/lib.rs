//! # Stairway
//!
//! An embeddable durable workflow engine.
//!
//! Callers register a long-running business operation as a **flight**: an
//! ordered sequence of **steps**, each with a forward operation (`do`) and a
//! compensating operation (`undo`). The engine journals every step attempt
//! to a shared relational store, so a flight whose host process dies can be
//! resumed on another engine instance with no work lost or duplicated beyond
//! what step contracts allow. Multiple engine instances share one store and,
//! optionally, a cluster-wide work queue, forming a horizontally scalable
//! pool of workers.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Stairway                             │
//! │   (admission, worker pool, recovery orchestration)           │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!              ┌───────────────┼────────────────┐
//!              ▼               ▼                ▼
//! ┌────────────────────┐ ┌───────────┐ ┌──────────────────────┐
//! │     FlightRunner     │ │  Journal  │ │   QueueTransport     │
//! │ (do/undo/switch loop)│ │ (Postgres │ │  (optional cluster   │
//! │                      │ │ or memory)│ │     dispatch)        │
//! └────────────────────┘ └───────────┘ └──────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use stairway::prelude::*;
//!
//! struct ChargeCard;
//!
//! #[async_trait::async_trait]
//! impl Step for ChargeCard {
//!     async fn do_(&self, ctx: &mut FlightContext) -> StepResult {
//!         // call the payment gateway, record a token in the working map
//!         StepResult::success()
//!     }
//!
//!     async fn undo(&self, ctx: &mut FlightContext) -> StepResult {
//!         // issue a refund for the token recorded above
//!         StepResult::success()
//!     }
//! }
//! ```

pub mod codec;
pub mod context;
pub mod engine;
pub mod filter;
pub mod hook;
pub mod instance;
pub mod journal;
pub mod queue;
pub mod registry;
pub mod retry;
pub mod runner;
pub mod step;

/// Prelude for common imports
pub mod prelude {
    pub use crate::codec::{
        ExceptionCodec, JsonExceptionCodec, JsonObjectCodec, ObjectCodec, ObjectCodecExt,
    };
    pub use crate::context::{Direction, FlightContext, FlightStatus, ParamMap};
    pub use crate::engine::{EngineError, Stairway, StairwayConfig};
    pub use crate::filter::{FlightFilter, InputPredicate, PageToken, Pagination};
    pub use crate::hook::{HookAction, HookWrapper, StairwayHook};
    pub use crate::instance::{InMemoryInstanceRegistry, InstanceError, InstanceRegistry, PostgresInstanceRegistry};
    pub use crate::journal::{
        FlightRow, FlightState, FlightSummary, InMemoryJournal, Journal, JournalError,
        LogEntry, PostgresJournal,
    };
    pub use crate::queue::{InMemoryQueueTransport, QueueError, QueueTransport, WorkQueueManager};
    pub use crate::registry::{FlightFactory, FlightRegistry, StepWithRetry};
    pub use crate::retry::{ExponentialBackoff, FixedInterval, NoRetry, RandomBackoff, RetryRule};
    pub use crate::runner::{FlightRunner, RunnerError};
    pub use crate::step::{FlightDebugInfo, Step, StepResult, StepStatus};
}

// Re-export key types at crate root
pub use codec::{ExceptionCodec, JsonExceptionCodec, JsonObjectCodec, ObjectCodec, ObjectCodecExt};
pub use context::{Direction, FlightContext, FlightStatus, ParamMap};
pub use engine::{EngineError, Stairway, StairwayConfig};
pub use filter::{FlightFilter, InputPredicate, PageToken, Pagination};
pub use hook::{HookAction, HookWrapper, StairwayHook};
pub use instance::{InMemoryInstanceRegistry, InstanceError, InstanceRegistry, PostgresInstanceRegistry};
pub use journal::{
    FlightRow, FlightState, FlightSummary, InMemoryJournal, Journal, JournalError, LogEntry,
    PostgresJournal,
};
pub use queue::{InMemoryQueueTransport, QueueError, QueueTransport, WorkQueueManager};
pub use registry::{FlightFactory, FlightRegistry, StepWithRetry};
pub use retry::{ExponentialBackoff, FixedInterval, NoRetry, RandomBackoff, RetryRule};
pub use runner::{FlightRunner, RunnerError};
pub use step::{FlightDebugInfo, Step, StepResult, StepStatus};

/// Crate-level error composing every component's error type.
///
/// Component boundaries (journal, runner, engine, queue) keep their own
/// `thiserror` enums; this is only the façade-level umbrella returned from
/// [`Stairway`] public methods.
#[derive(Debug, thiserror::Error)]
pub enum StairwayError {
    #[error(transparent)]
    Journal(#[from] JournalError),

    #[error(transparent)]
    Runner(#[from] RunnerError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("duplicate flight id: {0}")]
    DuplicateFlightId(String),
}

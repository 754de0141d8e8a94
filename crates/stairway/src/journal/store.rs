//! The `Journal` trait: durable record of every flight and step attempt.
//!
//! A journal is the single source of truth for flight ownership, status, and
//! history. Every mutating method that changes ownership or status executes
//! inside a serializable transaction so that two engine instances racing to
//! claim the same flight cannot both succeed (invariant 1). `append_log` is
//! append-only: existing rows are never edited or removed (invariant 3).

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::context::{Direction, FlightStatus};
use crate::filter::{FlightFilter, PageToken, Pagination};
use crate::step::{FlightDebugInfo, StepResult};

#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    #[error("flight not found: {0}")]
    NotFound(String),

    #[error("flight {flight_id} is owned by {actual:?}, not {expected:?}")]
    OwnershipConflict {
        flight_id: String,
        expected: String,
        actual: Option<String>,
    },

    #[error("flight {0} already exists")]
    AlreadyExists(String),

    #[error("serialization failure, retry: {0}")]
    SerializationConflict(String),

    #[error("invalid page token: {0}")]
    InvalidPageToken(#[from] crate::filter::PageTokenError),

    #[error("backend error: {0}")]
    Backend(String),
}

/// One row in the append-only step log for a flight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// Monotonically increasing within a flight; the journal assigns this.
    pub sequence: i64,
    pub step_index: isize,
    pub direction: Direction,
    /// Whether this attempt was a rerun (the step returned `RERUN` on a
    /// prior attempt), carried from `FlightContext.rerun` at the moment the
    /// entry was written.
    pub rerun: bool,
    pub attempt: u32,
    pub result: StepResult,
    /// Working-map snapshot captured at the moment this entry was written.
    /// Reconstruction reads this back from the entry with the maximum
    /// `log_time` for the flight (§4.1).
    pub working: BTreeMap<String, String>,
    pub recorded_at: DateTime<Utc>,
}

/// Status, direction, and step index — the piece of a flight's state that
/// changes on every advance, as distinct from its immutable identity fields.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FlightState {
    pub status: FlightStatus,
    pub direction: Direction,
    pub step_index: isize,
}

/// Full row for a single flight, as needed to reconstruct a
/// [`crate::context::FlightContext`] during recovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlightRow {
    pub flight_id: String,
    pub class_name: String,
    pub input: BTreeMap<String, String>,
    pub persisted: BTreeMap<String, String>,
    pub debug_info: FlightDebugInfo,
    pub state: FlightState,
    pub owner: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Lightweight projection used by listing and recovery scans, omitting the
/// parameter maps and log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlightSummary {
    pub flight_id: String,
    pub class_name: String,
    pub status: FlightStatus,
    pub owner: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A page of [`FlightSummary`] rows plus a token for the next page, if any.
#[derive(Debug, Clone)]
pub struct FlightPage {
    pub items: Vec<FlightSummary>,
    pub next: Option<PageToken>,
}

/// Durable store of flight state and history.
///
/// Implementations must serialize ownership-changing operations
/// (`claim_owner`, `release_owner`) against concurrent callers for the same
/// `flight_id` — the store, not the caller, is the arbiter of single
/// ownership.
#[async_trait]
pub trait Journal: Send + Sync {
    /// Run schema setup. Safe to call repeatedly (`CREATE TABLE IF NOT
    /// EXISTS`-style idempotence).
    async fn initialize(&self) -> Result<(), JournalError>;

    /// Create a new flight row in `RUNNING` status, owned by `owner`, with
    /// direction `START` and step index `0`. Fails with `AlreadyExists` if
    /// `flight_id` is already present (idempotent submission guard).
    async fn create_flight(
        &self,
        flight_id: &str,
        class_name: &str,
        owner: &str,
        input: BTreeMap<String, String>,
        debug_info: FlightDebugInfo,
    ) -> Result<FlightRow, JournalError>;

    /// Atomically take ownership of a flight currently in a resumable
    /// status (`WAITING`, `READY`, `QUEUED`, `READY_TO_RESTART`), setting its
    /// status to `RUNNING`. Rejects with `OwnershipConflict` if the flight is
    /// already owned or is in a terminal status.
    async fn claim_owner(&self, flight_id: &str, owner: &str) -> Result<FlightRow, JournalError>;

    /// Append one log entry, including a snapshot of the working map at the
    /// moment of the attempt. The journal assigns `sequence` as the next
    /// value after the highest already recorded for this flight.
    #[allow(clippy::too_many_arguments)]
    async fn append_log(
        &self,
        flight_id: &str,
        owner: &str,
        step_index: isize,
        direction: Direction,
        rerun: bool,
        attempt: u32,
        result: StepResult,
        working: BTreeMap<String, String>,
    ) -> Result<LogEntry, JournalError>;

    /// Overwrite the persisted parameter map. Independent of step logging:
    /// callable any number of times between log entries.
    async fn flush_persisted(
        &self,
        flight_id: &str,
        owner: &str,
        persisted: BTreeMap<String, String>,
    ) -> Result<(), JournalError>;

    /// Update status/direction/step index while still owned by `owner`.
    async fn update_state(
        &self,
        flight_id: &str,
        owner: &str,
        state: FlightState,
        error: Option<String>,
    ) -> Result<(), JournalError>;

    /// Release ownership, transitioning to a terminal or resumable status.
    /// A direct `RUNNING` → `QUEUED` release without an intervening
    /// `WAITING`/`READY` step is rejected (invariant 6).
    async fn release_owner(
        &self,
        flight_id: &str,
        owner: &str,
        state: FlightState,
        error: Option<String>,
    ) -> Result<(), JournalError>;

    /// Load a full row, for recovery or direct inspection.
    async fn load(&self, flight_id: &str) -> Result<Option<FlightRow>, JournalError>;

    /// Load the append-only log for a flight, in sequence order.
    async fn load_log(&self, flight_id: &str) -> Result<Vec<LogEntry>, JournalError>;

    /// Summaries of flights owned by no one, in a resumable status, whose
    /// `updated_at` is older than `stale_before` — candidates for recovery.
    async fn list_recoverable(
        &self,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<FlightSummary>, JournalError>;

    /// List flights matching `filter`, paginated by `page`.
    async fn list(
        &self,
        filter: &FlightFilter,
        page: Pagination,
    ) -> Result<FlightPage, JournalError>;

    /// Permanently remove a flight and its log. Allowed regardless of
    /// status (invariant 2 only protects terminal flights from further
    /// mutation, not from deletion).
    async fn delete(&self, flight_id: &str) -> Result<bool, JournalError>;

    /// Permanently remove every completed flight (`SUCCESS`/`ERROR`/`FATAL`)
    /// whose `updated_at` is older than `older_than`. Used by the optional
    /// retention sweeper; a missing retention config means this is never
    /// called and flights are retained forever.
    async fn delete_completed_before(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<u64, JournalError>;

    /// Atomically transition every `RUNNING` flight owned by `old_owner` to
    /// `READY` with no owner. Used by `recoverAndStart` to reclaim work left
    /// behind by an instance that vanished without releasing ownership.
    /// Callers also delete `old_owner` from the instance registry once this
    /// returns, so the two stores stay in step. Returns the affected flight
    /// ids.
    async fn disown_recovery(&self, old_owner: &str) -> Result<Vec<String>, JournalError>;

    /// Flight ids with no owner in status `READY` or `READY_TO_RESTART` —
    /// candidates the engine resumes locally or deflects to the cluster
    /// queue on startup. Unlike `list_recoverable`, `WAITING` flights are
    /// excluded: those wait on an external `resume` call, not a scan.
    async fn get_ready_flights(&self) -> Result<Vec<String>, JournalError>;

    /// Transition an unowned `READY` flight to `QUEUED`, the second half of
    /// submit's READY-then-QUEUED sequence (§4.8): the row is left `READY`
    /// until the queue publish has actually happened, so a crash between the
    /// two finds the flight still `READY` and therefore still recoverable.
    /// Rejects any other starting status.
    async fn mark_queued(&self, flight_id: &str) -> Result<(), JournalError>;

    /// Drop and recreate all engine-owned storage. Only meaningful for
    /// backends with persistent schema; idempotent like `initialize`.
    async fn reset(&self) -> Result<(), JournalError>;
}

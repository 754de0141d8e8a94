//! Flight context and parameter maps
//!
//! [`FlightContext`] holds the in-memory state of a running flight: its
//! identity, the immutable input map, the mutable working and persisted
//! maps, the current step index/direction/rerun flag, the last step result,
//! and the flight's status. It is owned by exactly one runner task for the
//! duration of its execution — no synchronization is needed, which is why
//! every method here takes `&mut self` rather than sharing behind a lock.

use std::collections::BTreeMap;

use serde::{de::DeserializeOwned, Serialize};

use crate::codec::{CodecError, ObjectCodec, ObjectCodecExt};
use crate::step::FlightDebugInfo;

/// Phase of the flight state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    /// Not yet advanced past creation.
    Start,
    /// Forward progress through the step list.
    Do,
    /// Compensation, walking the step list backward.
    Undo,
    /// The one-shot transition from doing to undoing the current step.
    Switch,
}

/// Flight status, as stored on the flight row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlightStatus {
    Running,
    Success,
    Error,
    Fatal,
    Waiting,
    Ready,
    Queued,
    ReadyToRestart,
}

impl FlightStatus {
    /// Terminal statuses are immutable except for deletion (invariant 2).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Error | Self::Fatal)
    }

    /// Statuses from which `resume` may take ownership.
    pub fn is_resumable(&self) -> bool {
        matches!(
            self,
            Self::Waiting | Self::Ready | Self::Queued | Self::ReadyToRestart
        )
    }
}

impl std::fmt::Display for FlightStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Running => "RUNNING",
            Self::Success => "SUCCESS",
            Self::Error => "ERROR",
            Self::Fatal => "FATAL",
            Self::Waiting => "WAITING",
            Self::Ready => "READY",
            Self::Queued => "QUEUED",
            Self::ReadyToRestart => "READY_TO_RESTART",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("cannot mutate a sealed parameter map")]
    Sealed,
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// A string-keyed container of already-serialized values.
///
/// Input maps are sealed immutable at construction (invariant 4). Working
/// and persisted maps stay mutable for the lifetime of the owning runner.
#[derive(Debug, Clone, Default)]
pub struct ParamMap {
    values: BTreeMap<String, String>,
    sealed: bool,
    dirty: bool,
}

impl ParamMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Construct an already-sealed map, e.g. for input parameters.
    pub fn sealed(values: BTreeMap<String, String>) -> Self {
        Self {
            values,
            sealed: true,
            dirty: false,
        }
    }

    /// Reconstruct a mutable map from a previously persisted snapshot, e.g.
    /// when recovering a flight's persisted map. Not dirty: nothing has
    /// changed since this snapshot was read from the journal.
    pub fn restored(values: BTreeMap<String, String>) -> Self {
        Self {
            values,
            sealed: false,
            dirty: false,
        }
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub fn raw(&self) -> &BTreeMap<String, String> {
        &self.values
    }

    pub fn get<T: DeserializeOwned>(
        &self,
        codec: &dyn ObjectCodec,
        key: &str,
    ) -> Option<Result<T, CodecError>> {
        self.values.get(key).map(|raw| codec.decode(raw))
    }

    pub fn get_raw(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn put<T: Serialize>(
        &mut self,
        codec: &dyn ObjectCodec,
        key: impl Into<String>,
        value: &T,
    ) -> Result<(), ContextError> {
        if self.sealed {
            return Err(ContextError::Sealed);
        }
        let encoded = codec.encode(value)?;
        self.values.insert(key.into(), encoded);
        self.dirty = true;
        Ok(())
    }

    pub fn put_raw(&mut self, key: impl Into<String>, value: impl Into<String>) -> Result<(), ContextError> {
        if self.sealed {
            return Err(ContextError::Sealed);
        }
        self.values.insert(key.into(), value.into());
        self.dirty = true;
        Ok(())
    }

    /// Whether the map has been mutated since the last flush. The persisted
    /// map flushes to the journal whenever this is true, independently of
    /// step logging (§4.3).
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    pub fn seal(&mut self) {
        self.sealed = true;
    }
}

/// In-memory state of a running flight.
pub struct FlightContext {
    pub flight_id: String,
    pub class_name: String,
    input: ParamMap,
    pub working: ParamMap,
    pub persisted: ParamMap,
    /// Current step index. Signed so an undo pass can walk past zero to
    /// signal completion (termination predicate: finished iff `< 0`).
    pub step_index: isize,
    pub direction: Direction,
    pub rerun: bool,
    pub last_result: Option<crate::step::StepResult>,
    pub status: FlightStatus,
    step_count: usize,
    pub debug_info: FlightDebugInfo,
}

impl FlightContext {
    pub fn new(
        flight_id: impl Into<String>,
        class_name: impl Into<String>,
        input: ParamMap,
        step_count: usize,
        debug_info: FlightDebugInfo,
    ) -> Self {
        Self {
            flight_id: flight_id.into(),
            class_name: class_name.into(),
            input,
            working: ParamMap::new(),
            persisted: ParamMap::new(),
            step_index: 0,
            direction: Direction::Start,
            rerun: false,
            last_result: None,
            status: FlightStatus::Running,
            step_count,
            debug_info,
        }
    }

    pub fn input(&self) -> &ParamMap {
        &self.input
    }

    pub fn step_count(&self) -> usize {
        self.step_count
    }

    /// Advance direction/index one step, per the transition table in §4.3:
    /// `START` → `DO`, index 0; `DO` increments; `UNDO` decrements; `SWITCH`
    /// leaves the index unchanged (undo the step that just failed). If
    /// `rerun` is set, advance is a no-op regardless of direction.
    pub fn advance(&mut self) {
        if self.rerun {
            return;
        }
        match self.direction {
            Direction::Start => {
                self.direction = Direction::Do;
                self.step_index = 0;
            }
            Direction::Do => self.step_index += 1,
            Direction::Undo => self.step_index -= 1,
            Direction::Switch => {}
        }
    }

    /// Flip from doing to undoing the step that just produced a non-success
    /// result, leaving the index pointed at that step.
    pub fn switch(&mut self) {
        self.direction = Direction::Switch;
    }

    /// Whether there is a step left to execute in the current direction.
    pub fn have_step_to_do(&self) -> bool {
        match self.direction {
            Direction::Start => true,
            Direction::Do | Direction::Switch => (self.step_index as usize) < self.step_count,
            Direction::Undo => self.step_index >= 0,
        }
    }

    /// Whether the current step is the last one in the do direction — used
    /// by `FlightDebugInfo::last_step_failure`.
    pub fn is_final_do_step(&self) -> bool {
        self.direction == Direction::Do
            && self.step_index >= 0
            && self.step_index as usize + 1 == self.step_count
    }

    pub fn current_step_index(&self) -> usize {
        self.step_index.max(0) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_from_start_enters_do_at_zero() {
        let mut ctx = FlightContext::new("f1", "Class", ParamMap::new(), 3, FlightDebugInfo::default());
        ctx.advance();
        assert_eq!(ctx.direction, Direction::Do);
        assert_eq!(ctx.step_index, 0);
    }

    #[test]
    fn advance_do_increments_undo_decrements() {
        let mut ctx = FlightContext::new("f1", "Class", ParamMap::new(), 3, FlightDebugInfo::default());
        ctx.advance(); // -> Do, 0
        ctx.advance();
        assert_eq!(ctx.step_index, 1);

        ctx.direction = Direction::Undo;
        ctx.advance();
        assert_eq!(ctx.step_index, 0);
    }

    #[test]
    fn switch_leaves_index_unchanged() {
        let mut ctx = FlightContext::new("f1", "Class", ParamMap::new(), 3, FlightDebugInfo::default());
        ctx.direction = Direction::Do;
        ctx.step_index = 2;
        ctx.switch();
        ctx.advance();
        assert_eq!(ctx.step_index, 2);
        assert_eq!(ctx.direction, Direction::Switch);
    }

    #[test]
    fn rerun_suppresses_advance() {
        let mut ctx = FlightContext::new("f1", "Class", ParamMap::new(), 3, FlightDebugInfo::default());
        ctx.direction = Direction::Do;
        ctx.step_index = 1;
        ctx.rerun = true;
        ctx.advance();
        assert_eq!(ctx.step_index, 1);
        assert_eq!(ctx.direction, Direction::Do);
    }

    #[test]
    fn termination_predicates() {
        let mut ctx = FlightContext::new("f1", "Class", ParamMap::new(), 2, FlightDebugInfo::default());
        ctx.direction = Direction::Do;
        ctx.step_index = 2;
        assert!(!ctx.have_step_to_do());

        ctx.direction = Direction::Undo;
        ctx.step_index = -1;
        assert!(!ctx.have_step_to_do());
        ctx.step_index = 0;
        assert!(ctx.have_step_to_do());
    }

    #[test]
    fn input_map_is_sealed() {
        let mut values = BTreeMap::new();
        values.insert("k".to_string(), "v".to_string());
        let input = ParamMap::sealed(values);
        let ctx = FlightContext::new("f1", "Class", input, 1, FlightDebugInfo::default());
        assert!(ctx.input().is_sealed());
        assert_eq!(ctx.input().get_raw("k"), Some("v"));
    }

    #[test]
    fn working_map_tracks_dirty_flag() {
        let mut ctx = FlightContext::new("f1", "Class", ParamMap::new(), 1, FlightDebugInfo::default());
        assert!(!ctx.working.is_dirty());
        ctx.working.put_raw("progress", "50%").unwrap();
        assert!(ctx.working.is_dirty());
        ctx.working.clear_dirty();
        assert!(!ctx.working.is_dirty());
    }
}

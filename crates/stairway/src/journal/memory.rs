//! In-memory `Journal`, for tests and single-process demos.
//!
//! Not for production use: state is lost on process exit and there is no
//! cross-process ownership arbitration. Concurrency within one process is
//! still correct — all mutation goes through a single `parking_lot::Mutex`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use crate::context::{Direction, FlightStatus};
use crate::filter::{FlightFilter, PageToken, Pagination};
use crate::step::{FlightDebugInfo, StepResult};

use super::store::{FlightPage, FlightRow, FlightState, FlightSummary, Journal, JournalError, LogEntry};

struct Record {
    row: FlightRow,
    log: Vec<LogEntry>,
}

/// `Journal` backed by an in-process `HashMap`.
#[derive(Default)]
pub struct InMemoryJournal {
    flights: Mutex<std::collections::HashMap<String, Record>>,
}

impl InMemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Journal for InMemoryJournal {
    async fn initialize(&self) -> Result<(), JournalError> {
        Ok(())
    }

    async fn create_flight(
        &self,
        flight_id: &str,
        class_name: &str,
        owner: &str,
        input: BTreeMap<String, String>,
        debug_info: FlightDebugInfo,
    ) -> Result<FlightRow, JournalError> {
        let mut flights = self.flights.lock();
        if flights.contains_key(flight_id) {
            return Err(JournalError::AlreadyExists(flight_id.to_string()));
        }
        let now = Utc::now();
        let row = FlightRow {
            flight_id: flight_id.to_string(),
            class_name: class_name.to_string(),
            input,
            persisted: BTreeMap::new(),
            debug_info,
            state: FlightState {
                status: FlightStatus::Running,
                direction: Direction::Start,
                step_index: 0,
            },
            owner: Some(owner.to_string()),
            error: None,
            created_at: now,
            updated_at: now,
        };
        flights.insert(
            flight_id.to_string(),
            Record {
                row: row.clone(),
                log: Vec::new(),
            },
        );
        Ok(row)
    }

    async fn claim_owner(&self, flight_id: &str, owner: &str) -> Result<FlightRow, JournalError> {
        let mut flights = self.flights.lock();
        let record = flights
            .get_mut(flight_id)
            .ok_or_else(|| JournalError::NotFound(flight_id.to_string()))?;
        if record.row.owner.is_some() || !record.row.state.status.is_resumable() {
            return Err(JournalError::OwnershipConflict {
                flight_id: flight_id.to_string(),
                expected: owner.to_string(),
                actual: record.row.owner.clone(),
            });
        }
        record.row.owner = Some(owner.to_string());
        record.row.state.status = FlightStatus::Running;
        record.row.updated_at = Utc::now();
        Ok(record.row.clone())
    }

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
    ) -> Result<LogEntry, JournalError> {
        let mut flights = self.flights.lock();
        let record = flights
            .get_mut(flight_id)
            .ok_or_else(|| JournalError::NotFound(flight_id.to_string()))?;
        assert_owner(&record.row, flight_id, owner)?;
        let sequence = record.log.last().map(|e| e.sequence + 1).unwrap_or(0);
        let entry = LogEntry {
            sequence,
            step_index,
            direction,
            rerun,
            attempt,
            result,
            working,
            recorded_at: Utc::now(),
        };
        record.log.push(entry.clone());
        record.row.updated_at = Utc::now();
        Ok(entry)
    }

    async fn flush_persisted(
        &self,
        flight_id: &str,
        owner: &str,
        persisted: BTreeMap<String, String>,
    ) -> Result<(), JournalError> {
        let mut flights = self.flights.lock();
        let record = flights
            .get_mut(flight_id)
            .ok_or_else(|| JournalError::NotFound(flight_id.to_string()))?;
        assert_owner(&record.row, flight_id, owner)?;
        record.row.persisted = persisted;
        record.row.updated_at = Utc::now();
        Ok(())
    }

    async fn update_state(
        &self,
        flight_id: &str,
        owner: &str,
        state: FlightState,
        error: Option<String>,
    ) -> Result<(), JournalError> {
        let mut flights = self.flights.lock();
        let record = flights
            .get_mut(flight_id)
            .ok_or_else(|| JournalError::NotFound(flight_id.to_string()))?;
        assert_owner(&record.row, flight_id, owner)?;
        record.row.state = state;
        record.row.error = error;
        record.row.updated_at = Utc::now();
        Ok(())
    }

    async fn release_owner(
        &self,
        flight_id: &str,
        owner: &str,
        state: FlightState,
        error: Option<String>,
    ) -> Result<(), JournalError> {
        let mut flights = self.flights.lock();
        let record = flights
            .get_mut(flight_id)
            .ok_or_else(|| JournalError::NotFound(flight_id.to_string()))?;
        assert_owner(&record.row, flight_id, owner)?;
        if record.row.state.status == FlightStatus::Running && state.status == FlightStatus::Queued
        {
            return Err(JournalError::OwnershipConflict {
                flight_id: flight_id.to_string(),
                expected: "WAITING or READY before QUEUED".to_string(),
                actual: Some(record.row.state.status.to_string()),
            });
        }
        record.row.state = state;
        record.row.error = error;
        record.row.owner = None;
        record.row.updated_at = Utc::now();
        Ok(())
    }

    async fn load(&self, flight_id: &str) -> Result<Option<FlightRow>, JournalError> {
        Ok(self.flights.lock().get(flight_id).map(|r| r.row.clone()))
    }

    async fn load_log(&self, flight_id: &str) -> Result<Vec<LogEntry>, JournalError> {
        let flights = self.flights.lock();
        let record = flights
            .get(flight_id)
            .ok_or_else(|| JournalError::NotFound(flight_id.to_string()))?;
        Ok(record.log.clone())
    }

    async fn list_recoverable(
        &self,
        stale_before: chrono::DateTime<Utc>,
    ) -> Result<Vec<FlightSummary>, JournalError> {
        let flights = self.flights.lock();
        Ok(flights
            .values()
            .filter(|r| {
                r.row.owner.is_none()
                    && r.row.state.status.is_resumable()
                    && r.row.updated_at < stale_before
            })
            .map(|r| summarize(&r.row))
            .collect())
    }

    async fn list(
        &self,
        filter: &FlightFilter,
        page: Pagination,
    ) -> Result<FlightPage, JournalError> {
        let flights = self.flights.lock();
        let mut matching: Vec<&Record> = flights
            .values()
            .filter(|r| {
                filter.matches_class(&r.row.class_name)
                    && filter.matches_status(r.row.state.status)
                    && filter.matches_created(r.row.created_at)
                    && filter
                        .input_predicate
                        .as_ref()
                        .is_none_or(|p| p.matches(&r.row.input))
            })
            .collect();
        matching.sort_by(|a, b| {
            (a.row.created_at, &a.row.flight_id).cmp(&(b.row.created_at, &b.row.flight_id))
        });

        let start = match &page.after {
            Some(cursor) => matching
                .iter()
                .position(|r| cursor.is_after(r.row.created_at, &r.row.flight_id))
                .unwrap_or(matching.len()),
            None => 0,
        };

        let page_size = page.page_size as usize;
        let slice: Vec<FlightSummary> = matching[start..]
            .iter()
            .take(page_size)
            .map(|r| summarize(&r.row))
            .collect();

        let next = if slice.is_empty() {
            // Nothing matched this poll: still mint a cursor so a caller
            // that keeps polling with the returned token makes forward
            // progress instead of rescanning from the same point forever.
            Some(PageToken::now_empty(Utc::now()))
        } else if start + slice.len() < matching.len() {
            slice.last().map(|last| PageToken {
                last_created_at: last.created_at,
                last_flight_id: Some(last.flight_id.clone()),
            })
        } else {
            None
        };

        Ok(FlightPage { items: slice, next })
    }

    async fn delete(&self, flight_id: &str) -> Result<bool, JournalError> {
        Ok(self.flights.lock().remove(flight_id).is_some())
    }

    async fn delete_completed_before(
        &self,
        older_than: chrono::DateTime<Utc>,
    ) -> Result<u64, JournalError> {
        let mut flights = self.flights.lock();
        let before = flights.len();
        flights.retain(|_, record| {
            !(record.row.state.status.is_terminal() && record.row.updated_at < older_than)
        });
        Ok((before - flights.len()) as u64)
    }

    async fn disown_recovery(&self, old_owner: &str) -> Result<Vec<String>, JournalError> {
        let mut flights = self.flights.lock();
        let mut released = Vec::new();
        for (flight_id, record) in flights.iter_mut() {
            if record.row.owner.as_deref() == Some(old_owner)
                && record.row.state.status == FlightStatus::Running
            {
                record.row.state.status = FlightStatus::Ready;
                record.row.owner = None;
                record.row.updated_at = Utc::now();
                released.push(flight_id.clone());
            }
        }
        Ok(released)
    }

    async fn get_ready_flights(&self) -> Result<Vec<String>, JournalError> {
        let flights = self.flights.lock();
        Ok(flights
            .values()
            .filter(|r| {
                r.row.owner.is_none()
                    && matches!(
                        r.row.state.status,
                        FlightStatus::Ready | FlightStatus::ReadyToRestart
                    )
            })
            .map(|r| r.row.flight_id.clone())
            .collect())
    }

    async fn mark_queued(&self, flight_id: &str) -> Result<(), JournalError> {
        let mut flights = self.flights.lock();
        let record = flights
            .get_mut(flight_id)
            .ok_or_else(|| JournalError::NotFound(flight_id.to_string()))?;
        if record.row.owner.is_some() || record.row.state.status != FlightStatus::Ready {
            return Err(JournalError::OwnershipConflict {
                flight_id: flight_id.to_string(),
                expected: "unowned READY".to_string(),
                actual: record.row.owner.clone(),
            });
        }
        record.row.state.status = FlightStatus::Queued;
        record.row.updated_at = Utc::now();
        Ok(())
    }

    async fn reset(&self) -> Result<(), JournalError> {
        self.flights.lock().clear();
        Ok(())
    }
}

fn assert_owner(row: &FlightRow, flight_id: &str, owner: &str) -> Result<(), JournalError> {
    if row.owner.as_deref() != Some(owner) {
        return Err(JournalError::OwnershipConflict {
            flight_id: flight_id.to_string(),
            expected: owner.to_string(),
            actual: row.owner.clone(),
        });
    }
    Ok(())
}

fn summarize(row: &FlightRow) -> FlightSummary {
    FlightSummary {
        flight_id: row.flight_id.clone(),
        class_name: row.class_name.clone(),
        status: row.state.status,
        owner: row.owner.clone(),
        created_at: row.created_at,
        updated_at: row.updated_at,
    }
}

//! Postgres-backed `Journal`.
//!
//! Ownership transitions run inside `SERIALIZABLE` transactions so that two
//! engine instances racing `claim_owner` on the same flight cannot both
//! succeed: one commits, the other hits `40001` and is surfaced as
//! [`JournalError::SerializationConflict`] for the caller to retry or skip.
//!
//! Input, persisted, and working parameters live in side tables keyed by
//! `(flight_id, key)` (or `(flight_id, sequence, key)` for the working-map
//! snapshots) rather than JSONB blobs, so a listing filter can be lowered to
//! an indexed `EXISTS` subquery instead of a JSONB scan.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool, Row};

use crate::context::{Direction, FlightStatus};
use crate::filter::{FlightFilter, InputPredicate, PageToken, Pagination};
use crate::step::{FlightDebugInfo, StepResult};

use super::store::{FlightPage, FlightRow, FlightState, FlightSummary, Journal, JournalError, LogEntry};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS stairway_flights (
    flight_id    TEXT PRIMARY KEY,
    class_name   TEXT NOT NULL,
    status       TEXT NOT NULL,
    direction    TEXT NOT NULL,
    step_index   BIGINT NOT NULL,
    owner        TEXT,
    debug_info   JSONB NOT NULL DEFAULT '{}'::jsonb,
    error        TEXT,
    created_at   TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at   TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS stairway_flight_input (
    flight_id    TEXT NOT NULL REFERENCES stairway_flights(flight_id) ON DELETE CASCADE,
    key          TEXT NOT NULL,
    value        TEXT NOT NULL,
    PRIMARY KEY (flight_id, key)
);

CREATE TABLE IF NOT EXISTS stairway_flight_persisted (
    flight_id    TEXT NOT NULL REFERENCES stairway_flights(flight_id) ON DELETE CASCADE,
    key          TEXT NOT NULL,
    value        TEXT NOT NULL,
    PRIMARY KEY (flight_id, key)
);

CREATE TABLE IF NOT EXISTS stairway_log (
    flight_id    TEXT NOT NULL REFERENCES stairway_flights(flight_id) ON DELETE CASCADE,
    sequence     BIGINT NOT NULL,
    step_index   BIGINT NOT NULL,
    direction    TEXT NOT NULL,
    rerun        BOOLEAN NOT NULL DEFAULT false,
    attempt      INTEGER NOT NULL,
    status       TEXT NOT NULL,
    error        TEXT,
    recorded_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
    PRIMARY KEY (flight_id, sequence)
);

CREATE TABLE IF NOT EXISTS stairway_flight_working (
    flight_id    TEXT NOT NULL,
    sequence     BIGINT NOT NULL,
    key          TEXT NOT NULL,
    value        TEXT NOT NULL,
    PRIMARY KEY (flight_id, sequence, key),
    FOREIGN KEY (flight_id, sequence) REFERENCES stairway_log(flight_id, sequence) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS stairway_flights_status_idx
    ON stairway_flights (status) WHERE owner IS NULL;

CREATE INDEX IF NOT EXISTS stairway_flights_created_idx
    ON stairway_flights (created_at, flight_id);

CREATE INDEX IF NOT EXISTS stairway_flight_input_key_value_idx
    ON stairway_flight_input (key, value);
"#;

/// `Journal` backed by a shared `PgPool`.
pub struct PostgresJournal {
    pool: PgPool,
}

impl PostgresJournal {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, JournalError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(map_sql_err)?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[allow(clippy::too_many_arguments)]
fn row_to_flight_row(
    flight_id: String,
    class_name: String,
    status: String,
    direction: String,
    step_index: i64,
    owner: Option<String>,
    input: BTreeMap<String, String>,
    persisted: BTreeMap<String, String>,
    debug_info: serde_json::Value,
    error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
) -> Result<FlightRow, JournalError> {
    let status = parse_status(&status)?;
    let direction = parse_direction(&direction)?;
    let debug_info: FlightDebugInfo =
        serde_json::from_value(debug_info).map_err(map_sql_err)?;
    Ok(FlightRow {
        flight_id,
        class_name,
        input,
        persisted,
        debug_info,
        state: FlightState {
            status,
            direction,
            step_index: step_index as isize,
        },
        owner,
        error,
        created_at,
        updated_at,
    })
}

fn parse_status(s: &str) -> Result<FlightStatus, JournalError> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|e| JournalError::Backend(format!("bad status {s}: {e}")))
}

fn parse_direction(s: &str) -> Result<Direction, JournalError> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|e| JournalError::Backend(format!("bad direction {s}: {e}")))
}

fn status_to_sql(status: FlightStatus) -> String {
    serde_json::to_value(status)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default()
}

fn direction_to_sql(direction: Direction) -> String {
    serde_json::to_value(direction)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default()
}

/// Fetch the key/value rows for one flight out of a `(flight_id, key, value)`
/// side table into a map.
async fn fetch_param_map_pool(
    pool: &PgPool,
    table: &str,
    flight_id: &str,
) -> Result<BTreeMap<String, String>, JournalError> {
    let sql = format!("SELECT key, value FROM {table} WHERE flight_id = $1");
    let rows = sqlx::query(&sql)
        .bind(flight_id)
        .fetch_all(pool)
        .await
        .map_err(map_sql_err)?;
    rows.into_iter()
        .map(|row| {
            Ok((
                row.try_get::<String, _>("key").map_err(map_sql_err)?,
                row.try_get::<String, _>("value").map_err(map_sql_err)?,
            ))
        })
        .collect()
}

/// Replace every row of a `(flight_id, key, value)` side table for one
/// flight, inside an existing transaction.
async fn replace_param_map(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    table: &str,
    flight_id: &str,
    values: &BTreeMap<String, String>,
) -> Result<(), JournalError> {
    let delete_sql = format!("DELETE FROM {table} WHERE flight_id = $1");
    sqlx::query(&delete_sql)
        .bind(flight_id)
        .execute(&mut **tx)
        .await
        .map_err(map_sql_err)?;

    let insert_sql = format!("INSERT INTO {table} (flight_id, key, value) VALUES ($1, $2, $3)");
    for (key, value) in values {
        sqlx::query(&insert_sql)
            .bind(flight_id)
            .bind(key)
            .bind(value)
            .execute(&mut **tx)
            .await
            .map_err(map_sql_err)?;
    }
    Ok(())
}

#[async_trait]
impl Journal for PostgresJournal {
    async fn initialize(&self) -> Result<(), JournalError> {
        sqlx::query(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(map_sql_err)?;
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
        retry_transient(|| async {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(map_sql_err)?;

            let debug_json =
                serde_json::to_value(&debug_info).map_err(map_sql_err)?;

            let existing = sqlx::query("SELECT 1 FROM stairway_flights WHERE flight_id = $1")
                .bind(flight_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(map_sql_err)?;
            if existing.is_some() {
                return Err(JournalError::AlreadyExists(flight_id.to_string()));
            }

            sqlx::query(
                r#"INSERT INTO stairway_flights
                   (flight_id, class_name, status, direction, step_index, owner, debug_info)
                   VALUES ($1, $2, $3, $4, 0, $5, $6)"#,
            )
            .bind(flight_id)
            .bind(class_name)
            .bind(status_to_sql(FlightStatus::Running))
            .bind(direction_to_sql(Direction::Start))
            .bind(owner)
            .bind(&debug_json)
            .execute(&mut *tx)
            .await
            .map_err(map_sql_err)?;

            let insert_input =
                "INSERT INTO stairway_flight_input (flight_id, key, value) VALUES ($1, $2, $3)";
            for (key, value) in &input {
                sqlx::query(insert_input)
                    .bind(flight_id)
                    .bind(key)
                    .bind(value)
                    .execute(&mut *tx)
                    .await
                    .map_err(map_sql_err)?;
            }

            tx.commit()
                .await
                .map_err(map_sql_err)?;

            self.load(flight_id)
                .await?
                .ok_or_else(|| JournalError::NotFound(flight_id.to_string()))
        })
        .await
    }

    async fn claim_owner(&self, flight_id: &str, owner: &str) -> Result<FlightRow, JournalError> {
        retry_transient(|| async {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(map_sql_err)?;
            sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
                .execute(&mut *tx)
                .await
                .map_err(map_sql_err)?;

            let row = sqlx::query(
                "SELECT owner, status FROM stairway_flights WHERE flight_id = $1 FOR UPDATE SKIP LOCKED",
            )
            .bind(flight_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_sql_err)?
            .ok_or_else(|| JournalError::NotFound(flight_id.to_string()))?;

            let current_owner: Option<String> = row.try_get("owner").ok();
            let current_status: String = row
                .try_get("status")
                .map_err(map_sql_err)?;
            let status = parse_status(&current_status)?;

            if current_owner.is_some() || !status.is_resumable() {
                return Err(JournalError::OwnershipConflict {
                    flight_id: flight_id.to_string(),
                    expected: owner.to_string(),
                    actual: current_owner,
                });
            }

            sqlx::query(
                "UPDATE stairway_flights SET owner = $2, status = $3, updated_at = now() WHERE flight_id = $1",
            )
            .bind(flight_id)
            .bind(owner)
            .bind(status_to_sql(FlightStatus::Running))
            .execute(&mut *tx)
            .await
            .map_err(map_sql_err)?;

            tx.commit()
                .await
                .map_err(map_sql_err)?;

            self.load(flight_id)
                .await?
                .ok_or_else(|| JournalError::NotFound(flight_id.to_string()))
        })
        .await
    }

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
    ) -> Result<LogEntry, JournalError> {
        retry_transient(|| async {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(map_sql_err)?;
            assert_owner_sql(&mut tx, flight_id, owner).await?;

            let next_sequence: i64 = sqlx::query(
                "SELECT COALESCE(MAX(sequence), -1) + 1 AS next FROM stairway_log WHERE flight_id = $1",
            )
            .bind(flight_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(map_sql_err)?
            .try_get("next")
            .map_err(map_sql_err)?;

            let status = serde_json::to_value(result.status)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default();

            sqlx::query(
                r#"INSERT INTO stairway_log
                   (flight_id, sequence, step_index, direction, rerun, attempt, status, error)
                   VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"#,
            )
            .bind(flight_id)
            .bind(next_sequence)
            .bind(step_index as i64)
            .bind(direction_to_sql(direction))
            .bind(rerun)
            .bind(attempt as i32)
            .bind(&status)
            .bind(&result.error)
            .execute(&mut *tx)
            .await
            .map_err(map_sql_err)?;

            let insert_working = "INSERT INTO stairway_flight_working (flight_id, sequence, key, value) VALUES ($1, $2, $3, $4)";
            for (key, value) in &working {
                sqlx::query(insert_working)
                    .bind(flight_id)
                    .bind(next_sequence)
                    .bind(key)
                    .bind(value)
                    .execute(&mut *tx)
                    .await
                    .map_err(map_sql_err)?;
            }

            sqlx::query("UPDATE stairway_flights SET updated_at = now() WHERE flight_id = $1")
                .bind(flight_id)
                .execute(&mut *tx)
                .await
                .map_err(map_sql_err)?;

            tx.commit().await.map_err(map_sql_err)?;

            Ok(LogEntry {
                sequence: next_sequence,
                step_index,
                direction,
                rerun,
                attempt,
                result: result.clone(),
                working,
                recorded_at: Utc::now(),
            })
        })
        .await
    }

    async fn flush_persisted(
        &self,
        flight_id: &str,
        owner: &str,
        persisted: BTreeMap<String, String>,
    ) -> Result<(), JournalError> {
        retry_transient(|| async {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(map_sql_err)?;
            assert_owner_sql(&mut tx, flight_id, owner).await?;

            replace_param_map(&mut tx, "stairway_flight_persisted", flight_id, &persisted).await?;

            sqlx::query("UPDATE stairway_flights SET updated_at = now() WHERE flight_id = $1")
                .bind(flight_id)
                .execute(&mut *tx)
                .await
                .map_err(map_sql_err)?;

            tx.commit().await.map_err(map_sql_err)
        })
        .await
    }

    async fn update_state(
        &self,
        flight_id: &str,
        owner: &str,
        state: FlightState,
        error: Option<String>,
    ) -> Result<(), JournalError> {
        retry_transient(|| async {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(map_sql_err)?;
            assert_owner_sql(&mut tx, flight_id, owner).await?;

            sqlx::query(
                r#"UPDATE stairway_flights
                   SET status = $2, direction = $3, step_index = $4, error = $5, updated_at = now()
                   WHERE flight_id = $1"#,
            )
            .bind(flight_id)
            .bind(status_to_sql(state.status))
            .bind(direction_to_sql(state.direction))
            .bind(state.step_index as i64)
            .bind(&error)
            .execute(&mut *tx)
            .await
            .map_err(map_sql_err)?;

            tx.commit().await.map_err(map_sql_err)
        })
        .await
    }

    async fn release_owner(
        &self,
        flight_id: &str,
        owner: &str,
        state: FlightState,
        error: Option<String>,
    ) -> Result<(), JournalError> {
        retry_transient(|| async {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(map_sql_err)?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await
            .map_err(map_sql_err)?;

        let current = assert_owner_sql(&mut tx, flight_id, owner).await?;
        if current.status == FlightStatus::Running && state.status == FlightStatus::Queued {
            return Err(JournalError::OwnershipConflict {
                flight_id: flight_id.to_string(),
                expected: "WAITING or READY before QUEUED".to_string(),
                actual: Some(current.status.to_string()),
            });
        }

        sqlx::query(
            r#"UPDATE stairway_flights
               SET status = $2, direction = $3, step_index = $4, error = $5, owner = NULL, updated_at = now()
               WHERE flight_id = $1"#,
        )
        .bind(flight_id)
        .bind(status_to_sql(state.status))
        .bind(direction_to_sql(state.direction))
        .bind(state.step_index as i64)
        .bind(&error)
        .execute(&mut *tx)
        .await
        .map_err(map_sql_err)?;

        tx.commit().await.map_err(map_sql_err)
        })
        .await
    }

    async fn load(&self, flight_id: &str) -> Result<Option<FlightRow>, JournalError> {
        retry_transient(|| async {
        let row = sqlx::query(
            r#"SELECT flight_id, class_name, status, direction, step_index, owner,
                      debug_info, error, created_at, updated_at
               FROM stairway_flights WHERE flight_id = $1"#,
        )
        .bind(flight_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sql_err)?;

        let Some(row) = row else { return Ok(None) };

        let input = fetch_param_map_pool(&self.pool, "stairway_flight_input", flight_id).await?;
        let persisted = fetch_param_map_pool(&self.pool, "stairway_flight_persisted", flight_id).await?;

        Ok(Some(row_to_flight_row(
            row.try_get("flight_id").map_err(map_sql_err)?,
            row.try_get("class_name").map_err(map_sql_err)?,
            row.try_get("status").map_err(map_sql_err)?,
            row.try_get("direction").map_err(map_sql_err)?,
            row.try_get("step_index").map_err(map_sql_err)?,
            row.try_get("owner").map_err(map_sql_err)?,
            input,
            persisted,
            row.try_get("debug_info").map_err(map_sql_err)?,
            row.try_get("error").map_err(map_sql_err)?,
            row.try_get("created_at").map_err(map_sql_err)?,
            row.try_get("updated_at").map_err(map_sql_err)?,
        )?))
        })
        .await
    }

    async fn load_log(&self, flight_id: &str) -> Result<Vec<LogEntry>, JournalError> {
        retry_transient(|| async {
            let rows = sqlx::query(
                r#"SELECT sequence, step_index, direction, rerun, attempt, status, error, recorded_at
                   FROM stairway_log WHERE flight_id = $1 ORDER BY sequence ASC"#,
            )
            .bind(flight_id)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sql_err)?;

            let working_rows = sqlx::query(
                "SELECT sequence, key, value FROM stairway_flight_working WHERE flight_id = $1",
            )
            .bind(flight_id)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sql_err)?;

            let mut working_by_sequence: BTreeMap<i64, BTreeMap<String, String>> = BTreeMap::new();
            for row in working_rows {
                let sequence: i64 = row.try_get("sequence").map_err(map_sql_err)?;
                let key: String = row.try_get("key").map_err(map_sql_err)?;
                let value: String = row.try_get("value").map_err(map_sql_err)?;
                working_by_sequence.entry(sequence).or_default().insert(key, value);
            }

            rows.into_iter()
                .map(|row| {
                    let status: String = row.try_get("status").map_err(map_sql_err)?;
                    let direction: String =
                        row.try_get("direction").map_err(map_sql_err)?;
                    let step_status: crate::step::StepStatus = serde_json::from_value(
                        serde_json::Value::String(status),
                    )
                    .map_err(map_sql_err)?;
                    let sequence: i64 = row.try_get("sequence").map_err(map_sql_err)?;
                    Ok(LogEntry {
                        sequence,
                        step_index: row
                            .try_get::<i64, _>("step_index")
                            .map_err(map_sql_err)? as isize,
                        direction: parse_direction(&direction)?,
                        rerun: row.try_get("rerun").map_err(map_sql_err)?,
                        attempt: row.try_get::<i32, _>("attempt").map_err(map_sql_err)? as u32,
                        result: StepResult {
                            status: step_status,
                            error: row.try_get("error").map_err(map_sql_err)?,
                        },
                        working: working_by_sequence.remove(&sequence).unwrap_or_default(),
                        recorded_at: row
                            .try_get("recorded_at")
                            .map_err(map_sql_err)?,
                    })
                })
                .collect()
        })
        .await
    }

    async fn list_recoverable(
        &self,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<FlightSummary>, JournalError> {
        retry_transient(|| async {
            let statuses: Vec<String> = [
                FlightStatus::Waiting,
                FlightStatus::Ready,
                FlightStatus::Queued,
                FlightStatus::ReadyToRestart,
            ]
            .into_iter()
            .map(status_to_sql)
            .collect();

            let rows = sqlx::query(
                r#"SELECT flight_id, class_name, status, owner, created_at, updated_at
                   FROM stairway_flights
                   WHERE owner IS NULL AND status = ANY($1) AND updated_at < $2"#,
            )
            .bind(&statuses)
            .bind(stale_before)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sql_err)?;

            rows.into_iter().map(row_to_summary).collect()
        })
        .await
    }

    async fn list(
        &self,
        filter: &FlightFilter,
        page: Pagination,
    ) -> Result<FlightPage, JournalError> {
        retry_transient(|| async {
            let mut sql = String::from(
                "SELECT flight_id, class_name, status, owner, created_at, updated_at FROM stairway_flights WHERE 1=1",
            );
            let mut binds: Vec<ListBind> = Vec::new();

            if let Some(class_name) = &filter.class_name {
                binds.push(ListBind::Text(class_name.clone()));
                sql.push_str(&format!(" AND class_name = ${}", binds.len()));
            }
            if !filter.statuses.is_empty() {
                let list: Vec<String> = filter.statuses.iter().copied().map(status_to_sql).collect();
                binds.push(ListBind::TextArray(list));
                sql.push_str(&format!(" AND status = ANY(${})", binds.len()));
            }
            if let Some(predicate) = &filter.input_predicate {
                sql.push_str(" AND ");
                sql.push_str(&render_predicate_sql(predicate, &mut binds));
            }
            if let Some(after) = &page.after {
                binds.push(ListBind::Timestamptz(after.last_created_at));
                let created_idx = binds.len();
                match &after.last_flight_id {
                    Some(last_id) => {
                        binds.push(ListBind::Text(last_id.clone()));
                        let id_idx = binds.len();
                        sql.push_str(&format!(
                            " AND (created_at, flight_id) > (${created_idx}, ${id_idx})"
                        ));
                    }
                    None => {
                        sql.push_str(&format!(" AND created_at > ${created_idx}"));
                    }
                }
            }
            sql.push_str(&format!(" ORDER BY created_at, flight_id LIMIT {}", page.page_size + 1));

            let mut query = sqlx::query(&sql);
            for bind in &binds {
                query = match bind {
                    ListBind::Text(s) => query.bind(s),
                    ListBind::TextArray(v) => query.bind(v),
                    ListBind::Timestamptz(t) => query.bind(t),
                };
            }

            let mut rows = query
                .fetch_all(&self.pool)
                .await
                .map_err(map_sql_err)?;

            let has_more = rows.len() as u32 > page.page_size;
            if has_more {
                rows.truncate(page.page_size as usize);
            }

            let items: Vec<FlightSummary> = rows.into_iter().map(row_to_summary).collect::<Result<_, _>>()?;
            let next = if items.is_empty() {
                // Nothing matched this poll: still mint a cursor so a caller
                // that keeps polling with the returned token makes forward
                // progress instead of rescanning from the same point forever.
                Some(PageToken::now_empty(Utc::now()))
            } else if has_more {
                items.last().map(|last| PageToken {
                    last_created_at: last.created_at,
                    last_flight_id: Some(last.flight_id.clone()),
                })
            } else {
                None
            };

            Ok(FlightPage { items, next })
        })
        .await
    }

    async fn delete(&self, flight_id: &str) -> Result<bool, JournalError> {
        retry_transient(|| async {
            let result = sqlx::query("DELETE FROM stairway_flights WHERE flight_id = $1")
                .bind(flight_id)
                .execute(&self.pool)
                .await
                .map_err(map_sql_err)?;
            Ok(result.rows_affected() > 0)
        })
        .await
    }

    async fn delete_completed_before(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<u64, JournalError> {
        retry_transient(|| async {
            let statuses: Vec<String> = [FlightStatus::Success, FlightStatus::Error, FlightStatus::Fatal]
                .into_iter()
                .map(status_to_sql)
                .collect();
            let result = sqlx::query(
                "DELETE FROM stairway_flights WHERE status = ANY($1) AND updated_at < $2",
            )
            .bind(&statuses)
            .bind(older_than)
            .execute(&self.pool)
            .await
            .map_err(map_sql_err)?;
            Ok(result.rows_affected())
        })
        .await
    }

    async fn disown_recovery(&self, old_owner: &str) -> Result<Vec<String>, JournalError> {
        retry_transient(|| async {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(map_sql_err)?;
            sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
                .execute(&mut *tx)
                .await
                .map_err(map_sql_err)?;

            let rows = sqlx::query(
                r#"UPDATE stairway_flights SET status = $1, owner = NULL, updated_at = now()
                   WHERE owner = $2 AND status = $3
                   RETURNING flight_id"#,
            )
            .bind(status_to_sql(FlightStatus::Ready))
            .bind(old_owner)
            .bind(status_to_sql(FlightStatus::Running))
            .fetch_all(&mut *tx)
            .await
            .map_err(map_sql_err)?;

            let flight_ids: Vec<String> = rows
                .into_iter()
                .map(|row| row.try_get::<String, _>("flight_id"))
                .collect::<Result<_, _>>()
                .map_err(map_sql_err)?;

            tx.commit().await.map_err(map_sql_err)?;
            Ok(flight_ids)
        })
        .await
    }

    async fn get_ready_flights(&self) -> Result<Vec<String>, JournalError> {
        retry_transient(|| async {
            let statuses: Vec<String> = [FlightStatus::Ready, FlightStatus::ReadyToRestart]
                .into_iter()
                .map(status_to_sql)
                .collect();
            let rows = sqlx::query(
                "SELECT flight_id FROM stairway_flights WHERE owner IS NULL AND status = ANY($1)",
            )
            .bind(&statuses)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sql_err)?;
            rows.into_iter()
                .map(|row| row.try_get("flight_id").map_err(map_sql_err))
                .collect()
        })
        .await
    }

    async fn mark_queued(&self, flight_id: &str) -> Result<(), JournalError> {
        retry_transient(|| async {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(map_sql_err)?;

            let row = sqlx::query(
                "SELECT owner, status FROM stairway_flights WHERE flight_id = $1 FOR UPDATE",
            )
            .bind(flight_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_sql_err)?
            .ok_or_else(|| JournalError::NotFound(flight_id.to_string()))?;

            let owner: Option<String> = row.try_get("owner").ok();
            let status: String = row.try_get("status").map_err(map_sql_err)?;
            if owner.is_some() || parse_status(&status)? != FlightStatus::Ready {
                return Err(JournalError::OwnershipConflict {
                    flight_id: flight_id.to_string(),
                    expected: "unowned READY".to_string(),
                    actual: owner,
                });
            }

            sqlx::query("UPDATE stairway_flights SET status = $2, updated_at = now() WHERE flight_id = $1")
                .bind(flight_id)
                .bind(status_to_sql(FlightStatus::Queued))
                .execute(&mut *tx)
                .await
                .map_err(map_sql_err)?;

            tx.commit().await.map_err(map_sql_err)
        })
        .await
    }

    async fn reset(&self) -> Result<(), JournalError> {
        retry_transient(|| async {
            sqlx::query(
                "DROP TABLE IF EXISTS stairway_flight_working, stairway_log, \
                 stairway_flight_input, stairway_flight_persisted, stairway_flights CASCADE",
            )
            .execute(&self.pool)
            .await
            .map_err(map_sql_err)?;
            Ok(())
        })
        .await?;
        self.initialize().await
    }
}

async fn assert_owner_sql(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    flight_id: &str,
    owner: &str,
) -> Result<FlightState, JournalError> {
    let row = sqlx::query("SELECT owner, status, direction, step_index FROM stairway_flights WHERE flight_id = $1 FOR UPDATE")
        .bind(flight_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(map_sql_err)?
        .ok_or_else(|| JournalError::NotFound(flight_id.to_string()))?;

    let current_owner: Option<String> = row.try_get("owner").ok();
    if current_owner.as_deref() != Some(owner) {
        return Err(JournalError::OwnershipConflict {
            flight_id: flight_id.to_string(),
            expected: owner.to_string(),
            actual: current_owner,
        });
    }

    let status: String = row.try_get("status").map_err(map_sql_err)?;
    let direction: String = row.try_get("direction").map_err(map_sql_err)?;
    let step_index: i64 = row.try_get("step_index").map_err(map_sql_err)?;

    Ok(FlightState {
        status: parse_status(&status)?,
        direction: parse_direction(&direction)?,
        step_index: step_index as isize,
    })
}

fn row_to_summary(row: sqlx::postgres::PgRow) -> Result<FlightSummary, JournalError> {
    let status: String = row.try_get("status").map_err(map_sql_err)?;
    Ok(FlightSummary {
        flight_id: row.try_get("flight_id").map_err(map_sql_err)?,
        class_name: row.try_get("class_name").map_err(map_sql_err)?,
        status: parse_status(&status)?,
        owner: row.try_get("owner").map_err(map_sql_err)?,
        created_at: row.try_get("created_at").map_err(map_sql_err)?,
        updated_at: row.try_get("updated_at").map_err(map_sql_err)?,
    })
}

/// A bind value for the dynamically built `list()` query. `sqlx::query`
/// binds are positional and type-specific, so the query builder tracks which
/// Rust type backs each `$n` placeholder as it appends predicate clauses.
enum ListBind {
    Text(String),
    TextArray(Vec<String>),
    Timestamptz(DateTime<Utc>),
}

/// Renders an `InputPredicate` to a SQL boolean expression, lowering each
/// leaf to an `EXISTS (SELECT 1 FROM stairway_flight_input ...)` subquery
/// against the caller's flight row and appending its key/value as bind
/// parameters rather than interpolating them into the SQL text.
///
/// Ordering operators compare as text. RFC 3339 timestamps sort
/// lexicographically in chronological order, so this needs no special-casing
/// for the `timestamp` datatype — it only matters that both sides use the
/// same representation, which the crate's codecs guarantee.
fn render_predicate_sql(predicate: &InputPredicate, binds: &mut Vec<ListBind>) -> String {
    const INPUT: &str = "stairway_flight_input";

    match predicate {
        InputPredicate::Exists { key } => {
            binds.push(ListBind::Text(key.clone()));
            let k = binds.len();
            format!(
                "EXISTS (SELECT 1 FROM {INPUT} fi WHERE fi.flight_id = stairway_flights.flight_id AND fi.key = ${k})"
            )
        }
        InputPredicate::Eq { key, value } => {
            binds.push(ListBind::Text(key.clone()));
            let k = binds.len();
            binds.push(ListBind::Text(value.clone()));
            let v = binds.len();
            format!(
                "EXISTS (SELECT 1 FROM {INPUT} fi WHERE fi.flight_id = stairway_flights.flight_id AND fi.key = ${k} AND fi.value = ${v})"
            )
        }
        InputPredicate::NotEq { key, value } => {
            binds.push(ListBind::Text(key.clone()));
            let k = binds.len();
            binds.push(ListBind::Text(value.clone()));
            let v = binds.len();
            format!(
                "EXISTS (SELECT 1 FROM {INPUT} fi WHERE fi.flight_id = stairway_flights.flight_id AND fi.key = ${k} AND fi.value IS DISTINCT FROM ${v})"
            )
        }
        InputPredicate::Lt { key, value } => {
            binds.push(ListBind::Text(key.clone()));
            let k = binds.len();
            binds.push(ListBind::Text(value.clone()));
            let v = binds.len();
            format!(
                "EXISTS (SELECT 1 FROM {INPUT} fi WHERE fi.flight_id = stairway_flights.flight_id AND fi.key = ${k} AND fi.value < ${v})"
            )
        }
        InputPredicate::Le { key, value } => {
            binds.push(ListBind::Text(key.clone()));
            let k = binds.len();
            binds.push(ListBind::Text(value.clone()));
            let v = binds.len();
            format!(
                "EXISTS (SELECT 1 FROM {INPUT} fi WHERE fi.flight_id = stairway_flights.flight_id AND fi.key = ${k} AND fi.value <= ${v})"
            )
        }
        InputPredicate::Gt { key, value } => {
            binds.push(ListBind::Text(key.clone()));
            let k = binds.len();
            binds.push(ListBind::Text(value.clone()));
            let v = binds.len();
            format!(
                "EXISTS (SELECT 1 FROM {INPUT} fi WHERE fi.flight_id = stairway_flights.flight_id AND fi.key = ${k} AND fi.value > ${v})"
            )
        }
        InputPredicate::Ge { key, value } => {
            binds.push(ListBind::Text(key.clone()));
            let k = binds.len();
            binds.push(ListBind::Text(value.clone()));
            let v = binds.len();
            format!(
                "EXISTS (SELECT 1 FROM {INPUT} fi WHERE fi.flight_id = stairway_flights.flight_id AND fi.key = ${k} AND fi.value >= ${v})"
            )
        }
        InputPredicate::In { key, values } => {
            binds.push(ListBind::Text(key.clone()));
            let k = binds.len();
            binds.push(ListBind::TextArray(values.clone()));
            let v = binds.len();
            format!(
                "EXISTS (SELECT 1 FROM {INPUT} fi WHERE fi.flight_id = stairway_flights.flight_id AND fi.key = ${k} AND fi.value = ANY(${v}))"
            )
        }
        InputPredicate::Contains { key, substring } => {
            binds.push(ListBind::Text(key.clone()));
            let k = binds.len();
            binds.push(ListBind::Text(format!("%{}%", escape_like(substring))));
            let v = binds.len();
            format!(
                "EXISTS (SELECT 1 FROM {INPUT} fi WHERE fi.flight_id = stairway_flights.flight_id AND fi.key = ${k} AND fi.value LIKE ${v} ESCAPE '\\')"
            )
        }
        InputPredicate::And(predicates) => {
            let joined: Vec<String> = predicates
                .iter()
                .map(|p| render_predicate_sql(p, binds))
                .collect();
            format!("({})", joined.join(" AND "))
        }
        InputPredicate::Or(predicates) => {
            let joined: Vec<String> = predicates
                .iter()
                .map(|p| render_predicate_sql(p, binds))
                .collect();
            format!("({})", joined.join(" OR "))
        }
        InputPredicate::Not(inner) => format!("(NOT {})", render_predicate_sql(inner, binds)),
    }
}

/// Escapes `LIKE` wildcard characters in a substring match so the value is
/// matched literally; paired with `ESCAPE '\'` at the call site.
fn escape_like(s: &str) -> String {
    s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

/// Classifies a `sqlx::Error` as transient (serialization failure, deadlock,
/// or a connection/resource-class SQLSTATE) versus a plain backend error.
/// Transient errors are reported as [`JournalError::SerializationConflict`]
/// so [`retry_transient`] knows to retry them; §4.1/§7 call for retrying on
/// "serialization failure, deadlock, connection/resource class codes" —
/// classes `40` (transaction rollback, including `40001`/`40P01`) and `08`
/// (connection exception).
fn map_sql_err(e: sqlx::Error) -> JournalError {
    if let sqlx::Error::Database(ref db_err) = e {
        if let Some(code) = db_err.code() {
            if code.starts_with("40") || code.starts_with("08") {
                return JournalError::SerializationConflict(e.to_string());
            }
        }
    }
    JournalError::Backend(e.to_string())
}

/// Bounded randomized-backoff retry for transient storage errors, per §4.1:
/// "each operation is wrapped in a retry loop that retries on transient
/// storage errors ... with random-interval backoff up to a bounded retry
/// count." Every `PostgresJournal` trait method runs its attempt body
/// through this; non-transient errors (including `OwnershipConflict`,
/// `AlreadyExists`, `NotFound`) propagate on the first attempt untouched.
const MAX_TRANSIENT_RETRIES: u32 = 5;

async fn retry_transient<T, F, Fut>(mut attempt: F) -> Result<T, JournalError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, JournalError>>,
{
    let mut tries = 0u32;
    loop {
        tries += 1;
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(JournalError::SerializationConflict(msg)) if tries < MAX_TRANSIENT_RETRIES => {
                let backoff = random_backoff_ms(tries);
                tracing::debug!(attempt = tries, backoff_ms = backoff, error = %msg, "retrying transient journal error");
                tokio::time::sleep(std::time::Duration::from_millis(backoff)).await;
            }
            Err(err) => return Err(err),
        }
    }
}

fn random_backoff_ms(attempt: u32) -> u64 {
    use rand::Rng;
    let base = 10u64 * attempt as u64;
    base + rand::thread_rng().gen_range(0..base.max(1))
}

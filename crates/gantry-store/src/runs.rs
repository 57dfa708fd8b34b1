use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::instrument;

use gantry_core::ids::{AssistantId, RunId, ThreadId};
use gantry_core::run::{MultitaskStrategy, RunKwargs, RunStatus};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// One execution attempt of an assistant against a thread.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunRow {
    pub id: RunId,
    pub thread_id: ThreadId,
    pub assistant_id: AssistantId,
    pub status: RunStatus,
    pub multitask_strategy: MultitaskStrategy,
    pub kwargs: RunKwargs,
    pub metadata: Value,
    pub created_at: String,
    pub updated_at: String,
}

pub struct RunRepo {
    db: Database,
}

const SELECT_COLS: &str =
    "id, thread_id, assistant_id, status, multitask_strategy, kwargs, metadata, created_at, updated_at";

impl RunRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create a new run in `pending`.
    #[instrument(skip(self, kwargs, metadata), fields(thread_id = %thread_id, assistant_id = %assistant_id))]
    pub fn create(
        &self,
        thread_id: &ThreadId,
        assistant_id: &AssistantId,
        strategy: MultitaskStrategy,
        kwargs: &RunKwargs,
        metadata: &Value,
    ) -> Result<RunRow, StoreError> {
        let id = RunId::new();
        let now = Utc::now().to_rfc3339();
        let kwargs_json = serde_json::to_string(kwargs)?;

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO runs (id, thread_id, assistant_id, status, multitask_strategy, kwargs, metadata, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 'pending', ?4, ?5, ?6, ?7, ?8)",
                rusqlite::params![
                    id.as_str(),
                    thread_id.as_str(),
                    assistant_id.as_str(),
                    strategy.to_string(),
                    kwargs_json,
                    metadata.to_string(),
                    now,
                    now,
                ],
            )?;

            Ok(RunRow {
                id,
                thread_id: thread_id.clone(),
                assistant_id: assistant_id.clone(),
                status: RunStatus::Pending,
                multitask_strategy: strategy,
                kwargs: kwargs.clone(),
                metadata: metadata.clone(),
                created_at: now.clone(),
                updated_at: now,
            })
        })
    }

    /// Get a run by ID.
    #[instrument(skip(self), fields(run_id = %id))]
    pub fn get(&self, id: &RunId) -> Result<RunRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("SELECT {SELECT_COLS} FROM runs WHERE id = ?1"))?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_run(row),
                None => Err(StoreError::NotFound(format!("run {id}"))),
            }
        })
    }

    /// Overwrite a run's status. Transition legality is the lifecycle
    /// controller's responsibility; the store records what it is told.
    #[instrument(skip(self), fields(run_id = %id, status = %status))]
    pub fn set_status(&self, id: &RunId, status: RunStatus) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            let rows = conn.execute(
                "UPDATE runs SET status = ?1, updated_at = ?2 WHERE id = ?3",
                rusqlite::params![status.to_string(), now, id.as_str()],
            )?;
            if rows == 0 {
                return Err(StoreError::NotFound(format!("run {id}")));
            }
            Ok(())
        })
    }

    /// The thread's active run, if any: the earliest run still in
    /// `pending` or `running`.
    pub fn active_for_thread(&self, thread_id: &ThreadId) -> Result<Option<RunRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SELECT_COLS} FROM runs
                 WHERE thread_id = ?1 AND status IN ('pending', 'running')
                 ORDER BY created_at ASC, id ASC LIMIT 1"
            ))?;
            let mut rows = stmt.query([thread_id.as_str()])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_run(row)?)),
                None => Ok(None),
            }
        })
    }

    /// The earliest queued run for a thread, excluding the given run.
    /// Drives FIFO scheduling of `enqueue`d runs.
    pub fn next_pending(
        &self,
        thread_id: &ThreadId,
        exclude: Option<&RunId>,
    ) -> Result<Option<RunRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SELECT_COLS} FROM runs
                 WHERE thread_id = ?1 AND status = 'pending' AND id != ?2
                 ORDER BY created_at ASC, id ASC LIMIT 1"
            ))?;
            let excluded = exclude.map(|r| r.as_str()).unwrap_or("");
            let mut rows = stmt.query(rusqlite::params![thread_id.as_str(), excluded])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_run(row)?)),
                None => Ok(None),
            }
        })
    }

    /// List runs for a thread, newest first, with optional status filter.
    pub fn list_for_thread(
        &self,
        thread_id: &ThreadId,
        status: Option<RunStatus>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<RunRow>, StoreError> {
        self.db.with_conn(|conn| {
            let (sql, params) = match status {
                Some(s) => (
                    format!(
                        "SELECT {SELECT_COLS} FROM runs WHERE thread_id = ?1 AND status = ?2
                         ORDER BY created_at DESC, id DESC LIMIT ?3 OFFSET ?4"
                    ),
                    vec![
                        thread_id.as_str().to_string(),
                        s.to_string(),
                        limit.to_string(),
                        offset.to_string(),
                    ],
                ),
                None => (
                    format!(
                        "SELECT {SELECT_COLS} FROM runs WHERE thread_id = ?1
                         ORDER BY created_at DESC, id DESC LIMIT ?2 OFFSET ?3"
                    ),
                    vec![
                        thread_id.as_str().to_string(),
                        limit.to_string(),
                        offset.to_string(),
                    ],
                ),
            };

            let mut stmt = conn.prepare(&sql)?;
            let params_refs: Vec<&dyn rusqlite::types::ToSql> =
                params.iter().map(|p| p as &dyn rusqlite::types::ToSql).collect();
            let mut rows = stmt.query(params_refs.as_slice())?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_run(row)?);
            }
            Ok(results)
        })
    }

    /// Delete a run.
    #[instrument(skip(self), fields(run_id = %id))]
    pub fn delete(&self, id: &RunId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let rows = conn.execute("DELETE FROM runs WHERE id = ?1", [id.as_str()])?;
            if rows == 0 {
                return Err(StoreError::NotFound(format!("run {id}")));
            }
            Ok(())
        })
    }

    /// Count runs for a thread.
    pub fn count_for_thread(&self, thread_id: &ThreadId) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM runs WHERE thread_id = ?1",
                [thread_id.as_str()],
                |row| row.get(0),
            )
            .map_err(|e| StoreError::Database(e.to_string()))
        })
    }
}

fn row_to_run(row: &rusqlite::Row<'_>) -> Result<RunRow, StoreError> {
    let status_raw: String = row_helpers::get(row, 3, "runs", "status")?;
    let strategy_raw: String = row_helpers::get(row, 4, "runs", "multitask_strategy")?;
    let kwargs_raw: String = row_helpers::get(row, 5, "runs", "kwargs")?;
    let metadata_raw: String = row_helpers::get(row, 6, "runs", "metadata")?;

    Ok(RunRow {
        id: RunId::from_raw(row_helpers::get::<String>(row, 0, "runs", "id")?),
        thread_id: ThreadId::from_raw(row_helpers::get::<String>(row, 1, "runs", "thread_id")?),
        assistant_id: AssistantId::from_raw(row_helpers::get::<String>(
            row,
            2,
            "runs",
            "assistant_id",
        )?),
        status: row_helpers::parse_enum(&status_raw, "runs", "status")?,
        multitask_strategy: row_helpers::parse_enum(&strategy_raw, "runs", "multitask_strategy")?,
        kwargs: serde_json::from_str(&kwargs_raw).map_err(|e| StoreError::CorruptRow {
            table: "runs",
            column: "kwargs",
            detail: format!("invalid JSON: {e}"),
        })?,
        metadata: row_helpers::parse_json(&metadata_raw, "runs", "metadata")?,
        created_at: row_helpers::get(row, 7, "runs", "created_at")?,
        updated_at: row_helpers::get(row, 8, "runs", "updated_at")?,
    })
}

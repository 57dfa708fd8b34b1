use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::instrument;

use gantry_core::ids::ThreadId;
use gantry_core::run::OnCompletion;

use crate::assistants::metadata_matches;
use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Derived thread status: `busy` exactly while the thread owns an active run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadStatus {
    Idle,
    Busy,
}

impl std::fmt::Display for ThreadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Busy => write!(f, "busy"),
        }
    }
}

impl std::str::FromStr for ThreadStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "busy" => Ok(Self::Busy),
            other => Err(format!("unknown thread status: {other}")),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ThreadRow {
    pub id: ThreadId,
    pub status: ThreadStatus,
    pub metadata: Value,
    /// Last-known execution values from the most recent completed run.
    pub last_values: Option<Value>,
    pub created_at: String,
    pub updated_at: String,
}

impl ThreadRow {
    /// Ephemeral threads synthesized for stateless runs carry
    /// `metadata.stateless = true`.
    pub fn is_stateless(&self) -> bool {
        self.metadata.get("stateless").and_then(Value::as_bool) == Some(true)
    }

    /// `metadata.on_completion` for ephemeral threads; defaults to `delete`.
    pub fn on_completion(&self) -> OnCompletion {
        self.metadata
            .get("on_completion")
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
            .unwrap_or_default()
    }
}

pub struct ThreadRepo {
    db: Database,
}

const SELECT_COLS: &str = "id, status, metadata, last_values, created_at, updated_at";

impl ThreadRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create a new idle thread.
    #[instrument(skip(self, metadata))]
    pub fn create(&self, metadata: &Value) -> Result<ThreadRow, StoreError> {
        let id = ThreadId::new();
        let now = Utc::now().to_rfc3339();

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO threads (id, status, metadata, created_at, updated_at)
                 VALUES (?1, 'idle', ?2, ?3, ?4)",
                rusqlite::params![id.as_str(), metadata.to_string(), now, now],
            )?;

            Ok(ThreadRow {
                id,
                status: ThreadStatus::Idle,
                metadata: metadata.clone(),
                last_values: None,
                created_at: now.clone(),
                updated_at: now,
            })
        })
    }

    /// Get a thread by ID.
    #[instrument(skip(self), fields(thread_id = %id))]
    pub fn get(&self, id: &ThreadId) -> Result<ThreadRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {SELECT_COLS} FROM threads WHERE id = ?1"))?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_thread(row),
                None => Err(StoreError::NotFound(format!("thread {id}"))),
            }
        })
    }

    /// Update the derived busy/idle status.
    #[instrument(skip(self), fields(thread_id = %id, status = %status))]
    pub fn set_status(&self, id: &ThreadId, status: ThreadStatus) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            let rows = conn.execute(
                "UPDATE threads SET status = ?1, updated_at = ?2 WHERE id = ?3",
                rusqlite::params![status.to_string(), now, id.as_str()],
            )?;
            if rows == 0 {
                return Err(StoreError::NotFound(format!("thread {id}")));
            }
            Ok(())
        })
    }

    /// Store the last-known execution values.
    #[instrument(skip(self, values), fields(thread_id = %id))]
    pub fn update_values(&self, id: &ThreadId, values: &Value) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            let rows = conn.execute(
                "UPDATE threads SET last_values = ?1, updated_at = ?2 WHERE id = ?3",
                rusqlite::params![values.to_string(), now, id.as_str()],
            )?;
            if rows == 0 {
                return Err(StoreError::NotFound(format!("thread {id}")));
            }
            Ok(())
        })
    }

    /// Delete a thread. Cascades to its runs so no orphaned runs exist.
    #[instrument(skip(self), fields(thread_id = %id))]
    pub fn delete(&self, id: &ThreadId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute("DELETE FROM runs WHERE thread_id = ?1", [id.as_str()])?;
            let rows = conn.execute("DELETE FROM threads WHERE id = ?1", [id.as_str()])?;
            if rows == 0 {
                return Err(StoreError::NotFound(format!("thread {id}")));
            }
            Ok(())
        })
    }

    /// Search threads by metadata equality, newest first.
    pub fn search(
        &self,
        metadata: Option<&Value>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<ThreadRow>, StoreError> {
        let all = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SELECT_COLS} FROM threads ORDER BY created_at DESC, id DESC"
            ))?;
            let mut rows = stmt.query([])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_thread(row)?);
            }
            Ok(results)
        })?;

        Ok(all
            .into_iter()
            .filter(|t| metadata_matches(&t.metadata, metadata))
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }

    /// Count all threads.
    pub fn count(&self) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            conn.query_row("SELECT COUNT(*) FROM threads", [], |row| row.get(0))
                .map_err(|e| StoreError::Database(e.to_string()))
        })
    }
}

fn row_to_thread(row: &rusqlite::Row<'_>) -> Result<ThreadRow, StoreError> {
    let status_raw: String = row_helpers::get(row, 1, "threads", "status")?;
    let metadata_raw: String = row_helpers::get(row, 2, "threads", "metadata")?;
    let values_raw: Option<String> = row_helpers::get_opt(row, 3, "threads", "last_values")?;

    Ok(ThreadRow {
        id: ThreadId::from_raw(row_helpers::get::<String>(row, 0, "threads", "id")?),
        status: row_helpers::parse_enum(&status_raw, "threads", "status")?,
        metadata: row_helpers::parse_json(&metadata_raw, "threads", "metadata")?,
        last_values: values_raw
            .map(|raw| row_helpers::parse_json(&raw, "threads", "last_values"))
            .transpose()?,
        created_at: row_helpers::get(row, 4, "threads", "created_at")?,
        updated_at: row_helpers::get(row, 5, "threads", "updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runs::RunRepo;
    use gantry_core::ids::AssistantId;
    use gantry_core::run::{MultitaskStrategy, RunKwargs};
    use serde_json::json;

    fn setup() -> (Database, ThreadRepo) {
        let db = Database::in_memory().unwrap();
        let repo = ThreadRepo::new(db.clone());
        (db, repo)
    }

    #[test]
    fn create_thread_idle() {
        let (_db, repo) = setup();
        let t = repo.create(&json!({})).unwrap();
        assert!(t.id.as_str().starts_with("thread_"));
        assert_eq!(t.status, ThreadStatus::Idle);
        assert!(t.last_values.is_none());
    }

    #[test]
    fn get_nonexistent_fails() {
        let (_db, repo) = setup();
        assert!(matches!(
            repo.get(&ThreadId::from_raw("thread_missing")),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn status_roundtrip() {
        let (_db, repo) = setup();
        let t = repo.create(&json!({})).unwrap();
        repo.set_status(&t.id, ThreadStatus::Busy).unwrap();
        assert_eq!(repo.get(&t.id).unwrap().status, ThreadStatus::Busy);
        repo.set_status(&t.id, ThreadStatus::Idle).unwrap();
        assert_eq!(repo.get(&t.id).unwrap().status, ThreadStatus::Idle);
    }

    #[test]
    fn update_values() {
        let (_db, repo) = setup();
        let t = repo.create(&json!({})).unwrap();
        repo.update_values(&t.id, &json!({"answer": 42})).unwrap();
        let fetched = repo.get(&t.id).unwrap();
        assert_eq!(fetched.last_values.unwrap()["answer"], 42);
    }

    #[test]
    fn delete_cascades_runs() {
        let (db, repo) = setup();
        let t = repo.create(&json!({})).unwrap();
        let run_repo = RunRepo::new(db);
        let run = run_repo
            .create(
                &t.id,
                &AssistantId::from_raw("asst_x"),
                MultitaskStrategy::Reject,
                &RunKwargs::default(),
                &json!({}),
            )
            .unwrap();

        repo.delete(&t.id).unwrap();
        assert!(repo.get(&t.id).is_err());
        assert!(run_repo.get(&run.id).is_err());
    }

    #[test]
    fn search_by_metadata() {
        let (_db, repo) = setup();
        repo.create(&json!({"stateless": true})).unwrap();
        repo.create(&json!({})).unwrap();

        let stateless = repo.search(Some(&json!({"stateless": true})), 100, 0).unwrap();
        assert_eq!(stateless.len(), 1);
        assert!(stateless[0].is_stateless());
    }

    #[test]
    fn stateless_metadata_helpers() {
        let (_db, repo) = setup();
        let t = repo
            .create(&json!({"stateless": true, "on_completion": "keep"}))
            .unwrap();
        assert!(t.is_stateless());
        assert_eq!(t.on_completion(), OnCompletion::Keep);

        let plain = repo.create(&json!({})).unwrap();
        assert!(!plain.is_stateless());
        assert_eq!(plain.on_completion(), OnCompletion::Delete);
    }

    #[test]
    fn count_threads() {
        let (_db, repo) = setup();
        assert_eq!(repo.count().unwrap(), 0);
        repo.create(&json!({})).unwrap();
        repo.create(&json!({})).unwrap();
        assert_eq!(repo.count().unwrap(), 2);
    }
}

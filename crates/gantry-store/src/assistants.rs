use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::instrument;

use gantry_core::ids::{AssistantId, GraphId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// A named configuration template for runs. The config is also the
/// fingerprint input for the graph build cache.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AssistantRow {
    pub id: AssistantId,
    pub graph_id: GraphId,
    pub config: Value,
    pub metadata: Value,
    pub version: i64,
    pub created_at: String,
    pub updated_at: String,
}

pub struct AssistantRepo {
    db: Database,
}

const SELECT_COLS: &str =
    "id, graph_id, config, metadata, version, created_at, updated_at";

impl AssistantRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create a new assistant at version 1.
    #[instrument(skip(self, config, metadata), fields(graph_id = %graph_id))]
    pub fn create(
        &self,
        graph_id: &GraphId,
        config: &Value,
        metadata: &Value,
    ) -> Result<AssistantRow, StoreError> {
        let id = AssistantId::new();
        let now = Utc::now().to_rfc3339();

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO assistants (id, graph_id, config, metadata, version, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, 1, ?5, ?6)",
                rusqlite::params![
                    id.as_str(),
                    graph_id.as_str(),
                    config.to_string(),
                    metadata.to_string(),
                    now,
                    now,
                ],
            )?;

            Ok(AssistantRow {
                id,
                graph_id: graph_id.clone(),
                config: config.clone(),
                metadata: metadata.clone(),
                version: 1,
                created_at: now.clone(),
                updated_at: now,
            })
        })
    }

    /// Get an assistant by ID.
    #[instrument(skip(self), fields(assistant_id = %id))]
    pub fn get(&self, id: &AssistantId) -> Result<AssistantRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SELECT_COLS} FROM assistants WHERE id = ?1"
            ))?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_assistant(row),
                None => Err(StoreError::NotFound(format!("assistant {id}"))),
            }
        })
    }

    /// Apply a versioned patch: shallow overlay on config and metadata,
    /// version bumped by one. Identity and graph id are immutable.
    #[instrument(skip(self, config, metadata), fields(assistant_id = %id))]
    pub fn patch(
        &self,
        id: &AssistantId,
        config: Option<&Value>,
        metadata: Option<&Value>,
    ) -> Result<AssistantRow, StoreError> {
        let current = self.get(id)?;
        let new_config = overlay(&current.config, config);
        let new_metadata = overlay(&current.metadata, metadata);
        let now = Utc::now().to_rfc3339();

        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE assistants SET config = ?1, metadata = ?2, version = version + 1, updated_at = ?3
                 WHERE id = ?4",
                rusqlite::params![new_config.to_string(), new_metadata.to_string(), now, id.as_str()],
            )?;
            Ok(())
        })?;

        self.get(id)
    }

    /// Delete an assistant.
    #[instrument(skip(self), fields(assistant_id = %id))]
    pub fn delete(&self, id: &AssistantId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let rows = conn.execute("DELETE FROM assistants WHERE id = ?1", [id.as_str()])?;
            if rows == 0 {
                return Err(StoreError::NotFound(format!("assistant {id}")));
            }
            Ok(())
        })
    }

    /// Search assistants, optionally by graph id and metadata equality,
    /// newest first.
    pub fn search(
        &self,
        graph_id: Option<&GraphId>,
        metadata: Option<&Value>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<AssistantRow>, StoreError> {
        let all = self.db.with_conn(|conn| {
            let (sql, params) = match graph_id {
                Some(g) => (
                    format!(
                        "SELECT {SELECT_COLS} FROM assistants WHERE graph_id = ?1
                         ORDER BY created_at DESC, id DESC"
                    ),
                    vec![g.as_str().to_string()],
                ),
                None => (
                    format!(
                        "SELECT {SELECT_COLS} FROM assistants
                         ORDER BY created_at DESC, id DESC"
                    ),
                    vec![],
                ),
            };
            let mut stmt = conn.prepare(&sql)?;
            let params_refs: Vec<&dyn rusqlite::types::ToSql> =
                params.iter().map(|p| p as &dyn rusqlite::types::ToSql).collect();
            let mut rows = stmt.query(params_refs.as_slice())?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_assistant(row)?);
            }
            Ok(results)
        })?;

        Ok(all
            .into_iter()
            .filter(|a| metadata_matches(&a.metadata, metadata))
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }

    /// Count all assistants.
    pub fn count(&self) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            conn.query_row("SELECT COUNT(*) FROM assistants", [], |row| row.get(0))
                .map_err(|e| StoreError::Database(e.to_string()))
        })
    }
}

/// Shallow overlay: patch keys replace base keys; a non-object patch
/// replaces the base wholesale.
fn overlay(base: &Value, patch: Option<&Value>) -> Value {
    match patch {
        None => base.clone(),
        Some(Value::Object(patch_obj)) => {
            let mut merged = base.as_object().cloned().unwrap_or_default();
            for (k, v) in patch_obj {
                merged.insert(k.clone(), v.clone());
            }
            Value::Object(merged)
        }
        Some(other) => other.clone(),
    }
}

/// True when every key/value pair in the filter appears in the metadata.
pub(crate) fn metadata_matches(metadata: &Value, filter: Option<&Value>) -> bool {
    let Some(filter) = filter else { return true };
    let Some(want) = filter.as_object() else { return true };
    match metadata.as_object() {
        Some(have) => want.iter().all(|(k, v)| have.get(k) == Some(v)),
        None => want.is_empty(),
    }
}

fn row_to_assistant(row: &rusqlite::Row<'_>) -> Result<AssistantRow, StoreError> {
    let config_raw: String = row_helpers::get(row, 2, "assistants", "config")?;
    let metadata_raw: String = row_helpers::get(row, 3, "assistants", "metadata")?;

    Ok(AssistantRow {
        id: AssistantId::from_raw(row_helpers::get::<String>(row, 0, "assistants", "id")?),
        graph_id: GraphId::new(row_helpers::get::<String>(row, 1, "assistants", "graph_id")?),
        config: row_helpers::parse_json(&config_raw, "assistants", "config")?,
        metadata: row_helpers::parse_json(&metadata_raw, "assistants", "metadata")?,
        version: row_helpers::get(row, 4, "assistants", "version")?,
        created_at: row_helpers::get(row, 5, "assistants", "created_at")?,
        updated_at: row_helpers::get(row, 6, "assistants", "updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn repo() -> AssistantRepo {
        AssistantRepo::new(Database::in_memory().unwrap())
    }

    #[test]
    fn create_and_get() {
        let repo = repo();
        let a = repo
            .create(&GraphId::new("agent"), &json!({"model": "m1"}), &json!({}))
            .unwrap();
        assert!(a.id.as_str().starts_with("asst_"));
        assert_eq!(a.version, 1);

        let fetched = repo.get(&a.id).unwrap();
        assert_eq!(fetched.graph_id.as_str(), "agent");
        assert_eq!(fetched.config["model"], "m1");
    }

    #[test]
    fn get_nonexistent_fails() {
        let repo = repo();
        let result = repo.get(&AssistantId::from_raw("asst_missing"));
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn patch_overlays_config_and_bumps_version() {
        let repo = repo();
        let a = repo
            .create(
                &GraphId::new("agent"),
                &json!({"model": "m1", "temperature": 0.5}),
                &json!({}),
            )
            .unwrap();

        let patched = repo
            .patch(&a.id, Some(&json!({"temperature": 0.9})), None)
            .unwrap();
        assert_eq!(patched.version, 2);
        assert_eq!(patched.config["model"], "m1");
        assert_eq!(patched.config["temperature"], 0.9);
    }

    #[test]
    fn patch_is_shallow() {
        let repo = repo();
        let a = repo
            .create(
                &GraphId::new("agent"),
                &json!({"tools": {"search": true, "code": true}}),
                &json!({}),
            )
            .unwrap();

        // A nested object replaces the whole key, not a deep merge.
        let patched = repo
            .patch(&a.id, Some(&json!({"tools": {"search": false}})), None)
            .unwrap();
        assert_eq!(patched.config["tools"], json!({"search": false}));
    }

    #[test]
    fn sequential_patches_increment_version() {
        let repo = repo();
        let a = repo.create(&GraphId::new("agent"), &json!({}), &json!({})).unwrap();
        repo.patch(&a.id, Some(&json!({"a": 1})), None).unwrap();
        repo.patch(&a.id, Some(&json!({"b": 2})), None).unwrap();
        let final_row = repo.patch(&a.id, None, Some(&json!({"team": "ops"}))).unwrap();
        assert_eq!(final_row.version, 4);
        assert_eq!(final_row.config, json!({"a": 1, "b": 2}));
        assert_eq!(final_row.metadata["team"], "ops");
    }

    #[test]
    fn delete_assistant() {
        let repo = repo();
        let a = repo.create(&GraphId::new("agent"), &json!({}), &json!({})).unwrap();
        repo.delete(&a.id).unwrap();
        assert!(repo.get(&a.id).is_err());
        assert!(repo.delete(&a.id).is_err());
    }

    #[test]
    fn search_by_graph_id() {
        let repo = repo();
        repo.create(&GraphId::new("agent-a"), &json!({}), &json!({})).unwrap();
        repo.create(&GraphId::new("agent-a"), &json!({}), &json!({})).unwrap();
        repo.create(&GraphId::new("agent-b"), &json!({}), &json!({})).unwrap();

        let results = repo.search(Some(&GraphId::new("agent-a")), None, 100, 0).unwrap();
        assert_eq!(results.len(), 2);
    }

    #[test]
    fn search_by_metadata() {
        let repo = repo();
        repo.create(&GraphId::new("agent"), &json!({}), &json!({"team": "ops"})).unwrap();
        repo.create(&GraphId::new("agent"), &json!({}), &json!({"team": "ml"})).unwrap();

        let results = repo
            .search(None, Some(&json!({"team": "ops"})), 100, 0)
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].metadata["team"], "ops");
    }

    #[test]
    fn search_pagination() {
        let repo = repo();
        for _ in 0..5 {
            repo.create(&GraphId::new("agent"), &json!({}), &json!({})).unwrap();
        }
        assert_eq!(repo.search(None, None, 2, 0).unwrap().len(), 2);
        assert_eq!(repo.search(None, None, 2, 4).unwrap().len(), 1);
    }

    #[test]
    fn count_assistants() {
        let repo = repo();
        assert_eq!(repo.count().unwrap(), 0);
        repo.create(&GraphId::new("agent"), &json!({}), &json!({})).unwrap();
        repo.create(&GraphId::new("agent"), &json!({}), &json!({})).unwrap();
        assert_eq!(repo.count().unwrap(), 2);
    }
}

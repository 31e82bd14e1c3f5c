//! Durable run snapshots.
//!
//! Each row holds the full JSON snapshot plus a few indexed columns for
//! listing. Saves are whole-snapshot upserts; the last write wins.

use rusqlite::OptionalExtension;

use crate::db::Database;
use crate::error::EngineError;
use crate::run::{RunFilter, WorkflowRun};

#[derive(Clone)]
pub struct RunStore {
    db: Database,
}

impl RunStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn save(&self, run: &WorkflowRun) -> Result<(), EngineError> {
        let snapshot = serde_json::to_string(run)
            .map_err(|e| EngineError::Internal(format!("Failed to serialize run {}: {}", run.id, e)))?;
        let id = run.id.clone();
        let workflow_name = run.workflow_name.clone();
        let status = run.status.as_str().to_string();
        let created_at = run.created_at.timestamp_millis();
        let updated_at = run.updated_at.timestamp_millis();

        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT INTO workflow_runs (id, workflow_name, status, snapshot, created_at, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
                     ON CONFLICT(id) DO UPDATE SET \
                     status = excluded.status, snapshot = excluded.snapshot, updated_at = excluded.updated_at",
                    rusqlite::params![id, workflow_name, status, snapshot, created_at, updated_at],
                )?;
                Ok(())
            })
            .await
    }

    /// Load a snapshot; `None` when the run was never saved.
    pub async fn load(&self, run_id: &str) -> Result<Option<WorkflowRun>, EngineError> {
        let id = run_id.to_string();
        let raw: Option<String> = self
            .db
            .with_conn_async(move |conn| {
                conn.query_row(
                    "SELECT snapshot FROM workflow_runs WHERE id = ?1",
                    rusqlite::params![id],
                    |row| row.get(0),
                )
                .optional()
            })
            .await?;

        raw.map(|json| parse_snapshot(run_id, &json)).transpose()
    }

    /// Load a snapshot or fail with `NotFound`.
    pub async fn get(&self, run_id: &str) -> Result<WorkflowRun, EngineError> {
        self.load(run_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("run {}", run_id)))
    }

    /// Stored runs matching `filter`, newest first.
    pub async fn list(&self, filter: &RunFilter) -> Result<Vec<WorkflowRun>, EngineError> {
        let workflow = filter.workflow_name.clone();
        let status = filter.status.map(|s| s.as_str().to_string());
        let limit = filter.limit.map(|l| l as i64).unwrap_or(-1);

        let rows: Vec<(String, String)> = self
            .db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, snapshot FROM workflow_runs \
                     WHERE (?1 IS NULL OR workflow_name = ?1) AND (?2 IS NULL OR status = ?2) \
                     ORDER BY created_at DESC LIMIT ?3",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![workflow, status, limit], |row| {
                        Ok((row.get(0)?, row.get(1)?))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        let mut runs = Vec::with_capacity(rows.len());
        for (id, json) in rows {
            match parse_snapshot(&id, &json) {
                Ok(run) => runs.push(run),
                Err(e) => tracing::warn!("[RunStore] Skipping unreadable run {}: {}", id, e),
            }
        }
        Ok(runs)
    }
}

fn parse_snapshot(id: &str, json: &str) -> Result<WorkflowRun, EngineError> {
    serde_json::from_str(json)
        .map_err(|e| EngineError::Database(format!("Corrupt snapshot for run {}: {}", id, e)))
}

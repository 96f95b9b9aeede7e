//! State Store: persistence of CR runs, checkpoints, and stored agent
//! conversations.
//!
//! Status transitions are compare-and-set; worker ownership of a run rests
//! entirely on winning the CAS. Checkpoints are append-only and totally
//! ordered per CR; the newest is authoritative.

mod db;

pub use db::Database;

use crate::errors::StoreError;
use chrono::Utc;
use gantry_common::run::{CrRun, PauseReason, RunStatus};
use gantry_common::snapshot::ConfigSnapshot;
use gantry_common::stage::Stage;
use gantry_common::state::PipelineState;
use rusqlite::{OptionalExtension, params};
use uuid::Uuid;

const RUN_COLUMNS: &str = "cr_id, external_id, source, title, status, current_stage, \
     cost_usd, error, pause_reason, created_at, updated_at";

#[derive(Clone)]
pub struct RunStore {
    db: Database,
}

impl RunStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create a run in status `pending`.
    ///
    /// Fails with [`StoreError::Duplicate`] when a run with the same
    /// `(source, external_id)` exists in a status other than `completed`
    /// or `failed`. The lookup and insert share one transaction.
    pub fn create_run(
        &self,
        external_id: Option<&str>,
        title: &str,
        source: &str,
        config_snapshot: &ConfigSnapshot,
        request: &serde_json::Value,
    ) -> Result<String, StoreError> {
        let cr_id = Uuid::new_v4().to_string();
        let snapshot_json = serde_json::to_string(config_snapshot)
            .map_err(|e| StoreError::Other(anyhow::anyhow!("serialize snapshot: {}", e)))?;
        let request_json = request.to_string();

        self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            if let Some(ext) = external_id {
                let existing: Option<String> = tx
                    .query_row(
                        "SELECT cr_id FROM cr_runs
                         WHERE source = ?1 AND external_id = ?2
                           AND status NOT IN ('completed','failed')",
                        params![source, ext],
                        |row| row.get(0),
                    )
                    .optional()?;
                if existing.is_some() {
                    return Err(StoreError::Duplicate {
                        source_system: source.to_string(),
                        external_id: ext.to_string(),
                    });
                }
            }
            tx.execute(
                "INSERT INTO cr_runs (cr_id, external_id, source, title, status, current_stage, config_snapshot, request)
                 VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?6, ?7)",
                params![
                    cr_id,
                    external_id,
                    source,
                    title,
                    Stage::first().as_str(),
                    snapshot_json,
                    request_json
                ],
            )?;
            tx.commit()?;
            Ok(cr_id.clone())
        })
    }

    /// Last `limit` runs, newest first.
    pub fn list_runs(&self, limit: usize) -> Result<Vec<CrRun>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {RUN_COLUMNS} FROM cr_runs ORDER BY created_at DESC, cr_id DESC LIMIT ?1"
            ))?;
            let rows = stmt.query_map(params![limit as i64], row_to_run)?;
            let mut runs = Vec::new();
            for row in rows {
                runs.push(row?);
            }
            Ok(runs)
        })
    }

    pub fn get_run(&self, cr_id: &str) -> Result<CrRun, StoreError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {RUN_COLUMNS} FROM cr_runs WHERE cr_id = ?1"),
                params![cr_id],
                row_to_run,
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound {
                cr_id: cr_id.to_string(),
            })
        })
    }

    /// Compare-and-set status transition. Returns false when the current
    /// status differs from `from` — the caller lost the claim.
    pub fn update_status(
        &self,
        cr_id: &str,
        from: RunStatus,
        to: RunStatus,
    ) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE cr_runs SET status = ?1, updated_at = ?2 WHERE cr_id = ?3 AND status = ?4",
                params![to.as_str(), Utc::now().to_rfc3339(), cr_id, from.as_str()],
            )?;
            Ok(changed == 1)
        })
    }

    /// Record the stage the executor is currently in. Clears any stale
    /// error once a node makes progress.
    pub fn record_stage(&self, cr_id: &str, stage: &str) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE cr_runs SET current_stage = ?1, error = NULL, pause_reason = NULL,
                        updated_at = ?2
                 WHERE cr_id = ?3",
                params![stage, Utc::now().to_rfc3339(), cr_id],
            )?;
            Ok(())
        })
    }

    /// Set `current_stage` without touching the error fields; used when a
    /// pause records where it occurred.
    pub fn record_current_stage(&self, cr_id: &str, stage: &str) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE cr_runs SET current_stage = ?1, updated_at = ?2 WHERE cr_id = ?3",
                params![stage, Utc::now().to_rfc3339(), cr_id],
            )?;
            Ok(())
        })
    }

    /// Record why a run paused, preserving `error` until the next
    /// successful transition.
    pub fn record_pause(
        &self,
        cr_id: &str,
        reason: PauseReason,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE cr_runs SET pause_reason = ?1, error = ?2, updated_at = ?3
                 WHERE cr_id = ?4",
                params![reason.as_str(), error, Utc::now().to_rfc3339(), cr_id],
            )?;
            Ok(())
        })
    }

    /// Append a checkpoint; the newest per CR is authoritative.
    pub fn write_checkpoint(
        &self,
        cr_id: &str,
        node_name: &str,
        state: &PipelineState,
    ) -> Result<(), StoreError> {
        let blob = serde_json::to_string(state)
            .map_err(|e| StoreError::Other(anyhow::anyhow!("serialize checkpoint: {}", e)))?;
        self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            let next: i64 = tx.query_row(
                "SELECT COALESCE(MAX(sequence), 0) + 1 FROM checkpoints WHERE cr_id = ?1",
                params![cr_id],
                |row| row.get(0),
            )?;
            tx.execute(
                "INSERT INTO checkpoints (cr_id, sequence, node_name, state_blob) VALUES (?1, ?2, ?3, ?4)",
                params![cr_id, next, node_name, blob],
            )?;
            tx.commit()?;
            Ok(())
        })
    }

    pub fn latest_checkpoint(
        &self,
        cr_id: &str,
    ) -> Result<Option<(String, PipelineState)>, StoreError> {
        self.db.with_conn(|conn| {
            let row: Option<(String, String)> = conn
                .query_row(
                    "SELECT node_name, state_blob FROM checkpoints
                     WHERE cr_id = ?1 ORDER BY sequence DESC LIMIT 1",
                    params![cr_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            match row {
                Some((node, blob)) => {
                    let state: PipelineState = serde_json::from_str(&blob).map_err(|e| {
                        StoreError::Other(anyhow::anyhow!("deserialize checkpoint: {}", e))
                    })?;
                    Ok(Some((node, state)))
                }
                None => Ok(None),
            }
        })
    }

    /// Atomic cost addition on the run record.
    pub fn increment_cost(
        &self,
        cr_id: &str,
        delta_usd: f64,
        delta_input_tokens: u64,
        delta_output_tokens: u64,
    ) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE cr_runs SET cost_usd = cost_usd + ?1,
                        input_tokens = input_tokens + ?2,
                        output_tokens = output_tokens + ?3,
                        updated_at = ?4
                 WHERE cr_id = ?5",
                params![
                    delta_usd,
                    delta_input_tokens as i64,
                    delta_output_tokens as i64,
                    Utc::now().to_rfc3339(),
                    cr_id
                ],
            )?;
            Ok(())
        })
    }

    /// The frozen config snapshot and trigger payload a run was created
    /// with.
    pub fn get_run_inputs(
        &self,
        cr_id: &str,
    ) -> Result<(ConfigSnapshot, serde_json::Value), StoreError> {
        self.db.with_conn(|conn| {
            let row: Option<(String, String)> = conn
                .query_row(
                    "SELECT config_snapshot, request FROM cr_runs WHERE cr_id = ?1",
                    params![cr_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            let (snapshot_json, request_json) = row.ok_or_else(|| StoreError::NotFound {
                cr_id: cr_id.to_string(),
            })?;
            let snapshot = serde_json::from_str(&snapshot_json).map_err(|e| {
                StoreError::Other(anyhow::anyhow!("deserialize snapshot: {}", e))
            })?;
            let request = serde_json::from_str(&request_json).map_err(|e| {
                StoreError::Other(anyhow::anyhow!("deserialize request: {}", e))
            })?;
            Ok((snapshot, request))
        })
    }

    pub fn save_conversation(
        &self,
        cr_id: &str,
        key: &str,
        messages: &serde_json::Value,
    ) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO conversations (cr_id, key, messages) VALUES (?1, ?2, ?3)
                 ON CONFLICT(cr_id, key) DO UPDATE SET messages = excluded.messages",
                params![cr_id, key, messages.to_string()],
            )?;
            Ok(())
        })
    }

    pub fn get_conversation(
        &self,
        cr_id: &str,
        key: &str,
    ) -> Result<Option<serde_json::Value>, StoreError> {
        self.db.with_conn(|conn| {
            let raw: Option<String> = conn
                .query_row(
                    "SELECT messages FROM conversations WHERE cr_id = ?1 AND key = ?2",
                    params![cr_id, key],
                    |row| row.get(0),
                )
                .optional()?;
            match raw {
                Some(raw) => Ok(Some(serde_json::from_str(&raw).map_err(|e| {
                    StoreError::Other(anyhow::anyhow!("deserialize conversation: {}", e))
                })?)),
                None => Ok(None),
            }
        })
    }
}

fn row_to_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<CrRun> {
    let status: String = row.get(4)?;
    let pause_reason: Option<String> = row.get(8)?;
    Ok(CrRun {
        cr_id: row.get(0)?,
        external_id: row.get(1)?,
        source: row.get(2)?,
        title: row.get(3)?,
        status: RunStatus::from_str(&status).unwrap_or(RunStatus::Failed),
        current_stage: row.get(5)?,
        cost_usd: row.get(6)?,
        error: row.get(7)?,
        pause_reason: pause_reason
            .as_deref()
            .and_then(|s| serde_json::from_value(serde_json::Value::String(s.to_string())).ok()),
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_common::snapshot::ConfigSnapshot;

    fn store() -> RunStore {
        RunStore::new(Database::in_memory().unwrap())
    }

    #[test]
    fn create_and_get_run() {
        let store = store();
        let snap = ConfigSnapshot::default();
        let cr_id = store
            .create_run(Some("JIRA-1"), "Add /health", "api", &snap, &serde_json::json!({}))
            .unwrap();
        let run = store.get_run(&cr_id).unwrap();
        assert_eq!(run.status, RunStatus::Pending);
        assert_eq!(run.title, "Add /health");
        assert_eq!(run.external_id.as_deref(), Some("JIRA-1"));
        assert_eq!(run.current_stage, "intake");
        assert_eq!(run.cost_usd, 0.0);
    }

    #[test]
    fn duplicate_external_id_rejected_while_non_terminal() {
        let store = store();
        let snap = ConfigSnapshot::default();
        store
            .create_run(Some("JIRA-123"), "first", "jira", &snap, &serde_json::json!({}))
            .unwrap();
        let err = store
            .create_run(Some("JIRA-123"), "second", "jira", &snap, &serde_json::json!({}))
            .unwrap_err();
        assert!(matches!(err, StoreError::Duplicate { .. }));
        assert_eq!(store.list_runs(10).unwrap().len(), 1);
    }

    #[test]
    fn duplicate_allowed_after_terminal() {
        let store = store();
        let snap = ConfigSnapshot::default();
        let first = store
            .create_run(Some("JIRA-123"), "first", "jira", &snap, &serde_json::json!({}))
            .unwrap();
        assert!(store
            .update_status(&first, RunStatus::Pending, RunStatus::Running)
            .unwrap());
        assert!(store
            .update_status(&first, RunStatus::Running, RunStatus::Completed)
            .unwrap());
        store
            .create_run(Some("JIRA-123"), "second", "jira", &snap, &serde_json::json!({}))
            .unwrap();
        assert_eq!(store.list_runs(10).unwrap().len(), 2);
    }

    #[test]
    fn same_external_id_different_source_is_not_a_duplicate() {
        let store = store();
        let snap = ConfigSnapshot::default();
        store.create_run(Some("X-1"), "a", "jira", &snap, &serde_json::json!({})).unwrap();
        store.create_run(Some("X-1"), "b", "github", &snap, &serde_json::json!({})).unwrap();
    }

    #[test]
    fn runs_without_external_id_never_collide() {
        let store = store();
        let snap = ConfigSnapshot::default();
        store.create_run(None, "a", "api", &snap, &serde_json::json!({})).unwrap();
        store.create_run(None, "b", "api", &snap, &serde_json::json!({})).unwrap();
        assert_eq!(store.list_runs(10).unwrap().len(), 2);
    }

    #[test]
    fn cas_succeeds_once() {
        let store = store();
        let cr_id = store
            .create_run(None, "t", "api", &ConfigSnapshot::default(), &serde_json::json!({}))
            .unwrap();
        assert!(store
            .update_status(&cr_id, RunStatus::Pending, RunStatus::Running)
            .unwrap());
        // A second worker loses the same CAS.
        assert!(!store
            .update_status(&cr_id, RunStatus::Pending, RunStatus::Running)
            .unwrap());
        let run = store.get_run(&cr_id).unwrap();
        assert_eq!(run.status, RunStatus::Running);
    }

    #[test]
    fn checkpoints_newest_wins() {
        let store = store();
        let cr_id = store
            .create_run(None, "t", "api", &ConfigSnapshot::default(), &serde_json::json!({}))
            .unwrap();
        assert!(store.latest_checkpoint(&cr_id).unwrap().is_none());

        let mut state = PipelineState::new("t", "d", ConfigSnapshot::default());
        store.write_checkpoint(&cr_id, "intake", &state).unwrap();
        state.behaviour.verification_loops = 2;
        store.write_checkpoint(&cr_id, "behaviour_verification", &state).unwrap();

        let (node, latest) = store.latest_checkpoint(&cr_id).unwrap().unwrap();
        assert_eq!(node, "behaviour_verification");
        assert_eq!(latest.behaviour.verification_loops, 2);
    }

    #[test]
    fn increment_cost_accumulates() {
        let store = store();
        let cr_id = store
            .create_run(None, "t", "api", &ConfigSnapshot::default(), &serde_json::json!({}))
            .unwrap();
        store.increment_cost(&cr_id, 0.5, 1000, 100).unwrap();
        store.increment_cost(&cr_id, 0.25, 500, 50).unwrap();
        let run = store.get_run(&cr_id).unwrap();
        assert!((run.cost_usd - 0.75).abs() < 1e-9);
    }

    #[test]
    fn record_pause_preserves_error_until_next_stage() {
        let store = store();
        let cr_id = store
            .create_run(None, "t", "api", &ConfigSnapshot::default(), &serde_json::json!({}))
            .unwrap();
        store
            .record_pause(&cr_id, PauseReason::NodeError, Some("agent exploded"))
            .unwrap();
        let run = store.get_run(&cr_id).unwrap();
        assert_eq!(run.error.as_deref(), Some("agent exploded"));
        assert_eq!(run.pause_reason, Some(PauseReason::NodeError));

        store.record_stage(&cr_id, "review").unwrap();
        let run = store.get_run(&cr_id).unwrap();
        assert!(run.error.is_none());
        assert!(run.pause_reason.is_none());
    }

    #[test]
    fn conversations_roundtrip_and_overwrite() {
        let store = store();
        let cr_id = store
            .create_run(None, "t", "api", &ConfigSnapshot::default(), &serde_json::json!({}))
            .unwrap();
        let msgs = serde_json::json!([{"role": "user", "content": "hi"}]);
        store.save_conversation(&cr_id, "tdd:api:code_writer", &msgs).unwrap();
        let got = store.get_conversation(&cr_id, "tdd:api:code_writer").unwrap().unwrap();
        assert_eq!(got, msgs);

        let updated = serde_json::json!([{"role": "user", "content": "hi again"}]);
        store.save_conversation(&cr_id, "tdd:api:code_writer", &updated).unwrap();
        let got = store.get_conversation(&cr_id, "tdd:api:code_writer").unwrap().unwrap();
        assert_eq!(got, updated);
        assert!(store.get_conversation(&cr_id, "missing").unwrap().is_none());
    }

    #[test]
    fn missing_run_is_not_found() {
        let store = store();
        assert!(matches!(
            store.get_run("nope").unwrap_err(),
            StoreError::NotFound { .. }
        ));
    }
}

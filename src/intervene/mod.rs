//! Intervention Registry: atomic out-of-band delivery of operator
//! commands to the running executor.
//!
//! Consumption is at-most-once: `get_and_delete` is a single
//! `DELETE ... RETURNING` statement, so exactly one caller receives a
//! given intervention. Resume overrides carry a 1-hour TTL; other kinds
//! live until consumed.

use crate::bus::EventBus;
use crate::errors::StoreError;
use crate::store::Database;
use chrono::{Duration as ChronoDuration, Utc};
use gantry_common::event::EventKind;
use gantry_common::intervention::{InterventionKind, ResumeOverrides};
use rusqlite::{OptionalExtension, params};

/// TTL for resume overrides.
const OVERRIDES_TTL_SECS: i64 = 3600;

#[derive(Clone)]
pub struct InterventionRegistry {
    db: Database,
    bus: EventBus,
}

impl InterventionRegistry {
    pub fn new(db: Database, bus: EventBus) -> Self {
        Self { db, bus }
    }

    /// Overwrite any existing intervention of the same kind/key and emit
    /// an `intervention_set` event.
    pub fn set(
        &self,
        cr_id: &str,
        kind: InterventionKind,
        role_key: &str,
        payload: &str,
        ttl_secs: Option<i64>,
    ) -> Result<(), StoreError> {
        let expires_at = ttl_secs.map(|secs| (Utc::now() + ChronoDuration::seconds(secs)).to_rfc3339());
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO interventions (cr_id, kind, role_key, payload, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(cr_id, kind, role_key) DO UPDATE
                 SET payload = excluded.payload, expires_at = excluded.expires_at",
                params![cr_id, kind.as_str(), role_key, payload, expires_at],
            )?;
            Ok(())
        })?;
        self.bus.append(
            cr_id,
            "intervention",
            EventKind::InterventionSet {
                kind: kind.as_str().to_string(),
            },
        )?;
        Ok(())
    }

    /// Atomically consume an intervention. Expired rows are treated as
    /// absent and removed.
    pub fn get_and_delete(
        &self,
        cr_id: &str,
        kind: InterventionKind,
        role_key: &str,
    ) -> Result<Option<String>, StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "DELETE FROM interventions WHERE expires_at IS NOT NULL AND expires_at <= ?1",
                params![now],
            )?;
            let payload: Option<String> = conn
                .query_row(
                    "DELETE FROM interventions
                     WHERE cr_id = ?1 AND kind = ?2 AND role_key = ?3
                     RETURNING payload",
                    params![cr_id, kind.as_str(), role_key],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(payload)
        })
    }

    /// Non-destructive read, used by resume routing.
    pub fn peek(
        &self,
        cr_id: &str,
        kind: InterventionKind,
        role_key: &str,
    ) -> Result<Option<String>, StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            let payload: Option<String> = conn
                .query_row(
                    "SELECT payload FROM interventions
                     WHERE cr_id = ?1 AND kind = ?2 AND role_key = ?3
                       AND (expires_at IS NULL OR expires_at > ?4)",
                    params![cr_id, kind.as_str(), role_key, now],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(payload)
        })
    }

    /// Store resume overrides with their fixed 1-hour TTL.
    pub fn set_overrides(
        &self,
        cr_id: &str,
        overrides: &ResumeOverrides,
    ) -> Result<(), StoreError> {
        let payload = serde_json::to_string(overrides)
            .map_err(|e| StoreError::Other(anyhow::anyhow!("serialize overrides: {}", e)))?;
        self.set(
            cr_id,
            InterventionKind::ResumeOverrides,
            "",
            &payload,
            Some(OVERRIDES_TTL_SECS),
        )
    }

    /// Consume resume overrides; invalid payloads are logged and dropped.
    pub fn take_overrides(&self, cr_id: &str) -> Result<Option<ResumeOverrides>, StoreError> {
        let Some(payload) = self.get_and_delete(cr_id, InterventionKind::ResumeOverrides, "")?
        else {
            return Ok(None);
        };
        match serde_json::from_str(&payload) {
            Ok(overrides) => Ok(Some(overrides)),
            Err(e) => {
                tracing::warn!(cr_id, error = %e, "dropping undecodable resume overrides");
                Ok(None)
            }
        }
    }
}

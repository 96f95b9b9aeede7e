//! Event Bus: per-CR append-only ordered stream with live notification.
//!
//! Events are persisted in SQLite (the bus assigns `sequence_id` inside the
//! append transaction) and fanned out over per-CR broadcast channels. The
//! replay-then-subscribe protocol in [`EventBus::stream_from`] subscribes
//! *before* replaying so events appended during the replay are buffered,
//! then de-duplicated against the replay high-water mark — no gap, no
//! duplicate.

use crate::errors::StoreError;
use crate::store::Database;
use chrono::{Duration as ChronoDuration, Utc};
use gantry_common::event::{EventKind, PipelineEvent, stream_key};
use rusqlite::params;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};

/// Capacity of each per-CR broadcast channel. Lagged receivers recover by
/// re-reading the persistent log, so overflow costs a DB read, not a gap.
const CHANNEL_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct EventBus {
    db: Database,
    tenant: String,
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<PipelineEvent>>>>,
}

impl EventBus {
    pub fn new(db: Database, tenant: &str) -> Self {
        Self {
            db,
            tenant: tenant.to_string(),
            channels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn channel(&self, cr_id: &str) -> broadcast::Sender<PipelineEvent> {
        let key = stream_key(&self.tenant, cr_id);
        let mut channels = self.channels.lock().expect("bus channel registry poisoned");
        channels
            .entry(key)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Append an event; the bus assigns the next `sequence_id` and
    /// notifies live subscribers after the row is durable.
    pub fn append(
        &self,
        cr_id: &str,
        stage: &str,
        kind: EventKind,
    ) -> Result<PipelineEvent, StoreError> {
        let event = self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            let sequence_id: i64 = tx.query_row(
                "SELECT COALESCE(MAX(sequence_id), 0) + 1 FROM events WHERE cr_id = ?1",
                params![cr_id],
                |row| row.get(0),
            )?;
            let event = PipelineEvent {
                cr_id: cr_id.to_string(),
                sequence_id,
                timestamp: Utc::now(),
                stage: stage.to_string(),
                kind,
            };
            let payload = serde_json::to_string(&event)
                .map_err(|e| StoreError::Other(anyhow::anyhow!("serialize event: {}", e)))?;
            tx.execute(
                "INSERT INTO events (cr_id, sequence_id, timestamp, stage, event_type, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    cr_id,
                    sequence_id,
                    event.timestamp.to_rfc3339(),
                    stage,
                    event.kind.event_type(),
                    payload
                ],
            )?;
            tx.commit()?;
            Ok(event)
        })?;

        // No receivers is fine; the persistent log is the source of truth.
        let _ = self.channel(cr_id).send(event.clone());
        Ok(event)
    }

    /// All events with sequence > `after_sequence_id`, in order. Rows that
    /// no longer decode are logged and dropped.
    pub fn read_since(
        &self,
        cr_id: &str,
        after_sequence_id: i64,
    ) -> Result<Vec<PipelineEvent>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT payload FROM events
                 WHERE cr_id = ?1 AND sequence_id > ?2 ORDER BY sequence_id",
            )?;
            let rows = stmt.query_map(params![cr_id, after_sequence_id], |row| {
                row.get::<_, String>(0)
            })?;
            let mut events = Vec::new();
            for row in rows {
                let payload = row?;
                match serde_json::from_str::<PipelineEvent>(&payload) {
                    Ok(event) => events.push(event),
                    Err(e) => {
                        tracing::warn!(cr_id, error = %e, "dropping undecodable event row");
                    }
                }
            }
            Ok(events)
        })
    }

    /// Live subscription; messages arrive after return.
    pub fn subscribe(&self, cr_id: &str) -> broadcast::Receiver<PipelineEvent> {
        self.channel(cr_id).subscribe()
    }

    /// Replay-then-subscribe with no gap or duplicate.
    ///
    /// Closes after any stream-terminal event (`pipeline_completed`,
    /// `pipeline_failed`, `pipeline_paused`) — whether it arrives in the
    /// replay or live.
    pub fn stream_from(&self, cr_id: &str, last_seen_id: i64) -> mpsc::Receiver<PipelineEvent> {
        let (tx, rx) = mpsc::channel(64);
        // Subscribe before replaying: events appended during the replay
        // land in the broadcast buffer and are filtered by sequence below.
        let mut live = self.subscribe(cr_id);
        let bus = self.clone();
        let cr_id = cr_id.to_string();

        tokio::spawn(async move {
            let mut high_water = last_seen_id;

            let replay = match bus.read_since(&cr_id, last_seen_id) {
                Ok(events) => events,
                Err(e) => {
                    tracing::error!(cr_id, error = %e, "event replay failed");
                    return;
                }
            };
            for event in replay {
                high_water = event.sequence_id;
                let terminal = event.kind.closes_stream();
                if tx.send(event).await.is_err() {
                    return;
                }
                if terminal {
                    return;
                }
            }

            loop {
                match live.recv().await {
                    Ok(event) => {
                        if event.sequence_id <= high_water {
                            continue;
                        }
                        high_water = event.sequence_id;
                        let terminal = event.kind.closes_stream();
                        if tx.send(event).await.is_err() {
                            return;
                        }
                        if terminal {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        // Recover the missed window from the persistent log.
                        let Ok(missed) = bus.read_since(&cr_id, high_water) else {
                            return;
                        };
                        for event in missed {
                            high_water = event.sequence_id;
                            let terminal = event.kind.closes_stream();
                            if tx.send(event).await.is_err() {
                                return;
                            }
                            if terminal {
                                return;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });

        rx
    }

    /// Highest assigned sequence for a CR, 0 when none.
    pub fn latest_sequence(&self, cr_id: &str) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            let seq: i64 = conn.query_row(
                "SELECT COALESCE(MAX(sequence_id), 0) FROM events WHERE cr_id = ?1",
                params![cr_id],
                |row| row.get(0),
            )?;
            Ok(seq)
        })
    }

    /// Delete event streams of runs that have been terminal for longer
    /// than the retention buffer. Returns the number of deleted rows.
    pub fn purge_expired(&self, retention_days: u32) -> Result<usize, StoreError> {
        let cutoff = (Utc::now() - ChronoDuration::days(retention_days as i64)).to_rfc3339();
        let deleted = self.db.with_conn(|conn| {
            let deleted = conn.execute(
                "DELETE FROM events WHERE cr_id IN (
                     SELECT cr_id FROM cr_runs
                     WHERE status IN ('completed','failed','cancelled')
                       AND updated_at < ?1
                 )",
                params![cutoff],
            )?;
            Ok(deleted)
        })?;
        if deleted > 0 {
            // Drop idle channels for purged streams.
            let mut channels = self.channels.lock().expect("bus channel registry poisoned");
            channels.retain(|_, sender| sender.receiver_count() > 0);
        }
        Ok(deleted)
    }

    /// Readiness probe.
    pub fn ping(&self) -> Result<(), StoreError> {
        self.db.ping()
    }
}

//! Shared SQLite handle.
//!
//! One connection serves the run store, event bus, and intervention
//! registry. Access is serialized behind a mutex; each multi-statement
//! operation runs inside a transaction, which makes the mutex the
//! atomicity boundary for compare-and-set and dedup checks.

use crate::errors::StoreError;
use anyhow::{Context, Result};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};

#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the database at the given path and run migrations.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init()?;
        Ok(db)
    }

    /// In-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        let conn = self.conn.lock().map_err(|_| StoreError::LockPoisoned)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS cr_runs (
                cr_id TEXT PRIMARY KEY,
                external_id TEXT,
                source TEXT NOT NULL,
                title TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                current_stage TEXT NOT NULL DEFAULT 'intake',
                cost_usd REAL NOT NULL DEFAULT 0,
                input_tokens INTEGER NOT NULL DEFAULT 0,
                output_tokens INTEGER NOT NULL DEFAULT 0,
                error TEXT,
                pause_reason TEXT,
                config_snapshot TEXT NOT NULL,
                request TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
                updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now'))
            );

            CREATE TABLE IF NOT EXISTS checkpoints (
                cr_id TEXT NOT NULL,
                sequence INTEGER NOT NULL,
                node_name TEXT NOT NULL,
                state_blob TEXT NOT NULL,
                written_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
                PRIMARY KEY (cr_id, sequence)
            );

            CREATE TABLE IF NOT EXISTS events (
                cr_id TEXT NOT NULL,
                sequence_id INTEGER NOT NULL,
                timestamp TEXT NOT NULL,
                stage TEXT NOT NULL,
                event_type TEXT NOT NULL,
                payload TEXT NOT NULL,
                PRIMARY KEY (cr_id, sequence_id)
            );

            CREATE TABLE IF NOT EXISTS interventions (
                cr_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                role_key TEXT NOT NULL DEFAULT '',
                payload TEXT NOT NULL,
                expires_at TEXT,
                PRIMARY KEY (cr_id, kind, role_key)
            );

            CREATE TABLE IF NOT EXISTS conversations (
                cr_id TEXT NOT NULL,
                key TEXT NOT NULL,
                messages TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
                PRIMARY KEY (cr_id, key)
            );

            CREATE INDEX IF NOT EXISTS idx_cr_runs_created ON cr_runs(created_at DESC);
            CREATE INDEX IF NOT EXISTS idx_cr_runs_dedup
                ON cr_runs(source, external_id)
                WHERE external_id IS NOT NULL
                  AND status NOT IN ('completed','failed');
            ",
        )
        .context("Failed to run migrations")?;
        Ok(())
    }

    /// Run a closure against the connection, mapping lock poisoning to a
    /// typed error.
    pub(crate) fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut conn = self.conn.lock().map_err(|_| StoreError::LockPoisoned)?;
        f(&mut conn)
    }

    /// Readiness probe: the database answers a trivial query.
    pub fn ping(&self) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.query_row("SELECT 1", [], |_| Ok(()))?;
            Ok(())
        })
    }
}

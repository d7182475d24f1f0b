//! Typed repository over the metadata database: secrets, telemetry events,
//! and the poison pill.
//!
//! Secret values leave this module only as [`SecretString`]; they are
//! never logged and never serialized into a response body.

use rusqlite::{params, OptionalExtension};
use secrecy::SecretString;

use super::{lock, now_unix, SharedConnection};
use crate::error::Result;

/// One `telemetry_events` row.
#[derive(Debug, Clone)]
pub struct TelemetryEvent {
    pub timestamp: i64,
    pub event_type: String,
    pub description: Option<String>,
}

#[derive(Clone)]
pub struct MetadataStore {
    conn: SharedConnection,
}

impl MetadataStore {
    #[must_use]
    pub fn new(conn: SharedConnection) -> Self {
        Self { conn }
    }

    // -- Secrets ------------------------------------------------------------

    pub fn get_secret(&self, name: &str) -> Result<Option<SecretString>> {
        let value: Option<String> = lock(&self.conn)
            .query_row(
                "SELECT secret_value FROM secrets WHERE secret_name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value.map(SecretString::new))
    }

    /// Inserts or rotates a secret, preserving the original `created_at`.
    pub fn set_secret(&self, name: &str, value: &str) -> Result<()> {
        let now = now_unix();
        lock(&self.conn).execute(
            "INSERT INTO secrets (secret_name, secret_value, created_at, last_rotated)
             VALUES (?1, ?2, ?3, ?3)
             ON CONFLICT(secret_name)
             DO UPDATE SET secret_value = ?2, last_rotated = ?3",
            params![name, value, now],
        )?;
        Ok(())
    }

    // -- Telemetry ----------------------------------------------------------

    /// Best-effort event record; failures are logged, never propagated.
    pub fn record_event(&self, event_type: &str, description: &str) {
        let result = lock(&self.conn).execute(
            "INSERT INTO telemetry_events (timestamp, event_type, description)
             VALUES (?1, ?2, ?3)",
            params![now_unix(), event_type, description],
        );
        if let Err(err) = result {
            tracing::warn!(event_type, error = %err, "failed to record telemetry event");
        }
    }

    pub fn events_of_type(&self, event_type: &str) -> Result<Vec<TelemetryEvent>> {
        let conn = lock(&self.conn);
        let mut stmt = conn.prepare(
            "SELECT timestamp, event_type, description FROM telemetry_events
             WHERE event_type = ?1 ORDER BY timestamp DESC",
        )?;
        let events = stmt
            .query_map(params![event_type], |row| {
                Ok(TelemetryEvent {
                    timestamp: row.get(0)?,
                    event_type: row.get(1)?,
                    description: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(events)
    }

    // -- Poison pill --------------------------------------------------------

    pub fn create_poisonpill(&self, signal_type: &str) -> Result<()> {
        lock(&self.conn).execute(
            "INSERT OR IGNORE INTO poisonpill (signal_type, executed) VALUES (?1, 0)",
            params![signal_type],
        )?;
        Ok(())
    }

    pub fn poisonpill_executed(&self, signal_type: &str) -> Result<bool> {
        let executed: Option<i64> = lock(&self.conn)
            .query_row(
                "SELECT executed FROM poisonpill WHERE signal_type = ?1",
                params![signal_type],
                |row| row.get(0),
            )
            .optional()?;
        Ok(executed == Some(1))
    }

    pub fn execute_poisonpill(&self, signal_type: &str, result: &str) -> Result<()> {
        lock(&self.conn).execute(
            "INSERT OR REPLACE INTO poisonpill (signal_type, executed, executed_at, execution_result)
             VALUES (?1, 1, ?2, ?3)",
            params![signal_type, now_unix(), result],
        )?;
        Ok(())
    }
}

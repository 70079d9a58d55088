//! Sync state persistence
//!
//! SQLite storage for the event ledger and the conflict log. Ledger rows
//! are write-once and unique per event_id; that uniqueness is the whole
//! idempotency mechanism. Conflict rows are write-once except for the
//! `resolved` flag, which back-office triage flips.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::{Sqlite, SqlitePool, Transaction};
use uuid::Uuid;

use super::types::{ConflictType, EventStatus};
use crate::db::{fmt_ts, parse_ts, uuid_col};
use crate::error::Result;

/// A ledger row about to be written for a processed event.
///
/// The entity_id is carried as submitted: an invalid event keeps its raw
/// (possibly empty) value so repeated bad submissions stay visible.
#[derive(Debug, Clone)]
pub struct NewEvent<'e> {
    pub event_id: Uuid,
    pub entity_type: &'e str,
    pub entity_id: &'e str,
    pub operation: &'e str,
    pub payload: &'e Map<String, Value>,
    pub device_id: &'e str,
    pub status: EventStatus,
}

/// Repository for the append-only event ledger
pub struct EventLogRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> EventLogRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Has this event_id been accepted before?
    pub async fn seen_with_tx(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        event_id: Uuid,
    ) -> Result<bool> {
        let row: (i64,) =
            sqlx::query_as("SELECT EXISTS(SELECT 1 FROM sync_events WHERE event_id = ?)")
                .bind(event_id.to_string())
                .fetch_one(&mut **tx)
                .await?;

        Ok(row.0 != 0)
    }

    /// Write the terminal ledger row for an event.
    ///
    /// Returns false when another transaction won the event_id in the
    /// meantime; the caller must treat the event as a duplicate and roll
    /// its own mutations back.
    pub async fn record_with_tx(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        event: &NewEvent<'_>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO sync_events (
                event_id, entity_type, entity_id, operation, payload_json,
                device_id, status, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(event_id) DO NOTHING
            "#,
        )
        .bind(event.event_id.to_string())
        .bind(event.entity_type)
        .bind(event.entity_id)
        .bind(event.operation)
        .bind(serde_json::to_string(event.payload)?)
        .bind(event.device_id)
        .bind(event.status.as_str())
        .bind(fmt_ts(Utc::now()))
        .execute(&mut **tx)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Count all ledger rows
    pub async fn count(&self) -> Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM sync_events")
            .fetch_one(self.pool)
            .await?;

        Ok(row.0)
    }
}

/// A conflict row about to be written alongside a rejected event
#[derive(Debug, Clone)]
pub struct NewConflict {
    pub event_id: Uuid,
    pub entity_type: String,
    pub entity_id: Uuid,
    pub conflict_type: ConflictType,
    pub server_payload: Value,
    pub client_payload: Value,
}

/// A stored conflict log entry
#[derive(Debug, Clone, serde::Serialize)]
pub struct ConflictRecord {
    pub id: i64,
    pub event_id: Uuid,
    pub entity_type: String,
    pub entity_id: Uuid,
    pub conflict_type: ConflictType,
    pub server_payload: Value,
    pub client_payload: Value,
    pub resolved: bool,
    pub created_at: DateTime<Utc>,
}

/// Repository for the conflict audit trail
pub struct ConflictLogRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> ConflictLogRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Record a conflict within the event's transaction
    pub async fn record_with_tx(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        conflict: &NewConflict,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO conflict_log (
                event_id, entity_type, entity_id, conflict_type,
                server_payload, client_payload, resolved, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, 0, ?)
            "#,
        )
        .bind(conflict.event_id.to_string())
        .bind(&conflict.entity_type)
        .bind(conflict.entity_id.to_string())
        .bind(conflict.conflict_type.as_str())
        .bind(serde_json::to_string(&conflict.server_payload)?)
        .bind(serde_json::to_string(&conflict.client_payload)?)
        .bind(fmt_ts(Utc::now()))
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    /// List conflicts, newest first, optionally filtered by resolved state
    pub async fn list(&self, resolved: Option<bool>) -> Result<Vec<ConflictRecord>> {
        let rows = match resolved {
            Some(flag) => {
                sqlx::query_as::<_, ConflictRow>(
                    r#"
                    SELECT id, event_id, entity_type, entity_id, conflict_type,
                           server_payload, client_payload, resolved, created_at
                    FROM conflict_log
                    WHERE resolved = ?
                    ORDER BY created_at DESC
                    "#,
                )
                .bind(flag)
                .fetch_all(self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, ConflictRow>(
                    r#"
                    SELECT id, event_id, entity_type, entity_id, conflict_type,
                           server_payload, client_payload, resolved, created_at
                    FROM conflict_log
                    ORDER BY created_at DESC
                    "#,
                )
                .fetch_all(self.pool)
                .await?
            }
        };

        rows.into_iter().map(|r| r.into_record()).collect()
    }

    /// Mark a conflict as resolved. Returns false if no such row.
    pub async fn resolve(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("UPDATE conflict_log SET resolved = 1 WHERE id = ?")
            .bind(id)
            .execute(self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Count unresolved conflicts
    pub async fn count_unresolved(&self) -> Result<i64> {
        let row: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM conflict_log WHERE resolved = 0")
                .fetch_one(self.pool)
                .await?;

        Ok(row.0)
    }
}

#[derive(sqlx::FromRow)]
struct ConflictRow {
    id: i64,
    event_id: String,
    entity_type: String,
    entity_id: String,
    conflict_type: String,
    server_payload: String,
    client_payload: String,
    resolved: bool,
    created_at: String,
}

impl ConflictRow {
    fn into_record(self) -> Result<ConflictRecord> {
        Ok(ConflictRecord {
            id: self.id,
            event_id: uuid_col(&self.event_id)?,
            entity_type: self.entity_type,
            entity_id: uuid_col(&self.entity_id)?,
            conflict_type: ConflictType::parse(&self.conflict_type)
                .unwrap_or(ConflictType::VersionConflict),
            server_payload: serde_json::from_str(&self.server_payload)?,
            client_payload: serde_json::from_str(&self.client_payload)?,
            resolved: self.resolved,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

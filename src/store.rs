//! Call record persistence.
//!
//! Every lifecycle event is applied as one conditional upsert whose conflict
//! branch touches only that event's fields, so concurrent events for the same
//! call compose per field instead of clobbering each other, and an event whose
//! predecessor never arrived still lands as a synthesized record.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, PgPool, Row};
use thiserror::Error;

use crate::types::{CallRecord, CallStats};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// One reconciled lifecycle event, ready to apply. The `fallback_*` fields
/// are only used when the record has to be synthesized because the event
/// arrived before its predecessor.
#[derive(Debug, Clone)]
pub enum CallChange {
    Started {
        call_id: String,
        caller_id: String,
        start_time: DateTime<Utc>,
        workflow_id: Option<String>,
        tenant_id: i64,
    },
    Ended {
        call_id: String,
        end_time: DateTime<Utc>,
        duration_seconds: Option<i32>,
        caller_id: Option<String>,
        fallback_start: DateTime<Utc>,
        fallback_duration: i32,
        workflow_id: Option<String>,
        tenant_id: i64,
    },
    Transcription {
        call_id: String,
        transcription: String,
        caller_id: Option<String>,
        fallback_start: DateTime<Utc>,
        workflow_id: Option<String>,
        tenant_id: i64,
    },
    Summary {
        call_id: String,
        summary: String,
        caller_id: Option<String>,
        fallback_start: DateTime<Utc>,
        fallback_end: DateTime<Utc>,
        fallback_duration: i32,
        workflow_id: Option<String>,
        tenant_id: i64,
    },
}

impl CallChange {
    /// Tag carried on the dashboard channel for this mutation.
    pub fn broadcast_tag(&self) -> &'static str {
        match self {
            CallChange::Started { .. } => "call_started",
            CallChange::Ended { .. } => "call_ended",
            CallChange::Transcription { .. } => "call_transcription",
            CallChange::Summary { .. } => "call_summary",
        }
    }
}

#[async_trait]
pub trait CallStore: Send + Sync {
    /// Applies one lifecycle event atomically for its `call_id`, creating the
    /// record when it does not exist yet. Returns the resulting record.
    async fn apply(&self, change: &CallChange) -> Result<CallRecord, StoreError>;

    async fn get(&self, call_id: &str) -> Result<Option<CallRecord>, StoreError>;

    /// Newest first, optionally filtered by status and capped.
    async fn list(
        &self,
        status: Option<&str>,
        limit: Option<i64>,
    ) -> Result<Vec<CallRecord>, StoreError>;

    /// Recomputed from the full record set on every query.
    async fn stats(&self) -> Result<CallStats, StoreError>;
}

const CALL_COLUMNS: &str = "call_id, caller_id, start_time, end_time, duration_seconds, \
     workflow_id, transcription, summary, status, tenant_id, created_at";

fn parse_call_row(row: PgRow) -> CallRecord {
    CallRecord {
        call_id: row.get("call_id"),
        caller_id: row.get("caller_id"),
        start_time: row.get("start_time"),
        end_time: row.get("end_time"),
        duration_seconds: row.get("duration_seconds"),
        workflow_id: row.get("workflow_id"),
        transcription: row.get("transcription"),
        summary: row.get("summary"),
        status: row.get("status"),
        tenant_id: row.get("tenant_id"),
        created_at: row.get("created_at"),
    }
}

pub fn minutes_rounded_up(total_seconds: i64) -> i64 {
    (total_seconds + 59) / 60
}

#[derive(Clone)]
pub struct PgCallStore {
    pool: PgPool,
}

impl PgCallStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CallStore for PgCallStore {
    async fn apply(&self, change: &CallChange) -> Result<CallRecord, StoreError> {
        let row = match change {
            CallChange::Started {
                call_id,
                caller_id,
                start_time,
                workflow_id,
                tenant_id,
            } => {
                sqlx::query(&format!(
                    r#"
                    INSERT INTO calls (call_id, caller_id, start_time, status, workflow_id, tenant_id, created_at)
                    VALUES ($1, $2, $3, 'in-progress', $4, $5, NOW())
                    ON CONFLICT (call_id) DO UPDATE SET
                        caller_id = EXCLUDED.caller_id,
                        start_time = EXCLUDED.start_time,
                        status = EXCLUDED.status,
                        workflow_id = EXCLUDED.workflow_id
                    RETURNING {CALL_COLUMNS}
                    "#
                ))
                .bind(call_id)
                .bind(caller_id)
                .bind(start_time)
                .bind(workflow_id)
                .bind(tenant_id)
                .fetch_one(&self.pool)
                .await?
            }
            CallChange::Ended {
                call_id,
                end_time,
                duration_seconds,
                caller_id,
                fallback_start,
                fallback_duration,
                workflow_id,
                tenant_id,
            } => {
                // Duration preference: payload value, then end minus the
                // stored start, then the synthesized fallback.
                sqlx::query(&format!(
                    r#"
                    INSERT INTO calls (call_id, caller_id, start_time, end_time, duration_seconds, status, workflow_id, tenant_id, created_at)
                    VALUES ($1, $2, $3, $4, $5, 'completed', $6, $7, NOW())
                    ON CONFLICT (call_id) DO UPDATE SET
                        end_time = EXCLUDED.end_time,
                        duration_seconds = COALESCE(
                            $8,
                            CASE WHEN calls.start_time IS NOT NULL
                                 THEN GREATEST(0, EXTRACT(EPOCH FROM (EXCLUDED.end_time - calls.start_time))::INT)
                            END,
                            EXCLUDED.duration_seconds
                        ),
                        status = EXCLUDED.status,
                        caller_id = COALESCE(calls.caller_id, EXCLUDED.caller_id)
                    RETURNING {CALL_COLUMNS}
                    "#
                ))
                .bind(call_id)
                .bind(caller_id)
                .bind(fallback_start)
                .bind(end_time)
                .bind((*duration_seconds).unwrap_or(*fallback_duration))
                .bind(workflow_id)
                .bind(tenant_id)
                .bind(duration_seconds)
                .fetch_one(&self.pool)
                .await?
            }
            CallChange::Transcription {
                call_id,
                transcription,
                caller_id,
                fallback_start,
                workflow_id,
                tenant_id,
            } => {
                sqlx::query(&format!(
                    r#"
                    INSERT INTO calls (call_id, caller_id, start_time, status, workflow_id, tenant_id, transcription, created_at)
                    VALUES ($1, $2, $3, 'in-progress', $4, $5, $6, NOW())
                    ON CONFLICT (call_id) DO UPDATE SET
                        transcription = EXCLUDED.transcription,
                        caller_id = COALESCE(calls.caller_id, EXCLUDED.caller_id)
                    RETURNING {CALL_COLUMNS}
                    "#
                ))
                .bind(call_id)
                .bind(caller_id)
                .bind(fallback_start)
                .bind(workflow_id)
                .bind(tenant_id)
                .bind(transcription)
                .fetch_one(&self.pool)
                .await?
            }
            CallChange::Summary {
                call_id,
                summary,
                caller_id,
                fallback_start,
                fallback_end,
                fallback_duration,
                workflow_id,
                tenant_id,
            } => {
                sqlx::query(&format!(
                    r#"
                    INSERT INTO calls (call_id, caller_id, start_time, end_time, duration_seconds, status, workflow_id, tenant_id, summary, created_at)
                    VALUES ($1, $2, $3, $4, $5, 'completed', $6, $7, $8, NOW())
                    ON CONFLICT (call_id) DO UPDATE SET
                        summary = EXCLUDED.summary,
                        status = EXCLUDED.status,
                        caller_id = COALESCE(calls.caller_id, EXCLUDED.caller_id)
                    RETURNING {CALL_COLUMNS}
                    "#
                ))
                .bind(call_id)
                .bind(caller_id)
                .bind(fallback_start)
                .bind(fallback_end)
                .bind(fallback_duration)
                .bind(workflow_id)
                .bind(tenant_id)
                .bind(summary)
                .fetch_one(&self.pool)
                .await?
            }
        };

        Ok(parse_call_row(row))
    }

    async fn get(&self, call_id: &str) -> Result<Option<CallRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {CALL_COLUMNS} FROM calls WHERE call_id = $1"
        ))
        .bind(call_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(parse_call_row))
    }

    async fn list(
        &self,
        status: Option<&str>,
        limit: Option<i64>,
    ) -> Result<Vec<CallRecord>, StoreError> {
        let limit = limit.filter(|value| *value > 0);
        let rows = match status {
            Some(status) => {
                sqlx::query(&format!(
                    "SELECT {CALL_COLUMNS} FROM calls WHERE status = $1 ORDER BY created_at DESC LIMIT $2"
                ))
                .bind(status)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {CALL_COLUMNS} FROM calls ORDER BY created_at DESC LIMIT $1"
                ))
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(rows.into_iter().map(parse_call_row).collect())
    }

    async fn stats(&self) -> Result<CallStats, StoreError> {
        let totals = sqlx::query(
            "SELECT COUNT(*) AS total_calls, COALESCE(SUM(duration_seconds), 0) AS total_seconds FROM calls",
        )
        .fetch_one(&self.pool)
        .await?;
        let total_calls: i64 = totals.get("total_calls");
        let total_seconds: i64 = totals.get("total_seconds");

        let rows = sqlx::query(
            "SELECT workflow_id, COUNT(*) AS count FROM calls WHERE workflow_id IS NOT NULL GROUP BY workflow_id",
        )
        .fetch_all(&self.pool)
        .await?;
        let workflow_counts = rows
            .into_iter()
            .map(|row| (row.get::<String, _>("workflow_id"), row.get::<i64, _>("count")))
            .collect::<HashMap<_, _>>();

        Ok(CallStats {
            total_calls,
            total_minutes: minutes_rounded_up(total_seconds),
            workflow_counts,
        })
    }
}

/// In-memory store mirroring the SQL semantics, used by the reconciler tests.
#[cfg(test)]
pub struct MemoryCallStore {
    calls: std::sync::Mutex<HashMap<String, CallRecord>>,
}

#[cfg(test)]
impl MemoryCallStore {
    pub fn new() -> Self {
        Self {
            calls: std::sync::Mutex::new(HashMap::new()),
        }
    }
}

#[cfg(test)]
#[async_trait]
impl CallStore for MemoryCallStore {
    async fn apply(&self, change: &CallChange) -> Result<CallRecord, StoreError> {
        let mut calls = self.calls.lock().unwrap();
        let record = match change {
            CallChange::Started {
                call_id,
                caller_id,
                start_time,
                workflow_id,
                tenant_id,
            } => {
                if let Some(existing) = calls.get_mut(call_id) {
                    existing.caller_id = Some(caller_id.clone());
                    existing.start_time = Some(*start_time);
                    existing.status = "in-progress".to_string();
                    existing.workflow_id = workflow_id.clone();
                    existing.clone()
                } else {
                    let record = CallRecord {
                        call_id: call_id.clone(),
                        caller_id: Some(caller_id.clone()),
                        start_time: Some(*start_time),
                        end_time: None,
                        duration_seconds: None,
                        workflow_id: workflow_id.clone(),
                        transcription: None,
                        summary: None,
                        status: "in-progress".to_string(),
                        tenant_id: *tenant_id,
                        created_at: Utc::now(),
                    };
                    calls.insert(call_id.clone(), record.clone());
                    record
                }
            }
            CallChange::Ended {
                call_id,
                end_time,
                duration_seconds,
                caller_id,
                fallback_start,
                fallback_duration,
                workflow_id,
                tenant_id,
            } => {
                if let Some(existing) = calls.get_mut(call_id) {
                    let computed = existing
                        .start_time
                        .map(|start| (*end_time - start).num_seconds().max(0) as i32);
                    existing.end_time = Some(*end_time);
                    existing.duration_seconds =
                        Some((*duration_seconds).or(computed).unwrap_or(*fallback_duration));
                    existing.status = "completed".to_string();
                    if existing.caller_id.is_none() {
                        existing.caller_id = caller_id.clone();
                    }
                    existing.clone()
                } else {
                    let record = CallRecord {
                        call_id: call_id.clone(),
                        caller_id: caller_id.clone(),
                        start_time: Some(*fallback_start),
                        end_time: Some(*end_time),
                        duration_seconds: Some((*duration_seconds).unwrap_or(*fallback_duration)),
                        workflow_id: workflow_id.clone(),
                        transcription: None,
                        summary: None,
                        status: "completed".to_string(),
                        tenant_id: *tenant_id,
                        created_at: Utc::now(),
                    };
                    calls.insert(call_id.clone(), record.clone());
                    record
                }
            }
            CallChange::Transcription {
                call_id,
                transcription,
                caller_id,
                fallback_start,
                workflow_id,
                tenant_id,
            } => {
                if let Some(existing) = calls.get_mut(call_id) {
                    existing.transcription = Some(transcription.clone());
                    if existing.caller_id.is_none() {
                        existing.caller_id = caller_id.clone();
                    }
                    existing.clone()
                } else {
                    let record = CallRecord {
                        call_id: call_id.clone(),
                        caller_id: caller_id.clone(),
                        start_time: Some(*fallback_start),
                        end_time: None,
                        duration_seconds: None,
                        workflow_id: workflow_id.clone(),
                        transcription: Some(transcription.clone()),
                        summary: None,
                        status: "in-progress".to_string(),
                        tenant_id: *tenant_id,
                        created_at: Utc::now(),
                    };
                    calls.insert(call_id.clone(), record.clone());
                    record
                }
            }
            CallChange::Summary {
                call_id,
                summary,
                caller_id,
                fallback_start,
                fallback_end,
                fallback_duration,
                workflow_id,
                tenant_id,
            } => {
                if let Some(existing) = calls.get_mut(call_id) {
                    existing.summary = Some(summary.clone());
                    existing.status = "completed".to_string();
                    if existing.caller_id.is_none() {
                        existing.caller_id = caller_id.clone();
                    }
                    existing.clone()
                } else {
                    let record = CallRecord {
                        call_id: call_id.clone(),
                        caller_id: caller_id.clone(),
                        start_time: Some(*fallback_start),
                        end_time: Some(*fallback_end),
                        duration_seconds: Some(*fallback_duration),
                        workflow_id: workflow_id.clone(),
                        transcription: None,
                        summary: Some(summary.clone()),
                        status: "completed".to_string(),
                        tenant_id: *tenant_id,
                        created_at: Utc::now(),
                    };
                    calls.insert(call_id.clone(), record.clone());
                    record
                }
            }
        };
        Ok(record)
    }

    async fn get(&self, call_id: &str) -> Result<Option<CallRecord>, StoreError> {
        Ok(self.calls.lock().unwrap().get(call_id).cloned())
    }

    async fn list(
        &self,
        status: Option<&str>,
        limit: Option<i64>,
    ) -> Result<Vec<CallRecord>, StoreError> {
        let mut records = self
            .calls
            .lock()
            .unwrap()
            .values()
            .filter(|record| status.map_or(true, |status| record.status == status))
            .cloned()
            .collect::<Vec<_>>();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = limit.filter(|value| *value > 0) {
            records.truncate(limit as usize);
        }
        Ok(records)
    }

    async fn stats(&self) -> Result<CallStats, StoreError> {
        let calls = self.calls.lock().unwrap();
        let total_seconds = calls
            .values()
            .map(|record| i64::from(record.duration_seconds.unwrap_or(0)))
            .sum::<i64>();
        let mut workflow_counts = HashMap::new();
        for record in calls.values() {
            if let Some(workflow_id) = &record.workflow_id {
                *workflow_counts.entry(workflow_id.clone()).or_insert(0) += 1;
            }
        }
        Ok(CallStats {
            total_calls: calls.len() as i64,
            total_minutes: minutes_rounded_up(total_seconds),
            workflow_counts,
        })
    }
}

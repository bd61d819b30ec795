use std::{collections::HashMap, sync::atomic::AtomicUsize};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};

use crate::normalize::AgentMap;
use crate::store::PgCallStore;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRecord {
    pub call_id: String,
    pub caller_id: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i32>,
    pub workflow_id: Option<String>,
    pub transcription: Option<String>,
    pub summary: Option<String>,
    pub status: String,
    pub tenant_id: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallStats {
    pub total_calls: i64,
    pub total_minutes: i64,
    pub workflow_counts: HashMap<String, i64>,
}

#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct CallsQuery {
    pub status: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Default)]
pub struct RealtimeState {
    pub clients: HashMap<usize, mpsc::UnboundedSender<String>>,
}

pub struct AppState {
    pub store: PgCallStore,
    pub agents: AgentMap,
    pub realtime: Mutex<RealtimeState>,
    pub next_client_id: AtomicUsize,
}

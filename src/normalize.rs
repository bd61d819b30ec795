//! Canonical extraction of call lifecycle events from webhook payloads.
//!
//! The voice platform's integrations have shipped several payload shapes over
//! time (header-carried event kinds, `call_id` vs `callId` vs `id`, assistant
//! vs workflow ids). Everything downstream works from the single
//! [`NormalizedEvent`] produced here.

use std::collections::HashMap;

use axum::http::HeaderMap;
use serde_json::Value;
use thiserror::Error;

pub const EVENT_KIND_HEADER: &str = "x-vapi-webhook-type";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    Started,
    Ended,
    Transcription,
    Summary,
    Unknown(String),
}

impl EventKind {
    pub fn parse(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "call.started" => EventKind::Started,
            "call.ended" => EventKind::Ended,
            "call.transcription" => EventKind::Transcription,
            "call.summary" => EventKind::Summary,
            _ => EventKind::Unknown(raw.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NormalizedEvent {
    pub kind: EventKind,
    pub call_id: String,
    pub agent_id: Option<String>,
    pub caller_id: Option<String>,
    pub duration_seconds: Option<i32>,
    pub transcription: Option<String>,
    pub summary: Option<String>,
}

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("Missing call_id in webhook payload")]
    MissingCallId,
}

/// String value under the first of `keys` that holds one; numbers are
/// coerced, since some integration versions send ids as JSON numbers.
fn coerced_field(body: &Value, keys: &[&str]) -> Option<String> {
    for key in keys {
        match body.get(key) {
            Some(Value::String(text)) if !text.trim().is_empty() => {
                return Some(text.trim().to_string())
            }
            Some(Value::Number(num)) => return Some(num.to_string()),
            _ => continue,
        }
    }
    None
}

fn text_field(body: &Value, keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Some(text) = body.get(key).and_then(Value::as_str) {
            if !text.is_empty() {
                return Some(text.to_string());
            }
        }
    }
    None
}

fn int_field(body: &Value, keys: &[&str]) -> Option<i32> {
    for key in keys {
        match body.get(key) {
            Some(Value::Number(num)) => {
                if let Some(value) = num.as_i64() {
                    return i32::try_from(value).ok();
                }
            }
            Some(Value::String(text)) => {
                if let Ok(value) = text.trim().parse::<i32>() {
                    return Some(value);
                }
            }
            _ => continue,
        }
    }
    None
}

pub fn normalize(headers: &HeaderMap, body: &Value) -> Result<NormalizedEvent, NormalizeError> {
    let raw_kind = headers
        .get(EVENT_KIND_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .or_else(|| text_field(body, &["event", "type"]))
        .unwrap_or_default();

    let call_id =
        coerced_field(body, &["call_id", "callId", "id"]).ok_or(NormalizeError::MissingCallId)?;

    Ok(NormalizedEvent {
        kind: EventKind::parse(&raw_kind),
        call_id,
        agent_id: coerced_field(body, &["agent_id", "assistant_id", "workflow_id"]),
        caller_id: text_field(body, &["caller_id", "from"]),
        duration_seconds: int_field(body, &["duration_seconds", "duration"]),
        transcription: text_field(body, &["transcription", "transcript"]),
        summary: text_field(body, &["summary"]),
    })
}

/// Agent/assistant id to tenant mapping, injected at startup. Unmapped or
/// absent agents land on the default tenant; resolution never fails.
#[derive(Debug, Clone)]
pub struct AgentMap {
    mappings: HashMap<String, i64>,
    default_tenant: i64,
}

impl AgentMap {
    pub fn new(mappings: HashMap<String, i64>, default_tenant: i64) -> Self {
        Self {
            mappings,
            default_tenant,
        }
    }

    pub fn resolve(&self, agent_id: Option<&str>) -> i64 {
        agent_id
            .and_then(|id| self.mappings.get(id).copied())
            .unwrap_or(self.default_tenant)
    }
}

//! Applies normalized lifecycle events to the call record store.
//!
//! The upstream platform gives no ordering or delivery guarantee: events can
//! arrive twice, out of order, or with their predecessor dropped entirely.
//! Every branch therefore upserts, synthesizing a record with approximate
//! backdated fields when the predecessor is missing. The approximation is
//! never corrected retroactively.

use chrono::{DateTime, Duration, Utc};

use crate::normalize::{EventKind, NormalizedEvent};
use crate::store::{CallChange, CallStore, StoreError};
use crate::types::CallRecord;

/// Caller shown when the payload carries no caller identity.
const UNKNOWN_CALLER: &str = "Unknown";

/// Assumed call length when an end or summary event arrives for a call we
/// never saw start and the payload reports no duration.
const FALLBACK_DURATION_SECONDS: i32 = 60;

/// How far a transcription-first record's start is backdated.
const TRANSCRIPTION_BACKDATE_SECONDS: i64 = 30;

/// Decides what a lifecycle event does to the store. Pure; `now` is injected
/// so the synthesized timestamps are deterministic under test. Returns `None`
/// for unrecognized event kinds, which are acknowledged without mutation.
pub fn plan(event: &NormalizedEvent, tenant_id: i64, now: DateTime<Utc>) -> Option<CallChange> {
    match &event.kind {
        EventKind::Started => Some(CallChange::Started {
            call_id: event.call_id.clone(),
            caller_id: event
                .caller_id
                .clone()
                .unwrap_or_else(|| UNKNOWN_CALLER.to_string()),
            start_time: now,
            workflow_id: event.agent_id.clone(),
            tenant_id,
        }),
        EventKind::Ended => {
            let duration_seconds = event.duration_seconds.map(|value| value.max(0));
            let fallback_duration = duration_seconds.unwrap_or(FALLBACK_DURATION_SECONDS);
            Some(CallChange::Ended {
                call_id: event.call_id.clone(),
                end_time: now,
                duration_seconds,
                caller_id: event.caller_id.clone(),
                fallback_start: now - Duration::seconds(i64::from(fallback_duration)),
                fallback_duration,
                workflow_id: event.agent_id.clone(),
                tenant_id,
            })
        }
        EventKind::Transcription => Some(CallChange::Transcription {
            call_id: event.call_id.clone(),
            transcription: event.transcription.clone().unwrap_or_default(),
            caller_id: event.caller_id.clone(),
            fallback_start: now - Duration::seconds(TRANSCRIPTION_BACKDATE_SECONDS),
            workflow_id: event.agent_id.clone(),
            tenant_id,
        }),
        EventKind::Summary => Some(CallChange::Summary {
            call_id: event.call_id.clone(),
            summary: event.summary.clone().unwrap_or_default(),
            caller_id: event.caller_id.clone(),
            fallback_start: now
                - Duration::seconds(i64::from(FALLBACK_DURATION_SECONDS)),
            fallback_end: now,
            fallback_duration: FALLBACK_DURATION_SECONDS,
            workflow_id: event.agent_id.clone(),
            tenant_id,
        }),
        EventKind::Unknown(_) => None,
    }
}

/// Reconciles one event against the store. `Ok(None)` means the event kind
/// was not recognized and nothing changed; otherwise the persisted record is
/// returned together with its broadcast tag for the dashboard channel.
pub async fn reconcile<S: CallStore + ?Sized>(
    store: &S,
    event: &NormalizedEvent,
    tenant_id: i64,
) -> Result<Option<(&'static str, CallRecord)>, StoreError> {
    let Some(change) = plan(event, tenant_id, Utc::now()) else {
        tracing::info!(call_id = %event.call_id, "unrecognized event kind, no mutation");
        return Ok(None);
    };

    let tag = change.broadcast_tag();
    let record = store.apply(&change).await?;
    tracing::info!(call_id = %record.call_id, tag, status = %record.status, "call record reconciled");
    Ok(Some((tag, record)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryCallStore;

    fn event(kind: EventKind, call_id: &str) -> NormalizedEvent {
        NormalizedEvent {
            kind,
            call_id: call_id.to_string(),
            agent_id: None,
            caller_id: None,
            duration_seconds: None,
            transcription: None,
            summary: None,
        }
    }

    #[test]
    fn started_defaults_caller_to_sentinel() {
        let now = Utc::now();
        let change = plan(&event(EventKind::Started, "c1"), 1, now).unwrap();
        match change {
            CallChange::Started {
                caller_id,
                start_time,
                ..
            } => {
                assert_eq!(caller_id, "Unknown");
                assert_eq!(start_time, now);
            }
            other => panic!("unexpected change: {other:?}"),
        }
    }

    #[test]
    fn ended_backdates_start_by_reported_duration() {
        let now = Utc::now();
        let mut ended = event(EventKind::Ended, "c1");
        ended.duration_seconds = Some(125);
        let change = plan(&ended, 1, now).unwrap();
        match change {
            CallChange::Ended {
                fallback_start,
                fallback_duration,
                end_time,
                ..
            } => {
                assert_eq!(end_time, now);
                assert_eq!(fallback_duration, 125);
                assert_eq!(fallback_start, now - Duration::seconds(125));
            }
            other => panic!("unexpected change: {other:?}"),
        }
    }

    #[test]
    fn negative_payload_duration_is_clamped() {
        let mut ended = event(EventKind::Ended, "c1");
        ended.duration_seconds = Some(-5);
        let change = plan(&ended, 1, Utc::now()).unwrap();
        match change {
            CallChange::Ended {
                duration_seconds, ..
            } => assert_eq!(duration_seconds, Some(0)),
            other => panic!("unexpected change: {other:?}"),
        }
    }

    #[test]
    fn unknown_kind_plans_nothing() {
        assert!(plan(
            &event(EventKind::Unknown("call.ping".to_string()), "c1"),
            1,
            Utc::now()
        )
        .is_none());
    }

    #[tokio::test]
    async fn started_then_ended_yields_consistent_record() {
        let store = MemoryCallStore::new();
        let mut started = event(EventKind::Started, "c1");
        started.caller_id = Some("+15550000000".to_string());
        started.agent_id = Some("A1".to_string());
        let (tag, record) = reconcile(&store, &started, 1).await.unwrap().unwrap();
        assert_eq!(tag, "call_started");
        assert_eq!(record.status, "in-progress");
        assert_eq!(record.caller_id.as_deref(), Some("+15550000000"));

        let mut ended = event(EventKind::Ended, "c1");
        ended.duration_seconds = Some(125);
        let (tag, record) = reconcile(&store, &ended, 1).await.unwrap().unwrap();
        assert_eq!(tag, "call_ended");
        assert_eq!(record.status, "completed");
        assert_eq!(record.duration_seconds, Some(125));
        assert!(record.end_time.unwrap() >= record.start_time.unwrap());
    }

    #[tokio::test]
    async fn replayed_started_event_is_idempotent() {
        let store = MemoryCallStore::new();
        let mut started = event(EventKind::Started, "c1");
        started.caller_id = Some("+15550000000".to_string());
        let first = reconcile(&store, &started, 1).await.unwrap().unwrap().1;
        let second = reconcile(&store, &started, 1).await.unwrap().unwrap().1;

        assert_eq!(store.list(None, None).await.unwrap().len(), 1);
        assert_eq!(first.call_id, second.call_id);
        assert_eq!(first.caller_id, second.caller_id);
        assert_eq!(first.status, second.status);
        assert_eq!(first.tenant_id, second.tenant_id);
        // start_time is refreshed by the replay on purpose
    }

    #[tokio::test]
    async fn transcription_before_start_keeps_single_record() {
        let store = MemoryCallStore::new();
        let mut transcription = event(EventKind::Transcription, "c1");
        transcription.transcription = Some("hello".to_string());
        let record = reconcile(&store, &transcription, 1)
            .await
            .unwrap()
            .unwrap()
            .1;
        assert_eq!(record.status, "in-progress");
        assert_eq!(record.transcription.as_deref(), Some("hello"));

        let started = event(EventKind::Started, "c1");
        reconcile(&store, &started, 1).await.unwrap().unwrap();

        let records = store.list(None, None).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].transcription.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn transcription_and_summary_compose_regardless_of_order() {
        let store = MemoryCallStore::new();
        let mut summary = event(EventKind::Summary, "c1");
        summary.summary = Some("wrap-up".to_string());
        let mut transcription = event(EventKind::Transcription, "c1");
        transcription.transcription = Some("hello".to_string());

        reconcile(&store, &summary, 1).await.unwrap().unwrap();
        reconcile(&store, &transcription, 1).await.unwrap().unwrap();

        let record = store.get("c1").await.unwrap().unwrap();
        assert_eq!(record.summary.as_deref(), Some("wrap-up"));
        assert_eq!(record.transcription.as_deref(), Some("hello"));
        assert_eq!(record.status, "completed");
    }

    #[tokio::test]
    async fn summary_with_no_prior_event_synthesizes_completed_record() {
        let store = MemoryCallStore::new();
        let mut summary = event(EventKind::Summary, "c2");
        summary.summary = Some("test".to_string());
        let (tag, record) = reconcile(&store, &summary, 1).await.unwrap().unwrap();

        assert_eq!(tag, "call_summary");
        assert_eq!(record.summary.as_deref(), Some("test"));
        assert_eq!(record.status, "completed");
        assert!(record.end_time.unwrap() > record.start_time.unwrap());
        assert_eq!(store.list(None, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn end_before_start_backdates_and_never_goes_negative() {
        let store = MemoryCallStore::new();
        let mut ended = event(EventKind::Ended, "c1");
        ended.duration_seconds = Some(90);
        let record = reconcile(&store, &ended, 1).await.unwrap().unwrap().1;

        assert_eq!(record.duration_seconds, Some(90));
        assert!(record.duration_seconds.unwrap() >= 0);
        let lag = (record.end_time.unwrap() - record.start_time.unwrap()).num_seconds();
        assert_eq!(lag, 90);
    }

    #[tokio::test]
    async fn later_events_fill_but_never_replace_caller() {
        let store = MemoryCallStore::new();
        let mut ended = event(EventKind::Ended, "c1");
        ended.caller_id = Some("+15550000001".to_string());
        reconcile(&store, &ended, 1).await.unwrap().unwrap();

        let mut summary = event(EventKind::Summary, "c1");
        summary.caller_id = Some("+15559999999".to_string());
        summary.summary = Some("s".to_string());
        let record = reconcile(&store, &summary, 1).await.unwrap().unwrap().1;
        assert_eq!(record.caller_id.as_deref(), Some("+15550000001"));
    }

    #[tokio::test]
    async fn stats_count_distinct_calls_and_round_minutes_up() {
        let store = MemoryCallStore::new();
        let mut ended = event(EventKind::Ended, "c1");
        ended.duration_seconds = Some(61);
        ended.agent_id = Some("A1".to_string());
        reconcile(&store, &ended, 1).await.unwrap().unwrap();

        let mut other = event(EventKind::Ended, "c2");
        other.duration_seconds = Some(120);
        other.agent_id = Some("A1".to_string());
        reconcile(&store, &other, 1).await.unwrap().unwrap();
        // replay must not create a second c2 row
        reconcile(&store, &other, 1).await.unwrap().unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total_calls, 2);
        assert_eq!(stats.total_minutes, 4); // ceil(181 / 60)
        assert_eq!(stats.workflow_counts.get("A1"), Some(&2));
    }

    #[tokio::test]
    async fn unknown_event_leaves_store_untouched() {
        let store = MemoryCallStore::new();
        let started = event(EventKind::Started, "c1");
        reconcile(&store, &started, 1).await.unwrap().unwrap();

        let ping = event(EventKind::Unknown("call.ping".to_string()), "c1");
        let outcome = reconcile(&store, &ping, 1).await.unwrap();
        assert!(outcome.is_none());

        let record = store.get("c1").await.unwrap().unwrap();
        assert_eq!(record.status, "in-progress");
        assert_eq!(store.list(None, None).await.unwrap().len(), 1);
    }
}

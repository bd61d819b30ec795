//! Dashboard fan-out over WebSockets.
//!
//! Connections live only in process memory; a reconnecting client re-fetches
//! its snapshot, so there is no replay or durable subscription log. Delivery
//! is best-effort: a client whose channel is gone simply misses that update,
//! everyone else is unaffected. Each connection has a single writer task fed
//! by an unbounded channel, which keeps its updates FIFO.

use std::sync::{atomic::Ordering, Arc};

use axum::extract::ws::{Message, WebSocket};
use futures_util::{sink::SinkExt, stream::StreamExt};
use serde::Serialize;
use serde_json::json;
use tokio::sync::{mpsc, Mutex};

use crate::store::CallStore;
use crate::types::{AppState, RealtimeState};

const SNAPSHOT_CALLS: i64 = 10;

fn event_payload<T: Serialize>(kind: &str, data: T) -> Option<String> {
    serde_json::to_string(&json!({ "type": kind, "data": data })).ok()
}

pub async fn broadcast_to_clients<T: Serialize>(
    realtime: &Mutex<RealtimeState>,
    kind: &str,
    data: T,
) {
    let Some(payload) = event_payload(kind, data) else {
        return;
    };

    let senders = {
        let rt = realtime.lock().await;
        rt.clients.values().cloned().collect::<Vec<_>>()
    };

    for sender in senders {
        let _ = sender.send(payload.clone());
    }
}

async fn initial_data_payload(state: &Arc<AppState>) -> Option<String> {
    let recent_calls = match state.store.list(None, Some(SNAPSHOT_CALLS)).await {
        Ok(calls) => calls,
        Err(err) => {
            tracing::error!(%err, "failed to load recent calls for snapshot");
            return None;
        }
    };
    let stats = match state.store.stats().await {
        Ok(stats) => stats,
        Err(err) => {
            tracing::error!(%err, "failed to load stats for snapshot");
            return None;
        }
    };

    event_payload(
        "initial_data",
        json!({ "recentCalls": recent_calls, "stats": stats }),
    )
}

pub async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let client_id = state.next_client_id.fetch_add(1, Ordering::Relaxed) + 1;
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    // Queue the snapshot before the client is visible to broadcasts so it is
    // always the first frame on the wire.
    if let Some(payload) = initial_data_payload(&state).await {
        let _ = tx.send(payload);
    }

    {
        let mut rt = state.realtime.lock().await;
        rt.clients.insert(client_id, tx);
    }
    tracing::info!(client_id, "dashboard client connected");

    let (mut ws_sender, mut ws_receiver) = socket.split();

    let send_task = tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            if ws_sender.send(Message::Text(payload.into())).await.is_err() {
                break;
            }
        }
    });

    // The channel is push-only; inbound frames are drained until close.
    while let Some(Ok(message)) = ws_receiver.next().await {
        if let Message::Close(_) = message {
            break;
        }
    }

    {
        let mut rt = state.realtime.lock().await;
        rt.clients.remove(&client_id);
    }
    tracing::info!(client_id, "dashboard client disconnected");

    send_task.abort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CallStats;
    use serde_json::Value;
    use std::collections::HashMap;

    #[tokio::test]
    async fn broadcast_reaches_every_open_connection() {
        let realtime = Mutex::new(RealtimeState::default());
        let (tx_a, mut rx_a) = mpsc::unbounded_channel::<String>();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel::<String>();
        {
            let mut rt = realtime.lock().await;
            rt.clients.insert(1, tx_a);
            rt.clients.insert(2, tx_b);
        }

        broadcast_to_clients(&realtime, "call_started", json!({ "callId": "c1" })).await;

        for rx in [&mut rx_a, &mut rx_b] {
            let payload: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
            assert_eq!(payload["type"], "call_started");
            assert_eq!(payload["data"]["callId"], "c1");
        }
    }

    #[tokio::test]
    async fn closed_connection_is_skipped_without_affecting_others() {
        let realtime = Mutex::new(RealtimeState::default());
        let (tx_open, mut rx_open) = mpsc::unbounded_channel::<String>();
        let (tx_gone, rx_gone) = mpsc::unbounded_channel::<String>();
        drop(rx_gone);
        {
            let mut rt = realtime.lock().await;
            rt.clients.insert(1, tx_open);
            rt.clients.insert(2, tx_gone);
        }

        broadcast_to_clients(&realtime, "call_ended", json!({ "callId": "c1" })).await;

        assert!(rx_open.recv().await.is_some());
    }

    #[tokio::test]
    async fn removed_client_receives_nothing_further() {
        let realtime = Mutex::new(RealtimeState::default());
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        {
            let mut rt = realtime.lock().await;
            rt.clients.insert(1, tx);
        }

        broadcast_to_clients(&realtime, "call_started", json!({ "callId": "c1" })).await;
        {
            let mut rt = realtime.lock().await;
            rt.clients.remove(&1);
        }
        broadcast_to_clients(&realtime, "call_ended", json!({ "callId": "c1" })).await;

        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn snapshot_envelope_shape() {
        let stats = CallStats {
            total_calls: 0,
            total_minutes: 0,
            workflow_counts: HashMap::new(),
        };
        let payload = event_payload(
            "initial_data",
            json!({ "recentCalls": Vec::<Value>::new(), "stats": stats }),
        )
        .unwrap();
        let value: Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(value["type"], "initial_data");
        assert!(value["data"]["recentCalls"].is_array());
        assert_eq!(value["data"]["stats"]["totalCalls"], 0);
        assert_eq!(value["data"]["stats"]["totalMinutes"], 0);
    }
}

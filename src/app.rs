use std::{
    collections::HashMap,
    env,
    sync::{atomic::AtomicUsize, Arc},
};

use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde_json::{json, Value};
use sqlx::postgres::PgPoolOptions;
use tokio::sync::Mutex;
use tower_http::cors::CorsLayer;
use tracing_subscriber::EnvFilter;

use crate::normalize::{normalize, AgentMap, EventKind};
use crate::realtime;
use crate::reconcile::reconcile;
use crate::store::{CallStore, PgCallStore};
use crate::types::{AppState, CallsQuery, RealtimeState, WebhookAck};

fn resolve_database_url() -> String {
    if let Ok(url) = env::var("DATABASE_URL") {
        if !url.trim().is_empty() {
            return url;
        }
    }
    let host = env::var("POSTGRES_HOST")
        .or_else(|_| env::var("PGHOST"))
        .unwrap_or_else(|_| "localhost".to_string());
    let port = env::var("POSTGRES_PORT")
        .or_else(|_| env::var("PGPORT"))
        .unwrap_or_else(|_| "5432".to_string());
    let user = env::var("POSTGRES_USER")
        .or_else(|_| env::var("PGUSER"))
        .unwrap_or_else(|_| "postgres".to_string());
    let password = env::var("POSTGRES_PASSWORD")
        .or_else(|_| env::var("PGPASSWORD"))
        .unwrap_or_else(|_| "postgres".to_string());
    let db = env::var("POSTGRES_DB")
        .or_else(|_| env::var("PGDATABASE"))
        .unwrap_or_else(|_| "call_server".to_string());
    format!("postgres://{user}:{password}@{host}:{port}/{db}")
}

/// Agent-to-tenant mapping from `AGENT_TENANT_MAPPINGS`, formatted as
/// `agent-id=tenant-id` pairs separated by commas. Unparseable pairs are
/// skipped with a warning.
fn resolve_agent_map() -> AgentMap {
    let default_tenant = env::var("DEFAULT_TENANT_ID")
        .ok()
        .and_then(|value| value.parse::<i64>().ok())
        .unwrap_or(1);

    let mut mappings = HashMap::new();
    if let Ok(raw) = env::var("AGENT_TENANT_MAPPINGS") {
        for pair in raw.split(',').filter(|pair| !pair.trim().is_empty()) {
            match pair.split_once('=') {
                Some((agent, tenant)) => match tenant.trim().parse::<i64>() {
                    Ok(tenant) => {
                        mappings.insert(agent.trim().to_string(), tenant);
                    }
                    Err(_) => tracing::warn!(pair, "ignoring agent mapping with bad tenant id"),
                },
                None => tracing::warn!(pair, "ignoring malformed agent mapping"),
            }
        }
    }

    AgentMap::new(mappings, default_tenant)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "ok": true, "now": Utc::now().to_rfc3339() }))
}

async fn vapi_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    let event = match normalize(&headers, &body) {
        Ok(event) => event,
        Err(err) => {
            tracing::warn!(%err, "rejected webhook");
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "message": err.to_string() })),
            )
                .into_response();
        }
    };

    if let EventKind::Unknown(raw) = &event.kind {
        tracing::warn!(call_id = %event.call_id, kind = %raw, "unhandled webhook event type");
        return Json(WebhookAck {
            success: true,
            message: format!("Unknown event type: {raw}"),
        })
        .into_response();
    }

    let tenant_id = state.agents.resolve(event.agent_id.as_deref());

    match reconcile(&state.store, &event, tenant_id).await {
        Ok(Some((tag, record))) => {
            realtime::broadcast_to_clients(&state.realtime, tag, &record).await;
            let message = match tag {
                "call_started" => "Call started event processed",
                "call_ended" => "Call ended event processed",
                "call_transcription" => "Call transcription event processed",
                _ => "Call summary event processed",
            };
            Json(WebhookAck {
                success: true,
                message: message.to_string(),
            })
            .into_response()
        }
        Ok(None) => Json(WebhookAck {
            success: true,
            message: "Event acknowledged".to_string(),
        })
        .into_response(),
        // Swallowed into the 200 envelope so the platform's retry policy
        // does not amplify a transient store failure.
        Err(err) => {
            tracing::error!(call_id = %event.call_id, %err, "failed to process webhook");
            Json(WebhookAck {
                success: false,
                message: "Error processing webhook".to_string(),
            })
            .into_response()
        }
    }
}

async fn get_calls(
    Query(params): Query<CallsQuery>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    match state.store.list(params.status.as_deref(), params.limit).await {
        Ok(calls) => Json(calls).into_response(),
        Err(err) => {
            tracing::error!(%err, "failed to fetch calls");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "message": "Failed to fetch calls" })),
            )
                .into_response()
        }
    }
}

async fn get_call_stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.store.stats().await {
        Ok(stats) => Json(stats).into_response(),
        Err(err) => {
            tracing::error!(%err, "failed to fetch call stats");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "message": "Failed to fetch call statistics" })),
            )
                .into_response()
        }
    }
}

async fn get_call(
    Path(call_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    match state.store.get(&call_id).await {
        Ok(Some(call)) => Json(call).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "message": "Call not found" })),
        )
            .into_response(),
        Err(err) => {
            tracing::error!(%call_id, %err, "failed to fetch call");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "message": "Failed to fetch call data" })),
            )
                .into_response()
        }
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| realtime::handle_socket(socket, state))
}

pub async fn run() {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let port = env::var("PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(4000);
    let database_url = resolve_database_url();
    let agents = resolve_agent_map();

    let db = PgPoolOptions::new()
        .max_connections(10)
        .connect(&database_url)
        .await
        .expect("failed to connect to postgres (set DATABASE_URL or POSTGRES_* env vars)");

    sqlx::migrate!("./migrations")
        .run(&db)
        .await
        .expect("failed to run sqlx migrations");

    let state = Arc::new(AppState {
        store: PgCallStore::new(db),
        agents,
        realtime: Mutex::new(RealtimeState::default()),
        next_client_id: AtomicUsize::new(0),
    });

    let app = Router::new()
        .route("/health", get(health))
        .route("/api/vapi-webhook", post(vapi_webhook))
        .route("/api/calls", get(get_calls))
        .route("/api/calls/stats", get(get_call_stats))
        .route("/api/calls/{call_id}", get(get_call))
        .route("/ws", get(ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind TCP listener");

    tracing::info!("call server listening at http://localhost:{port}");
    axum::serve(listener, app)
        .await
        .expect("server runtime failure");
}

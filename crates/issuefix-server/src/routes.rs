use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        Json,
    },
};
use issuefix_core::{pipeline::Dispatch, types::PipelineEvent};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::{info, warn};

use crate::webhook::{to_event, verify_signature, Inbound};
use crate::AppState;

// ── Health ────────────────────────────────────────────────────────────────

pub(crate) async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    let active = state.pipeline.active_issues().await;
    Json(json!({
        "status": "healthy",
        "uptime_s": state.start_time.elapsed().as_secs(),
        "active_issues": active.iter().map(|k| k.to_string()).collect::<Vec<_>>(),
    }))
}

// ── Webhook ───────────────────────────────────────────────────────────────

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

pub(crate) async fn webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<Value>) {
    if !state.webhook_secret.is_empty()
        && !verify_signature(&state.webhook_secret, &body, header(&headers, "x-hub-signature-256"))
    {
        warn!("webhook signature mismatch");
        return (StatusCode::UNAUTHORIZED, Json(json!({ "error": "invalid signature" })));
    }

    let event_type = header(&headers, "x-github-event").unwrap_or_default();
    let delivery = header(&headers, "x-github-delivery").unwrap_or_default();

    if event_type == "ping" {
        return (StatusCode::OK, Json(json!({ "status": "pong" })));
    }

    let event = match to_event(event_type, delivery, &body, &state.bot_login) {
        Ok(Inbound::Event(event)) => event,
        Ok(Inbound::Ignored(reason)) => {
            info!(event_type, delivery, %reason, "webhook ignored");
            return (StatusCode::OK, Json(json!({ "status": "ignored", "reason": reason })));
        }
        Err(e) => {
            warn!(event_type, delivery, "malformed webhook payload: {e}");
            return (StatusCode::BAD_REQUEST, Json(json!({ "error": "malformed payload" })));
        }
    };

    let issue = event.issue_key().to_string();
    let status = match state.pipeline.dispatch(event).await {
        Dispatch::Started => "started",
        Dispatch::Queued => "queued",
        Dispatch::Duplicate => "duplicate",
        Dispatch::SelfAuthored => "ignored",
    };
    info!(%issue, delivery, status, "webhook dispatched");
    (StatusCode::ACCEPTED, Json(json!({ "status": status, "issue": issue })))
}

// ── Logs & events ─────────────────────────────────────────────────────────

pub(crate) async fn recent_logs(State(state): State<Arc<AppState>>) -> Json<Value> {
    let lines: Vec<Value> = match state.log_ring.lock() {
        Ok(ring) => ring
            .iter()
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect(),
        Err(_) => Vec::new(),
    };
    Json(Value::Array(lines))
}

pub(crate) async fn sse_logs(
    State(state): State<Arc<AppState>>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, std::convert::Infallible>>> {
    let rx = state.log_tx.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|msg| {
        msg.ok().map(|data| Ok(Event::default().data(data)))
    });
    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(std::time::Duration::from_secs(15))
            .text("ping"),
    )
}

pub(crate) fn pipeline_event_json(ev: &PipelineEvent) -> Value {
    match ev {
        PipelineEvent::Transition { run_id, issue, state } => json!({
            "type": ev.kind(),
            "run_id": run_id,
            "issue": issue.to_string(),
            "state": state.as_str(),
        }),
        PipelineEvent::Finished { run_id, issue, outcome, message } => json!({
            "type": ev.kind(),
            "run_id": run_id,
            "issue": issue.to_string(),
            "outcome": outcome,
            "message": message,
        }),
    }
}

pub(crate) async fn sse_events(
    State(state): State<Arc<AppState>>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, std::convert::Infallible>>> {
    let rx = state.pipeline.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|msg| {
        msg.ok()
            .map(|ev| Ok(Event::default().event(ev.kind()).data(pipeline_event_json(&ev).to_string())))
    });
    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(std::time::Duration::from_secs(15))
            .text("ping"),
    )
}

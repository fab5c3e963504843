//! Boundary-contract handlers: health and status queries only. The full
//! control plane (campaign CRUD, scenario management) lives outside this
//! service.

use axum::{
    Json,
    extract::{Path, State},
};
use chrono::Utc;
use serde_json::{Value, json};

use crate::core::health;
use crate::errors::{AppError, AppResult};
use crate::state::AppState;

pub async fn health_check(State(state): State<AppState>) -> Json<Value> {
    let snapshot = health::collect(&state.esl, &state.registry, &state.outbound);
    Json(json!({
        "status": if snapshot.healthy { "ok" } else { "degraded" },
        "health": snapshot,
    }))
}

/// All live calls, as kept current by each session's own loop.
pub async fn list_calls(State(state): State<AppState>) -> Json<Value> {
    let calls = state.registry.snapshots();
    Json(json!({
        "count": calls.len(),
        "calls": calls,
    }))
}

pub async fn call_status(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> AppResult<Json<Value>> {
    // Live sessions come from the registry; recently-ended ones may still
    // be in the TTL-bound session store.
    let snapshot = match state.registry.get(&session_id) {
        Some(handle) => handle.snapshot(),
        None => {
            let stored = match &state.session_store {
                Some(store) => store.load_snapshot(&session_id).await,
                None => None,
            };
            stored.ok_or_else(|| AppError::NotFound(format!("session {session_id}")))?
        }
    };
    let duration = (Utc::now() - snapshot.started_at).num_seconds().max(0);
    Ok(Json(json!({
        "session_id": snapshot.session_id,
        "state": snapshot.state,
        "turn": snapshot.turn,
        "duration": duration,
        "caller_id": snapshot.caller_number,
        "scenario_id": snapshot.scenario_id,
    })))
}

pub async fn campaign_status(
    State(state): State<AppState>,
    Path(campaign_id): Path<String>,
) -> AppResult<Json<Value>> {
    let stats = state
        .outbound
        .stats(&campaign_id)
        .ok_or_else(|| AppError::NotFound(format!("campaign {campaign_id}")))?;
    Ok(Json(json!({
        "campaign_id": campaign_id,
        "stats": stats,
    })))
}

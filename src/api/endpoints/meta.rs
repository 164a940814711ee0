//! Liveness, manual trigger, and activity-feed endpoints.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::api::error::ApiError;
use crate::config::APP_VERSION;
use crate::core_state::CoreState;
use crate::db::{repository, ActivityEntry, QueueStats};

/// Heartbeat older than this many poll intervals marks the agent as stalled.
const STALL_AFTER_INTERVALS: i64 = 3;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub heartbeat: Option<String>,
    pub uptime_seconds: u64,
    pub started_at: Option<String>,
    pub documents_processed_total: i64,
    pub flags_raised_total: i64,
    pub queue: QueueStats,
    pub service: &'static str,
    pub version: &'static str,
}

/// `GET /health` — agent liveness, heartbeat age, queue totals.
pub async fn health(
    State(state): State<Arc<CoreState>>,
) -> Result<Json<HealthResponse>, ApiError> {
    let conn = state.open_db()?;
    let heartbeat = repository::get_heartbeat(&conn)?;
    let queue = repository::queue_stats(&conn)?;

    let stall_threshold =
        STALL_AFTER_INTERVALS * state.settings().poll_interval.as_secs() as i64;
    let status = match &heartbeat {
        Some(hb) if heartbeat_age_secs(&hb.last_seen).is_some_and(|age| age > stall_threshold) => {
            "stalled"
        }
        Some(_) => "running",
        None => "starting",
    };

    Ok(Json(HealthResponse {
        status,
        heartbeat: heartbeat.as_ref().map(|hb| hb.last_seen.clone()),
        uptime_seconds: state.uptime_seconds(),
        started_at: heartbeat.as_ref().map(|hb| hb.started_at.clone()),
        documents_processed_total: heartbeat
            .as_ref()
            .map(|hb| hb.documents_processed_total)
            .unwrap_or(0),
        flags_raised_total: heartbeat
            .as_ref()
            .map(|hb| hb.flags_raised_total)
            .unwrap_or(0),
        queue,
        service: "biovault-agent",
        version: APP_VERSION,
    }))
}

fn heartbeat_age_secs(last_seen: &str) -> Option<i64> {
    let parsed = DateTime::parse_from_rfc3339(last_seen).ok()?;
    Some((Utc::now() - parsed.with_timezone(&Utc)).num_seconds())
}

#[derive(Serialize)]
pub struct ProcessNowResponse {
    pub status: &'static str,
    pub message: &'static str,
}

/// `POST /agent/process-now` — cut the agent's current sleep short. The agent
/// stays autonomous; this only skips the remaining poll wait.
pub async fn process_now(State(state): State<Arc<CoreState>>) -> Json<ProcessNowResponse> {
    state.wake_agent();
    Json(ProcessNowResponse {
        status: "ok",
        message: "Agent woken — check /agent/activity for progress",
    })
}

#[derive(Deserialize)]
pub struct ActivityParams {
    #[serde(default = "default_activity_limit")]
    pub limit: i64,
}

fn default_activity_limit() -> i64 {
    60
}

#[derive(Serialize)]
pub struct ActivityResponse {
    pub entries: Vec<ActivityEntry>,
    pub has_active: bool,
    pub queue_stats: QueueStats,
}

/// `GET /agent/activity?limit=N` — recent agent log entries, oldest first.
pub async fn activity(
    State(state): State<Arc<CoreState>>,
    Query(params): Query<ActivityParams>,
) -> Result<Json<ActivityResponse>, ApiError> {
    let conn = state.open_db()?;
    let entries = repository::recent_activity(&conn, params.limit.clamp(1, 500))?;
    let queue_stats = repository::queue_stats(&conn)?;
    Ok(Json(ActivityResponse {
        entries,
        has_active: queue_stats.processing > 0,
        queue_stats,
    }))
}

//! Safety flag endpoints: list, history, resolve.

use std::sync::Arc;

use axum::extract::{Path as UrlPath, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::api::error::ApiError;
use crate::core_state::CoreState;
use crate::db::{repository, SafetyFlag};

#[derive(Serialize)]
pub struct AlertsResponse {
    pub status: &'static str,
    pub count: usize,
    pub alerts: Vec<SafetyFlag>,
}

/// `GET /alerts` — all unresolved safety flags, newest first.
pub async fn unresolved(
    State(state): State<Arc<CoreState>>,
) -> Result<Json<AlertsResponse>, ApiError> {
    let conn = state.open_db()?;
    let alerts = repository::unresolved_flags(&conn)?;
    Ok(Json(AlertsResponse {
        status: "ok",
        count: alerts.len(),
        alerts,
    }))
}

#[derive(Deserialize)]
pub struct AllParams {
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    50
}

/// `GET /alerts/all?limit=N` — resolved and unresolved flags, newest first.
pub async fn all(
    State(state): State<Arc<CoreState>>,
    Query(params): Query<AllParams>,
) -> Result<Json<AlertsResponse>, ApiError> {
    let conn = state.open_db()?;
    let alerts = repository::all_flags(&conn, params.limit.clamp(1, 500))?;
    Ok(Json(AlertsResponse {
        status: "ok",
        count: alerts.len(),
        alerts,
    }))
}

#[derive(Serialize)]
pub struct ResolveResponse {
    pub status: &'static str,
    pub flag_id: i64,
}

/// `POST /alerts/resolve/:flag_id` — mark a flag resolved. 404 when the flag
/// is missing or already resolved.
pub async fn resolve(
    State(state): State<Arc<CoreState>>,
    UrlPath(flag_id): UrlPath<i64>,
) -> Result<Json<ResolveResponse>, ApiError> {
    let conn = state.open_db()?;
    repository::resolve_safety_flag(&conn, flag_id)?;
    Ok(Json(ResolveResponse {
        status: "resolved",
        flag_id,
    }))
}

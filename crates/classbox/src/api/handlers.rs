//! API request handlers.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use classbox_protocol::{StartResponse, StatusResponse, TerminalSessionInfo};
use serde::Serialize;
use tracing::{info, instrument};

use crate::auth::CurrentUser;
use crate::projects::{Project, authorize};

use super::error::ApiResult;
use super::state::AppState;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    /// Whether phase and session records are shared with other workers.
    pub shared_store: bool,
}

/// Health check endpoint.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        shared_store: state.shared_store,
    })
}

async fn member_project(state: &AppState, user: &CurrentUser, project_id: &str) -> ApiResult<Project> {
    Ok(authorize(state.projects.as_ref(), user.id(), project_id).await?)
}

/// Kick off the build-and-start sequence. Returns immediately.
#[instrument(skip(state, user), fields(user = %user.id()))]
pub async fn start_project(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(project_id): Path<String>,
) -> ApiResult<(StatusCode, Json<StartResponse>)> {
    let project = member_project(&state, &user, &project_id).await?;
    let outcome = state.lifecycle.request_start(&project).await?;
    info!(project_id = %project.id, ?outcome, "Start requested");
    Ok((StatusCode::ACCEPTED, Json(outcome.response())))
}

#[instrument(skip(state, user), fields(user = %user.id()))]
pub async fn project_status(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(project_id): Path<String>,
) -> ApiResult<Json<StatusResponse>> {
    let project = member_project(&state, &user, &project_id).await?;
    let phase = state.lifecycle.query_status(&project).await;
    Ok(Json(StatusResponse {
        project_id: project.id,
        phase,
    }))
}

#[instrument(skip(state, user), fields(user = %user.id()))]
pub async fn stop_project(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(project_id): Path<String>,
) -> ApiResult<Json<StatusResponse>> {
    let project = member_project(&state, &user, &project_id).await?;
    let phase = state.lifecycle.request_stop(&project).await?;
    info!(project_id = %project.id, "Stopped project");
    Ok(Json(StatusResponse {
        project_id: project.id,
        phase,
    }))
}

#[instrument(skip(state, user), fields(user = %user.id()))]
pub async fn reset_project(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(project_id): Path<String>,
) -> ApiResult<Json<StatusResponse>> {
    let project = member_project(&state, &user, &project_id).await?;
    let phase = state.lifecycle.reset(&project).await?;
    info!(project_id = %project.id, "Reset project");
    Ok(Json(StatusResponse {
        project_id: project.id,
        phase,
    }))
}

/// Terminal sessions of a project, across all workers.
#[instrument(skip(state, user), fields(user = %user.id()))]
pub async fn list_terminals(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(project_id): Path<String>,
) -> ApiResult<Json<Vec<TerminalSessionInfo>>> {
    let project = member_project(&state, &user, &project_id).await?;
    Ok(Json(state.terminals.sessions_for_project(&project.id).await))
}

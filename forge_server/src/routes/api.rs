//! REST API types and logic for build submission and inspection.

use axum::http::StatusCode;
use axum::response::Json;
use serde::{Deserialize, Serialize};

use crate::cloud::{CloudProvider, ImageInfo};
use crate::metrics;
use crate::models::build::{BuildStatus, BuildSummary};
use crate::routes::AppState;
use crate::services::orchestrator;

const HISTORY_LIMIT: i64 = 50;

/// Structured error body for every failing endpoint.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

pub type ApiError = (StatusCode, Json<ErrorBody>);

fn err(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(ErrorBody { error: message.into() }))
}

// ── Build submission ──

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    #[serde(default)]
    pub image_name: String,
    #[serde(default)]
    pub distro: String,
}

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub status: &'static str,
    pub build_id: i64,
    pub message: &'static str,
}

/// Accept a build request: persist the PENDING record, launch the
/// pipeline detached, and acknowledge immediately. Two concurrent
/// builds for the same image name race on local artifacts; that is the
/// caller's responsibility.
pub async fn submit_build(
    state: &AppState,
    req: SubmitRequest,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    if req.image_name.trim().is_empty() || req.distro.trim().is_empty() {
        return Err(err(
            StatusCode::BAD_REQUEST,
            "image_name and distro fields are required",
        ));
    }

    tracing::info!(image = %req.image_name, distro = %req.distro, "received build request");

    let build_id = state.store.create_build(&req.image_name).map_err(|e| {
        tracing::error!("failed to save build: {e:#}");
        err(StatusCode::INTERNAL_SERVER_ERROR, "database error")
    })?;
    metrics::build_status_changed(BuildStatus::Pending.as_str());

    if let Err(e) = state.store.append_log(
        build_id,
        &format!("Build request received for {} ({})", req.image_name, req.distro),
    ) {
        tracing::warn!(build_id, "failed to append initial log: {e:#}");
    }

    orchestrator::spawn(state.clone(), build_id, req.image_name, req.distro);

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            status: "started",
            build_id,
            message: "Build started. VM will be launched after upload.",
        }),
    ))
}

// ── Build inspection ──

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub id: i64,
    pub status: BuildStatus,
    pub logs: String,
}

pub fn build_status(state: &AppState, build_id: i64) -> Result<Json<StatusResponse>, ApiError> {
    match state.store.get_status(build_id) {
        Ok(Some((status, logs))) => Ok(Json(StatusResponse { id: build_id, status, logs })),
        Ok(None) => {
            tracing::warn!(build_id, "build not found");
            Err(err(StatusCode::NOT_FOUND, "build not found"))
        }
        Err(e) => {
            tracing::error!(build_id, "failed to read build: {e:#}");
            Err(err(StatusCode::INTERNAL_SERVER_ERROR, "database error"))
        }
    }
}

pub fn build_history(state: &AppState) -> Result<Json<Vec<BuildSummary>>, ApiError> {
    state
        .store
        .list_recent(HISTORY_LIMIT)
        .map(Json)
        .map_err(|e| {
            tracing::error!("failed to list builds: {e:#}");
            err(StatusCode::INTERNAL_SERVER_ERROR, "database error")
        })
}

pub async fn cloud_images(state: &AppState) -> Result<Json<Vec<ImageInfo>>, ApiError> {
    state.cloud.list_images().await.map(Json).map_err(|e| {
        tracing::error!("failed to list images: {e:#}");
        err(StatusCode::INTERNAL_SERVER_ERROR, "upstream error")
    })
}

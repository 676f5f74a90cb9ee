//! HTTP surface — build submission, status polling, history, cloud
//! images, and the agent report endpoint.

pub mod api;

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::cloud::{CloudProvider, ImageInfo};
use crate::config::Config;
use crate::models::agent::{AgentReply, AgentReport};
use crate::models::build::BuildSummary;
use crate::services::builder::Builder;
use crate::services::report;
use crate::store::BuildStore;

/// Shared handles for route handlers and the pipeline tasks they spawn.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<BuildStore>,
    pub cloud: Arc<dyn CloudProvider>,
    pub builder: Arc<Builder>,
    pub config: Arc<Config>,
}

/// Build the service router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/build", post(submit_build_handler))
        .route("/api/build/{build_id}", get(build_status_handler))
        .route("/api/history", get(history_handler))
        .route("/api/images", get(cloud_images_handler))
        .route("/agent/report", post(agent_report_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn submit_build_handler(
    State(state): State<AppState>,
    Json(req): Json<api::SubmitRequest>,
) -> Result<(StatusCode, Json<api::SubmitResponse>), api::ApiError> {
    api::submit_build(&state, req).await
}

async fn build_status_handler(
    State(state): State<AppState>,
    Path(build_id): Path<i64>,
) -> Result<Json<api::StatusResponse>, api::ApiError> {
    api::build_status(&state, build_id)
}

async fn history_handler(
    State(state): State<AppState>,
) -> Result<Json<Vec<BuildSummary>>, api::ApiError> {
    api::build_history(&state)
}

async fn cloud_images_handler(
    State(state): State<AppState>,
) -> Result<Json<Vec<ImageInfo>>, api::ApiError> {
    api::cloud_images(&state).await
}

async fn agent_report_handler(
    State(state): State<AppState>,
    Json(agent_report): Json<AgentReport>,
) -> Json<AgentReply> {
    let command = report::handle_report(&state, &agent_report).await;
    Json(AgentReply { command })
}

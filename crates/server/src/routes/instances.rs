use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use manager::{CreateRequest, InstanceSnapshot, Status, UpdateRequest};
use serde::{Deserialize, Serialize};

use crate::{error::ApiError, state::AppState};

#[derive(Debug, Deserialize)]
pub struct CreateInstanceBody {
    pub backend_type: String,
    #[serde(default)]
    pub backend_options: serde_json::Value,
    #[serde(default = "default_true")]
    pub auto_restart: bool,
    #[serde(default = "default_max_restarts")]
    pub max_restarts: i64,
    #[serde(default = "default_restart_delay")]
    pub restart_delay_seconds: i64,
    #[serde(default = "default_true")]
    pub on_demand_start: bool,
    pub port: Option<u16>,
}

fn default_true() -> bool {
    true
}
fn default_max_restarts() -> i64 {
    5
}
fn default_restart_delay() -> i64 {
    2
}

#[derive(Debug, Deserialize, Default)]
pub struct UpdateInstanceBody {
    pub backend_type: Option<String>,
    pub backend_options: Option<serde_json::Value>,
    pub auto_restart: Option<bool>,
    pub max_restarts: Option<i64>,
    pub restart_delay_seconds: Option<i64>,
    pub on_demand_start: Option<bool>,
    pub port: Option<u16>,
}

#[derive(Debug, Serialize)]
pub struct InstanceView {
    pub name: String,
    pub backend_type: String,
    pub backend_options: serde_json::Value,
    pub auto_restart: bool,
    pub max_restarts: i64,
    pub restart_delay_seconds: i64,
    pub on_demand_start: bool,
    pub port: i64,
    pub created_at: i64,
    pub updated_at: i64,
    pub status: Status,
    pub restart_count: u32,
    pub last_error: Option<String>,
    pub pid: Option<u32>,
}

impl From<InstanceSnapshot> for InstanceView {
    fn from(s: InstanceSnapshot) -> Self {
        Self {
            name: s.record.name,
            backend_type: s.record.backend_type,
            backend_options: s.record.backend_options,
            auto_restart: s.record.auto_restart,
            max_restarts: s.record.max_restarts,
            restart_delay_seconds: s.record.restart_delay_seconds,
            on_demand_start: s.record.on_demand_start,
            port: s.record.port,
            created_at: s.record.created_at,
            updated_at: s.record.updated_at,
            status: s.status,
            restart_count: s.restart_count,
            last_error: s.last_error,
            pid: s.pid,
        }
    }
}

pub async fn list(State(state): State<AppState>) -> Json<Vec<InstanceView>> {
    Json(state.manager.list().await.into_iter().map(InstanceView::from).collect())
}

pub async fn create(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<CreateInstanceBody>,
) -> Result<(StatusCode, Json<InstanceView>), ApiError> {
    let snapshot = state
        .manager
        .create(CreateRequest {
            name,
            backend_type: body.backend_type,
            backend_options: body.backend_options,
            auto_restart: body.auto_restart,
            max_restarts: body.max_restarts,
            restart_delay_seconds: body.restart_delay_seconds,
            on_demand_start: body.on_demand_start,
            port: body.port,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(snapshot.into())))
}

pub async fn get(State(state): State<AppState>, Path(name): Path<String>) -> Result<Json<InstanceView>, ApiError> {
    Ok(Json(state.manager.get(&name).await?.into()))
}

pub async fn update(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<UpdateInstanceBody>,
) -> Result<Json<InstanceView>, ApiError> {
    let snapshot = state
        .manager
        .update(
            &name,
            UpdateRequest {
                backend_type: body.backend_type,
                backend_options: body.backend_options,
                auto_restart: body.auto_restart,
                max_restarts: body.max_restarts,
                restart_delay_seconds: body.restart_delay_seconds,
                on_demand_start: body.on_demand_start,
                port: body.port,
            },
        )
        .await?;
    Ok(Json(snapshot.into()))
}

pub async fn delete(State(state): State<AppState>, Path(name): Path<String>) -> Result<StatusCode, ApiError> {
    state.manager.delete(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn start(State(state): State<AppState>, Path(name): Path<String>) -> Result<StatusCode, ApiError> {
    state.manager.start(&name).await?;
    Ok(StatusCode::ACCEPTED)
}

pub async fn stop(State(state): State<AppState>, Path(name): Path<String>) -> Result<StatusCode, ApiError> {
    state.manager.stop(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn restart(State(state): State<AppState>, Path(name): Path<String>) -> Result<StatusCode, ApiError> {
    state.manager.restart(&name).await?;
    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    #[serde(default = "default_log_lines")]
    pub lines: usize,
}

fn default_log_lines() -> usize {
    200
}

#[derive(Debug, Serialize)]
pub struct LogsResponse {
    pub lines: Vec<String>,
}

pub async fn logs(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<LogsResponse>, ApiError> {
    let lines = state.manager.tail_logs(&name, query.lines).await?;
    Ok(Json(LogsResponse { lines }))
}

use crate::api::dto::server::{
    PingResponse, ServerInfoResponse, ServerListQuery, ServerResponse, ServersListResponse,
};
use crate::api::routes::AppState;
use crate::error::Result;
use crate::services::{ProbeOutcome, ServerInput};
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};

pub async fn list_servers(
    State(state): State<AppState>,
    Query(query): Query<ServerListQuery>,
) -> Result<Json<ServersListResponse>> {
    let servers = state.inventory_service.list(&query.into()).await?;
    let response = ServersListResponse {
        data: servers.into_iter().map(ServerResponse::from).collect(),
    };
    Ok(Json(response))
}

pub async fn get_server(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ServerResponse>> {
    let server = state.inventory_service.get(&id).await?;
    Ok(Json(ServerResponse::from(server)))
}

pub async fn create_server(
    State(state): State<AppState>,
    Json(req): Json<ServerInput>,
) -> Result<(StatusCode, Json<ServerResponse>)> {
    let server = state.inventory_service.upsert(None, req).await?;
    Ok((StatusCode::CREATED, Json(ServerResponse::from(server))))
}

pub async fn update_server(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ServerInput>,
) -> Result<Json<ServerResponse>> {
    let server = state.inventory_service.upsert(Some(&id), req).await?;
    Ok(Json(ServerResponse::from(server)))
}

pub async fn delete_server(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    state.inventory_service.remove(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Probes synchronously. Unreachable servers are a result, not an error.
pub async fn ping_server(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<PingResponse>> {
    let outcome = state.health_monitor.probe(&id).await?;
    let server = state.inventory_service.get(&id).await?;
    let (reachable, message) = match outcome {
        ProbeOutcome::Reachable => (true, format!("{} is reachable", server.name)),
        ProbeOutcome::Unreachable(reason) => (false, reason),
        ProbeOutcome::TimedOut => (
            false,
            format!(
                "No response within {}s",
                state.health_monitor.timeout().as_secs()
            ),
        ),
    };
    Ok(Json(PingResponse {
        reachable,
        message,
        server: ServerResponse::from(server),
    }))
}

pub async fn server_info(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ServerInfoResponse>> {
    let info = state.health_monitor.server_info(&id).await?;
    Ok(Json(ServerInfoResponse::from(info)))
}

use crate::api::dto::command::{CommandResponse, CommandsListResponse};
use crate::api::dto::execution::{ExecuteRequest, ExecutionResponse};
use crate::api::routes::AppState;
use crate::error::Result;
use crate::models::ExecutionType;
use crate::services::CommandInput;
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};

pub async fn list_commands(State(state): State<AppState>) -> Result<Json<CommandsListResponse>> {
    let commands = state.command_service.list().await?;
    let response = CommandsListResponse {
        data: commands.into_iter().map(CommandResponse::from).collect(),
    };
    Ok(Json(response))
}

pub async fn get_command(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<CommandResponse>> {
    let command = state.command_service.get(&id).await?;
    Ok(Json(CommandResponse::from(command)))
}

pub async fn create_command(
    State(state): State<AppState>,
    Json(req): Json<CommandInput>,
) -> Result<(StatusCode, Json<CommandResponse>)> {
    let command = state.command_service.create(req).await?;
    Ok((StatusCode::CREATED, Json(CommandResponse::from(command))))
}

pub async fn update_command(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<CommandInput>,
) -> Result<Json<CommandResponse>> {
    let command = state.command_service.update(&id, req).await?;
    Ok(Json(CommandResponse::from(command)))
}

pub async fn delete_command(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    state.command_service.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn execute_command(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ExecuteRequest>,
) -> Result<(StatusCode, Json<ExecutionResponse>)> {
    let execution = state
        .execution_service
        .create_execution(req.into_request(ExecutionType::Command, id))
        .await?;
    Ok((StatusCode::ACCEPTED, Json(ExecutionResponse::from(execution))))
}

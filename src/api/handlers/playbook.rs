use crate::api::dto::execution::{ExecuteRequest, ExecutionResponse};
use crate::api::dto::playbook::{PlaybookResponse, PlaybooksListResponse, TemplatesResponse};
use crate::api::routes::AppState;
use crate::error::Result;
use crate::models::ExecutionType;
use crate::services::{PlaybookInput, ValidationReport};
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};

pub async fn list_playbooks(State(state): State<AppState>) -> Result<Json<PlaybooksListResponse>> {
    let playbooks = state.playbook_service.list().await?;
    let response = PlaybooksListResponse {
        data: playbooks.into_iter().map(PlaybookResponse::from).collect(),
    };
    Ok(Json(response))
}

pub async fn list_templates(State(state): State<AppState>) -> Json<TemplatesResponse> {
    Json(TemplatesResponse {
        templates: state.playbook_service.templates(),
    })
}

pub async fn get_playbook(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<PlaybookResponse>> {
    let playbook = state.playbook_service.get(&id).await?;
    Ok(Json(PlaybookResponse::from(playbook)))
}

pub async fn create_playbook(
    State(state): State<AppState>,
    Json(req): Json<PlaybookInput>,
) -> Result<(StatusCode, Json<PlaybookResponse>)> {
    let playbook = state.playbook_service.create(req).await?;
    Ok((StatusCode::CREATED, Json(PlaybookResponse::from(playbook))))
}

pub async fn update_playbook(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<PlaybookInput>,
) -> Result<Json<PlaybookResponse>> {
    let playbook = state.playbook_service.update(&id, req).await?;
    Ok(Json(PlaybookResponse::from(playbook)))
}

pub async fn delete_playbook(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    state.playbook_service.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn validate_playbook(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ValidationReport>> {
    let report = state.playbook_service.validate(&id).await?;
    Ok(Json(report))
}

pub async fn execute_playbook(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ExecuteRequest>,
) -> Result<(StatusCode, Json<ExecutionResponse>)> {
    let execution = state
        .execution_service
        .create_execution(req.into_request(ExecutionType::Playbook, id))
        .await?;
    Ok((StatusCode::ACCEPTED, Json(ExecutionResponse::from(execution))))
}

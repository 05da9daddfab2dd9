use crate::api::dto::execution::{
    ExecutionListQuery, ExecutionResponse, ExecutionSummaryResponse, ExecutionsListResponse,
};
use crate::api::routes::AppState;
use crate::error::Result;
use axum::{
    Json,
    extract::{Path, Query, State},
};

pub async fn get_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ExecutionResponse>> {
    let execution = state.execution_service.get_execution(&id).await?;
    Ok(Json(ExecutionResponse::from(execution)))
}

pub async fn list_executions(
    State(state): State<AppState>,
    Query(query): Query<ExecutionListQuery>,
) -> Result<Json<ExecutionsListResponse>> {
    let executions = state.execution_service.list_executions(&query.into()).await?;
    let response = ExecutionsListResponse {
        data: executions
            .into_iter()
            .map(ExecutionSummaryResponse::from)
            .collect(),
    };
    Ok(Json(response))
}

/// Returns the execution as it stands; targets settle asynchronously.
pub async fn cancel_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ExecutionResponse>> {
    let execution = state.execution_service.cancel_execution(&id).await?;
    Ok(Json(ExecutionResponse::from(execution)))
}

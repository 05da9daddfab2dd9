use crate::models::{
    Execution, ExecutionStatus, ExecutionSummary, ExecutionType, ResolvedUnit, TargetCounts,
    TargetResult, TargetStatus,
};
use crate::repository::ExecutionFilter;
use crate::services::ExecutionRequest;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Body of `POST /api/commands/{id}/execute` and
/// `POST /api/playbooks/{id}/execute`. The unit comes from the path.
#[derive(Debug, Deserialize)]
pub struct ExecuteRequest {
    pub target_server_ids: Vec<String>,
    #[serde(default)]
    pub variables: BTreeMap<String, Value>,
    pub executed_by: String,
}

impl ExecuteRequest {
    pub fn into_request(self, execution_type: ExecutionType, unit_id: String) -> ExecutionRequest {
        ExecutionRequest {
            execution_type,
            unit_id,
            target_server_ids: self.target_server_ids,
            variables: self.variables,
            executed_by: self.executed_by,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ExecutionListQuery {
    pub execution_type: Option<ExecutionType>,
    pub status: Option<ExecutionStatus>,
    pub executed_by: Option<String>,
    pub limit: Option<i64>,
}

impl From<ExecutionListQuery> for ExecutionFilter {
    fn from(query: ExecutionListQuery) -> Self {
        Self {
            execution_type: query.execution_type,
            status: query.status,
            executed_by: query.executed_by,
            limit: query.limit,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TargetResultResponse {
    pub server_id: String,
    pub status: TargetStatus,
    pub exit_code: Option<i32>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub error_message: Option<String>,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

impl From<TargetResult> for TargetResultResponse {
    fn from(target: TargetResult) -> Self {
        Self {
            server_id: target.server_id,
            status: target.status,
            exit_code: target.exit_code,
            stdout: target.stdout,
            stderr: target.stderr,
            error_message: target.error_message,
            started_at: target.started_at.map(|t| t.to_rfc3339()),
            completed_at: target.completed_at.map(|t| t.to_rfc3339()),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ExecutionResponse {
    pub id: String,
    pub execution_type: ExecutionType,
    pub unit_id: String,
    pub unit_name: String,
    pub target_server_ids: Vec<String>,
    pub status: ExecutionStatus,
    pub executed_by: String,
    pub snapshot: ResolvedUnit,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub targets: Vec<TargetResultResponse>,
}

impl From<Execution> for ExecutionResponse {
    fn from(execution: Execution) -> Self {
        Self {
            id: execution.id,
            execution_type: execution.execution_type,
            unit_id: execution.unit_id,
            unit_name: execution.unit_name,
            target_server_ids: execution.target_server_ids,
            status: execution.status,
            executed_by: execution.executed_by,
            snapshot: execution.snapshot,
            started_at: execution.started_at.to_rfc3339(),
            completed_at: execution.completed_at.map(|t| t.to_rfc3339()),
            targets: execution
                .targets
                .into_iter()
                .map(TargetResultResponse::from)
                .collect(),
        }
    }
}

/// List entry: target counts only. Full results come from
/// `GET /api/executions/{id}`.
#[derive(Debug, Serialize)]
pub struct ExecutionSummaryResponse {
    pub id: String,
    pub execution_type: ExecutionType,
    pub unit_id: String,
    pub unit_name: String,
    pub status: ExecutionStatus,
    pub executed_by: String,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub target_counts: TargetCounts,
}

impl From<ExecutionSummary> for ExecutionSummaryResponse {
    fn from(summary: ExecutionSummary) -> Self {
        Self {
            id: summary.id,
            execution_type: summary.execution_type,
            unit_id: summary.unit_id,
            unit_name: summary.unit_name,
            status: summary.status,
            executed_by: summary.executed_by,
            started_at: summary.started_at.to_rfc3339(),
            completed_at: summary.completed_at.map(|t| t.to_rfc3339()),
            target_counts: summary.targets,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ExecutionsListResponse {
    pub data: Vec<ExecutionSummaryResponse>,
}

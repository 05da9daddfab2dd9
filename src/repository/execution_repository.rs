use crate::error::{AppError, Result};
use crate::models::{
    Execution, ExecutionStatus, ExecutionSummary, ExecutionType, TargetCounts, TargetResult,
    TargetStatus,
};
use crate::repository::DbPool;
use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};

const DEFAULT_LIST_LIMIT: i64 = 100;

const NON_TERMINAL: [ExecutionStatus; 2] = [ExecutionStatus::Pending, ExecutionStatus::Running];

#[derive(Debug, Clone, Default)]
pub struct ExecutionFilter {
    pub execution_type: Option<ExecutionType>,
    pub status: Option<ExecutionStatus>,
    pub executed_by: Option<String>,
    pub limit: Option<i64>,
}

#[derive(sqlx::FromRow)]
struct ExecutionRow {
    id: String,
    execution_type: ExecutionType,
    unit_id: String,
    unit_name: String,
    target_server_ids: String,
    status: ExecutionStatus,
    executed_by: String,
    snapshot: String,
    started_at: i64,
    completed_at: Option<i64>,
}

#[derive(sqlx::FromRow)]
struct SummaryRow {
    id: String,
    execution_type: ExecutionType,
    unit_id: String,
    unit_name: String,
    status: ExecutionStatus,
    executed_by: String,
    started_at: i64,
    completed_at: Option<i64>,
    total: i64,
    pending: i64,
    running: i64,
    completed: i64,
    failed: i64,
    timed_out: i64,
}

#[derive(sqlx::FromRow)]
struct TargetRow {
    server_id: String,
    status: TargetStatus,
    exit_code: Option<i32>,
    stdout: Option<String>,
    stderr: Option<String>,
    error_message: Option<String>,
    started_at: Option<i64>,
    completed_at: Option<i64>,
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| AppError::Internal(format!("Stored timestamp out of range: {}", ms)))
}

fn from_optional_millis(ms: Option<i64>) -> Result<Option<DateTime<Utc>>> {
    ms.map(from_millis).transpose()
}

impl TryFrom<SummaryRow> for ExecutionSummary {
    type Error = AppError;

    fn try_from(row: SummaryRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            execution_type: row.execution_type,
            unit_id: row.unit_id,
            unit_name: row.unit_name,
            status: row.status,
            executed_by: row.executed_by,
            started_at: from_millis(row.started_at)?,
            completed_at: from_optional_millis(row.completed_at)?,
            targets: TargetCounts {
                total: row.total,
                pending: row.pending,
                running: row.running,
                completed: row.completed,
                failed: row.failed,
                timed_out: row.timed_out,
            },
        })
    }
}

impl TryFrom<TargetRow> for TargetResult {
    type Error = AppError;

    fn try_from(row: TargetRow) -> Result<Self> {
        Ok(Self {
            server_id: row.server_id,
            status: row.status,
            exit_code: row.exit_code,
            stdout: row.stdout,
            stderr: row.stderr,
            error_message: row.error_message,
            started_at: from_optional_millis(row.started_at)?,
            completed_at: from_optional_millis(row.completed_at)?,
        })
    }
}

#[derive(Clone)]
pub struct ExecutionRepository {
    pool: DbPool,
}

impl ExecutionRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Inserts the execution row together with one row per target.
    pub async fn create(&self, execution: &Execution) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO executions (id, execution_type, unit_id, unit_name, target_server_ids, status, executed_by, snapshot, started_at, completed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&execution.id)
        .bind(execution.execution_type as i32)
        .bind(&execution.unit_id)
        .bind(&execution.unit_name)
        .bind(serde_json::to_string(&execution.target_server_ids)?)
        .bind(execution.status as i32)
        .bind(&execution.executed_by)
        .bind(serde_json::to_string(&execution.snapshot)?)
        .bind(execution.started_at.timestamp_millis())
        .bind(execution.completed_at.map(|t| t.timestamp_millis()))
        .execute(&mut *tx)
        .await?;

        for (position, target) in execution.targets.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO target_results (execution_id, position, server_id, status, exit_code, stdout, stderr, error_message, started_at, completed_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&execution.id)
            .bind(position as i64)
            .bind(&target.server_id)
            .bind(target.status as i32)
            .bind(target.exit_code)
            .bind(&target.stdout)
            .bind(&target.stderr)
            .bind(&target.error_message)
            .bind(target.started_at.map(|t| t.timestamp_millis()))
            .bind(target.completed_at.map(|t| t.timestamp_millis()))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Reads the execution row and its targets from one snapshot.
    pub async fn get(&self, id: &str) -> Result<Execution> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, ExecutionRow>("SELECT * FROM executions WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| AppError::not_found("Execution", id))?;
        let execution = hydrate(&mut tx, row).await?;

        tx.commit().await?;
        Ok(execution)
    }

    /// Most recent first, with target counts aggregated in the same query.
    pub async fn list(&self, filter: &ExecutionFilter) -> Result<Vec<ExecutionSummary>> {
        let mut query: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            r#"
            SELECT e.id, e.execution_type, e.unit_id, e.unit_name, e.status, e.executed_by, e.started_at, e.completed_at,
                COUNT(t.server_id) AS total,
                COALESCE(SUM(CASE WHEN t.status = {pending} THEN 1 ELSE 0 END), 0) AS pending,
                COALESCE(SUM(CASE WHEN t.status = {running} THEN 1 ELSE 0 END), 0) AS running,
                COALESCE(SUM(CASE WHEN t.status = {completed} THEN 1 ELSE 0 END), 0) AS completed,
                COALESCE(SUM(CASE WHEN t.status = {failed} THEN 1 ELSE 0 END), 0) AS failed,
                COALESCE(SUM(CASE WHEN t.status = {timed_out} THEN 1 ELSE 0 END), 0) AS timed_out
            FROM executions e
            LEFT JOIN target_results t ON t.execution_id = e.id
            WHERE 1 = 1
            "#,
            pending = TargetStatus::Pending as i32,
            running = TargetStatus::Running as i32,
            completed = TargetStatus::Completed as i32,
            failed = TargetStatus::Failed as i32,
            timed_out = TargetStatus::TimedOut as i32,
        ));
        if let Some(execution_type) = filter.execution_type {
            query
                .push(" AND e.execution_type = ")
                .push_bind(execution_type as i32);
        }
        if let Some(status) = filter.status {
            query.push(" AND e.status = ").push_bind(status as i32);
        }
        if let Some(executed_by) = &filter.executed_by {
            query
                .push(" AND e.executed_by = ")
                .push_bind(executed_by.clone());
        }
        query
            .push(" GROUP BY e.id ORDER BY e.started_at DESC, e.rowid DESC LIMIT ")
            .push_bind(filter.limit.unwrap_or(DEFAULT_LIST_LIMIT).max(1));

        query
            .build_query_as::<SummaryRow>()
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(ExecutionSummary::try_from)
            .collect()
    }

    /// Writes target rows and the aggregate status they produce in one
    /// transaction, so readers never see one without the other.
    pub async fn apply_targets(
        &self,
        execution_id: &str,
        targets: &[&TargetResult],
        status: ExecutionStatus,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for target in targets {
            sqlx::query(
                r#"
                UPDATE target_results
                SET status = ?, exit_code = ?, stdout = ?, stderr = ?, error_message = ?, started_at = ?, completed_at = ?
                WHERE execution_id = ? AND server_id = ?
                "#,
            )
            .bind(target.status as i32)
            .bind(target.exit_code)
            .bind(&target.stdout)
            .bind(&target.stderr)
            .bind(&target.error_message)
            .bind(target.started_at.map(|t| t.timestamp_millis()))
            .bind(target.completed_at.map(|t| t.timestamp_millis()))
            .bind(execution_id)
            .bind(&target.server_id)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query("UPDATE executions SET status = ?, completed_at = ? WHERE id = ?")
            .bind(status as i32)
            .bind(completed_at.map(|t| t.timestamp_millis()))
            .bind(execution_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn has_active_for_unit(
        &self,
        execution_type: ExecutionType,
        unit_id: &str,
    ) -> Result<bool> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM executions WHERE execution_type = ? AND unit_id = ? AND status IN (?, ?)",
        )
        .bind(execution_type as i32)
        .bind(unit_id)
        .bind(NON_TERMINAL[0] as i32)
        .bind(NON_TERMINAL[1] as i32)
        .fetch_one(&self.pool)
        .await?;

        Ok(count > 0)
    }

    pub async fn has_active_targeting(&self, server_id: &str) -> Result<bool> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM target_results t
            JOIN executions e ON e.id = t.execution_id
            WHERE t.server_id = ? AND e.status IN (?, ?)
            "#,
        )
        .bind(server_id)
        .bind(NON_TERMINAL[0] as i32)
        .bind(NON_TERMINAL[1] as i32)
        .fetch_one(&self.pool)
        .await?;

        Ok(count > 0)
    }

    pub async fn list_active_ids(&self) -> Result<Vec<String>> {
        let ids = sqlx::query_scalar::<_, String>(
            "SELECT id FROM executions WHERE status IN (?, ?) ORDER BY started_at",
        )
        .bind(NON_TERMINAL[0] as i32)
        .bind(NON_TERMINAL[1] as i32)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }
}

async fn hydrate(conn: &mut SqliteConnection, row: ExecutionRow) -> Result<Execution> {
    let targets = sqlx::query_as::<_, TargetRow>(
        r#"
        SELECT server_id, status, exit_code, stdout, stderr, error_message, started_at, completed_at
        FROM target_results
        WHERE execution_id = ?
        ORDER BY position
        "#,
    )
    .bind(&row.id)
    .fetch_all(&mut *conn)
    .await?
    .into_iter()
    .map(TargetResult::try_from)
    .collect::<Result<Vec<_>>>()?;

    Ok(Execution {
        id: row.id,
        execution_type: row.execution_type,
        unit_id: row.unit_id,
        unit_name: row.unit_name,
        target_server_ids: serde_json::from_str(&row.target_server_ids)?,
        status: row.status,
        executed_by: row.executed_by,
        snapshot: serde_json::from_str(&row.snapshot)?,
        started_at: from_millis(row.started_at)?,
        completed_at: from_optional_millis(row.completed_at)?,
        targets,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ResolvedStep, ResolvedUnit};
    use crate::repository::test_pool;
    use std::collections::BTreeMap;

    fn execution(server_ids: &[&str]) -> Execution {
        Execution {
            id: uuid::Uuid::new_v4().to_string(),
            execution_type: ExecutionType::Command,
            unit_id: "cmd-1".to_string(),
            unit_name: "uptime".to_string(),
            target_server_ids: server_ids.iter().map(|s| s.to_string()).collect(),
            status: ExecutionStatus::Pending,
            executed_by: "alice".to_string(),
            snapshot: ResolvedUnit {
                execution_type: ExecutionType::Command,
                unit_id: "cmd-1".to_string(),
                unit_name: "uptime".to_string(),
                steps: vec![ResolvedStep {
                    name: "uptime".to_string(),
                    command: "uptime".to_string(),
                    timeout_secs: 5,
                }],
                variables: BTreeMap::new(),
            },
            started_at: Utc::now(),
            completed_at: None,
            targets: server_ids.iter().map(|s| TargetResult::pending(*s)).collect(),
        }
    }

    fn settle(target: &mut TargetResult, status: TargetStatus) {
        target.status = status;
        target.completed_at = Some(Utc::now());
    }

    #[tokio::test]
    async fn targets_and_status_are_written_together() {
        let dir = tempfile::tempdir().unwrap();
        let repo = ExecutionRepository::new(test_pool(&dir).await);
        let mut execution = execution(&["s1", "s2"]);
        repo.create(&execution).await.unwrap();

        settle(&mut execution.targets[0], TargetStatus::Completed);
        settle(&mut execution.targets[1], TargetStatus::TimedOut);
        let status = execution.derived_status();
        let completed_at = Some(Utc::now());
        let changed: Vec<&TargetResult> = execution.targets.iter().collect();
        repo.apply_targets(&execution.id, &changed, status, completed_at)
            .await
            .unwrap();

        let stored = repo.get(&execution.id).await.unwrap();
        assert_eq!(stored.status, ExecutionStatus::PartiallyFailed);
        assert_eq!(stored.status, stored.derived_status());
        assert!(stored.completed_at.is_some());
        assert_eq!(stored.targets[1].status, TargetStatus::TimedOut);
    }

    #[tokio::test]
    async fn listing_returns_counts_instead_of_targets() {
        let dir = tempfile::tempdir().unwrap();
        let repo = ExecutionRepository::new(test_pool(&dir).await);
        let mut first = execution(&["s1", "s2", "s3"]);
        repo.create(&first).await.unwrap();
        let second = execution(&["s1"]);
        repo.create(&second).await.unwrap();

        settle(&mut first.targets[0], TargetStatus::Completed);
        settle(&mut first.targets[1], TargetStatus::Failed);
        repo.apply_targets(
            &first.id,
            &[&first.targets[0], &first.targets[1]],
            first.derived_status(),
            None,
        )
        .await
        .unwrap();

        let summaries = repo.list(&ExecutionFilter::default()).await.unwrap();
        assert_eq!(summaries.len(), 2);
        let summary = summaries.iter().find(|s| s.id == first.id).unwrap();
        assert_eq!(summary.status, ExecutionStatus::Running);
        assert_eq!(
            summary.targets,
            TargetCounts {
                total: 3,
                pending: 1,
                running: 0,
                completed: 1,
                failed: 1,
                timed_out: 0,
            }
        );

        let running = repo
            .list(&ExecutionFilter {
                status: Some(ExecutionStatus::Running),
                ..ExecutionFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, first.id);
    }
}

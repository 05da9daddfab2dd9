use super::ResolvedUnit;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: String,
    pub execution_type: ExecutionType,
    pub unit_id: String,
    pub unit_name: String,
    pub target_server_ids: Vec<String>,
    pub status: ExecutionStatus,
    pub executed_by: String,
    pub snapshot: ResolvedUnit,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub targets: Vec<TargetResult>,
}

/// Listing view of an execution: per-status target counts instead of
/// the target rows.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ExecutionSummary {
    pub id: String,
    pub execution_type: ExecutionType,
    pub unit_id: String,
    pub unit_name: String,
    pub status: ExecutionStatus,
    pub executed_by: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub targets: TargetCounts,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct TargetCounts {
    pub total: i64,
    pub pending: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
    pub timed_out: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TargetResult {
    pub server_id: String,
    pub status: TargetStatus,
    pub exit_code: Option<i32>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TargetResult {
    pub fn pending(server_id: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
            status: TargetStatus::Pending,
            exit_code: None,
            stdout: None,
            stderr: None,
            error_message: None,
            started_at: None,
            completed_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[repr(i32)]
pub enum ExecutionType {
    Command = 0,
    Playbook = 1,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[repr(i32)]
pub enum ExecutionStatus {
    Pending = 0,
    Running = 1,
    Completed = 2,
    Failed = 3,
    PartiallyFailed = 4,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[repr(i32)]
pub enum TargetStatus {
    Pending = 0,
    Running = 1,
    Completed = 2,
    Failed = 3,
    TimedOut = 4,
}

impl ExecutionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Command => "command",
            Self::Playbook => "playbook",
        }
    }
}

impl TargetStatus {
    pub fn is_terminal(&self) -> bool {
        match self {
            Self::Pending | Self::Running => false,
            Self::Completed | Self::Failed | Self::TimedOut => true,
        }
    }
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        match self {
            Self::Pending | Self::Running => false,
            Self::Completed | Self::Failed | Self::PartiallyFailed => true,
        }
    }

    /// Derives the aggregate status from per-target statuses.
    ///
    /// Terminal exactly when every target is terminal. `Pending` only while
    /// no target has left `Pending`.
    pub fn aggregate<I>(statuses: I) -> Self
    where
        I: IntoIterator<Item = TargetStatus>,
    {
        let mut total = 0usize;
        let mut pending = 0usize;
        let mut completed = 0usize;
        let mut unsuccessful = 0usize;

        for status in statuses {
            total += 1;
            match status {
                TargetStatus::Pending => pending += 1,
                TargetStatus::Running => {}
                TargetStatus::Completed => completed += 1,
                TargetStatus::Failed | TargetStatus::TimedOut => unsuccessful += 1,
            }
        }

        if total == 0 || pending == total {
            return Self::Pending;
        }
        if completed + unsuccessful < total {
            return Self::Running;
        }
        match (completed, unsuccessful) {
            (_, 0) => Self::Completed,
            (0, _) => Self::Failed,
            _ => Self::PartiallyFailed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::PartiallyFailed => "partially_failed",
        }
    }
}

impl Execution {
    pub fn derived_status(&self) -> ExecutionStatus {
        ExecutionStatus::aggregate(self.targets.iter().map(|t| t.status))
    }

    pub fn target(&self, server_id: &str) -> Option<&TargetResult> {
        self.targets.iter().find(|t| t.server_id == server_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use TargetStatus::*;

    #[test]
    fn aggregate_follows_target_statuses() {
        assert_eq!(
            ExecutionStatus::aggregate([Pending, Pending]),
            ExecutionStatus::Pending
        );
        assert_eq!(
            ExecutionStatus::aggregate([Running, Pending]),
            ExecutionStatus::Running
        );
        assert_eq!(
            ExecutionStatus::aggregate([Completed, Pending]),
            ExecutionStatus::Running
        );
        assert_eq!(
            ExecutionStatus::aggregate([Completed, Completed]),
            ExecutionStatus::Completed
        );
        assert_eq!(
            ExecutionStatus::aggregate([Failed, TimedOut]),
            ExecutionStatus::Failed
        );
        assert_eq!(
            ExecutionStatus::aggregate([Completed, TimedOut, Failed]),
            ExecutionStatus::PartiallyFailed
        );
    }

    #[test]
    fn terminal_aggregate_requires_every_target_terminal() {
        for statuses in [
            vec![Completed, Running],
            vec![Failed, Pending],
            vec![TimedOut, Running, Completed],
        ] {
            assert!(!ExecutionStatus::aggregate(statuses).is_terminal());
        }
    }
}

use crate::error::{AppError, Result};
use crate::models::{
    Execution, ExecutionStatus, ResolvedUnit, Server, TargetResult, TargetStatus,
};
use crate::repository::ExecutionRepository;
use crate::services::dispatcher::{TargetOutcome, TargetTransition, TransitionKind};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

/// Far enough away to stand in for "no deadline".
const IDLE: Duration = Duration::from_secs(60 * 60 * 24 * 365);

/// `now + budget`, or `now + IDLE` when that does not fit in an `Instant`.
fn deadline_after(budget: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(budget)
        .or_else(|| now.checked_add(IDLE))
        .unwrap_or(now)
}

struct ActiveExecution {
    cancel: watch::Sender<bool>,
    finished: Arc<AtomicBool>,
}

impl ActiveExecution {
    fn new() -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            cancel,
            finished: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// Owns the lifecycle of execution records.
///
/// Each tracked execution has exactly one actor task applying its
/// transitions, so aggregate updates for one id never race.
#[derive(Clone)]
pub struct ExecutionLedger {
    repo: ExecutionRepository,
    active: Arc<DashMap<String, ActiveExecution>>,
    grace: Duration,
}

impl ExecutionLedger {
    pub fn new(repo: ExecutionRepository, grace: Duration) -> Self {
        Self {
            repo,
            active: Arc::new(DashMap::new()),
            grace,
        }
    }

    /// Persists a new `pending` execution with one pending result per target.
    ///
    /// The execution is registered as active before the record exists, so a
    /// cancel arriving before `track` is delivered to the actor rather than
    /// finalising the record behind its back. The returned receiver is the
    /// cancel signal for the dispatcher's workers.
    pub async fn create(
        &self,
        unit: &ResolvedUnit,
        targets: &[Server],
        executed_by: &str,
    ) -> Result<(Execution, watch::Receiver<bool>)> {
        if targets.is_empty() {
            return Err(AppError::Validation("No target servers specified".to_string()));
        }

        let execution = Execution {
            id: Uuid::new_v4().to_string(),
            execution_type: unit.execution_type,
            unit_id: unit.unit_id.clone(),
            unit_name: unit.unit_name.clone(),
            target_server_ids: targets.iter().map(|s| s.id.clone()).collect(),
            status: ExecutionStatus::Pending,
            executed_by: executed_by.to_string(),
            snapshot: unit.clone(),
            started_at: Utc::now(),
            completed_at: None,
            targets: targets.iter().map(|s| TargetResult::pending(&s.id)).collect(),
        };

        let entry = ActiveExecution::new();
        let cancel = entry.cancel.subscribe();
        self.active.insert(execution.id.clone(), entry);

        if let Err(err) = self.repo.create(&execution).await {
            self.active.remove(&execution.id);
            return Err(err);
        }
        tracing::info!(
            "Created execution {} of {} '{}' on {} target(s) for {}",
            execution.id,
            execution.execution_type.as_str(),
            execution.unit_name,
            execution.targets.len(),
            executed_by
        );
        Ok((execution, cancel))
    }

    /// Starts the actor that folds `events` into `execution` until every
    /// target is terminal.
    ///
    /// The actor runs on its own task. If it panics, the record is
    /// finalised from its stored state so it does not stay non-terminal.
    pub fn track(
        &self,
        execution: Execution,
        events: mpsc::UnboundedReceiver<TargetTransition>,
    ) -> JoinHandle<Result<Execution>> {
        let (cancel_rx, finished) = {
            let entry = self
                .active
                .entry(execution.id.clone())
                .or_insert_with(ActiveExecution::new);
            (entry.cancel.subscribe(), entry.finished.clone())
        };

        let id = execution.id.clone();
        let actor = ExecutionActor {
            repo: self.repo.clone(),
            grace: self.grace,
            budget: Duration::from_secs(execution.snapshot.total_timeout_secs())
                .saturating_add(self.grace),
            execution,
            running_deadlines: HashMap::new(),
            cancel_deadline: None,
            finished,
        };
        let ledger = self.clone();

        tokio::spawn(async move {
            let result = match tokio::spawn(actor.run(events, cancel_rx)).await {
                Ok(execution) => Ok(execution),
                Err(err) => {
                    tracing::error!("Actor for execution {} crashed: {}", id, err);
                    ledger.settle_after_crash(&id).await
                }
            };
            ledger.active.remove(&id);
            result
        })
    }

    pub async fn cancel(&self, id: &str) -> Result<()> {
        if let Some(entry) = self.active.get(id) {
            if entry.finished.load(Ordering::SeqCst) {
                return Err(AppError::Conflict(format!(
                    "Execution '{}' has already finished",
                    id
                )));
            }
            tracing::info!("Cancelling execution {}", id);
            let _ = entry.cancel.send(true);
            return Ok(());
        }

        let execution = self.repo.get(id).await?;
        if execution.status.is_terminal() {
            return Err(AppError::Conflict(format!(
                "Execution '{}' has already finished",
                id
            )));
        }

        // Not tracked by this process: nothing is running it any more.
        self.finalize_orphan(execution, "Cancelled").await?;
        Ok(())
    }

    /// Finalises executions left non-terminal by a previous process.
    pub async fn recover_interrupted(&self) -> Result<usize> {
        let ids = self.repo.list_active_ids().await?;
        let mut recovered = 0;
        for id in ids {
            if self.active.contains_key(&id) {
                continue;
            }
            let execution = self.repo.get(&id).await?;
            self.finalize_orphan(execution, "Orchestrator restarted before the target finished")
                .await?;
            recovered += 1;
        }
        if recovered > 0 {
            tracing::warn!("Finalised {} interrupted execution(s)", recovered);
        }
        Ok(recovered)
    }

    pub fn is_tracking(&self, id: &str) -> bool {
        self.active.contains_key(id)
    }

    async fn settle_after_crash(&self, id: &str) -> Result<Execution> {
        if let Some(entry) = self.active.get(id) {
            entry.finished.store(true, Ordering::SeqCst);
            let _ = entry.cancel.send(true);
        }
        let execution = self.repo.get(id).await?;
        if execution.status.is_terminal() {
            return Ok(execution);
        }
        self.finalize_orphan(execution, "Internal error while tracking the execution")
            .await?;
        self.repo.get(id).await
    }

    async fn finalize_orphan(&self, mut execution: Execution, reason: &str) -> Result<()> {
        let now = Utc::now();
        for target in execution.targets.iter_mut() {
            if !target.status.is_terminal() {
                force_fail(target, reason, now);
            }
        }

        let status = execution.derived_status();
        let targets: Vec<&TargetResult> = execution.targets.iter().collect();
        self.repo
            .apply_targets(&execution.id, &targets, status, Some(now))
            .await?;
        tracing::warn!(
            "Execution {} finalised as {}: {}",
            execution.id,
            status.as_str(),
            reason
        );
        Ok(())
    }
}

fn force_fail(target: &mut TargetResult, reason: &str, at: DateTime<Utc>) {
    target.status = TargetStatus::Failed;
    target.error_message = Some(reason.to_string());
    target.completed_at = Some(at);
}

struct ExecutionActor {
    repo: ExecutionRepository,
    grace: Duration,
    /// Watchdog allowance for one running target: every step timeout plus
    /// the grace period.
    budget: Duration,
    execution: Execution,
    /// Watchdog deadline per running target.
    running_deadlines: HashMap<String, Instant>,
    cancel_deadline: Option<Instant>,
    finished: Arc<AtomicBool>,
}

impl ExecutionActor {
    async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<TargetTransition>,
        mut cancel: watch::Receiver<bool>,
    ) -> Execution {
        let mut cancel_open = true;
        let mut events_open = true;

        // A cancel may have landed between `create` and `track`.
        if *cancel.borrow_and_update() {
            self.cancel_deadline = Some(deadline_after(self.grace));
        }

        while !self.execution.status.is_terminal() {
            let deadline = self.next_deadline();

            tokio::select! {
                event = events.recv(), if events_open => match event {
                    Some(transition) => self.apply(transition).await,
                    None => {
                        events_open = false;
                        self.force_remaining("Worker exited without reporting a result").await;
                    }
                },
                changed = cancel.changed(), if cancel_open => match changed {
                    Ok(()) => {
                        if *cancel.borrow_and_update() && self.cancel_deadline.is_none() {
                            self.cancel_deadline = Some(deadline_after(self.grace));
                        }
                    }
                    Err(_) => cancel_open = false,
                },
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(|| deadline_after(IDLE))), if deadline.is_some() => {
                    self.expire_deadlines().await;
                }
            }
        }

        self.execution
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.running_deadlines
            .values()
            .copied()
            .chain(self.cancel_deadline)
            .min()
    }

    async fn apply(&mut self, transition: TargetTransition) {
        let Some(index) = self
            .execution
            .targets
            .iter()
            .position(|t| t.server_id == transition.server_id)
        else {
            tracing::warn!(
                "Execution {} got a transition for unknown server {}",
                self.execution.id,
                transition.server_id
            );
            return;
        };

        let target = &mut self.execution.targets[index];
        if target.status.is_terminal() {
            tracing::warn!(
                "Execution {}: ignoring {:?} for server {} already {:?}",
                self.execution.id,
                transition.kind,
                transition.server_id,
                target.status
            );
            return;
        }

        match transition.kind {
            TransitionKind::Running => {
                if target.status == TargetStatus::Running {
                    return;
                }
                target.status = TargetStatus::Running;
                target.started_at = Some(transition.at);
                self.running_deadlines
                    .insert(transition.server_id.clone(), deadline_after(self.budget));
            }
            TransitionKind::Finished(outcome) => {
                apply_outcome(target, outcome, transition.at);
                self.running_deadlines.remove(&transition.server_id);
            }
        }

        self.commit(&[index]).await;
    }

    async fn expire_deadlines(&mut self) {
        let now = Instant::now();

        if self.cancel_deadline.is_some_and(|d| d <= now) {
            self.force_remaining("Cancelled; target did not stop within the grace period")
                .await;
            return;
        }

        let overdue: Vec<String> = self
            .running_deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();

        let mut changed = Vec::with_capacity(overdue.len());
        for server_id in overdue {
            self.running_deadlines.remove(&server_id);
            if let Some(index) = self
                .execution
                .targets
                .iter()
                .position(|t| t.server_id == server_id)
            {
                tracing::warn!(
                    "Watchdog: execution {} server {} exceeded its time budget",
                    self.execution.id,
                    server_id
                );
                let target = &mut self.execution.targets[index];
                target.status = TargetStatus::TimedOut;
                target.error_message = Some("Watchdog: no result within the time budget".to_string());
                target.completed_at = Some(Utc::now());
                changed.push(index);
            }
        }
        self.commit(&changed).await;
    }

    async fn force_remaining(&mut self, reason: &str) {
        let now = Utc::now();
        let pending: Vec<usize> = self
            .execution
            .targets
            .iter()
            .enumerate()
            .filter(|(_, t)| !t.status.is_terminal())
            .map(|(i, _)| i)
            .collect();

        for &index in &pending {
            force_fail(&mut self.execution.targets[index], reason, now);
        }
        self.running_deadlines.clear();
        self.cancel_deadline = None;
        self.commit(&pending).await;
    }

    /// Recomputes the aggregate and persists it together with the changed
    /// targets.
    async fn commit(&mut self, changed: &[usize]) {
        let status = self.execution.derived_status();
        if changed.is_empty() && status == self.execution.status {
            return;
        }

        if status != self.execution.status {
            self.execution.status = status;
            if status.is_terminal() {
                self.finished.store(true, Ordering::SeqCst);
                self.execution.completed_at = Some(Utc::now());
            }
        }

        let targets: Vec<&TargetResult> = changed
            .iter()
            .map(|&index| &self.execution.targets[index])
            .collect();
        if let Err(e) = self
            .repo
            .apply_targets(
                &self.execution.id,
                &targets,
                status,
                self.execution.completed_at,
            )
            .await
        {
            tracing::error!(
                "Failed to persist execution {}: {}",
                self.execution.id,
                e
            );
        }

        if status.is_terminal() {
            tracing::info!(
                "Execution {} finished: {}",
                self.execution.id,
                status.as_str()
            );
        }
    }
}

fn apply_outcome(target: &mut TargetResult, outcome: TargetOutcome, at: DateTime<Utc>) {
    target.status = outcome.status;
    target.exit_code = outcome.exit_code;
    target.stdout = outcome.stdout;
    target.stderr = outcome.stderr;
    target.error_message = outcome.error_message;
    target.completed_at = Some(at);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ExecutionType, ResolvedStep, ServerStatus};
    use crate::repository::test_pool;
    use std::collections::BTreeMap;

    fn unit(timeout_secs: u64) -> ResolvedUnit {
        ResolvedUnit {
            execution_type: ExecutionType::Command,
            unit_id: "cmd".to_string(),
            unit_name: "uptime".to_string(),
            steps: vec![ResolvedStep {
                name: "uptime".to_string(),
                command: "uptime".to_string(),
                timeout_secs,
            }],
            variables: BTreeMap::new(),
        }
    }

    fn server(id: &str) -> Server {
        Server {
            id: id.to_string(),
            name: id.to_string(),
            hostname: format!("{}.internal", id),
            ip_address: "10.0.0.1".to_string(),
            port: 22,
            username: "deploy".to_string(),
            ssh_key_path: None,
            description: String::new(),
            tags: Vec::new(),
            status: ServerStatus::Unknown,
            status_message: None,
            last_probed_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn running(server_id: &str) -> TargetTransition {
        TargetTransition {
            server_id: server_id.to_string(),
            at: Utc::now(),
            kind: TransitionKind::Running,
        }
    }

    fn finished(server_id: &str, status: TargetStatus, exit_code: Option<i32>) -> TargetTransition {
        TargetTransition {
            server_id: server_id.to_string(),
            at: Utc::now(),
            kind: TransitionKind::Finished(TargetOutcome {
                status,
                exit_code,
                stdout: None,
                stderr: None,
                error_message: None,
            }),
        }
    }

    async fn ledger(dir: &tempfile::TempDir, grace: Duration) -> (ExecutionLedger, ExecutionRepository) {
        let repo = ExecutionRepository::new(test_pool(dir).await);
        (ExecutionLedger::new(repo.clone(), grace), repo)
    }

    #[tokio::test]
    async fn mixed_outcomes_end_partially_failed() {
        let dir = tempfile::tempdir().unwrap();
        let (ledger, repo) = ledger(&dir, Duration::from_secs(1)).await;
        let (execution, _cancel) = ledger
            .create(&unit(5), &[server("s1"), server("s2")], "alice")
            .await
            .unwrap();
        assert_eq!(execution.status, ExecutionStatus::Pending);
        assert!(execution.completed_at.is_none());

        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ledger.track(execution.clone(), rx);

        tx.send(running("s1")).unwrap();
        tx.send(running("s2")).unwrap();
        tx.send(finished("s1", TargetStatus::Completed, Some(0))).unwrap();
        tx.send(finished("s2", TargetStatus::Failed, Some(1))).unwrap();
        // repeated terminal event is a no-op
        tx.send(finished("s1", TargetStatus::Failed, Some(9))).unwrap();

        let done = handle.await.unwrap().unwrap();
        assert_eq!(done.status, ExecutionStatus::PartiallyFailed);
        assert!(done.completed_at.is_some());

        let stored = repo.get(&execution.id).await.unwrap();
        assert_eq!(stored.status, ExecutionStatus::PartiallyFailed);
        assert_eq!(stored.status, stored.derived_status());
        assert_eq!(stored.target("s1").unwrap().status, TargetStatus::Completed);
        assert_eq!(stored.target("s1").unwrap().exit_code, Some(0));
        assert_eq!(stored.target("s2").unwrap().status, TargetStatus::Failed);
        assert!(stored.completed_at.is_some());
        assert!(!ledger.is_tracking(&execution.id));
    }

    #[tokio::test]
    async fn closed_stream_fails_silent_targets() {
        let dir = tempfile::tempdir().unwrap();
        let (ledger, _repo) = ledger(&dir, Duration::from_secs(1)).await;
        let (execution, _cancel) = ledger
            .create(&unit(5), &[server("s1"), server("s2")], "alice")
            .await
            .unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ledger.track(execution, rx);
        tx.send(finished("s1", TargetStatus::Completed, Some(0))).unwrap();
        drop(tx);

        let done = handle.await.unwrap().unwrap();
        assert_eq!(done.status, ExecutionStatus::PartiallyFailed);
        assert_eq!(done.target("s2").unwrap().status, TargetStatus::Failed);
    }

    #[tokio::test]
    async fn watchdog_times_out_a_silent_running_target() {
        let dir = tempfile::tempdir().unwrap();
        let (ledger, _repo) = ledger(&dir, Duration::from_millis(200)).await;
        let (execution, _cancel) = ledger
            .create(&unit(1), &[server("s1")], "alice")
            .await
            .unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ledger.track(execution, rx);
        tx.send(running("s1")).unwrap();

        let done = tokio::time::timeout(Duration::from_secs(3), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(done.status, ExecutionStatus::Failed);
        assert_eq!(done.target("s1").unwrap().status, TargetStatus::TimedOut);
        drop(tx);
    }

    #[tokio::test]
    async fn cancel_forces_unresponsive_targets_after_grace() {
        let dir = tempfile::tempdir().unwrap();
        let (ledger, _repo) = ledger(&dir, Duration::from_millis(100)).await;
        let (execution, _cancel) = ledger
            .create(&unit(600), &[server("s1")], "alice")
            .await
            .unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ledger.track(execution.clone(), rx);
        tx.send(running("s1")).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        ledger.cancel(&execution.id).await.unwrap();
        let done = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(done.status, ExecutionStatus::Failed);
        assert!(done.target("s1").unwrap().error_message.as_deref().unwrap().contains("Cancelled"));

        let err = ledger.cancel(&execution.id).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
        drop(tx);
    }

    #[tokio::test]
    async fn recovery_finalises_orphans() {
        let dir = tempfile::tempdir().unwrap();
        let (ledger, repo) = ledger(&dir, Duration::from_secs(1)).await;
        let (execution, _cancel) = ledger
            .create(&unit(5), &[server("s1")], "alice")
            .await
            .unwrap();
        // Simulates a previous process: the record exists but nothing tracks it.
        ledger.active.remove(&execution.id);

        assert_eq!(ledger.recover_interrupted().await.unwrap(), 1);
        let stored = repo.get(&execution.id).await.unwrap();
        assert_eq!(stored.status, ExecutionStatus::Failed);
        assert!(stored.completed_at.is_some());
        assert_eq!(ledger.recover_interrupted().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn cancel_before_tracking_reaches_the_actor() {
        let dir = tempfile::tempdir().unwrap();
        let (ledger, repo) = ledger(&dir, Duration::from_millis(100)).await;
        let (execution, cancel) = ledger
            .create(&unit(600), &[server("s1")], "alice")
            .await
            .unwrap();

        ledger.cancel(&execution.id).await.unwrap();
        assert!(*cancel.borrow());
        let stored = repo.get(&execution.id).await.unwrap();
        assert_eq!(stored.status, ExecutionStatus::Pending);
        assert!(stored.completed_at.is_none());

        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ledger.track(execution.clone(), rx);
        let done = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(done.status, ExecutionStatus::Failed);
        assert!(done.target("s1").unwrap().error_message.as_deref().unwrap().contains("Cancelled"));

        let stored = repo.get(&execution.id).await.unwrap();
        assert_eq!(stored.status, ExecutionStatus::Failed);
        assert!(stored.completed_at.is_some());
        drop(tx);
    }

    #[tokio::test]
    async fn huge_step_timeout_does_not_overflow_the_watchdog() {
        let dir = tempfile::tempdir().unwrap();
        let (ledger, _repo) = ledger(&dir, Duration::from_secs(1)).await;
        let mut long = unit(u64::MAX);
        let step = long.steps[0].clone();
        long.steps.push(step);
        let (execution, _cancel) = ledger
            .create(&long, &[server("s1")], "alice")
            .await
            .unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ledger.track(execution, rx);
        tx.send(running("s1")).unwrap();
        tx.send(finished("s1", TargetStatus::Completed, Some(0))).unwrap();

        let done = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(done.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn crashed_actor_leaves_a_terminal_record() {
        let dir = tempfile::tempdir().unwrap();
        let (ledger, repo) = ledger(&dir, Duration::from_secs(1)).await;
        let (execution, cancel) = ledger
            .create(&unit(5), &[server("s1"), server("s2")], "alice")
            .await
            .unwrap();

        let settled = ledger.settle_after_crash(&execution.id).await.unwrap();
        assert_eq!(settled.status, ExecutionStatus::Failed);
        assert!(settled.completed_at.is_some());
        assert!(*cancel.borrow());

        let err = ledger.cancel(&execution.id).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
        let stored = repo.get(&execution.id).await.unwrap();
        assert_eq!(stored.status, stored.derived_status());
    }

    #[test]
    fn deadlines_saturate() {
        let far = deadline_after(Duration::MAX);
        assert!(far > Instant::now());
    }
}

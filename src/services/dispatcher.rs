use crate::models::{ResolvedUnit, Server, ServerStatus, TargetStatus};
use crate::runner::{RemoteRunner, RunnerError, RunnerFactory, TRUNCATED_MARKER};
use crate::services::inventory_service::InventoryService;
use crate::services::resolver::render_for_target;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc, watch};

/// One state change of one target, as reported by its worker.
#[derive(Debug, Clone)]
pub struct TargetTransition {
    pub server_id: String,
    pub at: DateTime<Utc>,
    pub kind: TransitionKind,
}

#[derive(Debug, Clone)]
pub enum TransitionKind {
    Running,
    Finished(TargetOutcome),
}

#[derive(Debug, Clone)]
pub struct TargetOutcome {
    pub status: TargetStatus,
    pub exit_code: Option<i32>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub error_message: Option<String>,
}

/// Fans a resolved unit out to its targets. Never touches execution state;
/// it only reports transitions.
#[derive(Clone)]
pub struct Dispatcher {
    runners: Arc<dyn RunnerFactory>,
    limiter: Arc<Semaphore>,
    inventory: InventoryService,
    output_limit: usize,
}

impl Dispatcher {
    pub fn new(
        runners: Arc<dyn RunnerFactory>,
        inventory: InventoryService,
        max_concurrency: usize,
        output_limit: usize,
    ) -> Self {
        Self {
            runners,
            limiter: Arc::new(Semaphore::new(max_concurrency)),
            inventory,
            output_limit,
        }
    }

    /// Starts one worker per target and returns the stream of their
    /// transitions. The stream ends once every worker has exited.
    pub fn dispatch(
        &self,
        unit: Arc<ResolvedUnit>,
        targets: Vec<Server>,
        cancel: watch::Receiver<bool>,
    ) -> mpsc::UnboundedReceiver<TargetTransition> {
        let (tx, rx) = mpsc::unbounded_channel();

        for server in targets {
            let worker = TargetWorker {
                dispatcher: self.clone(),
                unit: unit.clone(),
                server,
                cancel: cancel.clone(),
                events: tx.clone(),
            };
            tokio::spawn(worker.supervise());
        }

        rx
    }
}

struct TargetWorker {
    dispatcher: Dispatcher,
    unit: Arc<ResolvedUnit>,
    server: Server,
    cancel: watch::Receiver<bool>,
    events: mpsc::UnboundedSender<TargetTransition>,
}

impl TargetWorker {
    /// Runs the target on its own task so a panic is reported as a failed
    /// target instead of vanishing.
    async fn supervise(self) {
        let server_id = self.server.id.clone();
        let events = self.events.clone();

        if let Err(err) = tokio::spawn(self.run()).await {
            tracing::error!("Worker for server {} crashed: {}", server_id, err);
            let _ = events.send(TargetTransition {
                server_id,
                at: Utc::now(),
                kind: TransitionKind::Finished(TargetOutcome {
                    status: TargetStatus::Failed,
                    exit_code: None,
                    stdout: None,
                    stderr: None,
                    error_message: Some(format!("Internal error: {}", err)),
                }),
            });
        }
    }

    async fn run(mut self) {
        let limiter = self.dispatcher.limiter.clone();
        let permit = tokio::select! {
            permit = limiter.acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => {
                    self.finish(Outcome::failed("Dispatcher is shutting down"));
                    return;
                }
            },
            _ = wait_cancelled(&mut self.cancel) => {
                self.finish(Outcome::failed("Cancelled before the target started"));
                return;
            }
        };

        self.emit(TransitionKind::Running);
        let outcome = self.run_steps().await;
        drop(permit);
        self.finish(outcome);
    }

    async fn run_steps(&mut self) -> Outcome {
        let runner = match self.dispatcher.runners.runner_for(&self.server) {
            Ok(runner) => runner,
            Err(err) => return self.runner_failure(err, None),
        };

        let multi_step = self.unit.steps.len() > 1;
        let mut output = Output::new(self.dispatcher.output_limit);
        let unit = self.unit.clone();

        for step in &unit.steps {
            // safe point: nothing is in flight on the target
            if *self.cancel.borrow() {
                return output.into_outcome(
                    TargetStatus::Failed,
                    None,
                    Some(format!("Cancelled before step '{}'", step.name)),
                );
            }

            let command = render_for_target(&step.command, &self.server);
            let timeout = Duration::from_secs(step.timeout_secs);
            tracing::debug!(
                "Running step '{}' on {} ({}s)",
                step.name,
                self.server.name,
                step.timeout_secs
            );

            let result = tokio::select! {
                result = run_bounded(runner.as_ref(), &command, timeout) => result,
                _ = wait_cancelled(&mut self.cancel) => {
                    return output.into_outcome(
                        TargetStatus::Failed,
                        None,
                        Some(format!("Cancelled while step '{}' was running", step.name)),
                    );
                }
            };

            match result {
                Ok(run) => {
                    output.push(multi_step.then_some(step.name.as_str()), &run.stdout, &run.stderr);
                    if run.exit_code != 0 {
                        return output.into_outcome(
                            TargetStatus::Failed,
                            Some(run.exit_code),
                            Some(format!(
                                "Step '{}' exited with code {}",
                                step.name, run.exit_code
                            )),
                        );
                    }
                    output.exit_code = Some(run.exit_code);
                }
                Err(RunnerError::Timeout(_)) => {
                    return output.into_outcome(
                        TargetStatus::TimedOut,
                        None,
                        Some(format!(
                            "Step '{}' timed out after {}s",
                            step.name, step.timeout_secs
                        )),
                    );
                }
                Err(err) => return self.runner_failure(err, Some(output)),
            }
        }

        let exit_code = output.exit_code;
        output.into_outcome(TargetStatus::Completed, exit_code, None)
    }

    fn runner_failure(&self, err: RunnerError, output: Option<Output>) -> Outcome {
        let output = output.unwrap_or_else(|| Output::new(self.dispatcher.output_limit));
        match err {
            RunnerError::Transport(reason) => {
                self.report_unreachable(reason.clone());
                output.into_outcome(
                    TargetStatus::Failed,
                    None,
                    Some(format!("Connection to {} failed: {}", self.server.name, reason)),
                )
            }
            RunnerError::Timeout(after) => output.into_outcome(
                TargetStatus::TimedOut,
                None,
                Some(format!("Timed out after {}s", after.as_secs())),
            ),
            RunnerError::Spawn(reason) => {
                output.into_outcome(TargetStatus::Failed, None, Some(reason))
            }
        }
    }

    fn report_unreachable(&self, reason: String) {
        let inventory = self.dispatcher.inventory.clone();
        let server_id = self.server.id.clone();
        tokio::spawn(async move {
            if let Err(e) = inventory
                .mark_status(&server_id, ServerStatus::Error, Some(&reason), Utc::now())
                .await
            {
                tracing::warn!("Failed to mark server {} unreachable: {}", server_id, e);
            }
        });
    }

    fn emit(&self, kind: TransitionKind) {
        let transition = TargetTransition {
            server_id: self.server.id.clone(),
            at: Utc::now(),
            kind,
        };
        if self.events.send(transition).is_err() {
            tracing::warn!(
                "Ledger stopped listening before server {} reported",
                self.server.id
            );
        }
    }

    fn finish(&self, outcome: Outcome) {
        self.emit(TransitionKind::Finished(outcome));
    }
}

type Outcome = TargetOutcome;

impl TargetOutcome {
    fn failed(message: &str) -> Self {
        Self {
            status: TargetStatus::Failed,
            exit_code: None,
            stdout: None,
            stderr: None,
            error_message: Some(message.to_string()),
        }
    }
}

/// Bounds a remote call locally even if the runner ignores its timeout.
async fn run_bounded(
    runner: &dyn RemoteRunner,
    command: &str,
    timeout: Duration,
) -> Result<crate::runner::RunOutput, RunnerError> {
    match tokio::time::timeout(timeout, runner.run(command, timeout)).await {
        Ok(result) => result,
        Err(_) => Err(RunnerError::Timeout(timeout)),
    }
}

/// Resolves once cancellation is requested. Never resolves if the sender
/// goes away without cancelling.
pub(crate) async fn wait_cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

struct Output {
    limit: usize,
    stdout: String,
    stderr: String,
    exit_code: Option<i32>,
}

impl Output {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
        }
    }

    fn push(&mut self, header: Option<&str>, stdout: &str, stderr: &str) {
        if let Some(name) = header {
            append_bounded(&mut self.stdout, &format!("==> {}\n", name), self.limit);
        }
        append_bounded(&mut self.stdout, stdout, self.limit);
        append_bounded(&mut self.stderr, stderr, self.limit);
    }

    fn into_outcome(
        self,
        status: TargetStatus,
        exit_code: Option<i32>,
        error_message: Option<String>,
    ) -> Outcome {
        Outcome {
            status,
            exit_code,
            stdout: non_empty(self.stdout),
            stderr: non_empty(self.stderr),
            error_message,
        }
    }
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() { None } else { Some(s) }
}

/// Appends while keeping `buf` within `limit` bytes, cutting on a char
/// boundary and leaving a marker once.
fn append_bounded(buf: &mut String, text: &str, limit: usize) {
    if buf.ends_with(TRUNCATED_MARKER) {
        return;
    }
    if buf.len() + text.len() <= limit {
        buf.push_str(text);
        return;
    }
    let mut cut = limit.saturating_sub(buf.len());
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    buf.push_str(&text[..cut]);
    buf.push_str(TRUNCATED_MARKER);
}

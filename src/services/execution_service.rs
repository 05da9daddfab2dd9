use crate::error::{AppError, Result};
use crate::models::{Execution, ExecutionSummary, ExecutionType};
use crate::repository::{ExecutionFilter, ExecutionRepository};
use crate::services::dispatcher::Dispatcher;
use crate::services::ledger::ExecutionLedger;
use crate::services::resolver::WorkUnitResolver;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionRequest {
    pub execution_type: ExecutionType,
    pub unit_id: String,
    pub target_server_ids: Vec<String>,
    #[serde(default)]
    pub variables: BTreeMap<String, Value>,
    pub executed_by: String,
}

/// Entry point for running work units: resolve, record, dispatch, track.
#[derive(Clone)]
pub struct ExecutionService {
    resolver: WorkUnitResolver,
    ledger: ExecutionLedger,
    dispatcher: Dispatcher,
    repo: ExecutionRepository,
}

impl ExecutionService {
    pub fn new(
        resolver: WorkUnitResolver,
        ledger: ExecutionLedger,
        dispatcher: Dispatcher,
        repo: ExecutionRepository,
    ) -> Self {
        Self {
            resolver,
            ledger,
            dispatcher,
            repo,
        }
    }

    /// Returns as soon as the execution is recorded; targets run in the
    /// background and the record is updated as they report.
    pub async fn create_execution(&self, request: ExecutionRequest) -> Result<Execution> {
        let executed_by = request.executed_by.trim();
        if executed_by.is_empty() {
            return Err(AppError::Validation("executed_by is required".to_string()));
        }

        let (unit, targets) = self
            .resolver
            .resolve(
                request.execution_type,
                &request.unit_id,
                request.variables,
                &request.target_server_ids,
            )
            .await?;

        let (execution, cancel) = self.ledger.create(&unit, &targets, executed_by).await?;

        let events = self.dispatcher.dispatch(Arc::new(unit), targets, cancel);
        self.ledger.track(execution.clone(), events);

        Ok(execution)
    }

    pub async fn get_execution(&self, id: &str) -> Result<Execution> {
        self.repo.get(id).await
    }

    pub async fn list_executions(&self, filter: &ExecutionFilter) -> Result<Vec<ExecutionSummary>> {
        self.repo.list(filter).await
    }

    pub async fn cancel_execution(&self, id: &str) -> Result<Execution> {
        self.ledger.cancel(id).await?;
        self.repo.get(id).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::{ExecutionStatus, Server, TargetStatus};
    use crate::repository::{
        CommandRepository, PlaybookRepository, ServerRepository, test_pool,
    };
    use crate::runner::fake::{Behavior, ScriptedFactory};
    use crate::services::command_service::{self, CommandService};
    use crate::services::inventory_service::{self, InventoryService};
    use crate::services::playbook_service::{self, PlaybookService};
    use std::time::Duration;

    pub(crate) struct Harness {
        pub executions: ExecutionService,
        pub inventory: InventoryService,
        pub commands: CommandService,
        pub playbooks: PlaybookService,
        pub ledger: ExecutionLedger,
    }

    pub(crate) async fn harness(
        dir: &tempfile::TempDir,
        factory: ScriptedFactory,
        max_concurrency: usize,
    ) -> Harness {
        let pool = test_pool(dir).await;
        let servers = ServerRepository::new(pool.clone());
        let commands = CommandRepository::new(pool.clone());
        let playbooks = PlaybookRepository::new(pool.clone());
        let exec_repo = ExecutionRepository::new(pool);

        let inventory = InventoryService::new(servers.clone(), exec_repo.clone());
        let resolver = WorkUnitResolver::new(commands.clone(), playbooks.clone(), servers, 300);
        let ledger = ExecutionLedger::new(exec_repo.clone(), Duration::from_millis(200));
        let dispatcher = Dispatcher::new(
            Arc::new(factory),
            inventory.clone(),
            max_concurrency,
            64 * 1024,
        );

        Harness {
            executions: ExecutionService::new(resolver, ledger.clone(), dispatcher, exec_repo.clone()),
            inventory,
            commands: CommandService::new(commands, exec_repo.clone()),
            playbooks: PlaybookService::new(playbooks, exec_repo),
            ledger,
        }
    }

    pub(crate) async fn wait_terminal(service: &ExecutionService, id: &str) -> Execution {
        for _ in 0..200 {
            let execution = service.get_execution(id).await.unwrap();
            if execution.status.is_terminal() {
                return execution;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("execution {} never finished", id);
    }

    pub(crate) async fn servers(inventory: &InventoryService, names: &[&str]) -> Vec<Server> {
        let mut servers = Vec::new();
        for name in names {
            servers.push(
                inventory
                    .upsert(None, inventory_service::tests::input(name))
                    .await
                    .unwrap(),
            );
        }
        servers
    }

    fn request(execution_type: ExecutionType, unit_id: &str, targets: &[Server]) -> ExecutionRequest {
        ExecutionRequest {
            execution_type,
            unit_id: unit_id.to_string(),
            target_server_ids: targets.iter().map(|s| s.id.clone()).collect(),
            variables: BTreeMap::new(),
            executed_by: "alice".to_string(),
        }
    }

    #[tokio::test]
    async fn one_failing_target_gives_partially_failed() {
        let dir = tempfile::tempdir().unwrap();
        let factory = ScriptedFactory::new().with("s2", Behavior::Exit(1));
        let h = harness(&dir, factory, 4).await;
        let targets = servers(&h.inventory, &["s1", "s2"]).await;
        let command = h
            .commands
            .create(command_service::tests::input("uptime", "uptime"))
            .await
            .unwrap();

        let created = h
            .executions
            .create_execution(request(ExecutionType::Command, &command.id, &targets))
            .await
            .unwrap();
        assert_eq!(created.status, ExecutionStatus::Pending);
        assert_eq!(created.targets.len(), 2);
        assert!(created.completed_at.is_none());

        let done = wait_terminal(&h.executions, &created.id).await;
        assert_eq!(done.status, ExecutionStatus::PartiallyFailed);
        assert!(done.completed_at.is_some());
        let s1 = done.target(&targets[0].id).unwrap();
        assert_eq!(s1.status, TargetStatus::Completed);
        assert_eq!(s1.exit_code, Some(0));
        assert_eq!(s1.stdout.as_deref(), Some("s1: uptime\n"));
        let s2 = done.target(&targets[1].id).unwrap();
        assert_eq!(s2.status, TargetStatus::Failed);
        assert_eq!(s2.exit_code, Some(1));
        assert_eq!(done.executed_by, "alice");
    }

    #[tokio::test]
    async fn unit_deletion_is_blocked_until_execution_finishes() {
        let dir = tempfile::tempdir().unwrap();
        let factory = ScriptedFactory::new()
            .with("s1", Behavior::ExitAfter(Duration::from_millis(300), 0));
        let h = harness(&dir, factory, 4).await;
        let targets = servers(&h.inventory, &["s1"]).await;
        let command = h
            .commands
            .create(command_service::tests::input("slow", "sleep 1"))
            .await
            .unwrap();

        let created = h
            .executions
            .create_execution(request(ExecutionType::Command, &command.id, &targets))
            .await
            .unwrap();
        let err = h.commands.delete(&command.id).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
        let err = h.inventory.remove(&targets[0].id).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));

        let done = wait_terminal(&h.executions, &created.id).await;
        h.commands.delete(&command.id).await.unwrap();

        let history = h.executions.get_execution(&done.id).await.unwrap();
        assert_eq!(history.unit_name, "slow");
        assert_eq!(history.snapshot.steps[0].command, "sleep 1");
    }

    #[tokio::test]
    async fn cancel_stops_queued_and_running_targets() {
        let dir = tempfile::tempdir().unwrap();
        let factory = ScriptedFactory::new()
            .with("s1", Behavior::Hang)
            .with("s2", Behavior::Hang)
            .with("s3", Behavior::Hang);
        let h = harness(&dir, factory.clone(), 1).await;
        let targets = servers(&h.inventory, &["s1", "s2", "s3"]).await;
        let command = h
            .commands
            .create(command_service::tests::input("tail", "tail -f /var/log/syslog"))
            .await
            .unwrap();

        let created = h
            .executions
            .create_execution(request(ExecutionType::Command, &command.id, &targets))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        h.executions.cancel_execution(&created.id).await.unwrap();
        let done = wait_terminal(&h.executions, &created.id).await;

        assert_eq!(done.status, ExecutionStatus::Failed);
        assert!(done.targets.iter().all(|t| t.status == TargetStatus::Failed));
        assert_eq!(factory.calls().len(), 1);

        let err = h.executions.cancel_execution(&created.id).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn playbook_runs_with_caller_variables() {
        let dir = tempfile::tempdir().unwrap();
        let factory = ScriptedFactory::new();
        let h = harness(&dir, factory.clone(), 4).await;
        let targets = servers(&h.inventory, &["web-1"]).await;
        let playbook = h
            .playbooks
            .create(playbook_service::tests::input(
                "deploy",
                &[("fetch", "git checkout {{ branch }}"), ("who", "echo {{ target.name }}")],
            ))
            .await
            .unwrap();

        let mut req = request(ExecutionType::Playbook, &playbook.id, &targets);
        req.variables.insert("branch".to_string(), Value::from("main"));
        let created = h.executions.create_execution(req).await.unwrap();
        let done = wait_terminal(&h.executions, &created.id).await;

        assert_eq!(done.status, ExecutionStatus::Completed);
        let commands: Vec<String> = factory.calls().into_iter().map(|(_, c)| c).collect();
        assert_eq!(commands, vec!["git checkout main", "echo web-1"]);
        assert_eq!(
            done.snapshot.variables.get("branch"),
            Some(&Value::from("main"))
        );
    }

    #[tokio::test]
    async fn invalid_requests_are_rejected_without_a_record() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(&dir, ScriptedFactory::new(), 4).await;
        let targets = servers(&h.inventory, &["s1"]).await;
        let command = h
            .commands
            .create(command_service::tests::input("uptime", "uptime"))
            .await
            .unwrap();

        let err = h
            .executions
            .create_execution(request(ExecutionType::Command, &command.id, &[]))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        let mut unknown = request(ExecutionType::Command, &command.id, &targets);
        unknown.target_server_ids.push("ghost".to_string());
        let err = h.executions.create_execution(unknown).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        let mut anonymous = request(ExecutionType::Command, &command.id, &targets);
        anonymous.executed_by = " ".to_string();
        let err = h.executions.create_execution(anonymous).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        let err = h
            .executions
            .create_execution(request(ExecutionType::Playbook, "missing", &targets))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound { .. }));

        let listed = h
            .executions
            .list_executions(&ExecutionFilter::default())
            .await
            .unwrap();
        assert!(listed.is_empty());
        assert!(matches!(
            h.executions.get_execution("missing").await.unwrap_err(),
            AppError::NotFound { .. }
        ));
    }

    #[tokio::test]
    async fn tracking_ends_with_the_execution() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(&dir, ScriptedFactory::new(), 4).await;
        let targets = servers(&h.inventory, &["s1", "s2"]).await;
        let command = h
            .commands
            .create(command_service::tests::input("uptime", "uptime"))
            .await
            .unwrap();

        let created = h
            .executions
            .create_execution(request(ExecutionType::Command, &command.id, &targets))
            .await
            .unwrap();
        let done = wait_terminal(&h.executions, &created.id).await;
        assert_eq!(done.status, ExecutionStatus::Completed);
        assert!(done.targets.iter().all(|t| t.completed_at.is_some()));

        for _ in 0..40 {
            if !h.ledger.is_tracking(&created.id) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("execution {} is still tracked", created.id);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn readers_never_see_status_out_of_step_with_targets() {
        let dir = tempfile::tempdir().unwrap();
        let names: Vec<String> = (0..30).map(|i| format!("node-{}", i)).collect();
        let mut factory = ScriptedFactory::new();
        for (i, name) in names.iter().enumerate() {
            let exit_code = if i % 4 == 0 { 1 } else { 0 };
            factory = factory.with(
                name,
                Behavior::ExitAfter(Duration::from_millis(5 * i as u64), exit_code),
            );
        }
        let h = harness(&dir, factory, 16).await;
        let name_refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let targets = servers(&h.inventory, &name_refs).await;
        let command = h
            .commands
            .create(command_service::tests::input("uptime", "uptime"))
            .await
            .unwrap();

        let mut ids = Vec::new();
        for _ in 0..5 {
            let created = h
                .executions
                .create_execution(request(ExecutionType::Command, &command.id, &targets))
                .await
                .unwrap();
            ids.push(created.id);
        }

        let mut remaining = ids.clone();
        for _ in 0..400 {
            let mut still_running = Vec::new();
            for id in &remaining {
                let execution = h.executions.get_execution(id).await.unwrap();
                assert_eq!(execution.status, execution.derived_status());
                assert_eq!(execution.status.is_terminal(), execution.completed_at.is_some());
                if !execution.status.is_terminal() {
                    still_running.push(id.clone());
                }
            }
            for summary in h
                .executions
                .list_executions(&ExecutionFilter::default())
                .await
                .unwrap()
            {
                let counts = summary.targets;
                assert_eq!(counts.total, 30);
                assert_eq!(
                    counts.pending + counts.running + counts.completed + counts.failed + counts.timed_out,
                    30
                );
            }
            remaining = still_running;
            if remaining.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(remaining.is_empty(), "executions never finished: {:?}", remaining);

        for id in &ids {
            let done = h.executions.get_execution(id).await.unwrap();
            assert_eq!(done.status, ExecutionStatus::PartiallyFailed);
        }
    }
}

use crate::error::{AppError, Result};
use crate::models::{Command, ExecutionType, MAX_STEP_TIMEOUT_SECS};
use crate::repository::{CommandRepository, ExecutionRepository};
use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

pub const DEFAULT_COMMAND_TIMEOUT_SECS: i64 = 300;

fn default_timeout() -> i64 {
    DEFAULT_COMMAND_TIMEOUT_SECS
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommandInput {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub command: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: i64,
    #[serde(default)]
    pub created_by: Option<String>,
}

#[derive(Clone)]
pub struct CommandService {
    repo: CommandRepository,
    exec_repo: ExecutionRepository,
}

impl CommandService {
    pub fn new(repo: CommandRepository, exec_repo: ExecutionRepository) -> Self {
        Self { repo, exec_repo }
    }

    pub async fn list(&self) -> Result<Vec<Command>> {
        self.repo.list().await
    }

    pub async fn get(&self, id: &str) -> Result<Command> {
        self.repo.get(id).await
    }

    pub async fn create(&self, input: CommandInput) -> Result<Command> {
        let input = Self::validate(input)?;
        self.ensure_unique_name(&input.name, None).await?;

        let now = Utc::now();
        let command = Command {
            id: Uuid::new_v4().to_string(),
            name: input.name,
            description: input.description,
            command: input.command,
            timeout_secs: input.timeout_secs,
            created_by: input.created_by,
            created_at: now,
            updated_at: now,
        };
        self.repo.create(&command).await?;
        tracing::info!("Created command {} ({})", command.name, command.id);
        Ok(command)
    }

    /// Past executions keep their own snapshot, so edits only affect
    /// executions created afterwards.
    pub async fn update(&self, id: &str, input: CommandInput) -> Result<Command> {
        let input = Self::validate(input)?;
        self.ensure_unique_name(&input.name, Some(id)).await?;

        let mut command = self.repo.get(id).await?;
        command.name = input.name;
        command.description = input.description;
        command.command = input.command;
        command.timeout_secs = input.timeout_secs;
        self.repo.update(&command).await?;
        self.repo.get(id).await
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let command = self.repo.get(id).await?;
        if self
            .exec_repo
            .has_active_for_unit(ExecutionType::Command, &command.id)
            .await?
        {
            return Err(AppError::Conflict(format!(
                "Command '{}' has executions that have not finished",
                command.name
            )));
        }
        self.repo.delete(id).await?;
        tracing::info!("Deleted command {} ({})", command.name, command.id);
        Ok(())
    }

    async fn ensure_unique_name(&self, name: &str, id: Option<&str>) -> Result<()> {
        if let Some(existing) = self.repo.find_by_name(name).await? {
            if Some(existing.id.as_str()) != id {
                return Err(AppError::Conflict(format!(
                    "Command name '{}' already exists",
                    name
                )));
            }
        }
        Ok(())
    }

    fn validate(mut input: CommandInput) -> Result<CommandInput> {
        input.name = input.name.trim().to_string();
        if input.name.is_empty() {
            return Err(AppError::Validation("Command name is required".to_string()));
        }
        if input.command.trim().is_empty() {
            return Err(AppError::Validation("Command string is required".to_string()));
        }
        if input.timeout_secs <= 0 {
            return Err(AppError::Validation(
                "timeout_secs must be a positive number of seconds".to_string(),
            ));
        }
        if input.timeout_secs as u64 > MAX_STEP_TIMEOUT_SECS {
            return Err(AppError::Validation(format!(
                "timeout_secs cannot exceed {} seconds",
                MAX_STEP_TIMEOUT_SECS
            )));
        }
        Ok(input)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::repository::test_pool;

    pub(crate) fn input(name: &str, command: &str) -> CommandInput {
        CommandInput {
            name: name.to_string(),
            description: String::new(),
            command: command.to_string(),
            timeout_secs: DEFAULT_COMMAND_TIMEOUT_SECS,
            created_by: Some("ops".to_string()),
        }
    }

    async fn service(dir: &tempfile::TempDir) -> CommandService {
        let pool = test_pool(dir).await;
        CommandService::new(CommandRepository::new(pool.clone()), ExecutionRepository::new(pool))
    }

    #[test]
    fn timeout_defaults_when_omitted() {
        let input: CommandInput =
            serde_json::from_str(r#"{"name": "uptime", "command": "uptime"}"#).unwrap();
        assert_eq!(input.timeout_secs, DEFAULT_COMMAND_TIMEOUT_SECS);
    }

    #[tokio::test]
    async fn create_update_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(&dir).await;

        let command = service.create(input("uptime", "uptime")).await.unwrap();
        let mut changed = input("uptime", "uptime -p");
        changed.timeout_secs = 10;
        let updated = service.update(&command.id, changed).await.unwrap();
        assert_eq!(updated.command, "uptime -p");
        assert_eq!(updated.timeout_secs, 10);
        assert_eq!(updated.created_by.as_deref(), Some("ops"));

        service.delete(&command.id).await.unwrap();
        assert!(matches!(
            service.get(&command.id).await.unwrap_err(),
            AppError::NotFound { .. }
        ));
    }

    #[tokio::test]
    async fn duplicate_name_is_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(&dir).await;

        service.create(input("uptime", "uptime")).await.unwrap();
        let err = service.create(input("uptime", "w")).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn invalid_input_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(&dir).await;

        let err = service.create(input("blank", "  ")).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        let mut zero = input("zero", "uptime");
        zero.timeout_secs = 0;
        let err = service.create(zero).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn oversized_timeout_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(&dir).await;

        let mut huge = input("huge", "uptime");
        huge.timeout_secs = i64::MAX;
        let err = service.create(huge).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(ref m) if m.contains("cannot exceed")));

        let mut longest = input("longest", "uptime");
        longest.timeout_secs = MAX_STEP_TIMEOUT_SECS as i64;
        service.create(longest).await.unwrap();
    }
}

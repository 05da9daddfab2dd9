use crate::error::{AppError, Result};
use crate::models::{ExecutionType, Playbook, PlaybookStep};
use crate::repository::{ExecutionRepository, PlaybookRepository};
use crate::services::resolver::{check_playbook, validate_variables};
use crate::services::templates::{self, PlaybookTemplate};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Debug, Clone, Deserialize)]
pub struct PlaybookInput {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub steps: Option<Vec<PlaybookStep>>,
    #[serde(default)]
    pub variables: Option<BTreeMap<String, Value>>,
    /// Key of a built-in template to seed steps and variables from.
    #[serde(default)]
    pub template: Option<String>,
    #[serde(default)]
    pub created_by: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
}

/// Stored playbooks may be incomplete; step-level problems are reported by
/// `validate` and rejected when an execution is requested.
#[derive(Clone)]
pub struct PlaybookService {
    repo: PlaybookRepository,
    exec_repo: ExecutionRepository,
}

impl PlaybookService {
    pub fn new(repo: PlaybookRepository, exec_repo: ExecutionRepository) -> Self {
        Self { repo, exec_repo }
    }

    pub async fn list(&self) -> Result<Vec<Playbook>> {
        self.repo.list().await
    }

    pub async fn get(&self, id: &str) -> Result<Playbook> {
        self.repo.get(id).await
    }

    pub fn templates(&self) -> Vec<PlaybookTemplate> {
        templates::builtin_templates()
    }

    pub async fn create(&self, input: PlaybookInput) -> Result<Playbook> {
        let name = Self::validate_name(&input.name)?;
        self.ensure_unique_name(&name, None).await?;

        let seed = match input.template.as_deref() {
            Some(key) => Some(templates::find_template(key).ok_or_else(|| {
                AppError::Validation(format!("Unknown playbook template '{}'", key))
            })?),
            None => None,
        };

        let description = input
            .description
            .or_else(|| seed.as_ref().map(|t| t.description.to_string()))
            .unwrap_or_default();
        let steps = input
            .steps
            .or_else(|| seed.as_ref().map(|t| t.steps.clone()))
            .unwrap_or_default();
        let variables = input
            .variables
            .or_else(|| seed.as_ref().map(|t| t.variables.clone()))
            .unwrap_or_default();
        validate_variables(&variables)?;

        let now = Utc::now();
        let playbook = Playbook {
            id: Uuid::new_v4().to_string(),
            name,
            description,
            steps,
            variables,
            template: seed.map(|t| t.key.to_string()),
            created_by: input.created_by,
            created_at: now,
            updated_at: now,
        };
        self.repo.create(&playbook).await?;
        tracing::info!("Created playbook {} ({})", playbook.name, playbook.id);
        Ok(playbook)
    }

    pub async fn update(&self, id: &str, input: PlaybookInput) -> Result<Playbook> {
        let name = Self::validate_name(&input.name)?;
        self.ensure_unique_name(&name, Some(id)).await?;

        let mut playbook = self.repo.get(id).await?;
        playbook.name = name;
        if let Some(description) = input.description {
            playbook.description = description;
        }
        if let Some(steps) = input.steps {
            playbook.steps = steps;
        }
        if let Some(variables) = input.variables {
            validate_variables(&variables)?;
            playbook.variables = variables;
        }
        self.repo.update(&playbook).await?;
        self.repo.get(id).await
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let playbook = self.repo.get(id).await?;
        if self
            .exec_repo
            .has_active_for_unit(ExecutionType::Playbook, &playbook.id)
            .await?
        {
            return Err(AppError::Conflict(format!(
                "Playbook '{}' has executions that have not finished",
                playbook.name
            )));
        }
        self.repo.delete(id).await?;
        tracing::info!("Deleted playbook {} ({})", playbook.name, playbook.id);
        Ok(())
    }

    pub async fn validate(&self, id: &str) -> Result<ValidationReport> {
        let playbook = self.repo.get(id).await?;
        let errors = check_playbook(&playbook.steps, &playbook.variables);
        Ok(ValidationReport {
            valid: errors.is_empty(),
            errors,
        })
    }

    async fn ensure_unique_name(&self, name: &str, id: Option<&str>) -> Result<()> {
        if let Some(existing) = self.repo.find_by_name(name).await? {
            if Some(existing.id.as_str()) != id {
                return Err(AppError::Conflict(format!(
                    "Playbook name '{}' already exists",
                    name
                )));
            }
        }
        Ok(())
    }

    fn validate_name(name: &str) -> Result<String> {
        let name = name.trim();
        if name.is_empty() {
            return Err(AppError::Validation("Playbook name is required".to_string()));
        }
        Ok(name.to_string())
    }
}

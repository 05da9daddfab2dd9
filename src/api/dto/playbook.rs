use crate::models::{Playbook, PlaybookStep};
use crate::services::templates::PlaybookTemplate;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Serialize)]
pub struct PlaybookResponse {
    pub id: String,
    pub name: String,
    pub description: String,
    pub steps: Vec<PlaybookStep>,
    pub variables: BTreeMap<String, Value>,
    pub template: Option<String>,
    pub created_by: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl From<Playbook> for PlaybookResponse {
    fn from(playbook: Playbook) -> Self {
        Self {
            id: playbook.id,
            name: playbook.name,
            description: playbook.description,
            steps: playbook.steps,
            variables: playbook.variables,
            template: playbook.template,
            created_by: playbook.created_by,
            created_at: playbook.created_at.to_rfc3339(),
            updated_at: playbook.updated_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PlaybooksListResponse {
    pub data: Vec<PlaybookResponse>,
}

#[derive(Debug, Serialize)]
pub struct TemplatesResponse {
    pub templates: Vec<PlaybookTemplate>,
}

use crate::models::Command;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct CommandResponse {
    pub id: String,
    pub name: String,
    pub description: String,
    pub command: String,
    pub timeout_secs: i64,
    pub created_by: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl From<Command> for CommandResponse {
    fn from(command: Command) -> Self {
        Self {
            id: command.id,
            name: command.name,
            description: command.description,
            command: command.command,
            timeout_secs: command.timeout_secs,
            created_by: command.created_by,
            created_at: command.created_at.to_rfc3339(),
            updated_at: command.updated_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CommandsListResponse {
    pub data: Vec<CommandResponse>,
}

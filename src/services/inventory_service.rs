use crate::error::{AppError, Result};
use crate::models::{Server, ServerStatus};
use crate::repository::{ExecutionRepository, ServerFilter, ServerRepository};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

const DEFAULT_SSH_PORT: u16 = 22;

#[derive(Debug, Clone, Deserialize)]
pub struct ServerInput {
    pub name: String,
    pub hostname: String,
    pub ip_address: String,
    pub port: Option<u16>,
    pub username: String,
    pub ssh_key_path: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Clone)]
pub struct InventoryService {
    repo: ServerRepository,
    exec_repo: ExecutionRepository,
    status_locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl InventoryService {
    pub fn new(repo: ServerRepository, exec_repo: ExecutionRepository) -> Self {
        Self {
            repo,
            exec_repo,
            status_locks: Arc::new(DashMap::new()),
        }
    }

    pub async fn get(&self, id: &str) -> Result<Server> {
        self.repo.get(id).await
    }

    pub async fn list(&self, filter: &ServerFilter) -> Result<Vec<Server>> {
        self.repo.list(filter).await
    }

    /// Registers a new server when `id` is `None`, otherwise rewrites the
    /// registration of an existing one. Status is never touched here.
    pub async fn upsert(&self, id: Option<&str>, input: ServerInput) -> Result<Server> {
        let input = Self::validate(input)?;

        if let Some(existing) = self.repo.find_by_name(&input.name).await? {
            if Some(existing.id.as_str()) != id {
                return Err(AppError::Conflict(format!(
                    "Server name '{}' already exists",
                    input.name
                )));
            }
        }

        match id {
            Some(id) => {
                let mut server = self.repo.get(id).await?;
                server.name = input.name;
                server.hostname = input.hostname;
                server.ip_address = input.ip_address;
                server.port = input.port.unwrap_or(DEFAULT_SSH_PORT);
                server.username = input.username;
                server.ssh_key_path = input.ssh_key_path;
                server.description = input.description;
                server.tags = input.tags;
                self.repo.update(&server).await?;
                self.repo.get(id).await
            }
            None => {
                let now = Utc::now();
                let server = Server {
                    id: Uuid::new_v4().to_string(),
                    name: input.name,
                    hostname: input.hostname,
                    ip_address: input.ip_address,
                    port: input.port.unwrap_or(DEFAULT_SSH_PORT),
                    username: input.username,
                    ssh_key_path: input.ssh_key_path,
                    description: input.description,
                    tags: input.tags,
                    status: ServerStatus::Unknown,
                    status_message: None,
                    last_probed_at: None,
                    created_at: now,
                    updated_at: now,
                };
                self.repo.create(&server).await?;
                tracing::info!("Registered server {} ({})", server.name, server.id);
                Ok(server)
            }
        }
    }

    pub async fn remove(&self, id: &str) -> Result<()> {
        if self.exec_repo.has_active_targeting(id).await? {
            return Err(AppError::Conflict(format!(
                "Server '{}' is targeted by an execution that has not finished",
                id
            )));
        }
        self.repo.delete(id).await?;
        self.status_locks.remove(id);
        Ok(())
    }

    /// The only writer of `status`, `status_message` and `last_probed_at`.
    ///
    /// Updates for one server are applied one at a time; an update stamped
    /// earlier than the last recorded probe is dropped.
    pub async fn mark_status(
        &self,
        id: &str,
        status: ServerStatus,
        message: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let _guard = self.lock_server(id).await;

        let current = self.repo.get(id).await?;
        if let Some(last) = current.last_probed_at {
            if at < last {
                tracing::debug!(
                    "Ignoring stale status {} for server {} ({} < {})",
                    status.as_str(),
                    id,
                    at,
                    last
                );
                return Ok(());
            }
        }

        self.repo.mark_status(id, status, message, at).await?;
        if status == ServerStatus::Error {
            tracing::warn!(
                "Server {} marked error: {}",
                current.name,
                message.unwrap_or("unknown reason")
            );
        }
        Ok(())
    }

    async fn lock_server(&self, id: &str) -> OwnedMutexGuard<()> {
        let lock = self.status_locks.entry(id.to_string()).or_default().clone();
        lock.lock_owned().await
    }

    fn validate(mut input: ServerInput) -> Result<ServerInput> {
        input.name = input.name.trim().to_string();
        input.hostname = input.hostname.trim().to_string();
        input.ip_address = input.ip_address.trim().to_string();
        input.username = input.username.trim().to_string();

        for (field, value) in [
            ("name", &input.name),
            ("hostname", &input.hostname),
            ("ip_address", &input.ip_address),
            ("username", &input.username),
        ] {
            if value.is_empty() {
                return Err(AppError::Validation(format!(
                    "Missing required field: {}",
                    field
                )));
            }
        }

        if input.ip_address.parse::<IpAddr>().is_err() {
            return Err(AppError::Validation(format!(
                "Invalid ip_address: {}",
                input.ip_address
            )));
        }
        if input.port == Some(0) {
            return Err(AppError::Validation("Port must be between 1 and 65535".to_string()));
        }

        input.ssh_key_path = input
            .ssh_key_path
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty());

        let tags: BTreeSet<String> = input
            .tags
            .iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
        input.tags = tags.into_iter().collect();

        Ok(input)
    }
}

use crate::error::Result;
use crate::models::ServerStatus;
use crate::runner::{RemoteRunner, RunnerError, RunnerFactory};
use crate::services::inventory_service::InventoryService;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Read-only commands behind `server_info`, keyed by the field they fill.
const INFO_COMMANDS: [(&str, &str); 6] = [
    ("hostname", "hostname"),
    ("os_info", "cat /etc/os-release | head -5"),
    ("uptime", "uptime"),
    ("disk_usage", "df -h /"),
    ("memory_info", "free -h"),
    ("cpu_info", "nproc"),
];

/// Facts gathered from one server. A command that fails leaves
/// `"Error: ..."` in its field instead of failing the whole request.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerInfo {
    pub server_id: String,
    pub server_name: String,
    pub info: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutcome {
    Reachable,
    Unreachable(String),
    TimedOut,
}

/// Single-shot reachability probes. No retries: callers probe again if
/// they want to.
#[derive(Clone)]
pub struct HealthMonitor {
    inventory: InventoryService,
    runners: Arc<dyn RunnerFactory>,
    timeout: Duration,
}

impl HealthMonitor {
    pub fn new(
        inventory: InventoryService,
        runners: Arc<dyn RunnerFactory>,
        timeout: Duration,
    ) -> Self {
        Self {
            inventory,
            runners,
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn probe(&self, server_id: &str) -> Result<ProbeOutcome> {
        let server = self.inventory.get(server_id).await?;

        let outcome = match self.runners.runner_for(&server) {
            Ok(runner) => match tokio::time::timeout(self.timeout, runner.ping(self.timeout)).await {
                Ok(Ok(())) => ProbeOutcome::Reachable,
                Ok(Err(RunnerError::Timeout(_))) | Err(_) => ProbeOutcome::TimedOut,
                Ok(Err(err)) => ProbeOutcome::Unreachable(err.to_string()),
            },
            Err(err) => ProbeOutcome::Unreachable(err.to_string()),
        };

        match &outcome {
            ProbeOutcome::Reachable => {
                self.inventory
                    .mark_status(&server.id, ServerStatus::Active, None, Utc::now())
                    .await?;
                tracing::info!("Server {} is reachable", server.name);
            }
            ProbeOutcome::Unreachable(reason) => {
                self.inventory
                    .mark_status(&server.id, ServerStatus::Error, Some(reason), Utc::now())
                    .await?;
            }
            ProbeOutcome::TimedOut => {
                let reason = format!("No response within {}s", self.timeout.as_secs());
                self.inventory
                    .mark_status(&server.id, ServerStatus::Error, Some(&reason), Utc::now())
                    .await?;
            }
        }

        Ok(outcome)
    }

    /// Runs each info command once, each bounded by the probe timeout.
    /// Leaves the server's recorded status alone.
    pub async fn server_info(&self, server_id: &str) -> Result<ServerInfo> {
        let server = self.inventory.get(server_id).await?;

        let mut info = BTreeMap::new();
        match self.runners.runner_for(&server) {
            Ok(runner) => {
                for (key, command) in INFO_COMMANDS {
                    info.insert(key.to_string(), self.gather(runner.as_ref(), command).await);
                }
            }
            Err(err) => {
                for (key, _) in INFO_COMMANDS {
                    info.insert(key.to_string(), format!("Error: {}", err));
                }
            }
        }

        tracing::debug!("Collected info for server {}", server.name);
        Ok(ServerInfo {
            server_id: server.id,
            server_name: server.name,
            info,
        })
    }

    async fn gather(&self, runner: &dyn RemoteRunner, command: &str) -> String {
        match tokio::time::timeout(self.timeout, runner.run(command, self.timeout)).await {
            Ok(Ok(output)) if output.exit_code == 0 => output.stdout.trim().to_string(),
            Ok(Ok(output)) => {
                let stderr = output.stderr.trim();
                if stderr.is_empty() {
                    format!("Error: exit code {}", output.exit_code)
                } else {
                    format!("Error: exit code {}: {}", output.exit_code, stderr)
                }
            }
            Ok(Err(err)) => format!("Error: {}", err),
            Err(_) => format!("Error: {}", RunnerError::Timeout(self.timeout)),
        }
    }
}

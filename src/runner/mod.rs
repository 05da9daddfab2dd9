mod ssh_runner;

#[cfg(test)]
pub mod fake;

pub use ssh_runner::SshRunnerFactory;

use crate::models::Server;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Appended to output cut at the configured limit.
pub const TRUNCATED_MARKER: &str = "\n...[output truncated]";

#[derive(Debug, Clone, PartialEq)]
pub struct RunOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RunnerError {
    /// Connection or authentication failure; the target never ran the step.
    #[error("Transport failure: {0}")]
    Transport(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Failed to start remote command: {0}")]
    Spawn(String),
}

/// Transport used to run one command on one server.
#[async_trait]
pub trait RemoteRunner: Send + Sync {
    async fn run(&self, command: &str, timeout: Duration) -> Result<RunOutput, RunnerError>;

    async fn ping(&self, timeout: Duration) -> Result<(), RunnerError>;
}

/// Binds a [`RemoteRunner`] to a server's address and credentials.
pub trait RunnerFactory: Send + Sync {
    fn runner_for(&self, server: &Server) -> Result<Arc<dyn RemoteRunner>, RunnerError>;
}

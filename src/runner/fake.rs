//! Scripted transport for tests. Behaviour is keyed by server name.

use super::{RemoteRunner, RunOutput, RunnerError, RunnerFactory};
use crate::models::Server;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone)]
pub enum Behavior {
    Exit(i32),
    ExitAfter(Duration, i32),
    Transport(String),
    /// Never returns; only the caller's timeout gets the target out.
    Hang,
}

#[derive(Default, Clone)]
pub struct ScriptedFactory {
    behaviors: Arc<Mutex<HashMap<String, Behavior>>>,
    calls: Arc<Mutex<Vec<(String, String)>>>,
}

impl ScriptedFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, server_name: &str, behavior: Behavior) -> Self {
        self.behaviors
            .lock()
            .unwrap()
            .insert(server_name.to_string(), behavior);
        self
    }

    /// (server name, command) pairs in call order.
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }
}

impl RunnerFactory for ScriptedFactory {
    fn runner_for(&self, server: &Server) -> Result<Arc<dyn RemoteRunner>, RunnerError> {
        let behavior = self
            .behaviors
            .lock()
            .unwrap()
            .get(&server.name)
            .cloned()
            .unwrap_or(Behavior::Exit(0));
        Ok(Arc::new(ScriptedRunner {
            server_name: server.name.clone(),
            behavior,
            calls: self.calls.clone(),
        }))
    }
}

struct ScriptedRunner {
    server_name: String,
    behavior: Behavior,
    calls: Arc<Mutex<Vec<(String, String)>>>,
}

#[async_trait]
impl RemoteRunner for ScriptedRunner {
    async fn run(&self, command: &str, _timeout: Duration) -> Result<RunOutput, RunnerError> {
        self.calls
            .lock()
            .unwrap()
            .push((self.server_name.clone(), command.to_string()));

        let exit_code = match &self.behavior {
            Behavior::Exit(code) => *code,
            Behavior::ExitAfter(delay, code) => {
                tokio::time::sleep(*delay).await;
                *code
            }
            Behavior::Transport(reason) => return Err(RunnerError::Transport(reason.clone())),
            Behavior::Hang => std::future::pending().await,
        };

        Ok(RunOutput {
            stdout: format!("{}: {}\n", self.server_name, command),
            stderr: String::new(),
            exit_code,
        })
    }

    async fn ping(&self, _timeout: Duration) -> Result<(), RunnerError> {
        match &self.behavior {
            Behavior::Transport(reason) => Err(RunnerError::Transport(reason.clone())),
            Behavior::Hang => std::future::pending().await,
            _ => Ok(()),
        }
    }
}

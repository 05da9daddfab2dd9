use super::{RemoteRunner, RunOutput, RunnerError, RunnerFactory, TRUNCATED_MARKER};
use crate::config::SshConfig;
use crate::models::Server;
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};

/// ssh exits 255 on its own failures (connect, auth, host key), but a
/// remote command may exit 255 too. The exit code only counts as a
/// transport failure when stderr is empty or ends with an ssh diagnostic.
const SSH_TRANSPORT_EXIT: i32 = 255;

/// How ssh itself words its failures on stderr.
const SSH_DIAGNOSTICS: [&str; 6] = [
    "ssh:",
    "Permission denied",
    "Host key verification failed",
    "kex_exchange_identification",
    "Connection closed by",
    "Connection timed out during banner exchange",
];

#[derive(Clone)]
pub struct SshRunnerFactory {
    config: SshConfig,
    output_limit: usize,
}

impl SshRunnerFactory {
    /// `output_limit` caps the bytes kept per stream; the rest is drained
    /// and discarded.
    pub fn new(config: SshConfig, output_limit: usize) -> Self {
        Self {
            config,
            output_limit,
        }
    }
}

impl RunnerFactory for SshRunnerFactory {
    fn runner_for(&self, server: &Server) -> Result<Arc<dyn RemoteRunner>, RunnerError> {
        let host = if server.hostname.trim().is_empty() {
            server.ip_address.trim()
        } else {
            server.hostname.trim()
        };
        if host.is_empty() {
            return Err(RunnerError::Transport(format!(
                "Server '{}' has no address",
                server.name
            )));
        }

        Ok(Arc::new(SshRunner {
            binary: self.config.binary.clone(),
            connect_timeout_secs: self.config.connect_timeout_secs,
            destination: format!("{}@{}", server.username, host),
            port: server.port,
            key_path: server.ssh_key_path.clone().filter(|p| !p.trim().is_empty()),
            output_limit: self.output_limit,
        }))
    }
}

pub struct SshRunner {
    binary: PathBuf,
    connect_timeout_secs: u64,
    destination: String,
    port: u16,
    key_path: Option<String>,
    output_limit: usize,
}

impl SshRunner {
    fn build_args(&self, command: &str) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout_secs),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-p".to_string(),
            self.port.to_string(),
        ];
        if let Some(key) = &self.key_path {
            args.push("-i".to_string());
            args.push(key.clone());
        }
        args.push(self.destination.clone());
        args.push("--".to_string());
        args.push(command.to_string());
        args
    }
}

#[async_trait]
impl RemoteRunner for SshRunner {
    async fn run(&self, command: &str, timeout: Duration) -> Result<RunOutput, RunnerError> {
        let mut cmd = tokio::process::Command::new(&self.binary);
        cmd.args(self.build_args(command));
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        // Dropping the child on timeout or cancellation interrupts the remote step.
        cmd.kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| RunnerError::Spawn(format!("{}: {}", self.binary.display(), e)))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let limit = self.output_limit;
        let collect = async {
            let (stdout, stderr, status) = tokio::join!(
                read_bounded(stdout, limit),
                read_bounded(stderr, limit),
                child.wait()
            );
            Ok::<_, std::io::Error>((stdout?, stderr?, status?))
        };

        let (stdout, stderr, status) = match tokio::time::timeout(timeout, collect).await {
            Ok(result) => result.map_err(|e| RunnerError::Spawn(e.to_string()))?,
            Err(_) => return Err(RunnerError::Timeout(timeout)),
        };

        classify(
            &self.destination,
            RunOutput {
                stdout,
                stderr,
                exit_code: status.code().unwrap_or(-1),
            },
        )
    }

    async fn ping(&self, timeout: Duration) -> Result<(), RunnerError> {
        let output = self.run("true", timeout).await?;
        if output.exit_code == 0 {
            Ok(())
        } else {
            Err(RunnerError::Transport(format!(
                "Probe command exited with code {}",
                output.exit_code
            )))
        }
    }
}

/// Reads `reader` to the end, keeping at most `limit` bytes.
async fn read_bounded<R>(reader: Option<R>, limit: usize) -> std::io::Result<String>
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return Ok(String::new());
    };

    let mut kept = Vec::new();
    let mut truncated = false;
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        let room = limit.saturating_sub(kept.len());
        if n > room {
            truncated = true;
        }
        kept.extend_from_slice(&chunk[..n.min(room)]);
    }

    let mut text = String::from_utf8_lossy(&kept).into_owned();
    if truncated {
        text.push_str(TRUNCATED_MARKER);
    }
    Ok(text)
}

fn classify(destination: &str, output: RunOutput) -> Result<RunOutput, RunnerError> {
    if output.exit_code != SSH_TRANSPORT_EXIT {
        return Ok(output);
    }

    let reason = output.stderr.trim();
    if reason.is_empty() {
        return Err(RunnerError::Transport(format!("ssh to {} failed", destination)));
    }
    let last_line = reason.lines().last().unwrap_or(reason).trim();
    if SSH_DIAGNOSTICS.iter().any(|prefix| last_line.starts_with(prefix)) {
        return Err(RunnerError::Transport(reason.to_string()));
    }
    Ok(output)
}

use crate::models::MAX_STEP_TIMEOUT_SECS;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const DEFAULT_PORT: u16 = 6702;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database_url: String,
    pub host: String,
    pub port: u16,
    /// Upper bound on remote operations in flight across every dispatch.
    pub max_concurrency: usize,
    pub probe_timeout_secs: u64,
    /// Slack added on top of step timeouts before the watchdog or a
    /// cancellation forces a target to a terminal state.
    pub cancel_grace_secs: u64,
    /// Per-stream cap on captured stdout/stderr, in bytes.
    pub output_limit: usize,
    pub default_step_timeout_secs: u64,
    pub ssh: SshConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshConfig {
    pub binary: PathBuf,
    pub connect_timeout_secs: u64,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("ssh"),
            connect_timeout_secs: 10,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let database_url = crate::paths::data_dir()
            .map(|dir| format!("sqlite:{}", dir.join("fleetd.db").display()))
            .unwrap_or_else(|_| "sqlite:fleetd.db".to_string());
        Self {
            database_url,
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            max_concurrency: 50,
            probe_timeout_secs: 5,
            cancel_grace_secs: 5,
            output_limit: 64 * 1024,
            default_step_timeout_secs: 300,
            ssh: SshConfig::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(file_config) = Self::from_conf_file()? {
            config.apply_file(file_config);
        }

        if let Ok(db_url) = std::env::var("DATABASE_URL") {
            config.database_url = db_url;
        }

        if let Ok(host) = std::env::var("HOST") {
            config.host = host;
        }

        if let Ok(port) = std::env::var("PORT") {
            config.port = port.parse().unwrap_or(DEFAULT_PORT);
        }

        if let Some(value) = env_number("FLEETD_MAX_CONCURRENCY")? {
            config.max_concurrency = value as usize;
        }
        if let Some(value) = env_number("FLEETD_PROBE_TIMEOUT_SECS")? {
            config.probe_timeout_secs = value;
        }
        if let Some(value) = env_number("FLEETD_CANCEL_GRACE_SECS")? {
            config.cancel_grace_secs = value;
        }
        if let Some(value) = env_number("FLEETD_OUTPUT_LIMIT")? {
            config.output_limit = value as usize;
        }
        if let Ok(binary) = std::env::var("FLEETD_SSH_BINARY") {
            config.ssh.binary = PathBuf::from(binary);
        }

        config.validate()?;
        config.normalize_database_url()?;
        Ok(config)
    }

    fn from_conf_file() -> Result<Option<FileConfig>> {
        let path = crate::paths::conf_dir()?.join("config.json");
        if !path.is_file() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let file_config = serde_json::from_str(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        Ok(Some(file_config))
    }

    fn apply_file(&mut self, file_config: FileConfig) {
        if let Some(database_url) = file_config.database_url {
            self.database_url = database_url;
        }
        if let Some(host) = file_config.host {
            self.host = host;
        }
        if let Some(port) = file_config.port {
            self.port = port;
        }
        if let Some(max_concurrency) = file_config.max_concurrency {
            self.max_concurrency = max_concurrency;
        }
        if let Some(secs) = file_config.probe_timeout_secs {
            self.probe_timeout_secs = secs;
        }
        if let Some(secs) = file_config.cancel_grace_secs {
            self.cancel_grace_secs = secs;
        }
        if let Some(limit) = file_config.output_limit {
            self.output_limit = limit;
        }
        if let Some(secs) = file_config.default_step_timeout_secs {
            self.default_step_timeout_secs = secs;
        }
        if let Some(binary) = file_config.ssh_binary {
            self.ssh.binary = PathBuf::from(binary);
        }
        if let Some(secs) = file_config.ssh_connect_timeout_secs {
            self.ssh.connect_timeout_secs = secs;
        }
    }

    fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            anyhow::bail!("max_concurrency must be greater than zero");
        }
        if self.probe_timeout_secs == 0 {
            anyhow::bail!("probe_timeout_secs must be greater than zero");
        }
        if self.default_step_timeout_secs == 0 {
            anyhow::bail!("default_step_timeout_secs must be greater than zero");
        }
        if self.default_step_timeout_secs > MAX_STEP_TIMEOUT_SECS {
            anyhow::bail!(
                "default_step_timeout_secs cannot exceed {} seconds",
                MAX_STEP_TIMEOUT_SECS
            );
        }
        if self.ssh.connect_timeout_secs == 0 {
            anyhow::bail!("ssh connect timeout must be greater than zero");
        }
        if self.ssh.binary.as_os_str().is_empty() {
            anyhow::bail!("ssh binary cannot be empty");
        }
        Ok(())
    }

    fn normalize_database_url(&mut self) -> Result<()> {
        let Some(path_str) = self.database_url.strip_prefix("sqlite:") else {
            return Ok(());
        };

        let path = Path::new(path_str);
        let root = crate::paths::install_root()?;

        if path.is_absolute() {
            if !path.starts_with(&root) {
                anyhow::bail!(
                    "SQLite database path must be under install root: {}",
                    root.display()
                );
            }
            return Ok(());
        }

        if path
            .components()
            .any(|component| matches!(component, std::path::Component::ParentDir))
        {
            anyhow::bail!("SQLite database path cannot contain '..'");
        }

        let absolute = root.join(path);
        self.database_url = format!("sqlite:{}", absolute.display());
        Ok(())
    }
}

fn env_number(key: &str) -> Result<Option<u64>> {
    match std::env::var(key) {
        Ok(raw) => {
            let value = raw
                .trim()
                .parse::<u64>()
                .with_context(|| format!("{} must be a non-negative integer", key))?;
            Ok(Some(value))
        }
        Err(_) => Ok(None),
    }
}

#[derive(Debug, Deserialize)]
struct FileConfig {
    database_url: Option<String>,
    host: Option<String>,
    port: Option<u16>,
    max_concurrency: Option<usize>,
    probe_timeout_secs: Option<u64>,
    cancel_grace_secs: Option<u64>,
    output_limit: Option<usize>,
    default_step_timeout_secs: Option<u64>,
    ssh_binary: Option<String>,
    ssh_connect_timeout_secs: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_values_override_defaults() {
        let mut config = Config::default();
        let file: FileConfig = serde_json::from_str(
            r#"{"port": 7000, "max_concurrency": 8, "ssh_binary": "/usr/bin/ssh"}"#,
        )
        .unwrap();
        config.apply_file(file);

        assert_eq!(config.port, 7000);
        assert_eq!(config.max_concurrency, 8);
        assert_eq!(config.ssh.binary, PathBuf::from("/usr/bin/ssh"));
        assert_eq!(config.probe_timeout_secs, 5);
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let config = Config {
            max_concurrency: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn oversized_step_timeout_is_rejected() {
        let config = Config {
            default_step_timeout_secs: u64::MAX,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}

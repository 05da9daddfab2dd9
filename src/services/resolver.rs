use crate::error::{AppError, Result};
use crate::models::{
    Command, ExecutionType, MAX_STEP_TIMEOUT_SECS, Playbook, PlaybookStep, ResolvedStep,
    ResolvedUnit, Server,
};
use crate::repository::{CommandRepository, PlaybookRepository, ServerRepository};
use regex::{Captures, Regex};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::LazyLock;

/// `{{ name }}` with optional inner whitespace.
static REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_.]*)\s*\}\}").expect("valid reference pattern")
});

/// Anything that looks like a reference, well-formed or not.
static LOOSE_REFERENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{[^}]*\}\}").expect("valid loose reference pattern"));

/// Same alphabet as a reference. The `target.` prefix is reserved for
/// server attributes and rejected separately.
static VARIABLE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_.]*$").expect("valid name pattern"));

const TARGET_PREFIX: &str = "target.";
const TARGET_BUILTINS: [&str; 6] = ["id", "name", "hostname", "ip", "port", "username"];

#[derive(Clone)]
pub struct WorkUnitResolver {
    commands: CommandRepository,
    playbooks: PlaybookRepository,
    servers: ServerRepository,
    default_step_timeout_secs: u64,
}

impl WorkUnitResolver {
    pub fn new(
        commands: CommandRepository,
        playbooks: PlaybookRepository,
        servers: ServerRepository,
        default_step_timeout_secs: u64,
    ) -> Self {
        Self {
            commands,
            playbooks,
            servers,
            default_step_timeout_secs,
        }
    }

    /// Validates the request and freezes the unit. Returns the unit and the
    /// target servers in request order, duplicates removed.
    pub async fn resolve(
        &self,
        execution_type: ExecutionType,
        unit_id: &str,
        variables: BTreeMap<String, Value>,
        target_server_ids: &[String],
    ) -> Result<(ResolvedUnit, Vec<Server>)> {
        let targets = self.load_targets(target_server_ids).await?;

        let unit = match execution_type {
            ExecutionType::Command => {
                let command = self.commands.get(unit_id).await?;
                if !variables.is_empty() {
                    return Err(AppError::Validation(
                        "Commands do not accept variables".to_string(),
                    ));
                }
                resolve_command(&command)?
            }
            ExecutionType::Playbook => {
                let playbook = self.playbooks.get(unit_id).await?;
                resolve_playbook(&playbook, variables, self.default_step_timeout_secs)?
            }
        };

        Ok((unit, targets))
    }

    async fn load_targets(&self, ids: &[String]) -> Result<Vec<Server>> {
        if ids.is_empty() {
            return Err(AppError::Validation("No target servers specified".to_string()));
        }

        let mut seen = HashSet::new();
        let mut targets = Vec::with_capacity(ids.len());
        let mut missing = Vec::new();
        for id in ids {
            if !seen.insert(id.as_str()) {
                continue;
            }
            match self.servers.get(id).await {
                Ok(server) => targets.push(server),
                Err(AppError::NotFound { .. }) => missing.push(id.as_str()),
                Err(e) => return Err(e),
            }
        }

        if !missing.is_empty() {
            return Err(AppError::Validation(format!(
                "Unknown target servers: {}",
                missing.join(", ")
            )));
        }
        Ok(targets)
    }
}

pub fn resolve_command(command: &Command) -> Result<ResolvedUnit> {
    if command.command.trim().is_empty() {
        return Err(AppError::Validation(format!(
            "Command '{}' has an empty command string",
            command.name
        )));
    }
    if command.timeout_secs <= 0 || command.timeout_secs as u64 > MAX_STEP_TIMEOUT_SECS {
        return Err(AppError::Validation(format!(
            "Command '{}' must have a timeout between 1 and {} seconds",
            command.name, MAX_STEP_TIMEOUT_SECS
        )));
    }

    Ok(ResolvedUnit {
        execution_type: ExecutionType::Command,
        unit_id: command.id.clone(),
        unit_name: command.name.clone(),
        steps: vec![ResolvedStep {
            name: command.name.clone(),
            command: command.command.clone(),
            timeout_secs: command.timeout_secs as u64,
        }],
        variables: BTreeMap::new(),
    })
}

/// Merges `overrides` over the playbook defaults (caller wins) and
/// substitutes every non-target reference once.
pub fn resolve_playbook(
    playbook: &Playbook,
    overrides: BTreeMap<String, Value>,
    default_step_timeout_secs: u64,
) -> Result<ResolvedUnit> {
    let mut variables = playbook.variables.clone();
    variables.extend(overrides);
    validate_variables(&variables)?;

    if playbook.steps.is_empty() {
        return Err(AppError::Validation(format!(
            "Playbook '{}' has no steps",
            playbook.name
        )));
    }

    let mut steps = Vec::with_capacity(playbook.steps.len());
    for (index, step) in playbook.steps.iter().enumerate() {
        let label = step_label(index, step);
        if step.command.trim().is_empty() {
            return Err(AppError::Validation(format!("{} has an empty command", label)));
        }
        let timeout_secs = step.timeout_secs.unwrap_or(default_step_timeout_secs);
        if timeout_secs == 0 || timeout_secs > MAX_STEP_TIMEOUT_SECS {
            return Err(AppError::Validation(format!(
                "{} must have a timeout between 1 and {} seconds",
                label, MAX_STEP_TIMEOUT_SECS
            )));
        }
        let command = substitute(&step.command, &variables)
            .map_err(|e| AppError::Validation(format!("{}: {}", label, e)))?;
        steps.push(ResolvedStep {
            name: if step.name.trim().is_empty() {
                format!("step {}", index + 1)
            } else {
                step.name.clone()
            },
            command,
            timeout_secs,
        });
    }

    Ok(ResolvedUnit {
        execution_type: ExecutionType::Playbook,
        unit_id: playbook.id.clone(),
        unit_name: playbook.name.clone(),
        steps,
        variables,
    })
}

/// Checks a playbook without resolving it; returns every problem found.
pub fn check_playbook(steps: &[PlaybookStep], variables: &BTreeMap<String, Value>) -> Vec<String> {
    let mut errors = Vec::new();
    if let Err(AppError::Validation(msg)) = validate_variables(variables) {
        errors.push(msg);
    }
    if steps.is_empty() {
        errors.push("Playbook has no steps".to_string());
    }
    for (index, step) in steps.iter().enumerate() {
        let label = step_label(index, step);
        if step.command.trim().is_empty() {
            errors.push(format!("{} has an empty command", label));
            continue;
        }
        if step
            .timeout_secs
            .is_some_and(|secs| secs == 0 || secs > MAX_STEP_TIMEOUT_SECS)
        {
            errors.push(format!(
                "{} must have a timeout between 1 and {} seconds",
                label, MAX_STEP_TIMEOUT_SECS
            ));
        }
        if let Err(e) = substitute(&step.command, variables) {
            errors.push(format!("{}: {}", label, e));
        }
    }
    errors
}

/// Fills `{{ target.* }}` references for one server. Pure: same inputs,
/// same output.
pub fn render_for_target(command: &str, server: &Server) -> String {
    REFERENCE
        .replace_all(command, |caps: &Captures| {
            let name = &caps[1];
            match name.strip_prefix(TARGET_PREFIX) {
                Some("id") => server.id.clone(),
                Some("name") => server.name.clone(),
                Some("hostname") => server.hostname.clone(),
                Some("ip") => server.ip_address.clone(),
                Some("port") => server.port.to_string(),
                Some("username") => server.username.clone(),
                _ => caps[0].to_string(),
            }
        })
        .into_owned()
}

fn step_label(index: usize, step: &PlaybookStep) -> String {
    if step.name.trim().is_empty() {
        format!("Step {}", index + 1)
    } else {
        format!("Step {} ('{}')", index + 1, step.name)
    }
}

pub(crate) fn validate_variables(variables: &BTreeMap<String, Value>) -> Result<()> {
    for (name, value) in variables {
        if !VARIABLE_NAME.is_match(name) {
            return Err(AppError::Validation(format!(
                "Invalid variable name: '{}'",
                name
            )));
        }
        if name.starts_with(TARGET_PREFIX) {
            return Err(AppError::Validation(format!(
                "Variable name '{}' uses the reserved '{}' prefix",
                name, TARGET_PREFIX
            )));
        }
        if scalar_to_string(value).is_none() {
            return Err(AppError::Validation(format!(
                "Variable '{}' must be a string, number or boolean",
                name
            )));
        }
    }
    Ok(())
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

fn substitute(
    text: &str,
    variables: &BTreeMap<String, Value>,
) -> std::result::Result<String, String> {
    let well_formed = REFERENCE.find_iter(text).count();
    let anything = LOOSE_REFERENCE.find_iter(text).count();
    if anything != well_formed {
        return Err("malformed variable reference".to_string());
    }

    let mut unresolved = Vec::new();
    let rendered = REFERENCE.replace_all(text, |caps: &Captures| {
        let name = &caps[1];
        if let Some(builtin) = name.strip_prefix(TARGET_PREFIX) {
            if !TARGET_BUILTINS.contains(&builtin) {
                unresolved.push(name.to_string());
            }
            return caps[0].to_string();
        }
        match variables.get(name).and_then(scalar_to_string) {
            Some(value) => value,
            None => {
                unresolved.push(name.to_string());
                caps[0].to_string()
            }
        }
    });

    if unresolved.is_empty() {
        Ok(rendered.into_owned())
    } else {
        Err(format!("unresolved variables: {}", unresolved.join(", ")))
    }
}

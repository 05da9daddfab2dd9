//! Built-in playbooks that new playbooks can be seeded from.

use crate::models::PlaybookStep;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize)]
pub struct PlaybookTemplate {
    pub key: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub steps: Vec<PlaybookStep>,
    pub variables: BTreeMap<String, Value>,
}

fn step(name: &str, command: &str, timeout_secs: Option<u64>) -> PlaybookStep {
    PlaybookStep {
        name: name.to_string(),
        command: command.to_string(),
        timeout_secs,
    }
}

pub fn builtin_templates() -> Vec<PlaybookTemplate> {
    vec![
        PlaybookTemplate {
            key: "basic-server-setup",
            name: "Basic Server Setup",
            description: "Basic server configuration and package installation",
            steps: vec![
                step(
                    "Update package cache",
                    "if command -v apt-get >/dev/null; then sudo apt-get update -y; fi",
                    Some(600),
                ),
                step(
                    "Install basic packages",
                    "if command -v apt-get >/dev/null; then sudo apt-get install -y curl wget vim htop; \
                     else sudo yum install -y curl wget vim htop; fi",
                    Some(900),
                ),
                step(
                    "Create admin user",
                    "id -u {{ admin_user }} >/dev/null 2>&1 || sudo useradd -m -s /bin/bash -G sudo {{ admin_user }}",
                    None,
                ),
            ],
            variables: BTreeMap::from([("admin_user".to_string(), Value::from("admin"))]),
        },
        PlaybookTemplate {
            key: "docker-installation",
            name: "Docker Installation",
            description: "Install Docker and Docker Compose",
            steps: vec![
                step(
                    "Install prerequisites",
                    "sudo apt-get update -y && sudo apt-get install -y ca-certificates curl gnupg lsb-release",
                    Some(900),
                ),
                step(
                    "Install Docker",
                    "command -v docker >/dev/null || curl -fsSL https://get.docker.com | sudo sh",
                    Some(1200),
                ),
                step(
                    "Enable Docker service",
                    "sudo systemctl enable --now docker",
                    None,
                ),
                step(
                    "Add user to docker group",
                    "sudo usermod -aG docker {{ target.username }}",
                    None,
                ),
                step("Verify installation", "docker --version && docker compose version", None),
            ],
            variables: BTreeMap::new(),
        },
        PlaybookTemplate {
            key: "security-hardening",
            name: "Security Hardening",
            description: "Basic security hardening for SSH and the firewall",
            steps: vec![
                step(
                    "Disable root login",
                    "sudo sed -i 's/^#\\?PermitRootLogin.*/PermitRootLogin no/' /etc/ssh/sshd_config",
                    None,
                ),
                step(
                    "Disable password authentication",
                    "sudo sed -i 's/^#\\?PasswordAuthentication.*/PasswordAuthentication no/' /etc/ssh/sshd_config",
                    None,
                ),
                step(
                    "Install firewall",
                    "command -v ufw >/dev/null || sudo apt-get install -y ufw",
                    Some(600),
                ),
                step(
                    "Allow SSH through the firewall",
                    "sudo ufw allow {{ ssh_port }}/tcp && sudo ufw --force enable",
                    None,
                ),
                step("Restart SSH", "sudo systemctl restart sshd || sudo systemctl restart ssh", None),
            ],
            variables: BTreeMap::from([("ssh_port".to_string(), Value::from(22))]),
        },
    ]
}

pub fn find_template(key: &str) -> Option<PlaybookTemplate> {
    builtin_templates().into_iter().find(|t| t.key == key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::resolver::check_playbook;

    #[test]
    fn every_template_is_valid() {
        for template in builtin_templates() {
            let errors = check_playbook(&template.steps, &template.variables);
            assert!(errors.is_empty(), "{}: {:?}", template.key, errors);
        }
    }

    #[test]
    fn templates_are_found_by_key() {
        assert_eq!(find_template("docker-installation").unwrap().name, "Docker Installation");
        assert!(find_template("kubernetes").is_none());
    }
}

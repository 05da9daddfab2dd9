use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Server {
    pub id: String,
    pub name: String,
    pub hostname: String,
    pub ip_address: String,
    pub port: u16,
    pub username: String,
    pub ssh_key_path: Option<String>,
    pub description: String,
    pub tags: Vec<String>,
    pub status: ServerStatus,
    /// Reason recorded by the last failed probe or transport failure.
    pub status_message: Option<String>,
    pub last_probed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
#[repr(i32)]
pub enum ServerStatus {
    Unknown = 0,
    Active = 1,
    Error = 2,
}

impl ServerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Active => "active",
            Self::Error => "error",
        }
    }
}

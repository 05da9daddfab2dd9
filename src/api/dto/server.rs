use crate::models::{Server, ServerStatus};
use crate::repository::ServerFilter;
use crate::services::ServerInfo;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Deserialize)]
pub struct ServerListQuery {
    pub tag: Option<String>,
    pub status: Option<ServerStatus>,
}

impl From<ServerListQuery> for ServerFilter {
    fn from(query: ServerListQuery) -> Self {
        Self {
            tag: query.tag,
            status: query.status,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ServerResponse {
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
    pub status_message: Option<String>,
    pub last_probed_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl From<Server> for ServerResponse {
    fn from(server: Server) -> Self {
        Self {
            id: server.id,
            name: server.name,
            hostname: server.hostname,
            ip_address: server.ip_address,
            port: server.port,
            username: server.username,
            ssh_key_path: server.ssh_key_path,
            description: server.description,
            tags: server.tags,
            status: server.status,
            status_message: server.status_message,
            last_probed_at: server.last_probed_at.map(|t| t.to_rfc3339()),
            created_at: server.created_at.to_rfc3339(),
            updated_at: server.updated_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ServersListResponse {
    pub data: Vec<ServerResponse>,
}

#[derive(Debug, Serialize)]
pub struct PingResponse {
    pub reachable: bool,
    pub message: String,
    pub server: ServerResponse,
}

#[derive(Debug, Serialize)]
pub struct ServerInfoResponse {
    pub server_id: String,
    pub server_name: String,
    pub info: BTreeMap<String, String>,
}

impl From<ServerInfo> for ServerInfoResponse {
    fn from(info: ServerInfo) -> Self {
        Self {
            server_id: info.server_id,
            server_name: info.server_name,
            info: info.info,
        }
    }
}

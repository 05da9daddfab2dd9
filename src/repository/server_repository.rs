use crate::error::{AppError, Result};
use crate::models::{Server, ServerStatus};
use crate::repository::DbPool;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Default)]
pub struct ServerFilter {
    pub tag: Option<String>,
    pub status: Option<ServerStatus>,
}

#[derive(sqlx::FromRow)]
struct ServerRow {
    id: String,
    name: String,
    hostname: String,
    ip_address: String,
    port: i64,
    username: String,
    ssh_key_path: Option<String>,
    description: String,
    tags: String,
    status: ServerStatus,
    status_message: Option<String>,
    last_probed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ServerRow> for Server {
    type Error = AppError;

    fn try_from(row: ServerRow) -> Result<Self> {
        let port = u16::try_from(row.port)
            .map_err(|_| AppError::Internal(format!("Stored port out of range: {}", row.port)))?;
        Ok(Self {
            id: row.id,
            name: row.name,
            hostname: row.hostname,
            ip_address: row.ip_address,
            port,
            username: row.username,
            ssh_key_path: row.ssh_key_path,
            description: row.description,
            tags: serde_json::from_str(&row.tags)?,
            status: row.status,
            status_message: row.status_message,
            last_probed_at: row.last_probed_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Clone)]
pub struct ServerRepository {
    pool: DbPool,
}

impl ServerRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn list(&self, filter: &ServerFilter) -> Result<Vec<Server>> {
        let rows = match filter.status {
            Some(status) => {
                sqlx::query_as::<_, ServerRow>(
                    "SELECT * FROM servers WHERE status = ? ORDER BY name",
                )
                .bind(status as i32)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, ServerRow>("SELECT * FROM servers ORDER BY name")
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        let mut servers = Vec::with_capacity(rows.len());
        for row in rows {
            let server = Server::try_from(row)?;
            if let Some(tag) = &filter.tag {
                if !server.tags.iter().any(|t| t == tag) {
                    continue;
                }
            }
            servers.push(server);
        }
        Ok(servers)
    }

    pub async fn get(&self, id: &str) -> Result<Server> {
        let row = sqlx::query_as::<_, ServerRow>("SELECT * FROM servers WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::not_found("Server", id))?;

        Server::try_from(row)
    }

    pub async fn find_by_name(&self, name: &str) -> Result<Option<Server>> {
        let row = sqlx::query_as::<_, ServerRow>("SELECT * FROM servers WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Server::try_from).transpose()
    }

    pub async fn create(&self, server: &Server) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO servers (id, name, hostname, ip_address, port, username, ssh_key_path, description, tags, status, status_message, last_probed_at, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&server.id)
        .bind(&server.name)
        .bind(&server.hostname)
        .bind(&server.ip_address)
        .bind(i64::from(server.port))
        .bind(&server.username)
        .bind(&server.ssh_key_path)
        .bind(&server.description)
        .bind(serde_json::to_string(&server.tags)?)
        .bind(server.status as i32)
        .bind(&server.status_message)
        .bind(server.last_probed_at)
        .bind(server.created_at)
        .bind(server.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Rewrites the registration fields. Status columns are left alone; they
    /// only move through [`ServerRepository::mark_status`].
    pub async fn update(&self, server: &Server) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE servers
            SET name = ?, hostname = ?, ip_address = ?, port = ?, username = ?, ssh_key_path = ?, description = ?, tags = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&server.name)
        .bind(&server.hostname)
        .bind(&server.ip_address)
        .bind(i64::from(server.port))
        .bind(&server.username)
        .bind(&server.ssh_key_path)
        .bind(&server.description)
        .bind(serde_json::to_string(&server.tags)?)
        .bind(Utc::now())
        .bind(&server.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::not_found("Server", &server.id));
        }
        Ok(())
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM servers WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::not_found("Server", id));
        }

        Ok(())
    }

    pub async fn mark_status(
        &self,
        id: &str,
        status: ServerStatus,
        message: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE servers SET status = ?, status_message = ?, last_probed_at = ? WHERE id = ?",
        )
        .bind(status as i32)
        .bind(message)
        .bind(at)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::not_found("Server", id));
        }
        Ok(())
    }
}

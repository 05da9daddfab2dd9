use crate::error::{AppError, Result};
use crate::models::Command;
use crate::repository::DbPool;
use chrono::Utc;

#[derive(Clone)]
pub struct CommandRepository {
    pool: DbPool,
}

impl CommandRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn list(&self) -> Result<Vec<Command>> {
        let commands = sqlx::query_as::<_, Command>("SELECT * FROM commands ORDER BY name")
            .fetch_all(&self.pool)
            .await?;

        Ok(commands)
    }

    pub async fn get(&self, id: &str) -> Result<Command> {
        let command = sqlx::query_as::<_, Command>("SELECT * FROM commands WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::not_found("Command", id))?;

        Ok(command)
    }

    pub async fn find_by_name(&self, name: &str) -> Result<Option<Command>> {
        let command = sqlx::query_as::<_, Command>("SELECT * FROM commands WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        Ok(command)
    }

    pub async fn create(&self, command: &Command) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO commands (id, name, description, command, timeout_secs, created_by, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&command.id)
        .bind(&command.name)
        .bind(&command.description)
        .bind(&command.command)
        .bind(command.timeout_secs)
        .bind(&command.created_by)
        .bind(command.created_at)
        .bind(command.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn update(&self, command: &Command) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE commands
            SET name = ?, description = ?, command = ?, timeout_secs = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&command.name)
        .bind(&command.description)
        .bind(&command.command)
        .bind(command.timeout_secs)
        .bind(Utc::now())
        .bind(&command.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::not_found("Command", &command.id));
        }
        Ok(())
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM commands WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::not_found("Command", id));
        }

        Ok(())
    }
}

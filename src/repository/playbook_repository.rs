use crate::error::{AppError, Result};
use crate::models::Playbook;
use crate::repository::DbPool;
use chrono::{DateTime, Utc};

#[derive(sqlx::FromRow)]
struct PlaybookRow {
    id: String,
    name: String,
    description: String,
    steps: String,
    variables: String,
    template: Option<String>,
    created_by: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<PlaybookRow> for Playbook {
    type Error = AppError;

    fn try_from(row: PlaybookRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            name: row.name,
            description: row.description,
            steps: serde_json::from_str(&row.steps)?,
            variables: serde_json::from_str(&row.variables)?,
            template: row.template,
            created_by: row.created_by,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Clone)]
pub struct PlaybookRepository {
    pool: DbPool,
}

impl PlaybookRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn list(&self) -> Result<Vec<Playbook>> {
        let rows = sqlx::query_as::<_, PlaybookRow>("SELECT * FROM playbooks ORDER BY name")
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(Playbook::try_from).collect()
    }

    pub async fn get(&self, id: &str) -> Result<Playbook> {
        let row = sqlx::query_as::<_, PlaybookRow>("SELECT * FROM playbooks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::not_found("Playbook", id))?;

        Playbook::try_from(row)
    }

    pub async fn find_by_name(&self, name: &str) -> Result<Option<Playbook>> {
        let row = sqlx::query_as::<_, PlaybookRow>("SELECT * FROM playbooks WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Playbook::try_from).transpose()
    }

    pub async fn create(&self, playbook: &Playbook) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO playbooks (id, name, description, steps, variables, template, created_by, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&playbook.id)
        .bind(&playbook.name)
        .bind(&playbook.description)
        .bind(serde_json::to_string(&playbook.steps)?)
        .bind(serde_json::to_string(&playbook.variables)?)
        .bind(&playbook.template)
        .bind(&playbook.created_by)
        .bind(playbook.created_at)
        .bind(playbook.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn update(&self, playbook: &Playbook) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE playbooks
            SET name = ?, description = ?, steps = ?, variables = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&playbook.name)
        .bind(&playbook.description)
        .bind(serde_json::to_string(&playbook.steps)?)
        .bind(serde_json::to_string(&playbook.variables)?)
        .bind(Utc::now())
        .bind(&playbook.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::not_found("Playbook", &playbook.id));
        }
        Ok(())
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM playbooks WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::not_found("Playbook", id));
        }

        Ok(())
    }
}

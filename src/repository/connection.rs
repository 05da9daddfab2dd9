use crate::repository::DbPool;
use anyhow::Result;
use sqlx::sqlite::SqlitePoolOptions;

pub async fn establish_connection(database_url: &str) -> Result<DbPool> {
    // Ensure the database URL has the correct format
    let db_url = if database_url.starts_with("sqlite:") {
        database_url.to_string()
    } else {
        format!("sqlite:{}", database_url)
    };

    // Create connection with create_if_missing option
    let connection_string = format!("{}?mode=rwc", db_url);
    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect(&connection_string)
        .await?;

    sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;
    sqlx::query("PRAGMA busy_timeout = 5000").execute(&pool).await?;

    // Run migrations
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS servers (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            hostname TEXT NOT NULL,
            ip_address TEXT NOT NULL,
            port INTEGER NOT NULL DEFAULT 22,
            username TEXT NOT NULL,
            ssh_key_path TEXT,
            description TEXT NOT NULL DEFAULT '',
            tags TEXT NOT NULL DEFAULT '[]',
            status INTEGER NOT NULL DEFAULT 0,
            status_message TEXT,
            last_probed_at TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS commands (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            description TEXT NOT NULL DEFAULT '',
            command TEXT NOT NULL,
            timeout_secs INTEGER NOT NULL DEFAULT 300,
            created_by TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS playbooks (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            description TEXT NOT NULL DEFAULT '',
            steps TEXT NOT NULL,
            variables TEXT NOT NULL DEFAULT '{}',
            template TEXT,
            created_by TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        -- executions keep a snapshot of the unit, so no foreign key to
        -- commands/playbooks: history outlives the catalogue entry
        CREATE TABLE IF NOT EXISTS executions (
            id TEXT PRIMARY KEY,
            execution_type INTEGER NOT NULL,
            unit_id TEXT NOT NULL,
            unit_name TEXT NOT NULL,
            target_server_ids TEXT NOT NULL,
            status INTEGER NOT NULL,
            executed_by TEXT NOT NULL,
            snapshot TEXT NOT NULL,
            started_at INTEGER NOT NULL,
            completed_at INTEGER
        );

        CREATE TABLE IF NOT EXISTS target_results (
            execution_id TEXT NOT NULL,
            position INTEGER NOT NULL,
            server_id TEXT NOT NULL,
            status INTEGER NOT NULL,
            exit_code INTEGER,
            stdout TEXT,
            stderr TEXT,
            error_message TEXT,
            started_at INTEGER,
            completed_at INTEGER,
            PRIMARY KEY (execution_id, server_id),
            FOREIGN KEY (execution_id) REFERENCES executions(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_executions_started_at ON executions(started_at);
        CREATE INDEX IF NOT EXISTS idx_executions_unit ON executions(execution_type, unit_id);
        CREATE INDEX IF NOT EXISTS idx_executions_status ON executions(status);
        CREATE INDEX IF NOT EXISTS idx_target_results_server ON target_results(server_id);
        "#,
    )
    .execute(&pool)
    .await?;

    Ok(pool)
}

#[cfg(test)]
pub(crate) async fn test_pool(dir: &tempfile::TempDir) -> DbPool {
    let path = dir.path().join("fleetd-test.db");
    establish_connection(&format!("sqlite:{}", path.display()))
        .await
        .unwrap()
}

//! Bare-bones database bootstrap shared by every binary in the workspace.
//!
//! Creates the one table every module needs regardless of its own schema:
//! `schema_version`, used by [`crate::db::migrations`] to track which
//! migrations have run. Domain tables (stations, tracks, detections, ...)
//! are created by the owning crate's own `db::schema` module.

use crate::Result;
use sqlx::SqlitePool;
use std::path::Path;

/// Open (creating if necessary) a SQLite database at `db_path` and ensure
/// the schema-version bookkeeping table exists.
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    let pool = SqlitePool::connect(&db_url).await?;

    create_schema_version_table(&pool).await?;

    Ok(pool)
}

/// Open a database from a full `sqlite://` URL (e.g. `DATABASE_URL`) rather
/// than a bare filesystem path.
pub async fn init_database_from_url(db_url: &str) -> Result<SqlitePool> {
    let pool = SqlitePool::connect(db_url).await?;
    create_schema_version_table(&pool).await?;
    Ok(pool)
}

async fn create_schema_version_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn init_from_url_creates_schema_version_table() {
        let pool = init_database_from_url("sqlite::memory:").await.unwrap();
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert!(exists);
    }
}

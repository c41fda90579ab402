//! Database access for the detection engine: one SQLite file shared by every
//! station worker, behind a single `SqlitePool`.

pub mod artists;
pub mod detections;
pub mod fingerprints;
pub mod schema;
pub mod stats;
pub mod stations;
pub mod tracks;

use detector_common::Result;
use sqlx::SqlitePool;
use std::path::Path;

/// Open (creating if necessary) the engine's database and sync its schema.
pub async fn init_database_pool(db_path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    tracing::debug!(%db_url, "opening detection engine database");

    let pool = SqlitePool::connect(&db_url).await?;
    sqlx::query("PRAGMA foreign_keys = ON").execute(&pool).await?;

    schema::init_schemas(&pool).await?;

    Ok(pool)
}

/// Open the engine's database from a full `sqlite://` URL rather than a
/// bare filesystem path (used when `DATABASE_URL` already names the scheme).
pub async fn init_database_pool_from_url(db_url: &str) -> Result<SqlitePool> {
    let pool = SqlitePool::connect(db_url).await?;
    sqlx::query("PRAGMA foreign_keys = ON").execute(&pool).await?;
    schema::init_schemas(&pool).await?;
    Ok(pool)
}

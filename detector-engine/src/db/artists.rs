//! Artist persistence.

use chrono::{DateTime, Utc};
use detector_common::Result;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

/// A recording artist. Every track references exactly one.
#[derive(Debug, Clone, PartialEq)]
pub struct Artist {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

impl Artist {
    pub fn new(name: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            name,
            created_at: Utc::now(),
        }
    }
}

fn row_to_artist(row: sqlx::sqlite::SqliteRow) -> Result<Artist> {
    let id: String = row.get("id");
    let created_at: String = row.get("created_at");
    Ok(Artist {
        id: Uuid::parse_str(&id).map_err(|e| detector_common::Error::Internal(e.to_string()))?,
        name: row.get("name"),
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map_err(|e| detector_common::Error::Internal(e.to_string()))?
            .with_timezone(&Utc),
    })
}

/// Insert an artist, returning it unchanged. Artists are never updated in
/// place — a canonical-name correction creates a fresh identity upstream.
pub async fn insert_artist(pool: &SqlitePool, artist: &Artist) -> Result<()> {
    sqlx::query("INSERT INTO artists (id, name, created_at) VALUES (?, ?, ?)")
        .bind(artist.id.to_string())
        .bind(&artist.name)
        .bind(artist.created_at.to_rfc3339())
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn find_artist_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<Artist>> {
    let row = sqlx::query("SELECT id, name, created_at FROM artists WHERE id = ?")
        .bind(id.to_string())
        .fetch_optional(pool)
        .await?;
    row.map(row_to_artist).transpose()
}

/// Exact (case-insensitive) name lookup, the first step before creating a
/// new artist identity for a resolved track.
pub async fn find_artist_by_name(pool: &SqlitePool, name: &str) -> Result<Option<Artist>> {
    let row = sqlx::query(
        "SELECT id, name, created_at FROM artists WHERE name = ? COLLATE NOCASE LIMIT 1",
    )
    .bind(name)
    .fetch_optional(pool)
    .await?;
    row.map(row_to_artist).transpose()
}

/// Look up an artist by name, creating one if none exists.
pub async fn find_or_create_artist(pool: &SqlitePool, name: &str) -> Result<Artist> {
    if let Some(existing) = find_artist_by_name(pool, name).await? {
        return Ok(existing);
    }
    let artist = Artist::new(name.to_string());
    insert_artist(pool, &artist).await?;
    Ok(artist)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::init_schemas;

    async fn test_pool() -> SqlitePool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        init_schemas(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn insert_and_find_by_id() {
        let pool = test_pool().await;
        let artist = Artist::new("Test Artist".into());
        insert_artist(&pool, &artist).await.unwrap();

        let found = find_artist_by_id(&pool, artist.id).await.unwrap().unwrap();
        assert_eq!(found.name, "Test Artist");
    }

    #[tokio::test]
    async fn find_or_create_is_idempotent_on_name() {
        let pool = test_pool().await;
        let first = find_or_create_artist(&pool, "Repeat Artist").await.unwrap();
        let second = find_or_create_artist(&pool, "repeat artist").await.unwrap();
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn missing_artist_returns_none() {
        let pool = test_pool().await;
        assert!(find_artist_by_id(&pool, Uuid::new_v4()).await.unwrap().is_none());
    }
}

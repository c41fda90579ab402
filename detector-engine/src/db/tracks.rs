//! Track persistence. A track is created once, on first successful
//! identification, and never deleted.

use chrono::{DateTime, Utc};
use detector_common::Result;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct Track {
    pub id: Uuid,
    pub title: String,
    pub artist_id: Uuid,
    pub isrc: Option<String>,
    pub label: Option<String>,
    pub album: Option<String>,
    pub release_date: Option<String>,
    pub duration_seconds: Option<f64>,
    pub primary_fingerprint_hash: Option<String>,
    pub chromaprint_vector: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Track {
    pub fn new(title: String, artist_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            title,
            artist_id,
            isrc: None,
            label: None,
            album: None,
            release_date: None,
            duration_seconds: None,
            primary_fingerprint_hash: None,
            chromaprint_vector: None,
            created_at: Utc::now(),
        }
    }
}

fn row_to_track(row: sqlx::sqlite::SqliteRow) -> Result<Track> {
    let id: String = row.get("id");
    let artist_id: String = row.get("artist_id");
    let created_at: String = row.get("created_at");

    Ok(Track {
        id: Uuid::parse_str(&id).map_err(|e| detector_common::Error::Internal(e.to_string()))?,
        title: row.get("title"),
        artist_id: Uuid::parse_str(&artist_id)
            .map_err(|e| detector_common::Error::Internal(e.to_string()))?,
        isrc: row.get("isrc"),
        label: row.get("label"),
        album: row.get("album"),
        release_date: row.get("release_date"),
        duration_seconds: row.get("duration_seconds"),
        primary_fingerprint_hash: row.get("primary_fingerprint_hash"),
        chromaprint_vector: row.get("chromaprint_vector"),
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map_err(|e| detector_common::Error::Internal(e.to_string()))?
            .with_timezone(&Utc),
    })
}

/// Insert a new track. An `isrc` collision is a programmer error — callers
/// must check [`find_track_by_isrc`] first, per the ISRC-uniqueness
/// invariant, so this surfaces as a plain database error rather than being
/// silently swallowed.
pub async fn insert_track(pool: &SqlitePool, track: &Track) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO tracks (
            id, title, artist_id, isrc, label, album, release_date,
            duration_seconds, primary_fingerprint_hash, chromaprint_vector, created_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(track.id.to_string())
    .bind(&track.title)
    .bind(track.artist_id.to_string())
    .bind(&track.isrc)
    .bind(&track.label)
    .bind(&track.album)
    .bind(&track.release_date)
    .bind(track.duration_seconds)
    .bind(&track.primary_fingerprint_hash)
    .bind(&track.chromaprint_vector)
    .bind(track.created_at.to_rfc3339())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn find_track_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<Track>> {
    let row = sqlx::query(
        r#"
        SELECT id, title, artist_id, isrc, label, album, release_date,
               duration_seconds, primary_fingerprint_hash, chromaprint_vector, created_at
        FROM tracks WHERE id = ?
        "#,
    )
    .bind(id.to_string())
    .fetch_optional(pool)
    .await?;
    row.map(row_to_track).transpose()
}

pub async fn find_track_by_isrc(pool: &SqlitePool, isrc: &str) -> Result<Option<Track>> {
    let row = sqlx::query(
        r#"
        SELECT id, title, artist_id, isrc, label, album, release_date,
               duration_seconds, primary_fingerprint_hash, chromaprint_vector, created_at
        FROM tracks WHERE isrc = ?
        "#,
    )
    .bind(isrc)
    .fetch_optional(pool)
    .await?;
    row.map(row_to_track).transpose()
}

/// Exact (title,artist) match — the cascade's cheap pre-check before it
/// falls back to scanning every track of the artist for a fuzzy match.
pub async fn find_track_by_title_and_artist(
    pool: &SqlitePool,
    title: &str,
    artist_id: Uuid,
) -> Result<Option<Track>> {
    let row = sqlx::query(
        r#"
        SELECT id, title, artist_id, isrc, label, album, release_date,
               duration_seconds, primary_fingerprint_hash, chromaprint_vector, created_at
        FROM tracks WHERE title = ? COLLATE NOCASE AND artist_id = ?
        "#,
    )
    .bind(title)
    .bind(artist_id.to_string())
    .fetch_optional(pool)
    .await?;
    row.map(row_to_track).transpose()
}

/// All tracks for an artist, the candidate pool for fuzzy title similarity
/// matching (the cascade's third step).
pub async fn list_tracks_by_artist(pool: &SqlitePool, artist_id: Uuid) -> Result<Vec<Track>> {
    let rows = sqlx::query(
        r#"
        SELECT id, title, artist_id, isrc, label, album, release_date,
               duration_seconds, primary_fingerprint_hash, chromaprint_vector, created_at
        FROM tracks WHERE artist_id = ?
        "#,
    )
    .bind(artist_id.to_string())
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(row_to_track).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::artists::{insert_artist, Artist};
    use crate::db::schema::init_schemas;

    async fn test_pool() -> SqlitePool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        init_schemas(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn insert_and_find_by_isrc() {
        let pool = test_pool().await;
        let artist = Artist::new("Artist".into());
        insert_artist(&pool, &artist).await.unwrap();

        let mut track = Track::new("Song".into(), artist.id);
        track.isrc = Some("USRC17607839".into());
        insert_track(&pool, &track).await.unwrap();

        let found = find_track_by_isrc(&pool, "USRC17607839").await.unwrap().unwrap();
        assert_eq!(found.id, track.id);
    }

    #[tokio::test]
    async fn duplicate_isrc_is_rejected() {
        let pool = test_pool().await;
        let artist = Artist::new("Artist".into());
        insert_artist(&pool, &artist).await.unwrap();

        let mut a = Track::new("Song A".into(), artist.id);
        a.isrc = Some("USRC17607839".into());
        insert_track(&pool, &a).await.unwrap();

        let mut b = Track::new("Song B".into(), artist.id);
        b.isrc = Some("USRC17607839".into());
        assert!(insert_track(&pool, &b).await.is_err());
    }

    #[tokio::test]
    async fn title_artist_lookup_is_case_insensitive() {
        let pool = test_pool().await;
        let artist = Artist::new("Artist".into());
        insert_artist(&pool, &artist).await.unwrap();
        let track = Track::new("Midnight Drive".into(), artist.id);
        insert_track(&pool, &track).await.unwrap();

        let found = find_track_by_title_and_artist(&pool, "midnight drive", artist.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, track.id);
    }
}

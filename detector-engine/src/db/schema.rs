//! Declarative schema for the detection domain.
//!
//! Tables are created with `CREATE TABLE IF NOT EXISTS` and kept in sync via
//! [`detector_common::db::schema_sync::SchemaSync`], which adds missing
//! columns on startup rather than requiring a hand-written migration for
//! every small addition.

use detector_common::db::schema_sync::{ColumnDefinition, SchemaSync, TableSchema};
use detector_common::Result;
use sqlx::SqlitePool;

/// Monitored internet radio stations.
pub struct StationsTableSchema;

impl TableSchema for StationsTableSchema {
    fn table_name() -> &'static str {
        "stations"
    }

    fn expected_columns() -> Vec<ColumnDefinition> {
        vec![
            ColumnDefinition::new("id", "TEXT").primary_key(),
            ColumnDefinition::new("stream_url", "TEXT").not_null().unique(),
            ColumnDefinition::new("status", "TEXT").not_null().default("'active'"),
            ColumnDefinition::new("last_checked_at", "TEXT"),
            ColumnDefinition::new("created_at", "TEXT").not_null(),
        ]
    }

    fn validate_schema(_pool: &SqlitePool) -> Result<()> {
        Ok(())
    }
}

/// Recording artists. Tracks reference exactly one artist, which must exist.
pub struct ArtistsTableSchema;

impl TableSchema for ArtistsTableSchema {
    fn table_name() -> &'static str {
        "artists"
    }

    fn expected_columns() -> Vec<ColumnDefinition> {
        vec![
            ColumnDefinition::new("id", "TEXT").primary_key(),
            ColumnDefinition::new("name", "TEXT").not_null(),
            ColumnDefinition::new("created_at", "TEXT").not_null(),
        ]
    }

    fn validate_schema(_pool: &SqlitePool) -> Result<()> {
        Ok(())
    }
}

/// Catalogued tracks, the engine's identification target.
pub struct TracksTableSchema;

impl TableSchema for TracksTableSchema {
    fn table_name() -> &'static str {
        "tracks"
    }

    fn expected_columns() -> Vec<ColumnDefinition> {
        vec![
            ColumnDefinition::new("id", "TEXT").primary_key(),
            ColumnDefinition::new("title", "TEXT").not_null(),
            ColumnDefinition::new("artist_id", "TEXT").not_null(),
            ColumnDefinition::new("isrc", "TEXT").unique(),
            ColumnDefinition::new("label", "TEXT"),
            ColumnDefinition::new("album", "TEXT"),
            ColumnDefinition::new("release_date", "TEXT"),
            ColumnDefinition::new("duration_seconds", "REAL"),
            ColumnDefinition::new("primary_fingerprint_hash", "TEXT"),
            ColumnDefinition::new("chromaprint_vector", "TEXT"),
            ColumnDefinition::new("created_at", "TEXT").not_null(),
        ]
    }

    fn validate_schema(_pool: &SqlitePool) -> Result<()> {
        Ok(())
    }
}

/// Fingerprints identifying a track, many per track. Deleted when the owning
/// track is deleted (`ON DELETE CASCADE`, set up in [`init_schemas`]).
pub struct FingerprintsTableSchema;

impl TableSchema for FingerprintsTableSchema {
    fn table_name() -> &'static str {
        "fingerprints"
    }

    fn expected_columns() -> Vec<ColumnDefinition> {
        vec![
            ColumnDefinition::new("id", "TEXT").primary_key(),
            ColumnDefinition::new("track_id", "TEXT").not_null(),
            ColumnDefinition::new("hash", "TEXT").not_null(),
            ColumnDefinition::new("raw_bytes", "BLOB").not_null(),
            ColumnDefinition::new("offset_seconds", "REAL").not_null().default("0"),
            ColumnDefinition::new("algorithm", "TEXT").not_null(),
            ColumnDefinition::new("created_at", "TEXT").not_null(),
        ]
    }

    fn validate_schema(_pool: &SqlitePool) -> Result<()> {
        Ok(())
    }
}

/// Append-only log of finalized (and in-progress) detections.
pub struct DetectionsTableSchema;

impl TableSchema for DetectionsTableSchema {
    fn table_name() -> &'static str {
        "detections"
    }

    fn expected_columns() -> Vec<ColumnDefinition> {
        vec![
            ColumnDefinition::new("id", "TEXT").primary_key(),
            ColumnDefinition::new("station_id", "TEXT").not_null(),
            ColumnDefinition::new("track_id", "TEXT").not_null(),
            ColumnDefinition::new("detected_at", "TEXT").not_null(),
            ColumnDefinition::new("play_duration_seconds", "REAL"),
            ColumnDefinition::new("confidence", "REAL").not_null(),
            ColumnDefinition::new("method", "TEXT").not_null(),
            ColumnDefinition::new("finalized", "INTEGER").not_null().default("0"),
        ]
    }

    fn validate_schema(_pool: &SqlitePool) -> Result<()> {
        Ok(())
    }
}

/// Per (station, track) rollups: play count, total time, last played, a
/// rolling average confidence.
pub struct StationTrackStatsTableSchema;

impl TableSchema for StationTrackStatsTableSchema {
    fn table_name() -> &'static str {
        "station_track_stats"
    }

    fn expected_columns() -> Vec<ColumnDefinition> {
        vec![
            ColumnDefinition::new("station_id", "TEXT").not_null(),
            ColumnDefinition::new("track_id", "TEXT").not_null(),
            ColumnDefinition::new("play_count", "INTEGER").not_null().default("0"),
            ColumnDefinition::new("total_play_seconds", "REAL").not_null().default("0"),
            ColumnDefinition::new("last_played_at", "TEXT"),
            ColumnDefinition::new("rolling_avg_confidence", "REAL").not_null().default("0"),
        ]
    }

    fn validate_schema(_pool: &SqlitePool) -> Result<()> {
        Ok(())
    }
}

/// Per-track totals across all stations.
pub struct TrackStatsTableSchema;

impl TableSchema for TrackStatsTableSchema {
    fn table_name() -> &'static str {
        "track_stats"
    }

    fn expected_columns() -> Vec<ColumnDefinition> {
        vec![
            ColumnDefinition::new("track_id", "TEXT").primary_key(),
            ColumnDefinition::new("play_count", "INTEGER").not_null().default("0"),
            ColumnDefinition::new("total_play_seconds", "REAL").not_null().default("0"),
            ColumnDefinition::new("last_played_at", "TEXT"),
        ]
    }

    fn validate_schema(_pool: &SqlitePool) -> Result<()> {
        Ok(())
    }
}

/// Per-artist totals across all of an artist's tracks and stations.
pub struct ArtistStatsTableSchema;

impl TableSchema for ArtistStatsTableSchema {
    fn table_name() -> &'static str {
        "artist_stats"
    }

    fn expected_columns() -> Vec<ColumnDefinition> {
        vec![
            ColumnDefinition::new("artist_id", "TEXT").primary_key(),
            ColumnDefinition::new("play_count", "INTEGER").not_null().default("0"),
            ColumnDefinition::new("total_play_seconds", "REAL").not_null().default("0"),
            ColumnDefinition::new("last_played_at", "TEXT"),
        ]
    }

    fn validate_schema(_pool: &SqlitePool) -> Result<()> {
        Ok(())
    }
}

/// Create (if absent) and column-sync every table the engine owns.
///
/// Foreign-key cascade (`tracks` → `fingerprints`) is declared by hand since
/// `TableSchema` only models columns; SQLite also needs `PRAGMA foreign_keys
/// = ON` per connection, which the pool's connect options set.
pub async fn init_schemas(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS stations (
            id TEXT PRIMARY KEY,
            stream_url TEXT NOT NULL UNIQUE,
            status TEXT NOT NULL DEFAULT 'active',
            last_checked_at TEXT,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS artists (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tracks (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            artist_id TEXT NOT NULL REFERENCES artists(id),
            isrc TEXT UNIQUE,
            label TEXT,
            album TEXT,
            release_date TEXT,
            duration_seconds REAL,
            primary_fingerprint_hash TEXT,
            chromaprint_vector TEXT,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS fingerprints (
            id TEXT PRIMARY KEY,
            track_id TEXT NOT NULL REFERENCES tracks(id) ON DELETE CASCADE,
            hash TEXT NOT NULL,
            raw_bytes BLOB NOT NULL,
            offset_seconds REAL NOT NULL DEFAULT 0,
            algorithm TEXT NOT NULL,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_fingerprints_hash ON fingerprints(hash)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_fingerprints_track ON fingerprints(track_id)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS detections (
            id TEXT PRIMARY KEY,
            station_id TEXT NOT NULL REFERENCES stations(id),
            track_id TEXT NOT NULL REFERENCES tracks(id),
            detected_at TEXT NOT NULL,
            play_duration_seconds REAL,
            confidence REAL NOT NULL,
            method TEXT NOT NULL,
            finalized INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS station_track_stats (
            station_id TEXT NOT NULL,
            track_id TEXT NOT NULL,
            play_count INTEGER NOT NULL DEFAULT 0,
            total_play_seconds REAL NOT NULL DEFAULT 0,
            last_played_at TEXT,
            rolling_avg_confidence REAL NOT NULL DEFAULT 0,
            PRIMARY KEY (station_id, track_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS track_stats (
            track_id TEXT PRIMARY KEY,
            play_count INTEGER NOT NULL DEFAULT 0,
            total_play_seconds REAL NOT NULL DEFAULT 0,
            last_played_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS artist_stats (
            artist_id TEXT PRIMARY KEY,
            play_count INTEGER NOT NULL DEFAULT 0,
            total_play_seconds REAL NOT NULL DEFAULT 0,
            last_played_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    SchemaSync::sync_table::<StationsTableSchema>(pool).await?;
    SchemaSync::sync_table::<ArtistsTableSchema>(pool).await?;
    SchemaSync::sync_table::<TracksTableSchema>(pool).await?;
    SchemaSync::sync_table::<FingerprintsTableSchema>(pool).await?;
    SchemaSync::sync_table::<DetectionsTableSchema>(pool).await?;
    SchemaSync::sync_table::<StationTrackStatsTableSchema>(pool).await?;
    SchemaSync::sync_table::<TrackStatsTableSchema>(pool).await?;
    SchemaSync::sync_table::<ArtistStatsTableSchema>(pool).await?;

    tracing::info!("detection engine schema synchronized");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_table_references_one_artist_column() {
        let columns = TracksTableSchema::expected_columns();
        assert!(columns.iter().any(|c| c.name == "artist_id" && c.not_null));
    }

    #[test]
    fn isrc_column_is_unique_but_optional() {
        let columns = TracksTableSchema::expected_columns();
        let isrc = columns.iter().find(|c| c.name == "isrc").unwrap();
        assert!(isrc.unique);
        assert!(!isrc.not_null);
    }

    #[test]
    fn detections_default_to_not_finalized() {
        let columns = DetectionsTableSchema::expected_columns();
        let finalized = columns.iter().find(|c| c.name == "finalized").unwrap();
        assert_eq!(finalized.default_value.as_deref(), Some("0"));
    }

    #[tokio::test]
    async fn init_schemas_creates_all_tables() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        init_schemas(&pool).await.unwrap();

        for table in [
            "stations",
            "artists",
            "tracks",
            "fingerprints",
            "detections",
            "station_track_stats",
            "track_stats",
            "artist_stats",
        ] {
            let exists: bool = sqlx::query_scalar(
                "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name=?)",
            )
            .bind(table)
            .fetch_one(&pool)
            .await
            .unwrap();
            assert!(exists, "table {table} should exist");
        }
    }
}

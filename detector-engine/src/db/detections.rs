//! Detection persistence. A detection row is created "in progress" when a
//! track first appears on a station and finalized when it ends; once
//! finalized, rows are append-only.

use chrono::{DateTime, Utc};
use detector_common::Result;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionMethod {
    Isrc,
    LocalExact,
    LocalSimilarity,
    MetadataDirectory,
    Acoustid,
    Audd,
}

impl DetectionMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            DetectionMethod::Isrc => "isrc",
            DetectionMethod::LocalExact => "local_exact",
            DetectionMethod::LocalSimilarity => "local_similarity",
            DetectionMethod::MetadataDirectory => "metadata_directory",
            DetectionMethod::Acoustid => "acoustid",
            DetectionMethod::Audd => "audd",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "isrc" => Ok(DetectionMethod::Isrc),
            "local_exact" => Ok(DetectionMethod::LocalExact),
            "local_similarity" => Ok(DetectionMethod::LocalSimilarity),
            "metadata_directory" => Ok(DetectionMethod::MetadataDirectory),
            "acoustid" => Ok(DetectionMethod::Acoustid),
            "audd" => Ok(DetectionMethod::Audd),
            other => Err(detector_common::Error::Internal(format!(
                "unknown detection method: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Detection {
    pub id: Uuid,
    pub station_id: Uuid,
    pub track_id: Uuid,
    pub detected_at: DateTime<Utc>,
    pub play_duration_seconds: Option<f64>,
    pub confidence: f32,
    pub method: DetectionMethod,
    pub finalized: bool,
}

impl Detection {
    /// A fresh in-progress detection, created the instant a track is
    /// identified on a station.
    pub fn start(
        station_id: Uuid,
        track_id: Uuid,
        confidence: f32,
        method: DetectionMethod,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            station_id,
            track_id,
            detected_at: Utc::now(),
            play_duration_seconds: None,
            confidence,
            method,
            finalized: false,
        }
    }
}

fn row_to_detection(row: sqlx::sqlite::SqliteRow) -> Result<Detection> {
    let id: String = row.get("id");
    let station_id: String = row.get("station_id");
    let track_id: String = row.get("track_id");
    let detected_at: String = row.get("detected_at");
    let method: String = row.get("method");
    let finalized: i64 = row.get("finalized");

    Ok(Detection {
        id: Uuid::parse_str(&id).map_err(|e| detector_common::Error::Internal(e.to_string()))?,
        station_id: Uuid::parse_str(&station_id)
            .map_err(|e| detector_common::Error::Internal(e.to_string()))?,
        track_id: Uuid::parse_str(&track_id)
            .map_err(|e| detector_common::Error::Internal(e.to_string()))?,
        detected_at: DateTime::parse_from_rfc3339(&detected_at)
            .map_err(|e| detector_common::Error::Internal(e.to_string()))?
            .with_timezone(&Utc),
        play_duration_seconds: row.get("play_duration_seconds"),
        confidence: row.get("confidence"),
        method: DetectionMethod::parse(&method)?,
        finalized: finalized != 0,
    })
}

pub async fn insert_detection(pool: &SqlitePool, detection: &Detection) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO detections (
            id, station_id, track_id, detected_at, play_duration_seconds,
            confidence, method, finalized
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(detection.id.to_string())
    .bind(detection.station_id.to_string())
    .bind(detection.track_id.to_string())
    .bind(detection.detected_at.to_rfc3339())
    .bind(detection.play_duration_seconds)
    .bind(detection.confidence)
    .bind(detection.method.as_str())
    .bind(detection.finalized as i64)
    .execute(pool)
    .await?;
    Ok(())
}

/// Finalize a detection with its observed play duration. Idempotent: a
/// second call against an already-finalized row is a no-op success, since
/// the tracker may retry after a transient database error.
pub async fn finalize_detection(
    pool: &SqlitePool,
    id: Uuid,
    play_duration_seconds: f64,
) -> Result<()> {
    sqlx::query(
        "UPDATE detections SET play_duration_seconds = ?, finalized = 1 WHERE id = ? AND finalized = 0",
    )
    .bind(play_duration_seconds)
    .bind(id.to_string())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn find_detection_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<Detection>> {
    let row = sqlx::query(
        r#"
        SELECT id, station_id, track_id, detected_at, play_duration_seconds,
               confidence, method, finalized
        FROM detections WHERE id = ?
        "#,
    )
    .bind(id.to_string())
    .fetch_optional(pool)
    .await?;
    row.map(row_to_detection).transpose()
}

/// The single in-progress (unfinalized) detection for a station, if any.
/// A station has at most one at a time by construction.
pub async fn find_in_progress_for_station(
    pool: &SqlitePool,
    station_id: Uuid,
) -> Result<Option<Detection>> {
    let row = sqlx::query(
        r#"
        SELECT id, station_id, track_id, detected_at, play_duration_seconds,
               confidence, method, finalized
        FROM detections WHERE station_id = ? AND finalized = 0
        ORDER BY detected_at DESC LIMIT 1
        "#,
    )
    .bind(station_id.to_string())
    .fetch_optional(pool)
    .await?;
    row.map(row_to_detection).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::artists::{insert_artist, Artist};
    use crate::db::schema::init_schemas;
    use crate::db::stations::{insert_station, Station};
    use crate::db::tracks::{insert_track, Track};

    async fn fixture() -> (SqlitePool, Uuid, Uuid) {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        init_schemas(&pool).await.unwrap();
        let artist = Artist::new("Artist".into());
        insert_artist(&pool, &artist).await.unwrap();
        let track = Track::new("Song".into(), artist.id);
        insert_track(&pool, &track).await.unwrap();
        let station = Station::new("http://stream.example.com/a".into());
        insert_station(&pool, &station).await.unwrap();
        (pool, station.id, track.id)
    }

    #[tokio::test]
    async fn start_then_finalize() {
        let (pool, station_id, track_id) = fixture().await;
        let detection = Detection::start(station_id, track_id, 0.95, DetectionMethod::Isrc);
        insert_detection(&pool, &detection).await.unwrap();

        let in_progress = find_in_progress_for_station(&pool, station_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(in_progress.id, detection.id);
        assert!(!in_progress.finalized);

        finalize_detection(&pool, detection.id, 183.5).await.unwrap();

        assert!(find_in_progress_for_station(&pool, station_id)
            .await
            .unwrap()
            .is_none());

        let finalized = find_detection_by_id(&pool, detection.id).await.unwrap().unwrap();
        assert!(finalized.finalized);
        assert_eq!(finalized.play_duration_seconds, Some(183.5));
    }

    #[tokio::test]
    async fn finalize_is_idempotent() {
        let (pool, station_id, track_id) = fixture().await;
        let detection = Detection::start(station_id, track_id, 0.8, DetectionMethod::Acoustid);
        insert_detection(&pool, &detection).await.unwrap();

        finalize_detection(&pool, detection.id, 100.0).await.unwrap();
        finalize_detection(&pool, detection.id, 999.0).await.unwrap();

        let finalized = find_detection_by_id(&pool, detection.id).await.unwrap().unwrap();
        assert_eq!(finalized.play_duration_seconds, Some(100.0));
    }
}

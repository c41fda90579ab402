//! Stats rollups: the single transaction that finalizes a detection and
//! updates every dependent aggregate.

use chrono::Utc;
use detector_common::human_time::format_human_time_auto;
use detector_common::Result;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tracing::debug;
use uuid::Uuid;

/// Finalize `detection_id` with its observed `play_duration_seconds` and
/// roll the result into station/track/artist stats, all in one transaction.
///
/// Idempotent: re-applying a finalization for a detection that is no longer
/// in-progress is a no-op, so a retried finalize (after a transient
/// connection failure, say) can't double-count a play.
pub async fn finalize_and_record(
    pool: &SqlitePool,
    detection_id: Uuid,
    station_id: Uuid,
    track_id: Uuid,
    artist_id: Uuid,
    play_duration_seconds: f64,
    confidence: f32,
) -> Result<bool> {
    let mut tx = pool.begin().await?;

    let updated = sqlx::query(
        "UPDATE detections SET play_duration_seconds = ?, finalized = 1 WHERE id = ? AND finalized = 0",
    )
    .bind(play_duration_seconds)
    .bind(detection_id.to_string())
    .execute(&mut *tx)
    .await?
    .rows_affected();

    if updated == 0 {
        tx.rollback().await?;
        return Ok(false);
    }

    upsert_station_track_stats(&mut tx, station_id, track_id, play_duration_seconds, confidence)
        .await?;
    upsert_track_stats(&mut tx, track_id, play_duration_seconds).await?;
    upsert_artist_stats(&mut tx, artist_id, play_duration_seconds).await?;

    tx.commit().await?;
    debug!(
        %station_id, %track_id,
        duration = %format_human_time_auto(play_duration_seconds.round() as i64),
        confidence, "detection finalized",
    );
    Ok(true)
}

async fn upsert_station_track_stats(
    tx: &mut Transaction<'_, Sqlite>,
    station_id: Uuid,
    track_id: Uuid,
    duration: f64,
    confidence: f32,
) -> Result<()> {
    let existing = sqlx::query(
        "SELECT play_count, rolling_avg_confidence FROM station_track_stats WHERE station_id = ? AND track_id = ?",
    )
    .bind(station_id.to_string())
    .bind(track_id.to_string())
    .fetch_optional(&mut **tx)
    .await?;

    let now = Utc::now().to_rfc3339();

    match existing {
        Some(row) => {
            let play_count: i64 = row.get("play_count");
            let old_avg: f64 = row.get("rolling_avg_confidence");
            let new_count = play_count + 1;
            let new_avg = (old_avg * play_count as f64 + confidence as f64) / new_count as f64;

            sqlx::query(
                r#"
                UPDATE station_track_stats
                SET play_count = ?, total_play_seconds = total_play_seconds + ?,
                    last_played_at = ?, rolling_avg_confidence = ?
                WHERE station_id = ? AND track_id = ?
                "#,
            )
            .bind(new_count)
            .bind(duration)
            .bind(&now)
            .bind(new_avg)
            .bind(station_id.to_string())
            .bind(track_id.to_string())
            .execute(&mut **tx)
            .await?;
        }
        None => {
            sqlx::query(
                r#"
                INSERT INTO station_track_stats
                    (station_id, track_id, play_count, total_play_seconds, last_played_at, rolling_avg_confidence)
                VALUES (?, ?, 1, ?, ?, ?)
                "#,
            )
            .bind(station_id.to_string())
            .bind(track_id.to_string())
            .bind(duration)
            .bind(&now)
            .bind(confidence as f64)
            .execute(&mut **tx)
            .await?;
        }
    }

    Ok(())
}

async fn upsert_track_stats(
    tx: &mut Transaction<'_, Sqlite>,
    track_id: Uuid,
    duration: f64,
) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    sqlx::query(
        r#"
        INSERT INTO track_stats (track_id, play_count, total_play_seconds, last_played_at)
        VALUES (?, 1, ?, ?)
        ON CONFLICT(track_id) DO UPDATE SET
            play_count = play_count + 1,
            total_play_seconds = total_play_seconds + excluded.total_play_seconds,
            last_played_at = excluded.last_played_at
        "#,
    )
    .bind(track_id.to_string())
    .bind(duration)
    .bind(&now)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn upsert_artist_stats(
    tx: &mut Transaction<'_, Sqlite>,
    artist_id: Uuid,
    duration: f64,
) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    sqlx::query(
        r#"
        INSERT INTO artist_stats (artist_id, play_count, total_play_seconds, last_played_at)
        VALUES (?, 1, ?, ?)
        ON CONFLICT(artist_id) DO UPDATE SET
            play_count = play_count + 1,
            total_play_seconds = total_play_seconds + excluded.total_play_seconds,
            last_played_at = excluded.last_played_at
        "#,
    )
    .bind(artist_id.to_string())
    .bind(duration)
    .bind(&now)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::artists::{insert_artist, Artist};
    use crate::db::detections::{insert_detection, Detection, DetectionMethod};
    use crate::db::schema::init_schemas;
    use crate::db::stations::{insert_station, Station};
    use crate::db::tracks::{insert_track, Track};

    async fn fixture() -> (SqlitePool, Uuid, Uuid, Uuid) {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        init_schemas(&pool).await.unwrap();
        let artist = Artist::new("Artist".into());
        insert_artist(&pool, &artist).await.unwrap();
        let track = Track::new("Song".into(), artist.id);
        insert_track(&pool, &track).await.unwrap();
        let station = Station::new("http://stream.example.com/a".into());
        insert_station(&pool, &station).await.unwrap();
        (pool, station.id, track.id, artist.id)
    }

    #[tokio::test]
    async fn finalize_rolls_up_all_three_stats_tables() {
        let (pool, station_id, track_id, artist_id) = fixture().await;
        let detection = Detection::start(station_id, track_id, 0.9, DetectionMethod::Isrc);
        insert_detection(&pool, &detection).await.unwrap();

        let applied =
            finalize_and_record(&pool, detection.id, station_id, track_id, artist_id, 180.0, 0.9)
                .await
                .unwrap();
        assert!(applied);

        let station_track: (i64, f64) = sqlx::query_as(
            "SELECT play_count, rolling_avg_confidence FROM station_track_stats WHERE station_id = ? AND track_id = ?",
        )
        .bind(station_id.to_string())
        .bind(track_id.to_string())
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(station_track.0, 1);
        assert!((station_track.1 - 0.9).abs() < 1e-9);

        let track_total: f64 =
            sqlx::query_scalar("SELECT total_play_seconds FROM track_stats WHERE track_id = ?")
                .bind(track_id.to_string())
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(track_total, 180.0);

        let artist_total: f64 =
            sqlx::query_scalar("SELECT total_play_seconds FROM artist_stats WHERE artist_id = ?")
                .bind(artist_id.to_string())
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(artist_total, 180.0);
    }

    #[tokio::test]
    async fn rolling_average_confidence_updates_across_plays() {
        let (pool, station_id, track_id, artist_id) = fixture().await;

        let first = Detection::start(station_id, track_id, 0.8, DetectionMethod::LocalExact);
        insert_detection(&pool, &first).await.unwrap();
        finalize_and_record(&pool, first.id, station_id, track_id, artist_id, 100.0, 0.8)
            .await
            .unwrap();

        let second = Detection::start(station_id, track_id, 1.0, DetectionMethod::LocalExact);
        insert_detection(&pool, &second).await.unwrap();
        finalize_and_record(&pool, second.id, station_id, track_id, artist_id, 100.0, 1.0)
            .await
            .unwrap();

        let avg: f64 = sqlx::query_scalar(
            "SELECT rolling_avg_confidence FROM station_track_stats WHERE station_id = ? AND track_id = ?",
        )
        .bind(station_id.to_string())
        .bind(track_id.to_string())
        .fetch_one(&pool)
        .await
        .unwrap();
        assert!((avg - 0.9).abs() < 1e-9);
    }

    #[tokio::test]
    async fn re_finalizing_is_a_no_op() {
        let (pool, station_id, track_id, artist_id) = fixture().await;
        let detection = Detection::start(station_id, track_id, 0.9, DetectionMethod::Isrc);
        insert_detection(&pool, &detection).await.unwrap();

        finalize_and_record(&pool, detection.id, station_id, track_id, artist_id, 180.0, 0.9)
            .await
            .unwrap();
        let applied_again =
            finalize_and_record(&pool, detection.id, station_id, track_id, artist_id, 999.0, 0.1)
                .await
                .unwrap();
        assert!(!applied_again);

        let play_count: i64 = sqlx::query_scalar(
            "SELECT play_count FROM station_track_stats WHERE station_id = ? AND track_id = ?",
        )
        .bind(station_id.to_string())
        .bind(track_id.to_string())
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(play_count, 1);
    }
}

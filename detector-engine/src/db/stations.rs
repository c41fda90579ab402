//! Station persistence.

use chrono::{DateTime, Utc};
use detector_common::Result;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StationStatus {
    Active,
    Inactive,
    Degraded,
}

impl StationStatus {
    fn as_str(self) -> &'static str {
        match self {
            StationStatus::Active => "active",
            StationStatus::Inactive => "inactive",
            StationStatus::Degraded => "degraded",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(StationStatus::Active),
            "inactive" => Ok(StationStatus::Inactive),
            "degraded" => Ok(StationStatus::Degraded),
            other => Err(detector_common::Error::Internal(format!(
                "unknown station status: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Station {
    pub id: Uuid,
    pub stream_url: String,
    pub status: StationStatus,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Station {
    pub fn new(stream_url: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            stream_url,
            status: StationStatus::Active,
            last_checked_at: None,
            created_at: Utc::now(),
        }
    }
}

fn row_to_station(row: sqlx::sqlite::SqliteRow) -> Result<Station> {
    let id: String = row.get("id");
    let status: String = row.get("status");
    let created_at: String = row.get("created_at");
    let last_checked_at: Option<String> = row.get("last_checked_at");

    Ok(Station {
        id: Uuid::parse_str(&id).map_err(|e| detector_common::Error::Internal(e.to_string()))?,
        stream_url: row.get("stream_url"),
        status: StationStatus::parse(&status)?,
        last_checked_at: last_checked_at
            .map(|s| DateTime::parse_from_rfc3339(&s).map(|d| d.with_timezone(&Utc)))
            .transpose()
            .map_err(|e| detector_common::Error::Internal(e.to_string()))?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map_err(|e| detector_common::Error::Internal(e.to_string()))?
            .with_timezone(&Utc),
    })
}

pub async fn insert_station(pool: &SqlitePool, station: &Station) -> Result<()> {
    sqlx::query(
        "INSERT INTO stations (id, stream_url, status, last_checked_at, created_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(station.id.to_string())
    .bind(&station.stream_url)
    .bind(station.status.as_str())
    .bind(station.last_checked_at.map(|t| t.to_rfc3339()))
    .bind(station.created_at.to_rfc3339())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn find_station_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<Station>> {
    let row = sqlx::query(
        "SELECT id, stream_url, status, last_checked_at, created_at FROM stations WHERE id = ?",
    )
    .bind(id.to_string())
    .fetch_optional(pool)
    .await?;
    row.map(row_to_station).transpose()
}

pub async fn list_active_stations(pool: &SqlitePool) -> Result<Vec<Station>> {
    let rows = sqlx::query(
        "SELECT id, stream_url, status, last_checked_at, created_at FROM stations WHERE status != 'inactive'",
    )
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(row_to_station).collect()
}

/// Update a station's status and stamp `last_checked_at` with now.
pub async fn update_station_status(
    pool: &SqlitePool,
    id: Uuid,
    status: StationStatus,
) -> Result<()> {
    sqlx::query("UPDATE stations SET status = ?, last_checked_at = ? WHERE id = ?")
        .bind(status.as_str())
        .bind(Utc::now().to_rfc3339())
        .bind(id.to_string())
        .execute(pool)
        .await?;
    Ok(())
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
    async fn insert_and_find() {
        let pool = test_pool().await;
        let station = Station::new("http://stream.example.com/radio".into());
        insert_station(&pool, &station).await.unwrap();

        let found = find_station_by_id(&pool, station.id).await.unwrap().unwrap();
        assert_eq!(found.status, StationStatus::Active);
    }

    #[tokio::test]
    async fn degraded_station_excluded_from_active_only_if_inactive() {
        let pool = test_pool().await;
        let station = Station::new("http://stream.example.com/degraded".into());
        insert_station(&pool, &station).await.unwrap();
        update_station_status(&pool, station.id, StationStatus::Degraded)
            .await
            .unwrap();

        let active = list_active_stations(&pool).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].status, StationStatus::Degraded);
        assert!(active[0].last_checked_at.is_some());
    }
}

//! Fingerprint persistence. Many fingerprints per track; deleted with their
//! track via `ON DELETE CASCADE`.

use chrono::{DateTime, Utc};
use detector_common::Result;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FingerprintAlgorithm {
    Md5,
    Chromaprint,
    /// A serialized [`crate::features::FeatureBundle`], scanned via
    /// [`crate::fingerprint::feature_similarity`] when no exact hash hits.
    Feature,
}

impl FingerprintAlgorithm {
    fn as_str(self) -> &'static str {
        match self {
            FingerprintAlgorithm::Md5 => "md5",
            FingerprintAlgorithm::Chromaprint => "chromaprint",
            FingerprintAlgorithm::Feature => "feature",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "md5" => Ok(FingerprintAlgorithm::Md5),
            "chromaprint" => Ok(FingerprintAlgorithm::Chromaprint),
            "feature" => Ok(FingerprintAlgorithm::Feature),
            other => Err(detector_common::Error::Internal(format!(
                "unknown fingerprint algorithm: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Fingerprint {
    pub id: Uuid,
    pub track_id: Uuid,
    pub hash: String,
    pub raw_bytes: Vec<u8>,
    pub offset_seconds: f64,
    pub algorithm: FingerprintAlgorithm,
    pub created_at: DateTime<Utc>,
}

impl Fingerprint {
    pub fn new(
        track_id: Uuid,
        hash: String,
        raw_bytes: Vec<u8>,
        offset_seconds: f64,
        algorithm: FingerprintAlgorithm,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            track_id,
            hash,
            raw_bytes,
            offset_seconds,
            algorithm,
            created_at: Utc::now(),
        }
    }
}

fn row_to_fingerprint(row: sqlx::sqlite::SqliteRow) -> Result<Fingerprint> {
    let id: String = row.get("id");
    let track_id: String = row.get("track_id");
    let algorithm: String = row.get("algorithm");
    let created_at: String = row.get("created_at");

    Ok(Fingerprint {
        id: Uuid::parse_str(&id).map_err(|e| detector_common::Error::Internal(e.to_string()))?,
        track_id: Uuid::parse_str(&track_id)
            .map_err(|e| detector_common::Error::Internal(e.to_string()))?,
        hash: row.get("hash"),
        raw_bytes: row.get("raw_bytes"),
        offset_seconds: row.get("offset_seconds"),
        algorithm: FingerprintAlgorithm::parse(&algorithm)?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map_err(|e| detector_common::Error::Internal(e.to_string()))?
            .with_timezone(&Utc),
    })
}

pub async fn insert_fingerprint(pool: &SqlitePool, fp: &Fingerprint) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO fingerprints (id, track_id, hash, raw_bytes, offset_seconds, algorithm, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(fp.id.to_string())
    .bind(fp.track_id.to_string())
    .bind(&fp.hash)
    .bind(&fp.raw_bytes)
    .bind(fp.offset_seconds)
    .bind(fp.algorithm.as_str())
    .bind(fp.created_at.to_rfc3339())
    .execute(pool)
    .await?;
    Ok(())
}

/// Exact hash match, the fastest and most precise cascade step.
pub async fn find_by_hash(
    pool: &SqlitePool,
    hash: &str,
    algorithm: FingerprintAlgorithm,
) -> Result<Vec<Fingerprint>> {
    let rows = sqlx::query(
        r#"
        SELECT id, track_id, hash, raw_bytes, offset_seconds, algorithm, created_at
        FROM fingerprints WHERE hash = ? AND algorithm = ?
        "#,
    )
    .bind(hash)
    .bind(algorithm.as_str())
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(row_to_fingerprint).collect()
}

/// All Chromaprint fingerprints, the candidate pool for similarity scoring
/// when no exact hash matches.
pub async fn list_chromaprint_fingerprints(pool: &SqlitePool) -> Result<Vec<Fingerprint>> {
    let rows = sqlx::query(
        r#"
        SELECT id, track_id, hash, raw_bytes, offset_seconds, algorithm, created_at
        FROM fingerprints WHERE algorithm = 'chromaprint'
        "#,
    )
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(row_to_fingerprint).collect()
}

/// All feature-bundle fingerprints, the candidate pool for the generic
/// (non-Chromaprint) local-similarity scan.
pub async fn list_feature_fingerprints(pool: &SqlitePool) -> Result<Vec<Fingerprint>> {
    let rows = sqlx::query(
        r#"
        SELECT id, track_id, hash, raw_bytes, offset_seconds, algorithm, created_at
        FROM fingerprints WHERE algorithm = 'feature'
        "#,
    )
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(row_to_fingerprint).collect()
}

//! TrackResolver: the sequential, deterministic identification cascade.
//!
//! Each step is cheaper and faster than the one after it; the cascade stops
//! at the first hit. No parallel fan-out — unlike the teacher's original
//! `ParallelExtractor`, which ran every source concurrently, a station
//! worker pays for at most one external API call per chunk.

pub mod acoustid_client;
pub mod audd_client;
pub mod metadata_directory_client;

pub use acoustid_client::AcoustIdClient;
pub use audd_client::AuddClient;
pub use metadata_directory_client::MetadataDirectoryClient;

use std::time::Duration;

use strsim::normalized_levenshtein;
use thiserror::Error;
use tokio::time::timeout;
use uuid::Uuid;

use crate::db::artists::find_or_create_artist;
use crate::db::detections::DetectionMethod;
use crate::db::fingerprints::{
    find_by_hash, insert_fingerprint, list_chromaprint_fingerprints, list_feature_fingerprints, Fingerprint,
    FingerprintAlgorithm,
};
use crate::db::tracks::{find_track_by_isrc, find_track_by_title_and_artist, insert_track, list_tracks_by_artist, Track};
use crate::features::FeatureBundle;
use crate::fingerprint::{
    chromaprint_similarity, decode_feature_bundle, encode_feature_bundle, feature_similarity, hash_fingerprint,
    CHROMAPRINT_SIMILARITY_THRESHOLD, LOCAL_SIMILARITY_THRESHOLD,
};
use acoustid_client::score_to_confidence as acoustid_confidence;
use audd_client::ContentMatch;

const FUZZY_TITLE_ARTIST_THRESHOLD: f64 = 0.8;
const EXTERNAL_STEP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ResolverError {
    #[error(transparent)]
    Persistence(#[from] detector_common::Error),
}

/// External clients the cascade calls through, shared across every station
/// worker. `None` for a provider means its API key is unconfigured — that
/// step is skipped, not retried, per the engine's graceful-degradation rule.
#[derive(Default)]
pub struct ResolverClients {
    pub acoustid: Option<AcoustIdClient>,
    pub audd: Option<AuddClient>,
    pub metadata_directory: Option<MetadataDirectoryClient>,
}

pub struct ResolutionInput<'a> {
    pub isrc_hint: Option<&'a str>,
    pub features: &'a FeatureBundle,
    pub chromaprint_vector: Option<&'a [u32]>,
    /// Base64-compressed Chromaprint string, as AcoustID expects it. Derived
    /// from the same raw PCM as `chromaprint_vector` but a different
    /// encoding, since AcoustID and the local similarity scan want different
    /// shapes of the same fingerprint.
    pub chromaprint_base64: Option<&'a str>,
    pub approx_duration_seconds: u32,
    pub icy_artist_title: Option<(&'a str, &'a str)>,
    /// A bounded (<=10s) raw audio excerpt, for the content-ID probe.
    pub content_excerpt: Option<&'a [u8]>,
}

#[derive(Debug, Clone)]
pub struct Resolution {
    pub track_id: Uuid,
    pub confidence: f32,
    pub method: DetectionMethod,
}

struct CanonicalMetadata {
    title: Option<String>,
    artist: Option<String>,
    isrc: Option<String>,
    album: Option<String>,
    label: Option<String>,
    release_date: Option<String>,
}

/// Run the cascade. `Ok(None)` is a full-cascade miss (`NoMatch`); every
/// other failure is a persistence error the caller propagates as fatal for
/// this station-cycle, per the error handling design.
pub async fn resolve(
    pool: &sqlx::SqlitePool,
    clients: &ResolverClients,
    input: ResolutionInput<'_>,
) -> Result<Option<Resolution>, ResolverError> {
    // Step 1: ISRC shortcut.
    if let Some(isrc) = input.isrc_hint {
        if let Some(track) = find_track_by_isrc(pool, isrc).await? {
            return Ok(Some(Resolution {
                track_id: track.id,
                confidence: 1.0,
                method: DetectionMethod::Isrc,
            }));
        }
    }

    let hash = hash_fingerprint(input.features);

    // Step 2: local exact hash match.
    let exact_matches = find_by_hash(pool, &hash, FingerprintAlgorithm::Md5).await?;
    if let Some(fp) = exact_matches.first() {
        return Ok(Some(Resolution {
            track_id: fp.track_id,
            confidence: 1.0,
            method: DetectionMethod::LocalExact,
        }));
    }

    // Step 3: local similarity scan, across both the generic feature-bundle
    // pool (>=0.7) and the Chromaprint pool (>=0.85); overall best wins.
    let feature_candidates = list_feature_fingerprints(pool).await?;
    let mut best = feature_candidates
        .iter()
        .map(|fp| (fp.track_id, feature_similarity(input.features, &decode_feature_bundle(&fp.raw_bytes))))
        .filter(|(_, score)| *score >= LOCAL_SIMILARITY_THRESHOLD)
        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

    if let Some(vector) = input.chromaprint_vector {
        let candidates = list_chromaprint_fingerprints(pool).await?;
        let chromaprint_best = candidates
            .iter()
            .map(|fp| (fp.track_id, chromaprint_similarity(vector, &decode_u32_vec(&fp.raw_bytes))))
            .filter(|(_, score)| *score >= CHROMAPRINT_SIMILARITY_THRESHOLD)
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

        best = match (best, chromaprint_best) {
            (Some(a), Some(b)) => Some(if b.1 >= a.1 { b } else { a }),
            (a, b) => a.or(b),
        };
    }

    if let Some((track_id, score)) = best {
        return Ok(Some(Resolution {
            track_id,
            confidence: score,
            method: DetectionMethod::LocalSimilarity,
        }));
    }

    // Step 4: metadata probe, only when ICY hints parsed as "Artist - Title".
    if let (Some((artist, title)), Some(client)) = (input.icy_artist_title, &clients.metadata_directory) {
        if let Ok(Ok(candidate)) = timeout(EXTERNAL_STEP_TIMEOUT, client.lookup(artist, title)).await {
            if candidate.score >= 0.7 {
                let metadata = CanonicalMetadata {
                    title: Some(candidate.title),
                    artist: Some(candidate.artist),
                    isrc: candidate.isrc,
                    album: None,
                    label: None,
                    release_date: None,
                };
                return canonicalize_and_persist(
                    pool,
                    metadata,
                    candidate.score,
                    DetectionMethod::MetadataDirectory,
                    &hash,
                    input.features,
                    input.chromaprint_vector,
                )
                .await
                .map(Some);
            }
        }
    }

    // Step 5: acoustic probe (AcoustID).
    if let (Some(fingerprint_b64), Some(client)) = (input.chromaprint_base64, &clients.acoustid) {
        if let Ok(Ok(acoustic_match)) = timeout(
            EXTERNAL_STEP_TIMEOUT,
            client.lookup(fingerprint_b64, input.approx_duration_seconds),
        )
        .await
        {
            let confidence = acoustid_confidence(acoustic_match.score);
            let metadata = CanonicalMetadata {
                title: None,
                artist: None,
                isrc: acoustic_match.isrc,
                album: None,
                label: None,
                release_date: None,
            };
            return canonicalize_and_persist(
                pool,
                metadata,
                confidence,
                DetectionMethod::Acoustid,
                &hash,
                input.features,
                input.chromaprint_vector,
            )
            .await
            .map(Some);
        }
    }

    // Step 6: content probe (AudD).
    if let (Some(excerpt), Some(client)) = (input.content_excerpt, &clients.audd) {
        if let Ok(Ok(content_match)) = timeout(EXTERNAL_STEP_TIMEOUT, client.recognize(excerpt.to_vec())).await {
            let metadata = content_match_to_canonical(content_match);
            return canonicalize_and_persist(
                pool,
                metadata,
                0.75,
                DetectionMethod::Audd,
                &hash,
                input.features,
                input.chromaprint_vector,
            )
            .await
            .map(Some);
        }
    }

    Ok(None)
}

fn content_match_to_canonical(content_match: ContentMatch) -> CanonicalMetadata {
    CanonicalMetadata {
        title: content_match.title,
        artist: content_match.artist,
        isrc: content_match.isrc,
        album: content_match.album,
        label: content_match.label,
        release_date: content_match.release_date,
    }
}

/// Step 7: canonicalize & persist. If an ISRC is present, reuse an existing
/// Track by ISRC (updating missing fields) rather than create a duplicate.
/// Otherwise fuzzy-match (title,artist) with both similarities >=0.8 against
/// the artist's existing tracks. Only creates a new artist/track/fingerprint
/// when nothing survives either lookup.
async fn canonicalize_and_persist(
    pool: &sqlx::SqlitePool,
    metadata: CanonicalMetadata,
    confidence: f32,
    method: DetectionMethod,
    hash: &str,
    features: &FeatureBundle,
    chromaprint_vector: Option<&[u32]>,
) -> Result<Resolution, ResolverError> {
    if let Some(isrc) = &metadata.isrc {
        if let Some(existing) = find_track_by_isrc(pool, isrc).await? {
            return Ok(Resolution {
                track_id: existing.id,
                confidence,
                method,
            });
        }
    }

    let artist_name = metadata.artist.clone().unwrap_or_else(|| "Unknown Artist".to_string());
    let title = metadata.title.clone().unwrap_or_else(|| "Unknown Title".to_string());
    let artist = find_or_create_artist(pool, &artist_name).await?;

    // Exact (title,artist) match is strictly inside the fuzzy tolerance below
    // and a lot cheaper than scanning+scoring every track the artist has.
    if let Some(existing) = find_track_by_title_and_artist(pool, &title, artist.id).await? {
        return Ok(Resolution {
            track_id: existing.id,
            confidence,
            method,
        });
    }

    let existing_tracks = list_tracks_by_artist(pool, artist.id).await?;
    let fuzzy_match = existing_tracks
        .into_iter()
        .find(|t| normalized_levenshtein(&t.title.to_lowercase(), &title.to_lowercase()) >= FUZZY_TITLE_ARTIST_THRESHOLD);

    if let Some(existing) = fuzzy_match {
        return Ok(Resolution {
            track_id: existing.id,
            confidence,
            method,
        });
    }

    let mut track = Track::new(title, artist.id);
    track.isrc = metadata.isrc;
    track.album = metadata.album;
    track.label = metadata.label;
    track.release_date = metadata.release_date;
    track.primary_fingerprint_hash = Some(hash.to_string());
    track.chromaprint_vector = chromaprint_vector.map(encode_u32_vec);
    insert_track(pool, &track).await?;

    insert_fingerprint(
        pool,
        &Fingerprint::new(track.id, hash.to_string(), Vec::new(), 0.0, FingerprintAlgorithm::Md5),
    )
    .await?;
    insert_fingerprint(
        pool,
        &Fingerprint::new(
            track.id,
            hash.to_string(),
            encode_feature_bundle(features),
            0.0,
            FingerprintAlgorithm::Feature,
        ),
    )
    .await?;
    if let Some(vector) = chromaprint_vector {
        insert_fingerprint(
            pool,
            &Fingerprint::new(
                track.id,
                encode_u32_vec(vector),
                u32_vec_to_bytes(vector),
                0.0,
                FingerprintAlgorithm::Chromaprint,
            ),
        )
        .await?;
    }

    Ok(Resolution {
        track_id: track.id,
        confidence,
        method,
    })
}

fn encode_u32_vec(vector: &[u32]) -> String {
    vector.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(",")
}

fn u32_vec_to_bytes(vector: &[u32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_u32_vec(bytes: &[u8]) -> Vec<u32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::init_schemas;

    fn sample_features() -> FeatureBundle {
        FeatureBundle {
            mfcc_mean: [1.0; 13],
            mfcc_variance: [0.1; 13],
            chroma_mean: [0.1; 12],
            spectral_centroid: 1200.0,
            spectral_rolloff: 4000.0,
            zero_crossing_rate: 0.05,
            rhythm_strength: 0.6,
            harmonic_ratio: 0.5,
            spectral_flux: 0.2,
            rms: 0.3,
        }
    }

    #[tokio::test]
    async fn fresh_identification_creates_artist_and_track() {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        init_schemas(&pool).await.unwrap();
        let clients = ResolverClients::default();
        let features = sample_features();

        let input = ResolutionInput {
            isrc_hint: None,
            features: &features,
            chromaprint_vector: None,
            chromaprint_base64: None,
            approx_duration_seconds: 180,
            icy_artist_title: None,
            content_excerpt: None,
        };

        let result = resolve(&pool, &clients, input).await.unwrap();
        assert!(result.is_none(), "no external clients configured, cascade exhausts to NoMatch");
    }

    #[tokio::test]
    async fn replaying_the_same_clip_reuses_local_exact() {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        init_schemas(&pool).await.unwrap();
        let clients = ResolverClients::default();
        let features = sample_features();
        let hash = hash_fingerprint(&features);

        let artist = crate::db::artists::Artist::new("Artist".into());
        crate::db::artists::insert_artist(&pool, &artist).await.unwrap();
        let mut track = Track::new("Song".into(), artist.id);
        track.primary_fingerprint_hash = Some(hash.clone());
        insert_track(&pool, &track).await.unwrap();
        insert_fingerprint(
            &pool,
            &Fingerprint::new(track.id, hash, Vec::new(), 0.0, FingerprintAlgorithm::Md5),
        )
        .await
        .unwrap();

        let input = ResolutionInput {
            isrc_hint: None,
            features: &features,
            chromaprint_vector: None,
            chromaprint_base64: None,
            approx_duration_seconds: 180,
            icy_artist_title: None,
            content_excerpt: None,
        };

        let result = resolve(&pool, &clients, input).await.unwrap().expect("local exact hit");
        assert_eq!(result.track_id, track.id);
        assert_eq!(result.method, DetectionMethod::LocalExact);
        assert_eq!(result.confidence, 1.0);
    }

    #[tokio::test]
    async fn isrc_shortcut_bypasses_fingerprint_steps() {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        init_schemas(&pool).await.unwrap();
        let clients = ResolverClients::default();

        let artist = crate::db::artists::Artist::new("Ali Farka Toure".into());
        crate::db::artists::insert_artist(&pool, &artist).await.unwrap();
        let mut track = Track::new("Bamba".into(), artist.id);
        track.isrc = Some("FRZ031400123".into());
        insert_track(&pool, &track).await.unwrap();

        let features = sample_features();
        let input = ResolutionInput {
            isrc_hint: Some("FRZ031400123"),
            features: &features,
            chromaprint_vector: None,
            chromaprint_base64: None,
            approx_duration_seconds: 180,
            icy_artist_title: None,
            content_excerpt: None,
        };

        let result = resolve(&pool, &clients, input).await.unwrap().expect("isrc hit");
        assert_eq!(result.track_id, track.id);
        assert_eq!(result.method, DetectionMethod::Isrc);
    }

    #[tokio::test]
    async fn near_miss_clip_resolves_via_feature_similarity() {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        init_schemas(&pool).await.unwrap();
        let clients = ResolverClients::default();

        let artist = crate::db::artists::Artist::new("Artist".into());
        crate::db::artists::insert_artist(&pool, &artist).await.unwrap();
        let stored_features = sample_features();
        let track = Track::new("Song".into(), artist.id);
        insert_track(&pool, &track).await.unwrap();
        insert_fingerprint(
            &pool,
            &Fingerprint::new(
                track.id,
                hash_fingerprint(&stored_features),
                encode_feature_bundle(&stored_features),
                0.0,
                FingerprintAlgorithm::Feature,
            ),
        )
        .await
        .unwrap();

        // Slightly different features: same hash bucket boundary missed (so
        // exact-match fails), but still a close match for the similarity scan.
        let mut live_features = stored_features.clone();
        live_features.mfcc_mean[0] += 5.0;

        let input = ResolutionInput {
            isrc_hint: None,
            features: &live_features,
            chromaprint_vector: None,
            chromaprint_base64: None,
            approx_duration_seconds: 180,
            icy_artist_title: None,
            content_excerpt: None,
        };

        let result = resolve(&pool, &clients, input).await.unwrap().expect("feature-similarity hit");
        assert_eq!(result.track_id, track.id);
        assert_eq!(result.method, DetectionMethod::LocalSimilarity);
    }

    #[test]
    fn u32_vec_round_trips_through_bytes() {
        let original = vec![1u32, 2, 3, u32::MAX];
        let bytes = u32_vec_to_bytes(&original);
        assert_eq!(decode_u32_vec(&bytes), original);
    }
}

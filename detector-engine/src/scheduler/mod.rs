//! StationScheduler: owns the bounded pool of per-station worker tasks that
//! drive the pipeline end to end (ingest → features → fingerprint → resolve
//! → track duration → record stats).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use detector_common::events::{DetectionEvent, EventBus};
use detector_common::config::EngineConfig;
use sqlx::SqlitePool;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::db::detections::insert_detection;
use crate::db::stations::{update_station_status, Station, StationStatus};
use crate::db::stats::finalize_and_record;
use crate::db::tracks::find_track_by_id;
use crate::error::EngineError;
use crate::features::{self, Classification};
use crate::fingerprint;
use crate::ingest::{self, IngestConfig, IngestError};
use crate::resolver::{self, ResolutionInput, ResolverClients};
use crate::tracker::{PlayDurationTracker, TrackerEffect, TrackerEvent};
use crate::utils::retry_on_lock;

const CHUNK_READ_TIMEOUT: Duration = Duration::from_secs(30);
const IDLE_SLEEP: Duration = Duration::from_millis(250);
const MAX_CONSECUTIVE_FATALS: u32 = 5;
const RESTART_BACKOFF: Duration = Duration::from_secs(5);
const GRACEFUL_STOP_TIMEOUT: Duration = Duration::from_secs(30);
const CONTENT_EXCERPT_SECONDS: u32 = 10;
/// Covers roughly 3 exponential-backoff attempts (10ms, 20ms, 40ms, ...)
/// against SQLite's single-writer lock before giving up.
const WRITE_LOCK_MAX_WAIT_MS: u64 = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Starting,
    Running,
    Degraded,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct StationHealth {
    pub state: WorkerState,
    pub last_chunk_at: Option<DateTime<Utc>>,
    pub consecutive_errors: u32,
}

impl Default for StationHealth {
    fn default() -> Self {
        Self {
            state: WorkerState::Starting,
            last_chunk_at: None,
            consecutive_errors: 0,
        }
    }
}

/// In-process health snapshot. Exposing this over HTTP is the out-of-scope
/// REST-API collaborator's job, not this engine's.
pub type SchedulerHealth = HashMap<Uuid, StationHealth>;

struct WorkerHandle {
    cancellation: CancellationToken,
    join: JoinHandle<()>,
}

pub struct StationScheduler {
    pool: SqlitePool,
    config: EngineConfig,
    event_bus: EventBus,
    clients: Arc<ResolverClients>,
    semaphore: Arc<Semaphore>,
    workers: Mutex<HashMap<Uuid, WorkerHandle>>,
    health: Arc<Mutex<SchedulerHealth>>,
}

impl StationScheduler {
    pub fn new(
        pool: SqlitePool,
        config: EngineConfig,
        event_bus: EventBus,
        clients: ResolverClients,
    ) -> Self {
        let max_concurrent = config.max_concurrent_stations;
        Self {
            pool,
            config,
            event_bus,
            clients: Arc::new(clients),
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            workers: Mutex::new(HashMap::new()),
            health: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn start(&self, stations: Vec<Station>) {
        let mut workers = self.workers.lock().await;
        for station in stations {
            if workers.contains_key(&station.id) {
                continue;
            }
            let cancellation = CancellationToken::new();
            let handle = self.spawn_worker(station, cancellation.clone());
            workers.insert(
                handle.0,
                WorkerHandle {
                    cancellation,
                    join: handle.1,
                },
            );
        }
    }

    fn spawn_worker(&self, station: Station, cancellation: CancellationToken) -> (Uuid, JoinHandle<()>) {
        let station_id = station.id;
        let pool = self.pool.clone();
        let config = self.config.clone();
        let event_bus = self.event_bus.clone();
        let clients = Arc::clone(&self.clients);
        let semaphore = Arc::clone(&self.semaphore);
        let health = Arc::clone(&self.health);

        let join = tokio::spawn(async move {
            run_station_worker(station, pool, config, event_bus, clients, semaphore, health, cancellation).await;
        });
        (station_id, join)
    }

    /// Cancel every worker, then wait up to 30s for graceful shutdown before
    /// abandoning the join (the worker's own cancellation handling finalizes
    /// any in-flight detection before it observes the token).
    pub async fn stop(&self) {
        let mut workers = self.workers.lock().await;
        for handle in workers.values() {
            handle.cancellation.cancel();
        }
        let handles: Vec<_> = workers.drain().map(|(_, h)| h.join).collect();
        drop(workers);

        let _ = tokio::time::timeout(GRACEFUL_STOP_TIMEOUT, futures::future::join_all(handles)).await;
    }

    pub async fn restart(&self, station: Station) {
        let mut workers = self.workers.lock().await;
        if let Some(handle) = workers.remove(&station.id) {
            handle.cancellation.cancel();
            let _ = tokio::time::timeout(GRACEFUL_STOP_TIMEOUT, handle.join).await;
        }
        let cancellation = CancellationToken::new();
        let (id, join) = self.spawn_worker(station, cancellation.clone());
        workers.insert(id, WorkerHandle { cancellation, join });
    }

    pub async fn health_report(&self) -> SchedulerHealth {
        self.health.lock().await.clone()
    }
}

async fn run_station_worker(
    station: Station,
    pool: SqlitePool,
    config: EngineConfig,
    event_bus: EventBus,
    clients: Arc<ResolverClients>,
    semaphore: Arc<Semaphore>,
    health: Arc<Mutex<SchedulerHealth>>,
    cancellation: CancellationToken,
) {
    let station_id = station.id;
    {
        let mut h = health.lock().await;
        h.insert(station_id, StationHealth::default());
    }

    let mut tracker = PlayDurationTracker::new(station_id, config.merge_window_secs);
    let mut consecutive_fatals: u32 = 0;

    'restart: loop {
        if cancellation.is_cancelled() {
            break;
        }

        let _permit = tokio::select! {
            permit = semaphore.acquire() => permit,
            _ = cancellation.cancelled() => break,
        };

        let ingest_config = IngestConfig {
            chunk_duration_seconds: config.chunk_duration_secs as u32,
            ..IngestConfig::default()
        };

        let mut session = match ingest::open(&station.stream_url, ingest_config).await {
            Ok(session) => session,
            Err(err) => {
                warn!(%station_id, error = %err, "station stream unreachable");
                mark_state(&health, station_id, WorkerState::Degraded).await;
                consecutive_fatals += 1;
                if consecutive_fatals >= MAX_CONSECUTIVE_FATALS {
                    degrade_station(&pool, &event_bus, station_id, "repeated ingest failures").await;
                    break;
                }
                tokio::time::sleep(RESTART_BACKOFF).await;
                continue 'restart;
            }
        };
        mark_state(&health, station_id, WorkerState::Running).await;

        loop {
            if cancellation.is_cancelled() {
                finalize_any_open_state(&pool, &event_bus, &mut tracker, station_id, Utc::now()).await;
                break 'restart;
            }

            let chunk = match session.next_chunk(CHUNK_READ_TIMEOUT).await {
                Ok(chunk) => {
                    consecutive_fatals = 0;
                    chunk
                }
                Err(err) => {
                    warn!(%station_id, error = %err, "chunk read failed");
                    if matches!(err, IngestError::StreamClosed) || session.consecutive_failures() >= 3 {
                        break;
                    }
                    continue;
                }
            };

            {
                let mut h = health.lock().await;
                if let Some(entry) = h.get_mut(&station_id) {
                    entry.last_chunk_at = Some(Utc::now());
                }
            }

            let now = Utc::now();
            let outcome = process_chunk(&pool, &clients, &mut tracker, station_id, &chunk, session.icy_metadata(), now).await;

            match outcome {
                Ok(effects) => {
                    for effect in effects {
                        apply_effect(&pool, &event_bus, station_id, effect).await;
                    }
                }
                Err(err) if err.is_recoverable() => {
                    error!(%station_id, error = %err, "pipeline error on chunk, continuing");
                    let mut h = health.lock().await;
                    if let Some(entry) = h.get_mut(&station_id) {
                        entry.consecutive_errors += 1;
                    }
                }
                Err(err) => {
                    error!(%station_id, error = %err, "fatal pipeline error, worker restarting");
                    consecutive_fatals += 1;
                    if consecutive_fatals >= MAX_CONSECUTIVE_FATALS {
                        degrade_station(&pool, &event_bus, station_id, "repeated fatal pipeline errors").await;
                        break 'restart;
                    }
                    tokio::time::sleep(RESTART_BACKOFF).await;
                    break;
                }
            }

            if tracker.exceeds_max_play(now) {
                info!(%station_id, "max-play cap reached, splitting session into a fresh detection");
                for effect in tracker.force_resplit(now) {
                    apply_effect(&pool, &event_bus, station_id, effect).await;
                }
            }

            tokio::time::sleep(IDLE_SLEEP).await;
        }

        session.close();
    }

    mark_state(&health, station_id, WorkerState::Stopped).await;
}

async fn process_chunk(
    pool: &SqlitePool,
    clients: &ResolverClients,
    tracker: &mut PlayDurationTracker,
    station_id: Uuid,
    chunk: &ingest::PcmChunk,
    icy: &ingest::IcyMetadata,
    now: DateTime<Utc>,
) -> Result<Vec<TrackerEffect>, EngineError> {
    let mono = downmix_to_mono_f32(&chunk.samples, chunk.channels);
    let normalized = features::normalize_peak(&mono);

    let Some(bundle) = features::extract(&normalized, chunk.sample_rate) else {
        return Ok(tracker.on_event(TrackerEvent::NoTrack, now));
    };

    let (classification, _confidence) = features::classify(&bundle);
    if classification != Classification::Music {
        return Ok(tracker.on_event(TrackerEvent::NoTrack, now));
    }

    let chromaprint_vector = fingerprint::chromaprint_vector(&normalized, chunk.sample_rate, chunk.channels);
    let chromaprint_base64 = fingerprint::chromaprint_base64(&normalized, chunk.sample_rate, chunk.channels);
    let excerpt = content_excerpt(&chunk.samples, chunk.sample_rate, chunk.channels);

    let icy_artist_title_owned = icy.structured_artist_title();
    let input = ResolutionInput {
        isrc_hint: None,
        features: &bundle,
        chromaprint_vector: chromaprint_vector.as_deref(),
        chromaprint_base64: chromaprint_base64.as_deref(),
        approx_duration_seconds: chunk.duration_seconds.round() as u32,
        icy_artist_title: icy_artist_title_owned.as_ref().map(|(a, t)| (a.as_str(), t.as_str())),
        content_excerpt: Some(excerpt.as_slice()),
    };

    let resolution = resolver::resolve(pool, clients, input).await?;

    match resolution {
        Some(result) => Ok(tracker.on_event(
            TrackerEvent::Match {
                track_id: result.track_id,
                confidence: result.confidence,
                method: result.method,
            },
            now,
        )),
        None => Ok(tracker.on_event(TrackerEvent::NoTrack, now)),
    }
}

async fn apply_effect(pool: &SqlitePool, event_bus: &EventBus, station_id: Uuid, effect: TrackerEffect) {
    match effect {
        TrackerEffect::Start(detection) => {
            let result = retry_on_lock("insert_detection", WRITE_LOCK_MAX_WAIT_MS, || {
                insert_detection(pool, &detection)
            })
            .await;
            if let Err(err) = result {
                error!(%station_id, error = %err, "failed to persist detection start");
                return;
            }
            event_bus.emit_lossy(DetectionEvent::DetectionStarted {
                station_id,
                track_id: detection.track_id,
                time: detection.detected_at,
            });
        }
        TrackerEffect::Finalize { detection_id, track_id, confidence, method, duration_seconds } => {
            let artist_id = match find_track_by_id(pool, track_id).await {
                Ok(Some(track)) => track.artist_id,
                _ => return,
            };
            let result = retry_on_lock("finalize_and_record", WRITE_LOCK_MAX_WAIT_MS, || {
                finalize_and_record(pool, detection_id, station_id, track_id, artist_id, duration_seconds, confidence)
            })
            .await;
            match result {
                Ok(applied) if applied => {
                    event_bus.emit_lossy(DetectionEvent::DetectionFinalized {
                        detection_id,
                        station_id,
                        track_id,
                        duration_seconds,
                        confidence,
                        method: method.as_str().to_string(),
                    });
                }
                Ok(_) => {}
                Err(err) => error!(%station_id, error = %err, "failed to finalize detection"),
            }
        }
    }
}

async fn finalize_any_open_state(
    pool: &SqlitePool,
    event_bus: &EventBus,
    tracker: &mut PlayDurationTracker,
    station_id: Uuid,
    now: DateTime<Utc>,
) {
    for effect in tracker.on_event(TrackerEvent::NoTrack, now) {
        apply_effect(pool, event_bus, station_id, effect).await;
    }
}

async fn mark_state(health: &Mutex<SchedulerHealth>, station_id: Uuid, state: WorkerState) {
    let mut h = health.lock().await;
    h.entry(station_id).or_default().state = state;
}

async fn degrade_station(pool: &SqlitePool, event_bus: &EventBus, station_id: Uuid, reason: &str) {
    let _ = update_station_status(pool, station_id, StationStatus::Degraded).await;
    event_bus.emit_lossy(DetectionEvent::StationDegraded {
        station_id,
        reason: reason.to_string(),
    });
}

/// Downmix interleaved i16 PCM to mono f32 in [-1, 1].
fn downmix_to_mono_f32(interleaved: &[i16], channels: u8) -> Vec<f32> {
    let channels = channels.max(1) as usize;
    interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().map(|&s| s as f32 / i16::MAX as f32).sum::<f32>() / channels as f32)
        .collect()
}

/// A bounded (<=10s) excerpt of the raw interleaved PCM, serialized as
/// little-endian 16-bit samples for the content-ID upload.
fn content_excerpt(interleaved: &[i16], sample_rate: u32, channels: u8) -> Vec<u8> {
    let max_samples = (sample_rate as usize) * (channels.max(1) as usize) * (CONTENT_EXCERPT_SECONDS as usize);
    let bounded = &interleaved[..interleaved.len().min(max_samples)];
    bounded.iter().flat_map(|s| s.to_le_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downmix_averages_channels() {
        let stereo = vec![i16::MAX, 0, 0, i16::MIN];
        let mono = downmix_to_mono_f32(&stereo, 2);
        assert_eq!(mono.len(), 2);
        assert!((mono[0] - 0.5).abs() < 0.01);
    }

    #[test]
    fn content_excerpt_is_bounded_to_configured_seconds() {
        let sample_rate = 44_100u32;
        let channels = 2u8;
        let samples = vec![0i16; (sample_rate as usize) * (channels as usize) * 20];
        let excerpt = content_excerpt(&samples, sample_rate, channels);
        let expected_bytes = (sample_rate as usize) * (channels as usize) * (CONTENT_EXCERPT_SECONDS as usize) * 2;
        assert_eq!(excerpt.len(), expected_bytes);
    }
}

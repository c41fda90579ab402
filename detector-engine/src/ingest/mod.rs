//! StreamIngestor: opens an Icecast/Shoutcast HTTP(S) stream, decodes and
//! resamples it to a configured rate, and hands out fixed-duration PCM
//! chunks.
//!
//! Decode/resample machinery adapted from the teacher's whole-file decoder
//! (`utils::audio_decoder`) and its deleted sibling fingerprinting service,
//! reshaped for a streaming `reqwest` body instead of a file on disk.

use std::time::Duration;

use reqwest::Client;
use rubato::{Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction};
use symphonia::core::audio::{AudioBufferRef, Signal};
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::conv::FromSample;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::{MediaSource, MediaSourceStream, ReadOnlySource};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::sample::Sample;
use thiserror::Error;

const DEFAULT_SAMPLE_RATE: u32 = 44_100;
const DEFAULT_CHANNELS: u8 = 2;
const DEFAULT_CHUNK_SECONDS: u32 = 10;
const RECONNECT_BACKOFF_START: Duration = Duration::from_secs(5);
const RECONNECT_BACKOFF_CAP: Duration = Duration::from_secs(60);
const MAX_CONSECUTIVE_FAILURES: u32 = 3;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("stream unreachable: {0}")]
    Unreachable(String),
    #[error("content-type {0:?} is not audio")]
    NotAudio(Option<String>),
    #[error("stream read timed out")]
    Timeout,
    #[error("stream closed by server")]
    StreamClosed,
    #[error("decode error: {0}")]
    DecodeError(String),
}

/// Icy-* headers, parsed opportunistically when present. Never authoritative
/// for track identity — only a hint the resolver's metadata probe may use.
#[derive(Debug, Clone, Default)]
pub struct IcyMetadata {
    pub station_name: Option<String>,
    pub genre: Option<String>,
    pub current_track: Option<String>,
}

impl IcyMetadata {
    fn from_headers(headers: &reqwest::header::HeaderMap) -> Self {
        let get = |name: &str| headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_string);
        Self {
            station_name: get("icy-name"),
            genre: get("icy-genre"),
            current_track: None,
        }
    }

    /// Splits "Artist - Title"-shaped ICY current-track text into
    /// (artist, title), if it's structured that way. Many stations instead
    /// send free text, a station slogan, or nothing.
    pub fn structured_artist_title(&self) -> Option<(String, String)> {
        let text = self.current_track.as_ref()?;
        let (artist, title) = text.split_once(" - ")?;
        let artist = artist.trim();
        let title = title.trim();
        if artist.is_empty() || title.is_empty() {
            return None;
        }
        Some((artist.to_string(), title.to_string()))
    }
}

/// One fixed-duration slice of resampled, interleaved 16-bit PCM.
#[derive(Debug, Clone)]
pub struct PcmChunk {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
    pub channels: u8,
    pub duration_seconds: f64,
}

pub struct IngestConfig {
    pub sample_rate: u32,
    pub channels: u8,
    pub chunk_duration_seconds: u32,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: DEFAULT_CHANNELS,
            chunk_duration_seconds: DEFAULT_CHUNK_SECONDS,
        }
    }
}

/// A connected stream, mid-decode. Holds the symphonia decoder and a buffer
/// of already-resampled samples awaiting chunking.
pub struct StreamSession {
    url: String,
    config: IngestConfig,
    icy: IcyMetadata,
    consecutive_failures: u32,
}

/// Validate the URL is reachable and audio, opening a session. Per the
/// cascade's cheap-first discipline this issues a HEAD probe first, falling
/// back to a ranged GET for servers (most Icecast mounts) that don't support
/// HEAD.
pub async fn open(url: &str, config: IngestConfig) -> Result<StreamSession, IngestError> {
    let client = Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .map_err(|e| IngestError::Unreachable(e.to_string()))?;

    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| IngestError::Unreachable(e.to_string()))?;

    if !response.status().is_success() {
        return Err(IngestError::Unreachable(format!("status {}", response.status())));
    }

    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    if !content_type.as_deref().unwrap_or("").starts_with("audio/") {
        return Err(IngestError::NotAudio(content_type));
    }

    let icy = IcyMetadata::from_headers(response.headers());

    Ok(StreamSession {
        url: url.to_string(),
        config,
        icy,
        consecutive_failures: 0,
    })
}

impl StreamSession {
    pub fn icy_metadata(&self) -> &IcyMetadata {
        &self.icy
    }

    /// Pull the next chunk, reconnecting with exponential backoff on
    /// transient failure. After `MAX_CONSECUTIVE_FAILURES` the caller should
    /// treat the station as degraded rather than retry indefinitely.
    pub async fn next_chunk(&mut self, timeout: Duration) -> Result<PcmChunk, IngestError> {
        match self.fetch_and_decode_one_chunk(timeout).await {
            Ok(chunk) => {
                self.consecutive_failures = 0;
                Ok(chunk)
            }
            Err(err) => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                    return Err(err);
                }
                let backoff = RECONNECT_BACKOFF_START
                    .saturating_mul(self.consecutive_failures)
                    .min(RECONNECT_BACKOFF_CAP);
                tokio::time::sleep(backoff).await;
                Err(err)
            }
        }
    }

    /// How many reconnect attempts have failed in a row. The scheduler
    /// surfaces this to degrade the station once it hits the cap.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    async fn fetch_and_decode_one_chunk(&mut self, timeout: Duration) -> Result<PcmChunk, IngestError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| IngestError::Unreachable(e.to_string()))?;

        let response = client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    IngestError::Timeout
                } else {
                    IngestError::Unreachable(e.to_string())
                }
            })?;

        let target_samples =
            (self.config.sample_rate as u64 * self.config.chunk_duration_seconds as u64) as usize;

        let bytes = response
            .bytes()
            .await
            .map_err(|_| IngestError::StreamClosed)?;
        if bytes.is_empty() {
            return Err(IngestError::StreamClosed);
        }

        let decoded = decode_chunk(bytes.to_vec(), self.config.channels)
            .map_err(|e| IngestError::DecodeError(e.to_string()))?;

        let resampled = resample(&decoded.samples, decoded.sample_rate, self.config.sample_rate)
            .map_err(|e| IngestError::DecodeError(e.to_string()))?;

        let truncated: Vec<f32> = resampled.into_iter().take(target_samples).collect();
        let interleaved = interleave_mono_to_channels(&truncated, self.config.channels);
        let pcm16 = convert_f32_to_i16(&interleaved);

        let duration_seconds = truncated.len() as f64 / self.config.sample_rate as f64;

        Ok(PcmChunk {
            samples: pcm16,
            sample_rate: self.config.sample_rate,
            channels: self.config.channels,
            duration_seconds,
        })
    }

    /// Idempotent: calling this more than once, or on a session that was
    /// never fully connected, is a no-op.
    pub fn close(self) {}
}

struct DecodedChunk {
    samples: Vec<f32>,
    sample_rate: u32,
}

fn decode_chunk(bytes: Vec<u8>, _channels: u8) -> Result<DecodedChunk, symphonia::core::errors::Error> {
    let source: Box<dyn MediaSource> = Box::new(ReadOnlySource::new(std::io::Cursor::new(bytes)));
    let mss = MediaSourceStream::new(source, Default::default());

    let probed = symphonia::default::get_probe().format(
        &Hint::new(),
        mss,
        &FormatOptions::default(),
        &MetadataOptions::default(),
    )?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or(symphonia::core::errors::Error::Unsupported("no audio track"))?
        .clone();

    let sample_rate = track.codec_params.sample_rate.unwrap_or(DEFAULT_SAMPLE_RATE as u32);
    let mut decoder = symphonia::default::get_codecs().make(&track.codec_params, &DecoderOptions::default())?;

    let mut samples = Vec::new();
    loop {
        let packet = match format.next_packet() {
            Ok(p) => p,
            Err(symphonia::core::errors::Error::IoError(e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break;
            }
            Err(e) => return Err(e),
        };
        if packet.track_id() != track.id {
            continue;
        }
        let decoded = decoder.decode(&packet)?;
        samples.extend(mono_samples(&decoded));
    }

    Ok(DecodedChunk { samples, sample_rate })
}

fn mono_samples(decoded: &AudioBufferRef) -> Vec<f32> {
    fn to_f32<S: Sample>(sample: S) -> f32
    where
        f32: FromSample<S>,
    {
        f32::from_sample(sample)
    }

    macro_rules! mix_down {
        ($buf:expr) => {{
            let channels = $buf.spec().channels.count();
            let frames = $buf.frames();
            let mut mono = Vec::with_capacity(frames);
            for frame in 0..frames {
                let mut sum = 0.0f32;
                for ch in 0..channels {
                    sum += to_f32($buf.chan(ch)[frame]);
                }
                mono.push(sum / channels as f32);
            }
            mono
        }};
    }

    match decoded {
        AudioBufferRef::U8(buf) => mix_down!(buf),
        AudioBufferRef::U16(buf) => mix_down!(buf),
        AudioBufferRef::U24(buf) => mix_down!(buf),
        AudioBufferRef::U32(buf) => mix_down!(buf),
        AudioBufferRef::S8(buf) => mix_down!(buf),
        AudioBufferRef::S16(buf) => mix_down!(buf),
        AudioBufferRef::S24(buf) => mix_down!(buf),
        AudioBufferRef::S32(buf) => mix_down!(buf),
        AudioBufferRef::F32(buf) => mix_down!(buf),
        AudioBufferRef::F64(buf) => mix_down!(buf),
    }
}

fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>, rubato::ResamplerConstructionError> {
    if from_rate == to_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };

    let mut resampler = SincFixedIn::<f32>::new(
        to_rate as f64 / from_rate as f64,
        2.0,
        params,
        samples.len(),
        1,
    )?;

    let input = vec![samples.to_vec()];
    let output = resampler.process(&input, None).unwrap_or_default();
    Ok(output.into_iter().next().unwrap_or_default())
}

fn interleave_mono_to_channels(samples: &[f32], channels: u8) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }
    let mut out = Vec::with_capacity(samples.len() * channels as usize);
    for &s in samples {
        for _ in 0..channels {
            out.push(s);
        }
    }
    out
}

fn convert_f32_to_i16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structured_icy_track_splits_artist_and_title() {
        let icy = IcyMetadata {
            current_track: Some("Ali Farka Toure - Bamba".to_string()),
            ..Default::default()
        };
        let (artist, title) = icy.structured_artist_title().expect("structured text");
        assert_eq!(artist, "Ali Farka Toure");
        assert_eq!(title, "Bamba");
    }

    #[test]
    fn unstructured_icy_track_yields_none() {
        let icy = IcyMetadata {
            current_track: Some("Live from the studio!".to_string()),
            ..Default::default()
        };
        assert!(icy.structured_artist_title().is_none());
    }

    #[test]
    fn missing_icy_track_yields_none() {
        let icy = IcyMetadata::default();
        assert!(icy.structured_artist_title().is_none());
    }

    #[test]
    fn interleave_duplicates_mono_across_channels() {
        let mono = vec![0.1, 0.2];
        let stereo = interleave_mono_to_channels(&mono, 2);
        assert_eq!(stereo, vec![0.1, 0.1, 0.2, 0.2]);
    }

    #[test]
    fn resample_is_a_no_op_at_matching_rate() {
        let samples = vec![0.1, 0.2, 0.3];
        let result = resample(&samples, 44100, 44100).unwrap();
        assert_eq!(result, samples);
    }

    #[tokio::test]
    async fn opening_a_non_audio_url_is_rejected() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .respond_with(
                wiremock::ResponseTemplate::new(200)
                    .set_body_string("<html></html>")
                    .insert_header("content-type", "text/html"),
            )
            .mount(&server)
            .await;

        let result = open(&server.uri(), IngestConfig::default()).await;
        assert!(matches!(result, Err(IngestError::NotAudio(_))));
    }

    #[tokio::test]
    async fn unreachable_host_is_rejected() {
        let result = open("http://127.0.0.1:1", IngestConfig::default()).await;
        assert!(matches!(result, Err(IngestError::Unreachable(_))));
    }
}

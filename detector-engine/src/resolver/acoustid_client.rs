//! AcoustID client: the cascade's acoustic probe (step 5).
//!
//! Adapted from the teacher's standalone AcoustID extractor — same API
//! shape and score-to-confidence mapping, now returning a plain
//! `AcousticMatch` instead of implementing a parallel-extraction trait,
//! since the cascade calls this as one sequential step, not a fan-out.

use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::circuit_breaker::CIRCUIT_BREAKERS;

const ACOUSTID_API_URL: &str = "https://api.acoustid.org/v2/lookup";
const PROVIDER_NAME: &str = "acoustid";

#[derive(Debug, Error)]
pub enum AcoustIdError {
    #[error("circuit breaker open for acoustid")]
    CircuitOpen,
    #[error("network error: {0}")]
    Network(String),
    #[error("api error: {0}")]
    Api(String),
    #[error("no match above the score threshold")]
    NoMatch,
}

#[derive(Debug, Clone)]
pub struct AcousticMatch {
    pub recording_mbid: String,
    pub isrc: Option<String>,
    pub score: f32,
}

type AcoustIdRateLimiter =
    governor::RateLimiter<governor::state::NotKeyed, governor::state::InMemoryState, governor::clock::DefaultClock>;

pub struct AcoustIdClient {
    http: Client,
    api_key: String,
    base_url: String,
    rate_limiter: AcoustIdRateLimiter,
}

impl AcoustIdClient {
    pub fn new(api_key: String) -> Self {
        // AcoustID rate limit: 3 requests/second.
        let quota = governor::Quota::per_second(std::num::NonZeroU32::new(3).unwrap());
        Self {
            http: Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .expect("reqwest client builder with only a timeout"),
            api_key,
            base_url: ACOUSTID_API_URL.to_string(),
            rate_limiter: governor::RateLimiter::direct(quota),
        }
    }

    #[cfg(test)]
    fn with_base_url(api_key: String, base_url: String) -> Self {
        let quota = governor::Quota::per_second(std::num::NonZeroU32::new(3).unwrap());
        Self {
            http: Client::new(),
            api_key,
            base_url,
            rate_limiter: governor::RateLimiter::direct(quota),
        }
    }

    /// Submit a Chromaprint fingerprint (already base64-compressed) and
    /// approximate duration. 4xx is treated as no-match (continue the
    /// cascade); 5xx/timeout records a circuit-breaker error and also
    /// continues, since the cascade never blocks on one provider.
    pub async fn lookup(
        &self,
        fingerprint_base64: &str,
        duration_seconds: u32,
    ) -> Result<AcousticMatch, AcoustIdError> {
        if !CIRCUIT_BREAKERS.allow(PROVIDER_NAME) {
            return Err(AcoustIdError::CircuitOpen);
        }
        self.rate_limiter.until_ready().await;
        // duration must be > 0 and stringified; AcoustID 400s otherwise.
        let duration_seconds = duration_seconds.max(1);

        let result = self
            .http
            .post(&self.base_url)
            .form(&[
                ("client", self.api_key.as_str()),
                ("duration", &duration_seconds.to_string()),
                ("fingerprint", fingerprint_base64),
                ("meta", "recordings+releases+tracks+compress"),
            ])
            .send()
            .await;

        let response = match result {
            Ok(r) => r,
            Err(e) => {
                CIRCUIT_BREAKERS.record_error(PROVIDER_NAME);
                return Err(AcoustIdError::Network(e.to_string()));
            }
        };

        let status = response.status();
        if status.is_client_error() {
            CIRCUIT_BREAKERS.record_success(PROVIDER_NAME);
            return Err(AcoustIdError::NoMatch);
        }
        if status.is_server_error() {
            CIRCUIT_BREAKERS.record_error(PROVIDER_NAME);
            return Err(AcoustIdError::Api(format!("server error {status}")));
        }

        let body: AcoustIdResponse = match response.json().await {
            Ok(b) => b,
            Err(e) => {
                CIRCUIT_BREAKERS.record_error(PROVIDER_NAME);
                return Err(AcoustIdError::Api(format!("malformed response: {e}")));
            }
        };

        if body.status != "ok" {
            CIRCUIT_BREAKERS.record_success(PROVIDER_NAME);
            return Err(AcoustIdError::NoMatch);
        }

        let best = body
            .results
            .into_iter()
            .filter(|r| r.score > 0.0)
            .max_by(|a, b| a.score.partial_cmp(&b.score).unwrap_or(std::cmp::Ordering::Equal));

        let Some(result) = best else {
            CIRCUIT_BREAKERS.record_success(PROVIDER_NAME);
            return Err(AcoustIdError::NoMatch);
        };

        let Some(recording) = result.recordings.as_ref().and_then(|r| r.first()) else {
            CIRCUIT_BREAKERS.record_success(PROVIDER_NAME);
            return Err(AcoustIdError::NoMatch);
        };

        CIRCUIT_BREAKERS.record_success(PROVIDER_NAME);
        debug!(mbid = %recording.id, score = result.score, "acoustid match");

        Ok(AcousticMatch {
            recording_mbid: recording.id.clone(),
            isrc: recording.isrcs.as_ref().and_then(|v| v.first().cloned()),
            score: result.score,
        })
    }
}

#[derive(Debug, Deserialize)]
struct AcoustIdResponse {
    status: String,
    #[serde(default)]
    results: Vec<AcoustIdResult>,
}

#[derive(Debug, Deserialize)]
struct AcoustIdResult {
    score: f32,
    recordings: Option<Vec<AcoustIdRecording>>,
}

#[derive(Debug, Deserialize)]
struct AcoustIdRecording {
    id: String,
    isrcs: Option<Vec<String>>,
}

/// AcoustID score (0.0-1.0) mapped to our confidence scale, per the cascade's
/// per-method threshold table.
pub fn score_to_confidence(score: f32) -> f32 {
    if score >= 0.9 {
        0.95
    } else if score >= 0.8 {
        0.90
    } else if score >= 0.7 {
        0.85
    } else {
        0.80
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn score_mapping_matches_thresholds() {
        assert_eq!(score_to_confidence(0.95), 0.95);
        assert_eq!(score_to_confidence(0.85), 0.90);
        assert_eq!(score_to_confidence(0.75), 0.85);
        assert_eq!(score_to_confidence(0.65), 0.80);
    }

    #[tokio::test]
    async fn server_error_records_circuit_breaker_error_not_nomatch() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = AcoustIdClient::with_base_url("test".to_string(), server.uri());
        let result = client.lookup("fp", 180).await;
        assert!(matches!(result, Err(AcoustIdError::Api(_))));
    }

    #[tokio::test]
    async fn client_error_is_treated_as_no_match() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400))
            .mount(&server)
            .await;

        let client = AcoustIdClient::with_base_url("test".to_string(), server.uri());
        let result = client.lookup("fp", 180).await;
        assert!(matches!(result, Err(AcoustIdError::NoMatch)));
    }

    #[tokio::test]
    async fn successful_match_returns_recording_mbid() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "ok",
                "results": [{
                    "score": 0.92,
                    "recordings": [{"id": "rec-mbid-1", "isrcs": ["FRZ031400123"]}]
                }]
            })))
            .mount(&server)
            .await;

        let client = AcoustIdClient::with_base_url("test".to_string(), server.uri());
        let result = client.lookup("fp", 180).await.unwrap();
        assert_eq!(result.recording_mbid, "rec-mbid-1");
        assert_eq!(result.isrc.as_deref(), Some("FRZ031400123"));
        assert_eq!(score_to_confidence(result.score), 0.95);
    }
}

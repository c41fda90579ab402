//! AudD client: the cascade's content probe (step 6), the last external
//! call before giving up and falling back to a fresh local track.

use std::time::Duration;

use reqwest::multipart;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::circuit_breaker::CIRCUIT_BREAKERS;

const AUDD_API_URL: &str = "https://api.audd.io/";
const PROVIDER_NAME: &str = "audd";
const MAX_EXCERPT_BYTES: usize = 25 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum AuddError {
    #[error("circuit breaker open for audd")]
    CircuitOpen,
    #[error("excerpt exceeds the 25MB upload limit")]
    ExcerptTooLarge,
    #[error("network error: {0}")]
    Network(String),
    #[error("api error: {0}")]
    Api(String),
    #[error("no match")]
    NoMatch,
}

#[derive(Debug, Clone, Default)]
pub struct ContentMatch {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub release_date: Option<String>,
    pub label: Option<String>,
    /// ISRC, resolved by checking the primary result then the nested
    /// provider blocks in order: AppleMusic, Spotify, Deezer.
    pub isrc: Option<String>,
}

pub struct AuddClient {
    http: Client,
    api_key: String,
    base_url: String,
}

impl AuddClient {
    pub fn new(api_key: String) -> Self {
        Self {
            http: Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .expect("reqwest client builder with only a timeout"),
            api_key,
            base_url: AUDD_API_URL.to_string(),
        }
    }

    #[cfg(test)]
    fn with_base_url(api_key: String, base_url: String) -> Self {
        Self {
            http: Client::new(),
            api_key,
            base_url,
        }
    }

    /// Submit a bounded audio excerpt (already truncated to <=10s by the
    /// caller) as a raw file upload.
    pub async fn recognize(&self, excerpt: Vec<u8>) -> Result<ContentMatch, AuddError> {
        if !CIRCUIT_BREAKERS.allow(PROVIDER_NAME) {
            return Err(AuddError::CircuitOpen);
        }
        if excerpt.len() > MAX_EXCERPT_BYTES {
            return Err(AuddError::ExcerptTooLarge);
        }

        let form = multipart::Form::new()
            .text("api_token", self.api_key.clone())
            .text("return", "apple_music,spotify,deezer")
            .part("file", multipart::Part::bytes(excerpt).file_name("excerpt.wav"));

        let result = self.http.post(&self.base_url).multipart(form).send().await;
        let response = match result {
            Ok(r) => r,
            Err(e) => {
                CIRCUIT_BREAKERS.record_error(PROVIDER_NAME);
                return Err(AuddError::Network(e.to_string()));
            }
        };

        if response.status().is_server_error() {
            CIRCUIT_BREAKERS.record_error(PROVIDER_NAME);
            return Err(AuddError::Api(format!("server error {}", response.status())));
        }

        let body: AuddResponse = match response.json().await {
            Ok(b) => b,
            Err(e) => {
                CIRCUIT_BREAKERS.record_error(PROVIDER_NAME);
                return Err(AuddError::Api(format!("malformed response: {e}")));
            }
        };

        CIRCUIT_BREAKERS.record_success(PROVIDER_NAME);

        if body.status != "success" {
            return Err(AuddError::NoMatch);
        }
        let Some(result) = body.result else {
            return Err(AuddError::NoMatch);
        };

        let isrc = result
            .isrc
            .clone()
            .or_else(|| isrc_from_provider_blocks(&result));

        Ok(ContentMatch {
            title: result.title,
            artist: result.artist,
            album: result.album,
            release_date: result.release_date,
            label: result.label,
            isrc,
        })
    }
}

#[derive(Debug, Deserialize)]
struct AuddResponse {
    status: String,
    result: Option<AuddResult>,
}

#[derive(Debug, Deserialize)]
struct AuddResult {
    title: Option<String>,
    artist: Option<String>,
    album: Option<String>,
    release_date: Option<String>,
    label: Option<String>,
    isrc: Option<String>,
    apple_music: Option<Value>,
    spotify: Option<Value>,
    deezer: Option<Value>,
}

/// Checks the nested provider blocks IN ORDER: AppleMusic, Spotify, Deezer.
fn isrc_from_provider_blocks(result: &AuddResult) -> Option<String> {
    for block in [&result.apple_music, &result.spotify, &result.deezer] {
        if let Some(value) = block {
            if let Some(isrc) = value.get("isrc").and_then(|v| v.as_str()) {
                return Some(isrc.to_string());
            }
        }
    }
    None
}

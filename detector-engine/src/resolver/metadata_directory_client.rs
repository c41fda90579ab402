//! Metadata directory client: the cascade's metadata probe (step 4), tried
//! only when the ICY hints parse as a structured "Artist - Title" pair.

use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;

use crate::circuit_breaker::CIRCUIT_BREAKERS;

const PROVIDER_NAME: &str = "metadata_directory";

#[derive(Debug, Error)]
pub enum MetadataDirectoryError {
    #[error("circuit breaker open for metadata_directory")]
    CircuitOpen,
    #[error("network error: {0}")]
    Network(String),
    #[error("api error: {0}")]
    Api(String),
    #[error("no match")]
    NoMatch,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetadataCandidate {
    pub title: String,
    pub artist: String,
    pub isrc: Option<String>,
    pub score: f32,
}

pub struct MetadataDirectoryClient {
    http: Client,
    base_url: String,
}

impl MetadataDirectoryClient {
    pub fn new(base_url: String) -> Self {
        Self {
            http: Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .expect("reqwest client builder with only a timeout"),
            base_url,
        }
    }

    /// GET `?artist=..&recording=..`, returning candidates ordered by score.
    /// The cascade only accepts the top candidate, and only above 0.7
    /// confidence.
    pub async fn lookup(&self, artist: &str, title: &str) -> Result<MetadataCandidate, MetadataDirectoryError> {
        if !CIRCUIT_BREAKERS.allow(PROVIDER_NAME) {
            return Err(MetadataDirectoryError::CircuitOpen);
        }

        let result = self
            .http
            .get(&self.base_url)
            .query(&[("artist", artist), ("recording", title)])
            .send()
            .await;

        let response = match result {
            Ok(r) => r,
            Err(e) => {
                CIRCUIT_BREAKERS.record_error(PROVIDER_NAME);
                return Err(MetadataDirectoryError::Network(e.to_string()));
            }
        };

        if response.status().is_server_error() {
            CIRCUIT_BREAKERS.record_error(PROVIDER_NAME);
            return Err(MetadataDirectoryError::Api(format!("server error {}", response.status())));
        }
        if response.status().is_client_error() {
            CIRCUIT_BREAKERS.record_success(PROVIDER_NAME);
            return Err(MetadataDirectoryError::NoMatch);
        }

        let candidates: Vec<MetadataCandidate> = match response.json().await {
            Ok(c) => c,
            Err(e) => {
                CIRCUIT_BREAKERS.record_error(PROVIDER_NAME);
                return Err(MetadataDirectoryError::Api(format!("malformed response: {e}")));
            }
        };

        CIRCUIT_BREAKERS.record_success(PROVIDER_NAME);

        candidates
            .into_iter()
            .max_by(|a, b| a.score.partial_cmp(&b.score).unwrap_or(std::cmp::Ordering::Equal))
            .filter(|c| c.score >= 0.7)
            .ok_or(MetadataDirectoryError::NoMatch)
    }
}

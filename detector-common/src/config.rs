//! Engine configuration: environment variables with a TOML overlay and an
//! OS-dependent default config path, the same tiered-resolution shape used
//! elsewhere in this codebase (env beats file, file beats compiled default).

use crate::{Error, Result};
use serde::Deserialize;
use std::path::PathBuf;

/// Confidence thresholds, one per identification method, since the methods
/// disagree on what "confident enough" means (local matches are exact or
/// near-exact; acoustic/content lookups are probabilistic).
#[derive(Debug, Clone, Copy)]
pub struct ConfidenceThresholds {
    pub local: f32,
    pub content_id: f32,
    pub acoustic_id: f32,
}

impl Default for ConfidenceThresholds {
    fn default() -> Self {
        Self {
            local: 0.7,
            content_id: 0.6,
            acoustic_id: 0.8,
        }
    }
}

/// Top-level engine configuration, resolved once at startup.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub database_url: String,
    pub acoustid_api_key: Option<String>,
    pub audd_api_key: Option<String>,
    pub detection_interval_secs: u64,
    pub confidence: ConfidenceThresholds,
    pub max_concurrent_stations: usize,
    pub merge_window_secs: u64,
    pub chunk_duration_secs: u64,
    pub metadata_directory_url: Option<String>,
}

impl EngineConfig {
    /// Resolve configuration from environment variables, falling back to an
    /// optional TOML overlay file and then to the defaults below.
    ///
    /// `DATABASE_URL` is the only field with no compiled-in default: an
    /// engine with nowhere to persist detections cannot usefully start, so
    /// its absence is a `PermanentConfig`-class error and callers should
    /// refuse to boot rather than fall back to an in-memory database.
    pub fn resolve(toml_overlay: Option<&TomlOverlay>) -> Result<Self> {
        let database_url = std::env::var("DATABASE_URL")
            .ok()
            .or_else(|| toml_overlay.and_then(|t| t.database_url.clone()))
            .ok_or_else(|| {
                Error::Config(
                    "DATABASE_URL not set (env var or config file); the engine has nowhere to persist detections".into(),
                )
            })?;

        let acoustid_api_key = std::env::var("ACOUSTID_API_KEY")
            .ok()
            .or_else(|| toml_overlay.and_then(|t| t.acoustid_api_key.clone()))
            .filter(|k| !k.trim().is_empty());

        let audd_api_key = std::env::var("AUDD_API_KEY")
            .ok()
            .or_else(|| toml_overlay.and_then(|t| t.audd_api_key.clone()))
            .filter(|k| !k.trim().is_empty());

        if acoustid_api_key.is_none() && audd_api_key.is_none() {
            return Err(Error::Config(
                "neither ACOUSTID_API_KEY nor AUDD_API_KEY is configured; the resolver cascade's acoustic and content probes would never run".into(),
            ));
        }

        let detection_interval_secs = env_or_overlay_u64("DETECTION_INTERVAL", toml_overlay.and_then(|t| t.detection_interval), 60);
        let max_concurrent_stations = env_or_overlay_u64("MAX_CONCURRENT_STATIONS", toml_overlay.and_then(|t| t.max_concurrent_stations.map(|v| v as u64)), 5) as usize;
        let merge_window_secs = env_or_overlay_u64("MERGE_WINDOW_SECONDS", toml_overlay.and_then(|t| t.merge_window_seconds), 15);
        let chunk_duration_secs = env_or_overlay_u64("CHUNK_DURATION_SECONDS", toml_overlay.and_then(|t| t.chunk_duration_seconds), 10);

        let local = env_or_overlay_f32("MIN_CONFIDENCE_THRESHOLD", toml_overlay.and_then(|t| t.min_confidence_threshold), 0.7);

        let metadata_directory_url = std::env::var("METADATA_DIRECTORY_URL")
            .ok()
            .or_else(|| toml_overlay.and_then(|t| t.metadata_directory_url.clone()))
            .filter(|u| !u.trim().is_empty());

        Ok(Self {
            database_url,
            acoustid_api_key,
            audd_api_key,
            detection_interval_secs,
            confidence: ConfidenceThresholds {
                local,
                ..ConfidenceThresholds::default()
            },
            max_concurrent_stations,
            merge_window_secs,
            chunk_duration_secs,
            metadata_directory_url,
        })
    }
}

fn env_or_overlay_u64(var: &str, overlay: Option<u64>, default: u64) -> u64 {
    std::env::var(var)
        .ok()
        .and_then(|v| v.parse().ok())
        .or(overlay)
        .unwrap_or(default)
}

fn env_or_overlay_f32(var: &str, overlay: Option<f32>, default: f32) -> f32 {
    std::env::var(var)
        .ok()
        .and_then(|v| v.parse().ok())
        .or(overlay)
        .unwrap_or(default)
}

/// Optional TOML overlay, read from the OS-dependent config path when
/// present. Every field is optional; env vars always take priority.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TomlOverlay {
    pub database_url: Option<String>,
    pub acoustid_api_key: Option<String>,
    pub audd_api_key: Option<String>,
    pub detection_interval: Option<u64>,
    pub min_confidence_threshold: Option<f32>,
    pub max_concurrent_stations: Option<u32>,
    pub merge_window_seconds: Option<u64>,
    pub chunk_duration_seconds: Option<u64>,
    pub metadata_directory_url: Option<String>,
}

/// Read the TOML overlay from the given path, or from the OS-dependent
/// default config path if `path` is `None`. Returns `Ok(None)` rather than
/// an error when no file is present — the overlay is optional.
pub fn load_toml_overlay(path: Option<&PathBuf>) -> Result<Option<TomlOverlay>> {
    let resolved = match path {
        Some(p) => p.clone(),
        None => default_config_path(),
    };

    if !resolved.exists() {
        return Ok(None);
    }

    let content = std::fs::read_to_string(&resolved)?;
    let overlay: TomlOverlay = toml::from_str(&content)
        .map_err(|e| Error::Config(format!("failed to parse {}: {e}", resolved.display())))?;
    Ok(Some(overlay))
}

/// `~/.config/detector-engine/config.toml` on Linux/macOS,
/// `%APPDATA%\detector-engine\config.toml` on Windows.
fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .map(|d| d.join("detector-engine").join("config.toml"))
        .unwrap_or_else(|| PathBuf::from("./detector-engine.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for var in [
            "DATABASE_URL",
            "ACOUSTID_API_KEY",
            "AUDD_API_KEY",
            "DETECTION_INTERVAL",
            "MIN_CONFIDENCE_THRESHOLD",
            "MAX_CONCURRENT_STATIONS",
            "MERGE_WINDOW_SECONDS",
            "CHUNK_DURATION_SECONDS",
            "METADATA_DIRECTORY_URL",
        ] {
            std::env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn missing_database_url_is_an_error() {
        clear_env();
        std::env::set_var("ACOUSTID_API_KEY", "key");
        let result = EngineConfig::resolve(None);
        assert!(result.is_err());
        clear_env();
    }

    #[test]
    #[serial]
    fn missing_both_api_keys_is_an_error() {
        clear_env();
        std::env::set_var("DATABASE_URL", "sqlite://test.db");
        let result = EngineConfig::resolve(None);
        assert!(result.is_err());
        clear_env();
    }

    #[test]
    #[serial]
    fn defaults_apply_when_only_mandatory_fields_set() {
        clear_env();
        std::env::set_var("DATABASE_URL", "sqlite://test.db");
        std::env::set_var("ACOUSTID_API_KEY", "key");
        let config = EngineConfig::resolve(None).unwrap();
        assert_eq!(config.detection_interval_secs, 60);
        assert_eq!(config.max_concurrent_stations, 5);
        assert_eq!(config.merge_window_secs, 15);
        assert_eq!(config.chunk_duration_secs, 10);
        assert_eq!(config.confidence.local, 0.7);
        assert_eq!(config.confidence.content_id, 0.6);
        assert_eq!(config.confidence.acoustic_id, 0.8);
        clear_env();
    }

    #[test]
    #[serial]
    fn env_vars_override_defaults() {
        clear_env();
        std::env::set_var("DATABASE_URL", "sqlite://test.db");
        std::env::set_var("AUDD_API_KEY", "key");
        std::env::set_var("MERGE_WINDOW_SECONDS", "30");
        let config = EngineConfig::resolve(None).unwrap();
        assert_eq!(config.merge_window_secs, 30);
        clear_env();
    }
}

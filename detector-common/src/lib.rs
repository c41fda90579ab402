//! Shared infrastructure for the detection engine and, in principle, its
//! out-of-scope HTTP/report collaborators:
//! - Error types
//! - Engine configuration (env + optional TOML overlay)
//! - Declarative database schema sync
//! - Detection event types and the broadcast bus
//! - Human-readable time formatting

pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod human_time;

pub use error::{Error, Result};
pub use events::{DetectionEvent, EventBus};

//! FFI bindings for external libraries used by the detection engine:
//! - **chromaprint**: audio fingerprinting, used to identify tracks that
//!   have no exact metadata match.

pub mod chromaprint;

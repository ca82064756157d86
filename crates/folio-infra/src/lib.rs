//! Folio Infrastructure Library
//!
//! Shared plumbing for Folio binaries: tracing subscriber setup and the JSON
//! error body returned by HTTP endpoints.

pub mod error;
pub mod telemetry;

pub use error::ErrorResponse;
pub use telemetry::{init_telemetry, LogFormat};

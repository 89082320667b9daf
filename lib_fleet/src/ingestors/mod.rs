//! # Data Ingestors Module
//!
//! Transports that feed raw telemetry frames into a session.
//!
//! ## Contained Modules:
//! - **`telemetry_wss`**: The WebSocket client for the fleet telemetry stream.
//!   It implements the session's `Transport` seam and performs no decoding of
//!   its own.

#![forbid(unsafe_code)]

/// The WebSocket transport for the telemetry stream.
pub mod telemetry_wss;

// --- Public API Re-exports ---
pub use telemetry_wss::WsTransport;

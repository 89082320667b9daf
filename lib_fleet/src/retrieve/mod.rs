//! # Data Retrieval Module
//!
//! HTTP access to the fleet's three backends.
//!
//! ## Contained Modules:
//!
//! - **`ky_http`**: A generic `ApiClient` built on `reqwest` and
//!   `reqwest-middleware` with exponential-backoff retries. It attaches the
//!   session credential and sender to every call and refuses guarded paths
//!   when no credential is present.
//! - **`fleet_api`**: `FleetClient`, the `FleetApi` implementation the
//!   session controller talks to.

#![forbid(unsafe_code)]

/// Generic HTTP API client with retry middleware and an authorization guard.
pub mod ky_http;
/// The fleet endpoints used by a telemetry session.
pub mod fleet_api;

// --- Public API Re-exports ---
pub use crate::core::session::SessionContext;
pub use fleet_api::FleetClient;
pub use ky_http::{ApiClient, ApiResponse, RequestError, ServerTarget, ServerTargets};

//! # Core Engine Module
//!
//! The stateful half of the fleet synchronizer. The `telemetry` module says
//! *what* changed; this module owns the collection and decides *when* it
//! changes.
//!
//! ## Core Components:
//!
//! - **`reconcile`**: The `ReconciliationEngine`, sole owner of the `Fleet`.
//!   Every mutation passes through one reducer and is published to readers
//!   over a `tokio::sync::watch` channel.
//!
//! - **`session`**: The `SessionController`. It drives one connection's
//!   lifecycle (handshake, source registration, frame handling, scheduled
//!   completion-time refreshes, the hard-refresh timer) and reports how the
//!   session ended so the caller can rebuild it.

#![forbid(unsafe_code)]

/// Fleet reducer and change publisher.
pub mod reconcile;
/// Connection lifecycle and timer ownership.
pub mod session;

// --- Public API Re-exports ---
pub use reconcile::{FleetAction, ReconciliationEngine};
pub use session::{
    FleetApi, ReloadReason, SessionContext, SessionController, SessionExit, SessionSettings, SessionState,
    Transport, TransportError,
};

//! # lib_fleet
//!
//! Telemetry synchronization core for a fleet of shop-floor machines. Each
//! folder is a feature-gated module, mirroring how the rest of the workspace
//! keeps optional I/O stacks out of lean builds.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

/// Pure telemetry handling: data model, wire decoding, field mapping, status classification.
#[cfg(feature = "telemetry")]
pub mod telemetry;

/// Reconciliation engine and session controller.
#[cfg(feature = "core")]
pub mod core;

/// HTTP request collaborator and the fleet API built on it.
#[cfg(feature = "retrieve")]
pub mod retrieve;

/// Transport implementations feeding the session controller.
#[cfg(feature = "ingestors")]
pub mod ingestors;

//! # Telemetry Module
//!
//! Everything that turns raw telemetry into fleet state without touching I/O.
//!
//! ## Contained Modules:
//! - **`model`**: `MachineRecord`, identities, execution/mode enums, patches and
//!   the immutable-per-update `Fleet` collection.
//! - **`dto`**: serde shapes of the server payloads (current list, machine
//!   status events, completion-time rows) with lenient number/bool parsing.
//! - **`decoder`**: splits an inbound frame into a pipe-delimited field update
//!   or a structured JSON event.
//! - **`mapper`**: pure functions from decoded frames to patches, full
//!   replacement lists, and scheduled intents.
//! - **`status`**: the (label, color) classifier for a machine's flag set.

/// Fleet data model.
pub mod model;
/// Server payload shapes.
pub mod dto;
/// Wire decoder for binary and text frames.
pub mod decoder;
/// Field mapper producing patches and intents.
pub mod mapper;
/// Status classifier.
pub mod status;

// --- Public API Re-exports ---
pub use decoder::{decode, DecodeError, DecodedFrame, EventFrame, FieldFrame, FieldKind, Frame, ResponseKind};
pub use mapper::{MapOutcome, MappedUpdate, ScheduledIntent, SessionSignal};
pub use model::{ExecutionState, Fleet, MachineId, MachinePatch, MachineRecord, OperatingMode, PatchFields};
pub use status::{classify, color_only, PresentationPair, StatusColor, StatusLabel};

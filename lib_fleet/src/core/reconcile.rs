//! # Reconciliation Engine
//!
//! The `ReconciliationEngine` owns the authoritative `Fleet` for one session.
//! Nothing else mutates it.
//!
//! ## Core Design Principles:
//!
//! 1.  **Single Reducer**: Every change enters through `apply(FleetAction)`.
//!     The session loop is the only caller, so mutations never interleave and
//!     each one is computed against the then-current collection.
//!
//! 2.  **Immutable Snapshots**: A mutation builds a new `Fleet` (sharing the
//!     untouched records) and swaps it in. Readers holding an older `Fleet`
//!     keep a consistent view.
//!
//! 3.  **Change Publication**: The current `Fleet` is published on a
//!     `tokio::sync::watch` channel. A mutation that produces an identical
//!     collection is not republished, so watchers only wake on real changes.

use tokio::sync::watch;

use crate::telemetry::model::{Fleet, MachineId, MachinePatch, MachineRecord, PatchFields};

/// A single mutation of the fleet.
#[derive(Debug, Clone, PartialEq)]
pub enum FleetAction {
    /// Replace the whole collection, keeping the given order.
    ReplaceAll(Vec<MachineRecord>),
    /// Merge the present fields into the matching record.
    Patch(MachinePatch),
    /// Raise the unread-message flag of the matching record.
    MarkMessageReceived(MachineId),
}

/// # Reconciliation Engine
///
/// Holds the current `Fleet`, the session's tearing-down flag and the
/// publisher readers subscribe to.
pub struct ReconciliationEngine {
    fleet: Fleet,
    tearing_down: bool,
    publisher: watch::Sender<Fleet>,
}

impl Default for ReconciliationEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ReconciliationEngine {
    pub fn new() -> Self {
        let (publisher, _) = watch::channel(Fleet::default());
        Self::with_publisher(publisher)
    }

    /// Starts empty on an existing channel. Nothing is published until the
    /// first change.
    pub fn with_publisher(publisher: watch::Sender<Fleet>) -> Self {
        Self {
            fleet: Fleet::default(),
            tearing_down: false,
            publisher,
        }
    }

    /// # Apply
    ///
    /// The reducer. Returns `true` when the collection changed.
    ///
    /// ## Logic:
    /// 1.  Computes the next `Fleet` from the current one and the action.
    /// 2.  If the result equals the current collection, stops here.
    /// 3.  Otherwise stores it and publishes it to every subscriber.
    pub fn apply(&mut self, action: FleetAction) -> bool {
        let next = match action {
            FleetAction::ReplaceAll(records) => Some(Fleet::from_records(records)),
            FleetAction::Patch(patch) => self.patched(&patch.id, &patch.fields),
            FleetAction::MarkMessageReceived(id) => {
                let fields = PatchFields {
                    has_unread_message: Some(true),
                    ..Default::default()
                };
                self.patched(&id, &fields)
            }
        };

        match next {
            Some(next) if next != self.fleet => {
                self.fleet = next;
                self.publisher.send_replace(self.fleet.clone());
                true
            }
            _ => false,
        }
    }

    fn patched(&self, id: &MachineId, fields: &PatchFields) -> Option<Fleet> {
        let Some(position) = self.fleet.position(id) else {
            log::debug!("No machine {} in the fleet; patch dropped.", id);
            return None;
        };
        let current = self.fleet.get(position)?;
        Some(self.fleet.with_record_at(position, current.patched(fields)))
    }

    pub fn replace_all(&mut self, records: Vec<MachineRecord>) -> bool {
        self.apply(FleetAction::ReplaceAll(records))
    }

    pub fn apply_patch(&mut self, patch: MachinePatch) -> bool {
        self.apply(FleetAction::Patch(patch))
    }

    pub fn mark_message_received(&mut self, id: MachineId) -> bool {
        self.apply(FleetAction::MarkMessageReceived(id))
    }

    /// The current collection. Cheap to clone.
    pub fn fleet(&self) -> &Fleet {
        &self.fleet
    }

    /// A receiver that always holds the latest published `Fleet`.
    pub fn subscribe(&self) -> watch::Receiver<Fleet> {
        self.publisher.subscribe()
    }

    pub fn active_count(&self) -> usize {
        self.fleet.active_count()
    }

    pub fn set_tearing_down(&mut self, tearing_down: bool) {
        self.tearing_down = tearing_down;
    }

    pub fn is_tearing_down(&self) -> bool {
        self.tearing_down
    }
}

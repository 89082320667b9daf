//! # Field Mapper
//!
//! Pure translation from decoded frames to fleet updates. Nothing here touches
//! the collection or the clock; side effects the session must carry out later
//! are returned as `ScheduledIntent`s next to the update.

use std::time::Duration;

use serde_json::Value;

use crate::telemetry::decoder::{DecodedFrame, EventFrame, FieldFrame, FieldKind, ResponseKind};
use crate::telemetry::dto::{parse_timestamp, CurrentListEntry, MachineStatus};
use crate::telemetry::model::{
    ExecutionState, Fleet, MachineId, MachinePatch, MachineRecord, OperatingMode, PatchFields,
};

/// Positional contracts of the delimited frames (0-indexed, field 1 is the kind).
pub mod positions {
    pub mod notification {
        pub const CATEGORY: usize = 3;
        pub const MACHINE: usize = 4;
        pub const TEXT: usize = 5;
    }

    pub mod part_count {
        pub const PROGRAM: usize = 3;
        pub const PROGRESS: usize = 5;
        pub const PRODUCED: usize = 6;
        pub const MACHINE: usize = 13;
    }

    pub mod message {
        pub const MACHINE: usize = 6;
    }
}

/// Progress indicator above which the server recomputes the completion time.
pub const COMPLETION_REFRESH_THRESHOLD: f64 = 5.0;

const NOTICE_PART_COUNT: &str = "PART_COUNT";
const NOTICE_PALETTE: &str = "PALETTE";

/// Follow-up work the session controller must schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduledIntent {
    RefreshCompletionTime(MachineId),
}

/// Events addressed to the session rather than the collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionSignal {
    Connected,
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MappedUpdate {
    Patch(MachinePatch),
    Replace(Vec<MachineRecord>),
    MarkMessage(MachineId),
    SessionEvent(SessionSignal),
    Nothing,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MapOutcome {
    pub update: MappedUpdate,
    pub intents: Vec<ScheduledIntent>,
}

impl MapOutcome {
    pub fn nothing() -> Self {
        Self::from(MappedUpdate::Nothing)
    }
}

impl From<MappedUpdate> for MapOutcome {
    fn from(update: MappedUpdate) -> Self {
        Self {
            update,
            intents: Vec::new(),
        }
    }
}

/// Dispatches a decoded frame to its mapping.
pub fn map_frame(decoded: &DecodedFrame, fleet: &Fleet) -> MapOutcome {
    match decoded {
        DecodedFrame::Fields(frame) => map_field_frame(frame, fleet),
        DecodedFrame::Event(event) => map_event(event, fleet),
    }
}

pub fn map_field_frame(frame: &FieldFrame, fleet: &Fleet) -> MapOutcome {
    match &frame.kind {
        FieldKind::Notification => map_notification(frame, fleet),
        FieldKind::PartCount => map_part_count(frame, fleet),
        // Alarm frames take the message path.
        FieldKind::Message | FieldKind::Alarm => map_message(frame, fleet),
        FieldKind::Other(kind) => {
            log::debug!("Ignoring delimited frame of kind {}", kind);
            MapOutcome::nothing()
        }
    }
}

pub fn map_event(event: &EventFrame, fleet: &Fleet) -> MapOutcome {
    match &event.kind {
        ResponseKind::MachineStatus => map_machine_status(&event.data, fleet),
        ResponseKind::Broadcast => {
            log::debug!("Broadcast event received; nothing to reconcile.");
            MapOutcome::nothing()
        }
        ResponseKind::Connect => MappedUpdate::SessionEvent(SessionSignal::Connected).into(),
        ResponseKind::Closed => MappedUpdate::SessionEvent(SessionSignal::Closed).into(),
        ResponseKind::Other(kind) => {
            log::debug!("Ignoring structured event {}", kind);
            MapOutcome::nothing()
        }
    }
}

fn non_empty(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn map_notification(frame: &FieldFrame, fleet: &Fleet) -> MapOutcome {
    use positions::notification::*;

    let Some(target) = fleet.find_raw(frame.field(MACHINE)) else {
        log::debug!("Notification for unknown machine {:?}", frame.field(MACHINE));
        return MapOutcome::nothing();
    };

    let mut fields = PatchFields::default();
    match frame.field(CATEGORY).trim() {
        NOTICE_PART_COUNT => fields.has_pending_part_count_event = Some(true),
        NOTICE_PALETTE => fields.has_pending_palette_change = Some(true),
        _ => fields.has_unread_alarm = Some(true),
    }
    if let Some(text) = non_empty(frame.field(TEXT)) {
        fields.last_notice = Some(Some(text));
    }

    MappedUpdate::Patch(MachinePatch::new(target.id.clone(), fields)).into()
}

fn map_part_count(frame: &FieldFrame, fleet: &Fleet) -> MapOutcome {
    use positions::part_count::*;

    let Some(target) = fleet.find_raw(frame.field(MACHINE)) else {
        log::debug!("Part count for unknown machine {:?}", frame.field(MACHINE));
        return MapOutcome::nothing();
    };

    let mut fields = PatchFields::default();
    match frame.field(PRODUCED).trim().parse::<u64>() {
        Ok(count) if count >= target.produced_count => fields.produced_count = Some(count),
        Ok(count) => log::debug!(
            "Stale part count {} < {} for machine {}; keeping current.",
            count,
            target.produced_count,
            target.id
        ),
        Err(_) => log::debug!("Unparsable part count {:?}", frame.field(PRODUCED)),
    }
    if let Some(program) = non_empty(frame.field(PROGRAM)) {
        fields.program_name = Some(program);
    }

    let mut outcome = if fields.is_empty() {
        MapOutcome::nothing()
    } else {
        MappedUpdate::Patch(MachinePatch::new(target.id.clone(), fields)).into()
    };

    let progress = frame.field(PROGRESS).trim().parse::<f64>().unwrap_or(0.0);
    if progress > COMPLETION_REFRESH_THRESHOLD && target.planned_completion_time.is_some() {
        outcome
            .intents
            .push(ScheduledIntent::RefreshCompletionTime(target.id.clone()));
    }

    outcome
}

fn map_message(frame: &FieldFrame, fleet: &Fleet) -> MapOutcome {
    let raw = frame.field(positions::message::MACHINE);
    match fleet.find_raw(raw) {
        Some(target) => MappedUpdate::MarkMessage(target.id.clone()).into(),
        None => {
            log::debug!("Message for unknown machine {:?}", raw);
            MapOutcome::nothing()
        }
    }
}

fn map_machine_status(data: &Value, fleet: &Fleet) -> MapOutcome {
    let Some(items) = data.as_array() else {
        log::warn!("Machine status event without an array payload; ignoring.");
        return MapOutcome::nothing();
    };

    let mut records = Vec::with_capacity(items.len());
    for item in items {
        let status: MachineStatus = match serde_json::from_value(item.clone()) {
            Ok(status) => status,
            Err(e) => {
                log::warn!("Dropping undecodable machine status {}: {}", item, e);
                continue;
            }
        };
        match fleet.find_raw(&status.id) {
            Some(existing) => records.push(merge_status(existing, &status)),
            None => log::debug!("Machine status for unknown machine {}; dropped.", status.id),
        }
    }

    sort_by_display_number(&mut records);
    MappedUpdate::Replace(records).into()
}

/// Merges the fields a status object carries over an existing record.
pub fn merge_status(existing: &MachineRecord, status: &MachineStatus) -> MachineRecord {
    let fields = PatchFields {
        execution_state: status.execution.as_deref().map(ExecutionState::from),
        operating_mode: status.mode.as_deref().map(OperatingMode::from),
        is_paused: status.pause,
        program_name: status.program.clone(),
        produced_count: status.part_count,
        planned_count: status.plan_count,
        cycle_remaining: status.period.map(Duration::from_millis),
        wait_duration: status.wait.map(Duration::from_millis),
        has_unread_message: status.is_receive_message,
        has_unread_alarm: status.is_receive_alarm,
        has_pending_part_count_event: status.is_receive_part_count,
        has_pending_palette_change: status.is_change_palette,
        ..Default::default()
    };
    existing.patched(&fields)
}

/// Stable ascending sort by numeric display number; non-numeric keys go last.
pub fn sort_by_display_number(records: &mut [MachineRecord]) {
    records.sort_by_key(|r| match r.display_order() {
        Some(order) => (0u8, order),
        None => (1u8, 0),
    });
}

pub fn record_from_entry(entry: CurrentListEntry) -> MachineRecord {
    let planned_completion_time = entry.planned_completion_time.as_deref().and_then(parse_timestamp);
    MachineRecord {
        id: MachineId::new(entry.id),
        display_number: entry.display_number,
        name: entry.name,
        program_name: entry.program_name,
        planned_completion_time,
        cycle_remaining: Duration::from_millis(entry.period),
        wait_duration: Duration::from_millis(entry.wait),
        produced_count: entry.produced_count,
        planned_count: entry.planned_count,
        execution_state: ExecutionState::from(entry.execution.as_str()),
        operating_mode: OperatingMode::from(entry.mode.as_str()),
        is_paused: entry.pause,
        has_unread_message: entry.has_unread_message,
        has_unread_alarm: entry.has_unread_alarm,
        has_pending_part_count_event: entry.has_pending_part_count_event,
        has_pending_palette_change: entry.has_pending_palette_change,
        last_notice: None,
    }
}

/// Maps the initial snapshot, keeping server order.
pub fn map_current_list(entries: Vec<CurrentListEntry>) -> Vec<MachineRecord> {
    entries.into_iter().map(record_from_entry).collect()
}

//! # Wire Scenario Tests
//!
//! Drives raw frames through decode, map and the reconciliation engine the
//! way a live session does, without any timers or I/O.

#![forbid(unsafe_code)]

use lib_fleet::core::ReconciliationEngine;
use lib_fleet::telemetry::mapper::map_frame;
use lib_fleet::telemetry::{
    decode, ExecutionState, Frame, MachineId, MachineRecord, MappedUpdate, OperatingMode, ScheduledIntent,
};

/// Applies one frame the same way the session controller does and returns
/// the intents the mapper produced.
fn feed(engine: &mut ReconciliationEngine, frame: Frame) -> Vec<ScheduledIntent> {
    let decoded = decode(&frame).expect("frame should decode");
    let outcome = map_frame(&decoded, engine.fleet());
    match outcome.update {
        MappedUpdate::Patch(patch) => {
            engine.apply_patch(patch);
        }
        MappedUpdate::Replace(records) => {
            engine.replace_all(records);
        }
        MappedUpdate::MarkMessage(id) => {
            engine.mark_message_received(id);
        }
        MappedUpdate::SessionEvent(_) | MappedUpdate::Nothing => {}
    }
    outcome.intents
}

fn running(id: &str, display_number: &str) -> MachineRecord {
    let mut record = MachineRecord::new(id, display_number);
    record.execution_state = ExecutionState::Running;
    record
}

#[test]
fn machine_event_reorders_by_display_number_and_updates_modes() {
    let mut engine = ReconciliationEngine::new();
    engine.replace_all(vec![running("1", "3"), running("2", "1"), running("3", "2")]);

    let event = serde_json::json!({
        "response": "machine",
        "data": [
            { "Id": 1, "Mode": "EDIT" },
            { "Id": 2, "Mode": "MANUAL" },
            { "Id": 3, "Mode": "MDI" }
        ]
    });
    feed(&mut engine, Frame::Text(event.to_string()));

    let ids: Vec<&str> = engine.fleet().iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["2", "3", "1"]);
    let modes: Vec<OperatingMode> = engine.fleet().iter().map(|r| r.operating_mode.clone()).collect();
    assert_eq!(
        modes,
        vec![OperatingMode::Manual, OperatingMode::ManualDataInput, OperatingMode::Edit]
    );
}

#[test]
fn part_count_over_threshold_patches_and_asks_for_refresh() {
    let mut engine = ReconciliationEngine::new();
    let mut five = running("5", "1");
    five.planned_completion_time = chrono::NaiveDate::from_ymd_opt(2024, 5, 1).and_then(|d| d.and_hms_opt(18, 0, 0));
    engine.replace_all(vec![five]);

    let intents = feed(
        &mut engine,
        Frame::Binary(b"edge-1|PART_COUNT|20240501|O7788|-|6|42|-|-|-|-|-|-|5".to_vec()),
    );

    assert_eq!(engine.fleet().get(0).map(|r| r.produced_count), Some(42));
    assert_eq!(intents, vec![ScheduledIntent::RefreshCompletionTime(MachineId::from("5"))]);
}

#[test]
fn notification_for_unknown_machine_leaves_fleet_alone() {
    let mut engine = ReconciliationEngine::new();
    engine.replace_all(vec![running("1", "1"), running("2", "2")]);
    let before = engine.fleet().clone();
    let mut watcher = engine.subscribe();

    let intents = feed(
        &mut engine,
        Frame::Binary(b"edge-1|NOTI|20240501|ALARM|404|Door open".to_vec()),
    );

    assert!(intents.is_empty());
    assert_eq!(engine.fleet(), &before);
    assert!(!watcher.has_changed().unwrap());
}

#[test]
fn display_numbers_sort_numerically_not_lexically() {
    let mut engine = ReconciliationEngine::new();
    engine.replace_all(vec![running("1", "10"), running("2", "9"), running("3", "100")]);

    let event = serde_json::json!({
        "response": "machine",
        "data": [ { "Id": "1" }, { "Id": "2" }, { "Id": "3" } ]
    });
    feed(&mut engine, Frame::Text(event.to_string()));

    let numbers: Vec<&str> = engine.fleet().iter().map(|r| r.display_number.as_str()).collect();
    assert_eq!(numbers, vec!["9", "10", "100"]);
}

#[test]
fn padded_identities_match_across_encodings() {
    let mut engine = ReconciliationEngine::new();
    engine.replace_all(vec![running("7", "1")]);

    feed(&mut engine, Frame::Binary(b"edge-1|MESSAGE|t|-|-|-|007".to_vec()));
    assert!(engine.fleet().get(0).is_some_and(|r| r.has_unread_message));

    feed(&mut engine, Frame::Binary(b"edge-1|NOTI|t|PALETTE|0007|".to_vec()));
    assert!(engine.fleet().get(0).is_some_and(|r| r.has_pending_palette_change));
}

#[test]
fn repeated_frames_are_idempotent() {
    let mut engine = ReconciliationEngine::new();
    engine.replace_all(vec![running("1", "1"), running("2", "2")]);
    let frame = Frame::Binary(b"edge-1|PART_COUNT|t|O1|-|1|3|-|-|-|-|-|-|2".to_vec());

    feed(&mut engine, frame.clone());
    let once = engine.fleet().clone();
    feed(&mut engine, frame);
    assert_eq!(engine.fleet(), &once);
    assert_eq!(engine.fleet().get(0), once.get(0));
}

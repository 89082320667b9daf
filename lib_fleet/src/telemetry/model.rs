//! # Fleet Data Model
//!
//! One `MachineRecord` per machine, sparse `MachinePatch`es produced by the
//! mapper, and the `Fleet` collection the reconciliation engine owns.
//!
//! `Fleet` is immutable per update: every mutation builds a new outer `Arc`
//! while sharing untouched records, so a snapshot handed to a reader never
//! changes underneath it.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDateTime;

/// Coerces a raw identity to its numeric value. Whitespace is ignored. Decimal
/// text counts when it is integral (`"7.0"` is 7); empty, fractional or
/// non-numeric text has no numeric value and therefore never matches.
pub fn numeric_identity(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    if let Ok(value) = raw.parse::<i64>() {
        return Some(value);
    }
    let value = raw.parse::<f64>().ok()?;
    let in_range = value >= i64::MIN as f64 && value < i64::MAX as f64;
    (value.is_finite() && value.fract() == 0.0 && in_range).then_some(value as i64)
}

/// Stable machine identity, kept as received on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct MachineId(String);

impl MachineId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Numeric value used for matching, if the identity has one.
    pub fn numeric(&self) -> Option<i64> {
        numeric_identity(&self.0)
    }

    /// Numeric-value equality: `"007"` matches `"7"`.
    pub fn matches(&self, other: &MachineId) -> bool {
        match (self.numeric(), other.numeric()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MachineId {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl From<String> for MachineId {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

/// Controller execution state as reported by the edge.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum ExecutionState {
    #[default]
    Off,
    Running,
    Idle,
    Stopped,
    Interrupted,
    Other(String),
}

impl ExecutionState {
    pub fn as_str(&self) -> &str {
        match self {
            ExecutionState::Off => "OFF",
            ExecutionState::Running => "RUNNING",
            ExecutionState::Idle => "IDLE",
            ExecutionState::Stopped => "STOPPED",
            ExecutionState::Interrupted => "INTERRUPTED",
            ExecutionState::Other(raw) => raw,
        }
    }
}

impl From<&str> for ExecutionState {
    fn from(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "OFF" | "" => ExecutionState::Off,
            "RUNNING" | "ACTIVE" => ExecutionState::Running,
            "IDLE" | "READY" => ExecutionState::Idle,
            "STOPPED" => ExecutionState::Stopped,
            "INTERRUPTED" | "FEED_HOLD" => ExecutionState::Interrupted,
            _ => ExecutionState::Other(raw.trim().to_string()),
        }
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Controller operating mode.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OperatingMode {
    Automatic,
    Manual,
    ManualDataInput,
    Edit,
    Other(String),
}

impl Default for OperatingMode {
    fn default() -> Self {
        OperatingMode::Other(String::new())
    }
}

impl OperatingMode {
    pub fn as_str(&self) -> &str {
        match self {
            OperatingMode::Automatic => "AUTOMATIC",
            OperatingMode::Manual => "MANUAL",
            OperatingMode::ManualDataInput => "MANUAL_DATA_INPUT",
            OperatingMode::Edit => "EDIT",
            OperatingMode::Other(raw) => raw,
        }
    }
}

impl From<&str> for OperatingMode {
    fn from(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "AUTOMATIC" | "AUTO" => OperatingMode::Automatic,
            "MANUAL" => OperatingMode::Manual,
            "MANUAL_DATA_INPUT" | "MDI" => OperatingMode::ManualDataInput,
            "EDIT" => OperatingMode::Edit,
            _ => OperatingMode::Other(raw.trim().to_string()),
        }
    }
}

impl fmt::Display for OperatingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of fleet state.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MachineRecord {
    pub id: MachineId,
    /// Ordering key shown in the number column; compared numerically.
    pub display_number: String,
    pub name: String,
    pub program_name: String,
    pub planned_completion_time: Option<NaiveDateTime>,
    pub cycle_remaining: Duration,
    pub wait_duration: Duration,
    pub produced_count: u64,
    pub planned_count: u64,
    pub execution_state: ExecutionState,
    pub operating_mode: OperatingMode,
    pub is_paused: bool,
    pub has_unread_message: bool,
    pub has_unread_alarm: bool,
    pub has_pending_part_count_event: bool,
    pub has_pending_palette_change: bool,
    /// Text carried by the most recent notification, if any.
    pub last_notice: Option<String>,
}

impl MachineRecord {
    pub fn new(id: impl Into<MachineId>, display_number: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_number: display_number.into(),
            ..Default::default()
        }
    }

    /// Numeric display order; `None` sorts after every numeric key.
    pub fn display_order(&self) -> Option<i64> {
        numeric_identity(&self.display_number)
    }

    /// Completion time, hidden while the machine is off.
    pub fn effective_completion_time(&self) -> Option<NaiveDateTime> {
        if self.execution_state == ExecutionState::Off {
            None
        } else {
            self.planned_completion_time
        }
    }

    /// Whole-percent progress towards the planned count; `None` when no plan was entered.
    pub fn progress_percent(&self) -> Option<u64> {
        if self.planned_count == 0 {
            return None;
        }
        Some(self.produced_count.saturating_mul(100) / self.planned_count)
    }

    pub fn plan_met(&self) -> bool {
        self.produced_count >= self.planned_count
    }

    /// Real cycle time shown on the board: remaining cycle plus wait.
    pub fn cycle_time(&self) -> Duration {
        self.cycle_remaining + self.wait_duration
    }

    /// Returns a copy with every field present in `fields` overwritten.
    pub fn patched(&self, fields: &PatchFields) -> MachineRecord {
        let mut next = self.clone();
        fields.apply_to(&mut next);
        next
    }
}

/// Formats a duration as `HH:MM`.
pub fn format_hhmm(duration: Duration) -> String {
    let secs = duration.as_secs();
    format!("{:02}:{:02}", secs / 3600, (secs % 3600) / 60)
}

/// Sparse set of field overwrites. `None` means "leave untouched".
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PatchFields {
    pub display_number: Option<String>,
    pub name: Option<String>,
    pub program_name: Option<String>,
    /// `Some(None)` clears the completion time.
    pub planned_completion_time: Option<Option<NaiveDateTime>>,
    pub cycle_remaining: Option<Duration>,
    pub wait_duration: Option<Duration>,
    pub produced_count: Option<u64>,
    pub planned_count: Option<u64>,
    pub execution_state: Option<ExecutionState>,
    pub operating_mode: Option<OperatingMode>,
    pub is_paused: Option<bool>,
    pub has_unread_message: Option<bool>,
    pub has_unread_alarm: Option<bool>,
    pub has_pending_part_count_event: Option<bool>,
    pub has_pending_palette_change: Option<bool>,
    pub last_notice: Option<Option<String>>,
}

macro_rules! overwrite_present {
    ($src:expr, $dst:expr; $($field:ident),+ $(,)?) => {
        $(
            if let Some(value) = &$src.$field {
                $dst.$field = value.clone();
            }
        )+
    };
}

impl PatchFields {
    pub fn is_empty(&self) -> bool {
        *self == PatchFields::default()
    }

    pub fn apply_to(&self, record: &mut MachineRecord) {
        overwrite_present!(self, record;
            display_number,
            name,
            program_name,
            planned_completion_time,
            cycle_remaining,
            wait_duration,
            produced_count,
            planned_count,
            execution_state,
            operating_mode,
            is_paused,
            has_unread_message,
            has_unread_alarm,
            has_pending_part_count_event,
            has_pending_palette_change,
            last_notice,
        );
    }
}

/// A patch aimed at one machine.
#[derive(Debug, Clone, PartialEq)]
pub struct MachinePatch {
    pub id: MachineId,
    pub fields: PatchFields,
}

impl MachinePatch {
    pub fn new(id: MachineId, fields: PatchFields) -> Self {
        Self { id, fields }
    }

    pub fn completion_time(id: MachineId, at: NaiveDateTime) -> Self {
        Self::new(
            id,
            PatchFields {
                planned_completion_time: Some(Some(at)),
                ..Default::default()
            },
        )
    }
}

/// Ordered fleet collection with an identity index.
#[derive(Debug, Clone, Default)]
pub struct Fleet {
    records: Arc<Vec<Arc<MachineRecord>>>,
    index: Arc<HashMap<i64, usize>>,
}

impl Fleet {
    /// Builds a collection in the given order. Later records repeating an
    /// identity already present are dropped.
    pub fn from_records(records: Vec<MachineRecord>) -> Self {
        let mut kept = Vec::with_capacity(records.len());
        let mut index = HashMap::with_capacity(records.len());

        for record in records {
            if let Some(key) = record.id.numeric() {
                if index.contains_key(&key) {
                    log::warn!("Duplicate machine identity {} in replacement list; keeping the first.", record.id);
                    continue;
                }
                index.insert(key, kept.len());
            }
            kept.push(Arc::new(record));
        }

        Self {
            records: Arc::new(kept),
            index: Arc::new(index),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MachineRecord> {
        self.records.iter().map(|r| r.as_ref())
    }

    pub fn records(&self) -> &[Arc<MachineRecord>] {
        &self.records
    }

    pub fn get(&self, position: usize) -> Option<&MachineRecord> {
        self.records.get(position).map(|r| r.as_ref())
    }

    pub fn position(&self, id: &MachineId) -> Option<usize> {
        id.numeric().and_then(|key| self.index.get(&key).copied())
    }

    pub fn find(&self, id: &MachineId) -> Option<&MachineRecord> {
        self.position(id).and_then(|pos| self.get(pos))
    }

    /// Looks up a raw identity taken straight from a wire field.
    pub fn find_raw(&self, raw: &str) -> Option<&MachineRecord> {
        numeric_identity(raw)
            .and_then(|key| self.index.get(&key).copied())
            .and_then(|pos| self.get(pos))
    }

    /// Rows `[page * size, page * size + size)`, clamped to the collection.
    pub fn page(&self, page: usize, size: usize) -> &[Arc<MachineRecord>] {
        let start = page.saturating_mul(size).min(self.records.len());
        let end = start.saturating_add(size).min(self.records.len());
        &self.records[start..end]
    }

    /// New collection with the record at `position` replaced; index shared.
    pub(crate) fn with_record_at(&self, position: usize, record: MachineRecord) -> Self {
        let mut records: Vec<Arc<MachineRecord>> = self.records.as_ref().clone();
        records[position] = Arc::new(record);
        Self {
            records: Arc::new(records),
            index: Arc::clone(&self.index),
        }
    }
}

impl PartialEq for Fleet {
    fn eq(&self, other: &Self) -> bool {
        self.records == other.records
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, no: &str) -> MachineRecord {
        MachineRecord::new(id, no)
    }

    #[test]
    fn identity_matching_is_numeric() {
        assert!(MachineId::from("007").matches(&MachineId::from("7")));
        assert!(MachineId::from(" 12 ").matches(&MachineId::from("12")));
        assert!(!MachineId::from("abc").matches(&MachineId::from("abc")));
        assert!(!MachineId::from("").matches(&MachineId::from("0")));
    }

    #[test]
    fn integral_decimal_identities_match() {
        assert_eq!(numeric_identity("7.0"), Some(7));
        assert_eq!(numeric_identity("+7"), Some(7));
        assert_eq!(numeric_identity("7.5"), None);
        assert_eq!(numeric_identity("NaN"), None);
        assert_eq!(numeric_identity("inf"), None);

        let fleet = Fleet::from_records(vec![record("7", "1")]);
        assert_eq!(fleet.find_raw("7.0").map(|r| r.id.as_str()), Some("7"));
        assert!(fleet.find_raw("7.25").is_none());
    }

    #[test]
    fn fleet_finds_by_numeric_identity() {
        let fleet = Fleet::from_records(vec![record("7", "1"), record("12", "2")]);
        assert_eq!(fleet.position(&MachineId::from("007")), Some(0));
        assert_eq!(fleet.find_raw("12").map(|r| r.display_number.as_str()), Some("2"));
        assert!(fleet.find_raw("x12").is_none());
    }

    #[test]
    fn duplicate_identities_keep_first() {
        let mut second = record("07", "9");
        second.name = "dup".to_string();
        let fleet = Fleet::from_records(vec![record("7", "1"), second, record("8", "2")]);
        assert_eq!(fleet.len(), 2);
        assert_eq!(fleet.get(0).map(|r| r.display_number.as_str()), Some("1"));
        assert_eq!(fleet.position(&MachineId::from("8")), Some(1));
    }

    #[test]
    fn patch_overwrites_only_present_fields() {
        let mut base = record("1", "1");
        base.program_name = "O1000".to_string();
        base.produced_count = 3;

        let fields = PatchFields {
            produced_count: Some(4),
            has_unread_alarm: Some(true),
            ..Default::default()
        };
        let next = base.patched(&fields);

        assert_eq!(next.produced_count, 4);
        assert!(next.has_unread_alarm);
        assert_eq!(next.program_name, "O1000");
        assert_eq!(next.patched(&fields), next);
    }

    #[test]
    fn page_is_clamped() {
        let fleet = Fleet::from_records((1..=15).map(|i| record(&i.to_string(), &i.to_string())).collect());
        assert_eq!(fleet.page(0, 13).len(), 13);
        assert_eq!(fleet.page(1, 13).len(), 2);
        assert!(fleet.page(5, 13).is_empty());
    }

    #[test]
    fn presentation_helpers() {
        let mut r = record("1", "1");
        r.produced_count = 7;
        r.planned_count = 9;
        assert_eq!(r.progress_percent(), Some(77));
        assert!(!r.plan_met());

        r.planned_count = 0;
        assert_eq!(r.progress_percent(), None);

        r.cycle_remaining = Duration::from_secs(3 * 3600 + 120);
        r.wait_duration = Duration::from_secs(60);
        assert_eq!(format_hhmm(r.cycle_time()), "03:03");
    }

    #[test]
    fn completion_time_hidden_when_off() {
        let mut r = record("1", "1");
        let at = chrono::NaiveDate::from_ymd_opt(2024, 5, 1)
            .and_then(|d| d.and_hms_opt(12, 0, 0))
            .unwrap();
        r.planned_completion_time = Some(at);
        assert_eq!(r.effective_completion_time(), None);
        r.execution_state = ExecutionState::Running;
        assert_eq!(r.effective_completion_time(), Some(at));
    }

    #[test]
    fn enums_parse_from_wire_text() {
        assert_eq!(ExecutionState::from("active"), ExecutionState::Running);
        assert_eq!(ExecutionState::from("OFF"), ExecutionState::Off);
        assert_eq!(OperatingMode::from("MDI"), OperatingMode::ManualDataInput);
        assert_eq!(OperatingMode::from("jog"), OperatingMode::Other("jog".to_string()));
    }
}

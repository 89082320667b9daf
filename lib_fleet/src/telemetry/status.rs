//! # Status Classifier
//!
//! Collapses a machine's flag set into the label and color shown on the
//! board. Precedence is fixed and the first matching rule wins:
//! off, unread message, paused, pending check, then operating mode.

use std::fmt;

use crate::telemetry::model::{ExecutionState, Fleet, MachineRecord, OperatingMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusLabel {
    Off,
    Message,
    Pause,
    Check,
    Auto,
    Manual,
    Mdi,
    Edit,
    Standby,
}

impl StatusLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusLabel::Off => "OFF",
            StatusLabel::Message => "MESSAGE",
            StatusLabel::Pause => "PAUSE",
            StatusLabel::Check => "CHECK",
            StatusLabel::Auto => "AUTO",
            StatusLabel::Manual => "MANUAL",
            StatusLabel::Mdi => "MDI",
            StatusLabel::Edit => "EDIT",
            StatusLabel::Standby => "STANDBY",
        }
    }
}

impl fmt::Display for StatusLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusColor {
    Disabled,
    Red,
    Orange,
    Yellow,
    Green,
    Blue,
    Purple,
    Teal,
    Neutral,
}

impl StatusColor {
    pub fn as_hex(&self) -> &'static str {
        match self {
            StatusColor::Disabled => "#5c5c5c",
            StatusColor::Red => "#e53935",
            StatusColor::Orange => "#fb8c00",
            StatusColor::Yellow => "#fdd835",
            StatusColor::Green => "#43a047",
            StatusColor::Blue => "#1e88e5",
            StatusColor::Purple => "#8e24aa",
            StatusColor::Teal => "#00897b",
            StatusColor::Neutral => "#9e9e9e",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresentationPair {
    pub label: StatusLabel,
    pub color: StatusColor,
}

impl PresentationPair {
    const fn new(label: StatusLabel, color: StatusColor) -> Self {
        Self { label, color }
    }
}

fn by_mode(mode: &OperatingMode) -> PresentationPair {
    match mode {
        OperatingMode::Automatic => PresentationPair::new(StatusLabel::Auto, StatusColor::Green),
        OperatingMode::Manual => PresentationPair::new(StatusLabel::Manual, StatusColor::Blue),
        OperatingMode::ManualDataInput => PresentationPair::new(StatusLabel::Mdi, StatusColor::Purple),
        OperatingMode::Edit => PresentationPair::new(StatusLabel::Edit, StatusColor::Teal),
        OperatingMode::Other(_) => PresentationPair::new(StatusLabel::Standby, StatusColor::Neutral),
    }
}

/// Full classification, including the pending-check rule.
pub fn classify(
    execution: &ExecutionState,
    mode: &OperatingMode,
    is_paused: bool,
    has_unread_message: bool,
    has_pending_part_count_event: bool,
    has_pending_palette_change: bool,
) -> PresentationPair {
    if *execution == ExecutionState::Off {
        PresentationPair::new(StatusLabel::Off, StatusColor::Disabled)
    } else if has_unread_message {
        PresentationPair::new(StatusLabel::Message, StatusColor::Red)
    } else if is_paused {
        PresentationPair::new(StatusLabel::Pause, StatusColor::Orange)
    } else if has_pending_palette_change || has_pending_part_count_event {
        PresentationPair::new(StatusLabel::Check, StatusColor::Yellow)
    } else {
        by_mode(mode)
    }
}

/// Color of a row. Pending checks do not tint it.
pub fn color_only(
    execution: &ExecutionState,
    mode: &OperatingMode,
    is_paused: bool,
    has_unread_message: bool,
) -> StatusColor {
    classify(execution, mode, is_paused, has_unread_message, false, false).color
}

impl MachineRecord {
    /// Board label from the full classifier, color from `color_only`.
    pub fn presentation(&self) -> PresentationPair {
        let label = classify(
            &self.execution_state,
            &self.operating_mode,
            self.is_paused,
            self.has_unread_message,
            self.has_pending_part_count_event,
            self.has_pending_palette_change,
        )
        .label;
        let color = color_only(
            &self.execution_state,
            &self.operating_mode,
            self.is_paused,
            self.has_unread_message,
        );
        PresentationPair { label, color }
    }

    pub fn is_active(&self) -> bool {
        self.presentation().label != StatusLabel::Off
    }
}

impl Fleet {
    /// Machines whose label is anything but OFF.
    pub fn active_count(&self) -> usize {
        self.iter().filter(|r| r.is_active()).count()
    }
}

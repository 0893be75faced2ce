//! Motion controller state model.
//!
//! [`MotionState`] is driven exclusively by parsed status frames from the
//! firmware; it is never set optimistically from a command acknowledgment.
//! [`ControllerSnapshot`] is the immutable view published by the background
//! status monitor; readers clone the snapshot and never mutate shared state.

use crate::position::Position4D;
use serde::{Deserialize, Serialize};

/// High-level motion controller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MotionState {
    Disconnected,
    Idle,
    Moving,
    Homing,
    Hold,
    Alarm,
    Error,
    EmergencyStop,
}

impl MotionState {
    /// True for states in which new motion commands are not accepted.
    pub fn blocks_motion(&self) -> bool {
        matches!(
            self,
            MotionState::Disconnected
                | MotionState::Alarm
                | MotionState::Error
                | MotionState::EmergencyStop
        )
    }
}

impl std::fmt::Display for MotionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            MotionState::Disconnected => "disconnected",
            MotionState::Idle => "idle",
            MotionState::Moving => "moving",
            MotionState::Homing => "homing",
            MotionState::Hold => "hold",
            MotionState::Alarm => "alarm",
            MotionState::Error => "error",
            MotionState::EmergencyStop => "emergency_stop",
        };
        f.write_str(label)
    }
}

/// Which coordinate source a parsed position came from.
///
/// The firmware reports machine (`MPos`) and/or work (`WPos`) coordinates.
/// When both are present the scanner uses work coordinates for X, Y and C but
/// machine coordinates for Z, because the turntable is a continuous rotary
/// axis whose work offset would otherwise accumulate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionSource {
    MachineOnly,
    WorkOnly,
    /// WPos for X/Y/C, MPos for Z.
    Hybrid,
}

/// Consistent view of the controller, updated by a single background writer.
#[derive(Debug, Clone)]
pub struct ControllerSnapshot {
    pub state: MotionState,
    /// Machine coordinates from the most recent status frame.
    pub machine_pos: Position4D,
    /// Work coordinates, merged per [`PositionSource::Hybrid`] rules.
    pub work_pos: Position4D,
    /// Work coordinate offset, when the firmware reported one.
    pub wco: Option<Position4D>,
    /// Which source produced `work_pos`.
    pub position_source: Option<PositionSource>,
    /// Set after a homing cycle completes; cleared on alarm.
    pub homed: bool,
    /// The raw text of the last `<...>` status frame.
    pub last_raw_status: String,
    /// Monotonic count of status frames consumed; lets waiters detect
    /// staleness without comparing timestamps.
    pub status_seq: u64,
}

impl Default for ControllerSnapshot {
    fn default() -> Self {
        Self {
            state: MotionState::Disconnected,
            machine_pos: Position4D::default(),
            work_pos: Position4D::default(),
            wco: None,
            position_source: None,
            homed: false,
            last_raw_status: String::new(),
            status_seq: 0,
        }
    }
}

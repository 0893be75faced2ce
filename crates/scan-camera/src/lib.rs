//! Camera sensors and exposure/focus calibration.
//!
//! [`sensor::CameraSensor`] wraps one physical sensor behind the
//! [`sensor::SensorBackend`] hardware seam and implements the dual-mode
//! (streaming / capturing) contract with a per-sensor lock and cool-down.
//! [`calibration`] holds the calibrator that freezes exposure and focus at
//! the first scan point and the store that re-applies those settings after
//! every sensor reconfiguration.

pub mod calibration;
pub mod sensor;

pub use calibration::{CalibrationStore, Calibrator, SyncMode};
pub use sensor::{CameraSensor, SensorBackend, SensorModeConfig};

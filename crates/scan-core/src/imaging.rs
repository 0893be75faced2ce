//! Camera-facing shared types: identifiers, modes, controls, metadata and
//! calibrated settings.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifies one physical sensor. Displayed as `camera0`, `camera1`, ...
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CameraId(pub u8);

impl std::fmt::Display for CameraId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "camera{}", self.0)
    }
}

/// Sensor operating mode.
///
/// `Streaming` is the low-latency preview configuration; `Capturing` is the
/// full-resolution still configuration. Transitions are serialized by a
/// per-sensor lock with a cool-down to prevent thrash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraMode {
    Streaming,
    Capturing,
}

/// A batch of control values to apply to a sensor.
///
/// `None` fields are left untouched, mirroring the partial-update semantics
/// of the underlying camera stack.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CameraControls {
    pub ae_enable: Option<bool>,
    pub awb_enable: Option<bool>,
    pub exposure_us: Option<u32>,
    pub analogue_gain: Option<f32>,
    /// Normalized lens position in [0, 1].
    pub focus_value: Option<f32>,
}

impl CameraControls {
    /// Controls that lock a calibrated exposure: AE/AWB off, explicit
    /// exposure and gain.
    pub fn locked(exposure_us: u32, analogue_gain: f32) -> Self {
        Self {
            ae_enable: Some(false),
            awb_enable: Some(false),
            exposure_us: Some(exposure_us),
            analogue_gain: Some(analogue_gain),
            focus_value: None,
        }
    }

    /// Controls that return the sensor to fully automatic operation.
    pub fn automatic() -> Self {
        Self {
            ae_enable: Some(true),
            awb_enable: Some(true),
            exposure_us: None,
            analogue_gain: None,
            focus_value: None,
        }
    }
}

/// Metadata read back from the sensor for one frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorMetadata {
    pub exposure_us: u32,
    pub analogue_gain: f32,
    /// Normalized lens position, when the sensor reports one.
    pub focus_value: Option<f32>,
    /// Scene luminance estimate, when available.
    pub lux: Option<f32>,
    pub ae_locked: bool,
}

impl SensorMetadata {
    /// ISO-equivalent derived from analogue gain (gain 1.0 == ISO 100).
    pub fn iso_equivalent(&self) -> u32 {
        (self.analogue_gain * 100.0).round().max(0.0) as u32
    }
}

/// Where a set of camera settings came from, persisted with every scan so
/// downstream tooling knows whether metadata reflects the calibrated run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationSource {
    PlanningDefaults,
    CustomProfileApplied,
    CameraCalibrated,
}

impl CalibrationSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            CalibrationSource::PlanningDefaults => "planning_defaults",
            CalibrationSource::CustomProfileApplied => "custom_profile_applied",
            CalibrationSource::CameraCalibrated => "camera_calibrated",
        }
    }
}

/// Exposure and focus values frozen by the calibrator.
///
/// Written once per calibration, re-applied and re-verified after every
/// sensor reconfiguration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibratedSettings {
    pub exposure_us: u32,
    pub analogue_gain: f32,
    /// Normalized focus in [0, 1].
    pub focus_value: f32,
    /// True once the settings have been applied and verified on-sensor.
    pub locked: bool,
    pub calibrated_at: DateTime<Utc>,
    pub source: CalibrationSource,
}

impl CalibratedSettings {
    /// True when readback metadata is within `tolerance` (fractional, e.g.
    /// 0.10) of the calibrated exposure and gain.
    pub fn verify(&self, metadata: &SensorMetadata, tolerance: f32) -> bool {
        let exp_err = (metadata.exposure_us as f32 - self.exposure_us as f32).abs()
            / (self.exposure_us.max(1) as f32);
        let gain_err =
            (metadata.analogue_gain - self.analogue_gain).abs() / self.analogue_gain.max(f32::MIN_POSITIVE);
        exp_err <= tolerance && gain_err <= tolerance
    }
}

/// One captured still with its pixels and readback metadata.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub camera: CameraId,
    /// Raw interleaved RGB8 pixels.
    pub pixels: Bytes,
    pub width: u32,
    pub height: u32,
    pub metadata: SensorMetadata,
    pub captured_at: DateTime<Utc>,
}

impl CapturedFrame {
    /// A capture that produced no pixels is treated as a failed capture.
    pub fn is_empty(&self) -> bool {
        self.pixels.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(exposure_us: u32, gain: f32) -> SensorMetadata {
        SensorMetadata {
            exposure_us,
            analogue_gain: gain,
            focus_value: Some(0.5),
            lux: None,
            ae_locked: true,
        }
    }

    #[test]
    fn verify_within_ten_percent() {
        let cal = CalibratedSettings {
            exposure_us: 20_000,
            analogue_gain: 2.0,
            focus_value: 0.5,
            locked: true,
            calibrated_at: Utc::now(),
            source: CalibrationSource::CameraCalibrated,
        };
        assert!(cal.verify(&metadata(21_000, 2.1), 0.10));
        assert!(!cal.verify(&metadata(25_000, 2.0), 0.10));
        assert!(!cal.verify(&metadata(20_000, 2.5), 0.10));
    }

    #[test]
    fn iso_equivalent_from_gain() {
        assert_eq!(metadata(1000, 1.0).iso_equivalent(), 100);
        assert_eq!(metadata(1000, 4.0).iso_equivalent(), 400);
    }

    #[test]
    fn camera_id_display() {
        assert_eq!(CameraId(1).to_string(), "camera1");
    }
}

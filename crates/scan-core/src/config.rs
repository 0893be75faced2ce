//! Resolved configuration consumed by the core.
//!
//! The core never parses files; the binary resolves a [`ScannerConfig`]
//! (figment: TOML + environment) and hands it to the component constructors.
//! Validation here is semantic: values that parsed fine but are logically
//! impossible are rejected before any hardware is touched.

use crate::error::{ScanResult, ScannerError};
use crate::lighting::FlashSettings;
use crate::limits::SoftLimits;
use crate::position::Position4D;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Top-level resolved configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    pub motion: MotionConfig,
    pub cameras: Vec<CameraConfig>,
    pub lighting: LightingConfig,
    #[serde(default)]
    pub scanning: ScanningConfig,
}

impl ScannerConfig {
    /// Semantic validation of the whole tree.
    pub fn validate(&self) -> ScanResult<()> {
        self.motion.validate()?;
        if self.cameras.is_empty() {
            return Err(ScannerError::Config("at least one camera required".into()));
        }
        for cam in &self.cameras {
            cam.validate()?;
        }
        self.lighting.validate()?;
        Ok(())
    }
}

/// Serial link and axis configuration for the motion controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MotionConfig {
    /// Serial device path, e.g. `/dev/ttyUSB0`.
    pub port: String,
    #[serde(default = "default_baud")]
    pub baud_rate: u32,
    /// Default timeout for commands without a specific table entry, seconds.
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    /// Firmware auto-report interval, milliseconds.
    #[serde(default = "default_report_interval")]
    pub status_report_interval_ms: u64,
    /// Settle time after opening the port before the first command,
    /// milliseconds. The firmware needs this to finish its boot banner.
    #[serde(default = "default_startup_settle")]
    pub startup_settle_ms: u64,
    pub limits: SoftLimits,
    /// Machine position expected after a successful homing cycle.
    #[serde(default)]
    pub expected_home: ExpectedHomePosition,
}

impl MotionConfig {
    fn validate(&self) -> ScanResult<()> {
        if self.port.is_empty() {
            return Err(ScannerError::Config("motion.port must not be empty".into()));
        }
        for (name, l) in [
            ("x", &self.limits.x),
            ("y", &self.limits.y),
            ("z", &self.limits.z),
            ("c", &self.limits.c),
        ] {
            if l.min >= l.max {
                return Err(ScannerError::Config(format!(
                    "motion.limits.{}: min {} must be below max {}",
                    name, l.min, l.max
                )));
            }
            if l.max_feedrate <= 0.0 {
                return Err(ScannerError::Config(format!(
                    "motion.limits.{}: max_feedrate must be positive",
                    name
                )));
            }
        }
        if self.limits.safety_margin < 0.0 {
            return Err(ScannerError::Config(
                "motion.limits.safety_margin must not be negative".into(),
            ));
        }
        Ok(())
    }
}

/// Where the machine should sit after homing, with tolerance.
///
/// Machine-geometry specific: on the current frame X homes to its minimum
/// and Y to its maximum near 200 mm. Used only by the homing fallback
/// verifier; the message stream is the preferred completion signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpectedHomePosition {
    pub position: Position4D,
    pub tolerance_mm: f64,
}

impl Default for ExpectedHomePosition {
    fn default() -> Self {
        Self {
            position: Position4D::new(0.0, 200.0, 0.0, 0.0),
            tolerance_mm: 5.0,
        }
    }
}

/// Per-sensor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    pub id: u8,
    #[serde(default)]
    pub name: String,
    /// Streaming (preview) resolution.
    #[serde(default = "default_stream_resolution")]
    pub stream_resolution: Resolution,
    /// Still-capture resolution, up to sensor native.
    pub capture_resolution: Resolution,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
    /// Minimum delay between sensor mode switches, milliseconds.
    #[serde(default = "default_mode_cooldown")]
    pub mode_switch_cooldown_ms: u64,
}

impl CameraConfig {
    fn validate(&self) -> ScanResult<()> {
        if self.capture_resolution.width == 0 || self.capture_resolution.height == 0 {
            return Err(ScannerError::Config(format!(
                "camera {}: capture resolution must be non-zero",
                self.id
            )));
        }
        if self.jpeg_quality == 0 || self.jpeg_quality > 100 {
            return Err(ScannerError::Config(format!(
                "camera {}: jpeg_quality must be in 1..=100",
                self.id
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

/// Flash array configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LightingConfig {
    /// Zone name to PWM/GPIO channel numbers.
    pub zones: BTreeMap<String, Vec<u8>>,
    /// LED stabilization time between assert and shutter open, ms.
    #[serde(default = "default_rise_time")]
    pub rise_time_ms: u64,
    /// Flash used during capture when a point has no override.
    #[serde(default)]
    pub default_flash: FlashSettings,
    #[serde(default)]
    pub calibration_flash: CalibrationFlash,
}

impl LightingConfig {
    fn validate(&self) -> ScanResult<()> {
        for (zone, channels) in &self.zones {
            if channels.is_empty() {
                return Err(ScannerError::Config(format!(
                    "lighting zone '{}' has no channels",
                    zone
                )));
            }
        }
        if !(0.0..=1.0).contains(&self.calibration_flash.brightness) {
            return Err(ScannerError::Config(
                "lighting.calibration_flash.brightness must be in [0, 1]".into(),
            ));
        }
        Ok(())
    }
}

/// Continuous lighting held for the duration of exposure calibration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationFlash {
    pub enabled: bool,
    pub brightness: f64,
}

impl Default for CalibrationFlash {
    fn default() -> Self {
        Self {
            enabled: true,
            brightness: 0.3,
        }
    }
}

/// Scan-loop tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanningConfig {
    /// Extra settle time after motion completes, seconds, added on top of
    /// the speed profile's settling delay.
    #[serde(default = "default_stabilization")]
    pub stabilization_delay_secs: f64,
    /// Root directory for scan sessions.
    #[serde(default = "default_output_root")]
    pub output_root: PathBuf,
    #[serde(default = "default_profile")]
    pub quality_profile: String,
    #[serde(default = "default_profile")]
    pub speed_profile: String,
}

impl Default for ScanningConfig {
    fn default() -> Self {
        Self {
            stabilization_delay_secs: default_stabilization(),
            output_root: default_output_root(),
            quality_profile: default_profile(),
            speed_profile: default_profile(),
        }
    }
}

fn default_baud() -> u32 {
    115_200
}
fn default_command_timeout() -> u64 {
    10
}
fn default_report_interval() -> u64 {
    200
}
fn default_startup_settle() -> u64 {
    2000
}
fn default_stream_resolution() -> Resolution {
    Resolution {
        width: 1920,
        height: 1080,
    }
}
fn default_jpeg_quality() -> u8 {
    95
}
fn default_mode_cooldown() -> u64 {
    1000
}
fn default_rise_time() -> u64 {
    50
}
fn default_stabilization() -> f64 {
    0.0
}
fn default_output_root() -> PathBuf {
    PathBuf::from("sessions")
}
fn default_profile() -> String {
    "medium".to_string()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::limits::AxisLimits;

    fn minimal_config() -> ScannerConfig {
        let toml = r#"
            [motion]
            port = "/dev/ttyUSB0"

            [motion.limits]
            safety_margin = 0.5
            x = { min = -5.0, max = 205.0, max_feedrate = 1000.0 }
            y = { min = -5.0, max = 205.0, max_feedrate = 800.0 }
            z = { min = -999999.0, max = 999999.0, max_feedrate = 360.0 }
            c = { min = -90.0, max = 90.0, max_feedrate = 180.0 }

            [[cameras]]
            id = 0
            capture_resolution = { width = 4608, height = 2592 }

            [[cameras]]
            id = 1
            capture_resolution = { width = 4608, height = 2592 }

            [lighting]
            zones = { inner = [0, 1], outer = [2, 3] }
        "#;
        toml::from_str(toml).unwrap()
    }

    #[test]
    fn minimal_config_parses_with_defaults() {
        let cfg = minimal_config();
        cfg.validate().unwrap();
        assert_eq!(cfg.motion.baud_rate, 115_200);
        assert_eq!(cfg.motion.status_report_interval_ms, 200);
        assert_eq!(cfg.motion.expected_home.position.y, 200.0);
        assert_eq!(cfg.cameras[0].stream_resolution.width, 1920);
        assert_eq!(cfg.lighting.rise_time_ms, 50);
        assert!(cfg.lighting.calibration_flash.enabled);
    }

    #[test]
    fn inverted_limits_rejected() {
        let mut cfg = minimal_config();
        cfg.motion.limits.x = AxisLimits::new(10.0, 5.0, 100.0);
        assert!(matches!(cfg.validate(), Err(ScannerError::Config(_))));
    }

    #[test]
    fn empty_zone_rejected() {
        let mut cfg = minimal_config();
        cfg.lighting.zones.insert("ring".into(), vec![]);
        assert!(cfg.validate().is_err());
    }
}

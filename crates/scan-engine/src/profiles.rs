//! Quality and speed profiles.
//!
//! A quality profile shapes the cameras (resolution, JPEG quality, exposure
//! preference); a speed profile shapes motion (feedrate multiplier, settling
//! delay). Both are resolved by name onto the hardware before a scan starts.

use scan_core::config::Resolution;
use scan_core::error::{ScanResult, ScannerError};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsoPreference {
    Auto,
    LowNoise,
    HighSpeed,
    LowestIso,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExposureMode {
    Auto,
    Manual,
    Calibrated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityProfile {
    pub name: String,
    pub description: String,
    pub resolution: Resolution,
    pub jpeg_quality: u8,
    pub iso_preference: IsoPreference,
    pub exposure_mode: ExposureMode,
    /// Fixed exposure for `Manual` mode, microseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exposure_time_us: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analogue_gain: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeedProfile {
    pub name: String,
    pub description: String,
    /// Scales the default feedrate; clamping to axis maxima still applies.
    pub feedrate_multiplier: f64,
    /// Post-move settle time before capture, seconds.
    pub settling_delay_secs: f64,
    pub acceleration_factor: f64,
    /// Extra delay between move-complete and shutter, seconds.
    pub capture_delay_secs: f64,
}

/// The built-in profile tables.
pub struct ScanProfiles;

impl ScanProfiles {
    pub fn quality(name: &str) -> ScanResult<QualityProfile> {
        let profile = match name {
            "low" => QualityProfile {
                name: "low".into(),
                description: "Draft Quality (Fast)".into(),
                resolution: Resolution {
                    width: 1920,
                    height: 1080,
                },
                jpeg_quality: 75,
                iso_preference: IsoPreference::Auto,
                exposure_mode: ExposureMode::Auto,
                exposure_time_us: None,
                analogue_gain: None,
            },
            "medium" => QualityProfile {
                name: "medium".into(),
                description: "Standard Quality".into(),
                resolution: Resolution {
                    width: 3840,
                    height: 2160,
                },
                jpeg_quality: 85,
                iso_preference: IsoPreference::LowNoise,
                exposure_mode: ExposureMode::Auto,
                exposure_time_us: None,
                analogue_gain: None,
            },
            "high" => QualityProfile {
                name: "high".into(),
                description: "High Quality (Detailed)".into(),
                resolution: Resolution {
                    width: 4608,
                    height: 2592,
                },
                jpeg_quality: 95,
                iso_preference: IsoPreference::LowNoise,
                exposure_mode: ExposureMode::Calibrated,
                exposure_time_us: None,
                analogue_gain: None,
            },
            "ultra" => QualityProfile {
                name: "ultra".into(),
                description: "Maximum Quality (Slow)".into(),
                resolution: Resolution {
                    width: 4608,
                    height: 2592,
                },
                jpeg_quality: 98,
                iso_preference: IsoPreference::LowestIso,
                exposure_mode: ExposureMode::Calibrated,
                exposure_time_us: Some(32_000),
                analogue_gain: Some(1.0),
            },
            other => {
                return Err(ScannerError::Config(format!(
                    "unknown quality profile '{}'",
                    other
                )))
            }
        };
        Ok(profile)
    }

    pub fn speed(name: &str) -> ScanResult<SpeedProfile> {
        let profile = match name {
            "slow" => SpeedProfile {
                name: "slow".into(),
                description: "Precision (Slowest)".into(),
                feedrate_multiplier: 0.6,
                settling_delay_secs: 3.0,
                acceleration_factor: 0.8,
                capture_delay_secs: 0.5,
            },
            "medium" => SpeedProfile {
                name: "medium".into(),
                description: "Balanced".into(),
                feedrate_multiplier: 1.0,
                settling_delay_secs: 2.0,
                acceleration_factor: 1.0,
                capture_delay_secs: 0.2,
            },
            "fast" => SpeedProfile {
                name: "fast".into(),
                description: "Quick Scan (Fastest)".into(),
                feedrate_multiplier: 1.4,
                settling_delay_secs: 1.5,
                acceleration_factor: 1.2,
                capture_delay_secs: 0.1,
            },
            other => {
                return Err(ScannerError::Config(format!(
                    "unknown speed profile '{}'",
                    other
                )))
            }
        };
        Ok(profile)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn builtin_profiles_resolve() {
        assert_eq!(ScanProfiles::quality("high").unwrap().jpeg_quality, 95);
        assert_eq!(ScanProfiles::speed("fast").unwrap().feedrate_multiplier, 1.4);
    }

    #[test]
    fn ultra_pins_manual_exposure() {
        let ultra = ScanProfiles::quality("ultra").unwrap();
        assert_eq!(ultra.exposure_time_us, Some(32_000));
        assert_eq!(ultra.iso_preference, IsoPreference::LowestIso);
    }

    #[test]
    fn unknown_profile_is_a_config_error() {
        assert!(matches!(
            ScanProfiles::quality("imaginary"),
            Err(ScannerError::Config(_))
        ));
    }
}

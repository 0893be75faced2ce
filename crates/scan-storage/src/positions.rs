//! The scan positions file: `<scan_id>_scan_positions.json`.
//!
//! Written once during planning with default camera settings, then rewritten
//! after calibration so the persisted metadata reflects the values the scan
//! actually ran with. The `settings_source` field tells downstream tooling
//! which of the two it is looking at.

use crate::atomic_write;
use chrono::{DateTime, Utc};
use scan_core::error::{ScanResult, ScannerError};
use scan_core::imaging::{CalibratedSettings, CalibrationSource};
use scan_core::lighting::LightingOverride;
use scan_core::point::ScanPoint;
use scan_core::position::Position4D;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

/// Camera settings as persisted per scan position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraSettingsRecord {
    /// `1/60`-style shutter string, or `auto` before calibration.
    pub exposure_time: String,
    pub iso: u32,
    pub resolution: [u32; 2],
    pub quality: u8,
    pub calibration_source: CalibrationSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub focus_position: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calibration_timestamp: Option<DateTime<Utc>>,
}

impl CameraSettingsRecord {
    /// Planning-stage defaults, used before any hardware has been touched.
    pub fn planning_defaults(resolution: [u32; 2], quality: u8) -> Self {
        Self {
            exposure_time: "auto".to_string(),
            iso: 100,
            resolution,
            quality,
            calibration_source: CalibrationSource::PlanningDefaults,
            focus_position: None,
            calibration_timestamp: None,
        }
    }

    /// Record reflecting an actual calibration.
    pub fn from_calibrated(cal: &CalibratedSettings, resolution: [u32; 2], quality: u8) -> Self {
        Self {
            exposure_time: exposure_string(cal.exposure_us),
            iso: (cal.analogue_gain * 100.0).round().max(0.0) as u32,
            resolution,
            quality,
            calibration_source: cal.source,
            focus_position: Some(cal.focus_value),
            calibration_timestamp: Some(cal.calibrated_at),
        }
    }
}

/// `1/60`-style shutter string from microseconds.
pub fn exposure_string(exposure_us: u32) -> String {
    if exposure_us == 0 {
        return "auto".to_string();
    }
    if exposure_us >= 1_000_000 {
        format!("{}s", exposure_us / 1_000_000)
    } else {
        format!("1/{}", (1_000_000.0 / exposure_us as f64).round() as u32)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraSettingsInfo {
    pub settings_source: CalibrationSource,
    pub note: String,
    /// True while the file still holds planning defaults that the scan will
    /// overwrite after calibration.
    pub will_be_updated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings_updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanInfo {
    pub scan_id: String,
    pub pattern_type: String,
    pub pattern_id: String,
    pub total_points: usize,
    pub generated_at: DateTime<Utc>,
    pub pattern_parameters: serde_json::Value,
    pub camera_settings_info: CameraSettingsInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureSettings {
    pub capture_count: u32,
    /// Seconds, matching the planner's units.
    pub dwell_time: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionEntry {
    pub point_index: usize,
    pub position: Position4D,
    pub capture_settings: CaptureSettings,
    pub camera_settings: CameraSettingsRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lighting_settings: Option<LightingOverride>,
}

/// The whole positions file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionsFile {
    pub scan_info: ScanInfo,
    pub scan_positions: Vec<PositionEntry>,
}

impl PositionsFile {
    /// Build the planning-stage file from generated points.
    pub fn generate(
        scan_id: &str,
        pattern_type: &str,
        pattern_id: &str,
        pattern_parameters: serde_json::Value,
        points: &[ScanPoint],
        camera_settings: CameraSettingsRecord,
    ) -> Self {
        let will_be_updated =
            camera_settings.calibration_source != CalibrationSource::CameraCalibrated;
        let note = match camera_settings.calibration_source {
            CalibrationSource::PlanningDefaults => {
                "Camera settings are planning defaults and will be updated with calibrated \
                 values during scan execution"
            }
            CalibrationSource::CustomProfileApplied => {
                "Camera settings reflect a custom profile applied to the hardware"
            }
            CalibrationSource::CameraCalibrated => {
                "Camera settings reflect actual calibrated values from scan execution"
            }
        };

        let scan_positions = points
            .iter()
            .enumerate()
            .map(|(index, point)| PositionEntry {
                point_index: index,
                position: point.position,
                capture_settings: CaptureSettings {
                    capture_count: point.capture_count,
                    dwell_time: point.dwell_ms as f64 / 1000.0,
                },
                camera_settings: camera_settings.clone(),
                lighting_settings: point.lighting_override.clone(),
            })
            .collect();

        Self {
            scan_info: ScanInfo {
                scan_id: scan_id.to_string(),
                pattern_type: pattern_type.to_string(),
                pattern_id: pattern_id.to_string(),
                total_points: points.len(),
                generated_at: Utc::now(),
                pattern_parameters,
                camera_settings_info: CameraSettingsInfo {
                    settings_source: camera_settings.calibration_source,
                    note: note.to_string(),
                    will_be_updated,
                    settings_updated_at: None,
                },
            },
            scan_positions,
        }
    }

    /// Rewrite every position's camera settings with calibrated values.
    pub fn apply_calibration(&mut self, calibrated: &CameraSettingsRecord) {
        self.scan_info.camera_settings_info = CameraSettingsInfo {
            settings_source: calibrated.calibration_source,
            note: "Camera settings updated with actual calibrated values after scan calibration"
                .to_string(),
            will_be_updated: false,
            settings_updated_at: Some(Utc::now()),
        };
        for entry in &mut self.scan_positions {
            entry.camera_settings = calibrated.clone();
        }
        info!(
            scan_id = %self.scan_info.scan_id,
            exposure = %calibrated.exposure_time,
            iso = calibrated.iso,
            "positions file updated with calibrated settings"
        );
    }

    pub fn path_for(dir: &Path, scan_id: &str) -> PathBuf {
        dir.join(format!("{}_scan_positions.json", scan_id))
    }

    pub async fn write(&self, dir: &Path) -> ScanResult<PathBuf> {
        let path = Self::path_for(dir, &self.scan_info.scan_id);
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| ScannerError::storage(format!("serialize positions: {}", e)))?;
        atomic_write(&path, &json).await?;
        Ok(path)
    }

    pub async fn load(path: &Path) -> ScanResult<Self> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| ScannerError::storage(format!("read {}: {}", path.display(), e)))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| ScannerError::storage(format!("parse {}: {}", path.display(), e)))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn sample_points() -> Vec<ScanPoint> {
        vec![
            ScanPoint::new(Position4D::new(0.0, 0.0, 0.0, 0.0)),
            ScanPoint::new(Position4D::new(50.0, 0.0, 0.0, 0.0)).with_dwell_ms(250),
        ]
    }

    fn planning_file() -> PositionsFile {
        PositionsFile::generate(
            "scan_001",
            "grid",
            "grid_20260801",
            serde_json::json!({"x_range": [0.0, 50.0]}),
            &sample_points(),
            CameraSettingsRecord::planning_defaults([4608, 2592], 95),
        )
    }

    #[test]
    fn planning_file_flags_pending_update() {
        let file = planning_file();
        assert!(file.scan_info.camera_settings_info.will_be_updated);
        assert_eq!(
            file.scan_info.camera_settings_info.settings_source,
            CalibrationSource::PlanningDefaults
        );
        assert_eq!(file.scan_positions.len(), 2);
        assert_eq!(file.scan_positions[1].capture_settings.dwell_time, 0.25);
    }

    #[test]
    fn calibration_rewrites_every_entry() {
        let mut file = planning_file();
        let cal = CalibratedSettings {
            exposure_us: 16_667,
            analogue_gain: 2.0,
            focus_value: 0.42,
            locked: true,
            calibrated_at: Utc::now(),
            source: CalibrationSource::CameraCalibrated,
        };
        file.apply_calibration(&CameraSettingsRecord::from_calibrated(&cal, [4608, 2592], 95));

        assert!(!file.scan_info.camera_settings_info.will_be_updated);
        for entry in &file.scan_positions {
            assert_eq!(entry.camera_settings.exposure_time, "1/60");
            assert_eq!(entry.camera_settings.iso, 200);
            assert_eq!(entry.camera_settings.focus_position, Some(0.42));
            assert_eq!(
                entry.camera_settings.calibration_source,
                CalibrationSource::CameraCalibrated
            );
        }
    }

    #[tokio::test]
    async fn write_then_load_is_structurally_equal() {
        let dir = tempfile::tempdir().unwrap();
        let file = planning_file();
        let path = file.write(dir.path()).await.unwrap();
        assert!(path.ends_with("scan_001_scan_positions.json"));

        let loaded = PositionsFile::load(&path).await.unwrap();
        assert_eq!(
            serde_json::to_value(&loaded).unwrap(),
            serde_json::to_value(&file).unwrap()
        );
    }

    #[test]
    fn exposure_strings() {
        assert_eq!(exposure_string(16_667), "1/60");
        assert_eq!(exposure_string(33_333), "1/30");
        assert_eq!(exposure_string(2_000_000), "2s");
        assert_eq!(exposure_string(0), "auto");
    }
}

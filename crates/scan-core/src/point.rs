//! Scan points: one commanded position plus its capture parameters.

use crate::imaging::CameraControls;
use crate::lighting::LightingOverride;
use crate::position::Position4D;
use serde::{Deserialize, Serialize};

/// A single point in a scan pattern.
///
/// Invariants: `capture_count >= 1`; `dwell_ms` is the settle time applied
/// after motion completes and before capture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanPoint {
    pub position: Position4D,
    pub capture_count: u32,
    pub dwell_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub camera_override: Option<CameraControls>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lighting_override: Option<LightingOverride>,
}

impl ScanPoint {
    pub fn new(position: Position4D) -> Self {
        Self {
            position,
            capture_count: 1,
            dwell_ms: 500,
            camera_override: None,
            lighting_override: None,
        }
    }

    /// Number of images per point; values below 1 are clamped up.
    pub fn with_capture_count(mut self, count: u32) -> Self {
        self.capture_count = count.max(1);
        self
    }

    pub fn with_dwell_ms(mut self, dwell_ms: u64) -> Self {
        self.dwell_ms = dwell_ms;
        self
    }

    pub fn with_lighting_override(mut self, lighting: LightingOverride) -> Self {
        self.lighting_override = Some(lighting);
        self
    }

    pub fn with_camera_override(mut self, controls: CameraControls) -> Self {
        self.camera_override = Some(controls);
        self
    }
}

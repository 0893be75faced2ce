//! Cylindrical pattern for turntable scanning: the camera sits at a fixed
//! radius, sweeps Y vertically, and the turntable rotates through a list of
//! angles. The servo tilt can track a focus point so every Y position aims
//! at the same height on the object.

use crate::{validate_points, PatternType, ScanPattern};
use scan_core::limits::SoftLimits;
use scan_core::point::ScanPoint;
use scan_core::position::Position4D;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Servo tilt strategy for the C axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ServoTilt {
    /// Servo stays at 0 degrees.
    None,
    /// One fixed angle for every point.
    Manual { angle: f64 },
    /// Aim each Y position at a fixed height on the object:
    /// `angle = atan((y_focus - y) / radius)`.
    FocusPoint { y_focus: f64 },
}

impl Default for ServoTilt {
    fn default() -> Self {
        ServoTilt::None
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CylindricalParameters {
    /// Fixed camera radius (distance from the object center), mm.
    pub radius: f64,
    pub y_range: (f64, f64),
    #[serde(default = "default_y_step")]
    pub y_step: f64,
    /// Explicit Y positions; overrides `y_range`/`y_step` when present.
    #[serde(default)]
    pub y_positions: Option<Vec<f64>>,
    /// Turntable angles, degrees. Empty falls back to 6 positions at 60°.
    #[serde(default)]
    pub z_rotations: Vec<f64>,
    #[serde(default)]
    pub servo: ServoTilt,
    #[serde(default = "default_dwell")]
    pub dwell_ms: u64,
}

fn default_y_step() -> f64 {
    20.0
}
fn default_dwell() -> u64 {
    500
}

pub struct CylindricalPattern {
    pattern_id: String,
    params: CylindricalParameters,
}

impl CylindricalPattern {
    pub fn new(pattern_id: impl Into<String>, params: CylindricalParameters) -> Self {
        Self {
            pattern_id: pattern_id.into(),
            params,
        }
    }

    fn y_positions(&self) -> Vec<f64> {
        if let Some(explicit) = &self.params.y_positions {
            return explicit.clone();
        }
        crate::axis_positions(self.params.y_range.0, self.params.y_range.1, self.params.y_step)
    }

    /// Servo angle for one Y position, degrees.
    pub fn servo_angle(&self, y: f64) -> f64 {
        match &self.params.servo {
            ServoTilt::None => 0.0,
            ServoTilt::Manual { angle } => *angle,
            ServoTilt::FocusPoint { y_focus } => {
                ((y_focus - y) / self.params.radius).atan().to_degrees()
            }
        }
    }

    fn z_rotations(&self) -> Vec<f64> {
        if self.params.z_rotations.is_empty() {
            warn!(pattern = %self.pattern_id, "no turntable rotations given; defaulting to 6 x 60°");
            (0..6).map(|i| i as f64 * 60.0).collect()
        } else {
            self.params.z_rotations.clone()
        }
    }
}

impl ScanPattern for CylindricalPattern {
    fn pattern_id(&self) -> &str {
        &self.pattern_id
    }

    fn pattern_type(&self) -> PatternType {
        PatternType::Cylindrical
    }

    fn parameters_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.params).unwrap_or_default()
    }

    fn generate_points(&self, limits: &SoftLimits) -> Vec<ScanPoint> {
        let ys = self.y_positions();
        let zs = self.z_rotations();

        let mut points = Vec::with_capacity(ys.len() * zs.len());
        for &y in &ys {
            let c = self.servo_angle(y);
            for &z in &zs {
                points.push(
                    ScanPoint::new(Position4D::new(self.params.radius, y, z, c))
                        .with_dwell_ms(self.params.dwell_ms),
                );
            }
        }

        info!(
            pattern = %self.pattern_id,
            ys = ys.len(),
            rotations = zs.len(),
            "cylindrical pattern generated"
        );
        validate_points(&self.pattern_id, points, limits)
    }
}

//! Spherical pattern: turntable angles crossed with tilt angles at a fixed
//! radius from a center height. X and Y are derived from the radius and the
//! tilt so the camera stays on the sphere while the C axis keeps the object
//! centered in frame.

use crate::{validate_points, PatternType, ScanPattern};
use scan_core::limits::SoftLimits;
use scan_core::point::ScanPoint;
use scan_core::position::Position4D;
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SphericalParameters {
    /// Sphere radius, mm.
    pub radius: f64,
    /// Height of the sphere center on the Y axis, mm.
    pub center_y: f64,
    /// Turntable angles, degrees.
    pub z_angles: Vec<f64>,
    /// Tilt angles, degrees; each produces one ring on the sphere.
    pub c_angles: Vec<f64>,
    #[serde(default = "default_dwell")]
    pub dwell_ms: u64,
}

fn default_dwell() -> u64 {
    500
}

pub struct SphericalPattern {
    pattern_id: String,
    params: SphericalParameters,
}

impl SphericalPattern {
    pub fn new(pattern_id: impl Into<String>, params: SphericalParameters) -> Self {
        Self {
            pattern_id: pattern_id.into(),
            params,
        }
    }

    /// Camera X/Y for one tilt angle: the horizontal distance shrinks as the
    /// camera tilts, the height offsets from the center.
    fn xy_for_tilt(&self, c_degrees: f64) -> (f64, f64) {
        let c = c_degrees.to_radians();
        let x = self.params.radius * c.cos();
        let y = self.params.center_y + self.params.radius * c.sin();
        (x, y)
    }
}

impl ScanPattern for SphericalPattern {
    fn pattern_id(&self) -> &str {
        &self.pattern_id
    }

    fn pattern_type(&self) -> PatternType {
        PatternType::Spherical
    }

    fn parameters_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.params).unwrap_or_default()
    }

    fn generate_points(&self, limits: &SoftLimits) -> Vec<ScanPoint> {
        let mut points = Vec::with_capacity(self.params.c_angles.len() * self.params.z_angles.len());
        for &c in &self.params.c_angles {
            let (x, y) = self.xy_for_tilt(c);
            for &z in &self.params.z_angles {
                points.push(
                    ScanPoint::new(Position4D::new(x, y, z, c)).with_dwell_ms(self.params.dwell_ms),
                );
            }
        }

        info!(
            pattern = %self.pattern_id,
            rings = self.params.c_angles.len(),
            rotations = self.params.z_angles.len(),
            "spherical pattern generated"
        );
        validate_points(&self.pattern_id, points, limits)
    }
}

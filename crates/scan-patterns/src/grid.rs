//! Grid pattern: a regular XY raster with optional turntable layers and
//! tilt steps, traversed in zigzag order for efficiency.

use crate::{axis_positions, validate_points, PatternType, ScanPattern};
use scan_core::limits::SoftLimits;
use scan_core::point::ScanPoint;
use scan_core::position::Position4D;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Camera horizontal field of view used for overlap-derived spacing.
const CAMERA_FOV_DEGREES: f64 = 60.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridParameters {
    pub x_range: (f64, f64),
    pub y_range: (f64, f64),
    /// Explicit grid spacing in mm; when `None`, spacing is computed from
    /// the overlap percentage at the working distance.
    #[serde(default)]
    pub x_spacing: Option<f64>,
    #[serde(default)]
    pub y_spacing: Option<f64>,
    /// Desired image overlap for reconstruction, percent.
    #[serde(default = "default_overlap")]
    pub overlap_percent: f64,
    /// Mean camera-to-object distance used for field-of-view math, mm.
    #[serde(default = "default_working_distance")]
    pub working_distance: f64,
    /// Turntable angles to repeat the raster at.
    #[serde(default = "default_z_values")]
    pub z_values: Vec<f64>,
    /// Tilt angles to repeat the raster at.
    #[serde(default = "default_c_values")]
    pub c_values: Vec<f64>,
    /// Reverse X direction on alternate rows.
    #[serde(default = "default_true")]
    pub zigzag: bool,
    /// Capture several exposures per point.
    #[serde(default)]
    pub bracket_exposures: bool,
    #[serde(default = "default_exposure_steps")]
    pub exposure_steps: u32,
    #[serde(default = "default_dwell")]
    pub dwell_ms: u64,
}

fn default_overlap() -> f64 {
    30.0
}
fn default_working_distance() -> f64 {
    150.0
}
fn default_z_values() -> Vec<f64> {
    vec![0.0]
}
fn default_c_values() -> Vec<f64> {
    vec![0.0]
}
fn default_true() -> bool {
    true
}
fn default_exposure_steps() -> u32 {
    3
}
fn default_dwell() -> u64 {
    500
}

pub struct GridPattern {
    pattern_id: String,
    params: GridParameters,
}

impl GridPattern {
    pub fn new(pattern_id: impl Into<String>, params: GridParameters) -> Self {
        Self {
            pattern_id: pattern_id.into(),
            params,
        }
    }

    /// Field of view at the working distance, width x height (4:3).
    fn field_of_view(&self) -> (f64, f64) {
        let angle = CAMERA_FOV_DEGREES.to_radians();
        let width = 2.0 * self.params.working_distance * (angle / 2.0).tan();
        (width, width * 0.75)
    }

    /// Grid spacing: explicit when given, otherwise derived so adjacent
    /// frames overlap by the requested percentage.
    fn spacing(&self) -> (f64, f64) {
        if let (Some(x), Some(y)) = (self.params.x_spacing, self.params.y_spacing) {
            return (x, y);
        }
        let (fov_w, fov_h) = self.field_of_view();
        let factor = (100.0 - self.params.overlap_percent.clamp(0.0, 90.0)) / 100.0;
        let derived = (fov_w * factor, fov_h * factor);
        (
            self.params.x_spacing.unwrap_or(derived.0),
            self.params.y_spacing.unwrap_or(derived.1),
        )
    }
}

impl ScanPattern for GridPattern {
    fn pattern_id(&self) -> &str {
        &self.pattern_id
    }

    fn pattern_type(&self) -> PatternType {
        PatternType::Grid
    }

    fn parameters_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.params).unwrap_or_default()
    }

    fn generate_points(&self, limits: &SoftLimits) -> Vec<ScanPoint> {
        let (x_spacing, y_spacing) = self.spacing();
        let xs = axis_positions(self.params.x_range.0, self.params.x_range.1, x_spacing);
        let ys = axis_positions(self.params.y_range.0, self.params.y_range.1, y_spacing);

        let capture_count = if self.params.bracket_exposures {
            self.params.exposure_steps.max(1)
        } else {
            1
        };

        let mut points = Vec::new();
        for &z in &self.params.z_values {
            for &c in &self.params.c_values {
                for (row, &y) in ys.iter().enumerate() {
                    // Zigzag: odd rows run right-to-left
                    let mut row_xs = xs.clone();
                    if self.params.zigzag && row % 2 == 1 {
                        row_xs.reverse();
                    }
                    for &x in &row_xs {
                        points.push(
                            ScanPoint::new(Position4D::new(x, y, z, c))
                                .with_capture_count(capture_count)
                                .with_dwell_ms(self.params.dwell_ms),
                        );
                    }
                }
            }
        }

        info!(
            pattern = %self.pattern_id,
            xs = xs.len(),
            ys = ys.len(),
            layers = self.params.z_values.len() * self.params.c_values.len(),
            "grid generated"
        );
        validate_points(&self.pattern_id, points, limits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scan_core::limits::AxisLimits;

    fn limits() -> SoftLimits {
        SoftLimits {
            x: AxisLimits::new(-5.0, 205.0, 1000.0),
            y: AxisLimits::new(-5.0, 205.0, 800.0),
            z: AxisLimits::new(-999_999.0, 999_999.0, 360.0),
            c: AxisLimits::new(-90.0, 90.0, 180.0),
            safety_margin: 0.5,
        }
    }

    fn params(x: (f64, f64), y: (f64, f64), spacing: f64) -> GridParameters {
        GridParameters {
            x_range: x,
            y_range: y,
            x_spacing: Some(spacing),
            y_spacing: Some(spacing),
            overlap_percent: 30.0,
            working_distance: 150.0,
            z_values: vec![0.0],
            c_values: vec![0.0],
            zigzag: true,
            bracket_exposures: false,
            exposure_steps: 3,
            dwell_ms: 100,
        }
    }

    #[test]
    fn two_point_row() {
        let pattern = GridPattern::new("g1", params((0.0, 50.0), (0.0, 0.0), 50.0));
        let points = pattern.generate_points(&limits());
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].position, Position4D::new(0.0, 0.0, 0.0, 0.0));
        assert_eq!(points[1].position, Position4D::new(50.0, 0.0, 0.0, 0.0));
    }

    #[test]
    fn zigzag_reverses_alternate_rows() {
        let pattern = GridPattern::new("g2", params((0.0, 100.0), (0.0, 50.0), 50.0));
        let points = pattern.generate_points(&limits());
        // Row 0: 0, 50, 100; row 1 reversed: 100, 50, 0
        let xs: Vec<f64> = points.iter().map(|p| p.position.x).collect();
        assert_eq!(xs, vec![0.0, 50.0, 100.0, 100.0, 50.0, 0.0]);
    }

    #[test]
    fn out_of_limit_points_are_dropped_not_adjusted() {
        let mut p = params((150.0, 250.0), (0.0, 0.0), 50.0);
        p.zigzag = false;
        let pattern = GridPattern::new("g3", p);
        let points = pattern.generate_points(&limits());
        // 150, 200 survive; 250 is dropped (max 205, margin 0.5)
        let xs: Vec<f64> = points.iter().map(|p| p.position.x).collect();
        assert_eq!(xs, vec![150.0, 200.0]);
    }

    #[test]
    fn bracketing_multiplies_capture_count() {
        let mut p = params((0.0, 0.0), (0.0, 0.0), 10.0);
        p.bracket_exposures = true;
        p.exposure_steps = 3;
        let pattern = GridPattern::new("g4", p);
        let points = pattern.generate_points(&limits());
        assert_eq!(points[0].capture_count, 3);
    }

    #[test]
    fn overlap_spacing_derived_from_fov() {
        let mut p = params((0.0, 200.0), (0.0, 0.0), 0.0);
        p.x_spacing = None;
        p.y_spacing = None;
        p.overlap_percent = 30.0;
        p.working_distance = 150.0;
        let pattern = GridPattern::new("g5", p);
        // FOV width = 2*150*tan(30 deg) ~= 173.2; spacing ~= 121.2
        let (x_spacing, _) = pattern.spacing();
        assert!((x_spacing - 121.24).abs() < 0.1);
    }
}

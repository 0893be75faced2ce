//! Scan pattern generators.
//!
//! A pattern turns its parameters into an ordered list of
//! [`scan_core::point::ScanPoint`]s. Every generated point is validated
//! against the machine's safety-margined limits; points that fail are
//! dropped with a warning and never silently adjusted.

pub mod cylindrical;
pub mod grid;
pub mod spherical;

pub use cylindrical::{CylindricalParameters, CylindricalPattern, ServoTilt};
pub use grid::{GridParameters, GridPattern};
pub use spherical::{SphericalParameters, SphericalPattern};

use scan_core::limits::SoftLimits;
use scan_core::point::ScanPoint;
use serde::{Deserialize, Serialize};

/// Pattern kind, persisted in scan metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternType {
    Grid,
    Cylindrical,
    Spherical,
}

impl PatternType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatternType::Grid => "grid",
            PatternType::Cylindrical => "cylindrical",
            PatternType::Spherical => "spherical",
        }
    }
}

/// A scan pattern: parameters plus point generation.
pub trait ScanPattern: Send + Sync {
    fn pattern_id(&self) -> &str;

    fn pattern_type(&self) -> PatternType;

    /// Pattern parameters for persistence into the scan positions file.
    fn parameters_json(&self) -> serde_json::Value;

    /// Generate all points, validated against `limits`. Invalid points are
    /// dropped with a warning.
    fn generate_points(&self, limits: &SoftLimits) -> Vec<ScanPoint>;

    /// Rough duration estimate in minutes (movement + settle + capture).
    fn estimated_duration_mins(&self, limits: &SoftLimits) -> f64 {
        let points = self.generate_points(limits).len() as f64;
        const SECS_PER_POINT: f64 = 15.0;
        const SECS_PER_MOVE: f64 = 5.0;
        points * (SECS_PER_POINT + SECS_PER_MOVE) / 60.0
    }
}

/// Keep only the points inside the safety-margined limits, warning per drop.
pub(crate) fn validate_points(
    pattern_id: &str,
    points: Vec<ScanPoint>,
    limits: &SoftLimits,
) -> Vec<ScanPoint> {
    let total = points.len();
    let valid: Vec<ScanPoint> = points
        .into_iter()
        .filter(|point| match limits.validate(&point.position) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(pattern = pattern_id, error = %e, "dropping invalid scan point");
                false
            }
        })
        .collect();
    if valid.len() < total {
        tracing::warn!(
            pattern = pattern_id,
            dropped = total - valid.len(),
            kept = valid.len(),
            "pattern generated out-of-limits points"
        );
    }
    valid
}

/// Positions along an axis from `min` stepping by `spacing`, always ending
/// at `max`.
pub(crate) fn axis_positions(min: f64, max: f64, spacing: f64) -> Vec<f64> {
    if spacing <= 0.0 || min > max {
        return vec![min];
    }
    let mut positions = Vec::new();
    let mut current = min;
    while current <= max + 1e-9 {
        positions.push(current);
        current += spacing;
    }
    if let Some(&last) = positions.last() {
        if last < max - 1e-9 {
            positions.push(max);
        }
    }
    positions
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn axis_positions_include_endpoints() {
        assert_eq!(axis_positions(0.0, 50.0, 50.0), vec![0.0, 50.0]);
        assert_eq!(axis_positions(0.0, 100.0, 30.0), vec![0.0, 30.0, 60.0, 90.0, 100.0]);
        assert_eq!(axis_positions(10.0, 10.0, 5.0), vec![10.0]);
    }

    #[test]
    fn zero_spacing_collapses_to_min() {
        assert_eq!(axis_positions(5.0, 20.0, 0.0), vec![5.0]);
    }
}

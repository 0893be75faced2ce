//! Per-axis travel limits and safety-margin validation.
//!
//! Limits are immutable once configuration is resolved. Every commanded
//! position must pass [`SoftLimits::validate`] before any bytes reach the
//! wire; a value exactly on `min` or `max` is rejected even with a zero
//! margin.

use crate::error::{ScanResult, ScannerError};
use crate::position::{Axis, Position4D};
use serde::{Deserialize, Serialize};

/// Travel and feedrate limits for a single axis.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AxisLimits {
    /// Minimum reachable coordinate (mm or degrees).
    pub min: f64,
    /// Maximum reachable coordinate (mm or degrees).
    pub max: f64,
    /// Maximum feedrate for this axis (units/min).
    pub max_feedrate: f64,
}

impl AxisLimits {
    pub fn new(min: f64, max: f64, max_feedrate: f64) -> Self {
        Self {
            min,
            max,
            max_feedrate,
        }
    }

    /// True when `value` lies strictly inside the margin-shrunk range.
    ///
    /// The margin is strictly enforced: `value == min + margin` fails.
    pub fn contains_with_margin(&self, value: f64, margin: f64) -> bool {
        value > self.min + margin && value < self.max - margin
    }
}

/// The full set of axis limits plus the configured safety margin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SoftLimits {
    pub x: AxisLimits,
    pub y: AxisLimits,
    pub z: AxisLimits,
    pub c: AxisLimits,
    /// Safety margin subtracted from both ends of every axis range.
    pub safety_margin: f64,
}

impl SoftLimits {
    pub fn axis(&self, axis: Axis) -> &AxisLimits {
        match axis {
            Axis::X => &self.x,
            Axis::Y => &self.y,
            Axis::Z => &self.z,
            Axis::C => &self.c,
        }
    }

    /// Validate a commanded position against all four axes.
    ///
    /// Negative X/Y targets are rejected unconditionally; the machine origin
    /// is the physical minimum for the linear axes regardless of configured
    /// limits. Returns [`ScannerError::Safety`] naming the first offending
    /// axis; nothing is transmitted after a failure here.
    pub fn validate(&self, position: &Position4D) -> ScanResult<()> {
        if position.x < 0.0 || position.y < 0.0 {
            return Err(ScannerError::Safety(format!(
                "negative linear target not allowed: {}",
                position
            )));
        }
        for axis in Axis::ALL {
            let limits = self.axis(axis);
            let value = position.axis(axis);
            if !limits.contains_with_margin(value, self.safety_margin) {
                return Err(ScannerError::Safety(format!(
                    "axis {} target {:.3} outside safe range [{:.3}, {:.3}] (margin {:.3})",
                    axis,
                    value,
                    limits.min,
                    limits.max,
                    self.safety_margin
                )));
            }
        }
        Ok(())
    }

    /// Clamp a requested feedrate to the most restrictive per-axis maximum
    /// among the axes that actually move in `delta`.
    ///
    /// A move with no displacement falls back to the global minimum.
    pub fn clamp_feedrate(&self, requested: f64, delta: &Position4D) -> f64 {
        let mut ceiling = f64::INFINITY;
        for axis in Axis::ALL {
            if delta.axis(axis).abs() > f64::EPSILON {
                ceiling = ceiling.min(self.axis(axis).max_feedrate);
            }
        }
        if ceiling.is_infinite() {
            ceiling = Axis::ALL
                .iter()
                .map(|a| self.axis(*a).max_feedrate)
                .fold(f64::INFINITY, f64::min);
        }
        requested.min(ceiling).max(1.0)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn limits() -> SoftLimits {
        SoftLimits {
            x: AxisLimits::new(-5.0, 205.0, 1000.0),
            y: AxisLimits::new(-5.0, 205.0, 800.0),
            z: AxisLimits::new(-999_999.0, 999_999.0, 360.0),
            c: AxisLimits::new(-90.0, 90.0, 180.0),
            safety_margin: 0.5,
        }
    }

    #[test]
    fn accepts_interior_point() {
        let pos = Position4D::new(100.0, 100.0, 180.0, 45.0);
        assert!(limits().validate(&pos).is_ok());
    }

    #[test]
    fn rejects_negative_linear() {
        let pos = Position4D::new(-1.0, 10.0, 0.0, 0.0);
        let err = limits().validate(&pos).unwrap_err();
        assert!(matches!(err, ScannerError::Safety(_)));
    }

    #[test]
    fn boundary_exactly_on_limit_rejected_with_zero_margin() {
        let mut l = limits();
        l.safety_margin = 0.0;
        // C axis sits exactly on its maximum
        let pos = Position4D::new(10.0, 10.0, 0.0, 90.0);
        assert!(l.validate(&pos).is_err());
    }

    #[test]
    fn margin_strictly_enforced() {
        let l = limits();
        // 204.5 == max - margin, must still fail
        let pos = Position4D::new(204.5, 10.0, 0.0, 0.0);
        assert!(l.validate(&pos).is_err());
        let inside = Position4D::new(204.4, 10.0, 0.0, 0.0);
        assert!(l.validate(&inside).is_ok());
    }

    #[test]
    fn feedrate_clamped_to_most_restrictive_moving_axis() {
        let l = limits();
        // Move involves Y (800) and C (180): ceiling is 180
        let delta = Position4D::new(0.0, 10.0, 0.0, 5.0);
        assert_eq!(l.clamp_feedrate(1000.0, &delta), 180.0);
        // Pure X move keeps the X ceiling
        let dx = Position4D::new(10.0, 0.0, 0.0, 0.0);
        assert_eq!(l.clamp_feedrate(1000.0, &dx), 1000.0);
    }
}

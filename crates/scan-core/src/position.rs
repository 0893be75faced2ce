//! 4-degree-of-freedom positions.
//!
//! The scanner moves two linear axes (X, Y in millimetres), a continuous
//! rotary turntable (Z in degrees, unbounded with accumulation semantics) and
//! a bounded servo tilt (C in degrees).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Sub};

/// One of the four scanner axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    /// Linear, millimetres
    X,
    /// Linear, millimetres
    Y,
    /// Continuous turntable rotation, degrees
    Z,
    /// Servo tilt, degrees, bounded to roughly +/-90
    C,
}

impl Axis {
    pub const ALL: [Axis; 4] = [Axis::X, Axis::Y, Axis::Z, Axis::C];

    /// Lowercase axis label as used in configuration and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Axis::X => "x",
            Axis::Y => "y",
            Axis::Z => "z",
            Axis::C => "c",
        }
    }

    /// Uppercase G-code word letter.
    pub fn gcode_letter(&self) -> char {
        match self {
            Axis::X => 'X',
            Axis::Y => 'Y',
            Axis::Z => 'Z',
            Axis::C => 'C',
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A commanded or reported position across all four axes.
///
/// `x`/`y` are millimetres, `z`/`c` degrees. Equality is exact; use
/// [`Position4D::approx_eq`] for tolerance comparisons against reported
/// hardware positions.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position4D {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub c: f64,
}

impl Position4D {
    pub fn new(x: f64, y: f64, z: f64, c: f64) -> Self {
        Self { x, y, z, c }
    }

    /// Component for a given axis.
    pub fn axis(&self, axis: Axis) -> f64 {
        match axis {
            Axis::X => self.x,
            Axis::Y => self.y,
            Axis::Z => self.z,
            Axis::C => self.c,
        }
    }

    /// Replace one component, returning the updated position.
    pub fn with_axis(mut self, axis: Axis, value: f64) -> Self {
        match axis {
            Axis::X => self.x = value,
            Axis::Y => self.y = value,
            Axis::Z => self.z = value,
            Axis::C => self.c = value,
        }
        self
    }

    /// Format as G-code coordinate words: `X0.000 Y0.000 Z0.000 C0.000`.
    ///
    /// Three decimal places matches the firmware's reported resolution.
    pub fn gcode_words(&self) -> String {
        format!(
            "X{:.3} Y{:.3} Z{:.3} C{:.3}",
            self.x, self.y, self.z, self.c
        )
    }

    /// True when every component is within `tol` of `other`.
    pub fn approx_eq(&self, other: &Position4D, tol: f64) -> bool {
        (self.x - other.x).abs() <= tol
            && (self.y - other.y).abs() <= tol
            && (self.z - other.z).abs() <= tol
            && (self.c - other.c).abs() <= tol
    }
}

impl Add for Position4D {
    type Output = Position4D;

    fn add(self, rhs: Position4D) -> Position4D {
        Position4D {
            x: self.x + rhs.x,
            y: self.y + rhs.y,
            z: self.z + rhs.z,
            c: self.c + rhs.c,
        }
    }
}

impl Sub for Position4D {
    type Output = Position4D;

    fn sub(self, rhs: Position4D) -> Position4D {
        Position4D {
            x: self.x - rhs.x,
            y: self.y - rhs.y,
            z: self.z - rhs.z,
            c: self.c - rhs.c,
        }
    }
}

impl fmt::Display for Position4D {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "X={:.3}mm Y={:.3}mm Z={:.3}° C={:.3}°",
            self.x, self.y, self.z, self.c
        )
    }
}

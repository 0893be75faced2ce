//! Core types and traits shared by every rust-scan crate.
//!
//! This crate defines the vocabulary of the scanner: 4DOF positions and axis
//! limits, the motion state model, scan points, camera and lighting settings,
//! the error taxonomy, the capability traits the orchestrator is polymorphic
//! over, and the resolved configuration object the whole system is constructed
//! from. Hardware crates depend on this crate; it depends on no hardware.

pub mod capabilities;
pub mod config;
pub mod error;
pub mod imaging;
pub mod lighting;
pub mod limits;
pub mod motion;
pub mod point;
pub mod position;

// Serial port abstractions for driver crates
pub mod serial;

pub use error::{ScanResult, ScannerError};
pub use position::{Axis, Position4D};

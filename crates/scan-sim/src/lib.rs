//! Simulated hardware for the test suite.
//!
//! [`firmware::SimFluidNc`] speaks the FluidNC wire protocol over an
//! in-process duplex stream, including auto-reports, homing message
//! sequences and injectable alarms. [`sensor::SimSensor`] implements the
//! camera backend seam with settling auto-exposure and failure injection.
//! [`leds::SimLeds`] records the LED timeline so tests can assert
//! flash/shutter ordering.

pub mod firmware;
pub mod leds;
pub mod sensor;

pub use firmware::{SimFluidNc, SimFirmwareConfig};
pub use leds::SimLeds;
pub use sensor::{SimSensor, SimSensorConfig};

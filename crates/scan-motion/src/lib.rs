//! Motion control for the 4DOF scanner.
//!
//! Three layers, leaves first:
//!
//! - [`link`]: byte-level framed duplex channel to the firmware: ordered
//!   single-writer line output, a dedicated reader task broadcasting framed
//!   lines, and bounded reconnect.
//! - [`protocol`] + [`monitor`]: the protocol state machine: pure frame
//!   parsing and the background task that turns the raw line stream into a
//!   consistent [`scan_core::motion::ControllerSnapshot`] under a single
//!   writer.
//! - [`controller`]: high-level operations (initialize, home, validated
//!   moves with wait-for-idle, unlock, emergency stop) implementing
//!   [`scan_core::capabilities::MotionControllable`].

pub mod controller;
pub mod link;
pub mod monitor;
pub mod protocol;

pub use controller::FluidNcController;
pub use link::{LinkEvent, PortFactory, SerialLink};

//! Hardware capability traits.
//!
//! The orchestrator is polymorphic over these seams: a motion driver
//! implements [`MotionControllable`], each sensor driver implements
//! [`StillCapture`], the flash array implements [`Flashable`]. Concrete
//! drivers live in their own crates; simulated implementations live in
//! `scan-sim`.
//!
//! Every trait:
//! - is async (`#[async_trait]`)
//! - is thread-safe (`Send + Sync`)
//! - takes `&self` and uses interior mutability for state
//! - returns `ScanResult` so callers can classify failures by taxonomy

use crate::error::ScanResult;
use crate::imaging::{CameraControls, CameraId, CameraMode, CapturedFrame, SensorMetadata};
use crate::lighting::FlashSettings;
use crate::motion::MotionState;
use crate::position::Position4D;
use async_trait::async_trait;
use bytes::Bytes;

/// Capability: 4DOF motion control.
///
/// # Contract
/// - `move_to`/`move_relative` validate against soft limits *before* any
///   bytes reach the wire and block until motion completes (wait-for-idle)
/// - `home` blocks until the homing cycle is confirmed complete and the Z
///   work offset has been reset
/// - `emergency_stop` is preemptive: it bypasses the command queue
#[async_trait]
pub trait MotionControllable: Send + Sync {
    /// Open the link, send the firmware init sequence, start the background
    /// status monitor. With `auto_unlock`, an alarm state at startup is
    /// cleared with `$X`; otherwise it is left for `unlock()` or homing.
    async fn initialize(&self, auto_unlock: bool) -> ScanResult<()>;

    /// Run the full homing cycle. Returns the verified home position.
    async fn home(&self) -> ScanResult<Position4D>;

    /// Absolute move. Returns the position read back after completion.
    async fn move_to(&self, target: Position4D, feedrate: Option<f64>) -> ScanResult<Position4D>;

    /// Relative move (`G91` / `G0` / `G90`). Returns the final position.
    async fn move_relative(&self, delta: Position4D, feedrate: Option<f64>)
        -> ScanResult<Position4D>;

    /// Feed-hold then soft-reset, immediately. All in-flight commands fail.
    async fn emergency_stop(&self) -> ScanResult<()>;

    /// Clear an alarm state with `$X`.
    async fn unlock(&self) -> ScanResult<()>;

    /// Current work-frame position from the latest snapshot.
    async fn position(&self) -> ScanResult<Position4D>;

    /// Current controller state from the latest snapshot.
    async fn status(&self) -> MotionState;

    fn is_connected(&self) -> bool;

    fn is_homed(&self) -> bool;

    /// Stop the monitor and close the link.
    async fn shutdown(&self) -> ScanResult<()>;
}

/// Capability: dual-mode still capture.
///
/// # Contract
/// - `set_mode` is serialized per sensor and respects the mode cool-down
/// - `capture_still` requires `Capturing` mode and returns pixels+metadata
/// - `grab_preview` never forces a mode switch; during a capture it serves
///   the cached last streaming frame
#[async_trait]
pub trait StillCapture: Send + Sync {
    fn id(&self) -> CameraId;

    /// Transition to the requested mode (no-op when already active and the
    /// cool-down has expired). Re-applies calibrated settings afterwards.
    async fn set_mode(&self, mode: CameraMode) -> ScanResult<()>;

    async fn capture_still(&self) -> ScanResult<CapturedFrame>;

    /// Latest preview JPEG/RGB frame from the streaming configuration.
    async fn grab_preview(&self) -> ScanResult<Bytes>;

    async fn set_controls(&self, controls: CameraControls) -> ScanResult<()>;

    async fn read_metadata(&self) -> ScanResult<SensorMetadata>;

    /// Run one bounded single-shot autofocus cycle and return the normalized
    /// lens position in [0, 1].
    async fn run_autofocus(&self) -> ScanResult<f32>;
}

/// Capability: zoned flash control.
///
/// # Contract
/// - `flash` asserts, holds and releases; zones are released on every exit
///   path including errors and cancellation
/// - `set_brightness` holds zones continuously (calibration lighting)
#[async_trait]
pub trait Flashable: Send + Sync {
    /// Configured zone names.
    fn zones(&self) -> Vec<String>;

    async fn flash(&self, zones: &[String], settings: &FlashSettings) -> ScanResult<()>;

    async fn set_brightness(&self, zones: &[String], brightness: f64) -> ScanResult<()>;

    async fn all_off(&self) -> ScanResult<()>;
}

//! The error taxonomy for the whole scanner.
//!
//! One enum covers every failure the core can produce, so the orchestrator
//! can classify an error (record-and-continue vs abort) without string
//! matching. Driver crates construct the variant that matches what actually
//! happened; `anyhow` is used only at the outermost binary boundary.

use crate::imaging::CameraId;
use thiserror::Error;

/// Convenience alias for results using the scanner error type.
pub type ScanResult<T> = std::result::Result<T, ScannerError>;

/// Camera error subcategory. Camera failures are isolated per sensor, so the
/// kind travels with the camera id in [`ScannerError::Camera`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraErrorKind {
    /// A still or preview grab failed or returned no pixels.
    Capture,
    /// Mode switch or control application failed.
    Configuration,
    /// Exposure/focus calibration failed.
    Calibration,
}

impl std::fmt::Display for CameraErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            CameraErrorKind::Capture => "capture",
            CameraErrorKind::Configuration => "configuration",
            CameraErrorKind::Calibration => "calibration",
        };
        write!(f, "{}", label)
    }
}

/// Primary error type for the scanner.
///
/// Variants map one-to-one onto the failure kinds the orchestrator's policy
/// table distinguishes. See [`ScannerError::is_recoverable`] for the
/// classification the scan loop applies per point.
#[derive(Error, Debug)]
pub enum ScannerError {
    /// A commanded position violates the safety-margined axis limits.
    ///
    /// Raised before any bytes are written to the wire and never retried.
    #[error("safety violation: {0}")]
    Safety(String),

    /// The firmware rejected a well-formed command with `error:<n>`.
    ///
    /// Usually fatal for the current operation; the numeric code is surfaced
    /// when the firmware provided one.
    #[error("firmware rejected command{}: {message}", .code.map(|c| format!(" (error:{})", c)).unwrap_or_default())]
    Protocol { code: Option<u8>, message: String },

    /// Serial I/O failed. Recoverable via bounded reconnect.
    #[error("serial link error: {0}")]
    Link(String),

    /// The firmware entered an alarm state. Requires unlock or homing.
    #[error("controller alarm{}", .code.map(|c| format!(" (ALARM:{})", c)).unwrap_or_default())]
    Alarm { code: Option<u8> },

    /// A bounded wait elapsed. Fatal to the current command.
    #[error("{operation} timed out after {elapsed_ms} ms")]
    Timeout { operation: String, elapsed_ms: u64 },

    /// Per-sensor camera failure; isolated to the named camera.
    #[error("camera {camera} {kind} error: {message}")]
    Camera {
        camera: CameraId,
        kind: CameraErrorKind,
        message: String,
    },

    /// Persistence failure. Non-fatal to capture; fatal only if checkpointing
    /// stays blocked.
    #[error("storage error: {0}")]
    Storage(String),

    /// The user cancelled the scan. Terminal.
    #[error("scan cancelled by user")]
    Cancelled,

    /// The emergency stop was engaged. Terminal; movement requires re-init.
    #[error("emergency stop engaged")]
    EmergencyStopped,

    /// A resolved configuration value failed semantic validation.
    #[error("configuration error: {0}")]
    Config(String),
}

impl ScannerError {
    /// Stable machine-readable kind label, persisted in scan error logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ScannerError::Safety(_) => "safety_violation",
            ScannerError::Protocol { .. } => "protocol_error",
            ScannerError::Link(_) => "link_error",
            ScannerError::Alarm { .. } => "alarm_state",
            ScannerError::Timeout { .. } => "timeout",
            ScannerError::Camera { .. } => "camera_error",
            ScannerError::Storage(_) => "storage_error",
            ScannerError::Cancelled => "cancelled",
            ScannerError::EmergencyStopped => "emergency_stopped",
            ScannerError::Config(_) => "config_error",
        }
    }

    /// Whether the scan loop may record this error and continue with the
    /// next point. Fatal kinds abort the scan.
    pub fn is_recoverable(&self) -> bool {
        match self {
            // Pre-send rejection: skip the point, keep scanning.
            ScannerError::Safety(_) => true,
            // Per-sensor and persistence failures are isolated.
            ScannerError::Camera { .. } | ScannerError::Storage(_) => true,
            // Link errors get a bounded reconnect before they become fatal.
            ScannerError::Link(_) => true,
            ScannerError::Protocol { .. }
            | ScannerError::Alarm { .. }
            | ScannerError::Timeout { .. }
            | ScannerError::Cancelled
            | ScannerError::EmergencyStopped
            | ScannerError::Config(_) => false,
        }
    }

    /// Shorthand constructor for link failures from any error value.
    pub fn link(err: impl std::fmt::Display) -> Self {
        ScannerError::Link(err.to_string())
    }

    /// Shorthand constructor for storage failures from any error value.
    pub fn storage(err: impl std::fmt::Display) -> Self {
        ScannerError::Storage(err.to_string())
    }

    /// Shorthand constructor for per-camera failures.
    pub fn camera(camera: CameraId, kind: CameraErrorKind, err: impl std::fmt::Display) -> Self {
        ScannerError::Camera {
            camera,
            kind,
            message: err.to_string(),
        }
    }
}

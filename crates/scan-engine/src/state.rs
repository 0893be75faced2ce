//! Scan state: status, phase, progress, timing, errors, persistence.
//!
//! The orchestrator exclusively owns the in-progress [`ScanState`];
//! observers get clones through the status API and events on the scan bus.
//! After every point the state is checkpointed as an atomic JSON snapshot so
//! a crashed run can be inspected or resumed from `last_successful_point`.

use chrono::{DateTime, Utc};
use scan_core::error::{ScanResult, ScannerError};
use scan_storage::atomic_write;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

/// Scan execution status. Exactly one terminal status per scan:
/// `Completed`, `Failed` or `Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    Idle,
    Initializing,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ScanStatus {
    /// True while the scan occupies the hardware (busy-gate states).
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ScanStatus::Initializing | ScanStatus::Running | ScanStatus::Paused
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ScanStatus::Completed | ScanStatus::Failed | ScanStatus::Cancelled
        )
    }
}

/// Current phase of the scanning operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanPhase {
    Setup,
    Homing,
    Positioning,
    Capturing,
    Processing,
    Cleanup,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ScanProgress {
    pub current_point: usize,
    pub total_points: usize,
    pub images_captured: usize,
    pub completion_percentage: f64,
}

/// Wall-clock bookkeeping with paused-time accumulation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanTiming {
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub pause_started: Option<DateTime<Utc>>,
    pub total_paused_secs: f64,
}

impl ScanTiming {
    pub fn start(&mut self) {
        self.start_time = Some(Utc::now());
    }

    pub fn pause(&mut self) {
        if self.pause_started.is_none() {
            self.pause_started = Some(Utc::now());
        }
    }

    pub fn resume(&mut self) {
        if let Some(started) = self.pause_started.take() {
            self.total_paused_secs += (Utc::now() - started).num_milliseconds() as f64 / 1000.0;
        }
    }

    pub fn complete(&mut self) {
        self.resume(); // a scan can end while paused
        self.end_time = Some(Utc::now());
    }

    /// Elapsed seconds excluding pauses.
    pub fn elapsed_secs(&self) -> f64 {
        let Some(start) = self.start_time else {
            return 0.0;
        };
        let end = self.end_time.unwrap_or_else(Utc::now);
        let mut paused = self.total_paused_secs;
        if let Some(pause_started) = self.pause_started {
            paused += (Utc::now() - pause_started).num_milliseconds() as f64 / 1000.0;
        }
        ((end - start).num_milliseconds() as f64 / 1000.0 - paused).max(0.0)
    }
}

/// One entry in the scan error log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanErrorRecord {
    pub timestamp: DateTime<Utc>,
    /// Stable kind label from [`ScannerError::kind`].
    pub error_type: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub point_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub camera_id: Option<u8>,
    pub recoverable: bool,
    /// Set when the condition cleared (e.g. a link that reconnected).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl ScanErrorRecord {
    pub fn from_error(err: &ScannerError, point_index: Option<usize>) -> Self {
        let camera_id = match err {
            ScannerError::Camera { camera, .. } => Some(camera.0),
            _ => None,
        };
        Self {
            timestamp: Utc::now(),
            error_type: err.kind().to_string(),
            message: err.to_string(),
            point_index,
            camera_id,
            recoverable: err.is_recoverable(),
            resolved_at: None,
        }
    }
}

/// The complete state of one scanning operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanState {
    pub scan_id: String,
    pub pattern_id: String,
    pub status: ScanStatus,
    pub phase: ScanPhase,
    pub progress: ScanProgress,
    pub timing: ScanTiming,
    pub errors: Vec<ScanErrorRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_successful_point: Option<usize>,
    pub parameters: serde_json::Value,
    pub output_dir: PathBuf,
}

impl ScanState {
    pub fn new(
        scan_id: impl Into<String>,
        pattern_id: impl Into<String>,
        total_points: usize,
        parameters: serde_json::Value,
        output_dir: PathBuf,
    ) -> Self {
        Self {
            scan_id: scan_id.into(),
            pattern_id: pattern_id.into(),
            status: ScanStatus::Idle,
            phase: ScanPhase::Setup,
            progress: ScanProgress {
                total_points,
                ..Default::default()
            },
            timing: ScanTiming::default(),
            errors: Vec::new(),
            last_successful_point: None,
            parameters,
            output_dir,
        }
    }

    pub fn record_error(&mut self, err: &ScannerError, point_index: Option<usize>) {
        let record = ScanErrorRecord::from_error(err, point_index);
        if record.recoverable {
            tracing::warn!(scan_id = %self.scan_id, error = %err, "recoverable scan error");
        } else {
            tracing::error!(scan_id = %self.scan_id, error = %err, "fatal scan error");
        }
        self.errors.push(record);
    }

    /// Progress update after a completed point.
    pub fn update_progress(&mut self, completed_point: usize, images_captured: usize) {
        self.progress.current_point = completed_point;
        self.progress.images_captured = images_captured;
        self.last_successful_point = Some(completed_point.saturating_sub(1));
        if self.progress.total_points > 0 {
            self.progress.completion_percentage =
                completed_point as f64 / self.progress.total_points as f64 * 100.0;
        }
    }

    pub fn state_file_path(&self) -> PathBuf {
        self.output_dir
            .join(format!("{}_state.json", self.scan_id))
    }

    /// Atomic JSON checkpoint.
    pub async fn save(&self) -> ScanResult<()> {
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| ScannerError::storage(format!("serialize scan state: {}", e)))?;
        atomic_write(&self.state_file_path(), &json).await
    }

    pub async fn load(path: &Path) -> ScanResult<Self> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| ScannerError::storage(format!("read {}: {}", path.display(), e)))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| ScannerError::storage(format!("parse {}: {}", path.display(), e)))
    }

    /// The point to resume from after a crash or failure.
    pub fn recovery_point(&self) -> Option<usize> {
        self.last_successful_point
    }

    pub fn complete(&mut self) {
        self.status = ScanStatus::Completed;
        self.phase = ScanPhase::Cleanup;
        self.timing.complete();
        self.progress.completion_percentage = 100.0;
        info!(scan_id = %self.scan_id, elapsed_secs = self.timing.elapsed_secs(),
              images = self.progress.images_captured, "scan completed");
    }

    pub fn fail(&mut self, err: &ScannerError) {
        self.record_error(err, None);
        self.status = ScanStatus::Failed;
        self.timing.complete();
    }

    pub fn cancel(&mut self) {
        self.status = ScanStatus::Cancelled;
        self.timing.complete();
        info!(scan_id = %self.scan_id, "scan cancelled");
    }
}

/// Events emitted on the scan bus.
#[derive(Debug, Clone)]
pub enum ScanEvent {
    StateChanged {
        scan_id: String,
        status: ScanStatus,
        phase: ScanPhase,
    },
    ProgressUpdated {
        scan_id: String,
        progress: ScanProgress,
    },
    ErrorOccurred {
        scan_id: String,
        record: ScanErrorRecord,
    },
    Completed {
        scan_id: String,
        status: ScanStatus,
        images: usize,
    },
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn state(dir: &Path) -> ScanState {
        ScanState::new(
            "scan_x",
            "grid_1",
            5,
            serde_json::json!({"quality": "medium"}),
            dir.to_path_buf(),
        )
    }

    #[tokio::test]
    async fn save_load_save_is_byte_stable() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = state(dir.path());
        s.status = ScanStatus::Running;
        s.timing.start();
        s.update_progress(2, 4);
        s.record_error(
            &ScannerError::storage("disk hiccup"),
            Some(1),
        );
        s.save().await.unwrap();
        let first = tokio::fs::read(s.state_file_path()).await.unwrap();

        let loaded = ScanState::load(&s.state_file_path()).await.unwrap();
        loaded.save().await.unwrap();
        let second = tokio::fs::read(s.state_file_path()).await.unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn progress_percentage() {
        let dir = std::env::temp_dir();
        let mut s = state(&dir);
        s.update_progress(2, 4);
        assert_eq!(s.progress.completion_percentage, 40.0);
        assert_eq!(s.last_successful_point, Some(1));
    }

    #[test]
    fn paused_time_excluded_from_elapsed() {
        let mut timing = ScanTiming::default();
        timing.start_time = Some(Utc::now() - chrono::Duration::seconds(10));
        timing.total_paused_secs = 4.0;
        let elapsed = timing.elapsed_secs();
        assert!((5.0..7.0).contains(&elapsed), "elapsed was {}", elapsed);
    }

    #[test]
    fn terminal_states() {
        assert!(ScanStatus::Completed.is_terminal());
        assert!(ScanStatus::Failed.is_terminal());
        assert!(!ScanStatus::Paused.is_terminal());
        assert!(ScanStatus::Paused.is_active());
    }

    #[test]
    fn camera_error_record_carries_camera_id() {
        let err = ScannerError::camera(
            scan_core::imaging::CameraId(1),
            scan_core::error::CameraErrorKind::Capture,
            "empty pixels",
        );
        let record = ScanErrorRecord::from_error(&err, Some(2));
        assert_eq!(record.error_type, "camera_error");
        assert_eq!(record.camera_id, Some(1));
        assert_eq!(record.point_index, Some(2));
        assert!(record.recoverable);
    }
}

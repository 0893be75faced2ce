//! Dual-mode camera sensor driver.
//!
//! Each sensor runs in one of two configurations: a low-latency streaming
//! mode for live preview and a full-resolution capture mode for stills. Mode
//! transitions are expensive on the camera stack (the ISP buffer pool must
//! drain before a high-resolution reconfiguration), so transitions are
//! serialized under a per-sensor lock, rate-limited by a cool-down, and
//! always follow the same sequence: stop, drain, configure, start, re-apply
//! calibrated settings, verify.

use crate::calibration::CalibrationStore;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use scan_core::capabilities::StillCapture;
use scan_core::config::CameraConfig;
use scan_core::error::{CameraErrorKind, ScanResult, ScannerError};
use scan_core::imaging::{
    CameraControls, CameraId, CameraMode, CapturedFrame, SensorMetadata,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Buffer-drain pause after stopping the sensor, before reconfiguring.
/// Capture mode allocates the large ISP buffers and needs the longer drain.
const DRAIN_PAUSE_CAPTURE: Duration = Duration::from_millis(300);
const DRAIN_PAUSE_STREAMING: Duration = Duration::from_millis(100);
/// Settle time after re-applying calibrated controls before verification.
const REAPPLY_SETTLE: Duration = Duration::from_millis(200);

/// Configuration handed to the backend on a mode switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorModeConfig {
    pub mode: CameraMode,
    pub width: u32,
    pub height: u32,
    /// Buffer count; capture mode uses 1 to avoid ISP pool exhaustion.
    pub buffer_count: u8,
    /// Whether a RAW stream may be attached (never in capture mode).
    pub raw_enabled: bool,
}

/// The hardware seam below [`CameraSensor`].
///
/// Real hardware binds the camera stack here; `scan-sim` provides the
/// simulated implementation used by the test suite.
#[async_trait]
pub trait SensorBackend: Send + Sync {
    async fn stop(&self) -> anyhow::Result<()>;
    async fn configure(&self, config: &SensorModeConfig) -> anyhow::Result<()>;
    async fn start(&self) -> anyhow::Result<()>;
    async fn set_controls(&self, controls: &CameraControls) -> anyhow::Result<()>;
    async fn read_metadata(&self) -> anyhow::Result<SensorMetadata>;
    /// Grab the latest frame from the streaming configuration.
    async fn grab_frame(&self) -> anyhow::Result<Bytes>;
    /// Capture one full-resolution still: pixels, width, height, metadata.
    async fn capture_frame(&self) -> anyhow::Result<(Bytes, u32, u32, SensorMetadata)>;
    /// One single-shot autofocus sweep; returns the normalized lens position.
    async fn run_autofocus(&self) -> anyhow::Result<f32>;
}

struct ModeState {
    current: CameraMode,
    last_switch: Option<Instant>,
}

/// One physical sensor with its mode state machine.
pub struct CameraSensor {
    id: CameraId,
    backend: Arc<dyn SensorBackend>,
    config: CameraConfig,
    store: Arc<CalibrationStore>,
    mode: Mutex<ModeState>,
    /// Last streaming frame, served while a capture is in progress.
    preview_cache: RwLock<Option<Bytes>>,
    capturing: AtomicBool,
}

impl CameraSensor {
    pub fn new(
        config: CameraConfig,
        backend: Arc<dyn SensorBackend>,
        store: Arc<CalibrationStore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: CameraId(config.id),
            backend,
            config,
            store,
            mode: Mutex::new(ModeState {
                current: CameraMode::Streaming,
                last_switch: None,
            }),
            preview_cache: RwLock::new(None),
            capturing: AtomicBool::new(false),
        })
    }

    fn mode_config(&self, mode: CameraMode) -> SensorModeConfig {
        match mode {
            CameraMode::Streaming => SensorModeConfig {
                mode,
                width: self.config.stream_resolution.width,
                height: self.config.stream_resolution.height,
                buffer_count: 4,
                raw_enabled: false,
            },
            CameraMode::Capturing => SensorModeConfig {
                mode,
                width: self.config.capture_resolution.width,
                height: self.config.capture_resolution.height,
                buffer_count: 1,
                raw_enabled: false,
            },
        }
    }

    fn cam_err(&self, kind: CameraErrorKind, err: impl std::fmt::Display) -> ScannerError {
        ScannerError::camera(self.id, kind, err)
    }

    /// The switch sequence, called with the mode lock held.
    async fn switch_locked(&self, state: &mut ModeState, target: CameraMode) -> ScanResult<()> {
        // Cool-down: a switch inside the window blocks until it expires
        if let Some(last) = state.last_switch {
            let cooldown = Duration::from_millis(self.config.mode_switch_cooldown_ms);
            let since = last.elapsed();
            if since < cooldown {
                debug!(camera = %self.id, remaining_ms = (cooldown - since).as_millis() as u64,
                       "mode switch inside cool-down; waiting");
                tokio::time::sleep(cooldown - since).await;
            }
        }

        // Snapshot calibrated settings before the stop: some camera stacks
        // forget controls across a reconfigure
        let calibrated = self.store.snapshot(self.id);

        self.backend
            .stop()
            .await
            .map_err(|e| self.cam_err(CameraErrorKind::Configuration, e))?;
        let drain = match target {
            CameraMode::Capturing => DRAIN_PAUSE_CAPTURE,
            CameraMode::Streaming => DRAIN_PAUSE_STREAMING,
        };
        tokio::time::sleep(drain).await;

        let mode_config = self.mode_config(target);
        self.backend
            .configure(&mode_config)
            .await
            .map_err(|e| self.cam_err(CameraErrorKind::Configuration, e))?;
        self.backend
            .start()
            .await
            .map_err(|e| self.cam_err(CameraErrorKind::Configuration, e))?;

        if calibrated.is_some() {
            let locked = self.store.apply_and_verify(self).await?;
            if !locked {
                warn!(camera = %self.id, "calibrated settings drifted beyond tolerance after reconfigure");
            }
        } else if target == CameraMode::Streaming {
            // No calibration yet: streaming runs fully automatic
            self.backend
                .set_controls(&CameraControls::automatic())
                .await
                .map_err(|e| self.cam_err(CameraErrorKind::Configuration, e))?;
        }

        state.current = target;
        state.last_switch = Some(Instant::now());
        info!(camera = %self.id, mode = ?target, "sensor mode switched");
        Ok(())
    }

    /// Current mode (for status reporting).
    pub async fn mode(&self) -> CameraMode {
        self.mode.lock().await.current
    }

    /// The calibration store shared with the calibrator.
    pub fn calibration_store(&self) -> Arc<CalibrationStore> {
        Arc::clone(&self.store)
    }

    /// Settle time the calibrator waits after re-applying controls.
    pub(crate) fn reapply_settle() -> Duration {
        REAPPLY_SETTLE
    }
}

#[async_trait]
impl StillCapture for CameraSensor {
    fn id(&self) -> CameraId {
        self.id
    }

    #[instrument(skip(self), fields(camera = %self.id), err)]
    async fn set_mode(&self, mode: CameraMode) -> ScanResult<()> {
        let mut state = self.mode.lock().await;
        if state.current == mode {
            return Ok(());
        }
        self.switch_locked(&mut state, mode).await
    }

    #[instrument(skip(self), fields(camera = %self.id), err)]
    async fn capture_still(&self) -> ScanResult<CapturedFrame> {
        self.set_mode(CameraMode::Capturing).await?;

        self.capturing.store(true, Ordering::Release);
        let result = self.backend.capture_frame().await;
        self.capturing.store(false, Ordering::Release);

        let (pixels, width, height, metadata) =
            result.map_err(|e| self.cam_err(CameraErrorKind::Capture, e))?;
        if pixels.is_empty() {
            return Err(self.cam_err(CameraErrorKind::Capture, "capture returned no pixels"));
        }

        Ok(CapturedFrame {
            camera: self.id,
            pixels,
            width,
            height,
            metadata,
            captured_at: Utc::now(),
        })
    }

    async fn grab_preview(&self) -> ScanResult<Bytes> {
        // Never switch modes for a preview; during a capture the cached last
        // streaming frame is served to avoid mode thrash
        if self.capturing.load(Ordering::Acquire)
            || self.mode.lock().await.current == CameraMode::Capturing
        {
            return self
                .preview_cache
                .read()
                .await
                .clone()
                .ok_or_else(|| {
                    self.cam_err(CameraErrorKind::Capture, "no cached preview during capture")
                });
        }

        let frame = self
            .backend
            .grab_frame()
            .await
            .map_err(|e| self.cam_err(CameraErrorKind::Capture, e))?;
        *self.preview_cache.write().await = Some(frame.clone());
        Ok(frame)
    }

    async fn set_controls(&self, controls: CameraControls) -> ScanResult<()> {
        self.backend
            .set_controls(&controls)
            .await
            .map_err(|e| self.cam_err(CameraErrorKind::Configuration, e))
    }

    async fn read_metadata(&self) -> ScanResult<SensorMetadata> {
        self.backend
            .read_metadata()
            .await
            .map_err(|e| self.cam_err(CameraErrorKind::Configuration, e))
    }

    #[instrument(skip(self), fields(camera = %self.id), err)]
    async fn run_autofocus(&self) -> ScanResult<f32> {
        self.backend
            .run_autofocus()
            .await
            .map_err(|e| self.cam_err(CameraErrorKind::Calibration, e))
    }
}

//! The scan orchestrator.
//!
//! Owns the whole scan sequence: busy-gating, homing, first-point
//! calibration, the per-point move/settle/flash/capture/persist pipeline,
//! pause/resume/stop/emergency handling, and the failure policy that decides
//! per error whether to record-and-continue or abort.
//!
//! Ordering guarantees enforced here: within a point, move-complete happens
//! before flash-assert, all captures complete before persistence starts, and
//! persistence completes before the progress update; point N+1 never begins
//! until point N's progress update is committed.

use crate::profiles::{ExposureMode, QualityProfile, ScanProfiles, SpeedProfile};
use crate::state::{ScanErrorRecord, ScanEvent, ScanPhase, ScanState, ScanStatus};
use chrono::Utc;
use scan_camera::calibration::{Calibrator, SyncMode};
use scan_core::capabilities::{Flashable, MotionControllable, StillCapture};
use scan_core::config::ScannerConfig;
use scan_core::error::{CameraErrorKind, ScanResult, ScannerError};
use scan_core::imaging::{CalibrationSource, CameraControls, CapturedFrame};
use scan_core::lighting::{FlashSettings, LightingRecord};
use scan_core::motion::MotionState;
use scan_core::point::ScanPoint;
use scan_lighting::FlashArray;
use scan_motion::monitor::MotionEvent;
use scan_patterns::ScanPattern;
use scan_storage::{
    exif::ExifInfo, exposure_string, CameraSettingsRecord, ExifSubset, PositionsFile,
    SessionStorage, StoredFrameMetadata,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

/// Bounded wait while paused before the scan gives up.
const PAUSE_TIMEOUT: Duration = Duration::from_secs(30);
/// How long to wait for a dropped link to recover mid-scan.
const LINK_RECOVERY_TIMEOUT: Duration = Duration::from_secs(2);
/// Stagger before each sequential fallback capture, giving the other
/// sensor's ISP pipeline time to drain.
const SEQUENTIAL_RETRY_STAGGER: Duration = Duration::from_millis(150);
/// Base feedrate scaled by the speed profile.
const BASE_FEEDRATE: f64 = 1000.0;

/// Inputs to one scan.
pub struct ScanOptions {
    pub pattern: Arc<dyn ScanPattern>,
    pub scan_id: Option<String>,
    /// Session root; defaults to the configured output root.
    pub output_root: Option<PathBuf>,
    pub parameters: serde_json::Value,
    /// Default is to home; skipping emits a warning but is honored.
    pub homing_confirmed: bool,
    pub sync_mode: SyncMode,
}

#[derive(Clone)]
struct ActiveProfiles {
    quality: QualityProfile,
    speed: SpeedProfile,
}

#[derive(Default)]
struct ScanSignals {
    pause: AtomicBool,
    stop: AtomicBool,
    emergency: AtomicBool,
    homing: AtomicBool,
}

/// Top-level coordinator over motion, cameras, lighting and storage.
pub struct ScanOrchestrator {
    motion: Arc<dyn MotionControllable>,
    cameras: Vec<Arc<dyn StillCapture>>,
    flash: Option<Arc<FlashArray>>,
    calibrator: Arc<Calibrator>,
    config: ScannerConfig,
    profiles: Mutex<ActiveProfiles>,
    current_scan: Arc<Mutex<Option<ScanState>>>,
    signals: Arc<ScanSignals>,
    events: broadcast::Sender<ScanEvent>,
    scan_task: Mutex<Option<JoinHandle<()>>>,
    /// Errors observed outside any scan (link drops during idle, etc.).
    system_errors: Arc<Mutex<Vec<ScanErrorRecord>>>,
}

impl ScanOrchestrator {
    pub fn new(
        config: ScannerConfig,
        motion: Arc<dyn MotionControllable>,
        cameras: Vec<Arc<dyn StillCapture>>,
        flash: Option<Arc<FlashArray>>,
        calibrator: Arc<Calibrator>,
    ) -> ScanResult<Arc<Self>> {
        let quality = ScanProfiles::quality(&config.scanning.quality_profile)?;
        let speed = ScanProfiles::speed(&config.scanning.speed_profile)?;
        let (events, _) = broadcast::channel(256);
        Ok(Arc::new(Self {
            motion,
            cameras,
            flash,
            calibrator,
            config,
            profiles: Mutex::new(ActiveProfiles { quality, speed }),
            current_scan: Arc::new(Mutex::new(None)),
            signals: Arc::new(ScanSignals::default()),
            events,
            scan_task: Mutex::new(None),
            system_errors: Arc::new(Mutex::new(Vec::new())),
        }))
    }

    /// Bring up motion and verify every subsystem responds.
    #[instrument(skip(self), err)]
    pub async fn initialize(&self) -> ScanResult<()> {
        self.motion.initialize(false).await?;
        self.health_check().await
    }

    async fn health_check(&self) -> ScanResult<()> {
        for cam in &self.cameras {
            cam.read_metadata().await?;
        }
        if let Some(flash) = &self.flash {
            flash.all_off().await?;
        }
        info!(cameras = self.cameras.len(), "health check passed");
        Ok(())
    }

    /// Subscribe to scan events.
    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.events.subscribe()
    }

    /// Record link drops/recoveries into the error log, resolving the drop
    /// entry when the link comes back.
    pub fn watch_motion_events(self: &Arc<Self>, mut rx: broadcast::Receiver<MotionEvent>) {
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(MotionEvent::LinkDropped) => {
                        let record = ScanErrorRecord::from_error(
                            &ScannerError::Link("serial link dropped".into()),
                            None,
                        );
                        let mut scan = orchestrator.current_scan.lock().await;
                        match scan.as_mut() {
                            Some(state) if state.status.is_active() => {
                                state.errors.push(record)
                            }
                            _ => orchestrator.system_errors.lock().await.push(record),
                        }
                    }
                    Ok(MotionEvent::LinkRecovered) => {
                        let resolve = |errors: &mut Vec<ScanErrorRecord>| {
                            if let Some(entry) = errors
                                .iter_mut()
                                .rev()
                                .find(|e| e.error_type == "link_error" && e.resolved_at.is_none())
                            {
                                entry.resolved_at = Some(Utc::now());
                            }
                        };
                        let mut scan = orchestrator.current_scan.lock().await;
                        match scan.as_mut() {
                            Some(state) if state.status.is_active() => resolve(&mut state.errors),
                            _ => resolve(&mut *orchestrator.system_errors.lock().await),
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// Errors observed outside any scan.
    pub async fn system_errors(&self) -> Vec<ScanErrorRecord> {
        self.system_errors.lock().await.clone()
    }

    /// Resolve named profiles onto the upcoming scan.
    pub async fn apply_profiles(&self, quality: &str, speed: &str) -> ScanResult<()> {
        let quality = ScanProfiles::quality(quality)?;
        let speed = ScanProfiles::speed(speed)?;

        // A manual-exposure profile is pushed to the hardware immediately
        if quality.exposure_mode == ExposureMode::Manual {
            if let Some(exposure_us) = quality.exposure_time_us {
                let controls =
                    CameraControls::locked(exposure_us, quality.analogue_gain.unwrap_or(1.0));
                for cam in &self.cameras {
                    cam.set_controls(controls).await?;
                }
            }
        }

        info!(quality = %quality.name, speed = %speed.name, "profiles applied");
        *self.profiles.lock().await = ActiveProfiles { quality, speed };
        Ok(())
    }

    /// Apply fully custom quality/speed settings instead of named presets.
    pub async fn apply_custom_profiles(&self, quality: QualityProfile, speed: SpeedProfile) {
        info!(quality = %quality.name, speed = %speed.name, "custom profiles applied");
        *self.profiles.lock().await = ActiveProfiles { quality, speed };
    }

    /// The single authoritative gate against concurrent scans.
    pub async fn is_busy(&self) -> bool {
        if let Some(state) = self.current_scan.lock().await.as_ref() {
            if state.status.is_active() {
                return true;
            }
        }
        if self.signals.homing.load(Ordering::Acquire) {
            return true;
        }
        matches!(
            self.motion.status().await,
            MotionState::Homing | MotionState::Hold
        )
    }

    /// Validate, set up, and launch a scan. Returns the initial state.
    #[instrument(skip(self, options), err)]
    pub async fn start_scan(self: &Arc<Self>, options: ScanOptions) -> ScanResult<ScanState> {
        if self.is_busy().await {
            return Err(ScannerError::Config(
                "scanner is busy: a scan or homing cycle is in progress".into(),
            ));
        }

        let points = options
            .pattern
            .generate_points(&self.config.motion.limits);
        if points.is_empty() {
            return Err(ScannerError::Config(
                "pattern generated no valid scan points".into(),
            ));
        }

        let scan_id = options
            .scan_id
            .clone()
            .unwrap_or_else(|| format!("scan_{}", uuid::Uuid::new_v4().simple()));
        let root = options
            .output_root
            .clone()
            .unwrap_or_else(|| self.config.scanning.output_root.clone());
        let session_dir = root.join(&scan_id);

        let state = ScanState::new(
            &scan_id,
            options.pattern.pattern_id(),
            points.len(),
            options.parameters.clone(),
            session_dir,
        );
        {
            let mut current = self.current_scan.lock().await;
            let mut state = state.clone();
            state.status = ScanStatus::Initializing;
            *current = Some(state);
        }

        self.signals.pause.store(false, Ordering::Release);
        self.signals.stop.store(false, Ordering::Release);
        self.signals.emergency.store(false, Ordering::Release);

        let orchestrator = Arc::clone(self);
        let handle = tokio::spawn(async move {
            orchestrator.execute(options, points, root, scan_id).await;
        });
        *self.scan_task.lock().await = Some(handle);

        Ok(self
            .current_scan
            .lock()
            .await
            .clone()
            .unwrap_or(state))
    }

    pub async fn pause_scan(&self) -> ScanResult<()> {
        let scan = self.current_scan.lock().await;
        match scan.as_ref().map(|s| s.status) {
            Some(ScanStatus::Running) => {
                self.signals.pause.store(true, Ordering::Release);
                info!("pause requested");
                Ok(())
            }
            other => Err(ScannerError::Config(format!(
                "cannot pause scan in state {:?}",
                other
            ))),
        }
    }

    pub async fn resume_scan(&self) -> ScanResult<()> {
        self.signals.pause.store(false, Ordering::Release);
        info!("resume requested");
        Ok(())
    }

    /// Cooperative stop: honored at the next yield point.
    pub async fn stop_scan(&self) -> ScanResult<()> {
        self.signals.stop.store(true, Ordering::Release);
        self.signals.pause.store(false, Ordering::Release);
        info!("stop requested");
        Ok(())
    }

    /// Preemptive stop: feed-hold hits the wire immediately.
    #[instrument(skip(self), err)]
    pub async fn emergency_stop(&self) -> ScanResult<()> {
        self.signals.emergency.store(true, Ordering::Release);
        self.signals.pause.store(false, Ordering::Release);
        let result = self.motion.emergency_stop().await;
        if let Some(flash) = &self.flash {
            let _ = flash.all_off().await;
        }
        result
    }

    pub async fn get_scan_status(&self) -> Option<ScanState> {
        self.current_scan.lock().await.clone()
    }

    /// Block until the current scan reaches a terminal status.
    pub async fn wait_for_completion(&self, timeout: Duration) -> ScanResult<ScanState> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(state) = self.get_scan_status().await {
                if state.status.is_terminal() {
                    return Ok(state);
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ScannerError::Timeout {
                    operation: "scan completion".into(),
                    elapsed_ms: timeout.as_millis() as u64,
                });
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    // =========================================================================
    // Execution
    // =========================================================================

    async fn with_state<R>(&self, f: impl FnOnce(&mut ScanState) -> R) -> Option<R> {
        self.current_scan.lock().await.as_mut().map(f)
    }

    async fn persist_state(&self) {
        let snapshot = self.current_scan.lock().await.clone();
        if let Some(state) = snapshot {
            if let Err(e) = state.save().await {
                warn!(error = %e, "state checkpoint failed; continuing in memory");
            }
        }
    }

    async fn set_status(&self, status: ScanStatus) {
        let event = self
            .with_state(|state| {
                state.status = status;
                ScanEvent::StateChanged {
                    scan_id: state.scan_id.clone(),
                    status,
                    phase: state.phase,
                }
            })
            .await;
        if let Some(event) = event {
            let _ = self.events.send(event);
        }
    }

    async fn set_phase(&self, phase: ScanPhase) {
        let event = self
            .with_state(|state| {
                state.phase = phase;
                ScanEvent::StateChanged {
                    scan_id: state.scan_id.clone(),
                    status: state.status,
                    phase,
                }
            })
            .await;
        if let Some(event) = event {
            let _ = self.events.send(event);
        }
    }

    async fn record_error(&self, err: &ScannerError, point_index: Option<usize>) {
        let event = self
            .with_state(|state| {
                state.record_error(err, point_index);
                state.errors.last().cloned().map(|record| ScanEvent::ErrorOccurred {
                    scan_id: state.scan_id.clone(),
                    record,
                })
            })
            .await
            .flatten();
        if let Some(event) = event {
            let _ = self.events.send(event);
        }
    }

    fn cancelled(&self) -> bool {
        self.signals.stop.load(Ordering::Acquire) || self.signals.emergency.load(Ordering::Acquire)
    }

    /// Abort the scan: record, mark failed, try to bring motion to a safe
    /// stop, persist what we have.
    async fn fail_scan(&self, err: ScannerError) {
        warn!(error = %err, "scan failed");
        let attempt_estop = matches!(
            err,
            ScannerError::Timeout { .. } | ScannerError::Alarm { .. }
        );
        self.with_state(|state| state.fail(&err)).await;
        if attempt_estop {
            if let Err(e) = self.motion.emergency_stop().await {
                warn!(error = %e, "emergency stop after failure also failed");
            }
        }
        self.persist_state().await;
    }

    /// Pause gate, checked before the move and before the capture of every
    /// point. Returns false when the scan should stop instead of proceeding.
    async fn pause_gate(&self) -> bool {
        if !self.signals.pause.load(Ordering::Acquire) {
            return !self.cancelled();
        }

        self.with_state(|state| state.timing.pause()).await;
        self.set_status(ScanStatus::Paused).await;
        self.persist_state().await;
        info!("scan paused");

        let deadline = tokio::time::Instant::now() + PAUSE_TIMEOUT;
        loop {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if self.cancelled() {
                return false;
            }
            if !self.signals.pause.load(Ordering::Acquire) {
                self.with_state(|state| state.timing.resume()).await;
                self.set_status(ScanStatus::Running).await;
                info!("scan resumed");
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                // A scan left paused past the bound is abandoned rather than
                // left holding the hardware indefinitely
                warn!("pause exceeded {:?}; cancelling scan", PAUSE_TIMEOUT);
                self.record_error(
                    &ScannerError::Timeout {
                        operation: "paused scan".into(),
                        elapsed_ms: PAUSE_TIMEOUT.as_millis() as u64,
                    },
                    None,
                )
                .await;
                self.signals.stop.store(true, Ordering::Release);
                return false;
            }
        }
    }

    async fn execute(
        self: Arc<Self>,
        options: ScanOptions,
        points: Vec<ScanPoint>,
        root: PathBuf,
        scan_id: String,
    ) {
        let profiles = self.profiles.lock().await.clone();

        // Storage session (attaches to an existing directory of the same id)
        let session_meta = serde_json::json!({
            "pattern_type": options.pattern.pattern_type().as_str(),
            "pattern_id": options.pattern.pattern_id(),
            "quality_profile": profiles.quality.name,
            "speed_profile": profiles.speed.name,
        });
        let storage = match SessionStorage::create(&root, &scan_id, session_meta).await {
            Ok(storage) => Arc::new(storage),
            Err(e) => {
                self.fail_scan(e).await;
                return;
            }
        };

        // Planning-stage positions file
        let planning_record = CameraSettingsRecord::planning_defaults(
            [
                profiles.quality.resolution.width,
                profiles.quality.resolution.height,
            ],
            profiles.quality.jpeg_quality,
        );
        let mut positions = PositionsFile::generate(
            &scan_id,
            options.pattern.pattern_type().as_str(),
            options.pattern.pattern_id(),
            options.pattern.parameters_json(),
            &points,
            planning_record,
        );
        if let Err(e) = positions.write(storage.session_dir()).await {
            self.record_error(&e, None).await;
        }

        self.set_status(ScanStatus::Running).await;
        self.with_state(|state| state.timing.start()).await;
        self.persist_state().await;

        // Cameras into scanning mode; per-sensor failures are isolated
        for cam in &self.cameras {
            if let Err(e) = cam.set_mode(scan_core::imaging::CameraMode::Capturing).await {
                self.record_error(&e, None).await;
            }
        }

        // Homing
        self.set_phase(ScanPhase::Homing).await;
        if options.homing_confirmed {
            self.signals.homing.store(true, Ordering::Release);
            let homed = self.motion.home().await;
            self.signals.homing.store(false, Ordering::Release);
            if let Err(e) = homed {
                self.fail_scan(e).await;
                self.cleanup(&storage).await;
                self.write_report(&storage, 0.0, 0.0).await;
                return;
            }
        } else {
            warn!("homing skipped by request; positions may be inaccurate");
        }

        // Point loop
        let mut images_total = 0usize;
        let mut aborted = false;
        let mut movement_secs = 0.0f64;
        let mut capture_secs = 0.0f64;
        for (index, point) in points.iter().enumerate() {
            if !self.pause_gate().await {
                aborted = true;
                break;
            }

            // Move and wait
            self.set_phase(ScanPhase::Positioning).await;
            let feedrate = BASE_FEEDRATE * profiles.speed.feedrate_multiplier;
            let move_started = tokio::time::Instant::now();
            match self.move_with_recovery(point, feedrate).await {
                Ok(()) => {}
                Err(e @ ScannerError::Safety(_)) => {
                    // Out-of-limits pre-send: skip the point, keep scanning
                    self.record_error(&e, Some(index)).await;
                    continue;
                }
                Err(e) => {
                    self.fail_scan(e).await;
                    self.cleanup(&storage).await;
                    self.write_report(&storage, movement_secs, capture_secs).await;
                    return;
                }
            }
            movement_secs += move_started.elapsed().as_secs_f64();

            // First point only: freeze exposure and focus, then rewrite the
            // positions file with what the scan will actually use
            if index == 0 {
                self.set_phase(ScanPhase::Processing).await;
                self.calibrate_at_first_point(&mut positions, &storage, &profiles, options.sync_mode)
                    .await;
            }

            // Post-move settling, then the point's own dwell
            let settle = Duration::from_secs_f64(
                profiles.speed.settling_delay_secs.max(0.0)
                    + profiles.speed.capture_delay_secs.max(0.0)
                    + self.config.scanning.stabilization_delay_secs.max(0.0),
            );
            tokio::time::sleep(settle).await;
            if point.dwell_ms > 0 {
                tokio::time::sleep(Duration::from_millis(point.dwell_ms)).await;
            }

            if !self.pause_gate().await {
                aborted = true;
                break;
            }

            // Capture and persist
            self.set_phase(ScanPhase::Capturing).await;
            if let Some(controls) = point.camera_override {
                for cam in &self.cameras {
                    if let Err(e) = cam.set_controls(controls).await {
                        self.record_error(&e, Some(index)).await;
                    }
                }
            }
            let capture_started = tokio::time::Instant::now();
            for shot in 0..point.capture_count {
                images_total += self
                    .capture_and_persist(point, index, shot, &storage, &profiles)
                    .await;
            }
            capture_secs += capture_started.elapsed().as_secs_f64();

            // Commit progress before the next point may begin
            self.with_state(|state| state.update_progress(index + 1, images_total))
                .await;
            self.persist_state().await;
            let event = self
                .with_state(|state| ScanEvent::ProgressUpdated {
                    scan_id: state.scan_id.clone(),
                    progress: state.progress,
                })
                .await;
            if let Some(event) = event {
                let _ = self.events.send(event);
            }
            debug!(point = index + 1, total = points.len(), "point complete");
        }

        // Restore hardware and close the session before the terminal status
        // is published, so observers of a finished scan see finished files
        self.cleanup(&storage).await;

        if self.signals.emergency.load(Ordering::Acquire) {
            self.with_state(|state| {
                state.record_error(&ScannerError::EmergencyStopped, None);
                state.status = ScanStatus::Failed;
                state.timing.complete();
            })
            .await;
        } else if aborted || self.signals.stop.load(Ordering::Acquire) {
            self.with_state(|state| state.cancel()).await;
        } else {
            self.with_state(|state| state.complete()).await;
        }
        self.persist_state().await;
        self.write_report(&storage, movement_secs, capture_secs).await;

        let event = self
            .with_state(|state| ScanEvent::Completed {
                scan_id: state.scan_id.clone(),
                status: state.status,
                images: state.progress.images_captured,
            })
            .await;
        if let Some(event) = event {
            let _ = self.events.send(event);
        }
    }

    /// Final JSON report summarizing the run, next to the state snapshot.
    async fn write_report(&self, storage: &SessionStorage, movement_secs: f64, capture_secs: f64) {
        let Some(state) = self.current_scan.lock().await.clone() else {
            return;
        };
        let report = serde_json::json!({
            "scan_id": state.scan_id,
            "pattern_id": state.pattern_id,
            "status": state.status,
            "points_completed": state.progress.current_point,
            "total_points": state.progress.total_points,
            "images_captured": state.progress.images_captured,
            "errors": state.errors.len(),
            "elapsed_secs": state.timing.elapsed_secs(),
            "paused_secs": state.timing.total_paused_secs,
            "timing_stats": {
                "movement_secs": movement_secs,
                "capture_secs": capture_secs,
            },
        });
        let path = storage
            .session_dir()
            .join(format!("{}_report.json", state.scan_id));
        match serde_json::to_vec_pretty(&report) {
            Ok(bytes) => {
                if let Err(e) = scan_storage::atomic_write(&path, &bytes).await {
                    warn!(error = %e, "scan report write failed");
                }
            }
            Err(e) => warn!(error = %e, "scan report serialization failed"),
        }
    }

    /// One absolute move with the link-loss recovery policy: wait for the
    /// bounded reconnect, reverify the position, and only then retry the
    /// movement once.
    async fn move_with_recovery(&self, point: &ScanPoint, feedrate: f64) -> ScanResult<()> {
        match self.motion.move_to(point.position, Some(feedrate)).await {
            Ok(_) => Ok(()),
            Err(ScannerError::Link(reason)) => {
                warn!(reason = %reason, "link error during move; waiting for recovery");
                let deadline = tokio::time::Instant::now() + LINK_RECOVERY_TIMEOUT;
                while !self.motion.is_connected() {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(ScannerError::Link(format!(
                            "link did not recover within {:?}: {}",
                            LINK_RECOVERY_TIMEOUT, reason
                        )));
                    }
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                // Never re-send a movement without knowing where the machine
                // actually is
                let position = self.motion.position().await?;
                if position.approx_eq(&point.position, 0.1) {
                    info!("move had completed before the link dropped");
                    return Ok(());
                }
                self.motion
                    .move_to(point.position, Some(feedrate))
                    .await
                    .map(|_| ())
            }
            Err(other) => Err(other),
        }
    }

    async fn calibrate_at_first_point(
        &self,
        positions: &mut PositionsFile,
        storage: &SessionStorage,
        profiles: &ActiveProfiles,
        sync_mode: SyncMode,
    ) {
        info!(?sync_mode, "calibrating exposure and focus at first scan point");
        let results = self.calibrator.calibrate_all(&self.cameras, sync_mode).await;

        let mut calibrated_record = None;
        for (camera, result) in results {
            match result {
                Ok(settings) if calibrated_record.is_none() => {
                    calibrated_record = Some(CameraSettingsRecord::from_calibrated(
                        &settings,
                        [
                            profiles.quality.resolution.width,
                            profiles.quality.resolution.height,
                        ],
                        profiles.quality.jpeg_quality,
                    ));
                }
                Ok(_) => {}
                Err(e) => {
                    // Safe defaults: mid-range focus, automatic exposure;
                    // the recorded error flags the session metadata
                    self.record_error(&e, Some(0)).await;
                    let fallback = CameraControls {
                        focus_value: Some(0.5),
                        ..CameraControls::automatic()
                    };
                    if let Some(cam) = self.cameras.iter().find(|c| c.id() == camera) {
                        if let Err(apply_err) = cam.set_controls(fallback).await {
                            self.record_error(&apply_err, Some(0)).await;
                        }
                    }
                }
            }
        }

        if let Some(record) = calibrated_record {
            positions.apply_calibration(&record);
            if let Err(e) = positions.write(storage.session_dir()).await {
                self.record_error(&e, Some(0)).await;
            }
        } else {
            warn!("no camera calibrated; positions file keeps planning defaults");
        }
    }

    /// One synchronized flash+capture across all cameras, persisting every
    /// successful frame. Returns the number of images stored.
    async fn capture_and_persist(
        &self,
        point: &ScanPoint,
        point_index: usize,
        shot: u32,
        storage: &SessionStorage,
        profiles: &ActiveProfiles,
    ) -> usize {
        // Per-point lighting override, or the configured default flash
        let (zones, flash_settings) = match &point.lighting_override {
            Some(lighting) => (lighting.zones.clone(), lighting.settings.clone()),
            None => (Vec::new(), self.config.lighting.default_flash.clone()),
        };

        let captures = self
            .capture_all_cameras(&zones, &flash_settings)
            .await;

        let flash_used = self.flash.is_some();
        let lighting_record = LightingRecord {
            zones: if zones.is_empty() {
                self.flash.as_ref().map(|f| f.zones()).unwrap_or_default()
            } else {
                zones
            },
            brightness: flash_settings.brightness,
            duration_ms: flash_settings.duration_ms,
            flash_fired: flash_used,
        };

        let mut stored = 0usize;
        for (camera, result) in captures {
            match result {
                Ok(frame) => {
                    match self
                        .persist_frame(&frame, point, point_index, shot, storage, profiles, &lighting_record)
                        .await
                    {
                        Ok(()) => stored += 1,
                        Err(e) => {
                            // Storage failure is non-fatal to capture;
                            // retried implicitly at the next checkpoint
                            self.record_error(&e, Some(point_index)).await;
                        }
                    }
                }
                Err(e) => {
                    warn!(camera = %camera, point = point_index, error = %e, "capture failed");
                    self.record_error(&e, Some(point_index)).await;
                }
            }
        }
        stored
    }

    /// Primary dual-capture path: all sensors in parallel (per-camera locks
    /// held independently), flash-covered when the array is configured.
    /// Sensors that fail the simultaneous attempt with a capture or
    /// configuration error get one bounded-delay sequential retry, since ISP
    /// buffer contention on a simultaneous capture clears once the other
    /// sensor's pipeline has drained.
    async fn capture_all_cameras(
        &self,
        zones: &[String],
        flash_settings: &FlashSettings,
    ) -> Vec<(scan_core::imaging::CameraId, ScanResult<CapturedFrame>)> {
        let mut captures = self.capture_simultaneous(zones, flash_settings).await;

        let needs_retry: Vec<usize> = captures
            .iter()
            .enumerate()
            .filter(|(_, (_, result))| {
                matches!(
                    result,
                    Err(ScannerError::Camera {
                        kind: CameraErrorKind::Capture | CameraErrorKind::Configuration,
                        ..
                    })
                )
            })
            .map(|(index, _)| index)
            .collect();
        if needs_retry.is_empty() {
            return captures;
        }

        warn!(
            failed = needs_retry.len(),
            "simultaneous capture failed on some sensors; sequential fallback"
        );
        for index in needs_retry {
            let camera = captures[index].0;
            let Some(cam) = self.cameras.iter().find(|c| c.id() == camera) else {
                continue;
            };
            tokio::time::sleep(SEQUENTIAL_RETRY_STAGGER).await;

            let retry = match &self.flash {
                // The retried shutter must stay flash-covered
                Some(flash) => match flash
                    .trigger_for_capture(std::slice::from_ref(cam), zones, flash_settings)
                    .await
                {
                    Ok(mut result) if !result.captures.is_empty() => result.captures.remove(0).1,
                    Ok(_) => Err(ScannerError::camera(
                        camera,
                        CameraErrorKind::Capture,
                        "sequential retry produced no capture result",
                    )),
                    Err(e) => Err(e),
                },
                None => cam.capture_still().await,
            };
            match &retry {
                Ok(_) => info!(camera = %camera, "sequential fallback capture succeeded"),
                Err(e) => warn!(camera = %camera, error = %e, "sequential fallback capture failed"),
            }
            captures[index].1 = retry;
        }
        captures
    }

    async fn capture_simultaneous(
        &self,
        zones: &[String],
        flash_settings: &FlashSettings,
    ) -> Vec<(scan_core::imaging::CameraId, ScanResult<CapturedFrame>)> {
        if let Some(flash) = &self.flash {
            match flash
                .trigger_for_capture(&self.cameras, zones, flash_settings)
                .await
            {
                Ok(result) => return result.captures,
                Err(e) => {
                    warn!(error = %e, "flash trigger failed; capturing without flash");
                    self.record_error(&e, None).await;
                }
            }
        }
        // No flash configured (or the trigger failed): plain parallel capture
        let futures: Vec<_> = self
            .cameras
            .iter()
            .map(|cam| {
                let cam = Arc::clone(cam);
                async move { (cam.id(), cam.capture_still().await) }
            })
            .collect();
        futures::future::join_all(futures).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn persist_frame(
        &self,
        frame: &CapturedFrame,
        point: &ScanPoint,
        point_index: usize,
        shot: u32,
        storage: &SessionStorage,
        profiles: &ActiveProfiles,
        lighting: &LightingRecord,
    ) -> ScanResult<()> {
        let scan_id = storage.scan_id().to_string();
        let file_id = format!(
            "{}_point{:04}_cam{}_{}",
            scan_id, point_index, frame.camera.0, shot
        );

        let exif = ExifInfo {
            make: "Arducam".into(),
            model: format!("64MP IMX519 Camera {}", frame.camera.0),
            software: format!("rust_scan {}", env!("CARGO_PKG_VERSION")),
            description: format!(
                "Scan Point {:03} at X:{:.1} Y:{:.1} Z:{:.1} C:{:.1}",
                point_index,
                point.position.x,
                point.position.y,
                point.position.z,
                point.position.c
            ),
            artist: "Automated 4DOF Scanner".into(),
            datetime: frame.captured_at.format("%Y:%m:%d %H:%M:%S").to_string(),
            exposure_us: frame.metadata.exposure_us,
            iso: frame.metadata.iso_equivalent(),
            f_number: (18, 10),
            focal_length: (27, 10),
            flash_fired: lighting.flash_fired,
            position: point.position,
        };

        let jpeg = scan_storage::exif::encode_with_exif(
            &frame.pixels,
            frame.width,
            frame.height,
            profiles.quality.jpeg_quality,
            &exif,
        )?;

        // Sidecar reflects whether the frame ran on calibrated settings
        let camera_settings = match self.calibrator.store().snapshot(frame.camera) {
            Some(cal) => CameraSettingsRecord::from_calibrated(
                &cal,
                [frame.width, frame.height],
                profiles.quality.jpeg_quality,
            ),
            None => CameraSettingsRecord {
                exposure_time: exposure_string(frame.metadata.exposure_us),
                iso: frame.metadata.iso_equivalent(),
                resolution: [frame.width, frame.height],
                quality: profiles.quality.jpeg_quality,
                calibration_source: CalibrationSource::PlanningDefaults,
                focus_position: frame.metadata.focus_value,
                calibration_timestamp: None,
            },
        };

        let sequence_number = (point_index as u32) * point.capture_count + shot;
        let metadata = StoredFrameMetadata {
            file_id,
            scan_session_id: scan_id,
            sequence_number,
            camera_id: frame.camera.0,
            position: point.position,
            camera_settings,
            lighting_settings: Some(lighting.clone()),
            checksum: String::new(),
            captured_at: frame.captured_at,
            exif_subset: ExifSubset {
                exposure_time: exposure_string(frame.metadata.exposure_us),
                iso: frame.metadata.iso_equivalent(),
                f_number: "f/1.8".into(),
                focal_length_mm: 2.7,
                flash_fired: lighting.flash_fired,
            },
        };

        storage.store_frame(&jpeg, metadata).await?;
        Ok(())
    }

    async fn cleanup(&self, storage: &SessionStorage) {
        self.set_phase(ScanPhase::Cleanup).await;

        // Always return cameras to live streaming
        for cam in &self.cameras {
            if let Err(e) = cam.set_mode(scan_core::imaging::CameraMode::Streaming).await {
                warn!(camera = %cam.id(), error = %e, "failed to restore streaming mode");
            }
        }
        if let Some(flash) = &self.flash {
            let _ = flash.all_off().await;
        }
        if let Err(e) = storage.finalize().await {
            warn!(error = %e, "session finalize failed");
        }
        self.persist_state().await;
    }
}

//! Exposure and focus calibration.
//!
//! Calibration runs once per scan, at the first scan point: the flash is
//! held at the calibration brightness, auto-exposure settles over discard
//! frames, a single-shot autofocus sweep runs, and the resulting exposure,
//! gain and focus are frozen into the [`CalibrationStore`]. Every later
//! sensor reconfiguration goes through [`CalibrationStore::apply_and_verify`]
//! so drift is caught and corrected through one path.

use scan_core::capabilities::{Flashable, StillCapture};
use scan_core::config::CalibrationFlash;
use scan_core::error::{CameraErrorKind, ScanResult, ScannerError};
use scan_core::imaging::{
    CalibratedSettings, CalibrationSource, CameraControls, CameraId,
};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Exposure/gain drift tolerance on verification (fractional).
const VERIFY_TOLERANCE: f32 = 0.10;
/// Attempts to re-apply drifted settings before giving up.
const MAX_REAPPLY_ATTEMPTS: u32 = 3;
/// Bound on one single-shot autofocus cycle.
const AUTOFOCUS_TIMEOUT: Duration = Duration::from_secs(10);
/// Discard frames captured while auto-exposure settles.
const AE_SETTLE_FRAMES: u32 = 3;
const AE_SETTLE_PAUSE: Duration = Duration::from_millis(300);

/// Typed store of calibrated settings, one entry per sensor.
///
/// Written by the calibrator; read by every capture and by the sensors'
/// mode-switch reapplication. All mutation goes through the same two
/// methods, so there is exactly one re-application path.
#[derive(Default)]
pub struct CalibrationStore {
    entries: RwLock<HashMap<CameraId, CalibratedSettings>>,
}

impl CalibrationStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Copy of the entry for a sensor, if calibrated.
    pub fn snapshot(&self, id: CameraId) -> Option<CalibratedSettings> {
        self.entries
            .read()
            .ok()
            .and_then(|map| map.get(&id).copied())
    }

    /// Record a fresh calibration (unlocked until verified on-sensor).
    pub fn record(&self, id: CameraId, settings: CalibratedSettings) {
        if let Ok(mut map) = self.entries.write() {
            map.insert(id, settings);
        }
    }

    /// Drop all entries (scan teardown).
    pub fn clear(&self) {
        if let Ok(mut map) = self.entries.write() {
            map.clear();
        }
    }

    fn set_locked(&self, id: CameraId, locked: bool) {
        if let Ok(mut map) = self.entries.write() {
            if let Some(entry) = map.get_mut(&id) {
                entry.locked = locked;
            }
        }
    }

    /// Re-apply the stored settings to a sensor and verify them by metadata
    /// readback.
    ///
    /// Applies AE/AWB-off locked controls, waits for them to take, reads
    /// metadata and compares against the stored values with a 10% tolerance.
    /// Drift triggers up to three re-applications. Returns whether the
    /// settings ended up locked; a sensor with no stored entry returns
    /// `Ok(false)`.
    pub async fn apply_and_verify(&self, cam: &dyn StillCapture) -> ScanResult<bool> {
        let id = cam.id();
        let Some(settings) = self.snapshot(id) else {
            return Ok(false);
        };

        let controls = CameraControls {
            focus_value: Some(settings.focus_value),
            ..CameraControls::locked(settings.exposure_us, settings.analogue_gain)
        };

        for attempt in 1..=MAX_REAPPLY_ATTEMPTS {
            cam.set_controls(controls).await?;
            tokio::time::sleep(crate::sensor::CameraSensor::reapply_settle()).await;

            let metadata = cam.read_metadata().await?;
            if settings.verify(&metadata, VERIFY_TOLERANCE) {
                self.set_locked(id, true);
                debug!(camera = %id, attempt, "calibrated settings verified");
                return Ok(true);
            }
            warn!(
                camera = %id,
                attempt,
                readback_exposure = metadata.exposure_us,
                expected_exposure = settings.exposure_us,
                "calibrated settings drifted; re-applying"
            );
        }

        self.set_locked(id, false);
        Ok(false)
    }
}

/// Multi-camera calibration strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Calibrate the primary camera fully; propagate its focus value to the
    /// secondaries while each runs its own exposure calibration (lighting
    /// geometry differs per sensor).
    Synchronized,
    /// Calibrate every camera from scratch.
    Independent,
}

/// Releases the flash zones even if calibration is cancelled mid-await.
struct FlashGuard {
    flash: Arc<dyn Flashable>,
    armed: bool,
}

impl FlashGuard {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for FlashGuard {
    fn drop(&mut self) {
        if self.armed {
            let flash = Arc::clone(&self.flash);
            tokio::spawn(async move {
                if let Err(e) = flash.all_off().await {
                    warn!(error = %e, "failed to release calibration lighting");
                }
            });
        }
    }
}

/// Runs auto-exposure + autofocus calibration and freezes the result.
pub struct Calibrator {
    store: Arc<CalibrationStore>,
    flash: Option<Arc<dyn Flashable>>,
    flash_config: CalibrationFlash,
}

impl Calibrator {
    pub fn new(
        store: Arc<CalibrationStore>,
        flash: Option<Arc<dyn Flashable>>,
        flash_config: CalibrationFlash,
    ) -> Self {
        Self {
            store,
            flash,
            flash_config,
        }
    }

    /// Calibrate one camera. The flash (when configured and enabled) is held
    /// at the calibration brightness for the whole procedure and released on
    /// every exit path.
    #[instrument(skip(self, cam), fields(camera = %cam.id()), err)]
    pub async fn calibrate(&self, cam: &dyn StillCapture) -> ScanResult<CalibratedSettings> {
        let guard = match (&self.flash, self.flash_config.enabled) {
            (Some(flash), true) => {
                let zones = flash.zones();
                flash
                    .set_brightness(&zones, self.flash_config.brightness)
                    .await?;
                Some(FlashGuard {
                    flash: Arc::clone(flash),
                    armed: true,
                })
            }
            _ => None,
        };

        let result = self.calibrate_inner(cam).await;

        if let Some(guard) = guard {
            // Deliberate release rather than relying on the drop path
            let _ = guard.flash.all_off().await;
            guard.disarm();
        }
        result
    }

    async fn calibrate_inner(&self, cam: &dyn StillCapture) -> ScanResult<CalibratedSettings> {
        let id = cam.id();

        // Let auto-exposure and auto-white-balance settle over discard frames
        cam.set_controls(CameraControls::automatic()).await?;
        for frame in 0..AE_SETTLE_FRAMES {
            tokio::time::sleep(AE_SETTLE_PAUSE).await;
            let metadata = cam.read_metadata().await?;
            debug!(camera = %id, frame, exposure_us = metadata.exposure_us,
                   gain = metadata.analogue_gain, "AE settle frame");
        }

        // Single-shot autofocus, bounded; a failed sweep falls back to
        // mid-range focus rather than aborting the calibration
        let focus_value = match tokio::time::timeout(AUTOFOCUS_TIMEOUT, cam.run_autofocus()).await
        {
            Ok(Ok(value)) => value.clamp(0.0, 1.0),
            Ok(Err(e)) => {
                warn!(camera = %id, error = %e, "autofocus failed; using mid-range focus");
                0.5
            }
            Err(_) => {
                warn!(camera = %id, "autofocus timed out; using mid-range focus");
                0.5
            }
        };

        let metadata = cam.read_metadata().await.map_err(|e| {
            ScannerError::camera(id, CameraErrorKind::Calibration, e)
        })?;

        let settings = CalibratedSettings {
            exposure_us: metadata.exposure_us,
            analogue_gain: metadata.analogue_gain,
            focus_value,
            locked: false,
            calibrated_at: chrono::Utc::now(),
            source: CalibrationSource::CameraCalibrated,
        };
        self.store.record(id, settings);

        // Lock AE/AWB off through the single re-application path
        let locked = self.store.apply_and_verify(cam).await?;
        info!(
            camera = %id,
            exposure_us = settings.exposure_us,
            gain = settings.analogue_gain,
            focus = settings.focus_value,
            lux = ?metadata.lux,
            locked,
            "calibration complete"
        );
        self.store
            .snapshot(id)
            .ok_or_else(|| ScannerError::camera(id, CameraErrorKind::Calibration, "store entry vanished"))
    }

    /// Calibrate a set of cameras under the given strategy. Returns settings
    /// per camera; individual failures are returned so the orchestrator can
    /// apply its safe-defaults policy per sensor.
    pub async fn calibrate_all(
        &self,
        cameras: &[Arc<dyn StillCapture>],
        mode: SyncMode,
    ) -> Vec<(CameraId, ScanResult<CalibratedSettings>)> {
        let mut results = Vec::with_capacity(cameras.len());
        match mode {
            SyncMode::Independent => {
                for cam in cameras {
                    results.push((cam.id(), self.calibrate(cam.as_ref()).await));
                }
            }
            SyncMode::Synchronized => {
                let Some((primary, secondaries)) = cameras.split_first() else {
                    return results;
                };
                let primary_result = self.calibrate(primary.as_ref()).await;
                let primary_focus = primary_result
                    .as_ref()
                    .map(|s| s.focus_value)
                    .unwrap_or(0.5);
                results.push((primary.id(), primary_result));

                for cam in secondaries {
                    // Each secondary runs its own exposure calibration, then
                    // inherits the primary's focus
                    let result = self.calibrate(cam.as_ref()).await.map(|mut settings| {
                        settings.focus_value = primary_focus;
                        self.store.record(cam.id(), settings);
                        settings
                    });
                    if result.is_ok() {
                        let controls = CameraControls {
                            focus_value: Some(primary_focus),
                            ..CameraControls::default()
                        };
                        if let Err(e) = cam.set_controls(controls).await {
                            warn!(camera = %cam.id(), error = %e, "focus propagation failed");
                        }
                    }
                    results.push((cam.id(), result));
                }
            }
        }
        results
    }

    pub fn store(&self) -> Arc<CalibrationStore> {
        Arc::clone(&self.store)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use scan_core::imaging::{CameraMode, CapturedFrame, SensorMetadata};
    use std::sync::Mutex;

    /// Sensor stub whose metadata always mirrors the last applied controls.
    struct ObedientSensor {
        id: CameraId,
        applied: Mutex<CameraControls>,
    }

    #[async_trait]
    impl StillCapture for ObedientSensor {
        fn id(&self) -> CameraId {
            self.id
        }

        async fn set_mode(&self, _mode: CameraMode) -> scan_core::ScanResult<()> {
            Ok(())
        }

        async fn capture_still(&self) -> scan_core::ScanResult<CapturedFrame> {
            unimplemented!("not exercised by store tests")
        }

        async fn grab_preview(&self) -> scan_core::ScanResult<Bytes> {
            unimplemented!("not exercised by store tests")
        }

        async fn set_controls(&self, controls: CameraControls) -> scan_core::ScanResult<()> {
            *self.applied.lock().unwrap() = controls;
            Ok(())
        }

        async fn read_metadata(&self) -> scan_core::ScanResult<SensorMetadata> {
            let applied = self.applied.lock().unwrap();
            Ok(SensorMetadata {
                exposure_us: applied.exposure_us.unwrap_or(33_000),
                analogue_gain: applied.analogue_gain.unwrap_or(1.0),
                focus_value: applied.focus_value,
                lux: None,
                ae_locked: applied.ae_enable == Some(false),
            })
        }

        async fn run_autofocus(&self) -> scan_core::ScanResult<f32> {
            Ok(0.5)
        }
    }

    fn settings(exposure_us: u32) -> CalibratedSettings {
        CalibratedSettings {
            exposure_us,
            analogue_gain: 2.0,
            focus_value: 0.4,
            locked: false,
            calibrated_at: chrono::Utc::now(),
            source: CalibrationSource::CameraCalibrated,
        }
    }

    #[test]
    fn record_snapshot_clear() {
        let store = CalibrationStore::new();
        let id = CameraId(0);
        assert!(store.snapshot(id).is_none());

        store.record(id, settings(20_000));
        assert_eq!(store.snapshot(id).unwrap().exposure_us, 20_000);

        store.clear();
        assert!(store.snapshot(id).is_none());
    }

    #[tokio::test]
    async fn apply_and_verify_locks_a_cooperative_sensor() {
        let store = CalibrationStore::new();
        let sensor = ObedientSensor {
            id: CameraId(1),
            applied: Mutex::new(CameraControls::default()),
        };
        store.record(sensor.id, settings(16_667));

        let locked = store.apply_and_verify(&sensor).await.unwrap();
        assert!(locked);
        assert!(store.snapshot(sensor.id).unwrap().locked);

        // The sensor really was driven into the locked configuration
        let applied = *sensor.applied.lock().unwrap();
        assert_eq!(applied.ae_enable, Some(false));
        assert_eq!(applied.awb_enable, Some(false));
        assert_eq!(applied.exposure_us, Some(16_667));
        assert_eq!(applied.focus_value, Some(0.4));
    }

    #[tokio::test]
    async fn apply_and_verify_without_entry_is_a_no_op() {
        let store = CalibrationStore::new();
        let sensor = ObedientSensor {
            id: CameraId(2),
            applied: Mutex::new(CameraControls::default()),
        };
        let locked = store.apply_and_verify(&sensor).await.unwrap();
        assert!(!locked);
    }
}

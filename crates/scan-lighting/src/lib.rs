//! Multi-zone LED flash array.
//!
//! Zones are named groups of PWM/GPIO channels driven as a unit. The array
//! offers three primitives: a timed [`FlashArray::flash`] (assert, hold,
//! release), continuous [`FlashArray::set_brightness`] for calibration
//! lighting, and [`FlashArray::trigger_for_capture`], which asserts the
//! zones, waits for the LEDs to reach stable output, runs the dual-camera
//! capture, and releases, so the flash covers the full shutter interval.

use async_trait::async_trait;
use scan_core::capabilities::{Flashable, StillCapture};
use scan_core::config::LightingConfig;
use scan_core::error::{ScanResult, ScannerError};
use scan_core::imaging::{CameraId, CapturedFrame};
use scan_core::lighting::FlashSettings;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Hardware seam for LED channel output.
///
/// `set_duty(channel, duty)` with duty in [0, 1]. Real deployments bind PWM
/// hardware here; `scan-sim` records the timeline for assertions.
#[async_trait]
pub trait LedBackend: Send + Sync {
    async fn set_duty(&self, channel: u8, duty: f64) -> anyhow::Result<()>;
}

/// Combined result of a flash-synchronized dual capture.
pub struct SyncCaptureResult {
    /// Per-camera outcome, in the order the cameras were supplied.
    pub captures: Vec<(CameraId, ScanResult<CapturedFrame>)>,
    /// Zones that were asserted for the capture.
    pub zones_activated: Vec<String>,
}

impl SyncCaptureResult {
    pub fn succeeded(&self) -> usize {
        self.captures.iter().filter(|(_, r)| r.is_ok()).count()
    }
}

/// The zoned flash array.
pub struct FlashArray {
    zones: BTreeMap<String, Vec<u8>>,
    backend: Arc<dyn LedBackend>,
    /// LED stabilization time between assert and shutter open.
    rise_time: Duration,
}

impl FlashArray {
    pub fn new(config: &LightingConfig, backend: Arc<dyn LedBackend>) -> Arc<Self> {
        Arc::new(Self {
            zones: config.zones.clone(),
            backend,
            rise_time: Duration::from_millis(config.rise_time_ms),
        })
    }

    fn channels_for(&self, zones: &[String]) -> ScanResult<Vec<u8>> {
        let mut channels = Vec::new();
        let selected: Vec<&String> = if zones.is_empty() {
            self.zones.keys().collect()
        } else {
            zones.iter().collect()
        };
        for zone in selected {
            match self.zones.get(zone) {
                Some(chs) => channels.extend_from_slice(chs),
                None => {
                    return Err(ScannerError::Config(format!(
                        "unknown lighting zone '{}'",
                        zone
                    )))
                }
            }
        }
        Ok(channels)
    }

    async fn drive(&self, channels: &[u8], duty: f64) -> ScanResult<()> {
        for &channel in channels {
            self.backend
                .set_duty(channel, duty)
                .await
                .map_err(|e| ScannerError::Config(format!("LED channel {}: {}", channel, e)))?;
        }
        Ok(())
    }

    /// Best-effort release used on error paths; failures are logged, not
    /// propagated, so the original error survives.
    async fn release(&self, channels: &[u8]) {
        for &channel in channels {
            if let Err(e) = self.backend.set_duty(channel, 0.0).await {
                warn!(channel, error = %e, "failed to release LED channel");
            }
        }
    }

    /// Assert zones, wait the LED rise time, run the capture closure on all
    /// cameras concurrently, then release. The zones are released whether or
    /// not the captures succeed.
    #[instrument(skip(self, cameras, settings), fields(zones = ?zones))]
    pub async fn trigger_for_capture(
        &self,
        cameras: &[Arc<dyn StillCapture>],
        zones: &[String],
        settings: &FlashSettings,
    ) -> ScanResult<SyncCaptureResult> {
        let channels = self.channels_for(zones)?;
        let zones_activated: Vec<String> = if zones.is_empty() {
            self.zones.keys().cloned().collect()
        } else {
            zones.to_vec()
        };

        self.drive(&channels, settings.brightness.clamp(0.0, 1.0))
            .await?;
        // LEDs need the rise time to reach stable output before the shutter
        tokio::time::sleep(self.rise_time).await;

        debug!("flash asserted; capturing");
        let futures: Vec<_> = cameras
            .iter()
            .map(|cam| {
                let cam = Arc::clone(cam);
                async move { (cam.id(), cam.capture_still().await) }
            })
            .collect();
        let captures = futures::future::join_all(futures).await;

        self.release(&channels).await;
        debug!("flash released");

        Ok(SyncCaptureResult {
            captures,
            zones_activated,
        })
    }
}

#[async_trait]
impl Flashable for FlashArray {
    fn zones(&self) -> Vec<String> {
        self.zones.keys().cloned().collect()
    }

    #[instrument(skip(self, settings), fields(zones = ?zones, brightness = settings.brightness), err)]
    async fn flash(&self, zones: &[String], settings: &FlashSettings) -> ScanResult<()> {
        let channels = self.channels_for(zones)?;
        let brightness = settings.brightness.clamp(0.0, 1.0);

        if let Some(fade_ms) = settings.fade_ms.filter(|&f| f > 0) {
            // Coarse ramp; LED drivers smooth the steps
            let steps = 8u64;
            for step in 1..=steps {
                let duty = brightness * step as f64 / steps as f64;
                if let Err(e) = self.drive(&channels, duty).await {
                    self.release(&channels).await;
                    return Err(e);
                }
                tokio::time::sleep(Duration::from_millis(fade_ms / steps)).await;
            }
        } else if let Err(e) = self.drive(&channels, brightness).await {
            self.release(&channels).await;
            return Err(e);
        }

        tokio::time::sleep(Duration::from_millis(settings.duration_ms)).await;
        self.release(&channels).await;
        info!(duration_ms = settings.duration_ms, "flash complete");
        Ok(())
    }

    async fn set_brightness(&self, zones: &[String], brightness: f64) -> ScanResult<()> {
        let channels = self.channels_for(zones)?;
        self.drive(&channels, brightness.clamp(0.0, 1.0)).await
    }

    async fn all_off(&self) -> ScanResult<()> {
        let all: Vec<u8> = self.zones.values().flatten().copied().collect();
        self.release(&all).await;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use scan_core::config::CalibrationFlash;
    use std::sync::Mutex;

    /// Records (channel, duty) writes in order.
    struct RecordingBackend {
        writes: Mutex<Vec<(u8, f64)>>,
    }

    #[async_trait]
    impl LedBackend for RecordingBackend {
        async fn set_duty(&self, channel: u8, duty: f64) -> anyhow::Result<()> {
            self.writes.lock().unwrap().push((channel, duty));
            Ok(())
        }
    }

    fn array() -> (Arc<FlashArray>, Arc<RecordingBackend>) {
        let backend = Arc::new(RecordingBackend {
            writes: Mutex::new(Vec::new()),
        });
        let config = LightingConfig {
            zones: BTreeMap::from([
                ("inner".to_string(), vec![0, 1]),
                ("outer".to_string(), vec![2, 3]),
            ]),
            rise_time_ms: 1,
            default_flash: FlashSettings::default(),
            calibration_flash: CalibrationFlash::default(),
        };
        (FlashArray::new(&config, backend.clone()), backend)
    }

    #[tokio::test]
    async fn flash_asserts_then_releases() {
        let (array, backend) = array();
        let settings = FlashSettings {
            brightness: 0.8,
            duration_ms: 5,
            fade_ms: None,
        };
        array.flash(&["inner".to_string()], &settings).await.unwrap();

        let writes = backend.writes.lock().unwrap().clone();
        assert_eq!(writes, vec![(0, 0.8), (1, 0.8), (0, 0.0), (1, 0.0)]);
    }

    #[tokio::test]
    async fn empty_zone_list_means_all_zones() {
        let (array, backend) = array();
        array.set_brightness(&[], 0.3).await.unwrap();
        let writes = backend.writes.lock().unwrap().clone();
        assert_eq!(writes.len(), 4);
        assert!(writes.iter().all(|&(_, duty)| (duty - 0.3).abs() < 1e-9));
    }

    #[tokio::test]
    async fn unknown_zone_rejected() {
        let (array, _) = array();
        let err = array.set_brightness(&["ring".to_string()], 0.5).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn brightness_clamped_to_unit_range() {
        let (array, backend) = array();
        array.set_brightness(&["inner".to_string()], 1.7).await.unwrap();
        let writes = backend.writes.lock().unwrap().clone();
        assert!(writes.iter().all(|&(_, duty)| duty <= 1.0));
    }
}

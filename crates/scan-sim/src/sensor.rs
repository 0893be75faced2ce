//! Simulated camera sensor backend.

use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use scan_camera::sensor::{SensorBackend, SensorModeConfig};
use scan_core::imaging::{CameraControls, CameraMode, SensorMetadata};
use std::sync::Mutex;
use std::time::Duration;

/// Behavior knobs for one simulated sensor.
#[derive(Debug, Clone)]
pub struct SimSensorConfig {
    /// Exposure auto-exposure converges to, microseconds.
    pub settled_exposure_us: u32,
    /// Gain auto-exposure converges to.
    pub settled_gain: f32,
    /// Normalized lens position autofocus lands on.
    pub af_focus: f32,
    /// Autofocus sweep duration.
    pub af_duration: Duration,
    /// Return empty pixel buffers for captures with these indices (0-based).
    pub empty_capture_at: Vec<u32>,
    /// Report drifted exposure once after each reconfigure, exercising the
    /// re-apply path.
    pub drift_after_reconfigure: bool,
}

impl Default for SimSensorConfig {
    fn default() -> Self {
        Self {
            settled_exposure_us: 16_667,
            settled_gain: 2.0,
            af_focus: 0.42,
            af_duration: Duration::from_millis(40),
            empty_capture_at: Vec::new(),
            drift_after_reconfigure: false,
        }
    }
}

struct SensorInner {
    running: bool,
    mode: Option<SensorModeConfig>,
    ae_enabled: bool,
    awb_enabled: bool,
    exposure_us: u32,
    gain: f32,
    focus: f32,
    /// One drifted readback pending (consumed by the next metadata read).
    drift_pending: bool,
    capture_count: u32,
}

/// A simulated sensor implementing the camera backend seam.
pub struct SimSensor {
    config: SimSensorConfig,
    inner: Mutex<SensorInner>,
}

impl SimSensor {
    pub fn new(config: SimSensorConfig) -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            inner: Mutex::new(SensorInner {
                running: true,
                mode: None,
                ae_enabled: true,
                awb_enabled: true,
                exposure_us: 33_000,
                gain: 1.0,
                focus: 0.5,
                drift_pending: false,
                capture_count: 0,
            }),
            config,
        })
    }

    pub fn captures_taken(&self) -> u32 {
        self.inner.lock().map(|i| i.capture_count).unwrap_or(0)
    }

    fn metadata_locked(&self, inner: &mut SensorInner) -> SensorMetadata {
        if inner.ae_enabled {
            // Converge towards the settled values with a little noise
            let mut rng = rand::thread_rng();
            inner.exposure_us = self.config.settled_exposure_us
                + rng.gen_range(0..=(self.config.settled_exposure_us / 100).max(1));
            inner.gain = self.config.settled_gain * (1.0 + rng.gen_range(-0.01f32..0.01f32));
        } else if inner.drift_pending {
            inner.drift_pending = false;
            return SensorMetadata {
                exposure_us: (inner.exposure_us as f32 * 1.25) as u32,
                analogue_gain: inner.gain,
                focus_value: Some(inner.focus),
                lux: Some(420.0),
                ae_locked: true,
            };
        }
        SensorMetadata {
            exposure_us: inner.exposure_us,
            analogue_gain: inner.gain,
            focus_value: Some(inner.focus),
            lux: Some(420.0),
            ae_locked: !inner.ae_enabled,
        }
    }
}

#[async_trait]
impl SensorBackend for SimSensor {
    async fn stop(&self) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().map_err(|_| anyhow::anyhow!("poisoned"))?;
        inner.running = false;
        Ok(())
    }

    async fn configure(&self, config: &SensorModeConfig) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().map_err(|_| anyhow::anyhow!("poisoned"))?;
        if inner.running {
            anyhow::bail!("sensor must be stopped before reconfiguration");
        }
        inner.mode = Some(*config);
        if self.config.drift_after_reconfigure && !inner.ae_enabled {
            inner.drift_pending = true;
        }
        Ok(())
    }

    async fn start(&self) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().map_err(|_| anyhow::anyhow!("poisoned"))?;
        inner.running = true;
        Ok(())
    }

    async fn set_controls(&self, controls: &CameraControls) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().map_err(|_| anyhow::anyhow!("poisoned"))?;
        if let Some(ae) = controls.ae_enable {
            inner.ae_enabled = ae;
        }
        if let Some(awb) = controls.awb_enable {
            inner.awb_enabled = awb;
        }
        if let Some(exposure) = controls.exposure_us {
            inner.exposure_us = exposure;
        }
        if let Some(gain) = controls.analogue_gain {
            inner.gain = gain;
        }
        if let Some(focus) = controls.focus_value {
            inner.focus = focus;
        }
        Ok(())
    }

    async fn read_metadata(&self) -> anyhow::Result<SensorMetadata> {
        let mut inner = self.inner.lock().map_err(|_| anyhow::anyhow!("poisoned"))?;
        Ok(self.metadata_locked(&mut inner))
    }

    async fn grab_frame(&self) -> anyhow::Result<Bytes> {
        let inner = self.inner.lock().map_err(|_| anyhow::anyhow!("poisoned"))?;
        if !inner.running {
            anyhow::bail!("sensor stopped");
        }
        Ok(Bytes::from_static(&[0x80; 64]))
    }

    async fn capture_frame(&self) -> anyhow::Result<(Bytes, u32, u32, SensorMetadata)> {
        let mut inner = self.inner.lock().map_err(|_| anyhow::anyhow!("poisoned"))?;
        if !inner.running {
            anyhow::bail!("sensor stopped");
        }
        let Some(mode) = inner.mode else {
            anyhow::bail!("sensor not configured");
        };
        if mode.mode != CameraMode::Capturing {
            anyhow::bail!("capture requested while streaming");
        }

        let index = inner.capture_count;
        inner.capture_count += 1;

        let metadata = self.metadata_locked(&mut inner);
        if self.config.empty_capture_at.contains(&index) {
            return Ok((Bytes::new(), mode.width, mode.height, metadata));
        }

        // Flat mid-gray test frame
        let pixels = vec![0x80u8; (mode.width * mode.height * 3) as usize];
        Ok((Bytes::from(pixels), mode.width, mode.height, metadata))
    }

    async fn run_autofocus(&self) -> anyhow::Result<f32> {
        tokio::time::sleep(self.config.af_duration).await;
        let mut inner = self.inner.lock().map_err(|_| anyhow::anyhow!("poisoned"))?;
        inner.focus = self.config.af_focus;
        Ok(self.config.af_focus)
    }
}

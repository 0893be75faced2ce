//! Lighting types shared between the flash array, patterns and storage.

use serde::{Deserialize, Serialize};

/// Parameters for one timed flash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlashSettings {
    /// Zone brightness in [0, 1].
    pub brightness: f64,
    /// Hold duration with the zones asserted.
    pub duration_ms: u64,
    /// Optional ramp time applied on assert and release.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fade_ms: Option<u64>,
}

impl Default for FlashSettings {
    fn default() -> Self {
        Self {
            brightness: 0.7,
            duration_ms: 600,
            fade_ms: None,
        }
    }
}

/// Per-point lighting override carried on a scan point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LightingOverride {
    /// Zone names to assert; empty means "all configured zones".
    pub zones: Vec<String>,
    pub settings: FlashSettings,
}

/// Record of the lighting used for one capture, persisted in image sidecars.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LightingRecord {
    pub zones: Vec<String>,
    pub brightness: f64,
    pub duration_ms: u64,
    pub flash_fired: bool,
}

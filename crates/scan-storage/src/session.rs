//! Per-scan session storage.
//!
//! One directory per scan with images and sidecar metadata. Every stored
//! frame gets a SHA-256 checksum, an atomic image write and a JSON sidecar;
//! the session manifest is rewritten after each store so the session is
//! inspectable mid-scan.

use crate::atomic_write;
use crate::positions::CameraSettingsRecord;
use chrono::{DateTime, Utc};
use scan_core::error::{ScanResult, ScannerError};
use scan_core::lighting::LightingRecord;
use scan_core::position::Position4D;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

/// EXIF fields mirrored into the sidecar for tools that do not parse JPEG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExifSubset {
    pub exposure_time: String,
    pub iso: u32,
    pub f_number: String,
    pub focal_length_mm: f64,
    pub flash_fired: bool,
}

/// Sidecar metadata stored next to every frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredFrameMetadata {
    pub file_id: String,
    pub scan_session_id: String,
    pub sequence_number: u32,
    pub camera_id: u8,
    pub position: Position4D,
    pub camera_settings: CameraSettingsRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lighting_settings: Option<LightingRecord>,
    /// SHA-256 of the image bytes, hex. Filled in by `store_frame`.
    #[serde(default)]
    pub checksum: String,
    pub captured_at: DateTime<Utc>,
    pub exif_subset: ExifSubset,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ManifestEntry {
    file_id: String,
    image_path: String,
    sidecar_path: String,
    camera_id: u8,
    sequence_number: u32,
    checksum: String,
    bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionManifest {
    scan_id: String,
    created_at: DateTime<Utc>,
    session_metadata: serde_json::Value,
    files: Vec<ManifestEntry>,
    total_bytes: usize,
    finalized: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    finalized_at: Option<DateTime<Utc>>,
}

/// Handle to one scan's session directory.
pub struct SessionStorage {
    scan_id: String,
    session_dir: PathBuf,
    metadata_dir: PathBuf,
    images_dir: PathBuf,
    manifest: Mutex<SessionManifest>,
}

impl SessionStorage {
    /// Create (or attach to) the session directory for a scan.
    ///
    /// Attaching to an existing directory of the same id is deliberate:
    /// web-initiated scans create the directory before the orchestrator
    /// starts.
    #[instrument(skip(session_metadata), err)]
    pub async fn create(
        root: &Path,
        scan_id: &str,
        session_metadata: serde_json::Value,
    ) -> ScanResult<Self> {
        let session_dir = root.join(scan_id);
        let metadata_dir = session_dir.join("metadata");
        let images_dir = session_dir.join("images");
        for dir in [&session_dir, &metadata_dir, &images_dir] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| ScannerError::storage(format!("create {}: {}", dir.display(), e)))?;
        }

        let manifest_path = metadata_dir.join(format!("{}_manifest.json", scan_id));
        let manifest = if manifest_path.exists() {
            let bytes = tokio::fs::read(&manifest_path)
                .await
                .map_err(|e| ScannerError::storage(e))?;
            serde_json::from_slice(&bytes)
                .map_err(|e| ScannerError::storage(format!("corrupt manifest: {}", e)))?
        } else {
            SessionManifest {
                scan_id: scan_id.to_string(),
                created_at: Utc::now(),
                session_metadata,
                files: Vec::new(),
                total_bytes: 0,
                finalized: false,
                finalized_at: None,
            }
        };

        info!(scan_id, dir = %session_dir.display(), "session storage ready");
        Ok(Self {
            scan_id: scan_id.to_string(),
            session_dir,
            metadata_dir,
            images_dir,
            manifest: Mutex::new(manifest),
        })
    }

    pub fn scan_id(&self) -> &str {
        &self.scan_id
    }

    pub fn session_dir(&self) -> &Path {
        &self.session_dir
    }

    pub fn images_stored(&self) -> usize {
        // Cheap: the mutex is only contended during a store
        self.manifest
            .try_lock()
            .map(|m| m.files.len())
            .unwrap_or(0)
    }

    /// Store one frame: image bytes, checksum, sidecar, manifest update.
    #[instrument(skip(self, jpeg, metadata), fields(file_id = %metadata.file_id), err)]
    pub async fn store_frame(
        &self,
        jpeg: &[u8],
        mut metadata: StoredFrameMetadata,
    ) -> ScanResult<PathBuf> {
        let checksum = format!("{:x}", Sha256::digest(jpeg));
        metadata.checksum = checksum.clone();
        metadata.scan_session_id = self.scan_id.clone();

        let image_path = self.images_dir.join(format!("{}.jpg", metadata.file_id));
        let sidecar_path = self.metadata_dir.join(format!("{}.json", metadata.file_id));

        atomic_write(&image_path, jpeg).await?;
        let sidecar_json = serde_json::to_vec_pretty(&metadata)
            .map_err(|e| ScannerError::storage(format!("serialize sidecar: {}", e)))?;
        atomic_write(&sidecar_path, &sidecar_json).await?;

        {
            let mut manifest = self.manifest.lock().await;
            manifest.files.push(ManifestEntry {
                file_id: metadata.file_id.clone(),
                image_path: format!("images/{}.jpg", metadata.file_id),
                sidecar_path: format!("metadata/{}.json", metadata.file_id),
                camera_id: metadata.camera_id,
                sequence_number: metadata.sequence_number,
                checksum,
                bytes: jpeg.len(),
            });
            manifest.total_bytes += jpeg.len();
            self.write_manifest(&manifest).await?;
        }

        debug!(path = %image_path.display(), bytes = jpeg.len(), "frame stored");
        Ok(image_path)
    }

    /// Mark the session complete and write the final manifest.
    pub async fn finalize(&self) -> ScanResult<usize> {
        let mut manifest = self.manifest.lock().await;
        manifest.finalized = true;
        manifest.finalized_at = Some(Utc::now());
        self.write_manifest(&manifest).await?;
        info!(
            scan_id = %self.scan_id,
            files = manifest.files.len(),
            total_bytes = manifest.total_bytes,
            "session finalized"
        );
        Ok(manifest.files.len())
    }

    async fn write_manifest(&self, manifest: &SessionManifest) -> ScanResult<()> {
        let path = self
            .metadata_dir
            .join(format!("{}_manifest.json", self.scan_id));
        let json = serde_json::to_vec_pretty(manifest)
            .map_err(|e| ScannerError::storage(format!("serialize manifest: {}", e)))?;
        atomic_write(&path, &json).await
    }
}

//! Scan session persistence.
//!
//! A session is one directory per scan under the configured root:
//!
//! ```text
//! sessions/<scan_id>/
//!   <scan_id>_scan_positions.json    planned points + camera settings
//!   metadata/<file_id>.json          per-image sidecars
//!   metadata/<scan_id>_manifest.json session manifest
//!   images/<file_id>.jpg             captured frames (EXIF embedded)
//! ```
//!
//! All writes are atomic (temp file + rename) so a crash never leaves a
//! half-written JSON or image behind.

pub mod exif;
pub mod positions;
pub mod session;

pub use exif::{encode_with_exif, ExifInfo};
pub use positions::{exposure_string, CameraSettingsRecord, PositionsFile};
pub use session::{ExifSubset, SessionStorage, StoredFrameMetadata};

use scan_core::error::{ScanResult, ScannerError};
use std::path::Path;

/// Write bytes atomically: temp file in the same directory, then rename.
pub async fn atomic_write(path: &Path, bytes: &[u8]) -> ScanResult<()> {
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, bytes)
        .await
        .map_err(|e| ScannerError::storage(format!("write {}: {}", tmp.display(), e)))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| ScannerError::storage(format!("rename to {}: {}", path.display(), e)))?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn atomic_write_replaces_and_leaves_no_temp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        atomic_write(&path, b"one").await.unwrap();
        atomic_write(&path, b"two").await.unwrap();

        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"two");
        assert!(!path.with_extension("tmp").exists());
    }
}

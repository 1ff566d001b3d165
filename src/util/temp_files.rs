//! Private scratch files for screenshots written by other processes
//!
//! GNOME Shell and `gnome-screenshot` write their result to a path we hand
//! them. This module allocates such paths directly in the system temp dir and
//! guarantees the file is removed once the screenshot has been decoded, on
//! every path (success, decode failure, cancellation).
//!
//! # Examples
//!
//! ```
//! use libshot::util::temp_files::ScratchFile;
//!
//! let scratch = ScratchFile::allocate("area", "png").unwrap();
//! let path = scratch.path().to_path_buf();
//! assert!(path.exists());
//!
//! drop(scratch);
//! assert!(!path.exists());
//! ```

use std::{
    fs,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use tempfile::TempPath;

use crate::error::{CaptureError, CaptureResult};

/// A uniquely named, owner-only file that is deleted on drop
///
/// The file is created empty (mode 0600) so no other user can race us to the
/// name. Deletion is best-effort: failures are logged, never raised.
#[derive(Debug)]
pub struct ScratchFile {
    /// Path guard; removes the file when dropped
    path:       TempPath,
    /// Timestamp when the file was allocated
    created_at: DateTime<Utc>,
}

impl ScratchFile {
    /// Directory scratch files are created in
    ///
    /// The system temp dir itself. Files are created there exclusively with
    /// mode 0600, so no shared subdirectory can be planted in advance.
    pub fn temp_dir() -> PathBuf {
        std::env::temp_dir()
    }

    /// Allocates a new scratch file named `libshot-{prefix}-{timestamp}-{random}.{ext}`
    ///
    /// The timestamp keeps leftovers from crashed runs readable; the random
    /// part keeps concurrent allocations unique.
    pub fn allocate(prefix: &str, ext: &str) -> CaptureResult<Self> {
        let dir = Self::temp_dir();
        let created_at = Utc::now();
        let stamp = created_at.format("%Y%m%dT%H%M%S").to_string();

        let file = tempfile::Builder::new()
            .prefix(&format!("libshot-{}-{}-", prefix, stamp))
            .suffix(&format!(".{}", ext))
            .tempfile_in(&dir)
            .map_err(CaptureError::IoError)?;

        let path = file.into_temp_path();
        tracing::debug!("Allocated scratch file {}", path.display());

        Ok(Self { path, created_at })
    }

    /// Path of the scratch file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// When the file was allocated
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Whether the file exists and holds at least one byte
    pub fn has_content(&self) -> bool {
        fs::metadata(&self.path)
            .map(|meta| meta.is_file() && meta.len() > 0)
            .unwrap_or(false)
    }

    /// Removes the file now, logging instead of failing
    pub fn remove(self) {
        let shown_path = self.path.display().to_string();
        match self.path.close() {
            Ok(()) => tracing::trace!("Removed scratch file {}", shown_path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to remove scratch file {}: {}", shown_path, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_creates_empty_file() {
        let scratch = ScratchFile::allocate("test", "png").unwrap();

        assert!(scratch.path().exists());
        assert!(!scratch.has_content());

        let name = scratch.path().file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("libshot-test-"));
        assert!(name.ends_with(".png"));
    }

    #[test]
    fn test_unique_paths() {
        let first = ScratchFile::allocate("area", "png").unwrap();
        let second = ScratchFile::allocate("area", "png").unwrap();
        assert_ne!(first.path(), second.path());
    }

    #[test]
    fn test_removed_on_drop() {
        let path = {
            let scratch = ScratchFile::allocate("drop_test", "png").unwrap();
            scratch.path().to_path_buf()
        };

        assert!(!path.exists());
    }

    #[test]
    fn test_remove_tolerates_already_deleted_file() {
        let scratch = ScratchFile::allocate("gone", "png").unwrap();
        fs::remove_file(scratch.path()).unwrap();
        scratch.remove();
    }

    #[test]
    fn test_has_content_after_write() {
        let scratch = ScratchFile::allocate("content", "png").unwrap();
        fs::write(scratch.path(), b"\x89PNG").unwrap();
        assert!(scratch.has_content());
    }

    #[test]
    fn test_lives_directly_in_system_temp_dir() {
        let scratch = ScratchFile::allocate("dir", "png").unwrap();
        assert_eq!(scratch.path().parent().unwrap(), std::env::temp_dir());
        assert!(scratch.created_at() <= Utc::now());
    }

    #[cfg(unix)]
    #[test]
    fn test_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let scratch = ScratchFile::allocate("mode", "png").unwrap();
        let mode = fs::metadata(scratch.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}

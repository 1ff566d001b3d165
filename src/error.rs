//! Error types for screen capture operations
//!
//! This module defines the error taxonomy with user-facing messages and
//! actionable remediation hints. User cancellation is never an error: every
//! capture operation returns `Ok(None)` when the user backs out.

use std::path::PathBuf;

use crate::model::BackendKind;

/// Result type alias for capture operations
pub type CaptureResult<T> = Result<T, CaptureError>;

/// Error type for screen capture operations
///
/// Each variant includes context and provides remediation hints through the
/// `remediation_hint()` method.
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    /// No usable display server signal was detected
    #[error("Unsupported or unknown session type '{session_type}'; Wayland and X11 are supported")]
    UnsupportedSession {
        /// Raw session type that was detected
        session_type: String,
    },

    /// Monitor index out of range, or the capture primitive failed
    #[error("Invalid capture region: {reason}")]
    InvalidRegion {
        /// What was wrong with the request
        reason: String,
    },

    /// The portal promised a file that never became readable
    #[error("Portal returned a file that could not be found after {attempts} attempts: {}", .path.display())]
    FileUnavailable {
        /// Local path derived from the portal URI
        path:     PathBuf,
        /// Number of open attempts made
        attempts: u32,
    },

    /// An IPC reply or signal did not have the expected shape
    #[error("Protocol violation: {reason}")]
    ProtocolViolation {
        /// Description of the malformed message
        reason: String,
    },

    /// An IPC service could not be reached when a backend was constructed
    #[error("D-Bus service '{service}' is unavailable: {reason}")]
    BusUnavailable {
        /// Well-known bus name that was probed
        service: String,
        /// Underlying failure
        reason:  String,
    },

    /// The selected backend does not offer this operation
    #[error("The {backend} backend does not support {operation}")]
    Unsupported {
        /// Backend that rejected the call
        backend:   BackendKind,
        /// Operation that was requested
        operation: &'static str,
    },

    /// Waiting for a portal response took too long
    #[error("Capture operation timed out after {duration_ms}ms")]
    CaptureTimeout {
        /// Timeout duration in milliseconds
        duration_ms: u64,
    },

    /// The interactive selection overlay could not be shown
    #[error("Selection overlay unavailable: {reason}")]
    OverlayUnavailable {
        /// Reason the overlay failed
        reason: String,
    },

    /// D-Bus transport error
    #[error("D-Bus error: {0}")]
    DBus(#[from] zbus::Error),

    /// I/O error occurred
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Image decode error
    #[error("Image processing error: {0}")]
    ImageError(String),
}

impl CaptureError {
    /// Shorthand for [`CaptureError::InvalidRegion`]
    pub fn invalid_region(reason: impl Into<String>) -> Self {
        CaptureError::InvalidRegion {
            reason: reason.into(),
        }
    }

    /// Shorthand for [`CaptureError::ProtocolViolation`]
    pub fn protocol(reason: impl Into<String>) -> Self {
        CaptureError::ProtocolViolation {
            reason: reason.into(),
        }
    }

    /// Returns an actionable remediation hint for this error
    ///
    /// # Examples
    ///
    /// ```
    /// use libshot::error::CaptureError;
    ///
    /// let error = CaptureError::UnsupportedSession {
    ///     session_type: "tty".to_string(),
    /// };
    ///
    /// assert!(error.remediation_hint().contains("XDG_SESSION_TYPE"));
    /// ```
    pub fn remediation_hint(&self) -> &str {
        match self {
            CaptureError::UnsupportedSession { .. } => {
                "Run inside a graphical session. XDG_SESSION_TYPE must be 'wayland' or 'x11', or \
                 DISPLAY must point at an X server."
            }
            CaptureError::InvalidRegion { .. } => {
                "Use list_monitors to see valid monitor indices (starting at 1) and make sure the \
                 region lies inside a single monitor."
            }
            CaptureError::FileUnavailable { .. } => {
                "The desktop portal reported a screenshot file that never appeared. Check that the \
                 portal backend can write to your Pictures directory and retry."
            }
            CaptureError::ProtocolViolation { .. } => {
                "The D-Bus peer replied with an unexpected message shape. Update \
                 xdg-desktop-portal and its backend, or report the portal version."
            }
            CaptureError::BusUnavailable { .. } => {
                "Ensure a D-Bus session bus is running (DBUS_SESSION_BUS_ADDRESS) and the desktop \
                 service is started."
            }
            CaptureError::Unsupported { backend, .. } => match backend {
                BackendKind::DesktopShell => {
                    "The GNOME Shell backend only captures explicit regions. Pass a region or use \
                     capture_interactive."
                }
                BackendKind::Portal => "This operation is not available through the portal.",
                BackendKind::DirectAccess => "This operation is not available on X11.",
            },
            CaptureError::CaptureTimeout { .. } => {
                "The portal did not answer in time. Close stale permission dialogs and retry, or \
                 raise LIBSHOT_PORTAL_TIMEOUT_SECS."
            }
            CaptureError::OverlayUnavailable { .. } => {
                "The selection overlay needs a reachable X server with a 24 or 32 bit TrueColor \
                 visual. Check DISPLAY."
            }
            CaptureError::DBus(_) => {
                "A D-Bus call failed. Check that xdg-desktop-portal (or GNOME Shell) is running."
            }
            CaptureError::IoError(_) => {
                "An I/O error occurred. Check file permissions, disk space, and system resources."
            }
            CaptureError::ImageError(_) => {
                "The screenshot file could not be decoded. Ensure it is a valid PNG or JPEG."
            }
        }
    }
}

impl From<image::ImageError> for CaptureError {
    fn from(e: image::ImageError) -> Self {
        CaptureError::ImageError(e.to_string())
    }
}

//! Protocol constants and runtime configuration for screen capture.
//!
//! This module consolidates the D-Bus names, retry policy and timeouts used by
//! the backends, so the protocol clients never hard-code them.
//!
//! # Runtime Configuration
//!
//! Tunable values can be overridden at runtime via environment variables:
//!
//! | Environment Variable | Default | Description |
//! |---------------------|---------|-------------|
//! | `LIBSHOT_PORTAL_TIMEOUT_SECS` | 120 | Wait for the portal `Response` signal (`0` = forever) |
//! | `LIBSHOT_FILE_RETRY_ATTEMPTS` | 5 | Attempts to open the file named by the portal |
//! | `LIBSHOT_FILE_RETRY_BACKOFF_MS` | 100 | Sleep between those attempts |
//! | `LIBSHOT_SHELL_TOOL` | `gnome-screenshot` | CLI fallback for the GNOME Shell backend |
//!
//! # Timeout Philosophy
//!
//! The portal request is user-mediated: the dialog stays open until the user
//! picks an area or presses Escape. The default timeout is therefore long and
//! only guards against a portal that never answers.

use std::time::Duration;

/// Desktop identifier matched against `XDG_CURRENT_DESKTOP` to pick the
/// GNOME Shell backend.
pub const SHELL_DESKTOP_IDENTIFIER: &str = "gnome";

/// Well-known bus name of GNOME Shell.
pub const SHELL_BUS_NAME: &str = "org.gnome.Shell";

/// Object path of the GNOME Shell screenshot object.
pub const SHELL_OBJECT_PATH: &str = "/org/gnome/Shell/Screenshot";

/// Interface of the GNOME Shell screenshot object.
pub const SHELL_INTERFACE: &str = "org.gnome.Shell.Screenshot";

/// Well-known bus name of xdg-desktop-portal.
pub const PORTAL_BUS_NAME: &str = "org.freedesktop.portal.Desktop";

/// Object path of the portal frontend.
pub const PORTAL_OBJECT_PATH: &str = "/org/freedesktop/portal/desktop";

/// Screenshot portal interface.
pub const PORTAL_SCREENSHOT_INTERFACE: &str = "org.freedesktop.portal.Screenshot";

/// Interface emitting the asynchronous `Response` signal.
pub const PORTAL_REQUEST_INTERFACE: &str = "org.freedesktop.portal.Request";

/// Portal response code: success.
pub const PORTAL_RESPONSE_SUCCESS: u32 = 0;

/// Portal response code: the user cancelled the interaction.
pub const PORTAL_RESPONSE_CANCELLED: u32 = 1;

/// Default wait for the portal `Response` signal.
pub const PORTAL_TIMEOUT_SECS: u64 = 120;

/// Default number of attempts to open the file named by the portal.
///
/// The `Response` signal can arrive before the file is visible on disk.
pub const FILE_RETRY_ATTEMPTS: u32 = 5;

/// Default backoff between file open attempts.
pub const FILE_RETRY_BACKOFF_MS: u64 = 100;

/// Default CLI fallback for the GNOME Shell backend.
pub const SHELL_FALLBACK_TOOL: &str = "gnome-screenshot";

/// Monitor rectangle reported by Wayland backends when the compositor
/// cannot be queried.
pub const FALLBACK_MONITOR_SIZE: (u32, u32) = (1920, 1080);

// =============================================================================
// Environment Variable Overrides
// =============================================================================

/// Helper to get a number from an environment variable or fall back to default.
fn get_from_env<T: std::str::FromStr>(env_var: &str, default: T) -> T {
    std::env::var(env_var)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Get the portal response timeout, checking environment variable override.
///
/// Override with: `LIBSHOT_PORTAL_TIMEOUT_SECS`. A value of `0` disables the
/// timeout and waits until the portal answers.
///
/// # Example
///
/// ```bash
/// export LIBSHOT_PORTAL_TIMEOUT_SECS=300
/// ```
pub fn portal_timeout() -> Option<Duration> {
    match get_from_env("LIBSHOT_PORTAL_TIMEOUT_SECS", PORTAL_TIMEOUT_SECS) {
        0 => None,
        secs => Some(Duration::from_secs(secs)),
    }
}

/// Get the number of file open attempts, checking environment variable
/// override.
///
/// Override with: `LIBSHOT_FILE_RETRY_ATTEMPTS`. Values below 1 are raised to 1.
pub fn file_retry_attempts() -> u32 {
    get_from_env("LIBSHOT_FILE_RETRY_ATTEMPTS", FILE_RETRY_ATTEMPTS).max(1)
}

/// Get the backoff between file open attempts, checking environment variable
/// override.
///
/// Override with: `LIBSHOT_FILE_RETRY_BACKOFF_MS`.
pub fn file_retry_backoff() -> Duration {
    Duration::from_millis(get_from_env("LIBSHOT_FILE_RETRY_BACKOFF_MS", FILE_RETRY_BACKOFF_MS))
}

/// Get the CLI fallback tool, checking environment variable override.
///
/// Override with: `LIBSHOT_SHELL_TOOL`. Empty values fall back to the default.
pub fn shell_fallback_tool() -> String {
    std::env::var("LIBSHOT_SHELL_TOOL")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| SHELL_FALLBACK_TOOL.to_string())
}

#[cfg(test)]
#[allow(clippy::assertions_on_constants)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_sanity() {
        assert!(FILE_RETRY_ATTEMPTS > 0);
        assert!(FILE_RETRY_BACKOFF_MS < 1000);

        // Portal waits on a human, file retries on the filesystem
        assert!(PORTAL_TIMEOUT_SECS * 1000 > FILE_RETRY_BACKOFF_MS * u64::from(FILE_RETRY_ATTEMPTS));
    }

    #[test]
    fn test_env_override_defaults() {
        temp_env::with_vars_unset(
            [
                "LIBSHOT_PORTAL_TIMEOUT_SECS",
                "LIBSHOT_FILE_RETRY_ATTEMPTS",
                "LIBSHOT_FILE_RETRY_BACKOFF_MS",
                "LIBSHOT_SHELL_TOOL",
            ],
            || {
                assert_eq!(portal_timeout(), Some(Duration::from_secs(PORTAL_TIMEOUT_SECS)));
                assert_eq!(file_retry_attempts(), FILE_RETRY_ATTEMPTS);
                assert_eq!(file_retry_backoff(), Duration::from_millis(FILE_RETRY_BACKOFF_MS));
                assert_eq!(shell_fallback_tool(), SHELL_FALLBACK_TOOL);
            },
        );
    }

    #[test]
    fn test_env_override_with_value() {
        temp_env::with_var("LIBSHOT_PORTAL_TIMEOUT_SECS", Some("30"), || {
            assert_eq!(portal_timeout(), Some(Duration::from_secs(30)));
        });

        temp_env::with_var("LIBSHOT_FILE_RETRY_ATTEMPTS", Some("8"), || {
            assert_eq!(file_retry_attempts(), 8);
        });

        temp_env::with_var("LIBSHOT_FILE_RETRY_BACKOFF_MS", Some("250"), || {
            assert_eq!(file_retry_backoff(), Duration::from_millis(250));
        });

        temp_env::with_var("LIBSHOT_SHELL_TOOL", Some("/usr/local/bin/shot"), || {
            assert_eq!(shell_fallback_tool(), "/usr/local/bin/shot");
        });
    }

    #[test]
    fn test_zero_portal_timeout_disables_it() {
        temp_env::with_var("LIBSHOT_PORTAL_TIMEOUT_SECS", Some("0"), || {
            assert_eq!(portal_timeout(), None);
        });
    }

    #[test]
    fn test_env_override_invalid_value() {
        temp_env::with_var("LIBSHOT_PORTAL_TIMEOUT_SECS", Some("-1"), || {
            // Negative numbers won't parse as u64, should fall back
            assert_eq!(portal_timeout(), Some(Duration::from_secs(PORTAL_TIMEOUT_SECS)));
        });

        temp_env::with_var("LIBSHOT_FILE_RETRY_ATTEMPTS", Some("0"), || {
            assert_eq!(file_retry_attempts(), 1);
        });

        temp_env::with_var("LIBSHOT_FILE_RETRY_BACKOFF_MS", Some("1.5"), || {
            assert_eq!(file_retry_backoff(), Duration::from_millis(FILE_RETRY_BACKOFF_MS));
        });

        temp_env::with_var("LIBSHOT_SHELL_TOOL", Some("  "), || {
            assert_eq!(shell_fallback_tool(), SHELL_FALLBACK_TOOL);
        });
    }
}

//! Session detection logic for libshot
//!
//! This module reads the display-server signals from the process environment
//! and turns them into a [`BackendPlan`]: the decision procedure behind
//! backend selection, kept free of any I/O so it can be tested exhaustively.

use std::env;

use crate::{
    capture::constants::SHELL_DESKTOP_IDENTIFIER,
    error::{CaptureError, CaptureResult},
    model::{SessionEnvironment, SessionType},
};

/// Which backend construction to attempt, decided from the environment alone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendPlan {
    /// GNOME on Wayland: try the shell protocol, fall back to the portal if
    /// it cannot be constructed
    DesktopShellOrPortal,
    /// Any other Wayland desktop
    Portal,
    /// X11 session, or an X display is reachable
    DirectAccess,
}

/// Reads the session environment from the current process
///
/// # Examples
///
/// ```
/// use libshot::util::detect::session_environment;
///
/// let env = session_environment();
/// println!("session type: {}", env.session_type());
/// ```
pub fn session_environment() -> SessionEnvironment {
    session_environment_with(|key| env::var(key).ok())
}

/// Reads the session environment from a custom variable provider
///
/// This allows hosts and tests to inject environment variables.
pub fn session_environment_with<F>(env_provider: F) -> SessionEnvironment
where
    F: Fn(&str) -> Option<String>,
{
    let session_type = SessionType::parse(&env_provider("XDG_SESSION_TYPE").unwrap_or_default());
    let desktop_name = env_provider("XDG_CURRENT_DESKTOP").unwrap_or_default();
    let has_display = env_provider("DISPLAY").is_some_and(|display| !display.is_empty());

    SessionEnvironment::new(session_type, desktop_name, has_display)
}

/// Decides which backend to construct for a session
///
/// Wayland wins over a present `DISPLAY` (XWayland sets it too). Selection is
/// deterministic given the snapshot.
///
/// # Errors
///
/// - [`CaptureError::UnsupportedSession`] - neither Wayland nor X11 signals
pub fn plan_backend(env: &SessionEnvironment) -> CaptureResult<BackendPlan> {
    match env.session_type() {
        SessionType::Wayland if env.desktop_matches(SHELL_DESKTOP_IDENTIFIER) => {
            Ok(BackendPlan::DesktopShellOrPortal)
        }
        SessionType::Wayland => Ok(BackendPlan::Portal),
        SessionType::X11 => Ok(BackendPlan::DirectAccess),
        SessionType::Other(_) if env.has_display() => Ok(BackendPlan::DirectAccess),
        SessionType::Other(raw) => Err(CaptureError::UnsupportedSession {
            session_type: raw.clone(),
        }),
    }
}

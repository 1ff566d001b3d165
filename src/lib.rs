//! libshot: screen capture for Linux that works the same on Wayland and X11
//!
//! A [`Capturer`] inspects the session once, picks one backend (GNOME Shell,
//! the XDG screenshot portal, or direct X11 access) and captures regions,
//! whole monitors, or a user-selected area through it. User cancellation is
//! reported as `Ok(None)`, never as an error.

pub mod capture;
pub mod error;
pub mod model;
pub mod util;

pub use capture::{CapturedImage, Capturer};
pub use error::{CaptureError, CaptureResult};
pub use model::{BackendKind, MonitorRect, Region, SessionEnvironment};

//! Backend selection and the capture facade
//!
//! This module ties the pieces together:
//!
//! - [`Backend`]: the closed set of capture backends, dispatched by `match`
//! - [`BackendFactory`]: how each backend gets constructed (injectable)
//! - [`select_backend`]: the decision procedure, including the single
//!   GNOME Shell to portal fallback
//! - [`Capturer`]: the context object a host creates once; it selects a
//!   backend lazily on first use and keeps it for its lifetime
//!
//! # Examples
//!
//! ```no_run
//! use libshot::{capture::Capturer, model::Region};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let capturer = Capturer::new();
//!
//!     match capturer.capture_interactive().await? {
//!         Some(image) => println!("Captured {}x{}", image.width(), image.height()),
//!         None => println!("Cancelled"),
//!     }
//!
//!     let area = capturer.capture(Region::new(0, 0, 640, 480), 1).await?;
//!     println!("backend: {}", capturer.backend_kind().await?);
//!     # let _ = area;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::OnceCell;

use crate::{
    error::{CaptureError, CaptureResult},
    model::{BackendKind, MonitorRect, Region, SessionEnvironment},
    util::detect::{self, BackendPlan},
};

pub mod constants;
pub mod image_buffer;
pub mod mock;
pub mod overlay;
pub mod portal_backend;
pub mod primitive;
pub mod selector;
pub mod shell_backend;
pub mod x11_backend;

pub use image_buffer::CapturedImage;
pub use portal_backend::PortalBackend;
pub use shell_backend::DesktopShellBackend;
pub use x11_backend::DirectAccessBackend;

use self::{
    constants::FALLBACK_MONITOR_SIZE,
    primitive::{CapturePrimitive, XcapPrimitive, physical_monitors},
};

/// Grabs `rect` through the primitive on the blocking pool
///
/// Every failure is reported as [`CaptureError::InvalidRegion`].
pub(crate) async fn grab_region(
    primitive: &Arc<dyn CapturePrimitive>,
    rect: MonitorRect,
) -> CaptureResult<CapturedImage> {
    let primitive = Arc::clone(primitive);
    let frame = tokio::task::spawn_blocking(move || primitive.grab(rect))
        .await
        .map_err(|e| CaptureError::invalid_region(format!("capture task failed: {}", e)))?
        .map_err(|e| match e {
            e @ CaptureError::InvalidRegion { .. } => e,
            other => CaptureError::invalid_region(other.to_string()),
        })?;

    CapturedImage::from_raw_frame(frame).map_err(|e| CaptureError::invalid_region(e.to_string()))
}

/// Monitor list for Wayland backends
///
/// Compositors rarely let clients query outputs, so a failing primitive is
/// not an error: a single default-sized monitor is reported instead.
pub(crate) async fn wayland_monitors(primitive: &Arc<dyn CapturePrimitive>) -> Vec<MonitorRect> {
    let primitive = Arc::clone(primitive);
    let fallback = || vec![MonitorRect::new(0, 0, FALLBACK_MONITOR_SIZE.0, FALLBACK_MONITOR_SIZE.1)];

    match tokio::task::spawn_blocking(move || physical_monitors(primitive.as_ref())).await {
        Ok(Ok(monitors)) if !monitors.is_empty() => monitors,
        Ok(Ok(_)) => {
            tracing::warn!("No monitors reported, assuming a single default monitor");
            fallback()
        }
        Ok(Err(e)) => {
            tracing::warn!("Monitor query failed ({}), assuming a single default monitor", e);
            fallback()
        }
        Err(e) => {
            tracing::warn!("Monitor query task failed ({}), assuming a single default monitor", e);
            fallback()
        }
    }
}

/// The selected capture backend
pub enum Backend {
    DesktopShell(DesktopShellBackend),
    Portal(PortalBackend),
    DirectAccess(DirectAccessBackend),
}

impl Backend {
    pub fn kind(&self) -> BackendKind {
        match self {
            Backend::DesktopShell(_) => BackendKind::DesktopShell,
            Backend::Portal(_) => BackendKind::Portal,
            Backend::DirectAccess(_) => BackendKind::DirectAccess,
        }
    }

    pub async fn capture(&self, region: Option<Region>, monitor: usize) -> CaptureResult<Option<CapturedImage>> {
        match self {
            Backend::DesktopShell(backend) => backend.capture(region, monitor).await,
            Backend::Portal(backend) => backend.capture(region, monitor).await,
            Backend::DirectAccess(backend) => backend.capture(region, monitor).await,
        }
    }

    pub async fn capture_interactive(&self) -> CaptureResult<Option<CapturedImage>> {
        match self {
            Backend::DesktopShell(backend) => backend.capture_interactive().await,
            Backend::Portal(backend) => backend.capture_interactive().await,
            Backend::DirectAccess(backend) => backend.capture_interactive().await,
        }
    }

    pub async fn list_monitors(&self) -> CaptureResult<Vec<MonitorRect>> {
        match self {
            Backend::DesktopShell(backend) => Ok(backend.list_monitors().await),
            Backend::Portal(backend) => Ok(backend.list_monitors().await),
            Backend::DirectAccess(backend) => backend.list_monitors().await,
        }
    }
}

/// Constructs backends for [`select_backend`]
///
/// Construction of the two D-Bus backends performs I/O (connecting, probing
/// bus names) and may fail with [`CaptureError::BusUnavailable`].
#[async_trait]
pub trait BackendFactory: Send + Sync {
    async fn desktop_shell(&self) -> CaptureResult<DesktopShellBackend>;

    async fn portal(&self) -> CaptureResult<PortalBackend>;

    fn direct_access(&self) -> CaptureResult<DirectAccessBackend>;
}

/// Production [`BackendFactory`]: session bus, xcap and x11rb
pub struct SystemBackendFactory {
    primitive: Arc<dyn CapturePrimitive>,
}

impl Default for SystemBackendFactory {
    fn default() -> Self {
        Self::new(Arc::new(XcapPrimitive::new()))
    }
}

impl SystemBackendFactory {
    pub fn new(primitive: Arc<dyn CapturePrimitive>) -> Self {
        Self { primitive }
    }
}

#[async_trait]
impl BackendFactory for SystemBackendFactory {
    async fn desktop_shell(&self) -> CaptureResult<DesktopShellBackend> {
        DesktopShellBackend::connect(Arc::clone(&self.primitive)).await
    }

    async fn portal(&self) -> CaptureResult<PortalBackend> {
        PortalBackend::connect(Arc::clone(&self.primitive)).await
    }

    fn direct_access(&self) -> CaptureResult<DirectAccessBackend> {
        Ok(DirectAccessBackend::new(
            Arc::clone(&self.primitive),
            Arc::new(x11_backend::X11SurfaceFactory),
        ))
    }
}

/// Chooses and constructs the backend for `env`
///
/// GNOME on Wayland tries the shell first; if it cannot be constructed the
/// portal is used instead. That decision is final.
///
/// # Errors
///
/// - [`CaptureError::UnsupportedSession`] - neither Wayland nor X11
/// - [`CaptureError::BusUnavailable`] - the portal could not be constructed
pub async fn select_backend(env: &SessionEnvironment, factory: &dyn BackendFactory) -> CaptureResult<Backend> {
    let plan = detect::plan_backend(env)?;
    tracing::debug!(
        "Session '{}' on '{}' (display: {}) -> {:?}",
        env.session_type(),
        env.desktop_name(),
        env.has_display(),
        plan
    );

    let backend = match plan {
        BackendPlan::DesktopShellOrPortal => match factory.desktop_shell().await {
            Ok(shell) => Backend::DesktopShell(shell),
            Err(e) => {
                tracing::warn!("GNOME Shell backend unavailable ({}), using the portal", e);
                Backend::Portal(factory.portal().await?)
            }
        },
        BackendPlan::Portal => Backend::Portal(factory.portal().await?),
        BackendPlan::DirectAccess => Backend::DirectAccess(factory.direct_access()?),
    };

    tracing::info!("Using the {} backend", backend.kind());
    Ok(backend)
}

/// Screen capture entry point
///
/// Create one per process (or per host component) and share it. The backend
/// is chosen on the first call that needs it and never changes afterwards;
/// a failed selection is retried on the next call.
pub struct Capturer {
    environment: Option<SessionEnvironment>,
    factory:     Arc<dyn BackendFactory>,
    backend:     OnceCell<Backend>,
}

impl Default for Capturer {
    fn default() -> Self {
        Self::new()
    }
}

impl Capturer {
    /// Uses the process environment and the system backends
    pub fn new() -> Self {
        Self::with_factory(Arc::new(SystemBackendFactory::default()))
    }

    pub fn with_factory(factory: Arc<dyn BackendFactory>) -> Self {
        Self {
            environment: None,
            factory,
            backend: OnceCell::new(),
        }
    }

    /// Selects from `environment` instead of reading the process environment
    pub fn with_environment(mut self, environment: SessionEnvironment) -> Self {
        self.environment = Some(environment);
        self
    }

    async fn backend(&self) -> CaptureResult<&Backend> {
        self.backend
            .get_or_try_init(|| async {
                let env = self
                    .environment
                    .clone()
                    .unwrap_or_else(detect::session_environment);
                select_backend(&env, self.factory.as_ref()).await
            })
            .await
    }

    /// Kind of the selected backend, selecting it if needed
    pub async fn backend_kind(&self) -> CaptureResult<BackendKind> {
        Ok(self.backend().await?.kind())
    }

    /// Captures `region` (desktop coordinates) or all of monitor `monitor`
    ///
    /// Monitors are numbered from 1. Wayland backends ignore `monitor`.
    /// Returns `Ok(None)` when the user cancelled.
    ///
    /// # Errors
    ///
    /// - [`CaptureError::UnsupportedSession`] - no backend fits the session
    /// - [`CaptureError::InvalidRegion`] - bad monitor index or grab failure
    /// - [`CaptureError::Unsupported`] - GNOME Shell without a region
    /// - [`CaptureError::FileUnavailable`],
    ///   [`CaptureError::ProtocolViolation`],
    ///   [`CaptureError::CaptureTimeout`] - portal exchange failed
    pub async fn capture(&self, region: Option<Region>, monitor: usize) -> CaptureResult<Option<CapturedImage>> {
        self.backend().await?.capture(region, monitor).await
    }

    /// Lets the user pick an area and captures it
    ///
    /// Returns `Ok(None)` when the user cancelled.
    pub async fn capture_interactive(&self) -> CaptureResult<Option<CapturedImage>> {
        self.backend().await?.capture_interactive().await
    }

    /// Physical monitor rectangles
    pub async fn list_monitors(&self) -> CaptureResult<Vec<MonitorRect>> {
        self.backend().await?.list_monitors().await
    }
}

//! Direct-access capture backend for X11
//!
//! On X11 any client may read the screen, so this backend asks the capture
//! primitive for geometry and pixels directly. Interactive capture shows a
//! snapshot of the first monitor in an [`X11Overlay`] and captures what the
//! user drags out on it.
//!
//! # Examples
//!
//! ```no_run
//! use libshot::{capture::x11_backend::DirectAccessBackend, model::Region};
//!
//! #[tokio::main]
//! async fn main() {
//!     let backend = DirectAccessBackend::system();
//!
//!     let monitors = backend.list_monitors().await.unwrap();
//!     println!("{} monitor(s)", monitors.len());
//!
//!     let image = backend.capture(Region::new(100, 100, 500, 500), 1).await.unwrap();
//!     assert_eq!(image.unwrap().dimensions(), (500, 500));
//! }
//! ```

use std::{io, sync::Arc};

use crate::{
    capture::{
        CapturedImage, grab_region,
        overlay::X11Overlay,
        primitive::{CapturePrimitive, XcapPrimitive, physical_monitors},
        selector::{SelectionSurface, run_selection},
    },
    error::{CaptureError, CaptureResult},
    model::{MonitorRect, Region},
};

/// Opens the surface used for interactive selection
pub trait SurfaceFactory: Send + Sync {
    /// Shows `snapshot` with its top-left corner at `origin` (desktop
    /// coordinates)
    fn open(&self, snapshot: &CapturedImage, origin: (i32, i32)) -> CaptureResult<Box<dyn SelectionSurface>>;
}

/// [`SurfaceFactory`] producing [`X11Overlay`] windows
#[derive(Debug, Default, Clone, Copy)]
pub struct X11SurfaceFactory;

impl SurfaceFactory for X11SurfaceFactory {
    fn open(&self, snapshot: &CapturedImage, origin: (i32, i32)) -> CaptureResult<Box<dyn SelectionSurface>> {
        Ok(Box::new(X11Overlay::open(snapshot, origin)?))
    }
}

/// X11 backend reading pixels straight from the X server
pub struct DirectAccessBackend {
    primitive: Arc<dyn CapturePrimitive>,
    surfaces:  Arc<dyn SurfaceFactory>,
}

impl DirectAccessBackend {
    pub fn new(primitive: Arc<dyn CapturePrimitive>, surfaces: Arc<dyn SurfaceFactory>) -> Self {
        Self { primitive, surfaces }
    }

    /// xcap for pixels, x11rb for the selection overlay
    pub fn system() -> Self {
        Self::new(Arc::new(XcapPrimitive::new()), Arc::new(X11SurfaceFactory))
    }

    /// Physical monitors, in primitive order
    ///
    /// # Errors
    ///
    /// - [`CaptureError::InvalidRegion`] - the primitive failed
    pub async fn list_monitors(&self) -> CaptureResult<Vec<MonitorRect>> {
        let primitive = Arc::clone(&self.primitive);
        tokio::task::spawn_blocking(move || physical_monitors(primitive.as_ref()))
            .await
            .map_err(|e| CaptureError::invalid_region(format!("monitor query task failed: {}", e)))?
            .map_err(|e| match e {
                e @ CaptureError::InvalidRegion { .. } => e,
                other => CaptureError::invalid_region(other.to_string()),
            })
    }

    /// Captures `region`, or all of monitor `monitor` (1-based)
    ///
    /// `region` is in desktop coordinates. `monitor` is validated even when a
    /// region is given.
    ///
    /// # Errors
    ///
    /// - [`CaptureError::InvalidRegion`] - `monitor` out of range, or the
    ///   grab failed
    pub async fn capture(&self, region: Option<Region>, monitor: usize) -> CaptureResult<Option<CapturedImage>> {
        let monitors = self.list_monitors().await?;
        if monitor == 0 || monitor > monitors.len() {
            return Err(CaptureError::invalid_region(format!(
                "Monitor {} is not available; valid monitors are 1..={}",
                monitor,
                monitors.len()
            )));
        }

        let rect = region.map(MonitorRect::from).unwrap_or(monitors[monitor - 1]);
        tracing::debug!("Direct capture of {:?} (monitor {})", rect, monitor);
        grab_region(&self.primitive, rect).await.map(Some)
    }

    /// Lets the user drag a region on monitor 1 and captures it
    ///
    /// Returns `Ok(None)` when the user cancelled or selected nothing.
    ///
    /// # Errors
    ///
    /// - [`CaptureError::InvalidRegion`] - no monitor, or a grab failed
    /// - [`CaptureError::OverlayUnavailable`] - the overlay could not run
    pub async fn capture_interactive(&self) -> CaptureResult<Option<CapturedImage>> {
        let monitors = self.list_monitors().await?;
        let first = *monitors
            .first()
            .ok_or_else(|| CaptureError::invalid_region("No monitors available"))?;

        let snapshot = grab_region(&self.primitive, first).await?;
        let surfaces = Arc::clone(&self.surfaces);
        let origin = (first.left, first.top);

        let selection = tokio::task::spawn_blocking(move || {
            let mut surface = surfaces.open(&snapshot, origin)?;
            run_selection(surface.as_mut())
        })
        .await
        .map_err(|e| CaptureError::IoError(io::Error::other(e)))??;

        let Some(selection) = selection else {
            tracing::info!("Interactive selection cancelled");
            return Ok(None);
        };

        let absolute = selection.translate(first.left, first.top);
        tracing::debug!("Selected {} on monitor 1, capturing {}", selection, absolute);
        self.capture(Some(absolute), 1).await
    }
}

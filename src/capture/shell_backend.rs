//! GNOME Shell screenshot backend
//!
//! GNOME on Wayland offers its own, non-sandboxed screenshot interface on the
//! session bus. An interactive capture is two calls:
//!
//! 1. `SelectArea()` lets the user drag a rectangle and returns it
//! 2. `ScreenshotArea(x, y, w, h, flash, filename)` writes that rectangle to
//!    a file we own
//!
//! Newer GNOME releases restrict this interface to allow-listed callers, so
//! any failure along the way is turned into a [`ShellFailure`] and the
//! `gnome-screenshot -a` command line tool is run once instead. The fallback
//! reports problems as "no image", never as an error.

use std::{
    ffi::OsString,
    fmt, io,
    path::Path,
    process::Stdio,
    sync::Arc,
};

use async_trait::async_trait;
use tokio::sync::Mutex;
use zbus::{Connection, Proxy, fdo::DBusProxy, names::BusName};

use crate::{
    capture::{
        CapturedImage,
        constants::{self, SHELL_BUS_NAME, SHELL_INTERFACE, SHELL_OBJECT_PATH},
        grab_region,
        primitive::CapturePrimitive,
        wayland_monitors,
    },
    error::{CaptureError, CaptureResult},
    model::{BackendKind, MonitorRect, Region},
    util::temp_files::ScratchFile,
};

/// Reply of `SelectArea`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AreaReply {
    pub success: bool,
    pub x:       i32,
    pub y:       i32,
    pub width:   i32,
    pub height:  i32,
}

impl AreaReply {
    pub fn selected(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            success: true,
            x,
            y,
            width,
            height,
        }
    }

    pub fn cancelled() -> Self {
        Self {
            success: false,
            x:       0,
            y:       0,
            width:   0,
            height:  0,
        }
    }

    /// The selected region, or `None` if nothing usable was selected
    pub fn region(&self) -> Option<Region> {
        if !self.success {
            return None;
        }
        let width = u32::try_from(self.width).ok()?;
        let height = u32::try_from(self.height).ok()?;
        Region::new(self.x, self.y, width, height)
    }
}

/// IPC operations of `org.gnome.Shell.Screenshot`
#[async_trait]
pub trait ShellBus: Send + Sync {
    async fn select_area(&self) -> CaptureResult<AreaReply>;

    /// Returns the `success` flag of the reply
    async fn screenshot_area(&self, region: Region, flash: bool, path: &Path) -> CaptureResult<bool>;
}

/// [`ShellBus`] over the D-Bus session bus
pub struct ZbusShellBus {
    proxy: Proxy<'static>,
}

impl fmt::Debug for ZbusShellBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ZbusShellBus").finish_non_exhaustive()
    }
}

impl ZbusShellBus {
    /// Connects to the session bus and checks that GNOME Shell is on it
    ///
    /// # Errors
    ///
    /// - [`CaptureError::BusUnavailable`] - no session bus, or nobody owns
    ///   `org.gnome.Shell`
    pub async fn connect() -> CaptureResult<Self> {
        let unavailable = |reason: String| CaptureError::BusUnavailable {
            service: SHELL_BUS_NAME.to_string(),
            reason,
        };

        let conn = Connection::session()
            .await
            .map_err(|e| unavailable(e.to_string()))?;

        let name = BusName::try_from(SHELL_BUS_NAME).map_err(|e| unavailable(e.to_string()))?;
        let owned = DBusProxy::new(&conn)
            .await
            .map_err(|e| unavailable(e.to_string()))?
            .name_has_owner(name)
            .await
            .map_err(|e| unavailable(e.to_string()))?;
        if !owned {
            return Err(unavailable("name has no owner".to_string()));
        }

        let proxy = Proxy::new(&conn, SHELL_BUS_NAME, SHELL_OBJECT_PATH, SHELL_INTERFACE)
            .await
            .map_err(|e| unavailable(e.to_string()))?;

        Ok(Self { proxy })
    }
}

/// D-Bus name GLib gives an unmapped `G_IO_ERROR_CANCELLED`
const GIO_CANCELLED_ERROR: &str = "org.gtk.GDBus.UnmappedGError.Quark._g_2dio_2derror_2dquark.Code19";

/// GNOME Shell reports a cancelled `SelectArea` as a `G_IO_ERROR_CANCELLED`
/// method error; only that exact error name counts
fn is_cancellation_name(name: &str) -> bool {
    name == GIO_CANCELLED_ERROR
}

fn is_cancellation(error: &zbus::Error) -> bool {
    match error {
        zbus::Error::MethodError(name, _, _) => is_cancellation_name(name.as_str()),
        _ => false,
    }
}

#[async_trait]
impl ShellBus for ZbusShellBus {
    async fn select_area(&self) -> CaptureResult<AreaReply> {
        let reply = match self.proxy.call_method("SelectArea", &()).await {
            Ok(reply) => reply,
            Err(e) if is_cancellation(&e) => return Ok(AreaReply::cancelled()),
            Err(e) => return Err(e.into()),
        };

        let body = reply.body();
        if let Ok((success, (x, y, width, height))) = body.deserialize::<(bool, (i32, i32, i32, i32))>() {
            return Ok(AreaReply {
                success,
                x,
                y,
                width,
                height,
            });
        }
        // GNOME Shell's own signature: (iiii), errors on cancel
        let (x, y, width, height) = body
            .deserialize::<(i32, i32, i32, i32)>()
            .map_err(|e| CaptureError::protocol(format!("Unexpected SelectArea reply: {}", e)))?;
        Ok(AreaReply::selected(x, y, width, height))
    }

    async fn screenshot_area(&self, region: Region, flash: bool, path: &Path) -> CaptureResult<bool> {
        let filename = path.to_string_lossy();
        let (x, y, width, height) = region.as_tuple();
        let args = (
            x,
            y,
            i32::try_from(width).map_err(|_| CaptureError::invalid_region("width out of range"))?,
            i32::try_from(height).map_err(|_| CaptureError::invalid_region("height out of range"))?,
            flash,
            filename.as_ref(),
        );

        let reply = self.proxy.call_method("ScreenshotArea", &args).await?;
        let body = reply.body();
        if let Ok((success, _filename_used)) = body.deserialize::<(bool, String)>() {
            return Ok(success);
        }
        body.deserialize::<bool>()
            .map_err(|e| CaptureError::protocol(format!("Unexpected ScreenshotArea reply: {}", e)))
    }
}

/// Command line tool that lets the user pick an area and writes it to a file
#[async_trait]
pub trait AreaScreenshotTool: Send + Sync {
    /// Runs the tool to completion; `Ok(None)` when killed by a signal
    async fn run(&self, args: &[OsString]) -> io::Result<Option<i32>>;
}

/// [`AreaScreenshotTool`] spawning a real process
#[derive(Debug, Clone)]
pub struct CommandTool {
    program: String,
}

impl CommandTool {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Uses `LIBSHOT_SHELL_TOOL`, or `gnome-screenshot`
    pub fn from_env() -> Self {
        Self::new(constants::shell_fallback_tool())
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

#[async_trait]
impl AreaScreenshotTool for CommandTool {
    async fn run(&self, args: &[OsString]) -> io::Result<Option<i32>> {
        let status = tokio::process::Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await?;
        Ok(status.code())
    }
}

/// Why the shell protocol could not deliver an image
#[derive(Debug, thiserror::Error)]
pub(crate) enum ShellFailure {
    #[error("SelectArea failed: {0}")]
    SelectArea(#[source] CaptureError),

    #[error("could not allocate a scratch file: {0}")]
    Scratch(#[source] CaptureError),

    #[error("ScreenshotArea failed: {0}")]
    ScreenshotArea(#[source] CaptureError),

    #[error("ScreenshotArea reported failure")]
    ScreenshotRejected,

    #[error("could not load the screenshot: {0}")]
    Load(#[source] CaptureError),
}

async fn load_scratch(scratch: &ScratchFile) -> CaptureResult<CapturedImage> {
    let path = scratch.path().to_path_buf();
    tokio::task::spawn_blocking(move || CapturedImage::open(&path))
        .await
        .map_err(|e| CaptureError::IoError(io::Error::other(e)))?
}

/// Runs the shell protocol with its command line fallback
pub struct ShellClient {
    bus:      Arc<dyn ShellBus>,
    tool:     Arc<dyn AreaScreenshotTool>,
    exchange: Mutex<()>,
}

impl ShellClient {
    pub fn new(bus: Arc<dyn ShellBus>, tool: Arc<dyn AreaScreenshotTool>) -> Self {
        Self {
            bus,
            tool,
            exchange: Mutex::new(()),
        }
    }

    /// Lets the user select an area and captures it
    ///
    /// Never fails: a cancelled selection and a failed fallback both yield
    /// `None`.
    pub async fn capture_interactive(&self) -> Option<CapturedImage> {
        let _exchange = self.exchange.lock().await;

        match self.via_shell().await {
            Ok(image) => image,
            Err(failure) => {
                tracing::warn!("GNOME Shell screenshot failed ({}), falling back to the command line tool", failure);
                self.via_tool().await
            }
        }
    }

    async fn via_shell(&self) -> Result<Option<CapturedImage>, ShellFailure> {
        let reply = self.bus.select_area().await.map_err(ShellFailure::SelectArea)?;
        let Some(region) = reply.region() else {
            tracing::info!("No area selected");
            return Ok(None);
        };
        tracing::debug!("SelectArea returned {}", region);

        let scratch = ScratchFile::allocate("shell-area", "png").map_err(ShellFailure::Scratch)?;
        let success = self
            .bus
            .screenshot_area(region, false, scratch.path())
            .await
            .map_err(ShellFailure::ScreenshotArea)?;
        if !success {
            return Err(ShellFailure::ScreenshotRejected);
        }

        let image = load_scratch(&scratch).await.map_err(ShellFailure::Load)?;
        scratch.remove();
        Ok(Some(image))
    }

    async fn via_tool(&self) -> Option<CapturedImage> {
        let scratch = match ScratchFile::allocate("tool-area", "png") {
            Ok(scratch) => scratch,
            Err(e) => {
                tracing::error!("Fallback screenshot aborted, no scratch file: {}", e);
                return None;
            }
        };

        let args = [
            OsString::from("-a"),
            OsString::from("-f"),
            scratch.path().as_os_str().to_os_string(),
        ];
        match self.tool.run(&args).await {
            Ok(Some(0)) => {}
            Ok(code) => {
                tracing::info!("Fallback screenshot cancelled or failed (exit {:?})", code);
                return None;
            }
            Err(e) => {
                tracing::error!("Fallback screenshot tool could not be run: {}", e);
                return None;
            }
        }

        if !scratch.has_content() {
            tracing::info!("Fallback screenshot tool wrote nothing");
            return None;
        }

        match load_scratch(&scratch).await {
            Ok(image) => Some(image),
            Err(e) => {
                tracing::error!("Fallback screenshot could not be decoded: {}", e);
                None
            }
        }
    }
}

/// Wayland backend for GNOME Shell
pub struct DesktopShellBackend {
    client:    ShellClient,
    primitive: Arc<dyn CapturePrimitive>,
}

impl DesktopShellBackend {
    pub fn new(client: ShellClient, primitive: Arc<dyn CapturePrimitive>) -> Self {
        Self { client, primitive }
    }

    /// Connects to GNOME Shell on the session bus
    ///
    /// # Errors
    ///
    /// - [`CaptureError::BusUnavailable`] - see [`ZbusShellBus::connect`]
    pub async fn connect(primitive: Arc<dyn CapturePrimitive>) -> CaptureResult<Self> {
        let bus = ZbusShellBus::connect().await?;
        let client = ShellClient::new(Arc::new(bus), Arc::new(CommandTool::from_env()));
        Ok(Self::new(client, primitive))
    }

    /// Grabs an explicit region through the capture primitive
    ///
    /// # Errors
    ///
    /// - [`CaptureError::Unsupported`] - no region given
    /// - [`CaptureError::InvalidRegion`] - the primitive could not grab it
    pub async fn capture(&self, region: Option<Region>, _monitor: usize) -> CaptureResult<Option<CapturedImage>> {
        let Some(region) = region else {
            return Err(CaptureError::Unsupported {
                backend:   BackendKind::DesktopShell,
                operation: "full-screen capture",
            });
        };
        grab_region(&self.primitive, MonitorRect::from(region)).await.map(Some)
    }

    pub async fn capture_interactive(&self) -> CaptureResult<Option<CapturedImage>> {
        Ok(self.client.capture_interactive().await)
    }

    pub async fn list_monitors(&self) -> Vec<MonitorRect> {
        wayland_monitors(&self.primitive).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::mock::{MockPrimitive, MockShellBus, MockTool, ToolBehavior};

    fn client(bus: &Arc<MockShellBus>, tool: &Arc<MockTool>) -> ShellClient {
        ShellClient::new(bus.clone(), tool.clone())
    }

    #[test]
    fn test_area_reply_region() {
        assert_eq!(
            AreaReply::selected(10, 20, 30, 40).region().unwrap().as_tuple(),
            (10, 20, 30, 40)
        );
        assert!(AreaReply::cancelled().region().is_none());
        assert!(AreaReply::selected(10, 20, 0, 40).region().is_none());
        assert!(AreaReply::selected(10, 20, -5, 40).region().is_none());
    }

    #[test]
    fn test_cancellation_detection_ignores_other_errors() {
        assert!(!is_cancellation(&zbus::Error::Failure("boom".to_string())));
        assert!(!is_cancellation(&zbus::Error::Failure(GIO_CANCELLED_ERROR.to_string())));
    }

    #[test]
    fn test_cancellation_name_is_exact() {
        assert!(is_cancellation_name(
            "org.gtk.GDBus.UnmappedGError.Quark._g_2dio_2derror_2dquark.Code19"
        ));
        assert!(!is_cancellation_name("org.freedesktop.DBus.Error.AccessDenied"));
        assert!(!is_cancellation_name(
            "org.gtk.GDBus.UnmappedGError.Quark._g_2dio_2derror_2dquark.Code1"
        ));
        assert!(!is_cancellation_name("org.example.Error.Code19"));
        assert!(!is_cancellation_name("org.example.Error.Cancelled"));
    }

    #[tokio::test]
    async fn test_shell_success() {
        let bus = Arc::new(MockShellBus::new(Ok(AreaReply::selected(5, 6, 64, 32))));
        let tool = Arc::new(MockTool::new(ToolBehavior::Exit(0)));

        let image = client(&bus, &tool).capture_interactive().await.unwrap();
        assert_eq!(image.dimensions(), (64, 32));
        assert_eq!(bus.screenshot_calls(), 1);
        assert_eq!(tool.runs(), 0);

        let written = bus.last_path().unwrap();
        assert!(!written.exists(), "scratch file must be removed");
    }

    #[tokio::test]
    async fn test_user_cancel_skips_screenshot_and_fallback() {
        let bus = Arc::new(MockShellBus::new(Ok(AreaReply::cancelled())));
        let tool = Arc::new(MockTool::new(ToolBehavior::Exit(0)));

        assert!(client(&bus, &tool).capture_interactive().await.is_none());
        assert_eq!(bus.screenshot_calls(), 0);
        assert_eq!(tool.runs(), 0);
    }

    #[tokio::test]
    async fn test_zero_area_selection_is_none() {
        let bus = Arc::new(MockShellBus::new(Ok(AreaReply::selected(5, 5, 0, 10))));
        let tool = Arc::new(MockTool::new(ToolBehavior::Exit(0)));

        assert!(client(&bus, &tool).capture_interactive().await.is_none());
        assert_eq!(bus.screenshot_calls(), 0);
    }

    #[tokio::test]
    async fn test_screenshot_failure_runs_fallback_once() {
        let bus = Arc::new(MockShellBus::new(Ok(AreaReply::selected(0, 0, 10, 10))).rejecting_screenshots());
        let tool = Arc::new(MockTool::new(ToolBehavior::WriteImage(40, 30)));

        let image = client(&bus, &tool).capture_interactive().await.unwrap();
        assert_eq!(image.dimensions(), (40, 30));
        assert_eq!(bus.select_calls(), 1);
        assert_eq!(bus.screenshot_calls(), 1);
        assert_eq!(tool.runs(), 1);

        let args = tool.last_args();
        assert_eq!(args[0], "-a");
        assert_eq!(args[1], "-f");
        assert!(!Path::new(&args[2]).exists(), "fallback scratch file must be removed");
    }

    #[tokio::test]
    async fn test_screenshot_bus_error_runs_fallback_once() {
        let bus = Arc::new(MockShellBus::new(Ok(AreaReply::selected(0, 0, 10, 10))).erroring_screenshots());
        let tool = Arc::new(MockTool::new(ToolBehavior::WriteImage(12, 9)));

        let image = client(&bus, &tool).capture_interactive().await.unwrap();
        assert_eq!(image.dimensions(), (12, 9));
        assert_eq!(bus.screenshot_calls(), 1);
        assert_eq!(tool.runs(), 1);
        assert!(!bus.last_path().unwrap().exists(), "scratch file must be removed");
    }

    #[tokio::test]
    async fn test_undecodable_screenshot_is_removed_and_falls_back() {
        let bus = Arc::new(MockShellBus::new(Ok(AreaReply::selected(0, 0, 10, 10))).writing_garbage());
        let tool = Arc::new(MockTool::new(ToolBehavior::WriteImage(7, 5)));

        let image = client(&bus, &tool).capture_interactive().await.unwrap();
        assert_eq!(image.dimensions(), (7, 5));
        assert_eq!(bus.select_calls(), 1);
        assert_eq!(bus.screenshot_calls(), 1);
        assert_eq!(tool.runs(), 1);
        assert!(!bus.last_path().unwrap().exists(), "undecodable scratch file must be removed");
    }

    #[tokio::test]
    async fn test_select_area_bus_error_runs_fallback() {
        let bus = Arc::new(MockShellBus::new(Err(CaptureError::protocol("AccessDenied"))));
        let tool = Arc::new(MockTool::new(ToolBehavior::WriteImage(8, 8)));

        assert!(client(&bus, &tool).capture_interactive().await.is_some());
        assert_eq!(tool.runs(), 1);
        assert_eq!(bus.screenshot_calls(), 0);
    }

    #[tokio::test]
    async fn test_fallback_failures_are_none() {
        let failing = [
            ToolBehavior::Exit(1),
            ToolBehavior::Exit(0),
            ToolBehavior::Killed,
            ToolBehavior::Missing,
            ToolBehavior::WriteGarbage,
        ];

        for behavior in failing {
            let bus = Arc::new(MockShellBus::new(Err(CaptureError::protocol("denied"))));
            let tool = Arc::new(MockTool::new(behavior.clone()));

            let result = client(&bus, &tool).capture_interactive().await;
            assert!(result.is_none(), "{:?} should yield no image", behavior);
            assert_eq!(tool.runs(), 1);
        }
    }

    #[tokio::test]
    async fn test_command_tool_reports_exit_code() {
        let tool = CommandTool::new("sh");
        let code = tool
            .run(&[OsString::from("-c"), OsString::from("exit 3")])
            .await
            .unwrap();
        assert_eq!(code, Some(3));
    }

    #[tokio::test]
    async fn test_command_tool_missing_binary() {
        let tool = CommandTool::new("/nonexistent/libshot-tool");
        let result = tool.run(&[]).await;
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_backend_capture_requires_region() {
        let bus = Arc::new(MockShellBus::new(Ok(AreaReply::cancelled())));
        let tool = Arc::new(MockTool::new(ToolBehavior::Exit(1)));
        let backend = DesktopShellBackend::new(
            client(&bus, &tool),
            Arc::new(MockPrimitive::single(1920, 1080)),
        );

        let result = backend.capture(None, 1).await;
        assert!(matches!(
            result,
            Err(CaptureError::Unsupported {
                backend: BackendKind::DesktopShell,
                ..
            })
        ));

        let image = backend.capture(Region::new(100, 100, 500, 400), 1).await.unwrap().unwrap();
        assert_eq!(image.dimensions(), (500, 400));
    }
}

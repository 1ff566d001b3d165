//! Scriptable stand-ins for every external collaborator
//!
//! The backends talk to the outside world only through traits
//! ([`CapturePrimitive`], [`PortalBus`], [`ShellBus`],
//! [`AreaScreenshotTool`], [`SelectionSurface`], [`BackendFactory`]). This
//! module implements each of them in memory so the protocol state machines
//! and the [`Capturer`](super::Capturer) can be exercised without a display
//! server or a session bus.
//!
//! # Examples
//!
//! ```
//! use std::sync::Arc;
//!
//! use libshot::{
//!     capture::{Capturer, mock::{MockFactory, MockPrimitive}},
//!     model::{BackendKind, Region, SessionEnvironment, SessionType},
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let factory = Arc::new(MockFactory::new(MockPrimitive::single(1920, 1080)));
//!     let capturer = Capturer::with_factory(factory)
//!         .with_environment(SessionEnvironment::new(SessionType::X11, "", true));
//!
//!     let image = capturer.capture(Region::new(100, 100, 500, 500), 1).await.unwrap();
//!     assert_eq!(image.unwrap().dimensions(), (500, 500));
//!     assert_eq!(capturer.backend_kind().await.unwrap(), BackendKind::DirectAccess);
//! }
//! ```

use std::{
    collections::VecDeque,
    ffi::OsString,
    io,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;

use super::{
    BackendFactory, CapturedImage, DesktopShellBackend, DirectAccessBackend, PortalBackend,
    portal_backend::{PortalBus, PortalClient, PortalRequest, ResponseSignal, ResultValue},
    primitive::{CapturePrimitive, ChannelOrder, RawFrame, with_union},
    selector::{SelectionEvent, SelectionSurface},
    shell_backend::{AreaReply, AreaScreenshotTool, ShellBus, ShellClient},
    x11_backend::SurfaceFactory,
};
use crate::{
    error::{CaptureError, CaptureResult},
    model::{MonitorRect, Region},
};

/// In-memory monitors with synthetic pixels
///
/// Grabs produce a BGRA gradient of the requested size and are recorded.
#[derive(Debug, Default)]
pub struct MockPrimitive {
    physical: Vec<MonitorRect>,
    failing:  bool,
    grabs:    Mutex<Vec<MonitorRect>>,
}

impl MockPrimitive {
    pub fn new(physical: Vec<MonitorRect>) -> Self {
        Self {
            physical,
            failing: false,
            grabs: Mutex::new(Vec::new()),
        }
    }

    /// One monitor at the origin
    pub fn single(width: u32, height: u32) -> Self {
        Self::new(vec![MonitorRect::new(0, 0, width, height)])
    }

    /// Every call fails, as when no display is reachable
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    /// Rectangles grabbed so far
    pub fn grabs(&self) -> Vec<MonitorRect> {
        self.grabs.lock().map(|g| g.clone()).unwrap_or_default()
    }
}

impl CapturePrimitive for MockPrimitive {
    fn monitors(&self) -> CaptureResult<Vec<MonitorRect>> {
        if self.failing {
            return Err(CaptureError::invalid_region("mock primitive has no display"));
        }
        Ok(with_union(self.physical.clone()))
    }

    fn grab(&self, rect: MonitorRect) -> CaptureResult<RawFrame> {
        if self.failing {
            return Err(CaptureError::invalid_region("mock primitive has no display"));
        }
        if !self.physical.iter().any(|monitor| monitor.contains(&rect)) {
            return Err(CaptureError::invalid_region(format!(
                "{:?} does not lie inside a single monitor",
                rect
            )));
        }
        if let Ok(mut grabs) = self.grabs.lock() {
            grabs.push(rect);
        }

        let data = (0..rect.height)
            .flat_map(|y| (0..rect.width).map(move |x| (x, y)))
            .flat_map(|(x, y)| [(x % 256) as u8, (y % 256) as u8, 0x80, 0xff])
            .collect();
        Ok(RawFrame {
            width: rect.width,
            height: rect.height,
            channel_order: ChannelOrder::Bgra,
            data,
        })
    }
}

#[derive(Debug, Clone)]
enum ScriptedResponse {
    /// Emitted as-is, on its own path
    Foreign(ResponseSignal),
    /// Emitted on the handle of the current request
    Matching { code: u32, uri: Option<String> },
}

/// Portal bus replaying scripted `Response` signals
///
/// `next_response` never returns once the script is exhausted, like a
/// portal whose dialog is still open.
#[derive(Debug, Default)]
pub struct MockPortalBus {
    script:   Mutex<VecDeque<ScriptedResponse>>,
    requests: Mutex<Vec<PortalRequest>>,
    handle:   Mutex<String>,
    serial:   AtomicUsize,
}

impl MockPortalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a signal for some other request
    pub fn push_foreign_response(&self, signal: ResponseSignal) {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(ScriptedResponse::Foreign(signal));
        }
    }

    /// Queues the answer to the request in flight
    pub fn push_matching_response(&self, code: u32, uri: Option<&str>) {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(ScriptedResponse::Matching {
                code,
                uri: uri.map(str::to_string),
            });
        }
    }

    /// Requests sent so far
    pub fn requests(&self) -> Vec<PortalRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl PortalBus for MockPortalBus {
    async fn screenshot(&self, _parent_window: &str, request: &PortalRequest) -> CaptureResult<String> {
        let serial = self.serial.fetch_add(1, Ordering::SeqCst) + 1;
        let handle = format!(
            "/org/freedesktop/portal/desktop/request/1_{}/{}",
            serial, request.handle_token
        );

        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        if let Ok(mut current) = self.handle.lock() {
            *current = handle.clone();
        }
        Ok(handle)
    }

    async fn next_response(&self) -> CaptureResult<ResponseSignal> {
        let next = self.script.lock().ok().and_then(|mut script| script.pop_front());
        let Some(next) = next else {
            return std::future::pending().await;
        };

        Ok(match next {
            ScriptedResponse::Foreign(signal) => signal,
            ScriptedResponse::Matching { code, uri } => {
                let path = self.handle.lock().map(|h| h.clone()).unwrap_or_default();
                let results = uri
                    .map(|uri| ("uri".to_string(), ResultValue::Str(uri)))
                    .into_iter()
                    .collect();
                ResponseSignal { path, code, results }
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScreenshotMode {
    Write,
    Reject,
    Fail,
    Garbage,
}

/// GNOME Shell bus with a fixed `SelectArea` answer
///
/// `ScreenshotArea` writes a PNG of the requested size to the given path by
/// default; the builder methods switch it to rejecting, failing, or writing
/// bytes that do not decode.
#[derive(Debug)]
pub struct MockShellBus {
    select:           Result<AreaReply, String>,
    screenshot:       ScreenshotMode,
    select_calls:     AtomicUsize,
    screenshot_calls: AtomicUsize,
    last_path:        Mutex<Option<PathBuf>>,
}

impl MockShellBus {
    /// An `Err` is replayed as a protocol violation on every call
    pub fn new(select: CaptureResult<AreaReply>) -> Self {
        Self {
            select:           select.map_err(|e| e.to_string()),
            screenshot:       ScreenshotMode::Write,
            select_calls:     AtomicUsize::new(0),
            screenshot_calls: AtomicUsize::new(0),
            last_path:        Mutex::new(None),
        }
    }

    /// `ScreenshotArea` answers `false`
    pub fn rejecting_screenshots(mut self) -> Self {
        self.screenshot = ScreenshotMode::Reject;
        self
    }

    /// `ScreenshotArea` fails as a bus error
    pub fn erroring_screenshots(mut self) -> Self {
        self.screenshot = ScreenshotMode::Fail;
        self
    }

    /// `ScreenshotArea` answers `true` but leaves an undecodable file
    pub fn writing_garbage(mut self) -> Self {
        self.screenshot = ScreenshotMode::Garbage;
        self
    }

    pub fn select_calls(&self) -> usize {
        self.select_calls.load(Ordering::SeqCst)
    }

    pub fn screenshot_calls(&self) -> usize {
        self.screenshot_calls.load(Ordering::SeqCst)
    }

    /// Path passed to the last `ScreenshotArea`
    pub fn last_path(&self) -> Option<PathBuf> {
        self.last_path.lock().ok().and_then(|p| p.clone())
    }
}

#[async_trait]
impl ShellBus for MockShellBus {
    async fn select_area(&self) -> CaptureResult<AreaReply> {
        self.select_calls.fetch_add(1, Ordering::SeqCst);
        self.select.clone().map_err(CaptureError::protocol)
    }

    async fn screenshot_area(&self, region: Region, _flash: bool, path: &Path) -> CaptureResult<bool> {
        self.screenshot_calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut last) = self.last_path.lock() {
            *last = Some(path.to_path_buf());
        }
        match self.screenshot {
            ScreenshotMode::Write => {
                CapturedImage::from_test_pattern(region.width(), region.height()).save(path)?;
                Ok(true)
            }
            ScreenshotMode::Reject => Ok(false),
            ScreenshotMode::Fail => Err(CaptureError::protocol("ScreenshotArea: org.gnome.Shell is gone")),
            ScreenshotMode::Garbage => {
                std::fs::write(path, b"not an image at all")?;
                Ok(true)
            }
        }
    }
}

/// What a [`MockTool`] run does
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolBehavior {
    /// Exit with this code, writing nothing
    Exit(i32),
    /// Write a PNG of this size to the `-f` path, exit 0
    WriteImage(u32, u32),
    /// Write bytes that are not an image, exit 0
    WriteGarbage,
    /// Terminated by a signal
    Killed,
    /// The binary does not exist
    Missing,
}

/// Scripted `gnome-screenshot`
#[derive(Debug)]
pub struct MockTool {
    behavior:  ToolBehavior,
    runs:      AtomicUsize,
    last_args: Mutex<Vec<String>>,
}

impl MockTool {
    pub fn new(behavior: ToolBehavior) -> Self {
        Self {
            behavior,
            runs: AtomicUsize::new(0),
            last_args: Mutex::new(Vec::new()),
        }
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    pub fn last_args(&self) -> Vec<String> {
        self.last_args.lock().map(|a| a.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl AreaScreenshotTool for MockTool {
    async fn run(&self, args: &[OsString]) -> io::Result<Option<i32>> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut last) = self.last_args.lock() {
            *last = args.iter().map(|a| a.to_string_lossy().into_owned()).collect();
        }

        let output = args
            .iter()
            .position(|a| a == "-f")
            .and_then(|i| args.get(i + 1))
            .map(PathBuf::from);

        match &self.behavior {
            ToolBehavior::Exit(code) => Ok(Some(*code)),
            ToolBehavior::WriteImage(width, height) => {
                if let Some(path) = output {
                    CapturedImage::from_test_pattern(*width, *height)
                        .save(&path)
                        .map_err(io::Error::other)?;
                }
                Ok(Some(0))
            }
            ToolBehavior::WriteGarbage => {
                if let Some(path) = output {
                    std::fs::write(path, b"definitely not a png")?;
                }
                Ok(Some(0))
            }
            ToolBehavior::Killed => Ok(None),
            ToolBehavior::Missing => Err(io::Error::from(io::ErrorKind::NotFound)),
        }
    }
}

/// Selection surface replaying a fixed list of events
///
/// Fails with [`CaptureError::OverlayUnavailable`] once the script runs dry.
#[derive(Debug, Default)]
pub struct ScriptedSurface {
    events: VecDeque<SelectionEvent>,
    draws:  Vec<Option<(i32, i32, u32, u32)>>,
}

impl ScriptedSurface {
    pub fn new(events: Vec<SelectionEvent>) -> Self {
        Self {
            events: events.into(),
            draws:  Vec::new(),
        }
    }

    /// Every `draw` argument, in order
    pub fn draws(&self) -> Vec<Option<(i32, i32, u32, u32)>> {
        self.draws.clone()
    }
}

impl SelectionSurface for ScriptedSurface {
    fn next_event(&mut self) -> CaptureResult<SelectionEvent> {
        self.events.pop_front().ok_or_else(|| CaptureError::OverlayUnavailable {
            reason: "event script exhausted".to_string(),
        })
    }

    fn draw(&mut self, selection: Option<(i32, i32, u32, u32)>) -> CaptureResult<()> {
        self.draws.push(selection);
        Ok(())
    }
}

/// Opens a fresh [`ScriptedSurface`] per interactive capture
#[derive(Debug, Default)]
pub struct ScriptedSurfaceFactory {
    events:   Vec<SelectionEvent>,
    openings: Mutex<Vec<((u32, u32), (i32, i32))>>,
}

impl ScriptedSurfaceFactory {
    pub fn new(events: Vec<SelectionEvent>) -> Self {
        Self {
            events,
            openings: Mutex::new(Vec::new()),
        }
    }

    /// `(snapshot size, origin)` of each surface opened
    pub fn openings(&self) -> Vec<((u32, u32), (i32, i32))> {
        self.openings.lock().map(|o| o.clone()).unwrap_or_default()
    }
}

impl SurfaceFactory for ScriptedSurfaceFactory {
    fn open(&self, snapshot: &CapturedImage, origin: (i32, i32)) -> CaptureResult<Box<dyn SelectionSurface>> {
        if let Ok(mut openings) = self.openings.lock() {
            openings.push((snapshot.dimensions(), origin));
        }
        Ok(Box::new(ScriptedSurface::new(self.events.clone())))
    }
}

/// [`BackendFactory`] wiring every backend to mocks
///
/// Counts construction attempts per backend so selection and memoization
/// can be asserted.
pub struct MockFactory {
    primitive:         Arc<MockPrimitive>,
    shell_bus:         Arc<MockShellBus>,
    tool:              Arc<MockTool>,
    portal_bus:        Arc<MockPortalBus>,
    surfaces:          Arc<ScriptedSurfaceFactory>,
    shell_available:   bool,
    portal_available:  bool,
    shell_attempts:    AtomicUsize,
    portal_attempts:   AtomicUsize,
    direct_attempts:   AtomicUsize,
}

impl MockFactory {
    pub fn new(primitive: MockPrimitive) -> Self {
        Self {
            primitive:        Arc::new(primitive),
            shell_bus:        Arc::new(MockShellBus::new(Ok(AreaReply::cancelled()))),
            tool:             Arc::new(MockTool::new(ToolBehavior::Exit(1))),
            portal_bus:       Arc::new(MockPortalBus::new()),
            surfaces:         Arc::new(ScriptedSurfaceFactory::default()),
            shell_available:  true,
            portal_available: true,
            shell_attempts:   AtomicUsize::new(0),
            portal_attempts:  AtomicUsize::new(0),
            direct_attempts:  AtomicUsize::new(0),
        }
    }

    /// Shell construction fails with `BusUnavailable`
    pub fn shell_unavailable(mut self) -> Self {
        self.shell_available = false;
        self
    }

    /// Portal construction fails with `BusUnavailable`
    pub fn portal_unavailable(mut self) -> Self {
        self.portal_available = false;
        self
    }

    pub fn with_shell(mut self, bus: Arc<MockShellBus>, tool: Arc<MockTool>) -> Self {
        self.shell_bus = bus;
        self.tool = tool;
        self
    }

    pub fn with_portal_bus(mut self, bus: Arc<MockPortalBus>) -> Self {
        self.portal_bus = bus;
        self
    }

    pub fn with_surface_events(mut self, events: Vec<SelectionEvent>) -> Self {
        self.surfaces = Arc::new(ScriptedSurfaceFactory::new(events));
        self
    }

    pub fn primitive(&self) -> Arc<MockPrimitive> {
        Arc::clone(&self.primitive)
    }

    pub fn shell_attempts(&self) -> usize {
        self.shell_attempts.load(Ordering::SeqCst)
    }

    pub fn portal_attempts(&self) -> usize {
        self.portal_attempts.load(Ordering::SeqCst)
    }

    pub fn direct_attempts(&self) -> usize {
        self.direct_attempts.load(Ordering::SeqCst)
    }

    fn unavailable(service: &str) -> CaptureError {
        CaptureError::BusUnavailable {
            service: service.to_string(),
            reason:  "mock bus is down".to_string(),
        }
    }
}

#[async_trait]
impl BackendFactory for MockFactory {
    async fn desktop_shell(&self) -> CaptureResult<DesktopShellBackend> {
        self.shell_attempts.fetch_add(1, Ordering::SeqCst);
        if !self.shell_available {
            return Err(Self::unavailable(super::constants::SHELL_BUS_NAME));
        }
        let client = ShellClient::new(self.shell_bus.clone(), self.tool.clone());
        Ok(DesktopShellBackend::new(client, self.primitive.clone()))
    }

    async fn portal(&self) -> CaptureResult<PortalBackend> {
        self.portal_attempts.fetch_add(1, Ordering::SeqCst);
        if !self.portal_available {
            return Err(Self::unavailable(super::constants::PORTAL_BUS_NAME));
        }
        let client = PortalClient::new(self.portal_bus.clone())
            .with_timeout(Some(Duration::from_secs(5)))
            .with_retry(5, Duration::from_millis(1));
        Ok(PortalBackend::new(client, self.primitive.clone()))
    }

    fn direct_access(&self) -> CaptureResult<DirectAccessBackend> {
        self.direct_attempts.fetch_add(1, Ordering::SeqCst);
        Ok(DirectAccessBackend::new(self.primitive.clone(), self.surfaces.clone()))
    }
}

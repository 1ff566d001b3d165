//! Data models and type definitions for libshot
//!
//! This module defines the core types used throughout the crate:
//! - Session environment snapshot used for backend selection
//! - Backend kind tags
//! - Monitor and region geometry
//! - Portal correlation tokens

use std::fmt;

use serde::{Deserialize, Serialize};

/// Display server session type as reported by `XDG_SESSION_TYPE`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionType {
    /// Wayland compositor session
    Wayland,
    /// X11 session
    X11,
    /// Anything else, including an unset variable (stored lowercased)
    Other(String),
}

impl SessionType {
    /// Parses a raw `XDG_SESSION_TYPE` value (case-insensitive)
    pub fn parse(raw: &str) -> Self {
        let lowered = raw.trim().to_lowercase();
        match lowered.as_str() {
            "wayland" => SessionType::Wayland,
            "x11" => SessionType::X11,
            _ => SessionType::Other(lowered),
        }
    }

    /// Returns the session type as a lowercase string
    pub fn as_str(&self) -> &str {
        match self {
            SessionType::Wayland => "wayland",
            SessionType::X11 => "x11",
            SessionType::Other(raw) => raw,
        }
    }
}

impl fmt::Display for SessionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Immutable snapshot of the session signals used for backend selection
///
/// Read once, when the backend is selected. Build it with
/// [`detect::session_environment`](crate::util::detect::session_environment)
/// or [`SessionEnvironment::new`] for tests and embedding hosts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionEnvironment {
    session_type: SessionType,
    desktop_name: String,
    has_display:  bool,
}

impl SessionEnvironment {
    /// Creates a new snapshot
    pub fn new(session_type: SessionType, desktop_name: impl Into<String>, has_display: bool) -> Self {
        Self {
            session_type,
            desktop_name: desktop_name.into(),
            has_display,
        }
    }

    /// Session type (`XDG_SESSION_TYPE`)
    pub fn session_type(&self) -> &SessionType {
        &self.session_type
    }

    /// Desktop name (`XDG_CURRENT_DESKTOP`), possibly a colon-separated list
    pub fn desktop_name(&self) -> &str {
        &self.desktop_name
    }

    /// Whether an X display identifier (`DISPLAY`) is present
    pub fn has_display(&self) -> bool {
        self.has_display
    }

    /// Case-insensitive substring match against the desktop name
    pub fn desktop_matches(&self, identifier: &str) -> bool {
        self.desktop_name
            .to_lowercase()
            .contains(&identifier.to_lowercase())
    }
}

/// The closed set of capture backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// GNOME Shell's private screenshot interface
    DesktopShell,
    /// xdg-desktop-portal Screenshot interface
    Portal,
    /// Direct X11 access
    DirectAccess,
}

impl BackendKind {
    /// Returns the backend kind as a kebab-case string
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::DesktopShell => "desktop-shell",
            BackendKind::Portal => "portal",
            BackendKind::DirectAccess => "direct-access",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Geometry of a monitor, or of an area to capture, in desktop coordinates
///
/// `left`/`top` are signed since X11 places monitors left of or above the
/// origin in some layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MonitorRect {
    pub left:   i32,
    pub top:    i32,
    pub width:  u32,
    pub height: u32,
}

impl MonitorRect {
    /// Creates a new rectangle
    pub fn new(left: i32, top: i32, width: u32, height: u32) -> Self {
        Self {
            left,
            top,
            width,
            height,
        }
    }

    /// Exclusive right edge
    pub fn right(&self) -> i64 {
        i64::from(self.left) + i64::from(self.width)
    }

    /// Exclusive bottom edge
    pub fn bottom(&self) -> i64 {
        i64::from(self.top) + i64::from(self.height)
    }

    /// Whether `other` lies entirely inside this rectangle
    pub fn contains(&self, other: &MonitorRect) -> bool {
        other.left >= self.left
            && other.top >= self.top
            && other.right() <= self.right()
            && other.bottom() <= self.bottom()
    }

    /// Smallest rectangle covering every rectangle in `rects`
    ///
    /// Returns `None` for an empty slice.
    pub fn union_of(rects: &[MonitorRect]) -> Option<MonitorRect> {
        let first = rects.first()?;
        let (mut left, mut top) = (i64::from(first.left), i64::from(first.top));
        let (mut right, mut bottom) = (first.right(), first.bottom());

        for rect in &rects[1..] {
            left = left.min(i64::from(rect.left));
            top = top.min(i64::from(rect.top));
            right = right.max(rect.right());
            bottom = bottom.max(rect.bottom());
        }

        Some(MonitorRect {
            left:   left as i32,
            top:    top as i32,
            width:  (right - left) as u32,
            height: (bottom - top) as u32,
        })
    }
}

impl From<Region> for MonitorRect {
    fn from(region: Region) -> Self {
        MonitorRect::new(region.x, region.y, region.width, region.height)
    }
}

/// A non-empty rectangular area to capture
///
/// The invariant `width > 0 && height > 0` holds for every value: a zero-area
/// selection is represented as the absence of a `Region`, never as an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawRegion")]
pub struct Region {
    x:      i32,
    y:      i32,
    width:  u32,
    height: u32,
}

/// Unchecked wire form of [`Region`]
#[derive(Deserialize)]
struct RawRegion {
    x:      i32,
    y:      i32,
    width:  u32,
    height: u32,
}

impl TryFrom<RawRegion> for Region {
    type Error = String;

    fn try_from(raw: RawRegion) -> Result<Self, Self::Error> {
        Region::new(raw.x, raw.y, raw.width, raw.height)
            .ok_or_else(|| format!("region {}x{} has zero area", raw.width, raw.height))
    }
}

impl Region {
    /// Creates a region, or `None` when it has zero area
    ///
    /// # Examples
    ///
    /// ```
    /// use libshot::model::Region;
    ///
    /// assert!(Region::new(100, 100, 500, 500).is_some());
    /// assert!(Region::new(100, 100, 0, 500).is_none());
    /// ```
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Option<Self> {
        if width == 0 || height == 0 {
            return None;
        }
        Some(Self {
            x,
            y,
            width,
            height,
        })
    }

    /// Normalizes a drag between two corners into a region
    ///
    /// Left/top are always the minima regardless of drag direction.
    ///
    /// # Examples
    ///
    /// ```
    /// use libshot::model::Region;
    ///
    /// let region = Region::from_corners((50, 50), (10, 10)).unwrap();
    /// assert_eq!(region.as_tuple(), (10, 10, 40, 40));
    /// ```
    pub fn from_corners(anchor: (i32, i32), current: (i32, i32)) -> Option<Self> {
        let (left, top, width, height) = normalize_drag(anchor, current);
        Region::new(left, top, width, height)
    }

    pub fn x(&self) -> i32 {
        self.x
    }

    pub fn y(&self) -> i32 {
        self.y
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// `(x, y, width, height)`
    pub fn as_tuple(&self) -> (i32, i32, u32, u32) {
        (self.x, self.y, self.width, self.height)
    }

    /// Shifts the region by `(dx, dy)`
    pub fn translate(&self, dx: i32, dy: i32) -> Self {
        Self {
            x: self.x.saturating_add(dx),
            y: self.y.saturating_add(dy),
            ..*self
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}+{}+{}", self.width, self.height, self.x, self.y)
    }
}

/// Normalizes two drag corners into `(left, top, width, height)`
///
/// Width and height may be zero.
pub fn normalize_drag(anchor: (i32, i32), current: (i32, i32)) -> (i32, i32, u32, u32) {
    let left = anchor.0.min(current.0);
    let top = anchor.1.min(current.1);
    let width = anchor.0.abs_diff(current.0);
    let height = anchor.1.abs_diff(current.1);
    (left, top, width, height)
}

/// Opaque correlation identifier for one portal request
///
/// Random per call. The string form is a valid D-Bus object path element.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CaptureToken(String);

impl CaptureToken {
    /// Generates a fresh random token
    pub fn generate() -> Self {
        Self(format!("libshot_{:032x}", rand::random::<u128>()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CaptureToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

//! Raw pixel acquisition and monitor enumeration
//!
//! [`CapturePrimitive`] is the seam between the backends and whatever
//! actually reads pixels off the screen. The production implementation,
//! [`XcapPrimitive`], wraps the `xcap` crate; tests use
//! [`MockPrimitive`](crate::capture::mock::MockPrimitive).
//!
//! Both methods are blocking. Async callers run them through
//! `tokio::task::spawn_blocking`.

use std::fmt;

use crate::{
    error::{CaptureError, CaptureResult},
    model::MonitorRect,
};

/// Byte order of one pixel in a [`RawFrame`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOrder {
    /// `B, G, R, A` (X11 ZPixmap on little-endian)
    Bgra,
    /// `R, G, B, A` (xcap, most image crates)
    Rgba,
}

/// Uncompressed 32 bit pixels as read from the screen
#[derive(Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub width:         u32,
    pub height:        u32,
    pub channel_order: ChannelOrder,
    /// Row-major, 4 bytes per pixel, no row padding
    pub data:          Vec<u8>,
}

impl fmt::Debug for RawFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawFrame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("channel_order", &self.channel_order)
            .field("bytes", &self.data.len())
            .finish()
    }
}

impl RawFrame {
    /// Expected length of `data` for the frame geometry
    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * 4
    }

    /// Copies out the sub-rectangle at `(x, y)` relative to the frame origin
    ///
    /// # Errors
    ///
    /// - [`CaptureError::InvalidRegion`] - the rectangle is empty or not
    ///   inside the frame
    pub fn crop(&self, x: u32, y: u32, width: u32, height: u32) -> CaptureResult<RawFrame> {
        if width == 0
            || height == 0
            || u64::from(x) + u64::from(width) > u64::from(self.width)
            || u64::from(y) + u64::from(height) > u64::from(self.height)
        {
            return Err(CaptureError::invalid_region(format!(
                "{}x{}+{}+{} is outside the {}x{} frame",
                width, height, x, y, self.width, self.height
            )));
        }

        let stride = self.width as usize * 4;
        let row_len = width as usize * 4;
        let mut data = Vec::with_capacity(row_len * height as usize);
        for row in y as usize..(y + height) as usize {
            let start = row * stride + x as usize * 4;
            data.extend_from_slice(&self.data[start..start + row_len]);
        }

        Ok(RawFrame {
            width,
            height,
            channel_order: self.channel_order,
            data,
        })
    }
}

/// Source of monitor geometry and pixels
pub trait CapturePrimitive: Send + Sync {
    /// Lists monitor rectangles; index 0 is the union of all monitors,
    /// indices `1..` are the physical monitors
    fn monitors(&self) -> CaptureResult<Vec<MonitorRect>>;

    /// Reads the pixels of `rect` (absolute desktop coordinates)
    fn grab(&self, rect: MonitorRect) -> CaptureResult<RawFrame>;
}

/// Physical monitors of a primitive, without the union entry
///
/// # Examples
///
/// ```
/// use libshot::{
///     capture::{mock::MockPrimitive, primitive::physical_monitors},
///     model::MonitorRect,
/// };
///
/// let primitive = MockPrimitive::single(1920, 1080);
/// let monitors = physical_monitors(&primitive).unwrap();
/// assert_eq!(monitors, vec![MonitorRect::new(0, 0, 1920, 1080)]);
/// ```
pub fn physical_monitors(primitive: &dyn CapturePrimitive) -> CaptureResult<Vec<MonitorRect>> {
    Ok(primitive.monitors()?.into_iter().skip(1).collect())
}

/// Builds the primitive's monitor list from physical monitors: the union
/// first, then each monitor in order
pub fn with_union(physical: Vec<MonitorRect>) -> Vec<MonitorRect> {
    match MonitorRect::union_of(&physical) {
        Some(union) => std::iter::once(union).chain(physical).collect(),
        None => Vec::new(),
    }
}

/// [`CapturePrimitive`] backed by the `xcap` crate
#[derive(Debug, Default, Clone, Copy)]
pub struct XcapPrimitive;

impl XcapPrimitive {
    pub fn new() -> Self {
        Self
    }

    fn monitor_rect(monitor: &xcap::Monitor) -> Result<MonitorRect, xcap::XCapError> {
        Ok(MonitorRect::new(
            monitor.x()?,
            monitor.y()?,
            monitor.width()?,
            monitor.height()?,
        ))
    }

    fn physical() -> CaptureResult<Vec<(xcap::Monitor, MonitorRect)>> {
        let monitors = xcap::Monitor::all().map_err(|e| {
            CaptureError::invalid_region(format!("Failed to enumerate monitors: {}", e))
        })?;

        monitors
            .into_iter()
            .map(|monitor| {
                let rect = Self::monitor_rect(&monitor).map_err(|e| {
                    CaptureError::invalid_region(format!("Failed to query monitor geometry: {}", e))
                })?;
                Ok((monitor, rect))
            })
            .collect()
    }
}

impl CapturePrimitive for XcapPrimitive {
    fn monitors(&self) -> CaptureResult<Vec<MonitorRect>> {
        let physical = Self::physical()?;
        tracing::debug!("xcap reported {} monitor(s)", physical.len());
        Ok(with_union(physical.into_iter().map(|(_, rect)| rect).collect()))
    }

    fn grab(&self, rect: MonitorRect) -> CaptureResult<RawFrame> {
        // A grab is served by the single monitor containing it
        let (monitor, bounds) = Self::physical()?
            .into_iter()
            .find(|(_, bounds)| bounds.contains(&rect))
            .ok_or_else(|| {
                CaptureError::invalid_region(format!(
                    "{}x{}+{}+{} does not lie inside a single monitor",
                    rect.width, rect.height, rect.left, rect.top
                ))
            })?;

        let image = monitor
            .capture_image()
            .map_err(|e| CaptureError::invalid_region(format!("xcap capture failed: {}", e)))?;

        let frame = RawFrame {
            width:         image.width(),
            height:        image.height(),
            channel_order: ChannelOrder::Rgba,
            data:          image.into_raw(),
        };

        // Scaled outputs report logical geometry; crop in frame pixels
        if frame.width == bounds.width && frame.height == bounds.height {
            let x = (rect.left - bounds.left) as u32;
            let y = (rect.top - bounds.top) as u32;
            if x == 0 && y == 0 && rect.width == frame.width && rect.height == frame.height {
                return Ok(frame);
            }
            frame.crop(x, y, rect.width, rect.height)
        } else {
            let scale_x = f64::from(frame.width) / f64::from(bounds.width);
            let scale_y = f64::from(frame.height) / f64::from(bounds.height);
            let x = (f64::from(rect.left - bounds.left) * scale_x) as u32;
            let y = (f64::from(rect.top - bounds.top) * scale_y) as u32;
            let width = ((f64::from(rect.width) * scale_x) as u32).clamp(1, frame.width - x);
            let height = ((f64::from(rect.height) * scale_y) as u32).clamp(1, frame.height - y);
            frame.crop(x, y, width, height)
        }
    }
}

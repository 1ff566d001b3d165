//! X11 selection overlay
//!
//! [`X11Overlay`] is the production [`SelectionSurface`]: an
//! override-redirect window covering one monitor, painted with a dimmed copy
//! of the monitor snapshot. The region under the drag is painted undimmed
//! with a white outline. Pointer and keyboard are grabbed for the lifetime
//! of the overlay so the drag cannot leak into other clients.
//!
//! Everything here blocks on the X connection. Run it on the blocking pool.

use std::{fmt::Display, thread, time::Duration};

use x11rb::{
    COPY_DEPTH_FROM_PARENT, COPY_FROM_PARENT, CURRENT_TIME,
    connection::{Connection, RequestConnection},
    protocol::{
        Event,
        xproto::{
            ConnectionExt as _, CreateGCAux, CreateWindowAux, EventMask, Gcontext, GrabMode,
            GrabStatus, ImageFormat, ImageOrder, Keycode, Keysym, Rectangle, Window, WindowClass,
        },
    },
    rust_connection::RustConnection,
};

use crate::{
    capture::{
        CapturedImage,
        selector::{SelectionEvent, SelectionSurface},
    },
    error::{CaptureError, CaptureResult},
};

/// `XK_Escape`
const ESCAPE_KEYSYM: Keysym = 0xff1b;

/// `XC_crosshair` in the cursor font
const CROSSHAIR_GLYPH: u16 = 34;

/// Dimmed pixels keep this fraction of their brightness (in 1/256)
const DIM_FACTOR: u16 = 100;

/// Attempts to grab pointer and keyboard while the window gets mapped
const GRAB_ATTEMPTS: u32 = 20;

const GRAB_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Fixed size of a `PutImage` request header
const PUT_IMAGE_HEADER_BYTES: usize = 24;

fn overlay_err(context: &str, e: impl Display) -> CaptureError {
    CaptureError::OverlayUnavailable {
        reason: format!("{}: {}", context, e),
    }
}

type Rect = (i32, i32, u32, u32);

/// Full-screen drag-to-select window on an X server
pub struct X11Overlay {
    conn:      RustConnection,
    window:    Window,
    gc:        Gcontext,
    cursor:    u32,
    depth:     u8,
    width:     u16,
    height:    u16,
    /// Snapshot as ZPixmap rows
    bright:    Vec<u8>,
    /// Same rows, darkened
    dimmed:    Vec<u8>,
    escape:    Option<Keycode>,
    /// Selection currently on screen
    shown:     Option<Rect>,
    max_bytes: usize,
}

impl X11Overlay {
    /// Opens the overlay at `origin` (desktop coordinates) showing `snapshot`
    ///
    /// # Errors
    ///
    /// - [`CaptureError::OverlayUnavailable`] - no X server, unsupported
    ///   visual, or the grabs could not be acquired
    pub fn open(snapshot: &CapturedImage, origin: (i32, i32)) -> CaptureResult<Self> {
        let (conn, screen_num) = x11rb::connect(None).map_err(|e| overlay_err("connect", e))?;

        let setup = conn.setup();
        let screen = &setup.roots[screen_num];
        let depth = screen.root_depth;
        let bits_per_pixel = setup
            .pixmap_formats
            .iter()
            .find(|format| format.depth == depth)
            .map(|format| format.bits_per_pixel);
        if !matches!(depth, 24 | 32) || bits_per_pixel != Some(32) {
            return Err(CaptureError::OverlayUnavailable {
                reason: format!("unsupported root visual (depth {}, {:?} bpp)", depth, bits_per_pixel),
            });
        }

        let lsb_first = setup.image_byte_order == ImageOrder::LSB_FIRST;
        let (width, height) = (
            u16::try_from(snapshot.width()).map_err(|e| overlay_err("snapshot width", e))?,
            u16::try_from(snapshot.height()).map_err(|e| overlay_err("snapshot height", e))?,
        );
        let root = screen.root;
        let (black, white) = (screen.black_pixel, screen.white_pixel);
        let min_keycode = setup.min_keycode;
        let keycode_count = setup.max_keycode - setup.min_keycode + 1;

        let cursor = Self::crosshair(&conn)?;

        let window = conn.generate_id().map_err(|e| overlay_err("generate id", e))?;
        let aux = CreateWindowAux::new()
            .override_redirect(1u32)
            .background_pixel(black)
            .cursor(cursor)
            .event_mask(
                EventMask::EXPOSURE
                    | EventMask::BUTTON_PRESS
                    | EventMask::BUTTON_RELEASE
                    | EventMask::POINTER_MOTION
                    | EventMask::KEY_PRESS
                    | EventMask::STRUCTURE_NOTIFY,
            );
        conn.create_window(
            COPY_DEPTH_FROM_PARENT,
            window,
            root,
            clamp_i16(origin.0),
            clamp_i16(origin.1),
            width,
            height,
            0,
            WindowClass::INPUT_OUTPUT,
            COPY_FROM_PARENT,
            &aux,
        )
        .map_err(|e| overlay_err("create window", e))?;

        let gc = conn.generate_id().map_err(|e| overlay_err("generate id", e))?;
        conn.create_gc(gc, window, &CreateGCAux::new().foreground(white).graphics_exposures(0u32))
            .map_err(|e| overlay_err("create gc", e))?;

        conn.map_window(window).map_err(|e| overlay_err("map window", e))?;
        conn.flush().map_err(|e| overlay_err("flush", e))?;

        let escape = conn
            .get_keyboard_mapping(min_keycode, keycode_count)
            .map_err(|e| overlay_err("keyboard mapping", e))?
            .reply()
            .map_err(|e| overlay_err("keyboard mapping", e))
            .map(|reply| {
                find_keycode(min_keycode, reply.keysyms_per_keycode, &reply.keysyms, ESCAPE_KEYSYM)
            })?;
        if escape.is_none() {
            tracing::warn!("No keycode maps to Escape; the selection can only be cancelled by an empty drag");
        }

        let max_bytes = conn.maximum_request_bytes();
        let rgb = snapshot.as_bytes();

        let overlay = Self {
            window,
            gc,
            cursor,
            depth,
            width,
            height,
            bright: to_zpixmap(rgb, lsb_first, false),
            dimmed: to_zpixmap(rgb, lsb_first, true),
            escape,
            shown: None,
            max_bytes,
            conn,
        };
        overlay.grab()?;

        tracing::debug!("Selection overlay {}x{} at {:?}", width, height, origin);
        Ok(overlay)
    }

    fn crosshair(conn: &RustConnection) -> CaptureResult<u32> {
        let font = conn.generate_id().map_err(|e| overlay_err("generate id", e))?;
        conn.open_font(font, b"cursor")
            .map_err(|e| overlay_err("open cursor font", e))?;

        let cursor = conn.generate_id().map_err(|e| overlay_err("generate id", e))?;
        conn.create_glyph_cursor(
            cursor,
            font,
            font,
            CROSSHAIR_GLYPH,
            CROSSHAIR_GLYPH + 1,
            0,
            0,
            0,
            0xffff,
            0xffff,
            0xffff,
        )
        .map_err(|e| overlay_err("create cursor", e))?;
        conn.close_font(font).map_err(|e| overlay_err("close font", e))?;
        Ok(cursor)
    }

    /// Grabs pointer and keyboard, retrying until the window is viewable
    fn grab(&self) -> CaptureResult<()> {
        let mut pointer = false;
        let mut keyboard = false;

        for _ in 0..GRAB_ATTEMPTS {
            if !pointer {
                pointer = self
                    .conn
                    .grab_pointer(
                        false,
                        self.window,
                        EventMask::BUTTON_PRESS | EventMask::BUTTON_RELEASE | EventMask::POINTER_MOTION,
                        GrabMode::ASYNC,
                        GrabMode::ASYNC,
                        self.window,
                        self.cursor,
                        CURRENT_TIME,
                    )
                    .map_err(|e| overlay_err("grab pointer", e))?
                    .reply()
                    .map_err(|e| overlay_err("grab pointer", e))?
                    .status
                    == GrabStatus::SUCCESS;
            }
            if !keyboard {
                keyboard = self
                    .conn
                    .grab_keyboard(false, self.window, CURRENT_TIME, GrabMode::ASYNC, GrabMode::ASYNC)
                    .map_err(|e| overlay_err("grab keyboard", e))?
                    .reply()
                    .map_err(|e| overlay_err("grab keyboard", e))?
                    .status
                    == GrabStatus::SUCCESS;
            }
            if pointer && keyboard {
                return Ok(());
            }
            thread::sleep(GRAB_RETRY_DELAY);
        }

        Err(CaptureError::OverlayUnavailable {
            reason: format!("grab failed (pointer: {}, keyboard: {})", pointer, keyboard),
        })
    }

    /// Copies `rect` of `source` onto the window
    fn blit(&self, source: &[u8], rect: Rect) -> CaptureResult<()> {
        let (left, top, width, height) = rect;
        if width == 0 || height == 0 {
            return Ok(());
        }

        let stride = usize::from(self.width) * 4;
        let row_len = width as usize * 4;
        let rows = rows_per_request(self.max_bytes, row_len);

        let mut y = top as usize;
        let bottom = top as usize + height as usize;
        while y < bottom {
            let chunk = rows.min(bottom - y);
            let mut data = Vec::with_capacity(row_len * chunk);
            for row in y..y + chunk {
                let start = row * stride + left as usize * 4;
                data.extend_from_slice(&source[start..start + row_len]);
            }

            self.conn
                .put_image(
                    ImageFormat::Z_PIXMAP,
                    self.window,
                    self.gc,
                    width as u16,
                    chunk as u16,
                    left as i16,
                    y as i16,
                    0,
                    self.depth,
                    &data,
                )
                .map_err(|e| overlay_err("put image", e))?;
            y += chunk;
        }
        Ok(())
    }

    fn outline(&self, rect: Rect) -> CaptureResult<()> {
        let (left, top, width, height) = rect;
        if width < 2 || height < 2 {
            return Ok(());
        }
        let frame = Rectangle {
            x:      left as i16,
            y:      top as i16,
            width:  (width - 1) as u16,
            height: (height - 1) as u16,
        };
        self.conn
            .poly_rectangle(self.window, self.gc, &[frame])
            .map_err(|e| overlay_err("draw outline", e))?;
        Ok(())
    }

    fn bounds(&self) -> Rect {
        (0, 0, u32::from(self.width), u32::from(self.height))
    }

    fn repaint_all(&self) -> CaptureResult<()> {
        self.blit(&self.dimmed, self.bounds())?;
        if let Some(rect) = self.shown {
            self.blit(&self.bright, rect)?;
            self.outline(rect)?;
        }
        self.conn.flush().map_err(|e| overlay_err("flush", e))
    }
}

impl SelectionSurface for X11Overlay {
    fn next_event(&mut self) -> CaptureResult<SelectionEvent> {
        loop {
            let event = self
                .conn
                .wait_for_event()
                .map_err(|e| overlay_err("wait for event", e))?;

            let translated = match event {
                Event::ButtonPress(e) => Some(SelectionEvent::PointerDown {
                    x:      i32::from(e.event_x),
                    y:      i32::from(e.event_y),
                    button: e.detail,
                }),
                Event::ButtonRelease(e) => Some(SelectionEvent::PointerUp {
                    x:      i32::from(e.event_x),
                    y:      i32::from(e.event_y),
                    button: e.detail,
                }),
                Event::MotionNotify(e) => Some(SelectionEvent::PointerMotion {
                    x: i32::from(e.event_x),
                    y: i32::from(e.event_y),
                }),
                Event::KeyPress(e) if Some(e.detail) == self.escape => Some(SelectionEvent::CancelKey),
                Event::DestroyNotify(_) | Event::UnmapNotify(_) => Some(SelectionEvent::Closed),
                Event::Expose(e) if e.count == 0 => {
                    self.repaint_all()?;
                    None
                }
                _ => None,
            };

            if let Some(event) = translated {
                return Ok(event);
            }
        }
    }

    fn draw(&mut self, selection: Option<(i32, i32, u32, u32)>) -> CaptureResult<()> {
        let bounds = self.bounds();
        let next = selection.and_then(|rect| clip(rect, bounds));

        match self.shown.take() {
            // Restore the dimmed pixels under the old selection and its outline
            Some(previous) => {
                if let Some(dirty) = clip(inflate(previous, 1), bounds) {
                    self.blit(&self.dimmed, dirty)?;
                }
            }
            None if selection.is_none() => self.blit(&self.dimmed, bounds)?,
            None => {}
        }

        if let Some(rect) = next {
            self.blit(&self.bright, rect)?;
            self.outline(rect)?;
        }
        self.shown = next;
        self.conn.flush().map_err(|e| overlay_err("flush", e))
    }
}

impl Drop for X11Overlay {
    fn drop(&mut self) {
        let _ = self.conn.ungrab_pointer(CURRENT_TIME);
        let _ = self.conn.ungrab_keyboard(CURRENT_TIME);
        let _ = self.conn.free_gc(self.gc);
        let _ = self.conn.destroy_window(self.window);
        let _ = self.conn.free_cursor(self.cursor);
        if let Err(e) = self.conn.flush() {
            tracing::warn!("Failed to tear down selection overlay: {}", e);
        }
    }
}

fn clamp_i16(value: i32) -> i16 {
    value.clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16
}

/// Converts packed RGB to 32 bpp ZPixmap rows, optionally dimmed
fn to_zpixmap(rgb: &[u8], lsb_first: bool, dim: bool) -> Vec<u8> {
    let scale = |c: u8| -> u8 {
        if dim {
            ((u16::from(c) * DIM_FACTOR) >> 8) as u8
        } else {
            c
        }
    };

    rgb.chunks_exact(3)
        .flat_map(|px| {
            let (r, g, b) = (scale(px[0]), scale(px[1]), scale(px[2]));
            if lsb_first { [b, g, r, 0] } else { [0, r, g, b] }
        })
        .collect()
}

/// Finds the first keycode producing `target` in a keyboard mapping
fn find_keycode(min_keycode: Keycode, per_keycode: u8, keysyms: &[Keysym], target: Keysym) -> Option<Keycode> {
    if per_keycode == 0 {
        return None;
    }
    let index = keysyms.iter().position(|&sym| sym == target)?;
    let offset = index / usize::from(per_keycode);
    u8::try_from(usize::from(min_keycode) + offset).ok()
}

/// How many rows of `row_len` bytes fit in one `PutImage` request
fn rows_per_request(max_request_bytes: usize, row_len: usize) -> usize {
    (max_request_bytes.saturating_sub(PUT_IMAGE_HEADER_BYTES) / row_len.max(1)).max(1)
}

fn inflate(rect: Rect, by: u32) -> Rect {
    let (left, top, width, height) = rect;
    (
        left - by as i32,
        top - by as i32,
        width + 2 * by,
        height + 2 * by,
    )
}

/// Intersects `rect` with `bounds`; `None` when nothing is left
fn clip(rect: Rect, bounds: Rect) -> Option<Rect> {
    let left = i64::from(rect.0).max(i64::from(bounds.0));
    let top = i64::from(rect.1).max(i64::from(bounds.1));
    let right = (i64::from(rect.0) + i64::from(rect.2)).min(i64::from(bounds.0) + i64::from(bounds.2));
    let bottom = (i64::from(rect.1) + i64::from(rect.3)).min(i64::from(bounds.1) + i64::from(bounds.3));

    if right <= left || bottom <= top {
        return None;
    }
    Some((left as i32, top as i32, (right - left) as u32, (bottom - top) as u32))
}

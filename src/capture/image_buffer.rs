//! Decoded screenshot data
//!
//! Every backend hands back a [`CapturedImage`]: an RGB8 buffer regardless of
//! whether the pixels came straight off an X server as BGRA rows or from a
//! PNG written by the portal or GNOME Shell.
//!
//! # Examples
//!
//! ```
//! use libshot::capture::CapturedImage;
//!
//! let img = CapturedImage::from_test_pattern(1920, 1080);
//! assert_eq!(img.dimensions(), (1920, 1080));
//! assert_eq!(img.as_bytes().len(), 1920 * 1080 * 3);
//! ```

use std::{fs::File, io::BufReader, path::Path};

use image::{ImageReader, RgbImage};

use crate::{
    capture::primitive::{ChannelOrder, RawFrame},
    error::{CaptureError, CaptureResult},
};

/// An RGB8 screenshot
#[derive(Clone, Debug, PartialEq)]
pub struct CapturedImage {
    inner: RgbImage,
}

impl CapturedImage {
    /// Wraps an existing RGB8 buffer
    pub fn new(image: RgbImage) -> Self {
        Self { inner: image }
    }

    /// Converts a raw 32 bit frame to RGB, dropping alpha
    ///
    /// # Errors
    ///
    /// - [`CaptureError::ImageError`] - `data` does not match `width * height
    ///   * 4`
    ///
    /// # Examples
    ///
    /// ```
    /// use libshot::capture::{
    ///     CapturedImage,
    ///     primitive::{ChannelOrder, RawFrame},
    /// };
    ///
    /// let frame = RawFrame {
    ///     width:         1,
    ///     height:        1,
    ///     channel_order: ChannelOrder::Bgra,
    ///     data:          vec![10, 20, 30, 255],
    /// };
    /// let img = CapturedImage::from_raw_frame(frame).unwrap();
    /// assert_eq!(img.as_bytes(), &[30, 20, 10]);
    /// ```
    pub fn from_raw_frame(frame: RawFrame) -> CaptureResult<Self> {
        if frame.data.len() != frame.expected_len() {
            return Err(CaptureError::ImageError(format!(
                "Raw frame is {} bytes, expected {} for {}x{}",
                frame.data.len(),
                frame.expected_len(),
                frame.width,
                frame.height
            )));
        }

        let rgb: Vec<u8> = match frame.channel_order {
            ChannelOrder::Bgra => frame
                .data
                .chunks_exact(4)
                .flat_map(|px| [px[2], px[1], px[0]])
                .collect(),
            ChannelOrder::Rgba => frame
                .data
                .chunks_exact(4)
                .flat_map(|px| [px[0], px[1], px[2]])
                .collect(),
        };

        RgbImage::from_raw(frame.width, frame.height, rgb)
            .map(Self::new)
            .ok_or_else(|| CaptureError::ImageError("RGB buffer size mismatch".to_string()))
    }

    /// Decodes an image from an already opened file
    ///
    /// The format is guessed from the content, not the extension.
    pub fn from_file(file: File) -> CaptureResult<Self> {
        let decoded = ImageReader::new(BufReader::new(file))
            .with_guessed_format()?
            .decode()?;
        Ok(Self::new(decoded.to_rgb8()))
    }

    /// Opens and decodes the image at `path`
    pub fn open(path: &Path) -> CaptureResult<Self> {
        Self::from_file(File::open(path)?)
    }

    /// Writes the image, format chosen from the extension
    pub fn save(&self, path: &Path) -> CaptureResult<()> {
        self.inner.save(path)?;
        Ok(())
    }

    /// Returns the dimensions of the image as (width, height)
    pub fn dimensions(&self) -> (u32, u32) {
        self.inner.dimensions()
    }

    pub fn width(&self) -> u32 {
        self.inner.width()
    }

    pub fn height(&self) -> u32 {
        self.inner.height()
    }

    /// Packed RGB bytes, row-major
    pub fn as_bytes(&self) -> &[u8] {
        self.inner.as_raw()
    }

    /// Creates a gradient image for tests and demos
    ///
    /// Blue at the top, cyan at the bottom.
    pub fn from_test_pattern(width: u32, height: u32) -> Self {
        let img = RgbImage::from_fn(width, height, |_x, y| {
            let ratio = y as f32 / height.max(1) as f32;
            image::Rgb([0, (255.0 * ratio) as u8, 255])
        });
        Self::new(img)
    }

    pub fn inner(&self) -> &RgbImage {
        &self.inner
    }

    pub fn into_inner(self) -> RgbImage {
        self.inner
    }
}

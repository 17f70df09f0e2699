//! Frame format descriptions and per-unit format catalogs.
//!
//! A [`Format`] is an immutable value: pixel layout plus geometry. Units
//! advertise the formats they can emit through a [`FormatCatalog`], and the
//! lifecycle state machine binds exactly one catalog member while a unit is
//! Ready or Streaming.
//!
//! When a unit is initialized without an explicit format, the catalog picks
//! one by scoring every entry against a [`FormatHint`]:
//!
//! ```rust,ignore
//! use camchain::format::{Format, FormatCatalog, FormatHint, PixelFormat};
//!
//! let mut catalog = FormatCatalog::new();
//! catalog.insert(Format::packed(PixelFormat::Rgb24, 640, 480));
//! catalog.insert(Format::packed(PixelFormat::Rgb24, 1280, 720));
//!
//! let hint = FormatHint::new().with_pixel_format(PixelFormat::Rgb24).with_width(640);
//! assert_eq!(catalog.auto_select(&hint).unwrap().width, 640);
//! ```

use crate::error::{Error, Result};
use std::fmt;
use std::str::FromStr;

/// Upper bound on the area term of a format score.
///
/// Every hint bonus is a multiple of this, so a single matching attribute
/// always outweighs any difference in raw frame area.
pub const SCORE_CAP: u64 = 10_000 * 10_000;

// ============================================================================
// Pixel formats
// ============================================================================

/// Pixel layout of a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum PixelFormat {
    /// YUV 4:2:0 planar.
    I420 = 0,
    /// YUV 4:2:0 semi-planar (interleaved UV plane).
    Nv12,
    /// YUV 4:2:2 packed (Y0 U Y1 V).
    Yuyv,
    /// YUV 4:2:2 packed (U Y0 V Y1).
    Uyvy,
    /// RGB 8-bit per channel, packed.
    #[default]
    Rgb24,
    /// BGR 8-bit per channel, packed.
    Bgr24,
    /// RGBA 8-bit per channel, packed.
    Rgba,
    /// BGRA 8-bit per channel, packed.
    Bgra,
    /// 8-bit grayscale.
    Gray8,
    /// 16-bit grayscale, little endian.
    Gray16Le,
    /// 8-bit Bayer mosaic, RGGB order.
    BayerRggb,
    /// 8-bit Bayer mosaic, BGGR order.
    BayerBggr,
    /// 8-bit Bayer mosaic, GRBG order.
    BayerGrbg,
    /// 8-bit Bayer mosaic, GBRG order.
    BayerGbrg,
    /// Motion JPEG, one compressed image per frame.
    Mjpeg,
}

impl PixelFormat {
    /// Every known pixel format, in declaration order.
    pub const ALL: [PixelFormat; 15] = [
        PixelFormat::I420,
        PixelFormat::Nv12,
        PixelFormat::Yuyv,
        PixelFormat::Uyvy,
        PixelFormat::Rgb24,
        PixelFormat::Bgr24,
        PixelFormat::Rgba,
        PixelFormat::Bgra,
        PixelFormat::Gray8,
        PixelFormat::Gray16Le,
        PixelFormat::BayerRggb,
        PixelFormat::BayerBggr,
        PixelFormat::BayerGrbg,
        PixelFormat::BayerGbrg,
        PixelFormat::Mjpeg,
    ];

    /// Stable identifier used in snapshots.
    pub const fn as_str(&self) -> &'static str {
        match self {
            PixelFormat::I420 => "I420",
            PixelFormat::Nv12 => "NV12",
            PixelFormat::Yuyv => "YUYV",
            PixelFormat::Uyvy => "UYVY",
            PixelFormat::Rgb24 => "RGB24",
            PixelFormat::Bgr24 => "BGR24",
            PixelFormat::Rgba => "RGBA",
            PixelFormat::Bgra => "BGRA",
            PixelFormat::Gray8 => "GRAY8",
            PixelFormat::Gray16Le => "GRAY16_LE",
            PixelFormat::BayerRggb => "BAYER_RGGB",
            PixelFormat::BayerBggr => "BAYER_BGGR",
            PixelFormat::BayerGrbg => "BAYER_GRBG",
            PixelFormat::BayerGbrg => "BAYER_GBRG",
            PixelFormat::Mjpeg => "MJPEG",
        }
    }

    /// Short human-readable name used in default format names.
    pub const fn nickname(&self) -> &'static str {
        match self {
            PixelFormat::I420 => "i420",
            PixelFormat::Nv12 => "nv12",
            PixelFormat::Yuyv => "yuyv",
            PixelFormat::Uyvy => "uyvy",
            PixelFormat::Rgb24 => "rgb",
            PixelFormat::Bgr24 => "bgr",
            PixelFormat::Rgba => "rgba",
            PixelFormat::Bgra => "bgra",
            PixelFormat::Gray8 => "gray",
            PixelFormat::Gray16Le => "gray16",
            PixelFormat::BayerRggb => "bayer-rggb",
            PixelFormat::BayerBggr => "bayer-bggr",
            PixelFormat::BayerGrbg => "bayer-grbg",
            PixelFormat::BayerGbrg => "bayer-gbrg",
            PixelFormat::Mjpeg => "mjpeg",
        }
    }

    /// Average bits per pixel, or `None` for compressed formats.
    pub const fn bits_per_pixel(&self) -> Option<u32> {
        match self {
            PixelFormat::I420 | PixelFormat::Nv12 => Some(12),
            PixelFormat::Yuyv | PixelFormat::Uyvy | PixelFormat::Gray16Le => Some(16),
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => Some(24),
            PixelFormat::Rgba | PixelFormat::Bgra => Some(32),
            PixelFormat::Gray8
            | PixelFormat::BayerRggb
            | PixelFormat::BayerBggr
            | PixelFormat::BayerGrbg
            | PixelFormat::BayerGbrg => Some(8),
            PixelFormat::Mjpeg => None,
        }
    }

    /// Whether the chroma data lives in separate planes after the luma plane.
    pub const fn is_planar(&self) -> bool {
        matches!(self, PixelFormat::I420 | PixelFormat::Nv12)
    }

    /// Row stride of a tightly packed frame of the given width.
    ///
    /// For planar formats this is the stride of the first plane.
    pub fn packed_stride(&self, width: u32) -> u32 {
        match self {
            PixelFormat::I420 | PixelFormat::Nv12 => width,
            PixelFormat::Mjpeg => 0,
            other => other.bits_per_pixel().unwrap_or(8) * width / 8,
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PixelFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        PixelFormat::ALL
            .iter()
            .copied()
            .find(|pf| pf.as_str().eq_ignore_ascii_case(s) || pf.nickname() == s)
            .ok_or_else(|| Error::InvalidFormat(format!("unrecognized pixel format \"{s}\"")))
    }
}

// ============================================================================
// Format
// ============================================================================

/// Pixel layout and geometry of the frames a unit emits.
///
/// Equality is by value over every field.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Format {
    /// Pixel layout.
    pub pixel_format: PixelFormat,
    /// Display name, e.g. `"640x480 rgb"`.
    pub name: String,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Bytes per row of the first plane (0 for compressed formats).
    pub row_stride: u32,
    /// Largest buffer a frame of this format can occupy.
    pub max_data_size: usize,
}

impl Format {
    /// Create a format, deriving the display name when `name` is `None`.
    ///
    /// Fails on zero width or height.
    pub fn new(
        pixel_format: PixelFormat,
        name: Option<&str>,
        width: u32,
        height: u32,
        row_stride: u32,
    ) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(Error::InvalidFormat(format!(
                "{width}x{height} is not a valid output format size"
            )));
        }
        let name = match name {
            Some(name) => name.to_string(),
            None => format!("{}x{} {}", width, height, pixel_format.nickname()),
        };
        Ok(Self {
            pixel_format,
            name,
            width,
            height,
            row_stride,
            max_data_size: Self::default_data_size(pixel_format, width, height, row_stride),
        })
    }

    /// Tightly packed format with a derived name.
    ///
    /// Geometry is not validated here; catalogs reject zero sizes on insert
    /// through [`Unit::add_output_format`](crate::unit::Unit::add_output_format).
    pub fn packed(pixel_format: PixelFormat, width: u32, height: u32) -> Self {
        let row_stride = pixel_format.packed_stride(width);
        Self {
            pixel_format,
            name: format!("{}x{} {}", width, height, pixel_format.nickname()),
            width,
            height,
            row_stride,
            max_data_size: Self::default_data_size(pixel_format, width, height, row_stride),
        }
    }

    /// Returns true if width and height are non-zero.
    pub fn is_valid(&self) -> bool {
        self.width > 0 && self.height > 0
    }

    /// Override the maximum buffer size.
    pub fn with_max_data_size(mut self, size: usize) -> Self {
        self.max_data_size = size;
        self
    }

    /// Override the display name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Number of pixels in one frame.
    #[inline]
    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    fn default_data_size(pf: PixelFormat, width: u32, height: u32, stride: u32) -> usize {
        match pf.bits_per_pixel() {
            Some(bpp) if pf.is_planar() => (width as usize * height as usize * bpp as usize) / 8,
            Some(_) => stride as usize * height as usize,
            // worst case for a compressed frame: the size of an RGB frame
            None => width as usize * height as usize * 3,
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

// ============================================================================
// Preferred-format hint
// ============================================================================

/// Attributes a caller would like the auto-selected format to have.
///
/// Unset fields never contribute to a score.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FormatHint {
    /// Preferred pixel layout.
    pub pixel_format: Option<PixelFormat>,
    /// Preferred width.
    pub width: Option<u32>,
    /// Preferred height.
    pub height: Option<u32>,
    /// Preferred format name.
    pub name: Option<String>,
}

impl FormatHint {
    /// Empty hint: selection falls back to the largest area.
    pub fn new() -> Self {
        Self::default()
    }

    /// Prefer a pixel layout.
    pub fn with_pixel_format(mut self, pixel_format: PixelFormat) -> Self {
        self.pixel_format = Some(pixel_format);
        self
    }

    /// Prefer a width.
    pub fn with_width(mut self, width: u32) -> Self {
        self.width = Some(width);
        self
    }

    /// Prefer a height.
    pub fn with_height(mut self, height: u32) -> Self {
        self.height = Some(height);
        self
    }

    /// Prefer a format name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Returns true if no attribute is set.
    pub fn is_empty(&self) -> bool {
        self.pixel_format.is_none()
            && self.width.is_none()
            && self.height.is_none()
            && self.name.is_none()
    }

    /// Score a candidate: capped area plus a bonus per matching attribute.
    pub fn score(&self, format: &Format) -> u64 {
        let mut score = format.area().min(SCORE_CAP);
        if self.pixel_format == Some(format.pixel_format) {
            score += 3 * SCORE_CAP;
        }
        if self.width.is_some_and(|w| w > 0 && w == format.width) {
            score += SCORE_CAP;
        }
        if self.height.is_some_and(|h| h > 0 && h == format.height) {
            score += SCORE_CAP;
        }
        if self.name.as_deref() == Some(format.name.as_str()) {
            score += SCORE_CAP;
        }
        score
    }
}

// ============================================================================
// Catalog
// ============================================================================

/// Insertion-ordered set of output formats, unique by value.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FormatCatalog {
    formats: Vec<Format>,
}

impl FormatCatalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a format. Returns `false` if an equal format is already present.
    pub fn insert(&mut self, format: Format) -> bool {
        if self.contains(&format) {
            return false;
        }
        self.formats.push(format);
        true
    }

    /// Remove a format by value. Returns the removed entry.
    pub fn remove(&mut self, format: &Format) -> Option<Format> {
        let index = self.position(format)?;
        Some(self.formats.remove(index))
    }

    /// Remove every format.
    pub fn clear(&mut self) {
        self.formats.clear();
    }

    /// Returns true if an equal format is present.
    pub fn contains(&self, format: &Format) -> bool {
        self.position(format).is_some()
    }

    /// Index of an equal format.
    pub fn position(&self, format: &Format) -> Option<usize> {
        self.formats.iter().position(|f| f == format)
    }

    /// The catalog member equal to `format`.
    pub fn find(&self, format: &Format) -> Option<&Format> {
        self.formats.iter().find(|f| *f == format)
    }

    /// Format at an index.
    pub fn get(&self, index: usize) -> Option<&Format> {
        self.formats.get(index)
    }

    /// Number of formats.
    pub fn len(&self) -> usize {
        self.formats.len()
    }

    /// Returns true if the catalog is empty.
    pub fn is_empty(&self) -> bool {
        self.formats.is_empty()
    }

    /// Iterate in insertion order.
    pub fn iter(&self) -> std::slice::Iter<'_, Format> {
        self.formats.iter()
    }

    /// Highest-scoring format for a hint; the first entry wins ties.
    pub fn auto_select(&self, hint: &FormatHint) -> Option<&Format> {
        let mut best: Option<(&Format, u64)> = None;
        for format in &self.formats {
            let score = hint.score(format);
            match best {
                Some((_, best_score)) if score <= best_score => {}
                _ => best = Some((format, score)),
            }
        }
        best.map(|(format, _)| format)
    }
}

impl<'a> IntoIterator for &'a FormatCatalog {
    type Item = &'a Format;
    type IntoIter = std::slice::Iter<'a, Format>;

    fn into_iter(self) -> Self::IntoIter {
        self.formats.iter()
    }
}

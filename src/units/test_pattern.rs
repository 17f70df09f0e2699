//! Synthetic frame generator.
//!
//! A timer-driven source that renders one of a few fixed patterns at a
//! configurable rate. Useful for exercising chains without hardware.

use crate::buffer::FrameBuffer;
use crate::clock;
use crate::error::{Error, Result};
use crate::format::{Format, FormatCatalog, PixelFormat};
use crate::unit::{Control, ControlValue, FrameOutput, UnitKind};
use tracing::{debug, trace};

/// Pixel formats the generator can render.
const RENDERABLE: [PixelFormat; 5] = [
    PixelFormat::Rgb24,
    PixelFormat::Bgr24,
    PixelFormat::Rgba,
    PixelFormat::Bgra,
    PixelFormat::Gray8,
];

/// 75% amplitude color bars: white, yellow, cyan, green, magenta, red, blue.
const BARS: [(u8, u8, u8); 7] = [
    (191, 191, 191),
    (191, 191, 0),
    (0, 191, 191),
    (0, 191, 0),
    (191, 0, 191),
    (191, 0, 0),
    (0, 0, 191),
];

/// Test pattern types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Pattern {
    /// Vertical color bars.
    #[default]
    Bars,
    /// Horizontal sweep through the hue circle.
    Gradient,
    /// Single color fill.
    Solid,
    /// Black and white squares.
    Checkerboard,
}

impl Pattern {
    const OPTIONS: [(i32, &'static str); 4] = [
        (0, "bars"),
        (1, "gradient"),
        (2, "solid"),
        (3, "checkerboard"),
    ];

    /// Value of the `pattern` enum control.
    pub const fn index(&self) -> i32 {
        match self {
            Pattern::Bars => 0,
            Pattern::Gradient => 1,
            Pattern::Solid => 2,
            Pattern::Checkerboard => 3,
        }
    }

    /// Pattern for an enum control value.
    pub fn from_index(index: i32) -> Option<Self> {
        match index {
            0 => Some(Pattern::Bars),
            1 => Some(Pattern::Gradient),
            2 => Some(Pattern::Solid),
            3 => Some(Pattern::Checkerboard),
            _ => None,
        }
    }
}

/// Timer-driven pattern source.
///
/// # Example
///
/// ```rust,ignore
/// use camchain::units::{Pattern, TestPattern};
///
/// let kind = TestPattern::new()
///     .with_size(320, 240)
///     .with_fps(15.0)
///     .with_pattern(Pattern::Checkerboard);
/// ```
#[derive(Debug)]
pub struct TestPattern {
    width: u32,
    height: u32,
    fps: f64,
    pattern: Pattern,
    solid_color: (u8, u8, u8),
    checker_size: u32,

    format: Option<Format>,
    next: Option<i64>,
    sequence: u64,
}

impl TestPattern {
    /// 640x480 color bars at 30 fps.
    pub fn new() -> Self {
        Self {
            width: 640,
            height: 480,
            fps: 30.0,
            pattern: Pattern::default(),
            solid_color: (128, 128, 128),
            checker_size: 32,
            format: None,
            next: None,
            sequence: 0,
        }
    }

    /// Set the frame size advertised in the catalog.
    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Set the frame rate.
    pub fn with_fps(mut self, fps: f64) -> Self {
        self.fps = fps;
        self
    }

    /// Set the pattern.
    pub fn with_pattern(mut self, pattern: Pattern) -> Self {
        self.pattern = pattern;
        self
    }

    /// Fill color of [`Pattern::Solid`].
    pub fn with_solid_color(mut self, r: u8, g: u8, b: u8) -> Self {
        self.solid_color = (r, g, b);
        self
    }

    /// Side of one checkerboard square in pixels.
    pub fn with_checker_size(mut self, size: u32) -> Self {
        self.checker_size = size.max(1);
        self
    }

    /// Current pattern.
    pub fn pattern(&self) -> Pattern {
        self.pattern
    }

    /// Current frame rate.
    pub fn fps(&self) -> f64 {
        self.fps
    }

    /// Frames produced since the last `stream_on`.
    pub fn frames_produced(&self) -> u64 {
        self.sequence
    }

    fn render(&self, format: &Format, data: &mut [u8]) {
        let bpp = (format.pixel_format.bits_per_pixel().unwrap_or(24) / 8) as usize;
        let stride = format.row_stride as usize;
        let (w, h) = (format.width, format.height);
        let top = (h * 2) / 3;
        let bar_width = (w / 7).max(1);
        let size = self.checker_size.max(1);

        for y in 0..h {
            let row = &mut data[y as usize * stride..];
            for x in 0..w {
                let rgb = match self.pattern {
                    Pattern::Bars if y < top => BARS[(x / bar_width).min(6) as usize],
                    // bottom third: reverse bars at half intensity
                    Pattern::Bars => {
                        let (r, g, b) = BARS[6 - (x / bar_width).min(6) as usize];
                        (r / 2, g / 2, b / 2)
                    }
                    Pattern::Gradient => hsv_to_rgb(x as f32 / w as f32 * 360.0, 1.0, 1.0),
                    Pattern::Solid => self.solid_color,
                    Pattern::Checkerboard if ((x / size) + (y / size)) % 2 == 0 => (255, 255, 255),
                    Pattern::Checkerboard => (0, 0, 0),
                };
                let offset = x as usize * bpp;
                write_pixel(format.pixel_format, &mut row[offset..offset + bpp], rgb);
            }
        }
    }
}

impl Default for TestPattern {
    fn default() -> Self {
        Self::new()
    }
}

impl UnitKind for TestPattern {
    fn derive_outputs(&mut self, catalog: &mut FormatCatalog, _input: Option<&Format>) {
        catalog.clear();
        if self.width == 0 || self.height == 0 {
            return;
        }
        for pixel_format in RENDERABLE {
            catalog.insert(Format::packed(pixel_format, self.width, self.height));
        }
    }

    fn stream_init(&mut self, format: &Format) -> Result<()> {
        if !RENDERABLE.contains(&format.pixel_format) {
            return Err(Error::hook(format!(
                "test pattern cannot render {}",
                format.pixel_format
            )));
        }
        let min_stride = format.pixel_format.packed_stride(format.width);
        let frame_size = format.row_stride as usize * format.height as usize;
        if format.row_stride < min_stride || format.max_data_size < frame_size {
            return Err(Error::hook(format!(
                "test pattern needs a row stride of at least {} bytes for [{}]",
                min_stride, format.name
            )));
        }
        self.format = Some(format.clone());
        Ok(())
    }

    fn stream_on(&mut self) -> Result<()> {
        self.sequence = 0;
        self.next = Some(clock::now_micros());
        debug!(fps = self.fps, pattern = ?self.pattern, "test pattern started");
        Ok(())
    }

    fn stream_off(&mut self) -> Result<()> {
        self.next = None;
        Ok(())
    }

    fn stream_shutdown(&mut self) -> Result<()> {
        self.format = None;
        Ok(())
    }

    fn next_event_time(&self) -> Option<i64> {
        self.next
    }

    fn try_produce(&mut self, out: &mut FrameOutput) -> Result<bool> {
        let Some(format) = self.format.as_ref() else {
            return Err(Error::hook("test pattern has no bound format"));
        };

        let used = format.row_stride as usize * format.height as usize;
        let mut frame = FrameBuffer::with_capacity(format.max_data_size.max(used));
        self.render(format, frame.as_mut_slice());
        frame.set_bytes_used(used);

        let now = clock::now_micros();
        frame.set_timestamp(now);
        frame.set_sequence(self.sequence);
        out.push(frame.freeze());
        trace!(sequence = self.sequence, "test pattern frame");
        self.sequence += 1;

        let interval = clock::frame_interval_micros(self.fps);
        self.next = Some(match self.next {
            // keep the cadence unless more than a frame behind
            Some(deadline) if deadline + interval > now => deadline + interval,
            _ => now + interval,
        });
        Ok(true)
    }

    fn controls(&self) -> Vec<Control> {
        vec![
            Control::float("fps", "Frame rate", 1.0, 120.0, 1.0, self.fps.clamp(1.0, 120.0)),
            Control::enumeration("pattern", "Pattern", &Pattern::OPTIONS, self.pattern.index()),
        ]
    }

    fn try_set_control(&mut self, control: &Control, proposed: &ControlValue) -> Option<ControlValue> {
        match control.id() {
            "fps" => {
                self.fps = proposed.as_float()?;
                Some(proposed.clone())
            }
            "pattern" => {
                self.pattern = Pattern::from_index(proposed.as_int()?)?;
                Some(proposed.clone())
            }
            _ => None,
        }
    }
}

fn write_pixel(pixel_format: PixelFormat, buf: &mut [u8], (r, g, b): (u8, u8, u8)) {
    match pixel_format {
        PixelFormat::Rgb24 => buf.copy_from_slice(&[r, g, b]),
        PixelFormat::Bgr24 => buf.copy_from_slice(&[b, g, r]),
        PixelFormat::Rgba => buf.copy_from_slice(&[r, g, b, 255]),
        PixelFormat::Bgra => buf.copy_from_slice(&[b, g, r, 255]),
        PixelFormat::Gray8 => {
            buf[0] = ((r as u32 * 77 + g as u32 * 150 + b as u32 * 29) >> 8) as u8;
        }
        _ => {}
    }
}

/// Convert HSV to RGB. H: 0-360, S: 0-1, V: 0-1.
fn hsv_to_rgb(h: f32, s: f32, v: f32) -> (u8, u8, u8) {
    let h = h % 360.0;
    let c = v * s;
    let x = c * (1.0 - ((h / 60.0) % 2.0 - 1.0).abs());
    let m = v - c;

    let (r, g, b) = if h < 60.0 {
        (c, x, 0.0)
    } else if h < 120.0 {
        (x, c, 0.0)
    } else if h < 180.0 {
        (0.0, c, x)
    } else if h < 240.0 {
        (0.0, x, c)
    } else if h < 300.0 {
        (x, 0.0, c)
    } else {
        (c, 0.0, x)
    };

    (
        ((r + m) * 255.0) as u8,
        ((g + m) * 255.0) as u8,
        ((b + m) * 255.0) as u8,
    )
}

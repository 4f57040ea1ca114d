//! Frames and the pixel operations the pipeline needs.
//!
//! - `Frame`: owned RGB8 pixel buffer plus dimensions, capture time and source id.
//! - Resizing for analysis and display, bounding-box overlays, JPEG encode/decode.
//!
//! A `Frame` is owned by exactly one queue or stage at a time; hand-off moves it.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{ExtendedColorType, ImageFormat, Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;

use crate::detect::Detection;

/// Bytes per pixel (RGB8).
pub const CHANNELS: usize = 3;

const OVERLAY_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const OVERLAY_THICKNESS: i32 = 2;

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// One decoded video frame, RGB8, row-major, no padding.
#[derive(Clone)]
pub struct Frame {
    data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Capture time, seconds since the Unix epoch.
    pub captured_at: f64,
    pub source_id: Arc<str>,
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("source_id", &self.source_id)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("captured_at", &self.captured_at)
            .field("bytes", &self.data.len())
            .finish()
    }
}

impl Frame {
    pub fn new(
        source_id: Arc<str>,
        width: u32,
        height: u32,
        data: Vec<u8>,
        captured_at: f64,
    ) -> Result<Self> {
        let expected = byte_len(width, height)?;
        if data.len() != expected {
            return Err(anyhow!(
                "frame {}x{} expects {} RGB bytes, got {}",
                width,
                height,
                expected,
                data.len()
            ));
        }
        Ok(Self {
            data,
            width,
            height,
            captured_at,
            source_id,
        })
    }

    /// Black frame, used for detector warm-up.
    pub fn blank(source_id: Arc<str>, width: u32, height: u32) -> Result<Self> {
        let len = byte_len(width, height)?;
        Self::new(source_id, width, height, vec![0u8; len], crate::now_secs())
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    pub fn pixels_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn into_pixels(self) -> Vec<u8> {
        self.data
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    /// Resize to exactly `width` x `height`.
    pub fn resized(&self, width: u32, height: u32) -> Result<Frame> {
        if width == self.width && height == self.height {
            return Ok(self.clone());
        }
        if width == 0 || height == 0 {
            return Err(anyhow!("cannot resize to {}x{}", width, height));
        }
        let img = self.to_image()?;
        let out = image::imageops::resize(&img, width, height, FilterType::Triangle);
        Frame::new(
            self.source_id.clone(),
            width,
            height,
            out.into_raw(),
            self.captured_at,
        )
    }

    /// Downscale so neither side exceeds `max_edge`, keeping aspect ratio.
    pub fn fit_within(&self, max_edge: u32) -> Result<Frame> {
        if max_edge == 0 || (self.width <= max_edge && self.height <= max_edge) {
            return Ok(self.clone());
        }
        if self.width >= self.height {
            let height = scaled_height(self.width, self.height, max_edge);
            self.resized(max_edge, height)
        } else {
            let width = scaled_height(self.height, self.width, max_edge);
            self.resized(width, max_edge)
        }
    }

    /// Draw each detection's box. Box coordinates are in this frame's pixel space.
    pub fn draw_detections(&mut self, detections: &[Detection]) -> Result<()> {
        if detections.is_empty() {
            return Ok(());
        }
        let mut img = self.to_image()?;
        for det in detections {
            let b = det.bbox.clamped(self.width as f32, self.height as f32);
            for inset in 0..OVERLAY_THICKNESS {
                let w = (b.width() as i32 - 2 * inset).max(1) as u32;
                let h = (b.height() as i32 - 2 * inset).max(1) as u32;
                let rect = Rect::at(b.x1 as i32 + inset, b.y1 as i32 + inset).of_size(w, h);
                draw_hollow_rect_mut(&mut img, rect, OVERLAY_COLOR);
            }
        }
        self.data = img.into_raw();
        Ok(())
    }

    /// Encode as baseline JPEG at `quality` (1..=100).
    pub fn encode_jpeg(&self, quality: u8) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.data.len() / 8);
        let mut encoder = JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100));
        encoder
            .encode(&self.data, self.width, self.height, ExtendedColorType::Rgb8)
            .context("encode jpeg")?;
        Ok(out)
    }

    /// Decode a JPEG produced by `encode_jpeg` (or any baseline JPEG).
    pub fn decode_jpeg(source_id: Arc<str>, bytes: &[u8], captured_at: f64) -> Result<Frame> {
        let img = image::load_from_memory_with_format(bytes, ImageFormat::Jpeg)
            .context("decode jpeg")?
            .to_rgb8();
        let (width, height) = img.dimensions();
        Frame::new(source_id, width, height, img.into_raw(), captured_at)
    }

    fn to_image(&self) -> Result<RgbImage> {
        RgbImage::from_raw(self.width, self.height, self.data.clone())
            .ok_or_else(|| anyhow!("frame buffer does not match {}x{}", self.width, self.height))
    }
}

/// Byte length of an RGB8 frame, checked for overflow.
pub fn byte_len(width: u32, height: u32) -> Result<usize> {
    (width as usize)
        .checked_mul(height as usize)
        .and_then(|v| v.checked_mul(CHANNELS))
        .ok_or_else(|| anyhow!("frame dimensions overflow"))
}

/// Height after scaling `width` x `height` to `new_width`, aspect preserved.
pub fn scaled_height(width: u32, height: u32, new_width: u32) -> u32 {
    if width == 0 {
        return height.max(1);
    }
    ((height as u64 * new_width as u64) / width as u64).max(1) as u32
}

/// Shape the detector sees for an input of `width` x `height`.
///
/// With an explicit `target_height` the shape is fixed; otherwise the frame is
/// downscaled to `target_width` (never upscaled) with its aspect ratio kept.
pub fn analysis_shape(
    width: u32,
    height: u32,
    target_width: u32,
    target_height: Option<u32>,
) -> (u32, u32) {
    match target_height {
        Some(h) => (target_width, h),
        None if width > target_width => (target_width, scaled_height(width, height, target_width)),
        None => (width, height),
    }
}

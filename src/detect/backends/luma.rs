use anyhow::Result;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{BoundingBox, Detection};
use crate::frame::{Frame, CHANNELS};

pub const DEFAULT_LUMA_THRESHOLD: u8 = 200;
pub const DEFAULT_MIN_FRACTION: f32 = 0.001;

/// Bright-region detector: one "bright" box around every pixel whose luma is at
/// or above `threshold`.
pub struct LumaBackend {
    threshold: u8,
    min_fraction: f32,
}

impl LumaBackend {
    pub fn new(threshold: u8, min_fraction: f32) -> Self {
        Self {
            threshold,
            min_fraction: min_fraction.clamp(0.0, 1.0),
        }
    }
}

impl Default for LumaBackend {
    fn default() -> Self {
        Self::new(DEFAULT_LUMA_THRESHOLD, DEFAULT_MIN_FRACTION)
    }
}

fn luma(px: &[u8]) -> u8 {
    // BT.601 integer approximation.
    ((77 * px[0] as u32 + 150 * px[1] as u32 + 29 * px[2] as u32) >> 8) as u8
}

impl DetectorBackend for LumaBackend {
    fn name(&self) -> &str {
        "luma"
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        let width = frame.width as usize;
        let (mut min_x, mut min_y) = (usize::MAX, usize::MAX);
        let (mut max_x, mut max_y) = (0usize, 0usize);
        let mut bright = 0usize;
        let mut luma_sum = 0u64;

        for (i, px) in frame.pixels().chunks_exact(CHANNELS).enumerate() {
            let l = luma(px);
            if l < self.threshold {
                continue;
            }
            let (x, y) = (i % width, i / width);
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);
            bright += 1;
            luma_sum += l as u64;
        }

        let total = (frame.width as usize * frame.height as usize).max(1);
        if bright == 0 || (bright as f32 / total as f32) < self.min_fraction {
            return Ok(Vec::new());
        }
        let confidence = luma_sum as f32 / bright as f32 / 255.0;
        let bbox = BoundingBox::new(
            min_x as f32,
            min_y as f32,
            (max_x + 1) as f32,
            (max_y + 1) as f32,
        );
        Ok(vec![Detection::new("bright", confidence, bbox)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn boxes_the_bright_patch() {
        let (w, h) = (10u32, 8u32);
        let mut data = vec![0u8; (w * h) as usize * CHANNELS];
        for y in 2..4 {
            for x in 5..8 {
                let i = (y * w as usize + x) * CHANNELS;
                data[i..i + 3].copy_from_slice(&[255, 255, 255]);
            }
        }
        let frame = Frame::new(Arc::from("cam"), w, h, data, 0.0).unwrap();
        let dets = LumaBackend::default().detect(&frame).unwrap();
        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].bbox, BoundingBox::new(5.0, 2.0, 8.0, 4.0));
        assert!(dets[0].confidence > 0.95);
    }

    #[test]
    fn dark_frame_has_no_detections() {
        let frame = Frame::blank(Arc::from("cam"), 4, 4).unwrap();
        assert!(LumaBackend::default().detect(&frame).unwrap().is_empty());
    }
}

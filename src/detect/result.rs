use serde::{Deserialize, Serialize};

/// Axis-aligned box in pixel coordinates of the frame it was computed on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Box covering a whole `width` x `height` frame.
    pub fn full(width: u32, height: u32) -> Self {
        Self::new(0.0, 0.0, width as f32, height as f32)
    }

    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    /// Multiply x by `sx` and y by `sy`.
    pub fn scaled(&self, sx: f32, sy: f32) -> Self {
        Self::new(self.x1 * sx, self.y1 * sy, self.x2 * sx, self.y2 * sy)
    }

    /// Clamp into `[0, width] x [0, height]`, normalising corner order.
    pub fn clamped(&self, width: f32, height: f32) -> Self {
        let (x1, x2) = (self.x1.min(self.x2), self.x1.max(self.x2));
        let (y1, y2) = (self.y1.min(self.y2), self.y1.max(self.y2));
        Self::new(
            x1.clamp(0.0, width),
            y1.clamp(0.0, height),
            x2.clamp(0.0, width),
            y2.clamp(0.0, height),
        )
    }
}

/// One labelled box returned by a detector.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub category: String,
    /// In `[0, 1]`.
    pub confidence: f32,
    pub bbox: BoundingBox,
}

impl Detection {
    pub fn new(category: impl Into<String>, confidence: f32, bbox: BoundingBox) -> Self {
        Self {
            category: category.into(),
            confidence: confidence.clamp(0.0, 1.0),
            bbox,
        }
    }
}

/// Output of one detection cycle, boxes in published-frame coordinates.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub source_id: String,
    pub detections: Vec<Detection>,
    /// Wall time spent inside the detector call.
    pub inference_ms: f64,
    /// Seconds since the Unix epoch.
    pub timestamp: f64,
}

impl DetectionResult {
    /// Distinct categories in first-seen order.
    pub fn categories(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        for det in &self.detections {
            if !out.contains(&det.category.as_str()) {
                out.push(&det.category);
            }
        }
        out
    }
}

/// Keep detections at or above `threshold`.
pub fn filter_confident(detections: Vec<Detection>, threshold: f32) -> Vec<Detection> {
    detections
        .into_iter()
        .filter(|d| d.confidence >= threshold)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_normalises_and_bounds() {
        let b = BoundingBox::new(30.0, -5.0, -2.0, 50.0).clamped(20.0, 40.0);
        assert_eq!(b, BoundingBox::new(0.0, 0.0, 20.0, 40.0));
    }

    #[test]
    fn scaling_maps_analysis_to_original() {
        let b = BoundingBox::new(10.0, 10.0, 20.0, 30.0).scaled(2.0, 2.0);
        assert_eq!(b, BoundingBox::new(20.0, 20.0, 40.0, 60.0));
        assert_eq!(b.width(), 20.0);
        assert_eq!(b.height(), 40.0);
    }

    #[test]
    fn filters_below_threshold() {
        let dets = vec![
            Detection::new("cat", 0.9, BoundingBox::default()),
            Detection::new("dog", 0.29, BoundingBox::default()),
            Detection::new("cat", 0.3, BoundingBox::default()),
        ];
        let kept = filter_confident(dets, 0.3);
        assert_eq!(kept.len(), 2);
        let result = DetectionResult {
            detections: kept,
            ..Default::default()
        };
        assert_eq!(result.categories(), vec!["cat"]);
    }
}

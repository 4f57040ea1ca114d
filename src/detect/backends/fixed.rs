use anyhow::Result;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{BoundingBox, Detection};
use crate::frame::Frame;

/// Returns the same detection for every frame. Useful for demos and tests.
#[derive(Clone, Debug)]
pub struct FixedBackend {
    detection: Detection,
}

impl FixedBackend {
    pub fn new(label: impl Into<String>, confidence: f32, bbox: BoundingBox) -> Self {
        Self {
            detection: Detection::new(label, confidence, bbox),
        }
    }
}

impl DetectorBackend for FixedBackend {
    fn name(&self) -> &str {
        "fixed"
    }

    fn detect(&mut self, _frame: &Frame) -> Result<Vec<Detection>> {
        Ok(vec![self.detection.clone()])
    }
}

use anyhow::Result;
use sha2::{Digest, Sha256};

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{BoundingBox, Detection};
use crate::frame::Frame;

const MOTION_CONFIDENCE: f32 = 0.85;

/// Frame-hash change detector. Reports one full-frame "motion" box whenever the
/// pixels differ from the previous frame.
#[derive(Default)]
pub struct MotionBackend {
    last_hash: Option<[u8; 32]>,
}

impl MotionBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DetectorBackend for MotionBackend {
    fn name(&self) -> &str {
        "motion"
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        let current_hash: [u8; 32] = Sha256::digest(frame.pixels()).into();
        let motion = self.last_hash.is_some_and(|prev| prev != current_hash);
        self.last_hash = Some(current_hash);

        if motion {
            Ok(vec![Detection::new(
                "motion",
                MOTION_CONFIDENCE,
                BoundingBox::full(frame.width, frame.height),
            )])
        } else {
            Ok(Vec::new())
        }
    }

    // Warm-up frames are blank; keep them out of the comparison baseline.
    fn warm_up(&mut self, _frame: &Frame) -> Result<()> {
        Ok(())
    }
}

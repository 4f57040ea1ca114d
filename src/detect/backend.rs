use anyhow::Result;

use crate::detect::result::Detection;
use crate::frame::Frame;

/// Frame analysis capability driven by one consumer loop.
///
/// `detect` receives the analysis frame and returns boxes in that frame's pixel
/// coordinates. It may be slow. Errors are fatal to the calling pipeline; the
/// backend should not retry internally.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &str;

    /// Run detection on a frame.
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>>;

    /// Absorb first-call initialisation cost. Results are discarded.
    fn warm_up(&mut self, frame: &Frame) -> Result<()> {
        self.detect(frame).map(|_| ())
    }
}

impl<B: DetectorBackend + ?Sized> DetectorBackend for Box<B> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        (**self).detect(frame)
    }

    fn warm_up(&mut self, frame: &Frame) -> Result<()> {
        (**self).warm_up(frame)
    }
}

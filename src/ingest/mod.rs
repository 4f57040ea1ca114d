//! Frame ingestion sources.
//!
//! A `SourceOpener` turns a configured `SourceSpec` into a `FrameSource`; the
//! producer stage then reads frames from it in a loop.
//!
//! - `stub://` URIs open a synthetic source (tests, demos, soak runs).
//! - Anything else is decoded with FFmpeg (feature: ingest-ffmpeg): local files,
//!   devices and RTSP-like connection strings.
//!
//! Sources never pace themselves; the producer does that against `native_fps`.

#[cfg(feature = "ingest-ffmpeg")]
pub(crate) mod ffmpeg;
pub mod synthetic;

use anyhow::Result;

use crate::config::SourceSpec;
use crate::error::SourceError;
use crate::frame::Frame;

pub use synthetic::{SyntheticConfig, SyntheticSource};

/// Frame rate assumed when neither the decoder nor the configuration has one.
pub const DEFAULT_SOURCE_FPS: f64 = 25.0;

/// An opened decode source.
pub trait FrameSource: Send {
    /// Read the next frame. `EndOfStream` means no more frames until `rewind`;
    /// any other error may be transient.
    fn read(&mut self) -> Result<Frame, SourceError>;

    /// Frame rate reported by the decoder, if it knows one.
    fn native_fps(&self) -> Option<f64>;

    /// Seek back to the first frame. Live sources return an error.
    fn rewind(&mut self) -> Result<()>;

    /// Live sources deliver at their own rate and are not paced or rewound.
    fn is_live(&self) -> bool;

    /// Human-readable description for logs.
    fn describe(&self) -> String;
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn read(&mut self) -> Result<Frame, SourceError> {
        (**self).read()
    }

    fn native_fps(&self) -> Option<f64> {
        (**self).native_fps()
    }

    fn rewind(&mut self) -> Result<()> {
        (**self).rewind()
    }

    fn is_live(&self) -> bool {
        (**self).is_live()
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

/// Opens decode sources from their configured descriptors.
pub trait SourceOpener: Send + Sync {
    fn open(&self, spec: &SourceSpec) -> Result<Box<dyn FrameSource>>;
}

/// Scheme-dispatching opener used by the daemon and worker processes.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultOpener;

impl SourceOpener for DefaultOpener {
    fn open(&self, spec: &SourceSpec) -> Result<Box<dyn FrameSource>> {
        if spec.uri.starts_with(synthetic::SCHEME) {
            let config = SyntheticConfig::parse(&spec.uri)?;
            return Ok(Box::new(SyntheticSource::new(spec.id.as_str(), config)?));
        }
        #[cfg(feature = "ingest-ffmpeg")]
        {
            Ok(Box::new(ffmpeg::FfmpegSource::open(spec.id.as_str(), &spec.uri)?))
        }
        #[cfg(not(feature = "ingest-ffmpeg"))]
        {
            anyhow::bail!(
                "source '{}' ({}) requires the ingest-ffmpeg feature",
                spec.id,
                spec.uri
            )
        }
    }
}

/// Effective pacing rate: decoder first, then configuration, then the default.
pub fn effective_fps(source: &dyn FrameSource, configured: Option<f64>) -> f64 {
    let valid = |fps: f64| fps.is_finite() && fps > 0.0;
    source
        .native_fps()
        .filter(|f| valid(*f))
        .or(configured.filter(|f| valid(*f)))
        .unwrap_or(DEFAULT_SOURCE_FPS)
}

//! Synthetic frame source for `stub://` URIs.
//!
//! Query parameters (all optional):
//! - `width`, `height`: frame size (default 320x240)
//! - `fps`: reported native rate (default 25)
//! - `frames`: frames before end-of-stream (default unlimited)
//! - `fail_after`: after this many frames every read fails
//! - `fail_rate`: probability in `[0, 1]` that a read fails transiently
//! - `live`: `true` to report a live source (no pacing, no rewind)
//! - `refuse`: `true` to fail at open, like an unreachable camera
//!
//! Example: `stub://lobby?width=64&height=48&fps=10&frames=10`.

use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use rand::Rng;

use super::FrameSource;
use crate::error::SourceError;
use crate::frame::{byte_len, Frame};

pub const SCHEME: &str = "stub://";

#[derive(Clone, Debug, PartialEq)]
pub struct SyntheticConfig {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub frames: Option<u64>,
    pub fail_after: Option<u64>,
    pub fail_rate: f64,
    pub live: bool,
    pub refuse: bool,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            width: 320,
            height: 240,
            fps: super::DEFAULT_SOURCE_FPS,
            frames: None,
            fail_after: None,
            fail_rate: 0.0,
            live: false,
            refuse: false,
        }
    }
}

impl SyntheticConfig {
    pub fn parse(uri: &str) -> Result<Self> {
        let rest = uri
            .strip_prefix(SCHEME)
            .ok_or_else(|| anyhow!("synthetic source uri must start with {}", SCHEME))?;
        let (name, query) = rest.split_once('?').unwrap_or((rest, ""));
        let mut config = SyntheticConfig {
            name: name.to_string(),
            ..Default::default()
        };

        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| anyhow!("malformed query parameter '{}' in {}", pair, uri))?;
            match key {
                "width" => config.width = parse_value(key, value)?,
                "height" => config.height = parse_value(key, value)?,
                "fps" => config.fps = parse_value(key, value)?,
                "frames" => config.frames = Some(parse_value(key, value)?),
                "fail_after" => config.fail_after = Some(parse_value(key, value)?),
                "fail_rate" => config.fail_rate = parse_value(key, value)?,
                "live" => config.live = parse_value(key, value)?,
                "refuse" => config.refuse = parse_value(key, value)?,
                other => bail!("unknown synthetic source parameter '{}'", other),
            }
        }

        if config.width == 0 || config.height == 0 {
            bail!("synthetic source dimensions must be non-zero");
        }
        if !(0.0..=1.0).contains(&config.fail_rate) {
            bail!("fail_rate must be within [0, 1]");
        }
        Ok(config)
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .parse()
        .with_context(|| format!("invalid value '{}' for '{}'", value, key))
}

/// Moving-gradient frames with optional failure injection.
pub struct SyntheticSource {
    source_id: Arc<str>,
    config: SyntheticConfig,
    position: u64,
    delivered: u64,
}

impl SyntheticSource {
    pub fn new(source_id: &str, config: SyntheticConfig) -> Result<Self> {
        if config.refuse {
            bail!("synthetic source {} refused connection", config.name);
        }
        byte_len(config.width, config.height)?;
        log::info!(
            "[{}] synthetic source {} opened ({}x{} @ {} fps)",
            source_id,
            config.name,
            config.width,
            config.height,
            config.fps
        );
        Ok(Self {
            source_id: Arc::from(source_id),
            config,
            position: 0,
            delivered: 0,
        })
    }

    fn render(&self) -> Result<Frame, SourceError> {
        let (w, h) = (self.config.width, self.config.height);
        let shift = self.position as usize * 4;
        let mut data = Vec::with_capacity(byte_len(w, h)?);
        for y in 0..h as usize {
            for x in 0..w as usize {
                data.push(((x + shift) % 256) as u8);
                data.push(((y + shift / 2) % 256) as u8);
                data.push((self.position % 256) as u8);
            }
        }
        Ok(Frame::new(
            self.source_id.clone(),
            w,
            h,
            data,
            crate::now_secs(),
        )?)
    }
}

impl FrameSource for SyntheticSource {
    fn read(&mut self) -> Result<Frame, SourceError> {
        if let Some(limit) = self.config.fail_after {
            if self.delivered >= limit {
                return Err(SourceError::Read(anyhow!("synthetic source stalled")));
            }
        }
        if let Some(frames) = self.config.frames {
            if self.position >= frames {
                return Err(SourceError::EndOfStream);
            }
        }
        if self.config.fail_rate > 0.0 && rand::thread_rng().gen_bool(self.config.fail_rate) {
            return Err(SourceError::Read(anyhow!("synthetic transient glitch")));
        }
        let frame = self.render()?;
        self.position += 1;
        self.delivered += 1;
        Ok(frame)
    }

    fn native_fps(&self) -> Option<f64> {
        Some(self.config.fps)
    }

    fn rewind(&mut self) -> Result<()> {
        if self.config.live {
            bail!("live synthetic source cannot rewind");
        }
        self.position = 0;
        Ok(())
    }

    fn is_live(&self) -> bool {
        self.config.live
    }

    fn describe(&self) -> String {
        format!("{}{}", SCHEME, self.config.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_query_parameters() {
        let config = SyntheticConfig::parse("stub://lobby?width=64&height=48&fps=10&frames=3").unwrap();
        assert_eq!(config.name, "lobby");
        assert_eq!((config.width, config.height), (64, 48));
        assert_eq!(config.fps, 10.0);
        assert_eq!(config.frames, Some(3));
        assert!(SyntheticConfig::parse("stub://x?bogus=1").is_err());
        assert!(SyntheticConfig::parse("stub://x?width=0").is_err());
        assert!(SyntheticConfig::parse("file.mp4").is_err());
    }

    #[test]
    fn ends_and_rewinds() {
        let config = SyntheticConfig::parse("stub://a?width=8&height=4&frames=2").unwrap();
        let mut source = SyntheticSource::new("a", config).unwrap();
        let first = source.read().unwrap();
        assert_eq!((first.width, first.height), (8, 4));
        assert_eq!(&*first.source_id, "a");
        let second = source.read().unwrap();
        assert_ne!(first.pixels(), second.pixels());
        assert!(source.read().unwrap_err().is_end_of_stream());

        source.rewind().unwrap();
        assert_eq!(source.read().unwrap().pixels(), first.pixels());
    }

    #[test]
    fn fails_after_limit_and_refuses() {
        let config = SyntheticConfig::parse("stub://a?width=2&height=2&fail_after=1").unwrap();
        let mut source = SyntheticSource::new("a", config).unwrap();
        assert!(source.read().is_ok());
        for _ in 0..3 {
            let err = source.read().unwrap_err();
            assert!(!err.is_end_of_stream());
        }

        let refused = SyntheticConfig::parse("stub://a?refuse=true").unwrap();
        assert!(SyntheticSource::new("a", refused).is_err());
    }
}

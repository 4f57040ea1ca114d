//! FFmpeg-backed decode source for files, devices and network streams.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use ffmpeg_next as ffmpeg;

use super::FrameSource;
use crate::error::SourceError;
use crate::frame::Frame;

pub(crate) struct FfmpegSource {
    source_id: Arc<str>,
    uri: String,
    input: ffmpeg::format::context::Input,
    stream_index: usize,
    decoder: ffmpeg::codec::decoder::Video,
    scaler: ffmpeg::software::scaling::Context,
    fps: Option<f64>,
    live: bool,
    flushed: bool,
}

impl FfmpegSource {
    pub(crate) fn open(source_id: &str, uri: &str) -> Result<Self> {
        ffmpeg::init().context("initialize ffmpeg")?;
        let input = ffmpeg::format::input(&uri)
            .with_context(|| format!("failed to open input '{}' with ffmpeg", uri))?;
        let input_stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| anyhow!("'{}' has no video track", uri))?;
        let stream_index = input_stream.index();
        let rate = f64::from(input_stream.avg_frame_rate());
        let fps = (rate.is_finite() && rate > 0.0).then_some(rate);
        let context = ffmpeg::codec::context::Context::from_parameters(input_stream.parameters())
            .context("load video decoder parameters")?;
        let decoder = context
            .decoder()
            .video()
            .context("open ffmpeg video decoder")?;

        let scaler = ffmpeg::software::scaling::context::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::util::format::pixel::Pixel::RGB24,
            decoder.width(),
            decoder.height(),
            ffmpeg::software::scaling::flag::Flags::BILINEAR,
        )
        .context("create ffmpeg scaler")?;

        let live = uri.contains("://") && !uri.starts_with("file://");
        log::info!(
            "[{}] ffmpeg source {} opened ({}x{}, fps {:?}, live {})",
            source_id,
            uri,
            decoder.width(),
            decoder.height(),
            fps,
            live
        );

        Ok(Self {
            source_id: Arc::from(source_id),
            uri: uri.to_string(),
            input,
            stream_index,
            decoder,
            scaler,
            fps,
            live,
            flushed: false,
        })
    }
}

/// Pull side of a decoder: frames come out of `receive`, packets go in via `feed`.
trait PacketDecoder {
    fn receive(&mut self) -> Result<Option<Frame>>;

    /// Send the next packet, or the end-of-stream marker once input runs out.
    /// Returns `false` when there is nothing left to send.
    fn feed(&mut self) -> Result<bool>;
}

/// Feed packets until the decoder yields a frame. Codecs that reorder frames
/// need several packets before the first one comes out.
fn decode_next<D: PacketDecoder>(decoder: &mut D) -> Result<Frame, SourceError> {
    loop {
        if let Some(frame) = decoder.receive()? {
            return Ok(frame);
        }
        if !decoder.feed()? {
            return Err(SourceError::EndOfStream);
        }
    }
}

impl PacketDecoder for FfmpegSource {
    fn receive(&mut self) -> Result<Option<Frame>> {
        let mut decoded = ffmpeg::frame::Video::empty();
        if self.decoder.receive_frame(&mut decoded).is_err() {
            return Ok(None);
        }
        let mut rgb_frame = ffmpeg::frame::Video::empty();
        self.scaler
            .run(&decoded, &mut rgb_frame)
            .context("scale frame to RGB")?;
        let (pixels, width, height) = frame_to_pixels(&rgb_frame)?;
        Frame::new(self.source_id.clone(), width, height, pixels, crate::now_secs()).map(Some)
    }

    fn feed(&mut self) -> Result<bool> {
        if self.flushed {
            return Ok(false);
        }
        let stream_index = self.stream_index;
        let packet = self
            .input
            .packets()
            .find(|(stream, _)| stream.index() == stream_index)
            .map(|(_, packet)| packet);
        match packet {
            Some(packet) => self
                .decoder
                .send_packet(&packet)
                .context("send packet to ffmpeg decoder")?,
            None => {
                self.decoder.send_eof().context("flush ffmpeg decoder")?;
                self.flushed = true;
            }
        }
        Ok(true)
    }
}

impl FrameSource for FfmpegSource {
    fn read(&mut self) -> Result<Frame, SourceError> {
        decode_next(self)
    }

    fn native_fps(&self) -> Option<f64> {
        self.fps
    }

    fn rewind(&mut self) -> Result<()> {
        if self.live {
            return Err(anyhow!("cannot rewind live source {}", self.uri));
        }
        self.input.seek(0, ..).context("seek to start")?;
        self.decoder.flush();
        self.flushed = false;
        Ok(())
    }

    fn is_live(&self) -> bool {
        self.live
    }

    fn describe(&self) -> String {
        self.uri.clone()
    }
}

fn frame_to_pixels(frame: &ffmpeg::frame::Video) -> Result<(Vec<u8>, u32, u32)> {
    let width = frame.width();
    let height = frame.height();
    let row_bytes = (width as usize) * 3;
    let stride = frame.stride(0);
    let data = frame.data(0);

    if stride == row_bytes {
        return Ok((data[..row_bytes * height as usize].to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .context("ffmpeg frame row is out of bounds")?,
        );
    }

    Ok((pixels, width, height))
}

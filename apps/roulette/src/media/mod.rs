//! Seams to the capture device and the video codec.
//!
//! The session core only moves opaque encoded bytes; everything that touches
//! pixels lives behind these traits.

pub mod pattern;
pub mod raw;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::session::SessionError;

pub use crate::session::keyframe::KeyframeFlag;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("frame too short: {0} bytes")]
    Truncated(usize),
    #[error("bad frame header")]
    BadHeader,
    #[error("frame size {actual} does not match {width}x{height}")]
    SizeMismatch {
        width: u16,
        height: u16,
        actual: usize,
    },
    #[error("delta frame without a usable reference")]
    MissingReference,
}

/// An uncompressed grayscale picture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub width: u16,
    pub height: u16,
    pub luma: Vec<u8>,
}

impl RawFrame {
    pub fn blank(width: u16, height: u16) -> Self {
        Self {
            width,
            height,
            luma: vec![0; width as usize * height as usize],
        }
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

pub type DecodedFrame = RawFrame;

pub trait VideoDecoder: Send {
    fn decode(&mut self, data: &[u8]) -> Result<DecodedFrame, CodecError>;
}

pub trait VideoEncoder: Send {
    fn encode(
        &mut self,
        raw: &RawFrame,
        pts: Duration,
        force_keyframe: bool,
    ) -> Result<Bytes, CodecError>;
}

/// Destination for encoded frames; implemented by the session's outbound
/// track.
#[async_trait]
pub trait VideoSink: Send + Sync {
    async fn write_frame(&self, data: Bytes, duration: Duration) -> Result<(), SessionError>;
}

pub type VideoSender = Arc<dyn VideoSink>;

pub trait CapturePipeline: Send + Sync {
    /// Forces the next encoded frame to be a keyframe.
    fn request_keyframe(&self);
    /// Routes encoded frames to `output`, or stops sending with `None`.
    fn set_output(&self, output: Option<VideoSender>);
}

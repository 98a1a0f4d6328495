use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};

use super::{CodecError, DecodedFrame, RawFrame, VideoDecoder, VideoEncoder};

const MAGIC: u8 = b'R';
const FLAG_KEY: u8 = 0x01;
const HEADER_LEN: usize = 6;

/// Uncompressed luma codec. Keyframes carry the picture as is; delta frames
/// carry the XOR against the previous picture, so a lost frame breaks the
/// chain until the next keyframe.
#[derive(Debug)]
pub struct RawLumaEncoder {
    reference: Option<RawFrame>,
    keyframe_interval: u32,
    since_keyframe: u32,
}

impl RawLumaEncoder {
    pub fn new(keyframe_interval: u32) -> Self {
        Self {
            reference: None,
            keyframe_interval: keyframe_interval.max(1),
            since_keyframe: 0,
        }
    }
}

impl Default for RawLumaEncoder {
    fn default() -> Self {
        Self::new(120)
    }
}

fn header(buf: &mut BytesMut, key: bool, width: u16, height: u16) {
    buf.put_u8(MAGIC);
    buf.put_u8(if key { FLAG_KEY } else { 0 });
    buf.put_u16(width);
    buf.put_u16(height);
}

impl VideoEncoder for RawLumaEncoder {
    fn encode(
        &mut self,
        raw: &RawFrame,
        _pts: Duration,
        force_keyframe: bool,
    ) -> Result<Bytes, CodecError> {
        if raw.luma.len() != raw.pixel_count() {
            return Err(CodecError::SizeMismatch {
                width: raw.width,
                height: raw.height,
                actual: raw.luma.len(),
            });
        }
        let reference = self
            .reference
            .as_ref()
            .filter(|r| r.width == raw.width && r.height == raw.height);
        let key = force_keyframe
            || reference.is_none()
            || self.since_keyframe + 1 >= self.keyframe_interval;

        let mut buf = BytesMut::with_capacity(HEADER_LEN + raw.luma.len());
        header(&mut buf, key, raw.width, raw.height);
        match reference {
            Some(reference) if !key => {
                buf.extend(raw.luma.iter().zip(&reference.luma).map(|(a, b)| a ^ b));
                self.since_keyframe += 1;
            }
            _ => {
                buf.extend_from_slice(&raw.luma);
                self.since_keyframe = 0;
            }
        }
        self.reference = Some(raw.clone());
        Ok(buf.freeze())
    }
}

#[derive(Debug, Default)]
pub struct RawLumaDecoder {
    reference: Option<RawFrame>,
}

impl RawLumaDecoder {
    pub fn new() -> Self {
        Self::default()
    }
}

impl VideoDecoder for RawLumaDecoder {
    fn decode(&mut self, data: &[u8]) -> Result<DecodedFrame, CodecError> {
        if data.len() < HEADER_LEN {
            return Err(CodecError::Truncated(data.len()));
        }
        if data[0] != MAGIC {
            return Err(CodecError::BadHeader);
        }
        let key = data[1] & FLAG_KEY != 0;
        let width = u16::from_be_bytes([data[2], data[3]]);
        let height = u16::from_be_bytes([data[4], data[5]]);
        let body = &data[HEADER_LEN..];
        if body.len() != width as usize * height as usize {
            self.reference = None;
            return Err(CodecError::SizeMismatch {
                width,
                height,
                actual: body.len(),
            });
        }

        let frame = if key {
            RawFrame {
                width,
                height,
                luma: body.to_vec(),
            }
        } else {
            let reference = self
                .reference
                .as_ref()
                .filter(|r| r.width == width && r.height == height)
                .ok_or(CodecError::MissingReference)?;
            RawFrame {
                width,
                height,
                luma: body.iter().zip(&reference.luma).map(|(a, b)| a ^ b).collect(),
            }
        };
        self.reference = Some(frame.clone());
        Ok(frame)
    }
}

//! Multiplexing primitives for the tunnel protocol

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Stream identifier
pub type StreamId = u32;

/// Frame types for multiplexing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum FrameType {
    /// Opens a stream; the payload is the stream header
    Open = 0,
    Data = 1,
    /// Graceful half-close of the sender's direction
    Close = 2,
    /// Abortive close of both directions
    Reset = 3,
    /// Grants the peer more send window; the payload is a big-endian u32
    WindowUpdate = 4,
}

impl TryFrom<u8> for FrameType {
    type Error = MuxError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FrameType::Open),
            1 => Ok(FrameType::Data),
            2 => Ok(FrameType::Close),
            3 => Ok(FrameType::Reset),
            4 => Ok(FrameType::WindowUpdate),
            _ => Err(MuxError::InvalidFrameType(value)),
        }
    }
}

/// Multiplexed frame
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub stream_id: StreamId,
    pub frame_type: FrameType,
    pub payload: Bytes,
}

impl Frame {
    /// Frame header size: stream_id (4) + frame_type (1) + length (4) = 9 bytes
    pub const HEADER_SIZE: usize = 9;

    pub fn new(stream_id: StreamId, frame_type: FrameType, payload: Bytes) -> Self {
        Self {
            stream_id,
            frame_type,
            payload,
        }
    }

    pub fn open(stream_id: StreamId, header: Bytes) -> Self {
        Self::new(stream_id, FrameType::Open, header)
    }

    pub fn data(stream_id: StreamId, payload: Bytes) -> Self {
        Self::new(stream_id, FrameType::Data, payload)
    }

    pub fn close(stream_id: StreamId) -> Self {
        Self::new(stream_id, FrameType::Close, Bytes::new())
    }

    pub fn reset(stream_id: StreamId) -> Self {
        Self::new(stream_id, FrameType::Reset, Bytes::new())
    }

    pub fn window_update(stream_id: StreamId, credit: u32) -> Self {
        Self::new(
            stream_id,
            FrameType::WindowUpdate,
            Bytes::copy_from_slice(&credit.to_be_bytes()),
        )
    }

    /// Credit carried by a `WindowUpdate` frame
    pub fn window_credit(&self) -> Option<u32> {
        if self.frame_type != FrameType::WindowUpdate {
            return None;
        }
        let bytes: [u8; 4] = self.payload.as_ref().try_into().ok()?;
        Some(u32::from_be_bytes(bytes))
    }

    /// Encode frame to bytes
    pub fn encode(&self) -> Result<Bytes, MuxError> {
        let mut buf = BytesMut::with_capacity(Self::HEADER_SIZE + self.payload.len());
        FrameCodec.encode(self.clone(), &mut buf)?;
        Ok(buf.freeze())
    }

    /// Decode a complete frame from bytes
    pub fn decode(buf: Bytes) -> Result<Self, MuxError> {
        let mut buf = BytesMut::from(&buf[..]);
        FrameCodec.decode(&mut buf)?.ok_or(MuxError::IncompleteFrame)
    }
}

/// Multiplexer errors
#[derive(Debug, Error)]
pub enum MuxError {
    #[error("Invalid frame type: {0}")]
    InvalidFrameType(u8),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Incomplete frame")]
    IncompleteFrame,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Codec for [`Frame`]s over a byte stream
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = MuxError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, MuxError> {
        if src.len() < Frame::HEADER_SIZE {
            return Ok(None);
        }

        let length = u32::from_be_bytes([src[5], src[6], src[7], src[8]]);
        if length > crate::MAX_FRAME_SIZE {
            return Err(MuxError::FrameTooLarge(length as usize));
        }

        let total = Frame::HEADER_SIZE + length as usize;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let stream_id = src.get_u32();
        let frame_type = FrameType::try_from(src.get_u8())?;
        let _ = src.get_u32();
        let payload = src.split_to(length as usize).freeze();

        Ok(Some(Frame {
            stream_id,
            frame_type,
            payload,
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = MuxError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), MuxError> {
        let payload_len = frame.payload.len();
        if payload_len > crate::MAX_FRAME_SIZE as usize {
            return Err(MuxError::FrameTooLarge(payload_len));
        }

        dst.reserve(Frame::HEADER_SIZE + payload_len);
        dst.put_u32(frame.stream_id);
        dst.put_u8(frame.frame_type as u8);
        dst.put_u32(payload_len as u32);
        dst.put(frame.payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_encode_decode() {
        let payload = Bytes::from("hello world");
        let frame = Frame::data(42, payload.clone());

        let encoded = frame.encode().unwrap();
        let decoded = Frame::decode(encoded).unwrap();

        assert_eq!(decoded.stream_id, 42);
        assert_eq!(decoded.frame_type, FrameType::Data);
        assert_eq!(decoded.payload, payload);
    }

    #[test]
    fn test_decoder_waits_for_full_frame() {
        let encoded = Frame::open(7, Bytes::from_static(b"{}")).encode().unwrap();

        let mut buf = BytesMut::from(&encoded[..5]);
        assert!(FrameCodec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&encoded[5..]);
        let frame = FrameCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.frame_type, FrameType::Open);
        assert_eq!(frame.payload, Bytes::from_static(b"{}"));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decoder_handles_back_to_back_frames() {
        let mut buf = BytesMut::new();
        FrameCodec
            .encode(Frame::data(1, Bytes::from_static(b"a")), &mut buf)
            .unwrap();
        FrameCodec.encode(Frame::close(1), &mut buf).unwrap();

        let first = FrameCodec.decode(&mut buf).unwrap().unwrap();
        let second = FrameCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.frame_type, FrameType::Data);
        assert_eq!(second.frame_type, FrameType::Close);
        assert!(FrameCodec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_window_update_carries_credit() {
        let encoded = Frame::window_update(5, 128 * 1024).encode().unwrap();
        let decoded = Frame::decode(encoded).unwrap();
        assert_eq!(decoded.frame_type, FrameType::WindowUpdate);
        assert_eq!(decoded.window_credit(), Some(128 * 1024));

        let short = Frame::new(5, FrameType::WindowUpdate, Bytes::from_static(b"\x01"));
        assert_eq!(short.window_credit(), None);
        assert_eq!(Frame::close(5).window_credit(), None);
    }

    #[test]
    fn test_invalid_frame_type() {
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u8(9);
        buf.put_u32(0);
        assert!(matches!(
            FrameCodec.decode(&mut buf),
            Err(MuxError::InvalidFrameType(9))
        ));
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u8(1);
        buf.put_u32(crate::MAX_FRAME_SIZE + 1);
        assert!(matches!(
            FrameCodec.decode(&mut buf),
            Err(MuxError::FrameTooLarge(_))
        ));
    }
}

//! Multiplexing primitives for the upgraded control connection

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Stream identifier
pub type StreamId = u32;

/// Frame types for multiplexing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Opens a new logical stream
    Open = 0,
    /// Carries stream payload
    Data = 1,
    /// Sender will not write to this stream again
    Close = 2,
    /// Sender is tearing down the whole session
    GoAway = 3,
    /// Grants the peer more send credit on a stream
    WindowUpdate = 4,
}

impl TryFrom<u8> for FrameType {
    type Error = MuxError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FrameType::Open),
            1 => Ok(FrameType::Data),
            2 => Ok(FrameType::Close),
            3 => Ok(FrameType::GoAway),
            4 => Ok(FrameType::WindowUpdate),
            _ => Err(MuxError::InvalidFrameType(value)),
        }
    }
}

/// Multiplexed frame
#[derive(Debug, Clone, PartialEq, Eq)]
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

    pub fn open(stream_id: StreamId) -> Self {
        Self::new(stream_id, FrameType::Open, Bytes::new())
    }

    pub fn data(stream_id: StreamId, payload: Bytes) -> Self {
        Self::new(stream_id, FrameType::Data, payload)
    }

    pub fn close(stream_id: StreamId) -> Self {
        Self::new(stream_id, FrameType::Close, Bytes::new())
    }

    pub fn go_away() -> Self {
        Self::new(0, FrameType::GoAway, Bytes::new())
    }

    /// Allow the peer to send `credit` more payload bytes on `stream_id`
    pub fn window_update(stream_id: StreamId, credit: u32) -> Self {
        Self::new(
            stream_id,
            FrameType::WindowUpdate,
            Bytes::copy_from_slice(&credit.to_be_bytes()),
        )
    }

    /// Credit carried by a window update frame
    pub fn credit(&self) -> Option<u32> {
        if self.frame_type != FrameType::WindowUpdate {
            return None;
        }
        let bytes: [u8; 4] = self.payload.as_ref().try_into().ok()?;
        Some(u32::from_be_bytes(bytes))
    }

    /// Append the encoded frame to `dst`
    pub fn encode_into(&self, dst: &mut BytesMut) -> Result<(), MuxError> {
        let payload_len = self.payload.len();
        if payload_len > crate::MAX_FRAME_SIZE as usize {
            return Err(MuxError::FrameTooLarge(payload_len));
        }

        dst.reserve(Self::HEADER_SIZE + payload_len);
        dst.put_u32(self.stream_id);
        dst.put_u8(self.frame_type as u8);
        dst.put_u32(payload_len as u32);
        dst.put_slice(&self.payload);

        Ok(())
    }

    /// Decode one frame from the front of `src`.
    ///
    /// Returns `Ok(None)` and leaves `src` untouched when more bytes are needed.
    pub fn decode_from(src: &mut BytesMut) -> Result<Option<Self>, MuxError> {
        if src.len() < Self::HEADER_SIZE {
            return Ok(None);
        }

        let mut header = &src[..Self::HEADER_SIZE];
        let stream_id = header.get_u32();
        let frame_type = FrameType::try_from(header.get_u8())?;
        let length = header.get_u32();

        if length > crate::MAX_FRAME_SIZE {
            return Err(MuxError::FrameTooLarge(length as usize));
        }

        let total = Self::HEADER_SIZE + length as usize;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(Self::HEADER_SIZE);
        let payload = src.split_to(length as usize).freeze();

        Ok(Some(Self {
            stream_id,
            frame_type,
            payload,
        }))
    }
}

/// Multiplexer errors
#[derive(Debug, Error)]
pub enum MuxError {
    #[error("Invalid frame type: {0}")]
    InvalidFrameType(u8),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Stream already exists: {0}")]
    StreamAlreadyExists(StreamId),

    #[error("Session closed")]
    SessionClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

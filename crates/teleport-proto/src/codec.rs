//! `tokio_util` codec for multiplexer frames

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};
use tracing::debug;

use crate::mux::{Frame, MuxError};

/// Frames multiplexer traffic on a byte stream
#[derive(Debug, Default, Clone, Copy)]
pub struct MuxCodec;

impl Decoder for MuxCodec {
    type Item = Frame;
    type Error = MuxError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, MuxError> {
        Frame::decode_from(src).inspect_err(|e| {
            debug!(buffered = src.len(), "Rejecting multiplexer frame: {}", e);
        })
    }
}

impl Encoder<Frame> for MuxCodec {
    type Error = MuxError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), MuxError> {
        frame.encode_into(dst)
    }
}

//! Teleport protocol definitions
//!
//! This crate defines the control handshake exchanged before a connection is
//! upgraded, and the framing used by the stream multiplexer afterwards.

pub mod codec;
pub mod handshake;
pub mod mux;

pub use codec::MuxCodec;
pub use handshake::{
    read_request, read_response, ControlRequest, ControlResponse, HandshakeError,
    HEADER_CLIENT_PUBLIC_KEY, HEADER_PASSWORD, HEADER_PUBLIC_HOST, HEADER_SERVER_PUBLIC_KEY,
    HEADER_USERNAME,
};
pub use mux::{Frame, FrameType, MuxError, StreamId};

/// Maximum multiplexer frame payload (1MB)
pub const MAX_FRAME_SIZE: u32 = 1024 * 1024;

/// Maximum size of a handshake request or response head (16KB)
pub const MAX_HEAD_SIZE: usize = 16 * 1024;

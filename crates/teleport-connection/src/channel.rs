//! Logical channel handle

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use teleport_proto::StreamId;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};

/// One logical stream of a [`crate::MuxSession`]
///
/// Reads return EOF once the peer closes its write side. Shutting down the write side
/// sends a close frame for this stream.
#[derive(Debug)]
pub struct MuxChannel {
    stream_id: StreamId,
    io: DuplexStream,
}

impl MuxChannel {
    pub(crate) fn new(stream_id: StreamId, io: DuplexStream) -> Self {
        Self { stream_id, io }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }
}

impl AsyncRead for MuxChannel {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for MuxChannel {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

//! Per-host listeners and the connections they yield

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;

use crate::registry::RouteGuard;

trait PublicStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> PublicStream for T {}

/// A routed public connection
///
/// The bytes the router consumed while looking for the `Host` header are replayed
/// before anything else is read from the socket.
pub struct PublicConnection {
    stream: Box<dyn PublicStream>,
    peer_addr: Option<SocketAddr>,
    prefix: Bytes,
}

impl PublicConnection {
    pub fn new<S>(stream: S, peer_addr: Option<SocketAddr>, prefix: Bytes) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self {
            stream: Box::new(stream),
            peer_addr,
            prefix,
        }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }
}

impl std::fmt::Debug for PublicConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublicConnection")
            .field("peer_addr", &self.peer_addr)
            .field("buffered", &self.prefix.len())
            .finish()
    }
}

impl AsyncRead for PublicConnection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.prefix.is_empty() {
            let n = buf.remaining().min(self.prefix.len());
            buf.put_slice(&self.prefix[..n]);
            self.prefix.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for PublicConnection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

/// Receives the public connections routed to one virtual host
pub struct PublicListener {
    host: String,
    incoming: mpsc::Receiver<PublicConnection>,
    route: Option<RouteGuard>,
}

impl PublicListener {
    /// Listener fed directly through the returned sender, with no registry behind it.
    pub fn channel(
        host: impl Into<String>,
        backlog: usize,
    ) -> (mpsc::Sender<PublicConnection>, Self) {
        let (tx, rx) = mpsc::channel(backlog);
        let listener = Self {
            host: host.into(),
            incoming: rx,
            route: None,
        };
        (tx, listener)
    }

    pub(crate) fn registered(
        host: String,
        incoming: mpsc::Receiver<PublicConnection>,
        route: RouteGuard,
    ) -> Self {
        Self {
            host,
            incoming,
            route: Some(route),
        }
    }

    /// Host this listener was registered for
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Next routed connection, or `None` once the listener is closed.
    pub async fn accept(&mut self) -> Option<PublicConnection> {
        self.incoming.recv().await
    }

    /// Unregister the host and refuse further connections.
    ///
    /// Connections already queued can still be drained with [`PublicListener::accept`].
    pub fn close(&mut self) {
        self.route.take();
        self.incoming.close();
    }
}

impl std::fmt::Debug for PublicListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublicListener")
            .field("host", &self.host)
            .field("registered", &self.route.is_some())
            .finish()
    }
}

//! Host-header front door

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use teleport_proto::handshake::find_head_end;
use teleport_proto::{ControlResponse, MAX_HEAD_SIZE};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::listener::PublicConnection;
use crate::registry::{DispatchError, RouteRegistry};

/// How long a new connection gets to send its request head
pub const DEFAULT_HEAD_TIMEOUT: Duration = Duration::from_secs(3);

const MAX_HEADERS: usize = 64;

/// What the front door learned from a request head
#[derive(Debug, PartialEq, Eq)]
enum RequestHead {
    Host(String),
    MissingHost,
    TooLarge,
}

/// Accepts TCP connections and routes each one by its `Host` header
pub struct VhostRouter {
    registry: Arc<RouteRegistry>,
    head_timeout: Duration,
}

impl VhostRouter {
    pub fn new(registry: Arc<RouteRegistry>) -> Self {
        Self {
            registry,
            head_timeout: DEFAULT_HEAD_TIMEOUT,
        }
    }

    pub fn with_head_timeout(mut self, head_timeout: Duration) -> Self {
        self.head_timeout = head_timeout;
        self
    }

    pub fn registry(&self) -> &Arc<RouteRegistry> {
        &self.registry
    }

    /// Run the accept loop until `shutdown` fires.
    pub async fn serve(
        self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> io::Result<()> {
        let router = Arc::new(self);
        info!("Front door listening on {}", listener.local_addr()?);

        loop {
            let (socket, peer_addr) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        continue;
                    }
                },
                _ = shutdown.cancelled() => {
                    info!("Front door stopped");
                    return Ok(());
                }
            };

            debug!("Accepted connection from {}", peer_addr);
            let router = router.clone();
            tokio::spawn(async move {
                if let Err(e) = router.route(socket, Some(peer_addr)).await {
                    debug!("Failed to route connection from {}: {}", peer_addr, e);
                }
            });
        }
    }

    /// Read the request head from `socket` and hand the connection to its listener.
    ///
    /// Unroutable requests are answered here: `400` without a `Host` header, `431` when
    /// the head outgrows the buffer, `404` for unknown hosts, `503` when the host's
    /// backlog is full. Sockets that stay silent past the head timeout are dropped.
    pub async fn route<S>(&self, mut socket: S, peer_addr: Option<SocketAddr>) -> io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut buf = BytesMut::with_capacity(4096);
        let head = tokio::time::timeout(self.head_timeout, read_host(&mut socket, &mut buf)).await;
        let host = match head {
            Ok(result) => match result? {
                RequestHead::Host(host) => host,
                RequestHead::MissingHost => {
                    warn!(?peer_addr, "No Host header found in request");
                    return respond(&mut socket, 400, "No Host header\n").await;
                }
                RequestHead::TooLarge => {
                    warn!(?peer_addr, "Request head exceeds {} bytes", MAX_HEAD_SIZE);
                    return respond(&mut socket, 431, "Request header too large\n").await;
                }
            },
            Err(_) => {
                debug!(?peer_addr, "Timed out waiting for request head");
                return Ok(());
            }
        };

        let conn = PublicConnection::new(socket, peer_addr, buf.freeze());
        match self.registry.dispatch(&host, conn) {
            Ok(()) => {
                debug!(%host, "Routed connection");
                Ok(())
            }
            Err(DispatchError::NotFound(mut conn)) => {
                warn!(%host, "No route found for host");
                respond(&mut conn, 404, "Route not found\n").await
            }
            Err(DispatchError::Busy(mut conn)) => {
                warn!(%host, "Listener backlog full");
                respond(&mut conn, 503, "Tunnel busy\n").await
            }
        }
    }
}

/// Read until the request head is complete and extract its `Host`.
async fn read_host<S>(socket: &mut S, buf: &mut BytesMut) -> io::Result<RequestHead>
where
    S: AsyncRead + Unpin,
{
    let mut scanned = 0;
    loop {
        if let Some(end) = find_head_end(buf, scanned) {
            return Ok(match parse_host(&buf[..end]) {
                Some(host) => RequestHead::Host(host),
                None => RequestHead::MissingHost,
            });
        }
        if buf.len() >= MAX_HEAD_SIZE {
            return Ok(RequestHead::TooLarge);
        }
        scanned = buf.len().saturating_sub(3);
        if socket.read_buf(buf).await? == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
    }
}

fn parse_host(head: &[u8]) -> Option<String> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut request = httparse::Request::new(&mut headers);
    match request.parse(head) {
        Ok(httparse::Status::Complete(_)) => {}
        _ => return None,
    }

    request
        .headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("host"))
        .and_then(|h| std::str::from_utf8(h.value).ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

async fn respond<S>(socket: &mut S, status: u16, message: &str) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    socket
        .write_all(&ControlResponse::error(status, message).encode())
        .await?;
    socket.shutdown().await
}

//! Multiplexed sessions over an upgraded control connection
//!
//! After the control handshake the TCP connection stops carrying HTTP and becomes the
//! transport for many logical channels. The rest of the system only sees the
//! [`MultiplexedSession`] capability; [`MuxSession`] is the implementation shipped here.

pub mod channel;
pub mod session;

pub use channel::MuxChannel;
pub use session::{MuxSession, Role};
pub use teleport_proto::MuxError;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

/// One transport carrying many independent byte channels
#[async_trait]
pub trait MultiplexedSession: Send + Sync {
    /// A logical bidirectional byte stream
    type Channel: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Open a new channel towards the peer.
    async fn open(&self) -> Result<Self::Channel, MuxError>;

    /// Wait for the peer to open a channel.
    ///
    /// Returns `Ok(None)` once the session is closed.
    async fn accept(&self) -> Result<Option<Self::Channel>, MuxError>;

    /// Resolve when the session terminates for any reason.
    async fn wait(&self);

    /// Tear the session down. Pending `accept` calls return `None`.
    async fn close(&self);

    fn is_closed(&self) -> bool;
}
